//! Background Receive Loop
//!
//! A dedicated thread pulls frames off the transport and hands them to the
//! dispatcher until it is told to stop or the transport goes away. The stop
//! signal is the disconnection of a crossbeam channel, checked between
//! receive polls; a stop request is therefore noticed within one poll
//! interval, which the engine configuration caps.

use crate::dispatcher::Dispatcher;
use crate::EngineError;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use interfaces::{FrameTransport, InterfaceError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxLoopExit {
    /// Stop requested by the engine
    Stopped,
    /// Transport reported it is closed for good
    TransportClosed,
    /// Thread panicked
    Panicked,
}

/// Handle to the running receive thread
pub struct RxLoop {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<RxLoopExit>>,
}

impl RxLoop {
    /// Start the receive thread
    pub fn spawn(
        transport: Arc<dyn FrameTransport>,
        dispatcher: Arc<Dispatcher>,
        poll_interval: Duration,
    ) -> Result<Self, EngineError> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name("u2-rx".to_string())
            .spawn(move || run(transport.as_ref(), &dispatcher, &stop_rx, poll_interval))
            .map_err(|e| EngineError::InitializationFailed(format!("receive thread: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// True until the thread has exited
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Signal the thread and join it; returns `None` if already stopped
    pub fn stop(&mut self) -> Option<RxLoopExit> {
        self.stop_tx.take();
        let handle = self.handle.take()?;
        Some(handle.join().unwrap_or(RxLoopExit::Panicked))
    }
}

impl Drop for RxLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    transport: &dyn FrameTransport,
    dispatcher: &Dispatcher,
    stop_rx: &Receiver<()>,
    poll_interval: Duration,
) -> RxLoopExit {
    info!("Receive loop started (poll interval {:?})", poll_interval);

    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => {
                debug!("Receive loop stopping on request");
                return RxLoopExit::Stopped;
            }
        }

        match transport.recv_frame(poll_interval) {
            Ok(Some(frame)) => {
                dispatcher.dispatch(&frame);
            }
            Ok(None) => {}
            Err(InterfaceError::Closed) => {
                warn!("Transport closed, cancelling pending commands");
                dispatcher.close();
                return RxLoopExit::TransportClosed;
            }
            Err(e) => {
                error!("Receive error: {}", e);
                std::thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ReplyRegistry, WaitOutcome};
    use crate::ring::{ChannelRings, OverflowPolicy, PopOutcome, ReadMode};
    use common::ChannelId;
    use interfaces::loopback;
    use interfaces::packet::{EthHeader, Opcode, Reply};

    fn parts() -> (Arc<ReplyRegistry<Reply>>, Arc<ChannelRings>, Arc<Dispatcher>) {
        let registry = Arc::new(ReplyRegistry::new());
        let rings = Arc::new(ChannelRings::new(OverflowPolicy::DropNewest));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), rings.clone()));
        (registry, rings, dispatcher)
    }

    #[test]
    fn test_loop_routes_replies_and_stops() {
        let (registry, _rings, dispatcher) = parts();
        let (host, device) = loopback::pair(
            "02:00:00:00:00:01".parse().unwrap(),
            "00:50:c2:85:30:01".parse().unwrap(),
        );
        let mut rx = RxLoop::spawn(Arc::new(host), dispatcher, Duration::from_millis(5)).unwrap();
        assert!(rx.is_running());

        let pending = registry.allocate().unwrap();
        let eth = EthHeader::new("02:00:00:00:00:01".parse().unwrap(), device.local_mac());
        device
            .send_frame(&Reply::ack(Opcode::ConfigTx, true).encode(&eth, 0, pending.id()))
            .unwrap();
        assert_eq!(
            pending.wait(Some(Duration::from_secs(1))),
            WaitOutcome::Fulfilled(Reply::ack(Opcode::ConfigTx, true))
        );

        assert_eq!(rx.stop(), Some(RxLoopExit::Stopped));
        assert_eq!(rx.stop(), None);
    }

    #[test]
    fn test_transport_close_cancels_and_closes_rings() {
        let (registry, rings, dispatcher) = parts();
        let (host, device) = loopback::pair(
            "02:00:00:00:00:01".parse().unwrap(),
            "00:50:c2:85:30:01".parse().unwrap(),
        );
        let ch = ChannelId::new(0).unwrap();
        rings.get(ch).open(4);
        let pending = registry.allocate().unwrap();

        let mut rx = RxLoop::spawn(Arc::new(host), dispatcher, Duration::from_millis(5)).unwrap();
        drop(device);

        assert_eq!(pending.wait(Some(Duration::from_secs(2))), WaitOutcome::Cancelled);
        assert_eq!(rings.get(ch).pop(ReadMode::Timeout(Duration::from_secs(2))), PopOutcome::Closed);
        assert_eq!(rx.stop(), Some(RxLoopExit::TransportClosed));
    }

    #[test]
    fn test_stop_is_noticed_within_a_poll() {
        let (_registry, _rings, dispatcher) = parts();
        let (host, _device) = loopback::pair(
            "02:00:00:00:00:01".parse().unwrap(),
            "00:50:c2:85:30:01".parse().unwrap(),
        );
        let poll = Duration::from_millis(50);
        let mut rx = RxLoop::spawn(Arc::new(host), dispatcher, poll).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let start = std::time::Instant::now();
        assert_eq!(rx.stop(), Some(RxLoopExit::Stopped));
        assert!(start.elapsed() < poll * 10);
    }
}
