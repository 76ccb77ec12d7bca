//! Command Transmitter
//!
//! Sends a command frame under a freshly allocated reply id and blocks the
//! calling thread until the reply arrives, the wait times out, or the engine
//! shuts down. Every command in flight is counted so teardown can wait for
//! all callers to unwind.

use crate::registry::{ReplyRegistry, WaitOutcome};
use crate::EngineError;
use common::MacAddress;
use interfaces::packet::{Command, EthHeader, Reply};
use interfaces::FrameTransport;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Count of commands between send and terminal outcome
#[derive(Default)]
pub struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock() += 1;
        InFlightGuard { in_flight: self }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no command is in flight; false if `timeout` elapsed first
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.drained.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.in_flight.count.lock();
        *count -= 1;
        if *count == 0 {
            self.in_flight.drained.notify_all();
        }
    }
}

/// Builds, sends and awaits command frames
pub struct CommandTransmitter {
    transport: Arc<dyn FrameTransport>,
    registry: Arc<ReplyRegistry<Reply>>,
    in_flight: InFlight,
    device_mac: Mutex<MacAddress>,
    control_seqno: AtomicU8,
    data_seqno: AtomicU8,
    timeout: Option<Duration>,
}

impl CommandTransmitter {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        registry: Arc<ReplyRegistry<Reply>>,
        device_mac: MacAddress,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            registry,
            in_flight: InFlight::new(),
            device_mac: Mutex::new(device_mac),
            control_seqno: AtomicU8::new(0),
            data_seqno: AtomicU8::new(0),
            timeout,
        }
    }

    /// Send a command and wait for its reply with the configured timeout
    pub fn transmit(&self, command: &Command) -> Result<Reply, EngineError> {
        self.transmit_with_timeout(command, self.timeout)
    }

    /// Send a command and wait for its reply; `None` waits indefinitely
    pub fn transmit_with_timeout(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<Reply, EngineError> {
        // Declared first so it is released after the pending reply
        let _in_flight = self.in_flight.enter();
        let pending = self.registry.allocate()?;
        let opcode = command.opcode();

        let seqno = self.control_seqno.fetch_add(1, Ordering::Relaxed);
        let frame = command.encode(&self.eth(), seqno, pending.id());
        debug!("Sending {:?} on {} (seqno {})", opcode, pending.id(), seqno);
        self.transport.send_frame(&frame)?;

        match pending.wait(timeout) {
            WaitOutcome::Fulfilled(reply) => {
                if reply.opcode != opcode {
                    return Err(EngineError::ReplyMismatch {
                        sent: opcode,
                        got: reply.opcode,
                    });
                }
                if !reply.ok {
                    return Err(EngineError::DeviceRejected(opcode));
                }
                Ok(reply)
            }
            WaitOutcome::TimedOut => {
                warn!("No reply to {:?} within {:?}", opcode, timeout);
                Err(EngineError::Timeout(opcode))
            }
            WaitOutcome::Cancelled => Err(EngineError::Cancelled(opcode)),
        }
    }

    /// Send a data frame; no reply is expected
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), EngineError> {
        self.transport.send_frame(frame)?;
        Ok(())
    }

    /// Next transmit data sequence number
    pub fn next_data_seqno(&self) -> u8 {
        self.data_seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Ethernet header for frames to the device
    pub fn eth(&self) -> EthHeader {
        EthHeader::new(*self.device_mac.lock(), self.transport.local_mac())
    }

    pub fn device_mac(&self) -> MacAddress {
        *self.device_mac.lock()
    }

    pub fn set_device_mac(&self, mac: MacAddress) {
        *self.device_mac.lock() = mac;
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn registry(&self) -> &ReplyRegistry<Reply> {
        &self.registry
    }
}
