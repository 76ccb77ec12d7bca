//! In-Process Loopback Transport
//!
//! A connected pair of frame transports backed by bounded crossbeam
//! channels. Frames sent into a full queue are dropped, the way a NIC ring
//! drops under load.

use crate::packet::MAX_FRAME_LEN;
use crate::transport::FrameTransport;
use crate::InterfaceError;
use bytes::Bytes;
use common::MacAddress;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Default queue depth per direction
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// One end of a loopback link
pub struct LoopbackTransport {
    mac: MacAddress,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    dropped: AtomicU64,
}

/// Create a connected pair `(host, device)`
pub fn pair(host_mac: MacAddress, device_mac: MacAddress) -> (LoopbackTransport, LoopbackTransport) {
    pair_with_depth(host_mac, device_mac, DEFAULT_QUEUE_DEPTH)
}

/// Create a connected pair with an explicit queue depth
pub fn pair_with_depth(
    host_mac: MacAddress,
    device_mac: MacAddress,
    depth: usize,
) -> (LoopbackTransport, LoopbackTransport) {
    let (to_device, from_host) = channel::bounded(depth);
    let (to_host, from_device) = channel::bounded(depth);

    let host = LoopbackTransport {
        mac: host_mac,
        tx: to_device,
        rx: from_device,
        dropped: AtomicU64::new(0),
    };
    let device = LoopbackTransport {
        mac: device_mac,
        tx: to_host,
        rx: from_host,
        dropped: AtomicU64::new(0),
    };
    (host, device)
}

impl LoopbackTransport {
    /// Frames dropped because the peer's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameTransport for LoopbackTransport {
    fn send_frame(&self, frame: &[u8]) -> Result<(), InterfaceError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(InterfaceError::FrameTooLarge(frame.len()));
        }

        match self.tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Loopback queue full, dropped frame #{}", dropped);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(InterfaceError::Closed),
        }
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, InterfaceError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(InterfaceError::Closed),
        }
    }

    fn local_mac(&self) -> MacAddress {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macs() -> (MacAddress, MacAddress) {
        (
            "02:00:00:00:00:01".parse().unwrap(),
            "00:50:c2:85:30:01".parse().unwrap(),
        )
    }

    #[test]
    fn test_pair_delivers_both_ways() {
        let (host_mac, device_mac) = macs();
        let (host, device) = pair(host_mac, device_mac);

        host.send_frame(&[1, 2, 3]).unwrap();
        device.send_frame(&[4, 5]).unwrap();

        let at_device = device.recv_frame(Duration::from_millis(100)).unwrap().unwrap();
        let at_host = host.recv_frame(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(&at_device[..], &[1, 2, 3]);
        assert_eq!(&at_host[..], &[4, 5]);
        assert_eq!(host.local_mac(), host_mac);
    }

    #[test]
    fn test_recv_timeout_and_close() {
        let (host_mac, device_mac) = macs();
        let (host, device) = pair(host_mac, device_mac);

        assert!(host.recv_frame(Duration::from_millis(5)).unwrap().is_none());

        drop(device);
        assert!(matches!(host.recv_frame(Duration::from_millis(5)), Err(InterfaceError::Closed)));
        assert!(matches!(host.send_frame(&[0]), Err(InterfaceError::Closed)));
    }

    #[test]
    fn test_full_queue_drops() {
        let (host_mac, device_mac) = macs();
        let (host, _device) = pair_with_depth(host_mac, device_mac, 2);

        for _ in 0..5 {
            host.send_frame(&[0]).unwrap();
        }
        assert_eq!(host.dropped(), 3);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (host_mac, device_mac) = macs();
        let (host, _device) = pair(host_mac, device_mac);
        let frame = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(host.send_frame(&frame), Err(InterfaceError::FrameTooLarge(_))));
    }
}
