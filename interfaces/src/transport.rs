//! Frame Transport Boundary
//!
//! The engine only ever sees opaque Ethernet frames. Whatever moves them
//! (a packet socket, a ZeroMQ tunnel, an in-process loopback) implements
//! [`FrameTransport`].

use crate::InterfaceError;
use bytes::Bytes;
use common::MacAddress;
use std::sync::Arc;
use std::time::Duration;

/// Send/receive of whole frames
///
/// Implementations must allow `send_frame` and `recv_frame` to be called
/// concurrently from different threads.
pub trait FrameTransport: Send + Sync {
    /// Hand one frame to the wire
    fn send_frame(&self, frame: &[u8]) -> Result<(), InterfaceError>;

    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `Ok(None)` when the timeout elapses without a frame and
    /// `Err(InterfaceError::Closed)` once the peer is gone for good.
    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, InterfaceError>;

    /// Hardware address frames are sent from
    fn local_mac(&self) -> MacAddress;
}

impl<T: FrameTransport + ?Sized> FrameTransport for Arc<T> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), InterfaceError> {
        (**self).send_frame(frame)
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, InterfaceError> {
        (**self).recv_frame(timeout)
    }

    fn local_mac(&self) -> MacAddress {
        (**self).local_mac()
    }
}

impl<T: FrameTransport + ?Sized> FrameTransport for Box<T> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), InterfaceError> {
        (**self).send_frame(frame)
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, InterfaceError> {
        (**self).recv_frame(timeout)
    }

    fn local_mac(&self) -> MacAddress {
        (**self).local_mac()
    }
}
