//! Device Interfaces Library
//!
//! This crate owns everything between the engine and the wire: the frame
//! codec, sample format copiers, the frame transport boundary with its
//! loopback and ZeroMQ implementations, and a device emulator.

pub mod packet;
pub mod copiers;
pub mod transport;
pub mod loopback;
pub mod zmq_transport;
pub mod emulator;

pub use transport::FrameTransport;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Send would block")]
    WouldBlock,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}
