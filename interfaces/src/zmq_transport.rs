//! ZeroMQ Frame Tunnel
//!
//! Carries raw device frames over a PUSH/PULL socket pair so the engine can
//! drive a remote device gateway or an emulator running in another process.

use crate::packet::MAX_FRAME_LEN;
use crate::transport::FrameTransport;
use crate::InterfaceError;
use bytes::Bytes;
use common::MacAddress;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use zmq::{Context, Socket};

/// Default ZMQ ports
pub const DEFAULT_TX_PORT: u16 = 2000;
pub const DEFAULT_RX_PORT: u16 = 2001;

/// Default host hardware address (locally administered)
pub const DEFAULT_HOST_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// ZMQ frame tunnel configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ZmqFrameConfig {
    /// Outgoing frame endpoint
    pub tx_address: String,
    /// Incoming frame endpoint
    pub rx_address: String,
    /// Bind (rather than connect) the outgoing socket
    pub tx_bind: bool,
    /// Bind (rather than connect) the incoming socket
    pub rx_bind: bool,
    /// Address placed in the source field of outgoing frames
    pub local_mac: MacAddress,
    /// High water mark for queued frames
    pub hwm: i32,
    /// Send timeout in milliseconds
    pub send_timeout_ms: i32,
}

impl Default for ZmqFrameConfig {
    fn default() -> Self {
        Self {
            tx_address: format!("tcp://*:{}", DEFAULT_TX_PORT),
            rx_address: format!("tcp://localhost:{}", DEFAULT_RX_PORT),
            tx_bind: true,
            rx_bind: false,
            local_mac: DEFAULT_HOST_MAC,
            hwm: 10_000,
            send_timeout_ms: 100,
        }
    }
}

impl ZmqFrameConfig {
    /// Parse device arguments
    /// Format: "key1=value1,key2=value2,..."
    /// Keys: tx_port, rx_port, tx_bind, rx_bind, mac, hwm, send_timeout_ms
    pub fn from_device_args(args: &str) -> Result<Self, InterfaceError> {
        let mut config = Self::default();

        for pair in args.split(',') {
            let parts: Vec<&str> = pair.trim().splitn(2, '=').collect();
            if parts.len() != 2 {
                continue;
            }

            let key = parts[0].trim();
            let value = parts[1].trim();
            let invalid = |what: &str| InterfaceError::InvalidConfig(format!("Invalid {}: {}", what, value));

            match key {
                "tx_port" => config.tx_address = value.to_string(),
                "rx_port" => config.rx_address = value.to_string(),
                "tx_bind" => config.tx_bind = value.parse().map_err(|_| invalid("tx_bind"))?,
                "rx_bind" => config.rx_bind = value.parse().map_err(|_| invalid("rx_bind"))?,
                "mac" => config.local_mac = value.parse().map_err(|_| invalid("mac"))?,
                "hwm" => config.hwm = value.parse().map_err(|_| invalid("hwm"))?,
                "send_timeout_ms" => {
                    config.send_timeout_ms = value.parse().map_err(|_| invalid("send_timeout_ms"))?
                }
                _ => debug!("Ignoring unknown device argument: {}", key),
            }
        }

        Ok(config)
    }

    /// Configuration for the peer end of this tunnel
    ///
    /// Endpoints are swapped and bind/connect roles flipped; a wildcard bind
    /// address becomes `localhost` on the connecting side.
    #[cfg(test)]
    fn mirrored(&self, local_mac: MacAddress) -> Self {
        let flip = |address: &str, was_bound: bool| {
            if was_bound {
                address.replace("*", "localhost")
            } else {
                address.replace("localhost", "*")
            }
        };

        Self {
            tx_address: flip(&self.rx_address, self.rx_bind),
            rx_address: flip(&self.tx_address, self.tx_bind),
            tx_bind: !self.rx_bind,
            rx_bind: !self.tx_bind,
            local_mac,
            hwm: self.hwm,
            send_timeout_ms: self.send_timeout_ms,
        }
    }
}

/// Frame transport over a ZMQ PUSH/PULL pair
pub struct ZmqFrameTransport {
    config: ZmqFrameConfig,
    _context: Context,
    tx_socket: Mutex<Socket>,
    rx_socket: Mutex<Socket>,
}

impl ZmqFrameTransport {
    /// Open the tunnel with a private context
    pub fn new(config: ZmqFrameConfig) -> Result<Self, InterfaceError> {
        Self::with_context(Context::new(), config)
    }

    /// Open the tunnel on a shared context (required for `inproc://`)
    pub fn with_context(context: Context, config: ZmqFrameConfig) -> Result<Self, InterfaceError> {
        info!("Initializing ZMQ frame transport");

        let tx_socket = context.socket(zmq::PUSH)?;
        tx_socket.set_sndhwm(config.hwm)?;
        tx_socket.set_sndtimeo(config.send_timeout_ms)?;
        tx_socket.set_linger(0)?;
        if config.tx_bind {
            tx_socket.bind(&config.tx_address)?;
            info!("TX socket bound to {} (PUSH)", config.tx_address);
        } else {
            tx_socket.connect(&config.tx_address)?;
            info!("TX socket connected to {} (PUSH)", config.tx_address);
        }

        let rx_socket = context.socket(zmq::PULL)?;
        rx_socket.set_rcvhwm(config.hwm)?;
        rx_socket.set_linger(0)?;
        if config.rx_bind {
            rx_socket.bind(&config.rx_address)?;
            info!("RX socket bound to {} (PULL)", config.rx_address);
        } else {
            rx_socket.connect(&config.rx_address)?;
            info!("RX socket connected to {} (PULL)", config.rx_address);
        }

        Ok(Self {
            config,
            _context: context,
            tx_socket: Mutex::new(tx_socket),
            rx_socket: Mutex::new(rx_socket),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ZmqFrameConfig {
        &self.config
    }
}

impl FrameTransport for ZmqFrameTransport {
    fn send_frame(&self, frame: &[u8]) -> Result<(), InterfaceError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(InterfaceError::FrameTooLarge(frame.len()));
        }

        let socket = self.tx_socket.lock();
        match socket.send(frame, 0) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => {
                warn!("ZMQ send timed out, no peer draining {}", self.config.tx_address);
                Err(InterfaceError::WouldBlock)
            }
            Err(zmq::Error::ETERM) => Err(InterfaceError::Closed),
            Err(e) => Err(InterfaceError::ZmqError(e)),
        }
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, InterfaceError> {
        let socket = self.rx_socket.lock();
        let timeout_ms = timeout.as_millis().min(i64::MAX as u128) as i64;

        match socket.poll(zmq::POLLIN, timeout_ms) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(zmq::Error::ETERM) => return Err(InterfaceError::Closed),
            Err(e) => return Err(InterfaceError::ZmqError(e)),
        }

        match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(zmq::Error::ETERM) => Err(InterfaceError::Closed),
            Err(e) => Err(InterfaceError::ZmqError(e)),
        }
    }

    fn local_mac(&self) -> MacAddress {
        self.config.local_mac
    }
}
