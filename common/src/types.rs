//! Common Types for the USRP2 Host
//!
//! Defines fundamental identifiers and results shared by the codec and engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of distinct reply identifiers (8-bit field)
pub const NUM_REPLY_IDS: usize = 256;

/// Number of sample channels (5-bit field)
pub const NUM_CHANNELS: usize = 32;

/// Reply identifier carried in a command and echoed in its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplyId(pub u8);

impl ReplyId {
    /// Get the reply id as a table index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid:{}", self.0)
    }
}

/// Sample channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    /// Maximum valid channel number
    pub const MAX: u8 = (NUM_CHANNELS - 1) as u8;

    /// Create a new channel id with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the channel number
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Get the channel as a table index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("channel {} out of range (0-{})", value, Self::MAX))
    }
}

impl From<ChannelId> for u8 {
    fn from(channel: ChannelId) -> Self {
        channel.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// MAC address parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacParseError {
    #[error("Expected 6 colon-separated octets, got {0}")]
    WrongLength(usize),

    #[error("Invalid octet: {0:?}")]
    InvalidOctet(String),
}

/// 6-byte Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast address
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True for group (multicast/broadcast) addresses
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Parse colon-hex text, e.g. "00:50:c2:85:3f:ff"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(MacParseError::WrongLength(parts.len()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(MacParseError::InvalidOctet(part.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::InvalidOctet(part.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Decomposition of a tune request into analog and digital parts
///
/// `baseband_freq + (spectrum_inverted ? -dxc_freq : dxc_freq) + residual_freq`
/// equals the requested frequency.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TuneResult {
    /// RF frequency that corresponds to DC in the IF
    pub baseband_freq: f64,
    /// Frequency programmed into the DDC/DUC
    pub dxc_freq: f64,
    /// Residual frequency (quantization error, typically sub-Hz)
    pub residual_freq: f64,
    /// Is the spectrum inverted?
    pub spectrum_inverted: bool,
}

impl TuneResult {
    /// Signed digital shift as actually applied
    pub fn effective_dxc(&self) -> f64 {
        if self.spectrum_inverted {
            -self.dxc_freq
        } else {
            self.dxc_freq
        }
    }

    /// Frequency this result actually tunes to
    pub fn tuned_freq(&self) -> f64 {
        self.baseband_freq + self.effective_dxc() + self.residual_freq
    }
}
