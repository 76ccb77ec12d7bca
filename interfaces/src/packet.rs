//! Device Frame Codec
//!
//! Every frame is an Ethernet header followed by an 8-byte transport header
//! and a payload. All multi-byte fields are big-endian.
//!
//! ```text
//! 0      6      12     14    15    16    17    18          22
//! | dst  | src  | type | kind| chan| seq | flag| timestamp | payload ...
//! ```
//!
//! Data payloads are 32-bit sample words. Control payloads carry one op
//! (`opcode, len, rid, mbz, body`) followed by an end-of-payload op.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::utils::{gain_to_q7, q7_to_gain};
use common::{ChannelId, MacAddress, ReplyId, TuneResult};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

/// Ethertype used by the device
pub const ETHERTYPE: u16 = 0xBEEF;

/// Ethernet header length
pub const ETH_HEADER_LEN: usize = 14;

/// Transport header length
pub const TRANSPORT_HEADER_LEN: usize = 8;

/// Combined header length preceding any payload
pub const HEADER_LEN: usize = ETH_HEADER_LEN + TRANSPORT_HEADER_LEN;

/// Maximum Ethernet payload
pub const MAX_PAYLOAD_LEN: usize = 1500;

/// Maximum frame length on the wire (without FCS)
pub const MAX_FRAME_LEN: usize = ETH_HEADER_LEN + MAX_PAYLOAD_LEN;

/// Maximum sample words carried by one data frame
pub const MAX_ITEMS_PER_FRAME: usize = (MAX_PAYLOAD_LEN - TRANSPORT_HEADER_LEN) / 4;

/// Control op header length
pub const OP_HEADER_LEN: usize = 4;

/// Set in the opcode of every reply
pub const REPLY_BIT: u8 = 0x80;

/// Frame decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Unexpected ethertype 0x{0:04x}")]
    BadEthertype(u16),

    #[error("Unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("Payload length {0} is not a whole number of sample words")]
    BadPayloadLength(usize),

    #[error("Control frame without an op")]
    EmptyControl,

    #[error("Bad op length {len} (available {available})")]
    BadOpLength { len: usize, available: usize },

    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Op body too short for opcode 0x{opcode:02x}: {len} bytes")]
    ShortBody { opcode: u8, len: usize },

    #[error("Invalid channel {0}")]
    InvalidChannel(u32),

    #[error("Expected a reply, got opcode 0x{0:02x}")]
    NotAReply(u8),

    #[error("Expected a command, got opcode 0x{0:02x}")]
    NotACommand(u8),
}

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    /// Sample data
    Data = 0x01,
    /// Command or reply
    Control = 0x02,
}

bitflags! {
    /// Per-frame flags in the transport header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// First frame of a burst
        const START_OF_BURST = 0x01;
        /// Last frame of a burst
        const END_OF_BURST = 0x02;
        /// Device dropped samples before this frame
        const OVERRUN = 0x04;
        /// Transmit immediately, ignore timestamp
        const SEND_NOW = 0x08;
    }
}

bitflags! {
    /// Fields present in a config command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigMask: u16 {
        const GAIN = 0x0001;
        const FREQ = 0x0002;
        const RATE = 0x0004;
        const SCALE_IQ = 0x0008;
    }
}

/// Control opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// End of payload
    Eop = 0x00,
    /// Configure the transmit path
    ConfigTx = 0x02,
    /// Configure the receive path
    ConfigRx = 0x03,
    /// Start streaming a receive channel
    StartRxStreaming = 0x04,
    /// Stop streaming a receive channel
    StopRxStreaming = 0x05,
    /// Program a new MAC address into the device EEPROM
    BurnMacAddr = 0x06,
}

impl Opcode {
    /// Opcode byte of the matching reply
    pub fn reply(self) -> u8 {
        self as u8 | REPLY_BIT
    }
}

/// Ethernet addressing of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    /// Destination address
    pub dst: MacAddress,
    /// Source address
    pub src: MacAddress,
}

impl EthHeader {
    /// Create a header addressed from `src` to `dst`
    pub fn new(dst: MacAddress, src: MacAddress) -> Self {
        Self { dst, src }
    }

    /// Header for answering a frame carrying this header
    pub fn reversed(&self) -> Self {
        Self {
            dst: self.src,
            src: self.dst,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst.0);
        buf.put_slice(&self.src.0);
        buf.put_u16(ETHERTYPE);
    }
}

/// Transport header shared by data and control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    /// Frame discriminator
    pub kind: FrameKind,
    /// Channel number (data frames)
    pub channel: u8,
    /// Per-stream sequence number
    pub seqno: u8,
    /// Frame flags
    pub flags: FrameFlags,
    /// Hardware timestamp
    pub timestamp: u32,
}

impl TransportHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.channel);
        buf.put_u8(self.seqno);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.timestamp);
    }
}

/// Decoded data frame
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    /// Ethernet addressing
    pub eth: EthHeader,
    /// Transport header; `channel` is the raw, unvalidated wire value
    pub header: TransportHeader,
    /// Sample words
    pub items: Vec<u32>,
}

/// One control op
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOp {
    /// Raw opcode byte (reply bit included)
    pub opcode: u8,
    /// Reply id
    pub rid: ReplyId,
    /// Op body following the op header
    pub body: Bytes,
}

impl ControlOp {
    /// True when this op answers a command
    pub fn is_reply(&self) -> bool {
        self.opcode & REPLY_BIT != 0
    }
}

/// Decoded control frame
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPacket {
    /// Ethernet addressing
    pub eth: EthHeader,
    /// Transport header
    pub header: TransportHeader,
    /// First op in the payload
    pub op: ControlOp,
}

/// Classification of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Control(ControlPacket),
    Data(DataPacket),
    Malformed(PacketError),
}

impl Packet {
    /// Decode a raw frame; never fails, undecodable input is `Malformed`
    pub fn decode(frame: &Bytes) -> Packet {
        match decode_frame(frame) {
            Ok(packet) => packet,
            Err(e) => Packet::Malformed(e),
        }
    }
}

fn get_mac(buf: &mut Bytes) -> MacAddress {
    let mut octets = [0u8; 6];
    buf.copy_to_slice(&mut octets);
    MacAddress(octets)
}

fn decode_frame(frame: &Bytes) -> Result<Packet, PacketError> {
    if frame.len() < HEADER_LEN {
        return Err(PacketError::TooShort(frame.len()));
    }

    let mut buf = frame.clone();
    let dst = get_mac(&mut buf);
    let src = get_mac(&mut buf);
    let ethertype = buf.get_u16();
    if ethertype != ETHERTYPE {
        return Err(PacketError::BadEthertype(ethertype));
    }
    let eth = EthHeader { dst, src };

    let kind_raw = buf.get_u8();
    let kind = FrameKind::from_u8(kind_raw).ok_or(PacketError::UnknownKind(kind_raw))?;
    let header = TransportHeader {
        kind,
        channel: buf.get_u8(),
        seqno: buf.get_u8(),
        flags: FrameFlags::from_bits_truncate(buf.get_u8()),
        timestamp: buf.get_u32(),
    };

    match kind {
        FrameKind::Data => {
            if buf.remaining() % 4 != 0 || buf.remaining() / 4 > MAX_ITEMS_PER_FRAME {
                return Err(PacketError::BadPayloadLength(buf.remaining()));
            }
            let mut items = Vec::with_capacity(buf.remaining() / 4);
            while buf.has_remaining() {
                items.push(buf.get_u32());
            }
            Ok(Packet::Data(DataPacket { eth, header, items }))
        }
        FrameKind::Control => {
            let op = decode_op(&mut buf)?;
            Ok(Packet::Control(ControlPacket { eth, header, op }))
        }
    }
}

fn decode_op(buf: &mut Bytes) -> Result<ControlOp, PacketError> {
    if buf.remaining() < OP_HEADER_LEN {
        return Err(PacketError::EmptyControl);
    }

    let opcode = buf.get_u8();
    let len = buf.get_u8() as usize;
    let rid = ReplyId(buf.get_u8());
    let _mbz = buf.get_u8();

    if opcode == Opcode::Eop as u8 {
        return Err(PacketError::EmptyControl);
    }
    if len < OP_HEADER_LEN || len - OP_HEADER_LEN > buf.remaining() {
        return Err(PacketError::BadOpLength {
            len,
            available: buf.remaining() + OP_HEADER_LEN,
        });
    }

    // Trailing end-of-payload op and Ethernet padding are ignored
    let body = buf.split_to(len - OP_HEADER_LEN);
    Ok(ControlOp { opcode, rid, body })
}

/// Encode a data frame
///
/// Callers split sample runs so that `items.len() <= MAX_ITEMS_PER_FRAME`.
pub fn encode_data_frame(
    eth: &EthHeader,
    channel: ChannelId,
    seqno: u8,
    flags: FrameFlags,
    timestamp: u32,
    items: &[u32],
) -> Bytes {
    debug_assert!(items.len() <= MAX_ITEMS_PER_FRAME);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + items.len() * 4);
    eth.put(&mut buf);
    TransportHeader {
        kind: FrameKind::Data,
        channel: channel.value(),
        seqno,
        flags,
        timestamp,
    }
    .put(&mut buf);
    for &item in items {
        buf.put_u32(item);
    }
    buf.freeze()
}

fn encode_control_frame(eth: &EthHeader, seqno: u8, rid: ReplyId, opcode: u8, body: &[u8]) -> Bytes {
    debug_assert!(body.len() + OP_HEADER_LEN <= u8::MAX as usize);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2 * OP_HEADER_LEN + body.len());
    eth.put(&mut buf);
    TransportHeader {
        kind: FrameKind::Control,
        channel: 0,
        seqno,
        flags: FrameFlags::empty(),
        timestamp: 0,
    }
    .put(&mut buf);

    buf.put_u8(opcode);
    buf.put_u8((OP_HEADER_LEN + body.len()) as u8);
    buf.put_u8(rid.0);
    buf.put_u8(0);
    buf.put_slice(body);

    // End of payload
    buf.put_u8(Opcode::Eop as u8);
    buf.put_u8(OP_HEADER_LEN as u8);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.freeze()
}

/// Settings carried by a receive or transmit config command
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RadioConfig {
    /// Gain in dB
    pub gain: Option<f64>,
    /// Center frequency in Hz
    pub freq: Option<f64>,
    /// Decimation (receive) or interpolation (transmit) factor
    pub rate: Option<u32>,
    /// I and Q scale factors
    pub scale_iq: Option<(i16, i16)>,
}

impl RadioConfig {
    fn mask(&self) -> ConfigMask {
        let mut mask = ConfigMask::empty();
        mask.set(ConfigMask::GAIN, self.gain.is_some());
        mask.set(ConfigMask::FREQ, self.freq.is_some());
        mask.set(ConfigMask::RATE, self.rate.is_some());
        mask.set(ConfigMask::SCALE_IQ, self.scale_iq.is_some());
        mask
    }

    fn put(&self, buf: &mut BytesMut) {
        let (scale_i, scale_q) = self.scale_iq.unwrap_or((0, 0));
        buf.put_u16(self.mask().bits());
        buf.put_i16(self.gain.map(gain_to_q7).unwrap_or(0));
        buf.put_f64(self.freq.unwrap_or(0.0));
        buf.put_u32(self.rate.unwrap_or(0));
        buf.put_u32(((scale_i as u16 as u32) << 16) | scale_q as u16 as u32);
    }

    const BODY_LEN: usize = 20;

    fn get(opcode: u8, body: &mut Bytes) -> Result<Self, PacketError> {
        if body.remaining() < Self::BODY_LEN {
            return Err(PacketError::ShortBody { opcode, len: body.remaining() });
        }

        let mask = ConfigMask::from_bits_truncate(body.get_u16());
        let gain = body.get_i16();
        let freq = body.get_f64();
        let rate = body.get_u32();
        let scale = body.get_u32();

        Ok(Self {
            gain: mask.contains(ConfigMask::GAIN).then(|| q7_to_gain(gain)),
            freq: mask.contains(ConfigMask::FREQ).then_some(freq),
            rate: mask.contains(ConfigMask::RATE).then_some(rate),
            scale_iq: mask
                .contains(ConfigMask::SCALE_IQ)
                .then_some(((scale >> 16) as u16 as i16, scale as u16 as i16)),
        })
    }
}

/// Host-to-device commands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ConfigRx(RadioConfig),
    ConfigTx(RadioConfig),
    StartRxStreaming { channel: ChannelId, items_per_frame: u32 },
    StopRxStreaming { channel: ChannelId },
    BurnMacAddr(MacAddress),
}

impl Command {
    /// Opcode of this command
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::ConfigRx(_) => Opcode::ConfigRx,
            Command::ConfigTx(_) => Opcode::ConfigTx,
            Command::StartRxStreaming { .. } => Opcode::StartRxStreaming,
            Command::StopRxStreaming { .. } => Opcode::StopRxStreaming,
            Command::BurnMacAddr(_) => Opcode::BurnMacAddr,
        }
    }

    fn body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RadioConfig::BODY_LEN);
        match self {
            Command::ConfigRx(config) | Command::ConfigTx(config) => config.put(&mut buf),
            Command::StartRxStreaming { channel, items_per_frame } => {
                buf.put_u32(channel.value() as u32);
                buf.put_u32(*items_per_frame);
            }
            Command::StopRxStreaming { channel } => {
                buf.put_u32(channel.value() as u32);
            }
            Command::BurnMacAddr(mac) => {
                buf.put_slice(&mac.0);
                buf.put_u16(0);
            }
        }
        buf
    }

    /// Encode as a complete control frame
    pub fn encode(&self, eth: &EthHeader, seqno: u8, rid: ReplyId) -> Bytes {
        encode_control_frame(eth, seqno, rid, self.opcode() as u8, &self.body())
    }

    /// Decode a command op (device side)
    pub fn decode(op: &ControlOp) -> Result<Self, PacketError> {
        if op.is_reply() {
            return Err(PacketError::NotACommand(op.opcode));
        }
        let opcode = Opcode::from_u8(op.opcode).ok_or(PacketError::UnknownOpcode(op.opcode))?;
        let mut body = op.body.clone();
        let short = |body: &Bytes| PacketError::ShortBody { opcode: op.opcode, len: body.remaining() };
        let channel = |raw: u32| {
            u8::try_from(raw)
                .ok()
                .and_then(ChannelId::new)
                .ok_or(PacketError::InvalidChannel(raw))
        };

        match opcode {
            Opcode::ConfigRx => Ok(Command::ConfigRx(RadioConfig::get(op.opcode, &mut body)?)),
            Opcode::ConfigTx => Ok(Command::ConfigTx(RadioConfig::get(op.opcode, &mut body)?)),
            Opcode::StartRxStreaming => {
                if body.remaining() < 8 {
                    return Err(short(&body));
                }
                let ch = channel(body.get_u32())?;
                Ok(Command::StartRxStreaming {
                    channel: ch,
                    items_per_frame: body.get_u32(),
                })
            }
            Opcode::StopRxStreaming => {
                if body.remaining() < 4 {
                    return Err(short(&body));
                }
                Ok(Command::StopRxStreaming {
                    channel: channel(body.get_u32())?,
                })
            }
            Opcode::BurnMacAddr => {
                if body.remaining() < 6 {
                    return Err(short(&body));
                }
                Ok(Command::BurnMacAddr(get_mac(&mut body)))
            }
            Opcode::Eop => Err(PacketError::EmptyControl),
        }
    }
}

/// Device-to-host reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Opcode of the command being answered
    pub opcode: Opcode,
    /// Device accepted the command
    pub ok: bool,
    /// Tuning actually programmed (config replies carrying a frequency)
    pub tune: Option<TuneResult>,
}

const TUNE_INVERTED: u32 = 0x1;
const TUNE_VALID: u32 = 0x2;

impl Reply {
    /// Plain acknowledgement
    pub fn ack(opcode: Opcode, ok: bool) -> Self {
        Self { opcode, ok, tune: None }
    }

    fn carries_tune(opcode: Opcode) -> bool {
        matches!(opcode, Opcode::ConfigRx | Opcode::ConfigTx)
    }

    fn body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(self.ok as u32);
        if Self::carries_tune(self.opcode) {
            let tune = self.tune.unwrap_or_default();
            let mut flags = 0;
            if self.tune.is_some() {
                flags |= TUNE_VALID;
            }
            if tune.spectrum_inverted {
                flags |= TUNE_INVERTED;
            }
            buf.put_u32(flags);
            buf.put_f64(tune.baseband_freq);
            buf.put_f64(tune.dxc_freq);
            buf.put_f64(tune.residual_freq);
        }
        buf
    }

    /// Encode as a complete control frame
    pub fn encode(&self, eth: &EthHeader, seqno: u8, rid: ReplyId) -> Bytes {
        encode_control_frame(eth, seqno, rid, self.opcode.reply(), &self.body())
    }

    /// Decode a reply op (host side)
    pub fn decode(op: &ControlOp) -> Result<Self, PacketError> {
        if !op.is_reply() {
            return Err(PacketError::NotAReply(op.opcode));
        }
        let base = op.opcode & !REPLY_BIT;
        let opcode = Opcode::from_u8(base).ok_or(PacketError::UnknownOpcode(op.opcode))?;
        let mut body = op.body.clone();
        let short = |body: &Bytes| PacketError::ShortBody { opcode: op.opcode, len: body.remaining() };

        if body.remaining() < 4 {
            return Err(short(&body));
        }
        let ok = body.get_u32() != 0;

        let mut tune = None;
        if Self::carries_tune(opcode) {
            if body.remaining() < 28 {
                return Err(short(&body));
            }
            let flags = body.get_u32();
            let result = TuneResult {
                baseband_freq: body.get_f64(),
                dxc_freq: body.get_f64(),
                residual_freq: body.get_f64(),
                spectrum_inverted: flags & TUNE_INVERTED != 0,
            };
            if flags & TUNE_VALID != 0 {
                tune = Some(result);
            }
        }

        Ok(Self { opcode, ok, tune })
    }
}
