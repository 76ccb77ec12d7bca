//! Packet Dispatcher
//!
//! Classifies each inbound frame and routes it: replies go to the pending
//! reply registry, sample frames to their channel ring. Nothing that arrives
//! off the wire is fatal; bad frames are counted and dropped.

use crate::registry::ReplyRegistry;
use crate::ring::{ChannelRings, PushOutcome, SampleFrame};
use crate::sequence::{SequenceEvent, SequenceState};
use bytes::Bytes;
use common::utils::bytes_to_hex_prefix;
use common::{ChannelId, ReplyId, NUM_CHANNELS};
use interfaces::packet::{ControlPacket, DataPacket, Packet, PacketError, Reply};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Why a frame went nowhere
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Malformed(PacketError),
    /// Channel number outside the valid range
    BadChannel(u8),
    /// Data for a channel that is not streaming
    NotStreaming(ChannelId),
    /// Ring full
    Overrun(ChannelId),
    /// A command arriving at the host
    UnexpectedCommand(u8),
}

/// Where a frame went
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Reply(ReplyId),
    Data(ChannelId),
    /// Reply for an id nobody is waiting on
    Stale(ReplyId),
    Dropped(DropReason),
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub frames: u64,
    pub bytes: u64,
    pub malformed: u64,
    pub bad_channel: u64,
    pub stale_replies: u64,
    pub unrouted: u64,
    pub control_missing: u64,
}

/// Routes decoded frames to the registry and rings
pub struct Dispatcher {
    registry: Arc<ReplyRegistry<Reply>>,
    rings: Arc<ChannelRings>,
    control_seq: Mutex<SequenceState>,
    channel_seq: Vec<Mutex<SequenceState>>,
    frames: AtomicU64,
    bytes: AtomicU64,
    malformed: AtomicU64,
    bad_channel: AtomicU64,
    stale_replies: AtomicU64,
    unrouted: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: Arc<ReplyRegistry<Reply>>, rings: Arc<ChannelRings>) -> Self {
        Self {
            registry,
            rings,
            control_seq: Mutex::new(SequenceState::new()),
            channel_seq: (0..NUM_CHANNELS).map(|_| Mutex::new(SequenceState::new())).collect(),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            bad_channel: AtomicU64::new(0),
            stale_replies: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }

    /// Route one raw frame
    pub fn dispatch(&self, frame: &Bytes) -> Dispatched {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);

        match Packet::decode(frame) {
            Packet::Control(packet) => self.dispatch_control(packet),
            Packet::Data(packet) => self.dispatch_data(packet),
            Packet::Malformed(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping malformed frame: {} [{}]", e, bytes_to_hex_prefix(frame, 24));
                Dispatched::Dropped(DropReason::Malformed(e))
            }
        }
    }

    fn dispatch_control(&self, packet: ControlPacket) -> Dispatched {
        if !packet.op.is_reply() {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping command opcode 0x{:02x} sent to host", packet.op.opcode);
            return Dispatched::Dropped(DropReason::UnexpectedCommand(packet.op.opcode));
        }

        let reply = match Reply::decode(&packet.op) {
            Ok(reply) => reply,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping undecodable reply {}: {}", packet.op.rid, e);
                return Dispatched::Dropped(DropReason::Malformed(e));
            }
        };

        if let SequenceEvent::Gap(lost) = self.control_seq.lock().observe(packet.header.seqno) {
            debug!("Control stream skipped {} frames", lost);
        }

        let rid = packet.op.rid;
        trace!("Reply {:?} ok={} on {}", reply.opcode, reply.ok, rid);
        match self.registry.fulfil(rid, reply) {
            Ok(()) => Dispatched::Reply(rid),
            Err(e) => {
                self.stale_replies.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding reply: {}", e);
                Dispatched::Stale(rid)
            }
        }
    }

    fn dispatch_data(&self, packet: DataPacket) -> Dispatched {
        let Some(channel) = ChannelId::new(packet.header.channel) else {
            self.bad_channel.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping data frame for invalid channel {}", packet.header.channel);
            return Dispatched::Dropped(DropReason::BadChannel(packet.header.channel));
        };

        let ring = self.rings.get(channel);
        if !ring.is_open() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping data frame for idle {}", channel);
            return Dispatched::Dropped(DropReason::NotStreaming(channel));
        }

        let seqno = packet.header.seqno;
        match self.channel_seq[channel.index()].lock().observe(seqno) {
            SequenceEvent::Gap(lost) => debug!("{}: {} frames missing before seqno {}", channel, lost, seqno),
            SequenceEvent::Stale => debug!("{}: stale seqno {}", channel, seqno),
            SequenceEvent::Synced | SequenceEvent::InOrder => {}
        }

        let frame = SampleFrame {
            channel,
            timestamp: packet.header.timestamp,
            seqno,
            flags: packet.header.flags,
            items: packet.items,
        };
        match ring.push(frame) {
            PushOutcome::Queued => Dispatched::Data(channel),
            PushOutcome::Overrun => {
                debug!("{}: ring full, frame dropped", channel);
                Dispatched::Dropped(DropReason::Overrun(channel))
            }
            PushOutcome::Closed => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                Dispatched::Dropped(DropReason::NotStreaming(channel))
            }
        }
    }

    /// Cancel every pending reply and close every ring
    pub fn close(&self) -> usize {
        let cancelled = self.registry.close();
        self.rings.close_all();
        cancelled
    }

    /// Restart sequence tracking on a channel that is about to stream
    pub fn resync_channel(&self, channel: ChannelId) {
        self.channel_seq[channel.index()].lock().resync();
    }

    pub fn channel_sequence(&self, channel: ChannelId) -> SequenceState {
        *self.channel_seq[channel.index()].lock()
    }

    pub fn control_sequence(&self) -> SequenceState {
        *self.control_seq.lock()
    }

    /// Data frames lost on the wire, all channels
    pub fn total_missing(&self) -> u64 {
        self.channel_seq.iter().map(|seq| seq.lock().missing_count).sum()
    }

    /// Stale or duplicated data frames, all channels
    pub fn total_duplicates(&self) -> u64 {
        self.channel_seq.iter().map(|seq| seq.lock().duplicate_count).sum()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            bad_channel: self.bad_channel.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            control_missing: self.control_seq.lock().missing_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WaitOutcome;
    use crate::ring::{OverflowPolicy, PopOutcome, ReadMode};
    use interfaces::packet::{encode_data_frame, EthHeader, FrameFlags, Opcode};
    use std::time::Duration;

    fn eth() -> EthHeader {
        EthHeader::new(
            "02:00:00:00:00:01".parse().unwrap(),
            "00:50:c2:85:30:01".parse().unwrap(),
        )
    }

    fn dispatcher() -> (Dispatcher, Arc<ReplyRegistry<Reply>>, Arc<ChannelRings>) {
        let registry = Arc::new(ReplyRegistry::new());
        let rings = Arc::new(ChannelRings::new(OverflowPolicy::DropNewest));
        (Dispatcher::new(registry.clone(), rings.clone()), registry, rings)
    }

    fn data(channel: u8, seqno: u8) -> Bytes {
        let ch = ChannelId::new(channel).unwrap();
        encode_data_frame(&eth(), ch, seqno, FrameFlags::empty(), seqno as u32 * 10, &[1, 2, 3])
    }

    #[test]
    fn test_reply_fulfils_pending() {
        let (dispatcher, registry, _rings) = dispatcher();
        let pending = registry.allocate().unwrap();
        let frame = Reply::ack(Opcode::StartRxStreaming, true).encode(&eth(), 0, pending.id());

        assert_eq!(dispatcher.dispatch(&frame), Dispatched::Reply(pending.id()));
        assert_eq!(
            pending.wait(Some(Duration::from_secs(1))),
            WaitOutcome::Fulfilled(Reply::ack(Opcode::StartRxStreaming, true))
        );
    }

    #[test]
    fn test_unsolicited_reply_is_stale() {
        let (dispatcher, _registry, _rings) = dispatcher();
        let frame = Reply::ack(Opcode::ConfigRx, true).encode(&eth(), 0, ReplyId(50));
        assert_eq!(dispatcher.dispatch(&frame), Dispatched::Stale(ReplyId(50)));
        assert_eq!(dispatcher.stats().stale_replies, 1);
    }

    #[test]
    fn test_data_routed_to_open_ring() {
        let (dispatcher, _registry, rings) = dispatcher();
        let ch = ChannelId::new(3).unwrap();
        rings.get(ch).open(8);

        assert_eq!(dispatcher.dispatch(&data(3, 0)), Dispatched::Data(ch));
        match rings.get(ch).pop(ReadMode::NonBlocking) {
            PopOutcome::Frame(frame) => {
                assert_eq!(frame.items, vec![1, 2, 3]);
                assert_eq!(frame.seqno, 0);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_data_for_idle_channel_unrouted() {
        let (dispatcher, _registry, _rings) = dispatcher();
        let ch = ChannelId::new(4).unwrap();
        assert_eq!(
            dispatcher.dispatch(&data(4, 0)),
            Dispatched::Dropped(DropReason::NotStreaming(ch))
        );
        assert_eq!(dispatcher.stats().unrouted, 1);
    }

    #[test]
    fn test_bad_channel_counted() {
        let (dispatcher, _registry, _rings) = dispatcher();
        let mut raw = data(0, 0).to_vec();
        raw[15] = 40;
        assert_eq!(
            dispatcher.dispatch(&Bytes::from(raw)),
            Dispatched::Dropped(DropReason::BadChannel(40))
        );
        assert_eq!(dispatcher.stats().bad_channel, 1);
    }

    #[test]
    fn test_sequence_gaps_counted_per_channel() {
        let (dispatcher, _registry, rings) = dispatcher();
        let a = ChannelId::new(0).unwrap();
        let b = ChannelId::new(1).unwrap();
        rings.get(a).open(64);
        rings.get(b).open(64);

        for seqno in [0u8, 1, 2, 5, 6] {
            dispatcher.dispatch(&data(0, seqno));
        }
        for seqno in [0u8, 1, 2, 3] {
            dispatcher.dispatch(&data(1, seqno));
        }

        assert_eq!(dispatcher.channel_sequence(a).missing_count, 2);
        assert_eq!(dispatcher.channel_sequence(a).expected_next, 7);
        assert_eq!(dispatcher.channel_sequence(b).missing_count, 0);
        assert_eq!(dispatcher.total_missing(), 2);
    }

    #[test]
    fn test_overrun_drops_incoming() {
        let (dispatcher, _registry, rings) = dispatcher();
        let ch = ChannelId::new(0).unwrap();
        rings.get(ch).open(2);

        dispatcher.dispatch(&data(0, 0));
        dispatcher.dispatch(&data(0, 1));
        assert_eq!(
            dispatcher.dispatch(&data(0, 2)),
            Dispatched::Dropped(DropReason::Overrun(ch))
        );
        assert_eq!(rings.total_overruns(), 1);
        // Ring loss is not wire loss
        assert_eq!(dispatcher.total_missing(), 0);
    }

    #[test]
    fn test_malformed_and_commands_dropped() {
        let (dispatcher, _registry, _rings) = dispatcher();
        assert!(matches!(
            dispatcher.dispatch(&Bytes::from_static(&[0u8; 5])),
            Dispatched::Dropped(DropReason::Malformed(PacketError::TooShort(5)))
        ));

        let command = interfaces::packet::Command::StopRxStreaming {
            channel: ChannelId::new(0).unwrap(),
        };
        assert_eq!(
            dispatcher.dispatch(&command.encode(&eth(), 0, ReplyId(0))),
            Dispatched::Dropped(DropReason::UnexpectedCommand(Opcode::StopRxStreaming as u8))
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.frames, 2);
    }
}
