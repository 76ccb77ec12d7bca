//! Sequence & Loss Tracking
//!
//! Every stream (the control stream and each data channel) carries an 8-bit
//! sequence number. Arrivals ahead of the expected number count the skipped
//! frames as missing; arrivals behind it are stale or duplicated and leave
//! the expectation untouched.

use serde::Serialize;

/// Sequence number space
pub const SEQNO_SPACE: u32 = 256;

/// Largest forward distance still treated as loss
pub const MAX_FORWARD_GAP: u32 = SEQNO_SPACE / 2 - 1;

/// Classification of one arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// First frame after a reset; tracker synchronized to it
    Synced,
    InOrder,
    /// Frames skipped before this one
    Gap(u32),
    /// Duplicate or out-of-window frame
    Stale,
}

/// Per-stream sequence state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceState {
    pub expected_next: u8,
    pub missing_count: u64,
    pub duplicate_count: u64,
    pub received: u64,
    #[serde(skip)]
    synced: bool,
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a frame carrying `seqno`
    pub fn observe(&mut self, seqno: u8) -> SequenceEvent {
        self.received += 1;

        if !self.synced {
            self.synced = true;
            self.expected_next = seqno.wrapping_add(1);
            return SequenceEvent::Synced;
        }

        let distance = seqno.wrapping_sub(self.expected_next) as u32;
        match distance {
            0 => {
                self.expected_next = seqno.wrapping_add(1);
                SequenceEvent::InOrder
            }
            1..=MAX_FORWARD_GAP => {
                self.missing_count += distance as u64;
                self.expected_next = seqno.wrapping_add(1);
                SequenceEvent::Gap(distance)
            }
            _ => {
                self.duplicate_count += 1;
                SequenceEvent::Stale
            }
        }
    }

    /// Forget the stream position; counters are kept
    pub fn resync(&mut self) {
        self.synced = false;
    }

    /// Zero everything
    #[cfg(test)]
    fn reset(&mut self) {
        *self = Self::default();
    }

    #[cfg(test)]
    fn is_synced(&self) -> bool {
        self.synced
    }
}
