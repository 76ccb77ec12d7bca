//! Channel Ring Buffers
//!
//! One bounded FIFO per receive channel between the receive thread and the
//! consumer of that channel. Pushing never blocks; when the ring is full the
//! configured [`OverflowPolicy`] decides which frame is lost and the loss is
//! counted as an overrun.

use common::{ChannelId, NUM_CHANNELS};
use interfaces::packet::FrameFlags;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// One received data frame
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFrame {
    pub channel: ChannelId,
    pub timestamp: u32,
    pub seqno: u8,
    pub flags: FrameFlags,
    pub items: Vec<u32>,
}

/// Which frame is discarded when a ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep what is queued, drop the arriving frame
    #[default]
    DropNewest,
    /// Make room by discarding the oldest queued frame
    DropOldest,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Overrun,
    Closed,
}

/// How a pop may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Blocking,
    NonBlocking,
    Timeout(Duration),
}

/// Result of a pop
#[derive(Debug, Clone, PartialEq)]
pub enum PopOutcome {
    Frame(SampleFrame),
    /// Nothing queued within the allowed wait
    Empty,
    /// Ring closed and drained
    Closed,
}

/// Ring counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub capacity: usize,
    pub queued: usize,
    pub pushed: u64,
    pub overruns: u64,
    pub open: bool,
}

struct RingState {
    frames: VecDeque<SampleFrame>,
    capacity: usize,
    open: bool,
    pushed: u64,
    overruns: u64,
}

/// Bounded single-producer/single-consumer frame queue
pub struct ChannelRing {
    state: Mutex<RingState>,
    readable: Condvar,
    policy: OverflowPolicy,
}

impl ChannelRing {
    /// Create a closed ring
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(RingState {
                frames: VecDeque::new(),
                capacity: 0,
                open: false,
                pushed: 0,
                overruns: 0,
            }),
            readable: Condvar::new(),
            policy,
        }
    }

    /// Open with a fresh capacity, discarding anything left from a previous run
    pub fn open(&self, capacity: usize) {
        let capacity = capacity.clamp(1, MAX_RING_FRAMES);
        let mut state = self.state.lock();
        state.frames.clear();
        state.frames.reserve_exact(capacity);
        state.capacity = capacity;
        state.open = true;
    }

    /// Stop accepting frames and wake the consumer
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        self.readable.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// True once the ring has been opened at least once
    pub fn was_opened(&self) -> bool {
        self.state.lock().capacity > 0
    }

    /// Queue a frame without blocking
    pub fn push(&self, frame: SampleFrame) -> PushOutcome {
        let mut state = self.state.lock();
        if !state.open {
            return PushOutcome::Closed;
        }

        let outcome = if state.frames.len() < state.capacity {
            PushOutcome::Queued
        } else {
            state.overruns += 1;
            match self.policy {
                OverflowPolicy::DropNewest => return PushOutcome::Overrun,
                OverflowPolicy::DropOldest => {
                    state.frames.pop_front();
                    PushOutcome::Overrun
                }
            }
        };

        state.frames.push_back(frame);
        state.pushed += 1;
        self.readable.notify_one();
        outcome
    }

    /// Take the oldest frame
    ///
    /// Frames queued before a close are still handed out; `Closed` is
    /// returned only once the ring is closed and empty.
    pub fn pop(&self, mode: ReadMode) -> PopOutcome {
        let deadline = match mode {
            ReadMode::Timeout(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };
        let mut state = self.state.lock();

        loop {
            if let Some(frame) = state.frames.pop_front() {
                return PopOutcome::Frame(frame);
            }
            if !state.open {
                return PopOutcome::Closed;
            }

            match mode {
                ReadMode::NonBlocking => return PopOutcome::Empty,
                ReadMode::Blocking => self.readable.wait(&mut state),
                ReadMode::Timeout(_) => match deadline {
                    Some(deadline) => {
                        if self.readable.wait_until(&mut state, deadline).timed_out()
                            && state.frames.is_empty()
                        {
                            return if state.open { PopOutcome::Empty } else { PopOutcome::Closed };
                        }
                    }
                    None => self.readable.wait(&mut state),
                },
            }
        }
    }

    pub fn overruns(&self) -> u64 {
        self.state.lock().overruns
    }

    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            capacity: state.capacity,
            queued: state.frames.len(),
            pushed: state.pushed,
            overruns: state.overruns,
            open: state.open,
        }
    }
}

/// The full set of per-channel rings
pub struct ChannelRings {
    rings: Vec<ChannelRing>,
}

impl ChannelRings {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            rings: (0..NUM_CHANNELS).map(|_| ChannelRing::new(policy)).collect(),
        }
    }

    pub fn get(&self, channel: ChannelId) -> &ChannelRing {
        &self.rings[channel.index()]
    }

    /// Close every ring
    pub fn close_all(&self) {
        for ring in &self.rings {
            ring.close();
        }
        debug!("Closed all channel rings");
    }

    /// Overruns summed over all channels
    pub fn total_overruns(&self) -> u64 {
        self.rings.iter().map(ChannelRing::overruns).sum()
    }
}

/// Largest ring, in frames, that a channel may be opened with
pub const MAX_RING_FRAMES: usize = 1 << 16;

/// Ring capacity in frames for a byte budget
///
/// `fixed_frames` overrides the budget when set. The result never exceeds
/// [`MAX_RING_FRAMES`].
pub fn ring_capacity(items_per_frame: usize, budget_bytes: usize, fixed_frames: Option<usize>) -> usize {
    const MIN_FRAMES: usize = 4;

    if let Some(frames) = fixed_frames {
        return frames.clamp(1, MAX_RING_FRAMES);
    }
    let frame_bytes = items_per_frame.max(1) * std::mem::size_of::<u32>();
    (budget_bytes / frame_bytes).clamp(MIN_FRAMES, MAX_RING_FRAMES)
}
