//! USRP2 Host Engine
//!
//! Control and data engine for a USRP2-class radio reached over raw
//! Ethernet frames. Callers issue blocking configuration commands, start and
//! stop per-channel receive streams, consume received sample frames and
//! transmit sample bursts. A background thread demultiplexes everything the
//! device sends back.

pub mod config;
pub mod dispatcher;
pub mod registry;
pub mod ring;
pub mod rx_loop;
pub mod sequence;
pub mod transmitter;

pub use config::EngineConfig;
pub use ring::OverflowPolicy;

use common::{plan_tune, ChannelId, MacAddress, TuneError, TuneResult, NUM_CHANNELS};
use dispatcher::Dispatcher;
use interfaces::copiers::{
    copy_host_16sc_to_u2_16sc, copy_host_32fc_to_u2_16sc, copy_u2_16sc_to_host_16sc,
    copy_u2_16sc_to_host_32fc,
};
use interfaces::packet::{
    encode_data_frame, Command, FrameFlags, Opcode, RadioConfig, Reply, MAX_ITEMS_PER_FRAME,
};
use interfaces::{FrameTransport, InterfaceError};
use num_complex::{Complex, Complex32};
use parking_lot::Mutex;
use registry::{RegistryError, ReplyRegistry};
use ring::{ChannelRings, PopOutcome, ReadMode, RingStats, SampleFrame};
use rx_loop::{RxLoop, RxLoopExit};
use sequence::SequenceState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use transmitter::CommandTransmitter;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] InterfaceError),

    #[error("Timed out waiting for {0:?} reply")]
    Timeout(Opcode),

    #[error("{0:?} cancelled by shutdown")]
    Cancelled(Opcode),

    #[error("No reply id available")]
    IdExhausted,

    #[error("Engine is shut down")]
    ShutDown,

    #[error("Reply registry error: {0}")]
    Registry(RegistryError),

    #[error("Device rejected {0:?}")]
    DeviceRejected(Opcode),

    #[error("Reply opcode mismatch: sent {sent:?}, got {got:?}")]
    ReplyMismatch { sent: Opcode, got: Opcode },

    #[error("Tuning error: {0}")]
    Tune(#[from] TuneError),

    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    #[error("{0} is not streaming")]
    NotStreaming(ChannelId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Exhausted => EngineError::IdExhausted,
            RegistryError::ShuttingDown => EngineError::ShutDown,
            other => EngineError::Registry(other),
        }
    }
}

/// Metadata delivered with each received frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxMetadata {
    /// Device timestamp of the first sample
    pub timestamp: u32,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    /// Device dropped samples before this frame
    pub device_overrun: bool,
    pub seqno: u8,
}

impl RxMetadata {
    fn from_frame(frame: &SampleFrame) -> Self {
        Self {
            timestamp: frame.timestamp,
            start_of_burst: frame.flags.contains(FrameFlags::START_OF_BURST),
            end_of_burst: frame.flags.contains(FrameFlags::END_OF_BURST),
            device_overrun: frame.flags.contains(FrameFlags::OVERRUN),
            seqno: frame.seqno,
        }
    }
}

/// Metadata for a transmitted burst
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxMetadata {
    /// Device time of the first sample, ignored with `send_now`
    pub timestamp: u32,
    pub send_now: bool,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

impl TxMetadata {
    /// A complete burst sent immediately
    pub fn now() -> Self {
        Self {
            timestamp: 0,
            send_now: true,
            start_of_burst: true,
            end_of_burst: true,
        }
    }

    /// A complete burst sent at device time `timestamp`
    pub fn at(timestamp: u32) -> Self {
        Self {
            timestamp,
            send_now: false,
            start_of_burst: true,
            end_of_burst: true,
        }
    }
}

/// Consumer of received sample frames
pub trait RxSampleHandler {
    /// Handle one frame of sample words; return `false` to stop consuming
    fn handle(&mut self, items: &[u32], metadata: &RxMetadata) -> bool;
}

impl<F> RxSampleHandler for F
where
    F: FnMut(&[u32], &RxMetadata) -> bool,
{
    fn handle(&mut self, items: &[u32], metadata: &RxMetadata) -> bool {
        self(items, metadata)
    }
}

/// Why `rx_samples` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStop {
    /// The handler asked to stop
    HandlerDone,
    /// The stream was stopped or the engine shut down, and the ring is drained
    StreamStopped,
}

/// Receive-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxStats {
    pub frames: u64,
    pub bytes: u64,
    pub missing: u64,
    pub duplicates: u64,
    pub overruns: u64,
    pub malformed: u64,
    pub bad_channel: u64,
    pub stale_replies: u64,
    pub unrouted: u64,
    pub control_missing: u64,
    pub commands_in_flight: usize,
}

/// Per-channel view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: ChannelId,
    pub items_per_frame: Option<usize>,
    pub ring: RingStats,
    pub sequence: SequenceState,
}

/// Outcome of engine teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// How the receive thread ended; `None` if it had already been stopped
    pub rx_exit: Option<RxLoopExit>,
    /// Commands woken with a cancellation
    pub cancelled: usize,
    /// All in-flight commands unwound within the shutdown timeout
    pub drained: bool,
    pub stats: RxStats,
}

/// Handle to one device
pub struct Usrp2 {
    config: EngineConfig,
    rings: Arc<ChannelRings>,
    dispatcher: Arc<Dispatcher>,
    transmitter: CommandTransmitter,
    rx_loop: Mutex<RxLoop>,
    streaming: Mutex<Vec<Option<usize>>>,
    decim: AtomicU32,
    interp: AtomicU32,
    shut_down: AtomicBool,
}

impl Usrp2 {
    /// Start the engine on `transport`
    pub fn new(transport: Arc<dyn FrameTransport>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            "Initializing USRP2 engine: host {} device {}",
            transport.local_mac(),
            config.device_mac
        );

        let registry = Arc::new(ReplyRegistry::<Reply>::new());
        let rings = Arc::new(ChannelRings::new(config.overflow_policy));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), rings.clone()));
        let transmitter = CommandTransmitter::new(
            transport.clone(),
            registry,
            config.device_mac,
            config.command_timeout(),
        );
        let rx_loop = RxLoop::spawn(transport, dispatcher.clone(), config.poll_interval())?;

        Ok(Self {
            config,
            rings,
            dispatcher,
            transmitter,
            rx_loop: Mutex::new(rx_loop),
            streaming: Mutex::new(vec![None; NUM_CHANNELS]),
            decim: AtomicU32::new(1),
            interp: AtomicU32::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn config_rx(&self, config: RadioConfig) -> Result<Reply, EngineError> {
        self.transmitter.transmit(&Command::ConfigRx(config))
    }

    fn config_tx(&self, config: RadioConfig) -> Result<Reply, EngineError> {
        self.transmitter.transmit(&Command::ConfigTx(config))
    }

    /// Set receive gain in dB
    pub fn set_rx_gain(&self, gain: f64) -> Result<(), EngineError> {
        self.config_rx(RadioConfig {
            gain: Some(gain),
            ..RadioConfig::default()
        })?;
        Ok(())
    }

    /// Set transmit gain in dB
    pub fn set_tx_gain(&self, gain: f64) -> Result<(), EngineError> {
        self.config_tx(RadioConfig {
            gain: Some(gain),
            ..RadioConfig::default()
        })?;
        Ok(())
    }

    /// Tune the receive path
    ///
    /// The split echoed by the device is returned; a disagreement with the
    /// locally planned split is logged.
    pub fn set_rx_center_freq(&self, freq: f64) -> Result<TuneResult, EngineError> {
        let planned = plan_tune(freq, &self.config.tune)?;
        let reply = self.config_rx(RadioConfig {
            freq: Some(freq),
            ..RadioConfig::default()
        })?;
        Ok(reconcile_tune("rx", freq, planned, reply.tune))
    }

    /// Tune the transmit path
    pub fn set_tx_center_freq(&self, freq: f64) -> Result<TuneResult, EngineError> {
        let planned = plan_tune(freq, &self.config.tune)?;
        let reply = self.config_tx(RadioConfig {
            freq: Some(freq),
            ..RadioConfig::default()
        })?;
        Ok(reconcile_tune("tx", freq, planned, reply.tune))
    }

    /// Set the receive decimation factor
    pub fn set_rx_decim(&self, decim: u32) -> Result<(), EngineError> {
        if decim == 0 {
            return Err(EngineError::InvalidArgument("decimation must be positive".to_string()));
        }
        self.config_rx(RadioConfig {
            rate: Some(decim),
            ..RadioConfig::default()
        })?;
        self.decim.store(decim, Ordering::Relaxed);
        Ok(())
    }

    /// Set the transmit interpolation factor
    pub fn set_tx_interp(&self, interp: u32) -> Result<(), EngineError> {
        if interp == 0 {
            return Err(EngineError::InvalidArgument("interpolation must be positive".to_string()));
        }
        self.config_tx(RadioConfig {
            rate: Some(interp),
            ..RadioConfig::default()
        })?;
        self.interp.store(interp, Ordering::Relaxed);
        Ok(())
    }

    pub fn rx_decim(&self) -> u32 {
        self.decim.load(Ordering::Relaxed)
    }

    pub fn tx_interp(&self) -> u32 {
        self.interp.load(Ordering::Relaxed)
    }

    /// Set receive I/Q scale factors
    pub fn set_rx_scale_iq(&self, scale_i: i16, scale_q: i16) -> Result<(), EngineError> {
        self.config_rx(RadioConfig {
            scale_iq: Some((scale_i, scale_q)),
            ..RadioConfig::default()
        })?;
        Ok(())
    }

    /// Set transmit I/Q scale factors
    pub fn set_tx_scale_iq(&self, scale_i: i16, scale_q: i16) -> Result<(), EngineError> {
        self.config_tx(RadioConfig {
            scale_iq: Some((scale_i, scale_q)),
            ..RadioConfig::default()
        })?;
        Ok(())
    }

    /// Start streaming `channel`; `items_per_frame == 0` selects the maximum
    pub fn start_rx_streaming(&self, channel: ChannelId, items_per_frame: usize) -> Result<(), EngineError> {
        let items_per_frame = match items_per_frame {
            0 => MAX_ITEMS_PER_FRAME,
            n if n > MAX_ITEMS_PER_FRAME => {
                return Err(EngineError::InvalidArgument(format!(
                    "items_per_frame {} exceeds {}",
                    n, MAX_ITEMS_PER_FRAME
                )))
            }
            n => n,
        };

        let capacity = ring::ring_capacity(
            items_per_frame,
            self.config.ring_budget_bytes,
            self.config.ring_frames,
        );
        // Ring goes live before the command so the first frames have somewhere to land
        let ring = self.rings.get(channel);
        ring.open(capacity);
        self.dispatcher.resync_channel(channel);

        let command = Command::StartRxStreaming {
            channel,
            items_per_frame: items_per_frame as u32,
        };
        if let Err(e) = self.transmitter.transmit(&command) {
            ring.close();
            return Err(e);
        }

        self.streaming.lock()[channel.index()] = Some(items_per_frame);
        info!(
            "{}: streaming {} items/frame, ring of {} frames",
            channel, items_per_frame, capacity
        );
        Ok(())
    }

    /// Stop streaming `channel`
    ///
    /// The ring is closed even if the device does not acknowledge; frames
    /// already queued can still be consumed.
    pub fn stop_rx_streaming(&self, channel: ChannelId) -> Result<(), EngineError> {
        let result = self.transmitter.transmit(&Command::StopRxStreaming { channel });
        self.rings.get(channel).close();
        self.streaming.lock()[channel.index()] = None;
        debug!("{}: streaming stopped", channel);
        result.map(|_| ())
    }

    pub fn is_streaming(&self, channel: ChannelId) -> bool {
        self.streaming.lock()[channel.index()].is_some()
    }

    fn deliver<H: RxSampleHandler>(frame: SampleFrame, handler: &mut H) -> bool {
        let metadata = RxMetadata::from_frame(&frame);
        handler.handle(&frame.items, &metadata)
    }

    /// Feed received frames on `channel` to `handler`, blocking until it
    /// returns `false` or the stream ends
    ///
    /// Fails with `NotStreaming` only for a channel that was never started;
    /// a stopped channel drains what is queued and reports `StreamStopped`.
    pub fn rx_samples<H: RxSampleHandler>(&self, channel: ChannelId, mut handler: H) -> Result<RxStop, EngineError> {
        let ring = self.rings.get(channel);
        if !ring.was_opened() {
            return Err(EngineError::NotStreaming(channel));
        }

        loop {
            match ring.pop(ReadMode::Blocking) {
                PopOutcome::Frame(frame) => {
                    if !Self::deliver(frame, &mut handler) {
                        return Ok(RxStop::HandlerDone);
                    }
                }
                PopOutcome::Empty => {}
                PopOutcome::Closed => return Ok(RxStop::StreamStopped),
            }
        }
    }

    /// Like [`Usrp2::rx_samples`], converting each frame to complex 16-bit samples
    pub fn rx_complex_int16<F>(&self, channel: ChannelId, mut handler: F) -> Result<RxStop, EngineError>
    where
        F: FnMut(&[Complex<i16>], &RxMetadata) -> bool,
    {
        let mut samples = Vec::new();
        self.rx_samples(channel, |items: &[u32], metadata: &RxMetadata| {
            samples.clear();
            copy_u2_16sc_to_host_16sc(items, &mut samples);
            handler(&samples, metadata)
        })
    }

    /// Like [`Usrp2::rx_samples`], converting each frame to complex float
    /// samples in [-1.0, 1.0]
    pub fn rx_complex_float<F>(&self, channel: ChannelId, mut handler: F) -> Result<RxStop, EngineError>
    where
        F: FnMut(&[Complex32], &RxMetadata) -> bool,
    {
        let mut samples = Vec::new();
        self.rx_samples(channel, |items: &[u32], metadata: &RxMetadata| {
            samples.clear();
            copy_u2_16sc_to_host_32fc(items, &mut samples);
            handler(&samples, metadata)
        })
    }

    /// Feed whatever is queued on `channel` to `handler` without blocking;
    /// returns the number of frames handled
    pub fn poll_rx_samples<H: RxSampleHandler>(&self, channel: ChannelId, mut handler: H) -> Result<usize, EngineError> {
        let ring = self.rings.get(channel);
        if !ring.was_opened() {
            return Err(EngineError::NotStreaming(channel));
        }

        let mut handled = 0;
        while let PopOutcome::Frame(frame) = ring.pop(ReadMode::NonBlocking) {
            handled += 1;
            if !Self::deliver(frame, &mut handler) {
                break;
            }
        }
        Ok(handled)
    }

    /// Transmit raw sample words; returns the number of frames sent
    pub fn tx_raw(&self, channel: ChannelId, items: &[u32], metadata: &TxMetadata) -> Result<usize, EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        if items.is_empty() {
            return Ok(0);
        }

        let eth = self.transmitter.eth();
        let interp = self.tx_interp();
        let chunks = items.chunks(MAX_ITEMS_PER_FRAME);
        let last = chunks.len() - 1;
        let mut offset = 0u32;

        for (index, chunk) in chunks.enumerate() {
            let mut flags = FrameFlags::empty();
            flags.set(FrameFlags::START_OF_BURST, index == 0 && metadata.start_of_burst);
            flags.set(FrameFlags::END_OF_BURST, index == last && metadata.end_of_burst);
            flags.set(FrameFlags::SEND_NOW, metadata.send_now);

            let timestamp = if metadata.send_now {
                metadata.timestamp
            } else {
                metadata.timestamp.wrapping_add(offset.wrapping_mul(interp))
            };

            let seqno = self.transmitter.next_data_seqno();
            let frame = encode_data_frame(&eth, channel, seqno, flags, timestamp, chunk);
            self.transmitter.send_frame(&frame)?;
            offset = offset.wrapping_add(chunk.len() as u32);
        }

        Ok(last + 1)
    }

    /// Transmit complex 16-bit samples
    pub fn tx_complex_int16(
        &self,
        channel: ChannelId,
        samples: &[Complex<i16>],
        metadata: &TxMetadata,
    ) -> Result<usize, EngineError> {
        self.tx_raw(channel, &copy_host_16sc_to_u2_16sc(samples), metadata)
    }

    /// Transmit complex float samples in [-1.0, 1.0]
    pub fn tx_complex_float(
        &self,
        channel: ChannelId,
        samples: &[Complex32],
        metadata: &TxMetadata,
    ) -> Result<usize, EngineError> {
        self.tx_raw(channel, &copy_host_32fc_to_u2_16sc(samples), metadata)
    }

    /// Frames dropped because a channel ring was full
    pub fn rx_overruns(&self) -> u64 {
        self.rings.total_overruns()
    }

    /// Frames lost on the wire, judged by sequence numbers
    pub fn rx_missing(&self) -> u64 {
        self.dispatcher.total_missing()
    }

    /// Device hardware address frames are sent to
    pub fn mac_addr(&self) -> MacAddress {
        self.transmitter.device_mac()
    }

    /// Program a new hardware address into the device
    pub fn burn_mac_addr(&self, new_addr: MacAddress) -> Result<(), EngineError> {
        if new_addr.is_multicast() {
            return Err(EngineError::InvalidArgument(format!(
                "{} is not a unicast address",
                new_addr
            )));
        }
        self.transmitter.transmit(&Command::BurnMacAddr(new_addr))?;
        info!("Device MAC address changed to {}", new_addr);
        self.transmitter.set_device_mac(new_addr);
        Ok(())
    }

    pub fn rx_stats(&self) -> RxStats {
        let dispatch = self.dispatcher.stats();
        RxStats {
            frames: dispatch.frames,
            bytes: dispatch.bytes,
            missing: self.dispatcher.total_missing(),
            duplicates: self.dispatcher.total_duplicates(),
            overruns: self.rings.total_overruns(),
            malformed: dispatch.malformed,
            bad_channel: dispatch.bad_channel,
            stale_replies: dispatch.stale_replies,
            unrouted: dispatch.unrouted,
            control_missing: dispatch.control_missing,
            commands_in_flight: self.transmitter.in_flight().count(),
        }
    }

    pub fn channel_stats(&self, channel: ChannelId) -> ChannelStats {
        ChannelStats {
            channel,
            items_per_frame: self.streaming.lock()[channel.index()],
            ring: self.rings.get(channel).stats(),
            sequence: self.dispatcher.channel_sequence(channel),
        }
    }

    /// True while the receive thread is running
    pub fn is_running(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire) && self.rx_loop.lock().is_running()
    }

    /// Stop the receive thread, cancel pending commands, close every ring and
    /// wait for in-flight commands to unwind
    ///
    /// Later calls return an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                rx_exit: None,
                cancelled: 0,
                drained: true,
                stats: self.rx_stats(),
            };
        }

        info!("Shutting down USRP2 engine");
        let rx_exit = self.rx_loop.lock().stop();
        let cancelled = self.dispatcher.close();
        self.streaming.lock().iter_mut().for_each(|slot| *slot = None);

        let drained = self
            .transmitter
            .in_flight()
            .wait_drained(self.config.shutdown_timeout());
        if !drained {
            warn!(
                "{} commands still in flight after {:?}",
                self.transmitter.in_flight().count(),
                self.config.shutdown_timeout()
            );
        }

        let stats = self.rx_stats();
        info!("Engine statistics:");
        info!("  Frames received: {} ({} bytes)", stats.frames, stats.bytes);
        info!("  Missing: {}  Duplicates: {}", stats.missing, stats.duplicates);
        info!("  Overruns: {}", stats.overruns);
        info!(
            "  Malformed: {}  Bad channel: {}  Stale replies: {}  Unrouted: {}",
            stats.malformed, stats.bad_channel, stats.stale_replies, stats.unrouted
        );

        ShutdownReport {
            rx_exit,
            cancelled,
            drained,
            stats,
        }
    }
}

impl Drop for Usrp2 {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tolerance when comparing the device's tune split with the local plan
const TUNE_TOLERANCE_HZ: f64 = 1e-3;

fn reconcile_tune(path: &str, requested: f64, planned: TuneResult, echoed: Option<TuneResult>) -> TuneResult {
    let Some(device) = echoed else {
        debug!("{} tune to {} Hz: device echoed no split, using local plan", path, requested);
        return planned;
    };

    let differs = |a: f64, b: f64| (a - b).abs() > TUNE_TOLERANCE_HZ;
    if device.spectrum_inverted != planned.spectrum_inverted
        || differs(device.baseband_freq, planned.baseband_freq)
        || differs(device.dxc_freq, planned.dxc_freq)
        || differs(device.residual_freq, planned.residual_freq)
    {
        warn!(
            "{} tune to {} Hz: device split {:?} differs from local plan {:?}",
            path, requested, device, planned
        );
    }
    device
}
