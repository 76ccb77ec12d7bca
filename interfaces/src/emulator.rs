//! Device Emulator
//!
//! A software stand-in for the radio: answers config and streaming commands
//! over any [`FrameTransport`] and streams a test tone on every channel that
//! has been started. Used by integration tests and by the CLI's emulate mode.

use crate::copiers::copy_host_32fc_to_u2_16sc;
use crate::packet::{
    encode_data_frame, Command, ControlPacket, EthHeader, FrameFlags, Opcode, Packet, RadioConfig,
    Reply, MAX_ITEMS_PER_FRAME,
};
use crate::transport::FrameTransport;
use crate::InterfaceError;
use common::tuning::{plan_tune, TuneParams};
use common::{ChannelId, MacAddress, TuneResult, NUM_CHANNELS};
use crossbeam::channel::{self, Sender, TryRecvError};
use num_complex::Complex32;
use parking_lot::Mutex;
use serde::Serialize;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default emulated device address
pub const DEFAULT_DEVICE_MAC: MacAddress = MacAddress([0x00, 0x50, 0xc2, 0x85, 0x30, 0x01]);

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Device hardware address
    pub mac: MacAddress,
    /// Tuning parameters of the emulated front end
    pub tune: TuneParams,
    /// Answer commands at all
    pub respond: bool,
    /// Delay before each reply
    pub reply_delay: Duration,
    /// Streaming period
    pub tick: Duration,
    /// Data frames emitted per streaming channel per tick
    pub frames_per_tick: usize,
    /// Consume the sequence number of every Nth data frame without sending it
    pub drop_every: Option<u32>,
    /// Test tone frequency as a fraction of the sample rate
    pub tone: f64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            mac: DEFAULT_DEVICE_MAC,
            tune: TuneParams::default(),
            respond: true,
            reply_delay: Duration::ZERO,
            tick: Duration::from_millis(1),
            frames_per_tick: 1,
            drop_every: None,
            tone: 0.01,
        }
    }
}

/// Settings and counters observed by the emulator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmulatorSnapshot {
    pub mac: MacAddress,
    pub rx_gain: f64,
    pub tx_gain: f64,
    pub rx_tune: Option<TuneResult>,
    pub tx_tune: Option<TuneResult>,
    pub decim: u32,
    pub interp: u32,
    pub rx_scale_iq: (i16, i16),
    pub tx_scale_iq: (i16, i16),
    pub streaming: Vec<ChannelId>,
    pub commands: u64,
    pub data_frames_sent: u64,
    pub tx_frames: u64,
    pub tx_items: u64,
    pub tx_bursts: u64,
    pub last_tx_seqno: Option<u8>,
    pub last_tx_timestamp: Option<u32>,
    pub malformed: u64,
}

struct Shared {
    snapshot: EmulatorSnapshot,
    respond: bool,
}

struct StreamState {
    items_per_frame: usize,
    seqno: u8,
    timestamp: u32,
    phase: f64,
    emitted: u64,
}

/// Running emulator; stops when dropped
pub struct DeviceEmulator {
    shared: Arc<Mutex<Shared>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceEmulator {
    /// Start the emulator on its own thread
    pub fn spawn<T: FrameTransport + 'static>(
        transport: T,
        config: EmulatorConfig,
    ) -> Result<Self, InterfaceError> {
        let shared = Arc::new(Mutex::new(Shared {
            snapshot: EmulatorSnapshot {
                mac: config.mac,
                decim: 1,
                interp: 1,
                ..EmulatorSnapshot::default()
            },
            respond: config.respond,
        }));
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("u2-emulator".to_string())
            .spawn(move || {
                let mut device = EmulatedDevice::new(transport, config, thread_shared);
                info!("Device emulator started as {}", device.mac());

                let mut next_tick = Instant::now();
                loop {
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }

                    match device.transport.recv_frame(device.config.tick) {
                        Ok(Some(frame)) => device.handle_frame(&frame),
                        Ok(None) => {}
                        Err(InterfaceError::Closed) => {
                            debug!("Emulator transport closed");
                            break;
                        }
                        Err(e) => warn!("Emulator receive error: {}", e),
                    }

                    if Instant::now() >= next_tick {
                        next_tick = Instant::now() + device.config.tick;
                        device.emit_streams();
                    }
                }

                info!("Device emulator stopped");
            })
            .map_err(|e| InterfaceError::InitializationFailed(format!("emulator thread: {}", e)))?;

        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Current settings and counters
    pub fn snapshot(&self) -> EmulatorSnapshot {
        self.shared.lock().snapshot.clone()
    }

    /// Enable or disable command replies
    pub fn set_responding(&self, respond: bool) {
        self.shared.lock().respond = respond;
    }

    /// Stop the emulator thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceEmulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EmulatedDevice<T> {
    transport: T,
    config: EmulatorConfig,
    shared: Arc<Mutex<Shared>>,
    host: Option<MacAddress>,
    control_seqno: u8,
    streams: Vec<Option<StreamState>>,
}

impl<T: FrameTransport> EmulatedDevice<T> {
    fn new(transport: T, config: EmulatorConfig, shared: Arc<Mutex<Shared>>) -> Self {
        Self {
            transport,
            config,
            shared,
            host: None,
            control_seqno: 0,
            streams: (0..NUM_CHANNELS).map(|_| None).collect(),
        }
    }

    fn mac(&self) -> MacAddress {
        self.shared.lock().snapshot.mac
    }

    fn handle_frame(&mut self, frame: &bytes::Bytes) {
        match Packet::decode(frame) {
            Packet::Control(packet) => self.handle_control(packet),
            Packet::Data(packet) => {
                let mut shared = self.shared.lock();
                let snapshot = &mut shared.snapshot;
                snapshot.tx_frames += 1;
                snapshot.tx_items += packet.items.len() as u64;
                snapshot.last_tx_seqno = Some(packet.header.seqno);
                snapshot.last_tx_timestamp = Some(packet.header.timestamp);
                if packet.header.flags.contains(FrameFlags::END_OF_BURST) {
                    snapshot.tx_bursts += 1;
                }
            }
            Packet::Malformed(e) => {
                debug!("Emulator dropping malformed frame: {}", e);
                self.shared.lock().snapshot.malformed += 1;
            }
        }
    }

    fn handle_control(&mut self, packet: ControlPacket) {
        let command = match Command::decode(&packet.op) {
            Ok(command) => command,
            Err(e) => {
                debug!("Emulator ignoring control op: {}", e);
                self.shared.lock().snapshot.malformed += 1;
                return;
            }
        };
        debug!("Emulator received {:?} ({})", command, packet.op.rid);
        self.host = Some(packet.eth.src);

        let reply = self.apply(&command);

        let respond = {
            let mut shared = self.shared.lock();
            shared.snapshot.commands += 1;
            shared.respond
        };
        if !respond {
            return;
        }

        if !self.config.reply_delay.is_zero() {
            std::thread::sleep(self.config.reply_delay);
        }

        let eth = EthHeader::new(packet.eth.src, self.mac());
        let frame = reply.encode(&eth, self.control_seqno, packet.op.rid);
        self.control_seqno = self.control_seqno.wrapping_add(1);
        if let Err(e) = self.transport.send_frame(&frame) {
            warn!("Emulator failed to send reply: {}", e);
        }
    }

    fn apply_radio(&self, config: &RadioConfig, rx: bool) -> Reply {
        let opcode = if rx { Opcode::ConfigRx } else { Opcode::ConfigTx };
        let mut ok = true;
        let mut tune = None;

        if let Some(freq) = config.freq {
            match plan_tune(freq, &self.config.tune) {
                Ok(result) => tune = Some(result),
                Err(e) => {
                    debug!("Emulator rejecting tune: {}", e);
                    ok = false;
                }
            }
        }
        if config.rate == Some(0) {
            ok = false;
        }

        if ok {
            let mut shared = self.shared.lock();
            let snapshot = &mut shared.snapshot;
            if rx {
                if let Some(gain) = config.gain {
                    snapshot.rx_gain = gain;
                }
                if tune.is_some() {
                    snapshot.rx_tune = tune;
                }
                if let Some(rate) = config.rate {
                    snapshot.decim = rate;
                }
                if let Some(scale) = config.scale_iq {
                    snapshot.rx_scale_iq = scale;
                }
            } else {
                if let Some(gain) = config.gain {
                    snapshot.tx_gain = gain;
                }
                if tune.is_some() {
                    snapshot.tx_tune = tune;
                }
                if let Some(rate) = config.rate {
                    snapshot.interp = rate;
                }
                if let Some(scale) = config.scale_iq {
                    snapshot.tx_scale_iq = scale;
                }
            }
        }

        Reply { opcode, ok, tune }
    }

    fn apply(&mut self, command: &Command) -> Reply {
        match command {
            Command::ConfigRx(config) => self.apply_radio(config, true),
            Command::ConfigTx(config) => self.apply_radio(config, false),
            Command::StartRxStreaming { channel, items_per_frame } => {
                let items = *items_per_frame as usize;
                let ok = items > 0 && items <= MAX_ITEMS_PER_FRAME;
                if ok {
                    self.streams[channel.index()] = Some(StreamState {
                        items_per_frame: items,
                        seqno: 0,
                        timestamp: 0,
                        phase: 0.0,
                        emitted: 0,
                    });
                    let mut shared = self.shared.lock();
                    if !shared.snapshot.streaming.contains(channel) {
                        shared.snapshot.streaming.push(*channel);
                    }
                }
                Reply::ack(command.opcode(), ok)
            }
            Command::StopRxStreaming { channel } => {
                self.streams[channel.index()] = None;
                self.shared.lock().snapshot.streaming.retain(|c| c != channel);
                Reply::ack(command.opcode(), true)
            }
            Command::BurnMacAddr(mac) => {
                info!("Emulator burning new MAC address {}", mac);
                self.shared.lock().snapshot.mac = *mac;
                Reply::ack(command.opcode(), true)
            }
        }
    }

    fn emit_streams(&mut self) {
        let Some(host) = self.host else {
            return;
        };
        let (mac, decim) = {
            let shared = self.shared.lock();
            (shared.snapshot.mac, shared.snapshot.decim.max(1))
        };
        let eth = EthHeader::new(host, mac);
        let step = TAU * self.config.tone;
        let mut sent = 0u64;

        for (index, slot) in self.streams.iter_mut().enumerate() {
            let Some(stream) = slot.as_mut() else {
                continue;
            };
            let Some(channel) = ChannelId::new(index as u8) else {
                continue;
            };

            for _ in 0..self.config.frames_per_tick {
                let samples: Vec<Complex32> = (0..stream.items_per_frame)
                    .map(|i| {
                        let phase = stream.phase + step * i as f64;
                        Complex32::from_polar(0.5, phase as f32)
                    })
                    .collect();
                stream.phase = (stream.phase + step * stream.items_per_frame as f64) % TAU;

                let flags = if stream.emitted == 0 {
                    FrameFlags::START_OF_BURST
                } else {
                    FrameFlags::empty()
                };
                let seqno = stream.seqno;
                let timestamp = stream.timestamp;
                stream.seqno = stream.seqno.wrapping_add(1);
                stream.timestamp = stream
                    .timestamp
                    .wrapping_add(stream.items_per_frame as u32 * decim);
                stream.emitted += 1;

                let dropped = self
                    .config
                    .drop_every
                    .map_or(false, |n| n > 0 && stream.emitted % n as u64 == 0);
                if dropped {
                    continue;
                }

                let items = copy_host_32fc_to_u2_16sc(&samples);
                let frame = encode_data_frame(&eth, channel, seqno, flags, timestamp, &items);
                match self.transport.send_frame(&frame) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        debug!("Emulator failed to stream {}: {}", channel, e);
                        break;
                    }
                }
            }
        }

        if sent > 0 {
            self.shared.lock().snapshot.data_frames_sent += sent;
        }
    }
}
