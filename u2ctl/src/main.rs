//! u2ctl - USRP2 Host Control Utility
//!
//! Configures a device, streams one receive channel and reports counters
//! until interrupted.

mod config;

use anyhow::Result;
use clap::Parser;
use common::{ChannelId, MacAddress};
use engine::{EngineError, RxMetadata, RxStop, Usrp2};
use interfaces::emulator::{DeviceEmulator, EmulatorConfig};
use interfaces::loopback;
use interfaces::zmq_transport::{ZmqFrameConfig, ZmqFrameTransport, DEFAULT_HOST_MAC};
use interfaces::FrameTransport;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::U2ctlConfig;

/// USRP2 host control utility
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "u2ctl.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// ZMQ frame tunnel arguments (e.g., "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001")
    #[arg(long, default_value = "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001")]
    device_args: String,

    /// Run against an in-process device emulator instead of the tunnel
    #[arg(long)]
    emulate: bool,

    /// Receive channel (0-31)
    #[arg(long)]
    channel: Option<u8>,

    /// Samples per frame, 0 selects the maximum
    #[arg(long)]
    items_per_frame: Option<usize>,

    /// Receive center frequency in MHz
    #[arg(long)]
    frequency_mhz: Option<f64>,

    /// Receive gain in dB
    #[arg(long)]
    gain: Option<f64>,

    /// Receive decimation factor
    #[arg(long)]
    decim: Option<u32>,

    /// Stop after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print statistics as JSON lines
    #[arg(long)]
    json: bool,

    /// Write a new hardware address to the device before streaming
    #[arg(long)]
    burn_mac: Option<MacAddress>,
}

/// Counters shared with the sample consumer
#[derive(Default)]
struct ConsumerCounters {
    frames: AtomicU64,
    samples: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting u2ctl");
    info!("Configuration file: {}", args.config);

    let mut config = U2ctlConfig::load(Path::new(&args.config))?;
    if let Some(channel) = args.channel {
        config.rx.channel = channel;
    }
    if let Some(items) = args.items_per_frame {
        config.rx.items_per_frame = items;
    }
    if let Some(freq) = args.frequency_mhz {
        config.rx.freq = Some(freq * 1e6);
    }
    if args.gain.is_some() {
        config.rx.gain = args.gain;
    }
    if args.decim.is_some() {
        config.rx.decim = args.decim;
    }

    let channel = ChannelId::new(config.rx.channel)
        .ok_or(EngineError::InvalidChannel(config.rx.channel))?;

    // Bring up the link
    let mut emulator = None;
    let transport: Arc<dyn FrameTransport> = if args.emulate {
        let emulator_config = EmulatorConfig {
            tune: config.engine.tune,
            ..EmulatorConfig::default()
        };
        let (host, device) = loopback::pair(DEFAULT_HOST_MAC, emulator_config.mac);
        emulator = Some(DeviceEmulator::spawn(device, emulator_config)?);
        info!("Using in-process device emulator");
        Arc::new(host)
    } else {
        let zmq_config = ZmqFrameConfig::from_device_args(&args.device_args)?;
        info!("ZMQ configuration:");
        info!("  TX address: {}", zmq_config.tx_address);
        info!("  RX address: {}", zmq_config.rx_address);
        info!("  Host MAC: {}", zmq_config.local_mac);
        Arc::new(ZmqFrameTransport::new(zmq_config)?)
    };

    let usrp = Arc::new(Usrp2::new(transport, config.engine.clone())?);

    info!("Device configuration:");
    info!("  Device MAC: {}", usrp.mac_addr());
    info!("  Channel: {}", channel);
    info!("  Items per frame: {}", config.rx.items_per_frame);
    if let Some(freq) = config.rx.freq {
        info!("  RX frequency: {} MHz", freq / 1e6);
    }

    // Commands block on their reply, keep them off the async workers
    {
        let usrp = usrp.clone();
        let config = config.clone();
        let burn_mac = args.burn_mac;
        tokio::task::spawn_blocking(move || configure(&usrp, &config, burn_mac)).await??;
    }

    usrp.start_rx_streaming(channel, config.rx.items_per_frame)?;
    info!("Streaming started on channel {}", channel);

    let running = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(ConsumerCounters::default());

    let mut consumer_handle = {
        let usrp = usrp.clone();
        let running = running.clone();
        let counters = counters.clone();
        tokio::task::spawn_blocking(move || {
            usrp.rx_samples(channel, |items: &[u32], _: &RxMetadata| {
                counters.frames.fetch_add(1, Ordering::Relaxed);
                counters.samples.fetch_add(items.len() as u64, Ordering::Relaxed);
                running.load(Ordering::Relaxed)
            })
        })
    };

    // Start statistics reporting
    let stats_handle = {
        let usrp = usrp.clone();
        let running = running.clone();
        let counters = counters.clone();
        let period = tokio::time::Duration::from_secs(config.stats.interval_secs.max(1));
        let json = args.json;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            while running.load(Ordering::Relaxed) {
                interval.tick().await;
                report(&usrp, channel, &counters, json);
            }
        })
    };

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(tokio::time::Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    // Wait for shutdown signal
    let mut consumer_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = deadline => {
            info!("Run duration elapsed");
        }
        result = &mut consumer_handle => {
            consumer_done = true;
            match result {
                Ok(Ok(RxStop::StreamStopped)) => warn!("Stream stopped unexpectedly"),
                Ok(Ok(RxStop::HandlerDone)) => {}
                Ok(Err(e)) => error!("Sample consumer failed: {}", e),
                Err(e) => error!("Sample consumer panicked: {}", e),
            }
        }
    }

    // Shutdown
    info!("Shutting down u2ctl");
    running.store(false, Ordering::Relaxed);

    {
        let usrp = usrp.clone();
        let stopped = tokio::task::spawn_blocking(move || usrp.stop_rx_streaming(channel)).await?;
        if let Err(e) = stopped {
            warn!("Error stopping stream: {}", e);
        }
    }

    if !consumer_done {
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), consumer_handle).await;
    }
    stats_handle.abort();

    report(&usrp, channel, &counters, args.json);

    let shutdown = {
        let usrp = usrp.clone();
        tokio::task::spawn_blocking(move || usrp.shutdown()).await?
    };
    info!(
        "Engine stopped: rx loop {:?}, {} commands cancelled, drained {}",
        shutdown.rx_exit, shutdown.cancelled, shutdown.drained
    );

    if let Some(emulator) = emulator {
        emulator.stop();
    }

    info!("u2ctl shutdown complete");
    Ok(())
}

/// Apply gain, tuning and rate settings
fn configure(usrp: &Usrp2, config: &U2ctlConfig, burn_mac: Option<MacAddress>) -> Result<()> {
    if let Some(mac) = burn_mac {
        usrp.burn_mac_addr(mac)?;
        info!("Device address changed to {}", mac);
    }

    if let Some(gain) = config.rx.gain {
        usrp.set_rx_gain(gain)?;
    }
    if let Some(decim) = config.rx.decim {
        usrp.set_rx_decim(decim)?;
    }
    if let Some(freq) = config.rx.freq {
        let tuned = usrp.set_rx_center_freq(freq)?;
        info!("RX tuned:");
        info!("  Baseband: {} MHz", tuned.baseband_freq / 1e6);
        info!("  DXC: {} Hz", tuned.dxc_freq);
        info!("  Residual: {} Hz", tuned.residual_freq);
        info!("  Inverted: {}", tuned.spectrum_inverted);
    }

    if let Some(gain) = config.tx.gain {
        usrp.set_tx_gain(gain)?;
    }
    if let Some(interp) = config.tx.interp {
        usrp.set_tx_interp(interp)?;
    }
    if let Some(freq) = config.tx.freq {
        let tuned = usrp.set_tx_center_freq(freq)?;
        info!("TX tuned to {} MHz", tuned.tuned_freq() / 1e6);
    }

    Ok(())
}

fn report(usrp: &Usrp2, channel: ChannelId, counters: &ConsumerCounters, json: bool) {
    let stats = usrp.rx_stats();
    let channel_stats = usrp.channel_stats(channel);
    let frames = counters.frames.load(Ordering::Relaxed);
    let samples = counters.samples.load(Ordering::Relaxed);

    if json {
        let line = serde_json::json!({
            "consumed_frames": frames,
            "consumed_samples": samples,
            "rx": stats,
            "channel": channel_stats,
        });
        println!("{}", line);
        return;
    }

    info!("RX Statistics:");
    info!("  Consumed frames: {}, samples: {}", frames, samples);
    info!("  Received frames: {}, bytes: {}", stats.frames, stats.bytes);
    info!("  Missing: {}, duplicates: {}, overruns: {}", stats.missing, stats.duplicates, stats.overruns);
    info!(
        "  Malformed: {}, bad channel: {}, stale replies: {}",
        stats.malformed, stats.bad_channel, stats.stale_replies
    );
    info!(
        "  Channel {} ring: {}/{} queued",
        channel, channel_stats.ring.queued, channel_stats.ring.capacity
    );
}
