//! End-to-end tests: the engine driving the device emulator over a loopback link

use common::{ChannelId, MacAddress, TuneParams};
use engine::{EngineConfig, EngineError, RxMetadata, RxStop, TxMetadata, Usrp2};
use num_complex::Complex;
use interfaces::emulator::{DeviceEmulator, EmulatorConfig, DEFAULT_DEVICE_MAC};
use interfaces::loopback;
use interfaces::packet::Opcode;
use num_complex::Complex32;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HOST_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

fn start(emulator_config: EmulatorConfig, config: EngineConfig) -> (Usrp2, DeviceEmulator) {
    let (host, device) = loopback::pair(HOST_MAC, emulator_config.mac);
    let emulator = DeviceEmulator::spawn(device, emulator_config).unwrap();
    let config = EngineConfig {
        device_mac: DEFAULT_DEVICE_MAC,
        ..config
    };
    let usrp = Usrp2::new(Arc::new(host), config).unwrap();
    (usrp, emulator)
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn channel(n: u8) -> ChannelId {
    ChannelId::new(n).unwrap()
}

#[test]
fn test_configuration_commands() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());

    usrp.set_rx_gain(25.5).unwrap();
    usrp.set_tx_gain(-3.0).unwrap();
    usrp.set_rx_decim(16).unwrap();
    usrp.set_tx_interp(32).unwrap();
    usrp.set_rx_scale_iq(1024, -1024).unwrap();
    usrp.set_tx_scale_iq(2000, 2000).unwrap();

    let snapshot = emulator.snapshot();
    assert_eq!(snapshot.rx_gain, 25.5);
    assert_eq!(snapshot.tx_gain, -3.0);
    assert_eq!(snapshot.decim, 16);
    assert_eq!(snapshot.interp, 32);
    assert_eq!(snapshot.rx_scale_iq, (1024, -1024));
    assert_eq!(snapshot.tx_scale_iq, (2000, 2000));
    assert_eq!(snapshot.commands, 6);

    assert_eq!(usrp.rx_decim(), 16);
    assert_eq!(usrp.tx_interp(), 32);
    assert_eq!(usrp.rx_stats().commands_in_flight, 0);
}

#[test]
fn test_tune_scenario() {
    let tune = TuneParams {
        lo_step: 100e6,
        ..TuneParams::default()
    };
    let emulator_config = EmulatorConfig {
        tune,
        ..EmulatorConfig::default()
    };
    let config = EngineConfig {
        tune,
        ..EngineConfig::default()
    };
    let (usrp, emulator) = start(emulator_config, config);

    let result = usrp.set_rx_center_freq(2.44e9).unwrap();
    assert_eq!(result.baseband_freq, 2.4e9);
    assert!((result.dxc_freq - 40e6).abs() < 0.03);
    assert!(result.residual_freq.abs() < 0.03);
    assert!(!result.spectrum_inverted);
    assert!((result.tuned_freq() - 2.44e9).abs() < 1e-6);

    let tx = usrp.set_tx_center_freq(915e6).unwrap();
    assert!((tx.tuned_freq() - 915e6).abs() < 1e-6);
    assert_eq!(emulator.snapshot().tx_tune, Some(tx));
}

#[test]
fn test_out_of_range_tune_rejected_locally() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    assert!(matches!(usrp.set_rx_center_freq(-5.0), Err(EngineError::Tune(_))));
    assert_eq!(emulator.snapshot().commands, 0);
}

#[test]
fn test_stream_and_consume() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    let ch = channel(0);

    assert!(matches!(
        usrp.rx_samples(ch, |_: &[u32], _: &RxMetadata| true),
        Err(EngineError::NotStreaming(_))
    ));

    usrp.start_rx_streaming(ch, 100).unwrap();
    assert!(usrp.is_streaming(ch));
    assert_eq!(emulator.snapshot().streaming, vec![ch]);

    let mut frames = Vec::new();
    let stop = usrp
        .rx_samples(ch, |items: &[u32], md: &RxMetadata| {
            assert_eq!(items.len(), 100);
            frames.push(*md);
            frames.len() < 50
        })
        .unwrap();
    assert_eq!(stop, RxStop::HandlerDone);
    assert_eq!(frames.len(), 50);
    assert!(frames[0].start_of_burst);
    for pair in frames.windows(2) {
        assert_eq!(pair[1].seqno, pair[0].seqno.wrapping_add(1));
        assert_eq!(pair[1].timestamp, pair[0].timestamp + 100);
    }
    assert_eq!(usrp.rx_missing(), 0);

    usrp.stop_rx_streaming(ch).unwrap();
    assert!(!usrp.is_streaming(ch));
    let stop = usrp.rx_samples(ch, |_: &[u32], _: &RxMetadata| true).unwrap();
    assert_eq!(stop, RxStop::StreamStopped);
    assert_eq!(usrp.poll_rx_samples(ch, |_: &[u32], _: &RxMetadata| true).unwrap(), 0);
    assert!(matches!(
        usrp.poll_rx_samples(channel(9), |_: &[u32], _: &RxMetadata| true),
        Err(EngineError::NotStreaming(_))
    ));
}

#[test]
fn test_complex_receive_conversion() {
    let (usrp, _emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    let ch = channel(4);
    usrp.start_rx_streaming(ch, 64).unwrap();

    let mut frames = 0;
    let stop = usrp
        .rx_complex_float(ch, |samples: &[Complex32], _: &RxMetadata| {
            assert_eq!(samples.len(), 64);
            for s in samples {
                assert!((s.norm() - 0.5).abs() < 1e-3);
            }
            frames += 1;
            frames < 5
        })
        .unwrap();
    assert_eq!(stop, RxStop::HandlerDone);

    let mut frames = 0;
    usrp.rx_complex_int16(ch, |samples: &[Complex<i16>], _: &RxMetadata| {
        assert_eq!(samples.len(), 64);
        for s in samples {
            let norm = ((s.re as f64).powi(2) + (s.im as f64).powi(2)).sqrt();
            assert!((norm - 16383.5).abs() < 2.0);
        }
        frames += 1;
        frames < 5
    })
    .unwrap();

    usrp.stop_rx_streaming(ch).unwrap();
    assert_eq!(
        usrp.rx_complex_float(ch, |_: &[Complex32], _: &RxMetadata| true).unwrap(),
        RxStop::StreamStopped
    );
}

#[test]
fn test_wire_loss_counted() {
    let emulator_config = EmulatorConfig {
        drop_every: Some(5),
        ..EmulatorConfig::default()
    };
    let (usrp, _emulator) = start(emulator_config, EngineConfig::default());
    let ch = channel(7);

    usrp.start_rx_streaming(ch, 50).unwrap();
    let mut received = 0;
    usrp.rx_samples(ch, |_: &[u32], _: &RxMetadata| {
        received += 1;
        received < 40
    })
    .unwrap();

    assert!(usrp.rx_missing() >= 8);
    assert_eq!(usrp.rx_overruns(), 0);
    assert!(usrp.channel_stats(ch).sequence.missing_count >= 8);
}

#[test]
fn test_two_channels_are_independent() {
    let (usrp, _emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    let a = channel(1);
    let b = channel(30);
    usrp.start_rx_streaming(a, 10).unwrap();
    usrp.start_rx_streaming(b, 20).unwrap();

    wait_for("frames on both channels", || {
        usrp.channel_stats(a).ring.queued >= 5 && usrp.channel_stats(b).ring.queued >= 5
    });

    let mut sizes_a = Vec::new();
    usrp.poll_rx_samples(a, |items: &[u32], _: &RxMetadata| {
        sizes_a.push(items.len());
        true
    })
    .unwrap();
    let mut sizes_b = Vec::new();
    usrp.poll_rx_samples(b, |items: &[u32], _: &RxMetadata| {
        sizes_b.push(items.len());
        true
    })
    .unwrap();

    assert!(sizes_a.iter().all(|&n| n == 10));
    assert!(sizes_b.iter().all(|&n| n == 20));
    assert!(sizes_a.len() >= 5 && sizes_b.len() >= 5);
}

#[test]
fn test_small_ring_overruns() {
    let config = EngineConfig {
        ring_frames: Some(4),
        ..EngineConfig::default()
    };
    let (usrp, _emulator) = start(EmulatorConfig::default(), config);
    let ch = channel(2);
    usrp.start_rx_streaming(ch, 10).unwrap();

    wait_for("ring overruns", || usrp.rx_overruns() >= 10);
    let stats = usrp.channel_stats(ch);
    assert_eq!(stats.ring.capacity, 4);
    assert_eq!(stats.ring.queued, 4);
    assert_eq!(usrp.rx_missing(), 0);
}

#[test]
fn test_transmit_burst() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    usrp.set_tx_interp(4).unwrap();

    let samples: Vec<Complex32> = (0..1000)
        .map(|i| Complex32::from_polar(0.5, i as f32 * 0.1))
        .collect();
    let frames = usrp
        .tx_complex_float(channel(0), &samples, &TxMetadata::at(10_000))
        .unwrap();
    assert_eq!(frames, 3);

    wait_for("burst at the device", || emulator.snapshot().tx_bursts == 1);
    let snapshot = emulator.snapshot();
    assert_eq!(snapshot.tx_frames, 3);
    assert_eq!(snapshot.tx_items, 1000);
    assert_eq!(snapshot.last_tx_seqno, Some(2));
    assert_eq!(snapshot.last_tx_timestamp, Some(10_000 + 746 * 4));
}

#[test]
fn test_command_timeout_and_recovery() {
    let emulator_config = EmulatorConfig {
        respond: false,
        ..EmulatorConfig::default()
    };
    let config = EngineConfig {
        command_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let (usrp, emulator) = start(emulator_config, config);

    let start = Instant::now();
    assert!(matches!(
        usrp.set_rx_gain(1.0),
        Err(EngineError::Timeout(Opcode::ConfigRx))
    ));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(usrp.rx_stats().commands_in_flight, 0);

    emulator.set_responding(true);
    usrp.set_rx_gain(2.0).unwrap();
    assert_eq!(emulator.snapshot().rx_gain, 2.0);
}

#[test]
fn test_late_reply_is_stale() {
    let emulator_config = EmulatorConfig {
        reply_delay: Duration::from_millis(100),
        ..EmulatorConfig::default()
    };
    let config = EngineConfig {
        command_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let (usrp, _emulator) = start(emulator_config, config);

    assert!(matches!(usrp.set_tx_gain(1.0), Err(EngineError::Timeout(_))));
    wait_for("late reply", || usrp.rx_stats().stale_replies == 1);
}

#[test]
fn test_burn_mac_addr() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    let new_mac: MacAddress = "00:50:c2:85:3f:42".parse().unwrap();

    assert_eq!(usrp.mac_addr(), DEFAULT_DEVICE_MAC);
    usrp.burn_mac_addr(new_mac).unwrap();
    assert_eq!(usrp.mac_addr(), new_mac);
    assert_eq!(emulator.snapshot().mac, new_mac);

    assert!(matches!(
        usrp.burn_mac_addr(MacAddress::BROADCAST),
        Err(EngineError::InvalidArgument(_))
    ));
    usrp.set_rx_gain(0.0).unwrap();
}

#[test]
fn test_device_rejects_bad_streaming_request() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    assert!(matches!(
        usrp.start_rx_streaming(channel(0), 1000),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(usrp.set_rx_decim(0), Err(EngineError::InvalidArgument(_))));
    assert_eq!(emulator.snapshot().commands, 0);
}

#[test]
fn test_emulator_gone_cancels_and_stops() {
    let (usrp, emulator) = start(EmulatorConfig::default(), EngineConfig::default());
    let ch = channel(3);
    usrp.start_rx_streaming(ch, 10).unwrap();

    emulator.stop();
    let stop = usrp.rx_samples(ch, |_: &[u32], _: &RxMetadata| true).unwrap();
    assert_eq!(stop, RxStop::StreamStopped);
    wait_for("receive loop exit", || !usrp.is_running());
}
