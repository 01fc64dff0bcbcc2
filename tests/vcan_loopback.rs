//! Kernel loopback tests against a real (virtual) CAN interface.
//!
//! These need a CAN interface with loopback enabled, e.g.:
//!
//! ```text
//! sudo ip link add dev vcan0 type vcan
//! sudo ip link set up vcan0
//! CAN_SIGNALS_TEST_IFACE=vcan0 cargo test --test vcan_loopback
//! ```

#![cfg(target_os = "linux")]

use std::time::Duration;

use can_signals::signal::SignalDefinition;
use can_signals::{CanBus, Configuration, FrameDefinition};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

fn iface_name() -> Option<String> {
    std::env::var("CAN_SIGNALS_TEST_IFACE").ok()
}

/// One frame produced by `sender`, carrying two signals.
fn test_config(ego: &str, frame_id: u16, cycle_ms: Option<u32>) -> Configuration {
    let mut frame = FrameDefinition::standard(frame_id, "loopframe", 8).unwrap();
    frame.add_producer("sender");
    if let Some(ms) = cycle_ms {
        frame.set_cycle_time_ms(Some(ms)).unwrap();
    }
    frame
        .add_signal(
            SignalDefinition::builder(format!("speed{frame_id}"), 0, 16)
                .scaling_factor(0.1)
                .build()
                .unwrap(),
        )
        .unwrap();
    frame
        .add_signal(SignalDefinition::builder(format!("flag{frame_id}"), 56, 1).build().unwrap())
        .unwrap();

    let mut config = Configuration::new();
    config.add_frame(frame).unwrap();
    config.set_ego_node_ids([ego]);
    config
}

#[test]
fn raw_send_and_receive_signals() {
    let Some(iface) = iface_name() else {
        eprintln!("skipping: set CAN_SIGNALS_TEST_IFACE to run kernel tests");
        return;
    };

    let mut sender = CanBus::open_raw(test_config("sender", 0x101, None), &iface).unwrap();
    let mut receiver = CanBus::open_raw(test_config("receiver", 0x101, None), &iface).unwrap();
    receiver.init_reception().unwrap();

    sender
        .send_signals([("speed257", 12.5), ("flag257", 1.0)])
        .unwrap();

    let values = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(values["speed257"], 12.5);
    assert_eq!(values["flag257"], 1.0);
}

#[test]
fn raw_subset_send_retains_previous_bits() {
    let Some(iface) = iface_name() else {
        eprintln!("skipping: set CAN_SIGNALS_TEST_IFACE to run kernel tests");
        return;
    };

    let mut sender = CanBus::open_raw(test_config("sender", 0x102, None), &iface).unwrap();
    let mut receiver = CanBus::open_raw(test_config("receiver", 0x102, None), &iface).unwrap();
    receiver.init_reception().unwrap();

    sender
        .send_signals([("speed258", 20.0), ("flag258", 1.0)])
        .unwrap();
    let first = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(first["flag258"], 1.0);

    // Second send names only the speed; the flag keeps its last-sent value.
    sender.send_signals([("speed258", 30.0)]).unwrap();
    let second = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(second["speed258"], 30.0);
    assert_eq!(second["flag258"], 1.0);
}

#[test]
fn raw_receive_times_out_quietly() {
    let Some(iface) = iface_name() else {
        eprintln!("skipping: set CAN_SIGNALS_TEST_IFACE to run kernel tests");
        return;
    };

    let mut receiver = CanBus::open_raw(test_config("receiver", 0x103, None), &iface).unwrap();
    receiver.init_reception().unwrap();
    let err = receiver
        .recv_next_signals(Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn bcm_periodic_transmission_repeats_frames() {
    let Some(iface) = iface_name() else {
        eprintln!("skipping: set CAN_SIGNALS_TEST_IFACE to run kernel tests");
        return;
    };

    let mut sender = CanBus::open_bcm(test_config("sender", 0x104, Some(20)), &iface).unwrap();
    let mut receiver = CanBus::open_raw(test_config("receiver", 0x104, None), &iface).unwrap();
    receiver.init_reception().unwrap();

    // One send starts kernel-side cycling; several frames must arrive.
    sender.send_signals([("speed260", 5.0)]).unwrap();
    for _ in 0..3 {
        let values = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
        assert_eq!(values["speed260"], 5.0);
    }

    // Updating the payload keeps the cycle running with new data.
    sender.send_signals([("speed260", 7.5)]).unwrap();
    let deadline = std::time::Instant::now() + IO_TIMEOUT;
    loop {
        let values = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
        if values["speed260"] == 7.5 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "payload update never reached the bus"
        );
    }

    sender.stop().unwrap();
}

#[test]
fn bcm_change_filtered_reception() {
    let Some(iface) = iface_name() else {
        eprintln!("skipping: set CAN_SIGNALS_TEST_IFACE to run kernel tests");
        return;
    };

    let mut receiver_config = test_config("receiver", 0x105, None);
    // Only deliver when signal bits change.
    let id = receiver_config.frames().next().unwrap().id();
    {
        let frame = receiver_config.remove_frame(id).unwrap();
        let mut frame = frame;
        frame.set_receive_on_change_only(true);
        receiver_config.add_frame(frame).unwrap();
    }
    let mut receiver = CanBus::open_bcm(receiver_config, &iface).unwrap();
    receiver.init_reception().unwrap();

    let mut sender = CanBus::open_raw(test_config("sender", 0x105, None), &iface).unwrap();

    sender.send_signals([("speed261", 1.0)]).unwrap();
    let first = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(first["speed261"], 1.0);

    // The same payload again must not be delivered; a changed one must.
    sender.send_signals([("speed261", 1.0)]).unwrap();
    sender.send_signals([("speed261", 2.0)]).unwrap();
    let next = receiver.recv_next_signals(Some(IO_TIMEOUT)).unwrap();
    assert_eq!(next["speed261"], 2.0);

    receiver.stop().unwrap();
}
