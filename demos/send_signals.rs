//! Periodically send two signals on a CAN interface.
//!
//! ```text
//! cargo run --example send_signals -- vcan0
//! ```

use std::time::Duration;

use can_signals::signal::SignalDefinition;
use can_signals::{CanBus, CanError, Configuration, FrameDefinition};

fn build_config() -> Result<Configuration, CanError> {
    let mut frame = FrameDefinition::standard(0x0A, "drive_status", 8)?;
    frame.add_producer("demo_node");
    frame.set_cycle_time_ms(Some(100))?;
    frame.add_signal(
        SignalDefinition::builder("vehicle_speed", 0, 16)
            .scaling_factor(0.01)
            .unit("m/s")
            .build()?,
    )?;
    frame.add_signal(SignalDefinition::builder("park_brake", 56, 1).build()?)?;

    let mut config = Configuration::new();
    config.set_bus_name("Demobus");
    config.add_frame(frame)?;
    config.set_ego_node_ids(["demo_node"]);
    Ok(config)
}

fn main() -> Result<(), CanError> {
    let interface = std::env::args().nth(1).unwrap_or_else(|| "vcan0".into());

    // BCM: the kernel repeats the frame every 100 ms; we only update values.
    let mut bus = CanBus::open_bcm(build_config()?, &interface)?;
    println!("{}", bus.descriptive_ascii_art());

    let mut speed = 0.0;
    loop {
        bus.send_signals([("vehicle_speed", speed), ("park_brake", 0.0)])?;
        println!("sent vehicle_speed = {speed:.2} m/s");
        speed += 1.5;
        std::thread::sleep(Duration::from_secs(1));
    }
}
