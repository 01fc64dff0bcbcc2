//! Receive and print the signals sent by the `send_signals` demo.
//!
//! ```text
//! cargo run --example receive_signals -- vcan0
//! ```

use std::time::Duration;

use can_signals::signal::SignalDefinition;
use can_signals::{CanBus, CanError, Configuration, FrameDefinition};

fn build_config() -> Result<Configuration, CanError> {
    let mut frame = FrameDefinition::standard(0x0A, "drive_status", 8)?;
    frame.add_producer("demo_node");
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
    // No ego node ids: every configured frame is inbound.
    Ok(config)
}

fn main() -> Result<(), CanError> {
    let interface = std::env::args().nth(1).unwrap_or_else(|| "vcan0".into());

    let mut bus = CanBus::open_raw(build_config()?, &interface)?;
    bus.init_reception()?;

    loop {
        match bus.recv_next_signals(Some(Duration::from_secs(5))) {
            Ok(values) => {
                for (name, value) in &values {
                    println!("{name} = {value}");
                }
            }
            Err(CanError::Timeout) => println!("no frames for 5 s"),
            Err(err) => return Err(err),
        }
    }
}
