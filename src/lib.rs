//! `can-signals`: KCD-described CAN signal I/O over Linux SocketCAN.
//!
//! A CAN *frame* carries up to 8 data bytes; the quantities applications care
//! about (speeds, temperatures, switch states) are *signals*: scaled
//! integers occupying a few bits somewhere inside a frame payload. This crate
//! provides:
//!
//! - A declarative configuration model ([`Configuration`], [`FrameDefinition`],
//!   [`SignalDefinition`]) of the frames on a bus and the signals inside them,
//!   readable from and writable to the KCD XML format ([`kcd`]).
//! - A bit-exact signal codec: arbitrary start bit, 1–64 bit width, little- or
//!   big-endian layout, linear scaling, offset and clamping ([`codec`],
//!   [`SignalDefinition`]).
//! - Two SocketCAN transport backends: [`RawInterface`] (per-frame I/O with
//!   kernel receive filters) and [`BcmInterface`] (the kernel Broadcast
//!   Manager: periodic transmission and change-filtered reception without any
//!   user-space timer loop).
//! - A [`CanBus`] facade binding a configuration to one transport, so
//!   applications send and receive *named signal values* instead of raw
//!   payload bytes.
//!
//! # Concepts
//!
//! - **Bit numbering**: signal positions use "normal" (sawtooth) numbering;
//!   bit `n` is bit `n % 8` of byte `n / 8`. The start bit always names the
//!   signal's least significant bit. See the [`codec`] module docs.
//! - **Ego node ids**: a configuration carries the node ids this process
//!   enacts. Frames produced by an ego node are outbound (sent); all others
//!   are inbound (received).
//! - **Retained payloads**: a send may name any subset of a frame's signals.
//!   Unnamed signals keep their previously sent bits; before the first send
//!   each signal starts at its default value.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use can_signals::CanBus;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), can_signals::CanError> {
//! let mut bus = CanBus::from_kcd_file(
//!     "vehicle.kcd",
//!     "can0",
//!     None,          // first bus in the file
//!     ["Mainecu"],   // ego node ids
//!     false,         // RAW backend
//! )?;
//! bus.init_reception()?;
//! bus.send_signals([("VehicleSpeed", 70.3), ("EngineSpeed", 2821.0)])?;
//! let values = bus.recv_next_signals(Some(Duration::from_secs(1)))?;
//! # let _ = values;
//! # Ok(())
//! # }
//! ```
//!
//! The library is blocking and single-threaded: the kernel executes all
//! periodic transmission and receive filtering, and the caller drives one
//! socket from one thread. There are no internal threads and no async
//! runtime.

pub mod bcm;
pub mod bus;
pub mod codec;
pub mod config;
pub mod errors;
pub mod frame;
pub mod kcd;
pub mod overview;
pub mod raw;
pub mod signal;

pub use bcm::{BcmFlags, BcmInterface};
pub use bus::CanBus;
pub use codec::{ByteOrder, ValueType};
pub use config::Configuration;
pub use errors::CanError;
pub use frame::{CanFrame, FrameDefinition, raw_id};
pub use raw::RawInterface;
pub use signal::{SignalBuilder, SignalDefinition};

/// Re-export of the CAN identifier types used throughout the public API.
pub use embedded_can::{ExtendedId, Id, StandardId};
