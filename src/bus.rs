//! The bus facade: a configuration bound to one SocketCAN transport.
//!
//! [`CanBus`] owns the socket exclusively. All periodic transmission and
//! receive-side filtering is executed by the kernel; user code drives the bus
//! from a single thread with blocking calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use embedded_can::Id;
use tracing::debug;

use crate::bcm::BcmInterface;
use crate::config::Configuration;
use crate::errors::CanError;
use crate::frame::CanFrame;
use crate::kcd;
use crate::raw::RawInterface;

/// The transport backend a bus is bound to.
enum CanInterface {
    Raw(RawInterface),
    Bcm(BcmInterface),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    /// The frame has no cycle time; every send transmits once.
    NonPeriodic,
    /// The frame has a cycle time but periodic transmission has not been
    /// handed to the kernel yet.
    PeriodicNotStarted,
    /// The kernel is cycling this frame; sends only update the payload.
    Periodic,
}

/// Retained outbound payloads, keyed by the kernel-facing id word.
///
/// Each outbound frame's payload is built once from the signal defaults and
/// kept for the lifetime of the bus: a send that names only some of a frame's
/// signals overwrites those spans and leaves the previously sent bits of all
/// other signals untouched.
struct TxStore {
    frames: BTreeMap<u32, CanFrame>,
    status: HashMap<u32, TxStatus>,
}

impl TxStore {
    fn from_config(config: &Configuration) -> Result<Self, CanError> {
        let mut frames = BTreeMap::new();
        let mut status = HashMap::new();
        for def in config.frames_for_ego() {
            let mut frame = CanFrame::new(def.id(), def.dlc())?;
            *frame.payload_mut() = def.default_payload()?;
            frames.insert(def.canid(), frame);
            status.insert(
                def.canid(),
                match def.cycle_time_ms() {
                    Some(_) => TxStatus::PeriodicNotStarted,
                    None => TxStatus::NonPeriodic,
                },
            );
        }
        Ok(TxStore { frames, status })
    }

    /// Write one signal value into its frame's retained payload; returns the
    /// frame's id word.
    fn apply(&mut self, config: &Configuration, name: &str, value: f64) -> Result<u32, CanError> {
        let key = config
            .frame_canid_of_signal(name)
            .ok_or_else(|| CanError::UnknownSignal(name.to_string()))?;
        // A signal on an inbound frame cannot be sent from this node.
        let frame = self
            .frames
            .get_mut(&key)
            .ok_or_else(|| CanError::UnknownSignal(name.to_string()))?;
        let signal = config
            .frame_by_canid(key)
            .and_then(|def| def.signal(name))
            .ok_or_else(|| CanError::UnknownSignal(name.to_string()))?;
        frame.set_signal(signal, value)?;
        Ok(key)
    }
}

/// A CAN bus: one [`Configuration`] bound to a RAW or BCM socket.
pub struct CanBus {
    config: Configuration,
    interface: CanInterface,
    tx: TxStore,
}

impl CanBus {
    /// Bind `config` to a RAW socket on `interface`.
    pub fn open_raw(config: Configuration, interface: &str) -> Result<Self, CanError> {
        let tx = TxStore::from_config(&config)?;
        let interface = CanInterface::Raw(RawInterface::open(interface)?);
        Ok(CanBus {
            config,
            interface,
            tx,
        })
    }

    /// Bind `config` to a Broadcast Manager socket on `interface`.
    pub fn open_bcm(config: Configuration, interface: &str) -> Result<Self, CanError> {
        let tx = TxStore::from_config(&config)?;
        let interface = CanInterface::Bcm(BcmInterface::open(interface)?);
        Ok(CanBus {
            config,
            interface,
            tx,
        })
    }

    /// Convenience constructor: read a KCD file, set the ego node ids and
    /// open the bus.
    pub fn from_kcd_file<I, S>(
        path: impl AsRef<Path>,
        interface: &str,
        bus_name: Option<&str>,
        ego_node_ids: I,
        use_bcm: bool,
    ) -> Result<Self, CanError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = kcd::read_file(path, bus_name)?;
        config.set_ego_node_ids(ego_node_ids);
        if use_bcm {
            Self::open_bcm(config, interface)
        } else {
            Self::open_raw(config, interface)
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// True when the bus uses the Broadcast Manager backend.
    pub fn uses_bcm(&self) -> bool {
        matches!(self.interface, CanInterface::Bcm(_))
    }

    /// Name of the bound network interface.
    pub fn interface_name(&self) -> &str {
        match &self.interface {
            CanInterface::Raw(raw) => raw.interface_name(),
            CanInterface::Bcm(bcm) => bcm.interface_name(),
        }
    }

    /// Set up frame reception.
    ///
    /// RAW: installs kernel receive filters for every inbound frame id (an
    /// empty inbound set installs a block-everything filter). BCM:
    /// subscribes to each inbound frame, with the frame's throttle time and,
    /// when `receive_on_change_only` is set, a data mask covering its
    /// signals.
    pub fn init_reception(&mut self) -> Result<(), CanError> {
        match &self.interface {
            CanInterface::Raw(raw) => {
                let ids: Vec<Id> = self.config.frames_for_others().map(|def| def.id()).collect();
                raw.set_receive_filters(&ids)
            }
            CanInterface::Bcm(bcm) => {
                for def in self.config.frames_for_others() {
                    let mask = def.receive_on_change_only().then(|| def.signal_mask());
                    bcm.setup_reception(def.id(), def.throttle_time_ms(), mask)?;
                }
                Ok(())
            }
        }
    }

    /// Send signal values, grouped into their frames.
    ///
    /// Frames are transmitted in ascending id order. Signals of a frame that
    /// are not named keep their previously sent bits (the defaults before the
    /// first send). Naming a signal that is not part of any outbound frame
    /// fails with [`CanError::UnknownSignal`] before anything is transmitted.
    pub fn send_signals<'a, I>(&mut self, signals: I) -> Result<(), CanError>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut touched = BTreeSet::new();
        for (name, value) in signals {
            touched.insert(self.tx.apply(&self.config, name, value)?);
        }
        for key in touched {
            self.transmit(key)?;
        }
        Ok(())
    }

    /// Start kernel-side periodic transmission of every outbound frame, with
    /// the current (initially default) signal values. BCM only; on RAW this
    /// is a no-op.
    pub fn start_sending_all_signals(&mut self) -> Result<(), CanError> {
        if !self.uses_bcm() {
            debug!("start_sending_all_signals is not defined for the RAW backend");
            return Ok(());
        }
        let keys: Vec<u32> = self.tx.frames.keys().copied().collect();
        for key in keys {
            self.transmit(key)?;
        }
        Ok(())
    }

    /// Send one already-assembled frame, bypassing the signal layer.
    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        match &self.interface {
            CanInterface::Raw(raw) => raw.send_frame(frame),
            CanInterface::Bcm(bcm) => bcm.send_frame(frame),
        }
    }

    /// Receive one frame and decode all signals its frame definition names.
    ///
    /// Returns an empty map for frames that are not part of the
    /// configuration. Fails with [`CanError::Timeout`] when `timeout` elapses
    /// first.
    pub fn recv_next_signals(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<String, f64>, CanError> {
        let frame = self.recv_next_frame(timeout)?;
        let Some(def) = self.config.frame(frame.id()) else {
            return Ok(BTreeMap::new());
        };
        if frame.dlc() != def.dlc() {
            return Err(CanError::Config(format!(
                "received frame {:#x} with DLC {}, configured DLC is {}",
                def.canid(),
                frame.dlc(),
                def.dlc()
            )));
        }
        def.unpack(frame.payload())
    }

    /// Receive one frame without decoding it.
    pub fn recv_next_frame(&mut self, timeout: Option<Duration>) -> Result<CanFrame, CanError> {
        match &mut self.interface {
            CanInterface::Raw(raw) => raw.recv_next_frame(timeout),
            CanInterface::Bcm(bcm) => bcm.recv_next_frame(timeout),
        }
    }

    /// Stop kernel-side periodic transmission of all outbound frames (BCM).
    pub fn stop_sending(&mut self) -> Result<(), CanError> {
        let CanInterface::Bcm(bcm) = &self.interface else {
            debug!("stop_sending is not defined for the RAW backend");
            return Ok(());
        };
        for frame in self.tx.frames.values() {
            match bcm.stop_periodic_send(frame.id()) {
                Ok(()) => {}
                Err(CanError::NotFoundByKernel(id)) => {
                    debug!(id, "frame was not registered for periodic transmission");
                }
                Err(err) => return Err(err),
            }
        }
        for status in self.tx.status.values_mut() {
            if *status == TxStatus::Periodic {
                *status = TxStatus::PeriodicNotStarted;
            }
        }
        Ok(())
    }

    /// Unsubscribe from all inbound frames (BCM).
    pub fn stop_reception(&mut self) -> Result<(), CanError> {
        let CanInterface::Bcm(bcm) = &self.interface else {
            debug!("stop_reception is not defined for the RAW backend");
            return Ok(());
        };
        for def in self.config.frames_for_others() {
            match bcm.stop_reception(def.id()) {
                Ok(()) => {}
                Err(CanError::NotFoundByKernel(id)) => {
                    debug!(id, "frame was not subscribed with the kernel");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Stop periodic sending and reception (BCM).
    pub fn stop(&mut self) -> Result<(), CanError> {
        self.stop_sending()?;
        self.stop_reception()
    }

    /// Write the configuration to a KCD file.
    pub fn write_configuration(&self, path: impl AsRef<Path>) -> Result<(), CanError> {
        kcd::write_file(&self.config, path)
    }

    /// Multi-line overview of the bus, its frames and their signals.
    pub fn descriptive_ascii_art(&self) -> String {
        let backend = if self.uses_bcm() { "BCM" } else { "RAW" };
        let mut text = format!(
            "CAN bus '{}' on interface {}, {} frame ids defined, protocol {backend}\n",
            self.config.bus_name().unwrap_or(""),
            self.interface_name(),
            self.config.len(),
        );
        text.push_str("    ");
        for line in self.config.descriptive_ascii_art().lines() {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    /// Hand one frame's retained payload to the transport.
    fn transmit(&mut self, key: u32) -> Result<(), CanError> {
        let Some(frame) = self.tx.frames.get(&key).copied() else {
            return Ok(());
        };
        match &self.interface {
            CanInterface::Raw(raw) => raw.send_frame(&frame),
            CanInterface::Bcm(bcm) => {
                let status = self
                    .tx
                    .status
                    .get(&key)
                    .copied()
                    .unwrap_or(TxStatus::NonPeriodic);
                match status {
                    TxStatus::NonPeriodic => bcm.send_frame(&frame),
                    TxStatus::PeriodicNotStarted => {
                        let cycle = self
                            .config
                            .frame_by_canid(key)
                            .and_then(|def| def.cycle_time_ms());
                        bcm.setup_periodic_send(&frame, cycle, true)?;
                        self.tx.status.insert(key, TxStatus::Periodic);
                        Ok(())
                    }
                    // The kernel keeps cycling; only refresh the payload.
                    TxStatus::Periodic => bcm.setup_periodic_send(&frame, None, false),
                }
            }
        }
    }
}

impl Drop for CanBus {
    /// Best-effort cleanup: stop every kernel-side periodic transmission
    /// before the socket closes.
    fn drop(&mut self) {
        if let CanInterface::Bcm(bcm) = &self.interface {
            for (key, status) in &self.tx.status {
                if *status == TxStatus::Periodic {
                    if let Some(frame) = self.tx.frames.get(key) {
                        let _ = bcm.stop_periodic_send(frame.id());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDefinition;
    use crate::signal::SignalDefinition;

    fn config_with_outbound_frame() -> Configuration {
        let mut frame = FrameDefinition::standard(7, "out", 8).unwrap();
        frame.add_producer("ego");
        frame
            .add_signal(
                SignalDefinition::builder("a", 0, 8)
                    .default_value(0x11 as f64)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        frame
            .add_signal(
                SignalDefinition::builder("b", 8, 8)
                    .default_value(0x22 as f64)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let mut inbound = FrameDefinition::standard(8, "in", 8).unwrap();
        inbound.add_producer("other");
        inbound
            .add_signal(SignalDefinition::builder("c", 0, 8).build().unwrap())
            .unwrap();

        let mut config = Configuration::new();
        config.add_frame(frame).unwrap();
        config.add_frame(inbound).unwrap();
        config.set_ego_node_ids(["ego"]);
        config
    }

    #[test]
    fn tx_store_starts_from_default_values() {
        let config = config_with_outbound_frame();
        let store = TxStore::from_config(&config).unwrap();
        assert_eq!(store.frames.len(), 1);
        let frame = store.frames.values().next().unwrap();
        assert_eq!(frame.payload(), &[0x11, 0x22, 0, 0, 0, 0, 0, 0]);
        assert_eq!(store.status.values().next(), Some(&TxStatus::NonPeriodic));
    }

    #[test]
    fn partial_sends_retain_previous_bits() {
        let config = config_with_outbound_frame();
        let mut store = TxStore::from_config(&config).unwrap();

        let key = store.apply(&config, "a", 0xAA as f64).unwrap();
        assert_eq!(
            store.frames[&key].payload(),
            &[0xAA, 0x22, 0, 0, 0, 0, 0, 0]
        );

        store.apply(&config, "b", 0xBB as f64).unwrap();
        store.apply(&config, "a", 0x01 as f64).unwrap();
        assert_eq!(
            store.frames[&key].payload(),
            &[0x01, 0xBB, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn unknown_and_inbound_signals_are_rejected() {
        let config = config_with_outbound_frame();
        let mut store = TxStore::from_config(&config).unwrap();
        assert!(matches!(
            store.apply(&config, "missing", 1.0),
            Err(CanError::UnknownSignal(_))
        ));
        // "c" exists but belongs to a frame another node produces.
        assert!(matches!(
            store.apply(&config, "c", 1.0),
            Err(CanError::UnknownSignal(_))
        ));
    }

    #[test]
    fn periodic_frames_start_not_yet_started() {
        let mut config = config_with_outbound_frame();
        let mut periodic = FrameDefinition::standard(9, "cyclic", 8).unwrap();
        periodic.add_producer("ego");
        periodic.set_cycle_time_ms(Some(100)).unwrap();
        periodic
            .add_signal(SignalDefinition::builder("d", 0, 8).build().unwrap())
            .unwrap();
        config.add_frame(periodic).unwrap();

        let store = TxStore::from_config(&config).unwrap();
        assert_eq!(store.status[&9], TxStatus::PeriodicNotStarted);
        assert_eq!(store.status[&7], TxStatus::NonPeriodic);
    }
}
