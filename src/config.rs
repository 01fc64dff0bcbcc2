//! Bus configuration: the set of frame definitions plus the ego node ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use embedded_can::Id;

use crate::errors::CanError;
use crate::frame::{FrameDefinition, canid};
use crate::signal::SignalDefinition;

/// Everything that happens on one CAN bus: frame definitions (with their
/// signals), the bus name, and which node ids this process enacts.
///
/// Frames whose producers intersect the ego node ids are *outbound* (this
/// node sends them); all others are *inbound*. Signal names are unique across
/// the whole configuration ([`add_frame`](Configuration::add_frame) rejects
/// duplicates), so a signal name identifies exactly one frame.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Keyed by the kernel-facing id word so iteration order is the
    /// deterministic ascending-id send order.
    frames: BTreeMap<u32, FrameDefinition>,
    ego_node_ids: BTreeSet<String>,
    bus_name: Option<String>,
    /// Derived: signal name → owning frame's id word. Rebuilt on mutation.
    signal_index: HashMap<String, u32>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus_name(&self) -> Option<&str> {
        self.bus_name.as_deref()
    }

    pub fn set_bus_name(&mut self, bus_name: impl Into<String>) {
        self.bus_name = Some(bus_name.into());
    }

    pub fn ego_node_ids(&self) -> &BTreeSet<String> {
        &self.ego_node_ids
    }

    /// Declare which node ids this process enacts.
    pub fn set_ego_node_ids<I, S>(&mut self, node_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ego_node_ids = node_ids.into_iter().map(Into::into).collect();
    }

    /// Number of frame definitions.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Add a frame definition.
    ///
    /// Fails if a frame with the same id already exists, or if any of the
    /// frame's signal names is already used by another frame.
    pub fn add_frame(&mut self, frame: FrameDefinition) -> Result<(), CanError> {
        let key = frame.canid();
        if self.frames.contains_key(&key) {
            return Err(CanError::Config(format!(
                "frame id {:#x} is already defined; remove it first",
                key
            )));
        }
        for signal in frame.signals() {
            if self.signal_index.contains_key(signal.name()) {
                return Err(CanError::Config(format!(
                    "signal name '{}' is already used by another frame",
                    signal.name()
                )));
            }
        }
        for signal in frame.signals() {
            self.signal_index.insert(signal.name().to_string(), key);
        }
        self.frames.insert(key, frame);
        Ok(())
    }

    /// Remove a frame definition (and its signals from the name index).
    pub fn remove_frame(&mut self, id: Id) -> Option<FrameDefinition> {
        let frame = self.frames.remove(&canid(id))?;
        for signal in frame.signals() {
            self.signal_index.remove(signal.name());
        }
        Some(frame)
    }

    pub fn frame(&self, id: Id) -> Option<&FrameDefinition> {
        self.frames.get(&canid(id))
    }

    pub(crate) fn frame_by_canid(&self, key: u32) -> Option<&FrameDefinition> {
        self.frames.get(&key)
    }

    /// All frame definitions, in ascending id-word order.
    pub fn frames(&self) -> impl Iterator<Item = &FrameDefinition> {
        self.frames.values()
    }

    /// Frames this node produces (producers intersect the ego node ids).
    pub fn frames_for_ego(&self) -> impl Iterator<Item = &FrameDefinition> {
        self.frames
            .values()
            .filter(|frame| frame.is_outbound(&self.ego_node_ids))
    }

    /// Frames this node receives (everything not outbound).
    pub fn frames_for_others(&self) -> impl Iterator<Item = &FrameDefinition> {
        self.frames
            .values()
            .filter(|frame| !frame.is_outbound(&self.ego_node_ids))
    }

    /// Locate a signal by name: the owning frame id and its definition.
    pub fn find_signal(&self, name: &str) -> Option<(Id, &SignalDefinition)> {
        let key = *self.signal_index.get(name)?;
        let frame = self.frames.get(&key)?;
        Some((frame.id(), frame.signal(name)?))
    }

    pub(crate) fn frame_canid_of_signal(&self, name: &str) -> Option<u32> {
        self.signal_index.get(name).copied()
    }

    /// Multi-line overview of the whole configuration.
    pub fn descriptive_ascii_art(&self) -> String {
        let mut text = format!(
            "CAN configuration, bus name '{}', {} frame ids defined, ego node ids: {}\n",
            self.bus_name.as_deref().unwrap_or(""),
            self.frames.len(),
            self.ego_node_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        );
        text.push_str("    Frame definitions:\n");
        for frame in self.frames.values() {
            text.push('\n');
            for line in frame.descriptive_ascii_art().lines() {
                text.push_str("    ");
                text.push_str(line);
                text.push('\n');
            }
        }
        text
    }
}
