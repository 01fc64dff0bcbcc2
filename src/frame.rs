//! Frame definitions and runtime CAN frames.
//!
//! [`FrameDefinition`] describes a frame on the bus: id, payload length and
//! the signals laid out inside it. [`CanFrame`] is a frame with data, plus
//! the 16-byte SocketCAN wire representation used by the kernel interfaces.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use embedded_can::{ExtendedId, Id, StandardId};

use crate::codec::PAYLOAD_BYTES;
use crate::errors::CanError;
use crate::overview;
use crate::signal::SignalDefinition;

/// Flag bit marking a 29-bit (extended format) id on the wire.
pub(crate) const EFF_FLAG: u32 = libc::CAN_EFF_FLAG;
/// Flag bit marking a remote transmission request.
pub(crate) const RTR_FLAG: u32 = libc::CAN_RTR_FLAG;
/// Flag bit marking an error frame.
pub(crate) const ERR_FLAG: u32 = libc::CAN_ERR_FLAG;

/// Length of a classic CAN frame as read from / written to a CAN socket.
pub(crate) const WIRE_FRAME_LEN: usize = 16;

/// Longest cycle or throttle time expressible in a KCD file, in milliseconds.
pub const MAX_CYCLE_TIME_MS: u32 = 60_000;

/// The kernel-facing id word: raw id plus the extended-format flag bit.
pub(crate) fn canid(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw() | EFF_FLAG,
    }
}

/// Inverse of [`canid`]; RTR/error flag bits are not accepted here.
pub(crate) fn id_from_canid(raw: u32) -> Result<Id, CanError> {
    if raw & EFF_FLAG != 0 {
        ExtendedId::new(raw & libc::CAN_EFF_MASK)
            .map(Id::Extended)
            .ok_or_else(|| CanError::Config(format!("invalid extended frame id {raw:#x}")))
    } else {
        StandardId::new((raw & libc::CAN_SFF_MASK) as u16)
            .map(Id::Standard)
            .ok_or_else(|| CanError::Config(format!("invalid standard frame id {raw:#x}")))
    }
}

/// Definition of one CAN frame: id, transmitted length, producers and the
/// signals packed into its payload. Holds no data.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDefinition {
    id: Id,
    name: String,
    dlc: u8,
    cycle_time_ms: Option<u32>,
    throttle_time_ms: Option<u32>,
    receive_on_change_only: bool,
    producer_node_ids: BTreeSet<String>,
    signals: Vec<SignalDefinition>,
}

impl FrameDefinition {
    /// Create an empty frame definition. The DLC must be in `1..=8`.
    pub fn new(id: Id, name: impl Into<String>, dlc: u8) -> Result<Self, CanError> {
        if dlc == 0 || dlc as usize > PAYLOAD_BYTES {
            return Err(CanError::Config(format!("frame DLC {dlc} outside 1..=8")));
        }
        Ok(FrameDefinition {
            id,
            name: name.into(),
            dlc,
            cycle_time_ms: None,
            throttle_time_ms: None,
            receive_on_change_only: false,
            producer_node_ids: BTreeSet::new(),
            signals: Vec::new(),
        })
    }

    /// Convenience constructor for an 11-bit standard frame id.
    pub fn standard(raw_id: u16, name: impl Into<String>, dlc: u8) -> Result<Self, CanError> {
        let id = StandardId::new(raw_id)
            .ok_or_else(|| CanError::Config(format!("standard frame id {raw_id:#x} above 0x7FF")))?;
        Self::new(Id::Standard(id), name, dlc)
    }

    /// Convenience constructor for a 29-bit extended frame id.
    pub fn extended(raw_id: u32, name: impl Into<String>, dlc: u8) -> Result<Self, CanError> {
        let id = ExtendedId::new(raw_id).ok_or_else(|| {
            CanError::Config(format!("extended frame id {raw_id:#x} above 0x1FFFFFFF"))
        })?;
        Self::new(Id::Extended(id), name, dlc)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// True for 29-bit (extended format) frames.
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn cycle_time_ms(&self) -> Option<u32> {
        self.cycle_time_ms
    }

    /// Periodic transmission interval. `None` disables periodic sending.
    pub fn set_cycle_time_ms(&mut self, cycle_time_ms: Option<u32>) -> Result<(), CanError> {
        self.cycle_time_ms = check_interval("cycle time", cycle_time_ms)?;
        Ok(())
    }

    pub fn throttle_time_ms(&self) -> Option<u32> {
        self.throttle_time_ms
    }

    /// Minimum interval between delivered receptions (BCM throttling).
    pub fn set_throttle_time_ms(&mut self, throttle_time_ms: Option<u32>) -> Result<(), CanError> {
        self.throttle_time_ms = check_interval("throttle time", throttle_time_ms)?;
        Ok(())
    }

    pub fn receive_on_change_only(&self) -> bool {
        self.receive_on_change_only
    }

    /// Deliver this frame only when bits inside one of its signals change
    /// (BCM reception; a data mask is derived from the signal layout).
    pub fn set_receive_on_change_only(&mut self, on: bool) {
        self.receive_on_change_only = on;
    }

    pub fn producer_node_ids(&self) -> &BTreeSet<String> {
        &self.producer_node_ids
    }

    /// Register a node id as a producer of this frame.
    pub fn add_producer(&mut self, node_id: impl Into<String>) {
        self.producer_node_ids.insert(node_id.into());
    }

    pub fn signals(&self) -> &[SignalDefinition] {
        &self.signals
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|signal| signal.name() == name)
    }

    /// Append a signal. Its name must be unique within the frame and its bit
    /// span must fit the configured DLC.
    pub fn add_signal(&mut self, signal: SignalDefinition) -> Result<(), CanError> {
        if self.signal(signal.name()).is_some() {
            return Err(CanError::Config(format!(
                "frame '{}' already has a signal named '{}'",
                self.name,
                signal.name()
            )));
        }
        if signal.min_dlc() > self.dlc {
            return Err(CanError::Config(format!(
                "signal '{}' needs DLC {} but frame '{}' transmits {} bytes",
                signal.name(),
                signal.min_dlc(),
                self.name,
                self.dlc
            )));
        }
        self.signals.push(signal);
        Ok(())
    }

    /// Smallest DLC able to carry every signal of this frame.
    pub fn min_dlc(&self) -> u8 {
        self.signals
            .iter()
            .map(SignalDefinition::min_dlc)
            .max()
            .unwrap_or(0)
    }

    /// Union of all signal spans, as an 8-byte data mask. Used for BCM
    /// change-filtered reception.
    pub fn signal_mask(&self) -> [u8; PAYLOAD_BYTES] {
        let mut mask = [0u8; PAYLOAD_BYTES];
        for signal in &self.signals {
            for (dst, src) in mask.iter_mut().zip(signal.span_mask()) {
                *dst |= src;
            }
        }
        mask
    }

    /// True when one of this frame's producers is among `ego_node_ids`,
    /// i.e. the frame is sent (not received) by this node.
    pub fn is_outbound(&self, ego_node_ids: &BTreeSet<String>) -> bool {
        !self.producer_node_ids.is_disjoint(ego_node_ids)
    }

    /// A fresh payload with every signal set to its default value.
    pub fn default_payload(&self) -> Result<[u8; PAYLOAD_BYTES], CanError> {
        let mut data = [0u8; PAYLOAD_BYTES];
        for signal in &self.signals {
            signal.encode_default_into(&mut data)?;
        }
        Ok(data)
    }

    /// Decode every signal of this frame from a payload.
    pub fn unpack(&self, data: &[u8; PAYLOAD_BYTES]) -> Result<BTreeMap<String, f64>, CanError> {
        let mut values = BTreeMap::new();
        for signal in &self.signals {
            values.insert(signal.name().to_string(), signal.decode_from(data)?);
        }
        Ok(values)
    }

    /// The kernel-facing id word (raw id plus format flag).
    pub(crate) fn canid(&self) -> u32 {
        canid(self.id)
    }

    /// Multi-line overview of the frame and all its signals.
    pub fn descriptive_ascii_art(&self) -> String {
        let mut text = self.summary_line();
        text.push('\n');
        text.push_str("    Signal details:\n");
        text.push_str("    ---------------\n");
        for signal in &self.signals {
            text.push_str("\n\n");
            for line in signal.descriptive_ascii_art().lines() {
                text.push_str("    ");
                text.push_str(line);
                text.push('\n');
            }
        }
        text
    }

    fn summary_line(&self) -> String {
        let format = if self.is_extended() { "extended" } else { "standard" };
        let cycle = match self.cycle_time_ms {
            Some(ms) => format!("cycle time {ms} ms"),
            None => "no cycle time".to_string(),
        };
        let throttle = match self.throttle_time_ms {
            Some(ms) => format!("throttling {ms} ms"),
            None => "no throttling".to_string(),
        };
        format!(
            "Frame id {0} ({0:#05X}, {format}) '{1}', DLC {2}, {cycle}, producers: {3:?}, {throttle}, {4} signals",
            raw_id(self.id),
            self.name,
            self.dlc,
            self.producer_node_ids.iter().collect::<Vec<_>>(),
            self.signals.len(),
        )
    }
}

fn check_interval(label: &str, value: Option<u32>) -> Result<Option<u32>, CanError> {
    match value {
        None => Ok(None),
        Some(0) => Err(CanError::Config(format!("{label} must be positive"))),
        Some(ms) if ms > MAX_CYCLE_TIME_MS => Err(CanError::Config(format!(
            "{label} {ms} ms above the {MAX_CYCLE_TIME_MS} ms limit"
        ))),
        Some(ms) => Ok(Some(ms)),
    }
}

/// Raw id value without format flag.
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

/// A CAN frame with data. Knows nothing about signal layout; that lives in
/// [`FrameDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    dlc: u8,
    data: [u8; PAYLOAD_BYTES],
}

impl CanFrame {
    /// An all-zero frame of `dlc` bytes.
    pub fn new(id: Id, dlc: u8) -> Result<Self, CanError> {
        if dlc as usize > PAYLOAD_BYTES {
            return Err(CanError::Config(format!("frame DLC {dlc} above 8")));
        }
        Ok(CanFrame {
            id,
            dlc,
            data: [0; PAYLOAD_BYTES],
        })
    }

    /// A frame carrying `data` (at most 8 bytes; the DLC is the data length).
    pub fn with_data(id: Id, data: &[u8]) -> Result<Self, CanError> {
        let mut frame = Self::new(id, data.len() as u8)?;
        frame.data[..data.len()].copy_from_slice(data);
        Ok(frame)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The transmitted bytes (`dlc` of them).
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// The full 8-byte payload buffer (bytes past the DLC are zero).
    pub fn payload(&self) -> &[u8; PAYLOAD_BYTES] {
        &self.data
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8; PAYLOAD_BYTES] {
        &mut self.data
    }

    /// Encode one signal's physical value into this frame.
    ///
    /// Fails if the signal does not fit within the frame's DLC.
    pub fn set_signal(&mut self, signal: &SignalDefinition, value: f64) -> Result<(), CanError> {
        if signal.min_dlc() > self.dlc {
            return Err(CanError::Config(format!(
                "signal '{}' needs DLC {} but the frame carries {} bytes",
                signal.name(),
                signal.min_dlc(),
                self.dlc
            )));
        }
        signal.encode_into(&mut self.data, value)
    }

    /// Decode one signal's physical value from this frame.
    pub fn signal_value(&self, signal: &SignalDefinition) -> Result<f64, CanError> {
        signal.decode_from(&self.data)
    }

    /// Serialize to the 16-byte SocketCAN wire layout: id word (native byte
    /// order, bit 31 = extended format), DLC, 3 pad bytes, 8 data bytes.
    pub(crate) fn to_wire(&self) -> [u8; WIRE_FRAME_LEN] {
        let mut wire = [0u8; WIRE_FRAME_LEN];
        wire[0..4].copy_from_slice(&canid(self.id).to_ne_bytes());
        wire[4] = self.dlc;
        wire[8..16].copy_from_slice(&self.data);
        wire
    }

    /// Parse the 16-byte SocketCAN wire layout. RTR and error flag bits are
    /// stripped; remote and error frames are outside this library's scope.
    pub(crate) fn from_wire(wire: &[u8]) -> Result<Self, CanError> {
        if wire.len() != WIRE_FRAME_LEN {
            return Err(CanError::Config(format!(
                "raw CAN frame has wrong length {}",
                wire.len()
            )));
        }
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&wire[0..4]);
        let id_word = u32::from_ne_bytes(id_bytes);
        let id = id_from_canid(id_word & !(RTR_FLAG | ERR_FLAG))?;
        let dlc = wire[4];
        if dlc as usize > PAYLOAD_BYTES {
            return Err(CanError::Config(format!(
                "raw CAN frame carries invalid DLC {dlc}"
            )));
        }
        let mut data = [0u8; PAYLOAD_BYTES];
        data.copy_from_slice(&wire[8..16]);
        // Bytes past the DLC are padding on the wire.
        data[dlc as usize..].fill(0);
        Ok(CanFrame { id, dlc, data })
    }

    /// Multi-line view of the frame data under the bit-number rulers.
    pub fn descriptive_ascii_art(&self) -> String {
        let mut text = format!(
            "CAN frame id {0} ({0:#05X}) {1} bytes: {2}\n",
            raw_id(self.id),
            self.dlc,
            self.data()
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(" "),
        );
        let cells = overview::payload_cells(u64::from_be_bytes(self.data));
        if let Ok(block) = overview::bit_byte_overview(&cells, 4, false) {
            text.push_str(&block);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, ValueType};

    fn test_frame_def() -> FrameDefinition {
        let mut def = FrameDefinition::standard(1, "testmessage", 8).unwrap();
        def.add_signal(SignalDefinition::builder("testsignal1", 56, 1).build().unwrap())
            .unwrap();
        def.add_signal(
            SignalDefinition::builder("testsignal2", 8, 16)
                .byte_order(ByteOrder::Big)
                .build()
                .unwrap(),
        )
        .unwrap();
        def.add_signal(
            SignalDefinition::builder("testsignal3", 24, 16)
                .max_value(1200.0)
                .build()
                .unwrap(),
        )
        .unwrap();
        def.add_signal(
            SignalDefinition::builder("testsignal4", 48, 8)
                .value_type(ValueType::Signed)
                .build()
                .unwrap(),
        )
        .unwrap();
        def
    }

    #[test]
    fn signals_pack_next_to_each_other() {
        let def = test_frame_def();
        let mut frame = CanFrame::new(def.id(), def.dlc()).unwrap();
        frame.set_signal(def.signal("testsignal1").unwrap(), 1.0).unwrap();
        frame.set_signal(def.signal("testsignal2").unwrap(), 16.0).unwrap();
        frame.set_signal(def.signal("testsignal3").unwrap(), 512.0).unwrap();
        assert_eq!(frame.payload(), &[0x00, 0x10, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01]);

        // Overwriting a signal clears only its own span.
        frame.set_signal(def.signal("testsignal2").unwrap(), 0.0).unwrap();
        assert_eq!(frame.payload(), &[0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn clamped_signal_reads_back_clamped() {
        let def = test_frame_def();
        let sig3 = def.signal("testsignal3").unwrap();
        let mut frame = CanFrame::new(def.id(), def.dlc()).unwrap();
        frame.set_signal(sig3, 1500.0).unwrap();
        assert_eq!(frame.signal_value(sig3).unwrap(), 1200.0);
    }

    #[test]
    fn unpack_decodes_every_signal() {
        let def = test_frame_def();
        let values = def
            .unpack(&[0x0F, 0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF, 0x01])
            .unwrap();
        assert_eq!(values["testsignal1"], 1.0);
        assert_eq!(values["testsignal2"], 0x0F00 as f64);
        assert_eq!(values["testsignal3"], 255.0);
        assert_eq!(values["testsignal4"], -1.0);
    }

    #[test]
    fn duplicate_or_oversized_signals_are_rejected() {
        let mut def = test_frame_def();
        assert!(
            def.add_signal(SignalDefinition::builder("testsignal1", 0, 1).build().unwrap())
                .is_err()
        );

        let mut short = FrameDefinition::standard(2, "short", 2).unwrap();
        assert!(
            short
                .add_signal(SignalDefinition::builder("wide", 8, 16).build().unwrap())
                .is_err()
        );
        assert!(
            short
                .add_signal(SignalDefinition::builder("fits", 0, 16).build().unwrap())
                .is_ok()
        );
        assert_eq!(short.min_dlc(), 2);
    }

    #[test]
    fn dlc_limits() {
        assert!(FrameDefinition::standard(1, "x", 0).is_err());
        assert!(FrameDefinition::standard(1, "x", 9).is_err());
        assert!(FrameDefinition::standard(0x800, "x", 8).is_err());
        assert!(FrameDefinition::extended(0x2000_0000, "x", 8).is_err());
    }

    #[test]
    fn outbound_classification() {
        let mut def = FrameDefinition::standard(7, "f", 8).unwrap();
        let ego: BTreeSet<String> = ["node1".to_string()].into();
        assert!(!def.is_outbound(&ego));
        def.add_producer("node2");
        assert!(!def.is_outbound(&ego));
        def.add_producer("node1");
        assert!(def.is_outbound(&ego));
        assert!(!def.is_outbound(&BTreeSet::new()));
    }

    #[test]
    fn signal_mask_is_the_union_of_spans() {
        let def = test_frame_def();
        assert_eq!(
            def.signal_mask(),
            [0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0x00, 0xFF, 0x01]
        );
    }

    #[test]
    fn default_payload_uses_default_values() {
        let mut def = FrameDefinition::standard(3, "f", 8).unwrap();
        def.add_signal(
            SignalDefinition::builder("a", 0, 8)
                .default_value(0x42 as f64)
                .build()
                .unwrap(),
        )
        .unwrap();
        def.add_signal(SignalDefinition::builder("b", 8, 8).build().unwrap())
            .unwrap();
        assert_eq!(def.default_payload().unwrap(), [0x42, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn wire_roundtrip_standard_and_extended() {
        let wire = [
            0x07, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let frame = CanFrame::from_wire(&wire).unwrap();
        assert_eq!(raw_id(frame.id()), 7);
        assert!(!frame.is_extended());
        assert_eq!(frame.dlc(), 8);
        assert_eq!(frame.to_wire(), wire);

        let wire = [
            0x03, 0x00, 0x00, 0x80, 0x06, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let frame = CanFrame::from_wire(&wire).unwrap();
        assert_eq!(raw_id(frame.id()), 3);
        assert!(frame.is_extended());
        assert_eq!(frame.dlc(), 6);
        assert_eq!(frame.to_wire(), wire);
    }

    #[test]
    fn wire_rejects_bad_lengths() {
        assert!(CanFrame::from_wire(&[0u8; 15]).is_err());
        let mut wire = [0u8; 16];
        wire[4] = 9;
        assert!(CanFrame::from_wire(&wire).is_err());
    }

    #[test]
    fn interval_limits() {
        let mut def = FrameDefinition::standard(1, "f", 8).unwrap();
        assert!(def.set_cycle_time_ms(Some(0)).is_err());
        assert!(def.set_cycle_time_ms(Some(60_001)).is_err());
        assert!(def.set_cycle_time_ms(Some(100)).is_ok());
        assert!(def.set_throttle_time_ms(Some(50)).is_ok());
        assert!(def.set_cycle_time_ms(None).is_ok());
    }
}
