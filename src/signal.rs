//! Signal definitions and the physical-value codec.
//!
//! A [`SignalDefinition`] describes where a quantity lives inside a CAN
//! payload (start bit, width, byte order), how its raw bits are interpreted
//! (signedness) and how the raw integer maps to a physical value (linear
//! scaling, offset, optional clamp bounds). Definitions are validated at
//! construction; a successfully built definition can always be applied to an
//! 8-byte payload.

use crate::codec::{self, ByteOrder, ValueType};
use crate::errors::CanError;
use crate::overview;

/// Definition of one signal within a CAN frame (not its value).
///
/// Built through [`SignalDefinition::builder`]. The start bit names the
/// signal's least significant bit in normal bit numbering; see the
/// [`codec`](crate::codec) module docs for the numbering schemes.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    name: String,
    start_bit: u8,
    num_bits: u8,
    byte_order: ByteOrder,
    value_type: ValueType,
    scaling_factor: f64,
    value_offset: f64,
    unit: String,
    min_value: Option<f64>,
    max_value: Option<f64>,
    default_value: f64,
    description: String,
}

/// Builder for [`SignalDefinition`]; validation happens in [`build`](SignalBuilder::build).
#[derive(Debug, Clone)]
pub struct SignalBuilder {
    name: String,
    start_bit: u8,
    num_bits: u8,
    byte_order: ByteOrder,
    value_type: ValueType,
    scaling_factor: f64,
    value_offset: f64,
    unit: String,
    min_value: Option<f64>,
    max_value: Option<f64>,
    default_value: Option<f64>,
    description: String,
}

impl SignalBuilder {
    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Multiply the raw bus value by this factor when decoding. Must be
    /// nonzero and finite.
    pub fn scaling_factor(mut self, scaling_factor: f64) -> Self {
        self.scaling_factor = scaling_factor;
        self
    }

    /// Add this offset when decoding (after scaling).
    pub fn value_offset(mut self, value_offset: f64) -> Self {
        self.value_offset = value_offset;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Lower clamp bound for the decoded physical value.
    pub fn min_value(mut self, min_value: f64) -> Self {
        self.min_value = Some(min_value);
        self
    }

    /// Upper clamp bound for the decoded physical value.
    pub fn max_value(mut self, max_value: f64) -> Self {
        self.max_value = Some(max_value);
        self
    }

    /// Value transmitted when a frame is sent without this signal specified.
    /// Defaults to the value offset.
    pub fn default_value(mut self, default_value: f64) -> Self {
        self.default_value = Some(default_value);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validate the definition.
    pub fn build(self) -> Result<SignalDefinition, CanError> {
        if self.name.is_empty() {
            return Err(CanError::Config("signal name must not be empty".into()));
        }
        codec::check_span(self.byte_order, self.start_bit, self.num_bits).map_err(|err| {
            CanError::Config(format!("signal '{}': {err}", self.name))
        })?;
        if self.value_type == ValueType::Signed && self.num_bits < 2 {
            return Err(CanError::Config(format!(
                "signal '{}': signed signals need at least 2 bits",
                self.name
            )));
        }
        if self.scaling_factor == 0.0 || !self.scaling_factor.is_finite() {
            return Err(CanError::Config(format!(
                "signal '{}': scaling factor must be nonzero and finite",
                self.name
            )));
        }
        if !self.value_offset.is_finite() {
            return Err(CanError::Config(format!(
                "signal '{}': value offset must be finite",
                self.name
            )));
        }

        let signal = SignalDefinition {
            name: self.name,
            start_bit: self.start_bit,
            num_bits: self.num_bits,
            byte_order: self.byte_order,
            value_type: self.value_type,
            scaling_factor: self.scaling_factor,
            value_offset: self.value_offset,
            unit: self.unit,
            min_value: self.min_value,
            max_value: self.max_value,
            default_value: self.default_value.unwrap_or(self.value_offset),
            description: self.description,
        };

        let (lo, hi) = signal.possible_value_range();
        for (label, value) in [
            ("min value", signal.min_value),
            ("max value", signal.max_value),
            ("default value", Some(signal.default_value)),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < lo || value > hi {
                    return Err(CanError::Config(format!(
                        "signal '{}': {label} {value} outside the representable range {lo} to {hi}",
                        signal.name
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (signal.min_value, signal.max_value) {
            if min > max {
                return Err(CanError::Config(format!(
                    "signal '{}': min value {min} above max value {max}",
                    signal.name
                )));
            }
        }
        Ok(signal)
    }
}

impl SignalDefinition {
    /// Start building a signal definition. Defaults: little endian, unsigned,
    /// scaling 1, offset 0, no clamp bounds.
    pub fn builder(name: impl Into<String>, start_bit: u8, num_bits: u8) -> SignalBuilder {
        SignalBuilder {
            name: name.into(),
            start_bit,
            num_bits,
            byte_order: ByteOrder::Little,
            value_type: ValueType::Unsigned,
            scaling_factor: 1.0,
            value_offset: 0.0,
            unit: String::new(),
            min_value: None,
            max_value: None,
            default_value: None,
            description: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_bit(&self) -> u8 {
        self.start_bit
    }

    pub fn num_bits(&self) -> u8 {
        self.num_bits
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    pub fn value_offset(&self) -> f64 {
        self.value_offset
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn min_value(&self) -> Option<f64> {
        self.min_value
    }

    pub fn max_value(&self) -> Option<f64> {
        self.max_value
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Smallest frame DLC able to carry this signal.
    pub fn min_dlc(&self) -> u8 {
        // The span was validated at build time.
        codec::min_dlc(self.byte_order, self.start_bit, self.num_bits).unwrap_or(8)
    }

    /// Physical values representable by the raw field, after scaling and
    /// offset. Clamp bounds narrow this further.
    pub fn possible_value_range(&self) -> (f64, f64) {
        let (raw_lo, raw_hi) = match self.value_type {
            ValueType::Unsigned => (0.0, 2f64.powi(self.num_bits as i32) - 1.0),
            ValueType::Signed => (
                -(2f64.powi(self.num_bits as i32 - 1)),
                2f64.powi(self.num_bits as i32 - 1) - 1.0,
            ),
        };
        let a = raw_lo * self.scaling_factor + self.value_offset;
        let b = raw_hi * self.scaling_factor + self.value_offset;
        // A negative scaling factor flips the interval.
        if a <= b { (a, b) } else { (b, a) }
    }

    /// Raw field limits as integers.
    fn raw_limits(&self) -> (i64, u64) {
        match self.value_type {
            ValueType::Unsigned => {
                let hi = if self.num_bits >= 64 {
                    u64::MAX
                } else {
                    (1u64 << self.num_bits) - 1
                };
                (0, hi)
            }
            ValueType::Signed => {
                if self.num_bits >= 64 {
                    (i64::MIN, i64::MAX as u64)
                } else {
                    let lo = -(1i64 << (self.num_bits - 1));
                    let hi = (1u64 << (self.num_bits - 1)) - 1;
                    (lo, hi)
                }
            }
        }
    }

    /// Clamp a physical value to the configured `[min, max]` bounds.
    fn clamp_physical(&self, mut physical: f64) -> f64 {
        if let Some(min) = self.min_value {
            physical = physical.max(min);
        }
        if let Some(max) = self.max_value {
            physical = physical.min(max);
        }
        physical
    }

    /// Encode a physical value into the payload, preserving all other bits.
    ///
    /// The value is clamped to the `[min, max]` bounds and then to the raw
    /// field's representable range; out-of-range inputs never fail, they
    /// saturate.
    pub fn encode_into(
        &self,
        data: &mut [u8; codec::PAYLOAD_BYTES],
        physical: f64,
    ) -> Result<(), CanError> {
        if !physical.is_finite() {
            return Err(CanError::Codec(format!(
                "signal '{}': cannot encode non-finite value {physical}",
                self.name
            )));
        }
        let physical = self.clamp_physical(physical);
        let scaled = ((physical - self.value_offset) / self.scaling_factor).round();

        let (lo, hi) = self.raw_limits();
        let raw = match self.value_type {
            ValueType::Unsigned => {
                let clamped = scaled.clamp(0.0, hi as f64);
                clamped as u64
            }
            ValueType::Signed => {
                let clamped = scaled.clamp(lo as f64, hi as f64);
                codec::twos_complement(clamped as i64, self.num_bits)
            }
        };
        codec::deposit_bits(data, self.byte_order, self.start_bit, self.num_bits, raw)
    }

    /// Encode the signal's default value into the payload.
    pub fn encode_default_into(&self, data: &mut [u8; codec::PAYLOAD_BYTES]) -> Result<(), CanError> {
        self.encode_into(data, self.default_value)
    }

    /// Decode the signal's physical value from the payload.
    pub fn decode_from(&self, data: &[u8; codec::PAYLOAD_BYTES]) -> Result<f64, CanError> {
        let raw = codec::extract_bits(data, self.byte_order, self.start_bit, self.num_bits)?;
        let unpacked = match self.value_type {
            ValueType::Unsigned => raw as f64,
            ValueType::Signed => codec::sign_extend(raw, self.num_bits) as f64,
        };
        let physical = unpacked * self.scaling_factor + self.value_offset;
        Ok(self.clamp_physical(physical))
    }

    /// Payload mask with ones in every bit position this signal occupies.
    pub fn span_mask(&self) -> [u8; codec::PAYLOAD_BYTES] {
        codec::span_mask(self.byte_order, self.start_bit, self.num_bits).unwrap_or_default()
    }

    /// Multi-line description of the signal including a bit-layout diagram.
    pub fn descriptive_ascii_art(&self) -> String {
        let (cells, msb_normal) = match overview::span_cells(
            self.byte_order,
            self.start_bit,
            self.num_bits,
        ) {
            Ok(parts) => parts,
            Err(_) => return format!("Signal '{}': invalid bit span\n", self.name),
        };
        let endian = match self.byte_order {
            ByteOrder::Little => "little",
            ByteOrder::Big => "big",
        };
        let kind = match self.value_type {
            ValueType::Unsigned => "unsigned",
            ValueType::Signed => "signed",
        };
        let (range_lo, range_hi) = self.possible_value_range();
        let fmt_bound = |bound: Option<f64>| match bound {
            Some(value) => value.to_string(),
            None => "-".to_string(),
        };

        let mut text = format!(
            "Signal '{}': start bit {}, {} bits (min DLC {}), {} endian, {}, scaling {}, unit: {}\n",
            self.name, self.start_bit, self.num_bits, self.min_dlc(), endian, kind,
            self.scaling_factor, self.unit,
        );
        text.push_str(&format!(
            "         offset {} (range {} to {}) min {}, max {}, default {}\n",
            self.value_offset,
            range_lo,
            range_hi,
            fmt_bound(self.min_value),
            fmt_bound(self.max_value),
            self.default_value,
        ));
        if !self.description.is_empty() {
            text.push_str(&format!("         {}\n", self.description));
        }
        text.push('\n');
        text.push_str(&format!(
            "         Start bit normal bit numbering, least significant bit: {}\n",
            self.start_bit
        ));
        text.push_str(&format!(
            "         Start bit normal bit numbering, most significant bit: {msb_normal}\n"
        ));
        let backward_lsb = codec::backward_bit(self.start_bit).unwrap_or_default();
        text.push_str(&format!(
            "         Start bit backward bit numbering, least significant bit: {backward_lsb}\n\n"
        ));
        if let Ok(block) = overview::bit_byte_overview(&cells, 9, true) {
            text.push_str(&block);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(start: u8, bits: u8) -> SignalDefinition {
        SignalDefinition::builder("s", start, bits).build().unwrap()
    }

    #[test]
    fn builder_rejects_bad_geometry() {
        assert!(SignalDefinition::builder("s", 60, 8).build().is_err());
        assert!(SignalDefinition::builder("s", 0, 0).build().is_err());
        assert!(
            SignalDefinition::builder("s", 3, 6)
                .byte_order(ByteOrder::Big)
                .build()
                .is_err()
        );
        assert!(SignalDefinition::builder("", 0, 8).build().is_err());
    }

    #[test]
    fn builder_rejects_narrow_signed_and_zero_scaling() {
        assert!(
            SignalDefinition::builder("s", 0, 1)
                .value_type(ValueType::Signed)
                .build()
                .is_err()
        );
        assert!(
            SignalDefinition::builder("s", 0, 2)
                .value_type(ValueType::Signed)
                .build()
                .is_ok()
        );
        assert!(
            SignalDefinition::builder("s", 0, 8)
                .scaling_factor(0.0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn builder_rejects_bounds_outside_representable_range() {
        assert!(
            SignalDefinition::builder("s", 0, 8)
                .max_value(300.0)
                .build()
                .is_err()
        );
        assert!(
            SignalDefinition::builder("s", 0, 8)
                .default_value(-1.0)
                .build()
                .is_err()
        );
        assert!(
            SignalDefinition::builder("s", 0, 8)
                .min_value(10.0)
                .max_value(5.0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn default_value_falls_back_to_offset() {
        let signal = SignalDefinition::builder("s", 0, 8)
            .scaling_factor(0.5)
            .value_offset(4.0)
            .build()
            .unwrap();
        assert_eq!(signal.default_value(), 4.0);
    }

    #[test]
    fn unsigned_roundtrip_no_scaling() {
        let signal = unsigned(0, 16);
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, 3.0).unwrap();
        assert_eq!(data, [0x03, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(signal.decode_from(&data).unwrap(), 3.0);
    }

    #[test]
    fn single_bit_in_last_byte() {
        let signal = unsigned(56, 1);
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, 1.0).unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0, 0x01]);
        assert_eq!(signal.min_dlc(), 8);
    }

    #[test]
    fn big_endian_signed_near_top() {
        let signal = SignalDefinition::builder("s", 59, 4)
            .byte_order(ByteOrder::Big)
            .value_type(ValueType::Signed)
            .build()
            .unwrap();
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, -2.0).unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0, 0x70]);
        assert_eq!(signal.decode_from(&data).unwrap(), -2.0);
        // Bit 63 lies outside the span and must not disturb the decode.
        let data = [0, 0, 0, 0, 0, 0, 0, 0xF1];
        assert_eq!(signal.decode_from(&data).unwrap(), -2.0);
    }

    #[test]
    fn scaling_offset_and_clamping() {
        let signal = SignalDefinition::builder("s", 0, 8)
            .scaling_factor(0.1)
            .value_offset(-10.0)
            .min_value(-10.0)
            .max_value(10.0)
            .build()
            .unwrap();
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, 2.5).unwrap();
        assert_eq!(data[0], 0x7D);
        assert_eq!(signal.decode_from(&data).unwrap(), 2.5);

        // Above the max bound: clamped to 10.0 before scaling.
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, 50.0).unwrap();
        assert_eq!(data[0], 0xC8);
        assert_eq!(signal.decode_from(&data).unwrap(), 10.0);
    }

    #[test]
    fn raw_clamp_saturates_without_bounds() {
        let signal = unsigned(0, 8);
        let mut data = [0u8; 8];
        signal.encode_into(&mut data, 300.0).unwrap();
        assert_eq!(data[0], 0xFF);
        signal.encode_into(&mut data, -5.0).unwrap();
        assert_eq!(data[0], 0x00);

        let signed = SignalDefinition::builder("s", 48, 8)
            .value_type(ValueType::Signed)
            .build()
            .unwrap();
        let mut data = [0u8; 8];
        signed.encode_into(&mut data, -1.0).unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0xFF, 0]);
        signed.encode_into(&mut data, -128.0).unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0x80, 0]);
        signed.encode_into(&mut data, -4000.0).unwrap();
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0x80, 0]);
    }

    #[test]
    fn encode_rejects_non_finite_values() {
        let signal = unsigned(0, 8);
        let mut data = [0u8; 8];
        assert!(signal.encode_into(&mut data, f64::NAN).is_err());
        assert!(signal.encode_into(&mut data, f64::INFINITY).is_err());
    }

    #[test]
    fn sixty_four_bit_signals() {
        for (order, start_bit) in [(ByteOrder::Little, 0), (ByteOrder::Big, 56)] {
            let signal = SignalDefinition::builder("s", start_bit, 64)
                .byte_order(order)
                .build()
                .unwrap();
            let mut data = [0u8; 8];
            signal.encode_into(&mut data, 1.0).unwrap();
            assert_eq!(signal.decode_from(&data).unwrap(), 1.0);
            assert_eq!(signal.min_dlc(), 8);
        }

        let signed = SignalDefinition::builder("s", 0, 64)
            .value_type(ValueType::Signed)
            .build()
            .unwrap();
        let mut data = [0u8; 8];
        signed.encode_into(&mut data, -1.0).unwrap();
        assert_eq!(data, [0xFF; 8]);
        assert_eq!(signed.decode_from(&data).unwrap(), -1.0);
    }

    #[test]
    fn ascii_art_is_stable() {
        let signal = SignalDefinition::builder("speed", 0, 16).build().unwrap();
        let art = signal.descriptive_ascii_art();
        assert!(art.starts_with(
            "Signal 'speed': start bit 0, 16 bits (min DLC 2), little endian, unsigned"
        ));
        assert!(art.contains("most significant bit: 15"));
        assert!(art.contains("XXXXXXXL MXXXXXXX"));
    }
}
