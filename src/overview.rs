//! Human-readable bit/byte overviews of CAN payloads.
//!
//! The rendering follows a fixed layout that is part of the public interface
//! (snapshot-tested): a "normal" bit-number ruler on top, the 64 payload
//! cells grouped per byte, and optionally a "backward" ruler underneath.

use crate::codec::{self, ByteOrder, PAYLOAD_BITS};
use crate::errors::CanError;

/// Marker for the least significant bit of a signal.
pub const SYMBOL_LSB: char = 'L';
/// Marker for the most significant bit of a signal.
pub const SYMBOL_MSB: char = 'M';
/// Marker for the remaining bits of a signal.
pub const SYMBOL_BIT: char = 'X';

const RULER_NORMAL: [&str; 2] = [
    "         111111   22221111 33222222 33333333 44444444 55555544 66665555",
    "76543210 54321098 32109876 10987654 98765432 76543210 54321098 32109876",
];
const RULER_BYTES: &str = "Byte0    Byte1    Byte2    Byte3    Byte4    Byte5    Byte6    Byte7";
const RULER_BACKWARD: [&str; 2] = [
    "66665555 55555544 44444444 33333333 33222222 22221111 111111",
    "32109876 54321098 76543210 98765432 10987654 32109876 54321098 76543210",
];

/// Index of a bit within the 64-character display string.
///
/// The display runs byte 0 to byte 7 left to right, most significant bit of
/// each byte first, which is exactly the backward numbering read backwards.
fn cell_index(normal_bit: u8) -> Result<usize, CanError> {
    Ok((PAYLOAD_BITS - 1 - codec::backward_bit(normal_bit)?) as usize)
}

/// Lay a ruler block around 64 prepared display cells.
///
/// `cells` must be exactly 64 characters; they are printed grouped in eights.
pub fn bit_byte_overview(
    cells: &str,
    indent: usize,
    show_backward_ruler: bool,
) -> Result<String, CanError> {
    if cells.chars().count() != PAYLOAD_BITS as usize {
        return Err(CanError::Codec(format!(
            "overview cell string has wrong length: {}",
            cells.chars().count()
        )));
    }
    let pad = " ".repeat(indent);
    let grouped = cells
        .chars()
        .collect::<Vec<_>>()
        .chunks(8)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ");

    let mut text = String::new();
    text.push_str(&format!("{pad}{}\n", RULER_NORMAL[0]));
    text.push_str(&format!("{pad}{}\n", RULER_NORMAL[1]));
    text.push_str(&format!("{pad}{RULER_BYTES}\n"));
    text.push_str(&format!("{pad}{grouped}\n"));
    if show_backward_ruler {
        text.push_str(&format!("{pad}{}\n", RULER_BACKWARD[0]));
        text.push_str(&format!("{pad}{}\n", RULER_BACKWARD[1]));
    }
    Ok(text)
}

/// Render a payload value (the 8 bytes read as a big-endian integer) as its
/// 64 binary digits in display order.
pub fn payload_cells(value: u64) -> String {
    format!("{value:064b}")
}

/// Build the 64 display cells for a signal span, marking the most significant
/// bit `M`, the least significant bit `L` and every other occupied bit `X`.
///
/// Returns the cells together with the normal bit number of the span's most
/// significant bit.
pub fn span_cells(
    byte_order: ByteOrder,
    start_bit: u8,
    num_bits: u8,
) -> Result<(String, u8), CanError> {
    codec::check_span(byte_order, start_bit, num_bits)?;
    let mut cells = vec![' '; PAYLOAD_BITS as usize];

    let msb_normal = match byte_order {
        ByteOrder::Little => {
            let stop = start_bit + num_bits - 1;
            cells[cell_index(stop)?] = SYMBOL_MSB;
            cells[cell_index(start_bit)?] = SYMBOL_LSB;
            for bit in start_bit + 1..stop {
                cells[cell_index(bit)?] = SYMBOL_BIT;
            }
            stop
        }
        ByteOrder::Big => {
            let start_backward = codec::backward_bit(start_bit)?;
            let stop_backward = start_backward + num_bits - 1;
            cells[(PAYLOAD_BITS - 1 - stop_backward) as usize] = SYMBOL_MSB;
            cells[(PAYLOAD_BITS - 1 - start_backward) as usize] = SYMBOL_LSB;
            for backward in start_backward + 1..stop_backward {
                cells[(PAYLOAD_BITS - 1 - backward) as usize] = SYMBOL_BIT;
            }
            codec::normal_bit(stop_backward)?
        }
    };

    Ok((cells.into_iter().collect(), msb_normal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_cells_mark_span_ends() {
        // 16-bit signal at start bit 0: M at bit 15 (byte 1 MSB side),
        // L at bit 0 (rightmost cell of byte 0 in display order).
        let (cells, msb) = span_cells(ByteOrder::Little, 0, 16).unwrap();
        assert_eq!(msb, 15);
        assert_eq!(&cells[..8], "XXXXXXXL");
        assert_eq!(&cells[8..16], "MXXXXXXX");
        assert!(cells[16..].chars().all(|c| c == ' '));
    }

    #[test]
    fn single_bit_shows_only_the_lsb_marker() {
        let (cells, msb) = span_cells(ByteOrder::Little, 56, 1).unwrap();
        assert_eq!(msb, 56);
        assert_eq!(cells.chars().filter(|c| *c != ' ').count(), 1);
        // Byte 7 occupies the last display group; bit 56 is its LSB.
        assert_eq!(cells.chars().nth(63), Some(SYMBOL_LSB));
    }

    #[test]
    fn big_endian_cells_walk_toward_byte_zero() {
        let (cells, msb) = span_cells(ByteOrder::Big, 8, 16).unwrap();
        // MSB lands at byte 0 bit 7 (normal bit 7); LSB at byte 1 bit 0.
        assert_eq!(msb, 7);
        assert_eq!(&cells[..8], "MXXXXXXX");
        assert_eq!(&cells[8..16], "XXXXXXXL");
    }

    #[test]
    fn overview_block_has_stable_shape() {
        let text = bit_byte_overview(&payload_cells(1), 4, true).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[2].trim_start().starts_with("Byte0"));
        assert!(lines[3].ends_with("00000001"));
        assert!(bit_byte_overview("too short", 0, false).is_err());
    }
}
