//! Bit extraction over slot bytes.

use std::sync::Arc;

use crate::layout::Layout;
use crate::{Error, Result};

/// Reads bit fields sequentially out of a byte buffer.
///
/// `msb_first` selects which end of each byte the cursor starts at, matching
/// the spacecraft's transmit bit order.
pub(crate) struct BitReader<'a> {
    dat: &'a [u8],
    pos: usize,
    msb_first: bool,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(dat: &'a [u8], msb_first: bool) -> Self {
        BitReader {
            dat,
            pos: 0,
            msb_first,
        }
    }

    /// Take the next `nbits` bits as an integer, or `None` if the buffer is
    /// exhausted. Fields wider than 64 bits are not supported.
    pub(crate) fn take(&mut self, nbits: usize) -> Option<u64> {
        if nbits == 0 || nbits > 64 || self.pos + nbits > self.dat.len() * 8 {
            return None;
        }
        let mut value: u64 = 0;
        for _ in 0..nbits {
            let byte = self.dat[self.pos / 8];
            let shift = if self.msb_first {
                7 - (self.pos % 8)
            } else {
                self.pos % 8
            };
            value = (value << 1) | u64::from((byte >> shift) & 1);
            self.pos += 1;
        }
        Some(value)
    }
}

/// Reverse the byte order of an `nbytes`-wide value.
fn swap_words(value: u64, nbytes: usize) -> u64 {
    let mut out = 0u64;
    for i in 0..nbytes {
        out = (out << 8) | ((value >> (8 * i)) & 0xff);
    }
    out
}

/// Extract every field of `layout` from `dat`.
///
/// Whole-byte fields wider than one byte are reassembled little-endian when
/// `little_endian_words` is set; odd-width fields are taken as transmitted.
///
/// # Errors
/// [`Error::Protocol`] when the layout needs more bits than the slot holds.
pub(crate) fn extract_fields(
    layout: &Arc<Layout>,
    dat: &[u8],
    msb_first: bool,
    little_endian_words: bool,
) -> Result<Vec<u64>> {
    let mut reader = BitReader::new(dat, msb_first);
    let mut values = Vec::with_capacity(layout.fields.len());
    for field in &layout.fields {
        let raw = reader.take(field.bit_length).ok_or_else(|| {
            Error::Protocol(format!(
                "layout {} field {} overruns a {}-byte slot",
                layout.name,
                field.name,
                dat.len()
            ))
        })?;
        let value = if little_endian_words && field.bit_length > 8 && field.bit_length % 8 == 0 {
            swap_words(raw, field.bit_length / 8)
        } else {
            raw
        };
        values.push(value);
    }
    Ok(values)
}
