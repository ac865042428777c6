//! MSB-first bit packing and the variable-width integer scheme used inside
//! Huffman tables and compound lists.

use crate::error::{CodecError, CodecResult};

/// Chunk widths of the variable-width scheme. Every chunk but the last is
/// followed by a continuation bit.
const VAR_WIDTHS: [u32; 5] = [3, 3, 7, 15, 31];

#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    /// Write the low `width` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, width: u32) {
        for shift in (0..width).rev() {
            self.write_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn write_var(&mut self, mut value: u64) -> CodecResult<()> {
        for (i, &width) in VAR_WIDTHS.iter().enumerate() {
            self.write_bits(value & mask(width), width);
            value >>= width;
            if i + 1 == VAR_WIDTHS.len() {
                break;
            }
            self.write_bit(value != 0);
            if value == 0 {
                return Ok(());
            }
        }
        if value != 0 {
            return Err(CodecError::Invariant(
                "value exceeds variable-width range".into(),
            ));
        }
        Ok(())
    }

    /// Pad to a byte boundary with zero bits and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.bytes.push(self.current << (8 - self.used));
        }
        self.bytes
    }
}

pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_bit(&mut self) -> CodecResult<bool> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| CodecError::Malformed("bit stream overrun".into()))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, width: u32) -> CodecResult<u64> {
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    pub fn read_var(&mut self) -> CodecResult<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        for (i, &width) in VAR_WIDTHS.iter().enumerate() {
            value |= self.read_bits(width)? << shift;
            shift += width;
            if i + 1 == VAR_WIDTHS.len() || !self.read_bit()? {
                break;
            }
        }
        Ok(value)
    }
}

fn mask(width: u32) -> u64 {
    (1u64 << width) - 1
}
