use super::buffer::{BinaryReader, BinaryWriter};
use crate::error::CodecError;

/// Fixed-width per-field change flags. Writer and reader of a type must agree on
/// the width and the meaning of every bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyBits {
    len: usize,
    bytes: Vec<u8>,
}

impl DirtyBits {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    pub fn all_set(len: usize) -> Self {
        let mut bits = Self::new(len);
        for i in 0..len {
            bits.set(i, true);
        }
        bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize, dirty: bool) {
        assert!(index < self.len, "bit {index} out of range {}", self.len);
        let mask = 1u8 << (index % 8);
        if dirty {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bytes[index / 8] & (1u8 << (index % 8)) != 0
    }

    pub fn any(&self) -> bool {
        self.bytes.iter().any(|b| *b != 0)
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn write(&self, w: &mut BinaryWriter) {
        w.write_raw(&self.bytes);
    }

    pub fn read(r: &mut BinaryReader<'_>, len: usize) -> Result<Self, CodecError> {
        let bytes = r.read_raw(len.div_ceil(8))?.to_vec();
        let mut bits = Self { len, bytes };
        // Drop padding bits so equality only sees the tracked fields.
        if len % 8 != 0 {
            if let Some(last) = bits.bytes.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        Ok(bits)
    }
}
