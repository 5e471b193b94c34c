//! Fixed, little-endian wire types for collective exchanges.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a byte buffer of unknown alignment into owned records.
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    if bytes.len() % size_of::<T>() != 0 {
        return Err(format!(
            "buffer of {} bytes is not a multiple of the {}-byte record size",
            bytes.len(),
            size_of::<T>()
        ));
    }
    let mut out = vec![T::zeroed(); bytes.len() / size_of::<T>()];
    cast_slice_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}

/// Number of records following in a variable-length message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// One matrix entry addressed by global row/column ids.
///
/// Used to ship transposed entries whose row is owned by another rank.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct WireEntry {
    pub row_le: u64,
    pub col_le: u64,
    pub value_bits_le: u64,
}

impl WireEntry {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Self {
            row_le: (row as u64).to_le(),
            col_le: (col as u64).to_le(),
            value_bits_le: value.to_bits().to_le(),
        }
    }
    pub fn row(&self) -> usize {
        u64::from_le(self.row_le) as usize
    }
    pub fn col(&self) -> usize {
        u64::from_le(self.col_le) as usize
    }
    pub fn value(&self) -> f64 {
        f64::from_bits(u64::from_le(self.value_bits_le))
    }
}

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireEntry>(), 24);
