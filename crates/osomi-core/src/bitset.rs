//! Fixed-capacity bit array.
//!
//! Storage is rounded up to whole 32-bit words so bulk operators can run a
//! word at a time. Bits are addressed high-bit-first inside each byte, which
//! makes the storage a big-endian bit stream when viewed as bytes.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Not};

use crate::error::{Error, Result};

/// A fixed-size set of bits.
///
/// A bitset built with zero bits is the null bitset; it only exists so that
/// owners can default-construct one before the real size is known.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bitset {
    words: Vec<u32>,
    bits: usize,
}

/// Mutable reference proxy to a single bit.
pub struct BitRef<'a> {
    byte: &'a mut u8,
    mask: u8,
}

impl BitRef<'_> {
    /// Read the bit.
    #[inline]
    pub fn get(&self) -> bool {
        *self.byte & self.mask != 0
    }

    /// Write the bit.
    #[inline]
    pub fn set(&mut self, value: bool) {
        if value {
            *self.byte |= self.mask;
        } else {
            *self.byte &= !self.mask;
        }
    }

    /// Flip the bit and return its new value.
    #[inline]
    pub fn toggle(&mut self) -> bool {
        *self.byte ^= self.mask;
        self.get()
    }
}

impl Bitset {
    /// Create a bitset with `bits` cleared bits.
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(32)],
            bits,
        }
    }

    /// Create a bitset with every bit set to `value`.
    pub fn filled(bits: usize, value: bool) -> Self {
        let mut set = Self::new(bits);
        set.clear(value);
        set
    }

    /// Number of bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits
    }

    /// True when the bitset holds no bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// True for the null bitset.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.words.is_empty()
    }

    /// Size of the backing storage in bytes (always a multiple of 4).
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    /// Raw storage.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Read a bit. Out-of-range reads return `false`.
    #[inline]
    pub fn get(&self, bit: usize) -> bool {
        if bit >= self.bits {
            return false;
        }
        self.as_bytes()[bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    /// Write a bit. Out-of-range writes are ignored.
    #[inline]
    pub fn set(&mut self, bit: usize, value: bool) {
        if let Some(mut r) = self.bit_mut(bit) {
            r.set(value);
        }
    }

    /// Reference proxy for a bit, `None` when out of range.
    pub fn bit_mut(&mut self, bit: usize) -> Option<BitRef<'_>> {
        if bit >= self.bits {
            return None;
        }
        Some(BitRef {
            byte: &mut self.bytes_mut()[bit / 8],
            mask: 0x80 >> (bit % 8),
        })
    }

    /// Set every bit to `value`.
    pub fn clear(&mut self, value: bool) {
        let fill = if value { u32::MAX } else { 0 };
        self.words.fill(fill);
        self.clear_padding();
    }

    /// Invert every bit in place.
    pub fn flip(&mut self) -> &mut Self {
        for word in &mut self.words {
            *word = !*word;
        }
        self.clear_padding();
        self
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of the set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(move |&bit| self.get(bit))
    }

    /// Pack `values` into the bitset, `bits_per_val` bits each, high bit first.
    pub fn write(&mut self, values: &[u32], bits_per_val: u32) -> Result<()> {
        self.check_packing(values.len(), bits_per_val)?;

        let width = bits_per_val as usize;
        for (i, &value) in values.iter().enumerate() {
            for j in 0..width {
                let bit = (value >> (width - 1 - j)) & 1 != 0;
                self.set(i * width + j, bit);
            }
        }

        Ok(())
    }

    /// Unpack `values.len()` values of `bits_per_val` bits each.
    pub fn read(&self, values: &mut [u32], bits_per_val: u32) -> Result<()> {
        self.check_packing(values.len(), bits_per_val)?;

        let width = bits_per_val as usize;
        let mask = if bits_per_val == 32 {
            u32::MAX
        } else {
            (1u32 << bits_per_val) - 1
        };

        for (i, value) in values.iter_mut().enumerate() {
            let offset = i * width;
            let index = offset / 32;
            let local = offset % 32;

            // Words are stored as big-endian byte streams.
            let left = u64::from(u32::from_be(self.words[index]));
            let right = self
                .words
                .get(index + 1)
                .map_or(0, |&w| u64::from(u32::from_be(w)));

            let combined = (left << 32) | right;
            let shift = 64 - local - width;
            *value = (combined >> shift) as u32 & mask;
        }

        Ok(())
    }

    fn check_packing(&self, values: usize, bits_per_val: u32) -> Result<()> {
        if bits_per_val == 0 || bits_per_val > 32 {
            return Err(Error::InvalidWidth(bits_per_val));
        }
        if values * bits_per_val as usize != self.bits {
            return Err(Error::SizeMismatch {
                bits: self.bits,
                values,
                bits_per_val,
            });
        }
        Ok(())
    }

    fn combine(&mut self, other: &Self, op: impl Fn(u32, u32) -> u32) {
        for (i, word) in self.words.iter_mut().enumerate() {
            // Bits the other set doesn't have read as false.
            let rhs = other.words.get(i).copied().unwrap_or(0);
            *word = op(*word, rhs);
        }
        self.clear_padding();
    }

    fn clear_padding(&mut self) {
        let tail = self.bits % 32;
        if tail == 0 {
            return;
        }
        if let Some(last) = self.words.last_mut() {
            let keep = (u32::MAX << (32 - tail)).to_be();
            *last &= keep;
        }
    }
}

impl fmt::Display for Bitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Bitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitset({}; {self})", self.bits)
    }
}

impl BitAndAssign<&Bitset> for Bitset {
    fn bitand_assign(&mut self, rhs: &Bitset) {
        self.combine(rhs, |a, b| a & b);
    }
}

impl BitOrAssign<&Bitset> for Bitset {
    fn bitor_assign(&mut self, rhs: &Bitset) {
        self.combine(rhs, |a, b| a | b);
    }
}

impl BitXorAssign<&Bitset> for Bitset {
    fn bitxor_assign(&mut self, rhs: &Bitset) {
        self.combine(rhs, |a, b| a ^ b);
    }
}

impl BitAndAssign<bool> for Bitset {
    fn bitand_assign(&mut self, rhs: bool) {
        if !rhs {
            self.clear(false);
        }
    }
}

impl BitOrAssign<bool> for Bitset {
    fn bitor_assign(&mut self, rhs: bool) {
        if rhs {
            self.clear(true);
        }
    }
}

impl BitXorAssign<bool> for Bitset {
    fn bitxor_assign(&mut self, rhs: bool) {
        if rhs {
            self.flip();
        }
    }
}

macro_rules! binary_op {
    ($trait:ident, $method:ident, $assign:ident) => {
        impl $trait<&Bitset> for &Bitset {
            type Output = Bitset;

            fn $method(self, rhs: &Bitset) -> Bitset {
                let mut out = self.clone();
                out.$assign(rhs);
                out
            }
        }

        impl $trait<bool> for &Bitset {
            type Output = Bitset;

            fn $method(self, rhs: bool) -> Bitset {
                let mut out = self.clone();
                out.$assign(rhs);
                out
            }
        }
    };
}

binary_op!(BitAnd, bitand, bitand_assign);
binary_op!(BitOr, bitor, bitor_assign);
binary_op!(BitXor, bitxor, bitxor_assign);

impl Not for &Bitset {
    type Output = Bitset;

    fn not(self) -> Bitset {
        let mut out = self.clone();
        out.flip();
        out
    }
}
