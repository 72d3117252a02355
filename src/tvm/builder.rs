//! Builder: the mutable, append-only accumulator that finalizes into a Cell.
//!
//! Every store operation checks the 1023-bit / 4-ref limits before touching
//! the buffer, so a failed call leaves the builder exactly as it was.
//! `end_cell` consumes the builder; reusing one after finalization is a
//! compile-time error.

use std::sync::Arc;

use num_bigint::{BigInt, BigUint, Sign};

use crate::tvm::address::Address;
use crate::tvm::bitstring::BitString;
use crate::tvm::cell::{Cell, CellType, MAX_CELL_BITS, MAX_CELL_REFS};
use crate::tvm::error::{CellError, Result};
use crate::tvm::slice::Slice;

/// Accumulates bits and references for a single cell.
pub struct Builder {
    data: Vec<u8>,
    bit_len: usize,
    references: Vec<Arc<Cell>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_len: 0,
            references: Vec::new(),
        }
    }

    /// Bits stored so far.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// References stored so far.
    pub fn ref_count(&self) -> usize {
        self.references.len()
    }

    pub fn available_bits(&self) -> usize {
        MAX_CELL_BITS - self.bit_len
    }

    pub fn available_refs(&self) -> usize {
        MAX_CELL_REFS - self.references.len()
    }

    fn ensure_bits(&self, extra: usize) -> Result<()> {
        if self.bit_len + extra > MAX_CELL_BITS {
            return Err(CellError::CellOverflow(format!(
                "storing {} bits over {} already used would exceed {}",
                extra, self.bit_len, MAX_CELL_BITS
            )));
        }
        Ok(())
    }

    fn ensure_refs(&self, extra: usize) -> Result<()> {
        if self.references.len() + extra > MAX_CELL_REFS {
            return Err(CellError::CellOverflow(format!(
                "storing {} refs over {} already used would exceed {}",
                extra,
                self.references.len(),
                MAX_CELL_REFS
            )));
        }
        Ok(())
    }

    // Appends one bit without a capacity check; callers check first.
    fn push_bit(&mut self, bit: bool) {
        let byte_idx = self.bit_len / 8;
        if byte_idx >= self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte_idx] |= 1 << (7 - self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    /// Stores a single bit.
    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self> {
        self.ensure_bits(1)?;
        self.push_bit(bit);
        Ok(self)
    }

    /// Stores the first `bit_len` bits of `bits`, MSB first.
    pub fn store_bits(&mut self, bits: &[u8], bit_len: usize) -> Result<&mut Self> {
        if bits.len() * 8 < bit_len {
            return Err(CellError::RangeCheck(format!(
                "{} bytes hold fewer than {} bits",
                bits.len(),
                bit_len
            )));
        }
        self.ensure_bits(bit_len)?;
        for i in 0..bit_len {
            let bit = (bits[i / 8] >> (7 - i % 8)) & 1 == 1;
            self.push_bit(bit);
        }
        Ok(self)
    }

    /// Stores the content of a bit string.
    pub fn store_bitstring(&mut self, bits: &BitString) -> Result<&mut Self> {
        self.ensure_bits(bits.len())?;
        for i in 0..bits.len() {
            let bit = bits.get(i)?;
            self.push_bit(bit);
        }
        Ok(self)
    }

    pub fn store_byte(&mut self, byte: u8) -> Result<&mut Self> {
        self.store_bits(&[byte], 8)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        self.store_bits(bytes, bytes.len() * 8)
    }

    pub fn store_u32(&mut self, value: u32) -> Result<&mut Self> {
        self.store_bits(&value.to_be_bytes(), 32)
    }

    pub fn store_u64(&mut self, value: u64) -> Result<&mut Self> {
        self.store_bits(&value.to_be_bytes(), 64)
    }

    /// Stores the low `width` bits of `value`, MSB first; the value must fit.
    pub fn store_uint(&mut self, value: u64, width: usize) -> Result<&mut Self> {
        if width > 64 {
            return Err(CellError::RangeCheck(format!(
                "uint width {} exceeds 64",
                width
            )));
        }
        if width < 64 && value >> width != 0 {
            return Err(CellError::RangeCheck(format!(
                "value {} does not fit into {} bits",
                value, width
            )));
        }
        self.ensure_bits(width)?;
        for i in 0..width {
            self.push_bit(value & (1u64 << (width - 1 - i)) != 0);
        }
        Ok(self)
    }

    /// Stores a signed value in `width`-bit two's complement.
    pub fn store_int(&mut self, value: i64, width: usize) -> Result<&mut Self> {
        if width == 0 || width > 64 {
            return Err(CellError::RangeCheck(format!(
                "int width {} out of range",
                width
            )));
        }
        if width < 64 {
            let bound = 1i64 << (width - 1);
            if value < -bound || value >= bound {
                return Err(CellError::RangeCheck(format!(
                    "value {} does not fit into {} signed bits",
                    value, width
                )));
            }
        }
        let unsigned = if width == 64 {
            value as u64
        } else {
            (value as u64) & ((1u64 << width) - 1)
        };
        self.ensure_bits(width)?;
        for i in 0..width {
            self.push_bit(unsigned & (1u64 << (width - 1 - i)) != 0);
        }
        Ok(self)
    }

    /// Stores an unsigned big integer in a `width`-bit field.
    pub fn store_big_uint(&mut self, value: &BigUint, width: usize) -> Result<&mut Self> {
        if value.bits() as usize > width {
            return Err(CellError::RangeCheck(format!(
                "value of {} bits does not fit into {} bits",
                value.bits(),
                width
            )));
        }
        self.ensure_bits(width)?;
        for i in 0..width {
            self.push_bit(value.bit((width - 1 - i) as u64));
        }
        Ok(self)
    }

    /// Stores a signed big integer in `width`-bit two's complement.
    pub fn store_big_int(&mut self, value: &BigInt, width: usize) -> Result<&mut Self> {
        if width == 0 {
            return Err(CellError::RangeCheck("int width 0 is invalid".to_string()));
        }
        let bound = BigInt::from(1) << (width - 1);
        if *value < -bound.clone() || *value >= bound {
            return Err(CellError::RangeCheck(format!(
                "value does not fit into {} signed bits",
                width
            )));
        }
        let wrapped = if value.sign() == Sign::Minus {
            let modulus = BigInt::from(1) << width;
            (value + modulus)
                .to_biguint()
                .ok_or_else(|| CellError::RangeCheck("two's complement wrap failed".to_string()))?
        } else {
            value
                .to_biguint()
                .ok_or_else(|| CellError::RangeCheck("two's complement wrap failed".to_string()))?
        };
        self.store_big_uint(&wrapped, width)
    }

    /// Stores a variable-width unsigned integer: a `len_bits`-wide byte
    /// count followed by that many value bytes, big-endian.
    pub fn store_var_uint(&mut self, value: u64, len_bits: usize) -> Result<&mut Self> {
        if len_bits == 0 || len_bits > 8 {
            return Err(CellError::RangeCheck(format!(
                "var uint length field of {} bits out of range",
                len_bits
            )));
        }
        if value == 0 {
            return self.store_uint(0, len_bits);
        }
        let byte_len = ((64 - value.leading_zeros()) as usize + 7) / 8;
        if byte_len >= 1 << len_bits {
            return Err(CellError::RangeCheck(format!(
                "{} value bytes do not fit a {}-bit length field",
                byte_len, len_bits
            )));
        }
        self.ensure_bits(len_bits + byte_len * 8)?;
        self.store_uint(byte_len as u64, len_bits)?;
        self.store_uint(value, byte_len * 8)
    }

    /// Stores a variable-width signed integer: a `len_bits`-wide byte count
    /// followed by that many bytes of two's complement value.
    pub fn store_var_int(&mut self, value: i64, len_bits: usize) -> Result<&mut Self> {
        if len_bits == 0 || len_bits > 8 {
            return Err(CellError::RangeCheck(format!(
                "var int length field of {} bits out of range",
                len_bits
            )));
        }
        if value == 0 {
            return self.store_uint(0, len_bits);
        }
        let mut byte_len = 1;
        while byte_len < 8 {
            let bound = 1i64 << (byte_len * 8 - 1);
            if value >= -bound && value < bound {
                break;
            }
            byte_len += 1;
        }
        if byte_len >= 1 << len_bits {
            return Err(CellError::RangeCheck(format!(
                "{} value bytes do not fit a {}-bit length field",
                byte_len, len_bits
            )));
        }
        self.ensure_bits(len_bits + byte_len * 8)?;
        self.store_uint(byte_len as u64, len_bits)?;
        self.store_int(value, byte_len * 8)
    }

    /// Stores a coin amount (VarUInteger 16: 4-bit length, up to 15 bytes).
    pub fn store_coins(&mut self, amount: u128) -> Result<&mut Self> {
        if amount == 0 {
            return self.store_uint(0, 4);
        }
        let byte_len = ((128 - amount.leading_zeros()) as usize + 7) / 8;
        if byte_len > 15 {
            return Err(CellError::RangeCheck("coin amount too large".to_string()));
        }
        self.ensure_bits(4 + byte_len * 8)?;
        self.store_uint(byte_len as u64, 4)?;
        let bytes = amount.to_be_bytes();
        self.store_bytes(&bytes[16 - byte_len..])
    }

    /// Stores an address: `addr_none$00` for `None`, `addr_std$10` with no
    /// anycast otherwise.
    pub fn store_address(&mut self, address: Option<&Address>) -> Result<&mut Self> {
        match address {
            None => self.store_uint(0, 2),
            Some(addr) => {
                self.ensure_bits(2 + 1 + 8 + 256)?;
                self.store_uint(0b10, 2)?;
                self.store_bit(false)?;
                self.store_int(addr.workchain as i64, 8)?;
                self.store_bytes(&addr.hash_part)
            }
        }
    }

    /// Stores a reference to another cell.
    pub fn store_ref(&mut self, cell: Arc<Cell>) -> Result<&mut Self> {
        self.ensure_refs(1)?;
        self.references.push(cell);
        Ok(self)
    }

    /// Stores a presence bit, then the reference when it is `Some`.
    pub fn store_maybe_ref(&mut self, cell: Option<Arc<Cell>>) -> Result<&mut Self> {
        match cell {
            Some(cell) => {
                self.ensure_bits(1)?;
                self.ensure_refs(1)?;
                self.store_bit(true)?;
                self.store_ref(cell)
            }
            None => self.store_bit(false),
        }
    }

    /// Stores a dictionary root: a presence bit guarding a reference.
    pub fn store_dict(&mut self, dict: Option<Arc<Cell>>) -> Result<&mut Self> {
        self.store_maybe_ref(dict)
    }

    /// Appends another builder's accumulated bits and references.
    pub fn store_builder(&mut self, other: &Builder) -> Result<&mut Self> {
        self.ensure_bits(other.bit_len)?;
        self.ensure_refs(other.references.len())?;
        self.store_bits(&other.data, other.bit_len)?;
        for reference in &other.references {
            self.references.push(reference.clone());
        }
        Ok(self)
    }

    /// Appends the remaining content of a slice (bits, then references).
    pub fn store_slice(&mut self, slice: &Slice) -> Result<&mut Self> {
        self.ensure_bits(slice.remaining_bits())?;
        self.ensure_refs(slice.remaining_refs())?;
        let mut cursor = slice.clone();
        let remaining = cursor.remaining_bits();
        let bits = cursor.load_bits(remaining)?;
        self.store_bits(&bits, remaining)?;
        while cursor.remaining_refs() > 0 {
            self.references.push(cursor.load_ref()?);
        }
        Ok(self)
    }

    /// Finalizes into an ordinary cell; the builder is consumed.
    pub fn end_cell(self) -> Result<Arc<Cell>> {
        let bits = BitString::from_bytes(self.data, self.bit_len)?;
        Cell::ordinary(bits, self.references)
    }

    /// Finalizes into an exotic cell of the given type; the payload layout
    /// is validated during finalization.
    pub fn end_exotic(self, cell_type: CellType) -> Result<Arc<Cell>> {
        let bits = BitString::from_bytes(self.data, self.bit_len)?;
        Cell::exotic(cell_type, bits, self.references)
    }

    /// Finalizes and opens a read cursor over the result.
    pub fn into_slice(self) -> Result<Slice> {
        Ok(Slice::new(self.end_cell()?))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_basic() {
        let mut builder = Builder::new();
        builder.store_u32(0x12345678).unwrap();
        builder.store_byte(0xFF).unwrap();
        let cell = builder.end_cell().unwrap();
        assert_eq!(cell.bit_len(), 40);
        assert_eq!(cell.data(), vec![0x12, 0x34, 0x56, 0x78, 0xFF]);
    }

    #[test]
    fn test_store_uint_rejects_oversized_value() {
        let mut builder = Builder::new();
        assert!(builder.store_uint(8, 3).is_err());
        assert_eq!(builder.bit_len(), 0);
    }

    #[test]
    fn test_store_int_two_complement() {
        let mut builder = Builder::new();
        builder.store_int(-1, 8).unwrap();
        builder.store_int(-128, 8).unwrap();
        let cell = builder.end_cell().unwrap();
        assert_eq!(cell.data(), vec![0xFF, 0x80]);
    }

    #[test]
    fn test_bit_capacity_leaves_state_unchanged() {
        let mut builder = Builder::new();
        builder.store_bits(&[0xAA; 128], 1023).unwrap();
        let err = builder.store_bit(true);
        assert!(matches!(err, Err(CellError::CellOverflow(_))));
        assert_eq!(builder.bit_len(), 1023);
        assert!(builder.end_cell().is_ok());
    }

    #[test]
    fn test_ref_capacity_leaves_state_unchanged() {
        let leaf = Builder::new().end_cell().unwrap();
        let mut builder = Builder::new();
        for _ in 0..4 {
            builder.store_ref(leaf.clone()).unwrap();
        }
        assert!(matches!(
            builder.store_ref(leaf.clone()),
            Err(CellError::CellOverflow(_))
        ));
        assert_eq!(builder.ref_count(), 4);
    }

    #[test]
    fn test_var_uint_layout() {
        let mut builder = Builder::new();
        builder.store_var_uint(0x01FF, 4).unwrap();
        // 4-bit length 2, then two value bytes.
        let mut slice = builder.into_slice().unwrap();
        assert_eq!(slice.load_uint(4).unwrap(), 2);
        assert_eq!(slice.load_uint(16).unwrap(), 0x01FF);
    }

    #[test]
    fn test_var_int_negative() {
        let mut builder = Builder::new();
        builder.store_var_int(-1, 4).unwrap();
        let mut slice = builder.into_slice().unwrap();
        assert_eq!(slice.load_uint(4).unwrap(), 1);
        assert_eq!(slice.load_int(8).unwrap(), -1);
    }

    #[test]
    fn test_store_big_uint() {
        let value = BigUint::from(0xDEAD_BEEFu32) << 224;
        let mut builder = Builder::new();
        builder.store_big_uint(&value, 256).unwrap();
        let cell = builder.end_cell().unwrap();
        assert_eq!(cell.bit_len(), 256);
        assert_eq!(&cell.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_store_slice_appends_remainder() {
        let mut inner = Builder::new();
        inner.store_u32(0xAABBCCDD).unwrap();
        let mut slice = inner.into_slice().unwrap();
        slice.load_uint(16).unwrap();

        let mut outer = Builder::new();
        outer.store_slice(&slice).unwrap();
        let cell = outer.end_cell().unwrap();
        assert_eq!(cell.bit_len(), 16);
        assert_eq!(cell.data(), vec![0xCC, 0xDD]);
    }
}
