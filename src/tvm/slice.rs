//! Slice: a fail-fast read cursor over a cell's bits and references.
//!
//! Reads mirror the builder's writes and are consumed left to right. Every
//! read past the end is a typed error, and `end_parse` insists that nothing
//! is left over, so format mismatches surface at the exact offending call.

use std::sync::Arc;

use num_bigint::{BigInt, BigUint};

use crate::tvm::address::Address;
use crate::tvm::bitstring::BitString;
use crate::tvm::cell::Cell;
use crate::tvm::error::{CellError, Result};

/// A read cursor over one cell. Cloning the cursor is cheap and leaves the
/// original position untouched; the underlying cell is shared.
#[derive(Debug, Clone)]
pub struct Slice {
    cell: Arc<Cell>,
    bit_pos: usize,
    ref_pos: usize,
}

impl Slice {
    pub fn new(cell: Arc<Cell>) -> Self {
        Self {
            cell,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len().saturating_sub(self.bit_pos)
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.reference_count().saturating_sub(self.ref_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_bits() == 0 && self.remaining_refs() == 0
    }

    pub fn cell(&self) -> &Arc<Cell> {
        &self.cell
    }

    /// Fails unless every bit and reference has been consumed.
    pub fn end_parse(&self) -> Result<()> {
        if !self.is_empty() {
            return Err(CellError::NotEmpty {
                bits: self.remaining_bits(),
                refs: self.remaining_refs(),
            });
        }
        Ok(())
    }

    /// Loads a single bit.
    pub fn load_bit(&mut self) -> Result<bool> {
        if self.remaining_bits() == 0 {
            return Err(CellError::CellUnderflow("no more bits to read".to_string()));
        }
        let bit = self.cell.bits().get(self.bit_pos)?;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Loads `n` bits into a byte vector, MSB first.
    pub fn load_bits(&mut self, n: usize) -> Result<Vec<u8>> {
        if n > self.remaining_bits() {
            return Err(CellError::CellUnderflow(format!(
                "requested {} bits, {} remaining",
                n,
                self.remaining_bits()
            )));
        }
        let mut out = vec![0u8; (n + 7) / 8];
        for i in 0..n {
            if self.load_bit()? {
                out[i / 8] |= 1 << (7 - i % 8);
            }
        }
        Ok(out)
    }

    /// Loads `n` bits as a constant-time view into the cell's data.
    pub fn load_bitstring(&mut self, n: usize) -> Result<BitString> {
        if n > self.remaining_bits() {
            return Err(CellError::CellUnderflow(format!(
                "requested {} bits, {} remaining",
                n,
                self.remaining_bits()
            )));
        }
        let bits = self.cell.bits().substring(self.bit_pos, n)?;
        self.bit_pos += n;
        Ok(bits)
    }

    pub fn load_byte(&mut self) -> Result<u8> {
        Ok(self.load_bits(8)?[0])
    }

    pub fn load_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.load_bits(n * 8)
    }

    pub fn load_u16(&mut self) -> Result<u16> {
        Ok(self.load_uint(16)? as u16)
    }

    pub fn load_u32(&mut self) -> Result<u32> {
        Ok(self.load_uint(32)? as u32)
    }

    pub fn load_u64(&mut self) -> Result<u64> {
        self.load_uint(64)
    }

    /// Loads an unsigned integer of up to 64 bits, big-endian.
    pub fn load_uint(&mut self, width: usize) -> Result<u64> {
        if width > 64 {
            return Err(CellError::RangeCheck(format!(
                "uint width {} exceeds 64",
                width
            )));
        }
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | self.load_bit()? as u64;
        }
        Ok(value)
    }

    /// Loads a signed two's complement integer of up to 64 bits.
    pub fn load_int(&mut self, width: usize) -> Result<i64> {
        if width == 0 || width > 64 {
            return Err(CellError::RangeCheck(format!(
                "int width {} out of range",
                width
            )));
        }
        let unsigned = self.load_uint(width)?;
        if width == 64 {
            return Ok(unsigned as i64);
        }
        let sign_bit = 1u64 << (width - 1);
        if unsigned & sign_bit != 0 {
            Ok((unsigned | !0u64 << width) as i64)
        } else {
            Ok(unsigned as i64)
        }
    }

    /// Loads an unsigned big integer from a `width`-bit field.
    pub fn load_big_uint(&mut self, width: usize) -> Result<BigUint> {
        let bytes = self.load_bits(width)?;
        let mut value = BigUint::from_bytes_be(&bytes);
        let extra = bytes.len() * 8 - width;
        value >>= extra;
        Ok(value)
    }

    /// Loads a signed big integer from a `width`-bit two's complement field.
    pub fn load_big_int(&mut self, width: usize) -> Result<BigInt> {
        if width == 0 {
            return Err(CellError::RangeCheck("int width 0 is invalid".to_string()));
        }
        let unsigned = self.load_big_uint(width)?;
        let value = BigInt::from(unsigned);
        let bound = BigInt::from(1) << (width - 1);
        if value >= bound {
            Ok(value - (BigInt::from(1) << width))
        } else {
            Ok(value)
        }
    }

    /// Loads a variable-width unsigned integer written by `store_var_uint`.
    pub fn load_var_uint(&mut self, len_bits: usize) -> Result<u64> {
        if len_bits == 0 || len_bits > 8 {
            return Err(CellError::RangeCheck(format!(
                "var uint length field of {} bits out of range",
                len_bits
            )));
        }
        let byte_len = self.load_uint(len_bits)? as usize;
        if byte_len > 8 {
            return Err(CellError::RangeCheck(format!(
                "var uint of {} bytes does not fit into u64",
                byte_len
            )));
        }
        if byte_len == 0 {
            return Ok(0);
        }
        self.load_uint(byte_len * 8)
    }

    /// Loads a variable-width signed integer written by `store_var_int`.
    pub fn load_var_int(&mut self, len_bits: usize) -> Result<i64> {
        if len_bits == 0 || len_bits > 8 {
            return Err(CellError::RangeCheck(format!(
                "var int length field of {} bits out of range",
                len_bits
            )));
        }
        let byte_len = self.load_uint(len_bits)? as usize;
        if byte_len > 8 {
            return Err(CellError::RangeCheck(format!(
                "var int of {} bytes does not fit into i64",
                byte_len
            )));
        }
        if byte_len == 0 {
            return Ok(0);
        }
        self.load_int(byte_len * 8)
    }

    /// Loads a coin amount (VarUInteger 16).
    pub fn load_coins(&mut self) -> Result<u128> {
        let byte_len = self.load_uint(4)? as usize;
        if byte_len == 0 {
            return Ok(0);
        }
        let bytes = self.load_bytes(byte_len)?;
        let mut value = 0u128;
        for byte in bytes {
            value = (value << 8) | byte as u128;
        }
        Ok(value)
    }

    /// Loads an address written by `store_address`.
    pub fn load_address(&mut self) -> Result<Option<Address>> {
        match self.load_uint(2)? {
            0b00 => Ok(None),
            0b10 => {
                if self.load_bit()? {
                    return Err(CellError::AddressFormat(
                        "anycast addresses are not supported".to_string(),
                    ));
                }
                let workchain = self.load_int(8)? as i8;
                let bytes = self.load_bytes(32)?;
                let mut hash_part = [0u8; 32];
                hash_part.copy_from_slice(&bytes);
                Ok(Some(Address::new(workchain, hash_part)))
            }
            tag => Err(CellError::AddressFormat(format!(
                "unsupported address tag {:#04b}",
                tag
            ))),
        }
    }

    /// Loads the next reference, advancing the reference cursor. The
    /// referenced cell is returned as-is, never recursed into.
    pub fn load_ref(&mut self) -> Result<Arc<Cell>> {
        if self.remaining_refs() == 0 {
            return Err(CellError::CellUnderflow(
                "no more references to read".to_string(),
            ));
        }
        let reference = self.cell.reference(self.ref_pos)?;
        self.ref_pos += 1;
        Ok(reference)
    }

    /// Loads a presence bit and, when set, applies `parser`.
    pub fn load_maybe<T, F>(&mut self, parser: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Slice) -> Result<T>,
    {
        if self.load_bit()? {
            parser(self).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Loads a dictionary root: a presence bit guarding a reference.
    pub fn load_dict(&mut self) -> Result<Option<Arc<Cell>>> {
        self.load_maybe(|slice| slice.load_ref())
    }

    pub fn skip_bits(&mut self, n: usize) -> Result<&mut Self> {
        if n > self.remaining_bits() {
            return Err(CellError::CellUnderflow(format!(
                "cannot skip {} bits, {} remaining",
                n,
                self.remaining_bits()
            )));
        }
        self.bit_pos += n;
        Ok(self)
    }

    pub fn skip_refs(&mut self, n: usize) -> Result<&mut Self> {
        if n > self.remaining_refs() {
            return Err(CellError::CellUnderflow(format!(
                "cannot skip {} references, {} remaining",
                n,
                self.remaining_refs()
            )));
        }
        self.ref_pos += n;
        Ok(self)
    }

    /// Loads every remaining bit.
    pub fn load_remaining_bits(&mut self) -> Result<BitString> {
        let remaining = self.remaining_bits();
        self.load_bitstring(remaining)
    }

    /// Loads every remaining reference.
    pub fn load_remaining_refs(&mut self) -> Result<Vec<Arc<Cell>>> {
        let mut refs = Vec::with_capacity(self.remaining_refs());
        while self.remaining_refs() > 0 {
            refs.push(self.load_ref()?);
        }
        Ok(refs)
    }
}

impl From<Arc<Cell>> for Slice {
    fn from(cell: Arc<Cell>) -> Self {
        Self::new(cell)
    }
}
