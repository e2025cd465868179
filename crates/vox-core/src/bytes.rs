//! Little-endian byte cursor used for bank parameter blocks and queued
//! command records.
//!
//! Every read is bounds-checked and advances the cursor; a short buffer is a
//! `BankDataTruncated` error, never a panic.

use crate::error::{VoxError, VoxResult};

/// Plain values that can be read from a bank cursor
pub trait BankValue: Sized {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_bank_value {
    ($($ty:ty),*) => {
        $(
            impl BankValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_bank_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct BankReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BankReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read one value and advance
    #[inline]
    pub fn read<T: BankValue>(&mut self) -> VoxResult<T> {
        let bytes = self.take(T::SIZE)?;
        Ok(T::from_le(bytes))
    }

    pub fn read_bool(&mut self) -> VoxResult<bool> {
        Ok(self.read::<u8>()? != 0)
    }

    /// Borrow the next `len` bytes and advance
    pub fn take(&mut self, len: usize) -> VoxResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(VoxError::BankDataTruncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    pub fn skip(&mut self, len: usize) -> VoxResult<()> {
        self.take(len).map(|_| ())
    }

    /// Split off a sub-reader over a block whose size is declared by a `u32`
    /// prefix.
    pub fn read_block(&mut self) -> VoxResult<BankReader<'a>> {
        let size = self.read::<u32>()? as usize;
        let bytes = self.take(size)?;
        Ok(BankReader::new(bytes))
    }

    /// Fail unless the whole block was consumed
    pub fn expect_consumed(&self) -> VoxResult<()> {
        if self.remaining() != 0 {
            return Err(VoxError::BankSizeMismatch {
                declared: self.data.len(),
                consumed: self.pos,
            });
        }
        Ok(())
    }
}

/// Growable little-endian writer, the mirror of [`BankReader`]
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Write a `u32` size prefix followed by the block produced by `f`
    pub fn block(&mut self, f: impl FnOnce(&mut ByteWriter)) -> &mut Self {
        let mut inner = ByteWriter::new();
        f(&mut inner);
        self.u32(inner.buf.len() as u32);
        self.buf.extend_from_slice(&inner.buf);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_advances_and_bounds_checks() {
        let mut w = ByteWriter::new();
        w.u32(7).f32(-12.0).u8(1);
        let bytes = w.into_bytes();

        let mut r = BankReader::new(&bytes);
        assert_eq!(r.read::<u32>().unwrap(), 7);
        assert_eq!(r.read::<f32>().unwrap(), -12.0);
        assert!(r.read_bool().unwrap());
        assert!(r.is_empty());

        match r.read::<u16>() {
            Err(VoxError::BankDataTruncated { needed, remaining }) => {
                assert_eq!(needed, 2);
                assert_eq!(remaining, 0);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_block_size_mismatch_detected() {
        let mut w = ByteWriter::new();
        w.block(|b| {
            b.u32(1).u32(2);
        });
        let bytes = w.into_bytes();

        let mut r = BankReader::new(&bytes);
        let mut block = r.read_block().unwrap();
        assert_eq!(block.read::<u32>().unwrap(), 1);
        assert!(matches!(
            block.expect_consumed(),
            Err(VoxError::BankSizeMismatch { declared: 8, consumed: 4 })
        ));
    }

    #[test]
    fn test_declared_block_longer_than_data() {
        let mut w = ByteWriter::new();
        w.u32(100).u32(0);
        let bytes = w.into_bytes();
        let mut r = BankReader::new(&bytes);
        assert!(r.read_block().is_err());
    }
}
