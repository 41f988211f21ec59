// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ONC RPC / XDR primitive encoding, per RFC 4506.
//!
//! [`Packer`] serializes primitives into a growable buffer; [`Unpacker`]
//! walks a borrowed byte slice and extracts them back out. Variable-length
//! opaque data and strings are always padded to a 4-byte boundary.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("unexpected end of XDR input")]
    Eof,
    #[error("invalid boolean/list marker: expected 0 or 1, got {0}")]
    Conversion(u32),
    #[error("{0} bytes of unextracted data remain")]
    TrailingData(usize),
}

pub type Result<T> = std::result::Result<T, XdrError>;

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Serializes XDR primitives into an in-memory buffer.
#[derive(Debug, Default, Clone)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn pack_uint(&mut self, value: u32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn pack_int(&mut self, value: i32) {
        self.pack_uint(value as u32);
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.pack_uint(if value { 1 } else { 0 });
    }

    pub fn pack_uhyper(&mut self, value: u64) {
        self.pack_uint((value >> 32) as u32);
        self.pack_uint(value as u32);
    }

    pub fn pack_hyper(&mut self, value: i64) {
        self.pack_uhyper(value as u64);
    }

    pub fn pack_float(&mut self, value: f32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_f32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn pack_double(&mut self, value: f64) {
        let mut tmp = [0u8; 8];
        BigEndian::write_f64(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    /// Packs `data` as fixed-length opaque, padded to a 4-byte boundary.
    /// Unlike the variable-length form, the length itself is not encoded.
    pub fn pack_fopaque(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let pad = padded_len(data.len()) - data.len();
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    /// Packs variable-length opaque data: `length:u32` then padded bytes.
    pub fn pack_opaque(&mut self, data: &[u8]) {
        self.pack_uint(data.len() as u32);
        self.pack_fopaque(data);
    }

    pub fn pack_string(&mut self, s: &str) {
        self.pack_opaque(s.as_bytes());
    }

    pub fn pack_list<T, F>(&mut self, items: &[T], mut pack_item: F)
    where
        F: FnMut(&mut Self, &T),
    {
        for item in items {
            self.pack_uint(1);
            pack_item(self, item);
        }
        self.pack_uint(0);
    }
}

/// Deserializes XDR primitives from a borrowed byte slice.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, position: usize) {
        self.pos = position;
    }

    /// Fails if any bytes remain unextracted.
    pub fn done(&self) -> Result<()> {
        if self.pos < self.buf.len() {
            Err(XdrError::TrailingData(self.buf.len() - self.pos))
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(XdrError::Eof)?;
        if end > self.buf.len() {
            return Err(XdrError::Eof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn unpack_uint(&mut self) -> Result<u32> {
        let data = self.take(4)?;
        Ok(BigEndian::read_u32(data))
    }

    pub fn unpack_int(&mut self) -> Result<i32> {
        Ok(self.unpack_uint()? as i32)
    }

    pub fn unpack_bool(&mut self) -> Result<bool> {
        match self.unpack_uint()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::Conversion(other)),
        }
    }

    pub fn unpack_uhyper(&mut self) -> Result<u64> {
        let hi = self.unpack_uint()? as u64;
        let lo = self.unpack_uint()? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn unpack_hyper(&mut self) -> Result<i64> {
        Ok(self.unpack_uhyper()? as i64)
    }

    pub fn unpack_float(&mut self) -> Result<f32> {
        let data = self.take(4)?;
        Ok(BigEndian::read_f32(data))
    }

    pub fn unpack_double(&mut self) -> Result<f64> {
        let data = self.take(8)?;
        Ok(BigEndian::read_f64(data))
    }

    /// Reads `size` bytes of data plus their padding, returning only the
    /// unpadded payload.
    pub fn unpack_fopaque(&mut self, size: usize) -> Result<&'a [u8]> {
        let padded = padded_len(size);
        let data = self.take(padded)?;
        Ok(&data[..size])
    }

    pub fn unpack_opaque(&mut self) -> Result<&'a [u8]> {
        let len = self.unpack_uint()? as usize;
        self.unpack_fopaque(len)
    }

    pub fn unpack_string(&mut self) -> Result<String> {
        let bytes = self.unpack_opaque()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn unpack_list<T, F>(&mut self, mut unpack_item: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let mut items = Vec::new();
        loop {
            match self.unpack_uint()? {
                0 => break,
                1 => items.push(unpack_item(self)?),
                other => return Err(XdrError::Conversion(other)),
            }
        }
        Ok(items)
    }
}
