// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! Big-endian writers and readers for command, response and session-record bytes.

use anyhow::Result;

use crate::error::TssError;

/// Buffer for building TPM byte streams
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    ///
    /// Every TPM2B the session layer writes is bounded by a digest, a name or a
    /// parameter taken from an already size-prefixed buffer, so it fits in u16.
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor over a TPM byte stream
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(TssError::BufferUnderflow {
                wanted: len,
                remaining: self.remaining(),
            }
            .into());
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a TPM2B structure, failing when the payload exceeds `max`
    pub fn get_tpm2b_bounded(&mut self, max: usize) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        if size > max {
            return Err(TssError::BufferOverflow { size, max }.into());
        }
        self.get_bytes(size)
    }

    /// Borrow everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let v = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        v
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Skip a TPM2B structure
    pub fn skip_tpm2b(&mut self) -> Result<()> {
        let size = self.get_u16()? as usize;
        self.skip(size)
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Unmarshal a value that must span `data` exactly
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let v = Self::unmarshal(&mut buf)?;
        if !buf.is_empty() {
            return Err(TssError::TrailingBytes(buf.remaining()).into());
        }
        Ok(v)
    }
}

macro_rules! impl_marshal_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.$put(*self);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    buf.$get()
                }
            }
        )*
    };
}

impl_marshal_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}
