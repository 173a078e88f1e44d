//! Big-endian primitives shared by the snapshot, checkpoint and event formats.
//!
//! Strings and byte blobs are written with a 4-byte length prefix. Readers
//! work over an in-memory slice so that a short buffer is reported as a
//! decoding error instead of a partial value.

use std::io::{self, Read, Write};

pub(crate) fn put_u32(out: &mut impl Write, v: u32) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

pub(crate) fn put_u64(out: &mut impl Write, v: u64) -> io::Result<()> {
    out.write_all(&v.to_be_bytes())
}

pub(crate) fn put_f64(out: &mut impl Write, v: f64) -> io::Result<()> {
    out.write_all(&v.to_bits().to_be_bytes())
}

pub(crate) fn put_bytes(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "blob exceeds u32 length"))?;
    put_u32(out, len)?;
    out.write_all(bytes)
}

pub(crate) fn put_str(out: &mut impl Write, s: &str) -> io::Result<()> {
    put_bytes(out, s.as_bytes())
}

/// Reads primitives from any [`Read`], failing with `UnexpectedEof` on short input.
pub(crate) struct StreamReader<R> {
    inner: R,
}

impl<R: Read> StreamReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner }
    }

    pub(crate) fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub(crate) fn u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub(crate) fn u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub(crate) fn bytes(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("blob length {len} exceeds limit {max_len}"),
            ));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn string(&mut self, max_len: usize) -> io::Result<String> {
        let bytes = self.bytes(max_len)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Cursor over a byte slice with checked reads.
pub(crate) struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    pub(crate) fn f64(&mut self) -> Option<f64> {
        self.u64().map(f64::from_bits)
    }

    pub(crate) fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Option<String> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    }
}
