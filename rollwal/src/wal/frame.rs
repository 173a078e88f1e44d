//! Record framing.
//!
//! Every record on disk is three length-prefixed fields, all big-endian:
//!
//! ```text
//! [4: len=8][8: LSN][4: len=8][8: CRC32C (zero-extended)][4: len][payload]
//! ```
//!
//! The checksum covers the payload only. A framer writes the whole frame
//! with a single `write_all`. A crash during that write leaves a prefix of
//! the frame at the end of the segment, which reads back as
//! [`RecordRead::Torn`]. Header bytes that no writer could have produced
//! are reported as [`FrameError::Malformed`] instead.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FrameError, Result};

const LEN_PREFIX: usize = 4;
const LSN_WIDTH: usize = 8;
const CRC_WIDTH: usize = 8;

/// Bytes a frame adds before the payload length prefix.
pub const FRAME_OVERHEAD: usize = LEN_PREFIX + LSN_WIDTH + LEN_PREFIX + CRC_WIDTH;

/// Largest payload accepted when reading. Anything bigger is garbage.
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// Conservative number of bytes a framer writes for a payload of `payload_len`.
pub const fn framed_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + LEN_PREFIX + payload_len
}

/// Computes the checksum stored in a frame.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Result of writing one framed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// LSN stamped into the record.
    pub lsn: u64,
    /// CRC32C of the payload.
    pub crc: u32,
    /// Exact number of bytes written.
    pub bytes_written: u64,
}

/// Stamps an LSN and checksum onto a payload and writes the frame.
pub trait RecordFramer: Send {
    /// Writes `payload` as one frame to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Write`] if the write fails, or an LSN error if
    /// the framer has no valid LSN to use.
    fn write_framed(&mut self, out: &mut dyn Write, payload: &[u8]) -> Result<FrameInfo>;

    /// Upper bound on bytes added in front of the payload length prefix.
    fn overhead(&self) -> usize {
        FRAME_OVERHEAD
    }
}

fn encode(lsn: u64, payload: &[u8]) -> io::Result<(Vec<u8>, u32)> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 length"))?;
    let crc = checksum(payload);

    let mut buf = Vec::with_capacity(framed_len(payload.len()));
    buf.extend_from_slice(&(LSN_WIDTH as u32).to_be_bytes());
    buf.extend_from_slice(&lsn.to_be_bytes());
    buf.extend_from_slice(&(CRC_WIDTH as u32).to_be_bytes());
    buf.extend_from_slice(&u64::from(crc).to_be_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok((buf, crc))
}

fn write_frame(out: &mut dyn Write, lsn: u64, payload: &[u8]) -> Result<FrameInfo> {
    let (frame, crc) = encode(lsn, payload).map_err(|source| FrameError::Write { lsn, source })?;
    out.write_all(&frame)
        .map_err(|source| FrameError::Write { lsn, source })?;
    Ok(FrameInfo {
        lsn,
        crc,
        bytes_written: frame.len() as u64,
    })
}

/// Framer whose LSN is injected before each write.
///
/// This is the production framer: the rollup store assigns the LSN when it
/// applies a batch, and the same value is set here before the batch is
/// logged. An LSN is consumed by a successful write and must be set again.
#[derive(Debug, Default)]
pub struct ManualLsnFramer {
    pending: Option<u64>,
    last: u64,
}

impl ManualLsnFramer {
    /// Creates a framer that has written nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer that will only accept LSNs above `last`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            pending: None,
            last,
        }
    }

    /// Sets the LSN for the next write.
    pub fn set_lsn(&mut self, lsn: u64) {
        self.pending = Some(lsn);
    }

    /// The last LSN successfully written.
    pub fn last_lsn(&self) -> u64 {
        self.last
    }
}

impl RecordFramer for ManualLsnFramer {
    fn write_framed(&mut self, out: &mut dyn Write, payload: &[u8]) -> Result<FrameInfo> {
        let lsn = self.pending.ok_or(FrameError::LsnNotSet)?;
        if lsn <= self.last {
            return Err(FrameError::LsnNotIncreasing {
                lsn,
                last: self.last,
            }
            .into());
        }
        let info = write_frame(out, lsn, payload)?;
        self.pending = None;
        self.last = lsn;
        Ok(info)
    }
}

/// Framer that draws LSNs from a shared counter.
///
/// The counter is incremented before the write, so a failed write leaves a
/// gap. Used by standalone WAL users and tests.
#[derive(Debug, Clone, Default)]
pub struct CounterFramer {
    counter: Arc<AtomicU64>,
}

impl CounterFramer {
    /// Creates a framer starting at LSN 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer sharing `counter`; the next LSN is `counter + 1`.
    pub fn with_counter(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }

    /// Last LSN handed out.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }
}

impl RecordFramer for CounterFramer {
    fn write_framed(&mut self, out: &mut dyn Write, payload: &[u8]) -> Result<FrameInfo> {
        let lsn = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        write_frame(out, lsn, payload)
    }
}

/// A record read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedRecord {
    /// LSN stored in the record.
    pub lsn: u64,
    /// Checksum stored in the record.
    pub crc: u32,
    /// The payload bytes.
    pub payload: Vec<u8>,
    /// Offset of the first byte of the frame within its segment.
    pub offset: u64,
    /// Total frame length in bytes.
    pub len: u64,
}

impl FramedRecord {
    /// Checks the stored checksum against the payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ChecksumMismatch`] if they differ.
    pub fn verify(&self) -> std::result::Result<(), FrameError> {
        let actual = checksum(&self.payload);
        if actual == self.crc {
            Ok(())
        } else {
            Err(FrameError::ChecksumMismatch {
                offset: self.offset,
                expected: self.crc,
                actual,
            })
        }
    }
}

/// Outcome of reading at a record boundary.
#[derive(Debug)]
pub enum RecordRead {
    /// A complete frame was read. Its checksum has not been verified.
    Record(FramedRecord),
    /// Clean end of input at a record boundary.
    End,
    /// Input ended inside a frame.
    Torn {
        /// Offset where the torn frame starts.
        offset: u64,
    },
}

/// Reads one frame starting at `offset`.
///
/// Returns [`RecordRead::Torn`] only when input runs out before the frame
/// is complete, so a torn frame always extends to the end of the input.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if a length prefix or the stored
/// checksum holds a value no framer writes, and [`FrameError::Read`] on I/O
/// failures other than running out of input.
pub fn read_record(reader: &mut impl Read, offset: u64) -> std::result::Result<RecordRead, FrameError> {
    let read_err = |source| FrameError::Read { offset, source };
    let malformed = |reason: String| FrameError::Malformed { offset, reason };

    let mut prefix = [0u8; LEN_PREFIX];
    match fill(reader, &mut prefix).map_err(read_err)? {
        0 => return Ok(RecordRead::End),
        n if n < LEN_PREFIX => return Ok(RecordRead::Torn { offset }),
        _ => {}
    }
    let width = u32::from_be_bytes(prefix);
    if width as usize != LSN_WIDTH {
        return Err(malformed(format!("LSN length prefix is {width}")));
    }
    let mut lsn = [0u8; LSN_WIDTH];
    if fill(reader, &mut lsn).map_err(read_err)? < LSN_WIDTH {
        return Ok(RecordRead::Torn { offset });
    }

    if fill(reader, &mut prefix).map_err(read_err)? < LEN_PREFIX {
        return Ok(RecordRead::Torn { offset });
    }
    let width = u32::from_be_bytes(prefix);
    if width as usize != CRC_WIDTH {
        return Err(malformed(format!("checksum length prefix is {width}")));
    }
    let mut crc = [0u8; CRC_WIDTH];
    if fill(reader, &mut crc).map_err(read_err)? < CRC_WIDTH {
        return Ok(RecordRead::Torn { offset });
    }
    let stored_crc = u64::from_be_bytes(crc);
    let Ok(crc) = u32::try_from(stored_crc) else {
        return Err(malformed(format!("stored checksum {stored_crc:#x} exceeds 32 bits")));
    };

    if fill(reader, &mut prefix).map_err(read_err)? < LEN_PREFIX {
        return Ok(RecordRead::Torn { offset });
    }
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(malformed(format!("payload length {payload_len} exceeds {MAX_PAYLOAD}")));
    }
    let mut payload = vec![0u8; payload_len];
    if fill(reader, &mut payload).map_err(read_err)? < payload_len {
        return Ok(RecordRead::Torn { offset });
    }

    Ok(RecordRead::Record(FramedRecord {
        lsn: u64::from_be_bytes(lsn),
        crc,
        payload,
        offset,
        len: framed_len(payload_len) as u64,
    }))
}

/// Reads until `buf` is full or input ends; returns the byte count read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollwalError;

    fn read_all(bytes: &[u8]) -> Vec<RecordRead> {
        let mut reader = bytes;
        let mut offset = 0;
        let mut out = Vec::new();
        loop {
            match read_record(&mut reader, offset).unwrap() {
                RecordRead::Record(r) => {
                    offset += r.len;
                    out.push(RecordRead::Record(r));
                }
                other => {
                    out.push(other);
                    return out;
                }
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        let mut framer = ManualLsnFramer::new();
        framer.set_lsn(5);
        let mut buf = Vec::new();
        let info = framer.write_framed(&mut buf, b"hello").unwrap();

        assert_eq!(info.lsn, 5);
        assert_eq!(info.bytes_written as usize, buf.len());
        assert_eq!(buf.len(), framed_len(5));
        assert_eq!(&buf[0..4], &8u32.to_be_bytes());
        assert_eq!(&buf[4..12], &5u64.to_be_bytes());
        assert_eq!(&buf[12..16], &8u32.to_be_bytes());
        assert_eq!(&buf[16..24], &u64::from(checksum(b"hello")).to_be_bytes());
        assert_eq!(&buf[24..28], &5u32.to_be_bytes());
        assert_eq!(&buf[28..], b"hello");
    }

    #[test]
    fn test_manual_framer_requires_fresh_increasing_lsn() {
        let mut framer = ManualLsnFramer::new();
        let mut buf = Vec::new();

        let err = framer.write_framed(&mut buf, b"x").unwrap_err();
        assert!(matches!(err, RollwalError::Frame(FrameError::LsnNotSet)));

        framer.set_lsn(3);
        framer.write_framed(&mut buf, b"x").unwrap();
        // consumed by the write
        assert!(framer.write_framed(&mut buf, b"y").is_err());

        framer.set_lsn(3);
        let err = framer.write_framed(&mut buf, b"y").unwrap_err();
        assert!(matches!(
            err,
            RollwalError::Frame(FrameError::LsnNotIncreasing { lsn: 3, last: 3 })
        ));
        assert_eq!(framer.last_lsn(), 3);
    }

    #[test]
    fn test_counter_framer_sequence() {
        let mut framer = CounterFramer::new();
        let mut buf = Vec::new();
        let lsns: Vec<u64> = (0..3)
            .map(|_| framer.write_framed(&mut buf, b"p").unwrap().lsn)
            .collect();
        assert_eq!(lsns, vec![1, 2, 3]);

        let records = read_all(&buf);
        assert_eq!(records.len(), 4);
        assert!(matches!(records[3], RecordRead::End));
    }

    #[test]
    fn test_truncated_frame_is_torn() {
        let mut framer = CounterFramer::new();
        let mut buf = Vec::new();
        framer.write_framed(&mut buf, b"first").unwrap();
        let first_len = buf.len();
        framer.write_framed(&mut buf, b"second").unwrap();
        let second_len = buf.len() - first_len;

        for cut in [1, 10, 27, second_len - 1] {
            let records = read_all(&buf[..first_len + cut]);
            assert!(matches!(records[0], RecordRead::Record(_)));
            assert!(matches!(records[1], RecordRead::Torn { offset } if offset == first_len as u64));
        }
    }

    #[test]
    fn test_bad_length_prefix_is_malformed() {
        let mut framer = CounterFramer::new();
        let mut buf = Vec::new();
        framer.write_framed(&mut buf, b"first").unwrap();
        framer.write_framed(&mut buf, b"second").unwrap();

        // LSN width 8 -> 9, with a whole frame still following
        buf[3] = 9;
        let mut reader = buf.as_slice();
        let err = read_record(&mut reader, 0).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { offset: 0, .. }));

        // same for the checksum width prefix
        buf[3] = 8;
        buf[15] = 4;
        let mut reader = buf.as_slice();
        assert!(matches!(
            read_record(&mut reader, 0),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_verify_detects_flipped_payload() {
        let mut framer = CounterFramer::new();
        let mut buf = Vec::new();
        framer.write_framed(&mut buf, b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut reader = buf.as_slice();
        let RecordRead::Record(record) = read_record(&mut reader, 0).unwrap() else {
            panic!("expected a record");
        };
        assert!(matches!(
            record.verify(),
            Err(FrameError::ChecksumMismatch { offset: 0, .. })
        ));
    }

    #[test]
    fn test_failed_write_reports_lsn() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk gone"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut framer = ManualLsnFramer::new();
        framer.set_lsn(9);
        let err = framer.write_framed(&mut Broken, b"x").unwrap_err();
        assert!(matches!(err, RollwalError::Frame(FrameError::Write { lsn: 9, .. })));
        assert_eq!(framer.last_lsn(), 0);
    }
}
