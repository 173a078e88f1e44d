//! Event batching.
//!
//! A [`BatchWriter`] buffers encoded application events and writes them as
//! one record when the buffer reaches its event limit, when adding an event
//! would push the framed record past its byte limit, or when the flush
//! timer fires. The record payload is a simple length-prefixed list:
//!
//! ```text
//! [u32 count] { [u32 len][event bytes] }*
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::codec::{SliceReader, put_bytes, put_f64, put_str, put_u32, put_u64};
use crate::config::BatchConfig;
use crate::error::{BatchError, FrameError, Result};
use crate::wal::frame::FRAME_OVERHEAD;

/// Length prefix in front of each event and in front of the event count.
const EVENT_PREFIX: usize = 4;

/// Destination for flushed batch records.
pub trait RecordSink: Send {
    /// Writes one record and returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns whatever error the underlying log reports.
    fn write_record(&mut self, payload: &[u8]) -> Result<u64>;
}

/// One series' points, the unit carried inside WAL records.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEvent {
    /// Shard the series was routed to.
    pub shard: u32,
    /// Series key.
    pub series: String,
    /// Timestamps in milliseconds.
    pub timestamps: Vec<u64>,
    /// Values, one per timestamp.
    pub values: Vec<f64>,
}

impl WalEvent {
    /// Exact encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 4 + self.series.len() + 4 + self.timestamps.len() * 8 + self.values.len() * 8
    }

    /// Encodes the event.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayload`] if the series name or point
    /// count does not fit its 32-bit length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf).map_err(|e| FrameError::InvalidPayload {
            reason: format!("cannot encode event for {}: {e}", self.series),
        })?;
        Ok(buf)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        put_u32(buf, self.shard)?;
        put_str(buf, &self.series)?;
        let n = u32::try_from(self.timestamps.len()).map_err(std::io::Error::other)?;
        put_u32(buf, n)?;
        for ts in &self.timestamps {
            put_u64(buf, *ts)?;
        }
        for v in &self.values {
            put_f64(buf, *v)?;
        }
        Ok(())
    }

    /// Decodes an event produced by [`WalEvent::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayload`] if the bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = SliceReader::new(bytes);
        let bad = |reason: &str| FrameError::InvalidPayload {
            reason: reason.to_string(),
        };

        let shard = r.u32().ok_or_else(|| bad("missing shard"))?;
        let series = r.string().ok_or_else(|| bad("missing series"))?;
        let n = r.u32().ok_or_else(|| bad("missing point count"))? as usize;
        if r.remaining() != n * 16 {
            return Err(bad("point count does not match payload size").into());
        }
        let timestamps = (0..n).filter_map(|_| r.u64()).collect();
        let values = (0..n).filter_map(|_| r.f64()).collect();
        Ok(Self {
            shard,
            series,
            timestamps,
            values,
        })
    }
}

/// Encodes a list of event blobs as one record payload.
///
/// # Errors
///
/// Returns [`FrameError::InvalidPayload`] if the event count or an event's
/// length does not fit its 32-bit prefix.
pub fn encode_batch<B: AsRef<[u8]>>(events: &[B]) -> Result<Vec<u8>> {
    let size = EVENT_PREFIX + events.iter().map(|e| EVENT_PREFIX + e.as_ref().len()).sum::<usize>();
    let mut buf = Vec::with_capacity(size);
    let write_all = |buf: &mut Vec<u8>| -> std::io::Result<()> {
        put_u32(buf, u32::try_from(events.len()).map_err(std::io::Error::other)?)?;
        for event in events {
            put_bytes(buf, event.as_ref())?;
        }
        Ok(())
    };
    write_all(&mut buf).map_err(|e| FrameError::InvalidPayload {
        reason: format!("cannot encode batch of {} events: {e}", events.len()),
    })?;
    Ok(buf)
}

/// Splits a record payload back into event blobs.
///
/// # Errors
///
/// Returns [`FrameError::InvalidPayload`] if the payload is malformed.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut r = SliceReader::new(payload);
    let bad = |reason: String| FrameError::InvalidPayload { reason };

    let count = r.u32().ok_or_else(|| bad("missing event count".to_string()))?;
    let mut events = Vec::with_capacity((count as usize).min(4096));
    for i in 0..count {
        let event = r
            .bytes()
            .ok_or_else(|| bad(format!("event {i} of {count} is truncated")))?;
        events.push(event.to_vec());
    }
    if r.remaining() != 0 {
        return Err(bad(format!("{} trailing bytes after events", r.remaining())).into());
    }
    Ok(events)
}

struct BatchState<S> {
    sink: S,
    buffer: Vec<Vec<u8>>,
    // payload bytes of the buffered events, including their prefixes
    buffered_bytes: usize,
    deadline: Option<Instant>,
    closed: bool,
    timer_error: Option<String>,
}

impl<S: RecordSink> BatchState<S> {
    fn framed_size(&self, extra: usize) -> usize {
        FRAME_OVERHEAD + EVENT_PREFIX + EVENT_PREFIX + self.buffered_bytes + extra
    }

    fn flush(&mut self) -> Result<Option<u64>> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let payload = encode_batch(&self.buffer)?;
        let events = self.buffer.len();
        // Events stay buffered if the sink fails, so a retry can resend them.
        let lsn = self.sink.write_record(&payload)?;
        self.buffer.clear();
        self.buffered_bytes = 0;
        tracing::debug!("flushed {events} event(s) as LSN {lsn}");
        Ok(Some(lsn))
    }
}

struct Shared<S> {
    state: Mutex<BatchState<S>>,
    wake: Condvar,
}

/// Coalesces events into records under count, size and time limits.
///
/// # Examples
///
/// ```rust,no_run
/// use rollwal::config::BatchConfig;
/// use rollwal::wal::batch::BatchWriter;
/// use rollwal::wal::frame::CounterFramer;
/// use rollwal::wal::spillover::{FsyncPolicy, SpilloverWriter};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let wal = SpilloverWriter::open("/tmp/wal", CounterFramer::new(), 64 << 20, FsyncPolicy::Manual)?;
/// let mut batches = BatchWriter::new(wal, BatchConfig::default());
///
/// batches.consume(b"event-1".to_vec(), 7)?;
/// batches.consume(b"event-2".to_vec(), 7)?;
/// batches.close()?;
/// # Ok(())
/// # }
/// ```
pub struct BatchWriter<S: RecordSink + 'static> {
    shared: Arc<Shared<S>>,
    config: BatchConfig,
    timer: Option<JoinHandle<()>>,
}

impl<S: RecordSink + 'static> BatchWriter<S> {
    /// Creates a writer over `sink`.
    ///
    /// A timer thread is started when `config.max_delay` is non-zero.
    pub fn new(sink: S, config: BatchConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(BatchState {
                sink,
                buffer: Vec::new(),
                buffered_bytes: 0,
                deadline: None,
                closed: false,
                timer_error: None,
            }),
            wake: Condvar::new(),
        });

        let timer = if config.max_delay.is_zero() {
            None
        } else {
            let shared = Arc::clone(&shared);
            Some(thread::spawn(move || timer_loop(&shared)))
        };

        Self {
            shared,
            config,
            timer,
        }
    }

    /// Buffers one encoded event.
    ///
    /// `estimated_size` is the caller's estimate of the event's encoded
    /// size; the larger of it and the actual length is used for limits.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::RecordTooLarge`] if the event cannot fit in a
    /// record on its own, [`BatchError::Closed`] after [`BatchWriter::close`],
    /// [`BatchError::FlushFailed`] if a timed flush failed since the last
    /// call, or the sink's error if a flush triggered here fails. On any
    /// error `event` is not buffered, so retrying it cannot log it twice.
    pub fn consume(&self, event: Vec<u8>, estimated_size: usize) -> Result<()> {
        let event_bytes = EVENT_PREFIX + estimated_size.max(event.len());
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(BatchError::Closed.into());
        }
        if let Some(reason) = state.timer_error.take() {
            return Err(BatchError::FlushFailed { reason }.into());
        }

        let single = FRAME_OVERHEAD + EVENT_PREFIX + EVENT_PREFIX + event_bytes;
        if single > self.config.max_bytes {
            return Err(BatchError::RecordTooLarge {
                size: single,
                limit: self.config.max_bytes,
            }
            .into());
        }

        if !state.buffer.is_empty() && state.framed_size(event_bytes) > self.config.max_bytes {
            state.flush()?;
        }

        state.buffer.push(event);
        state.buffered_bytes += event_bytes;

        if state.buffer.len() >= self.config.max_events {
            if let Err(e) = state.flush() {
                // Only the earlier events stay buffered; the caller owns this one.
                state.buffer.pop();
                state.buffered_bytes -= event_bytes;
                return Err(e);
            }
        } else if state.deadline.is_none() && self.timer.is_some() {
            state.deadline = Some(Instant::now() + self.config.max_delay);
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Writes any buffered events now.
    ///
    /// Returns the LSN of the written record, or `None` if nothing was buffered.
    ///
    /// # Errors
    ///
    /// Returns the sink's error; the events remain buffered.
    pub fn flush(&self) -> Result<Option<u64>> {
        self.shared.state.lock().flush()
    }

    /// Number of events currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Runs `f` with exclusive access to the sink.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.shared.state.lock().sink)
    }

    /// Flushes, stops the timer, and rejects further events.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if the final flush fails.
    pub fn close(&mut self) -> Result<()> {
        let result = {
            let mut state = self.shared.state.lock();
            let result = state.flush();
            state.closed = true;
            self.shared.wake.notify_all();
            result
        };
        if let Some(handle) = self.timer.take()
            && handle.join().is_err()
        {
            tracing::warn!("batch timer thread panicked");
        }
        result.map(|_| ())
    }
}

impl<S: RecordSink + 'static> Drop for BatchWriter<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("dropping batch writer lost buffered events: {e}");
        }
    }
}

fn timer_loop<S: RecordSink>(shared: &Shared<S>) {
    let mut state = shared.state.lock();
    loop {
        if state.closed {
            return;
        }
        match state.deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                if let Err(e) = state.flush() {
                    tracing::warn!("timed batch flush failed: {e}");
                    state.timer_error = Some(e.to_string());
                }
            }
            Some(deadline) => {
                let _ = shared.wake.wait_until(&mut state, deadline);
            }
        }
    }
}
