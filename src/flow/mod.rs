//! Flow Controller
//!
//! A bounded elastic byte buffer between the archive producer and the tape
//! writer. The producer is paused at the high watermark; the writer waits
//! while occupancy is at or below the low watermark so it only ever streams
//! from a well-filled buffer and the drive never has to stop and reposition
//! between short bursts.

pub mod memory;

use crate::error::{Result, TapeStreamError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use memory::{check_capacity, FixedMemory, MemorySource, SystemMemory};

/// High/low occupancy fractions, `0 < low < high < 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermarks {
    pub high: f64,
    pub low: f64,
}

impl Watermarks {
    pub fn new(high: f64, low: f64) -> Result<Self> {
        if !(low > 0.0 && low < high && high < 1.0) {
            return Err(TapeStreamError::config(format!(
                "Watermarks must satisfy 0 < low < high < 1 (low={}, high={})",
                low, high
            )));
        }
        Ok(Self { high, low })
    }

    /// From CLI style percentages.
    pub fn from_percent(high_pct: u32, low_pct: u32) -> Result<Self> {
        Self::new(high_pct as f64 / 100.0, low_pct as f64 / 100.0)
    }
}

/// Sizing of one buffer instance.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub capacity: usize,
    pub watermarks: Watermarks,
    pub block_size: usize,
    pub max_stall: Duration,
}

impl FlowConfig {
    pub fn high_mark(&self) -> usize {
        (self.capacity as f64 * self.watermarks.high) as usize
    }

    pub fn low_mark(&self) -> usize {
        (self.capacity as f64 * self.watermarks.low) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(TapeStreamError::config("Block size must be greater than zero"));
        }
        if self.capacity < 2 * self.block_size {
            return Err(TapeStreamError::config(format!(
                "Buffer capacity {} must hold at least two blocks of {} bytes",
                self.capacity, self.block_size
            )));
        }
        if self.high_mark() < self.block_size {
            return Err(TapeStreamError::config(format!(
                "High watermark ({} bytes) is below one block ({} bytes)",
                self.high_mark(),
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of the buffer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferState {
    pub capacity: usize,
    pub occupancy: usize,
    pub high_mark: usize,
    pub low_mark: usize,
    pub producer_paused: bool,
    pub consumer_starved: bool,
    pub pause_events: u64,
    pub starvation_events: u64,
    pub peak_occupancy: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Highest occupancy the producer appended on top of.
    pub highest_fill_start: Option<usize>,
    /// Lowest occupancy a block was taken from while the producer was open.
    pub lowest_open_take: Option<usize>,
}

struct Inner {
    data: VecDeque<u8>,
    closed: bool,
    aborted: Option<String>,
    state: BufferState,
}

/// Bounded producer/consumer byte queue with watermark hysteresis.
pub struct ElasticBuffer {
    inner: Mutex<Inner>,
    space: Condvar,
    filled: Condvar,
    block_size: usize,
    max_stall: Duration,
}

impl ElasticBuffer {
    pub fn new(config: &FlowConfig) -> Result<Arc<Self>> {
        config.validate()?;
        debug!(
            "Elastic buffer: capacity {}, high {}, low {}, block {}",
            config.capacity,
            config.high_mark(),
            config.low_mark(),
            config.block_size
        );

        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                data: VecDeque::with_capacity(config.capacity),
                closed: false,
                aborted: None,
                state: BufferState {
                    capacity: config.capacity,
                    high_mark: config.high_mark(),
                    low_mark: config.low_mark(),
                    ..Default::default()
                },
            }),
            space: Condvar::new(),
            filled: Condvar::new(),
            block_size: config.block_size,
            max_stall: config.max_stall,
        }))
    }

    /// Append bytes, blocking at the high watermark.
    pub fn push(&self, mut bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        while !bytes.is_empty() {
            if let Some(reason) = &inner.aborted {
                return Err(TapeStreamError::buffer(format!("buffer aborted: {}", reason)));
            }
            if inner.closed {
                return Err(TapeStreamError::buffer("push after close"));
            }

            if inner.data.len() >= inner.state.high_mark {
                inner.state.producer_paused = true;
                inner.state.pause_events += 1;
                while inner.data.len() >= inner.state.high_mark && inner.aborted.is_none() {
                    self.space.wait(&mut inner);
                }
                inner.state.producer_paused = false;
                continue;
            }

            let before = inner.data.len();
            inner.state.highest_fill_start = inner.state.highest_fill_start.max(Some(before));
            let room = inner.state.capacity - before;
            let take = room.min(bytes.len());
            inner.data.extend(&bytes[..take]);
            bytes = &bytes[take..];

            inner.state.bytes_in += take as u64;
            inner.state.occupancy = inner.data.len();
            if inner.state.occupancy > inner.state.peak_occupancy {
                inner.state.peak_occupancy = inner.state.occupancy;
            }
            self.filled.notify_all();
        }

        Ok(())
    }

    fn consumer_ready(&self, inner: &Inner) -> bool {
        let occupancy = inner.data.len();
        inner.closed
            || inner.aborted.is_some()
            || (occupancy > inner.state.low_mark && occupancy >= self.block_size)
    }

    /// Take the next block for the device.
    ///
    /// Returns a full block while the producer is running. After close the
    /// remaining bytes drain, the last block possibly short, and then `None`.
    /// Waiting past `max_stall` fails with a stall error.
    pub fn pop_block(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();

        if !self.consumer_ready(&inner) {
            inner.state.consumer_starved = true;
            inner.state.starvation_events += 1;
            let started = Instant::now();

            while !self.consumer_ready(&inner) {
                let elapsed = started.elapsed();
                if elapsed >= self.max_stall {
                    inner.state.consumer_starved = false;
                    warn!("Consumer starved for {:?}", elapsed);
                    return Err(TapeStreamError::buffer(format!(
                        "buffer stalled for {}s waiting for data",
                        elapsed.as_secs()
                    )));
                }
                self.filled.wait_for(&mut inner, self.max_stall - elapsed);
            }
            inner.state.consumer_starved = false;
        }

        if let Some(reason) = &inner.aborted {
            return Err(TapeStreamError::buffer(format!("buffer aborted: {}", reason)));
        }
        if inner.data.is_empty() {
            return Ok(None);
        }

        let before = inner.data.len();
        if !inner.closed {
            let lowest = inner.state.lowest_open_take.map_or(before, |l| l.min(before));
            inner.state.lowest_open_take = Some(lowest);
        }
        let take = self.block_size.min(before);
        let block: Vec<u8> = inner.data.drain(..take).collect();
        inner.state.bytes_out += take as u64;
        inner.state.occupancy = inner.data.len();
        self.space.notify_all();

        Ok(Some(block))
    }

    /// Producer is done; the consumer drains what is left.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.filled.notify_all();
    }

    /// Stop both sides. Buffered bytes are discarded.
    pub fn abort<T: Into<String>>(&self, reason: T) {
        let mut inner = self.inner.lock();
        if inner.aborted.is_none() {
            inner.aborted = Some(reason.into());
        }
        inner.data.clear();
        inner.state.occupancy = 0;
        self.filled.notify_all();
        self.space.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted.is_some()
    }

    pub fn snapshot(&self) -> BufferState {
        self.inner.lock().state.clone()
    }
}

/// `io::Write` front end for the producer side; counts bytes pushed so the
/// producer knows archive offsets.
pub struct BufferWriter {
    buffer: Arc<ElasticBuffer>,
    written: u64,
}

impl BufferWriter {
    pub fn new(buffer: Arc<ElasticBuffer>) -> Self {
        Self { buffer, written: 0 }
    }

    pub fn position(&self) -> u64 {
        self.written
    }
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .push(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `io::Read` front end for the consumer side, used on restore.
pub struct BufferReader {
    buffer: Arc<ElasticBuffer>,
    current: Vec<u8>,
    pos: usize,
}

impl BufferReader {
    pub fn new(buffer: Arc<ElasticBuffer>) -> Self {
        Self {
            buffer,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.current.len() {
            match self
                .buffer
                .pop_block()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            {
                Some(block) => {
                    self.current = block;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(capacity: usize, block_size: usize) -> FlowConfig {
        FlowConfig {
            capacity,
            watermarks: Watermarks::new(0.75, 0.25).unwrap(),
            block_size,
            max_stall: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_watermark_validation() {
        assert!(Watermarks::new(0.9, 0.2).is_ok());
        assert!(Watermarks::new(0.2, 0.9).is_err());
        assert!(Watermarks::new(1.0, 0.2).is_err());
        assert!(Watermarks::new(0.5, 0.0).is_err());
        assert!(Watermarks::from_percent(90, 20).is_ok());
    }

    #[test]
    fn test_buffer_must_hold_two_blocks() {
        assert!(config(1024, 1024).validate().is_err());
        assert!(config(4096, 1024).validate().is_ok());

        let mut tight = config(2048, 1024);
        tight.watermarks = Watermarks::new(0.4, 0.1).unwrap();
        assert!(tight.validate().is_err());
    }

    #[test]
    fn test_drain_after_close_returns_short_tail() {
        let buffer = ElasticBuffer::new(&config(4096, 1024)).unwrap();
        buffer.push(&[7u8; 1500]).unwrap();
        buffer.close();

        assert_eq!(buffer.pop_block().unwrap().unwrap().len(), 1024);
        assert_eq!(buffer.pop_block().unwrap().unwrap().len(), 476);
        assert!(buffer.pop_block().unwrap().is_none());
        assert!(buffer.push(b"late").is_err());
    }

    #[test]
    fn test_consumer_stall_times_out() {
        let mut cfg = config(4096, 1024);
        cfg.max_stall = Duration::from_millis(50);
        let buffer = ElasticBuffer::new(&cfg).unwrap();
        // below the low mark, never closed
        buffer.push(&[0u8; 512]).unwrap();

        let err = buffer.pop_block().unwrap_err();
        assert!(err.to_string().contains("stalled"));
    }

    #[test]
    fn test_abort_wakes_paused_producer() {
        let buffer = ElasticBuffer::new(&config(4096, 1024)).unwrap();
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.push(&[1u8; 16384]))
        };

        while !buffer.snapshot().producer_paused {
            thread::yield_now();
        }
        buffer.abort("end of tape");
        assert!(producer.join().unwrap().is_err());
        assert!(buffer.pop_block().is_err());
    }

    #[test]
    fn test_reader_writer_adapters() {
        let buffer = ElasticBuffer::new(&config(4096, 512)).unwrap();
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut writer = BufferWriter::new(buffer.clone());
                for i in 0..100u32 {
                    writer.write_all(&i.to_le_bytes()).unwrap();
                }
                assert_eq!(writer.position(), 400);
                buffer.close();
            })
        };

        let mut out = Vec::new();
        BufferReader::new(buffer).read_to_end(&mut out).unwrap();
        producer.join().unwrap();

        assert_eq!(out.len(), 400);
        assert_eq!(&out[396..], &99u32.to_le_bytes());
    }
}
