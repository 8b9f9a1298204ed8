//! Jitter Buffer Implementation
//!
//! Reassembles RTP payloads into a contiguous byte stream keyed by RTP
//! timestamp. Packets that arrive before the current play offset trigger a
//! rebuild from the write log; a large backward jump drops history entirely.
//! Writes ahead of the play offset always splice in, however far ahead.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Filler byte returned for missing audio (G.711 silence)
pub const SILENCE_FILLER: u8 = 0xFF;

/// Jitter Buffer Configuration
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Distance before the play offset beyond which history is discarded
    pub discontinuity_threshold: u64,
    /// Byte used to pad short reads and fill gaps
    pub filler: u8,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            discontinuity_threshold: 100_000,
            filler: SILENCE_FILLER,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub writes: u64,
    pub resets: u64,
    pub rebuilds: u64,
    pub padded_reads: u64,
}

#[derive(Debug, Default)]
struct Inner {
    play_offset: Option<u64>,
    live: Vec<u8>,
    cursor: usize,
    write_log: Vec<(u64, Bytes)>,
    log_index: HashMap<u64, usize>,
    stats: JitterBufferStats,
}

impl Inner {
    fn record(&mut self, offset: u64, data: Bytes) {
        match self.log_index.get(&offset) {
            Some(&index) => self.write_log[index].1 = data,
            None => {
                self.log_index.insert(offset, self.write_log.len());
                self.write_log.push((offset, data));
            }
        }
    }

    fn reset(&mut self, offset: u64, data: Bytes) {
        self.play_offset = Some(offset);
        self.live = data.to_vec();
        self.cursor = 0;
        self.write_log.clear();
        self.log_index.clear();
        self.record(offset, data);
        self.stats.resets += 1;
    }

    fn rebuild(&mut self, offset: u64, filler: u8) {
        self.play_offset = Some(offset);
        self.live.clear();
        let entries = std::mem::take(&mut self.write_log);
        for (entry_offset, data) in &entries {
            if let Some(position) = entry_offset.checked_sub(offset) {
                self.splice(position as usize, data, filler);
            }
        }
        self.write_log = entries;
        self.stats.rebuilds += 1;
    }

    fn splice(&mut self, position: usize, data: &[u8], filler: u8) {
        let end = position + data.len();
        if self.live.len() < end {
            self.live.resize(end, filler);
        }
        self.live[position..end].copy_from_slice(data);
    }
}

/// Jitter Buffer
///
/// Written by the receive loop and read by the playout side. A single mutex
/// covers the live buffer, play offset, write log and read cursor because a
/// rebuild touches all of them.
#[derive(Debug, Default)]
pub struct JitterBuffer {
    config: JitterBufferConfig,
    inner: Mutex<Inner>,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write payload bytes at an absolute stream offset
    ///
    /// `force_reset` discards all history and restarts the stream at `offset`.
    pub fn write(&self, offset: u64, data: &[u8], force_reset: bool) {
        let data = Bytes::copy_from_slice(data);
        let threshold = self.config.discontinuity_threshold;
        let mut inner = self.lock();
        inner.stats.writes += 1;

        let play_offset = match inner.play_offset {
            Some(play_offset) if !force_reset => play_offset,
            _ => {
                debug!("Jitter buffer reset at offset {}", offset);
                inner.reset(offset, data);
                return;
            }
        };

        if offset < play_offset {
            if play_offset - offset >= threshold {
                debug!(
                    "Discontinuity of {} bytes before play offset {}, resetting",
                    play_offset - offset,
                    play_offset
                );
                inner.reset(offset, data);
            } else {
                inner.record(offset, data);
                inner.rebuild(offset, self.config.filler);
            }
            return;
        }

        let position = (offset - play_offset) as usize;
        inner.splice(position, &data, self.config.filler);
        inner.record(offset, data);
    }

    /// Read exactly `length` bytes, padding with filler when data runs out
    pub fn read(&self, length: usize) -> Bytes {
        let mut inner = self.lock();
        let start = inner.cursor.min(inner.live.len());
        let end = (start + length).min(inner.live.len());

        let mut frame = Vec::with_capacity(length);
        frame.extend_from_slice(&inner.live[start..end]);
        inner.cursor = end;
        if frame.len() < length {
            frame.resize(length, self.config.filler);
            inner.stats.padded_reads += 1;
        }
        Bytes::from(frame)
    }

    /// Earliest offset represented in the live buffer
    pub fn play_offset(&self) -> Option<u64> {
        self.lock().play_offset
    }

    pub fn write_log_len(&self) -> usize {
        self.lock().write_log.len()
    }

    /// Bytes currently reconstructed in the live buffer
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Bytes not yet consumed by `read`
    pub fn available(&self) -> usize {
        let inner = self.lock();
        inner.live.len().saturating_sub(inner.cursor)
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.lock().stats.clone()
    }
}
