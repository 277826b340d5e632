//! Fixed-capacity byte ring buffer
//!
//! Bridges the reader thread (single producer) and foreground reads (single
//! consumer). Head, tail and count live behind one mutex, so a write racing
//! a read can never break `0 <= count <= capacity`. Neither side ever waits
//! on I/O while holding the lock; critical sections are a couple of
//! `copy_from_slice` calls.

use bytes::{Bytes, BytesMut};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// What `write` does when the data does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep what is buffered, store what fits, drop the rest of the input
    #[default]
    DropNewest,
    /// Keep the newest bytes, discarding the oldest unread ones
    OverwriteOldest,
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    pub len: usize,
    pub capacity: usize,
    /// Bytes accepted into the buffer since creation
    pub total_written: u64,
    /// Bytes lost to overflow since creation
    pub total_dropped: u64,
}

#[derive(Debug)]
struct RingState {
    storage: Box<[u8]>,
    /// Next write position
    head: usize,
    /// Next read position
    tail: usize,
    count: usize,
    total_written: u64,
    total_dropped: u64,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Append bytes that are known to fit
    fn push(&mut self, data: &[u8]) {
        let cap = self.capacity();
        debug_assert!(data.len() <= cap - self.count);

        let first = data.len().min(cap - self.head);
        self.storage[self.head..self.head + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);

        self.head = (self.head + data.len()) % cap;
        self.count += data.len();
        self.total_written += data.len() as u64;
    }

    /// Remove `n` bytes from the front, handing each contiguous run to `sink`
    fn drain(&mut self, n: usize, mut sink: impl FnMut(&[u8])) {
        let cap = self.capacity();
        debug_assert!(n <= self.count);

        let first = n.min(cap - self.tail);
        sink(&self.storage[self.tail..self.tail + first]);
        if n > first {
            sink(&self.storage[..n - first]);
        }

        self.tail = (self.tail + n) % cap;
        self.count -= n;
    }

    /// Forget the `n` oldest bytes
    fn discard(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.capacity();
        self.count -= n;
        self.total_dropped += n as u64;
    }
}

/// Single-producer/single-consumer byte queue with fixed capacity
#[derive(Debug)]
pub struct RingBuffer {
    policy: OverflowPolicy,
    state: Mutex<RingState>,
}

impl RingBuffer {
    /// Create a ring buffer; capacity must be positive
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParameter(
                "ring buffer capacity must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            policy,
            state: Mutex::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                count: 0,
                total_written: 0,
                total_dropped: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store as much of `data` as the overflow policy allows
    ///
    /// Returns the number of input bytes now held by the buffer. With
    /// `DropNewest` that is `min(data.len(), capacity - len)`; with
    /// `OverwriteOldest` it is `min(data.len(), capacity)`.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let mut state = self.lock();
        let cap = state.capacity();

        let stored = match self.policy {
            OverflowPolicy::DropNewest => {
                let n = data.len().min(cap - state.count);
                state.push(&data[..n]);
                state.total_dropped += (data.len() - n) as u64;
                n
            }
            OverflowPolicy::OverwriteOldest => {
                let keep = &data[data.len().saturating_sub(cap)..];
                let overflow = (state.count + keep.len()).saturating_sub(cap);
                if overflow > 0 {
                    state.discard(overflow);
                }
                state.total_dropped += (data.len() - keep.len()) as u64;
                state.push(keep);
                keep.len()
            }
        };

        if stored < data.len() {
            trace!(
                "Ring buffer full: stored {} of {} bytes ({:?})",
                stored,
                data.len(),
                self.policy
            );
        }

        stored
    }

    /// Remove and return up to `max_len` bytes, oldest first; never blocks
    pub fn read(&self, max_len: usize) -> Bytes {
        let mut state = self.lock();
        let n = max_len.min(state.count);
        if n == 0 {
            return Bytes::new();
        }

        let mut out = BytesMut::with_capacity(n);
        state.drain(n, |chunk| out.extend_from_slice(chunk));
        out.freeze()
    }

    /// Remove bytes into `out`, returning how many were copied
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let mut state = self.lock();
        let n = out.len().min(state.count);
        let mut filled = 0;
        state.drain(n, |chunk| {
            out[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
        });
        n
    }

    /// Discard all buffered data and reset the indices
    pub fn clear(&self) {
        let mut state = self.lock();
        state.head = 0;
        state.tail = 0;
        state.count = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> RingStats {
        let state = self.lock();
        RingStats {
            len: state.count,
            capacity: state.capacity(),
            total_written: state.total_written,
            total_dropped: state.total_dropped,
        }
    }
}
