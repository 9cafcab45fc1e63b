//! Bounded PCM byte queue shared between the network side and the audio callback.
//!
//! The network side appends decoded 16-bit little-endian mono PCM as it arrives;
//! the playback side drains whole samples. Bytes are only ever handed out in
//! pairs, so a chunk boundary that splits a sample leaves the odd byte queued
//! until the next append completes it.
//!
//! The buffer also carries the generation counter used to discard audio that
//! belongs to an interrupted utterance. [`SampleBuffer::interrupt`] clears the
//! queue and advances the generation in one critical section, so no append
//! tagged with the old generation can land after the clear.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

pub const BYTES_PER_SAMPLE: usize = 2;

/// What happens when an append would exceed the configured capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest unplayed audio to make room and report it.
    #[default]
    DropOldest,
    /// Refuse the append with [`StreamError::BufferSaturated`].
    RejectNew,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Ok(Self::DropOldest),
            "reject_new" => Ok(Self::RejectNew),
            _ => Err(format!(
                "Invalid overflow policy '{s}'. Expected: drop-oldest or reject-new"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    /// Tagged with a generation older than the current one; nothing was queued.
    Stale,
    /// Accepted after dropping `dropped_bytes` of the oldest queued audio.
    Overflowed { dropped_bytes: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub appended_bytes: u64,
    pub drained_bytes: u64,
    pub dropped_bytes: u64,
    pub stale_bytes: u64,
    pub rejected_appends: u64,
    pub contended_drains: u64,
}

#[derive(Default)]
struct Counters {
    appended_bytes: AtomicU64,
    drained_bytes: AtomicU64,
    dropped_bytes: AtomicU64,
    stale_bytes: AtomicU64,
    rejected_appends: AtomicU64,
    contended_drains: AtomicU64,
}

struct Inner {
    bytes: VecDeque<u8>,
    generation: u64,
}

pub struct SampleBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    // Mirrors `Inner::generation` for lock-free reads.
    generation: AtomicU64,
    counters: Counters,
}

impl SampleBuffer {
    /// `capacity_bytes` is rounded down to whole samples, with a floor of one sample.
    /// Storage is reserved up front so appends never reallocate.
    pub fn new(capacity_bytes: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity_bytes.max(BYTES_PER_SAMPLE) / BYTES_PER_SAMPLE * BYTES_PER_SAMPLE;
        Self {
            inner: Mutex::new(Inner {
                bytes: VecDeque::with_capacity(capacity),
                generation: 0,
            }),
            capacity,
            policy,
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len_bytes(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Whole samples ready for playback; a dangling odd byte is not counted.
    pub fn buffered_samples(&self) -> usize {
        self.len_bytes() / BYTES_PER_SAMPLE
    }

    pub fn is_empty(&self) -> bool {
        self.lock().bytes.is_empty()
    }

    pub fn append(&self, generation: u64, bytes: &[u8]) -> Result<AppendOutcome> {
        let mut inner = self.lock();

        if generation < inner.generation {
            self.counters
                .stale_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return Ok(AppendOutcome::Stale);
        }
        if bytes.is_empty() {
            return Ok(AppendOutcome::Accepted);
        }

        let queued = inner.bytes.len();
        let free = self.capacity - queued;
        if bytes.len() <= free {
            inner.bytes.extend(bytes);
            self.counters
                .appended_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            return Ok(AppendOutcome::Accepted);
        }

        match self.policy {
            OverflowPolicy::RejectNew => {
                self.counters.rejected_appends.fetch_add(1, Ordering::Relaxed);
                Err(StreamError::BufferSaturated {
                    requested: bytes.len(),
                    free,
                })
            }
            OverflowPolicy::DropOldest => {
                // Dropping an even count from the head keeps every later byte on the
                // same side of its sample boundary.
                let excess = bytes.len() - free;
                let excess = excess + excess % BYTES_PER_SAMPLE;

                let (from_queue, from_incoming) = if excess <= queued {
                    (excess, 0)
                } else {
                    (queued, excess - queued)
                };
                inner.bytes.drain(..from_queue);
                inner.bytes.extend(&bytes[from_incoming.min(bytes.len())..]);

                let kept = bytes.len().saturating_sub(from_incoming);
                self.counters
                    .appended_bytes
                    .fetch_add(kept as u64, Ordering::Relaxed);
                self.counters
                    .dropped_bytes
                    .fetch_add(excess as u64, Ordering::Relaxed);
                Ok(AppendOutcome::Overflowed {
                    dropped_bytes: excess,
                })
            }
        }
    }

    /// Real-time drain: decodes up to `out.len()` samples into `out` and returns
    /// how many were written.
    ///
    /// Never blocks and never allocates. If the producer holds the lock the
    /// call returns 0 and the caller plays silence for this block; nothing is
    /// lost, it is simply played on the next tick.
    pub fn drain_into(&self, out: &mut [i16]) -> usize {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.counters.contended_drains.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };

        let count = out.len().min(inner.bytes.len() / BYTES_PER_SAMPLE);
        if count == 0 {
            return 0;
        }

        let mut pairs = inner.bytes.drain(..count * BYTES_PER_SAMPLE);
        for slot in out[..count].iter_mut() {
            let (Some(lo), Some(hi)) = (pairs.next(), pairs.next()) else {
                break;
            };
            *slot = i16::from_le_bytes([lo, hi]);
        }
        drop(pairs);

        self.counters
            .drained_bytes
            .fetch_add((count * BYTES_PER_SAMPLE) as u64, Ordering::Relaxed);
        count
    }

    /// Removes up to `max_samples` whole samples and returns their bytes.
    ///
    /// Allocates; not for the audio callback.
    pub fn drain(&self, max_samples: usize) -> Vec<u8> {
        let mut inner = self.lock();
        let count = max_samples.min(inner.bytes.len() / BYTES_PER_SAMPLE) * BYTES_PER_SAMPLE;
        let out: Vec<u8> = inner.bytes.drain(..count).collect();
        self.counters
            .drained_bytes
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    /// Truncates to empty, including a dangling odd byte.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let dropped = inner.bytes.len();
        inner.bytes.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "sample buffer cleared");
        }
    }

    /// Clears and advances the generation; returns the new generation.
    pub fn interrupt(&self) -> u64 {
        let mut inner = self.lock();
        let dropped = inner.bytes.len();
        inner.bytes.clear();
        inner.generation += 1;
        self.generation.store(inner.generation, Ordering::Release);
        tracing::debug!(generation = inner.generation, dropped, "sample buffer interrupted");
        inner.generation
    }

    pub fn stats(&self) -> BufferStats {
        let c = &self.counters;
        BufferStats {
            appended_bytes: c.appended_bytes.load(Ordering::Relaxed),
            drained_bytes: c.drained_bytes.load(Ordering::Relaxed),
            dropped_bytes: c.dropped_bytes.load(Ordering::Relaxed),
            stale_bytes: c.stale_bytes.load(Ordering::Relaxed),
            rejected_appends: c.rejected_appends.load(Ordering::Relaxed),
            contended_drains: c.contended_drains.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("generation", &self.current_generation())
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}
