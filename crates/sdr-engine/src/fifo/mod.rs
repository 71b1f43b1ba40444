// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-stream bounded sample FIFO.
//!
//! One [`SampleFifo`] sits between the device workers and the engine pumps of
//! one (device instance, direction) pair. Each stream owns a heap ring buffer;
//! all streams share one lock so the synchronous pump can take an aligned
//! window across every stream in a single step.
//!
//! The device-facing side never blocks on the engine: acquisition writes are
//! lossy (samples that do not fit are dropped and counted), while generation
//! reads time out and the worker zero-fills. The pump-facing side blocks with
//! a timeout and can be woken early through [`SampleFifo::interrupt`].

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::Sample;

/// Minimum viable rate used as the floor of the sizing policy, so very low
/// configured rates still get a workable buffer.
pub const MIN_VIABLE_RATE: u32 = 48_000;

/// Ring capacity in samples for a post-decimation/interpolation sample rate
/// (~640 ms of buffering).
#[must_use]
pub fn size_policy(post_factor_rate: u32) -> usize {
    let rate = post_factor_rate.max(MIN_VIABLE_RATE) as usize;
    (rate / 100) * 64
}

struct StreamRing {
    producer: HeapProducer<Sample>,
    consumer: HeapConsumer<Sample>,
    /// Total samples dropped on the lossy producer side.
    dropped: u64,
    /// Number of write calls that dropped at least one sample.
    drop_events: u64,
}

impl StreamRing {
    fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::new(capacity).split();
        Self {
            producer,
            consumer,
            dropped: 0,
            drop_events: 0,
        }
    }
}

struct Inner {
    streams: Vec<StreamRing>,
    capacity: usize,
    interrupted: bool,
}

/// Bounded ring buffer shared by all streams of one direction.
pub struct SampleFifo {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl std::fmt::Debug for SampleFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SampleFifo")
            .field("num_streams", &inner.streams.len())
            .field("capacity", &inner.capacity)
            .field("interrupted", &inner.interrupted)
            .finish()
    }
}

impl SampleFifo {
    /// Create a FIFO with `num_streams` rings of `capacity` samples each.
    #[must_use]
    pub fn new(num_streams: usize, capacity: usize) -> Self {
        let streams = (0..num_streams).map(|_| StreamRing::new(capacity)).collect();
        Self {
            inner: Mutex::new(Inner {
                streams,
                capacity,
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of streams.
    #[must_use]
    pub fn num_streams(&self) -> usize {
        self.lock().streams.len()
    }

    /// Per-stream ring capacity in samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Buffered sample count for one stream.
    #[must_use]
    pub fn len(&self, stream: usize) -> usize {
        let inner = self.lock();
        inner.streams.get(stream).map_or(0, |s| s.consumer.len())
    }

    /// True when no stream holds any buffered samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.streams.iter().all(|s| s.consumer.is_empty())
    }

    /// Total samples dropped on the producer side of one stream.
    #[must_use]
    pub fn dropped(&self, stream: usize) -> u64 {
        let inner = self.lock();
        inner.streams.get(stream).map_or(0, |s| s.dropped)
    }

    /// Lossy producer write: accept what fits, drop and count the rest.
    ///
    /// Returns the number of samples accepted. The hardware clock must never
    /// block on the engine, so this call never waits.
    pub fn write(&self, stream: usize, samples: &[Sample]) -> usize {
        let mut inner = self.lock();
        if inner.interrupted {
            return 0;
        }
        let Some(ring) = inner.streams.get_mut(stream) else {
            return 0;
        };
        let accepted = ring.producer.push_slice(samples);
        let rejected = samples.len() - accepted;
        if rejected > 0 {
            ring.dropped += rejected as u64;
            ring.drop_events += 1;
            if ring.drop_events % 100 == 1 {
                warn!(
                    "fifo stream {stream}: dropped {rejected} samples (total {})",
                    ring.dropped
                );
            }
        }
        drop(inner);
        if accepted > 0 {
            self.not_empty.notify_all();
        }
        accepted
    }

    /// Blocking producer write used by generation pumps.
    ///
    /// Waits for ring space up to `timeout`; returns the number of samples
    /// written, which is less than `samples.len()` on timeout or interrupt.
    pub fn write_blocking(&self, stream: usize, samples: &[Sample], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        let mut inner = self.lock();
        loop {
            if inner.interrupted {
                return written;
            }
            if let Some(ring) = inner.streams.get_mut(stream) {
                written += ring.producer.push_slice(&samples[written..]);
            } else {
                return written;
            }
            if written > 0 {
                self.not_empty.notify_all();
            }
            if written == samples.len() {
                return written;
            }
            let now = Instant::now();
            if now >= deadline {
                return written;
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Blocking consumer read for one stream (asynchronous pump path).
    ///
    /// Returns the number of samples read, 0 on timeout or interrupt.
    pub fn read(&self, stream: usize, out: &mut [Sample], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.interrupted {
                return 0;
            }
            let n = inner
                .streams
                .get_mut(stream)
                .map_or(0, |ring| ring.consumer.pop_slice(out));
            if n > 0 {
                drop(inner);
                self.not_full.notify_all();
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Aligned consumer read across all streams (synchronous pump path).
    ///
    /// Waits until every stream has data, then takes the same number of
    /// samples (at most `max_per_stream`) from each, preserving
    /// stream-to-stream alignment. Each output vector is cleared and filled.
    /// Returns the per-stream count, 0 on timeout or interrupt.
    pub fn read_aligned(
        &self,
        outs: &mut [Vec<Sample>],
        max_per_stream: usize,
        timeout: Duration,
    ) -> usize {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.interrupted {
                return 0;
            }
            let available = inner
                .streams
                .iter()
                .map(|s| s.consumer.len())
                .min()
                .unwrap_or(0);
            if available > 0 {
                let n = available.min(max_per_stream);
                for (ring, out) in inner.streams.iter_mut().zip(outs.iter_mut()) {
                    out.clear();
                    out.resize(n, Sample::new(0.0, 0.0));
                    let taken = ring.consumer.pop_slice(out);
                    debug_assert_eq!(taken, n);
                }
                drop(inner);
                self.not_full.notify_all();
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Aligned producer write across all streams (synchronous generation
    /// pump path). All blocks must be the same length.
    ///
    /// Waits until every stream has room for the whole block, then writes to
    /// each. Returns the per-stream count, 0 on timeout or interrupt.
    pub fn write_aligned(&self, blocks: &[Vec<Sample>], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        let n = blocks.first().map_or(0, Vec::len).min(inner.capacity);
        if n == 0 {
            return 0;
        }
        loop {
            if inner.interrupted {
                return 0;
            }
            let free = inner
                .streams
                .iter()
                .map(|s| s.producer.free_len())
                .min()
                .unwrap_or(0);
            if free >= n {
                for (ring, block) in inner.streams.iter_mut().zip(blocks.iter()) {
                    let pushed = ring.producer.push_slice(&block[..n]);
                    debug_assert_eq!(pushed, n);
                }
                drop(inner);
                self.not_empty.notify_all();
                return n;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Resize every stream ring to `new_capacity` samples.
    ///
    /// Buffered samples are preserved oldest-first; when shrinking below the
    /// current fill level the newest overflow is dropped and logged.
    pub fn resize(&self, new_capacity: usize) {
        let mut inner = self.lock();
        if inner.capacity == new_capacity {
            return;
        }
        debug!(
            "fifo resize: {} -> {new_capacity} samples per stream",
            inner.capacity
        );
        for (index, ring) in inner.streams.iter_mut().enumerate() {
            let mut replacement = StreamRing::new(new_capacity);
            let mut moved = 0usize;
            let mut lost = 0usize;
            while let Some(sample) = ring.consumer.pop() {
                if replacement.producer.push(sample).is_ok() {
                    moved += 1;
                } else {
                    lost += 1;
                }
            }
            replacement.dropped = ring.dropped + lost as u64;
            replacement.drop_events = ring.drop_events;
            if lost > 0 {
                warn!("fifo stream {index}: resize dropped {lost} buffered samples (kept {moved})");
            }
            *ring = replacement;
        }
        inner.capacity = new_capacity;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Wake every blocked reader and writer; subsequent blocking calls
    /// return empty until [`SampleFifo::clear`].
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupted = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Discard all buffered samples and re-arm the FIFO after an interrupt.
    pub fn clear(&self) {
        let mut inner = self.lock();
        for ring in &mut inner.streams {
            while ring.consumer.pop().is_some() {}
        }
        inner.interrupted = false;
        drop(inner);
        self.not_full.notify_all();
    }
}
