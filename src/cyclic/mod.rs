//! Time-indexed ring of samples between a network receiver and the pipeline.
//!
//! Samples are addressed by absolute time, never by slot. Slot `t % capacity`
//! holds time `t` only while its recorded time equals `t`, so wraparound,
//! late packets and lost packets all reduce to the same check.
//!
//! # Concurrency
//!
//! One producer thread calls [`put_elements`](CyclicSampleBuffer::put_elements),
//! one consumer calls [`get_elements`](CyclicSampleBuffer::get_elements). The
//! write cursor is an atomic so waiting sides can poll it without taking the
//! lock; waits poll with a bounded sleep so the consumer can always observe
//! "not enough data yet" instead of deadlocking.
//!
//! # Overwrite policy
//!
//! With `allow_overwrite` the oldest samples are evicted silently (counted in
//! [`ProducerStats::evicted_unread`] when nobody read them). Without it a write
//! that would evict samples the consumer has not passed yet waits, or fails
//! with `CapacityExceeded` from [`try_put_elements`](CyclicSampleBuffer::try_put_elements).

pub mod flags;

pub use flags::SampleFlags;

use crate::error::{Result, RuntimeError};
use crossbeam_utils::{Backoff, CachePadded};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on a single sleep while polling
const MAX_POLL_SLEEP: Duration = Duration::from_millis(1);

/// Marks a slot that has never been written
const EMPTY_SLOT: u64 = u64::MAX;

/// Identifies a producer for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProducerId(pub u32);

/// Counters kept per producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProducerStats {
    /// Samples stored (per substream slice, counted once per time index)
    pub samples_written: u64,
    /// Samples overwritten before the consumer read past them
    pub evicted_unread: u64,
    /// Samples refused because overwrite is disallowed
    pub refused: u64,
    /// Samples dropped because they were older than the retained history
    pub late: u64,
}

impl ProducerStats {
    fn merge(&mut self, other: &ProducerStats) {
        self.samples_written += other.samples_written;
        self.evicted_unread += other.evicted_unread;
        self.refused += other.refused;
        self.late += other.late;
    }
}

struct CyclicState<T> {
    data: Vec<Vec<T>>,
    /// Absolute time held by each slot, per substream
    slot_time: Vec<Vec<u64>>,
    /// Earliest time ever written
    first_time: Option<u64>,
    /// Read anchor; `get_elements` offsets are relative to it
    anchor: u64,
    /// The consumer has passed every time before this one; `None` until a
    /// read is anchored or made
    read_end: Option<u64>,
    stats: BTreeMap<ProducerId, ProducerStats>,
}

/// Fixed-capacity, time-indexed sample ring.
pub struct CyclicSampleBuffer<T> {
    capacity: usize,
    substreams: usize,
    allow_overwrite: bool,
    window: u64,
    /// One past the latest time written
    head: CachePadded<AtomicU64>,
    cleared: AtomicBool,
    state: Mutex<CyclicState<T>>,
}

impl<T: Copy + Default + Send> CyclicSampleBuffer<T> {
    /// Create a ring holding `capacity` samples of each of `substreams` streams.
    ///
    /// `window` is the history length [`start_read(None)`](Self::start_read)
    /// waits for.
    pub fn new(capacity: usize, substreams: usize, allow_overwrite: bool, window: usize) -> Result<Self> {
        if capacity == 0 || substreams == 0 {
            return Err(RuntimeError::Config(format!(
                "cyclic buffer needs capacity and substreams > 0 (got {} x {})",
                capacity, substreams
            )));
        }
        if window > capacity {
            return Err(RuntimeError::Config(format!(
                "read window {} exceeds capacity {}",
                window, capacity
            )));
        }
        tracing::debug!(
            "Cyclic buffer: {} samples x {} substreams, overwrite={}",
            capacity,
            substreams,
            allow_overwrite
        );
        Ok(Self {
            capacity,
            substreams,
            allow_overwrite,
            window: window as u64,
            head: CachePadded::new(AtomicU64::new(0)),
            cleared: AtomicBool::new(false),
            state: Mutex::new(CyclicState {
                data: vec![vec![T::default(); capacity]; substreams],
                slot_time: vec![vec![EMPTY_SLOT; capacity]; substreams],
                first_time: None,
                anchor: 0,
                read_end: None,
                stats: BTreeMap::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn substreams(&self) -> usize {
        self.substreams
    }

    pub fn allows_overwrite(&self) -> bool {
        self.allow_overwrite
    }

    /// One past the latest time written.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CyclicState<T>>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::InvalidState("cyclic buffer lock poisoned".to_string()))
    }

    fn check_cleared(&self) -> Result<()> {
        if self.is_cleared() {
            return Err(RuntimeError::InvalidState("cyclic buffer was cleared".to_string()));
        }
        Ok(())
    }

    /// Lock the state of a buffer that has not been cleared.
    ///
    /// `clear()` raises the flag before it takes the lock, so checking under
    /// the lock guarantees the storage is still there.
    fn lock_live(&self) -> Result<MutexGuard<'_, CyclicState<T>>> {
        let state = self.lock()?;
        self.check_cleared()?;
        Ok(state)
    }

    /// Earliest time still retained, if anything was written.
    fn earliest_retained(&self, state: &CyclicState<T>) -> Option<u64> {
        let head = self.head();
        state
            .first_time
            .map(|first| first.max(head.saturating_sub(self.capacity as u64)))
    }

    /// Oldest retained sample the consumer has not passed yet, if any.
    fn oldest_unread(&self, state: &CyclicState<T>) -> Option<u64> {
        let earliest = self.earliest_retained(state)?;
        let oldest = state.read_end.map_or(earliest, |r| r.max(earliest));
        (oldest < self.head()).then_some(oldest)
    }

    /// Anchor the read cursor.
    ///
    /// With `Some(t)` the anchor is `t`. With `None` this waits until a full
    /// window of history is held and anchors at the earliest retained time.
    /// Returns the anchor.
    pub fn start_read(&self, at_time: Option<u64>) -> Result<u64> {
        let backoff = Backoff::new();
        loop {
            self.check_cleared()?;
            if let Some(anchor) = self.try_start_read(at_time)? {
                return Ok(anchor);
            }
            pause(&backoff);
        }
    }

    /// Non-waiting [`start_read`](Self::start_read): `Ok(None)` if no full
    /// window is held yet.
    pub fn try_start_read(&self, at_time: Option<u64>) -> Result<Option<u64>> {
        let mut state = self.lock_live()?;
        let anchor = match at_time {
            Some(t) => t,
            None => match self.earliest_retained(&state) {
                Some(earliest) if self.head() - earliest >= self.window => earliest,
                _ => return Ok(None),
            },
        };
        state.anchor = anchor;
        state.read_end = Some(anchor);
        tracing::debug!("Cyclic buffer read anchored at {}", anchor);
        Ok(Some(anchor))
    }

    /// Current read anchor.
    pub fn anchor(&self) -> Result<u64> {
        Ok(self.lock()?.anchor)
    }

    fn validate_put(&self, samples: &[&[T]]) -> Result<usize> {
        if samples.len() != self.substreams {
            return Err(RuntimeError::InvalidState(format!(
                "put of {} substreams into a buffer of {}",
                samples.len(),
                self.substreams
            )));
        }
        let mut n = 0;
        for s in samples.iter().filter(|s| !s.is_empty()) {
            if n != 0 && s.len() != n {
                return Err(RuntimeError::InvalidState(
                    "substream slices of one put differ in length".to_string(),
                ));
            }
            n = s.len();
        }
        if !self.allow_overwrite && n > self.capacity {
            return Err(RuntimeError::CapacityExceeded {
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(n)
    }

    /// Store samples for times `[time, time + n)`.
    ///
    /// `samples` has one slice per substream; an empty slice means that
    /// substream has no data for this range. Without overwrite this waits
    /// until the consumer has passed enough history.
    pub fn put_elements(&self, producer: ProducerId, time: u64, samples: &[&[T]]) -> Result<()> {
        let n = self.validate_put(samples)?;
        let backoff = Backoff::new();
        loop {
            let mut state = self.lock_live()?;
            if self.fits(&state, time, n) {
                self.store(&mut state, producer, time, samples, n);
                return Ok(());
            }
            drop(state);
            pause(&backoff);
        }
    }

    /// Like [`put_elements`](Self::put_elements) but fails with
    /// `CapacityExceeded` instead of waiting.
    pub fn try_put_elements(&self, producer: ProducerId, time: u64, samples: &[&[T]]) -> Result<()> {
        let n = self.validate_put(samples)?;
        let mut state = self.lock_live()?;
        if !self.fits(&state, time, n) {
            let oldest = self.oldest_unread(&state).unwrap_or(time);
            state.stats.entry(producer).or_default().refused += n as u64;
            tracing::debug!(
                "Cyclic buffer refused {} samples at {} (oldest unread {})",
                n,
                time,
                oldest
            );
            return Err(RuntimeError::CapacityExceeded {
                requested: (time + n as u64).saturating_sub(oldest) as usize,
                capacity: self.capacity,
            });
        }
        self.store(&mut state, producer, time, samples, n);
        Ok(())
    }

    /// Whether `[time, time + n)` can be stored without evicting unread samples.
    fn fits(&self, state: &CyclicState<T>, time: u64, n: usize) -> bool {
        self.allow_overwrite
            || self
                .oldest_unread(state)
                .map_or(true, |oldest| time + n as u64 <= oldest + self.capacity as u64)
    }

    fn store(
        &self,
        state: &mut CyclicState<T>,
        producer: ProducerId,
        time: u64,
        samples: &[&[T]],
        n: usize,
    ) {
        if n == 0 {
            return;
        }
        let cap = self.capacity as u64;
        let end = time + n as u64;
        let old_head = self.head();
        let oldest_kept = old_head.saturating_sub(cap);
        let read_end = state.read_end.unwrap_or(0);
        let mut stats = ProducerStats::default();

        for i in 0..n {
            let t = time + i as u64;
            if t < oldest_kept {
                stats.late += 1;
                continue;
            }
            let slot = (t % cap) as usize;
            let mut stored = false;
            for (s, slice) in samples.iter().enumerate() {
                if slice.is_empty() {
                    continue;
                }
                let old = state.slot_time[s][slot];
                if old != EMPTY_SLOT && old > t {
                    continue;
                }
                if old != EMPTY_SLOT && old != t && old >= read_end {
                    stats.evicted_unread += 1;
                }
                state.data[s][slot] = slice[i];
                state.slot_time[s][slot] = t;
                stored = true;
            }
            if stored {
                stats.samples_written += 1;
            } else {
                stats.late += 1;
            }
        }

        if stats.evicted_unread > 0 {
            tracing::debug!(
                "Cyclic buffer evicted {} unread samples writing [{}, {})",
                stats.evicted_unread,
                time,
                end
            );
        }
        state.first_time = Some(state.first_time.map_or(time, |f| f.min(time)));
        state.stats.entry(producer).or_default().merge(&stats);
        self.head.store(old_head.max(end), Ordering::Release);
    }

    /// Copy `length` samples per substream starting `start` samples after the
    /// anchor.
    ///
    /// Samples that are not present get `T::default()` and their bit set in
    /// the matching `flags` entry, which is resized to `length`. Returns the
    /// number of missing samples over all substreams.
    pub fn get_elements(
        &self,
        out: &mut [&mut [T]],
        flags: &mut [SampleFlags],
        start: u64,
        length: usize,
    ) -> Result<usize> {
        if out.len() != self.substreams || flags.len() != self.substreams {
            return Err(RuntimeError::InvalidState(format!(
                "get of {} outputs / {} flag sets from a buffer of {} substreams",
                out.len(),
                flags.len(),
                self.substreams
            )));
        }
        if let Some(short) = out.iter().position(|o| o.len() < length) {
            return Err(RuntimeError::CapacityExceeded {
                requested: length,
                capacity: out[short].len(),
            });
        }
        let mut state = self.lock_live()?;
        let cap = self.capacity as u64;
        let first = state.anchor + start;
        let mut missing = 0;
        for s in 0..self.substreams {
            flags[s].reset(length);
            for i in 0..length {
                let t = first + i as u64;
                let slot = (t % cap) as usize;
                if state.slot_time[s][slot] == t {
                    out[s][i] = state.data[s][slot];
                } else {
                    out[s][i] = T::default();
                    flags[s].set(i);
                    missing += 1;
                }
            }
        }
        let end = first + length as u64;
        state.read_end = Some(state.read_end.map_or(end, |r| r.max(end)));
        Ok(missing)
    }

    /// Wait until the write cursor reaches `end` (relative to the anchor) or
    /// `max_wait` has passed. Returns whether it got there.
    pub fn wait_until_written(&self, end: u64, max_wait: Duration) -> Result<bool> {
        let target = self.anchor()? + end;
        let deadline = Instant::now() + max_wait;
        let backoff = Backoff::new();
        loop {
            self.check_cleared()?;
            if self.head() >= target {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            pause(&backoff);
        }
    }

    /// Statistics for one producer.
    pub fn producer_stats(&self, producer: ProducerId) -> Result<ProducerStats> {
        Ok(self
            .lock()?
            .stats
            .get(&producer)
            .copied()
            .unwrap_or_default())
    }

    /// Statistics summed over all producers.
    pub fn total_stats(&self) -> Result<ProducerStats> {
        let state = self.lock()?;
        let mut total = ProducerStats::default();
        for stats in state.stats.values() {
            total.merge(stats);
        }
        Ok(total)
    }

    /// Release the storage and wake every waiter, which then fails.
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        if let Ok(mut state) = self.state.lock() {
            state.data = Vec::new();
            state.slot_time = Vec::new();
            state.first_time = None;
        }
        tracing::debug!("Cyclic buffer cleared");
    }
}

fn pause(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(MAX_POLL_SLEEP);
    } else {
        backoff.snooze();
    }
}
