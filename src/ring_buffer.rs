//! Lock-free single-producer/single-consumer ring buffer.
//!
//! This is the one synchronization primitive every stage of the pipeline is built on: the
//! network, extractor, and processor threads never share a mutex on the data path, only a
//! pair of atomic counters per buffer.
//!
//! Rather than wrapping push/pop indices back into `[0, capacity)` (which makes
//! `push == pop` ambiguous between empty and full), both counters run continuously for the
//! life of the buffer. `push_counter == pop_counter` is empty; `push_counter == pop_counter +
//! capacity` is full. Because the counters never reset, they also double as a synchronization
//! point across channels: two channel buffers fed from the same shot stream can be compared by
//! counter value without any separate timestamp.
//!
//! Only one thread may call the producer-side methods (`push`, `future_element`, `publish`,
//! `terminate`) and only one thread may call the consumer-side methods (`pop`, `pop_to`,
//! `range`). Any other usage is undefined behavior.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{DaqError, DaqResult};

fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// A contiguous, flattened view into a ring buffer's backing store, returned by
/// [`RingBuffer::range`]. Borrows the buffer for its lifetime.
#[derive(Debug)]
pub struct RangeView<'a, T> {
    slice: &'a [T],
    /// The first counter actually covered by this view. May be less than the counter requested
    /// when the buffer terminated early.
    pub from: usize,
    /// One past the last counter covered by this view.
    pub to: usize,
}

impl<'a, T> RangeView<'a, T> {
    /// The number of elements actually returned; `to - from`.
    pub fn len(&self) -> usize {
        self.slice.len()
    }

    /// True if the producer terminated before any of the requested range arrived.
    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }
}

impl<'a, T> std::ops::Deref for RangeView<'a, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.slice
    }
}

/// Running fill-level statistics, sampled on every `push`/`publish`.
#[derive(Debug, Default)]
struct Stats {
    sum_size: f64,
    sum_size2: f64,
    sum_n: f64,
    max_size: usize,
}

impl Stats {
    fn sample(&mut self, size: usize) {
        let s = size as f64;
        self.sum_n += 1.0;
        self.sum_size += s;
        self.sum_size2 += s * s;
        if size > self.max_size {
            self.max_size = size;
        }
    }
}

/// A fixed-capacity, power-of-two-sized SPSC ring buffer with monotonically running counters.
///
/// `extra_size` elements of slack are reserved past `capacity` so that a [`RingBuffer::range`]
/// request whose span wraps past the end of the backing slab can be flattened into contiguous
/// memory by copying the wrapped prefix into the slack.
/// Bytes of padding following the counter pair so the pair fills exactly one cache line,
/// isolated from the fields that follow it.
const COUNTER_PAD: usize = 64 - 2 * std::mem::size_of::<AtomicUsize>();

#[repr(C)]
pub struct RingBuffer<T> {
    // Both counters are read by producer and consumer alike, so `repr(C)` plus explicit
    // padding keeps the pair on one cache line of its own — the Rust equivalent of the
    // original's `alignas(std::hardware_destructive_interference_size)` on this pair.
    push_counter: AtomicUsize,
    pop_counter: AtomicUsize,
    _counter_pad: [u8; COUNTER_PAD],
    buffer: Box<[UnsafeCell<T>]>,
    mask: usize,
    extra_size: usize,
    terminated: AtomicBool,
    stats: UnsafeCell<Stats>,
    /// Whether `mlock` succeeded in pinning `buffer` against paging. Recorded so `Drop` only
    /// calls `munlock` on memory it actually locked.
    locked: bool,
}

// SAFETY: `RingBuffer<T>` is sound to share between exactly one producer thread and one
// consumer thread. The producer only ever writes slots at indices it alone can reach
// (guarded by `future_element`'s spin-wait against `pop_counter`), and the consumer only ever
// reads slots already published via `publish`'s release store. `Stats` is only ever touched
// by the producer.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Default + Clone> RingBuffer<T> {
    /// Construct a ring buffer of `capacity` slots (must be a power of two) plus `extra_size`
    /// slack slots used for flattening wrapped ranges.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] if `capacity` is zero or not a power of two, or
    /// [`DaqError::Resource`] if the backing store can't be pinned into physical memory.
    pub fn new(capacity: usize, extra_size: usize) -> DaqResult<Self> {
        Self::new_with(capacity, extra_size, T::default)
    }
}

impl<T> RingBuffer<T> {
    /// Construct a ring buffer whose backing slots are produced by `init`, called once per
    /// slot. Useful when `T` carries a pre-sized allocation (e.g. a packet payload buffer)
    /// that a plain `Default` can't express.
    ///
    /// # Errors
    /// Returns [`DaqError::Configuration`] if `capacity` is zero or not a power of two, or
    /// [`DaqError::Resource`] if the backing store can't be pinned into physical memory.
    pub fn new_with(capacity: usize, extra_size: usize, init: impl Fn() -> T) -> DaqResult<Self> {
        if !is_power_of_two(capacity) {
            return Err(DaqError::Configuration(format!(
                "ring buffer capacity {capacity} must be a nonzero power of two"
            )));
        }
        let total = capacity + extra_size;
        let buffer: Box<[UnsafeCell<T>]> = (0..total)
            .map(|_| UnsafeCell::new(init()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let byte_len = std::mem::size_of::<T>() * total;
        let locked = if byte_len == 0 {
            false
        } else {
            // SAFETY: `buffer` is a live allocation of at least `byte_len` bytes for the
            // duration of this call.
            let rc = unsafe { libc::mlock(buffer.as_ptr() as *const libc::c_void, byte_len) };
            if rc != 0 {
                let errno = std::io::Error::last_os_error();
                return Err(DaqError::Resource(format!(
                    "mlock failed for ring buffer backing store ({byte_len} bytes): {errno}"
                )));
            }
            true
        };

        Ok(Self {
            push_counter: AtomicUsize::new(0),
            pop_counter: AtomicUsize::new(0),
            _counter_pad: [0u8; COUNTER_PAD],
            buffer,
            mask: capacity - 1,
            extra_size,
            terminated: AtomicBool::new(false),
            stats: UnsafeCell::new(Stats::default()),
            locked,
        })
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        if self.locked {
            let byte_len = std::mem::size_of::<T>() * self.buffer.len();
            // SAFETY: the same region successfully passed to `mlock` in `new_with`, still
            // live until this drop runs.
            unsafe {
                libc::munlock(self.buffer.as_ptr() as *const libc::c_void, byte_len);
            }
        }
    }
}

impl<T> RingBuffer<T> {
    /// Capacity in elements (excluding the flattening slack).
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Current number of elements stored (producer's view; may be stale by the time it is
    /// read from the consumer side, and vice versa).
    pub fn size(&self) -> usize {
        self.push_counter.load(Ordering::Acquire) - self.pop_counter.load(Ordering::Acquire)
    }

    /// True if there are no elements currently available to the consumer.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The producer's running push counter.
    pub fn push_counter(&self) -> usize {
        self.push_counter.load(Ordering::Acquire)
    }

    /// The consumer's running pop counter.
    pub fn pop_counter(&self) -> usize {
        self.pop_counter.load(Ordering::Acquire)
    }

    /// Mark the stream as finished: the producer will never push again. Consumers blocked in
    /// [`RingBuffer::range`] observe this and return whatever is already available instead of
    /// spinning forever.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// Whether [`RingBuffer::terminate`] has been called.
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Producer-only. Push a value, returning `true` on success and `false` if the buffer is
    /// full (caller must retry with backoff or treat as backpressure).
    pub fn push(&self, value: T) -> bool {
        let push = self.push_counter.load(Ordering::Relaxed);
        let pop = self.pop_counter.load(Ordering::Relaxed);
        if push >= pop + self.mask + 1 {
            return false;
        }

        // SAFETY: producer-exclusive slot, not yet visible to the consumer (push_counter has
        // not advanced past it yet).
        unsafe {
            *self.buffer[push & self.mask].get() = value;
        }

        self.sample_stats();
        self.push_counter.store(push + 1, Ordering::Release);
        true
    }

    /// Producer-only. Return a pointer-like handle to the slot that will become the `n`-th
    /// upcoming element (`n = 0` is the very next push), spin-waiting until it is free.
    /// Data written through the returned reference is not visible to the consumer until
    /// [`RingBuffer::publish`] is called.
    pub fn future_element(&self, n: usize) -> &UnsafeCell<T> {
        let push = self.push_counter.load(Ordering::Relaxed);
        while self.pop_counter.load(Ordering::Relaxed) + self.mask + 1 <= push + n {
            std::hint::spin_loop();
        }
        &self.buffer[(push + n) & self.mask]
    }

    /// Producer-only. Make `n` previously-prepared future elements (via `future_element`)
    /// visible to the consumer at once.
    pub fn publish(&self, n: usize) {
        self.sample_stats();
        self.push_counter.fetch_add(n, Ordering::Release);
    }

    fn sample_stats(&self) {
        let size = self.size();
        // SAFETY: only the producer thread calls `push`/`publish`, so this is not concurrently
        // mutated.
        unsafe {
            (*self.stats.get()).sample(size);
        }
    }

    /// Consumer-only. Remove the front element without reading it.
    pub fn pop(&self) -> bool {
        let pop = self.pop_counter.load(Ordering::Relaxed);
        let push = self.push_counter.load(Ordering::Acquire);
        if push == pop {
            return false;
        }
        self.pop_counter.store(pop + 1, Ordering::Relaxed);
        true
    }

    /// Consumer-only. Bulk-reclaim: set the pop counter directly to `counter`, releasing every
    /// slot before it in one step. Used by the scheduler after a processor pass.
    pub fn pop_to(&self, counter: usize) {
        self.pop_counter.store(counter, Ordering::Relaxed);
    }

    /// Consumer-only. Index relative to the current pop counter (`index = 0` is the current
    /// front element). Does not bounds-check against `size()`.
    pub fn get(&self, index: usize) -> &T {
        let pop = self.pop_counter.load(Ordering::Relaxed);
        // SAFETY: the slot at `pop + index` has already been published by the producer as long
        // as the caller respects `index < size()`, which is this method's documented contract.
        unsafe { &*self.buffer[(pop + index) & self.mask].get() }
    }

    /// Direct, unchecked access by absolute counter rather than an offset from `pop_counter`.
    /// Used by processors (e.g. disk dump) that address samples by the scheduler's shared
    /// `(from, to)` counters instead of a relative index. The caller is responsible for only
    /// querying counters still resident in the buffer.
    pub fn at(&self, counter: usize) -> &T {
        // SAFETY: see `get` — caller's responsibility that `counter` is still within the
        // currently published, not-yet-reclaimed window.
        unsafe { &*self.buffer[counter & self.mask].get() }
    }

    /// Consumer-only. As [`RingBuffer::get`], but mutable. Sound because a published, not-yet-
    /// popped slot is exclusively owned by the consumer until it pops past it — the producer
    /// only reclaims (and rewrites) a slot once `pop_counter` has advanced beyond it.
    pub fn get_mut(&self, index: usize) -> &mut T {
        let pop = self.pop_counter.load(Ordering::Relaxed);
        // SAFETY: see above; `index < size()` is this method's documented contract.
        unsafe { &mut *self.buffer[(pop + index) & self.mask].get() }
    }

    /// Consumer-only. Spin-wait until `[from, to)` is fully available or the stream
    /// terminates, then return a flattened contiguous view. If the stream terminates first,
    /// the returned range is clamped to whatever was actually published.
    ///
    /// # Errors
    /// Returns [`DaqError::RangeFlattening`] if the requested range wraps past the end of the
    /// backing slab by more than `extra_size` elements.
    pub fn range(&self, from: usize, to: usize) -> DaqResult<RangeView<'_, T>> {
        let mut to = to;
        loop {
            let push = self.push_counter.load(Ordering::Acquire);
            if push >= to {
                break;
            }
            if self.terminated() {
                let push = self.push_counter.load(Ordering::Acquire);
                if push < to {
                    to = push;
                }
                break;
            }
            std::hint::spin_loop();
        }

        if to <= from {
            return Ok(RangeView {
                slice: &[],
                from,
                to: from,
            });
        }

        if (to & self.mask) < (from & self.mask) {
            let n = to - from;
            let n_back = (self.mask + 1) - (from & self.mask);
            let n_front = n - n_back;
            if n_front > self.extra_size {
                return Err(DaqError::RangeFlattening {
                    requested: n_front,
                    available: self.extra_size,
                });
            }
            // SAFETY: copying already-published, producer-owned bytes that the consumer is
            // about to read; the destination is the reserved slack region, never concurrently
            // written by the producer.
            unsafe {
                let src = self.buffer.as_ptr() as *const T;
                let dst = self.buffer.as_ptr().add(self.mask + 1) as *mut T;
                std::ptr::copy_nonoverlapping(src, dst, n_front);
            }
        }

        let start = from & self.mask;
        // SAFETY: `[start, start + (to - from))` is within `buffer` by construction: either it
        // did not wrap (bounded by `mask + 1`), or the wrapped prefix was just flattened into
        // the slack immediately following it.
        let slice = unsafe {
            std::slice::from_raw_parts(self.buffer[start].get() as *const T, to - from)
        };

        Ok(RangeView { slice, from, to })
    }

    /// Mean fill level, sampled at every `push`/`publish` call.
    pub fn mean_size(&self) -> f64 {
        // SAFETY: read-only access to stats; races with concurrent producer mutation are
        // benign (the values are used only for a human-readable end-of-run summary).
        let stats = unsafe { &*self.stats.get() };
        stats.sum_size / stats.sum_n
    }

    /// Standard deviation of the fill level.
    pub fn sd_size(&self) -> f64 {
        let stats = unsafe { &*self.stats.get() };
        let mean = stats.sum_size / stats.sum_n;
        (stats.sum_size2 / stats.sum_n - mean * mean).sqrt()
    }

    /// Maximum observed fill level.
    pub fn max_size(&self) -> usize {
        let stats = unsafe { &*self.stats.get() };
        stats.max_size
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("push_counter", &self.push_counter())
            .field("pop_counter", &self.pop_counter())
            .field("terminated", &self.terminated())
            .finish()
    }
}
