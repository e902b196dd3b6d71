//! Bounded sample cache with embedded format tracking
//!
//! A [`SampleCache`] couples one producer with one consumer through a fixed
//! ring of interleaved samples. Alongside the samples it keeps a FIFO of
//! [format](crate::format::SampleFormat) segments so a mid-stream format
//! change becomes visible to the consumer at exactly the sample offset where
//! production switched.
//!
//! The producer side is parameterized by a [`FillPolicy`]: an eager
//! background thread, a lazy top-up performed by the consumer after each
//! read, or an external writer pushing through [`SampleCache::writer`]. All
//! three share the same ring and segment state machine.
//!
//! # Locking
//! Two tiers. The fine `state` mutex guards the ring and the segment list
//! and is only ever held for short copies. The coarse producer *gate*
//! serializes whole producer batches; [`SampleCache::lock`] freezes it so an
//! external caller can flush or take over the consumer position while no
//! batch is in flight. Order is gate first, then state, never the reverse.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::format::SampleFormat;
use crate::sample::Sample;
use crate::source::{SampleSink, SampleSource, SourceRead};
use crate::{MixerError, Result};

/// Samples staged per producer-thread batch before committing to the ring.
const STAGING_SAMPLES: usize = 2048;

/// Producer backoff while the ring has no room for the staged batch.
const FULL_BACKOFF: Duration = Duration::from_millis(1);

/// How the cache gets filled.
pub enum FillPolicy<S: Sample> {
    /// A dedicated thread pulls the source as fast as the ring allows.
    EagerThread(Box<dyn SampleSource<S>>),
    /// The consumer tops the ring up after each [`SampleCache::read`].
    LazyPull(Box<dyn SampleSource<S>>),
    /// An external producer pushes samples through [`SampleCache::writer`].
    ExternalWrite,
}

/// A format annotation attached to a contiguous run of samples.
///
/// `len` is the number of samples that remain under the *previous* segment's
/// format before this one becomes authoritative; once a segment reaches the
/// head of the queue its own `len` is spent.
struct FormatSegment {
    fmt: SampleFormat,
    len: u64,
}

struct CacheState<S> {
    buf: Vec<S>,
    read_pos: usize,
    len: usize,
    /// High-water latch: set once the ring fills (or the source ends with
    /// samples still queued), cleared when drained to empty.
    is_ready: bool,
    /// The source reported end-of-stream; once the ring drains, reads return
    /// [`SourceRead::EndOfStream`] forever.
    eos: bool,
    segments: VecDeque<FormatSegment>,
    /// Samples accumulated under the newest segment.
    fmt_len: u64,
}

impl<S: Sample> CacheState<S> {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Producer rule: append `src` to the ring tail, recording a new format
    /// segment when the reported format differs from the newest one (or when
    /// no segment exists yet). Returns the number of samples that fit.
    fn commit(&mut self, src: &[S], in_fmt: &SampleFormat) -> usize {
        let cap = self.capacity();
        let n = src.len().min(cap - self.len);
        if n == 0 {
            return 0;
        }

        let write_pos = (self.read_pos + self.len) % cap;
        let first = n.min(cap - write_pos);
        self.buf[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        if n > first {
            self.buf[..n - first].copy_from_slice(&src[first..n]);
        }

        let needs_segment = match self.segments.back() {
            None => true,
            Some(tail) => in_fmt.is_specified() && *in_fmt != tail.fmt,
        };
        if needs_segment {
            self.segments.push_back(FormatSegment {
                fmt: *in_fmt,
                len: self.fmt_len,
            });
            self.fmt_len = 0;
        }
        self.fmt_len += n as u64;

        self.len += n;
        if self.len == cap {
            self.is_ready = true;
        }
        n
    }

    fn clear(&mut self) {
        self.len = 0;
        self.read_pos = 0;
        self.is_ready = false;
        self.segments.clear();
        self.fmt_len = 0;
    }

    fn latch_eos(&mut self) {
        self.eos = true;
        // Let a stream shorter than the high-water mark drain its tail.
        if self.len > 0 {
            self.is_ready = true;
        }
    }
}

#[derive(Default)]
struct GateState {
    frozen: bool,
    busy: bool,
}

/// Coarse producer gate: `busy` marks a batch in flight, `frozen` bars new
/// batches until thawed. Freezing waits out the in-flight batch, which is
/// what makes an external flush an atomic takeover.
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Gate {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Producer batch entry. Returns false if `stop` was raised while
    /// waiting.
    fn acquire(&self, stop: &AtomicBool) -> bool {
        let mut st = self.state.lock();
        while st.frozen || st.busy {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.cond.wait(&mut st);
        }
        st.busy = true;
        true
    }

    fn try_acquire(&self) -> bool {
        let mut st = self.state.lock();
        if st.frozen || st.busy {
            false
        } else {
            st.busy = true;
            true
        }
    }

    fn release(&self) {
        self.state.lock().busy = false;
        self.cond.notify_all();
    }

    fn freeze(&self) {
        let mut st = self.state.lock();
        while st.busy {
            self.cond.wait(&mut st);
        }
        st.frozen = true;
    }

    fn thaw(&self) {
        self.state.lock().frozen = false;
        self.cond.notify_all();
    }
}

struct CacheShared<S: Sample> {
    state: Mutex<CacheState<S>>,
    gate: Gate,
    /// Producer callback; only the gate holder touches it.
    source: Option<Mutex<Box<dyn SampleSource<S>>>>,
    /// Output-side format, used for millisecond conversions.
    fmt: SampleFormat,
    /// Tells a producer thread to discard its staged samples.
    flush_pending: AtomicBool,
    stop: AtomicBool,
    /// Consumer performs the lazy top-up after each read.
    lazy: bool,
}

/// Bounded producer/consumer sample buffer with format annotations.
pub struct SampleCache<S: Sample> {
    shared: Arc<CacheShared<S>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: Sample> SampleCache<S> {
    /// Open a cache holding `size` interleaved samples.
    ///
    /// `fmt` is the format the consumer side drains at; it only feeds the
    /// millisecond conversions of [`delay_ms`](Self::delay_ms) and
    /// [`set_time`](Self::set_time). With
    /// [`FillPolicy::EagerThread`] a producer thread is spawned immediately.
    ///
    /// # Errors
    /// `ConfigError` if `size` is zero.
    pub fn open(size: usize, fmt: SampleFormat, policy: FillPolicy<S>) -> Result<Self> {
        if size == 0 {
            return Err(MixerError::ConfigError(
                "cache size must be greater than 0".to_string(),
            ));
        }

        let (source, lazy, eager) = match policy {
            FillPolicy::EagerThread(src) => (Some(src), false, true),
            FillPolicy::LazyPull(src) => (Some(src), true, false),
            FillPolicy::ExternalWrite => (None, false, false),
        };

        let shared = Arc::new(CacheShared {
            state: Mutex::new(CacheState {
                buf: vec![S::SILENCE; size],
                read_pos: 0,
                len: 0,
                is_ready: false,
                eos: false,
                segments: VecDeque::new(),
                fmt_len: 0,
            }),
            gate: Gate::new(),
            source: source.map(Mutex::new),
            fmt,
            flush_pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            lazy,
        });

        let thread = if eager {
            let worker = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("sndmix-cache".to_string())
                    .spawn(move || fill_loop(worker))
                    .map_err(|e| MixerError::ThreadError(format!("cache producer: {e}")))?,
            )
        } else {
            None
        };

        Ok(SampleCache { shared, thread })
    }

    /// Consumer pull. Returns `Frames(0)` while the ring is still filling
    /// toward its high-water mark, the delivered sample count otherwise, and
    /// `EndOfStream` once the source has ended and the ring is drained.
    ///
    /// The format of the delivered samples is copied into `out_fmt`; a read
    /// never crosses a format boundary, so a request spanning one is
    /// shortened to the boundary and the next call continues under the new
    /// format.
    pub fn read(&self, dest: &mut [S], out_fmt: &mut SampleFormat) -> SourceRead {
        let shared = &self.shared;
        let n_read = {
            let mut state = shared.state.lock();
            if state.eos && state.len == 0 {
                return SourceRead::EndOfStream;
            }
            if !state.is_ready {
                0
            } else {
                let mut n = dest.len().min(state.len);

                if !state.segments.is_empty() {
                    *out_fmt = state.segments[0].fmt;
                    if state.segments.len() > 1 {
                        if (state.segments[1].len as usize) < n {
                            // Stop at the format boundary; the next read
                            // starts under the new head.
                            n = state.segments[1].len as usize;
                            state.segments.pop_front();
                            state.segments[0].len = 0;
                        } else {
                            state.segments[1].len -= n as u64;
                        }
                    } else {
                        state.fmt_len = state.fmt_len.saturating_sub(n as u64);
                    }
                }

                let cap = state.capacity();
                let first = n.min(cap - state.read_pos);
                dest[..first].copy_from_slice(&state.buf[state.read_pos..state.read_pos + first]);
                if n > first {
                    dest[first..n].copy_from_slice(&state.buf[..n - first]);
                }
                state.read_pos = (state.read_pos + n) % cap;
                state.len -= n;
                if state.len == 0 {
                    state.is_ready = false;
                }
                n
            }
        };

        if shared.lazy {
            self.refill();
            let state = shared.state.lock();
            if n_read == 0 && state.eos && state.len == 0 {
                return SourceRead::EndOfStream;
            }
        }

        SourceRead::Frames(n_read)
    }

    /// Lazy top-up: pull the source once if the gate is free and there is
    /// room. Runs on the consumer thread, outside the state lock.
    fn refill(&self) {
        let shared = &self.shared;
        let room = {
            let state = shared.state.lock();
            state.capacity() - state.len
        };
        if room == 0 {
            return;
        }
        if !shared.gate.try_acquire() {
            return;
        }
        let source = match &shared.source {
            Some(src) => src,
            None => {
                shared.gate.release();
                return;
            }
        };

        let mut staging = vec![S::SILENCE; room];
        let mut in_fmt = SampleFormat::UNSPECIFIED;
        let outcome = source.lock().read(&mut staging, &mut in_fmt);
        {
            let mut state = shared.state.lock();
            match outcome {
                SourceRead::Frames(n) => {
                    let n = n.min(staging.len());
                    state.commit(&staging[..n], &in_fmt);
                }
                SourceRead::EndOfStream => state.latch_eos(),
            }
        }
        shared.gate.release();
    }

    /// Push-mode producer entry; accepts what fits and returns the count.
    /// Returns 0 without blocking while the gate is frozen or busy.
    pub fn write(&self, src: &[S], fmt: &SampleFormat) -> usize {
        write_shared(&self.shared, src, fmt)
    }

    /// A cloneable [`SampleSink`] handle feeding this cache, for wiring a
    /// push-style filter stage in front of it.
    pub fn writer(&self) -> CacheWriter<S> {
        CacheWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Freeze the producer gate. Blocks until an in-flight producer batch
    /// completes, after which production stays barred until
    /// [`unlock`](Self::unlock).
    pub fn lock(&self) {
        self.shared.gate.freeze();
    }

    /// Thaw the producer gate.
    pub fn unlock(&self) {
        self.shared.gate.thaw();
    }

    /// Empty the ring and the format list and tell a producer thread to drop
    /// whatever it has staged. Leaves the producer gate frozen; the caller
    /// thaws it (typically by resuming playback). Flushing twice is a no-op.
    pub fn flush(&self) {
        self.shared.gate.freeze();
        let mut state = self.shared.state.lock();
        state.clear();
        if self.thread.is_some() {
            self.shared.flush_pending.store(true, Ordering::Release);
        }
    }

    /// True once the high-water mark was reached and data remains.
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().is_ready
    }

    /// Fill level as an integer percentage. A ready cache reports 100.
    pub fn filling(&self) -> u8 {
        let state = self.shared.state.lock();
        if state.is_ready {
            100
        } else {
            (state.len * 100 / state.capacity()) as u8
        }
    }

    /// Number of samples currently buffered.
    pub fn len(&self) -> usize {
        self.shared.state.lock().len
    }

    /// True when no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity()
    }

    /// Buffered audio expressed in milliseconds of the output format.
    pub fn delay_ms(&self) -> u64 {
        let len = self.len() as u64;
        self.shared.fmt.ms_for_samples(len)
    }

    /// Resize the ring to hold `ms` milliseconds of the output format.
    /// Queued samples are preserved oldest-first; when shrinking, the newest
    /// samples are discarded and the format accounting is unwound with them.
    ///
    /// # Errors
    /// `ConfigError` if `ms` converts to zero samples.
    pub fn set_time(&self, ms: u64) -> Result<()> {
        let new_cap = self.shared.fmt.samples_for_ms(ms) as usize;
        if new_cap == 0 {
            return Err(MixerError::ConfigError(format!(
                "cache time {ms}ms converts to an empty buffer"
            )));
        }

        let mut state = self.shared.state.lock();
        let keep = state.len.min(new_cap);
        let mut buf = vec![S::SILENCE; new_cap];
        let cap = state.capacity();
        for (i, slot) in buf.iter_mut().enumerate().take(keep) {
            *slot = state.buf[(state.read_pos + i) % cap];
        }

        // Unwind segment accounting for the discarded tail.
        let mut discard = state.len - keep;
        while discard > 0 {
            if state.fmt_len as usize >= discard {
                state.fmt_len -= discard as u64;
                discard = 0;
            } else {
                discard -= state.fmt_len as usize;
                state.fmt_len = state.segments.pop_back().map_or(0, |seg| seg.len);
            }
        }

        state.buf = buf;
        state.read_pos = 0;
        state.len = keep;
        if state.len == new_cap {
            state.is_ready = true;
        } else if state.len == 0 {
            state.is_ready = false;
        }
        Ok(())
    }
}

impl<S: Sample> Drop for SampleCache<S> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        // Wake a producer parked on a frozen gate so it can observe stop.
        self.shared.gate.thaw();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn write_shared<S: Sample>(shared: &CacheShared<S>, src: &[S], fmt: &SampleFormat) -> usize {
    if !shared.gate.try_acquire() {
        return 0;
    }
    let n = shared.state.lock().commit(src, fmt);
    shared.gate.release();
    n
}

/// Push-side handle to a cache opened with [`FillPolicy::ExternalWrite`].
pub struct CacheWriter<S: Sample> {
    shared: Arc<CacheShared<S>>,
}

impl<S: Sample> Clone for CacheWriter<S> {
    fn clone(&self) -> Self {
        CacheWriter {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Sample> SampleSink<S> for CacheWriter<S> {
    fn write(&mut self, src: &[S], fmt: &SampleFormat) -> usize {
        write_shared(&self.shared, src, fmt)
    }
}

/// Eager producer loop: stage a batch from the source under the gate, commit
/// what fits, carry the leftover, back off briefly when the ring is full.
fn fill_loop<S: Sample>(shared: Arc<CacheShared<S>>) {
    let source = match &shared.source {
        Some(src) => src,
        None => return,
    };

    let mut staging = vec![S::SILENCE; STAGING_SAMPLES];
    let mut staged = 0usize;
    let mut in_fmt = SampleFormat::UNSPECIFIED;
    let mut eos_pending = false;

    while !shared.stop.load(Ordering::Acquire) {
        if !shared.gate.acquire(&shared.stop) {
            break;
        }

        if shared.flush_pending.swap(false, Ordering::AcqRel) {
            staged = 0;
        }

        if !eos_pending && staged < staging.len() {
            match source.lock().read(&mut staging[staged..], &mut in_fmt) {
                SourceRead::Frames(n) => staged = (staged + n).min(staging.len()),
                SourceRead::EndOfStream => eos_pending = true,
            }
        }

        let committed = {
            let mut state = shared.state.lock();
            let n = state.commit(&staging[..staged], &in_fmt);
            if eos_pending && staged == n {
                state.latch_eos();
            }
            n
        };
        if committed > 0 && staged > committed {
            staging.copy_within(committed..staged, 0);
        }
        staged -= committed;

        shared.gate.release();

        if eos_pending && staged == 0 {
            break;
        }
        if staged >= staging.len() {
            thread::sleep(FULL_BACKOFF);
        }
    }
}
