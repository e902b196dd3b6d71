//! Mixed playback output
//!
//! An [`Output`] owns one [device](crate::device::OutputDevice) and a LIFO
//! list of playback streams. A single mixer thread pulls every playing
//! stream's cache, applies per-stream volume, sums with saturation and
//! writes the result to the device, keeping it fed with silence across short
//! gaps and draining it after prolonged idleness.
//!
//! Streams come in two wirings. A *pull* stream is created with a
//! [`SampleSource`]; the engine pulls it through the resampler stage into the
//! stream's cache, eagerly (cache thread) or lazily (topped up as the mixer
//! reads). A *push* stream has no source; the application feeds it through
//! [`OutputStream::write`] and the resampler lands the samples in the cache.

mod mixer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::{FillPolicy, SampleCache};
use crate::device::{OutputDevice, MIN_LATENCY_MS};
use crate::format::SampleFormat;
use crate::resample::{Passthrough, SharedFilter};
use crate::sample::{Sample, VOLUME_MAX};
use crate::source::SampleSource;
use crate::{MixerError, Result};

pub use mixer::MIX_BUFFER_SAMPLES;

/// Open-time parameters for an [`Output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Device sample rate in Hz.
    pub samplerate: u32,
    /// Device channel count.
    pub channels: u8,
    /// Requested device latency in milliseconds (clamped to
    /// [`MIN_LATENCY_MS`]).
    pub latency_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            samplerate: 44100,
            channels: 2,
            latency_ms: 100,
        }
    }
}

/// Playback state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Actively mixed.
    Playing,
    /// Admitted but not mixed.
    Paused,
    /// The source ended; the stream stays listed until removed.
    Ended,
}

/// Buffering state of a stream's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Still filling toward the high-water mark.
    Buffering,
    /// Delivering samples (or no cache delay configured).
    Ready,
}

/// Edge-triggered stream notifications, each fired at most once per
/// transition and in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The cache underflowed while the stream was playing.
    Buffering,
    /// The cache recovered and samples are flowing again.
    Ready,
    /// The source ended; no further samples will be mixed.
    End,
}

type EventCallback = Box<dyn FnMut(StreamEvent) + Send>;

struct StreamState<S: Sample> {
    cache: Option<SampleCache<S>>,
    filter: Option<SharedFilter<S>>,
    playing: bool,
    end_of_stream: bool,
    aborted: bool,
    /// Raw interleaved samples delivered to the mixer.
    played: u64,
    volume: u32,
    /// Configured cache depth in ms; zero disables buffering events.
    delay_ms: u64,
    buffering: bool,
    event_cb: Option<EventCallback>,
}

struct StreamShared<S: Sample> {
    state: Mutex<StreamState<S>>,
    src_fmt: SampleFormat,
    out_fmt: SampleFormat,
}

impl<S: Sample> StreamShared<S> {
    fn emit(state: &mut StreamState<S>, event: StreamEvent) {
        if let Some(cb) = state.event_cb.as_mut() {
            cb(event);
        }
    }
}

struct OutputState<S: Sample> {
    volume: u32,
    streams: Vec<Arc<StreamShared<S>>>,
}

struct OutputShared<S: Sample> {
    fmt: SampleFormat,
    state: Mutex<OutputState<S>>,
    stop: AtomicBool,
}

/// Mixing playback engine: one device, one mixer thread, many streams.
pub struct Output<S: Sample> {
    shared: Arc<OutputShared<S>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: Sample> Output<S> {
    /// Open the engine on `device` with the given output format and start
    /// the mixer thread. `latency_ms` is clamped to [`MIN_LATENCY_MS`] and
    /// paces the idle loop.
    ///
    /// # Errors
    /// `ConfigError` for a zero sample rate or channel count.
    pub fn open(
        device: Box<dyn OutputDevice<S>>,
        samplerate: u32,
        channels: u8,
        latency_ms: u64,
    ) -> Result<Self> {
        if samplerate == 0 || channels == 0 {
            return Err(MixerError::ConfigError(
                "output format must be fully specified".to_string(),
            ));
        }
        let fmt = SampleFormat::new(samplerate, channels);
        let latency_ms = latency_ms.max(MIN_LATENCY_MS);

        let shared = Arc::new(OutputShared {
            fmt,
            state: Mutex::new(OutputState {
                volume: VOLUME_MAX,
                streams: Vec::new(),
            }),
            stop: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("sndmix-mixer".to_string())
            .spawn(move || mixer::run(worker, device, latency_ms))
            .map_err(|e| MixerError::ThreadError(format!("mixer: {e}")))?;

        Ok(Output {
            shared,
            thread: Some(thread),
        })
    }

    /// [`open`](Self::open) from an [`OutputConfig`].
    pub fn with_config(device: Box<dyn OutputDevice<S>>, config: &OutputConfig) -> Result<Self> {
        Self::open(device, config.samplerate, config.channels, config.latency_ms)
    }

    /// Device format the engine mixes at.
    pub fn format(&self) -> SampleFormat {
        self.shared.fmt
    }

    /// Set the master volume (`0..=VOLUME_MAX`), applied to the mixed frame.
    pub fn set_volume(&self, volume: u32) {
        self.shared.state.lock().volume = volume.min(VOLUME_MAX);
    }

    /// Current master volume.
    pub fn volume(&self) -> u32 {
        self.shared.state.lock().volume
    }

    /// Create a stream and admit it to the mix (paused).
    ///
    /// `samplerate`/`channels` describe the source; `cache_ms` sizes the
    /// stream cache in milliseconds of device-format audio (a minimum of one
    /// mix batch is always allocated). With `source` given the stream is
    /// pull-wired and `use_cache_thread` chooses the eager cache thread over
    /// lazy top-up. Without a source the stream is push-wired and fed via
    /// [`OutputStream::write`].
    pub fn add_stream(
        &self,
        samplerate: u32,
        channels: u8,
        cache_ms: u64,
        use_cache_thread: bool,
        source: Option<Box<dyn SampleSource<S>>>,
    ) -> Result<OutputStream<S>> {
        let out_fmt = self.shared.fmt;
        let cache_samples = (out_fmt.samples_for_ms(cache_ms) as usize).max(MIX_BUFFER_SAMPLES);

        let (cache, filter) = match source {
            Some(source) => {
                let filter = Passthrough::from_source(source).shared();
                let upstream = Arc::clone(&filter);
                let cache_source = Box::new(move |dest: &mut [S], fmt: &mut SampleFormat| {
                    upstream.lock().read(dest, fmt)
                });
                let policy = if use_cache_thread {
                    FillPolicy::EagerThread(cache_source)
                } else {
                    FillPolicy::LazyPull(cache_source)
                };
                (SampleCache::open(cache_samples, out_fmt, policy)?, filter)
            }
            None => {
                let cache = SampleCache::open(cache_samples, out_fmt, FillPolicy::ExternalWrite)?;
                let filter = Passthrough::to_sink(Box::new(cache.writer())).shared();
                (cache, filter)
            }
        };

        let stream = Arc::new(StreamShared {
            state: Mutex::new(StreamState {
                cache: Some(cache),
                filter: Some(filter),
                playing: false,
                end_of_stream: false,
                aborted: false,
                played: 0,
                volume: VOLUME_MAX,
                delay_ms: cache_ms,
                buffering: false,
                event_cb: None,
            }),
            src_fmt: SampleFormat::new(samplerate, channels),
            out_fmt,
        });

        // Newest stream first.
        self.shared.state.lock().streams.insert(0, Arc::clone(&stream));

        Ok(OutputStream {
            shared: stream,
            output: Arc::downgrade(&self.shared),
        })
    }

    /// Stop the mixer thread and release the device. Streams stay readable
    /// for status inspection until their handles are dropped.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<S: Sample> Drop for Output<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one playback stream of an [`Output`].
pub struct OutputStream<S: Sample> {
    shared: Arc<StreamShared<S>>,
    output: Weak<OutputShared<S>>,
}

impl<S: Sample> OutputStream<S> {
    /// Start (or resume) mixing this stream. Also thaws the cache's producer
    /// gate, so a `play` after a [`flush`](Self::flush) or
    /// [`abort`](Self::abort) restarts production.
    pub fn play(&self) {
        let mut state = self.shared.state.lock();
        state.playing = true;
        if let Some(cache) = &state.cache {
            cache.unlock();
        }
    }

    /// Stop mixing this stream; buffered samples stay put.
    pub fn pause(&self) {
        self.shared.state.lock().playing = false;
    }

    /// Drop everything buffered in the cache and the resampler and zero the
    /// played counter. The producer stays frozen unless the stream is
    /// currently playing.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        if let Some(cache) = &state.cache {
            cache.flush();
        }
        if let Some(filter) = &state.filter {
            filter.lock().flush();
        }
        if state.playing {
            if let Some(cache) = &state.cache {
                cache.unlock();
            }
        }
        state.played = 0;
    }

    /// Push-wired feed: hand samples to the resampler stage. Returns the
    /// number of samples accepted; 0 after an abort or end of stream.
    pub fn write(&self, src: &[S], fmt: &SampleFormat) -> usize {
        let state = self.shared.state.lock();
        if state.aborted || state.end_of_stream {
            return 0;
        }
        match &state.filter {
            Some(filter) => filter.lock().write(src, fmt),
            None => 0,
        }
    }

    /// Set this stream's volume (`0..=VOLUME_MAX`).
    pub fn set_volume(&self, volume: u32) {
        self.shared.state.lock().volume = volume.min(VOLUME_MAX);
    }

    /// Current stream volume.
    pub fn volume(&self) -> u32 {
        self.shared.state.lock().volume
    }

    /// Resize the stream cache to `ms` milliseconds of device-format audio.
    pub fn set_cache_ms(&self, ms: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(cache) = &state.cache {
            cache.set_time(ms)?;
        }
        state.delay_ms = ms;
        Ok(())
    }

    /// Install the event callback.
    ///
    /// The callback runs on the mixer thread while stream state is locked:
    /// it must be fast and must not call back into this stream or its
    /// output.
    pub fn set_event_cb<F>(&self, cb: F)
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.shared.state.lock().event_cb = Some(Box::new(cb));
    }

    /// Playback state.
    pub fn status(&self) -> StreamStatus {
        let state = self.shared.state.lock();
        if state.end_of_stream {
            StreamStatus::Ended
        } else if state.playing {
            StreamStatus::Playing
        } else {
            StreamStatus::Paused
        }
    }

    /// Milliseconds of audio delivered to the mixer so far.
    pub fn played_ms(&self) -> u64 {
        let state = self.shared.state.lock();
        self.shared.out_fmt.ms_for_samples(state.played)
    }

    /// Buffering state of the cache.
    pub fn cache_status(&self) -> CacheStatus {
        let state = self.shared.state.lock();
        match &state.cache {
            Some(cache) if state.delay_ms > 0 && !cache.is_ready() => CacheStatus::Buffering,
            _ => CacheStatus::Ready,
        }
    }

    /// Cache fill level, 0..=100. Streams without a cache delay report 100.
    pub fn cache_filling(&self) -> u8 {
        let state = self.shared.state.lock();
        match &state.cache {
            Some(cache) if state.delay_ms > 0 => cache.filling(),
            _ => 100,
        }
    }

    /// Milliseconds of audio queued in the cache.
    pub fn cache_delay_ms(&self) -> u64 {
        let state = self.shared.state.lock();
        state.cache.as_ref().map_or(0, |cache| cache.delay_ms())
    }

    /// Source format declared at [`Output::add_stream`] time.
    pub fn source_format(&self) -> SampleFormat {
        self.shared.src_fmt
    }

    /// Stop the stream, freeze its producer and report the full played
    /// position in milliseconds, including what is still queued in the cache
    /// and the resampler. A later stream can pick the position up through
    /// [`restore`](Self::restore).
    pub fn abort(&self) -> u64 {
        let mut state = self.shared.state.lock();
        state.playing = false;
        state.aborted = true;
        if let Some(cache) = &state.cache {
            cache.lock();
        }

        let mut played = self.shared.out_fmt.ms_for_samples(state.played);
        if let Some(cache) = &state.cache {
            played += cache.delay_ms();
        }
        if let Some(filter) = &state.filter {
            played += filter.lock().delay_ms();
        }
        played
    }

    /// Preset the played counter to `ms`, as reported by a previous
    /// [`abort`](Self::abort).
    pub fn restore(&self, ms: u64) {
        let mut state = self.shared.state.lock();
        state.played = self.shared.out_fmt.samples_for_ms(ms);
    }

    /// Unlink the stream from its output. Resources are released once the
    /// mixer finishes its current pass.
    pub fn remove(self) {
        if let Some(output) = self.output.upgrade() {
            output
                .state
                .lock()
                .streams
                .retain(|other| !Arc::ptr_eq(other, &self.shared));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OutputConfig::default();
        assert_eq!(config.samplerate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.latency_ms, 100);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = OutputConfig {
            samplerate: 48000,
            channels: 2,
            latency_ms: 250,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: OutputConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
