//! Real-time multi-stream PCM mixing engine
//!
//! sndmix maintains a set of independent playback streams, buffers each one
//! through a bounded sample cache that tracks mid-stream format changes, and
//! folds them sample-by-sample with per-stream volume and saturating sums
//! into a single device feed driven by one mixer thread.
//!
//! # Features
//! - Bounded per-stream sample caches with co-located format annotations
//! - Eager (background thread) and lazy (consumer top-up) cache filling
//! - Push- and pull-wired streams behind one stream API
//! - Saturating mixing over `i32` or `f32` interleaved samples
//! - Idle-aware device handling: silence keep-alive, drain after prolonged
//!   silence, prepare on wake
//! - Per-stream buffering / ready / end-of-stream events
//!
//! # Crate feature flags
//! - `streaming` (opt-in): rodio-backed output device (`RodioDevice`) and
//!   the demo binary
//!
//! # Quick start
//! ```no_run
//! # #[cfg(feature = "streaming")]
//! # {
//! use sndmix::{Output, RodioDevice, SampleFormat, SourceRead};
//!
//! let fmt = SampleFormat::new(48_000, 2);
//! let device = RodioDevice::open(fmt, 100).unwrap();
//! let output = Output::<f32>::open(Box::new(device), 48_000, 2, 100).unwrap();
//!
//! let mut phase = 0f32;
//! let stream = output
//!     .add_stream(
//!         48_000,
//!         2,
//!         500,
//!         true,
//!         Some(Box::new(move |dest: &mut [f32], out: &mut SampleFormat| {
//!             *out = SampleFormat::new(48_000, 2);
//!             for frame in dest.chunks_mut(2) {
//!                 let sample = (phase * std::f32::consts::TAU).sin() * 0.2;
//!                 frame.fill(sample);
//!                 phase = (phase + 440.0 / 48_000.0).fract();
//!             }
//!             SourceRead::Frames(dest.len())
//!         })),
//!     )
//!     .unwrap();
//! stream.play();
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod device;
pub mod format;
pub mod output;
pub mod resample;
pub mod sample;
pub mod source;

/// Error types for mixing engine operations
#[derive(thiserror::Error, Debug)]
pub enum MixerError {
    /// Invalid configuration (zero sizes, missing callback, bad format)
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Audio device error
    #[error("Audio device error: {0}")]
    DeviceError(String),

    /// An engine thread (cache producer, mixer) could not be started
    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Result type for mixing engine operations
pub type Result<T> = std::result::Result<T, MixerError>;

// Public API exports
pub use cache::{CacheWriter, FillPolicy, SampleCache};
pub use device::{OutputDevice, MIN_LATENCY_MS};
pub use format::SampleFormat;
pub use output::{
    CacheStatus, Output, OutputConfig, OutputStream, StreamEvent, StreamStatus,
    MIX_BUFFER_SAMPLES,
};
pub use resample::{Passthrough, ResampleFilter, SharedFilter};
pub use sample::{Sample, VOLUME_MAX};
pub use source::{SampleSink, SampleSource, SourceRead};

#[cfg(feature = "streaming")]
pub use device::RodioDevice;
