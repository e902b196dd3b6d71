//! Resampler / channel-mixer filter stage
//!
//! The engine treats rate and channel conversion as an opaque filter sitting
//! between a stream's producer and its cache. [`ResampleFilter`] captures the
//! contract the mixer relies on: a pull side, a push side, a flush, and a
//! latency report that [abort](crate::output::OutputStream::abort) folds into
//! the played position.
//!
//! [`Passthrough`] is the built-in filter for streams whose source format
//! already matches the device: it forwards samples unchanged and reports
//! zero delay. A real converter plugs in through the same trait.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::SampleFormat;
use crate::sample::Sample;
use crate::source::{SampleSink, SampleSource, SourceRead};

/// Rate/channel conversion stage with symmetric pull and push wiring.
pub trait ResampleFilter<S: Sample>: Send {
    /// Pull converted samples (pull-wired streams).
    fn read(&mut self, dest: &mut [S], fmt: &mut SampleFormat) -> SourceRead;

    /// Push raw samples in (push-wired streams); returns the count accepted.
    fn write(&mut self, src: &[S], fmt: &SampleFormat) -> usize;

    /// Discard internal state and buffered samples.
    fn flush(&mut self);

    /// Milliseconds of audio currently held inside the filter.
    fn delay_ms(&self) -> u64;
}

/// A filter shared between a stream handle and the cache wiring.
pub type SharedFilter<S> = Arc<Mutex<Box<dyn ResampleFilter<S>>>>;

enum Wiring<S: Sample> {
    /// Pull: forward reads to the upstream source.
    Source(Box<dyn SampleSource<S>>),
    /// Push: forward writes into the downstream sink.
    Sink(Box<dyn SampleSink<S>>),
}

/// Identity filter: no rate or channel conversion, no internal buffering.
pub struct Passthrough<S: Sample> {
    wiring: Wiring<S>,
}

impl<S: Sample> Passthrough<S> {
    /// Pull wiring: reads are served straight from `source`.
    pub fn from_source(source: Box<dyn SampleSource<S>>) -> Self {
        Passthrough {
            wiring: Wiring::Source(source),
        }
    }

    /// Push wiring: writes land straight in `sink`.
    pub fn to_sink(sink: Box<dyn SampleSink<S>>) -> Self {
        Passthrough {
            wiring: Wiring::Sink(sink),
        }
    }

    /// Box and share, ready for [`SharedFilter`] wiring.
    pub fn shared(self) -> SharedFilter<S> {
        Arc::new(Mutex::new(Box::new(self) as Box<dyn ResampleFilter<S>>))
    }
}

impl<S: Sample> ResampleFilter<S> for Passthrough<S> {
    fn read(&mut self, dest: &mut [S], fmt: &mut SampleFormat) -> SourceRead {
        match &mut self.wiring {
            Wiring::Source(source) => source.read(dest, fmt),
            Wiring::Sink(_) => SourceRead::Frames(0),
        }
    }

    fn write(&mut self, src: &[S], fmt: &SampleFormat) -> usize {
        match &mut self.wiring {
            Wiring::Sink(sink) => sink.write(src, fmt),
            Wiring::Source(_) => 0,
        }
    }

    fn flush(&mut self) {}

    fn delay_ms(&self) -> u64 {
        0
    }
}
