//! Mixer thread
//!
//! One pass pulls up to a batch from every playing stream, folds the batches
//! together with per-stream volume and saturating sums, applies the master
//! volume and writes the result to the device. Stream bookkeeping (played
//! counter, buffering edges, end of stream) happens inside the pass, under
//! the stream lock.
//!
//! The device lifecycle is idle-aware: it starts stopped, is prepared on the
//! first mixed batch, is kept fed with silence through short gaps and is
//! drained and stopped after [`MAX_SILENCE`] of continuous silence.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::device::OutputDevice;
use crate::format::SampleFormat;
use crate::output::{OutputShared, StreamEvent, StreamShared};
use crate::sample::{Sample, VOLUME_MAX};
use crate::source::SourceRead;

/// Interleaved samples mixed per pass.
pub const MIX_BUFFER_SAMPLES: usize = 4096;

/// Continuous silence after which the device is drained and stopped.
const MAX_SILENCE: Duration = Duration::from_secs(5);

pub(super) fn run<S: Sample>(
    shared: Arc<OutputShared<S>>,
    mut device: Box<dyn OutputDevice<S>>,
    latency_ms: u64,
) {
    let mut in_buf = vec![S::SILENCE; MIX_BUFFER_SAMPLES];
    let mut out_buf = vec![S::SILENCE; MIX_BUFFER_SAMPLES];
    let mut stopped = true;
    let mut silence_since: Option<Instant> = None;

    while !shared.stop.load(Ordering::Acquire) {
        let mut out_size = mix_streams(&shared, &mut in_buf, &mut out_buf);

        if out_size == 0 {
            if stopped {
                thread::sleep(Duration::from_millis(latency_ms));
                continue;
            }
            let since = *silence_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= MAX_SILENCE {
                if let Err(err) = device.drain() {
                    eprintln!("sndmix: device drain failed: {err}");
                }
                stopped = true;
                silence_since = None;
                continue;
            }
            // Keep the device fed through the gap.
            out_buf.fill(S::SILENCE);
            out_size = MIX_BUFFER_SAMPLES;
        } else {
            silence_since = None;
            if stopped {
                if let Err(err) = device.prepare() {
                    eprintln!("sndmix: device prepare failed: {err}");
                    break;
                }
                stopped = false;
            }
        }

        match device.write(&out_buf[..out_size]) {
            Ok(written) => {
                if written < out_size {
                    eprintln!("sndmix: short write ({written} of {out_size} samples)");
                }
            }
            Err(err) => {
                if let Err(fatal) = device.recover(&err) {
                    eprintln!("sndmix: device write failed: {fatal}");
                    break;
                }
            }
        }
    }
}

/// One mix pass over all streams. Returns the number of samples produced,
/// which is the largest contribution of any stream this pass.
fn mix_streams<S: Sample>(
    shared: &OutputShared<S>,
    in_buf: &mut [S],
    out_buf: &mut [S],
) -> usize {
    let mut out_size = 0usize;
    let mut first = true;

    let output = shared.state.lock();
    for stream in output.streams.iter() {
        let mut state = stream.state.lock();
        if !state.playing || state.end_of_stream {
            continue;
        }
        let Some(cache) = &state.cache else {
            continue;
        };

        let mut fmt = SampleFormat::UNSPECIFIED;
        match cache.read(in_buf, &mut fmt) {
            SourceRead::EndOfStream => {
                state.end_of_stream = true;
                state.cache = None;
                state.filter = None;
                StreamShared::emit(&mut state, StreamEvent::End);
            }
            SourceRead::Frames(0) => {
                if state.delay_ms > 0 && !state.buffering {
                    state.buffering = true;
                    StreamShared::emit(&mut state, StreamEvent::Buffering);
                }
            }
            SourceRead::Frames(n) => {
                if state.buffering {
                    state.buffering = false;
                    StreamShared::emit(&mut state, StreamEvent::Ready);
                }
                state.played += n as u64;

                let volume = state.volume;
                if first {
                    first = false;
                    for (out, sample) in out_buf[..n].iter_mut().zip(&in_buf[..n]) {
                        *out = sample.scale(volume);
                    }
                    out_buf[n..].fill(S::SILENCE);
                } else {
                    for (out, sample) in out_buf[..n].iter_mut().zip(&in_buf[..n]) {
                        *out = out.saturating_mix(sample.scale(volume));
                    }
                }
                out_size = out_size.max(n);
            }
        }
    }

    let master = output.volume;
    drop(output);

    if out_size > 0 && master != VOLUME_MAX {
        for sample in out_buf[..out_size].iter_mut() {
            *sample = sample.scale(master);
        }
    }
    out_size
}
