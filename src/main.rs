//! Demo player: mixes two generated tones through the system audio device.
//!
//! Requires the `streaming` feature:
//! `cargo run --features streaming -- [seconds]`

use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use sndmix::{Output, RodioDevice, SampleFormat, SourceRead, VOLUME_MAX};

const SAMPLERATE: u32 = 48_000;
const CHANNELS: u8 = 2;

/// Pull-style sine source at `freq` Hz, stereo interleaved.
fn sine_source(
    freq: f32,
    amplitude: f32,
) -> impl FnMut(&mut [f32], &mut SampleFormat) -> SourceRead + Send {
    let mut phase = 0f32;
    let step = freq / SAMPLERATE as f32;
    move |dest: &mut [f32], out: &mut SampleFormat| {
        *out = SampleFormat::new(SAMPLERATE, CHANNELS);
        for frame in dest.chunks_mut(CHANNELS as usize) {
            let sample = (phase * std::f32::consts::TAU).sin() * amplitude;
            frame.fill(sample);
            phase = (phase + step).fract();
        }
        SourceRead::Frames(dest.len())
    }
}

fn main() -> Result<()> {
    let seconds: u64 = env::args()
        .nth(1)
        .map(|arg| arg.parse().context("seconds must be a number"))
        .transpose()?
        .unwrap_or(5);

    let fmt = SampleFormat::new(SAMPLERATE, CHANNELS);
    let device = RodioDevice::open(fmt, 100)?;
    let output = Output::<f32>::open(Box::new(device), SAMPLERATE, CHANNELS, 100)?;

    let low = output.add_stream(
        SAMPLERATE,
        CHANNELS,
        250,
        true,
        Some(Box::new(sine_source(220.0, 0.4))),
    )?;
    let high = output.add_stream(
        SAMPLERATE,
        CHANNELS,
        250,
        true,
        Some(Box::new(sine_source(331.0, 0.4))),
    )?;

    low.set_volume(VOLUME_MAX / 2);
    high.set_volume(VOLUME_MAX / 2);
    low.play();
    high.play();

    println!("mixing two tones for {seconds}s...");
    thread::sleep(Duration::from_secs(seconds));
    println!("played {}ms / {}ms", low.played_ms(), high.played_ms());

    let position = low.abort();
    println!("aborted low tone at {position}ms");
    thread::sleep(Duration::from_secs(1));

    output.close();
    Ok(())
}
