//! End-to-end mixing tests against a mock output device.
//!
//! The mock device records every sample the mixer writes; pull-wired streams
//! with lazy caches make each mix pass deterministic (every playing stream
//! refills synchronously under the mixer's read), so the captured output can
//! be checked exactly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sndmix::{
    MixerError, Output, OutputDevice, Sample, SampleFormat, SourceRead, StreamEvent, StreamStatus,
    MIX_BUFFER_SAMPLES, VOLUME_MAX,
};

const RATE: u32 = 48_000;
const CHANNELS: u8 = 2;

/// Records written samples and counts lifecycle calls.
struct MockDevice {
    written: Arc<Mutex<Vec<i32>>>,
    prepares: Arc<AtomicUsize>,
    drains: Arc<AtomicUsize>,
}

impl MockDevice {
    fn new() -> (Self, Arc<Mutex<Vec<i32>>>, Arc<AtomicUsize>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let prepares = Arc::new(AtomicUsize::new(0));
        let device = MockDevice {
            written: Arc::clone(&written),
            prepares: Arc::clone(&prepares),
            drains: Arc::new(AtomicUsize::new(0)),
        };
        (device, written, prepares)
    }
}

impl OutputDevice<i32> for MockDevice {
    fn prepare(&mut self) -> sndmix::Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, samples: &[i32]) -> sndmix::Result<usize> {
        self.written.lock().extend_from_slice(samples);
        // Pace the mixer roughly like a real blocking sink would.
        thread::sleep(Duration::from_millis(1));
        Ok(samples.len())
    }

    fn drain(&mut self) -> sndmix::Result<()> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recover(&mut self, err: &MixerError) -> sndmix::Result<()> {
        Err(MixerError::DeviceError(format!("mock cannot recover: {err}")))
    }
}

/// Source delivering a constant sample value forever.
fn constant_source(value: i32) -> impl FnMut(&mut [i32], &mut SampleFormat) -> SourceRead + Send {
    move |dest: &mut [i32], out: &mut SampleFormat| {
        *out = SampleFormat::new(RATE, CHANNELS);
        dest.fill(value);
        SourceRead::Frames(dest.len())
    }
}

fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_two_streams_mix_with_half_volume() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    // cache_ms = 0 keeps the caches at one mix batch and disables buffering
    // events; lazy pull makes every pass refill both streams.
    let a = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(1000))))
        .unwrap();
    let b = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(1000))))
        .unwrap();
    a.set_volume(VOLUME_MAX / 2);
    b.set_volume(VOLUME_MAX / 2);
    a.play();
    b.play();

    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES * 8));
    output.close();

    let halved = 1000i32.scale(VOLUME_MAX / 2);
    let expected = halved.saturating_mix(halved);
    let captured = written.lock();
    // Skip the first batches: one stream may have joined the mix a few
    // passes before the other. Steady state must be the exact two-stream sum.
    let steady = &captured[MIX_BUFFER_SAMPLES * 4..];
    assert!(!steady.is_empty());
    assert!(steady.iter().all(|&s| s == expected),
        "expected every steady-state sample to be the sum of two halved streams ({expected})");
}

#[test]
fn test_full_volume_saturation() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let a = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(i32::MAX))))
        .unwrap();
    let b = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(i32::MAX))))
        .unwrap();
    a.play();
    b.play();

    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES * 2));
    output.close();

    // Two full-scale streams clamp at full scale instead of wrapping.
    let captured = written.lock();
    assert!(captured.iter().all(|&s| s == i32::MAX));
}

#[test]
fn test_master_volume_scales_the_mix() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();
    output.set_volume(VOLUME_MAX / 2);
    assert_eq!(output.volume(), VOLUME_MAX / 2);

    let stream = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(10_000))))
        .unwrap();
    stream.play();

    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES));
    output.close();

    let expected = 10_000i32.scale(VOLUME_MAX).scale(VOLUME_MAX / 2);
    let captured = written.lock();
    assert!(captured.iter().all(|&s| s == expected));
}

#[test]
fn test_buffering_edges_fire_once_per_transition() {
    let (device, _written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    // 0 = starve, 1 = deliver
    let mode = Arc::new(AtomicUsize::new(1));
    let source_mode = Arc::clone(&mode);
    let source = Box::new(move |dest: &mut [i32], out: &mut SampleFormat| {
        if source_mode.load(Ordering::SeqCst) == 0 {
            return SourceRead::Frames(0);
        }
        *out = SampleFormat::new(RATE, CHANNELS);
        dest.fill(42);
        SourceRead::Frames(dest.len())
    });

    let stream = output.add_stream(RATE, CHANNELS, 100, false, Some(source)).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    stream.set_event_cb(move |event| sink.lock().push(event));
    stream.play();

    // Initial fill: one Buffering while below high water, one Ready after.
    assert!(wait_until(3000, || events.lock().contains(&StreamEvent::Ready)));

    // Starve until the cache drains dry.
    mode.store(0, Ordering::SeqCst);
    assert!(wait_until(3000, || {
        events.lock().iter().filter(|e| **e == StreamEvent::Buffering).count() == 2
    }));

    // Refill.
    mode.store(1, Ordering::SeqCst);
    assert!(wait_until(3000, || {
        events.lock().iter().filter(|e| **e == StreamEvent::Ready).count() == 2
    }));

    output.close();

    let captured = events.lock();
    assert_eq!(
        &captured[..4],
        &[
            StreamEvent::Buffering,
            StreamEvent::Ready,
            StreamEvent::Buffering,
            StreamEvent::Ready,
        ],
        "edges must alternate, one event per transition"
    );
}

#[test]
fn test_end_of_stream_fires_once_and_ends_the_stream() {
    let (device, _written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let total = MIX_BUFFER_SAMPLES * 2;
    let mut sent = 0usize;
    let source = Box::new(move |dest: &mut [i32], out: &mut SampleFormat| {
        if sent >= total {
            return SourceRead::EndOfStream;
        }
        *out = SampleFormat::new(RATE, CHANNELS);
        let n = dest.len().min(total - sent);
        dest[..n].fill(7);
        sent += n;
        SourceRead::Frames(n)
    });

    let stream = output.add_stream(RATE, CHANNELS, 0, false, Some(source)).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    stream.set_event_cb(move |event| sink.lock().push(event));
    stream.play();

    assert!(wait_until(3000, || stream.status() == StreamStatus::Ended));

    // Give the mixer a few more passes; the END edge must not repeat.
    thread::sleep(Duration::from_millis(50));
    output.close();

    let ends = events.lock().iter().filter(|e| **e == StreamEvent::End).count();
    assert_eq!(ends, 1);

    // All delivered samples are accounted in the played counter.
    let fmt = SampleFormat::new(RATE, CHANNELS);
    assert_eq!(stream.played_ms(), fmt.ms_for_samples(total as u64));
    // The ended stream stays listed and inspectable.
    assert_eq!(stream.status(), StreamStatus::Ended);
    assert_eq!(stream.cache_delay_ms(), 0);
}

#[test]
fn test_abort_then_restore_round_trips_played_position() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let stream = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(5))))
        .unwrap();
    stream.play();
    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES));

    let position = stream.abort();
    assert_eq!(stream.status(), StreamStatus::Paused);
    assert!(position >= stream.played_ms());

    // A successor stream restored from the abort position reports it before
    // any data flows.
    let successor = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(5))))
        .unwrap();
    successor.restore(position);
    assert_eq!(successor.played_ms(), position);

    output.close();
}

#[test]
fn test_abort_freezes_production_and_write() {
    let (device, _written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    // Push-wired stream: we feed it ourselves.
    let stream = output.add_stream(RATE, CHANNELS, 0, false, None).unwrap();
    assert!(stream.write(&[1, 2, 3, 4], &SampleFormat::new(RATE, CHANNELS)) > 0);

    stream.abort();
    assert_eq!(stream.write(&[5, 6], &SampleFormat::new(RATE, CHANNELS)), 0);

    output.close();
}

#[test]
fn test_push_topology_reaches_the_device() {
    let (device, written, prepares) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let stream = output.add_stream(RATE, CHANNELS, 0, false, None).unwrap();
    stream.play();

    // Fill the cache to its high-water mark so the mixer picks it up.
    let fmt = SampleFormat::new(RATE, CHANNELS);
    let chunk = vec![2_000i32; MIX_BUFFER_SAMPLES];
    let mut pushed = 0usize;
    while pushed < MIX_BUFFER_SAMPLES {
        pushed += stream.write(&chunk[pushed..], &fmt);
    }

    assert!(wait_until(3000, || written.lock().contains(&2_000)));
    assert!(prepares.load(Ordering::SeqCst) >= 1, "device must be prepared before data");
    assert!(wait_until(3000, || stream.played_ms() > 0));

    output.close();
}

#[test]
fn test_pause_stops_consumption() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let stream = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(9))))
        .unwrap();
    stream.play();
    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES));
    assert_eq!(stream.status(), StreamStatus::Playing);

    stream.pause();
    assert_eq!(stream.status(), StreamStatus::Paused);
    let played = stream.played_ms();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(stream.played_ms(), played, "paused stream must not advance");

    output.close();
}

#[test]
fn test_flush_zeroes_played_and_empties_cache() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let stream = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(3))))
        .unwrap();
    stream.play();
    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES));
    stream.pause();
    thread::sleep(Duration::from_millis(20));

    stream.flush();
    assert_eq!(stream.played_ms(), 0);
    assert_eq!(stream.cache_delay_ms(), 0);

    // The stream was paused at flush time, so production stays frozen until
    // the next play.
    stream.play();
    assert!(wait_until(3000, || stream.played_ms() > 0));

    output.close();
}

#[test]
fn test_removed_stream_is_unlinked() {
    let (device, written, _) = MockDevice::new();
    let output = Output::<i32>::open(Box::new(device), RATE, CHANNELS, 10).unwrap();

    let stream = output
        .add_stream(RATE, CHANNELS, 0, false, Some(Box::new(constant_source(11))))
        .unwrap();
    stream.play();
    assert!(wait_until(3000, || written.lock().len() >= MIX_BUFFER_SAMPLES));

    stream.remove();

    // After removal the mixer runs dry: only silence keep-alive follows.
    thread::sleep(Duration::from_millis(50));
    let mark = written.lock().len();
    thread::sleep(Duration::from_millis(50));
    let captured = written.lock();
    assert!(captured[mark..].iter().all(|&s| s == 0),
        "a removed stream must not contribute samples");

    output.close();
}
