//! Physical output device abstraction
//!
//! The mixer thread owns exactly one [`OutputDevice`] and drives it with
//! interleaved 32-bit samples. The trait mirrors what a blocking PCM sink
//! offers: write, prepare after a stop, drain before a stop, and a recovery
//! hook for transient faults. A write error that `recover` cannot clear is
//! fatal and ends the mixer thread.
//!
//! The shipping backend ([`RodioDevice`], `streaming` feature) plays through
//! the default system device via rodio; tests substitute their own mock
//! sinks.

use crate::sample::Sample;
use crate::{MixerError, Result};

/// Lower bound on the device latency configurable at open time.
pub const MIN_LATENCY_MS: u64 = 10;

/// Blocking interleaved-sample sink.
pub trait OutputDevice<S: Sample>: Send {
    /// Make the device ready to accept samples after a stop or drain.
    fn prepare(&mut self) -> Result<()>;

    /// Write interleaved samples; blocks until the device accepted them.
    /// Returns the number of samples taken (a short count is an underrun the
    /// caller may log and carry on from).
    fn write(&mut self, samples: &[S]) -> Result<usize>;

    /// Play out everything buffered, then stop the device.
    fn drain(&mut self) -> Result<()>;

    /// Attempt to recover from a failed write. Returning an error makes the
    /// fault fatal.
    fn recover(&mut self, err: &MixerError) -> Result<()>;
}

#[cfg(feature = "streaming")]
pub use self::rodio_device::RodioDevice;

#[cfg(feature = "streaming")]
mod rodio_device {
    use std::time::Duration;

    use rodio::buffer::SamplesBuffer;
    use rodio::{OutputStream, OutputStreamHandle, Sink};

    use super::{OutputDevice, MIN_LATENCY_MS};
    use crate::format::SampleFormat;
    use crate::sample::Sample;
    use crate::{MixerError, Result};

    /// System audio output through rodio.
    ///
    /// Each `write` is appended to the sink queue as one buffer; writes block
    /// while more than a handful of buffers are pending, which is what gives
    /// the mixer thread its pacing.
    pub struct RodioDevice {
        _stream: OutputStream,
        _handle: OutputStreamHandle,
        sink: Sink,
        fmt: SampleFormat,
        /// Queue depth above which `write` blocks.
        max_pending: usize,
    }

    impl RodioDevice {
        /// Open the default output device for `fmt` with roughly
        /// `latency_ms` of queueing (clamped to [`MIN_LATENCY_MS`]).
        pub fn open(fmt: SampleFormat, latency_ms: u64) -> Result<Self> {
            if !fmt.is_specified() {
                return Err(MixerError::ConfigError(
                    "device format must be fully specified".to_string(),
                ));
            }
            let latency_ms = latency_ms.max(MIN_LATENCY_MS);
            let (stream, handle) = OutputStream::try_default()
                .map_err(|e| MixerError::DeviceError(format!("open output stream: {e}")))?;
            let sink = Sink::try_new(&handle)
                .map_err(|e| MixerError::DeviceError(format!("create sink: {e}")))?;

            // One queued buffer is one mixer batch; size the queue so the
            // total buffered audio stays near the requested latency.
            let batch_ms = 4096 / (fmt.samplerate as u64 * fmt.channels as u64 / 1000).max(1);
            let max_pending = (latency_ms / batch_ms.max(1)).max(2) as usize;

            Ok(RodioDevice {
                _stream: stream,
                _handle: handle,
                sink,
                fmt,
                max_pending,
            })
        }
    }

    impl<S: Sample> OutputDevice<S> for RodioDevice {
        fn prepare(&mut self) -> Result<()> {
            self.sink.play();
            Ok(())
        }

        fn write(&mut self, samples: &[S]) -> Result<usize> {
            let floats: Vec<f32> = samples.iter().map(|s| s.to_f32()).collect();
            self.sink.append(SamplesBuffer::new(
                self.fmt.channels as u16,
                self.fmt.samplerate,
                floats,
            ));
            while self.sink.len() > self.max_pending {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(samples.len())
        }

        fn drain(&mut self) -> Result<()> {
            self.sink.sleep_until_end();
            Ok(())
        }

        fn recover(&mut self, err: &MixerError) -> Result<()> {
            // rodio resubmits internally; nothing recoverable is left here.
            Err(MixerError::DeviceError(format!("unrecoverable: {err}")))
        }
    }
}
