//! Stream format descriptor
//!
//! A [`SampleFormat`] carries the sample rate and channel count of a run of
//! interleaved samples. The all-zero value is a sentinel meaning "unspecified;
//! inherit the previous format" and is what a producer reports when the format
//! has not changed since its last batch.

use serde::{Deserialize, Serialize};

/// Sample rate and channel layout of a run of interleaved samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleFormat {
    /// Sample rate in Hz. `0` means unspecified.
    pub samplerate: u32,
    /// Number of interleaved channels. `0` means unspecified.
    pub channels: u8,
}

impl SampleFormat {
    /// Sentinel value meaning "unspecified; inherit the previous format".
    pub const UNSPECIFIED: SampleFormat = SampleFormat {
        samplerate: 0,
        channels: 0,
    };

    /// Create a new format descriptor.
    pub fn new(samplerate: u32, channels: u8) -> Self {
        SampleFormat {
            samplerate,
            channels,
        }
    }

    /// True if at least one field carries a real value.
    ///
    /// A producer that has nothing new to report leaves both fields zero.
    pub fn is_specified(&self) -> bool {
        self.samplerate != 0 || self.channels != 0
    }

    /// Number of interleaved samples covering `ms` milliseconds under this
    /// format. Returns 0 for an unspecified format.
    pub fn samples_for_ms(&self, ms: u64) -> u64 {
        ms * self.samplerate as u64 * self.channels as u64 / 1000
    }

    /// Milliseconds of audio represented by `samples` interleaved samples.
    /// Returns 0 for an unspecified format.
    pub fn ms_for_samples(&self, samples: u64) -> u64 {
        let per_second = self.samplerate as u64 * self.channels as u64;
        if per_second == 0 {
            return 0;
        }
        samples * 1000 / per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_sentinel() {
        assert!(!SampleFormat::UNSPECIFIED.is_specified());
        assert!(SampleFormat::new(44100, 2).is_specified());
        // A single nonzero field is enough to count as a report
        assert!(SampleFormat::new(0, 2).is_specified());
    }

    #[test]
    fn test_equality_is_field_wise() {
        let a = SampleFormat::new(44100, 2);
        let b = SampleFormat::new(44100, 2);
        let c = SampleFormat::new(48000, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Zero field compares unequal to a nonzero field
        assert_ne!(SampleFormat::new(0, 2), SampleFormat::new(44100, 2));
    }

    #[test]
    fn test_ms_conversions() {
        let fmt = SampleFormat::new(48000, 2);
        assert_eq!(fmt.samples_for_ms(1000), 96000);
        assert_eq!(fmt.ms_for_samples(96000), 1000);
        assert_eq!(fmt.samples_for_ms(500), 48000);
        // Unspecified format converts to nothing
        assert_eq!(SampleFormat::UNSPECIFIED.ms_for_samples(4096), 0);
    }
}
