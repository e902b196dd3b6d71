//! Sample arithmetic
//!
//! The engine moves interleaved 32-bit samples; whether they are signed
//! integers or floats is chosen once by instantiating the engine over `i32`
//! or `f32`. The [`Sample`] trait supplies the two operations mixing needs:
//! volume scaling and saturating summation.

/// Full-scale volume. Per-stream and master volumes range over
/// `0..=VOLUME_MAX`; `scale` with `VOLUME_MAX` is the identity.
pub const VOLUME_MAX: u32 = 65_535;

/// A 32-bit interleaved PCM sample the mixer can scale and sum.
pub trait Sample:
    Copy + Default + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
    /// The zero sample.
    const SILENCE: Self;

    /// Scale by a volume in `0..=VOLUME_MAX`.
    fn scale(self, volume: u32) -> Self;

    /// Sum two samples, clamping to the representable range instead of
    /// wrapping.
    fn saturating_mix(self, other: Self) -> Self;

    /// Lossless-enough conversion for device backends that only take floats.
    fn to_f32(self) -> f32;
}

impl Sample for i32 {
    const SILENCE: i32 = 0;

    fn scale(self, volume: u32) -> i32 {
        (self as i64 * volume as i64 / VOLUME_MAX as i64) as i32
    }

    fn saturating_mix(self, other: i32) -> i32 {
        let sum = self as i64 + other as i64;
        sum.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    fn to_f32(self) -> f32 {
        self as f32 / i32::MAX as f32
    }
}

impl Sample for f32 {
    const SILENCE: f32 = 0.0;

    fn scale(self, volume: u32) -> f32 {
        self * (volume as f32 / VOLUME_MAX as f32)
    }

    fn saturating_mix(self, other: f32) -> f32 {
        (self + other).clamp(-1.0, 1.0)
    }

    fn to_f32(self) -> f32 {
        self
    }
}
