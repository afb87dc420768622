//! Core types shared by the encoder and the decoder
//!
//! Session parameters are fixed at construction time: frame duration, sample
//! rate, high-resolution flag and channel count. Every derived quantity
//! (frame samples, spectral lines, band count, algorithmic delay, byte and
//! bitrate limits) is a pure function of those parameters and is available
//! here without instantiating a codec.

use crate::error::{Lc3Error, Result};

/// Frame duration of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameDuration {
    /// 2.5 ms frames
    Ms2_5,
    /// 5 ms frames
    Ms5,
    /// 7.5 ms frames (not available in high-resolution mode)
    Ms7_5,
    /// 10 ms frames
    Ms10,
}

impl FrameDuration {
    /// All durations, in signaling order
    pub const ALL: [FrameDuration; 4] = [Self::Ms2_5, Self::Ms5, Self::Ms7_5, Self::Ms10];

    /// Frame duration in microseconds
    pub fn us(self) -> u32 {
        match self {
            Self::Ms2_5 => 2_500,
            Self::Ms5 => 5_000,
            Self::Ms7_5 => 7_500,
            Self::Ms10 => 10_000,
        }
    }

    /// Resolve a duration from microseconds
    pub fn from_us(us: u32) -> Result<Self> {
        match us {
            2_500 => Ok(Self::Ms2_5),
            5_000 => Ok(Self::Ms5),
            7_500 => Ok(Self::Ms7_5),
            10_000 => Ok(Self::Ms10),
            _ => Err(Lc3Error::InvalidFrameDuration { us }),
        }
    }

    /// Index of this duration among the four supported values
    pub fn index(self) -> usize {
        match self {
            Self::Ms2_5 => 0,
            Self::Ms5 => 1,
            Self::Ms7_5 => 2,
            Self::Ms10 => 3,
        }
    }
}

/// Sample rate of a session
///
/// The two `Hr` variants select high-resolution mode: the full spectrum is
/// coded (no 20 kHz cap), quantization runs at 24-bit headroom and the
/// long-term postfilter is bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    /// 8 kHz (narrowband)
    Hz8000,
    /// 16 kHz (wideband)
    Hz16000,
    /// 24 kHz (super-wideband)
    Hz24000,
    /// 32 kHz
    Hz32000,
    /// 48 kHz (fullband)
    Hz48000,
    /// 48 kHz, high-resolution mode
    Hz48000Hr,
    /// 96 kHz, high-resolution mode
    Hz96000Hr,
}

impl SampleRate {
    /// All rates, in signaling order
    pub const ALL: [SampleRate; 7] = [
        Self::Hz8000,
        Self::Hz16000,
        Self::Hz24000,
        Self::Hz32000,
        Self::Hz48000,
        Self::Hz48000Hr,
        Self::Hz96000Hr,
    ];

    /// Get the sample rate value in Hz
    pub fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8_000,
            Self::Hz16000 => 16_000,
            Self::Hz24000 => 24_000,
            Self::Hz32000 => 32_000,
            Self::Hz48000 | Self::Hz48000Hr => 48_000,
            Self::Hz96000Hr => 96_000,
        }
    }

    /// Resolve a sample rate from Hz, honoring the high-resolution flag
    pub fn from_hz(hz: u32, hr: bool) -> Result<Self> {
        match (hz, hr) {
            (8_000, false) => Ok(Self::Hz8000),
            (16_000, false) => Ok(Self::Hz16000),
            (24_000, false) => Ok(Self::Hz24000),
            (32_000, false) => Ok(Self::Hz32000),
            (48_000, false) => Ok(Self::Hz48000),
            (48_000, true) => Ok(Self::Hz48000Hr),
            (96_000, true) => Ok(Self::Hz96000Hr),
            _ => Err(Lc3Error::InvalidSampleRate {
                rate: hz,
                supported: if hr {
                    vec![48_000, 96_000]
                } else {
                    vec![8_000, 16_000, 24_000, 32_000, 48_000]
                },
            }),
        }
    }

    /// Sample rate in kHz (all supported rates are whole kHz)
    pub fn khz(self) -> u32 {
        self.hz() / 1_000
    }

    /// Index among supported rates, in signaling order
    pub fn index(self) -> usize {
        match self {
            Self::Hz8000 => 0,
            Self::Hz16000 => 1,
            Self::Hz24000 => 2,
            Self::Hz32000 => 3,
            Self::Hz48000 => 4,
            Self::Hz48000Hr => 5,
            Self::Hz96000Hr => 6,
        }
    }

    /// True for the high-resolution variants
    pub fn is_hr(self) -> bool {
        matches!(self, Self::Hz48000Hr | Self::Hz96000Hr)
    }
}

/// Maximum channels per frame block
pub const MAX_CHANNELS: usize = 8;

/// Smallest admissible frame byte budget
pub const MIN_FRAME_BYTES: usize = 20;
/// Largest admissible frame byte budget
pub const MAX_FRAME_BYTES: usize = 400;
/// Largest admissible frame byte budget in high-resolution mode
pub const MAX_FRAME_BYTES_HR: usize = 625;

/// Immutable per-session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Frame duration
    pub duration: FrameDuration,
    /// Sample rate (carries the high-resolution flag)
    pub rate: SampleRate,
    /// Number of interleaved channels
    pub channels: usize,
}

impl FrameConfig {
    /// Build and validate a session configuration
    pub fn new(duration: FrameDuration, rate: SampleRate, channels: usize) -> Result<Self> {
        if rate.is_hr() && duration == FrameDuration::Ms7_5 {
            return Err(Lc3Error::invalid_config(
                "7.5ms frames are not available in high-resolution mode",
            ));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(Lc3Error::InvalidChannelCount {
                channels,
                max: MAX_CHANNELS,
            });
        }
        Ok(Self {
            duration,
            rate,
            channels,
        })
    }

    /// Mono helper used throughout the tests
    pub fn mono(duration: FrameDuration, rate: SampleRate) -> Result<Self> {
        Self::new(duration, rate, 1)
    }

    /// True in high-resolution mode
    pub fn is_hr(&self) -> bool {
        self.rate.is_hr()
    }

    /// Number of PCM samples per frame and channel
    pub fn frame_samples(&self) -> usize {
        (self.rate.hz() as u64 * self.duration.us() as u64 / 1_000_000) as usize
    }

    /// Number of coded spectral lines per frame and channel
    ///
    /// Regular mode codes at most 20 kHz of audio bandwidth (40 lines per
    /// millisecond); high-resolution mode codes the full spectrum.
    pub fn spectral_lines(&self) -> usize {
        let ns = self.frame_samples();
        if self.is_hr() {
            ns
        } else {
            ns.min((self.duration.us() / 25) as usize)
        }
    }

    /// Number of energy bands used by spectral shaping
    pub fn band_count(&self) -> usize {
        self.spectral_lines().min(64)
    }

    /// Algorithmic delay in samples (one frame of MDCT overlap)
    pub fn delay_samples(&self) -> usize {
        self.frame_samples()
    }

    /// Smallest admissible per-channel frame byte budget
    pub fn min_frame_bytes(&self) -> usize {
        MIN_FRAME_BYTES
    }

    /// Largest admissible per-channel frame byte budget
    pub fn max_frame_bytes(&self) -> usize {
        if self.is_hr() {
            MAX_FRAME_BYTES_HR
        } else {
            MAX_FRAME_BYTES
        }
    }

    /// Validate a per-channel frame byte budget
    pub fn check_frame_bytes(&self, nbytes: usize) -> Result<()> {
        let (min, max) = (self.min_frame_bytes(), self.max_frame_bytes());
        if nbytes < min || nbytes > max {
            return Err(Lc3Error::InvalidFrameBytes { nbytes, min, max });
        }
        Ok(())
    }

    /// Bitrate, in bits per second, of a given per-channel byte budget
    pub fn bitrate_for_bytes(&self, nbytes: usize) -> u32 {
        ((nbytes as u64 * 8 * 1_000_000) / self.duration.us() as u64) as u32
    }

    /// Per-channel byte budget closest below a target bitrate
    pub fn bytes_for_bitrate(&self, bitrate: u32) -> usize {
        (bitrate as u64 * self.duration.us() as u64 / 8_000_000) as usize
    }
}

/// Frame-oriented codec interface on 16-bit PCM
///
/// Mirrors the buffer-driven style of the wider codec stack: the caller owns
/// all buffers, `reset` clears stream state on discontinuities.
pub trait FrameCodec: Send {
    /// Session configuration the codec was built with
    fn config(&self) -> &FrameConfig;

    /// Expected PCM frame size, in samples, all channels interleaved
    fn frame_size(&self) -> usize {
        self.config().frame_samples() * self.config().channels
    }

    /// Reset stream state (overlap buffers, filter memories, concealment)
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_samples() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz48000).unwrap();
        assert_eq!(cfg.frame_samples(), 480);
        assert_eq!(cfg.spectral_lines(), 400);
        assert_eq!(cfg.band_count(), 64);
        assert_eq!(cfg.delay_samples(), 480);

        let cfg = FrameConfig::mono(FrameDuration::Ms7_5, SampleRate::Hz8000).unwrap();
        assert_eq!(cfg.frame_samples(), 60);
        assert_eq!(cfg.spectral_lines(), 60);
        assert_eq!(cfg.band_count(), 60);

        let cfg = FrameConfig::mono(FrameDuration::Ms2_5, SampleRate::Hz8000).unwrap();
        assert_eq!(cfg.frame_samples(), 20);
        assert_eq!(cfg.spectral_lines(), 20);
        assert_eq!(cfg.band_count(), 20);
    }

    #[test]
    fn test_hr_full_spectrum() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz96000Hr).unwrap();
        assert_eq!(cfg.frame_samples(), 960);
        assert_eq!(cfg.spectral_lines(), 960);
        assert_eq!(cfg.max_frame_bytes(), MAX_FRAME_BYTES_HR);
    }

    #[test]
    fn test_hr_rejects_7m5() {
        assert!(FrameConfig::mono(FrameDuration::Ms7_5, SampleRate::Hz48000Hr).is_err());
    }

    #[test]
    fn test_rate_resolution() {
        assert_eq!(
            SampleRate::from_hz(48_000, false).unwrap(),
            SampleRate::Hz48000
        );
        assert_eq!(
            SampleRate::from_hz(48_000, true).unwrap(),
            SampleRate::Hz48000Hr
        );
        assert!(SampleRate::from_hz(44_100, false).is_err());
        assert!(SampleRate::from_hz(96_000, false).is_err());
    }

    #[test]
    fn test_bitrate_conversions() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        assert_eq!(cfg.bitrate_for_bytes(40), 32_000);
        assert_eq!(cfg.bytes_for_bitrate(32_000), 40);

        let cfg = FrameConfig::mono(FrameDuration::Ms7_5, SampleRate::Hz32000).unwrap();
        assert_eq!(cfg.bitrate_for_bytes(75), 80_000);
        assert_eq!(cfg.bytes_for_bitrate(80_000), 75);
    }

    #[test]
    fn test_frame_bytes_range() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz48000).unwrap();
        assert!(cfg.check_frame_bytes(19).is_err());
        assert!(cfg.check_frame_bytes(20).is_ok());
        assert!(cfg.check_frame_bytes(400).is_ok());
        assert!(cfg.check_frame_bytes(401).is_err());
    }
}
