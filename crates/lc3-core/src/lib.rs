//! # LC3-Core: Low Complexity Communication Codec
//!
//! A self-contained implementation of the LC3 frame codec used by LE Audio:
//! low-delay MDCT transform coding with spectral noise shaping, temporal
//! noise shaping, a long-term postfilter and an arithmetic-coded spectrum,
//! plus packet loss concealment on the decoder side.
//!
//! ## Features
//!
//! - **Frame durations**: 2.5, 5, 7.5 and 10 ms
//! - **Sample rates**: 8 to 48 kHz, plus 48/96 kHz high-resolution mode
//! - **Bitrates**: 20 to 400 bytes per frame and channel (625 in HR mode)
//! - **Multi-channel**: independent channels coded in parallel
//! - **Concealment**: spectral-repetition PLC for lost frames
//!
//! ## Usage
//!
//! ```rust
//! use lc3_core::{FrameConfig, FrameDuration, SampleRate, Lc3Encoder, Lc3Decoder};
//!
//! let config = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000)?;
//! let mut encoder = Lc3Encoder::new(config)?;
//! let mut decoder = Lc3Decoder::new(config)?;
//!
//! let pcm = vec![0i16; config.frame_samples()];
//! let mut frame = vec![0u8; 40];
//! encoder.encode_frame(&pcm, 40, &mut frame)?;
//!
//! let mut out = vec![0i16; config.frame_samples()];
//! decoder.decode_frame(Some(&frame), &mut out)?;
//! # Ok::<(), lc3_core::Lc3Error>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod attdet;
pub mod bits;
pub mod bwdet;
pub mod decoder;
pub mod encoder;
pub mod energy;
pub mod error;
pub mod ltpf;
pub mod mdct;
pub mod plc;
pub mod sns;
pub mod spectrum;
pub mod tables;
pub mod tns;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export the session-level API
pub use decoder::Lc3Decoder;
pub use encoder::Lc3Encoder;
pub use error::{Lc3Error, Result};
pub use types::{FrameCodec, FrameConfig, FrameDuration, SampleRate};

/// Version information for the codec library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the codec library
///
/// Installs the default `tracing` subscriber when none is set. Safe to call
/// multiple times; all lookup tables build lazily on first use.
pub fn init() {
    let _ = tracing_subscriber::fmt::try_init();
    tracing::info!("lc3-core v{} initialized", VERSION);
}
