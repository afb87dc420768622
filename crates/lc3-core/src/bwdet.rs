//! Audio bandwidth detector
//!
//! Finds the highest bandwidth tier whose spectrum region still carries
//! energy, then double-checks that a sharp cutoff edge actually exists at
//! the chosen boundary; gentle roll-offs are treated as full-band material
//! so the coder does not clip content that was never band-limited.

use crate::error::{Lc3Error, Result};
use crate::tables::{bandwidth_count, bandwidth_stop};
use crate::types::FrameConfig;

/// Quiet threshold per bandwidth region, on mean per-bin energy
///
/// The orthonormal transform keeps the time-domain mean square, so on
/// 16-bit input a region below ~3 LSB of wideband noise (mean energy 9-10)
/// counts as quiet. The lowest region gets double slack to absorb dc
/// offset and mains hum.
const QUIET_THRESHOLD: [f32; 4] = [20.0, 10.0, 10.0, 10.0];

/// Cutoff-edge sharpness requirement, in dB across the boundary window
const EDGE_THRESHOLD_DB: f32 = 20.0;
const EDGE_WIDTH: usize = 3;

/// Number of side bits the bandwidth index occupies
pub fn bandwidth_bits(cfg: &FrameConfig) -> usize {
    let n = bandwidth_count(cfg);
    if n <= 1 {
        0
    } else {
        usize::BITS as usize - (n - 1).leading_zeros() as usize
    }
}

/// Detect the coded bandwidth index of one frame
pub fn detect(cfg: &FrameConfig, spectrum: &[f32]) -> usize {
    let nbw = bandwidth_count(cfg) - 1;
    if nbw == 0 {
        return 0;
    }

    // highest region still above the quiet threshold
    let mut bw = nbw;
    while bw > 0 {
        let lo = bandwidth_stop(cfg, bw - 1);
        let hi = bandwidth_stop(cfg, bw);
        let region = &spectrum[lo..hi];
        let mean = region.iter().map(|&v| v * v).sum::<f32>() / region.len() as f32;
        if mean > QUIET_THRESHOLD[bw - 1] {
            break;
        }
        bw -= 1;
    }

    if bw == nbw {
        return bw;
    }

    // a detected limit must come with a sharp edge somewhere in its tier;
    // otherwise assume the source was simply dark and keep full bandwidth
    let lo_bound = if bw > 0 {
        bandwidth_stop(cfg, bw - 1)
    } else {
        EDGE_WIDTH
    };
    let hi_bound = (bandwidth_stop(cfg, bw) + EDGE_WIDTH).min(spectrum.len() - EDGE_WIDTH);

    let mut sharpest = f32::NEG_INFINITY;
    for edge in lo_bound..=hi_bound {
        let below: f32 = spectrum[edge - EDGE_WIDTH..edge]
            .iter()
            .map(|&v| v * v)
            .sum::<f32>()
            + f32::MIN_POSITIVE;
        let above: f32 = spectrum[edge..edge + EDGE_WIDTH]
            .iter()
            .map(|&v| v * v)
            .sum::<f32>()
            + f32::MIN_POSITIVE;
        sharpest = sharpest.max(10.0 * (below / above).log10());
    }

    if sharpest < EDGE_THRESHOLD_DB {
        nbw
    } else {
        bw
    }
}

/// Read and validate the bandwidth index of one frame
pub fn read(cfg: &FrameConfig, bits: &mut crate::bits::BitReader<'_>) -> Result<usize> {
    let nbits = bandwidth_bits(cfg);
    if nbits == 0 {
        return Ok(if cfg.is_hr() { 0 } else { cfg.rate.index() });
    }
    let bw = bits.get_bits(nbits) as usize;
    if bw >= bandwidth_count(cfg) {
        return Err(Lc3Error::invalid_bitstream("invalid bandwidth index"));
    }
    Ok(bw)
}
