//! Generated lookup tables
//!
//! Every table the pipeline shares between encoder and decoder lives here,
//! built once behind `Lazy` statics: the pulse-configuration enumeration
//! offsets, the scale-factor codebooks and rotation matrix, the symbol
//! probability models of the arithmetic coder, and the long-term postfilter
//! prototypes. Encoder and decoder always read the same instance, which is
//! what keeps the two ends of the codec consistent.

use once_cell::sync::Lazy;
use std::f64::consts::PI;

use crate::bits::AC_TOTAL;
use crate::types::{FrameConfig, FrameDuration, SampleRate};

// ---------------------------------------------------------------------------
// Band layout
// ---------------------------------------------------------------------------

/// Band boundaries for a configuration, `band_count() + 1` entries ending at
/// `spectral_lines()`
///
/// Bands follow an asinh-warped frequency scale, one bin wide at the bottom
/// and growing toward the top, degenerating to one bin per band when fewer
/// than 64 lines are coded.
pub fn band_limits(cfg: &FrameConfig) -> Vec<usize> {
    let ne = cfg.spectral_lines();
    let nb = cfg.band_count();
    if nb == ne {
        return (0..=ne).collect();
    }

    let c = (20_000.0f64 / 600.0).asinh();
    let mut lim = vec![0usize; nb + 1];
    for (j, l) in lim.iter_mut().enumerate() {
        let f = (j as f64 * c / nb as f64).sinh() / c.sinh();
        *l = (f * ne as f64).round() as usize;
    }
    // minimum width of one bin
    for j in 1..=nb {
        if lim[j] <= lim[j - 1] {
            lim[j] = lim[j - 1] + 1;
        }
    }
    // re-pin the top and restore monotonicity backwards
    lim[nb] = ne;
    for j in (1..nb).rev() {
        if lim[j] >= lim[j + 1] {
            lim[j] = lim[j + 1] - 1;
        }
    }
    lim
}

/// Spectral line where a detected bandwidth stops, capped to the coded range
pub fn bandwidth_stop(cfg: &FrameConfig, bw: usize) -> usize {
    let ne = cfg.spectral_lines();
    if cfg.is_hr() {
        return ne;
    }
    let cutoff_hz = [4_000u64, 8_000, 12_000, 16_000, 20_000][bw];
    ne.min((2 * cutoff_hz * cfg.duration.us() as u64 / 1_000_000) as usize)
}

/// Count of signalled bandwidths for a configuration (1 when the detector
/// is bypassed)
pub fn bandwidth_count(cfg: &FrameConfig) -> usize {
    if cfg.is_hr() {
        1
    } else {
        cfg.rate.index() + 1
    }
}

// ---------------------------------------------------------------------------
// Pulse-configuration (PVQ) enumeration offsets
// ---------------------------------------------------------------------------

/// Offsets for the pulse-vector enumeration, `[positions][pulses]`
pub static MPVQ_OFFSETS: Lazy<[[u32; 11]; 16]> = Lazy::new(|| {
    let mut a = [[0u32; 11]; 16];
    for k in 1..11 {
        a[0][k] = 1;
    }
    for n in 1..16 {
        for k in 1..11 {
            a[n][k] = a[n][k - 1] + a[n - 1][k - 1] + a[n - 1][k];
        }
    }
    a
});

/// Number of sign-leading pulse vectors of `k` pulses on `n` positions
///
/// This is half the raw pulse-vector count, the leading sign being coded
/// apart.
pub fn pvq_size(n: usize, k: usize) -> u32 {
    // v(n, k) = v(n-1, k) + v(n-1, k-1) + v(n, k-1), v(:, 0) = 1, v(0, :) = 0|1
    let mut v = vec![0u64; k + 1];
    v[0] = 1;
    for _ in 0..n {
        let mut prev = v[0];
        for x in 1..=k {
            let cur = v[x];
            v[x] = cur + prev + v[x - 1];
            prev = cur;
        }
    }
    (v[k] / 2) as u32
}

// ---------------------------------------------------------------------------
// Scale-factor quantizer
// ---------------------------------------------------------------------------

fn dct16_forward_matrix() -> [[f32; 16]; 16] {
    // orthonormal DCT-II, rows are output coefficients
    let mut m = [[0f32; 16]; 16];
    for k in 0..16 {
        let s = if k == 0 {
            (1.0 / 16.0f64).sqrt()
        } else {
            (2.0 / 16.0f64).sqrt()
        };
        for n in 0..16 {
            m[k][n] = (s * (PI * k as f64 * (2 * n + 1) as f64 / 32.0).cos()) as f32;
        }
    }
    m
}

/// Orthonormal 16-point DCT-II matrix, `[k][n]`
pub static SNS_DCT16: Lazy<[[f32; 16]; 16]> = Lazy::new(dct16_forward_matrix);

fn build_codebook(gains: [f32; 4]) -> [[f32; 8]; 32] {
    // 8 cosine shapes x 4 gains of smooth log-energy profiles
    let mut cb = [[0f32; 8]; 32];
    for i in 0..32 {
        let shape = i >> 2;
        let gain = gains[i & 3];
        for j in 0..8 {
            cb[i][j] = gain * (PI * shape as f64 * (2 * j + 1) as f64 / 16.0).cos() as f32;
        }
    }
    cb
}

/// First-stage codebook over the 8 low bands
pub static SNS_LFCB: Lazy<[[f32; 8]; 32]> = Lazy::new(|| build_codebook([-8.0, -3.0, 3.0, 8.0]));

/// First-stage codebook over the 8 high bands
pub static SNS_HFCB: Lazy<[[f32; 8]; 32]> = Lazy::new(|| build_codebook([-10.0, -4.0, 4.0, 10.0]));

/// Second-stage gain candidates per shape
pub static SNS_GAINS: [&[f32]; 4] = [
    &[0.75, 1.25],
    &[0.5, 0.75, 1.0, 1.5],
    &[0.55, 0.8, 1.1, 1.6],
    &[0.4, 0.55, 0.75, 1.0, 1.3, 1.7, 2.2, 3.0],
];

// ---------------------------------------------------------------------------
// Arithmetic-coder probability models
// ---------------------------------------------------------------------------

/// Cumulative-frequency table of one symbol model
pub type AcModel = Vec<u16>;

fn normalize_freqs(raw: &[f64]) -> AcModel {
    let total: f64 = raw.iter().sum();
    let mut freqs: Vec<u32> = raw
        .iter()
        .map(|&f| ((f / total) * f64::from(AC_TOTAL)).round().max(1.0) as u32)
        .collect();
    // force the sum to exactly AC_TOTAL, adjusting the largest entry
    loop {
        let sum: u32 = freqs.iter().sum();
        if sum == u32::from(AC_TOTAL) {
            break;
        }
        let k = (0..freqs.len()).max_by_key(|&k| freqs[k]).unwrap();
        if sum > u32::from(AC_TOTAL) {
            freqs[k] -= sum - u32::from(AC_TOTAL);
        } else {
            freqs[k] += u32::from(AC_TOTAL) - sum;
        }
    }
    let mut cum = vec![0u16];
    let mut acc = 0u16;
    for f in freqs {
        acc += f as u16;
        cum.push(acc);
    }
    cum
}

fn spec_model(decay: f64) -> AcModel {
    // pair symbol (a, b) = (sym % 4, sym / 4) under independent geometric
    // magnitudes, symbol 16 escapes to the next level
    let q = 1.0 - decay;
    let mut raw = vec![0f64; 17];
    for sym in 0..16 {
        let (a, b) = (sym % 4, sym / 4);
        raw[sym] = q * q * decay.powi((a + b) as i32);
    }
    let inside = (1.0 - decay.powi(4)) * (1.0 - decay.powi(4));
    raw[16] = 1.0 - inside;
    normalize_freqs(&raw)
}

/// Spectral symbol models: 64 cumulative tables over 17 symbols
pub static SPEC_MODELS: Lazy<Vec<AcModel>> = Lazy::new(|| {
    (0..64)
        .map(|m| {
            let lev = m >> 4;
            let t = m & 15;
            let decay = (0.18 + 0.05 * t as f64 + 0.12 * lev as f64).min(0.93);
            spec_model(decay)
        })
        .collect()
});

/// Bit cost of each spectral symbol per model, in 1/2048 bit units, rounded
/// up so metered budgets never undershoot the coded size
pub static SPEC_BITS: Lazy<Vec<[u32; 17]>> = Lazy::new(|| {
    SPEC_MODELS
        .iter()
        .map(|cum| {
            let mut bits = [0u32; 17];
            for (sym, b) in bits.iter_mut().enumerate() {
                let freq = f64::from(cum[sym + 1] - cum[sym]);
                *b = ((f64::from(AC_TOTAL) / freq).log2() * 2048.0).ceil() as u32;
            }
            bits
        })
        .collect()
});

/// Bit cost of one symbol under a cumulative model, in 1/2048 bit units,
/// rounded up
pub fn ac_model_bits(model: &AcModel, sym: usize) -> u32 {
    let freq = f64::from(model[sym + 1] - model[sym]);
    ((f64::from(AC_TOTAL) / freq).log2() * 2048.0).ceil() as u32
}

/// Context-state to model mapping of the spectral coder, 4096 entries
///
/// The state packs the escape level (2 bits), the rate flag, the
/// upper-spectrum flag and the two previous pair magnitudes as nibbles;
/// recent activity selects progressively flatter models.
pub static SPEC_LOOKUP: Lazy<Vec<u8>> = Lazy::new(|| {
    (0usize..4096)
        .map(|s| {
            let lev = s >> 10;
            let rate = (s >> 9) & 1;
            let high = (s >> 8) & 1;
            let c = s & 255;
            let activity = (c >> 4) + (c & 15) + 2 * rate + 2 * high;
            let t = (activity / 2).min(15);
            ((lev << 4) | t) as u8
        })
        .collect()
});

fn peaked_model(nsym: usize, center: usize, sigma: f64) -> AcModel {
    let raw: Vec<f64> = (0..nsym)
        .map(|k| (-((k as f64 - center as f64).abs()) / sigma).exp())
        .collect();
    normalize_freqs(&raw)
}

fn decaying_model(nsym: usize, decay: f64) -> AcModel {
    let raw: Vec<f64> = (0..nsym).map(|k| decay.powi(k as i32)).collect();
    normalize_freqs(&raw)
}

/// Temporal-noise-shaping filter order models, `[lpc_weighting]`
pub static TNS_ORDER_MODELS: Lazy<[AcModel; 2]> =
    Lazy::new(|| [decaying_model(8, 0.75), decaying_model(8, 0.55)]);

/// Temporal-noise-shaping reflection coefficient models, one per position
pub static TNS_COEF_MODELS: Lazy<[AcModel; 8]> = Lazy::new(|| {
    std::array::from_fn(|i| peaked_model(17, 8, 3.0 - 0.25 * i as f64))
});

// ---------------------------------------------------------------------------
// Long-term postfilter prototypes
// ---------------------------------------------------------------------------

fn hann(i: usize, n: usize) -> f64 {
    0.5 - 0.5 * (2.0 * PI * (i as f64 + 0.5) / n as f64).cos()
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// 12.8 kHz resampler prototype: 239 windowed-sinc taps on the 192 kHz
/// virtual grid, unit DC gain across phases
pub static LTPF_H12K8: Lazy<[f64; 239]> = Lazy::new(|| {
    let mut h = [0f64; 239];
    let mut sum = 0.0;
    for (i, t) in h.iter_mut().enumerate() {
        let m = i as f64 - 119.0;
        *t = sinc(m / 15.0) * hann(i, 239);
        sum += *t;
    }
    for t in h.iter_mut() {
        *t /= sum;
    }
    h
});

/// Quarter-sample interpolator for the pitch refinement, taps at `t/4`
/// offsets for `t` in `-15..=15`
pub static LTPF_H4: Lazy<[f64; 31]> = Lazy::new(|| {
    let mut h = [0f64; 31];
    for (i, t) in h.iter_mut().enumerate() {
        let m = i as f64 - 15.0;
        *t = sinc(m / 4.0) * hann(i, 31);
    }
    h
});

/// Quarter-sample interpolator for the normalized correlation measure,
/// taps at `t/4` offsets for `t` in `-7..=7`
pub static LTPF_HI: Lazy<[f64; 15]> = Lazy::new(|| {
    let mut h = [0f64; 15];
    for (i, t) in h.iter_mut().enumerate() {
        let m = i as f64 - 7.0;
        *t = sinc(m / 4.0) * hann(i, 15);
    }
    h
});

fn windowed_interp(len: usize, frac: f64, cutoff: f64) -> Vec<f32> {
    // fractional-delay lowpass centered on (len-1)/2 + frac, unit DC gain
    let center = (len - 1) as f64 / 2.0 + frac;
    let mut h: Vec<f64> = (0..len)
        .map(|i| {
            let m = i as f64 - center;
            cutoff * sinc(cutoff * m) * hann(i, len)
        })
        .collect();
    let sum: f64 = h.iter().sum();
    for t in h.iter_mut() {
        *t /= sum;
    }
    h.into_iter().map(|v| v as f32).collect()
}

/// Postfilter synthesis tap sets of one sample rate
pub struct LtpfFilters {
    /// Numerator taps per gain tier
    pub num: [Vec<f32>; 4],
    /// Denominator taps per quarter-sample fraction
    pub den: [Vec<f32>; 4],
}

/// Postfilter synthesis filters, indexed by non-HR sample rate
pub static LTPF_FILTERS: Lazy<[LtpfFilters; 5]> = Lazy::new(|| {
    std::array::from_fn(|sr| {
        let khz = [8usize, 16, 24, 32, 48][sr];
        let l_den = (khz / 2).max(4);
        let l_num = l_den / 2 + 1;
        LtpfFilters {
            num: std::array::from_fn(|g| {
                windowed_interp(l_num, 0.0, 0.85 - 0.05 * g as f64)
            }),
            den: std::array::from_fn(|f| {
                windowed_interp(l_den, f as f64 / 4.0, (12.8 / khz as f64).min(1.0))
            }),
        }
    })
});

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dur: FrameDuration, rate: SampleRate) -> FrameConfig {
        FrameConfig::mono(dur, rate).unwrap()
    }

    #[test]
    fn test_band_limits_shape() {
        for &rate in SampleRate::ALL.iter() {
            for &dur in FrameDuration::ALL.iter() {
                if rate.is_hr() && dur == FrameDuration::Ms7_5 {
                    continue;
                }
                let c = cfg(dur, rate);
                let lim = band_limits(&c);
                assert_eq!(lim.len(), c.band_count() + 1);
                assert_eq!(lim[0], 0);
                assert_eq!(*lim.last().unwrap(), c.spectral_lines());
                assert!(lim.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn test_bandwidth_stop() {
        let c = cfg(FrameDuration::Ms10, SampleRate::Hz48000);
        assert_eq!(bandwidth_stop(&c, 0), 80);
        assert_eq!(bandwidth_stop(&c, 1), 160);
        assert_eq!(bandwidth_stop(&c, 4), 400);

        let c = cfg(FrameDuration::Ms10, SampleRate::Hz16000);
        assert_eq!(bandwidth_stop(&c, 1), 160);
    }

    #[test]
    fn test_pvq_sizes() {
        assert_eq!(pvq_size(10, 10), 2_390_004);
        assert_eq!(pvq_size(16, 8), 15_158_272);
        assert_eq!(pvq_size(16, 6), 774_912);
        assert_eq!(pvq_size(6, 1), 6);
    }

    #[test]
    fn test_models_are_valid() {
        for cum in SPEC_MODELS.iter() {
            assert_eq!(cum.len(), 18);
            assert_eq!(cum[0], 0);
            assert_eq!(cum[17], AC_TOTAL);
            assert!(cum.windows(2).all(|w| w[0] < w[1]));
        }
        for cum in TNS_ORDER_MODELS.iter() {
            assert_eq!(*cum.last().unwrap(), AC_TOTAL);
        }
        for cum in TNS_COEF_MODELS.iter() {
            assert_eq!(cum.len(), 18);
            assert_eq!(*cum.last().unwrap(), AC_TOTAL);
        }
    }

    #[test]
    fn test_spec_lookup_range() {
        assert_eq!(SPEC_LOOKUP.len(), 4096);
        assert!(SPEC_LOOKUP.iter().all(|&m| m < 64));
        // escape level dominates model selection
        assert_eq!(SPEC_LOOKUP[0] >> 4, 0);
        assert_eq!(SPEC_LOOKUP[3 << 10] >> 4, 3);
    }

    #[test]
    fn test_dct16_orthonormal() {
        let m = &*SNS_DCT16;
        for i in 0..16 {
            for j in 0..16 {
                let dot: f32 = (0..16).map(|n| m[i][n] * m[j][n]).sum();
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((dot - expect).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_resampler_prototype_dc_gain() {
        let sum: f64 = LTPF_H12K8.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        // interpolation at integer offsets leaves samples untouched
        assert!((LTPF_HI[7] - 1.0).abs() < 1e-9);
        assert!(LTPF_HI[3].abs() < 1e-9);
    }

    #[test]
    fn test_ltpf_filters_unit_gain() {
        for f in LTPF_FILTERS.iter() {
            for num in f.num.iter() {
                let sum: f32 = num.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
            for den in f.den.iter() {
                let sum: f32 = den.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }
}
