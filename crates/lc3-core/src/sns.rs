//! Spectral noise shaping
//!
//! The band energy envelope is condensed into 16 scale factors, vector
//! quantized in two stages (two 32-entry codebooks over the low and high
//! halves, then a rotated pulse-shape quantizer with four shape/gain
//! layouts), and applied multiplicatively to the spectrum. The decoder
//! reconstructs the identical envelope from 38 side bits and applies its
//! inverse, so shaping and unshaping cancel exactly up to scale-factor
//! quantization.

use crate::bits::{BitReader, BitWriter};
use crate::error::{Lc3Error, Result};
use crate::tables::{MPVQ_OFFSETS, SNS_DCT16, SNS_GAINS, SNS_HFCB, SNS_LFCB};
use crate::types::{FrameConfig, FrameDuration};

/// Side bits occupied by the scale-factor data
pub const SNS_BITS: usize = 38;

const SZ_SHAPE_A: u32 = 2_390_004;
const SZ_SHAPE_FULL: u32 = 15_158_272;

/// Quantized scale-factor side data of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnsData {
    /// Low-band first-stage codeword
    pub ind_lf: usize,
    /// High-band first-stage codeword
    pub ind_hf: usize,
    /// Second-stage shape layout (0..4)
    pub shape: usize,
    /// Second-stage gain candidate
    pub gain: usize,
    /// Main pulse-configuration index
    pub idx_a: u32,
    /// Leading sign of the main section
    pub ls_a: bool,
    /// Auxiliary pulse-configuration index (shape 0 only)
    pub idx_b: u32,
    /// Leading sign of the auxiliary section (shape 0 only)
    pub ls_b: bool,
}

// ---------------------------------------------------------------------------
// Pulse-configuration enumeration
// ---------------------------------------------------------------------------

/// Enumerate a pulse vector into (index, leading sign)
pub fn enum_mpvq(v: &[i32]) -> (u32, bool) {
    let mut index = 0u32;
    let mut sign: Option<bool> = None;
    let mut x = 0usize;

    for (n, &vn) in v.iter().rev().enumerate() {
        if vn != 0 {
            if let Some(s) = sign {
                index = 2 * index + u32::from(s);
            }
            sign = Some(vn < 0);
        }
        index += MPVQ_OFFSETS[n][x];
        x += vn.unsigned_abs() as usize;
    }
    (index, sign.unwrap_or(false))
}

/// Rebuild a pulse vector of `npulses` pulses on `n` positions
pub fn deenum_mpvq(mut index: u32, mut ls: bool, mut npulses: usize, n: usize) -> Vec<i32> {
    let mut y = vec![0i32; n];
    let mut pos = 0;

    for i in (0..n).rev() {
        let yi;
        if index > 0 {
            let mut k = 0usize;
            while index < MPVQ_OFFSETS[i][npulses - k] {
                k += 1;
            }
            index -= MPVQ_OFFSETS[i][npulses - k];
            yi = k;
        } else {
            yi = npulses;
        }

        y[pos] = if ls { -(yi as i32) } else { yi as i32 };
        pos += 1;

        npulses -= yi;
        if npulses == 0 {
            break;
        }
        if yi > 0 {
            ls = index & 1 == 1;
            index >>= 1;
        }
    }
    y
}

// ---------------------------------------------------------------------------
// Scale-factor computation
// ---------------------------------------------------------------------------

/// Condense band energies into 16 scale factors
pub fn compute_scale_factors(cfg: &FrameConfig, energies: &[f32], attack: bool) -> [f32; 16] {
    // pad low bands by duplication up to the 64-band layout
    let mut e = energies.to_vec();
    while e.len() < 64 {
        let n2 = (64 - e.len()).min(e.len());
        let mut padded = Vec::with_capacity(e.len() + n2);
        for v in &e[..n2] {
            padded.push(*v);
            padded.push(*v);
        }
        padded.extend_from_slice(&e[n2..]);
        e = padded;
    }

    // smoothing
    let mut es = [0f32; 64];
    es[0] = 0.75 * e[0] + 0.25 * e[1];
    for i in 1..63 {
        es[i] = 0.25 * e[i - 1] + 0.5 * e[i] + 0.25 * e[i + 1];
    }
    es[63] = 0.25 * e[62] + 0.75 * e[63];

    // pre-emphasis tilt
    let g_tilt = [14.0f32, 18.0, 22.0, 26.0, 30.0][cfg.rate.index().min(4)];
    let mut ep = [0f32; 64];
    for i in 0..64 {
        ep[i] = es[i] * 10f32.powf(i as f32 * g_tilt / 630.0);
    }

    // noise floor
    let floor = (ep.iter().sum::<f32>() / 64.0 * 1e-4).max(2f32.powi(-32));
    for v in ep.iter_mut() {
        *v = v.max(floor);
    }

    // log domain
    let mut el = [0f32; 64];
    for i in 0..64 {
        el[i] = (1e-31 + ep[i]).log2() / 2.0;
    }

    // grouping by 4 with triangular weights
    let w = [1.0f32, 2.0, 3.0, 3.0, 2.0, 1.0].map(|v| v / 12.0);
    let mut e4 = [0f32; 16];
    e4[0] = w[0] * el[0] + (1..6).map(|k| w[k] * el[k - 1]).sum::<f32>();
    for i in 1..15 {
        e4[i] = (0..6).map(|k| w[k] * el[4 * i - 1 + k]).sum::<f32>();
    }
    e4[15] = (0..5).map(|k| w[k] * el[59 + k]).sum::<f32>() + w[5] * el[63];

    let mean = e4.iter().sum::<f32>() / 16.0;
    let mut scf = e4.map(|v| 0.85 * (v - mean));

    if attack {
        // flatten the envelope on transients
        let mut scf_a = [0f32; 16];
        scf_a[0] = scf[..3].iter().sum::<f32>() / 3.0;
        scf_a[1] = scf[..4].iter().sum::<f32>() / 4.0;
        for i in 2..14 {
            scf_a[i] = scf[i - 2..i + 3].iter().sum::<f32>() / 5.0;
        }
        scf_a[14] = scf[12..].iter().sum::<f32>() / 4.0;
        scf_a[15] = scf[13..].iter().sum::<f32>() / 3.0;

        let mean_a = scf_a.iter().sum::<f32>() / 16.0;
        let f = if cfg.duration == FrameDuration::Ms10 {
            0.5
        } else {
            0.3
        };
        scf = scf_a.map(|v| f * (v - mean_a));
    }
    scf
}

// ---------------------------------------------------------------------------
// Two-stage quantizer
// ---------------------------------------------------------------------------

fn dct16(x: &[f32; 16]) -> [f32; 16] {
    let m = &*SNS_DCT16;
    std::array::from_fn(|k| (0..16).map(|n| m[k][n] * x[n]).sum())
}

fn idct16(x: &[f32; 16]) -> [f32; 16] {
    let m = &*SNS_DCT16;
    std::array::from_fn(|n| (0..16).map(|k| m[k][n] * x[k]).sum())
}

fn add_pulses(
    x: &[f32],
    y: &mut [i32],
    target: i32,
    corr_xy: &mut f32,
    energy_y: &mut f32,
) {
    let mut total: i32 = y.iter().sum();
    while total < target {
        let mut best = 0usize;
        let mut best_q = f32::NEG_INFINITY;
        for n in 0..x.len() {
            let num = *corr_xy + x[n];
            let q = num * num / (*energy_y + 2.0 * y[n] as f32 + 1.0);
            if q > best_q {
                best_q = q;
                best = n;
            }
        }
        *corr_xy += x[best];
        *energy_y += 2.0 * y[best] as f32 + 1.0;
        y[best] += 1;
        total += 1;
    }
}

fn normalized(y: &[i32; 16]) -> [f32; 16] {
    let norm = (y.iter().map(|&v| (v * v) as f32).sum::<f32>()).sqrt();
    if norm > 0.0 {
        std::array::from_fn(|i| y[i] as f32 / norm)
    } else {
        [0.0; 16]
    }
}

/// Quantize the scale factors, returning side data and the quantized set
pub fn quantize(scf: &[f32; 16]) -> (SnsData, [f32; 16]) {
    // stage 1
    let ind_lf = (0..32)
        .min_by(|&a, &b| {
            let da: f32 = (0..8).map(|j| (scf[j] - SNS_LFCB[a][j]).powi(2)).sum();
            let db: f32 = (0..8).map(|j| (scf[j] - SNS_LFCB[b][j]).powi(2)).sum();
            da.total_cmp(&db)
        })
        .unwrap();
    let ind_hf = (0..32)
        .min_by(|&a, &b| {
            let da: f32 = (0..8).map(|j| (scf[8 + j] - SNS_HFCB[a][j]).powi(2)).sum();
            let db: f32 = (0..8).map(|j| (scf[8 + j] - SNS_HFCB[b][j]).powi(2)).sum();
            da.total_cmp(&db)
        })
        .unwrap();

    let st1: [f32; 16] =
        std::array::from_fn(|j| if j < 8 { SNS_LFCB[ind_lf][j] } else { SNS_HFCB[ind_hf][j - 8] });

    // stage 2: rotate the residual and search the four pulse layouts
    let r1: [f32; 16] = std::array::from_fn(|j| scf[j] - st1[j]);
    let t2 = dct16(&r1);
    let x: [f32; 16] = t2.map(f32::abs);

    // projection near 6 pulses, then greedy refinement
    let denom: f32 = x.iter().sum();
    let proj = if denom > 1e-30 { 5.0 / denom } else { 0.0 };
    let mut y3: [i32; 16] = x.map(|v| (v * proj) as i32);

    let mut corr_xy: f32 = (0..16).map(|n| y3[n] as f32 * x[n]).sum();
    let mut energy_y: f32 = (0..16).map(|n| (y3[n] * y3[n]) as f32).sum();
    add_pulses(&x, &mut y3, 6, &mut corr_xy, &mut energy_y);

    let mut y2 = y3;
    add_pulses(&x, &mut y2, 8, &mut corr_xy, &mut energy_y);

    // drop the upper section and refill the lower one
    let mut y1 = y2;
    for n in 10..16 {
        corr_xy -= y2[n] as f32 * x[n];
        energy_y -= (y2[n] * y2[n]) as f32;
        y1[n] = 0;
    }
    {
        let (lo, _) = y1.split_at_mut(10);
        let target = 10;
        add_pulses(&x[..10], lo, target, &mut corr_xy, &mut energy_y);
    }

    // shape 0 adds one pulse to the upper section
    let mut y0 = y1;
    {
        let mut best = 10usize;
        let mut best_q = f32::NEG_INFINITY;
        for n in 10..16 {
            let num = corr_xy + x[n];
            let q = num * num / (energy_y + 2.0 * y0[n] as f32 + 1.0);
            if q > best_q {
                best_q = q;
                best = n;
            }
        }
        y0[best] += 1;
    }

    // apply the residual signs
    let sgn = |n: usize| -> i32 {
        if t2[n] < 0.0 {
            -1
        } else if t2[n] > 0.0 {
            1
        } else {
            0
        }
    };
    let mut cand = [y0, y1, y2, y3];
    for y in cand.iter_mut() {
        for n in 0..16 {
            y[n] *= sgn(n);
        }
    }

    // shape and gain by reconstruction error
    let mut shape = 0usize;
    let mut gain = 0usize;
    let mut best_mse = f32::INFINITY;
    let mut xq = [[0f32; 16]; 4];
    for j in 0..4 {
        xq[j] = normalized(&cand[j]);
        for (i, &g) in SNS_GAINS[j].iter().enumerate() {
            let mse: f32 = (0..16).map(|n| (t2[n] - g * xq[j][n]).powi(2)).sum();
            if mse < best_mse {
                best_mse = mse;
                shape = j;
                gain = i;
            }
        }
    }

    let (idx_a, ls_a, idx_b, ls_b) = match shape {
        0 => {
            let (ia, la) = enum_mpvq(&cand[0][..10]);
            let (ib, lb) = enum_mpvq(&cand[0][10..]);
            (ia, la, ib, lb)
        }
        1 => {
            let (ia, la) = enum_mpvq(&cand[1][..10]);
            (ia, la, 0, false)
        }
        _ => {
            let (ia, la) = enum_mpvq(&cand[shape]);
            (ia, la, 0, false)
        }
    };

    let data = SnsData {
        ind_lf,
        ind_hf,
        shape,
        gain,
        idx_a,
        ls_a,
        idx_b,
        ls_b,
    };

    let g = SNS_GAINS[shape][gain];
    let rec = idct16(&xq[shape]);
    let scf_q: [f32; 16] = std::array::from_fn(|j| st1[j] + g * rec[j]);
    (data, scf_q)
}

/// Rebuild the quantized scale factors from side data
pub fn unquantize(data: &SnsData) -> [f32; 16] {
    let mut y = [0i32; 16];
    match data.shape {
        0 => {
            y[..10].copy_from_slice(&deenum_mpvq(data.idx_a, data.ls_a, 10, 10));
            y[10..].copy_from_slice(&deenum_mpvq(data.idx_b, data.ls_b, 1, 6));
        }
        1 => y[..10].copy_from_slice(&deenum_mpvq(data.idx_a, data.ls_a, 10, 10)),
        2 => y = deenum_mpvq(data.idx_a, data.ls_a, 8, 16).try_into().unwrap(),
        _ => y = deenum_mpvq(data.idx_a, data.ls_a, 6, 16).try_into().unwrap(),
    }

    let xq = normalized(&y);
    let g = SNS_GAINS[data.shape][data.gain];
    let rec = idct16(&xq);
    std::array::from_fn(|j| {
        let st1 = if j < 8 {
            SNS_LFCB[data.ind_lf][j]
        } else {
            SNS_HFCB[data.ind_hf][j - 8]
        };
        st1 + g * rec[j]
    })
}

// ---------------------------------------------------------------------------
// Spectral shaping
// ---------------------------------------------------------------------------

/// Apply the scale-factor envelope to the spectrum, dividing it out during
/// analysis (`inverse == false`) and restoring it during synthesis
pub fn spectral_shaping(
    limits: &[usize],
    scf_q: &[f32; 16],
    inverse: bool,
    spectrum: &mut [f32],
) {
    // interpolate 16 factors onto the 64-band grid
    let mut scf_i = [0f32; 64];
    scf_i[0] = scf_q[0];
    scf_i[1] = scf_q[0];
    for i in 0..15 {
        let d = scf_q[i + 1] - scf_q[i];
        for (k, f) in [1.0f32, 3.0, 5.0, 7.0].iter().enumerate() {
            scf_i[2 + 4 * i + k] = scf_q[i] + f / 8.0 * d;
        }
    }
    scf_i[62] = scf_q[15] + 1.0 / 8.0 * (scf_q[15] - scf_q[14]);
    scf_i[63] = scf_q[15] + 3.0 / 8.0 * (scf_q[15] - scf_q[14]);

    // fold down to the actual band count by pairwise merging at the bottom
    let nb = limits.len() - 1;
    let mut g = scf_i.to_vec();
    while g.len() > nb {
        let n2 = (g.len() - nb).min(g.len() / 2);
        let mut folded = Vec::with_capacity(g.len() - n2);
        for i in 0..n2 {
            folded.push(0.5 * (g[2 * i] + g[2 * i + 1]));
        }
        folded.extend_from_slice(&g[2 * n2..]);
        g = folded;
    }

    for (b, w) in limits.windows(2).enumerate() {
        let gain = 2f32.powf(if inverse { g[b] } else { -g[b] });
        for v in spectrum[w[0]..w[1]].iter_mut() {
            *v *= gain;
        }
    }
}

// ---------------------------------------------------------------------------
// Bitstream layout
// ---------------------------------------------------------------------------

const GAIN_MSB_BITS: [usize; 4] = [1, 1, 2, 2];
const GAIN_LSB_BITS: [usize; 4] = [0, 1, 0, 1];

/// Write the 38 bits of scale-factor side data
pub fn write(data: &SnsData, bits: &mut BitWriter) {
    let shape = data.shape;
    bits.put_bits(data.ind_lf as u32, 5);
    bits.put_bits(data.ind_hf as u32, 5);
    bits.put_bits((shape >> 1) as u32, 1);
    bits.put_bits((data.gain >> GAIN_LSB_BITS[shape]) as u32, GAIN_MSB_BITS[shape]);
    bits.put_bits(u32::from(data.ls_a), 1);

    let joint = match shape {
        0 => data.idx_a + (2 * data.idx_b + u32::from(data.ls_b) + 2) * SZ_SHAPE_A,
        1 => data.idx_a + (data.gain as u32 & 1) * SZ_SHAPE_A,
        2 => data.idx_a,
        _ => SZ_SHAPE_FULL + (data.gain as u32 & 1) + 2 * data.idx_a,
    };

    let low = 14 - GAIN_MSB_BITS[shape];
    bits.put_bits(joint & ((1 << low) - 1), low);
    bits.put_bits(joint >> low, 12);
}

/// Read and validate the scale-factor side data
pub fn read(bits: &mut BitReader<'_>) -> Result<SnsData> {
    let ind_lf = bits.get_bits(5) as usize;
    let ind_hf = bits.get_bits(5) as usize;
    let shape_msb = bits.get_bits(1) as usize;
    let gain_msb_bits = 1 + shape_msb;
    let mut gain = bits.get_bits(gain_msb_bits) as usize;
    let ls_a = bits.get_bits(1) != 0;

    let low = 14 - gain_msb_bits;
    let mut joint = bits.get_bits(low);
    joint |= bits.get_bits(12) << low;

    let (shape, idx_a, idx_b, ls_b);
    if shape_msb == 0 {
        if joint >= SZ_SHAPE_A * 14 {
            return Err(Lc3Error::invalid_bitstream("invalid shaping joint index"));
        }
        idx_a = joint % SZ_SHAPE_A;
        let rest = joint / SZ_SHAPE_A;
        if rest >= 2 {
            shape = 0;
            idx_b = (rest - 2) / 2;
            ls_b = (rest - 2) % 2 == 1;
        } else {
            shape = 1;
            gain = (gain << 1) + (rest & 1) as usize;
            idx_b = 0;
            ls_b = false;
        }
    } else {
        if joint >= SZ_SHAPE_FULL + 2 * 774_912 {
            return Err(Lc3Error::invalid_bitstream("invalid shaping joint index"));
        }
        idx_b = 0;
        ls_b = false;
        if joint < SZ_SHAPE_FULL {
            shape = 2;
            idx_a = joint;
        } else {
            shape = 3;
            let rest = joint - SZ_SHAPE_FULL;
            gain = (gain << 1) + (rest % 2) as usize;
            idx_a = rest / 2;
        }
    }

    Ok(SnsData {
        ind_lf,
        ind_hf,
        shape,
        gain,
        idx_a,
        ls_a,
        idx_b,
        ls_b,
    })
}
