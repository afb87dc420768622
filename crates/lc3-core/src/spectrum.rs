//! Spectral quantization and coding
//!
//! The shaped spectrum is scaled by a global gain, rounded to integers
//! and entropy-coded as magnitude pairs with a context-adaptive model.
//! The gain index is found by a closed-form bit estimate refined over 8
//! binary steps, then nudged once from the exact bit count. Whatever
//! budget remains after the coded pairs is filled with residual
//! refinement bits, or with relocated least-significant bits when LSB
//! mode is active.

use crate::bits::{BitReader, BitWriter};
use crate::error::{Lc3Error, Result};
use crate::tables::{bandwidth_stop, SPEC_BITS, SPEC_LOOKUP, SPEC_MODELS};
use crate::types::{FrameConfig, SampleRate};

/// Encoder output of one frame's spectral stage
#[derive(Debug, Clone)]
pub struct SpectrumData {
    /// Global gain index, 8 bits
    pub g_idx: i32,
    /// Coded pair count boundary after truncation
    pub lastnz: usize,
    /// LSB relocation active
    pub lsb_mode: bool,
    /// 3-bit noise filling factor
    pub noise_factor: usize,
    rate: usize,
    xq: Vec<i32>,
    xg: Vec<f32>,
    nbits_residual_max: usize,
}

/// Decoded side fields of the spectral stage
#[derive(Debug, Clone, Copy)]
pub struct SpectrumSide {
    /// Count of coded samples, rounded up to a pair
    pub lastnz: usize,
    /// Relocated-LSB packing selected by the encoder
    pub lsb_mode: bool,
    /// Global gain index
    pub g_idx: i32,
}

fn lastnz_bits(ne: usize) -> usize {
    usize::BITS as usize - (ne / 2 - 1).leading_zeros() as usize
}

/// Side bits of the spectral stage: last-nonzero index, LSB-mode flag
/// and the gain index
pub fn side_bits(cfg: &FrameConfig) -> usize {
    lastnz_bits(cfg.spectral_lines()) + 1 + 8
}

/// Worst-case metering margin of the arithmetic coder
pub fn coder_bits(cfg: &FrameConfig, nbytes: usize) -> usize {
    lastnz_bits(cfg.spectral_lines()) + 3
        + usize::from(cfg.rate.is_hr())
        + ((8 * nbytes - 1) / 1280).min(2)
}

fn gain_offset(cfg: &FrameConfig, nbytes: usize) -> i32 {
    let sr_ind = cfg.rate.index() as i32;
    let sr_ind = if cfg.rate.is_hr() { sr_ind - 1 } else { sr_ind };
    let g_off = ((nbytes * 8) as i32 / (10 * (1 + sr_ind))).min(115);
    let g_off = -g_off - (105 + 5 * (1 + sr_ind));
    if cfg.rate.is_hr() {
        g_off.max(-181)
    } else {
        g_off
    }
}

fn noise_indices(cfg: &FrameConfig, bw: usize, xq: &[i32], lastnz: usize) -> Vec<bool> {
    let dt = cfg.duration.index();
    let nf_start = [6usize, 12, 18, 24][dt];
    let nf_width = [1usize, 1, 2, 3][dt];
    let bw_stop = bandwidth_stop(cfg, bw);

    let occupied = |k: usize| -> bool {
        if k < nf_start - nf_width {
            return true;
        }
        k < lastnz && xq[k] != 0
    };

    (0..bw_stop)
        .map(|k| {
            let lo = k.saturating_sub(nf_width);
            let hi = (k + nf_width + 1).min(bw_stop);
            (lo..hi).all(|i| !occupied(i))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Encoder state carried across frames: the smoothed bit-count offset
pub struct SpectrumAnalysis {
    cfg: FrameConfig,
    reset_off: bool,
    nbits_off: f64,
    nbits_spec: usize,
    nbits_est: usize,
    rate: usize,
    lsb_mode: bool,
}

impl SpectrumAnalysis {
    /// Build the analysis state for one channel
    pub fn new(cfg: &FrameConfig) -> Self {
        SpectrumAnalysis {
            cfg: *cfg,
            reset_off: false,
            nbits_off: 0.0,
            nbits_spec: 0,
            nbits_est: 0,
            rate: 0,
            lsb_mode: false,
        }
    }

    /// Clear the inter-frame gain tracking
    pub fn reset(&mut self) {
        self.reset_off = false;
        self.nbits_off = 0.0;
        self.nbits_spec = 0;
        self.nbits_est = 0;
    }

    fn estimate_gain(
        &self,
        x: &[f32],
        nbytes: usize,
        nbits_spec: usize,
        nbits_off: f64,
    ) -> (i32, i32, bool) {
        let g_off = gain_offset(&self.cfg, nbytes);
        let nbits = (nbits_spec as f64 + nbits_off + 0.5) as i32;
        let hr = self.cfg.rate.is_hr();

        // regularization keeps very quiet high-resolution content from
        // blowing up the gain search
        let mut nf = 0f64;
        if hr {
            let dt = self.cfg.duration.index();
            let dt_ms = f64::from(self.cfg.duration.us()) / 1000.0;
            let bitrate = (8 * nbytes) as f64 / (dt_ms * 1e-3);
            let c = [[-6i32, 0, 0, 2], [-6, 0, 0, 5]];
            let hr_ind = self.cfg.rate.index() - 5;
            let reg_bits =
                ((bitrate as i32 / 12_500) + c[hr_ind][dt]).clamp(6, 23);

            let m0: f64 = x.iter().map(|&v| f64::from(v.abs())).sum::<f64>() + 1e-5;
            let m1: f64 = x
                .iter()
                .enumerate()
                .map(|(i, &v)| i as f64 * f64::from(v.abs()))
                .sum::<f64>()
                + 1e-5;
            let low_bits = (4.0 / dt_ms) * (2.0 * dt_ms - (m0 / m1).min(2.0 * dt_ms));

            let x_max = x.iter().fold(0f64, |m, &v| m.max(f64::from(v.abs())));
            nf = x_max * (-f64::from(reg_bits) - low_bits).exp2();
        }

        let e: Vec<f64> = (0..x.len() / 4)
            .map(|k| {
                let s: f64 = x[4 * k..4 * k + 4]
                    .iter()
                    .map(|&v| f64::from(v) * f64::from(v))
                    .sum();
                10.0 * (2f64.powi(-31) + s + nf).log10()
            })
            .collect();

        let mut g_idx = 255i32;
        for i in 0..8 {
            let factor = 1 << (7 - i);
            g_idx -= factor;
            let mut tmp = 0f64;
            let mut iszero = true;
            for &ei in e.iter().rev() {
                let g = f64::from(g_idx + g_off);
                if ei * 28.0 / 20.0 < g {
                    if !iszero {
                        tmp += 2.7 * 28.0 / 20.0;
                    }
                } else {
                    if g < (ei - 43.0) * 28.0 / 20.0 {
                        tmp += 2.0 * ei * 28.0 / 20.0 - 2.0 * g - 36.0 * 28.0 / 20.0;
                    } else {
                        tmp += ei * 28.0 / 20.0 - g + 7.0 * 28.0 / 20.0;
                    }
                    iszero = false;
                }
            }
            if tmp > f64::from(nbits) * 1.4 * 28.0 / 20.0 && !iszero {
                g_idx += factor;
            }
        }

        // clamp so the largest coefficient fits the integer range
        let x_max = x.iter().fold(0f64, |m, &v| m.max(f64::from(v.abs())));
        let (g_min, reset_off);
        if x_max > 0.0 {
            let x_lim = if hr {
                f64::from(1u32 << 23)
            } else {
                f64::from(1u32 << 15) - 0.375
            };
            let raw = 28.0 * (x_max / x_lim).log10();
            g_min = raw.ceil() as i32 - g_off;
            reset_off = g_idx < g_min;
        } else {
            g_min = 0;
            reset_off = true;
        }
        if reset_off {
            g_idx = g_min;
        }
        (g_min, g_idx + g_off, reset_off)
    }

    fn quantize(&self, g_int: i32, x: &[f32]) -> (Vec<f32>, Vec<i32>, usize) {
        let hr = self.cfg.rate.is_hr();
        let scale = 10f64.powf(f64::from(g_int) / 28.0);
        let offset = if hr { 0.5 } else { 0.375 };
        let (q_min, q_max) = if hr {
            (-(1i32 << 23), (1i32 << 23) - 1)
        } else {
            (-(1i32 << 15), (1i32 << 15) - 1)
        };

        let xg: Vec<f32> = x.iter().map(|&v| (f64::from(v) / scale) as f32).collect();
        let xq: Vec<i32> = xg
            .iter()
            .map(|&v| {
                let q = if v < 0.0 {
                    (f64::from(v) - offset).ceil()
                } else {
                    (f64::from(v) + offset).floor()
                };
                (q as i32).clamp(q_min, q_max)
            })
            .collect();

        let mut lastnz = 0;
        for n in (0..xq.len()).step_by(2) {
            if xq[n] != 0 || xq[n + 1] != 0 {
                lastnz = n + 2;
            }
        }
        (xg, xq, lastnz)
    }

    fn compute_nbits(
        &mut self,
        nbytes: usize,
        xq: &[i32],
        lastnz: usize,
        nbits_spec: usize,
    ) -> (usize, usize, usize, bool) {
        let sr = self.cfg.rate;
        let mode = sr != SampleRate::Hz96000Hr
            && nbytes >= 20 * (3 + sr.index().min(4));
        let rate = if sr != SampleRate::Hz96000Hr
            && nbytes > 20 * (1 + sr.index().min(4))
        {
            512
        } else {
            0
        };

        let mut nbits_est = 0u64;
        let mut nbits_trunc = 0u64;
        let mut nbits_lsb = 0usize;
        let mut lastnz_trunc = 2usize;
        let mut c = 0usize;

        for n in (0..lastnz).step_by(2) {
            let mut t = c + rate;
            if n > xq.len() / 2 {
                t += 256;
            }

            let mut a = xq[n].unsigned_abs() as usize;
            let mut b = xq[n + 1].unsigned_abs() as usize;
            let mut lev = 0usize;
            while a.max(b) >= 4 {
                nbits_est +=
                    u64::from(SPEC_BITS[SPEC_LOOKUP[t + lev * 1024] as usize][16]);
                if lev == 0 && mode {
                    nbits_lsb += 2;
                } else {
                    nbits_est += 2 * 2048;
                }
                a >>= 1;
                b >>= 1;
                lev = (lev + 1).min(3);
            }
            nbits_est +=
                u64::from(SPEC_BITS[SPEC_LOOKUP[t + lev * 1024] as usize][a + 4 * b]);

            let mut a_lsb = xq[n].unsigned_abs() as usize;
            let mut b_lsb = xq[n + 1].unsigned_abs() as usize;
            nbits_est += ((a_lsb.min(1) + b_lsb.min(1)) * 2048) as u64;
            if lev > 0 && mode {
                a_lsb >>= 1;
                b_lsb >>= 1;
                nbits_lsb += usize::from(a_lsb == 0 && xq[n] != 0);
                nbits_lsb += usize::from(b_lsb == 0 && xq[n + 1] != 0);
            }

            if (xq[n] != 0 || xq[n + 1] != 0) && nbits_est <= (nbits_spec * 2048) as u64 {
                lastnz_trunc = n + 2;
                nbits_trunc = nbits_est;
            }

            let t_next = if lev <= 1 {
                1 + (a + b) * (lev + 1)
            } else {
                12 + lev
            };
            c = (c & 15) * 16 + t_next;
        }

        let nbits_est = (nbits_est as usize).div_ceil(2048) + nbits_lsb;
        let nbits_trunc = (nbits_trunc as usize).div_ceil(2048);

        self.rate = rate;
        self.lsb_mode = mode && nbits_est > nbits_spec;
        (nbits_est, nbits_trunc, lastnz_trunc, self.lsb_mode)
    }

    fn adjust_gain(&self, g_idx: i32, nbits: usize, nbits_spec: usize) -> i32 {
        const T1: [i32; 7] = [80, 230, 380, 530, 680, 680, 830];
        const T2: [i32; 7] = [500, 1025, 1550, 2075, 2600, 2600, 3125];
        const T3: [i32; 7] = [850, 1700, 2550, 3400, 4250, 4250, 5100];

        let sr = self.cfg.rate.index();
        let nbits = nbits as i32;
        let nbits_spec = nbits_spec as i32;

        let delta = if nbits < T1[sr] {
            f64::from(nbits + 48) / 16.0
        } else if nbits < T2[sr] {
            let a = f64::from(T1[sr]) / 16.0 + 3.0;
            let b = f64::from(T2[sr]) / 48.0;
            a + f64::from(nbits - T1[sr]) * (b - a) / f64::from(T2[sr] - T1[sr])
        } else if nbits < T3[sr] {
            f64::from(nbits) / 48.0
        } else {
            f64::from(T3[sr]) / 48.0
        };
        let delta = (delta + 0.5).trunc() as i32;

        if self.cfg.rate.is_hr() {
            if g_idx < 255 && nbits > nbits_spec {
                let dt = self.cfg.duration.index();
                let factor = [3 + i32::from(nbits >= 520), 2, 0, 1][dt];
                let g_incr =
                    (f64::from(factor) * (1.0 + f64::from(nbits - nbits_spec) / f64::from(delta)))
                        as i32;
                return (g_idx + g_incr).min(255) - g_idx;
            }
        } else if (g_idx < 255 && nbits > nbits_spec)
            || (g_idx > 0 && nbits < nbits_spec - (delta + 2))
        {
            if nbits < nbits_spec - (delta + 2) {
                return -1;
            }
            if g_idx == 254 || nbits < nbits_spec + delta {
                return 1;
            }
            return 2;
        }
        0
    }

    fn estimate_noise(&self, bw: usize, xq: &[i32], lastnz: usize, xg: &[f32]) -> usize {
        let i_nf = noise_indices(&self.cfg, bw, xq, lastnz);
        let count = i_nf.iter().filter(|&&f| f).count();
        let l_nf = if count > 0 {
            let sum: f64 = i_nf
                .iter()
                .enumerate()
                .filter(|(_, &f)| f)
                .map(|(k, _)| f64::from(xg[k].abs()))
                .sum();
            sum / count as f64
        } else {
            0.0
        };
        ((8.0 - 16.0 * l_nf).round() as i32).clamp(0, 7) as usize
    }

    /// Quantize one frame's spectrum within the remaining bit budget
    pub fn analyze(
        &mut self,
        bw: usize,
        nbytes: usize,
        nbits_side: usize,
        x: &[f32],
    ) -> SpectrumData {
        let nbits_spec = 8 * nbytes - nbits_side - 8 - 3 - coder_bits(&self.cfg, nbytes);

        // smoothed gain-offset tracking
        let mut nbits_off =
            self.nbits_off + self.nbits_spec as f64 - self.nbits_est as f64;
        nbits_off = nbits_off.clamp(-40.0, 40.0);
        nbits_off = if self.reset_off {
            0.0
        } else {
            0.8 * self.nbits_off + 0.2 * nbits_off
        };

        let g_off = gain_offset(&self.cfg, nbytes);
        let (g_min, g_int, reset_off) = self.estimate_gain(x, nbytes, nbits_spec, nbits_off);
        self.reset_off = reset_off;
        self.nbits_off = nbits_off;
        self.nbits_spec = nbits_spec;

        let (xg, xq, lastnz) = self.quantize(g_int, x);
        let (nbits_est, _, _, _) = self.compute_nbits(nbytes, &xq, lastnz, nbits_spec);
        self.nbits_est = nbits_est;

        // one corrective step from the exact count, then requantize
        let g_adj = self.adjust_gain(g_int - g_off, nbits_est, nbits_spec);
        let g_adj = (g_int + g_adj).max(g_min + g_off) - g_int;

        let (xg, xq, lastnz) = self.quantize(g_adj, &xg);
        let (_, nbits_trunc, lastnz_trunc, lsb_mode) =
            self.compute_nbits(nbytes, &xq, lastnz, nbits_spec);

        let noise_factor = self.estimate_noise(bw, &xq, lastnz, &xg);

        SpectrumData {
            g_idx: g_int + g_adj - g_off,
            lastnz: lastnz_trunc,
            lsb_mode,
            noise_factor,
            rate: self.rate,
            xq,
            xg,
            nbits_residual_max: nbits_spec.saturating_sub(nbits_trunc) + 4,
        }
    }
}

/// Write the spectral side fields
pub fn put_side(data: &SpectrumData, cfg: &FrameConfig, bits: &mut BitWriter) {
    let nbits_lastnz = lastnz_bits(cfg.spectral_lines());
    bits.put_bits((data.lastnz >> 1) as u32 - 1, nbits_lastnz);
    bits.put_bits(u32::from(data.lsb_mode), 1);
    bits.put_bits(data.g_idx as u32, 8);
}

/// Arithmetic-code the quantized pairs, then fill the remaining budget
/// with residual or relocated LSB bits
pub fn encode(data: &SpectrumData, bits: &mut BitWriter) {
    bits.put_bits(data.noise_factor as u32, 3);

    let x = &data.xq;
    let mut lsbs: Vec<u32> = Vec::new();
    let mut c = 0usize;

    for n in (0..data.lastnz).step_by(2) {
        let mut t = c + data.rate;
        if n > x.len() / 2 {
            t += 256;
        }

        let mut a = x[n].unsigned_abs() as usize;
        let mut b = x[n + 1].unsigned_abs() as usize;
        let (mut lsb_0, mut lsb_1) = (0u32, 0u32);
        let mut lev = 0usize;
        while a.max(b) >= 4 {
            bits.put_symbol(&SPEC_MODELS[SPEC_LOOKUP[t + lev * 1024] as usize], 16);
            if lev == 0 && data.lsb_mode {
                lsb_0 = (a & 1) as u32;
                lsb_1 = (b & 1) as u32;
            } else {
                bits.put_bits((a & 1) as u32, 1);
                bits.put_bits((b & 1) as u32, 1);
            }
            a >>= 1;
            b >>= 1;
            lev = (lev + 1).min(3);
        }
        bits.put_symbol(
            &SPEC_MODELS[SPEC_LOOKUP[t + lev * 1024] as usize],
            a + 4 * b,
        );

        let mut a_lsb = x[n].unsigned_abs();
        let mut b_lsb = x[n + 1].unsigned_abs();
        if lev > 0 && data.lsb_mode {
            a_lsb >>= 1;
            b_lsb >>= 1;

            lsbs.push(lsb_0);
            if a_lsb == 0 && x[n] != 0 {
                lsbs.push(u32::from(x[n] < 0));
            }
            lsbs.push(lsb_1);
            if b_lsb == 0 && x[n + 1] != 0 {
                lsbs.push(u32::from(x[n + 1] < 0));
            }
        }
        if a_lsb > 0 {
            bits.put_bits(u32::from(x[n] < 0), 1);
        }
        if b_lsb > 0 {
            bits.put_bits(u32::from(x[n + 1] < 0), 1);
        }

        let t_next = if lev <= 1 {
            1 + (a + b) * (lev + 1)
        } else {
            12 + lev
        };
        c = (c & 15) * 16 + t_next;
    }

    if !data.lsb_mode {
        let mut nbits_residual = bits.bits_left().min(data.nbits_residual_max);
        for i in 0..data.xg.len() {
            if nbits_residual == 0 {
                break;
            }
            if data.xq[i] == 0 {
                continue;
            }
            bits.put_bits(u32::from(data.xg[i] >= data.xq[i] as f32), 1);
            nbits_residual -= 1;
        }
    } else {
        let nbits_residual = bits.bits_left().min(lsbs.len());
        for &lsb in &lsbs[..nbits_residual] {
            bits.put_bits(lsb, 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Decoder-side spectral stage, stateless apart from configuration
pub struct SpectrumSynthesis {
    cfg: FrameConfig,
}

impl SpectrumSynthesis {
    /// Build the synthesis helper for one channel
    pub fn new(cfg: &FrameConfig) -> Self {
        SpectrumSynthesis { cfg: *cfg }
    }

    /// Read and validate the spectral side fields
    pub fn get_side(&self, bits: &mut BitReader<'_>) -> Result<SpectrumSide> {
        let ne = self.cfg.spectral_lines();
        let lastnz = ((bits.get_bits(lastnz_bits(ne)) as usize) + 1) << 1;
        let lsb_mode = bits.get_bits(1) != 0;
        let g_idx = bits.get_bits(8) as i32;
        if lastnz > ne {
            return Err(Lc3Error::invalid_bitstream(
                "invalid count of coded samples",
            ));
        }
        Ok(SpectrumSide {
            lastnz,
            lsb_mode,
            g_idx,
        })
    }

    /// Decode the spectrum and rebuild the real-valued coefficients
    pub fn decode(
        &self,
        bits: &mut BitReader<'_>,
        side: &SpectrumSide,
        bw: usize,
        nbytes: usize,
    ) -> Result<Vec<f32>> {
        let ne = self.cfg.spectral_lines();
        let noise_factor = bits.get_bits(3) as usize;

        let sr = self.cfg.rate;
        let rate = if sr != SampleRate::Hz96000Hr
            && nbytes > 20 * (1 + sr.index().min(4))
        {
            512
        } else {
            0
        };

        let mut xi = vec![0i64; ne];
        let mut levs = vec![0usize; ne];
        let mut c = 0usize;
        // 16-bit magnitudes escape at most 13 times, 24-bit ones 21
        let max_escapes = if self.cfg.rate.is_hr() { 21 } else { 13 };

        for n in (0..side.lastnz).step_by(2) {
            let mut t = c + rate;
            if n > ne / 2 {
                t += 256;
            }

            let mut lev = 0usize;
            let sym = loop {
                let s = t + lev.min(3) * 1024;
                let sym = bits.get_symbol(&SPEC_MODELS[SPEC_LOOKUP[s] as usize])?;
                if sym < 16 {
                    break sym;
                }
                if lev >= max_escapes {
                    return Err(Lc3Error::invalid_bitstream("out of range value"));
                }
                if !side.lsb_mode || lev > 0 {
                    xi[n] += i64::from(bits.get_bits(1)) << lev;
                    xi[n + 1] += i64::from(bits.get_bits(1)) << lev;
                }
                lev += 1;
            };

            let a = sym % 4;
            let b = sym / 4;
            levs[n] = lev;
            levs[n + 1] = lev;
            xi[n] += (a as i64) << lev;
            xi[n + 1] += (b as i64) << lev;

            if xi[n] != 0 && bits.get_bits(1) != 0 {
                xi[n] = -xi[n];
            }
            if xi[n + 1] != 0 && bits.get_bits(1) != 0 {
                xi[n + 1] = -xi[n + 1];
            }

            let lev = lev.min(3);
            let t_next = if lev <= 1 {
                1 + (a + b) * (lev + 1)
            } else {
                12 + lev
            };
            c = (c & 15) * 16 + t_next;
        }

        let mut nbits_residual = bits.bits_left();
        if nbits_residual < 0 {
            return Err(Lc3Error::invalid_bitstream("out of bitstream"));
        }

        let mut xr: Vec<bool> = Vec::new();
        if !side.lsb_mode {
            for n in &xi {
                if nbits_residual <= 0 {
                    break;
                }
                if *n == 0 {
                    xr.push(false);
                    continue;
                }
                xr.push(bits.get_bits(1) != 0);
                nbits_residual -= 1;
            }
        } else {
            for i in 0..ne {
                if nbits_residual <= 0 {
                    break;
                }
                if levs[i] == 0 {
                    continue;
                }
                let lsb = bits.get_bits(1);
                nbits_residual -= 1;
                if lsb == 0 {
                    continue;
                }
                let mut negative = xi[i] < 0;
                if xi[i] == 0 {
                    if nbits_residual <= 0 {
                        break;
                    }
                    negative = bits.get_bits(1) != 0;
                    nbits_residual -= 1;
                }
                xi[i] += if negative { -1 } else { 1 };
            }
        }

        // deterministic comfort-noise seed from the coded magnitudes
        let nf_seed = xi
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &v)| {
                acc.wrapping_add(v.unsigned_abs() as u32 * i as u32)
            })
            & 0xffff;

        let zero_frame = side.lastnz <= 2
            && xi[0] == 0
            && xi[1] == 0
            && side.g_idx <= 0
            && noise_factor >= 7;

        let mut x: Vec<f32> = xi.iter().map(|&v| v as f32).collect();
        if !side.lsb_mode {
            for (i, &up) in xr.iter().enumerate() {
                if xi[i] == 0 {
                    continue;
                }
                if !up {
                    x[i] += if xi[i] < 0 { -0.3125 } else { -0.1875 };
                } else {
                    x[i] += if xi[i] > 0 { 0.3125 } else { 0.1875 };
                }
            }
        }

        if !zero_frame {
            let xq: Vec<i32> = xi.iter().map(|&v| v as i32).collect();
            let i_nf = noise_indices(&self.cfg, bw, &xq, side.lastnz);
            let l_nf = (8 - noise_factor) as f32 / 16.0;
            let mut seed = nf_seed;
            for (k, &fill) in i_nf.iter().enumerate() {
                if fill {
                    seed = (13849 + seed.wrapping_mul(31821)) & 0xffff;
                    x[k] = if seed < 0x8000 { l_nf } else { -l_nf };
                }
            }
        }

        let g_int = gain_offset(&self.cfg, nbytes) + side.g_idx;
        let scale = 10f64.powf(f64::from(g_int) / 28.0) as f32;
        for v in x.iter_mut() {
            *v *= scale;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{BitReader, BitWriter};
    use crate::types::{FrameDuration, SampleRate};
    use proptest::prelude::*;

    fn cfg() -> FrameConfig {
        FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap()
    }

    fn tone_spectrum(ne: usize, scale: f32) -> Vec<f32> {
        (0..ne)
            .map(|i| {
                let env = (-(i as f32) / 60.0).exp();
                ((i * 13 + 5) as f32 * 0.71).sin() * env * scale
            })
            .collect()
    }

    fn run_round_trip(x: &[f32], nbytes: usize, nbits_side: usize) -> Vec<f32> {
        let c = cfg();
        let mut analysis = SpectrumAnalysis::new(&c);
        let data = analysis.analyze(4, nbytes, nbits_side, x);

        let mut w = BitWriter::new(nbytes);
        // reserve the side bits the frame layout would occupy
        w.put_bits(0, nbits_side);
        put_side(&data, &c, &mut w);
        encode(&data, &mut w);
        w.terminate();
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), nbytes);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.get_bits(nbits_side), 0);
        let synthesis = SpectrumSynthesis::new(&c);
        let side = synthesis.get_side(&mut r).unwrap();
        synthesis.decode(&mut r, &side, 4, nbytes).unwrap()
    }

    #[test]
    fn test_round_trip_reduces_to_signal() {
        let c = cfg();
        let ne = c.spectral_lines();
        let x = tone_spectrum(ne, 5000.0);
        let y = run_round_trip(&x, 80, 30);

        // correlation between input and output spectra stays high
        let xx: f64 = x.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        let yy: f64 = y.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        let xy: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum();
        assert!(xy / (xx * yy).sqrt() > 0.9);
    }

    #[test]
    fn test_silence_round_trip() {
        let c = cfg();
        let ne = c.spectral_lines();
        let x = vec![0f32; ne];
        let y = run_round_trip(&x, 40, 30);
        assert!(y.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_gain_offset_law() {
        let c = cfg();
        assert_eq!(gain_offset(&c, 40), -((40 * 8 / 20).min(115)) - 115);
        let hr =
            FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz96000Hr).unwrap();
        assert!(gain_offset(&hr, 20) >= -181);
    }

    #[test]
    fn test_quantize_clamps_without_overflow() {
        let c = cfg();
        let analysis = SpectrumAnalysis::new(&c);
        let x = vec![1e9f32; c.spectral_lines()];
        let (_, xq, lastnz) = analysis.quantize(0, &x);
        assert!(xq.iter().all(|&v| v <= (1 << 15) - 1));
        assert_eq!(lastnz, c.spectral_lines());
    }

    #[test]
    fn test_gain_estimate_respects_clamp() {
        let c = cfg();
        let analysis = SpectrumAnalysis::new(&c);
        let x = vec![1e9f32; c.spectral_lines()];
        let (g_min, g_int, _) = analysis.estimate_gain(&x, 80, 500, 0.0);
        let g_off = gain_offset(&c, 80);
        assert!(g_int - g_off >= g_min);
        // quantizing at the clamped gain must not exceed the range
        let (_, xq, _) = analysis.quantize(g_int, &x);
        assert!(xq.iter().all(|&v| v.unsigned_abs() < (1 << 15)));
    }

    #[test]
    fn test_byte_budget_exact() {
        let c = cfg();
        for nbytes in [20usize, 40, 80, 150] {
            let x = tone_spectrum(c.spectral_lines(), 3000.0);
            let mut analysis = SpectrumAnalysis::new(&c);
            let data = analysis.analyze(4, nbytes, 30, &x);
            let mut w = BitWriter::new(nbytes);
            w.put_bits(0, 30);
            put_side(&data, &c, &mut w);
            encode(&data, &mut w);
            w.terminate();
            assert_eq!(w.into_bytes().len(), nbytes);
        }
    }

    #[test]
    fn test_decoder_rejects_bad_lastnz() {
        let c = cfg();
        let ne = c.spectral_lines();
        let mut w = BitWriter::new(20);
        // largest encodable value exceeds ne when ne is not a power of two
        w.put_bits((ne / 2) as u32, lastnz_bits(ne));
        w.put_bits(0, 9);
        w.terminate();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        let synthesis = SpectrumSynthesis::new(&c);
        assert!(synthesis.get_side(&mut r).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_round_trip_within_budget(seed in 0u64..1000, nbytes in 30usize..120) {
            let c = cfg();
            let ne = c.spectral_lines();
            let mut s = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
            let x: Vec<f32> = (0..ne).map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
                ((s >> 40) as f32 - 8_388_608.0) / 1000.0
            }).collect();
            let y = run_round_trip(&x, nbytes, 30);
            prop_assert_eq!(y.len(), ne);
            prop_assert!(y.iter().all(|v| v.is_finite()));
        }
    }
}
