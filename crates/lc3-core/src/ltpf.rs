//! Long-term postfilter
//!
//! The encoder tracks the pitch of the input on a 12.8 kHz internal grid
//! and signals lag plus an activation flag. The decoder applies a gentle
//! comb filter locked to that lag, cross-fading over the first
//! `rate / 400` samples whenever the active state or the filter changes.

use crate::tables::{LTPF_FILTERS, LTPF_H12K8, LTPF_H4, LTPF_HI};
use crate::types::{FrameConfig, FrameDuration};

/// Per-frame pitch side data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtpfData {
    /// Pitch found with enough correlation to encode a lag
    pub pitch_present: bool,
    /// Filter requested on the decoder side
    pub active: bool,
    /// Lag, quarter-sample resolution packed into 9 bits
    pub pitch_index: usize,
}

impl LtpfData {
    /// Side-bit cost: presence bit plus active flag and lag when coded
    pub fn nbits(&self) -> usize {
        if self.pitch_present {
            11
        } else {
            1
        }
    }

    /// Inactive side data, used when no payload is available
    pub fn off() -> Self {
        LtpfData {
            pitch_present: false,
            active: false,
            pitch_index: 0,
        }
    }
}

/// Write the activation flag and lag index, present frames only
pub fn write(data: &LtpfData, bits: &mut crate::bits::BitWriter) {
    if data.pitch_present {
        bits.put_bits(u32::from(data.active), 1);
        bits.put_bits(data.pitch_index as u32, 9);
    }
}

/// Read the pitch side data given the presence flag
pub fn read(pitch_present: bool, bits: &mut crate::bits::BitReader<'_>) -> LtpfData {
    if !pitch_present {
        return LtpfData::off();
    }
    let active = bits.get_bits(1) != 0;
    let pitch_index = bits.get_bits(9) as usize;
    LtpfData {
        pitch_present,
        active,
        pitch_index,
    }
}

fn resampler_delay(duration: FrameDuration) -> usize {
    match duration {
        FrameDuration::Ms7_5 => 44,
        _ => 24,
    }
}

const HIST_12K8: usize = 232;
const HIST_6K4: usize = 114;
const MIN_LAG_6K4: usize = 17;
const MAX_LAG_6K4: usize = 114;

fn h12k8(idx: isize) -> f64 {
    if (0..239).contains(&idx) {
        LTPF_H12K8[idx as usize]
    } else {
        0.0
    }
}

fn h4(t: isize) -> f64 {
    if t.unsigned_abs() <= 15 {
        LTPF_H4[(t + 15) as usize]
    } else {
        0.0
    }
}

fn hi(t: isize) -> f64 {
    if t.unsigned_abs() <= 7 {
        LTPF_HI[(t + 7) as usize]
    } else {
        0.0
    }
}

/// Encoder-side pitch tracker
pub struct LtpfAnalysis {
    p: usize,
    w: usize,
    n: usize,
    half_scale: bool,
    in_buf: Vec<f64>,
    ur_hist: [f64; 2],
    hp_hist: [f64; 2],
    buf_12k8: Vec<f64>,
    buf_6k4: Vec<f64>,
    active: bool,
    tc: usize,
    pitch: f64,
    nc: [f64; 2],
}

impl LtpfAnalysis {
    /// Build the tracker for one channel
    pub fn new(cfg: &FrameConfig) -> Self {
        let khz = cfg.rate.khz() as usize;
        let p = 192 / khz;
        let w = 240 / p;
        let n = 128 * cfg.duration.us() as usize / 10_000;
        let d = resampler_delay(cfg.duration);
        LtpfAnalysis {
            p,
            w,
            n,
            half_scale: khz == 8,
            in_buf: vec![0.0; w + cfg.frame_samples()],
            ur_hist: [0.0; 2],
            hp_hist: [0.0; 2],
            buf_12k8: vec![0.0; HIST_12K8 + d + n],
            buf_6k4: vec![0.0; HIST_6K4 + n / 2],
            active: false,
            tc: 0,
            pitch: 0.0,
            nc: [0.0; 2],
        }
    }

    /// Clear all history buffers
    pub fn reset(&mut self) {
        self.in_buf.fill(0.0);
        self.ur_hist = [0.0; 2];
        self.hp_hist = [0.0; 2];
        self.buf_12k8.fill(0.0);
        self.buf_6k4.fill(0.0);
        self.active = false;
        self.tc = 0;
        self.pitch = 0.0;
        self.nc = [0.0; 2];
    }

    /// Clear the activation request, keeping the coded lag intact
    pub fn disable(&mut self, data: &mut LtpfData) {
        self.active = false;
        data.active = false;
    }

    fn resample(&mut self, x: &[f32]) {
        let (p, w, n) = (self.p, self.w, self.n);
        let ns = x.len();

        let keep = self.in_buf.len() - ns;
        self.in_buf.copy_within(ns.., 0);
        for (dst, &src) in self.in_buf[keep..].iter_mut().zip(x.iter()) {
            *dst = f64::from(src);
        }

        // polyphase resampling to 12.8 kHz on the 15/p grid
        let shift = n;
        self.buf_12k8.copy_within(shift.., 0);
        let base = self.buf_12k8.len() - n;
        for i in 0..n {
            let e = (15 * i) / p;
            let f = (15 * i) % p;
            let mut acc = 0f64;
            for j in 0..=w {
                acc += self.in_buf[e + j] * h12k8((j * p) as isize - f as isize - 1);
            }
            let mut ur = p as f64 * acc;
            if self.half_scale {
                ur *= 0.5;
            }

            // 50 Hz high-pass
            let b = [0.982_794_708_297_877_1, -1.965_589_416_595_754, 0.982_794_708_297_877_1];
            let a = [-1.965_293_372_622_690_4, 0.965_885_460_568_817_7];
            let y = b[0] * ur + b[1] * self.ur_hist[0] + b[2] * self.ur_hist[1]
                - a[0] * self.hp_hist[0]
                - a[1] * self.hp_hist[1];
            self.ur_hist = [ur, self.ur_hist[0]];
            self.hp_hist = [y, self.hp_hist[0]];
            self.buf_12k8[base + i] = y;
        }

        // 2:1 decimation to 6.4 kHz with a fixed 5-tap lowpass
        let h = [
            0.123_679_641_118_053_7,
            0.235_351_212_836_488_9,
            0.281_938_292_090_914_8,
            0.235_351_212_836_488_9,
            0.123_679_641_118_053_7,
        ];
        let n64 = n / 2;
        self.buf_6k4.copy_within(n64.., 0);
        let base6 = self.buf_6k4.len() - n64;
        for i in 0..n64 {
            let mut acc = 0f64;
            for (j, &hj) in h.iter().enumerate() {
                let t = 2 * i as isize + j as isize - 3;
                acc += self.win_12k8(t) * hj;
            }
            self.buf_6k4[base6 + i] = acc;
        }
    }

    // analysis-aligned 12.8 kHz sample, negative t reaches into history
    fn win_12k8(&self, t: isize) -> f64 {
        self.buf_12k8[(HIST_12K8 as isize + t) as usize]
    }

    fn win_6k4(&self, t: isize) -> f64 {
        self.buf_6k4[(HIST_6K4 as isize + t) as usize]
    }

    fn corr_6k4(&self, n: usize, k: usize) -> f64 {
        (0..n)
            .map(|i| self.win_6k4(i as isize) * self.win_6k4(i as isize - k as isize))
            .sum()
    }

    fn norm_corr_6k4(&self, n: usize, k: usize) -> f64 {
        let uv = self.corr_6k4(n, k);
        if uv <= 0.0 {
            return 0.0;
        }
        let uu: f64 = (0..n).map(|i| self.win_6k4(i as isize).powi(2)).sum();
        let vv: f64 = (0..n)
            .map(|i| self.win_6k4(i as isize - k as isize).powi(2))
            .sum();
        uv / (uu * vv).sqrt()
    }

    fn corr_12k8(&self, n: usize, k: isize) -> f64 {
        (0..n)
            .map(|i| self.win_12k8(i as isize) * self.win_12k8(i as isize - k))
            .sum()
    }

    /// Track the pitch over one frame and emit side data
    pub fn run(&mut self, x: &[f32]) -> LtpfData {
        self.resample(x);

        let n64 = self.n / 2;
        let nlags = MAX_LAG_6K4 - MIN_LAG_6K4 + 1;

        // coarse search at 6.4 kHz, weighted toward short lags, with a
        // secondary window around the previous frame's lag
        let r: Vec<f64> = (MIN_LAG_6K4..=MAX_LAG_6K4)
            .map(|k| self.corr_6k4(n64, k))
            .collect();
        let argmax = |v: &[f64]| {
            v.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0)
        };

        let rw: Vec<f64> = r
            .iter()
            .enumerate()
            .map(|(i, &v)| v * (1.0 - 0.5 * i as f64 / (nlags - 1) as f64))
            .collect();
        let k0 = self.tc.saturating_sub(4);
        let k1 = (self.tc + 4).min(nlags - 1);
        let t_global = MIN_LAG_6K4 + argmax(&rw);
        let t_near = MIN_LAG_6K4 + k0 + argmax(&r[k0..=k1]);

        let nc_pair = [
            self.norm_corr_6k4(n64, t_global),
            self.norm_corr_6k4(n64, t_near),
        ];
        let ti = usize::from(nc_pair[1] > 0.85 * nc_pair[0]);
        let t_curr = [t_global, t_near][ti];
        self.tc = t_curr - MIN_LAG_6K4;

        let pitch_present = nc_pair[ti] > 0.6;

        let (mut e, mut f) = (0isize, 0isize);
        let pitch_index;
        if pitch_present {
            // refine at 12.8 kHz around twice the coarse lag
            let n = self.n;
            let k0 = (2 * t_curr as isize - 4).max(32);
            let k1 = (2 * t_curr as isize + 4).min(228);
            let r12: Vec<f64> = (k0 - 4..=k1 + 4).map(|k| self.corr_12k8(n, k)).collect();
            e = k0 + argmax(&r12[4..r12.len() - 4]) as isize;

            // quarter-sample interpolation of the correlation peak
            let s: Vec<f64> = (-3..=3)
                .map(|d| {
                    (-4isize..=4)
                        .map(|m| r12[(e - k0 + 4 + m) as usize] * h4(4 * m - d))
                        .sum()
                })
                .collect();
            f = if e <= 32 {
                argmax(&s[3..]) as isize
            } else if e < 127 {
                -3 + argmax(&s) as isize
            } else if e < 157 {
                -2 + 2 * argmax(&[s[1], s[3], s[5]]) as isize
            } else {
                0
            };
            if f < 0 {
                e -= 1;
                f += 4;
            }

            let idx = if e < 127 {
                4 * e + f - 128
            } else if e < 157 {
                2 * e + f / 2 + 126
            } else {
                e + 283
            };
            pitch_index = idx as usize;
        } else {
            pitch_index = 0;
        }

        // activation hysteresis on the quarter-sample normalized correlation
        let mut nc = 0f64;
        if pitch_present {
            let n = self.n;
            let uv: f64 = (0..n)
                .map(|i| self.win_12k8(i as isize) * self.interp_12k8(i as isize - e, f))
                .sum();
            let uu: f64 = (0..n).map(|i| self.win_12k8(i as isize).powi(2)).sum();
            let vv: f64 = (0..n)
                .map(|i| self.interp_12k8(i as isize - e, f).powi(2))
                .sum();
            nc = uv.max(0.0) / (uu * vv).sqrt();
        }

        let pitch = e as f64 + f as f64 / 4.0;
        let mut active = if !self.active {
            (self.n == 128 || self.nc[1] > 0.94) && self.nc[0] > 0.94 && nc > 0.94
        } else {
            let dp = (pitch - self.pitch).abs();
            let dc = nc - self.nc[0];
            nc > 0.9 || (dp < 2.0 && dc > -0.1 && nc > 0.84)
        };

        let (pitch, nc) = if pitch_present {
            (pitch, nc)
        } else {
            active = false;
            (0.0, 0.0)
        };

        self.active = active;
        self.pitch = pitch;
        self.nc = [nc, self.nc[0]];

        LtpfData {
            pitch_present,
            active,
            pitch_index,
        }
    }

    fn interp_12k8(&self, i: isize, f: isize) -> f64 {
        (-2isize..=2)
            .map(|k| self.win_12k8(i - k) * hi(4 * k - f))
            .sum()
    }
}

/// Decoder-side comb filter
pub struct LtpfSynthesis {
    sr: usize,
    khz: usize,
    ns: usize,
    active: [bool; 2],
    p_e: [isize; 2],
    p_f: [usize; 2],
    c_n: [Vec<f32>; 2],
    c_d: [Vec<f32>; 2],
    x_hist: Vec<f32>,
    y_hist: Vec<f32>,
}

impl LtpfSynthesis {
    /// Build the filter for one channel
    pub fn new(cfg: &FrameConfig) -> Self {
        let sr = cfg.rate.index().min(4);
        let khz = [8usize, 16, 24, 32, 48][sr];
        let ns = cfg.frame_samples();
        let max_pitch = (228 * khz * 10).div_ceil(128);
        let l_d = LTPF_FILTERS[sr].den[0].len();
        LtpfSynthesis {
            sr,
            khz,
            ns,
            active: [false; 2],
            p_e: [0; 2],
            p_f: [0; 2],
            c_n: [Vec::new(), Vec::new()],
            c_d: [Vec::new(), Vec::new()],
            x_hist: vec![0.0; ns],
            y_hist: vec![0.0; max_pitch + l_d],
        }
    }

    /// Clear filter memories and the previous frame's parameters
    pub fn reset(&mut self) {
        self.active = [false; 2];
        self.p_e = [0; 2];
        self.p_f = [0; 2];
        self.c_n = [Vec::new(), Vec::new()];
        self.c_d = [Vec::new(), Vec::new()];
        self.x_hist.fill(0.0);
        self.y_hist.fill(0.0);
    }

    /// Filter one frame in place
    pub fn run(&mut self, data: &LtpfData, nbytes: usize, dt_us: u32, x: &mut [f32]) {
        let active = data.pitch_present && data.active;
        let pitch_index = if data.pitch_present { data.pitch_index } else { 0 };

        // lag and gain tier
        let (p_e, p_f);
        if pitch_index >= 440 {
            p_e = pitch_index as isize - 283;
            p_f = 0;
        } else if pitch_index >= 380 {
            let e = pitch_index / 2 - 63;
            p_e = e as isize;
            p_f = 2 * (pitch_index - 2 * (e + 63));
        } else {
            let e = pitch_index / 4 + 32;
            p_e = e as isize;
            p_f = pitch_index - 4 * (e - 32);
        }
        let p = (p_e as f64 + p_f as f64 / 4.0) * self.khz as f64 / 12.8;
        let p4 = (p * 4.0 + 0.5) as isize;
        self.p_e[0] = p4 / 4;
        self.p_f[0] = (p4 % 4) as usize;

        let nbits = (nbytes * 80 * 10_000 / dt_us as usize + 5) / 10;
        let g_idx = (nbits / 80).max(3 + self.sr) - (3 + self.sr);
        let g = if g_idx < 4 {
            [0.4f32, 0.35, 0.3, 0.25][g_idx]
        } else {
            0.0
        };
        let g_idx = g_idx.min(3);

        let filters = &LTPF_FILTERS[self.sr];
        self.c_n[0] = filters.num[g_idx].iter().map(|&v| 0.85 * g * v).collect();
        self.c_d[0] = filters.den[self.p_f[0]].iter().map(|&v| g * v).collect();
        self.active[0] = active;

        let ns = self.ns;
        let n0 = self.khz * 1000 / 400;
        let hist = self.y_hist.len();
        let l_d = self.c_d[0].len();
        let d = [
            self.p_e[0] - (l_d as isize - 1) / 2,
            self.p_e[1] - (l_d as isize - 1) / 2,
        ];

        // frame-extended views: index k in -hist..ns
        let mut y = vec![0f32; hist + ns];
        y[..hist].copy_from_slice(&self.y_hist);
        let mut yc = y.clone();

        let xin = |k: isize, xs: &[f32]| -> f32 {
            if k >= 0 {
                xs[k as usize]
            } else {
                self.x_hist[(ns as isize + k) as usize]
            }
        };
        let comb = |c_n: &[f32], c_d: &[f32], d: isize, k: isize, xs: &dyn Fn(isize) -> f32, ys: &[f32]| -> f32 {
            let num: f32 = c_n
                .iter()
                .enumerate()
                .map(|(j, &c)| c * xs(k - j as isize))
                .sum();
            let den: f32 = c_d
                .iter()
                .enumerate()
                .map(|(j, &c)| c * ys[(hist as isize + k - d - j as isize) as usize])
                .sum();
            num - den
        };

        for k in 0..ns as isize {
            let fade = k < n0 as isize;
            let a0 = self.active[0];
            let a1 = self.active[1];
            let xk = xin(k, x);
            let yk;
            if !a0 && !a1 {
                yk = xk;
            } else if !fade && !a0 {
                yk = xk;
            } else if !fade {
                let u = comb(&self.c_n[0], &self.c_d[0], d[0], k, &|t| xin(t, x), &y);
                yk = xk - u;
            } else if a0 && !a1 {
                let u = comb(&self.c_n[0], &self.c_d[0], d[0], k, &|t| xin(t, x), &y);
                yk = xk - (k as f32 / n0 as f32) * u;
            } else if !a0 && a1 {
                let u = comb(&self.c_n[1], &self.c_d[1], d[1], k, &|t| xin(t, x), &y);
                yk = xk - (1.0 - k as f32 / n0 as f32) * u;
            } else if self.p_e[0] == self.p_e[1] && self.p_f[0] == self.p_f[1] {
                let u = comb(&self.c_n[0], &self.c_d[0], d[0], k, &|t| xin(t, x), &y);
                yk = xk - u;
            } else {
                // two-stage cross-fade between the previous and new filter
                let u = comb(&self.c_n[1], &self.c_d[1], d[1], k, &|t| xin(t, x), &y);
                let ck = xk - (1.0 - k as f32 / n0 as f32) * u;
                yc[hist + k as usize] = ck;
                let u = comb(
                    &self.c_n[0],
                    &self.c_d[0],
                    d[0],
                    k,
                    &|t| {
                        let idx = hist as isize + t;
                        yc[idx as usize]
                    },
                    &y,
                );
                yk = ck - (k as f32 / n0 as f32) * u;
            }
            y[hist + k as usize] = yk;
        }

        // slide state
        self.active[1] = self.active[0];
        self.p_e[1] = self.p_e[0];
        self.p_f[1] = self.p_f[0];
        self.c_n[1] = std::mem::take(&mut self.c_n[0]);
        self.c_d[1] = std::mem::take(&mut self.c_d[0]);
        self.x_hist.copy_from_slice(x);
        self.y_hist.copy_from_slice(&y[ns..]);
        x.copy_from_slice(&y[hist..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameConfig, SampleRate};

    fn cfg(rate: SampleRate) -> FrameConfig {
        FrameConfig::mono(FrameDuration::Ms10, rate).unwrap()
    }

    fn periodic_frame(ns: usize, period: f32, phase0: usize) -> Vec<f32> {
        (0..ns)
            .map(|i| {
                let t = (i + phase0) as f32;
                (2.0 * std::f32::consts::PI * t / period).sin() * 10_000.0
                    + (4.0 * std::f32::consts::PI * t / period).sin() * 3_000.0
            })
            .collect()
    }

    #[test]
    fn test_pitch_detected_on_periodic_signal() {
        let c = cfg(SampleRate::Hz16000);
        let ns = c.frame_samples();
        let mut a = LtpfAnalysis::new(&c);

        // 200 Hz at 16 kHz, period 80 samples, lag 64 at 12.8 kHz
        let mut present = false;
        for frame in 0..8 {
            let x = periodic_frame(ns, 80.0, frame * ns);
            let data = a.run(&x);
            if frame >= 4 {
                present = present || data.pitch_present;
            }
        }
        assert!(present);
    }

    #[test]
    fn test_no_pitch_on_noise() {
        let c = cfg(SampleRate::Hz16000);
        let ns = c.frame_samples();
        let mut a = LtpfAnalysis::new(&c);
        let mut state = 0x12345u32;
        for _ in 0..6 {
            let x: Vec<f32> = (0..ns)
                .map(|_| {
                    state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                    (state >> 16) as f32 - 32768.0
                })
                .collect();
            let data = a.run(&x);
            assert!(!data.active);
        }
    }

    #[test]
    fn test_pitch_index_ranges() {
        // every coded lag stays within the 9-bit field
        let c = cfg(SampleRate::Hz48000);
        let ns = c.frame_samples();
        let mut a = LtpfAnalysis::new(&c);
        for (fi, period) in [40.0f32, 90.0, 200.0, 600.0].iter().enumerate() {
            for frame in 0..6 {
                let x = periodic_frame(ns, *period, (fi * 6 + frame) * ns);
                let data = a.run(&x);
                assert!(data.pitch_index < 512);
            }
        }
    }

    #[test]
    fn test_synthesis_passthrough_when_inactive() {
        let c = cfg(SampleRate::Hz16000);
        let ns = c.frame_samples();
        let mut s = LtpfSynthesis::new(&c);
        let data = LtpfData {
            pitch_present: false,
            active: false,
            pitch_index: 0,
        };
        let original = periodic_frame(ns, 50.0, 0);
        let mut x = original.clone();
        s.run(&data, 40, c.duration.us(), &mut x);
        assert_eq!(x, original);
    }

    #[test]
    fn test_synthesis_blends_on_activation() {
        let c = cfg(SampleRate::Hz16000);
        let ns = c.frame_samples();
        let mut s = LtpfSynthesis::new(&c);

        let off = LtpfData { pitch_present: false, active: false, pitch_index: 0 };
        let on = LtpfData { pitch_present: true, active: true, pitch_index: 128 };

        let mut x0 = periodic_frame(ns, 80.0, 0);
        s.run(&off, 40, c.duration.us(), &mut x0);

        let mut x1 = periodic_frame(ns, 80.0, ns);
        let clean = x1.clone();
        s.run(&on, 40, c.duration.us(), &mut x1);

        // the fade leaves the first sample untouched and alters the tail
        assert!((x1[0] - clean[0]).abs() < 1e-3);
        assert!(x1[ns - 1] != clean[ns - 1]);
    }

    #[test]
    fn test_synthesis_handles_all_index_ranges() {
        let c = cfg(SampleRate::Hz48000);
        let ns = c.frame_samples();
        for idx in [0usize, 127, 379, 380, 439, 440, 511] {
            let mut s = LtpfSynthesis::new(&c);
            let data = LtpfData { pitch_present: true, active: true, pitch_index: idx };
            let mut x = periodic_frame(ns, 100.0, 0);
            s.run(&data, 120, c.duration.us(), &mut x);
            assert!(x.iter().all(|v| v.is_finite()));
        }
    }
}
