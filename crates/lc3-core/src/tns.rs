//! Temporal noise shaping
//!
//! An LPC lattice filter applied over the shaped spectrum flattens its
//! temporal envelope so quantization noise stays under the signal's own
//! attack structure. One or two frequency regions are filtered depending
//! on bandwidth and frame duration, with filter state shared within the
//! frame only.

use crate::bits::{BitReader, BitWriter};
use crate::error::Result;
use crate::tables::{ac_model_bits, bandwidth_stop, TNS_COEF_MODELS, TNS_ORDER_MODELS};
use crate::types::{FrameConfig, FrameDuration};

const MAX_ORDER: usize = 8;
const PRED_GAIN_THRESHOLD: f64 = 1.5;

/// Per-frame filter side data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TnsData {
    /// Number of filtered regions (1 or 2)
    pub nfilters: usize,
    /// Coefficient re-weighting active at low bitrates
    pub lpc_weighting: bool,
    /// Filter order per region, 0 disables the region
    pub order: [usize; 2],
    /// Quantized reflection coefficient indices, 8 centered at zero
    pub rc_i: [[usize; MAX_ORDER]; 2],
}

impl TnsData {
    /// Side-bit cost of the coded filter data, in whole bits
    pub fn nbits(&self) -> usize {
        let mut total = 0usize;
        for f in 0..self.nfilters {
            let mut b = 2048u32;
            if self.order[f] > 0 {
                b += ac_model_bits(
                    &TNS_ORDER_MODELS[usize::from(self.lpc_weighting)],
                    self.order[f] - 1,
                );
                for k in 0..self.order[f] {
                    b += ac_model_bits(&TNS_COEF_MODELS[k], self.rc_i[f][k]);
                }
            }
            total += b.div_ceil(2048) as usize;
        }
        total
    }

    fn rc(&self, f: usize, k: usize) -> f32 {
        let step = std::f64::consts::PI / 17.0;
        (step * (self.rc_i[f][k] as f64 - 8.0)).sin() as f32
    }
}

fn lpc_weighting(cfg: &FrameConfig, nbytes: usize) -> bool {
    // engages below 48 kbit/s
    nbytes * 8 < 48 * cfg.duration.us() as usize / 1000
}

/// Region layout: (filter count, start bins, stop bins)
fn regions(cfg: &FrameConfig, bw: usize) -> (usize, [usize; 2], [usize; 2]) {
    let stop_total = bandwidth_stop(cfg, bw);
    let start0 = match cfg.duration {
        FrameDuration::Ms2_5 => 3,
        FrameDuration::Ms5 => 6,
        FrameDuration::Ms7_5 => 9,
        FrameDuration::Ms10 => 12,
    };
    let two = cfg.duration >= FrameDuration::Ms7_5 && (bw >= 3 || cfg.rate.is_hr());
    if two {
        (2, [start0, stop_total / 2], [stop_total / 2, stop_total])
    } else {
        (1, [start0, 0], [stop_total, 0])
    }
}

fn sub_bounds(start: usize, stop: usize) -> [usize; 4] {
    [
        start,
        start + (stop - start) / 3,
        start + 2 * (stop - start) / 3,
        stop,
    ]
}

fn quantize_rc_index(rc: f64) -> usize {
    let step = std::f64::consts::PI / 17.0;
    let v = rc.clamp(-1.0, 1.0).asin() / step;
    let r = if v >= 0.0 {
        (v + 0.5) as isize
    } else {
        -((-v + 0.5) as isize)
    };
    (r + 8).clamp(0, 16) as usize
}

/// Estimate and apply the noise-shaping filters over the spectrum
pub fn analyze(
    cfg: &FrameConfig,
    bw: usize,
    near_nyquist: bool,
    nbytes: usize,
    spectrum: &mut [f32],
) -> TnsData {
    let (nfilters, starts, stops) = regions(cfg, bw);
    let weighting = lpc_weighting(cfg, nbytes);

    let mut data = TnsData {
        nfilters,
        lpc_weighting: weighting,
        order: [0; 2],
        rc_i: [[8; MAX_ORDER]; 2],
    };

    let lag_factor = -0.5 * (0.02 * std::f64::consts::PI).powi(2);
    let mut rc_q = [[0f64; MAX_ORDER]; 2];

    for f in 0..nfilters {
        let sub = sub_bounds(starts[f], stops[f]);

        // lag-windowed normalized autocorrelation over three subdivisions
        let mut rw = [0f64; MAX_ORDER + 1];
        let mut zero_energy = false;
        for (k, r) in rw.iter_mut().enumerate() {
            let mut rk = 0f64;
            for s in 0..3 {
                let (lo, hi) = (sub[s], sub[s + 1]);
                let es: f64 = spectrum[lo..hi].iter().map(|&v| (v as f64).powi(2)).sum();
                if es == 0.0 {
                    zero_energy = true;
                    break;
                }
                let ac: f64 = (lo..hi.saturating_sub(k))
                    .map(|n| spectrum[n] as f64 * spectrum[n + k] as f64)
                    .sum();
                rk += ac / es;
            }
            *r = if zero_energy {
                if k == 0 { 3.0 } else { 0.0 }
            } else {
                rk
            } * (lag_factor * (k * k) as f64).exp();
        }

        // Levinson-Durbin
        let mut a = [0f64; MAX_ORDER + 1];
        let mut a_last = [0f64; MAX_ORDER + 1];
        let mut err = rw[0];
        a[0] = 1.0;
        for k in 1..=MAX_ORDER {
            std::mem::swap(&mut a, &mut a_last);
            let mut rc = 0f64;
            for n in 0..k {
                rc -= a_last[n] * rw[k - n];
            }
            if err == 0.0 {
                err = 1.0;
            }
            rc /= err;
            a[0] = 1.0;
            for n in 1..k {
                a[n] = a_last[n] + rc * a_last[k - n];
            }
            a[k] = rc;
            err *= 1.0 - rc * rc;
        }
        let pred_gain = rw[0] / err;

        if pred_gain <= PRED_GAIN_THRESHOLD || near_nyquist {
            continue;
        }

        // bandwidth expansion at low bitrates and marginal gains
        let mut gamma = 1.0f64;
        if weighting && pred_gain < 2.0 {
            gamma -= 0.15 * (2.0 - pred_gain) / (2.0 - PRED_GAIN_THRESHOLD);
        }
        let mut g = 1.0f64;
        for v in a.iter_mut() {
            *v *= g;
            g *= gamma;
        }

        // step-down to reflection coefficients
        let mut rc = [0f64; MAX_ORDER];
        let mut a_k = a;
        for k in (1..=MAX_ORDER).rev() {
            rc[k - 1] = a_k[k];
            let e = 1.0 - rc[k - 1] * rc[k - 1];
            let mut a_km1 = [0f64; MAX_ORDER + 1];
            a_km1[0] = 1.0;
            for n in 1..k {
                a_km1[n] = (a_k[n] - rc[k - 1] * a_k[k - n]) / e;
            }
            a_k = a_km1;
        }

        for k in 0..MAX_ORDER {
            data.rc_i[f][k] = quantize_rc_index(rc[k]);
        }
        let mut order = MAX_ORDER;
        while order > 0 && data.rc_i[f][order - 1] == 8 {
            order -= 1;
        }
        data.order[f] = order;
        for k in 0..order {
            rc_q[f][k] = f64::from(data.rc(f, k));
        }
    }

    // forward lattice, state shared across regions within the frame
    let mut st = [0f32; MAX_ORDER];
    for f in 0..nfilters {
        let order = data.order[f];
        if order == 0 {
            continue;
        }
        for n in starts[f]..stops[f] {
            let mut t = spectrum[n];
            let mut st_save = t;
            for k in 0..order - 1 {
                let rc = rc_q[f][k] as f32;
                let st_tmp = rc * t + st[k];
                t += rc * st[k];
                st[k] = st_save;
                st_save = st_tmp;
            }
            t += rc_q[f][order - 1] as f32 * st[order - 1];
            st[order - 1] = st_save;
            spectrum[n] = t;
        }
    }
    data
}

/// Invert the noise-shaping filters on the decoded spectrum
pub fn synthesize(cfg: &FrameConfig, bw: usize, data: &TnsData, spectrum: &mut [f32]) {
    let (nfilters, starts, stops) = regions(cfg, bw);
    let mut st = [0f32; MAX_ORDER];
    for f in 0..nfilters.min(data.nfilters) {
        let order = data.order[f];
        if order == 0 {
            continue;
        }
        let rc: Vec<f32> = (0..order).map(|k| data.rc(f, k)).collect();
        for n in starts[f]..stops[f] {
            let mut t = spectrum[n] - rc[order - 1] * st[order - 1];
            for k in (0..order - 1).rev() {
                t -= rc[k] * st[k];
                st[k + 1] = rc[k] * t + st[k];
            }
            st[0] = t;
            spectrum[n] = t;
        }
    }
}

/// Write filter presence, order and coefficients
pub fn write(data: &TnsData, bits: &mut BitWriter) {
    for f in 0..data.nfilters {
        let order = data.order[f];
        bits.put_bits(u32::from(order > 0), 1);
        if order == 0 {
            continue;
        }
        bits.put_symbol(
            &TNS_ORDER_MODELS[usize::from(data.lpc_weighting)],
            order - 1,
        );
        for k in 0..order {
            bits.put_symbol(&TNS_COEF_MODELS[k], data.rc_i[f][k]);
        }
    }
}

/// Read the filter side data matching the encoder's layout
pub fn read(
    bits: &mut BitReader<'_>,
    cfg: &FrameConfig,
    bw: usize,
    nbytes: usize,
) -> Result<TnsData> {
    let (nfilters, _, _) = regions(cfg, bw);
    let weighting = lpc_weighting(cfg, nbytes);
    let mut data = TnsData {
        nfilters,
        lpc_weighting: weighting,
        order: [0; 2],
        rc_i: [[8; MAX_ORDER]; 2],
    };
    for f in 0..nfilters {
        if bits.get_bits(1) == 0 {
            continue;
        }
        let order = bits.get_symbol(&TNS_ORDER_MODELS[usize::from(weighting)])? + 1;
        data.order[f] = order;
        for k in 0..order {
            data.rc_i[f][k] = bits.get_symbol(&TNS_COEF_MODELS[k])?;
        }
    }
    Ok(data)
}
