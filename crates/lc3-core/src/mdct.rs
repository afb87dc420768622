//! Windowed MDCT analysis and synthesis
//!
//! The transform runs over two consecutive frames with a sine window and
//! 50% overlap, so reconstruction lags the input by exactly one frame. Both
//! directions reduce to an N/4-point complex FFT with pre/post rotation;
//! coefficients carry the orthonormal `sqrt(2/N)` scaling so synthesis uses
//! the same factor and overlap-add restores unit gain.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

struct Transform {
    n: usize,
    n2: usize,
    n4: usize,
    window: Vec<f32>,
    scale: f32,
    fft: Arc<dyn Fft<f32>>,
    twiddle: Vec<Complex<f32>>,
}

impl Transform {
    fn new(n2: usize) -> Self {
        let n = 2 * n2;
        let n4 = n2 / 2;
        debug_assert!(n2 % 4 == 0, "frame size must fold into an N/4 FFT");

        let window = (0..n)
            .map(|i| (PI * (i as f32 + 0.5) / n as f32).sin())
            .collect();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n4);

        let twiddle = (0..n4)
            .map(|k| {
                let theta = PI / n2 as f32 * (k as f32 + 0.125);
                Complex::new(theta.cos(), theta.sin())
            })
            .collect();

        Self {
            n,
            n2,
            n4,
            window,
            scale: (2.0 / n2 as f32).sqrt(),
            fft,
            twiddle,
        }
    }

    /// N windowed samples in, N/2 coefficients out
    fn forward(&self, samples: &[f32], output: &mut [f32]) {
        let (n, n2, n4) = (self.n, self.n2, self.n4);
        let n8 = n4 / 2;
        let n3 = 3 * n4;

        let x: Vec<f32> = samples
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| s * w)
            .collect();

        // fold into N/4 complex FFT inputs
        let mut z: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); n4];
        for i in 0..n8 {
            let re = -x[2 * i + n3] - x[n3 - 1 - 2 * i];
            let im = -x[n4 + 2 * i] + x[n4 - 1 - 2 * i];
            let w = &self.twiddle[i];
            z[i] = Complex::new(-re * w.re - im * w.im, re * w.im - im * w.re);

            let re2 = x[2 * i] - x[n2 - 1 - 2 * i];
            let im2 = -x[n2 + 2 * i] - x[n - 1 - 2 * i];
            let w2 = &self.twiddle[n8 + i];
            z[n8 + i] = Complex::new(-re2 * w2.re - im2 * w2.im, re2 * w2.im - im2 * w2.re);
        }

        self.fft.process(&mut z);

        for i in 0..n8 {
            let idx1 = n8 - i - 1;
            let idx2 = n8 + i;

            let w1 = &self.twiddle[idx1];
            let z1 = z[idx1];
            let i1 = -z1.re * w1.im + z1.im * w1.re;
            let r0 = -z1.re * w1.re - z1.im * w1.im;

            let w2 = &self.twiddle[idx2];
            let z2 = z[idx2];
            let i0 = -z2.re * w2.im + z2.im * w2.re;
            let r1 = -z2.re * w2.re - z2.im * w2.im;

            output[2 * idx1] = r0 * self.scale;
            output[2 * idx1 + 1] = i0 * self.scale;
            output[2 * idx2] = r1 * self.scale;
            output[2 * idx2 + 1] = i1 * self.scale;
        }
    }

    /// N/2 coefficients in, N windowed samples out (before overlap-add)
    fn inverse(&self, spec: &[f32], output: &mut [f32]) {
        let (n2, n4) = (self.n2, self.n4);
        let n8 = n4 / 2;

        let mut z: Vec<Complex<f32>> = Vec::with_capacity(n4);
        for i in 0..n4 {
            let even = spec[i * 2];
            let odd = -spec[n2 - 1 - i * 2];
            let w = &self.twiddle[i];
            z.push(Complex::new(
                odd * w.im - even * w.re,
                odd * w.re + even * w.im,
            ));
        }

        self.fft.process(&mut z);

        let scale = self.scale;
        for i in 0..n8 {
            let w = &self.twiddle[i];
            let val_re = w.re * z[i].re + w.im * z[i].im;
            let val_im = w.im * z[i].re - w.re * z[i].im;

            let fi = 2 * i;
            let ri = n4 - 1 - 2 * i;

            output[ri] = -val_im * scale * self.window[ri];
            output[n4 + fi] = val_im * scale * self.window[n4 + fi];
            output[n2 + ri] = val_re * scale * self.window[n2 + ri];
            output[n2 + n4 + fi] = val_re * scale * self.window[n2 + n4 + fi];
        }
        for i in 0..n8 {
            let idx = n8 + i;
            let w = &self.twiddle[idx];
            let val_re = w.re * z[idx].re + w.im * z[idx].im;
            let val_im = w.im * z[idx].re - w.re * z[idx].im;

            let fi = 2 * i;
            let ri = n4 - 1 - 2 * i;

            output[fi] = -val_re * scale * self.window[fi];
            output[n4 + ri] = val_re * scale * self.window[n4 + ri];
            output[n2 + fi] = val_im * scale * self.window[n2 + fi];
            output[n2 + n4 + ri] = val_im * scale * self.window[n2 + n4 + ri];
        }
    }
}

/// Stateful analysis transform of one channel
pub struct MdctAnalysis {
    t: Transform,
    hist: Vec<f32>,
}

impl MdctAnalysis {
    /// Build for frames of `ns` samples
    pub fn new(ns: usize) -> Self {
        Self {
            t: Transform::new(ns),
            hist: vec![0.0; ns],
        }
    }

    /// Transform one frame; `out` receives `ns` coefficients
    pub fn run(&mut self, x: &[f32], out: &mut [f32]) {
        let ns = self.hist.len();
        debug_assert!(x.len() == ns && out.len() == ns);

        let mut block = Vec::with_capacity(2 * ns);
        block.extend_from_slice(&self.hist);
        block.extend_from_slice(x);
        self.t.forward(&block, out);
        self.hist.copy_from_slice(x);
    }

    /// Clear the one-frame history
    pub fn reset(&mut self) {
        self.hist.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Stateful synthesis transform of one channel
pub struct MdctSynthesis {
    t: Transform,
    overlap: Vec<f32>,
}

impl MdctSynthesis {
    /// Build for frames of `ns` samples
    pub fn new(ns: usize) -> Self {
        Self {
            t: Transform::new(ns),
            overlap: vec![0.0; ns],
        }
    }

    /// Inverse-transform one frame of `ns` coefficients into `ns` samples
    pub fn run(&mut self, spec: &[f32], out: &mut [f32]) {
        let ns = self.overlap.len();
        debug_assert!(spec.len() == ns && out.len() == ns);

        let mut block = vec![0.0f32; 2 * ns];
        self.t.inverse(spec, &mut block);
        for i in 0..ns {
            out[i] = block[i] + self.overlap[i];
        }
        self.overlap.copy_from_slice(&block[ns..]);
    }

    /// Clear the overlap-add state
    pub fn reset(&mut self) {
        self.overlap.iter_mut().for_each(|v| *v = 0.0);
    }
}
