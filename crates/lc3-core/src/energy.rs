//! Per-band energy computation
//!
//! Produces the band energy vector consumed by spectral shaping and the
//! bandwidth detector, plus a near-nyquist flag that disqualifies the
//! long-term postfilter when the top of the spectrum dominates (strongly
//! tilted content aliases the pitch measure).

use crate::types::{FrameConfig, SampleRate};

/// Mean energy per band of one frame of MDCT coefficients
pub fn band_energies(limits: &[usize], spectrum: &[f32]) -> Vec<f32> {
    limits
        .windows(2)
        .map(|w| {
            let band = &spectrum[w[0]..w[1]];
            band.iter().map(|&v| v * v).sum::<f32>() / band.len() as f32
        })
        .collect()
}

/// True when the two top bands carry the bulk of the frame energy
///
/// Only meaningful at 32 kHz and below; higher rates resolve the spectrum
/// well past the pitch range.
pub fn near_nyquist(cfg: &FrameConfig, energies: &[f32]) -> bool {
    if cfg.rate.index() > SampleRate::Hz32000.index() || energies.len() < 4 {
        return false;
    }
    let nb = energies.len();
    let top: f32 = energies[nb - 2..].iter().sum();
    let rest: f32 = energies[..nb - 2].iter().sum::<f32>() / (nb - 2) as f32;
    top > 30.0 * (rest + f32::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::band_limits;
    use crate::types::FrameDuration;

    #[test]
    fn test_band_energies_flat() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        let limits = band_limits(&cfg);
        let spectrum = vec![2.0f32; cfg.spectral_lines()];
        let e = band_energies(&limits, &spectrum);
        assert_eq!(e.len(), cfg.band_count());
        assert!(e.iter().all(|&v| (v - 4.0).abs() < 1e-6));
    }

    #[test]
    fn test_near_nyquist_flag() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        let limits = band_limits(&cfg);
        let ne = cfg.spectral_lines();

        let mut spectrum = vec![0.01f32; ne];
        assert!(!near_nyquist(&cfg, &band_energies(&limits, &spectrum)));

        for v in spectrum[ne - 8..].iter_mut() {
            *v = 100.0;
        }
        assert!(near_nyquist(&cfg, &band_energies(&limits, &spectrum)));

        // never flagged at 48 kHz
        let cfg48 = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz48000).unwrap();
        let limits48 = band_limits(&cfg48);
        let mut spectrum48 = vec![0.01f32; cfg48.spectral_lines()];
        let ne48 = spectrum48.len();
        for v in spectrum48[ne48 - 8..].iter_mut() {
            *v = 100.0;
        }
        assert!(!near_nyquist(&cfg48, &band_energies(&limits48, &spectrum48)));
    }
}
