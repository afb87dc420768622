//! Frame encoder
//!
//! One `ChannelEncoder` per channel carries the stateful stages; the
//! session-level `Lc3Encoder` deinterleaves PCM, fans the channels out and
//! concatenates the resulting frames.

use rayon::prelude::*;
use tracing::trace;

use crate::bits::BitWriter;
use crate::bwdet;
use crate::error::{Lc3Error, Result};
use crate::ltpf::{self, LtpfAnalysis};
use crate::mdct::MdctAnalysis;
use crate::sns;
use crate::spectrum::{self, SpectrumAnalysis};
use crate::tables::band_limits;
use crate::tns;
use crate::types::{FrameCodec, FrameConfig};
use crate::{attdet::AttackDetector, energy};

/// Stateful pipeline of one channel
struct ChannelEncoder {
    cfg: FrameConfig,
    limits: Vec<usize>,
    attdet: AttackDetector,
    ltpf: LtpfAnalysis,
    mdct: MdctAnalysis,
    spectrum: SpectrumAnalysis,
    x: Vec<f32>,
}

impl ChannelEncoder {
    fn new(cfg: &FrameConfig) -> Self {
        ChannelEncoder {
            cfg: *cfg,
            limits: band_limits(cfg),
            attdet: AttackDetector::new(cfg),
            ltpf: LtpfAnalysis::new(cfg),
            mdct: MdctAnalysis::new(cfg.frame_samples()),
            spectrum: SpectrumAnalysis::new(cfg),
            x: vec![0.0; cfg.frame_samples()],
        }
    }

    fn reset(&mut self) {
        self.attdet.reset();
        self.ltpf.reset();
        self.mdct.reset();
        self.spectrum.reset();
    }

    fn encode(&mut self, pcm: &[f32], nbytes: usize, out: &mut [u8]) {
        let cfg = self.cfg;
        let ne = cfg.spectral_lines();

        let attack = self.attdet.run(&cfg, nbytes, pcm);
        let mut ltpf_data = self.ltpf.run(pcm);

        self.mdct.run(pcm, &mut self.x);
        let x = &mut self.x[..ne];

        let energies = energy::band_energies(&self.limits, x);
        let nn = energy::near_nyquist(&cfg, &energies);
        if nn {
            self.ltpf.disable(&mut ltpf_data);
        }

        let bw = bwdet::detect(&cfg, x);

        let scf = sns::compute_scale_factors(&cfg, &energies, attack);
        let (sns_data, scf_q) = sns::quantize(&scf);
        sns::spectral_shaping(&self.limits, &scf_q, false, x);

        let tns_data = tns::analyze(&cfg, bw, nn, nbytes, x);

        let nbits_side =
            bwdet::bandwidth_bits(&cfg) + ltpf_data.nbits() + sns::SNS_BITS + tns_data.nbits();
        let spec_data = self.spectrum.analyze(bw, nbytes, nbits_side, x);

        trace!(
            bw,
            attack,
            pitch = ltpf_data.pitch_present,
            g_idx = spec_data.g_idx,
            lastnz = spec_data.lastnz,
            "frame analysis"
        );

        let mut bits = BitWriter::new(nbytes);
        let bw_bits = bwdet::bandwidth_bits(&cfg);
        if bw_bits > 0 {
            bits.put_bits(bw as u32, bw_bits);
        }
        spectrum::put_side(&spec_data, &cfg, &mut bits);
        tns::write(&tns_data, &mut bits);
        bits.put_bits(u32::from(ltpf_data.pitch_present), 1);
        sns::write(&sns_data, &mut bits);
        ltpf::write(&ltpf_data, &mut bits);
        spectrum::encode(&spec_data, &mut bits);
        bits.terminate();

        out.copy_from_slice(&bits.into_bytes());
    }
}

/// Session encoder over one or more channels
pub struct Lc3Encoder {
    cfg: FrameConfig,
    channels: Vec<ChannelEncoder>,
    pcm_f: Vec<Vec<f32>>,
}

impl Lc3Encoder {
    /// Build an encoder for the given session configuration
    pub fn new(cfg: FrameConfig) -> Result<Self> {
        let ns = cfg.frame_samples();
        Ok(Lc3Encoder {
            cfg,
            channels: (0..cfg.channels).map(|_| ChannelEncoder::new(&cfg)).collect(),
            pcm_f: vec![vec![0.0; ns]; cfg.channels],
        })
    }

    /// Encode one frame block of interleaved PCM
    ///
    /// Each channel is coded into `nbytes` bytes; the per-channel frames are
    /// concatenated into `out`. Returns the total number of bytes written.
    pub fn encode_frame(&mut self, pcm: &[i16], nbytes: usize, out: &mut [u8]) -> Result<usize> {
        let cfg = &self.cfg;
        let nch = cfg.channels;
        let ns = cfg.frame_samples();

        if pcm.len() != ns * nch {
            return Err(Lc3Error::InvalidFrameSize {
                expected: ns * nch,
                actual: pcm.len(),
            });
        }
        cfg.check_frame_bytes(nbytes)?;
        if out.len() < nbytes * nch {
            return Err(Lc3Error::BufferTooSmall {
                needed: nbytes * nch,
                actual: out.len(),
            });
        }

        for (ch, buf) in self.pcm_f.iter_mut().enumerate() {
            for (dst, src) in buf.iter_mut().zip(pcm[ch..].iter().step_by(nch)) {
                *dst = f32::from(*src);
            }
        }

        let out_frames = &mut out[..nbytes * nch];
        if nch > 1 {
            self.channels
                .par_iter_mut()
                .zip(self.pcm_f.par_iter())
                .zip(out_frames.par_chunks_exact_mut(nbytes))
                .for_each(|((enc, buf), frame)| enc.encode(buf, nbytes, frame));
        } else {
            self.channels[0].encode(&self.pcm_f[0], nbytes, out_frames);
        }

        Ok(nbytes * nch)
    }
}

impl FrameCodec for Lc3Encoder {
    fn config(&self) -> &FrameConfig {
        &self.cfg
    }

    fn reset(&mut self) {
        for ch in self.channels.iter_mut() {
            ch.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameDuration, SampleRate};

    fn sine(ns: usize, periods: f32) -> Vec<i16> {
        (0..ns)
            .map(|i| {
                let t = i as f32 / ns as f32;
                (8000.0 * (periods * t * std::f32::consts::TAU).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_frame_fills_exact_budget() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        let mut enc = Lc3Encoder::new(cfg).unwrap();
        let pcm = sine(cfg.frame_samples(), 17.0);

        for nbytes in [20, 40, 80, 150] {
            let mut out = vec![0u8; nbytes];
            let written = enc.encode_frame(&pcm, nbytes, &mut out).unwrap();
            assert_eq!(written, nbytes);
        }
    }

    #[test]
    fn test_rejects_bad_frame_size() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        let mut enc = Lc3Encoder::new(cfg).unwrap();
        let pcm = vec![0i16; cfg.frame_samples() - 1];
        let mut out = vec![0u8; 40];
        assert!(enc.encode_frame(&pcm, 40, &mut out).is_err());
    }

    #[test]
    fn test_rejects_bad_byte_budget() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz16000).unwrap();
        let mut enc = Lc3Encoder::new(cfg).unwrap();
        let pcm = vec![0i16; cfg.frame_samples()];
        let mut out = vec![0u8; 1000];
        assert!(enc.encode_frame(&pcm, 10, &mut out).is_err());
        assert!(enc.encode_frame(&pcm, 500, &mut out).is_err());
    }

    #[test]
    fn test_rejects_short_output_buffer() {
        let cfg = FrameConfig::new(FrameDuration::Ms10, SampleRate::Hz16000, 2).unwrap();
        let mut enc = Lc3Encoder::new(cfg).unwrap();
        let pcm = vec![0i16; cfg.frame_samples() * 2];
        let mut out = vec![0u8; 40];
        assert!(enc.encode_frame(&pcm, 40, &mut out).is_err());
    }

    #[test]
    fn test_stereo_channels_code_independently() {
        let mono = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz32000).unwrap();
        let stereo = FrameConfig::new(FrameDuration::Ms10, SampleRate::Hz32000, 2).unwrap();
        let ns = mono.frame_samples();
        let left = sine(ns, 13.0);

        let mut interleaved = vec![0i16; ns * 2];
        for i in 0..ns {
            interleaved[2 * i] = left[i];
        }

        let mut enc_m = Lc3Encoder::new(mono).unwrap();
        let mut enc_s = Lc3Encoder::new(stereo).unwrap();
        let mut out_m = vec![0u8; 60];
        let mut out_s = vec![0u8; 120];
        enc_m.encode_frame(&left, 60, &mut out_m).unwrap();
        enc_s.encode_frame(&interleaved, 60, &mut out_s).unwrap();

        assert_eq!(out_m[..], out_s[..60]);
    }

    #[test]
    fn test_deterministic_after_reset() {
        let cfg = FrameConfig::mono(FrameDuration::Ms10, SampleRate::Hz48000).unwrap();
        let mut enc = Lc3Encoder::new(cfg).unwrap();
        let pcm = sine(cfg.frame_samples(), 29.0);

        let mut first = vec![0u8; 80];
        enc.encode_frame(&pcm, 80, &mut first).unwrap();

        enc.reset();
        let mut second = vec![0u8; 80];
        enc.encode_frame(&pcm, 80, &mut second).unwrap();
        assert_eq!(first, second);
    }
}
