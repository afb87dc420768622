//! Frame decoder
//!
//! Mirrors the encoder stage by stage, then reconstructs PCM through the
//! inverse transform and the long-term postfilter. A missing payload routes
//! the channel through concealment instead of the bitstream parser.

use rayon::prelude::*;
use tracing::{trace, warn};

use crate::bits::BitReader;
use crate::bwdet;
use crate::error::{Lc3Error, Result};
use crate::ltpf::{self, LtpfData, LtpfSynthesis};
use crate::mdct::MdctSynthesis;
use crate::plc::Plc;
use crate::sns;
use crate::spectrum::SpectrumSynthesis;
use crate::tables::band_limits;
use crate::tns;
use crate::types::{FrameCodec, FrameConfig};

/// Stateful pipeline of one channel
struct ChannelDecoder {
    cfg: FrameConfig,
    limits: Vec<usize>,
    spectrum: SpectrumSynthesis,
    mdct: MdctSynthesis,
    ltpf: LtpfSynthesis,
    plc: Plc,
    nbytes: usize,
    xf: Vec<f32>,
}

impl ChannelDecoder {
    fn new(cfg: &FrameConfig) -> Self {
        ChannelDecoder {
            cfg: *cfg,
            limits: band_limits(cfg),
            spectrum: SpectrumSynthesis::new(cfg),
            mdct: MdctSynthesis::new(cfg.frame_samples()),
            ltpf: LtpfSynthesis::new(cfg),
            plc: Plc::new(cfg.spectral_lines()),
            nbytes: cfg.min_frame_bytes(),
            xf: vec![0.0; cfg.frame_samples()],
        }
    }

    fn reset(&mut self) {
        self.mdct.reset();
        self.ltpf.reset();
        self.plc.reset();
        self.xf.fill(0.0);
    }

    fn decode(&mut self, frame: Option<&[u8]>, nbytes: usize, out: &mut [f32]) -> Result<()> {
        let cfg = self.cfg;
        let ne = cfg.spectral_lines();

        let ltpf_data = match frame {
            Some(frame) => {
                let mut bits = BitReader::new(frame);

                let bw = bwdet::read(&cfg, &mut bits)?;
                let side = self.spectrum.get_side(&mut bits)?;
                let tns_data = tns::read(&mut bits, &cfg, bw, nbytes)?;
                let pitch_present = bits.get_bits(1) != 0;
                let sns_data = sns::read(&mut bits)?;
                let ltpf_data = ltpf::read(pitch_present, &mut bits);

                let mut x = self.spectrum.decode(&mut bits, &side, bw, nbytes)?;
                if bits.bits_left() < 0 {
                    return Err(Lc3Error::invalid_bitstream("bit budget exceeded"));
                }

                tns::synthesize(&cfg, bw, &tns_data, &mut x);
                let scf = sns::unquantize(&sns_data);
                sns::spectral_shaping(&self.limits, &scf, true, &mut x);

                trace!(bw, lastnz = side.lastnz, g_idx = side.g_idx, "frame decode");

                self.plc.suspend(&x);
                self.nbytes = nbytes;
                self.xf[..ne].copy_from_slice(&x);
                ltpf_data
            }
            None => {
                self.plc.synthesize(&mut self.xf[..ne]);
                LtpfData::off()
            }
        };
        self.xf[ne..].fill(0.0);

        self.mdct.run(&self.xf, out);
        if !cfg.is_hr() {
            self.ltpf
                .run(&ltpf_data, self.nbytes, cfg.duration.us(), out);
        }
        Ok(())
    }
}

/// Session decoder over one or more channels
pub struct Lc3Decoder {
    cfg: FrameConfig,
    channels: Vec<ChannelDecoder>,
    pcm_f: Vec<Vec<f32>>,
}

impl Lc3Decoder {
    /// Build a decoder for the given session configuration
    pub fn new(cfg: FrameConfig) -> Result<Self> {
        let ns = cfg.frame_samples();
        Ok(Lc3Decoder {
            cfg,
            channels: (0..cfg.channels).map(|_| ChannelDecoder::new(&cfg)).collect(),
            pcm_f: vec![vec![0.0; ns]; cfg.channels],
        })
    }

    /// Decode one frame block into interleaved PCM
    ///
    /// `data` holds the concatenated per-channel frames; `None` conceals the
    /// whole block from the last good spectra.
    pub fn decode_frame(&mut self, data: Option<&[u8]>, pcm: &mut [i16]) -> Result<()> {
        let cfg = &self.cfg;
        let nch = cfg.channels;
        let ns = cfg.frame_samples();

        if pcm.len() != ns * nch {
            return Err(Lc3Error::InvalidFrameSize {
                expected: ns * nch,
                actual: pcm.len(),
            });
        }

        let nbytes = match data {
            Some(data) => {
                if data.len() % nch != 0 {
                    return Err(Lc3Error::invalid_bitstream(
                        "block length not a multiple of the channel count",
                    ));
                }
                let nbytes = data.len() / nch;
                cfg.check_frame_bytes(nbytes)?;
                nbytes
            }
            None => {
                warn!("lost frame block, concealing");
                0
            }
        };

        if nch > 1 {
            self.channels
                .par_iter_mut()
                .zip(self.pcm_f.par_iter_mut())
                .enumerate()
                .map(|(ch, (dec, buf))| {
                    let frame = data.map(|d| &d[ch * nbytes..(ch + 1) * nbytes]);
                    dec.decode(frame, nbytes, buf)
                })
                .collect::<Result<Vec<()>>>()?;
        } else {
            self.channels[0].decode(data, nbytes, &mut self.pcm_f[0])?;
        }

        for (ch, buf) in self.pcm_f.iter().enumerate() {
            for (dst, &src) in pcm[ch..].iter_mut().step_by(nch).zip(buf.iter()) {
                *dst = (src.round() as i32).clamp(-32768, 32767) as i16;
            }
        }
        Ok(())
    }
}

impl FrameCodec for Lc3Decoder {
    fn config(&self) -> &FrameConfig {
        &self.cfg
    }

    fn reset(&mut self) {
        for ch in self.channels.iter_mut() {
            ch.reset();
        }
    }
}
