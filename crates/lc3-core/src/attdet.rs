//! Transient attack detector
//!
//! Runs on a 16 kHz block-sum downsample of the input, high-pass filtered
//! and split into 2.5 ms blocks. A block attacks when its energy exceeds
//! 8.5 times a decaying envelope of the recent past. The flag is only acted
//! on at 32/48 kHz above a byte-budget threshold, but the detector state
//! keeps running regardless so enabling it mid-stream stays consistent.

use crate::types::{FrameConfig, FrameDuration, SampleRate};

const ATTACK_RATIO: f32 = 8.5;
const ENVELOPE_DECAY: f32 = 0.25;
const BLOCK_LEN: usize = 40;

/// Detector state of one channel
pub struct AttackDetector {
    ratio: usize,
    nblocks: usize,
    hp_mem: [f32; 2],
    env: f32,
    energy_mem: f32,
    attack_mem: bool,
}

impl AttackDetector {
    /// Build for a session; inert (but still updating) for configurations
    /// outside the 32/48 kHz long-frame policy
    pub fn new(cfg: &FrameConfig) -> Self {
        Self {
            ratio: (cfg.rate.hz() / 16_000).max(1) as usize,
            nblocks: (16 * cfg.duration.us() as usize / 1_000) / BLOCK_LEN,
            hp_mem: [0.0; 2],
            env: 0.0,
            energy_mem: 0.0,
            attack_mem: false,
        }
    }

    /// True when attack handling applies to this configuration and budget
    pub fn enabled(cfg: &FrameConfig, nbytes: usize) -> bool {
        match (cfg.duration, cfg.rate) {
            (FrameDuration::Ms7_5, SampleRate::Hz32000) => nbytes >= 61,
            (FrameDuration::Ms7_5, SampleRate::Hz48000) => nbytes >= 75,
            (FrameDuration::Ms10, SampleRate::Hz32000) => nbytes >= 81,
            (FrameDuration::Ms10, SampleRate::Hz48000) => nbytes >= 100,
            _ => false,
        }
    }

    /// Process one frame of PCM, returning the attack flag for this frame
    pub fn run(&mut self, cfg: &FrameConfig, nbytes: usize, pcm: &[f32]) -> bool {
        if self.nblocks == 0 || self.ratio < 2 {
            return false;
        }

        // block-sum downsample to 16 kHz
        let n16 = self.nblocks * BLOCK_LEN;
        let mut attack = false;
        let mut pos = 0;

        for _ in 0..self.nblocks {
            let mut energy = 0.0f32;
            for _ in 0..BLOCK_LEN {
                let s: f32 = pcm[pos * self.ratio..(pos + 1) * self.ratio].iter().sum();
                pos += 1;
                let hp = 0.375 * s - 0.5 * self.hp_mem[0] + 0.125 * self.hp_mem[1];
                self.hp_mem[1] = self.hp_mem[0];
                self.hp_mem[0] = s;
                energy += hp * hp;
            }

            self.env = (ENVELOPE_DECAY * self.env).max(self.energy_mem);
            self.energy_mem = energy;
            if energy > ATTACK_RATIO * self.env {
                attack = true;
            }
        }
        debug_assert_eq!(pos, n16);

        // an attack carries into the following frame to cover the transform
        // lookahead
        let flag = attack || self.attack_mem;
        self.attack_mem = attack;

        flag && Self::enabled(cfg, nbytes)
    }

    /// Clear detector state
    pub fn reset(&mut self) {
        self.hp_mem = [0.0; 2];
        self.env = 0.0;
        self.energy_mem = 0.0;
        self.attack_mem = false;
    }
}
