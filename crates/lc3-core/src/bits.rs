//! Dual-ended frame bitstream
//!
//! Each coded frame is one byte buffer written from both ends: raw side
//! bits are packed from the last byte backward, most significant bit first,
//! while arithmetic-coded symbols grow from the first byte forward. The
//! arithmetic coder is a 24-bit range coder with deferred carry propagation:
//! bytes whose final value depends on a pending carry are held in a one-byte
//! cache plus a run counter of 0xFF bytes until a non-propagating byte
//! resolves them.
//!
//! Bit accounting is symmetric: at any symbol boundary the writer and the
//! reader report the same `bits_left()`, which the spectrum stage relies on
//! to size residual and LSB payloads exactly.
//!
//! Symbol probabilities are cumulative-frequency tables over a total of
//! 1024 (`cum[0] == 0`, `cum[len-1] == 1024`).

use crate::error::{Lc3Error, Result};

/// Total cumulative frequency of every symbol model (10-bit precision)
pub const AC_TOTAL: u16 = 1024;

const AC_RANGE_INIT: u32 = 0xFF_FFFF;
const AC_RANGE_MIN: u32 = 0x1_0000;

/// Bits the arithmetic coder still owes the stream: every byte held in the
/// carry pipeline plus the minimal termination tail for the current range.
fn ac_tail_bits(range: u32) -> usize {
    // range is kept in [0x10000, 0xFFFFFF]
    (range.leading_zeros() as usize) - 6
}

/// Frame writer: side bits from the tail, arithmetic symbols from the head
pub struct BitWriter {
    data: Vec<u8>,
    nbits_side: usize,
    ac_pos: usize,
    low: u32,
    range: u32,
    cache: Option<u8>,
    carry: bool,
    carry_count: usize,
    terminated: bool,
}

impl BitWriter {
    /// Start a frame of exactly `nbytes` bytes
    pub fn new(nbytes: usize) -> Self {
        Self {
            data: vec![0; nbytes],
            nbits_side: 0,
            ac_pos: 0,
            low: 0,
            range: AC_RANGE_INIT,
            cache: None,
            carry: false,
            carry_count: 0,
            terminated: false,
        }
    }

    /// Unused bits remaining in the frame
    pub fn bits_left(&self) -> usize {
        let pipeline = self.ac_pos + usize::from(self.cache.is_some()) + self.carry_count;
        let used = self.nbits_side + 8 * pipeline + ac_tail_bits(self.range);
        self.data.len() * 8 - used
    }

    /// Write `nbits` of `val` to the side region, field MSB first
    pub fn put_bits(&mut self, val: u32, nbits: usize) {
        assert!(!self.terminated, "side bits written after terminate()");
        debug_assert!(nbits <= 24 && (nbits == 24 || val < (1 << nbits)));
        for k in (0..nbits).rev() {
            self.put_bit_raw((val >> k) & 1 != 0);
        }
    }

    fn put_bit_raw(&mut self, bit: bool) {
        let i = self.nbits_side;
        assert!(
            i + self.ac_bits_low_bound() < self.data.len() * 8,
            "bitstream cursors crossed"
        );
        if bit {
            let byte = self.data.len() - 1 - i / 8;
            self.data[byte] |= 0x80 >> (i % 8);
        }
        self.nbits_side = i + 1;
    }

    fn ac_bits_low_bound(&self) -> usize {
        8 * (self.ac_pos + usize::from(self.cache.is_some()) + self.carry_count)
    }

    /// Arithmetic-code `sym` under the cumulative model `cum`
    pub fn put_symbol(&mut self, cum: &[u16], sym: usize) {
        assert!(!self.terminated, "symbol written after terminate()");
        debug_assert!(sym + 1 < cum.len() && *cum.last().unwrap() == AC_TOTAL);
        let r = self.range >> 10;
        self.low += r * u32::from(cum[sym]);
        if self.low >> 24 != 0 {
            self.carry = true;
            self.low &= 0xFF_FFFF;
        }
        self.range = r * u32::from(cum[sym + 1] - cum[sym]);
        while self.range < AC_RANGE_MIN {
            self.range <<= 8;
            self.ac_shift();
        }
    }

    fn ac_shift(&mut self) {
        if self.low < 0xFF_0000 || self.carry {
            if let Some(c) = self.cache.take() {
                self.emit(c.wrapping_add(u8::from(self.carry)));
            }
            while self.carry_count > 0 {
                self.emit(if self.carry { 0x00 } else { 0xFF });
                self.carry_count -= 1;
            }
            self.cache = Some((self.low >> 16) as u8);
            self.carry = false;
        } else {
            self.carry_count += 1;
        }
        self.low = (self.low << 8) & 0xFF_FFFF;
    }

    fn emit(&mut self, byte: u8) {
        // whole bytes at the head never overlap the side region; OR keeps
        // the shared final byte of terminate() safe as well
        self.data[self.ac_pos] |= byte;
        self.ac_pos += 1;
    }

    /// Flush the range coder: pick the shortest value inside the final
    /// interval and write only its significant high bits
    pub fn terminate(&mut self) {
        assert!(!self.terminated, "terminate() called twice");
        self.terminated = true;

        let nbits = ac_tail_bits(self.range);
        let mask = 0xFF_FFFF >> nbits;
        let mut val = self.low + mask;
        if val >> 24 != 0 {
            // rounding up crossed the top byte
            self.carry = true;
        }
        val = (val & 0xFF_FFFF) & !mask;

        if let Some(c) = self.cache.take() {
            let carry = u8::from(self.carry);
            let pos = self.ac_pos;
            self.data[pos] |= c.wrapping_add(carry);
            self.ac_pos = pos + 1;
        }
        while self.carry_count > 0 {
            let byte = if self.carry { 0x00 } else { 0xFF };
            let pos = self.ac_pos;
            self.data[pos] |= byte;
            self.ac_pos = pos + 1;
            self.carry_count -= 1;
        }

        // up to 9 significant bits, OR-ed so they may share the meeting
        // byte with side bits
        if self.ac_pos < self.data.len() {
            self.data[self.ac_pos] |= (val >> 16) as u8;
        }
        if nbits > 8 && self.ac_pos + 1 < self.data.len() {
            self.data[self.ac_pos + 1] |= (val >> 8) as u8;
        }
    }

    /// Finish the frame and hand back the bytes
    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.terminated, "frame finished without terminate()");
        self.data
    }
}

/// Frame reader mirroring [`BitWriter`]
pub struct BitReader<'a> {
    data: &'a [u8],
    nbits_side: usize,
    ac_pos: usize,
    low: u32,
    range: u32,
}

impl<'a> BitReader<'a> {
    /// Open a coded frame
    pub fn new(data: &'a [u8]) -> Self {
        let mut r = Self {
            data,
            nbits_side: 0,
            ac_pos: 0,
            low: 0,
            range: AC_RANGE_INIT,
        };
        for _ in 0..3 {
            r.low = (r.low << 8) | u32::from(r.next_byte());
        }
        r
    }

    /// Unused bits remaining in the frame; negative on corrupt streams
    pub fn bits_left(&self) -> isize {
        let used = self.nbits_side as isize + 8 * (self.ac_pos as isize - 3)
            + ac_tail_bits(self.range) as isize;
        self.data.len() as isize * 8 - used
    }

    /// Read `nbits` from the side region, field MSB first
    pub fn get_bits(&mut self, nbits: usize) -> u32 {
        let mut val = 0;
        for _ in 0..nbits {
            val = (val << 1) | u32::from(self.get_bit_raw());
        }
        val
    }

    fn get_bit_raw(&mut self) -> bool {
        let i = self.nbits_side;
        self.nbits_side = i + 1;
        if i / 8 >= self.data.len() {
            return false;
        }
        let byte = self.data.len() - 1 - i / 8;
        self.data[byte] & (0x80 >> (i % 8)) != 0
    }

    fn next_byte(&mut self) -> u8 {
        // renormalization may run a few bytes past the coded region near the
        // end of the frame; those bits never affect a decoded symbol
        let byte = self.data.get(self.ac_pos).copied().unwrap_or(0);
        self.ac_pos += 1;
        byte
    }

    /// Decode one symbol under the cumulative model `cum`
    pub fn get_symbol(&mut self, cum: &[u16]) -> Result<usize> {
        debug_assert!(*cum.last().unwrap() == AC_TOTAL);
        let r = self.range >> 10;
        if self.low >= r << 10 {
            return Err(Lc3Error::invalid_bitstream("arithmetic decoder desync"));
        }
        let mut sym = 0;
        while self.low >= r * u32::from(cum[sym + 1]) {
            sym += 1;
        }
        self.low -= r * u32::from(cum[sym]);
        self.range = r * u32::from(cum[sym + 1] - cum[sym]);
        while self.range < AC_RANGE_MIN {
            self.range <<= 8;
            self.low = ((self.low << 8) | u32::from(self.next_byte())) & 0xFF_FFFF;
        }
        Ok(sym)
    }
}
