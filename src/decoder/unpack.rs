//! Bit-level sample unpacking
//!
//! A single misplaced shift here silently corrupts every sample after it, so the
//! tests below walk every bit position of both packings.

use super::cursor::WORD_SIZE;

/// Mask of one DPP-PSD sample
pub const PSD_SAMPLE_MASK: u32 = 0x3FFF;
/// Width of one DRS4 sample in bits
pub const DRS4_SAMPLE_BITS: u32 = 12;

#[inline]
fn word(bytes: &[u8], i: usize) -> u32 {
    let b = &bytes[i * WORD_SIZE..(i + 1) * WORD_SIZE];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// DPP-PSD waveform words carry two 14-bit samples, the even one in bits 0..14
/// and the odd one in bits 16..30. Bits 14, 15, 30 and 31 are digital probes and
/// are dropped.
///
/// `out.len()` must be exactly twice the number of words in `bytes`.
pub fn unpack_psd(bytes: &[u8], out: &mut [u16]) {
    assert_eq!(out.len(), 2 * (bytes.len() / WORD_SIZE));
    for (i, pair) in out.chunks_exact_mut(2).enumerate() {
        let w = word(bytes, i);
        pair[0] = (w & PSD_SAMPLE_MASK) as u16;
        pair[1] = ((w >> 16) & PSD_SAMPLE_MASK) as u16;
    }
}

/// Eight 12-bit samples packed LSB-first across three words.
#[inline]
pub fn unpack_triplet(w: [u32; 3]) -> [u16; 8] {
    [
        (w[0] & 0xFFF) as u16,
        ((w[0] >> 12) & 0xFFF) as u16,
        (((w[1] & 0xF) << 8) | ((w[0] >> 24) & 0xFF)) as u16,
        ((w[1] >> 4) & 0xFFF) as u16,
        ((w[1] >> 16) & 0xFFF) as u16,
        (((w[2] & 0xFF) << 4) | ((w[1] >> 28) & 0xF)) as u16,
        ((w[2] >> 8) & 0xFFF) as u16,
        ((w[2] >> 20) & 0xFFF) as u16,
    ]
}

/// DRS4 group data: every three words hold one sample from each of the eight
/// channels of the group. `out[ch]` receives `n` samples, one per triplet.
pub fn unpack_drs4_channels(bytes: &[u8], out: &mut [&mut [u16]]) {
    assert_eq!(out.len(), 8);
    let n = bytes.len() / (3 * WORD_SIZE);
    for s in 0..n {
        let t = unpack_triplet([word(bytes, 3 * s), word(bytes, 3 * s + 1), word(bytes, 3 * s + 2)]);
        for (ch, v) in t.into_iter().enumerate() {
            out[ch][s] = v;
        }
    }
}

/// DRS4 fast-trigger (TR) data: consecutive samples of one signal, eight per
/// three words.
pub fn unpack_drs4_serial(bytes: &[u8], out: &mut [u16]) {
    for (s, chunk) in out.chunks_mut(8).enumerate() {
        let t = unpack_triplet([word(bytes, 3 * s), word(bytes, 3 * s + 1), word(bytes, 3 * s + 2)]);
        chunk.copy_from_slice(&t[..chunk.len()]);
    }
}

/// Inverse of [`unpack_triplet`], for building frames.
pub fn pack_triplet(s: [u16; 8]) -> [u32; 3] {
    let mut bits = 0u128;
    for (k, v) in s.iter().enumerate() {
        bits |= ((*v as u128) & 0xFFF) << (DRS4_SAMPLE_BITS as usize * k);
    }
    [bits as u32, (bits >> 32) as u32, (bits >> 64) as u32]
}

/// Inverse of [`unpack_psd`] for one word, with no probe bits set.
pub fn pack_psd(even: u16, odd: u16) -> u32 {
    (even as u32 & PSD_SAMPLE_MASK) | ((odd as u32 & PSD_SAMPLE_MASK) << 16)
}
