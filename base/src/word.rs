//! Helpers for working with the machine's 36-bit words.
//!
//! Main memory cells, registers and instruction words are all 36 bits
//! wide.  We carry them in the low 36 bits of a `u64` and mask at the
//! boundaries; the processor documentation numbers bits 0..35 from the
//! most significant end, so this module also provides accessors in
//! that numbering to keep the pack/unpack code readable next to the
//! hardware manuals.

/// The low 36 bits, all ones.
pub const MASK36: u64 = (1 << 36) - 1;

/// The low 18 bits, all ones.
pub const MASK18: u64 = (1 << 18) - 1;

/// The low 15 bits, all ones (segment numbers are 15 bits).
pub const MASK15: u64 = (1 << 15) - 1;

/// A mask covering the low `n` bits.
pub const fn mask_bits(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1 << n) - 1 }
}

/// The upper half of a 36-bit word.
pub fn upper_half(w: u64) -> u64 {
    (w >> 18) & MASK18
}

/// The lower half of a 36-bit word.
pub fn lower_half(w: u64) -> u64 {
    w & MASK18
}

/// Join two 18-bit halves into a 36-bit word.
pub fn join_halves(upper: u64, lower: u64) -> u64 {
    ((upper & MASK18) << 18) | (lower & MASK18)
}

/// Extract bit `n` of a 36-bit word, with bit 0 being the most
/// significant bit as in the processor manuals.
pub fn bit36(w: u64, n: u32) -> bool {
    debug_assert!(n < 36);
    (w >> (35 - n)) & 1 != 0
}

/// Set or clear bit `n` (manual numbering) of a 36-bit word.
pub fn with_bit36(w: u64, n: u32, value: bool) -> u64 {
    debug_assert!(n < 36);
    let mask = 1 << (35 - n);
    if value { w | mask } else { w & !mask }
}

/// Extract `len` bits starting at bit `start` (manual numbering, so
/// `field36(w, 0, 3)` is the three most significant bits).
pub fn field36(w: u64, start: u32, len: u32) -> u64 {
    debug_assert!(start + len <= 36);
    (w >> (36 - start - len)) & mask_bits(len)
}

/// Deposit `value` into the `len`-bit field starting at bit `start`
/// (manual numbering).
pub fn set_field36(w: u64, start: u32, len: u32, value: u64) -> u64 {
    debug_assert!(start + len <= 36);
    let shift = 36 - start - len;
    let mask = mask_bits(len) << shift;
    (w & !mask) | ((value & mask_bits(len)) << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves() {
        let w = 0o123456_701234_u64;
        assert_eq!(upper_half(w), 0o123456);
        assert_eq!(lower_half(w), 0o701234);
        assert_eq!(join_halves(0o123456, 0o701234), w);
    }

    #[test]
    fn test_bit_numbering_is_msb_first() {
        // Bit 0 is the 2^35 bit.
        assert!(bit36(1 << 35, 0));
        assert!(!bit36(1 << 35, 35));
        assert!(bit36(1, 35));
    }

    #[test]
    fn test_field_roundtrip() {
        let w = set_field36(0, 18, 10, 0o755);
        assert_eq!(field36(w, 18, 10), 0o755);
        // The opcode field of an instruction word sits at bits 18..27.
        assert_eq!(w, 0o755 << 8);
    }

    #[test]
    fn test_with_bit36() {
        let w = with_bit36(0, 28, true);
        assert!(bit36(w, 28));
        assert_eq!(with_bit36(w, 28, false), 0);
    }
}
