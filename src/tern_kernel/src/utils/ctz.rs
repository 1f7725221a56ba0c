//! Count trailing zeros
//!
//! On most targets `u32::trailing_zeros` lowers to a single instruction
//! (`CTZ`, `TZCNT`, or `CLZ` + `RBIT`). Armv6-M and pre-Thumb-2 Arm targets
//! have none of these, and the compiler-emitted fallback is a generic
//! branchy routine, so a de Bruijn multiply-and-look-up is used there
//! instead.

/// Indicates whether the target can count leading or trailing zeros in a
/// constant number of instructions.
const HAS_CTZ: bool = if cfg!(target_arch = "arm") {
    // Thumb-2
    cfg!(target_feature = "v6t2")
        // Armv5TE and later, only in Arm mode
        || (cfg!(target_feature = "v5te") && !cfg!(target_feature = "thumb-mode"))
} else {
    true
};

const DEBRUIJN_MUL: u32 = 0x077c_b531;

const DEBRUIJN_TABLE: [u8; 32] = [
    0, 1, 28, 2, 29, 14, 24, 3, 30, 22, 20, 15, 25, 17, 4, 8, 31, 27, 13, 23, 21, 19, 16, 7, 26,
    12, 18, 6, 11, 5, 10, 9,
];

/// Return the number of trailing zeros in `x`, or `32` if `x` is zero.
#[inline]
pub(crate) fn trailing_zeros(x: u32) -> u32 {
    if HAS_CTZ {
        x.trailing_zeros()
    } else if x == 0 {
        32
    } else {
        let lsb = x & x.wrapping_neg();
        DEBRUIJN_TABLE[(lsb.wrapping_mul(DEBRUIJN_MUL) >> 27) as usize] as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctz_portable(x: u32) -> u32 {
        if x == 0 {
            32
        } else {
            let lsb = x & x.wrapping_neg();
            DEBRUIJN_TABLE[(lsb.wrapping_mul(DEBRUIJN_MUL) >> 27) as usize] as u32
        }
    }

    #[test]
    fn zero() {
        assert_eq!(trailing_zeros(0), 32);
        assert_eq!(ctz_portable(0), 32);
    }

    #[quickcheck_macros::quickcheck]
    fn matches_intrinsic(x: u32) -> bool {
        ctz_portable(x) == x.trailing_zeros()
    }
}
