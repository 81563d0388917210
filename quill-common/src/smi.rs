//! Tagged small integers
//!
//! The Quill heap distinguishes pointers from small integers by the low bit
//! of a 32-bit word: heap pointers carry tag 1, small integers (smis) carry
//! tag 0 with the signed payload in the upper 31 bits. Tagging is therefore
//! a left shift by one, and untagged arithmetic on tagged words is valid for
//! addition and subtraction as long as the result still fits.
//!
//! The code generator's inlined arithmetic leans on this representation:
//! smi checks are an AND with the tag mask, add/sub overflow is detected on
//! the tagged words directly, and shifts untag, operate, and retag.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the tag in bits.
pub const TAG_SIZE: u32 = 1;
/// Tag value carried by small integers.
pub const SMI_TAG: i32 = 0;
/// Tag value carried by heap object pointers.
pub const HEAP_OBJECT_TAG: i32 = 1;
/// Mask selecting the tag bit.
pub const TAG_MASK: i32 = 1;

/// A 31-bit signed small integer, stored untagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Smi(i32);

impl Smi {
    pub const MIN: Smi = Smi(-(1 << 30));
    pub const MAX: Smi = Smi((1 << 30) - 1);

    pub const ZERO: Smi = Smi(0);

    /// True if `value` is representable as a smi.
    pub fn fits(value: i32) -> bool {
        value >= Self::MIN.0 && value <= Self::MAX.0
    }

    /// Wrap an i32, or `None` if it needs a heap number.
    pub fn new(value: i32) -> Option<Smi> {
        if Self::fits(value) {
            Some(Smi(value))
        } else {
            None
        }
    }

    /// The untagged signed value.
    pub fn value(self) -> i32 {
        self.0
    }

    /// The tagged 32-bit word as the heap sees it.
    pub fn to_tagged(self) -> i32 {
        self.0 << TAG_SIZE
    }

    /// Reconstruct from a tagged word. Panics on a heap-object tag in
    /// debug builds; the callers own the smi check.
    pub fn from_tagged(word: i32) -> Smi {
        debug_assert_eq!(word & TAG_MASK, SMI_TAG);
        Smi(word >> TAG_SIZE)
    }

    /// Tagged addition with overflow detection, mirroring the emitted
    /// fast path (add the tagged words, check the sign rule).
    pub fn checked_add(self, other: Smi) -> Option<Smi> {
        let sum = (self.to_tagged() as i64) + (other.to_tagged() as i64);
        if sum >= i32::MIN as i64 && sum <= i32::MAX as i64 {
            Some(Smi::from_tagged(sum as i32))
        } else {
            None
        }
    }

    pub fn checked_sub(self, other: Smi) -> Option<Smi> {
        let diff = (self.to_tagged() as i64) - (other.to_tagged() as i64);
        if diff >= i32::MIN as i64 && diff <= i32::MAX as i64 {
            Some(Smi::from_tagged(diff as i32))
        } else {
            None
        }
    }

    pub fn checked_mul(self, other: Smi) -> Option<Smi> {
        let product = (self.0 as i64) * (other.0 as i64);
        if product >= Self::MIN.0 as i64 && product <= Self::MAX.0 as i64 {
            Some(Smi(product as i32))
        } else {
            None
        }
    }
}

impl fmt::Display for Smi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_range() {
        assert!(Smi::fits(0));
        assert!(Smi::fits(Smi::MAX.value()));
        assert!(Smi::fits(Smi::MIN.value()));
        assert!(!Smi::fits(Smi::MAX.value() + 1));
        assert!(!Smi::fits(Smi::MIN.value() - 1));
    }

    #[test]
    fn test_tagging_round_trip() {
        for v in [0, 1, -1, 42, Smi::MIN.value(), Smi::MAX.value()] {
            let smi = Smi::new(v).unwrap();
            assert_eq!(smi.to_tagged() & TAG_MASK, SMI_TAG);
            assert_eq!(Smi::from_tagged(smi.to_tagged()), smi);
        }
    }

    #[test]
    fn test_checked_add_boundaries() {
        let max = Smi::MAX;
        let one = Smi::new(1).unwrap();
        assert_eq!(max.checked_add(one), None);
        assert_eq!(
            max.checked_add(Smi::new(-1).unwrap()),
            Smi::new(Smi::MAX.value() - 1)
        );
        assert_eq!(Smi::MIN.checked_sub(one), None);
    }

    #[test]
    fn test_checked_mul() {
        let a = Smi::new(1 << 15).unwrap();
        assert_eq!(a.checked_mul(a), None);
        assert_eq!(
            Smi::new(3).unwrap().checked_mul(Smi::new(7).unwrap()),
            Smi::new(21)
        );
    }
}
