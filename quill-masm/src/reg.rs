//! Register model
//!
//! The target is a MIPS-flavoured 32-bit RISC register file. The code
//! generator partitions it as follows:
//!
//! - `a0..a3`, `t0..t3`: allocatable to virtual-frame elements
//! - `t4..t6`: code-generator scratch, never frame-allocated
//! - `t8`, `t9`: reserved pair for materializing condition operands
//! - `v0`: call results; `cp` the context; `at` belongs to the assembler

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reg {
    Zero,
    At,
    V0,
    V1,
    A0,
    A1,
    A2,
    A3,
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
    T7,
    T8,
    T9,
    Cp,
    Fp,
    Sp,
    Ra,
}

impl Reg {
    /// Registers the virtual frame may hand out to elements.
    pub const ALLOCATABLE: [Reg; 8] = [
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::T0,
        Reg::T1,
        Reg::T2,
        Reg::T3,
    ];

    pub const SCRATCH0: Reg = Reg::T4;
    pub const SCRATCH1: Reg = Reg::T5;
    pub const SCRATCH2: Reg = Reg::T6;

    /// Condition-operand pair: a pending condition compares CMP_LHS
    /// against CMP_RHS (or an immediate).
    pub const CMP_LHS: Reg = Reg::T8;
    pub const CMP_RHS: Reg = Reg::T9;

    pub fn is_allocatable(self) -> bool {
        Reg::ALLOCATABLE.contains(&self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg::Zero => "zero",
            Reg::At => "at",
            Reg::V0 => "v0",
            Reg::V1 => "v1",
            Reg::A0 => "a0",
            Reg::A1 => "a1",
            Reg::A2 => "a2",
            Reg::A3 => "a3",
            Reg::T0 => "t0",
            Reg::T1 => "t1",
            Reg::T2 => "t2",
            Reg::T3 => "t3",
            Reg::T4 => "t4",
            Reg::T5 => "t5",
            Reg::T6 => "t6",
            Reg::T7 => "t7",
            Reg::T8 => "t8",
            Reg::T9 => "t9",
            Reg::Cp => "cp",
            Reg::Fp => "fp",
            Reg::Sp => "sp",
            Reg::Ra => "ra",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_display() {
        assert_eq!(format!("{}", Reg::Zero), "zero");
        assert_eq!(format!("{}", Reg::A0), "a0");
        assert_eq!(format!("{}", Reg::Cp), "cp");
        assert_eq!(format!("{}", Reg::Sp), "sp");
    }

    #[test]
    fn test_partitions_disjoint() {
        assert!(!Reg::ALLOCATABLE.contains(&Reg::SCRATCH0));
        assert!(!Reg::ALLOCATABLE.contains(&Reg::CMP_LHS));
        assert!(!Reg::ALLOCATABLE.contains(&Reg::CMP_RHS));
        assert!(!Reg::ALLOCATABLE.contains(&Reg::V0));
        assert!(Reg::A2.is_allocatable());
        assert!(!Reg::Fp.is_allocatable());
    }
}
