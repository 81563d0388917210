//! Operands, memory operands, condition codes and root constants

use crate::reg::Reg;
use quill_common::Smi;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A heap constant referenced symbolically from the instruction stream.
/// The encoder resolves these against the heap when it materializes the
/// code object; the generator never sees raw addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Smi(Smi),
    Number(f64),
    Str(String),
    Bool(bool),
    Undefined,
    Null,
    TheHole,
    /// Shared function info for a nested function literal.
    FunctionInfo(u32),
    /// Boilerplate descriptor for an object or array literal.
    LiteralBoilerplate(u32),
    /// Name/flag pairs for a batched global declaration call.
    DeclarationPairs(Vec<(String, bool)>),
}

impl Constant {
    pub fn is_smi(&self) -> bool {
        matches!(self, Constant::Smi(_))
    }

    /// The tagged smi payload, if this constant is one.
    pub fn smi_value(&self) -> Option<Smi> {
        match self {
            Constant::Smi(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_the_hole(&self) -> bool {
        matches!(self, Constant::TheHole)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Smi(s) => write!(f, "{}", s),
            Constant::Number(n) => write!(f, "{:?}", n),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Undefined => write!(f, "undefined"),
            Constant::Null => write!(f, "null"),
            Constant::TheHole => write!(f, "<the hole>"),
            Constant::FunctionInfo(id) => write!(f, "<function-info {}>", id),
            Constant::LiteralBoilerplate(id) => write!(f, "<boilerplate {}>", id),
            Constant::DeclarationPairs(pairs) => write!(f, "<declarations x{}>", pairs.len()),
        }
    }
}

/// The right-hand side of ALU and branch instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
    Smi(Smi),
    Const(Constant),
}

impl Operand {
    pub fn zero() -> Operand {
        Operand::Reg(Reg::Zero)
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Operand {
        Operand::Reg(r)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(i) => write!(f, "{}", i),
            Operand::Smi(s) => write!(f, "smi({})", s),
            Operand::Const(c) => write!(f, "const({})", c),
        }
    }
}

/// Base register plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemOperand {
    pub base: Reg,
    pub offset: i32,
}

impl MemOperand {
    pub fn new(base: Reg, offset: i32) -> MemOperand {
        MemOperand { base, offset }
    }
}

/// Untagging field access: heap pointers carry a low tag bit, so field
/// loads subtract it from the object-model offset.
pub fn field(base: Reg, offset: i32) -> MemOperand {
    MemOperand::new(base, offset - quill_common::smi::HEAP_OBJECT_TAG)
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}{:+}]", self.base, self.offset)
    }
}

/// Branch conditions. `lo`/`hs`/`ls`/`hi` are the unsigned orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Lo,
    Hs,
    Ls,
    Hi,
}

impl Condition {
    /// The condition that holds exactly when `self` does not.
    pub fn negate(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
            Condition::Lo => Condition::Hs,
            Condition::Hs => Condition::Lo,
            Condition::Hi => Condition::Ls,
            Condition::Ls => Condition::Hi,
        }
    }

    /// The condition with its operands swapped (`a < b` becomes `b > a`).
    pub fn reverse(self) -> Condition {
        match self {
            Condition::Eq => Condition::Eq,
            Condition::Ne => Condition::Ne,
            Condition::Lt => Condition::Gt,
            Condition::Gt => Condition::Lt,
            Condition::Le => Condition::Ge,
            Condition::Ge => Condition::Le,
            Condition::Lo => Condition::Hi,
            Condition::Hi => Condition::Lo,
            Condition::Ls => Condition::Hs,
            Condition::Hs => Condition::Ls,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Lt => "lt",
            Condition::Gt => "gt",
            Condition::Le => "le",
            Condition::Ge => "ge",
            Condition::Lo => "lo",
            Condition::Hs => "hs",
            Condition::Ls => "ls",
            Condition::Hi => "hi",
        };
        write!(f, "{}", name)
    }
}

/// Well-known heap values reachable from the roots array. Loading one is
/// a single indexed load the encoder resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootIndex {
    Undefined,
    Null,
    True,
    False,
    TheHole,
    StackLimit,
    HeapNumberMap,
    FixedArrayMap,
}

impl fmt::Display for RootIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RootIndex::Undefined => "undefined",
            RootIndex::Null => "null",
            RootIndex::True => "true",
            RootIndex::False => "false",
            RootIndex::TheHole => "the-hole",
            RootIndex::StackLimit => "stack-limit",
            RootIndex::HeapNumberMap => "heap-number-map",
            RootIndex::FixedArrayMap => "fixed-array-map",
        };
        write!(f, "root:{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_negate_is_involution() {
        let all = [
            Condition::Eq,
            Condition::Ne,
            Condition::Lt,
            Condition::Gt,
            Condition::Le,
            Condition::Ge,
            Condition::Lo,
            Condition::Hs,
            Condition::Ls,
            Condition::Hi,
        ];
        for cond in all {
            assert_eq!(cond.negate().negate(), cond);
            assert_eq!(cond.reverse().reverse(), cond);
        }
    }

    #[test]
    fn test_field_untags() {
        let mem = field(Reg::A0, 8);
        assert_eq!(mem, MemOperand::new(Reg::A0, 7));
        assert_eq!(format!("{}", mem), "[a0+7]");
    }

    #[test]
    fn test_operand_display() {
        assert_eq!(format!("{}", Operand::Reg(Reg::T3)), "t3");
        assert_eq!(format!("{}", Operand::Imm(-4)), "-4");
        assert_eq!(
            format!("{}", Operand::Const(Constant::Undefined)),
            "const(undefined)"
        );
    }
}
