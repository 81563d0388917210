//! Identifiers for the runtime collaborators of generated code
//!
//! Generated code leaves its fast paths through four kinds of calls:
//! runtime functions (C++-side helpers), code stubs (shared generated
//! snippets keyed by their parameters), builtins, and inline caches.
//! The code generator only names them; their bodies live elsewhere.

use crate::operand::Condition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime functions callable from generated code. Arguments are passed
/// on the stack; the result comes back in `v0` with the stack unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeFn {
    DeclareGlobals,
    DeclareContextSlot,
    InitializeConstContextSlot,
    LoadContextSlot,
    LoadContextSlotNoReferenceError,
    StoreContextSlot,
    Throw,
    ReThrow,
    TypeOf,
    CreateObjectLiteral,
    CreateObjectLiteralShallow,
    CreateArrayLiteral,
    CreateArrayLiteralShallow,
    SetProperty,
    GetPropertyNamesFast,
    ResolvePossiblyDirectEval,
    MathPow,
    MathSqrt,
    ObjectEquals,
}

impl fmt::Display for RuntimeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Whether a binary-op stub may reuse one of its heap-number inputs for
/// the result instead of allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverwriteMode {
    NoOverwrite,
    OverwriteLeft,
    OverwriteRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StubBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StubUnaryOp {
    Negate,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgumentsAccessKind {
    NewObject,
    ReadLength,
}

/// Shared generated code snippets, keyed by their parameters. A stub call
/// consumes its stack arguments and returns in `v0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stub {
    GenericBinaryOp {
        op: StubBinOp,
        mode: OverwriteMode,
        /// Known-smi right operand the stub specializes on, when the
        /// generator kept it unmaterialized.
        constant_rhs: Option<i32>,
    },
    GenericUnaryOp {
        op: StubUnaryOp,
        mode: OverwriteMode,
    },
    Compare {
        cond: Condition,
        strict: bool,
    },
    ToBoolean,
    InstanceOf,
    /// Box an untagged int32 (in `a0`) into a fresh heap number.
    WriteInt32ToHeapNumber,
    /// Box an untagged uint32 (in `a0`) into a fresh heap number. The
    /// logical-shift answer is an unsigned word and must not be
    /// sign-extended when converted.
    WriteUint32ToHeapNumber,
    StackCheck,
    FastNewClosure,
    FastNewContext {
        slots: u32,
    },
    ArgumentsAccess(ArgumentsAccessKind),
    CallFunction {
        argc: u32,
    },
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stub::GenericBinaryOp {
                op,
                mode,
                constant_rhs,
            } => {
                write!(f, "GenericBinaryOp({:?}, {:?}", op, mode)?;
                if let Some(rhs) = constant_rhs {
                    write!(f, ", rhs={}", rhs)?;
                }
                write!(f, ")")
            }
            Stub::GenericUnaryOp { op, mode } => write!(f, "GenericUnaryOp({:?}, {:?})", op, mode),
            Stub::Compare { cond, strict } => {
                write!(f, "Compare({}{})", cond, if *strict { ", strict" } else { "" })
            }
            Stub::ToBoolean => write!(f, "ToBoolean"),
            Stub::InstanceOf => write!(f, "InstanceOf"),
            Stub::WriteInt32ToHeapNumber => write!(f, "WriteInt32ToHeapNumber"),
            Stub::WriteUint32ToHeapNumber => write!(f, "WriteUint32ToHeapNumber"),
            Stub::StackCheck => write!(f, "StackCheck"),
            Stub::FastNewClosure => write!(f, "FastNewClosure"),
            Stub::FastNewContext { slots } => write!(f, "FastNewContext({})", slots),
            Stub::ArgumentsAccess(kind) => write!(f, "ArgumentsAccess({:?})", kind),
            Stub::CallFunction { argc } => write!(f, "CallFunction({})", argc),
        }
    }
}

/// Builtins invoked through the builtin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    ToObject,
    ToNumber,
    FilterKey,
    Delete,
    In,
    JsConstructCall,
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Inline caches. A call site is followed by a patchable marker so the
/// runtime can rewrite the cache in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IcKind {
    Load { name: String, contextual: bool },
    KeyedLoad,
    Store { name: String },
    KeyedStore,
    Call { name: String, argc: u32 },
}

impl fmt::Display for IcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcKind::Load { name, contextual } => {
                write!(f, "LoadIC({:?}{})", name, if *contextual { ", contextual" } else { "" })
            }
            IcKind::KeyedLoad => write!(f, "KeyedLoadIC"),
            IcKind::Store { name } => write!(f, "StoreIC({:?})", name),
            IcKind::KeyedStore => write!(f, "KeyedStoreIC"),
            IcKind::Call { name, argc } => write!(f, "CallIC({:?}, {})", name, argc),
        }
    }
}
