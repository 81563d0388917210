//! Symbolic instruction stream
//!
//! Instructions carry registers, operands and label ids; the encoder turns
//! them into machine words and resolves labels, roots and constants.
//! `Bind`, `Comment`, `Position` and `InlinePatchMarker` are pseudo
//! entries: the first anchors a label, the last pads an inline-cache site
//! so the runtime can patch it, and the middle two only annotate.

use crate::operand::{Condition, MemOperand, Operand, RootIndex};
use crate::reg::Reg;
use crate::runtime::{Builtin, IcKind, RuntimeFn, Stub};
use quill_common::SourcePos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A forward-referencable position in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Kind of try-handler record pushed on the handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    TryCatch,
    TryFinally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    // ALU, register/operand forms
    Add(Reg, Reg, Operand),
    Sub(Reg, Reg, Operand),
    And(Reg, Reg, Operand),
    Or(Reg, Reg, Operand),
    Xor(Reg, Reg, Operand),

    // Shifts; the count is an immediate except for `Srlv`, whose count
    // register is consumed modulo 32.
    Sll(Reg, Reg, u8),
    Srl(Reg, Reg, u8),
    Sra(Reg, Reg, u8),
    Srlv(Reg, Reg, Reg),

    Mov(Reg, Reg),
    LoadImm(Reg, Operand),
    LoadRoot(Reg, RootIndex),

    Lw(Reg, MemOperand),
    Sw(Reg, MemOperand),
    Lbu(Reg, MemOperand),

    Push(Reg),
    Pop(Reg),
    /// Adjust sp by a byte delta; positive drops slots.
    AddSp(i32),

    Branch(Condition, Reg, Operand, Label),
    Jump(Label),
    Bind(Label),

    CallStub(Stub),
    CallRuntime(RuntimeFn, u32),
    CallBuiltin(Builtin, u32),
    CallIc(IcKind),

    /// Push ra and caller fp, point fp at the saved fp.
    EnterFrame,
    /// Unwind to fp, restore caller fp and ra.
    ExitFrame,
    /// Return, dropping the receiver and `n` argument slots.
    Ret(u32),

    /// Write barrier for a field store into `object` at `offset`.
    RecordWrite {
        object: Reg,
        offset: i32,
        value: Reg,
        scratch: Reg,
    },

    /// Push a handler record chaining to the current innermost handler.
    /// A thrown exception unwinds to this record and resumes at the label
    /// with the exception object in `v0`.
    PushTryHandler(HandlerKind, Label),
    PopTryHandler,

    Comment(String),
    Position(SourcePos),
    InlinePatchMarker,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Add(rd, rs, op) => write!(f, "add {}, {}, {}", rd, rs, op),
            Instr::Sub(rd, rs, op) => write!(f, "sub {}, {}, {}", rd, rs, op),
            Instr::And(rd, rs, op) => write!(f, "and {}, {}, {}", rd, rs, op),
            Instr::Or(rd, rs, op) => write!(f, "or {}, {}, {}", rd, rs, op),
            Instr::Xor(rd, rs, op) => write!(f, "xor {}, {}, {}", rd, rs, op),
            Instr::Sll(rd, rs, sa) => write!(f, "sll {}, {}, {}", rd, rs, sa),
            Instr::Srl(rd, rs, sa) => write!(f, "srl {}, {}, {}", rd, rs, sa),
            Instr::Sra(rd, rs, sa) => write!(f, "sra {}, {}, {}", rd, rs, sa),
            Instr::Srlv(rd, rs, rt) => write!(f, "srlv {}, {}, {}", rd, rs, rt),
            Instr::Mov(rd, rs) => write!(f, "mov {}, {}", rd, rs),
            Instr::LoadImm(rd, op) => write!(f, "li {}, {}", rd, op),
            Instr::LoadRoot(rd, root) => write!(f, "lroot {}, {}", rd, root),
            Instr::Lw(rd, mem) => write!(f, "lw {}, {}", rd, mem),
            Instr::Sw(rs, mem) => write!(f, "sw {}, {}", rs, mem),
            Instr::Lbu(rd, mem) => write!(f, "lbu {}, {}", rd, mem),
            Instr::Push(rs) => write!(f, "push {}", rs),
            Instr::Pop(rd) => write!(f, "pop {}", rd),
            Instr::AddSp(delta) => write!(f, "addsp {}", delta),
            Instr::Branch(cond, lhs, rhs, label) => {
                write!(f, "b{} {}, {}, {}", cond, lhs, rhs, label)
            }
            Instr::Jump(label) => write!(f, "j {}", label),
            Instr::Bind(label) => write!(f, "{}:", label),
            Instr::CallStub(stub) => write!(f, "call stub:{}", stub),
            Instr::CallRuntime(id, argc) => write!(f, "call rt:{}({})", id, argc),
            Instr::CallBuiltin(id, argc) => write!(f, "call builtin:{}({})", id, argc),
            Instr::CallIc(kind) => write!(f, "call ic:{}", kind),
            Instr::EnterFrame => write!(f, "enter_frame"),
            Instr::ExitFrame => write!(f, "exit_frame"),
            Instr::Ret(argc) => write!(f, "ret {}", argc),
            Instr::RecordWrite {
                object,
                offset,
                value,
                scratch,
            } => write!(f, "record_write {}[{}], {} ({})", object, offset, value, scratch),
            Instr::PushTryHandler(kind, resume) => {
                write!(f, "push_try_handler {:?}, {}", kind, resume)
            }
            Instr::PopTryHandler => write!(f, "pop_try_handler"),
            Instr::Comment(text) => write!(f, "; {}", text),
            Instr::Position(pos) => write!(f, ";; {}", pos),
            Instr::InlinePatchMarker => write!(f, "nop ; patch site"),
        }
    }
}
