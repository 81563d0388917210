//! Quill VM - Symbolic Macro Assembler Interface
//!
//! This crate defines the emission interface between the code generator and
//! the external instruction encoder: the 32-bit RISC register model,
//! operands and condition codes, the symbolic instruction stream with
//! labels and relocation-style markers, identifiers for the runtime
//! collaborators the generated code calls into (runtime functions, code
//! stubs, builtins, inline caches), and the object-model field-offset
//! contract consumed by inlined fast paths.
//!
//! Nothing in this crate encodes machine words; the stream is handed to the
//! encoder either through the typed API or serialized as JSON.

pub mod instr;
pub mod layout;
pub mod masm;
pub mod operand;
pub mod reg;
pub mod runtime;

pub use instr::{HandlerKind, Instr, Label};
pub use masm::MacroAssembler;
pub use operand::{field, Condition, Constant, MemOperand, Operand, RootIndex};
pub use reg::Reg;
pub use runtime::{
    ArgumentsAccessKind, Builtin, IcKind, OverwriteMode, RuntimeFn, Stub, StubBinOp, StubUnaryOp,
};
