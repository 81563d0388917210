//! Macro assembler
//!
//! Owns the linear instruction stream and the label allocator, and exposes
//! one emitting method per instruction form plus a handful of composite
//! helpers (smi tag/untag). Labels are bound at most once; binding twice is
//! a defect in the caller.

use crate::instr::{HandlerKind, Instr, Label};
use crate::layout;
use crate::operand::{field, Condition, MemOperand, Operand, RootIndex};
use crate::reg::Reg;
use crate::runtime::{Builtin, IcKind, RuntimeFn, Stub};
use quill_common::{smi, SourcePos};

#[derive(Debug, Default)]
pub struct MacroAssembler {
    instrs: Vec<Instr>,
    bound: Vec<bool>,
    last_position: Option<SourcePos>,
}

impl MacroAssembler {
    pub fn new() -> MacroAssembler {
        MacroAssembler::default()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn into_instructions(self) -> Vec<Instr> {
        self.instrs
    }

    /// Assembly-listing form, one instruction per line.
    pub fn to_listing(&self) -> String {
        let mut out = String::new();
        for instr in &self.instrs {
            out.push_str(&instr.to_string());
            out.push('\n');
        }
        out
    }

    /// The stream serialized for the encoder boundary.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.instrs)
    }

    pub fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn new_label(&mut self) -> Label {
        let id = self.bound.len() as u32;
        self.bound.push(false);
        Label(id)
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.bound[label.0 as usize]
    }

    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.bound[label.0 as usize];
        assert!(!*slot, "label {} bound twice", label);
        *slot = true;
        self.emit(Instr::Bind(label));
    }

    // ALU

    pub fn add(&mut self, rd: Reg, rs: Reg, op: Operand) {
        self.emit(Instr::Add(rd, rs, op));
    }

    pub fn sub(&mut self, rd: Reg, rs: Reg, op: Operand) {
        self.emit(Instr::Sub(rd, rs, op));
    }

    pub fn and_(&mut self, rd: Reg, rs: Reg, op: Operand) {
        self.emit(Instr::And(rd, rs, op));
    }

    pub fn or_(&mut self, rd: Reg, rs: Reg, op: Operand) {
        self.emit(Instr::Or(rd, rs, op));
    }

    pub fn xor_(&mut self, rd: Reg, rs: Reg, op: Operand) {
        self.emit(Instr::Xor(rd, rs, op));
    }

    pub fn sll(&mut self, rd: Reg, rs: Reg, sa: u8) {
        self.emit(Instr::Sll(rd, rs, sa));
    }

    pub fn srl(&mut self, rd: Reg, rs: Reg, sa: u8) {
        self.emit(Instr::Srl(rd, rs, sa));
    }

    pub fn sra(&mut self, rd: Reg, rs: Reg, sa: u8) {
        self.emit(Instr::Sra(rd, rs, sa));
    }

    pub fn srlv(&mut self, rd: Reg, rs: Reg, rt: Reg) {
        self.emit(Instr::Srlv(rd, rs, rt));
    }

    pub fn mov(&mut self, rd: Reg, rs: Reg) {
        if rd != rs {
            self.emit(Instr::Mov(rd, rs));
        }
    }

    pub fn li(&mut self, rd: Reg, op: Operand) {
        self.emit(Instr::LoadImm(rd, op));
    }

    pub fn load_root(&mut self, rd: Reg, root: RootIndex) {
        self.emit(Instr::LoadRoot(rd, root));
    }

    // Memory

    pub fn lw(&mut self, rd: Reg, mem: MemOperand) {
        self.emit(Instr::Lw(rd, mem));
    }

    pub fn sw(&mut self, rs: Reg, mem: MemOperand) {
        self.emit(Instr::Sw(rs, mem));
    }

    pub fn lbu(&mut self, rd: Reg, mem: MemOperand) {
        self.emit(Instr::Lbu(rd, mem));
    }

    pub fn push(&mut self, rs: Reg) {
        self.emit(Instr::Push(rs));
    }

    pub fn pop(&mut self, rd: Reg) {
        self.emit(Instr::Pop(rd));
    }

    pub fn add_sp(&mut self, bytes: i32) {
        if bytes != 0 {
            self.emit(Instr::AddSp(bytes));
        }
    }

    // Control flow

    pub fn branch(&mut self, cond: Condition, lhs: Reg, rhs: Operand, label: Label) {
        self.emit(Instr::Branch(cond, lhs, rhs, label));
    }

    pub fn jump(&mut self, label: Label) {
        self.emit(Instr::Jump(label));
    }

    // Calls

    pub fn call_stub(&mut self, stub: Stub) {
        self.emit(Instr::CallStub(stub));
    }

    pub fn call_runtime(&mut self, id: RuntimeFn, argc: u32) {
        self.emit(Instr::CallRuntime(id, argc));
    }

    pub fn call_builtin(&mut self, id: Builtin, argc: u32) {
        self.emit(Instr::CallBuiltin(id, argc));
    }

    pub fn call_ic(&mut self, kind: IcKind) {
        self.emit(Instr::CallIc(kind));
    }

    // Frames and handlers

    pub fn enter_frame(&mut self) {
        self.emit(Instr::EnterFrame);
    }

    pub fn exit_frame(&mut self) {
        self.emit(Instr::ExitFrame);
    }

    pub fn ret(&mut self, argc: u32) {
        self.emit(Instr::Ret(argc));
    }

    pub fn record_write(&mut self, object: Reg, offset: i32, value: Reg, scratch: Reg) {
        self.emit(Instr::RecordWrite {
            object,
            offset,
            value,
            scratch,
        });
    }

    /// Install a handler record; exceptions thrown while it is the
    /// innermost handler resume at `resume` with the value in `v0`.
    pub fn push_try_handler(&mut self, kind: HandlerKind, resume: Label) {
        self.emit(Instr::PushTryHandler(kind, resume));
    }

    /// Unwind sp to the innermost handler record and unlink it.
    pub fn pop_try_handler(&mut self) {
        self.emit(Instr::PopTryHandler);
    }

    // Annotations

    pub fn comment(&mut self, text: impl Into<String>) {
        self.emit(Instr::Comment(text.into()));
    }

    /// Record a source position; consecutive duplicates are dropped.
    pub fn position(&mut self, pos: SourcePos) {
        if pos.is_none() || self.last_position == Some(pos) {
            return;
        }
        self.last_position = Some(pos);
        self.emit(Instr::Position(pos));
    }

    pub fn inline_marker(&mut self) {
        self.emit(Instr::InlinePatchMarker);
    }

    // Composite helpers

    /// Tag an untagged integer in place.
    pub fn smi_tag(&mut self, rd: Reg, rs: Reg) {
        self.sll(rd, rs, smi::TAG_SIZE as u8);
    }

    /// Untag a smi in place (arithmetic shift keeps the sign).
    pub fn smi_untag(&mut self, rd: Reg, rs: Reg) {
        self.sra(rd, rs, smi::TAG_SIZE as u8);
    }

    /// Branch if `reg` holds a heap object rather than a smi.
    pub fn branch_if_not_smi(&mut self, reg: Reg, scratch: Reg, label: Label) {
        self.and_(scratch, reg, Operand::Imm(smi::TAG_MASK));
        self.branch(Condition::Ne, scratch, Operand::zero(), label);
    }

    /// Branch if `reg` holds a smi.
    pub fn branch_if_smi(&mut self, reg: Reg, scratch: Reg, label: Label) {
        self.and_(scratch, reg, Operand::Imm(smi::TAG_MASK));
        self.branch(Condition::Eq, scratch, Operand::zero(), label);
    }

    /// Truncate the double in `heap_number` toward zero into `dest`,
    /// branching to `not_int32` when the value has no signed 32-bit
    /// rendering (too large, NaN or infinity). Manual exponent
    /// arithmetic; no floating-point unit is assumed.
    pub fn convert_heap_number_to_int32(
        &mut self,
        dest: Reg,
        heap_number: Reg,
        scratch1: Reg,
        scratch2: Reg,
        not_int32: Label,
    ) {
        let done = self.new_label();
        // Sign, biased exponent and the top mantissa bits.
        self.lw(
            scratch1,
            field(heap_number, layout::HEAP_NUMBER_EXPONENT_OFFSET),
        );
        self.srl(scratch2, scratch1, layout::HEAP_NUMBER_EXPONENT_SHIFT);
        self.and_(
            scratch2,
            scratch2,
            Operand::Imm(layout::HEAP_NUMBER_EXPONENT_MASK),
        );
        // Magnitudes of 2^31 and up have no int32 rendering; NaN and
        // infinity carry the all-ones exponent and land here too.
        self.branch(
            Condition::Ge,
            scratch2,
            Operand::Imm(layout::HEAP_NUMBER_EXPONENT_BIAS + 31),
            not_int32,
        );
        // Below one everything truncates to zero.
        self.mov(dest, Reg::Zero);
        self.branch(
            Condition::Lt,
            scratch2,
            Operand::Imm(layout::HEAP_NUMBER_EXPONENT_BIAS),
            done,
        );
        // Right-shift distance leaving only the integer part: 31 for an
        // exponent of zero, down to 1 for an exponent of 30.
        self.li(
            dest,
            Operand::Imm(layout::HEAP_NUMBER_EXPONENT_BIAS + 31),
        );
        self.sub(scratch2, dest, Operand::Reg(scratch2));
        // Assemble the top 32 mantissa bits with the implicit one at
        // the top, then shift the integer part down.
        self.sll(dest, scratch1, 31 - layout::HEAP_NUMBER_EXPONENT_SHIFT);
        self.or_(dest, dest, Operand::Imm(0x8000_0000u32 as i32));
        self.lw(
            scratch1,
            field(heap_number, layout::HEAP_NUMBER_MANTISSA_OFFSET),
        );
        self.srl(scratch1, scratch1, layout::HEAP_NUMBER_EXPONENT_SHIFT + 1);
        self.or_(dest, dest, Operand::Reg(scratch1));
        self.srlv(dest, dest, scratch2);
        // The sign lives in the exponent word.
        self.lw(
            scratch1,
            field(heap_number, layout::HEAP_NUMBER_EXPONENT_OFFSET),
        );
        self.branch(Condition::Ge, scratch1, Operand::zero(), done);
        self.sub(dest, Reg::Zero, Operand::Reg(dest));
        self.bind(done);
    }
}
