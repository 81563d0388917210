//! Deferred code
//!
//! Cold fallback paths are not emitted inline; the fast path branches to a
//! deferred block's entry label and the block jumps back to its exit label
//! when done. Blocks are collected on a work queue during the main walk
//! and flushed after the function body, so the hot code stays straight.
//!
//! A block snapshots the virtual frame at its creation point (minus the
//! operand registers its fast path had already popped). Its body saves the
//! live registers by spilling that snapshot, performs the slow call, moves
//! the result into the fast path's result register, restores the register
//! state by merging back, and jumps to the exit. The merge back requires
//! the snapshot to be a valid merge target, so creation sites make the
//! frame mergable before popping their operands.

use crate::ast::BinOp;
use crate::frame::VirtualFrame;
use quill_common::{SourcePos, Smi};
use quill_masm::{
    field, layout, Condition, IcKind, Label, MacroAssembler, Operand, OverwriteMode, Reg,
    RootIndex, Stub, StubBinOp,
};

pub fn stub_bin_op(op: BinOp) -> StubBinOp {
    match op {
        BinOp::Add => StubBinOp::Add,
        BinOp::Sub => StubBinOp::Sub,
        BinOp::Mul => StubBinOp::Mul,
        BinOp::Div => StubBinOp::Div,
        BinOp::Mod => StubBinOp::Mod,
        BinOp::BitOr => StubBinOp::BitOr,
        BinOp::BitAnd => StubBinOp::BitAnd,
        BinOp::BitXor => StubBinOp::BitXor,
        BinOp::Shl => StubBinOp::Shl,
        BinOp::Sar => StubBinOp::Sar,
        BinOp::Shr => StubBinOp::Shr,
        BinOp::Or | BinOp::And => unreachable!("logical operators have no stub"),
    }
}

#[derive(Debug)]
pub enum DeferredKind {
    /// Fallback for an inlined `value op constant` (or reversed) smi
    /// operation; the unchanged tagged input is in `tos` and the fast
    /// path's answer register is `result`.
    InlineSmiOperation {
        op: BinOp,
        value: Smi,
        reversed: bool,
        mode: OverwriteMode,
        tos: Reg,
        result: Reg,
    },
    /// Fallback for an inlined two-register smi operation; both tagged
    /// inputs are live.
    InlineBinaryOperation {
        op: BinOp,
        mode: OverwriteMode,
        lhs: Reg,
        rhs: Reg,
        result: Reg,
    },
    /// Fallbacks for inlined property-access fast paths. The call must
    /// be followed by the patch marker so the runtime can find and
    /// rewrite the inlined site.
    NamedLoad {
        receiver: Reg,
        result: Reg,
        name: String,
        is_contextual: bool,
    },
    NamedStore {
        receiver: Reg,
        value: Reg,
        name: String,
    },
    KeyedLoad {
        receiver: Reg,
        key: Reg,
        result: Reg,
    },
    KeyedStore {
        receiver: Reg,
        key: Reg,
        value: Reg,
    },
}

#[derive(Debug)]
pub struct DeferredBlock {
    pub entry: Label,
    pub exit: Label,
    /// Entry for bit operations whose input is a heap number rather
    /// than a smi.
    pub non_smi_input: Option<Label>,
    /// Entry for results that no longer fit a smi; the untagged int32
    /// answer is in the result register.
    pub answer_out_of_range: Option<Label>,
    frame: VirtualFrame,
    kind: DeferredKind,
    position: SourcePos,
}

impl DeferredBlock {
    pub fn new(
        masm: &mut MacroAssembler,
        frame: VirtualFrame,
        kind: DeferredKind,
        position: SourcePos,
    ) -> DeferredBlock {
        debug_assert!(frame.is_mergable(), "deferred snapshot must be a merge target");
        DeferredBlock {
            entry: masm.new_label(),
            exit: masm.new_label(),
            non_smi_input: None,
            answer_out_of_range: None,
            frame,
            kind,
            position,
        }
    }

    pub fn with_int32_entries(mut self, masm: &mut MacroAssembler) -> DeferredBlock {
        self.non_smi_input = Some(masm.new_label());
        self.answer_out_of_range = Some(masm.new_label());
        self
    }

    fn result_register(&self) -> Reg {
        match &self.kind {
            DeferredKind::InlineSmiOperation { result, .. } => *result,
            DeferredKind::InlineBinaryOperation { result, .. } => *result,
            DeferredKind::NamedLoad { result, .. } => *result,
            DeferredKind::NamedStore { value, .. } => *value,
            DeferredKind::KeyedLoad { result, .. } => *result,
            DeferredKind::KeyedStore { value, .. } => *value,
        }
    }

    /// Stub that boxes the untagged answer register. A logical shift
    /// produces an unsigned word; every other operation's answer is
    /// signed.
    fn boxing_stub(&self) -> Stub {
        match &self.kind {
            DeferredKind::InlineSmiOperation { op: BinOp::Shr, .. } => {
                Stub::WriteUint32ToHeapNumber
            }
            _ => Stub::WriteInt32ToHeapNumber,
        }
    }

    /// Emit the block body. Called once, after the main body of the
    /// function has been emitted.
    pub fn generate(self, masm: &mut MacroAssembler) {
        masm.position(self.position);
        masm.bind(self.entry);
        let mut work = self.frame.clone();
        work.spill_all(masm);

        match &self.kind {
            DeferredKind::InlineSmiOperation {
                op,
                value,
                reversed,
                mode,
                tos,
                ..
            } => {
                // Stub convention: left operand in a1, right in a0.
                if *reversed {
                    masm.mov(Reg::A0, *tos);
                    masm.li(Reg::A1, Operand::Smi(*value));
                } else {
                    masm.mov(Reg::A1, *tos);
                    masm.li(Reg::A0, Operand::Smi(*value));
                }
                masm.call_stub(Stub::GenericBinaryOp {
                    op: stub_bin_op(*op),
                    mode: *mode,
                    constant_rhs: if *reversed { None } else { Some(value.value()) },
                });
            }
            DeferredKind::InlineBinaryOperation { op, mode, lhs, rhs, .. } => {
                masm.push(*lhs);
                masm.push(*rhs);
                masm.pop(Reg::A0);
                masm.pop(Reg::A1);
                masm.call_stub(Stub::GenericBinaryOp {
                    op: stub_bin_op(*op),
                    mode: *mode,
                    constant_rhs: None,
                });
            }
            DeferredKind::NamedLoad {
                receiver,
                name,
                is_contextual,
                ..
            } => {
                masm.mov(Reg::A0, *receiver);
                masm.call_ic(IcKind::Load {
                    name: name.clone(),
                    contextual: *is_contextual,
                });
                masm.inline_marker();
            }
            DeferredKind::NamedStore {
                receiver,
                value,
                name,
            } => {
                masm.push(*receiver);
                masm.push(*value);
                masm.pop(Reg::A0);
                masm.pop(Reg::A1);
                masm.call_ic(IcKind::Store { name: name.clone() });
                masm.inline_marker();
            }
            DeferredKind::KeyedLoad { receiver, key, .. } => {
                masm.push(*receiver);
                masm.push(*key);
                masm.pop(Reg::A0);
                masm.pop(Reg::A1);
                masm.call_ic(IcKind::KeyedLoad);
                masm.inline_marker();
            }
            DeferredKind::KeyedStore {
                receiver,
                key,
                value,
            } => {
                masm.push(*receiver);
                masm.push(*key);
                masm.push(*value);
                masm.pop(Reg::A0);
                masm.pop(Reg::A1);
                masm.pop(Reg::A2);
                masm.call_ic(IcKind::KeyedStore);
                masm.inline_marker();
            }
        }

        let result = self.result_register();
        masm.mov(result, Reg::V0);
        let mut restored = work;
        restored.merge_to(masm, &self.frame);
        masm.jump(self.exit);

        if self.non_smi_input.is_some() {
            self.generate_non_smi_input(masm);
        }
        if self.answer_out_of_range.is_some() {
            self.generate_answer_out_of_range(masm);
        }
    }

    /// Secondary fast path for a bit operation whose input is a heap
    /// number: truncate it to an int32, redo the operation inline, and
    /// retag or box the answer. Anything else falls back to the generic
    /// stub through the main entry.
    fn generate_non_smi_input(&self, masm: &mut MacroAssembler) {
        let (op, value, tos, result) = match &self.kind {
            DeferredKind::InlineSmiOperation {
                op,
                value,
                tos,
                result,
                ..
            } => (*op, *value, *tos, *result),
            _ => unreachable!("int32 entries belong to inlined smi operations"),
        };
        masm.bind(self.non_smi_input.expect("entry requested"));

        // Not a heap number: only the generic stub can handle it.
        masm.lw(Reg::SCRATCH0, field(tos, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.load_root(Reg::SCRATCH1, RootIndex::HeapNumberMap);
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            self.entry,
        );

        // Doubles outside the signed 32-bit range go generic as well.
        let int32 = Reg::SCRATCH2;
        masm.convert_heap_number_to_int32(int32, tos, Reg::SCRATCH0, Reg::SCRATCH1, self.entry);

        let shift = (value.value() & 0x1f) as u8;
        let not_smi = masm.new_label();
        match op {
            BinOp::BitOr => masm.or_(int32, int32, Operand::Imm(value.value())),
            BinOp::BitAnd => masm.and_(int32, int32, Operand::Imm(value.value())),
            BinOp::BitXor => masm.xor_(int32, int32, Operand::Imm(value.value())),
            BinOp::Sar => {
                if shift > 0 {
                    masm.sra(int32, int32, shift);
                }
            }
            BinOp::Shl => {
                if shift > 0 {
                    masm.sll(int32, int32, shift);
                }
            }
            BinOp::Shr => {
                if shift > 0 {
                    masm.srl(int32, int32, shift);
                }
                // The unsigned answer must stay positive to be retagged.
                masm.branch(Condition::Lt, int32, Operand::zero(), not_smi);
            }
            _ => unreachable!("not a bit operation"),
        }

        // The operation itself may already bound the answer to the smi
        // range; otherwise check before retagging.
        let always_fits = op == BinOp::BitAnd
            || (op == BinOp::Sar && shift > 0)
            || (op == BinOp::Shr && shift > 1);
        if !always_fits {
            masm.add(Reg::SCRATCH0, int32, Operand::Imm(0x4000_0000));
            masm.branch(Condition::Lt, Reg::SCRATCH0, Operand::zero(), not_smi);
        }
        masm.smi_tag(result, int32);
        // Only scratch registers and the result were touched, so the
        // machine state still matches the snapshot.
        masm.jump(self.exit);

        if always_fits && op != BinOp::Shr {
            return;
        }
        masm.bind(not_smi);
        let mut work = self.frame.clone();
        work.spill_all(masm);
        masm.mov(Reg::A0, int32);
        masm.call_stub(self.boxing_stub());
        masm.mov(result, Reg::V0);
        work.merge_to(masm, &self.frame);
        masm.jump(self.exit);
    }

    /// The inputs were smis but the untagged answer no longer fits one;
    /// box it into a fresh heap number.
    fn generate_answer_out_of_range(&self, masm: &mut MacroAssembler) {
        masm.bind(self.answer_out_of_range.expect("entry requested"));
        let result = self.result_register();
        let mut work = self.frame.clone();
        work.spill_all(masm);
        masm.mov(Reg::A0, result);
        masm.call_stub(self.boxing_stub());
        masm.mov(result, Reg::V0);
        work.merge_to(masm, &self.frame);
        masm.jump(self.exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quill_masm::Instr;

    #[test]
    fn test_smi_operation_block_calls_constant_stub() {
        let mut masm = MacroAssembler::new();
        let frame = VirtualFrame::new(0, 0);
        let block = DeferredBlock::new(
            &mut masm,
            frame,
            DeferredKind::InlineSmiOperation {
                op: BinOp::Add,
                value: Smi::new(5).unwrap(),
                reversed: false,
                mode: OverwriteMode::NoOverwrite,
                tos: Reg::A0,
                result: Reg::A0,
            },
            SourcePos::NONE,
        );
        let exit = block.exit;
        block.generate(&mut masm);

        let stream = masm.instructions();
        // a1 takes the operand, a0 the constant, then the stub runs and
        // the result lands back in the operand register.
        assert!(stream.contains(&Instr::Mov(Reg::A1, Reg::A0)));
        assert!(stream.contains(&Instr::CallStub(Stub::GenericBinaryOp {
            op: StubBinOp::Add,
            mode: OverwriteMode::NoOverwrite,
            constant_rhs: Some(5),
        })));
        assert!(stream.contains(&Instr::Mov(Reg::A0, Reg::V0)));
        assert_eq!(stream.last(), Some(&Instr::Jump(exit)));
    }

    #[test]
    fn test_named_load_block_marks_patch_site() {
        let mut masm = MacroAssembler::new();
        let frame = VirtualFrame::new(0, 0);
        let block = DeferredBlock::new(
            &mut masm,
            frame,
            DeferredKind::NamedLoad {
                receiver: Reg::A1,
                result: Reg::A0,
                name: "length".to_string(),
                is_contextual: false,
            },
            SourcePos::NONE,
        );
        block.generate(&mut masm);

        let stream = masm.instructions();
        let call_at = stream
            .iter()
            .position(|i| matches!(i, Instr::CallIc(IcKind::Load { .. })))
            .expect("load IC call emitted");
        assert_eq!(stream[call_at + 1], Instr::InlinePatchMarker);
    }

    #[test]
    fn test_int32_entries_box_out_of_range_answers() {
        let mut masm = MacroAssembler::new();
        let frame = VirtualFrame::new(0, 0);
        let block = DeferredBlock::new(
            &mut masm,
            frame,
            DeferredKind::InlineSmiOperation {
                op: BinOp::Shr,
                value: Smi::new(2).unwrap(),
                reversed: false,
                mode: OverwriteMode::NoOverwrite,
                tos: Reg::T0,
                result: Reg::T0,
            },
            SourcePos::NONE,
        )
        .with_int32_entries(&mut masm);
        let block_entries = (
            block.non_smi_input.unwrap(),
            block.answer_out_of_range.unwrap(),
        );
        block.generate(&mut masm);

        let stream = masm.instructions();
        // A logical shift's answer is an unsigned word; it must not be
        // boxed through the sign-extending stub.
        assert!(stream.contains(&Instr::CallStub(Stub::WriteUint32ToHeapNumber)));
        assert!(!stream.contains(&Instr::CallStub(Stub::WriteInt32ToHeapNumber)));
        // Both secondary entries were bound somewhere in the block.
        assert!(stream.contains(&Instr::Bind(block_entries.0)));
        assert!(stream.contains(&Instr::Bind(block_entries.1)));
    }

    #[test]
    fn test_out_of_range_answers_box_signed_for_arithmetic_shift_left() {
        let mut masm = MacroAssembler::new();
        let frame = VirtualFrame::new(0, 0);
        let block = DeferredBlock::new(
            &mut masm,
            frame,
            DeferredKind::InlineSmiOperation {
                op: BinOp::Shl,
                value: Smi::new(1).unwrap(),
                reversed: false,
                mode: OverwriteMode::NoOverwrite,
                tos: Reg::T0,
                result: Reg::T1,
            },
            SourcePos::NONE,
        )
        .with_int32_entries(&mut masm);
        block.generate(&mut masm);

        let stream = masm.instructions();
        assert!(stream.contains(&Instr::CallStub(Stub::WriteInt32ToHeapNumber)));
        assert!(!stream.contains(&Instr::CallStub(Stub::WriteUint32ToHeapNumber)));
    }

    #[test]
    fn test_non_smi_input_retries_bit_op_on_heap_number() {
        let mut masm = MacroAssembler::new();
        let frame = VirtualFrame::new(0, 0);
        let block = DeferredBlock::new(
            &mut masm,
            frame,
            DeferredKind::InlineSmiOperation {
                op: BinOp::BitOr,
                value: Smi::new(3).unwrap(),
                reversed: false,
                mode: OverwriteMode::NoOverwrite,
                tos: Reg::T0,
                result: Reg::T1,
            },
            SourcePos::NONE,
        )
        .with_int32_entries(&mut masm);
        let non_smi = block.non_smi_input.unwrap();
        block.generate(&mut masm);

        let stream = masm.instructions();
        let entry_at = stream
            .iter()
            .position(|i| *i == Instr::Bind(non_smi))
            .expect("heap-number entry bound");
        let tail = &stream[entry_at..];
        // The map check guards the conversion, the operation is redone
        // on the untagged word, and a fitting answer is retagged.
        assert!(tail
            .iter()
            .any(|i| matches!(i, Instr::LoadRoot(_, RootIndex::HeapNumberMap))));
        assert!(tail.iter().any(|i| matches!(i, Instr::Srlv(..))));
        assert!(tail
            .iter()
            .any(|i| matches!(i, Instr::Or(_, _, Operand::Imm(3)))));
        assert!(tail
            .iter()
            .any(|i| matches!(i, Instr::Sll(Reg::T1, _, _))));
    }
}
