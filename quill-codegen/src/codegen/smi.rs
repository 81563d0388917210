//! Inlined smi arithmetic
//!
//! Binary operations with a known smi constant on one side get inlined
//! fast paths operating on the tagged words directly: add/sub with the
//! sign-rule overflow check, bit operations after a tag check, shifts
//! that untag/operate/retag, modulus by a power of two, and multiply by
//! easy constants decomposed into shifts and adds. Anything the fast
//! path cannot finish branches to a deferred block that calls the
//! generic stub.
//!
//! Inside loops, two-register operations on operands the frame believes
//! are smis get the same treatment without the constant.

use crate::ast::BinOp;
use crate::codegen::CodeGenerator;
use crate::deferred::{DeferredBlock, DeferredKind};
use crate::frame::TypeInfo;
use quill_common::{smi, SourcePos, Smi};
use quill_masm::{Condition, Label, MacroAssembler, Operand, OverwriteMode, Reg, Stub};

/// Decomposition of multiplication by a positive constant into shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulPlan {
    /// `x * 2^n`
    PowerOfTwo(u8),
    /// `x * (2^n - 1)` as `(x << n) - x`
    PowerMinusOne(u8),
    /// `x * (2^high + 2^low)` as `(x << high) + (x << low)`
    TwoBits { high: u8, low: u8 },
}

/// A shift/add rendering of `x * k`, when one exists cheap enough to
/// beat the generic stub.
pub fn multiply_plan(k: i32) -> Option<MulPlan> {
    if k < 2 {
        return None;
    }
    let u = k as u32;
    if u.is_power_of_two() {
        return Some(MulPlan::PowerOfTwo(u.trailing_zeros() as u8));
    }
    if (u + 1).is_power_of_two() {
        return Some(MulPlan::PowerMinusOne((u + 1).trailing_zeros() as u8));
    }
    if u.count_ones() == 2 {
        return Some(MulPlan::TwoBits {
            high: (31 - u.leading_zeros()) as u8,
            low: u.trailing_zeros() as u8,
        });
    }
    None
}

pub fn is_easy_to_multiply_by(k: i32) -> bool {
    multiply_plan(k).is_some()
}

/// Whether `value op constant` (or reversed) has an inline rendering.
fn can_inline(op: BinOp, constant: Smi, reversed: bool) -> bool {
    match op {
        BinOp::Add | BinOp::Sub => true,
        BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor => true,
        BinOp::Shl | BinOp::Sar | BinOp::Shr => !reversed,
        BinOp::Mod => {
            let k = constant.value();
            !reversed && k >= 2 && (k & (k - 1)) == 0
        }
        BinOp::Mul => is_easy_to_multiply_by(constant.value()),
        BinOp::Div | BinOp::Or | BinOp::And => false,
    }
}

/// Sign-rule overflow check for `dest = a + b`: overflow iff the operands
/// agree in sign and the result does not.
fn check_add_overflow(masm: &mut MacroAssembler, dest: Reg, a: Reg, b: Operand, slow: Label) {
    masm.xor_(Reg::SCRATCH0, dest, Operand::Reg(a));
    masm.xor_(Reg::SCRATCH1, dest, b);
    masm.and_(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Reg(Reg::SCRATCH1));
    masm.branch(Condition::Lt, Reg::SCRATCH0, Operand::zero(), slow);
}

/// For `dest = a - b`: overflow iff the operands disagree in sign and the
/// result disagrees with `a`.
fn check_sub_overflow(masm: &mut MacroAssembler, dest: Reg, a: Reg, b: Operand, slow: Label) {
    masm.xor_(Reg::SCRATCH0, a, b);
    masm.xor_(Reg::SCRATCH1, dest, Operand::Reg(a));
    masm.and_(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Reg(Reg::SCRATCH1));
    masm.branch(Condition::Lt, Reg::SCRATCH0, Operand::zero(), slow);
}

/// Shift the tagged `src` left by `shift` into `dest`, going to `slow`
/// if the result does not shift back unchanged.
fn checked_shift_left(
    masm: &mut MacroAssembler,
    dest: Reg,
    src: Reg,
    shift: u8,
    slow: Label,
) {
    masm.sll(dest, src, shift);
    masm.sra(Reg::SCRATCH0, dest, shift);
    masm.branch(Condition::Ne, Reg::SCRATCH0, Operand::Reg(src), slow);
}

impl<'a> CodeGenerator<'a> {
    /// The non-constant operand is on top of the frame; replace it with
    /// the result of `value op constant` (or `constant op value` when
    /// reversed).
    pub(crate) fn smi_operation(
        &mut self,
        op: BinOp,
        constant: Smi,
        reversed: bool,
        mode: OverwriteMode,
    ) {
        if !can_inline(op, constant, reversed) {
            self.constant_stub_operation(op, constant, reversed, mode);
            return;
        }

        let known_smi = self.frame_mut().known_smi_at(0);
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // The deferred block merges back into this frame; constants and
        // copies must be materialized before the snapshot is taken.
        f.make_mergable(masm);
        let tos = f.pop_to_register(masm, None);
        let dest = f.allocate_register(masm, &[tos]);

        let needs_int32 = matches!(
            op,
            BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor | BinOp::Shl | BinOp::Sar | BinOp::Shr
        );
        let mut block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::InlineSmiOperation {
                op,
                value: constant,
                reversed,
                mode,
                tos,
                result: dest,
            },
            SourcePos::NONE,
        );
        if needs_int32 {
            block = block.with_int32_entries(masm);
        }
        let entry = block.entry;
        let exit = block.exit;
        let non_smi = block.non_smi_input.unwrap_or(entry);
        let out_of_range = block.answer_out_of_range.unwrap_or(entry);

        match op {
            BinOp::Add => {
                masm.add(dest, tos, Operand::Smi(constant));
                check_add_overflow(masm, dest, tos, Operand::Smi(constant), entry);
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, entry);
                }
            }
            BinOp::Sub => {
                if reversed {
                    masm.li(Reg::SCRATCH2, Operand::Smi(constant));
                    masm.sub(dest, Reg::SCRATCH2, Operand::Reg(tos));
                    check_sub_overflow(masm, dest, Reg::SCRATCH2, Operand::Reg(tos), entry);
                } else {
                    masm.sub(dest, tos, Operand::Smi(constant));
                    check_sub_overflow(masm, dest, tos, Operand::Smi(constant), entry);
                }
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, entry);
                }
            }
            BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, non_smi);
                }
                match op {
                    BinOp::BitOr => masm.or_(dest, tos, Operand::Smi(constant)),
                    BinOp::BitAnd => masm.and_(dest, tos, Operand::Smi(constant)),
                    BinOp::BitXor => masm.xor_(dest, tos, Operand::Smi(constant)),
                    _ => unreachable!(),
                }
            }
            BinOp::Shl => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, non_smi);
                }
                let shift = (constant.value() & 0x1f) as u8;
                masm.smi_untag(dest, tos);
                if shift > 0 {
                    masm.sll(dest, dest, shift);
                }
                // Retag only if the untagged answer survives the round trip.
                masm.sll(Reg::SCRATCH0, dest, smi::TAG_SIZE as u8);
                masm.sra(Reg::SCRATCH1, Reg::SCRATCH0, smi::TAG_SIZE as u8);
                masm.branch(Condition::Ne, Reg::SCRATCH1, Operand::Reg(dest), out_of_range);
                masm.mov(dest, Reg::SCRATCH0);
            }
            BinOp::Sar => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, non_smi);
                }
                let shift = (constant.value() & 0x1f) as u8;
                if shift > 0 {
                    // Shift the tagged word and clear the tag bit; the
                    // result always fits.
                    masm.sra(dest, tos, shift);
                    masm.and_(dest, dest, Operand::Imm(!smi::TAG_MASK));
                } else {
                    masm.mov(dest, tos);
                }
            }
            BinOp::Shr => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, non_smi);
                }
                let shift = (constant.value() & 0x1f) as u8;
                masm.smi_untag(dest, tos);
                if shift > 0 {
                    masm.srl(dest, dest, shift);
                }
                // A logical shift of a negative input can exceed the smi
                // range; the top two bits must be clear to retag.
                masm.and_(Reg::SCRATCH0, dest, Operand::Imm(0xc000_0000u32 as i32));
                masm.branch(Condition::Ne, Reg::SCRATCH0, Operand::zero(), out_of_range);
                masm.smi_tag(dest, dest);
            }
            BinOp::Mod => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, entry);
                }
                // Negative operands go slow so -0 comes out right.
                masm.branch(Condition::Lt, tos, Operand::zero(), entry);
                let mask = Smi::new(constant.value() - 1).expect("mask fits");
                masm.and_(dest, tos, Operand::Smi(mask));
            }
            BinOp::Mul => {
                if !known_smi {
                    masm.branch_if_not_smi(tos, Reg::SCRATCH0, entry);
                }
                match multiply_plan(constant.value()).expect("checked by can_inline") {
                    MulPlan::PowerOfTwo(n) => {
                        checked_shift_left(masm, dest, tos, n, entry);
                    }
                    MulPlan::PowerMinusOne(n) => {
                        // (x << n) - x cannot overflow once the shift
                        // was checked.
                        checked_shift_left(masm, dest, tos, n, entry);
                        masm.sub(dest, dest, Operand::Reg(tos));
                    }
                    MulPlan::TwoBits { high, low } => {
                        checked_shift_left(masm, dest, tos, high, entry);
                        checked_shift_left(masm, Reg::SCRATCH2, tos, low, entry);
                        masm.add(dest, dest, Operand::Reg(Reg::SCRATCH2));
                        // Both addends carry the sign of the input, so
                        // overflow shows as a sign flip against it.
                        masm.xor_(Reg::SCRATCH0, dest, Operand::Reg(tos));
                        masm.branch(Condition::Lt, Reg::SCRATCH0, Operand::zero(), entry);
                    }
                }
            }
            BinOp::Div | BinOp::Or | BinOp::And => unreachable!("not inlined"),
        }

        masm.bind(exit);
        f.push_register(dest, TypeInfo::Number);
        self.add_deferred(block);
    }

    /// Constant operand, but no inline rendering: call the stub straight
    /// away, still letting it specialize on the constant.
    fn constant_stub_operation(
        &mut self,
        op: BinOp,
        constant: Smi,
        reversed: bool,
        mode: OverwriteMode,
    ) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let tos = f.pop_to_register(masm, None);
        f.spill_all(masm);
        if reversed {
            masm.mov(Reg::A0, tos);
            masm.li(Reg::A1, Operand::Smi(constant));
        } else {
            masm.mov(Reg::A1, tos);
            masm.li(Reg::A0, Operand::Smi(constant));
        }
        masm.call_stub(Stub::GenericBinaryOp {
            op: crate::deferred::stub_bin_op(op),
            mode,
            constant_rhs: if reversed { None } else { Some(constant.value()) },
        });
        f.emit_push(masm, Reg::V0);
    }

    /// Both operands on the frame and believed to be smis (a loop hint
    /// or earlier check): inline the operation with a deferred fallback.
    pub(crate) fn likely_smi_binary_operation(&mut self, op: BinOp, mode: OverwriteMode) {
        debug_assert!(matches!(
            op,
            BinOp::Add | BinOp::Sub | BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor
        ));
        let rhs_smi = self.frame_mut().known_smi_at(0);
        let lhs_smi = self.frame_mut().known_smi_at(1);
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // Mergable before the pops, so the snapshot is a merge target.
        f.make_mergable(masm);
        let rhs = f.pop_to_register(masm, None);
        let lhs = f.pop_to_register(masm, Some(rhs));
        let dest = f.allocate_register(masm, &[lhs, rhs]);

        let block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::InlineBinaryOperation {
                op,
                mode,
                lhs,
                rhs,
                result: dest,
            },
            SourcePos::NONE,
        );
        let entry = block.entry;
        let exit = block.exit;

        // One combined tag test covers both unproven operands.
        match (lhs_smi, rhs_smi) {
            (true, true) => {}
            (true, false) => masm.branch_if_not_smi(rhs, Reg::SCRATCH0, entry),
            (false, true) => masm.branch_if_not_smi(lhs, Reg::SCRATCH0, entry),
            (false, false) => {
                masm.or_(Reg::SCRATCH0, lhs, Operand::Reg(rhs));
                masm.and_(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Imm(smi::TAG_MASK));
                masm.branch(Condition::Ne, Reg::SCRATCH0, Operand::zero(), entry);
            }
        }

        match op {
            BinOp::Add => {
                masm.add(dest, lhs, Operand::Reg(rhs));
                check_add_overflow(masm, dest, lhs, Operand::Reg(rhs), entry);
            }
            BinOp::Sub => {
                masm.sub(dest, lhs, Operand::Reg(rhs));
                check_sub_overflow(masm, dest, lhs, Operand::Reg(rhs), entry);
            }
            BinOp::BitOr => masm.or_(dest, lhs, Operand::Reg(rhs)),
            BinOp::BitAnd => masm.and_(dest, lhs, Operand::Reg(rhs)),
            BinOp::BitXor => masm.xor_(dest, lhs, Operand::Reg(rhs)),
            _ => unreachable!(),
        }

        masm.bind(exit);
        f.push_register(dest, TypeInfo::Number);
        self.add_deferred(block);
    }

    /// Generic path: both operands on the frame, no assumptions.
    pub(crate) fn generic_binary_operation(&mut self, op: BinOp, mode: OverwriteMode) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        f.emit_pop(masm, Reg::A0);
        f.emit_pop(masm, Reg::A1);
        masm.call_stub(Stub::GenericBinaryOp {
            op: crate::deferred::stub_bin_op(op),
            mode,
            constant_rhs: None,
        });
        f.emit_push(masm, Reg::V0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionInfo, ScopeInfo};
    use crate::frame::VirtualFrame;
    use pretty_assertions::assert_eq;
    use quill_masm::{Constant, Instr};

    fn with_cgen<R>(run: impl FnOnce(&mut CodeGenerator<'_>) -> R) -> (R, MacroAssembler) {
        let info = FunctionInfo::new("test", ScopeInfo::function(0, 0), vec![]);
        let mut masm = MacroAssembler::new();
        let result = {
            let mut cgen = CodeGenerator::new(&info, &mut masm);
            cgen.frame = Some(VirtualFrame::new(0, 0));
            run(&mut cgen)
        };
        (result, masm)
    }

    #[test]
    fn test_multiply_plans() {
        assert_eq!(multiply_plan(2), Some(MulPlan::PowerOfTwo(1)));
        assert_eq!(multiply_plan(8), Some(MulPlan::PowerOfTwo(3)));
        assert_eq!(multiply_plan(7), Some(MulPlan::PowerMinusOne(3)));
        assert_eq!(multiply_plan(10), Some(MulPlan::TwoBits { high: 3, low: 1 }));
        assert_eq!(multiply_plan(100), None);
        assert_eq!(multiply_plan(0), None);
        assert_eq!(multiply_plan(1), None);
        assert_eq!(multiply_plan(-4), None);
    }

    #[test]
    fn test_plans_match_scalar_multiplication() {
        for k in 2..64 {
            if let Some(plan) = multiply_plan(k) {
                for x in [-9i64, -1, 0, 1, 5, 1000] {
                    let expected = x * k as i64;
                    let got = match plan {
                        MulPlan::PowerOfTwo(n) => x << n,
                        MulPlan::PowerMinusOne(n) => (x << n) - x,
                        MulPlan::TwoBits { high, low } => (x << high) + (x << low),
                    };
                    assert_eq!(got, expected, "k={} x={}", k, x);
                }
            }
        }
    }

    #[test]
    fn test_add_constant_checks_overflow_and_tag() {
        let (_, masm) = with_cgen(|cgen| {
            let reg = {
                let (masm, frame) = cgen.parts();
                let f = frame.as_mut().unwrap();
                let reg = f.allocate_register(masm, &[]);
                f.push_register(reg, TypeInfo::Unknown);
                reg
            };
            cgen.smi_operation(
                BinOp::Add,
                Smi::new(3).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
            cgen.flush_deferred_code();
            reg
        });
        let stream = masm.instructions();
        // The inline add on tagged words, the sign-rule check, the tag
        // check, and the deferred stub call must all be present.
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::Add(_, _, Operand::Smi(s)) if s.value() == 3)));
        assert!(stream.iter().any(|i| matches!(i, Instr::Xor(..))));
        assert!(stream.iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::GenericBinaryOp {
                constant_rhs: Some(3),
                ..
            })
        )));
    }

    #[test]
    fn test_deferred_snapshot_materializes_pending_constants() {
        // A pending call argument can sit in the frame as an
        // unmaterialized constant while the fast path is inlined; the
        // deferred block must still merge back into that frame.
        let (_, masm) = with_cgen(|cgen| {
            cgen.frame_mut()
                .push_constant(Constant::Smi(Smi::new(1).unwrap()));
            {
                let (masm, frame) = cgen.parts();
                let f = frame.as_mut().unwrap();
                let reg = f.allocate_register(masm, &[]);
                f.push_register(reg, TypeInfo::Unknown);
            }
            cgen.smi_operation(
                BinOp::Add,
                Smi::new(3).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
            cgen.flush_deferred_code();
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::GenericBinaryOp { .. })
        )));
    }

    #[test]
    fn test_known_smi_operand_skips_tag_check() {
        let (streams, _) = with_cgen(|cgen| {
            // Unknown operand first.
            cgen.frame_mut().push_constant(Constant::Undefined);
            let mut masm_a = MacroAssembler::new();
            std::mem::swap(cgen.masm, &mut masm_a);
            cgen.smi_operation(
                BinOp::Add,
                Smi::new(1).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
            std::mem::swap(cgen.masm, &mut masm_a);
            let unknown_len = masm_a.len();
            {
                let (masm, frame) = cgen.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
            }

            // Known-smi operand: the frame proved the type, so the tag
            // check disappears.
            let (masm, frame) = cgen.parts();
            let f = frame.as_mut().unwrap();
            let reg = f.allocate_register(masm, &[]);
            f.push_register(reg, TypeInfo::Smi);
            let mut masm_b = MacroAssembler::new();
            std::mem::swap(cgen.masm, &mut masm_b);
            cgen.smi_operation(
                BinOp::Add,
                Smi::new(1).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
            std::mem::swap(cgen.masm, &mut masm_b);
            (unknown_len, masm_b.len())
        });
        assert!(streams.1 < streams.0);
    }

    #[test]
    fn test_mod_by_power_of_two_uses_mask() {
        let (_, masm) = with_cgen(|cgen| {
            let (masm, frame) = cgen.parts();
            let f = frame.as_mut().unwrap();
            let reg = f.allocate_register(masm, &[]);
            f.push_register(reg, TypeInfo::Smi);
            cgen.smi_operation(
                BinOp::Mod,
                Smi::new(8).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
        });
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::And(_, _, Operand::Smi(s)) if s.value() == 7)));
    }

    #[test]
    fn test_mod_by_non_power_of_two_goes_to_stub() {
        let (_, masm) = with_cgen(|cgen| {
            cgen.frame_mut().push_constant(Constant::Undefined);
            cgen.smi_operation(
                BinOp::Mod,
                Smi::new(10).unwrap(),
                false,
                OverwriteMode::NoOverwrite,
            );
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::GenericBinaryOp {
                op: quill_masm::StubBinOp::Mod,
                ..
            })
        )));
    }

    #[test]
    fn test_likely_smi_add_skips_checks_for_proven_operands() {
        let (_, masm) = with_cgen(|cgen| {
            let (masm, frame) = cgen.parts();
            let f = frame.as_mut().unwrap();
            let a = f.allocate_register(masm, &[]);
            f.push_register(a, TypeInfo::Smi);
            let b = f.allocate_register(masm, &[]);
            f.push_register(b, TypeInfo::Smi);
            cgen.likely_smi_binary_operation(BinOp::Add, OverwriteMode::NoOverwrite);
        });
        // No tag test: the first and is part of the overflow check, which
        // works on xor results, so no And against the tag mask appears.
        assert!(!masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::And(_, _, Operand::Imm(m)) if *m == smi::TAG_MASK)));
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::Add(..))));
    }
}
