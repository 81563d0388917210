//! Jump targets
//!
//! A jump target is a label plus the virtual-frame shape code arriving at
//! the label must be in. Forward targets fix that shape at their first use
//! and merge later arrivals into it; bidirectional targets (loop tops) fix
//! it at bind time over a spilled frame so back edges never need merge
//! code, paying any cost at the bottom of the loop instead.
//!
//! A conditional branch whose frame would need merge code cannot emit that
//! code on the fall-through path, so it branches over an out-of-line
//! merge-and-jump block instead.
//!
//! `BreakTarget` adds an expected height: break/continue/return sites may
//! sit above extra stack words (loop state, try handlers already popped)
//! and drop down to the recorded height before jumping.

use crate::frame::VirtualFrame;
use quill_masm::{Condition, Label, MacroAssembler, Operand, Reg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directionality {
    Forward,
    Bidirectional,
}

#[derive(Debug)]
pub struct JumpTarget {
    directionality: Directionality,
    entry_label: Option<Label>,
    entry_frame: Option<VirtualFrame>,
    is_bound: bool,
    is_linked: bool,
}

impl JumpTarget {
    pub fn new() -> JumpTarget {
        JumpTarget {
            directionality: Directionality::Forward,
            entry_label: None,
            entry_frame: None,
            is_bound: false,
            is_linked: false,
        }
    }

    pub fn bidirectional() -> JumpTarget {
        JumpTarget {
            directionality: Directionality::Bidirectional,
            ..JumpTarget::new()
        }
    }

    pub fn is_bound(&self) -> bool {
        self.is_bound
    }

    /// True if a forward use referenced the label before it was bound.
    pub fn is_linked(&self) -> bool {
        self.is_linked
    }

    pub fn is_unused(&self) -> bool {
        !self.is_bound && !self.is_linked
    }

    fn label(&mut self, masm: &mut MacroAssembler) -> Label {
        if self.entry_label.is_none() {
            self.entry_label = Some(masm.new_label());
        }
        self.entry_label.unwrap()
    }

    /// Record the current frame as the expected entry shape. Type
    /// refinements do not survive the join, so the recorded frame is
    /// generalized; the live frame keeps its own knowledge.
    fn record_entry_frame(&mut self, masm: &mut MacroAssembler, frame: &mut VirtualFrame) {
        debug_assert!(self.entry_frame.is_none());
        frame.make_mergable(masm);
        let mut recorded = frame.clone();
        recorded.forget_type_info();
        self.entry_frame = Some(recorded);
    }

    /// Unconditional jump. The frame is consumed; code after a jump is
    /// unreachable until something binds a target.
    pub fn jump(&mut self, masm: &mut MacroAssembler, frame: &mut Option<VirtualFrame>) {
        let mut f = frame.take().expect("jump without a current frame");
        match &self.entry_frame {
            Some(expected) => f.merge_to(masm, expected),
            None => self.record_entry_frame(masm, &mut f),
        }
        if !self.is_bound {
            self.is_linked = true;
        }
        let label = self.label(masm);
        masm.jump(label);
    }

    /// Conditional branch; the fall-through frame is untouched.
    pub fn branch(
        &mut self,
        masm: &mut MacroAssembler,
        frame: &mut VirtualFrame,
        cond: Condition,
        lhs: Reg,
        rhs: Operand,
    ) {
        if self.entry_frame.is_none() {
            self.record_entry_frame(masm, frame);
            if !self.is_bound {
                self.is_linked = true;
            }
            let label = self.label(masm);
            masm.branch(cond, lhs, rhs, label);
            return;
        }
        let expected = self.entry_frame.as_ref().unwrap();
        if frame.matches(expected) {
            if !self.is_bound {
                self.is_linked = true;
            }
            let label = self.label(masm);
            masm.branch(cond, lhs, rhs, label);
        } else {
            // Merge code only runs on the taken path.
            let skip = masm.new_label();
            masm.branch(cond.negate(), lhs, rhs, skip);
            let mut taken = frame.clone();
            let expected = self.entry_frame.as_ref().unwrap().clone();
            taken.merge_to(masm, &expected);
            if !self.is_bound {
                self.is_linked = true;
            }
            let label = self.label(masm);
            masm.jump(label);
            masm.bind(skip);
        }
    }

    /// Bind the target here. Binding twice is a defect.
    pub fn bind(&mut self, masm: &mut MacroAssembler, frame: &mut Option<VirtualFrame>) {
        assert!(!self.is_bound, "jump target bound twice");
        match self.directionality {
            Directionality::Bidirectional => {
                // Loop entries are reached first by fall-through; the
                // back edges that link to them come later.
                debug_assert!(self.entry_frame.is_none());
                let f = frame.as_mut().expect("loop entry without a frame");
                f.spill_all(masm);
                f.forget_type_info();
                self.entry_frame = Some(f.clone());
            }
            Directionality::Forward => match (frame.as_mut(), &self.entry_frame) {
                (Some(f), Some(expected)) => {
                    f.merge_to(masm, expected);
                    *frame = Some(expected.clone());
                }
                (Some(f), None) => {
                    self.record_entry_frame(masm, f);
                }
                (None, Some(expected)) => {
                    *frame = Some(expected.clone());
                }
                (None, None) => panic!("binding an unreachable, unlinked target"),
            },
        }
        let label = self.label(masm);
        masm.bind(label);
        self.is_bound = true;
        self.is_linked = false;
    }
}

impl Default for JumpTarget {
    fn default() -> Self {
        JumpTarget::new()
    }
}

/// A forward jump target with an expected frame height, for break,
/// continue and return sites that may need to unwind stacked state first.
#[derive(Debug, Default)]
pub struct BreakTarget {
    target: JumpTarget,
    expected_height: Option<usize>,
}

impl BreakTarget {
    pub fn new() -> BreakTarget {
        BreakTarget::default()
    }

    pub fn with_height(height: usize) -> BreakTarget {
        BreakTarget {
            target: JumpTarget::new(),
            expected_height: Some(height),
        }
    }

    /// A loop-top target: bound over a spilled frame, so back edges and
    /// continues never need merge code.
    pub fn bidirectional_with_height(height: usize) -> BreakTarget {
        BreakTarget {
            target: JumpTarget::bidirectional(),
            expected_height: Some(height),
        }
    }

    pub fn expected_height(&self) -> Option<usize> {
        self.expected_height
    }

    pub fn is_bound(&self) -> bool {
        self.target.is_bound()
    }

    pub fn is_linked(&self) -> bool {
        self.target.is_linked()
    }

    pub fn is_unused(&self) -> bool {
        self.target.is_unused()
    }

    pub fn jump(&mut self, masm: &mut MacroAssembler, frame: &mut Option<VirtualFrame>) {
        if let (Some(height), Some(f)) = (self.expected_height, frame.as_mut()) {
            debug_assert!(f.height() >= height, "frame below the break height");
            let extra = f.height() - height;
            f.drop_(masm, extra);
        }
        self.target.jump(masm, frame);
    }

    pub fn branch(
        &mut self,
        masm: &mut MacroAssembler,
        frame: &mut VirtualFrame,
        cond: Condition,
        lhs: Reg,
        rhs: Operand,
    ) {
        let needs_unwind = self
            .expected_height
            .map(|h| frame.height() != h)
            .unwrap_or(false);
        if !needs_unwind {
            self.target.branch(masm, frame, cond, lhs, rhs);
            return;
        }
        // Unwind code only runs on the taken path.
        let skip = masm.new_label();
        masm.branch(cond.negate(), lhs, rhs, skip);
        let mut taken = Some(frame.clone());
        self.jump(masm, &mut taken);
        masm.bind(skip);
    }

    pub fn bind(&mut self, masm: &mut MacroAssembler, frame: &mut Option<VirtualFrame>) {
        if let (Some(height), Some(f)) = (self.expected_height, frame.as_ref()) {
            debug_assert_eq!(f.height(), height, "bound below the break height");
        }
        self.target.bind(masm, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quill_common::Smi;
    use quill_masm::{Constant, Instr};

    fn value_frame(height: usize) -> VirtualFrame {
        let mut frame = VirtualFrame::new(0, 0);
        let mut masm = MacroAssembler::new();
        for i in 0..height {
            frame.push_constant(Constant::Smi(Smi::new(i as i32).unwrap()));
        }
        frame.spill_all(&mut masm);
        frame
    }

    #[test]
    fn test_forward_target_records_first_branch() {
        let mut masm = MacroAssembler::new();
        let mut frame = value_frame(1);
        let mut target = JumpTarget::new();
        target.branch(
            &mut masm,
            &mut frame,
            Condition::Eq,
            Reg::A0,
            Operand::zero(),
        );
        assert!(target.is_linked());
        assert!(!target.is_bound());

        // Binding with the same fall-through shape merges silently.
        let before = masm.len();
        let mut current = Some(frame);
        target.bind(&mut masm, &mut current);
        assert!(target.is_bound());
        // Only the label bind itself was emitted.
        assert_eq!(masm.len(), before + 1);
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics() {
        let mut masm = MacroAssembler::new();
        let mut target = JumpTarget::new();
        let mut current = Some(value_frame(0));
        target.bind(&mut masm, &mut current);
        target.bind(&mut masm, &mut current);
    }

    #[test]
    fn test_jump_consumes_the_frame() {
        let mut masm = MacroAssembler::new();
        let mut target = JumpTarget::new();
        let mut current = Some(value_frame(0));
        target.jump(&mut masm, &mut current);
        assert!(current.is_none());
        assert!(target.is_linked());
    }

    #[test]
    fn test_bind_restores_frame_from_entry() {
        let mut masm = MacroAssembler::new();
        let mut target = JumpTarget::new();
        let mut current = Some(value_frame(2));
        target.jump(&mut masm, &mut current);
        target.bind(&mut masm, &mut current);
        assert_eq!(current.unwrap().height(), 2);
    }

    #[test]
    fn test_mismatched_branch_goes_out_of_line() {
        let mut masm = MacroAssembler::new();
        let mut target = JumpTarget::new();

        // First use records a two-element spilled shape.
        let mut linked = Some(value_frame(2));
        target.jump(&mut masm, &mut linked);

        // A branch from a same-height frame with a different top location
        // must not disturb its own fall-through state.
        let mut frame = value_frame(1);
        frame.push_constant(Constant::Smi(Smi::new(9).unwrap()));
        let height_before = frame.height();
        target.branch(
            &mut masm,
            &mut frame,
            Condition::Eq,
            Reg::A0,
            Operand::zero(),
        );
        assert_eq!(frame.height(), height_before);
        // The stream ends with the skip label bound after the inverted
        // branch and out-of-line merge.
        assert!(matches!(masm.instructions().last(), Some(Instr::Bind(_))));
    }

    #[test]
    fn test_bidirectional_bind_spills() {
        let mut masm = MacroAssembler::new();
        let mut target = JumpTarget::bidirectional();
        let mut frame = VirtualFrame::new(0, 0);
        frame.push_constant(Constant::Smi(Smi::new(1).unwrap()));
        let mut current = Some(frame);
        target.bind(&mut masm, &mut current);
        assert!(current.as_ref().unwrap().is_spilled());
        // Back edge from the same shape emits just the jump.
        let before = masm.len();
        let mut back = Some(current.as_ref().unwrap().clone());
        target.jump(&mut masm, &mut back);
        assert_eq!(masm.len(), before + 1);
    }

    #[test]
    fn test_break_target_drops_to_expected_height() {
        let mut masm = MacroAssembler::new();
        let mut target = BreakTarget::with_height(1);
        let mut current = Some(value_frame(4));
        target.jump(&mut masm, &mut current);
        // Three synced words dropped in one sp adjustment.
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::AddSp(12))));
    }
}
