//! try/catch and try/finally
//!
//! A handler record is installed around the protected body. While the body
//! is compiled, every control transfer that could leave the block (the
//! function return plus the break/continue targets the front end lists as
//! escaping) is shadowed: its table entry is swapped for a private target
//! pinned at the handler height, so escapes keep the record on the stack
//! until the unlink code runs. Each escape actually taken gets exactly one
//! unlink block.
//!
//! try/finally threads a two-word state cell through the finally block:
//! the (possibly faked) result value and a reason smi saying how the block
//! was entered. After the finally code, a chain of compares on the reason
//! routes control to the real destination, and rethrows if the reason was
//! an exception.

use crate::ast::{EscapeKind, EscapeTarget, Stmt, TargetId, VarLocation, VarRef};
use crate::codegen::{CodeGenerator, InitState};
use crate::frame::VirtualFrame;
use crate::jump_target::BreakTarget;
use quill_common::Smi;
use quill_masm::{layout, Condition, Constant, HandlerKind, Operand, Reg, RuntimeFn};

// Reason codes for entering a finally block. Taken escapes get
// `JUMPING_BASE + index` in shadow order; the function return is always
// shadow index 0.
const FALLING: i32 = 0;
const THROWING: i32 = 1;
const JUMPING_BASE: i32 = 2;

const RETURN_SHADOW_INDEX: usize = 0;

fn reason_smi(code: i32) -> Smi {
    Smi::new(code).expect("reason codes are small")
}

/// The real destination of a shadowed escape.
#[derive(Debug, Clone, Copy)]
enum EscapeDest {
    Return,
    Break(TargetId),
    Continue(TargetId),
}

/// The original targets, saved while their table entries are shadows.
struct ShadowedEscapes {
    saved: Vec<(EscapeDest, BreakTarget)>,
}

impl<'a> CodeGenerator<'a> {
    /// Swap every escaping target (and the function return) for a fresh
    /// target pinned at the handler height.
    fn begin_escape_shadowing(
        &mut self,
        escaping: &[EscapeTarget],
        handler_height: usize,
    ) -> ShadowedEscapes {
        let mut saved = Vec::with_capacity(1 + escaping.len());
        let original = std::mem::replace(
            &mut self.function_return,
            BreakTarget::with_height(handler_height),
        );
        saved.push((EscapeDest::Return, original));
        for esc in escaping {
            match esc.kind {
                EscapeKind::Break => {
                    let original = self.take_break_target(esc.id);
                    self.install_break_target(esc.id, BreakTarget::with_height(handler_height));
                    saved.push((EscapeDest::Break(esc.id), original));
                }
                EscapeKind::Continue => {
                    let original = self.take_continue_target(esc.id);
                    self.install_continue_target(esc.id, BreakTarget::with_height(handler_height));
                    saved.push((EscapeDest::Continue(esc.id), original));
                }
            }
        }
        ShadowedEscapes { saved }
    }

    /// Swap the real targets back in and hand out the shadows, in the
    /// same order they were created.
    fn end_escape_shadowing(
        &mut self,
        shadowed: ShadowedEscapes,
    ) -> Vec<(EscapeDest, BreakTarget)> {
        let mut shadows = Vec::with_capacity(shadowed.saved.len());
        for (dest, original) in shadowed.saved {
            let shadow = match dest {
                EscapeDest::Return => std::mem::replace(&mut self.function_return, original),
                EscapeDest::Break(id) => {
                    let shadow = self.take_break_target(id);
                    self.install_break_target(id, original);
                    shadow
                }
                EscapeDest::Continue(id) => {
                    let shadow = self.take_continue_target(id);
                    self.install_continue_target(id, original);
                    shadow
                }
            };
            shadows.push((dest, shadow));
        }
        shadows
    }

    /// Jump to a formerly shadowed destination. Consumes the frame.
    fn jump_to_escape(&mut self, dest: EscapeDest) {
        match dest {
            EscapeDest::Return => {
                let mut ret = std::mem::take(&mut self.function_return);
                let (masm, frame) = self.parts();
                ret.jump(masm, frame);
                self.function_return = ret;
            }
            EscapeDest::Break(id) => self.visit_break(id),
            EscapeDest::Continue(id) => self.visit_continue(id),
        }
    }

    /// Install a handler record and snapshot the frame the exception
    /// edge will resume with.
    fn install_try_handler(
        &mut self,
        kind: HandlerKind,
        resume: quill_masm::Label,
    ) -> VirtualFrame {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        let mut snapshot = f.clone();
        snapshot.forget_type_info();
        masm.push_try_handler(kind, resume);
        f.adjust(layout::STACK_HANDLER_SIZE_WORDS);
        snapshot
    }

    /// Unlink the innermost handler; the frame must be at the handler
    /// height (escape jumps unwound to it).
    fn unlink_try_handler(&mut self) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        masm.pop_try_handler();
        f.forget(layout::STACK_HANDLER_SIZE_WORDS);
    }

    pub(crate) fn visit_try_catch(
        &mut self,
        try_block: &[Stmt],
        catch_var: &VarRef,
        catch_block: &[Stmt],
        escaping: &[EscapeTarget],
    ) {
        self.masm.comment("try-catch");
        let base = self.frame_mut().height();
        let mut exit = BreakTarget::with_height(base);

        let catch_entry = self.masm.new_label();
        let catch_frame = self.install_try_handler(HandlerKind::TryCatch, catch_entry);
        let handler_height = base + layout::STACK_HANDLER_SIZE_WORDS;

        let shadowed = self.begin_escape_shadowing(escaping, handler_height);
        self.visit_statements(try_block);
        let shadows = self.end_escape_shadowing(shadowed);

        // Falling off the end of the try block unlinks in place.
        if self.has_valid_frame() {
            self.unlink_try_handler();
            let (masm, frame) = self.parts();
            exit.jump(masm, frame);
        }

        // One unlink block per escape actually taken.
        for (dest, mut shadow) in shadows {
            if !shadow.is_linked() {
                continue;
            }
            {
                let (masm, frame) = self.parts();
                shadow.bind(masm, frame);
            }
            self.unlink_try_handler();
            self.jump_to_escape(dest);
        }

        // Catch code: the handler is already unwound and the exception
        // object arrives in v0.
        self.masm.bind(catch_entry);
        debug_assert!(!self.has_valid_frame());
        self.frame = Some(catch_frame);
        {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().emit_push(masm, Reg::V0);
        }
        let slot = match &catch_var.location {
            VarLocation::Slot(slot) => slot.clone(),
            VarLocation::Global => unreachable!("catch binding is stack-allocated"),
        };
        self.store_to_slot(&slot, catch_var.mode, &catch_var.name, InitState::NotConstInit);
        {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        }
        self.visit_statements(catch_block);
        if self.has_valid_frame() {
            let (masm, frame) = self.parts();
            exit.jump(masm, frame);
        }

        if exit.is_linked() {
            let (masm, frame) = self.parts();
            exit.bind(masm, frame);
        }
    }

    pub(crate) fn visit_try_finally(
        &mut self,
        try_block: &[Stmt],
        finally_block: &[Stmt],
        escaping: &[EscapeTarget],
    ) {
        self.masm.comment("try-finally");
        let base = self.frame_mut().height();

        let catch_entry = self.masm.new_label();
        let catch_frame = self.install_try_handler(HandlerKind::TryFinally, catch_entry);
        let handler_height = base + layout::STACK_HANDLER_SIZE_WORDS;

        let shadowed = self.begin_escape_shadowing(escaping, handler_height);
        self.visit_statements(try_block);
        let mut shadows = self.end_escape_shadowing(shadowed);
        let linked: Vec<bool> = shadows.iter().map(|(_, s)| s.is_linked()).collect();

        // The finally block always runs with the state cell on top:
        // [value, reason].
        let mut finally_enter = BreakTarget::with_height(base + 2);

        if self.has_valid_frame() {
            self.unlink_try_handler();
            let (masm, frame) = self.parts();
            {
                let f = frame.as_mut().unwrap();
                f.push_constant(Constant::Undefined);
                f.push_constant(Constant::Smi(reason_smi(FALLING)));
            }
            finally_enter.jump(masm, frame);
        }

        for (i, (_, shadow)) in shadows.iter_mut().enumerate() {
            if !linked[i] {
                continue;
            }
            {
                let (masm, frame) = self.parts();
                shadow.bind(masm, frame);
            }
            self.unlink_try_handler();
            let (masm, frame) = self.parts();
            {
                let f = frame.as_mut().unwrap();
                if i == RETURN_SHADOW_INDEX {
                    // Preserve the in-flight return value.
                    f.emit_push(masm, Reg::V0);
                } else {
                    f.push_constant(Constant::Undefined);
                }
                f.push_constant(Constant::Smi(reason_smi(JUMPING_BASE + i as i32)));
            }
            finally_enter.jump(masm, frame);
        }

        // Exception edge: value in v0, handler already unwound.
        self.masm.bind(catch_entry);
        debug_assert!(!self.has_valid_frame());
        self.frame = Some(catch_frame);
        {
            let (masm, frame) = self.parts();
            {
                let f = frame.as_mut().unwrap();
                f.emit_push(masm, Reg::V0);
                f.push_constant(Constant::Smi(reason_smi(THROWING)));
            }
            finally_enter.jump(masm, frame);
        }

        {
            let (masm, frame) = self.parts();
            finally_enter.bind(masm, frame);
        }
        self.visit_statements(finally_block);

        if self.has_valid_frame() {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.spill_all(masm);
            f.emit_pop(masm, Reg::SCRATCH2);
            f.emit_pop(masm, Reg::V0);
        }

        // Route each taken escape to its real destination. The compares
        // leave the reason in SCRATCH2 untouched on the fall-through path.
        for (i, (dest, _)) in shadows.iter().enumerate() {
            if !linked[i] || !self.has_valid_frame() {
                continue;
            }
            let reason = reason_smi(JUMPING_BASE + i as i32);
            match *dest {
                EscapeDest::Return => {
                    let mut ret = std::mem::take(&mut self.function_return);
                    let (masm, frame) = self.parts();
                    ret.branch(
                        masm,
                        frame.as_mut().unwrap(),
                        Condition::Eq,
                        Reg::SCRATCH2,
                        Operand::Smi(reason),
                    );
                    self.function_return = ret;
                }
                EscapeDest::Break(id) => {
                    let mut target = self.take_break_target(id);
                    let (masm, frame) = self.parts();
                    target.branch(
                        masm,
                        frame.as_mut().unwrap(),
                        Condition::Eq,
                        Reg::SCRATCH2,
                        Operand::Smi(reason),
                    );
                    self.install_break_target(id, target);
                }
                EscapeDest::Continue(id) => {
                    let mut target = self.take_continue_target(id);
                    let (masm, frame) = self.parts();
                    target.branch(
                        masm,
                        frame.as_mut().unwrap(),
                        Condition::Eq,
                        Reg::SCRATCH2,
                        Operand::Smi(reason),
                    );
                    self.install_continue_target(id, target);
                }
            }
        }

        // Anything that was not a routed jump either fell through or was
        // an exception; the latter is rethrown.
        if self.has_valid_frame() {
            let mut done = BreakTarget::with_height(base);
            {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                done.branch(
                    masm,
                    f,
                    Condition::Ne,
                    Reg::SCRATCH2,
                    Operand::Smi(reason_smi(THROWING)),
                );
                f.emit_push(masm, Reg::V0);
                f.call_runtime(masm, RuntimeFn::ReThrow, 1);
            }
            let (masm, frame) = self.parts();
            done.bind(masm, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FunctionInfo, ScopeInfo};
    use crate::frame::VirtualFrame;
    use quill_common::SourcePos;
    use quill_masm::{Instr, MacroAssembler};

    fn with_cgen(
        param_count: usize,
        run: impl FnOnce(&mut CodeGenerator<'_>),
    ) -> MacroAssembler {
        let info = FunctionInfo::new("test", ScopeInfo::function(param_count, 0), vec![]);
        let mut masm = MacroAssembler::new();
        {
            let mut cgen = CodeGenerator::new(&info, &mut masm);
            cgen.frame = Some(VirtualFrame::new(param_count, 0));
            run(&mut cgen);
        }
        masm
    }

    fn expr_stmt(expr: Expr) -> Stmt {
        Stmt::Expression {
            expr,
            pos: SourcePos::NONE,
        }
    }

    #[test]
    fn test_try_catch_installs_and_unlinks_a_handler() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&Stmt::TryCatch {
                try_block: vec![expr_stmt(Expr::num(1.0))],
                catch_var: VarRef::parameter("e", 0),
                catch_block: vec![expr_stmt(Expr::num(2.0))],
                escaping: vec![],
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        let stream = masm.instructions();
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::PushTryHandler(HandlerKind::TryCatch, _))));
        // Exactly one unlink: the fall-through path; no escapes were taken.
        assert_eq!(
            stream
                .iter()
                .filter(|i| matches!(i, Instr::PopTryHandler))
                .count(),
            1
        );
        // The caught exception is stored into the catch binding's slot.
        assert!(stream.iter().any(|i| matches!(i, Instr::Sw(_, _))));
    }

    #[test]
    fn test_return_in_try_finally_gets_an_unlink_block() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&Stmt::TryFinally {
                try_block: vec![Stmt::Return {
                    value: Expr::num(7.0),
                    pos: SourcePos::NONE,
                }],
                finally_block: vec![expr_stmt(Expr::num(1.0))],
                escaping: vec![],
            });
            // Fall-through survives: the finally block can complete
            // normally when entered by an exception that is rethrown, or
            // route to the return; the statement itself ends reachable
            // only through the non-jumping reasons.
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        let stream = masm.instructions();
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::PushTryHandler(HandlerKind::TryFinally, _))));
        // One unlink: the return escape. The try block cannot fall off
        // the end, and the exception edge is unwound by the runtime.
        assert_eq!(
            stream
                .iter()
                .filter(|i| matches!(i, Instr::PopTryHandler))
                .count(),
            1
        );
        // The dispatch rethrows when the reason says so.
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::ReThrow, 1))));
        // The jumping reason for the return shadow is reason code 2.
        assert!(stream.iter().any(|i| matches!(
            i,
            Instr::LoadImm(_, Operand::Const(Constant::Smi(s))) if s.value() == JUMPING_BASE
        )));
    }

    #[test]
    fn test_break_out_of_try_catch_is_shadowed() {
        let masm = with_cgen(1, |cgen| {
            let id = TargetId(1);
            cgen.visit_stmt(&Stmt::While {
                id,
                cond: Expr::var(VarRef::parameter("x", 0)),
                body: Box::new(Stmt::TryCatch {
                    try_block: vec![Stmt::Break { target: id }],
                    catch_var: VarRef::parameter("x", 0),
                    catch_block: vec![],
                    escaping: vec![EscapeTarget {
                        kind: EscapeKind::Break,
                        id,
                    }],
                }),
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        let stream = masm.instructions();
        // The break gets its own unlink block; fall-through of the try
        // block is dead, and the catch edge is unwound by the runtime.
        assert_eq!(
            stream
                .iter()
                .filter(|i| matches!(i, Instr::PopTryHandler))
                .count(),
            1
        );
    }
}
