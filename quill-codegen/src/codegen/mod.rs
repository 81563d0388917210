//! Code generator
//!
//! A single pass over the function body, maintaining the virtual frame as
//! the model of the machine state. Expressions push exactly one element in
//! value context; statements are height-neutral. In condition context an
//! expression may instead leave a pending condition code (a comparison
//! waiting to be branched on) or branch directly to the supplied targets;
//! both protocols come from `load_condition`.
//!
//! The generator is single-threaded and function-scoped: all state lives
//! on this struct, and nested function literals are compiled by fresh
//! generators.

mod expr;
mod property;
mod slots;
mod smi;
mod stmt;
mod try_block;

use crate::ast::{Expr, FunctionInfo, Stmt, TargetId, VariableMode};
use crate::deferred::DeferredBlock;
use crate::frame::{TypeInfo, VirtualFrame};
use crate::jump_target::BreakTarget;
use log::{debug, trace};
use quill_common::{BailoutReason, Smi};
use quill_masm::{
    layout, Condition, Constant, MacroAssembler, MemOperand, Operand, Reg, RootIndex, RuntimeFn,
    Stub,
};
use std::collections::HashMap;

/// Nesting budget for the recursive walk; beyond it the function bails
/// out and the caller picks another execution strategy.
const MAX_AST_DEPTH: usize = 512;

/// Ceiling on parameter plus local slots a compiled frame may hold.
const MAX_FRAME_SLOTS: usize = 1 << 14;

/// Ceiling on out-of-line slow-path blocks for one function.
const MAX_DEFERRED_BLOCKS: usize = 256;

/// Whether a variable load happens under `typeof`, where unresolvable
/// names must produce undefined instead of a reference error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeofState {
    Inside,
    NotInside,
}

/// Whether a slot store is the initialization of a const binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    ConstInit,
    NotConstInit,
}

/// A pending condition: branch on `cond` applied to `lhs ? rhs`.
#[derive(Debug, Clone)]
pub struct CondState {
    pub cond: Condition,
    pub lhs: Reg,
    pub rhs: Operand,
}

pub struct CodeGenerator<'a> {
    masm: &'a mut MacroAssembler,
    info: &'a FunctionInfo,
    frame: Option<VirtualFrame>,
    cc: Option<CondState>,
    loop_nesting: usize,
    deferred: Vec<DeferredBlock>,
    function_return: BreakTarget,
    break_targets: HashMap<TargetId, BreakTarget>,
    continue_targets: HashMap<TargetId, BreakTarget>,
    /// Element indices whose smi refinement is re-asserted after joins
    /// (the fast-smi-loop hint).
    smi_slot_hints: Vec<usize>,
    bailout: Option<BailoutReason>,
    depth: usize,
}

/// Compile one function into the assembler's stream.
pub fn generate(info: &FunctionInfo, masm: &mut MacroAssembler) -> Result<(), BailoutReason> {
    debug!(
        "generating code for '{}' ({} params, {} locals)",
        info.name, info.scope.param_count, info.scope.local_count
    );
    let mut cgen = CodeGenerator::new(info, masm);
    cgen.generate_function();
    let deferred_count = cgen.deferred.len();
    cgen.flush_deferred_code();
    match cgen.bailout {
        Some(reason) => {
            debug!("bailing out of '{}': {}", info.name, reason);
            Err(reason)
        }
        None => {
            debug!(
                "finished '{}': {} deferred blocks",
                info.name, deferred_count
            );
            Ok(())
        }
    }
}

impl<'a> CodeGenerator<'a> {
    fn new(info: &'a FunctionInfo, masm: &'a mut MacroAssembler) -> CodeGenerator<'a> {
        let return_height = info.scope.param_count + info.scope.local_count;
        CodeGenerator {
            masm,
            info,
            frame: None,
            cc: None,
            loop_nesting: info.loop_nesting,
            deferred: Vec::new(),
            function_return: BreakTarget::with_height(return_height),
            break_targets: HashMap::new(),
            continue_targets: HashMap::new(),
            smi_slot_hints: Vec::new(),
            bailout: None,
            depth: 0,
        }
    }

    // Accessors and borrow splitting.

    pub(crate) fn has_valid_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub(crate) fn frame_mut(&mut self) -> &mut VirtualFrame {
        self.frame.as_mut().expect("no current frame")
    }

    /// The assembler and the (optional) frame, borrowed apart.
    pub(crate) fn parts(&mut self) -> (&mut MacroAssembler, &mut Option<VirtualFrame>) {
        (self.masm, &mut self.frame)
    }

    pub(crate) fn in_loop(&self) -> bool {
        self.loop_nesting > 0
    }

    pub(crate) fn set_bailout(&mut self, reason: BailoutReason) {
        if self.bailout.is_none() {
            self.bailout = Some(reason);
        }
    }

    pub(crate) fn has_bailout(&self) -> bool {
        self.bailout.is_some()
    }

    // Function-level driving.

    fn generate_function(&mut self) {
        let info = self.info;
        if info.scope.param_count + info.scope.local_count > MAX_FRAME_SLOTS {
            self.set_bailout(BailoutReason::FrameTooLarge);
            return;
        }
        self.masm.position(info.function_pos);
        self.masm.comment(format!("function {}", info.name));

        let mut frame = VirtualFrame::new(info.scope.param_count, info.scope.local_count);
        frame.enter(self.masm);
        frame.allocate_locals(self.masm);
        self.frame = Some(frame);

        if info.scope.heap_slot_count > 0 {
            self.allocate_function_context();
        }
        for &(param, ctx_index) in &info.scope.context_params {
            self.copy_parameter_to_context(param, ctx_index);
        }
        if info.scope.arguments.is_some() {
            self.store_arguments_object();
        }
        self.check_stack();

        if let Some(throw) = &info.scope.illegal_redeclaration {
            // Conflicting declarations: the body is replaced with code
            // that throws when the function runs.
            self.masm.comment("illegal redeclaration");
            self.visit_expr(throw);
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        } else {
            self.process_declarations();
            let body = &info.body;
            self.visit_statements(body);
        }

        if self.has_bailout() {
            return;
        }

        // Fall-off-the-end returns undefined.
        if self.has_valid_frame() {
            debug_assert!(self.cc.is_none());
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            debug_assert_eq!(f.expression_height(), 0);
            f.spill_all(masm);
            masm.load_root(Reg::V0, RootIndex::Undefined);
            if self.function_return.is_linked() {
                self.bind_function_return();
            }
            self.generate_return_sequence();
        } else if self.function_return.is_linked() {
            self.bind_function_return();
            self.generate_return_sequence();
        }
    }

    fn bind_function_return(&mut self) {
        let mut ret = std::mem::take(&mut self.function_return);
        let (masm, frame) = self.parts();
        ret.bind(masm, frame);
        self.function_return = ret;
    }

    /// The return value is in v0 and the expression stack is empty.
    fn generate_return_sequence(&mut self) {
        let (masm, frame) = self.parts();
        let mut f = frame.take().expect("return without a frame");
        masm.comment("return sequence");
        f.exit(masm);
    }

    fn flush_deferred_code(&mut self) {
        let blocks = std::mem::take(&mut self.deferred);
        if !blocks.is_empty() {
            trace!("flushing {} deferred blocks", blocks.len());
            self.masm.comment("deferred code");
        }
        for block in blocks {
            block.generate(self.masm);
        }
    }

    pub(crate) fn add_deferred(&mut self, block: DeferredBlock) {
        if self.deferred.len() >= MAX_DEFERRED_BLOCKS {
            self.set_bailout(BailoutReason::DeferredLimit);
            return;
        }
        self.deferred.push(block);
    }

    // Prologue pieces.

    fn allocate_function_context(&mut self) {
        self.masm.comment("allocate function context");
        let slots = self.info.scope.heap_slot_count;
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // The function object seeds the context with its scope info.
        f.spill_all(masm);
        masm.lw(Reg::SCRATCH0, f.function_operand());
        f.emit_push(masm, Reg::SCRATCH0);
        f.call_stub(masm, Stub::FastNewContext { slots: slots as u32 }, 1);
        masm.mov(Reg::Cp, Reg::V0);
        masm.sw(Reg::Cp, f.context_operand());
    }

    fn copy_parameter_to_context(&mut self, param: usize, ctx_index: usize) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let param_slot = f.element_operand(f.parameter_index(param));
        masm.lw(Reg::SCRATCH0, param_slot);
        let offset = layout::context_slot_offset(ctx_index as i32);
        masm.sw(Reg::SCRATCH0, quill_masm::field(Reg::Cp, offset));
        masm.record_write(Reg::Cp, offset, Reg::SCRATCH0, Reg::SCRATCH1);
    }

    fn check_stack(&mut self) {
        let (masm, frame) = self.parts();
        frame.as_mut().unwrap().spill_all(masm);
        masm.comment("stack check");
        masm.load_root(Reg::SCRATCH0, RootIndex::StackLimit);
        let ok = masm.new_label();
        masm.branch(Condition::Hs, Reg::Sp, Operand::Reg(Reg::SCRATCH0), ok);
        masm.call_stub(Stub::StackCheck);
        masm.bind(ok);
    }

    /// Batch-declare the globals this top-level code introduces, then
    /// leave per-statement visits to handle the initial values.
    fn process_declarations(&mut self) {
        if !self.info.scope.is_global {
            return;
        }
        let mut pairs = Vec::new();
        for stmt in &self.info.body {
            if let Stmt::Declaration { var, init, .. } = stmt {
                if matches!(var.location, crate::ast::VarLocation::Global) {
                    pairs.push((var.name.clone(), init.is_some()));
                }
            }
        }
        if pairs.is_empty() {
            return;
        }
        self.masm.comment("declare globals");
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        masm.li(
            Reg::SCRATCH0,
            Operand::Const(Constant::DeclarationPairs(pairs)),
        );
        f.emit_push(masm, Reg::SCRATCH0);
        masm.li(Reg::SCRATCH0, Operand::Smi(Smi::ZERO));
        f.emit_push(masm, Reg::SCRATCH0);
        f.call_runtime(masm, RuntimeFn::DeclareGlobals, 2);
    }

    // Statement walking.

    pub(crate) fn visit_statements(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if !self.has_valid_frame() || self.has_bailout() {
                break;
            }
            self.visit_stmt(stmt);
        }
    }

    pub(crate) fn visit_stmt(&mut self, stmt: &Stmt) {
        if self.has_bailout() {
            return;
        }
        if self.depth >= MAX_AST_DEPTH {
            self.set_bailout(BailoutReason::AstTooDeep);
            return;
        }
        self.depth += 1;
        debug_assert!(self.cc.is_none());
        let height = self.frame.as_ref().map(VirtualFrame::height);
        match stmt {
            Stmt::Block { id, stmts } => self.visit_block(*id, stmts),
            Stmt::Declaration { var, init, pos } => self.visit_declaration(var, init, *pos),
            Stmt::Expression { expr, pos } => self.visit_expression_statement(expr, *pos),
            Stmt::Empty => {}
            Stmt::If {
                cond,
                then_stmt,
                else_stmt,
                pos,
            } => self.visit_if(cond, then_stmt, else_stmt.as_deref(), *pos),
            Stmt::Continue { target } => self.visit_continue(*target),
            Stmt::Break { target } => self.visit_break(*target),
            Stmt::Return { value, pos } => self.visit_return(value, *pos),
            Stmt::While { id, cond, body, pos } => self.visit_while(*id, cond, body, *pos),
            Stmt::DoWhile {
                id,
                body,
                cond,
                condition_pos,
            } => self.visit_do_while(*id, body, cond, *condition_pos),
            Stmt::For {
                id,
                init,
                cond,
                next,
                body,
                loop_var_smi,
                pos,
            } => self.visit_for(
                *id,
                init.as_deref(),
                cond.as_ref(),
                next.as_deref(),
                body,
                loop_var_smi.as_ref(),
                *pos,
            ),
            Stmt::ForIn {
                id,
                each,
                enumerable,
                body,
                pos,
            } => self.visit_for_in(*id, each, enumerable, body, *pos),
            Stmt::TryCatch {
                try_block,
                catch_var,
                catch_block,
                escaping,
            } => self.visit_try_catch(try_block, catch_var, catch_block, escaping),
            Stmt::TryFinally {
                try_block,
                finally_block,
                escaping,
            } => self.visit_try_finally(try_block, finally_block, escaping),
            Stmt::Switch { id, tag, cases, pos } => self.visit_switch(*id, tag, cases, *pos),
        }
        self.depth -= 1;
        // Statements are height-neutral.
        if let (Some(before), Some(f)) = (height, self.frame.as_ref()) {
            if !self.has_bailout() {
                debug_assert_eq!(before, f.height(), "statement changed the frame height");
            }
        }
    }

    // Expression walking.

    /// Compile `expr` in value context: net effect is one new element.
    pub(crate) fn load(&mut self, expr: &Expr) {
        self.load_with_typeof(expr, TypeofState::NotInside);
    }

    pub(crate) fn load_with_typeof(&mut self, expr: &Expr, typeof_state: TypeofState) {
        if self.has_bailout() {
            // Keep heights plausible without emitting code.
            if let Some(f) = self.frame.as_mut() {
                f.push_constant(Constant::Undefined);
            }
            return;
        }
        if self.depth >= MAX_AST_DEPTH {
            self.set_bailout(BailoutReason::AstTooDeep);
            if let Some(f) = self.frame.as_mut() {
                f.push_constant(Constant::Undefined);
            }
            return;
        }
        self.depth += 1;
        let height = self.frame_mut().height();
        match expr {
            // Condition-protocol expressions load their value through the
            // boolean materialization path.
            Expr::Compare { .. } | Expr::Unary { op: crate::ast::UnaryOp::Not, .. } => {
                self.load_via_condition(expr)
            }
            _ => self.visit_expr_with_typeof(expr, typeof_state),
        }
        self.depth -= 1;
        debug_assert!(self.cc.is_none());
        if !self.has_bailout() {
            debug_assert_eq!(
                self.frame_mut().height(),
                height + 1,
                "expression did not push exactly one value"
            );
        } else if self.frame.is_some() && self.frame_mut().height() == height {
            self.frame_mut().push_constant(Constant::Undefined);
        }
    }

    pub(crate) fn visit_expr(&mut self, expr: &Expr) {
        self.load(expr);
    }

    // Condition protocol.

    pub(crate) fn set_cc(&mut self, cond: Condition, lhs: Reg, rhs: Operand) {
        debug_assert!(self.cc.is_none());
        self.cc = Some(CondState { cond, lhs, rhs });
    }

    pub(crate) fn take_cc(&mut self) -> Option<CondState> {
        self.cc.take()
    }

    /// Branch to `target` if the pending condition holds.
    pub(crate) fn branch_true(&mut self, target: &mut BreakTarget) {
        let cc = self.take_cc().expect("no pending condition");
        let (masm, frame) = self.parts();
        target.branch(masm, frame.as_mut().unwrap(), cc.cond, cc.lhs, cc.rhs);
    }

    /// Branch to `target` if the pending condition does not hold.
    pub(crate) fn branch_false(&mut self, target: &mut BreakTarget) {
        let cc = self.take_cc().expect("no pending condition");
        let (masm, frame) = self.parts();
        target.branch(
            masm,
            frame.as_mut().unwrap(),
            cc.cond.negate(),
            cc.lhs,
            cc.rhs,
        );
    }

    /// Compile `expr` in condition context. On return either a condition
    /// is pending, branches to the targets have been emitted, or both.
    /// The frame height is unchanged.
    pub(crate) fn load_condition(
        &mut self,
        expr: &Expr,
        true_target: &mut BreakTarget,
        false_target: &mut BreakTarget,
    ) {
        if self.has_bailout() {
            // A vacuous always-false condition keeps heights stable.
            self.set_cc(Condition::Ne, Reg::Zero, Operand::zero());
            return;
        }
        match expr {
            Expr::Compare { op, left, right } => {
                self.visit_comparison(*op, left, right, true_target, false_target)
            }
            Expr::Unary {
                op: crate::ast::UnaryOp::Not,
                expr: inner,
            } => {
                self.load_condition(inner, false_target, true_target);
                if let Some(cc) = &mut self.cc {
                    cc.cond = cc.cond.negate();
                }
            }
            Expr::Binary {
                op: op @ (crate::ast::BinOp::And | crate::ast::BinOp::Or),
                left,
                right,
            } => self.visit_logical_condition(*op, left, right, true_target, false_target),
            _ => {
                self.load(expr);
                self.to_boolean(true_target, false_target);
            }
        }
    }

    fn visit_logical_condition(
        &mut self,
        op: crate::ast::BinOp,
        left: &Expr,
        right: &Expr,
        true_target: &mut BreakTarget,
        false_target: &mut BreakTarget,
    ) {
        let mut fall = BreakTarget::new();
        match op {
            crate::ast::BinOp::And => {
                self.load_condition(left, &mut fall, false_target);
                if self.cc.is_some() {
                    self.branch_false(false_target);
                }
                if fall.is_linked() {
                    let (masm, frame) = self.parts();
                    fall.bind(masm, frame);
                }
                self.load_condition(right, true_target, false_target);
            }
            crate::ast::BinOp::Or => {
                self.load_condition(left, true_target, &mut fall);
                if self.cc.is_some() {
                    self.branch_true(true_target);
                }
                if fall.is_linked() {
                    let (masm, frame) = self.parts();
                    fall.bind(masm, frame);
                }
                self.load_condition(right, true_target, false_target);
            }
            _ => unreachable!(),
        }
    }

    /// Pop the top value and convert it to a pending condition, with
    /// fast-path branches for the common boolean-ish values.
    pub(crate) fn to_boolean(
        &mut self,
        true_target: &mut BreakTarget,
        false_target: &mut BreakTarget,
    ) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let reg = f.pop_to_register(masm, None);

        masm.load_root(Reg::SCRATCH0, RootIndex::False);
        false_target.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
        masm.load_root(Reg::SCRATCH0, RootIndex::True);
        true_target.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
        masm.load_root(Reg::SCRATCH0, RootIndex::Undefined);
        false_target.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
        // Zero is false, any other smi is true.
        false_target.branch(masm, f, Condition::Eq, reg, Operand::Smi(Smi::ZERO));
        masm.and_(Reg::SCRATCH0, reg, Operand::Imm(quill_common::smi::TAG_MASK));
        true_target.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());

        // Everything else asks the stub.
        f.spill_all(masm);
        masm.push(reg);
        f.adjust(1);
        f.call_stub(masm, Stub::ToBoolean, 1);
        self.set_cc(Condition::Ne, Reg::V0, Operand::zero());
    }

    /// Value-context compilation of an expression that naturally uses the
    /// condition protocol.
    fn load_via_condition(&mut self, expr: &Expr) {
        let mut true_target = BreakTarget::new();
        let mut false_target = BreakTarget::new();
        self.load_condition(expr, &mut true_target, &mut false_target);

        let mut done = BreakTarget::new();
        if self.cc.is_some() {
            self.branch_true(&mut true_target);
        }
        // Fall-through and any false links produce the false value.
        if self.has_valid_frame() || false_target.is_linked() {
            if false_target.is_linked() {
                let (masm, frame) = self.parts();
                false_target.bind(masm, frame);
            }
            self.frame_mut().push_constant(Constant::Bool(false));
            let (masm, frame) = self.parts();
            done.jump(masm, frame);
        }
        if true_target.is_linked() {
            let (masm, frame) = self.parts();
            true_target.bind(masm, frame);
            frame.as_mut().unwrap().push_constant(Constant::Bool(true));
        }
        let (masm, frame) = self.parts();
        done.bind(masm, frame);
    }

    // Break/continue target bookkeeping. Targets are taken out of the
    // table while in use so the borrow checker can see the split.

    pub(crate) fn install_break_target(&mut self, id: TargetId, target: BreakTarget) {
        self.break_targets.insert(id, target);
    }

    pub(crate) fn install_continue_target(&mut self, id: TargetId, target: BreakTarget) {
        self.continue_targets.insert(id, target);
    }

    pub(crate) fn take_break_target(&mut self, id: TargetId) -> BreakTarget {
        self.break_targets.remove(&id).expect("unknown break target")
    }

    pub(crate) fn take_continue_target(&mut self, id: TargetId) -> BreakTarget {
        self.continue_targets
            .remove(&id)
            .expect("unknown continue target")
    }

    // Fast-smi-loop hints.

    pub(crate) fn push_smi_hint(&mut self, element_index: usize) {
        self.smi_slot_hints.push(element_index);
    }

    pub(crate) fn pop_smi_hint(&mut self) {
        self.smi_slot_hints.pop();
    }

    /// Joins forget refinements; loops re-assert their proven hints.
    pub(crate) fn reapply_smi_hints(&mut self) {
        if let Some(f) = self.frame.as_mut() {
            for &index in &self.smi_slot_hints {
                f.set_element_type_info(index, TypeInfo::Smi);
            }
        }
    }

    // Shared small helpers.

    pub(crate) fn context_slot_operand(ctx: Reg, index: usize) -> MemOperand {
        quill_masm::field(ctx, layout::context_slot_offset(index as i32))
    }

    pub(crate) fn is_const_mode(mode: VariableMode) -> bool {
        mode == VariableMode::Const
    }
}
