//! Statement visitors
//!
//! Statements are height-neutral: whatever a statement pushes it also
//! consumes. Loop tops are bidirectional targets bound over a spilled
//! frame, so back edges are single jumps; break and continue reach their
//! loops through the target tables keyed by the front end's ids.

use crate::ast::{Expr, Literal, Slot, Stmt, SwitchCase, TargetId, VarLocation, VarRef};
use crate::codegen::{CodeGenerator, InitState};
use crate::jump_target::BreakTarget;
use quill_common::{smi, SourcePos, Smi};
use quill_masm::{
    field, layout, Builtin, Condition, Constant, Operand, Reg, RootIndex, RuntimeFn,
};

/// The boolean value of a condition decidable at compile time.
fn literal_condition(expr: &Expr) -> Option<bool> {
    match expr {
        Expr::Literal(Literal::Bool(b)) => Some(*b),
        Expr::Literal(Literal::Number(n)) => Some(*n != 0.0 && !n.is_nan()),
        Expr::Literal(Literal::Str(s)) => Some(!s.is_empty()),
        Expr::Literal(Literal::Null) | Expr::Literal(Literal::Undefined) => Some(false),
        _ => None,
    }
}

impl<'a> CodeGenerator<'a> {
    pub(crate) fn visit_block(&mut self, id: TargetId, stmts: &[Stmt]) {
        self.masm.comment("block");
        let height = self.frame_mut().height();
        self.install_break_target(id, BreakTarget::with_height(height));
        self.visit_statements(stmts);
        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
    }

    pub(crate) fn visit_declaration(&mut self, var: &VarRef, init: &Option<Expr>, pos: SourcePos) {
        self.masm.comment(format!("declare {}", var.name));
        self.masm.position(pos);
        let is_const = Self::is_const_mode(var.mode);
        match &var.location {
            // The name itself was batch-declared in the prologue; only an
            // initial value needs code here.
            VarLocation::Global => {
                if let Some(init) = init {
                    {
                        let (masm, frame) = self.parts();
                        let f = frame.as_mut().unwrap();
                        f.spill_all(masm);
                        masm.lw(
                            Reg::SCRATCH0,
                            field(
                                Reg::Cp,
                                layout::context_slot_offset(layout::CONTEXT_GLOBAL_INDEX),
                            ),
                        );
                        f.emit_push(masm, Reg::SCRATCH0);
                    }
                    self.load(init);
                    let (masm, frame) = self.parts();
                    frame
                        .as_mut()
                        .unwrap()
                        .call_store_ic(masm, var.name.clone());
                }
            }
            // Eval-introduced variables are declared into the current
            // context by the runtime.
            VarLocation::Slot(Slot::Lookup { .. }) => {
                let flag = if is_const { 1 } else { 0 };
                self.frame_mut()
                    .push_constant(Constant::Str(var.name.clone()));
                self.frame_mut()
                    .push_constant(Constant::Smi(Smi::new(flag).expect("flag is a smi")));
                if let Some(init) = init {
                    self.load(init);
                } else if is_const {
                    self.frame_mut().push_constant(Constant::TheHole);
                } else {
                    self.frame_mut().push_constant(Constant::Undefined);
                }
                let (masm, frame) = self.parts();
                frame
                    .as_mut()
                    .unwrap()
                    .call_runtime(masm, RuntimeFn::DeclareContextSlot, 3);
            }
            VarLocation::Slot(slot) => {
                // Stack locals are pre-initialized to undefined; only
                // consts and explicit initial values need a store.
                if init.is_none() && !is_const {
                    return;
                }
                if let Some(init) = init {
                    self.load(init);
                } else {
                    self.frame_mut().push_constant(Constant::TheHole);
                }
                let init_state = if is_const {
                    InitState::ConstInit
                } else {
                    InitState::NotConstInit
                };
                self.store_to_slot(slot, var.mode, &var.name, init_state);
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
            }
        }
    }

    pub(crate) fn visit_expression_statement(&mut self, expr: &Expr, pos: SourcePos) {
        self.masm.position(pos);
        self.load(expr);
        let (masm, frame) = self.parts();
        frame.as_mut().unwrap().drop_(masm, 1);
    }

    pub(crate) fn visit_if(
        &mut self,
        cond: &Expr,
        then_stmt: &Stmt,
        else_stmt: Option<&Stmt>,
        pos: SourcePos,
    ) {
        self.masm.comment("if statement");
        self.masm.position(pos);
        let has_then = !matches!(then_stmt, Stmt::Empty);
        let has_else = else_stmt.is_some_and(|s| !matches!(s, Stmt::Empty));

        if has_then && has_else {
            let mut then_target = BreakTarget::new();
            let mut else_target = BreakTarget::new();
            let mut exit = BreakTarget::new();
            self.load_condition(cond, &mut then_target, &mut else_target);
            if self.cc.is_some() {
                self.branch_false(&mut else_target);
            }
            if then_target.is_linked() {
                let (masm, frame) = self.parts();
                then_target.bind(masm, frame);
            }
            if self.has_valid_frame() {
                self.visit_stmt(then_stmt);
            }
            if self.has_valid_frame() {
                let (masm, frame) = self.parts();
                exit.jump(masm, frame);
            }
            if else_target.is_linked() {
                let (masm, frame) = self.parts();
                else_target.bind(masm, frame);
                self.visit_stmt(else_stmt.expect("else branch present"));
            }
            if exit.is_linked() {
                let (masm, frame) = self.parts();
                exit.bind(masm, frame);
            }
        } else if has_then {
            let mut then_target = BreakTarget::new();
            let mut exit = BreakTarget::new();
            self.load_condition(cond, &mut then_target, &mut exit);
            if self.cc.is_some() {
                self.branch_false(&mut exit);
            }
            if then_target.is_linked() {
                let (masm, frame) = self.parts();
                then_target.bind(masm, frame);
            }
            if self.has_valid_frame() {
                self.visit_stmt(then_stmt);
            }
            if exit.is_linked() {
                let (masm, frame) = self.parts();
                exit.bind(masm, frame);
            }
        } else if has_else {
            let mut else_target = BreakTarget::new();
            let mut exit = BreakTarget::new();
            self.load_condition(cond, &mut exit, &mut else_target);
            if self.cc.is_some() {
                self.branch_true(&mut exit);
            }
            if else_target.is_linked() {
                let (masm, frame) = self.parts();
                else_target.bind(masm, frame);
            }
            if self.has_valid_frame() {
                self.visit_stmt(else_stmt.expect("else branch present"));
            }
            if exit.is_linked() {
                let (masm, frame) = self.parts();
                exit.bind(masm, frame);
            }
        } else {
            // Both arms empty: the condition still runs for its effects.
            self.load(cond);
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        }
    }

    pub(crate) fn visit_continue(&mut self, id: TargetId) {
        let mut target = self.take_continue_target(id);
        let (masm, frame) = self.parts();
        target.jump(masm, frame);
        self.install_continue_target(id, target);
    }

    pub(crate) fn visit_break(&mut self, id: TargetId) {
        let mut target = self.take_break_target(id);
        let (masm, frame) = self.parts();
        target.jump(masm, frame);
        self.install_break_target(id, target);
    }

    pub(crate) fn visit_return(&mut self, value: &Expr, pos: SourcePos) {
        self.masm.comment("return statement");
        self.masm.position(pos);
        self.load(value);
        {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.spill_all(masm);
            f.emit_pop(masm, Reg::V0);
        }
        // The return target may be shadowed by an enclosing try block, in
        // which case this jump reaches the unlink code instead.
        let mut ret = std::mem::take(&mut self.function_return);
        let (masm, frame) = self.parts();
        ret.jump(masm, frame);
        self.function_return = ret;
    }

    pub(crate) fn visit_while(&mut self, id: TargetId, cond: &Expr, body: &Stmt, pos: SourcePos) {
        let analysis = literal_condition(cond);
        if analysis == Some(false) {
            return;
        }
        self.masm.comment("while loop");
        self.masm.position(pos);
        self.loop_nesting += 1;
        let height = self.frame_mut().height();
        self.install_break_target(id, BreakTarget::with_height(height));

        // The loop top doubles as the continue target.
        let mut top = BreakTarget::bidirectional_with_height(height);
        {
            let (masm, frame) = self.parts();
            top.bind(masm, frame);
        }
        self.install_continue_target(id, top);
        self.reapply_smi_hints();
        self.check_stack();

        if analysis.is_none() {
            let mut body_enter = BreakTarget::new();
            let mut brk = self.take_break_target(id);
            self.load_condition(cond, &mut body_enter, &mut brk);
            if self.cc.is_some() {
                self.branch_false(&mut brk);
            }
            self.install_break_target(id, brk);
            if body_enter.is_linked() {
                let (masm, frame) = self.parts();
                body_enter.bind(masm, frame);
            }
        }
        if self.has_valid_frame() {
            self.visit_stmt(body);
        }
        let mut top = self.take_continue_target(id);
        if self.has_valid_frame() {
            let (masm, frame) = self.parts();
            top.jump(masm, frame);
        }
        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
        self.loop_nesting -= 1;
    }

    pub(crate) fn visit_do_while(
        &mut self,
        id: TargetId,
        body: &Stmt,
        cond: &Expr,
        condition_pos: SourcePos,
    ) {
        self.masm.comment("do-while loop");
        self.loop_nesting += 1;
        let height = self.frame_mut().height();
        self.install_break_target(id, BreakTarget::with_height(height));
        // Continue re-tests the condition, which sits below the body.
        self.install_continue_target(id, BreakTarget::with_height(height));

        let mut top = BreakTarget::bidirectional_with_height(height);
        {
            let (masm, frame) = self.parts();
            top.bind(masm, frame);
        }
        self.reapply_smi_hints();
        self.check_stack();
        self.visit_stmt(body);

        let mut cont = self.take_continue_target(id);
        if cont.is_linked() {
            let (masm, frame) = self.parts();
            cont.bind(masm, frame);
        }
        if self.has_valid_frame() {
            self.masm.position(condition_pos);
            match literal_condition(cond) {
                Some(true) => {
                    let (masm, frame) = self.parts();
                    top.jump(masm, frame);
                }
                Some(false) => {}
                None => {
                    let mut brk = self.take_break_target(id);
                    self.load_condition(cond, &mut top, &mut brk);
                    if self.cc.is_some() {
                        self.branch_true(&mut top);
                    }
                    self.install_break_target(id, brk);
                }
            }
        }
        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
        self.loop_nesting -= 1;
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn visit_for(
        &mut self,
        id: TargetId,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        next: Option<&Stmt>,
        body: &Stmt,
        loop_var_smi: Option<&Slot>,
        pos: SourcePos,
    ) {
        self.masm.comment("for loop");
        self.masm.position(pos);
        if let Some(init) = init {
            self.visit_stmt(init);
        }
        if !self.has_valid_frame() || self.has_bailout() {
            return;
        }
        let analysis = cond.map_or(Some(true), literal_condition);
        if analysis == Some(false) {
            return;
        }
        self.loop_nesting += 1;
        let height = self.frame_mut().height();

        // A loop variable the front end proved smi keeps its refinement
        // across the join at the loop top.
        let hint = loop_var_smi.and_then(|slot| match slot {
            Slot::Parameter(i) => Some(self.frame_mut().parameter_index(*i)),
            Slot::Local(i) => Some(self.frame_mut().local_index(*i)),
            _ => None,
        });
        if let Some(index) = hint {
            self.push_smi_hint(index);
        }

        self.install_break_target(id, BreakTarget::with_height(height));
        // With a next clause, continue runs it before re-entering; without
        // one, continue is the loop top itself.
        let mut top = if next.is_some() {
            self.install_continue_target(id, BreakTarget::with_height(height));
            let mut t = BreakTarget::bidirectional_with_height(height);
            let (masm, frame) = self.parts();
            t.bind(masm, frame);
            Some(t)
        } else {
            let mut t = BreakTarget::bidirectional_with_height(height);
            {
                let (masm, frame) = self.parts();
                t.bind(masm, frame);
            }
            self.install_continue_target(id, t);
            None
        };
        self.reapply_smi_hints();
        self.check_stack();

        if analysis.is_none() {
            let cond = cond.expect("unknown condition implies a condition");
            let mut body_enter = BreakTarget::new();
            let mut brk = self.take_break_target(id);
            self.load_condition(cond, &mut body_enter, &mut brk);
            if self.cc.is_some() {
                self.branch_false(&mut brk);
            }
            self.install_break_target(id, brk);
            if body_enter.is_linked() {
                let (masm, frame) = self.parts();
                body_enter.bind(masm, frame);
            }
        }
        if self.has_valid_frame() {
            self.visit_stmt(body);
        }

        let mut cont = self.take_continue_target(id);
        match top.as_mut() {
            Some(top) => {
                if cont.is_linked() {
                    let (masm, frame) = self.parts();
                    cont.bind(masm, frame);
                }
                if self.has_valid_frame() {
                    if let Some(next) = next {
                        self.visit_stmt(next);
                    }
                }
                if self.has_valid_frame() {
                    let (masm, frame) = self.parts();
                    top.jump(masm, frame);
                }
            }
            None => {
                // cont is the bound loop top.
                if self.has_valid_frame() {
                    let (masm, frame) = self.parts();
                    cont.jump(masm, frame);
                }
            }
        }
        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
        if hint.is_some() {
            self.pop_smi_hint();
        }
        self.loop_nesting -= 1;
    }

    pub(crate) fn visit_for_in(
        &mut self,
        id: TargetId,
        each: &Expr,
        enumerable: &Expr,
        body: &Stmt,
        pos: SourcePos,
    ) {
        self.masm.comment("for-in loop");
        self.masm.position(pos);
        self.loop_nesting += 1;
        let base = self.frame_mut().height();
        let mut exit = BreakTarget::with_height(base);

        self.load(enumerable);
        {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.spill_all(masm);
            let obj = f.pop_to_register(masm, None);

            // Nothing enumerates over null or undefined.
            masm.load_root(Reg::SCRATCH0, RootIndex::Undefined);
            exit.branch(masm, f, Condition::Eq, obj, Operand::Reg(Reg::SCRATCH0));
            masm.load_root(Reg::SCRATCH0, RootIndex::Null);
            exit.branch(masm, f, Condition::Eq, obj, Operand::Reg(Reg::SCRATCH0));

            // Primitives are wrapped before enumeration.
            let is_object = masm.new_label();
            let wrap = masm.new_label();
            masm.and_(Reg::SCRATCH0, obj, Operand::Imm(smi::TAG_MASK));
            masm.branch(Condition::Eq, Reg::SCRATCH0, Operand::zero(), wrap);
            masm.lw(Reg::SCRATCH1, field(obj, layout::HEAP_OBJECT_MAP_OFFSET));
            masm.lbu(
                Reg::SCRATCH0,
                field(Reg::SCRATCH1, layout::MAP_INSTANCE_TYPE_OFFSET),
            );
            masm.branch(
                Condition::Ge,
                Reg::SCRATCH0,
                Operand::Imm(layout::FIRST_JS_OBJECT_TYPE),
                is_object,
            );
            masm.bind(wrap);
            masm.push(obj);
            f.adjust(1);
            f.call_builtin(masm, Builtin::ToObject, 1);
            masm.mov(obj, Reg::V0);
            masm.bind(is_object);
            f.emit_push(masm, obj);

            // Enumerable property names; the runtime answers either the
            // receiver map (carrying a live enum cache) or a plain fixed
            // array of names.
            f.dup();
            f.call_runtime(masm, RuntimeFn::GetPropertyNamesFast, 1);

            // Loop state: [object, cached map or zero, names, length, index].
            let fixed_case = masm.new_label();
            let setup_done = masm.new_label();
            masm.lw(Reg::SCRATCH0, field(Reg::V0, layout::HEAP_OBJECT_MAP_OFFSET));
            masm.load_root(Reg::SCRATCH1, RootIndex::FixedArrayMap);
            masm.branch(
                Condition::Eq,
                Reg::SCRATCH0,
                Operand::Reg(Reg::SCRATCH1),
                fixed_case,
            );
            masm.push(Reg::V0);
            masm.lw(
                Reg::SCRATCH0,
                field(Reg::V0, layout::MAP_INSTANCE_DESCRIPTORS_OFFSET),
            );
            masm.lw(
                Reg::SCRATCH0,
                field(Reg::SCRATCH0, layout::DESCRIPTORS_ENUM_CACHE_OFFSET),
            );
            masm.lw(
                Reg::SCRATCH2,
                field(Reg::SCRATCH0, layout::ENUM_CACHE_BRIDGE_CACHE_OFFSET),
            );
            masm.push(Reg::SCRATCH2);
            masm.lw(
                Reg::SCRATCH0,
                field(Reg::SCRATCH2, layout::FIXED_ARRAY_LENGTH_OFFSET),
            );
            masm.push(Reg::SCRATCH0);
            masm.jump(setup_done);
            masm.bind(fixed_case);
            // A zero in the map slot marks every key as needing a
            // presence check.
            masm.li(Reg::SCRATCH0, Operand::Smi(Smi::ZERO));
            masm.push(Reg::SCRATCH0);
            masm.push(Reg::V0);
            masm.lw(
                Reg::SCRATCH0,
                field(Reg::V0, layout::FIXED_ARRAY_LENGTH_OFFSET),
            );
            masm.push(Reg::SCRATCH0);
            masm.bind(setup_done);
            masm.li(Reg::SCRATCH0, Operand::Smi(Smi::ZERO));
            masm.push(Reg::SCRATCH0);
            f.adjust(4);
        }
        let height = base + 5;
        self.install_break_target(id, BreakTarget::with_height(height));
        self.install_continue_target(id, BreakTarget::with_height(height));

        let mut entry = BreakTarget::bidirectional_with_height(height);
        {
            let (masm, frame) = self.parts();
            entry.bind(masm, frame);
        }
        {
            let mut brk = self.take_break_target(id);
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            masm.lw(Reg::SCRATCH0, f.element_operand(base + 4));
            masm.lw(Reg::SCRATCH1, f.element_operand(base + 3));
            brk.branch(
                masm,
                f,
                Condition::Ge,
                Reg::SCRATCH0,
                Operand::Reg(Reg::SCRATCH1),
            );
            self.install_break_target(id, brk);
        }
        {
            // key = names[index]; the tagged index doubles as half the
            // byte offset.
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            masm.lw(Reg::SCRATCH2, f.element_operand(base + 2));
            masm.lw(Reg::SCRATCH0, f.element_operand(base + 4));
            masm.sll(Reg::SCRATCH0, Reg::SCRATCH0, 1);
            masm.add(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Reg(Reg::SCRATCH2));
            masm.lw(
                Reg::SCRATCH2,
                field(Reg::SCRATCH0, layout::FIXED_ARRAY_HEADER_SIZE),
            );
        }
        {
            // A cached map that still matches the object guarantees the
            // key; otherwise the runtime filters deleted and shadowed
            // properties.
            let end_del_check = self.masm.new_label();
            {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                masm.lw(Reg::SCRATCH0, f.element_operand(base + 1));
                masm.lw(Reg::SCRATCH1, f.element_operand(base));
                masm.lw(
                    Reg::SCRATCH1,
                    field(Reg::SCRATCH1, layout::HEAP_OBJECT_MAP_OFFSET),
                );
                masm.branch(
                    Condition::Eq,
                    Reg::SCRATCH0,
                    Operand::Reg(Reg::SCRATCH1),
                    end_del_check,
                );
                masm.lw(Reg::SCRATCH0, f.element_operand(base));
                masm.push(Reg::SCRATCH0);
                masm.push(Reg::SCRATCH2);
                f.adjust(2);
                f.call_builtin(masm, Builtin::FilterKey, 2);
                masm.mov(Reg::SCRATCH2, Reg::V0);
            }
            {
                let mut cont = self.take_continue_target(id);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                masm.load_root(Reg::SCRATCH0, RootIndex::Undefined);
                cont.branch(
                    masm,
                    f,
                    Condition::Eq,
                    Reg::SCRATCH2,
                    Operand::Reg(Reg::SCRATCH0),
                );
                masm.bind(end_del_check);
                f.emit_push(masm, Reg::SCRATCH2);
                self.install_continue_target(id, cont);
            }
        }
        // Assign the key to the target expression, then drop it.
        {
            let mut r = self.load_reference(each, false);
            if r.size() > 0 {
                let key_index = self.frame_mut().height() - 1 - r.size();
                self.frame_mut().push_element_copy(key_index);
            }
            self.set_reference_value(&mut r, InitState::NotConstInit);
            let extra = self.frame_mut().height() - height;
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, extra);
        }

        self.visit_stmt(body);

        let mut cont = self.take_continue_target(id);
        if cont.is_linked() {
            let (masm, frame) = self.parts();
            cont.bind(masm, frame);
        }
        if self.has_valid_frame() {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            masm.lw(Reg::SCRATCH0, f.element_operand(base + 4));
            masm.add(
                Reg::SCRATCH0,
                Reg::SCRATCH0,
                Operand::Smi(Smi::new(1).expect("one is a smi")),
            );
            f.store_to_element(masm, base + 4, Reg::SCRATCH0);
            entry.jump(masm, frame);
        }

        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
        if self.has_valid_frame() {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 5);
        }
        if exit.is_linked() {
            let (masm, frame) = self.parts();
            exit.bind(masm, frame);
        }
        self.loop_nesting -= 1;
    }

    pub(crate) fn visit_switch(
        &mut self,
        id: TargetId,
        tag: &Expr,
        cases: &[SwitchCase],
        pos: SourcePos,
    ) {
        self.masm.comment("switch statement");
        self.masm.position(pos);
        let height = self.frame_mut().height();
        self.install_break_target(id, BreakTarget::with_height(height));

        self.load(tag);
        let mut case_targets: Vec<BreakTarget> =
            cases.iter().map(|_| BreakTarget::new()).collect();
        let mut default_entry = BreakTarget::new();
        let has_default = cases.iter().any(|c| c.label.is_none());

        // Test chain: each clause label is compared strictly against a
        // copy of the tag; a miss falls into the next test.
        for (i, case) in cases.iter().enumerate() {
            let label = match &case.label {
                Some(label) => label,
                None => continue,
            };
            self.frame_mut().dup();
            self.load(label);
            self.comparison_on_frame(Condition::Eq, true);
            self.branch_true(&mut case_targets[i]);
        }
        // No label matched.
        {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        }
        if has_default {
            let (masm, frame) = self.parts();
            default_entry.jump(masm, frame);
        } else {
            let mut brk = self.take_break_target(id);
            let (masm, frame) = self.parts();
            brk.jump(masm, frame);
            self.install_break_target(id, brk);
        }

        // Bodies in source order; a matched clause enters with the tag
        // still on the frame and drops it, and bodies fall through.
        for (i, case) in cases.iter().enumerate() {
            let mut fall = BreakTarget::new();
            if self.has_valid_frame() {
                let (masm, frame) = self.parts();
                fall.jump(masm, frame);
            }
            if case.label.is_some() {
                let (masm, frame) = self.parts();
                case_targets[i].bind(masm, frame);
                frame.as_mut().unwrap().drop_(masm, 1);
            } else {
                let (masm, frame) = self.parts();
                default_entry.bind(masm, frame);
            }
            if fall.is_linked() {
                let (masm, frame) = self.parts();
                fall.bind(masm, frame);
            }
            self.visit_statements(&case.body);
        }

        let mut brk = self.take_break_target(id);
        if brk.is_linked() {
            let (masm, frame) = self.parts();
            brk.bind(masm, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionInfo, ScopeInfo};
    use crate::frame::VirtualFrame;
    use quill_masm::{Instr, MacroAssembler, Stub};

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

    fn while_loop(cond: Expr, body: Stmt) -> Stmt {
        Stmt::While {
            id: TargetId(1),
            cond,
            body: Box::new(body),
            pos: SourcePos::NONE,
        }
    }

    fn expr_stmt(expr: Expr) -> Stmt {
        Stmt::Expression {
            expr,
            pos: SourcePos::NONE,
        }
    }

    #[test]
    fn test_while_false_compiles_to_nothing() {
        let masm = with_cgen(0, |cgen| {
            cgen.visit_stmt(&while_loop(
                Expr::Literal(Literal::Bool(false)),
                expr_stmt(Expr::num(1.0)),
            ));
            assert_eq!(cgen.frame_mut().height(), 0);
        });
        assert_eq!(masm.len(), 0);
    }

    #[test]
    fn test_while_loop_checks_stack_per_iteration() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&while_loop(
                Expr::var(crate::ast::VarRef::parameter("x", 0)),
                expr_stmt(Expr::num(1.0)),
            ));
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        let stream = masm.instructions();
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::CallStub(Stub::StackCheck))));
        // The back edge jumps to the loop top.
        assert!(stream.iter().any(|i| matches!(i, Instr::Jump(_))));
    }

    #[test]
    fn test_loop_bodies_raise_the_nesting_level() {
        with_cgen(1, |cgen| {
            assert!(!cgen.in_loop());
            cgen.visit_stmt(&while_loop(
                Expr::var(crate::ast::VarRef::parameter("x", 0)),
                expr_stmt(Expr::num(1.0)),
            ));
            assert!(!cgen.in_loop());
        });
    }

    #[test]
    fn test_if_without_else_falls_through() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&Stmt::If {
                cond: Expr::var(crate::ast::VarRef::parameter("x", 0)),
                then_stmt: Box::new(expr_stmt(Expr::num(1.0))),
                else_stmt: None,
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallStub(Stub::ToBoolean))));
    }

    #[test]
    fn test_return_pops_result_into_v0() {
        let masm = with_cgen(0, |cgen| {
            cgen.visit_stmt(&Stmt::Return {
                value: Expr::num(42.0),
                pos: SourcePos::NONE,
            });
            // The jump to the return sequence consumed the frame.
            assert!(!cgen.has_valid_frame());
        });
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::Pop(Reg::V0))));
    }

    #[test]
    fn test_break_leaves_the_loop() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&while_loop(
                Expr::var(crate::ast::VarRef::parameter("x", 0)),
                Stmt::Break { target: TargetId(1) },
            ));
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        assert!(masm.instructions().iter().any(|i| matches!(i, Instr::Jump(_))));
    }

    #[test]
    fn test_for_in_builds_five_words_of_loop_state() {
        let masm = with_cgen(2, |cgen| {
            cgen.visit_stmt(&Stmt::ForIn {
                id: TargetId(1),
                each: Expr::var(crate::ast::VarRef::parameter("k", 0)),
                enumerable: Expr::var(crate::ast::VarRef::parameter("o", 1)),
                body: Box::new(expr_stmt(Expr::num(1.0))),
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        let stream = masm.instructions();
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::GetPropertyNamesFast, 1))));
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::CallBuiltin(Builtin::FilterKey, 2))));
        // Leaving the loop unwinds the five state words at once.
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::AddSp(20))));
    }

    #[test]
    fn test_switch_compares_strictly_and_drops_the_tag() {
        let masm = with_cgen(1, |cgen| {
            cgen.visit_stmt(&Stmt::Switch {
                id: TargetId(1),
                tag: Expr::var(crate::ast::VarRef::parameter("x", 0)),
                cases: vec![
                    SwitchCase {
                        label: Some(Expr::num(1.0)),
                        body: vec![expr_stmt(Expr::num(10.0))],
                    },
                    SwitchCase {
                        label: None,
                        body: vec![expr_stmt(Expr::num(20.0))],
                    },
                ],
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::Compare { strict: true, .. })
        )));
    }

    #[test]
    fn test_const_declaration_stores_the_hole() {
        let masm = with_cgen(0, |cgen| {
            let mut var = VarRef::local("c", 0);
            var.mode = crate::ast::VariableMode::Const;
            // One stack local backs the const.
            cgen.frame = Some(VirtualFrame::new(0, 1));
            cgen.frame_mut().push_constant(Constant::Undefined);
            let frame_fixup = cgen.frame_mut().height();
            assert_eq!(frame_fixup, 1);
            cgen.visit_stmt(&Stmt::Declaration {
                var,
                init: None,
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::LoadImm(_, Operand::Const(Constant::TheHole))
        )));
    }
}
