//! Expression visitors
//!
//! Every visitor leaves exactly one new element on the frame. Comparisons
//! and logical operators go through the condition protocol in the module
//! root instead; this file holds the value-context visitors, the
//! reference machinery for assignable expressions, and the call shapes.
//!
//! Calls follow one stack convention: `receiver, function, args...` for
//! the CallFunction stub, `receiver, args...` for call ICs. Results come
//! back in `v0` and are pushed by the caller.

use crate::ast::{
    BinOp, CompareOp, Expr, Intrinsic, Literal, ObjProperty, PropertyKind, Slot, UnaryOp,
    VarLocation, VarRef,
};
use crate::codegen::{CodeGenerator, InitState, TypeofState};
use crate::frame::TypeInfo;
use crate::jump_target::BreakTarget;
use crate::reference::{RefKind, Reference};
use quill_common::{smi, SourcePos, Smi};
use quill_masm::{
    field, layout, ArgumentsAccessKind, Builtin, Condition, Constant, Operand, OverwriteMode,
    Reg, RootIndex, RuntimeFn, Stub, StubUnaryOp,
};

/// Which heap-number operand a binary stub may clobber for its result.
fn overwrite_mode(left: &Expr, right: &Expr) -> OverwriteMode {
    if !left.is_trivial() && !matches!(left, Expr::Var(_)) {
        OverwriteMode::OverwriteLeft
    } else if !right.is_trivial() && !matches!(right, Expr::Var(_)) {
        OverwriteMode::OverwriteRight
    } else {
        OverwriteMode::NoOverwrite
    }
}

impl<'a> CodeGenerator<'a> {
    pub(crate) fn visit_expr_with_typeof(&mut self, expr: &Expr, typeof_state: TypeofState) {
        match expr {
            Expr::Literal(lit) => self.visit_literal(lit),
            Expr::This => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let dest = f.allocate_register(masm, &[]);
                masm.lw(dest, f.receiver_operand());
                f.push_register(dest, TypeInfo::Unknown);
            }
            Expr::ThisFunction => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let dest = f.allocate_register(masm, &[]);
                masm.lw(dest, f.function_operand());
                f.push_register(dest, TypeInfo::Unknown);
            }
            Expr::Var(v) => self.load_variable(v, typeof_state),
            Expr::Property { obj, key, pos } => self.visit_property_load(obj, key, *pos),
            Expr::Assignment {
                target,
                op,
                value,
                pos,
            } => self.visit_assignment(target, *op, value, *pos),
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => self.visit_conditional(cond, then_expr, else_expr),
            Expr::Call { func, args, pos } => self.visit_call(func, args, *pos),
            Expr::CallNew { func, args, pos } => self.visit_call_new(func, args, *pos),
            Expr::CallIntrinsic { intrinsic, args } => self.visit_call_intrinsic(*intrinsic, args),
            Expr::Unary { op, expr } => self.visit_unary(*op, expr),
            Expr::Count {
                is_increment,
                is_prefix,
                target,
            } => self.visit_count(*is_increment, *is_prefix, target),
            Expr::Binary { op, left, right } => self.visit_binary(*op, left, right),
            Expr::Compare { .. } => unreachable!("comparisons use the condition protocol"),
            Expr::FunctionLit { info_id, .. } => self.visit_function_literal(*info_id),
            Expr::ObjectLiteral {
                boilerplate_id,
                literal_index,
                properties,
                is_shallow,
            } => self.visit_object_literal(*boilerplate_id, *literal_index, properties, *is_shallow),
            Expr::ArrayLiteral {
                boilerplate_id,
                literal_index,
                values,
                is_shallow,
            } => self.visit_array_literal(*boilerplate_id, *literal_index, values, *is_shallow),
            Expr::Throw { value, pos } => {
                self.masm.position(*pos);
                self.load(value);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_runtime(masm, RuntimeFn::Throw, 1);
                f.emit_push(masm, Reg::V0);
            }
        }
    }

    fn visit_literal(&mut self, lit: &Literal) {
        let constant = match lit {
            Literal::Undefined => Constant::Undefined,
            Literal::Null => Constant::Null,
            Literal::Bool(b) => Constant::Bool(*b),
            Literal::Number(n) => match lit.as_smi() {
                Some(s) => Constant::Smi(s),
                None => Constant::Number(*n),
            },
            Literal::Str(s) => Constant::Str(s.clone()),
        };
        self.frame_mut().push_constant(constant);
    }

    fn load_variable(&mut self, v: &VarRef, typeof_state: TypeofState) {
        match &v.location {
            VarLocation::Global => self.load_global(&v.name, typeof_state),
            VarLocation::Slot(slot) => {
                if v.is_arguments {
                    self.load_arguments_slot(slot, &v.name);
                } else {
                    self.load_from_slot(slot, v.mode, &v.name, typeof_state);
                }
            }
        }
    }

    fn visit_property_load(&mut self, obj: &Expr, key: &Expr, pos: SourcePos) {
        self.masm.position(pos);
        if let Expr::Literal(Literal::Str(name)) = key {
            let name = name.clone();
            self.load(obj);
            self.emit_named_load(&name, false);
        } else {
            self.load(obj);
            self.load(key);
            self.emit_keyed_load();
        }
    }

    // References.

    /// Evaluate the parts of an assignable expression that must only be
    /// evaluated once.
    pub(crate) fn load_reference(&mut self, target: &Expr, persist: bool) -> Reference {
        match target {
            Expr::Var(v) => match &v.location {
                VarLocation::Slot(slot) => Reference::new(
                    RefKind::Slot {
                        slot: slot.clone(),
                        mode: v.mode,
                        name: v.name.clone(),
                        is_arguments: v.is_arguments,
                    },
                    persist,
                ),
                VarLocation::Global => {
                    // Global variables are named properties of the
                    // global object.
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
                    Reference::new(
                        RefKind::Named {
                            name: v.name.clone(),
                        },
                        persist,
                    )
                }
            },
            Expr::Property { obj, key, pos } => {
                self.masm.position(*pos);
                if let Expr::Literal(Literal::Str(name)) = &**key {
                    let name = name.clone();
                    self.load(obj);
                    Reference::new(RefKind::Named { name }, persist)
                } else {
                    self.load(obj);
                    self.load(key);
                    Reference::new(RefKind::Keyed, persist)
                }
            }
            _ => unreachable!("expression is not an assignment target"),
        }
    }

    /// Push the reference's current value. A persistent reference keeps
    /// its parts on the frame for a following `set_reference_value`.
    pub(crate) fn get_reference_value(&mut self, r: &mut Reference) {
        let persist = r.persist_after_get();
        match r.kind().clone() {
            RefKind::Slot {
                slot,
                mode,
                name,
                is_arguments,
            } => {
                if is_arguments {
                    self.load_arguments_slot(&slot, &name);
                } else {
                    self.load_from_slot(&slot, mode, &name, TypeofState::NotInside);
                }
                if !persist {
                    r.set_unloaded();
                }
            }
            RefKind::Named { name } => {
                if persist {
                    self.frame_mut().dup();
                }
                self.emit_named_load(&name, false);
                if !persist {
                    r.set_unloaded();
                }
            }
            RefKind::Keyed => {
                if persist {
                    self.frame_mut().dup2();
                }
                self.emit_keyed_load();
                if !persist {
                    r.set_unloaded();
                }
            }
        }
    }

    /// Store the value on top of the frame through the reference,
    /// consuming its parts and leaving the value.
    pub(crate) fn set_reference_value(&mut self, r: &mut Reference, init_state: InitState) {
        match r.kind().clone() {
            RefKind::Slot {
                slot, mode, name, ..
            } => self.store_to_slot(&slot, mode, &name, init_state),
            RefKind::Named { name } => self.emit_named_store(&name),
            RefKind::Keyed => self.emit_keyed_store(),
        }
        r.set_unloaded();
    }

    // Assignment and counting.

    fn visit_assignment(
        &mut self,
        target: &Expr,
        op: Option<BinOp>,
        value: &Expr,
        pos: SourcePos,
    ) {
        self.masm.position(pos);
        let mut r = self.load_reference(target, op.is_some());
        match op {
            Some(op) => {
                self.get_reference_value(&mut r);
                self.load(value);
                self.binary_operation_on_frame(op, overwrite_mode(target, value));
            }
            None => self.load(value),
        }
        self.set_reference_value(&mut r, InitState::NotConstInit);
    }

    fn visit_count(&mut self, is_increment: bool, is_prefix: bool, target: &Expr) {
        // Postfix needs the old value as the result: a placeholder under
        // the reference parts receives it before the increment.
        if !is_prefix {
            self.frame_mut().push_constant(Constant::Smi(Smi::ZERO));
        }
        let mut r = self.load_reference(target, true);
        self.get_reference_value(&mut r);

        if !is_prefix {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.call_builtin(masm, Builtin::ToNumber, 1);
            f.emit_push(masm, Reg::V0);
            let placeholder = f.height() - 2 - r.size();
            let reg = f.peek_to_register(masm, None);
            f.store_to_element(masm, placeholder, reg);
        }

        let op = if is_increment { BinOp::Add } else { BinOp::Sub };
        self.smi_operation(
            op,
            Smi::new(1).expect("one is a smi"),
            false,
            OverwriteMode::NoOverwrite,
        );
        self.set_reference_value(&mut r, InitState::NotConstInit);
        if !is_prefix {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        }
    }

    // Binary operations.

    fn visit_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) {
        match op {
            BinOp::And | BinOp::Or => self.visit_logical_value(op, left, right),
            _ => {
                let mode = overwrite_mode(left, right);
                if let Some(constant) = right.as_smi_literal() {
                    self.load(left);
                    self.smi_operation(op, constant, false, mode);
                } else if let Some(constant) = left.as_smi_literal() {
                    self.load(right);
                    self.smi_operation(op, constant, true, mode);
                } else {
                    self.load(left);
                    self.load(right);
                    self.binary_operation_on_frame(op, mode);
                }
            }
        }
    }

    /// Both operands already on the frame.
    pub(crate) fn binary_operation_on_frame(&mut self, op: BinOp, mode: OverwriteMode) {
        // A constant the loads left unmaterialized still gets the
        // inlined treatment.
        let rhs_constant = match self.frame_mut().constant_at(0) {
            Some(Constant::Smi(s)) => Some(*s),
            _ => None,
        };
        if let Some(constant) = rhs_constant {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
            self.smi_operation(op, constant, false, mode);
            return;
        }
        let inlinable = matches!(
            op,
            BinOp::Add | BinOp::Sub | BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor
        );
        let f = self.frame_mut();
        let likely_smi = f.type_info_at(0).is_number() && f.type_info_at(1).is_number();
        if inlinable && self.in_loop() && likely_smi {
            self.likely_smi_binary_operation(op, mode);
        } else {
            self.generic_binary_operation(op, mode);
        }
    }

    /// Value-context `&&` / `||`: the left value is the result when it
    /// decides the answer.
    fn visit_logical_value(&mut self, op: BinOp, left: &Expr, right: &Expr) {
        self.load(left);
        let mut exit = BreakTarget::new();
        let mut take_right = BreakTarget::new();
        self.frame_mut().dup();
        match op {
            BinOp::And => {
                self.to_boolean(&mut take_right, &mut exit);
                if self.cc.is_some() {
                    self.branch_false(&mut exit);
                }
            }
            BinOp::Or => {
                self.to_boolean(&mut exit, &mut take_right);
                if self.cc.is_some() {
                    self.branch_true(&mut exit);
                }
            }
            _ => unreachable!(),
        }
        if take_right.is_linked() {
            let (masm, frame) = self.parts();
            take_right.bind(masm, frame);
        }
        {
            let (masm, frame) = self.parts();
            frame.as_mut().unwrap().drop_(masm, 1);
        }
        self.load(right);
        let (masm, frame) = self.parts();
        exit.bind(masm, frame);
    }

    fn visit_conditional(&mut self, cond: &Expr, then_expr: &Expr, else_expr: &Expr) {
        let mut then_target = BreakTarget::new();
        let mut else_target = BreakTarget::new();
        self.load_condition(cond, &mut then_target, &mut else_target);
        if self.cc.is_some() {
            self.branch_false(&mut else_target);
        }
        if then_target.is_linked() {
            let (masm, frame) = self.parts();
            then_target.bind(masm, frame);
        }
        self.load(then_expr);
        let mut exit = BreakTarget::new();
        {
            let (masm, frame) = self.parts();
            exit.jump(masm, frame);
        }
        {
            let (masm, frame) = self.parts();
            else_target.bind(masm, frame);
        }
        self.load(else_expr);
        let (masm, frame) = self.parts();
        exit.bind(masm, frame);
    }

    // Comparisons (condition context; see `load_condition`).

    pub(crate) fn visit_comparison(
        &mut self,
        op: CompareOp,
        left: &Expr,
        right: &Expr,
        true_target: &mut BreakTarget,
        false_target: &mut BreakTarget,
    ) {
        match op {
            CompareOp::In => {
                self.load(left);
                self.load(right);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_builtin(masm, Builtin::In, 2);
                f.emit_push(masm, Reg::V0);
                self.to_boolean(true_target, false_target);
                return;
            }
            CompareOp::InstanceOf => {
                self.load(left);
                self.load(right);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_stub(masm, Stub::InstanceOf, 2);
                // The stub answers zero for instances.
                self.set_cc(Condition::Eq, Reg::V0, Operand::zero());
                return;
            }
            _ => {}
        }

        // `typeof x == "type"` never materializes the type string.
        if let Some((operand, name, negate)) = typeof_comparison(op, left, right) {
            self.emit_typeof_comparison(operand, name, true_target, false_target, negate);
            return;
        }
        // Equality against null/undefined tests identity plus the
        // undetectable escape hatch, without the stub.
        if matches!(op, CompareOp::Eq | CompareOp::EqStrict) {
            if let Expr::Literal(lit) = right {
                if lit.is_null() || lit.is_undefined() {
                    self.emit_nil_comparison(left, lit, op == CompareOp::EqStrict, true_target);
                    return;
                }
            }
        }

        let (cond, strict) = match op {
            CompareOp::Eq => (Condition::Eq, false),
            CompareOp::EqStrict => (Condition::Eq, true),
            CompareOp::Ne => (Condition::Ne, false),
            CompareOp::NeStrict => (Condition::Ne, true),
            CompareOp::Lt => (Condition::Lt, false),
            CompareOp::Gt => (Condition::Gt, false),
            CompareOp::Le => (Condition::Le, false),
            CompareOp::Ge => (Condition::Ge, false),
            CompareOp::In | CompareOp::InstanceOf => unreachable!(),
        };

        self.load(left);
        self.load(right);
        self.comparison_on_frame(cond, strict);
    }

    /// Compare the two values on top of the frame, consuming both and
    /// leaving a pending condition. Smi pairs compare directly; anything
    /// else goes through the compare stub.
    pub(crate) fn comparison_on_frame(&mut self, cond: Condition, strict: bool) {
        let lhs_smi = self.frame_mut().known_smi_at(1);
        let rhs_smi = self.frame_mut().known_smi_at(0);
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // The stub call below runs with no frame registers live.
        f.spill_all(masm);
        let rhs = f.pop_to_register(masm, None);
        let lhs = f.pop_to_register(masm, Some(rhs));

        // Tagged smi words order like the integers they carry, so the
        // smi case is one machine compare.
        let slow = masm.new_label();
        let done = masm.new_label();
        match (lhs_smi, rhs_smi) {
            (true, true) => {}
            (true, false) => masm.branch_if_not_smi(rhs, Reg::SCRATCH0, slow),
            (false, true) => masm.branch_if_not_smi(lhs, Reg::SCRATCH0, slow),
            (false, false) => {
                masm.or_(Reg::SCRATCH0, lhs, Operand::Reg(rhs));
                masm.and_(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Imm(smi::TAG_MASK));
                masm.branch(Condition::Ne, Reg::SCRATCH0, Operand::zero(), slow);
            }
        }
        masm.mov(Reg::CMP_LHS, lhs);
        masm.mov(Reg::CMP_RHS, rhs);
        if !(lhs_smi && rhs_smi) {
            masm.jump(done);
            // Slow case: the stub leaves a value whose comparison with
            // zero answers the original question.
            masm.bind(slow);
            masm.push(lhs);
            masm.push(rhs);
            masm.call_stub(Stub::Compare { cond, strict });
            masm.mov(Reg::CMP_LHS, Reg::V0);
            masm.li(Reg::CMP_RHS, Operand::Imm(0));
            masm.bind(done);
        }
        self.set_cc(cond, Reg::CMP_LHS, Operand::Reg(Reg::CMP_RHS));
    }

    fn emit_typeof_comparison(
        &mut self,
        operand: &Expr,
        name: &str,
        true_target: &mut BreakTarget,
        false_target: &mut BreakTarget,
        negate: bool,
    ) {
        let (tt, ft): (&mut BreakTarget, &mut BreakTarget) = if negate {
            (false_target, true_target)
        } else {
            (true_target, false_target)
        };
        self.load_with_typeof(operand, TypeofState::Inside);
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let reg = f.pop_to_register(masm, None);

        match name {
            "number" => {
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                tt.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());
                masm.lw(Reg::SCRATCH0, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.load_root(Reg::SCRATCH1, RootIndex::HeapNumberMap);
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Eq,
                    lhs: Reg::SCRATCH0,
                    rhs: Operand::Reg(Reg::SCRATCH1),
                });
            }
            "string" => {
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                ft.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());
                masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.lbu(Reg::SCRATCH0, field(Reg::SCRATCH1, layout::MAP_BIT_FIELD_OFFSET));
                masm.and_(
                    Reg::SCRATCH0,
                    Reg::SCRATCH0,
                    Operand::Imm(layout::MAP_UNDETECTABLE_MASK),
                );
                ft.branch(masm, f, Condition::Ne, Reg::SCRATCH0, Operand::zero());
                masm.lbu(
                    Reg::SCRATCH0,
                    field(Reg::SCRATCH1, layout::MAP_INSTANCE_TYPE_OFFSET),
                );
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Lo,
                    lhs: Reg::SCRATCH0,
                    rhs: Operand::Imm(layout::FIRST_NONSTRING_TYPE),
                });
            }
            "boolean" => {
                masm.load_root(Reg::SCRATCH0, RootIndex::True);
                tt.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
                masm.load_root(Reg::SCRATCH0, RootIndex::False);
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Eq,
                    lhs: reg,
                    rhs: Operand::Reg(Reg::SCRATCH0),
                });
            }
            "undefined" => {
                masm.load_root(Reg::SCRATCH0, RootIndex::Undefined);
                tt.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                ft.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());
                // Undetectable objects answer "undefined".
                masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.lbu(Reg::SCRATCH0, field(Reg::SCRATCH1, layout::MAP_BIT_FIELD_OFFSET));
                masm.and_(
                    Reg::SCRATCH0,
                    Reg::SCRATCH0,
                    Operand::Imm(layout::MAP_UNDETECTABLE_MASK),
                );
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Ne,
                    lhs: Reg::SCRATCH0,
                    rhs: Operand::zero(),
                });
            }
            "function" => {
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                ft.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());
                masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.lbu(
                    Reg::SCRATCH0,
                    field(Reg::SCRATCH1, layout::MAP_INSTANCE_TYPE_OFFSET),
                );
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Eq,
                    lhs: Reg::SCRATCH0,
                    rhs: Operand::Imm(layout::JS_FUNCTION_TYPE),
                });
            }
            "object" => {
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                ft.branch(masm, f, Condition::Eq, Reg::SCRATCH0, Operand::zero());
                masm.load_root(Reg::SCRATCH0, RootIndex::Null);
                tt.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
                masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.lbu(Reg::SCRATCH0, field(Reg::SCRATCH1, layout::MAP_BIT_FIELD_OFFSET));
                masm.and_(
                    Reg::SCRATCH0,
                    Reg::SCRATCH0,
                    Operand::Imm(layout::MAP_UNDETECTABLE_MASK),
                );
                ft.branch(masm, f, Condition::Ne, Reg::SCRATCH0, Operand::zero());
                masm.lbu(
                    Reg::SCRATCH0,
                    field(Reg::SCRATCH1, layout::MAP_INSTANCE_TYPE_OFFSET),
                );
                ft.branch(
                    masm,
                    f,
                    Condition::Lt,
                    Reg::SCRATCH0,
                    Operand::Imm(layout::FIRST_JS_OBJECT_TYPE),
                );
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Le,
                    lhs: Reg::SCRATCH0,
                    rhs: Operand::Imm(layout::LAST_JS_OBJECT_TYPE),
                });
            }
            _ => {
                // No value has this typeof string.
                self.cc = Some(crate::codegen::CondState {
                    cond: Condition::Ne,
                    lhs: Reg::Zero,
                    rhs: Operand::zero(),
                });
            }
        }

        // The branches above already aim at the swapped targets; the
        // residual condition still answers "the strings are equal" and
        // must be inverted too.
        if negate {
            if let Some(cc) = &mut self.cc {
                cc.cond = cc.cond.negate();
            }
        }
    }

    /// `x == null` / `x == undefined` and their strict forms.
    fn emit_nil_comparison(
        &mut self,
        left: &Expr,
        nil: &Literal,
        strict: bool,
        true_target: &mut BreakTarget,
    ) {
        self.load(left);
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let reg = f.pop_to_register(masm, None);
        let root = if nil.is_null() {
            RootIndex::Null
        } else {
            RootIndex::Undefined
        };
        masm.load_root(Reg::SCRATCH0, root);
        if strict {
            self.cc = Some(crate::codegen::CondState {
                cond: Condition::Eq,
                lhs: reg,
                rhs: Operand::Reg(Reg::SCRATCH0),
            });
            return;
        }
        // Loose equality: null, undefined and undetectable objects are
        // all equal to nil.
        true_target.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
        let other = if nil.is_null() {
            RootIndex::Undefined
        } else {
            RootIndex::Null
        };
        masm.load_root(Reg::SCRATCH0, other);
        true_target.branch(masm, f, Condition::Eq, reg, Operand::Reg(Reg::SCRATCH0));
        masm.and_(Reg::SCRATCH1, reg, Operand::Imm(smi::TAG_MASK));
        // A smi is equal to neither; answer through the final condition.
        let not_smi = masm.new_label();
        masm.branch(Condition::Ne, Reg::SCRATCH1, Operand::zero(), not_smi);
        masm.li(Reg::SCRATCH0, Operand::Imm(0));
        let done = masm.new_label();
        masm.jump(done);
        masm.bind(not_smi);
        masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.lbu(Reg::SCRATCH0, field(Reg::SCRATCH1, layout::MAP_BIT_FIELD_OFFSET));
        masm.and_(
            Reg::SCRATCH0,
            Reg::SCRATCH0,
            Operand::Imm(layout::MAP_UNDETECTABLE_MASK),
        );
        masm.bind(done);
        self.cc = Some(crate::codegen::CondState {
            cond: Condition::Ne,
            lhs: Reg::SCRATCH0,
            rhs: Operand::zero(),
        });
    }

    // Calls.

    fn visit_call(&mut self, func: &Expr, args: &[Expr], pos: SourcePos) {
        self.masm.position(pos);
        let argc = args.len();
        match func {
            // f(...) where f is a global: a call IC resolves and invokes.
            Expr::Var(v) if matches!(v.location, VarLocation::Global) => {
                let name = v.name.clone();
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
                    masm.lw(
                        Reg::SCRATCH0,
                        field(Reg::SCRATCH0, layout::GLOBAL_OBJECT_RECEIVER_OFFSET),
                    );
                    f.emit_push(masm, Reg::SCRATCH0);
                }
                for arg in args {
                    self.load(arg);
                }
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_call_ic(masm, name, argc);
                f.emit_push(masm, Reg::V0);
            }
            // f(...) where f resolves dynamically; eval gets the direct-
            // eval resolution so it can see the caller's scope.
            Expr::Var(v) if matches!(v.location, VarLocation::Slot(Slot::Lookup { .. })) => {
                if v.name == "eval" {
                    self.visit_call_eval(args, argc);
                    return;
                }
                let name = v.name.clone();
                {
                    let (masm, frame) = self.parts();
                    let f = frame.as_mut().unwrap();
                    f.spill_all(masm);
                    // Receiver first, then the looked-up function.
                    masm.lw(
                        Reg::SCRATCH0,
                        field(
                            Reg::Cp,
                            layout::context_slot_offset(layout::CONTEXT_GLOBAL_INDEX),
                        ),
                    );
                    masm.lw(
                        Reg::SCRATCH0,
                        field(Reg::SCRATCH0, layout::GLOBAL_OBJECT_RECEIVER_OFFSET),
                    );
                    f.emit_push(masm, Reg::SCRATCH0);
                    masm.li(Reg::SCRATCH0, Operand::Const(Constant::Str(name)));
                    f.emit_push(masm, Reg::SCRATCH0);
                    f.call_runtime(masm, RuntimeFn::LoadContextSlot, 1);
                    f.emit_push(masm, Reg::V0);
                }
                for arg in args {
                    self.load(arg);
                }
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_stub(masm, Stub::CallFunction { argc: argc as u32 }, argc + 2);
                f.emit_push(masm, Reg::V0);
            }
            // o.f(...): the call IC takes the receiver from the stack.
            Expr::Property { obj, key, .. } => {
                if let Expr::Literal(Literal::Str(name)) = &**key {
                    let name = name.clone();
                    self.load(obj);
                    for arg in args {
                        self.load(arg);
                    }
                    let (masm, frame) = self.parts();
                    let f = frame.as_mut().unwrap();
                    f.call_call_ic(masm, name, argc);
                    f.emit_push(masm, Reg::V0);
                } else {
                    // o[k](...): the receiver doubles as the load
                    // receiver and the call receiver.
                    self.load(obj);
                    self.frame_mut().dup();
                    self.load(key);
                    self.emit_keyed_load();
                    for arg in args {
                        self.load(arg);
                    }
                    let (masm, frame) = self.parts();
                    let f = frame.as_mut().unwrap();
                    f.call_stub(masm, Stub::CallFunction { argc: argc as u32 }, argc + 2);
                    f.emit_push(masm, Reg::V0);
                }
            }
            // (expr)(...): undefined receiver, function from the
            // expression.
            _ => {
                self.frame_mut().push_constant(Constant::Undefined);
                self.load(func);
                for arg in args {
                    self.load(arg);
                }
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_stub(masm, Stub::CallFunction { argc: argc as u32 }, argc + 2);
                f.emit_push(masm, Reg::V0);
            }
        }
    }

    /// A call to `eval`: resolve against the caller's scope so a direct
    /// eval sees local bindings.
    fn visit_call_eval(&mut self, args: &[Expr], argc: usize) {
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
            masm.lw(
                Reg::SCRATCH0,
                field(Reg::SCRATCH0, layout::GLOBAL_OBJECT_RECEIVER_OFFSET),
            );
            f.emit_push(masm, Reg::SCRATCH0);
            masm.li(
                Reg::SCRATCH0,
                Operand::Const(Constant::Str("eval".to_string())),
            );
            f.emit_push(masm, Reg::SCRATCH0);
            f.call_runtime(masm, RuntimeFn::LoadContextSlot, 1);
            f.emit_push(masm, Reg::V0);
        }
        for arg in args {
            self.load(arg);
        }
        // Re-resolve with the function and the source argument; the
        // runtime answers the function a direct eval must invoke.
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let function_index = f.height() - 1 - argc;
        f.push_element_copy(function_index);
        if argc > 0 {
            f.push_element_copy(f.height() - 1 - argc);
        } else {
            f.push_constant(Constant::Undefined);
        }
        f.call_runtime(masm, RuntimeFn::ResolvePossiblyDirectEval, 2);
        f.store_to_element(masm, function_index, Reg::V0);
        f.call_stub(masm, Stub::CallFunction { argc: argc as u32 }, argc + 2);
        f.emit_push(masm, Reg::V0);
    }

    fn visit_call_new(&mut self, func: &Expr, args: &[Expr], pos: SourcePos) {
        self.masm.position(pos);
        self.load(func);
        for arg in args {
            self.load(arg);
        }
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.call_builtin(masm, Builtin::JsConstructCall, args.len() + 1);
        f.emit_push(masm, Reg::V0);
    }

    fn visit_call_intrinsic(&mut self, intrinsic: Intrinsic, args: &[Expr]) {
        match intrinsic {
            Intrinsic::IsSmi => {
                self.load(&args[0]);
                self.emit_mask_test(smi::TAG_MASK);
            }
            Intrinsic::IsNonNegativeSmi => {
                self.load(&args[0]);
                self.emit_mask_test(smi::TAG_MASK | i32::MIN);
            }
            Intrinsic::IsArray => {
                self.load(&args[0]);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let reg = f.pop_to_register(masm, None);
                let dest = f.allocate_register(masm, &[reg]);
                let done = masm.new_label();
                masm.load_root(dest, RootIndex::False);
                masm.and_(Reg::SCRATCH0, reg, Operand::Imm(smi::TAG_MASK));
                masm.branch(Condition::Eq, Reg::SCRATCH0, Operand::zero(), done);
                masm.lw(Reg::SCRATCH1, field(reg, layout::HEAP_OBJECT_MAP_OFFSET));
                masm.lbu(
                    Reg::SCRATCH0,
                    field(Reg::SCRATCH1, layout::MAP_INSTANCE_TYPE_OFFSET),
                );
                masm.branch(
                    Condition::Ne,
                    Reg::SCRATCH0,
                    Operand::Imm(layout::JS_ARRAY_TYPE),
                    done,
                );
                masm.load_root(dest, RootIndex::True);
                masm.bind(done);
                f.push_register(dest, TypeInfo::Unknown);
            }
            Intrinsic::ArgumentsLength => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_stub(masm, Stub::ArgumentsAccess(ArgumentsAccessKind::ReadLength), 0);
                f.emit_push(masm, Reg::V0);
            }
            // Always the runtime: the fast path was never worth its
            // special cases for fractional and negative exponents.
            Intrinsic::MathPow => {
                self.load(&args[0]);
                self.load(&args[1]);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_runtime(masm, RuntimeFn::MathPow, 2);
                f.emit_push(masm, Reg::V0);
            }
            Intrinsic::MathSqrt => {
                self.load(&args[0]);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_runtime(masm, RuntimeFn::MathSqrt, 1);
                f.emit_push(masm, Reg::V0);
            }
            Intrinsic::ObjectEquals => {
                self.load(&args[0]);
                self.load(&args[1]);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let rhs = f.pop_to_register(masm, None);
                let lhs = f.pop_to_register(masm, Some(rhs));
                let dest = f.allocate_register(masm, &[lhs, rhs]);
                let done = masm.new_label();
                masm.load_root(dest, RootIndex::True);
                masm.branch(Condition::Eq, lhs, Operand::Reg(rhs), done);
                masm.load_root(dest, RootIndex::False);
                masm.bind(done);
                f.push_register(dest, TypeInfo::Unknown);
            }
            Intrinsic::Runtime(rt) => {
                for arg in args {
                    self.load(arg);
                }
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_runtime(masm, rt, args.len());
                f.emit_push(masm, Reg::V0);
            }
        }
    }

    /// Pop a value and push true if `value & mask == 0`.
    fn emit_mask_test(&mut self, mask: i32) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let reg = f.pop_to_register(masm, None);
        let dest = f.allocate_register(masm, &[reg]);
        let done = masm.new_label();
        masm.load_root(dest, RootIndex::True);
        masm.and_(Reg::SCRATCH0, reg, Operand::Imm(mask));
        masm.branch(Condition::Eq, Reg::SCRATCH0, Operand::zero(), done);
        masm.load_root(dest, RootIndex::False);
        masm.bind(done);
        f.push_register(dest, TypeInfo::Unknown);
    }

    // Unary operations.

    fn visit_unary(&mut self, op: UnaryOp, expr: &Expr) {
        match op {
            UnaryOp::Not => unreachable!("handled by the condition protocol"),
            UnaryOp::Void => {
                self.load(expr);
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
                self.frame_mut().push_constant(Constant::Undefined);
            }
            UnaryOp::TypeOf => {
                self.load_with_typeof(expr, TypeofState::Inside);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_runtime(masm, RuntimeFn::TypeOf, 1);
                f.emit_push(masm, Reg::V0);
            }
            UnaryOp::Plus => {
                self.load(expr);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_builtin(masm, Builtin::ToNumber, 1);
                f.emit_push(masm, Reg::V0);
            }
            UnaryOp::Neg | UnaryOp::BitNot => {
                // Negation must produce -0 for a zero input and bit-not
                // must handle heap numbers, so both stay in the stub.
                let stub_op = if op == UnaryOp::Neg {
                    StubUnaryOp::Negate
                } else {
                    StubUnaryOp::BitNot
                };
                let mode = if expr.is_trivial() || matches!(expr, Expr::Var(_)) {
                    OverwriteMode::NoOverwrite
                } else {
                    OverwriteMode::OverwriteLeft
                };
                self.load(expr);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.spill_all(masm);
                f.emit_pop(masm, Reg::A0);
                masm.call_stub(Stub::GenericUnaryOp { op: stub_op, mode });
                f.emit_push(masm, Reg::V0);
            }
            UnaryOp::Delete => self.visit_delete(expr),
        }
    }

    fn visit_delete(&mut self, expr: &Expr) {
        match expr {
            Expr::Property { obj, key, .. } => {
                self.load(obj);
                self.load(key);
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.call_builtin(masm, Builtin::Delete, 2);
                f.emit_push(masm, Reg::V0);
            }
            Expr::Var(v) => match &v.location {
                VarLocation::Global => {
                    let name = v.name.clone();
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
                    masm.li(Reg::SCRATCH0, Operand::Const(Constant::Str(name)));
                    f.emit_push(masm, Reg::SCRATCH0);
                    f.call_builtin(masm, Builtin::Delete, 2);
                    f.emit_push(masm, Reg::V0);
                }
                // Resolved bindings are not deletable.
                VarLocation::Slot(_) => {
                    self.frame_mut().push_constant(Constant::Bool(false));
                }
            },
            _ => {
                // The operand is evaluated for effect; the answer is true.
                self.load(expr);
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
                self.frame_mut().push_constant(Constant::Bool(true));
            }
        }
    }

    // Literals with heap structure.

    fn visit_function_literal(&mut self, info_id: u32) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        masm.li(
            Reg::SCRATCH0,
            Operand::Const(Constant::FunctionInfo(info_id)),
        );
        f.emit_push(masm, Reg::SCRATCH0);
        f.call_stub(masm, Stub::FastNewClosure, 1);
        f.emit_push(masm, Reg::V0);
    }

    fn create_literal(&mut self, boilerplate_id: u32, literal_index: usize, rt: RuntimeFn) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        masm.lw(Reg::SCRATCH0, f.function_operand());
        masm.lw(
            Reg::SCRATCH0,
            field(Reg::SCRATCH0, layout::JS_FUNCTION_LITERALS_OFFSET),
        );
        f.emit_push(masm, Reg::SCRATCH0);
        f.push_constant(Constant::Smi(
            Smi::new(literal_index as i32).expect("literal index fits a smi"),
        ));
        f.spill_all(masm);
        masm.li(
            Reg::SCRATCH0,
            Operand::Const(Constant::LiteralBoilerplate(boilerplate_id)),
        );
        f.emit_push(masm, Reg::SCRATCH0);
        f.call_runtime(masm, rt, 3);
        f.emit_push(masm, Reg::V0);
    }

    fn visit_object_literal(
        &mut self,
        boilerplate_id: u32,
        literal_index: usize,
        properties: &[ObjProperty],
        is_shallow: bool,
    ) {
        let rt = if is_shallow {
            RuntimeFn::CreateObjectLiteralShallow
        } else {
            RuntimeFn::CreateObjectLiteral
        };
        self.create_literal(boilerplate_id, literal_index, rt);

        for prop in properties {
            if prop.kind == PropertyKind::Constant {
                continue;
            }
            match &prop.key {
                Literal::Str(name) => {
                    let name = name.clone();
                    self.frame_mut().dup();
                    self.load(&prop.value);
                    self.emit_named_store(&name);
                    let (masm, frame) = self.parts();
                    frame.as_mut().unwrap().drop_(masm, 1);
                }
                key => {
                    self.frame_mut().dup();
                    self.visit_literal(key);
                    self.load(&prop.value);
                    let (masm, frame) = self.parts();
                    let f = frame.as_mut().unwrap();
                    f.call_runtime(masm, RuntimeFn::SetProperty, 3);
                }
            }
        }
    }

    fn visit_array_literal(
        &mut self,
        boilerplate_id: u32,
        literal_index: usize,
        values: &[Expr],
        is_shallow: bool,
    ) {
        let rt = if is_shallow {
            RuntimeFn::CreateArrayLiteralShallow
        } else {
            RuntimeFn::CreateArrayLiteral
        };
        self.create_literal(boilerplate_id, literal_index, rt);

        for (i, value) in values.iter().enumerate() {
            // Constant elements already live in the boilerplate.
            if matches!(value, Expr::Literal(_)) {
                continue;
            }
            self.load(value);
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            let val = f.pop_to_register(masm, None);
            let arr = f.peek_to_register(masm, Some(val));
            masm.lw(Reg::SCRATCH0, field(arr, layout::JS_OBJECT_ELEMENTS_OFFSET));
            let offset = layout::FIXED_ARRAY_HEADER_SIZE + layout::POINTER_SIZE * i as i32;
            masm.sw(val, field(Reg::SCRATCH0, offset));
            masm.record_write(Reg::SCRATCH0, offset, val, Reg::SCRATCH1);
        }
    }
}

/// Recognize `typeof x == "string-literal"` in either operand order,
/// for any of the four equality operators.
fn typeof_comparison<'e>(
    op: CompareOp,
    left: &'e Expr,
    right: &'e Expr,
) -> Option<(&'e Expr, &'e str, bool)> {
    let negate = match op {
        CompareOp::Eq | CompareOp::EqStrict => false,
        CompareOp::Ne | CompareOp::NeStrict => true,
        _ => return None,
    };
    let (operand, name) = match (left, right) {
        (
            Expr::Unary {
                op: UnaryOp::TypeOf,
                expr,
            },
            Expr::Literal(Literal::Str(name)),
        ) => (&**expr, name.as_str()),
        (
            Expr::Literal(Literal::Str(name)),
            Expr::Unary {
                op: UnaryOp::TypeOf,
                expr,
            },
        ) => (&**expr, name.as_str()),
        _ => return None,
    };
    Some((operand, name, negate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionInfo, ScopeInfo};
    use crate::frame::VirtualFrame;
    use quill_masm::{IcKind, Instr, MacroAssembler};

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

    #[test]
    fn test_literal_load_emits_nothing() {
        let masm = with_cgen(0, |cgen| {
            cgen.load(&Expr::num(3.0));
            assert_eq!(cgen.frame_mut().height(), 1);
            assert!(cgen.frame_mut().known_smi_at(0));
        });
        assert_eq!(masm.len(), 0);
    }

    #[test]
    fn test_delete_of_resolved_binding_is_constant_false() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Unary {
                op: UnaryOp::Delete,
                expr: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        assert_eq!(masm.len(), 0);
    }

    #[test]
    fn test_nil_comparison_avoids_compare_stub() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Compare {
                op: CompareOp::Eq,
                left: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
                right: Box::new(Expr::Literal(Literal::Null)),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        assert!(!masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallStub(Stub::Compare { .. }))));
    }

    #[test]
    fn test_typeof_comparison_never_calls_typeof_runtime() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Compare {
                op: CompareOp::EqStrict,
                left: Box::new(Expr::Unary {
                    op: UnaryOp::TypeOf,
                    expr: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
                }),
                right: Box::new(Expr::str("number")),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        let stream = masm.instructions();
        assert!(!stream
            .iter()
            .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::TypeOf, _))));
        assert!(!stream
            .iter()
            .any(|i| matches!(i, Instr::CallStub(Stub::Compare { .. }))));
    }

    #[test]
    fn test_negated_typeof_comparison_inverts_the_residual_condition() {
        fn typeof_compare(op: CompareOp, name: &str) -> Expr {
            Expr::Compare {
                op,
                left: Box::new(Expr::Unary {
                    op: UnaryOp::TypeOf,
                    expr: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
                }),
                right: Box::new(Expr::str(name)),
            }
        }

        // `typeof x !== "number"`: the fall-through condition must hold
        // exactly when the map is NOT the heap-number map.
        with_cgen(1, |cgen| {
            let mut t = BreakTarget::new();
            let mut f = BreakTarget::new();
            cgen.load_condition(&typeof_compare(CompareOp::NeStrict, "number"), &mut t, &mut f);
            let cc = cgen.take_cc().expect("pending condition");
            assert_eq!(cc.cond, Condition::Ne);
        });

        // No value answers "blorp" to typeof, so the inequality is a
        // constant truth.
        with_cgen(1, |cgen| {
            let mut t = BreakTarget::new();
            let mut f = BreakTarget::new();
            cgen.load_condition(&typeof_compare(CompareOp::Ne, "blorp"), &mut t, &mut f);
            let cc = cgen.take_cc().expect("pending condition");
            assert_eq!((cc.cond, cc.lhs), (Condition::Eq, Reg::Zero));
        });
    }

    #[test]
    fn test_generic_comparison_has_smi_fast_path_and_stub() {
        let masm = with_cgen(2, |cgen| {
            cgen.load(&Expr::Compare {
                op: CompareOp::Lt,
                left: Box::new(Expr::var(crate::ast::VarRef::parameter("a", 0))),
                right: Box::new(Expr::var(crate::ast::VarRef::parameter("b", 1))),
            });
            assert_eq!(cgen.frame_mut().height(), 3);
        });
        let stream = masm.instructions();
        // Combined tag test on the fast path, stub on the slow path.
        assert!(stream.iter().any(|i| matches!(i, Instr::Or(..))));
        assert!(stream.iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::Compare {
                cond: Condition::Lt,
                strict: false
            })
        )));
    }

    #[test]
    fn test_global_call_goes_through_call_ic() {
        let masm = with_cgen(0, |cgen| {
            cgen.load(&Expr::Call {
                func: Box::new(Expr::var(crate::ast::VarRef::global("f"))),
                args: vec![Expr::num(1.0)],
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallIc(IcKind::Call { argc: 1, .. })
        )));
    }

    #[test]
    fn test_function_call_through_expression_uses_call_function_stub() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Call {
                func: Box::new(Expr::var(crate::ast::VarRef::parameter("f", 0))),
                args: vec![Expr::num(1.0), Expr::num(2.0)],
                pos: SourcePos::NONE,
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::CallFunction { argc: 2 })
        )));
    }

    #[test]
    fn test_compound_assignment_to_parameter() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Assignment {
                target: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
                op: Some(BinOp::Add),
                value: Box::new(Expr::num(1.0)),
                pos: SourcePos::NONE,
            });
            // The assigned value stays as the expression result.
            assert_eq!(cgen.frame_mut().height(), 2);
            cgen.flush_deferred_code();
        });
        // The add is inlined against the constant; the store hits the
        // parameter's slot.
        assert!(masm.instructions().iter().any(|i| matches!(i, Instr::Sw(..))));
    }

    #[test]
    fn test_postfix_count_yields_old_value() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Count {
                is_increment: true,
                is_prefix: false,
                target: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
            cgen.flush_deferred_code();
        });
        // The old value goes through ToNumber before being saved.
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallBuiltin(Builtin::ToNumber, 1))));
    }

    #[test]
    fn test_logical_and_keeps_deciding_value() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Binary {
                op: BinOp::And,
                left: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
                right: Box::new(Expr::num(2.0)),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        // The left value is duplicated for the test, so its boolean
        // conversion cannot consume the result.
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallStub(Stub::ToBoolean))));
    }

    #[test]
    fn test_unary_minus_uses_generic_stub() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(Expr::var(crate::ast::VarRef::parameter("x", 0))),
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        assert!(masm.instructions().iter().any(|i| matches!(
            i,
            Instr::CallStub(Stub::GenericUnaryOp {
                op: StubUnaryOp::Negate,
                ..
            })
        )));
    }

    #[test]
    fn test_object_literal_stores_computed_properties() {
        let masm = with_cgen(0, |cgen| {
            cgen.load(&Expr::ObjectLiteral {
                boilerplate_id: 7,
                literal_index: 0,
                properties: vec![ObjProperty {
                    key: Literal::Str("a".to_string()),
                    value: Expr::num(1.0),
                    kind: PropertyKind::Computed,
                }],
                is_shallow: true,
            });
            assert_eq!(cgen.frame_mut().height(), 1);
        });
        let stream = masm.instructions();
        assert!(stream.iter().any(|i| matches!(
            i,
            Instr::CallRuntime(RuntimeFn::CreateObjectLiteralShallow, 3)
        )));
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::CallIc(IcKind::Store { .. }))));
    }

    #[test]
    fn test_is_smi_intrinsic_inlines_the_tag_test() {
        let masm = with_cgen(1, |cgen| {
            cgen.load(&Expr::CallIntrinsic {
                intrinsic: Intrinsic::IsSmi,
                args: vec![Expr::var(crate::ast::VarRef::parameter("x", 0))],
            });
            assert_eq!(cgen.frame_mut().height(), 2);
        });
        let stream = masm.instructions();
        assert!(!stream
            .iter()
            .any(|i| matches!(i, Instr::CallRuntime(..) | Instr::CallStub(_))));
        assert!(stream.iter().any(|i| matches!(i, Instr::And(..))));
    }
}
