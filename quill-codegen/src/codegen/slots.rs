//! Variable slot loads and stores
//!
//! Parameters and stack locals are frame elements, so loading one is a
//! free copy and storing one is a canonical-slot store. Context slots walk
//! the context chain. Lookup slots resolve by name at runtime, with an
//! inlined fast case when the scope analysis proved the intervening
//! contexts have no extensions.
//!
//! Const bindings hold the hole until initialized: loads rewrite the hole
//! to undefined, stores outside the initialization are ignored, and the
//! initialization itself only fires while the hole is still there.

use crate::ast::{ArgumentsMode, DynamicFastCase, Slot, VariableMode};
use crate::codegen::{CodeGenerator, InitState, TypeofState};
use crate::frame::TypeInfo;
use crate::jump_target::BreakTarget;
use quill_common::Smi;
use quill_masm::{
    field, layout, Condition, Constant, Operand, Reg, RootIndex, RuntimeFn, Stub,
};
use quill_masm::ArgumentsAccessKind;

impl<'a> CodeGenerator<'a> {
    /// Push the value of a resolved slot.
    pub(crate) fn load_from_slot(
        &mut self,
        slot: &Slot,
        mode: VariableMode,
        name: &str,
        typeof_state: TypeofState,
    ) {
        match slot {
            Slot::Parameter(i) => {
                let index = self.frame_mut().parameter_index(*i);
                self.frame_mut().push_element_copy(index);
            }
            Slot::Local(i) => {
                let index = self.frame_mut().local_index(*i);
                self.frame_mut().push_element_copy(index);
            }
            Slot::Context { depth, index } => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let dest = f.allocate_register(masm, &[]);
                let mut ctx = Reg::Cp;
                for _ in 0..*depth {
                    masm.lw(
                        dest,
                        Self::context_slot_operand(ctx, layout::CONTEXT_PREVIOUS_INDEX as usize),
                    );
                    ctx = dest;
                }
                masm.lw(dest, Self::context_slot_operand(ctx, *index));
                f.push_register(dest, TypeInfo::Unknown);
            }
            Slot::Lookup { fast } => {
                self.load_from_lookup_slot(fast.as_ref(), name, typeof_state);
                return;
            }
        }
        if Self::is_const_mode(mode) {
            self.replace_hole_with_undefined();
        }
    }

    /// An uninitialized const reads as undefined, not as the hole.
    fn replace_hole_with_undefined(&mut self) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let reg = f.pop_to_register(masm, None);
        let done = masm.new_label();
        masm.load_root(Reg::SCRATCH0, RootIndex::TheHole);
        masm.branch(Condition::Ne, reg, Operand::Reg(Reg::SCRATCH0), done);
        masm.load_root(reg, RootIndex::Undefined);
        masm.bind(done);
        f.push_register(reg, TypeInfo::Unknown);
    }

    /// Slot load for the `arguments` binding: under the lazy mode the
    /// slot holds the hole until the first load materializes the object.
    pub(crate) fn load_arguments_slot(&mut self, slot: &Slot, name: &str) {
        self.load_from_slot(slot, VariableMode::Var, name, TypeofState::NotInside);
        let lazy = matches!(self.info.scope.arguments, Some(ArgumentsMode::Lazy { .. }));
        if !lazy {
            return;
        }
        let slot = slot.clone();
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        let reg = f.pop_to_register(masm, None);
        let done = masm.new_label();
        masm.load_root(Reg::SCRATCH0, RootIndex::TheHole);
        masm.branch(Condition::Ne, reg, Operand::Reg(Reg::SCRATCH0), done);

        // First touch: build the object and cache it back in the slot.
        // The machine pushes below stay balanced inside this region, so
        // the frame model needs no adjustment.
        masm.lw(Reg::SCRATCH0, f.function_operand());
        masm.push(Reg::SCRATCH0);
        masm.add(
            Reg::SCRATCH0,
            Reg::Fp,
            Operand::Imm(
                layout::FRAME_RETURN_ADDR_OFFSET
                    + layout::POINTER_SIZE * (f.param_count() as i32 + 1),
            ),
        );
        masm.push(Reg::SCRATCH0);
        masm.li(
            Reg::SCRATCH0,
            Operand::Smi(Smi::new(f.param_count() as i32).expect("param count fits a smi")),
        );
        masm.push(Reg::SCRATCH0);
        masm.call_stub(Stub::ArgumentsAccess(ArgumentsAccessKind::NewObject));
        masm.mov(reg, Reg::V0);
        match &slot {
            Slot::Parameter(i) => {
                let index = f.parameter_index(*i);
                masm.sw(reg, f.element_operand(index));
            }
            Slot::Local(i) => {
                let index = f.local_index(*i);
                masm.sw(reg, f.element_operand(index));
            }
            Slot::Context { depth, index } => {
                let mut ctx = Reg::Cp;
                for _ in 0..*depth {
                    masm.lw(
                        Reg::SCRATCH1,
                        Self::context_slot_operand(ctx, layout::CONTEXT_PREVIOUS_INDEX as usize),
                    );
                    ctx = Reg::SCRATCH1;
                }
                let offset = layout::context_slot_offset(*index as i32);
                masm.sw(reg, field(ctx, offset));
                masm.record_write(ctx, offset, reg, Reg::SCRATCH0);
            }
            Slot::Lookup { .. } => unreachable!("arguments binding is always resolved"),
        }
        masm.bind(done);
        f.push_register(reg, TypeInfo::Unknown);
    }

    /// Store the value on top of the frame into a slot, leaving the value
    /// on the frame (assignment results are expressions).
    pub(crate) fn store_to_slot(
        &mut self,
        slot: &Slot,
        mode: VariableMode,
        name: &str,
        init_state: InitState,
    ) {
        // Writes to an initialized const are silently dropped.
        if Self::is_const_mode(mode) && init_state == InitState::NotConstInit {
            return;
        }
        let const_init = Self::is_const_mode(mode) && init_state == InitState::ConstInit;
        match slot {
            Slot::Parameter(_) | Slot::Local(_) => {
                let index = match slot {
                    Slot::Parameter(i) => self.frame_mut().parameter_index(*i),
                    Slot::Local(i) => self.frame_mut().local_index(*i),
                    _ => unreachable!(),
                };
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                if f.element_has_copies(index) {
                    // Materialize the copies before the slot changes.
                    f.spill_all(masm);
                }
                let reg = f.peek_to_register(masm, None);
                if const_init {
                    // Initialize only while the hole is still there.
                    f.spill_all(masm);
                    let skip = masm.new_label();
                    masm.lw(Reg::SCRATCH0, f.element_operand(index));
                    masm.load_root(Reg::SCRATCH1, RootIndex::TheHole);
                    masm.branch(
                        Condition::Ne,
                        Reg::SCRATCH0,
                        Operand::Reg(Reg::SCRATCH1),
                        skip,
                    );
                    masm.sw(reg, f.element_operand(index));
                    masm.bind(skip);
                    f.set_element_type_info(index, TypeInfo::Unknown);
                } else {
                    f.store_to_element(masm, index, reg);
                }
            }
            Slot::Context { depth, index } => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                let reg = f.peek_to_register(masm, None);
                let mut ctx = Reg::Cp;
                for _ in 0..*depth {
                    masm.lw(
                        Reg::SCRATCH1,
                        Self::context_slot_operand(ctx, layout::CONTEXT_PREVIOUS_INDEX as usize),
                    );
                    ctx = Reg::SCRATCH1;
                }
                let offset = layout::context_slot_offset(*index as i32);
                if const_init {
                    let skip = masm.new_label();
                    masm.lw(Reg::SCRATCH0, field(ctx, offset));
                    masm.load_root(Reg::SCRATCH2, RootIndex::TheHole);
                    masm.branch(
                        Condition::Ne,
                        Reg::SCRATCH0,
                        Operand::Reg(Reg::SCRATCH2),
                        skip,
                    );
                    masm.sw(reg, field(ctx, offset));
                    masm.record_write(ctx, offset, reg, Reg::SCRATCH0);
                    masm.bind(skip);
                } else {
                    masm.sw(reg, field(ctx, offset));
                    masm.record_write(ctx, offset, reg, Reg::SCRATCH0);
                }
            }
            Slot::Lookup { .. } => {
                let name = name.to_string();
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.spill_all(masm);
                masm.li(Reg::SCRATCH0, Operand::Const(Constant::Str(name)));
                f.emit_push(masm, Reg::SCRATCH0);
                let rt = if const_init {
                    RuntimeFn::InitializeConstContextSlot
                } else {
                    RuntimeFn::StoreContextSlot
                };
                f.call_runtime(masm, rt, 2);
                f.emit_push(masm, Reg::V0);
            }
        }
    }

    /// Global variables are named properties of the global object.
    pub(crate) fn load_global(&mut self, name: &str, typeof_state: TypeofState) {
        let contextual = typeof_state == TypeofState::NotInside;
        let name = name.to_string();
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
        f.call_load_ic(masm, name, contextual);
        f.emit_push(masm, Reg::V0);
    }

    fn load_from_lookup_slot(
        &mut self,
        fast: Option<&DynamicFastCase>,
        name: &str,
        typeof_state: TypeofState,
    ) {
        let mut slow = BreakTarget::new();
        let mut done = BreakTarget::new();
        if let Some(fast) = fast {
            {
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().spill_all(masm);
            }
            match fast {
                DynamicFastCase::Global { checks } => {
                    self.emit_extension_checks(*checks, &mut slow);
                    self.load_global(name, typeof_state);
                }
                DynamicFastCase::Local { checks, slot } => {
                    self.emit_extension_checks(*checks, &mut slow);
                    self.load_from_slot(slot, VariableMode::Var, name, typeof_state);
                }
            }
            let (masm, frame) = self.parts();
            done.jump(masm, frame);
            let (masm, frame) = self.parts();
            slow.bind(masm, frame);
        }

        let name = name.to_string();
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        f.spill_all(masm);
        masm.li(Reg::SCRATCH0, Operand::Const(Constant::Str(name)));
        f.emit_push(masm, Reg::SCRATCH0);
        let rt = match typeof_state {
            TypeofState::Inside => RuntimeFn::LoadContextSlotNoReferenceError,
            TypeofState::NotInside => RuntimeFn::LoadContextSlot,
        };
        f.call_runtime(masm, rt, 1);
        f.emit_push(masm, Reg::V0);

        if done.is_linked() {
            let (masm, frame) = self.parts();
            done.bind(masm, frame);
        }
    }

    /// Branch to `slow` if any of the `checks` innermost contexts has
    /// grown an extension (an eval-introduced binding could shadow us).
    fn emit_extension_checks(&mut self, checks: usize, slow: &mut BreakTarget) {
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        let mut ctx = Reg::Cp;
        for i in 0..checks {
            masm.lw(
                Reg::SCRATCH0,
                Self::context_slot_operand(ctx, layout::CONTEXT_EXTENSION_INDEX as usize),
            );
            slow.branch(masm, f, Condition::Ne, Reg::SCRATCH0, Operand::zero());
            if i + 1 < checks {
                masm.lw(
                    Reg::SCRATCH1,
                    Self::context_slot_operand(ctx, layout::CONTEXT_PREVIOUS_INDEX as usize),
                );
                ctx = Reg::SCRATCH1;
            }
        }
    }

    /// Prologue half of the arguments object: eager mode builds it now,
    /// lazy mode plants the hole for `load_arguments_slot` to find.
    pub(crate) fn store_arguments_object(&mut self) {
        let mode = self
            .info
            .scope
            .arguments
            .clone()
            .expect("no arguments object requested");
        self.masm.comment("arguments object");
        match mode {
            ArgumentsMode::Eager { slot } => {
                let (masm, frame) = self.parts();
                let f = frame.as_mut().unwrap();
                f.spill_all(masm);
                masm.lw(Reg::SCRATCH0, f.function_operand());
                f.emit_push(masm, Reg::SCRATCH0);
                masm.add(
                    Reg::SCRATCH0,
                    Reg::Fp,
                    Operand::Imm(
                        layout::FRAME_RETURN_ADDR_OFFSET
                            + layout::POINTER_SIZE * (f.param_count() as i32 + 1),
                    ),
                );
                f.emit_push(masm, Reg::SCRATCH0);
                masm.li(
                    Reg::SCRATCH0,
                    Operand::Smi(
                        Smi::new(f.param_count() as i32).expect("param count fits a smi"),
                    ),
                );
                f.emit_push(masm, Reg::SCRATCH0);
                f.call_stub(masm, Stub::ArgumentsAccess(ArgumentsAccessKind::NewObject), 3);
                f.emit_push(masm, Reg::V0);
                self.store_to_slot(&slot, VariableMode::Var, "arguments", InitState::NotConstInit);
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
            }
            ArgumentsMode::Lazy { slot } => {
                self.frame_mut().push_constant(Constant::TheHole);
                self.store_to_slot(&slot, VariableMode::Var, "arguments", InitState::NotConstInit);
                let (masm, frame) = self.parts();
                frame.as_mut().unwrap().drop_(masm, 1);
            }
        }
    }
}
