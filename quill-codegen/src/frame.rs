//! Virtual frame
//!
//! The virtual frame tracks, per expression-stack element, where the value
//! actually lives right now: in its canonical machine-stack slot, in an
//! allocatable register, as a not-yet-materialized constant, or as a cheap
//! copy of a lower element. Elements below the `synced` watermark are
//! materialized in their canonical slots; everything above lives off-stack.
//! Parameters and stack locals are ordinary elements, so local loads are
//! copies and local stores are slot stores.
//!
//! All emitting methods take the assembler as a parameter; the frame never
//! owns it. Heights, register ownership and copy counts are invariants:
//! violations are assertions, not recoverable errors.

use quill_masm::layout;
use quill_masm::{
    Builtin, Constant, IcKind, MacroAssembler, MemOperand, Operand, Reg, RootIndex, RuntimeFn,
    Stub,
};

/// Static type knowledge about a frame element. `Smi` and `Integer32` are
/// refinements of `Number`; merges at control-flow joins forget them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeInfo {
    Unknown,
    Number,
    Integer32,
    Smi,
}

impl TypeInfo {
    pub fn is_smi(self) -> bool {
        self == TypeInfo::Smi
    }

    pub fn is_number(self) -> bool {
        matches!(self, TypeInfo::Number | TypeInfo::Integer32 | TypeInfo::Smi)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Location {
    Memory,
    Register(Reg),
    Constant(Constant),
    Copy(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    location: Location,
    type_info: TypeInfo,
    copies: u32,
}

impl Element {
    fn memory() -> Element {
        Element {
            location: Location::Memory,
            type_info: TypeInfo::Unknown,
            copies: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualFrame {
    elements: Vec<Element>,
    param_count: usize,
    local_count: usize,
    /// Number of elements materialized in their canonical stack slots.
    /// Elements `0..synced` are `Memory`; elements above are not.
    synced: usize,
}

impl VirtualFrame {
    /// A frame as it looks on entry: parameters in their caller-pushed
    /// slots, no locals allocated yet.
    pub fn new(param_count: usize, local_count: usize) -> VirtualFrame {
        VirtualFrame {
            elements: (0..param_count).map(|_| Element::memory()).collect(),
            param_count,
            local_count,
            synced: param_count,
        }
    }

    pub fn height(&self) -> usize {
        self.elements.len()
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Height of the expression stack above parameters and locals.
    pub fn expression_height(&self) -> usize {
        debug_assert!(self.elements.len() >= self.param_count + self.local_count);
        self.elements.len() - self.param_count - self.local_count
    }

    pub fn is_spilled(&self) -> bool {
        self.synced == self.elements.len()
    }

    /// Element index of a parameter or local slot.
    pub fn parameter_index(&self, i: usize) -> usize {
        debug_assert!(i < self.param_count);
        i
    }

    pub fn local_index(&self, i: usize) -> usize {
        debug_assert!(i < self.local_count);
        self.param_count + i
    }

    // Canonical memory operands.

    pub fn element_operand(&self, index: usize) -> MemOperand {
        if index < self.param_count {
            // Caller-pushed, above the saved fp and return address.
            let offset = layout::FRAME_RETURN_ADDR_OFFSET
                + layout::POINTER_SIZE * (self.param_count - index) as i32;
            MemOperand::new(Reg::Fp, offset)
        } else {
            let slot = (index - self.param_count) as i32;
            MemOperand::new(
                Reg::Fp,
                layout::FRAME_FIRST_LOCAL_OFFSET - layout::POINTER_SIZE * slot,
            )
        }
    }

    pub fn receiver_operand(&self) -> MemOperand {
        MemOperand::new(
            Reg::Fp,
            layout::FRAME_RETURN_ADDR_OFFSET
                + layout::POINTER_SIZE * (self.param_count as i32 + 1),
        )
    }

    pub fn context_operand(&self) -> MemOperand {
        MemOperand::new(Reg::Fp, layout::FRAME_CONTEXT_OFFSET)
    }

    pub fn function_operand(&self) -> MemOperand {
        MemOperand::new(Reg::Fp, layout::FRAME_FUNCTION_OFFSET)
    }

    // Prologue / epilogue.

    /// Emit the frame setup. The function object arrives in `a1`; the
    /// context in `cp`. The two fixed slots below fp hold them.
    pub fn enter(&mut self, masm: &mut MacroAssembler) {
        masm.enter_frame();
        masm.push(Reg::Cp);
        masm.push(Reg::A1);
    }

    /// Allocate and initialize the stack locals to undefined.
    pub fn allocate_locals(&mut self, masm: &mut MacroAssembler) {
        debug_assert_eq!(self.elements.len(), self.param_count);
        if self.local_count > 0 {
            masm.load_root(Reg::SCRATCH0, RootIndex::Undefined);
            for _ in 0..self.local_count {
                masm.push(Reg::SCRATCH0);
                self.elements.push(Element::memory());
                self.synced += 1;
            }
        }
    }

    /// Emit the epilogue: unwind to fp and return past the arguments.
    pub fn exit(&mut self, masm: &mut MacroAssembler) {
        masm.exit_frame();
        masm.ret(self.param_count as u32);
    }

    // Element inspection.

    pub fn type_info_at(&self, depth: usize) -> TypeInfo {
        self.elements[self.elements.len() - 1 - depth].type_info
    }

    pub fn set_type_info_at(&mut self, depth: usize, info: TypeInfo) {
        let index = self.elements.len() - 1 - depth;
        self.elements[index].type_info = info;
    }

    pub fn known_smi_at(&self, depth: usize) -> bool {
        self.type_info_at(depth).is_smi()
    }

    pub fn element_type_info(&self, index: usize) -> TypeInfo {
        self.elements[index].type_info
    }

    pub fn set_element_type_info(&mut self, index: usize, info: TypeInfo) {
        self.elements[index].type_info = info;
    }

    /// Constant held by the element at `depth`, if unmaterialized.
    pub fn constant_at(&self, depth: usize) -> Option<&Constant> {
        match &self.elements[self.elements.len() - 1 - depth].location {
            Location::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// True if other elements are copies of the element at `index`.
    pub fn element_has_copies(&self, index: usize) -> bool {
        self.elements[index].copies > 0
    }

    fn register_user(&self, reg: Reg) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.location == Location::Register(reg))
    }

    fn first_free_register(&self, exclude: &[Reg]) -> Option<Reg> {
        Reg::ALLOCATABLE
            .iter()
            .copied()
            .find(|r| !exclude.contains(r) && self.register_user(*r).is_none())
    }

    // Syncing.

    /// Materialize elements `synced..=limit` into their canonical slots,
    /// in stack order.
    fn sync_to(&mut self, masm: &mut MacroAssembler, limit: usize) {
        while self.synced <= limit {
            let index = self.synced;
            let location = self.elements[index].location.clone();
            match location {
                Location::Memory => unreachable!("memory element above the watermark"),
                Location::Register(r) => {
                    masm.push(r);
                }
                Location::Constant(c) => {
                    masm.li(Reg::SCRATCH0, Operand::Const(c));
                    masm.push(Reg::SCRATCH0);
                }
                Location::Copy(backing) => {
                    debug_assert!(backing < index);
                    match &self.elements[backing].location {
                        Location::Memory => {
                            masm.lw(Reg::SCRATCH0, self.element_operand(backing));
                            masm.push(Reg::SCRATCH0);
                        }
                        Location::Register(r) => {
                            masm.push(*r);
                        }
                        Location::Constant(c) => {
                            masm.li(Reg::SCRATCH0, Operand::Const(c.clone()));
                            masm.push(Reg::SCRATCH0);
                        }
                        Location::Copy(_) => unreachable!("copy of a copy"),
                    }
                    self.elements[backing].copies -= 1;
                }
            }
            self.elements[index].location = Location::Memory;
            self.synced += 1;
        }
    }

    /// Materialize every element; afterwards no element owns a register.
    pub fn spill_all(&mut self, masm: &mut MacroAssembler) {
        if !self.elements.is_empty() {
            let top = self.elements.len() - 1;
            self.sync_to(masm, top);
        }
    }

    /// Allocate a register, spilling the lowest register element if the
    /// file is full. `exclude` registers are never returned.
    pub fn allocate_register(&mut self, masm: &mut MacroAssembler, exclude: &[Reg]) -> Reg {
        if let Some(reg) = self.first_free_register(exclude) {
            return reg;
        }
        let victim = self
            .elements
            .iter()
            .position(|e| match e.location {
                Location::Register(r) => !exclude.contains(&r),
                _ => false,
            })
            .expect("all allocatable registers excluded");
        self.sync_to(masm, victim);
        self.first_free_register(exclude)
            .expect("spill freed no register")
    }

    // Pushes.

    /// Push a value held in an allocatable register the frame now owns.
    pub fn push_register(&mut self, reg: Reg, info: TypeInfo) {
        debug_assert!(reg.is_allocatable(), "frame cannot own {}", reg);
        debug_assert!(self.register_user(reg).is_none(), "{} already owned", reg);
        self.elements.push(Element {
            location: Location::Register(reg),
            type_info: info,
            copies: 0,
        });
    }

    /// Push a constant without materializing it.
    pub fn push_constant(&mut self, constant: Constant) {
        let info = match &constant {
            Constant::Smi(_) => TypeInfo::Smi,
            Constant::Number(_) => TypeInfo::Number,
            _ => TypeInfo::Unknown,
        };
        self.elements.push(Element {
            location: Location::Constant(constant),
            type_info: info,
            copies: 0,
        });
    }

    /// Machine push of an arbitrary register; requires a spilled top.
    pub fn emit_push(&mut self, masm: &mut MacroAssembler, reg: Reg) {
        debug_assert!(self.is_spilled());
        masm.push(reg);
        self.elements.push(Element::memory());
        self.synced += 1;
    }

    /// Machine pop into a register; requires a spilled top.
    pub fn emit_pop(&mut self, masm: &mut MacroAssembler, reg: Reg) {
        debug_assert!(self.is_spilled());
        let popped = self.elements.pop().expect("pop from empty frame");
        debug_assert_eq!(popped.copies, 0, "popped an element that backs copies");
        self.synced -= 1;
        masm.pop(reg);
    }

    /// Push a copy of an existing element (local and parameter loads).
    pub fn push_element_copy(&mut self, index: usize) {
        let (location, info) = {
            let elem = &self.elements[index];
            match &elem.location {
                Location::Constant(c) => (Location::Constant(c.clone()), elem.type_info),
                Location::Copy(backing) => (Location::Copy(*backing), elem.type_info),
                _ => (Location::Copy(index), elem.type_info),
            }
        };
        if let Location::Copy(backing) = location {
            self.elements[backing].copies += 1;
        }
        self.elements.push(Element {
            location,
            type_info: info,
            copies: 0,
        });
    }

    pub fn dup(&mut self) {
        debug_assert!(!self.elements.is_empty());
        self.push_element_copy(self.elements.len() - 1);
    }

    /// Duplicate the top two elements, preserving their order.
    pub fn dup2(&mut self) {
        debug_assert!(self.elements.len() >= 2);
        self.push_element_copy(self.elements.len() - 2);
        self.push_element_copy(self.elements.len() - 2);
    }

    // Pops.

    /// Pop the top element into a register distinct from `exclude`.
    pub fn pop_to_register(
        &mut self,
        masm: &mut MacroAssembler,
        exclude: Option<Reg>,
    ) -> Reg {
        let excludes: Vec<Reg> = exclude.into_iter().collect();
        self.pop_to_register_excluding(masm, &excludes)
    }

    /// As `pop_to_register`, with several registers off limits (multi-
    /// operand pop sequences must keep earlier operands live).
    pub fn pop_to_register_excluding(
        &mut self,
        masm: &mut MacroAssembler,
        excludes: &[Reg],
    ) -> Reg {
        let top = self.elements.last().expect("pop from empty frame").clone();
        debug_assert_eq!(top.copies, 0, "popped an element that backs copies");
        match top.location {
            Location::Register(r) => {
                self.elements.pop();
                if excludes.contains(&r) {
                    let dest = self.allocate_register(masm, excludes);
                    masm.mov(dest, r);
                    dest
                } else {
                    r
                }
            }
            Location::Constant(c) => {
                self.elements.pop();
                let dest = self.allocate_register(masm, excludes);
                masm.li(dest, Operand::Const(c));
                dest
            }
            Location::Copy(backing) => {
                self.elements.pop();
                self.elements[backing].copies -= 1;
                let dest = self.allocate_register(masm, excludes);
                match &self.elements[backing].location {
                    Location::Memory => {
                        let mem = self.element_operand(backing);
                        masm.lw(dest, mem);
                    }
                    Location::Register(r) => masm.mov(dest, *r),
                    Location::Constant(c) => masm.li(dest, Operand::Const(c.clone())),
                    Location::Copy(_) => unreachable!("copy of a copy"),
                }
                dest
            }
            Location::Memory => {
                // A memory top implies the whole frame is synced.
                debug_assert!(self.is_spilled());
                self.elements.pop();
                self.synced -= 1;
                let dest = self.allocate_register(masm, excludes);
                masm.pop(dest);
                dest
            }
        }
    }

    /// The top element's value in a register, leaving the frame height
    /// unchanged.
    pub fn peek_to_register(
        &mut self,
        masm: &mut MacroAssembler,
        exclude: Option<Reg>,
    ) -> Reg {
        let info = self.type_info_at(0);
        let reg = self.pop_to_register(masm, exclude);
        self.push_register(reg, info);
        reg
    }

    /// Discard the top `n` elements, adjusting the machine sp for the
    /// materialized part.
    pub fn drop_(&mut self, masm: &mut MacroAssembler, n: usize) {
        let mut bytes = 0;
        for _ in 0..n {
            let index = self.elements.len() - 1;
            let elem = self.elements.pop().expect("drop from empty frame");
            debug_assert_eq!(elem.copies, 0, "dropped an element that backs copies");
            if let Location::Copy(backing) = elem.location {
                self.elements[backing].copies -= 1;
            }
            if index < self.synced {
                self.synced -= 1;
                bytes += layout::POINTER_SIZE;
            }
        }
        masm.add_sp(bytes);
    }

    /// Forget the top `n` elements without emitting code; the machine sp
    /// has already been unwound (by the runtime, or a handler).
    pub fn forget(&mut self, n: usize) {
        for _ in 0..n {
            let elem = self.elements.pop().expect("forget from empty frame");
            debug_assert_eq!(elem.copies, 0);
            debug_assert!(matches!(elem.location, Location::Memory));
            self.synced -= 1;
        }
    }

    /// Account for `n` words pushed behind the frame's back (a try-handler
    /// record).
    pub fn adjust(&mut self, n: usize) {
        debug_assert!(self.is_spilled());
        for _ in 0..n {
            self.elements.push(Element::memory());
            self.synced += 1;
        }
    }

    /// Store the register into a parameter/local element's canonical slot.
    pub fn store_to_element(&mut self, masm: &mut MacroAssembler, index: usize, reg: Reg) {
        debug_assert_eq!(
            self.elements[index].copies, 0,
            "stored over an element that backs copies"
        );
        if index >= self.synced {
            // The old value is dead; claim the slot.
            self.sync_to(masm, index);
        }
        let mem = self.element_operand(index);
        masm.sw(reg, mem);
        self.elements[index].type_info = TypeInfo::Unknown;
    }

    // Merging.

    /// Forget refinements that don't survive a control-flow join.
    pub fn forget_type_info(&mut self) {
        for elem in &mut self.elements {
            elem.type_info = TypeInfo::Unknown;
        }
    }

    /// Turn every constant or copy into a register or memory element so
    /// the frame can serve as a merge target.
    pub fn make_mergable(&mut self, masm: &mut MacroAssembler) {
        for index in self.synced..self.elements.len() {
            match self.elements[index].location.clone() {
                Location::Memory | Location::Register(_) => {}
                Location::Constant(c) => {
                    if let Some(reg) = self.first_free_register(&[]) {
                        masm.li(reg, Operand::Const(c));
                        self.elements[index].location = Location::Register(reg);
                    } else {
                        self.sync_to(masm, index);
                    }
                }
                Location::Copy(backing) => {
                    if self.elements[index].copies == 0 {
                        if let Some(reg) = self.first_free_register(&[]) {
                            match &self.elements[backing].location {
                                Location::Memory => {
                                    let mem = self.element_operand(backing);
                                    masm.lw(reg, mem);
                                }
                                Location::Register(r) => masm.mov(reg, *r),
                                Location::Constant(c) => {
                                    masm.li(reg, Operand::Const(c.clone()))
                                }
                                Location::Copy(_) => unreachable!(),
                            }
                            self.elements[backing].copies -= 1;
                            self.elements[index].location = Location::Register(reg);
                            continue;
                        }
                    }
                    self.sync_to(masm, index);
                }
            }
        }
    }

    /// True when the frame can serve as a merge target: no constants or
    /// copies anywhere above the watermark.
    pub fn is_mergable(&self) -> bool {
        self.elements[self.synced..]
            .iter()
            .all(|e| !matches!(e.location, Location::Constant(_) | Location::Copy(_)))
    }

    /// True if merging into `expected` would emit no code.
    pub fn matches(&self, expected: &VirtualFrame) -> bool {
        self.elements.len() == expected.elements.len()
            && self
                .elements
                .iter()
                .zip(&expected.elements)
                .all(|(a, b)| a.location == b.location)
    }

    /// Emit code making the machine state match `expected`. The expected
    /// frame must be mergable (memory prefix, registers above).
    pub fn merge_to(&mut self, masm: &mut MacroAssembler, expected: &VirtualFrame) {
        assert_eq!(self.elements.len(), expected.elements.len(), "height mismatch at merge");
        assert_eq!(self.param_count, expected.param_count);

        // Highest element whose location differs. Everything above it
        // already matches and (by the sync invariants) sits in registers.
        let mut highest = None;
        for i in 0..self.elements.len() {
            if self.elements[i].location != expected.elements[i].location {
                highest = Some(i);
            }
        }
        let highest = match highest {
            None => return,
            Some(h) => h,
        };

        debug_assert!(
            expected.elements[highest..]
                .iter()
                .all(|e| !matches!(e.location, Location::Constant(_) | Location::Copy(_))),
            "merge target is not mergable"
        );

        // Materialize every differing element, then pop the suffix the
        // target wants in registers back off the stack, top down.
        if highest >= self.synced {
            self.sync_to(masm, highest);
        }
        for i in (expected.synced..=highest).rev() {
            let reg = match expected.elements[i].location {
                Location::Register(r) => r,
                Location::Memory => continue,
                _ => unreachable!(),
            };
            debug_assert!(self.register_user(reg).is_none(), "register shuffle cycle");
            if i == self.synced - 1 {
                masm.pop(reg);
                self.synced -= 1;
            } else {
                let mem = self.element_operand(i);
                masm.lw(reg, mem);
            }
            self.elements[i].location = Location::Register(reg);
        }
        debug_assert!(self.matches(expected));
    }

    // Call wrappers. Each forces a spilled frame, emits the call, and
    // accounts for the stack arguments the callee consumed. Results come
    // back in v0 and are pushed by the caller when wanted.

    pub fn call_runtime(&mut self, masm: &mut MacroAssembler, f: RuntimeFn, argc: usize) {
        self.spill_all(masm);
        masm.call_runtime(f, argc as u32);
        self.forget(argc);
    }

    pub fn call_stub(&mut self, masm: &mut MacroAssembler, stub: Stub, argc: usize) {
        self.spill_all(masm);
        masm.call_stub(stub);
        self.forget(argc);
    }

    pub fn call_builtin(&mut self, masm: &mut MacroAssembler, b: Builtin, argc: usize) {
        self.spill_all(masm);
        masm.call_builtin(b, argc as u32);
        self.forget(argc);
    }

    /// Named load: pops the receiver into `a0`, result in `v0`.
    pub fn call_load_ic(&mut self, masm: &mut MacroAssembler, name: String, contextual: bool) {
        self.spill_all(masm);
        self.emit_pop(masm, Reg::A0);
        masm.call_ic(IcKind::Load { name, contextual });
    }

    /// Keyed load: pops key into `a0` and receiver into `a1`.
    pub fn call_keyed_load_ic(&mut self, masm: &mut MacroAssembler) {
        self.spill_all(masm);
        self.emit_pop(masm, Reg::A0);
        self.emit_pop(masm, Reg::A1);
        masm.call_ic(IcKind::KeyedLoad);
    }

    /// Named store: pops value into `a0` and receiver into `a1`; the
    /// value comes back in `v0`.
    pub fn call_store_ic(&mut self, masm: &mut MacroAssembler, name: String) {
        self.spill_all(masm);
        self.emit_pop(masm, Reg::A0);
        self.emit_pop(masm, Reg::A1);
        masm.call_ic(IcKind::Store { name });
    }

    /// Keyed store: pops value into `a0`, key into `a1`, receiver into
    /// `a2`; the value comes back in `v0`.
    pub fn call_keyed_store_ic(&mut self, masm: &mut MacroAssembler) {
        self.spill_all(masm);
        self.emit_pop(masm, Reg::A0);
        self.emit_pop(masm, Reg::A1);
        self.emit_pop(masm, Reg::A2);
        masm.call_ic(IcKind::KeyedStore);
    }

    /// Monomorphic-looking call site: consumes receiver and arguments.
    pub fn call_call_ic(&mut self, masm: &mut MacroAssembler, name: String, argc: usize) {
        self.spill_all(masm);
        masm.call_ic(IcKind::Call {
            name,
            argc: argc as u32,
        });
        self.forget(argc + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quill_common::Smi;
    use quill_masm::Instr;

    fn smi(n: i32) -> Constant {
        Constant::Smi(Smi::new(n).unwrap())
    }

    #[test]
    fn test_entry_frame_shape() {
        let frame = VirtualFrame::new(2, 3);
        assert_eq!(frame.height(), 2);
        assert!(frame.is_spilled());
    }

    #[test]
    fn test_local_allocation_pushes_undefined() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 2);
        frame.allocate_locals(&mut masm);
        assert_eq!(frame.height(), 2);
        assert_eq!(
            masm.instructions(),
            &[
                Instr::LoadRoot(Reg::SCRATCH0, RootIndex::Undefined),
                Instr::Push(Reg::SCRATCH0),
                Instr::Push(Reg::SCRATCH0),
            ]
        );
    }

    #[test]
    fn test_constant_push_emits_nothing() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.push_constant(smi(7));
        assert_eq!(masm.len(), 0);
        assert_eq!(frame.type_info_at(0), TypeInfo::Smi);
        let reg = frame.pop_to_register(&mut masm, None);
        assert_eq!(
            masm.instructions(),
            &[Instr::LoadImm(reg, Operand::Const(smi(7)))]
        );
    }

    #[test]
    fn test_spill_all_materializes_in_stack_order() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.push_constant(smi(1));
        frame.push_constant(smi(2));
        frame.spill_all(&mut masm);
        assert!(frame.is_spilled());
        assert_eq!(
            masm.instructions(),
            &[
                Instr::LoadImm(Reg::SCRATCH0, Operand::Const(smi(1))),
                Instr::Push(Reg::SCRATCH0),
                Instr::LoadImm(Reg::SCRATCH0, Operand::Const(smi(2))),
                Instr::Push(Reg::SCRATCH0),
            ]
        );
    }

    #[test]
    fn test_dup_of_register_element_is_free() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        let reg = frame.allocate_register(&mut masm, &[]);
        frame.push_register(reg, TypeInfo::Unknown);
        frame.dup();
        assert_eq!(frame.height(), 2);
        assert_eq!(masm.len(), 0);
        // Popping the copy reads through to the backing register.
        let copy_reg = frame.pop_to_register(&mut masm, None);
        assert_ne!(copy_reg, reg);
        assert_eq!(masm.instructions(), &[Instr::Mov(copy_reg, reg)]);
    }

    #[test]
    #[should_panic(expected = "backs copies")]
    fn test_popping_a_backing_element_panics() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        let reg = frame.allocate_register(&mut masm, &[]);
        frame.push_register(reg, TypeInfo::Unknown);
        frame.dup();
        // Force the backing element to the top; dropping it while its
        // copy is live violates the copy-count invariant.
        frame.elements.swap(0, 1);
        frame.drop_(&mut masm, 1);
    }

    #[test]
    fn test_merge_to_identical_frame_emits_nothing() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(1, 1);
        frame.elements.push(Element::memory());
        frame.synced += 1;
        let expected = frame.clone();
        let before = masm.len();
        frame.merge_to(&mut masm, &expected);
        assert_eq!(masm.len(), before);
    }

    #[test]
    fn test_merge_spills_into_memory_target() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.push_constant(smi(3));

        let mut expected = VirtualFrame::new(0, 0);
        expected.elements.push(Element::memory());
        expected.synced = 1;

        frame.merge_to(&mut masm, &expected);
        assert!(frame.matches(&expected));
        assert_eq!(
            masm.instructions(),
            &[
                Instr::LoadImm(Reg::SCRATCH0, Operand::Const(smi(3))),
                Instr::Push(Reg::SCRATCH0),
            ]
        );
    }

    #[test]
    fn test_merge_pops_into_register_target() {
        let mut masm = MacroAssembler::new();
        // Source: one synced element on the stack.
        let mut frame = VirtualFrame::new(0, 0);
        frame.elements.push(Element::memory());
        frame.synced = 1;
        // Target: the same element held in a0.
        let mut expected = VirtualFrame::new(0, 0);
        expected.elements.push(Element {
            location: Location::Register(Reg::A0),
            type_info: TypeInfo::Unknown,
            copies: 0,
        });

        frame.merge_to(&mut masm, &expected);
        assert!(frame.matches(&expected));
        assert_eq!(masm.instructions(), &[Instr::Pop(Reg::A0)]);
    }

    #[test]
    fn test_call_runtime_consumes_arguments() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        frame.push_constant(smi(1));
        frame.push_constant(smi(2));
        frame.call_runtime(&mut masm, RuntimeFn::SetProperty, 2);
        assert_eq!(frame.height(), 0);
        assert!(matches!(
            masm.instructions().last(),
            Some(Instr::CallRuntime(RuntimeFn::SetProperty, 2))
        ));
    }

    #[test]
    fn test_register_exhaustion_spills_lowest() {
        let mut masm = MacroAssembler::new();
        let mut frame = VirtualFrame::new(0, 0);
        for _ in 0..Reg::ALLOCATABLE.len() {
            let reg = frame.allocate_register(&mut masm, &[]);
            frame.push_register(reg, TypeInfo::Unknown);
        }
        assert_eq!(masm.len(), 0);
        // Next allocation has to push the oldest element.
        let reg = frame.allocate_register(&mut masm, &[]);
        assert_eq!(reg, Reg::ALLOCATABLE[0]);
        assert_eq!(masm.instructions(), &[Instr::Push(Reg::ALLOCATABLE[0])]);
    }
}
