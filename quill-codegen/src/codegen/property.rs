//! Property access fast paths
//!
//! Outside loops a property access is a plain inline-cache call. Inside
//! loops the access is inlined: a tag check, a map check against a
//! patchable constant, and the in-object or element load itself, with a
//! deferred block calling the IC when any check fails. The runtime finds
//! the inline site through the patch marker after the deferred call and
//! rewrites the map constant and offset once the site goes monomorphic.
//!
//! Keyed stores only inline the smi-value case; smi values need no write
//! barrier, so the inlined store stays three instructions.

use crate::codegen::CodeGenerator;
use crate::deferred::{DeferredBlock, DeferredKind};
use crate::frame::TypeInfo;
use log::trace;
use quill_common::SourcePos;
use quill_masm::{field, layout, Condition, Constant, Operand, Reg, RootIndex};

impl<'a> CodeGenerator<'a> {
    /// Receiver on top of the frame; replaced by the property value.
    pub(crate) fn emit_named_load(&mut self, name: &str, is_contextual: bool) {
        if !self.in_loop() || is_contextual {
            let name = name.to_string();
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.call_load_ic(masm, name, is_contextual);
            f.emit_push(masm, Reg::V0);
            return;
        }

        trace!("inlining named load of '{}'", name);
        let name = name.to_string();
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // The deferred block merges back into this frame; constants and
        // copies must be materialized before the snapshot is taken.
        f.make_mergable(masm);
        let receiver = f.pop_to_register(masm, None);
        let result = f.allocate_register(masm, &[receiver]);
        let block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::NamedLoad {
                receiver,
                result,
                name: name.clone(),
                is_contextual,
            },
            SourcePos::NONE,
        );
        let entry = block.entry;
        let exit = block.exit;

        masm.comment(format!("inlined named load: {}", name));
        masm.branch_if_smi(receiver, Reg::SCRATCH0, entry);
        // Map check against a patchable constant; the null placeholder
        // fails until the runtime installs the hot map.
        masm.lw(Reg::SCRATCH0, field(receiver, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.li(Reg::SCRATCH1, Operand::Const(Constant::Null));
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        // In-object load; the offset is patched along with the map.
        masm.lw(result, field(receiver, layout::JS_OBJECT_HEADER_SIZE));

        masm.bind(exit);
        f.push_register(result, TypeInfo::Unknown);
        self.add_deferred(block);
    }

    /// Receiver below the value on the frame; both are replaced by the
    /// stored value.
    pub(crate) fn emit_named_store(&mut self, name: &str) {
        if !self.in_loop() {
            let name = name.to_string();
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.call_store_ic(masm, name);
            f.emit_push(masm, Reg::V0);
            return;
        }

        let name = name.to_string();
        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // Mergable before the pops, so the snapshot is a merge target.
        f.make_mergable(masm);
        let value = f.pop_to_register(masm, None);
        let receiver = f.pop_to_register(masm, Some(value));
        let block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::NamedStore {
                receiver,
                value,
                name: name.clone(),
            },
            SourcePos::NONE,
        );
        let entry = block.entry;
        let exit = block.exit;

        masm.comment(format!("inlined named store: {}", name));
        masm.branch_if_smi(receiver, Reg::SCRATCH0, entry);
        masm.lw(Reg::SCRATCH0, field(receiver, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.li(Reg::SCRATCH1, Operand::Const(Constant::Null));
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        masm.sw(value, field(receiver, layout::JS_OBJECT_HEADER_SIZE));
        masm.record_write(
            receiver,
            layout::JS_OBJECT_HEADER_SIZE,
            value,
            Reg::SCRATCH0,
        );

        masm.bind(exit);
        f.push_register(value, TypeInfo::Unknown);
        self.add_deferred(block);
    }

    /// Receiver then key on the frame; both are replaced by the value.
    pub(crate) fn emit_keyed_load(&mut self) {
        if !self.in_loop() {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.call_keyed_load_ic(masm);
            f.emit_push(masm, Reg::V0);
            return;
        }

        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // Mergable before the pops, so the snapshot is a merge target.
        f.make_mergable(masm);
        let key = f.pop_to_register(masm, None);
        let receiver = f.pop_to_register(masm, Some(key));
        let result = f.allocate_register(masm, &[receiver, key]);
        let block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::KeyedLoad {
                receiver,
                key,
                result,
            },
            SourcePos::NONE,
        );
        let entry = block.entry;
        let exit = block.exit;

        masm.comment("inlined keyed load");
        masm.branch_if_not_smi(key, Reg::SCRATCH0, entry);
        masm.branch_if_smi(receiver, Reg::SCRATCH0, entry);
        masm.lw(Reg::SCRATCH0, field(receiver, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.li(Reg::SCRATCH1, Operand::Const(Constant::Null));
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        // Fast elements only: the backing store must be a plain fixed
        // array, and the key must be inside its length. The unsigned
        // compare rejects negative keys in the same test.
        masm.lw(Reg::SCRATCH2, field(receiver, layout::JS_OBJECT_ELEMENTS_OFFSET));
        masm.lw(Reg::SCRATCH0, field(Reg::SCRATCH2, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.load_root(Reg::SCRATCH1, RootIndex::FixedArrayMap);
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        masm.lw(Reg::SCRATCH0, field(Reg::SCRATCH2, layout::FIXED_ARRAY_LENGTH_OFFSET));
        masm.branch(Condition::Hs, key, Operand::Reg(Reg::SCRATCH0), entry);
        // elements + header + key * pointer size; the tagged key is
        // already the index scaled by two.
        masm.sll(Reg::SCRATCH0, key, 1);
        masm.add(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Reg(Reg::SCRATCH2));
        masm.lw(result, field(Reg::SCRATCH0, layout::FIXED_ARRAY_HEADER_SIZE));
        // Holes fall back to the IC, which knows about prototypes.
        masm.load_root(Reg::SCRATCH1, RootIndex::TheHole);
        masm.branch(Condition::Eq, result, Operand::Reg(Reg::SCRATCH1), entry);

        masm.bind(exit);
        f.push_register(result, TypeInfo::Unknown);
        self.add_deferred(block);
    }

    /// Receiver, key, then value on the frame; all replaced by the value.
    pub(crate) fn emit_keyed_store(&mut self) {
        if !self.in_loop() {
            let (masm, frame) = self.parts();
            let f = frame.as_mut().unwrap();
            f.call_keyed_store_ic(masm);
            f.emit_push(masm, Reg::V0);
            return;
        }

        let (masm, frame) = self.parts();
        let f = frame.as_mut().unwrap();
        // Mergable before the pops, so the snapshot is a merge target.
        f.make_mergable(masm);
        let value = f.pop_to_register(masm, None);
        let key = f.pop_to_register(masm, Some(value));
        let receiver = f.pop_to_register_excluding(masm, &[value, key]);
        let block = DeferredBlock::new(
            masm,
            f.clone(),
            DeferredKind::KeyedStore {
                receiver,
                key,
                value,
            },
            SourcePos::NONE,
        );
        let entry = block.entry;
        let exit = block.exit;

        masm.comment("inlined keyed store");
        // Smi values need no write barrier; everything else goes slow.
        masm.branch_if_not_smi(value, Reg::SCRATCH0, entry);
        masm.branch_if_not_smi(key, Reg::SCRATCH0, entry);
        masm.branch_if_smi(receiver, Reg::SCRATCH0, entry);
        masm.lw(Reg::SCRATCH0, field(receiver, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.li(Reg::SCRATCH1, Operand::Const(Constant::Null));
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        masm.lw(Reg::SCRATCH2, field(receiver, layout::JS_OBJECT_ELEMENTS_OFFSET));
        masm.lw(Reg::SCRATCH0, field(Reg::SCRATCH2, layout::HEAP_OBJECT_MAP_OFFSET));
        masm.load_root(Reg::SCRATCH1, RootIndex::FixedArrayMap);
        masm.branch(
            Condition::Ne,
            Reg::SCRATCH0,
            Operand::Reg(Reg::SCRATCH1),
            entry,
        );
        masm.lw(Reg::SCRATCH0, field(Reg::SCRATCH2, layout::FIXED_ARRAY_LENGTH_OFFSET));
        masm.branch(Condition::Hs, key, Operand::Reg(Reg::SCRATCH0), entry);
        masm.sll(Reg::SCRATCH0, key, 1);
        masm.add(Reg::SCRATCH0, Reg::SCRATCH0, Operand::Reg(Reg::SCRATCH2));
        masm.sw(value, field(Reg::SCRATCH0, layout::FIXED_ARRAY_HEADER_SIZE));

        masm.bind(exit);
        f.push_register(value, TypeInfo::Unknown);
        self.add_deferred(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionInfo, ScopeInfo};
    use crate::frame::VirtualFrame;
    use quill_masm::{IcKind, Instr, MacroAssembler};

    fn with_cgen(
        loop_nesting: usize,
        run: impl FnOnce(&mut CodeGenerator<'_>),
    ) -> MacroAssembler {
        let mut info = FunctionInfo::new("test", ScopeInfo::function(0, 0), vec![]);
        info.loop_nesting = loop_nesting;
        let mut masm = MacroAssembler::new();
        {
            let mut cgen = CodeGenerator::new(&info, &mut masm);
            cgen.frame = Some(VirtualFrame::new(0, 0));
            run(&mut cgen);
        }
        masm
    }

    #[test]
    fn test_named_load_outside_loop_calls_ic() {
        let masm = with_cgen(0, |cgen| {
            cgen.frame_mut().push_constant(Constant::Undefined);
            cgen.emit_named_load("length", false);
        });
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallIc(IcKind::Load { .. }))));
        // No inline patch site outside loops.
        assert!(!masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::InlinePatchMarker)));
    }

    #[test]
    fn test_named_load_in_loop_emits_patchable_site() {
        let masm = with_cgen(1, |cgen| {
            cgen.frame_mut().push_constant(Constant::Undefined);
            cgen.emit_named_load("length", false);
            cgen.flush_deferred_code();
        });
        let stream = masm.instructions();
        // The inline map check compares against the null placeholder.
        assert!(stream
            .iter()
            .any(|i| matches!(i, Instr::LoadImm(_, Operand::Const(Constant::Null)))));
        // The deferred IC call is marked for patching.
        let call_at = stream
            .iter()
            .position(|i| matches!(i, Instr::CallIc(IcKind::Load { .. })))
            .expect("deferred IC call");
        assert!(matches!(stream[call_at + 1], Instr::InlinePatchMarker));
    }

    #[test]
    fn test_inlined_load_merges_back_over_pending_constants() {
        // As in `g(1, o.foo)`: the constant argument is still
        // unmaterialized in the frame when the load's fast path is
        // inlined, and the deferred block must merge back over it.
        let masm = with_cgen(1, |cgen| {
            cgen.frame_mut()
                .push_constant(Constant::Smi(quill_common::Smi::new(1).unwrap()));
            cgen.frame_mut().push_constant(Constant::Undefined);
            cgen.emit_named_load("foo", false);
            cgen.flush_deferred_code();
        });
        assert!(masm
            .instructions()
            .iter()
            .any(|i| matches!(i, Instr::CallIc(IcKind::Load { .. }))));
    }

    #[test]
    fn test_keyed_store_in_loop_only_inlines_smi_values() {
        let masm = with_cgen(1, |cgen| {
            cgen.frame_mut().push_constant(Constant::Undefined); // receiver
            cgen.frame_mut().push_constant(Constant::Undefined); // key
            cgen.frame_mut().push_constant(Constant::Undefined); // value
            cgen.emit_keyed_store();
            cgen.flush_deferred_code();
        });
        // The value's tag check comes before any map check, and the fast
        // path stores without a write barrier.
        let stream = masm.instructions();
        assert!(stream.iter().any(|i| matches!(i, Instr::Sw(..))));
        assert!(!stream
            .iter()
            .any(|i| matches!(i, Instr::RecordWrite { .. })));
    }
}
