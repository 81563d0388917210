//! References to assignable locations
//!
//! A reference names an lvalue: a resolved slot, a named property, or a
//! keyed property. Loading a reference evaluates and pushes the parts of
//! the target that must be evaluated once (the receiver, and the key for
//! keyed accesses); `get_value`/`set_value` then operate against those
//! frame elements. A persistent reference duplicates its parts before a
//! get so a following set can reuse them (compound assignments, count
//! operations).
//!
//! A loaded reference still holds frame elements; it must be unloaded
//! before it is dropped.

use crate::ast::{Slot, VariableMode};

#[derive(Debug, Clone, PartialEq)]
pub enum RefKind {
    /// A resolved variable; occupies no frame elements.
    Slot {
        slot: Slot,
        mode: VariableMode,
        name: String,
        is_arguments: bool,
    },
    /// A named property; the receiver is on the frame.
    Named { name: String },
    /// A keyed property; receiver then key are on the frame.
    Keyed,
}

#[derive(Debug)]
pub struct Reference {
    kind: RefKind,
    persist_after_get: bool,
    unloaded: bool,
}

impl Reference {
    pub fn new(kind: RefKind, persist_after_get: bool) -> Reference {
        Reference {
            kind,
            persist_after_get,
            unloaded: false,
        }
    }

    pub fn kind(&self) -> &RefKind {
        &self.kind
    }

    pub fn persist_after_get(&self) -> bool {
        self.persist_after_get
    }

    /// Frame elements this reference occupies while loaded.
    pub fn size(&self) -> usize {
        match self.kind {
            RefKind::Slot { .. } => 0,
            RefKind::Named { .. } => 1,
            RefKind::Keyed => 2,
        }
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    /// Mark the reference as consumed. The caller has already dropped or
    /// replaced its frame elements.
    pub fn set_unloaded(&mut self) {
        debug_assert!(!self.unloaded, "reference unloaded twice");
        self.unloaded = true;
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        // A leaked loaded reference means frame elements nobody owns.
        if !std::thread::panicking() {
            debug_assert!(self.unloaded, "reference dropped while loaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let mut slot = Reference::new(
            RefKind::Slot {
                slot: Slot::Local(0),
                mode: VariableMode::Var,
                name: "x".to_string(),
                is_arguments: false,
            },
            false,
        );
        let mut named = Reference::new(
            RefKind::Named {
                name: "y".to_string(),
            },
            false,
        );
        let mut keyed = Reference::new(RefKind::Keyed, true);
        assert_eq!(slot.size(), 0);
        assert_eq!(named.size(), 1);
        assert_eq!(keyed.size(), 2);
        slot.set_unloaded();
        named.set_unloaded();
        keyed.set_unloaded();
    }

    #[test]
    #[should_panic(expected = "dropped while loaded")]
    fn test_dropping_loaded_reference_panics() {
        let reference = Reference::new(RefKind::Keyed, false);
        drop(reference);
    }
}
