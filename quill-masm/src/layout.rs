//! Object-model and frame layout contract
//!
//! Field offsets of the heap objects that inlined fast paths poke at, and
//! the fixed slots of a compiled-code stack frame. These values are shared
//! with the heap and the stack walker; changing one here without the
//! corresponding runtime change breaks generated code silently, so keep
//! this file boring.
//!
//! All offsets are byte offsets from the start of the object (before the
//! heap tag is subtracted; use `operand::field` for accesses).

pub const POINTER_SIZE: i32 = 4;

// HeapObject
pub const HEAP_OBJECT_MAP_OFFSET: i32 = 0;

// Map
pub const MAP_INSTANCE_TYPE_OFFSET: i32 = 8;
pub const MAP_BIT_FIELD_OFFSET: i32 = 9;
pub const MAP_PROTOTYPE_OFFSET: i32 = 16;
pub const MAP_INSTANCE_DESCRIPTORS_OFFSET: i32 = 20;

/// Bit in the map bit field marking undetectable objects (they answer
/// `undefined` to `typeof`).
pub const MAP_UNDETECTABLE_MASK: i32 = 1 << 2;

// Instance types. String types sit below FIRST_NONSTRING_TYPE.
pub const FIRST_NONSTRING_TYPE: i32 = 0x80;
pub const ODDBALL_TYPE: i32 = 0x83;
pub const JS_FUNCTION_TYPE: i32 = 0xa2;
pub const JS_ARRAY_TYPE: i32 = 0xa4;
pub const FIRST_JS_OBJECT_TYPE: i32 = 0xa3;
pub const LAST_JS_OBJECT_TYPE: i32 = 0xaf;

// FixedArray
pub const FIXED_ARRAY_LENGTH_OFFSET: i32 = 4;
pub const FIXED_ARRAY_HEADER_SIZE: i32 = 8;

// DescriptorArray (reached from a map; carries the enum cache)
pub const DESCRIPTORS_ENUM_CACHE_OFFSET: i32 = 8;
pub const ENUM_CACHE_BRIDGE_CACHE_OFFSET: i32 = 12;

// JSObject
pub const JS_OBJECT_PROPERTIES_OFFSET: i32 = 4;
pub const JS_OBJECT_ELEMENTS_OFFSET: i32 = 8;
pub const JS_OBJECT_HEADER_SIZE: i32 = 12;

// JSArray
pub const JS_ARRAY_LENGTH_OFFSET: i32 = 12;

// JSFunction
pub const JS_FUNCTION_CONTEXT_OFFSET: i32 = 12;
pub const JS_FUNCTION_LITERALS_OFFSET: i32 = 20;

// HeapNumber. The double is stored little-endian: mantissa low word
// first, then the word holding sign, exponent and the top mantissa bits.
pub const HEAP_NUMBER_VALUE_OFFSET: i32 = 4;
pub const HEAP_NUMBER_MANTISSA_OFFSET: i32 = HEAP_NUMBER_VALUE_OFFSET;
pub const HEAP_NUMBER_EXPONENT_OFFSET: i32 = HEAP_NUMBER_VALUE_OFFSET + POINTER_SIZE;
pub const HEAP_NUMBER_EXPONENT_SHIFT: u8 = 20;
pub const HEAP_NUMBER_EXPONENT_MASK: i32 = 0x7ff;
pub const HEAP_NUMBER_EXPONENT_BIAS: i32 = 1023;

// GlobalObject
pub const GLOBAL_OBJECT_RECEIVER_OFFSET: i32 = 12;

// Contexts are fixed arrays with a fixed slot assignment.
pub const CONTEXT_CLOSURE_INDEX: i32 = 0;
pub const CONTEXT_PREVIOUS_INDEX: i32 = 1;
pub const CONTEXT_EXTENSION_INDEX: i32 = 2;
pub const CONTEXT_GLOBAL_INDEX: i32 = 3;
pub const CONTEXT_FIRST_SLOT_INDEX: i32 = 4;

/// Byte offset of context slot `index`.
pub fn context_slot_offset(index: i32) -> i32 {
    FIXED_ARRAY_HEADER_SIZE + index * POINTER_SIZE
}

// Compiled-code frame: fp points at the saved caller fp; the return
// address sits above it, the context and function below, then locals.
pub const FRAME_CALLER_FP_OFFSET: i32 = 0;
pub const FRAME_RETURN_ADDR_OFFSET: i32 = 4;
pub const FRAME_CONTEXT_OFFSET: i32 = -4;
pub const FRAME_FUNCTION_OFFSET: i32 = -8;
pub const FRAME_FIRST_LOCAL_OFFSET: i32 = -12;

/// Fixed slots between fp and the first local (context + function).
pub const FRAME_FIXED_SLOTS: usize = 2;

// Try-handler records pushed on the stack by PushTryHandler.
pub const STACK_HANDLER_NEXT_OFFSET: i32 = 0;
pub const STACK_HANDLER_SIZE_WORDS: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_slot_offsets() {
        assert_eq!(context_slot_offset(0), FIXED_ARRAY_HEADER_SIZE);
        assert_eq!(
            context_slot_offset(CONTEXT_FIRST_SLOT_INDEX),
            FIXED_ARRAY_HEADER_SIZE + 4 * POINTER_SIZE
        );
    }

    #[test]
    fn test_frame_slots_contiguous() {
        assert_eq!(
            FRAME_FIRST_LOCAL_OFFSET,
            FRAME_FUNCTION_OFFSET - POINTER_SIZE
        );
        assert_eq!(FRAME_FIXED_SLOTS, 2);
    }
}
