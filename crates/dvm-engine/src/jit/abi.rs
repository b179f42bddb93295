//! Memory layout descriptors for Cranelift IR generation
//!
//! Compiled code reaches into interpreter memory (value slots, heap objects,
//! the call data block) through the offsets named here. Every offset is
//! computed from the `#[repr(C)]` definitions in `crate::vm`, so a layout
//! change there is picked up here without edits.

use std::mem::offset_of;

use cranelift_codegen::ir::{self, types, InstBuilder, MemFlags};
use cranelift_frontend::FunctionBuilder;

use crate::vm::{ArrayObj, CallData, InstanceObj, ListObj, OuterView, ScalarKind, StringObj, TupleObj, Value};

/// Pointer type of every supported target
pub const PTR: ir::Type = types::I64;

/// Width of one value slot in bytes
pub const SLOT_SIZE: i64 = Value::SIZE as i64;

/// Width of one enclosing-frame view in bytes
pub const OUTER_VIEW_SIZE: i32 = std::mem::size_of::<OuterView>() as i32;

/// A field compiled code loads or stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiField {
    // Value slot
    ValueTag,
    ValuePayload,
    ValuePayloadHi,

    // Strings
    StringLen,
    StringData,

    // Arrays
    ArraySize,
    ArrayData,
    ArrayNdim,
    ArrayDims,
    ArrayOriginal,

    // Lists, tuples, instances
    ListLen,
    ListItems,
    TupleLen,
    TupleItems,
    InstanceFieldCount,
    InstanceFields,

    // Enclosing frames
    OuterRegisters,
    OuterLen,

    // Call data
    CallLocals,
    CallConstants,
    CallObjectFields,
    CallClassStatics,
    CallGlobals,
    CallOuterFrames,
    CallObjectFieldCount,
    CallStaticsLen,
    CallGlobalsLen,
    CallOuterCount,
    CallExitIndex,
}

impl AbiField {
    /// Byte offset from the start of the owning structure
    pub fn offset(self) -> i32 {
        let offset = match self {
            AbiField::ValueTag => Value::TAG_OFFSET,
            AbiField::ValuePayload => Value::PAYLOAD_OFFSET,
            AbiField::ValuePayloadHi => Value::PAYLOAD_HI_OFFSET,
            AbiField::StringLen => offset_of!(StringObj, len),
            AbiField::StringData => offset_of!(StringObj, data),
            AbiField::ArraySize => offset_of!(ArrayObj, size),
            AbiField::ArrayData => offset_of!(ArrayObj, data),
            AbiField::ArrayNdim => offset_of!(ArrayObj, ndim),
            AbiField::ArrayDims => offset_of!(ArrayObj, dims),
            AbiField::ArrayOriginal => offset_of!(ArrayObj, original),
            AbiField::ListLen => offset_of!(ListObj, len),
            AbiField::ListItems => offset_of!(ListObj, items),
            AbiField::TupleLen => offset_of!(TupleObj, len),
            AbiField::TupleItems => offset_of!(TupleObj, items),
            AbiField::InstanceFieldCount => offset_of!(InstanceObj, nfields),
            AbiField::InstanceFields => offset_of!(InstanceObj, fields),
            AbiField::OuterRegisters => offset_of!(OuterView, registers),
            AbiField::OuterLen => offset_of!(OuterView, len),
            AbiField::CallLocals => offset_of!(CallData, locals),
            AbiField::CallConstants => offset_of!(CallData, constants),
            AbiField::CallObjectFields => offset_of!(CallData, object_fields),
            AbiField::CallClassStatics => offset_of!(CallData, class_statics),
            AbiField::CallGlobals => offset_of!(CallData, globals),
            AbiField::CallOuterFrames => offset_of!(CallData, outer_frames),
            AbiField::CallObjectFieldCount => offset_of!(CallData, object_field_count),
            AbiField::CallStaticsLen => offset_of!(CallData, statics_len),
            AbiField::CallGlobalsLen => offset_of!(CallData, globals_len),
            AbiField::CallOuterCount => offset_of!(CallData, outer_count),
            AbiField::CallExitIndex => offset_of!(CallData, exit_index),
        };
        offset as i32
    }

    /// IR type of the field
    pub fn ty(self) -> ir::Type {
        match self {
            AbiField::ValueTag => types::I32,
            // Payload words are read raw; callers pick the scalar view
            AbiField::ValuePayload | AbiField::ValuePayloadHi => types::I64,
            AbiField::StringLen
            | AbiField::ArraySize
            | AbiField::ArrayNdim
            | AbiField::ListLen
            | AbiField::TupleLen
            | AbiField::InstanceFieldCount
            | AbiField::OuterLen
            | AbiField::CallObjectFieldCount
            | AbiField::CallStaticsLen
            | AbiField::CallGlobalsLen
            | AbiField::CallOuterCount
            | AbiField::CallExitIndex => types::I64,
            _ => PTR,
        }
    }
}

/// Flags for every access compiled code makes: addresses are always
/// checked before use and fields are naturally aligned
pub fn flags() -> MemFlags {
    MemFlags::trusted()
}

/// Load `field` from the structure at `base`
pub fn load(builder: &mut FunctionBuilder<'_>, field: AbiField, base: ir::Value) -> ir::Value {
    builder.ins().load(field.ty(), flags(), base, field.offset())
}

/// Store `value` into `field` of the structure at `base`
pub fn store(builder: &mut FunctionBuilder<'_>, field: AbiField, base: ir::Value, value: ir::Value) {
    builder.ins().store(flags(), value, base, field.offset());
}

/// Address of slot `index` in a value array
pub fn slot_addr(builder: &mut FunctionBuilder<'_>, base: ir::Value, index: i64) -> ir::Value {
    builder.ins().iadd_imm(base, index * SLOT_SIZE)
}

/// Address of slot `index` in a value array, for a dynamic index
pub fn dynamic_slot_addr(builder: &mut FunctionBuilder<'_>, base: ir::Value, index: ir::Value) -> ir::Value {
    let offset = builder.ins().imul_imm(index, SLOT_SIZE);
    builder.ins().iadd(base, offset)
}

/// A scalar register value in IR form
///
/// Bools and ints are `I64` payload words, floats are `F64`, and a complex
/// number is a pair of `F64` lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Word(ir::Value),
    Pair(ir::Value, ir::Value),
}

impl Scalar {
    /// The single-lane value (the real lane of a pair)
    pub fn word(self) -> ir::Value {
        match self {
            Scalar::Word(v) => v,
            Scalar::Pair(re, _) => re,
        }
    }

    /// Both lanes of a complex value
    pub fn pair(self) -> (ir::Value, ir::Value) {
        match self {
            Scalar::Pair(re, im) => (re, im),
            Scalar::Word(v) => (v, v),
        }
    }
}

/// IR type of each lane of a scalar kind
pub fn lane_type(kind: ScalarKind) -> ir::Type {
    match kind {
        ScalarKind::Bool | ScalarKind::Int => types::I64,
        ScalarKind::Float | ScalarKind::Complex => types::F64,
    }
}

/// Load the payload of the value at `addr` (plus a fixed `offset`) as `kind`
pub fn load_scalar(builder: &mut FunctionBuilder<'_>, kind: ScalarKind, addr: ir::Value, offset: i32) -> Scalar {
    let ty = lane_type(kind);
    let lo = builder.ins().load(ty, flags(), addr, offset + AbiField::ValuePayload.offset());
    if kind == ScalarKind::Complex {
        let hi = builder.ins().load(ty, flags(), addr, offset + AbiField::ValuePayloadHi.offset());
        Scalar::Pair(lo, hi)
    } else {
        Scalar::Word(lo)
    }
}

/// Store a tagged scalar into the value slot at `addr`
pub fn store_scalar(builder: &mut FunctionBuilder<'_>, addr: ir::Value, tag: u32, value: Scalar) {
    let tag = builder.ins().iconst(types::I32, tag as i64);
    store(builder, AbiField::ValueTag, addr, tag);
    store_payload(builder, addr, 0, value);
}

/// Store raw payload lanes at `addr + offset` without touching a tag
pub fn store_payload(builder: &mut FunctionBuilder<'_>, addr: ir::Value, offset: i32, value: Scalar) {
    match value {
        Scalar::Word(v) => {
            builder.ins().store(flags(), v, addr, offset + AbiField::ValuePayload.offset());
        }
        Scalar::Pair(re, im) => {
            builder.ins().store(flags(), re, addr, offset + AbiField::ValuePayload.offset());
            builder.ins().store(flags(), im, addr, offset + AbiField::ValuePayloadHi.offset());
        }
    }
}

/// Load the element lanes of a numeric array at `addr` as `kind`
///
/// Array elements are packed payload words with no tag.
pub fn load_element(builder: &mut FunctionBuilder<'_>, kind: ScalarKind, addr: ir::Value) -> Scalar {
    let ty = lane_type(kind);
    let lo = builder.ins().load(ty, flags(), addr, 0);
    if kind == ScalarKind::Complex {
        let hi = builder.ins().load(ty, flags(), addr, 8);
        Scalar::Pair(lo, hi)
    } else {
        Scalar::Word(lo)
    }
}

/// Store element lanes of a numeric array at `addr`
pub fn store_element(builder: &mut FunctionBuilder<'_>, addr: ir::Value, value: Scalar) {
    match value {
        Scalar::Word(v) => {
            builder.ins().store(flags(), v, addr, 0);
        }
        Scalar::Pair(re, im) => {
            builder.ins().store(flags(), re, addr, 0);
            builder.ins().store(flags(), im, addr, 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_slot_layout() {
        assert_eq!(AbiField::ValueTag.offset(), 0);
        assert_eq!(AbiField::ValuePayload.offset(), 8);
        assert_eq!(AbiField::ValuePayloadHi.offset(), 16);
        assert_eq!(SLOT_SIZE, 24);
    }

    #[test]
    fn test_call_data_layout() {
        // Pointers first, then lengths, exit index last
        let order = [
            AbiField::CallLocals,
            AbiField::CallConstants,
            AbiField::CallObjectFields,
            AbiField::CallClassStatics,
            AbiField::CallGlobals,
            AbiField::CallOuterFrames,
            AbiField::CallObjectFieldCount,
            AbiField::CallStaticsLen,
            AbiField::CallGlobalsLen,
            AbiField::CallOuterCount,
            AbiField::CallExitIndex,
        ];
        for (i, field) in order.iter().enumerate() {
            assert_eq!(field.offset(), (i * 8) as i32, "{:?}", field);
        }
    }

    #[test]
    fn test_outer_view_layout() {
        assert_eq!(AbiField::OuterRegisters.offset(), 0);
        assert_eq!(AbiField::OuterLen.offset(), 8);
        assert_eq!(OUTER_VIEW_SIZE, 16);
    }

    #[test]
    fn test_field_types() {
        assert_eq!(AbiField::ValueTag.ty(), types::I32);
        assert_eq!(AbiField::ArrayData.ty(), PTR);
        assert_eq!(AbiField::ListLen.ty(), types::I64);
    }
}
