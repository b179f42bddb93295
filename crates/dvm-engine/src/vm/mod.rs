//! Register virtual machine
//!
//! Routines are flat instruction arrays over a typed register file. The
//! interpreter executes a routine's published code image; the JIT swaps in
//! images whose call markers dispatch into native code.

pub mod dataflow;
pub mod error;
pub mod instruction;
pub mod interpreter;
pub mod object;
pub mod opcode;
pub mod ops;
pub mod range;
pub mod routine;
pub mod types;
pub mod value;

pub use dataflow::{DataflowAnalysis, Def, DefUseFacts, RegSet};
pub use error::{ErrorCode, RoutineError, VmError, MAX_PACKED_INDEX};
pub use instruction::{disassemble, Instruction};
pub use interpreter::{CompileHook, Interpreter};
pub use object::{ArrayObj, InstanceObj, ListObj, ObjectHeader, StringObj, TupleObj};
pub use opcode::{Layout, Opcode};
pub use ops::{seed_random, MathFn};
pub use range::IndexRange;
pub use routine::{CallData, CodeImage, CompiledSegment, Frame, JitState, Namespace, OuterView, Routine, SegmentFn};
pub use types::{ElementKind, ScalarKind, ValueType};
pub use value::{Complex, Value, ValueTag, ANY_TAG};
