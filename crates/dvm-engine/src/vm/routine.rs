//! Routines, execution frames, and the published code image
//!
//! A [`Routine`] owns its original instruction array forever. What the
//! interpreter actually executes is the routine's current [`CodeImage`]: the
//! original instructions, or a patched copy in which the first instruction of
//! every compiled segment is replaced by a `JitCall` marker, together with
//! the segment table those markers index. Images are immutable and swapped
//! atomically, so a reader sees either the old image or the complete new one.

use std::any::Any;
use std::ptr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::vm::error::RoutineError;
use crate::vm::instruction::Instruction;
use crate::vm::opcode::{Layout, Opcode};
use crate::vm::types::ValueType;
use crate::vm::value::Value;

/// Native entry point of a compiled segment.
///
/// Returns 0 on success, or `(error_code << 16) | instruction_index`.
pub type SegmentFn = unsafe extern "C" fn(*mut CallData) -> i32;

/// Register file of one enclosing frame, as compiled code sees it
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OuterView {
    pub registers: *mut Value,
    pub len: i64,
}

/// View of the interpreter state handed to compiled code
///
/// Every pointer addresses an array of [`Value`] slots owned by the
/// interpreter for the duration of one call. Compiled code never allocates
/// or frees these arrays, and bounds-checks every constant slot index
/// against the lengths recorded here.
#[repr(C)]
#[derive(Debug)]
pub struct CallData {
    /// The frame's register file
    pub locals: *mut Value,
    /// The routine's constant pool
    pub constants: *const Value,
    /// Field slots of the receiver instance, or null
    pub object_fields: *mut Value,
    /// Class static slots
    pub class_statics: *mut Value,
    /// Global slots
    pub globals: *mut Value,
    /// Enclosing frames, innermost first
    pub outer_frames: *const OuterView,
    /// Field count of the receiver, 0 without one
    pub object_field_count: i64,
    pub statics_len: i64,
    pub globals_len: i64,
    pub outer_count: i64,
    /// Set by compiled code to ask the interpreter to execute the original
    /// instruction at this index next; -1 means "advance past the segment"
    pub exit_index: i64,
}

impl CallData {
    /// No exit requested
    pub const NO_EXIT: i64 = -1;

    /// Build a view over a frame, its routine's constants, and a namespace.
    ///
    /// `outer` receives the enclosing frames' register views and must
    /// outlive the returned view.
    pub fn new(
        frame: &mut Frame,
        constants: &[Value],
        namespace: &mut Namespace,
        outer: &mut Vec<OuterView>,
    ) -> CallData {
        outer.clear();
        outer.extend(frame.outer.iter_mut().map(|f| OuterView {
            registers: f.as_mut_ptr(),
            len: f.len() as i64,
        }));
        let receiver = frame.receiver.instance_obj();
        let (object_fields, object_field_count) = if receiver.is_null() {
            (ptr::null_mut(), 0)
        } else {
            // SAFETY: the frame holds a reference to the receiver
            unsafe { ((*receiver).fields, (*receiver).nfields) }
        };
        CallData {
            locals: frame.registers.as_mut_ptr(),
            constants: constants.as_ptr(),
            object_fields,
            class_statics: namespace.statics.as_mut_ptr(),
            globals: namespace.globals.as_mut_ptr(),
            outer_frames: outer.as_ptr(),
            object_field_count,
            statics_len: namespace.statics.len() as i64,
            globals_len: namespace.globals.len() as i64,
            outer_count: outer.len() as i64,
            exit_index: CallData::NO_EXIT,
        }
    }
}

/// A compiled run of instructions installed in a code image
#[derive(Debug, Clone, Copy)]
pub struct CompiledSegment {
    /// First original instruction covered
    pub start: usize,
    /// Number of original instructions covered
    pub length: usize,
    pub native_fn: SegmentFn,
    /// The instruction the call marker replaced
    pub original: Instruction,
}

/// Immutable instruction stream plus compiled-segment table
pub struct CodeImage {
    instructions: Arc<[Instruction]>,
    segments: Vec<CompiledSegment>,
    // Keeps the machine code behind `segments` alive
    _code: Option<Box<dyn Any + Send + Sync>>,
}

impl CodeImage {
    /// Image executing the given instructions with no compiled code
    pub fn interpreted(instructions: Arc<[Instruction]>) -> Self {
        CodeImage {
            instructions,
            segments: Vec::new(),
            _code: None,
        }
    }

    /// Image whose markers dispatch into `segments`, with `code` owning
    /// the machine code the segment entry points live in
    pub fn compiled(
        instructions: Arc<[Instruction]>,
        segments: Vec<CompiledSegment>,
        code: Box<dyn Any + Send + Sync>,
    ) -> Self {
        CodeImage {
            instructions,
            segments,
            _code: Some(code),
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn segments(&self) -> &[CompiledSegment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&CompiledSegment> {
        self.segments.get(index)
    }

    pub fn is_compiled(&self) -> bool {
        !self.segments.is_empty()
    }
}

/// Per-routine JIT lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitState {
    /// Never looked at by the JIT
    Unanalyzed,
    /// Segments found, code generation in progress
    Segmented,
    /// At least one segment installed
    Installed,
    /// Terminal: nothing compiled, or compiled code discarded
    Interpreted,
}

/// A routine: instructions, register types, constants, and its code image
pub struct Routine {
    name: String,
    instructions: Arc<[Instruction]>,
    types: Vec<ValueType>,
    constants: Vec<Value>,
    image: RwLock<Arc<CodeImage>>,
    state: Mutex<JitState>,
}

impl Routine {
    /// Create a routine, validating every operand against the register
    /// count (`types.len()`), the constant pool, and the instruction count.
    pub fn new(
        name: impl Into<String>,
        instructions: Vec<Instruction>,
        types: Vec<ValueType>,
        constants: Vec<Value>,
    ) -> Result<Self, RoutineError> {
        validate(&instructions, types.len(), constants.len())?;
        let instructions: Arc<[Instruction]> = instructions.into();
        Ok(Routine {
            name: name.into(),
            image: RwLock::new(Arc::new(CodeImage::interpreted(instructions.clone()))),
            instructions,
            types,
            constants,
            state: Mutex::new(JitState::Unanalyzed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The original, never patched, instructions
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub(crate) fn shared_instructions(&self) -> Arc<[Instruction]> {
        self.instructions.clone()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn types(&self) -> &[ValueType] {
        &self.types
    }

    /// Static type of a register
    pub fn reg_type(&self, reg: u16) -> &ValueType {
        &self.types[reg as usize]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn register_count(&self) -> usize {
        self.types.len()
    }

    /// Snapshot of the currently published code image
    pub fn image(&self) -> Arc<CodeImage> {
        self.image.read().clone()
    }

    /// Atomically replace the published code image
    pub(crate) fn publish(&self, image: CodeImage) {
        *self.image.write() = Arc::new(image);
    }

    pub fn jit_state(&self) -> JitState {
        *self.state.lock()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, JitState> {
        self.state.lock()
    }

    /// Drop all compiled code and go back to the original instructions.
    ///
    /// The machine code is released once no in-flight call still holds the
    /// old image. The routine is never compiled again.
    pub fn discard_native_code(&self) {
        let mut state = self.state.lock();
        if *state == JitState::Installed {
            self.publish(CodeImage::interpreted(self.instructions.clone()));
        }
        *state = JitState::Interpreted;
    }

    /// Fresh frame with every register set to its type's default
    pub fn new_frame(&self) -> Frame {
        Frame::new(&self.types)
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("name", &self.name)
            .field("instructions", &self.instructions.len())
            .field("registers", &self.types.len())
            .field("state", &self.jit_state())
            .finish()
    }
}

fn validate(code: &[Instruction], nregs: usize, nconsts: usize) -> Result<(), RoutineError> {
    let n = code.len();
    let reg = |index: usize, r: i64| {
        if r < 0 || r as usize >= nregs {
            Err(RoutineError::RegisterOutOfRange { index, reg: r })
        } else {
            Ok(())
        }
    };
    let target = |index: usize, t: i32| {
        if t < 0 || t as usize > n {
            Err(RoutineError::TargetOutOfRange { index, target: t as i64 })
        } else {
            Ok(())
        }
    };
    let constant = |index: usize, k: i32| {
        if k < 0 || k as usize >= nconsts {
            Err(RoutineError::ConstantOutOfRange { index, constant: k as i64 })
        } else {
            Ok(())
        }
    };

    let mut cases_left = 0usize;
    for (i, ins) in code.iter().enumerate() {
        let (a, b, c) = (ins.a as i64, ins.b as i64, ins.c as i64);
        if ins.opcode == Opcode::Case {
            if cases_left == 0 {
                return Err(RoutineError::StrayCase(i));
            }
            cases_left -= 1;
        } else if cases_left > 0 {
            return Err(RoutineError::MalformedSwitch(i));
        }
        match ins.opcode.layout() {
            Layout::Empty => {
                if ins.opcode == Opcode::JitCall {
                    return Err(RoutineError::Reserved { index: i, opcode: ins.opcode });
                }
                if ins.opcode == Opcode::Goto {
                    target(i, ins.b)?;
                }
            }
            Layout::LoadC => {
                reg(i, c)?;
                if matches!(
                    ins.opcode,
                    Opcode::GetConst
                        | Opcode::GetConstB
                        | Opcode::GetConstI
                        | Opcode::GetConstF
                        | Opcode::GetConstC
                        | Opcode::GetConstS
                ) {
                    constant(i, ins.b)?;
                }
            }
            Layout::UnaryAC | Layout::StaticGet => {
                reg(i, a)?;
                reg(i, c)?;
            }
            Layout::UnaryBC => {
                reg(i, b)?;
                reg(i, c)?;
            }
            Layout::BinaryABC | Layout::IndexSet | Layout::IndexUpdate => {
                reg(i, a)?;
                reg(i, b)?;
                reg(i, c)?;
            }
            Layout::StaticSet => {
                reg(i, a)?;
                reg(i, c)?;
            }
            Layout::MultiGet => {
                reg(i, a)?;
                reg(i, a + b)?;
                reg(i, c)?;
            }
            Layout::MultiSet => {
                reg(i, a)?;
                reg(i, c)?;
                reg(i, c + b)?;
            }
            Layout::ReadA | Layout::StoreA | Layout::TestA => {
                reg(i, a)?;
                if ins.opcode.is_test() {
                    target(i, ins.b)?;
                }
            }
            Layout::Switch => {
                reg(i, a)?;
                target(i, ins.b)?;
                if ins.c < 0 || i + ins.c as usize >= n {
                    return Err(RoutineError::MalformedSwitch(i));
                }
                cases_left = ins.c as usize;
            }
            Layout::Case => {
                constant(i, ins.a)?;
                target(i, ins.b)?;
            }
            Layout::Return => {
                if ins.b != 0 {
                    reg(i, a)?;
                }
            }
        }
    }
    Ok(())
}

/// Interpreter state for one activation of a routine
#[derive(Debug, Clone)]
pub struct Frame {
    pub registers: Vec<Value>,
    /// Instance whose fields `GetVarO*`/`SetVarO*` address (none if absent)
    pub receiver: Value,
    /// Register files of enclosing activations, innermost first
    pub outer: Vec<Vec<Value>>,
}

impl Frame {
    pub fn new(types: &[ValueType]) -> Self {
        Frame {
            registers: types.iter().map(Value::default_for).collect(),
            receiver: Value::none(),
            outer: Vec::new(),
        }
    }

    pub fn with_receiver(mut self, receiver: Value) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn with_outer(mut self, outer: Vec<Vec<Value>>) -> Self {
        self.outer = outer;
        self
    }
}

/// Class statics and globals visible to a routine
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub statics: Vec<Value>,
    pub globals: Vec<Value>,
}

impl Namespace {
    pub fn new(statics: Vec<Value>, globals: Vec<Value>) -> Self {
        Namespace { statics, globals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::error::RoutineError;

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    #[test]
    fn test_valid_routine() {
        let routine = Routine::new(
            "add",
            vec![ins(Opcode::AddIII, 0, 1, 2), ins(Opcode::Return, 2, 1, 0)],
            vec![ValueType::Int; 3],
            vec![],
        )
        .unwrap();
        assert_eq!(routine.len(), 2);
        assert_eq!(routine.register_count(), 3);
        assert_eq!(routine.jit_state(), JitState::Unanalyzed);
        assert!(!routine.image().is_compiled());
    }

    #[test]
    fn test_register_out_of_range() {
        let err = Routine::new("bad", vec![ins(Opcode::MoveII, 0, 3, 3)], vec![ValueType::Int; 2], vec![])
            .unwrap_err();
        assert_eq!(err, RoutineError::RegisterOutOfRange { index: 0, reg: 3 });
    }

    #[test]
    fn test_target_out_of_range() {
        let err = Routine::new("bad", vec![ins(Opcode::Goto, 0, 2, 0)], vec![], vec![]).unwrap_err();
        assert_eq!(err, RoutineError::TargetOutOfRange { index: 0, target: 2 });
        // Jumping to the end of the routine is allowed
        assert!(Routine::new("ok", vec![ins(Opcode::Goto, 0, 1, 0)], vec![], vec![]).is_ok());
    }

    #[test]
    fn test_switch_groups() {
        let types = vec![ValueType::Int];
        let consts = vec![Value::int(1)];
        let stray = Routine::new("stray", vec![ins(Opcode::Case, 0, 0, 0)], types.clone(), consts.clone());
        assert_eq!(stray.unwrap_err(), RoutineError::StrayCase(0));
        let short = Routine::new(
            "short",
            vec![ins(Opcode::Switch, 0, 2, 2), ins(Opcode::Case, 0, 2, 0), ins(Opcode::Nop, 0, 0, 0)],
            types.clone(),
            consts.clone(),
        );
        assert_eq!(short.unwrap_err(), RoutineError::MalformedSwitch(2));
        let ok = Routine::new(
            "ok",
            vec![ins(Opcode::Switch, 0, 2, 1), ins(Opcode::Case, 0, 2, 0)],
            types,
            consts,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_reserved_marker() {
        let err = Routine::new("bad", vec![ins(Opcode::JitCall, 0, 1, 0)], vec![], vec![]).unwrap_err();
        assert!(matches!(err, RoutineError::Reserved { index: 0, .. }));
    }

    #[test]
    fn test_frame_defaults() {
        let frame = Frame::new(&[ValueType::Float, ValueType::String, ValueType::Array(crate::vm::types::ElementKind::Int)]);
        assert_eq!(frame.registers[0], Value::float(0.0));
        assert_eq!(frame.registers[1], Value::string(""));
        assert!(frame.registers[2].is_none());
    }

    #[test]
    fn test_discard_is_terminal() {
        let routine = Routine::new("r", vec![ins(Opcode::Nop, 0, 0, 0)], vec![], vec![]).unwrap();
        routine.discard_native_code();
        assert_eq!(routine.jit_state(), JitState::Interpreted);
    }
}
