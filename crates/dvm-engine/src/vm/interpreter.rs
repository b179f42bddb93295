//! Reference interpreter
//!
//! Executes a routine's published code image one instruction at a time. A
//! `JitCall` marker hands the frame to a compiled segment through
//! [`CallData`]; when the segment asks for an exit instruction, that
//! instruction is executed from the routine's original array before
//! dispatch continues.
//!
//! Typed scalar results are stored with the tag of the destination
//! register's static type, which is exactly what compiled code stores.

use crate::vm::error::{ErrorCode, VmError};
use crate::vm::instruction::Instruction;
use crate::vm::opcode::Opcode;
use crate::vm::ops::{self, MathFn};
use crate::vm::routine::{CallData, CodeImage, Frame, JitState, Namespace, Routine};
use crate::vm::types::{ElementKind, ValueType};
use crate::vm::value::{Complex, Value, ValueTag, ANY_TAG};

/// Called before the first execution of a routine that was never analyzed
pub trait CompileHook: Send + Sync {
    fn first_call(&self, routine: &Routine);
}

/// Where control goes after one dispatch step
#[derive(Debug)]
enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

/// Register file view that stores typed results with the register's tag
struct Regs<'a> {
    values: &'a mut [Value],
    types: &'a [ValueType],
}

impl Regs<'_> {
    fn get(&self, r: i32) -> &Value {
        &self.values[r as usize]
    }

    fn int(&self, r: i32) -> i64 {
        self.get(r).words()[0] as i64
    }

    fn float(&self, r: i32) -> f64 {
        f64::from_bits(self.get(r).words()[0])
    }

    fn boolean(&self, r: i32) -> bool {
        self.get(r).words()[0] != 0
    }

    fn complex(&self, r: i32) -> Complex {
        let [re, im] = self.get(r).words();
        Complex::new(f64::from_bits(re), f64::from_bits(im))
    }

    fn set(&mut self, r: i32, value: Value) {
        self.values[r as usize] = value;
    }

    fn set_int(&mut self, r: i32, v: i64) {
        let value = match self.types[r as usize] {
            ValueType::Enum => Value::enumeration(v),
            _ => Value::int(v),
        };
        self.set(r, value);
    }

    fn set_float(&mut self, r: i32, v: f64) {
        self.set(r, Value::float(v));
    }

    fn set_bool(&mut self, r: i32, v: bool) {
        self.set(r, Value::bool(v));
    }

    fn set_complex(&mut self, r: i32, v: Complex) {
        self.set(r, Value::complex(v));
    }

    /// Store raw payload words as the scalar kind of `op`'s suffix
    fn set_words(&mut self, r: i32, suffix: Suffix, words: [u64; 2]) {
        match suffix {
            Suffix::B => self.set_bool(r, words[0] != 0),
            Suffix::I => self.set_int(r, words[0] as i64),
            Suffix::F => self.set_float(r, f64::from_bits(words[0])),
            Suffix::C => self.set_complex(r, Complex::new(f64::from_bits(words[0]), f64::from_bits(words[1]))),
        }
    }

    fn indices(&self, base: i32, count: i32) -> Vec<i64> {
        (1..=count).map(|k| self.int(base + k)).collect()
    }
}

/// Scalar suffix of a storage-class or container opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suffix {
    B,
    I,
    F,
    C,
}

impl Suffix {
    /// Suffix of an opcode whose family is laid out B, I, F, C
    fn of_family(op: Opcode, first: Opcode) -> Suffix {
        match op.to_u16().wrapping_sub(first.to_u16()) % 4 {
            0 => Suffix::B,
            1 => Suffix::I,
            2 => Suffix::F,
            _ => Suffix::C,
        }
    }

    /// Suffix of an opcode whose family is laid out I, F, C
    fn of_numeric(op: Opcode, first: Opcode) -> Suffix {
        match op.to_u16().wrapping_sub(first.to_u16()) % 3 {
            0 => Suffix::I,
            1 => Suffix::F,
            _ => Suffix::C,
        }
    }

    fn element(self) -> ElementKind {
        match self {
            Suffix::F => ElementKind::Float,
            Suffix::C => ElementKind::Complex,
            _ => ElementKind::Int,
        }
    }
}

/// The dispatch loop plus the state one program run shares across routines
pub struct Interpreter<'h> {
    namespace: Namespace,
    output: String,
    hook: Option<&'h dyn CompileHook>,
}

impl<'h> Interpreter<'h> {
    pub fn new(namespace: Namespace) -> Self {
        Interpreter {
            namespace,
            output: String::new(),
            hook: None,
        }
    }

    /// Compile routines through `hook` the first time they run
    pub fn with_hook(mut self, hook: &'h dyn CompileHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    /// Everything `Print` produced so far
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Run a routine in a fresh frame
    pub fn run(&mut self, routine: &Routine) -> Result<Value, VmError> {
        let mut frame = routine.new_frame();
        self.run_frame(routine, &mut frame)
    }

    /// Run a routine in a caller-provided frame, returning the value of the
    /// `Return` that ended it (none for a plain return or running off the end)
    pub fn run_frame(&mut self, routine: &Routine, frame: &mut Frame) -> Result<Value, VmError> {
        if let Some(hook) = self.hook {
            if routine.jit_state() == JitState::Unanalyzed {
                hook.first_call(routine);
            }
        }

        let image = routine.image();
        let code = image.instructions();
        let mut pc = 0;
        while pc < code.len() {
            let ins = code[pc];
            let flow = if ins.opcode == Opcode::JitCall {
                self.call_segment(routine, &image, frame, pc, &ins)?
            } else {
                self.step(routine, frame, pc, &ins)?
            };
            match flow {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Return(value) => return Ok(value),
            }
        }
        Ok(Value::none())
    }

    fn call_segment(
        &mut self,
        routine: &Routine,
        image: &CodeImage,
        frame: &mut Frame,
        pc: usize,
        marker: &Instruction,
    ) -> Result<Flow, VmError> {
        let segment = image
            .segment(marker.a as usize)
            .ok_or(VmError::MissingSegment(marker.a as usize))?;
        debug_assert_eq!(segment.start, pc);

        let mut outer = Vec::with_capacity(frame.outer.len());
        let mut data = CallData::new(frame, routine.constants(), &mut self.namespace, &mut outer);
        // SAFETY: `data` points at this frame's live register file and the
        // routine's constants, and the image keeps the code alive
        let status = unsafe { (segment.native_fn)(&mut data) };
        let exit = data.exit_index;

        if status != 0 {
            let (code, index) = ErrorCode::unpack(status).unwrap_or((ErrorCode::Value, pc));
            return Err(VmError::at(code, index));
        }
        if exit >= 0 {
            let at = exit as usize;
            let original = routine.instructions()[at];
            return Ok(match self.step(routine, frame, at, &original)? {
                Flow::Next => Flow::Jump(at + 1),
                flow => flow,
            });
        }
        Ok(Flow::Jump(pc + segment.length))
    }

    fn step(&mut self, routine: &Routine, frame: &mut Frame, pc: usize, ins: &Instruction) -> Result<Flow, VmError> {
        let err = |code: ErrorCode| VmError::at(code, pc);
        let (a, b, c) = (ins.a, ins.b, ins.c);
        let constants = routine.constants();
        let mut r = Regs {
            values: &mut frame.registers,
            types: routine.types(),
        };
        let op = ins.opcode;

        match op {
            Opcode::Nop => {}
            Opcode::Data => match ValueTag::from_u32(a as u32) {
                Some(ValueTag::None) => r.set(c, Value::none()),
                Some(ValueTag::Bool) => r.set_bool(c, b != 0),
                Some(ValueTag::Int) => r.set_int(c, b as i64),
                Some(ValueTag::Float) => r.set_float(c, b as f64),
                Some(ValueTag::Enum) => r.set(c, Value::enumeration(b as i64)),
                _ => return Err(err(ErrorCode::Value)),
            },
            Opcode::GetConst | Opcode::GetConstS => r.set(c, constants[b as usize].clone()),
            Opcode::GetConstB => r.set_bool(c, constants[b as usize].words()[0] != 0),
            Opcode::GetConstI => r.set_int(c, constants[b as usize].words()[0] as i64),
            Opcode::GetConstF => r.set_float(c, f64::from_bits(constants[b as usize].words()[0])),
            Opcode::GetConstC => {
                let [re, im] = constants[b as usize].words();
                r.set_complex(c, Complex::new(f64::from_bits(re), f64::from_bits(im)));
            }
            Opcode::Move | Opcode::MoveSS => {
                let v = r.get(a).clone();
                r.set(c, v);
            }

            // Typed moves
            Opcode::MoveBB => r.set_bool(c, r.boolean(a)),
            Opcode::MoveII => r.set_int(c, r.int(a)),
            Opcode::MoveFF => r.set_float(c, r.float(a)),
            Opcode::MoveCC => r.set_complex(c, r.complex(a)),
            Opcode::MoveIF => r.set_int(c, r.float(a) as i64),
            Opcode::MoveFI => r.set_float(c, r.int(a) as f64),
            Opcode::MoveIB => r.set_int(c, r.boolean(a) as i64),
            Opcode::MoveBI => r.set_bool(c, r.int(a) != 0),
            Opcode::MoveCI => r.set_complex(c, Complex::new(r.int(a) as f64, 0.0)),
            Opcode::MoveCF => r.set_complex(c, Complex::new(r.float(a), 0.0)),

            // Unary
            Opcode::NotB => r.set_bool(c, !r.boolean(a)),
            Opcode::NotI => r.set_int(c, (r.int(a) == 0) as i64),
            Opcode::NegI => r.set_int(c, r.int(a).wrapping_neg()),
            Opcode::NegF => r.set_float(c, -r.float(a)),
            Opcode::NegC => r.set_complex(c, -r.complex(a)),
            Opcode::BitNotI => r.set_int(c, !r.int(a)),

            // Integer arithmetic
            Opcode::AddIII => r.set_int(c, r.int(a).wrapping_add(r.int(b))),
            Opcode::SubIII => r.set_int(c, r.int(a).wrapping_sub(r.int(b))),
            Opcode::MulIII => r.set_int(c, r.int(a).wrapping_mul(r.int(b))),
            Opcode::DivIII => r.set_int(c, ops::int_div(r.int(a), r.int(b)).map_err(err)?),
            Opcode::ModIII => r.set_int(c, ops::int_rem(r.int(a), r.int(b)).map_err(err)?),
            Opcode::PowIII => r.set_int(c, ops::int_pow(r.int(a), r.int(b))),
            Opcode::BitAndIII => r.set_int(c, r.int(a) & r.int(b)),
            Opcode::BitOrIII => r.set_int(c, r.int(a) | r.int(b)),
            Opcode::BitXorIII => r.set_int(c, r.int(a) ^ r.int(b)),
            Opcode::ShlIII => r.set_int(c, r.int(a).wrapping_shl(r.int(b) as u32)),
            Opcode::ShrIII => r.set_int(c, r.int(a).wrapping_shr(r.int(b) as u32)),
            Opcode::AndBBB => r.set_bool(c, r.boolean(a) && r.boolean(b)),
            Opcode::OrBBB => r.set_bool(c, r.boolean(a) || r.boolean(b)),

            // Float arithmetic
            Opcode::AddFFF => r.set_float(c, r.float(a) + r.float(b)),
            Opcode::SubFFF => r.set_float(c, r.float(a) - r.float(b)),
            Opcode::MulFFF => r.set_float(c, r.float(a) * r.float(b)),
            Opcode::DivFFF => r.set_float(c, r.float(a) / r.float(b)),
            Opcode::ModFFF => r.set_float(c, r.float(a) % r.float(b)),
            Opcode::PowFFF => r.set_float(c, r.float(a).powf(r.float(b))),
            Opcode::MathF => {
                let f = MathFn::from_i32(a).ok_or(err(ErrorCode::Value))?;
                r.set_float(c, f.apply(r.float(b)));
            }

            // Complex arithmetic
            Opcode::AddCCC => r.set_complex(c, r.complex(a) + r.complex(b)),
            Opcode::SubCCC => r.set_complex(c, r.complex(a) - r.complex(b)),
            Opcode::MulCCC => r.set_complex(c, r.complex(a) * r.complex(b)),
            Opcode::DivCCC => r.set_complex(c, r.complex(a) / r.complex(b)),

            // Comparisons
            Opcode::LtBII => r.set_bool(c, r.int(a) < r.int(b)),
            Opcode::LeBII => r.set_bool(c, r.int(a) <= r.int(b)),
            Opcode::EqBII => r.set_bool(c, r.int(a) == r.int(b)),
            Opcode::NeBII => r.set_bool(c, r.int(a) != r.int(b)),
            Opcode::LtBFF => r.set_bool(c, r.float(a) < r.float(b)),
            Opcode::LeBFF => r.set_bool(c, r.float(a) <= r.float(b)),
            Opcode::EqBFF => r.set_bool(c, r.float(a) == r.float(b)),
            Opcode::NeBFF => r.set_bool(c, r.float(a) != r.float(b)),
            Opcode::EqBCC => r.set_bool(c, r.complex(a) == r.complex(b)),
            Opcode::NeBCC => r.set_bool(c, r.complex(a) != r.complex(b)),
            Opcode::LtBSS | Opcode::LeBSS | Opcode::EqBSS | Opcode::NeBSS => {
                let ord = ops::string_compare(r.get(a), r.get(b));
                let result = match op {
                    Opcode::LtBSS => ord.is_lt(),
                    Opcode::LeBSS => ord.is_le(),
                    Opcode::EqBSS => ord.is_eq(),
                    _ => ord.is_ne(),
                };
                r.set_bool(c, result);
            }

            // Generic arithmetic
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let v = ops::generic_arith(op, r.get(a), r.get(b)).map_err(err)?;
                r.set(c, v);
            }
            Opcode::SetIndex => {
                if !r.get(b).is_none() {
                    return Err(err(ErrorCode::Value));
                }
                ops::array_assign(r.get(c), r.get(a)).map_err(err)?;
            }

            // Strings and sizes
            Opcode::AddSSS => {
                let v = ops::string_concat(r.get(a), r.get(b));
                r.set(c, v);
            }
            Opcode::StringGetChar => {
                let ch = ops::string_get_char(r.get(a), r.int(b)).map_err(err)?;
                r.set_int(c, ch);
            }
            Opcode::StringSetChar => {
                let (index, ch) = (r.int(b), r.int(a));
                ops::string_set_char(&mut r.values[c as usize], index, ch).map_err(err)?;
            }
            Opcode::SizeIS | Opcode::SizeIA | Opcode::SizeIL => {
                let expected = match op {
                    Opcode::SizeIS => ValueTag::String,
                    Opcode::SizeIA => ValueTag::Array,
                    _ => ValueTag::List,
                };
                if r.get(a).tag() != expected {
                    return Err(err(ErrorCode::Value));
                }
                let n = ops::size_of(r.get(a)).map_err(err)?;
                r.set_int(c, n);
            }

            // Arrays
            Opcode::ArrayGetI | Opcode::ArrayGetF | Opcode::ArrayGetC => {
                let v = ops::array_get(r.get(a), r.int(b)).map_err(err)?;
                r.set_words(c, Suffix::of_numeric(op, Opcode::ArrayGetI), v.words());
            }
            Opcode::ArraySetI | Opcode::ArraySetF | Opcode::ArraySetC => {
                ops::array_set(r.get(c), r.int(b), r.get(a)).map_err(err)?;
            }
            Opcode::ArrayGetMultiI | Opcode::ArrayGetMultiF | Opcode::ArrayGetMultiC => {
                let indices = r.indices(a, b);
                let v = ops::array_get_multi(r.get(a), &indices).map_err(err)?;
                r.set_words(c, Suffix::of_numeric(op, Opcode::ArrayGetMultiI), v.words());
            }
            Opcode::ArraySetMultiI | Opcode::ArraySetMultiF | Opcode::ArraySetMultiC => {
                let indices = r.indices(c, b);
                ops::array_set_multi(r.get(c), &indices, r.get(a)).map_err(err)?;
            }

            // Lists and tuples
            Opcode::ListGetI | Opcode::ListGetF | Opcode::ListGetC => {
                let item = ops::list_get(r.get(a), r.int(b)).map_err(err)?;
                let kind = Suffix::of_numeric(op, Opcode::ListGetI).element();
                ops::check_tag(&item, expected_tag(&r.types[c as usize], kind)).map_err(err)?;
                r.set(c, item);
            }
            Opcode::ListSetI | Opcode::ListSetF | Opcode::ListSetC => {
                ops::list_set(r.get(c), r.int(b), r.get(a).clone()).map_err(err)?;
            }
            Opcode::TupleGet => {
                let slot = ops::tuple_slot(r.get(a), b as usize).map_err(err)?;
                // SAFETY: the tuple in rA keeps the slot alive
                let item = unsafe { (*slot).clone() };
                ops::check_tag(&item, register_tag(&r.types[c as usize])).map_err(err)?;
                r.set(c, item);
            }
            Opcode::TupleGetB | Opcode::TupleGetI | Opcode::TupleGetF | Opcode::TupleGetC => {
                let slot = ops::tuple_slot(r.get(a), b as usize).map_err(err)?;
                // SAFETY: the tuple in rA keeps the slot alive
                let words = unsafe { (*slot).words() };
                r.set_words(c, Suffix::of_family(op, Opcode::TupleGetB), words);
            }
            Opcode::TupleSet => {
                let expected = tuple_item_tag(&r.types[c as usize], b as usize);
                ops::check_tag(r.get(a), expected).map_err(err)?;
                let slot = ops::tuple_slot(r.get(c), b as usize).map_err(err)?;
                // SAFETY: the tuple in rC keeps the slot alive
                unsafe { *slot = r.get(a).clone() };
            }
            Opcode::TupleSetB | Opcode::TupleSetI | Opcode::TupleSetF | Opcode::TupleSetC => {
                let slot = ops::tuple_slot(r.get(c), b as usize).map_err(err)?;
                // SAFETY: the tuple in rC keeps the slot alive
                unsafe { *slot = r.get(a).clone() };
            }

            // Storage classes
            Opcode::GetVarOB | Opcode::GetVarOI | Opcode::GetVarOF | Opcode::GetVarOC => {
                let slot = ops::field_slot(&frame.receiver, b as usize).map_err(err)?;
                // SAFETY: the frame's receiver keeps the slot alive
                let words = unsafe { (*slot).words() };
                r.set_words(c, Suffix::of_family(op, Opcode::GetVarOB), words);
            }
            Opcode::SetVarOB | Opcode::SetVarOI | Opcode::SetVarOF | Opcode::SetVarOC => {
                let slot = ops::field_slot(&frame.receiver, c as usize).map_err(err)?;
                // SAFETY: the frame's receiver keeps the slot alive
                unsafe { *slot = r.get(a).clone() };
            }
            Opcode::GetVarKB | Opcode::GetVarKI | Opcode::GetVarKF | Opcode::GetVarKC => {
                let words = self.namespace.statics.get(b as usize).ok_or(err(ErrorCode::Index))?.words();
                r.set_words(c, Suffix::of_family(op, Opcode::GetVarKB), words);
            }
            Opcode::SetVarKB | Opcode::SetVarKI | Opcode::SetVarKF | Opcode::SetVarKC => {
                let slot = self.namespace.statics.get_mut(c as usize).ok_or(err(ErrorCode::Index))?;
                *slot = r.get(a).clone();
            }
            Opcode::GetVarGB | Opcode::GetVarGI | Opcode::GetVarGF | Opcode::GetVarGC => {
                let words = self.namespace.globals.get(b as usize).ok_or(err(ErrorCode::Index))?.words();
                r.set_words(c, Suffix::of_family(op, Opcode::GetVarGB), words);
            }
            Opcode::SetVarGB | Opcode::SetVarGI | Opcode::SetVarGF | Opcode::SetVarGC => {
                let slot = self.namespace.globals.get_mut(c as usize).ok_or(err(ErrorCode::Index))?;
                *slot = r.get(a).clone();
            }
            Opcode::GetVarHB | Opcode::GetVarHI | Opcode::GetVarHF | Opcode::GetVarHC => {
                let words = frame
                    .outer
                    .get(a as usize)
                    .and_then(|regs| regs.get(b as usize))
                    .ok_or(err(ErrorCode::Index))?
                    .words();
                r.set_words(c, Suffix::of_family(op, Opcode::GetVarHB), words);
            }
            Opcode::SetVarHB | Opcode::SetVarHI | Opcode::SetVarHF | Opcode::SetVarHC => {
                let value = r.get(a).clone();
                let slot = frame
                    .outer
                    .get_mut(c as usize)
                    .and_then(|regs| regs.get_mut(b as usize))
                    .ok_or(err(ErrorCode::Index))?;
                *slot = value;
            }

            // Instance fields
            Opcode::GetFieldB | Opcode::GetFieldI | Opcode::GetFieldF | Opcode::GetFieldC => {
                let slot = ops::field_slot(r.get(a), b as usize).map_err(err)?;
                // SAFETY: the instance in rA keeps the slot alive
                let words = unsafe { (*slot).words() };
                r.set_words(c, Suffix::of_family(op, Opcode::GetFieldB), words);
            }
            Opcode::SetFieldB | Opcode::SetFieldI | Opcode::SetFieldF | Opcode::SetFieldC => {
                let slot = ops::field_slot(r.get(c), b as usize).map_err(err)?;
                // SAFETY: the instance in rC keeps the slot alive
                unsafe { *slot = r.get(a).clone() };
            }

            // Control flow
            Opcode::Goto => return Ok(Flow::Jump(ins.target())),
            Opcode::TestB if !r.boolean(a) => return Ok(Flow::Jump(ins.target())),
            Opcode::TestI if r.int(a) == 0 => return Ok(Flow::Jump(ins.target())),
            Opcode::TestF if r.float(a) == 0.0 => return Ok(Flow::Jump(ins.target())),
            Opcode::Test if !r.get(a).truthy() => return Ok(Flow::Jump(ins.target())),
            Opcode::TestB | Opcode::TestI | Opcode::TestF | Opcode::Test => {}
            Opcode::Switch => {
                let disc = r.get(a).as_int();
                let cases = &routine.instructions()[pc + 1..=pc + c as usize];
                let hit = cases
                    .iter()
                    .find(|case| disc.is_some() && constants[case.a as usize].as_int() == disc);
                return Ok(Flow::Jump(hit.map_or(ins.target(), Instruction::target)));
            }
            Opcode::Case => return Err(VmError::NotExecutable(op)),
            Opcode::Return => {
                let value = if b != 0 { r.get(a).clone() } else { Value::none() };
                return Ok(Flow::Return(value));
            }
            Opcode::Print => {
                let text = r.get(a).to_string();
                self.output.push_str(&text);
                self.output.push('\n');
            }
            Opcode::JitCall => return Err(VmError::NotExecutable(op)),
        }
        Ok(Flow::Next)
    }
}

/// Tag a checked move into register type `ty` requires
pub(crate) fn register_tag(ty: &ValueType) -> u32 {
    ty.tag().map_or(ANY_TAG, |t| t as u32)
}

/// Tag a checked move into item `index` of tuple type `ty` requires
pub(crate) fn tuple_item_tag(ty: &ValueType, index: usize) -> u32 {
    match ty {
        ValueType::Tuple(items) => items.get(index).map_or(ANY_TAG, register_tag),
        _ => ANY_TAG,
    }
}

/// Tag a typed list read into register type `ty` requires
pub(crate) fn expected_tag(ty: &ValueType, kind: ElementKind) -> u32 {
    match ty {
        ValueType::Enum => ValueTag::Enum as u32,
        _ => kind.tag() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::types::ElementKind;

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    fn run(code: Vec<Instruction>, types: Vec<ValueType>, constants: Vec<Value>) -> Result<Value, VmError> {
        let routine = Routine::new("test", code, types, constants).unwrap();
        Interpreter::new(Namespace::default()).run(&routine)
    }

    #[test]
    fn test_add_and_return() {
        let result = run(
            vec![
                ins(Opcode::GetConstI, 0, 0, 0),
                ins(Opcode::GetConstI, 0, 1, 1),
                ins(Opcode::AddIII, 0, 1, 2),
                ins(Opcode::Return, 2, 1, 0),
            ],
            vec![ValueType::Int; 3],
            vec![Value::int(5), Value::int(7)],
        );
        assert_eq!(result, Ok(Value::int(12)));
    }

    #[test]
    fn test_division_by_zero() {
        let result = run(vec![ins(Opcode::DivIII, 0, 1, 2)], vec![ValueType::Int; 3], vec![]);
        assert_eq!(result, Err(VmError::at(ErrorCode::Arithmetic, 0)));
    }

    #[test]
    fn test_min_div_minus_one_wraps() {
        let result = run(
            vec![
                ins(Opcode::GetConstI, 0, 0, 0),
                ins(Opcode::GetConstI, 0, 1, 1),
                ins(Opcode::DivIII, 0, 1, 2),
                ins(Opcode::Return, 2, 1, 0),
            ],
            vec![ValueType::Int; 3],
            vec![Value::int(i64::MIN), Value::int(-1)],
        );
        assert_eq!(result, Ok(Value::int(i64::MIN)));
    }

    #[test]
    fn test_loop_sums() {
        // r0 = 0; r1 = 10; loop: r0 += r1; r1 -= 1; if r1 goto loop; return r0
        let result = run(
            vec![
                ins(Opcode::Data, 2, 0, 0),
                ins(Opcode::Data, 2, 10, 1),
                ins(Opcode::Data, 2, 1, 2),
                ins(Opcode::AddIII, 0, 1, 0),
                ins(Opcode::SubIII, 1, 2, 1),
                ins(Opcode::TestI, 1, 7, 0),
                ins(Opcode::Goto, 0, 3, 0),
                ins(Opcode::Return, 0, 1, 0),
            ],
            vec![ValueType::Int; 3],
            vec![],
        );
        assert_eq!(result, Ok(Value::int(55)));
    }

    #[test]
    fn test_switch_first_match_wins() {
        let result = run(
            vec![
                ins(Opcode::Data, 2, 2, 0),
                ins(Opcode::Switch, 0, 6, 2),
                ins(Opcode::Case, 0, 4, 0),
                ins(Opcode::Case, 0, 5, 0),
                ins(Opcode::Return, 0, 1, 0),
                ins(Opcode::Return, 0, 0, 0),
                ins(Opcode::Return, 0, 0, 0),
            ],
            vec![ValueType::Int],
            vec![Value::int(2)],
        );
        assert_eq!(result, Ok(Value::int(2)));
    }

    #[test]
    fn test_negative_array_index() {
        let array = Value::int_array(&[10, 20, 30, 40, 50], &[5]);
        let code = vec![ins(Opcode::ArrayGetI, 0, 1, 2), ins(Opcode::Return, 2, 1, 0)];
        let types = vec![ValueType::Array(ElementKind::Int), ValueType::Int, ValueType::Int];
        let routine = Routine::new("get", code, types, vec![]).unwrap();
        let mut interp = Interpreter::new(Namespace::default());

        let mut frame = routine.new_frame();
        frame.registers[0] = array.clone();
        frame.registers[1] = Value::int(-1);
        assert_eq!(interp.run_frame(&routine, &mut frame), Ok(Value::int(50)));

        let mut frame = routine.new_frame();
        frame.registers[0] = array;
        frame.registers[1] = Value::int(-6);
        assert_eq!(interp.run_frame(&routine, &mut frame), Err(VmError::at(ErrorCode::Index, 0)));
    }

    #[test]
    fn test_enum_register_keeps_tag() {
        let result = run(
            vec![ins(Opcode::Data, 2, 3, 0), ins(Opcode::MoveII, 0, 0, 1), ins(Opcode::Return, 1, 1, 0)],
            vec![ValueType::Int, ValueType::Enum],
            vec![],
        );
        assert_eq!(result, Ok(Value::enumeration(3)));
    }

    #[test]
    fn test_print_output() {
        let routine = Routine::new(
            "print",
            vec![ins(Opcode::GetConstS, 0, 0, 0), ins(Opcode::Print, 0, 0, 0)],
            vec![ValueType::String],
            vec![Value::string("hello")],
        )
        .unwrap();
        let mut interp = Interpreter::new(Namespace::default());
        interp.run(&routine).unwrap();
        assert_eq!(interp.output(), "hello\n");
    }

    #[test]
    fn test_checked_tuple_move() {
        let tuple_ty = ValueType::Tuple(vec![ValueType::Int, ValueType::String]);
        let routine = Routine::new(
            "tuple",
            vec![ins(Opcode::TupleGet, 0, 1, 1)],
            vec![tuple_ty, ValueType::Int],
            vec![],
        )
        .unwrap();
        let mut frame = routine.new_frame();
        frame.registers[0] = Value::tuple(vec![Value::int(1), Value::string("x")]);
        let result = Interpreter::new(Namespace::default()).run_frame(&routine, &mut frame);
        assert_eq!(result, Err(VmError::at(ErrorCode::Value, 0)));
    }

    #[test]
    fn test_storage_classes() {
        let routine = Routine::new(
            "storage",
            vec![
                ins(Opcode::GetVarGI, 0, 0, 0),
                ins(Opcode::GetVarKF, 0, 0, 1),
                ins(Opcode::SetVarGI, 0, 0, 1),
                ins(Opcode::GetVarOI, 0, 1, 0),
                ins(Opcode::SetVarKI, 0, 0, 0),
            ],
            vec![ValueType::Int, ValueType::Float],
            vec![],
        )
        .unwrap();
        let mut interp = Interpreter::new(Namespace::new(vec![Value::float(1.5)], vec![Value::int(7), Value::int(0)]));
        let mut frame = routine
            .new_frame()
            .with_receiver(Value::instance(3, vec![Value::int(0), Value::int(42)]));
        interp.run_frame(&routine, &mut frame).unwrap();
        assert_eq!(frame.registers[1], Value::float(1.5));
        assert_eq!(interp.namespace().globals[1], Value::int(7));
        assert_eq!(interp.namespace().statics[0], Value::int(42));
    }
}
