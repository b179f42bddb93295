//! Runtime support library for compiled segments
//!
//! Operations too large to emit inline (container arithmetic, checked moves,
//! string handling, transcendental math) are plain C-ABI functions that
//! compiled code calls by absolute address. Each one delegates to the same
//! routine in `crate::vm::ops` the interpreter uses. Fallible helpers return
//! an `i32` status: 0 on success, otherwise the [`ErrorCode`] discriminant.
//!
//! # Safety
//!
//! Every pointer argument must address a live, initialized [`Value`] slot
//! (or a live array object for [`dvm_array_reslice`]) for the duration of
//! the call. Compiled code only passes slots of the call data it was given.

use cranelift_codegen::ir::{self, types, AbiParam};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;

use crate::vm::object::reslice;
use crate::vm::ops;
use crate::vm::{ArrayObj, ErrorCode, MathFn, Opcode, Value};

fn status(result: Result<(), ErrorCode>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(code) => code.status(),
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Materialize a slice view before compiled code indexes its data
pub unsafe extern "C" fn dvm_array_reslice(array: *mut ArrayObj) -> i32 {
    status(reslice(array))
}

/// Generic elementwise arithmetic; `op` is the generic opcode's number
pub unsafe extern "C" fn dvm_array_arith(op: i32, dst: *mut Value, a: *const Value, b: *const Value) -> i32 {
    let Some(op) = u16::try_from(op).ok().and_then(Opcode::from_u16) else {
        return ErrorCode::Value.status();
    };
    match ops::array_arith(op, &*a, &*b) {
        Ok(result) => {
            *dst = result;
            0
        }
        Err(code) => code.status(),
    }
}

/// Whole-array assignment with scalar broadcast
pub unsafe extern "C" fn dvm_array_assign(dst: *const Value, src: *const Value) -> i32 {
    status(ops::array_assign(&*dst, &*src))
}

/// Read a list item into `dst`, checking it carries tag `expected`
pub unsafe extern "C" fn dvm_list_get(list: *const Value, index: i64, dst: *mut Value, expected: u32) -> i32 {
    let item = match ops::list_get(&*list, index) {
        Ok(item) => item,
        Err(code) => return code.status(),
    };
    if let Err(code) = ops::check_tag(&item, expected) {
        return code.status();
    }
    *dst = item;
    0
}

pub unsafe extern "C" fn dvm_list_set(list: *const Value, index: i64, src: *const Value) -> i32 {
    status(ops::list_set(&*list, index, (*src).clone()))
}

/// Checked move: copy `src` into `dst` when its tag is `expected`
/// (or `expected` is the wildcard tag)
pub unsafe extern "C" fn dvm_value_move(dst: *mut Value, src: *const Value, expected: u32) -> i32 {
    if let Err(code) = ops::check_tag(&*src, expected) {
        return code.status();
    }
    let value = (*src).clone();
    *dst = value;
    0
}

// ============================================================================
// Strings
// ============================================================================

pub unsafe extern "C" fn dvm_string_move(dst: *mut Value, src: *const Value) {
    let value = (*src).clone();
    *dst = value;
}

pub unsafe extern "C" fn dvm_string_concat(dst: *mut Value, a: *const Value, b: *const Value) {
    let value = ops::string_concat(&*a, &*b);
    *dst = value;
}

/// Bytewise comparison: -1, 0 or 1
pub unsafe extern "C" fn dvm_string_compare(a: *const Value, b: *const Value) -> i64 {
    ops::string_compare(&*a, &*b) as i64
}

pub unsafe extern "C" fn dvm_string_set_char(slot: *mut Value, index: i64, ch: i64) -> i32 {
    status(ops::string_set_char(&mut *slot, index, ch))
}

// ============================================================================
// Math
// ============================================================================

pub extern "C" fn dvm_sin(x: f64) -> f64 {
    MathFn::Sin.apply(x)
}

pub extern "C" fn dvm_cos(x: f64) -> f64 {
    MathFn::Cos.apply(x)
}

pub extern "C" fn dvm_tan(x: f64) -> f64 {
    MathFn::Tan.apply(x)
}

pub extern "C" fn dvm_asin(x: f64) -> f64 {
    MathFn::Asin.apply(x)
}

pub extern "C" fn dvm_acos(x: f64) -> f64 {
    MathFn::Acos.apply(x)
}

pub extern "C" fn dvm_atan(x: f64) -> f64 {
    MathFn::Atan.apply(x)
}

pub extern "C" fn dvm_exp(x: f64) -> f64 {
    MathFn::Exp.apply(x)
}

pub extern "C" fn dvm_ln(x: f64) -> f64 {
    MathFn::Ln.apply(x)
}

pub extern "C" fn dvm_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

pub extern "C" fn dvm_fmod(x: f64, y: f64) -> f64 {
    x % y
}

/// Draws from the calling thread's generator, the same one the
/// interpreter uses
pub extern "C" fn dvm_rand(scale: f64) -> f64 {
    MathFn::Rand.apply(scale)
}

// ============================================================================
// Catalogue
// ============================================================================

/// Identifies a runtime support function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelper {
    ArrayReslice,
    ArrayArith,
    ArrayAssign,
    ListGet,
    ListSet,
    ValueMove,
    StringMove,
    StringConcat,
    StringCompare,
    StringSetChar,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Ln,
    Pow,
    Fmod,
    Rand,
}

impl RuntimeHelper {
    pub const ALL: [RuntimeHelper; 21] = [
        RuntimeHelper::ArrayReslice,
        RuntimeHelper::ArrayArith,
        RuntimeHelper::ArrayAssign,
        RuntimeHelper::ListGet,
        RuntimeHelper::ListSet,
        RuntimeHelper::ValueMove,
        RuntimeHelper::StringMove,
        RuntimeHelper::StringConcat,
        RuntimeHelper::StringCompare,
        RuntimeHelper::StringSetChar,
        RuntimeHelper::Sin,
        RuntimeHelper::Cos,
        RuntimeHelper::Tan,
        RuntimeHelper::Asin,
        RuntimeHelper::Acos,
        RuntimeHelper::Atan,
        RuntimeHelper::Exp,
        RuntimeHelper::Ln,
        RuntimeHelper::Pow,
        RuntimeHelper::Fmod,
        RuntimeHelper::Rand,
    ];

    /// Helper implementing a math-table entry, or `None` for the entries
    /// compiled code evaluates inline (sqrt, abs, ceil, floor)
    pub fn for_math(f: MathFn) -> Option<RuntimeHelper> {
        Some(match f {
            MathFn::Sin => RuntimeHelper::Sin,
            MathFn::Cos => RuntimeHelper::Cos,
            MathFn::Tan => RuntimeHelper::Tan,
            MathFn::Asin => RuntimeHelper::Asin,
            MathFn::Acos => RuntimeHelper::Acos,
            MathFn::Atan => RuntimeHelper::Atan,
            MathFn::Exp => RuntimeHelper::Exp,
            MathFn::Ln => RuntimeHelper::Ln,
            MathFn::Rand => RuntimeHelper::Rand,
            MathFn::Sqrt | MathFn::Abs | MathFn::Ceil | MathFn::Floor => return None,
        })
    }
}

/// Machine type of a helper parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Ptr,
    I32,
    I64,
    F64,
}

impl Param {
    pub fn ir_type(self) -> ir::Type {
        match self {
            Param::Ptr | Param::I64 => types::I64,
            Param::I32 => types::I32,
            Param::F64 => types::F64,
        }
    }
}

/// One catalogue entry: symbol, address and machine signature
#[derive(Debug, Clone)]
pub struct RuntimeFn {
    pub helper: RuntimeHelper,
    pub name: &'static str,
    pub address: usize,
    pub params: &'static [Param],
    pub returns: Option<Param>,
}

impl RuntimeFn {
    pub fn signature(&self, call_conv: CallConv) -> ir::Signature {
        let mut sig = ir::Signature::new(call_conv);
        sig.params.extend(self.params.iter().map(|p| AbiParam::new(p.ir_type())));
        sig.returns.extend(self.returns.iter().map(|p| AbiParam::new(p.ir_type())));
        sig
    }
}

/// Every runtime support function, indexed by [`RuntimeHelper`]
#[derive(Debug, Clone)]
pub struct RuntimeCatalogue {
    fns: Vec<RuntimeFn>,
}

impl RuntimeCatalogue {
    pub fn new() -> Self {
        use Param::*;
        let entry = |helper, name, address: *const (), params: &'static [Param], returns| RuntimeFn {
            helper,
            name,
            address: address as usize,
            params,
            returns,
        };
        let fns = RuntimeHelper::ALL
            .iter()
            .map(|&helper| match helper {
                RuntimeHelper::ArrayReslice => {
                    entry(helper, "dvm_array_reslice", dvm_array_reslice as *const (), &[Ptr], Some(I32))
                }
                RuntimeHelper::ArrayArith => {
                    entry(helper, "dvm_array_arith", dvm_array_arith as *const (), &[I32, Ptr, Ptr, Ptr], Some(I32))
                }
                RuntimeHelper::ArrayAssign => {
                    entry(helper, "dvm_array_assign", dvm_array_assign as *const (), &[Ptr, Ptr], Some(I32))
                }
                RuntimeHelper::ListGet => {
                    entry(helper, "dvm_list_get", dvm_list_get as *const (), &[Ptr, I64, Ptr, I32], Some(I32))
                }
                RuntimeHelper::ListSet => {
                    entry(helper, "dvm_list_set", dvm_list_set as *const (), &[Ptr, I64, Ptr], Some(I32))
                }
                RuntimeHelper::ValueMove => {
                    entry(helper, "dvm_value_move", dvm_value_move as *const (), &[Ptr, Ptr, I32], Some(I32))
                }
                RuntimeHelper::StringMove => {
                    entry(helper, "dvm_string_move", dvm_string_move as *const (), &[Ptr, Ptr], None)
                }
                RuntimeHelper::StringConcat => {
                    entry(helper, "dvm_string_concat", dvm_string_concat as *const (), &[Ptr, Ptr, Ptr], None)
                }
                RuntimeHelper::StringCompare => {
                    entry(helper, "dvm_string_compare", dvm_string_compare as *const (), &[Ptr, Ptr], Some(I64))
                }
                RuntimeHelper::StringSetChar => {
                    entry(helper, "dvm_string_set_char", dvm_string_set_char as *const (), &[Ptr, I64, I64], Some(I32))
                }
                RuntimeHelper::Sin => entry(helper, "dvm_sin", dvm_sin as *const (), &[F64], Some(F64)),
                RuntimeHelper::Cos => entry(helper, "dvm_cos", dvm_cos as *const (), &[F64], Some(F64)),
                RuntimeHelper::Tan => entry(helper, "dvm_tan", dvm_tan as *const (), &[F64], Some(F64)),
                RuntimeHelper::Asin => entry(helper, "dvm_asin", dvm_asin as *const (), &[F64], Some(F64)),
                RuntimeHelper::Acos => entry(helper, "dvm_acos", dvm_acos as *const (), &[F64], Some(F64)),
                RuntimeHelper::Atan => entry(helper, "dvm_atan", dvm_atan as *const (), &[F64], Some(F64)),
                RuntimeHelper::Exp => entry(helper, "dvm_exp", dvm_exp as *const (), &[F64], Some(F64)),
                RuntimeHelper::Ln => entry(helper, "dvm_ln", dvm_ln as *const (), &[F64], Some(F64)),
                RuntimeHelper::Pow => entry(helper, "dvm_pow", dvm_pow as *const (), &[F64, F64], Some(F64)),
                RuntimeHelper::Fmod => entry(helper, "dvm_fmod", dvm_fmod as *const (), &[F64, F64], Some(F64)),
                RuntimeHelper::Rand => entry(helper, "dvm_rand", dvm_rand as *const (), &[F64], Some(F64)),
            })
            .collect();
        RuntimeCatalogue { fns }
    }

    pub fn get(&self, helper: RuntimeHelper) -> &RuntimeFn {
        &self.fns[helper as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeFn> {
        self.fns.iter()
    }

    /// Make every helper resolvable by name in modules built from `builder`
    pub fn register(&self, builder: &mut JITBuilder) {
        for f in &self.fns {
            builder.symbol(f.name, f.address as *const u8);
        }
    }
}

impl Default for RuntimeCatalogue {
    fn default() -> Self {
        Self::new()
    }
}
