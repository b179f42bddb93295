//! Operation semantics shared by the interpreter and the JIT runtime library
//!
//! Every operation that compiled code delegates to a runtime support
//! function is implemented once here, so the interpreted and compiled paths
//! cannot drift apart.

use std::cell::RefCell;
use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::vm::error::ErrorCode;
use crate::vm::object::{element_value, reslice, ArrayObj};
use crate::vm::opcode::Opcode;
use crate::vm::types::ElementKind;
use crate::vm::value::{Complex, Value, ValueTag, ANY_TAG};

/// Normalize a possibly negative index against `len`.
///
/// Negative indices count from the end. Returns `None` when the normalized
/// index falls outside `[0, len)`.
pub fn normalize_index(index: i64, len: i64) -> Option<usize> {
    let i = if index < 0 { index.wrapping_add(len) } else { index };
    ((i as u64) < (len as u64)).then_some(i as usize)
}

// ============================================================================
// Scalar arithmetic
// ============================================================================

pub fn int_div(a: i64, b: i64) -> Result<i64, ErrorCode> {
    if b == 0 {
        Err(ErrorCode::Arithmetic)
    } else {
        Ok(a.wrapping_div(b))
    }
}

pub fn int_rem(a: i64, b: i64) -> Result<i64, ErrorCode> {
    if b == 0 {
        Err(ErrorCode::Arithmetic)
    } else {
        Ok(a.wrapping_rem(b))
    }
}

/// Integer power computed through `f64::powf`, saturating back to `i64`
pub fn int_pow(a: i64, b: i64) -> i64 {
    (a as f64).powf(b as f64) as i64
}

/// A numeric operand promoted for generic arithmetic
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
    Complex(Complex),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value.tag() {
            ValueTag::Int | ValueTag::Bool | ValueTag::Enum => Some(Num::Int(value.words()[0] as i64)),
            ValueTag::Float => value.as_float().map(Num::Float),
            ValueTag::Complex => value.as_complex().map(Num::Complex),
            _ => None,
        }
    }

    fn kind(self) -> ElementKind {
        match self {
            Num::Int(_) => ElementKind::Int,
            Num::Float(_) => ElementKind::Float,
            Num::Complex(_) => ElementKind::Complex,
        }
    }

    fn from_words(kind: ElementKind, words: [u64; 2]) -> Num {
        match kind {
            ElementKind::Int => Num::Int(words[0] as i64),
            ElementKind::Float => Num::Float(f64::from_bits(words[0])),
            ElementKind::Complex => Num::Complex(Complex::new(
                f64::from_bits(words[0]),
                f64::from_bits(words[1]),
            )),
        }
    }

    /// Convert to `kind`. Complex values never narrow implicitly.
    fn to(self, kind: ElementKind) -> Result<Num, ErrorCode> {
        Ok(match (self, kind) {
            (n, k) if n.kind() == k => n,
            (Num::Int(i), ElementKind::Float) => Num::Float(i as f64),
            (Num::Int(i), ElementKind::Complex) => Num::Complex(Complex::new(i as f64, 0.0)),
            (Num::Float(f), ElementKind::Int) => Num::Int(f as i64),
            (Num::Float(f), ElementKind::Complex) => Num::Complex(Complex::new(f, 0.0)),
            _ => return Err(ErrorCode::Shape),
        })
    }

    fn words(self) -> [u64; 2] {
        match self {
            Num::Int(i) => [i as u64, 0],
            Num::Float(f) => [f.to_bits(), 0],
            Num::Complex(c) => [c.re.to_bits(), c.im.to_bits()],
        }
    }

    fn into_value(self) -> Value {
        element_value(self.kind(), self.words())
    }
}

fn apply(op: Opcode, x: Num, y: Num) -> Result<Num, ErrorCode> {
    Ok(match (x, y) {
        (Num::Int(a), Num::Int(b)) => Num::Int(match op {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::Div => int_div(a, b)?,
            Opcode::Mod => int_rem(a, b)?,
            Opcode::Pow => int_pow(a, b),
            _ => return Err(ErrorCode::Value),
        }),
        (Num::Float(a), Num::Float(b)) => Num::Float(match op {
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            Opcode::Mod => a % b,
            Opcode::Pow => a.powf(b),
            _ => return Err(ErrorCode::Value),
        }),
        (Num::Complex(a), Num::Complex(b)) => Num::Complex(match op {
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            _ => return Err(ErrorCode::Value),
        }),
        _ => return Err(ErrorCode::Shape),
    })
}

/// Generic arithmetic over any numeric operands (arrays elementwise)
pub fn generic_arith(op: Opcode, a: &Value, b: &Value) -> Result<Value, ErrorCode> {
    if a.tag() == ValueTag::Array || b.tag() == ValueTag::Array {
        return array_arith(op, a, b);
    }
    if op == Opcode::Add && a.tag() == ValueTag::String && b.tag() == ValueTag::String {
        return Ok(string_concat(a, b));
    }
    let (x, y) = match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(ErrorCode::Value),
    };
    let kind = x.kind().max(y.kind());
    Ok(apply(op, x.to(kind)?, y.to(kind)?)?.into_value())
}

// ============================================================================
// Array arithmetic
// ============================================================================

enum Operand {
    Array(*mut ArrayObj),
    Scalar(Num),
}

impl Operand {
    fn of(value: &Value) -> Result<Operand, ErrorCode> {
        let arr = value.array_obj();
        if !arr.is_null() {
            // SAFETY: the value holds a reference to the array
            unsafe { reslice(arr)? };
            return Ok(Operand::Array(arr));
        }
        Num::of(value).map(Operand::Scalar).ok_or(ErrorCode::Value)
    }

    fn kind(&self) -> ElementKind {
        match self {
            // SAFETY: the array is kept alive by the borrowed operand value
            Operand::Array(arr) => unsafe { (**arr).kind() },
            Operand::Scalar(n) => n.kind(),
        }
    }

    fn at(&self, i: usize) -> Num {
        match self {
            // SAFETY: i < size, checked by the caller's shape agreement
            Operand::Array(arr) => unsafe { Num::from_words((**arr).kind(), (**arr).element(i)) },
            Operand::Scalar(n) => *n,
        }
    }
}

/// Elementwise arithmetic where at least one operand is an array.
///
/// `op` is the generic arithmetic opcode (`Add` through `Pow`). Two arrays
/// must have identical shapes. The result element kind is the wider of the
/// two operand kinds.
pub fn array_arith(op: Opcode, a: &Value, b: &Value) -> Result<Value, ErrorCode> {
    if !op.is_generic_arith() {
        return Err(ErrorCode::Value);
    }
    let x = Operand::of(a)?;
    let y = Operand::of(b)?;
    // SAFETY: array pointers stay valid while `a` and `b` are borrowed
    let shape = unsafe {
        match (&x, &y) {
            (Operand::Array(p), Operand::Array(q)) => {
                if (**p).shape() != (**q).shape() {
                    return Err(ErrorCode::Shape);
                }
                (**p).shape().to_vec()
            }
            (Operand::Array(p), _) | (_, Operand::Array(p)) => (**p).shape().to_vec(),
            _ => return Err(ErrorCode::Value),
        }
    };
    let kind = x.kind().max(y.kind());
    let size: i64 = shape.iter().product();
    let mut words = Vec::with_capacity(size as usize * kind.words());
    for i in 0..size as usize {
        let r = apply(op, x.at(i).to(kind)?, y.at(i).to(kind)?)?;
        words.extend_from_slice(&r.words()[..kind.words()]);
    }
    Ok(Value::array_from_words(kind, words, &shape))
}

/// Assign `src` to every element of array `dst` (whole-array indexed set).
///
/// A scalar source is broadcast; an array source must have the same shape.
pub fn array_assign(dst: &Value, src: &Value) -> Result<(), ErrorCode> {
    let arr = dst.array_obj();
    if arr.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `dst` holds a reference; elements are written through raw pointers
    unsafe {
        reslice(arr)?;
        let kind = (*arr).kind();
        let source = Operand::of(src)?;
        if let Operand::Array(s) = source {
            if (*s).shape() != (*arr).shape() {
                return Err(ErrorCode::Shape);
            }
        }
        for i in 0..(*arr).size as usize {
            (*arr).set_element(i, source.at(i).to(kind)?.words());
        }
    }
    Ok(())
}

/// Read one element of an array by a single flat index
pub fn array_get(array: &Value, index: i64) -> Result<Value, ErrorCode> {
    let arr = array.array_obj();
    if arr.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `array` holds a reference
    unsafe {
        reslice(arr)?;
        let flat = (*arr).flat_index(index)?;
        Ok(element_value((*arr).kind(), (*arr).element(flat)))
    }
}

/// Read one element of an array by one index per dimension
pub fn array_get_multi(array: &Value, indices: &[i64]) -> Result<Value, ErrorCode> {
    let arr = array.array_obj();
    if arr.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `array` holds a reference
    unsafe {
        reslice(arr)?;
        let flat = (*arr).flat_multi_index(indices)?;
        Ok(element_value((*arr).kind(), (*arr).element(flat)))
    }
}

/// Store a scalar into an array by a single flat index
pub fn array_set(array: &Value, index: i64, value: &Value) -> Result<(), ErrorCode> {
    let arr = array.array_obj();
    if arr.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `array` holds a reference
    unsafe {
        reslice(arr)?;
        let flat = (*arr).flat_index(index)?;
        (*arr).set_element(flat, value.words());
    }
    Ok(())
}

/// Store a scalar into an array by one index per dimension
pub fn array_set_multi(array: &Value, indices: &[i64], value: &Value) -> Result<(), ErrorCode> {
    let arr = array.array_obj();
    if arr.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `array` holds a reference
    unsafe {
        reslice(arr)?;
        let flat = (*arr).flat_multi_index(indices)?;
        (*arr).set_element(flat, value.words());
    }
    Ok(())
}

// ============================================================================
// Lists, tuples, checked moves
// ============================================================================

/// Check that `value` carries tag `expected` (or `expected` is `ANY_TAG`)
pub fn check_tag(value: &Value, expected: u32) -> Result<(), ErrorCode> {
    if expected == ANY_TAG || value.raw_tag() == expected {
        Ok(())
    } else {
        Err(ErrorCode::Value)
    }
}

pub fn list_get(list: &Value, index: i64) -> Result<Value, ErrorCode> {
    let obj = list.list_obj();
    if obj.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `list` holds a reference
    unsafe {
        let i = normalize_index(index, (*obj).len).ok_or(ErrorCode::Index)?;
        Ok((*obj).items()[i].clone())
    }
}

pub fn list_set(list: &Value, index: i64, value: Value) -> Result<(), ErrorCode> {
    let obj = list.list_obj();
    if obj.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `list` holds a reference; the slot is replaced through a raw pointer
    unsafe {
        let i = normalize_index(index, (*obj).len).ok_or(ErrorCode::Index)?;
        *(*obj).items.add(i) = value;
    }
    Ok(())
}

/// Pointer to item `index` of a tuple, checked
pub(crate) fn tuple_slot(tuple: &Value, index: usize) -> Result<*mut Value, ErrorCode> {
    let obj = tuple.tuple_obj();
    if obj.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `tuple` holds a reference
    unsafe {
        if index >= (*obj).len as usize {
            return Err(ErrorCode::Index);
        }
        Ok((*obj).items.add(index))
    }
}

/// Pointer to field `index` of an instance, checked
pub(crate) fn field_slot(instance: &Value, index: usize) -> Result<*mut Value, ErrorCode> {
    let obj = instance.instance_obj();
    if obj.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `instance` holds a reference
    unsafe {
        if index >= (*obj).nfields as usize {
            return Err(ErrorCode::Index);
        }
        Ok((*obj).fields.add(index))
    }
}

// ============================================================================
// Strings and sizes
// ============================================================================

pub fn string_concat(a: &Value, b: &Value) -> Value {
    let mut bytes = a.as_bytes().unwrap_or_default().to_vec();
    bytes.extend_from_slice(b.as_bytes().unwrap_or_default());
    Value::from_bytes(bytes)
}

/// Bytewise ordering of two strings
pub fn string_compare(a: &Value, b: &Value) -> Ordering {
    a.as_bytes().unwrap_or_default().cmp(b.as_bytes().unwrap_or_default())
}

pub fn string_get_char(s: &Value, index: i64) -> Result<i64, ErrorCode> {
    let bytes = s.as_bytes().ok_or(ErrorCode::Value)?;
    let i = normalize_index(index, bytes.len() as i64).ok_or(ErrorCode::Index)?;
    Ok(bytes[i] as i64)
}

/// Replace byte `index` of the string in `slot`, copying it first when shared
pub fn string_set_char(slot: &mut Value, index: i64, ch: i64) -> Result<(), ErrorCode> {
    let obj = slot.string_obj();
    if obj.is_null() {
        return Err(ErrorCode::Value);
    }
    // SAFETY: `slot` holds a reference; an unshared buffer is written in place
    unsafe {
        let i = normalize_index(index, (*obj).len).ok_or(ErrorCode::Index)?;
        if (*obj).header.ref_count() > 1 {
            let mut bytes = (*obj).as_bytes().to_vec();
            bytes[i] = ch as u8;
            *slot = Value::from_bytes(bytes);
        } else {
            *(*obj).data.add(i) = ch as u8;
        }
    }
    Ok(())
}

/// Length of a string, array, or list
pub fn size_of(value: &Value) -> Result<i64, ErrorCode> {
    match value.tag() {
        ValueTag::String => Ok(value.as_bytes().map_or(0, |b| b.len() as i64)),
        // SAFETY: the value holds a reference
        ValueTag::Array => Ok(unsafe { (*value.array_obj()).size }),
        ValueTag::List => Ok(unsafe { (*value.list_obj()).len }),
        _ => Err(ErrorCode::Value),
    }
}

// ============================================================================
// Math table
// ============================================================================

/// Functions selectable by the `MathF` opcode's A operand
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sin = 0,
    Cos = 1,
    Tan = 2,
    Asin = 3,
    Acos = 4,
    Atan = 5,
    Exp = 6,
    Ln = 7,
    Sqrt = 8,
    Abs = 9,
    Ceil = 10,
    Floor = 11,
    /// Uniform random in `[0, x)` from the thread's seeded generator
    Rand = 12,
}

impl MathFn {
    pub const ALL: [MathFn; 13] = [
        MathFn::Sin,
        MathFn::Cos,
        MathFn::Tan,
        MathFn::Asin,
        MathFn::Acos,
        MathFn::Atan,
        MathFn::Exp,
        MathFn::Ln,
        MathFn::Sqrt,
        MathFn::Abs,
        MathFn::Ceil,
        MathFn::Floor,
        MathFn::Rand,
    ];

    pub fn from_i32(raw: i32) -> Option<Self> {
        MathFn::ALL.get(usize::try_from(raw).ok()?).copied()
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Tan => x.tan(),
            MathFn::Asin => x.asin(),
            MathFn::Acos => x.acos(),
            MathFn::Atan => x.atan(),
            MathFn::Exp => x.exp(),
            MathFn::Ln => x.ln(),
            MathFn::Sqrt => x.sqrt(),
            MathFn::Abs => x.abs(),
            MathFn::Ceil => x.ceil(),
            MathFn::Floor => x.floor(),
            MathFn::Rand => random_uniform(x),
        }
    }
}

/// Seed used by each thread's generator until [`seed_random`] is called
pub const DEFAULT_RANDOM_SEED: u64 = 0x5EED_D1CE;

thread_local! {
    static RANDOM: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(DEFAULT_RANDOM_SEED));
}

/// Reseed the calling thread's uniform generator
pub fn seed_random(seed: u64) {
    RANDOM.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Uniform random in `[0, scale)`
pub fn random_uniform(scale: f64) -> f64 {
    RANDOM.with(|rng| rng.borrow_mut().gen::<f64>()) * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_index() {
        assert_eq!(normalize_index(-1, 5), Some(4));
        assert_eq!(normalize_index(0, 5), Some(0));
        assert_eq!(normalize_index(4, 5), Some(4));
        assert_eq!(normalize_index(5, 5), None);
        assert_eq!(normalize_index(-5, 5), Some(0));
        assert_eq!(normalize_index(-6, 5), None);
        assert_eq!(normalize_index(i64::MIN, 5), None);
        assert_eq!(normalize_index(0, 0), None);
    }

    #[test]
    fn test_int_division() {
        assert_eq!(int_div(7, 2), Ok(3));
        assert_eq!(int_div(7, 0), Err(ErrorCode::Arithmetic));
        assert_eq!(int_div(i64::MIN, -1), Ok(i64::MIN));
        assert_eq!(int_rem(i64::MIN, -1), Ok(0));
        assert_eq!(int_rem(-7, 2), Ok(-1));
        assert_eq!(int_pow(2, 10), 1024);
        assert_eq!(int_pow(2, -1), 0);
    }

    #[test]
    fn test_array_arith_broadcast() {
        let a = Value::int_array(&[1, 2, 3], &[3]);
        let r = array_arith(Opcode::Mul, &a, &Value::float(0.5)).unwrap();
        assert_eq!(r.array_kind(), Some(ElementKind::Float));
        assert_eq!(r.array_values().unwrap()[2], Value::float(1.5));
    }

    #[test]
    fn test_array_arith_shape_mismatch() {
        let a = Value::int_array(&[1, 2, 3], &[3]);
        let b = Value::int_array(&[1, 2], &[2]);
        assert_eq!(array_arith(Opcode::Add, &a, &b), Err(ErrorCode::Shape));
        let z = Value::int_array(&[1, 0, 1], &[3]);
        assert_eq!(array_arith(Opcode::Div, &a, &z), Err(ErrorCode::Arithmetic));
    }

    #[test]
    fn test_array_assign() {
        let a = Value::float_array(&[1.0, 2.0], &[2]);
        array_assign(&a, &Value::int(3)).unwrap();
        assert_eq!(a.array_values().unwrap(), vec![Value::float(3.0), Value::float(3.0)]);
        let c = Value::complex(Complex::new(1.0, 1.0));
        assert_eq!(array_assign(&a, &c), Err(ErrorCode::Shape));
    }

    #[test]
    fn test_list_access() {
        let list = Value::list(vec![Value::int(1), Value::int(2)]);
        assert_eq!(list_get(&list, -1), Ok(Value::int(2)));
        assert_eq!(list_get(&list, 2), Err(ErrorCode::Index));
        list_set(&list, 0, Value::int(9)).unwrap();
        assert_eq!(list_get(&list, 0), Ok(Value::int(9)));
        assert_eq!(list_get(&Value::none(), 0), Err(ErrorCode::Value));
    }

    #[test]
    fn test_string_copy_on_write() {
        let a = Value::string("abc");
        let mut b = a.clone();
        string_set_char(&mut b, -1, b'z' as i64).unwrap();
        assert_eq!(a.as_bytes(), Some(&b"abc"[..]));
        assert_eq!(b.as_bytes(), Some(&b"abz"[..]));
        assert_eq!(string_get_char(&b, 3), Err(ErrorCode::Index));
    }

    #[test]
    fn test_generic_scalar_promotion() {
        let r = generic_arith(Opcode::Add, &Value::int(1), &Value::float(0.5)).unwrap();
        assert_eq!(r, Value::float(1.5));
        let c = Value::complex(Complex::new(1.0, 0.0));
        assert_eq!(generic_arith(Opcode::Mod, &c, &c), Err(ErrorCode::Value));
    }

    #[test]
    fn test_seeded_random_repeats() {
        seed_random(11);
        let a: Vec<f64> = (0..4).map(|_| random_uniform(1.0)).collect();
        seed_random(11);
        let b: Vec<f64> = (0..4).map(|_| random_uniform(1.0)).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn test_math_table() {
        assert_eq!(MathFn::from_i32(8), Some(MathFn::Sqrt));
        assert_eq!(MathFn::from_i32(13), None);
        assert_eq!(MathFn::from_i32(-1), None);
        assert_eq!(MathFn::Floor.apply(-1.5), -2.0);
    }
}
