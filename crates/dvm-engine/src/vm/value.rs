//! Tagged value representation shared by the interpreter and compiled code
//!
//! A `Value` is a 24-byte `#[repr(C)]` struct: a 32-bit tag, 32 reserved
//! bits, and a 16-byte payload. Scalars are stored unboxed in the payload
//! (bools and ints as `i64`, floats as `f64`, complex numbers as two `f64`).
//! Strings, arrays, lists, tuples, and instances are reference-counted heap
//! objects whose pointer occupies the first payload word. Compiled code reads
//! and writes these slots directly, so the layout is part of the JIT ABI
//! (see `jit::abi`).

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::vm::object::{self, ObjectHeader};
use crate::vm::types::ValueType;

/// Runtime type tag stored in the first word of every value
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    None = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Complex = 4,
    Enum = 5,
    String = 6,
    Array = 7,
    List = 8,
    Tuple = 9,
    Object = 10,
}

impl ValueTag {
    /// Decode a raw tag
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ValueTag::None,
            1 => ValueTag::Bool,
            2 => ValueTag::Int,
            3 => ValueTag::Float,
            4 => ValueTag::Complex,
            5 => ValueTag::Enum,
            6 => ValueTag::String,
            7 => ValueTag::Array,
            8 => ValueTag::List,
            9 => ValueTag::Tuple,
            10 => ValueTag::Object,
            _ => return None,
        })
    }

    /// Values with this tag own a reference to a heap object
    pub fn is_heap(self) -> bool {
        matches!(
            self,
            ValueTag::String | ValueTag::Array | ValueTag::List | ValueTag::Tuple | ValueTag::Object
        )
    }
}

/// Tag wildcard accepted by checked moves
pub const ANY_TAG: u32 = u32::MAX;

/// Complex number with `f64` lanes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }
}

impl Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl Div for Complex {
    type Output = Complex;
    /// Multiply by the conjugate of `rhs`, then divide by its squared modulus.
    fn div(self, rhs: Complex) -> Complex {
        let norm = rhs.re * rhs.re + rhs.im * rhs.im;
        Complex::new(
            (self.re * rhs.re + self.im * rhs.im) / norm,
            (self.im * rhs.re - self.re * rhs.im) / norm,
        )
    }
}

impl Neg for Complex {
    type Output = Complex;
    fn neg(self) -> Complex {
        Complex::new(-self.re, -self.im)
    }
}

/// Payload of a value slot
#[repr(C)]
#[derive(Clone, Copy)]
pub union Payload {
    pub words: [u64; 2],
    pub int: i64,
    pub float: f64,
    pub complex: Complex,
    pub object: *mut ObjectHeader,
}

/// A tagged VM value
#[repr(C)]
pub struct Value {
    tag: u32,
    _reserved: u32,
    payload: Payload,
}

// Reference counts are atomic. Concurrent mutation of a shared container is
// the embedder's responsibility, exactly as for the interpreter itself.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// Byte offset of the tag word
    pub const TAG_OFFSET: usize = std::mem::offset_of!(Value, tag);
    /// Byte offset of the first payload word
    pub const PAYLOAD_OFFSET: usize = std::mem::offset_of!(Value, payload);
    /// Byte offset of the second payload word (imaginary lane)
    pub const PAYLOAD_HI_OFFSET: usize = Self::PAYLOAD_OFFSET + 8;
    /// Size of one value slot
    pub const SIZE: usize = std::mem::size_of::<Value>();

    const fn with_words(tag: ValueTag, w0: u64, w1: u64) -> Self {
        Value {
            tag: tag as u32,
            _reserved: 0,
            payload: Payload { words: [w0, w1] },
        }
    }

    /// The none value (null payload)
    pub const fn none() -> Self {
        Value::with_words(ValueTag::None, 0, 0)
    }

    pub fn bool(b: bool) -> Self {
        Value::with_words(ValueTag::Bool, b as u64, 0)
    }

    pub fn int(i: i64) -> Self {
        Value::with_words(ValueTag::Int, i as u64, 0)
    }

    pub fn float(f: f64) -> Self {
        Value::with_words(ValueTag::Float, f.to_bits(), 0)
    }

    pub fn complex(c: Complex) -> Self {
        Value::with_words(ValueTag::Complex, c.re.to_bits(), c.im.to_bits())
    }

    /// Enumerated value with the given integer code
    pub fn enumeration(code: i64) -> Self {
        Value::with_words(ValueTag::Enum, code as u64, 0)
    }

    /// Wrap a heap object, taking over one reference.
    ///
    /// # Safety
    /// `ptr` must point to a live object whose kind matches `tag`, and the
    /// caller must transfer one reference to the new value.
    pub(crate) unsafe fn from_object(tag: ValueTag, ptr: *mut ObjectHeader) -> Self {
        Value {
            tag: tag as u32,
            _reserved: 0,
            payload: Payload { object: ptr },
        }
    }

    /// Default value a register of type `ty` holds when a frame is created
    pub fn default_for(ty: &ValueType) -> Self {
        match ty {
            ValueType::Bool => Value::bool(false),
            ValueType::Int => Value::int(0),
            ValueType::Float => Value::float(0.0),
            ValueType::Complex => Value::complex(Complex::default()),
            ValueType::Enum => Value::enumeration(0),
            ValueType::String => Value::string(""),
            _ => Value::none(),
        }
    }

    /// Raw tag word
    pub fn raw_tag(&self) -> u32 {
        self.tag
    }

    pub fn tag(&self) -> ValueTag {
        ValueTag::from_u32(self.tag).unwrap_or(ValueTag::None)
    }

    pub fn is_none(&self) -> bool {
        self.tag == ValueTag::None as u32
    }

    /// Raw payload words, regardless of tag
    pub fn words(&self) -> [u64; 2] {
        // SAFETY: every constructor initializes both words or a pointer in
        // the first word; the second word of a pointer payload is never read
        // for meaning, only copied.
        unsafe { self.payload.words }
    }

    pub fn as_bool(&self) -> Option<bool> {
        (self.tag() == ValueTag::Bool).then(|| self.words()[0] != 0)
    }

    /// Integer payload of an int or enum value
    pub fn as_int(&self) -> Option<i64> {
        matches!(self.tag(), ValueTag::Int | ValueTag::Enum).then(|| self.words()[0] as i64)
    }

    pub fn as_float(&self) -> Option<f64> {
        (self.tag() == ValueTag::Float).then(|| f64::from_bits(self.words()[0]))
    }

    pub fn as_complex(&self) -> Option<Complex> {
        (self.tag() == ValueTag::Complex).then(|| {
            let [re, im] = self.words();
            Complex::new(f64::from_bits(re), f64::from_bits(im))
        })
    }

    /// Heap object pointer, or null for scalars and none
    pub(crate) fn object_ptr(&self) -> *mut ObjectHeader {
        if self.tag().is_heap() {
            // SAFETY: heap tags always carry a pointer payload
            unsafe { self.payload.object }
        } else {
            std::ptr::null_mut()
        }
    }

    /// Truthiness used by the generic `Test` opcode
    pub fn truthy(&self) -> bool {
        match self.tag() {
            ValueTag::None => false,
            ValueTag::Bool | ValueTag::Int | ValueTag::Enum => self.words()[0] != 0,
            ValueTag::Float => f64::from_bits(self.words()[0]) != 0.0,
            ValueTag::Complex => {
                let c = self.as_complex().unwrap_or_default();
                c.re != 0.0 || c.im != 0.0
            }
            ValueTag::String => self.as_bytes().is_some_and(|b| !b.is_empty()),
            _ => true,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::none()
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        let ptr = self.object_ptr();
        if !ptr.is_null() {
            // SAFETY: a heap value holds a reference, so the object is live
            unsafe { (*ptr).retain() };
        }
        Value {
            tag: self.tag,
            _reserved: 0,
            payload: self.payload,
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        let ptr = self.object_ptr();
        if !ptr.is_null() {
            // SAFETY: this value owns one reference to the object
            unsafe { object::release(ptr) };
        }
    }
}

/// Structural identity: floats compare by bit pattern, containers by content.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match self.tag() {
            ValueTag::None => true,
            ValueTag::Bool | ValueTag::Int | ValueTag::Enum | ValueTag::Float => {
                self.words()[0] == other.words()[0]
            }
            ValueTag::Complex => self.words() == other.words(),
            ValueTag::String => self.as_bytes() == other.as_bytes(),
            ValueTag::Array => match (self.array_values(), other.array_values()) {
                (Ok(a), Ok(b)) => a == b && self.array_dims() == other.array_dims(),
                _ => false,
            },
            ValueTag::List => self.list_items() == other.list_items(),
            ValueTag::Tuple => self.tuple_items() == other.tuple_items(),
            ValueTag::Object => self.object_ptr() == other.object_ptr(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            ValueTag::String => write!(f, "{:?}", self.to_string()),
            ValueTag::Enum => write!(f, "enum({})", self.words()[0] as i64),
            _ => write!(f, "{}", self),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            ValueTag::None => f.write_str("none"),
            ValueTag::Bool => write!(f, "{}", self.words()[0] != 0),
            ValueTag::Int | ValueTag::Enum => write!(f, "{}", self.words()[0] as i64),
            ValueTag::Float => write!(f, "{}", f64::from_bits(self.words()[0])),
            ValueTag::Complex => {
                let c = self.as_complex().unwrap_or_default();
                write!(f, "{}{:+}i", c.re, c.im)
            }
            ValueTag::String => {
                let bytes = self.as_bytes().unwrap_or_default();
                f.write_str(&String::from_utf8_lossy(bytes))
            }
            ValueTag::Array => match self.array_values() {
                Ok(items) => write_seq(f, "[", &items, "]"),
                Err(_) => f.write_str("[?]"),
            },
            ValueTag::List => write_seq(f, "{", &self.list_items().unwrap_or_default(), "}"),
            ValueTag::Tuple => write_seq(f, "(", &self.tuple_items().unwrap_or_default(), ")"),
            ValueTag::Object => write!(f, "object#{}", self.class_id().unwrap_or(0)),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}
