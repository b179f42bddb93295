//! Reference-counted heap objects
//!
//! Every object starts with an [`ObjectHeader`] so a `*mut ObjectHeader`
//! stored in a value payload can be cast to the concrete `#[repr(C)]` type
//! named by `header.kind`. Compiled code reads several of these fields
//! directly (array size, data, dims; string length and bytes; tuple items;
//! instance fields), so field order is part of the JIT ABI.

use std::mem::ManuallyDrop;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::vm::error::ErrorCode;
use crate::vm::ops::normalize_index;
use crate::vm::types::ElementKind;
use crate::vm::value::{Complex, Value, ValueTag};

/// Common prefix of all heap objects
#[repr(C)]
pub struct ObjectHeader {
    /// `ValueTag` of the object
    pub kind: u32,
    refs: AtomicU32,
}

impl ObjectHeader {
    fn new(kind: ValueTag) -> Self {
        ObjectHeader {
            kind: kind as u32,
            refs: AtomicU32::new(1),
        }
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Current number of values referencing the object
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Drop one reference, freeing the object when it was the last.
///
/// # Safety
/// `ptr` must point to a live object and the caller must own one reference.
pub(crate) unsafe fn release(ptr: *mut ObjectHeader) {
    if (*ptr).refs.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    fence(Ordering::Acquire);
    match ValueTag::from_u32((*ptr).kind) {
        Some(ValueTag::String) => drop(Box::from_raw(ptr as *mut StringObj)),
        Some(ValueTag::Array) => drop(Box::from_raw(ptr as *mut ArrayObj)),
        Some(ValueTag::List) => drop(Box::from_raw(ptr as *mut ListObj)),
        Some(ValueTag::Tuple) => drop(Box::from_raw(ptr as *mut TupleObj)),
        Some(ValueTag::Object) => drop(Box::from_raw(ptr as *mut InstanceObj)),
        _ => debug_assert!(false, "release of non-heap kind {}", (*ptr).kind),
    }
}

fn leak_vec<T>(items: Vec<T>) -> (*mut T, usize, usize) {
    let mut items = ManuallyDrop::new(items);
    (items.as_mut_ptr(), items.len(), items.capacity())
}

fn leak_slice<T>(items: Vec<T>) -> *mut T {
    Box::into_raw(items.into_boxed_slice()) as *mut T
}

/// # Safety
/// `data` must come from `leak_slice` with exactly `len` items.
unsafe fn free_slice<T>(data: *mut T, len: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)));
}

// ============================================================================
// Strings
// ============================================================================

/// Byte string
#[repr(C)]
pub struct StringObj {
    pub header: ObjectHeader,
    pub len: i64,
    pub data: *mut u8,
    cap: usize,
}

impl StringObj {
    fn boxed(bytes: Vec<u8>) -> *mut ObjectHeader {
        let (data, len, cap) = leak_vec(bytes);
        Box::into_raw(Box::new(StringObj {
            header: ObjectHeader::new(ValueTag::String),
            len: len as i64,
            data,
            cap,
        })) as *mut ObjectHeader
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: data/len/cap come from a leaked Vec<u8> owned by self
        unsafe { slice::from_raw_parts(self.data, self.len as usize) }
    }
}

impl Drop for StringObj {
    fn drop(&mut self) {
        // SAFETY: reconstitutes the Vec leaked in `boxed`
        unsafe { drop(Vec::from_raw_parts(self.data, self.len as usize, self.cap)) };
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// Dense numeric array, row-major
///
/// `dims` holds `2 * ndim` entries: the dimension sizes followed by the
/// accumulated strides (in elements). A slice view has `original` set and a
/// null `data` until [`reslice`] copies its window out of the base array.
#[repr(C)]
pub struct ArrayObj {
    pub header: ObjectHeader,
    /// `ValueTag` of the elements
    pub elem: u32,
    _reserved: u32,
    /// Element count
    pub size: i64,
    pub data: *mut u64,
    pub ndim: i64,
    pub dims: *mut i64,
    /// Base array of an unmaterialized slice view
    pub original: *mut ObjectHeader,
    data_cap: usize,
    slice_starts: *mut i64,
}

/// Row-major strides for the given shape
pub fn strides_for(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}

fn shape_block(shape: &[i64]) -> *mut i64 {
    let mut block = shape.to_vec();
    block.extend(strides_for(shape));
    leak_slice(block)
}

impl ArrayObj {
    fn boxed(kind: ElementKind, words: Vec<u64>, shape: &[i64]) -> *mut ObjectHeader {
        let size: i64 = shape.iter().product();
        debug_assert_eq!(words.len(), size as usize * kind.words());
        let (data, _, data_cap) = leak_vec(words);
        Box::into_raw(Box::new(ArrayObj {
            header: ObjectHeader::new(ValueTag::Array),
            elem: kind.tag() as u32,
            _reserved: 0,
            size,
            data,
            ndim: shape.len() as i64,
            dims: shape_block(shape),
            original: ptr::null_mut(),
            data_cap,
            slice_starts: ptr::null_mut(),
        })) as *mut ObjectHeader
    }

    pub fn kind(&self) -> ElementKind {
        ElementKind::from_tag(self.elem).unwrap_or(ElementKind::Int)
    }

    pub fn shape(&self) -> &[i64] {
        // SAFETY: dims holds 2 * ndim entries
        unsafe { slice::from_raw_parts(self.dims, self.ndim as usize) }
    }

    pub fn strides(&self) -> &[i64] {
        // SAFETY: dims holds 2 * ndim entries
        unsafe { slice::from_raw_parts(self.dims.add(self.ndim as usize), self.ndim as usize) }
    }

    pub fn is_view(&self) -> bool {
        !self.original.is_null()
    }

    fn word_len(&self) -> usize {
        self.size as usize * self.kind().words()
    }

    /// Element payload words at a flat offset. The array must be materialized.
    pub(crate) fn element(&self, flat: usize) -> [u64; 2] {
        let w = self.kind().words();
        // SAFETY: callers bounds-check `flat` against `size`
        unsafe {
            let p = self.data.add(flat * w);
            [*p, if w == 2 { *p.add(1) } else { 0 }]
        }
    }

    /// Store element payload words at a flat offset. The array must be materialized.
    pub(crate) fn set_element(&self, flat: usize, words: [u64; 2]) {
        let w = self.kind().words();
        // SAFETY: callers bounds-check `flat` against `size`; data is only
        // reached through the raw pointer
        unsafe {
            let p = self.data.add(flat * w);
            *p = words[0];
            if w == 2 {
                *p.add(1) = words[1];
            }
        }
    }

    /// Flat offset for a single (possibly negative) index over the whole array
    pub(crate) fn flat_index(&self, index: i64) -> Result<usize, ErrorCode> {
        normalize_index(index, self.size).ok_or(ErrorCode::Index)
    }

    /// Flat offset for one index per dimension
    pub(crate) fn flat_multi_index(&self, indices: &[i64]) -> Result<usize, ErrorCode> {
        if indices.len() != self.ndim as usize {
            return Err(ErrorCode::Index);
        }
        let mut flat = 0usize;
        for ((&index, &dim), &stride) in indices.iter().zip(self.shape()).zip(self.strides()) {
            flat += normalize_index(index, dim).ok_or(ErrorCode::Index)? * stride as usize;
        }
        Ok(flat)
    }
}

impl Drop for ArrayObj {
    fn drop(&mut self) {
        let ndim = self.ndim as usize;
        // SAFETY: each buffer was leaked by this module with these lengths
        unsafe {
            if !self.data.is_null() {
                drop(Vec::from_raw_parts(self.data, self.word_len(), self.data_cap));
            }
            free_slice(self.dims, 2 * ndim);
            if !self.slice_starts.is_null() {
                free_slice(self.slice_starts, ndim);
            }
            if !self.original.is_null() {
                release(self.original);
            }
        }
    }
}

/// Materialize a slice view: copy its window out of the base array and
/// detach from it. Fails with an index error when the base array shrank
/// below the window since the view was taken. No-op for plain arrays.
///
/// # Safety
/// `this` must point to a live array.
pub unsafe fn reslice(this: *mut ArrayObj) -> Result<(), ErrorCode> {
    if (*this).original.is_null() {
        return Ok(());
    }
    let base = (*this).original as *mut ArrayObj;
    reslice(base)?;

    let ndim = (*this).ndim as usize;
    if (*base).ndim as usize != ndim {
        return Err(ErrorCode::Index);
    }
    let starts = slice::from_raw_parts((*this).slice_starts, ndim).to_vec();
    let counts = (*this).shape().to_vec();
    let base_shape = (*base).shape();
    let base_strides = (*base).strides();
    for k in 0..ndim {
        if starts[k] + counts[k] > base_shape[k] {
            return Err(ErrorCode::Index);
        }
    }

    let kind = (*this).kind();
    let mut words = Vec::with_capacity((*this).word_len());
    if ndim == 0 {
        words.extend_from_slice(&(*base).element(0)[..kind.words()]);
    } else if (*this).size > 0 {
        let mut cursor = vec![0i64; ndim];
        loop {
            let flat: i64 = (0..ndim).map(|k| (starts[k] + cursor[k]) * base_strides[k]).sum();
            let element = (*base).element(flat as usize);
            words.extend_from_slice(&element[..kind.words()]);
            // Odometer increment, last dimension fastest
            let mut k = ndim;
            while k > 0 {
                k -= 1;
                cursor[k] += 1;
                if cursor[k] < counts[k] {
                    break;
                }
                cursor[k] = 0;
            }
            if k == 0 && cursor[0] == 0 {
                break;
            }
        }
    }

    let (data, _, data_cap) = leak_vec(words);
    (*this).data = data;
    (*this).data_cap = data_cap;
    free_slice((*this).slice_starts, ndim);
    (*this).slice_starts = ptr::null_mut();
    let original = (*this).original;
    (*this).original = ptr::null_mut();
    release(original);
    Ok(())
}

// ============================================================================
// Lists, tuples, instances
// ============================================================================

/// Growable list of values
#[repr(C)]
pub struct ListObj {
    pub header: ObjectHeader,
    pub len: i64,
    pub items: *mut Value,
    cap: usize,
}

impl ListObj {
    pub fn items(&self) -> &[Value] {
        // SAFETY: items/len/cap come from a leaked Vec<Value>
        unsafe { slice::from_raw_parts(self.items, self.len as usize) }
    }
}

impl Drop for ListObj {
    fn drop(&mut self) {
        // SAFETY: reconstitutes the leaked Vec, dropping every item
        unsafe { drop(Vec::from_raw_parts(self.items, self.len as usize, self.cap)) };
    }
}

/// Fixed-size tuple
#[repr(C)]
pub struct TupleObj {
    pub header: ObjectHeader,
    pub len: i64,
    pub items: *mut Value,
}

impl Drop for TupleObj {
    fn drop(&mut self) {
        // SAFETY: items was leaked as a boxed slice of len values
        unsafe { free_slice(self.items, self.len as usize) };
    }
}

/// Class instance with a fixed field array
#[repr(C)]
pub struct InstanceObj {
    pub header: ObjectHeader,
    pub class_id: u32,
    _reserved: u32,
    pub nfields: i64,
    pub fields: *mut Value,
}

impl Drop for InstanceObj {
    fn drop(&mut self) {
        // SAFETY: fields was leaked as a boxed slice of nfields values
        unsafe { free_slice(self.fields, self.nfields as usize) };
    }
}

// ============================================================================
// Value constructors and accessors
// ============================================================================

impl Value {
    pub fn string(s: &str) -> Value {
        Value::from_bytes(s.as_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Value {
        // SAFETY: fresh object with one reference handed to the value
        unsafe { Value::from_object(ValueTag::String, StringObj::boxed(bytes)) }
    }

    /// Array from raw element words (two words per complex element)
    pub(crate) fn array_from_words(kind: ElementKind, words: Vec<u64>, shape: &[i64]) -> Value {
        // SAFETY: fresh object with one reference handed to the value
        unsafe { Value::from_object(ValueTag::Array, ArrayObj::boxed(kind, words, shape)) }
    }

    /// Zero-filled array
    pub fn zeros(kind: ElementKind, shape: &[i64]) -> Value {
        let size: i64 = shape.iter().product();
        Value::array_from_words(kind, vec![0; size as usize * kind.words()], shape)
    }

    pub fn int_array(values: &[i64], shape: &[i64]) -> Value {
        assert_eq!(values.len() as i64, shape.iter().product::<i64>(), "shape mismatch");
        Value::array_from_words(ElementKind::Int, values.iter().map(|&v| v as u64).collect(), shape)
    }

    pub fn float_array(values: &[f64], shape: &[i64]) -> Value {
        assert_eq!(values.len() as i64, shape.iter().product::<i64>(), "shape mismatch");
        Value::array_from_words(ElementKind::Float, values.iter().map(|v| v.to_bits()).collect(), shape)
    }

    pub fn complex_array(values: &[Complex], shape: &[i64]) -> Value {
        assert_eq!(values.len() as i64, shape.iter().product::<i64>(), "shape mismatch");
        let words = values.iter().flat_map(|c| [c.re.to_bits(), c.im.to_bits()]).collect();
        Value::array_from_words(ElementKind::Complex, words, shape)
    }

    pub fn list(items: Vec<Value>) -> Value {
        let (items, len, cap) = leak_vec(items);
        let obj = Box::into_raw(Box::new(ListObj {
            header: ObjectHeader::new(ValueTag::List),
            len: len as i64,
            items,
            cap,
        }));
        // SAFETY: fresh object with one reference handed to the value
        unsafe { Value::from_object(ValueTag::List, obj as *mut ObjectHeader) }
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        let len = items.len() as i64;
        let obj = Box::into_raw(Box::new(TupleObj {
            header: ObjectHeader::new(ValueTag::Tuple),
            len,
            items: leak_slice(items),
        }));
        // SAFETY: fresh object with one reference handed to the value
        unsafe { Value::from_object(ValueTag::Tuple, obj as *mut ObjectHeader) }
    }

    pub fn instance(class_id: u32, fields: Vec<Value>) -> Value {
        let nfields = fields.len() as i64;
        let obj = Box::into_raw(Box::new(InstanceObj {
            header: ObjectHeader::new(ValueTag::Object),
            class_id,
            _reserved: 0,
            nfields,
            fields: leak_slice(fields),
        }));
        // SAFETY: fresh object with one reference handed to the value
        unsafe { Value::from_object(ValueTag::Object, obj as *mut ObjectHeader) }
    }

    fn object_of(&self, tag: ValueTag) -> *mut ObjectHeader {
        if self.tag() == tag {
            self.object_ptr()
        } else {
            ptr::null_mut()
        }
    }

    pub(crate) fn string_obj(&self) -> *mut StringObj {
        self.object_of(ValueTag::String) as *mut StringObj
    }

    pub(crate) fn array_obj(&self) -> *mut ArrayObj {
        self.object_of(ValueTag::Array) as *mut ArrayObj
    }

    pub(crate) fn list_obj(&self) -> *mut ListObj {
        self.object_of(ValueTag::List) as *mut ListObj
    }

    pub(crate) fn tuple_obj(&self) -> *mut TupleObj {
        self.object_of(ValueTag::Tuple) as *mut TupleObj
    }

    pub(crate) fn instance_obj(&self) -> *mut InstanceObj {
        self.object_of(ValueTag::Object) as *mut InstanceObj
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        let obj = self.string_obj();
        // SAFETY: the value holds a reference for the borrow's duration
        (!obj.is_null()).then(|| unsafe { (*obj).as_bytes() })
    }

    /// Number of values sharing this heap object (0 for scalars)
    pub fn ref_count(&self) -> u32 {
        let ptr = self.object_ptr();
        // SAFETY: the value holds a reference
        if ptr.is_null() { 0 } else { unsafe { (*ptr).ref_count() } }
    }

    pub fn array_kind(&self) -> Option<ElementKind> {
        let obj = self.array_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null()).then(|| unsafe { (*obj).kind() })
    }

    pub fn array_dims(&self) -> Option<Vec<i64>> {
        let obj = self.array_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null()).then(|| unsafe { (*obj).shape().to_vec() })
    }

    /// Whether the array is a slice view not yet materialized
    pub fn is_slice_view(&self) -> bool {
        let obj = self.array_obj();
        // SAFETY: the value holds a reference
        !obj.is_null() && unsafe { (*obj).is_view() }
    }

    /// Elements in row-major order, materializing a slice view first
    pub fn array_values(&self) -> Result<Vec<Value>, ErrorCode> {
        let obj = self.array_obj();
        if obj.is_null() {
            return Err(ErrorCode::Value);
        }
        // SAFETY: the value holds a reference
        unsafe {
            reslice(obj)?;
            let kind = (*obj).kind();
            Ok((0..(*obj).size as usize)
                .map(|i| element_value(kind, (*obj).element(i)))
                .collect())
        }
    }

    /// View of a rectangular window `(start, count)` per dimension
    pub fn array_slice(&self, window: &[(i64, i64)]) -> Result<Value, ErrorCode> {
        let base = self.array_obj();
        if base.is_null() {
            return Err(ErrorCode::Value);
        }
        // SAFETY: the value holds a reference to the base array
        unsafe {
            reslice(base)?;
            let shape = (*base).shape();
            if window.len() != shape.len() {
                return Err(ErrorCode::Shape);
            }
            for (&(start, count), &dim) in window.iter().zip(shape) {
                if start < 0 || count < 0 || start + count > dim {
                    return Err(ErrorCode::Index);
                }
            }
            (*base).header.retain();
            let counts: Vec<i64> = window.iter().map(|w| w.1).collect();
            let starts: Vec<i64> = window.iter().map(|w| w.0).collect();
            let obj = Box::into_raw(Box::new(ArrayObj {
                header: ObjectHeader::new(ValueTag::Array),
                elem: (*base).elem,
                _reserved: 0,
                size: counts.iter().product(),
                data: ptr::null_mut(),
                ndim: counts.len() as i64,
                dims: shape_block(&counts),
                original: base as *mut ObjectHeader,
                data_cap: 0,
                slice_starts: leak_slice(starts),
            }));
            Ok(Value::from_object(ValueTag::Array, obj as *mut ObjectHeader))
        }
    }

    /// Resize a one-dimensional array in place, zero-filling new elements
    pub fn array_resize(&self, len: i64) -> Result<(), ErrorCode> {
        let obj = self.array_obj();
        if obj.is_null() || len < 0 {
            return Err(ErrorCode::Value);
        }
        // SAFETY: the value holds a reference; buffers are swapped through
        // raw pointers only
        unsafe {
            reslice(obj)?;
            if (*obj).ndim != 1 {
                return Err(ErrorCode::Shape);
            }
            let mut words = Vec::from_raw_parts((*obj).data, (*obj).word_len(), (*obj).data_cap);
            words.resize(len as usize * (*obj).kind().words(), 0);
            let (data, _, data_cap) = leak_vec(words);
            (*obj).data = data;
            (*obj).data_cap = data_cap;
            (*obj).size = len;
            *(*obj).dims = len;
        }
        Ok(())
    }

    pub fn list_items(&self) -> Option<Vec<Value>> {
        let obj = self.list_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null()).then(|| unsafe { (*obj).items().to_vec() })
    }

    pub fn tuple_items(&self) -> Option<Vec<Value>> {
        let obj = self.tuple_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null())
            .then(|| unsafe { slice::from_raw_parts((*obj).items, (*obj).len as usize).to_vec() })
    }

    pub fn instance_fields(&self) -> Option<Vec<Value>> {
        let obj = self.instance_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null())
            .then(|| unsafe { slice::from_raw_parts((*obj).fields, (*obj).nfields as usize).to_vec() })
    }

    pub fn class_id(&self) -> Option<u32> {
        let obj = self.instance_obj();
        // SAFETY: the value holds a reference
        (!obj.is_null()).then(|| unsafe { (*obj).class_id })
    }
}

/// Build a scalar value from element payload words
pub(crate) fn element_value(kind: ElementKind, words: [u64; 2]) -> Value {
    match kind {
        ElementKind::Int => Value::int(words[0] as i64),
        ElementKind::Float => Value::float(f64::from_bits(words[0])),
        ElementKind::Complex => {
            Value::complex(Complex::new(f64::from_bits(words[0]), f64::from_bits(words[1])))
        }
    }
}
