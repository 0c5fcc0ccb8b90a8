use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_complex::{Complex32, Complex64};
use num_traits::ToPrimitive;

/// Past this depth `Display` stops descending. Memo references can
/// make the graph cyclic.
const MAX_DEPTH: usize = 250;

#[derive(Debug, Clone, Copy)]
/// An integer that remembers the width it was decoded at.
/// Comparison is by numeric value, not by width.
pub enum Int {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
}

impl Int {
    pub fn get(self) -> i128 {
        match self {
            Int::I8(n) => n.into(),
            Int::U8(n) => n.into(),
            Int::I16(n) => n.into(),
            Int::U16(n) => n.into(),
            Int::I32(n) => n.into(),
            Int::U32(n) => n.into(),
            Int::I64(n) => n.into(),
            Int::U64(n) => n.into(),
        }
    }

    /// Width of the encoding in bytes.
    pub fn width(self) -> usize {
        match self {
            Int::I8(_) | Int::U8(_) => 1,
            Int::I16(_) | Int::U16(_) => 2,
            Int::I32(_) | Int::U32(_) => 4,
            Int::I64(_) | Int::U64(_) => 8,
        }
    }
}

impl PartialEq for Int {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// The hashable part of a dict key. Two keys are equal as values exactly
/// when their projections are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DictKey {
    None,
    Bool(bool),
    Int(i128),
    BigInt(BigInt),
    /// Bit pattern, with `-0.0` folded into `0.0`.
    Float(u64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    /// `None` for keys that can't be hashed: containers, arrays, complex
    /// numbers and NaN. Those are found by comparing one at a time.
    fn of(key: &Value) -> Option<Self> {
        Some(match key {
            Value::None => DictKey::None,
            Value::Bool(b) => DictKey::Bool(*b),
            Value::Int(n) => DictKey::Int(n.get()),
            Value::BigInt(n) => DictKey::BigInt(n.clone()),
            Value::Float(f) if f.is_nan() => return None,
            Value::Float(f) if *f == 0.0 => DictKey::Float(0),
            Value::Float(f) => DictKey::Float(f.to_bits()),
            Value::String(s) => DictKey::String(s.clone()),
            Value::Bytes(b) => DictKey::Bytes(b.clone()),
            Value::Tuple(items) => {
                DictKey::Tuple(items.iter().map(DictKey::of).collect::<Option<_>>()?)
            }
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default)]
/// An insertion-ordered mapping. Inserting an existing key replaces the
/// value but keeps the key where it was first inserted.
pub struct PickleDict {
    entries: Vec<(Value, Value)>,
    /// Position in `entries` of every hashable key.
    index: IndexMap<DictKey, usize>,
    /// Positions of the keys that aren't.
    unhashed: Vec<usize>,
}

impl PickleDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: IndexMap::with_capacity(capacity),
            unhashed: Vec::new(),
        }
    }

    fn position(&self, key: &Value) -> Option<usize> {
        match DictKey::of(key) {
            Some(hashed) => self.index.get(&hashed).copied(),
            None => self
                .unhashed
                .iter()
                .copied()
                .find(|&idx| self.entries[idx].0 == *key),
        }
    }

    /// Returns the previous value for `key`, if there was one.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        if let Some(idx) = self.position(&key) {
            return Some(std::mem::replace(&mut self.entries[idx].1, value));
        }
        let idx = self.entries.len();
        match DictKey::of(&key) {
            Some(hashed) => {
                self.index.insert(hashed, idx);
            }
            None => self.unhashed.push(idx),
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    /// Convenience lookup for the common string-keyed case.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.index
            .get(&DictKey::String(key.to_owned()))
            .map(|&idx| &self.entries[idx].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.entries.iter_mut().map(|(_, v)| v)
    }
}

impl PartialEq for PickleDict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl FromIterator<(Value, Value)> for PickleDict {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut dict = PickleDict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl IntoIterator for PickleDict {
    type Item = (Value, Value);

    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A fixed-width element that can be read straight out of a byte buffer.
pub trait Element: Copy + Sized {
    const WIDTH: usize;

    /// Read one element in host byte order. `bytes` is exactly `WIDTH` long.
    fn from_ne_slice(bytes: &[u8]) -> Self;

    /// Reverse the byte order of each scalar component.
    fn swap_bytes(self) -> Self;

    /// Box into a [`Value`].
    fn into_value(self) -> Value;

    /// Convert from a boxed number, as found in list-encoded arrays.
    fn from_value(val: &Value) -> Option<Self>;

    fn into_vector(items: Vec<Self>) -> TypedVector;
}

macro_rules! int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn from_ne_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_ne_bytes(buf)
            }

            fn swap_bytes(self) -> Self {
                <$t>::swap_bytes(self)
            }

            fn into_value(self) -> Value {
                Value::Int(Int::$variant(self))
            }

            fn from_value(val: &Value) -> Option<Self> {
                match val {
                    Value::Float(f) => Some(*f as $t),
                    val => val.as_i128().map(|n| n as $t),
                }
            }

            fn into_vector(items: Vec<Self>) -> TypedVector {
                TypedVector::$variant(items)
            }
        }
    };
}

int_element!(i8, I8);
int_element!(u8, U8);
int_element!(i16, I16);
int_element!(u16, U16);
int_element!(i32, I32);
int_element!(u32, U32);
int_element!(i64, I64);
int_element!(u64, U64);

macro_rules! float_element {
    ($t:ty, $bits:ty, $variant:ident) => {
        impl Element for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn from_ne_slice(bytes: &[u8]) -> Self {
                <$t>::from_bits(<$bits>::from_ne_slice(bytes))
            }

            fn swap_bytes(self) -> Self {
                <$t>::from_bits(self.to_bits().swap_bytes())
            }

            fn into_value(self) -> Value {
                Value::Float(self.into())
            }

            fn from_value(val: &Value) -> Option<Self> {
                val.as_f64().map(|f| f as $t)
            }

            fn into_vector(items: Vec<Self>) -> TypedVector {
                TypedVector::$variant(items)
            }
        }
    };
}

float_element!(f32, u32, F32);
float_element!(f64, u64, F64);

macro_rules! complex_element {
    ($t:ty, $part:ty, $variant:ident) => {
        impl Element for $t {
            const WIDTH: usize = 2 * std::mem::size_of::<$part>();

            fn from_ne_slice(bytes: &[u8]) -> Self {
                let (re, im) = bytes.split_at(std::mem::size_of::<$part>());
                <$t>::new(<$part>::from_ne_slice(re), <$part>::from_ne_slice(im))
            }

            fn swap_bytes(self) -> Self {
                <$t>::new(
                    Element::swap_bytes(self.re),
                    Element::swap_bytes(self.im),
                )
            }

            fn into_value(self) -> Value {
                Value::Complex(Complex64::new(self.re.into(), self.im.into()))
            }

            fn from_value(val: &Value) -> Option<Self> {
                match val {
                    Value::Complex(c) => Some(<$t>::new(c.re as $part, c.im as $part)),
                    val => val.as_f64().map(|f| <$t>::new(f as $part, 0.0)),
                }
            }

            fn into_vector(items: Vec<Self>) -> TypedVector {
                TypedVector::$variant(items)
            }
        }
    };
}

complex_element!(Complex32, f32, C64);
complex_element!(Complex64, f64, C128);

/// Read a buffer of packed host-order elements, swapping each one in place
/// afterwards when the data was written with the other byte order.
/// Trailing bytes that don't make up a whole element are ignored.
pub fn decode_elements<T: Element>(bytes: &[u8], swap: bool) -> Vec<T> {
    let mut items: Vec<T> = bytes.chunks_exact(T::WIDTH).map(T::from_ne_slice).collect();
    if swap {
        items.iter_mut().for_each(|e| *e = e.swap_bytes());
    }
    items
}

#[derive(Debug, Clone, PartialEq)]
/// A contiguous, homogeneously typed numeric array.
pub enum TypedVector {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    C64(Vec<Complex32>),
    C128(Vec<Complex64>),
}

macro_rules! each_vector {
    ($vec:expr, $items:ident => $body:expr) => {
        match $vec {
            TypedVector::I8($items) => $body,
            TypedVector::U8($items) => $body,
            TypedVector::I16($items) => $body,
            TypedVector::U16($items) => $body,
            TypedVector::I32($items) => $body,
            TypedVector::U32($items) => $body,
            TypedVector::I64($items) => $body,
            TypedVector::U64($items) => $body,
            TypedVector::F32($items) => $body,
            TypedVector::F64($items) => $body,
            TypedVector::C64($items) => $body,
            TypedVector::C128($items) => $body,
        }
    };
}

impl TypedVector {
    pub fn len(&self) -> usize {
        each_vector!(self, items => items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// NumPy style element type: kind letter plus width in bytes.
    pub fn type_code(&self) -> &'static str {
        match self {
            TypedVector::I8(_) => "i1",
            TypedVector::U8(_) => "u1",
            TypedVector::I16(_) => "i2",
            TypedVector::U16(_) => "u2",
            TypedVector::I32(_) => "i4",
            TypedVector::U32(_) => "u4",
            TypedVector::I64(_) => "i8",
            TypedVector::U64(_) => "u8",
            TypedVector::F32(_) => "f4",
            TypedVector::F64(_) => "f8",
            TypedVector::C64(_) => "c8",
            TypedVector::C128(_) => "c16",
        }
    }

    pub fn get(&self, idx: usize) -> Option<Value> {
        each_vector!(self, items => items.get(idx).map(|e| e.into_value()))
    }

    /// Box every element, for callers that want a plain list.
    pub fn to_values(&self) -> Vec<Value> {
        each_vector!(self, items => items.iter().map(|e| e.into_value()).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded value.
///
/// Mutable containers sit behind `Rc<RefCell<..>>` so a memo back-reference
/// and the source are the same object: appending through one is visible
/// through the other.
pub enum Value {
    /// Python `None`.
    None,

    Bool(bool),

    Int(Int),

    /// An integer that came in as a Python long.
    BigInt(BigInt),

    Float(f64),

    Complex(Complex64),

    /// A byte string that happened to be valid UTF8.
    String(String),

    /// A byte string that wasn't.
    Bytes(Vec<u8>),

    List(Rc<RefCell<Vec<Value>>>),

    Tuple(Rc<Vec<Value>>),

    Dict(Rc<RefCell<PickleDict>>),

    /// A `collections.OrderedDict`.
    OrderedDict(Rc<RefCell<PickleDict>>),

    /// A typed numeric array (Numeric, `array.array` or NumPy).
    Vector(Rc<TypedVector>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(dict: PickleDict) -> Self {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn ordered_dict(dict: PickleDict) -> Self {
        Value::OrderedDict(Rc::new(RefCell::new(dict)))
    }

    pub fn vector(vec: TypedVector) -> Self {
        Value::Vector(Rc::new(vec))
    }

    /// Make a pickle byte string, preferring `String` when it's UTF8.
    pub fn from_byte_string(b: &[u8]) -> Self {
        match std::str::from_utf8(b) {
            Ok(s) => Value::String(s.to_owned()),
            Err(_) => Value::Bytes(b.to_vec()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::BigInt(_) => "long",
            Value::Float(_) => "float",
            Value::Complex(_) => "complex",
            Value::String(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::OrderedDict(_) => "OrderedDict",
            Value::Vector(_) => "array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes of either kind of byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(n.get()),
            Value::Bool(b) => Some(i128::from(*b)),
            Value::BigInt(n) => n.to_i128(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|n| i64::try_from(n).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::BigInt(n) => n.to_f64(),
            val => val.as_i128().map(|n| n as f64),
        }
    }

    /// Python truthiness for the scalar types; containers are truthy
    /// when non-empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => n.get() != 0,
            Value::BigInt(n) => n.sign() != num_bigint::Sign::NoSign,
            Value::Float(f) => *f != 0.0,
            Value::Complex(c) => c.re != 0.0 || c.im != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) | Value::OrderedDict(d) => !d.borrow().is_empty(),
            Value::Vector(v) => !v.is_empty(),
        }
    }

    /// Whether both values are the same shared object, as happens with
    /// memo back-references. Scalars are never identical.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::OrderedDict(a), Value::OrderedDict(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn write_repr(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth >= MAX_DEPTH {
            return write!(f, "...");
        }
        let seq = |f: &mut fmt::Formatter<'_>, items: &[Value]| -> fmt::Result {
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                item.write_repr(f, depth + 1)?;
            }
            Ok(())
        };
        let pairs = |f: &mut fmt::Formatter<'_>, dict: &PickleDict, sep: &str| -> fmt::Result {
            for (idx, (k, v)) in dict.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                k.write_repr(f, depth + 1)?;
                write!(f, "{sep}")?;
                v.write_repr(f, depth + 1)?;
            }
            Ok(())
        };
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{n}"),
            Value::BigInt(n) => write!(f, "{n}L"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Complex(c) => write!(f, "({:?}{:+?}j)", c.re, c.im),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b\"{}\"", b.escape_ascii()),
            Value::List(items) => {
                write!(f, "[")?;
                seq(f, &items.borrow()[..])?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                seq(f, &items[..])?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Dict(dict) => {
                write!(f, "{{")?;
                pairs(f, &dict.borrow(), ": ")?;
                write!(f, "}}")
            }
            Value::OrderedDict(dict) => {
                write!(f, "OrderedDict([")?;
                for (idx, (k, v)) in dict.borrow().iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "(")?;
                    k.write_repr(f, depth + 1)?;
                    write!(f, ", ")?;
                    v.write_repr(f, depth + 1)?;
                    write!(f, ")")?;
                }
                write!(f, "])")
            }
            Value::Vector(vec) => {
                write!(f, "array({:?}, [", vec.type_code())?;
                seq(f, &vec.to_values()[..])?;
                write!(f, "])")
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_repr(f, 0)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Int> for Value {
    fn from(n: Int) -> Self {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(Int::I64(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(Int::I32(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::BigInt(n)
    }
}

impl From<Complex64> for Value {
    fn from(c: Complex64) -> Self {
        Value::Complex(c)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<TypedVector> for Value {
    fn from(vec: TypedVector) -> Self {
        Value::vector(vec)
    }
}
