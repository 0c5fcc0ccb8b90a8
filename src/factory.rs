//! Reconstruction of "foreign" objects.
//!
//! When the stream says `REDUCE` or `BUILD`, the global name on the stack
//! is looked up here. A REDUCE factory gets `(name, args, env)` and returns
//! the new value. A BUILD factory gets the type-object sitting under the
//! state and changes it in place.
//!
//! User classes can be taught to the loader like this:
//!
//! ```rust
//! use pickle_loader::{Unpickler, Value};
//!
//! let mut up = Unpickler::new(b"c__main__\nPoint\n(K\x01K\x02tR.");
//! up.register("__main__\nPoint\n", |_name, args, _env| {
//!     Ok(Value::list(args.as_tuple().unwrap_or_default().to_vec()))
//! });
//! let val = up.loads().unwrap();
//! assert_eq!(val, Value::list(vec![Value::from(1i64), Value::from(2i64)]));
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::{bail, ensure, Result};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_complex::Complex64;
use once_cell::sync::Lazy;

use crate::{
    error::ErrorKind,
    numeric, numpy,
    value::{PickleDict, Value},
};

/// Global names the built-in factories answer to. A GLOBAL opcode
/// produces `module + "\n" + name + "\n"`.
pub mod names {
    pub const COMPLEX: &str = "__builtin__\ncomplex\n";
    pub const COMPLEX_PY3: &str = "builtins\ncomplex\n";
    pub const LONG: &str = "__builtin__\nlong\n";
    pub const ORDERED_DICT: &str = "collections\nOrderedDict\n";
    pub const NUMERIC_ARRAY: &str = "Numeric\narray_constructor\n";
    pub const ARRAY: &str = "array\narray\n";
    pub const NUMPY_RECONSTRUCT: &str = "numpy.core.multiarray\n_reconstruct\n";
    pub const NUMPY2_RECONSTRUCT: &str = "numpy._core.multiarray\n_reconstruct\n";
    pub const NUMPY_DTYPE: &str = "numpy\ndtype\n";
}

/// Downgrade OrderedDict and typed-vector results to plain dicts and lists.
pub const COMPATIBILITY: &str = "compatibility";

/// Let legacy Numeric arrays come out as typed vectors.
pub const SUPPORTS_NUMERIC: &str = "supportsNumeric";

#[derive(Debug, Clone, Default, PartialEq)]
/// Decode-time flags handed to every factory. Factories may change it;
/// whatever they leave behind is visible after the decode.
pub struct Environment(IndexMap<String, Value>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), val.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// A flag is set when the key is present with a truthy value.
    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(Value::is_truthy)
    }

    pub fn compatibility(&self) -> bool {
        self.flag(COMPATIBILITY)
    }

    pub fn supports_numeric(&self) -> bool {
        self.flag(SUPPORTS_NUMERIC)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Signature of a caller-supplied REDUCE factory: `(name, args, env)`.
pub type ReduceFn = dyn Fn(&Value, &Value, &mut Environment) -> Result<Value> + Send + Sync;

/// Signature of a caller-supplied BUILD mutator: `(type_object, state, env)`.
pub type BuildFn = dyn Fn(&mut Value, Value, &mut Environment) -> Result<()> + Send + Sync;

#[derive(Clone)]
/// Something that can turn `(name, args)` into a value.
pub enum ReduceFactory {
    BigInt,
    Complex,
    OrderedDict,
    NumericArray,
    ArrayModule,
    NumpyReconstruct,
    NumpyDtype,
    UserDefined(Arc<ReduceFn>),
}

impl ReduceFactory {
    pub fn reduce(&self, name: &Value, args: &Value, env: &mut Environment) -> Result<Value> {
        match self {
            ReduceFactory::BigInt => reduce_long(args),
            ReduceFactory::Complex => reduce_complex(args),
            ReduceFactory::OrderedDict => reduce_ordered_dict(args, env),
            ReduceFactory::NumericArray => numeric::reduce_numeric_array(args, env),
            ReduceFactory::ArrayModule => numeric::reduce_array(args, env),
            ReduceFactory::NumpyReconstruct | ReduceFactory::NumpyDtype => {
                numpy::reduce_type_object(name, args)
            }
            ReduceFactory::UserDefined(f) => f(name, args, env),
        }
    }
}

impl fmt::Debug for ReduceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceFactory::BigInt => write!(f, "BigInt"),
            ReduceFactory::Complex => write!(f, "Complex"),
            ReduceFactory::OrderedDict => write!(f, "OrderedDict"),
            ReduceFactory::NumericArray => write!(f, "NumericArray"),
            ReduceFactory::ArrayModule => write!(f, "ArrayModule"),
            ReduceFactory::NumpyReconstruct => write!(f, "NumpyReconstruct"),
            ReduceFactory::NumpyDtype => write!(f, "NumpyDtype"),
            ReduceFactory::UserDefined(_) => write!(f, "UserDefined(..)"),
        }
    }
}

#[derive(Clone)]
/// Something that can finish a type-object in place given its state.
pub enum BuildFactory {
    NumpyReconstruct,
    NumpyDtype,
    UserDefined(Arc<BuildFn>),
}

impl BuildFactory {
    pub fn build(&self, type_object: &mut Value, state: Value, env: &mut Environment) -> Result<()> {
        match self {
            BuildFactory::NumpyReconstruct | BuildFactory::NumpyDtype => {
                numpy::build_type_object(type_object, state)
            }
            BuildFactory::UserDefined(f) => f(type_object, state, env),
        }
    }
}

impl fmt::Debug for BuildFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildFactory::NumpyReconstruct => write!(f, "NumpyReconstruct"),
            BuildFactory::NumpyDtype => write!(f, "NumpyDtype"),
            BuildFactory::UserDefined(_) => write!(f, "UserDefined(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Name-keyed REDUCE and BUILD tables.
pub struct FactoryRegistry {
    reduce: HashMap<String, ReduceFactory>,
    build: HashMap<String, BuildFactory>,
}

static DEFAULT_REGISTRY: Lazy<Arc<FactoryRegistry>> =
    Lazy::new(|| Arc::new(FactoryRegistry::with_builtins()));

impl FactoryRegistry {
    /// An empty registry: every REDUCE and BUILD becomes a placeholder tuple.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Complex, long, OrderedDict, Numeric, `array.array` and NumPy.
    pub fn with_builtins() -> Self {
        use names::*;
        let mut reg = Self::default();
        reg.insert_reduce(COMPLEX, ReduceFactory::Complex);
        reg.insert_reduce(COMPLEX_PY3, ReduceFactory::Complex);
        reg.insert_reduce(LONG, ReduceFactory::BigInt);
        reg.insert_reduce(ORDERED_DICT, ReduceFactory::OrderedDict);
        reg.insert_reduce(NUMERIC_ARRAY, ReduceFactory::NumericArray);
        reg.insert_reduce(ARRAY, ReduceFactory::ArrayModule);
        reg.insert_reduce(NUMPY_RECONSTRUCT, ReduceFactory::NumpyReconstruct);
        reg.insert_reduce(NUMPY2_RECONSTRUCT, ReduceFactory::NumpyReconstruct);
        reg.insert_reduce(NUMPY_DTYPE, ReduceFactory::NumpyDtype);
        reg.insert_build(NUMPY_RECONSTRUCT, BuildFactory::NumpyReconstruct);
        reg.insert_build(NUMPY2_RECONSTRUCT, BuildFactory::NumpyReconstruct);
        reg.insert_build(NUMPY_DTYPE, BuildFactory::NumpyDtype);
        reg
    }

    /// The process-wide built-in registry. Built once, never mutated, so
    /// any number of loaders on any number of threads can share it.
    pub fn shared() -> Arc<FactoryRegistry> {
        Arc::clone(&DEFAULT_REGISTRY)
    }

    pub fn insert_reduce(&mut self, name: impl Into<String>, factory: ReduceFactory) {
        self.reduce.insert(name.into(), factory);
    }

    pub fn insert_build(&mut self, name: impl Into<String>, factory: BuildFactory) {
        self.build.insert(name.into(), factory);
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Value, &mut Environment) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert_reduce(name, ReduceFactory::UserDefined(Arc::new(f)));
    }

    pub fn register_build<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Value, Value, &mut Environment) -> Result<()> + Send + Sync + 'static,
    {
        self.insert_build(name, BuildFactory::UserDefined(Arc::new(f)));
    }

    pub fn reduce_for(&self, name: &str) -> Option<&ReduceFactory> {
        self.reduce.get(name)
    }

    pub fn build_for(&self, name: &str) -> Option<&BuildFactory> {
        self.build.get(name)
    }
}

/// Helper for factories: the args have to be a tuple.
pub(crate) fn expect_tuple<'v>(args: &'v Value, what: &str) -> Result<&'v [Value]> {
    match args.as_tuple() {
        Some(items) => Ok(items),
        None => bail!(ErrorKind::TypeMismatch(format!(
            "{what} expects a tuple, got {}",
            args.type_name()
        ))),
    }
}

/// Either kind of sequence, for payloads that have been seen both ways.
pub(crate) fn expect_sequence(val: &Value, what: &str) -> Result<Vec<Value>> {
    match val {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.to_vec()),
        other => bail!(ErrorKind::TypeMismatch(format!(
            "{what} expects a sequence, got {}",
            other.type_name()
        ))),
    }
}

/// `complex(real, imag)`
fn reduce_complex(args: &Value) -> Result<Value> {
    let items = expect_tuple(args, "complex")?;
    let part = |idx: usize| {
        items.get(idx).and_then(Value::as_f64).ok_or_else(|| {
            ErrorKind::TypeMismatch("complex expects (real, imag) numbers".to_string())
        })
    };
    let re = part(0)?;
    let im = match items.len() {
        1 => 0.0,
        _ => part(1)?,
    };
    Ok(Value::Complex(Complex64::new(re, im)))
}

/// `long(x)` with `x` an int or a decimal string.
fn reduce_long(args: &Value) -> Result<Value> {
    let items = expect_tuple(args, "long")?;
    ensure!(
        items.len() == 1,
        ErrorKind::TypeMismatch("long expects a 1-tuple".to_string())
    );
    Ok(Value::BigInt(match &items[0] {
        Value::Int(n) => BigInt::from(n.get()),
        Value::BigInt(n) => n.clone(),
        Value::Bool(b) => BigInt::from(u8::from(*b)),
        Value::String(s) => parse_long_literal(s)?,
        other => bail!(ErrorKind::TypeMismatch(format!(
            "long expects an int or string, got {}",
            other.type_name()
        ))),
    }))
}

/// Decimal digits with an optional sign and the Python 2 `L` suffix.
pub(crate) fn parse_long_literal(s: &str) -> Result<BigInt> {
    let digits = s.trim();
    let digits = digits.strip_suffix('L').unwrap_or(digits);
    match digits.parse::<BigInt>() {
        Ok(n) => Ok(n),
        Err(_) => bail!(ErrorKind::MalformedLiteral(format!("bad long literal {s:?}"))),
    }
}

/// `OrderedDict([[k, v], ...])`, or `OrderedDict()` when the items come
/// later through SETITEMS.
fn reduce_ordered_dict(args: &Value, env: &mut Environment) -> Result<Value> {
    let items = expect_tuple(args, "OrderedDict")?;
    let dict = match items {
        [] => PickleDict::new(),
        [pairs] => {
            let pairs = expect_sequence(pairs, "OrderedDict")?;
            let mut dict = PickleDict::with_capacity(pairs.len());
            for pair in pairs.iter() {
                match expect_sequence(pair, "OrderedDict item")?.as_slice() {
                    [k, v] => {
                        dict.insert(k.clone(), v.clone());
                    }
                    _ => bail!(ErrorKind::TypeMismatch(
                        "OrderedDict items must be key/value pairs".to_string()
                    )),
                }
            }
            dict
        }
        _ => bail!(ErrorKind::TypeMismatch(
            "Malformed OrderedDict constructor".to_string()
        )),
    };
    Ok(if env.compatibility() {
        Value::dict(dict)
    } else {
        Value::ordered_dict(dict)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(k: &str, v: i64) -> Value {
        Value::list(vec![k.into(), v.into()])
    }

    #[test]
    fn complex_from_floats_and_ints() {
        let args = Value::tuple(vec![1.0.into(), 2i64.into()]);
        assert_eq!(
            reduce_complex(&args).unwrap(),
            Value::Complex(Complex64::new(1.0, 2.0))
        );
        let bad = Value::tuple(vec!["x".into(), 2i64.into()]);
        let err = reduce_complex(&bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::TypeMismatch(_))
        ));
    }

    #[test]
    fn long_accepts_strings() {
        let args = Value::tuple(vec!["-12345678901234567890L".into()]);
        let expect: BigInt = "-12345678901234567890".parse().unwrap();
        assert_eq!(reduce_long(&args).unwrap(), Value::BigInt(expect));
    }

    #[test]
    fn ordered_dict_and_compatibility() {
        let args = Value::tuple(vec![Value::list(vec![pair("b", 1), pair("a", 2)])]);
        let mut env = Environment::new();
        let od = reduce_ordered_dict(&args, &mut env).unwrap();
        let Value::OrderedDict(d) = &od else {
            panic!("expected OrderedDict, got {od}");
        };
        let keys: Vec<_> = d.borrow().keys().cloned().collect();
        assert_eq!(keys, vec![Value::from("b"), Value::from("a")]);

        env.set(COMPATIBILITY, true);
        assert!(matches!(
            reduce_ordered_dict(&args, &mut env).unwrap(),
            Value::Dict(_)
        ));
    }

    #[test]
    fn flags_need_truthy_values() {
        let mut env = Environment::new();
        assert!(!env.supports_numeric());
        env.set(SUPPORTS_NUMERIC, false);
        assert!(!env.supports_numeric());
        env.set(SUPPORTS_NUMERIC, 1i64);
        assert!(env.supports_numeric());
    }

    #[test]
    fn shared_registry_has_builtins() {
        let reg = FactoryRegistry::shared();
        assert!(matches!(
            reg.reduce_for(names::COMPLEX),
            Some(ReduceFactory::Complex)
        ));
        assert!(reg.build_for(names::NUMPY_DTYPE).is_some());
        assert!(reg.reduce_for("pkg.Mod\nFoo\n").is_none());
    }
}
