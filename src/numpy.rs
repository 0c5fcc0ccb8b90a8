//! NumPy arrays.
//!
//! `numpy.array([15, 16, 17], numpy.uint32)` pickles as a REDUCE of
//! `_reconstruct` followed by a BUILD carrying the array state, with a
//! nested REDUCE/BUILD pair for the dtype. The factories here only glue
//! those pieces together into a tuple:
//!
//! ```text
//! ("numpy.core.multiarray\n_reconstruct\n", ("numpy\nndarray\n", (0,), "b"),
//!  (1, (3,), ("numpy\ndtype\n", ("u4", 0, 1), (3, "<", None, ...)), False, b"\x0f\x00..."))
//! ```
//!
//! Turning that into a [`TypedVector`] happens in [`post_process`], after
//! the whole stream has been decoded.

use std::{collections::HashMap, collections::HashSet, rc::Rc};

use anyhow::{bail, ensure, Result};
use num_complex::{Complex32, Complex64};

use crate::{
    error::ErrorKind,
    factory::{names, Environment},
    value::{decode_elements, Element, TypedVector, Value},
};

/// Deepest nesting the post-processor descends into. Python's default
/// recursion limit of 1000 keeps real pickles well below this.
const MAX_NESTING: usize = 4_000;

/// REDUCE for `_reconstruct` and `dtype`: remember the name with its args
/// so the following BUILD has something to append the state to.
pub fn reduce_type_object(name: &Value, args: &Value) -> Result<Value> {
    match name {
        Value::String(_) => Ok(Value::tuple(vec![name.clone(), args.clone()])),
        other => bail!(ErrorKind::TypeMismatch(format!(
            "NumPy type object needs a global name, got {}",
            other.type_name()
        ))),
    }
}

/// BUILD for `_reconstruct` and `dtype`: append the state to the type-object.
pub fn build_type_object(type_object: &mut Value, state: Value) -> Result<()> {
    match type_object {
        Value::Tuple(items) => {
            Rc::make_mut(items).push(state);
            Ok(())
        }
        other => bail!(ErrorKind::TypeMismatch(format!(
            "NumPy BUILD expects a type-object tuple, got {}",
            other.type_name()
        ))),
    }
}

fn is_reconstruct(items: &[Value]) -> bool {
    matches!(
        items.first().and_then(Value::as_str),
        Some(names::NUMPY_RECONSTRUCT | names::NUMPY2_RECONSTRUCT)
    )
}

/// Replace every `_reconstruct` tuple in the graph with the array it
/// describes. Under `compatibility` the arrays come out as plain lists and
/// the remaining tuples become lists too.
pub fn post_process(value: &mut Value, env: &Environment) -> Result<()> {
    let mut walker = Walker {
        compatibility: env.compatibility(),
        seen: HashSet::new(),
        rebuilt: HashMap::new(),
    };
    walker.visit(value, 0)?;
    Ok(())
}

struct Walker {
    compatibility: bool,
    /// Containers already entered, by address. Guards against cycles.
    seen: HashSet<usize>,
    /// Tuples that were replaced, so every reference to a shared tuple
    /// gets the same replacement.
    rebuilt: HashMap<usize, Value>,
}

impl Walker {
    /// Returns whether `val` was replaced by a different object.
    fn visit(&mut self, val: &mut Value, depth: usize) -> Result<bool> {
        ensure!(
            depth < MAX_NESTING,
            ErrorKind::MalformedStructure("value nested too deeply".to_string())
        );
        match val {
            Value::Tuple(items) => {
                let key = Rc::as_ptr(items) as usize;
                if let Some(done) = self.rebuilt.get(&key) {
                    *val = done.clone();
                    return Ok(true);
                }
                if is_reconstruct(items) {
                    let arr = materialize(items, self.compatibility)?;
                    self.rebuilt.insert(key, arr.clone());
                    *val = arr;
                    return Ok(true);
                }
                if !self.seen.insert(key) {
                    return Ok(false);
                }
                let mut children = items.to_vec();
                let mut changed = false;
                for child in children.iter_mut() {
                    changed |= self.visit(child, depth + 1)?;
                }
                if !changed && !self.compatibility {
                    return Ok(false);
                }
                let new = if self.compatibility {
                    Value::list(children)
                } else {
                    Value::tuple(children)
                };
                self.rebuilt.insert(key, new.clone());
                *val = new;
                Ok(true)
            }
            Value::List(items) => {
                if self.seen.insert(Rc::as_ptr(items) as usize) {
                    for child in items.borrow_mut().iter_mut() {
                        self.visit(child, depth + 1)?;
                    }
                }
                Ok(false)
            }
            Value::Dict(dict) | Value::OrderedDict(dict) => {
                if self.seen.insert(Rc::as_ptr(dict) as usize) {
                    for child in dict.borrow_mut().values_mut() {
                        self.visit(child, depth + 1)?;
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

fn state_error(what: &str) -> ErrorKind {
    ErrorKind::TypeMismatch(format!("NumPy array state: {what}"))
}

/// Total element count. Only flat arrays are kept; higher ranks are
/// flattened in storage order.
fn element_count(shape: &Value) -> Result<usize> {
    let dims = match shape {
        Value::Tuple(dims) => dims.to_vec(),
        dim => vec![dim.clone()],
    };
    if dims.len() > 1 {
        log::warn!("saw a {}-dimensional NumPy array, flattening", dims.len());
    }
    dims.iter().try_fold(1usize, |acc, dim| {
        match dim.as_i64().and_then(|d| usize::try_from(d).ok()) {
            Some(d) => Ok(acc.saturating_mul(d)),
            None => Err(anyhow::Error::from(state_error(&format!("bad dimension {dim}")))),
        }
    })
}

/// Pull the type string (`"u4"`) and byte order marker out of a dtype.
fn dtype_descriptor(dtype: &Value) -> Result<(String, char)> {
    let Some(parts) = dtype.as_tuple() else {
        bail!(state_error("dtype is not a tuple"));
    };
    let desc_of = |args: &Value| {
        args.as_tuple()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_owned)
    };
    let endian_of = |state: &Value| {
        state
            .as_tuple()
            .and_then(|s| s.get(1))
            .and_then(Value::as_str)
            .and_then(|s| s.chars().next())
    };
    let (desc, endian) = match parts {
        // ((name, (desc, ...)), (ver, endian, ...))
        [Value::Tuple(head), state, ..] => (head.get(1).and_then(desc_of), endian_of(state)),
        // (name, (desc, ...), (ver, endian, ...))
        [Value::String(_), args, state, ..] => (desc_of(args), endian_of(state)),
        // (name, (desc, ...))
        [Value::String(_), args] => (desc_of(args), Some('|')),
        _ => (None, None),
    };
    match (desc, endian) {
        (Some(desc), Some(endian)) => Ok((desc, endian)),
        _ => bail!(ErrorKind::UnknownTypeDescriptor(dtype.to_string())),
    }
}

fn needs_swap(endian: char) -> Result<bool> {
    let host_little = cfg!(target_endian = "little");
    Ok(match endian {
        '|' | '=' => false,
        '<' => !host_little,
        '>' => host_little,
        other => bail!(ErrorKind::UnknownTypeDescriptor(format!(
            "byte order {other:?}"
        ))),
    })
}

fn typed<T: Element>(data: &[u8], count: usize, swap: bool) -> Result<TypedVector> {
    ensure!(
        count.checked_mul(T::WIDTH) == Some(data.len()),
        state_error(&format!(
            "{count} elements of {} bytes need {} bytes, got {}",
            T::WIDTH,
            count.saturating_mul(T::WIDTH),
            data.len()
        ))
    );
    Ok(T::into_vector(decode_elements(data, swap)))
}

fn materialize(items: &[Value], compatibility: bool) -> Result<Value> {
    let Some(state) = items.get(2).and_then(Value::as_tuple) else {
        bail!(state_error("_reconstruct was never built"));
    };
    let [_, shape, dtype, _, data, ..] = state else {
        bail!(state_error("expected (version, shape, dtype, fortran, data)"));
    };
    let count = element_count(shape)?;
    let Some(data) = data.as_bytes() else {
        bail!(state_error("data is not a byte string"));
    };
    let (desc, endian) = dtype_descriptor(dtype)?;
    let swap = needs_swap(endian)?;

    let mut chars = desc.chars();
    let letter = chars.next();
    let width: Option<usize> = chars.as_str().parse().ok();
    let vec = match (letter, width) {
        (Some('i'), Some(1)) => typed::<i8>(data, count, swap)?,
        (Some('i'), Some(2)) => typed::<i16>(data, count, swap)?,
        (Some('i'), Some(4)) => typed::<i32>(data, count, swap)?,
        (Some('i'), Some(8)) => typed::<i64>(data, count, swap)?,
        (Some('u' | 'b'), Some(1)) => typed::<u8>(data, count, swap)?,
        (Some('u'), Some(2)) => typed::<u16>(data, count, swap)?,
        (Some('u'), Some(4)) => typed::<u32>(data, count, swap)?,
        (Some('u'), Some(8)) => typed::<u64>(data, count, swap)?,
        (Some('f'), Some(4)) => typed::<f32>(data, count, swap)?,
        (Some('f'), Some(8)) => typed::<f64>(data, count, swap)?,
        (Some('c'), Some(8)) => typed::<Complex32>(data, count, swap)?,
        (Some('c'), Some(16)) => typed::<Complex64>(data, count, swap)?,
        _ => bail!(ErrorKind::UnknownTypeDescriptor(desc)),
    };
    Ok(if compatibility {
        Value::list(vec.to_values())
    } else {
        Value::vector(vec)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtype(desc: &str, endian: &str) -> Value {
        let mut dt = reduce_type_object(
            &names::NUMPY_DTYPE.into(),
            &Value::tuple(vec![desc.into(), 0i64.into(), 1i64.into()]),
        )
        .unwrap();
        let state = Value::tuple(vec![
            3i64.into(),
            endian.into(),
            Value::None,
            Value::None,
            Value::None,
            (-1i64).into(),
            (-1i64).into(),
            0i64.into(),
        ]);
        build_type_object(&mut dt, state).unwrap();
        dt
    }

    fn ndarray(shape: Vec<Value>, dtype: Value, data: &[u8]) -> Value {
        let args = Value::tuple(vec![
            "numpy\nndarray\n".into(),
            Value::tuple(vec![0i64.into()]),
            "b".into(),
        ]);
        let mut arr = reduce_type_object(&names::NUMPY_RECONSTRUCT.into(), &args).unwrap();
        let state = Value::tuple(vec![
            1i64.into(),
            Value::tuple(shape),
            dtype,
            false.into(),
            Value::from_byte_string(data),
        ]);
        build_type_object(&mut arr, state).unwrap();
        arr
    }

    #[test]
    fn little_and_big_endian_agree() {
        let mut le = ndarray(
            vec![3i64.into()],
            dtype("u4", "<"),
            b"\x0f\x00\x00\x00\x10\x00\x00\x00\x11\x00\x00\x00",
        );
        let mut be = ndarray(
            vec![3i64.into()],
            dtype("u4", ">"),
            b"\x00\x00\x00\x0f\x00\x00\x00\x10\x00\x00\x00\x11",
        );
        let env = Environment::new();
        post_process(&mut le, &env).unwrap();
        post_process(&mut be, &env).unwrap();
        let want = Value::vector(TypedVector::U32(vec![15, 16, 17]));
        assert_eq!(le, want);
        assert_eq!(be, want);
    }

    #[test]
    fn nested_inside_containers() {
        let arr = ndarray(vec![2i64.into()], dtype("i1", "|"), b"\x01\xff");
        let list = Value::list(vec![arr.clone()]);
        let mut top = Value::tuple(vec![list.clone(), arr]);
        post_process(&mut top, &Environment::new()).unwrap();
        let want = Value::vector(TypedVector::I8(vec![1, -1]));
        assert_eq!(top, Value::tuple(vec![Value::list(vec![want.clone()]), want]));
        // The list was updated in place.
        assert_eq!(list, Value::list(vec![Value::vector(TypedVector::I8(vec![1, -1]))]));
    }

    #[test]
    fn short_dtype_form() {
        let dt = Value::tuple(vec![
            names::NUMPY_DTYPE.into(),
            Value::tuple(vec!["f8".into(), 0i64.into(), 1i64.into()]),
        ]);
        assert_eq!(dtype_descriptor(&dt).unwrap(), ("f8".to_string(), '|'));
    }

    #[test]
    fn multi_dimensional_is_flattened() {
        let mut arr = ndarray(
            vec![2i64.into(), 2i64.into()],
            dtype("u1", "|"),
            b"\x01\x02\x03\x04",
        );
        post_process(&mut arr, &Environment::new()).unwrap();
        assert_eq!(arr, Value::vector(TypedVector::U8(vec![1, 2, 3, 4])));
    }

    #[test]
    fn compatibility_makes_lists() {
        let arr = ndarray(vec![1i64.into()], dtype("u1", "|"), b"\x07");
        let mut top = Value::tuple(vec![arr]);
        let mut env = Environment::new();
        env.set(crate::factory::COMPATIBILITY, true);
        post_process(&mut top, &env).unwrap();
        assert_eq!(top, Value::list(vec![Value::list(vec![7i64.into()])]));
    }

    #[test]
    fn unknown_descriptor_and_bad_length() {
        let mut arr = ndarray(vec![1i64.into()], dtype("f2", "<"), b"\x00\x00");
        let err = post_process(&mut arr, &Environment::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::UnknownTypeDescriptor(_))
        ));

        let mut arr = ndarray(vec![3i64.into()], dtype("u4", "<"), b"\x00\x00\x00\x00");
        let err = post_process(&mut arr, &Environment::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::TypeMismatch(_))
        ));
    }

    #[test]
    fn build_needs_tuple() {
        let mut not_tuple = Value::from("numpy\ndtype\n");
        assert!(build_type_object(&mut not_tuple, Value::None).is_err());
    }
}
