//! Legacy array encodings: the old `Numeric` package and the standard
//! library `array` module.

use anyhow::{bail, Result};
use num_complex::{Complex32, Complex64};

use crate::{
    error::ErrorKind,
    factory::{expect_sequence, expect_tuple, Environment},
    value::{decode_elements, Element, Int, Value},
};

/// Bytes per element for a Numeric type tag.
pub fn numeric_tag_width(tag: char) -> Option<usize> {
    Some(match tag {
        '1' | 'b' => 1,
        's' | 'w' => 2,
        'i' | 'u' | 'f' => 4,
        'l' | 'd' | 'F' => 8,
        'D' => 16,
        _ => return None,
    })
}

fn typecode_of(val: &Value, what: &str) -> Result<char> {
    match val.as_bytes().and_then(|b| b.first()) {
        Some(c) => Ok(char::from(*c)),
        None => bail!(ErrorKind::TypeMismatch(format!(
            "{what} expects a one character type code"
        ))),
    }
}

fn numeric_result<T: Element>(data: &[u8], keep_numeric: bool) -> Value {
    let items: Vec<T> = decode_elements(data, false);
    if keep_numeric {
        Value::vector(T::into_vector(items))
    } else {
        Value::list(items.into_iter().map(Element::into_value).collect())
    }
}

/// `Numeric.array_constructor(shape, typecode, data, savespace)`
///
/// When the element count from `shape` disagrees with the byte count, a
/// `'l'` array is assumed to come from a machine with 4 byte longs and is
/// read as `'i'`. Any other tag gets its element count recomputed from the
/// data. Both are lossy guesses and are logged as warnings.
pub fn reduce_numeric_array(args: &Value, env: &mut Environment) -> Result<Value> {
    let items = expect_tuple(args, "Numeric array")?;
    let [shape, typecode, data, ..] = items else {
        bail!(ErrorKind::TypeMismatch(
            "Numeric array expects (shape, typecode, data)".to_string()
        ));
    };
    let mut elements = 1usize;
    for dim in expect_tuple(shape, "Numeric array shape")? {
        match dim.as_i64().and_then(|d| usize::try_from(d).ok()) {
            Some(d) => elements = elements.saturating_mul(d),
            None => bail!(ErrorKind::TypeMismatch(format!(
                "bad Numeric dimension {dim}"
            ))),
        }
    }
    let mut tag = typecode_of(typecode, "Numeric array")?;
    let Some(data) = data.as_bytes() else {
        bail!(ErrorKind::TypeMismatch(
            "Numeric array data must be a string".to_string()
        ));
    };
    let width = numeric_tag_width(tag)
        .ok_or_else(|| ErrorKind::UnknownTypeDescriptor(format!("Numeric typecode {tag:?}")))?;

    let computed = data.len() / width;
    if elements != computed {
        if tag == 'l' {
            log::warn!(
                "Numeric 'l' array claims {elements} elements in {} bytes, reading as 4-byte longs",
                data.len()
            );
            tag = 'i';
        } else {
            log::warn!(
                "Numeric {tag:?} array claims {elements} elements but holds {computed}, continuing with {computed}"
            );
            elements = computed;
        }
    }
    let width = numeric_tag_width(tag).unwrap_or(width);
    let available = data.len() / width;
    if elements > available {
        log::warn!("Numeric array truncated from {elements} to {available} elements");
        elements = available;
    }
    let data = &data[..elements * width];
    let keep = env.supports_numeric();

    Ok(match tag {
        '1' => numeric_result::<i8>(data, keep),
        'b' => numeric_result::<u8>(data, keep),
        's' => numeric_result::<i16>(data, keep),
        'w' => numeric_result::<u16>(data, keep),
        'i' => numeric_result::<i32>(data, keep),
        'u' => numeric_result::<u32>(data, keep),
        'l' => numeric_result::<i64>(data, keep),
        'f' => numeric_result::<f32>(data, keep),
        'd' => numeric_result::<f64>(data, keep),
        'F' => numeric_result::<Complex32>(data, keep),
        'D' => numeric_result::<Complex64>(data, keep),
        _ => bail!(ErrorKind::UnknownTypeDescriptor(format!(
            "Numeric typecode {tag:?}"
        ))),
    })
}

/// One list element. `'c'` arrays list their items as 1 character strings.
fn array_element<T: Element>(val: &Value) -> Option<T> {
    match val.as_bytes() {
        Some(&[b]) => T::from_value(&Value::Int(Int::U8(b))),
        _ => T::from_value(val),
    }
}

fn array_result<T: Element>(payload: &Value, env: &Environment) -> Result<Value> {
    // Python 2.6 pickled the raw machine bytes, 2.7 a list of numbers.
    let items: Vec<T> = if let Some(bytes) = payload.as_bytes() {
        decode_elements(bytes, false)
    } else {
        let seq = match payload {
            Value::List(_) | Value::Tuple(_) => expect_sequence(payload, "array")?,
            other => bail!(ErrorKind::TypeMismatch(format!(
                "array expects either list or string, got {}",
                other.type_name()
            ))),
        };
        match seq.iter().map(array_element::<T>).collect::<Option<Vec<_>>>() {
            Some(items) => items,
            None => bail!(ErrorKind::TypeMismatch(
                "array list holds a non-numeric item".to_string()
            )),
        }
    };
    Ok(if env.compatibility() {
        Value::list(items.into_iter().map(Element::into_value).collect())
    } else {
        Value::vector(T::into_vector(items))
    })
}

/// `array.array(typecode, data)`
pub fn reduce_array(args: &Value, env: &mut Environment) -> Result<Value> {
    let items = expect_tuple(args, "array")?;
    let [typecode, payload, ..] = items else {
        bail!(ErrorKind::TypeMismatch(
            "array expects (typecode, data)".to_string()
        ));
    };
    match typecode_of(typecode, "array")? {
        'c' | 'b' => array_result::<i8>(payload, env),
        'B' => array_result::<u8>(payload, env),
        'h' => array_result::<i16>(payload, env),
        'H' => array_result::<u16>(payload, env),
        'i' => array_result::<i32>(payload, env),
        'I' => array_result::<u32>(payload, env),
        'l' => array_result::<i64>(payload, env),
        'L' => array_result::<u64>(payload, env),
        'f' => array_result::<f32>(payload, env),
        'd' => array_result::<f64>(payload, env),
        other => bail!(ErrorKind::UnknownTypeDescriptor(format!(
            "array typecode {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypedVector;

    fn numeric_args(shape: Vec<Value>, tag: &str, data: &[u8]) -> Value {
        Value::tuple(vec![
            Value::tuple(shape),
            tag.into(),
            Value::from_byte_string(data),
            true.into(),
        ])
    }

    fn numeric_env() -> Environment {
        let mut env = Environment::new();
        env.set(crate::factory::SUPPORTS_NUMERIC, true);
        env
    }

    #[test]
    fn numeric_boxed_without_support_flag() {
        let args = numeric_args(vec![3i64.into()], "1", b"\x01\x02\x03");
        let val = reduce_numeric_array(&args, &mut Environment::new()).unwrap();
        assert_eq!(
            val,
            Value::list(vec![1i64.into(), 2i64.into(), 3i64.into()])
        );
    }

    #[test]
    fn numeric_typed_with_support_flag() {
        let data: Vec<u8> = [1i16, 2, 3].iter().flat_map(|n| n.to_ne_bytes()).collect();
        let args = numeric_args(vec![3i64.into()], "s", &data);
        let val = reduce_numeric_array(&args, &mut numeric_env()).unwrap();
        assert_eq!(val, Value::vector(TypedVector::I16(vec![1, 2, 3])));
    }

    #[test]
    fn numeric_empty_shape_is_one_element() {
        let data = 2.5f64.to_ne_bytes();
        let args = numeric_args(vec![], "d", &data);
        let val = reduce_numeric_array(&args, &mut numeric_env()).unwrap();
        assert_eq!(val, Value::vector(TypedVector::F64(vec![2.5])));
    }

    #[test]
    fn numeric_huge_shape_is_clamped() {
        let dim = Value::from(i64::from(i32::MAX));
        let args = numeric_args(vec![dim.clone(), dim.clone(), dim], "l", &7i32.to_ne_bytes());
        let val = reduce_numeric_array(&args, &mut numeric_env()).unwrap();
        assert_eq!(val, Value::vector(TypedVector::I32(vec![7])));
    }

    #[test]
    fn numeric_unknown_tag() {
        let args = numeric_args(vec![1i64.into()], "Q", b"\x00");
        let err = reduce_numeric_array(&args, &mut numeric_env()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ErrorKind>(),
            Some(ErrorKind::UnknownTypeDescriptor(_))
        ));
    }

    #[test]
    fn array_from_list_and_bytes() {
        let list = Value::list(vec![100i64.into(), 200i64.into(), 300i64.into()]);
        let args = Value::tuple(vec!["l".into(), list]);
        let val = reduce_array(&args, &mut Environment::new()).unwrap();
        assert_eq!(val, Value::vector(TypedVector::I64(vec![100, 200, 300])));

        let bytes: Vec<u8> = [100i64, 200, 300].iter().flat_map(|n| n.to_ne_bytes()).collect();
        let args = Value::tuple(vec!["l".into(), Value::from_byte_string(&bytes)]);
        assert_eq!(reduce_array(&args, &mut Environment::new()).unwrap(), val);
    }

    #[test]
    fn array_char_list() {
        let list = Value::list(vec!["A".into(), "7".into()]);
        let args = Value::tuple(vec!["c".into(), list]);
        let val = reduce_array(&args, &mut Environment::new()).unwrap();
        assert_eq!(val, Value::vector(TypedVector::I8(vec![65, 55])));
    }

    #[test]
    fn array_rejects_other_payloads() {
        let args = Value::tuple(vec!["d".into(), Value::None]);
        assert!(reduce_array(&args, &mut Environment::new()).is_err());
    }
}
