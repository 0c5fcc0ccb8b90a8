use anyhow::Result;
use num_bigint::BigInt;
use pretty_assertions::assert_eq;

use pickle_loader::{loads, ops::p_op, ErrorKind, PickleDict, Unpickler, Value};

fn dict(pairs: Vec<(Value, Value)>) -> Value {
    Value::dict(pairs.into_iter().collect::<PickleDict>())
}

#[test]
fn binary_scalars() -> Result<()> {
    assert_eq!(loads(b"K\x7f.")?, Value::from(127i64));
    assert_eq!(loads(b"M\x00\x01.")?, Value::from(256i64));
    assert_eq!(loads(b"J\xff\xff\xff\xff.")?, Value::from(-1i64));
    assert_eq!(loads(b"G@\x0c\x00\x00\x00\x00\x00\x00.")?, Value::from(3.5));
    assert_eq!(loads(b"N.")?, Value::None);
    assert_eq!(loads(b"\x88.")?, Value::Bool(true));
    assert_eq!(loads(b"\x89.")?, Value::Bool(false));
    Ok(())
}

#[test]
fn longs_are_two_complement() -> Result<()> {
    assert_eq!(loads(b"\x8a\x00.")?, Value::BigInt(BigInt::from(0)));
    assert_eq!(loads(b"\x8a\x01\xff.")?, Value::BigInt(BigInt::from(-1)));
    assert_eq!(loads(b"\x8a\x02\x00\x80.")?, Value::BigInt(BigInt::from(-32768)));
    assert_eq!(
        loads(b"\x8b\x02\x00\x00\x00\xff\x00.")?,
        Value::BigInt(BigInt::from(255))
    );
    Ok(())
}

#[test]
fn protocol_zero_literals() -> Result<()> {
    assert_eq!(loads(b"I42\n.")?, Value::from(42i64));
    assert_eq!(loads(b"I-3\n.")?, Value::from(-3i64));
    assert_eq!(loads(b"I01\n.")?, Value::Bool(true));
    assert_eq!(loads(b"I00\n.")?, Value::Bool(false));
    assert_eq!(loads(b"L123L\n.")?, Value::BigInt(BigInt::from(123)));
    assert_eq!(loads(b"F1.5\n.")?, Value::from(1.5));
    assert_eq!(loads(b"S'hello\\nworld'\np0\n.")?, Value::from("hello\nworld"));
    assert_eq!(loads(b"S\"it's\"\np0\n.")?, Value::from("it's"));
    assert_eq!(loads(b"S'\\xff'\n.")?, Value::Bytes(vec![0xff]));
    Ok(())
}

#[test]
fn binary_strings() -> Result<()> {
    assert_eq!(loads(b"U\x03abc.")?, Value::from("abc"));
    assert_eq!(loads(b"T\x02\x00\x00\x00hi.")?, Value::from("hi"));
    assert_eq!(loads(b"U\x02\xff\xfe.")?, Value::Bytes(vec![0xff, 0xfe]));
    Ok(())
}

#[test]
fn protocol_zero_containers() -> Result<()> {
    assert_eq!(
        loads(b"(lp0\nI1\naS'a'\np1\na.")?,
        Value::list(vec![1i64.into(), "a".into()])
    );
    assert_eq!(
        loads(b"(dp0\nS'k'\np1\nI2\ns.")?,
        dict(vec![("k".into(), 2i64.into())])
    );
    assert_eq!(
        loads(b"(I1\nI2\ntp0\n.")?,
        Value::tuple(vec![1i64.into(), 2i64.into()])
    );
    Ok(())
}

#[test]
fn empty_marked_containers() -> Result<()> {
    assert_eq!(loads(b"(l.")?, Value::list(vec![]));
    assert_eq!(loads(b"(d.")?, Value::dict(PickleDict::new()));
    assert_eq!(loads(b"(t.")?, Value::tuple(vec![]));
    assert_eq!(loads(b"].")?, Value::list(vec![]));
    assert_eq!(loads(b"}.")?, Value::dict(PickleDict::new()));
    assert_eq!(loads(b").")?, Value::tuple(vec![]));
    Ok(())
}

#[test]
fn small_tuples_keep_order() -> Result<()> {
    assert_eq!(loads(b"K\x01\x85.")?, Value::tuple(vec![1i64.into()]));
    assert_eq!(
        loads(b"K\x01K\x02\x86.")?,
        Value::tuple(vec![1i64.into(), 2i64.into()])
    );
    assert_eq!(
        loads(b"K\x01K\x02K\x03\x87.")?,
        Value::tuple(vec![1i64.into(), 2i64.into(), 3i64.into()])
    );
    Ok(())
}

#[test]
fn later_keys_overwrite() -> Result<()> {
    let val = loads(b"}(K\x01K\x02K\x05K\x06K\x01K\x03u.")?;
    assert_eq!(
        val,
        dict(vec![
            (1i64.into(), 3i64.into()),
            (5i64.into(), 6i64.into()),
        ])
    );
    Ok(())
}

#[test]
fn memo_preserves_identity() -> Result<()> {
    // l = []; (l, l)
    let val = loads(b"\x80\x02]q\x00h\x00\x86.")?;
    let items = val.as_tuple().unwrap_or_default();
    assert_eq!(items.len(), 2);
    assert!(items[0].is_same(&items[1]));

    // Appending through the back-reference shows up in both.
    let val = loads(b"\x80\x02]q\x00h\x00K\x05a\x86.")?;
    let five = Value::list(vec![5i64.into()]);
    assert_eq!(val, Value::tuple(vec![five.clone(), five]));
    Ok(())
}

#[test]
fn unknown_memo_ids() {
    let err = loads(b"K\x01h\x09.").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownMemoReference(9));
    assert_eq!(err.offset, 2);

    let err = loads(b"g3\n.").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownMemoReference(3));

    let err = loads(b"N\x80\x02j\x00\x01\x00\x00.").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownMemoReference(256));
}

#[test]
fn unsupported_opcodes_fail_cleanly() {
    let err = loads(b"X\x01\x00\x00\x00a.").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedOpcode(p_op::BINUNICODE));
    assert_eq!((err.offset, err.opcode), (0, Some(b'X')));

    let unsupported = [
        p_op::POP,
        p_op::POP_MARK,
        p_op::DUP,
        p_op::PERSID,
        p_op::BINPERSID,
        p_op::UNICODE,
        p_op::BINUNICODE,
        p_op::INST,
        p_op::EXT1,
        p_op::EXT2,
        p_op::EXT4,
    ];
    for op in unsupported {
        let err = loads(&[b'N', op, b'.']).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedOpcode(op));
        assert_eq!(err.offset, 1);
    }

    let err = loads(b"\x80\x03K\x01.").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedProtocol(3));
    assert_eq!(err.opcode, Some(p_op::PROTO));
}

#[test]
fn malformed_streams() {
    let kind = |buf: &[u8]| loads(buf).unwrap_err().kind;

    assert_eq!(kind(b""), ErrorKind::TruncatedInput);
    assert_eq!(kind(b"J\x01\x02"), ErrorKind::TruncatedInput);
    assert_eq!(kind(b"U\x05abc"), ErrorKind::TruncatedInput);
    assert_eq!(kind(b"I12"), ErrorKind::TruncatedInput);
    assert!(matches!(kind(b"S'abc\n."), ErrorKind::MalformedLiteral(_)));
    assert!(matches!(kind(b"I1x\n."), ErrorKind::MalformedLiteral(_)));
    assert!(matches!(kind(b"Fnope\n."), ErrorKind::MalformedLiteral(_)));
    assert!(matches!(kind(b"p-1\n."), ErrorKind::MalformedLiteral(_)));
    assert!(matches!(kind(b"c\xff\nx\n."), ErrorKind::MalformedLiteral(_)));
    assert!(matches!(kind(b"K\x01l."), ErrorKind::MalformedStructure(_)));
    assert!(matches!(kind(b"(K\x01d."), ErrorKind::MalformedStructure(_)));
    assert!(matches!(kind(b"."), ErrorKind::MalformedStructure(_)));
    assert!(matches!(kind(b"K\x01K\x02a."), ErrorKind::TypeMismatch(_)));
}

#[test]
fn end_of_buffer_policy() -> Result<()> {
    let mut up = Unpickler::new(b"K\x01");
    assert_eq!(up.loads()?, Value::from(1i64));

    let mut up = Unpickler::new(b"K\x01");
    up.require_stop(true);
    assert_eq!(up.loads().unwrap_err().kind, ErrorKind::TruncatedInput);
    Ok(())
}

#[test]
fn back_to_back_pickles() -> Result<()> {
    let mut up = Unpickler::new(b"\x80\x02K\x01.\x80\x02U\x01x.");
    assert_eq!(up.loads()?, Value::from(1i64));
    assert_eq!(up.protocol(), 2);
    assert_eq!(up.position(), 5);
    assert_eq!(up.loads()?, Value::from("x"));
    Ok(())
}

#[test]
fn display_looks_like_python() -> Result<()> {
    let val = loads(b"(lp0\nI1\naS'a'\np1\na(dp2\nS'k'\np3\nNsa.")?;
    assert_eq!(val.to_string(), "[1, \"a\", {\"k\": None}]");
    Ok(())
}

#[test]
fn deep_nesting_is_accepted() -> Result<()> {
    // [[[...]]] 300 levels deep
    let mut buf = vec![b']'; 300];
    buf.extend(std::iter::repeat(b'a').take(299));
    buf.push(b'.');
    let mut val = loads(&buf)?;
    let mut depth = 1;
    loop {
        let inner = match &val {
            Value::List(items) => items.borrow().first().cloned(),
            _ => None,
        };
        match inner {
            Some(next) => {
                val = next;
                depth += 1;
            }
            None => break,
        }
    }
    assert_eq!(depth, 300);
    Ok(())
}

#[test]
fn obj_pairs_class_with_args() -> Result<()> {
    let want = Value::tuple(vec![
        "pkg\nThing\n".into(),
        Value::tuple(vec![1i64.into()]),
    ]);
    assert_eq!(loads(b"cpkg\nThing\nK\x01\x85o.")?, want);
    assert_eq!(loads(b"\x80\x02cpkg\nThing\nK\x01\x85\x81.")?, want);
    assert!(matches!(
        loads(b"K\x01o.").unwrap_err().kind,
        ErrorKind::MalformedStructure(_)
    ));
    Ok(())
}
