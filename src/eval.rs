use crate::{
    error::{DecodeError, ErrorKind},
    factory::{parse_long_literal, Environment, FactoryRegistry},
    numpy,
    ops::*,
    parsers::parse_op,
    value::*,
};

use std::{
    collections::{BTreeMap, HashMap},
    ops::{Deref, DerefMut},
    rc::Rc,
    sync::Arc,
};

use anyhow::{bail, ensure, Result};
use num_bigint::BigInt;

fn malformed(msg: &str) -> ErrorKind {
    ErrorKind::MalformedStructure(msg.to_string())
}

#[derive(Debug, Clone, PartialEq, Default)]
/// Basically just a Vec with some convenience functions.
pub struct PickleStack(pub Vec<Value>);

impl PickleStack {
    pub fn pop(&mut self) -> Result<Value> {
        match self.0.pop() {
            Some(val) => Ok(val),
            None => bail!(malformed("stack underrun")),
        }
    }

    /// Look at an entry counting down from the top, `0` being the top.
    pub fn peek(&self, from_top: usize) -> Result<&Value> {
        match self.0.len().checked_sub(from_top + 1) {
            Some(idx) => Ok(&self.0[idx]),
            None => bail!(malformed("stack underrun")),
        }
    }

    pub fn top_mut(&mut self) -> Result<&mut Value> {
        match self.0.last_mut() {
            Some(val) => Ok(val),
            None => bail!(malformed("stack underrun")),
        }
    }

    /// Pop the top `n` entries, oldest first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        ensure!(n <= self.0.len(), malformed("stack underrun"));
        Ok(self.0.split_off(self.0.len() - n))
    }

    /// Pop everything above the most recent mark.
    pub fn pop_mark(&mut self, marks: &mut PickleMarks) -> Result<Vec<Value>> {
        let markidx = marks.pop()?;
        ensure!(
            markidx <= self.0.len(),
            malformed("MARK lies above the top of the stack")
        );
        Ok(self.0.split_off(markidx))
    }
}

impl Deref for PickleStack {
    type Target = Vec<Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PickleStack {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Stack depths recorded by MARK.
pub struct PickleMarks(pub Vec<usize>);

impl PickleMarks {
    pub fn push(&mut self, depth: usize) {
        self.0.push(depth);
    }

    pub fn pop(&mut self) -> Result<usize> {
        match self.0.pop() {
            Some(depth) => Ok(depth),
            None => bail!(malformed("missing MARK")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
/// Basically just a BTreeMap with some convenience functions.
///
/// Entries share their containers with the stack, so a GET hands back the
/// very same list or dict that was PUT.
pub struct PickleMemo {
    entries: BTreeMap<u32, Value>,
    /// Ids that were handed a tuple, by the tuple's address. BUILD swaps a
    /// tuple for its built copy and uses this to find the stale entries.
    tuple_ids: HashMap<usize, Vec<u32>>,
}

impl PickleMemo {
    pub fn insert(&mut self, mid: u32, val: Value) {
        if let Value::Tuple(items) = &val {
            let addr = Rc::as_ptr(items) as usize;
            self.tuple_ids.entry(addr).or_default().push(mid);
        }
        self.entries.insert(mid, val);
    }

    pub fn get(&self, mid: u32) -> Result<Value> {
        match self.entries.get(&mid) {
            Some(val) => Ok(val.clone()),
            None => bail!(ErrorKind::UnknownMemoReference(mid)),
        }
    }

    /// Point every entry still holding `old` at `new`.
    pub fn replace_aliases(&mut self, old: &Value, new: &Value) {
        let Value::Tuple(items) = old else {
            return;
        };
        let Some(mids) = self.tuple_ids.remove(&(Rc::as_ptr(items) as usize)) else {
            return;
        };
        for mid in mids {
            if self.entries.get(&mid).is_some_and(|val| val.is_same(old)) {
                self.insert(mid, new.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tuple_ids.clear();
    }
}

/// A protocol 0-2 pickle decoder.
///
/// One instance decodes one buffer at a time; [`Unpickler::reset`] rebinds
/// it to another. The factory registry is shared with every other loader
/// until [`Unpickler::register`] is called, which gives this loader its
/// own copy.
pub struct Unpickler<'a> {
    input: &'a [u8],
    pos: usize,
    stack: PickleStack,
    marks: PickleMarks,
    memo: PickleMemo,
    registry: Arc<FactoryRegistry>,
    env: Environment,
    protocol: u8,
    require_stop: bool,
}

impl<'a> Unpickler<'a> {
    /// A loader using the built-in factories.
    pub fn new(input: &'a [u8]) -> Self {
        Self::with_registry(input, FactoryRegistry::shared())
    }

    pub fn with_registry(input: &'a [u8], registry: Arc<FactoryRegistry>) -> Self {
        Self {
            input,
            pos: 0,
            stack: PickleStack::default(),
            marks: PickleMarks::default(),
            memo: PickleMemo::default(),
            registry,
            env: Environment::new(),
            protocol: 0,
            require_stop: false,
        }
    }

    /// Start over on a new buffer. Registered factories and the
    /// environment are kept.
    pub fn reset(&mut self, input: &'a [u8]) {
        self.input = input;
        self.pos = 0;
        self.protocol = 0;
        self.clear();
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.marks.0.clear();
        self.memo.clear();
    }

    /// Add or replace a REDUCE factory for a global name such as
    /// `"__main__\nPoint\n"`.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Value, &mut Environment) -> Result<Value> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register(name, f);
    }

    /// Add or replace a BUILD mutator for a global name.
    pub fn register_build<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Value, Value, &mut Environment) -> Result<()> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register_build(name, f);
    }

    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// When set, running off the end of the buffer without a STOP opcode is
    /// an error instead of returning the top of the stack.
    pub fn require_stop(&mut self, yes: bool) -> &mut Self {
        self.require_stop = yes;
        self
    }

    /// The version from the last PROTO opcode, `0` if there was none.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Byte offset of the cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode one pickle and run NumPy post-processing over the result.
    ///
    /// On failure the stacks and memo are thrown away. On success the
    /// cursor sits after the STOP opcode, so a buffer holding several
    /// pickles back to back can be read by calling this repeatedly.
    pub fn loads(&mut self) -> Result<Value, DecodeError> {
        let result = self.decode().and_then(|mut val| {
            numpy::post_process(&mut val, &self.env)
                .map_err(|e| DecodeError::from_anyhow(e, self.pos, None))?;
            Ok(val)
        });
        self.clear();
        result
    }

    fn decode(&mut self) -> Result<Value, DecodeError> {
        let input = self.input;
        loop {
            let start = self.pos;
            let Some(&opcode) = input.get(start) else {
                return self.finish_at_end();
            };
            let (rest, op) = parse_op::<nom::error::Error<&[u8]>>(&input[start..])
                .map_err(|e| DecodeError::new(parse_error_kind(e), start, Some(opcode)))?;
            self.pos = input.len() - rest.len();
            log::trace!("{start:#06x}: {op:?}");

            if op == PickleOp::STOP {
                return match self.stack.pop() {
                    Ok(val) => Ok(val),
                    Err(e) => Err(DecodeError::from_anyhow(e, start, Some(opcode))),
                };
            }
            self.execute(op)
                .map_err(|e| DecodeError::from_anyhow(e, start, Some(op.code())))?;
        }
    }

    fn finish_at_end(&mut self) -> Result<Value, DecodeError> {
        let end = self.input.len();
        if self.require_stop {
            return Err(DecodeError::new(ErrorKind::TruncatedInput, end, None));
        }
        match self.stack.0.pop() {
            Some(val) => Ok(val),
            None => Err(DecodeError::new(ErrorKind::TruncatedInput, end, None)),
        }
    }

    fn execute(&mut self, op: PickleOp<'_>) -> Result<()> {
        match op {
            PickleOp::MARK => self.marks.push(self.stack.len()),
            PickleOp::STOP => bail!(malformed("unexpected STOP")),
            PickleOp::NONE => self.stack.push(Value::None),
            PickleOp::NEWTRUE => self.stack.push(true.into()),
            PickleOp::NEWFALSE => self.stack.push(false.into()),
            PickleOp::INT(s) => self.stack.push(parse_int_literal(s)?),
            PickleOp::BININT(n) => self.stack.push(Value::Int(Int::I32(n))),
            PickleOp::BININT1(n) => self.stack.push(Value::Int(Int::U8(n))),
            PickleOp::BININT2(n) => self.stack.push(Value::Int(Int::U16(n))),
            PickleOp::LONG(s) => self.stack.push(Value::BigInt(parse_long_literal(s)?)),
            PickleOp::LONG1(b) | PickleOp::LONG4(b) => {
                self.stack.push(Value::BigInt(BigInt::from_signed_bytes_le(b)))
            }
            PickleOp::FLOAT(s) => match s.trim().parse::<f64>() {
                Ok(f) => self.stack.push(f.into()),
                Err(_) => bail!(ErrorKind::MalformedLiteral(format!("bad float {s:?}"))),
            },
            PickleOp::BINFLOAT(f) => self.stack.push(f.into()),
            PickleOp::STRING(raw) => self.stack.push(Value::from_byte_string(&unquote(raw)?)),
            PickleOp::BINSTRING(b) | PickleOp::SHORT_BINSTRING(b) => {
                self.stack.push(Value::from_byte_string(b))
            }
            PickleOp::EMPTY_LIST => self.stack.push(Value::list(Vec::new())),
            PickleOp::EMPTY_DICT => self.stack.push(Value::dict(PickleDict::new())),
            PickleOp::EMPTY_TUPLE => self.stack.push(Value::tuple(Vec::new())),
            PickleOp::LIST => {
                let items = self.stack.pop_mark(&mut self.marks)?;
                self.stack.push(Value::list(items));
            }
            PickleOp::TUPLE => {
                let items = self.stack.pop_mark(&mut self.marks)?;
                self.stack.push(Value::tuple(items));
            }
            PickleOp::TUPLE1 | PickleOp::TUPLE2 | PickleOp::TUPLE3 => {
                let n = match op {
                    PickleOp::TUPLE1 => 1,
                    PickleOp::TUPLE2 => 2,
                    _ => 3,
                };
                let items = self.stack.pop_n(n)?;
                self.stack.push(Value::tuple(items));
            }
            PickleOp::DICT => {
                let items = self.stack.pop_mark(&mut self.marks)?;
                let mut dict = PickleDict::with_capacity(items.len() / 2);
                insert_pairs(&mut dict, items)?;
                self.stack.push(Value::dict(dict));
            }
            PickleOp::APPEND => {
                let v = self.stack.pop()?;
                append_to(self.stack.top_mut()?, vec![v])?;
            }
            PickleOp::APPENDS => {
                let items = self.stack.pop_mark(&mut self.marks)?;
                append_to(self.stack.top_mut()?, items)?;
            }
            PickleOp::SETITEM => {
                let items = self.stack.pop_n(2)?;
                set_items(self.stack.top_mut()?, items)?;
            }
            PickleOp::SETITEMS => {
                let items = self.stack.pop_mark(&mut self.marks)?;
                set_items(self.stack.top_mut()?, items)?;
            }
            PickleOp::PUT(s) => self.memo_put(parse_memo_id(s)?)?,
            PickleOp::BINPUT(mid) => self.memo_put(mid.into())?,
            PickleOp::LONG_BINPUT(mid) => self.memo_put(mid)?,
            PickleOp::GET(s) => {
                let val = self.memo.get(parse_memo_id(s)?)?;
                self.stack.push(val);
            }
            PickleOp::BINGET(mid) => {
                let val = self.memo.get(mid.into())?;
                self.stack.push(val);
            }
            PickleOp::LONG_BINGET(mid) => {
                let val = self.memo.get(mid)?;
                self.stack.push(val);
            }
            PickleOp::GLOBAL(module, name) => {
                self.stack.push(Value::String(format!("{module}\n{name}\n")))
            }
            PickleOp::REDUCE => self.reduce()?,
            PickleOp::BUILD => self.build()?,
            // OBJ gets the same (cls, args) treatment as NEWOBJ.
            PickleOp::NEWOBJ | PickleOp::OBJ => {
                let (args, cls) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(Value::tuple(vec![cls, args]));
            }
            PickleOp::PROTO(proto) => {
                ensure!(
                    proto <= MAX_PROTOCOL,
                    ErrorKind::UnsupportedProtocol(proto)
                );
                self.protocol = proto;
            }
            PickleOp::Unsupported(code) => bail!(ErrorKind::UnsupportedOpcode(code)),
        }
        Ok(())
    }

    fn memo_put(&mut self, mid: u32) -> Result<()> {
        let top = self.stack.peek(0)?.clone();
        self.memo.insert(mid, top);
        Ok(())
    }

    fn reduce(&mut self) -> Result<()> {
        let (args, name) = (self.stack.pop()?, self.stack.pop()?);
        let registry = Arc::clone(&self.registry);
        let factory = name.as_str().and_then(|n| registry.reduce_for(n));
        let val = match factory {
            Some(factory) => factory.reduce(&name, &args, &mut self.env)?,
            None => {
                log::debug!("no REDUCE factory for {name}, keeping (name, args)");
                Value::tuple(vec![name, args])
            }
        };
        self.stack.push(val);
        Ok(())
    }

    fn build(&mut self) -> Result<()> {
        let state = self.stack.pop()?;
        let name = match self.stack.peek(0)? {
            Value::Tuple(items) => match items.first() {
                Some(Value::String(name)) => name.clone(),
                _ => bail!(ErrorKind::TypeMismatch(
                    "BUILD type-object does not start with a name".to_string()
                )),
            },
            other => bail!(ErrorKind::TypeMismatch(format!(
                "BUILD expects a type-object tuple, got {}",
                other.type_name()
            ))),
        };
        // Anything the memo holds has to see the built object too.
        let before = self.stack.peek(0)?.clone();
        let registry = Arc::clone(&self.registry);
        if let Some(mutator) = registry.build_for(&name) {
            let type_object = self.stack.top_mut()?;
            mutator.build(type_object, state, &mut self.env)?;
        } else {
            let type_object = self.stack.pop()?;
            let val = match registry.reduce_for(&name) {
                Some(factory) => factory.reduce(&type_object, &state, &mut self.env)?,
                None => {
                    log::debug!("no BUILD factory for {name:?}, keeping (type_object, state)");
                    Value::tuple(vec![type_object, state])
                }
            };
            self.stack.push(val);
        }
        let after = self.stack.peek(0)?;
        if !after.is_same(&before) {
            self.memo.replace_aliases(&before, after);
        }
        Ok(())
    }
}

/// Decode a single pickle with the built-in factories.
pub fn loads(input: &[u8]) -> Result<Value, DecodeError> {
    Unpickler::new(input).loads()
}

fn parse_error_kind(err: nom::Err<nom::error::Error<&[u8]>>) -> ErrorKind {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) if e.code == nom::error::ErrorKind::MapRes => {
            ErrorKind::MalformedLiteral("line is not valid UTF-8".to_string())
        }
        _ => ErrorKind::TruncatedInput,
    }
}

/// Protocol 0 writes True and False as `I01` and `I00`.
fn parse_int_literal(s: &str) -> Result<Value> {
    let digits = s.trim();
    Ok(match digits {
        "01" => Value::Bool(true),
        "00" => Value::Bool(false),
        _ => match digits.parse::<i64>() {
            Ok(n) => Value::Int(Int::I64(n)),
            Err(_) => Value::BigInt(parse_long_literal(digits)?),
        },
    })
}

fn parse_memo_id(s: &str) -> Result<u32> {
    match s.trim().parse() {
        Ok(mid) => Ok(mid),
        Err(_) => bail!(ErrorKind::MalformedLiteral(format!("bad memo id {s:?}"))),
    }
}

fn insert_pairs(dict: &mut PickleDict, items: Vec<Value>) -> Result<()> {
    ensure!(
        items.len() % 2 == 0,
        malformed("odd number of items for a dict")
    );
    let mut it = items.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        dict.insert(k, v);
    }
    Ok(())
}

fn append_to(target: &mut Value, items: Vec<Value>) -> Result<()> {
    match target {
        Value::List(list) => {
            list.borrow_mut().extend(items);
            Ok(())
        }
        other => bail!(ErrorKind::TypeMismatch(format!(
            "cannot append to {}",
            other.type_name()
        ))),
    }
}

fn set_items(target: &mut Value, items: Vec<Value>) -> Result<()> {
    match target {
        Value::Dict(dict) | Value::OrderedDict(dict) => insert_pairs(&mut dict.borrow_mut(), items),
        other => bail!(ErrorKind::TypeMismatch(format!(
            "cannot set items on {}",
            other.type_name()
        ))),
    }
}

/// Strip the quotes off a protocol 0 string literal and resolve its
/// escapes. Unknown escapes are kept as written.
fn unquote(raw: &[u8]) -> Result<Vec<u8>> {
    let bad = |msg: &str| ErrorKind::MalformedLiteral(format!("{msg}: {}", raw.escape_ascii()));
    let inner = match raw {
        [q @ (b'\'' | b'"'), inner @ .., last] if last == q => inner,
        _ => bail!(bad("string is not quoted")),
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut it = inner.iter().copied();
    while let Some(c) = it.next() {
        if c != b'\\' {
            out.push(c);
            continue;
        }
        match it.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(c @ (b'\\' | b'\'' | b'"')) => out.push(c),
            Some(b'x') => {
                let hex = [it.next(), it.next()];
                let digits = match hex {
                    [Some(h), Some(l)] => [h, l],
                    _ => bail!(bad("truncated \\x escape")),
                };
                match std::str::from_utf8(&digits)
                    .ok()
                    .and_then(|d| u8::from_str_radix(d, 16).ok())
                {
                    Some(b) => out.push(b),
                    None => bail!(bad("bad \\x escape")),
                }
            }
            Some(other) => out.extend_from_slice(&[b'\\', other]),
            None => bail!(bad("truncated escape")),
        }
    }
    Ok(out)
}
