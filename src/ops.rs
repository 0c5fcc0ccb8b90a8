#![allow(non_camel_case_types)]

/// Opcode bytes, named the way Python's `pickle.py` names them.
pub mod p_op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    // Protocol 2
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
}

/// The highest protocol version this crate understands.
pub const MAX_PROTOCOL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
/// One decoded pickle instruction, borrowing its operand from the input.
pub enum PickleOp<'a> {
    MARK,
    STOP,
    FLOAT(&'a str),
    BINFLOAT(f64),
    INT(&'a str),
    BININT(i32),
    BININT1(u8),
    BININT2(u16),
    LONG(&'a str),
    LONG1(&'a [u8]),
    LONG4(&'a [u8]),
    NONE,
    NEWTRUE,
    NEWFALSE,
    /// The raw line, quotes and escapes included.
    STRING(&'a [u8]),
    BINSTRING(&'a [u8]),
    SHORT_BINSTRING(&'a [u8]),
    APPEND,
    APPENDS,
    LIST,
    EMPTY_LIST,
    DICT,
    EMPTY_DICT,
    SETITEM,
    SETITEMS,
    TUPLE,
    EMPTY_TUPLE,
    TUPLE1,
    TUPLE2,
    TUPLE3,
    PUT(&'a str),
    BINPUT(u8),
    LONG_BINPUT(u32),
    GET(&'a str),
    BINGET(u8),
    LONG_BINGET(u32),
    GLOBAL(&'a str, &'a str),
    REDUCE,
    BUILD,
    NEWOBJ,
    OBJ,
    PROTO(u8),
    /// Anything else: `POP`, `DUP`, persistent ids, unicode, `INST`,
    /// extension codes and every protocol 3+ opcode. Its operand is
    /// never consumed.
    Unsupported(u8),
}

impl PickleOp<'_> {
    /// The opcode byte this op was parsed from.
    pub fn code(&self) -> u8 {
        use p_op::*;
        match self {
            PickleOp::MARK => MARK,
            PickleOp::STOP => STOP,
            PickleOp::FLOAT(_) => FLOAT,
            PickleOp::BINFLOAT(_) => BINFLOAT,
            PickleOp::INT(_) => INT,
            PickleOp::BININT(_) => BININT,
            PickleOp::BININT1(_) => BININT1,
            PickleOp::BININT2(_) => BININT2,
            PickleOp::LONG(_) => LONG,
            PickleOp::LONG1(_) => LONG1,
            PickleOp::LONG4(_) => LONG4,
            PickleOp::NONE => NONE,
            PickleOp::NEWTRUE => NEWTRUE,
            PickleOp::NEWFALSE => NEWFALSE,
            PickleOp::STRING(_) => STRING,
            PickleOp::BINSTRING(_) => BINSTRING,
            PickleOp::SHORT_BINSTRING(_) => SHORT_BINSTRING,
            PickleOp::APPEND => APPEND,
            PickleOp::APPENDS => APPENDS,
            PickleOp::LIST => LIST,
            PickleOp::EMPTY_LIST => EMPTY_LIST,
            PickleOp::DICT => DICT,
            PickleOp::EMPTY_DICT => EMPTY_DICT,
            PickleOp::SETITEM => SETITEM,
            PickleOp::SETITEMS => SETITEMS,
            PickleOp::TUPLE => TUPLE,
            PickleOp::EMPTY_TUPLE => EMPTY_TUPLE,
            PickleOp::TUPLE1 => TUPLE1,
            PickleOp::TUPLE2 => TUPLE2,
            PickleOp::TUPLE3 => TUPLE3,
            PickleOp::PUT(_) => PUT,
            PickleOp::BINPUT(_) => BINPUT,
            PickleOp::LONG_BINPUT(_) => LONG_BINPUT,
            PickleOp::GET(_) => GET,
            PickleOp::BINGET(_) => BINGET,
            PickleOp::LONG_BINGET(_) => LONG_BINGET,
            PickleOp::GLOBAL(..) => GLOBAL,
            PickleOp::REDUCE => REDUCE,
            PickleOp::BUILD => BUILD,
            PickleOp::NEWOBJ => NEWOBJ,
            PickleOp::OBJ => OBJ,
            PickleOp::PROTO(_) => PROTO,
            PickleOp::Unsupported(code) => *code,
        }
    }
}
