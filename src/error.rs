use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
/// What went wrong while decoding.
pub enum ErrorKind {
    /// The cursor ran past the end of the buffer.
    TruncatedInput,
    /// The opcode byte is not implemented.
    UnsupportedOpcode(u8),
    /// `PROTO` announced a protocol newer than 2.
    UnsupportedProtocol(u8),
    /// Bad quoting or escapes in a string literal, or an unparsable
    /// numeric literal.
    MalformedLiteral(String),
    /// `GET` of a memo id that was never `PUT`.
    UnknownMemoReference(u32),
    /// An operand or factory argument had the wrong shape.
    TypeMismatch(String),
    /// A NumPy dtype or type-letter/width combination we don't know.
    UnknownTypeDescriptor(String),
    /// Stack underrun, missing MARK and similar broken streams.
    MalformedStructure(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TruncatedInput => write!(f, "unexpected end of input"),
            ErrorKind::UnsupportedOpcode(op) => write!(f, "opcode {op:#04x} not implemented"),
            ErrorKind::UnsupportedProtocol(p) => write!(f, "unsupported pickle protocol {p}"),
            ErrorKind::MalformedLiteral(msg) => write!(f, "malformed literal: {msg}"),
            ErrorKind::UnknownMemoReference(id) => write!(f, "unknown memo id {id}"),
            ErrorKind::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            ErrorKind::UnknownTypeDescriptor(desc) => write!(f, "unknown type descriptor {desc:?}"),
            ErrorKind::MalformedStructure(msg) => write!(f, "malformed stream: {msg}"),
        }
    }
}

impl std::error::Error for ErrorKind {}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A failed decode. `offset` is where the failing opcode starts
/// (or the end of the buffer for failures found after decoding),
/// `opcode` is `None` when the failure came from post-processing.
pub struct DecodeError {
    pub kind: ErrorKind,
    pub offset: usize,
    pub opcode: Option<u8>,
}

impl DecodeError {
    pub fn new(kind: ErrorKind, offset: usize, opcode: Option<u8>) -> Self {
        Self {
            kind,
            offset,
            opcode,
        }
    }

    /// Pull an [`ErrorKind`] back out of an `anyhow` error. Anything
    /// else (usually a user factory complaining) is a type mismatch.
    pub(crate) fn from_anyhow(err: anyhow::Error, offset: usize, opcode: Option<u8>) -> Self {
        let kind = match err.downcast::<ErrorKind>() {
            Ok(kind) => kind,
            Err(err) => ErrorKind::TypeMismatch(format!("{err:#}")),
        };
        Self::new(kind, offset, opcode)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Some(op) => write!(f, "{} (opcode {op:#04x} at offset {})", self.kind, self.offset),
            None => write!(f, "{} (after decoding {} bytes)", self.kind, self.offset),
        }
    }
}

impl std::error::Error for DecodeError {}
