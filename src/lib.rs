//! Decoding of Python pickles, protocols 0 through 2, without Python.
//!
//! Besides the plain data types this handles the "foreign" objects that
//! show up in scientific data: complex numbers, longs, `OrderedDict`,
//! legacy `Numeric` arrays, `array.array` and 1-D NumPy arrays. Anything
//! else decodes to a placeholder tuple of its global name and arguments.
//!
//! See `demos/dump.rs` for a command-line dumper.
//!
//! Something to get you started:
//!
//! ```rust
//! use pickle_loader::{loads, Value};
//!
//! // pickle.dumps([1, 2.5, "x"], 2)
//! let val = loads(b"\x80\x02]q\x00(K\x01G@\x04\x00\x00\x00\x00\x00\x00U\x01xq\x01e.").unwrap();
//! assert_eq!(
//!     val,
//!     Value::list(vec![Value::from(1i64), Value::from(2.5), Value::from("x")])
//! );
//! ```
//!
//! And a NumPy `uint32` array:
//!
//! ```rust
//! use pickle_loader::{loads, TypedVector, Value};
//!
//! let pickled = b"\x80\x02cnumpy.core.multiarray\n_reconstruct\nq\x01cnumpy\nndarray\nq\x02\
//!     K\x00\x85U\x01b\x87Rq\x03(K\x01K\x03\x85cnumpy\ndtype\nq\x04U\x02u4K\x00K\x01\x87Rq\x05\
//!     (K\x03U\x01<NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb\x89U\x0c\
//!     \x0f\x00\x00\x00\x10\x00\x00\x00\x11\x00\x00\x00tb.";
//! let val = loads(pickled).unwrap();
//! assert_eq!(val, Value::vector(TypedVector::U32(vec![15, 16, 17])));
//! ```

/// Decoded errors.
pub mod error;

/// The pickle virtual machine.
pub mod eval;

/// Factories for REDUCE and BUILD, and the decode environment.
pub mod factory;

mod numeric;

/// NumPy array reconstruction.
pub mod numpy;

/// Pickle operations.
pub mod ops;

/// Parsers for turning the head of a `&[u8]` into a pickle operation.
pub mod parsers;

/// The Value type you get from decoding.
pub mod value;

pub use crate::error::{DecodeError, ErrorKind};

pub use crate::eval::{loads, Unpickler};

pub use crate::factory::{Environment, FactoryRegistry};

pub use crate::value::{Int, PickleDict, TypedVector, Value};
