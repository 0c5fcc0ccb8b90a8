use std::str::Utf8Error;

use nom::{
    bytes::complete::*, combinator::*, error as ne, multi::*, number::complete::*, sequence::tuple,
    *,
};

use crate::ops::*;

/// A newline terminated run of bytes, without the newline.
fn parse_line_nl<'a, E>(i: &'a [u8]) -> IResult<&'a [u8], &'a [u8], E>
where
    E: ne::ParseError<&'a [u8]>,
{
    let (i, s) = take_till(|c| c == b'\n')(i)?;
    let (i, _) = tag(b"\n")(i)?;
    IResult::Ok((i, s))
}

fn parse_string_nl<'a, E>(i: &'a [u8]) -> IResult<&'a [u8], &'a str, E>
where
    E: ne::ParseError<&'a [u8]> + ne::FromExternalError<&'a [u8], Utf8Error>,
{
    map_res(parse_line_nl, std::str::from_utf8)(i)
}

/// Parse a single op from the head of the input. It's a nom parser.
///
/// Opcodes outside of protocols 0-2 (and the handful of protocol 0-2
/// opcodes this crate refuses to evaluate) come back as
/// [`PickleOp::Unsupported`] with their operand left unconsumed.
pub fn parse_op<'a, E>(i: &'a [u8]) -> IResult<&'a [u8], PickleOp<'a>, E>
where
    E: ne::ParseError<&'a [u8]> + ne::FromExternalError<&'a [u8], Utf8Error>,
{
    let (i, opcode) = u8(i)?;
    IResult::Ok((
        i,
        match opcode {
            p_op::MARK => PickleOp::MARK,
            p_op::STOP => PickleOp::STOP,
            p_op::FLOAT => return map(parse_string_nl, PickleOp::FLOAT)(i),
            p_op::BINFLOAT => return map(be_f64, PickleOp::BINFLOAT)(i),
            p_op::INT => return map(parse_string_nl, PickleOp::INT)(i),
            p_op::BININT => return map(le_i32, PickleOp::BININT)(i),
            p_op::BININT1 => return map(u8, PickleOp::BININT1)(i),
            p_op::BININT2 => return map(le_u16, PickleOp::BININT2)(i),
            p_op::LONG => return map(parse_string_nl, PickleOp::LONG)(i),
            p_op::LONG1 => return map(length_data(u8), PickleOp::LONG1)(i),
            p_op::LONG4 => return map(length_data(le_u32), PickleOp::LONG4)(i),
            p_op::NONE => PickleOp::NONE,
            p_op::NEWTRUE => PickleOp::NEWTRUE,
            p_op::NEWFALSE => PickleOp::NEWFALSE,
            p_op::STRING => return map(parse_line_nl, PickleOp::STRING)(i),
            p_op::BINSTRING => return map(length_data(le_u32), PickleOp::BINSTRING)(i),
            p_op::SHORT_BINSTRING => return map(length_data(u8), PickleOp::SHORT_BINSTRING)(i),
            p_op::APPEND => PickleOp::APPEND,
            p_op::APPENDS => PickleOp::APPENDS,
            p_op::LIST => PickleOp::LIST,
            p_op::EMPTY_LIST => PickleOp::EMPTY_LIST,
            p_op::DICT => PickleOp::DICT,
            p_op::EMPTY_DICT => PickleOp::EMPTY_DICT,
            p_op::SETITEM => PickleOp::SETITEM,
            p_op::SETITEMS => PickleOp::SETITEMS,
            p_op::TUPLE => PickleOp::TUPLE,
            p_op::EMPTY_TUPLE => PickleOp::EMPTY_TUPLE,
            p_op::TUPLE1 => PickleOp::TUPLE1,
            p_op::TUPLE2 => PickleOp::TUPLE2,
            p_op::TUPLE3 => PickleOp::TUPLE3,
            p_op::PUT => return map(parse_string_nl, PickleOp::PUT)(i),
            p_op::BINPUT => return map(u8, PickleOp::BINPUT)(i),
            p_op::LONG_BINPUT => return map(le_u32, PickleOp::LONG_BINPUT)(i),
            p_op::GET => return map(parse_string_nl, PickleOp::GET)(i),
            p_op::BINGET => return map(u8, PickleOp::BINGET)(i),
            p_op::LONG_BINGET => return map(le_u32, PickleOp::LONG_BINGET)(i),
            p_op::GLOBAL => {
                return map(tuple((parse_string_nl, parse_string_nl)), |(mn, gn)| {
                    PickleOp::GLOBAL(mn, gn)
                })(i);
            }
            p_op::REDUCE => PickleOp::REDUCE,
            p_op::BUILD => PickleOp::BUILD,
            p_op::NEWOBJ => PickleOp::NEWOBJ,
            p_op::OBJ => PickleOp::OBJ,
            p_op::PROTO => return map(u8, PickleOp::PROTO)(i),
            other => PickleOp::Unsupported(other),
        },
    ))
}
