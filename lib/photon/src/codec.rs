//! Payload encoding and decoding for the frame protocol.
//!
//! Every message on the wire is `|u32 length| |u32 type| |fields…|`. The byte
//! order of all integer fields is pinned at build time through the
//! `big-endian` cargo feature and surfaced as the [`NetOrder`] alias so both
//! peers agree by construction.

use crate::request::{EquationType, ErrorCode, Point, Request, RequestKind};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

#[cfg(feature = "big-endian")]
pub type NetOrder = byteorder::BigEndian;
#[cfg(not(feature = "big-endian"))]
pub type NetOrder = byteorder::LittleEndian;

/// Size of the length prefix preceding every payload.
pub const HEADER_SIZE: usize = 4;

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Reasons a payload fails to decode. All of them map to `CorruptedData` on
/// the wire except `UnknownKind`, which the dispatcher reports as
/// `InvalidRequestType`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// A field ran past the end of the payload.
    Truncated,
    /// Bytes were left over after the last declared field.
    TrailingBytes(usize),
    UnknownKind(u32),
    UnknownErrorCode(u32),
    UnknownEquation(u32),
    /// A length-prefixed string was not valid UTF-8.
    BadString,
}

impl From<io::Error> for DecodeError {
    #[inline]
    fn from(_: io::Error) -> DecodeError {
        DecodeError::Truncated
    }
}

/// Serializes a request into its payload bytes (type discriminator plus
/// fields in declaration order).
pub fn encode(request: &Request) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    write_request(request, &mut payload).expect("infallible write into Vec");
    payload
}

/// Prepends the `u32` length header to a payload.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
    framed
        .write_u32::<NetOrder>(payload.len() as u32)
        .expect("infallible write into Vec");
    framed.extend_from_slice(payload);
    framed
}

/// `frame(encode(request))` in one step.
pub fn encode_framed(request: &Request) -> Vec<u8> {
    frame(&encode(request))
}

/// Reads only the leading discriminator of a payload.
pub fn peek_kind(payload: &[u8]) -> DecodeResult<RequestKind> {
    let mut cursor = Cursor::new(payload);
    let raw = cursor.read_u32::<NetOrder>()?;
    RequestKind::from_wire(raw).ok_or(DecodeError::UnknownKind(raw))
}

/// Fully decodes a payload. Fails on truncation, trailing garbage, unknown
/// discriminators/enums and malformed strings.
pub fn decode(payload: &[u8]) -> DecodeResult<Request> {
    let mut cursor = Cursor::new(payload);
    let raw = cursor.read_u32::<NetOrder>()?;
    let kind = RequestKind::from_wire(raw).ok_or(DecodeError::UnknownKind(raw))?;

    let request = match kind {
        RequestKind::Invalid => {
            let raw_code = cursor.read_u32::<NetOrder>()?;
            let code =
                ErrorCode::from_wire(raw_code).ok_or(DecodeError::UnknownErrorCode(raw_code))?;
            let text = read_string(&mut cursor)?;
            Request::Invalid { code, text }
        }
        RequestKind::SortArray => Request::SortArray {
            numbers: read_i32_seq(&mut cursor)?,
        },
        RequestKind::FindPrimes => {
            let x_from = cursor.read_i32::<NetOrder>()?;
            let x_to = cursor.read_i32::<NetOrder>()?;
            let primes = read_i32_seq(&mut cursor)?;
            Request::FindPrimes { x_from, x_to, primes }
        }
        RequestKind::CalcFunction => {
            let raw_eq = cursor.read_u32::<NetOrder>()?;
            let equation =
                EquationType::from_wire(raw_eq).ok_or(DecodeError::UnknownEquation(raw_eq))?;
            let x_from = cursor.read_i32::<NetOrder>()?;
            let x_to = cursor.read_i32::<NetOrder>()?;
            let x_step = cursor.read_i32::<NetOrder>()?;
            let a = cursor.read_i32::<NetOrder>()?;
            let b = cursor.read_i32::<NetOrder>()?;
            let c = cursor.read_i32::<NetOrder>()?;
            let points = read_point_seq(&mut cursor)?;
            Request::CalcFunction {
                equation,
                x_from,
                x_to,
                x_step,
                a,
                b,
                c,
                points,
            }
        }
        RequestKind::CancelTask => Request::CancelTask,
        RequestKind::ProgressRange => {
            let minimum = cursor.read_i32::<NetOrder>()?;
            let maximum = cursor.read_i32::<NetOrder>()?;
            Request::ProgressRange { minimum, maximum }
        }
        RequestKind::ProgressValue => Request::ProgressValue {
            value: cursor.read_i32::<NetOrder>()?,
        },
    };

    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(DecodeError::TrailingBytes(payload.len() - consumed));
    }
    Ok(request)
}

fn write_request<W: Write>(request: &Request, out: &mut W) -> io::Result<()> {
    out.write_u32::<NetOrder>(request.kind().into())?;
    match request {
        Request::Invalid { code, text } => {
            out.write_u32::<NetOrder>((*code).into())?;
            write_string(text, out)?;
        }
        Request::SortArray { numbers } => write_i32_seq(numbers, out)?,
        Request::FindPrimes { x_from, x_to, primes } => {
            out.write_i32::<NetOrder>(*x_from)?;
            out.write_i32::<NetOrder>(*x_to)?;
            write_i32_seq(primes, out)?;
        }
        Request::CalcFunction {
            equation,
            x_from,
            x_to,
            x_step,
            a,
            b,
            c,
            points,
        } => {
            out.write_u32::<NetOrder>((*equation).into())?;
            out.write_i32::<NetOrder>(*x_from)?;
            out.write_i32::<NetOrder>(*x_to)?;
            out.write_i32::<NetOrder>(*x_step)?;
            out.write_i32::<NetOrder>(*a)?;
            out.write_i32::<NetOrder>(*b)?;
            out.write_i32::<NetOrder>(*c)?;
            out.write_u32::<NetOrder>(points.len() as u32)?;
            for point in points {
                out.write_i32::<NetOrder>(point.x)?;
                out.write_i32::<NetOrder>(point.y)?;
            }
        }
        Request::CancelTask => {}
        Request::ProgressRange { minimum, maximum } => {
            out.write_i32::<NetOrder>(*minimum)?;
            out.write_i32::<NetOrder>(*maximum)?;
        }
        Request::ProgressValue { value } => out.write_i32::<NetOrder>(*value)?,
    }
    Ok(())
}

pub(crate) fn write_string<W: Write>(text: &str, out: &mut W) -> io::Result<()> {
    out.write_u32::<NetOrder>(text.len() as u32)?;
    out.write_all(text.as_bytes())
}

pub(crate) fn read_string(cursor: &mut Cursor<&[u8]>) -> DecodeResult<String> {
    let len = cursor.read_u32::<NetOrder>()? as usize;
    if len > remaining(cursor) {
        return Err(DecodeError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::BadString)
}

fn write_i32_seq<W: Write>(values: &[i32], out: &mut W) -> io::Result<()> {
    out.write_u32::<NetOrder>(values.len() as u32)?;
    for value in values {
        out.write_i32::<NetOrder>(*value)?;
    }
    Ok(())
}

fn read_i32_seq(cursor: &mut Cursor<&[u8]>) -> DecodeResult<Vec<i32>> {
    let count = cursor.read_u32::<NetOrder>()? as usize;
    if count.checked_mul(4).map_or(true, |need| need > remaining(cursor)) {
        return Err(DecodeError::Truncated);
    }
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(cursor.read_i32::<NetOrder>()?);
    }
    Ok(values)
}

fn read_point_seq(cursor: &mut Cursor<&[u8]>) -> DecodeResult<Vec<Point>> {
    let count = cursor.read_u32::<NetOrder>()? as usize;
    if count.checked_mul(8).map_or(true, |need| need > remaining(cursor)) {
        return Err(DecodeError::Truncated);
    }
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let x = cursor.read_i32::<NetOrder>()?;
        let y = cursor.read_i32::<NetOrder>()?;
        points.push(Point::new(x, y));
    }
    Ok(points)
}

#[inline]
fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}
