//! Streaming RESP2 reply decoder.
//!
//! [`decode`] strips complete top-level values off the front of a buffer
//! and hands back whatever is left. A buffer that ends mid-value is not an
//! error: the caller keeps the bytes and retries once more arrive, no
//! earlier than [`Decoded::need`] bytes.
//!
//! The decoder works on `Bytes` (ref-counted) so bulk strings and the
//! remainder are zero-copy `slice()`s of the input.

use bytes::Bytes;
use memchr::memchr;

use crate::error::{Error, Result};
use crate::resp::types::RespValue;

/// Shortest possible frame (`+\r\n`).
pub const MIN_FRAME_LEN: usize = 3;

/// Deepest array nesting accepted in one reply.
pub const MAX_DEPTH: usize = 128;

/// Why [`decode`] stopped collecting values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// `max_items` values were collected.
    Limit,
    /// Every byte was consumed.
    Exhausted,
    /// The buffer ends in the middle of a value.
    Partial,
    /// The next byte is not a RESP2 type marker.
    UnknownType(u8),
}

/// Output of [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// False when not even one value could be decoded, or the buffer is
    /// shorter than a minimal frame.
    pub complete: bool,
    /// Decoded top-level values, in stream order.
    pub items: Vec<RespValue>,
    /// Unconsumed bytes. The whole input when `complete` is false.
    pub remainder: Bytes,
    pub stop: Stop,
    /// Lower bound on the input length at which decoding the next value
    /// can succeed. Only meaningful for `Partial`, `Exhausted` and
    /// incomplete results; a bulk string whose header has arrived reports
    /// its exact end.
    pub need: usize,
}

impl Decoded {
    fn incomplete(buf: &Bytes, need: usize) -> Self {
        Self {
            complete: false,
            items: Vec::new(),
            remainder: buf.clone(),
            stop: Stop::Partial,
            need,
        }
    }
}

/// Why a single value could not be parsed.
enum Fail {
    /// Input ends mid-value; at least this many bytes are needed in total.
    Need(usize),
    Bad(Error),
}

impl From<Error> for Fail {
    fn from(e: Error) -> Self {
        Self::Bad(e)
    }
}

type Parse<T> = std::result::Result<T, Fail>;

/// Decode up to `max_items` top-level values from the front of `buf`.
///
/// Stops at the item limit, at the end of the buffer, at an unrecognized
/// type byte, or at a value that has not fully arrived yet. Returns
/// `Err(Protocol)` only for bytes that can never become valid (bad
/// integers, missing terminators, negative lengths below -1, arrays nested
/// deeper than [`MAX_DEPTH`]).
pub fn decode(buf: &Bytes, max_items: Option<usize>) -> Result<Decoded> {
    decode_at_depth(buf, max_items, 0)
}

fn decode_at_depth(buf: &Bytes, max_items: Option<usize>, depth: usize) -> Result<Decoded> {
    if buf.len() < MIN_FRAME_LEN {
        return Ok(Decoded::incomplete(buf, MIN_FRAME_LEN));
    }

    let mut items = Vec::with_capacity(max_items.unwrap_or(1).min(64));
    let mut cursor = 0;
    let mut need = buf.len();
    let stop = loop {
        if cursor == buf.len() {
            need = buf.len() + MIN_FRAME_LEN;
            break Stop::Exhausted;
        }
        if max_items.is_some_and(|max| items.len() >= max) {
            break Stop::Limit;
        }
        let head = buf[cursor];
        if !is_type_byte(head) {
            break Stop::UnknownType(head);
        }
        match parse_value(buf, cursor, depth) {
            Ok((value, next)) => {
                items.push(value);
                cursor = next;
            }
            Err(Fail::Need(n)) => {
                if items.is_empty() {
                    return Ok(Decoded::incomplete(buf, n));
                }
                need = n;
                break Stop::Partial;
            }
            Err(Fail::Bad(e)) => return Err(e),
        }
    };

    Ok(Decoded {
        complete: true,
        items,
        remainder: buf.slice(cursor..),
        stop,
        need,
    })
}

// ── Helpers ────────────────────────────────────────────────────────

#[inline]
fn is_type_byte(b: u8) -> bool {
    matches!(b, b'+' | b'-' | b':' | b'$' | b'*')
}

fn unknown_type(b: u8) -> Error {
    Error::Protocol(format!("unknown RESP type byte: 0x{b:02x}"))
}

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Parse<usize> {
    let search = &buf[offset..];
    match memchr(b'\r', search) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 >= buf.len() {
                Err(Fail::Need(buf.len() + 1))
            } else if buf[abs + 1] == b'\n' {
                Ok(abs)
            } else {
                Err(Error::Protocol("expected \\n after \\r".into()).into())
            }
        }
        None => Err(Fail::Need(buf.len() + 2)),
    }
}

/// Read the line starting at `buf[offset]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Parse<(&[u8], usize)> {
    let cr = find_crlf(buf, offset)?;
    Ok((&buf[offset..cr], cr + 2))
}

/// Parse an integer from a byte slice (no allocations).
fn parse_int_from_bytes(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(Error::Protocol("empty integer".into()));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };

    if digits.is_empty() {
        return Err(Error::Protocol("integer has no digits".into()));
    }

    // Accumulate as negative so i64::MIN fits.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol(format!("invalid byte in integer: 0x{b:02x}")));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| Error::Protocol("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| Error::Protocol("integer overflow".into()))
    }
}

/// Parse a `$` / `*` length header, rejecting anything below -1.
fn parse_len(line: &[u8], what: &str) -> Result<i64> {
    let len = parse_int_from_bytes(line)?;
    if len < -1 {
        return Err(Error::Protocol(format!("invalid {what} length: {len}")));
    }
    Ok(len)
}

fn utf8_line(line: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|e| Error::Protocol(format!("invalid UTF-8 in {what}: {e}")))
}

// ── Type parsers ──────────────────────────────────────────────────

/// Parse the value whose type byte sits at `buf[offset]`, inside `depth`
/// enclosing arrays. Returns the value and the offset just past it.
fn parse_value(buf: &Bytes, offset: usize, depth: usize) -> Parse<(RespValue, usize)> {
    match buf[offset] {
        b'+' => {
            let (line, next) = read_line(buf, offset + 1)?;
            // Acknowledgements dominate transactional traffic.
            let s = match line {
                b"OK" => "OK".to_string(),
                b"QUEUED" => "QUEUED".to_string(),
                _ => utf8_line(line, "simple string")?,
            };
            Ok((RespValue::SimpleString(s), next))
        }
        b'-' => {
            let (line, next) = read_line(buf, offset + 1)?;
            Ok((RespValue::Error(utf8_line(line, "error")?), next))
        }
        b':' => {
            let (line, next) = read_line(buf, offset + 1)?;
            Ok((RespValue::Integer(parse_int_from_bytes(line)?), next))
        }
        b'$' => parse_bulk_string(buf, offset),
        b'*' => parse_array(buf, offset, depth),
        other => Err(unknown_type(other).into()),
    }
}

/// `$<length>\r\n<data>\r\n`  or  `$-1\r\n`
fn parse_bulk_string(buf: &Bytes, offset: usize) -> Parse<(RespValue, usize)> {
    let (line, next) = read_line(buf, offset + 1)?;
    let len = parse_len(line, "bulk string")?;
    if len == -1 {
        return Ok((RespValue::Null, next));
    }

    let data_end = usize::try_from(len)
        .ok()
        .and_then(|len| next.checked_add(len))
        .filter(|end| end.checked_add(2).is_some())
        .ok_or_else(|| Error::Protocol(format!("bulk string length too large: {len}")))?;
    if buf.len() < data_end + 2 {
        return Err(Fail::Need(data_end + 2));
    }
    if &buf[data_end..data_end + 2] != b"\r\n" {
        return Err(Error::Protocol("bulk string not terminated by \\r\\n".into()).into());
    }

    Ok((RespValue::BulkString(buf.slice(next..data_end)), data_end + 2))
}

/// `*<count>\r\n<elements>`  or  `*-1\r\n`
///
/// Elements are decoded by a nested [`decode`] limited to `count` items;
/// anything short of `count` means the array has not fully arrived.
fn parse_array(buf: &Bytes, offset: usize, depth: usize) -> Parse<(RespValue, usize)> {
    if depth >= MAX_DEPTH {
        return Err(Error::Protocol(format!(
            "RESP nesting too deep: more than {MAX_DEPTH} levels of arrays"
        ))
        .into());
    }
    let (line, next) = read_line(buf, offset + 1)?;
    let count = parse_len(line, "array")?;
    if count == -1 {
        return Ok((RespValue::NullArray, next));
    }
    if count == 0 {
        return Ok((RespValue::Array(Vec::new()), next));
    }

    let count = count as usize;
    let nested = decode_at_depth(&buf.slice(next..), Some(count), depth + 1)?;
    if !nested.complete || nested.items.len() < count {
        if let Stop::UnknownType(b) = nested.stop {
            return Err(unknown_type(b).into());
        }
        // `need` covers the next missing element; the others take at
        // least a minimal frame each.
        let missing = count - nested.items.len();
        let need = (missing - 1)
            .saturating_mul(MIN_FRAME_LEN)
            .saturating_add(next + nested.need);
        return Err(Fail::Need(need));
    }
    let end = buf.len() - nested.remainder.len();
    Ok((RespValue::Array(nested.items), end))
}

// ── Tests ──────────────────────────────────────────────────────────
