use bytes::{BufMut, Bytes, BytesMut};
use itoa::Buffer;

/// RESP2 reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// *2\r\n…
    Array(Vec<RespValue>),
    /// $-1\r\n
    Null,
    /// *-1\r\n
    NullArray,
}

// ── Convenience accessors ──────────────────────────────────────────

impl RespValue {
    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Returns true when this value is a nil bulk string or a nil array.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::NullArray)
    }

    /// Returns true when this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the error message if this is an error value.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// True if this is the simple string `literal`.
    pub fn is_status(&self, literal: &str) -> bool {
        matches!(self, Self::SimpleString(s) if s == literal)
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Array(_) => "array",
            Self::Null => "null",
            Self::NullArray => "null_array",
        }
    }

    // ── Serialization ──

    /// Append the RESP reply encoding of this value to `buf`.
    ///
    /// Simple and error strings are written verbatim; callers must not
    /// embed `\r\n` in them.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut itoa_buf = Buffer::new();
        match self {
            Self::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(itoa_buf.format(*i).as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::BulkString(b) => {
                buf.put_u8(b'$');
                buf.put_slice(itoa_buf.format(b.len()).as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(b);
                buf.put_slice(b"\r\n");
            }
            Self::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(itoa_buf.format(items.len()).as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode_into(buf);
                }
            }
            Self::Null => buf.put_slice(b"$-1\r\n"),
            Self::NullArray => buf.put_slice(b"*-1\r\n"),
        }
    }

    /// Encode this value as a standalone RESP reply.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
