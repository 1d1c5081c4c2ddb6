//! RESP request encoder.
//!
//! Encodes command arguments into the RESP bulk string array wire format:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`
//!
//! Requests are self-delimiting, so a transaction is just the encoded
//! `MULTI`, the encoded commands and the encoded `EXEC` back to back.

use bytes::{BufMut, Bytes, BytesMut};
use itoa::Buffer;

use crate::error::{Error, Result};

/// One command argument, before coercion to its wire bytes.
///
/// Byte strings pass through unchanged, integers use their decimal form
/// and floats use the shortest representation that round-trips.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Arg {
    /// Append `$<len>\r\n<bytes>\r\n` for this argument.
    fn write_bulk(&self, buf: &mut BytesMut, itoa_buf: &mut Buffer) -> Result<()> {
        let mut ryu_buf = ryu::Buffer::new();
        let data: &[u8] = match self {
            Self::Bytes(b) => b,
            Self::Int(i) => itoa_buf.format(*i).as_bytes(),
            Self::UInt(u) => itoa_buf.format(*u).as_bytes(),
            Self::Float(f) if f.is_nan() => {
                return Err(Error::Encoding("NaN cannot be sent as a command argument".into()));
            }
            Self::Float(f) => ryu_buf.format(*f).as_bytes(),
        };
        // The digits may live in `itoa_buf`, so format the length separately.
        let mut len_buf = Buffer::new();
        buf.put_u8(b'$');
        buf.put_slice(len_buf.format(data.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(data);
        buf.put_slice(b"\r\n");
        Ok(())
    }

    /// Upper bound of the encoded size, for buffer pre-allocation.
    fn encoded_len_hint(&self) -> usize {
        let body = match self {
            Self::Bytes(b) => b.len(),
            Self::Int(_) | Self::UInt(_) => 20,
            Self::Float(_) => 24,
        };
        1 + 20 + 2 + body + 2
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Bytes(Bytes::from(s))
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Arg {
    fn from(b: &[u8; N]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(i: $t) -> Self {
                Self::Int(i as i64)
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(u: $t) -> Self {
                Self::UInt(u as u64)
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64, isize);
impl_from_unsigned!(u8, u16, u32, u64, usize);

/// A command: its name followed by its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<Arg>,
}

impl Command {
    /// Start a command with the given name.
    pub fn new(name: impl Into<Arg>) -> Self {
        Self {
            args: vec![name.into()],
        }
    }

    /// Build a command from an already-collected argument list
    /// (first element is the name).
    pub fn from_args(args: Vec<Arg>) -> Self {
        Self { args }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append every argument from `iter`.
    pub fn args<I, A>(mut self, iter: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// All arguments, name included.
    pub fn as_args(&self) -> &[Arg] {
        &self.args
    }

    /// Append the RESP request encoding to `buf`.
    ///
    /// On error nothing is appended.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if self.args.is_empty() {
            return Err(Error::Encoding("command has no name".into()));
        }
        let start = buf.len();
        buf.reserve(1 + 20 + 2 + self.args.iter().map(Arg::encoded_len_hint).sum::<usize>());

        let mut itoa_buf = Buffer::new();
        buf.put_u8(b'*');
        buf.put_slice(itoa_buf.format(self.args.len()).as_bytes());
        buf.put_slice(b"\r\n");
        for arg in &self.args {
            if let Err(e) = arg.write_bulk(buf, &mut itoa_buf) {
                buf.truncate(start);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Encode this command into a standalone request.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode a command given as raw byte arguments.
///
/// Infallible: every argument is already bytes.
///
/// # Example
/// ```ignore
/// let bytes = encode_command(&[b"SET", b"key", b"value"]);
/// // → *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
/// ```
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let mut cap = 1 + 10 + 2; // '*' + max_digits(usize) + \r\n
    for arg in args {
        cap += 1 + 10 + 2 + arg.len() + 2; // '$' + len + \r\n + data + \r\n
    }

    let mut buf = BytesMut::with_capacity(cap);
    let mut itoa_buf = Buffer::new();

    buf.put_u8(b'*');
    buf.put_slice(itoa_buf.format(args.len()).as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(itoa_buf.format(arg.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }

    buf.freeze()
}

/// Concatenate already-encoded commands, optionally bracketed by
/// `MULTI` / `EXEC`.
pub fn encode_group(commands: &[Bytes], transactional: bool) -> Bytes {
    let body: usize = commands.iter().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(body + 32);
    if transactional {
        buf.put_slice(&encode_command(&[b"MULTI"]));
    }
    for cmd in commands {
        buf.put_slice(cmd);
    }
    if transactional {
        buf.put_slice(&encode_command(&[b"EXEC"]));
    }
    buf.freeze()
}

/// `MULTI`, the commands, `EXEC`.
pub fn encode_transaction(commands: &[Bytes]) -> Bytes {
    encode_group(commands, true)
}

/// Per-connection bootstrap block: `AUTH` when a password is set, then
/// `SELECT <db>`.
///
/// Returns the bytes and the number of `+OK` replies they will produce.
pub fn encode_handshake(username: Option<&str>, password: Option<&str>, db: u8) -> (Bytes, usize) {
    let mut buf = BytesMut::new();
    let mut replies = 0;
    if let Some(pass) = password {
        let auth = match username {
            Some(user) => encode_command(&[b"AUTH", user.as_bytes(), pass.as_bytes()]),
            None => encode_command(&[b"AUTH", pass.as_bytes()]),
        };
        buf.put_slice(&auth);
        replies += 1;
    }
    let mut itoa_buf = Buffer::new();
    buf.put_slice(&encode_command(&[b"SELECT", itoa_buf.format(db).as_bytes()]));
    replies += 1;
    (buf.freeze(), replies)
}

/// Helper macro for building commands ergonomically.
///
/// Usage:
/// ```ignore
/// let set = cmd!("SET", "mykey", 42);
/// let get = cmd!("GET", key_var);
/// ```
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {{
        $crate::resp::writer::Command::new($name)$(.arg($arg))*
    }};
}

// ── Tests ──────────────────────────────────────────────────────────
