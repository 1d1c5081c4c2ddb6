//! On-demand exchange extraction.
//!
//! A command group produces a fixed, known sequence of replies: optional
//! handshake `+OK`s, then either the raw per-command replies or the
//! `MULTI`/`QUEUED…`/`EXEC` framing. [`try_extract`] decides whether that
//! whole sequence is already at the front of the receive buffer.
//!
//! Three outcomes are kept apart:
//! - `Ok(Extract::NotReady { need })`: wait until the buffer holds at
//!   least `need` bytes and call again.
//! - `Ok(Extract::Ready { .. })`: the exchange is complete.
//! - `Err(Error::Protocol(..))`: the bytes can never match; the stream is
//!   no longer trustworthy.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resp::parser::{decode, Decoded, Stop};
use crate::resp::types::RespValue;

/// `+OK\r\n`
pub const OK_REPLY_LEN: usize = 5;
/// `+QUEUED\r\n`
pub const QUEUED_REPLY_LEN: usize = 9;

/// Shape of one logical exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeShape {
    /// Leading `AUTH`/`SELECT` acknowledgements.
    pub handshake_replies: usize,
    /// Group was bracketed by `MULTI` / `EXEC`.
    pub transactional: bool,
    /// Number of user commands in the group.
    pub commands: usize,
}

impl ExchangeShape {
    /// Handshake-only exchange.
    pub fn handshake(replies: usize) -> Self {
        Self {
            handshake_replies: replies,
            transactional: false,
            commands: 0,
        }
    }

    /// Ordinary command group.
    pub fn commands(commands: usize, transactional: bool) -> Self {
        Self {
            handshake_replies: 0,
            transactional,
            commands,
        }
    }

    /// Fewest bytes that could possibly hold this exchange.
    ///
    /// Assumes every acknowledgement is the shortest legal one.
    pub fn min_len(&self) -> usize {
        let mut len = OK_REPLY_LEN * self.handshake_replies;
        if self.transactional {
            len += OK_REPLY_LEN + QUEUED_REPLY_LEN * self.commands;
        }
        len
    }
}

/// Result of one exchange, after the single-command unwrap.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Group with no commands (handshake-only or empty).
    Empty,
    /// Group with exactly one command.
    Value(RespValue),
    /// Group with two or more commands, in command order.
    Values(Vec<RespValue>),
}

impl Reply {
    fn from_results(mut results: Vec<RespValue>) -> Self {
        match results.len() {
            0 => Self::Empty,
            1 => Self::Value(results.remove(0)),
            _ => Self::Values(results),
        }
    }

    /// The single value, if this is a one-command reply.
    pub fn into_value(self) -> Option<RespValue> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// All values in command order (empty for `Empty`).
    pub fn into_values(self) -> Vec<RespValue> {
        match self {
            Self::Empty => Vec::new(),
            Self::Value(v) => vec![v],
            Self::Values(vs) => vs,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Outcome of [`try_extract`].
#[derive(Debug, Clone, PartialEq)]
pub enum Extract {
    /// Not all bytes of the exchange have arrived. `need` is a lower bound
    /// on the buffer length at which another attempt can succeed.
    NotReady { need: usize },
    /// The exchange is complete; `remainder` is everything after it.
    Ready { reply: Reply, remainder: Bytes },
}

/// Why a partial decode came up short.
enum Shortfall {
    Wait,
    Garbage(u8),
}

fn shortfall(out: &Decoded) -> Shortfall {
    match out.stop {
        Stop::UnknownType(b) => Shortfall::Garbage(b),
        _ => Shortfall::Wait,
    }
}

fn garbage(b: u8, context: &str) -> Error {
    Error::Protocol(format!("unexpected byte 0x{b:02x} while reading {context}"))
}

/// Describe a reply for violation messages, quoting server errors.
fn describe(value: &RespValue) -> String {
    match value {
        RespValue::SimpleString(s) => format!("+{s}"),
        RespValue::Error(msg) => format!("-{msg}"),
        other => other.type_name().to_string(),
    }
}

/// Decide whether one full exchange of `shape` sits at the front of `buf`
/// and extract it.
///
/// `buf` is never consumed on `NotReady` or on error; on `Ready` the
/// returned remainder is a zero-copy slice of it.
pub fn try_extract(buf: &Bytes, shape: &ExchangeShape) -> Result<Extract> {
    let min_len = shape.min_len();
    if buf.len() < min_len {
        return Ok(Extract::NotReady { need: min_len });
    }

    // `need` values from the decoder are relative to `rest`.
    let not_ready = |rest: &Bytes, need: usize| -> Result<Extract> {
        let need = (buf.len() - rest.len()).saturating_add(need);
        Ok(Extract::NotReady {
            need: need.max(min_len),
        })
    };

    let mut rest = buf.clone();

    // 1. Handshake acknowledgements, one at a time.
    for i in 0..shape.handshake_replies {
        let out = decode(&rest, Some(1))?;
        if !out.complete {
            return not_ready(&rest, out.need);
        }
        match out.items.first() {
            Some(v) if v.is_status("OK") => {}
            Some(v) => {
                return Err(Error::Protocol(format!(
                    "handshake reply {} rejected: expected +OK, got {}",
                    i + 1,
                    describe(v)
                )));
            }
            None => match shortfall(&out) {
                Shortfall::Garbage(b) => return Err(garbage(b, "handshake reply")),
                Shortfall::Wait => return not_ready(&rest, out.need),
            },
        }
        rest = out.remainder;
    }

    // 2. Command results, bare or inside the EXEC array.
    let results = if shape.transactional {
        match extract_transaction(&mut rest, shape.commands)? {
            Progress::Done(results) => results,
            Progress::Wait(need) => return not_ready(&rest, need),
        }
    } else if shape.commands == 0 {
        Vec::new()
    } else {
        let out = decode(&rest, Some(shape.commands))?;
        if !out.complete {
            return not_ready(&rest, out.need);
        }
        if out.items.len() < shape.commands {
            return match shortfall(&out) {
                Shortfall::Garbage(b) => Err(garbage(b, "command reply")),
                Shortfall::Wait => not_ready(&rest, out.need),
            };
        }
        rest = out.remainder;
        out.items
    };

    Ok(Extract::Ready {
        reply: Reply::from_results(results),
        remainder: rest,
    })
}

enum Progress {
    Done(Vec<RespValue>),
    /// Byte count needed, measured from the start of the transaction.
    Wait(usize),
}

/// `+OK`, `commands` × `+QUEUED`, then the EXEC array of results.
///
/// Advances `rest` only when the whole transaction is present.
fn extract_transaction(rest: &mut Bytes, commands: usize) -> Result<Progress> {
    let acks = decode(rest, Some(1 + commands))?;
    if !acks.complete {
        return Ok(Progress::Wait(acks.need));
    }

    // Acknowledgements that did arrive are final; check them before waiting.
    for (i, ack) in acks.items.iter().enumerate() {
        let expected = if i == 0 { "OK" } else { "QUEUED" };
        if !ack.is_status(expected) {
            return Err(Error::Protocol(if i == 0 {
                format!("MULTI rejected: expected +OK, got {}", describe(ack))
            } else {
                format!(
                    "command {i} of transaction not queued: got {}",
                    describe(ack)
                )
            }));
        }
    }
    if acks.items.len() < 1 + commands {
        return match shortfall(&acks) {
            Shortfall::Garbage(b) => Err(garbage(b, "transaction acknowledgement")),
            Shortfall::Wait => Ok(Progress::Wait(acks.need)),
        };
    }

    let acked = rest.len() - acks.remainder.len();
    let exec = decode(&acks.remainder, Some(1))?;
    if !exec.complete {
        return Ok(Progress::Wait(acked + exec.need));
    }
    let reply = match exec.items.into_iter().next() {
        Some(reply) => reply,
        None => {
            return match exec.stop {
                Stop::UnknownType(b) => Err(garbage(b, "EXEC reply")),
                _ => Ok(Progress::Wait(acked + exec.need)),
            };
        }
    };

    match reply {
        RespValue::Array(results) if results.len() == commands => {
            *rest = exec.remainder;
            Ok(Progress::Done(results))
        }
        RespValue::Array(results) => Err(Error::Protocol(format!(
            "EXEC returned {} results for {commands} commands",
            results.len()
        ))),
        RespValue::NullArray => Err(Error::Protocol(
            "transaction aborted: EXEC returned nil".into(),
        )),
        other => Err(Error::Protocol(format!(
            "EXEC did not return an array: got {}",
            describe(&other)
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
