//! Pipeline connection state machine.
//!
//! Owns everything about one connection except the socket itself: the
//! FIFO of in-flight command groups, the unattributed receive buffer and
//! the pre-handshake write buffer. The I/O driver feeds it events
//! (`on_connected`, `on_data`, `on_closed`) and writes whatever bytes it
//! hands back; keeping it free of I/O makes chunking behaviour testable
//! byte by byte.
//!
//! ```text
//! Idle ──begin_connect──▶ Connecting ──on_connected──▶ Connected
//!   │                          │                           │
//!   └──────────────────────────┴────────on_closed─────────▶ Closed
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::resp::ondemand::{try_extract, ExchangeShape, Extract, Reply};
use crate::resp::writer::encode_group;

/// Single-assignment result slot for one command group.
pub type ResultSink = oneshot::Sender<Result<Reply>>;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// One submission: encoded bytes, the reply shape they produce, and where
/// the outcome goes.
#[derive(Debug)]
pub struct CommandGroup {
    shape: ExchangeShape,
    /// Wire bytes; emptied once handed to the writer.
    payload: Bytes,
    /// `None` for handshake groups, whose outcome nobody observes.
    sink: Option<ResultSink>,
}

impl CommandGroup {
    /// Build a group from pre-encoded commands.
    ///
    /// Returns the group and the receiving end of its result sink.
    pub fn new(
        commands: &[Bytes],
        transactional: bool,
    ) -> (Self, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let group = Self {
            shape: ExchangeShape::commands(commands.len(), transactional),
            payload: encode_group(commands, transactional),
            sink: Some(tx),
        };
        (group, rx)
    }

    fn handshake(payload: Bytes, replies: usize) -> Self {
        Self {
            shape: ExchangeShape::handshake(replies),
            payload,
            sink: None,
        }
    }

    pub fn shape(&self) -> &ExchangeShape {
        &self.shape
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_handshake(&self) -> bool {
        self.sink.is_none()
    }

    /// True if the group's exchange contains no reply bytes at all.
    fn expects_no_reply(&self) -> bool {
        self.shape.handshake_replies == 0 && !self.shape.transactional && self.shape.commands == 0
    }

    /// Deliver the outcome. A dropped result handle is not an error: the
    /// group was still written and its replies still consumed.
    fn resolve(self, outcome: Result<Reply>) {
        if let Some(sink) = self.sink {
            let _ = sink.send(outcome);
        }
    }
}

/// I/O-free core of one pipelined connection.
#[derive(Debug)]
pub struct Pipeline {
    state: ConnState,
    handshake: Bytes,
    handshake_replies: usize,
    /// Written (or buffered-for-write) groups awaiting replies, oldest first.
    pending: VecDeque<CommandGroup>,
    /// Received bytes not yet attributed to a resolved group.
    recv: BytesMut,
    /// Bytes accumulated while connecting; handshake first.
    outbox: BytesMut,
    /// `recv` length below which the head group cannot complete.
    need: usize,
    /// Extraction passes run over `recv`.
    scans: usize,
    max_buffer_size: usize,
}

impl Pipeline {
    pub fn new(config: &ConnectionConfig) -> Self {
        let (handshake, handshake_replies) = config.handshake();
        Self {
            state: ConnState::Idle,
            handshake,
            handshake_replies,
            pending: VecDeque::new(),
            recv: BytesMut::new(),
            outbox: BytesMut::new(),
            need: 0,
            scans: 0,
            max_buffer_size: config.max_buffer_size,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Number of groups awaiting their replies (handshake included).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while any caller-visible group still awaits replies.
    pub fn awaiting_replies(&self) -> bool {
        self.pending.iter().any(|g| !g.is_handshake())
    }

    /// Bytes received but not yet attributed to any group.
    pub fn unparsed_len(&self) -> usize {
        self.recv.len()
    }

    /// Idle → Connecting. Queues the handshake ahead of everything else.
    ///
    /// No-op in any other state.
    pub fn begin_connect(&mut self) {
        if self.state != ConnState::Idle {
            tracing::debug!(state = ?self.state, "begin_connect ignored");
            return;
        }
        self.state = ConnState::Connecting;
        self.outbox.extend_from_slice(&self.handshake);
        self.pending.push_back(CommandGroup::handshake(
            self.handshake.clone(),
            self.handshake_replies,
        ));
        tracing::debug!(handshake_replies = self.handshake_replies, "connecting");
    }

    /// Queue a group.
    ///
    /// Returns bytes to write right away when connected; while connecting
    /// the bytes are buffered behind the handshake instead. On a closed
    /// connection the group fails immediately.
    pub fn submit(&mut self, mut group: CommandGroup) -> Option<Bytes> {
        match self.state {
            ConnState::Closed => {
                group.resolve(Err(Error::connection_closed("connection is closed")));
                None
            }
            ConnState::Idle | ConnState::Connecting => {
                self.begin_connect();
                self.outbox.extend_from_slice(&group.payload);
                group.payload = Bytes::new();
                self.enqueue(group);
                None
            }
            ConnState::Connected => {
                let payload = std::mem::take(&mut group.payload);
                self.enqueue(group);
                (!payload.is_empty()).then_some(payload)
            }
        }
    }

    fn enqueue(&mut self, group: CommandGroup) {
        // Nothing ahead of it and nothing to wait for: resolve in place.
        if self.pending.is_empty() && group.expects_no_reply() {
            group.resolve(Ok(Reply::Empty));
            return;
        }
        self.pending.push_back(group);
    }

    /// Connecting → Connected. Returns the buffered bytes, handshake first.
    pub fn on_connected(&mut self) -> Bytes {
        if self.state != ConnState::Connecting {
            tracing::debug!(state = ?self.state, "on_connected ignored");
            return Bytes::new();
        }
        self.state = ConnState::Connected;
        let flushed = self.outbox.split().freeze();
        tracing::debug!(
            bytes = flushed.len(),
            pending = self.pending.len(),
            "connected, flushing buffered writes"
        );
        flushed
    }

    /// Feed received bytes and resolve every group they complete, in order.
    ///
    /// Returns how many groups were resolved. On a protocol violation the
    /// affected group gets the violation, the connection is torn down and
    /// the violation is returned so the driver drops the socket.
    pub fn on_data(&mut self, chunk: &[u8]) -> Result<usize> {
        if self.state != ConnState::Connected {
            tracing::warn!(
                state = ?self.state,
                bytes = chunk.len(),
                "dropping bytes received while not connected"
            );
            return Ok(0);
        }
        if self.recv.len() + chunk.len() > self.max_buffer_size {
            let violation = Error::Protocol(format!(
                "reply too large: receive buffer would exceed {} bytes",
                self.max_buffer_size
            ));
            self.tear_down(violation.clone());
            return Err(violation);
        }
        self.recv.extend_from_slice(chunk);
        tracing::trace!(bytes = chunk.len(), buffered = self.recv.len(), "received");
        if self.recv.len() < self.need {
            return Ok(0);
        }

        self.scans += 1;
        tracing::trace!(scans = self.scans, buffered = self.recv.len(), "extracting");
        self.need = 0;
        let mut buf = self.recv.split().freeze();
        let mut resolved = 0;
        let outcome = loop {
            let Some(head) = self.pending.front() else {
                break Ok(());
            };
            match try_extract(&buf, &head.shape) {
                Ok(Extract::NotReady { need }) => {
                    self.need = need;
                    break Ok(());
                }
                Ok(Extract::Ready { reply, remainder }) => {
                    buf = remainder;
                    if let Some(group) = self.pending.pop_front() {
                        group.resolve(Ok(reply));
                    }
                    resolved += 1;
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(violation) = outcome {
            self.tear_down(violation.clone());
            return Err(violation);
        }

        self.recv.extend_from_slice(&buf);
        Ok(resolved)
    }

    /// Any state → Closed. Every pending group fails with `reason`, oldest
    /// first. Returns how many groups were failed.
    pub fn on_closed(&mut self, reason: Error) -> usize {
        if self.state != ConnState::Closed {
            tracing::debug!(from = ?self.state, reason = %reason, "connection closed");
        }
        self.state = ConnState::Closed;
        self.recv.clear();
        self.outbox.clear();
        self.need = 0;

        let mut failed = 0;
        while let Some(group) = self.pending.pop_front() {
            group.resolve(Err(reason.clone()));
            failed += 1;
        }
        failed
    }

    /// Fail the head group with `violation` and close.
    ///
    /// A rejected handshake dooms every queued group, so they all get the
    /// violation rather than a generic connection failure.
    fn tear_down(&mut self, violation: Error) {
        tracing::warn!(
            error = %violation,
            pending = self.pending.len(),
            "protocol violation, tearing down connection"
        );
        if let Some(head) = self.pending.pop_front() {
            if head.is_handshake() {
                for group in self.pending.drain(..) {
                    group.resolve(Err(violation.clone()));
                }
            } else {
                head.resolve(Err(violation.clone()));
            }
        }
        self.on_closed(Error::connection_closed(format!(
            "connection torn down after {violation}"
        )));
    }
}

// ── Tests ──────────────────────────────────────────────────────────
