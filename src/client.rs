//! Client facade.
//!
//! A [`Client`] is bound to one endpoint. It lazily spawns the connection
//! driver on first submission, turns command lists into command groups
//! and hands back a [`ResultHandle`] per submission without waiting for
//! the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::ConnectionConfig;
use crate::connection::pipeline::CommandGroup;
use crate::connection::tcp::ConnectionHandle;
use crate::error::{Error, Result};
use crate::resp::ondemand::Reply;
use crate::resp::types::RespValue;
use crate::resp::writer::Command;

// ── Client ─────────────────────────────────────────────────────────

/// Pipelined client for one endpoint.
///
/// Cheap to clone; clones share the connection. When the last clone is
/// dropped the connection finishes its pending groups and closes.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Arc<ConnectionConfig>,
    conn: Mutex<Option<ConnectionHandle>>,
}

impl Client {
    /// Create a client for `config`. Nothing is connected until the first
    /// submission.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                conn: Mutex::new(None),
            }),
        })
    }

    /// Create a client from a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(ConnectionConfig::from_url(url)?)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Submit `commands` wrapped in `MULTI`/`EXEC`.
    ///
    /// Do not put blocking commands (`BLPOP` and friends) in a transaction;
    /// use [`Client::submit_pipelined`] for those.
    pub fn submit(&self, commands: &[Command]) -> Result<ResultHandle> {
        self.submit_group(commands, true)
    }

    /// Submit `commands` back to back without transaction framing.
    pub fn submit_pipelined(&self, commands: &[Command]) -> Result<ResultHandle> {
        self.submit_group(commands, false)
    }

    /// Submit one command group.
    ///
    /// Encoding errors are returned here, before anything is queued; every
    /// other outcome arrives through the returned handle.
    pub fn submit_group(&self, commands: &[Command], transactional: bool) -> Result<ResultHandle> {
        let encoded = commands
            .iter()
            .map(Command::encode)
            .collect::<Result<Vec<Bytes>>>()?;
        let (group, rx) = CommandGroup::new(&encoded, transactional);
        self.dispatch(group);
        Ok(ResultHandle { rx })
    }

    /// Run a single command outside any transaction and return its reply.
    pub async fn execute(&self, command: &Command) -> Result<RespValue> {
        let reply = self.submit_pipelined(std::slice::from_ref(command))?.await?;
        reply
            .into_value()
            .ok_or_else(|| Error::Protocol("single command produced no reply".into()))
    }

    /// Hand `group` to the live connection, opening a new one if there is
    /// none or the previous driver has exited.
    fn dispatch(&self, group: CommandGroup) {
        let mut conn = self.inner.conn.lock();
        let group = match conn.as_ref() {
            Some(handle) => match handle.send(group) {
                Ok(()) => return,
                Err(group) => {
                    tracing::info!(
                        addr = %self.inner.config.primary_addr(),
                        "connection gone, reconnecting"
                    );
                    group
                }
            },
            None => group,
        };

        let handle = ConnectionHandle::spawn(Arc::clone(&self.inner.config));
        // A fresh driver holds its receiver until it exits, so this only
        // fails if it already died; the dropped sink then reports a
        // connection failure through the handle.
        let _ = handle.send(group);
        *conn = Some(handle);
    }
}

// ── ResultHandle ───────────────────────────────────────────────────

/// Pending outcome of one submission.
///
/// Resolves exactly once, in submission order relative to every other
/// handle from the same client. Await it, or call [`ResultHandle::wait`]
/// from a thread that is not running async code.
#[derive(Debug)]
#[must_use = "a ResultHandle does nothing unless awaited"]
pub struct ResultHandle {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl ResultHandle {
    /// Block the current thread until the outcome arrives.
    ///
    /// Panics if called from within an async execution context.
    pub fn wait(self) -> Result<Reply> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(sink_dropped()))
    }
}

fn sink_dropped() -> Error {
    Error::connection_closed("connection task ended before resolving the group")
}

impl Future for ResultHandle {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(sink_dropped())))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
