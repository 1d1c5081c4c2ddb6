//! Async TCP driver for one pipelined connection.
//!
//! A spawned task owns the `TcpStream` and a [`Pipeline`]. Submissions
//! arrive over an unbounded channel, are written in arrival order, and
//! replies are fed to the pipeline as they are read. Reads and writes are
//! multiplexed in one `select!` loop so a large outbound batch never
//! blocks reply processing.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::connection::pipeline::{CommandGroup, Pipeline};
use crate::error::{Error, Result};

/// Read buffer capacity reserved before each socket read (64 KB).
const READ_CHUNK: usize = 64 * 1024;

/// Submission side of a running connection driver.
///
/// Dropping every clone lets the driver finish outstanding groups and
/// close the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<CommandGroup>,
}

impl ConnectionHandle {
    /// Spawn a driver for `config`. Connecting starts immediately; groups
    /// sent meanwhile are buffered behind the handshake.
    pub fn spawn(config: Arc<ConnectionConfig>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        crate::runtime::spawn(drive(config, rx));
        Self { tx }
    }

    /// Hand a group to the driver.
    ///
    /// Gives the group back if the driver has already exited, so the
    /// caller can retry on a fresh connection.
    pub fn send(&self, group: CommandGroup) -> std::result::Result<(), CommandGroup> {
        self.tx.send(group).map_err(|e| e.0)
    }

    /// True once the driver has stopped accepting groups.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn connect(config: &ConnectionConfig) -> Result<TcpStream> {
    let addr = config.primary_addr();
    let stream = if config.connect_timeout_ms == 0 {
        TcpStream::connect(&addr).await?
    } else {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "connection to {addr} timed out after {timeout:?}"
                )))
            }
        }
    };
    stream.set_nodelay(true).ok(); // Disable Nagle for low latency
    Ok(stream)
}

/// Driver task body.
async fn drive(config: Arc<ConnectionConfig>, mut rx: mpsc::UnboundedReceiver<CommandGroup>) {
    let addr = config.primary_addr();
    let mut pipeline = Pipeline::new(&config);
    pipeline.begin_connect();
    tracing::debug!(%addr, db = config.db, "connecting");

    let mut accepting = true;
    let connecting = connect(&config);
    tokio::pin!(connecting);

    let connected = loop {
        tokio::select! {
            res = &mut connecting => break res,
            maybe = rx.recv(), if accepting => match maybe {
                Some(group) => {
                    pipeline.submit(group);
                }
                None => accepting = false,
            },
        }
    };

    let reason = match connected {
        Ok(mut stream) => {
            tracing::info!(%addr, "connected");
            let reason = run(&mut stream, &mut pipeline, &mut rx, accepting).await;
            if reason.is_none() {
                stream.shutdown().await.ok();
            }
            reason
        }
        Err(e) => Some(e),
    };

    let reason = match reason {
        Some(e) => {
            tracing::warn!(
                %addr,
                error = %e,
                pending = pipeline.pending_len(),
                "connection lost"
            );
            e
        }
        None => Error::connection_closed("client dropped"),
    };
    // Close intake before failing pending groups.
    rx.close();
    let failed = pipeline.on_closed(reason.clone());

    // Groups that raced the shutdown: the pipeline is closed, so
    // submitting fails each one immediately.
    let mut late = 0;
    while let Ok(group) = rx.try_recv() {
        pipeline.submit(group);
        late += 1;
    }
    tracing::debug!(%addr, reason = %reason, failed, late, "driver exiting");
}

/// Connected phase. Returns the failure that ended it, or `None` for a
/// graceful shutdown after every handle was dropped.
async fn run(
    stream: &mut TcpStream,
    pipeline: &mut Pipeline,
    rx: &mut mpsc::UnboundedReceiver<CommandGroup>,
    mut accepting: bool,
) -> Option<Error> {
    let (mut rd, mut wr) = stream.split();
    let mut inbuf = BytesMut::with_capacity(READ_CHUNK);
    let mut outbox = BytesMut::new();
    outbox.extend_from_slice(&pipeline.on_connected());

    loop {
        if !accepting && outbox.is_empty() && !pipeline.awaiting_replies() {
            return None;
        }
        if inbuf.capacity() < READ_CHUNK / 4 {
            inbuf.reserve(READ_CHUNK);
        }

        tokio::select! {
            maybe = rx.recv(), if accepting => match maybe {
                Some(group) => {
                    if let Some(bytes) = pipeline.submit(group) {
                        outbox.extend_from_slice(&bytes);
                    }
                }
                None => {
                    tracing::debug!(
                        pending = pipeline.pending_len(),
                        "all handles dropped, draining"
                    );
                    accepting = false;
                }
            },
            res = rd.read_buf(&mut inbuf) => match res {
                Ok(0) => {
                    return Some(Error::connection_closed("connection closed by server"));
                }
                Ok(_) => {
                    let chunk = inbuf.split();
                    if let Err(e) = pipeline.on_data(&chunk) {
                        return Some(e);
                    }
                }
                Err(e) => return Some(e.into()),
            },
            res = wr.write_buf(&mut outbox), if !outbox.is_empty() => match res {
                Ok(0) => {
                    return Some(Error::connection_closed("socket refused further writes"));
                }
                Ok(n) => tracing::trace!(bytes = n, queued = outbox.len(), "wrote"),
                Err(e) => return Some(e.into()),
            },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd;
    use crate::resp::ondemand::Reply;
    use crate::resp::types::RespValue;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn group(
        cmds: &[crate::resp::writer::Command],
        transactional: bool,
    ) -> (CommandGroup, oneshot::Receiver<Result<Reply>>) {
        let encoded: Vec<Bytes> = cmds.iter().map(|c| c.encode().unwrap()).collect();
        CommandGroup::new(&encoded, transactional)
    }

    /// Mock server: waits for `expect` request bytes, answers with
    /// `reply` (one byte per write if `dribble`), then reads until EOF.
    /// Resolves to everything the client sent.
    async fn mock_server(
        expect: usize,
        reply: Vec<u8>,
        dribble: bool,
    ) -> (Arc<ConnectionConfig>, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            while received.len() < expect {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return received;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if dribble {
                for byte in &reply {
                    socket.write_all(std::slice::from_ref(byte)).await.unwrap();
                    socket.flush().await.unwrap();
                }
            } else {
                socket.write_all(&reply).await.unwrap();
            }
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            received
        });

        (Arc::new(ConnectionConfig::new("127.0.0.1", port)), task)
    }

    fn handshake_len() -> usize {
        ConnectionConfig::default().handshake().0.len()
    }

    async fn pipelined_roundtrip(dribble: bool) {
        let (g1, rx1) = group(&[cmd!("SET", "a", "1")], false);
        let (g2, rx2) = group(&[cmd!("GET", "a"), cmd!("INCR", "n")], true);
        let (g3, rx3) = group(&[cmd!("GET", "missing")], false);
        let expect = handshake_len() + g1.payload().len() + g2.payload().len() + g3.payload().len();

        let reply =
            b"+OK\r\n+OK\r\n+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n$1\r\n1\r\n:1\r\n$-1\r\n".to_vec();
        let (config, server) = mock_server(expect, reply, dribble).await;

        let conn = ConnectionHandle::spawn(config);
        conn.send(g1).unwrap();
        conn.send(g2).unwrap();
        conn.send(g3).unwrap();

        assert_eq!(rx1.await.unwrap().unwrap(), Reply::Value(RespValue::SimpleString("OK".into())));
        assert_eq!(
            rx2.await.unwrap().unwrap(),
            Reply::Values(vec![
                RespValue::BulkString(Bytes::from_static(b"1")),
                RespValue::Integer(1),
            ])
        );
        assert_eq!(rx3.await.unwrap().unwrap(), Reply::Value(RespValue::Null));

        drop(conn);
        let sent = server.await.unwrap();
        assert!(sent.starts_with(b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n*3\r\n$3\r\nSET\r\n"));
        assert_eq!(sent.len(), expect);
    }

    #[tokio::test]
    async fn pipelined_groups_resolve_in_order() {
        pipelined_roundtrip(false).await;
    }

    #[tokio::test]
    async fn dribbled_replies_resolve_in_order() {
        pipelined_roundtrip(true).await;
    }

    #[tokio::test]
    async fn server_close_fails_pending_groups() {
        let (g1, rx1) = group(&[cmd!("GET", "a")], false);
        let (g2, rx2) = group(&[cmd!("GET", "b")], false);
        let expect = handshake_len() + g1.payload().len() + g2.payload().len();
        // Handshake answered, then the server goes away mid-reply.
        let (config, server) = mock_server(expect, b"+OK\r\n$5\r\nhel".to_vec(), false).await;

        let conn = ConnectionHandle::spawn(config);
        conn.send(g1).unwrap();
        conn.send(g2).unwrap();
        // The server holds the socket open; abort it to drop the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.abort();

        assert!(rx1.await.unwrap().unwrap_err().is_connection());
        assert!(rx2.await.unwrap().unwrap_err().is_connection());

        // The driver exits, so further sends bounce back.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let (g3, _rx3) = group(&[cmd!("PING")], false);
        assert!(conn.send(g3).is_err());
    }

    #[tokio::test]
    async fn connect_refused_fails_buffered_groups() {
        // Bind then drop to find a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = ConnectionHandle::spawn(Arc::new(ConnectionConfig::new("127.0.0.1", port)));
        let (g, rx) = group(&[cmd!("PING")], false);
        conn.send(g).unwrap();
        assert!(rx.await.unwrap().unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn connect_timeout_is_reported() {
        let config = ConnectionConfig {
            connect_timeout_ms: 100,
            // RFC 5737 TEST-NET, should not be routable
            ..ConnectionConfig::new("192.0.2.1", 6379)
        };
        let conn = ConnectionHandle::spawn(Arc::new(config));
        let (g, rx) = group(&[cmd!("PING")], false);
        conn.send(g).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn protocol_violation_closes_connection() {
        let (g1, rx1) = group(&[cmd!("SET", "a", 1)], true);
        let (g2, rx2) = group(&[cmd!("GET", "a")], false);
        let expect = handshake_len() + g1.payload().len() + g2.payload().len();
        let reply = b"+OK\r\n+OK\r\n-ERR syntax\r\n".to_vec();
        let (config, server) = mock_server(expect, reply, false).await;

        let conn = ConnectionHandle::spawn(config);
        conn.send(g1).unwrap();
        conn.send(g2).unwrap();

        assert!(rx1.await.unwrap().unwrap_err().is_protocol());
        assert!(rx2.await.unwrap().unwrap_err().is_connection());
        // Server sees the socket dropped.
        tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_handle_closes_socket_after_replies() {
        let (g, rx) = group(&[cmd!("PING")], false);
        let expect = handshake_len() + g.payload().len();
        let (config, server) = mock_server(expect, b"+OK\r\n+PONG\r\n".to_vec(), false).await;

        let conn = ConnectionHandle::spawn(config);
        conn.send(g).unwrap();
        drop(conn);

        assert_eq!(
            rx.await.unwrap().unwrap(),
            Reply::Value(RespValue::SimpleString("PONG".into()))
        );
        let sent = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert_eq!(sent.len(), expect);
    }
}
