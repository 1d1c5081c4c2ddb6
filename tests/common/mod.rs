//! Shared helpers for integration tests.
//!
//! Runs an in-process RESP server on `127.0.0.1:0` that understands the
//! handful of commands the tests use, including `MULTI`/`EXEC` queueing
//! and `AUTH`. Requests are parsed with the crate's own decoder.
//!
//! Test-only control commands:
//! - `DEBUG DROP` closes the connection without replying.
//! - `DEBUG GARBAGE` answers with bytes that are not RESP.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redpipe::resp::decode;
use redpipe::{ConnectionConfig, RespValue};

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("redpipe=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Global counter for generating unique key prefixes per test.
static TEST_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique prefix for test keys.
pub fn test_prefix() -> String {
    let id = TEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("redpipe_test_{}_{}", std::process::id(), id)
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Require `AUTH <password>` (any username accepted).
    pub password: Option<String>,
    /// Write every reply one byte at a time.
    pub dribble: bool,
}

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

type Keyspace = Arc<Mutex<HashMap<(u8, Bytes), Value>>>;

/// Handle to a running fake server.
pub struct FakeServer {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    pub async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let keyspace: Keyspace = Arc::default();
        let options = Arc::new(options);

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let session = Session::new(Arc::clone(&keyspace), Arc::clone(&options));
                tokio::spawn(session.serve(socket));
            }
        });

        Self { port, accepted }
    }

    pub async fn plain() -> Self {
        Self::start(ServerOptions::default()).await
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port)
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

enum Action {
    Reply(RespValue),
    Raw(&'static [u8]),
    Drop,
}

struct Session {
    keyspace: Keyspace,
    options: Arc<ServerOptions>,
    authed: bool,
    db: u8,
    /// `Some` while inside MULTI.
    queued: Option<Vec<Vec<Bytes>>>,
    /// A command was rejected while queueing; EXEC must abort.
    dirty: bool,
}

impl Session {
    fn new(keyspace: Keyspace, options: Arc<ServerOptions>) -> Self {
        let authed = options.password.is_none();
        Self {
            keyspace,
            options,
            authed,
            db: 0,
            queued: None,
            dirty: false,
        }
    }

    async fn serve(mut self, mut socket: TcpStream) {
        let mut pending = BytesMut::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            let snapshot = pending.split().freeze();
            let decoded = match decode(&snapshot, None) {
                Ok(d) => d,
                Err(_) => return,
            };
            pending.extend_from_slice(&decoded.remainder);

            let mut out = BytesMut::new();
            let mut drop_after = false;
            for request in decoded.items {
                let Some(args) = request_args(request) else {
                    return;
                };
                match self.handle(args) {
                    Action::Reply(value) => value.encode_into(&mut out),
                    Action::Raw(bytes) => out.extend_from_slice(bytes),
                    Action::Drop => {
                        drop_after = true;
                        break;
                    }
                }
            }

            if self.write(&mut socket, &out).await.is_err() || drop_after {
                return;
            }
        }
    }

    async fn write(&self, socket: &mut TcpStream, out: &[u8]) -> std::io::Result<()> {
        if self.options.dribble {
            for byte in out {
                socket.write_all(std::slice::from_ref(byte)).await?;
                socket.flush().await?;
            }
            Ok(())
        } else {
            socket.write_all(out).await
        }
    }

    fn handle(&mut self, args: Vec<Bytes>) -> Action {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        match name.as_str() {
            "AUTH" => return Action::Reply(self.auth(&args[1..])),
            "DEBUG" if arg_is(&args, 1, "DROP") => return Action::Drop,
            "DEBUG" if arg_is(&args, 1, "GARBAGE") => return Action::Raw(b"?garbage\r\n"),
            _ => {}
        }
        if !self.authed {
            return Action::Reply(err("NOAUTH Authentication required."));
        }

        match name.as_str() {
            "MULTI" => {
                if self.queued.is_some() {
                    return Action::Reply(err("ERR MULTI calls can not be nested"));
                }
                self.queued = Some(Vec::new());
                self.dirty = false;
                Action::Reply(ok())
            }
            "EXEC" => {
                let Some(queued) = self.queued.take() else {
                    return Action::Reply(err("ERR EXEC without MULTI"));
                };
                if self.dirty {
                    self.dirty = false;
                    return Action::Reply(err(
                        "EXECABORT Transaction discarded because of previous errors.",
                    ));
                }
                let results = queued.into_iter().map(|cmd| self.run(&cmd)).collect();
                Action::Reply(RespValue::Array(results))
            }
            _ if self.queued.is_some() => {
                if let Some(e) = check_arity(&name, args.len()) {
                    self.dirty = true;
                    return Action::Reply(e);
                }
                if let Some(queued) = self.queued.as_mut() {
                    queued.push(args);
                }
                Action::Reply(RespValue::SimpleString("QUEUED".into()))
            }
            _ => Action::Reply(self.run(&args)),
        }
    }

    fn auth(&mut self, args: &[Bytes]) -> RespValue {
        let Some(expected) = self.options.password.as_deref() else {
            return err("ERR AUTH called without any password configured");
        };
        let Some(given) = args.last() else {
            return err("ERR wrong number of arguments for 'auth' command");
        };
        if given.as_ref() == expected.as_bytes() {
            self.authed = true;
            ok()
        } else {
            err("WRONGPASS invalid username-password pair or user is disabled.")
        }
    }

    /// Execute one data command.
    fn run(&mut self, args: &[Bytes]) -> RespValue {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        if let Some(e) = check_arity(&name, args.len()) {
            return e;
        }
        let db = self.db;
        let key = |i: usize| (db, args[i].clone());
        let mut keyspace = self.keyspace.lock();

        match name.as_str() {
            "PING" => RespValue::SimpleString("PONG".into()),
            "ECHO" => RespValue::BulkString(args[1].clone()),
            "SELECT" => match parse_ascii::<u8>(&args[1]) {
                Some(n) if n <= 15 => {
                    self.db = n;
                    ok()
                }
                _ => err("ERR DB index is out of range"),
            },
            "SET" => {
                keyspace.insert(key(1), Value::Str(args[2].clone()));
                ok()
            }
            "GET" => match keyspace.get(&key(1)) {
                Some(Value::Str(v)) => RespValue::BulkString(v.clone()),
                Some(Value::List(_)) => wrong_type(),
                None => RespValue::Null,
            },
            "INCR" => {
                let current = match keyspace.get(&key(1)) {
                    Some(Value::Str(v)) => match parse_ascii::<i64>(v) {
                        Some(n) => n,
                        None => return err("ERR value is not an integer or out of range"),
                    },
                    Some(Value::List(_)) => return wrong_type(),
                    None => 0,
                };
                let next = current + 1;
                keyspace.insert(key(1), Value::Str(Bytes::from(next.to_string())));
                RespValue::Integer(next)
            }
            "DEL" => {
                let removed = (1..args.len())
                    .filter(|&i| keyspace.remove(&key(i)).is_some())
                    .count();
                RespValue::Integer(removed as i64)
            }
            "RPUSH" => {
                let entry = keyspace.entry(key(1)).or_insert_with(|| Value::List(VecDeque::new()));
                match entry {
                    Value::List(list) => {
                        list.extend(args[2..].iter().cloned());
                        RespValue::Integer(list.len() as i64)
                    }
                    Value::Str(_) => wrong_type(),
                }
            }
            "LPOP" => match keyspace.get_mut(&key(1)) {
                Some(Value::List(list)) => match list.pop_front() {
                    Some(v) => RespValue::BulkString(v),
                    None => RespValue::Null,
                },
                Some(Value::Str(_)) => wrong_type(),
                None => RespValue::Null,
            },
            "LRANGE" => match keyspace.get(&key(1)) {
                Some(Value::List(list)) => {
                    RespValue::Array(list.iter().cloned().map(RespValue::BulkString).collect())
                }
                Some(Value::Str(_)) => wrong_type(),
                None => RespValue::Array(Vec::new()),
            },
            _ => err(&format!("ERR unknown command '{}'", name.to_ascii_lowercase())),
        }
    }
}

fn request_args(request: RespValue) -> Option<Vec<Bytes>> {
    let items = request.into_array()?;
    let args: Vec<Bytes> = items
        .into_iter()
        .filter_map(|item| match item {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        })
        .collect();
    (!args.is_empty()).then_some(args)
}

fn arg_is(args: &[Bytes], i: usize, expected: &str) -> bool {
    args.get(i).is_some_and(|a| a.eq_ignore_ascii_case(expected.as_bytes()))
}

/// Argument count check, counting the command name.
fn check_arity(name: &str, argc: usize) -> Option<RespValue> {
    let ok = match name {
        "PING" => argc <= 2,
        "ECHO" | "GET" | "INCR" | "LPOP" | "SELECT" => argc == 2,
        "SET" => argc == 3,
        "LRANGE" => argc == 4,
        "DEL" => argc >= 2,
        "RPUSH" => argc >= 3,
        _ => true,
    };
    (!ok).then(|| {
        err(&format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        ))
    })
}

fn parse_ascii<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".into())
}

fn err(msg: &str) -> RespValue {
    RespValue::Error(msg.to_string())
}

fn wrong_type() -> RespValue {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}
