//! Endpoint configuration and URL parsing.
//!
//! Accepts `redis://[user:pass@]host[:port][/db]`. TLS (`rediss://`) is
//! not supported and is rejected rather than silently downgraded.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resp::writer::encode_handshake;

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;
/// Highest logical database index accepted by `SELECT`.
pub const MAX_DB: u8 = 15;
/// Default maximum size of the unattributed receive buffer (512 MB).
pub const DEFAULT_MAX_BUF_SIZE: usize = 512 * 1024 * 1024;

/// One endpoint: where to connect and how to bootstrap the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Optional username (Redis 6+ ACL). Only sent together with a password.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database index (0-15).
    pub db: u8,
    /// Connect timeout in milliseconds (0 = wait for the OS).
    pub connect_timeout_ms: u64,
    /// Receive buffer cap in bytes; exceeding it tears the connection down.
    pub max_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            db: 0,
            connect_timeout_ms: 5000,
            max_buffer_size: DEFAULT_MAX_BUF_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Config for `host:port`, database 0, no password.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a Redis URL into a ConnectionConfig.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut config = Self::default();

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("invalid URL, missing ://: {url}")))?;

        match scheme {
            "redis" => {}
            "rediss" => {
                return Err(Error::Config(
                    "TLS connections (rediss://) are not supported".into(),
                ));
            }
            _ => return Err(Error::Config(format!("unknown URL scheme: {scheme}"))),
        }

        let (host_part, db_part) = split_path(rest);

        if let Some(db_str) = db_part {
            config.db = db_str
                .parse()
                .map_err(|_| Error::Config(format!("invalid db number: {db_str}")))?;
        }

        let host_port = if let Some((userinfo, hp)) = host_part.rsplit_once('@') {
            parse_userinfo(&mut config, userinfo);
            hp
        } else {
            host_part
        };

        parse_host_port(host_port, &mut config.host, &mut config.port)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the handshake relies on.
    pub fn validate(&self) -> Result<()> {
        if self.db > MAX_DB {
            return Err(Error::Config(format!(
                "db must be between 0 and {MAX_DB}, got {}",
                self.db
            )));
        }
        if self.host.is_empty() {
            return Err(Error::Config("empty host".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(Error::Config("max_buffer_size must be > 0".into()));
        }
        Ok(())
    }

    /// Return the primary address as "host:port".
    pub fn primary_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Handshake bytes for a fresh connection and the number of `+OK`
    /// replies they produce (1 or 2).
    pub fn handshake(&self) -> (Bytes, usize) {
        encode_handshake(self.username.as_deref(), self.password.as_deref(), self.db)
    }
}

// ── URL parsing helpers ────────────────────────────────────────────

/// Split `rest` into (before_path, Some(path)) or (rest, None).
fn split_path(rest: &str) -> (&str, Option<&str>) {
    match rest.split_once('/') {
        Some((before, after)) if !after.is_empty() => (before, Some(after)),
        Some((before, _)) => (before, None),
        None => (rest, None),
    }
}

/// Parse `user:pass` or `:pass` into config.
fn parse_userinfo(config: &mut ConnectionConfig, userinfo: &str) {
    match userinfo.split_once(':') {
        Some((user, pass)) => {
            if !user.is_empty() {
                config.username = Some(user.to_string());
            }
            if !pass.is_empty() {
                config.password = Some(pass.to_string());
            }
        }
        None if !userinfo.is_empty() => {
            config.password = Some(userinfo.to_string());
        }
        None => {}
    }
}

/// Parse `host[:port]` or `[ipv6]:port` into host/port variables.
fn parse_host_port(s: &str, host: &mut String, port: &mut u16) -> Result<()> {
    if s.starts_with('[') {
        let close = s
            .find(']')
            .ok_or_else(|| Error::Config(format!("unclosed IPv6 bracket: {s}")))?;
        *host = s[1..close].to_string();
        let after = &s[close + 1..];
        *port = match after.strip_prefix(':') {
            Some(port_str) => port_str
                .parse()
                .map_err(|_| Error::Config(format!("invalid port: {port_str}")))?,
            None => DEFAULT_PORT,
        };
    } else if let Some((h, p)) = s.rsplit_once(':') {
        match p.parse::<u16>() {
            Ok(parsed_port) => {
                *host = h.to_string();
                *port = parsed_port;
            }
            // Bare IPv6 without brackets
            Err(_) if h.contains(':') => {
                *host = s.to_string();
                *port = DEFAULT_PORT;
            }
            Err(_) => return Err(Error::Config(format!("invalid port: {p}"))),
        }
    } else {
        *host = s.to_string();
        *port = DEFAULT_PORT;
    }

    if host.is_empty() {
        *host = "127.0.0.1".to_string();
    }

    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
