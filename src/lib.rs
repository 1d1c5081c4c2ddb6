//! Non-blocking pipelined Redis client.
//!
//! Many submissions share one TCP connection. Each submission is a group
//! of commands, optionally wrapped in `MULTI`/`EXEC`, and resolves to its
//! own [`Reply`] in submission order.
//!
//! ```no_run
//! # async fn demo() -> redpipe::Result<()> {
//! use redpipe::{cmd, Client};
//!
//! let client = Client::from_url("redis://127.0.0.1:6379/0")?;
//! let tx = client.submit(&[cmd!("SET", "k", "v"), cmd!("GET", "k")])?;
//! let get = client.submit_pipelined(&[cmd!("GET", "other")])?;
//! let values = tx.await?.into_values();
//! let other = get.await?;
//! # let _ = (values, other);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod resp;
pub mod runtime;

pub use client::{Client, ResultHandle};
pub use config::ConnectionConfig;
pub use error::{Error, Result};
pub use resp::{Command, Reply, RespValue};
