//! Runtime selection for connection drivers.
//!
//! Drivers run on the caller's tokio runtime when there is one. Outside a
//! runtime (plain threads, blocking callers) a shared multi-threaded
//! runtime is started on first use and lives for the rest of the process.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

/// Environment variable overriding the fallback runtime's worker count.
pub const THREADS_ENV: &str = "REDPIPE_RUNTIME_THREADS";

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Get (or initialize) the fallback runtime.
pub fn get_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        if let Some(n) = worker_threads_from_env() {
            builder.worker_threads(n);
        }

        match builder.thread_name("redpipe-rt").build() {
            Ok(rt) => rt,
            // OnceLock::get_or_init cannot fail; a process that cannot
            // start threads cannot run any connection either.
            Err(e) => panic!("redpipe: failed to create tokio runtime: {e}"),
        }
    })
}

fn worker_threads_from_env() -> Option<usize> {
    let raw = std::env::var(THREADS_ENV).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(value = %raw, "ignoring invalid {THREADS_ENV}");
            None
        }
    }
}

/// Handle to the runtime new drivers should be spawned on.
pub fn handle() -> Handle {
    Handle::try_current().unwrap_or_else(|_| get_runtime().handle().clone())
}

/// Spawn a future on the current runtime, or the fallback one.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle().spawn(future)
}

// ── Tests ──────────────────────────────────────────────────────────
