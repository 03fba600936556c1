//! Runtime wrapper to keep tokio out of the chat code. Everything the delivery
//! core needs from the runtime (tasks, channels, sockets, codecs, cancellation)
//! is reexported from here, so swapping the runtime only touches this crate.
//!
//! Currently, only the subset of tokio used by `courier-chat` is reexported. We
//! may want to extend this functionality as needed.

mod tokio;
mod tracing;

use std::future::Future;

pub use crate::tokio::codec;
pub use crate::tokio::mpsc;
pub use crate::tokio::net;
pub use crate::tokio::oneshot;
pub use crate::tokio::sync;
pub use crate::tokio::{
    select, signal, sleep, spawn, timeout, CancellationToken, Handle, JoinHandle,
    Runtime,
};
pub use crate::tracing::{init_tracing, LogFormat};

/// Initialises tracing with the pretty formatter and blocks on `future` using
/// a fresh multi-threaded runtime.
pub fn run<F: Future>(future: F) -> std::io::Result<F::Output> {
    init_tracing(LogFormat::Pretty);

    let rt = Runtime::new()?;
    Ok(rt.block_on(future))
}
