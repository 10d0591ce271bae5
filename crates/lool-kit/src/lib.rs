//! lool Worker Session Host
//!
//! Each worker (kit) process hosts exactly one engine-loaded document and
//! multiplexes every client editing that document into it. The master cannot
//! handle a command itself, so it routes the session here: the supervisor
//! tells the worker to `thread <sessionId> <url>`, the worker dials back to
//! the master over a WebSocket, announces itself with a `child` frame, and
//! from then on pumps commands into the engine and engine callbacks back out.
//!
//! # Architecture
//!
//! - [`engine`] - the safe traits over the external document engine plus the
//!   C ABI binding that implements them for the real library.
//! - [`document`] - the per-URL [`Document`](document::Document): owns the
//!   engine document handle, the session map and the view count, and fans
//!   engine callbacks out to sessions.
//! - [`session`] - one [`KitSession`](session::KitSession) per connected
//!   client: a WebSocket reader feeding a command queue, and a consumer
//!   draining that queue into the engine.
//! - [`broker`] - the supervisor pipe loop (`query url` / `thread`).
//!
//! # Locking
//!
//! The document mutex guards the engine handle and the session map. The
//! engine invokes its callback synchronously from inside `load`, and the
//! callback takes the same mutex, so the lock is released across every
//! `load` call. Callbacks never perform socket I/O under the lock; they copy
//! the event into each session's outbound channel and return.

pub mod broker;
pub mod document;
pub mod engine;
pub mod session;

use thiserror::Error;

/// Worker-internal failure classes.
#[derive(Debug, Error)]
pub enum KitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker pipe error: {0}")]
    Pipe(#[from] lool_common::transport::PipeError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error("malformed session id: {0}")]
    BadSessionId(String),
}
