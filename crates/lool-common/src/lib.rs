//! lool Common Types and Transport
//!
//! This crate provides the shared infrastructure used by both halves of the
//! lool document server: the master process that fronts client WebSockets and
//! the per-document worker (kit) processes that host the document engine.
//!
//! # Components
//!
//! - [`protocol`] - The line-oriented text command codec: frame splitting,
//!   token parsing, the client command allow-list, version handshake and the
//!   client-visible error taxonomy.
//! - [`transport`] - Line-framed request/response plumbing over the named
//!   pipes that connect the master, the spawning supervisor and the workers.
//! - [`shutdown`] - The process-wide shutdown token shared by every loop that
//!   must observe termination.
//! - [`ids`] - Session id encoding (stable hex strings with a numeric form).
//!
//! The codec is pure: nothing in [`protocol`] performs I/O.

pub mod ids;
pub mod protocol;
pub mod shutdown;
pub mod transport;

pub use protocol::error::{ClientError, ErrorKind};
pub use shutdown::ShutdownToken;
