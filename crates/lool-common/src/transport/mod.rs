//! Broker IPC transport.
//!
//! The master, the spawning supervisor and each worker talk over named pipes
//! with `\r\n`-terminated ASCII lines, tokens space-separated. This module
//! provides the pipe plumbing ([`pipe`]) and the message grammar
//! ([`broker`]); the loops that use them live with the master and the
//! worker respectively.

pub mod broker;
pub mod pipe;

pub use broker::{format_request, parse_supervisor_line, worker_response, SupervisorMsg};
pub use pipe::{ensure_fifo, PipeError, PipeReader, PipeWriter};
