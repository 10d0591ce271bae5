//! lool Protocol Codec
//!
//! Frames on every lool WebSocket are either a single-line text command
//! (whitespace tokenized, first token is the command name, remainder is
//! `name=value` or bare tokens) or a two-part composite: a text command line
//! followed by `\n` and an opaque binary payload. The composite form is used
//! by `paste` requests and by `tile:`, `renderfont:` and similar responses.
//!
//! This module is the single place that understands that framing. It is pure
//! and performs no I/O; sessions on both the master and worker side feed it
//! raw frame bytes and act on the result.

pub mod commands;
pub mod error;
pub mod message;
pub mod version;


pub use commands::is_allowed_command;
pub use error::{ClientError, ErrorKind};
pub use message::{
    abbreviate, first_line, parse_doc_options, split_frame, token_int, token_string, tokenize,
    DocOptions,
};
pub use version::{matches_server, parse_version, PROTOCOL_VERSION};
