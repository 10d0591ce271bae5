//! Broker message grammar.
//!
//! Master to supervisor:
//!
//! ```text
//! request <sessionId> <docURL>
//! ```
//!
//! Supervisor to worker:
//!
//! ```text
//! query url
//! thread <sessionId> <docURL>
//! ```
//!
//! Worker to supervisor, always prefixed with the worker pid:
//!
//! ```text
//! <pid> ok | bad | empty | <url>
//! ```

use crate::protocol::tokenize;

/// A parsed supervisor-to-worker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorMsg {
    /// `query url` - which document, if any, is this worker holding?
    QueryUrl,
    /// `thread <sessionId> <url>` - create a session for this document.
    Thread { session_id: String, url: String },
    /// Anything else; answered with `bad`.
    Unknown,
}

/// Formats the master's `request` line (unterminated; the pipe writer frames
/// it).
pub fn format_request(session_id: &str, doc_url: &str) -> String {
    format!("request {session_id} {doc_url}")
}

/// Parses one line read from the supervisor pipe.
pub fn parse_supervisor_line(line: &str) -> SupervisorMsg {
    let tokens = tokenize(line);
    match tokens.as_slice() {
        ["query", "url", ..] => SupervisorMsg::QueryUrl,
        ["thread", session_id, url, ..] => SupervisorMsg::Thread {
            session_id: (*session_id).to_string(),
            url: (*url).to_string(),
        },
        _ => SupervisorMsg::Unknown,
    }
}

/// Builds a worker response line, pid-prefixed.
pub fn worker_response(pid: u32, body: &str) -> String {
    format!("{pid} {body}")
}
