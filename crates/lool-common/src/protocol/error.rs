//! The client-visible error taxonomy.
//!
//! Failures a client can observe are reported as a single text frame of the
//! form `error: cmd=<command> kind=<kind>`; the kinds are a closed set.

use thiserror::Error;

/// Classification of a client-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required token was missing or malformed.
    Syntax,
    /// The frame parsed but a value violates its bounds.
    Invalid,
    /// Protocol version mismatch in the handshake.
    BadVersion,
    /// `load` on a session that already holds a document.
    DocAlreadyLoaded,
    /// A document-requiring command before any successful `load`.
    NoDocLoaded,
    /// Command name not in the allow-list.
    Unknown,
    /// The `load` URL did not parse.
    UriInvalid,
    /// The engine failed to load the document.
    FailedDocLoading,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Invalid => "invalid",
            ErrorKind::BadVersion => "badversion",
            ErrorKind::DocAlreadyLoaded => "docalreadyloaded",
            ErrorKind::NoDocLoaded => "nodocloaded",
            ErrorKind::Unknown => "unknown",
            ErrorKind::UriInvalid => "uriinvalid",
            ErrorKind::FailedDocLoading => "faileddocloading",
        }
    }
}

/// An error frame to be sent back to the offending session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("error: cmd={cmd} kind={}", .kind.as_str())]
pub struct ClientError {
    pub cmd: String,
    pub kind: ErrorKind,
}

impl ClientError {
    pub fn new(cmd: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            cmd: cmd.into(),
            kind,
        }
    }

    pub fn syntax(cmd: impl Into<String>) -> Self {
        Self::new(cmd, ErrorKind::Syntax)
    }

    pub fn invalid(cmd: impl Into<String>) -> Self {
        Self::new(cmd, ErrorKind::Invalid)
    }

    /// The wire form, e.g. `error: cmd=tile kind=invalid`.
    pub fn to_frame(&self) -> String {
        self.to_string()
    }
}
