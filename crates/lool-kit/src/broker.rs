//! The worker's supervisor pipe loop.
//!
//! The supervisor routes sessions to workers over a pipe pair: it writes
//! `query url` and `thread <sessionId> <url>` lines into the pipe passed via
//! `--pipe`, and the worker answers on the shared response FIFO, each line
//! prefixed with its pid. A broken supervisor pipe ends the loop; the worker
//! then tears its document down and exits cleanly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace, warn};

use lool_common::transport::{
    parse_supervisor_line, worker_response, PipeError, PipeReader, PipeWriter, SupervisorMsg,
};
use lool_common::ShutdownToken;

use crate::document::Document;
use crate::engine::DocumentEngine;
use crate::KitError;

/// The well-known FIFO the worker writes its responses to.
pub const BROKER_FIFO: &str = "/tmp/loolbroker.fifo";

/// How long one pipe poll may block before the loop re-checks the shutdown
/// token.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct BrokerLoop {
    engine: Arc<dyn DocumentEngine>,
    jail_id: String,
    client_port: u16,
    shutdown: ShutdownToken,
    document: Option<Arc<Document>>,
}

impl BrokerLoop {
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        jail_id: impl Into<String>,
        client_port: u16,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            engine,
            jail_id: jail_id.into(),
            client_port,
            shutdown,
            document: None,
        }
    }

    /// Runs until the shutdown token fires or the supervisor pipe breaks.
    pub async fn run(mut self, pipe: &Path, response_fifo: &Path) -> Result<(), KitError> {
        let mut reader = PipeReader::open(pipe)?;
        let writer = PipeWriter::open(response_fifo)?;
        let pid = std::process::id();

        info!(pipe = %pipe.display(), "worker broker loop started");

        while !self.shutdown.should_stop() {
            let line = match reader.read_line(POLL_TIMEOUT).await {
                Ok(None) => continue,
                Ok(Some(line)) => line,
                Err(PipeError::Closed) => {
                    warn!("supervisor pipe closed, finishing");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            trace!(%line, "supervisor request");
            let body = self.handle(&line).await;
            trace!(response = %body, "worker response");
            writer.write_line(&worker_response(pid, &body)).await?;
        }

        if let Some(document) = self.document.take() {
            document.terminate().await;
        }
        info!("worker broker loop finished");
        Ok(())
    }

    /// Handles one supervisor line and returns the response body.
    async fn handle(&mut self, line: &str) -> String {
        match parse_supervisor_line(line) {
            SupervisorMsg::QueryUrl => {
                // Sweep before answering so an idle document does not pin
                // this worker to a URL forever.
                let discardable = self.document.as_ref().is_some_and(|d| d.can_discard());
                if discardable {
                    if let Some(document) = self.document.take() {
                        info!(url = %document.url(), "discarding idle document");
                        document.terminate().await;
                    }
                }
                match &self.document {
                    None => "empty".to_string(),
                    Some(document) => document.url().to_string(),
                }
            }
            SupervisorMsg::Thread { session_id, url } => {
                self.handle_thread(&session_id, &url).await
            }
            SupervisorMsg::Unknown => {
                warn!(%line, "unparseable supervisor request");
                "bad".to_string()
            }
        }
    }

    async fn handle_thread(&mut self, session_id: &str, url: &str) -> String {
        // One document per worker; the supervisor should never route a second
        // URL here, and if it does the request is refused.
        match &self.document {
            Some(document) if document.url() != url => {
                warn!(
                    current = %document.url(),
                    requested = %url,
                    "refusing second document in this worker"
                );
                return "bad".to_string();
            }
            Some(_) => {}
            None => {
                self.document = Some(Document::new(
                    self.engine.clone(),
                    self.jail_id.clone(),
                    url,
                    self.client_port,
                    self.shutdown.clone(),
                ));
            }
        }

        let document = self.document.as_ref().expect("document present").clone();
        match document.create_session(session_id).await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to create session");
                "bad".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn broker() -> BrokerLoop {
        BrokerLoop::new(MockEngine::new(), "jail-1", 9980, ShutdownToken::new())
    }

    #[tokio::test]
    async fn test_query_url_empty() {
        let mut b = broker();
        assert_eq!(b.handle("query url").await, "empty");
    }

    #[tokio::test]
    async fn test_unknown_request_is_bad() {
        let mut b = broker();
        assert_eq!(b.handle("frobnicate the widgets").await, "bad");
        assert_eq!(b.handle("thread missing-args").await, "bad");
    }

    #[tokio::test]
    async fn test_thread_with_bad_session_id_is_bad() {
        let mut b = broker();
        // "zz" is not a hex session id; document creation succeeds but the
        // session cannot.
        assert_eq!(b.handle("thread zz file:///tmp/a.odt").await, "bad");
    }

    #[tokio::test]
    async fn test_second_url_is_refused() {
        let mut b = broker();
        // First URL claims the worker (session creation fails without a
        // master to dial, but the document is now bound).
        let _ = b.handle("thread 0001 file:///tmp/a.odt").await;
        assert_eq!(
            b.handle("thread 0002 file:///tmp/b.odt").await,
            "bad",
            "a worker hosts at most one document"
        );
        assert_eq!(b.handle("query url").await, "file:///tmp/a.odt");
    }
}
