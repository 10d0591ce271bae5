//! The master's half of the supervisor IPC.
//!
//! The master only writes on this pipe: one `request <sessionId> <docURL>`
//! line per worker it wants routed to it. Everything the supervisor answers
//! arrives indirectly, as a worker WebSocket on `/loolws/child/{sessionId}`.

use std::path::Path;

use tracing::trace;

use lool_common::transport::{format_request, PipeError, PipeWriter};

pub struct BrokerWriter {
    writer: PipeWriter,
}

impl BrokerWriter {
    pub fn open(path: &Path) -> Result<Self, PipeError> {
        Ok(Self {
            writer: PipeWriter::open(path)?,
        })
    }

    /// Asks the supervisor to route a worker for `doc_url` to the session.
    pub async fn request(&self, session_id: &str, doc_url: &str) -> Result<(), PipeError> {
        let line = format_request(session_id, doc_url);
        trace!(%line, "MasterToBroker");
        self.writer.write_line(&line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lool_common::transport::{ensure_fifo, PipeReader};
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_line_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.fifo");
        ensure_fifo(&path).unwrap();

        let broker = BrokerWriter::open(&path).unwrap();
        let mut reader = PipeReader::open(&path).unwrap();

        broker.request("000a", "file:///tmp/a.odt").await.unwrap();

        let line = reader
            .read_line(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "request 000a file:///tmp/a.odt");
    }
}
