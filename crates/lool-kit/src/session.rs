//! In-worker sessions.
//!
//! One [`KitSession`] per client editing the document. The session owns the
//! worker-to-master WebSocket: a reader task feeds frames into a command
//! queue, a consumer task drains the queue into the engine, and a writer task
//! drains the outbound channel onto the socket. The queue is a plain mpsc
//! channel: the reader closes it by dropping its sender, the consumer drains
//! whatever is left and then releases the session.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use lool_common::ids::decode_session_id;
use lool_common::protocol::{
    abbreviate, first_line, parse_doc_options, tokenize, ClientError, ErrorKind,
};
use lool_common::ShutdownToken;

use crate::document::Document;
use crate::engine::{CallbackEvent, EngineDocument};
use crate::KitError;

/// A frame queued for the session's WebSocket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl OutFrame {
    /// The text content, for assertions in tests.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutFrame::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One client session inside the worker.
pub struct KitSession {
    id: String,
    int_id: u64,
    doc: Weak<Document>,
    out: mpsc::UnboundedSender<OutFrame>,
    stop: ShutdownToken,
    engine_doc: Mutex<Option<Arc<dyn EngineDocument>>>,
}

impl KitSession {
    /// Creates a session without a socket, handing back the outbound channel.
    /// Used by [`spawn`] and directly by tests.
    pub fn detached(
        doc: Arc<Document>,
        id: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutFrame>) {
        let (out, out_rx) = mpsc::unbounded_channel();
        let int_id = decode_session_id(&id).unwrap_or(0);
        let session = Arc::new(Self {
            id,
            int_id,
            doc: Arc::downgrade(&doc),
            out,
            stop: ShutdownToken::new(),
            engine_doc: Mutex::new(None),
        });
        (session, out_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn int_id(&self) -> u64 {
        self.int_id
    }

    /// Cooperative stop; wakes the reader between frames.
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.out.send(OutFrame::Text(text.into()));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.out.send(OutFrame::Binary(data));
    }

    fn send_error(&self, error: ClientError) {
        self.send_text(error.to_frame());
    }

    /// Hands an engine event to this session. Called with the document lock
    /// held; only copies into the outbound channel, no socket I/O.
    pub fn engine_event(&self, event: &CallbackEvent) {
        for frame in event.kind.frames(&event.payload) {
            self.send_text(frame);
        }
    }

    fn engine_document(&self) -> Option<Arc<dyn EngineDocument>> {
        self.engine_doc.lock().unwrap().clone()
    }

    /// Runs one queued command.
    pub(crate) async fn consume_frame(&self, data: Vec<u8>) {
        let line = first_line(&data).to_string();
        let tokens = tokenize(&line);
        let Some(&command) = tokens.first() else {
            return;
        };

        if let Some(doc) = self.doc.upgrade() {
            doc.touch();
        }

        match command {
            "load" => self.handle_load(&tokens).await,
            "unload" => self.release_view().await,
            _ => self.dispatch_to_engine(command, data).await,
        }
    }

    async fn handle_load(&self, tokens: &[&str]) {
        let opts = parse_doc_options(tokens);
        // Inside the jail the document is visible at its jailed path; fall
        // back to the public URL when the master did not provide one.
        let Some(uri) = opts.jail.clone().or_else(|| opts.url.clone()) else {
            self.send_error(ClientError::syntax("load"));
            return;
        };

        let Some(doc) = self.doc.upgrade() else {
            return;
        };

        let session_id = self.id.clone();
        let options = opts.options.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            doc.on_load(&session_id, &uri, options.as_deref())
        })
        .await;

        match loaded {
            Ok(Ok(engine_doc)) => {
                *self.engine_doc.lock().unwrap() = Some(engine_doc);
            }
            Ok(Err(e)) => {
                warn!(session = %self.id, error = %e, "document load failed");
                self.send_error(ClientError::new("load", ErrorKind::FailedDocLoading));
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "load task failed");
                self.send_error(ClientError::new("load", ErrorKind::FailedDocLoading));
            }
        }
    }

    async fn release_view(&self) {
        let engine_doc = self.engine_doc.lock().unwrap().take();
        if engine_doc.is_none() {
            return;
        }
        if let Some(doc) = self.doc.upgrade() {
            let session_id = self.id.clone();
            let _ = tokio::task::spawn_blocking(move || doc.on_unload(&session_id)).await;
        }
    }

    async fn dispatch_to_engine(&self, command: &str, data: Vec<u8>) {
        let Some(engine_doc) = self.engine_document() else {
            self.send_error(ClientError::new(command, ErrorKind::NoDocLoaded));
            return;
        };

        trace!(session = %self.id, frame = %abbreviate(&data, 60), "dispatching to engine");
        let replies =
            tokio::task::spawn_blocking(move || engine_doc.dispatch(&data)).await;

        match replies {
            Ok(Ok(frames)) => {
                for frame in frames {
                    self.send_reply(frame);
                }
            }
            Ok(Err(e)) => {
                // The master validated the command; failures here are engine
                // internal and logged rather than surfaced as protocol errors.
                warn!(session = %self.id, command, error = %e, "engine rejected command");
            }
            Err(e) => warn!(session = %self.id, command, error = %e, "dispatch task failed"),
        }
    }

    fn send_reply(&self, frame: Bytes) {
        if frame.contains(&b'\n') {
            self.send_binary(frame.to_vec());
        } else {
            match std::str::from_utf8(&frame) {
                Ok(text) => self.send_text(text),
                Err(_) => self.send_binary(frame.to_vec()),
            }
        }
    }
}

/// Connects a new session back to the master and starts its runner.
///
/// The first frame on the fresh socket is `child <jailId> <sessionId> <pid>`,
/// which is how the master learns the session has arrived.
pub async fn spawn(
    doc: Arc<Document>,
    session_id: String,
) -> Result<(Arc<KitSession>, JoinHandle<()>), KitError> {
    let url = format!(
        "ws://127.0.0.1:{}/loolws/child/{}",
        doc.client_port(),
        session_id
    );
    let (ws, _) = connect_async(&url)
        .await
        .map_err(|e| KitError::WebSocket(format!("connect to {url} failed: {e}")))?;

    let (session, out_rx) = KitSession::detached(doc.clone(), session_id);

    session.send_text(format!(
        "child {} {} {}",
        doc.jail_id(),
        session.id(),
        std::process::id()
    ));

    // A runner that dies on a panic is an abnormal termination for the
    // whole process: flag it so teardown force-closes sockets before joins.
    let shutdown = doc.shutdown().clone();
    let inner = tokio::spawn(run(session.clone(), ws, out_rx));
    let runner = tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                shutdown.flag_abnormal();
            }
        }
    });
    Ok((session, runner))
}

async fn run(
    session: Arc<KitSession>,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
) {
    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutFrame::Text(text) => sink.send(Message::text(text)).await,
                OutFrame::Binary(data) => sink.send(Message::binary(data)).await,
                OutFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let consumer = tokio::spawn({
        let session = session.clone();
        async move {
            let mut queue_rx = queue_rx;
            while let Some(data) = queue_rx.recv().await {
                session.consume_frame(data).await;
            }
        }
    });

    debug!(session = %session.id(), "session runner started");

    loop {
        let data: Vec<u8> = tokio::select! {
            _ = session.stop.stopped() => break,
            msg = stream.next() => match msg {
                None => break,
                Some(Err(e)) => {
                    warn!(session = %session.id(), error = %e, "WebSocket receive failed");
                    break;
                }
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            },
        };

        let line = first_line(&data);
        if line == "eof" {
            info!(session = %session.id(), "received eof, finishing");
            break;
        }
        if line == "disconnect" || line.starts_with("disconnect ") {
            let reason = line.strip_prefix("disconnect").unwrap_or("").trim();
            info!(session = %session.id(), reason, "client disconnected");
            break;
        }

        if line.starts_with("paste") {
            let _ = queue_tx.send(data);
        } else {
            // Everything but paste is a single line.
            if data.len() != line.len() {
                debug!(session = %session.id(), "dropping unexpected payload after first line");
            }
            let _ = queue_tx.send(line.as_bytes().to_vec());
        }
    }

    // Closing the queue lets the consumer drain what is left, then exit.
    drop(queue_tx);
    let _ = consumer.await;

    session.release_view().await;
    session.send_text("disconnect ");
    let _ = session.out.send(OutFrame::Close);
    let _ = writer.await;

    if let Some(doc) = session.doc.upgrade() {
        doc.purge_sessions();
    }
    debug!(session = %session.id(), "session runner finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::CallbackKind;
    use lool_common::ShutdownToken;

    fn test_doc(engine: Arc<MockEngine>) -> Arc<Document> {
        Document::new(
            engine,
            "jail-1",
            "file:///tmp/hello.odt",
            9980,
            ShutdownToken::new(),
        )
    }

    #[tokio::test]
    async fn test_commands_require_loaded_document() {
        let engine = MockEngine::new();
        let doc = test_doc(engine);
        let (session, mut rx) = KitSession::detached(doc, "0001".to_string());

        session.consume_frame(b"status".to_vec()).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.as_text(), Some("error: cmd=status kind=nodocloaded"));
    }

    #[tokio::test]
    async fn test_load_without_url_is_syntax_error() {
        let engine = MockEngine::new();
        let doc = test_doc(engine);
        let (session, mut rx) = KitSession::detached(doc, "0001".to_string());

        session.consume_frame(b"load".to_vec()).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.as_text(), Some("error: cmd=load kind=syntax"));
    }

    #[tokio::test]
    async fn test_engine_event_renders_frames() {
        let engine = MockEngine::new();
        let doc = test_doc(engine);
        let (session, mut rx) = KitSession::detached(doc, "0001".to_string());

        session.engine_event(&CallbackEvent::new(CallbackKind::SetPart, "2"));

        assert_eq!(rx.recv().await.unwrap().as_text(), Some("curpart: part=2"));
        assert_eq!(rx.recv().await.unwrap().as_text(), Some("setpart: part=2"));
    }

    #[tokio::test]
    async fn test_reply_framing() {
        let engine = MockEngine::new();
        let doc = test_doc(engine);
        let (session, mut rx) = KitSession::detached(doc, "0001".to_string());

        session.send_reply(Bytes::from_static(b"status: parts=1"));
        session.send_reply(Bytes::from_static(b"tile: part=0\n\x89PNG"));

        assert_eq!(rx.recv().await.unwrap().as_text(), Some("status: parts=1"));
        match rx.recv().await.unwrap() {
            OutFrame::Binary(data) => assert_eq!(data, b"tile: part=0\n\x89PNG".to_vec()),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}
