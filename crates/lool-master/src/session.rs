//! Master-side sessions.
//!
//! A session is one end of a WebSocket plus its routing state. Sessions come
//! in pairs: the `ToClient` half faces the external client, the `ToPrisoner`
//! half faces the worker. Each holds a weak reference to its peer; pairing
//! and teardown are symmetric, and neither owns the other, so dropping one
//! half never leaks the pair.
//!
//! Sends are channel pushes consumed by the connection's writer task, so no
//! caller ever blocks on socket I/O while holding state locks.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{info, trace};

use lool_cache::TileCache;

use crate::MasterContext;

/// Which side of a session pair this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Faces an external client on `/ws`.
    ToClient,
    /// Faces a worker that dialed back on `/loolws/child/{sessionId}`.
    ToPrisoner,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::ToClient => "ToClient",
            SessionKind::ToPrisoner => "ToPrisoner",
        }
    }
}

/// A frame queued for the connection's WebSocket writer.
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

pub struct MasterSession {
    id: RwLock<String>,
    kind: SessionKind,
    ctx: Arc<MasterContext>,
    out: mpsc::UnboundedSender<OutFrame>,
    disconnected: AtomicBool,
    peer: Mutex<Weak<MasterSession>>,

    doc_url: RwLock<Option<String>>,
    doc_options: RwLock<Option<String>>,
    load_part: AtomicI32,
    cur_part: AtomicI32,

    /// Jail id of the worker behind this pipe. On a `ToPrisoner` session it
    /// is set by the `child` hello; a `ToClient` session never has one.
    child_id: RwLock<Option<String>>,
    child_pid: AtomicU32,

    tile_cache: Mutex<Option<Arc<TileCache>>>,

    save_as_tx: mpsc::UnboundedSender<String>,
    save_as_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MasterSession {
    /// Creates a session, handing back the outbound channel for the writer
    /// task.
    pub fn new(
        id: impl Into<String>,
        kind: SessionKind,
        ctx: Arc<MasterContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutFrame>) {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (save_as_tx, save_as_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: RwLock::new(id.into()),
            kind,
            ctx,
            out,
            disconnected: AtomicBool::new(false),
            peer: Mutex::new(Weak::new()),
            doc_url: RwLock::new(None),
            doc_options: RwLock::new(None),
            load_part: AtomicI32::new(-1),
            cur_part: AtomicI32::new(0),
            child_id: RwLock::new(None),
            child_pid: AtomicU32::new(0),
            tile_cache: Mutex::new(None),
            save_as_tx,
            save_as_rx: tokio::sync::Mutex::new(save_as_rx),
        });
        info!(session = %session.name(), "session created");
        (session, out_rx)
    }

    pub fn id(&self) -> String {
        self.id.read().unwrap().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write().unwrap() = id.into();
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn ctx(&self) -> &Arc<MasterContext> {
        &self.ctx
    }

    /// `<Kind>-<id>`, the name sessions log under.
    pub fn name(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.id())
    }

    pub fn peer(&self) -> Option<Arc<MasterSession>> {
        self.peer.lock().unwrap().upgrade()
    }

    pub fn set_peer(&self, peer: &Arc<MasterSession>) {
        *self.peer.lock().unwrap() = Arc::downgrade(peer);
    }

    pub fn has_peer(&self) -> bool {
        self.peer().is_some()
    }

    pub fn doc_url(&self) -> Option<String> {
        self.doc_url.read().unwrap().clone()
    }

    pub fn doc_options(&self) -> Option<String> {
        self.doc_options.read().unwrap().clone()
    }

    pub fn set_doc(&self, url: String, options: Option<String>, load_part: i32) {
        *self.doc_url.write().unwrap() = Some(url);
        *self.doc_options.write().unwrap() = options;
        self.load_part.store(load_part, Ordering::SeqCst);
    }

    pub fn load_part(&self) -> i32 {
        self.load_part.load(Ordering::SeqCst)
    }

    pub fn cur_part(&self) -> i32 {
        self.cur_part.load(Ordering::SeqCst)
    }

    pub fn set_cur_part(&self, part: i32) {
        self.cur_part.store(part, Ordering::SeqCst);
    }

    pub fn child_id(&self) -> Option<String> {
        self.child_id.read().unwrap().clone()
    }

    pub fn set_child(&self, child_id: impl Into<String>, pid: u32) {
        *self.child_id.write().unwrap() = Some(child_id.into());
        self.child_pid.store(pid, Ordering::SeqCst);
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.load(Ordering::SeqCst)
    }

    /// Whether this session has a worker process behind it (a `ToPrisoner`
    /// session past its `child` hello).
    pub fn has_separate_process(&self) -> bool {
        self.child_id.read().unwrap().is_some()
    }

    pub fn tile_cache(&self) -> Option<Arc<TileCache>> {
        self.tile_cache.lock().unwrap().clone()
    }

    pub fn set_tile_cache(&self, cache: Arc<TileCache>) {
        *self.tile_cache.lock().unwrap() = Some(cache);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let text = text.into();
        trace!(session = %self.name(), frame = %lool_common::protocol::abbreviate(text.as_bytes(), 60), "send");
        let _ = self.out.send(OutFrame::Text(text));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        trace!(session = %self.name(), bytes = data.len(), "send binary");
        let _ = self.out.send(OutFrame::Binary(data));
    }

    /// Closes the socket without the disconnect exchange. Used when giving
    /// up on worker acquisition.
    pub fn close(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        let _ = self.save_as_tx.send(String::new());
        let _ = self.out.send(OutFrame::Close);
    }

    /// Tears this session down and its peer with it. Idempotent; the
    /// save-as queue is released so any waiter unblocks.
    pub fn disconnect(&self, reason: &str) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            info!(session = %self.name(), reason, "disconnecting");
            self.send_text(format!("disconnect {reason}"));
            let _ = self.save_as_tx.send(String::new());
            let _ = self.out.send(OutFrame::Close);
            if let Some(peer) = self.peer() {
                peer.disconnect(reason);
            }
        }
    }

    /// Queues a completed save-as URL for this (client) session.
    pub fn push_save_as(&self, url: String) {
        let _ = self.save_as_tx.send(url);
    }

    /// Waits for the next completed save-as. Returns `None` once the session
    /// disconnects (the empty sentinel released the queue).
    pub async fn next_save_as(&self) -> Option<String> {
        let url = self.save_as_rx.lock().await.recv().await?;
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }
}
