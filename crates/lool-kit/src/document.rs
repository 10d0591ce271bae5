//! The per-URL document container.
//!
//! Owns the engine document handle and the session runners editing it. For
//! security reasons a worker process hosts at most one of these; the broker
//! loop enforces that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lool_common::ids::decode_session_id;
use lool_common::ShutdownToken;

use crate::engine::{CallbackEvent, DocumentEngine, EngineDocument, EngineError};
use crate::session::{self, KitSession};
use crate::KitError;

/// Documents with no live session are kept around this long before a
/// `query url` sweep discards them, so a client bouncing its connection does
/// not lose the loaded document.
const IDLE_DISCARD_TIMEOUT: Duration = Duration::from_secs(30);

struct SessionEntry {
    session: Arc<KitSession>,
    runner: JoinHandle<()>,
}

struct Inner {
    engine_doc: Option<Arc<dyn EngineDocument>>,
    sessions: HashMap<u64, SessionEntry>,
}

/// A document hosted by this worker.
///
/// The mutex guards the engine handle and the session map. It is released
/// across `engine.load` because the engine invokes the registered callback
/// synchronously during load and the callback re-acquires it.
pub struct Document {
    url: String,
    jail_id: String,
    multi_view: bool,
    client_port: u16,
    engine: Arc<dyn DocumentEngine>,
    shutdown: ShutdownToken,
    inner: Mutex<Inner>,
    client_views: AtomicU32,
    last_activity: Mutex<Instant>,
}

impl Document {
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        jail_id: impl Into<String>,
        url: impl Into<String>,
        client_port: u16,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let url = url.into();
        let jail_id = jail_id.into();
        let multi_view = std::env::var_os("LOK_VIEW_CALLBACK").is_some();
        info!(%url, jail = %jail_id, multi_view, "document created");

        Arc::new(Self {
            url,
            jail_id,
            multi_view,
            client_port,
            engine,
            shutdown,
            inner: Mutex::new(Inner {
                engine_doc: None,
                sessions: HashMap::new(),
            }),
            client_views: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn jail_id(&self) -> &str {
        &self.jail_id
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Number of sessions that have completed `on_load` and not yet
    /// `on_unload`.
    pub fn client_views(&self) -> u32 {
        self.client_views.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Accepts a session routed to this worker by the supervisor: dials the
    /// master back, announces the session and starts its runner.
    ///
    /// A `thread` for a session id whose runner already exited replaces the
    /// dead runner; one whose runner is still alive is ignored.
    pub async fn create_session(self: Arc<Self>, session_id: &str) -> Result<(), KitError> {
        let int_id = decode_session_id(session_id)
            .ok_or_else(|| KitError::BadSessionId(session_id.to_string()))?;

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.sessions.get(&int_id) {
                if !entry.runner.is_finished() {
                    warn!(session = session_id, "session is already running");
                    return Ok(());
                }
                warn!(session = session_id, "session runner is dead, restoring");
                inner.sessions.remove(&int_id);
            }
        }

        info!(
            session = session_id,
            url = %self.url,
            first = self.client_views() == 0,
            "creating session"
        );

        let (kit_session, runner) = session::spawn(self.clone(), session_id.to_string()).await?;

        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(
            int_id,
            SessionEntry {
                session: kit_session,
                runner,
            },
        );
        drop(inner);
        self.touch();
        Ok(())
    }

    /// Loads the document (first session) or attaches a view to it.
    ///
    /// Runs on a blocking thread; the engine may call back synchronously
    /// from inside `load`, so the document lock is released across it.
    pub fn on_load(
        self: Arc<Self>,
        session_id: &str,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError> {
        let int_id = decode_session_id(session_id)
            .ok_or_else(|| EngineError::Load(format!("malformed session id {session_id}")))?;

        info!(
            session = session_id,
            views = self.client_views(),
            "session is loading"
        );

        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(&int_id) {
            return Err(EngineError::Load(format!("unknown session {session_id}")));
        }

        if inner.engine_doc.is_none() {
            info!(%uri, session = session_id, "loading new document");

            let weak = Arc::downgrade(&self);
            self.engine.register_callback(Arc::new(move |event| {
                if let Some(doc) = weak.upgrade() {
                    doc.fan_out(&event);
                }
            }));

            // load invokes the callback synchronously and the callback takes
            // the document lock.
            drop(inner);
            let engine_doc = self.engine.load(uri, options).map_err(|e| {
                error!(%uri, error = %e, "engine load failed");
                e
            })?;
            inner = self.inner.lock().unwrap();
            inner.engine_doc = Some(engine_doc);
        }

        let engine_doc = inner
            .engine_doc
            .clone()
            .expect("engine document present after load");

        if self.multi_view {
            let view_id = engine_doc.create_view();
            let session = inner.sessions.get(&int_id).map(|e| e.session.clone());
            if let Some(session) = session {
                let weak = Arc::downgrade(&session);
                engine_doc.register_view_callback(
                    int_id,
                    Some(Arc::new(move |event| {
                        if let Some(session) = weak.upgrade() {
                            session.engine_event(&event);
                        }
                    })),
                );
            }
            info!(
                url = %self.url,
                view = view_id,
                views = self.client_views() + 1,
                "view loaded"
            );
        } else {
            let weak = Arc::downgrade(&self);
            engine_doc.register_callback(Some(Arc::new(move |event| {
                if let Some(doc) = weak.upgrade() {
                    doc.fan_out(&event);
                }
            })));
        }

        self.client_views.fetch_add(1, Ordering::SeqCst);
        Ok(engine_doc)
    }

    /// Releases one view.
    pub fn on_unload(&self, session_id: &str) {
        let Some(int_id) = decode_session_id(session_id) else {
            return;
        };

        let inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(&int_id) {
            return;
        }

        let views = self
            .client_views
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1);
        info!(session = session_id, views, "session is unloading");

        if self.multi_view {
            if let Some(engine_doc) = inner.engine_doc.clone() {
                engine_doc.register_view_callback(int_id, None);
                let view_id = engine_doc.current_view();
                engine_doc.destroy_view(view_id);
            }
        }
    }

    /// Delivers a document-level engine event to every running session.
    ///
    /// Only copies into outbound channels under the lock; the socket writes
    /// happen on each session's writer task.
    pub fn fan_out(&self, event: &CallbackEvent) {
        let inner = self.inner.lock().unwrap();
        for entry in inner.sessions.values() {
            if !entry.runner.is_finished() {
                entry.session.engine_event(event);
            }
        }
    }

    /// Drops entries whose runner has exited and returns the number of
    /// remaining sessions.
    pub fn purge_sessions(&self) -> usize {
        let dead: Vec<SessionEntry>;
        let remaining;
        {
            let mut inner = self.inner.lock().unwrap();
            let (live, gone): (HashMap<_, _>, HashMap<_, _>) = inner
                .sessions
                .drain()
                .partition(|(_, e)| !e.runner.is_finished());
            inner.sessions = live;
            remaining = inner.sessions.len();
            dead = gone.into_values().collect();
        }
        // Session teardown may want the document lock; never drop them while
        // holding it.
        drop(dead);
        remaining
    }

    pub fn has_live_sessions(&self) -> bool {
        self.purge_sessions() > 0
    }

    /// Whether the `query url` sweep may drop this document: nobody is
    /// connected and it has been idle past the grace window.
    pub fn can_discard(&self) -> bool {
        !self.has_live_sessions()
            && self.last_activity.lock().unwrap().elapsed() >= IDLE_DISCARD_TIMEOUT
    }

    /// Stops every session and waits for their runners.
    ///
    /// On abnormal termination the sessions' readers are woken first so a
    /// blocked receive cannot stall the join.
    pub async fn terminate(&self) {
        let entries: Vec<(Arc<KitSession>, JoinHandle<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .sessions
                .drain()
                .map(|(_, e)| (e.session, e.runner))
                .collect()
        };

        info!(url = %self.url, sessions = entries.len(), "terminating document");

        for (session, _) in &entries {
            session.stop();
        }

        for (_, runner) in entries {
            if let Err(e) = runner.await {
                debug!(error = %e, "session runner join failed");
            }
        }

        // The engine document is destroyed last, when the handle drops.
        let mut inner = self.inner.lock().unwrap();
        inner.engine_doc = None;
    }
}
