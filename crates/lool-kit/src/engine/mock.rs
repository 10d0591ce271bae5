//! Scriptable in-process engine for tests.
//!
//! The mock records every dispatched frame, answers commands from a scripted
//! reply table, and lets a test fire callback events as if the engine had
//! produced them. `fire_during_load` reproduces the engine's synchronous
//! callback-from-inside-`load` behavior, which is what the document lock
//! discipline exists for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{
    CallbackEvent, DocumentEngine, EngineCallback, EngineDocument, EngineError,
};

#[derive(Default)]
pub struct MockEngine {
    /// Replies keyed by command name (the first token of the frame).
    replies: Mutex<HashMap<String, Vec<Bytes>>>,
    /// Event fired synchronously from inside `load`, if set.
    fire_during_load: Mutex<Option<CallbackEvent>>,
    /// When set, `load` fails and `last_error` explains it.
    fail_load: AtomicBool,
    engine_callback: Mutex<Option<EngineCallback>>,
    last_document: Mutex<Option<Arc<MockDocument>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Scripts the reply frames for a command name.
    pub fn script_reply(&self, command: &str, frames: Vec<Bytes>) {
        self.replies.lock().unwrap().insert(command.to_string(), frames);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_fire_during_load(&self, event: CallbackEvent) {
        *self.fire_during_load.lock().unwrap() = Some(event);
    }

    /// The document created by the last successful `load`.
    pub fn document(&self) -> Option<Arc<MockDocument>> {
        self.last_document.lock().unwrap().clone()
    }
}

impl DocumentEngine for MockEngine {
    fn register_callback(&self, cb: EngineCallback) {
        *self.engine_callback.lock().unwrap() = Some(cb);
    }

    fn load(
        &self,
        uri: &str,
        _options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(EngineError::Load(format!("mock refused to load {uri}")));
        }

        // The real engine can invoke the registered callback synchronously
        // while still inside load.
        if let Some(event) = self.fire_during_load.lock().unwrap().clone() {
            if let Some(cb) = self.engine_callback.lock().unwrap().clone() {
                cb(event);
            }
        }

        let doc = Arc::new(MockDocument {
            uri: uri.to_string(),
            replies: self.replies.lock().unwrap().clone(),
            ..Default::default()
        });
        *self.last_document.lock().unwrap() = Some(doc.clone());
        Ok(doc)
    }

    fn last_error(&self) -> Option<String> {
        self.fail_load
            .load(Ordering::SeqCst)
            .then(|| "mock load failure".to_string())
    }
}

#[derive(Default)]
pub struct MockDocument {
    pub uri: String,
    replies: HashMap<String, Vec<Bytes>>,
    dispatched: Mutex<Vec<String>>,
    next_view: AtomicI32,
    views_alive: AtomicI32,
    doc_callback: Mutex<Option<EngineCallback>>,
    view_callbacks: Mutex<HashMap<u64, EngineCallback>>,
}

impl MockDocument {
    /// First lines of every frame dispatched so far.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn views_alive(&self) -> i32 {
        self.views_alive.load(Ordering::SeqCst)
    }

    /// Fires a document-level event as the engine would.
    pub fn fire(&self, event: CallbackEvent) {
        if let Some(cb) = self.doc_callback.lock().unwrap().clone() {
            cb(event);
        }
    }

    /// Fires a view-tagged event.
    pub fn fire_view(&self, tag: u64, event: CallbackEvent) {
        if let Some(cb) = self.view_callbacks.lock().unwrap().get(&tag).cloned() {
            cb(event);
        }
    }

    pub fn has_view_callback(&self, tag: u64) -> bool {
        self.view_callbacks.lock().unwrap().contains_key(&tag)
    }
}

impl EngineDocument for MockDocument {
    fn create_view(&self) -> i32 {
        self.views_alive.fetch_add(1, Ordering::SeqCst);
        self.next_view.fetch_add(1, Ordering::SeqCst)
    }

    fn destroy_view(&self, _view_id: i32) {
        self.views_alive.fetch_sub(1, Ordering::SeqCst);
    }

    fn current_view(&self) -> i32 {
        self.next_view.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn register_callback(&self, cb: Option<EngineCallback>) {
        *self.doc_callback.lock().unwrap() = cb;
    }

    fn register_view_callback(&self, tag: u64, cb: Option<EngineCallback>) {
        let mut callbacks = self.view_callbacks.lock().unwrap();
        match cb {
            Some(cb) => {
                callbacks.insert(tag, cb);
            }
            None => {
                callbacks.remove(&tag);
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) -> Result<Vec<Bytes>, EngineError> {
        let line = lool_common::protocol::first_line(frame).to_string();
        let command = line.split(' ').next().unwrap_or("").to_string();
        self.dispatched.lock().unwrap().push(line);
        Ok(self.replies.get(&command).cloned().unwrap_or_default())
    }
}
