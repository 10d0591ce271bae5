//! The per-document artifact store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::debug;

use crate::key::{Invalidation, TileKey};

/// Cache of expensive rendering artifacts for one document URL.
///
/// Internally synchronized; callers share it behind an `Arc`. The master's
/// worker-facing sessions populate it while snooping responses and its
/// client-facing sessions read it, so no raw map ever crosses this
/// interface.
///
/// Text artifact names double as filename components should a disk backing
/// ever be added, so they are sanitized on the way in.
pub struct TileCache {
    doc_url: String,
    timestamp: Option<String>,
    tiles: Mutex<HashMap<TileKey, Bytes>>,
    texts: Mutex<HashMap<String, String>>,
    renderings: Mutex<HashMap<(String, String), Bytes>>,
    editing: AtomicBool,
    saved: AtomicBool,
}

/// Artifacts that survive `document_saved`.
const STATUS_FILE: &str = "status.txt";

impl TileCache {
    pub fn new(doc_url: impl Into<String>, timestamp: Option<String>) -> Self {
        Self {
            doc_url: doc_url.into(),
            timestamp,
            tiles: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
            renderings: Mutex::new(HashMap::new()),
            editing: AtomicBool::new(false),
            saved: AtomicBool::new(true),
        }
    }

    pub fn doc_url(&self) -> &str {
        &self.doc_url
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    /// Stores (or overwrites) a rendered tile.
    pub fn save_tile(&self, key: TileKey, data: Bytes) {
        self.tiles.lock().unwrap().insert(key, data);
    }

    /// Looks up a tile; the returned bytes are a cheap clone suitable for
    /// streaming straight to the wire.
    pub fn lookup_tile(&self, key: &TileKey) -> Option<Bytes> {
        self.tiles.lock().unwrap().get(key).cloned()
    }

    /// Stores a named text artifact (`status.txt`, `partpagerectangles.txt`,
    /// `cmdValues<command>.txt`).
    pub fn save_text_file(&self, name: &str, contents: impl Into<String>) {
        self.texts
            .lock()
            .unwrap()
            .insert(sanitize_name(name), contents.into());
    }

    /// Returns a named text artifact, or `None` when absent or empty.
    pub fn get_text_file(&self, name: &str) -> Option<String> {
        self.texts
            .lock()
            .unwrap()
            .get(&sanitize_name(name))
            .filter(|s| !s.is_empty())
            .cloned()
    }

    /// Stores a font rendering under `(font, kind)`.
    pub fn save_rendering(&self, font: &str, kind: &str, data: Bytes) {
        self.renderings
            .lock()
            .unwrap()
            .insert((font.to_string(), kind.to_string()), data);
    }

    pub fn lookup_rendering(&self, font: &str, kind: &str) -> Option<Bytes> {
        self.renderings
            .lock()
            .unwrap()
            .get(&(font.to_string(), kind.to_string()))
            .cloned()
    }

    /// Drops every tile intersecting the rectangle, edge-inclusive, on the
    /// given part.
    pub fn invalidate_tiles_rect(&self, part: i32, x: i32, y: i32, width: i32, height: i32) {
        self.apply(&Invalidation::Rects(vec![crate::key::PartRect {
            part: Some(part),
            rect: crate::key::Rect { x, y, width, height },
        }]));
    }

    /// Honors the engine's raw `invalidatetiles:` message.
    pub fn invalidate_tiles(&self, raw: &str) {
        self.apply(&Invalidation::parse(raw));
    }

    fn apply(&self, invalidation: &Invalidation) {
        let mut tiles = self.tiles.lock().unwrap();
        let before = tiles.len();
        match invalidation {
            Invalidation::All => tiles.clear(),
            Invalidation::Rects(rects) => {
                tiles.retain(|key, _| !rects.iter().any(|r| r.covers(key)));
            }
        }
        debug!(
            doc = %self.doc_url,
            dropped = before - tiles.len(),
            remaining = tiles.len(),
            "invalidated tiles"
        );
    }

    /// Marks the document as being edited. The first edit clears the saved
    /// flag; it is restored by [`TileCache::document_saved`].
    pub fn set_editing(&self, editing: bool) {
        self.editing.store(editing, Ordering::SeqCst);
        if editing {
            self.saved.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_editing(&self) -> bool {
        self.editing.load(Ordering::SeqCst)
    }

    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::SeqCst)
    }

    /// Records a completed save.
    ///
    /// Command values and part page rectangles are stale once the engine has
    /// rewritten the file, so every text artifact except `status.txt` is
    /// dropped. Tiles are governed by invalidation, not by saves.
    pub fn document_saved(&self) {
        self.saved.store(true, Ordering::SeqCst);
        self.texts.lock().unwrap().retain(|name, _| name == STATUS_FILE);
        debug!(doc = %self.doc_url, "document saved; volatile text artifacts dropped");
    }
}

/// Keeps artifact names usable as filename components.
fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
