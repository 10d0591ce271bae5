//! The document engine interface.
//!
//! The engine is an opaque external library. The worker talks to it through
//! two traits: [`DocumentEngine`] (process-level: load documents, report
//! errors) and [`EngineDocument`] (document-level: views, callbacks, text
//! command dispatch). Asynchronous events flow back through a registered
//! [`EngineCallback`]; direct replies to a dispatched command are returned
//! from [`EngineDocument::dispatch`] as complete wire frames.
//!
//! The real library is bound in [`cabi`]; [`mock`] provides a scriptable
//! in-process engine for tests.

pub mod cabi;
pub mod mock;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine failed to load document: {0}")]
    Load(String),

    #[error("engine rejected command: {0}")]
    Dispatch(String),

    #[error("engine library error: {0}")]
    Library(String),
}

/// Event types the engine reports through callbacks.
///
/// The numeric codes are the engine library's own; [`CallbackKind::from_code`]
/// is the only place they appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    InvalidateTiles,
    InvalidateCursor,
    TextSelection,
    TextSelectionStart,
    TextSelectionEnd,
    CursorVisible,
    GraphicSelection,
    HyperlinkClicked,
    StateChanged,
    StatusIndicatorStart,
    StatusIndicatorSetValue,
    StatusIndicatorFinish,
    SearchNotFound,
    DocumentSizeChanged,
    SetPart,
}

impl CallbackKind {
    pub fn from_code(code: i32) -> Option<Self> {
        use CallbackKind::*;
        Some(match code {
            0 => InvalidateTiles,
            1 => InvalidateCursor,
            2 => TextSelection,
            3 => TextSelectionStart,
            4 => TextSelectionEnd,
            5 => CursorVisible,
            6 => GraphicSelection,
            7 => HyperlinkClicked,
            8 => StateChanged,
            9 => StatusIndicatorStart,
            10 => StatusIndicatorSetValue,
            11 => StatusIndicatorFinish,
            12 => SearchNotFound,
            13 => DocumentSizeChanged,
            14 => SetPart,
            _ => return None,
        })
    }

    /// Renders the event as the frame(s) a session forwards to the master.
    ///
    /// `SetPart` produces two frames: `curpart:` keeps the master's part
    /// tracking current (it is snooped there, never forwarded), `setpart:`
    /// goes on to the client.
    pub fn frames(self, payload: &str) -> Vec<String> {
        use CallbackKind::*;
        match self {
            InvalidateTiles => vec![format!("invalidatetiles: {payload}")],
            InvalidateCursor => vec![format!("invalidatecursor: {payload}")],
            TextSelection => vec![format!("textselection: {payload}")],
            TextSelectionStart => vec![format!("textselectionstart: {payload}")],
            TextSelectionEnd => vec![format!("textselectionend: {payload}")],
            CursorVisible => vec![format!("cursorvisible: {payload}")],
            GraphicSelection => vec![format!("graphicselection: {payload}")],
            HyperlinkClicked => vec![format!("hyperlinkclicked: {payload}")],
            StateChanged => vec![format!("statechanged: {payload}")],
            StatusIndicatorStart => vec!["statusindicatorstart:".to_string()],
            StatusIndicatorSetValue => {
                vec![format!("statusindicatorsetvalue: {payload}")]
            }
            StatusIndicatorFinish => vec!["statusindicatorfinish:".to_string()],
            SearchNotFound => vec![format!("searchnotfound: {payload}")],
            DocumentSizeChanged => vec![format!("documentsizechanged: {payload}")],
            SetPart => vec![
                format!("curpart: part={payload}"),
                format!("setpart: part={payload}"),
            ],
        }
    }
}

/// One engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub kind: CallbackKind,
    pub payload: String,
}

impl CallbackEvent {
    pub fn new(kind: CallbackKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Callback handed to the engine. Invoked synchronously on the engine's own
/// thread, possibly re-entrantly from inside `load`; implementations must
/// not block.
pub type EngineCallback = Arc<dyn Fn(CallbackEvent) + Send + Sync>;

/// Process-level engine handle.
pub trait DocumentEngine: Send + Sync {
    /// Registers the process-level callback. The engine may invoke it
    /// synchronously from within [`DocumentEngine::load`].
    fn register_callback(&self, cb: EngineCallback);

    /// Loads a document. `options` is the free-form rendering options blob
    /// from the client's `load` command, passed through untouched.
    fn load(
        &self,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError>;

    /// The engine's description of its most recent failure.
    fn last_error(&self) -> Option<String>;
}

/// An engine-loaded document.
pub trait EngineDocument: Send + Sync {
    fn create_view(&self) -> i32;

    fn destroy_view(&self, view_id: i32);

    /// The view most recently made current by the engine.
    fn current_view(&self) -> i32;

    /// Replaces the document-level callback; `None` unregisters.
    fn register_callback(&self, cb: Option<EngineCallback>);

    /// Registers a callback for events belonging to one view, tagged with
    /// the numeric session id that owns it.
    fn register_view_callback(&self, tag: u64, cb: Option<EngineCallback>);

    /// Feeds one text command frame to the engine and returns any direct
    /// reply frames (e.g. `status: ...` or `tile: ...\n<png>`), ready for
    /// the wire.
    fn dispatch(&self, frame: &[u8]) -> Result<Vec<Bytes>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_code_round_trip() {
        for code in 0..15 {
            let kind = CallbackKind::from_code(code).expect("code should map");
            assert!(!kind.frames("x").is_empty());
        }
        assert_eq!(CallbackKind::from_code(999), None);
    }

    #[test]
    fn test_set_part_emits_curpart_then_setpart() {
        let frames = CallbackKind::SetPart.frames("3");
        assert_eq!(frames, vec!["curpart: part=3", "setpart: part=3"]);
    }

    #[test]
    fn test_invalidate_frames() {
        assert_eq!(
            CallbackKind::InvalidateTiles.frames("0, 0, 10240, 2560"),
            vec!["invalidatetiles: 0, 0, 10240, 2560"]
        );
    }
}
