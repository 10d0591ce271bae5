//! C ABI binding of the external document engine.
//!
//! The engine ships as a shared library under `<losubpath>/program`. This
//! module resolves its symbols with `libloading` and wraps the raw handles
//! behind the safe [`DocumentEngine`] / [`EngineDocument`] traits. All
//! `unsafe` in the worker lives here.
//!
//! # ABI
//!
//! ```c
//! typedef void (*lool_callback)(int type, const char* payload, void* data);
//!
//! void* lool_engine_init(const char* install_path, const char* user_profile);
//! void  lool_engine_register_callback(void* engine, lool_callback cb, void* data);
//! void* lool_engine_document_load(void* engine, const char* url, const char* options);
//! char* lool_engine_get_error(void* engine);
//! void  lool_engine_destroy(void* engine);
//!
//! int   lool_document_create_view(void* doc);
//! void  lool_document_destroy_view(void* doc, int view);
//! int   lool_document_get_view(void* doc);
//! void  lool_document_register_callback(void* doc, lool_callback cb, void* data);
//! void  lool_document_register_view_callback(void* doc, unsigned long tag,
//!                                            lool_callback cb, void* data);
//! int   lool_document_dispatch(void* doc, const unsigned char* frame, size_t len,
//!                              unsigned char** out, size_t* out_len);
//! void  lool_document_destroy(void* doc);
//!
//! void  lool_free(void* ptr);
//! ```
//!
//! `lool_document_dispatch` returns reply frames concatenated as
//! `[u32 big-endian length][frame bytes]...` in a single engine-allocated
//! buffer that the caller releases with `lool_free`. A nonzero return means
//! the command was rejected; `lool_engine_get_error` describes why.
//!
//! # Callback ownership
//!
//! Each registration boxes the Rust closure and hands the raw pointer to the
//! engine as its `data` argument. The previous box, if any, is reclaimed on
//! re-registration and on destroy, so the trampoline never observes a freed
//! closure.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use libloading::Library;
use tracing::{error, warn};

use super::{CallbackEvent, CallbackKind, DocumentEngine, EngineCallback, EngineDocument, EngineError};

/// Shared library name, resolved under `<losubpath>/program`.
pub const ENGINE_LIBRARY: &str = "libloolengine.so";

type RawCallback = unsafe extern "C" fn(c_int, *const c_char, *mut c_void);

type EngineInitFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_void;
type EngineRegisterFn = unsafe extern "C" fn(*mut c_void, Option<RawCallback>, *mut c_void);
type EngineLoadFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_void;
type EngineErrorFn = unsafe extern "C" fn(*mut c_void) -> *mut c_char;
type EngineDestroyFn = unsafe extern "C" fn(*mut c_void);
type DocViewFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type DocDestroyViewFn = unsafe extern "C" fn(*mut c_void, c_int);
type DocRegisterFn = unsafe extern "C" fn(*mut c_void, Option<RawCallback>, *mut c_void);
type DocRegisterViewFn =
    unsafe extern "C" fn(*mut c_void, u64, Option<RawCallback>, *mut c_void);
type DocDispatchFn = unsafe extern "C" fn(
    *mut c_void,
    *const u8,
    usize,
    *mut *mut u8,
    *mut usize,
) -> c_int;
type DocDestroyFn = unsafe extern "C" fn(*mut c_void);
type FreeFn = unsafe extern "C" fn(*mut c_void);

/// Resolved engine entry points. Copies of the function pointers are kept
/// alongside the library handle so they stay valid for the process lifetime.
struct Api {
    _lib: Library,
    engine_init: EngineInitFn,
    engine_register_callback: EngineRegisterFn,
    engine_document_load: EngineLoadFn,
    engine_get_error: EngineErrorFn,
    engine_destroy: EngineDestroyFn,
    document_create_view: DocViewFn,
    document_destroy_view: DocDestroyViewFn,
    document_get_view: DocViewFn,
    document_register_callback: DocRegisterFn,
    document_register_view_callback: DocRegisterViewFn,
    document_dispatch: DocDispatchFn,
    document_destroy: DocDestroyFn,
    free: FreeFn,
}

impl Api {
    fn open(path: &Path) -> Result<Self, EngineError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| EngineError::Library(format!("dlopen {} failed: {e}", path.display())))?;

        macro_rules! sym {
            ($name:literal) => {
                unsafe {
                    *lib.get($name)
                        .map_err(|e| EngineError::Library(format!(
                            "missing symbol {}: {e}",
                            String::from_utf8_lossy(&$name[..$name.len() - 1])
                        )))?
                }
            };
        }

        let engine_init: EngineInitFn = sym!(b"lool_engine_init\0");
        let engine_register_callback: EngineRegisterFn = sym!(b"lool_engine_register_callback\0");
        let engine_document_load: EngineLoadFn = sym!(b"lool_engine_document_load\0");
        let engine_get_error: EngineErrorFn = sym!(b"lool_engine_get_error\0");
        let engine_destroy: EngineDestroyFn = sym!(b"lool_engine_destroy\0");
        let document_create_view: DocViewFn = sym!(b"lool_document_create_view\0");
        let document_destroy_view: DocDestroyViewFn = sym!(b"lool_document_destroy_view\0");
        let document_get_view: DocViewFn = sym!(b"lool_document_get_view\0");
        let document_register_callback: DocRegisterFn = sym!(b"lool_document_register_callback\0");
        let document_register_view_callback: DocRegisterViewFn =
            sym!(b"lool_document_register_view_callback\0");
        let document_dispatch: DocDispatchFn = sym!(b"lool_document_dispatch\0");
        let document_destroy: DocDestroyFn = sym!(b"lool_document_destroy\0");
        let free: FreeFn = sym!(b"lool_free\0");

        Ok(Self {
            _lib: lib,
            engine_init,
            engine_register_callback,
            engine_document_load,
            engine_get_error,
            engine_destroy,
            document_create_view,
            document_destroy_view,
            document_get_view,
            document_register_callback,
            document_register_view_callback,
            document_dispatch,
            document_destroy,
            free,
        })
    }
}

/// Boxed closure handed to the engine as callback `data`.
struct Trampoline {
    cb: EngineCallback,
}

unsafe extern "C" fn trampoline(ty: c_int, payload: *const c_char, data: *mut c_void) {
    if data.is_null() {
        return;
    }
    let tramp = &*(data as *const Trampoline);
    let payload = if payload.is_null() {
        String::new()
    } else {
        CStr::from_ptr(payload).to_string_lossy().into_owned()
    };
    match CallbackKind::from_code(ty) {
        Some(kind) => (tramp.cb)(CallbackEvent { kind, payload }),
        None => warn!(code = ty, "engine reported unknown callback type"),
    }
}

/// Tracks the live trampoline for one registration slot so re-registration
/// reclaims the previous closure.
#[derive(Default)]
struct CallbackSlot {
    raw: Option<*mut Trampoline>,
}

impl CallbackSlot {
    /// Boxes `cb` and returns the raw pointer to pass to the engine,
    /// dropping whatever was registered before.
    fn replace(&mut self, cb: Option<EngineCallback>) -> (Option<RawCallback>, *mut c_void) {
        if let Some(old) = self.raw.take() {
            drop(unsafe { Box::from_raw(old) });
        }
        match cb {
            Some(cb) => {
                let raw = Box::into_raw(Box::new(Trampoline { cb }));
                self.raw = Some(raw);
                (Some(trampoline as RawCallback), raw as *mut c_void)
            }
            None => (None, std::ptr::null_mut()),
        }
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

// Raw engine handles are opaque and the library is documented to serialize
// internally; the wrapper upholds Send + Sync on that contract.
unsafe impl Send for CabiEngine {}
unsafe impl Sync for CabiEngine {}

/// The process-level engine handle.
pub struct CabiEngine {
    api: Arc<Api>,
    raw: *mut c_void,
    callback: Mutex<CallbackSlot>,
}

impl fmt::Debug for CabiEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CabiEngine").field("raw", &self.raw).finish()
    }
}

/// Loads the engine library from `<losubpath>/program` and initializes it.
pub fn load_engine(losubpath: &Path) -> Result<Arc<CabiEngine>, EngineError> {
    let lib_path = losubpath.join("program").join(ENGINE_LIBRARY);
    let api = Arc::new(Api::open(&lib_path)?);

    let install = cstring(&lib_path.parent().unwrap_or(losubpath).to_string_lossy())?;
    let profile = cstring("file:///user")?;
    let raw = unsafe { (api.engine_init)(install.as_ptr(), profile.as_ptr()) };
    if raw.is_null() {
        return Err(EngineError::Library(format!(
            "engine initialization failed for {}",
            lib_path.display()
        )));
    }

    Ok(Arc::new(CabiEngine {
        api,
        raw,
        callback: Mutex::new(CallbackSlot::default()),
    }))
}

impl DocumentEngine for CabiEngine {
    fn register_callback(&self, cb: EngineCallback) {
        let mut slot = self.callback.lock().unwrap();
        let (raw_cb, data) = slot.replace(Some(cb));
        unsafe { (self.api.engine_register_callback)(self.raw, raw_cb, data) };
    }

    fn load(
        &self,
        uri: &str,
        options: Option<&str>,
    ) -> Result<Arc<dyn EngineDocument>, EngineError> {
        let uri_c = cstring(uri)?;
        let options_c = options.map(cstring).transpose()?;
        let options_ptr = options_c
            .as_ref()
            .map_or(std::ptr::null(), |c| c.as_ptr());

        let raw =
            unsafe { (self.api.engine_document_load)(self.raw, uri_c.as_ptr(), options_ptr) };
        if raw.is_null() {
            let reason = self
                .last_error()
                .unwrap_or_else(|| "unknown engine error".to_string());
            error!(uri, %reason, "engine load failed");
            return Err(EngineError::Load(reason));
        }

        Ok(Arc::new(CabiDocument {
            api: self.api.clone(),
            raw,
            doc_callback: Mutex::new(CallbackSlot::default()),
            view_callbacks: Mutex::new(Vec::new()),
        }))
    }

    fn last_error(&self) -> Option<String> {
        let raw = unsafe { (self.api.engine_get_error)(self.raw) };
        if raw.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.api.free)(raw as *mut c_void) };
        Some(message)
    }
}

impl Drop for CabiEngine {
    fn drop(&mut self) {
        unsafe { (self.api.engine_destroy)(self.raw) };
    }
}

unsafe impl Send for CabiDocument {}
unsafe impl Sync for CabiDocument {}

/// An engine-loaded document handle.
pub struct CabiDocument {
    api: Arc<Api>,
    raw: *mut c_void,
    doc_callback: Mutex<CallbackSlot>,
    view_callbacks: Mutex<Vec<(u64, CallbackSlot)>>,
}

impl EngineDocument for CabiDocument {
    fn create_view(&self) -> i32 {
        unsafe { (self.api.document_create_view)(self.raw) }
    }

    fn destroy_view(&self, view_id: i32) {
        unsafe { (self.api.document_destroy_view)(self.raw, view_id) };
    }

    fn current_view(&self) -> i32 {
        unsafe { (self.api.document_get_view)(self.raw) }
    }

    fn register_callback(&self, cb: Option<EngineCallback>) {
        let mut slot = self.doc_callback.lock().unwrap();
        let (raw_cb, data) = slot.replace(cb);
        unsafe { (self.api.document_register_callback)(self.raw, raw_cb, data) };
    }

    fn register_view_callback(&self, tag: u64, cb: Option<EngineCallback>) {
        let mut slots = self.view_callbacks.lock().unwrap();
        let idx = match slots.iter().position(|(t, _)| *t == tag) {
            Some(idx) => idx,
            None => {
                slots.push((tag, CallbackSlot::default()));
                slots.len() - 1
            }
        };
        let (raw_cb, data) = slots[idx].1.replace(cb);
        unsafe { (self.api.document_register_view_callback)(self.raw, tag, raw_cb, data) };
    }

    fn dispatch(&self, frame: &[u8]) -> Result<Vec<Bytes>, EngineError> {
        let mut out: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let rc = unsafe {
            (self.api.document_dispatch)(self.raw, frame.as_ptr(), frame.len(), &mut out, &mut out_len)
        };
        if rc != 0 {
            return Err(EngineError::Dispatch(format!("engine returned {rc}")));
        }
        if out.is_null() || out_len == 0 {
            return Ok(Vec::new());
        }

        let buffer = unsafe { std::slice::from_raw_parts(out, out_len) };
        let replies = split_replies(buffer);
        unsafe { (self.api.free)(out as *mut c_void) };
        replies
    }
}

impl Drop for CabiDocument {
    fn drop(&mut self) {
        unsafe { (self.api.document_destroy)(self.raw) };
    }
}

/// Splits the engine's length-prefixed reply buffer into frames.
fn split_replies(mut buffer: &[u8]) -> Result<Vec<Bytes>, EngineError> {
    let mut replies = Vec::new();
    while !buffer.is_empty() {
        if buffer.len() < 4 {
            return Err(EngineError::Dispatch("truncated reply buffer".to_string()));
        }
        let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        buffer = &buffer[4..];
        if buffer.len() < len {
            return Err(EngineError::Dispatch("truncated reply frame".to_string()));
        }
        replies.push(Bytes::copy_from_slice(&buffer[..len]));
        buffer = &buffer[len..];
    }
    Ok(replies)
}

fn cstring(s: &str) -> Result<CString, EngineError> {
    CString::new(s).map_err(|_| EngineError::Library("embedded NUL in engine string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_replies_multiple_frames() {
        let mut buf = Vec::new();
        for frame in [&b"status: parts=1"[..], &b"tile: part=0\nPNG"[..]] {
            buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            buf.extend_from_slice(frame);
        }
        let replies = split_replies(&buf).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(&replies[0][..], b"status: parts=1");
        assert_eq!(&replies[1][..], b"tile: part=0\nPNG");
    }

    #[test]
    fn test_split_replies_empty() {
        assert!(split_replies(b"").unwrap().is_empty());
    }

    #[test]
    fn test_split_replies_truncated() {
        assert!(split_replies(&[0, 0, 0, 9, b'x']).is_err());
        assert!(split_replies(&[0, 0]).is_err());
    }

    #[test]
    fn test_load_engine_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_engine(dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::Library(_)));
    }
}
