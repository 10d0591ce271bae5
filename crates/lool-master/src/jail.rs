//! URL rewrites across the jail boundary.
//!
//! A worker sees the world under its filesystem jail: the document it loads
//! lives at a jailed path, and any path it reports (a completed save-as)
//! is relative to the jail root. The master translates in both directions at
//! the protocol boundary; the jail setup itself is the supervisor's job.

use std::path::Path;

use url::Url;

const FILE_PREFIX: &str = "file:///";

/// Where documents are linked inside every jail.
const JAIL_DOC_ROOT: &str = "file:///user/docs/";

/// The URI under which a worker sees a public document URL.
pub fn jailed_uri(public: &Url) -> String {
    let basename = Path::new(public.path())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{JAIL_DOC_ROOT}{basename}")
}

/// Re-roots a `file:///` URL reported from inside a jail under the jail's
/// directory, making it meaningful outside. Non-file URLs pass through.
pub fn rewrite_saveas_url(child_root: &Path, child_id: &str, url: &str) -> String {
    let Some(inner) = url.strip_prefix(FILE_PREFIX) else {
        return url.to_string();
    };
    let path = child_root.join(child_id).join(inner);
    format!("file://{}", path.display())
}
