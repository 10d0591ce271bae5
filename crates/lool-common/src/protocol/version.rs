//! Protocol version handshake.
//!
//! The first frame a client sends is `loolclient <major>.<minor>.<patch>`.
//! The server accepts any patch level but requires an exact match on the
//! `(major, minor)` pair, answering `loolserver <version>` on success.

pub const PROTOCOL_MAJOR: u32 = 0;
pub const PROTOCOL_MINOR: u32 = 1;
pub const PROTOCOL_PATCH: u32 = 0;

/// The version string the server advertises in its `loolserver` reply.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Parses a `major.minor.patch` version string.
pub fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Whether a parsed client version is compatible with this server.
pub fn matches_server(version: (u32, u32, u32)) -> bool {
    version.0 == PROTOCOL_MAJOR && version.1 == PROTOCOL_MINOR
}
