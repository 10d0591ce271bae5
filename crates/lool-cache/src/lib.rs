//! lool Artifact Cache
//!
//! Rendering a tile, enumerating command values or rasterizing a font preview
//! all require a round-trip into the document engine inside a worker process.
//! The master snoops those responses on their way back to the client and
//! stores them here, keyed per document URL, so that repeated requests (from
//! the same client, from other clients on the same document, or from a fresh
//! session after a worker died) are answered without touching a worker.
//!
//! # Components
//!
//! - [`TileCache`] - the per-document store: tiles by their 7-tuple key,
//!   named text artifacts, font renderings, and the editing/saved flags.
//! - [`key`] - tile keys, document-coordinate rectangles and the parser for
//!   the engine's free-form `invalidatetiles:` payload.
//!
//! # Invalidation
//!
//! A lookup must never return a tile whose key intersects an invalidation
//! region issued after the tile was stored. The cache enforces this eagerly:
//! invalidation walks the stored keys and drops every intersecting tile, so
//! lookups stay O(1).

pub mod key;
mod tile_cache;

pub use key::{Invalidation, PartRect, Rect, TileKey};
pub use tile_cache::TileCache;
