//! lool Master
//!
//! The master fronts every client WebSocket and multiplexes the sessions of
//! one document onto a single worker process. Each logical client-to-engine
//! pipe is a pair of sessions: a `ToClient` session facing the external
//! client and a `ToPrisoner` session facing the worker that dialed back in.
//! The router between them snoops worker responses into the artifact cache
//! and answers repeat requests from the cache without bothering the worker.
//!
//! # Architecture
//!
//! - [`session`] - per-connection state and the outbound frame channel.
//! - [`router`] - the `handle_input` logic for both session kinds: version
//!   handshake, command classification, cache-first serving, tile combine
//!   splitting, snooping and forwarding.
//! - [`registry`] - the available-child rendezvous table and the per-URL
//!   cache registry.
//! - [`broker`] - the `request` writer toward the spawning supervisor.
//! - [`server`] - the axum WebSocket endpoints `/ws` and
//!   `/loolws/child/{sessionId}`.
//! - [`jail`] - path rewrites across the worker's filesystem jail boundary.

pub mod broker;
pub mod jail;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use lool_common::ShutdownToken;

use crate::broker::BrokerWriter;
use crate::registry::{AvailableChildren, CacheRegistry};

/// Shared state of the master process, injected into every session.
pub struct MasterContext {
    pub children: AvailableChildren,
    pub caches: CacheRegistry,
    pub broker: BrokerWriter,
    /// Root under which worker jails live; save-as URLs coming out of a
    /// worker are re-rooted here.
    pub child_root: PathBuf,
    pub shutdown: ShutdownToken,
}

impl MasterContext {
    pub fn new(broker: BrokerWriter, child_root: PathBuf, shutdown: ShutdownToken) -> Arc<Self> {
        Arc::new(Self {
            children: AvailableChildren::new(),
            caches: CacheRegistry::new(),
            broker,
            child_root,
            shutdown,
        })
    }
}
