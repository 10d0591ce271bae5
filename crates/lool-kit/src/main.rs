//! loolkit: the per-document worker process.
//!
//! Spawned by the supervisor with a filesystem jail already set up around
//! it. Binds the document engine from `--losubpath`, then serves supervisor
//! requests from `--pipe` until told to stop or the pipe breaks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use tracing::{info, warn};

use lool_common::ShutdownToken;
use lool_kit::broker::{BrokerLoop, BROKER_FIFO};
use lool_kit::engine::cabi;

/// lool document worker host
#[derive(FromArgs)]
struct Args {
    /// engine install subpath
    #[argh(option)]
    losubpath: String,

    /// jail identifier assigned by the supervisor
    #[argh(option)]
    jailid: String,

    /// supervisor-to-worker pipe path
    #[argh(option)]
    pipe: PathBuf,

    /// master port to dial back for session WebSockets
    #[argh(option, default = "9980")]
    clientport: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Give a debugger a chance to attach before anything else happens.
    if let Ok(secs) = std::env::var("SLEEPFORDEBUGGER") {
        eprintln!(
            "Sleeping {secs} seconds to attach debugger to process {}",
            std::process::id()
        );
        let secs: u64 = secs.parse().unwrap_or(0);
        std::thread::sleep(Duration::from_secs(secs));
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Args = argh::from_env();
    anyhow::ensure!(!args.losubpath.is_empty(), "--losubpath is empty");
    anyhow::ensure!(!args.jailid.is_empty(), "--jailid is empty");

    if std::env::var_os("LD_BIND_NOW").is_none() {
        warn!("Note: LD_BIND_NOW is not set.");
    }
    if std::env::var_os("LOK_VIEW_CALLBACK").is_none() {
        warn!("Note: LOK_VIEW_CALLBACK is not set.");
    }

    let engine = cabi::load_engine(&PathBuf::from(&args.losubpath))
        .context("document engine initialization failed")?;
    info!(pid = std::process::id(), "loolkit is ready");

    let shutdown = ShutdownToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received");
                shutdown.request_stop();
            }
        }
    });

    let engine: Arc<dyn lool_kit::engine::DocumentEngine> = engine;
    let broker = BrokerLoop::new(engine, args.jailid, args.clientport, shutdown);
    broker
        .run(&args.pipe, &PathBuf::from(BROKER_FIFO))
        .await
        .context("worker broker loop failed")?;

    info!("loolkit finished");
    Ok(())
}
