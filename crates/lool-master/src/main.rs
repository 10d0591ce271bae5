//! loolmaster: the client-facing front end.

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use tracing::info;

use lool_common::transport::ensure_fifo;
use lool_common::ShutdownToken;
use lool_master::broker::BrokerWriter;
use lool_master::{server, MasterContext};

fn default_child_root() -> PathBuf {
    PathBuf::from("/var/cache/lool/jails")
}

fn default_broker_pipe() -> PathBuf {
    PathBuf::from("/tmp/loolmaster.fifo")
}

/// lool master server
#[derive(FromArgs)]
struct Args {
    /// port for client and worker WebSockets
    #[argh(option, default = "9980")]
    port: u16,

    /// root directory of the worker jails
    #[argh(option, default = "default_child_root()")]
    childroot: PathBuf,

    /// master-to-supervisor request pipe
    #[argh(option, default = "default_broker_pipe()")]
    brokerpipe: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Args = argh::from_env();

    ensure_fifo(&args.brokerpipe)
        .with_context(|| format!("cannot create broker pipe {}", args.brokerpipe.display()))?;
    let broker = BrokerWriter::open(&args.brokerpipe)
        .with_context(|| format!("cannot open broker pipe {}", args.brokerpipe.display()))?;

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

    let ctx = MasterContext::new(broker, args.childroot, shutdown);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("cannot bind port {}", args.port))?;

    server::serve(listener, ctx).await.context("server failed")?;
    info!("loolmaster finished");
    Ok(())
}
