//! The master's WebSocket endpoints.
//!
//! Clients connect on `/ws`; workers dial back on
//! `/loolws/child/{sessionId}`, and only from the loopback interface. Every
//! accepted socket gets a writer task draining the session's outbound
//! channel and a read loop feeding the router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lool_common::ids::next_session_id;

use crate::router::handle_input;
use crate::session::{MasterSession, OutFrame, SessionKind};
use crate::MasterContext;

/// Builds the master's route table.
pub fn app(ctx: Arc<MasterContext>) -> Router {
    Router::new()
        .route("/ws", get(client_ws))
        .route("/loolws/child/{session_id}", get(child_ws))
        .with_state(ctx)
}

/// Serves until the context's shutdown token fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: Arc<MasterContext>,
) -> std::io::Result<()> {
    let shutdown = ctx.shutdown.clone();
    info!(addr = %listener.local_addr()?, "master listening");
    axum::serve(
        listener,
        app(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.stopped().await })
    .await
}

async fn client_ws(State(ctx): State<Arc<MasterContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        run_session(socket, SessionKind::ToClient, next_session_id(), ctx)
    })
}

async fn child_ws(
    State(ctx): State<Arc<MasterContext>>,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    // Workers live on this host; refuse child handshakes from anywhere else.
    if !addr.ip().is_loopback() {
        warn!(%addr, "rejecting non-local child connection");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| run_session(socket, SessionKind::ToPrisoner, session_id, ctx))
}

async fn run_session(
    socket: WebSocket,
    kind: SessionKind,
    id: String,
    ctx: Arc<MasterContext>,
) {
    let (session, out_rx) = MasterSession::new(id, kind, ctx.clone());
    let (sender, mut receiver) = socket.split();

    let writer = tokio::spawn(write_out(sender, out_rx));

    let mut reason = String::new();
    loop {
        let (data, binary): (Vec<u8>, bool) = match receiver.next().await {
            None => break,
            Some(Err(e)) => {
                // I/O failures are caught at the session boundary; the peer
                // is told an equivalent reason below.
                warn!(session = %session.name(), error = %e, "WebSocket receive failed");
                reason = "io".to_string();
                break;
            }
            Some(Ok(Message::Text(text))) => (text.as_bytes().to_vec(), false),
            Some(Ok(Message::Binary(data))) => (data.to_vec(), true),
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => continue,
        };

        if !handle_input(&session, &data, binary).await {
            break;
        }
        if ctx.shutdown.should_stop() {
            break;
        }
    }

    // An unclaimed child must not linger in the rendezvous table.
    if kind == SessionKind::ToPrisoner {
        ctx.children.remove(&session.id());
    }
    session.disconnect(&reason);
    let _ = writer.await;
    debug!(session = %session.name(), "session finished");
}

async fn write_out(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<OutFrame>,
) {
    while let Some(frame) = out_rx.recv().await {
        let result = match frame {
            OutFrame::Text(text) => sender.send(Message::Text(text.into())).await,
            OutFrame::Binary(data) => sender.send(Message::Binary(data.into())).await,
            OutFrame::Close => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}
