//! The session router.
//!
//! One `handle_input` for both session kinds. On the worker-facing side it
//! snoops responses into the tile cache before forwarding them to the paired
//! client; on the client-facing side it validates commands, answers what the
//! cache already knows, and routes the rest to the worker, acquiring one
//! through the child rendezvous when the session has no peer yet.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use lool_cache::TileKey;
use lool_common::protocol::{
    abbreviate, first_line, is_allowed_command, matches_server, parse_doc_options, parse_version,
    split_frame, token_int, token_string, tokenize, ClientError, ErrorKind, PROTOCOL_VERSION,
};

use crate::jail;
use crate::session::{MasterSession, SessionKind};

/// Bounded wait for one child-acquisition attempt.
const CHILD_WAIT: Duration = Duration::from_secs(2);
/// Number of acquisition attempts before giving up on the client.
const CHILD_ATTEMPTS: u32 = 3;

/// Routes one inbound frame. Returns `false` when the session should close.
pub async fn handle_input(session: &Arc<MasterSession>, data: &[u8], binary: bool) -> bool {
    let line = first_line(data).to_string();
    let tokens = tokenize(&line);
    let Some(&cmd) = tokens.first() else {
        return true;
    };
    trace!(session = %session.name(), frame = %abbreviate(data, 60), "recv");

    if cmd == "loolclient" {
        return handle_version(session, &tokens);
    }

    // A worker-facing session past its hello forwards everything to the
    // paired client, with the cache snooping on the way.
    if session.kind() == SessionKind::ToPrisoner && session.has_separate_process() {
        return snoop_and_forward(session, data, binary, &line, &tokens);
    }

    if cmd == "child" {
        return handle_child_hello(session, &tokens);
    }

    if session.kind() == SessionKind::ToPrisoner {
        error!(session = %session.name(), %cmd, "unexpected request before child hello");
        return false;
    }

    // Client-facing from here on.
    match cmd {
        "load" => handle_load(session, &tokens).await,
        _ if !is_allowed_command(cmd) => {
            send_error(session, cmd, ErrorKind::Unknown);
            true
        }
        _ if session.doc_url().is_none() => {
            send_error(session, cmd, ErrorKind::NoDocLoaded);
            true
        }
        "canceltiles" => {
            // Best effort: only meaningful when a worker is rendering.
            if session.has_peer() {
                forward_to_peer(session, data, binary);
            }
            true
        }
        "commandvalues" => get_command_values(session, data, binary, &tokens).await,
        "partpagerectangles" => get_part_page_rectangles(session, data, binary).await,
        "invalidatetiles" => client_invalidate_tiles(session, &tokens),
        "renderfont" => send_font_rendering(session, data, binary, &tokens).await,
        "status" => get_status(session, data, binary).await,
        "tile" => send_tile(session, data, binary, &tokens).await,
        "tilecombine" => send_combined_tiles(session, &tokens).await,
        "disconnect" => handle_client_disconnect(session, &tokens),
        _ => {
            // Everything else needs a live engine session in a worker.
            if !session.has_peer() && !dispatch_child(session).await {
                return false;
            }
            if cmd != "requestloksession" {
                forward_to_peer(session, data, binary);
            }
            if cmd == "uno" && tokens.get(1) == Some(&".uno:Save") {
                if let Some(cache) = session.tile_cache() {
                    cache.document_saved();
                }
            }
            true
        }
    }
}

fn send_error(session: &MasterSession, cmd: &str, kind: ErrorKind) {
    session.send_text(ClientError::new(cmd, kind).to_frame());
}

fn handle_version(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    let accepted = tokens
        .get(1)
        .and_then(|v| parse_version(v))
        .is_some_and(matches_server);
    if !accepted {
        send_error(session, "loolclient", ErrorKind::BadVersion);
        return false;
    }
    session.send_text(format!("loolserver {PROTOCOL_VERSION}"));
    true
}

/// `child <jailId> <sessionId> <pid>`: the worker announcing its session.
fn handle_child_hello(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    if session.kind() != SessionKind::ToPrisoner || session.has_peer() {
        send_error(session, "child", ErrorKind::Invalid);
        return false;
    }
    if tokens.len() != 4 {
        send_error(session, "child", ErrorKind::Syntax);
        return false;
    }
    let Ok(pid) = tokens[3].parse::<u32>() else {
        send_error(session, "child", ErrorKind::Syntax);
        return false;
    };

    let child_id = tokens[1];
    session.set_id(tokens[2]);
    session.set_child(child_id, pid);

    let id = session.id();
    info!(session = %session.name(), child = child_id, pid, "child session arrived");
    session.ctx().children.insert(id, session.clone());
    true
}

async fn handle_load(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    if session.doc_url().is_some() {
        send_error(session, "load", ErrorKind::DocAlreadyLoaded);
        return true;
    }
    if tokens.len() < 2 {
        send_error(session, "load", ErrorKind::Syntax);
        return true;
    }

    let opts = parse_doc_options(tokens);
    let Some(url) = opts.url.clone() else {
        send_error(session, "load", ErrorKind::UriInvalid);
        return true;
    };
    if Url::parse(&url).is_err() {
        send_error(session, "load", ErrorKind::UriInvalid);
        return true;
    }

    session.set_doc(url.clone(), opts.options.clone(), opts.part);
    let cache = session.ctx().caches.get_or_create(&url, opts.timestamp.clone());
    session.set_tile_cache(cache);

    // Wait for the child to connect back, link up and dispatch the load.
    dispatch_child(session).await
}

/// The child-acquisition rendezvous.
///
/// Asks the supervisor for a worker and waits for its session to register,
/// re-requesting on every timeout. On success pairs the two sessions and
/// sends the effective `load` down to the worker; on exhaustion the client
/// socket is shut down.
pub async fn dispatch_child(session: &Arc<MasterSession>) -> bool {
    if session.ctx().shutdown.should_stop() {
        return false;
    }

    let id = session.id();
    let doc_url = session.doc_url().unwrap_or_default();
    debug!(session = %session.name(), "waiting for a child session");

    let mut child = None;
    for attempt in 1..=CHILD_ATTEMPTS {
        if let Err(e) = session.ctx().broker.request(&id, &doc_url).await {
            error!(session = %session.name(), error = %e, "broker request failed");
        }
        child = session.ctx().children.wait_claim(&id, CHILD_WAIT).await;
        if child.is_some() {
            break;
        }
        info!(session = %session.name(), attempt, "retrying child acquisition");
    }

    let Some(child) = child else {
        error!(session = %session.name(), "failed to connect to child, shutting down socket");
        session.close();
        return false;
    };

    session.set_peer(&child);
    child.set_peer(session);

    let public_url = doc_url;
    let jailed = Url::parse(&public_url)
        .map(|u| jail::jailed_uri(&u))
        .unwrap_or_else(|_| public_url.clone());

    let mut load = format!("load url={public_url} jail={jailed}");
    if session.load_part() >= 0 {
        load.push_str(&format!(" part={}", session.load_part()));
    }
    if let Some(options) = session.doc_options() {
        load.push_str(&format!(" options={options}"));
    }
    child.send_text(load);
    true
}

fn forward_to_peer(session: &Arc<MasterSession>, data: &[u8], binary: bool) {
    let Some(peer) = session.peer() else {
        // Transient peer loss: drop the frame, the session closes on its own
        // termination path.
        warn!(session = %session.name(), "no peer to forward to");
        return;
    };
    trace!(
        session = %session.name(),
        frame = %abbreviate(data, 60),
        "forward to peer"
    );
    if binary {
        peer.send_binary(data.to_vec());
    } else {
        peer.send_text(String::from_utf8_lossy(data).into_owned());
    }
}

// ---------------------------------------------------------------------------
// Client-side cache-first commands
// ---------------------------------------------------------------------------

async fn get_status(session: &Arc<MasterSession>, data: &[u8], binary: bool) -> bool {
    if let Some(status) = session.tile_cache().and_then(|c| c.get_text_file("status.txt")) {
        session.send_text(status);
        return true;
    }
    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    forward_to_peer(session, data, binary);
    true
}

async fn get_command_values(
    session: &Arc<MasterSession>,
    data: &[u8],
    binary: bool,
    tokens: &[&str],
) -> bool {
    let command = if tokens.len() == 2 {
        token_string(tokens[1], "command")
    } else {
        None
    };
    let Some(command) = command else {
        send_error(session, "commandvalues", ErrorKind::Syntax);
        return true;
    };

    let cached = session
        .tile_cache()
        .and_then(|c| c.get_text_file(&format!("cmdValues{command}.txt")));
    if let Some(values) = cached {
        session.send_text(values);
        return true;
    }
    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    forward_to_peer(session, data, binary);
    true
}

async fn get_part_page_rectangles(session: &Arc<MasterSession>, data: &[u8], binary: bool) -> bool {
    if let Some(rects) = session
        .tile_cache()
        .and_then(|c| c.get_text_file("partpagerectangles.txt"))
    {
        session.send_text(rects);
        return true;
    }
    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    forward_to_peer(session, data, binary);
    true
}

/// A client-issued invalidation: marks editing and drops tiles on the
/// session's current part. Not forwarded.
fn client_invalidate_tiles(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    let parsed = (tokens.len() == 6)
        .then(|| {
            Some((
                token_int(tokens[1], "part")?,
                token_int(tokens[2], "tileposx")?,
                token_int(tokens[3], "tileposy")?,
                token_int(tokens[4], "tilewidth")?,
                token_int(tokens[5], "tileheight")?,
            ))
        })
        .flatten();
    let Some((_, x, y, w, h)) = parsed else {
        send_error(session, "invalidatetiles", ErrorKind::Syntax);
        return true;
    };

    if let Some(cache) = session.tile_cache() {
        cache.set_editing(true);
        cache.invalidate_tiles_rect(session.cur_part(), x as i32, y as i32, w as i32, h as i32);
    }
    true
}

async fn send_font_rendering(
    session: &Arc<MasterSession>,
    data: &[u8],
    binary: bool,
    tokens: &[&str],
) -> bool {
    let font = if tokens.len() >= 2 {
        token_string(tokens[1], "font")
    } else {
        None
    };
    let Some(font) = font else {
        send_error(session, "renderfont", ErrorKind::Syntax);
        return true;
    };

    if let Some(rendering) = session.tile_cache().and_then(|c| c.lookup_rendering(font, "font")) {
        let mut output = format!("renderfont: {}\n", tokens[1..].join(" ")).into_bytes();
        output.extend_from_slice(&rendering);
        session.send_binary(output);
        return true;
    }
    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    forward_to_peer(session, data, binary);
    true
}

/// Parses the 7-tuple of a `tile`/`tile:` line laid out at fixed positions.
fn parse_tile_tokens(tokens: &[&str]) -> Option<TileKey> {
    if tokens.len() < 8 {
        return None;
    }
    Some(TileKey {
        part: token_int(tokens[1], "part")? as i32,
        width: token_int(tokens[2], "width")? as i32,
        height: token_int(tokens[3], "height")? as i32,
        tile_pos_x: token_int(tokens[4], "tileposx")? as i32,
        tile_pos_y: token_int(tokens[5], "tileposy")? as i32,
        tile_width: token_int(tokens[6], "tilewidth")? as i32,
        tile_height: token_int(tokens[7], "tileheight")? as i32,
    })
}

fn tile_key_in_bounds(key: &TileKey) -> bool {
    key.part >= 0
        && key.width > 0
        && key.height > 0
        && key.tile_pos_x >= 0
        && key.tile_pos_y >= 0
        && key.tile_width > 0
        && key.tile_height > 0
}

async fn send_tile(
    session: &Arc<MasterSession>,
    data: &[u8],
    binary: bool,
    tokens: &[&str],
) -> bool {
    let Some(key) = parse_tile_tokens(tokens) else {
        send_error(session, "tile", ErrorKind::Syntax);
        return true;
    };
    if !tile_key_in_bounds(&key) {
        send_error(session, "tile", ErrorKind::Invalid);
        return true;
    }

    if let Some(cached) = session.tile_cache().and_then(|c| c.lookup_tile(&key)) {
        let mut output = format!("tile: {}\n", tokens[1..].join(" ")).into_bytes();
        output.extend_from_slice(&cached);
        session.send_binary(output);
        return true;
    }

    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    forward_to_peer(session, data, binary);
    true
}

async fn send_combined_tiles(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    let parsed = (tokens.len() >= 8)
        .then(|| {
            Some((
                token_int(tokens[1], "part")?,
                token_int(tokens[2], "width")?,
                token_int(tokens[3], "height")?,
                token_string(tokens[4], "tileposx")?,
                token_string(tokens[5], "tileposy")?,
                token_int(tokens[6], "tilewidth")?,
                token_int(tokens[7], "tileheight")?,
            ))
        })
        .flatten();
    let Some((part, width, height, pos_x, pos_y, tile_width, tile_height)) = parsed else {
        send_error(session, "tilecombine", ErrorKind::Syntax);
        return true;
    };

    if part < 0
        || width <= 0
        || height <= 0
        || tile_width <= 0
        || tile_height <= 0
        || pos_x.is_empty()
        || pos_y.is_empty()
    {
        send_error(session, "tilecombine", ErrorKind::Invalid);
        return true;
    }

    let xs: Vec<&str> = pos_x.split(',').filter(|t| !t.is_empty()).collect();
    let ys: Vec<&str> = pos_y.split(',').filter(|t| !t.is_empty()).collect();
    if xs.len() != ys.len() {
        send_error(session, "tilecombine", ErrorKind::Invalid);
        return true;
    }

    let cache = session.tile_cache();
    let mut forward_x: Vec<String> = Vec::new();
    let mut forward_y: Vec<String> = Vec::new();

    for (x_tok, y_tok) in xs.iter().zip(&ys) {
        let (Ok(x), Ok(y)) = (x_tok.trim().parse::<i32>(), y_tok.trim().parse::<i32>()) else {
            send_error(session, "tilecombine", ErrorKind::Syntax);
            return true;
        };
        if x < 0 || y < 0 {
            send_error(session, "tilecombine", ErrorKind::Invalid);
            return true;
        }

        let key = TileKey {
            part: part as i32,
            width: width as i32,
            height: height as i32,
            tile_pos_x: x,
            tile_pos_y: y,
            tile_width: tile_width as i32,
            tile_height: tile_height as i32,
        };

        match cache.as_ref().and_then(|c| c.lookup_tile(&key)) {
            Some(cached) => {
                let header = format!(
                    "tile: part={part} width={width} height={height} tileposx={x} tileposy={y} tilewidth={tile_width} tileheight={tile_height}\n"
                );
                let mut output = header.into_bytes();
                output.extend_from_slice(&cached);
                session.send_binary(output);
            }
            None => {
                forward_x.push(x.to_string());
                forward_y.push(y.to_string());
            }
        }
    }

    // Every position was served from the cache.
    if forward_x.is_empty() {
        return true;
    }

    if !session.has_peer() && !dispatch_child(session).await {
        return false;
    }
    let forward = format!(
        "tilecombine part={part} width={width} height={height} tileposx={} tileposy={} tilewidth={tile_width} tileheight={tile_height}",
        forward_x.join(","),
        forward_y.join(","),
    );
    forward_to_peer(session, forward.as_bytes(), false);
    true
}

fn handle_client_disconnect(session: &Arc<MasterSession>, tokens: &[&str]) -> bool {
    let reason = tokens.get(1).copied().unwrap_or("");
    info!(session = %session.name(), reason, "graceful disconnect");
    if session.has_peer() {
        forward_to_peer(session, format!("disconnect {reason}").as_bytes(), false);
    }
    session.disconnect(reason);
    false
}

// ---------------------------------------------------------------------------
// Worker-side snooping
// ---------------------------------------------------------------------------

/// Snoops a worker response into the peer client's cache, then forwards it.
///
/// `curpart:` and `saveas:` are consumed here and never reach the client.
fn snoop_and_forward(
    session: &Arc<MasterSession>,
    data: &[u8],
    binary: bool,
    line: &str,
    tokens: &[&str],
) -> bool {
    let peer = session.peer();
    let cmd = tokens[0];

    if cmd == "curpart:" && tokens.len() == 2 {
        if let Some(part) = token_int(tokens[1], "part") {
            if let Some(peer) = &peer {
                peer.set_cur_part(part as i32);
            }
            return true;
        }
    }

    if cmd == "saveas:" && tokens.len() == 2 {
        // Tolerate a missing url= token by swallowing the frame.
        if let (Some(url), Some(peer)) = (token_string(tokens[1], "url"), &peer) {
            let rewritten = match session.child_id() {
                Some(child_id) => {
                    jail::rewrite_saveas_url(&session.ctx().child_root, &child_id, url)
                }
                None => url.to_string(),
            };
            info!(session = %session.name(), url = %rewritten, "save-as completed");
            peer.push_save_as(rewritten);
        }
        return true;
    }

    if let Some(cache) = peer.as_ref().and_then(|p| p.tile_cache()) {
        match cmd {
            "tile:" => match parse_tile_tokens(tokens) {
                Some(key) => match split_frame(data).1 {
                    Some(payload) => cache.save_tile(key, Bytes::copy_from_slice(payload)),
                    None => warn!(session = %session.name(), "tile response without payload"),
                },
                None => warn!(session = %session.name(), "malformed tile response"),
            },
            "status:" => {
                cache.save_text_file("status.txt", String::from_utf8_lossy(data).into_owned());
            }
            "commandvalues:" => snoop_command_values(&cache, data),
            "partpagerectangles:" => {
                if tokens.len() > 1 {
                    cache.save_text_file(
                        "partpagerectangles.txt",
                        String::from_utf8_lossy(data).into_owned(),
                    );
                }
            }
            "invalidatecursor:" => cache.set_editing(true),
            "invalidatetiles:" => {
                // The first invalidation is how we learn the document is
                // being edited.
                cache.set_editing(true);
                cache.invalidate_tiles(line);
            }
            "renderfont:" => {
                let font = tokens.get(1).and_then(|t| token_string(t, "font"));
                match (font, split_frame(data).1) {
                    (Some(font), Some(payload)) => {
                        cache.save_rendering(font, "font", Bytes::copy_from_slice(payload));
                    }
                    _ => warn!(session = %session.name(), "malformed renderfont response"),
                }
            }
            _ => {}
        }
    }

    forward_to_peer(session, data, binary);
    true
}

/// Extracts `commandName` from a `commandvalues:` response and caches the
/// few values worth keeping.
fn snoop_command_values(cache: &lool_cache::TileCache, data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    let Some(index) = text.find('{') else {
        return;
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&text[index..]) else {
        debug!("unparseable commandvalues payload");
        return;
    };
    let Some(command_name) = json.get("commandName").and_then(|v| v.as_str()) else {
        return;
    };
    // Only these are stable enough to cache.
    if command_name.contains(".uno:CharFontName") || command_name.contains(".uno:StyleApply") {
        cache.save_text_file(&format!("cmdValues{command_name}.txt"), text.into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerWriter;
    use crate::MasterContext;
    use lool_common::transport::ensure_fifo;
    use lool_common::ShutdownToken;
    use tokio::sync::mpsc;

    struct Harness {
        ctx: Arc<MasterContext>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pipe = dir.path().join("broker.fifo");
            ensure_fifo(&pipe).unwrap();
            let broker = BrokerWriter::open(&pipe).unwrap();
            let ctx = MasterContext::new(broker, dir.path().to_path_buf(), ShutdownToken::new());
            Self { ctx, _dir: dir }
        }

        fn client(&self) -> (Arc<MasterSession>, mpsc::UnboundedReceiver<crate::session::OutFrame>) {
            MasterSession::new("0001", SessionKind::ToClient, self.ctx.clone())
        }

        fn prisoner(&self) -> (Arc<MasterSession>, mpsc::UnboundedReceiver<crate::session::OutFrame>) {
            MasterSession::new("0001", SessionKind::ToPrisoner, self.ctx.clone())
        }

        /// A client session that already completed a `load`, with its cache.
        fn loaded_client(
            &self,
        ) -> (
            Arc<MasterSession>,
            mpsc::UnboundedReceiver<crate::session::OutFrame>,
            Arc<lool_cache::TileCache>,
        ) {
            let (session, rx) = self.client();
            let url = "file:///tmp/hello.odt";
            session.set_doc(url.to_string(), None, -1);
            let cache = self.ctx.caches.get_or_create(url, None);
            session.set_tile_cache(cache.clone());
            (session, rx, cache)
        }
    }

    async fn expect_text(rx: &mut mpsc::UnboundedReceiver<crate::session::OutFrame>) -> String {
        match rx.recv().await.expect("expected a frame") {
            crate::session::OutFrame::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn expect_binary(rx: &mut mpsc::UnboundedReceiver<crate::session::OutFrame>) -> Vec<u8> {
        match rx.recv().await.expect("expected a frame") {
            crate::session::OutFrame::Binary(data) => data,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    const TILE_LINE: &str =
        "tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";

    fn tile_key() -> TileKey {
        TileKey {
            part: 0,
            width: 256,
            height: 256,
            tile_pos_x: 0,
            tile_pos_y: 0,
            tile_width: 3840,
            tile_height: 3840,
        }
    }

    #[tokio::test]
    async fn test_version_handshake_match() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(handle_input(&session, b"loolclient 0.1.0", false).await);
        assert_eq!(expect_text(&mut rx).await, format!("loolserver {PROTOCOL_VERSION}"));
    }

    #[tokio::test]
    async fn test_version_handshake_mismatch_closes() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(!handle_input(&session, b"loolclient 9.9.9", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=loolclient kind=badversion");
    }

    #[tokio::test]
    async fn test_version_handshake_garbage_closes() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(!handle_input(&session, b"loolclient banana", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=loolclient kind=badversion");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(handle_input(&session, b"dropdatabase now", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=dropdatabase kind=unknown");
    }

    #[tokio::test]
    async fn test_command_before_load() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(handle_input(&session, b"status", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=status kind=nodocloaded");
    }

    #[tokio::test]
    async fn test_second_load_keeps_state_intact() {
        let h = Harness::new();
        let (session, mut rx, _cache) = h.loaded_client();
        let url_before = session.doc_url();

        assert!(handle_input(&session, b"load url=file:///tmp/other.odt", false).await);

        assert_eq!(expect_text(&mut rx).await, "error: cmd=load kind=docalreadyloaded");
        assert_eq!(session.doc_url(), url_before);
    }

    #[tokio::test]
    async fn test_load_with_bad_uri() {
        let h = Harness::new();
        let (session, mut rx) = h.client();
        assert!(handle_input(&session, b"load url=::not-a-url::", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=load kind=uriinvalid");
        assert_eq!(session.doc_url(), None);
    }

    #[tokio::test]
    async fn test_tile_syntax_and_bounds_validation() {
        let h = Harness::new();
        let (session, mut rx, _cache) = h.loaded_client();

        assert!(handle_input(&session, b"tile part=0 width=256", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=tile kind=syntax");

        let negative =
            b"tile part=-1 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
        assert!(handle_input(&session, negative, false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=tile kind=invalid");

        let zero_width =
            b"tile part=0 width=0 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";
        assert!(handle_input(&session, zero_width, false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=tile kind=invalid");
    }

    #[tokio::test]
    async fn test_tile_served_from_cache() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        cache.save_tile(tile_key(), Bytes::from_static(b"\x89PNGDATA"));

        assert!(handle_input(&session, TILE_LINE.as_bytes(), false).await);

        let frame = expect_binary(&mut rx).await;
        let expected_header =
            "tile: part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840\n";
        assert!(frame.starts_with(expected_header.as_bytes()));
        assert!(frame.ends_with(b"\x89PNGDATA"));
    }

    #[tokio::test]
    async fn test_status_served_from_cache() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        cache.save_text_file("status.txt", "status: type=text parts=2 current=0");

        assert!(handle_input(&session, b"status", false).await);
        assert_eq!(expect_text(&mut rx).await, "status: type=text parts=2 current=0");
    }

    #[tokio::test]
    async fn test_commandvalues_served_from_cache() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        cache.save_text_file(
            "cmdValues.uno:CharFontName.txt",
            "commandvalues: {\"commandName\":\".uno:CharFontName\"}",
        );

        assert!(
            handle_input(&session, b"commandvalues command=.uno:CharFontName", false).await
        );
        assert_eq!(
            expect_text(&mut rx).await,
            "commandvalues: {\"commandName\":\".uno:CharFontName\"}"
        );
    }

    #[tokio::test]
    async fn test_commandvalues_syntax_error() {
        let h = Harness::new();
        let (session, mut rx, _cache) = h.loaded_client();
        assert!(handle_input(&session, b"commandvalues", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=commandvalues kind=syntax");
    }

    #[tokio::test]
    async fn test_renderfont_served_from_cache() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        cache.save_rendering("Liberation", "font", Bytes::from_static(b"FONTIMG"));

        assert!(handle_input(&session, b"renderfont font=Liberation", false).await);

        let frame = expect_binary(&mut rx).await;
        assert!(frame.starts_with(b"renderfont: font=Liberation\n"));
        assert!(frame.ends_with(b"FONTIMG"));
    }

    #[tokio::test]
    async fn test_tilecombine_all_cached_does_not_forward() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        let (worker, mut worker_rx) = h.prisoner();
        session.set_peer(&worker);
        worker.set_peer(&session);

        cache.save_tile(tile_key(), Bytes::from_static(b"T0"));
        let mut second = tile_key();
        second.tile_pos_x = 3840;
        cache.save_tile(second, Bytes::from_static(b"T1"));

        let combine = b"tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0,0 tilewidth=3840 tileheight=3840";
        assert!(handle_input(&session, combine, false).await);

        assert!(expect_binary(&mut rx).await.ends_with(b"T0"));
        assert!(expect_binary(&mut rx).await.ends_with(b"T1"));
        assert!(
            worker_rx.try_recv().is_err(),
            "fully cached tilecombine must not reach the worker"
        );
    }

    #[tokio::test]
    async fn test_tilecombine_forwards_only_misses() {
        let h = Harness::new();
        let (session, mut rx, cache) = h.loaded_client();
        let (worker, mut worker_rx) = h.prisoner();
        session.set_peer(&worker);
        worker.set_peer(&session);

        cache.save_tile(tile_key(), Bytes::from_static(b"T0"));

        let combine = b"tilecombine part=0 width=256 height=256 tileposx=0,3840,7680 tileposy=0,0,0 tilewidth=3840 tileheight=3840";
        assert!(handle_input(&session, combine, false).await);

        assert!(expect_binary(&mut rx).await.ends_with(b"T0"));
        let forwarded = match worker_rx.recv().await.unwrap() {
            crate::session::OutFrame::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        assert_eq!(
            forwarded,
            "tilecombine part=0 width=256 height=256 tileposx=3840,7680 tileposy=0,0 tilewidth=3840 tileheight=3840"
        );
    }

    #[tokio::test]
    async fn test_tilecombine_unequal_lists_invalid() {
        let h = Harness::new();
        let (session, mut rx, _cache) = h.loaded_client();
        let combine = b"tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840";
        assert!(handle_input(&session, combine, false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=tilecombine kind=invalid");
    }

    #[tokio::test]
    async fn test_child_hello_registers_session() {
        let h = Harness::new();
        let (worker, _rx) = h.prisoner();

        assert!(handle_input(&worker, b"child jail-7 00ab 4242", false).await);

        assert_eq!(worker.id(), "00ab");
        assert_eq!(worker.child_id().as_deref(), Some("jail-7"));
        assert_eq!(worker.child_pid(), 4242);
        assert!(h.ctx.children.remove("00ab").is_some());
    }

    #[tokio::test]
    async fn test_child_hello_on_client_session_is_invalid() {
        let h = Harness::new();
        let (client, mut rx) = h.client();
        assert!(!handle_input(&client, b"child jail-7 00ab 4242", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=child kind=invalid");
    }

    #[tokio::test]
    async fn test_child_hello_syntax() {
        let h = Harness::new();
        let (worker, mut rx) = h.prisoner();
        assert!(!handle_input(&worker, b"child jail-7", false).await);
        assert_eq!(expect_text(&mut rx).await, "error: cmd=child kind=syntax");
    }

    /// Builds a paired (client, prisoner) with the prisoner past its hello.
    async fn paired(
        h: &Harness,
    ) -> (
        Arc<MasterSession>,
        mpsc::UnboundedReceiver<crate::session::OutFrame>,
        Arc<lool_cache::TileCache>,
        Arc<MasterSession>,
    ) {
        let (client, client_rx, cache) = h.loaded_client();
        let (worker, _worker_rx) = h.prisoner();
        assert!(handle_input(&worker, b"child jail-7 0001 4242", false).await);
        h.ctx.children.remove("0001");
        client.set_peer(&worker);
        worker.set_peer(&client);
        (client, client_rx, cache, worker)
    }

    #[tokio::test]
    async fn test_snoop_tile_populates_cache_and_forwards() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;

        let response = b"tile: part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840\n\x89PNGDATA";
        assert!(handle_input(&worker, response, true).await);

        assert_eq!(
            cache.lookup_tile(&tile_key()),
            Some(Bytes::from_static(b"\x89PNGDATA"))
        );
        assert!(expect_binary(&mut client_rx).await.ends_with(b"\x89PNGDATA"));
    }

    #[tokio::test]
    async fn test_snoop_status_populates_cache() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;

        let status = b"status: type=text parts=2 current=0 width=12000 height=9000";
        assert!(handle_input(&worker, status, false).await);

        assert_eq!(
            cache.get_text_file("status.txt").as_deref(),
            Some("status: type=text parts=2 current=0 width=12000 height=9000")
        );
        assert_eq!(expect_text(&mut client_rx).await.as_bytes(), status);
    }

    #[tokio::test]
    async fn test_snoop_commandvalues_caches_allowed_commands_only() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;

        let fonts = br#"commandvalues: {"commandName":".uno:CharFontName","commandValues":["A"]}"#;
        assert!(handle_input(&worker, fonts, false).await);
        assert!(cache.get_text_file("cmdValues.uno:CharFontName.txt").is_some());
        let _ = expect_text(&mut client_rx).await;

        let other = br#"commandvalues: {"commandName":".uno:Something","commandValues":[]}"#;
        assert!(handle_input(&worker, other, false).await);
        assert!(cache.get_text_file("cmdValues.uno:Something.txt").is_none());
        let _ = expect_text(&mut client_rx).await;
    }

    #[tokio::test]
    async fn test_snoop_curpart_is_consumed() {
        let h = Harness::new();
        let (client, mut client_rx, _cache, worker) = paired(&h).await;

        assert!(handle_input(&worker, b"curpart: part=3", false).await);

        assert_eq!(client.cur_part(), 3);
        assert!(client_rx.try_recv().is_err(), "curpart: must not be forwarded");
    }

    #[tokio::test]
    async fn test_snoop_saveas_is_rewritten_and_consumed() {
        let h = Harness::new();
        let (client, mut client_rx, _cache, worker) = paired(&h).await;

        assert!(handle_input(&worker, b"saveas: url=file:///tmp/out.pdf", false).await);

        let expected = format!(
            "file://{}/jail-7/tmp/out.pdf",
            h.ctx.child_root.display()
        );
        assert_eq!(client.next_save_as().await.as_deref(), Some(expected.as_str()));
        assert!(client_rx.try_recv().is_err(), "saveas: must not be forwarded");
    }

    #[tokio::test]
    async fn test_snoop_invalidatetiles_drops_tiles_and_forwards() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;
        cache.save_tile(tile_key(), Bytes::from_static(b"T"));

        let invalidate = b"invalidatetiles: part=0 x=0 y=0 width=5000 height=5000";
        assert!(handle_input(&worker, invalidate, false).await);

        assert!(cache.is_editing());
        assert_eq!(cache.lookup_tile(&tile_key()), None);
        assert_eq!(expect_text(&mut client_rx).await.as_bytes(), invalidate);
    }

    #[tokio::test]
    async fn test_snoop_invalidatecursor_marks_editing() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;

        assert!(handle_input(&worker, b"invalidatecursor: 0,0,100,100", false).await);
        assert!(cache.is_editing());
        let _ = expect_text(&mut client_rx).await;
    }

    #[tokio::test]
    async fn test_snoop_renderfont_populates_cache() {
        let h = Harness::new();
        let (_client, mut client_rx, cache, worker) = paired(&h).await;

        assert!(handle_input(&worker, b"renderfont: font=Liberation\nFONTIMG", true).await);

        assert_eq!(
            cache.lookup_rendering("Liberation", "font"),
            Some(Bytes::from_static(b"FONTIMG"))
        );
        assert!(expect_binary(&mut client_rx).await.ends_with(b"FONTIMG"));
    }

    #[tokio::test]
    async fn test_uno_save_marks_cache_saved() {
        let h = Harness::new();
        let (client, _client_rx, cache, _worker) = paired(&h).await;

        cache.set_editing(true);
        cache.save_text_file("status.txt", "status: parts=1");
        cache.save_text_file("cmdValues.uno:StyleApply.txt", "{}");
        assert!(!cache.is_saved());

        assert!(handle_input(&client, b"uno .uno:Save", false).await);

        assert!(cache.is_saved());
        assert!(cache.get_text_file("cmdValues.uno:StyleApply.txt").is_none());
        assert!(cache.get_text_file("status.txt").is_some(), "status survives a save");
    }

    #[tokio::test]
    async fn test_client_invalidatetiles_uses_current_part() {
        let h = Harness::new();
        let (client, _client_rx, cache, _worker) = paired(&h).await;
        cache.save_tile(tile_key(), Bytes::from_static(b"T"));
        let mut other_part = tile_key();
        other_part.part = 2;
        cache.save_tile(other_part, Bytes::from_static(b"U"));
        client.set_cur_part(2);

        let invalidate =
            b"invalidatetiles part=0 tileposx=0 tileposy=0 tilewidth=5000 tileheight=5000";
        assert!(handle_input(&client, invalidate, false).await);

        assert!(cache.lookup_tile(&tile_key()).is_some(), "part 0 untouched");
        assert_eq!(cache.lookup_tile(&other_part), None, "current part dropped");
        assert!(cache.is_editing());
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_pair() {
        let h = Harness::new();
        let (client, _client_rx, _cache, worker) = paired(&h).await;

        assert!(!handle_input(&client, b"disconnect bye", false).await);

        assert!(client.is_disconnected());
        assert!(worker.is_disconnected());
    }
}
