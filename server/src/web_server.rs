//! Connection Handler (C5): the Axum WebSocket route and its per-channel
//! state machine (§4.5), plus the companion admin HTTP surface (§4.12) and
//! the boolean auth gate (§6, presented here as a bearer-token check since
//! the real login/cookie layer is an external collaborator).

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tty_core::config::{self, DaemonConfig};
use tty_core::error::close_code;
use tty_core::protocol::{ClientControlMessage, OutboundMessage, ServerControlMessage};
use tty_core::registry::SessionRegistry;
use tty_core::session::{self, SessionHandle, SessionId};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<DaemonConfig>,
}

/// Build the router: the message channel endpoint plus the companion admin
/// surface named in spec §6. No static asset serving — that's an excluded
/// external collaborator (spec §1).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tty/ws", get(ws_handler))
        .route("/restart", post(restart_handler))
        .route("/sessions", get(sessions_handler))
        .route("/config", get(config_handler))
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct WsAuthQuery {
    token: Option<String>,
}

fn is_authenticated(headers: &HeaderMap, query: &WsAuthQuery, secret: &str) -> bool {
    if let Some(token) = &query.token {
        if token == secret {
            return true;
        }
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v == secret)
        .unwrap_or(false)
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_authenticated(&headers, &query, state.config.auth_secret.as_deref().unwrap_or_default()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state.registry))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsSource = SplitStream<WebSocket>;

/// Drive one channel end to end: handshake/reconnect, then proxy frames
/// until the channel closes. The session itself is never touched after
/// this function returns — that's the handler's half of the "no callbacks
/// after close" guarantee in spec §5.
async fn handle_connection(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some((handle, generation, outbox_rx)) = await_handshake(&mut ws_tx, &mut ws_rx, &registry).await else {
        return;
    };

    proxy_frames(ws_tx, ws_rx, handle, generation, outbox_rx).await;
}

/// `awaiting_handshake` state (§4.5): accept `handshake` or `reconnect`
/// within `HANDSHAKE_TIMEOUT`, binding to a (possibly new) session on
/// success. Returns `None` once a terminal close has already been sent.
async fn await_handshake(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    registry: &Arc<SessionRegistry>,
) -> Option<(SessionHandle, u64, mpsc::UnboundedReceiver<OutboundMessage>)> {
    let deadline = tokio::time::sleep(config::HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = &mut deadline => {
                close_with(ws_tx, close_code::HANDSHAKE_TIMEOUT, "handshake timeout").await;
                return None;
            }

            msg = ws_rx.next() => {
                let msg = msg?.ok()?;
                match msg {
                    Message::Text(text) => match ClientControlMessage::decode(&text) {
                        Ok(ClientControlMessage::Handshake { columns, rows }) => {
                            let (cols, rows) = session::clamp_dimensions(columns, rows);
                            match registry.create(cols, rows) {
                                Ok(handle) => {
                                    let (outbox, outbox_rx) = mpsc::unbounded_channel();
                                    let Some(generation) = handle.attach(outbox, cols, rows).await else {
                                        close_with(ws_tx, close_code::INTERNAL_ERROR, "session actor gone").await;
                                        return None;
                                    };
                                    debug!(session_id = %handle.id, "handshake complete, new session");
                                    return Some((handle, generation, outbox_rx));
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to spawn session");
                                    close_with(ws_tx, close_code::INTERNAL_ERROR, "failed to start shell").await;
                                    return None;
                                }
                            }
                        }
                        Ok(ClientControlMessage::Reconnect { session_id, columns, rows }) => {
                            let (cols, rows) = session::clamp_dimensions(columns, rows);
                            let Some(id) = SessionId::parse(&session_id) else {
                                send_error(ws_tx, "invalid session id").await;
                                continue;
                            };
                            let Some(handle) = registry.get(&id) else {
                                send_error(ws_tx, "session not found").await;
                                continue;
                            };
                            let (outbox, outbox_rx) = mpsc::unbounded_channel();
                            let Some(generation) = handle.attach(outbox, cols, rows).await else {
                                registry.remove(&id);
                                send_error(ws_tx, "session no longer exists").await;
                                continue;
                            };
                            debug!(session_id = %handle.id, "reattached");
                            return Some((handle, generation, outbox_rx));
                        }
                        Ok(ClientControlMessage::Pong { .. }) => continue,
                        Err(_) => {
                            close_with(ws_tx, close_code::PROTOCOL_ERROR, "malformed control message").await;
                            return None;
                        }
                    },
                    Message::Binary(_) => {
                        // Resolved open question (SPEC_FULL §9): a binary
                        // frame before handshake completion closes the
                        // channel rather than being silently dropped.
                        close_with(ws_tx, close_code::PROTOCOL_ERROR, "binary frame before handshake").await;
                        return None;
                    }
                    Message::Close(_) => return None,
                    Message::Ping(_) | Message::Pong(_) => continue,
                }
            }
        }
    }
}

/// `bound` state (§4.5): proxy binary INPUT/RESIZE and `pong` inbound,
/// forward the session's outbound frames to the socket, until either side
/// closes. On channel close, detach (never destroy) the session.
async fn proxy_frames(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    handle: SessionHandle,
    generation: u64,
    mut outbox_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    loop {
        tokio::select! {
            biased;

            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(OutboundMessage::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundMessage::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundMessage::Close { code, reason }) => {
                        close_with(&mut ws_tx, code, &reason).await;
                        break;
                    }
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else {
                    handle.detach(generation).await;
                    break;
                };
                match msg {
                    Message::Binary(bytes) => handle_binary_frame(&handle, generation, &bytes).await,
                    Message::Text(text) => {
                        if let Ok(ClientControlMessage::Pong { .. }) = ClientControlMessage::decode(&text) {
                            handle.pong(generation).await;
                        }
                        // Any other/malformed text while bound is dropped
                        // per the codec rule (unknown types aren't a
                        // protocol error mid-session; only the handshake
                        // phase enforces strict decoding).
                    }
                    Message::Close(_) => {
                        handle.detach(generation).await;
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

async fn handle_binary_frame(handle: &SessionHandle, generation: u64, bytes: &[u8]) {
    let Ok((cmd, payload)) = tty_core::protocol::decode_client_frame(bytes) else {
        return;
    };
    match cmd {
        Some(tty_core::protocol::ClientBinaryCommand::Input) => {
            handle.input(generation, payload.to_vec()).await;
        }
        Some(tty_core::protocol::ClientBinaryCommand::Resize) => {
            if let Ok(resize) = tty_core::protocol::decode_resize_payload(payload) {
                let (cols, rows) = session::clamp_dimensions(resize.columns, resize.rows);
                handle.resize(generation, cols, rows).await;
            }
        }
        None => {}
    }
}

async fn close_with(ws_tx: &mut WsSink, code: u16, reason: &str) {
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}

async fn send_error(ws_tx: &mut WsSink, message: &str) {
    let _ = ws_tx
        .send(Message::Text(ServerControlMessage::Error { message: message.to_string() }.encode().into()))
        .await;
}

async fn restart_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.destroy_all().await;
    info!("restart requested, all sessions destroyed");
    Json(serde_json::json!({"ok": true}))
}

#[derive(serde::Serialize)]
struct ChildProcess {
    pid: u32,
    command: String,
}

#[derive(serde::Serialize)]
struct SessionsResponse {
    ppid: u32,
    children: Vec<ChildProcess>,
    sessions: Vec<tty_core::session::SessionSummary>,
}

async fn sessions_handler(State(state): State<AppState>) -> Json<SessionsResponse> {
    let sessions = state.registry.summaries().await;
    Json(SessionsResponse {
        ppid: std::process::id(),
        children: list_child_processes(std::process::id()),
        sessions,
    })
}

/// Best-effort listing of this process's direct children via `/proc`.
/// Diagnostic only; an empty list on non-Linux or read failure is fine.
#[cfg(target_os = "linux")]
fn list_child_processes(ppid: u32) -> Vec<ChildProcess> {
    let mut children = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else { return children };
    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else { continue };
        let stat_path = entry.path().join("stat");
        let Ok(stat) = std::fs::read_to_string(&stat_path) else { continue };
        // Fields: pid (comm) state ppid ...; comm can contain spaces/parens,
        // so split on the last ')' before reading the numeric fields.
        let Some(close_paren) = stat.rfind(')') else { continue };
        let comm_start = stat.find('(').map(|i| i + 1).unwrap_or(0);
        let command = stat[comm_start..close_paren].to_string();
        let rest: Vec<&str> = stat[close_paren + 1..].split_whitespace().collect();
        let Some(parent_pid) = rest.first().and_then(|s| s.parse::<u32>().ok()) else { continue };
        if parent_pid == ppid {
            children.push(ChildProcess { pid, command });
        }
    }
    children
}

#[cfg(not(target_os = "linux"))]
fn list_child_processes(_ppid: u32) -> Vec<ChildProcess> {
    Vec::new()
}

#[derive(serde::Serialize)]
struct ConfigResponse {
    hscroll: bool,
    #[serde(rename = "appTitle")]
    app_title: String,
    #[serde(rename = "shellCommand")]
    shell_command: Vec<String>,
}

async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        hscroll: state.config.hscroll,
        app_title: state.config.app_title.clone(),
        shell_command: state.config.shell_argv.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tty_core::config::DaemonConfig;

    fn test_state() -> AppState {
        let registry = Arc::new(SessionRegistry::new(
            vec!["sh".to_string(), "-c".to_string(), "cat".to_string()],
            4096,
        ));
        let mut config = DaemonConfig::default();
        config.auth_secret = Some("s3cret".to_string());
        AppState { registry, config: Arc::new(config) }
    }

    #[test]
    fn auth_accepts_matching_query_token() {
        let headers = HeaderMap::new();
        let query = WsAuthQuery { token: Some("s3cret".to_string()) };
        assert!(is_authenticated(&headers, &query, "s3cret"));
    }

    #[test]
    fn auth_accepts_matching_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let query = WsAuthQuery { token: None };
        assert!(is_authenticated(&headers, &query, "s3cret"));
    }

    #[test]
    fn auth_rejects_wrong_or_missing_credentials() {
        let headers = HeaderMap::new();
        let query = WsAuthQuery { token: None };
        assert!(!is_authenticated(&headers, &query, "s3cret"));
        let query_wrong = WsAuthQuery { token: Some("nope".to_string()) };
        assert!(!is_authenticated(&headers, &query_wrong, "s3cret"));
    }

    #[tokio::test]
    async fn restart_handler_destroys_all_sessions() {
        let state = test_state();
        state.registry.create(80, 24).unwrap();
        assert_eq!(state.registry.len(), 1);
        let Json(body) = restart_handler(State(state.clone())).await;
        assert_eq!(body["ok"], serde_json::json!(true));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn sessions_handler_reports_created_session() {
        let state = test_state();
        state.registry.create(80, 24).unwrap();
        let Json(body) = sessions_handler(State(state.clone())).await;
        assert_eq!(body.sessions.len(), 1);
        assert_eq!(body.ppid, std::process::id());
        state.registry.destroy_all().await;
    }

    #[tokio::test]
    async fn config_handler_echoes_static_configuration() {
        let state = test_state();
        let Json(body) = config_handler(State(state)).await;
        assert_eq!(body.app_title, "Terminal");
        assert!(!body.shell_command.is_empty());
    }
}
