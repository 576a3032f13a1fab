//! The Client Driver (C6): owns the connection lifecycle, issues the
//! correct first control message on each open, answers heartbeats, and
//! reconnects per the close-code policy in spec §4.6 while a fresh
//! connection attempt is guarded by an epoch counter against overlapping
//! attempts (spec §4.6 "Epoch guard").

use crate::backoff;
use crate::renderer::Renderer;
use crate::store::SessionIdStore;
use crate::transport::{Transport, TransportEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tty_core::error::close_code;
use tty_core::protocol::{
    encode_client_frame, encode_resize_payload, ClientBinaryCommand, ClientControlMessage, ServerControlMessage,
};

/// User-visible connection state, per spec §7 ("disconnected, connecting,
/// connected, error").
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Observable events the driver emits, for an embedding app to react to
/// (e.g. update a status indicator) without polling `state()`.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    StateChanged(ConnectionState),
    TitleChanged(String),
}

/// What to do with the session id and whether to reconnect, decided purely
/// from a close code — isolated so it's testable without a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePolicy {
    pub keep_session_id: bool,
    pub reconnect: bool,
    pub immediate: bool,
}

/// Decide what a given close code means for reconnect policy, per spec
/// §4.6. `1000` never reconnects; `RESTART` reconnects immediately with a
/// reset attempt counter; every other non-normal code keeps the session id
/// and reconnects with backoff.
pub fn close_policy(code: u16) -> ClosePolicy {
    match code {
        close_code::NORMAL => ClosePolicy { keep_session_id: false, reconnect: false, immediate: false },
        close_code::RESTART => ClosePolicy { keep_session_id: false, reconnect: true, immediate: true },
        _ => ClosePolicy { keep_session_id: true, reconnect: true, immediate: false },
    }
}

/// Events the renderer fires back into the driver (spec §4.6 steps 5-6:
/// "on renderer input event", "on renderer resize event"). The renderer is
/// an external capability that only writes bytes and reports dimensions
/// (see `Renderer`); it hands its input/resize events to the embedding app,
/// which forwards them here via a `DriverHandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendererEvent {
    Input(Vec<u8>),
    Resize { columns: u16, rows: u16 },
}

/// A cheap, cloneable handle an embedding app uses to forward renderer
/// input/resize events into a running `Driver::run` loop without holding a
/// borrow of the driver itself.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<RendererEvent>,
}

impl DriverHandle {
    pub fn send_input(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(RendererEvent::Input(bytes));
    }

    pub fn send_resize(&self, columns: u16, rows: u16) {
        let _ = self.tx.send(RendererEvent::Resize { columns, rows });
    }
}

/// Drives one reconnecting session over a caller-supplied connector. `C` is
/// a closure producing a fresh `Transport` for each attempt (a live
/// WebSocket dial in production, a pre-wired `StubTransport` in tests).
pub struct Driver<T: Transport, R: Renderer, S: SessionIdStore> {
    connector: Box<dyn FnMut() -> T + Send>,
    renderer: R,
    store: S,
    epoch: Arc<AtomicU64>,
    attempt: u32,
    state: ConnectionState,
    events: Vec<DriverEvent>,
    renderer_tx: mpsc::UnboundedSender<RendererEvent>,
    renderer_rx: mpsc::UnboundedReceiver<RendererEvent>,
}

impl<T: Transport, R: Renderer, S: SessionIdStore> Driver<T, R, S> {
    pub fn new(connector: impl FnMut() -> T + Send + 'static, renderer: R, store: S) -> Self {
        let (renderer_tx, renderer_rx) = mpsc::unbounded_channel();
        Self {
            connector: Box::new(connector),
            renderer,
            store,
            epoch: Arc::new(AtomicU64::new(0)),
            attempt: 0,
            state: ConnectionState::Disconnected,
            events: Vec::new(),
            renderer_tx,
            renderer_rx,
        }
    }

    /// A handle the embedding app wires to the renderer's input/resize
    /// callbacks, so those events reach the active transport from outside
    /// the `run` loop.
    pub fn handle(&self) -> DriverHandle {
        DriverHandle { tx: self.renderer_tx.clone() }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session_id(&self) -> Option<String> {
        self.store.load()
    }

    /// Events emitted so far, for assertions in tests; an embedding app
    /// would instead subscribe to these as they're produced.
    pub fn drain_events(&mut self) -> Vec<DriverEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state.clone();
        self.events.push(DriverEvent::StateChanged(state));
    }

    /// Run the reconnect loop until the transport is exhausted or a normal
    /// close ends the session for good. Each iteration bumps the epoch
    /// before connecting; any in-flight work tagged with a stale epoch is
    /// ignored once a newer attempt has started (`epoch_guard`).
    pub async fn run(&mut self) {
        loop {
            let my_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(ConnectionState::Connecting);

            let mut transport = (self.connector)();
            if !self.epoch_guard(my_epoch) {
                return;
            }

            let had_session_id = self.store.load();
            if let Some(id) = &had_session_id {
                self.renderer.reset();
                let msg = ClientControlMessage::Reconnect {
                    session_id: id.clone(),
                    columns: self.renderer.cols() as i64,
                    rows: self.renderer.rows() as i64,
                };
                let _ = transport.send_text(&serde_json::to_string(&msg).unwrap_or_default()).await;
            } else {
                let msg = ClientControlMessage::Handshake {
                    columns: self.renderer.cols() as i64,
                    rows: self.renderer.rows() as i64,
                };
                let _ = transport.send_text(&serde_json::to_string(&msg).unwrap_or_default()).await;
            }

            let outcome = self.read_loop(&mut transport, my_epoch).await;
            if !self.epoch_guard(my_epoch) {
                return;
            }

            match outcome {
                LoopOutcome::NormalClose => {
                    self.store.clear();
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                LoopOutcome::TransportGone => {
                    // A dropped connection without an explicit 1000 close is
                    // not a clean end per spec §4.6/§7: keep the session id
                    // and reconnect with backoff, same as any other
                    // non-normal close code, so a network blip reattaches to
                    // the still-alive server session instead of abandoning it.
                    let delay = backoff::delay(self.attempt);
                    self.attempt += 1;
                    tokio::time::sleep(delay).await;
                    if !self.epoch_guard(my_epoch) {
                        return;
                    }
                    continue;
                }
                LoopOutcome::Reconnect { immediate, keep_session_id } => {
                    if !keep_session_id {
                        self.store.clear();
                    }
                    if immediate {
                        self.renderer.reset();
                        self.attempt = 0;
                    } else {
                        let delay = backoff::delay(self.attempt);
                        self.attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    if !self.epoch_guard(my_epoch) {
                        return;
                    }
                    continue;
                }
            }
        }
    }

    /// True if `my_epoch` is still the current epoch; false means a newer
    /// `run`/reconnect attempt has superseded this one and it must stop
    /// touching shared state.
    fn epoch_guard(&self, my_epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == my_epoch
    }

    /// Bump the epoch, invalidating any in-flight attempt (used by an
    /// embedding app to force an immediate reconnect, e.g. a manual retry
    /// button).
    pub fn force_reconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    async fn read_loop(&mut self, transport: &mut T, my_epoch: u64) -> LoopOutcome {
        loop {
            if !self.epoch_guard(my_epoch) {
                return LoopOutcome::TransportGone;
            }
            tokio::select! {
                biased;

                event = transport.recv() => {
                    let Some(event) = event else {
                        return LoopOutcome::TransportGone;
                    };
                    match event {
                        TransportEvent::Text(text) => self.handle_control(&text, transport).await,
                        TransportEvent::Binary(bytes) => self.handle_binary(&bytes),
                        TransportEvent::Close { code, .. } => {
                            let policy = close_policy(code);
                            if code == close_code::NORMAL {
                                return LoopOutcome::NormalClose;
                            }
                            if policy.reconnect {
                                return LoopOutcome::Reconnect { immediate: policy.immediate, keep_session_id: policy.keep_session_id };
                            }
                            return LoopOutcome::NormalClose;
                        }
                    }
                }

                renderer_event = self.renderer_rx.recv() => {
                    match renderer_event {
                        Some(RendererEvent::Input(bytes)) => {
                            let frame = encode_client_frame(ClientBinaryCommand::Input, &bytes);
                            let _ = transport.send_binary(frame).await;
                        }
                        Some(RendererEvent::Resize { columns, rows }) => {
                            let payload = encode_resize_payload(columns as i64, rows as i64);
                            let frame = encode_client_frame(ClientBinaryCommand::Resize, &payload);
                            let _ = transport.send_binary(frame).await;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn handle_control(&mut self, text: &str, transport: &mut T) {
        let Ok(msg) = serde_json::from_str::<ServerControlMessage>(text) else { return };
        match msg {
            ServerControlMessage::SessionInfo { session_id } => {
                self.store.save(&session_id);
                self.attempt = 0;
                self.renderer.focus();
                self.set_state(ConnectionState::Connected);
            }
            ServerControlMessage::Ping { timestamp } => {
                let pong = ClientControlMessage::Pong { timestamp };
                let _ = transport.send_text(&serde_json::to_string(&pong).unwrap_or_default()).await;
            }
            ServerControlMessage::SessionEnded { .. } => {
                self.store.clear();
            }
            ServerControlMessage::Error { message } => {
                self.store.clear();
                self.renderer.reset();
                self.set_state(ConnectionState::Error(message));
                let msg = ClientControlMessage::Handshake {
                    columns: self.renderer.cols() as i64,
                    rows: self.renderer.rows() as i64,
                };
                let _ = transport.send_text(&serde_json::to_string(&msg).unwrap_or_default()).await;
            }
        }
    }

    fn handle_binary(&mut self, bytes: &[u8]) {
        let Some((&tag, payload)) = bytes.split_first() else { return };
        match tag {
            b'0' => self.renderer.write_bytes(payload),
            b'1' => {
                let title = String::from_utf8_lossy(payload).into_owned();
                self.events.push(DriverEvent::TitleChanged(title.clone()));
                self.renderer.set_title(&title);
            }
            _ => {}
        }
    }
}

enum LoopOutcome {
    NormalClose,
    TransportGone,
    Reconnect { immediate: bool, keep_session_id: bool },
}
