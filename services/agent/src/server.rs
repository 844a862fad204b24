//! WebSocket control-channel server and session state machine.
//!
//! One authenticated peer at a time.  Each connection gets a fresh writer
//! queue drained by a dedicated writer task; every sending helper enqueues
//! and only the writer touches the sink.  A `None` in the queue is the
//! writer's shutdown sentinel.
//!
//! # Session states
//! `Unauth → AwaitPair → Auth → Closed`.  A second inbound connection
//! replaces the existing session: the old connection is signalled closed and
//! its pumps are torn down before it unwinds.

use crate::bridge::FrontendBridge;
use crate::config::AgentConfig;
use crate::console_log::ConsoleLogCollector;
use crate::game_log::GameLogTailer;
use crate::pairing::PairingAuthority;
use crate::settings::{Settings, SharedSettings};
use crate::steam;
use crate::telemetry::TelemetryPump;
use crate::uploads::{TrackedShortcut, UploadSession};
use crate::{artwork::ArtworkData, handlers};
use cd_protocol::{Envelope, MAX_FRAME_BYTES, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tracing::{debug, error, info, warn};

const WRITER_QUEUE_DEPTH: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Writer discipline
// ---------------------------------------------------------------------------

/// Sending half of a connection.  Cheap to clone; everything funnels into
/// the per-connection writer queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Option<Message>>,
}

impl Outbound {
    /// Create a writer queue pair.  The receiver side is drained by the
    /// writer task (or by a test harness standing in for it).
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Option<Message>>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub async fn send_envelope(&self, env: &Envelope) {
        match serde_json::to_string(env) {
            Ok(json) => {
                debug!(kind = %env.kind, id = %env.id, "frame queued");
                if self.tx.send(Some(Message::Text(json.into()))).await.is_err() {
                    debug!("writer queue closed; frame dropped");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize frame"),
        }
    }

    /// Response correlated to a request id.
    pub async fn send_reply<T: Serialize>(&self, id: &str, kind: &str, payload: &T) {
        self.send_envelope(&Envelope::reply(id, kind, payload)).await;
    }

    pub async fn send_reply_empty(&self, id: &str, kind: &str) {
        self.send_envelope(&Envelope::reply_empty(id, kind)).await;
    }

    /// Agent-originated event with a fresh id.
    pub async fn send_event<T: Serialize>(&self, kind: &str, payload: &T) {
        self.send_envelope(&Envelope::event(kind, payload)).await;
    }

    pub async fn send_error(&self, id: &str, code: i32, message: impl Into<String>) {
        self.send_envelope(&Envelope::error(id, code, message)).await;
    }

    pub async fn send_raw(&self, msg: Message) {
        let _ = self.tx.send(Some(msg)).await;
    }

    /// Enqueue the writer shutdown sentinel.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(None).await;
    }
}

async fn run_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Option<Message>>)
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Some(msg) => {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "write failed");
                    break;
                }
            }
            None => break,
        }
    }
    let _ = sink.close().await;
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauth,
    AwaitPair,
    Auth,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectedHub {
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: String,
}

/// Whether the reader loop keeps going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Close,
}

/// Commands delivered into a live connection from the admin surface.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    SetTelemetryEnabled(bool),
    SetTelemetryInterval(u64),
    SetConsoleLogEnabled(bool),
    StartGameLog(u32),
    StopGameLog,
    Close,
}

/// Per-connection mutable state, owned by the connection task.
pub struct ConnState {
    pub conn_id: u64,
    pub session: SessionState,
    /// Hub id presented in the handshake; set before authorization.
    pub hub_id: Option<String>,
    /// The authorized peer, if any.
    pub hub: Option<ConnectedHub>,
    pub uploads: HashMap<String, UploadSession>,
    pub pending_artwork: BTreeMap<String, ArtworkData>,
    pub telemetry: TelemetryPump,
    pub console_log: ConsoleLogCollector,
    pub game_log: GameLogTailer,
    pub outbound: Outbound,
}

impl ConnState {
    fn new(conn_id: u64, outbound: Outbound) -> Self {
        Self {
            conn_id,
            session: SessionState::Unauth,
            hub_id: None,
            hub: None,
            uploads: HashMap::new(),
            pending_artwork: BTreeMap::new(),
            telemetry: TelemetryPump::new(),
            console_log: ConsoleLogCollector::new(),
            game_log: GameLogTailer::new(),
            outbound,
        }
    }
}

/// Handle onto the live connection, held in [`AgentState::active`].
pub struct SessionHandle {
    pub conn_id: u64,
    pub hub: Option<ConnectedHub>,
    pub outbound: Outbound,
    cmd_tx: mpsc::Sender<SessionCommand>,
    close_tx: watch::Sender<bool>,
}

impl SessionHandle {
    fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Agent state
// ---------------------------------------------------------------------------

/// Shared, connection-independent agent state.
pub struct AgentState {
    pub config: AgentConfig,
    pub version: String,
    pub platform: String,
    pub agent_id: String,
    pub settings: SharedSettings,
    pub bridge: FrontendBridge,
    pub pairing: Mutex<PairingAuthority>,
    active: Mutex<Option<SessionHandle>>,
}

/// Runtime status snapshot for the UI surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub hub_name: Option<String>,
    pub agent_name: String,
    pub install_path: String,
    pub platform: String,
    pub version: String,
    pub telemetry_enabled: bool,
    pub telemetry_interval: u64,
    pub console_log_enabled: bool,
}

impl AgentState {
    pub async fn new(config: AgentConfig, settings: Settings) -> Arc<Self> {
        let settings: SharedSettings = Arc::new(Mutex::new(settings));
        let bridge = FrontendBridge::new(settings.clone());
        let pairing = Mutex::new(PairingAuthority::new(settings.clone()));
        let platform = steam::detect_platform();

        let agent_id = {
            let s = settings.lock().await;
            match s.get::<String>("agent_id").ok().flatten() {
                Some(id) => id,
                None => {
                    let id = derive_agent_id(&config.agent.name, &platform);
                    if let Err(e) = s.set("agent_id", &id) {
                        error!(error = %e, "failed to persist agent id");
                    }
                    id
                }
            }
        };

        Arc::new(Self {
            config,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            platform,
            agent_id,
            settings,
            bridge,
            pairing,
            active: Mutex::new(None),
        })
    }

    pub async fn agent_name(&self) -> String {
        let s = self.settings.lock().await;
        s.get_or("agent_name", self.config.agent.name.clone())
    }

    pub async fn install_path(&self) -> String {
        let s = self.settings.lock().await;
        s.get_or("install_path", self.config.agent.install_path.clone())
    }

    pub async fn accept_connections(&self) -> bool {
        let s = self.settings.lock().await;
        s.get_or("accept_connections", self.config.agent.accept_connections)
    }

    pub async fn telemetry_enabled(&self) -> bool {
        self.settings.lock().await.get_or("telemetry_enabled", false)
    }

    pub async fn telemetry_interval(&self) -> u64 {
        self.settings.lock().await.get_or("telemetry_interval", 2)
    }

    pub async fn console_log_enabled(&self) -> bool {
        self.settings.lock().await.get_or("console_log_enabled", false)
    }

    pub async fn tracked_shortcuts(&self) -> Vec<TrackedShortcut> {
        self.settings.lock().await.get_or("tracked_shortcuts", Vec::new())
    }

    pub async fn set_tracked_shortcuts(&self, tracked: &[TrackedShortcut]) {
        let s = self.settings.lock().await;
        if let Err(e) = s.set("tracked_shortcuts", &tracked) {
            error!(error = %e, "failed to persist tracked shortcuts");
        }
    }

    // -----------------------------------------------------------------------
    // Admin surface (UI-facing, no network exposure)
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> StatusReport {
        let hub_name = self
            .active
            .lock()
            .await
            .as_ref()
            .and_then(|h| h.hub.as_ref())
            .map(|hub| hub.name.clone());
        StatusReport {
            connected: hub_name.is_some(),
            hub_name,
            agent_name: self.agent_name().await,
            install_path: self.install_path().await,
            platform: self.platform.clone(),
            version: self.version.clone(),
            telemetry_enabled: self.telemetry_enabled().await,
            telemetry_interval: self.telemetry_interval().await,
            console_log_enabled: self.console_log_enabled().await,
        }
    }

    pub async fn set_agent_name(&self, name: &str) {
        let s = self.settings.lock().await;
        if let Err(e) = s.set("agent_name", name) {
            error!(error = %e, "failed to persist agent name");
        }
    }

    pub async fn set_install_path(&self, path: &str) {
        {
            let s = self.settings.lock().await;
            if let Err(e) = s.set("install_path", path) {
                error!(error = %e, "failed to persist install path");
            }
        }
        let expanded = steam::expand_path(path);
        if let Err(e) = tokio::fs::create_dir_all(&expanded).await {
            error!(path = %expanded.display(), error = %e, "failed to create install root");
        }
    }

    pub async fn set_telemetry_enabled(&self, enabled: bool) {
        {
            let s = self.settings.lock().await;
            if let Err(e) = s.set("telemetry_enabled", &enabled) {
                error!(error = %e, "failed to persist telemetry toggle");
            }
        }
        self.send_command(SessionCommand::SetTelemetryEnabled(enabled))
            .await;
    }

    pub async fn set_telemetry_interval(&self, seconds: u64) {
        let seconds = seconds.clamp(1, 10);
        {
            let s = self.settings.lock().await;
            if let Err(e) = s.set("telemetry_interval", &seconds) {
                error!(error = %e, "failed to persist telemetry interval");
            }
        }
        self.send_command(SessionCommand::SetTelemetryInterval(seconds))
            .await;
    }

    pub async fn set_console_log_enabled(&self, enabled: bool) {
        {
            let s = self.settings.lock().await;
            if let Err(e) = s.set("console_log_enabled", &enabled) {
                error!(error = %e, "failed to persist console log toggle");
            }
        }
        // Tell the UI surface to install or remove its console hook.
        self.bridge
            .notify("console_log_toggle", serde_json::json!({ "enabled": enabled }))
            .await;
        self.send_command(SessionCommand::SetConsoleLogEnabled(enabled))
            .await;
    }

    /// Called by the UI surface when a tracked game starts or stops.
    pub async fn game_lifecycle_event(&self, app_id: u32, running: bool) {
        if running {
            self.send_command(SessionCommand::StartGameLog(app_id)).await;
        } else {
            self.send_command(SessionCommand::StopGameLog).await;
        }
    }

    /// Back-fill the app id the client assigned to a freshly created
    /// shortcut.
    pub async fn register_shortcut(&self, game_name: &str, app_id: u32) {
        let mut tracked = self.tracked_shortcuts().await;
        for sc in &mut tracked {
            if sc.app_id == 0 && (sc.game_name == game_name || sc.name == game_name) {
                sc.app_id = app_id;
                info!(game_name, app_id, "shortcut registered");
                break;
            }
        }
        self.set_tracked_shortcuts(&tracked).await;
    }

    /// Revoke a hub's authorization; closes the connection when it is the
    /// active peer.
    pub async fn revoke_hub(&self, hub_id: &str) -> bool {
        let revoked = self.pairing.lock().await.revoke(hub_id).await;
        if revoked {
            let active = self.active.lock().await;
            if let Some(handle) = active.as_ref() {
                if handle.hub.as_ref().is_some_and(|h| h.id == hub_id) {
                    handle.close();
                }
            }
        }
        revoked
    }

    /// (locked, remaining seconds) of the pairing lockout.
    pub async fn pairing_lockout(&self) -> (bool, u64) {
        let pairing = self.pairing.lock().await;
        (pairing.is_locked_out(), pairing.lockout_remaining())
    }

    pub async fn reset_pairing_lockout(&self) {
        self.pairing.lock().await.reset_lockout();
    }

    pub async fn close_connection(&self) {
        if let Some(handle) = self.active.lock().await.as_ref() {
            handle.close();
        }
    }

    async fn send_command(&self, cmd: SessionCommand) {
        let active = self.active.lock().await;
        if let Some(handle) = active.as_ref() {
            if handle.cmd_tx.send(cmd).await.is_err() {
                debug!("session command dropped; connection gone");
            }
        }
    }

    /// Record the authorized hub on the active handle.
    pub(crate) async fn mark_authorized(&self, conn_id: u64, hub: ConnectedHub) {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.as_mut() {
            if handle.conn_id == conn_id {
                handle.hub = Some(hub);
            }
        }
    }

    async fn install_session(&self, handle: SessionHandle) {
        let mut active = self.active.lock().await;
        if let Some(old) = active.take() {
            info!(old_conn = old.conn_id, "replacing existing control session");
            old.close();
            old.outbound.shutdown().await;
        }
        *active = Some(handle);
    }

    async fn clear_session(&self, conn_id: u64) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|h| h.conn_id == conn_id) {
            *active = None;
        }
    }
}

fn derive_agent_id(name: &str, platform: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{name}-{platform}-{}",
        chrono::Utc::now().timestamp_millis()
    ));
    hex::encode(hasher.finalize())[..8].to_owned()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct AgentServer {
    listener: TcpListener,
    port: u16,
    state: Arc<AgentState>,
}

impl AgentServer {
    /// Bind the control channel on the configured address (port 0 lets the
    /// OS pick).
    pub async fn bind(state: Arc<AgentState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(state.config.server.bind.as_str()).await?;
        let port = listener.local_addr()?.port();
        info!(port, "control channel listening");
        Ok(Self {
            listener,
            port,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept loop; runs until the listener fails.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "new connection");
                    tokio::spawn(handle_connection(self.state.clone(), stream));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);
    config
}

async fn handle_connection(state: Arc<AgentState>, stream: TcpStream) {
    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

    let (outbound, out_rx) = Outbound::channel(WRITER_QUEUE_DEPTH);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(8);
    let (close_tx, mut close_rx) = watch::channel(false);

    let (sink, mut ws_stream) = ws.split();
    let writer = tokio::spawn(run_writer(sink, out_rx));

    state
        .install_session(SessionHandle {
            conn_id,
            hub: None,
            outbound: outbound.clone(),
            cmd_tx,
            close_tx,
        })
        .await;

    let mut conn = ConnState::new(conn_id, outbound.clone());

    loop {
        let action = tokio::select! {
            biased;
            changed = close_rx.changed() => {
                // A dropped sender means the handle is gone; treat as close.
                if changed.is_err() || *close_rx.borrow() {
                    LoopAction::Close
                } else {
                    LoopAction::Continue
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut conn, &state, cmd).await,
                None => LoopAction::Close,
            },
            msg = ws_stream.next() => match msg {
                None => LoopAction::Close,
                Some(Err(e)) => {
                    debug!(error = %e, "connection error");
                    LoopAction::Close
                }
                Some(Ok(Message::Text(text))) => dispatch_text(&mut conn, &state, &text).await,
                Some(Ok(Message::Binary(data))) => {
                    handlers::upload::handle_binary(&mut conn, &state, &data).await;
                    LoopAction::Continue
                }
                Some(Ok(Message::Ping(data))) => {
                    outbound.send_raw(Message::Pong(data)).await;
                    LoopAction::Continue
                }
                Some(Ok(Message::Close(_))) => LoopAction::Close,
                Some(Ok(_)) => LoopAction::Continue,
            },
        };
        if action == LoopAction::Close {
            break;
        }
    }

    teardown(&mut conn, &state).await;
    conn.session = SessionState::Closed;
    outbound.shutdown().await;
    let _ = writer.await;
    state.clear_session(conn_id).await;
    info!(conn_id, "connection closed");
}

/// Route one text frame through the session state machine.
async fn dispatch_text(conn: &mut ConnState, state: &Arc<AgentState>, raw: &str) -> LoopAction {
    let env: Envelope = match serde_json::from_str(raw) {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, "failed to parse text frame");
            return LoopAction::Continue;
        }
    };
    debug!(kind = %env.kind, id = %env.id, "frame received");

    match env.kind.as_str() {
        "hub_connected" => return handlers::auth::hub_connected(conn, state, &env).await,
        "pair_confirm" if conn.session == SessionState::AwaitPair => {
            handlers::auth::pair_confirm(conn, state, &env).await;
            return LoopAction::Continue;
        }
        _ => {}
    }

    if conn.session != SessionState::Auth {
        conn.outbound
            .send_error(&env.id, cd_protocol::error_codes::UNAUTHORIZED, "Not authorized")
            .await;
        return LoopAction::Continue;
    }

    match env.kind.as_str() {
        "ping" => conn.outbound.send_reply_empty(&env.id, "pong").await,
        "get_info" => handlers::info::get_info(conn, state, &env).await,
        "get_config" => handlers::info::get_config(conn, state, &env).await,
        "get_steam_users" => handlers::info::get_steam_users(conn, &env).await,
        "init_upload" => handlers::upload::init_upload(conn, state, &env).await,
        "upload_chunk" => handlers::upload::upload_chunk(conn, state, &env).await,
        "complete_upload" => handlers::upload::complete_upload(conn, state, &env).await,
        "cancel_upload" => handlers::upload::cancel_upload(conn, &env).await,
        "list_shortcuts" => handlers::game::list_shortcuts(conn, state, &env).await,
        "delete_game" => handlers::game::delete_game(conn, state, &env).await,
        "restart_steam" => handlers::game::restart_steam(conn, &env).await,
        "set_console_log_filter" => {
            handlers::console_log::set_console_log_filter(conn, &env).await;
        }
        "set_console_log_enabled" => {
            handlers::console_log::set_console_log_enabled(conn, state, &env).await;
        }
        other => warn!(kind = other, "unknown message type"),
    }
    LoopAction::Continue
}

async fn handle_command(
    conn: &mut ConnState,
    state: &Arc<AgentState>,
    cmd: SessionCommand,
) -> LoopAction {
    match cmd {
        SessionCommand::SetTelemetryEnabled(enabled) => {
            if enabled && conn.session == SessionState::Auth {
                let interval = state.telemetry_interval().await;
                conn.telemetry.start(interval, conn.outbound.clone());
            } else {
                conn.telemetry.stop().await;
            }
            handlers::telemetry::send_telemetry_status(conn, state).await;
        }
        SessionCommand::SetTelemetryInterval(seconds) => {
            conn.telemetry.update_interval(seconds).await;
            handlers::telemetry::send_telemetry_status(conn, state).await;
        }
        SessionCommand::SetConsoleLogEnabled(enabled) => {
            if enabled && conn.session == SessionState::Auth {
                conn.console_log.start(conn.outbound.clone());
            } else {
                conn.console_log.stop().await;
            }
            handlers::console_log::send_console_log_status(conn, state).await;
        }
        SessionCommand::StartGameLog(app_id) => {
            if conn.session == SessionState::Auth {
                conn.game_log.start(app_id, conn.outbound.clone()).await;
            }
        }
        SessionCommand::StopGameLog => conn.game_log.stop().await,
        SessionCommand::Close => return LoopAction::Close,
    }
    LoopAction::Continue
}

/// Disconnect cleanup: stop pumps, drop orphaned uploads, clear pending
/// artwork, notify the frontend.
async fn teardown(conn: &mut ConnState, state: &Arc<AgentState>) {
    conn.telemetry.stop().await;
    conn.console_log.stop().await;
    conn.game_log.stop().await;
    handlers::upload::cleanup_orphaned_uploads(conn).await;
    conn.pending_artwork.clear();

    if conn.hub.is_some() {
        state
            .bridge
            .notify("console_log_toggle", serde_json::json!({ "enabled": false }))
            .await;
        state
            .bridge
            .notify("hub_disconnected", serde_json::json!({}))
            .await;
        conn.hub = None;
    }
}

/// Shared by the handshake handlers: flip to `Auth` and record the peer.
pub(crate) async fn authorize(conn: &mut ConnState, state: &Arc<AgentState>, hub: ConnectedHub) {
    conn.session = SessionState::Auth;
    conn.hub_id = Some(hub.id.clone());
    conn.hub = Some(hub.clone());
    state.mark_authorized(conn.conn_id, hub).await;
}

/// The `agent_status` payload for a successful handshake.
pub(crate) async fn agent_status(state: &Arc<AgentState>) -> cd_protocol::AgentStatus {
    cd_protocol::AgentStatus {
        name: state.agent_name().await,
        version: state.version.clone(),
        platform: "linux".to_owned(),
        accept_connections: state.accept_connections().await,
        telemetry_enabled: state.telemetry_enabled().await,
        telemetry_interval: state.telemetry_interval().await,
        console_log_enabled: state.console_log_enabled().await,
        protocol_version: PROTOCOL_VERSION,
    }
}
