//! Control connection.
//!
//! States:
//!
//! ```text
//! Disconnected -> Connecting -> LoggingIn -> Ready <-> Busy
//!       ^______________________________________|
//! ```
//!
//! Commands are serialized by `&mut self`. Every command first takes the
//! connection away from keep-alive and arms keep-alive again when it is done.
//! A network failure while a command is outstanding closes the socket; the
//! next operation reconnects, paying from its [`RetryBudget`].

use crate::ftp::cache::CacheKey;
use crate::ftp::connection;
use crate::ftp::context::FtpContext;
use crate::ftp::datacon::{
    DataConnection, DataConnectionError, DataConnectionParams, DataCounters, DataDirection,
    FinishWait,
};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::keepalive::{KeepAlive, KeepAliveMode, KeepAliveSession, KeepAliveTiming};
use crate::ftp::log_book::LogBook;
use crate::ftp::parser;
use crate::ftp::paths::{self, ServerPathType};
use crate::ftp::protocol;
use crate::ftp::proxy::{ProxyScript, ProxyServerConfig, ProxyType, ScriptParams};
use crate::ftp::socket::{
    self, CommandUserInterface, Dispatcher, EventSocket, NoUserInterface, SocketEvent, SocketUid,
    WaitOutcome,
};
use crate::ftp::tls;
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use rustls::ClientConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// QUIT is not worth waiting long for.
const QUIT_TIMEOUT: Duration = Duration::from_secs(3);

// ─── Event pump helpers (shared with keep-alive) ─────────────────────

/// Why a wait on the control socket returned.
pub(crate) enum Wake {
    Reply(FtpReply),
    Data(SocketEvent),
    Closed(Option<String>),
    Timeout,
    Cancelled { reply: Option<FtpReply> },
}

/// Next reply, data-connection event, close, timeout or cancellation.
/// Buffered replies are returned before anything else.
pub(crate) async fn wait_for_wake(
    socket: &EventSocket,
    rx: &mut UnboundedReceiver<SocketEvent>,
    deadline: Instant,
    token: &CancellationToken,
) -> Wake {
    loop {
        if let Some(r) = socket.take_reply() {
            return Wake::Reply(r);
        }
        if !socket.is_connected() {
            return Wake::Closed(socket.close_error());
        }
        let left = deadline.saturating_duration_since(Instant::now());
        match socket::wait_for_event_or_cancel(rx, left, token).await {
            WaitOutcome::Event(ev) => match ev {
                SocketEvent::DataConnectionConnected | SocketEvent::DataConnectionFinished { .. } => {
                    return Wake::Data(ev)
                }
                SocketEvent::Closed { error } if error.as_deref() == Some(socket::ROUTE_CLOSED) => {
                    return Wake::Closed(error)
                }
                _ => continue,
            },
            WaitOutcome::Timeout => {
                return match socket.take_reply() {
                    Some(r) => Wake::Reply(r),
                    None => Wake::Timeout,
                }
            }
            WaitOutcome::Cancelled { .. } => {
                return Wake::Cancelled {
                    reply: socket.take_reply(),
                }
            }
        }
    }
}

fn closed_error(err: Option<String>) -> FtpError {
    match err {
        Some(e) => FtpError::disconnected(format!("Connection closed: {}", e)),
        None => FtpError::disconnected("Connection closed by server"),
    }
}

fn cancelled_error(reply: Option<&FtpReply>) -> FtpError {
    match reply {
        Some(r) => FtpError::cancelled(format!("Cancelled by user (server replied: {})", r.text())),
        None => FtpError::cancelled("Cancelled by user"),
    }
}

/// Read until a final (non-1xx) reply.
pub(crate) async fn read_final_reply(
    socket: &EventSocket,
    rx: &mut UnboundedReceiver<SocketEvent>,
    limit: Duration,
    token: &CancellationToken,
    log: &LogBook,
) -> FtpResult<FtpReply> {
    let mut deadline = Instant::now() + limit;
    loop {
        match wait_for_wake(socket, rx, deadline, token).await {
            Wake::Reply(r) => {
                log.add_reply(&r);
                if r.code.is_none() || r.is_preliminary() {
                    deadline = Instant::now() + limit;
                    continue;
                }
                return Ok(r);
            }
            Wake::Data(_) => continue,
            Wake::Closed(e) => return Err(closed_error(e)),
            Wake::Timeout => {
                socket.close();
                return Err(FtpError::timeout("No reply from server within the timeout"));
            }
            Wake::Cancelled { reply } => {
                if let Some(r) = &reply {
                    log.add_reply(r);
                }
                socket.close();
                return Err(cancelled_error(reply.as_ref()));
            }
        }
    }
}

/// Send one command and read its final reply.
pub(crate) async fn exchange(
    socket: &EventSocket,
    rx: &mut UnboundedReceiver<SocketEvent>,
    cmd: &str,
    limit: Duration,
    token: &CancellationToken,
    log: &LogBook,
) -> FtpResult<FtpReply> {
    socket.send_line(cmd)?;
    log.add_command(cmd);
    read_final_reply(socket, rx, limit, token, log).await
}

/// Everything needed to open a data connection for this control connection.
#[derive(Clone)]
pub struct DataSetup {
    pub passive: bool,
    pub server_host: String,
    pub server_port: u16,
    /// Replaces an unroutable address in a PASV reply.
    pub pasv_fallback_ip: Option<IpAddr>,
    /// Local address announced with PORT.
    pub bind_ip: IpAddr,
    pub tunnel: Option<ProxyServerConfig>,
    pub tls: Option<(Arc<ClientConfig>, String)>,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

/// PASV or PORT, then a data connection ready to be activated.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn prepare_data_connection(
    socket: &EventSocket,
    rx: &mut UnboundedReceiver<SocketEvent>,
    setup: &DataSetup,
    direction: DataDirection,
    session_id: u64,
    owner: SocketUid,
    dispatcher: &Dispatcher,
    parent: &CancellationToken,
    log: &LogBook,
) -> FtpResult<DataConnection> {
    let params = DataConnectionParams {
        direction,
        session_id,
        dispatcher: dispatcher.clone(),
        owner,
        server_host: setup.server_host.clone(),
        server_port: setup.server_port,
        tunnel: setup.tunnel.clone(),
        connect_timeout: setup.connect_timeout,
        idle_timeout: setup.reply_timeout,
    };
    let mut dc = DataConnection::new(params, parent);
    if let Some((config, name)) = &setup.tls {
        dc.set_tls(Arc::clone(config), name.clone());
    }

    if setup.passive {
        let reply = exchange(socket, rx, "PASV", setup.reply_timeout, parent, log).await?;
        if !reply.is_completion() {
            return Err(FtpError::data_channel(format!("PASV refused: {}", reply.text()))
                .with_code(reply.code.unwrap_or(0)));
        }
        let v4 = reply
            .lines
            .iter()
            .rev()
            .find_map(|l| protocol::parse_pasv_reply(l))
            .ok_or_else(|| {
                FtpError::protocol_error(format!("Cannot parse PASV reply: {}", reply.text()))
            })?;
        let mut addr = SocketAddr::V4(v4);
        if addr.ip().is_unspecified() {
            if let Some(ip) = setup.pasv_fallback_ip {
                addr.set_ip(ip);
            }
        }
        dc.set_passive(addr);
    } else {
        let listen = dc.set_active(setup.bind_ip).await?;
        let SocketAddr::V4(v4) = listen else {
            return Err(FtpError::data_channel(format!(
                "PORT needs an IPv4 address, have {}",
                listen
            )));
        };
        let cmd = protocol::format_port_command(v4);
        let reply = exchange(socket, rx, &cmd, setup.reply_timeout, parent, log).await?;
        if !reply.is_completion() {
            return Err(FtpError::data_channel(format!("PORT refused: {}", reply.text()))
                .with_code(reply.code.unwrap_or(0)));
        }
    }
    Ok(dc)
}

/// What came back from a command that used a data connection.
#[derive(Debug)]
pub(crate) struct DataTransferOutcome {
    /// Final reply; `None` when the control connection failed first.
    pub reply: Option<FtpReply>,
    pub control_error: Option<FtpError>,
    pub data: Vec<u8>,
    pub data_error: DataConnectionError,
    pub decompress_failed: bool,
    pub counters: DataCounters,
}

/// Activate `dc`, send `cmd` and reconcile the control reply with the data
/// connection. Only user cancellation is returned as `Err`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_data_command(
    socket: &EventSocket,
    rx: &mut UnboundedReceiver<SocketEvent>,
    dc: &mut DataConnection,
    cmd: &str,
    session_id: u64,
    limit: Duration,
    token: &CancellationToken,
    log: &LogBook,
) -> FtpResult<DataTransferOutcome> {
    dc.activate_connection()?;
    socket.send_line(cmd)?;
    log.add_command(cmd);

    let mut reply: Option<FtpReply> = None;
    let mut control_error: Option<FtpError> = None;
    let mut deadline = Instant::now() + limit;
    while reply.is_none() && control_error.is_none() {
        match wait_for_wake(socket, rx, deadline, token).await {
            Wake::Reply(r) => {
                log.add_reply(&r);
                deadline = Instant::now() + limit;
                if r.code.is_some() && !r.is_preliminary() {
                    reply = Some(r);
                }
            }
            Wake::Data(ev) => {
                if classify_data_event(session_id, &ev) == EventDisposition::Stale {
                    log::debug!("Ignoring {:?} from an earlier session", ev);
                }
                deadline = Instant::now() + limit;
            }
            Wake::Closed(e) => control_error = Some(closed_error(e)),
            Wake::Timeout => {
                // the final reply of a long transfer comes after the data
                let active = !dc.is_finished()
                    && dc
                        .counters()
                        .last_activity
                        .is_some_and(|t| t.elapsed() < limit);
                if active {
                    deadline = Instant::now() + limit;
                } else {
                    socket.close();
                    control_error = Some(FtpError::timeout("No reply from server within the timeout"));
                }
            }
            Wake::Cancelled { reply } => {
                if let Some(r) = &reply {
                    log.add_reply(r);
                }
                dc.cancel_connection_and_flushing();
                socket.close();
                return Err(cancelled_error(reply.as_ref()));
            }
        }
    }

    let mut never_opened = false;
    if reply.as_ref().is_some_and(FtpReply::is_completion) {
        loop {
            match dc.wait_for_finish(limit, token).await {
                FinishWait::Finished => break,
                FinishWait::Cancelled => {
                    dc.cancel_connection_and_flushing();
                    socket.close();
                    return Err(cancelled_error(None));
                }
                FinishWait::Timeout => {
                    let (transferring, finished) = dc.is_transfering();
                    if finished {
                        break;
                    }
                    let fresh = dc
                        .counters()
                        .last_activity
                        .is_some_and(|t| t.elapsed() < limit);
                    if transferring && fresh {
                        continue;
                    }
                    never_opened = !transferring;
                    dc.cancel_connection_and_flushing();
                    dc.wait_for_finish(limit, &CancellationToken::new()).await;
                    break;
                }
            }
        }
    } else {
        dc.cancel_connection_and_flushing();
        dc.wait_for_finish(limit, &CancellationToken::new()).await;
    }

    let mut data_error = dc.get_error();
    if never_opened && data_error.network.is_none() {
        data_error.network = Some("Server did not open the data connection".to_string());
    }
    let (data, decompress_failed) = dc.give_data().unwrap_or_default();
    Ok(DataTransferOutcome {
        reply,
        control_error,
        data,
        data_error,
        decompress_failed,
        counters: dc.counters(),
    })
}

// ─── Public types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    LoggingIn,
    Ready,
    Busy,
}

/// What to do with a data-connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// From a data connection of an earlier session; ignore it.
    Stale,
    /// Belongs to the current session.
    Handled,
    NotDataEvent,
}

pub fn classify_data_event(current_session: u64, ev: &SocketEvent) -> EventDisposition {
    match ev {
        SocketEvent::DataConnectionFinished { session_id } if *session_id != current_session => {
            EventDisposition::Stale
        }
        SocketEvent::DataConnectionFinished { .. } | SocketEvent::DataConnectionConnected => {
            EventDisposition::Handled
        }
        _ => EventDisposition::NotDataEvent,
    }
}

/// Reconnect attempts shared by one logical operation.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    remaining: u32,
    delay: Duration,
}

impl RetryBudget {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            remaining: attempts,
            delay,
        }
    }

    /// Use one attempt; `false` when none are left.
    pub fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Sleep the delay between attempts.
    pub async fn wait(&self, cancel: &CancellationToken) -> FtpResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(()),
            _ = cancel.cancelled() => Err(FtpError::cancelled("Cancelled while waiting to reconnect")),
        }
    }
}

enum Attempt<T> {
    Done(T),
    Retry { error: FtpError, data: Vec<u8> },
}

fn retry_or_fail<T>(e: FtpError) -> FtpResult<Attempt<T>> {
    if e.is_retryable() {
        Ok(Attempt::Retry {
            error: e,
            data: Vec::new(),
        })
    } else {
        Err(e)
    }
}

// ─── Control connection ──────────────────────────────────────────────

pub struct ControlConnection {
    ctx: Arc<FtpContext>,
    config: FtpConnectionConfig,
    uid: SocketUid,
    events: UnboundedReceiver<SocketEvent>,
    socket: Option<Arc<EventSocket>>,
    state: ConnectionState,
    session_id: u64,
    /// Cancels the data connections of the current session.
    session_abort: CancellationToken,
    welcome: String,
    syst: String,
    features: ServerFeatures,
    path_type: ServerPathType,
    working_path: Option<String>,
    negotiated_type: Option<TransferType>,
    mode_z_on: bool,
    keep_alive: KeepAlive,
    log: Arc<LogBook>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    ui: Arc<dyn CommandUserInterface>,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("path_type", &self.path_type)
            .field("working_path", &self.working_path)
            .finish()
    }
}

impl ControlConnection {
    pub fn new(ctx: Arc<FtpContext>, config: FtpConnectionConfig) -> Self {
        let (uid, events) = ctx.dispatcher.register();
        let keep_alive = KeepAlive::new(
            ctx.dispatcher.clone(),
            KeepAliveTiming::from_config(&config.keep_alive),
        );
        Self {
            ctx,
            config,
            uid,
            events,
            socket: None,
            state: ConnectionState::Disconnected,
            session_id: 0,
            session_abort: CancellationToken::new(),
            welcome: String::new(),
            syst: String::new(),
            features: ServerFeatures::default(),
            path_type: ServerPathType::Unknown,
            working_path: None,
            negotiated_type: None,
            mode_z_on: false,
            keep_alive,
            log: Arc::new(LogBook::default()),
            local_addr: None,
            peer_addr: None,
            ui: Arc::new(NoUserInterface),
        }
    }

    /// User interface used for reconnects inside operations.
    pub fn set_user_interface(&mut self, ui: Arc<dyn CommandUserInterface>) {
        self.ui = ui;
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<FtpContext> {
        &self.ctx
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub fn system(&self) -> &str {
        &self.syst
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn path_type(&self) -> ServerPathType {
        self.path_type
    }

    pub fn log(&self) -> &Arc<LogBook> {
        &self.log
    }

    pub fn keep_alive_mode(&self) -> KeepAliveMode {
        self.keep_alive.mode()
    }

    pub fn keep_alive_sent(&self) -> u64 {
        self.keep_alive.sent_count()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Working directory from the last PWD; `None` before login.
    pub fn get_working_path(&self) -> Option<&str> {
        self.working_path.as_deref()
    }

    /// `//user@host:port` prefix of this connection's paths.
    pub fn user_part(&self) -> paths::UserPart {
        let user = normalize_user(&self.config.user);
        paths::UserPart {
            user: (!user.is_empty()).then(|| user.to_string()),
            password: None,
            host: self.config.host.clone(),
            port: (self.config.port != 21).then_some(self.config.port),
            path: None,
        }
    }

    fn socket(&self) -> FtpResult<Arc<EventSocket>> {
        match &self.socket {
            Some(s) if s.is_connected() => Ok(Arc::clone(s)),
            _ => Err(FtpError::disconnected("Not connected").with_session(self.session_id)),
        }
    }

    fn close_socket(&mut self) {
        self.keep_alive.disarm();
        if let Some(s) = self.socket.take() {
            s.close();
        }
        self.negotiated_type = None;
        self.mode_z_on = false;
        self.state = ConnectionState::Disconnected;
    }

    /// Record a failure; transport failures leave the connection closed.
    fn fail(&mut self, e: FtpError) -> FtpError {
        self.close_on_error(&e);
        e.with_session(self.session_id)
    }

    /// Tear the session down when `e` leaves it unusable.
    fn close_on_error(&mut self, e: &FtpError) {
        if matches!(e.kind, FtpErrorKind::Cancelled) || e.is_retryable() || !self.is_connected() {
            if let Some(s) = &self.socket {
                s.close();
            }
            self.state = ConnectionState::Disconnected;
            self.negotiated_type = None;
            self.mode_z_on = false;
            self.keep_alive.disarm();
        }
    }

    fn drain_stale_events(&mut self, socket: &EventSocket) {
        while let Ok(ev) = self.events.try_recv() {
            if classify_data_event(self.session_id, &ev) == EventDisposition::Stale {
                log::debug!("Dropping stale {:?}", ev);
            }
        }
        let stray = socket.take_bytes();
        if !stray.is_empty() {
            log::debug!("Discarding {} unexpected bytes from the server", stray.len());
        }
    }

    async fn command(&mut self, cmd: &str, cancel: &CancellationToken) -> FtpResult<FtpReply> {
        let socket = self.socket()?;
        let timeout = self.config.reply_timeout();
        let result = exchange(&socket, &mut self.events, cmd, timeout, cancel, &self.log).await;
        result.map_err(|e| self.fail(e))
    }

    /// Send a script line whose log form hides the secrets.
    async fn script_command(
        &mut self,
        send: &str,
        shown: &str,
        cancel: &CancellationToken,
    ) -> FtpResult<FtpReply> {
        let socket = self.socket()?;
        socket.send_line(send)?;
        self.log.add_hidden_command(shown);
        let timeout = self.config.reply_timeout();
        let result = read_final_reply(&socket, &mut self.events, timeout, cancel, &self.log).await;
        result.map_err(|e| self.fail(e))
    }

    fn data_setup(&self) -> FtpResult<DataSetup> {
        let tls = if self.config.security.is_tls() {
            Some((
                self.ctx.tls.get(self.config.accept_invalid_certs)?,
                self.config.host.clone(),
            ))
        } else {
            None
        };
        let tunnel = connection::tunnel_of(self.config.proxy.as_ref()).cloned();
        let bind_ip = self
            .config
            .active_bind_address
            .as_deref()
            .and_then(|a| a.parse::<IpAddr>().ok())
            .or_else(|| self.local_addr.map(|a| a.ip()))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(DataSetup {
            passive: self.config.data_channel_mode == DataChannelMode::Passive,
            server_host: self.config.host.clone(),
            server_port: self.config.port,
            pasv_fallback_ip: if tunnel.is_none() {
                self.peer_addr.map(|a| a.ip())
            } else {
                None
            },
            bind_ip,
            tunnel,
            tls,
            connect_timeout: self.config.connect_timeout(),
            reply_timeout: self.config.reply_timeout(),
        })
    }

    fn arm_keep_alive(&self) {
        let Some(socket) = self.socket.as_ref().filter(|s| s.is_connected()) else {
            return;
        };
        let data = if self.config.keep_alive.command.needs_data_connection() {
            self.data_setup().ok()
        } else {
            None
        };
        self.keep_alive.arm(KeepAliveSession {
            socket: Arc::clone(socket),
            owner: self.uid,
            session_id: self.session_id,
            reply_timeout: self.config.reply_timeout(),
            log: Arc::clone(&self.log),
            data,
        });
    }

    /// Take the connection from keep-alive before a foreground command.
    pub async fn wait_for_end_of_keep_alive(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        let timeout = self.config.reply_timeout();
        let result = self.keep_alive.wait_for_end(cancel, timeout).await;
        result.map_err(|e| self.fail(e))
    }

    /// Begin a foreground command on a connected socket.
    async fn begin(&mut self, cancel: &CancellationToken) -> FtpResult<Arc<EventSocket>> {
        self.wait_for_end_of_keep_alive(cancel).await?;
        let socket = self.socket()?;
        self.drain_stale_events(&socket);
        self.state = ConnectionState::Busy;
        Ok(socket)
    }

    fn end(&mut self) {
        if self.is_connected() {
            self.state = ConnectionState::Ready;
            self.arm_keep_alive();
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }

    // ─── Connect / login ─────────────────────────────────────────────

    /// Open the control connection and log in.
    pub async fn connect(
        &mut self,
        cancel: &CancellationToken,
        ui: &dyn CommandUserInterface,
    ) -> FtpResult<()> {
        self.close_socket();
        self.session_id += 1;
        self.session_abort = CancellationToken::new();
        self.state = ConnectionState::Connecting;
        ui.show_wait(&format!("Connecting to {}...", self.config.host));
        let result = self.connect_inner(cancel, ui).await;
        ui.hide_wait();
        match result {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                self.log.add_info(format!(
                    "Logged in to {} ({:?} paths)",
                    self.config.host, self.path_type
                ));
                self.arm_keep_alive();
                Ok(())
            }
            Err(e) => {
                self.log.add_error(format!("Connect failed: {}", e.message));
                self.close_socket();
                Err(e.with_session(self.session_id))
            }
        }
    }

    fn script_params(&self) -> ScriptParams {
        let cfg = &self.config;
        let (proxy_host, proxy_port, proxy_user, proxy_password) = match &cfg.proxy {
            Some(p) => (p.host.clone(), p.effective_port(), p.user.clone(), p.password.clone()),
            None => (String::new(), 0, String::new(), String::new()),
        };
        ScriptParams {
            proxy_host,
            proxy_port,
            proxy_user,
            proxy_password,
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            account: cfg.account.clone(),
            allow_empty_password: cfg.allow_empty_password,
        }
    }

    async fn connect_inner(
        &mut self,
        cancel: &CancellationToken,
        ui: &dyn CommandUserInterface,
    ) -> FtpResult<()> {
        let cfg = self.config.clone();
        let script_text = match &cfg.proxy {
            Some(p) if p.proxy_type != ProxyType::NotUsed => p.script_text()?.to_string(),
            _ => ProxyType::NotUsed
                .builtin_script()
                .unwrap_or_default()
                .to_string(),
        };
        let mut params = self.script_params();
        let mut script = ProxyScript::new(&script_text);
        let target = script.connect_target(&params)?;

        let tunnel = connection::tunnel_of(cfg.proxy.as_ref());
        let (dial_host, dial_port) = match tunnel {
            Some(_) => (cfg.host.clone(), cfg.port),
            None => (target.host.clone(), target.port),
        };
        let implicit = match cfg.security {
            SecurityMode::Implicit => Some((self.ctx.tls.get(cfg.accept_invalid_certs)?, cfg.host.as_str())),
            _ => None,
        };
        self.log.add_info(format!("Connecting to {}:{}", dial_host, dial_port));
        let opened = tokio::select! {
            r = connection::connect_control(&dial_host, dial_port, tunnel, cfg.connect_timeout(), implicit) => r?,
            _ = cancel.cancelled() => return Err(FtpError::cancelled("Cancelled while connecting")),
        };
        self.local_addr = Some(opened.local_addr);
        self.peer_addr = Some(opened.peer_addr);
        self.socket = Some(Arc::new(EventSocket::new(
            opened.stream,
            self.ctx.dispatcher.clone(),
            self.uid,
        )));

        let socket = self.socket()?;
        let banner = read_final_reply(&socket, &mut self.events, cfg.reply_timeout(), cancel, &self.log).await?;
        if !banner.is_completion() {
            return Err(banner.to_error());
        }
        self.welcome = banner.text();
        self.state = ConnectionState::LoggingIn;

        if cfg.security == SecurityMode::Explicit {
            self.start_explicit_tls(cancel).await?;
        }
        if cfg.security.is_tls() {
            self.command("PBSZ 0", cancel).await?;
            let prot = self.command("PROT P", cancel).await?;
            if !prot.is_completion() {
                return Err(FtpError::tls_failed(format!(
                    "Server refused protected data connections: {}",
                    prot.text()
                )));
            }
        }

        self.run_login_script(&mut script, &mut params, cancel, ui).await?;
        self.after_login(cancel).await
    }

    async fn start_explicit_tls(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        let reply = self.command("AUTH TLS", cancel).await?;
        if !reply.is_completion() {
            return Err(FtpError::tls_failed(format!(
                "Server does not support AUTH TLS: {}",
                reply.text()
            ))
            .with_code(reply.code.unwrap_or(0)));
        }
        let socket = self
            .socket
            .take()
            .ok_or_else(|| FtpError::disconnected("Not connected"))?;
        let socket = Arc::try_unwrap(socket)
            .map_err(|_| FtpError::tls_failed("Control socket is still in use"))?;
        let stream = socket.detach().await?;
        let config = self.ctx.tls.get(self.config.accept_invalid_certs)?;
        let tls_stream = tokio::time::timeout(
            self.config.connect_timeout(),
            tls::connect_tls(config, &self.config.host, stream, "control connection"),
        )
        .await
        .map_err(|_| FtpError::timeout("TLS handshake timed out"))??;
        self.socket = Some(Arc::new(EventSocket::new(
            tls_stream,
            self.ctx.dispatcher.clone(),
            self.uid,
        )));
        self.log.add_info("TLS established on the control connection");
        Ok(())
    }

    async fn run_login_script(
        &mut self,
        script: &mut ProxyScript<'_>,
        params: &mut ScriptParams,
        cancel: &CancellationToken,
        ui: &dyn CommandUserInterface,
    ) -> FtpResult<()> {
        let mut last: Option<u16> = None;
        let mut last_reply: Option<FtpReply> = None;
        loop {
            let cmd = match script.next_command(last, params) {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    let Some(var) = e.missing_variable().map(str::to_string) else {
                        return Err(e);
                    };
                    match ui.ask_value(&var) {
                        Some(v) => {
                            if !params.supply(&var, v) {
                                return Err(e);
                            }
                            continue;
                        }
                        None => return Err(e),
                    }
                }
            };
            ui.progress(&cmd.log);
            let reply = self.script_command(&cmd.send, &cmd.log, cancel).await?;
            if reply.is_transient_failure() || reply.is_permanent_failure() {
                return Err(FtpError::auth_failed(format!("Login failed: {}", reply.text()))
                    .with_code(reply.code.unwrap_or(0)));
            }
            last = reply.code;
            last_reply = Some(reply);
        }
        match last_reply {
            Some(r) if r.is_completion() => Ok(()),
            Some(r) => Err(FtpError::auth_failed(format!(
                "Server expects more login information: {}",
                r.text()
            ))
            .with_code(r.code.unwrap_or(0))),
            None => Err(FtpError::proxy_failed("Login script sent no command")),
        }
    }

    async fn after_login(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        let syst = self.command("SYST", cancel).await?;
        self.syst = if syst.is_completion() {
            syst.text()
        } else {
            String::new()
        };
        let feat = self.command("FEAT", cancel).await?;
        self.features = if feat.is_completion() {
            ServerFeatures::from_feat_reply(&feat)
        } else {
            ServerFeatures::default()
        };
        if self.features.utf8 {
            self.command("OPTS UTF8 ON", cancel).await?;
        }
        if let Some(path) = self.config.initial_path.clone().filter(|p| !p.is_empty()) {
            let cmd = protocol::build_command("CWD", Some(&path))
                .ok_or_else(|| FtpError::invalid_config("Invalid initial path"))?;
            let reply = self.command(&cmd, cancel).await?;
            if !reply.is_completion() {
                self.log.add_error(format!("Cannot change to {}: {}", path, reply.message()));
            }
        }
        self.working_path = self.print_working_directory(cancel).await?;
        self.path_type = paths::detect_path_type(
            Some(&self.welcome),
            Some(&self.syst),
            self.working_path.as_deref().unwrap_or(""),
        );
        Ok(())
    }

    async fn print_working_directory(&mut self, cancel: &CancellationToken) -> FtpResult<Option<String>> {
        let reply = self.command("PWD", cancel).await?;
        if !reply.is_completion() {
            return Ok(None);
        }
        Ok(reply
            .lines
            .iter()
            .rev()
            .find_map(|l| protocol::parse_directory_from_257(l)))
    }

    /// Reconnect if the socket is gone. Returns `true` after a reconnect.
    async fn ensure_connected(&mut self, cancel: &CancellationToken) -> FtpResult<bool> {
        if self.is_connected() {
            return Ok(false);
        }
        let ui = Arc::clone(&self.ui);
        self.connect(cancel, ui.as_ref()).await?;
        Ok(true)
    }

    // ─── Commands ────────────────────────────────────────────────────

    /// Send a raw command and return its final reply. 4xx/5xx replies are
    /// returned, not turned into errors.
    pub async fn send_ftp_command(
        &mut self,
        cmd: &str,
        cancel: &CancellationToken,
        ui: &dyn CommandUserInterface,
    ) -> FtpResult<FtpReply> {
        self.begin(cancel).await?;
        ui.progress(&protocol::loggable_command(cmd));
        let result = self.command(cmd, cancel).await;
        if let Ok(r) = &result {
            ui.progress(&r.text());
        }
        self.end();
        result
    }

    /// Negotiate TYPE A / TYPE I. Returns `true` when the server accepted.
    pub async fn set_current_transfer_mode(
        &mut self,
        ty: TransferType,
        force: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<bool> {
        self.begin(cancel).await?;
        let result = self.negotiate_type(ty, force, cancel).await;
        self.end();
        result
    }

    async fn negotiate_type(
        &mut self,
        ty: TransferType,
        force: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<bool> {
        if !force && self.negotiated_type == Some(ty) {
            return Ok(true);
        }
        let reply = self.command(ty.command(), cancel).await?;
        if reply.is_completion() {
            self.negotiated_type = Some(ty);
            Ok(true)
        } else {
            // a clean refusal leaves the previous type in effect
            if !reply.is_permanent_failure() {
                self.negotiated_type = None;
            }
            Ok(false)
        }
    }

    async fn ensure_mode_z(&mut self, cancel: &CancellationToken) -> FtpResult<bool> {
        let wanted = self.config.use_compression && self.features.mode_z;
        if wanted == self.mode_z_on {
            return Ok(self.mode_z_on);
        }
        let cmd = if wanted { "MODE Z" } else { "MODE S" };
        let reply = self.command(cmd, cancel).await?;
        if reply.is_completion() {
            self.mode_z_on = wanted;
        }
        Ok(self.mode_z_on)
    }

    /// CWD + PWD. Returns the new working path.
    pub async fn change_working_path(
        &mut self,
        path: &str,
        cancel: &CancellationToken,
    ) -> FtpResult<String> {
        self.ensure_connected(cancel).await?;
        self.begin(cancel).await?;
        let result = self.cwd_and_pwd(path, cancel).await;
        self.end();
        result
    }

    async fn cwd_and_pwd(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<String> {
        let cmd = protocol::build_command("CWD", Some(path))
            .ok_or_else(|| FtpError::invalid_config(format!("Invalid path: {:?}", path)))?;
        let reply = self.command(&cmd, cancel).await?;
        if !reply.is_completion() {
            return Err(reply.to_error().with_session(self.session_id));
        }
        let now = self
            .print_working_directory(cancel)
            .await?
            .unwrap_or_else(|| path.to_string());
        self.working_path = Some(now.clone());
        Ok(now)
    }

    /// Make `path` the working directory. After a reconnect the server must
    /// report the same directory.
    async fn enter_path(&mut self, path: &str, verify: bool, cancel: &CancellationToken) -> FtpResult<()> {
        let here = self
            .working_path
            .as_deref()
            .is_some_and(|w| paths::is_same_server_path(self.path_type, w, path));
        if here && !verify {
            return Ok(());
        }
        let now = self.cwd_and_pwd(path, cancel).await?;
        if verify && !paths::is_same_server_path(self.path_type, &now, path) {
            return Err(FtpError::not_found(format!(
                "Working directory changed to {} instead of {}",
                now, path
            )));
        }
        Ok(())
    }

    /// QUIT and close.
    pub async fn disconnect(&mut self) -> FtpResult<()> {
        if !self.is_connected() {
            self.close_socket();
            return Ok(());
        }
        let never = CancellationToken::new();
        if self.keep_alive.wait_for_end(&never, QUIT_TIMEOUT).await.is_ok() {
            if let Ok(socket) = self.socket() {
                let _ = exchange(&socket, &mut self.events, "QUIT", QUIT_TIMEOUT, &never, &self.log).await;
            }
        }
        self.close_socket();
        self.log.add_info("Disconnected");
        Ok(())
    }

    /// Drop everything at once: data connections of this session and the
    /// control socket. Events still in flight carry the old session id.
    pub fn hard_abort(&mut self) {
        self.session_abort.cancel();
        self.session_abort = CancellationToken::new();
        self.session_id += 1;
        self.close_socket();
        self.log.add_info("Connection aborted");
    }

    pub fn handle_data_connection_event(&self, ev: &SocketEvent) -> EventDisposition {
        classify_data_event(self.session_id, ev)
    }

    // ─── Listing ─────────────────────────────────────────────────────

    fn cache_key<'a>(&'a self, path: &'a str) -> CacheKey<'a> {
        CacheKey {
            host: &self.config.host,
            port: self.config.port,
            user: self.config.cache_user(),
            path,
            path_type: self.path_type,
            list_cmd: &self.config.list_command,
            is_ftps: self.config.security.is_tls(),
        }
    }

    /// List `path`, from the cache when allowed.
    pub async fn list_working_path(
        &mut self,
        path: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<ListingResult> {
        let use_cache = self.ctx.config().use_listings_cache;
        if force_refresh {
            self.ctx.cache.refresh_on_path(
                &self.config.host,
                self.config.port,
                self.config.cache_user(),
                path,
                false,
            );
        } else if use_cache {
            let hit = self.ctx.cache.get_path_listing(&self.cache_key(path));
            if let Some(hit) = hit {
                log::debug!("Listing of {} served from cache", path);
                if self.state == ConnectionState::Ready {
                    self.arm_keep_alive();
                }
                return Ok(self.build_listing(path, hit.path_type, hit.raw, false, true, hit.captured_at));
            }
        }

        let mut budget = RetryBudget::new(self.config.max_retries, Duration::from_secs(self.config.retry_delay_sec));
        let mut partial: Vec<u8> = Vec::new();
        let (raw, incomplete) = loop {
            let attempt = self.list_once(path, cancel).await;
            self.end();
            match attempt {
                Ok(Attempt::Done(raw)) => break (raw, false),
                Ok(Attempt::Retry { error, data }) => {
                    if data.len() > partial.len() {
                        partial = data;
                    }
                    self.log.add_error(format!("Listing failed: {}", error.message));
                    if !budget.take() {
                        if let Some(end) = partial.iter().rposition(|&b| b == b'\n') {
                            partial.truncate(end + 1);
                            self.log.add_error("Listing is incomplete");
                            break (partial, true);
                        }
                        return Err(error.with_session(self.session_id));
                    }
                    self.close_socket();
                    if error.kind != FtpErrorKind::TlsFailed {
                        budget.wait(cancel).await?;
                    }
                }
                Err(e) => return Err(e.with_session(self.session_id)),
            }
        };

        let captured_at = Utc::now();
        if use_cache && !incomplete {
            self.ctx
                .cache
                .add_or_update_path_listing(&self.cache_key(path), &raw, captured_at);
        }
        Ok(self.build_listing(path, self.path_type, raw, incomplete, false, captured_at))
    }

    async fn list_once(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<Attempt<Vec<u8>>> {
        let reconnected = match self.ensure_connected(cancel).await {
            Ok(r) => r,
            Err(e) => return retry_or_fail(e),
        };
        if let Err(e) = self.begin(cancel).await {
            return retry_or_fail(e);
        }
        if let Err(e) = self.enter_path(path, reconnected, cancel).await {
            return retry_or_fail(e);
        }
        let list_cmd = self.config.list_command.clone();
        let out = match self
            .data_command(DataDirection::List, &list_cmd, TransferType::Ascii, None, None, cancel)
            .await
        {
            Ok(o) => o,
            Err(e) => return retry_or_fail(e),
        };

        if let Some(e) = out.control_error {
            return Ok(Attempt::Retry { error: e, data: out.data });
        }
        let reply = out
            .reply
            .ok_or_else(|| FtpError::protocol_error("Listing ended without a reply"))?;
        if reply.is_completion() {
            return match out.data_error.to_ftp_error() {
                None => Ok(Attempt::Done(out.data)),
                Some(e) if e.is_retryable() => Ok(Attempt::Retry { error: e, data: out.data }),
                Some(e) => Err(e),
            };
        }
        let last_line = reply.lines.last().map(String::as_str).unwrap_or("");
        if protocol::is_empty_dir_list_err_reply(last_line) {
            return Ok(Attempt::Done(Vec::new()));
        }
        let code = reply.code.unwrap_or(0);
        // The server closing an unused data socket after refusing LIST is
        // not a transport failure; only 421/425/426 are.
        if matches!(code, 421 | 425 | 426) {
            let error = out
                .data_error
                .to_ftp_error()
                .filter(FtpError::is_retryable)
                .unwrap_or_else(|| reply.to_error());
            return Ok(Attempt::Retry { error, data: out.data });
        }
        Err(FtpError::list_refused(code, format!("Listing refused: {}", reply.text())))
    }

    /// Run one data command on the current session: TYPE, PASV/PORT,
    /// MODE Z, the command itself.
    async fn data_command(
        &mut self,
        direction: DataDirection,
        cmd: &str,
        ty: TransferType,
        flush_target: Option<&Path>,
        upload: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> FtpResult<DataTransferOutcome> {
        self.negotiate_type(ty, false, cancel).await?;
        let setup = self.data_setup()?;
        let socket = self.socket()?;
        let dispatcher = self.ctx.dispatcher.clone();
        let prepared = prepare_data_connection(
            &socket,
            &mut self.events,
            &setup,
            direction,
            self.session_id,
            self.uid,
            &dispatcher,
            &self.session_abort,
            &self.log,
        )
        .await;
        let mut dc = prepared.map_err(|e| self.fail(e))?;
        let compressed = self.ensure_mode_z(cancel).await?;
        dc.set_compressed(compressed);
        if let Some(target) = flush_target {
            dc.set_flush_target(target);
        }
        if let Some(bytes) = upload {
            dc.set_upload_data(bytes);
        }
        let timeout = self.config.reply_timeout();
        let result = run_data_command(
            &socket,
            &mut self.events,
            &mut dc,
            cmd,
            self.session_id,
            timeout,
            cancel,
            &self.log,
        )
        .await;
        let out = result.map_err(|e| self.fail(e))?;
        if let Some(e) = &out.control_error {
            self.close_on_error(e);
        }
        Ok(out)
    }

    fn build_listing(
        &self,
        path: &str,
        path_type: ServerPathType,
        raw: Vec<u8>,
        incomplete: bool,
        from_cache: bool,
        captured_at: DateTime<Utc>,
    ) -> ListingResult {
        let today = chrono::Local::now().date_naive();
        let forced = self
            .config
            .server_type
            .as_deref()
            .and_then(|name| self.ctx.server_types.get(name));
        let (entries, server_type) = match forced {
            Some(ty) => {
                let parsed = ty.parse(&raw, incomplete, today);
                if parsed.skipped_lines > 0 {
                    self.log.add_error(format!(
                        "{} listing line(s) not understood by server type {}",
                        parsed.skipped_lines,
                        ty.name()
                    ));
                }
                (Some(parsed.entries), Some(ty.name().to_string()))
            }
            None => match parser::autodetect(
                &self.ctx.server_types.all(),
                &self.welcome,
                &self.syst,
                &raw,
                incomplete,
                today,
            ) {
                Some(d) => (Some(d.listing.entries), Some(d.server_type.name().to_string())),
                None => {
                    self.log.add_error("No server type understands the listing; showing it as text");
                    (None, None)
                }
            },
        };
        ListingResult {
            path: path.to_string(),
            path_type,
            raw,
            entries,
            server_type,
            incomplete,
            from_cache,
            captured_at,
        }
    }

    // ─── Files ───────────────────────────────────────────────────────

    fn transfer_type_for(&self, name: &str, mode: TransferMode) -> TransferType {
        match mode {
            TransferMode::Binary => TransferType::Binary,
            TransferMode::Ascii => TransferType::Ascii,
            TransferMode::Auto => {
                if self.ctx.config().is_ascii_file(name) {
                    TransferType::Ascii
                } else {
                    TransferType::Binary
                }
            }
        }
    }

    /// Parent directory and name of a server path.
    pub fn split_server_path<'a>(&self, path: &'a str) -> (&'a str, &'a str) {
        let delim = paths::path_delimiter(self.path_type);
        let trimmed = path.trim_end_matches(delim);
        match trimmed.rfind(delim) {
            Some(0) => (&trimmed[..1], &trimmed[1..]),
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => ("", trimmed),
        }
    }

    /// Run a transfer with reconnects paid from one budget.
    async fn transfer(
        &mut self,
        remote: &str,
        direction: DataDirection,
        mode: TransferMode,
        flush_target: Option<&Path>,
        upload: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> FtpResult<DataTransferOutcome> {
        let (dir, name) = self.split_server_path(remote);
        let (dir, name) = (dir.to_string(), name.to_string());
        let verb = if direction == DataDirection::Upload { "STOR" } else { "RETR" };
        let cmd = protocol::build_command(verb, Some(&name))
            .ok_or_else(|| FtpError::invalid_config(format!("Invalid file name: {:?}", name)))?;
        let ty = self.transfer_type_for(&name, mode);
        let mut budget = RetryBudget::new(self.config.max_retries, Duration::from_secs(self.config.retry_delay_sec));

        loop {
            let attempt: FtpResult<Attempt<DataTransferOutcome>> = async {
                let reconnected = match self.ensure_connected(cancel).await {
                    Ok(r) => r,
                    Err(e) => return retry_or_fail(e),
                };
                if let Err(e) = self.begin(cancel).await {
                    return retry_or_fail(e);
                }
                if !dir.is_empty() {
                    if let Err(e) = self.enter_path(&dir, reconnected, cancel).await {
                        return retry_or_fail(e);
                    }
                }
                let out = match self
                    .data_command(direction, &cmd, ty, flush_target, upload.clone(), cancel)
                    .await
                {
                    Ok(o) => o,
                    Err(e) => return retry_or_fail(e),
                };
                if let Some(e) = out.control_error {
                    return Ok(Attempt::Retry { error: e, data: Vec::new() });
                }
                let reply = out
                    .reply
                    .clone()
                    .ok_or_else(|| FtpError::protocol_error("Transfer ended without a reply"))?;
                if !reply.is_completion() {
                    let e = reply.to_error();
                    return if matches!(reply.code, Some(421 | 425 | 426)) {
                        Ok(Attempt::Retry { error: e, data: Vec::new() })
                    } else {
                        Err(e)
                    };
                }
                match out.data_error.to_ftp_error() {
                    None => Ok(Attempt::Done(out)),
                    Some(e) if e.is_retryable() => Ok(Attempt::Retry { error: e, data: Vec::new() }),
                    Some(e) => Err(e),
                }
            }
            .await;
            self.end();
            match attempt {
                Ok(Attempt::Done(out)) => return Ok(out),
                Ok(Attempt::Retry { error, .. }) => {
                    self.log.add_error(format!("Transfer of {} failed: {}", remote, error.message));
                    if !budget.take() {
                        return Err(error.with_session(self.session_id));
                    }
                    self.close_socket();
                    if error.kind != FtpErrorKind::TlsFailed {
                        budget.wait(cancel).await?;
                    }
                }
                Err(e) => return Err(e.with_session(self.session_id)),
            }
        }
    }

    fn notify_change(&self, dir: &str, include_subdirs: bool) {
        self.ctx.cache.refresh_on_path(
            &self.config.host,
            self.config.port,
            self.config.cache_user(),
            dir,
            !include_subdirs,
        );
    }

    /// Download `remote` into `local`. Returns the payload size.
    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        mode: TransferMode,
        cancel: &CancellationToken,
    ) -> FtpResult<u64> {
        let out = self
            .transfer(remote, DataDirection::Download, mode, Some(local), None, cancel)
            .await?;
        if out.counters.payload_bytes == 0 && !local.exists() {
            tokio::fs::write(local, b"").await?;
        }
        Ok(out.counters.payload_bytes)
    }

    /// Download `remote` into memory.
    pub async fn view_file(
        &mut self,
        remote: &str,
        mode: TransferMode,
        cancel: &CancellationToken,
    ) -> FtpResult<Vec<u8>> {
        let out = self
            .transfer(remote, DataDirection::Download, mode, None, None, cancel)
            .await?;
        Ok(out.data)
    }

    /// Upload `local` as `remote`. Returns the bytes sent.
    pub async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        mode: TransferMode,
        cancel: &CancellationToken,
    ) -> FtpResult<u64> {
        let bytes = tokio::fs::read(local).await?;
        let out = self
            .transfer(remote, DataDirection::Upload, mode, None, Some(bytes), cancel)
            .await?;
        let (dir, _) = self.split_server_path(remote);
        self.notify_change(dir, false);
        Ok(out.counters.written_bytes)
    }

    /// Run a simple command in the directory of `remote`, reconnecting as
    /// needed.
    async fn file_command(
        &mut self,
        remote: &str,
        make: impl Fn(&str) -> String,
        cancel: &CancellationToken,
    ) -> FtpResult<FtpReply> {
        let (dir, name) = self.split_server_path(remote);
        let (dir, name) = (dir.to_string(), name.to_string());
        let cmd = make(&name);
        if cmd.contains('\r') || cmd.contains('\n') {
            return Err(FtpError::invalid_config(format!("Invalid file name: {:?}", name)));
        }
        let mut budget = RetryBudget::new(self.config.max_retries, Duration::from_secs(self.config.retry_delay_sec));
        loop {
            let attempt: FtpResult<Attempt<FtpReply>> = async {
                let reconnected = match self.ensure_connected(cancel).await {
                    Ok(r) => r,
                    Err(e) => return retry_or_fail(e),
                };
                if let Err(e) = self.begin(cancel).await {
                    return retry_or_fail(e);
                }
                if !dir.is_empty() {
                    if let Err(e) = self.enter_path(&dir, reconnected, cancel).await {
                        return retry_or_fail(e);
                    }
                }
                match self.command(&cmd, cancel).await {
                    Ok(r) => Ok(Attempt::Done(r)),
                    Err(e) => retry_or_fail(e),
                }
            }
            .await;
            self.end();
            match attempt {
                Ok(Attempt::Done(r)) if r.is_completion() => {
                    self.notify_change(&dir, false);
                    return Ok(r);
                }
                Ok(Attempt::Done(r)) => return Err(r.to_error().with_session(self.session_id)),
                Ok(Attempt::Retry { error, .. }) => {
                    if !budget.take() {
                        return Err(error.with_session(self.session_id));
                    }
                    self.close_socket();
                    budget.wait(cancel).await?;
                }
                Err(e) => return Err(e.with_session(self.session_id)),
            }
        }
    }

    /// DELE a file or RMD a directory.
    pub async fn delete(&mut self, remote: &str, is_dir: bool, cancel: &CancellationToken) -> FtpResult<()> {
        let verb = if is_dir { "RMD" } else { "DELE" };
        self.file_command(remote, |name| format!("{} {}", verb, name), cancel)
            .await?;
        if is_dir {
            self.notify_change(remote, true);
        }
        Ok(())
    }

    /// SITE CHMOD with an octal mode.
    pub async fn change_attributes(
        &mut self,
        remote: &str,
        mode: u32,
        cancel: &CancellationToken,
    ) -> FtpResult<()> {
        self.file_command(remote, |name| format!("SITE CHMOD {:o} {}", mode, name), cancel)
            .await
            .map(|_| ())
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.session_abort.cancel();
        if let Some(s) = self.socket.take() {
            s.close();
        }
        self.ctx.dispatcher.unregister(self.uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::testing::*;

    #[tokio::test]
    async fn connect_and_list() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.connect(&cancel, &NoUserInterface).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.get_working_path(), Some("/"));
        assert_eq!(conn.path_type(), ServerPathType::Unix);
        assert!(conn.features().utf8);
        assert!(conn.log().text().contains("PASS (hidden)"));
        assert!(!conn.log().text().contains("secret"));

        let listing = conn.list_working_path("/pub", false, &cancel).await.unwrap();
        assert!(!listing.from_cache);
        assert!(!listing.incomplete);
        let entries = listing.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "README.txt");
        assert_eq!(conn.get_working_path(), Some("/pub"));

        let again = conn.list_working_path("/pub", false, &cancel).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(server.count("LIST"), 1);
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn forced_refresh_purges_even_without_cache() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let key_user = "bob";
        ctx.cache.add_or_update_path_listing(
            &CacheKey {
                host: "127.0.0.1",
                port: server.port,
                user: key_user,
                path: "/pub/sub",
                path_type: ServerPathType::Unix,
                list_cmd: "LIST",
                is_ftps: false,
            },
            b"old",
            Utc::now(),
        );
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.list_working_path("/pub", true, &cancel).await.unwrap();
        assert!(ctx.cache.is_empty());
        // not cached with the cache switched off
        conn.list_working_path("/pub", false, &cancel).await.unwrap();
        assert_eq!(server.count("LIST"), 2);
    }

    #[tokio::test]
    async fn new_connection_shares_cached_listings() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let cancel = CancellationToken::new();
        let mut first = connection(&ctx, server.port);
        first.list_working_path("/pub", false, &cancel).await.unwrap();
        first.list_working_path("/pub/sub", false, &cancel).await.unwrap();
        assert_eq!(server.count("LIST"), 2);

        let mut second = connection(&ctx, server.port);
        let hit = second.list_working_path("/pub", false, &cancel).await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.path_type, ServerPathType::Unix);
        assert_eq!(server.count("LIST"), 2);

        let mut third = connection(&ctx, server.port);
        let fresh = third.list_working_path("/pub", true, &cancel).await.unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(server.count("LIST"), 3);
        let sub = third.list_working_path("/pub/sub", false, &cancel).await.unwrap();
        assert!(!sub.from_cache);
        assert_eq!(server.count("LIST"), 4);
    }

    #[tokio::test]
    async fn refused_listing_is_terminal() {
        let server = mock_server(Behavior {
            list_reply: Some("550 Permission denied"),
            ..Default::default()
        })
        .await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        let err = conn.list_working_path("/", false, &cancel).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::ListRefused);
        assert_eq!(err.code, Some(550));
        assert!(err.message.contains("Permission denied"));
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn empty_directory_error_reply_is_empty_listing() {
        let server = mock_server(Behavior {
            list_reply: Some("550 The specified directory is empty"),
            ..Default::default()
        })
        .await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        let listing = conn.list_working_path("/", false, &cancel).await.unwrap();
        assert!(listing.raw.is_empty());
    }

    #[tokio::test]
    async fn reply_timeout_closes_connection() {
        let server = mock_server(Behavior {
            silent: Some("NOOP"),
            ..Default::default()
        })
        .await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.connect(&cancel, &NoUserInterface).await.unwrap();
        let err = conn
            .send_ftp_command("NOOP", &cancel, &NoUserInterface)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Timeout);
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn silent_listing_drops_the_session() {
        let server = mock_server(Behavior {
            silent: Some("LIST"),
            ..Default::default()
        })
        .await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        let err = conn.list_working_path("/pub", false, &cancel).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn cancelled_command() {
        let server = mock_server(Behavior {
            silent: Some("NOOP"),
            ..Default::default()
        })
        .await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.connect(&cancel, &NoUserInterface).await.unwrap();
        let user_cancel = CancellationToken::new();
        let trigger = user_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = conn
            .send_ftp_command("NOOP", &user_cancel, &NoUserInterface)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Cancelled);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn transfer_type_is_remembered() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.connect(&cancel, &NoUserInterface).await.unwrap();
        assert!(conn.set_current_transfer_mode(TransferType::Binary, false, &cancel).await.unwrap());
        assert!(conn.set_current_transfer_mode(TransferType::Binary, false, &cancel).await.unwrap());
        assert_eq!(server.count("TYPE"), 1);
        conn.set_current_transfer_mode(TransferType::Binary, true, &cancel)
            .await
            .unwrap();
        assert_eq!(server.count("TYPE"), 2);
    }

    struct Prompt;

    impl CommandUserInterface for Prompt {
        fn ask_value(&self, variable: &str) -> Option<String> {
            (variable == "Password").then(|| "typed".to_string())
        }
    }

    #[tokio::test]
    async fn missing_password_is_asked_for() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        conn.config.password.clear();
        let cancel = CancellationToken::new();
        let err = conn.connect(&cancel, &NoUserInterface).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NeedUserInput);
        assert_eq!(err.missing_variable(), Some("Password"));

        conn.connect(&cancel, &Prompt).await.unwrap();
        assert!(server.commands.lock().unwrap().contains(&"PASS typed".to_string()));
    }

    #[tokio::test]
    async fn delete_refreshes_cache() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        let cancel = CancellationToken::new();
        conn.list_working_path("/pub", false, &cancel).await.unwrap();
        assert_eq!(ctx.cache.len(), 1);
        conn.delete("/pub/README.txt", false, &cancel).await.unwrap();
        assert!(ctx.cache.is_empty());
        assert!(server.commands.lock().unwrap().contains(&"DELE README.txt".to_string()));
    }

    #[tokio::test]
    async fn hard_abort_makes_old_events_stale() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        conn.connect(&CancellationToken::new(), &NoUserInterface).await.unwrap();
        let old = conn.session_id();
        conn.hard_abort();
        assert!(!conn.is_connected());
        assert_eq!(
            conn.handle_data_connection_event(&SocketEvent::DataConnectionFinished { session_id: old }),
            EventDisposition::Stale
        );
        assert_eq!(
            conn.handle_data_connection_event(&SocketEvent::DataConnectionFinished {
                session_id: conn.session_id()
            }),
            EventDisposition::Handled
        );
        assert_eq!(
            conn.handle_data_connection_event(&SocketEvent::NewBytesRead),
            EventDisposition::NotDataEvent
        );
    }

    #[test]
    fn retry_budget_runs_out() {
        let mut b = RetryBudget::new(2, Duration::ZERO);
        assert!(b.take());
        assert!(b.take());
        assert!(!b.take());
        assert_eq!(b.remaining(), 0);
    }
}
