//! Keep-alive sub-machine of a control connection.
//!
//! Modes:
//!
//! ```text
//! Forbidden -> Waiting -> Processing -> [WaitingForEndOfProcessing] -> Waiting
//!                  \-> None (stop-after reached or the command failed)
//! ```
//!
//! The foreground arms keep-alive after every command. When the timer fires
//! while the connection is idle, the keep-alive task borrows the control
//! socket's event route, sends the idle command (NOOP, PWD, or NLST/LIST
//! through its own data connection) and hands the route back. A foreground
//! command first calls [`KeepAlive::wait_for_end`], which waits for a running
//! keep-alive command to finish.

use crate::ftp::ctrlcon::{self, DataSetup};
use crate::ftp::datacon::DataDirection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::log_book::LogBook;
use crate::ftp::socket::{Dispatcher, EventSocket, SocketEvent, SocketUid, TimerId};
use crate::ftp::types::{KeepAliveCommand, KeepAliveConfig};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_TIMER: TimerId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMode {
    /// Stopped until the next foreground command.
    None,
    /// Timer armed.
    Waiting,
    /// Keep-alive command in flight.
    Processing,
    /// Keep-alive command in flight and the foreground is waiting for it.
    WaitingForEndOfProcessing,
    /// A foreground command owns the connection.
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveTiming {
    pub send_every: Duration,
    pub stop_after: Duration,
    pub command: KeepAliveCommand,
}

impl KeepAliveTiming {
    /// `None` when keep-alive is switched off.
    pub fn from_config(cfg: &KeepAliveConfig) -> Option<Self> {
        (cfg.enabled && cfg.send_every_sec > 0).then(|| Self {
            send_every: cfg.send_every(),
            stop_after: cfg.stop_after(),
            command: cfg.command,
        })
    }
}

/// What the keep-alive task needs to talk to the server.
#[derive(Clone)]
pub struct KeepAliveSession {
    pub socket: Arc<EventSocket>,
    /// Control-connection route, restored after each keep-alive command.
    pub owner: SocketUid,
    pub session_id: u64,
    pub reply_timeout: Duration,
    pub log: Arc<LogBook>,
    /// Needed for NLST/LIST; without it NOOP is sent instead.
    pub data: Option<DataSetup>,
}

#[derive(Default)]
struct Armed {
    session: Option<KeepAliveSession>,
    idle_since: Option<Instant>,
}

pub struct KeepAlive {
    timing: Option<KeepAliveTiming>,
    dispatcher: Dispatcher,
    uid: SocketUid,
    mode: Arc<watch::Sender<KeepAliveMode>>,
    armed: Arc<StdMutex<Armed>>,
    sent: Arc<std::sync::atomic::AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("timing", &self.timing)
            .field("mode", &self.mode())
            .finish()
    }
}

impl KeepAlive {
    pub fn new(dispatcher: Dispatcher, timing: Option<KeepAliveTiming>) -> Self {
        let (uid, rx) = dispatcher.register();
        let (mode, _) = watch::channel(KeepAliveMode::Forbidden);
        let mode = Arc::new(mode);
        let armed = Arc::new(StdMutex::new(Armed::default()));
        let sent = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let task = timing.map(|timing| {
            tokio::spawn(run_keep_alive(
                rx,
                uid,
                timing,
                dispatcher.clone(),
                Arc::clone(&mode),
                Arc::clone(&armed),
                Arc::clone(&sent),
            ))
        });
        Self {
            timing,
            dispatcher,
            uid,
            mode,
            armed,
            sent,
            task,
        }
    }

    pub fn mode(&self) -> KeepAliveMode {
        *self.mode.borrow()
    }

    /// Keep-alive commands sent so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Start the idle timer after a foreground command.
    pub fn arm(&self, session: KeepAliveSession) {
        let Some(timing) = self.timing else {
            return;
        };
        {
            let mut armed = self.armed.lock().unwrap_or_else(|p| p.into_inner());
            armed.session = Some(session);
            armed.idle_since = Some(Instant::now());
        }
        let mut armed_now = false;
        self.mode.send_if_modified(|m| match *m {
            KeepAliveMode::Processing | KeepAliveMode::WaitingForEndOfProcessing => false,
            _ => {
                armed_now = true;
                let changed = *m != KeepAliveMode::Waiting;
                *m = KeepAliveMode::Waiting;
                changed
            }
        });
        if armed_now {
            self.dispatcher
                .add_timer_after(self.uid, timing.send_every, KEEPALIVE_TIMER);
        }
    }

    /// Stop keep-alive and forget the session (disconnect, hard abort).
    pub fn disarm(&self) {
        self.dispatcher.delete_timer(self.uid, KEEPALIVE_TIMER);
        self.mode.send_if_modified(|m| match *m {
            KeepAliveMode::Processing | KeepAliveMode::WaitingForEndOfProcessing => false,
            _ => {
                let changed = *m != KeepAliveMode::Forbidden;
                *m = KeepAliveMode::Forbidden;
                changed
            }
        });
        self.armed.lock().unwrap_or_else(|p| p.into_inner()).session = None;
    }

    /// Take the connection for a foreground command. Blocks while a
    /// keep-alive command is in flight; gives up after `server_timeout`
    /// (the control socket is closed then) or on cancellation.
    pub async fn wait_for_end(
        &self,
        cancel: &CancellationToken,
        server_timeout: Duration,
    ) -> FtpResult<()> {
        self.dispatcher.delete_timer(self.uid, KEEPALIVE_TIMER);
        let mut must_wait = false;
        self.mode.send_modify(|m| match *m {
            KeepAliveMode::Processing | KeepAliveMode::WaitingForEndOfProcessing => {
                must_wait = true;
                *m = KeepAliveMode::WaitingForEndOfProcessing;
            }
            _ => *m = KeepAliveMode::Forbidden,
        });
        if !must_wait {
            return Ok(());
        }

        log::debug!("Waiting for the keep-alive command to finish");
        let mut rx = self.mode.subscribe();
        tokio::select! {
            r = rx.wait_for(|m| *m == KeepAliveMode::Forbidden) => {
                r.map(|_| ()).map_err(|_| FtpError::disconnected("Keep-alive stopped"))
            }
            _ = cancel.cancelled() => Err(FtpError::cancelled("Cancelled while waiting for keep-alive")),
            _ = tokio::time::sleep(server_timeout) => {
                if let Some(s) = self.armed.lock().unwrap_or_else(|p| p.into_inner()).session.take() {
                    s.socket.close();
                }
                self.mode.send_replace(KeepAliveMode::Forbidden);
                Err(FtpError::timeout("Server did not answer the keep-alive command"))
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.uid);
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

async fn run_keep_alive(
    mut rx: UnboundedReceiver<SocketEvent>,
    uid: SocketUid,
    timing: KeepAliveTiming,
    dispatcher: Dispatcher,
    mode: Arc<watch::Sender<KeepAliveMode>>,
    armed: Arc<StdMutex<Armed>>,
    sent: Arc<std::sync::atomic::AtomicU64>,
) {
    while let Some(ev) = rx.recv().await {
        if ev != SocketEvent::Timer(KEEPALIVE_TIMER) {
            continue;
        }
        let (session, idle_since) = {
            let a = armed.lock().unwrap_or_else(|p| p.into_inner());
            (a.session.clone(), a.idle_since)
        };
        let Some(session) = session else {
            continue;
        };
        if idle_since.is_some_and(|t| t.elapsed() > timing.stop_after) {
            if mode.send_if_modified(|m| {
                let hit = *m == KeepAliveMode::Waiting;
                if hit {
                    *m = KeepAliveMode::None;
                }
                hit
            }) {
                session.log.add_info("Keep-alive stopped (stop-after time reached)");
            }
            continue;
        }
        let start = mode.send_if_modified(|m| {
            let hit = *m == KeepAliveMode::Waiting;
            if hit {
                *m = KeepAliveMode::Processing;
            }
            hit
        });
        if !start {
            continue;
        }

        session.socket.set_route(uid);
        let result = send_keep_alive(&session, &mut rx, uid, timing.command, &dispatcher).await;
        session.socket.set_route(session.owner);
        sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Err(e) = &result {
            session.log.add_error(format!("Keep-alive failed: {}", e.message));
            if e.is_retryable() {
                session.socket.close();
            }
        }
        dispatcher.post(session.owner, SocketEvent::KeepAliveFinished);

        let mut rearm = false;
        mode.send_modify(|m| match *m {
            KeepAliveMode::WaitingForEndOfProcessing => *m = KeepAliveMode::Forbidden,
            KeepAliveMode::Processing => {
                rearm = result.is_ok();
                *m = if rearm {
                    KeepAliveMode::Waiting
                } else {
                    KeepAliveMode::None
                };
            }
            _ => {}
        });
        if rearm {
            dispatcher.add_timer_after(uid, timing.send_every, KEEPALIVE_TIMER);
        }
    }
}

async fn send_keep_alive(
    session: &KeepAliveSession,
    rx: &mut UnboundedReceiver<SocketEvent>,
    uid: SocketUid,
    command: KeepAliveCommand,
    dispatcher: &Dispatcher,
) -> FtpResult<()> {
    let never = CancellationToken::new();
    let socket = &session.socket;
    let log = &session.log;
    match (command, &session.data) {
        (KeepAliveCommand::Nlst | KeepAliveCommand::List, Some(setup)) => {
            let mut dc = ctrlcon::prepare_data_connection(
                socket,
                rx,
                setup,
                DataDirection::List,
                session.session_id,
                uid,
                dispatcher,
                &never,
                log,
            )
            .await?;
            let cmd = if command == KeepAliveCommand::Nlst {
                "NLST"
            } else {
                "LIST"
            };
            let out = ctrlcon::run_data_command(
                socket,
                rx,
                &mut dc,
                cmd,
                session.session_id,
                session.reply_timeout,
                &never,
                log,
            )
            .await?;
            if let Some(e) = out.control_error {
                return Err(e);
            }
            Ok(())
        }
        _ => {
            let cmd = if command == KeepAliveCommand::Pwd {
                "PWD"
            } else {
                "NOOP"
            };
            ctrlcon::exchange(socket, rx, cmd, session.reply_timeout, &never, log)
                .await
                .map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    async fn serve(stream: DuplexStream, delay: Duration, noops: Arc<AtomicUsize>) {
        let (rd, mut wr) = tokio::io::split(stream);
        let mut lines = BufReader::new(rd).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line == "NOOP" {
                noops.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(delay).await;
            if wr.write_all(b"200 OK\r\n").await.is_err() {
                break;
            }
        }
    }

    fn setup(
        delay: Duration,
        every_ms: u64,
        stop_ms: u64,
    ) -> (KeepAlive, KeepAliveSession, Arc<AtomicUsize>, UnboundedReceiver<SocketEvent>) {
        let d = Dispatcher::new();
        let (owner, owner_rx) = d.register();
        let (client, server) = tokio::io::duplex(1024);
        let noops = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve(server, delay, Arc::clone(&noops)));
        let socket = Arc::new(EventSocket::new(Box::new(client), d.clone(), owner));
        let session = KeepAliveSession {
            socket,
            owner,
            session_id: 1,
            reply_timeout: Duration::from_secs(5),
            log: Arc::new(LogBook::default()),
            data: None,
        };
        let ka = KeepAlive::new(
            d,
            Some(KeepAliveTiming {
                send_every: Duration::from_millis(every_ms),
                stop_after: Duration::from_millis(stop_ms),
                command: KeepAliveCommand::Noop,
            }),
        );
        (ka, session, noops, owner_rx)
    }

    #[tokio::test]
    async fn sends_exactly_once_before_stop_after() {
        let (ka, session, noops, _rx) = setup(Duration::ZERO, 150, 200);
        ka.arm(session);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(noops.load(Ordering::SeqCst), 1);
        assert_eq!(ka.mode(), KeepAliveMode::None);
        assert_eq!(ka.sent_count(), 1);
    }

    #[tokio::test]
    async fn foreground_command_suppresses_keep_alive() {
        let (ka, session, noops, _rx) = setup(Duration::ZERO, 150, 10_000);
        ka.arm(session);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ka.wait_for_end(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ka.mode(), KeepAliveMode::Forbidden);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(noops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreground_waits_for_running_keep_alive() {
        let (ka, session, noops, mut owner_rx) = setup(Duration::from_millis(150), 20, 10_000);
        let socket = Arc::clone(&session.socket);
        let owner = session.owner;
        ka.arm(session);
        while ka.mode() != KeepAliveMode::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ka.wait_for_end(&CancellationToken::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(noops.load(Ordering::SeqCst), 1);
        assert_eq!(ka.mode(), KeepAliveMode::Forbidden);
        // the reply was consumed by keep-alive and the route handed back
        assert!(socket.take_reply().is_none());
        assert_eq!(socket.route(), owner);
        let mut saw_finished = false;
        while let Ok(ev) = owner_rx.try_recv() {
            saw_finished |= ev == SocketEvent::KeepAliveFinished;
        }
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn cancel_while_waiting() {
        let (ka, session, _noops, _rx) = setup(Duration::from_millis(500), 10, 10_000);
        ka.arm(session);
        while ka.mode() != KeepAliveMode::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let token = CancellationToken::new();
        token.cancel();
        let err = ka
            .wait_for_end(&token, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::Cancelled);
    }

    #[test]
    fn disabled_config_has_no_timing() {
        let cfg = KeepAliveConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(KeepAliveTiming::from_config(&cfg).is_none());
        assert!(KeepAliveTiming::from_config(&KeepAliveConfig::default()).is_some());
    }
}
