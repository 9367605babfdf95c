//! Socket event core.
//!
//! One dispatcher task owns all timers and routes [`SocketEvent`]s to the
//! registered owners. Sockets never call into their owners: the reader task
//! appends to a shared buffer and posts an event, the owner drains the
//! buffer when it processes the event. Writes are queued to a writer task so
//! `send` never blocks.
//!
//! The per-socket buffer lock is never held while posting to the dispatcher.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol;
use crate::ftp::types::FtpReply;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifies an event route (an owner registered with the dispatcher).
pub type SocketUid = u32;
pub type TimerId = u32;

/// Error text of the `Closed` event reported when the route itself is gone.
pub const ROUTE_CLOSED: &str = "event route closed";

/// Size of one socket read.
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    NewBytesRead,
    Closed { error: Option<String> },
    Timer(TimerId),
    DataConnectionConnected,
    DataConnectionFinished { session_id: u64 },
    KeepAliveFinished,
}

// ─── Dispatcher ──────────────────────────────────────────────────────

enum Command {
    Register(SocketUid, UnboundedSender<SocketEvent>),
    Unregister(SocketUid),
    Post(SocketUid, SocketEvent),
    AddTimer(SocketUid, Instant, TimerId),
    DeleteTimer(SocketUid, TimerId),
}

/// Handle to the dispatcher task. Cheap to clone; the task stops when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    tx: UnboundedSender<Command>,
    next_uid: Arc<AtomicU32>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("next_uid", &self.next_uid.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the dispatcher task. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(rx));
        Self {
            tx,
            next_uid: Arc::new(AtomicU32::new(1)),
        }
    }

    /// New route; events posted to the returned uid arrive on the receiver.
    pub fn register(&self) -> (SocketUid, UnboundedReceiver<SocketEvent>) {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Command::Register(uid, tx));
        (uid, rx)
    }

    /// Drops the route and all of its timers.
    pub fn unregister(&self, uid: SocketUid) {
        let _ = self.tx.send(Command::Unregister(uid));
    }

    pub fn post(&self, uid: SocketUid, event: SocketEvent) {
        let _ = self.tx.send(Command::Post(uid, event));
    }

    /// Fire `Timer(id)` at `due`. Replaces a pending timer with the same
    /// owner and id.
    pub fn add_timer(&self, owner: SocketUid, due: Instant, id: TimerId) {
        let _ = self.tx.send(Command::AddTimer(owner, due, id));
    }

    pub fn add_timer_after(&self, owner: SocketUid, after: Duration, id: TimerId) {
        self.add_timer(owner, Instant::now() + after, id);
    }

    pub fn delete_timer(&self, owner: SocketUid, id: TimerId) {
        let _ = self.tx.send(Command::DeleteTimer(owner, id));
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_dispatcher(mut rx: UnboundedReceiver<Command>) {
    let mut routes: HashMap<SocketUid, UnboundedSender<SocketEvent>> = HashMap::new();
    let mut timers: HashMap<(SocketUid, TimerId), Instant> = HashMap::new();

    loop {
        let next_due = timers.values().min().copied();
        let cmd = match next_due {
            Some(due) => {
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(due) => {
                        let now = Instant::now();
                        let expired: Vec<_> = timers
                            .iter()
                            .filter(|(_, due)| **due <= now)
                            .map(|(key, _)| *key)
                            .collect();
                        for (owner, id) in expired {
                            timers.remove(&(owner, id));
                            if let Some(route) = routes.get(&owner) {
                                let _ = route.send(SocketEvent::Timer(id));
                            }
                        }
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match cmd {
            None => break,
            Some(Command::Register(uid, tx)) => {
                routes.insert(uid, tx);
            }
            Some(Command::Unregister(uid)) => {
                routes.remove(&uid);
                timers.retain(|(owner, _), _| *owner != uid);
            }
            Some(Command::Post(uid, event)) => match routes.get(&uid) {
                Some(route) => {
                    if route.send(event).is_err() {
                        routes.remove(&uid);
                    }
                }
                None => log::trace!("Dropping {:?} for unknown route {}", event, uid),
            },
            Some(Command::AddTimer(owner, due, id)) => {
                timers.insert((owner, id), due);
            }
            Some(Command::DeleteTimer(owner, id)) => {
                timers.remove(&(owner, id));
            }
        }
    }
    log::trace!("Socket dispatcher stopped");
}

// ─── Event socket ────────────────────────────────────────────────────

/// Any byte stream an [`EventSocket`] can own (TCP, TLS over TCP, proxied).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Default)]
struct SocketBuffer {
    data: Vec<u8>,
    closed: bool,
    error: Option<String>,
}

#[derive(Debug)]
struct SocketShared {
    buffer: StdMutex<SocketBuffer>,
    route: AtomicU32,
    connected: AtomicBool,
}

impl SocketShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SocketBuffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Stream driven by background reader/writer tasks that report through the
/// dispatcher.
pub struct EventSocket {
    shared: Arc<SocketShared>,
    dispatcher: Dispatcher,
    write_tx: StdMutex<Option<UnboundedSender<Vec<u8>>>>,
    stop_reading: CancellationToken,
    tasks: StdMutex<SocketTasks>,
}

#[derive(Default)]
struct SocketTasks {
    reader: Option<JoinHandle<ReadHalf<BoxedStream>>>,
    writer: Option<JoinHandle<WriteHalf<BoxedStream>>>,
}

impl std::fmt::Debug for EventSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSocket")
            .field("route", &self.route())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl EventSocket {
    /// Start the reader and writer tasks; `Connected` is posted to `route`.
    pub fn new(stream: BoxedStream, dispatcher: Dispatcher, route: SocketUid) -> Self {
        let shared = Arc::new(SocketShared {
            buffer: StdMutex::new(SocketBuffer::default()),
            route: AtomicU32::new(route),
            connected: AtomicBool::new(true),
        });
        let (rd, wr) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let stop_reading = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            rd,
            Arc::clone(&shared),
            dispatcher.clone(),
            stop_reading.clone(),
        ));
        let writer = tokio::spawn(write_loop(wr, write_rx, Arc::clone(&shared), dispatcher.clone()));

        dispatcher.post(route, SocketEvent::Connected);
        Self {
            shared,
            dispatcher,
            write_tx: StdMutex::new(Some(write_tx)),
            stop_reading,
            tasks: StdMutex::new(SocketTasks {
                reader: Some(reader),
                writer: Some(writer),
            }),
        }
    }

    pub fn route(&self) -> SocketUid {
        self.shared.route.load(Ordering::Acquire)
    }

    /// Redirect future events to another owner (keep-alive borrows the
    /// control socket this way).
    pub fn set_route(&self, uid: SocketUid) {
        self.shared.route.store(uid, Ordering::Release);
    }

    /// Queue bytes for writing.
    pub fn send_bytes(&self, bytes: Vec<u8>) -> FtpResult<()> {
        if !self.is_connected() {
            return Err(FtpError::disconnected("Socket is closed"));
        }
        let tx = self.write_tx.lock().unwrap_or_else(|p| p.into_inner());
        match tx.as_ref() {
            Some(tx) => tx
                .send(bytes)
                .map_err(|_| FtpError::disconnected("Socket writer has stopped")),
            None => Err(FtpError::disconnected("Socket is closed")),
        }
    }

    /// Queue one command line (CRLF appended).
    pub fn send_line(&self, line: &str) -> FtpResult<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.send_bytes(bytes)
    }

    /// Cut one complete FTP reply from the read buffer.
    pub fn take_reply(&self) -> Option<FtpReply> {
        let mut buf = self.shared.lock();
        let (reply, used) = protocol::read_ftp_reply(&buf.data)?;
        buf.data.drain(..used);
        Some(reply)
    }

    /// Take every byte read so far.
    pub fn take_bytes(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().data)
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.lock().data.len()
    }

    /// The peer closed the stream or a read failed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn close_error(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Close the stream. Buffered bytes stay readable. Idempotent.
    pub fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.stop_reading.cancel();
        self.write_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(r) = tasks.reader.take() {
            r.abort();
        }
        if let Some(w) = tasks.writer.take() {
            w.abort();
        }
    }

    /// Stop the tasks after flushing queued writes and hand the stream back
    /// (used to start TLS on the control connection).
    pub async fn detach(self) -> FtpResult<BoxedStream> {
        self.write_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.stop_reading.cancel();
        let (reader, writer) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            (tasks.reader.take(), tasks.writer.take())
        };
        self.shared.connected.store(false, Ordering::Release);
        let wr = match writer {
            Some(w) => w
                .await
                .map_err(|e| FtpError::io_error(format!("Socket writer failed: {}", e)))?,
            None => return Err(FtpError::disconnected("Socket is closed")),
        };
        let rd = match reader {
            Some(r) => r
                .await
                .map_err(|e| FtpError::io_error(format!("Socket reader failed: {}", e)))?,
            None => return Err(FtpError::disconnected("Socket is closed")),
        };
        if self.buffered_len() > 0 {
            log::warn!("Discarding {} unread bytes on socket detach", self.buffered_len());
        }
        Ok(rd.unsplit(wr))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl Drop for EventSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut rd: ReadHalf<BoxedStream>,
    shared: Arc<SocketShared>,
    dispatcher: Dispatcher,
    stop: CancellationToken,
) -> ReadHalf<BoxedStream> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => return rd,
            r = rd.read(&mut chunk) => r,
        };
        let event = match read {
            Ok(0) => {
                shared.lock().closed = true;
                SocketEvent::Closed { error: None }
            }
            Ok(n) => {
                shared.lock().data.extend_from_slice(&chunk[..n]);
                dispatcher.post(shared.route.load(Ordering::Acquire), SocketEvent::NewBytesRead);
                continue;
            }
            Err(e) => {
                let mut buf = shared.lock();
                buf.closed = true;
                buf.error = Some(e.to_string());
                SocketEvent::Closed {
                    error: Some(e.to_string()),
                }
            }
        };
        shared.connected.store(false, Ordering::Release);
        dispatcher.post(shared.route.load(Ordering::Acquire), event);
        return rd;
    }
}

async fn write_loop(
    mut wr: WriteHalf<BoxedStream>,
    mut rx: UnboundedReceiver<Vec<u8>>,
    shared: Arc<SocketShared>,
    dispatcher: Dispatcher,
) -> WriteHalf<BoxedStream> {
    while let Some(bytes) = rx.recv().await {
        let res = match wr.write_all(&bytes).await {
            Ok(()) => wr.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            {
                let mut buf = shared.lock();
                buf.closed = true;
                buf.error = Some(e.to_string());
            }
            shared.connected.store(false, Ordering::Release);
            dispatcher.post(
                shared.route.load(Ordering::Acquire),
                SocketEvent::Closed {
                    error: Some(e.to_string()),
                },
            );
            break;
        }
    }
    wr
}

// ─── Waiting ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Event(SocketEvent),
    Timeout,
    /// The user cancelled; `pending` is an event that was already queued.
    Cancelled { pending: Option<SocketEvent> },
}

/// Wait for the next routed event, a timeout or cancellation. A ready event
/// always wins over cancellation.
pub async fn wait_for_event_or_cancel(
    rx: &mut UnboundedReceiver<SocketEvent>,
    timeout: Duration,
    token: &CancellationToken,
) -> WaitOutcome {
    tokio::select! {
        biased;
        ev = rx.recv() => match ev {
            Some(e) => WaitOutcome::Event(e),
            None => WaitOutcome::Event(SocketEvent::Closed {
                error: Some(ROUTE_CLOSED.to_string()),
            }),
        },
        _ = token.cancelled() => WaitOutcome::Cancelled { pending: rx.try_recv().ok() },
        _ = tokio::time::sleep(timeout) => WaitOutcome::Timeout,
    }
}

/// Cancellation for one logical operation. Cancelling the operation also
/// cancels the current transfer; cancelling the transfer only stops the
/// data connection.
#[derive(Debug, Clone)]
pub struct OperationCancel {
    operation: CancellationToken,
    transfer: CancellationToken,
}

impl OperationCancel {
    pub fn new() -> Self {
        let operation = CancellationToken::new();
        let transfer = operation.child_token();
        Self { operation, transfer }
    }

    pub fn operation(&self) -> &CancellationToken {
        &self.operation
    }

    pub fn transfer(&self) -> &CancellationToken {
        &self.transfer
    }

    pub fn abort_operation(&self) {
        self.operation.cancel();
    }

    pub fn abort_transfer(&self) {
        self.transfer.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.is_cancelled()
    }

    /// Fresh transfer token for the next transfer of the same operation.
    pub fn reset_transfer(&mut self) {
        if !self.operation.is_cancelled() {
            self.transfer = self.operation.child_token();
        }
    }
}

impl Default for OperationCancel {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Capability traits ───────────────────────────────────────────────

/// What the control connection needs from its socket.
pub trait TransportSocket: Send + Sync {
    fn send(&self, bytes: &[u8]) -> FtpResult<()>;
    fn close(&self);
    fn is_connected(&self) -> bool;
}

impl TransportSocket for EventSocket {
    fn send(&self, bytes: &[u8]) -> FtpResult<()> {
        self.send_bytes(bytes.to_vec())
    }

    fn close(&self) {
        EventSocket::close(self)
    }

    fn is_connected(&self) -> bool {
        EventSocket::is_connected(self)
    }
}

/// Callbacks into whatever shows progress to the user. All methods have
/// no-op defaults.
pub trait CommandUserInterface: Send + Sync {
    /// A blocking operation started; `text` describes it.
    fn show_wait(&self, _text: &str) {}
    fn hide_wait(&self) {}
    /// Progress line (command sent, reply received, retry countdown).
    fn progress(&self, _text: &str) {}
    /// Value a login script needs (`User`, `Password`, …); `None` cancels.
    fn ask_value(&self, _variable: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserInterface;

impl CommandUserInterface for NoUserInterface {}

/// Sends everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingUserInterface;

impl CommandUserInterface for LoggingUserInterface {
    fn show_wait(&self, text: &str) {
        log::info!("{}", text);
    }

    fn progress(&self, text: &str) {
        log::debug!("{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn timer_replaced_fires_once() {
        let d = Dispatcher::new();
        let (uid, mut rx) = d.register();
        d.add_timer_after(uid, Duration::from_millis(20), 7);
        d.add_timer_after(uid, Duration::from_millis(60), 7);
        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(SocketEvent::Timer(7)));
        let second = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn deleted_timer_never_fires() {
        let d = Dispatcher::new();
        let (uid, mut rx) = d.register();
        d.add_timer_after(uid, Duration::from_millis(20), 1);
        d.delete_timer(uid, 1);
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn socket_reads_replies_and_writes_lines() {
        let d = Dispatcher::new();
        let (uid, mut rx) = d.register();
        let (client, mut server) = duplex(1024);
        let sock = EventSocket::new(Box::new(client), d.clone(), uid);
        assert_eq!(rx.recv().await, Some(SocketEvent::Connected));

        server.write_all(b"220-hello\r\n220 ready\r\n").await.unwrap();
        let mut reply = None;
        while reply.is_none() {
            assert_eq!(rx.recv().await, Some(SocketEvent::NewBytesRead));
            reply = sock.take_reply();
        }
        let reply = reply.unwrap();
        assert_eq!(reply.code, Some(220));
        assert_eq!(reply.lines.len(), 2);

        sock.send_line("NOOP").unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NOOP\r\n");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_peer_close_is_reported() {
        let d = Dispatcher::new();
        let (uid, mut rx) = d.register();
        let (client, server) = duplex(64);
        let sock = EventSocket::new(Box::new(client), d.clone(), uid);
        assert_eq!(rx.recv().await, Some(SocketEvent::Connected));
        drop(server);
        assert_eq!(rx.recv().await, Some(SocketEvent::Closed { error: None }));
        assert!(sock.is_closed());
        sock.close();
        sock.close();
        assert!(sock.send_line("QUIT").is_err());
    }

    #[tokio::test]
    async fn route_can_be_borrowed() {
        let d = Dispatcher::new();
        let (a, mut rx_a) = d.register();
        let (b, mut rx_b) = d.register();
        let (client, mut server) = duplex(64);
        let sock = EventSocket::new(Box::new(client), d.clone(), a);
        assert_eq!(rx_a.recv().await, Some(SocketEvent::Connected));
        sock.set_route(b);
        server.write_all(b"200 ok\r\n").await.unwrap();
        assert_eq!(rx_b.recv().await, Some(SocketEvent::NewBytesRead));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn detach_returns_the_stream() {
        let d = Dispatcher::new();
        let (uid, _rx) = d.register();
        let (client, mut server) = duplex(64);
        let sock = EventSocket::new(Box::new(client), d, uid);
        sock.send_line("AUTH TLS").unwrap();
        let mut stream = sock.detach().await.unwrap();
        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AUTH TLS\r\n");
        stream.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        server.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"x");
    }

    #[tokio::test]
    async fn cancellation_reports_pending_event() {
        let d = Dispatcher::new();
        let (uid, mut rx) = d.register();
        let token = CancellationToken::new();
        d.post(uid, SocketEvent::KeepAliveFinished);
        // Let the dispatcher deliver before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let out = wait_for_event_or_cancel(&mut rx, Duration::from_secs(1), &token).await;
        // A ready event wins over cancellation.
        assert_eq!(out, WaitOutcome::Event(SocketEvent::KeepAliveFinished));

        let out = wait_for_event_or_cancel(&mut rx, Duration::from_secs(1), &token).await;
        assert_eq!(out, WaitOutcome::Cancelled { pending: None });
    }

    #[tokio::test]
    async fn wait_times_out() {
        let d = Dispatcher::new();
        let (_uid, mut rx) = d.register();
        let token = CancellationToken::new();
        let out = wait_for_event_or_cancel(&mut rx, Duration::from_millis(10), &token).await;
        assert_eq!(out, WaitOutcome::Timeout);
    }

    #[test]
    fn transfer_cancel_is_a_child_of_operation_cancel() {
        let mut c = OperationCancel::new();
        c.abort_transfer();
        assert!(c.transfer().is_cancelled());
        assert!(!c.is_cancelled());
        c.reset_transfer();
        assert!(!c.transfer().is_cancelled());
        c.abort_operation();
        assert!(c.transfer().is_cancelled());
    }
}
