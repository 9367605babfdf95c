//! Data connection: one per LIST / RETR / STOR / keep-alive probe.
//!
//! Addressing is set up first (`set_passive` or `set_active`), then
//! `activate_connection` spawns a task that connects or accepts, wraps TLS
//! and MODE Z, and moves the bytes. The owner learns about progress through
//! `DataConnectionConnected` / `DataConnectionFinished` events and reads the
//! composite state through accessors.
//!
//! Invariants:
//! - counters are frozen once the connection is finished;
//! - cancelling closes the socket, the bytes received so far stay available
//!   through `give_data`, which hands them out exactly once.

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::proxy::{self, ProxyServerConfig};
use crate::ftp::socket::{BoxedStream, Dispatcher, SocketEvent, SocketUid};
use crate::ftp::tls;
use flate2::{Decompress, FlushDecompress, Status};
use rustls::ClientConfig;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 32 * 1024;
const WRITE_CHUNK: usize = 32 * 1024;
const INFLATE_CHUNK: usize = 64 * 1024;
/// Buffered bytes that trigger a write to the flush target.
const FLUSH_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    Download,
    Upload,
    List,
}

/// Composite error state of a data connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataConnectionError {
    pub network: Option<String>,
    pub low_memory: bool,
    pub target_file: Option<String>,
    pub tls: Option<String>,
    pub decompress: Option<String>,
}

impl DataConnectionError {
    pub fn is_ok(&self) -> bool {
        *self == Self::default()
    }

    /// Most significant failure as an [`FtpError`].
    pub fn to_ftp_error(&self) -> Option<FtpError> {
        if let Some(e) = &self.tls {
            return Some(FtpError::tls_failed(format!("Data connection: {}", e)));
        }
        if self.low_memory {
            return Some(FtpError::out_of_memory("Not enough memory for the data connection"));
        }
        if let Some(e) = &self.target_file {
            return Some(FtpError::io_error(format!("Cannot write target file: {}", e)));
        }
        if let Some(e) = &self.network {
            return Some(FtpError::data_channel(e.clone()));
        }
        self.decompress
            .as_ref()
            .map(|e| FtpError::transfer_failed(format!("MODE Z data is corrupt: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataCounters {
    /// Bytes read from the socket (compressed size with MODE Z).
    pub read_bytes: u64,
    /// Bytes written to the socket.
    pub written_bytes: u64,
    /// Payload bytes after decompression.
    pub payload_bytes: u64,
    /// Bytes written to the flush target.
    pub flushed_bytes: u64,
    pub last_activity: Option<Instant>,
}

/// Result of [`DataConnection::wait_for_finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishWait {
    Finished,
    Timeout,
    Cancelled,
}

#[derive(Debug, Default)]
struct DataState {
    buffer: Vec<u8>,
    counters: DataCounters,
    error: DataConnectionError,
    connected: bool,
    finished: bool,
    data_taken: bool,
}

type Shared = Arc<StdMutex<DataState>>;

fn lock(shared: &Shared) -> std::sync::MutexGuard<'_, DataState> {
    shared.lock().unwrap_or_else(|p| p.into_inner())
}

enum Addressing {
    Passive(SocketAddr),
    Active(TcpListener),
    /// Connection to a SOCKS proxy after the first BIND reply.
    SocksBind(TcpStream),
}

/// Fixed parameters of a data connection.
#[derive(Clone)]
pub struct DataConnectionParams {
    pub direction: DataDirection,
    /// Control-connection session id carried by the finish event.
    pub session_id: u64,
    pub dispatcher: Dispatcher,
    /// Route that receives the events.
    pub owner: SocketUid,
    /// FTP server as the control connection addresses it (SOCKS BIND target).
    pub server_host: String,
    pub server_port: u16,
    pub tunnel: Option<ProxyServerConfig>,
    pub connect_timeout: Duration,
    /// Longest silence on an open data connection.
    pub idle_timeout: Duration,
}

pub struct DataConnection {
    params: DataConnectionParams,
    addressing: Option<Addressing>,
    tls: Option<(Arc<ClientConfig>, String)>,
    compressed: bool,
    flush_target: Option<PathBuf>,
    upload_data: Option<Vec<u8>>,
    shared: Shared,
    finished_rx: watch::Receiver<bool>,
    finished_tx: Option<watch::Sender<bool>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("direction", &self.params.direction)
            .field("session_id", &self.params.session_id)
            .field("compressed", &self.compressed)
            .finish()
    }
}

impl DataConnection {
    /// `parent` is the transfer cancel token; cancelling it stops this
    /// connection.
    pub fn new(params: DataConnectionParams, parent: &CancellationToken) -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        Self {
            params,
            addressing: None,
            tls: None,
            compressed: false,
            flush_target: None,
            upload_data: None,
            shared: Arc::new(StdMutex::new(DataState::default())),
            finished_rx,
            finished_tx: Some(finished_tx),
            cancel: parent.child_token(),
            task: None,
        }
    }

    pub fn direction(&self) -> DataDirection {
        self.params.direction
    }

    pub fn session_id(&self) -> u64 {
        self.params.session_id
    }

    /// Connect to `addr` (from the PASV reply) on activation.
    pub fn set_passive(&mut self, addr: SocketAddr) {
        self.addressing = Some(Addressing::Passive(addr));
    }

    /// Listen for the server. Returns the address to announce with PORT.
    /// Through a SOCKS proxy the proxy listens instead (BIND).
    pub async fn set_active(&mut self, bind_ip: IpAddr) -> FtpResult<SocketAddr> {
        if let Some(tunnel) = self.params.tunnel.clone() {
            let mut tcp = connection::open_tcp(
                &tunnel.host,
                tunnel.effective_port(),
                None,
                self.params.connect_timeout,
            )
            .await?;
            let addr = proxy::socks_bind(
                &mut tcp,
                &tunnel,
                &self.params.server_host,
                self.params.server_port,
            )
            .await?;
            self.addressing = Some(Addressing::SocksBind(tcp));
            return Ok(addr);
        }
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
            .await
            .map_err(|e| FtpError::data_channel(format!("Cannot listen for data connection: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| FtpError::data_channel(format!("Listener address: {}", e)))?;
        self.addressing = Some(Addressing::Active(listener));
        Ok(addr)
    }

    pub fn set_tls(&mut self, config: Arc<ClientConfig>, server_name: impl Into<String>) {
        self.tls = Some((config, server_name.into()));
    }

    /// MODE Z: the stream is zlib-compressed.
    pub fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    /// Write received data to `path` as it arrives instead of keeping it.
    pub fn set_flush_target(&mut self, path: impl Into<PathBuf>) {
        self.flush_target = Some(path.into());
    }

    pub fn set_upload_data(&mut self, bytes: Vec<u8>) {
        self.upload_data = Some(bytes);
    }

    /// Start connecting (passive) or accepting (active) in the background.
    pub fn activate_connection(&mut self) -> FtpResult<()> {
        if self.task.is_some() {
            return Err(FtpError::data_channel("Data connection is already active"));
        }
        let addressing = self
            .addressing
            .take()
            .ok_or_else(|| FtpError::data_channel("Data connection has no address"))?;
        let finished_tx = self
            .finished_tx
            .take()
            .ok_or_else(|| FtpError::data_channel("Data connection was already used"))?;
        let job = Job {
            params: self.params.clone(),
            addressing,
            tls: self.tls.clone(),
            compressed: self.compressed,
            flush_target: self.flush_target.clone(),
            upload: self.upload_data.take(),
            shared: Arc::clone(&self.shared),
        };
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            let owner = job.params.owner;
            let session_id = job.params.session_id;
            let dispatcher = job.params.dispatcher.clone();
            let shared = Arc::clone(&job.shared);
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Data connection cancelled");
                }
                _ = job.run() => {}
            }
            lock(&shared).finished = true;
            let _ = finished_tx.send(true);
            dispatcher.post(owner, SocketEvent::DataConnectionFinished { session_id });
        }));
        Ok(())
    }

    /// `(transferring, finished)`: transferring is true while the connection
    /// is open and not finished.
    pub fn is_transfering(&self) -> (bool, bool) {
        let st = lock(&self.shared);
        (st.connected && !st.finished, st.finished)
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.shared).finished
    }

    /// Received bytes and whether decompression failed. Returns `None` after
    /// the first call.
    pub fn give_data(&self) -> Option<(Vec<u8>, bool)> {
        let mut st = lock(&self.shared);
        if st.data_taken {
            return None;
        }
        st.data_taken = true;
        let data = std::mem::take(&mut st.buffer);
        Some((data, st.error.decompress.is_some()))
    }

    /// Close the socket and stop writing to the flush target.
    pub fn cancel_connection_and_flushing(&self) {
        self.cancel.cancel();
    }

    pub fn get_error(&self) -> DataConnectionError {
        lock(&self.shared).error.clone()
    }

    pub fn counters(&self) -> DataCounters {
        lock(&self.shared).counters
    }

    /// Wait until the transfer task finishes.
    pub async fn wait_for_finish(
        &self,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> FinishWait {
        if self.task.is_none() {
            return FinishWait::Finished;
        }
        let mut rx = self.finished_rx.clone();
        let wait = async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            biased;
            _ = wait => FinishWait::Finished,
            _ = cancel.cancelled() => FinishWait::Cancelled,
            _ = tokio::time::sleep(limit) => FinishWait::Timeout,
        }
    }
}

impl Drop for DataConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Transfer task ───────────────────────────────────────────────────

struct Job {
    params: DataConnectionParams,
    addressing: Addressing,
    tls: Option<(Arc<ClientConfig>, String)>,
    compressed: bool,
    flush_target: Option<PathBuf>,
    upload: Option<Vec<u8>>,
    shared: Shared,
}

impl Job {
    async fn run(mut self) {
        let stream = match self.open().await {
            Ok(s) => s,
            Err(e) => {
                let mut st = lock(&self.shared);
                match e.kind {
                    crate::ftp::error::FtpErrorKind::TlsFailed => st.error.tls = Some(e.message),
                    _ => st.error.network = Some(e.message),
                }
                return;
            }
        };
        {
            let mut st = lock(&self.shared);
            st.connected = true;
            st.counters.last_activity = Some(Instant::now());
        }
        self.params
            .dispatcher
            .post(self.params.owner, SocketEvent::DataConnectionConnected);

        match self.params.direction {
            DataDirection::Upload => self.send_all(stream).await,
            DataDirection::Download | DataDirection::List => self.receive_all(stream).await,
        }
    }

    async fn open(&mut self) -> FtpResult<BoxedStream> {
        let connect_timeout = self.params.connect_timeout;
        let addressing = std::mem::replace(
            &mut self.addressing,
            Addressing::Passive(SocketAddr::from(([0, 0, 0, 0], 0))),
        );
        let tcp = match addressing {
            Addressing::Passive(addr) => {
                connection::open_tcp(
                    &addr.ip().to_string(),
                    addr.port(),
                    self.params.tunnel.as_ref(),
                    connect_timeout,
                )
                .await?
            }
            Addressing::Active(listener) => {
                let (tcp, peer) = timeout(connect_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::timeout("Server did not open the data connection"))?
                    .map_err(|e| FtpError::data_channel(format!("Accept failed: {}", e)))?;
                log::debug!("Data connection accepted from {}", peer);
                tcp
            }
            Addressing::SocksBind(mut tcp) => {
                let proxy_type = self
                    .params
                    .tunnel
                    .as_ref()
                    .map(|t| t.proxy_type)
                    .unwrap_or_default();
                timeout(connect_timeout, proxy::socks_accept_bind(&mut tcp, proxy_type))
                    .await
                    .map_err(|_| FtpError::timeout("Server did not connect to the proxy"))??;
                tcp
            }
        };
        match &self.tls {
            Some((config, name)) => {
                tls::connect_tls(Arc::clone(config), name, Box::new(tcp), "data connection").await
            }
            None => Ok(Box::new(tcp)),
        }
    }

    async fn receive_all(&mut self, mut stream: BoxedStream) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut inflater = self.compressed.then(|| Decompress::new(true));
        let mut inflate_done = false;
        let mut target: Option<tokio::fs::File> = None;

        loop {
            let n = match timeout(self.params.idle_timeout, stream.read(&mut chunk)).await {
                Err(_) => {
                    lock(&self.shared).error.network =
                        Some("No data received within the timeout".to_string());
                    break;
                }
                Ok(Err(e)) => {
                    self.record_read_error(&e);
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };
            let input = &chunk[..n];

            let payload: Vec<u8> = match inflater.as_mut() {
                Some(_) if inflate_done => Vec::new(),
                Some(d) => {
                    let mut out = Vec::new();
                    match inflate(d, input, &mut out) {
                        Ok(end) => {
                            inflate_done = end;
                            out
                        }
                        Err(InflateError::Memory) => {
                            lock(&self.shared).error.low_memory = true;
                            break;
                        }
                        Err(InflateError::Corrupt(msg)) => {
                            log::warn!("MODE Z decompression failed: {}", msg);
                            lock(&self.shared).error.decompress = Some(msg);
                            inflate_done = true;
                            out
                        }
                    }
                }
                None => input.to_vec(),
            };

            let to_flush = {
                let mut st = lock(&self.shared);
                st.counters.read_bytes += n as u64;
                st.counters.payload_bytes += payload.len() as u64;
                st.counters.last_activity = Some(Instant::now());
                if st.buffer.try_reserve(payload.len()).is_err() {
                    st.error.low_memory = true;
                    break;
                }
                st.buffer.extend_from_slice(&payload);
                if self.flush_target.is_some() && st.buffer.len() >= FLUSH_THRESHOLD {
                    Some(std::mem::take(&mut st.buffer))
                } else {
                    None
                }
            };
            if let Some(bytes) = to_flush {
                if !self.flush(&mut target, &bytes).await {
                    break;
                }
            }
        }

        let rest = {
            let mut st = lock(&self.shared);
            if self.flush_target.is_some() && !st.buffer.is_empty() && st.error.target_file.is_none() {
                Some(std::mem::take(&mut st.buffer))
            } else {
                None
            }
        };
        if let Some(bytes) = rest {
            self.flush(&mut target, &bytes).await;
        }
        if let Some(mut f) = target {
            if let Err(e) = f.flush().await {
                lock(&self.shared).error.target_file = Some(e.to_string());
            }
        }
        let _ = stream.shutdown().await;
    }

    /// Append to the flush target; `false` stops the transfer.
    async fn flush(&self, target: &mut Option<tokio::fs::File>, bytes: &[u8]) -> bool {
        let Some(path) = &self.flush_target else {
            return true;
        };
        let res = match target {
            Some(f) => f.write_all(bytes).await,
            None => match tokio::fs::File::create(path).await {
                Ok(mut f) => {
                    let written = f.write_all(bytes).await;
                    *target = Some(f);
                    written
                }
                Err(e) => Err(e),
            },
        };
        let mut st = lock(&self.shared);
        match res {
            Ok(()) => {
                st.counters.flushed_bytes += bytes.len() as u64;
                true
            }
            Err(e) => {
                log::warn!("Writing {} failed: {}", path.display(), e);
                st.error.target_file = Some(e.to_string());
                // keep the unwritten bytes for give_data
                let mut kept = bytes.to_vec();
                kept.append(&mut st.buffer);
                st.buffer = kept;
                false
            }
        }
    }

    fn record_read_error(&self, e: &std::io::Error) {
        let mut st = lock(&self.shared);
        let text = e.to_string();
        // rustls reports its failures as InvalidData
        if e.kind() == std::io::ErrorKind::InvalidData && self.tls.is_some() {
            st.error.tls = Some(text);
        } else {
            st.error.network = Some(text);
        }
    }

    async fn send_all(&mut self, mut stream: BoxedStream) {
        let data = self.upload.take().unwrap_or_default();
        let wire = if self.compressed {
            let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            match enc.write_all(&data).and_then(|_| enc.finish()) {
                Ok(v) => v,
                Err(e) => {
                    lock(&self.shared).error.decompress = Some(e.to_string());
                    return;
                }
            }
        } else {
            data
        };
        for piece in wire.chunks(WRITE_CHUNK) {
            let res = timeout(self.params.idle_timeout, stream.write_all(piece)).await;
            let mut st = lock(&self.shared);
            match res {
                Ok(Ok(())) => {
                    st.counters.written_bytes += piece.len() as u64;
                    st.counters.last_activity = Some(Instant::now());
                }
                Ok(Err(e)) => {
                    st.error.network = Some(e.to_string());
                    return;
                }
                Err(_) => {
                    st.error.network = Some("Server stopped accepting data".to_string());
                    return;
                }
            }
        }
        if let Err(e) = stream.shutdown().await {
            lock(&self.shared).error.network = Some(e.to_string());
        }
    }
}

enum InflateError {
    Memory,
    Corrupt(String),
}

/// Inflate `input` into `out`. Returns `true` at the end of the zlib stream.
fn inflate(d: &mut Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<bool, InflateError> {
    let mut pos = 0;
    loop {
        if out.capacity() - out.len() < INFLATE_CHUNK {
            out.try_reserve(INFLATE_CHUNK).map_err(|_| InflateError::Memory)?;
        }
        let in_before = d.total_in();
        let out_before = d.total_out();
        let status = d
            .decompress_vec(&input[pos..], out, FlushDecompress::None)
            .map_err(|e| InflateError::Corrupt(e.to_string()))?;
        pos += (d.total_in() - in_before) as usize;
        if status == Status::StreamEnd {
            return Ok(true);
        }
        let progressed = d.total_out() != out_before || d.total_in() != in_before;
        if pos >= input.len() && (out.len() < out.capacity() || !progressed) {
            return Ok(false);
        }
        if !progressed {
            return Err(InflateError::Corrupt("no progress".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn params(dir: DataDirection, d: &Dispatcher, owner: SocketUid) -> DataConnectionParams {
        DataConnectionParams {
            direction: dir,
            session_id: 3,
            dispatcher: d.clone(),
            owner,
            server_host: "127.0.0.1".into(),
            server_port: 21,
            tunnel: None,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn next_event(rx: &mut UnboundedReceiver<SocketEvent>) -> SocketEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn passive_download() {
        let d = Dispatcher::new();
        let (owner, mut rx) = d.register();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"line one\r\nline two\r\n").await.unwrap();
        });

        let token = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::List, &d, owner), &token);
        dc.set_passive(addr);
        dc.activate_connection().unwrap();
        assert_eq!(next_event(&mut rx).await, SocketEvent::DataConnectionConnected);
        assert_eq!(
            next_event(&mut rx).await,
            SocketEvent::DataConnectionFinished { session_id: 3 }
        );
        assert_eq!(dc.is_transfering(), (false, true));
        assert!(dc.get_error().is_ok());
        assert_eq!(dc.counters().read_bytes, 20);
        let (data, decompr_err) = dc.give_data().unwrap();
        assert_eq!(data, b"line one\r\nline two\r\n");
        assert!(!decompr_err);
        assert!(dc.give_data().is_none());
    }

    #[tokio::test]
    async fn active_upload_with_mode_z() {
        let d = Dispatcher::new();
        let (owner, _rx) = d.register();
        let token = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::Upload, &d, owner), &token);
        let addr = dc.set_active("127.0.0.1".parse().unwrap()).await.unwrap();
        dc.set_compressed(true);
        dc.set_upload_data(b"hello hello hello hello".to_vec());
        dc.activate_connection().unwrap();

        let mut s = TcpStream::connect(addr).await.unwrap();
        let mut wire = Vec::new();
        s.read_to_end(&mut wire).await.unwrap();
        let mut plain = Vec::new();
        flate2::read::ZlibDecoder::new(&wire[..])
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, b"hello hello hello hello");

        assert_eq!(
            dc.wait_for_finish(Duration::from_secs(5), &CancellationToken::new()).await,
            FinishWait::Finished
        );
        assert_eq!(dc.counters().written_bytes, wire.len() as u64);
    }

    #[tokio::test]
    async fn mode_z_download_and_flush_to_file() {
        let d = Dispatcher::new();
        let (owner, _rx) = d.register();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(&payload).unwrap();
        let wire = enc.finish().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(&wire).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let token = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::Download, &d, owner), &token);
        dc.set_passive(addr);
        dc.set_compressed(true);
        dc.set_flush_target(&target);
        dc.activate_connection().unwrap();
        assert_eq!(
            dc.wait_for_finish(Duration::from_secs(5), &CancellationToken::new()).await,
            FinishWait::Finished
        );
        assert!(dc.get_error().is_ok());
        assert_eq!(dc.counters().payload_bytes, payload.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
        assert_eq!(dc.give_data().unwrap().0.len(), 0);
    }

    #[tokio::test]
    async fn unwritable_target_keeps_received_bytes() {
        let d = Dispatcher::new();
        let (owner, _rx) = d.register();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sent = payload.clone();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let _ = s.write_all(&sent).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("out.bin");
        let token = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::Download, &d, owner), &token);
        dc.set_passive(addr);
        dc.set_flush_target(&target);
        dc.activate_connection().unwrap();
        assert_eq!(
            dc.wait_for_finish(Duration::from_secs(5), &CancellationToken::new()).await,
            FinishWait::Finished
        );
        assert!(dc.get_error().target_file.is_some());
        assert_eq!(dc.counters().flushed_bytes, 0);
        let (data, _) = dc.give_data().unwrap();
        assert!(data.len() >= FLUSH_THRESHOLD);
        assert_eq!(data, payload[..data.len()]);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn cancel_keeps_received_bytes() {
        let d = Dispatcher::new();
        let (owner, mut rx) = d.register();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"partial").await.unwrap();
            let _ = sent_tx.send(());
            // keep the connection open
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transfer = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::Download, &d, owner), &transfer);
        dc.set_passive(addr);
        dc.activate_connection().unwrap();
        sent_rx.await.unwrap();
        while dc.counters().read_bytes < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transfer.cancel();
        loop {
            if let SocketEvent::DataConnectionFinished { .. } = next_event(&mut rx).await {
                break;
            }
        }
        let frozen = dc.counters().read_bytes;
        assert_eq!(dc.give_data().unwrap().0, b"partial");
        assert_eq!(dc.counters().read_bytes, frozen);
    }

    #[tokio::test]
    async fn connect_failure_sets_network_error() {
        let d = Dispatcher::new();
        let (owner, _rx) = d.register();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let token = CancellationToken::new();
        let mut dc = DataConnection::new(params(DataDirection::List, &d, owner), &token);
        dc.set_passive(addr);
        dc.activate_connection().unwrap();
        dc.wait_for_finish(Duration::from_secs(5), &CancellationToken::new()).await;
        let err = dc.get_error();
        assert!(err.network.is_some());
        assert_eq!(
            err.to_ftp_error().unwrap().kind,
            crate::ftp::error::FtpErrorKind::DataChannelFailed
        );
    }

    #[test]
    fn inflate_handles_split_input() {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"abcabcabcabc").unwrap();
        let wire = enc.finish().unwrap();
        let mut d = Decompress::new(true);
        let mut out = Vec::new();
        let (a, b) = wire.split_at(wire.len() / 2);
        assert!(matches!(inflate(&mut d, a, &mut out), Ok(false)));
        assert!(matches!(inflate(&mut d, b, &mut out), Ok(true)));
        assert_eq!(out, b"abcabcabcabc");
    }

    #[test]
    fn corrupt_stream_is_reported() {
        let mut d = Decompress::new(true);
        let mut out = Vec::new();
        assert!(matches!(
            inflate(&mut d, b"not zlib at all", &mut out),
            Err(InflateError::Corrupt(_))
        ));
    }
}
