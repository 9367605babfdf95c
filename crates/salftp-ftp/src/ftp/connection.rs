//! TCP (+ proxy tunnel) (+ TLS) transport.
//!
//! Opens control and data streams. Tunnel proxies (SOCKS, HTTP CONNECT) are
//! negotiated here; FTP-level proxies only change the host the control
//! connection dials, which the caller takes from the proxy script.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::proxy::{self, ProxyServerConfig};
use crate::ftp::socket::BoxedStream;
use crate::ftp::tls;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// An open stream plus the addresses the FTP layer needs.
pub struct OpenedStream {
    pub stream: BoxedStream,
    /// Local end of the TCP connection (PORT uses its IP).
    pub local_addr: SocketAddr,
    /// Remote end of the TCP connection (the proxy when tunnelled).
    pub peer_addr: SocketAddr,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Tunnel proxy to use for `proxy`, if it is one.
pub fn tunnel_of(proxy: Option<&ProxyServerConfig>) -> Option<&ProxyServerConfig> {
    proxy.filter(|p| p.proxy_type.is_tunnel())
}

/// Connect to `host:port`, through `tunnel` when given.
pub async fn open_tcp(
    host: &str,
    port: u16,
    tunnel: Option<&ProxyServerConfig>,
    connect_timeout: Duration,
) -> FtpResult<TcpStream> {
    let (dial_host, dial_port) = match tunnel {
        Some(p) => (p.host.as_str(), p.effective_port()),
        None => (host, port),
    };
    let addr = format!("{}:{}", dial_host, dial_port);

    let work = async {
        let mut tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        if let Some(p) = tunnel {
            proxy::open_tunnel(&mut tcp, p, host, port).await?;
        }
        Ok::<_, FtpError>(tcp)
    };
    timeout(connect_timeout, work)
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
}

/// Open a control connection. With `implicit_tls` the handshake runs before
/// the banner is read.
pub async fn connect_control(
    host: &str,
    port: u16,
    tunnel: Option<&ProxyServerConfig>,
    connect_timeout: Duration,
    implicit_tls: Option<(Arc<ClientConfig>, &str)>,
) -> FtpResult<OpenedStream> {
    let tcp = open_tcp(host, port, tunnel, connect_timeout).await?;
    let local_addr = tcp.local_addr()?;
    let peer_addr = tcp.peer_addr()?;
    log::debug!("Control connection {} -> {}", local_addr, peer_addr);

    let stream: BoxedStream = match implicit_tls {
        Some((config, server_name)) => {
            timeout(
                connect_timeout,
                tls::connect_tls(config, server_name, Box::new(tcp), "control connection"),
            )
            .await
            .map_err(|_| FtpError::timeout("Implicit TLS handshake timed out"))??
        }
        None => Box::new(tcp),
    };
    Ok(OpenedStream {
        stream,
        local_addr,
        peer_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::proxy::ProxyType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"220 hi\r\n").await.unwrap();
        });
        let mut opened = connect_control("127.0.0.1", port, None, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(opened.peer_addr.port(), port);
        let mut buf = [0u8; 8];
        opened.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"220 hi\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = open_tcp("127.0.0.1", port, None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn http_tunnel_is_negotiated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut byte = [0u8; 1];
            while !req.ends_with(b"\r\n\r\n") {
                s.read_exact(&mut byte).await.unwrap();
                req.push(byte[0]);
            }
            s.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(req).unwrap()
        });
        let mut proxy = ProxyServerConfig::new("p", ProxyType::Http11, "127.0.0.1");
        proxy.port = Some(port);
        assert!(tunnel_of(Some(&proxy)).is_some());
        open_tcp("ftp.example.com", 21, Some(&proxy), Duration::from_secs(5))
            .await
            .unwrap();
        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT ftp.example.com:21 HTTP/1.1\r\n"));
    }

    #[test]
    fn ftp_proxies_are_not_tunnels() {
        let proxy = ProxyServerConfig::new("p", ProxyType::OpenHostPort, "fw");
        assert!(tunnel_of(Some(&proxy)).is_none());
    }
}
