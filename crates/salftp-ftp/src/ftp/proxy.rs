//! Proxy servers and connect scripts.
//!
//! Two families:
//!
//! - **Tunnels** (SOCKS4, SOCKS4A, SOCKS5, HTTP 1.1 CONNECT): negotiated on
//!   the TCP stream before the first FTP byte; data connections are tunnelled
//!   the same way.
//! - **FTP proxies / firewalls**: the client talks FTP to the proxy and a
//!   login script decides which commands reach it (`SITE host`, `OPEN host`,
//!   `USER user@host`, …).
//!
//! Every type (including a direct connection) has a script; the first line
//! says where to connect:
//!
//! ```text
//! Connect to: $(ProxyHost):$(ProxyPort)
//! USER $(ProxyUser)
//! 3xx: PASS $(ProxyPassword)
//! SITE $(Host):$(Port)
//! USER $(User)
//! 3xx: PASS $(Password)
//! 3xx: ACCT $(Account)
//! ```

use crate::ftp::error::{FtpError, FtpResult};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ─── Proxy server definitions ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProxyType {
    /// Direct connection.
    #[default]
    NotUsed,
    Socks4,
    Socks4A,
    Socks5,
    Http11,
    /// `SITE host:port` after logging into the firewall.
    SiteHostColonPort,
    /// `SITE host port` after logging into the firewall.
    SiteHostSpacePort,
    /// `SITE user@host:port` after logging into the firewall.
    SiteUserHostColonPort,
    /// `SITE user@host port` after logging into the firewall.
    SiteUserHostSpacePort,
    /// `OPEN host:port` after logging into the firewall.
    OpenHostPort,
    /// Connect straight to the host; the firewall intercepts the login.
    Transparent,
    /// `USER user@host:port` after logging into the firewall.
    UserUserHostColonPort,
    /// `USER user@host port` after logging into the firewall.
    UserUserHostSpacePort,
    /// `USER proxyuser@host:port`, then the real login.
    UserFireUserHost,
    /// `USER user@host:port proxyuser`, proxy password sent as `ACCT`.
    UserUserHostFireUser,
    /// `USER user@proxyuser@host:port`, `PASS password@proxypassword`.
    UserUserFireUserHost,
    /// User-written script.
    OwnScript,
}

impl ProxyType {
    pub fn default_port(self) -> u16 {
        match self {
            ProxyType::Socks4 | ProxyType::Socks4A | ProxyType::Socks5 => 1080,
            ProxyType::Http11 => 8080,
            _ => 21,
        }
    }

    /// Tunnel negotiated on the TCP stream (as opposed to an FTP-level proxy).
    pub fn is_tunnel(self) -> bool {
        matches!(
            self,
            ProxyType::Socks4 | ProxyType::Socks4A | ProxyType::Socks5 | ProxyType::Http11
        )
    }

    /// Built-in login script; `None` for [`ProxyType::OwnScript`].
    pub fn builtin_script(self) -> Option<&'static str> {
        let s = match self {
            ProxyType::NotUsed => concat!(
                "Connect to: $(Host):$(Port)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::Socks4 | ProxyType::Socks4A | ProxyType::Socks5 | ProxyType::Http11 => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::SiteHostColonPort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "SITE $(Host):$(Port)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::SiteHostSpacePort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "SITE $(Host) $(Port)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::SiteUserHostColonPort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "SITE $(User)@$(Host):$(Port)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::SiteUserHostSpacePort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "SITE $(User)@$(Host) $(Port)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::OpenHostPort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "OPEN $(Host):$(Port)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::Transparent => concat!(
                "Connect to: $(Host):$(Port)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::UserUserHostColonPort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "USER $(User)@$(Host):$(Port)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::UserUserHostSpacePort => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "USER $(User)@$(Host) $(Port)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::UserFireUserHost => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(ProxyUser)@$(Host):$(Port)\r\n",
                "3xx: PASS $(ProxyPassword)\r\n",
                "USER $(User)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::UserUserHostFireUser => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(User)@$(Host):$(Port) $(ProxyUser)\r\n",
                "3xx: PASS $(Password)\r\n",
                "3xx: ACCT $(ProxyPassword)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::UserUserFireUserHost => concat!(
                "Connect to: $(ProxyHost):$(ProxyPort)\r\n",
                "USER $(User)@$(ProxyUser)@$(Host):$(Port)\r\n",
                "3xx: PASS $(Password)@$(ProxyPassword)\r\n",
                "3xx: ACCT $(Account)\r\n"
            ),
            ProxyType::OwnScript => return None,
        };
        Some(s)
    }
}

/// One configured proxy server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServerConfig {
    /// Stable id; bookmarks refer to proxies by it.
    #[serde(default)]
    pub uid: u32,
    pub name: String,
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    /// Plain password, only held in memory.
    #[serde(skip)]
    pub password: String,
    /// Password as stored by the password manager (base64 blob).
    #[serde(default)]
    pub encrypted_password: Option<String>,
    #[serde(default)]
    pub save_password: bool,
    /// Only for [`ProxyType::OwnScript`].
    #[serde(default)]
    pub script: Option<String>,
}

impl ProxyServerConfig {
    pub fn new(name: impl Into<String>, proxy_type: ProxyType, host: impl Into<String>) -> Self {
        Self {
            uid: 0,
            name: name.into(),
            proxy_type,
            host: host.into(),
            port: None,
            user: String::new(),
            password: String::new(),
            encrypted_password: None,
            save_password: false,
            script: None,
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.proxy_type.default_port())
    }

    /// Login script text for this proxy.
    pub fn script_text(&self) -> FtpResult<&str> {
        match self.proxy_type.builtin_script() {
            Some(s) => Ok(s),
            None => self
                .script
                .as_deref()
                .ok_or_else(|| FtpError::proxy_failed("Proxy script is missing")),
        }
    }
}

// ─── Script execution ────────────────────────────────────────────────

/// Values substituted into a proxy script.
#[derive(Debug, Clone, Default)]
pub struct ScriptParams {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_user: String,
    pub proxy_password: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub account: String,
    pub allow_empty_password: bool,
}

impl ScriptParams {
    /// Fill in a value the user typed for a missing variable. Returns
    /// `false` for a variable that cannot be supplied.
    pub fn supply(&mut self, variable: &str, value: String) -> bool {
        let slot = match variable {
            "ProxyHost" => &mut self.proxy_host,
            "ProxyPassword" => &mut self.proxy_password,
            "User" => &mut self.user,
            "Password" => &mut self.password,
            "Account" => &mut self.account,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// One command produced by a script step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    /// Text to send, without CRLF.
    pub send: String,
    /// Same text with passwords replaced by `(hidden)`.
    pub log: String,
}

const VARIABLES: [&str; 9] = [
    "ProxyHost",
    "ProxyPort",
    "ProxyUser",
    "ProxyPassword",
    "Host",
    "Port",
    "User",
    "Password",
    "Account",
];

enum Expanded {
    Line(ScriptCommand),
    Skip,
}

/// Expand `$(Var)` / `$$` in one line.
fn expand(text: &str, params: Option<&ScriptParams>, host_vars_only: bool) -> FtpResult<Expanded> {
    let mut send = String::with_capacity(text.len());
    let mut log = String::with_capacity(text.len());
    let mut skip = false;
    let mut missing: Option<&'static str> = None;
    let mut rest = text;

    while let Some(i) = rest.find('$') {
        send.push_str(&rest[..i]);
        log.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            send.push('$');
            log.push('$');
            rest = tail;
            continue;
        }
        let Some(inner) = after.strip_prefix('(') else {
            send.push('$');
            log.push('$');
            rest = after;
            continue;
        };
        let var = VARIABLES.iter().position(|v| {
            inner.len() > v.len()
                && inner.as_bytes()[v.len()] == b')'
                && inner[..v.len()].eq_ignore_ascii_case(v)
        });
        let Some(var) = var else {
            return Err(FtpError::proxy_failed(format!(
                "Unknown variable in proxy script: ${}",
                after.split(')').next().unwrap_or(after)
            )));
        };
        let name = VARIABLES[var];
        if host_vars_only && name != "ProxyHost" && name != "Host" {
            return Err(FtpError::proxy_failed(format!(
                "Only $(Host) or $(ProxyHost) may follow \"Connect to:\", found $({})",
                name
            )));
        }
        rest = &inner[name.len() + 1..];

        let Some(p) = params else { continue };
        let mut hidden = false;
        let value: String = match name {
            "ProxyHost" => {
                if p.proxy_host.is_empty() {
                    missing.get_or_insert("ProxyHost");
                }
                p.proxy_host.clone()
            }
            "ProxyPort" => p.proxy_port.to_string(),
            "ProxyUser" => {
                if p.proxy_user.is_empty() {
                    skip = true;
                }
                p.proxy_user.clone()
            }
            "ProxyPassword" => {
                hidden = true;
                if p.proxy_password.is_empty() {
                    missing.get_or_insert("ProxyPassword");
                }
                p.proxy_password.clone()
            }
            "Host" => p.host.clone(),
            "Port" => p.port.to_string(),
            "User" => {
                if p.user.is_empty() {
                    missing.get_or_insert("User");
                }
                p.user.clone()
            }
            "Password" => {
                hidden = true;
                if p.password.is_empty() && !p.allow_empty_password {
                    missing.get_or_insert("Password");
                }
                p.password.clone()
            }
            _ => {
                hidden = true;
                if p.account.is_empty() {
                    missing.get_or_insert("Account");
                }
                p.account.clone()
            }
        };
        send.push_str(&value);
        if hidden {
            log.push_str("(hidden)");
        } else {
            log.push_str(&value);
        }
    }
    send.push_str(rest);
    log.push_str(rest);

    if skip {
        return Ok(Expanded::Skip);
    }
    if let Some(var) = missing {
        return Err(FtpError::need_user_input(var));
    }
    Ok(Expanded::Line(ScriptCommand { send, log }))
}

/// Parsed `Connect to:` target of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Cursor over a login script. Created per login attempt.
#[derive(Debug, Clone)]
pub struct ProxyScript<'a> {
    text: &'a str,
    /// Byte offset of the next command line; `None` before `connect_target`.
    pos: Option<usize>,
}

impl<'a> ProxyScript<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: None }
    }

    /// Check the syntax without substituting values.
    pub fn validate(text: &str) -> FtpResult<()> {
        let (_, body) = split_connect_line(text)?;
        parse_connect_line(text, None)?;
        // Body lines after "Connect to:"; blank lines do not count.
        let mut any = false;
        for (i, raw) in body.lines().map(str::trim).filter(|l| !l.is_empty()).enumerate() {
            let (only_3xx, cmd) = strip_3xx(raw);
            if only_3xx && i == 0 {
                return Err(FtpError::proxy_failed(
                    "\"3xx:\" cannot be used on the first command of a proxy script",
                ));
            }
            if cmd.is_empty() {
                continue;
            }
            expand(cmd, None, false)?;
            any = true;
        }
        if !any {
            return Err(FtpError::proxy_failed("Proxy script contains no commands"));
        }
        Ok(())
    }

    /// Evaluate the `Connect to:` line.
    pub fn connect_target(&mut self, params: &ScriptParams) -> FtpResult<ConnectTarget> {
        let (first, _) = split_connect_line(self.text)?;
        let target = parse_connect_line(self.text, Some(params))?;
        self.pos = Some(first);
        Ok(target)
    }

    /// Next command to send. `last_reply` is the code of the previous reply
    /// (`None` before the first command). Returns `Ok(None)` at the end.
    ///
    /// When a value is missing the cursor is left on that line so the caller
    /// can ask the user and call again.
    pub fn next_command(
        &mut self,
        mut last_reply: Option<u16>,
        params: &ScriptParams,
    ) -> FtpResult<Option<ScriptCommand>> {
        let mut pos = match self.pos {
            Some(p) => p,
            None => split_connect_line(self.text)?.0,
        };
        loop {
            let rest = &self.text[pos..];
            if rest.trim().is_empty() {
                self.pos = Some(self.text.len());
                return Ok(None);
            }
            let (line, next) = match rest.find('\n') {
                Some(i) => (&rest[..i], pos + i + 1),
                None => (rest, self.text.len()),
            };
            let trimmed = line.trim();
            let (only_3xx, cmd) = strip_3xx(trimmed);
            let send_it = !cmd.is_empty()
                && (!only_3xx || last_reply.is_some_and(|c| c / 100 == 3));
            if !send_it {
                if !cmd.is_empty() {
                    last_reply = None;
                }
                pos = next;
                continue;
            }
            match expand(cmd, Some(params), false)? {
                Expanded::Skip => {
                    last_reply = None;
                    pos = next;
                }
                Expanded::Line(c) => {
                    self.pos = Some(next);
                    return Ok(Some(c));
                }
            }
        }
    }
}

fn strip_3xx(line: &str) -> (bool, &str) {
    match line.get(..4) {
        Some(p) if p.eq_ignore_ascii_case("3xx:") => (true, line[4..].trim_start()),
        _ => (false, line),
    }
}

/// Offset of the first command line and the text from there.
fn split_connect_line(text: &str) -> FtpResult<(usize, &str)> {
    let start = text.len() - text.trim_start().len();
    let head = &text[start..];
    if !head.get(..11).is_some_and(|p| p.eq_ignore_ascii_case("Connect to:")) {
        return Err(FtpError::proxy_failed(
            "Proxy script must start with \"Connect to:\"",
        ));
    }
    let end = head.find('\n').map(|i| start + i + 1).unwrap_or(text.len());
    Ok((end, &text[end..]))
}

fn parse_connect_line(text: &str, params: Option<&ScriptParams>) -> FtpResult<ConnectTarget> {
    let head = text.trim_start();
    let line = head[11..].split(['\r', '\n']).next().unwrap_or("").trim();
    if line.is_empty() {
        return Err(FtpError::proxy_failed("Host in \"Connect to:\" is empty"));
    }
    let (host_text, port_text) = match line.find(':') {
        Some(i) => (line[..i].trim(), Some(line[i + 1..].trim())),
        None => (line, None),
    };
    if host_text.is_empty() || host_text.contains(char::is_whitespace) {
        return Err(FtpError::proxy_failed("Invalid host or port in \"Connect to:\""));
    }
    let port = match port_text {
        None | Some("") => 21,
        Some(p) if p.eq_ignore_ascii_case("$(ProxyPort)") => params.map(|p| p.proxy_port).unwrap_or(21),
        Some(p) if p.eq_ignore_ascii_case("$(Port)") => params.map(|p| p.port).unwrap_or(21),
        Some(p) => match p.parse::<u32>() {
            Ok(n) if (1..=65535).contains(&n) => n as u16,
            Ok(_) => return Err(FtpError::proxy_failed("Port must be a number from 1 to 65535")),
            Err(_) => return Err(FtpError::proxy_failed(format!("Invalid port in \"Connect to:\": {}", p))),
        },
    };
    let host = match expand(host_text, params, true)? {
        Expanded::Line(c) => c.send,
        Expanded::Skip => String::new(),
    };
    Ok(ConnectTarget { host, port })
}

// ─── Tunnels ─────────────────────────────────────────────────────────

/// Negotiate a tunnel to `target_host:target_port` on an open stream to the
/// proxy.
pub async fn open_tunnel<S>(
    stream: &mut S,
    proxy: &ProxyServerConfig,
    target_host: &str,
    target_port: u16,
) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    log::debug!(
        "Opening {:?} tunnel via {}:{} to {}:{}",
        proxy.proxy_type,
        proxy.host,
        proxy.effective_port(),
        target_host,
        target_port
    );
    match proxy.proxy_type {
        ProxyType::Socks4 => socks4_request(stream, 0x01, proxy, target_host, target_port, false).await.map(|_| ()),
        ProxyType::Socks4A => socks4_request(stream, 0x01, proxy, target_host, target_port, true).await.map(|_| ()),
        ProxyType::Socks5 => {
            socks5_handshake(stream, proxy).await?;
            socks5_request(stream, 0x01, target_host, target_port).await.map(|_| ())
        }
        ProxyType::Http11 => http_connect(stream, proxy, target_host, target_port).await,
        _ => Ok(()),
    }
}

/// Ask a SOCKS proxy to listen for the server's data connection (active
/// mode). Returns the address the server must connect to; call
/// [`socks_accept_bind`] afterwards to wait for the connection.
pub async fn socks_bind<S>(
    stream: &mut S,
    proxy: &ProxyServerConfig,
    server_host: &str,
    server_port: u16,
) -> FtpResult<SocketAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = match proxy.proxy_type {
        ProxyType::Socks4 => socks4_request(stream, 0x02, proxy, server_host, server_port, false).await?,
        ProxyType::Socks4A => socks4_request(stream, 0x02, proxy, server_host, server_port, true).await?,
        ProxyType::Socks5 => {
            socks5_handshake(stream, proxy).await?;
            socks5_request(stream, 0x02, server_host, server_port).await?
        }
        other => {
            return Err(FtpError::proxy_failed(format!(
                "Active data connections are not possible through {:?}",
                other
            )))
        }
    };
    // A zero address means "same host as the proxy".
    if addr.ip().is_unspecified() {
        if let Ok(ip) = proxy.host.parse() {
            return Ok(SocketAddr::new(ip, addr.port()));
        }
    }
    Ok(addr)
}

/// Wait for the second BIND reply (the server connected to the proxy).
pub async fn socks_accept_bind<S>(stream: &mut S, proxy_type: ProxyType) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy_type {
        ProxyType::Socks4 | ProxyType::Socks4A => read_socks4_reply(stream).await.map(|_| ()),
        ProxyType::Socks5 => read_socks5_reply(stream).await.map(|_| ()),
        other => Err(FtpError::proxy_failed(format!("{:?} cannot accept connections", other))),
    }
}

async fn socks4_request<S>(
    stream: &mut S,
    command: u8,
    proxy: &ProxyServerConfig,
    host: &str,
    port: u16,
    allow_domain: bool,
) -> FtpResult<SocketAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x04, command];
    request.extend_from_slice(&port.to_be_bytes());

    let ip = host.parse::<Ipv4Addr>();
    let domain = match ip {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        Err(_) if allow_domain => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            Some(host)
        }
        Err(_) => {
            let resolved = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| FtpError::connection_failed(format!("Cannot resolve {}: {}", host, e)))?
                .find_map(|a| match a {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .ok_or_else(|| {
                    FtpError::proxy_failed("SOCKS4 only supports IPv4 addresses, not domain names")
                })?;
            request.extend_from_slice(&resolved.octets());
            None
        }
    };
    request.extend_from_slice(proxy.user.as_bytes());
    request.push(0x00);
    if let Some(d) = domain {
        request.extend_from_slice(d.as_bytes());
        request.push(0x00);
    }

    stream
        .write_all(&request)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to send SOCKS4 request: {}", e)))?;
    read_socks4_reply(stream).await
}

async fn read_socks4_reply<S>(stream: &mut S) -> FtpResult<SocketAddr>
where
    S: AsyncRead + Unpin,
{
    let mut response = [0u8; 8];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to read SOCKS4 response: {}", e)))?;

    if response[1] != 0x5A {
        let error_msg = match response[1] {
            0x5B => "Request rejected or failed",
            0x5C => "Request failed (no identd)",
            0x5D => "Request failed (identd mismatch)",
            _ => "Unknown SOCKS4 error",
        };
        return Err(FtpError::proxy_failed(format!("SOCKS4 connect failed: {}", error_msg)));
    }
    let port = u16::from_be_bytes([response[2], response[3]]);
    let ip = Ipv4Addr::new(response[4], response[5], response[6], response[7]);
    Ok(SocketAddr::new(ip.into(), port))
}

async fn socks5_handshake<S>(stream: &mut S, proxy: &ProxyServerConfig) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth_required = !proxy.user.is_empty();
    let greeting: &[u8] = if auth_required {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to read SOCKS5 greeting response: {}", e)))?;

    if response[0] != 0x05 {
        return Err(FtpError::proxy_failed("Invalid SOCKS5 response version"));
    }

    if response[1] == 0x02 {
        let mut auth_request = vec![0x01];
        auth_request.push(proxy.user.len() as u8);
        auth_request.extend_from_slice(proxy.user.as_bytes());
        auth_request.push(proxy.password.len() as u8);
        auth_request.extend_from_slice(proxy.password.as_bytes());

        stream
            .write_all(&auth_request)
            .await
            .map_err(|e| FtpError::proxy_failed(format!("Failed to send SOCKS5 auth: {}", e)))?;

        let mut auth_response = [0u8; 2];
        stream
            .read_exact(&mut auth_response)
            .await
            .map_err(|e| FtpError::proxy_failed(format!("Failed to read SOCKS5 auth response: {}", e)))?;

        if auth_response[1] != 0x00 {
            return Err(FtpError::proxy_failed("SOCKS5 authentication failed"));
        }
    } else if response[1] != 0x00 {
        return Err(FtpError::proxy_failed(format!(
            "SOCKS5 server requires unsupported auth method: {}",
            response[1]
        )));
    }
    Ok(())
}

async fn socks5_request<S>(stream: &mut S, command: u8, host: &str, port: u16) -> FtpResult<SocketAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![0x05, command, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        request.push(0x01);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        request.push(0x04);
        request.extend_from_slice(&ip.octets());
    } else {
        request.push(0x03);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to send SOCKS5 request: {}", e)))?;
    read_socks5_reply(stream).await
}

async fn read_socks5_reply<S>(stream: &mut S) -> FtpResult<SocketAddr>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to read SOCKS5 response: {}", e)))?;

    if head[1] != 0x00 {
        let error_msg = match head[1] {
            0x01 => "General SOCKS server failure",
            0x02 => "Connection not allowed by ruleset",
            0x03 => "Network unreachable",
            0x04 => "Host unreachable",
            0x05 => "Connection refused",
            0x06 => "TTL expired",
            0x07 => "Command not supported",
            0x08 => "Address type not supported",
            _ => "Unknown SOCKS5 error",
        };
        return Err(FtpError::proxy_failed(format!("SOCKS5 request failed: {}", error_msg)));
    }

    let ip: std::net::IpAddr = match head[3] {
        0x01 => {
            let mut b = [0u8; 4];
            stream.read_exact(&mut b).await?;
            Ipv4Addr::from(b).into()
        }
        0x04 => {
            let mut b = [0u8; 16];
            stream.read_exact(&mut b).await?;
            Ipv6Addr::from(b).into()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            Ipv4Addr::UNSPECIFIED.into()
        }
        other => {
            return Err(FtpError::proxy_failed(format!(
                "SOCKS5 reply with unknown address type {}",
                other
            )))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

async fn http_connect<S>(
    stream: &mut S,
    proxy: &ProxyServerConfig,
    host: &str,
    port: u16,
) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if !proxy.user.is_empty() {
        let credentials = format!("{}:{}", proxy.user, proxy.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| FtpError::proxy_failed(format!("Failed to send HTTP CONNECT: {}", e)))?;

    // Read byte by byte so no FTP bytes after the header are swallowed.
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") && !header.ends_with(b"\n\n") {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| FtpError::proxy_failed(format!("Failed to read HTTP response: {}", e)))?;
        if n == 0 {
            return Err(FtpError::proxy_failed("HTTP proxy closed the connection"));
        }
        header.push(byte[0]);
        if header.len() > 16 * 1024 {
            return Err(FtpError::proxy_failed("HTTP proxy response header is too long"));
        }
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or("");
    let parts: Vec<&str> = status_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(FtpError::proxy_failed("Invalid HTTP proxy response"));
    }
    let status_code: u16 = parts[1]
        .parse()
        .map_err(|_| FtpError::proxy_failed("Invalid HTTP status code"))?;
    if !(200..300).contains(&status_code) {
        return Err(FtpError::proxy_failed(format!(
            "HTTP proxy returned: {}",
            status_line.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use tokio::io::duplex;

    fn params() -> ScriptParams {
        ScriptParams {
            proxy_host: "fw.local".into(),
            proxy_port: 2121,
            proxy_user: "fwuser".into(),
            proxy_password: "fwpass".into(),
            host: "ftp.example.com".into(),
            port: 21,
            user: "bob".into(),
            password: "secret".into(),
            account: String::new(),
            allow_empty_password: false,
        }
    }

    #[test]
    fn test_all_builtin_scripts_validate() {
        for t in [
            ProxyType::NotUsed,
            ProxyType::Socks5,
            ProxyType::SiteHostColonPort,
            ProxyType::SiteHostSpacePort,
            ProxyType::SiteUserHostColonPort,
            ProxyType::SiteUserHostSpacePort,
            ProxyType::OpenHostPort,
            ProxyType::Transparent,
            ProxyType::UserUserHostColonPort,
            ProxyType::UserUserHostSpacePort,
            ProxyType::UserFireUserHost,
            ProxyType::UserUserHostFireUser,
            ProxyType::UserUserFireUserHost,
        ] {
            let s = t.builtin_script().unwrap();
            assert!(ProxyScript::validate(s).is_ok(), "{:?}", t);
        }
        assert!(ProxyType::OwnScript.builtin_script().is_none());
    }

    #[test]
    fn test_site_script_run() {
        let p = params();
        let mut script = ProxyScript::new(ProxyType::SiteHostColonPort.builtin_script().unwrap());
        let target = script.connect_target(&p).unwrap();
        assert_eq!(target, ConnectTarget { host: "fw.local".into(), port: 2121 });

        let c = script.next_command(None, &p).unwrap().unwrap();
        assert_eq!(c.send, "USER fwuser");
        let c = script.next_command(Some(331), &p).unwrap().unwrap();
        assert_eq!(c.send, "PASS fwpass");
        assert_eq!(c.log, "PASS (hidden)");
        let c = script.next_command(Some(230), &p).unwrap().unwrap();
        assert_eq!(c.send, "SITE ftp.example.com:21");
        let c = script.next_command(Some(220), &p).unwrap().unwrap();
        assert_eq!(c.send, "USER bob");
        // Logged in without password: remaining 3xx lines are skipped.
        assert!(script.next_command(Some(230), &p).unwrap().is_none());
    }

    #[test]
    fn test_empty_proxy_user_skips_line() {
        let mut p = params();
        p.proxy_user.clear();
        let mut script = ProxyScript::new(ProxyType::Transparent.builtin_script().unwrap());
        script.connect_target(&p).unwrap();
        // USER $(ProxyUser) skipped, so its 3xx PASS is skipped too.
        let c = script.next_command(None, &p).unwrap().unwrap();
        assert_eq!(c.send, "USER bob");
    }

    #[test]
    fn test_missing_password_needs_input() {
        let mut p = params();
        p.password.clear();
        let mut script = ProxyScript::new(ProxyType::NotUsed.builtin_script().unwrap());
        script.connect_target(&p).unwrap();
        script.next_command(None, &p).unwrap();
        let err = script.next_command(Some(331), &p).unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NeedUserInput);
        assert!(err.message.contains("Password"));
        // Supplying the value continues on the same line.
        p.password = "late".into();
        let c = script.next_command(Some(331), &p).unwrap().unwrap();
        assert_eq!(c.send, "PASS late");
    }

    #[test]
    fn test_script_errors() {
        assert!(ProxyScript::validate("USER x").is_err());
        assert!(ProxyScript::validate("Connect to: $(Host)\r\n").is_err());
        assert!(ProxyScript::validate("Connect to: $(Host)\r\n3xx: PASS x\r\n").is_err());
        assert!(ProxyScript::validate("Connect to: $(User):21\r\nUSER x\r\n").is_err());
        assert!(ProxyScript::validate("Connect to: $(Host):70000\r\nUSER x\r\n").is_err());
        assert!(ProxyScript::validate("Connect to: $(Host)\r\nUSER $(Nope)\r\n").is_err());
        assert!(ProxyScript::validate("Connect to: $(Host)\r\nSITE $$1 $(host)\r\n").is_ok());
    }

    #[test]
    fn test_dollar_escape() {
        let p = params();
        let mut script = ProxyScript::new("connect to: literal.host:99\nQUOTE $$x $(HOST)\n");
        let t = script.connect_target(&p).unwrap();
        assert_eq!(t.port, 99);
        assert_eq!(t.host, "literal.host");
        let c = script.next_command(None, &p).unwrap().unwrap();
        assert_eq!(c.send, "QUOTE $x ftp.example.com");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(ProxyType::Socks4A.default_port(), 1080);
        assert_eq!(ProxyType::Http11.default_port(), 8080);
        assert_eq!(ProxyType::OpenHostPort.default_port(), 21);
        let cfg = ProxyServerConfig::new("fw", ProxyType::Http11, "proxy");
        assert_eq!(cfg.effective_port(), 8080);
    }

    #[tokio::test]
    async fn test_socks5_tunnel() {
        let (mut client, mut server) = duplex(256);
        let srv = tokio::spawn(async move {
            let mut greet = [0u8; 3];
            server.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [5, 1, 0]);
            server.write_all(&[5, 0]).await.unwrap();
            let mut req = [0u8; 4];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req, [5, 1, 0, 3]);
            let mut len = [0u8; 1];
            server.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..len[0] as usize], b"ftp.example.com");
            server.write_all(&[5, 0, 0, 1, 10, 0, 0, 1, 0, 21]).await.unwrap();
        });
        let proxy = ProxyServerConfig::new("s", ProxyType::Socks5, "127.0.0.1");
        open_tunnel(&mut client, &proxy, "ftp.example.com", 21).await.unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = server.read(&mut buf).await;
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\nX: y\r\n\r\n")
                .await
                .unwrap();
        });
        let proxy = ProxyServerConfig::new("h", ProxyType::Http11, "127.0.0.1");
        let err = open_tunnel(&mut client, &proxy, "h", 21).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::ProxyFailed);
        assert!(err.message.contains("403"));
    }
}
