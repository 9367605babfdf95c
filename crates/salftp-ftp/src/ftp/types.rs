//! Shared types for the FTP core.

use crate::ftp::paths::ServerPathType;
use crate::ftp::proxy::ProxyServerConfig;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ─── Connection / Session ────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

impl SecurityMode {
    pub fn is_tls(self) -> bool {
        self != SecurityMode::None
    }
}

/// Transfer mode requested by the user for file transfers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferMode {
    #[default]
    Binary,
    Ascii,
    /// Pick ASCII or binary from the ASCII file masks.
    Auto,
}

/// Transfer type actually negotiated with the server (RFC 959 TYPE).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    pub fn command(self) -> &'static str {
        match self {
            TransferType::Ascii => "TYPE A",
            TransferType::Binary => "TYPE I",
        }
    }
}

/// Who opens the data connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    /// PASV: server listens, client connects.
    #[default]
    Passive,
    /// PORT: client listens, server connects.
    Active,
}

/// Idle command sent by the keep-alive timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum KeepAliveCommand {
    #[default]
    Noop,
    Pwd,
    Nlst,
    List,
}

impl KeepAliveCommand {
    pub fn needs_data_connection(self) -> bool {
        matches!(self, KeepAliveCommand::Nlst | KeepAliveCommand::List)
    }
}

/// Keep-alive policy for one control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds of idle time before a keep-alive command is sent.
    #[serde(default = "default_keepalive_every")]
    pub send_every_sec: u64,
    /// Minutes after which keep-alive stops for good.
    #[serde(default = "default_keepalive_stop")]
    pub stop_after_min: u64,
    #[serde(default)]
    pub command: KeepAliveCommand,
}

fn default_keepalive_every() -> u64 {
    60
}
fn default_keepalive_stop() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl KeepAliveConfig {
    pub fn send_every(&self) -> Duration {
        Duration::from_secs(self.send_every_sec)
    }

    pub fn stop_after(&self) -> Duration {
        Duration::from_secs(self.stop_after_min * 60)
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_every_sec: default_keepalive_every(),
            stop_after_min: default_keepalive_stop(),
            command: KeepAliveCommand::Noop,
        }
    }
}

/// Configuration for a single FTP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default)]
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    /// Command used to list directories.
    #[serde(default = "default_list_command")]
    pub list_command: String,
    /// Use MODE Z when the server advertises it.
    #[serde(default)]
    pub use_compression: bool,
    /// Initial remote directory to CWD into after login.
    #[serde(default)]
    pub initial_path: Option<String>,
    /// Forced server type name; `None` means autodetect.
    #[serde(default)]
    pub server_type: Option<String>,
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Server reply timeout in seconds.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_sec: u64,
    /// Reconnect attempts per logical operation.
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Seconds to wait before each reconnect.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_sec: u64,
    /// Accept self-signed / untrusted certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub allow_empty_password: bool,
    #[serde(default)]
    pub proxy: Option<ProxyServerConfig>,
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    /// Local address to bind for active-mode data connections.
    #[serde(default)]
    pub active_bind_address: Option<String>,
    /// Friendly label shown in logs.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_port() -> u16 {
    21
}
fn default_user() -> String {
    ANONYMOUS_USER.to_string()
}
fn default_list_command() -> String {
    "LIST".to_string()
}
fn default_connect_timeout() -> u64 {
    20
}
fn default_reply_timeout() -> u64 {
    30
}
fn default_retries() -> u32 {
    20
}
fn default_retry_delay() -> u64 {
    20
}

/// User name that the listing cache and path strings treat as "no user".
pub const ANONYMOUS_USER: &str = "anonymous";

impl FtpConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_sec.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.max(1))
    }

    /// User name as the cache and path strings see it (anonymous = empty).
    pub fn cache_user(&self) -> &str {
        normalize_user(&self.user)
    }
}

/// Map "anonymous" to the empty user used as the cache key.
pub fn normalize_user(user: &str) -> &str {
    if user.eq_ignore_ascii_case(ANONYMOUS_USER) {
        ""
    } else {
        user
    }
}

impl Default for FtpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            account: String::new(),
            security: SecurityMode::None,
            transfer_mode: TransferMode::Binary,
            data_channel_mode: DataChannelMode::Passive,
            list_command: default_list_command(),
            use_compression: false,
            initial_path: None,
            server_type: None,
            connect_timeout_sec: default_connect_timeout(),
            reply_timeout_sec: default_reply_timeout(),
            max_retries: default_retries(),
            retry_delay_sec: default_retry_delay(),
            accept_invalid_certs: false,
            allow_empty_password: false,
            proxy: None,
            keep_alive: KeepAliveConfig::default(),
            active_bind_address: None,
            label: None,
        }
    }
}

// ─── FTP Reply ───────────────────────────────────────────────────────

/// A single FTP reply (may be multi-line).
///
/// `code` is `None` when the server sent a line that does not follow the
/// `NNN text` grammar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpReply {
    pub code: Option<u16>,
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the final line after the reply code.
    pub fn message(&self) -> &str {
        let last = self.lines.last().map(String::as_str).unwrap_or("");
        if self.code.is_some() && last.len() >= 4 {
            last.get(4..).unwrap_or("")
        } else {
            last
        }
    }

    pub fn class(&self) -> u16 {
        self.code.map(|c| c / 100).unwrap_or(0)
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    pub fn is_completion(&self) -> bool {
        self.class() == 2
    }

    pub fn is_intermediate(&self) -> bool {
        self.class() == 3
    }

    pub fn is_transient_failure(&self) -> bool {
        self.class() == 4
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.class() == 5
    }

    pub fn to_error(&self) -> crate::ftp::error::FtpError {
        match self.code {
            Some(c) => crate::ftp::error::FtpError::from_reply(c, &self.text()),
            None => crate::ftp::error::FtpError::protocol_error(format!(
                "Unexpected reply: {}",
                self.text()
            )),
        }
    }
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// Parsed FEAT reply, limited to what the core acts on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mode_z: bool,
    pub utf8: bool,
    pub auth_tls: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    pub fn from_feat_reply(reply: &FtpReply) -> Self {
        let mut f = ServerFeatures::default();
        for line in reply.lines.iter().skip(1) {
            let feat = line.trim();
            if feat.is_empty() || feat.starts_with("211") {
                continue;
            }
            let upper = feat.to_ascii_uppercase();
            if upper.starts_with("MODE Z") {
                f.mode_z = true;
            } else if upper == "UTF8" {
                f.utf8 = true;
            } else if upper.starts_with("AUTH") && upper.contains("TLS") {
                f.auth_tls = true;
            }
            f.raw_features.push(feat.to_string());
        }
        f
    }
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
}

/// One entry produced by the listing parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    /// Symbolic link pointing at a directory.
    #[serde(default)]
    pub is_dir_link: bool,
    pub size: u64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub hidden: bool,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
    /// Remaining columns of the server type, keyed by column id.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl FtpEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FtpEntryKind::Directory || self.is_dir_link
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.date.and_time(self.time).and_utc()
    }

    /// Extension after the last '.', as the name column shows it.
    pub fn extension(&self) -> Option<&str> {
        if self.is_dir() {
            return None;
        }
        self.name.rfind('.').map(|i| &self.name[i + 1..])
    }
}

/// Result of `list_working_path`.
#[derive(Debug, Clone)]
pub struct ListingResult {
    pub path: String,
    pub path_type: ServerPathType,
    pub raw: Vec<u8>,
    /// Parsed entries; `None` when no server type could parse the listing.
    pub entries: Option<Vec<FtpEntry>>,
    pub server_type: Option<String>,
    /// Data stopped early; `raw` ends at the last complete line.
    pub incomplete: bool,
    pub from_cache: bool,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classes() {
        let r = FtpReply {
            code: Some(226),
            lines: vec!["226 Transfer complete".into()],
        };
        assert!(r.is_completion());
        assert_eq!(r.message(), "Transfer complete");
        let raw = FtpReply {
            code: None,
            lines: vec!["garbage".into()],
        };
        assert_eq!(raw.class(), 0);
        assert_eq!(raw.message(), "garbage");
    }

    #[test]
    fn test_feat_parsing() {
        let r = FtpReply {
            code: Some(211),
            lines: vec![
                "211-Features:".into(),
                " MODE Z".into(),
                " UTF8".into(),
                " AUTH TLS".into(),
                "211 End".into(),
            ],
        };
        let f = ServerFeatures::from_feat_reply(&r);
        assert!(f.mode_z && f.utf8 && f.auth_tls);
        assert_eq!(f.raw_features.len(), 3);
    }

    #[test]
    fn test_anonymous_normalization() {
        let cfg = FtpConnectionConfig::new("ftp.example.com");
        assert_eq!(cfg.cache_user(), "");
        assert_eq!(normalize_user("Bob"), "Bob");
    }

    #[test]
    fn test_config_defaults_from_json() {
        let cfg: FtpConnectionConfig =
            serde_json::from_str(r#"{"host":"h","keepAlive":{"command":"list"}}"#).unwrap();
        assert_eq!(cfg.port, 21);
        assert_eq!(cfg.keep_alive.command, KeepAliveCommand::List);
        assert_eq!(cfg.keep_alive.send_every_sec, 60);
        assert_eq!(cfg.list_command, "LIST");
    }
}
