//! Persisted configuration: global defaults, bookmarks and proxy servers.
//!
//! Everything is stored as pretty-printed JSON through a [`ConfigStore`],
//! one value per key. Passwords never hit the store in plain form; they are
//! sealed by `salftp_credentials::PasswordManager` first.
//!
//! ```rust,no_run
//! use salftp_ftp::ftp::config::{JsonFileStore, StoredSettings};
//!
//! # fn example() -> salftp_ftp::ftp::FtpResult<()> {
//! let store = JsonFileStore::default_location()?;
//! let settings = StoredSettings::load(&store)?;
//! println!("{} bookmarks", settings.bookmarks.len());
//! # Ok(())
//! # }
//! ```

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser::ServerType;
use crate::ftp::proxy::ProxyServerConfig;
use crate::ftp::types::{
    DataChannelMode, FtpConnectionConfig, KeepAliveConfig, SecurityMode, TransferMode,
    ANONYMOUS_USER,
};
use salftp_credentials::{CredentialError, EncryptedPassword, MasterPasswordVerifier, PasswordManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

pub const DEFAULT_CACHE_BUDGET: usize = 4 * 1024 * 1024;
/// Smallest listing cache budget accepted from a stored config.
pub const MIN_CACHE_BUDGET: usize = 100 * 1024;
pub const DEFAULT_ASCII_FILE_MASKS: &str = "*.txt;*.*htm;*.*html;*.pl;*.php;*.php3;*.asp;*.cgi;*.css;*.bat;*.tcl;*.diz;*.nfo;*.ini;*.mak;*.cpp;*.c;*.h;*.bas;*.pas;*.tex;*.log";

const KEY_CONFIG: &str = "config";
const KEY_BOOKMARKS: &str = "bookmarks";
const KEY_PROXIES: &str = "proxies";
const KEY_MASTER_PASSWORD: &str = "master-password";

// ─── Global configuration ────────────────────────────────────────────

/// Plugin-wide defaults shared by every connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpGlobalConfig {
    /// Byte budget of the listing cache.
    #[serde(default = "default_cache_budget")]
    pub cache_budget: usize,
    #[serde(default = "default_true")]
    pub use_listings_cache: bool,
    #[serde(default = "default_reply_timeout")]
    pub server_reply_timeout_sec: u64,
    /// Reconnect attempts per logical operation.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_sec: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: KeepAliveConfig,
    #[serde(default = "default_true")]
    pub passive_mode: bool,
    #[serde(default = "default_list_command")]
    pub list_command: String,
    /// `;`-separated masks of files transferred in ASCII mode by
    /// [`TransferMode::Auto`].
    #[serde(default = "default_ascii_masks")]
    pub ascii_file_masks: String,
    #[serde(default = "default_transfer_mode")]
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub default_security: SecurityMode,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// Proxy used by bookmarks that do not pick one.
    #[serde(default)]
    pub default_proxy_uid: Option<u32>,
    /// User-defined server types, added after the built-in ones.
    #[serde(default)]
    pub custom_server_types: Vec<ServerType>,
}

fn default_cache_budget() -> usize {
    DEFAULT_CACHE_BUDGET
}
fn default_true() -> bool {
    true
}
fn default_reply_timeout() -> u64 {
    30
}
fn default_connect_retries() -> u32 {
    60
}
fn default_retry_delay() -> u64 {
    20
}
fn default_keep_alive() -> KeepAliveConfig {
    KeepAliveConfig {
        send_every_sec: 90,
        ..KeepAliveConfig::default()
    }
}
fn default_list_command() -> String {
    "LIST".to_string()
}
fn default_ascii_masks() -> String {
    DEFAULT_ASCII_FILE_MASKS.to_string()
}
fn default_transfer_mode() -> TransferMode {
    TransferMode::Auto
}

impl Default for FtpGlobalConfig {
    fn default() -> Self {
        Self {
            cache_budget: default_cache_budget(),
            use_listings_cache: true,
            server_reply_timeout_sec: default_reply_timeout(),
            connect_retries: default_connect_retries(),
            retry_delay_sec: default_retry_delay(),
            keep_alive: default_keep_alive(),
            passive_mode: true,
            list_command: default_list_command(),
            ascii_file_masks: default_ascii_masks(),
            transfer_mode: default_transfer_mode(),
            default_security: SecurityMode::None,
            accept_invalid_certs: false,
            use_compression: false,
            default_proxy_uid: None,
            custom_server_types: Vec::new(),
        }
    }
}

impl FtpGlobalConfig {
    /// Cache budget clamped to the smallest usable size.
    pub fn effective_cache_budget(&self) -> usize {
        self.cache_budget.max(MIN_CACHE_BUDGET)
    }

    /// Whether `name` matches one of the ASCII file masks.
    pub fn is_ascii_file(&self, name: &str) -> bool {
        self.ascii_file_masks
            .split(';')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .any(|mask| mask_matches(mask, name))
    }

    /// Connection settings for `host` built only from the global defaults.
    pub fn connection_defaults(&self, host: impl Into<String>) -> FtpConnectionConfig {
        FtpConnectionConfig {
            host: host.into(),
            security: self.default_security,
            transfer_mode: self.transfer_mode,
            data_channel_mode: data_channel(self.passive_mode),
            list_command: self.list_command.clone(),
            use_compression: self.use_compression,
            reply_timeout_sec: self.server_reply_timeout_sec,
            max_retries: self.connect_retries,
            retry_delay_sec: self.retry_delay_sec,
            accept_invalid_certs: self.accept_invalid_certs,
            keep_alive: self.keep_alive.clone(),
            ..FtpConnectionConfig::default()
        }
    }
}

fn data_channel(passive: bool) -> DataChannelMode {
    if passive {
        DataChannelMode::Passive
    } else {
        DataChannelMode::Active
    }
}

/// Case-insensitive wildcard match (`*` any run, `?` one character).
pub fn mask_matches(mask: &str, name: &str) -> bool {
    let mask: Vec<char> = mask.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    let (mut m, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if m < mask.len() && (mask[m] == '?' || mask[m] == name[n]) {
            m += 1;
            n += 1;
        } else if m < mask.len() && mask[m] == '*' {
            star = Some((m, n));
            m += 1;
        } else if let Some((sm, sn)) = star {
            m = sm + 1;
            n = sn + 1;
            star = Some((sm, sn + 1));
        } else {
            return false;
        }
    }
    mask[m..].iter().all(|&c| c == '*')
}

// ─── Bookmarks ───────────────────────────────────────────────────────

/// A saved server. `None` fields fall back to [`FtpGlobalConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Empty means anonymous.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub encrypted_password: Option<String>,
    /// Plain password, only held in memory.
    #[serde(skip)]
    pub password: String,
    #[serde(default)]
    pub save_password: bool,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub initial_path: Option<String>,
    #[serde(default)]
    pub security: Option<SecurityMode>,
    #[serde(default)]
    pub passive_mode: Option<bool>,
    #[serde(default)]
    pub list_command: Option<String>,
    #[serde(default)]
    pub keep_alive: Option<KeepAliveConfig>,
    /// Forced server type; `None` autodetects.
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub transfer_mode: Option<TransferMode>,
    #[serde(default)]
    pub use_compression: Option<bool>,
    #[serde(default)]
    pub proxy_uid: Option<u32>,
}

impl Bookmark {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ..Default::default()
        }
    }

    /// Merge the bookmark over the global defaults.
    pub fn to_connection_config(
        &self,
        global: &FtpGlobalConfig,
        proxies: &[ProxyServerConfig],
    ) -> FtpResult<FtpConnectionConfig> {
        if self.host.trim().is_empty() {
            return Err(FtpError::invalid_config(format!(
                "Bookmark \"{}\" has no host",
                self.name
            )));
        }
        let mut cfg = global.connection_defaults(self.host.trim());
        let security = self.security.unwrap_or(global.default_security);
        cfg.port = self
            .port
            .unwrap_or(if security == SecurityMode::Implicit { 990 } else { 21 });
        cfg.user = if self.user.is_empty() {
            ANONYMOUS_USER.to_string()
        } else {
            self.user.clone()
        };
        cfg.password = self.password.clone();
        cfg.account = self.account.clone();
        cfg.security = security;
        cfg.initial_path = self.initial_path.clone().filter(|p| !p.is_empty());
        cfg.server_type = self.server_type.clone();
        cfg.label = Some(self.name.clone());
        if let Some(passive) = self.passive_mode {
            cfg.data_channel_mode = data_channel(passive);
        }
        if let Some(cmd) = self.list_command.as_ref().filter(|c| !c.trim().is_empty()) {
            cfg.list_command = cmd.clone();
        }
        if let Some(ka) = &self.keep_alive {
            cfg.keep_alive = ka.clone();
        }
        if let Some(mode) = self.transfer_mode {
            cfg.transfer_mode = mode;
        }
        if let Some(z) = self.use_compression {
            cfg.use_compression = z;
        }
        if let Some(uid) = self.proxy_uid.or(global.default_proxy_uid) {
            let proxy = proxies
                .iter()
                .find(|p| p.uid == uid)
                .ok_or_else(|| FtpError::invalid_config(format!("Unknown proxy server #{}", uid)))?;
            cfg.proxy = Some(proxy.clone());
        }
        Ok(cfg)
    }
}

// ─── Store ───────────────────────────────────────────────────────────

/// Name/value store the settings are persisted into.
pub trait ConfigStore: Send + Sync {
    fn load(&self, key: &str) -> FtpResult<Option<String>>;
    fn save(&self, key: &str, value: &str) -> FtpResult<()>;
    fn remove(&self, key: &str) -> FtpResult<()>;
}

/// One `<key>.json` file per value in a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<config dir>/salftp`.
    pub fn default_location() -> FtpResult<Self> {
        let base = dirs::config_dir()
            .ok_or_else(|| FtpError::invalid_config("No configuration directory on this system"))?;
        Ok(Self::new(base.join("salftp")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self, key: &str) -> FtpResult<Option<String>> {
        match std::fs::read_to_string(self.file(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FtpError::io_error(format!("Cannot read {}: {}", key, e))),
        }
    }

    fn save(&self, key: &str, value: &str) -> FtpResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| FtpError::io_error(format!("Cannot create {}: {}", self.dir.display(), e)))?;
        let path = self.file(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| FtpError::io_error(format!("Cannot write {}: {}", path.display(), e)))
    }

    fn remove(&self, key: &str) -> FtpResult<()> {
        match std::fs::remove_file(self.file(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FtpError::io_error(format!("Cannot remove {}: {}", key, e))),
        }
    }
}

/// Store kept in memory, for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: StdMutex<HashMap<String, String>>,
}

impl ConfigStore for MemoryStore {
    fn load(&self, key: &str) -> FtpResult<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> FtpResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> FtpResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.remove(key);
        Ok(())
    }
}

fn load_json<T: serde::de::DeserializeOwned>(store: &dyn ConfigStore, key: &str) -> FtpResult<Option<T>> {
    match store.load(key)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FtpError::invalid_config(format!("Stored {} is invalid: {}", key, e))),
        None => Ok(None),
    }
}

fn save_json<T: Serialize>(store: &dyn ConfigStore, key: &str, value: &T) -> FtpResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| FtpError::invalid_config(format!("Cannot serialize {}: {}", key, e)))?;
    store.save(key, &json)
}

impl From<CredentialError> for FtpError {
    fn from(e: CredentialError) -> Self {
        FtpError::invalid_config(e.to_string())
    }
}

// ─── Stored settings ─────────────────────────────────────────────────

/// Everything the client persists.
#[derive(Debug, Clone, Default)]
pub struct StoredSettings {
    pub config: FtpGlobalConfig,
    pub bookmarks: Vec<Bookmark>,
    pub proxies: Vec<ProxyServerConfig>,
    /// Verifier of the master password, if one is set.
    pub master_password: Option<MasterPasswordVerifier>,
}

impl StoredSettings {
    /// Load from `store`; missing keys take their defaults. Passwords stay
    /// sealed until [`StoredSettings::unlock_passwords`].
    pub fn load(store: &dyn ConfigStore) -> FtpResult<Self> {
        let config: FtpGlobalConfig = load_json(store, KEY_CONFIG)?.unwrap_or_default();
        let bookmarks: Vec<Bookmark> = load_json(store, KEY_BOOKMARKS)?.unwrap_or_default();
        let proxies: Vec<ProxyServerConfig> = load_json(store, KEY_PROXIES)?.unwrap_or_default();
        let master_password = match store.load(KEY_MASTER_PASSWORD)? {
            Some(text) => Some(MasterPasswordVerifier::from_base64(text.trim())?),
            None => None,
        };
        log::debug!(
            "Loaded settings: {} bookmark(s), {} proxy server(s)",
            bookmarks.len(),
            proxies.len()
        );
        Ok(Self {
            config,
            bookmarks,
            proxies,
            master_password,
        })
    }

    /// Save to `store`. Call [`StoredSettings::seal_passwords`] first so the
    /// stored blobs match the in-memory passwords.
    pub fn save(&self, store: &dyn ConfigStore) -> FtpResult<()> {
        save_json(store, KEY_CONFIG, &self.config)?;
        save_json(store, KEY_BOOKMARKS, &self.bookmarks)?;
        save_json(store, KEY_PROXIES, &self.proxies)?;
        match &self.master_password {
            Some(v) => store.save(KEY_MASTER_PASSWORD, &v.to_base64())?,
            None => store.remove(KEY_MASTER_PASSWORD)?,
        }
        Ok(())
    }

    /// Password manager matching the stored master-password verifier.
    pub fn password_manager(&self) -> PasswordManager {
        PasswordManager::new(self.master_password.clone())
    }

    /// Decrypt every stored password into the in-memory fields.
    pub fn unlock_passwords(&mut self, manager: &PasswordManager) -> FtpResult<()> {
        for b in &mut self.bookmarks {
            if let Some(blob) = &b.encrypted_password {
                b.password = open(manager, blob)?;
            }
        }
        for p in &mut self.proxies {
            if let Some(blob) = &p.encrypted_password {
                p.password = open(manager, blob)?;
            }
        }
        Ok(())
    }

    /// Encrypt in-memory passwords that should be saved; drop the others.
    pub fn seal_passwords(&mut self, manager: &PasswordManager) -> FtpResult<()> {
        let use_master = manager.is_using_master_password();
        for b in &mut self.bookmarks {
            b.encrypted_password = seal(manager, b.save_password, &b.password, use_master)?;
        }
        for p in &mut self.proxies {
            p.encrypted_password = seal(manager, p.save_password, &p.password, use_master)?;
        }
        self.master_password = manager.verifier().cloned();
        Ok(())
    }

    pub fn bookmark(&self, name: &str) -> Option<&Bookmark> {
        self.bookmarks
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// Add a proxy server, assigning the next free uid.
    pub fn add_proxy(&mut self, mut proxy: ProxyServerConfig) -> u32 {
        let uid = self.proxies.iter().map(|p| p.uid).max().unwrap_or(0) + 1;
        proxy.uid = uid;
        self.proxies.push(proxy);
        uid
    }

    pub fn connection_config(&self, bookmark: &Bookmark) -> FtpResult<FtpConnectionConfig> {
        bookmark.to_connection_config(&self.config, &self.proxies)
    }
}

fn open(manager: &PasswordManager, blob: &str) -> FtpResult<String> {
    let enc = EncryptedPassword::from_base64(blob)?;
    Ok(manager.decrypt_password(&enc)?)
}

fn seal(
    manager: &PasswordManager,
    save: bool,
    password: &str,
    use_master: bool,
) -> FtpResult<Option<String>> {
    if !save || password.is_empty() {
        return Ok(None);
    }
    Ok(Some(manager.encrypt_password(password, use_master)?.to_base64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::proxy::ProxyType;

    #[test]
    fn ascii_masks() {
        let cfg = FtpGlobalConfig::default();
        assert!(cfg.is_ascii_file("readme.TXT"));
        assert!(cfg.is_ascii_file("index.shtml"));
        assert!(cfg.is_ascii_file("main.c"));
        assert!(!cfg.is_ascii_file("image.png"));
        assert!(!cfg.is_ascii_file("archive.tar.gz"));
    }

    #[test]
    fn wildcards() {
        assert!(mask_matches("*", ""));
        assert!(mask_matches("a?c", "abc"));
        assert!(!mask_matches("a?c", "ac"));
        assert!(mask_matches("*.*htm", "x.htm"));
        assert!(mask_matches("*.*htm", "x.shtm"));
        assert!(!mask_matches("*.htm", "x.html"));
    }

    #[test]
    fn defaults_from_empty_json() {
        let cfg: FtpGlobalConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, FtpGlobalConfig::default());
        assert_eq!(cfg.keep_alive.send_every_sec, 90);
        assert_eq!(cfg.connect_retries, 60);
    }

    #[test]
    fn small_budget_is_clamped() {
        let cfg = FtpGlobalConfig {
            cache_budget: 10,
            ..Default::default()
        };
        assert_eq!(cfg.effective_cache_budget(), MIN_CACHE_BUDGET);
    }

    #[test]
    fn bookmark_overrides_globals() {
        let global = FtpGlobalConfig {
            passive_mode: true,
            default_proxy_uid: Some(7),
            ..Default::default()
        };
        let mut proxy = ProxyServerConfig::new("socks", ProxyType::Socks5, "gw");
        proxy.uid = 7;
        let mut b = Bookmark::new("work", " ftp.example.com ");
        b.security = Some(SecurityMode::Implicit);
        b.passive_mode = Some(false);
        b.list_command = Some("LIST -a".into());

        let cfg = b.to_connection_config(&global, &[proxy]).unwrap();
        assert_eq!(cfg.host, "ftp.example.com");
        assert_eq!(cfg.port, 990);
        assert_eq!(cfg.user, ANONYMOUS_USER);
        assert_eq!(cfg.data_channel_mode, DataChannelMode::Active);
        assert_eq!(cfg.list_command, "LIST -a");
        assert_eq!(cfg.proxy.map(|p| p.uid), Some(7));
        assert_eq!(cfg.label.as_deref(), Some("work"));
    }

    #[test]
    fn unknown_proxy_is_an_error() {
        let mut b = Bookmark::new("x", "host");
        b.proxy_uid = Some(3);
        assert!(b.to_connection_config(&FtpGlobalConfig::default(), &[]).is_err());
    }

    #[test]
    fn settings_round_trip_through_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut settings = StoredSettings::default();
        let mut b = Bookmark::new("home", "ftp.home");
        b.user = "me".into();
        b.password = "s3cret".into();
        b.save_password = true;
        settings.bookmarks.push(b);
        let uid = settings.add_proxy(ProxyServerConfig::new("p", ProxyType::Http11, "proxy"));
        assert_eq!(uid, 1);

        let manager = settings.password_manager();
        settings.seal_passwords(&manager).unwrap();
        settings.save(&store).unwrap();
        assert!(dir.path().join("bookmarks.json").exists());

        let mut loaded = StoredSettings::load(&store).unwrap();
        assert_eq!(loaded.bookmarks[0].password, "");
        loaded.unlock_passwords(&loaded.password_manager()).unwrap();
        assert_eq!(loaded.bookmarks[0].password, "s3cret");
        assert_eq!(loaded.proxies[0].uid, 1);
    }

    #[test]
    fn master_password_protects_saved_passwords() {
        let store = MemoryStore::default();
        let mut settings = StoredSettings::default();
        let mut b = Bookmark::new("a", "h");
        b.password = "pw".into();
        b.save_password = true;
        settings.bookmarks.push(b);
        let mut manager = PasswordManager::new(None);
        manager.set_master_password(Some("master")).unwrap();
        settings.seal_passwords(&manager).unwrap();
        settings.save(&store).unwrap();

        let mut loaded = StoredSettings::load(&store).unwrap();
        let locked = loaded.password_manager();
        assert!(locked.is_using_master_password());
        assert!(loaded.unlock_passwords(&locked).is_err());

        let mut unlocked = loaded.password_manager();
        unlocked.unlock("master").unwrap();
        loaded.unlock_passwords(&unlocked).unwrap();
        assert_eq!(loaded.bookmarks[0].password, "pw");
    }

    #[test]
    fn unsaved_passwords_are_dropped() {
        let mut settings = StoredSettings::default();
        let mut b = Bookmark::new("a", "h");
        b.password = "pw".into();
        b.encrypted_password = Some("stale".into());
        settings.bookmarks.push(b);
        settings.seal_passwords(&PasswordManager::new(None)).unwrap();
        assert!(settings.bookmarks[0].encrypted_password.is_none());
    }
}
