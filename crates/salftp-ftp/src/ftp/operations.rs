//! File-system facade used by a file manager panel.
//!
//! Every call takes a `//user:password@host:port/path` string. The facade
//! keeps one control connection open and reuses it while the host, port and
//! user stay the same. Multi-item work (recursive delete, downloads) runs
//! through an [`OperationQueue`] that adopts that connection and gives it
//! back afterwards.

use crate::ftp::context::FtpContext;
use crate::ftp::ctrlcon::ControlConnection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::paths::UserPart;
use crate::ftp::queue::{self, OperationConfig, OperationQueue, OperationSummary};
use crate::ftp::socket::CommandUserInterface;
use crate::ftp::types::*;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// What a panel needs from a remote file system.
#[async_trait]
pub trait RemoteFileSystem: Send {
    /// List the directory `path` points at. `.` and `..` are left out.
    async fn list_current_path(
        &mut self,
        path: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<ListingResult>;

    /// Change into `path`; returns the new path as the server reports it,
    /// in user-part form.
    async fn change_path(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<String>;

    /// Copy (or move) a remote file or directory into the local directory
    /// `target_dir`.
    async fn copy_or_move_from_fs(
        &mut self,
        path: &str,
        target_dir: &Path,
        is_move: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<OperationSummary>;

    async fn delete(&mut self, path: &str, is_dir: bool, cancel: &CancellationToken) -> FtpResult<OperationSummary>;

    async fn change_attributes(
        &mut self,
        path: &str,
        mode: u32,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<OperationSummary>;

    /// Contents of a remote file.
    async fn view_file(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<Vec<u8>>;
}

pub struct FtpFileSystem {
    ctx: Arc<FtpContext>,
    /// Settings for new connections. Host, port and user come from the
    /// path; the password too unless the path names the template's login.
    template: FtpConnectionConfig,
    conn: Option<ControlConnection>,
    ui: Option<Arc<dyn CommandUserInterface>>,
    max_workers: usize,
}

impl FtpFileSystem {
    /// Facade with connection settings from the global config.
    pub fn new(ctx: Arc<FtpContext>) -> Self {
        let template = ctx.config().connection_defaults("");
        Self::with_template(ctx, template)
    }

    pub fn with_template(ctx: Arc<FtpContext>, template: FtpConnectionConfig) -> Self {
        Self {
            ctx,
            template,
            conn: None,
            ui: None,
            max_workers: 1,
        }
    }

    pub fn set_user_interface(&mut self, ui: Arc<dyn CommandUserInterface>) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_user_interface(Arc::clone(&ui));
        }
        self.ui = Some(ui);
    }

    /// Workers used for multi-item operations.
    pub fn set_max_workers(&mut self, workers: usize) {
        self.max_workers = workers.max(1);
    }

    pub fn connection(&self) -> Option<&ControlConnection> {
        self.conn.as_ref()
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) -> FtpResult<()> {
        match self.conn.take() {
            Some(mut conn) => conn.disconnect().await,
            None => Ok(()),
        }
    }

    fn matches(conn: &ControlConnection, part: &UserPart) -> bool {
        let cfg = conn.config();
        let user = part.effective_user().unwrap_or(ANONYMOUS_USER);
        cfg.host.eq_ignore_ascii_case(&part.host)
            && cfg.port == port_for(part, cfg.security)
            && normalize_user(&cfg.user).eq_ignore_ascii_case(normalize_user(user))
    }

    /// Connection for `path`, opened lazily. Returns the server path.
    async fn resolve(&mut self, path: &str) -> FtpResult<String> {
        let part = UserPart::parse(path)
            .ok_or_else(|| FtpError::invalid_config(format!("Invalid FTP path: {}", path)))?;
        let reuse = self.conn.as_ref().is_some_and(|c| Self::matches(c, &part));
        if !reuse {
            if let Some(mut old) = self.conn.take() {
                log::info!("Switching from {} to {}", old.config().host, part.host);
                if let Err(e) = old.disconnect().await {
                    log::debug!("Disconnect failed: {}", e);
                }
            }
            let mut cfg = self.template.clone();
            cfg.host = part.host.clone();
            cfg.port = port_for(&part, cfg.security);
            cfg.user = part.user.clone().unwrap_or_else(|| ANONYMOUS_USER.to_string());
            let same_login = cfg.host.eq_ignore_ascii_case(&self.template.host)
                && cfg.port == self.template.port
                && cfg.user == self.template.user;
            cfg.password = match &part.password {
                Some(p) => p.clone(),
                None if same_login => self.template.password.clone(),
                None => String::new(),
            };
            let mut conn = ControlConnection::new(Arc::clone(&self.ctx), cfg);
            if let Some(ui) = &self.ui {
                conn.set_user_interface(Arc::clone(ui));
            }
            self.conn = Some(conn);
        }
        Ok(part.server_path())
    }

    fn conn_mut(&mut self) -> FtpResult<&mut ControlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| FtpError::disconnected("No connection"))
    }

    fn transfer_mode(&self) -> TransferMode {
        self.conn
            .as_ref()
            .map(|c| c.config().transfer_mode)
            .unwrap_or(self.template.transfer_mode)
    }

    /// Run `fill` on a queue that borrows the connection, then take the
    /// connection back.
    async fn run_operation(
        &mut self,
        cancel: &CancellationToken,
        fill: impl FnOnce(&mut OperationQueue),
    ) -> FtpResult<OperationSummary> {
        let config = OperationConfig {
            max_workers: self.max_workers,
            transfer_mode: self.transfer_mode(),
        };
        let conn = self
            .conn
            .take()
            .ok_or_else(|| FtpError::disconnected("No connection"))?;
        let mut q = OperationQueue::with_connection(conn, config);
        fill(&mut q);
        let queue = Arc::new(Mutex::new(q));

        let token = queue.lock().await.cancel_token();
        let forward = {
            let cancel = cancel.clone();
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => queue.lock().await.cancel_all(),
                    _ = token.cancelled() => {}
                }
            })
        };
        let summary = queue::run(Arc::clone(&queue)).await;
        forward.abort();

        self.conn = queue.lock().await.return_connection();
        if cancel.is_cancelled() {
            return Err(FtpError::cancelled("Operation cancelled"));
        }
        Ok(summary)
    }

    /// Whether `server_path` names a directory, from the listing of its
    /// parent.
    async fn is_directory(&mut self, server_path: &str, cancel: &CancellationToken) -> FtpResult<bool> {
        let conn = self.conn_mut()?;
        let (dir, name) = conn.split_server_path(server_path);
        let (dir, name) = (dir.to_string(), name.to_string());
        if name.is_empty() {
            return Ok(true);
        }
        let listing = conn.list_working_path(&dir, false, cancel).await?;
        let entries = listing
            .entries
            .ok_or_else(|| FtpError::listing_unparsed(format!("Listing of {} could not be parsed", dir)))?;
        entries
            .iter()
            .find(|e| e.name == name)
            .map(FtpEntry::is_dir)
            .ok_or_else(|| FtpError::not_found(format!("{} not found", server_path)))
    }
}

/// Port named by the path, else the default of the security mode.
fn port_for(part: &UserPart, security: SecurityMode) -> u16 {
    match (part.port, security) {
        (Some(port), _) => port,
        (None, SecurityMode::Implicit) => 990,
        (None, _) => 21,
    }
}

#[async_trait]
impl RemoteFileSystem for FtpFileSystem {
    async fn list_current_path(
        &mut self,
        path: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<ListingResult> {
        let server_path = self.resolve(path).await?;
        let mut listing = self
            .conn_mut()?
            .list_working_path(&server_path, force_refresh, cancel)
            .await?;
        if let Some(entries) = listing.entries.as_mut() {
            entries.retain(|e| e.name != "." && e.name != "..");
        }
        Ok(listing)
    }

    async fn change_path(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<String> {
        let server_path = self.resolve(path).await?;
        let conn = self.conn_mut()?;
        let now = conn.change_working_path(&server_path, cancel).await?;
        let mut part = conn.user_part();
        part.path = Some(now.trim_start_matches('/').to_string());
        Ok(part.to_display_string())
    }

    async fn copy_or_move_from_fs(
        &mut self,
        path: &str,
        target_dir: &Path,
        is_move: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<OperationSummary> {
        let server_path = self.resolve(path).await?;
        let is_dir = self.is_directory(&server_path, cancel).await?;
        let name = self.conn_mut()?.split_server_path(&server_path).1.to_string();
        let local = target_dir.join(&name);
        let mut summary = self
            .run_operation(cancel, |q| {
                q.enqueue_download(&server_path, local, is_dir);
            })
            .await?;
        if is_move {
            if summary.failed > 0 || summary.skipped > 0 {
                log::warn!("Not deleting {}: the copy was incomplete", server_path);
                return Ok(summary);
            }
            let removed = self
                .run_operation(cancel, |q| {
                    q.enqueue_delete(&server_path, is_dir);
                })
                .await?;
            summary.done += removed.done;
            summary.skipped += removed.skipped;
            summary.failed += removed.failed;
        }
        Ok(summary)
    }

    async fn delete(&mut self, path: &str, is_dir: bool, cancel: &CancellationToken) -> FtpResult<OperationSummary> {
        let server_path = self.resolve(path).await?;
        self.run_operation(cancel, |q| {
            q.enqueue_delete(&server_path, is_dir);
        })
        .await
    }

    async fn change_attributes(
        &mut self,
        path: &str,
        mode: u32,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> FtpResult<OperationSummary> {
        let server_path = self.resolve(path).await?;
        self.run_operation(cancel, |q| {
            q.enqueue_change_attrs(&server_path, mode, recursive);
        })
        .await
    }

    async fn view_file(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<Vec<u8>> {
        let server_path = self.resolve(path).await?;
        let mode = self.transfer_mode();
        self.conn_mut()?.view_file(&server_path, mode, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::testing::*;

    fn fs(ctx: &Arc<FtpContext>) -> FtpFileSystem {
        let mut template = connection_config(21);
        template.transfer_mode = TransferMode::Binary;
        FtpFileSystem::with_template(Arc::clone(ctx), template)
    }

    fn url(port: u16, path: &str) -> String {
        format!("//bob:secret@127.0.0.1:{}{}", port, path)
    }

    #[tokio::test]
    async fn lists_and_reuses_the_connection() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let cancel = CancellationToken::new();
        let listing = fs
            .list_current_path(&url(server.port, "/pub"), false, &cancel)
            .await
            .unwrap();
        let names: Vec<_> = listing.entries.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["pub", "README.txt"]);

        fs.list_current_path(&url(server.port, "/"), false, &cancel).await.unwrap();
        assert_eq!(server.count("USER"), 1);
        assert_eq!(server.count("LIST"), 2);
    }

    #[tokio::test]
    async fn dot_entries_are_dropped() {
        let listing = "drwxr-xr-x   2 ftp      ftp          4096 Mar  3 09:15 .\r\n\
drwxr-xr-x   2 ftp      ftp          4096 Mar  3 09:15 ..\r\n\
-rw-r--r--   1 ftp      ftp           100 Dec 24  2019 a.txt\r\n";
        let server = mock_server(Behavior {
            tree: Some([("/", listing)].into_iter().collect()),
            ..Default::default()
        })
        .await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let listing = fs
            .list_current_path(&url(server.port, "/"), false, &CancellationToken::new())
            .await
            .unwrap();
        let entries = listing.entries.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }

    #[tokio::test]
    async fn change_path_reports_user_part() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let now = fs
            .change_path(&url(server.port, "/pub/sub"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(now, format!("//bob@127.0.0.1:{}/pub/sub", server.port));
    }

    #[tokio::test]
    async fn invalid_path_is_rejected() {
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let err = fs
            .view_file("//:21/x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ftp::FtpErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn view_file_reads_contents() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let data = fs
            .view_file(&url(server.port, "/pub/README.txt"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data, FILE_CONTENT);
        assert!(server.saw("RETR README.txt"));
    }

    #[tokio::test]
    async fn delete_directory_tree() {
        let server = mock_server(Behavior {
            tree: Some(
                [
                    ("/", LISTING),
                    ("/pub", "-rw-r--r--   1 ftp      ftp           100 Dec 24  2019 x.bin\r\n"),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        })
        .await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let summary = fs
            .delete(&url(server.port, "/pub"), true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.failed, 0);
        assert!(server.saw("DELE x.bin"));
        assert!(server.saw("RMD pub"));
        assert!(fs.connection().is_some());
        assert_eq!(server.count("USER"), 1);
    }

    #[tokio::test]
    async fn move_downloads_then_deletes() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let dir = tempfile::tempdir().unwrap();
        let summary = fs
            .copy_or_move_from_fs(
                &url(server.port, "/pub/README.txt"),
                dir.path(),
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.done, 2);
        assert_eq!(std::fs::read(dir.path().join("README.txt")).unwrap(), FILE_CONTENT);
        assert!(server.saw("DELE README.txt"));
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(false);
        let mut fs = fs(&ctx);
        let dir = tempfile::tempdir().unwrap();
        let err = fs
            .copy_or_move_from_fs(&url(server.port, "/pub/nope"), dir.path(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ftp::FtpErrorKind::NotFound);
    }
}
