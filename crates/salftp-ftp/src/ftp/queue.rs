//! Operation queue: the items of one user operation (delete, change
//! attributes, download, upload) worked off by a few workers, each owning a
//! control connection.
//!
//! Directories are expanded lazily: an `ExploreDir` item lists the
//! directory and enqueues one item per entry. Items may depend on other
//! items; `RMD` of a directory waits for everything inside it, and a failed
//! prerequisite skips its dependents.
//!
//! A worker can adopt the connection of a panel so the operation does not
//! log in again; the connection is handed back with
//! [`OperationQueue::return_connection`] once the operation has finished.

use crate::ftp::context::FtpContext;
use crate::ftp::ctrlcon::ControlConnection;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::paths::{self, ServerPathType};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What an `ExploreDir` item does with the entries it finds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExplorePurpose {
    Delete,
    ChangeAttrs { mode: u32 },
    Download { local_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum OperationItemKind {
    Delete { path: String, is_dir: bool },
    ChangeAttrs { path: String, mode: u32 },
    Download { remote: String, local: PathBuf },
    Upload { local: PathBuf, remote: String },
    ExploreDir { path: String, purpose: ExplorePurpose },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    Waiting,
    Processing,
    Done,
    Skipped,
    Failed,
}

impl ItemState {
    pub fn is_finished(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Skipped | ItemState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationItem {
    pub id: String,
    pub kind: OperationItemKind,
    pub state: ItemState,
    pub error: Option<String>,
    pub transferred: u64,
    /// Items that must be `Done` before this one starts.
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationConfig {
    pub max_workers: usize,
    pub transfer_mode: TransferMode,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            transfer_mode: TransferMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub transferred: u64,
}

enum Readiness {
    Ready,
    Pending,
    Broken,
}

/// Items and connections of one operation.
pub struct OperationQueue {
    pub items: HashMap<String, OperationItem>,
    pub order: VecDeque<String>,
    pub config: OperationConfig,
    ctx: Arc<FtpContext>,
    connection: FtpConnectionConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    adopted: Option<ControlConnection>,
    adopted_in_use: bool,
    idle: Vec<ControlConnection>,
    next_seq: u64,
}

impl OperationQueue {
    pub fn new(ctx: Arc<FtpContext>, connection: FtpConnectionConfig, config: OperationConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            items: HashMap::new(),
            order: VecDeque::new(),
            config,
            ctx,
            connection,
            semaphore,
            cancel: CancellationToken::new(),
            notify: Arc::new(Notify::new()),
            adopted: None,
            adopted_in_use: false,
            idle: Vec::new(),
            next_seq: 0,
        }
    }

    /// Queue for work on the server `conn` is logged in to; the connection
    /// is adopted by the first worker.
    pub fn with_connection(conn: ControlConnection, config: OperationConfig) -> Self {
        let mut q = Self::new(Arc::clone(conn.context()), conn.config().clone(), config);
        q.adopt_connection(conn);
        q
    }

    /// Enqueue an item and return its id.
    pub fn enqueue(&mut self, kind: OperationItemKind) -> String {
        self.enqueue_after(kind, Vec::new())
    }

    /// Enqueue an item that starts once every item in `depends_on` is done.
    pub fn enqueue_after(&mut self, kind: OperationItemKind, depends_on: Vec<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let item = OperationItem {
            id: id.clone(),
            kind,
            state: ItemState::Waiting,
            error: None,
            transferred: 0,
            depends_on,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.items.insert(id.clone(), item);
        self.order.push_back(id.clone());
        id
    }

    /// Delete a file, or a directory with everything in it.
    pub fn enqueue_delete(&mut self, path: &str, is_dir: bool) -> String {
        if !is_dir {
            return self.enqueue(OperationItemKind::Delete {
                path: path.to_string(),
                is_dir: false,
            });
        }
        let explore = self.enqueue(OperationItemKind::ExploreDir {
            path: path.to_string(),
            purpose: ExplorePurpose::Delete,
        });
        self.enqueue_after(
            OperationItemKind::Delete {
                path: path.to_string(),
                is_dir: true,
            },
            vec![explore],
        )
    }

    /// Change the mode of a file, or of a directory and everything in it.
    pub fn enqueue_change_attrs(&mut self, path: &str, mode: u32, recursive: bool) -> String {
        let id = self.enqueue(OperationItemKind::ChangeAttrs {
            path: path.to_string(),
            mode,
        });
        if recursive {
            self.enqueue(OperationItemKind::ExploreDir {
                path: path.to_string(),
                purpose: ExplorePurpose::ChangeAttrs { mode },
            });
        }
        id
    }

    /// Download a file, or a directory tree into `local`.
    pub fn enqueue_download(&mut self, remote: &str, local: PathBuf, is_dir: bool) -> String {
        let kind = if is_dir {
            OperationItemKind::ExploreDir {
                path: remote.to_string(),
                purpose: ExplorePurpose::Download { local_dir: local },
            }
        } else {
            OperationItemKind::Download {
                remote: remote.to_string(),
                local,
            }
        };
        self.enqueue(kind)
    }

    pub fn get(&self, id: &str) -> Option<&OperationItem> {
        self.items.get(id)
    }

    /// All items in the order they were queued.
    pub fn list(&self) -> Vec<&OperationItem> {
        let mut items: Vec<&OperationItem> = self.items.values().collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    /// Skip a waiting item.
    pub fn cancel(&mut self, id: &str) -> FtpResult<()> {
        match self.items.get(id).map(|i| i.state) {
            Some(ItemState::Waiting) => {
                self.mark_skipped(id, "Cancelled");
                Ok(())
            }
            Some(state) => Err(FtpError::invalid_config(format!(
                "Cannot cancel an item in state {:?}",
                state
            ))),
            None => Err(FtpError::not_found(format!("Item {} not found", id))),
        }
    }

    /// Stop the operation: running items are aborted, waiting ones skipped.
    pub fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.skip_waiting("Cancelled");
    }

    fn skip_waiting(&mut self, reason: &str) {
        let now = Utc::now();
        for item in self.items.values_mut() {
            if item.state == ItemState::Waiting {
                item.state = ItemState::Skipped;
                item.error = Some(reason.to_string());
                item.completed_at = Some(now);
            }
        }
        self.order.clear();
        self.notify.notify_waiters();
    }

    /// Queue a failed or skipped item again.
    pub fn retry(&mut self, id: &str) -> FtpResult<()> {
        let item = self
            .items
            .get_mut(id)
            .ok_or_else(|| FtpError::not_found(format!("Item {} not found", id)))?;
        if !matches!(item.state, ItemState::Failed | ItemState::Skipped) {
            return Err(FtpError::invalid_config("Can only retry failed or skipped items"));
        }
        if self.cancel.is_cancelled() {
            return Err(FtpError::cancelled("The operation was cancelled"));
        }
        item.state = ItemState::Waiting;
        item.error = None;
        item.started_at = None;
        item.completed_at = None;
        self.order.push_back(id.to_string());
        Ok(())
    }

    fn readiness(&self, item: &OperationItem) -> Readiness {
        let mut pending = false;
        for dep in &item.depends_on {
            match self.items.get(dep).map(|d| d.state) {
                Some(ItemState::Done) | None => {}
                Some(ItemState::Failed | ItemState::Skipped) => return Readiness::Broken,
                Some(ItemState::Waiting | ItemState::Processing) => pending = true,
            }
        }
        if pending {
            Readiness::Pending
        } else {
            Readiness::Ready
        }
    }

    /// Next item whose prerequisites are done. Items with a failed
    /// prerequisite are skipped on the way.
    pub fn next_pending(&mut self) -> Option<String> {
        let mut i = 0;
        while i < self.order.len() {
            let id = self.order[i].clone();
            let readiness = match self.items.get(&id) {
                Some(item) if item.state == ItemState::Waiting => self.readiness(item),
                _ => {
                    self.order.remove(i);
                    continue;
                }
            };
            match readiness {
                Readiness::Ready => {
                    self.order.remove(i);
                    return Some(id);
                }
                Readiness::Pending => i += 1,
                Readiness::Broken => {
                    self.order.remove(i);
                    self.mark_skipped(&id, "A prerequisite item failed");
                }
            }
        }
        None
    }

    /// Some item has not started yet.
    pub fn has_waiting(&self) -> bool {
        self.items.values().any(|i| i.state == ItemState::Waiting)
    }

    pub fn is_finished(&self) -> bool {
        self.items.values().all(|i| i.state.is_finished())
    }

    pub fn mark_started(&mut self, id: &str) {
        if let Some(item) = self.items.get_mut(id) {
            item.state = ItemState::Processing;
            item.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self, id: &str, transferred: u64) {
        self.finish(id, ItemState::Done, None, transferred);
    }

    pub fn mark_failed(&mut self, id: &str, error: &str) {
        self.finish(id, ItemState::Failed, Some(error), 0);
    }

    pub fn mark_skipped(&mut self, id: &str, reason: &str) {
        self.finish(id, ItemState::Skipped, Some(reason), 0);
    }

    fn finish(&mut self, id: &str, state: ItemState, error: Option<&str>, transferred: u64) {
        if let Some(item) = self.items.get_mut(id) {
            item.state = state;
            item.error = error.map(str::to_string);
            item.transferred = transferred;
            item.completed_at = Some(Utc::now());
        }
        self.notify.notify_waiters();
    }

    pub fn summary(&self) -> OperationSummary {
        let mut s = OperationSummary::default();
        for item in self.items.values() {
            match item.state {
                ItemState::Done => s.done += 1,
                ItemState::Skipped => s.skipped += 1,
                ItemState::Failed => s.failed += 1,
                ItemState::Waiting | ItemState::Processing => {}
            }
            s.transferred += item.transferred;
        }
        s
    }

    /// Turn the entries of an explored directory into items. Whatever
    /// depended on the explore item now also depends on the new items.
    fn expand(
        &mut self,
        explore_id: &str,
        dir: &str,
        purpose: &ExplorePurpose,
        entries: Vec<FtpEntry>,
        path_type: ServerPathType,
    ) {
        let dependents: Vec<String> = self
            .items
            .values()
            .filter(|i| i.depends_on.iter().any(|d| d == explore_id))
            .map(|i| i.id.clone())
            .collect();
        let mut added = Vec::new();
        for entry in entries {
            if !is_plain_name(&entry.name) {
                log::warn!("Skipping entry {:?} of {}", entry.name, dir);
                continue;
            }
            let path = paths::join_server_path(path_type, dir, &entry.name);
            let is_dir = entry.kind == FtpEntryKind::Directory;
            match (purpose, is_dir) {
                (ExplorePurpose::Delete, false) => {
                    added.push(self.enqueue(OperationItemKind::Delete { path, is_dir: false }));
                }
                (ExplorePurpose::Delete, true) => {
                    let explore = self.enqueue(OperationItemKind::ExploreDir {
                        path: path.clone(),
                        purpose: ExplorePurpose::Delete,
                    });
                    let rmd = self.enqueue_after(
                        OperationItemKind::Delete { path, is_dir: true },
                        vec![explore.clone()],
                    );
                    added.push(explore);
                    added.push(rmd);
                }
                (ExplorePurpose::ChangeAttrs { mode }, _) => {
                    added.push(self.enqueue(OperationItemKind::ChangeAttrs {
                        path: path.clone(),
                        mode: *mode,
                    }));
                    if is_dir {
                        added.push(self.enqueue(OperationItemKind::ExploreDir {
                            path,
                            purpose: purpose.clone(),
                        }));
                    }
                }
                (ExplorePurpose::Download { local_dir }, false) => {
                    added.push(self.enqueue(OperationItemKind::Download {
                        remote: path,
                        local: local_dir.join(&entry.name),
                    }));
                }
                (ExplorePurpose::Download { local_dir }, true) => {
                    added.push(self.enqueue(OperationItemKind::ExploreDir {
                        path,
                        purpose: ExplorePurpose::Download {
                            local_dir: local_dir.join(&entry.name),
                        },
                    }));
                }
            }
        }
        for id in &dependents {
            if let Some(item) = self.items.get_mut(id) {
                item.depends_on.extend(added.iter().cloned());
            }
        }
        log::debug!("{} expanded into {} item(s)", dir, added.len());
    }

    // ─── Connections ─────────────────────────────────────────────────

    /// Take over a logged-in connection for this operation.
    pub fn adopt_connection(&mut self, conn: ControlConnection) {
        log::info!(
            "Operation adopts connection to {}:{}",
            conn.config().host,
            conn.config().port
        );
        self.adopted = Some(conn);
        self.adopted_in_use = false;
    }

    /// Hand the adopted connection back once no worker uses it.
    pub fn return_connection(&mut self) -> Option<ControlConnection> {
        if self.adopted_in_use {
            return None;
        }
        self.adopted.take()
    }

    /// Connection for a worker: the adopted one first, then an idle one,
    /// then a new one. The flag tells whether it is the adopted one.
    pub fn take_connection(&mut self) -> (ControlConnection, bool) {
        if !self.adopted_in_use {
            if let Some(conn) = self.adopted.take() {
                self.adopted_in_use = true;
                return (conn, true);
            }
        }
        if let Some(conn) = self.idle.pop() {
            return (conn, false);
        }
        (
            ControlConnection::new(Arc::clone(&self.ctx), self.connection.clone()),
            false,
        )
    }

    pub fn put_connection(&mut self, conn: ControlConnection, adopted: bool) {
        if adopted {
            self.adopted = Some(conn);
            self.adopted_in_use = false;
        } else {
            self.idle.push(conn);
        }
    }

    /// Remove the connections opened by workers; the caller disconnects them.
    pub fn take_idle_connections(&mut self) -> Vec<ControlConnection> {
        std::mem::take(&mut self.idle)
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// A listing name that is safe to use as a path component.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Result of one worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Processed,
    /// Waiting items exist but depend on items still in progress.
    Blocked,
    Idle,
}

enum Outcome {
    Transferred(u64),
    Explored(Vec<FtpEntry>, ServerPathType),
}

async fn execute(
    kind: &OperationItemKind,
    conn: &mut ControlConnection,
    mode: TransferMode,
    cancel: &CancellationToken,
) -> FtpResult<Outcome> {
    match kind {
        OperationItemKind::Delete { path, is_dir } => {
            conn.delete(path, *is_dir, cancel).await?;
            Ok(Outcome::Transferred(0))
        }
        OperationItemKind::ChangeAttrs { path, mode } => {
            conn.change_attributes(path, *mode, cancel).await?;
            Ok(Outcome::Transferred(0))
        }
        OperationItemKind::Download { remote, local } => {
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            conn.download(remote, local, mode, cancel).await.map(Outcome::Transferred)
        }
        OperationItemKind::Upload { local, remote } => {
            conn.upload(local, remote, mode, cancel).await.map(Outcome::Transferred)
        }
        OperationItemKind::ExploreDir { path, purpose } => {
            if let ExplorePurpose::Download { local_dir } = purpose {
                tokio::fs::create_dir_all(local_dir).await?;
            }
            let refresh = *purpose == ExplorePurpose::Delete;
            let listing = conn.list_working_path(path, refresh, cancel).await?;
            if listing.incomplete {
                return Err(FtpError::transfer_failed(format!(
                    "Listing of {} is incomplete",
                    path
                )));
            }
            let entries = listing.entries.ok_or_else(|| {
                FtpError::listing_unparsed(format!("Listing of {} could not be parsed", path))
            })?;
            Ok(Outcome::Explored(entries, conn.path_type()))
        }
    }
}

/// Run the next ready item on `conn`.
pub async fn process_next(queue: &Arc<Mutex<OperationQueue>>, conn: &mut ControlConnection) -> Step {
    let (id, kind, mode, cancel, sem) = {
        let mut q = queue.lock().await;
        if q.cancel.is_cancelled() {
            q.skip_waiting("Cancelled");
            return Step::Idle;
        }
        let Some(id) = q.next_pending() else {
            return if q.has_waiting() { Step::Blocked } else { Step::Idle };
        };
        let Some(item) = q.items.get(&id) else {
            return Step::Processed;
        };
        let kind = item.kind.clone();
        q.mark_started(&id);
        (id, kind, q.config.transfer_mode, q.cancel_token(), q.semaphore())
    };

    let _permit = match sem.acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            queue.lock().await.mark_failed(&id, "Worker slots closed");
            return Step::Processed;
        }
    };

    let result = execute(&kind, conn, mode, &cancel).await;

    let mut q = queue.lock().await;
    match result {
        Ok(Outcome::Transferred(n)) => q.mark_completed(&id, n),
        Ok(Outcome::Explored(entries, path_type)) => {
            if let OperationItemKind::ExploreDir { path, purpose } = &kind {
                q.expand(&id, path, purpose, entries, path_type);
            }
            q.mark_completed(&id, 0);
        }
        Err(e) if e.kind == FtpErrorKind::Cancelled => q.mark_skipped(&id, &e.message),
        Err(e) => {
            log::warn!("Operation item {:?} failed: {}", kind, e);
            q.mark_failed(&id, &e.to_string());
        }
    }
    Step::Processed
}

/// One worker: takes a connection and processes items until none are left.
pub async fn run_worker(queue: Arc<Mutex<OperationQueue>>) {
    let (mut conn, adopted, notify) = {
        let mut q = queue.lock().await;
        let (conn, adopted) = q.take_connection();
        (conn, adopted, q.notify())
    };
    loop {
        let notified = notify.notified();
        match process_next(&queue, &mut conn).await {
            Step::Processed => {}
            Step::Blocked => notified.await,
            Step::Idle => break,
        }
    }
    queue.lock().await.put_connection(conn, adopted);
}

/// Run the operation to the end with `max_workers` workers. Connections
/// opened by workers are closed; an adopted one stays in the queue.
pub async fn run(queue: Arc<Mutex<OperationQueue>>) -> OperationSummary {
    let workers = queue.lock().await.config.max_workers.max(1);
    let handles: Vec<_> = (0..workers)
        .map(|_| tokio::spawn(run_worker(Arc::clone(&queue))))
        .collect();
    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("Operation worker ended abnormally: {}", e);
        }
    }
    let idle = queue.lock().await.take_idle_connections();
    for mut conn in idle {
        if let Err(e) = conn.disconnect().await {
            log::debug!("Disconnect after operation failed: {}", e);
        }
    }
    let summary = queue.lock().await.summary();
    log::info!(
        "Operation finished: {} done, {} skipped, {} failed",
        summary.done,
        summary.skipped,
        summary.failed
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::socket::NoUserInterface;
    use crate::ftp::testing::*;

    const DIR: &str = "drwxr-xr-x   2 ftp      ftp          4096 Mar  3 09:15 sub\r\n\
-rw-r--r--   1 ftp      ftp           100 Dec 24  2019 a.txt\r\n";
    const SUB: &str = "-rw-r--r--   1 ftp      ftp           100 Dec 24  2019 b.txt\r\n";

    fn tree() -> Behavior {
        Behavior {
            tree: Some([("/data", DIR), ("/data/sub", SUB)].into_iter().collect()),
            ..Default::default()
        }
    }

    fn binary(workers: usize) -> OperationConfig {
        OperationConfig {
            max_workers: workers,
            transfer_mode: TransferMode::Binary,
        }
    }

    fn queue(port: u16, workers: usize) -> Arc<Mutex<OperationQueue>> {
        let ctx = context(true);
        Arc::new(Mutex::new(OperationQueue::new(ctx, connection_config(port), binary(workers))))
    }

    #[tokio::test]
    async fn dependencies_gate_items() {
        let mut q = OperationQueue::new(context(true), connection_config(21), binary(1));
        let a = q.enqueue(OperationItemKind::Delete {
            path: "/a".into(),
            is_dir: false,
        });
        let b = q.enqueue_after(
            OperationItemKind::Delete {
                path: "/".into(),
                is_dir: true,
            },
            vec![a.clone()],
        );
        assert_eq!(q.next_pending(), Some(a.clone()));
        q.mark_started(&a);
        assert_eq!(q.next_pending(), None);
        assert!(q.has_waiting());
        q.mark_completed(&a, 0);
        assert_eq!(q.next_pending(), Some(b.clone()));
        assert_eq!(q.list().iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec![a, b]);
    }

    #[tokio::test]
    async fn failed_prerequisite_skips_dependents() {
        let mut q = OperationQueue::new(context(true), connection_config(21), binary(1));
        let a = q.enqueue(OperationItemKind::Delete {
            path: "/a".into(),
            is_dir: false,
        });
        let b = q.enqueue_after(
            OperationItemKind::Delete {
                path: "/".into(),
                is_dir: true,
            },
            vec![a.clone()],
        );
        q.next_pending();
        q.mark_failed(&a, "550 Failed");
        assert_eq!(q.next_pending(), None);
        assert_eq!(q.get(&b).unwrap().state, ItemState::Skipped);
        assert!(q.is_finished());

        q.retry(&a).unwrap();
        assert_eq!(q.get(&a).unwrap().state, ItemState::Waiting);
        tokio_test::assert_ok!(q.retry(&b));
        tokio_test::assert_err!(q.cancel("missing"));
    }

    #[tokio::test]
    async fn cancel_all_skips_waiting_items() {
        let server = mock_server(Behavior::default()).await;
        let q = queue(server.port, 1);
        {
            let mut q = q.lock().await;
            q.enqueue_delete("/pub/README.txt", false);
            q.cancel_all();
            let id = q.list()[0].id.clone();
            assert!(q.retry(&id).is_err());
        }
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(server.count("DELE"), 0);
    }

    #[tokio::test]
    async fn recursive_delete_removes_children_first() {
        let server = mock_server(tree()).await;
        let q = queue(server.port, 2);
        q.lock().await.enqueue_delete("/data", true);
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.done, 6);

        let rmd_sub = server.position("RMD sub").unwrap();
        let rmd_data = server.position("RMD data").unwrap();
        assert!(server.position("DELE b.txt").unwrap() < rmd_sub);
        assert!(server.position("DELE a.txt").unwrap() < rmd_data);
        assert!(rmd_sub < rmd_data);
    }

    #[tokio::test]
    async fn failed_child_keeps_directory() {
        let mut behavior = tree();
        behavior.refuse = Some("DELE a.txt");
        let server = mock_server(behavior).await;
        let q = queue(server.port, 1);
        q.lock().await.enqueue_delete("/data", true);
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.failed, 1);
        assert!(!server.saw("RMD data"));
        assert!(server.saw("RMD sub"));
        let q = q.lock().await;
        let failed: Vec<_> = q.list().into_iter().filter(|i| i.state == ItemState::Failed).collect();
        assert!(failed[0].error.as_deref().unwrap().contains("Failed"));
    }

    #[tokio::test]
    async fn recursive_change_attributes() {
        let server = mock_server(tree()).await;
        let q = queue(server.port, 1);
        q.lock().await.enqueue_change_attrs("/data", 0o755, true);
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.failed, 0);
        assert!(server.saw("SITE CHMOD 755 data"));
        assert!(server.saw("SITE CHMOD 755 sub"));
        assert!(server.saw("SITE CHMOD 755 a.txt"));
        assert!(server.saw("SITE CHMOD 755 b.txt"));
    }

    #[tokio::test]
    async fn downloads_a_tree() {
        let server = mock_server(tree()).await;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        let q = queue(server.port, 2);
        q.lock().await.enqueue_download("/data", target.clone(), true);
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.failed, 0);
        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), FILE_CONTENT);
        assert_eq!(std::fs::read(target.join("sub").join("b.txt")).unwrap(), FILE_CONTENT);
        assert_eq!(summary.transferred, 2 * FILE_CONTENT.len() as u64);
    }

    #[tokio::test]
    async fn uploads_a_file() {
        let server = mock_server(Behavior::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.bin");
        std::fs::write(&local, b"\x00\x01payload").unwrap();
        let q = queue(server.port, 1);
        q.lock().await.enqueue(OperationItemKind::Upload {
            local,
            remote: "/pub/up.bin".into(),
        });
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.failed, 0);
        let uploads = server.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, "/pub/up.bin");
        assert_eq!(uploads[0].1, b"\x00\x01payload");
    }

    #[tokio::test]
    async fn adopted_connection_is_returned() {
        let server = mock_server(Behavior::default()).await;
        let ctx = context(true);
        let mut conn = connection(&ctx, server.port);
        conn.connect(&CancellationToken::new(), &NoUserInterface).await.unwrap();

        let q = Arc::new(Mutex::new(OperationQueue::with_connection(conn, binary(1))));
        q.lock().await.enqueue_delete("/pub/README.txt", false);
        let summary = run(Arc::clone(&q)).await;
        assert_eq!(summary.done, 1);
        assert_eq!(server.count("USER"), 1);

        let back = q.lock().await.return_connection().unwrap();
        assert!(back.is_connected());
        assert!(q.lock().await.return_connection().is_none());
    }

    #[test]
    fn odd_names_are_not_used_as_paths() {
        assert!(is_plain_name("a.txt"));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name(""));
    }
}
