//! The `file` archive module: watches directory trees for closed log files,
//! schedules uploads through a bounded worker pool, deletes sources after
//! upload, and reports disk and queue telemetry.
//!
//! All per-file state lives in the event loop task; workers only carry
//! immutable job data and report outcomes back over the notification
//! channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sysinfo::{DiskExt, System, SystemExt};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use logvault_core::{
    decode_module, ArchiveMetrics, ArchiveModule, CancelToken, Context, CoreError, CoreResult,
    Module, ModuleId, ModuleInfo, Outputter, RawConfig,
};

use crate::cache::{CacheEntry, CacheKey, FileCache, FileInfo, FileStatus};

/// Module id; also the `module` label on the archive's metrics.
pub const MODULE_ID: &str = "file";

/// Reason label on `logarchive_input_discard_total` when a file exhausts its
/// upload retries.
///
/// Shares its numeric value with the output module's invalid-param code
/// (`crate::cos::CODE_INVALID_PARAM`) by historical accident; the two live
/// in different metric namespaces (`reason` on input discards vs `code` on
/// output requests) and must stay separate constants.
pub const DISCARD_REASON_MAX_RETRY: i64 = -10000;

const MAX_UPLOAD_ATTEMPTS: u32 = 3;
const MAX_DELETE_ATTEMPTS: u32 = 3;

const TASK_QUEUE_CAPACITY: usize = 1000;
const NOTIFY_QUEUE_CAPACITY: usize = 100;
const DELETE_QUEUE_CAPACITY: usize = 100;
const WATCHER_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// What happens to the source file when its upload retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalPolicy {
    /// Delete the source anyway; the file is treated as processed.
    #[default]
    Delete,
    /// Leave the source on disk for operator inspection.
    Keep,
}

/// How collected source files are handled.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectRule {
    /// Leave uploaded files on disk instead of deleting them.
    pub keep_source_file: bool,
    /// Quiescence window in seconds: a file is eligible for upload only
    /// once `mtime + modifyProtectTime` has passed.
    pub modify_protect_time: i64,
    /// Applies only when `keepSourceFile` is false and retries ran out.
    pub on_terminal: TerminalPolicy,
}

/// The `file` archive module configuration and runtime state.
#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileArchive {
    /// Concurrent upload (and delete) workers.
    pub pool_size: usize,
    /// Root directories to watch, recursively.
    pub paths: Vec<PathBuf>,
    /// Files whose absolute path matches any pattern are ignored.
    pub exclude_files: Vec<String>,
    pub collect_rule: CollectRule,
    /// Nested output module config; `type` selects the module.
    pub output: RawConfig,
    /// Event-loop tick period in milliseconds.
    pub tick_interval: u64,

    #[serde(skip)]
    state: State,
    #[serde(skip)]
    output_override: Option<Arc<dyn Outputter>>,
}

impl Default for FileArchive {
    fn default() -> Self {
        Self {
            pool_size: 0,
            paths: Vec::new(),
            exclude_files: Vec::new(),
            collect_rule: CollectRule::default(),
            output: RawConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL_MS,
            state: State::Idle,
            output_override: None,
        }
    }
}

#[derive(Default)]
enum State {
    #[default]
    Idle,
    Provisioned(Box<Provisioned>),
    Running(Running),
}

struct Provisioned {
    output: Arc<dyn Outputter>,
    excludes: Vec<Regex>,
    watcher: RecommendedWatcher,
    watcher_rx: mpsc::Receiver<Result<Event, notify::Error>>,
    cache: FileCache,
    metrics: Arc<ArchiveMetrics>,
    cancel: CancelToken,
    tasks_tx: mpsc::Sender<UploadJob>,
    tasks_rx: mpsc::Receiver<UploadJob>,
    notify_tx: mpsc::Sender<Notification>,
    notify_rx: mpsc::Receiver<Notification>,
    delete_tx: mpsc::Sender<CacheKey>,
    delete_rx: mpsc::Receiver<CacheKey>,
    done: watch::Sender<bool>,
}

struct Running {
    done: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct UploadJob {
    watch_path: PathBuf,
    root_path: PathBuf,
    file_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyKind {
    OutputResult,
    DeleteResult,
}

#[derive(Debug)]
struct Notification {
    kind: NotifyKind,
    watch_path: PathBuf,
    file_path: PathBuf,
    result: bool,
}

impl FileArchive {
    /// Registry entry for this module.
    pub fn module_info() -> ModuleInfo {
        ModuleInfo {
            id: ModuleId::from(MODULE_ID),
            new: |raw| Ok(Box::new(decode_module::<FileArchive>(raw)?) as Box<dyn Module>),
        }
    }
}

#[async_trait]
impl Module for FileArchive {
    async fn provision(&mut self, ctx: &Context) -> CoreResult<()> {
        if self.pool_size == 0 {
            self.pool_size = 1;
        }
        if self.tick_interval == 0 {
            self.tick_interval = DEFAULT_TICK_INTERVAL_MS;
        }

        // load the output module, then release the raw blob
        let output = match self.output_override.take() {
            Some(output) => output,
            None => {
                let raw = std::mem::take(&mut self.output);
                let module = ctx
                    .registry()
                    .load_inline("output", "type", &raw, ctx)
                    .await?;
                module.as_output().ok_or(CoreError::MissingCapability {
                    id: "output".to_string(),
                    capability: "output",
                })?
            }
        };
        self.output = RawConfig::default();

        let mut excludes = Vec::with_capacity(self.exclude_files.len());
        for pattern in &self.exclude_files {
            let re = Regex::new(pattern).map_err(|e| {
                CoreError::InvalidConfig(format!("invalid exclude file pattern {pattern}: {e}"))
            })?;
            excludes.push(re);
        }

        let (watch_tx, watcher_rx) = mpsc::channel(WATCHER_QUEUE_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = watch_tx.blocking_send(event);
            },
            notify::Config::default(),
        )
        .map_err(|e| CoreError::Module(format!("new watcher: {e}")))?;

        let mut cache = FileCache::default();
        for root in &self.paths {
            for dir in collect_dirs(root)? {
                add_watch_path(
                    &mut watcher,
                    &mut cache,
                    root,
                    &dir,
                    &excludes,
                    &self.collect_rule,
                )?;
            }
        }

        let (tasks_tx, tasks_rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_CAPACITY);
        let (delete_tx, delete_rx) = mpsc::channel(DELETE_QUEUE_CAPACITY);
        let (done, _) = watch::channel(false);

        self.state = State::Provisioned(Box::new(Provisioned {
            output,
            excludes,
            watcher,
            watcher_rx,
            cache,
            metrics: ctx.metrics().clone(),
            cancel: ctx.cancel_token().clone(),
            tasks_tx,
            tasks_rx,
            notify_tx,
            notify_rx,
            delete_tx,
            delete_rx,
            done,
        }));
        Ok(())
    }

    async fn validate(&self) -> CoreResult<()> {
        for path in &self.paths {
            std::fs::metadata(path).map_err(|e| {
                CoreError::InvalidConfig(format!("watch path {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    fn as_archive(self: Box<Self>) -> Option<Box<dyn ArchiveModule>> {
        Some(self)
    }
}

#[async_trait]
impl ArchiveModule for FileArchive {
    async fn start(&mut self) -> CoreResult<()> {
        let p = match std::mem::take(&mut self.state) {
            State::Provisioned(p) => p,
            other => {
                self.state = other;
                return Err(CoreError::Module("archive not provisioned".into()));
            }
        };
        let Provisioned {
            output,
            excludes,
            watcher,
            watcher_rx,
            cache,
            metrics,
            cancel,
            tasks_tx,
            tasks_rx,
            notify_tx,
            notify_rx,
            delete_tx,
            delete_rx,
            done,
        } = *p;

        let mut handles = Vec::new();
        let tasks_rx = Arc::new(TokioMutex::new(tasks_rx));
        let delete_rx = Arc::new(TokioMutex::new(delete_rx));

        for _ in 0..self.pool_size {
            handles.push(tokio::spawn(upload_worker(
                cancel.clone(),
                done.subscribe(),
                tasks_rx.clone(),
                output.clone(),
                notify_tx.clone(),
            )));
            if !self.collect_rule.keep_source_file {
                handles.push(tokio::spawn(delete_worker(
                    cancel.clone(),
                    done.subscribe(),
                    delete_rx.clone(),
                    notify_tx.clone(),
                )));
            }
        }
        drop(notify_tx);

        let event_loop = EventLoop {
            cache,
            watcher,
            watcher_rx,
            notify_rx,
            tasks_tx,
            delete_tx,
            excludes,
            paths: self.paths.clone(),
            rule: self.collect_rule.clone(),
            metrics,
            cancel,
            done: done.subscribe(),
            tick: Duration::from_millis(self.tick_interval),
            system: System::new(),
        };
        handles.push(tokio::spawn(event_loop.run()));

        self.state = State::Running(Running { done, handles });
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        let State::Running(running) = &mut self.state else {
            return Ok(());
        };
        if *running.done.borrow() {
            return Ok(());
        }
        let _ = running.done.send(true);
        for handle in running.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}

struct EventLoop {
    cache: FileCache,
    /// Kept alive here: dropping the watcher stops event delivery. New
    /// directories are registered with it as they appear.
    watcher: RecommendedWatcher,
    watcher_rx: mpsc::Receiver<Result<Event, notify::Error>>,
    notify_rx: mpsc::Receiver<Notification>,
    tasks_tx: mpsc::Sender<UploadJob>,
    delete_tx: mpsc::Sender<CacheKey>,
    excludes: Vec<Regex>,
    paths: Vec<PathBuf>,
    rule: CollectRule,
    metrics: Arc<ArchiveMetrics>,
    cancel: CancelToken,
    done: watch::Receiver<bool>,
    tick: Duration,
    system: System,
}

impl EventLoop {
    async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.tick;
        let mut ticker = tokio::time::interval_at(start, self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = self.done.changed() => {
                    if changed.is_err() || *self.done.borrow() {
                        return;
                    }
                }
                notification = self.notify_rx.recv() => match notification {
                    Some(notification) => self.handle_task_notify(notification).await,
                    None => return,
                },
                event = self.watcher_rx.recv() => match event {
                    Some(Ok(event)) => {
                        debug!(target: "file", "fs event notify paths: {:?} kind: {:?}", event.paths, event.kind);
                        if let Err(err) = self.handle_watcher_event(event) {
                            error!(target: "file", "handle watcher event: {err}");
                        }
                    }
                    Some(Err(err)) => error!(target: "file", "watcher error: {err}"),
                    None => return,
                },
                _ = ticker.tick() => self.handle_tick(),
            }
        }
    }

    fn handle_watcher_event(&mut self, event: Event) -> CoreResult<()> {
        // renames surface as modify events, so a plain remove really is one
        if matches!(event.kind, EventKind::Remove(_)) {
            for path in &event.paths {
                self.cache.remove_dir(path);
            }
            return Ok(());
        }

        // only care about the create event
        if !matches!(event.kind, EventKind::Create(_)) {
            return Ok(());
        }

        for path in event.paths {
            let meta = std::fs::metadata(&path)?;

            if meta.is_dir() {
                let root = self
                    .paths
                    .iter()
                    .find(|root| path.starts_with(root))
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::Module(format!(
                            "path: {} has no matched base path",
                            path.display()
                        ))
                    })?;
                add_watch_path(
                    &mut self.watcher,
                    &mut self.cache,
                    &root,
                    &path,
                    &self.excludes,
                    &self.rule,
                )?;
                continue;
            }

            if is_excluded(&self.excludes, &path) {
                continue;
            }

            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let entry = self.cache.entry_mut(&parent).ok_or_else(|| {
                CoreError::Module(format!("watch path: {} not found", parent.display()))
            })?;
            let protected = mtime_unix(&meta) + self.rule.modify_protect_time;
            entry.files.insert(path.clone(), FileInfo::waiting(protected));
            debug!(target: "file", "file {} has been added into watch list", path.display());
        }
        Ok(())
    }

    fn handle_tick(&mut self) {
        self.system.refresh_disks_list();
        for root in &self.paths {
            if let Some((fstype, used_percent)) = disk_usage(&self.system, root) {
                self.metrics
                    .disk_usage
                    .with_label_values(&[MODULE_ID, &root.to_string_lossy(), &fstype])
                    .set(used_percent);
            }
        }

        let now = unix_now();
        for (watch_path, entry) in self.cache.iter_mut() {
            let tracked: Vec<PathBuf> = entry.files.keys().cloned().collect();
            for file_path in tracked {
                let Some(info) = entry.files.get_mut(&file_path) else {
                    continue;
                };
                if info.status != FileStatus::WaitUpload || info.protected_end_time > now {
                    continue;
                }

                let meta = match std::fs::metadata(&file_path) {
                    Ok(meta) => meta,
                    Err(_) => {
                        // vanished between detection and upload
                        entry.files.remove(&file_path);
                        continue;
                    }
                };

                let protected = mtime_unix(&meta) + self.rule.modify_protect_time;
                if protected > now {
                    // still being written; restart the window
                    info.protected_end_time = protected;
                    continue;
                }

                if info.upload_failed_count == 0 {
                    self.metrics
                        .input_request_size
                        .with_label_values(&[MODULE_ID])
                        .observe(meta.len() as f64);
                }

                info.status = FileStatus::Uploading;
                let job = UploadJob {
                    watch_path: watch_path.clone(),
                    root_path: entry.root_path.clone(),
                    file_path: file_path.clone(),
                };
                if self.tasks_tx.try_send(job).is_err() {
                    // queue full; the next tick retries
                    if let Some(info) = entry.files.get_mut(&file_path) {
                        info.status = FileStatus::WaitUpload;
                    }
                }
            }
        }

        let queued = (self.tasks_tx.max_capacity() - self.tasks_tx.capacity()) as i64;
        self.metrics
            .input_queue_size
            .with_label_values(&[MODULE_ID])
            .set(queued);
    }

    async fn handle_task_notify(&mut self, n: Notification) {
        debug!(
            target: "file",
            "task notify kind: {:?}, watchpath: {}, filepath: {}, result: {}",
            n.kind,
            n.watch_path.display(),
            n.file_path.display(),
            n.result
        );

        match n.kind {
            NotifyKind::OutputResult => {
                let Some(info) = self.cache.get_file_mut(&n.watch_path, &n.file_path) else {
                    return;
                };

                if !n.result {
                    info.upload_failed_count += 1;
                    // retry on the next tick
                    if info.upload_failed_count < MAX_UPLOAD_ATTEMPTS {
                        info.status = FileStatus::WaitUpload;
                        info.protected_end_time = unix_now() + self.rule.modify_protect_time;
                        return;
                    }
                }

                if n.result {
                    info.status = FileStatus::Uploaded;
                } else {
                    let failed = info.upload_failed_count;
                    self.metrics
                        .input_discard_total
                        .with_label_values(&[MODULE_ID, &DISCARD_REASON_MAX_RETRY.to_string()])
                        .inc();
                    error!(
                        target: "file",
                        "path: {} output task execute has failed {failed} times",
                        n.file_path.display()
                    );
                }

                let delete_source = !self.rule.keep_source_file
                    && (n.result || self.rule.on_terminal == TerminalPolicy::Delete);
                if delete_source {
                    let key = CacheKey {
                        watch_path: n.watch_path.clone(),
                        file_path: n.file_path.clone(),
                    };
                    let _ = self.delete_tx.send(key).await;
                } else {
                    self.cache.remove_file(&n.watch_path, &n.file_path);
                    debug!(
                        target: "file",
                        "file {} has been removed from watch list",
                        n.file_path.display()
                    );
                }
            }
            NotifyKind::DeleteResult => {
                let Some(info) = self.cache.get_file_mut(&n.watch_path, &n.file_path) else {
                    return;
                };

                if !n.result {
                    info.delete_failed_count += 1;
                    // try delete again
                    if info.delete_failed_count < MAX_DELETE_ATTEMPTS {
                        let key = CacheKey {
                            watch_path: n.watch_path.clone(),
                            file_path: n.file_path.clone(),
                        };
                        let _ = self.delete_tx.send(key).await;
                        return;
                    }
                }

                self.cache.remove_file(&n.watch_path, &n.file_path);
                debug!(
                    target: "file",
                    "file {} has been removed from watch list",
                    n.file_path.display()
                );
            }
        }
    }
}

async fn upload_worker(
    cancel: CancelToken,
    mut done: watch::Receiver<bool>,
    tasks_rx: Arc<TokioMutex<mpsc::Receiver<UploadJob>>>,
    output: Arc<dyn Outputter>,
    notify_tx: mpsc::Sender<Notification>,
) {
    debug!(target: "file", "output task start");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = closed(&mut done) => return,
            job = recv_shared(&tasks_rx) => match job {
                Some(job) => job,
                None => return,
            },
        };

        // in-flight uploads run to completion on graceful stop, but a hard
        // cancel aborts the remote call
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = run_upload(&output, &job) => result,
        };

        let notification = Notification {
            kind: NotifyKind::OutputResult,
            watch_path: job.watch_path,
            file_path: job.file_path,
            result,
        };
        if notify_tx.send(notification).await.is_err() {
            return;
        }
    }
}

async fn run_upload(output: &Arc<dyn Outputter>, job: &UploadJob) -> bool {
    let mut task = output.new_task();
    task.root_path = job.root_path.clone();
    task.file_path = job.file_path.clone();

    match output.execute(&task).await {
        Ok(()) => true,
        Err(err) => {
            error!(
                target: "file",
                "execute output task failed: {err}, filepath: {}",
                job.file_path.display()
            );
            false
        }
    }
}

async fn delete_worker(
    cancel: CancelToken,
    mut done: watch::Receiver<bool>,
    delete_rx: Arc<TokioMutex<mpsc::Receiver<CacheKey>>>,
    notify_tx: mpsc::Sender<Notification>,
) {
    debug!(target: "file", "delete file task start");
    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = closed(&mut done) => return,
            key = recv_shared(&delete_rx) => match key {
                Some(key) => key,
                None => return,
            },
        };

        let result = match tokio::fs::remove_file(&key.file_path).await {
            Ok(()) => {
                info!(
                    target: "file",
                    "file {} has been removed successfully",
                    key.file_path.display()
                );
                true
            }
            Err(err) => {
                error!(
                    target: "file",
                    "remove file {} got error: {err}",
                    key.file_path.display()
                );
                false
            }
        };

        let notification = Notification {
            kind: NotifyKind::DeleteResult,
            watch_path: key.watch_path,
            file_path: key.file_path,
            result,
        };
        if notify_tx.send(notification).await.is_err() {
            return;
        }
    }
}

async fn closed(done: &mut watch::Receiver<bool>) {
    loop {
        if *done.borrow_and_update() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

async fn recv_shared<T>(rx: &Arc<TokioMutex<mpsc::Receiver<T>>>) -> Option<T> {
    rx.lock().await.recv().await
}

/// Register `dir` with the watcher and seed its cache entry.
///
/// Only the directory's own files are seeded: subdirectories each get their
/// own entry, either in the same provision walk or through a later create
/// event. Historical files are only picked up when sources are deleted after
/// upload, so a restart cannot re-upload files it already shipped.
fn add_watch_path(
    watcher: &mut RecommendedWatcher,
    cache: &mut FileCache,
    root: &Path,
    dir: &Path,
    excludes: &[Regex],
    rule: &CollectRule,
) -> CoreResult<()> {
    if cache.contains_dir(dir) {
        return Ok(());
    }

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| CoreError::Module(format!("watch {}: {e}", dir.display())))?;

    let mut entry = CacheEntry {
        root_path: root.to_path_buf(),
        files: HashMap::new(),
    };

    if !rule.keep_source_file {
        for dirent in std::fs::read_dir(dir)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_dir() {
                continue;
            }
            let path = dirent.path();
            if is_excluded(excludes, &path) {
                continue;
            }
            let meta = dirent.metadata()?;
            entry.files.insert(
                path,
                FileInfo::waiting(mtime_unix(&meta) + rule.modify_protect_time),
            );
        }
    }

    cache.insert_dir(dir.to_path_buf(), entry);
    info!(
        target: "file",
        "path {} has been added into watch list, root path: {}",
        dir.display(),
        root.display()
    );
    Ok(())
}

/// Breadth-first list of `root` and every directory below it.
fn collect_dirs(root: &Path) -> CoreResult<Vec<PathBuf>> {
    let mut dirs = vec![root.to_path_buf()];
    let mut next = 0;
    while next < dirs.len() {
        let dir = dirs[next].clone();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_dir() {
                dirs.push(dirent.path());
            }
        }
        next += 1;
    }
    Ok(dirs)
}

fn is_excluded(excludes: &[Regex], path: &Path) -> bool {
    let text = path.to_string_lossy();
    excludes.iter().any(|re| re.is_match(&text))
}

/// Used percent and filesystem type of the disk backing `path`, matched by
/// the longest mount-point prefix.
fn disk_usage(system: &System, path: &Path) -> Option<(String, f64)> {
    let mut best: Option<&sysinfo::Disk> = None;
    for disk in system.disks() {
        if !path.starts_with(disk.mount_point()) {
            continue;
        }
        let longer = best
            .map(|b| disk.mount_point().as_os_str().len() > b.mount_point().as_os_str().len())
            .unwrap_or(true);
        if longer {
            best = Some(disk);
        }
    }
    let disk = best?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some((
        String::from_utf8_lossy(disk.file_system()).into_owned(),
        used as f64 * 100.0 / total as f64,
    ))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(unix_now)
}
