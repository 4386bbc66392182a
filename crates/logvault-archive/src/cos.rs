//! The `output.cos` module: uploads archive files to a COS-style object
//! store, optionally compressed, under a time-bucketed destination key.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use logvault_compress::{compress_file, Algorithm, BufferPool, Options};
use logvault_core::{
    decode_module, ArchiveMetrics, Context, CoreError, CoreResult, Module, ModuleId, ModuleInfo,
    OutputTask, Outputter,
};

use crate::store::{HttpObjectStore, ObjectPutter};

/// Module id; also the `module` label on every output metric.
pub const MODULE_ID: &str = "output.cos";

/// Status codes recorded on output metrics.
pub const CODE_SUCCESS: i64 = 0;
/// The task pointed at something that cannot be uploaded.
///
/// Shares its numeric value with the archive's input-discard reason
/// (`logvault_archive::archive::DISCARD_REASON_MAX_RETRY`) by historical
/// accident; the two live in different metric namespaces (`code` on output
/// requests vs `reason` on input discards) and must stay separate constants.
pub const CODE_INVALID_PARAM: i64 = -10000;
/// The remote call failed.
pub const CODE_CALL_API_FAILED: i64 = -10001;
/// Compressing the source failed outright (truncation is not a failure).
pub const CODE_COMPRESS_FAILED: i64 = -10002;

/// Time bucket prepended to destination keys, derived from the file mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveRule {
    /// No bucket prefix.
    #[default]
    #[serde(rename = "")]
    None,
    /// `YYYYMMDDHH`
    Hour,
    /// `YYYYMMDD`
    Day,
    /// `YYYYMM`
    Month,
    /// `YYYY`
    Year,
    /// Reserved; behaves like [`ArchiveRule::None`].
    Custom,
}

/// Upload behavior of the output module.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadRule {
    pub archive_rule: ArchiveRule,
    /// Compression applied before upload; empty disables compression.
    pub compress: Algorithm,
    /// Overrides the compressor's staged-input cap when non-zero.
    pub max_file_size: usize,
    /// Per-remote-call timeout in seconds; 0 leaves calls unbounded.
    pub timeout: u64,
}

/// COS output module configuration and runtime state.
#[derive(Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CosOutput {
    pub url: String,
    #[serde(rename = "secretID")]
    pub secret_id: String,
    pub secret_key: String,
    pub upload_rule: UploadRule,

    #[serde(skip)]
    store: Option<Arc<dyn ObjectPutter>>,
    #[serde(skip)]
    metrics: Option<Arc<ArchiveMetrics>>,
    #[serde(skip)]
    buffers: BufferPool,
}

impl CosOutput {
    /// Registry entry for this module.
    pub fn module_info() -> ModuleInfo {
        ModuleInfo {
            id: ModuleId::from(MODULE_ID),
            new: |raw| Ok(Box::new(decode_module::<CosOutput>(raw)?) as Box<dyn Module>),
        }
    }

    /// Replace the HTTP client with an arbitrary putter. Provision keeps an
    /// injected store, so tests run against [`crate::store::MockObjectStore`].
    pub fn with_store(mut self, store: Arc<dyn ObjectPutter>) -> Self {
        self.store = Some(store);
        self
    }

    fn store(&self) -> CoreResult<&Arc<dyn ObjectPutter>> {
        self.store
            .as_ref()
            .ok_or_else(|| CoreError::Module("cos output not provisioned".into()))
    }

    async fn upload(&self, task: &OutputTask, metrics: &ArchiveMetrics) -> Result<(), ExecError> {
        let store = self.store().map_err(|e| ExecError::invalid(e))?;

        let meta = std::fs::metadata(&task.file_path)
            .map_err(|e| ExecError::invalid(CoreError::Io(e)))?;
        if meta.is_dir() {
            return Err(ExecError::invalid(CoreError::InvalidConfig(format!(
                "input: {} is directory",
                task.file_path.display()
            ))));
        }

        let rel = task
            .file_path
            .strip_prefix(&task.root_path)
            .map_err(|_| {
                ExecError::invalid(CoreError::InvalidConfig(format!(
                    "{} is not under root {}",
                    task.file_path.display(),
                    task.root_path.display()
                )))
            })?;

        let mtime = meta.modified().unwrap_or_else(|_| SystemTime::now());
        let prefix = archive_prefix(self.upload_rule.archive_rule, mtime);
        let mut key = if prefix.is_empty() {
            rel.to_string_lossy().into_owned()
        } else {
            format!("{prefix}/{}", rel.to_string_lossy())
        };
        key.push_str(self.upload_rule.compress.suffix());

        // uncompressed uploads stream straight from disk
        if self.upload_rule.compress.is_none() {
            return store
                .put_file(&key, &task.file_path)
                .await
                .map_err(|e| ExecError::remote(e));
        }

        let mut opts = Options::new(self.upload_rule.compress);
        if self.upload_rule.max_file_size > 0 {
            opts.max_writer_buf_size = self.upload_rule.max_file_size;
        }

        let mut buf = self.buffers.get();
        match compress_file(&task.file_path, &opts, &mut buf) {
            Ok(()) => {}
            Err(err) if err.is_truncated() => {
                metrics
                    .output_truncate_total
                    .with_label_values(&[MODULE_ID])
                    .inc();
                warn!(
                    target: "cos",
                    "file {} size {} is too large, uploading truncated payload",
                    task.file_path.display(),
                    meta.len()
                );
            }
            Err(err) => {
                self.buffers.put(buf);
                return Err(ExecError {
                    code: CODE_COMPRESS_FAILED,
                    err: CoreError::Module(format!(
                        "compress file: {}: {err}",
                        task.file_path.display()
                    )),
                });
            }
        }

        let put = store.put_object(&key, &buf).await;
        self.buffers.put(buf);
        put.map_err(|e| ExecError::remote(e))
    }
}

struct ExecError {
    code: i64,
    err: CoreError,
}

impl ExecError {
    fn invalid(err: CoreError) -> Self {
        Self {
            code: CODE_INVALID_PARAM,
            err,
        }
    }

    fn remote(err: crate::store::StoreError) -> Self {
        Self {
            code: CODE_CALL_API_FAILED,
            err: CoreError::Module(format!("call upload api: {err}")),
        }
    }
}

#[async_trait]
impl Module for CosOutput {
    async fn provision(&mut self, ctx: &Context) -> CoreResult<()> {
        self.metrics = Some(ctx.metrics().clone());
        if self.store.is_none() {
            let client = HttpObjectStore::new(
                &self.url,
                &self.secret_id,
                &self.secret_key,
                self.upload_rule.timeout,
            )
            .map_err(|e| CoreError::Module(e.to_string()))?;
            self.store = Some(Arc::new(client));
        }
        Ok(())
    }

    async fn validate(&self) -> CoreResult<()> {
        let store = self.store()?;
        match store.bucket_exists().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::InvalidConfig("cos bucket does not exist".into())),
            Err(err) => Err(CoreError::Module(format!("check cos bucket: {err}"))),
        }
    }

    fn as_output(self: Box<Self>) -> Option<Arc<dyn Outputter>> {
        Some(Arc::new(*self))
    }
}

#[async_trait]
impl Outputter for CosOutput {
    async fn execute(&self, task: &OutputTask) -> CoreResult<()> {
        let metrics = self
            .metrics
            .as_ref()
            .ok_or_else(|| CoreError::Module("cos output not provisioned".into()))?;

        let begin = Instant::now();
        let result = self.upload(task, metrics).await;
        let code = match &result {
            Ok(()) => CODE_SUCCESS,
            Err(exec) => exec.code,
        };

        let code_label = code.to_string();
        metrics
            .output_request_total
            .with_label_values(&[MODULE_ID, &code_label])
            .inc();
        metrics
            .output_request_duration
            .with_label_values(&[MODULE_ID, &code_label])
            .observe(begin.elapsed().as_secs_f64());

        result.map_err(|exec| {
            error!(target: "cos", "output execute: {}", exec.err);
            exec.err
        })
    }
}

/// Destination key prefix for `rule` given the source file's mtime.
pub fn archive_prefix(rule: ArchiveRule, mtime: SystemTime) -> String {
    let at: DateTime<Local> = mtime.into();
    match rule {
        ArchiveRule::Hour => at.format("%Y%m%d%H").to_string(),
        ArchiveRule::Day => at.format("%Y%m%d").to_string(),
        ArchiveRule::Month => at.format("%Y%m").to_string(),
        ArchiveRule::Year => at.format("%Y").to_string(),
        ArchiveRule::None | ArchiveRule::Custom => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockObjectStore;
    use logvault_core::Registry;
    use std::path::Path;

    fn test_ctx() -> Context {
        Context::new(
            Arc::new(Registry::new()),
            Arc::new(ArchiveMetrics::new().unwrap()),
        )
    }

    async fn provisioned(rule: UploadRule, store: Arc<MockObjectStore>) -> (CosOutput, Context) {
        let ctx = test_ctx();
        let mut output = CosOutput {
            upload_rule: rule,
            ..CosOutput::default()
        }
        .with_store(store);
        output.provision(&ctx).await.unwrap();
        output.validate().await.unwrap();
        (output, ctx)
    }

    fn task(root: &Path, file: &Path) -> OutputTask {
        OutputTask {
            root_path: root.to_path_buf(),
            file_path: file.to_path_buf(),
        }
    }

    fn request_count(ctx: &Context, code: &str) -> u64 {
        ctx.metrics()
            .output_request_total
            .with_label_values(&[MODULE_ID, code])
            .get()
    }

    #[test]
    fn prefixes_nest_from_hour_down_to_year() {
        let now = SystemTime::now();
        let hour = archive_prefix(ArchiveRule::Hour, now);
        let day = archive_prefix(ArchiveRule::Day, now);
        let month = archive_prefix(ArchiveRule::Month, now);
        let year = archive_prefix(ArchiveRule::Year, now);

        assert_eq!(hour.len(), 10);
        assert_eq!(day.len(), 8);
        assert_eq!(month.len(), 6);
        assert_eq!(year.len(), 4);
        assert!(hour.starts_with(&day));
        assert!(day.starts_with(&month));
        assert!(month.starts_with(&year));
        assert!(hour.chars().all(|c| c.is_ascii_digit()));

        assert_eq!(archive_prefix(ArchiveRule::None, now), "");
        assert_eq!(archive_prefix(ArchiveRule::Custom, now), "");
    }

    #[tokio::test]
    async fn uncompressed_upload_streams_the_file_under_its_relative_key() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("svc");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("a.log");
        std::fs::write(&file, b"hello").unwrap();

        let store = Arc::new(MockObjectStore::new());
        let (output, ctx) = provisioned(UploadRule::default(), store.clone()).await;

        output.execute(&task(dir.path(), &file)).await.unwrap();

        assert_eq!(store.keys(), vec!["svc/a.log".to_string()]);
        assert_eq!(store.object("svc/a.log").unwrap(), b"hello");
        assert_eq!(store.stats().file_puts, 1);
        assert_eq!(request_count(&ctx, "0"), 1);
    }

    #[tokio::test]
    async fn day_rule_prepends_the_mtime_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.log");
        std::fs::write(&file, b"x").unwrap();

        let store = Arc::new(MockObjectStore::new());
        let rule = UploadRule {
            archive_rule: ArchiveRule::Day,
            ..UploadRule::default()
        };
        let (output, _ctx) = provisioned(rule, store.clone()).await;
        output.execute(&task(dir.path(), &file)).await.unwrap();

        let mtime = std::fs::metadata(&file).unwrap().modified().unwrap();
        let expected = format!("{}/a.log", archive_prefix(ArchiveRule::Day, mtime));
        assert_eq!(store.keys(), vec![expected]);
    }

    #[tokio::test]
    async fn zstd_upload_compresses_and_suffixes_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.log");
        let body = b"log line\n".repeat(500);
        std::fs::write(&file, &body).unwrap();

        let store = Arc::new(MockObjectStore::new());
        let rule = UploadRule {
            compress: Algorithm::Zstd,
            ..UploadRule::default()
        };
        let (output, ctx) = provisioned(rule, store.clone()).await;
        output.execute(&task(dir.path(), &file)).await.unwrap();

        let stored = store.object("a.log.zst").unwrap();
        assert_eq!(zstd::decode_all(&stored[..]).unwrap(), body);
        assert_eq!(request_count(&ctx, "0"), 1);
    }

    #[tokio::test]
    async fn oversized_source_uploads_truncated_and_counts_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.log");
        std::fs::write(&file, vec![b'z'; 64 * 1024]).unwrap();

        let store = Arc::new(MockObjectStore::new());
        let rule = UploadRule {
            compress: Algorithm::Zstd,
            max_file_size: 16 * 1024,
            ..UploadRule::default()
        };
        let (output, ctx) = provisioned(rule, store.clone()).await;
        output.execute(&task(dir.path(), &file)).await.unwrap();

        let stored = store.object("big.log.zst").unwrap();
        let decoded = zstd::decode_all(&stored[..]).unwrap();
        assert!(decoded.len() < 64 * 1024);
        assert_eq!(
            ctx.metrics()
                .output_truncate_total
                .with_label_values(&[MODULE_ID])
                .get(),
            1
        );
        assert_eq!(request_count(&ctx, "0"), 1);
    }

    #[tokio::test]
    async fn directories_are_invalid_params() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("svc");
        std::fs::create_dir(&sub).unwrap();

        let store = Arc::new(MockObjectStore::new());
        let (output, ctx) = provisioned(UploadRule::default(), store).await;

        assert!(output.execute(&task(dir.path(), &sub)).await.is_err());
        assert_eq!(request_count(&ctx, "-10000"), 1);
    }

    #[tokio::test]
    async fn files_outside_the_root_are_invalid_params() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let file = other.path().join("a.log");
        std::fs::write(&file, b"x").unwrap();

        let store = Arc::new(MockObjectStore::new());
        let (output, ctx) = provisioned(UploadRule::default(), store).await;

        assert!(output.execute(&task(root.path(), &file)).await.is_err());
        assert_eq!(request_count(&ctx, "-10000"), 1);
    }

    #[tokio::test]
    async fn remote_failures_record_the_api_code() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.log");
        std::fs::write(&file, b"x").unwrap();

        let store = Arc::new(MockObjectStore::new());
        store.fail_next_puts(1);
        let (output, ctx) = provisioned(UploadRule::default(), store).await;

        assert!(output.execute(&task(dir.path(), &file)).await.is_err());
        assert_eq!(request_count(&ctx, "-10001"), 1);
    }

    #[tokio::test]
    async fn validate_requires_the_bucket() {
        let ctx = test_ctx();
        let store = Arc::new(MockObjectStore::new());
        store.remove_bucket();
        let mut output = CosOutput::default().with_store(store);
        output.provision(&ctx).await.unwrap();

        assert!(output.validate().await.is_err());
    }

    #[test]
    fn config_decodes_the_documented_keys() {
        let output: CosOutput = serde_yaml::from_str(
            "url: https://bucket.example.com\nsecretID: id\nsecretKey: key\nuploadRule:\n  archiveRule: day\n  compress: zstd\n  maxFileSize: 1024\n  timeout: 30\n",
        )
        .unwrap();
        assert_eq!(output.secret_id, "id");
        assert_eq!(output.secret_key, "key");
        assert_eq!(output.upload_rule.archive_rule, ArchiveRule::Day);
        assert_eq!(output.upload_rule.compress, Algorithm::Zstd);
        assert_eq!(output.upload_rule.max_file_size, 1024);
        assert_eq!(output.upload_rule.timeout, 30);
    }
}
