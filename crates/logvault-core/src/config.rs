//! Root configuration loading and daemon lifecycle.
//!
//! `start` decodes the root config, provisions logging and the metric
//! collector, resolves each archive through the registry, starts everything,
//! and returns a [`Daemon`] handle that owns the running pieces. The first
//! startup error rolls back whatever was already provisioned.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info};

use crate::context::{CancelToken, Context};
use crate::error::{CoreError, CoreResult};
use crate::logging::Logging;
use crate::metric::{ArchiveMetrics, MetricCollector, MetricConfig};
use crate::module::{ArchiveModule, RawConfig, Registry};

/// The top of the configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: Option<Logging>,
    pub metric: Option<MetricConfig>,
    /// Archive configs keyed by module id.
    pub archives: BTreeMap<String, RawConfig>,
}

impl Config {
    /// Decode from YAML or JSON bytes (YAML is a superset of JSON here).
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }
}

/// Handle to a running daemon. Owns the archives, the metric collector and
/// the root cancel token; dropping it without [`stop`](Daemon::stop) leaves
/// tasks to exit via the token when the process ends.
pub struct Daemon {
    cancel: CancelToken,
    archives: Vec<(String, Box<dyn ArchiveModule>)>,
    metric: Option<MetricCollector>,
    ctx: Context,
    stopped: bool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("archives", &self.archives.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Daemon {
    /// Context the daemon's modules were loaded through.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Cancel the root token, stop the metric collector and each archive,
    /// then run cleanup on each archive. Idempotent: a second call returns
    /// `Ok(())` without doing anything. Errors from the individual stops are
    /// folded into one aggregated error; cleanup errors are logged only.
    pub async fn stop(&mut self) -> CoreResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.cancel.cancel();

        let mut failure: Option<CoreError> = None;
        let mut fold = |context: &str, err: CoreError| {
            failure = Some(match failure.take() {
                Some(prev) => prev.join(context, err),
                None => CoreError::Aggregate(format!("{context}: {err}")),
            });
        };

        if let Some(metric) = self.metric.as_mut() {
            if let Err(err) = metric.stop().await {
                fold("stop metric", err);
            }
        }

        for (name, archive) in self.archives.iter_mut() {
            if let Err(err) = archive.stop().await {
                fold("stop archive", err);
            }
            if let Err(err) = archive.cleanup() {
                error!("{name}: cleanup: {err}");
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Decode the config, provision every module, start the archives and the
/// metric collector, and hand back the running daemon.
pub async fn start(bytes: &[u8], registry: Arc<Registry>) -> CoreResult<Daemon> {
    let cfg = Config::from_bytes(bytes)?;

    cfg.log.clone().unwrap_or_default().provision()?;

    let metrics = Arc::new(ArchiveMetrics::new()?);
    let ctx = Context::new(registry.clone(), metrics.clone());
    let cancel = ctx.cancel_token().clone();

    let mut metric = match cfg.metric.clone() {
        Some(metric_cfg) => {
            let mut collector = MetricCollector::new(metric_cfg, metrics.clone());
            if let Err(err) = collector.provision() {
                cancel.cancel();
                return Err(err);
            }
            Some(collector)
        }
        None => None,
    };

    // load archives
    let mut archives: Vec<(String, Box<dyn ArchiveModule>)> = Vec::new();
    for (name, raw) in &cfg.archives {
        let loaded = match registry.load(name, raw, &ctx).await {
            Ok(module) => module,
            Err(err) => {
                rollback(&cancel, &mut archives);
                return Err(err);
            }
        };
        let archive = match loaded.as_archive() {
            Some(archive) => archive,
            None => {
                rollback(&cancel, &mut archives);
                return Err(CoreError::MissingCapability {
                    id: name.clone(),
                    capability: "archive",
                });
            }
        };
        archives.push((name.clone(), archive));
    }

    // start archives; on failure stop the ones already running, in reverse
    let mut started = 0usize;
    let mut start_err: Option<CoreError> = None;
    for i in 0..archives.len() {
        let (name, archive) = &mut archives[i];
        match archive.start().await {
            Ok(()) => {
                info!("archive {name} started");
                started += 1;
            }
            Err(err) => {
                start_err = Some(CoreError::Aggregate(format!("archive start: {err}")));
                break;
            }
        }
    }
    if let Some(mut err) = start_err {
        for i in (0..started).rev() {
            if let Err(stop_err) = archives[i].1.stop().await {
                err = err.join("stop archive", stop_err);
            }
        }
        rollback(&cancel, &mut archives);
        return Err(err);
    }

    if let Some(collector) = metric.as_mut() {
        if let Err(err) = collector.start() {
            for (_, archive) in archives.iter_mut().rev() {
                let _ = archive.stop().await;
            }
            rollback(&cancel, &mut archives);
            return Err(err);
        }
    }

    Ok(Daemon {
        cancel,
        archives,
        metric,
        ctx,
        stopped: false,
    })
}

/// Cancel the context and run cleanup on everything already provisioned,
/// logging cleanup errors rather than propagating them.
fn rollback(cancel: &CancelToken, archives: &mut Vec<(String, Box<dyn ArchiveModule>)>) {
    cancel.cancel();
    for (name, archive) in archives.iter_mut() {
        if let Err(err) = archive.cleanup() {
            error!("{name}: cleanup: {err}");
        }
    }
    archives.clear();
}
