//! Archive telemetry: the shared metric vectors and the collector that
//! periodically snapshots them to a Prometheus text file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::CoreResult;

const SUBSYSTEM: &str = "logarchive";

/// Snapshot file name inside `metric.outPath`.
pub const METRIC_FILE_NAME: &str = "logarchive.prom";

const DEFAULT_SCRAP_INTERVAL_SECS: u64 = 60;

/// The metric families every archive and output reports into.
///
/// Created against a private registry per daemon so tests observe isolated
/// values.
pub struct ArchiveMetrics {
    registry: Registry,

    /// `logarchive_disk_usage{module,path,fstype}` — used percent of the
    /// filesystem backing each watched root.
    pub disk_usage: GaugeVec,
    /// `logarchive_input_queue_size{module}` — depth of the upload task queue.
    pub input_queue_size: IntGaugeVec,
    /// `logarchive_input_request_size_bytes{module}` — size of each input
    /// file at its first upload attempt.
    pub input_request_size: HistogramVec,
    /// `logarchive_input_discard_total{module,reason}` — inputs dropped
    /// after their retry budget.
    pub input_discard_total: IntCounterVec,
    /// `logarchive_output_truncate_total{module}` — uploads whose payload
    /// was truncated by the compression cap.
    pub output_truncate_total: IntCounterVec,
    /// `logarchive_output_request_total{module,code}` — output executions by
    /// status code.
    pub output_request_total: IntCounterVec,
    /// `logarchive_output_request_duration_seconds{module,code}` — output
    /// execution latency.
    pub output_request_duration: HistogramVec,
}

impl ArchiveMetrics {
    pub fn new() -> CoreResult<Self> {
        let registry = Registry::new();

        let disk_usage = GaugeVec::new(
            Opts::new("disk_usage", "The disk usage of the file path that watched")
                .subsystem(SUBSYSTEM),
            &["module", "path", "fstype"],
        )?;
        let input_queue_size = IntGaugeVec::new(
            Opts::new("input_queue_size", "The size of input task queue").subsystem(SUBSYSTEM),
            &["module"],
        )?;
        let input_request_size = HistogramVec::new(
            HistogramOpts::new("input_request_size_bytes", "Size of the input target in bytes")
                .subsystem(SUBSYSTEM)
                .buckets(vec![1e6, 1e7, 2e7, 3e7, 5e7, 1e8, 5e8, 1e9]),
            &["module"],
        )?;
        let input_discard_total = IntCounterVec::new(
            Opts::new(
                "input_discard_total",
                "The number of input target has been discard",
            )
            .subsystem(SUBSYSTEM),
            &["module", "reason"],
        )?;
        let output_truncate_total = IntCounterVec::new(
            Opts::new(
                "output_truncate_total",
                "The number of output has been truncated",
            )
            .subsystem(SUBSYSTEM),
            &["module"],
        )?;
        let output_request_total = IntCounterVec::new(
            Opts::new("output_request_total", "Call output module requests").subsystem(SUBSYSTEM),
            &["module", "code"],
        )?;

        let mut duration_buckets = prometheus::DEFAULT_BUCKETS.to_vec();
        duration_buckets.extend([30.0, 60.0]);
        let output_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "output_request_duration_seconds",
                "Histogram of the time (in seconds) each request took",
            )
            .subsystem(SUBSYSTEM)
            .buckets(duration_buckets),
            &["module", "code"],
        )?;

        registry.register(Box::new(disk_usage.clone()))?;
        registry.register(Box::new(input_queue_size.clone()))?;
        registry.register(Box::new(input_request_size.clone()))?;
        registry.register(Box::new(input_discard_total.clone()))?;
        registry.register(Box::new(output_truncate_total.clone()))?;
        registry.register(Box::new(output_request_total.clone()))?;
        registry.register(Box::new(output_request_duration.clone()))?;

        Ok(Self {
            registry,
            disk_usage,
            input_queue_size,
            input_request_size,
            input_discard_total,
            output_truncate_total,
            output_request_total,
            output_request_duration,
        })
    }

    /// Gather every family from the registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render_text(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut out)?;
        Ok(out)
    }
}

/// Collector configuration from the root config's `metric` block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricConfig {
    /// Directory the snapshot file is written into.
    pub out_path: String,
    /// Seconds between snapshots; 0 means 60.
    pub scrap_interval: u64,
}

/// Periodically rewrites `<outPath>/logarchive.prom` from the registry.
pub struct MetricCollector {
    cfg: MetricConfig,
    metrics: Arc<ArchiveMetrics>,
    file: Option<File>,
    done: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MetricCollector {
    pub fn new(cfg: MetricConfig, metrics: Arc<ArchiveMetrics>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            cfg,
            metrics,
            file: None,
            done,
            handle: None,
        }
    }

    /// Open the snapshot file (truncating) and apply interval defaults.
    pub fn provision(&mut self) -> CoreResult<()> {
        if self.cfg.scrap_interval == 0 {
            self.cfg.scrap_interval = DEFAULT_SCRAP_INTERVAL_SECS;
        }
        let path = Path::new(&self.cfg.out_path).join(METRIC_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        self.file = Some(file);
        Ok(())
    }

    pub fn start(&mut self) -> CoreResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| crate::error::CoreError::Module("metric collector not provisioned".into()))?;
        let metrics = self.metrics.clone();
        let mut done = self.done.subscribe();
        let period = Duration::from_secs(self.cfg.scrap_interval);

        self.handle = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = done.changed() => {
                        if changed.is_err() || *done.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = write_snapshot(&mut file, &metrics) {
                            tracing::error!(target: "metric", "write metric snapshot: {err}");
                            continue;
                        }
                        info!(target: "metric", "metric info has been updated");
                    }
                }
            }
        }));
        Ok(())
    }

    /// Idempotent; waits for the scrape task to exit.
    pub async fn stop(&mut self) -> CoreResult<()> {
        if *self.done.borrow() {
            return Ok(());
        }
        let _ = self.done.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn write_snapshot(file: &mut File, metrics: &ArchiveMetrics) -> CoreResult<()> {
    let text = metrics.render_text()?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&text)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_register_without_collision() {
        let metrics = ArchiveMetrics::new().unwrap();
        metrics
            .input_discard_total
            .with_label_values(&["file", "-10000"])
            .inc();
        metrics.disk_usage.with_label_values(&["file", "/", "ext4"]).set(42.5);

        let families = metrics.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"logarchive_input_discard_total"));
        assert!(names.contains(&"logarchive_disk_usage"));
    }

    #[test]
    fn text_rendering_carries_labels() {
        let metrics = ArchiveMetrics::new().unwrap();
        metrics
            .output_request_total
            .with_label_values(&["output.cos", "0"])
            .inc();

        let text = String::from_utf8(metrics.render_text().unwrap()).unwrap();
        assert!(text.contains("logarchive_output_request_total"));
        assert!(text.contains("module=\"output.cos\""));
        assert!(text.contains("code=\"0\""));
    }

    #[test]
    fn request_size_buckets_match_the_contract() {
        let metrics = ArchiveMetrics::new().unwrap();
        metrics
            .input_request_size
            .with_label_values(&["file"])
            .observe(2e7);

        let text = String::from_utf8(metrics.render_text().unwrap()).unwrap();
        assert!(text.contains("le=\"1000000\""));
        assert!(text.contains("le=\"1000000000\""));
    }

    #[test]
    fn duration_buckets_extend_the_defaults() {
        let metrics = ArchiveMetrics::new().unwrap();
        metrics
            .output_request_duration
            .with_label_values(&["output.cos", "0"])
            .observe(45.0);

        let text = String::from_utf8(metrics.render_text().unwrap()).unwrap();
        assert!(text.contains("le=\"30\""));
        assert!(text.contains("le=\"60\""));
    }

    #[tokio::test]
    async fn collector_rewrites_the_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(ArchiveMetrics::new().unwrap());
        metrics.input_queue_size.with_label_values(&["file"]).set(3);

        let mut collector = MetricCollector::new(
            MetricConfig {
                out_path: dir.path().to_string_lossy().to_string(),
                scrap_interval: 1,
            },
            metrics.clone(),
        );
        collector.provision().unwrap();
        collector.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        collector.stop().await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(METRIC_FILE_NAME)).unwrap();
        assert!(contents.contains("logarchive_input_queue_size{module=\"file\"} 3"));
    }

    #[tokio::test]
    async fn collector_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(ArchiveMetrics::new().unwrap());
        let mut collector = MetricCollector::new(
            MetricConfig {
                out_path: dir.path().to_string_lossy().to_string(),
                scrap_interval: 30,
            },
            metrics,
        );
        collector.provision().unwrap();
        collector.start().unwrap();

        collector.stop().await.unwrap();
        collector.stop().await.unwrap();
    }

    #[test]
    fn interval_defaults_to_sixty_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(ArchiveMetrics::new().unwrap());
        let mut collector = MetricCollector::new(
            MetricConfig {
                out_path: dir.path().to_string_lossy().to_string(),
                scrap_interval: 0,
            },
            metrics,
        );
        collector.provision().unwrap();
        assert_eq!(collector.cfg.scrap_interval, 60);
    }
}
