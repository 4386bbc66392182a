#![warn(missing_docs)]

//! logvault core: module registry, lifecycle, configuration loading, logging
//! and metrics.
//!
//! This crate holds everything the archival daemon needs around its archive
//! modules: the registry that resolves polymorphic config blobs into concrete
//! modules, the cancellation/context machinery, the root config loader with
//! its provision/validate/start/rollback lifecycle, the structured logger,
//! and the metric vectors plus the collector that snapshots them to disk.
//! Concrete archive and output modules live in `logvault-archive`.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metric;
pub mod module;

pub use config::{start, Config, Daemon};
pub use context::{CancelToken, Context};
pub use error::{CoreError, CoreResult};
pub use logging::{Logging, RollingFileWriter};
pub use metric::{ArchiveMetrics, MetricCollector, MetricConfig, METRIC_FILE_NAME};
pub use module::{
    decode_module, ArchiveModule, Module, ModuleCtor, ModuleId, ModuleInfo, OutputTask, Outputter,
    RawConfig, Registry,
};
