//! Error types for the logvault core.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error variants for configuration loading and module lifecycle.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The root config or a module config failed to decode.
    #[error("decoding config: {0}")]
    Decode(#[from] serde_yaml::Error),

    /// No module with this id is registered.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A polymorphic config value did not carry its module name.
    #[error("module name not specified with key '{key}'")]
    MissingInlineKey {
        /// The inline key that was expected inside the raw value.
        key: String,
    },

    /// A raw config value had the wrong shape for its resolution rule.
    #[error("invalid module config shape: {0}")]
    InvalidShape(String),

    /// A loaded module does not expose the capability its slot requires.
    #[error("module {id} does not provide the {capability} capability")]
    MissingCapability {
        /// The module id that was loaded.
        id: String,
        /// The capability the caller required (`archive`, `output`).
        capability: &'static str,
    },

    /// `provision` failed; any `cleanup` failure is folded into the message.
    #[error("provision {id}: {source}")]
    Provision {
        /// The module id being provisioned.
        id: String,
        #[source]
        source: Box<CoreError>,
    },

    /// `validate` failed; any `cleanup` failure is folded into the message.
    #[error("{id}: invalid configuration: {source}")]
    Validate {
        /// The module id being validated.
        id: String,
        #[source]
        source: Box<CoreError>,
    },

    /// Configuration value rejected by a module.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registry setup failure.
    #[error("metric registry: {0}")]
    Metric(#[from] prometheus::Error),

    /// Module-internal runtime failure.
    #[error("{0}")]
    Module(String),

    /// Several shutdown errors folded into one report.
    #[error("{0}")]
    Aggregate(String),
}

impl CoreError {
    /// Fold `extra` into `self` the way shutdown paths aggregate errors.
    pub fn join(self, context: &str, extra: CoreError) -> CoreError {
        CoreError::Aggregate(format!("{self}; {context}: {extra}"))
    }
}
