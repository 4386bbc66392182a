//! Module identifiers, the module registry, and the capability traits that
//! archives and outputs implement.
//!
//! The registry is a plain value built in `main` and threaded through the
//! [`Context`](crate::context::Context): tests construct isolated registries
//! and nothing is registered through global state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{CoreError, CoreResult};

/// A dotted module identifier, e.g. `output.cos` or `file`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Everything before the last dot; empty when the id has no dot.
    pub fn namespace(&self) -> &str {
        match self.0.rfind('.') {
            Some(i) => &self.0[..i],
            None => "",
        }
    }

    /// Everything after the last dot.
    pub fn name(&self) -> &str {
        match self.0.rfind('.') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An undecoded config value, resolved into a concrete module later.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RawConfig(pub serde_yaml::Value);

impl RawConfig {
    pub fn is_empty(&self) -> bool {
        matches!(self.0, serde_yaml::Value::Null)
    }

    /// Decode the raw value into a concrete config type.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_yaml::from_value(self.0.clone())?)
    }
}

/// Decode a module config from its raw value, falling back to defaults when
/// the value is absent.
pub fn decode_module<T: DeserializeOwned + Default>(raw: &RawConfig) -> CoreResult<T> {
    if raw.is_empty() {
        Ok(T::default())
    } else {
        raw.decode()
    }
}

/// A loadable module.
///
/// `provision` runs immediately after construction, `validate` after that;
/// failures in either trigger `cleanup` on the partially-initialized
/// instance. The capability accessors hand the instance over to the slot
/// that requested it.
#[async_trait]
pub trait Module: Send + Sync {
    async fn provision(&mut self, _ctx: &Context) -> CoreResult<()> {
        Ok(())
    }

    async fn validate(&self) -> CoreResult<()> {
        Ok(())
    }

    fn cleanup(&mut self) -> CoreResult<()> {
        Ok(())
    }

    /// The archive capability (`start`/`stop`), if this module is one.
    fn as_archive(self: Box<Self>) -> Option<Box<dyn ArchiveModule>> {
        None
    }

    /// The output capability, if this module is one.
    fn as_output(self: Box<Self>) -> Option<Arc<dyn Outputter>> {
        None
    }
}

impl fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<module>")
    }
}

/// A long-lived producer of upload tasks over a set of watched directories.
#[async_trait]
pub trait ArchiveModule: Send {
    async fn start(&mut self) -> CoreResult<()>;

    /// Idempotent; returns only after the archive's tasks have exited.
    async fn stop(&mut self) -> CoreResult<()>;

    fn cleanup(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

/// An upload task handed from an archive to its output.
///
/// Outputs produce fresh tasks through [`Outputter::new_task`]; the archive
/// fills in both paths and knows nothing else about the output.
#[derive(Debug, Clone, Default)]
pub struct OutputTask {
    /// The watched root the file belongs to; destination keys are derived
    /// relative to it.
    pub root_path: PathBuf,
    /// Absolute path of the file to upload.
    pub file_path: PathBuf,
}

/// A consumer of upload tasks; abstracts the remote sink.
#[async_trait]
pub trait Outputter: Send + Sync {
    fn new_task(&self) -> OutputTask {
        OutputTask::default()
    }

    async fn execute(&self, task: &OutputTask) -> CoreResult<()>;
}

/// Constructor for a registered module: decode the raw config into a fresh
/// instance. Provisioning and validation are driven by the registry.
pub type ModuleCtor = fn(&RawConfig) -> CoreResult<Box<dyn Module>>;

/// A registered module entry.
#[derive(Clone)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub new: ModuleCtor,
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id.as_str())
    }
}

/// Catalog mapping module ids to constructors.
#[derive(Default)]
pub struct Registry {
    modules: BTreeMap<String, ModuleInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Registration is append-only.
    ///
    /// # Panics
    ///
    /// Panics on an empty id or a duplicate registration; both are process
    /// wiring bugs, not runtime conditions.
    pub fn register(&mut self, info: ModuleInfo) {
        if info.id.as_str().is_empty() {
            panic!("module ID missing");
        }
        if self.modules.contains_key(info.id.as_str()) {
            panic!("module already registered: {}", info.id);
        }
        self.modules.insert(info.id.as_str().to_string(), info);
    }

    /// Construct, decode, provision and validate the module registered under
    /// `id`. Failures after construction run `cleanup` on the instance and
    /// fold any cleanup error into the report. Successful loads are recorded
    /// in the context's loaded-module inventory.
    pub async fn load(
        &self,
        id: &str,
        raw: &RawConfig,
        ctx: &Context,
    ) -> CoreResult<Box<dyn Module>> {
        let info = self
            .modules
            .get(id)
            .ok_or_else(|| CoreError::UnknownModule(id.to_string()))?;

        let mut module = (info.new)(raw)?;

        if let Err(err) = module.provision(ctx).await {
            return Err(CoreError::Provision {
                id: id.to_string(),
                source: Box::new(fold_cleanup(err, module.as_mut())),
            });
        }

        if let Err(err) = module.validate().await {
            // provisioned already, so make sure we clean up
            return Err(CoreError::Validate {
                id: id.to_string(),
                source: Box::new(fold_cleanup(err, module.as_mut())),
            });
        }

        ctx.record_loaded(ModuleId::new(id));
        Ok(module)
    }

    /// Resolve a raw value whose module name sits inside it under
    /// `inline_key`: the key is read and stripped, and the id composed as
    /// `namespace.name`.
    pub async fn load_inline(
        &self,
        namespace: &str,
        inline_key: &str,
        raw: &RawConfig,
        ctx: &Context,
    ) -> CoreResult<Box<dyn Module>> {
        let (name, rest) = split_inline(inline_key, raw)?;
        let id = compose_id(namespace, &name);
        self.load(&id, &rest, ctx).await
    }

    /// Per-element [`load_inline`](Self::load_inline) over a list.
    pub async fn load_inline_list(
        &self,
        namespace: &str,
        inline_key: &str,
        raws: &[RawConfig],
        ctx: &Context,
    ) -> CoreResult<Vec<Box<dyn Module>>> {
        let mut all = Vec::with_capacity(raws.len());
        for (i, raw) in raws.iter().enumerate() {
            let module = self
                .load_inline(namespace, inline_key, raw, ctx)
                .await
                .map_err(|e| CoreError::InvalidShape(format!("position {i}: {e}")))?;
            all.push(module);
        }
        Ok(all)
    }

    /// Nested per-element resolution over a list of lists.
    pub async fn load_inline_matrix(
        &self,
        namespace: &str,
        inline_key: &str,
        raws: &[Vec<RawConfig>],
        ctx: &Context,
    ) -> CoreResult<Vec<Vec<Box<dyn Module>>>> {
        let mut all = Vec::with_capacity(raws.len());
        for inner in raws {
            all.push(self.load_inline_list(namespace, inline_key, inner, ctx).await?);
        }
        Ok(all)
    }

    /// Resolve a map whose keys are the module names themselves.
    pub async fn load_module_map(
        &self,
        namespace: &str,
        map: &BTreeMap<String, RawConfig>,
        ctx: &Context,
    ) -> CoreResult<BTreeMap<String, Box<dyn Module>>> {
        let mut all = BTreeMap::new();
        for (name, raw) in map {
            let id = compose_id(namespace, name);
            let module = self
                .load(&id, raw, ctx)
                .await
                .map_err(|e| CoreError::InvalidShape(format!("module name '{name}': {e}")))?;
            all.insert(name.clone(), module);
        }
        Ok(all)
    }

    /// Resolve a map whose keys are opaque labels; the module name comes
    /// from `inline_key` inside each value.
    pub async fn load_labeled_map(
        &self,
        namespace: &str,
        inline_key: &str,
        map: &BTreeMap<String, RawConfig>,
        ctx: &Context,
    ) -> CoreResult<BTreeMap<String, Box<dyn Module>>> {
        let mut all = BTreeMap::new();
        for (label, raw) in map {
            let module = self
                .load_inline(namespace, inline_key, raw, ctx)
                .await
                .map_err(|e| CoreError::InvalidShape(format!("key {label}: {e}")))?;
            all.insert(label.clone(), module);
        }
        Ok(all)
    }

    /// Per-element [`load_module_map`](Self::load_module_map) over a list of maps.
    pub async fn load_module_map_list(
        &self,
        namespace: &str,
        maps: &[BTreeMap<String, RawConfig>],
        ctx: &Context,
    ) -> CoreResult<Vec<BTreeMap<String, Box<dyn Module>>>> {
        let mut all = Vec::with_capacity(maps.len());
        for map in maps {
            all.push(self.load_module_map(namespace, map, ctx).await?);
        }
        Ok(all)
    }
}

fn fold_cleanup(err: CoreError, module: &mut dyn Module) -> CoreError {
    match module.cleanup() {
        Ok(()) => err,
        Err(cleanup) => CoreError::Aggregate(format!("{err}; additionally, cleanup: {cleanup}")),
    }
}

fn compose_id(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Read and strip the module name from a raw mapping value.
fn split_inline(inline_key: &str, raw: &RawConfig) -> CoreResult<(String, RawConfig)> {
    let mapping = raw.0.as_mapping().ok_or_else(|| {
        CoreError::InvalidShape("inline module config must be a mapping".to_string())
    })?;

    let key = serde_yaml::Value::String(inline_key.to_string());
    let name = match mapping.get(&key) {
        Some(serde_yaml::Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(CoreError::MissingInlineKey {
                key: inline_key.to_string(),
            })
        }
    };

    let mut rest = mapping.clone();
    rest.remove(&key);
    Ok((name, RawConfig(serde_yaml::Value::Mapping(rest))))
}
