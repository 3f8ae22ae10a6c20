//! Work type registry.
//!
//! Maps a work type to the handler that executes it, plus optional per-type
//! enqueue defaults loaded from TOML. Built once at startup and passed by
//! `Arc` to whatever needs it; there is no global registry.

pub mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::WorkOutcome;

/// Executes one work type.
///
/// `Ok` carries the outcome, including handled failures (`success = false`).
/// `Err` means the handler could not run at all.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn run(&self, input: &serde_json::Value) -> Result<WorkOutcome>;
}

/// Adapts an async closure into a [`WorkHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> WorkHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkOutcome>> + Send,
{
    async fn run(&self, input: &serde_json::Value) -> Result<WorkOutcome> {
        (self.0)(input.clone()).await
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkTypeFile {
    work_type: WorkTypeDefaults,
}

/// Enqueue defaults for one work type. Explicit `add_work` arguments win.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkTypeDefaults {
    pub name: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Registry of handlers and defaults, indexed by work type.
#[derive(Default)]
pub struct WorkerRegistry {
    handlers: HashMap<String, Arc<dyn WorkHandler>>,
    defaults: HashMap<String, WorkTypeDefaults>,
}

impl WorkerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with `HEARTBEAT` and `HTTP_REQUEST`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.handlers.insert(
            builtin::HEARTBEAT.to_string(),
            Arc::new(builtin::HeartbeatHandler),
        );
        registry.handlers.insert(
            builtin::HTTP_REQUEST.to_string(),
            Arc::new(builtin::HttpRequestHandler::default()),
        );
        registry
    }

    /// Register (or replace) the handler for `work_type`.
    pub fn register(
        &mut self,
        work_type: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
    ) -> Result<()> {
        let work_type = work_type.into();
        if work_type.trim().is_empty() {
            return Err(Error::WorkTypeInvalid(work_type));
        }
        self.handlers.insert(work_type, handler);
        Ok(())
    }

    pub fn register_fn<F, Fut>(&mut self, work_type: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkOutcome>> + Send + 'static,
    {
        self.register(work_type, Arc::new(FnHandler(f)))
    }

    /// Look up the handler for a work type.
    pub fn get(&self, work_type: &str) -> Option<Arc<dyn WorkHandler>> {
        self.handlers.get(work_type).cloned()
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.handlers.contains_key(work_type)
    }

    /// Registered work types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn set_defaults(&mut self, defaults: WorkTypeDefaults) {
        self.defaults.insert(defaults.name.clone(), defaults);
    }

    pub fn defaults(&self, work_type: &str) -> Option<&WorkTypeDefaults> {
        self.defaults.get(work_type)
    }

    /// Load every `.toml` file in `dir` as a `[work_type]` defaults block.
    pub fn load_defaults_from_dir(&mut self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read work type dir {}: {e}", dir.display()))
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: WorkTypeFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad work type config {}: {e}", path.display()))
                })?;
                if file.work_type.name.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "work type config {} has an empty name",
                        path.display()
                    )));
                }
                self.set_defaults(file.work_type);
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}
