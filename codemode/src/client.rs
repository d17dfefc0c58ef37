//! High-level entry point bundling registry, interfaces, engine and scheduler.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use codemode_config::EngineConfig;
use codemode_kernel::{
    DEFAULT_MAX_CONCURRENT_RUNS, DEFAULT_TIMEOUT, ExecutionEngine, RunScheduler, SchedulerError,
};
use codemode_primitives::{Capability, ExecutionOutcome};
use codemode_script::Limits;
use codemode_tools::{Args, CapabilityFn, CapabilityRegistry, CapabilityResult, InterfaceGenerator};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Registers capabilities and runs snippets against them.
///
/// Every run sees a snapshot of the capabilities registered when it starts.
/// Runs never fail: each one yields an [`ExecutionOutcome`].
#[derive(Debug)]
pub struct CodeModeClient {
    registry: Arc<CapabilityRegistry>,
    interfaces: Arc<InterfaceGenerator>,
    engine: ExecutionEngine,
    scheduler: RunScheduler,
    default_timeout: Duration,
}

impl Default for CodeModeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeModeClient {
    /// Creates a client with default limits and a 30 second timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::assemble(Limits::default(), DEFAULT_MAX_CONCURRENT_RUNS, DEFAULT_TIMEOUT)
    }

    /// Creates a client from validated engine settings.
    ///
    /// # Errors
    ///
    /// Fails when [`EngineConfig::validate`] rejects `config`.
    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let max_concurrent = NonZeroUsize::new(config.max_concurrent_runs)
            .context("max_concurrent_runs must be at least 1")?;
        let limits = Limits {
            recursion_limit: config.recursion_limit,
            yield_interval: config.yield_interval,
        };
        Ok(Self::assemble(limits, max_concurrent, config.default_timeout()))
    }

    fn assemble(limits: Limits, max_concurrent: NonZeroUsize, default_timeout: Duration) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let interfaces = Arc::new(InterfaceGenerator::new());
        let engine = ExecutionEngine::new(Arc::clone(&registry), Arc::clone(&interfaces), limits);
        Self {
            registry,
            interfaces,
            engine,
            scheduler: RunScheduler::new(max_concurrent),
            default_timeout,
        }
    }

    /// Registers `capability`, backed by `backend`.
    ///
    /// A second registration under the same name replaces the backend; the
    /// listing keeps both descriptors and the interface text first rendered
    /// for the name.
    pub fn add_capability<T>(&self, capability: Capability, backend: T)
    where
        T: CapabilityFn + 'static,
    {
        debug!(capability = %capability.name(), "capability registered");
        self.registry.add_capability(capability, backend);
    }

    /// Snapshot of the registered descriptors in registration order.
    #[must_use]
    pub fn list_capabilities(&self) -> Vec<Capability> {
        self.registry.list()
    }

    /// Interface text for one capability.
    #[must_use]
    pub fn describe(&self, capability: &Capability) -> String {
        self.interfaces.describe(capability)
    }

    /// Interface text for every registered capability, headed by the
    /// generated-interfaces banner.
    #[must_use]
    pub fn describe_all(&self) -> String {
        self.interfaces.describe_all(&self.registry.list())
    }

    /// Interface text of the first capability registered as `name`.
    #[must_use]
    pub fn interface(&self, name: &str) -> Option<String> {
        self.registry
            .list()
            .iter()
            .find(|capability| capability.name() == name)
            .map(|capability| self.interfaces.describe(capability))
    }

    /// Calls a capability directly, bypassing the snippet engine.
    ///
    /// # Errors
    ///
    /// Propagates [`CapabilityRegistry::invoke`] failures unchanged.
    pub async fn invoke(&self, name: &str, args: Args) -> CapabilityResult<Value> {
        self.registry.invoke(name, args).await
    }

    /// Runs `code` with the configured default timeout.
    pub async fn run(&self, code: &str) -> ExecutionOutcome {
        self.run_with_timeout(code, self.default_timeout).await
    }

    /// Runs `code` for at most `timeout`, waiting first for a run permit.
    pub async fn run_with_timeout(&self, code: &str, timeout: Duration) -> ExecutionOutcome {
        self.scheduler
            .run(self.engine.run(code, timeout))
            .await
            .unwrap_or_else(rejected)
    }

    /// Runs `code` on a background task with the default timeout.
    #[must_use]
    pub fn spawn_run(&self, code: impl Into<String>) -> JoinHandle<ExecutionOutcome> {
        let code = code.into();
        let engine = self.engine.clone();
        let scheduler = self.scheduler.clone();
        let timeout = self.default_timeout;
        tokio::spawn(async move {
            scheduler
                .run(engine.run(&code, timeout))
                .await
                .unwrap_or_else(rejected)
        })
    }

    /// Timeout used by [`CodeModeClient::run`] and [`CodeModeClient::spawn_run`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Concurrency gate shared by every run of this client.
    #[must_use]
    pub const fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    /// Removes every capability and cached interface. Later runs see no
    /// capabilities.
    pub fn close(&self) {
        let removed = self.registry.len();
        self.registry.clear();
        self.interfaces.clear();
        info!(removed, "code mode client closed");
    }
}

fn rejected(err: SchedulerError) -> ExecutionOutcome {
    ExecutionOutcome::failed(Vec::new(), format!("Code execution failed: {err}"))
}
