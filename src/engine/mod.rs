//! Adapters around the external scanner executables.
//!
//! Each adapter turns a resolved target/port set into a lazy stream of open
//! ports read from the child's stdout.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Result, ScanError};
use crate::types::{EngineKind, OpenPortRecord, ScanPlan};

pub mod fast;
mod process;
pub mod verify;

pub use fast::FastEngine;
pub use verify::{VerifyEngine, VerifyParser};

/// Finite, non-restartable stream of open ports from one engine invocation.
pub type PortStream = Pin<Box<dyn Stream<Item = Result<OpenPortRecord>> + Send>>;

/// Arguments handed to an engine for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub targets: Vec<String>,
    pub ports: String,
    pub rate: u32,
    pub wait_seconds: u64,
    pub interface: Option<String>,
}

impl EngineParams {
    pub fn from_plan(plan: &ScanPlan, rate: u32) -> Self {
        Self {
            targets: plan.targets.clone(),
            ports: plan.ports.clone(),
            rate,
            wait_seconds: plan.wait_seconds,
            interface: plan.interface.clone(),
        }
    }
}

#[async_trait]
pub trait ScanEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Fails with `EngineUnavailable` when the executable cannot be found.
    fn ensure_available(&self) -> Result<()>;

    /// Start the engine. Records arrive as the child prints them; the stream
    /// ends with `Err(Cancelled)` if `cancel` fires first.
    async fn run(&self, params: &EngineParams, cancel: CancellationToken) -> Result<PortStream>;
}

/// Look up an executable on `PATH` (or check an explicit path).
pub(crate) fn locate(kind: EngineKind, program: &str) -> Result<std::path::PathBuf> {
    which::which(program).map_err(|e| ScanError::EngineUnavailable {
        engine: kind,
        reason: format!("{program}: {e}"),
    })
}

/// The pair of engines an orchestrator chooses from.
#[derive(Clone)]
pub struct EngineSet {
    pub fast: Arc<dyn ScanEngine>,
    pub verify: Arc<dyn ScanEngine>,
}

impl EngineSet {
    pub fn new(fast: Arc<dyn ScanEngine>, verify: Arc<dyn ScanEngine>) -> Self {
        Self { fast, verify }
    }

    /// The external executables named in the configuration.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            Arc::new(FastEngine::new(&cfg.fast_path)),
            Arc::new(VerifyEngine::new(&cfg.verify_path)),
        )
    }

    pub fn get(&self, kind: EngineKind) -> Arc<dyn ScanEngine> {
        match kind {
            EngineKind::Fast => Arc::clone(&self.fast),
            EngineKind::Verify => Arc::clone(&self.verify),
        }
    }
}
