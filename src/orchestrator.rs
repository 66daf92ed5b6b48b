//! Runs one scan at a time: plan, engine invocation with fallback, banner
//! enrichment, persistence and progress reporting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::banner::{BannerGrabber, BannerInfo, BannerLimits};
use crate::config::ScanConfig;
use crate::decision::DecisionEngine;
use crate::engine::{EngineParams, EngineSet};
use crate::error::{Result, ScanError};
use crate::hub::ProgressHub;
use crate::store::ResultStore;
use crate::types::{EngineKind, OpenPortRecord, RunEngine, RunStatus, ScanPlan, ScanResult, ScanRun};

/// Minimum spacing of per-record progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(700);

/// Single-flight scan runner. Cheap to clone; clones share the same run slot.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    run_lock: Arc<AsyncMutex<()>>,
    active: Mutex<Option<CancellationToken>>,
    hub: ProgressHub,
    store: Arc<dyn ResultStore>,
    decision: DecisionEngine,
    engines: EngineSet,
    banners: Arc<dyn BannerGrabber>,
}

/// A scan started with [`Orchestrator::spawn`].
#[derive(Debug)]
pub struct ScanHandle {
    run_id: String,
    task: JoinHandle<Result<ScanRun>>,
}

impl ScanHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal run record.
    pub async fn wait(self) -> Result<ScanRun> {
        self.task
            .await
            .map_err(|e| ScanError::Internal(format!("scan task failed: {e}")))?
    }

    /// Let the scan finish in the background.
    pub fn detach(self) {
        debug!(run_id = %self.run_id, "scan detached");
    }
}

impl Orchestrator {
    pub fn new(
        decision: DecisionEngine,
        engines: EngineSet,
        store: Arc<dyn ResultStore>,
        banners: Arc<dyn BannerGrabber>,
        hub: ProgressHub,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                run_lock: Arc::new(AsyncMutex::new(())),
                active: Mutex::new(None),
                hub,
                store,
                decision,
                engines,
                banners,
            }),
        }
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.inner.hub
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.inner.store
    }

    pub fn decision(&self) -> &DecisionEngine {
        &self.inner.decision
    }

    /// Resolve what a run with `config` would do, without running it.
    pub fn plan(&self, config: &ScanConfig) -> Result<ScanPlan> {
        self.inner.decision.plan(config)
    }

    /// Run a scan to completion, waiting for any active run to finish first.
    ///
    /// A cancelled run is returned as `Ok` with status `cancelled`.
    pub async fn start(&self, config: ScanConfig) -> Result<ScanRun> {
        let (guard, token) = loop {
            if let Some(acquired) = self.inner.try_acquire() {
                break acquired;
            }
            // Wait for the active run to release the lock, then race for it.
            drop(self.inner.run_lock.lock().await);
        };
        let run = ScanRun::begin(&config.targets, &config.ports);
        Arc::clone(&self.inner).execute(config, run, token, guard).await
    }

    /// Start a scan in the background. Fails with [`ScanError::Busy`] while
    /// another run is active.
    pub fn spawn(&self, config: ScanConfig) -> Result<ScanHandle> {
        let (guard, token) = self.inner.try_acquire().ok_or(ScanError::Busy)?;
        let run = ScanRun::begin(&config.targets, &config.ports);
        let run_id = run.id.clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.execute(config, run, token, guard).await });
        Ok(ScanHandle { run_id, task })
    }

    /// Signal the active run to stop. Returns whether a run was signalled;
    /// repeated calls for the same run return `false`.
    pub fn cancel(&self) -> bool {
        match self.inner.active_slot().take() {
            Some(token) => {
                token.cancel();
                info!("scan cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        let _slot = self.inner.active_slot();
        self.inner.run_lock.try_lock().is_err()
    }
}

impl Inner {
    fn active_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the run lock and arm a fresh token under the slot mutex, so no
    /// observer sees a held lock without a cancellable token.
    fn try_acquire(&self) -> Option<(OwnedMutexGuard<()>, CancellationToken)> {
        let mut slot = self.active_slot();
        let guard = Arc::clone(&self.run_lock).try_lock_owned().ok()?;
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some((guard, token))
    }

    fn release(&self, guard: OwnedMutexGuard<()>) {
        let mut slot = self.active_slot();
        slot.take();
        drop(guard);
    }

    async fn execute(
        self: Arc<Self>,
        config: ScanConfig,
        mut run: ScanRun,
        cancel: CancellationToken,
        guard: OwnedMutexGuard<()>,
    ) -> Result<ScanRun> {
        info!(run_id = %run.id, "scan started");
        let outcome = self.run_pipeline(&config, &mut run, &cancel).await;

        run.finished_at = Some(OffsetDateTime::now_utc());
        let (outcome, terminal) = match outcome {
            Ok(()) => {
                run.status = RunStatus::Completed;
                info!(run_id = %run.id, found = run.found, new = run.new_found, "scan finished");
                (Ok(()), "Scan finished".to_string())
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                run.status = RunStatus::Cancelled;
                info!(run_id = %run.id, found = run.found, "scan cancelled");
                (Ok(()), "Scan cancelled".to_string())
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.notes = Some(match run.notes.take() {
                    Some(reason) => format!("{reason}; error: {e}"),
                    None => format!("error: {e}"),
                });
                error!(run_id = %run.id, "scan failed: {e}");
                let message = e.to_string();
                (Err(e), message)
            }
        };

        if let Err(e) = self.store.add_scan_run(&run).await {
            error!(run_id = %run.id, "failed to record scan run: {e}");
        }
        self.release(guard);
        // Subscribers reacting to the terminal event see the run as stored
        // and the orchestrator idle.
        self.hub.emit(100, terminal);
        outcome.map(|()| run)
    }

    async fn run_pipeline(
        &self,
        config: &ScanConfig,
        run: &mut ScanRun,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.hub.emit(5, "Scan started");
        ensure_live(cancel)?;

        self.hub.emit(10, "Pre-flight checks");
        self.engines.verify.ensure_available()?;
        if let Err(e) = self.engines.fast.ensure_available() {
            warn!("{e}");
        }

        let plan = self.decision.plan(config)?;
        run.targets = plan.targets.clone();
        run.targets_count = plan.targets.len();
        run.ports_spec = plan.ports.clone();
        run.engine = plan.engine.into();
        run.notes = Some(plan.reason.clone());
        info!(
            run_id = %run.id,
            engine = %plan.engine,
            reason = %plan.reason,
            targets = %run.targets_summary(),
            ports = %plan.ports,
            "scan plan resolved"
        );
        ensure_live(cancel)?;

        self.hub.emit(20, "Launching scan engine");
        let params = EngineParams::from_plan(&plan, config.rate);

        let records = match plan.engine {
            EngineKind::Fast => {
                self.hub.emit(30, "Running fast engine");
                let (found, err) = self.collect(EngineKind::Fast, &params, cancel).await;
                match err {
                    Some(e) if e.is_cancelled() => return Err(e),
                    Some(e) => warn!(run_id = %run.id, "fast engine: {e}"),
                    None => {}
                }
                if found.is_empty() {
                    self.hub
                        .emit(45, "Fast engine returned 0, falling back to verify engine");
                    run.engine = RunEngine::Mixed;
                    self.collect_all(EngineKind::Verify, &params, cancel).await?
                } else {
                    found
                }
            }
            EngineKind::Verify => {
                self.hub.emit(35, "Running verify engine");
                self.collect_all(EngineKind::Verify, &params, cancel).await?
            }
        };

        self.hub.emit(70, "Analyzing banners & storing results");
        self.process_records(config, &records, run, cancel).await?;

        self.hub.emit(98, "Finalizing");
        Ok(())
    }

    /// Drain one engine invocation, keeping whatever arrived before an error.
    async fn collect(
        &self,
        kind: EngineKind,
        params: &EngineParams,
        cancel: &CancellationToken,
    ) -> (Vec<OpenPortRecord>, Option<ScanError>) {
        let engine = self.engines.get(kind);
        let mut stream = match engine.run(params, cancel.clone()).await {
            Ok(s) => s,
            Err(e) => return (Vec::new(), Some(e)),
        };

        let mut found = Vec::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (found, Some(ScanError::Cancelled)),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(rec)) => found.push(rec),
                Some(Err(e)) => return (found, Some(e)),
                None => break,
            }
        }
        debug!(engine = %kind, records = found.len(), "engine finished");
        (found, None)
    }

    async fn collect_all(
        &self,
        kind: EngineKind,
        params: &EngineParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<OpenPortRecord>> {
        match self.collect(kind, params, cancel).await {
            (found, None) => Ok(found),
            (_, Some(e)) => Err(e),
        }
    }

    async fn process_records(
        &self,
        config: &ScanConfig,
        records: &[OpenPortRecord],
        run: &mut ScanRun,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let limits = BannerLimits::from(config);
        let total = records.len();
        let mut seen: HashSet<(&str, u16, String)> = HashSet::new();
        let mut last_tick = Instant::now();

        for (i, rec) in records.iter().enumerate() {
            ensure_live(cancel)?;

            if !seen.insert((rec.host.as_str(), rec.port, rec.protocol.to_ascii_lowercase())) {
                continue;
            }
            run.found += 1;

            let info = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                res = self.banners.grab(&rec.host, rec.port, &limits) => match res {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(host = %rec.host, port = rec.port, "banner grab failed: {e}");
                        BannerInfo::default()
                    }
                },
            };
            let service = info
                .service
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "unknown".into());
            let result = ScanResult::observed(rec, info.banner, Some(service));

            match self.store.upsert_result(&result).await {
                Ok(true) => {
                    run.new_found += 1;
                    info!(host = %rec.host, port = rec.port, service = ?result.service, "new open port");
                }
                Ok(false) => {}
                Err(e) => error!(host = %rec.host, port = rec.port, "store upsert failed: {e}"),
            }

            if last_tick.elapsed() >= PROGRESS_INTERVAL {
                last_tick = Instant::now();
                let percent = 70 + ((i + 1) * 25 / total) as u8;
                self.hub
                    .emit(percent, format!("Processed {}/{}", i + 1, total));
            }
        }
        Ok(())
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ScanError::Cancelled)
    } else {
        Ok(())
    }
}
