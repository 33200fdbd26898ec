//! Wires configuration, registry, quota, store and orchestrator together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use shadow_sources::{ClientConfig, SourceClient, SourceRegistry};
use shadow_storage::{QuotaTracker, ShadowStore, SqliteBackend};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::EnrichConfig;
use crate::export::export_snapshot;
use crate::orchestrator::{CancelHandle, EnrichmentRequest, Orchestrator, RunSummary};
use crate::reports::write_run_reports;

pub struct EnrichPipeline {
    config: EnrichConfig,
    orchestrator: Orchestrator<SqliteBackend>,
    run_lock: Mutex<()>,
}

impl EnrichPipeline {
    pub async fn connect(config: EnrichConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;

        let backend = SqliteBackend::connect(&config.database_url, config.workers as u32 + 1)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        backend.migrate().await.context("running shadow store migrations")?;
        let store = Arc::new(ShadowStore::new(backend));

        let quota = QuotaTracker::open(&config.quota_dir, registry.quota_limits())
            .await
            .with_context(|| format!("opening quota state in {}", config.quota_dir.display()))?;
        if !quota.recovered().is_empty() {
            warn!(sources = ?quota.recovered(), "quota state was reset for some sources");
        }
        let client = Arc::new(SourceClient::new(
            Arc::new(quota),
            ClientConfig {
                request_timeout: config.http_timeout(),
                ..ClientConfig::default()
            },
        ));

        let base_dir = config
            .sources_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let sources = registry.build_sources(base_dir, &config.user_agent, config.http_timeout())?;
        if sources.is_empty() {
            warn!(path = %config.sources_file.display(), "no enabled sources configured");
        }

        let orchestrator = Orchestrator::new(store, client, sources, config.workers);
        Ok(Self::from_parts(config, orchestrator))
    }

    pub fn from_parts(config: EnrichConfig, orchestrator: Orchestrator<SqliteBackend>) -> Self {
        Self {
            config,
            orchestrator,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ShadowStore<SqliteBackend>> {
        self.orchestrator.store()
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        self.orchestrator.client().quota()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.orchestrator.source_names()
    }

    /// Request carrying the configured threshold, cooldown and quota wait.
    pub fn request_for(&self, account_ids: Vec<String>) -> EnrichmentRequest {
        EnrichmentRequest::new(account_ids)
            .with_threshold(self.config.completeness_threshold)
            .with_cooldown(self.config.cooldown)
            .with_quota_wait(self.config.quota_wait())
    }

    /// Runs the request and writes its reports; returns the run directory.
    pub async fn run(
        &self,
        request: EnrichmentRequest,
        cancel: &CancelHandle,
    ) -> Result<(RunSummary, PathBuf)> {
        let _running = self.run_lock.lock().await;
        self.run_locked(request, cancel).await
    }

    /// Enriches whatever the store itself reports as incomplete.
    pub async fn run_candidates(&self, cancel: &CancelHandle) -> Result<(RunSummary, PathBuf)> {
        let _running = self.run_lock.lock().await;
        self.run_candidates_locked(cancel).await
    }

    /// One scheduler tick: a candidate run, or `None` when another run holds
    /// the lock.
    pub async fn scheduled_tick(&self) -> Option<Result<(RunSummary, PathBuf)>> {
        let Ok(_running) = self.run_lock.try_lock() else {
            warn!("previous enrichment run still active; skipping tick");
            return None;
        };
        Some(self.run_candidates_locked(&CancelHandle::new()).await)
    }

    // Callers hold `run_lock`.
    async fn run_locked(
        &self,
        request: EnrichmentRequest,
        cancel: &CancelHandle,
    ) -> Result<(RunSummary, PathBuf)> {
        let summary = self.orchestrator.run(request, cancel).await?;
        let run_dir = write_run_reports(&self.config.reports_dir, &summary).await?;
        Ok((summary, run_dir))
    }

    async fn run_candidates_locked(&self, cancel: &CancelHandle) -> Result<(RunSummary, PathBuf)> {
        let account_ids = self
            .store()
            .candidate_accounts(self.config.candidate_limit)
            .await
            .context("listing candidate accounts")?;
        info!(candidates = account_ids.len(), "discovered candidate accounts");
        self.run_locked(self.request_for(account_ids), cancel).await
    }

    pub async fn export(&self, out_dir: &Path) -> Result<PathBuf> {
        let profiles = self.store().all_profiles().await.context("loading profiles")?;
        let edges = self.store().all_edges().await.context("loading edges")?;
        let out_dir = out_dir.to_path_buf();
        tokio::task::spawn_blocking(move || export_snapshot(&out_dir, &profiles, &edges))
            .await
            .context("export task panicked")?
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.scheduled_tick().await {
                    None => {}
                    Some(Ok((summary, run_dir))) => info!(
                        run_id = %summary.run_id,
                        accounts = summary.accounts.len(),
                        reports = %run_dir.display(),
                        "scheduled enrichment run finished"
                    ),
                    Some(Err(err)) => {
                        warn!(error = %format!("{err:#}"), "scheduled enrichment run failed")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
