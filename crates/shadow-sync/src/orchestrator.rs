//! Enrichment orchestration: pick accounts, walk sources in priority order,
//! merge what comes back, and stop as soon as an account is complete.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadow_core::{coverage_score, CoverageStats};
use shadow_sources::{FetchOutcome, ProfileSource, QuotaWaitPolicy, RateLimitOrigin, SourceClient};
use shadow_storage::{AttemptRecord, ShadowBackend, ShadowStore, StoreError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    AlreadyComplete,
    Complete,
    PartiallyEnriched,
    Exhausted,
    CoolingDown,
    Deferred,
    Error,
    Cancelled,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::AlreadyComplete => "already_complete",
            AccountStatus::Complete => "complete",
            AccountStatus::PartiallyEnriched => "partially_enriched",
            AccountStatus::Exhausted => "exhausted",
            AccountStatus::CoolingDown => "cooling_down",
            AccountStatus::Deferred => "deferred",
            AccountStatus::Error => "error",
            AccountStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceResult {
    /// Every field the source provides is already known.
    Skipped,
    Fetched,
    Empty,
    RateLimitedLocal,
    RateLimitedRemote,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub source: String,
    pub result: SourceResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SourceAttempt {
    fn new(source: &str, result: SourceResult, detail: Option<String>) -> Self {
        Self {
            source: source.to_string(),
            result,
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOutcome {
    pub account_id: String,
    pub status: AccountStatus,
    pub coverage_before: Option<f64>,
    pub coverage_after: Option<f64>,
    pub fragments_merged: usize,
    pub edges_upserted: usize,
    pub sources: Vec<SourceAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccountOutcome {
    fn new(account_id: &str, coverage_before: Option<f64>) -> Self {
        Self {
            account_id: account_id.to_string(),
            status: AccountStatus::Cancelled,
            coverage_before,
            coverage_after: coverage_before,
            fragments_merged: 0,
            edges_upserted: 0,
            sources: Vec::new(),
            reason: None,
        }
    }

    fn finish(mut self, status: AccountStatus, reason: Option<String>) -> Self {
        self.status = status;
        self.reason = reason;
        self
    }

    /// Number of calls that reached a source (skips excluded).
    pub fn source_calls(&self) -> usize {
        self.sources
            .iter()
            .filter(|a| a.result != SourceResult::Skipped)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    pub account_ids: Vec<String>,
    /// Source names in priority order. Empty means every configured source.
    pub sources: Vec<String>,
    pub threshold: f64,
    pub cooldown: Duration,
    pub quota_wait: QuotaWaitPolicy,
}

impl EnrichmentRequest {
    pub fn new(account_ids: Vec<String>) -> Self {
        Self {
            account_ids,
            sources: Vec::new(),
            threshold: 1.0,
            cooldown: Duration::from_secs(6 * 60 * 60),
            quota_wait: QuotaWaitPolicy::fail_fast(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_quota_wait(mut self, quota_wait: QuotaWaitPolicy) -> Self {
        self.quota_wait = quota_wait;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub accounts: Vec<AccountOutcome>,
    pub status_counts: BTreeMap<AccountStatus, usize>,
    pub coverage_before: CoverageStats,
    pub coverage_after: CoverageStats,
}

impl RunSummary {
    pub fn count(&self, status: AccountStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    pub fn outcome(&self, account_id: &str) -> Option<&AccountOutcome> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }
}

/// Cooperative stop signal, checked before each account starts.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct RunPlan {
    sources: Vec<Arc<dyn ProfileSource>>,
    threshold: f64,
    cooldown: Duration,
    quota_wait: QuotaWaitPolicy,
}

pub struct Orchestrator<B> {
    store: Arc<ShadowStore<B>>,
    client: Arc<SourceClient>,
    sources: Vec<Arc<dyn ProfileSource>>,
    workers: usize,
}

impl<B: ShadowBackend + 'static> Orchestrator<B> {
    pub fn new(
        store: Arc<ShadowStore<B>>,
        client: Arc<SourceClient>,
        sources: Vec<Arc<dyn ProfileSource>>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            client,
            sources,
            workers: workers.max(1),
        }
    }

    pub fn store(&self) -> &Arc<ShadowStore<B>> {
        &self.store
    }

    pub fn client(&self) -> &Arc<SourceClient> {
        &self.client
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn run(&self, request: EnrichmentRequest, cancel: &CancelHandle) -> Result<RunSummary> {
        if !(0.0..=1.0).contains(&request.threshold) {
            bail!("completeness threshold {} outside 0..=1", request.threshold);
        }
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let sources = self.resolve_sources(&request.sources)?;

        let mut scored = Vec::new();
        for account_id in dedupe(request.account_ids) {
            let score = match self.store.coverage(&account_id).await {
                Ok(score) => score,
                Err(err) => {
                    warn!(account_id = %account_id, error = %err, "coverage lookup failed; treating as unseen");
                    None
                }
            };
            scored.push((account_id, score));
        }
        let coverage_before = CoverageStats::from_scores(scored.iter().map(|(_, score)| *score));
        let ordered = prioritize(scored);
        info!(
            %run_id,
            accounts = ordered.len(),
            sources = sources.len(),
            workers = self.workers,
            "starting enrichment run"
        );

        let plan = Arc::new(RunPlan {
            sources,
            threshold: request.threshold,
            cooldown: request.cooldown,
            quota_wait: request.quota_wait,
        });
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut outcomes: Vec<Option<AccountOutcome>> = vec![None; ordered.len()];

        for (index, (account_id, before)) in ordered.iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            if cancel.is_cancelled() {
                outcomes[index] = Some(
                    AccountOutcome::new(account_id, *before)
                        .finish(AccountStatus::Cancelled, Some("run cancelled".to_string())),
                );
                continue;
            }

            let store = Arc::clone(&self.store);
            let client = Arc::clone(&self.client);
            let plan = Arc::clone(&plan);
            let cancel = cancel.clone();
            let account_id = account_id.clone();
            let before = *before;
            tasks.spawn(async move {
                let _permit = permit;
                let span = info_span!("enrich_account", account_id = %account_id);
                let outcome = enrich_account(&store, &client, &plan, &cancel, &account_id, before)
                    .instrument(span)
                    .await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) => warn!(error = %err, "enrichment worker failed"),
            }
        }

        let accounts: Vec<AccountOutcome> = outcomes
            .into_iter()
            .zip(ordered)
            .map(|(outcome, (account_id, before))| {
                outcome.unwrap_or_else(|| {
                    AccountOutcome::new(&account_id, before)
                        .finish(AccountStatus::Error, Some("worker task failed".to_string()))
                })
            })
            .collect();

        let mut status_counts = BTreeMap::new();
        for account in &accounts {
            *status_counts.entry(account.status).or_insert(0) += 1;
        }
        let coverage_after = CoverageStats::from_scores(accounts.iter().map(|a| a.coverage_after));
        let finished_at = Utc::now();
        info!(
            %run_id,
            accounts = accounts.len(),
            complete = coverage_after.complete,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "enrichment run finished"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            sources: plan.sources.iter().map(|s| s.name().to_string()).collect(),
            accounts,
            status_counts,
            coverage_before,
            coverage_after,
        })
    }

    fn resolve_sources(&self, names: &[String]) -> Result<Vec<Arc<dyn ProfileSource>>> {
        if names.is_empty() {
            return Ok(self.sources.clone());
        }
        names
            .iter()
            .map(|name| {
                self.sources
                    .iter()
                    .find(|s| s.name() == name)
                    .cloned()
                    .with_context(|| format!("unknown source {name}"))
            })
            .collect()
    }
}

async fn enrich_account<B: ShadowBackend>(
    store: &ShadowStore<B>,
    client: &SourceClient,
    plan: &RunPlan,
    cancel: &CancelHandle,
    account_id: &str,
    before: Option<f64>,
) -> AccountOutcome {
    let mut outcome = AccountOutcome::new(account_id, before);
    if cancel.is_cancelled() {
        return outcome.finish(AccountStatus::Cancelled, Some("run cancelled".to_string()));
    }

    match walk_sources(store, client, plan, account_id, &mut outcome).await {
        Ok(status) => outcome.status = status,
        Err(err) => {
            warn!(error = %err, "account enrichment failed");
            outcome.status = AccountStatus::Error;
            outcome.reason = Some(err.to_string());
        }
    }
    info!(
        status = outcome.status.as_str(),
        coverage = ?outcome.coverage_after,
        calls = outcome.source_calls(),
        "account finished"
    );
    outcome
}

async fn walk_sources<B: ShadowBackend>(
    store: &ShadowStore<B>,
    client: &SourceClient,
    plan: &RunPlan,
    account_id: &str,
    outcome: &mut AccountOutcome,
) -> Result<AccountStatus, StoreError> {
    let profile = store.profile(account_id).await?;
    let mut coverage = coverage_score(profile.as_ref());
    outcome.coverage_after = coverage;
    if reached(coverage, plan.threshold) {
        return Ok(AccountStatus::AlreadyComplete);
    }

    if let Some(attempt) = store.attempt(account_id).await? {
        if attempt.status == AccountStatus::Exhausted.as_str() {
            if let Some(exhausted_at) = attempt.exhausted_at {
                if within_cooldown(exhausted_at, plan.cooldown, Utc::now()) {
                    outcome.reason = Some(format!("exhausted at {}", exhausted_at.to_rfc3339()));
                    return Ok(AccountStatus::CoolingDown);
                }
            }
        }
    }

    let mut known = profile.map(|p| p.fields).unwrap_or_default();
    let mut rate_limited = 0usize;

    for source in &plan.sources {
        let name = source.name();
        if source.provides().iter().all(|field| known.has(*field)) {
            outcome
                .sources
                .push(SourceAttempt::new(name, SourceResult::Skipped, None));
            continue;
        }

        match client.fetch(account_id, source.as_ref(), plan.quota_wait).await {
            Ok(FetchOutcome::Fetched(partial)) => {
                let merged = store.merge(account_id, &partial.fields, Some(name)).await?;
                outcome.fragments_merged += 1;
                for edge in &partial.edges {
                    store
                        .upsert_edge(account_id, &edge.target_account_id, edge.list_type, Some(name))
                        .await?;
                    outcome.edges_upserted += 1;
                }
                coverage = Some(merged.coverage());
                outcome.coverage_after = coverage;
                known = merged.fields;
                outcome
                    .sources
                    .push(SourceAttempt::new(name, SourceResult::Fetched, None));
                if reached(coverage, plan.threshold) {
                    break;
                }
            }
            Ok(FetchOutcome::Empty) => {
                outcome
                    .sources
                    .push(SourceAttempt::new(name, SourceResult::Empty, None));
            }
            Ok(FetchOutcome::RateLimited { origin, retry_after }) => {
                rate_limited += 1;
                let result = match origin {
                    RateLimitOrigin::Local => SourceResult::RateLimitedLocal,
                    RateLimitOrigin::Remote => SourceResult::RateLimitedRemote,
                };
                outcome.sources.push(SourceAttempt::new(
                    name,
                    result,
                    Some(format!("retry after {}s", retry_after.as_secs())),
                ));
            }
            Err(err) => {
                warn!(source = name, kind = err.kind(), error = %err, "source failed");
                outcome
                    .sources
                    .push(SourceAttempt::new(name, SourceResult::Failed, Some(err.to_string())));
            }
        }
    }

    let status = if reached(coverage, plan.threshold) {
        AccountStatus::Complete
    } else if rate_limited == 0 {
        AccountStatus::Exhausted
    } else if outcome.fragments_merged > 0 {
        AccountStatus::PartiallyEnriched
    } else {
        AccountStatus::Deferred
    };

    let now = Utc::now();
    store
        .record_attempt(&AttemptRecord {
            account_id: account_id.to_string(),
            status: status.as_str().to_string(),
            last_attempt_at: now,
            exhausted_at: (status == AccountStatus::Exhausted).then_some(now),
        })
        .await?;
    if status == AccountStatus::Exhausted {
        outcome.reason = Some("no source could complete the profile".to_string());
    }
    Ok(status)
}

fn reached(coverage: Option<f64>, threshold: f64) -> bool {
    coverage.is_some_and(|c| c >= threshold)
}

fn within_cooldown(exhausted_at: DateTime<Utc>, cooldown: Duration, now: DateTime<Utc>) -> bool {
    match (now - exhausted_at).to_std() {
        Ok(age) => age < cooldown,
        // Exhausted "in the future": clock skew, keep waiting.
        Err(_) => true,
    }
}

fn dedupe(account_ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    account_ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// Accounts with no data first, then ascending coverage; input order breaks ties.
fn prioritize(mut scored: Vec<(String, Option<f64>)>) -> Vec<(String, Option<f64>)> {
    scored.sort_by(|(_, a), (_, b)| match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.total_cmp(b),
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use shadow_core::{
        EdgeObservation, EdgeRecord, ListType, PartialProfile, ProfileField, ProfileFields,
        ShadowProfile,
    };
    use shadow_sources::{ClientConfig, SourceFailure};
    use shadow_storage::{
        BackendError, BackoffPolicy, EdgeKey, QuotaTracker, QuotaWindow, SqliteBackend,
    };
    use tempfile::tempdir;

    type Scripted = Result<Option<PartialProfile>, SourceFailure>;

    struct ScriptedSource {
        name: String,
        provides: Vec<ProfileField>,
        per_account: HashMap<String, Scripted>,
        fallback: Scripted,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(name: &str, fallback: Scripted) -> Self {
            Self {
                name: name.to_string(),
                provides: ProfileField::ALL.to_vec(),
                per_account: HashMap::new(),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        fn for_account(mut self, account_id: &str, response: Scripted) -> Self {
            self.per_account.insert(account_id.to_string(), response);
            self
        }

        fn providing(mut self, provides: Vec<ProfileField>) -> Self {
            self.provides = provides;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProfileSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn provides(&self) -> &[ProfileField] {
            &self.provides
        }

        async fn fetch_partial(&self, account_id: &str) -> Result<Option<PartialProfile>, SourceFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.per_account
                .get(account_id)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn complete_fields() -> ProfileFields {
        ProfileFields {
            location: Some("NYC".into()),
            website: Some("a.com".into()),
            avatar_present: Some(true),
            followers_count: Some(10),
            following_count: Some(5),
            ..ProfileFields::default()
        }
    }

    fn fields(f: ProfileFields) -> Scripted {
        Ok(Some(PartialProfile::from_fields(f)))
    }

    async fn sqlite(dir: &Path) -> SqliteBackend {
        let url = format!("sqlite://{}", dir.join("shadow.db").display());
        let backend = SqliteBackend::connect(&url, 4).await.expect("connect");
        backend.migrate().await.expect("migrate");
        backend
    }

    async fn client(dir: &Path) -> Arc<SourceClient> {
        let quota = QuotaTracker::open(dir.join("quota"), Vec::<(String, Vec<QuotaWindow>)>::new())
            .await
            .expect("quota");
        Arc::new(SourceClient::new(
            Arc::new(quota),
            ClientConfig {
                retry: BackoffPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                ..ClientConfig::default()
            },
        ))
    }

    async fn orchestrator(
        dir: &Path,
        sources: Vec<Arc<dyn ProfileSource>>,
    ) -> Orchestrator<SqliteBackend> {
        let store = Arc::new(ShadowStore::new(sqlite(dir).await));
        Orchestrator::new(store, client(dir).await, sources, 2)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unseen_accounts_come_first_then_lowest_coverage() {
        let ordered = prioritize(vec![
            ("done".into(), Some(1.0)),
            ("partial".into(), Some(0.0)),
            ("ghost".into(), None),
            ("ghost2".into(), None),
        ]);
        let order: Vec<&str> = ordered.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["ghost", "ghost2", "partial", "done"]);
    }

    #[test]
    fn duplicate_and_blank_ids_are_dropped() {
        assert_eq!(dedupe(ids(&["a", " a ", "", "b", "a"])), ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn stops_at_the_first_source_that_completes_the_profile() {
        let dir = tempdir().expect("tempdir");
        let first = Arc::new(ScriptedSource::new("first", fields(complete_fields())));
        let second = Arc::new(ScriptedSource::new("second", fields(complete_fields())));
        let orch = orchestrator(dir.path(), vec![first.clone(), second.clone()]).await;

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("run");
        let outcome = summary.outcome("42").unwrap();
        assert_eq!(outcome.status, AccountStatus::Complete);
        assert_eq!(outcome.coverage_after, Some(1.0));
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
        assert_eq!(summary.coverage_before.with_data, 0);
        assert_eq!(summary.coverage_after.complete, 1);

        let again = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("rerun");
        assert_eq!(again.count(AccountStatus::AlreadyComplete), 1);
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn fragments_from_several_sources_accumulate() {
        let dir = tempdir().expect("tempdir");
        let first = Arc::new(ScriptedSource::new(
            "first",
            Ok(Some(PartialProfile {
                fields: ProfileFields {
                    location: Some("NYC".into()),
                    ..ProfileFields::default()
                },
                edges: vec![EdgeObservation {
                    target_account_id: "7".into(),
                    list_type: ListType::Following,
                }],
            })),
        ));
        let second = Arc::new(ScriptedSource::new(
            "second",
            fields(ProfileFields {
                website: Some("a.com".into()),
                avatar_present: Some(true),
                followers_count: Some(10),
                following_count: Some(5),
                ..ProfileFields::default()
            }),
        ));
        let orch = orchestrator(dir.path(), vec![first, second]).await;

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("run");
        let outcome = summary.outcome("42").unwrap();
        assert_eq!(outcome.status, AccountStatus::Complete);
        assert_eq!(outcome.fragments_merged, 2);
        assert_eq!(outcome.edges_upserted, 1);

        let profile = orch.store().profile("42").await.unwrap().unwrap();
        assert_eq!(profile.fields.location.as_deref(), Some("NYC"));
        assert_eq!(profile.last_source.as_deref(), Some("second"));
        assert_eq!(orch.store().edges_for("42").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sources_with_nothing_new_are_not_called() {
        let dir = tempdir().expect("tempdir");
        let location_only = Arc::new(
            ScriptedSource::new("geo", fields(ProfileFields::default()))
                .providing(vec![ProfileField::Location]),
        );
        let orch = orchestrator(dir.path(), vec![location_only.clone()]).await;
        orch.store()
            .merge(
                "42",
                &ProfileFields {
                    location: Some("NYC".into()),
                    ..ProfileFields::default()
                },
                Some("seed"),
            )
            .await
            .unwrap();

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("run");
        let outcome = summary.outcome("42").unwrap();
        assert_eq!(location_only.calls(), 0);
        assert_eq!(outcome.sources[0].result, SourceResult::Skipped);
        assert_eq!(outcome.status, AccountStatus::Exhausted);
    }

    #[tokio::test]
    async fn exhausted_accounts_cool_down_between_runs() {
        let dir = tempdir().expect("tempdir");
        let empty = Arc::new(ScriptedSource::new("empty", Ok(None)));
        let orch = orchestrator(dir.path(), vec![empty.clone()]).await;

        let first = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("run");
        assert_eq!(first.outcome("42").unwrap().status, AccountStatus::Exhausted);
        let attempt = orch.store().attempt("42").await.unwrap().unwrap();
        assert!(attempt.exhausted_at.is_some());

        let second = orch
            .run(EnrichmentRequest::new(ids(&["42"])), &CancelHandle::new())
            .await
            .expect("run");
        assert_eq!(second.outcome("42").unwrap().status, AccountStatus::CoolingDown);
        assert_eq!(empty.calls(), 1);

        let third = orch
            .run(
                EnrichmentRequest::new(ids(&["42"])).with_cooldown(Duration::ZERO),
                &CancelHandle::new(),
            )
            .await
            .expect("run");
        assert_eq!(third.outcome("42").unwrap().status, AccountStatus::Exhausted);
        assert_eq!(empty.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limited_sources_leave_accounts_partial_or_deferred() {
        let dir = tempdir().expect("tempdir");
        let geo = Arc::new(
            ScriptedSource::new("geo", Ok(None)).for_account(
                "x",
                fields(ProfileFields {
                    location: Some("NYC".into()),
                    ..ProfileFields::default()
                }),
            ),
        );
        let limited = Arc::new(ScriptedSource::new(
            "limited",
            Err(SourceFailure::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            }),
        ));
        let orch = orchestrator(dir.path(), vec![geo, limited]).await;

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["x", "y"])), &CancelHandle::new())
            .await
            .expect("run");
        assert_eq!(summary.outcome("x").unwrap().status, AccountStatus::PartiallyEnriched);
        assert_eq!(summary.outcome("y").unwrap().status, AccountStatus::Deferred);
        assert!(orch.store().attempt("y").await.unwrap().unwrap().exhausted_at.is_none());
    }

    #[tokio::test]
    async fn source_errors_stay_inside_the_account() {
        let dir = tempdir().expect("tempdir");
        let broken = Arc::new(
            ScriptedSource::new("broken", fields(complete_fields()))
                .for_account("bad", Err(SourceFailure::Malformed("<html>".into()))),
        );
        let orch = orchestrator(dir.path(), vec![broken]).await;

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["bad", "good"])), &CancelHandle::new())
            .await
            .expect("run");
        let bad = summary.outcome("bad").unwrap();
        assert_eq!(bad.status, AccountStatus::Exhausted);
        assert_eq!(bad.sources[0].result, SourceResult::Failed);
        assert_eq!(summary.outcome("good").unwrap().status, AccountStatus::Complete);
    }

    #[tokio::test]
    async fn cancelled_runs_touch_no_sources() {
        let dir = tempdir().expect("tempdir");
        let source = Arc::new(ScriptedSource::new("s", fields(complete_fields())));
        let orch = orchestrator(dir.path(), vec![source.clone()]).await;
        let cancel = CancelHandle::new();
        cancel.cancel();

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["a", "b", "c"])), &cancel)
            .await
            .expect("run");
        assert_eq!(summary.count(AccountStatus::Cancelled), 3);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_source_names_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let orch = orchestrator(dir.path(), Vec::new()).await;
        let err = orch
            .run(
                EnrichmentRequest::new(ids(&["a"])).with_sources(ids(&["nope"])),
                &CancelHandle::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    /// Delegates to SQLite but reports every merge as a held lock.
    struct LockedMerges(SqliteBackend);

    #[async_trait]
    impl ShadowBackend for LockedMerges {
        async fn merge_profile(
            &self,
            _account_id: &str,
            _fields: &ProfileFields,
            _source: Option<&str>,
            _at: DateTime<Utc>,
        ) -> Result<ShadowProfile, BackendError> {
            Err(BackendError::Transient("database is locked".into()))
        }

        async fn upsert_edge(
            &self,
            key: &EdgeKey,
            reported_by: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<EdgeRecord, BackendError> {
            self.0.upsert_edge(key, reported_by, at).await
        }

        async fn load_profile(&self, account_id: &str) -> Result<Option<ShadowProfile>, BackendError> {
            self.0.load_profile(account_id).await
        }

        async fn edges_for(&self, account_id: &str) -> Result<Vec<EdgeRecord>, BackendError> {
            self.0.edges_for(account_id).await
        }

        async fn record_attempt(&self, attempt: &AttemptRecord) -> Result<(), BackendError> {
            self.0.record_attempt(attempt).await
        }

        async fn load_attempt(&self, account_id: &str) -> Result<Option<AttemptRecord>, BackendError> {
            self.0.load_attempt(account_id).await
        }

        async fn candidate_accounts(&self, limit: usize) -> Result<Vec<String>, BackendError> {
            self.0.candidate_accounts(limit).await
        }

        async fn all_profiles(&self) -> Result<Vec<ShadowProfile>, BackendError> {
            self.0.all_profiles().await
        }

        async fn all_edges(&self) -> Result<Vec<EdgeRecord>, BackendError> {
            self.0.all_edges().await
        }
    }

    #[tokio::test]
    async fn storage_outages_mark_the_account_as_error() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(ShadowStore::with_retry(
            LockedMerges(sqlite(dir.path()).await),
            BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        ));
        let source: Arc<dyn ProfileSource> =
            Arc::new(ScriptedSource::new("s", fields(complete_fields())));
        let orch = Orchestrator::new(store, client(dir.path()).await, vec![source], 1);

        let summary = orch
            .run(EnrichmentRequest::new(ids(&["a", "b"])), &CancelHandle::new())
            .await
            .expect("run completes");
        assert_eq!(summary.count(AccountStatus::Error), 2);
        let reason = summary.outcome("a").unwrap().reason.clone().unwrap();
        assert!(reason.contains("storage unavailable after 3 attempts"));
    }
}
