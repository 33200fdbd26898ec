//! Field-merging profile store with transient-failure retries.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadow_core::{
    coverage_score, CoverageStats, EdgeRecord, ListType, ProfileFields, ShadowProfile,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, RetryLedger};
use crate::locks::KeyedLocks;

/// Error reported by a storage backend, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable after {attempts} attempts: {last_error}")]
    StorageUnavailable { attempts: usize, last_error: String },
    #[error(transparent)]
    Backend(BackendError),
    #[error("invalid record: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub source_account_id: String,
    pub target_account_id: String,
    pub list_type: ListType,
}

impl EdgeKey {
    pub fn new(
        source_account_id: impl Into<String>,
        target_account_id: impl Into<String>,
        list_type: ListType,
    ) -> Self {
        Self {
            source_account_id: source_account_id.into(),
            target_account_id: target_account_id.into(),
            list_type,
        }
    }

    fn lock_key(&self) -> String {
        format!(
            "edge:{}:{}:{}",
            self.source_account_id, self.target_account_id, self.list_type
        )
    }
}

/// Per-account enrichment bookkeeping (last outcome, exhaustion time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub account_id: String,
    pub status: String,
    pub last_attempt_at: DateTime<Utc>,
    pub exhausted_at: Option<DateTime<Utc>>,
}

/// Durable backend with per-key atomic read-modify-write.
#[async_trait]
pub trait ShadowBackend: Send + Sync {
    /// COALESCE-merge `fields` into the stored row, creating it if absent.
    async fn merge_profile(
        &self,
        account_id: &str,
        fields: &ProfileFields,
        source: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ShadowProfile, BackendError>;

    async fn upsert_edge(
        &self,
        key: &EdgeKey,
        reported_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<EdgeRecord, BackendError>;

    async fn load_profile(&self, account_id: &str) -> Result<Option<ShadowProfile>, BackendError>;

    async fn edges_for(&self, account_id: &str) -> Result<Vec<EdgeRecord>, BackendError>;

    async fn record_attempt(&self, attempt: &AttemptRecord) -> Result<(), BackendError>;

    async fn load_attempt(&self, account_id: &str) -> Result<Option<AttemptRecord>, BackendError>;

    /// Accounts worth enriching: edge targets with no profile first, then
    /// incomplete profiles.
    async fn candidate_accounts(&self, limit: usize) -> Result<Vec<String>, BackendError>;

    async fn all_profiles(&self) -> Result<Vec<ShadowProfile>, BackendError>;

    async fn all_edges(&self) -> Result<Vec<EdgeRecord>, BackendError>;
}

pub struct ShadowStore<B> {
    backend: B,
    retry: BackoffPolicy,
    locks: KeyedLocks,
}

impl<B: ShadowBackend> ShadowStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_retry(backend, BackoffPolicy::storage_default())
    }

    pub fn with_retry(backend: B, retry: BackoffPolicy) -> Self {
        Self {
            backend,
            retry,
            locks: KeyedLocks::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Merge a fragment into the account's profile. Null fields in `fields`
    /// never clear stored values. Serialized per account; retried on
    /// transient backend failures.
    pub async fn merge(
        &self,
        account_id: &str,
        fields: &ProfileFields,
        source: Option<&str>,
    ) -> Result<ShadowProfile, StoreError> {
        let account_id = validate_id(account_id)?;
        let fields = fields.clone().normalized();
        let at = Utc::now();

        let _guard = self.locks.lock(&format!("profile:{account_id}")).await;
        let backend = &self.backend;
        let fields = &fields;
        let profile = self
            .retry_backend("merge_profile", account_id, move || {
                backend.merge_profile(account_id, fields, source, at)
            })
            .await?;
        debug!(
            account_id,
            source = source.unwrap_or("-"),
            coverage = profile.coverage(),
            "merged profile fragment"
        );
        Ok(profile)
    }

    /// Idempotent on the composite key; a repeat only refreshes `last_seen_at`.
    pub async fn upsert_edge(
        &self,
        source_account_id: &str,
        target_account_id: &str,
        list_type: ListType,
        reported_by: Option<&str>,
    ) -> Result<EdgeRecord, StoreError> {
        let key = EdgeKey::new(
            validate_id(source_account_id)?,
            validate_id(target_account_id)?,
            list_type,
        );
        let at = Utc::now();

        let _guard = self.locks.lock(&key.lock_key()).await;
        let backend = &self.backend;
        let key = &key;
        self.retry_backend("upsert_edge", source_account_id, move || {
            backend.upsert_edge(key, reported_by, at)
        })
        .await
    }

    pub async fn profile(&self, account_id: &str) -> Result<Option<ShadowProfile>, StoreError> {
        let account_id = validate_id(account_id)?;
        let backend = &self.backend;
        self.retry_backend("load_profile", account_id, move || {
            backend.load_profile(account_id)
        })
        .await
    }

    /// Computed from the stored profile on every call.
    pub async fn coverage(&self, account_id: &str) -> Result<Option<f64>, StoreError> {
        Ok(coverage_score(self.profile(account_id).await?.as_ref()))
    }

    pub async fn coverage_stats(&self, account_ids: &[String]) -> Result<CoverageStats, StoreError> {
        let mut scores = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            scores.push(self.coverage(account_id).await?);
        }
        Ok(CoverageStats::from_scores(scores))
    }

    /// Coverage over every stored profile plus edge targets that have none.
    pub async fn population_stats(&self) -> Result<CoverageStats, StoreError> {
        let profiles = self.all_profiles().await?;
        let known: std::collections::HashSet<&str> =
            profiles.iter().map(|p| p.account_id.as_str()).collect();
        let unseen: std::collections::HashSet<String> = self
            .all_edges()
            .await?
            .into_iter()
            .map(|e| e.target_account_id)
            .filter(|id| !known.contains(id.as_str()))
            .collect();
        let scores = profiles
            .iter()
            .map(|p| Some(p.coverage()))
            .chain(unseen.iter().map(|_| None));
        Ok(CoverageStats::from_scores(scores))
    }

    pub async fn edges_for(&self, account_id: &str) -> Result<Vec<EdgeRecord>, StoreError> {
        let account_id = validate_id(account_id)?;
        let backend = &self.backend;
        self.retry_backend("edges_for", account_id, move || backend.edges_for(account_id))
            .await
    }

    pub async fn record_attempt(&self, attempt: &AttemptRecord) -> Result<(), StoreError> {
        let backend = &self.backend;
        self.retry_backend("record_attempt", &attempt.account_id, move || {
            backend.record_attempt(attempt)
        })
        .await
    }

    pub async fn attempt(&self, account_id: &str) -> Result<Option<AttemptRecord>, StoreError> {
        let account_id = validate_id(account_id)?;
        let backend = &self.backend;
        self.retry_backend("load_attempt", account_id, move || {
            backend.load_attempt(account_id)
        })
        .await
    }

    pub async fn candidate_accounts(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let backend = &self.backend;
        self.retry_backend("candidate_accounts", "*", move || {
            backend.candidate_accounts(limit)
        })
        .await
    }

    pub async fn all_profiles(&self) -> Result<Vec<ShadowProfile>, StoreError> {
        let backend = &self.backend;
        self.retry_backend("all_profiles", "*", move || backend.all_profiles())
            .await
    }

    pub async fn all_edges(&self) -> Result<Vec<EdgeRecord>, StoreError> {
        let backend = &self.backend;
        self.retry_backend("all_edges", "*", move || backend.all_edges())
            .await
    }

    async fn retry_backend<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut attempt: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut ledger = RetryLedger::new(self.retry);
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(BackendError::Transient(reason)) => match ledger.record_failure() {
                    Some(delay) => {
                        warn!(
                            operation,
                            key,
                            attempt = ledger.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "transient storage failure; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(StoreError::StorageUnavailable {
                            attempts: ledger.failures(),
                            last_error: reason,
                        });
                    }
                },
                Err(err @ BackendError::Permanent(_)) => return Err(StoreError::Backend(err)),
            }
        }
    }
}

fn validate_id(account_id: &str) -> Result<&str, StoreError> {
    let trimmed = account_id.trim();
    if trimmed.is_empty() {
        Err(StoreError::Invalid("empty account id".to_string()))
    } else {
        Ok(trimmed)
    }
}
