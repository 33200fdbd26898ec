//! Quota-guarded access to profile sources.
//!
//! Every request attempt first asks the [`QuotaTracker`] for a slot, so
//! retries are charged like first attempts. Remote rate-limit signals open a
//! per-source backoff window that short-circuits later calls without spending
//! quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shadow_core::PartialProfile;
use shadow_storage::{BackoffPolicy, QuotaError, QuotaTracker, RetryLedger};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::source::{ProfileSource, SourceFailure};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    /// Applied to network-level failures.
    pub retry: BackoffPolicy,
    /// Grows the backoff window on consecutive remote rate limits.
    pub rate_limit_backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            retry: BackoffPolicy::default(),
            rate_limit_backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(900),
            },
        }
    }
}

/// How long a single fetch may spend waiting for local quota, in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWaitPolicy {
    pub max_wait: Duration,
}

impl QuotaWaitPolicy {
    pub fn fail_fast() -> Self {
        Self {
            max_wait: Duration::ZERO,
        }
    }

    pub fn wait_up_to(max_wait: Duration) -> Self {
        Self { max_wait }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitOrigin {
    /// Our own persisted budget is exhausted.
    Local,
    /// The source told us to slow down.
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(PartialProfile),
    Empty,
    RateLimited {
        origin: RateLimitOrigin,
        retry_after: Duration,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{source_name}: network failure after {attempts} attempts: {message}")]
    Network {
        source_name: String,
        attempts: usize,
        message: String,
    },
    #[error("{source_name}: malformed response: {message}")]
    Malformed { source_name: String, message: String },
    #[error("{source_name}: authentication failed: {message}")]
    Auth { source_name: String, message: String },
    #[error("{source_name}: {message}")]
    Other { source_name: String, message: String },
    #[error("{source_name}: quota bookkeeping failed")]
    Quota {
        source_name: String,
        #[source]
        error: QuotaError,
    },
}

impl SourceError {
    pub fn source_name(&self) -> &str {
        match self {
            Self::Network { source_name, .. }
            | Self::Malformed { source_name, .. }
            | Self::Auth { source_name, .. }
            | Self::Other { source_name, .. }
            | Self::Quota { source_name, .. } => source_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Malformed { .. } => "malformed",
            Self::Auth { .. } => "auth",
            Self::Other { .. } => "other",
            Self::Quota { .. } => "quota",
        }
    }
}

#[derive(Debug, Default)]
struct RemoteBackoff {
    consecutive: usize,
    until: Option<Instant>,
}

pub struct SourceClient {
    quota: Arc<QuotaTracker>,
    config: ClientConfig,
    remote: Mutex<HashMap<String, RemoteBackoff>>,
}

impl SourceClient {
    pub fn new(quota: Arc<QuotaTracker>, config: ClientConfig) -> Self {
        Self {
            quota,
            config,
            remote: Mutex::new(HashMap::new()),
        }
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn fetch(
        &self,
        account_id: &str,
        source: &dyn ProfileSource,
        policy: QuotaWaitPolicy,
    ) -> Result<FetchOutcome, SourceError> {
        let span = info_span!("source_fetch", account_id, source = source.name());
        self.fetch_inner(account_id, source, policy)
            .instrument(span)
            .await
    }

    async fn fetch_inner(
        &self,
        account_id: &str,
        source: &dyn ProfileSource,
        policy: QuotaWaitPolicy,
    ) -> Result<FetchOutcome, SourceError> {
        let name = source.name();
        let mut waited = Duration::ZERO;
        let mut ledger = RetryLedger::new(self.config.retry);

        loop {
            if let Some(remaining) = self.backoff_remaining(name).await {
                debug!(remaining_ms = remaining.as_millis() as u64, "source backing off");
                return Ok(FetchOutcome::RateLimited {
                    origin: RateLimitOrigin::Remote,
                    retry_after: remaining,
                });
            }

            loop {
                let reservation =
                    self.quota
                        .reserve(name)
                        .await
                        .map_err(|error| SourceError::Quota {
                            source_name: name.to_string(),
                            error,
                        })?;
                if reservation.granted {
                    break;
                }
                let wait = reservation.wait.max(Duration::from_millis(1));
                if waited + wait > policy.max_wait {
                    debug!(wait_ms = wait.as_millis() as u64, "local quota exhausted");
                    return Ok(FetchOutcome::RateLimited {
                        origin: RateLimitOrigin::Local,
                        retry_after: wait,
                    });
                }
                waited += wait;
                debug!(wait_ms = wait.as_millis() as u64, "waiting for local quota");
                sleep(wait).await;
            }

            let result = match timeout(self.config.request_timeout, source.fetch_partial(account_id)).await {
                Ok(result) => result,
                Err(_) => Err(SourceFailure::Network(format!(
                    "request timed out after {}ms",
                    self.config.request_timeout.as_millis()
                ))),
            };

            match result {
                Ok(Some(partial)) => {
                    self.clear_backoff(name).await;
                    let partial = normalize_partial(partial);
                    if partial.is_empty() {
                        debug!("source returned no usable fields");
                        return Ok(FetchOutcome::Empty);
                    }
                    debug!(fields = partial.fields.known_fields().len(), edges = partial.edges.len(), "fetched");
                    return Ok(FetchOutcome::Fetched(partial));
                }
                Ok(None) => {
                    self.clear_backoff(name).await;
                    return Ok(FetchOutcome::Empty);
                }
                Err(SourceFailure::RateLimited { retry_after }) => {
                    let wait = self.open_backoff(name, retry_after).await;
                    warn!(wait_ms = wait.as_millis() as u64, "source rate limited");
                    return Ok(FetchOutcome::RateLimited {
                        origin: RateLimitOrigin::Remote,
                        retry_after: wait,
                    });
                }
                Err(SourceFailure::Network(message)) => match ledger.record_failure() {
                    Some(delay) => {
                        warn!(attempt = ledger.failures(), delay_ms = delay.as_millis() as u64, error = %message, "retrying source request");
                        sleep(delay).await;
                    }
                    None => {
                        return Err(SourceError::Network {
                            source_name: name.to_string(),
                            attempts: ledger.failures(),
                            message,
                        });
                    }
                },
                Err(SourceFailure::Malformed(message)) => {
                    return Err(SourceError::Malformed {
                        source_name: name.to_string(),
                        message,
                    });
                }
                Err(SourceFailure::Auth(message)) => {
                    return Err(SourceError::Auth {
                        source_name: name.to_string(),
                        message,
                    });
                }
                Err(SourceFailure::Other(message)) => {
                    return Err(SourceError::Other {
                        source_name: name.to_string(),
                        message,
                    });
                }
            }
        }
    }

    /// Time left in the source's remote backoff window, if one is open.
    pub async fn backoff_remaining(&self, source_name: &str) -> Option<Duration> {
        let remote = self.remote.lock().await;
        let until = remote.get(source_name)?.until?;
        let remaining = until.checked_duration_since(Instant::now())?;
        (!remaining.is_zero()).then_some(remaining)
    }

    async fn open_backoff(&self, source_name: &str, retry_after: Option<Duration>) -> Duration {
        let mut remote = self.remote.lock().await;
        let entry = remote.entry(source_name.to_string()).or_default();
        entry.consecutive += 1;
        let escalated = self
            .config
            .rate_limit_backoff
            .delay_for_attempt(entry.consecutive - 1);
        let wait = retry_after.unwrap_or_default().max(escalated);
        entry.until = Some(Instant::now() + wait);
        wait
    }

    async fn clear_backoff(&self, source_name: &str) {
        self.remote.lock().await.remove(source_name);
    }
}

fn normalize_partial(partial: PartialProfile) -> PartialProfile {
    PartialProfile {
        fields: partial.fields.normalized(),
        edges: partial
            .edges
            .into_iter()
            .filter(|edge| !edge.target_account_id.trim().is_empty())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use shadow_core::ProfileFields;
    use shadow_storage::QuotaWindow;
    use tempfile::tempdir;

    type Scripted = Result<Option<PartialProfile>, SourceFailure>;

    struct ScriptedSource {
        name: String,
        script: std::sync::Mutex<VecDeque<Scripted>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(name: &str, script: Vec<Scripted>) -> Self {
            Self {
                name: name.to_string(),
                script: std::sync::Mutex::new(script.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
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

        async fn fetch_partial(&self, _account_id: &str) -> Result<Option<PartialProfile>, SourceFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    fn located(location: &str) -> Scripted {
        Ok(Some(PartialProfile::from_fields(ProfileFields {
            location: Some(location.to_string()),
            ..ProfileFields::default()
        })))
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_secs(5),
            retry: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..ClientConfig::default()
        }
    }

    async fn client_with(dir: &std::path::Path, limits: Vec<(String, Vec<QuotaWindow>)>) -> SourceClient {
        let quota = QuotaTracker::open(dir, limits).await.expect("quota");
        SourceClient::new(Arc::new(quota), fast_config())
    }

    #[tokio::test]
    async fn network_failures_are_retried_and_charged_to_quota() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(
            dir.path(),
            vec![("api".into(), vec![QuotaWindow::new("minute", 10, Duration::from_secs(60))])],
        )
        .await;
        let source = ScriptedSource::new(
            "api",
            vec![
                Err(SourceFailure::Network("reset".into())),
                Err(SourceFailure::Network("reset".into())),
                located("NYC"),
            ],
        );

        let outcome = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("fetch");
        assert!(matches!(outcome, FetchOutcome::Fetched(ref p) if p.fields.location.as_deref() == Some("NYC")));
        assert_eq!(source.calls(), 3);
        assert_eq!(client.quota().snapshot("api").await[0].count, 3);
    }

    #[tokio::test]
    async fn network_failures_surface_after_retry_ceiling() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(dir.path(), Vec::new()).await;
        let source = ScriptedSource::new(
            "api",
            (0..5).map(|_| Err(SourceFailure::Network("down".into()))).collect(),
        );

        let err = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Network { attempts: 3, .. }));
        assert_eq!(err.source_name(), "api");
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn remote_rate_limit_opens_a_backoff_window() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(dir.path(), Vec::new()).await;
        let source = ScriptedSource::new(
            "api",
            vec![
                Err(SourceFailure::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                }),
                located("NYC"),
            ],
        );

        let first = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("fetch");
        assert!(matches!(
            first,
            FetchOutcome::RateLimited { origin: RateLimitOrigin::Remote, retry_after } if retry_after >= Duration::from_secs(60)
        ));

        let second = client
            .fetch("43", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("fetch");
        assert!(matches!(
            second,
            FetchOutcome::RateLimited {
                origin: RateLimitOrigin::Remote,
                ..
            }
        ));
        assert_eq!(source.calls(), 1);
        assert!(client.backoff_remaining("api").await.is_some());
    }

    #[tokio::test]
    async fn local_quota_exhaustion_fails_fast_without_calling_the_source() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(
            dir.path(),
            vec![("api".into(), vec![QuotaWindow::new("minute", 1, Duration::from_secs(60))])],
        )
        .await;
        let source = ScriptedSource::new("api", vec![located("NYC"), located("LA")]);

        client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("first");
        let second = client
            .fetch("43", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("second");
        match second {
            FetchOutcome::RateLimited { origin, retry_after } => {
                assert_eq!(origin, RateLimitOrigin::Local);
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("expected local rate limit, got {other:?}"),
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn short_quota_waits_are_absorbed() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(
            dir.path(),
            vec![("api".into(), vec![QuotaWindow::new("second", 1, Duration::from_secs(1))])],
        )
        .await;
        let source = ScriptedSource::new("api", vec![located("NYC"), located("LA")]);

        client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("first");
        let second = client
            .fetch("43", &source, QuotaWaitPolicy::wait_up_to(Duration::from_secs(5)))
            .await
            .expect("second");
        assert!(matches!(second, FetchOutcome::Fetched(_)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(dir.path(), Vec::new()).await;
        let source = ScriptedSource::new("api", vec![Err(SourceFailure::Malformed("<html>".into()))]);

        let err = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn slow_requests_time_out_as_network_failures() {
        let dir = tempdir().expect("tempdir");
        let quota = QuotaTracker::open(dir.path(), Vec::<(String, Vec<QuotaWindow>)>::new())
            .await
            .expect("quota");
        let client = SourceClient::new(
            Arc::new(quota),
            ClientConfig {
                request_timeout: Duration::from_millis(20),
                retry: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                ..ClientConfig::default()
            },
        );
        let mut source = ScriptedSource::new("slow", vec![located("NYC")]);
        source.delay = Duration::from_millis(500);

        let err = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Network { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn blank_payloads_are_reported_as_empty() {
        let dir = tempdir().expect("tempdir");
        let client = client_with(dir.path(), Vec::new()).await;
        let source = ScriptedSource::new("api", vec![located("   ")]);

        let outcome = client
            .fetch("42", &source, QuotaWaitPolicy::fail_fast())
            .await
            .expect("fetch");
        assert_eq!(outcome, FetchOutcome::Empty);
    }
}
