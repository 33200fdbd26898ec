use std::path::PathBuf;
use std::time::Duration;

use shadow_sources::QuotaWaitPolicy;

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub database_url: String,
    pub quota_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    pub workers: usize,
    pub completeness_threshold: f64,
    pub cooldown: Duration,
    pub max_quota_wait: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub candidate_limit: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://shadow.db".to_string(),
            quota_dir: PathBuf::from("./state/quota"),
            reports_dir: PathBuf::from("./reports"),
            sources_file: PathBuf::from("sources.yaml"),
            workers: 4,
            completeness_threshold: 1.0,
            cooldown: Duration::from_secs(6 * 60 * 60),
            max_quota_wait: Duration::ZERO,
            scheduler_enabled: false,
            sync_cron: "*/30 * * * *".to_string(),
            user_agent: "shadow-enrich/0.1".to_string(),
            http_timeout_secs: 20,
            candidate_limit: 500,
        }
    }
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            quota_dir: std::env::var("SHADOW_QUOTA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.quota_dir),
            reports_dir: std::env::var("SHADOW_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            sources_file: std::env::var("SHADOW_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            workers: parsed("SHADOW_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.workers),
            completeness_threshold: parsed("SHADOW_COMPLETENESS_THRESHOLD")
                .filter(|t: &f64| (0.0..=1.0).contains(t))
                .unwrap_or(defaults.completeness_threshold),
            cooldown: parsed("SHADOW_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            max_quota_wait: parsed("SHADOW_MAX_QUOTA_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_quota_wait),
            scheduler_enabled: std::env::var("SHADOW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SHADOW_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("SHADOW_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed("SHADOW_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            candidate_limit: parsed("SHADOW_CANDIDATE_LIMIT")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.candidate_limit),
        }
    }

    pub fn quota_wait(&self) -> QuotaWaitPolicy {
        QuotaWaitPolicy::wait_up_to(self.max_quota_wait)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}
