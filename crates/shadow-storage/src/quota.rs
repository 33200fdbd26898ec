//! Sliding-window request budget per source, persisted across restarts.
//!
//! Every source owns one or more windows ("900 per 15 minutes", "15 per
//! minute"). A reservation is granted only when every window has room, and a
//! granted reservation is written to disk before `reserve` returns, so a crash
//! right after a grant can only over-count usage on restart, never under-count.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::files::write_atomic;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota state for {source_id} is corrupt: {reason}")]
    Corrupt { source_id: String, reason: String },
    #[error("persisting quota state for {source_id}")]
    Persist {
        source_id: String,
        #[source]
        error: std::io::Error,
    },
    #[error("creating quota directory {path}")]
    Directory {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// Configured limit: at most `capacity` requests in any trailing `window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub name: String,
    pub capacity: u32,
    pub window_secs: u64,
}

impl QuotaWindow {
    pub fn new(name: impl Into<String>, capacity: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            window_secs: window.as_secs(),
        }
    }

    fn length(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

/// Outcome of a reservation. When not granted, `wait` is how long until the
/// most constrained window frees a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub granted: bool,
    pub wait: Duration,
}

impl Reservation {
    fn granted() -> Self {
        Self {
            granted: true,
            wait: Duration::ZERO,
        }
    }

    fn denied(wait: Duration) -> Self {
        Self {
            granted: false,
            wait,
        }
    }
}

/// Persisted view of one (source, window) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub window: String,
    pub capacity: u32,
    pub window_secs: u64,
    pub window_start: Option<DateTime<Utc>>,
    pub count: u32,
    pub timestamps: Vec<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceQuotaFile {
    source: String,
    windows: Vec<QuotaState>,
}

#[derive(Debug, Clone)]
struct WindowLog {
    limit: QuotaWindow,
    timestamps: VecDeque<DateTime<Utc>>,
}

impl WindowLog {
    fn empty(limit: QuotaWindow) -> Self {
        Self {
            limit,
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.limit.length();
        while self.timestamps.front().is_some_and(|t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Time until a slot frees up, or `None` if a request fits right now.
    fn wait_needed(&self, now: DateTime<Utc>) -> Option<Duration> {
        if (self.timestamps.len() as u64) < u64::from(self.limit.capacity) {
            return None;
        }
        // Zero capacity: nothing ever ages out, report a full window.
        let Some(oldest_blocking) = self
            .timestamps
            .len()
            .checked_sub(self.limit.capacity as usize)
            .and_then(|idx| self.timestamps.get(idx))
        else {
            return Some(Duration::from_secs(self.limit.window_secs));
        };
        let frees_at = *oldest_blocking + self.limit.length();
        Some((frees_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn record(&mut self, now: DateTime<Utc>) {
        let idx = self.timestamps.partition_point(|t| *t <= now);
        self.timestamps.insert(idx, now);
    }

    fn state(&self) -> QuotaState {
        QuotaState {
            window: self.limit.name.clone(),
            capacity: self.limit.capacity,
            window_secs: self.limit.window_secs,
            window_start: self.timestamps.front().copied(),
            count: self.timestamps.len() as u32,
            timestamps: self.timestamps.iter().copied().collect(),
        }
    }
}

#[derive(Debug)]
struct SourceQuota {
    windows: Vec<WindowLog>,
}

pub struct QuotaTracker {
    dir: PathBuf,
    sources: Mutex<HashMap<String, Arc<Mutex<SourceQuota>>>>,
    recovered: Vec<String>,
}

impl QuotaTracker {
    /// Loads persisted state for every configured source. Unreadable state is
    /// logged and replaced by an empty budget rather than failing startup.
    pub async fn open<I>(dir: impl Into<PathBuf>, limits: I) -> Result<Self, QuotaError>
    where
        I: IntoIterator<Item = (String, Vec<QuotaWindow>)>,
    {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|error| QuotaError::Directory {
                path: dir.clone(),
                error,
            })?;

        let now = Utc::now();
        let mut sources = HashMap::new();
        let mut recovered = Vec::new();
        for (source_id, windows) in limits {
            if windows.is_empty() {
                continue;
            }
            let path = state_path(&dir, &source_id);
            let quota = match load_source_state(&path, &source_id, &windows, now).await {
                Ok(quota) => quota,
                Err(err) => {
                    warn!(source = %source_id, path = %path.display(), error = %err, "resetting quota state");
                    recovered.push(source_id.clone());
                    SourceQuota {
                        windows: windows.into_iter().map(WindowLog::empty).collect(),
                    }
                }
            };
            sources.insert(source_id, Arc::new(Mutex::new(quota)));
        }

        Ok(Self {
            dir,
            sources: Mutex::new(sources),
            recovered,
        })
    }

    /// Sources whose persisted state had to be reset during `open`.
    pub fn recovered(&self) -> &[String] {
        &self.recovered
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn reserve(&self, source_id: &str) -> Result<Reservation, QuotaError> {
        self.reserve_at(source_id, Utc::now()).await
    }

    pub async fn reserve_at(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation, QuotaError> {
        let Some(quota) = self.source(source_id).await else {
            debug!(source = source_id, "no quota configured; request allowed");
            return Ok(Reservation::granted());
        };
        let mut quota = quota.lock().await;

        for window in &mut quota.windows {
            window.prune(now);
        }
        let wait = quota
            .windows
            .iter()
            .filter_map(|w| w.wait_needed(now))
            .max();
        if let Some(wait) = wait {
            debug!(source = source_id, wait_ms = wait.as_millis() as u64, "quota exhausted");
            return Ok(Reservation::denied(wait));
        }

        let previous = quota.windows.clone();
        for window in &mut quota.windows {
            window.record(now);
        }
        if let Err(error) = self.persist(source_id, &quota).await {
            // Not granted, so the in-memory log must not count it either.
            quota.windows = previous;
            return Err(QuotaError::Persist {
                source_id: source_id.to_string(),
                error,
            });
        }
        Ok(Reservation::granted())
    }

    pub async fn snapshot(&self, source_id: &str) -> Vec<QuotaState> {
        let Some(quota) = self.source(source_id).await else {
            return Vec::new();
        };
        let mut quota = quota.lock().await;
        let now = Utc::now();
        quota
            .windows
            .iter_mut()
            .map(|w| {
                w.prune(now);
                w.state()
            })
            .collect()
    }

    pub async fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn source(&self, source_id: &str) -> Option<Arc<Mutex<SourceQuota>>> {
        self.sources.lock().await.get(source_id).cloned()
    }

    async fn persist(&self, source_id: &str, quota: &SourceQuota) -> std::io::Result<()> {
        let file = SourceQuotaFile {
            source: source_id.to_string(),
            windows: quota.windows.iter().map(WindowLog::state).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(std::io::Error::other)?;
        write_atomic(&state_path(&self.dir, source_id), &bytes).await
    }
}

/// One file per source. Lowercase letters, digits and `-` pass through; every
/// other byte becomes `_xx`, so distinct names never share a file, even on a
/// case-insensitive filesystem.
fn state_path(dir: &Path, source_id: &str) -> PathBuf {
    let mut safe = String::with_capacity(source_id.len());
    for byte in source_id.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' {
            safe.push(char::from(byte));
        } else {
            safe.push_str(&format!("_{byte:02x}"));
        }
    }
    dir.join(format!("{safe}.json"))
}

async fn load_source_state(
    path: &Path,
    source_id: &str,
    limits: &[QuotaWindow],
    now: DateTime<Utc>,
) -> Result<SourceQuota, QuotaError> {
    let corrupt = |reason: String| QuotaError::Corrupt {
        source_id: source_id.to_string(),
        reason,
    };

    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SourceQuota {
                windows: limits.iter().cloned().map(WindowLog::empty).collect(),
            });
        }
        Err(err) => return Err(corrupt(err.to_string())),
    };

    let file: SourceQuotaFile =
        serde_json::from_slice(&bytes).map_err(|err| corrupt(err.to_string()))?;
    if file.source != source_id {
        return Err(corrupt(format!("file belongs to source {}", file.source)));
    }

    // Configured limits win; persisted timestamps carry over by window name.
    let windows = limits
        .iter()
        .cloned()
        .map(|limit| {
            let mut log = WindowLog::empty(limit);
            if let Some(saved) = file.windows.iter().find(|w| w.window == log.limit.name) {
                let mut timestamps = saved.timestamps.clone();
                timestamps.sort();
                log.timestamps = timestamps.into();
            }
            log.prune(now);
            log
        })
        .collect();
    Ok(SourceQuota { windows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn per_minute(capacity: u32) -> Vec<(String, Vec<QuotaWindow>)> {
        vec![(
            "api".to_string(),
            vec![QuotaWindow::new("per_minute", capacity, Duration::from_secs(60))],
        )]
    }

    #[tokio::test]
    async fn third_request_waits_for_the_first_to_age_out() {
        let dir = tempdir().expect("tempdir");
        let tracker = QuotaTracker::open(dir.path(), per_minute(2)).await.unwrap();

        assert!(tracker.reserve_at("api", t0()).await.unwrap().granted);
        let second = t0() + chrono::Duration::seconds(5);
        assert!(tracker.reserve_at("api", second).await.unwrap().granted);

        let third = tracker
            .reserve_at("api", t0() + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(!third.granted);
        assert_eq!(third.wait, Duration::from_secs(50));

        let later = tracker
            .reserve_at("api", t0() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(later.granted);
    }

    #[tokio::test]
    async fn budget_survives_a_restart() {
        let dir = tempdir().expect("tempdir");
        // Loading prunes against the real clock, so stay near it.
        let recent = Utc::now();
        {
            let tracker = QuotaTracker::open(dir.path(), per_minute(2)).await.unwrap();
            assert!(tracker.reserve_at("api", recent).await.unwrap().granted);
            assert!(tracker.reserve_at("api", recent).await.unwrap().granted);
        }

        let tracker = QuotaTracker::open(dir.path(), per_minute(2)).await.unwrap();
        let denied = tracker
            .reserve_at("api", recent + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(!denied.granted);
        assert!(denied.wait <= Duration::from_secs(59));
        assert!(tracker.recovered().is_empty());
    }

    #[tokio::test]
    async fn never_grants_more_than_capacity_in_any_window() {
        let dir = tempdir().expect("tempdir");
        let tracker = QuotaTracker::open(dir.path(), per_minute(3)).await.unwrap();

        let mut granted = Vec::new();
        for step in 0..240 {
            let now = t0() + chrono::Duration::seconds(step);
            if tracker.reserve_at("api", now).await.unwrap().granted {
                granted.push(now);
            }
        }
        for (i, start) in granted.iter().enumerate() {
            let in_window = granted[i..]
                .iter()
                .take_while(|t| **t < *start + chrono::Duration::seconds(60))
                .count();
            assert!(in_window <= 3, "window starting {start} admitted {in_window}");
        }
        assert_eq!(granted.len(), 12);
    }

    #[tokio::test]
    async fn every_window_must_have_room() {
        let dir = tempdir().expect("tempdir");
        let limits = vec![(
            "api".to_string(),
            vec![
                QuotaWindow::new("burst", 1, Duration::from_secs(10)),
                QuotaWindow::new("hourly", 2, Duration::from_secs(3600)),
            ],
        )];
        let tracker = QuotaTracker::open(dir.path(), limits).await.unwrap();

        assert!(tracker.reserve_at("api", t0()).await.unwrap().granted);
        let burst = tracker
            .reserve_at("api", t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(burst.wait, Duration::from_secs(9));

        assert!(tracker
            .reserve_at("api", t0() + chrono::Duration::seconds(10))
            .await
            .unwrap()
            .granted);
        let hourly = tracker
            .reserve_at("api", t0() + chrono::Duration::seconds(20))
            .await
            .unwrap();
        assert!(!hourly.granted);
        assert_eq!(hourly.wait, Duration::from_secs(3580));
    }

    #[tokio::test]
    async fn corrupt_state_resets_to_an_empty_budget() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("api.json"), b"{\"source\": \"api\", \"wind").unwrap();

        let tracker = QuotaTracker::open(dir.path(), per_minute(1)).await.unwrap();
        assert_eq!(tracker.recovered(), ["api".to_string()]);
        assert!(tracker.reserve_at("api", t0()).await.unwrap().granted);

        // The next grant rewrote a valid file.
        let reopened = QuotaTracker::open(dir.path(), per_minute(1)).await.unwrap();
        assert!(reopened.recovered().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_sources_are_unlimited() {
        let dir = tempdir().expect("tempdir");
        let tracker = QuotaTracker::open(dir.path(), per_minute(1)).await.unwrap();
        for _ in 0..5 {
            assert!(tracker.reserve_at("fixtures", t0()).await.unwrap().granted);
        }
        assert!(tracker.snapshot("fixtures").await.is_empty());
    }

    #[test]
    fn similar_source_names_get_separate_files() {
        let dir = Path::new("/q");
        let names = ["api.v1", "api_v1", "API_v1", "api-v1", "api v1"];
        let paths: std::collections::HashSet<PathBuf> =
            names.iter().map(|n| state_path(dir, n)).collect();
        assert_eq!(paths.len(), names.len());
        assert_eq!(state_path(dir, "archive"), dir.join("archive.json"));
    }

    #[tokio::test]
    async fn sources_with_similar_names_keep_their_own_budget_across_restarts() {
        let dir = tempdir().expect("tempdir");
        let limits = || {
            ["api.v1", "api_v1"]
                .into_iter()
                .map(|name| {
                    (
                        name.to_string(),
                        vec![QuotaWindow::new("per_minute", 1, Duration::from_secs(60))],
                    )
                })
                .collect::<Vec<_>>()
        };
        let recent = Utc::now();
        {
            let tracker = QuotaTracker::open(dir.path(), limits()).await.unwrap();
            assert!(tracker.reserve_at("api.v1", recent).await.unwrap().granted);
            assert!(tracker.reserve_at("api_v1", recent).await.unwrap().granted);
        }

        let tracker = QuotaTracker::open(dir.path(), limits()).await.unwrap();
        assert!(tracker.recovered().is_empty());
        let later = recent + chrono::Duration::seconds(1);
        assert!(!tracker.reserve_at("api.v1", later).await.unwrap().granted);
        assert!(!tracker.reserve_at("api_v1", later).await.unwrap().granted);
    }

    #[tokio::test]
    async fn failed_persist_is_an_error_and_not_counted() {
        let dir = tempdir().expect("tempdir");
        let quota_dir = dir.path().join("quota");
        let tracker = QuotaTracker::open(&quota_dir, per_minute(1)).await.unwrap();

        // A plain file where the directory was makes every write fail.
        std::fs::remove_dir_all(&quota_dir).unwrap();
        std::fs::write(&quota_dir, b"not a directory").unwrap();
        let err = tracker.reserve_at("api", t0()).await.unwrap_err();
        assert!(matches!(err, QuotaError::Persist { .. }));

        std::fs::remove_file(&quota_dir).unwrap();
        assert!(tracker.reserve_at("api", t0()).await.unwrap().granted);
        assert!(!tracker.reserve_at("api", t0()).await.unwrap().granted);
    }

    #[tokio::test]
    async fn reopening_with_a_smaller_capacity_applies_it_to_saved_usage() {
        let dir = tempdir().expect("tempdir");
        let recent = Utc::now();
        {
            let tracker = QuotaTracker::open(dir.path(), per_minute(3)).await.unwrap();
            assert!(tracker.reserve_at("api", recent).await.unwrap().granted);
            let second = recent + chrono::Duration::seconds(2);
            assert!(tracker.reserve_at("api", second).await.unwrap().granted);
        }

        let tracker = QuotaTracker::open(dir.path(), per_minute(2)).await.unwrap();
        let states = tracker.snapshot("api").await;
        assert_eq!(states[0].capacity, 2);
        assert_eq!(states[0].count, 2);

        let denied = tracker
            .reserve_at("api", recent + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(!denied.granted);
        assert_eq!(denied.wait, Duration::from_secs(50));
    }

    #[tokio::test]
    async fn snapshot_reports_window_start_and_count() {
        let dir = tempdir().expect("tempdir");
        let tracker = QuotaTracker::open(dir.path(), per_minute(5)).await.unwrap();
        let now = Utc::now();
        tracker.reserve_at("api", now).await.unwrap();
        tracker
            .reserve_at("api", now + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let states = tracker.snapshot("api").await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].count, 2);
        assert_eq!(states[0].window_start, Some(now));
        assert_eq!(states[0].capacity, 5);
    }
}
