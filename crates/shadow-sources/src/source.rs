use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use shadow_core::{PartialProfile, ProfileField};
use thiserror::Error;
use tokio::fs;

/// Failure reported by a source for a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceFailure {
    #[error("rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    Other(String),
}

/// Anything that can produce a partial profile for an account id. `Ok(None)`
/// means the source has nothing for this account.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fields this source is able to fill in.
    fn provides(&self) -> &[ProfileField] {
        &ProfileField::ALL
    }

    async fn fetch_partial(&self, account_id: &str) -> Result<Option<PartialProfile>, SourceFailure>;
}

/// Serves `<root>/<account_id>.json` files; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureProfileSource {
    name: String,
    root: PathBuf,
    provides: Vec<ProfileField>,
}

impl FixtureProfileSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            provides: ProfileField::ALL.to_vec(),
        }
    }

    pub fn with_provides(mut self, provides: Vec<ProfileField>) -> Self {
        if !provides.is_empty() {
            self.provides = provides;
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ProfileSource for FixtureProfileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[ProfileField] {
        &self.provides
    }

    async fn fetch_partial(&self, account_id: &str) -> Result<Option<PartialProfile>, SourceFailure> {
        if account_id.is_empty() || account_id.contains(['/', '\\']) || account_id.starts_with('.') {
            return Err(SourceFailure::Other(format!("invalid account id {account_id:?}")));
        }
        let path = self.root.join(format!("{account_id}.json"));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SourceFailure::Network(format!("reading {}: {err}", path.display()))),
        };
        let partial: PartialProfile = serde_json::from_slice(&bytes)
            .map_err(|err| SourceFailure::Malformed(format!("parsing {}: {err}", path.display())))?;
        Ok(Some(partial))
    }
}
