//! `sources.yaml`: which sources exist, in what priority order, and with
//! what quota.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shadow_core::ProfileField;
use shadow_storage::QuotaWindow;
use tracing::{debug, warn};

use crate::http::{HttpProfileSource, HttpSourceSettings};
use crate::source::{FixtureProfileSource, ProfileSource};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Empty means every field.
    #[serde(default)]
    pub provides: Vec<ProfileField>,
    #[serde(default)]
    pub quota: Vec<QuotaWindow>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Http {
        base_url: String,
        /// Name of the environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
    Fixture { root: PathBuf },
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("source with empty name");
            }
            if !seen.insert(source.name.as_str()) {
                bail!("duplicate source name {}", source.name);
            }
            for window in &source.quota {
                if window.capacity == 0 || window.window_secs == 0 {
                    bail!(
                        "source {} window {} must have non-zero capacity and length",
                        source.name,
                        window.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Enabled sources in priority (file) order.
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Quota windows per source, in the shape `QuotaTracker::open` takes.
    /// Disabled sources are included so their persisted budgets still load.
    pub fn quota_limits(&self) -> Vec<(String, Vec<QuotaWindow>)> {
        self.sources
            .iter()
            .map(|s| (s.name.clone(), s.quota.clone()))
            .collect()
    }

    /// Resolves relative fixture roots against `base_dir` (normally the
    /// directory holding `sources.yaml`).
    pub fn build_sources(
        &self,
        base_dir: &Path,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn ProfileSource>>> {
        let mut built: Vec<Arc<dyn ProfileSource>> = Vec::new();
        for config in self.enabled() {
            let provides = if config.provides.is_empty() {
                ProfileField::ALL.to_vec()
            } else {
                config.provides.clone()
            };
            match &config.kind {
                SourceKind::Fixture { root } => {
                    let root = if root.is_absolute() {
                        root.clone()
                    } else {
                        base_dir.join(root)
                    };
                    if !root.is_dir() {
                        warn!(source = %config.name, root = %root.display(), "fixture root does not exist");
                    }
                    built.push(Arc::new(
                        FixtureProfileSource::new(config.name.clone(), root).with_provides(provides),
                    ));
                }
                SourceKind::Http { base_url, token_env } => {
                    let bearer_token = match token_env {
                        Some(var) => match std::env::var(var) {
                            Ok(token) if !token.trim().is_empty() => Some(token),
                            _ => {
                                warn!(source = %config.name, env = %var, "token variable unset; requesting without auth");
                                None
                            }
                        },
                        None => None,
                    };
                    let settings = HttpSourceSettings {
                        name: config.name.clone(),
                        base_url: base_url.clone(),
                        bearer_token,
                        user_agent: Some(user_agent.to_string()),
                        timeout,
                        provides,
                    };
                    let source = HttpProfileSource::new(settings)
                        .with_context(|| format!("building http source {}", config.name))?;
                    built.push(Arc::new(source));
                }
            }
            debug!(source = %config.name, "source ready");
        }
        Ok(built)
    }
}
