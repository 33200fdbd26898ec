//! JSON-over-HTTP profile source.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use shadow_core::{PartialProfile, ProfileField};
use tracing::debug;

use crate::source::{ProfileSource, SourceFailure};

#[derive(Debug, Clone)]
pub struct HttpSourceSettings {
    pub name: String,
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub provides: Vec<ProfileField>,
}

impl HttpSourceSettings {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            bearer_token: None,
            user_agent: None,
            timeout: Duration::from_secs(20),
            provides: ProfileField::ALL.to_vec(),
        }
    }
}

/// GETs `<base_url>/<account_id>` and decodes the body as a partial profile.
#[derive(Debug)]
pub struct HttpProfileSource {
    settings: HttpSourceSettings,
    base_url: Url,
    client: reqwest::Client,
}

impl HttpProfileSource {
    pub fn new(settings: HttpSourceSettings) -> anyhow::Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("parsing base url for source {}", settings.name))?;
        if base_url.cannot_be_a_base() {
            bail!("base url {} for source {} cannot take a path", base_url, settings.name);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout);

        if let Some(user_agent) = &settings.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            settings,
            base_url,
            client,
        })
    }

    /// The account id becomes one percent-encoded path segment.
    fn url_for(&self, account_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(account_id);
        }
        url
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn provides(&self) -> &[ProfileField] {
        &self.settings.provides
    }

    async fn fetch_partial(&self, account_id: &str) -> Result<Option<PartialProfile>, SourceFailure> {
        let url = self.url_for(account_id);
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.settings.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(classify_reqwest_error)?;
        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "source response");

        classify_response(status, retry_after.as_deref(), &body)
    }
}

pub fn classify_reqwest_error(err: reqwest::Error) -> SourceFailure {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        SourceFailure::Network(err.to_string())
    } else if err.is_decode() {
        SourceFailure::Malformed(err.to_string())
    } else {
        SourceFailure::Other(err.to_string())
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub fn classify_response(
    status: StatusCode,
    retry_after: Option<&str>,
    body: &[u8],
) -> Result<Option<PartialProfile>, SourceFailure> {
    if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceFailure::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SourceFailure::Auth(format!("http status {}", status.as_u16())));
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(SourceFailure::Network(format!("http status {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(SourceFailure::Other(format!("http status {}", status.as_u16())));
    }

    let partial: PartialProfile = serde_json::from_slice(body)
        .map_err(|err| SourceFailure::Malformed(err.to_string()))?;
    Ok(Some(partial))
}
