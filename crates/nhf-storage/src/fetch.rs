use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use nhf_core::{is_valid_url, FetchedPage};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    InvalidUrl,
    BadStatus,
    ConnectionError,
    RequestError,
    Unknown,
}

impl fmt::Display for FetchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidUrl => "InvalidUrl",
            Self::BadStatus => "BadStatus",
            Self::ConnectionError => "ConnectionError",
            Self::RequestError => "RequestError",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A fetch that did not produce content. The kind leads the display text so log lines start with it.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub url: String,
    pub status: Option<u16>,
    pub detail: String,
}

impl FetchFailure {
    fn new(kind: FetchFailureKind, url: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.to_string(),
            status: None,
            detail: detail.into(),
        }
    }

    fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        Self::new(classify_reqwest_error(err), url, err.to_string())
    }
}

/// Timeouts and refused connections are `ConnectionError`; other transport faults (redirect
/// loops, bad bodies, undecodable text, malformed requests) are `RequestError`. Status errors
/// from `error_for_status` and connection-upgrade errors have no other kind and land in `Unknown`.
pub fn classify_reqwest_error(err: &reqwest::Error) -> FetchFailureKind {
    if err.is_timeout() || err.is_connect() {
        FetchFailureKind::ConnectionError
    } else if err.is_request()
        || err.is_body()
        || err.is_decode()
        || err.is_redirect()
        || err.is_builder()
    {
        FetchFailureKind::RequestError
    } else {
        FetchFailureKind::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

/// Retrieves the raw listing page of a source. Failures come back as values, never panics.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
        if !is_valid_url(url) {
            return Err(FetchFailure::new(
                FetchFailureKind::InvalidUrl,
                url,
                format!("refusing to fetch {url:?}"),
            ));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchFailure::from_reqwest(url, &err))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchFailure {
                status: Some(status.as_u16()),
                ..FetchFailure::new(
                    FetchFailureKind::BadStatus,
                    url,
                    format!("failed to retrieve content of {url}, status code {}", status.as_u16()),
                )
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|err| FetchFailure::from_reqwest(url, &err))?;

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
        let span = info_span!("http_fetch", url);
        let result = self.fetch_page(url).instrument(span).await;
        match &result {
            Ok(page) => info!(bytes = page.body.len(), "Successfully retrieved content of {url}."),
            Err(failure) => error!(url, "{failure}"),
        }
        result
    }
}
