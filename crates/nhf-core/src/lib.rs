//! Core domain model and URL validation for NHF.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::{Host, Url};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nhf-core";

/// Transient (header, url) pair produced by a source extractor; not yet validated or stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub header: String,
    pub url: String,
}

impl Candidate {
    pub fn new(header: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            url: url.into(),
        }
    }

    /// True when the candidate may be persisted: non-blank header and a valid absolute http(s) url.
    pub fn is_storable(&self) -> bool {
        !self.header.trim().is_empty() && !self.url.is_empty() && is_valid_url(&self.url)
    }
}

/// Persisted article. `url` is the deduplication key; `id` is the opaque storage identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub header: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

impl Article {
    pub fn view(&self) -> ArticleView {
        ArticleView {
            text: self.header.clone(),
            url: self.url.clone(),
        }
    }
}

/// Display projection returned by search: header and url only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleView {
    pub text: String,
    pub url: String,
}

/// Raw listing content fetched for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Final url after redirects; relative links on the page resolve against it.
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Is `candidate` a well-formed absolute http(s) url with a syntactically valid host?
///
/// Domain hosts need at least two labels and an alphabetic (or punycode) top-level label,
/// so `https://example.com` and `https://www.example.com` pass while `https://localhost`
/// and `https://invalid_url` do not. IP literal hosts are accepted.
pub fn is_valid_url(candidate: &str) -> bool {
    if candidate.is_empty()
        || candidate
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
    {
        return false;
    }
    let Ok(parsed) = Url::parse(candidate) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    // The url crate accepts `http:example.com`; require the authority form.
    let has_authority = candidate
        .get(parsed.scheme().len()..)
        .is_some_and(|rest| rest.starts_with("://"));
    if !has_authority {
        return false;
    }
    match parsed.host() {
        Some(Host::Domain(domain)) => is_valid_domain(domain),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => true,
        None => false,
    }
}

/// Same as [`is_valid_url`], with an absent value treated as invalid.
pub fn is_valid_optional_url(candidate: Option<&str>) -> bool {
    candidate.is_some_and(is_valid_url)
}

fn is_valid_domain(domain: &str) -> bool {
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.len() > 253 {
        return false;
    }
    let labels = domain.split('.').collect::<Vec<_>>();
    if labels.len() < 2 {
        return false;
    }
    let Some(tld) = labels.last() else {
        return false;
    };
    let tld_ok = tld.len() >= 2
        && (tld.chars().all(|c| c.is_ascii_alphabetic()) || tld.starts_with("xn--"));
    tld_ok && labels.iter().all(|label| is_valid_label(label))
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
