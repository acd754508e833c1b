//! Source extractor contract + per-site listing extractors.

use nhf_core::{is_valid_url, Candidate, FetchedPage};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::info;
use url::Url;

pub const CRATE_NAME: &str = "nhf-adapters";

pub const SOURCE_IDS: [&str; 3] = ["idnes", "ihned", "bbc"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("listing page {url} has an empty body")]
    EmptyListing { url: String },
}

/// One external news site: where its listing lives and how to read candidates out of it.
///
/// Implementations never touch the network; the coordinator hands them an already fetched page.
pub trait SourceExtractor: Send + Sync {
    fn source_id(&self) -> &str;
    fn listing_url(&self) -> &str;
    fn extract_candidates(&self, page: &FetchedPage) -> Result<Vec<Candidate>, ExtractError>;
}

/// Where the header text and link of a listing entry live in the markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingLayout {
    /// Each matched anchor is an entry; its text is the header.
    TitledAnchor { anchor: &'static str },
    /// Each matched heading is an entry; its first matching link carries the url.
    HeadingWithLink {
        heading: &'static str,
        link: &'static str,
    },
    /// Each matched anchor is an entry; a nested heading carries the header.
    AnchorWithHeading {
        anchor: &'static str,
        heading: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteExtractor {
    source_id: &'static str,
    listing_url: String,
    layout: ListingLayout,
}

impl SiteExtractor {
    pub fn new(source_id: &'static str, listing_url: impl Into<String>, layout: ListingLayout) -> Self {
        Self {
            source_id,
            listing_url: listing_url.into(),
            layout,
        }
    }

    pub fn with_listing_url(mut self, listing_url: impl Into<String>) -> Self {
        self.listing_url = listing_url.into();
        self
    }

    pub fn layout(&self) -> ListingLayout {
        self.layout
    }

    fn entries(&self, document: &Html) -> Result<Vec<(String, Option<String>)>, ExtractError> {
        let entries = match self.layout {
            ListingLayout::TitledAnchor { anchor } => {
                let anchor = parse_selector(anchor)?;
                document
                    .select(&anchor)
                    .map(|a| (element_text(a), attr(a, "href")))
                    .collect()
            }
            ListingLayout::HeadingWithLink { heading, link } => {
                let heading = parse_selector(heading)?;
                let link = parse_selector(link)?;
                document
                    .select(&heading)
                    .map(|h| {
                        let href = h.select(&link).next().and_then(|a| attr(a, "href"));
                        (element_text(h), href)
                    })
                    .collect()
            }
            ListingLayout::AnchorWithHeading { anchor, heading } => {
                let anchor = parse_selector(anchor)?;
                let heading = parse_selector(heading)?;
                document
                    .select(&anchor)
                    .filter_map(|a| {
                        let h = a.select(&heading).next()?;
                        Some((element_text(h), attr(a, "href")))
                    })
                    .collect()
            }
        };
        Ok(entries)
    }
}

impl SourceExtractor for SiteExtractor {
    fn source_id(&self) -> &str {
        self.source_id
    }

    fn listing_url(&self) -> &str {
        &self.listing_url
    }

    fn extract_candidates(&self, page: &FetchedPage) -> Result<Vec<Candidate>, ExtractError> {
        if page.body.trim().is_empty() {
            return Err(ExtractError::EmptyListing {
                url: page.url.clone(),
            });
        }
        let document = Html::parse_document(&page.body);
        let base = Url::parse(&page.url)
            .or_else(|_| Url::parse(&self.listing_url))
            .ok();

        let candidates = self
            .entries(&document)?
            .into_iter()
            .filter_map(|(header, href)| {
                let header = text_or_none(&header)?;
                let url = resolve_href(base.as_ref(), href.as_deref()?)?;
                is_valid_url(&url).then(|| Candidate::new(header, url))
            })
            .collect::<Vec<_>>();

        info!(
            source_id = self.source_id,
            count = candidates.len(),
            "Articles from {}: {}",
            self.listing_url,
            candidates.len()
        );
        Ok(candidates)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element.value().attr(name).map(ToString::to_string)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let href = text_or_none(href)?;
    match base {
        Some(base) => base.join(&href).ok().map(String::from),
        None => Some(href),
    }
}

pub fn idnes_extractor() -> SiteExtractor {
    SiteExtractor::new(
        "idnes",
        "https://www.idnes.cz",
        ListingLayout::TitledAnchor {
            anchor: r#"a[href][score-type="Article"]"#,
        },
    )
}

pub fn ihned_extractor() -> SiteExtractor {
    SiteExtractor::new(
        "ihned",
        "https://ihned.cz",
        ListingLayout::HeadingWithLink {
            heading: "h3.article-title",
            link: "a[href]",
        },
    )
}

pub fn bbc_extractor() -> SiteExtractor {
    SiteExtractor::new(
        "bbc",
        "https://www.bbc.com",
        ListingLayout::AnchorWithHeading {
            anchor: r#"a[href][data-testid="internal-link"]"#,
            heading: r#"h2[data-testid="card-headline"]"#,
        },
    )
}

pub fn extractor_for_source(source_id: &str) -> Option<SiteExtractor> {
    match source_id {
        "idnes" => Some(idnes_extractor()),
        "ihned" => Some(ihned_extractor()),
        "bbc" => Some(bbc_extractor()),
        _ => None,
    }
}

/// Every built-in source with its default listing url.
pub fn default_extractors() -> Vec<Box<dyn SourceExtractor>> {
    SOURCE_IDS
        .into_iter()
        .filter_map(extractor_for_source)
        .map(|e| Box::new(e) as Box<dyn SourceExtractor>)
        .collect()
}
