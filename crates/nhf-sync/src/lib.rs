//! Ingestion pipeline: one tick over every configured source, plus the tick loop.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nhf_adapters::{default_extractors, extractor_for_source, ExtractError, SourceExtractor};
use nhf_core::{Candidate, FetchedPage};
use nhf_storage::{
    ArticleStore, HttpClientConfig, HttpFetcher, PageFetcher, StoreOutcome, DEFAULT_DATABASE_URL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nhf-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub scrape_interval_secs: u64,
    pub user_agent: String,
    pub sources_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            http_timeout_secs: 5,
            scrape_interval_secs: 10,
            user_agent: "nhf-bot/0.1".to_string(),
            sources_file: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            http_timeout_secs: std::env::var("NHF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scrape_interval_secs: std::env::var("NHF_SCRAPE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scrape_interval_secs),
            user_agent: std::env::var("NHF_USER_AGENT").unwrap_or(defaults.user_agent),
            sources_file: std::env::var("NHF_SOURCES_FILE").ok().map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides the extractor's built-in listing url.
    #[serde(default)]
    pub listing_url: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    /// Human-readable name, falling back to the id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.source_id)
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Extractors for the enabled sources, in registry order.
    pub fn extractors(&self) -> Result<Vec<Box<dyn SourceExtractor>>> {
        let mut out: Vec<Box<dyn SourceExtractor>> = Vec::new();
        for source in &self.sources {
            if !source.enabled {
                info!(source_id = %source.source_id, "source {} is disabled", source.label());
                continue;
            }
            let Some(mut extractor) = extractor_for_source(&source.source_id) else {
                bail!("no extractor registered for {}", source.source_id);
            };
            if let Some(url) = &source.listing_url {
                extractor = extractor.with_listing_url(url.clone());
            }
            info!(
                source_id = %source.source_id,
                listing_url = extractor.listing_url(),
                "source {} enabled",
                source.label()
            );
            out.push(Box::new(extractor));
        }
        Ok(out)
    }
}

#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("extractor panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub failed_sources: usize,
    pub candidates: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed_writes: usize,
}

impl TickSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            sources: 0,
            failed_sources: 0,
            candidates: 0,
            inserted: 0,
            duplicates: 0,
            skipped: 0,
            failed_writes: 0,
        }
    }

    fn record(&mut self, outcome: &StoreOutcome) {
        match outcome {
            StoreOutcome::Inserted(_) => self.inserted += 1,
            StoreOutcome::Duplicate => self.duplicates += 1,
            StoreOutcome::Skipped => self.skipped += 1,
            StoreOutcome::Failed => self.failed_writes += 1,
        }
    }
}

/// Drives fetch -> extract -> store for each source. A failing source never stops the others.
pub struct IngestionCoordinator {
    fetcher: Arc<dyn PageFetcher>,
    store: ArticleStore,
    sources: Vec<Box<dyn SourceExtractor>>,
}

impl IngestionCoordinator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: ArticleStore,
        sources: Vec<Box<dyn SourceExtractor>>,
    ) -> Self {
        Self {
            fetcher,
            store,
            sources,
        }
    }

    pub fn store(&self) -> &ArticleStore {
        &self.store
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    /// One tick. Sources are processed sequentially in configuration order.
    pub async fn run_once(&self) -> TickSummary {
        let mut summary = TickSummary::start();
        let span = info_span!("ingest_tick", run_id = %summary.run_id);

        async {
            for source in &self.sources {
                summary.sources += 1;
                let source_id = source.source_id();
                info!(source_id, "Scraping news using {source_id}");

                // The fetcher has already logged the failure.
                let Ok(page) = self.fetcher.fetch(source.listing_url()).await else {
                    summary.failed_sources += 1;
                    continue;
                };

                let candidates = match extract_guarded(source.as_ref(), &page) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        error!(source_id, "Scraper Error: {source_id} : {err}");
                        summary.failed_sources += 1;
                        continue;
                    }
                };

                summary.candidates += candidates.len();
                for candidate in &candidates {
                    let outcome = self.store.store_if_new(candidate).await;
                    summary.record(&outcome);
                }
            }
        }
        .instrument(span)
        .await;

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            sources = summary.sources,
            failed_sources = summary.failed_sources,
            candidates = summary.candidates,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "tick complete"
        );
        summary
    }

    /// Tick, sleep, repeat until `shutdown` resolves. A running tick always completes first.
    /// Returns the number of ticks run.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticks = 0usize;
        loop {
            self.run_once().await;
            ticks += 1;
            tokio::select! {
                _ = &mut shutdown => {
                    info!(ticks, "shutdown requested; ingestion loop stopped");
                    return ticks;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Runs until Ctrl-C.
    pub async fn run_forever(&self, interval: Duration) -> usize {
        self.run_until(interval, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn extract_guarded(
    source: &dyn SourceExtractor,
    page: &FetchedPage,
) -> Result<Vec<Candidate>, SourceFailure> {
    match panic::catch_unwind(AssertUnwindSafe(|| source.extract_candidates(page))) {
        Ok(result) => Ok(result?),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(SourceFailure::Panicked(message))
        }
    }
}

pub async fn build_coordinator(config: &SyncConfig) -> Result<IngestionCoordinator> {
    let store = ArticleStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening article store {}", config.database_url))?;
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let sources = match &config.sources_file {
        Some(path) => SourceRegistry::load(path).await?.extractors()?,
        None => default_extractors(),
    };
    Ok(IngestionCoordinator::new(Arc::new(fetcher), store, sources))
}

pub async fn run_once_from_env() -> Result<TickSummary> {
    let config = SyncConfig::from_env();
    let coordinator = build_coordinator(&config).await?;
    Ok(coordinator.run_once().await)
}

pub async fn run_forever_from_env() -> Result<usize> {
    let config = SyncConfig::from_env();
    let coordinator = build_coordinator(&config).await?;
    info!(
        sources = ?coordinator.source_ids(),
        interval_secs = config.scrape_interval_secs,
        "starting ingestion loop"
    );
    Ok(coordinator.run_forever(config.scrape_interval()).await)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use nhf_adapters::idnes_extractor;
    use nhf_storage::{FetchFailure, FetchFailureKind};
    use tokio::net::TcpListener;

    use super::*;
    use nhf_storage::test_support::CapturedLogs;

    #[derive(Default)]
    struct StaticFetcher {
        pages: HashMap<String, String>,
    }

    impl StaticFetcher {
        fn with_page(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
            match self.pages.get(url) {
                Some(body) => Ok(FetchedPage {
                    url: url.to_string(),
                    status: 200,
                    body: body.clone(),
                    fetched_at: Utc::now(),
                }),
                None => Err(FetchFailure {
                    kind: FetchFailureKind::ConnectionError,
                    url: url.to_string(),
                    status: None,
                    detail: "no such page".to_string(),
                }),
            }
        }
    }

    struct FakeExtractor;

    impl SourceExtractor for FakeExtractor {
        fn source_id(&self) -> &str {
            "fake"
        }

        fn listing_url(&self) -> &str {
            "https://fake.example.com/"
        }

        fn extract_candidates(&self, _page: &FetchedPage) -> Result<Vec<Candidate>, ExtractError> {
            Ok(vec![
                Candidate::new("a", "http://www.some-url.cz"),
                Candidate::new("b", "http://www.some-url.cz"),
            ])
        }
    }

    enum Failure {
        Error,
        Panic,
    }

    struct FailingExtractor(Failure);

    impl SourceExtractor for FailingExtractor {
        fn source_id(&self) -> &str {
            "failing"
        }

        fn listing_url(&self) -> &str {
            "https://failing.example.com/"
        }

        fn extract_candidates(&self, _page: &FetchedPage) -> Result<Vec<Candidate>, ExtractError> {
            match self.0 {
                Failure::Error => Err(ExtractError::EmptyListing {
                    url: self.listing_url().to_string(),
                }),
                Failure::Panic => panic!("markup drifted"),
            }
        }
    }

    fn fake_site_fetcher() -> Arc<dyn PageFetcher> {
        Arc::new(
            StaticFetcher::default()
                .with_page("https://fake.example.com/", "<html></html>")
                .with_page("https://failing.example.com/", "<html></html>"),
        )
    }

    async fn assert_failing_source_is_isolated(sources: Vec<Box<dyn SourceExtractor>>) {
        let store = ArticleStore::in_memory().await.unwrap();
        let coordinator = IngestionCoordinator::new(fake_site_fetcher(), store.clone(), sources);
        let (logs, _guard) = CapturedLogs::install();

        let summary = coordinator.run_once().await;

        let articles = store.all_articles().await.unwrap();
        assert_eq!(articles.len(), 1, "only the first of two same-url candidates is kept");
        assert_eq!(articles[0].header, "a");
        assert_eq!(articles[0].url, "http://www.some-url.cz");

        let errors = logs.errors();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].starts_with("Scraper Error: failing"), "{errors:?}");

        assert_eq!(summary.sources, 2);
        assert_eq!(summary.failed_sources, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.duplicates, 1);
    }

    #[tokio::test]
    async fn failing_source_after_healthy_one_is_isolated() {
        assert_failing_source_is_isolated(vec![
            Box::new(FakeExtractor),
            Box::new(FailingExtractor(Failure::Error)),
        ])
        .await;
    }

    #[tokio::test]
    async fn failing_source_before_healthy_one_is_isolated() {
        assert_failing_source_is_isolated(vec![
            Box::new(FailingExtractor(Failure::Error)),
            Box::new(FakeExtractor),
        ])
        .await;
    }

    #[tokio::test]
    async fn panicking_extractor_is_contained() {
        assert_failing_source_is_isolated(vec![
            Box::new(FailingExtractor(Failure::Panic)),
            Box::new(FakeExtractor),
        ])
        .await;
    }

    #[tokio::test]
    async fn unreachable_source_stores_nothing_and_logs_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = ArticleStore::in_memory().await.unwrap();
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .unwrap();
        let coordinator = IngestionCoordinator::new(
            Arc::new(fetcher),
            store.clone(),
            vec![Box::new(
                idnes_extractor().with_listing_url(format!("http://127.0.0.1:{port}/")),
            )],
        );
        let (logs, _guard) = CapturedLogs::install();

        let summary = coordinator.run_once().await;

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(summary.failed_sources, 1);
        let errors = logs.errors();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].starts_with("ConnectionError:"), "{errors:?}");
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_duplicate_articles() {
        let html = r#"
            <a score-type="Article" href="/zpravy/one">First</a>
            <a score-type="Article" href="/zpravy/two">Second</a>
        "#;
        let fetcher = StaticFetcher::default().with_page("https://www.idnes.cz", html);
        let store = ArticleStore::in_memory().await.unwrap();
        let coordinator = IngestionCoordinator::new(
            Arc::new(fetcher),
            store.clone(),
            vec![Box::new(idnes_extractor())],
        );

        let first = coordinator.run_once().await;
        let second = coordinator.run_once().await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        let mut urls = store
            .all_articles()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.url)
            .collect::<Vec<_>>();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://www.idnes.cz/zpravy/one".to_string(),
                "https://www.idnes.cz/zpravy/two".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn loop_stops_after_shutdown_resolves() {
        let store = ArticleStore::in_memory().await.unwrap();
        let coordinator =
            IngestionCoordinator::new(fake_site_fetcher(), store.clone(), vec![Box::new(FakeExtractor)]);

        let ticks = coordinator
            .run_until(Duration::from_secs(3600), std::future::ready(()))
            .await;
        assert_eq!(ticks, 1);

        let ticks = coordinator
            .run_until(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await;
        assert!(ticks >= 2, "ran {ticks} ticks");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn registry_filters_disabled_and_applies_overrides() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: bbc
    display_name: BBC
  - source_id: idnes
    enabled: false
  - source_id: ihned
    listing_url: https://mirror.example.com/ihned
"#,
        )
        .unwrap();
        let extractors = registry.extractors().unwrap();
        let pairs = extractors
            .iter()
            .map(|e| (e.source_id(), e.listing_url()))
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                ("bbc", "https://www.bbc.com"),
                ("ihned", "https://mirror.example.com/ihned")
            ]
        );
    }

    #[test]
    fn registry_labels_fall_back_to_source_id() {
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - source_id: bbc\n    display_name: BBC News\n  - source_id: idnes\n",
        )
        .unwrap();
        let labels = registry.sources.iter().map(|s| s.label()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["BBC News", "idnes"]);
    }

    #[tokio::test]
    async fn empty_listing_page_is_a_scraper_error() {
        let fetcher = StaticFetcher::default().with_page("https://www.idnes.cz", "   ");
        let store = ArticleStore::in_memory().await.unwrap();
        let coordinator = IngestionCoordinator::new(
            Arc::new(fetcher),
            store.clone(),
            vec![Box::new(idnes_extractor())],
        );
        let (logs, _guard) = CapturedLogs::install();

        let summary = coordinator.run_once().await;

        assert_eq!(summary.failed_sources, 1);
        assert_eq!(store.count().await.unwrap(), 0);
        let errors = logs.errors();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(
            errors[0].starts_with("Scraper Error: idnes : listing page https://www.idnes.cz has an empty body"),
            "{errors:?}"
        );
    }

    #[test]
    fn registry_rejects_unknown_sources() {
        let registry = SourceRegistry::from_yaml_str("sources:\n  - source_id: nowhere\n").unwrap();
        let err = registry.extractors().err().expect("unknown source");
        assert!(err.to_string().contains("nowhere"));
    }

    #[tokio::test]
    async fn registry_loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, "sources:\n  - source_id: idnes\n").unwrap();
        let registry = SourceRegistry::load(&path).await.unwrap();
        assert_eq!(registry.sources.len(), 1);
        assert!(registry.sources[0].enabled);
    }

    #[tokio::test]
    async fn checked_in_registry_covers_builtin_sources() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).await.unwrap();
        let ids = registry
            .extractors()
            .unwrap()
            .iter()
            .map(|e| e.source_id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, nhf_adapters::SOURCE_IDS.map(String::from).to_vec());
    }

    #[test]
    fn default_config_uses_reference_timings() {
        let config = SyncConfig::default();
        assert_eq!(config.scrape_interval(), Duration::from_secs(10));
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(5));
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }
}
