use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use nhf_core::{Article, Candidate};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://news.db";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// What `store_if_new` did with a candidate. Callers are free to ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted(Article),
    /// An article with the same url already exists; it was left untouched.
    Duplicate,
    /// Blank header or invalid url; nothing was written.
    Skipped,
    /// The write failed and was logged.
    Failed,
}

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    header: String,
    url: String,
    timestamp: DateTime<Utc>,
}

impl From<ArticleRow> for Article {
    fn from(row: ArticleRow) -> Self {
        Self {
            id: row.id,
            header: row.header,
            url: row.url,
            timestamp: row.timestamp,
        }
    }
}

/// Article relation keyed by url with first-write-wins insertion.
#[derive(Debug, Clone)]
pub struct ArticleStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ArticleStore {
    /// Opens (creating if needed) a SQLite database and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Persists the candidate unless its url is already stored.
    ///
    /// Invalid candidates are skipped silently. Storage faults are logged and swallowed so
    /// ingestion of later candidates continues.
    pub async fn store_if_new(&self, candidate: &Candidate) -> StoreOutcome {
        if !candidate.is_storable() {
            debug!(url = %candidate.url, "skipping candidate without header or valid url");
            return StoreOutcome::Skipped;
        }

        match self.insert_if_absent(candidate).await {
            Ok(Some(article)) => StoreOutcome::Inserted(article),
            Ok(None) => StoreOutcome::Duplicate,
            Err(err) => {
                error!(url = %candidate.url, "Error saving article: {err}");
                StoreOutcome::Failed
            }
        }
    }

    async fn insert_if_absent(&self, candidate: &Candidate) -> Result<Option<Article>, StoreError> {
        let _guard = self.write_lock.lock().await;

        if self.find_by_url(&candidate.url).await?.is_some() {
            return Ok(None);
        }

        let article = Article {
            id: Uuid::new_v4(),
            header: candidate.header.trim().to_string(),
            url: candidate.url.clone(),
            timestamp: Utc::now().trunc_subsecs(6),
        };

        // The UNIQUE(url) constraint still decides when another process wrote first.
        let result = sqlx::query(
            r#"
            INSERT INTO articles (id, header, url, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(article.id)
        .bind(&article.header)
        .bind(&article.url)
        .bind(encode_timestamp(article.timestamp))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(article))
    }

    pub async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            "SELECT id, header, url, timestamp FROM articles WHERE url = ?1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Article::from))
    }

    /// Articles whose header contains any keyword (case-sensitive), newest first.
    /// No keywords means no results.
    pub async fn find_by_keywords(&self, keywords: &[String]) -> Result<Vec<Article>, StoreError> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, header, url, timestamp FROM articles WHERE ",
        );
        let mut conditions = query.separated(" OR ");
        for keyword in keywords {
            conditions.push("instr(header, ");
            conditions.push_bind_unseparated(keyword.clone());
            conditions.push_unseparated(") > 0");
        }
        query.push(" ORDER BY timestamp DESC, rowid DESC");

        let rows = query
            .build_query_as::<ArticleRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Article::from).collect())
    }

    /// Every stored article, newest first.
    pub async fn all_articles(&self) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query_as::<_, ArticleRow>(
            "SELECT id, header, url, timestamp FROM articles ORDER BY timestamp DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Article::from).collect())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Empties the relation. Only used by `migrate --reset` and tests.
    pub async fn reset(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM articles")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// Fixed-width UTC text so lexical order in SQLite matches chronological order.
fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
