//! Axum front end for keyword search over stored articles.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use nhf_core::ArticleView;
use nhf_storage::{ArticleStore, StoreError, DEFAULT_DATABASE_URL};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "nhf-web";

pub const DEFAULT_WEB_PORT: u16 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub store: ArticleStore,
}

impl AppState {
    pub fn new(store: ArticleStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FindArticlesResponse {
    pub articles: Vec<ArticleView>,
}

/// Articles whose header contains any keyword, newest first, projected to `{text, url}`.
pub async fn search_articles(
    store: &ArticleStore,
    keywords: &[String],
) -> Result<Vec<ArticleView>, StoreError> {
    let articles = store.find_by_keywords(keywords).await?;
    Ok(articles.iter().map(|a| a.view()).collect())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/articles/find", post(find_articles_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("NHF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let store = ArticleStore::connect(&database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database_url, "serving article search");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum RequestProblem {
    NotJson,
    Malformed,
    MissingKeywords,
    KeywordsNotStrings,
}

impl RequestProblem {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotJson => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Malformed => StatusCode::BAD_REQUEST,
            Self::MissingKeywords | Self::KeywordsNotStrings => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::NotJson => "Request have to be JSON.",
            Self::Malformed => "Request body is not valid JSON.",
            Self::MissingKeywords => "Missing required field 'keywords'.",
            Self::KeywordsNotStrings => "Keywords have to be string.",
        }
    }
}

impl IntoResponse for RequestProblem {
    fn into_response(self) -> Response {
        error_response(self.status(), self.message())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let mime = value.split(';').next().unwrap_or_default().trim();
    mime.eq_ignore_ascii_case("application/json")
        || (mime.starts_with("application/") && mime.ends_with("+json"))
}

fn parse_keywords(headers: &HeaderMap, body: &[u8]) -> Result<Vec<String>, RequestProblem> {
    if !is_json_content_type(headers) {
        return Err(RequestProblem::NotJson);
    }
    let payload: Value = serde_json::from_slice(body).map_err(|_| RequestProblem::Malformed)?;
    let keywords = payload
        .get("keywords")
        .ok_or(RequestProblem::MissingKeywords)?
        .as_array()
        .ok_or(RequestProblem::KeywordsNotStrings)?;
    keywords
        .iter()
        .map(|k| {
            k.as_str()
                .map(ToString::to_string)
                .ok_or(RequestProblem::KeywordsNotStrings)
        })
        .collect()
}

async fn find_articles_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let keywords = match parse_keywords(&headers, &body) {
        Ok(keywords) => keywords,
        Err(problem) => return problem.into_response(),
    };
    match search_articles(&state.store, &keywords).await {
        Ok(articles) => Json(FindArticlesResponse { articles }).into_response(),
        Err(err) => {
            error!("search failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}
