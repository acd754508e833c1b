//! Article storage + HTTP fetch utilities for NHF.

mod fetch;
mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use fetch::{
    classify_reqwest_error, FetchFailure, FetchFailureKind, HttpClientConfig, HttpFetcher,
    PageFetcher,
};
pub use store::{ArticleStore, StoreError, StoreOutcome, DEFAULT_DATABASE_URL};

pub const CRATE_NAME: &str = "nhf-storage";
