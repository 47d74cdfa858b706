//! HTTP fetch utilities and the persistence gateway for listing scout.

pub mod http;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT,
};
pub use store::{AlertStore, SqliteStore, StoreError};

pub const CRATE_NAME: &str = "scout-storage";
