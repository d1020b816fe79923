use std::time;

use scanner_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors a single verification provider call can end with.
/// All of them count as a lost race, never as a pipeline failure.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider did not answer within {0:?}")]
    Timeout(time::Duration),
    #[error("provider request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("provider responded with status {0}")]
    StatusError(http::StatusCode),
    #[error("provider response could not be understood: {0}")]
    MalformedResponse(String),
    #[error("invalid provider url: {0}")]
    ParseUrlError(#[from] url::ParseError),
}

/// Enumeration of errors related to AI-assisted reconstruction.
#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("reconstruction provider did not answer within {0:?}")]
    Timeout(time::Duration),
    #[error("reconstruction request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("reconstruction provider responded with status {0}")]
    StatusError(http::StatusCode),
    #[error("reconstruction response could not be understood: {0}")]
    MalformedResponse(String),
}

/// Enumeration of errors related to forwarding an address downstream.
/// A dispatch failure is reported but never retried.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("forward request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("forward target responded with status {0}")]
    StatusError(http::StatusCode),
}

/// Enumeration of errors related to initialization and running of the scanner.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to initialize the store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to build http client: {0}")]
    ClientError(#[from] reqwest::Error),
    #[error("invalid forward url: {0}")]
    ForwardUrlError(url::ParseError),
    #[error("invalid reconstruction provider url: {0}")]
    ReconstructionUrlError(url::ParseError),
    #[error("failed to read from the message source: {0}")]
    SourceError(#[from] std::io::Error),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
