//! Error taxonomy for the telemetry pipeline.
//!
//! Only [`ConnectionError`] ever reaches a consumer. Everything else is
//! absorbed by the poll orchestrator and shows up as availability state.

use thiserror::Error;

/// Network-level failure talking to the station. Retried on the next cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, DNS failure or request timeout.
    #[error("station unreachable: {0}")]
    Unreachable(String),

    /// The station answered with a non-2xx status.
    #[error("station returned HTTP {0}")]
    HttpStatus(u16),

    /// Malformed HTTP exchange (bad headers, truncated body, redirect).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            TransportError::Unreachable(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::HttpStatus(status.as_u16())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }
}

/// Whole-payload structural failure. The cycle is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A single field was dropped while decoding; the rest of the payload is kept.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("dropped field {field}: {reason}")]
pub struct FieldDecodeWarning {
    pub field: String,
    /// Channel the field would have fed.
    pub channel_id: String,
    pub reason: String,
}

impl FieldDecodeWarning {
    pub fn new(
        field: impl Into<String>,
        channel_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            channel_id: channel_id.into(),
            reason: reason.into(),
        }
    }
}

/// Why one poll cycle produced no new snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Invalid station configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },

    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("{0} must not exceed one day")]
    TooLong(&'static str),

    #[error("smoothing factor must be in (0, 1], got {0}")]
    SmoothingFactor(f64),
}

/// Failure establishing a session. Surfaced once, at connect time.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot connect: {0}")]
    CannotConnect(TransportError),

    #[error("station sent an unusable payload: {0}")]
    InvalidPayload(DecodeError),
}

impl From<CycleError> for ConnectionError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Transport(e) => ConnectionError::CannotConnect(e),
            CycleError::Decode(e) => ConnectionError::InvalidPayload(e),
        }
    }
}
