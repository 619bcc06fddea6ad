//! Error taxonomy for the Veil collector.
//!
//! Nessun errore di questo crate è fatale per l'host: i fallimenti di
//! trasmissione diventano "riprova al prossimo tick", quelli di storage
//! diventano "usa i default in memoria". Solo i valori di configurazione
//! fuori dominio vengono restituiti al chiamante.

use thiserror::Error;

/// Massimo numero di caratteri del body conservati nei messaggi diagnostici.
pub const BODY_EXCERPT_CHARS: usize = 256;

/// Errors raised by the top-level collector API.
#[derive(Debug, Error)]
pub enum VeilError {
    /// Epsilon is NaN or outside the supported `[min, max]` domain.
    #[error("epsilon {value} is outside the supported range [{min}, {max}]")]
    EpsilonOutOfRange {
        /// Rejected value.
        value: f64,
        /// Lower bound of the domain.
        min: f64,
        /// Upper bound of the domain.
        max: f64,
    },
    /// A persistence backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Invalid collector configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors raised by key-value storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying file I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored payload could not be (de)serialized.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single batch transmission.
///
/// Ogni variante porta con sé abbastanza contesto (url, status, estratto
/// del body) per fare debug senza dover riprodurre la richiesta.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmissionError {
    /// The request never produced a response (DNS, connect, timeout, ...).
    #[error("network error posting to {url}: {message}")]
    Network {
        /// Endpoint URL.
        url: String,
        /// Transport-level error message.
        message: String,
    },
    /// The endpoint answered with a non-2xx status.
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        /// Endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// 2xx with an empty body.
    #[error("empty response body from {url} (HTTP {status})")]
    EmptyBody {
        /// Endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// 2xx with a body that is not valid JSON.
    #[error("malformed JSON from {url} (HTTP {status}): {body}")]
    MalformedBody {
        /// Endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// 2xx JSON body carrying an application-level `error` field.
    #[error("ingestion rejected batch at {url}: {error}")]
    Rejected {
        /// Endpoint URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Content of the `error` field.
        error: String,
    },
}

impl TransmissionError {
    /// HTTP status associated with the failure, if a response was received.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Network { .. } => None,
            Self::HttpStatus { status, .. }
            | Self::EmptyBody { status, .. }
            | Self::MalformedBody { status, .. }
            | Self::Rejected { status, .. } => Some(*status),
        }
    }
}

/// Truncates a response body for diagnostics, on a char boundary.
#[must_use]
pub fn body_excerpt(body: &str) -> String {
    if body.chars().count() <= BODY_EXCERPT_CHARS {
        return body.to_owned();
    }
    let mut excerpt: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    excerpt.push('…');
    excerpt
}

/// Result type for collector operations.
pub type Result<T> = std::result::Result<T, VeilError>;
