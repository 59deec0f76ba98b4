use std::fmt;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("failed to read catalog at {path}: {message}")]
    #[diagnostic(help("check the `catalog` setting in geolayer-sync.json"))]
    CatalogRead { path: Utf8PathBuf, message: String },

    #[error("config file not found: {0}")]
    MissingConfig(Utf8PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("failed to read report at {path}: {message}")]
    ReportRead { path: Utf8PathBuf, message: String },

    #[error("failed to parse report at {path}: {message}")]
    ReportParse { path: Utf8PathBuf, message: String },

    #[error("invalid retry item: {0}")]
    InvalidRetryItem(String),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

// The first three are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    ConnectionAborted,
    TimedOut,
    Connect,
    Other,
}

impl TransportKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, TransportKind::Other)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::ConnectionAborted => write!(f, "connection aborted"),
            TransportKind::TimedOut => write!(f, "connection timed out"),
            TransportKind::Connect => write!(f, "host unreachable"),
            TransportKind::Other => write!(f, "transport error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpFailure {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },

    #[error("{kind}: {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("write failed: {0}")]
    Sink(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("metadata request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("malformed metadata response: {0}")]
    MalformedResponse(String),

    #[error("No layers found")]
    NoLayersFound,

    #[error("cannot derive a service name from {0}")]
    UnnamedService(String),

    #[error("{kind}: {message}")]
    Transport { kind: TransportKind, message: String },
}

impl DiscoveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DiscoveryError::Timeout => FailureKind::Timeout,
            DiscoveryError::HttpStatus { .. } => FailureKind::HttpStatus,
            DiscoveryError::MalformedResponse(_) => FailureKind::MalformedResponse,
            DiscoveryError::NoLayersFound => FailureKind::NoLayersFound,
            DiscoveryError::UnnamedService(_) => FailureKind::UnnamedService,
            DiscoveryError::Transport { kind, .. } => FailureKind::Transport(*kind),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<HttpFailure> for DiscoveryError {
    fn from(value: HttpFailure) -> Self {
        match value {
            HttpFailure::Timeout => DiscoveryError::Timeout,
            HttpFailure::Status { status } => DiscoveryError::HttpStatus {
                status,
                message: "metadata request rejected".to_string(),
            },
            HttpFailure::TooManyRedirects { limit } => DiscoveryError::Transport {
                kind: TransportKind::Other,
                message: format!("redirect limit {limit} exceeded"),
            },
            HttpFailure::Transport { kind, message } => DiscoveryError::Transport { kind, message },
            HttpFailure::Sink(message) => DiscoveryError::MalformedResponse(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Download timeout")]
    Timeout,

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("empty or invalid artifact: {0}")]
    EmptyOrInvalidArtifact(String),

    #[error("{kind}: {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout => FailureKind::Timeout,
            FetchError::HttpStatus { .. } => FailureKind::HttpStatus,
            FetchError::EmptyOrInvalidArtifact(_) => FailureKind::EmptyOrInvalidArtifact,
            FetchError::Transport { kind, .. } => FailureKind::Transport(*kind),
            FetchError::Filesystem(_) => FailureKind::Filesystem,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<HttpFailure> for FetchError {
    fn from(value: HttpFailure) -> Self {
        match value {
            HttpFailure::Timeout => FetchError::Timeout,
            HttpFailure::Status { status } => FetchError::HttpStatus { status },
            HttpFailure::TooManyRedirects { limit } => FetchError::Transport {
                kind: TransportKind::Other,
                message: format!("redirect limit {limit} exceeded"),
            },
            HttpFailure::Transport { kind, message } => FetchError::Transport { kind, message },
            HttpFailure::Sink(message) => FetchError::Filesystem(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "detail")]
pub enum FailureKind {
    Timeout,
    HttpStatus,
    MalformedResponse,
    NoLayersFound,
    UnnamedService,
    Uncategorized,
    EmptyOrInvalidArtifact,
    Transport(TransportKind),
    Filesystem,
    Cancelled,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        match self {
            FailureKind::Timeout => true,
            FailureKind::Transport(kind) => kind.is_transient(),
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::HttpStatus => "HTTP error",
            FailureKind::MalformedResponse => "Malformed metadata",
            FailureKind::NoLayersFound => "No layers found",
            FailureKind::UnnamedService => "Unnamed service",
            FailureKind::Uncategorized => "No category",
            FailureKind::EmptyOrInvalidArtifact => "Empty or invalid artifact",
            FailureKind::Transport(_) => "Network error",
            FailureKind::Filesystem => "Filesystem error",
            FailureKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport(kind) => write!(f, "{} ({kind})", self.label()),
            _ => write!(f, "{}", self.label()),
        }
    }
}
