use std::fmt::{self, Display};

use reqwest::StatusCode;

/// The phase of an upload an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SessionCreation,
    StatusQuery,
    ChunkUpload,
    MetadataUpdate,
    SessionDeletion,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::SessionCreation => write!(f, "session creation"),
            Phase::StatusQuery => write!(f, "status query"),
            Phase::ChunkUpload => write!(f, "chunk upload"),
            Phase::MetadataUpdate => write!(f, "metadata update"),
            Phase::SessionDeletion => write!(f, "session deletion"),
        }
    }
}

/// Failures of a single request, after the retry policy has given up.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request cancelled")]
    Cancelled,
}

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error("unsupported in this environment: {0}")]
    Environment(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<UploadError>,
    },
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => UploadError::Cancelled,
            other => UploadError::Transport(other),
        }
    }
}

impl UploadError {
    /// True when this error, or the error a phase wrapper carries, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            UploadError::Cancelled => true,
            UploadError::Phase { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The phase this error was raised in, if it was wrapped.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            UploadError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The innermost error, past any phase wrappers.
    pub fn root(&self) -> &UploadError {
        match self {
            UploadError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn in_phase(self, phase: Phase) -> Self {
        match self {
            // Cancellation and already-wrapped errors keep their identity.
            UploadError::Cancelled => UploadError::Cancelled,
            wrapped @ UploadError::Phase { .. } => wrapped,
            other => UploadError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// Attaches a [`Phase`] to the error side of a result.
pub(crate) trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> Result<T>;
}

impl<T, E: Into<UploadError>> PhaseExt<T> for std::result::Result<T, E> {
    fn phase(self, phase: Phase) -> Result<T> {
        self.map_err(|e| e.into().in_phase(phase))
    }
}
