use crate::domain::Reference;

/// Token decoding failures.
///
/// These are user-input problems: reported to the consumer as-is, never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("the link is malformed or has been tampered with")]
    Malformed,

    #[error("invalid range: end {end} precedes start {start}")]
    InvalidRange { start: Reference, end: Reference },

    #[error("stored item {0} no longer exists")]
    UnknownReference(Reference),
}

/// Re-delivery handshake failures, reported to the requesting consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestWorkflowError {
    #[error("a re-delivery request is already pending for this file")]
    AlreadyPending,

    #[error("this delivery has not expired yet")]
    NotExpired,

    #[error("the re-request window for this delivery has closed")]
    WindowClosed,

    #[error("no re-delivery request is pending for this delivery")]
    NotPending,

    #[error("unknown delivery artifact {0}")]
    UnknownArtifact(u64),
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the core can
/// handle failures consistently (user-facing message vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    RequestWorkflow(#[from] RequestWorkflowError),

    /// Transport hiccup (network, rate limit). The content store retries
    /// these with backoff before escalating to `FetchFailed`.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("stored item {0} was not found")]
    NotFound(Reference),

    #[error("fetch of {reference} failed after {attempts} attempts: {detail}")]
    FetchFailed {
        reference: Reference,
        attempts: u32,
        detail: String,
    },

    #[error("another operation is already running in this workspace")]
    SessionBusy,

    #[error("this workspace session is closed")]
    SessionClosed,

    #[error("could not download the source file: {0}")]
    SessionFetch(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{operation} failed: {detail}")]
    Processing { operation: String, detail: String },

    #[error("{operation} exceeded the {seconds}s limit and was killed")]
    ProcessingTimeout { operation: String, seconds: u64 },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True for failures the caller may retry after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientTransport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
