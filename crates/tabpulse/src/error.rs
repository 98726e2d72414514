use thiserror::Error;

/// Errors surfaced by buffer and pipeline operations.
///
/// Per-batch transport failures and unmet sync policy are not errors; they
/// are reported through [`SyncOutcome`].
#[derive(Debug, Error)]
pub enum PulseError {
    /// Caller broke an operation's contract (e.g. replacing the tail of an
    /// empty buffer).
    #[error("precondition failed: {0}")]
    Precondition(&'static str),

    /// The key-value store could not be read or written.
    #[error("storage unavailable: {0}")]
    Storage(#[source] anyhow::Error),

    /// Stored buffer contents are not a sequence of activity events.
    #[error("buffer contents could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PulseError>;

/// Why a sync cycle ended without sending anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Policy has sync turned off.
    Disabled,
    /// Tenant or routing identifier absent or blank.
    MissingCredentials,
    /// Routing identifier is not a single DNS label.
    InvalidRouting,
    /// Nothing buffered.
    EmptyBuffer,
    /// Every buffered event failed the validity filter.
    NothingValid,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No batch was sent; buffer untouched.
    Skipped(SkipReason),
    /// Every batch succeeded and the buffer was emptied.
    Cleared { batches: usize, records: usize },
    /// At least one batch failed; buffer retained for the next cycle.
    PartialFailure { attempted: usize, failed: usize },
}

impl SyncOutcome {
    pub fn is_cleared(&self) -> bool {
        matches!(self, SyncOutcome::Cleared { .. })
    }
}
