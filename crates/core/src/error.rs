/// Result alias that carries the custom [`LooplineError`] type.
pub type Result<T> = std::result::Result<T, LooplineError>;

/// Common error type for the core crate.
///
/// Invariant violations (`NegativeOffset`, `InvalidLoopNumber`,
/// `AlreadyRecording`, ...) indicate a broken caller contract and are never
/// retried. `RecorderNotInitialized` is the only environment condition.
#[derive(Debug, thiserror::Error)]
pub enum LooplineError {
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed configuration or timeline documents.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("loop end {end} must lie after loop start {start}")]
    InvalidLoopRegion { start: f64, end: f64 },
    #[error("content offset must not be negative (got {0})")]
    NegativeOffset(f64),
    #[error("loop number {0} requested for a recording without a loop region")]
    InvalidLoopNumber(u32),
    #[error("recorder is not initialized")]
    RecorderNotInitialized,
    #[error("recorder is already capturing")]
    AlreadyRecording,
    #[error("recorder is not capturing")]
    NotRecording,
    #[error("recorder is not primed")]
    NotPrimed,
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
}

impl LooplineError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for LooplineError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LooplineError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
