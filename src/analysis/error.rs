use thiserror::Error;

pub type Result<T> = std::result::Result<T, SignalError>;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("sampling rate must be greater than zero")]
    InvalidSampleRate,
    #[error("sample rate mismatch: expected {expected}, got {actual}")]
    SampleRateMismatch { expected: f64, actual: f64 },
    #[error("data unavailable: {what}")]
    DataUnavailable { what: String },
    #[error("{context}: need at least {required}, got {available}")]
    InsufficientSamples {
        context: &'static str,
        required: usize,
        available: usize,
    },
    #[error("numerically degenerate input in {context}")]
    NumericDegenerate { context: &'static str },
    #[error("length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("computation cancelled")]
    Cancelled,
    #[error("classifier model error: {0}")]
    Model(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SignalError {
    pub fn unavailable(what: impl Into<String>) -> Self {
        SignalError::DataUnavailable { what: what.into() }
    }

    pub fn length_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        SignalError::LengthMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Degraded-output conditions; callers turn these into "no prediction"
    /// sentinels instead of failing the whole recording.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            SignalError::InsufficientSamples { .. } | SignalError::NumericDegenerate { .. }
        )
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for SignalError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        SignalError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for SignalError {
    fn from(value: image::ImageError) -> Self {
        SignalError::Plot(value.to_string())
    }
}
