mod bkt;

pub use bkt::{BktParams, BktPredictor};

use thiserror::Error;

use crate::roster::Prediction;

/// Mastery model consulted by the roster after every recorded response.
///
/// Implementations must be pure with respect to shared state and cheap enough
/// to call while the roster lease is held.
pub trait Predictor: Send + Sync {
    /// Returns `Prediction::Untrained` for an empty history.
    fn predict(&self, topic: &str, history: &[bool]) -> Result<Prediction, PredictorError>;
}

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("invalid model parameters: {0}")]
    InvalidParameters(String),
    #[error("prediction for topic {topic} out of range: {value}")]
    OutOfRange { topic: String, value: f64 },
    #[error("prediction failed for topic {topic}: {reason}")]
    Failed { topic: String, reason: String },
}
