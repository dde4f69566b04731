use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;
use crate::predictor::PredictorError;
use crate::store::StoreError;
use crate::sync::lease::LeaseError;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("invalid topic: {topic}")]
    InvalidTopic { topic: String },

    #[error("student {student} is not enrolled in topic {topic}")]
    StudentNotEnrolled { topic: String, student: String },

    #[error("student id must not be blank")]
    BlankStudentId,

    #[error("malformed response encoding: {input:?}")]
    MalformedResponseEncoding { input: String },

    #[error("roster snapshot missing from cache")]
    RosterUninitialized,

    #[error("{operation} did not converge after {attempts} attempts")]
    ConvergenceTimeout {
        operation: &'static str,
        attempts: u32,
    },

    #[error("{operation} exceeded its deadline of {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("corrupt roster snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("predictor error: {0}")]
    Predictor(#[from] PredictorError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("durable store error: {0}")]
    Store(#[from] StoreError),

    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),
}

impl RosterError {
    pub fn invalid_topic(topic: impl Into<String>) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
        }
    }

    pub fn not_enrolled(topic: impl Into<String>, student: impl Into<String>) -> Self {
        Self::StudentNotEnrolled {
            topic: topic.into(),
            student: student.into(),
        }
    }

    pub fn malformed(input: impl Into<String>) -> Self {
        Self::MalformedResponseEncoding {
            input: input.into(),
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidTopic { .. } => "INVALID_TOPIC",
            Self::StudentNotEnrolled { .. } => "STUDENT_NOT_ENROLLED",
            Self::BlankStudentId => "BLANK_STUDENT_ID",
            Self::MalformedResponseEncoding { .. } => "MALFORMED_RESPONSE_ENCODING",
            Self::RosterUninitialized => "ROSTER_UNINITIALIZED",
            Self::ConvergenceTimeout { .. } => "CONVERGENCE_TIMEOUT",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::CorruptSnapshot(_) => "CORRUPT_SNAPSHOT",
            Self::Predictor(_) => "PREDICTOR_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Lease(_) => "LEASE_ERROR",
        }
    }

    /// Caller-caused errors whose message is safe to surface as-is.
    pub const fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopic { .. }
                | Self::StudentNotEnrolled { .. }
                | Self::BlankStudentId
                | Self::MalformedResponseEncoding { .. }
        )
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}
