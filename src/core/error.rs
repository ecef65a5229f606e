use thiserror::Error;

use super::plans::PlanKey;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("cannot combine repayment plans with different terms ({left} vs {right})")]
    IncompatiblePlans { left: String, right: String },

    #[error("solver backend {0} is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("solver failed: {0}")]
    Solver(String),
}

impl PlanError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        PlanError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(left: &PlanKey, right: &PlanKey) -> Self {
        PlanError::IncompatiblePlans {
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}
