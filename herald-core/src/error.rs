use thiserror::Error;

use crate::ranking::FormulaError;
use crate::types::EntityId;

#[derive(Error, Debug)]
pub enum HeraldError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid ranking formula: {0}")]
    Formula(#[from] FormulaError),

    #[error("Invalid job spec: {0}")]
    JobSpec(String),

    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Entity gone: {0}")]
    EntityGone(EntityId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HeraldError {
    /// Wraps a failure of an external collaborator (bus, cache, database).
    pub fn unavailable(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            service,
            message: err.to_string(),
        }
    }

    /// Infrastructure failures the loop logs and rides out.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::ResourceExhausted(_))
    }

    /// Input rejected synchronously, before any state changed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Formula(_) | Self::JobSpec(_)
        )
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::EntityGone(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, HeraldError>;
