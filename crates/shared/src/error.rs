use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a persistence gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },
    #[error("constraint violation: {message}")]
    Constraint { message: String },
    #[error("store backend failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Why a bulk-import record was excluded from the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing type or name for control {label}")]
    MissingTypeOrName { label: String },
    #[error("missing id for control {label}")]
    MissingId { label: String },
}

/// Store holds more controls than memory accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("store reports {store_count} controls but memory holds {memory_count} (tolerance {tolerance})")]
pub struct ConsistencyDrift {
    pub store_count: usize,
    pub memory_count: usize,
    pub tolerance: usize,
}

impl ConsistencyDrift {
    /// Returns a drift only when the store exceeds memory by more than `tolerance`.
    pub fn detect(store_count: usize, memory_count: usize, tolerance: usize) -> Option<Self> {
        (store_count > memory_count.saturating_add(tolerance)).then_some(Self {
            store_count,
            memory_count,
            tolerance,
        })
    }
}
