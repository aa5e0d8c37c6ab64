//! Domain error types.

use std::fmt;

/// Which kind of record a [`BlocktraderError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Strategy,
    Block,
    Condition,
    Action,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Strategy => "strategy",
            Entity::Block => "block",
            Entity::Condition => "condition",
            Entity::Action => "action",
        };
        f.write_str(name)
    }
}

/// Top-level error type for blocktrader.
#[derive(Debug, thiserror::Error)]
pub enum BlocktraderError {
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: String },

    #[error("parent block {parent_id} not found")]
    ParentNotFound { parent_id: String },

    #[error("invalid payload field {field}: {reason}")]
    InvalidPayload { field: String, reason: String },

    #[error("strategy {strategy_id} already has a root block")]
    AlreadyInitialized { strategy_id: String },

    #[error("block {block_id} is the root of its strategy and cannot be deleted")]
    RootDeletionForbidden { block_id: String },

    #[error("moving block {block_id} under {new_parent_id} would create a cycle")]
    CycleRejected {
        block_id: String,
        new_parent_id: String,
    },

    #[error("field {field} cannot be changed on block {block_id}")]
    Immutable { block_id: String, field: String },

    /// Structural violation found while materializing. Always a defect in the
    /// mutation layer or an out-of-band edit; the reason is logged, not shown.
    #[error("internal consistency fault in strategy {strategy_id}")]
    CorruptTree { strategy_id: String, reason: String },

    #[error("strategy {strategy_id} is being modified concurrently; gave up after {attempts} attempts")]
    Conflict { strategy_id: String, attempts: u32 },

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BlocktraderError {
    pub fn not_found(entity: Entity, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(strategy_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::CorruptTree {
            strategy_id: strategy_id.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input. These are returned as-is
    /// and never retried.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::ParentNotFound { .. }
                | Self::InvalidPayload { .. }
                | Self::AlreadyInitialized { .. }
                | Self::RootDeletionForbidden { .. }
                | Self::CycleRejected { .. }
                | Self::Immutable { .. }
        )
    }
}

impl From<serde_json::Error> for BlocktraderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<&BlocktraderError> for std::process::ExitCode {
    fn from(err: &BlocktraderError) -> Self {
        let code: u8 = match err {
            BlocktraderError::Io(_) | BlocktraderError::Serialization { .. } => 1,
            BlocktraderError::ConfigParse { .. }
            | BlocktraderError::ConfigMissing { .. }
            | BlocktraderError::ConfigInvalid { .. } => 2,
            BlocktraderError::Database { .. }
            | BlocktraderError::DatabaseQuery { .. }
            | BlocktraderError::Conflict { .. } => 3,
            BlocktraderError::NotFound { .. } | BlocktraderError::ParentNotFound { .. } => 4,
            BlocktraderError::InvalidPayload { .. }
            | BlocktraderError::AlreadyInitialized { .. }
            | BlocktraderError::RootDeletionForbidden { .. }
            | BlocktraderError::CycleRejected { .. }
            | BlocktraderError::Immutable { .. } => 5,
            BlocktraderError::CorruptTree { .. } => 70,
        };
        std::process::ExitCode::from(code)
    }
}
