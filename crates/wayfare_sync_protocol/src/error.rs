//! Error types for protocol validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when data fails validation at a boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An entity snapshot does not satisfy its schema.
    #[error("invalid {entity}: {reason}")]
    InvalidEntity {
        /// Entity description (type and id).
        entity: String,
        /// What is wrong.
        reason: String,
    },

    /// A pulled page is inconsistent with its request.
    #[error("invalid pull page: {0}")]
    InvalidPage(String),

    /// A push acknowledgement is malformed.
    #[error("invalid push acknowledgement: {0}")]
    InvalidAck(String),

    /// Unknown entity type name.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Unparseable identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
