//! Domain errors
//!
//! Pure domain errors with no infrastructure dependencies

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Invalid proposal id: {0}")]
    InvalidProposalId(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
