use thiserror::Error;

use crate::service::VerifierKind;

/// Errors surfaced by the skipchain core. Parameter, not-found and conflict
/// errors are returned before any network round-trip; signing failures are
/// reported as either `InvalidSignature` (a signature that exists but does
/// not check out) or `NoQuorum` (too many nodes refused or stayed silent).
#[derive(Debug, Error)]
pub enum SkipchainError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("this chain is already processing a block")]
    BlockInProgress,

    #[error("the previous block already has a forward-link at this height")]
    ForwardLinkExists,

    #[error("this node is not a member of the required roster")]
    NotInRoster,

    #[error("verifier {0:?} rejected the block")]
    VerifierRefused(VerifierKind),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid collective signature: {0}")]
    InvalidSignature(String),

    #[error("no quorum reached: {0}")]
    NoQuorum(String),

    #[error("timeout while waiting for {0}")]
    Timeout(&'static str),

    #[error("transport failure: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SkipchainError>;
