pub mod message;
pub mod session;
pub mod tree;

pub use message::*;
pub use session::*;
pub use tree::*;

/// Application hook run by every node before it commits to a proposal.
/// Returning `false` puts the node on the signature's exception list
/// instead of aborting the round.
pub trait ProposalVerifier: Send + Sync {
    fn verify(&self, msg: &[u8], data: Option<&LinkProposal>) -> bool;
}

/// Signs everything. Useful for tests and for plain collective signing
/// without chain semantics.
pub struct AcceptAll;

impl ProposalVerifier for AcceptAll {
    fn verify(&self, _msg: &[u8], _data: Option<&LinkProposal>) -> bool {
        true
    }
}
