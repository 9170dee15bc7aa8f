use std::time::Duration;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;

use crate::common::{BlockId, CollectiveSignature, Roster};
use crate::skiplist::SkipBlock;

/// Identifies one run of the protocol tree. Every node keeps a routing
/// table from session id to the task driving that session.
pub type SessionId = u64;

/// The two signing rounds of one consensus run. The tag feeds the
/// challenge hash so a prepare signature can never be replayed as a
/// commit signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Round {
    Prepare,
    Commit,
}

impl Round {
    pub fn tag(&self) -> &'static [u8] {
        match self {
            Round::Prepare => crate::bft::PREPARE_TAG,
            Round::Commit => crate::bft::COMMIT_TAG,
        }
    }
}

/// What a signing round is actually about: a forward-link from `previous`
/// to `newest`, at the given level. Carried alongside the raw message so
/// members can verify the proposal against their own view of the chain.
#[derive(Clone, Debug)]
pub struct LinkProposal {
    pub target_height: usize,
    pub previous: BlockId,
    pub newest: SkipBlock,
}

#[derive(Clone, Debug)]
pub enum CosiMessage {
    Announce(Announce),
    Commitment(Commitment),
    Challenge(Challenge),
    Response(Response),
}

/// Sent down the tree by the root. A subleader receives the roster
/// indices of its leaves; a leaf receives an empty list.
#[derive(Clone, Debug)]
pub struct Announce {
    pub round: Round,
    pub msg: Vec<u8>,
    pub data: Option<LinkProposal>,
    pub roster: Roster,
    pub leaves: Vec<usize>,
    pub leaf_timeout: Duration,
}

/// Sent up the tree. `commitment` is the aggregate of the subtree; `None`
/// means nobody in the subtree endorsed the proposal. The exceptions list
/// the roster indices that did not contribute.
#[derive(Clone, Debug)]
pub struct Commitment {
    pub round: Round,
    pub commitment: Option<RistrettoPoint>,
    pub exceptions: Vec<usize>,
}

/// Sent down the tree once the root has aggregated all commitments. In
/// the commit round it carries the prepare-round signature so every
/// member can check the proposal reached quorum before signing again.
#[derive(Clone, Debug)]
pub struct Challenge {
    pub round: Round,
    pub challenge: Scalar,
    pub prepare: Option<CollectiveSignature>,
}

/// Final leg, up the tree. The exceptions must repeat the ones announced
/// with the commitment.
#[derive(Clone, Debug)]
pub struct Response {
    pub round: Round,
    pub response: Scalar,
    pub exceptions: Vec<usize>,
}
