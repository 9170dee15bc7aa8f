use tracing::debug;

use crate::common::{CollectiveSignature, Policy, Roster};
use crate::cosi::{run_root, LinkProposal, ProtocolContext, Round};
use crate::error::{Result, SkipchainError};

/*
    Byzantine agreement as two collective-signature rounds over the same
    proposal. The prepare round collects commitments to the proposal; if
    no more than a third of the roster stayed out, the prepare signature
    is proof of quorum and rides along in the commit round's challenge,
    where every member re-checks it before signing for good. Only the
    commit-round signature ends up in a forward-link.
*/

pub const PREPARE_TAG: &[u8] = b"skipchain.bft.prepare";
pub const COMMIT_TAG: &[u8] = b"skipchain.bft.commit";

/// Largest number of faulty members a roster of `n` tolerates.
pub fn max_faulty(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        (n - 1) / 3
    }
}

/// Run both rounds as the leader. Fails with `NoQuorum` when more than
/// `max_faulty` members refuse the prepare round, and with the usual
/// protocol errors when a round cannot complete.
pub async fn run(
    ctx: &ProtocolContext,
    roster: &Roster,
    msg: Vec<u8>,
    data: Option<LinkProposal>,
) -> Result<CollectiveSignature> {
    let threshold = Policy::Threshold(max_faulty(roster.len()));

    let prepare = run_root(ctx, roster, Round::Prepare, msg.clone(), data.clone(), None).await?;
    prepare
        .verify_with_policy(&roster.publics(), PREPARE_TAG, &msg, threshold)
        .map_err(|e| match e {
            SkipchainError::NoQuorum(s) => SkipchainError::NoQuorum(s),
            other => SkipchainError::VerificationFailed(format!("prepare round: {}", other)),
        })?;
    debug!(
        exceptions = prepare.exceptions.len(),
        roster = roster.len(),
        "prepare round reached quorum"
    );

    let commit = run_root(
        ctx,
        roster,
        Round::Commit,
        msg.clone(),
        data,
        Some(prepare),
    )
    .await?;
    commit.verify_with_policy(&roster.publics(), COMMIT_TAG, &msg, threshold)?;
    Ok(commit)
}
