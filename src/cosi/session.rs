use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use curve25519_dalek::scalar::Scalar;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::common::{
    challenge, reduced_aggregate, CollectiveSignature, Keypair, NodeId, Nonce, Policy, Roster,
};
use crate::config::Config;
use crate::cosi::message::{
    Announce, Challenge, Commitment, CosiMessage, LinkProposal, Response, Round, SessionId,
};
use crate::cosi::tree::Tree;
use crate::cosi::ProposalVerifier;
use crate::error::{Result, SkipchainError};
use crate::network::{Envelope, LocalNetwork};

/*
    One signing round walks the protocol tree twice. The root announces
    the proposal to its subleaders, who fan it out to their leaves. Every
    member that endorses the proposal draws a nonce and sends its
    commitment up; refusals and silent leaves travel up as exception
    indices instead. The root aggregates, derives the challenge and sends
    it back down to the committed subtrees; the responses come back up and
    sum into the final signature.

    A silent subleader is replaced mid-round: the root promotes one of its
    leaves and replays the announcement. A member that committed but does
    not answer the challenge cannot be replaced, because its nonce is part
    of the aggregate; that failure aborts the round.
*/

type SessionSender = mpsc::Sender<(NodeId, CosiMessage)>;

/// Routing table from session id to the task driving that session on
/// this node. Registering an id again supersedes the previous task,
/// which sees its channel close and winds down quietly.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<SessionId, SessionSender>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        session: SessionId,
        capacity: usize,
    ) -> mpsc::Receiver<(NodeId, CosiMessage)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(session, tx);
        }
        rx
    }

    pub fn remove(&self, session: SessionId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remove(&session);
        }
    }

    /// Drop the entry unless a newer task has taken the id over.
    pub fn remove_closed(&self, session: SessionId) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.get(&session).is_some_and(|s| s.is_closed()) {
                inner.remove(&session);
            }
        }
    }

    /// Deliver a message to the task driving this session. Returns false
    /// when nobody is listening.
    pub async fn route(&self, session: SessionId, from: NodeId, msg: CosiMessage) -> bool {
        let sender = self
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(&session).cloned());
        match sender {
            Some(sender) => sender.send((from, msg)).await.is_ok(),
            None => false,
        }
    }
}

/// Everything a protocol task needs about the node it runs on.
#[derive(Clone)]
pub struct ProtocolContext {
    pub network: LocalNetwork,
    pub sessions: SessionTable,
    pub keypair: Arc<Keypair>,
    pub node_id: NodeId,
    pub verifier: Arc<dyn ProposalVerifier>,
    pub config: Config,
}

impl ProtocolContext {
    async fn send_cosi(&self, to: NodeId, session: SessionId, msg: CosiMessage) -> Result<()> {
        self.network
            .send(
                to,
                Envelope::Cosi {
                    session,
                    from: self.node_id,
                    msg,
                },
            )
            .await
    }
}

enum SubtreeState {
    Waiting { retries: usize },
    Committed(Commitment),
    Dead,
}

/// Drive one signing round as the tree root. Returns the aggregate
/// signature over `msg`; members that refused or stayed silent are
/// carried as exceptions. In the commit round `prepare` must hold the
/// prepare-round signature so members can check quorum before signing.
pub async fn run_root(
    ctx: &ProtocolContext,
    roster: &Roster,
    round: Round,
    msg: Vec<u8>,
    data: Option<LinkProposal>,
    prepare: Option<CollectiveSignature>,
) -> Result<CollectiveSignature> {
    let own_index = roster
        .index_of(&ctx.keypair.public())
        .ok_or(SkipchainError::NotInRoster)?;
    if !ctx.verifier.verify(&msg, data.as_ref()) {
        return Err(SkipchainError::VerificationFailed(
            "own verifier refused the proposal".into(),
        ));
    }

    let publics = roster.publics();
    let nonce = Nonce::generate();

    if roster.len() == 1 {
        let aggregate = reduced_aggregate(&publics, &[])?;
        let c = challenge(&nonce.commitment, &aggregate, round.tag(), &msg);
        let sig = CollectiveSignature {
            commitment: nonce.commitment,
            response: ctx.keypair.respond(&nonce, &c),
            exceptions: vec![],
        };
        sig.verify(&publics, round.tag(), &msg)?;
        return Ok(sig);
    }

    let session: SessionId = rand::random();
    let rx = ctx.sessions.register(session, roster.len());
    let result = root_session(
        ctx, roster, round, &msg, data, prepare, own_index, nonce, session, rx,
    )
    .await;
    ctx.sessions.remove(session);
    result
}

#[allow(clippy::too_many_arguments)]
async fn root_session(
    ctx: &ProtocolContext,
    roster: &Roster,
    round: Round,
    msg: &[u8],
    data: Option<LinkProposal>,
    prepare: Option<CollectiveSignature>,
    own_index: usize,
    nonce: Nonce,
    session: SessionId,
    mut rx: mpsc::Receiver<(NodeId, CosiMessage)>,
) -> Result<CollectiveSignature> {
    let mut tree = Tree::new(roster.len(), own_index, ctx.config.n_subtrees)?;
    let publics = roster.publics();

    for subtree in &tree.subtrees {
        if let Err(e) = announce_subtree(ctx, roster, session, round, msg, &data, subtree).await {
            warn!(subleader = subtree.subleader, "announce: {}", e);
        }
    }

    // Commitment phase. Silent subleaders are regenerated at every
    // deadline until their retries run out.
    let mut states: Vec<SubtreeState> = tree
        .subtrees
        .iter()
        .map(|_| SubtreeState::Waiting { retries: 0 })
        .collect();
    let mut deadline = Instant::now() + ctx.config.subleader_timeout;
    while states
        .iter()
        .any(|s| matches!(s, SubtreeState::Waiting { .. }))
    {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((from, CosiMessage::Commitment(commitment)))) => {
                if commitment.round != round {
                    continue;
                }
                let found = tree
                    .subtrees
                    .iter()
                    .position(|s| roster.get(s.subleader).map(|m| m.id).ok() == Some(from));
                if let Some(i) = found {
                    if matches!(states[i], SubtreeState::Waiting { .. }) {
                        states[i] = SubtreeState::Committed(commitment);
                    }
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Err(SkipchainError::Transport("session channel closed".into())),
            Err(_) => {
                for i in 0..tree.subtrees.len() {
                    let retries = match &states[i] {
                        SubtreeState::Waiting { retries } => *retries,
                        _ => continue,
                    };
                    if retries >= ctx.config.max_subleader_retries {
                        states[i] = SubtreeState::Dead;
                        continue;
                    }
                    match tree.regenerate(i) {
                        Some(promoted) => {
                            warn!(subtree = i, promoted, "subleader silent, promoting leaf");
                            states[i] = SubtreeState::Waiting {
                                retries: retries + 1,
                            };
                            let subtree = &tree.subtrees[i];
                            if let Err(e) =
                                announce_subtree(ctx, roster, session, round, msg, &data, subtree)
                                    .await
                            {
                                warn!(subleader = subtree.subleader, "announce: {}", e);
                            }
                        }
                        None => states[i] = SubtreeState::Dead,
                    }
                }
                deadline = Instant::now() + ctx.config.subleader_timeout;
            }
        }
    }

    // Aggregate commitments; everything that did not commit becomes an
    // exception.
    let mut commitment = nonce.commitment;
    let mut exceptions: Vec<usize> = vec![];
    let mut live: Vec<usize> = vec![];
    for (i, state) in states.iter().enumerate() {
        match state {
            SubtreeState::Committed(c) => {
                exceptions.extend(&c.exceptions);
                if let Some(point) = c.commitment {
                    commitment += point;
                    live.push(i);
                }
            }
            SubtreeState::Dead | SubtreeState::Waiting { .. } => {
                exceptions.extend(tree.subtree_members(i));
            }
        }
    }
    exceptions.sort_unstable();
    exceptions.dedup();
    debug!(
        session,
        ?round,
        exceptions = exceptions.len(),
        "commitment phase done"
    );

    let aggregate = reduced_aggregate(&publics, &exceptions)?;
    let c = challenge(&commitment, &aggregate, round.tag(), msg);
    for &i in &live {
        let to = roster.get(tree.subtrees[i].subleader)?.id;
        ctx.send_cosi(
            to,
            session,
            CosiMessage::Challenge(Challenge {
                round,
                challenge: c,
                prepare: prepare.clone(),
            }),
        )
        .await?;
    }

    // Response phase. A committed subtree that stays silent now takes its
    // nonce with it, so there is nothing left to do but abort.
    let mut response = ctx.keypair.respond(&nonce, &c);
    let mut waiting = live;
    let deadline = Instant::now() + ctx.config.round_timeout;
    while !waiting.is_empty() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((from, CosiMessage::Response(r)))) => {
                if r.round != round {
                    continue;
                }
                let found = waiting.iter().position(|&i| {
                    roster.get(tree.subtrees[i].subleader).map(|m| m.id).ok() == Some(from)
                });
                if let Some(pos) = found {
                    waiting.swap_remove(pos);
                    response += r.response;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Err(SkipchainError::Transport("session channel closed".into())),
            Err(_) => return Err(SkipchainError::Timeout("response phase")),
        }
    }

    let sig = CollectiveSignature {
        commitment,
        response,
        exceptions,
    };
    sig.verify(&publics, round.tag(), msg)?;
    Ok(sig)
}

async fn announce_subtree(
    ctx: &ProtocolContext,
    roster: &Roster,
    session: SessionId,
    round: Round,
    msg: &[u8],
    data: &Option<LinkProposal>,
    subtree: &crate::cosi::tree::Subtree,
) -> Result<()> {
    let announce = Announce {
        round,
        msg: msg.to_vec(),
        data: data.clone(),
        roster: roster.clone(),
        leaves: subtree.leaves.clone(),
        leaf_timeout: ctx.config.leaf_timeout,
    };
    let to = roster.get(subtree.subleader)?.id;
    ctx.send_cosi(to, session, CosiMessage::Announce(announce))
        .await
}

/// Drive one signing round as a subleader or leaf, depending on the
/// announcement. The caller registers the session and hands the receiver
/// over; a superseded task (its receiver replaced by a newer
/// registration) returns quietly.
pub async fn run_member(
    ctx: &ProtocolContext,
    session: SessionId,
    announce: Announce,
    parent: NodeId,
    mut rx: mpsc::Receiver<(NodeId, CosiMessage)>,
) -> Result<()> {
    let result = member_session(ctx, session, &announce, parent, &mut rx).await;
    drop(rx);
    ctx.sessions.remove_closed(session);
    result
}

async fn member_session(
    ctx: &ProtocolContext,
    session: SessionId,
    announce: &Announce,
    parent: NodeId,
    rx: &mut mpsc::Receiver<(NodeId, CosiMessage)>,
) -> Result<()> {
    let roster = &announce.roster;
    let own_index = roster
        .index_of(&ctx.keypair.public())
        .ok_or(SkipchainError::NotInRoster)?;
    let accepted = ctx
        .verifier
        .verify(&announce.msg, announce.data.as_ref());
    let round = announce.round;

    if announce.leaves.is_empty() {
        return leaf_session(ctx, session, announce, parent, rx, own_index, accepted).await;
    }

    // Subleader: fan the announcement out and aggregate the subtree.
    for &leaf in &announce.leaves {
        let forwarded = Announce {
            leaves: vec![],
            ..announce.clone()
        };
        let to = roster.get(leaf)?.id;
        if let Err(e) = ctx
            .send_cosi(to, session, CosiMessage::Announce(forwarded))
            .await
        {
            warn!(leaf, "forwarding announce: {}", e);
        }
    }

    let nonce = accepted.then(Nonce::generate);
    let mut commitment = nonce.as_ref().map(|n| n.commitment);
    let mut exceptions: Vec<usize> = if accepted { vec![] } else { vec![own_index] };
    let mut contributors: Vec<usize> = vec![];
    let mut waiting = announce.leaves.clone();
    let deadline = Instant::now() + announce.leaf_timeout;
    while !waiting.is_empty() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((from, CosiMessage::Commitment(c)))) => {
                if c.round != round {
                    continue;
                }
                let found = waiting
                    .iter()
                    .position(|&l| roster.get(l).map(|m| m.id).ok() == Some(from));
                let Some(pos) = found else { continue };
                let leaf = waiting.swap_remove(pos);
                match c.commitment {
                    Some(point) => {
                        commitment = Some(commitment.map_or(point, |acc| acc + point));
                        contributors.push(leaf);
                        exceptions.extend(c.exceptions);
                    }
                    None => exceptions.extend(c.exceptions),
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(()),
            Err(_) => break,
        }
    }
    exceptions.extend(&waiting);
    exceptions.sort_unstable();
    exceptions.dedup();

    ctx.send_cosi(
        parent,
        session,
        CosiMessage::Commitment(Commitment {
            round,
            commitment,
            exceptions: exceptions.clone(),
        }),
    )
    .await?;
    if commitment.is_none() {
        // Nobody in the subtree committed; no challenge will come.
        return Ok(());
    }

    let Some(ch) = wait_for_challenge(rx, round, ctx).await? else {
        return Ok(());
    };
    check_prepare(&ch, roster, &announce.msg)?;
    for &leaf in &contributors {
        ctx.send_cosi(
            roster.get(leaf)?.id,
            session,
            CosiMessage::Challenge(ch.clone()),
        )
        .await?;
    }

    let mut response = match &nonce {
        Some(nonce) => ctx.keypair.respond(nonce, &ch.challenge),
        None => Scalar::ZERO,
    };
    let mut waiting = contributors;
    let deadline = Instant::now() + ctx.config.round_timeout;
    while !waiting.is_empty() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((from, CosiMessage::Response(r)))) => {
                if r.round != round {
                    continue;
                }
                let found = waiting
                    .iter()
                    .position(|&l| roster.get(l).map(|m| m.id).ok() == Some(from));
                if let Some(pos) = found {
                    waiting.swap_remove(pos);
                    response += r.response;
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(()),
            Err(_) => return Err(SkipchainError::Timeout("leaf response")),
        }
    }

    ctx.send_cosi(
        parent,
        session,
        CosiMessage::Response(Response {
            round,
            response,
            exceptions,
        }),
    )
    .await
}

async fn leaf_session(
    ctx: &ProtocolContext,
    session: SessionId,
    announce: &Announce,
    parent: NodeId,
    rx: &mut mpsc::Receiver<(NodeId, CosiMessage)>,
    own_index: usize,
    accepted: bool,
) -> Result<()> {
    let round = announce.round;
    if !accepted {
        debug!(session, index = own_index, "refusing proposal");
        return ctx
            .send_cosi(
                parent,
                session,
                CosiMessage::Commitment(Commitment {
                    round,
                    commitment: None,
                    exceptions: vec![own_index],
                }),
            )
            .await;
    }

    let nonce = Nonce::generate();
    ctx.send_cosi(
        parent,
        session,
        CosiMessage::Commitment(Commitment {
            round,
            commitment: Some(nonce.commitment),
            exceptions: vec![],
        }),
    )
    .await?;

    let Some(ch) = wait_for_challenge(rx, round, ctx).await? else {
        return Ok(());
    };
    check_prepare(&ch, &announce.roster, &announce.msg)?;
    ctx.send_cosi(
        parent,
        session,
        CosiMessage::Response(Response {
            round,
            response: ctx.keypair.respond(&nonce, &ch.challenge),
            exceptions: vec![],
        }),
    )
    .await
}

/// Wait for this round's challenge. `Ok(None)` means the session was
/// superseded and the caller should wind down without a fuss.
async fn wait_for_challenge(
    rx: &mut mpsc::Receiver<(NodeId, CosiMessage)>,
    round: Round,
    ctx: &ProtocolContext,
) -> Result<Option<Challenge>> {
    let deadline = Instant::now() + ctx.config.round_timeout;
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((_, CosiMessage::Challenge(ch)))) if ch.round == round => {
                return Ok(Some(ch));
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(None),
            Err(_) => return Err(SkipchainError::Timeout("challenge")),
        }
    }
}

/// Members only sign the commit round after seeing proof that the
/// prepare round reached quorum over the same proposal.
fn check_prepare(ch: &Challenge, roster: &Roster, msg: &[u8]) -> Result<()> {
    if ch.round != Round::Commit {
        return Ok(());
    }
    let prepare = ch.prepare.as_ref().ok_or_else(|| {
        SkipchainError::VerificationFailed("commit challenge without prepare signature".into())
    })?;
    prepare.verify_with_policy(
        &roster.publics(),
        crate::bft::PREPARE_TAG,
        msg,
        Policy::Threshold(crate::bft::max_faulty(roster.len())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeIdentity;
    use crate::cosi::AcceptAll;
    use std::time::Duration;

    struct RefuseAll;

    impl ProposalVerifier for RefuseAll {
        fn verify(&self, _msg: &[u8], _data: Option<&LinkProposal>) -> bool {
            false
        }
    }

    fn test_config() -> Config {
        Config {
            round_timeout: Duration::from_millis(2000),
            subleader_timeout: Duration::from_millis(500),
            leaf_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn make_ctx(
        network: &LocalNetwork,
        keypair: Arc<Keypair>,
        node_id: NodeId,
        verifier: Arc<dyn ProposalVerifier>,
    ) -> ProtocolContext {
        ProtocolContext {
            network: network.clone(),
            sessions: SessionTable::new(),
            keypair,
            node_id,
            verifier,
            config: test_config(),
        }
    }

    /// Run the member side of the protocol for one node, the way the
    /// service event loop does it.
    fn spawn_member(ctx: ProtocolContext) {
        let mut inbox = ctx.network.register(ctx.node_id);
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let Envelope::Cosi { session, from, msg } = envelope else {
                    continue;
                };
                match msg {
                    CosiMessage::Announce(announce) => {
                        let rx = ctx.sessions.register(session, announce.roster.len());
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _ = run_member(&ctx, session, announce, from, rx).await;
                        });
                    }
                    other => {
                        ctx.sessions.route(session, from, other).await;
                    }
                }
            }
        });
    }

    /// Pump the root's inbox into its session table.
    fn spawn_router(ctx: &ProtocolContext) {
        let mut inbox = ctx.network.register(ctx.node_id);
        let sessions = ctx.sessions.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Envelope::Cosi { session, from, msg } = envelope {
                    sessions.route(session, from, msg).await;
                }
            }
        });
    }

    /// `n` nodes, node 0 as root; nodes in `refusing` reject every
    /// proposal, nodes in `silent` are not wired up at all.
    fn setup(n: usize, refusing: &[usize], silent: &[usize]) -> (ProtocolContext, Roster) {
        let network = LocalNetwork::new();
        let keypairs: Vec<Arc<Keypair>> = (0..n).map(|_| Arc::new(Keypair::generate())).collect();
        let roster = Roster::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(id, k)| NodeIdentity {
                    id,
                    public: k.public(),
                })
                .collect(),
        );

        for id in 1..n {
            if silent.contains(&id) {
                continue;
            }
            let verifier: Arc<dyn ProposalVerifier> = if refusing.contains(&id) {
                Arc::new(RefuseAll)
            } else {
                Arc::new(AcceptAll)
            };
            spawn_member(make_ctx(&network, keypairs[id].clone(), id, verifier));
        }

        let root = make_ctx(&network, keypairs[0].clone(), 0, Arc::new(AcceptAll));
        spawn_router(&root);
        (root, roster)
    }

    #[tokio::test]
    async fn test_full_roster_signs() {
        let (ctx, roster) = setup(5, &[], &[]);
        let sig = run_root(&ctx, &roster, Round::Prepare, b"proposal".to_vec(), None, None)
            .await
            .unwrap();
        assert!(sig.exceptions.is_empty());
        assert!(sig
            .verify(&roster.publics(), Round::Prepare.tag(), b"proposal")
            .is_ok());
    }

    #[tokio::test]
    async fn test_single_node_signs_alone() {
        let (ctx, roster) = setup(1, &[], &[]);
        let sig = run_root(&ctx, &roster, Round::Commit, b"solo".to_vec(), None, None)
            .await
            .unwrap();
        assert!(sig
            .verify(&roster.publics(), Round::Commit.tag(), b"solo")
            .is_ok());
    }

    #[tokio::test]
    async fn test_refusals_become_exceptions() {
        let (ctx, roster) = setup(7, &[2, 5], &[]);
        let sig = run_root(&ctx, &roster, Round::Prepare, b"proposal".to_vec(), None, None)
            .await
            .unwrap();
        assert_eq!(sig.exceptions, vec![2, 5]);
        assert!(sig
            .verify_with_policy(
                &roster.publics(),
                Round::Prepare.tag(),
                b"proposal",
                Policy::Threshold(2)
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_silent_leaf_is_excepted() {
        let (ctx, roster) = setup(4, &[], &[3]);
        let sig = run_root(&ctx, &roster, Round::Prepare, b"proposal".to_vec(), None, None)
            .await
            .unwrap();
        assert_eq!(sig.exceptions, vec![3]);
        assert!(sig
            .verify(&roster.publics(), Round::Prepare.tag(), b"proposal")
            .is_ok());
    }

    #[tokio::test]
    async fn test_silent_subleader_is_replaced() {
        // Force a single subtree so node 1 starts as its subleader.
        let (mut ctx, roster) = setup(5, &[], &[1]);
        ctx.config.n_subtrees = 1;
        let sig = run_root(&ctx, &roster, Round::Prepare, b"proposal".to_vec(), None, None)
            .await
            .unwrap();
        assert_eq!(sig.exceptions, vec![1]);
        assert!(sig
            .verify(&roster.publics(), Round::Prepare.tag(), b"proposal")
            .is_ok());
    }

    #[tokio::test]
    async fn test_root_refusal_aborts() {
        let (mut ctx, roster) = setup(3, &[], &[]);
        ctx.verifier = Arc::new(RefuseAll);
        let err = run_root(&ctx, &roster, Round::Prepare, b"proposal".to_vec(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SkipchainError::VerificationFailed(_)));
    }
}
