use tracing::{info, warn};

use crate::common::{BlockId, Roster};
use crate::cosi::LinkProposal;
use crate::error::{Result, SkipchainError};
use crate::network::ServiceMessage;
use crate::service::node::NodeHandle;
use crate::service::registry::{ChainView, VerifierKind};
use crate::skiplist::{compute_height, ChainProof, ForwardLink, SkipBlock};

/*
    The append path. A new chain starts from a locally built genesis
    block, which needs no signature: its hash is the chain's identity and
    every later block is tied to it. Extending a chain is the expensive
    part: the previous block's roster must collectively sign the level-0
    forward-link before the block exists, and afterwards the taller
    blocks in the new block's back-links each get their own signing round
    for the higher-level shortcuts. Failing to land a shortcut only costs
    traversal speed, so those rounds are best-effort.
*/

/// Everything the caller decides about a new chain.
#[derive(Clone, Debug)]
pub struct BlockProposal {
    pub roster: Roster,
    pub payload: Vec<u8>,
    pub max_height: usize,
    pub base_height: usize,
    pub verifiers: Vec<VerifierKind>,
    pub parent_id: Option<BlockId>,
}

#[derive(Clone, Debug)]
pub struct StoreBlockReply {
    /// The extended block, now carrying its level-0 forward-link.
    pub previous: SkipBlock,
    /// The freshly appended block.
    pub latest: SkipBlock,
}

impl NodeHandle {
    /// Start a new skipchain. The genesis block fixes the chain settings
    /// for good; a random back-link keeps two chains with identical
    /// settings from colliding on the same id.
    pub async fn create_genesis(&self, proposal: BlockProposal) -> Result<SkipBlock> {
        if proposal.base_height < 1 || proposal.max_height < 1 {
            return Err(SkipchainError::InvalidParameters(
                "base and maximum height must be at least 1".into(),
            ));
        }
        if proposal.max_height > proposal.base_height {
            return Err(SkipchainError::InvalidParameters(
                "maximum height cannot exceed the base height".into(),
            ));
        }
        if proposal.roster.is_empty() {
            return Err(SkipchainError::InvalidParameters("empty roster".into()));
        }
        if !proposal.roster.contains(&self.keypair.public()) {
            return Err(SkipchainError::NotInRoster);
        }

        let mut genesis = SkipBlock {
            index: 0,
            height: proposal.max_height,
            max_height: proposal.max_height,
            base_height: proposal.base_height,
            back_links: vec![BlockId::random()],
            verifiers: proposal.verifiers,
            genesis_id: BlockId::NULL,
            parent_id: proposal.parent_id,
            payload: proposal.payload,
            roster: proposal.roster,
            hash: BlockId::NULL,
            forward_links: vec![],
            child_links: vec![],
        };
        genesis.update_hash();
        self.store.store(genesis.clone())?;
        info!(chain = %genesis.hash, "created genesis block");

        if let Some(parent_id) = genesis.parent_id {
            self.link_child(&parent_id, genesis.hash).await;
        }

        self.propagate(&[&genesis.roster], vec![genesis.clone()])
            .await;
        Ok(genesis)
    }

    /// Append a block after `latest`. Runs the consensus rounds with the
    /// previous block's roster and, on success, chases the higher-level
    /// shortcut links. Returns the updated previous block and the new
    /// one.
    pub async fn store_block(
        &self,
        latest: BlockId,
        payload: Vec<u8>,
        new_roster: Option<Roster>,
    ) -> Result<StoreBlockReply> {
        let previous = self
            .store
            .get_block(&latest)
            .ok_or_else(|| SkipchainError::BlockNotFound(latest.short()))?;
        if !previous.roster.contains(&self.keypair.public()) {
            return Err(SkipchainError::NotInRoster);
        }
        let _guard = self.store.begin_append(previous.hash)?;
        if previous.has_forward(0) {
            return Err(SkipchainError::ForwardLinkExists);
        }
        let chain = previous.skipchain_id();

        let index = previous.index + 1;
        let height = compute_height(index, previous.base_height, previous.max_height);
        let back_links = self
            .store
            .with_bunch(&chain, |bunch| bunch.back_links_for(&previous, height))??;

        let mut block = SkipBlock {
            index,
            height,
            max_height: previous.max_height,
            base_height: previous.base_height,
            back_links,
            verifiers: previous.verifiers.clone(),
            genesis_id: chain,
            parent_id: previous.parent_id,
            payload,
            roster: new_roster.unwrap_or_else(|| previous.roster.clone()),
            hash: BlockId::NULL,
            forward_links: vec![],
            child_links: vec![],
        };
        block.update_hash();

        // Check our own verifiers before bothering the roster.
        let view = ChainView {
            previous: &previous,
            store: self.store.as_ref(),
        };
        self.registry.run(&block.verifiers, &view, &block)?;

        let link = self
            .sign_link(LinkProposal {
                target_height: 0,
                previous: previous.hash,
                newest: block.clone(),
            })
            .await?;

        // Attach under the bunch lock so a racing append cannot slip a
        // second level-0 link onto the same block.
        let previous = self.store.with_bunch(&chain, |bunch| -> Result<SkipBlock> {
            let mut prev = bunch
                .get(&previous.hash)
                .cloned()
                .ok_or_else(|| SkipchainError::BlockNotFound(previous.hash.short()))?;
            prev.add_forward_link(link, 0)?;
            bunch.store(block.clone())?;
            bunch.store(prev.clone())?;
            Ok(prev)
        })??;
        info!(chain = %chain, index, block = %block.hash, "appended block");
        self.propagate(
            &[&previous.roster, &block.roster],
            vec![previous.clone(), block.clone()],
        )
        .await;

        for level in 1..height {
            if let Err(e) = self.shortcut_link(&chain, &block, level).await {
                warn!(level, "shortcut link not created: {}", e);
            }
        }

        let latest = self
            .store
            .get_block(&block.hash)
            .unwrap_or(block);
        Ok(StoreBlockReply { previous, latest })
    }

    /// Create and attach the level-`level` forward-link from the block
    /// named in the new block's back-links. Runs the signing round
    /// locally when this node sits in the target's roster, otherwise
    /// delegates to a member.
    async fn shortcut_link(&self, chain: &BlockId, block: &SkipBlock, level: usize) -> Result<()> {
        let target_id = block.back_links[level];
        let target = self
            .store
            .get_block(&target_id)
            .ok_or_else(|| SkipchainError::BlockNotFound(target_id.short()))?;
        if target.has_forward(level) {
            return Ok(());
        }

        let proposal = LinkProposal {
            target_height: level,
            previous: target_id,
            newest: block.clone(),
        };
        let link = if target.roster.contains(&self.keypair.public()) {
            self.sign_link(proposal).await?
        } else {
            self.request_link(&target, proposal).await?
        };

        let target = self.store.with_bunch(chain, |bunch| -> Result<SkipBlock> {
            let mut target = bunch
                .get(&target_id)
                .cloned()
                .ok_or_else(|| SkipchainError::BlockNotFound(target_id.short()))?;
            target.add_forward_link(link, level)?;
            bunch.store(target.clone())?;
            Ok(target)
        })??;
        self.propagate(&[&target.roster, &block.roster], vec![target.clone()])
            .await;
        Ok(())
    }

    /// Ask a member of the target block's roster to lead the round.
    async fn request_link(
        &self,
        target: &SkipBlock,
        proposal: LinkProposal,
    ) -> Result<ForwardLink> {
        let peer = target
            .roster
            .list
            .iter()
            .find(|m| m.public != self.keypair.public())
            .ok_or_else(|| SkipchainError::InvalidParameters("no peer to delegate to".into()))?
            .id;
        match self
            .request(peer, |request| ServiceMessage::ForwardLinkRequest {
                request,
                proposal,
            })
            .await?
        {
            ServiceMessage::ForwardLinkReply {
                link: Some(link), ..
            } => Ok(link),
            ServiceMessage::ForwardLinkReply { link: None, .. } => Err(
                SkipchainError::VerificationFailed("peer could not create the link".into()),
            ),
            _ => Err(SkipchainError::Transport("unexpected reply".into())),
        }
    }

    async fn link_child(&self, parent_id: &BlockId, child: BlockId) {
        let Some(mut parent) = self.store.get_block(parent_id) else {
            warn!(parent = %parent_id, "parent chain not known locally");
            return;
        };
        if parent.child_links.contains(&child) {
            return;
        }
        parent.child_links.push(child);
        match self.store.store(parent.clone()) {
            Ok(_) => {
                self.propagate(&[&parent.roster], vec![parent.clone()])
                    .await
            }
            Err(e) => warn!(parent = %parent_id, "child-link: {}", e),
        }
    }

    /// Best-effort push of the changed blocks to every node in the given
    /// rosters. A roster rotation must reach the departing members too,
    /// so the caller passes every roster touched by the change.
    async fn propagate(&self, rosters: &[&Roster], blocks: Vec<SkipBlock>) {
        let mut peers: Vec<_> = rosters
            .iter()
            .flat_map(|r| r.node_ids())
            .filter(|id| *id != self.node_id)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        self.network
            .broadcast(
                &peers,
                crate::network::Envelope::Service {
                    from: self.node_id,
                    msg: ServiceMessage::Propagate(blocks),
                },
            )
            .await;
    }

    /// Walk the chain from `start` towards `end` (or the newest known
    /// block), verifying every hop. `max_skip` of 0 takes the highest
    /// links available; 1 forces the complete block-by-block history.
    /// Blocks missing locally are fetched from roster peers.
    pub async fn get_blocks(
        &self,
        start: BlockId,
        end: Option<BlockId>,
        max_skip: usize,
    ) -> Result<Vec<SkipBlock>> {
        let mut cursor = self.fetch_block(&start, None).await?;
        let end_block = match &end {
            Some(id) => Some(self.fetch_block(id, Some(&cursor.roster)).await?),
            None => None,
        };

        let mut blocks = vec![cursor.clone()];
        loop {
            if let Some(end) = &end_block {
                if cursor.hash == end.hash {
                    break;
                }
            }
            let candidates: Vec<ForwardLink> = cursor
                .forward_links
                .iter()
                .enumerate()
                .rev()
                .filter(|(level, _)| max_skip == 0 || *level < max_skip)
                .filter_map(|(_, link)| link.clone())
                .collect();

            let mut next = None;
            for link in candidates {
                let target = self.fetch_block(&link.to, Some(&cursor.roster)).await?;
                if let Some(end) = &end_block {
                    if target.index > end.index {
                        continue;
                    }
                }
                link.verify(&cursor.roster)?;
                if target.index <= cursor.index {
                    return Err(SkipchainError::VerificationFailed(
                        "forward-link does not move forward".into(),
                    ));
                }
                next = Some(target);
                break;
            }
            match next {
                Some(target) => {
                    blocks.push(target.clone());
                    cursor = target;
                }
                None if end_block.is_some() => {
                    return Err(SkipchainError::BlockNotFound(
                        "chain ends before the requested block".into(),
                    ));
                }
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Fetch one block, from the local store if possible, otherwise from
    /// the given roster's members.
    async fn fetch_block(&self, id: &BlockId, hint: Option<&Roster>) -> Result<SkipBlock> {
        if let Some(block) = self.store.get_block(id) {
            return Ok(block);
        }
        let peers = hint.map(|r| r.node_ids()).unwrap_or_default();
        for peer in peers {
            if peer == self.node_id {
                continue;
            }
            let reply = self
                .request(peer, |request| ServiceMessage::BlockRequest {
                    request,
                    id: *id,
                })
                .await;
            if let Ok(ServiceMessage::BlockReply {
                block: Some(block), ..
            }) = reply
            {
                if block.hash == *id && block.verify_forward_signatures().is_ok() {
                    return Ok(block);
                }
            }
        }
        Err(SkipchainError::BlockNotFound(id.short()))
    }

    /// Single-block lookup. A stored block that fails the linkage check
    /// is reported as not-found rather than handed out half-verified.
    pub fn get_single_block(&self, id: &BlockId) -> Result<SkipBlock> {
        let block = self
            .store
            .get_block(id)
            .ok_or_else(|| SkipchainError::BlockNotFound(id.short()))?;
        self.store.verify_chain_linkage(&block).map_err(|e| {
            warn!(block = %id, "linkage check failed on lookup: {}", e);
            SkipchainError::BlockNotFound(id.short())
        })?;
        Ok(block)
    }

    pub fn get_single_block_by_index(&self, chain: &BlockId, index: u64) -> Result<SkipBlock> {
        self.store
            .with_bunch(chain, |bunch| bunch.get_by_index(index).cloned())?
            .ok_or_else(|| SkipchainError::BlockNotFound(format!("index {}", index)))
    }

    /// Self-contained proof from the genesis block to the chain's tip.
    pub fn chain_proof(&self, chain: &BlockId) -> Result<ChainProof> {
        let path = self.store.with_bunch(chain, |bunch| {
            let latest = bunch.latest().hash;
            bunch.path(&bunch.genesis_id, &latest, 0)
        })??;
        Ok(ChainProof(path))
    }

    /// The newest block of every chain this node knows about.
    pub fn get_all_chains(&self) -> Vec<SkipBlock> {
        self.store.all_latest()
    }

    pub fn get_fuzzy(&self, pattern: &str) -> Option<SkipBlock> {
        self.store.get_fuzzy(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Keypair, NodeIdentity};
    use crate::config::Config;
    use crate::network::LocalNetwork;
    use crate::service::node::SkipchainNode;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            round_timeout: Duration::from_millis(2000),
            subleader_timeout: Duration::from_millis(500),
            leaf_timeout: Duration::from_millis(300),
            propagate_timeout: Duration::from_millis(2000),
            ..Default::default()
        }
    }

    fn cluster(n: usize) -> Vec<NodeHandle> {
        let network = LocalNetwork::new();
        (0..n)
            .map(|id| {
                SkipchainNode::new(&network, id, Keypair::generate(), test_config()).spawn()
            })
            .collect()
    }

    fn roster(handles: &[NodeHandle]) -> Roster {
        Roster::new(
            handles
                .iter()
                .map(|h| NodeIdentity {
                    id: h.node_id,
                    public: h.keypair.public(),
                })
                .collect(),
        )
    }

    fn proposal(handles: &[NodeHandle]) -> BlockProposal {
        BlockProposal {
            roster: roster(handles),
            payload: b"genesis".to_vec(),
            max_height: 2,
            base_height: 2,
            verifiers: vec![VerifierKind::Base],
            parent_id: None,
        }
    }

    async fn wait_for_block(handle: &NodeHandle, id: &BlockId) -> bool {
        for _ in 0..200 {
            if handle.store.get_block(id).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_genesis_propagates() {
        let handles = cluster(4);
        let genesis = handles[0].create_genesis(proposal(&handles)).await.unwrap();

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.height, 2);
        assert_eq!(genesis.skipchain_id(), genesis.hash);
        for handle in &handles[1..] {
            assert!(wait_for_block(handle, &genesis.hash).await);
        }
    }

    #[tokio::test]
    async fn test_genesis_validation() {
        let handles = cluster(2);
        let mut bad = proposal(&handles);
        bad.max_height = 0;
        assert!(handles[0].create_genesis(bad).await.is_err());

        let mut bad = proposal(&handles);
        bad.max_height = 3;
        assert!(matches!(
            handles[0].create_genesis(bad).await,
            Err(SkipchainError::InvalidParameters(_))
        ));

        let outsider = cluster(1);
        assert!(matches!(
            outsider[0].create_genesis(proposal(&handles)).await,
            Err(SkipchainError::NotInRoster)
        ));
    }

    #[tokio::test]
    async fn test_append_and_walk() {
        let handles = cluster(4);
        let genesis = handles[0].create_genesis(proposal(&handles)).await.unwrap();

        let mut latest = genesis.hash;
        for i in 1..=3u64 {
            let reply = handles[0]
                .store_block(latest, format!("block-{}", i).into_bytes(), None)
                .await
                .unwrap();
            assert_eq!(reply.latest.index, i);
            latest = reply.latest.hash;
        }
        assert_eq!(
            handles[0]
                .get_single_block_by_index(&genesis.hash, 2)
                .unwrap()
                .height,
            2
        );

        // Highest links first: the level-1 shortcut jumps straight to
        // block 2.
        let fast = handles[0].get_blocks(genesis.hash, None, 0).await.unwrap();
        assert_eq!(
            fast.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 2, 3]
        );
        let full = handles[0].get_blocks(genesis.hash, None, 1).await.unwrap();
        assert_eq!(
            full.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let proof = handles[0].chain_proof(&genesis.hash).unwrap();
        assert!(proof.verify().is_ok());
        assert_eq!(proof.latest().unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_walk_fetches_missing_blocks() {
        let handles = cluster(4);
        let genesis = handles[0].create_genesis(proposal(&handles)).await.unwrap();
        let reply = handles[0]
            .store_block(genesis.hash, b"one".to_vec(), None)
            .await
            .unwrap();

        // A node outside the roster holding only the genesis block can
        // still walk the chain; the missing blocks come from peers.
        let outsider = SkipchainNode::new(
            &handles[0].network,
            9,
            Keypair::generate(),
            test_config(),
        )
        .spawn();
        let updated_genesis = handles[0].get_single_block(&genesis.hash).unwrap();
        outsider.store.store(updated_genesis).unwrap();

        let walked = outsider.get_blocks(genesis.hash, None, 0).await.unwrap();
        assert_eq!(walked.len(), 2);
        assert_eq!(walked[1].hash, reply.latest.hash);
    }

    #[tokio::test]
    async fn test_concurrent_appends_one_wins() {
        let handles = cluster(4);
        let genesis = handles[0].create_genesis(proposal(&handles)).await.unwrap();

        let (a, b) = tokio::join!(
            handles[0].store_block(genesis.hash, b"left".to_vec(), None),
            handles[0].store_block(genesis.hash, b"right".to_vec(), None),
        );
        assert_eq!(
            usize::from(a.is_ok()) + usize::from(b.is_ok()),
            1,
            "exactly one append may win: {:?} / {:?}",
            a.as_ref().err(),
            b.as_ref().err()
        );
    }

    #[tokio::test]
    async fn test_stale_tip_is_rejected() {
        let handles = cluster(4);
        let genesis = handles[0].create_genesis(proposal(&handles)).await.unwrap();
        handles[0]
            .store_block(genesis.hash, b"one".to_vec(), None)
            .await
            .unwrap();

        assert!(matches!(
            handles[0]
                .store_block(genesis.hash, b"two".to_vec(), None)
                .await,
            Err(SkipchainError::ForwardLinkExists)
        ));
    }

    #[tokio::test]
    async fn test_roster_rotation() {
        let handles = cluster(4);
        let mut genesis_proposal = proposal(&handles);
        genesis_proposal
            .verifiers
            .push(VerifierKind::RosterShift);
        let genesis = handles[0].create_genesis(genesis_proposal).await.unwrap();

        let smaller = roster(&handles[..3]);
        let reply = handles[0]
            .store_block(genesis.hash, b"rotate".to_vec(), Some(smaller.clone()))
            .await
            .unwrap();
        assert_eq!(reply.latest.roster, smaller);
        let link = reply.previous.get_forward(0).unwrap();
        assert_eq!(link.new_roster.as_ref(), Some(&smaller));
    }

    #[tokio::test]
    async fn test_rotation_reaches_departing_member() {
        let handles = cluster(4);
        let mut genesis_proposal = proposal(&handles);
        genesis_proposal
            .verifiers
            .push(VerifierKind::RosterShift);
        let genesis = handles[0].create_genesis(genesis_proposal).await.unwrap();

        // Node 3 is dropped from the roster but co-signed the link and
        // still serves the old blocks; it must learn about the new tip
        // and the forward-link on its copy of the genesis block.
        let smaller = roster(&handles[..3]);
        let reply = handles[0]
            .store_block(genesis.hash, b"rotate".to_vec(), Some(smaller))
            .await
            .unwrap();

        assert!(wait_for_block(&handles[3], &reply.latest.hash).await);
        for _ in 0..200 {
            if handles[3]
                .store
                .get_block(&genesis.hash)
                .is_some_and(|b| b.has_forward(0))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("departing member never saw the updated previous block");
    }

    #[tokio::test]
    async fn test_child_chain_links_to_parent() {
        let handles = cluster(3);
        let parent = handles[0].create_genesis(proposal(&handles)).await.unwrap();

        let mut child_proposal = proposal(&handles);
        child_proposal.parent_id = Some(parent.hash);
        child_proposal
            .verifiers
            .push(VerifierKind::ParentAccepting);
        let child = handles[0].create_genesis(child_proposal).await.unwrap();

        let parent = handles[0].get_single_block(&parent.hash).unwrap();
        assert!(parent.child_links.contains(&child.hash));
        assert_eq!(child.parent_id, Some(parent.hash));
    }
}
