use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::common::BlockId;
use crate::error::{Result, SkipchainError};
use crate::skiplist::block::SkipBlock;

/*
    A bunch holds all locally known blocks of one skipchain, indexed by
    their hash. Blocks are append-only: a block already in the bunch is
    never replaced, only its forward-links and child-links grow. Every
    link is signature-checked against the roster of the block it extends
    before it is accepted, so a bunch loaded from an untrusted peer is no
    weaker than one built locally.
*/

pub struct Bunch {
    pub genesis_id: BlockId,
    latest: BlockId,
    blocks: HashMap<BlockId, SkipBlock>,
}

impl Bunch {
    /// Create a bunch from its genesis block.
    pub fn new(genesis: SkipBlock) -> Result<Self> {
        if genesis.index != 0 {
            return Err(SkipchainError::InvalidParameters(
                "bunch must start from a genesis block".into(),
            ));
        }
        genesis.verify_forward_signatures()?;
        let id = genesis.hash;
        let mut blocks = HashMap::new();
        blocks.insert(id, genesis);
        Ok(Bunch {
            genesis_id: id,
            latest: id,
            blocks,
        })
    }

    pub fn get(&self, id: &BlockId) -> Option<&SkipBlock> {
        self.blocks.get(id)
    }

    pub fn get_by_index(&self, index: u64) -> Option<&SkipBlock> {
        self.blocks.values().find(|b| b.index == index)
    }

    pub fn latest(&self) -> &SkipBlock {
        // The latest id always points at a stored block.
        &self.blocks[&self.latest]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Store a block, or merge the additive parts of a block we already
    /// know. Rejects blocks of other chains and blocks whose links do not
    /// verify. Returns the hash of the stored block.
    pub fn store(&mut self, block: SkipBlock) -> Result<BlockId> {
        if block.skipchain_id() != self.genesis_id {
            return Err(SkipchainError::InvalidParameters(
                "block belongs to a different skipchain".into(),
            ));
        }

        let hash = block.hash;
        if self.blocks.contains_key(&hash) {
            let known = self
                .blocks
                .get_mut(&hash)
                .ok_or_else(|| SkipchainError::BlockNotFound(hash.short()))?;
            for (level, link) in block.forward_links.iter().enumerate() {
                let Some(link) = link else { continue };
                if known.has_forward(level) {
                    continue;
                }
                if let Err(e) = link.verify(&known.roster) {
                    warn!(block = %known.hash, level, "rejecting forward-link: {}", e);
                    continue;
                }
                known.add_forward_link(link.clone(), level)?;
            }
            for child in &block.child_links {
                if !known.child_links.contains(child) {
                    known.child_links.push(*child);
                }
            }
        } else {
            self.verify_block(&block)?;
            debug!(block = %hash, index = block.index, "storing new block");
            if block.index > self.latest().index {
                self.latest = hash;
            }
            self.blocks.insert(hash, block);
        }
        Ok(hash)
    }

    /// Structural checks for a block entering the bunch.
    fn verify_block(&self, block: &SkipBlock) -> Result<()> {
        block.verify_forward_signatures()?;
        if block.back_links.is_empty() {
            return Err(SkipchainError::VerificationFailed(
                "block has no back-links".into(),
            ));
        }
        if block.index > 0 {
            if let Some(prev) = self.get(&block.back_links[0]) {
                if prev.index + 1 != block.index {
                    return Err(SkipchainError::VerificationFailed(format!(
                        "back-link from index {} points at index {}",
                        block.index, prev.index
                    )));
                }
            }
        }
        Ok(())
    }

    /// Back-links for a new block of the given height appended after
    /// `prev`. Level 0 is `prev` itself; level h points at the nearest
    /// prior block tall enough to carry a level-h forward-link.
    pub fn back_links_for(&self, prev: &SkipBlock, height: usize) -> Result<Vec<BlockId>> {
        let mut links = vec![prev.hash];
        for level in 1..height {
            let mut cursor = prev;
            loop {
                if cursor.height > level {
                    links.push(cursor.hash);
                    break;
                }
                if cursor.index == 0 {
                    return Err(SkipchainError::BlockNotFound(format!(
                        "no block tall enough for back-link level {}",
                        level
                    )));
                }
                cursor = self.get(&cursor.back_links[0]).ok_or_else(|| {
                    SkipchainError::BlockNotFound(format!(
                        "missing predecessor {}",
                        cursor.back_links[0]
                    ))
                })?;
            }
        }
        Ok(links)
    }

    /// Shortest locally known path from `from` to `to`, following the
    /// highest forward-link that does not overshoot the target. With
    /// `max_skip` > 0 only links below that level are taken, so
    /// `max_skip` = 1 yields the complete block-by-block history.
    pub fn path(&self, from: &BlockId, to: &BlockId, max_skip: usize) -> Result<Vec<SkipBlock>> {
        let start = self
            .get(from)
            .ok_or_else(|| SkipchainError::BlockNotFound(from.short()))?;
        let end = self
            .get(to)
            .ok_or_else(|| SkipchainError::BlockNotFound(to.short()))?;
        if start.index > end.index {
            return Err(SkipchainError::InvalidParameters(
                "path start is newer than its end".into(),
            ));
        }

        let mut path = vec![start.clone()];
        let mut cursor = start;
        while cursor.hash != end.hash {
            let mut next = None;
            for (level, link) in cursor.forward_links.iter().enumerate().rev() {
                if max_skip > 0 && level >= max_skip {
                    continue;
                }
                let Some(link) = link else { continue };
                if let Some(target) = self.get(&link.to) {
                    if target.index <= end.index {
                        next = Some(target);
                        break;
                    }
                }
            }
            cursor = next.ok_or_else(|| {
                SkipchainError::BlockNotFound(format!(
                    "no forward-link from block {} towards {}",
                    cursor.hash, end.hash
                ))
            })?;
            path.push(cursor.clone());
        }
        Ok(path)
    }

    /// Mutual consistency between a block's back-links and the forward
    /// links of the older blocks they name: every back-link must resolve
    /// within the bunch, and an older block carrying a forward-link at
    /// that level must point right back.
    pub fn verify_chain_linkage(&self, block: &SkipBlock) -> Result<()> {
        block.verify_forward_signatures()?;
        if block.index == 0 {
            // The genesis back-link is random by design.
            return Ok(());
        }
        for (level, back) in block.back_links.iter().enumerate() {
            let older = self
                .get(back)
                .ok_or_else(|| SkipchainError::BlockNotFound(back.short()))?;
            if let Some(link) = older.get_forward(level) {
                if link.to != block.hash {
                    return Err(SkipchainError::VerificationFailed(format!(
                        "level-{} forward-link of block {} does not point back",
                        level, older.index
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find a block whose hex id starts or ends with the given pattern.
    pub fn get_fuzzy(&self, pattern: &str) -> Option<&SkipBlock> {
        self.blocks
            .values()
            .find(|b| b.hash.hex().starts_with(pattern))
            .or_else(|| self.blocks.values().find(|b| b.hash.hex().ends_with(pattern)))
    }

    pub fn blocks(&self) -> impl Iterator<Item = &SkipBlock> {
        self.blocks.values()
    }
}

/// A path through one skipchain, from the genesis block to some newer
/// block. Self-contained: verification needs no other state, every hop is
/// vouched for by a forward-link signed by the roster of the older block.
#[derive(Clone, Debug)]
pub struct ChainProof(pub Vec<SkipBlock>);

impl ChainProof {
    pub fn verify(&self) -> Result<()> {
        let first = self
            .0
            .first()
            .ok_or_else(|| SkipchainError::VerificationFailed("empty proof".into()))?;
        if first.index != 0 {
            return Err(SkipchainError::VerificationFailed(
                "proof does not start at a genesis block".into(),
            ));
        }
        for block in &self.0 {
            if block.hash != block.compute_hash() {
                return Err(SkipchainError::VerificationFailed(format!(
                    "block {} hash does not match content",
                    block.index
                )));
            }
        }
        for pair in self.0.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let link = from
                .forward_links
                .iter()
                .flatten()
                .find(|l| l.to == to.hash)
                .ok_or_else(|| {
                    SkipchainError::VerificationFailed(format!(
                        "no forward-link from block {} to block {}",
                        from.index, to.index
                    ))
                })?;
            link.verify(&from.roster)?;
            if let Some(new_roster) = &link.new_roster {
                if *new_roster != to.roster {
                    return Err(SkipchainError::VerificationFailed(
                        "forward-link roster does not match its target".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn latest(&self) -> Option<&SkipBlock> {
        self.0.last()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// All bunches a node knows about, plus the set of tips with an append in
/// flight. Guards are plain std mutexes and are never held across an
/// await point.
pub struct ChainStore {
    bunches: Mutex<HashMap<BlockId, Arc<Mutex<Bunch>>>>,
    appending: Arc<Mutex<HashSet<BlockId>>>,
}

impl Default for ChainStore {
    fn default() -> Self {
        ChainStore {
            bunches: Mutex::new(HashMap::new()),
            appending: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl ChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from previously persisted blocks, re-checking every
    /// signature as if the blocks came from an untrusted peer.
    pub fn reload(blocks: Vec<SkipBlock>) -> Result<Self> {
        let store = ChainStore::new();
        let mut blocks = blocks;
        blocks.sort_by_key(|b| b.index);
        for block in blocks {
            store.store(block)?;
        }
        Ok(store)
    }

    pub fn bunch(&self, genesis_id: &BlockId) -> Option<Arc<Mutex<Bunch>>> {
        lock(&self.bunches).get(genesis_id).cloned()
    }

    /// Run a closure under the lock of one chain's bunch. Used for
    /// check-then-attach sequences that must not interleave with other
    /// writers.
    pub fn with_bunch<R>(&self, chain: &BlockId, f: impl FnOnce(&mut Bunch) -> R) -> Result<R> {
        let bunch = self.bunch(chain).ok_or_else(|| {
            SkipchainError::BlockNotFound(format!("unknown skipchain {}", chain))
        })?;
        let mut bunch = lock(&bunch);
        Ok(f(&mut bunch))
    }

    pub fn chain_ids(&self) -> Vec<BlockId> {
        lock(&self.bunches).keys().copied().collect()
    }

    /// Store a block into the bunch it belongs to, creating the bunch if
    /// the block is a genesis block.
    pub fn store(&self, block: SkipBlock) -> Result<BlockId> {
        let chain = block.skipchain_id();
        let bunch = self.bunch(&chain);
        match bunch {
            Some(bunch) => lock(&bunch).store(block),
            None if block.index == 0 => {
                let bunch = Bunch::new(block)?;
                let id = bunch.genesis_id;
                lock(&self.bunches).insert(id, Arc::new(Mutex::new(bunch)));
                Ok(id)
            }
            None => Err(SkipchainError::BlockNotFound(format!(
                "unknown skipchain {}",
                chain
            ))),
        }
    }

    /// Look a block up across all known chains.
    pub fn get_block(&self, id: &BlockId) -> Option<SkipBlock> {
        let bunches: Vec<_> = lock(&self.bunches).values().cloned().collect();
        bunches.iter().find_map(|b| lock(b).get(id).cloned())
    }

    pub fn latest(&self, chain: &BlockId) -> Result<SkipBlock> {
        let bunch = self
            .bunch(chain)
            .ok_or_else(|| SkipchainError::BlockNotFound(format!("unknown skipchain {}", chain)))?;
        let bunch = lock(&bunch);
        Ok(bunch.latest().clone())
    }

    /// Latest block of every chain this store knows about.
    pub fn all_latest(&self) -> Vec<SkipBlock> {
        let bunches: Vec<_> = lock(&self.bunches).values().cloned().collect();
        bunches.iter().map(|b| lock(b).latest().clone()).collect()
    }

    pub fn get_fuzzy(&self, pattern: &str) -> Option<SkipBlock> {
        let bunches: Vec<_> = lock(&self.bunches).values().cloned().collect();
        bunches.iter().find_map(|b| lock(b).get_fuzzy(pattern).cloned())
    }

    /// Linkage check across chains: the bunch-level consistency of the
    /// block itself plus, for blocks referencing a parent chain, that the
    /// parent block actually lists this chain among its children.
    pub fn verify_chain_linkage(&self, block: &SkipBlock) -> Result<()> {
        let chain = block.skipchain_id();
        self.with_bunch(&chain, |bunch| bunch.verify_chain_linkage(block))??;
        if let Some(parent_id) = &block.parent_id {
            let parent = self
                .get_block(parent_id)
                .ok_or_else(|| SkipchainError::BlockNotFound(parent_id.short()))?;
            parent.verify_forward_signatures()?;
            if !parent.child_links.contains(&chain) {
                return Err(SkipchainError::VerificationFailed(
                    "parent block does not list this chain as a child".into(),
                ));
            }
        }
        Ok(())
    }

    /// Claim the right to append after the given tip. Exactly one caller
    /// per tip succeeds; the claim is released when the guard drops.
    pub fn begin_append(&self, tip: BlockId) -> Result<AppendGuard> {
        let mut appending = lock(&self.appending);
        if !appending.insert(tip) {
            return Err(SkipchainError::BlockInProgress);
        }
        Ok(AppendGuard {
            appending: self.appending.clone(),
            tip,
        })
    }
}

pub struct AppendGuard {
    appending: Arc<Mutex<HashSet<BlockId>>>,
    tip: BlockId,
}

impl Drop for AppendGuard {
    fn drop(&mut self) {
        lock(&self.appending).remove(&self.tip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft;
    use crate::common::{
        challenge, reduced_aggregate, CollectiveSignature, Hashable, Keypair, NodeIdentity, Nonce,
        Roster,
    };
    use crate::skiplist::block::{compute_height, link_id, ForwardLink};
    use curve25519_dalek::ristretto::RistrettoPoint;
    use curve25519_dalek::traits::Identity;

    fn roster_of(n: usize) -> (Vec<Keypair>, Roster) {
        let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
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
        (keypairs, roster)
    }

    fn collective_sign(keypairs: &[Keypair], msg: &[u8]) -> CollectiveSignature {
        let publics: Vec<_> = keypairs.iter().map(|k| k.public()).collect();
        let nonces: Vec<Nonce> = keypairs.iter().map(|_| Nonce::generate()).collect();
        let commitment = nonces
            .iter()
            .fold(RistrettoPoint::identity(), |acc, n| acc + n.commitment);
        let aggregate = reduced_aggregate(&publics, &[]).unwrap();
        let c = challenge(&commitment, &aggregate, bft::COMMIT_TAG, msg);
        let response = keypairs
            .iter()
            .zip(nonces.iter())
            .map(|(k, n)| k.respond(n, &c))
            .sum();
        CollectiveSignature {
            commitment,
            response,
            exceptions: vec![],
        }
    }

    fn genesis(roster: Roster, max_height: usize, base_height: usize) -> SkipBlock {
        let mut block = SkipBlock {
            index: 0,
            height: max_height,
            max_height,
            base_height,
            back_links: vec![BlockId::random()],
            verifiers: vec![],
            genesis_id: BlockId::NULL,
            parent_id: None,
            payload: vec![],
            roster,
            hash: BlockId::NULL,
            forward_links: vec![],
            child_links: vec![],
        };
        block.update_hash();
        block
    }

    /// Append `n` signed blocks after the genesis, wiring all back-links
    /// and forward-links the way the append service does.
    fn build_chain(keypairs: &[Keypair], bunch: &mut Bunch, n: u64) {
        for _ in 0..n {
            let prev = bunch.latest().clone();
            let index = prev.index + 1;
            let height = compute_height(index, prev.base_height, prev.max_height);
            let mut block = SkipBlock {
                index,
                height,
                max_height: prev.max_height,
                base_height: prev.base_height,
                back_links: bunch.back_links_for(&prev, height).unwrap(),
                verifiers: prev.verifiers.clone(),
                genesis_id: bunch.genesis_id,
                parent_id: prev.parent_id,
                payload: vec![],
                roster: prev.roster.clone(),
                hash: BlockId::NULL,
                forward_links: vec![],
                child_links: vec![],
            };
            block.update_hash();
            bunch.store(block.clone()).unwrap();

            for (level, target_id) in block.back_links.clone().into_iter().enumerate() {
                let target = bunch.get(&target_id).unwrap().clone();
                let link = ForwardLink::new(&target, &block, {
                    let msg = link_id(&target, &block);
                    collective_sign(keypairs, msg.as_ref())
                });
                // Signature must cover the link digest.
                assert_eq!(link.hash(), link_id(&target, &block));
                let mut target = target;
                target.add_forward_link(link, level).unwrap();
                bunch.store(target).unwrap();
            }
        }
    }

    #[test]
    fn test_store_and_latest() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 3);

        assert_eq!(bunch.len(), 4);
        assert_eq!(bunch.latest().index, 3);
        assert_eq!(bunch.get_by_index(2).unwrap().height, 2);
    }

    #[test]
    fn test_path_takes_highest_links() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 3);

        let from = bunch.genesis_id;
        let to = bunch.latest().hash;
        // genesis -> block 2 over the level-1 link, then block 3.
        let path = bunch.path(&from, &to, 0).unwrap();
        assert_eq!(
            path.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 2, 3]
        );
        // max_skip 1 forces the complete history.
        let full = bunch.path(&from, &to, 1).unwrap();
        assert_eq!(
            full.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_store_rejects_foreign_block() {
        let (_, roster) = roster_of(4);
        let (_, other_roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();

        let foreign = genesis(other_roster, 2, 2);
        assert!(bunch.store(foreign).is_err());
    }

    #[test]
    fn test_chain_proof() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 3, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 4);

        let path = bunch
            .path(&bunch.genesis_id, &bunch.latest().hash, 0)
            .unwrap();
        let proof = ChainProof(path);
        assert!(proof.verify().is_ok());
        assert_eq!(proof.latest().unwrap().index, 4);

        // A tampered payload must invalidate the proof.
        let mut bad = proof.clone();
        bad.0[1].payload = b"tampered".to_vec();
        assert!(bad.verify().is_err());

        // Dropping the genesis block must too.
        let mut headless = proof;
        headless.0.remove(0);
        assert!(headless.verify().is_err());
    }

    #[test]
    fn test_chain_linkage() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 3);

        for block in bunch.blocks() {
            bunch.verify_chain_linkage(block).unwrap();
        }

        // A back-link pointing at the wrong block must be caught.
        let mut forged = bunch.get_by_index(3).unwrap().clone();
        forged.back_links[0] = bunch.genesis_id;
        forged.update_hash();
        assert!(bunch.verify_chain_linkage(&forged).is_err());
    }

    #[test]
    fn test_get_fuzzy() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 2);

        let id = bunch.latest().hash.hex();
        assert_eq!(bunch.get_fuzzy(&id[..10]).unwrap().index, 2);
        assert_eq!(bunch.get_fuzzy(&id[id.len() - 10..]).unwrap().index, 2);
        assert!(bunch.get_fuzzy("not-hex").is_none());
    }

    #[test]
    fn test_append_guard() {
        let store = ChainStore::new();
        let tip = BlockId::random();

        let guard = store.begin_append(tip).unwrap();
        assert!(matches!(
            store.begin_append(tip),
            Err(SkipchainError::BlockInProgress)
        ));
        drop(guard);
        assert!(store.begin_append(tip).is_ok());
    }

    #[test]
    fn test_store_reload() {
        let (keypairs, roster) = roster_of(4);
        let mut bunch = Bunch::new(genesis(roster, 2, 2)).unwrap();
        build_chain(&keypairs, &mut bunch, 2);
        let blocks: Vec<SkipBlock> = bunch.blocks().cloned().collect();

        let store = ChainStore::reload(blocks.clone()).unwrap();
        assert_eq!(store.latest(&bunch.genesis_id).unwrap().index, 2);

        // A corrupted block makes the reload fail.
        let mut blocks = blocks;
        blocks.sort_by_key(|b| b.index);
        blocks[1].payload = b"tampered".to_vec();
        assert!(ChainStore::reload(blocks).is_err());
    }
}
