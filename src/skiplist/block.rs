use sha2::{Digest as ShaDigest, Sha512};

use crate::bft;
use crate::common::{BlockId, CollectiveSignature, Hashable, Policy, Roster};
use crate::error::{Result, SkipchainError};
use crate::service::VerifierKind;

/// Height of the block at `index`. The height grows at indices divisible
/// by increasing powers of `base_height` and is capped at `max_height`;
/// the genesis block always gets the full height.
pub fn compute_height(index: u64, base_height: usize, max_height: usize) -> usize {
    if index == 0 {
        return max_height;
    }
    let base = base_height as u64;
    let mut height = 1;
    let mut index = index;
    while index % base == 0 && height < max_height {
        index /= base;
        height += 1;
    }
    height
}

/// Signed pointer from an older block to a newer one. The signature is
/// issued by the roster of the *source* block; `new_roster` is only set
/// when the target block changed the roster.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardLink {
    pub from: BlockId,
    pub to: BlockId,
    pub new_roster: Option<Roster>,
    pub signature: CollectiveSignature,
}

fn link_digest(from: &BlockId, to: &BlockId, new_roster: Option<&Roster>) -> BlockId {
    let mut hasher = Sha512::new();
    hasher.update(from);
    hasher.update(to);
    if let Some(roster) = new_roster {
        for member in &roster.list {
            hasher.update(member.public.key);
        }
    }
    BlockId::from_digest(hasher)
}

/// The message a forward-link from `from` to `to` signs.
pub fn link_id(from: &SkipBlock, to: &SkipBlock) -> BlockId {
    let new_roster = (from.roster != to.roster).then_some(&to.roster);
    link_digest(&from.hash, &to.hash, new_roster)
}

impl ForwardLink {
    pub fn new(from: &SkipBlock, to: &SkipBlock, signature: CollectiveSignature) -> Self {
        ForwardLink {
            from: from.hash,
            to: to.hash,
            new_roster: (from.roster != to.roster).then(|| to.roster.clone()),
            signature,
        }
    }

    /// Check the signature against the roster of the source block, allowing
    /// up to the byzantine bound of missing signers.
    pub fn verify(&self, roster: &Roster) -> Result<()> {
        self.signature.verify_with_policy(
            &roster.publics(),
            bft::COMMIT_TAG,
            self.hash().as_ref(),
            Policy::Threshold(bft::max_faulty(roster.len())),
        )
    }
}

impl Hashable for ForwardLink {
    fn hash(&self) -> BlockId {
        link_digest(&self.from, &self.to, self.new_roster.as_ref())
    }
}

/// One node of the skip list. Everything except `forward_links` and
/// `child_links` is fixed at creation and covered by the content hash;
/// the two link lists are additive and grow after creation without
/// changing the block's identity.
#[derive(Clone, Debug, PartialEq)]
pub struct SkipBlock {
    /// Position in the chain, 0 for the genesis block.
    pub index: u64,
    /// Number of forward-link slots, starts at 1.
    pub height: usize,
    /// Chain-wide settings, fixed at genesis.
    pub max_height: usize,
    pub base_height: usize,
    /// Hashes of the nearest prior blocks, one per level. Level 0 is
    /// always the immediate predecessor. The genesis block carries one
    /// random back-link so two otherwise identical genesis blocks get
    /// distinct ids.
    pub back_links: Vec<BlockId>,
    /// Verifications run by every roster member before signing.
    pub verifiers: Vec<VerifierKind>,
    /// Hash of the genesis block, null for the genesis block itself.
    pub genesis_id: BlockId,
    /// Genesis block of a different chain responsible for this one.
    pub parent_id: Option<BlockId>,
    /// Opaque application data, hashed into the block identity.
    pub payload: Vec<u8>,
    /// The quorum for this block.
    pub roster: Roster,

    /// Content hash of all fields above.
    pub hash: BlockId,

    /// Filled lazily as newer blocks are appended; `None` entries are
    /// placeholders keeping higher-level links at the right position.
    pub forward_links: Vec<Option<ForwardLink>>,
    /// Genesis hashes of child chains this block is responsible for.
    pub child_links: Vec<BlockId>,
}

impl SkipBlock {
    pub fn compute_hash(&self) -> BlockId {
        let mut hasher = Sha512::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update((self.height as u32).to_le_bytes());
        hasher.update((self.max_height as u32).to_le_bytes());
        hasher.update((self.base_height as u32).to_le_bytes());
        for link in &self.back_links {
            hasher.update(link);
        }
        for verifier in &self.verifiers {
            hasher.update(verifier.as_bytes());
        }
        hasher.update(self.genesis_id);
        if let Some(parent) = &self.parent_id {
            hasher.update(parent);
        }
        hasher.update(&self.payload);
        for member in &self.roster.list {
            hasher.update(member.public.key);
        }
        BlockId::from_digest(hasher)
    }

    pub fn update_hash(&mut self) -> BlockId {
        self.hash = self.compute_hash();
        self.hash
    }

    /// The hash of the genesis block, which identifies the chain.
    pub fn skipchain_id(&self) -> BlockId {
        if self.index == 0 {
            self.hash
        } else {
            self.genesis_id
        }
    }

    pub fn get_forward(&self, level: usize) -> Option<&ForwardLink> {
        self.forward_links.get(level).and_then(|l| l.as_ref())
    }

    pub fn has_forward(&self, level: usize) -> bool {
        self.get_forward(level).is_some()
    }

    /// Highest populated forward-link and its level.
    pub fn highest_forward(&self) -> Option<(usize, &ForwardLink)> {
        self.forward_links
            .iter()
            .enumerate()
            .rev()
            .find_map(|(level, link)| link.as_ref().map(|l| (level, l)))
    }

    /// Store a forward-link at the given level. Lower levels are padded
    /// with placeholders; an already occupied slot is never overwritten.
    pub fn add_forward_link(&mut self, link: ForwardLink, level: usize) -> Result<()> {
        if level >= self.height {
            return Err(SkipchainError::InvalidParameters(format!(
                "forward-link level {} beyond height {}",
                level, self.height
            )));
        }
        if link.from != self.hash {
            return Err(SkipchainError::InvalidParameters(
                "forward-link does not start from this block".into(),
            ));
        }
        if self.has_forward(level) {
            return Err(SkipchainError::ForwardLinkExists);
        }
        while self.forward_links.len() <= level {
            self.forward_links.push(None);
        }
        self.forward_links[level] = Some(link);
        Ok(())
    }

    /// Check that the stored hash matches the content and that every
    /// populated forward-link carries a signature verifiable against this
    /// block's roster.
    pub fn verify_forward_signatures(&self) -> Result<()> {
        if self.hash != self.compute_hash() {
            return Err(SkipchainError::VerificationFailed(
                "stored hash does not match content".into(),
            ));
        }
        if self.roster.is_empty() {
            return Err(SkipchainError::VerificationFailed(
                "block has an empty roster".into(),
            ));
        }
        for link in self.forward_links.iter().flatten() {
            if link.from != self.hash {
                return Err(SkipchainError::VerificationFailed(
                    "forward-link does not start from this block".into(),
                ));
            }
            link.verify(&self.roster)
                .map_err(|e| SkipchainError::VerificationFailed(format!("forward-link: {}", e)))?;
        }
        Ok(())
    }
}

impl Hashable for SkipBlock {
    fn hash(&self) -> BlockId {
        self.compute_hash()
    }
}
