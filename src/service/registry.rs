use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SkipchainError};
use crate::skiplist::{compute_height, ChainStore, SkipBlock};

/// The verifications a chain demands before a block is signed. The list
/// is fixed in the genesis block and hashed into every block id, so a
/// roster can never quietly weaken it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VerifierKind {
    /// Structural integrity of the block against its predecessor.
    Base,
    /// Bounds how much of the roster may change in a single block.
    RosterShift,
    /// Blocks referencing a parent chain must have that chain locally.
    ParentAccepting,
}

impl VerifierKind {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            VerifierKind::Base => b"verifier.base",
            VerifierKind::RosterShift => b"verifier.roster-shift",
            VerifierKind::ParentAccepting => b"verifier.parent",
        }
    }
}

/// What a verifier gets to look at: the block being extended and the
/// node's whole local view of all chains.
pub struct ChainView<'a> {
    pub previous: &'a SkipBlock,
    pub store: &'a ChainStore,
}

pub type VerifierFn = Arc<dyn Fn(&ChainView<'_>, &SkipBlock) -> bool + Send + Sync>;

/// Maps verifier kinds to their implementations. Nodes start from
/// `standard()`; applications can override or add entries before the
/// node is spawned.
pub struct Registry {
    table: HashMap<VerifierKind, VerifierFn>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            table: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Registry::empty();
        registry.register(VerifierKind::Base, Arc::new(verify_base));
        registry.register(VerifierKind::RosterShift, Arc::new(verify_roster_shift));
        registry.register(VerifierKind::ParentAccepting, Arc::new(verify_parent));
        registry
    }

    pub fn register(&mut self, kind: VerifierKind, verifier: VerifierFn) {
        self.table.insert(kind, verifier);
    }

    pub fn get(&self, kind: VerifierKind) -> Option<&VerifierFn> {
        self.table.get(&kind)
    }

    /// Run the given verifiers in order; the first refusal wins. An
    /// unknown kind counts as a refusal, since a node that cannot check
    /// a condition must not vouch for it.
    pub fn run(&self, kinds: &[VerifierKind], view: &ChainView<'_>, block: &SkipBlock) -> Result<()> {
        for kind in kinds {
            let Some(verifier) = self.get(*kind) else {
                return Err(SkipchainError::VerificationFailed(format!(
                    "no implementation for verifier {:?}",
                    kind
                )));
            };
            if !verifier(view, block) {
                debug!(?kind, block = %block.hash, "verifier refused block");
                return Err(SkipchainError::VerifierRefused(*kind));
            }
        }
        Ok(())
    }
}

fn verify_base(view: &ChainView<'_>, block: &SkipBlock) -> bool {
    let prev = view.previous;
    block.index == prev.index + 1
        && block.max_height == prev.max_height
        && block.base_height == prev.base_height
        && block.height == compute_height(block.index, block.base_height, block.max_height)
        && block.back_links.len() == block.height
        && block.back_links.first() == Some(&prev.hash)
        && block.verifiers == prev.verifiers
        && block.genesis_id == prev.skipchain_id()
}

fn verify_roster_shift(view: &ChainView<'_>, block: &SkipBlock) -> bool {
    let prev = &view.previous.roster;
    !block.roster.is_empty() && prev.distance(&block.roster) <= prev.len() / 3
}

fn verify_parent(view: &ChainView<'_>, block: &SkipBlock) -> bool {
    match &block.parent_id {
        None => true,
        Some(parent) => view.store.get_block(parent).is_some(),
    }
}
