use curve25519_dalek::ristretto::RistrettoPoint;

use crate::common::crypto::{reduced_aggregate, PublicKey};
use crate::error::{Result, SkipchainError};

/// Address of a node on the transport. The in-process network addresses
/// nodes by a small integer id.
pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub public: PublicKey,
}

/// Ordered, immutable list of node identities defining one block's quorum.
/// The order matters: exception lists in collective signatures refer to
/// roster indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Roster {
    pub list: Vec<NodeIdentity>,
}

impl Roster {
    pub fn new(list: Vec<NodeIdentity>) -> Self {
        Roster { list }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn publics(&self) -> Vec<PublicKey> {
        self.list.iter().map(|m| m.public).collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.list.iter().map(|m| m.id).collect()
    }

    /// Roster index of the member with this public key.
    pub fn index_of(&self, public: &PublicKey) -> Option<usize> {
        self.list.iter().position(|m| m.public == *public)
    }

    pub fn contains(&self, public: &PublicKey) -> bool {
        self.index_of(public).is_some()
    }

    pub fn get(&self, index: usize) -> Result<&NodeIdentity> {
        self.list
            .get(index)
            .ok_or_else(|| SkipchainError::InvalidParameters(format!("no roster member {}", index)))
    }

    /// Aggregate public key of the full roster.
    pub fn aggregate(&self) -> Result<RistrettoPoint> {
        reduced_aggregate(&self.publics(), &[])
    }

    /// How many members of `other` are not in this roster. Used by the
    /// roster-rotation verifier.
    pub fn distance(&self, other: &Roster) -> usize {
        other
            .list
            .iter()
            .filter(|m| !self.contains(&m.public))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;

    pub fn roster_of(n: usize) -> (Vec<Keypair>, Roster) {
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

    #[test]
    fn test_index_of() {
        let (keypairs, roster) = roster_of(4);
        assert_eq!(roster.index_of(&keypairs[2].public()), Some(2));
        assert_eq!(roster.index_of(&Keypair::generate().public()), None);
    }

    #[test]
    fn test_distance() {
        let (_, a) = roster_of(4);
        let mut b = a.clone();
        assert_eq!(a.distance(&b), 0);

        let fresh = Keypair::generate();
        b.list[0].public = fresh.public();
        assert_eq!(a.distance(&b), 1);
    }
}
