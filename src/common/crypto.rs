use std::fmt;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::rngs::OsRng;
use sha2::{Digest as ShaDigest, Sha512};

use crate::error::{Result, SkipchainError};

/*
    The collective signature is a Schnorr signature over the ristretto
    group. Every contributing node i draws a nonce r_i and publishes the
    commitment R_i = r_i * G. The root aggregates R = sum(R_i), derives the
    challenge c = H(R | A' | tag | msg) where A' is the aggregate public key
    reduced by the absent signers, and every contributor answers with
    s_i = r_i + c * x_i. The pair (R, sum(s_i)) plus the exception list is
    the signature; a verifier recomputes A' from the exception list and
    checks s * G == R + c * A'.
*/

pub type Digest = [u8; 64];

pub trait Hashable {
    fn hash(&self) -> BlockId;
}

/// Sha512 content hash identifying a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub Digest);

impl BlockId {
    pub const NULL: BlockId = BlockId([0u8; 64]);

    pub fn from_digest(hasher: Sha512) -> Self {
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&hasher.finalize());
        BlockId(digest)
    }

    pub fn random() -> Self {
        let mut digest = [0u8; 64];
        rand::RngCore::fill_bytes(&mut OsRng, &mut digest);
        BlockId(digest)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 64]
    }

    /// Only the 8 first bytes as a hex string, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for BlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Compressed ristretto point identifying a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub key: [u8; 32],
}

impl PublicKey {
    pub fn point(&self) -> Result<RistrettoPoint> {
        CompressedRistretto(self.key)
            .decompress()
            .ok_or_else(|| SkipchainError::InvalidParameters("malformed public key".into()))
    }
}

impl From<&RistrettoPoint> for PublicKey {
    fn from(point: &RistrettoPoint) -> Self {
        PublicKey {
            key: point.compress().to_bytes(),
        }
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.key[..8]))
    }
}

pub struct Keypair {
    secret: Scalar,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = Scalar::random(&mut OsRng);
        let public = PublicKey::from(&RistrettoPoint::mul_base(&secret));
        Keypair { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Partial response for a challenge, using the nonce drawn in the
    /// commitment phase.
    pub fn respond(&self, nonce: &Nonce, challenge: &Scalar) -> Scalar {
        nonce.secret + challenge * self.secret
    }
}

/// One-round commitment secret. The secret scalar never leaves the node
/// that drew it; only the commitment point is sent up the tree.
pub struct Nonce {
    secret: Scalar,
    pub commitment: RistrettoPoint,
}

impl Nonce {
    pub fn generate() -> Self {
        let secret = Scalar::random(&mut OsRng);
        Nonce {
            secret,
            commitment: RistrettoPoint::mul_base(&secret),
        }
    }
}

/// Fiat-Shamir challenge, domain-separated by a round tag so the prepare
/// and commit rounds over the same proposal never share a challenge.
pub fn challenge(
    commitment: &RistrettoPoint,
    aggregate: &RistrettoPoint,
    tag: &[u8],
    msg: &[u8],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(commitment.compress().as_bytes());
    hasher.update(aggregate.compress().as_bytes());
    hasher.update(tag);
    hasher.update(msg);
    Scalar::from_hash(hasher)
}

/// Aggregate public key of all roster members except the excepted indices.
pub fn reduced_aggregate(publics: &[PublicKey], exceptions: &[usize]) -> Result<RistrettoPoint> {
    let mut aggregate = RistrettoPoint::identity();
    for (i, public) in publics.iter().enumerate() {
        if exceptions.contains(&i) {
            continue;
        }
        aggregate += public.point()?;
    }
    Ok(aggregate)
}

/// Whether a signature carrying exceptions is acceptable to a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Every roster member must have contributed.
    Complete,
    /// Up to this many members may be missing from the signer set.
    Threshold(usize),
}

impl Policy {
    pub fn accepts(&self, exceptions: usize) -> bool {
        match self {
            Policy::Complete => exceptions == 0,
            Policy::Threshold(max) => exceptions <= *max,
        }
    }
}

/// Aggregate Schnorr signature plus the list of roster indices that did
/// not contribute. Verifiers use the exceptions to recompute the reduced
/// aggregate public key before checking the equation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectiveSignature {
    pub commitment: RistrettoPoint,
    pub response: Scalar,
    pub exceptions: Vec<usize>,
}

impl CollectiveSignature {
    pub fn verify(&self, publics: &[PublicKey], tag: &[u8], msg: &[u8]) -> Result<()> {
        if publics.is_empty() {
            return Err(SkipchainError::InvalidSignature("empty roster".into()));
        }
        if self.exceptions.len() >= publics.len() {
            return Err(SkipchainError::InvalidSignature(
                "exception list covers the whole roster".into(),
            ));
        }
        for index in &self.exceptions {
            if *index >= publics.len() {
                return Err(SkipchainError::InvalidSignature(format!(
                    "exception index {} out of range",
                    index
                )));
            }
        }

        let aggregate = reduced_aggregate(publics, &self.exceptions)?;
        let c = challenge(&self.commitment, &aggregate, tag, msg);
        if RistrettoPoint::mul_base(&self.response) == self.commitment + aggregate * c {
            Ok(())
        } else {
            Err(SkipchainError::InvalidSignature(
                "schnorr equation does not hold".into(),
            ))
        }
    }

    /// Verify the signature and check the exception count against a policy.
    pub fn verify_with_policy(
        &self,
        publics: &[PublicKey],
        tag: &[u8],
        msg: &[u8],
        policy: Policy,
    ) -> Result<()> {
        if !policy.accepts(self.exceptions.len()) {
            return Err(SkipchainError::NoQuorum(format!(
                "{} of {} nodes did not sign",
                self.exceptions.len(),
                publics.len()
            )));
        }
        self.verify(publics, tag, msg)
    }
}
