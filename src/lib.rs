/*
    A skipchain is an append-only, hash-chained ledger whose blocks carry
    forward-links of increasing skip distance, so a client can jump from an
    old block to the latest one in a logarithmic number of hops while
    verifying every hop cryptographically.

    A new block is only admitted once a quorum of the previous block's
    roster has collectively signed a forward-link to it. The signature is
    produced by a tree-based collective signing round (cosi) wrapped in a
    two-phase prepare/commit protocol (bft) that tolerates up to
    floor((n-1)/3) refusing or silent nodes.
*/

pub mod bft;
pub mod common;
pub mod config;
pub mod cosi;
pub mod error;
pub mod network;
pub mod service;
pub mod skiplist;

pub use common::*;
pub use config::Config;
pub use error::{Result, SkipchainError};
