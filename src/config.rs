use std::time::Duration;

/// Timing and tree-shape parameters for the signing protocol and the
/// service. Constructed once at startup and passed into every node; there
/// is no global configuration state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound for one whole cosi round seen from the root.
    pub round_timeout: Duration,
    /// How long the root waits for a sub-leader's aggregate before it
    /// regenerates the subtree with a different sub-leader.
    pub subleader_timeout: Duration,
    /// How long a sub-leader waits for its leaves' commitments.
    pub leaf_timeout: Duration,
    /// Upper bound for block propagation and remote block fetches.
    pub propagate_timeout: Duration,
    /// Number of delegated subtrees. 0 picks roughly sqrt(n - 1).
    pub n_subtrees: usize,
    /// How many replacement sub-leaders are tried per unresponsive subtree
    /// before the whole subtree is given up and masked as absent.
    pub max_subleader_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            round_timeout: Duration::from_secs(5),
            subleader_timeout: Duration::from_secs(2),
            leaf_timeout: Duration::from_secs(1),
            propagate_timeout: Duration::from_secs(15),
            n_subtrees: 0,
            max_subleader_retries: 2,
        }
    }
}
