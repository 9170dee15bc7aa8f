use crate::error::{Result, SkipchainError};

/*
    The protocol tree has three levels: the root, a row of subleaders and
    the leaves under them. All entries are roster indices. Subleaders are
    the only point of failure that needs handling mid-round: when one
    stays silent the root promotes a leaf of the same subtree and replays
    the announcement.
*/

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subtree {
    pub subleader: usize,
    pub leaves: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct Tree {
    pub root: usize,
    pub subtrees: Vec<Subtree>,
}

/// Subtree count giving roughly equal fan-out at both levels.
pub fn default_subtrees(n: usize) -> usize {
    let mut k = 0;
    while (k + 1) * (k + 1) <= n.saturating_sub(1) {
        k += 1;
    }
    k.max(usize::from(n > 1))
}

impl Tree {
    /// Build the tree for a roster of `n` nodes with the given root
    /// index. Members are ordered by roster index, rotated to start right
    /// after the root, so every member can predict the layout.
    pub fn new(n: usize, root: usize, n_subtrees: usize) -> Result<Self> {
        if root >= n {
            return Err(SkipchainError::InvalidParameters(format!(
                "tree root {} outside roster of {}",
                root, n
            )));
        }
        let others: Vec<usize> = (root + 1..n).chain(0..root).collect();
        if others.is_empty() {
            return Ok(Tree {
                root,
                subtrees: vec![],
            });
        }

        let k = if n_subtrees == 0 {
            default_subtrees(n)
        } else {
            n_subtrees.min(others.len())
        };
        let mut subtrees: Vec<Subtree> = others[..k]
            .iter()
            .map(|&subleader| Subtree {
                subleader,
                leaves: vec![],
            })
            .collect();
        for (i, &leaf) in others[k..].iter().enumerate() {
            subtrees[i % k].leaves.push(leaf);
        }
        Ok(Tree { root, subtrees })
    }

    /// Replace a silent subleader with its first leaf; the old subleader
    /// is demoted to the back of the leaf row. Returns the new subleader,
    /// or `None` when the subtree has no leaf left to promote.
    pub fn regenerate(&mut self, subtree: usize) -> Option<usize> {
        let subtree = self.subtrees.get_mut(subtree)?;
        if subtree.leaves.is_empty() {
            return None;
        }
        let promoted = subtree.leaves.remove(0);
        subtree.leaves.push(subtree.subleader);
        subtree.subleader = promoted;
        Some(promoted)
    }

    /// All roster indices of one subtree, subleader included.
    pub fn subtree_members(&self, subtree: usize) -> Vec<usize> {
        self.subtrees
            .get(subtree)
            .map(|s| {
                std::iter::once(s.subleader)
                    .chain(s.leaves.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }
}
