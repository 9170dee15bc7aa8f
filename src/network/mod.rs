use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

use crate::common::{BlockId, NodeId};
use crate::cosi::{CosiMessage, LinkProposal, SessionId};
use crate::error::{Result, SkipchainError};
use crate::skiplist::{ForwardLink, SkipBlock};

/*
    Transport between nodes. Every node registers under its id and gets a
    receiver for its inbox; senders address peers by id. Delivery is
    reliable and ordered per sender, which is what an in-process channel
    gives us for free. A node that has gone away simply stops receiving:
    sends to it fail with a transport error and the protocol layers treat
    that the same as a timeout.
*/

const INBOX_CAPACITY: usize = 256;

/// Everything that travels between nodes.
#[derive(Clone, Debug)]
pub enum Envelope {
    /// A message of one collective-signing session.
    Cosi {
        session: SessionId,
        from: NodeId,
        msg: CosiMessage,
    },
    /// Node-to-node service traffic outside any signing session.
    Service { from: NodeId, msg: ServiceMessage },
}

#[derive(Clone, Debug)]
pub enum ServiceMessage {
    /// New or updated blocks pushed to the rest of the roster.
    Propagate(Vec<SkipBlock>),
    /// Ask a member of the target block's roster to run a signing round
    /// for a higher-level forward-link.
    ForwardLinkRequest { request: u64, proposal: LinkProposal },
    ForwardLinkReply {
        request: u64,
        link: Option<ForwardLink>,
    },
    /// Ask a peer for one block by hash.
    BlockRequest { request: u64, id: BlockId },
    BlockReply {
        request: u64,
        block: Option<SkipBlock>,
    },
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Envelope>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and hand back its inbox.
    pub fn register(&self, id: NodeId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(id, tx);
        }
        rx
    }

    pub fn unregister(&self, id: NodeId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    pub async fn send(&self, to: NodeId, envelope: Envelope) -> Result<()> {
        let sender = self
            .peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&to).cloned())
            .ok_or_else(|| SkipchainError::Transport(format!("unknown peer {}", to)))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| SkipchainError::Transport(format!("peer {} is gone", to)))
    }

    /// Best-effort send to a list of peers; unreachable peers are logged
    /// and skipped.
    pub async fn broadcast(&self, to: &[NodeId], envelope: Envelope) {
        for id in to {
            if let Err(e) = self.send(*id, envelope.clone()).await {
                warn!(peer = id, "broadcast: {}", e);
            }
        }
    }
}
