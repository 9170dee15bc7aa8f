use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::common::{Keypair, NodeId};
use crate::config::Config;
use crate::cosi::{
    run_member, CosiMessage, LinkProposal, ProposalVerifier, ProtocolContext, SessionTable,
};
use crate::error::{Result, SkipchainError};
use crate::network::{Envelope, LocalNetwork, ServiceMessage};
use crate::service::registry::{ChainView, Registry};
use crate::skiplist::{link_id, ChainStore, ForwardLink};

/*
    One node runs a single event loop over its network inbox. Signing
    traffic is routed by session id to the task driving that session; a
    fresh announcement spawns a new member task. Service traffic is
    handled inline, except for forward-link requests, which run a whole
    signing round and therefore get their own task.
*/

/// Shared, cloneable view of a running node. All service operations
/// hang off this handle.
#[derive(Clone)]
pub struct NodeHandle {
    pub node_id: NodeId,
    pub keypair: Arc<Keypair>,
    pub network: LocalNetwork,
    pub store: Arc<ChainStore>,
    pub registry: Arc<Registry>,
    pub sessions: SessionTable,
    pub config: Config,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<ServiceMessage>>>>,
}

pub struct SkipchainNode {
    handle: NodeHandle,
    inbox: mpsc::Receiver<Envelope>,
}

impl SkipchainNode {
    pub fn new(network: &LocalNetwork, node_id: NodeId, keypair: Keypair, config: Config) -> Self {
        let inbox = network.register(node_id);
        let handle = NodeHandle {
            node_id,
            keypair: Arc::new(keypair),
            network: network.clone(),
            store: Arc::new(ChainStore::new()),
            registry: Arc::new(Registry::standard()),
            sessions: SessionTable::new(),
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        SkipchainNode { handle, inbox }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Start the event loop and hand the caller a handle to the node.
    pub fn spawn(self) -> NodeHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    pub async fn run(mut self) {
        info!(node = self.handle.node_id, "node event loop starting");
        while let Some(envelope) = self.inbox.recv().await {
            match envelope {
                Envelope::Cosi { session, from, msg } => match msg {
                    CosiMessage::Announce(announce) => {
                        let rx = self
                            .handle
                            .sessions
                            .register(session, announce.roster.len());
                        let ctx = self.handle.protocol_context();
                        tokio::spawn(async move {
                            if let Err(e) = run_member(&ctx, session, announce, from, rx).await {
                                warn!(session, "member session: {}", e);
                            }
                        });
                    }
                    other => {
                        if !self.handle.sessions.route(session, from, other).await {
                            debug!(session, from, "dropping message for unknown session");
                        }
                    }
                },
                Envelope::Service { from, msg } => self.handle.handle_service(from, msg).await,
            }
        }
        info!(node = self.handle.node_id, "node event loop done");
    }
}

impl NodeHandle {
    /// Context for protocol tasks started by or on this node. Every task
    /// gets the chain-aware verifier, so the node only ever signs links
    /// it has checked against its own store.
    pub fn protocol_context(&self) -> ProtocolContext {
        ProtocolContext {
            network: self.network.clone(),
            sessions: self.sessions.clone(),
            keypair: self.keypair.clone(),
            node_id: self.node_id,
            verifier: Arc::new(LinkVerifier {
                store: self.store.clone(),
                registry: self.registry.clone(),
            }),
            config: self.config.clone(),
        }
    }

    async fn handle_service(&self, from: NodeId, msg: ServiceMessage) {
        match msg {
            ServiceMessage::Propagate(blocks) => {
                for block in blocks {
                    if let Err(e) = self.store.store(block) {
                        warn!(from, "propagated block rejected: {}", e);
                    }
                }
            }
            ServiceMessage::ForwardLinkRequest { request, proposal } => {
                let handle = self.clone();
                tokio::spawn(async move {
                    let link = match handle.sign_link(proposal).await {
                        Ok(link) => Some(link),
                        Err(e) => {
                            warn!(from, "forward-link request: {}", e);
                            None
                        }
                    };
                    let reply = ServiceMessage::ForwardLinkReply { request, link };
                    if let Err(e) = handle.send_service(from, reply).await {
                        warn!(from, "forward-link reply: {}", e);
                    }
                });
            }
            ServiceMessage::BlockRequest { request, id } => {
                let reply = ServiceMessage::BlockReply {
                    request,
                    block: self.store.get_block(&id),
                };
                if let Err(e) = self.send_service(from, reply).await {
                    warn!(from, "block reply: {}", e);
                }
            }
            ServiceMessage::ForwardLinkReply { request, .. }
            | ServiceMessage::BlockReply { request, .. } => {
                self.resolve_pending(request, msg);
            }
        }
    }

    /// Lead a signing round for the proposed forward-link. Used both for
    /// this node's own appends and on behalf of peers whose block's
    /// roster this node belongs to.
    pub async fn sign_link(&self, proposal: LinkProposal) -> Result<ForwardLink> {
        let previous = self
            .store
            .get_block(&proposal.previous)
            .ok_or_else(|| SkipchainError::BlockNotFound(proposal.previous.short()))?;
        let newest = proposal.newest.clone();
        let msg = link_id(&previous, &newest);
        let signature = crate::bft::run(
            &self.protocol_context(),
            &previous.roster,
            msg.as_ref().to_vec(),
            Some(proposal),
        )
        .await?;
        Ok(ForwardLink::new(&previous, &newest, signature))
    }

    pub async fn send_service(&self, to: NodeId, msg: ServiceMessage) -> Result<()> {
        self.network
            .send(
                to,
                Envelope::Service {
                    from: self.node_id,
                    msg,
                },
            )
            .await
    }

    /// Send a request to a peer and wait for the matching reply.
    pub async fn request(
        &self,
        to: NodeId,
        make: impl FnOnce(u64) -> ServiceMessage,
    ) -> Result<ServiceMessage> {
        let request: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request, tx);
        }
        if let Err(e) = self.send_service(to, make(request)).await {
            self.forget_pending(request);
            return Err(e);
        }
        match tokio::time::timeout(self.config.propagate_timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(SkipchainError::Transport("reply channel closed".into())),
            Err(_) => {
                self.forget_pending(request);
                Err(SkipchainError::Timeout("service reply"))
            }
        }
    }

    fn resolve_pending(&self, request: u64, msg: ServiceMessage) {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&request));
        match sender {
            Some(sender) => {
                let _ = sender.send(msg);
            }
            None => debug!(request, "dropping reply nobody waits for"),
        }
    }

    fn forget_pending(&self, request: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request);
        }
    }
}

/// Checks a proposed forward-link against this node's view of the chain
/// before the node commits to signing it. Level 0 admits a new block;
/// higher levels only shortcut to a block the chain already contains.
pub struct LinkVerifier {
    pub store: Arc<ChainStore>,
    pub registry: Arc<Registry>,
}

impl ProposalVerifier for LinkVerifier {
    fn verify(&self, msg: &[u8], data: Option<&LinkProposal>) -> bool {
        let Some(proposal) = data else {
            debug!("refusing proposal without link data");
            return false;
        };
        let newest = &proposal.newest;
        let Some(previous) = self.store.get_block(&proposal.previous) else {
            debug!(id = %proposal.previous, "refusing link from unknown block");
            return false;
        };
        if msg != link_id(&previous, newest).as_ref() {
            debug!("refusing link whose message is not the link digest");
            return false;
        }
        if newest.hash != newest.compute_hash() || newest.index == 0 {
            return false;
        }
        if newest.skipchain_id() != previous.skipchain_id() {
            return false;
        }

        let level = proposal.target_height;
        if level >= previous.height || previous.has_forward(level) {
            return false;
        }
        if newest.back_links.get(level) != Some(&previous.hash) {
            return false;
        }

        if level == 0 {
            let view = ChainView {
                previous: &previous,
                store: self.store.as_ref(),
            };
            self.registry.run(&newest.verifiers, &view, newest).is_ok()
        } else {
            // The block must already be chained in at level 0.
            let Some(pred) = self.store.get_block(&newest.back_links[0]) else {
                return false;
            };
            pred.get_forward(0).is_some_and(|l| l.to == newest.hash)
        }
    }
}
