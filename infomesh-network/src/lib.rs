use anyhow::Result;
use async_trait::async_trait;
use futures::prelude::*;
use infomesh_proof::CreditProof;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{identity::Keypair, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// A credit-proof request sent peer-to-peer. The P2P stream/DHT layer
/// that routes these between nodes is an external collaborator — this
/// crate only defines the request/response boundary and a thin libp2p
/// demo wiring of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditProofRequest {
    pub request_id: String,
    pub sample_size: usize,
}

#[async_trait]
pub trait CreditProofTransport: Send + Sync {
    async fn request_proof(&mut self, peer: PeerId, request: CreditProofRequest) -> Result<CreditProof>;
    fn local_peer_id(&self) -> PeerId;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub seed_nodes: Vec<String>,
}

#[derive(NetworkBehaviour)]
struct InfomeshBehaviour {
    credit_proof: request_response::cbor::Behaviour<CreditProofRequest, CreditProof>,
    identify: libp2p::identify::Behaviour,
    ping: libp2p::ping::Behaviour,
}

/// Reference libp2p wiring of [`CreditProofTransport`] over a
/// request-response protocol. Not a production transport — the actual
/// peer-discovery/routing layer (Kademlia DHT, stream multiplexing
/// topology) is explicitly out of scope here.
pub struct Libp2pCreditProofTransport {
    swarm: Swarm<InfomeshBehaviour>,
}

impl Libp2pCreditProofTransport {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let local_key = Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(libp2p::core::upgrade::Version::V1)
            .authenticate(noise::Config::new(&local_key)?)
            .multiplex(yamux::Config::default())
            .boxed();

        let credit_proof = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new("/infomesh/credit-proof/1"), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(Duration::from_secs(20)),
        );
        let identify = libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
            "/infomesh/0.1".into(),
            local_key.public(),
        ));
        let ping = libp2p::ping::Behaviour::default();

        let behaviour = InfomeshBehaviour { credit_proof, identify, ping };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            libp2p::swarm::Config::with_tokio_executor(),
        );

        let listen_addr: Multiaddr = config.listen_addr.parse()?;
        swarm.listen_on(listen_addr)?;

        for addr in config.seed_nodes {
            if let Ok(ma) = addr.parse::<Multiaddr>() {
                swarm.dial(ma)?;
            }
        }

        Ok(Self { swarm })
    }

    /// Drive the swarm's event loop until `request_id` resolves, since no
    /// background task owns the swarm. A long-running node should instead
    /// spawn this loop and route responses back via channels keyed by
    /// `OutboundRequestId`, the way `schedule_batch` callers would fan out
    /// many requests concurrently.
    async fn drive_until_response(&mut self, outbound: OutboundRequestId) -> Result<CreditProof> {
        loop {
            match self.swarm.select_next_some().await {
                SwarmEvent::Behaviour(InfomeshBehaviourEvent::CreditProof(request_response::Event::Message {
                    message: request_response::Message::Response { request_id, response },
                    ..
                })) if request_id == outbound => {
                    return Ok(response);
                }
                SwarmEvent::Behaviour(InfomeshBehaviourEvent::CreditProof(request_response::Event::OutboundFailure {
                    request_id,
                    error,
                    ..
                })) if request_id == outbound => {
                    return Err(anyhow::anyhow!("credit proof request failed: {error}"));
                }
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!(event = "listening", %address);
                }
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    debug!(event = "peer_connected", %peer_id);
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl CreditProofTransport for Libp2pCreditProofTransport {
    async fn request_proof(&mut self, peer: PeerId, request: CreditProofRequest) -> Result<CreditProof> {
        let outbound = self.swarm.behaviour_mut().credit_proof.send_request(&peer, request);
        self.drive_until_response(outbound).await
    }

    fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }
}

/// In-process transport for tests and single-binary demos — answers
/// requests from a fixed map of pre-built proofs instead of dialing out.
pub struct LoopbackTransport {
    peer_id: PeerId,
    proofs: HashMap<PeerId, CreditProof>,
}

impl LoopbackTransport {
    pub fn new(proofs: HashMap<PeerId, CreditProof>) -> Self {
        Self { peer_id: PeerId::random(), proofs }
    }
}

#[async_trait]
impl CreditProofTransport for LoopbackTransport {
    async fn request_proof(&mut self, peer: PeerId, _request: CreditProofRequest) -> Result<CreditProof> {
        self.proofs
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no proof registered for peer {peer}"))
    }

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn loopback_transport_returns_registered_proof() {
        let peer = PeerId::random();
        let proof = CreditProof {
            peer_id: peer.to_string(),
            request_id: "r1".to_string(),
            total_earned: 5.0,
            total_spent: 0.0,
            action_breakdown: StdHashMap::new(),
            entry_count: 0,
            merkle_root: String::new(),
            root_signature: String::new(),
            sample_entries: Vec::new(),
            sample_proofs: Vec::new(),
            timestamp: 0.0,
            public_key: String::new(),
        };
        let mut proofs = HashMap::new();
        proofs.insert(peer, proof.clone());
        let mut transport = LoopbackTransport::new(proofs);

        let response = transport
            .request_proof(peer, CreditProofRequest { request_id: "r1".to_string(), sample_size: 10 })
            .await
            .unwrap();
        assert_eq!(response.total_earned, proof.total_earned);
    }

    #[tokio::test]
    async fn loopback_transport_errors_for_unknown_peer() {
        let mut transport = LoopbackTransport::new(HashMap::new());
        let result = transport
            .request_proof(PeerId::random(), CreditProofRequest { request_id: "r1".to_string(), sample_size: 10 })
            .await;
        assert!(result.is_err());
    }
}
