//! The libp2p node.
//!
//! `configure` builds the whole stack in one shot: a TCP transport wrapped
//! in a private-network handshake keyed off the network id, noise security,
//! yamux muxing, and a behaviour combining gating, identify, ping, NAT
//! port-mapping, mDNS, Kademlia, gossipsub, and the application-stream
//! protocol. One task owns the swarm and drives its event loop; everything
//! else talks to it through [`Node`], the dispatcher-facing handle.

mod behaviour;
mod event_loop;
mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::core::upgrade;
use libp2p::identity::Keypair;
use libp2p::kad::store::RecordStore;
use libp2p::pnet::{PnetConfig, PreSharedKey};
use libp2p::swarm::ConnectionId;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, Transport, multiaddr::Protocol, noise,
    tcp, yamux,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::gating::{GatingConfig, GatingPolicy, SharedPolicy};
use crate::keys;
use crate::out::OutboundSink;
use crate::pubsub::{Verdict, ValidatorTable};
use crate::rpc::{ConfigureBody, PeerInfo, RpcError, Upcall, decode_b64};
use crate::seqs::SequenceSource;
use crate::streams::{OPEN_STREAM_READER_DELAY, StreamRegistry};

pub use behaviour::{Behaviour, BehaviourEvent};
use event_loop::{EventLoop, NodeCommand};

/// Kademlia protocol name under the network's protocol prefix.
pub const KAD_PROTOCOL_NAME: &str = "/coda/kad/1.0.0";

/// Gossipsub maximum message size.
pub const GOSSIP_MAX_TRANSMIT: usize = 32 * 1024 * 1024;

/// How long a validator waits for the host before reporting the fallback
/// verdict.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Local discovery query interval.
pub const MDNS_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// Period of the rendezvous re-provide and DHT peer walk.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Cap on peers dialed out of a single discovery walk.
pub const DISCOVERY_LIMIT: usize = 20;

/// Connection-manager watermarks: above the high water, peers are trimmed
/// down to the low water, sparing connections younger than the grace.
pub const CONN_LOW_WATER: usize = 25;
pub const CONN_HIGH_WATER: usize = 250;
pub const CONN_TRIM_GRACE: Duration = Duration::from_secs(30);

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(20);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_QUEUE: usize = 256;

/// Rendezvous string shared by every node of a network.
pub fn rendezvous_string(network_id: &str) -> String {
    format!("/coda/0.0.1/{network_id}")
}

/// The private-network PSK is the blake2b-256 of the rendezvous string, so
/// nodes of different networks cannot even complete a transport handshake.
fn pnet_key(rendezvous: &str) -> PreSharedKey {
    use blake2::Digest;
    let digest = blake2::Blake2b::<blake2::digest::consts::U32>::digest(rendezvous.as_bytes());
    PreSharedKey::new(digest.into())
}

/// Validated `configure` inputs.
pub struct NodeConfig {
    pub statedir: PathBuf,
    pub keypair: Keypair,
    pub rendezvous: String,
    pub listen_addrs: Vec<Multiaddr>,
    pub external_addr: Option<Multiaddr>,
    pub unsafe_no_trust_ip: bool,
    pub flood: bool,
    pub peer_exchange: bool,
    pub direct_peers: Vec<(PeerId, Multiaddr)>,
    pub seed_peers: Vec<(PeerId, Multiaddr)>,
    pub gating: GatingPolicy,
}

fn parse_peer_multiaddr(s: &str) -> Result<(PeerId, Multiaddr), RpcError> {
    let addr: Multiaddr = s
        .parse()
        .map_err(|e| RpcError::internal(format!("parsing multiaddr {s}: {e}")))?;
    let peer = addr
        .iter()
        .find_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
        .ok_or_else(|| RpcError::internal(format!("multiaddr {s} carries no /p2p/ peer id")))?;
    Ok((peer, addr))
}

impl NodeConfig {
    pub fn from_rpc(body: ConfigureBody) -> Result<Self, RpcError> {
        let keypair = keys::parse_privk(&body.privk)?;
        let listen_addrs = body
            .ifaces
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>()
                    .map_err(|e| RpcError::internal(format!("parsing listen iface {s}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let external_addr = if body.external_maddr.is_empty() {
            None
        } else {
            Some(body.external_maddr.parse::<Multiaddr>().map_err(|e| {
                RpcError::ExternalAddr(format!("parsing {}: {e}", body.external_maddr))
            })?)
        };
        let direct_peers = body
            .direct_peers
            .iter()
            .map(|s| parse_peer_multiaddr(s))
            .collect::<Result<Vec<_>, _>>()?;
        let seed_peers = body
            .seed_peers
            .iter()
            .map(|s| parse_peer_multiaddr(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NodeConfig {
            statedir: PathBuf::from(body.statedir),
            keypair,
            rendezvous: rendezvous_string(&body.network_id),
            listen_addrs,
            external_addr,
            unsafe_no_trust_ip: body.unsafe_no_trust_ip,
            flood: body.flood,
            peer_exchange: body.peer_exchange,
            direct_peers,
            seed_peers,
            gating: GatingPolicy::from_config(&body.gating_config)?,
        })
    }
}

#[derive(Clone)]
pub(crate) struct ConnEntry {
    pub id: ConnectionId,
    pub addr: Multiaddr,
    pub opened: Instant,
}

/// Open connections per peer, maintained by the event loop and read by the
/// dispatcher for `findPeer`/`listPeers` and stream bookkeeping.
pub(crate) type ConnectionTable = Arc<Mutex<HashMap<PeerId, Vec<ConnEntry>>>>;

pub(crate) fn peer_info_from(connections: &ConnectionTable, peer: &PeerId) -> Option<PeerInfo> {
    let conns = connections.lock();
    conns
        .get(peer)?
        .iter()
        .find_map(|c| PeerInfo::from_multiaddr(peer, &c.addr))
}

/// Dispatcher-facing handle to the running node.
pub struct Node {
    local_peer_id: PeerId,
    unsafe_no_trust_ip: bool,
    commands: mpsc::Sender<NodeCommand>,
    control: libp2p_stream::Control,
    connections: ConnectionTable,
    validators: Arc<ValidatorTable>,
    streams: Arc<StreamRegistry<libp2p::swarm::Stream>>,
    handlers: Mutex<HashMap<String, JoinHandle<()>>>,
    policy: SharedPolicy,
    seqs: Arc<SequenceSource>,
    out: OutboundSink,
}

impl Node {
    /// Build the swarm and spawn its event loop. Called exactly once, from
    /// the `configure` handler.
    pub fn spawn(
        mut config: NodeConfig,
        out: OutboundSink,
        seqs: Arc<SequenceSource>,
    ) -> Result<Arc<Node>, RpcError> {
        let datastore = store::Datastore::open(&config.statedir)?;
        let gating = std::mem::take(&mut config.gating);
        let policy: SharedPolicy = Arc::new(parking_lot::RwLock::new(gating));
        let local_peer_id = config.keypair.public().to_peer_id();

        let mut swarm = build_swarm(&config, policy.clone())?;
        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| RpcError::Initializing(format!("listening on {addr}: {e}")))?;
        }
        if let Some(external) = &config.external_addr {
            swarm.add_external_address(external.clone());
        }

        // Previously seen peers come back from the peerstore; seeds and
        // direct peers come from the host.
        for (peer, addr) in datastore.peer_addrs() {
            swarm.behaviour_mut().kad.add_address(&peer, addr);
        }
        for (peer, addr) in &config.seed_peers {
            swarm.behaviour_mut().kad.add_address(peer, addr.clone());
        }
        for (peer, addr) in &config.direct_peers {
            swarm.behaviour_mut().kad.add_address(peer, addr.clone());
            swarm.behaviour_mut().gossipsub.add_explicit_peer(peer);
        }
        for record in datastore.records() {
            if let Err(e) = swarm.behaviour_mut().kad.store_mut().put(record) {
                tracing::warn!("reloading DHT record failed: {e:?}");
            }
        }
        match swarm.behaviour_mut().kad.bootstrap() {
            Ok(query) => tracing::info!(?query, "DHT bootstrap started"),
            // An empty routing table just means nobody to bootstrap against
            // yet; discovery will fill it in.
            Err(e) => tracing::info!("DHT bootstrap skipped: {e}"),
        }

        let control = swarm.behaviour_mut().streams.new_control();
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));
        let validators = Arc::new(ValidatorTable::new());
        let streams = Arc::new(StreamRegistry::new(out.clone()));

        let event_loop = EventLoop::new(
            swarm,
            command_rx,
            commands.clone(),
            out.clone(),
            connections.clone(),
            validators.clone(),
            datastore,
            seqs.clone(),
            local_peer_id,
            config.rendezvous.clone(),
            config.unsafe_no_trust_ip,
            config.direct_peers.iter().map(|(p, _)| *p).collect(),
        );
        tokio::spawn(event_loop.run());

        Ok(Arc::new(Node {
            local_peer_id,
            unsafe_no_trust_ip: config.unsafe_no_trust_ip,
            commands,
            control,
            connections,
            validators,
            streams,
            handlers: Mutex::new(HashMap::new()),
            policy,
            seqs,
            out,
        }))
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RpcError::internal("node event loop stopped"))?;
        rx.await
            .map_err(|_| RpcError::internal("node event loop dropped the reply"))
    }

    pub async fn listen(&self, iface: &str) -> Result<Value, RpcError> {
        let addr: Multiaddr = iface
            .parse()
            .map_err(|e| RpcError::internal(format!("parsing multiaddr {iface}: {e}")))?;
        let addrs = self
            .command(|reply| NodeCommand::Listen { addr, reply })
            .await??;
        Ok(json!(addrs))
    }

    pub async fn listening_addrs(&self) -> Result<Value, RpcError> {
        let addrs = self
            .command(|reply| NodeCommand::ListeningAddrs { reply })
            .await?;
        Ok(json!(addrs))
    }

    pub async fn publish(&self, topic: &str, data_b64: &str) -> Result<Value, RpcError> {
        let data = decode_b64(data_b64)?;
        self.command(|reply| NodeCommand::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await??;
        Ok(json!({}))
    }

    pub async fn subscribe(&self, topic: &str, idx: u64) -> Result<Value, RpcError> {
        self.command(|reply| NodeCommand::Subscribe {
            topic: topic.to_string(),
            idx,
            reply,
        })
        .await??;
        Ok(json!({}))
    }

    pub async fn unsubscribe(&self, idx: u64) -> Result<Value, RpcError> {
        self.command(|reply| NodeCommand::Unsubscribe { idx, reply })
            .await??;
        Ok(json!({}))
    }

    /// Deliver the host's verdict for an outstanding validation ticket.
    pub fn validation_complete(&self, seqno: u64, verdict: Verdict) -> Result<Value, RpcError> {
        self.validators.complete(seqno, verdict)?;
        Ok(json!({}))
    }

    pub async fn begin_advertising(&self) -> Result<Value, RpcError> {
        self.command(|reply| NodeCommand::BeginAdvertising { reply })
            .await??;
        Ok(json!({}))
    }

    pub async fn open_stream(&self, peer: &str, protocol: &str) -> Result<Value, RpcError> {
        let peer: PeerId = peer
            .parse()
            .map_err(|_| RpcError::internal(format!("invalid peer id {peer}")))?;
        let proto = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| RpcError::internal(format!("invalid protocol name: {e}")))?;
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, proto)
            .await
            .map_err(RpcError::libp2p)?;
        let info = match peer_info_from(&self.connections, &peer) {
            Some(info) => info,
            None if self.unsafe_no_trust_ip => PeerInfo::loopback(&peer),
            None => return Err(RpcError::internal(format!("no connection info for {peer}"))),
        };
        let idx = self.seqs.next();
        self.streams.insert(
            idx,
            info.clone(),
            protocol.to_string(),
            stream,
            Some(OPEN_STREAM_READER_DELAY),
        );
        Ok(json!({ "stream_idx": idx, "peer": info }))
    }

    pub async fn close_stream(&self, idx: u64) -> Result<Value, RpcError> {
        self.streams.close(idx).await?;
        Ok(json!({}))
    }

    pub fn reset_stream(&self, idx: u64) -> Result<Value, RpcError> {
        self.streams.reset(idx)?;
        Ok(json!({}))
    }

    pub async fn send_stream_msg(&self, idx: u64, data_b64: &str) -> Result<Value, RpcError> {
        let data = decode_b64(data_b64)?;
        self.streams.send(idx, &data).await?;
        Ok(json!({}))
    }

    /// Install a server-side handler: every inbound stream under `protocol`
    /// gets registered, announced with an `incomingStream` upcall, and read.
    pub fn add_stream_handler(&self, protocol: &str) -> Result<Value, RpcError> {
        let proto = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| RpcError::internal(format!("invalid protocol name: {e}")))?;
        let mut control = self.control.clone();
        let mut incoming = control
            .accept(proto)
            .map_err(|e| RpcError::internal(format!("stream handler for {protocol}: {e}")))?;

        let protocol_name = protocol.to_string();
        let connections = self.connections.clone();
        let streams = self.streams.clone();
        let seqs = self.seqs.clone();
        let out = self.out.clone();
        let unsafe_no_trust_ip = self.unsafe_no_trust_ip;
        let task = tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let info = match peer_info_from(&connections, &peer) {
                    Some(info) => info,
                    None if unsafe_no_trust_ip => PeerInfo::loopback(&peer),
                    None => {
                        // Dropping the stream here resets it on the remote.
                        tracing::warn!(%peer, "inbound stream without a parseable remote address");
                        continue;
                    }
                };
                let idx = seqs.next();
                out.upcall(Upcall::IncomingStream {
                    peer: info.clone(),
                    stream_idx: idx,
                    protocol: protocol_name.clone(),
                })
                .await;
                streams.insert(idx, info, protocol_name.clone(), stream, None);
            }
        });
        if let Some(old) = self.handlers.lock().insert(protocol.to_string(), task) {
            old.abort();
        }
        Ok(json!({}))
    }

    /// Uninstall a handler. Streams already open under the protocol survive.
    pub fn remove_stream_handler(&self, protocol: &str) -> Result<Value, RpcError> {
        let task = self
            .handlers
            .lock()
            .remove(protocol)
            .ok_or_else(|| RpcError::internal(format!("no stream handler for {protocol}")))?;
        // Aborting drops the accept task and with it the protocol
        // registration inside the stream behaviour.
        task.abort();
        Ok(json!({}))
    }

    pub fn find_peer(&self, peer_id: &str) -> Result<Value, RpcError> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| RpcError::internal(format!("invalid peer id {peer_id}")))?;
        let info = match peer_info_from(&self.connections, &peer) {
            Some(info) => info,
            None if self.unsafe_no_trust_ip => PeerInfo::loopback(&peer),
            None => return Err(RpcError::internal(format!("peer {peer} not found"))),
        };
        serde_json::to_value(info).map_err(|e| RpcError::internal(e.to_string()))
    }

    pub fn list_peers(&self) -> Result<Value, RpcError> {
        let conns = self.connections.lock();
        let peers: Vec<PeerInfo> = conns
            .iter()
            .flat_map(|(peer, entries)| {
                entries
                    .iter()
                    .filter_map(|c| PeerInfo::from_multiaddr(peer, &c.addr))
            })
            .collect();
        serde_json::to_value(peers).map_err(|e| RpcError::internal(e.to_string()))
    }

    /// Swap the gating policy. Applies at future checkpoints only; existing
    /// connections are not torn down.
    pub fn set_gating_config(&self, config: &GatingConfig) -> Result<Value, RpcError> {
        let policy = GatingPolicy::from_config(config)?;
        *self.policy.write() = policy;
        Ok(json!({}))
    }
}

fn build_swarm(config: &NodeConfig, policy: SharedPolicy) -> Result<Swarm<Behaviour>, RpcError> {
    let psk = pnet_key(&config.rendezvous);
    let rendezvous = config.rendezvous.clone();
    let flood = config.flood;
    let peer_exchange = config.peer_exchange;
    let swarm = SwarmBuilder::with_existing_identity(config.keypair.clone())
        .with_tokio()
        .with_other_transport(|key| {
            let noise =
                noise::Config::new(key).map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                    Box::new(e)
                })?;
            let tcp = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
            let transport = tcp
                .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                .upgrade(upgrade::Version::V1)
                .authenticate(noise)
                .multiplex(yamux::Config::default())
                .timeout(TRANSPORT_TIMEOUT)
                .boxed();
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(transport)
        })
        .map_err(|e| RpcError::Initializing(format!("building transport: {e}")))?
        .with_behaviour(|key| {
            Behaviour::new(key, &rendezvous, flood, peer_exchange, policy)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
        })
        .map_err(|e| RpcError::Initializing(format!("building behaviour: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();
    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_embeds_the_network_id() {
        assert_eq!(rendezvous_string("mainnet"), "/coda/0.0.1/mainnet");
    }

    #[test]
    fn pnet_keys_differ_across_networks() {
        let a = pnet_key(&rendezvous_string("alpha")).fingerprint().to_string();
        let b = pnet_key(&rendezvous_string("beta")).fingerprint().to_string();
        assert_ne!(a, b);
        // Deterministic for the same network id.
        assert_eq!(
            a,
            pnet_key(&rendezvous_string("alpha")).fingerprint().to_string()
        );
    }

    #[test]
    fn peer_multiaddrs_need_a_peer_id() {
        assert!(parse_peer_multiaddr("/ip4/127.0.0.1/tcp/1").is_err());
        let peer = PeerId::random();
        let (parsed, addr) =
            parse_peer_multiaddr(&format!("/ip4/127.0.0.1/tcp/1/p2p/{peer}")).unwrap();
        assert_eq!(parsed, peer);
        assert!(addr.iter().any(|p| matches!(p, Protocol::Tcp(1))));
    }
}
