//! The swarm event loop.
//!
//! One task owns the [`Swarm`]; the dispatcher reaches it through
//! [`NodeCommand`]s with oneshot replies, and long-running flows (validator
//! waiters, the discovery ticker) feed back through the same command
//! channel. Nothing here blocks on the host: upcalls go out through the
//! outbound queue and validation verdicts come back in as commands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::gossipsub::{self, MessageAcceptance};
use libp2p::kad::store::RecordStore;
use libp2p::swarm::SwarmEvent;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::{Multiaddr, PeerId, Swarm, identify, kad, mdns};
use tokio::sync::{mpsc, oneshot};

use crate::out::OutboundSink;
use crate::pubsub::{Subscriptions, ValidatorTable};
use crate::rpc::{PeerInfo, RpcError, Upcall, encode_b64};
use crate::seqs::SequenceSource;

use super::store::Datastore;
use super::{
    Behaviour, BehaviourEvent, CONN_HIGH_WATER, CONN_LOW_WATER, CONN_TRIM_GRACE, ConnEntry,
    ConnectionTable, DISCOVERY_INTERVAL, DISCOVERY_LIMIT, VALIDATION_TIMEOUT, peer_info_from,
};

type ListenReply = oneshot::Sender<Result<Vec<String>, RpcError>>;

pub(crate) enum NodeCommand {
    Listen {
        addr: Multiaddr,
        reply: ListenReply,
    },
    ListeningAddrs {
        reply: oneshot::Sender<Vec<String>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    Subscribe {
        topic: String,
        idx: u64,
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    Unsubscribe {
        idx: u64,
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    BeginAdvertising {
        reply: oneshot::Sender<Result<(), RpcError>>,
    },
    ReportValidation {
        message_id: gossipsub::MessageId,
        source: PeerId,
        acceptance: MessageAcceptance,
    },
    DiscoveryTick,
}

pub(crate) struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<NodeCommand>,
    command_tx: mpsc::Sender<NodeCommand>,
    out: OutboundSink,
    connections: ConnectionTable,
    validators: Arc<ValidatorTable>,
    subscriptions: Subscriptions,
    datastore: Datastore,
    seqs: Arc<SequenceSource>,
    local_peer_id: PeerId,
    rendezvous: String,
    unsafe_no_trust_ip: bool,
    direct_peers: HashSet<PeerId>,
    advertising: bool,
    ticker_running: bool,
    pending_listens: HashMap<ListenerId, ListenReply>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<Behaviour>,
        commands: mpsc::Receiver<NodeCommand>,
        command_tx: mpsc::Sender<NodeCommand>,
        out: OutboundSink,
        connections: ConnectionTable,
        validators: Arc<ValidatorTable>,
        datastore: Datastore,
        seqs: Arc<SequenceSource>,
        local_peer_id: PeerId,
        rendezvous: String,
        unsafe_no_trust_ip: bool,
        direct_peers: HashSet<PeerId>,
    ) -> Self {
        EventLoop {
            swarm,
            commands,
            command_tx,
            out,
            connections,
            validators,
            subscriptions: Subscriptions::new(),
            datastore,
            seqs,
            local_peer_id,
            rendezvous,
            unsafe_no_trust_ip,
            direct_peers,
            advertising: false,
            ticker_running: false,
            pending_listens: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }
        tracing::info!("node event loop stopped");
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let addr = endpoint.get_remote_address().clone();
                self.connections
                    .lock()
                    .entry(peer_id)
                    .or_default()
                    .push(ConnEntry {
                        id: connection_id,
                        addr: addr.clone(),
                        opened: Instant::now(),
                    });
                tracing::info!(%peer_id, %addr, "connection established");
                if self.advertising {
                    self.out
                        .upcall(Upcall::DiscoveredPeer {
                            peer_id: peer_id.to_base58(),
                            multiaddrs: vec![addr.to_string()],
                        })
                        .await;
                }
                self.maybe_trim();
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                let mut conns = self.connections.lock();
                if let Some(entries) = conns.get_mut(&peer_id) {
                    entries.retain(|c| c.id != connection_id);
                    if entries.is_empty() {
                        conns.remove(&peer_id);
                    }
                }
                drop(conns);
                tracing::debug!(%peer_id, "connection closed");
            }
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                tracing::info!(%address, "listening");
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let addr = address
                        .with_p2p(self.local_peer_id)
                        .unwrap_or_else(|a| a)
                        .to_string();
                    let _ = reply.send(Ok(vec![addr]));
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                tracing::warn!(?listener_id, "listener error: {error}");
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Err(RpcError::Libp2p(format!("listen failed: {error}"))));
                }
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Err(RpcError::Libp2p(format!(
                        "listener closed: {reason:?}"
                    ))));
                }
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                tracing::debug!("incoming connection failed: {error}");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!(?peer_id, "outgoing connection failed: {error}");
            }
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Gating(event) => match event {},
            BehaviourEvent::Ping(_) => {}
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                // Learned listen addresses feed the routing table and come
                // back on restart through the peerstore.
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    self.datastore.add_peer_addr(&peer_id, &addr);
                }
            }
            BehaviourEvent::Identify(_) => {}
            BehaviourEvent::Upnp(event) => {
                tracing::debug!(?event, "upnp");
            }
            BehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer, addr) in peers {
                    if peer == self.local_peer_id {
                        continue;
                    }
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer, addr.clone());
                    self.datastore.add_peer_addr(&peer, &addr);
                    if self.advertising {
                        self.out
                            .upcall(Upcall::DiscoveredPeer {
                                peer_id: peer.to_base58(),
                                multiaddrs: vec![addr.to_string()],
                            })
                            .await;
                        let dial = DialOpts::peer_id(peer)
                            .condition(PeerCondition::Disconnected)
                            .addresses(vec![addr])
                            .extend_addresses_through_behaviour()
                            .build();
                        if let Err(e) = self.swarm.dial(dial) {
                            tracing::debug!(%peer, "dialing mDNS peer failed: {e}");
                        }
                    }
                }
            }
            BehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                tracing::debug!(expired = peers.len(), "mDNS records expired");
            }
            BehaviourEvent::Kad(event) => self.handle_kad_event(event),
            BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message_id,
                message,
            }) => {
                self.handle_gossip_message(propagation_source, message_id, message)
                    .await;
            }
            BehaviourEvent::Gossipsub(event) => {
                tracing::debug!(?event, "gossipsub");
            }
            BehaviourEvent::Streams(_) => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::InboundRequest {
                request:
                    kad::InboundRequest::PutRecord {
                        source,
                        record: Some(record),
                        ..
                    },
            } => {
                // Only public-key records are accepted; notably this keeps
                // IPNS and other namespaces out of the table.
                if record.key.as_ref().starts_with(b"/pk/") {
                    self.datastore.put_record(&record);
                    if let Err(e) = self.swarm.behaviour_mut().kad.store_mut().put(record) {
                        tracing::warn!("storing DHT record failed: {e:?}");
                    }
                } else {
                    tracing::debug!(%source, "dropping DHT record outside the /pk namespace");
                }
            }
            kad::Event::OutboundQueryProgressed {
                result:
                    kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                        providers,
                        ..
                    })),
                ..
            } => {
                for provider in providers.into_iter().take(DISCOVERY_LIMIT) {
                    if provider == self.local_peer_id || self.swarm.is_connected(&provider) {
                        continue;
                    }
                    let dial = DialOpts::peer_id(provider)
                        .condition(PeerCondition::Disconnected)
                        .build();
                    if let Err(e) = self.swarm.dial(dial) {
                        tracing::debug!(%provider, "dialing rendezvous provider failed: {e}");
                    }
                }
            }
            kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::Bootstrap(result),
                ..
            } => {
                tracing::debug!(?result, "DHT bootstrap progress");
            }
            kad::Event::RoutingUpdated { peer, .. } => {
                tracing::trace!(%peer, "routing table updated");
            }
            _ => {}
        }
    }

    /// Bridge an inbound gossip message to the host. The message is parked
    /// inside gossipsub until a verdict is reported, either the host's or
    /// the deadline fallback.
    async fn handle_gossip_message(
        &mut self,
        source: PeerId,
        message_id: gossipsub::MessageId,
        message: gossipsub::Message,
    ) {
        let Some(subscription_idx) = self.subscriptions.idx_for(&message.topic) else {
            // The subscription is gone (unsubscribe raced the delivery).
            self.report_validation(&message_id, &source, MessageAcceptance::Ignore);
            return;
        };
        if message.source == Some(self.local_peer_id) {
            // Our own messages skip the host round-trip.
            self.report_validation(&message_id, &source, MessageAcceptance::Accept);
            return;
        }

        let seqno = self.seqs.next();
        let rx = self.validators.insert(seqno);
        let sender = match peer_info_from(&self.connections, &source) {
            Some(info) => info,
            None if self.unsafe_no_trust_ip => PeerInfo::loopback(&source),
            None => {
                self.validators.discard(seqno);
                self.report_validation(&message_id, &source, MessageAcceptance::Ignore);
                return;
            }
        };

        self.out
            .upcall(Upcall::Validate {
                sender,
                data: encode_b64(&message.data),
                seqno,
                subscription_idx,
            })
            .await;

        let validators = self.validators.clone();
        let command_tx = self.command_tx.clone();
        let unsafe_no_trust_ip = self.unsafe_no_trust_ip;
        tokio::spawn(async move {
            let mut rx = rx;
            let acceptance = match tokio::time::timeout(VALIDATION_TIMEOUT, &mut rx).await {
                Ok(Ok(verdict)) => verdict.acceptance(),
                Ok(Err(_)) => MessageAcceptance::Ignore,
                Err(_) => {
                    // Deadline fired. Report the fallback but keep the
                    // ticket: a late host answer is still accepted and
                    // logged by the table.
                    validators.mark_timed_out(seqno);
                    let fallback = if unsafe_no_trust_ip {
                        MessageAcceptance::Accept
                    } else {
                        MessageAcceptance::Reject
                    };
                    tracing::warn!(seqno, "validation timed out, reporting fallback verdict");
                    let _ = command_tx
                        .send(NodeCommand::ReportValidation {
                            message_id,
                            source,
                            acceptance: fallback,
                        })
                        .await;
                    let _ = rx.await;
                    return;
                }
            };
            let _ = command_tx
                .send(NodeCommand::ReportValidation {
                    message_id,
                    source,
                    acceptance,
                })
                .await;
        });
    }

    fn report_validation(
        &mut self,
        message_id: &gossipsub::MessageId,
        source: &PeerId,
        acceptance: MessageAcceptance,
    ) {
        let reported = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .report_message_validation_result(message_id, source, acceptance);
        tracing::trace!(?reported, "reported message validation result");
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Listen { addr, reply } => match self.swarm.listen_on(addr) {
                Ok(listener_id) => {
                    // Answered once the listener reports its address.
                    self.pending_listens.insert(listener_id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(RpcError::Libp2p(format!("listen failed: {e}"))));
                }
            },
            NodeCommand::ListeningAddrs { reply } => {
                let peer = self.local_peer_id;
                let addrs: Vec<String> = self
                    .swarm
                    .listeners()
                    .cloned()
                    .chain(self.swarm.external_addresses().cloned())
                    .map(|a| a.with_p2p(peer).unwrap_or_else(|a| a).to_string())
                    .collect();
                let _ = reply.send(addrs);
            }
            NodeCommand::Publish { topic, data, reply } => {
                let topic = gossipsub::IdentTopic::new(topic);
                let result = match self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    Ok(_) => Ok(()),
                    Err(e) => Err(RpcError::Libp2p(format!("publish failed: {e}"))),
                };
                let _ = reply.send(result);
            }
            NodeCommand::Subscribe { topic, idx, reply } => {
                let topic_obj = gossipsub::IdentTopic::new(&topic);
                let result = if !self
                    .subscriptions
                    .insert(idx, topic.clone(), topic_obj.hash())
                {
                    Err(RpcError::internal(format!(
                        "subscription idx {idx} already in use"
                    )))
                } else {
                    match self.swarm.behaviour_mut().gossipsub.subscribe(&topic_obj) {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            self.subscriptions.remove(idx);
                            Err(RpcError::Libp2p(format!("subscribe failed: {e}")))
                        }
                    }
                };
                let _ = reply.send(result);
            }
            NodeCommand::Unsubscribe { idx, reply } => {
                let result = match self.subscriptions.remove(idx) {
                    Some(entry) => {
                        if !self.subscriptions.topic_in_use(&entry.hash) {
                            let topic = gossipsub::IdentTopic::new(&entry.topic);
                            let unsubscribed =
                                self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                            tracing::debug!(?unsubscribed, topic = %entry.topic, "unsubscribed");
                        }
                        Ok(())
                    }
                    None => Err(RpcError::internal(format!("unknown subscription_idx {idx}"))),
                };
                let _ = reply.send(result);
            }
            NodeCommand::BeginAdvertising { reply } => {
                self.advertising = true;
                let key = kad::RecordKey::new(&self.rendezvous);
                let result = match self.swarm.behaviour_mut().kad.start_providing(key) {
                    Ok(_) => {
                        self.discovery_walk();
                        if !self.ticker_running {
                            self.ticker_running = true;
                            let tx = self.command_tx.clone();
                            tokio::spawn(async move {
                                let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
                                interval.tick().await;
                                loop {
                                    interval.tick().await;
                                    if tx.send(NodeCommand::DiscoveryTick).await.is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        Ok(())
                    }
                    Err(e) => Err(RpcError::internal(format!("advertising rendezvous: {e}"))),
                };
                let _ = reply.send(result);
            }
            NodeCommand::ReportValidation {
                message_id,
                source,
                acceptance,
            } => {
                self.report_validation(&message_id, &source, acceptance);
            }
            NodeCommand::DiscoveryTick => self.discovery_walk(),
        }
    }

    /// Re-provide the rendezvous key and walk the DHT for fresh peers.
    fn discovery_walk(&mut self) {
        let key = kad::RecordKey::new(&self.rendezvous);
        self.swarm.behaviour_mut().kad.get_providers(key);
        self.swarm
            .behaviour_mut()
            .kad
            .get_closest_peers(PeerId::random());
    }

    /// Connection-manager trimming: past the high water, drop the oldest
    /// non-direct peers down to the low water, sparing anything younger
    /// than the grace period.
    fn maybe_trim(&mut self) {
        let candidates: Vec<(PeerId, Instant)> = {
            let conns = self.connections.lock();
            if conns.len() <= CONN_HIGH_WATER {
                return;
            }
            conns
                .iter()
                .filter(|(peer, _)| !self.direct_peers.contains(peer))
                .map(|(peer, entries)| {
                    let oldest = entries
                        .iter()
                        .map(|c| c.opened)
                        .min()
                        .unwrap_or_else(Instant::now);
                    (*peer, oldest)
                })
                .collect()
        };
        let excess = {
            let total = self.connections.lock().len();
            total.saturating_sub(CONN_LOW_WATER)
        };
        let mut sorted = candidates;
        sorted.sort_by_key(|(_, opened)| *opened);
        let mut trimmed = 0;
        for (peer, opened) in sorted {
            if trimmed >= excess {
                break;
            }
            if opened.elapsed() < CONN_TRIM_GRACE {
                continue;
            }
            if self.swarm.disconnect_peer_id(peer).is_ok() {
                trimmed += 1;
            }
        }
        if trimmed > 0 {
            tracing::info!(trimmed, "trimmed connections over the high water mark");
        }
    }
}
