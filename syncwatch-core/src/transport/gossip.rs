//! libp2p gossipsub transport
//!
//! One gossipsub topic per room channel. Peers on the local network are
//! found with mDNS; remote peers can be dialed explicitly. The swarm runs in
//! its own task and is driven by commands, the same way for every room.

use std::collections::HashMap;
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::stream::{BoxStream, StreamExt};
use libp2p::{
    gossipsub, identify, identity, mdns, noise, ping,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{topic_name, BroadcastTransport, TransportError};
use crate::sync::Channel;

const PROTOCOL_VERSION: &str = "/syncwatch/1.0.0";

/// Gossip transport configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Whether to enable mDNS for local network discovery
    pub enable_mdns: bool,
    /// Multiaddrs to listen on
    pub listen_addresses: Vec<String>,
    /// Multiaddrs dialed at startup
    pub bootstrap_peers: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
            ],
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(NetworkBehaviour)]
struct SyncwatchBehaviour {
    /// Ping for connection keep-alive
    ping: ping::Behaviour,
    /// mDNS for local network discovery
    mdns: Toggle<mdns::tokio::Behaviour>,
    /// Peer identification
    identify: identify::Behaviour,
    /// Pub/sub for room channels
    gossipsub: gossipsub::Behaviour,
}

enum GossipCommand {
    Subscribe {
        topic: String,
        sender: fmpsc::UnboundedSender<Vec<u8>>,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
    Dial {
        multiaddr: String,
    },
    Shutdown,
}

/// Handle to the running swarm
pub struct GossipTransport {
    command_tx: mpsc::UnboundedSender<GossipCommand>,
    local_peer_id: String,
}

impl GossipTransport {
    /// Build the swarm and spawn its event loop on the current runtime
    pub fn start(config: GossipConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Setup(format!("no tokio runtime: {}", e)))?;
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        let mut swarm = create_swarm(keypair, config.enable_mdns)?;
        for addr in &config.listen_addresses {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|e| TransportError::Setup(format!("invalid listen address {}: {}", addr, e)))?;
            match swarm.listen_on(addr.clone()) {
                Ok(id) => info!("Listener {:?} started on {}", id, addr),
                Err(e) => warn!("Failed to listen on {}: {:?}", addr, e),
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        for multiaddr in config.bootstrap_peers {
            let _ = command_tx.send(GossipCommand::Dial { multiaddr });
        }

        let event_loop = GossipEventLoop {
            local_peer_id,
            subscriptions: HashMap::new(),
        };
        runtime.spawn(event_loop.run(swarm, command_rx));

        Ok(Self {
            command_tx,
            local_peer_id: local_peer_id.to_string(),
        })
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(GossipCommand::Shutdown);
    }

    fn send(&self, command: GossipCommand) -> Result<(), TransportError> {
        self.command_tx.send(command).map_err(|_| TransportError::Closed)
    }
}

impl Drop for GossipTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BroadcastTransport for GossipTransport {
    fn publish(&self, room_id: &str, channel: Channel, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(GossipCommand::Publish {
            topic: topic_name(room_id, channel),
            data: payload,
        })
    }

    fn subscribe(&self, room_id: &str, channel: Channel) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let (sender, receiver) = fmpsc::unbounded();
        self.send(GossipCommand::Subscribe {
            topic: topic_name(room_id, channel),
            sender,
        })?;
        Ok(receiver.boxed())
    }

    fn unsubscribe(&self, room_id: &str, channel: Channel) {
        let _ = self.send(GossipCommand::Unsubscribe {
            topic: topic_name(room_id, channel),
        });
    }
}

fn create_swarm(keypair: identity::Keypair, enable_mdns: bool) -> Result<Swarm<SyncwatchBehaviour>, TransportError> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| TransportError::Setup(e.to_string()))?
        .with_quic()
        .with_behaviour(|keypair| {
            let ping = ping::Behaviour::new(
                ping::Config::new()
                    .with_interval(Duration::from_secs(15))
                    .with_timeout(Duration::from_secs(20)),
            );

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    keypair.public().to_peer_id(),
                )
                .map_err(|e| e.to_string())?)
            } else {
                None
            };

            // Must satisfy: mesh_outbound_min <= mesh_n_low <= mesh_n <= mesh_n_high
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .mesh_outbound_min(0)
                .mesh_n_low(1)
                .mesh_n(3)
                .mesh_n_high(6)
                .gossip_lazy(3)
                .build()
                .map_err(|e| e.to_string())?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                gossipsub_config,
            )
            .map_err(|e| e.to_string())?;

            let identify = identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.into(),
                keypair.public(),
            ));

            Ok(SyncwatchBehaviour {
                ping,
                mdns: Toggle::from(mdns),
                identify,
                gossipsub,
            })
        })
        .map_err(|e| TransportError::Setup(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(300)))
        .build();

    Ok(swarm)
}

struct GossipEventLoop {
    local_peer_id: PeerId,
    /// Topic hash -> (topic, listener)
    subscriptions: HashMap<gossipsub::TopicHash, (gossipsub::IdentTopic, fmpsc::UnboundedSender<Vec<u8>>)>,
}

impl GossipEventLoop {
    async fn run(mut self, mut swarm: Swarm<SyncwatchBehaviour>, mut command_rx: mpsc::UnboundedReceiver<GossipCommand>) {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event);
                }
                command = command_rx.recv() => {
                    match command {
                        Some(GossipCommand::Shutdown) | None => {
                            info!("Gossip transport shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(&mut swarm, command),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, swarm: &mut Swarm<SyncwatchBehaviour>, command: GossipCommand) {
        match command {
            GossipCommand::Subscribe { topic, sender } => {
                let topic = gossipsub::IdentTopic::new(topic);
                match swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                    Ok(_) => {
                        info!("Subscribed to {}", topic);
                        self.subscriptions.insert(topic.hash(), (topic, sender));
                    }
                    Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
                }
            }
            GossipCommand::Unsubscribe { topic } => {
                let topic = gossipsub::IdentTopic::new(topic);
                // Dropping the sender ends the subscriber's stream
                self.subscriptions.remove(&topic.hash());
                let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                info!("Unsubscribed from {}", topic);
            }
            GossipCommand::Publish { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                    debug!("Publish to {} failed (may be no peers yet): {}", topic, e);
                }
            }
            GossipCommand::Dial { multiaddr } => match multiaddr.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Dialing peer at {}", addr);
                    if let Err(e) = swarm.dial(addr) {
                        warn!("Failed to dial peer: {}", e);
                    }
                }
                Err(e) => warn!("Invalid multiaddr {}: {}", multiaddr, e),
            },
            GossipCommand::Shutdown => {}
        }
    }

    fn handle_swarm_event(&mut self, swarm: &mut Swarm<SyncwatchBehaviour>, event: SwarmEvent<SyncwatchBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}/p2p/{}", address, self.local_peer_id);
            }

            SwarmEvent::Behaviour(SyncwatchBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if peer_id != self.local_peer_id {
                        info!("mDNS discovered peer: {} at {}", peer_id, addr);
                        swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        if swarm.dial(addr).is_ok() {
                            debug!("Dialing discovered peer {}", peer_id);
                        }
                    }
                }
            }

            SwarmEvent::Behaviour(SyncwatchBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                }
            }

            SwarmEvent::Behaviour(SyncwatchBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let Some((_, sender)) = self.subscriptions.get(&message.topic) else {
                    return;
                };
                debug!(
                    "Received {} bytes on {} via {}",
                    message.data.len(),
                    message.topic,
                    propagation_source
                );
                if sender.unbounded_send(message.data).is_err() {
                    debug!("Listener for {} is gone", message.topic);
                }
            }

            SwarmEvent::Behaviour(SyncwatchBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                if self.subscriptions.contains_key(&topic) {
                    debug!("Peer {} subscribed to {}", peer_id, topic);
                }
            }

            SwarmEvent::Behaviour(SyncwatchBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                info!("Identified peer {} running {}", peer_id, info.protocol_version);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                info!("Connection established with {} via {:?}", peer_id, endpoint);
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!("Connection closed with {}", peer_id);
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => match peer_id {
                Some(peer) => warn!("Failed to connect to {}: {}", peer, error),
                None => warn!("Outgoing connection error: {}", error),
            },

            _ => {}
        }
    }
}
