//! Discovery registry: reconcile advertisement events into a stable, ordered peer list.
//!
//! `Registry` is host-driven and does no I/O: the host passes resolution/lost events and a
//! clock, the registry returns the resulting events. `Discovery` wraps it for sharing across
//! tasks and fans events out to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::DiscoveryError;

const EVENT_CAPACITY: usize = 256;

/// TXT key carrying a stable identity; falls back to the service instance name.
pub const TXT_ID: &str = "id";
/// TXT key carrying an explicit device kind.
pub const TXT_KIND: &str = "kind";
/// TXT key carrying a hardware model string, used for kind inference.
pub const TXT_MODEL: &str = "model";

/// Ordered kind inference rules; first match wins.
const KIND_RULES: &[(PeerKind, &[&str])] = &[
    (
        PeerKind::Tv,
        &["tv", "television", "chromecast", "firestick", "roku"],
    ),
    (
        PeerKind::Laptop,
        &["laptop", "macbook", "notebook", "desktop", "computer", "imac", "pc"],
    ),
    (PeerKind::Server, &["server", "nas", "srv"]),
];

/// Raw service advertisement as resolved by the platform's discovery layer.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub service_id: String,
    pub name: String,
    pub addresses: Vec<SocketAddr>,
    pub txt: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PeerKind {
    Phone,
    Laptop,
    Tv,
    Server,
    Unknown,
}

impl PeerKind {
    /// Parse an explicit kind; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "phone" => PeerKind::Phone,
            "laptop" => PeerKind::Laptop,
            "tv" => PeerKind::Tv,
            "server" => PeerKind::Server,
            _ => PeerKind::Unknown,
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerKind::Phone => "phone",
            PeerKind::Laptop => "laptop",
            PeerKind::Tv => "tv",
            PeerKind::Server => "server",
            PeerKind::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PeerState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub address: SocketAddr,
    pub kind: PeerKind,
    pub last_seen: Instant,
    pub state: PeerState,
    pub offline_since: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    PeerAdded(Peer),
    PeerUpdated(Peer),
    PeerRemoved { id: String },
}

/// Infer a device kind: explicit TXT `kind` first, then substring rules over name and model.
pub fn infer_kind(name: &str, txt: &BTreeMap<String, String>) -> PeerKind {
    if let Some(kind) = txt.get(TXT_KIND) {
        return PeerKind::parse(kind);
    }
    let mut haystack = name.to_lowercase();
    if let Some(model) = txt.get(TXT_MODEL) {
        haystack.push(' ');
        haystack.push_str(&model.to_lowercase());
    }
    KIND_RULES
        .iter()
        .find(|(_, tokens)| tokens.iter().any(|t| haystack.contains(t)))
        .map(|(kind, _)| *kind)
        .unwrap_or(PeerKind::Phone)
}

/// Peer set keyed by id. Ordered map so snapshots are stable by id.
#[derive(Debug)]
pub struct Registry {
    peers: BTreeMap<String, Peer>,
    /// service id → peer id, for lost events.
    services: HashMap<String, String>,
    absence: Duration,
    eviction: Duration,
}

impl Registry {
    pub fn new(absence: Duration, eviction: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            services: HashMap::new(),
            absence,
            eviction,
        }
    }

    pub fn ingest_resolved(
        &mut self,
        ad: &Advertisement,
        now: Instant,
    ) -> Result<RegistryEvent, DiscoveryError> {
        let id = ad
            .txt
            .get(TXT_ID)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| ad.service_id.clone());
        if id.is_empty() {
            return Err(DiscoveryError::MissingIdentity);
        }
        let address = *ad
            .addresses
            .first()
            .ok_or_else(|| DiscoveryError::MissingAddress(id.clone()))?;
        let display_name = if ad.name.is_empty() {
            id.clone()
        } else {
            ad.name.clone()
        };
        let kind = infer_kind(&display_name, &ad.txt);
        if !ad.service_id.is_empty() {
            self.services.insert(ad.service_id.clone(), id.clone());
        }

        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.display_name = display_name;
                peer.address = address;
                peer.kind = kind;
                peer.last_seen = peer.last_seen.max(now);
                peer.state = PeerState::Online;
                peer.offline_since = None;
                Ok(RegistryEvent::PeerUpdated(peer.clone()))
            }
            None => {
                let peer = Peer {
                    id: id.clone(),
                    display_name,
                    address,
                    kind,
                    last_seen: now,
                    state: PeerState::Online,
                    offline_since: None,
                };
                self.peers.insert(id, peer.clone());
                Ok(RegistryEvent::PeerAdded(peer))
            }
        }
    }

    /// Mark the peer behind `service_id` offline. Unknown services are ignored.
    pub fn ingest_lost(&mut self, service_id: &str, now: Instant) -> Option<RegistryEvent> {
        let id = self.services.get(service_id)?;
        let peer = self.peers.get_mut(id)?;
        if peer.state == PeerState::Online {
            peer.state = PeerState::Offline;
            peer.offline_since = Some(now);
        }
        Some(RegistryEvent::PeerUpdated(peer.clone()))
    }

    /// Age out silent peers and evict long-offline ones.
    pub fn sweep(&mut self, now: Instant) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        let mut evicted = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            match peer.state {
                PeerState::Online => {
                    if now.saturating_duration_since(peer.last_seen) >= self.absence {
                        peer.state = PeerState::Offline;
                        peer.offline_since = Some(now);
                        events.push(RegistryEvent::PeerUpdated(peer.clone()));
                    }
                }
                PeerState::Offline => {
                    let since = peer.offline_since.unwrap_or(peer.last_seen);
                    if now.saturating_duration_since(since) >= self.eviction {
                        evicted.push(id.clone());
                    }
                }
            }
        }
        for id in evicted {
            self.peers.remove(&id);
            self.services.retain(|_, peer_id| *peer_id != id);
            events.push(RegistryEvent::PeerRemoved { id });
        }
        events
    }

    /// Peers ordered by id.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Shared registry handle. Only this type mutates the peer set; readers get copies.
#[derive(Clone)]
pub struct Discovery {
    registry: Arc<RwLock<Registry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Discovery {
    pub fn new(config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: Arc::new(RwLock::new(Registry::new(
                config.absence_threshold(),
                config.eviction_threshold(),
            ))),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn ingest_resolved(&self, ad: &Advertisement) -> Result<(), DiscoveryError> {
        self.ingest_resolved_at(ad, Instant::now()).await
    }

    pub async fn ingest_resolved_at(
        &self,
        ad: &Advertisement,
        now: Instant,
    ) -> Result<(), DiscoveryError> {
        let event = self.registry.write().await.ingest_resolved(ad, now);
        match event {
            Ok(event) => {
                match &event {
                    RegistryEvent::PeerAdded(p) => {
                        info!(peer = %p.id, name = %p.display_name, addr = %p.address, kind = %p.kind, "peer added")
                    }
                    RegistryEvent::PeerUpdated(p) => debug!(peer = %p.id, "peer updated"),
                    RegistryEvent::PeerRemoved { .. } => {}
                }
                let _ = self.events.send(event);
                Ok(())
            }
            Err(e) => {
                warn!(service = %ad.service_id, error = %e, "dropping malformed advertisement");
                Err(e)
            }
        }
    }

    pub async fn ingest_lost(&self, service_id: &str) {
        self.ingest_lost_at(service_id, Instant::now()).await
    }

    pub async fn ingest_lost_at(&self, service_id: &str, now: Instant) {
        let event = self.registry.write().await.ingest_lost(service_id, now);
        if let Some(event) = event {
            debug!(service = %service_id, "peer lost");
            let _ = self.events.send(event);
        }
    }

    pub async fn sweep(&self, now: Instant) {
        let events = self.registry.write().await.sweep(now);
        for event in events {
            if let RegistryEvent::PeerRemoved { id } = &event {
                info!(peer = %id, "peer evicted");
            }
            let _ = self.events.send(event);
        }
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.registry.read().await.snapshot()
    }

    pub async fn get(&self, id: &str) -> Option<Peer> {
        self.registry.read().await.get(id)
    }

    /// Run `sweep` every `interval` until the task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let discovery = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                discovery.sweep(Instant::now()).await;
            }
        })
    }
}
