//! LAN discovery: UDP multicast beacons, parsed into advertisements for the engine's registry.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bincode::Options;
use lanshare_core::discovery::{TXT_ID, TXT_KIND, TXT_MODEL};
use lanshare_core::{Advertisement, Discovery, PeerState, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const MAX_BEACON_LEN: u64 = 1024;

/// Presence announcement sent to the multicast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u8,
    pub device_id: String,
    pub name: String,
    pub model: String,
    pub kind: String,
    /// TCP port transfers are accepted on.
    pub listen_port: u16,
    /// Set on the last beacon before shutdown.
    pub goodbye: bool,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_BEACON_LEN)
}

impl Beacon {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn decode(bytes: &[u8]) -> Option<Beacon> {
        codec().deserialize(bytes).ok()
    }

    /// Advertisement for a beacon received from `from`.
    pub fn advertisement(&self, from: IpAddr) -> Advertisement {
        let mut txt = BTreeMap::new();
        txt.insert(TXT_ID.to_string(), self.device_id.clone());
        if !self.model.is_empty() {
            txt.insert(TXT_MODEL.to_string(), self.model.clone());
        }
        if !self.kind.is_empty() {
            txt.insert(TXT_KIND.to_string(), self.kind.clone());
        }
        Advertisement {
            service_id: self.device_id.clone(),
            name: self.name.clone(),
            addresses: vec![SocketAddr::new(from, self.listen_port)],
            txt,
        }
    }
}

/// Best-effort hardware model string.
pub fn local_model() -> String {
    std::fs::read_to_string("/sys/devices/virtual/dmi/id/product_name")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "linux".to_string())
}

/// Running beacon and listener tasks.
pub struct LanDiscovery {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    local: Beacon,
    tasks: Vec<JoinHandle<()>>,
}

impl LanDiscovery {
    /// Join the multicast group on `port`, start beaconing `local` and feed received
    /// beacons into `discovery`.
    pub fn start(discovery: Discovery, local: Beacon, port: u16) -> io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(port)?);
        let dest = SocketAddr::from((MULTICAST_GROUP, port));
        let frame = local.encode()?;
        info!(%dest, device = %local.device_id, "discovery started");

        let beacon_task = {
            let socket = socket.clone();
            let frame = frame.clone();
            tokio::spawn(async move { beacon_loop(socket, frame, dest).await })
        };
        let recv_task = {
            let socket = socket.clone();
            let own_id = local.device_id.clone();
            tokio::spawn(async move { recv_loop(socket, discovery, own_id, frame, dest).await })
        };
        Ok(Self {
            socket,
            dest,
            local,
            tasks: vec![beacon_task, recv_task],
        })
    }

    /// Stop the tasks and tell peers we are leaving.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        let goodbye = Beacon {
            goodbye: true,
            ..self.local
        };
        match goodbye.encode() {
            Ok(frame) => {
                if let Err(e) = self.socket.send_to(&frame, self.dest).await {
                    debug!(error = %e, "could not send goodbye beacon");
                }
            }
            Err(e) => debug!(error = %e, "could not encode goodbye beacon"),
        }
    }
}

fn make_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // daemon and CLI may share the discovery port on one host
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into())
}

async fn beacon_loop(socket: Arc<UdpSocket>, frame: Vec<u8>, dest: SocketAddr) {
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            warn!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    discovery: Discovery,
    own_id: String,
    frame: Vec<u8>,
    dest: SocketAddr,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        let Some(beacon) = Beacon::decode(&buf[..n]) else {
            debug!(%from, "ignoring undecodable datagram");
            continue;
        };
        if beacon.protocol_version != PROTOCOL_VERSION || beacon.device_id == own_id {
            continue;
        }
        if beacon.goodbye {
            discovery.ingest_lost(&beacon.device_id).await;
            continue;
        }
        let is_new = discovery
            .get(&beacon.device_id)
            .await
            .map_or(true, |p| p.state == PeerState::Offline);
        if discovery
            .ingest_resolved(&beacon.advertisement(from.ip()))
            .await
            .is_ok()
            && is_new
        {
            // answer at once so the newcomer need not wait a full interval
            if let Err(e) = socket.send_to(&frame, dest).await {
                debug!(error = %e, "beacon reply failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::PeerKind;

    fn beacon() -> Beacon {
        Beacon {
            protocol_version: PROTOCOL_VERSION,
            device_id: "7d1c9a4e".into(),
            name: "Den PC".into(),
            model: "ThinkCentre M720".into(),
            kind: "laptop".into(),
            listen_port: 45679,
            goodbye: false,
        }
    }

    #[test]
    fn beacon_decodes_and_rejects_garbage() {
        let b = beacon();
        assert_eq!(Beacon::decode(&b.encode().unwrap()), Some(b));
        assert_eq!(Beacon::decode(&[0xff; 7]), None);
        assert_eq!(Beacon::decode(&[]), None);
    }

    #[test]
    fn advertisement_uses_sender_ip_and_listen_port() {
        let ad = beacon().advertisement("192.168.1.30".parse().unwrap());
        assert_eq!(ad.service_id, "7d1c9a4e");
        assert_eq!(ad.addresses, vec!["192.168.1.30:45679".parse().unwrap()]);
        assert_eq!(ad.txt.get(TXT_ID).map(String::as_str), Some("7d1c9a4e"));
        assert_eq!(ad.txt.get(TXT_KIND).map(String::as_str), Some("laptop"));
    }

    #[tokio::test]
    async fn beacon_feeds_registry() {
        let discovery = Discovery::new(&lanshare_core::EngineConfig::default());
        let ad = beacon().advertisement("10.0.0.8".parse().unwrap());
        discovery.ingest_resolved(&ad).await.unwrap();
        let peer = discovery.get("7d1c9a4e").await.unwrap();
        assert_eq!(peer.display_name, "Den PC");
        assert_eq!(peer.kind, PeerKind::Laptop);
    }
}
