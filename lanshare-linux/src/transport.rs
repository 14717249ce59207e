//! TCP transport: accept incoming transfers, connect out for sends.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use lanshare_core::{Direction, Engine, FileDescriptor, SessionHandle, SessionOptions};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections forever, handing each to the engine as an incoming transfer.
pub async fn serve(listener: TcpListener, engine: Engine, save_dir: PathBuf) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, save_dir = %save_dir.display(), "accepting transfers");
    }
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let engine = engine.clone();
        let save_dir = save_dir.clone();
        tokio::spawn(async move {
            match engine.transfers().accept_incoming(stream, &save_dir).await {
                Ok(handle) => info!(%from, session = %handle.id(), "incoming transfer accepted"),
                Err(e) => warn!(%from, error = %e, "incoming transfer refused"),
            }
        });
    }
}

/// Create a send session to `peer_id`, connect to the peer's cached address and start it.
pub async fn send_file(
    engine: &Engine,
    peer_id: &str,
    file: PathBuf,
    options: SessionOptions,
) -> anyhow::Result<SessionHandle> {
    let transfers = engine.transfers();
    let handle = transfers
        .create_session(
            Direction::Send,
            peer_id,
            FileDescriptor::Source(file),
            options,
        )
        .await?;
    let addr = handle
        .info()
        .await
        .peer_addr
        .context("peer has no address")?;
    let connected = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
    let stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = handle.cancel().await;
            return Err(e).with_context(|| format!("connecting to {addr}"));
        }
        Err(_) => {
            let _ = handle.cancel().await;
            anyhow::bail!("timed out connecting to {addr}");
        }
    };
    let _ = stream.set_nodelay(true);
    transfers.start_send(handle.id(), stream).await?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::{Advertisement, EngineConfig, SessionStatus};
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    async fn know(engine: &Engine, id: &str, addr: SocketAddr) {
        engine
            .discovery()
            .ingest_resolved(&Advertisement {
                service_id: id.into(),
                name: id.into(),
                addresses: vec![addr],
                txt: BTreeMap::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn file_crosses_loopback_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let save_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let receiver = Engine::new(EngineConfig::default(), "phone-b").unwrap();
        let sender = Engine::new(EngineConfig::default(), "laptop-a").unwrap();
        know(&receiver, "laptop-a", "127.0.0.1:1".parse().unwrap()).await;
        know(&sender, "phone-b", listen_addr).await;
        tokio::spawn(serve(listener, receiver.clone(), save_dir.path().to_path_buf()));

        let data: Vec<u8> = (0..2_500_000u32).map(|i| (i % 251) as u8).collect();
        let path = src_dir.path().join("notes.txt");
        std::fs::write(&path, &data).unwrap();

        let handle = send_file(&sender, "phone-b", path, SessionOptions::default())
            .await
            .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::Completed);

        // the receiving side finishes right after the sender's Complete
        let dest = save_dir.path().join("notes.txt");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !dest.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn unreachable_peer_releases_the_slot() {
        let engine = Engine::new(EngineConfig::default(), "laptop-a").unwrap();
        // bound then dropped: nothing listens there
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        know(&engine, "phone-b", addr).await;
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"hello").unwrap();

        let result = send_file(
            &engine,
            "phone-b",
            src.path().to_path_buf(),
            SessionOptions::default(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(engine.transfers().available_slots(), 3);
    }
}
