//! Engine facade: discovery registry and transfer manager behind one handle.

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::manager::TransferManager;

#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    discovery: Discovery,
    transfers: TransferManager,
}

impl Engine {
    /// `local_id` is the identity other peers know us by; it is sent in every `Hello`.
    pub fn new(config: EngineConfig, local_id: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let discovery = Discovery::new(&config);
        let transfers = TransferManager::new(config.clone(), discovery.clone(), local_id)?;
        Ok(Self {
            config,
            discovery,
            transfers,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// Age out peers every `sweep_interval`. Abort the handle to stop.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.discovery.spawn_sweeper(self.config.sweep_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig {
            workers_per_session: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(config, "me"),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn facade_shares_one_registry() {
        let engine = Engine::new(EngineConfig::default(), "me").unwrap();
        assert!(engine.discovery().snapshot().await.is_empty());
        assert_eq!(engine.transfers().available_slots(), 3);
        let sweeper = engine.spawn_sweeper();
        sweeper.abort();
    }
}
