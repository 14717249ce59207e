//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use lanshare_core::EngineConfig;
use serde::Deserialize;

/// Host configuration. File: ~/.config/lanshare/config.toml or /etc/lanshare/config.toml.
/// Env overrides: LANSHARE_DISCOVERY_PORT, LANSHARE_TRANSPORT_PORT, LANSHARE_SAVE_PATH,
/// LANSHARE_CHUNK_SIZE_MB, LANSHARE_MAX_CONCURRENT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transfer TCP port (default 45679).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Name shown to other devices; defaults to the host name.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Advertised device kind (default "laptop").
    #[serde(default = "default_device_kind")]
    pub device_kind: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_discovery_port() -> u16 {
    45678
}
fn default_transport_port() -> u16 {
    45679
}
fn default_device_kind() -> String {
    "laptop".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            device_name: None,
            device_kind: default_device_kind(),
            engine: EngineConfig::default(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    finish(&mut c, home_dir().as_deref());
    c.engine.validate().context("invalid [engine] settings")?;
    Ok(c)
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("LANSHARE_DISCOVERY_PORT") {
        c.discovery_port = s.parse().context("LANSHARE_DISCOVERY_PORT")?;
    }
    if let Some(s) = var("LANSHARE_TRANSPORT_PORT") {
        c.transport_port = s.parse().context("LANSHARE_TRANSPORT_PORT")?;
    }
    if let Some(s) = var("LANSHARE_SAVE_PATH") {
        c.engine.save_path = PathBuf::from(s);
    }
    if let Some(s) = var("LANSHARE_CHUNK_SIZE_MB") {
        c.engine.chunk_size_mb = s.parse().context("LANSHARE_CHUNK_SIZE_MB")?;
    }
    if let Some(s) = var("LANSHARE_MAX_CONCURRENT") {
        c.engine.max_concurrent_sessions = s.parse().context("LANSHARE_MAX_CONCURRENT")?;
    }
    Ok(())
}

/// Fill in host-derived defaults.
fn finish(c: &mut Config, home: Option<&Path>) {
    if c.engine.save_path.as_os_str().is_empty() {
        c.engine.save_path = match home {
            Some(h) => h.join("Downloads/LanShare"),
            None => PathBuf::from("LanShare"),
        };
    }
    if c.device_name.as_deref().map_or(true, str::is_empty) {
        c.device_name = Some(host_name());
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn host_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "linux".to_string())
}

/// Directory for host state (device id).
pub fn state_dir() -> PathBuf {
    match home_dir() {
        Some(h) => h.join(".config/lanshare"),
        None => PathBuf::from(".lanshare"),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = home_dir() {
        out.push(h.join(".config/lanshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_with_engine_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
transport_port = 50000
device_name = "den-pc"

[engine]
chunk_size_mb = 4
workers_per_session = 2
"#,
        )
        .unwrap();
        let c = load_file(&path).unwrap();
        assert_eq!(c.transport_port, 50000);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.device_name.as_deref(), Some("den-pc"));
        assert_eq!(c.engine.chunk_size_mb, 4);
        assert_eq!(c.engine.workers_per_session, 2);
        assert_eq!(c.engine.max_concurrent_sessions, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("LANSHARE_TRANSPORT_PORT", "40000"),
            ("LANSHARE_SAVE_PATH", "/srv/incoming"),
            ("LANSHARE_CHUNK_SIZE_MB", "8"),
            ("LANSHARE_MAX_CONCURRENT", "5"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.transport_port, 40000);
        assert_eq!(c.engine.save_path, PathBuf::from("/srv/incoming"));
        assert_eq!(c.engine.chunk_size_mb, 8);
        assert_eq!(c.engine.max_concurrent_sessions, 5);

        let bad: HashMap<&str, &str> = [("LANSHARE_DISCOVERY_PORT", "nope")].into_iter().collect();
        assert!(apply_env(&mut c, |k| bad.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn save_path_defaults_under_home() {
        let mut c = Config::default();
        finish(&mut c, Some(Path::new("/home/ana")));
        assert_eq!(
            c.engine.save_path,
            PathBuf::from("/home/ana/Downloads/LanShare")
        );
        assert!(c.device_name.is_some());
    }
}
