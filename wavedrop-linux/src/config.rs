//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use wavedrop_core::{ReceiverConfig, TransferParams};

/// Daemon configuration. File: ~/.config/wavedrop/config.toml or /etc/wavedrop/config.toml.
/// Env overrides: WAVEDROP_RELAY_PORT, WAVEDROP_BROADCAST_PORT, WAVEDROP_TRANSFER_PORT,
/// WAVEDROP_SAMPLE_RATE.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay HTTP listen port (default 8787).
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Signaling broadcast UDP port (default 45680).
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// File transfer TCP port (default 45681).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Give up listening for a key after this long.
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Relay records older than this are purged.
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

fn default_relay_port() -> u16 {
    8787
}
fn default_broadcast_port() -> u16 {
    45680
}
fn default_transfer_port() -> u16 {
    45681
}
fn default_sample_rate() -> u32 {
    48_000
}
fn default_fft_size() -> usize {
    1024
}
fn default_listen_timeout_ms() -> u32 {
    10_000
}
fn default_chunk_size() -> usize {
    16 * 1024
}
fn default_record_ttl_secs() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_port: default_relay_port(),
            broadcast_port: default_broadcast_port(),
            transfer_port: default_transfer_port(),
            sample_rate: default_sample_rate(),
            fft_size: default_fft_size(),
            listen_timeout_ms: default_listen_timeout_ms(),
            chunk_size: default_chunk_size(),
            record_ttl_secs: default_record_ttl_secs(),
        }
    }
}

impl Config {
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            sample_rate: self.sample_rate,
            fft_size: self.fft_size,
            hop: (self.fft_size / 4).max(1),
            max_listen_ms: self.listen_timeout_ms,
            ..ReceiverConfig::default()
        }
    }

    pub fn transfer_params(&self) -> TransferParams {
        TransferParams::with_slice_size(self.chunk_size)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

/// Apply overrides from `lookup` (the process environment in `load`). Unparsable values are ignored.
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(p) = lookup("WAVEDROP_RELAY_PORT").and_then(|s| s.parse().ok()) {
        c.relay_port = p;
    }
    if let Some(p) = lookup("WAVEDROP_BROADCAST_PORT").and_then(|s| s.parse().ok()) {
        c.broadcast_port = p;
    }
    if let Some(p) = lookup("WAVEDROP_TRANSFER_PORT").and_then(|s| s.parse().ok()) {
        c.transfer_port = p;
    }
    if let Some(r) = lookup("WAVEDROP_SAMPLE_RATE").and_then(|s| s.parse().ok()) {
        c.sample_rate = r;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wavedrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/wavedrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("relay_port = 9000\nchunk_size = 4096\n").unwrap();
        assert_eq!(c.relay_port, 9000);
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.broadcast_port, 45680);
        assert_eq!(c.sample_rate, 48_000);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("WAVEDROP_RELAY_PORT", "8080"),
            ("WAVEDROP_SAMPLE_RATE", "44100"),
            ("WAVEDROP_TRANSFER_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.relay_port, 8080);
        assert_eq!(c.sample_rate, 44_100);
        assert_eq!(c.transfer_port, 45681);
    }

    #[test]
    fn derived_core_settings() {
        let c = Config {
            fft_size: 2048,
            listen_timeout_ms: 3000,
            chunk_size: 1000,
            ..Config::default()
        };
        let r = c.receiver_config();
        assert_eq!(r.hop, 512);
        assert_eq!(r.max_listen_ms, 3000);
        let t = c.transfer_params();
        assert_eq!(t.slice_size, 1000);
        assert_eq!(t.high_water, 10_000);
        assert_eq!(c.record_ttl(), Duration::from_secs(600));
    }
}
