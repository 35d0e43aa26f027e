//! Configuration shared by the agent and the controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clipboard::ClipboardConfig;
use crate::codec::DEFAULT_MAX_FRAME;
use crate::reconnect::{BackoffPolicy, ReconnectConfig};
use crate::transfer::TransferConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub reconnect: ReconnectSection,
    pub transfer: TransferSection,
    pub clipboard: ClipboardSection,
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the agent binds and the controller dials.
    pub address: String,
    /// Largest frame accepted from the peer, in bytes.
    pub max_frame_bytes: usize,
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Reconnection backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Directory received files are written to.
    pub download_dir: PathBuf,
    /// Directory the peer may fetch files from. Unset refuses every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_dir: Option<PathBuf>,
    pub chunk_size: usize,
    /// Abandon inbound transfers idle this long (0 = never).
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Reject completions whose size differs from the announced one.
    pub verify_size: bool,
}

/// Clipboard sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardSection {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub max_text_bytes: usize,
    pub max_image_bytes: usize,
    pub watch_images: bool,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7340".into(),
            max_frame_bytes: DEFAULT_MAX_FRAME,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        let defaults = TransferConfig::default();
        Self {
            download_dir: defaults.download_dir,
            share_dir: defaults.share_dir,
            chunk_size: defaults.chunk_size,
            idle_timeout_secs: 120,
            sweep_interval_secs: 10,
            verify_size: true,
        }
    }
}

impl Default for ClipboardSection {
    fn default() -> Self {
        let defaults = ClipboardConfig::default();
        Self {
            enabled: defaults.enabled,
            poll_interval_ms: 500,
            max_text_bytes: defaults.max_text_bytes,
            max_image_bytes: defaults.max_image_bytes,
            watch_images: defaults.watch_images,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The defaults as pretty TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms.max(1))
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        let r = &self.reconnect;
        ReconnectConfig {
            max_retries: r.max_retries,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(r.base_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms),
                multiplier: r.multiplier,
            },
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        let t = &self.transfer;
        TransferConfig {
            download_dir: t.download_dir.clone(),
            share_dir: t.share_dir.clone(),
            chunk_size: t.chunk_size.max(1),
            idle_timeout: (t.idle_timeout_secs > 0).then(|| Duration::from_secs(t.idle_timeout_secs)),
            sweep_interval: Duration::from_secs(t.sweep_interval_secs.max(1)),
            verify_size: t.verify_size,
        }
    }

    pub fn clipboard_config(&self) -> ClipboardConfig {
        let c = &self.clipboard;
        ClipboardConfig {
            enabled: c.enabled,
            poll_interval: Duration::from_millis(c.poll_interval_ms.max(10)),
            max_text_bytes: c.max_text_bytes,
            max_image_bytes: c.max_image_bytes,
            watch_images: c.watch_images,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = RelayConfig::default_toml().unwrap();
        assert!(text.contains("address"));
        assert!(text.contains("max_retries"));
        assert!(text.contains("download_dir"));
    }

    #[test]
    fn roundtrip_config() {
        let text = RelayConfig::default_toml().unwrap();
        let parsed: RelayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, RelayConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: RelayConfig = toml::from_str(
            "[reconnect]\nmax_retries = 3\n\n[transfer]\nidle_timeout_secs = 0\n",
        )
        .unwrap();
        assert_eq!(parsed.reconnect.max_retries, 3);
        assert_eq!(parsed.reconnect.base_delay_ms, 1000);
        assert_eq!(parsed.transfer_config().idle_timeout, None);
        assert_eq!(parsed.network.address, "127.0.0.1:7340");
    }

    #[test]
    fn share_dir_is_optional() {
        assert_eq!(RelayConfig::default().transfer_config().share_dir, None);
        let parsed: RelayConfig =
            toml::from_str("[transfer]\nshare_dir = \"/srv/outbox\"\n").unwrap();
        assert_eq!(
            parsed.transfer_config().share_dir,
            Some(PathBuf::from("/srv/outbox"))
        );
    }

    #[test]
    fn component_configs_match_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.reconnect_config(), ReconnectConfig::default());
        assert_eq!(cfg.transfer_config(), TransferConfig::default());
        assert_eq!(cfg.clipboard_config(), ClipboardConfig::default());
    }

    #[test]
    fn load_falls_back_on_missing_or_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            RelayConfig::load(&dir.path().join("absent.toml")),
            RelayConfig::default()
        );

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "network = 12").unwrap();
        assert_eq!(RelayConfig::load(&bad), RelayConfig::default());
    }

    #[test]
    fn write_default_produces_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        RelayConfig::write_default(&path).unwrap();
        assert_eq!(RelayConfig::load(&path), RelayConfig::default());
    }
}
