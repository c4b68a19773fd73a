//! # Engine Configuration
//!
//! A complete [`EngineConfig`] is the merge of built-in defaults with a
//! persisted/user-supplied [`PartialEngineConfig`] overlay. The overlay is
//! what lives in `EngineState.config` and what `ConfigUpdate` actions carry;
//! the effective config is re-derived whenever the overlay changes.
//!
//! Timeouts are stored as milliseconds so the config can be serialized as
//! one flat JSON object.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport capabilities advertised to (and parsed from) peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    /// Whether incoming transfers are accepted.
    pub receive: bool,
    /// Whether the peer data-channel upgrade is supported.
    pub web_rtc: bool,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            receive: true,
            web_rtc: false,
        }
    }
}

/// Effective engine configuration (defaults merged with the user overlay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory endpoint returning the list of candidate transport servers.
    pub server_lookup: String,
    /// Pinned transport server; when set, only this server is attempted.
    pub transport_server: Option<String>,
    /// Default settle timeout (in blocks) for newly opened channels.
    pub settle_timeout: u64,
    /// Timeout (in blocks) for secrets to be revealed.
    pub reveal_timeout: u64,
    /// Budget for HTTP-ish network calls, in milliseconds. Several protocol
    /// timeouts are fractions of this value.
    pub http_timeout_ms: u64,
    /// Chain polling interval, in milliseconds.
    pub polling_interval_ms: u64,
    /// Capped retry count for transient network errors.
    pub retry_count: u32,
    /// Blocks after which an observed on-chain event is treated as final.
    pub confirmation_blocks: u64,
    /// Grace period epics get to finish in-flight work on shutdown, in
    /// milliseconds.
    pub shutdown_grace_ms: u64,
    /// Debounce window for state persistence, in milliseconds.
    pub persist_debounce_ms: u64,
    /// Path-finding service URL; `None` disables path finding.
    pub pfs: Option<String>,
    /// User capability overrides; `None` falls back to dynamic + defaults.
    pub caps: Option<Caps>,
    /// Log level filter; `None` keeps the process default.
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_lookup: String::new(),
            transport_server: None,
            settle_timeout: 500,
            reveal_timeout: 50,
            http_timeout_ms: 30_000,
            polling_interval_ms: 5_000,
            retry_count: 3,
            confirmation_blocks: 5,
            shutdown_grace_ms: 10_000,
            persist_debounce_ms: 1_000,
            pfs: None,
            caps: None,
            log_level: None,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    #[must_use]
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Apply a user overlay on top of this config.
    #[must_use]
    pub fn merged(&self, overlay: &PartialEngineConfig) -> Self {
        let mut out = self.clone();
        if let Some(v) = &overlay.server_lookup {
            out.server_lookup = v.clone();
        }
        if let Some(v) = &overlay.transport_server {
            out.transport_server = Some(v.clone());
        }
        if let Some(v) = overlay.settle_timeout {
            out.settle_timeout = v;
        }
        if let Some(v) = overlay.reveal_timeout {
            out.reveal_timeout = v;
        }
        if let Some(v) = overlay.http_timeout_ms {
            out.http_timeout_ms = v;
        }
        if let Some(v) = overlay.polling_interval_ms {
            out.polling_interval_ms = v;
        }
        if let Some(v) = overlay.retry_count {
            out.retry_count = v;
        }
        if let Some(v) = overlay.confirmation_blocks {
            out.confirmation_blocks = v;
        }
        if let Some(v) = overlay.shutdown_grace_ms {
            out.shutdown_grace_ms = v;
        }
        if let Some(v) = overlay.persist_debounce_ms {
            out.persist_debounce_ms = v;
        }
        if let Some(v) = &overlay.pfs {
            out.pfs = v.clone();
        }
        if let Some(v) = overlay.caps {
            out.caps = Some(v);
        }
        if let Some(v) = &overlay.log_level {
            out.log_level = Some(v.clone());
        }
        out
    }
}

/// Sparse configuration overlay: only the set fields override the defaults.
///
/// `pfs` is doubly optional so an overlay can explicitly disable path
/// finding (`Some(None)`) as opposed to not overriding it (`None`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialEngineConfig {
    pub server_lookup: Option<String>,
    pub transport_server: Option<String>,
    pub settle_timeout: Option<u64>,
    pub reveal_timeout: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub polling_interval_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub confirmation_blocks: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub persist_debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pfs: Option<Option<String>>,
    pub caps: Option<Caps>,
    pub log_level: Option<String>,
}

impl PartialEngineConfig {
    /// Merge another overlay into this one; fields set in `other` win.
    pub fn update(&mut self, other: &PartialEngineConfig) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(server_lookup);
        take!(transport_server);
        take!(settle_timeout);
        take!(reveal_timeout);
        take!(http_timeout_ms);
        take!(polling_interval_ms);
        take!(retry_count);
        take!(confirmation_blocks);
        take!(shutdown_grace_ms);
        take!(persist_debounce_ms);
        take!(pfs);
        take!(caps);
        take!(log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_merge_is_identity() {
        let config = EngineConfig::default();
        assert_eq!(config.merged(&PartialEngineConfig::default()), config);
    }

    #[test]
    fn test_overlay_wins() {
        let overlay = PartialEngineConfig {
            settle_timeout: Some(20),
            polling_interval_ms: Some(500),
            ..Default::default()
        };
        let merged = EngineConfig::default().merged(&overlay);
        assert_eq!(merged.settle_timeout, 20);
        assert_eq!(merged.polling_interval(), Duration::from_millis(500));
        // untouched fields keep defaults
        assert_eq!(merged.retry_count, 3);
    }

    #[test]
    fn test_partial_update() {
        let mut overlay = PartialEngineConfig {
            settle_timeout: Some(20),
            ..Default::default()
        };
        overlay.update(&PartialEngineConfig {
            reveal_timeout: Some(10),
            ..Default::default()
        });
        assert_eq!(overlay.settle_timeout, Some(20));
        assert_eq!(overlay.reveal_timeout, Some(10));
    }

    #[test]
    fn test_pfs_explicit_disable() {
        let overlay = PartialEngineConfig {
            pfs: Some(None),
            ..Default::default()
        };
        let merged = EngineConfig {
            pfs: Some("https://pfs.example".to_string()),
            ..Default::default()
        }
        .merged(&overlay);
        assert_eq!(merged.pfs, None);
    }
}
