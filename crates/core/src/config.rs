use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xmpp_parsers::jid::BareJid;

use crate::error::ConfigError;

/// Settings for one client session.
///
/// Only `jid` is required; every section falls back to its defaults when it is
/// missing from the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Bare JID of the account (e.g., "bot@example.com")
    pub jid: String,

    /// Nickname used for rooms listed in `rooms`
    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// Rooms to join on startup in addition to autojoin bookmarks
    #[serde(default)]
    pub rooms: Vec<String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Bound on generic IQ queries (bookmarks, disco, custom queries)
    pub query_seconds: u64,
    /// Bound on the upload slot negotiation round trip
    pub upload_slot_seconds: u64,
    /// Bound on MUC join and leave handshakes
    pub room_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_seconds: 30,
            upload_slot_seconds: 30,
            room_seconds: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_seconds)
    }

    pub fn upload_slot(&self) -> Duration {
        Duration::from_secs(self.upload_slot_seconds)
    }

    pub fn room(&self) -> Duration {
        Duration::from_secs(self.room_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Size of each read from the upload source, in bytes
    pub chunk_size: usize,
    /// Capacity of the progress channel handed out by convenience helpers
    pub progress_buffer: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            progress_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

fn default_display_name() -> String {
    "oasis".to_string()
}

impl SessionConfig {
    /// Build a config for `jid` with default settings.
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            display_name: default_display_name(),
            rooms: Vec::new(),
            timeouts: TimeoutConfig::default(),
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.account()?;

        if self.display_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "display_name",
                reason: "must not be empty".to_string(),
            });
        }

        for room in &self.rooms {
            room.parse::<BareJid>().map_err(|e| ConfigError::Invalid {
                field: "rooms",
                reason: format!("{room}: {e}"),
            })?;
        }

        if self.upload.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "upload.chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// The account JID, normalized.
    pub fn account(&self) -> Result<BareJid, ConfigError> {
        BareJid::new(&self.jid).map_err(|e| ConfigError::Invalid {
            field: "jid",
            reason: e.to_string(),
        })
    }

    /// Domain part of the account JID, used as the service discovery root.
    pub fn server(&self) -> Result<BareJid, ConfigError> {
        let account = self.account()?;
        Ok(BareJid::from_parts(None, account.domain()))
    }
}
