use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LobbyError, Result};

/// Lobby tuning loaded from lobby.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobbyConfig {
    /// How long a recipient has to answer an incoming invite.
    pub invite_expiry_secs: u64,
    /// Delay between publishing `playing` and leaving for the game.
    pub status_grace_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub resync_interval_secs: u64,
    /// Game entry screen the handoff navigates to.
    pub entry_path: String,
    pub sent_notice_ms: u64,
    pub info_notice_ms: u64,
    pub default_language: String,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            invite_expiry_secs: 30,
            status_grace_ms: 350,
            reconnect_base_ms: 1200,
            reconnect_cap_ms: 6000,
            max_reconnect_attempts: 5,
            resync_interval_secs: 30,
            entry_path: "/select-ships".to_string(),
            sent_notice_ms: 2000,
            info_notice_ms: 3000,
            default_language: "en".to_string(),
        }
    }
}

impl LobbyConfig {
    pub fn invite_expiry(&self) -> Duration {
        Duration::from_secs(self.invite_expiry_secs)
    }

    pub fn status_grace(&self) -> Duration {
        Duration::from_millis(self.status_grace_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    fn validate(self) -> Result<Self> {
        if self.invite_expiry_secs == 0 {
            return Err(LobbyError::Config("inviteExpirySecs must be positive".to_string()));
        }
        if self.resync_interval_secs == 0 {
            return Err(LobbyError::Config("resyncIntervalSecs must be positive".to_string()));
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(LobbyError::Config(
                "reconnectCapMs cannot be lower than reconnectBaseMs".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() -> Result<()> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base)?;
    }

    let lobby_path = config_path("lobby.json");
    if !lobby_path.exists() {
        let default_config = serde_json::to_string_pretty(&LobbyConfig::default())?;
        fs::write(&lobby_path, default_config)?;
        tracing::info!("Wrote default config to {}", lobby_path.display());
    }

    Ok(())
}

/// Load the lobby configuration.
pub fn load() -> Result<LobbyConfig> {
    let data = fs::read_to_string(config_path("lobby.json"))?;
    parse(&data)
}

/// Parse a config document; missing fields fall back to defaults.
pub fn parse(data: &str) -> Result<LobbyConfig> {
    let config: LobbyConfig = serde_json::from_str(data)?;
    config.validate()
}
