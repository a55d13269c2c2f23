use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::SESSION_NAME_GAME;

/// Errors raised while loading the `[sessions]` configuration section.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid session config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Host/join menu defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuSettings {
    pub num_public_connections: u32,
    pub match_type: String,
    /// Map the host travels to after creating a session (without `?listen`).
    pub lobby_path: String,
}

impl Default for MenuSettings {
    fn default() -> Self {
        Self {
            num_public_connections: 4,
            match_type: "FreeForAll".into(),
            lobby_path: "/Game/Maps/Lobby".into(),
        }
    }
}

/// Session coordinator configuration (`[sessions]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_name: String,
    pub build_unique_id: u32,
    pub search_max_results: u32,
    /// Pending requests older than this are abandoned by `expire_stale_requests`.
    /// `None` leaves requests pending until the backend completes them.
    pub request_timeout_secs: Option<u64>,
    pub menu: MenuSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_name: SESSION_NAME_GAME.into(),
            build_unique_id: 1,
            search_max_results: 10_000,
            request_timeout_secs: None,
            menu: MenuSettings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sessions: SessionConfig,
}

impl SessionConfig {
    pub const SECTION: &'static str = "sessions";

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Parses a TOML document; a missing `[sessions]` section yields the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(file.sessions)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
