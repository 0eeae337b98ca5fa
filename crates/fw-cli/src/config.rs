//! Configuration loading and management.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use fw_core::{CostAssignment, Policy, StaticDirectory};
use fw_ingest::IngestConfig;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub policy: Policy,

    /// Plate to cost code lookup, keyed by plate.
    #[serde(default)]
    pub cost_codes: BTreeMap<String, CostCodeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCodeEntry {
    pub cost_code: String,
    pub company: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("websocket_url", &self.ingest.websocket_url)
            .field("cost_codes", &self.cost_codes.len())
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("fw.db"),
            ingest: IngestConfig::default(),
            policy: Policy::default(),
            cost_codes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, the user config file, `config_path`,
    /// then `FW_` environment variables (`FW_INGEST__WEBSOCKET_URL` sets
    /// `ingest.websocket_url`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("FW_").split("__"));

        figment.extract()
    }

    /// The cost code lookup handed to ingest workers.
    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.cost_codes.iter().map(|(plate, entry)| {
            (
                plate.clone(),
                CostAssignment {
                    cost_code: entry.cost_code.clone(),
                    company: entry.company.clone(),
                    unmapped: false,
                },
            )
        }))
    }
}

/// Returns the platform-specific config directory for fw.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fw"))
}

/// Returns the platform-specific data directory for fw.
///
/// On Linux: `~/.local/share/fw`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("fw"))
}
