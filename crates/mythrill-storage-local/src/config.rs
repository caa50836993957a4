use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mythrill_storage_core::{Category, TierTable};
use serde::{Deserialize, Serialize};

/// How a remote update is reconciled with pending local edits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Adopt the remote payload and drop pending local edits.
    #[default]
    RemoteWins,
    /// Ignore the remote notification; the next auto-save overwrites it.
    LocalWins,
    /// Hold the conflict until the caller resolves it.
    AskUser,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictPolicy::RemoteWins => write!(f, "remote-wins"),
            ConflictPolicy::LocalWins => write!(f, "local-wins"),
            ConflictPolicy::AskUser => write!(f, "ask-user"),
        }
    }
}

/// Per-category debounce delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub rooms_ms: u64,
    pub characters_ms: u64,
    pub journals_ms: u64,
    pub campaigns_ms: u64,
    pub collections_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            rooms_ms: 2_000,
            characters_ms: 2_000,
            journals_ms: 3_000,
            campaigns_ms: 3_000,
            collections_ms: 2_000,
        }
    }
}

impl DebounceConfig {
    pub fn delay(&self, category: Category) -> Duration {
        let ms = match category {
            Category::Rooms => self.rooms_ms,
            Category::Characters => self.characters_ms,
            Category::Journals => self.journals_ms,
            Category::Campaigns => self.campaigns_ms,
            Category::Collections => self.collections_ms,
        };
        Duration::from_millis(ms)
    }

    /// Same delay for every category.
    pub fn uniform(ms: u64) -> Self {
        Self {
            rooms_ms: ms,
            characters_ms: ms,
            journals_ms: ms,
            campaigns_ms: ms,
            collections_ms: ms,
        }
    }
}

/// Engine configuration shared by the scheduler and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce: DebounceConfig,
    /// Remote updates within this distance of our last save are our own echo.
    pub echo_epsilon_ms: i64,
    pub probe_timeout_ms: u64,
    pub save_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    pub tiers: TierTable,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            echo_epsilon_ms: 1_000,
            probe_timeout_ms: 8_000,
            save_timeout_ms: 8_000,
            conflict_policy: ConflictPolicy::default(),
            tiers: TierTable::default(),
        }
    }
}

impl SyncConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Configuration for the mythrill-storage operator CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "mythrill-storage")]
#[command(about = "Inspect and manage Mythrill per-user storage on the local filesystem")]
pub struct Config {
    /// Base directory for the filesystem document store
    #[arg(long, env = "MYTHRILL_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Optional JSON engine configuration (tiers, debounce, timeouts)
    #[arg(long, env = "MYTHRILL_SYNC_CONFIG")]
    pub sync_config: Option<PathBuf>,

    /// Conflict policy override
    #[arg(long, env = "MYTHRILL_CONFLICT_POLICY")]
    pub conflict_policy: Option<ConflictPolicy>,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective storage directory.
    pub fn effective_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mythrill")
                .join("storage")
        })
    }

    /// Build the engine configuration from the optional file plus overrides.
    pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.sync_config {
            Some(path) => SyncConfig::from_json_file(path)?,
            None => SyncConfig::default(),
        };
        if let Some(policy) = self.conflict_policy {
            config.conflict_policy = policy;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show a user's tier and limits
    Tier {
        #[arg(long)]
        user: String,
    },
    /// Assign a tier to a user
    SetTier {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tier: String,
    },
    /// Show a user's storage ledger
    Usage {
        #[arg(long)]
        user: String,
    },
    /// Store a file as a document, enforcing quota
    Put {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Category,
        #[arg(long)]
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print or write a document's payload
    Get {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Category,
        #[arg(long)]
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete a document and release its quota
    Rm {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Category,
        #[arg(long)]
        id: String,
    },
    /// Export every document of a user as JSON
    Export {
        #[arg(long)]
        user: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete all data of a user and reset the ledger
    Purge {
        #[arg(long)]
        user: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce.delay(Category::Rooms), Duration::from_secs(2));
        assert_eq!(config.debounce.delay(Category::Journals), Duration::from_secs(3));
        assert_eq!(config.probe_timeout(), Duration::from_secs(8));
        assert_eq!(config.conflict_policy, ConflictPolicy::RemoteWins);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"conflict_policy":"ask-user","debounce":{"rooms_ms":500}}"#)
                .unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::AskUser);
        assert_eq!(config.debounce.rooms_ms, 500);
        assert_eq!(config.debounce.journals_ms, 3_000);
        assert_eq!(config.echo_epsilon_ms, 1_000);
    }

    #[test]
    fn test_cli_parses_put() {
        let config = Config::try_parse_from([
            "mythrill-storage",
            "--storage-dir",
            "/tmp/x",
            "put",
            "--user",
            "u1",
            "--category",
            "rooms",
            "--id",
            "room-1",
            "--file",
            "state.json",
        ])
        .unwrap();
        assert!(matches!(
            config.command,
            Command::Put { category: Category::Rooms, .. }
        ));
    }
}
