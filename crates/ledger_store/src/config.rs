use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use permit_ledger_core::{LedgerError, LedgerResult};

const DEFAULT_CONFIG_NAME: &str = "ledger.json";
const DEFAULT_SQLITE_NAME: &str = "ledger.sqlite";

pub const DATABASE_URL_ENV: &str = "LEDGER_DATABASE_URL";
pub const OPS_TOKEN_ENV: &str = "LEDGER_OPS_TOKEN";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub statement_timeout_ms: Option<u64>,
    /// Slots that only read traffic may take.
    pub read_reserved: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub statement_timeout: Duration,
    pub read_reserved: u32,
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        let max_connections = self.max_connections.unwrap_or(10).max(1);
        let min_connections = self.min_connections.unwrap_or(1).min(max_connections);
        // At least one slot always stays usable by the writer.
        let read_reserved = self
            .read_reserved
            .unwrap_or(2)
            .min(max_connections.saturating_sub(1));
        PoolSettings {
            max_connections,
            min_connections,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.unwrap_or(5_000)),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms.unwrap_or(5_000)),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms.unwrap_or(300_000)),
            statement_timeout: Duration::from_millis(self.statement_timeout_ms.unwrap_or(30_000)),
            read_reserved,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: Option<u32>,
    pub window_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl BreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold.unwrap_or(5).max(1),
            window: Duration::from_millis(self.window_ms.unwrap_or(60_000)),
            cooldown: Duration::from_millis(self.cooldown_ms.unwrap_or(30_000)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_ingest_batch: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_ingest_batch: Some(500),
            retry_attempts: Some(3),
            retry_backoff_ms: Some(200),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Minimum address-token overlap coefficient for a name match.
    pub address_overlap_threshold: Option<f64>,
}

impl ResolutionConfig {
    pub const DEFAULT_ADDRESS_OVERLAP: f64 = 0.5;

    pub fn address_overlap_threshold(&self) -> f64 {
        self.address_overlap_threshold
            .filter(|value| value.is_finite() && *value > 0.0 && *value <= 1.0)
            .unwrap_or(Self::DEFAULT_ADDRESS_OVERLAP)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpsConfig {
    pub bind: Option<String>,
    /// Bearer token for the operational endpoints. `LEDGER_OPS_TOKEN` overrides it.
    pub token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub breaker: Option<BreakerConfig>,
    pub limits: Option<LimitsConfig>,
    pub resolution: Option<ResolutionConfig>,
    pub ops: Option<OpsConfig>,
    /// Directory holding `<source_table>.jsonl` feed files for the file-backed source.
    pub feeds_dir: Option<String>,
    pub failpoints: Option<Vec<String>>,
}

impl LedgerConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            breaker: None,
            limits: Some(LimitsConfig::with_defaults()),
            resolution: None,
            ops: None,
            feeds_dir: None,
            failpoints: None,
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> LedgerResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| LedgerError::config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| LedgerError::config(format!("read config: {err}")))?;
            let config: LedgerConfig =
                serde_json::from_str(&raw).map_err(|err| LedgerError::config(err.to_string()))?;
            return Ok(config);
        }
        let default = LedgerConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| LedgerError::config(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| LedgerError::config(format!("write config: {err}")))?;
        Ok(default)
    }

    /// Applies process environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(DATABASE_URL_ENV).ok(),
            std::env::var(OPS_TOKEN_ENV).ok(),
        )
    }

    pub fn with_overrides(mut self, database_url: Option<String>, ops_token: Option<String>) -> Self {
        if let Some(url) = database_url.map(|url| url.trim().to_string())
            && !url.is_empty()
        {
            self.database = if url.starts_with("sqlite:") {
                DatabaseConfig::Sqlite {
                    path: Some(
                        url.trim_start_matches("sqlite://")
                            .trim_start_matches("sqlite:")
                            .to_string(),
                    ),
                }
            } else {
                DatabaseConfig::Postgres { url }
            };
        }
        if let Some(token) = ops_token {
            let mut ops = self.ops.take().unwrap_or_default();
            ops.token = Some(token);
            self.ops = Some(ops);
        }
        self
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> LedgerResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SQLITE_NAME.to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(LedgerError::config("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> LedgerResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } => Ok(url.clone()),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        self.pool.clone().unwrap_or_default().settings()
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        self.breaker.clone().unwrap_or_default().settings()
    }

    pub fn limits(&self) -> LimitsConfig {
        let defaults = LimitsConfig::with_defaults();
        let limits = self.limits.clone().unwrap_or_else(LimitsConfig::with_defaults);
        LimitsConfig {
            max_ingest_batch: limits.max_ingest_batch.or(defaults.max_ingest_batch),
            retry_attempts: limits.retry_attempts.or(defaults.retry_attempts),
            retry_backoff_ms: limits.retry_backoff_ms.or(defaults.retry_backoff_ms),
        }
    }

    pub fn address_overlap_threshold(&self) -> f64 {
        self.resolution
            .as_ref()
            .map(ResolutionConfig::address_overlap_threshold)
            .unwrap_or(ResolutionConfig::DEFAULT_ADDRESS_OVERLAP)
    }

    /// Configured ops token with incidental whitespace removed; empty counts as unset.
    pub fn ops_token(&self) -> Option<String> {
        self.ops
            .as_ref()
            .and_then(|ops| ops.token.as_deref())
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    }

    pub fn feeds_dir(&self, base_dir: &Path) -> PathBuf {
        match &self.feeds_dir {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => base_dir.join(dir),
            None => base_dir.join("feeds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_init_writes_default_sqlite_config() {
        let dir = tempdir().expect("tempdir");
        let default_path = dir.path().join("ledger.sqlite");
        let config = LedgerConfig::load_or_init(dir.path(), &default_path).expect("config");
        assert_eq!(config.backend_name(), "sqlite");
        assert!(dir.path().join("ledger.json").exists());
        let again = LedgerConfig::load_or_init(dir.path(), &default_path).expect("reload");
        assert_eq!(
            again.sqlite_path(dir.path()).expect("path"),
            default_path
        );
    }

    #[test]
    fn pool_settings_keep_one_writer_slot() {
        let settings = PoolConfig {
            max_connections: Some(2),
            read_reserved: Some(5),
            ..PoolConfig::default()
        }
        .settings();
        assert_eq!(settings.max_connections, 2);
        assert_eq!(settings.read_reserved, 1);
        assert_eq!(settings.min_connections, 1);
    }

    #[test]
    fn env_style_overrides_switch_backend_and_token() {
        let config = LedgerConfig::default_sqlite("ledger.sqlite").with_overrides(
            Some(" postgres://ledger@localhost/ledger \n".to_string()),
            Some("  secret\n".to_string()),
        );
        assert_eq!(config.backend_name(), "postgres");
        assert_eq!(config.ops_token().as_deref(), Some("secret"));
    }

    #[test]
    fn blank_token_counts_as_unset() {
        let config =
            LedgerConfig::default_sqlite("ledger.sqlite").with_overrides(None, Some("   ".into()));
        assert_eq!(config.ops_token(), None);
    }

    #[test]
    fn out_of_range_overlap_threshold_uses_default() {
        let mut config = LedgerConfig::default_sqlite("ledger.sqlite");
        config.resolution = Some(ResolutionConfig {
            address_overlap_threshold: Some(4.0),
        });
        assert_eq!(
            config.address_overlap_threshold(),
            ResolutionConfig::DEFAULT_ADDRESS_OVERLAP
        );
        config.resolution = Some(ResolutionConfig {
            address_overlap_threshold: Some(0.75),
        });
        assert_eq!(config.address_overlap_threshold(), 0.75);
    }
}
