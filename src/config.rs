use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;

const GIB: i64 = 1024 * 1024 * 1024;

/// Uploads are buffered in memory before the blob write, so keep this small.
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

impl std::str::FromStr for LedgerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            "memory" => Ok(LedgerBackend::Memory),
            other => bail!("Unsupported ledger backend: {}", other),
        }
    }
}

/// Quota assigned at account creation: a per-username table with a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub default_bytes: i64,
    pub overrides: HashMap<String, i64>,
}

impl QuotaPolicy {
    pub fn new(default_bytes: i64) -> Self {
        Self {
            default_bytes,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, username: impl Into<String>, bytes: i64) -> Self {
        self.overrides.insert(username.into(), bytes);
        self
    }

    pub fn quota_for(&self, username: &str) -> i64 {
        self.overrides
            .get(username)
            .copied()
            .unwrap_or(self.default_bytes)
    }

    /// Parses `name=bytes,name=bytes`. Usernames are case-sensitive.
    pub fn parse_overrides(raw: &str) -> Result<HashMap<String, i64>> {
        let mut overrides = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, bytes) = entry
                .split_once('=')
                .with_context(|| format!("Invalid quota override entry: {}", entry))?;
            let bytes: i64 = bytes
                .trim()
                .parse()
                .with_context(|| format!("Invalid quota size for {}", name))?;
            if bytes < 0 {
                bail!("Quota for {} must not be negative", name);
            }
            overrides.insert(name.trim().to_string(), bytes);
        }
        Ok(overrides)
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy::new(15 * GIB).with_override("tiago", 100 * GIB)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub ledger_backend: LedgerBackend,
    pub port: u16,
    pub max_file_size: usize,
    pub upload_dir: String,
    pub jwt_secret: String,
    pub quota_policy: QuotaPolicy,
    pub orphan_sweep_interval_secs: u64,
    pub orphan_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Builds the config from a variable lookup, applying defaults for
    /// anything unset.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default_quota_bytes: i64 = var("DEFAULT_QUOTA_BYTES")
            .unwrap_or_else(|| (15 * GIB).to_string()) // 15GB
            .parse()?;
        if default_quota_bytes < 0 {
            bail!("DEFAULT_QUOTA_BYTES must not be negative");
        }
        let overrides = QuotaPolicy::parse_overrides(
            &var("QUOTA_OVERRIDES").unwrap_or_else(|| format!("tiago={}", 100 * GIB)),
        )?;

        Ok(Config {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/cloud_drive".to_string()),
            ledger_backend: var("LEDGER_BACKEND")
                .unwrap_or_else(|| "postgres".to_string())
                .parse()?,
            port: var("PORT")
                .unwrap_or_else(|| "5000".to_string())
                .parse()?,
            max_file_size: match var("MAX_FILE_SIZE") {
                Some(raw) => raw.parse().context("Invalid MAX_FILE_SIZE")?,
                None => DEFAULT_MAX_FILE_SIZE,
            },
            upload_dir: var("UPLOAD_DIR")
                .unwrap_or_else(|| "./uploads".to_string()),
            jwt_secret: var("JWT_SECRET")
                .unwrap_or_else(|| "cloud-drive-secret-change-in-production".to_string()),
            quota_policy: QuotaPolicy {
                default_bytes: default_quota_bytes,
                overrides,
            },
            orphan_sweep_interval_secs: var("ORPHAN_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|| "3600".to_string())
                .parse()?,
            orphan_grace_secs: var("ORPHAN_GRACE_SECS")
                .unwrap_or_else(|| "3600".to_string())
                .parse()?,
        })
    }
}
