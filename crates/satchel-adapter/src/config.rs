use crate::errors::{PolicyStoreError, PolicyStoreResult};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_OBJECT_KEY: &str = "policies.csv";
pub const DEFAULT_CAS_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_CAS_BACKOFF: Duration = Duration::from_millis(50);
/// Upper bound for the per-attempt CAS backoff step.
pub const MAX_CAS_BACKOFF: Duration = Duration::from_secs(60);

/// How a read-modify-write cycle publishes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Unconditional overwrite. Concurrent writers lose updates silently.
    #[default]
    LastWriteWins,
    /// Write only if the object still carries the version that was read;
    /// on conflict re-run the cycle after `backoff * attempt`.
    CompareAndSwap { max_attempts: u32, backoff: Duration },
}

impl Consistency {
    pub fn compare_and_swap() -> Self {
        Consistency::CompareAndSwap {
            max_attempts: DEFAULT_CAS_MAX_ATTEMPTS,
            backoff: DEFAULT_CAS_BACKOFF,
        }
    }
}

// Store settings sourced from code, environment variables, or a YAML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub bucket: String,
    pub key: String,
    /// Create the bucket during init when the head-check finds it missing.
    pub force_create_bucket: bool,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ConsistencyMode {
    LastWriteWins,
    CompareAndSwap,
}

impl FromStr for ConsistencyMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" => Ok(ConsistencyMode::LastWriteWins),
            "compare-and-swap" | "cas" => Ok(ConsistencyMode::CompareAndSwap),
            other => Err(anyhow!("unknown consistency mode: {other}")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoreSettingsOverride {
    bucket: Option<String>,
    key: Option<String>,
    force_create_bucket: Option<bool>,
    consistency: Option<ConsistencyMode>,
    cas_max_attempts: Option<u32>,
    cas_backoff_ms: Option<u64>,
}

impl StoreSettingsOverride {
    fn from_env() -> Result<Self> {
        Ok(Self {
            bucket: std::env::var("SATCHEL_BUCKET").ok(),
            key: std::env::var("SATCHEL_OBJECT_KEY").ok(),
            force_create_bucket: env_parse("SATCHEL_FORCE_CREATE_BUCKET", parse_flag)?,
            consistency: env_parse("SATCHEL_CONSISTENCY", |v| v.parse::<ConsistencyMode>())?,
            cas_max_attempts: env_parse("SATCHEL_CAS_MAX_ATTEMPTS", |v| Ok(v.parse()?))?,
            cas_backoff_ms: env_parse("SATCHEL_CAS_BACKOFF_MS", |v| Ok(v.parse()?))?,
        })
    }

    // Fields set in `other` win.
    fn merge(self, other: Self) -> Self {
        Self {
            bucket: other.bucket.or(self.bucket),
            key: other.key.or(self.key),
            force_create_bucket: other.force_create_bucket.or(self.force_create_bucket),
            consistency: other.consistency.or(self.consistency),
            cas_max_attempts: other.cas_max_attempts.or(self.cas_max_attempts),
            cas_backoff_ms: other.cas_backoff_ms.or(self.cas_backoff_ms),
        }
    }

    fn into_settings(self) -> Result<StoreSettings> {
        let bucket = self
            .bucket
            .ok_or_else(|| anyhow!("bucket is not configured (set SATCHEL_BUCKET)"))?;
        let consistency = match self.consistency.unwrap_or(ConsistencyMode::LastWriteWins) {
            ConsistencyMode::LastWriteWins => Consistency::LastWriteWins,
            ConsistencyMode::CompareAndSwap => Consistency::CompareAndSwap {
                max_attempts: self.cas_max_attempts.unwrap_or(DEFAULT_CAS_MAX_ATTEMPTS),
                backoff: self
                    .cas_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_CAS_BACKOFF),
            },
        };
        let settings = StoreSettings {
            bucket,
            key: self.key.unwrap_or_else(|| DEFAULT_OBJECT_KEY.to_string()),
            force_create_bucket: self.force_create_bucket.unwrap_or(false),
            consistency,
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn env_parse<T>(name: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => parse(&value).map(Some).with_context(|| format!("parse {name}")),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("not a boolean: {other}")),
    }
}

impl StoreSettings {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: DEFAULT_OBJECT_KEY.to_string(),
            force_create_bucket: false,
            consistency: Consistency::default(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_force_create_bucket(mut self, force: bool) -> Self {
        self.force_create_bucket = force;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn validate(&self) -> PolicyStoreResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(PolicyStoreError::InvalidConfig("bucket is empty".into()));
        }
        if self.key.trim().is_empty() {
            return Err(PolicyStoreError::InvalidConfig("object key is empty".into()));
        }
        if let Consistency::CompareAndSwap { max_attempts: 0, .. } = self.consistency {
            return Err(PolicyStoreError::InvalidConfig(
                "compare-and-swap needs at least one attempt".into(),
            ));
        }
        if let Consistency::CompareAndSwap { backoff, .. } = self.consistency
            && backoff > MAX_CAS_BACKOFF
        {
            return Err(PolicyStoreError::InvalidConfig(format!(
                "compare-and-swap backoff {backoff:?} exceeds {MAX_CAS_BACKOFF:?}"
            )));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        StoreSettingsOverride::from_env()?.into_settings()
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut merged = StoreSettingsOverride::from_env()?;
        if let Ok(path) = std::env::var("SATCHEL_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read SATCHEL_CONFIG: {path}"))?;
            let file_cfg: StoreSettingsOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse satchel config yaml")?;
            merged = merged.merge(file_cfg);
        }
        merged.into_settings()
    }
}
