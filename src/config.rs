use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{LedgerError, Result},
    ledger::Price,
};

pub const DEFAULT_STATE_PATH: &str = "gridbalance.state.json";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// What to do when a mutation arrives for a ledger that is already being mutated.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait for the in-flight mutation, then apply.
    #[default]
    Queue,
    /// Fail fast with a retryable `Conflict`.
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub contention: ContentionPolicy,
    pub max_storage_fee: Price,
    pub max_transactions_per_ledger: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            contention: ContentionPolicy::Queue,
            max_storage_fee: Price::MAX,
            max_transactions_per_ledger: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliConfig {
    pub state_path: PathBuf,
    pub log_level: String,
    pub service: ServiceConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            service: ServiceConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| LedgerError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
