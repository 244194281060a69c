// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of a [`Tss`](crate::Tss) context

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::TssError;

pub const ENV_DATA_DIR: &str = "TPM_DATA_DIR";
pub const ENV_NOFILE: &str = "TPM_NOFILE";
pub const ENV_ENCRYPT_SESSIONS: &str = "TPM_ENCRYPT_SESSIONS";
pub const ENV_SESSION_ENCKEY: &str = "TPM_SESSION_ENCKEY";
pub const ENV_DEVICE: &str = "TPM_DEVICE";

/// Where session records and the Name cache live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    /// Process-local, nothing survives the process
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TssConfig {
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    /// Encrypt persisted session records at rest
    pub encrypt_sessions: bool,
    /// AES-128 key for session records, hex. Random per context when unset.
    pub session_encryption_key: Option<String>,
    pub device: Option<String>,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            storage: StorageKind::File,
            encrypt_sessions: true,
            session_encryption_key: None,
            device: None,
        }
    }
}

impl TssConfig {
    /// In-memory configuration, used by tests and short-lived tools
    pub fn in_memory() -> Self {
        Self {
            storage: StorageKind::Memory,
            ..Default::default()
        }
    }

    /// Defaults overlaid with the `TPM_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = var(ENV_NOFILE) {
            self.storage = match parse_flag(&v).ok_or(TssError::BadConfig(ENV_NOFILE))? {
                true => StorageKind::Memory,
                false => StorageKind::File,
            };
        }
        if let Some(v) = var(ENV_ENCRYPT_SESSIONS) {
            self.encrypt_sessions =
                parse_flag(&v).ok_or(TssError::BadConfig(ENV_ENCRYPT_SESSIONS))?;
        }
        if let Some(key) = var(ENV_SESSION_ENCKEY) {
            self.session_encryption_key = Some(key);
        }
        if let Some(device) = var(ENV_DEVICE) {
            self.device = Some(device);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        self.session_key()?;
        Ok(())
    }

    /// The configured at-rest key, if any
    pub fn session_key(&self) -> Result<Option<[u8; 16]>> {
        let Some(key) = &self.session_encryption_key else {
            return Ok(None);
        };
        let bytes = hex::decode(key).map_err(|_| TssError::BadConfig(ENV_SESSION_ENCKEY))?;
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|_| TssError::BadConfig(ENV_SESSION_ENCKEY))?;
        Ok(Some(key))
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
