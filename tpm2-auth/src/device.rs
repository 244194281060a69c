// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transport
//!
//! The session layer hands a complete command buffer to a [`Transport`] and gets a
//! complete response buffer back. [`TpmDevice`] talks to `/dev/tpmrm0` or
//! `/dev/tpm0`; tests plug in an in-process TPM.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// One request/response exchange with a TPM
pub trait Transport: Send {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).transmit(command)
    }
}

/// TPM character device
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device, `device:` prefixes are accepted
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {}", device_path))?;

        debug!("opened TPM device {device_path}");
        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Open the resource manager if present, the raw device otherwise
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            bail!("TPM device not found")
        }
    }

    /// Open `path` when given, otherwise detect
    pub fn open_or_detect(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path),
            None => Self::detect(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;
        if n == 0 {
            bail!("TPM device {} returned an empty response", self.path);
        }

        response.truncate(n);
        Ok(response)
    }
}
