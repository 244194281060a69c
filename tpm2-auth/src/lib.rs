// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 session authorization
//!
//! This crate authorizes TPM 2.0 commands with password, HMAC and policy
//! sessions, communicating directly with the TPM device without C library
//! dependencies.
//!
//! ## Features
//!
//! - **HMAC sessions**: bound and/or salted, with cpHash/rpHash authorization
//! - **Policy sessions**: PolicyPassword and PolicyAuthValue, PolicySigned through
//!   a caller-supplied signer
//! - **Parameter encryption**: XOR and AES-CFB for the first command and response
//!   parameter
//! - **Persistent sessions**: session state and entity Names survive across
//!   processes under a data directory, optionally encrypted at rest
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_auth::{SessionOptions, SessionSlot, Tss, TssConfig};
//!
//! let mut tss = Tss::new(&TssConfig::from_env()?)?; // Auto-detect TPM device
//! let session = tss.start_auth_session(&SessionOptions::hmac())?;
//! let slot = SessionSlot::session(session);
//! let random_bytes = tss.get_random(32, &[slot])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod auth;
mod command;
mod commands;
mod config;
mod constants;
mod context;
mod crypto;
mod device;
mod encrypt;
mod error;
mod hooks;
mod marshal;
mod names;
mod session;
mod store;
mod types;

pub use commands::SessionOptions;
pub use config::{StorageKind, TssConfig};
pub use constants::*;
pub use context::{Command, Response, SessionSlot, Tss};
pub use crypto::{CryptoProvider, SoftwareCrypto};
pub use device::{TpmDevice, Transport};
pub use error::{classify, rc, result_code, TssError};
pub use hooks::{check_salt_key, Extra, Hook, PolicySigner};
pub use names::{nv_name, object_name, resolve_name, EntityKey, FileNameCache, MemoryNameCache, NameCache};
pub use session::Session;
pub use store::{FileSessionStore, MemorySessionStore, SessionLocks, SessionStore};
pub use types::*;

// Re-export the wire layer for advanced usage
pub use command::{frame_command, CommandSpec, TpmCommand, TpmResponse};
pub use encrypt::{Direction, ParameterSessions};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
