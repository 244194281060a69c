// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session store
//!
//! Owns session state between command round trips. One record per live session
//! handle; a record is removed as soon as the TPM stops continuing the session.

use aes::Aes128;
use anyhow::{anyhow, Context, Result};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use fs_err as fs;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::{StorageKind, TssConfig};
use crate::error::TssError;
use crate::session::Session;

type RecordEncryptor = cbc::Encryptor<Aes128>;
type RecordDecryptor = cbc::Decryptor<Aes128>;

/// Persistence of [`Session`] records keyed by session handle
pub trait SessionStore: Send + Sync {
    /// Fails with [`TssError::SessionNotFound`] when no record exists
    fn load(&self, handle: u32) -> Result<Session>;
    fn save(&self, session: &Session) -> Result<()>;
    /// Removing an absent record is not an error
    fn delete(&self, handle: u32) -> Result<()>;
}

/// Build the store selected by `config`
pub fn store_from_config(config: &TssConfig) -> Result<Arc<dyn SessionStore>> {
    Ok(match config.storage {
        StorageKind::Memory => Arc::new(MemorySessionStore::default()),
        StorageKind::File => Arc::new(FileSessionStore::from_config(config)?),
    })
}

/// One file per session, `h{handle:08x}.bin` under the data directory
pub struct FileSessionStore {
    dir: PathBuf,
    key: Option<Zeroizing<[u8; 16]>>,
}

impl FileSessionStore {
    /// Records are AES-128-CBC encrypted when `key` is set
    pub fn new(dir: impl Into<PathBuf>, key: Option<[u8; 16]>) -> Self {
        Self {
            dir: dir.into(),
            key: key.map(Zeroizing::new),
        }
    }

    pub fn from_config(config: &TssConfig) -> Result<Self> {
        let key = if config.encrypt_sessions {
            match config.session_key()? {
                Some(key) => Some(key),
                None => {
                    let mut key = [0u8; 16];
                    rand::RngCore::try_fill_bytes(&mut rand::thread_rng(), &mut key)
                        .map_err(|_| TssError::RngFailure)?;
                    Some(key)
                }
            }
        } else {
            None
        };
        Ok(Self::new(&config.data_dir, key))
    }

    fn path(&self, handle: u32) -> PathBuf {
        self.dir.join(format!("h{handle:08x}.bin"))
    }

    fn seal(&self, record: Vec<u8>) -> Vec<u8> {
        match &self.key {
            Some(key) => RecordEncryptor::new(key.as_slice().into(), &[0u8; 16].into())
                .encrypt_padded_vec_mut::<Pkcs7>(&record),
            None => record,
        }
    }

    fn open(&self, handle: u32, blob: Vec<u8>) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => RecordDecryptor::new(key.as_slice().into(), &[0u8; 16].into())
                .decrypt_padded_vec_mut::<Pkcs7>(&blob)
                .map_err(|_| TssError::MalformedSession(handle).into()),
            None => Ok(blob),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, handle: u32) -> Result<Session> {
        let path = self.path(handle);
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TssError::SessionNotFound(handle).into())
            }
            Err(e) => return Err(e).context("failed to read session record"),
        };
        let record = Zeroizing::new(self.open(handle, blob)?);
        Session::from_record(handle, &record)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let record = Zeroizing::new(session.to_record());
        let blob = self.seal(record.to_vec());
        fs::write(self.path(session.handle), blob).context("failed to write session record")?;
        debug!("saved session 0x{:08x}", session.handle);
        Ok(())
    }

    fn delete(&self, handle: u32) -> Result<()> {
        match fs::remove_file(self.path(handle)) {
            Ok(()) => {
                debug!("deleted session 0x{handle:08x}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to delete session record"),
        }
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<u32, Session>>,
}

impl MemorySessionStore {
    pub fn contains(&self, handle: u32) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(&handle))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session store poisoned"))
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, handle: u32) -> Result<Session> {
        self.sessions()?
            .get(&handle)
            .cloned()
            .ok_or_else(|| TssError::SessionNotFound(handle).into())
    }

    fn save(&self, session: &Session) -> Result<()> {
        self.sessions()?.insert(session.handle, session.clone());
        Ok(())
    }

    fn delete(&self, handle: u32) -> Result<()> {
        self.sessions()?.remove(&handle);
        Ok(())
    }
}

/// Per-handle exclusion for session round trips
///
/// Clones share the same lock set. A round trip holds every session handle it
/// uses until the returned guard is dropped; disjoint handle sets never block
/// each other.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<(Mutex<HashSet<u32>>, Condvar)>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until all `handles` are free, then take them together
    pub fn acquire(&self, handles: &[u32]) -> Result<SessionLockGuard> {
        let (held, cond) = &*self.inner;
        let mut held = held.lock().map_err(|_| anyhow!("session locks poisoned"))?;
        while handles.iter().any(|h| held.contains(h)) {
            held = cond
                .wait(held)
                .map_err(|_| anyhow!("session locks poisoned"))?;
        }
        let mut taken: Vec<u32> = handles.to_vec();
        taken.sort_unstable();
        taken.dedup();
        held.extend(taken.iter().copied());
        Ok(SessionLockGuard {
            locks: self.clone(),
            handles: taken,
        })
    }

    pub fn is_locked(&self, handle: u32) -> bool {
        self.inner
            .0
            .lock()
            .map(|held| held.contains(&handle))
            .unwrap_or(false)
    }
}

/// Releases its handles on drop
pub struct SessionLockGuard {
    locks: SessionLocks,
    handles: Vec<u32>,
}

impl SessionLockGuard {
    pub fn handles(&self) -> &[u32] {
        &self.handles
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        let (held, cond) = &*self.locks.inner;
        if let Ok(mut held) = held.lock() {
            for h in &self.handles {
                held.remove(h);
            }
        }
        cond.notify_all();
    }
}
