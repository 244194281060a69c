// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Name and public-area cache
//!
//! The cpHash covers entity Names, not handles. Names of PCRs, sessions and
//! permanent handles are the handle itself; the TPM reports the Names of loaded
//! objects and NV indices, and those are cached here by the handle lifecycle
//! hooks.

use anyhow::{anyhow, Context, Result};
use fs_err as fs;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{StorageKind, TssConfig};
use crate::constants::TpmHt;
use crate::crypto::CryptoProvider;
use crate::error::TssError;
use crate::marshal::{Marshal, Unmarshal};
use crate::types::{TpmsNvPublic, TpmtPublic};

/// What a cache entry is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Handle(u32),
    /// Hex SHA-256 of a saved context blob
    SavedContext(String),
}

impl EntityKey {
    fn stem(&self) -> String {
        match self {
            EntityKey::Handle(h) => format!("{h:08x}"),
            EntityKey::SavedContext(s) => s.clone(),
        }
    }
}

impl From<u32> for EntityKey {
    fn from(handle: u32) -> Self {
        EntityKey::Handle(handle)
    }
}

/// Kind of cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEntry {
    Name,
    /// Marshaled TPMT_PUBLIC
    Public,
    /// Marshaled TPMS_NV_PUBLIC
    NvPublic,
}

impl CacheEntry {
    fn prefix(self) -> &'static str {
        match self {
            CacheEntry::Name => "h",
            CacheEntry::Public => "hp",
            CacheEntry::NvPublic => "nvp",
        }
    }
}

pub trait NameCache: Send + Sync {
    fn get(&self, entry: CacheEntry, key: &EntityKey) -> Result<Option<Vec<u8>>>;
    fn put(&self, entry: CacheEntry, key: &EntityKey, value: &[u8]) -> Result<()>;
    /// Removing an absent entry is not an error
    fn remove(&self, entry: CacheEntry, key: &EntityKey) -> Result<()>;

    fn name(&self, handle: u32) -> Result<Option<Vec<u8>>> {
        self.get(CacheEntry::Name, &handle.into())
    }

    fn store_name(&self, handle: u32, name: &[u8]) -> Result<()> {
        self.put(CacheEntry::Name, &handle.into(), name)
    }

    fn store_public(&self, handle: u32, public: &[u8]) -> Result<()> {
        self.put(CacheEntry::Public, &handle.into(), public)
    }

    fn public(&self, handle: u32) -> Result<Option<Vec<u8>>> {
        self.get(CacheEntry::Public, &handle.into())
    }

    fn nv_public(&self, index: u32) -> Result<Option<TpmsNvPublic>> {
        self.get(CacheEntry::NvPublic, &index.into())?
            .map(|b| TpmsNvPublic::from_bytes(&b).context("cached NV public"))
            .transpose()
    }

    fn store_nv_public(&self, index: u32, nv_public: &TpmsNvPublic) -> Result<()> {
        self.put(CacheEntry::NvPublic, &index.into(), &nv_public.to_bytes())
    }

    fn delete_nv_public(&self, index: u32) -> Result<()> {
        self.remove(CacheEntry::NvPublic, &index.into())
    }

    /// Forget the Name and public area of an entity
    fn delete(&self, key: &EntityKey) -> Result<()> {
        self.remove(CacheEntry::Name, key)?;
        self.remove(CacheEntry::Public, key)
    }

    /// Copy the Name, and the public area when there is one
    fn copy_entity(&self, from: &EntityKey, to: &EntityKey) -> Result<()> {
        let name = self
            .get(CacheEntry::Name, from)?
            .ok_or_else(|| not_found(from))?;
        self.put(CacheEntry::Name, to, &name)?;
        if let Some(public) = self.get(CacheEntry::Public, from)? {
            self.put(CacheEntry::Public, to, &public)?;
        }
        Ok(())
    }
}

fn not_found(key: &EntityKey) -> anyhow::Error {
    match key {
        EntityKey::Handle(h) => TssError::NameNotFound(*h).into(),
        EntityKey::SavedContext(s) => anyhow!("no Name cached for saved context {s}"),
    }
}

pub fn cache_from_config(config: &TssConfig) -> Arc<dyn NameCache> {
    match config.storage {
        StorageKind::Memory => Arc::new(MemoryNameCache::default()),
        StorageKind::File => Arc::new(FileNameCache::new(&config.data_dir)),
    }
}

/// Files `h*.bin`, `hp*.bin` and `nvp*.bin` under the data directory
pub struct FileNameCache {
    dir: PathBuf,
}

impl FileNameCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, entry: CacheEntry, key: &EntityKey) -> PathBuf {
        self.dir
            .join(format!("{}{}.bin", entry.prefix(), key.stem()))
    }
}

impl NameCache for FileNameCache {
    fn get(&self, entry: CacheEntry, key: &EntityKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(entry, key)) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, entry: CacheEntry, key: &EntityKey, value: &[u8]) -> Result<()> {
        fs::write(self.path(entry, key), value)?;
        Ok(())
    }

    fn remove(&self, entry: CacheEntry, key: &EntityKey) -> Result<()> {
        match fs::remove_file(self.path(entry, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryNameCache {
    entries: Mutex<HashMap<(CacheEntry, EntityKey), Vec<u8>>>,
}

impl MemoryNameCache {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(CacheEntry, EntityKey), Vec<u8>>>> {
        self.entries.lock().map_err(|_| anyhow!("name cache poisoned"))
    }
}

impl NameCache for MemoryNameCache {
    fn get(&self, entry: CacheEntry, key: &EntityKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(&(entry, key.clone())).cloned())
    }

    fn put(&self, entry: CacheEntry, key: &EntityKey, value: &[u8]) -> Result<()> {
        self.entries()?.insert((entry, key.clone()), value.to_vec());
        Ok(())
    }

    fn remove(&self, entry: CacheEntry, key: &EntityKey) -> Result<()> {
        self.entries()?.remove(&(entry, key.clone()));
        Ok(())
    }
}

/// Name of the entity behind `handle`
pub fn resolve_name(cache: &dyn NameCache, handle: u32) -> Result<Vec<u8>> {
    match TpmHt::of(handle) {
        Some(TpmHt::Pcr | TpmHt::HmacSession | TpmHt::PolicySession | TpmHt::Permanent) => {
            Ok(handle.to_be_bytes().to_vec())
        }
        Some(TpmHt::NvIndex | TpmHt::Transient | TpmHt::Persistent) => cache
            .name(handle)?
            .ok_or_else(|| TssError::NameNotFound(handle).into()),
        None => Err(TssError::NameNotImplemented(handle).into()),
    }
}

/// NV index Name: nameAlg || H_nameAlg(TPMS_NV_PUBLIC)
pub fn nv_name(crypto: &dyn CryptoProvider, nv_public: &TpmsNvPublic) -> Result<Vec<u8>> {
    let alg = nv_public.name_alg;
    let digest = crypto.hash(alg, &[&nv_public.to_bytes()])?;
    let mut name = alg.to_u16().to_be_bytes().to_vec();
    name.extend_from_slice(&digest);
    Ok(name)
}

/// Object Name: nameAlg || H_nameAlg(TPMT_PUBLIC)
pub fn object_name(crypto: &dyn CryptoProvider, public_area: &[u8]) -> Result<Vec<u8>> {
    let public = TpmtPublic::from_public_area(public_area).context("public area")?;
    let alg = public.name_alg;
    let digest = crypto.hash(alg, &[public_area])?;
    let mut name = alg.to_u16().to_be_bytes().to_vec();
    name.extend_from_slice(&digest);
    Ok(name)
}
