// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization session state
//!
//! A [`Session`] carries everything needed to authorize a command with an HMAC or
//! policy session and to check the TPM's answer: the long-lived session key, the
//! nonces of the last round trip, the optional bind entity and the transient flags
//! set by policy assertions.

use anyhow::Result;
use tracing::debug;
use zeroize::Zeroize;

use crate::constants::*;
use crate::crypto::CryptoProvider;
use crate::error::TssError;
use crate::marshal::*;
use crate::types::TpmtSymDef;

/// Per-handle authorization session state
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub handle: u32,
    pub hash_alg: TpmAlgId,
    /// Digest size of `hash_alg`, also the nonce size used by the caller
    pub digest_size: u32,
    /// Parameter encryption algorithm negotiated at session start
    pub symmetric: TpmtSymDef,
    /// Bound entity, cleared once a bound command is audited
    pub bind: Option<u32>,
    pub bind_name: Vec<u8>,
    pub bind_auth_value: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub session_key: Vec<u8>,
    pub session_type: TpmSe,
    /// Set by PolicyPassword, the next authorization carries the password
    pub password_needed: bool,
    /// Set by PolicyAuthValue, the next authorization folds the auth value
    pub auth_value_needed: bool,
    /// sessionKey || authValue, valid for the current command only
    pub hmac_key: Vec<u8>,
    /// KDF secret for parameter encryption, valid for the current command only
    pub session_value: Vec<u8>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .field("hash_alg", &self.hash_alg)
            .field("symmetric", &self.symmetric)
            .field("bind", &self.bind)
            .field("session_type", &self.session_type)
            .field("password_needed", &self.password_needed)
            .field("auth_value_needed", &self.auth_value_needed)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.bind_auth_value.zeroize();
        self.session_key.zeroize();
        self.hmac_key.zeroize();
        self.session_value.zeroize();
    }
}

impl Session {
    pub fn new(
        handle: u32,
        hash_alg: TpmAlgId,
        symmetric: TpmtSymDef,
        session_type: TpmSe,
    ) -> Result<Self> {
        let digest_size = hash_alg.digest_size();
        if digest_size == 0 {
            return Err(TssError::BadHashAlgorithm(hash_alg.to_u16()).into());
        }
        Ok(Self {
            handle,
            hash_alg,
            digest_size: digest_size as u32,
            symmetric,
            bind: None,
            bind_name: Vec::new(),
            bind_auth_value: Vec::new(),
            nonce_tpm: Vec::new(),
            nonce_caller: Vec::new(),
            session_key: Vec::new(),
            session_type,
            password_needed: false,
            auth_value_needed: false,
            hmac_key: Vec::new(),
            session_value: Vec::new(),
        })
    }

    /// Derive the session key once, at session establishment
    ///
    /// `bind` is the bound entity's handle and its current Name. Without a bind
    /// entity and without salt the key stays empty.
    pub fn derive_session_key(
        &mut self,
        crypto: &dyn CryptoProvider,
        bind: Option<(u32, Vec<u8>)>,
        bind_auth_value: &[u8],
        salt: &[u8],
    ) -> Result<()> {
        let bound = bind.is_some();
        if let Some((handle, name)) = bind {
            self.bind = Some(handle);
            self.bind_name = name;
        }
        self.bind_auth_value = bind_auth_value.to_vec();
        if !bound && salt.is_empty() {
            self.session_key.clear();
            return Ok(());
        }
        let key = zeroize::Zeroizing::new([bind_auth_value, salt].concat());
        let session_key = crypto.kdfa(
            self.hash_alg,
            &key,
            "ATH",
            &self.nonce_tpm,
            &self.nonce_caller,
            self.digest_size * 8,
        )?;
        if session_key.is_empty() {
            return Err(TssError::KdfaFailed.into());
        }
        self.session_key = session_key;
        Ok(())
    }

    /// Roll a fresh caller nonce for the next command
    pub fn roll_nonce_caller(&mut self, crypto: &dyn CryptoProvider) -> Result<()> {
        self.nonce_caller = crypto.random(self.digest_size as usize)?;
        Ok(())
    }

    /// Policy session without PolicyAuthValue: auth values are never folded in
    fn policy_without_auth_value(&self) -> bool {
        self.session_type == TpmSe::Policy && !self.auth_value_needed
    }

    /// Whether the command and response HMACs are computed and checked
    pub fn authenticates(&self) -> bool {
        match self.session_type {
            TpmSe::Hmac => true,
            TpmSe::Policy => self.auth_value_needed,
            TpmSe::Trial => false,
        }
    }

    /// Whether the authorized entity is the bound one, compared by Name
    pub fn bind_matches(&self, authorized_name: &[u8]) -> bool {
        self.bind.is_some()
            && self.session_type != TpmSe::Policy
            && authorized_name == self.bind_name.as_slice()
    }

    /// Compute the per-command HMAC key and session value
    ///
    /// `authorized_name` is the Name of the handle this slot authorizes, or `None`
    /// when the slot has no authorization role (an encrypt/decrypt-only session).
    /// On a bind match the HMAC key gets EmptyAuth while the session value gets the
    /// bind auth value. Outside a bind match both get `auth_value`.
    pub fn set_hmac_key(&mut self, authorized_name: Option<&[u8]>, auth_value: Option<&[u8]>) {
        self.hmac_key.zeroize();
        self.session_value.zeroize();
        self.hmac_key = self.session_key.clone();
        self.session_value = self.session_key.clone();

        let Some(name) = authorized_name else {
            debug!("session 0x{:08x}: slot has no auth role", self.handle);
            return;
        };
        if self.policy_without_auth_value() {
            return;
        }
        let bind_match = self.bind_matches(name);
        debug!("session 0x{:08x}: bind match {bind_match}", self.handle);
        if bind_match {
            self.session_value.extend_from_slice(&self.bind_auth_value);
        } else if let Some(auth) = auth_value {
            self.hmac_key.extend_from_slice(auth);
            self.session_value.extend_from_slice(auth);
        }
    }

    /// The policy flags are one-shot: reset them once a round trip consumed them
    pub fn clear_policy_flags(&mut self) {
        self.password_needed = false;
        self.auth_value_needed = false;
    }

    /// Internal record encoding, the per-command keys are not included
    pub fn to_record(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::with_capacity(256);
        buf.put_u32(self.handle);
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_u32(self.digest_size);
        self.symmetric.marshal(&mut buf);
        buf.put_u32(self.bind.unwrap_or(tpm_rh::NULL));
        buf.put_tpm2b(&self.bind_name);
        buf.put_tpm2b(&self.bind_auth_value);
        buf.put_tpm2b(&self.nonce_tpm);
        buf.put_tpm2b(&self.nonce_caller);
        buf.put_tpm2b(&self.session_key);
        buf.put_u8(self.session_type as u8);
        buf.put_u8(self.password_needed as u8);
        buf.put_u8(self.auth_value_needed as u8);
        buf.into_vec()
    }

    /// Decode a record stored under `handle`
    pub fn from_record(handle: u32, record: &[u8]) -> Result<Self> {
        Self::parse_record(record)
            .ok()
            .filter(|s| s.handle == handle)
            .ok_or_else(|| TssError::MalformedSession(handle).into())
    }

    fn parse_record(record: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(record);
        let handle = buf.get_u32()?;
        let hash_alg = TpmAlgId::from_u16(buf.get_u16()?)
            .filter(|a| a.is_hash())
            .ok_or(TssError::MalformedSession(handle))?;
        let digest_size = buf.get_u32()?;
        let symmetric = TpmtSymDef::unmarshal(&mut buf)?;
        let bind = match buf.get_u32()? {
            tpm_rh::NULL => None,
            h => Some(h),
        };
        let bind_name = buf.get_tpm2b()?;
        let bind_auth_value = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        let nonce_tpm = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        let nonce_caller = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        let session_key = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        let session_type =
            TpmSe::from_u8(buf.get_u8()?).ok_or(TssError::MalformedSession(handle))?;
        let password_needed = buf.get_u8()? != 0;
        let auth_value_needed = buf.get_u8()? != 0;
        if !buf.is_empty() || digest_size as usize != hash_alg.digest_size() {
            return Err(TssError::MalformedSession(handle).into());
        }
        Ok(Self {
            handle,
            hash_alg,
            digest_size,
            symmetric,
            bind,
            bind_name,
            bind_auth_value,
            nonce_tpm,
            nonce_caller,
            session_key,
            session_type,
            password_needed,
            auth_value_needed,
            hmac_key: Vec::new(),
            session_value: Vec::new(),
        })
    }
}
