// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Typed wrappers over [`Tss::execute`]
//!
//! Each wrapper marshals its parameters, runs the command with the caller's
//! session slots and unmarshals the (already decrypted) response parameters.

use anyhow::{Context, Result};
use tracing::debug;

use crate::constants::*;
use crate::context::{Command, SessionSlot, Tss};
use crate::error::TssError;
use crate::marshal::*;
use crate::types::*;

/// Maximum bytes moved by one NV_Read or NV_Write
const MAX_NV_CHUNK: usize = 1024;

/// Parameters of a new authorization session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_type: TpmSe,
    /// RSA key the salt is encrypted to, `TPM_RH_NULL` for an unsalted session
    pub tpm_key: u32,
    /// Entity whose auth value keys the session, `TPM_RH_NULL` for none
    pub bind: u32,
    pub bind_password: Option<String>,
    pub symmetric: TpmtSymDef,
    pub auth_hash: TpmAlgId,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_type: TpmSe::Hmac,
            tpm_key: tpm_rh::NULL,
            bind: tpm_rh::NULL,
            bind_password: None,
            symmetric: TpmtSymDef::aes_128_cfb(),
            auth_hash: TpmAlgId::Sha256,
        }
    }
}

impl SessionOptions {
    pub fn hmac() -> Self {
        Self::default()
    }

    pub fn policy() -> Self {
        Self {
            session_type: TpmSe::Policy,
            ..Default::default()
        }
    }

    pub fn salted(mut self, tpm_key: u32) -> Self {
        self.tpm_key = tpm_key;
        self
    }

    pub fn bound(mut self, bind: u32, password: Option<&str>) -> Self {
        self.bind = bind;
        self.bind_password = password.map(str::to_string);
        self
    }

    pub fn symmetric(mut self, symmetric: TpmtSymDef) -> Self {
        self.symmetric = symmetric;
        self
    }

    pub fn auth_hash(mut self, alg: TpmAlgId) -> Self {
        self.auth_hash = alg;
        self
    }
}

/// Offset of a chunk `done` bytes past `offset`
fn nv_offset(offset: u16, done: usize) -> Result<u16> {
    u16::try_from(done)
        .ok()
        .and_then(|done| offset.checked_add(done))
        .ok_or_else(|| {
            TssError::BadParameter(format!("NV offset {offset} + {done} exceeds 65535")).into()
        })
}

impl Tss {
    // ==================== Sessions ====================

    /// Start an HMAC, policy or trial session and return its handle
    pub fn start_auth_session(&mut self, options: &SessionOptions) -> Result<u32> {
        let input = StartAuthSessionIn {
            // nonce and salt are filled in when the command is prepared
            nonce_caller: Vec::new(),
            encrypted_salt: Vec::new(),
            session_type: options.session_type,
            symmetric: options.symmetric,
            auth_hash: options.auth_hash,
        };
        let mut cmd = Command::new(
            TpmCc::StartAuthSession,
            vec![options.tpm_key, options.bind],
            input.to_bytes(),
        );
        if let Some(password) = &options.bind_password {
            cmd = cmd.with_bind_password(password.clone());
        }
        let response = self.execute(cmd, &[]).context("StartAuthSession failed")?;
        response
            .handle
            .ok_or_else(|| TssError::MalformedResponse("no session handle".into()).into())
    }

    /// Flush a transient object or session
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let cmd = Command::new(TpmCc::FlushContext, vec![], handle.to_be_bytes().to_vec());
        self.execute(cmd, &[])
            .with_context(|| format!("FlushContext 0x{handle:08x} failed"))?;
        Ok(())
    }

    /// The next use of `session` carries the entity's password in the clear
    pub fn policy_password(&mut self, session: u32) -> Result<()> {
        let cmd = Command::new(TpmCc::PolicyPassword, vec![session], vec![]);
        self.execute(cmd, &[]).context("PolicyPassword failed")?;
        Ok(())
    }

    /// The next use of `session` folds the entity's auth value into the HMAC
    pub fn policy_auth_value(&mut self, session: u32) -> Result<()> {
        let cmd = Command::new(TpmCc::PolicyAuthValue, vec![session], vec![]);
        self.execute(cmd, &[]).context("PolicyAuthValue failed")?;
        Ok(())
    }

    pub fn policy_get_digest(&mut self, session: u32) -> Result<Vec<u8>> {
        let cmd = Command::new(TpmCc::PolicyGetDigest, vec![session], vec![]);
        let response = self.execute(cmd, &[]).context("PolicyGetDigest failed")?;
        ResponseBuffer::new(&response.parameters).get_tpm2b()
    }

    // ==================== Objects ====================

    /// Read an object's public area, caching it with its Name
    pub fn read_public(&mut self, handle: u32) -> Result<(TpmtPublic, Vec<u8>)> {
        let cmd = Command::new(TpmCc::ReadPublic, vec![handle], vec![]);
        let response = self.execute(cmd, &[]).context("ReadPublic failed")?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let public = TpmtPublic::from_public_area(&buf.get_tpm2b()?)?;
        let name = buf.get_tpm2b()?;
        Ok((public, name))
    }

    // ==================== NV Operations ====================

    /// Read an NV public area, caching it with the index Name
    pub fn nv_read_public(&mut self, index: u32, slots: &[SessionSlot]) -> Result<TpmsNvPublic> {
        let cmd = Command::new(TpmCc::NvReadPublic, vec![index], vec![]);
        let response = self.execute(cmd, slots).context("NV_ReadPublic failed")?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let nv_public = Tpm2bNvPublic::unmarshal(&mut buf)?;
        Ok(nv_public.nv_public)
    }

    /// Define an NV index
    pub fn nv_define_space(
        &mut self,
        auth_handle: u32,
        auth: &[u8],
        nv_public: &TpmsNvPublic,
        slots: &[SessionSlot],
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(auth);
        Tpm2bNvPublic {
            nv_public: nv_public.clone(),
        }
        .marshal(&mut params);
        let cmd = Command::new(TpmCc::NvDefineSpace, vec![auth_handle], params.into_vec());
        self.execute(cmd, slots).context("NV_DefineSpace failed")?;
        debug!(
            "defined NV index 0x{:08x} with size {}",
            nv_public.nv_index, nv_public.data_size
        );
        Ok(())
    }

    /// Undefine (delete) an NV index
    pub fn nv_undefine_space(
        &mut self,
        auth_handle: u32,
        index: u32,
        slots: &[SessionSlot],
    ) -> Result<()> {
        let cmd = Command::new(TpmCc::NvUndefineSpace, vec![auth_handle, index], vec![]);
        self.execute(cmd, slots).context("NV_UndefineSpace failed")?;
        debug!("undefined NV index 0x{index:08x}");
        Ok(())
    }

    /// Read `size` bytes from an NV index starting at `offset`
    pub fn nv_read(
        &mut self,
        auth_handle: u32,
        index: u32,
        size: usize,
        offset: u16,
        slots: &[SessionSlot],
    ) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(size);
        while result.len() < size {
            let chunk = (size - result.len()).min(MAX_NV_CHUNK) as u16;
            let at = nv_offset(offset, result.len())?;
            let mut params = CommandBuffer::new();
            params.put_u16(chunk);
            params.put_u16(at);
            let cmd = Command::new(TpmCc::NvRead, vec![auth_handle, index], params.into_vec());
            let response = self
                .execute(cmd, slots)
                .with_context(|| format!("NV_Read failed at offset {at}"))?;
            let data = ResponseBuffer::new(&response.parameters).get_tpm2b()?;
            if data.is_empty() {
                return Err(TssError::MalformedResponse("NV_Read returned no data".into()).into());
            }
            result.extend_from_slice(&data);
        }
        Ok(result)
    }

    /// Write data to an NV index starting at `offset`
    pub fn nv_write(
        &mut self,
        auth_handle: u32,
        index: u32,
        data: &[u8],
        offset: u16,
        slots: &[SessionSlot],
    ) -> Result<()> {
        for (i, chunk) in data.chunks(MAX_NV_CHUNK).enumerate() {
            let at = nv_offset(offset, i * MAX_NV_CHUNK)?;
            let mut params = CommandBuffer::new();
            params.put_tpm2b(chunk);
            params.put_u16(at);
            let cmd = Command::new(TpmCc::NvWrite, vec![auth_handle, index], params.into_vec());
            self.execute(cmd, slots)
                .with_context(|| format!("NV_Write failed at offset {at}"))?;
        }
        debug!("wrote {} bytes to NV index 0x{index:08x}", data.len());
        Ok(())
    }

    /// Change an NV index's auth value, authorized by the index itself
    pub fn nv_change_auth(
        &mut self,
        index: u32,
        new_auth: &[u8],
        slots: &[SessionSlot],
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(new_auth);
        let cmd = Command::new(TpmCc::NvChangeAuth, vec![index], params.into_vec());
        self.execute(cmd, slots).context("NV_ChangeAuth failed")?;
        Ok(())
    }

    // ==================== Hierarchies ====================

    pub fn hierarchy_change_auth(
        &mut self,
        hierarchy: u32,
        new_auth: &[u8],
        slots: &[SessionSlot],
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(new_auth);
        let cmd = Command::new(TpmCc::HierarchyChangeAuth, vec![hierarchy], params.into_vec());
        self.execute(cmd, slots).context("HierarchyChangeAuth failed")?;
        Ok(())
    }

    // ==================== Random ====================

    /// Get random bytes from TPM
    pub fn get_random(&mut self, count: u16, slots: &[SessionSlot]) -> Result<Vec<u8>> {
        let cmd = Command::new(TpmCc::GetRandom, vec![], count.to_be_bytes().to_vec());
        let response = self.execute(cmd, slots).context("GetRandom failed")?;
        ResponseBuffer::new(&response.parameters).get_tpm2b()
    }
}
