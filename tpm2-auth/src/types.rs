// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types used by the session layer

use anyhow::Result;

use super::constants::*;
use super::error::TssError;
use super::marshal::*;

fn alg_from_wire(raw: u16) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(raw)
        .ok_or_else(|| TssError::MalformedResponse(format!("unknown algorithm 0x{raw:04x}")).into())
}

/// TPM2B_DIGEST - Variable length digest, also used for nonces and auth values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
        })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm of a session
///
/// XOR carries its hash algorithm in the key-bits slot and has no mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_cfb(key_bits: u16) -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self::aes_cfb(128)
    }

    pub fn xor(hash_alg: TpmAlgId) -> Self {
        Self {
            algorithm: TpmAlgId::Xor,
            key_bits: hash_alg.to_u16(),
            mode: TpmAlgId::Null,
        }
    }
}

impl Default for TpmtSymDef {
    fn default() -> Self {
        Self::null()
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        match self.algorithm {
            TpmAlgId::Null => {}
            TpmAlgId::Xor => buf.put_u16(self.key_bits),
            _ => {
                buf.put_u16(self.key_bits);
                buf.put_u16(self.mode.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg_from_wire(buf.get_u16()?)?;
        match algorithm {
            TpmAlgId::Null => Ok(Self::null()),
            TpmAlgId::Xor => Ok(Self {
                algorithm,
                key_bits: buf.get_u16()?,
                mode: TpmAlgId::Null,
            }),
            _ => {
                let key_bits = buf.get_u16()?;
                let mode = alg_from_wire(buf.get_u16()?)?;
                Ok(Self {
                    algorithm,
                    key_bits,
                    mode,
                })
            }
        }
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: alg_from_wire(buf.get_u16()?)?,
            attributes: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            data_size: buf.get_u16()?,
        })
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nv_public.to_bytes());
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let size = buf.get_u16()? as usize;
        if size == 0 {
            return Err(TssError::MalformedNvPublic.into());
        }
        let nv_public = TpmsNvPublic::from_bytes(buf.take(size)?)?;
        Ok(Self { nv_public })
    }
}

/// TPMT_RSA_SCHEME / TPMT_SIG_SCHEME - scheme with an optional hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: TpmAlgId,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: TpmAlgId::Null,
        }
    }

    /// RSAES carries no details, every other non-NULL scheme a hash
    fn has_hash(scheme: TpmAlgId) -> bool {
        !matches!(scheme, TpmAlgId::Null | TpmAlgId::RsaEs)
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if Self::has_hash(self.scheme) {
            buf.put_u16(self.hash_alg.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_wire(buf.get_u16()?)?;
        if !Self::has_hash(scheme) {
            return Ok(Self {
                scheme,
                hash_alg: TpmAlgId::Null,
            });
        }
        Ok(Self {
            scheme,
            hash_alg: alg_from_wire(buf.get_u16()?)?,
        })
    }
}

/// TPMS_RSA_PARMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtScheme,
    pub key_bits: u16,
    /// 0 selects the default exponent 65537
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// Key-specific part of a public area
///
/// Only RSA is decoded; salt encryption is the sole consumer of public areas.
/// Other key types keep their parameters and unique field as marshaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicDetail {
    Rsa {
        parameters: TpmsRsaParms,
        modulus: Vec<u8>,
    },
    Other(Vec<u8>),
}

/// TPMT_PUBLIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub detail: PublicDetail,
}

impl TpmtPublic {
    /// Parse a TPM2B_PUBLIC payload (the bytes inside the size prefix)
    pub fn from_public_area(area: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(area);
        Self::unmarshal(&mut buf)
    }

    pub fn rsa(&self) -> Option<(&TpmsRsaParms, &[u8])> {
        match &self.detail {
            PublicDetail::Rsa {
                parameters,
                modulus,
            } => Some((parameters, modulus)),
            PublicDetail::Other(_) => None,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        match &self.detail {
            PublicDetail::Rsa {
                parameters,
                modulus,
            } => {
                parameters.marshal(buf);
                buf.put_tpm2b(modulus);
            }
            PublicDetail::Other(rest) => buf.put_bytes(rest),
        }
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg_from_wire(buf.get_u16()?)?;
        let name_alg = alg_from_wire(buf.get_u16()?)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let detail = if type_alg == TpmAlgId::Rsa {
            let parameters = TpmsRsaParms::unmarshal(buf)?;
            let modulus = buf.get_tpm2b()?;
            PublicDetail::Rsa {
                parameters,
                modulus,
            }
        } else {
            PublicDetail::Other(buf.rest().to_vec())
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            detail,
        })
    }
}

/// TPMS_AUTH_COMMAND - one entry of the command authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl TpmsAuthCommand {
    /// Password authorization carrying `password` in the hmac field
    pub fn password(password: Option<&str>) -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: TpmaSa::new(),
            hmac: password.map(|p| p.as_bytes().to_vec()).unwrap_or_default(),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_AUTH_RESPONSE - one entry of the response authorization area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl Marshal for TpmsAuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
        })
    }
}

/// TPMS_CONTEXT - saved object or session context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub context_blob: Vec<u8>,
}

impl Marshal for TpmsContext {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.context_blob);
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            sequence: buf.get_u64()?,
            saved_handle: buf.get_u32()?,
            hierarchy: buf.get_u32()?,
            context_blob: buf.get_tpm2b()?,
        })
    }
}

/// TPMT_SIGNATURE - only the shapes a PolicySigned signer produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Null,
    /// RSASSA or RSAPSS
    Rsa {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    /// ECDSA (r, s)
    Ecc {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        r: Vec<u8>,
        s: Vec<u8>,
    },
}

impl TpmtSignature {
    pub fn hash_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::Null => TpmAlgId::Null,
            TpmtSignature::Rsa { hash_alg, .. } | TpmtSignature::Ecc { hash_alg, .. } => *hash_alg,
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtSignature::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtSignature::Rsa {
                scheme,
                hash_alg,
                sig,
            } => {
                buf.put_u16(scheme.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::Ecc {
                scheme,
                hash_alg,
                r,
                s,
            } => {
                buf.put_u16(scheme.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(r);
                buf.put_tpm2b(s);
            }
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg_from_wire(buf.get_u16()?)?;
        match scheme {
            TpmAlgId::Null => Ok(TpmtSignature::Null),
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss => Ok(TpmtSignature::Rsa {
                scheme,
                hash_alg: alg_from_wire(buf.get_u16()?)?,
                sig: buf.get_tpm2b()?,
            }),
            TpmAlgId::EcDsa => Ok(TpmtSignature::Ecc {
                scheme,
                hash_alg: alg_from_wire(buf.get_u16()?)?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            }),
            other => Err(TssError::BadParameter(format!(
                "unsupported signature scheme 0x{:04x}",
                other.to_u16()
            ))
            .into()),
        }
    }
}

/// TPM2_StartAuthSession parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAuthSessionIn {
    pub nonce_caller: Vec<u8>,
    pub encrypted_salt: Vec<u8>,
    pub session_type: TpmSe,
    pub symmetric: TpmtSymDef,
    pub auth_hash: TpmAlgId,
}

impl Marshal for StartAuthSessionIn {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce_caller);
        buf.put_tpm2b(&self.encrypted_salt);
        buf.put_u8(self.session_type as u8);
        self.symmetric.marshal(buf);
        buf.put_u16(self.auth_hash.to_u16());
    }
}

impl Unmarshal for StartAuthSessionIn {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nonce_caller = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        let encrypted_salt = buf.get_tpm2b()?;
        let raw_type = buf.get_u8()?;
        let session_type = TpmSe::from_u8(raw_type)
            .ok_or_else(|| TssError::BadParameter(format!("session type 0x{raw_type:02x}")))?;
        Ok(Self {
            nonce_caller,
            encrypted_salt,
            session_type,
            symmetric: TpmtSymDef::unmarshal(buf)?,
            auth_hash: alg_from_wire(buf.get_u16()?)?,
        })
    }
}

/// TPM2_PolicySigned parameters
///
/// `auth` carries the signature scheme and hash on input; the signer fills in
/// the signature itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySignedIn {
    pub nonce_tpm: Vec<u8>,
    pub cp_hash_a: Vec<u8>,
    pub policy_ref: Vec<u8>,
    pub expiration: i32,
    pub auth: TpmtSignature,
}

impl PolicySignedIn {
    /// aHash = H(nonceTPM || expiration || cpHashA || policyRef), sizes excluded
    pub fn signed_data(&self) -> Vec<u8> {
        [
            self.nonce_tpm.as_slice(),
            &self.expiration.to_be_bytes()[..],
            &self.cp_hash_a[..],
            &self.policy_ref[..],
        ]
        .concat()
    }
}

impl Marshal for PolicySignedIn {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce_tpm);
        buf.put_tpm2b(&self.cp_hash_a);
        buf.put_tpm2b(&self.policy_ref);
        buf.put_u32(self.expiration as u32);
        self.auth.marshal(buf);
    }
}

impl Unmarshal for PolicySignedIn {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce_tpm: buf.get_tpm2b()?,
            cp_hash_a: buf.get_tpm2b()?,
            policy_ref: buf.get_tpm2b()?,
            expiration: buf.get_u32()? as i32,
            auth: TpmtSignature::unmarshal(buf)?,
        })
    }
}
