// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command-specific processing around the session round trip
//!
//! A few commands need more than the generic authorization rule: session
//! establishment, auth value changes, policy assertions that change how the next
//! authorization is built, and commands that create or retire handles whose Names
//! the cache must track. [`Hook::for_command`] maps a command code to one of these
//! cases; the engine calls the pre-process, change-auth and post-process steps
//! for it.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::command::TpmResponse;
use crate::constants::*;
use crate::context::{Command, Tss};
use crate::crypto::CryptoProvider;
use crate::error::TssError;
use crate::marshal::*;
use crate::names::{nv_name, object_name, resolve_name, EntityKey};
use crate::session::Session;
use crate::types::*;

/// RSA public exponent used when the key's exponent field is 0
const DEFAULT_RSA_EXPONENT: u32 = 65537;

/// OAEP label for salt encryption, NUL included
const SALT_LABEL: &str = "SECRET\0";

/// Signs the aHash of a PolicySigned assertion
pub trait PolicySigner: Send + Sync {
    /// `template` carries the signature scheme and hash the TPM expects
    fn sign(&self, template: &TpmtSignature, a_hash: &[u8]) -> Result<TpmtSignature>;
}

/// Caller-supplied inputs some hooks need beyond the command parameters
#[derive(Clone, Default)]
pub struct Extra {
    /// StartAuthSession: auth value of the bind entity
    pub bind_password: Option<String>,
    /// PolicySigned: produces the signature over aHash
    pub signer: Option<Arc<dyn PolicySigner>>,
}

impl std::fmt::Debug for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extra")
            .field("bind_password", &self.bind_password.as_ref().map(|_| "<redacted>"))
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Command-specific processing kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    None,
    /// StartAuthSession: nonce and salt before, new session after
    SessionEstablish,
    /// PolicySigned: the caller's signer signs aHash
    PolicySign,
    /// NV_DefineSpace: POLICY_DELETE needs an authPolicy
    NvDefineCheck,
    /// The response HMAC is keyed with a different auth value
    AuthValueChange(AuthChange),
    /// Policy assertion changing how the next authorization is built
    PolicyFlagSet(PolicyFlag),
    /// Name cache bookkeeping
    HandleLifecycle(Lifecycle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChange {
    /// The first parameter is the new auth value
    NewAuth,
    /// NV_UndefineSpaceSpecial: the index is gone, slot 0 answers with EmptyAuth
    NvUndefineSpecial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFlag {
    Password,
    AuthValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Load, LoadExternal
    ObjectLoaded,
    PrimaryCreated,
    PublicRead,
    SequenceStarted,
    SequenceCompleted { handle_index: usize },
    ContextSaved,
    ContextLoaded,
    Flushed,
    Evicted,
    NvUndefined,
    NvPublicRead,
    /// The first successful operation sets this TPMA_NV bit, changing the Name
    NvAttributeSet(u32),
}

impl Hook {
    pub fn for_command(code: u32) -> Self {
        use Lifecycle::*;
        let Some(cc) = TpmCc::from_u32(code) else {
            return Hook::None;
        };
        match cc {
            TpmCc::StartAuthSession => Hook::SessionEstablish,
            TpmCc::PolicySigned => Hook::PolicySign,
            TpmCc::NvDefineSpace => Hook::NvDefineCheck,
            TpmCc::HierarchyChangeAuth | TpmCc::NvChangeAuth => {
                Hook::AuthValueChange(AuthChange::NewAuth)
            }
            TpmCc::NvUndefineSpaceSpecial => Hook::AuthValueChange(AuthChange::NvUndefineSpecial),
            TpmCc::PolicyPassword => Hook::PolicyFlagSet(PolicyFlag::Password),
            TpmCc::PolicyAuthValue => Hook::PolicyFlagSet(PolicyFlag::AuthValue),
            TpmCc::Load | TpmCc::LoadExternal => Hook::HandleLifecycle(ObjectLoaded),
            TpmCc::CreatePrimary => Hook::HandleLifecycle(PrimaryCreated),
            TpmCc::ReadPublic => Hook::HandleLifecycle(PublicRead),
            TpmCc::HmacStart | TpmCc::HashSequenceStart => Hook::HandleLifecycle(SequenceStarted),
            TpmCc::SequenceComplete => {
                Hook::HandleLifecycle(SequenceCompleted { handle_index: 0 })
            }
            TpmCc::EventSequenceComplete => {
                Hook::HandleLifecycle(SequenceCompleted { handle_index: 1 })
            }
            TpmCc::ContextSave => Hook::HandleLifecycle(ContextSaved),
            TpmCc::ContextLoad => Hook::HandleLifecycle(ContextLoaded),
            TpmCc::FlushContext => Hook::HandleLifecycle(Flushed),
            TpmCc::EvictControl => Hook::HandleLifecycle(Evicted),
            TpmCc::NvUndefineSpace => Hook::HandleLifecycle(NvUndefined),
            TpmCc::NvReadPublic => Hook::HandleLifecycle(NvPublicRead),
            TpmCc::NvWrite | TpmCc::NvIncrement | TpmCc::NvExtend | TpmCc::NvSetBits => {
                Hook::HandleLifecycle(NvAttributeSet(TpmaNv::WRITTEN))
            }
            TpmCc::NvWriteLock => Hook::HandleLifecycle(NvAttributeSet(TpmaNv::WRITE_LOCKED)),
            TpmCc::NvReadLock => Hook::HandleLifecycle(NvAttributeSet(TpmaNv::READ_LOCKED)),
            _ => Hook::None,
        }
    }
}

/// Values carried from pre-process to post-process
#[derive(Default)]
pub(crate) struct HookState {
    salt: Zeroizing<Vec<u8>>,
    bind: Option<(u32, Vec<u8>)>,
    bind_auth: Zeroizing<Vec<u8>>,
}

fn handle_at(command: &Command, index: usize) -> Result<u32> {
    command.handles.get(index).copied().ok_or_else(|| {
        TssError::BadParameter(format!(
            "command 0x{:08x} is missing handle {index}",
            command.code
        ))
        .into()
    })
}

/// The salt key must be an RSA-2048 decryption key with the default exponent
pub fn check_salt_key(public: &TpmtPublic) -> Result<&[u8]> {
    let (parms, modulus) = public.rsa().ok_or(TssError::BadSaltKey)?;
    let attrs = public.object_attributes;
    if attrs.contains(TpmaObject::SIGN_ENCRYPT)
        || !attrs.contains(TpmaObject::DECRYPT)
        || parms.key_bits != 2048
        || parms.exponent != 0
    {
        return Err(TssError::BadSaltKey.into());
    }
    Ok(modulus)
}

/// NV_DefineSpace: an index with POLICY_DELETE and no policy could never be deleted
pub fn check_nv_define(parameters: &[u8]) -> Result<()> {
    let mut buf = ResponseBuffer::new(parameters);
    buf.skip_tpm2b()?;
    let public = Tpm2bNvPublic::unmarshal(&mut buf)?.nv_public;
    if public.attributes.contains(TpmaNv::POLICY_DELETE) && public.auth_policy.buffer.is_empty() {
        return Err(TssError::BadParameter("POLICY_DELETE requires an authPolicy".into()).into());
    }
    Ok(())
}

/// PolicySigned: fill in the signature over aHash
pub fn sign_policy(
    crypto: &dyn CryptoProvider,
    signer: Option<&dyn PolicySigner>,
    parameters: &mut Vec<u8>,
) -> Result<()> {
    let signer = signer.ok_or(TssError::NullParameter("policy signer"))?;
    let mut input = PolicySignedIn::from_bytes(parameters)?;
    let a_hash = crypto.hash(input.auth.hash_alg(), &[&input.signed_data()])?;
    input.auth = signer.sign(&input.auth, &a_hash)?;
    *parameters = input.to_bytes();
    Ok(())
}

/// Re-key a session for the response HMAC of an auth-changing command
///
/// `parameters` are the plaintext command parameters.
pub fn change_auth(
    hook: Hook,
    slot: usize,
    session: &mut Session,
    authorized_name: Option<&[u8]>,
    parameters: &[u8],
) -> Result<()> {
    match hook {
        Hook::AuthValueChange(AuthChange::NewAuth) => {
            let mut buf = ResponseBuffer::new(parameters);
            let new_auth = Zeroizing::new(buf.get_tpm2b()?);
            session.set_hmac_key(authorized_name, Some(&new_auth));
        }
        Hook::AuthValueChange(AuthChange::NvUndefineSpecial) if slot == 0 => {
            session.set_hmac_key(authorized_name, None);
        }
        _ => {}
    }
    Ok(())
}

impl Tss {
    pub(crate) fn pre_process(&mut self, hook: Hook, command: &mut Command) -> Result<HookState> {
        match hook {
            Hook::SessionEstablish => self.prepare_session(command),
            Hook::PolicySign => {
                let signer = command.extra.signer.clone();
                sign_policy(
                    self.crypto.as_ref(),
                    signer.as_deref(),
                    &mut command.parameters,
                )?;
                Ok(HookState::default())
            }
            Hook::NvDefineCheck => {
                check_nv_define(&command.parameters)?;
                Ok(HookState::default())
            }
            _ => Ok(HookState::default()),
        }
    }

    fn prepare_session(&mut self, command: &mut Command) -> Result<HookState> {
        let tpm_key = handle_at(command, 0)?;
        let bind = handle_at(command, 1)?;
        let mut input = StartAuthSessionIn::from_bytes(&command.parameters)?;
        let digest_size = input.auth_hash.digest_size();
        if digest_size == 0 {
            return Err(TssError::BadHashAlgorithm(input.auth_hash.to_u16()).into());
        }
        input.nonce_caller = self.crypto.random(digest_size)?;
        input.encrypted_salt.clear();

        let mut state = HookState::default();
        if tpm_key != tpm_rh::NULL {
            let public = self.load_public(tpm_key)?;
            let modulus = check_salt_key(&public)?;
            let salt_size = public.name_alg.digest_size();
            if salt_size == 0 {
                return Err(TssError::BadHashAlgorithm(public.name_alg.to_u16()).into());
            }
            state.salt = Zeroizing::new(self.crypto.random(salt_size)?);
            input.encrypted_salt = self.crypto.rsa_oaep_encrypt(
                modulus,
                DEFAULT_RSA_EXPONENT,
                SALT_LABEL,
                public.name_alg,
                &state.salt,
            )?;
            debug!("salting session with key 0x{tpm_key:08x}");
        }
        if bind != tpm_rh::NULL {
            let name = resolve_name(self.names.as_ref(), bind)
                .with_context(|| format!("bind entity 0x{bind:08x}"))?;
            let auth = command.extra.bind_password.as_deref().unwrap_or_default();
            if auth.len() > MAX_DIGEST_SIZE {
                return Err(TssError::BadParameter("bind password too long".into()).into());
            }
            state.bind = Some((bind, name));
            state.bind_auth = Zeroizing::new(auth.as_bytes().to_vec());
        }
        command.parameters = input.to_bytes();
        Ok(state)
    }

    /// Public area of `handle`, read from the TPM when not cached
    pub(crate) fn load_public(&mut self, handle: u32) -> Result<TpmtPublic> {
        if let Some(area) = self.names.public(handle)? {
            return TpmtPublic::from_public_area(&area);
        }
        debug!("public area of 0x{handle:08x} not cached, reading it");
        self.execute(Command::new(TpmCc::ReadPublic, vec![handle], vec![]), &[])?;
        let area = self
            .names
            .public(handle)?
            .ok_or(TssError::NameNotFound(handle))?;
        TpmtPublic::from_public_area(&area)
    }

    pub(crate) fn post_process(
        &mut self,
        hook: Hook,
        command: &Command,
        parameters: &[u8],
        response: &TpmResponse,
        state: HookState,
    ) -> Result<()> {
        match hook {
            Hook::SessionEstablish => self.establish_session(parameters, response, state),
            Hook::AuthValueChange(AuthChange::NvUndefineSpecial) => {
                self.forget_nv(handle_at(command, 0)?);
                Ok(())
            }
            Hook::PolicyFlagSet(flag) => self.set_policy_flag(handle_at(command, 0)?, flag),
            Hook::HandleLifecycle(kind) => self.track_handle(kind, command, parameters, response),
            _ => Ok(()),
        }
    }

    fn establish_session(
        &mut self,
        parameters: &[u8],
        response: &TpmResponse,
        mut state: HookState,
    ) -> Result<()> {
        let handle = response
            .handle
            .ok_or_else(|| TssError::MalformedResponse("no session handle".into()))?;
        let input = StartAuthSessionIn::from_bytes(parameters)?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let nonce_tpm = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;

        let mut session = Session::new(handle, input.auth_hash, input.symmetric, input.session_type)?;
        session.nonce_tpm = nonce_tpm;
        session.nonce_caller = input.nonce_caller.clone();
        let bound = state.bind.is_some();
        session.derive_session_key(
            self.crypto.as_ref(),
            state.bind.take(),
            &state.bind_auth,
            &state.salt,
        )?;
        self.sessions.save(&session)?;
        debug!(
            "started {:?} session 0x{handle:08x}, bound {bound}, salted {}",
            session.session_type,
            !state.salt.is_empty()
        );
        Ok(())
    }

    fn set_policy_flag(&mut self, handle: u32, flag: PolicyFlag) -> Result<()> {
        let _guard = self.locks.acquire(&[handle])?;
        let mut session = self.sessions.load(handle)?;
        session.password_needed = flag == PolicyFlag::Password;
        session.auth_value_needed = flag == PolicyFlag::AuthValue;
        self.sessions.save(&session)?;
        debug!("session 0x{handle:08x}: {flag:?} required for next use");
        Ok(())
    }

    /// Drop an NV index from the cache, nothing may be cached for it
    fn forget_nv(&self, index: u32) {
        if let Err(e) = self
            .names
            .delete(&index.into())
            .and_then(|_| self.names.delete_nv_public(index))
        {
            warn!("failed to forget NV index 0x{index:08x}: {e:#}");
        }
    }

    /// Copy cache entries, skipping entities this cache never saw
    fn copy_if_known(&self, from: EntityKey, to: EntityKey) -> Result<()> {
        if self.names.get(crate::names::CacheEntry::Name, &from)?.is_none() {
            debug!("no Name cached for {from:?}, not copied");
            return Ok(());
        }
        self.names.copy_entity(&from, &to)
    }

    fn track_handle(
        &mut self,
        kind: Lifecycle,
        command: &Command,
        parameters: &[u8],
        response: &TpmResponse,
    ) -> Result<()> {
        let mut out = ResponseBuffer::new(&response.parameters);
        let new_handle = || {
            response
                .handle
                .ok_or_else(|| TssError::MalformedResponse("no object handle".into()))
        };
        match kind {
            Lifecycle::ObjectLoaded => {
                let handle = new_handle()?;
                let name = out.get_tpm2b()?;
                let mut input = ResponseBuffer::new(parameters);
                input.skip_tpm2b()?;
                let public = input.get_tpm2b()?;
                self.names.store_name(handle, &name)?;
                self.names.store_public(handle, &public)?;
            }
            Lifecycle::PrimaryCreated => {
                let handle = new_handle()?;
                let public = out.get_tpm2b()?;
                out.skip_tpm2b()?; // creationData
                out.skip_tpm2b()?; // creationHash
                out.skip(6)?; // creationTicket tag and hierarchy
                out.skip_tpm2b()?;
                let name = out.get_tpm2b()?;
                self.names.store_name(handle, &name)?;
                self.names.store_public(handle, &public)?;
            }
            Lifecycle::PublicRead => {
                let handle = handle_at(command, 0)?;
                let public = out.get_tpm2b()?;
                let name = out.get_tpm2b()?;
                if object_name(self.crypto.as_ref(), &public)? != name {
                    return Err(TssError::MalformedPublic.into());
                }
                self.names.store_name(handle, &name)?;
                self.names.store_public(handle, &public)?;
            }
            Lifecycle::SequenceStarted => {
                // sequence objects have an empty Name
                self.names.store_name(new_handle()?, &[])?;
            }
            Lifecycle::SequenceCompleted { handle_index } => {
                self.names.delete(&handle_at(command, handle_index)?.into())?;
            }
            Lifecycle::ContextSaved => {
                let handle = handle_at(command, 0)?;
                if TpmHt::of(handle) == Some(TpmHt::Transient) {
                    let context = TpmsContext::from_bytes(&response.parameters)?;
                    self.copy_if_known(handle.into(), context_key(&context))?;
                }
            }
            Lifecycle::ContextLoaded => {
                let handle = new_handle()?;
                if TpmHt::of(handle) == Some(TpmHt::Transient) {
                    let context = TpmsContext::from_bytes(parameters)?;
                    self.copy_if_known(context_key(&context), handle.into())?;
                }
            }
            Lifecycle::Flushed => {
                let handle = ResponseBuffer::new(parameters).get_u32()?;
                self.names.delete(&handle.into())?;
                if matches!(
                    TpmHt::of(handle),
                    Some(TpmHt::HmacSession | TpmHt::PolicySession)
                ) {
                    self.sessions.delete(handle)?;
                }
            }
            Lifecycle::Evicted => {
                let object = handle_at(command, 1)?;
                let persistent = ResponseBuffer::new(parameters).get_u32()?;
                if object != persistent {
                    self.copy_if_known(object.into(), persistent.into())?;
                } else {
                    self.names.delete(&persistent.into())?;
                }
            }
            Lifecycle::NvUndefined => self.forget_nv(handle_at(command, 1)?),
            Lifecycle::NvPublicRead => {
                let index = handle_at(command, 0)?;
                let nv_public = Tpm2bNvPublic::unmarshal(&mut out)?.nv_public;
                let name = out.get_tpm2b()?;
                if nv_name(self.crypto.as_ref(), &nv_public)? != name {
                    return Err(TssError::MalformedNvPublic.into());
                }
                self.names.store_name(index, &name)?;
                self.names.store_nv_public(index, &nv_public)?;
            }
            Lifecycle::NvAttributeSet(bit) => {
                self.set_nv_attribute(handle_at(command, 1)?, bit)?;
            }
        }
        Ok(())
    }

    fn set_nv_attribute(&self, index: u32, bit: u32) -> Result<()> {
        let Some(mut nv_public) = self.names.nv_public(index)? else {
            // a Name without its public area could now be stale
            self.names.delete(&index.into())?;
            return Ok(());
        };
        if nv_public.attributes.contains(bit) {
            return Ok(());
        }
        nv_public.attributes.0 |= bit;
        let updated = self
            .names
            .store_nv_public(index, &nv_public)
            .and_then(|_| nv_name(self.crypto.as_ref(), &nv_public))
            .and_then(|name| self.names.store_name(index, &name));
        if let Err(e) = updated {
            self.forget_nv(index);
            return Err(e);
        }
        debug!("NV index 0x{index:08x}: attribute 0x{bit:08x} set, Name updated");
        Ok(())
    }
}

/// Cache key of a saved context: hex SHA-256 of the context blob
fn context_key(context: &TpmsContext) -> EntityKey {
    EntityKey::SavedContext(hex::encode(Sha256::digest(&context.context_blob)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use crate::error::{result_code, rc};

    #[test]
    fn test_hook_table() {
        let hook = |cc: TpmCc| Hook::for_command(cc.to_u32());
        assert_eq!(hook(TpmCc::StartAuthSession), Hook::SessionEstablish);
        assert_eq!(
            hook(TpmCc::NvChangeAuth),
            Hook::AuthValueChange(AuthChange::NewAuth)
        );
        assert_eq!(
            hook(TpmCc::NvIncrement),
            Hook::HandleLifecycle(Lifecycle::NvAttributeSet(TpmaNv::WRITTEN))
        );
        assert_eq!(
            hook(TpmCc::NvReadLock),
            Hook::HandleLifecycle(Lifecycle::NvAttributeSet(TpmaNv::READ_LOCKED))
        );
        assert_eq!(
            hook(TpmCc::EventSequenceComplete),
            Hook::HandleLifecycle(Lifecycle::SequenceCompleted { handle_index: 1 })
        );
        assert_eq!(hook(TpmCc::GetRandom), Hook::None);
        assert_eq!(Hook::for_command(0xdead), Hook::None);
    }

    fn rsa_public(attrs: u32, key_bits: u16, exponent: u32) -> TpmtPublic {
        TpmtPublic {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject(attrs),
            auth_policy: Tpm2bDigest::empty(),
            detail: PublicDetail::Rsa {
                parameters: TpmsRsaParms {
                    symmetric: TpmtSymDef::aes_128_cfb(),
                    scheme: TpmtScheme::null(),
                    key_bits,
                    exponent,
                },
                modulus: vec![0xc1; 256],
            },
        }
    }

    #[test]
    fn test_salt_key_checks() {
        let storage = TpmaObject::DECRYPT | TpmaObject::RESTRICTED;
        assert_eq!(check_salt_key(&rsa_public(storage, 2048, 0)).unwrap().len(), 256);
        for bad in [
            rsa_public(storage | TpmaObject::SIGN_ENCRYPT, 2048, 0),
            rsa_public(TpmaObject::RESTRICTED, 2048, 0),
            rsa_public(storage, 3072, 0),
            rsa_public(storage, 2048, 3),
        ] {
            let err = check_salt_key(&bad).unwrap_err();
            assert_eq!(result_code(&err), rc::BAD_SALT_KEY);
        }
        let mut ecc = rsa_public(storage, 2048, 0);
        ecc.detail = PublicDetail::Other(vec![0x00, 0x10]);
        assert!(check_salt_key(&ecc).is_err());
    }

    fn define_params(attributes: u32, policy: Vec<u8>) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(b"auth");
        Tpm2bNvPublic {
            nv_public: TpmsNvPublic {
                nv_index: 0x01000010,
                name_alg: TpmAlgId::Sha256,
                attributes: TpmaNv(attributes),
                auth_policy: Tpm2bDigest::new(policy),
                data_size: 8,
            },
        }
        .marshal(&mut buf);
        buf.into_vec()
    }

    #[test]
    fn test_nv_define_policy_delete() {
        check_nv_define(&define_params(TpmaNv::AUTH_WRITE, vec![])).unwrap();
        check_nv_define(&define_params(TpmaNv::POLICY_DELETE, vec![0xff; 32])).unwrap();
        let err = check_nv_define(&define_params(TpmaNv::POLICY_DELETE, vec![])).unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_PARAMETER);
    }

    struct FixedSigner;

    impl PolicySigner for FixedSigner {
        fn sign(&self, template: &TpmtSignature, a_hash: &[u8]) -> Result<TpmtSignature> {
            Ok(TpmtSignature::Rsa {
                scheme: TpmAlgId::RsaSsa,
                hash_alg: template.hash_alg(),
                sig: a_hash.to_vec(),
            })
        }
    }

    #[test]
    fn test_policy_signed_signs_a_hash() {
        let c = SoftwareCrypto;
        let input = PolicySignedIn {
            nonce_tpm: vec![1; 16],
            cp_hash_a: vec![],
            policy_ref: b"ref".to_vec(),
            expiration: -10,
            auth: TpmtSignature::Rsa {
                scheme: TpmAlgId::RsaSsa,
                hash_alg: TpmAlgId::Sha256,
                sig: vec![],
            },
        };
        let mut params = input.to_bytes();
        sign_policy(&c, Some(&FixedSigner), &mut params).unwrap();

        let signed = PolicySignedIn::from_bytes(&params).unwrap();
        let mut data = vec![1u8; 16];
        data.extend_from_slice(&(-10i32).to_be_bytes());
        data.extend_from_slice(b"ref");
        let expected = c.hash(TpmAlgId::Sha256, &[&data]).unwrap();
        assert_eq!(
            signed.auth,
            TpmtSignature::Rsa {
                scheme: TpmAlgId::RsaSsa,
                hash_alg: TpmAlgId::Sha256,
                sig: expected,
            }
        );

        let err = sign_policy(&c, None, &mut input.to_bytes()).unwrap_err();
        assert_eq!(result_code(&err), rc::NULL_PARAMETER);
    }

    #[test]
    fn test_change_auth_rekeys_with_new_auth() {
        let mut s =
            Session::new(0x02000000, TpmAlgId::Sha256, TpmtSymDef::null(), TpmSe::Hmac).unwrap();
        s.session_key = vec![4; 32];
        s.set_hmac_key(Some(&[0x40, 0, 0, 1][..]), Some(&b"old"[..]));

        let mut params = CommandBuffer::new();
        params.put_tpm2b(b"new");
        let hook = Hook::AuthValueChange(AuthChange::NewAuth);
        change_auth(hook, 0, &mut s, Some(&[0x40, 0, 0, 1][..]), params.as_bytes()).unwrap();
        let mut key = vec![4; 32];
        key.extend_from_slice(b"new");
        assert_eq!(s.hmac_key, key);

        let hook = Hook::AuthValueChange(AuthChange::NvUndefineSpecial);
        change_auth(hook, 1, &mut s, Some(&[0x40, 0, 0, 0x0c][..]), &[]).unwrap();
        assert_eq!(s.hmac_key, key);
        change_auth(hook, 0, &mut s, Some(&[0x01, 0, 0, 1][..]), &[]).unwrap();
        assert_eq!(s.hmac_key, vec![4; 32]);
    }
}
