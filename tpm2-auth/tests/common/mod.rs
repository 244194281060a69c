// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM for exercising the session layer end to end
//!
//! Implements the TPM side of session authorization for a handful of commands:
//! session start (bound, salted), HMAC and password checks, parameter
//! encryption, nonce rolling and response HMACs.

#![allow(dead_code)]

use anyhow::Result;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tpm2_auth::*;

/// Persistent handle of the salt key, when present
pub const SALT_KEY: u32 = 0x81000001;

pub const RC_AUTH_FAIL: u32 = 0x98e;
pub const RC_HANDLE: u32 = 0x08b;
pub const RC_COMMAND_CODE: u32 = 0x143;
pub const RC_NV_UNINITIALIZED: u32 = 0x14a;
pub const RC_NV_DEFINED: u32 = 0x14c;
pub const RC_VALUE: u32 = 0x084;

struct TpmSession {
    session_type: TpmSe,
    hash_alg: TpmAlgId,
    symmetric: TpmtSymDef,
    nonce_tpm: Vec<u8>,
    nonce_caller: Vec<u8>,
    session_key: Vec<u8>,
    bind: Option<(Vec<u8>, Vec<u8>)>,
    policy_password: bool,
    policy_auth_value: bool,
}

struct NvIndex {
    public: TpmsNvPublic,
    auth: Vec<u8>,
    data: Vec<u8>,
}

struct SaltKey {
    key: RsaPrivateKey,
    public_area: Vec<u8>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<u32, TpmSession>,
    next_session: u32,
    owner_auth: Vec<u8>,
    nv: HashMap<u32, NvIndex>,
    salt_key: Option<SaltKey>,
    transmitted: usize,
    tamper: bool,
    audit_responses: bool,
    close_sessions: bool,
    last_command: Vec<u8>,
}

/// Slot-level outcome of command authorization
struct Authorized {
    handle: u32,
    attributes: TpmaSa,
    /// Index of the authorized handle, when the slot has an auth role
    entity: Option<usize>,
    bind_match: bool,
}

/// Cloneable handle to one software TPM
#[derive(Clone, Default)]
pub struct SoftTpm {
    state: Arc<Mutex<State>>,
}

impl SoftTpm {
    pub fn new() -> Self {
        Self::default()
    }

    /// TPM with an RSA-2048 storage key at [`SALT_KEY`]
    pub fn with_salt_key() -> Self {
        let tpm = Self::new();
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = TpmtPublic {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject(TpmaObject::RESTRICTED | TpmaObject::DECRYPT),
            auth_policy: Tpm2bDigest::empty(),
            detail: PublicDetail::Rsa {
                parameters: TpmsRsaParms {
                    symmetric: TpmtSymDef::aes_128_cfb(),
                    scheme: TpmtScheme::null(),
                    key_bits: 2048,
                    exponent: 0,
                },
                modulus: key.n().to_bytes_be(),
            },
        };
        tpm.lock().salt_key = Some(SaltKey {
            key,
            public_area: public.to_bytes(),
        });
        tpm
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn transmitted(&self) -> usize {
        self.lock().transmitted
    }

    pub fn last_command(&self) -> Vec<u8> {
        self.lock().last_command.clone()
    }

    /// Corrupt the first response authorization of every later command
    pub fn set_tamper(&self, tamper: bool) {
        self.lock().tamper = tamper;
    }

    /// Mark every later session response as audited
    pub fn set_audit_responses(&self, audit: bool) {
        self.lock().audit_responses = audit;
    }

    /// Close every session used by later commands, whatever the caller asked
    pub fn set_close_sessions(&self, close: bool) {
        self.lock().close_sessions = close;
    }

    pub fn set_owner_auth(&self, auth: &[u8]) {
        self.lock().owner_auth = auth.to_vec();
    }

    pub fn owner_auth(&self) -> Vec<u8> {
        self.lock().owner_auth.clone()
    }

    pub fn has_session(&self, handle: u32) -> bool {
        self.lock().sessions.contains_key(&handle)
    }

    pub fn nv_data(&self, index: u32) -> Option<Vec<u8>> {
        self.lock().nv.get(&index).map(|nv| nv.data.clone())
    }

    pub fn nv_auth(&self, index: u32) -> Option<Vec<u8>> {
        self.lock().nv.get(&index).map(|nv| nv.auth.clone())
    }
}

impl Transport for SoftTpm {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.transmitted += 1;
        state.last_command = command.to_vec();
        Ok(match state.execute(command) {
            Ok(response) => response,
            Err(rc) => error_response(rc),
        })
    }
}

fn error_response(rc: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(10);
    buf.put_u32(rc);
    buf.into_vec()
}

fn success_response(handle: Option<u32>, params: &[u8], auths: &[TpmsAuthResponse]) -> Vec<u8> {
    let tag = match auths.is_empty() {
        true => TpmSt::NoSessions,
        false => TpmSt::Sessions,
    };
    let mut buf = CommandBuffer::new();
    buf.put_u16(tag.to_u16());
    buf.put_u32(0);
    buf.put_u32(0);
    if let Some(h) = handle {
        buf.put_u32(h);
    }
    if !auths.is_empty() {
        buf.put_u32(params.len() as u32);
    }
    buf.put_bytes(params);
    for auth in auths {
        auth.marshal(&mut buf);
    }
    let size = buf.len() as u32;
    buf.update_u32(2, size);
    buf.into_vec()
}

/// XOR or AES-CFB over a first parameter, TPM side
fn param_crypt(
    session: &TpmSession,
    session_value: &[u8],
    newer: &[u8],
    older: &[u8],
    data: &mut [u8],
    encrypt: bool,
) {
    if data.is_empty() {
        return;
    }
    let c = SoftwareCrypto;
    match session.symmetric.algorithm {
        TpmAlgId::Xor => {
            let mask = c
                .kdfa(session.hash_alg, session_value, "XOR", newer, older, data.len() as u32 * 8)
                .unwrap();
            data.iter_mut().zip(mask).for_each(|(d, m)| *d ^= m);
        }
        TpmAlgId::Aes => {
            let key_bytes = session.symmetric.key_bits as usize / 8;
            let material = c
                .kdfa(
                    session.hash_alg,
                    session_value,
                    "CFB",
                    newer,
                    older,
                    session.symmetric.key_bits as u32 + 128,
                )
                .unwrap();
            let (key, iv) = material.split_at(key_bytes);
            match encrypt {
                true => c.cfb_encrypt(key, iv, data).unwrap(),
                false => c.cfb_decrypt(key, iv, data).unwrap(),
            }
        }
        _ => panic!("unsupported parameter cipher"),
    }
}

fn first_tpm2b(params: &[u8]) -> std::ops::Range<usize> {
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    2..2 + size
}

impl State {
    fn name(&self, handle: u32) -> Result<Vec<u8>, u32> {
        let c = SoftwareCrypto;
        match TpmHt::of(handle) {
            Some(TpmHt::NvIndex) => {
                let nv = self.nv.get(&handle).ok_or(RC_HANDLE)?;
                Ok(nv_name(&c, &nv.public).unwrap())
            }
            Some(TpmHt::Persistent) if handle == SALT_KEY => {
                let key = self.salt_key.as_ref().ok_or(RC_HANDLE)?;
                Ok(object_name(&c, &key.public_area).unwrap())
            }
            Some(TpmHt::Persistent | TpmHt::Transient) => Err(RC_HANDLE),
            _ => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    fn auth_value(&self, handle: u32) -> Vec<u8> {
        match handle {
            tpm_rh::OWNER => self.owner_auth.clone(),
            h => self.nv.get(&h).map(|nv| nv.auth.clone()).unwrap_or_default(),
        }
    }

    /// HMAC key and session value of slot `slot` as the TPM derives them
    fn keys(&self, session: &TpmSession, entity: Option<u32>, bind_match: bool) -> (Vec<u8>, Vec<u8>) {
        let sk = session.session_key.clone();
        let Some(entity) = entity else {
            return (sk.clone(), sk);
        };
        if session.session_type == TpmSe::Policy && !session.policy_auth_value {
            return (sk.clone(), sk);
        }
        if bind_match {
            let bind_auth = session.bind.as_ref().map(|b| b.1.clone()).unwrap_or_default();
            return (sk.clone(), [sk, bind_auth].concat());
        }
        let with_auth = [sk, self.auth_value(entity)].concat();
        (with_auth.clone(), with_auth)
    }

    fn execute(&mut self, command: &[u8]) -> Result<Vec<u8>, u32> {
        let c = SoftwareCrypto;
        let mut buf = ResponseBuffer::new(command);
        let tag = buf.get_u16().map_err(|_| RC_VALUE)?;
        let _size = buf.get_u32().map_err(|_| RC_VALUE)?;
        let cc = buf.get_u32().map_err(|_| RC_VALUE)?;
        let spec = CommandSpec::lookup(cc).ok_or(RC_COMMAND_CODE)?;
        let mut handles = Vec::new();
        for _ in 0..spec.handles {
            handles.push(buf.get_u32().map_err(|_| RC_VALUE)?);
        }
        let mut auths = Vec::new();
        if tag == TpmSt::Sessions.to_u16() {
            let area_size = buf.get_u32().map_err(|_| RC_VALUE)? as usize;
            let area = buf.take(area_size).map_err(|_| RC_VALUE)?;
            let mut area = ResponseBuffer::new(area);
            while !area.is_empty() {
                auths.push(TpmsAuthCommand::unmarshal(&mut area).map_err(|_| RC_VALUE)?);
            }
        }
        let mut params = buf.rest().to_vec();

        let names = handles
            .iter()
            .map(|h| self.name(*h))
            .collect::<Result<Vec<_>, _>>()?;
        let cp_hash = |alg: TpmAlgId| {
            let code = cc.to_be_bytes();
            let mut parts: Vec<&[u8]> = vec![&code[..]];
            parts.extend(names.iter().map(Vec::as_slice));
            parts.push(&params);
            c.hash(alg, &parts).unwrap()
        };

        // nonceTPM of the parameter sessions, folded into slot 0
        let old_nonce = |i: usize| -> Vec<u8> {
            auths
                .get(i)
                .and_then(|a| self.sessions.get(&a.session_handle))
                .map(|s| s.nonce_tpm.clone())
                .unwrap_or_default()
        };
        let decrypt_slot = auths.iter().position(|a| a.attributes.decrypt());
        let encrypt_slot = auths.iter().position(|a| a.attributes.encrypt());
        let mut folded = (Vec::new(), Vec::new());
        if let Some(d) = decrypt_slot.filter(|d| *d != 0) {
            folded.0 = old_nonce(d);
        }
        if let Some(e) = encrypt_slot.filter(|e| *e != 0 && Some(*e) != decrypt_slot) {
            folded.1 = old_nonce(e);
        }

        let mut authorized = Vec::new();
        for (i, auth) in auths.iter().enumerate() {
            let entity = (i < spec.auth_handles).then_some(i);
            let entity_handle = entity.map(|e| handles[e]);
            if auth.session_handle == tpm_rh::PW {
                let expected = entity_handle.map(|h| self.auth_value(h)).unwrap_or_default();
                if auth.hmac != expected {
                    return Err(RC_AUTH_FAIL);
                }
                authorized.push(Authorized {
                    handle: tpm_rh::PW,
                    attributes: auth.attributes,
                    entity,
                    bind_match: false,
                });
                continue;
            }
            let session = self.sessions.get(&auth.session_handle).ok_or(RC_HANDLE)?;
            let bind_match = match (&session.bind, entity) {
                (Some((bind_name, _)), Some(e)) => {
                    session.session_type == TpmSe::Hmac && *bind_name == names[e]
                }
                _ => false,
            };
            let (hmac_key, _) = self.keys(session, entity_handle, bind_match);
            if session.policy_password {
                if auth.hmac != entity_handle.map(|h| self.auth_value(h)).unwrap_or_default() {
                    return Err(RC_AUTH_FAIL);
                }
            } else if session.session_type == TpmSe::Hmac || session.policy_auth_value {
                let (dec, enc) = match i {
                    0 => (folded.0.as_slice(), folded.1.as_slice()),
                    _ => (&[][..], &[][..]),
                };
                let expected = c
                    .hmac(
                        session.hash_alg,
                        &hmac_key,
                        &[
                            &cp_hash(session.hash_alg),
                            &auth.nonce,
                            &session.nonce_tpm,
                            dec,
                            enc,
                            &[auth.attributes.0],
                        ],
                    )
                    .unwrap();
                if auth.hmac != expected {
                    return Err(RC_AUTH_FAIL);
                }
            }
            authorized.push(Authorized {
                handle: auth.session_handle,
                attributes: auth.attributes,
                entity,
                bind_match,
            });
        }
        for (auth, slot) in auths.iter().zip(&authorized) {
            if let Some(s) = self.sessions.get_mut(&slot.handle) {
                s.nonce_caller = auth.nonce.clone();
            }
        }

        if let Some(d) = decrypt_slot {
            let slot = &authorized[d];
            let session = &self.sessions[&slot.handle];
            let (_, value) = self.keys(session, slot.entity.map(|e| handles[e]), slot.bind_match);
            let range = first_tpm2b(&params);
            param_crypt(
                session,
                &value,
                &session.nonce_caller,
                &session.nonce_tpm,
                &mut params[range],
                false,
            );
        }

        let (handle, mut out) = self.dispatch(cc, &handles, &params)?;

        for slot in &authorized {
            if let Some(s) = self.sessions.get_mut(&slot.handle) {
                s.nonce_tpm = c.random(s.hash_alg.digest_size()).unwrap();
            }
        }
        if let Some(e) = encrypt_slot {
            let slot = &authorized[e];
            let session = &self.sessions[&slot.handle];
            let (_, value) = self.keys(session, slot.entity.map(|e| handles[e]), slot.bind_match);
            let range = first_tpm2b(&out);
            param_crypt(
                session,
                &value,
                &session.nonce_tpm,
                &session.nonce_caller,
                &mut out[range],
                true,
            );
        }

        let rp_hash = |alg: TpmAlgId| c.hash(alg, &[&0u32.to_be_bytes(), &cc.to_be_bytes(), &out]).unwrap();
        let mut responses = Vec::new();
        for slot in &authorized {
            let Some(session) = self.sessions.get(&slot.handle) else {
                responses.push(TpmsAuthResponse {
                    nonce: vec![],
                    attributes: TpmaSa::new().with_continue_session(),
                    hmac: vec![],
                });
                continue;
            };
            let authenticates = !session.policy_password
                && (session.session_type == TpmSe::Hmac || session.policy_auth_value);
            let mut attributes = TpmaSa(slot.attributes.0 & !(TpmaSa::CONTINUE_SESSION | TpmaSa::AUDIT));
            if slot.attributes.continue_session() && !self.close_sessions {
                attributes = attributes.with_continue_session();
            }
            if slot.attributes.audit() || self.audit_responses {
                attributes = attributes.with_audit();
            }
            let hmac = match authenticates {
                true => {
                    // auth values are read after the command ran
                    let (key, _) =
                        self.keys(session, slot.entity.map(|e| handles[e]), slot.bind_match);
                    c.hmac(
                        session.hash_alg,
                        &key,
                        &[
                            &rp_hash(session.hash_alg),
                            &session.nonce_tpm,
                            &session.nonce_caller,
                            &[attributes.0],
                        ],
                    )
                    .unwrap()
                }
                false => vec![],
            };
            responses.push(TpmsAuthResponse {
                nonce: session.nonce_tpm.clone(),
                attributes,
                hmac,
            });
        }
        for (slot, response) in authorized.iter().zip(&responses) {
            if slot.handle == tpm_rh::PW {
                continue;
            }
            if !response.attributes.continue_session() {
                self.sessions.remove(&slot.handle);
            } else if response.attributes.audit() {
                if let Some(s) = self.sessions.get_mut(&slot.handle) {
                    s.bind = None;
                }
            }
        }
        if self.tamper {
            if let Some(first) = responses.first_mut() {
                match first.hmac.last_mut() {
                    Some(b) => *b ^= 1,
                    None => first.nonce.push(0),
                }
            }
        }
        Ok(success_response(handle, &out, &responses))
    }

    fn dispatch(
        &mut self,
        cc: u32,
        handles: &[u32],
        params: &[u8],
    ) -> Result<(Option<u32>, Vec<u8>), u32> {
        let c = SoftwareCrypto;
        let mut input = ResponseBuffer::new(params);
        let mut out = CommandBuffer::new();
        let bad = |_: anyhow::Error| RC_VALUE;
        match TpmCc::from_u32(cc).ok_or(RC_COMMAND_CODE)? {
            TpmCc::StartAuthSession => {
                let start = StartAuthSessionIn::from_bytes(params).map_err(bad)?;
                let (tpm_key, bind) = (handles[0], handles[1]);
                let salt = match tpm_key {
                    tpm_rh::NULL => Vec::new(),
                    SALT_KEY => {
                        let key = self.salt_key.as_ref().ok_or(RC_HANDLE)?;
                        key.key
                            .decrypt(
                                Oaep::new_with_label::<Sha256, _>("SECRET\0"),
                                &start.encrypted_salt,
                            )
                            .map_err(|_| RC_VALUE)?
                    }
                    _ => return Err(RC_HANDLE),
                };
                let bind = match bind {
                    tpm_rh::NULL => None,
                    h => Some((self.name(h)?, self.auth_value(h))),
                };
                let digest_size = start.auth_hash.digest_size();
                let nonce_tpm = c.random(digest_size).unwrap();
                let session_key = match bind.is_some() || !salt.is_empty() {
                    true => {
                        let bind_auth = bind.as_ref().map(|b| b.1.clone()).unwrap_or_default();
                        c.kdfa(
                            start.auth_hash,
                            &[bind_auth, salt].concat(),
                            "ATH",
                            &nonce_tpm,
                            &start.nonce_caller,
                            digest_size as u32 * 8,
                        )
                        .unwrap()
                    }
                    false => Vec::new(),
                };
                self.next_session += 1;
                let ht = match start.session_type {
                    TpmSe::Hmac => 0x02000000,
                    _ => 0x03000000,
                };
                let handle = ht | self.next_session;
                out.put_tpm2b(&nonce_tpm);
                self.sessions.insert(
                    handle,
                    TpmSession {
                        session_type: start.session_type,
                        hash_alg: start.auth_hash,
                        symmetric: start.symmetric,
                        nonce_tpm,
                        nonce_caller: start.nonce_caller,
                        session_key,
                        bind,
                        policy_password: false,
                        policy_auth_value: false,
                    },
                );
                return Ok((Some(handle), out.into_vec()));
            }
            TpmCc::GetRandom => {
                let count = input.get_u16().map_err(bad)?;
                out.put_tpm2b(&c.random(count as usize).unwrap());
            }
            TpmCc::ReadPublic => {
                let key = match handles[0] {
                    SALT_KEY => self.salt_key.as_ref().ok_or(RC_HANDLE)?,
                    _ => return Err(RC_HANDLE),
                };
                out.put_tpm2b(&key.public_area);
                out.put_tpm2b(&object_name(&c, &key.public_area).unwrap());
                out.put_tpm2b(&[]);
            }
            TpmCc::NvDefineSpace => {
                let auth = input.get_tpm2b().map_err(bad)?;
                let public = Tpm2bNvPublic::unmarshal(&mut input).map_err(bad)?.nv_public;
                if self.nv.contains_key(&public.nv_index) {
                    return Err(RC_NV_DEFINED);
                }
                self.nv.insert(
                    public.nv_index,
                    NvIndex {
                        data: vec![0; public.data_size as usize],
                        public,
                        auth,
                    },
                );
            }
            TpmCc::NvUndefineSpace => {
                self.nv.remove(&handles[1]).ok_or(RC_HANDLE)?;
            }
            TpmCc::NvReadPublic => {
                let nv = self.nv.get(&handles[0]).ok_or(RC_HANDLE)?;
                Tpm2bNvPublic {
                    nv_public: nv.public.clone(),
                }
                .marshal(&mut out);
                out.put_tpm2b(&nv_name(&c, &nv.public).unwrap());
            }
            TpmCc::NvRead => {
                let size = input.get_u16().map_err(bad)? as usize;
                let offset = input.get_u16().map_err(bad)? as usize;
                let nv = self.nv.get(&handles[1]).ok_or(RC_HANDLE)?;
                if !nv.public.attributes.contains(TpmaNv::WRITTEN) {
                    return Err(RC_NV_UNINITIALIZED);
                }
                let data = nv.data.get(offset..offset + size).ok_or(RC_VALUE)?;
                out.put_tpm2b(data);
            }
            TpmCc::NvWrite => {
                let data = input.get_tpm2b().map_err(bad)?;
                let offset = input.get_u16().map_err(bad)? as usize;
                let nv = self.nv.get_mut(&handles[1]).ok_or(RC_HANDLE)?;
                let target = nv.data.get_mut(offset..offset + data.len()).ok_or(RC_VALUE)?;
                target.copy_from_slice(&data);
                nv.public.attributes.0 |= TpmaNv::WRITTEN;
            }
            TpmCc::NvChangeAuth => {
                let auth = input.get_tpm2b().map_err(bad)?;
                self.nv.get_mut(&handles[0]).ok_or(RC_HANDLE)?.auth = auth;
            }
            TpmCc::HierarchyChangeAuth => {
                if handles[0] != tpm_rh::OWNER {
                    return Err(RC_HANDLE);
                }
                self.owner_auth = input.get_tpm2b().map_err(bad)?;
            }
            TpmCc::PolicyPassword | TpmCc::PolicyAuthValue => {
                let session = self.sessions.get_mut(&handles[0]).ok_or(RC_HANDLE)?;
                let password = cc == TpmCc::PolicyPassword.to_u32();
                session.policy_password = password;
                session.policy_auth_value = !password;
            }
            TpmCc::FlushContext => {
                let handle = input.get_u32().map_err(bad)?;
                self.sessions.remove(&handle).ok_or(RC_HANDLE)?;
            }
            _ => return Err(RC_COMMAND_CODE),
        }
        Ok((None, out.into_vec()))
    }
}

/// Context over `tpm` with in-memory state shared with the caller
pub fn tss(tpm: &SoftTpm) -> (Tss, Arc<MemorySessionStore>, Arc<MemoryNameCache>) {
    let sessions = Arc::new(MemorySessionStore::default());
    let names = Arc::new(MemoryNameCache::default());
    let tss = Tss::with_parts(
        Box::new(tpm.clone()),
        Arc::new(SoftwareCrypto),
        sessions.clone(),
        names.clone(),
    );
    (tss, sessions, names)
}

/// Password-authorized owner slot
pub fn owner(password: &str) -> SessionSlot {
    SessionSlot::password(Some(password))
}

/// Define an NV index with `auth` under an empty owner password
pub fn define_nv(tss: &mut Tss, index: u32, auth: &[u8], size: u16) -> TpmsNvPublic {
    let public = TpmsNvPublic {
        nv_index: index,
        name_alg: TpmAlgId::Sha256,
        attributes: TpmaNv(TpmaNv::AUTH_WRITE | TpmaNv::AUTH_READ | TpmaNv::NO_DA),
        auth_policy: Tpm2bDigest::empty(),
        data_size: size,
    };
    tss.nv_define_space(tpm_rh::OWNER, auth, &public, &[owner("")])
        .unwrap();
    public
}
