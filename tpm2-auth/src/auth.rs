// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command authorization and response verification
//!
//! Builds the TPMS_AUTH_COMMAND for each session slot and checks each
//! TPMS_AUTH_RESPONSE against the session that produced it.
//!
//! ```text
//! cpHash   = H(commandCode || Name0 || Name1 || Name2 || parameters)
//! hmac     = HMAC(hmacKey, cpHash || nonceCaller || nonceTPM
//!                          [|| decryptNonceTPM] [|| encryptNonceTPM] || attributes)
//! rpHash   = H(responseCode || commandCode || parameters)
//! response = HMAC(hmacKey, rpHash || nonceTPM || nonceCaller || attributes)
//! ```

use anyhow::Result;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::constants::*;
use crate::crypto::CryptoProvider;
use crate::encrypt::ParameterSessions;
use crate::error::TssError;
use crate::session::Session;
use crate::types::{TpmsAuthCommand, TpmsAuthResponse};

/// Command parameter hashes of one command, one per hash algorithm in use
pub struct CpHashes<'a> {
    code: u32,
    names: &'a [Vec<u8>],
    parameters: &'a [u8],
    computed: Vec<(TpmAlgId, Vec<u8>)>,
}

impl<'a> CpHashes<'a> {
    /// `parameters` are the marshaled parameters as sent, after encryption
    pub fn new(code: u32, names: &'a [Vec<u8>], parameters: &'a [u8]) -> Self {
        Self {
            code,
            names,
            parameters,
            computed: Vec::new(),
        }
    }

    pub fn get(&mut self, crypto: &dyn CryptoProvider, alg: TpmAlgId) -> Result<Vec<u8>> {
        if let Some((_, digest)) = self.computed.iter().find(|(a, _)| *a == alg) {
            return Ok(digest.clone());
        }
        let code = self.code.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&code[..]];
        parts.extend(self.names.iter().map(|n| n.as_slice()));
        parts.push(self.parameters);
        let digest = crypto.hash(alg, &parts)?;
        self.computed.push((alg, digest.clone()));
        Ok(digest)
    }
}

/// Response parameter hash; only successful responses are authenticated
pub fn rp_hash(
    crypto: &dyn CryptoProvider,
    alg: TpmAlgId,
    code: u32,
    parameters: &[u8],
) -> Result<Vec<u8>> {
    let rc = TpmRc::Success.to_u32().to_be_bytes();
    crypto.hash(alg, &[&rc, &code.to_be_bytes(), parameters])
}

/// nonceTPM values of the parameter encryption sessions, folded into the first
/// slot's HMAC when those sessions sit in other slots
///
/// Returns `(decrypt_nonce, encrypt_nonce)`, empty when not folded.
pub fn folded_nonces(
    slot: usize,
    selected: ParameterSessions,
    nonce_tpm: impl Fn(usize) -> Option<Vec<u8>>,
) -> (Vec<u8>, Vec<u8>) {
    if slot != 0 {
        return (Vec::new(), Vec::new());
    }
    let decrypt = match selected.decrypt {
        Some(d) if d != 0 => nonce_tpm(d).unwrap_or_default(),
        _ => Vec::new(),
    };
    // the same nonce is never folded twice
    let encrypt = match selected.encrypt {
        Some(e) if e != 0 && selected.decrypt != Some(e) => nonce_tpm(e).unwrap_or_default(),
        _ => Vec::new(),
    };
    (decrypt, encrypt)
}

/// HMAC over the command for one session
pub fn command_hmac(
    crypto: &dyn CryptoProvider,
    session: &Session,
    cp_hash: &[u8],
    decrypt_nonce: &[u8],
    encrypt_nonce: &[u8],
    attributes: TpmaSa,
) -> Result<Vec<u8>> {
    let hmac = crypto.hmac(
        session.hash_alg,
        &session.hmac_key,
        &[
            cp_hash,
            &session.nonce_caller,
            &session.nonce_tpm,
            decrypt_nonce,
            encrypt_nonce,
            &[attributes.0],
        ],
    )?;
    if hmac.len() != session.digest_size as usize {
        return Err(TssError::HmacSize {
            expected: session.digest_size as usize,
            actual: hmac.len(),
        }
        .into());
    }
    Ok(hmac)
}

/// Authorization block for an HMAC or policy session slot
///
/// After PolicyPassword the block carries the plaintext password. Sessions that
/// do not authenticate (trial, or policy without PolicyAuthValue) send an empty
/// HMAC.
pub fn session_auth(
    crypto: &dyn CryptoProvider,
    session: &Session,
    attributes: TpmaSa,
    cp_hash: Option<&[u8]>,
    folded: (&[u8], &[u8]),
    password: Option<&str>,
) -> Result<TpmsAuthCommand> {
    let hmac = if session.password_needed {
        debug!("session 0x{:08x}: policy password", session.handle);
        password.unwrap_or_default().as_bytes().to_vec()
    } else {
        match cp_hash {
            Some(cp_hash) if session.authenticates() => {
                command_hmac(crypto, session, cp_hash, folded.0, folded.1, attributes)?
            }
            _ => Vec::new(),
        }
    };
    Ok(TpmsAuthCommand {
        session_handle: session.handle,
        nonce: session.nonce_caller.clone(),
        attributes,
        hmac,
    })
}

/// The TPM echoes a password authorization with nothing but continueSession
pub fn verify_password_response(auth: &TpmsAuthResponse) -> Result<()> {
    if !auth.nonce.is_empty() {
        return Err(TssError::BadPwapNonce.into());
    }
    if auth.attributes.0 != TpmaSa::CONTINUE_SESSION {
        return Err(TssError::BadPwapAttributes(auth.attributes.0).into());
    }
    if !auth.hmac.is_empty() {
        return Err(TssError::BadPwapHmac.into());
    }
    Ok(())
}

/// Check the response HMAC of a session whose nonceTPM was already updated
pub fn verify_response(
    crypto: &dyn CryptoProvider,
    session: &Session,
    rp_hash: &[u8],
    auth: &TpmsAuthResponse,
) -> Result<()> {
    let expected_size = session.digest_size as usize;
    if auth.hmac.len() != expected_size {
        return Err(TssError::HmacSize {
            expected: expected_size,
            actual: auth.hmac.len(),
        }
        .into());
    }
    let expected = crypto.hmac(
        session.hash_alg,
        &session.hmac_key,
        &[
            rp_hash,
            &session.nonce_tpm,
            &session.nonce_caller,
            &[auth.attributes.0],
        ],
    )?;
    if !bool::from(expected.as_slice().ct_eq(auth.hmac.as_slice())) {
        return Err(TssError::HmacVerify(session.handle).into());
    }
    debug!("session 0x{:08x}: response hmac verified", session.handle);
    Ok(())
}
