// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session-based parameter encryption
//!
//! The first command parameter and the first response parameter can be protected
//! when they are size-prefixed. The client encrypts what the TPM "decrypts"
//! (the decrypt attribute) and decrypts what the TPM "encrypts".

use anyhow::Result;
use tracing::debug;
use zeroize::Zeroizing;

use crate::constants::*;
use crate::crypto::CryptoProvider;
use crate::error::TssError;
use crate::session::Session;

/// Which side of the exchange a parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller to TPM: nonceCaller is the newer nonce
    Command,
    /// TPM to caller: nonceTPM is the newer nonce
    Response,
}

/// Slots carrying the decrypt and encrypt attributes, at most one each
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSessions {
    pub decrypt: Option<usize>,
    pub encrypt: Option<usize>,
}

impl ParameterSessions {
    pub fn select(attributes: &[TpmaSa]) -> Result<Self> {
        let mut selected = Self::default();
        for (i, attr) in attributes.iter().enumerate() {
            if attr.decrypt() {
                if selected.decrypt.is_some() {
                    return Err(TssError::DecryptSessions.into());
                }
                selected.decrypt = Some(i);
            }
            if attr.encrypt() {
                if selected.encrypt.is_some() {
                    return Err(TssError::EncryptSessions.into());
                }
                selected.encrypt = Some(i);
            }
        }
        Ok(selected)
    }
}

/// Locate the payload of the leading TPM2B in `params`
pub fn first_parameter(params: &[u8]) -> Result<std::ops::Range<usize>> {
    if params.len() < 2 {
        return Err(TssError::BufferUnderflow {
            wanted: 2,
            remaining: params.len(),
        }
        .into());
    }
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    if size > params.len() - 2 {
        return Err(TssError::BufferUnderflow {
            wanted: size,
            remaining: params.len() - 2,
        }
        .into());
    }
    Ok(2..2 + size)
}

/// Encrypt or decrypt `data` in place with the session's parameter cipher
///
/// A zero-length parameter is left alone.
pub fn apply(
    crypto: &dyn CryptoProvider,
    session: &Session,
    direction: Direction,
    data: &mut [u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let (newer, older) = match direction {
        Direction::Command => (&session.nonce_caller, &session.nonce_tpm),
        Direction::Response => (&session.nonce_tpm, &session.nonce_caller),
    };
    match session.symmetric.algorithm {
        TpmAlgId::Xor => {
            let mask = Zeroizing::new(crypto.kdfa(
                session.hash_alg,
                &session.session_value,
                "XOR",
                newer,
                older,
                data.len() as u32 * 8,
            )?);
            if mask.len() != data.len() {
                return Err(TssError::KdfaFailed.into());
            }
            xor_in_place(data, &mask);
        }
        TpmAlgId::Aes => {
            let key_bytes = session.symmetric.key_bits as usize / 8;
            let block_bytes = AES_BLOCK_BITS as usize / 8;
            let material = Zeroizing::new(crypto.kdfa(
                session.hash_alg,
                &session.session_value,
                "CFB",
                newer,
                older,
                session.symmetric.key_bits as u32 + AES_BLOCK_BITS as u32,
            )?);
            if material.len() != key_bytes + block_bytes {
                return Err(TssError::KdfaFailed.into());
            }
            let (key, iv) = material.split_at(key_bytes);
            match direction {
                Direction::Command => crypto.cfb_encrypt(key, iv, data)?,
                Direction::Response => crypto.cfb_decrypt(key, iv, data)?,
            }
        }
        other => {
            return Err(match direction {
                Direction::Command => TssError::BadDecryptAlgorithm(other.to_u16()),
                Direction::Response => TssError::BadEncryptAlgorithm(other.to_u16()),
            }
            .into())
        }
    }
    debug!(
        "session 0x{:08x}: {:?} parameter transformed, {} bytes",
        session.handle,
        direction,
        data.len()
    );
    Ok(())
}

fn xor_in_place(data: &mut [u8], mask: &[u8]) {
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}
