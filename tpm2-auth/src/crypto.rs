// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives consumed by the session layer
//!
//! [`CryptoProvider`] is the seam: the session engine only ever calls through it.
//! [`SoftwareCrypto`] is the default implementation on top of the RustCrypto crates.

use aes::{Aes128, Aes192, Aes256};
use anyhow::Result;
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::constants::TpmAlgId;
use crate::error::TssError;

/// Primitive crypto engine, free of session state
pub trait CryptoProvider: Send + Sync {
    /// Hash the concatenation of `data`
    fn hash(&self, alg: TpmAlgId, data: &[&[u8]]) -> Result<Vec<u8>>;

    /// HMAC over the concatenation of `data`
    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>>;

    /// AES-CFB encryption, key size taken from `key`
    fn cfb_encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()>;

    /// AES-CFB decryption, key size taken from `key`
    fn cfb_decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()>;

    /// RSA-OAEP encryption to a public modulus, OAEP hash `hash_alg`
    fn rsa_oaep_encrypt(
        &self,
        modulus: &[u8],
        exponent: u32,
        label: &str,
        hash_alg: TpmAlgId,
        data: &[u8],
    ) -> Result<Vec<u8>>;

    fn random(&self, len: usize) -> Result<Vec<u8>>;

    /// SP800-108 counter-mode KDF with HMAC, as TPM2 KDFa
    ///
    /// `label` is hashed with its terminating NUL. Output is `bits` long, with the
    /// excess high bits of the first byte cleared when `bits` is not a whole byte.
    fn kdfa(
        &self,
        alg: TpmAlgId,
        key: &[u8],
        label: &str,
        context_u: &[u8],
        context_v: &[u8],
        bits: u32,
    ) -> Result<Vec<u8>> {
        let digest_size = alg.digest_size();
        if digest_size == 0 {
            return Err(TssError::BadHashAlgorithm(alg.to_u16()).into());
        }
        let bytes = bits.div_ceil(8) as usize;
        let mut label_z = label.as_bytes().to_vec();
        if label_z.last() != Some(&0) {
            label_z.push(0);
        }
        let bits_be = bits.to_be_bytes();

        let mut out = Vec::with_capacity(bytes + digest_size);
        let mut counter: u32 = 0;
        while out.len() < bytes {
            counter += 1;
            let block = self.hmac(
                alg,
                key,
                &[
                    &counter.to_be_bytes(),
                    &label_z,
                    context_u,
                    context_v,
                    &bits_be,
                ],
            )?;
            out.extend_from_slice(&block);
        }
        out.truncate(bytes);
        if bits % 8 != 0 {
            if let Some(first) = out.first_mut() {
                *first &= (1u8 << (bits % 8)) - 1;
            }
        }
        Ok(out)
    }
}

/// Crypto provider backed by the RustCrypto crates and the thread RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

macro_rules! with_hash {
    ($alg:expr, $ty:ident => $body:expr) => {
        match $alg {
            TpmAlgId::Sha1 => {
                type $ty = Sha1;
                $body
            }
            TpmAlgId::Sha256 => {
                type $ty = Sha256;
                $body
            }
            TpmAlgId::Sha384 => {
                type $ty = Sha384;
                $body
            }
            TpmAlgId::Sha512 => {
                type $ty = Sha512;
                $body
            }
            other => Err(TssError::BadHashAlgorithm(other.to_u16()).into()),
        }
    };
}

impl CryptoProvider for SoftwareCrypto {
    fn hash(&self, alg: TpmAlgId, data: &[&[u8]]) -> Result<Vec<u8>> {
        with_hash!(alg, H => {
            let mut hasher = <H as Digest>::new();
            for d in data {
                Digest::update(&mut hasher, d);
            }
            Ok(hasher.finalize().to_vec())
        })
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], data: &[&[u8]]) -> Result<Vec<u8>> {
        with_hash!(alg, H => {
            let mut mac = <Hmac<H> as Mac>::new_from_slice(key)
                .map_err(|_| TssError::BadParameter("hmac key".into()))?;
            for d in data {
                mac.update(d);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        })
    }

    fn cfb_encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        let bad = |_| TssError::AesEncrypt;
        match key.len() {
            16 => Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad)?
                .encrypt(data),
            24 => Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad)?
                .encrypt(data),
            32 => Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad)?
                .encrypt(data),
            _ => return Err(TssError::AesEncrypt.into()),
        }
        Ok(())
    }

    fn cfb_decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        let bad = |_| TssError::AesDecrypt;
        match key.len() {
            16 => Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad)?
                .decrypt(data),
            24 => Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad)?
                .decrypt(data),
            32 => Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad)?
                .decrypt(data),
            _ => return Err(TssError::AesDecrypt.into()),
        }
        Ok(())
    }

    fn rsa_oaep_encrypt(
        &self,
        modulus: &[u8],
        exponent: u32,
        label: &str,
        hash_alg: TpmAlgId,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from(exponent),
        )
        .map_err(|_| TssError::BadSaltKey)?;
        let mut rng = rand::thread_rng();
        let encrypted = match hash_alg {
            TpmAlgId::Sha1 => key.encrypt(&mut rng, Oaep::new_with_label::<Sha1, _>(label), data),
            TpmAlgId::Sha256 => {
                key.encrypt(&mut rng, Oaep::new_with_label::<Sha256, _>(label), data)
            }
            TpmAlgId::Sha384 => {
                key.encrypt(&mut rng, Oaep::new_with_label::<Sha384, _>(label), data)
            }
            TpmAlgId::Sha512 => {
                key.encrypt(&mut rng, Oaep::new_with_label::<Sha512, _>(label), data)
            }
            other => return Err(TssError::BadHashAlgorithm(other.to_u16()).into()),
        };
        Ok(encrypted.map_err(|_| TssError::RsaEncrypt)?)
    }

    fn random(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        rand::thread_rng()
            .try_fill_bytes(&mut out)
            .map_err(|_| TssError::RngFailure)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_concatenates_inputs() {
        let c = SoftwareCrypto;
        let split = c.hash(TpmAlgId::Sha256, &[b"ab", b"c"]).unwrap();
        let whole = c.hash(TpmAlgId::Sha256, &[b"abc"]).unwrap();
        assert_eq!(split, whole);
        assert_eq!(
            hex::encode(whole),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let c = SoftwareCrypto;
        let mac = c
            .hmac(TpmAlgId::Sha256, b"Jefe", &[b"what do ya want ", b"for nothing?"])
            .unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_kdfa_length_and_determinism() {
        let c = SoftwareCrypto;
        let a = c
            .kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 256)
            .unwrap();
        let b = c
            .kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 256)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        // First block is HMAC(key, 1 || "ATH\0" || u || v || 256)
        let first = c
            .hmac(
                TpmAlgId::Sha256,
                b"key",
                &[&1u32.to_be_bytes(), b"ATH\0", b"u", b"v", &256u32.to_be_bytes()],
            )
            .unwrap();
        assert_eq!(a, first);

        let long = c
            .kdfa(TpmAlgId::Sha1, b"key", "CFB", b"u", b"v", 256)
            .unwrap();
        assert_eq!(long.len(), 32);
    }

    #[test]
    fn test_kdfa_masks_partial_byte() {
        let c = SoftwareCrypto;
        let out = c
            .kdfa(TpmAlgId::Sha256, b"key", "XOR", b"", b"", 12)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0] & 0xf0, 0);
    }

    #[test]
    fn test_kdfa_rejects_non_hash() {
        let c = SoftwareCrypto;
        assert!(c.kdfa(TpmAlgId::Aes, b"k", "ATH", b"", b"", 128).is_err());
    }

    #[test]
    fn test_cfb_round_trip_lengths() {
        let c = SoftwareCrypto;
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        for len in [0usize, 1, 15, 16, 17, 4096] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut data = plain.clone();
            c.cfb_encrypt(&key, &iv, &mut data).unwrap();
            if len > 0 {
                assert_ne!(data, plain);
            }
            c.cfb_decrypt(&key, &iv, &mut data).unwrap();
            assert_eq!(data, plain, "length {len}");
        }
    }

    #[test]
    fn test_cfb_key_sizes() {
        let c = SoftwareCrypto;
        for key_len in [16usize, 24, 32] {
            let key = vec![7u8; key_len];
            let mut data = b"parameter".to_vec();
            c.cfb_encrypt(&key, &[0u8; 16], &mut data).unwrap();
            c.cfb_decrypt(&key, &[0u8; 16], &mut data).unwrap();
            assert_eq!(data, b"parameter");
        }
        let mut data = vec![0u8; 4];
        assert!(c.cfb_encrypt(&[0u8; 5], &[0u8; 16], &mut data).is_err());
    }

    #[test]
    fn test_random_lengths() {
        let c = SoftwareCrypto;
        assert_eq!(c.random(0).unwrap().len(), 0);
        assert_eq!(c.random(48).unwrap().len(), 48);
    }
}
