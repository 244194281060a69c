// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error classification and result codes
//!
//! Failures travel as [`anyhow::Error`]. The ones callers need to tell apart carry a
//! [`TssError`] somewhere in their chain, which maps to a numeric result code: the
//! TPM's own response code, or a stack-internal code in the `0x000B_0000` layer.

use thiserror::Error;

/// Stack-internal result codes
pub mod rc {
    pub const LAYER: u32 = 0x000B_0000;

    pub const INSUFFICIENT_BUFFER: u32 = LAYER | 0x0004;
    pub const BAD_CONNECTION: u32 = LAYER | 0x0009;
    pub const MALFORMED_RESPONSE: u32 = LAYER | 0x000A;
    pub const NULL_PARAMETER: u32 = LAYER | 0x000B;
    pub const NOT_IMPLEMENTED: u32 = LAYER | 0x000C;
    pub const BAD_READ_VALUE: u32 = LAYER | 0x000D;
    pub const FILE_IO: u32 = LAYER | 0x0010;
    pub const RNG_FAILURE: u32 = LAYER | 0x0020;
    pub const BAD_PWAP_NONCE: u32 = LAYER | 0x0030;
    pub const BAD_PWAP_ATTRIBUTES: u32 = LAYER | 0x0031;
    pub const BAD_PWAP_HMAC: u32 = LAYER | 0x0032;
    pub const NAME_NOT_IMPLEMENTED: u32 = LAYER | 0x0033;
    pub const MALFORMED_NV_PUBLIC: u32 = LAYER | 0x0034;
    pub const NAME_NOT_FOUND: u32 = LAYER | 0x0035;
    pub const MALFORMED_PUBLIC: u32 = LAYER | 0x0036;
    pub const DECRYPT_SESSIONS: u32 = LAYER | 0x0037;
    pub const ENCRYPT_SESSIONS: u32 = LAYER | 0x0038;
    pub const NO_DECRYPT_PARAMETER: u32 = LAYER | 0x0039;
    pub const NO_ENCRYPT_PARAMETER: u32 = LAYER | 0x003A;
    pub const BAD_DECRYPT_ALGORITHM: u32 = LAYER | 0x003B;
    pub const BAD_ENCRYPT_ALGORITHM: u32 = LAYER | 0x003C;
    pub const AES_ENCRYPT_FAILURE: u32 = LAYER | 0x003D;
    pub const AES_DECRYPT_FAILURE: u32 = LAYER | 0x003E;
    pub const BAD_SALT_KEY: u32 = LAYER | 0x0042;
    pub const RSA_ENCRYPT: u32 = LAYER | 0x0043;
    pub const BAD_HASH_ALGORITHM: u32 = LAYER | 0x0050;
    pub const HMAC_SIZE: u32 = LAYER | 0x0051;
    pub const HMAC_VERIFY: u32 = LAYER | 0x0052;
    pub const KDFA_FAILED: u32 = LAYER | 0x0053;
    pub const BAD_PARAMETER: u32 = LAYER | 0x0060;
    pub const SESSION_NOT_FOUND: u32 = LAYER | 0x0061;
    pub const MALFORMED_SESSION: u32 = LAYER | 0x0062;
    pub const TOO_MANY_SESSIONS: u32 = LAYER | 0x0063;
    pub const BAD_CONFIG: u32 = LAYER | 0x0064;
}

/// Classified session-layer failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TssError {
    #[error("TPM returned error 0x{0:08x}")]
    Tpm(u32),
    #[error("buffer underflow: wanted {wanted} bytes, {remaining} remaining")]
    BufferUnderflow { wanted: usize, remaining: usize },
    #[error("TPM2B size {size} exceeds maximum {max}")]
    BufferOverflow { size: usize, max: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("password session response nonce is not empty")]
    BadPwapNonce,
    #[error("password session response attributes 0x{0:02x} are not continueSession")]
    BadPwapAttributes(u8),
    #[error("password session response hmac is not empty")]
    BadPwapHmac,
    #[error("response hmac size {actual}, expected {expected}")]
    HmacSize { expected: usize, actual: usize },
    #[error("response hmac verification failed for session 0x{0:08x}")]
    HmacVerify(u32),
    #[error("KDFa produced no output")]
    KdfaFailed,
    #[error("more than one session requests command parameter decryption")]
    DecryptSessions,
    #[error("more than one session requests response parameter encryption")]
    EncryptSessions,
    #[error("command 0x{0:08x} has no size-prefixed first parameter to decrypt")]
    NoDecryptParameter(u32),
    #[error("command 0x{0:08x} has no size-prefixed first response parameter to encrypt")]
    NoEncryptParameter(u32),
    #[error("unsupported session symmetric algorithm 0x{0:04x} for decrypt")]
    BadDecryptAlgorithm(u16),
    #[error("unsupported session symmetric algorithm 0x{0:04x} for encrypt")]
    BadEncryptAlgorithm(u16),
    #[error("AES encryption failed")]
    AesEncrypt,
    #[error("AES decryption failed")]
    AesDecrypt,
    #[error("salt key is not a supported RSA-2048 decryption key")]
    BadSaltKey,
    #[error("RSA OAEP encryption failed")]
    RsaEncrypt,
    #[error("unsupported hash algorithm 0x{0:04x}")]
    BadHashAlgorithm(u16),
    #[error("NV public area does not match its Name")]
    MalformedNvPublic,
    #[error("malformed public area")]
    MalformedPublic,
    #[error("Name not implemented for handle 0x{0:08x}")]
    NameNotImplemented(u32),
    #[error("no Name cached for handle 0x{0:08x}")]
    NameNotFound(u32),
    #[error("required parameter missing: {0}")]
    NullParameter(&'static str),
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("session 0x{0:08x} not found")]
    SessionNotFound(u32),
    #[error("malformed session record for 0x{0:08x}")]
    MalformedSession(u32),
    #[error("at most {max} sessions per command, got {got}")]
    TooManySessions { max: usize, got: usize },
    #[error("random number generation failed")]
    RngFailure,
    #[error("bad configuration value for {0}")]
    BadConfig(&'static str),
}

impl TssError {
    /// Numeric result code for this failure
    pub fn rc(&self) -> u32 {
        use TssError::*;
        match self {
            Tpm(code) => *code,
            BufferUnderflow { .. } | BufferOverflow { .. } | TrailingBytes(_) => {
                rc::INSUFFICIENT_BUFFER
            }
            MalformedResponse(_) => rc::MALFORMED_RESPONSE,
            Transport(_) => rc::BAD_CONNECTION,
            BadPwapNonce => rc::BAD_PWAP_NONCE,
            BadPwapAttributes(_) => rc::BAD_PWAP_ATTRIBUTES,
            BadPwapHmac => rc::BAD_PWAP_HMAC,
            HmacSize { .. } => rc::HMAC_SIZE,
            HmacVerify(_) => rc::HMAC_VERIFY,
            KdfaFailed => rc::KDFA_FAILED,
            DecryptSessions => rc::DECRYPT_SESSIONS,
            EncryptSessions => rc::ENCRYPT_SESSIONS,
            NoDecryptParameter(_) => rc::NO_DECRYPT_PARAMETER,
            NoEncryptParameter(_) => rc::NO_ENCRYPT_PARAMETER,
            BadDecryptAlgorithm(_) => rc::BAD_DECRYPT_ALGORITHM,
            BadEncryptAlgorithm(_) => rc::BAD_ENCRYPT_ALGORITHM,
            AesEncrypt => rc::AES_ENCRYPT_FAILURE,
            AesDecrypt => rc::AES_DECRYPT_FAILURE,
            BadSaltKey => rc::BAD_SALT_KEY,
            RsaEncrypt => rc::RSA_ENCRYPT,
            BadHashAlgorithm(_) => rc::BAD_HASH_ALGORITHM,
            MalformedNvPublic => rc::MALFORMED_NV_PUBLIC,
            MalformedPublic => rc::MALFORMED_PUBLIC,
            NameNotImplemented(_) => rc::NAME_NOT_IMPLEMENTED,
            NameNotFound(_) => rc::NAME_NOT_FOUND,
            NullParameter(_) => rc::NULL_PARAMETER,
            BadParameter(_) => rc::BAD_PARAMETER,
            SessionNotFound(_) => rc::SESSION_NOT_FOUND,
            MalformedSession(_) => rc::MALFORMED_SESSION,
            TooManySessions { .. } => rc::TOO_MANY_SESSIONS,
            RngFailure => rc::RNG_FAILURE,
            BadConfig(_) => rc::BAD_CONFIG,
        }
    }

    /// Authentication failures: the response must not be trusted
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            TssError::BadPwapNonce
                | TssError::BadPwapAttributes(_)
                | TssError::BadPwapHmac
                | TssError::HmacSize { .. }
                | TssError::HmacVerify(_)
                | TssError::KdfaFailed
        )
    }
}

/// Find the classified failure in an error chain
pub fn classify(err: &anyhow::Error) -> Option<&TssError> {
    err.downcast_ref::<TssError>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref::<TssError>()))
}

/// Result code of a failed call
///
/// Unclassified failures (I/O, serialization) report [`rc::FILE_IO`] when an
/// `std::io::Error` is in the chain and [`rc::NOT_IMPLEMENTED`] otherwise.
pub fn result_code(err: &anyhow::Error) -> u32 {
    if let Some(e) = classify(err) {
        return e.rc();
    }
    if err
        .chain()
        .any(|e| e.downcast_ref::<std::io::Error>().is_some())
    {
        return rc::FILE_IO;
    }
    rc::NOT_IMPLEMENTED
}
