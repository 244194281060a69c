// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants used by the session layer

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    NvUndefineSpaceSpecial = 0x0000011F,
    EvictControl = 0x00000120,
    HierarchyControl = 0x00000121,
    NvUndefineSpace = 0x00000122,
    ChangeEps = 0x00000124,
    ChangePps = 0x00000125,
    Clear = 0x00000126,
    ClearControl = 0x00000127,
    ClockSet = 0x00000128,
    HierarchyChangeAuth = 0x00000129,
    NvDefineSpace = 0x0000012A,
    PcrAllocate = 0x0000012B,
    PcrSetAuthPolicy = 0x0000012C,
    PpCommands = 0x0000012D,
    SetPrimaryPolicy = 0x0000012E,
    FieldUpgradeStart = 0x0000012F,
    ClockRateAdjust = 0x00000130,
    CreatePrimary = 0x00000131,
    NvGlobalWriteLock = 0x00000132,
    GetCommandAuditDigest = 0x00000133,
    NvIncrement = 0x00000134,
    NvSetBits = 0x00000135,
    NvExtend = 0x00000136,
    NvWrite = 0x00000137,
    NvWriteLock = 0x00000138,
    DictionaryAttackLockReset = 0x00000139,
    DictionaryAttackParameters = 0x0000013A,
    NvChangeAuth = 0x0000013B,
    PcrEvent = 0x0000013C,
    PcrReset = 0x0000013D,
    SequenceComplete = 0x0000013E,
    SetAlgorithmSet = 0x0000013F,
    SetCommandCodeAuditStatus = 0x00000140,
    FieldUpgradeData = 0x00000141,
    IncrementalSelfTest = 0x00000142,
    SelfTest = 0x00000143,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    StirRandom = 0x00000146,
    ActivateCredential = 0x00000147,
    Certify = 0x00000148,
    PolicyNv = 0x00000149,
    CertifyCreation = 0x0000014A,
    Duplicate = 0x0000014B,
    GetTime = 0x0000014C,
    GetSessionAuditDigest = 0x0000014D,
    NvRead = 0x0000014E,
    NvReadLock = 0x0000014F,
    ObjectChangeAuth = 0x00000150,
    PolicySecret = 0x00000151,
    Rewrap = 0x00000152,
    Create = 0x00000153,
    EcdhZGen = 0x00000154,
    Hmac = 0x00000155,
    Import = 0x00000156,
    Load = 0x00000157,
    Quote = 0x00000158,
    RsaDecrypt = 0x00000159,
    HmacStart = 0x0000015B,
    SequenceUpdate = 0x0000015C,
    Sign = 0x0000015D,
    Unseal = 0x0000015E,
    PolicySigned = 0x00000160,
    ContextLoad = 0x00000161,
    ContextSave = 0x00000162,
    EcdhKeyGen = 0x00000163,
    EncryptDecrypt = 0x00000164,
    FlushContext = 0x00000165,
    LoadExternal = 0x00000167,
    MakeCredential = 0x00000168,
    NvReadPublic = 0x00000169,
    PolicyAuthorize = 0x0000016A,
    PolicyAuthValue = 0x0000016B,
    PolicyCommandCode = 0x0000016C,
    PolicyCounterTimer = 0x0000016D,
    PolicyCpHash = 0x0000016E,
    PolicyLocality = 0x0000016F,
    PolicyNameHash = 0x00000170,
    PolicyOr = 0x00000171,
    PolicyTicket = 0x00000172,
    ReadPublic = 0x00000173,
    RsaEncrypt = 0x00000174,
    StartAuthSession = 0x00000176,
    VerifySignature = 0x00000177,
    EccParameters = 0x00000178,
    FirmwareRead = 0x00000179,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    GetTestResult = 0x0000017C,
    Hash = 0x0000017D,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PolicyRestart = 0x00000180,
    ReadClock = 0x00000181,
    PcrExtend = 0x00000182,
    PcrSetAuthValue = 0x00000183,
    NvCertify = 0x00000184,
    EventSequenceComplete = 0x00000185,
    HashSequenceStart = 0x00000186,
    PolicyPhysicalPresence = 0x00000187,
    PolicyDuplicationSelect = 0x00000188,
    PolicyGetDigest = 0x00000189,
    TestParms = 0x0000018A,
    Commit = 0x0000018B,
    PolicyPassword = 0x0000018C,
    ZGen2Phase = 0x0000018D,
    EcEphemeral = 0x0000018E,
    PolicyNvWritten = 0x0000018F,
    PolicyTemplate = 0x00000190,
    CreateLoaded = 0x00000191,
    PolicyAuthorizeNv = 0x00000192,
    EncryptDecrypt2 = 0x00000193,
    AcGetCapability = 0x00000194,
    AcSend = 0x00000195,
    PolicyAcSendSelect = 0x00000196,
    CertifyX509 = 0x00000197,
    ActSetTimeout = 0x00000198,
    EccEncrypt = 0x00000199,
    EccDecrypt = 0x0000019A,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        use TpmCc::*;
        const ALL: &[TpmCc] = &[
            NvUndefineSpaceSpecial,
            EvictControl,
            HierarchyControl,
            NvUndefineSpace,
            ChangeEps,
            ChangePps,
            Clear,
            ClearControl,
            ClockSet,
            HierarchyChangeAuth,
            NvDefineSpace,
            PcrAllocate,
            PcrSetAuthPolicy,
            PpCommands,
            SetPrimaryPolicy,
            FieldUpgradeStart,
            ClockRateAdjust,
            CreatePrimary,
            NvGlobalWriteLock,
            GetCommandAuditDigest,
            NvIncrement,
            NvSetBits,
            NvExtend,
            NvWrite,
            NvWriteLock,
            DictionaryAttackLockReset,
            DictionaryAttackParameters,
            NvChangeAuth,
            PcrEvent,
            PcrReset,
            SequenceComplete,
            SetAlgorithmSet,
            SetCommandCodeAuditStatus,
            FieldUpgradeData,
            IncrementalSelfTest,
            SelfTest,
            Startup,
            Shutdown,
            StirRandom,
            ActivateCredential,
            Certify,
            PolicyNv,
            CertifyCreation,
            Duplicate,
            GetTime,
            GetSessionAuditDigest,
            NvRead,
            NvReadLock,
            ObjectChangeAuth,
            PolicySecret,
            Rewrap,
            Create,
            EcdhZGen,
            Hmac,
            Import,
            Load,
            Quote,
            RsaDecrypt,
            HmacStart,
            SequenceUpdate,
            Sign,
            Unseal,
            PolicySigned,
            ContextLoad,
            ContextSave,
            EcdhKeyGen,
            EncryptDecrypt,
            FlushContext,
            LoadExternal,
            MakeCredential,
            NvReadPublic,
            PolicyAuthorize,
            PolicyAuthValue,
            PolicyCommandCode,
            PolicyCounterTimer,
            PolicyCpHash,
            PolicyLocality,
            PolicyNameHash,
            PolicyOr,
            PolicyTicket,
            ReadPublic,
            RsaEncrypt,
            StartAuthSession,
            VerifySignature,
            EccParameters,
            FirmwareRead,
            GetCapability,
            GetRandom,
            GetTestResult,
            Hash,
            PcrRead,
            PolicyPcr,
            PolicyRestart,
            ReadClock,
            PcrExtend,
            PcrSetAuthValue,
            NvCertify,
            EventSequenceComplete,
            HashSequenceStart,
            PolicyPhysicalPresence,
            PolicyDuplicationSelect,
            PolicyGetDigest,
            TestParms,
            Commit,
            PolicyPassword,
            ZGen2Phase,
            EcEphemeral,
            PolicyNvWritten,
            PolicyTemplate,
            CreateLoaded,
            PolicyAuthorizeNv,
            EncryptDecrypt2,
            AcGetCapability,
            AcSend,
            PolicyAcSendSelect,
            CertifyX509,
            ActSetTimeout,
            EccEncrypt,
            EccDecrypt,
        ];
        ALL.iter().copied().find(|cc| cc.to_u32() == v)
    }
}

/// TPM 2.0 Response Codes (TPM_RC) the session layer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x00000000,
    Failure = 0x00000101,
    Value = 0x00000184,
    Handle = 0x0000008B,
    AuthFail = 0x0000098E,
    PolicyFail = 0x0000099D,
    Size = 0x00000095,
}

impl TpmRc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID), the TCG algorithm registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Tdes = 0x0003,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    Mgf1 = 0x0007,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Sha256_192 = 0x000E,
    Null = 0x0010,
    Sm3_256 = 0x0012,
    Sm4 = 0x0013,
    RsaSsa = 0x0014,
    RsaEs = 0x0015,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    EcDsa = 0x0018,
    EcDh = 0x0019,
    EcDaa = 0x001A,
    Sm2 = 0x001B,
    EcSchnorr = 0x001C,
    EcMqv = 0x001D,
    Kdf1Sp800_56a = 0x0020,
    Kdf2 = 0x0021,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Camellia = 0x0026,
    Sha3_256 = 0x0027,
    Sha3_384 = 0x0028,
    Sha3_512 = 0x0029,
    Shake128 = 0x002A,
    Shake256 = 0x002B,
    Shake256_192 = 0x002C,
    Shake256_256 = 0x002D,
    Shake256_512 = 0x002E,
    Cmac = 0x003F,
    Ctr = 0x0040,
    Ofb = 0x0041,
    Cbc = 0x0042,
    Cfb = 0x0043,
    Ecb = 0x0044,
    Ccm = 0x0050,
    Gcm = 0x0051,
    KwA = 0x0052,
    Kwp = 0x0053,
    Eax = 0x0054,
    EdDsa = 0x0060,
    EdDsaPh = 0x0061,
    LmsHss = 0x0070,
    Xmss = 0x0071,
    KeyedXof = 0x0080,
    KmacXof128 = 0x0081,
    KmacXof256 = 0x0082,
    Kmac128 = 0x0090,
    Kmac256 = 0x0091,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0003 => Some(TpmAlgId::Tdes),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0006 => Some(TpmAlgId::Aes),
            0x0007 => Some(TpmAlgId::Mgf1),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x000A => Some(TpmAlgId::Xor),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x000E => Some(TpmAlgId::Sha256_192),
            0x0010 => Some(TpmAlgId::Null),
            0x0012 => Some(TpmAlgId::Sm3_256),
            0x0013 => Some(TpmAlgId::Sm4),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0015 => Some(TpmAlgId::RsaEs),
            0x0016 => Some(TpmAlgId::RsaPss),
            0x0017 => Some(TpmAlgId::Oaep),
            0x0018 => Some(TpmAlgId::EcDsa),
            0x0019 => Some(TpmAlgId::EcDh),
            0x001A => Some(TpmAlgId::EcDaa),
            0x001B => Some(TpmAlgId::Sm2),
            0x001C => Some(TpmAlgId::EcSchnorr),
            0x001D => Some(TpmAlgId::EcMqv),
            0x0020 => Some(TpmAlgId::Kdf1Sp800_56a),
            0x0021 => Some(TpmAlgId::Kdf2),
            0x0022 => Some(TpmAlgId::Kdf1Sp800_108),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0025 => Some(TpmAlgId::SymCipher),
            0x0026 => Some(TpmAlgId::Camellia),
            0x0027 => Some(TpmAlgId::Sha3_256),
            0x0028 => Some(TpmAlgId::Sha3_384),
            0x0029 => Some(TpmAlgId::Sha3_512),
            0x002A => Some(TpmAlgId::Shake128),
            0x002B => Some(TpmAlgId::Shake256),
            0x002C => Some(TpmAlgId::Shake256_192),
            0x002D => Some(TpmAlgId::Shake256_256),
            0x002E => Some(TpmAlgId::Shake256_512),
            0x003F => Some(TpmAlgId::Cmac),
            0x0040 => Some(TpmAlgId::Ctr),
            0x0041 => Some(TpmAlgId::Ofb),
            0x0042 => Some(TpmAlgId::Cbc),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0044 => Some(TpmAlgId::Ecb),
            0x0050 => Some(TpmAlgId::Ccm),
            0x0051 => Some(TpmAlgId::Gcm),
            0x0052 => Some(TpmAlgId::KwA),
            0x0053 => Some(TpmAlgId::Kwp),
            0x0054 => Some(TpmAlgId::Eax),
            0x0060 => Some(TpmAlgId::EdDsa),
            0x0061 => Some(TpmAlgId::EdDsaPh),
            0x0070 => Some(TpmAlgId::LmsHss),
            0x0071 => Some(TpmAlgId::Xmss),
            0x0080 => Some(TpmAlgId::KeyedXof),
            0x0081 => Some(TpmAlgId::KmacXof128),
            0x0082 => Some(TpmAlgId::KmacXof256),
            0x0090 => Some(TpmAlgId::Kmac128),
            0x0091 => Some(TpmAlgId::Kmac256),
            _ => None,
        }
    }

    /// Digest size in bytes, 0 for anything that is not a supported hash
    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    /// Handle type from the most significant octet of a handle
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // TPM_RS_PW
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Object Attributes, only the bits inspected for salt keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_DELETE: u32 = 1 << 10;
    pub const WRITE_LOCKED: u32 = 1 << 11;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const NO_DA: u32 = 1 << 25;
    pub const READ_LOCKED: u32 = 1 << 28;
    pub const WRITTEN: u32 = 1 << 29;
    pub const PLATFORM_CREATE: u32 = 1 << 30;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// TPM 2.0 Session Attributes (TPMA_SESSION)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn with_audit(mut self) -> Self {
        self.0 |= Self::AUDIT;
        self
    }

    pub fn continue_session(self) -> bool {
        self.0 & Self::CONTINUE_SESSION != 0
    }

    pub fn decrypt(self) -> bool {
        self.0 & Self::DECRYPT != 0
    }

    pub fn encrypt(self) -> bool {
        self.0 & Self::ENCRYPT != 0
    }

    pub fn audit(self) -> bool {
        self.0 & Self::AUDIT != 0
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

/// Largest digest carried by any supported hash algorithm
pub const MAX_DIGEST_SIZE: usize = 64;

/// Largest number of sessions attached to one command
pub const MAX_SESSION_NUM: usize = 3;

/// AES block size in bits, used for CFB parameter encryption
pub const AES_BLOCK_BITS: u16 = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_types() {
        assert_eq!(TpmHt::of(0x80000001), Some(TpmHt::Transient));
        assert_eq!(TpmHt::of(0x81000100), Some(TpmHt::Persistent));
        assert_eq!(TpmHt::of(0x01800001), Some(TpmHt::NvIndex));
        assert_eq!(TpmHt::of(tpm_rh::OWNER), Some(TpmHt::Permanent));
        assert_eq!(TpmHt::of(0x03000000), Some(TpmHt::PolicySession));
        assert_eq!(TpmHt::of(0x42000000), None);
    }

    #[test]
    fn test_command_code_lookup() {
        assert_eq!(TpmCc::from_u32(0x176), Some(TpmCc::StartAuthSession));
        assert_eq!(TpmCc::from_u32(0x18C), Some(TpmCc::PolicyPassword));
        assert_eq!(TpmCc::from_u32(0x1FF), None);
    }

    #[test]
    fn test_algorithm_registry() {
        for (raw, alg) in [
            (0x0005, TpmAlgId::Hmac),
            (0x0015, TpmAlgId::RsaEs),
            (0x0019, TpmAlgId::EcDh),
            (0x001A, TpmAlgId::EcDaa),
            (0x001C, TpmAlgId::EcSchnorr),
            (0x0012, TpmAlgId::Sm3_256),
            (0x0013, TpmAlgId::Sm4),
            (0x0027, TpmAlgId::Sha3_256),
            (0x0040, TpmAlgId::Ctr),
            (0x0042, TpmAlgId::Cbc),
            (0x0044, TpmAlgId::Ecb),
        ] {
            assert_eq!(TpmAlgId::from_u16(raw), Some(alg));
            assert_eq!(alg.to_u16(), raw);
        }
        assert_eq!(TpmAlgId::from_u16(0x0002), None);
        // only hashes the crypto provider implements have a digest size
        assert_eq!(TpmAlgId::Sha3_256.digest_size(), 0);
        assert!(TpmAlgId::Sha384.is_hash());
    }

    #[test]
    fn test_session_attribute_bits() {
        let attrs = TpmaSa::new().with_continue_session().with_decrypt();
        assert_eq!(attrs.0, 0x21);
        assert!(attrs.continue_session());
        assert!(attrs.decrypt());
        assert!(!attrs.encrypt());
    }
}
