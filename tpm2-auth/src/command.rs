// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command attributes and wire framing

use anyhow::Result;

use crate::constants::*;
use crate::error::TssError;
use crate::marshal::*;
use crate::types::{TpmsAuthCommand, TpmsAuthResponse};

/// Shape of a command as the session layer needs to know it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub code: u32,
    /// Handles in the handle area
    pub handles: usize,
    /// The leading handles that require authorization
    pub auth_handles: usize,
    /// The response starts with a handle
    pub response_handle: bool,
    /// The first command parameter is a TPM2B
    pub decrypt_first_param: bool,
    /// The first response parameter is a TPM2B
    pub encrypt_first_param: bool,
}

const fn spec(
    cc: TpmCc,
    handles: usize,
    auth_handles: usize,
    response_handle: bool,
    decrypt_first_param: bool,
    encrypt_first_param: bool,
) -> CommandSpec {
    CommandSpec {
        code: cc as u32,
        handles,
        auth_handles,
        response_handle,
        decrypt_first_param,
        encrypt_first_param,
    }
}

#[rustfmt::skip]
const COMMANDS: &[CommandSpec] = &[
    //   command                               hdl auth  rsp    dec    enc
    spec(TpmCc::NvUndefineSpaceSpecial,         2,  2, false, false, false),
    spec(TpmCc::EvictControl,                   2,  1, false, false, false),
    spec(TpmCc::HierarchyControl,               1,  1, false, false, false),
    spec(TpmCc::NvUndefineSpace,                2,  1, false, false, false),
    spec(TpmCc::ChangeEps,                      1,  1, false, false, false),
    spec(TpmCc::ChangePps,                      1,  1, false, false, false),
    spec(TpmCc::Clear,                          1,  1, false, false, false),
    spec(TpmCc::ClearControl,                   1,  1, false, false, false),
    spec(TpmCc::ClockSet,                       1,  1, false, false, false),
    spec(TpmCc::HierarchyChangeAuth,            1,  1, false, true,  false),
    spec(TpmCc::NvDefineSpace,                  1,  1, false, true,  false),
    spec(TpmCc::PcrAllocate,                    1,  1, false, false, false),
    spec(TpmCc::PcrSetAuthPolicy,               1,  1, false, true,  false),
    spec(TpmCc::PpCommands,                     1,  1, false, false, false),
    spec(TpmCc::SetPrimaryPolicy,               1,  1, false, true,  false),
    spec(TpmCc::FieldUpgradeStart,              2,  1, false, true,  false),
    spec(TpmCc::ClockRateAdjust,                1,  1, false, false, false),
    spec(TpmCc::CreatePrimary,                  1,  1, true,  true,  true),
    spec(TpmCc::NvGlobalWriteLock,              1,  1, false, false, false),
    spec(TpmCc::GetCommandAuditDigest,          2,  2, false, true,  true),
    spec(TpmCc::NvIncrement,                    2,  1, false, false, false),
    spec(TpmCc::NvSetBits,                      2,  1, false, false, false),
    spec(TpmCc::NvExtend,                       2,  1, false, true,  false),
    spec(TpmCc::NvWrite,                        2,  1, false, true,  false),
    spec(TpmCc::NvWriteLock,                    2,  1, false, false, false),
    spec(TpmCc::DictionaryAttackLockReset,      1,  1, false, false, false),
    spec(TpmCc::DictionaryAttackParameters,     1,  1, false, false, false),
    spec(TpmCc::NvChangeAuth,                   1,  1, false, true,  false),
    spec(TpmCc::PcrEvent,                       1,  1, false, true,  false),
    spec(TpmCc::PcrReset,                       1,  1, false, false, false),
    spec(TpmCc::SequenceComplete,               1,  1, false, true,  true),
    spec(TpmCc::SetAlgorithmSet,                1,  1, false, false, false),
    spec(TpmCc::SetCommandCodeAuditStatus,      1,  1, false, false, false),
    spec(TpmCc::FieldUpgradeData,               0,  0, false, true,  false),
    spec(TpmCc::IncrementalSelfTest,            0,  0, false, false, false),
    spec(TpmCc::SelfTest,                       0,  0, false, false, false),
    spec(TpmCc::Startup,                        0,  0, false, false, false),
    spec(TpmCc::Shutdown,                       0,  0, false, false, false),
    spec(TpmCc::StirRandom,                     0,  0, false, true,  false),
    spec(TpmCc::ActivateCredential,             2,  2, false, true,  true),
    spec(TpmCc::Certify,                        2,  2, false, true,  true),
    spec(TpmCc::PolicyNv,                       3,  1, false, true,  false),
    spec(TpmCc::CertifyCreation,                2,  1, false, true,  true),
    spec(TpmCc::Duplicate,                      2,  1, false, true,  true),
    spec(TpmCc::GetTime,                        2,  2, false, true,  true),
    spec(TpmCc::GetSessionAuditDigest,          3,  2, false, true,  true),
    spec(TpmCc::NvRead,                         2,  1, false, false, true),
    spec(TpmCc::NvReadLock,                     2,  1, false, false, false),
    spec(TpmCc::ObjectChangeAuth,               2,  1, false, true,  true),
    spec(TpmCc::PolicySecret,                   2,  1, false, true,  true),
    spec(TpmCc::Rewrap,                         2,  1, false, true,  true),
    spec(TpmCc::Create,                         1,  1, false, true,  true),
    spec(TpmCc::EcdhZGen,                       1,  1, false, true,  true),
    spec(TpmCc::Hmac,                           1,  1, false, true,  true),
    spec(TpmCc::Import,                         1,  1, false, true,  true),
    spec(TpmCc::Load,                           1,  1, true,  true,  true),
    spec(TpmCc::Quote,                          1,  1, false, true,  true),
    spec(TpmCc::RsaDecrypt,                     1,  1, false, true,  true),
    spec(TpmCc::HmacStart,                      1,  1, true,  true,  false),
    spec(TpmCc::SequenceUpdate,                 1,  1, false, true,  false),
    spec(TpmCc::Sign,                           1,  1, false, true,  false),
    spec(TpmCc::Unseal,                         1,  1, false, false, true),
    spec(TpmCc::PolicySigned,                   2,  0, false, true,  true),
    spec(TpmCc::ContextLoad,                    0,  0, true,  false, false),
    spec(TpmCc::ContextSave,                    1,  0, false, false, false),
    spec(TpmCc::EcdhKeyGen,                     1,  0, false, false, true),
    spec(TpmCc::EncryptDecrypt,                 1,  1, false, false, true),
    spec(TpmCc::FlushContext,                   0,  0, false, false, false),
    spec(TpmCc::LoadExternal,                   0,  0, true,  true,  true),
    spec(TpmCc::MakeCredential,                 1,  0, false, true,  true),
    spec(TpmCc::NvReadPublic,                   1,  0, false, false, true),
    spec(TpmCc::PolicyAuthorize,                1,  0, false, true,  false),
    spec(TpmCc::PolicyAuthValue,                1,  0, false, false, false),
    spec(TpmCc::PolicyCommandCode,              1,  0, false, false, false),
    spec(TpmCc::PolicyCounterTimer,             1,  0, false, true,  false),
    spec(TpmCc::PolicyCpHash,                   1,  0, false, true,  false),
    spec(TpmCc::PolicyLocality,                 1,  0, false, false, false),
    spec(TpmCc::PolicyNameHash,                 1,  0, false, true,  false),
    spec(TpmCc::PolicyOr,                       1,  0, false, false, false),
    spec(TpmCc::PolicyTicket,                   1,  0, false, true,  false),
    spec(TpmCc::ReadPublic,                     1,  0, false, false, true),
    spec(TpmCc::RsaEncrypt,                     1,  0, false, true,  true),
    spec(TpmCc::StartAuthSession,               2,  0, true,  true,  true),
    spec(TpmCc::VerifySignature,                1,  0, false, true,  false),
    spec(TpmCc::EccParameters,                  0,  0, false, false, false),
    spec(TpmCc::FirmwareRead,                   0,  0, false, false, true),
    spec(TpmCc::GetCapability,                  0,  0, false, false, false),
    spec(TpmCc::GetRandom,                      0,  0, false, false, true),
    spec(TpmCc::GetTestResult,                  0,  0, false, false, true),
    spec(TpmCc::Hash,                           0,  0, false, true,  true),
    spec(TpmCc::PcrRead,                        0,  0, false, false, false),
    spec(TpmCc::PolicyPcr,                      1,  0, false, true,  false),
    spec(TpmCc::PolicyRestart,                  1,  0, false, false, false),
    spec(TpmCc::ReadClock,                      0,  0, false, false, false),
    spec(TpmCc::PcrExtend,                      1,  1, false, false, false),
    spec(TpmCc::PcrSetAuthValue,                1,  1, false, true,  false),
    spec(TpmCc::NvCertify,                      3,  2, false, true,  true),
    spec(TpmCc::EventSequenceComplete,          2,  2, false, true,  false),
    spec(TpmCc::HashSequenceStart,              0,  0, true,  true,  false),
    spec(TpmCc::PolicyPhysicalPresence,         1,  0, false, false, false),
    spec(TpmCc::PolicyDuplicationSelect,        1,  0, false, true,  false),
    spec(TpmCc::PolicyGetDigest,                1,  0, false, false, true),
    spec(TpmCc::TestParms,                      0,  0, false, false, false),
    spec(TpmCc::Commit,                         1,  1, false, true,  true),
    spec(TpmCc::PolicyPassword,                 1,  0, false, false, false),
    spec(TpmCc::ZGen2Phase,                     1,  1, false, true,  true),
    spec(TpmCc::EcEphemeral,                    0,  0, false, false, true),
    spec(TpmCc::PolicyNvWritten,                1,  0, false, false, false),
    spec(TpmCc::PolicyTemplate,                 1,  0, false, true,  false),
    spec(TpmCc::CreateLoaded,                   1,  1, true,  true,  true),
    spec(TpmCc::PolicyAuthorizeNv,              3,  1, false, false, false),
    spec(TpmCc::EncryptDecrypt2,                1,  1, false, true,  true),
    spec(TpmCc::AcGetCapability,                1,  0, false, false, false),
    spec(TpmCc::AcSend,                         3,  2, false, true,  false),
    spec(TpmCc::PolicyAcSendSelect,             1,  0, false, true,  false),
    spec(TpmCc::CertifyX509,                    2,  2, false, true,  true),
    spec(TpmCc::ActSetTimeout,                  1,  1, false, false, false),
    spec(TpmCc::EccEncrypt,                     1,  0, false, true,  true),
    spec(TpmCc::EccDecrypt,                     1,  1, false, true,  true),
];

impl CommandSpec {
    pub fn lookup(code: u32) -> Option<Self> {
        COMMANDS.iter().find(|c| c.code == code).copied()
    }

    /// Whether the session in slot `index` authorizes a handle
    pub fn has_auth_role(&self, index: usize) -> bool {
        index < self.auth_handles
    }
}

/// Wire command builder
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    pub fn new(code: u32, with_sessions: bool) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        let tag = if with_sessions {
            TpmSt::Sessions
        } else {
            TpmSt::NoSessions
        };
        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(code);
        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Authorization area: size followed by the TPMS_AUTH_COMMAND list
    pub fn add_auth_area(&mut self, auths: &[TpmsAuthCommand]) {
        let mut area = CommandBuffer::new();
        for auth in auths {
            auth.marshal(&mut area);
        }
        self.buf.put_u32(area.len() as u32);
        self.buf.put_bytes(area.as_bytes());
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// Frame a complete command
pub fn frame_command(code: u32, handles: &[u32], auths: &[TpmsAuthCommand], params: &[u8]) -> Vec<u8> {
    let mut cmd = TpmCommand::new(code, !auths.is_empty());
    for h in handles {
        cmd.add_handle(*h);
    }
    if !auths.is_empty() {
        cmd.add_auth_area(auths);
    }
    cmd.add_bytes(params);
    cmd.finalize()
}

/// Parsed TPM response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmResponse {
    pub response_code: u32,
    pub handle: Option<u32>,
    pub parameters: Vec<u8>,
    pub auths: Vec<TpmsAuthResponse>,
}

impl TpmResponse {
    /// Parse a response to a command shaped like `spec` that carried `sessions`
    /// authorizations
    ///
    /// Error responses carry only the header.
    pub fn parse(bytes: &[u8], spec: &CommandSpec, sessions: usize) -> Result<Self> {
        let malformed = |what: &str| TssError::MalformedResponse(what.to_string());
        let mut buf = ResponseBuffer::new(bytes);
        let tag = TpmSt::from_u16(buf.get_u16()?).ok_or_else(|| malformed("bad tag"))?;
        let size = buf.get_u32()? as usize;
        if size != bytes.len() {
            return Err(TssError::MalformedResponse(format!(
                "size field {size}, received {} bytes",
                bytes.len()
            ))
            .into());
        }
        let response_code = buf.get_u32()?;
        if response_code != TpmRc::Success.to_u32() {
            return Ok(Self {
                response_code,
                ..Default::default()
            });
        }

        let handle = match spec.response_handle {
            true => Some(buf.get_u32()?),
            false => None,
        };
        let (parameters, auths) = match tag {
            TpmSt::Sessions => {
                let param_size = buf.get_u32()? as usize;
                let parameters = buf.get_bytes(param_size)?;
                let mut auths = Vec::with_capacity(sessions);
                for _ in 0..sessions {
                    auths.push(TpmsAuthResponse::unmarshal(&mut buf)?);
                }
                if !buf.is_empty() {
                    return Err(malformed("trailing bytes after authorization area").into());
                }
                (parameters, auths)
            }
            TpmSt::NoSessions if sessions == 0 => (buf.rest().to_vec(), Vec::new()),
            _ => return Err(malformed("missing authorization area").into()),
        };
        Ok(Self {
            response_code,
            handle,
            parameters,
            auths,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == TpmRc::Success.to_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let nv_write = CommandSpec::lookup(TpmCc::NvWrite.to_u32()).unwrap();
        assert_eq!(nv_write.handles, 2);
        assert!(nv_write.has_auth_role(0));
        assert!(!nv_write.has_auth_role(1));
        assert!(nv_write.decrypt_first_param);
        assert!(CommandSpec::lookup(0x1234).is_none());
    }

    #[test]
    fn test_table_is_consistent() {
        for spec in COMMANDS {
            assert!(TpmCc::from_u32(spec.code).is_some());
            assert!(spec.auth_handles <= spec.handles);
            assert_eq!(COMMANDS.iter().filter(|c| c.code == spec.code).count(), 1);
        }
    }

    #[test]
    fn test_full_command_set() {
        for code in 0x11f..=0x19a {
            if let Some(cc) = TpmCc::from_u32(code) {
                assert!(CommandSpec::lookup(cc.to_u32()).is_some(), "{cc:?}");
            }
        }
        // 0x11f..=0x19a minus the codes TPM 2.0 leaves unassigned
        assert_eq!(COMMANDS.len(), 0x19a - 0x11f + 1 - 5);

        let certify = CommandSpec::lookup(TpmCc::NvCertify.to_u32()).unwrap();
        assert_eq!((certify.handles, certify.auth_handles), (3, 2));
        let loaded = CommandSpec::lookup(TpmCc::CreateLoaded.to_u32()).unwrap();
        assert!(loaded.response_handle);
        let eph = CommandSpec::lookup(TpmCc::EcEphemeral.to_u32()).unwrap();
        assert!(!eph.decrypt_first_param && eph.encrypt_first_param);
    }

    #[test]
    fn test_frame_without_sessions() {
        let bytes = frame_command(TpmCc::GetRandom.to_u32(), &[], &[], &[0x00, 0x20]);
        assert_eq!(&bytes[0..2], &[0x80, 0x01]);
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]);
        assert_eq!(u32::from_be_bytes(bytes[2..6].try_into().unwrap()) as usize, bytes.len());
    }

    #[test]
    fn test_frame_with_password() {
        let auth = TpmsAuthCommand::password(Some("pw"));
        let bytes = frame_command(TpmCc::NvRead.to_u32(), &[1, 2], &[auth], &[9]);
        assert_eq!(&bytes[0..2], &[0x80, 0x02]);
        // handles, then area size 4 + 2 + 1 + 2 + 2
        assert_eq!(&bytes[10..18], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&bytes[18..22], &[0, 0, 0, 11]);
        assert_eq!(&bytes[22..26], &tpm_rh::PW.to_be_bytes());
        assert_eq!(bytes.last(), Some(&9));
    }

    #[test]
    fn test_parse_error_response_has_no_body() {
        let spec = CommandSpec::lookup(TpmCc::NvRead.to_u32()).unwrap();
        let bytes = [0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x09, 0x8e];
        let rsp = TpmResponse::parse(&bytes, &spec, 1).unwrap();
        assert_eq!(rsp.response_code, 0x98e);
        assert!(rsp.auths.is_empty());
    }

    #[test]
    fn test_parse_session_response() {
        let spec = CommandSpec::lookup(TpmCc::StartAuthSession.to_u32()).unwrap();
        let mut buf = CommandBuffer::new();
        buf.put_u16(TpmSt::Sessions.to_u16());
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0x02000000);
        buf.put_u32(4);
        buf.put_bytes(&[0, 2, 7, 7]);
        TpmsAuthResponse {
            nonce: vec![1; 16],
            attributes: TpmaSa::new().with_continue_session(),
            hmac: vec![],
        }
        .marshal(&mut buf);
        let len = buf.len() as u32;
        buf.update_u32(2, len);

        let rsp = TpmResponse::parse(buf.as_bytes(), &spec, 1).unwrap();
        assert_eq!(rsp.handle, Some(0x02000000));
        assert_eq!(rsp.parameters, vec![0, 2, 7, 7]);
        assert_eq!(rsp.auths[0].nonce, vec![1; 16]);

        assert!(TpmResponse::parse(buf.as_bytes(), &spec, 2).is_err());
        assert!(TpmResponse::parse(&buf.as_bytes()[..20], &spec, 1).is_err());
    }
}
