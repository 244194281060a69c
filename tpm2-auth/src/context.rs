// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session-authorized command execution
//!
//! [`Tss::execute`] takes a command's handles and marshaled parameters plus up to
//! three session slots. It authorizes the command, encrypts the first parameter
//! when a session asks for it, sends it, verifies every response authorization,
//! decrypts the first response parameter and persists the updated sessions.

use anyhow::{Context, Result};
use fs_err as fs;
use scopeguard::ScopeGuard;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{
    folded_nonces, rp_hash, session_auth, verify_password_response, verify_response, CpHashes,
};
use crate::command::{frame_command, CommandSpec, TpmResponse};
use crate::config::{StorageKind, TssConfig};
use crate::constants::*;
use crate::crypto::{CryptoProvider, SoftwareCrypto};
use crate::device::{TpmDevice, Transport};
use crate::encrypt::{self, first_parameter, Direction, ParameterSessions};
use crate::error::TssError;
use crate::hooks::{self, Extra, Hook, PolicySigner};
use crate::names::{cache_from_config, resolve_name, NameCache};
use crate::session::Session;
use crate::store::{store_from_config, SessionLocks, SessionStore};
use crate::types::TpmsAuthCommand;

/// A command as the caller marshaled it, before authorization
#[derive(Debug, Clone)]
pub struct Command {
    pub code: u32,
    pub handles: Vec<u32>,
    /// Marshaled parameters, plaintext
    pub parameters: Vec<u8>,
    pub extra: Extra,
    /// Shape override for commands outside the built-in table
    pub spec: Option<CommandSpec>,
}

impl Command {
    pub fn new(cc: TpmCc, handles: Vec<u32>, parameters: Vec<u8>) -> Self {
        Self::raw(cc.to_u32(), handles, parameters)
    }

    pub fn raw(code: u32, handles: Vec<u32>, parameters: Vec<u8>) -> Self {
        Self {
            code,
            handles,
            parameters,
            extra: Extra::default(),
            spec: None,
        }
    }

    pub fn with_spec(mut self, spec: CommandSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_bind_password(mut self, password: impl Into<String>) -> Self {
        self.extra.bind_password = Some(password.into());
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn PolicySigner>) -> Self {
        self.extra.signer = Some(signer);
        self
    }
}

/// One entry of a command's authorization area
#[derive(Clone)]
pub struct SessionSlot {
    /// Session handle, or `TPM_RS_PW` for a password authorization
    pub handle: u32,
    /// Auth value of the entity this slot authorizes
    pub password: Option<String>,
    pub attributes: TpmaSa,
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl SessionSlot {
    /// Password authorization
    pub fn password(password: Option<&str>) -> Self {
        Self {
            handle: tpm_rh::PW,
            password: password.map(str::to_string),
            attributes: TpmaSa::new().with_continue_session(),
        }
    }

    /// HMAC or policy session that stays loaded after the command
    pub fn session(handle: u32) -> Self {
        Self {
            handle,
            password: None,
            attributes: TpmaSa::new().with_continue_session(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_attributes(mut self, attributes: TpmaSa) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_password(&self) -> bool {
        self.handle == tpm_rh::PW
    }
}

/// Successful command output, response parameters decrypted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub handle: Option<u32>,
    pub parameters: Vec<u8>,
}

/// Session layer context
pub struct Tss {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) names: Arc<dyn NameCache>,
    pub(crate) locks: SessionLocks,
}

impl Tss {
    /// Open the configured TPM device, or detect one
    pub fn new(config: &TssConfig) -> Result<Self> {
        let device = TpmDevice::open_or_detect(config.device.as_deref())?;
        Self::with_transport(device, config)
    }

    pub fn with_transport(transport: impl Transport + 'static, config: &TssConfig) -> Result<Self> {
        if config.storage == StorageKind::File {
            fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;
        }
        Ok(Self::with_parts(
            Box::new(transport),
            Arc::new(SoftwareCrypto),
            store_from_config(config)?,
            cache_from_config(config),
        ))
    }

    pub fn with_parts(
        transport: Box<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
        sessions: Arc<dyn SessionStore>,
        names: Arc<dyn NameCache>,
    ) -> Self {
        Self {
            transport,
            crypto,
            sessions,
            names,
            locks: SessionLocks::new(),
        }
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub fn names(&self) -> &dyn NameCache {
        self.names.as_ref()
    }

    /// Lock set shared by every context cloned from this one's locks
    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Share session exclusion with other contexts over the same store
    pub fn set_locks(&mut self, locks: SessionLocks) {
        self.locks = locks;
    }

    /// Authorize, send and verify one command
    pub fn execute(&mut self, mut command: Command, slots: &[SessionSlot]) -> Result<Response> {
        let code = command.code;
        let spec = match command.spec {
            Some(spec) => spec,
            None => CommandSpec::lookup(code).ok_or_else(|| {
                TssError::BadParameter(format!("unknown command code 0x{code:08x}"))
            })?,
        };
        if slots.len() > MAX_SESSION_NUM {
            return Err(TssError::TooManySessions {
                max: MAX_SESSION_NUM,
                got: slots.len(),
            }
            .into());
        }
        if command.handles.len() != spec.handles {
            return Err(TssError::BadParameter(format!(
                "command 0x{code:08x} takes {} handles, got {}",
                spec.handles,
                command.handles.len()
            ))
            .into());
        }
        check_slots(slots)?;
        let attributes: Vec<TpmaSa> = slots.iter().map(|s| s.attributes).collect();
        let selected = ParameterSessions::select(&attributes)?;
        if selected.decrypt.is_some() && !spec.decrypt_first_param {
            return Err(TssError::NoDecryptParameter(code).into());
        }
        if selected.encrypt.is_some() && !spec.encrypt_first_param {
            return Err(TssError::NoEncryptParameter(code).into());
        }

        let hook = Hook::for_command(code);
        let state = self.pre_process(hook, &mut command)?;

        let response = {
            let session_handles: Vec<u32> = slots
                .iter()
                .filter(|s| !s.is_password())
                .map(|s| s.handle)
                .collect();
            let _guard = self.locks.acquire(&session_handles)?;
            self.round_trip(&spec, hook, &command, slots, selected)
                .with_context(|| format!("command 0x{code:08x}"))?
        };

        self.post_process(hook, &command, &command.parameters, &response, state)?;
        Ok(Response {
            handle: response.handle,
            parameters: response.parameters,
        })
    }

    fn round_trip(
        &mut self,
        spec: &CommandSpec,
        hook: Hook,
        command: &Command,
        slots: &[SessionSlot],
        selected: ParameterSessions,
    ) -> Result<TpmResponse> {
        let crypto = self.crypto.clone();
        let crypto = crypto.as_ref();

        let mut sessions = slots
            .iter()
            .map(|slot| match slot.is_password() {
                true => Ok(None),
                false => self.sessions.load(slot.handle).map(Some),
            })
            .collect::<Result<Vec<Option<Session>>>>()?;
        let names = match sessions.iter().any(Option::is_some) {
            true => command
                .handles
                .iter()
                .map(|h| resolve_name(self.names.as_ref(), *h))
                .collect::<Result<Vec<_>>>()?,
            false => Vec::new(),
        };
        for (i, (slot, session)) in slots.iter().zip(sessions.iter_mut()).enumerate() {
            let Some(session) = session else { continue };
            session.roll_nonce_caller(crypto)?;
            let authorized = names
                .get(i)
                .filter(|_| spec.has_auth_role(i))
                .map(Vec::as_slice);
            session.set_hmac_key(authorized, slot.password.as_deref().map(str::as_bytes));
        }

        let mut parameters = Zeroizing::new(command.parameters.clone());
        if let Some(d) = selected.decrypt {
            let range = first_parameter(&parameters)?;
            let session = session_at(&sessions, d)?;
            encrypt::apply(crypto, session, Direction::Command, &mut parameters[range])?;
        }

        let mut cp_hashes = CpHashes::new(command.code, &names, &parameters);
        let mut auths = Vec::with_capacity(slots.len());
        for (i, slot) in slots.iter().enumerate() {
            let auth = match &sessions[i] {
                None => TpmsAuthCommand {
                    attributes: slot.attributes,
                    ..TpmsAuthCommand::password(slot.password.as_deref())
                },
                Some(session) => {
                    let cp_hash = match session.authenticates() && !session.password_needed {
                        true => Some(cp_hashes.get(crypto, session.hash_alg)?),
                        false => None,
                    };
                    let (dec, enc) = folded_nonces(i, selected, |j| {
                        sessions.get(j)?.as_ref().map(|s| s.nonce_tpm.clone())
                    });
                    session_auth(
                        crypto,
                        session,
                        slot.attributes,
                        cp_hash.as_deref(),
                        (&dec, &enc),
                        slot.password.as_deref(),
                    )?
                }
            };
            auths.push(auth);
        }
        let wire = Zeroizing::new(frame_command(
            command.code,
            &command.handles,
            &auths,
            &parameters,
        ));

        // once sent, the TPM's nonces are unknown unless the response parses
        let store = self.sessions.clone();
        let sent: Vec<u32> = sessions.iter().flatten().map(|s| s.handle).collect();
        let abandon = scopeguard::guard(sent, move |handles| {
            for handle in handles {
                warn!("abandoning session 0x{handle:08x}");
                if let Err(e) = store.delete(handle) {
                    warn!("failed to delete session 0x{handle:08x}: {e:#}");
                }
            }
        });
        let bytes = self
            .transport
            .transmit(&wire)
            .map_err(|e| TssError::Transport(format!("{e:#}")))?;
        let mut response = TpmResponse::parse(&bytes, spec, slots.len())?;
        ScopeGuard::into_inner(abandon);

        if !response.is_success() {
            debug!(
                "command 0x{:08x} failed with 0x{:08x}",
                command.code, response.response_code
            );
            return Err(TssError::Tpm(response.response_code).into());
        }

        for (i, (session, auth)) in sessions.iter_mut().zip(&response.auths).enumerate() {
            let Some(session) = session else {
                verify_password_response(auth)?;
                continue;
            };
            session.nonce_tpm = auth.nonce.clone();
            if session.authenticates() {
                let authorized = names
                    .get(i)
                    .filter(|_| spec.has_auth_role(i))
                    .map(Vec::as_slice);
                hooks::change_auth(hook, i, session, authorized, &command.parameters)?;
                let rp = rp_hash(crypto, session.hash_alg, command.code, &response.parameters)?;
                verify_response(crypto, session, &rp, auth)?;
            }
            if session.bind.is_some() && auth.attributes.audit() {
                debug!("session 0x{:08x}: audited, bind dropped", session.handle);
                session.bind = None;
            }
        }

        // the TPM decides whether a session survives
        for (session, auth) in sessions.iter_mut().zip(&response.auths) {
            let Some(session) = session else { continue };
            if auth.attributes.continue_session() {
                session.clear_policy_flags();
                self.sessions.save(session)?;
            } else {
                self.sessions.delete(session.handle)?;
                debug!("session 0x{:08x} closed", session.handle);
            }
        }

        if let Some(e) = selected.encrypt {
            let range = first_parameter(&response.parameters)?;
            let session = session_at(&sessions, e)?;
            encrypt::apply(
                crypto,
                session,
                Direction::Response,
                &mut response.parameters[range],
            )?;
        }
        Ok(response)
    }
}

fn session_at(sessions: &[Option<Session>], slot: usize) -> Result<&Session> {
    sessions
        .get(slot)
        .and_then(Option::as_ref)
        .ok_or_else(|| TssError::BadParameter(format!("slot {slot} is not a session")).into())
}

fn check_slots(slots: &[SessionSlot]) -> Result<()> {
    for (i, slot) in slots.iter().enumerate() {
        if slot.is_password() {
            if slot.attributes.decrypt() || slot.attributes.encrypt() {
                return Err(TssError::BadParameter(
                    "password authorization cannot encrypt parameters".into(),
                )
                .into());
            }
            continue;
        }
        if !matches!(
            TpmHt::of(slot.handle),
            Some(TpmHt::HmacSession | TpmHt::PolicySession)
        ) {
            return Err(TssError::BadParameter(format!(
                "0x{:08x} is not a session handle",
                slot.handle
            ))
            .into());
        }
        if slots[..i].iter().any(|s| s.handle == slot.handle) {
            return Err(TssError::BadParameter(format!(
                "session 0x{:08x} used twice",
                slot.handle
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{result_code, rc};
    use std::sync::Mutex;

    /// Counts transmissions, answers nothing
    #[derive(Clone, Default)]
    struct Silent(Arc<Mutex<usize>>);

    impl Transport for Silent {
        fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>> {
            *self.0.lock().unwrap() += 1;
            anyhow::bail!("no TPM")
        }
    }

    fn tss() -> (Tss, Silent) {
        let transport = Silent::default();
        let tss = Tss::with_transport(transport.clone(), &TssConfig::in_memory()).unwrap();
        (tss, transport)
    }

    fn get_random() -> Command {
        Command::new(TpmCc::GetRandom, vec![], 16u16.to_be_bytes().to_vec())
    }

    #[test]
    fn test_rejected_before_transmission() {
        let (mut tss, sent) = tss();
        let slot = || SessionSlot::session(0x02000000);

        let err = tss.execute(get_random(), &[slot(), slot(), slot(), slot()]).unwrap_err();
        assert_eq!(result_code(&err), rc::TOO_MANY_SESSIONS);

        let err = tss.execute(Command::raw(0x1ff, vec![], vec![]), &[]).unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_PARAMETER);

        let err = tss
            .execute(Command::new(TpmCc::NvRead, vec![tpm_rh::OWNER], vec![]), &[])
            .unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_PARAMETER);

        let dup = [slot(), slot()];
        let err = tss.execute(get_random(), &dup).unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_PARAMETER);

        let pw = SessionSlot::password(None).with_attributes(TpmaSa::new().with_decrypt());
        let err = tss.execute(get_random(), &[pw]).unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_PARAMETER);

        let two = [
            slot().with_attributes(TpmaSa::new().with_decrypt()),
            SessionSlot::session(0x02000001).with_attributes(TpmaSa::new().with_decrypt()),
        ];
        let err = tss.execute(get_random(), &two).unwrap_err();
        assert_eq!(result_code(&err), rc::DECRYPT_SESSIONS);

        // GetRandom's first parameter is a UINT16
        let enc = [slot().with_attributes(TpmaSa::new().with_decrypt())];
        let err = tss.execute(get_random(), &enc).unwrap_err();
        assert_eq!(result_code(&err), rc::NO_DECRYPT_PARAMETER);

        assert_eq!(*sent.0.lock().unwrap(), 0);
    }

    #[test]
    fn test_missing_session_is_reported() {
        let (mut tss, sent) = tss();
        let err = tss
            .execute(get_random(), &[SessionSlot::session(0x02000007)])
            .unwrap_err();
        assert_eq!(result_code(&err), rc::SESSION_NOT_FOUND);
        assert_eq!(*sent.0.lock().unwrap(), 0);
    }

    #[test]
    fn test_transport_failure_abandons_sessions() {
        let (mut tss, sent) = tss();
        let mut session =
            Session::new(0x02000000, TpmAlgId::Sha256, Default::default(), TpmSe::Hmac).unwrap();
        session.nonce_tpm = vec![1; 32];
        tss.sessions.save(&session).unwrap();

        let err = tss
            .execute(get_random(), &[SessionSlot::session(0x02000000)])
            .unwrap_err();
        assert_eq!(result_code(&err), rc::BAD_CONNECTION);
        assert_eq!(*sent.0.lock().unwrap(), 1);
        assert_eq!(
            result_code(&tss.sessions.load(0x02000000).unwrap_err()),
            rc::SESSION_NOT_FOUND
        );
        assert!(!tss.locks.is_locked(0x02000000));
    }

    /// Answers every command with the same bytes
    struct Canned(Vec<u8>);

    impl Transport for Canned {
        fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    /// GetRandom success carrying one authorization with `attributes`
    fn random_response(attributes: u8) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&4u32.to_be_bytes());
        body.extend_from_slice(&[0, 2, 0xab, 0xcd]);
        body.extend_from_slice(&32u16.to_be_bytes());
        body.extend_from_slice(&[7; 32]);
        body.push(attributes);
        body.extend_from_slice(&[0, 0]);

        let mut bytes = TpmSt::Sessions.to_u16().to_be_bytes().to_vec();
        bytes.extend_from_slice(&(body.len() as u32 + 6).to_be_bytes());
        bytes.extend_from_slice(&body);
        bytes
    }

    fn policy_session_tss(attributes: u8) -> Tss {
        let mut tss =
            Tss::with_transport(Canned(random_response(attributes)), &TssConfig::in_memory())
                .unwrap();
        let mut session =
            Session::new(0x03000000, TpmAlgId::Sha256, Default::default(), TpmSe::Policy).unwrap();
        session.nonce_tpm = vec![1; 32];
        tss.sessions.save(&session).unwrap();
        tss
    }

    #[test]
    fn test_tpm_closing_session_deletes_record() {
        let mut tss = policy_session_tss(0x00);
        let slot = SessionSlot::session(0x03000000);
        assert!(slot.attributes.continue_session());

        let response = tss.execute(get_random(), &[slot]).unwrap();
        assert_eq!(response.parameters, vec![0, 2, 0xab, 0xcd]);
        assert_eq!(
            result_code(&tss.sessions.load(0x03000000).unwrap_err()),
            rc::SESSION_NOT_FOUND
        );
    }

    #[test]
    fn test_tpm_continuing_session_keeps_record() {
        let mut tss = policy_session_tss(TpmaSa::new().with_continue_session().0);
        let slot = SessionSlot::session(0x03000000).with_attributes(TpmaSa::new());

        tss.execute(get_random(), &[slot]).unwrap();
        let session = tss.sessions.load(0x03000000).unwrap();
        assert_eq!(session.nonce_tpm, vec![7; 32]);
    }

    #[test]
    fn test_slot_debug_redacts_password() {
        let slot = SessionSlot::password(Some("hunter2"));
        assert!(!format!("{slot:?}").contains("hunter2"));
    }
}
