// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! Session state, the rule deciding whether an entity's auth value is part
//! of a session's HMAC key, command and response HMACs, and the session
//! related commands.

use std::fmt;

use tracing::debug;
use zeroize::Zeroizing;

use crate::commands::TpmContext;
use crate::constants::*;
use crate::crypto::{self, CryptDirection};
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::name::Name;
use crate::pipeline::Command;
use crate::reconcile::AuthRotation;
use crate::resources::{Resource, ResourceContext, ResourceKind};
use crate::types::*;

/// Policy assertions that change how a policy session authorizes a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAuth {
    None,
    /// TPM2_PolicyAuthValue: the auth value is part of the HMAC key
    AuthValue,
    /// TPM2_PolicyPassword: the auth value is sent in the clear
    Password,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Hmac,
    Policy(PolicyAuth),
    Trial,
}

/// Whether the auth value of the authorized entity is part of the HMAC key
/// for one use of a session.
///
/// `target_bind_value` is `None` when the session authorizes no handle
/// (audit, encrypt or decrypt only). Otherwise it is the bind value of the
/// authorized entity computed with the auth value supplied for this use.
/// `bound_entity` is the bind value recorded when the session was started
/// bound.
pub fn include_auth_value(
    kind: SessionKind,
    bound_entity: Option<&[u8]>,
    target_bind_value: Option<&[u8]>,
) -> bool {
    let Some(target) = target_bind_value else {
        return false;
    };
    match kind {
        SessionKind::Hmac => bound_entity != Some(target),
        SessionKind::Policy(policy) => policy == PolicyAuth::AuthValue,
        SessionKind::Trial => false,
    }
}

/// sessionKey from TPM 2.0 Part 1 §19.6.8. Empty for a session that is
/// neither bound nor salted.
fn session_key(
    auth_hash: TpmAlgId,
    bind_auth: Option<&[u8]>,
    salt: Option<&[u8]>,
    nonce_tpm: &[u8],
    nonce_caller: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if bind_auth.is_none() && salt.is_none() {
        return Ok(Zeroizing::new(Vec::new()));
    }
    let mut key_material = Zeroizing::new(Vec::new());
    if let Some(auth) = bind_auth {
        key_material.extend_from_slice(crypto::trim_auth(auth));
    }
    if let Some(salt) = salt {
        key_material.extend_from_slice(salt);
    }
    crypto::kdfa(
        auth_hash,
        &key_material,
        "ATH",
        nonce_tpm,
        nonce_caller,
        auth_hash.digest_size() * 8,
    )
}

/// Host-side state of a started session
pub(crate) struct SessionState {
    pub(crate) handle: u32,
    pub(crate) hash_alg: TpmAlgId,
    pub(crate) session_type: TpmSe,
    pub(crate) policy: PolicyAuth,
    pub(crate) bound_entity: Option<Vec<u8>>,
    pub(crate) session_key: Zeroizing<Vec<u8>>,
    pub(crate) nonce_caller: Vec<u8>,
    pub(crate) nonce_tpm: Vec<u8>,
    pub(crate) symmetric: TpmtSymDef,
}

impl SessionState {
    pub(crate) fn kind(&self) -> SessionKind {
        match self.session_type {
            TpmSe::Hmac => SessionKind::Hmac,
            TpmSe::Policy => SessionKind::Policy(self.policy),
            TpmSe::Trial => SessionKind::Trial,
        }
    }

    pub(crate) fn include_auth_value(&self, target_bind_value: Option<&[u8]>) -> bool {
        include_auth_value(self.kind(), self.bound_entity.as_deref(), target_bind_value)
    }

    pub(crate) fn invalidate(&mut self) {
        self.handle = tpm_rh::NULL;
        self.session_key = Zeroizing::new(Vec::new());
        self.bound_entity = None;
        self.nonce_caller.clear();
        self.nonce_tpm.clear();
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("handle", &format_args!("{:#010x}", self.handle))
            .field("hash_alg", &self.hash_alg)
            .field("kind", &self.kind())
            .field("bound", &self.bound_entity.is_some())
            .field("salted_or_bound_key", &!self.session_key.is_empty())
            .finish_non_exhaustive()
    }
}

/// A context known to refer to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext(ResourceContext);

impl SessionContext {
    /// Narrow a resource context to a session context
    pub fn from_context(context: ResourceContext) -> Result<Self> {
        if context.kind() == ResourceKind::Session {
            Ok(Self(context))
        } else {
            Err(Error::Usage(format!(
                "{:?} context is not a session",
                context.kind()
            )))
        }
    }

    pub fn handle(&self) -> u32 {
        self.0.handle()
    }

    pub fn name(&self) -> Name {
        self.0.name()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }

    pub fn context(&self) -> &ResourceContext {
        &self.0
    }

    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> Option<R> {
        self.0
            .read(|r| match r {
                Resource::Session(s) => Some(f(s)),
                _ => None,
            })
            .flatten()
    }

    pub fn hash_alg(&self) -> Option<TpmAlgId> {
        self.read(|s| s.hash_alg)
    }

    pub fn kind(&self) -> Option<SessionKind> {
        self.read(SessionState::kind)
    }

    pub fn is_bound(&self) -> bool {
        self.read(|s| s.bound_entity.is_some()).unwrap_or(false)
    }

    pub fn symmetric(&self) -> Option<TpmtSymDef> {
        self.read(|s| s.symmetric)
    }

    /// Use this session with the given attributes and no auth value
    pub fn with_attrs(&self, attrs: TpmaSa) -> Session {
        Session::new(self, attrs)
    }
}

/// One use of a session: the session, its attributes and the auth value of
/// the entity it authorizes
#[derive(Clone)]
pub struct Session {
    context: SessionContext,
    pub attrs: TpmaSa,
    auth_value: Zeroizing<Vec<u8>>,
}

impl Session {
    pub fn new(context: &SessionContext, attrs: TpmaSa) -> Self {
        Self {
            context: context.clone(),
            attrs,
            auth_value: Zeroizing::new(Vec::new()),
        }
    }

    pub fn with_auth_value(mut self, auth: &[u8]) -> Self {
        self.auth_value = Zeroizing::new(auth.to_vec());
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context)
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

/// How a handle requiring authorization is authorized
#[derive(Clone)]
pub enum Authorization {
    /// Plaintext password session (TPM_RS_PW)
    Password(Zeroizing<Vec<u8>>),
    Session(Session),
}

impl Authorization {
    pub fn password(auth: &[u8]) -> Self {
        Authorization::Password(Zeroizing::new(auth.to_vec()))
    }
}

impl Default for Authorization {
    fn default() -> Self {
        Authorization::Password(Zeroizing::new(Vec::new()))
    }
}

impl From<Session> for Authorization {
    fn from(session: Session) -> Self {
        Authorization::Session(session)
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Password(_) => f.write_str("Password(..)"),
            Authorization::Session(s) => f.debug_tuple("Session").field(s).finish(),
        }
    }
}

/// An entry of a command's authorization area
pub(crate) enum AuthSlot {
    Password(Zeroizing<Vec<u8>>),
    Session(SessionSlot),
}

impl AuthSlot {
    pub(crate) fn session(&self) -> Option<&SessionSlot> {
        match self {
            AuthSlot::Session(s) => Some(s),
            AuthSlot::Password(_) => None,
        }
    }

    pub(crate) fn marshal_command(&self, buf: &mut CommandBuffer, hmac: &[u8]) {
        match self {
            AuthSlot::Password(_) => {
                buf.put_u32(tpm_rh::PW);
                buf.put_tpm2b_empty();
                buf.put_u8(TpmaSa::CONTINUE_SESSION);
                buf.put_tpm2b(hmac);
            }
            AuthSlot::Session(s) => {
                buf.put_u32(s.handle);
                buf.put_tpm2b(&s.nonce_caller);
                buf.put_u8(s.attrs.0);
                buf.put_tpm2b(hmac);
            }
        }
    }
}

/// Snapshot of a session for a single command, carrying the fresh caller
/// nonce until the TPM accepts the command
pub(crate) struct SessionSlot {
    pub(crate) context: ResourceContext,
    pub(crate) handle: u32,
    pub(crate) attrs: TpmaSa,
    pub(crate) hash_alg: TpmAlgId,
    pub(crate) symmetric: TpmtSymDef,
    pub(crate) include_auth: bool,
    pub(crate) policy_password: bool,
    auth_value: Zeroizing<Vec<u8>>,
    session_key: Zeroizing<Vec<u8>>,
    pub(crate) nonce_caller: Vec<u8>,
    pub(crate) nonce_tpm: Vec<u8>,
}

impl SessionSlot {
    /// `target` is the Name of the handle this session authorizes, if any
    pub(crate) fn prepare(session: &Session, target: Option<&Name>) -> Result<Self> {
        let auth_value = Zeroizing::new(crypto::trim_auth(&session.auth_value).to_vec());
        let target_bind = target.map(|name| crypto::bind_value(name.as_bytes(), &auth_value));
        let context = session.context.context().clone();
        context
            .read(|r| match r {
                Resource::Session(state) => Ok(Self {
                    context: context.clone(),
                    handle: state.handle,
                    attrs: session.attrs,
                    hash_alg: state.hash_alg,
                    symmetric: state.symmetric,
                    include_auth: state.include_auth_value(target_bind.as_deref()),
                    policy_password: target.is_some()
                        && state.kind() == SessionKind::Policy(PolicyAuth::Password),
                    auth_value: auth_value.clone(),
                    session_key: state.session_key.clone(),
                    nonce_caller: crypto::random_bytes(state.nonce_caller.len()),
                    nonce_tpm: state.nonce_tpm.clone(),
                }),
                _ => Err(Error::Usage("context is not a session".into())),
            })
            .unwrap_or_else(|| Err(Error::Usage("permanent context is not a session".into())))
    }

    /// sessionKey || authValue when the auth value is included
    fn session_value(&self) -> Zeroizing<Vec<u8>> {
        let mut value = Zeroizing::new(self.session_key.to_vec());
        if self.include_auth {
            value.extend_from_slice(&self.auth_value);
        }
        value
    }

    pub(crate) fn rotate(&mut self, rotation: &AuthRotation) {
        if !self.include_auth {
            return;
        }
        match rotation {
            AuthRotation::None => {}
            AuthRotation::AdoptNewAuth(auth) => {
                self.auth_value = Zeroizing::new(crypto::trim_auth(auth).to_vec());
            }
            AuthRotation::AdoptEmptyAuth => self.auth_value = Zeroizing::new(Vec::new()),
        }
    }

    /// The value placed in the hmac field of the command authorization
    pub(crate) fn command_hmac(
        &self,
        code: TpmCc,
        names: &[Name],
        params: &[u8],
        extra_nonces: &[&[u8]],
    ) -> Result<Vec<u8>> {
        if self.policy_password {
            return Ok(self.auth_value.to_vec());
        }
        let code_bytes = code.to_u32().to_be_bytes();
        let mut cp_parts: Vec<&[u8]> = vec![&code_bytes];
        cp_parts.extend(names.iter().map(Name::as_bytes));
        cp_parts.push(params);
        let cp_hash = crypto::digest(self.hash_alg, &cp_parts)?;

        let attrs = [self.attrs.0];
        let mut parts: Vec<&[u8]> = vec![&cp_hash, &self.nonce_caller, &self.nonce_tpm];
        parts.extend_from_slice(extra_nonces);
        parts.push(&attrs);
        crypto::hmac(self.hash_alg, &self.session_value(), &parts)
    }

    pub(crate) fn verify_response(
        &self,
        code: TpmCc,
        params: &[u8],
        nonce_tpm: &[u8],
        attrs: u8,
        hmac: &[u8],
    ) -> Result<bool> {
        if self.policy_password {
            return Ok(hmac.is_empty());
        }
        let rp_hash = crypto::digest(
            self.hash_alg,
            &[
                &tpm_rc::SUCCESS.to_be_bytes(),
                &code.to_u32().to_be_bytes(),
                params,
            ],
        )?;
        crypto::hmac_verify(
            self.hash_alg,
            &self.session_value(),
            &[&rp_hash, nonce_tpm, &self.nonce_caller, &[attrs]],
            hmac,
        )
    }

    /// Encrypt the data of the first command parameter
    pub(crate) fn encrypt_command_param(&self, data: &mut [u8]) -> Result<()> {
        crypto::param_crypt(
            &self.symmetric,
            self.hash_alg,
            &self.session_value(),
            &self.nonce_caller,
            &self.nonce_tpm,
            data,
            CryptDirection::Encrypt,
        )
    }

    /// Decrypt the data of the first response parameter
    pub(crate) fn decrypt_response_param(&self, nonce_tpm: &[u8], data: &mut [u8]) -> Result<()> {
        crypto::param_crypt(
            &self.symmetric,
            self.hash_alg,
            &self.session_value(),
            nonce_tpm,
            &self.nonce_caller,
            data,
            CryptDirection::Decrypt,
        )
    }

    /// Record the nonces of a round trip the TPM accepted
    pub(crate) fn commit(&self, nonce_tpm: &[u8]) {
        self.context.update(|r| {
            if let Resource::Session(state) = r {
                state.nonce_caller = self.nonce_caller.clone();
                state.nonce_tpm = nonce_tpm.to_vec();
            }
        });
    }
}

impl<T: Transport> TpmContext<T> {
    /// TPM2_StartAuthSession
    ///
    /// `tpm_key` salts the session with a random value encrypted to an RSA
    /// key. `bind` binds the session to an entity whose auth value is
    /// `bind_auth`. The session key is derived when either is present.
    pub fn start_auth_session(
        &mut self,
        tpm_key: Option<&ResourceContext>,
        bind: Option<&ResourceContext>,
        session_type: TpmSe,
        symmetric: TpmtSymDef,
        auth_hash: TpmAlgId,
        bind_auth: &[u8],
    ) -> Result<SessionContext> {
        let digest_size = auth_hash.digest_size();
        if digest_size == 0 {
            return Err(Error::Unsupported(format!(
                "session hash algorithm {auth_hash:?}"
            )));
        }

        let (salt, encrypted_salt) = match tpm_key {
            Some(key) => {
                let public = key.object_public().ok_or_else(|| {
                    Error::Usage("salting key must be an object with a public area".into())
                })?;
                let salt = Zeroizing::new(crypto::random_bytes(digest_size));
                let encrypted = crypto::encrypt_salt(&public, &salt)?;
                (salt, encrypted)
            }
            None => (Zeroizing::new(Vec::new()), Vec::new()),
        };

        let null = self.null_handle_context();
        let nonce_caller = crypto::random_bytes(digest_size);

        let mut params = CommandBuffer::new();
        params.put_tpm2b(&nonce_caller);
        params.put_tpm2b(&encrypted_salt);
        params.put_u8(session_type as u8);
        symmetric.marshal(&mut params);
        params.put_u16(auth_hash.to_u16());

        let rsp = self.run_command(
            Command::new(TpmCc::StartAuthSession)
                .handle(tpm_key.unwrap_or(&null))
                .handle(bind.unwrap_or(&null))
                .params(params)
                .response_handles(1),
        )?;
        let handle = rsp.handles[0];
        let mut buf = rsp.params();
        let nonce_tpm = buf.get_tpm2b()?;

        let bound_entity = bind.map(|ctx| crypto::bind_value(ctx.name().as_bytes(), bind_auth));
        let session_key = session_key(
            auth_hash,
            bind.map(|_| bind_auth),
            tpm_key.map(|_| salt.as_slice()),
            &nonce_tpm,
            &nonce_caller,
        )?;

        debug!(
            "started {:?} session 0x{handle:08x} (bound: {}, salted: {})",
            session_type,
            bound_entity.is_some(),
            tpm_key.is_some()
        );
        let ctx = self.store.insert_session(SessionState {
            handle,
            hash_alg: auth_hash,
            session_type,
            policy: PolicyAuth::None,
            bound_entity,
            session_key,
            nonce_caller,
            nonce_tpm,
            symmetric,
        });
        Ok(SessionContext(ctx))
    }

    fn set_policy_auth(&mut self, session: &SessionContext, policy: PolicyAuth) {
        session.0.update(|r| {
            if let Resource::Session(state) = r {
                state.policy = policy;
            }
        });
    }

    /// TPM2_PolicyAuthValue
    pub fn policy_auth_value(&mut self, session: &SessionContext, sessions: &[Session]) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::PolicyAuthValue)
                .handle(session.context())
                .sessions(sessions),
        )?;
        self.set_policy_auth(session, PolicyAuth::AuthValue);
        Ok(())
    }

    /// TPM2_PolicyPassword
    pub fn policy_password(&mut self, session: &SessionContext, sessions: &[Session]) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::PolicyPassword)
                .handle(session.context())
                .sessions(sessions),
        )?;
        self.set_policy_auth(session, PolicyAuth::Password);
        Ok(())
    }

    /// TPM2_PolicyGetDigest
    pub fn policy_get_digest(&mut self, session: &SessionContext, sessions: &[Session]) -> Result<Vec<u8>> {
        let rsp = self.run_command(
            Command::new(TpmCc::PolicyGetDigest)
                .handle(session.context())
                .sessions(sessions),
        )?;
        let digest = rsp.params().get_tpm2b()?;
        Ok(digest)
    }
}
