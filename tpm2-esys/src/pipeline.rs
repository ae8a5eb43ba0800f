// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command execution
//!
//! One round trip: build the authorization area from up to three sessions,
//! encrypt the first parameter, transmit, then check the response
//! authorization area and decrypt the first response parameter.

use tracing::debug;

use crate::commands::TpmContext;
use crate::constants::*;
use crate::device::{TpmCommand, TpmResponse, Transport};
use crate::error::{Error, Result, TpmRcError};
use crate::marshal::*;
use crate::name::Name;
use crate::reconcile::{AuthRotation, Effect};
use crate::resources::ResourceContext;
use crate::session::{AuthSlot, Authorization, Session, SessionSlot};

/// Maximum number of sessions in one command
pub const MAX_SESSIONS: usize = 3;

/// A command ready to run: handles, optional per-handle authorization,
/// extra sessions and marshaled parameters
pub(crate) struct Command<'a> {
    code: TpmCc,
    handles: Vec<(&'a ResourceContext, Option<&'a Authorization>)>,
    sessions: &'a [Session],
    params: CommandBuffer,
    response_handles: usize,
    rotation: AuthRotation,
    effect: Effect<'a>,
}

impl<'a> Command<'a> {
    pub(crate) fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            sessions: &[],
            params: CommandBuffer::new(),
            response_handles: 0,
            rotation: AuthRotation::None,
            effect: Effect::None,
        }
    }

    /// A handle that needs no authorization
    pub(crate) fn handle(mut self, ctx: &'a ResourceContext) -> Self {
        self.handles.push((ctx, None));
        self
    }

    pub(crate) fn auth_handle(mut self, ctx: &'a ResourceContext, auth: &'a Authorization) -> Self {
        self.handles.push((ctx, Some(auth)));
        self
    }

    /// Sessions used for auditing or parameter encryption only
    pub(crate) fn sessions(mut self, sessions: &'a [Session]) -> Self {
        self.sessions = sessions;
        self
    }

    pub(crate) fn params(mut self, params: CommandBuffer) -> Self {
        self.params = params;
        self
    }

    pub(crate) fn response_handles(mut self, count: usize) -> Self {
        self.response_handles = count;
        self
    }

    pub(crate) fn rotation(mut self, rotation: AuthRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub(crate) fn effect(mut self, effect: Effect<'a>) -> Self {
        self.effect = effect;
        self
    }
}

/// Handles and decrypted parameters of a successful command
#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) handles: Vec<u32>,
    params: Vec<u8>,
}

impl Response {
    pub(crate) fn params(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.params)
    }
}

struct ResponseAuth {
    nonce_tpm: Vec<u8>,
    attrs: u8,
    hmac: Vec<u8>,
}

/// The data bytes of the sized first parameter, `None` if the parameter area
/// does not start with one
fn first_param_data(params: &mut [u8]) -> Option<&mut [u8]> {
    if params.len() < 2 {
        return None;
    }
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    params.get_mut(2..2 + size)
}

/// Split a successful response into handles, parameters and the response
/// authorization area
fn parse_response(
    code: TpmCc,
    rsp: &TpmResponse,
    response_handles: usize,
    sessions: usize,
) -> Result<(Vec<u32>, Vec<u8>, Vec<ResponseAuth>)> {
    let mut buf = ResponseBuffer::new(&rsp.data);
    let handles = (0..response_handles)
        .map(|_| buf.get_u32())
        .collect::<Result<Vec<_>>>()?;

    let (params, auths) = if rsp.tag == TpmSt::Sessions {
        let size = buf.get_u32()? as usize;
        let params = buf.get_bytes(size)?;
        let mut auths = Vec::with_capacity(sessions);
        for _ in 0..sessions {
            auths.push(ResponseAuth {
                nonce_tpm: buf.get_tpm2b()?,
                attrs: buf.get_u8()?,
                hmac: buf.get_tpm2b()?,
            });
        }
        (params, auths)
    } else {
        (buf.get_remaining(), Vec::new())
    };
    if buf.remaining() != 0 {
        return Err(Error::invalid_response(code, "trailing bytes after authorization area"));
    }
    if auths.len() != sessions {
        return Err(Error::invalid_response(
            code,
            format!("expected {sessions} response sessions, got {}", auths.len()),
        ));
    }
    Ok((handles, params, auths))
}

impl<T: Transport> TpmContext<T> {
    fn prepare_slots(&self, cmd: &Command<'_>) -> Result<Vec<AuthSlot>> {
        let mut slots = Vec::new();
        for (ctx, auth) in &cmd.handles {
            self.store.check(ctx)?;
            match auth {
                None => {}
                Some(Authorization::Password(p)) => slots.push(AuthSlot::Password(p.clone())),
                Some(Authorization::Session(s)) => {
                    self.store.check(s.context().context())?;
                    let target = ctx.name();
                    slots.push(AuthSlot::Session(SessionSlot::prepare(s, Some(&target))?));
                }
            }
        }
        for s in cmd.sessions {
            self.store.check(s.context().context())?;
            slots.push(AuthSlot::Session(SessionSlot::prepare(s, None)?));
        }

        if slots.len() > MAX_SESSIONS {
            return Err(self.usage(format!(
                "{} sessions supplied for {:?}, at most {MAX_SESSIONS} are allowed",
                slots.len(),
                cmd.code
            )));
        }
        let sessions: Vec<&SessionSlot> = slots.iter().filter_map(AuthSlot::session).collect();
        for (i, a) in sessions.iter().enumerate() {
            if sessions[i + 1..]
                .iter()
                .any(|b| b.context.same_resource(&a.context))
            {
                return Err(self.usage(format!(
                    "session 0x{:08x} used more than once in {:?}",
                    a.handle, cmd.code
                )));
            }
        }
        Ok(slots)
    }

    fn find_session(&self, slots: &[AuthSlot], attr: u8, code: TpmCc, allowed: bool) -> Result<Option<usize>> {
        let mut found = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.session().is_some_and(|s| s.attrs.contains(attr)));
        let Some((index, _)) = found.next() else {
            return Ok(None);
        };
        if found.next().is_some() {
            return Err(self.usage(format!(
                "more than one session requests parameter encryption for {code:?}"
            )));
        }
        if !allowed {
            return Err(self.usage(format!(
                "{code:?} has no parameter that can be encrypted"
            )));
        }
        Ok(Some(index))
    }

    /// Run a command through the TPM.
    ///
    /// Local state is not modified unless the TPM accepted the command.
    pub(crate) fn run_command(&mut self, cmd: Command<'_>) -> Result<Response> {
        let code = cmd.code;
        let slots = self.prepare_slots(&cmd)?;

        let decrypt = self.find_session(&slots, TpmaSa::DECRYPT, code, code.decrypt_allowed())?;
        let encrypt = self.find_session(&slots, TpmaSa::ENCRYPT, code, code.encrypt_allowed())?;

        let mut params = cmd.params.as_bytes().to_vec();
        if let Some(i) = decrypt {
            if let Some(s) = slots[i].session() {
                let data = first_param_data(&mut params).ok_or_else(|| {
                    self.usage(format!("{code:?} has no sized first parameter to encrypt"))
                })?;
                s.encrypt_command_param(data)?;
            }
        }

        let names: Vec<Name> = cmd.handles.iter().map(|(ctx, _)| ctx.name()).collect();
        let mut auth_area = CommandBuffer::new();
        for (i, slot) in slots.iter().enumerate() {
            let hmac = match slot {
                AuthSlot::Password(p) => p.to_vec(),
                AuthSlot::Session(s) => {
                    let mut extra: Vec<&[u8]> = Vec::new();
                    if i == 0 {
                        for j in [decrypt, encrypt.filter(|e| Some(*e) != decrypt)]
                            .into_iter()
                            .flatten()
                            .filter(|j| *j != 0)
                        {
                            if let Some(other) = slots[j].session() {
                                extra.push(&other.nonce_tpm);
                            }
                        }
                    }
                    s.command_hmac(code, &names, &params, &extra)?
                }
            };
            slot.marshal_command(&mut auth_area, &hmac);
        }

        let mut tc = TpmCommand::new(code, !slots.is_empty());
        for (ctx, _) in &cmd.handles {
            tc.add_handle(ctx.handle());
        }
        if !slots.is_empty() {
            tc.add_u32(auth_area.len() as u32);
            tc.add_bytes(auth_area.as_bytes());
        }
        tc.add_bytes(&params);
        let command = tc.finalize();
        debug!(
            "{:?}: {} byte command, {} handles, {} sessions",
            code,
            command.len(),
            cmd.handles.len(),
            slots.len()
        );

        let raw = self.transport.transmit(&command)?;
        let rsp = TpmResponse::parse(&raw)?;
        if !rsp.is_success() {
            debug!("{:?} failed: 0x{:08x}", code, rsp.response_code);
            return Err(TpmRcError::new(code, rsp.response_code).into());
        }
        debug!("{:?}: {} byte response", code, raw.len());

        let result = self.process_response(
            code,
            &rsp,
            slots,
            cmd.response_handles,
            &cmd.rotation,
            encrypt,
        );
        self.apply_effect(cmd.effect);
        result
    }

    fn process_response(
        &mut self,
        code: TpmCc,
        rsp: &TpmResponse,
        mut slots: Vec<AuthSlot>,
        response_handles: usize,
        rotation: &AuthRotation,
        encrypt: Option<usize>,
    ) -> Result<Response> {
        // Sessions sent without continueSession are gone from the TPM once it
        // accepted the command, whatever state the response is in
        let (handles, mut params, auths) =
            match parse_response(code, rsp, response_handles, slots.len()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.evict_consumed_sessions(&slots);
                    return Err(e);
                }
            };

        if let Some(AuthSlot::Session(first)) = slots.first_mut() {
            first.rotate(rotation);
        }

        let mut failure = None;
        for (i, (slot, auth)) in slots.iter().zip(&auths).enumerate() {
            let ok = match slot {
                AuthSlot::Password(_) => auth.nonce_tpm.is_empty() && auth.hmac.is_empty(),
                AuthSlot::Session(s) => {
                    s.commit(&auth.nonce_tpm);
                    match s.verify_response(code, &params, &auth.nonce_tpm, auth.attrs, &auth.hmac) {
                        Ok(ok) => ok,
                        Err(e) => {
                            failure.get_or_insert(e);
                            continue;
                        }
                    }
                }
            };
            if !ok && failure.is_none() {
                failure = Some(Error::invalid_response(
                    code,
                    format!("response authorization for session {} does not verify", i + 1),
                ));
            }
        }
        self.evict_consumed_sessions(&slots);
        if let Some(e) = failure {
            return Err(e);
        }

        if let Some(i) = encrypt {
            if let (Some(s), Some(auth)) = (slots[i].session(), auths.get(i)) {
                let data = first_param_data(&mut params).ok_or_else(|| {
                    Error::invalid_response(code, "first response parameter is not a sized buffer")
                })?;
                s.decrypt_response_param(&auth.nonce_tpm, data)?;
            }
        }

        Ok(Response { handles, params })
    }

    fn evict_consumed_sessions(&mut self, slots: &[AuthSlot]) {
        for s in slots.iter().filter_map(AuthSlot::session) {
            if !s.attrs.contains(TpmaSa::CONTINUE_SESSION) {
                self.store.evict(&s.context);
            }
        }
    }

    pub(crate) fn usage(&self, msg: String) -> Error {
        tracing::error!("{msg}");
        Error::Usage(msg)
    }
}
