// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM simulator for integration tests.
//!
//! Implements the TPM side of the commands the crate issues: password,
//! HMAC and policy sessions (bound, salted, parameter encryption), objects,
//! NV indices, hierarchy auth changes and TPM2_Clear. Policy digests are
//! tracked but not enforced.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey};
use tpm2_esys::*;


/// Secret used for creation tickets
const PROOF: &[u8] = b"mock-tpm-proof-value";

/// Every RSA object the simulator creates shares this key
pub fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate RSA key")
    })
}

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tpm2_esys=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct MockObject {
    pub public: TpmtPublic,
    pub name: Vec<u8>,
    pub auth: Vec<u8>,
    pub hierarchy: u32,
}

#[derive(Debug, Clone)]
pub struct MockNv {
    pub public: TpmsNvPublic,
    pub auth: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockSession {
    hash: TpmAlgId,
    session_type: TpmSe,
    bound: Option<Vec<u8>>,
    key: Vec<u8>,
    nonce_tpm: Vec<u8>,
    symmetric: TpmtSymDef,
    auth_value_needed: bool,
    password_needed: bool,
    policy_digest: Vec<u8>,
}

struct CmdSession {
    handle: u32,
    nonce_caller: Vec<u8>,
    attrs: u8,
    hmac: Vec<u8>,
}

/// Per-command view of a session after the command was authorized
struct ActiveSession {
    handle: u32,
    attrs: u8,
    nonce_caller: Vec<u8>,
    include: bool,
    password: bool,
    entity: Option<u32>,
    auth_before: Vec<u8>,
}

pub struct MockTpm {
    pub objects: BTreeMap<u32, MockObject>,
    pub nv: BTreeMap<u32, MockNv>,
    sessions: HashMap<u32, MockSession>,
    privates: HashMap<Vec<u8>, Vec<u8>>,
    pub hierarchy_auth: HashMap<u32, Vec<u8>>,
    pub clear_disabled: bool,
    /// Every command code received, in order
    pub commands: Vec<TpmCc>,
    /// Reply to the next command with this response code
    pub fail_next: Option<u32>,
    /// Flip a bit of the first response HMAC of the next command
    pub corrupt_next_response: bool,
    /// Report a wrong Name for the next object loaded or created
    pub corrupt_next_name: bool,
    /// Reject TPM2_GetCapability
    pub fail_capabilities: bool,
    /// Fail every transmit at the transport level
    pub transport_down: bool,
    /// Handles returned per TPM2_GetCapability response
    pub capability_page: usize,
    next_transient: u32,
    next_session: u32,
}

impl Default for MockTpm {
    fn default() -> Self {
        Self::new()
    }
}

fn rc_h(code: u32, n: usize) -> u32 {
    code | ((n as u32) << 8)
}

fn rc_p(code: u32, n: usize) -> u32 {
    code | tpm_rc::P | ((n as u32) << 8)
}

fn rc_s(code: u32, n: usize) -> u32 {
    code | tpm_rc::S | ((n as u32) << 8)
}

trait OrRc<T> {
    fn rc(self) -> Result<T, u32>;
}

impl<T> OrRc<T> for tpm2_esys::Result<T> {
    fn rc(self) -> Result<T, u32> {
        self.map_err(|_| rc_p(tpm_rc::SIZE, 1))
    }
}

impl<T> OrRc<T> for Result<T, u32> {
    fn rc(self) -> Result<T, u32> {
        self
    }
}

/// Handles and authorizations of each supported command
fn shape(cc: TpmCc) -> (usize, usize) {
    match cc {
        TpmCc::StartAuthSession => (2, 0),
        TpmCc::FlushContext | TpmCc::GetCapability => (0, 0),
        TpmCc::PolicyAuthValue | TpmCc::PolicyPassword | TpmCc::PolicyGetDigest => (1, 0),
        TpmCc::ReadPublic | TpmCc::NvReadPublic => (1, 0),
        TpmCc::CreatePrimary
        | TpmCc::Create
        | TpmCc::Load
        | TpmCc::NvDefineSpace
        | TpmCc::NvGlobalWriteLock
        | TpmCc::Clear
        | TpmCc::ClearControl
        | TpmCc::HierarchyChangeAuth => (1, 1),
        TpmCc::EvictControl
        | TpmCc::CertifyCreation
        | TpmCc::NvUndefineSpace
        | TpmCc::NvWrite
        | TpmCc::NvRead
        | TpmCc::NvWriteLock
        | TpmCc::NvReadLock => (2, 1),
    }
}

fn first_param(params: &mut [u8]) -> Option<&mut [u8]> {
    if params.len() < 2 {
        return None;
    }
    let size = u16::from_be_bytes([params[0], params[1]]) as usize;
    params.get_mut(2..2 + size)
}

fn hmac_key(key: &[u8], auth: &[u8], include: bool) -> Vec<u8> {
    let mut out = key.to_vec();
    if include {
        out.extend_from_slice(tpm_crypto::trim(auth));
    }
    out
}

fn ticket_digest(name: &[u8], creation_hash: &[u8]) -> Vec<u8> {
    tpm_crypto::hmac(
        TpmAlgId::Sha256,
        PROOF,
        &[&TpmSt::Creation.to_u16().to_be_bytes(), name, creation_hash],
    )
    .expect("sha256 hmac")
}

impl MockTpm {
    pub fn new() -> Self {
        let hierarchy_auth = [
            tpm_rh::OWNER,
            tpm_rh::ENDORSEMENT,
            tpm_rh::PLATFORM,
            tpm_rh::LOCKOUT,
        ]
        .into_iter()
        .map(|h| (h, Vec::new()))
        .collect();
        Self {
            objects: BTreeMap::new(),
            nv: BTreeMap::new(),
            sessions: HashMap::new(),
            privates: HashMap::new(),
            hierarchy_auth,
            clear_disabled: false,
            commands: Vec::new(),
            fail_next: None,
            corrupt_next_response: false,
            corrupt_next_name: false,
            fail_capabilities: false,
            transport_down: false,
            capability_page: 2,
            next_transient: 0x8000_0000,
            next_session: 0,
        }
    }

    pub fn has_session(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Add an object directly, as if created before this test started
    pub fn insert_object(&mut self, handle: u32, public: TpmtPublic, auth: &[u8], hierarchy: u32) {
        let public = fill_unique(public, &handle.to_be_bytes());
        let name = Name::from_object_public(&public).expect("name").into_vec();
        self.objects.insert(
            handle,
            MockObject {
                public,
                name,
                auth: auth.to_vec(),
                hierarchy,
            },
        );
    }

    /// Add an NV index directly, as if defined before this test started
    pub fn insert_nv(&mut self, public: TpmsNvPublic, auth: &[u8]) {
        let data = vec![0xFF; public.data_size as usize];
        self.nv.insert(
            public.nv_index,
            MockNv {
                public,
                auth: auth.to_vec(),
                data,
            },
        );
    }

    fn entity_name(&self, handle: u32) -> Option<Vec<u8>> {
        match TpmHt::from_handle(handle)? {
            TpmHt::Transient | TpmHt::Persistent => {
                self.objects.get(&handle).map(|o| o.name.clone())
            }
            TpmHt::NvIndex => self
                .nv
                .get(&handle)
                .map(|nv| Name::from_nv_public(&nv.public).expect("name").into_vec()),
            TpmHt::HmacSession | TpmHt::PolicySession => self
                .sessions
                .contains_key(&handle)
                .then(|| handle.to_be_bytes().to_vec()),
            TpmHt::Pcr | TpmHt::Permanent => Some(handle.to_be_bytes().to_vec()),
        }
    }

    fn entity_auth(&self, handle: u32) -> Option<Vec<u8>> {
        match TpmHt::from_handle(handle)? {
            TpmHt::Transient | TpmHt::Persistent => self.objects.get(&handle).map(|o| o.auth.clone()),
            TpmHt::NvIndex => self.nv.get(&handle).map(|nv| nv.auth.clone()),
            TpmHt::Permanent => Some(self.hierarchy_auth.get(&handle).cloned().unwrap_or_default()),
            _ => Some(Vec::new()),
        }
    }

    fn execute(&mut self, cmd: &[u8]) -> Result<Vec<u8>, u32> {
        let mut buf = ResponseBuffer::new(cmd);
        let tag = buf.get_u16().rc()?;
        let size = buf.get_u32().rc()? as usize;
        if size != cmd.len() {
            return Err(tpm_rc::SIZE);
        }
        let cc = TpmCc::from_u32(buf.get_u32().rc()?).ok_or(tpm_rc::COMMAND_CODE)?;
        self.commands.push(cc);
        if let Some(rc) = self.fail_next.take() {
            return Err(rc);
        }

        let (nh, nauth) = shape(cc);
        let mut handles = Vec::with_capacity(nh);
        let mut names = Vec::with_capacity(nh);
        for i in 0..nh {
            let h = buf.get_u32().rc()?;
            names.push(self.entity_name(h).ok_or(rc_h(tpm_rc::HANDLE, i + 1))?);
            handles.push(h);
        }

        let mut cmd_sessions = Vec::new();
        let with_sessions = tag == TpmSt::Sessions.to_u16();
        if with_sessions {
            let auth_size = buf.get_u32().rc()? as usize;
            let area = buf.get_bytes(auth_size).rc()?;
            let mut ab = ResponseBuffer::new(&area);
            while ab.remaining() > 0 {
                cmd_sessions.push(CmdSession {
                    handle: ab.get_u32().rc()?,
                    nonce_caller: ab.get_tpm2b().rc()?,
                    attrs: ab.get_u8().rc()?,
                    hmac: ab.get_tpm2b().rc()?,
                });
            }
        } else if tag != TpmSt::NoSessions.to_u16() {
            return Err(tpm_rc::TAG);
        }
        if cmd_sessions.len() < nauth {
            return Err(tpm_rc::AUTH_MISSING);
        }
        if cmd_sessions.len() > 3 {
            return Err(tpm_rc::AUTHSIZE);
        }
        let mut params = buf.get_remaining();

        let decrypt = cmd_sessions
            .iter()
            .position(|s| s.attrs & TpmaSa::DECRYPT != 0);
        let encrypt = cmd_sessions
            .iter()
            .position(|s| s.attrs & TpmaSa::ENCRYPT != 0);

        let mut active = Vec::with_capacity(cmd_sessions.len());
        for (i, s) in cmd_sessions.iter().enumerate() {
            let entity = (i < nauth).then(|| handles[i]);
            let auth_before = entity
                .and_then(|h| self.entity_auth(h))
                .unwrap_or_default();

            if s.handle == tpm_rh::PW {
                if entity.is_none()
                    || tpm_crypto::trim(&s.hmac) != tpm_crypto::trim(&auth_before)
                {
                    return Err(rc_s(tpm_rc::AUTH_FAIL, i + 1));
                }
                active.push(ActiveSession {
                    handle: tpm_rh::PW,
                    attrs: s.attrs,
                    nonce_caller: Vec::new(),
                    include: false,
                    password: true,
                    entity,
                    auth_before,
                });
                continue;
            }

            let sess = self
                .sessions
                .get(&s.handle)
                .cloned()
                .ok_or(tpm_rc::REFERENCE_S0 + i as u32)?;
            let include = match (entity, sess.session_type) {
                (None, _) => false,
                (Some(_), TpmSe::Hmac) => {
                    sess.bound.as_deref()
                        != Some(tpm_crypto::bound_entity(&names[i], &auth_before).as_slice())
                }
                (Some(_), TpmSe::Policy) => sess.auth_value_needed,
                (Some(_), TpmSe::Trial) => false,
            };
            let password = entity.is_some() && sess.password_needed;
            if password {
                if tpm_crypto::trim(&s.hmac) != tpm_crypto::trim(&auth_before) {
                    return Err(rc_s(tpm_rc::AUTH_FAIL, i + 1));
                }
            } else {
                let code = cc.to_u32().to_be_bytes();
                let mut cp: Vec<&[u8]> = vec![&code];
                cp.extend(names.iter().map(Vec::as_slice));
                cp.push(&params);
                let cp_hash = tpm_crypto::digest(sess.hash, &cp).rc()?;

                let mut extra = Vec::new();
                if i == 0 {
                    for j in [decrypt, encrypt.filter(|e| Some(*e) != decrypt)]
                        .into_iter()
                        .flatten()
                        .filter(|j| *j != 0)
                    {
                        if let Some(other) = self.sessions.get(&cmd_sessions[j].handle) {
                            extra.push(other.nonce_tpm.clone());
                        }
                    }
                }
                let attrs = [s.attrs];
                let mut parts: Vec<&[u8]> = vec![&cp_hash, &s.nonce_caller, &sess.nonce_tpm];
                parts.extend(extra.iter().map(Vec::as_slice));
                parts.push(&attrs);
                let expected =
                    tpm_crypto::hmac(sess.hash, &hmac_key(&sess.key, &auth_before, include), &parts)
                        .rc()?;
                if expected != s.hmac {
                    return Err(rc_s(tpm_rc::AUTH_FAIL, i + 1));
                }
            }
            active.push(ActiveSession {
                handle: s.handle,
                attrs: s.attrs,
                nonce_caller: s.nonce_caller.clone(),
                include,
                password,
                entity,
                auth_before,
            });
        }

        if let Some(i) = decrypt {
            let a = &active[i];
            let sess = self.sessions.get(&a.handle).ok_or(rc_s(tpm_rc::ATTRIBUTES, i + 1))?;
            let data = first_param(&mut params).ok_or(rc_p(tpm_rc::SIZE, 1))?;
            tpm_crypto::param_crypt(
                &sess.symmetric,
                sess.hash,
                &hmac_key(&sess.key, &a.auth_before, a.include),
                &a.nonce_caller,
                &sess.nonce_tpm,
                data,
                true,
            )
            .rc()?;
        }

        let (rsp_handles, mut rsp_params) = self.dispatch(cc, &handles, &params)?;

        let mut new_nonces = Vec::with_capacity(active.len());
        for a in &active {
            let nonce = match self.sessions.get(&a.handle) {
                Some(sess) if a.handle != tpm_rh::PW => tpm_crypto::random(sess.hash.digest_size()),
                _ => Vec::new(),
            };
            new_nonces.push(nonce);
        }

        let auth_after: Vec<Vec<u8>> = active
            .iter()
            .map(|a| {
                a.entity
                    .and_then(|h| self.entity_auth(h))
                    .unwrap_or_else(|| a.auth_before.clone())
            })
            .collect();

        if let Some(i) = encrypt {
            let a = &active[i];
            if let Some(sess) = self.sessions.get(&a.handle) {
                let data = first_param(&mut rsp_params).ok_or(rc_p(tpm_rc::SIZE, 1))?;
                tpm_crypto::param_crypt(
                    &sess.symmetric,
                    sess.hash,
                    &hmac_key(&sess.key, &auth_after[i], a.include),
                    &new_nonces[i],
                    &a.nonce_caller,
                    data,
                    false,
                )
                .rc()?;
            }
        }

        let mut rsp = CommandBuffer::new();
        rsp.put_u16(if with_sessions {
            TpmSt::Sessions.to_u16()
        } else {
            TpmSt::NoSessions.to_u16()
        });
        rsp.put_u32(0);
        rsp.put_u32(tpm_rc::SUCCESS);
        for h in &rsp_handles {
            rsp.put_u32(*h);
        }
        if with_sessions {
            rsp.put_u32(rsp_params.len() as u32);
        }
        rsp.put_bytes(&rsp_params);

        for (i, a) in active.iter().enumerate() {
            if a.handle == tpm_rh::PW {
                rsp.put_tpm2b_empty();
                rsp.put_u8(TpmaSa::CONTINUE_SESSION);
                rsp.put_tpm2b_empty();
                continue;
            }
            let Some(sess) = self.sessions.get_mut(&a.handle) else {
                continue;
            };
            let mut hmac = if a.password {
                Vec::new()
            } else {
                let rp_hash = tpm_crypto::digest(
                    sess.hash,
                    &[
                        &tpm_rc::SUCCESS.to_be_bytes(),
                        &cc.to_u32().to_be_bytes(),
                        &rsp_params,
                    ],
                )
                .rc()?;
                tpm_crypto::hmac(
                    sess.hash,
                    &hmac_key(&sess.key, &auth_after[i], a.include),
                    &[&rp_hash, &new_nonces[i], &a.nonce_caller, &[a.attrs]],
                )
                .rc()?
            };
            if i == 0 && self.corrupt_next_response && !hmac.is_empty() {
                hmac[0] ^= 0x01;
            }
            sess.nonce_tpm = new_nonces[i].clone();
            rsp.put_tpm2b(&new_nonces[i]);
            rsp.put_u8(a.attrs);
            rsp.put_tpm2b(&hmac);
            if a.attrs & TpmaSa::CONTINUE_SESSION == 0 {
                self.sessions.remove(&a.handle);
            }
        }
        self.corrupt_next_response = false;

        let len = rsp.len() as u32;
        rsp.update_u32(2, len);
        Ok(rsp.into_vec())
    }

    fn reported_name(&mut self, name: &[u8]) -> Vec<u8> {
        let mut reported = name.to_vec();
        if std::mem::take(&mut self.corrupt_next_name) {
            if let Some(last) = reported.last_mut() {
                *last ^= 0x01;
            }
        }
        reported
    }

    fn dispatch(&mut self, cc: TpmCc, handles: &[u32], params: &[u8]) -> Result<(Vec<u32>, Vec<u8>), u32> {
        let mut p = ResponseBuffer::new(params);
        let mut out = CommandBuffer::new();
        let mut out_handles = Vec::new();

        match cc {
            TpmCc::StartAuthSession => {
                let nonce_caller = p.get_tpm2b().rc()?;
                let encrypted_salt = p.get_tpm2b().rc()?;
                let session_type = TpmSe::from_u8(p.get_u8().rc()?).ok_or(rc_p(tpm_rc::VALUE, 3))?;
                let symmetric = TpmtSymDef::unmarshal(&mut p).rc()?;
                let hash = TpmAlgId::from_u16(p.get_u16().rc()?)
                    .filter(|a| a.is_hash())
                    .ok_or(rc_p(tpm_rc::HASH, 5))?;

                let salt = if handles[0] == tpm_rh::NULL {
                    Vec::new()
                } else {
                    let key = self.objects.get(&handles[0]).ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                    if key.public.type_alg != TpmAlgId::Rsa {
                        return Err(rc_h(tpm_rc::ATTRIBUTES, 1));
                    }
                    let padding = match key.public.name_alg {
                        TpmAlgId::Sha1 => Oaep::new_with_label::<sha1::Sha1, _>(tpm_crypto::SECRET_LABEL),
                        _ => Oaep::new_with_label::<sha2::Sha256, _>(tpm_crypto::SECRET_LABEL),
                    };
                    rsa_key()
                        .decrypt(padding, &encrypted_salt)
                        .map_err(|_| rc_p(tpm_rc::VALUE, 2))?
                };
                let (bound, bind_auth) = if handles[1] == tpm_rh::NULL {
                    (None, Vec::new())
                } else {
                    let name = self.entity_name(handles[1]).ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                    let auth = self.entity_auth(handles[1]).unwrap_or_default();
                    (Some(tpm_crypto::bound_entity(&name, &auth)), auth)
                };

                let nonce_tpm = tpm_crypto::random(hash.digest_size());
                let key = if bound.is_some() || !salt.is_empty() {
                    let mut material = tpm_crypto::trim(&bind_auth).to_vec();
                    material.extend_from_slice(&salt);
                    tpm_crypto::kdfa(
                        hash,
                        &material,
                        b"ATH",
                        &nonce_tpm,
                        &nonce_caller,
                        hash.digest_size() as u32 * 8,
                    )?
                } else {
                    Vec::new()
                };

                self.next_session += 1;
                let base = if session_type == TpmSe::Hmac {
                    TpmHt::HmacSession
                } else {
                    TpmHt::PolicySession
                };
                let handle = base.base_handle() | self.next_session;
                self.sessions.insert(
                    handle,
                    MockSession {
                        hash,
                        session_type,
                        bound,
                        key,
                        nonce_tpm: nonce_tpm.clone(),
                        symmetric,
                        auth_value_needed: false,
                        password_needed: false,
                        policy_digest: vec![0; hash.digest_size()],
                    },
                );
                out_handles.push(handle);
                out.put_tpm2b(&nonce_tpm);
            }
            TpmCc::FlushContext => {
                let handle = p.get_u32().rc()?;
                let removed = match TpmHt::from_handle(handle) {
                    Some(TpmHt::Transient) => self.objects.remove(&handle).is_some(),
                    Some(TpmHt::HmacSession | TpmHt::PolicySession) => {
                        self.sessions.remove(&handle).is_some()
                    }
                    _ => false,
                };
                if !removed {
                    return Err(rc_p(tpm_rc::HANDLE, 1));
                }
            }
            TpmCc::PolicyAuthValue | TpmCc::PolicyPassword => {
                let sess = self
                    .sessions
                    .get_mut(&handles[0])
                    .filter(|s| s.session_type != TpmSe::Hmac)
                    .ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                let digest = tpm_crypto::digest(
                    sess.hash,
                    &[&sess.policy_digest, &TpmCc::PolicyAuthValue.to_u32().to_be_bytes()],
                )
                .rc()?;
                sess.policy_digest = digest;
                if cc == TpmCc::PolicyAuthValue {
                    sess.auth_value_needed = true;
                    sess.password_needed = false;
                } else {
                    sess.password_needed = true;
                    sess.auth_value_needed = false;
                }
            }
            TpmCc::PolicyGetDigest => {
                let sess = self
                    .sessions
                    .get(&handles[0])
                    .filter(|s| s.session_type != TpmSe::Hmac)
                    .ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                out.put_tpm2b(&sess.policy_digest);
            }
            TpmCc::CreatePrimary => {
                let hierarchy = handles[0];
                if !matches!(
                    hierarchy,
                    tpm_rh::OWNER | tpm_rh::ENDORSEMENT | tpm_rh::PLATFORM | tpm_rh::NULL
                ) {
                    return Err(rc_h(tpm_rc::VALUE, 1));
                }
                let sensitive: TpmsSensitiveCreate = p.get_sized().rc()?;
                let template: TpmtPublic = p.get_sized().rc()?;
                let outside_info = p.get_tpm2b().rc()?;
                let _pcrs = TpmlPcrSelection::unmarshal(&mut p).rc()?;

                let public = fill_unique(template, &sensitive.data);
                let name = Name::from_object_public(&public).rc()?.into_vec();
                let handle = self.allocate_transient();
                let (data, hash, ticket) = self.creation(
                    &public,
                    &name,
                    TpmAlgId::Null,
                    &hierarchy.to_be_bytes(),
                    hierarchy,
                    &outside_info,
                )?;
                self.objects.insert(
                    handle,
                    MockObject {
                        public: public.clone(),
                        name: name.clone(),
                        auth: sensitive.user_auth,
                        hierarchy,
                    },
                );
                out_handles.push(handle);
                out.put_sized(&public);
                out.put_tpm2b(&data);
                out.put_tpm2b(&hash);
                ticket.marshal(&mut out);
                out.put_tpm2b(&self.reported_name(&name));
            }
            TpmCc::Create => {
                let parent = self.objects.get(&handles[0]).cloned().ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                let sensitive: TpmsSensitiveCreate = p.get_sized().rc()?;
                let template: TpmtPublic = p.get_sized().rc()?;
                let outside_info = p.get_tpm2b().rc()?;
                let _pcrs = TpmlPcrSelection::unmarshal(&mut p).rc()?;

                let public = fill_unique(template, &sensitive.data);
                let name = Name::from_object_public(&public).rc()?.into_vec();
                let (data, hash, ticket) = self.creation(
                    &public,
                    &name,
                    parent.public.name_alg,
                    &parent.name,
                    parent.hierarchy,
                    &outside_info,
                )?;
                let private = tpm_crypto::random(32);
                self.privates.insert(private.clone(), sensitive.user_auth);
                out.put_tpm2b(&private);
                out.put_sized(&public);
                out.put_tpm2b(&data);
                out.put_tpm2b(&hash);
                ticket.marshal(&mut out);
            }
            TpmCc::Load => {
                let parent = self.objects.get(&handles[0]).cloned().ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                let private = Tpm2bPrivate::unmarshal(&mut p).rc()?;
                let public: TpmtPublic = p.get_sized().rc()?;
                let auth = self
                    .privates
                    .get(&private.buffer)
                    .cloned()
                    .ok_or(rc_p(tpm_rc::VALUE, 1))?;
                let name = Name::from_object_public(&public).rc()?.into_vec();
                let handle = self.allocate_transient();
                self.objects.insert(
                    handle,
                    MockObject {
                        public,
                        name: name.clone(),
                        auth,
                        hierarchy: parent.hierarchy,
                    },
                );
                out_handles.push(handle);
                out.put_tpm2b(&self.reported_name(&name));
            }
            TpmCc::ReadPublic => {
                let obj = self.objects.get(&handles[0]).ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                out.put_sized(&obj.public);
                out.put_tpm2b(&obj.name);
                out.put_tpm2b(&obj.name);
            }
            TpmCc::EvictControl => {
                let persistent = p.get_u32().rc()?;
                let obj = self.objects.get(&handles[1]).cloned().ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                if TpmHt::from_handle(handles[1]) == Some(TpmHt::Persistent) {
                    if persistent != handles[1] {
                        return Err(rc_p(tpm_rc::HANDLE, 1));
                    }
                    self.objects.remove(&persistent);
                } else {
                    if TpmHt::from_handle(persistent) != Some(TpmHt::Persistent) {
                        return Err(rc_p(tpm_rc::VALUE, 1));
                    }
                    if self.objects.contains_key(&persistent) {
                        return Err(tpm_rc::NV_DEFINED);
                    }
                    self.objects.insert(persistent, obj);
                }
            }
            TpmCc::CertifyCreation => {
                let signer = self.objects.get(&handles[0]).cloned().ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                let object = self.objects.get(&handles[1]).cloned().ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                let qualifying = p.get_tpm2b().rc()?;
                let creation_hash = p.get_tpm2b().rc()?;
                let _scheme = TpmtScheme::unmarshal(&mut p).rc()?;
                let ticket = TpmtTkCreation::unmarshal(&mut p).rc()?;
                if ticket.tag != TpmSt::Creation.to_u16()
                    || ticket.digest.buffer != ticket_digest(&object.name, &creation_hash)
                {
                    return Err(rc_p(tpm_rc::VALUE, 4));
                }

                let mut attest = CommandBuffer::new();
                attest.put_u32(TPM_GENERATED_VALUE);
                attest.put_u16(TPM_ST_ATTEST_CREATION);
                attest.put_tpm2b(&signer.name);
                attest.put_tpm2b(&qualifying);
                attest.put_u64(1000);
                attest.put_u32(1);
                attest.put_u32(0);
                attest.put_u8(1);
                attest.put_u64(0x2025_0001);
                attest.put_tpm2b(&object.name);
                attest.put_tpm2b(&creation_hash);
                let attest = attest.into_vec();

                let digest = tpm_crypto::digest(TpmAlgId::Sha256, &[&attest]).rc()?;
                let sig = rsa_key()
                    .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
                    .map_err(|_| tpm_rc::FAILURE)?;
                out.put_tpm2b(&attest);
                out.put_u16(TpmAlgId::RsaSsa.to_u16());
                out.put_u16(TpmAlgId::Sha256.to_u16());
                out.put_tpm2b(&sig);
            }
            TpmCc::NvDefineSpace => {
                let auth = p.get_tpm2b().rc()?;
                let public: TpmsNvPublic = p.get_sized().rc()?;
                let platform = handles[0] == tpm_rh::PLATFORM;
                if platform != public.attributes.contains(TpmaNv::PLATFORM_CREATE) {
                    return Err(rc_p(tpm_rc::ATTRIBUTES, 2));
                }
                if self.nv.contains_key(&public.nv_index) {
                    return Err(tpm_rc::NV_DEFINED);
                }
                self.insert_nv(public, &auth);
            }
            TpmCc::NvUndefineSpace => {
                self.nv.remove(&handles[1]).ok_or(rc_h(tpm_rc::HANDLE, 2))?;
            }
            TpmCc::NvReadPublic => {
                let nv = self.nv.get(&handles[0]).ok_or(rc_h(tpm_rc::HANDLE, 1))?;
                out.put_sized(&nv.public);
                out.put_tpm2b(&Name::from_nv_public(&nv.public).rc()?.into_vec());
            }
            TpmCc::NvWrite => {
                let data = p.get_tpm2b().rc()?;
                let offset = p.get_u16().rc()? as usize;
                let nv = self.nv.get_mut(&handles[1]).ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                if nv.public.attributes.contains(TpmaNv::WRITELOCKED) {
                    return Err(tpm_rc::NV_LOCKED);
                }
                if offset + data.len() > nv.data.len() {
                    return Err(tpm_rc::NV_RANGE);
                }
                nv.data[offset..offset + data.len()].copy_from_slice(&data);
                nv.public.attributes.0 |= TpmaNv::WRITTEN;
            }
            TpmCc::NvRead => {
                let size = p.get_u16().rc()? as usize;
                let offset = p.get_u16().rc()? as usize;
                let nv = self.nv.get(&handles[1]).ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                if nv.public.attributes.contains(TpmaNv::READ_LOCKED) {
                    return Err(tpm_rc::NV_LOCKED);
                }
                if !nv.public.attributes.contains(TpmaNv::WRITTEN) {
                    return Err(tpm_rc::NV_UNINITIALIZED);
                }
                if offset + size > nv.data.len() {
                    return Err(tpm_rc::NV_RANGE);
                }
                out.put_tpm2b(&nv.data[offset..offset + size]);
            }
            TpmCc::NvWriteLock | TpmCc::NvReadLock => {
                let nv = self.nv.get_mut(&handles[1]).ok_or(rc_h(tpm_rc::HANDLE, 2))?;
                nv.public.attributes.0 |= if cc == TpmCc::NvWriteLock {
                    TpmaNv::WRITELOCKED
                } else {
                    TpmaNv::READ_LOCKED
                };
            }
            TpmCc::NvGlobalWriteLock => {
                for nv in self.nv.values_mut() {
                    if nv.public.attributes.contains(TpmaNv::GLOBALLOCK) {
                        nv.public.attributes.0 |= TpmaNv::WRITELOCKED;
                    }
                }
            }
            TpmCc::Clear => {
                if !matches!(handles[0], tpm_rh::LOCKOUT | tpm_rh::PLATFORM) {
                    return Err(rc_h(tpm_rc::HANDLE, 1));
                }
                if self.clear_disabled {
                    return Err(tpm_rc::DISABLED);
                }
                self.objects
                    .retain(|_, o| !matches!(o.hierarchy, tpm_rh::OWNER | tpm_rh::ENDORSEMENT));
                self.nv
                    .retain(|_, nv| nv.public.attributes.contains(TpmaNv::PLATFORM_CREATE));
                for h in [tpm_rh::OWNER, tpm_rh::ENDORSEMENT, tpm_rh::LOCKOUT] {
                    self.hierarchy_auth.insert(h, Vec::new());
                }
            }
            TpmCc::ClearControl => {
                if !matches!(handles[0], tpm_rh::LOCKOUT | tpm_rh::PLATFORM) {
                    return Err(rc_h(tpm_rc::HANDLE, 1));
                }
                self.clear_disabled = p.get_u8().rc()? != 0;
            }
            TpmCc::HierarchyChangeAuth => {
                let new_auth = p.get_tpm2b().rc()?;
                if !self.hierarchy_auth.contains_key(&handles[0]) {
                    return Err(rc_h(tpm_rc::HANDLE, 1));
                }
                self.hierarchy_auth.insert(handles[0], new_auth);
            }
            TpmCc::GetCapability => {
                if self.fail_capabilities {
                    return Err(rc_p(tpm_rc::VALUE, 1));
                }
                let capability = p.get_u32().rc()?;
                let property = p.get_u32().rc()?;
                let count = p.get_u32().rc()? as usize;
                if capability != TpmCap::Handles as u32 {
                    return Err(rc_p(tpm_rc::VALUE, 1));
                }
                let top = property & 0xFF00_0000;
                let all: Vec<u32> = self
                    .objects
                    .keys()
                    .chain(self.nv.keys())
                    .chain(self.sessions.keys())
                    .copied()
                    .filter(|h| h & 0xFF00_0000 == top && *h >= property)
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let n = count.min(self.capability_page);
                let page = &all[..n.min(all.len())];
                out.put_u8((all.len() > page.len()) as u8);
                out.put_u32(TpmCap::Handles as u32);
                out.put_u32(page.len() as u32);
                for h in page {
                    out.put_u32(*h);
                }
            }
        }
        Ok((out_handles, out.into_vec()))
    }

    fn allocate_transient(&mut self) -> u32 {
        loop {
            let handle = self.next_transient;
            self.next_transient += 1;
            if !self.objects.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Creation data, its hash and the creation ticket
    fn creation(
        &self,
        public: &TpmtPublic,
        name: &[u8],
        parent_name_alg: TpmAlgId,
        parent_name: &[u8],
        hierarchy: u32,
        outside_info: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, TpmtTkCreation), u32> {
        let mut data = CommandBuffer::new();
        TpmlPcrSelection::default().marshal(&mut data);
        data.put_tpm2b_empty();
        data.put_u8(0);
        data.put_u16(parent_name_alg.to_u16());
        data.put_tpm2b(parent_name);
        data.put_tpm2b(parent_name);
        data.put_tpm2b(outside_info);
        let data = data.into_vec();
        let hash = tpm_crypto::digest(public.name_alg, &[&data]).rc()?;
        let ticket = TpmtTkCreation {
            tag: TpmSt::Creation.to_u16(),
            hierarchy,
            digest: Tpm2bDigest::new(ticket_digest(name, &hash)),
        };
        Ok((data, hash, ticket))
    }
}

/// Fill in the unique field the way key generation would
fn fill_unique(mut public: TpmtPublic, seed: &[u8]) -> TpmtPublic {
    let template = public.to_bytes();
    let derive = |label: &[u8]| {
        tpm_crypto::digest(TpmAlgId::Sha256, &[label, &template, seed]).expect("sha256")
    };
    public.unique = match public.type_alg {
        TpmAlgId::Rsa => {
            if let TpmtPublicParms::Rsa(parms) = &mut public.parameters {
                parms.key_bits = 1024;
                parms.exponent = 0;
            }
            TpmtPublicUnique::Rsa(rsa_key().n().to_bytes_be())
        }
        TpmAlgId::Ecc => TpmtPublicUnique::Ecc(derive(b"x"), derive(b"y")),
        TpmAlgId::KeyedHash => TpmtPublicUnique::KeyedHash(derive(b"keyedhash")),
        _ => TpmtPublicUnique::Sym(derive(b"sym")),
    };
    public
}

impl Transport for MockTpm {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.transport_down {
            return Err(TransportError::Closed);
        }
        match self.execute(command) {
            Ok(rsp) => Ok(rsp),
            Err(rc) => {
                let mut rsp = Vec::with_capacity(10);
                rsp.extend_from_slice(&TpmSt::NoSessions.to_u16().to_be_bytes());
                rsp.extend_from_slice(&10u32.to_be_bytes());
                rsp.extend_from_slice(&rc.to_be_bytes());
                Ok(rsp)
            }
        }
    }
}

pub type Tpm = TpmContext<MockTpm>;

pub fn mock_tpm() -> Tpm {
    tracing_init();
    TpmContext::with_transport(MockTpm::new())
}

/// A continuing session use carrying `auth`
pub fn use_session(session: &SessionContext, auth: &[u8]) -> Authorization {
    session
        .with_attrs(TpmaSa::new().with_continue_session())
        .with_auth_value(auth)
        .into()
}

/// Create an RSA storage primary in `hierarchy`
pub fn storage_primary(tpm: &mut Tpm, hierarchy: &ResourceContext, auth: &Authorization) -> ResourceContext {
    let (ctx, _) = tpm
        .create_primary(
            hierarchy,
            &TpmsSensitiveCreate::default(),
            &TpmtPublic::rsa_storage_key(),
            &[],
            &TpmlPcrSelection::default(),
            auth,
            &[],
        )
        .expect("create primary");
    ctx
}

/// An RSA signing key template
pub fn rsa_signing_key() -> TpmtPublic {
    TpmtPublic {
        type_alg: TpmAlgId::Rsa,
        name_alg: TpmAlgId::Sha256,
        object_attributes: TpmaObject::new()
            .with_fixed_tpm()
            .with_fixed_parent()
            .with_sensitive_data_origin()
            .with_user_with_auth()
            .with_sign_encrypt(),
        auth_policy: Tpm2bDigest::empty(),
        parameters: TpmtPublicParms::Rsa(TpmsRsaParms {
            symmetric: TpmtSymDef::Null,
            scheme: TpmtScheme::with_hash(TpmAlgId::RsaSsa, TpmAlgId::Sha256),
            key_bits: 2048,
            exponent: 0,
        }),
        unique: TpmtPublicUnique::Rsa(Vec::new()),
    }
}
