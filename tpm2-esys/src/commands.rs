// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! [`TpmContext`] owns the transport and the table of tracked resources.
//! Every command goes through the authorization pipeline.

use tracing::{debug, warn};

use crate::config::TpmConfig;
use crate::constants::*;
use crate::device::{TpmDevice, Transport};
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::name::Name;
use crate::pipeline::Command;
use crate::reconcile::Effect;
use crate::resources::{ResourceContext, ResourceKind, ResourceStore};
use crate::session::{Authorization, Session};
use crate::types::*;

/// Largest chunk moved by one NV_Read or NV_Write
pub const MAX_NV_BUFFER_SIZE: usize = 1024;

/// Output shared by the object creating commands
#[derive(Debug, Clone)]
pub struct CreationOutput {
    pub creation_data: CreationData,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TpmtTkCreation,
}

impl CreationOutput {
    pub(crate) fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            creation_data: CreationData {
                raw: buf.get_tpm2b()?,
            },
            creation_hash: buf.get_tpm2b()?,
            creation_ticket: TpmtTkCreation::unmarshal(buf)?,
        })
    }
}

/// Result of TPM2_Create
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub out_private: Tpm2bPrivate,
    pub out_public: TpmtPublic,
    pub creation: CreationOutput,
}

/// Result of TPM2_CertifyCreation
#[derive(Debug, Clone)]
pub struct CertifyCreationOutput {
    /// Marshaled TPMS_ATTEST as signed by the TPM
    pub certify_info: Vec<u8>,
    pub attest: TpmsAttest,
    pub signature: TpmtSignature,
}

/// Pure Rust TPM context
pub struct TpmContext<T: Transport = TpmDevice> {
    pub(crate) transport: T,
    pub(crate) store: ResourceStore,
    pub(crate) config: TpmConfig,
}

impl TpmContext<TpmDevice> {
    /// Open the TPM device named by the configuration, or autodetect one
    pub fn open(config: &TpmConfig) -> Result<Self> {
        let device = match config.tcti.as_deref() {
            Some(path) => TpmDevice::open_with_limit(path, config.max_response_size)?,
            None => TpmDevice::detect_with_limit(config.max_response_size)?,
        };
        debug!("using TPM device {}", device.path());
        Ok(Self::with_config(device, config.clone()))
    }

    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        Self::open(&TpmConfig::from_tcti(tcti_path))
    }

    pub fn device_path(&self) -> &str {
        self.transport.path()
    }
}

impl<T: Transport> TpmContext<T> {
    pub fn with_transport(transport: T) -> Self {
        Self::with_config(transport, TpmConfig::default())
    }

    pub fn with_config(transport: T, config: TpmConfig) -> Self {
        Self {
            transport,
            store: ResourceStore::new(),
            config,
        }
    }

    pub fn config(&self) -> &TpmConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Invalidate every tracked context and release the transport
    pub fn close(self) {
        debug!("closing TPM context with {} tracked resources", self.store.len());
    }

    // ==================== Resource Contexts ====================

    pub fn owner_handle_context(&self) -> ResourceContext {
        ResourceContext::permanent(tpm_rh::OWNER)
    }

    pub fn endorsement_handle_context(&self) -> ResourceContext {
        ResourceContext::permanent(tpm_rh::ENDORSEMENT)
    }

    pub fn platform_handle_context(&self) -> ResourceContext {
        ResourceContext::permanent(tpm_rh::PLATFORM)
    }

    pub fn lockout_handle_context(&self) -> ResourceContext {
        ResourceContext::permanent(tpm_rh::LOCKOUT)
    }

    pub fn null_handle_context(&self) -> ResourceContext {
        ResourceContext::permanent(tpm_rh::NULL)
    }

    /// The tracked context for a handle, if there is one
    pub fn lookup(&self, handle: u32) -> Option<ResourceContext> {
        self.store.lookup(handle)
    }

    pub fn tracked_resources(&self) -> usize {
        self.store.len()
    }

    /// Return a context for an existing TPM entity.
    ///
    /// A tracked context is returned as is. Objects and NV indices are
    /// queried for their public area; permanent handles always succeed.
    /// PCRs and sessions cannot be wrapped.
    pub fn wrap_handle(&mut self, handle: u32) -> Result<ResourceContext> {
        if let Some(ctx) = self.store.lookup(handle) {
            return Ok(ctx);
        }
        match TpmHt::from_handle(handle) {
            Some(TpmHt::Permanent) => Ok(ResourceContext::permanent(handle)),
            Some(TpmHt::NvIndex) => {
                let (public, name) = self
                    .query_nv_public(handle)
                    .map_err(|e| unavailable(handle, e))?;
                Ok(self.store.insert_nv_index(public, name))
            }
            Some(TpmHt::Transient | TpmHt::Persistent) => {
                let (public, name) = self
                    .query_public(handle)
                    .map_err(|e| unavailable(handle, e))?;
                Ok(self.store.insert_object(handle, public, name))
            }
            Some(TpmHt::Pcr) => Err(self.usage(format!("cannot wrap PCR handle 0x{handle:08x}"))),
            Some(TpmHt::HmacSession | TpmHt::PolicySession) => Err(self.usage(format!(
                "cannot wrap session handle 0x{handle:08x}; sessions come from start_auth_session"
            ))),
            None => Err(self.usage(format!("invalid handle 0x{handle:08x}"))),
        }
    }

    /// Stop tracking a context without touching the TPM. Sessions cannot be
    /// forgotten because they could never be flushed afterwards.
    pub fn forget_resource(&mut self, ctx: &ResourceContext) -> Result<()> {
        self.store.check(ctx)?;
        match ctx.kind() {
            ResourceKind::Permanent => Ok(()),
            ResourceKind::Session => Err(self.usage(
                "cannot forget a session context; flush it with flush_context instead".into(),
            )),
            ResourceKind::Object | ResourceKind::NvIndex => {
                self.store.evict(ctx);
                Ok(())
            }
        }
    }

    fn query_public(&mut self, handle: u32) -> Result<(TpmtPublic, Name)> {
        let target = ResourceContext::untracked(handle);
        self.read_public(&target, &[])
    }

    fn query_nv_public(&mut self, handle: u32) -> Result<(TpmsNvPublic, Name)> {
        let target = ResourceContext::untracked(handle);
        self.nv_read_public(&target, &[])
    }

    // ==================== Object Operations ====================

    /// TPM2_ReadPublic. The returned Name is checked against the public area.
    pub fn read_public(&mut self, object: &ResourceContext, sessions: &[Session]) -> Result<(TpmtPublic, Name)> {
        let rsp = self.run_command(
            Command::new(TpmCc::ReadPublic)
                .handle(object)
                .sessions(sessions),
        )?;
        let mut buf = rsp.params();
        let public: TpmtPublic = buf.get_sized()?;
        let name = Name::unmarshal(&mut buf)?;
        let _qualified_name = Name::unmarshal(&mut buf)?;
        check_name(TpmCc::ReadPublic, &name, &Name::from_object_public(&public)?)?;
        Ok((public, name))
    }

    /// TPM2_Create
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        parent: &ResourceContext,
        in_sensitive: &TpmsSensitiveCreate,
        in_public: &TpmtPublic,
        outside_info: &[u8],
        creation_pcr: &TpmlPcrSelection,
        parent_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<CreatedObject> {
        let mut params = CommandBuffer::new();
        params.put_sized(in_sensitive);
        params.put_sized(in_public);
        params.put_tpm2b(outside_info);
        creation_pcr.marshal(&mut params);

        let rsp = self.run_command(
            Command::new(TpmCc::Create)
                .auth_handle(parent, parent_auth)
                .sessions(sessions)
                .params(params),
        )?;
        let mut buf = rsp.params();
        let out_private = Tpm2bPrivate::unmarshal(&mut buf)?;
        let out_public = buf.get_sized()?;
        let creation = CreationOutput::unmarshal(&mut buf)?;
        Ok(CreatedObject {
            out_private,
            out_public,
            creation,
        })
    }

    /// TPM2_Load
    pub fn load(
        &mut self,
        parent: &ResourceContext,
        in_private: &Tpm2bPrivate,
        in_public: &TpmtPublic,
        parent_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<ResourceContext> {
        let mut params = CommandBuffer::new();
        in_private.marshal(&mut params);
        params.put_sized(in_public);

        let rsp = self.run_command(
            Command::new(TpmCc::Load)
                .auth_handle(parent, parent_auth)
                .sessions(sessions)
                .params(params)
                .response_handles(1),
        )?;
        let handle = rsp.handles[0];
        let parsed = check_transient(TpmCc::Load, handle).and_then(|()| {
            let name = Name::unmarshal(&mut rsp.params())?;
            check_name(TpmCc::Load, &name, &Name::from_object_public(in_public)?)?;
            Ok(name)
        });
        let name = match parsed {
            Ok(name) => name,
            Err(e) => {
                self.discard_transient(handle);
                return Err(e);
            }
        };

        debug!("loaded object with handle 0x{:08x}", handle);
        Ok(self.store.insert_object(handle, in_public.clone(), name))
    }

    /// TPM2_EvictControl.
    ///
    /// For a transient object, persists it at `persistent_handle` and returns
    /// the new context. For a persistent object, removes it and returns
    /// `None`.
    pub fn evict_control(
        &mut self,
        auth: &ResourceContext,
        object: &ResourceContext,
        persistent_handle: u32,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<Option<ResourceContext>> {
        let mut params = CommandBuffer::new();
        params.put_u32(persistent_handle);
        self.run_command(
            Command::new(TpmCc::EvictControl)
                .auth_handle(auth, auth_auth)
                .handle(object)
                .sessions(sessions)
                .params(params),
        )?;

        if TpmHt::from_handle(object.handle()) == Some(TpmHt::Persistent) {
            debug!("removed persistent object 0x{:08x}", object.handle());
            self.store.evict(object);
            return Ok(None);
        }
        let public = object.object_public().ok_or_else(|| {
            self.usage("evict_control needs an object context with a public area".into())
        })?;
        debug!("made object persistent at 0x{:08x}", persistent_handle);
        Ok(Some(self.store.insert_object(
            persistent_handle,
            public,
            object.name(),
        )))
    }

    /// TPM2_FlushContext for a transient object or a session
    pub fn flush_context(&mut self, ctx: &ResourceContext) -> Result<()> {
        self.store.check(ctx)?;
        let flushable = match ctx.kind() {
            ResourceKind::Session => true,
            ResourceKind::Object => TpmHt::from_handle(ctx.handle()) == Some(TpmHt::Transient),
            _ => false,
        };
        if !flushable {
            return Err(self.usage(format!(
                "cannot flush {:?} context 0x{:08x}",
                ctx.kind(),
                ctx.handle()
            )));
        }

        let mut params = CommandBuffer::new();
        params.put_u32(ctx.handle());
        self.run_command(Command::new(TpmCc::FlushContext).params(params))?;
        self.store.evict(ctx);
        Ok(())
    }

    /// Best-effort TPM2_FlushContext of an object the TPM created or loaded
    /// but that could not be tracked. Only untracked transient handles are
    /// flushed; anything else may belong to another entity.
    pub(crate) fn discard_transient(&mut self, handle: u32) {
        if TpmHt::from_handle(handle) != Some(TpmHt::Transient) || self.store.lookup(handle).is_some() {
            warn!("leaving handle 0x{handle:08x} from a rejected response in place");
            return;
        }
        let mut params = CommandBuffer::new();
        params.put_u32(handle);
        match self.run_command(Command::new(TpmCc::FlushContext).params(params)) {
            Ok(_) => debug!("flushed rejected object 0x{handle:08x}"),
            Err(e) => warn!("failed to flush rejected object 0x{handle:08x}: {e}"),
        }
    }

    /// TPM2_CertifyCreation
    #[allow(clippy::too_many_arguments)]
    pub fn certify_creation(
        &mut self,
        sign: &ResourceContext,
        object: &ResourceContext,
        qualifying_data: &[u8],
        creation_hash: &[u8],
        in_scheme: &TpmtSigScheme,
        creation_ticket: &TpmtTkCreation,
        sign_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<CertifyCreationOutput> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(qualifying_data);
        params.put_tpm2b(creation_hash);
        in_scheme.marshal(&mut params);
        creation_ticket.marshal(&mut params);

        let rsp = self.run_command(
            Command::new(TpmCc::CertifyCreation)
                .auth_handle(sign, sign_auth)
                .handle(object)
                .sessions(sessions)
                .params(params),
        )?;
        let mut buf = rsp.params();
        let certify_info = buf.get_tpm2b()?;
        let attest = TpmsAttest::from_bytes(&certify_info)?;
        let signature = TpmtSignature::unmarshal(&mut buf)?;
        Ok(CertifyCreationOutput {
            certify_info,
            attest,
            signature,
        })
    }

    // ==================== NV Operations ====================

    /// TPM2_NV_ReadPublic. The returned Name is checked against the public area.
    pub fn nv_read_public(
        &mut self,
        nv_index: &ResourceContext,
        sessions: &[Session],
    ) -> Result<(TpmsNvPublic, Name)> {
        let rsp = self.run_command(
            Command::new(TpmCc::NvReadPublic)
                .handle(nv_index)
                .sessions(sessions),
        )?;
        let mut buf = rsp.params();
        let public: TpmsNvPublic = buf.get_sized()?;
        let name = Name::unmarshal(&mut buf)?;
        check_name(TpmCc::NvReadPublic, &name, &Name::from_nv_public(&public)?)?;
        Ok((public, name))
    }

    /// TPM2_NV_DefineSpace
    pub fn nv_define_space(
        &mut self,
        auth: &ResourceContext,
        auth_value: &[u8],
        public: &TpmsNvPublic,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<ResourceContext> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(auth_value);
        params.put_sized(public);
        self.run_command(
            Command::new(TpmCc::NvDefineSpace)
                .auth_handle(auth, auth_auth)
                .sessions(sessions)
                .params(params),
        )?;

        let name = Name::from_nv_public(public)?;
        debug!(
            "defined NV index 0x{:08x} with size {}",
            public.nv_index, public.data_size
        );
        Ok(self.store.insert_nv_index(public.clone(), name))
    }

    /// TPM2_NV_UndefineSpace
    pub fn nv_undefine_space(
        &mut self,
        auth: &ResourceContext,
        nv_index: &ResourceContext,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::NvUndefineSpace)
                .auth_handle(auth, auth_auth)
                .handle(nv_index)
                .sessions(sessions),
        )?;
        debug!("undefined NV index 0x{:08x}", nv_index.handle());
        self.store.evict(nv_index);
        Ok(())
    }

    /// TPM2_NV_Write of one chunk at `offset`
    pub fn nv_write(
        &mut self,
        auth: &ResourceContext,
        nv_index: &ResourceContext,
        data: &[u8],
        offset: u16,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        if data.len() > MAX_NV_BUFFER_SIZE {
            return Err(self.usage(format!(
                "NV write of {} bytes exceeds {MAX_NV_BUFFER_SIZE}",
                data.len()
            )));
        }
        let mut params = CommandBuffer::new();
        params.put_tpm2b(data);
        params.put_u16(offset);
        self.run_command(
            Command::new(TpmCc::NvWrite)
                .auth_handle(auth, auth_auth)
                .handle(nv_index)
                .sessions(sessions)
                .params(params)
                .effect(Effect::NvSetAttrs(nv_index, TpmaNv::WRITTEN)),
        )?;
        debug!(
            "wrote {} bytes to NV index 0x{:08x} at offset {offset}",
            data.len(),
            nv_index.handle()
        );
        Ok(())
    }

    /// TPM2_NV_Read of one chunk at `offset`
    #[allow(clippy::too_many_arguments)]
    pub fn nv_read(
        &mut self,
        auth: &ResourceContext,
        nv_index: &ResourceContext,
        size: u16,
        offset: u16,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<Vec<u8>> {
        let mut params = CommandBuffer::new();
        params.put_u16(size);
        params.put_u16(offset);
        let rsp = self.run_command(
            Command::new(TpmCc::NvRead)
                .auth_handle(auth, auth_auth)
                .handle(nv_index)
                .sessions(sessions)
                .params(params),
        )?;
        let data = rsp.params().get_tpm2b()?;
        Ok(data)
    }

    /// TPM2_NV_WriteLock
    pub fn nv_write_lock(
        &mut self,
        auth: &ResourceContext,
        nv_index: &ResourceContext,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::NvWriteLock)
                .auth_handle(auth, auth_auth)
                .handle(nv_index)
                .sessions(sessions)
                .effect(Effect::NvSetAttrs(nv_index, TpmaNv::WRITELOCKED)),
        )?;
        Ok(())
    }

    /// TPM2_NV_ReadLock
    pub fn nv_read_lock(
        &mut self,
        auth: &ResourceContext,
        nv_index: &ResourceContext,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::NvReadLock)
                .auth_handle(auth, auth_auth)
                .handle(nv_index)
                .sessions(sessions)
                .effect(Effect::NvSetAttrs(nv_index, TpmaNv::READ_LOCKED)),
        )?;
        Ok(())
    }

    /// TPM2_NV_GlobalWriteLock
    pub fn nv_global_write_lock(
        &mut self,
        auth: &ResourceContext,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        self.run_command(
            Command::new(TpmCc::NvGlobalWriteLock)
                .auth_handle(auth, auth_auth)
                .sessions(sessions)
                .effect(Effect::NvGlobalWriteLock),
        )?;
        Ok(())
    }

    // ==================== Capabilities ====================

    /// TPM2_GetCapability(TPM_CAP_HANDLES) from `first`, following
    /// moreData until `count` handles were returned or none remain
    pub fn get_capability_handles(&mut self, first: u32, count: u32) -> Result<Vec<u32>> {
        let batch = self.config.capability_batch.max(1);
        let mut handles = Vec::new();
        let mut next = first;
        let top = first & 0xFF00_0000;

        while (handles.len() as u64) < count as u64 {
            let want = batch.min(count - handles.len() as u32);
            let mut params = CommandBuffer::new();
            params.put_u32(TpmCap::Handles as u32);
            params.put_u32(next);
            params.put_u32(want);
            let rsp = self.run_command(Command::new(TpmCc::GetCapability).params(params))?;

            let mut buf = rsp.params();
            let more_data = buf.get_u8()? != 0;
            let capability = buf.get_u32()?;
            if capability != TpmCap::Handles as u32 {
                return Err(Error::invalid_response(
                    TpmCc::GetCapability,
                    format!("unexpected capability 0x{capability:08x}"),
                ));
            }
            let n = buf.get_u32()?;
            let mut last = None;
            for _ in 0..n {
                let handle = buf.get_u32()?;
                // Handles of a different type end the range
                if handle & 0xFF00_0000 != top {
                    return Ok(handles);
                }
                handles.push(handle);
                last = Some(handle);
            }
            match last {
                Some(h) if more_data && h < u32::MAX => next = h + 1,
                _ => break,
            }
        }
        handles.truncate(count as usize);
        Ok(handles)
    }
}

impl<T: Transport> Drop for TpmContext<T> {
    fn drop(&mut self) {
        self.store.invalidate_all();
    }
}

pub(crate) fn check_transient(code: TpmCc, handle: u32) -> Result<()> {
    if TpmHt::from_handle(handle) == Some(TpmHt::Transient) {
        Ok(())
    } else {
        Err(Error::invalid_response(
            code,
            format!("handle 0x{handle:08x} is not a transient object"),
        ))
    }
}

pub(crate) fn check_name(code: TpmCc, returned: &Name, computed: &Name) -> Result<()> {
    if returned == computed {
        Ok(())
    } else {
        Err(Error::invalid_response(
            code,
            format!("name {returned:?} does not match public area ({computed:?})"),
        ))
    }
}

/// Map "handle does not exist" responses to `ResourceUnavailable`
pub(crate) fn unavailable(handle: u32, err: Error) -> Error {
    match err {
        Error::Tpm(rc) if rc.is_resource_unavailable() => Error::ResourceUnavailable(handle),
        other => other,
    }
}
