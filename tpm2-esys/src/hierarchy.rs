// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hierarchy commands
//!
//! Primary object creation and the commands that reset or rekey a
//! hierarchy.

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::commands::{check_name, check_transient, CreationOutput, TpmContext};
use crate::constants::*;
use crate::device::Transport;
use crate::error::Result;
use crate::marshal::*;
use crate::name::Name;
use crate::pipeline::Command;
use crate::reconcile::{AuthRotation, Effect};
use crate::resources::ResourceContext;
use crate::session::{Authorization, Session};
use crate::types::*;

impl<T: Transport> TpmContext<T> {
    /// TPM2_CreatePrimary
    ///
    /// Creates a primary object in the hierarchy `primary` and returns its
    /// transient context along with the creation data.
    #[allow(clippy::too_many_arguments)]
    pub fn create_primary(
        &mut self,
        primary: &ResourceContext,
        in_sensitive: &TpmsSensitiveCreate,
        in_public: &TpmtPublic,
        outside_info: &[u8],
        creation_pcr: &TpmlPcrSelection,
        primary_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<(ResourceContext, CreationOutput)> {
        let mut params = CommandBuffer::new();
        params.put_sized(in_sensitive);
        params.put_sized(in_public);
        params.put_tpm2b(outside_info);
        creation_pcr.marshal(&mut params);

        let rsp = self.run_command(
            Command::new(TpmCc::CreatePrimary)
                .auth_handle(primary, primary_auth)
                .sessions(sessions)
                .params(params)
                .response_handles(1),
        )?;

        let handle = rsp.handles[0];
        let parsed = check_transient(TpmCc::CreatePrimary, handle).and_then(|()| {
            let mut buf = rsp.params();
            let out_public: TpmtPublic = buf.get_sized()?;
            let creation = CreationOutput::unmarshal(&mut buf)?;
            let name = Name::unmarshal(&mut buf)?;
            check_name(
                TpmCc::CreatePrimary,
                &name,
                &Name::from_object_public(&out_public)?,
            )?;
            Ok((out_public, creation, name))
        });
        let (out_public, creation, name) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.discard_transient(handle);
                return Err(e);
            }
        };

        debug!("created primary object with handle 0x{:08x}", handle);
        let ctx = self.store.insert_object(handle, out_public, name);
        Ok((ctx, creation))
    }

    /// TPM2_Clear
    ///
    /// Removes every object and NV index in the owner and endorsement
    /// hierarchies. Tracked contexts for them are invalidated. Clearing
    /// through the lockout hierarchy resets its auth value, so the response
    /// is checked against the empty auth.
    pub fn clear(
        &mut self,
        auth: &ResourceContext,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        let rotation = if auth.handle() == tpm_rh::LOCKOUT {
            AuthRotation::AdoptEmptyAuth
        } else {
            AuthRotation::None
        };
        self.run_command(
            Command::new(TpmCc::Clear)
                .auth_handle(auth, auth_auth)
                .sessions(sessions)
                .rotation(rotation)
                .effect(Effect::ClearSweep),
        )?;
        info!("TPM cleared");
        Ok(())
    }

    /// TPM2_ClearControl
    pub fn clear_control(
        &mut self,
        auth: &ResourceContext,
        disable: bool,
        auth_auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u8(disable as u8);
        self.run_command(
            Command::new(TpmCc::ClearControl)
                .auth_handle(auth, auth_auth)
                .sessions(sessions)
                .params(params),
        )?;
        debug!("TPM2_Clear disabled: {disable}");
        Ok(())
    }

    /// TPM2_HierarchyChangeAuth
    ///
    /// The TPM authorizes the response with `new_auth`.
    pub fn hierarchy_change_auth(
        &mut self,
        hierarchy: &ResourceContext,
        new_auth: &[u8],
        auth: &Authorization,
        sessions: &[Session],
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(new_auth);
        self.run_command(
            Command::new(TpmCc::HierarchyChangeAuth)
                .auth_handle(hierarchy, auth)
                .sessions(sessions)
                .params(params)
                .rotation(AuthRotation::AdoptNewAuth(Zeroizing::new(new_auth.to_vec()))),
        )?;
        debug!("changed auth value of hierarchy 0x{:08x}", hierarchy.handle());
        Ok(())
    }
}
