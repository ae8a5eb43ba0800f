// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Reconciling tracked contexts with TPM-side changes
//!
//! Some commands change TPM state beyond their own handles: TPM2_Clear
//! destroys every owner and endorsement object, commands like
//! TPM2_HierarchyChangeAuth change the secret that authorizes their own
//! response, and NV commands flip attributes that feed into an index's Name.

use std::collections::HashSet;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::commands::TpmContext;
use crate::constants::*;
use crate::device::Transport;
use crate::resources::{Resource, ResourceContext, ResourceKind};

/// Replacement of the first session's auth value before the response HMAC
/// is checked. Applied only if that session included the auth value in the
/// command HMAC.
#[derive(Clone, Default)]
pub(crate) enum AuthRotation {
    #[default]
    None,
    AdoptNewAuth(Zeroizing<Vec<u8>>),
    AdoptEmptyAuth,
}

/// Local bookkeeping applied once the TPM has accepted a command, whether or
/// not the response then verifies
#[derive(Default)]
pub(crate) enum Effect<'a> {
    #[default]
    None,
    /// Drop contexts for everything TPM2_Clear destroyed
    ClearSweep,
    /// Set attribute bits on one NV index
    NvSetAttrs(&'a ResourceContext, u32),
    /// TPM2_NV_GlobalWriteLock
    NvGlobalWriteLock,
}

impl<T: Transport> TpmContext<T> {
    pub(crate) fn apply_effect(&mut self, effect: Effect<'_>) {
        match effect {
            Effect::None => {}
            Effect::ClearSweep => self.clear_sweep(),
            Effect::NvSetAttrs(ctx, bits) => set_nv_attrs(ctx, bits),
            Effect::NvGlobalWriteLock => {
                for ctx in self.store.tracked() {
                    let global = ctx
                        .nv_public()
                        .is_some_and(|p| p.attributes.contains(TpmaNv::GLOBALLOCK));
                    if global {
                        set_nv_attrs(&ctx, TpmaNv::WRITELOCKED);
                    }
                }
            }
        }
    }

    fn resident_handles(&mut self) -> Option<HashSet<u32>> {
        let mut resident = HashSet::new();
        for ht in [TpmHt::Transient, TpmHt::Persistent, TpmHt::NvIndex] {
            match self.get_capability_handles(ht.base_handle(), MAX_CAP_HANDLES) {
                Ok(handles) => resident.extend(handles),
                Err(e) => {
                    warn!("failed to enumerate {ht:?} handles after TPM2_Clear: {e}");
                    return None;
                }
            }
        }
        Some(resident)
    }

    /// Evict objects that no longer exist and NV indices not created by the
    /// platform. Sessions and permanent handles survive TPM2_Clear.
    fn clear_sweep(&mut self) {
        let resident = self.resident_handles();
        if resident.is_none() {
            warn!("keeping object contexts tracked; their state after TPM2_Clear is unknown");
        }

        let mut evicted = 0;
        for ctx in self.store.tracked() {
            let handle = ctx.handle();
            let gone = match ctx.kind() {
                ResourceKind::Object => resident.as_ref().is_some_and(|r| !r.contains(&handle)),
                ResourceKind::NvIndex => {
                    let platform = ctx
                        .nv_public()
                        .is_some_and(|p| p.attributes.contains(TpmaNv::PLATFORM_CREATE));
                    !platform || resident.as_ref().is_some_and(|r| !r.contains(&handle))
                }
                ResourceKind::Session | ResourceKind::Permanent => false,
            };
            if gone {
                self.store.evict(&ctx);
                evicted += 1;
            }
        }
        debug!("TPM2_Clear invalidated {evicted} resource contexts");
    }
}

fn set_nv_attrs(ctx: &ResourceContext, bits: u32) {
    let result = ctx.update(|r| match r {
        Resource::NvIndex(nv) => nv.set_attr(bits),
        _ => Ok(()),
    });
    if let Some(Err(e)) = result {
        warn!("failed to update NV index 0x{:08x}: {e}", ctx.handle());
    }
}
