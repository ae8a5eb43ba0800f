// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Resource contexts and the per-connection resource table
//!
//! A [`ResourceContext`] is a cheap, cloneable view of a TPM entity. Every
//! non-permanent context is owned by exactly one [`ResourceStore`], which is
//! the only place its state is mutated. Invalidating a context through the
//! store is observed by every clone of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::name::Name;
use crate::session::SessionState;
use crate::types::{TpmsNvPublic, TpmtPublic};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of entity a context refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Permanent,
    Object,
    NvIndex,
    Session,
}

#[derive(Debug)]
pub(crate) struct ObjectState {
    pub(crate) handle: u32,
    pub(crate) public: Option<TpmtPublic>,
    pub(crate) name: Name,
}

#[derive(Debug)]
pub(crate) struct NvIndexState {
    pub(crate) handle: u32,
    pub(crate) public: Option<TpmsNvPublic>,
    pub(crate) name: Name,
}

impl NvIndexState {
    /// Set attribute bits and recompute the Name. Only for changes the TPM
    /// makes without altering the size or name algorithm.
    pub(crate) fn set_attr(&mut self, bits: u32) -> Result<()> {
        self.modify_attrs(|attrs| attrs | bits)
    }

    pub(crate) fn clear_attr(&mut self, bits: u32) -> Result<()> {
        self.modify_attrs(|attrs| attrs & !bits)
    }

    fn modify_attrs(&mut self, f: impl FnOnce(u32) -> u32) -> Result<()> {
        let Some(public) = self.public.as_mut() else {
            return Err(Error::Usage("NV index context has been invalidated".into()));
        };
        public.attributes = TpmaNv(f(public.attributes.0));
        self.name = Name::from_nv_public(public)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum Resource {
    Object(ObjectState),
    NvIndex(NvIndexState),
    Session(SessionState),
}

impl Resource {
    fn handle(&self) -> u32 {
        match self {
            Resource::Object(o) => o.handle,
            Resource::NvIndex(nv) => nv.handle,
            Resource::Session(s) => s.handle,
        }
    }

    fn name(&self) -> Name {
        match self {
            Resource::Object(o) => o.name.clone(),
            Resource::NvIndex(nv) => nv.name.clone(),
            Resource::Session(s) => Name::from_handle(s.handle),
        }
    }

    fn kind(&self) -> ResourceKind {
        match self {
            Resource::Object(_) => ResourceKind::Object,
            Resource::NvIndex(_) => ResourceKind::NvIndex,
            Resource::Session(_) => ResourceKind::Session,
        }
    }

    fn invalidate(&mut self) {
        match self {
            Resource::Object(o) => {
                o.handle = tpm_rh::NULL;
                o.public = None;
                o.name = Name::null();
            }
            Resource::NvIndex(nv) => {
                nv.handle = tpm_rh::NULL;
                nv.public = None;
                nv.name = Name::null();
            }
            Resource::Session(s) => s.invalidate(),
        }
    }
}

struct ContextCell {
    owner: u64,
    state: Mutex<Resource>,
}

impl ContextCell {
    fn lock(&self) -> MutexGuard<'_, Resource> {
        // State updates never leave a half-written value behind
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
enum Repr {
    Permanent(u32),
    Tracked(Arc<ContextCell>),
}

/// A reference to a TPM entity: a permanent handle, a loaded or persistent
/// object, an NV index or an authorization session
#[derive(Clone)]
pub struct ResourceContext {
    repr: Repr,
}

impl ResourceContext {
    pub(crate) fn permanent(handle: u32) -> Self {
        Self {
            repr: Repr::Permanent(handle),
        }
    }

    /// Bare handle reference for querying an entity before it is tracked.
    /// Its Name is the handle itself.
    pub(crate) fn untracked(handle: u32) -> Self {
        Self::permanent(handle)
    }

    fn tracked(owner: u64, resource: Resource) -> Self {
        Self {
            repr: Repr::Tracked(Arc::new(ContextCell {
                owner,
                state: Mutex::new(resource),
            })),
        }
    }

    /// Current handle, `TPM_RH_NULL` once invalidated
    pub fn handle(&self) -> u32 {
        match &self.repr {
            Repr::Permanent(h) => *h,
            Repr::Tracked(cell) => cell.lock().handle(),
        }
    }

    /// Current Name, the null handle encoding once invalidated
    pub fn name(&self) -> Name {
        match &self.repr {
            Repr::Permanent(h) => Name::from_handle(*h),
            Repr::Tracked(cell) => cell.lock().name(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match &self.repr {
            Repr::Permanent(_) => ResourceKind::Permanent,
            Repr::Tracked(cell) => cell.lock().kind(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.handle() != tpm_rh::NULL
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.repr, Repr::Permanent(_))
    }

    /// Public area snapshot of an object context
    pub fn object_public(&self) -> Option<TpmtPublic> {
        self.read(|r| match r {
            Resource::Object(o) => o.public.clone(),
            _ => None,
        })
        .flatten()
    }

    /// Public area snapshot of an NV index context
    pub fn nv_public(&self) -> Option<TpmsNvPublic> {
        self.read(|r| match r {
            Resource::NvIndex(nv) => nv.public.clone(),
            _ => None,
        })
        .flatten()
    }

    /// Whether both views refer to the same context
    pub fn same_resource(&self, other: &ResourceContext) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Permanent(a), Repr::Permanent(b)) => a == b,
            (Repr::Tracked(a), Repr::Tracked(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        match &self.repr {
            Repr::Permanent(_) => None,
            Repr::Tracked(cell) => Some(cell.owner),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Resource) -> R) -> Option<R> {
        match &self.repr {
            Repr::Permanent(_) => None,
            Repr::Tracked(cell) => Some(f(&cell.lock())),
        }
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Resource) -> R) -> Option<R> {
        match &self.repr {
            Repr::Permanent(_) => None,
            Repr::Tracked(cell) => Some(f(&mut cell.lock())),
        }
    }
}

impl PartialEq for ResourceContext {
    fn eq(&self, other: &Self) -> bool {
        self.same_resource(other)
    }
}

impl Eq for ResourceContext {}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("kind", &self.kind())
            .field("handle", &format_args!("{:#010x}", self.handle()))
            .field("name", &self.name())
            .finish()
    }
}

/// Table of the contexts a single `TpmContext` tracks
pub(crate) struct ResourceStore {
    id: u64,
    table: HashMap<u32, ResourceContext>,
}

impl ResourceStore {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            table: HashMap::new(),
        }
    }

    /// Create a context owned by this store and register it
    pub(crate) fn insert(&mut self, resource: Resource) -> ResourceContext {
        let ctx = ResourceContext::tracked(self.id, resource);
        self.add(ctx.clone());
        ctx
    }

    pub(crate) fn insert_object(&mut self, handle: u32, public: TpmtPublic, name: Name) -> ResourceContext {
        self.insert(Resource::Object(ObjectState {
            handle,
            public: Some(public),
            name,
        }))
    }

    pub(crate) fn insert_nv_index(&mut self, public: TpmsNvPublic, name: Name) -> ResourceContext {
        self.insert(Resource::NvIndex(NvIndexState {
            handle: public.nv_index,
            public: Some(public),
            name,
        }))
    }

    pub(crate) fn insert_session(&mut self, state: SessionState) -> ResourceContext {
        self.insert(Resource::Session(state))
    }

    /// Register a context.
    ///
    /// # Panics
    ///
    /// If the context is permanent, foreign, invalidated or its handle is
    /// already tracked.
    pub(crate) fn add(&mut self, ctx: ResourceContext) {
        assert!(
            ctx.owner() == Some(self.id),
            "attempting to add a permanent or foreign resource context"
        );
        let handle = ctx.handle();
        assert!(
            handle != tpm_rh::NULL,
            "attempting to add an invalidated resource context"
        );
        assert!(
            !self.table.contains_key(&handle),
            "resource context for handle {handle:#010x} already exists"
        );
        debug!("tracking {:?} context for handle 0x{handle:08x}", ctx.kind());
        self.table.insert(handle, ctx);
    }

    pub(crate) fn lookup(&self, handle: u32) -> Option<ResourceContext> {
        self.table.get(&handle).cloned()
    }

    /// Remove a context and invalidate it in place.
    ///
    /// # Panics
    ///
    /// If the context is permanent or not tracked by this store.
    pub(crate) fn evict(&mut self, ctx: &ResourceContext) {
        assert!(!ctx.is_permanent(), "attempting to evict a permanent resource context");
        if let Err(e) = self.check(ctx) {
            panic!("attempting to evict an untracked resource context: {e}");
        }
        let handle = ctx.handle();
        self.table.remove(&handle);
        ctx.update(Resource::invalidate);
        debug!("evicted resource context for handle 0x{handle:08x}");
    }

    /// Check that a context may be used with this store. Permanent contexts
    /// are always usable.
    pub(crate) fn check(&self, ctx: &ResourceContext) -> Result<()> {
        let Some(owner) = ctx.owner() else {
            return Ok(());
        };
        let handle = ctx.handle();
        if handle == tpm_rh::NULL {
            error!("resource context has been invalidated");
            return Err(Error::Usage("resource context has been invalidated".into()));
        }
        match self.table.get(&handle) {
            Some(tracked) if owner == self.id && tracked.same_resource(ctx) => Ok(()),
            _ => {
                error!("resource context for 0x{handle:08x} belongs to another TPM context");
                Err(Error::Usage(format!(
                    "resource context for {handle:#010x} belongs to another TPM context"
                )))
            }
        }
    }

    /// Snapshot of every tracked context
    pub(crate) fn tracked(&self) -> Vec<ResourceContext> {
        self.table.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Invalidate and drop every tracked context
    pub(crate) fn invalidate_all(&mut self) {
        for (_, ctx) in self.table.drain() {
            ctx.update(Resource::invalidate);
        }
    }
}
