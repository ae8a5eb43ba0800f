// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 resource tracking and session authorization
//!
//! This crate talks to a TPM through a byte-stream [`Transport`] and keeps
//! track of the resources it creates or wraps. Every authenticated command
//! runs through one pipeline that computes and checks session HMACs and
//! optional parameter encryption.
//!
//! ## Features
//!
//! - **Tracked resources**: objects, NV indices and sessions are
//!   [`ResourceContext`] views. Flushing, undefining or clearing a resource
//!   invalidates every view of it.
//! - **HMAC and policy sessions**: bound and salted sessions, PolicyAuthValue
//!   and PolicyPassword, AES-CFB and XOR parameter encryption.
//! - **Self-rekeying commands**: `HierarchyChangeAuth` and `Clear` verify
//!   their response with the auth value the command installed.
//! - **Direct device communication**: talks to `/dev/tpmrm0` or `/dev/tpm0`
//!   without C library dependencies.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_esys::{
//!     Authorization, TpmAlgId, TpmConfig, TpmContext, TpmSe, TpmaSa, TpmlPcrSelection,
//!     TpmsSensitiveCreate, TpmtPublic, TpmtSymDef,
//! };
//!
//! let mut tpm = TpmContext::open(&TpmConfig::default())?;
//! let owner = tpm.owner_handle_context();
//! let session = tpm.start_auth_session(
//!     None,
//!     None,
//!     TpmSe::Hmac,
//!     TpmtSymDef::Null,
//!     TpmAlgId::Sha256,
//!     &[],
//! )?;
//! let auth = Authorization::from(session.with_attrs(TpmaSa::new().with_continue_session()));
//! let (primary, _) = tpm.create_primary(
//!     &owner,
//!     &TpmsSensitiveCreate::default(),
//!     &TpmtPublic::rsa_storage_key(),
//!     &[],
//!     &TpmlPcrSelection::default(),
//!     &auth,
//!     &[],
//! )?;
//! tpm.flush_context(&primary)?;
//! tpm.flush_context(session.context())?;
//! # Ok::<(), tpm2_esys::Error>(())
//! ```

mod commands;
mod config;
mod constants;
pub mod crypto;
mod device;
mod error;
mod hierarchy;
mod marshal;
mod name;
mod pipeline;
mod reconcile;
mod resources;
mod session;
mod types;

pub use commands::{
    CertifyCreationOutput, CreatedObject, CreationOutput, TpmContext, MAX_NV_BUFFER_SIZE,
};
pub use config::TpmConfig;
pub use constants::*;
pub use error::{Error, RcKind, RcLocation, Result, TpmRcError};
pub use name::Name;
pub use pipeline::MAX_SESSIONS;
pub use resources::{ResourceContext, ResourceKind};
pub use session::{
    include_auth_value, Authorization, PolicyAuth, Session, SessionContext, SessionKind,
};
pub use types::*;

// Re-export device for advanced usage
pub use device::{TpmCommand, TpmDevice, TpmResponse, Transport, TransportError};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
