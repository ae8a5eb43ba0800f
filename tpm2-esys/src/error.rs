// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error types

use std::fmt;

use thiserror::Error;

use crate::constants::{tpm_rc, TpmCc};
use crate::device::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("resource {0:#010x} is not available on the TPM")]
    ResourceUnavailable(u32),
    #[error("invalid response to {command:?}: {reason}")]
    InvalidResponse { command: TpmCc, reason: String },
    #[error(transparent)]
    Tpm(#[from] TpmRcError),
    #[error("usage error: {0}")]
    Usage(String),
    #[error("failed to unmarshal: {0}")]
    Unmarshal(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn invalid_response(command: TpmCc, reason: impl Into<String>) -> Self {
        Error::InvalidResponse {
            command,
            reason: reason.into(),
        }
    }

    /// The TPM response code, if this error carries one
    pub fn tpm_rc(&self) -> Option<&TpmRcError> {
        match self {
            Error::Tpm(rc) => Some(rc),
            _ => None,
        }
    }
}

/// Classification of a non-zero response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcKind {
    /// Format-zero error
    Error,
    /// Format-zero warning, the command may succeed if resubmitted
    Warning,
    /// Format-one error tied to a handle, parameter or session
    Format1,
    /// TPM 1.2 style code, or a vendor code
    Other,
}

/// The argument a format-one response code refers to. Indices are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcLocation {
    Handle(u8),
    Parameter(u8),
    Session(u8),
}

/// A TPM response code returned by a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TpmRcError {
    pub command: TpmCc,
    pub code: u32,
}

impl TpmRcError {
    pub fn new(command: TpmCc, code: u32) -> Self {
        Self { command, code }
    }

    pub fn kind(&self) -> RcKind {
        if self.code & tpm_rc::FMT1 != 0 {
            RcKind::Format1
        } else if self.code & tpm_rc::VER1 == 0 || self.code & 0x400 != 0 {
            RcKind::Other
        } else if self.code & tpm_rc::S != 0 {
            RcKind::Warning
        } else {
            RcKind::Error
        }
    }

    /// The response code with its location bits removed
    pub fn base_code(&self) -> u32 {
        match self.kind() {
            RcKind::Format1 => (self.code & 0x3F) | tpm_rc::FMT1,
            _ => self.code,
        }
    }

    pub fn location(&self) -> Option<RcLocation> {
        if self.kind() != RcKind::Format1 {
            return None;
        }
        let n = ((self.code >> 8) & 0xF) as u8;
        if self.code & tpm_rc::P != 0 {
            Some(RcLocation::Parameter(n))
        } else if n == 0 {
            None
        } else if n < 8 {
            Some(RcLocation::Handle(n))
        } else {
            Some(RcLocation::Session(n - 8))
        }
    }

    pub fn is_warning(&self) -> bool {
        self.kind() == RcKind::Warning
    }

    /// Whether the TPM reported that a referenced handle does not exist
    pub fn is_resource_unavailable(&self) -> bool {
        if self.code == tpm_rc::REFERENCE_H0 {
            return true;
        }
        self.base_code() == tpm_rc::HANDLE && matches!(self.location(), Some(RcLocation::Handle(_)))
    }
}

impl fmt::Display for TpmRcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind() {
            RcKind::Warning => "warning",
            _ => "error",
        };
        write!(
            f,
            "TPM returned {what} {:#05x} for {:?}",
            self.base_code(),
            self.command
        )?;
        match self.location() {
            Some(RcLocation::Handle(n)) => write!(f, " (handle {n})"),
            Some(RcLocation::Parameter(n)) => write!(f, " (parameter {n})"),
            Some(RcLocation::Session(n)) => write!(f, " (session {n})"),
            None => Ok(()),
        }?;
        write!(f, " [rc {:#010x}]", self.code)
    }
}
