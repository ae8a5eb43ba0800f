// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM entity names
//!
//! An entity's Name is either its 4-byte handle (permanent entities, PCRs,
//! sessions) or its name algorithm followed by the digest of its marshaled
//! public area (objects, NV indices).

use std::fmt;

use crate::constants::*;
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::{TpmsNvPublic, TpmtPublic};

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Name(Vec<u8>);

impl Name {
    pub fn from_handle(handle: u32) -> Self {
        Self(handle.to_be_bytes().to_vec())
    }

    /// Name reported by invalidated contexts
    pub fn null() -> Self {
        Self::from_handle(tpm_rh::NULL)
    }

    pub fn from_object_public(public: &TpmtPublic) -> Result<Self> {
        Self::from_public_bytes(public.name_alg, &public.to_bytes())
    }

    pub fn from_nv_public(public: &TpmsNvPublic) -> Result<Self> {
        Self::from_public_bytes(public.name_alg, &public.to_bytes())
    }

    fn from_public_bytes(name_alg: TpmAlgId, public: &[u8]) -> Result<Self> {
        let digest = crypto::digest(name_alg, &[public])?;
        let mut raw = Vec::with_capacity(2 + digest.len());
        raw.extend_from_slice(&name_alg.to_u16().to_be_bytes());
        raw.extend_from_slice(&digest);
        Ok(Self(raw))
    }

    /// Wrap bytes received from the TPM, checking that they form a valid Name
    pub fn from_bytes_checked(raw: Vec<u8>) -> Result<Self> {
        let name = Self(raw);
        if name.is_handle() || name.algorithm().is_some() {
            Ok(name)
        } else {
            Err(Error::Unmarshal(format!("malformed name {name:?}")))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_handle(&self) -> bool {
        self.0.len() == 4
    }

    /// The handle this Name encodes, for handle-type Names
    pub fn handle(&self) -> Option<u32> {
        let raw: [u8; 4] = self.0.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// The name algorithm, for digest-type Names of the right length
    pub fn algorithm(&self) -> Option<TpmAlgId> {
        if self.0.len() < 2 {
            return None;
        }
        let alg = TpmAlgId::from_u16(u16::from_be_bytes([self.0[0], self.0[1]]))?;
        (alg.is_hash() && self.0.len() == 2 + alg.digest_size()).then_some(alg)
    }

    pub fn digest(&self) -> Option<&[u8]> {
        self.algorithm().map(|_| &self.0[2..])
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", hex::encode(&self.0))
    }
}

impl AsRef<[u8]> for Name {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// TPM2B_NAME
impl Marshal for Name {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.0);
    }
}

impl Unmarshal for Name {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Self::from_bytes_checked(buf.get_tpm2b()?)
    }
}
