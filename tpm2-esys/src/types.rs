// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

fn get_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| Error::Unmarshal(format!("unknown algorithm: 0x{raw:04x}")))
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_NONCE - Nonce value

/// TPML_PCR_SELECTION - List of PCR selections. Only the empty list and
/// opaque round trips are needed here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<(TpmAlgId, Vec<u8>)>,
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for (hash, select) in &self.pcr_selections {
            buf.put_u16(hash.to_u16());
            buf.put_u8(select.len() as u8);
            buf.put_bytes(select);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut pcr_selections = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            let hash = get_alg(buf)?;
            let size = buf.get_u8()? as usize;
            pcr_selections.push((hash, buf.get_bytes(size)?));
        }
        Ok(Self { pcr_selections })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nv_index = buf.get_u32()?;
        let name_alg = get_alg(buf)?;
        let attributes = TpmaNv(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let data_size = buf.get_u16()?;
        Ok(Self {
            nv_index,
            name_alg,
            attributes,
            auth_policy,
            data_size,
        })
    }
}

/// TPMT_SYM_DEF / TPMT_SYM_DEF_OBJECT - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtSymDef {
    Null,
    /// XOR obfuscation. The hash is carried on the wire, the mask itself is
    /// derived with the session hash.
    Xor(TpmAlgId),
    Aes { key_bits: u16, mode: TpmAlgId },
}

impl TpmtSymDef {
    pub fn aes_128_cfb() -> Self {
        TpmtSymDef::Aes {
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match *self {
            TpmtSymDef::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtSymDef::Xor(hash) => {
                buf.put_u16(TpmAlgId::Xor.to_u16());
                buf.put_u16(hash.to_u16());
            }
            TpmtSymDef::Aes { key_bits, mode } => {
                buf.put_u16(TpmAlgId::Aes.to_u16());
                buf.put_u16(key_bits);
                buf.put_u16(mode.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        match get_alg(buf)? {
            TpmAlgId::Null => Ok(TpmtSymDef::Null),
            TpmAlgId::Xor => Ok(TpmtSymDef::Xor(get_alg(buf)?)),
            TpmAlgId::Aes => {
                let key_bits = buf.get_u16()?;
                let mode = get_alg(buf)?;
                Ok(TpmtSymDef::Aes { key_bits, mode })
            }
            other => Err(Error::Unsupported(format!(
                "symmetric algorithm {other:?}"
            ))),
        }
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
pub type TpmtSymDefObject = TpmtSymDef;

/// A scheme selector followed by a hash algorithm unless the scheme is null.
/// Covers TPMT_RSA_SCHEME, TPMT_ECC_SCHEME, TPMT_SIG_SCHEME and TPMT_KDF_SCHEME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn with_hash(scheme: TpmAlgId, hash: TpmAlgId) -> Self {
        Self {
            scheme,
            hash_alg: Some(hash),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        // RSAES carries no details
        let hash_alg = match scheme {
            TpmAlgId::Null | TpmAlgId::RsaEs => None,
            _ => Some(get_alg(buf)?),
        };
        Ok(Self { scheme, hash_alg })
    }
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtEccScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;
pub type TpmtKdfScheme = TpmtScheme;

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtRsaScheme::null(),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

/// TPMT_KEYEDHASH_SCHEME - scheme for keyed hash objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtKeyedHashScheme {
    Null,
    Hmac(TpmAlgId),
    Xor { hash: TpmAlgId, kdf: TpmAlgId },
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmtKeyedHashScheme),
    SymCipher(TpmtSymDefObject),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Rsa(p) => {
                p.symmetric.marshal(buf);
                p.scheme.marshal(buf);
                buf.put_u16(p.key_bits);
                buf.put_u32(p.exponent);
            }
            TpmtPublicParms::Ecc(p) => {
                p.symmetric.marshal(buf);
                p.scheme.marshal(buf);
                buf.put_u16(p.curve_id.to_u16());
                p.kdf.marshal(buf);
            }
            TpmtPublicParms::KeyedHash(scheme) => match *scheme {
                TpmtKeyedHashScheme::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
                TpmtKeyedHashScheme::Hmac(hash) => {
                    buf.put_u16(TpmAlgId::Hmac.to_u16());
                    buf.put_u16(hash.to_u16());
                }
                TpmtKeyedHashScheme::Xor { hash, kdf } => {
                    buf.put_u16(TpmAlgId::Xor.to_u16());
                    buf.put_u16(hash.to_u16());
                    buf.put_u16(kdf.to_u16());
                }
            },
            TpmtPublicParms::SymCipher(sym) => sym.marshal(buf),
        }
    }
}

impl TpmtPublicParms {
    fn unmarshal_for(type_alg: TpmAlgId, buf: &mut ResponseBuffer) -> Result<Self> {
        match type_alg {
            TpmAlgId::Rsa => Ok(TpmtPublicParms::Rsa(TpmsRsaParms {
                symmetric: TpmtSymDef::unmarshal(buf)?,
                scheme: TpmtScheme::unmarshal(buf)?,
                key_bits: buf.get_u16()?,
                exponent: buf.get_u32()?,
            })),
            TpmAlgId::Ecc => {
                let symmetric = TpmtSymDef::unmarshal(buf)?;
                let scheme = TpmtScheme::unmarshal(buf)?;
                let raw_curve = buf.get_u16()?;
                let curve_id = TpmEccCurve::from_u16(raw_curve).ok_or_else(|| {
                    Error::Unmarshal(format!("unknown ECC curve: 0x{raw_curve:04x}"))
                })?;
                let kdf = TpmtScheme::unmarshal(buf)?;
                Ok(TpmtPublicParms::Ecc(TpmsEccParms {
                    symmetric,
                    scheme,
                    curve_id,
                    kdf,
                }))
            }
            TpmAlgId::KeyedHash => {
                let scheme = match get_alg(buf)? {
                    TpmAlgId::Null => TpmtKeyedHashScheme::Null,
                    TpmAlgId::Hmac => TpmtKeyedHashScheme::Hmac(get_alg(buf)?),
                    TpmAlgId::Xor => TpmtKeyedHashScheme::Xor {
                        hash: get_alg(buf)?,
                        kdf: get_alg(buf)?,
                    },
                    other => {
                        return Err(Error::Unmarshal(format!(
                            "invalid keyed hash scheme {other:?}"
                        )))
                    }
                };
                Ok(TpmtPublicParms::KeyedHash(scheme))
            }
            TpmAlgId::SymCipher => Ok(TpmtPublicParms::SymCipher(TpmtSymDef::unmarshal(buf)?)),
            other => Err(Error::Unmarshal(format!("invalid object type {other:?}"))),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),          // TPM2B_PUBLIC_KEY_RSA
    Ecc(Vec<u8>, Vec<u8>), // TPMS_ECC_POINT (x, y)
    KeyedHash(Vec<u8>),    // TPM2B_DIGEST
    Sym(Vec<u8>),          // TPM2B_DIGEST
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc(x, y) => {
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
            TpmtPublicUnique::KeyedHash(d) | TpmtPublicUnique::Sym(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// Create an RSA storage key template (SRK)
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    /// Create an ECC P-256 storage key template
    pub fn ecc_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms {
                symmetric: TpmtSymDef::aes_128_cfb(),
                scheme: TpmtScheme::null(),
                curve_id: TpmEccCurve::NistP256,
                kdf: TpmtScheme::null(),
            }),
            unique: TpmtPublicUnique::Ecc(Vec::new(), Vec::new()),
        }
    }

    /// RSA modulus and exponent, if this is an RSA key with a populated unique field
    pub fn rsa_public(&self) -> Option<(&[u8], u32)> {
        match (&self.parameters, &self.unique) {
            (TpmtPublicParms::Rsa(parms), TpmtPublicUnique::Rsa(n)) if !n.is_empty() => {
                Some((n.as_slice(), parms.exponent))
            }
            _ => None,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = get_alg(buf)?;
        let name_alg = get_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let parameters = TpmtPublicParms::unmarshal_for(type_alg, buf)?;
        let unique = match type_alg {
            TpmAlgId::Rsa => TpmtPublicUnique::Rsa(buf.get_tpm2b()?),
            TpmAlgId::Ecc => {
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                TpmtPublicUnique::Ecc(x, y)
            }
            TpmAlgId::KeyedHash => TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
            _ => TpmtPublicUnique::Sym(buf.get_tpm2b()?),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PRIVATE - Private area, opaque to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Tpm2bPrivate {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_SENSITIVE_CREATE - marshaled inside a TPM2B on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsSensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl TpmsSensitiveCreate {
    pub fn with_auth(user_auth: &[u8]) -> Self {
        Self {
            user_auth: user_auth.to_vec(),
            data: Vec::new(),
        }
    }
}

impl Marshal for TpmsSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.user_auth);
        buf.put_tpm2b(&self.data);
    }
}

impl Unmarshal for TpmsSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            user_auth: buf.get_tpm2b()?,
            data: buf.get_tpm2b()?,
        })
    }
}

/// TPMT_TK_CREATION - Creation ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl Marshal for TpmtTkCreation {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMS_CREATION_DATA, kept as its marshaled bytes. The creation hash
/// passed to CertifyCreation is the digest of exactly these bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationData {
    pub raw: Vec<u8>,
}

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmsClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// TPMU_ATTEST, decoded for creation attestations only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attested {
    Creation {
        object_name: Vec<u8>,
        creation_hash: Vec<u8>,
    },
    Other(u16, Vec<u8>),
}

/// TPM_GENERATED_VALUE
pub const TPM_GENERATED_VALUE: u32 = 0xff544347;
/// TPM_ST_ATTEST_CREATION
pub const TPM_ST_ATTEST_CREATION: u16 = 0x801A;

/// TPMS_ATTEST - Attestation structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAttest {
    pub magic: u32,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: TpmsClockInfo,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl Unmarshal for TpmsAttest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let magic = buf.get_u32()?;
        let attest_type = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock_info = TpmsClockInfo {
            clock: buf.get_u64()?,
            reset_count: buf.get_u32()?,
            restart_count: buf.get_u32()?,
            safe: buf.get_u8()? != 0,
        };
        let firmware_version = buf.get_u64()?;
        let attested = if attest_type == TPM_ST_ATTEST_CREATION {
            Attested::Creation {
                object_name: buf.get_tpm2b()?,
                creation_hash: buf.get_tpm2b()?,
            }
        } else {
            Attested::Other(attest_type, buf.get_remaining())
        };
        Ok(Self {
            magic,
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

/// TPMT_SIGNATURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Null,
    Rsa {
        scheme: TpmAlgId,
        hash: TpmAlgId,
        sig: Vec<u8>,
    },
    Ecc {
        scheme: TpmAlgId,
        hash: TpmAlgId,
        r: Vec<u8>,
        s: Vec<u8>,
    },
    Hmac {
        hash: TpmAlgId,
        digest: Vec<u8>,
    },
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        match scheme {
            TpmAlgId::Null => Ok(TpmtSignature::Null),
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss => Ok(TpmtSignature::Rsa {
                scheme,
                hash: get_alg(buf)?,
                sig: buf.get_tpm2b()?,
            }),
            TpmAlgId::EcDsa | TpmAlgId::EcSchnorr => Ok(TpmtSignature::Ecc {
                scheme,
                hash: get_alg(buf)?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            }),
            TpmAlgId::Hmac => {
                let hash = get_alg(buf)?;
                let digest = buf.get_bytes(hash.digest_size())?;
                Ok(TpmtSignature::Hmac { hash, digest })
            }
            other => Err(Error::Unsupported(format!("signature scheme {other:?}"))),
        }
    }
}
