// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 constants, command codes and handle classification

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    NvUndefineSpace = 0x00000122,
    Clear = 0x00000126,
    ClearControl = 0x00000127,
    HierarchyChangeAuth = 0x00000129,
    NvDefineSpace = 0x0000012A,
    CreatePrimary = 0x00000131,
    NvGlobalWriteLock = 0x00000132,
    NvWrite = 0x00000137,
    NvWriteLock = 0x00000138,
    CertifyCreation = 0x0000014A,
    NvRead = 0x0000014E,
    NvReadLock = 0x0000014F,
    Create = 0x00000153,
    Load = 0x00000157,
    FlushContext = 0x00000165,
    NvReadPublic = 0x00000169,
    PolicyAuthValue = 0x0000016B,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    PolicyGetDigest = 0x00000189,
    PolicyPassword = 0x0000018C,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        const ALL: [TpmCc; 23] = [
            TpmCc::EvictControl,
            TpmCc::NvUndefineSpace,
            TpmCc::Clear,
            TpmCc::ClearControl,
            TpmCc::HierarchyChangeAuth,
            TpmCc::NvDefineSpace,
            TpmCc::CreatePrimary,
            TpmCc::NvGlobalWriteLock,
            TpmCc::NvWrite,
            TpmCc::NvWriteLock,
            TpmCc::CertifyCreation,
            TpmCc::NvRead,
            TpmCc::NvReadLock,
            TpmCc::Create,
            TpmCc::Load,
            TpmCc::FlushContext,
            TpmCc::NvReadPublic,
            TpmCc::PolicyAuthValue,
            TpmCc::ReadPublic,
            TpmCc::StartAuthSession,
            TpmCc::GetCapability,
            TpmCc::PolicyGetDigest,
            TpmCc::PolicyPassword,
        ];
        ALL.into_iter().find(|cc| cc.to_u32() == v)
    }

    /// Whether the first command parameter is a sized buffer that a decrypt
    /// session may encrypt.
    pub fn decrypt_allowed(self) -> bool {
        matches!(
            self,
            TpmCc::CreatePrimary
                | TpmCc::Create
                | TpmCc::Load
                | TpmCc::HierarchyChangeAuth
                | TpmCc::NvDefineSpace
                | TpmCc::NvWrite
                | TpmCc::CertifyCreation
                | TpmCc::StartAuthSession
        )
    }

    /// Whether the first response parameter is a sized buffer that an
    /// encrypt session may protect.
    pub fn encrypt_allowed(self) -> bool {
        matches!(
            self,
            TpmCc::CreatePrimary
                | TpmCc::Create
                | TpmCc::Load
                | TpmCc::ReadPublic
                | TpmCc::NvReadPublic
                | TpmCc::NvRead
                | TpmCc::CertifyCreation
                | TpmCc::StartAuthSession
                | TpmCc::PolicyGetDigest
        )
    }
}

/// TPM 2.0 Response Codes (TPM_RC) used by this crate
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;

    // Format selectors
    pub const VER1: u32 = 0x100;
    pub const FMT1: u32 = 0x080;
    pub const WARN: u32 = 0x900;
    pub const P: u32 = 0x040;
    pub const S: u32 = 0x800;

    // Format-zero errors
    pub const INITIALIZE: u32 = VER1;
    pub const FAILURE: u32 = VER1 + 0x001;
    pub const DISABLED: u32 = VER1 + 0x020;
    pub const AUTH_MISSING: u32 = VER1 + 0x025;
    pub const COMMAND_CODE: u32 = VER1 + 0x043;
    pub const AUTHSIZE: u32 = VER1 + 0x044;
    pub const NV_RANGE: u32 = VER1 + 0x046;
    pub const NV_LOCKED: u32 = VER1 + 0x048;
    pub const NV_AUTHORIZATION: u32 = VER1 + 0x049;
    pub const NV_UNINITIALIZED: u32 = VER1 + 0x04A;
    pub const NV_DEFINED: u32 = VER1 + 0x04C;

    // Format-one errors
    pub const ATTRIBUTES: u32 = FMT1 + 0x002;
    pub const HASH: u32 = FMT1 + 0x003;
    pub const VALUE: u32 = FMT1 + 0x004;
    pub const HANDLE: u32 = FMT1 + 0x00B;
    pub const AUTH_FAIL: u32 = FMT1 + 0x00E;
    pub const SIZE: u32 = FMT1 + 0x015;
    pub const TAG: u32 = FMT1 + 0x017;
    pub const POLICY_FAIL: u32 = FMT1 + 0x01D;

    // Warnings
    pub const OBJECT_MEMORY: u32 = WARN + 0x002;
    pub const SESSION_MEMORY: u32 = WARN + 0x003;
    pub const RETRY: u32 = WARN + 0x022;
    pub const REFERENCE_H0: u32 = WARN + 0x010;
    pub const REFERENCE_S0: u32 = WARN + 0x018;
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaEs = 0x0015,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    EcDsa = 0x0018,
    EcDh = 0x0019,
    EcSchnorr = 0x001C,
    Kdf1Sp800_56a = 0x0020,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Ctr = 0x0040,
    Ofb = 0x0041,
    Cbc = 0x0042,
    Cfb = 0x0043,
    Ecb = 0x0044,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0006 => Some(TpmAlgId::Aes),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x000A => Some(TpmAlgId::Xor),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0010 => Some(TpmAlgId::Null),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0015 => Some(TpmAlgId::RsaEs),
            0x0016 => Some(TpmAlgId::RsaPss),
            0x0017 => Some(TpmAlgId::Oaep),
            0x0018 => Some(TpmAlgId::EcDsa),
            0x0019 => Some(TpmAlgId::EcDh),
            0x001C => Some(TpmAlgId::EcSchnorr),
            0x0020 => Some(TpmAlgId::Kdf1Sp800_56a),
            0x0022 => Some(TpmAlgId::Kdf1Sp800_108),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0025 => Some(TpmAlgId::SymCipher),
            0x0040 => Some(TpmAlgId::Ctr),
            0x0041 => Some(TpmAlgId::Ofb),
            0x0042 => Some(TpmAlgId::Cbc),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0044 => Some(TpmAlgId::Ecb),
            _ => None,
        }
    }

    /// Digest size in bytes, 0 for algorithms that are not hashes
    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() > 0
    }
}

/// TPM 2.0 Handle Types (TPM_HT), the most significant byte of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    /// Loaded sessions share the HMAC session range
    pub const LOADED_SESSION: TpmHt = TpmHt::HmacSession;
    /// Saved sessions share the policy session range
    pub const SAVED_SESSION: TpmHt = TpmHt::PolicySession;

    pub fn from_handle(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    /// First handle of this type's range
    pub fn base_handle(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const UNASSIGNED: u32 = 0x40000008;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
    pub const PLATFORM_NV: u32 = 0x4000000D;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    pub const POLICY_DELETE: u32 = 1 << 10;
    pub const WRITELOCKED: u32 = 1 << 11;
    pub const WRITEALL: u32 = 1 << 12;
    pub const WRITEDEFINE: u32 = 1 << 13;
    pub const WRITE_STCLEAR: u32 = 1 << 14;
    pub const GLOBALLOCK: u32 = 1 << 15;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const ORDERLY: u32 = 1 << 26;
    pub const CLEAR_STCLEAR: u32 = 1 << 27;
    pub const READ_LOCKED: u32 = 1 << 28;
    pub const WRITTEN: u32 = 1 << 29;
    pub const PLATFORM_CREATE: u32 = 1 << 30;
    pub const READ_STCLEAR: u32 = 1 << 31;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_owner_write(mut self) -> Self {
        self.0 |= Self::OWNER_WRITE;
        self
    }

    pub fn with_owner_read(mut self) -> Self {
        self.0 |= Self::OWNER_READ;
        self
    }

    pub fn with_auth_write(mut self) -> Self {
        self.0 |= Self::AUTH_WRITE;
        self
    }

    pub fn with_auth_read(mut self) -> Self {
        self.0 |= Self::AUTH_READ;
        self
    }

    pub fn with_platform_create(mut self) -> Self {
        self.0 |= Self::PLATFORM_CREATE;
        self
    }

    pub fn with(mut self, bits: u32) -> Self {
        self.0 |= bits;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }
}

/// TPM structure tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    RspCommand = 0x00C4,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C4 => Some(TpmSt::RspCommand),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            0x0004 => Some(TpmEccCurve::NistP384),
            0x0005 => Some(TpmEccCurve::NistP521),
            _ => None,
        }
    }
}

/// Upper bound used when enumerating capabilities
pub const MAX_CAP_HANDLES: u32 = 0xFFFF_FFFF;
