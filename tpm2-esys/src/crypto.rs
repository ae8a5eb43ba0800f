// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic helpers used by sessions
//!
//! Digests, HMAC, the TPM key derivation function (KDFa, SP 800-108 counter
//! mode), parameter encryption and RSA-OAEP salt protection.

use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::Mac;
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha2::Digest;
use zeroize::Zeroizing;

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};
use crate::types::{TpmtPublic, TpmtSymDef};

/// Label used when encrypting a session salt to a TPM key
pub const SALT_LABEL: &str = "SECRET\0";

/// AES block size, also the CFB IV size
const AES_BLOCK_SIZE: usize = 16;

macro_rules! with_hash {
    ($alg:expr, $H:ident => $body:expr) => {
        match $alg {
            TpmAlgId::Sha1 => {
                type $H = sha1::Sha1;
                $body
            }
            TpmAlgId::Sha256 => {
                type $H = sha2::Sha256;
                $body
            }
            TpmAlgId::Sha384 => {
                type $H = sha2::Sha384;
                $body
            }
            TpmAlgId::Sha512 => {
                type $H = sha2::Sha512;
                $body
            }
            other => return Err(Error::Unsupported(format!("hash algorithm {other:?}"))),
        }
    };
}

/// Hash the concatenation of `parts`
pub fn digest(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    with_hash!(alg, H => {
        let mut h = H::new();
        for part in parts {
            h.update(part);
        }
        Ok(h.finalize().to_vec())
    })
}

/// HMAC over the concatenation of `parts`. An empty key is valid.
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    with_hash!(alg, H => {
        let mut mac = hmac::Hmac::<H>::new_from_slice(key)
            .map_err(|_| Error::Unsupported("HMAC key length".into()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    })
}

/// Constant-time check of an HMAC over `parts`
pub fn hmac_verify(alg: TpmAlgId, key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<bool> {
    with_hash!(alg, H => {
        let mut mac = hmac::Hmac::<H>::new_from_slice(key)
            .map_err(|_| Error::Unsupported("HMAC key length".into()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.verify_slice(expected).is_ok())
    })
}

/// KDFa from TPM 2.0 Part 1 §11.4.10.2. The label is NUL-terminated here
/// if the caller did not do so.
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut label = label.as_bytes().to_vec();
    if label.last() != Some(&0) {
        label.push(0);
    }
    let bytes = bits.div_ceil(8);
    let bits_be = (bits as u32).to_be_bytes();

    let mut out = Zeroizing::new(Vec::with_capacity(bytes + 64));
    let mut counter: u32 = 0;
    while out.len() < bytes {
        counter += 1;
        let block = Zeroizing::new(hmac(
            alg,
            key,
            &[&counter.to_be_bytes(), &label, context_u, context_v, &bits_be],
        )?);
        out.extend_from_slice(&block);
    }
    out.truncate(bytes);
    if bits % 8 != 0 {
        out[0] &= (1u8 << (bits % 8)) - 1;
    }
    Ok(out)
}

/// Strip trailing zero bytes from an auth value, as the TPM does
pub fn trim_auth(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

/// Bind value of an entity: its Name with the auth value XORed into the
/// leading bytes, zero-extended when the auth value is longer.
pub fn bind_value(name: &[u8], auth: &[u8]) -> Vec<u8> {
    let auth = trim_auth(auth);
    let mut out = name.to_vec();
    if out.len() < auth.len() {
        out.resize(auth.len(), 0);
    }
    for (o, a) in out.iter_mut().zip(auth) {
        *o ^= a;
    }
    out
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

macro_rules! with_aes {
    ($key_bits:expr, $A:ident => $body:expr) => {
        match $key_bits {
            128 => {
                type $A = aes::Aes128;
                $body
            }
            192 => {
                type $A = aes::Aes192;
                $body
            }
            256 => {
                type $A = aes::Aes256;
                $body
            }
            other => return Err(Error::Unsupported(format!("AES key size {other}"))),
        }
    };
}

fn cfb(key_bits: u16, key_iv: &[u8], data: &mut [u8], encrypt: bool) -> Result<()> {
    let key_len = key_bits as usize / 8;
    if key_iv.len() != key_len + AES_BLOCK_SIZE {
        return Err(Error::Unsupported(format!(
            "CFB key material of {} bytes for AES-{key_bits}",
            key_iv.len()
        )));
    }
    let (key, iv) = key_iv.split_at(key_len);
    with_aes!(key_bits, A => {
        if encrypt {
            cfb_mode::Encryptor::<A>::new_from_slices(key, iv)
                .map_err(|_| Error::Unsupported("CFB key or IV length".into()))?
                .encrypt(data);
        } else {
            cfb_mode::Decryptor::<A>::new_from_slices(key, iv)
                .map_err(|_| Error::Unsupported("CFB key or IV length".into()))?
                .decrypt(data);
        }
        Ok(())
    })
}

/// Which way parameter data is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptDirection {
    Encrypt,
    Decrypt,
}

/// Transform the data bytes of a sized parameter in place with the session's
/// symmetric algorithm. `nonce_newer` is the nonce of the party that produced
/// the data.
pub fn param_crypt(
    symmetric: &TpmtSymDef,
    hash: TpmAlgId,
    session_value: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    data: &mut [u8],
    direction: CryptDirection,
) -> Result<()> {
    match *symmetric {
        TpmtSymDef::Null => Err(Error::Usage(
            "parameter encryption needs a session with a symmetric algorithm".into(),
        )),
        // The mask is derived with the session hash, not the one in the
        // symmetric definition
        TpmtSymDef::Xor(_) => {
            let mask = kdfa(
                hash,
                session_value,
                "XOR",
                nonce_newer,
                nonce_older,
                data.len() * 8,
            )?;
            for (d, m) in data.iter_mut().zip(mask.iter()) {
                *d ^= m;
            }
            Ok(())
        }
        TpmtSymDef::Aes { key_bits, mode } => {
            if mode != TpmAlgId::Cfb {
                return Err(Error::Unsupported(format!(
                    "parameter encryption mode {mode:?}"
                )));
            }
            let key_iv = kdfa(
                hash,
                session_value,
                "CFB",
                nonce_newer,
                nonce_older,
                key_bits as usize + AES_BLOCK_SIZE * 8,
            )?;
            cfb(key_bits, &key_iv, data, direction == CryptDirection::Encrypt)
        }
    }
}

/// Encrypt a session salt to the public key of a loaded TPM key.
/// Only RSA keys are supported.
pub fn encrypt_salt(public: &TpmtPublic, salt: &[u8]) -> Result<Vec<u8>> {
    let Some((modulus, exponent)) = public.rsa_public() else {
        return Err(Error::Unsupported(format!(
            "salting with a {:?} key",
            public.type_alg
        )));
    };
    let exponent = if exponent == 0 { 65537 } else { exponent };
    let key = RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from(exponent))
        .map_err(|e| Error::Unsupported(format!("RSA salt key: {e}")))?;

    let mut rng = rand::thread_rng();
    let encrypted = match public.name_alg {
        TpmAlgId::Sha1 => key.encrypt(&mut rng, Oaep::new_with_label::<sha1::Sha1, _>(SALT_LABEL), salt),
        TpmAlgId::Sha256 => {
            key.encrypt(&mut rng, Oaep::new_with_label::<sha2::Sha256, _>(SALT_LABEL), salt)
        }
        TpmAlgId::Sha384 => {
            key.encrypt(&mut rng, Oaep::new_with_label::<sha2::Sha384, _>(SALT_LABEL), salt)
        }
        TpmAlgId::Sha512 => {
            key.encrypt(&mut rng, Oaep::new_with_label::<sha2::Sha512, _>(SALT_LABEL), salt)
        }
        other => return Err(Error::Unsupported(format!("OAEP with {other:?}"))),
    };
    encrypted.map_err(|e| Error::Unsupported(format!("RSA-OAEP salt encryption: {e}")))
}
