//! HKDF and HMAC helpers over SHA-256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, out)
        .map_err(|_| CryptoError::InvalidKey(format!("hkdf output length {}", out.len())))
}

/// HKDF expand step only, with `prk` used directly as the pseudorandom key.
pub fn hkdf_expand(prk: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| CryptoError::InvalidKey("hkdf prk too short".into()))?;
    hk.expand(info, out)
        .map_err(|_| CryptoError::InvalidKey(format!("hkdf output length {}", out.len())))
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("hmac key".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC check.
pub fn verify_hmac_sha256(
    key: &[u8],
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<(), CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("hmac key".into()))?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected)
        .map_err(|_| CryptoError::InvalidSignature("mac mismatch"))
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
