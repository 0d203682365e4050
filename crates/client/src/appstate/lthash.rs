//! Order-independent summation hash over the value MACs of a category.
//!
//! Each item is expanded to 128 bytes and added (or subtracted) as 64
//! little-endian u16 lanes with wrapping arithmetic, so the hash of a set
//! can be maintained incrementally as entries come and go.

use courier_crypto::error::CryptoError;
use courier_crypto::kdf::hkdf;

pub const LT_HASH_LEN: usize = 128;

const INFO: &[u8] = b"Courier Patch Integrity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LtHash([u8; LT_HASH_LEN]);

impl Default for LtHash {
    fn default() -> Self {
        Self([0; LT_HASH_LEN])
    }
}

impl LtHash {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn add(&mut self, item: &[u8]) -> Result<(), CryptoError> {
        let expanded = expand(item)?;
        self.combine(&expanded, u16::wrapping_add);
        Ok(())
    }

    pub fn subtract(&mut self, item: &[u8]) -> Result<(), CryptoError> {
        let expanded = expand(item)?;
        self.combine(&expanded, u16::wrapping_sub);
        Ok(())
    }

    fn combine(&mut self, other: &[u8; LT_HASH_LEN], op: fn(u16, u16) -> u16) {
        for (lane, item) in self.0.chunks_exact_mut(2).zip(other.chunks_exact(2)) {
            let a = u16::from_le_bytes([lane[0], lane[1]]);
            let b = u16::from_le_bytes([item[0], item[1]]);
            lane.copy_from_slice(&op(a, b).to_le_bytes());
        }
    }
}

fn expand(item: &[u8]) -> Result<[u8; LT_HASH_LEN], CryptoError> {
    let mut out = [0u8; LT_HASH_LEN];
    hkdf(None, item, INFO, &mut out)?;
    Ok(out)
}
