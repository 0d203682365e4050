//! Per-purpose keys expanded from one app-state sync key.

use courier_crypto::error::CryptoError;
use courier_crypto::kdf::hkdf;
use zeroize::Zeroize;

const INFO: &[u8] = b"Courier App State Keys";

pub struct ExpandedKeys {
    pub index: [u8; 32],
    pub value_encryption: [u8; 32],
    pub value_mac: [u8; 32],
    pub snapshot_mac: [u8; 32],
    pub patch_mac: [u8; 32],
}

impl ExpandedKeys {
    pub fn derive(key_data: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut okm = [0u8; 160];
        hkdf(None, key_data, INFO, &mut okm)?;
        let take = |i: usize| {
            let mut key = [0u8; 32];
            key.copy_from_slice(&okm[i * 32..(i + 1) * 32]);
            key
        };
        let keys = Self {
            index: take(0),
            value_encryption: take(1),
            value_mac: take(2),
            snapshot_mac: take(3),
            patch_mac: take(4),
        };
        okm.zeroize();
        Ok(keys)
    }
}

impl Drop for ExpandedKeys {
    fn drop(&mut self) {
        self.index.zeroize();
        self.value_encryption.zeroize();
        self.value_mac.zeroize();
        self.snapshot_mac.zeroize();
        self.patch_mac.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_purpose_gets_a_distinct_key() {
        let keys = ExpandedKeys::derive(&[3; 32]).unwrap();
        let all = [
            keys.index,
            keys.value_encryption,
            keys.value_mac,
            keys.snapshot_mac,
            keys.patch_mac,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(ExpandedKeys::derive(&[3; 32]).unwrap().index, keys.index);
    }
}
