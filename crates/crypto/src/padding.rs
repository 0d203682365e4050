//! Random-length plaintext padding applied before every encryption.
//!
//! `n` bytes of value `n` are appended, with `n` drawn from
//! `1..=MAX_PADDING`, so the final byte is never zero.

use courier_shared::constants::MAX_PADDING;
use rand::Rng;

use crate::error::CryptoError;

pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let count: u8 = rand::rng().random_range(1..=MAX_PADDING);
    let mut out = Vec::with_capacity(plaintext.len() + usize::from(count));
    out.extend_from_slice(plaintext);
    out.resize(plaintext.len() + usize::from(count), count);
    out
}

/// Strip padding added by [`pad`], rejecting anything malformed.
pub fn unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    let &count = padded.last().ok_or(CryptoError::InvalidPadding)?;
    if count == 0 || count > MAX_PADDING || usize::from(count) > padded.len() {
        return Err(CryptoError::InvalidPadding);
    }
    let (body, padding) = padded.split_at(padded.len() - usize::from(count));
    if padding.iter().any(|&b| b != count) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpad_reverses_pad_for_all_lengths_up_to_1000() {
        for len in 0..=1000usize {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let padded = pad(&plaintext);
            assert_ne!(*padded.last().unwrap(), 0);
            assert!(padded.len() > plaintext.len());
            assert!(padded.len() <= plaintext.len() + usize::from(MAX_PADDING));
            assert_eq!(unpad(&padded).unwrap(), plaintext.as_slice());
        }
    }

    #[test]
    fn plaintext_ending_in_padding_like_bytes_survives() {
        let plaintext = [3u8, 3, 3];
        let padded = pad(&plaintext);
        assert_eq!(unpad(&padded).unwrap(), &plaintext);
    }

    #[test]
    fn unpad_rejects_empty_input() {
        assert!(matches!(unpad(&[]), Err(CryptoError::InvalidPadding)));
    }

    #[test]
    fn unpad_rejects_zero_count() {
        assert!(unpad(b"hello\x00").is_err());
    }

    #[test]
    fn unpad_rejects_count_larger_than_input() {
        assert!(unpad(&[5, 5]).is_err());
    }

    #[test]
    fn unpad_rejects_count_above_maximum() {
        let mut data = vec![0u8; 40];
        data.extend(std::iter::repeat(16u8).take(16));
        assert!(unpad(&data).is_err());
    }

    #[test]
    fn unpad_rejects_non_uniform_padding() {
        assert!(unpad(b"abc\x01\x03\x03").is_err());
    }
}
