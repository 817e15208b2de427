//! Blowfish-CFB block encryption.
//!
//! Keying is the caller-supplied secret used directly (4–56 bytes, the
//! Blowfish key range); there is no key derivation step in this format.
//! The IV is the literal 8 bytes `"fsarchiv"`, constant across every block
//! of every archive.  That constant IV is a known weakness — identical
//! plaintext blocks under the same key produce identical ciphertext — but
//! it is part of the frozen format and must be preserved; a future format
//! revision would carry a per-block IV.
//!
//! CFB is a stream mode: ciphertext length equals plaintext length, so an
//! encrypted block's on-archive size equals its compressed size.

use blowfish::Blowfish;
use cfb_mode::cipher::{AsyncStreamCipher, InnerIvInit, KeyInit};
use cfb_mode::{Decryptor, Encryptor};
use thiserror::Error;

/// The format's fixed 8-byte cipher IV.
pub const CIPHER_IV: &[u8; 8] = b"fsarchiv";

/// Blowfish key length bounds in bytes.
pub const MIN_KEY_LEN: usize = 4;
pub const MAX_KEY_LEN: usize = 56;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// An encrypted block was met without a configured key.
    #[error("block is encrypted but no password was provided")]
    MissingKey,
    #[error("cipher key must be {MIN_KEY_LEN}..={MAX_KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    /// Post-decipher size disagrees with the recorded compressed size.
    #[error("deciphered size {actual} does not match recorded size {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("cipher initialisation failed")]
    CipherInit,
}

/// Validate a key against the Blowfish bounds.
pub fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    Ok(())
}

fn blowfish(key: &[u8]) -> Result<Blowfish, CryptoError> {
    check_key(key)?;
    Blowfish::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))
}

/// Encrypt `data` in place with Blowfish-CFB and the format IV.
pub fn encrypt_block(key: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    let enc = Encryptor::inner_iv_slice_init(blowfish(key)?, CIPHER_IV)
        .map_err(|_| CryptoError::CipherInit)?;
    enc.encrypt(data);
    Ok(())
}

/// Decrypt `data` in place with Blowfish-CFB and the format IV.
pub fn decrypt_block(key: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    let dec = Decryptor::inner_iv_slice_init(blowfish(key)?, CIPHER_IV)
        .map_err(|_| CryptoError::CipherInit)?;
    dec.decrypt(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_length() {
        // 1037 is deliberately not a multiple of the 8-byte block size.
        let plain: Vec<u8> = (0u32..1037).map(|i| (i * 7 % 256) as u8).collect();
        let mut buf = plain.clone();
        encrypt_block(b"hunter2!", &mut buf).unwrap();
        assert_eq!(buf.len(), plain.len());
        assert_ne!(buf, plain);
        decrypt_block(b"hunter2!", &mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn constant_iv_means_deterministic_ciphertext() {
        // Known property of the format (and its weakness): same key + same
        // plaintext always yields the same ciphertext.
        let plain = vec![0x42u8; 64];
        let mut a = plain.clone();
        let mut b = plain;
        encrypt_block(b"same-key", &mut a).unwrap();
        encrypt_block(b"same-key", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_key_does_not_recover_plaintext() {
        let plain = b"confidential filesystem contents".to_vec();
        let mut buf = plain.clone();
        encrypt_block(b"right-key", &mut buf).unwrap();
        decrypt_block(b"wrong-key", &mut buf).unwrap();
        assert_ne!(buf, plain);
    }

    #[test]
    fn key_length_is_validated() {
        let mut buf = [0u8; 16];
        assert_eq!(
            encrypt_block(b"abc", &mut buf),
            Err(CryptoError::BadKeyLength(3))
        );
        assert_eq!(
            encrypt_block(&[0u8; 57], &mut buf),
            Err(CryptoError::BadKeyLength(57))
        );
        assert!(encrypt_block(&[7u8; 56], &mut buf).is_ok());
    }
}
