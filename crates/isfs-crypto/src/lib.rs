#![forbid(unsafe_code)]
//! Cipher collaborator for the ISFS read path.
//!
//! The engine decrypts cluster groups with AES-128-CBC under a zero IV
//! that is reset per group — there is no cross-group chaining. On the
//! console the work is done by the AES engine's registers; here the
//! [`CryptoEngine`] trait abstracts that seam and [`SoftAes128Cbc`]
//! provides a software implementation for host tools and tests.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use isfs_error::{IsfsError, Result};
use isfs_types::{AES_BLOCK_SIZE, AES_KEY_SIZE, FormatVersion, HMAC_KEY_SIZE};

type CbcDec = cbc::Decryptor<Aes128>;
type CbcEnc = cbc::Encryptor<Aes128>;

/// Fixed-block decryption seam.
///
/// Implementations block until the operation completes; the engine issues
/// one call per cluster group with a fresh zero IV.
pub trait CryptoEngine: Send + Sync {
    /// Decrypt `buf` in place. `buf.len()` must be a multiple of the
    /// 16-byte cipher block size.
    fn decrypt(
        &self,
        key: &[u8; AES_KEY_SIZE],
        iv: &[u8; AES_BLOCK_SIZE],
        buf: &mut [u8],
    ) -> Result<()>;
}

/// Software AES-128-CBC engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftAes128Cbc;

impl CryptoEngine for SoftAes128Cbc {
    fn decrypt(
        &self,
        key: &[u8; AES_KEY_SIZE],
        iv: &[u8; AES_BLOCK_SIZE],
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.len() % AES_BLOCK_SIZE != 0 {
            return Err(IsfsError::Format(format!(
                "decrypt length {} is not a multiple of the AES block size",
                buf.len()
            )));
        }
        CbcDec::new(key.into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| IsfsError::Format("AES-CBC decryption failed".to_owned()))?;
        Ok(())
    }
}

/// Encrypt `buf` in place. Fixture helper for image builders only; the
/// engine itself is read-only and never encrypts.
pub fn cbc_encrypt(
    key: &[u8; AES_KEY_SIZE],
    iv: &[u8; AES_BLOCK_SIZE],
    buf: &mut [u8],
) -> Result<()> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(IsfsError::Format(format!(
            "encrypt length {} is not a multiple of the AES block size",
            buf.len()
        )));
    }
    let len = buf.len();
    CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| IsfsError::Format("AES-CBC encryption failed".to_owned()))?;
    Ok(())
}

/// The cipher/integrity key pair a mounted volume holds.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VolumeKeys {
    pub aes: [u8; AES_KEY_SIZE],
    pub hmac: [u8; HMAC_KEY_SIZE],
}

impl std::fmt::Debug for VolumeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("VolumeKeys { .. }")
    }
}

/// The two key pairs burned into the device's one-time-programmable
/// storage, selected by superblock format version at mount time.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OtpKeySet {
    pub wii_nand_key: [u8; AES_KEY_SIZE],
    pub wii_nand_hmac: [u8; HMAC_KEY_SIZE],
    pub nand_key: [u8; AES_KEY_SIZE],
    pub nand_hmac: [u8; HMAC_KEY_SIZE],
}

/// Packed key-file length: aes0 | hmac0 | aes1 | hmac1.
pub const KEYFILE_LEN: usize = 2 * (AES_KEY_SIZE + HMAC_KEY_SIZE);

impl OtpKeySet {
    /// Parse the packed 72-byte key-file layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEYFILE_LEN {
            return Err(IsfsError::Format(format!(
                "key file must be exactly {KEYFILE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut keys = Self {
            wii_nand_key: [0; AES_KEY_SIZE],
            wii_nand_hmac: [0; HMAC_KEY_SIZE],
            nand_key: [0; AES_KEY_SIZE],
            nand_hmac: [0; HMAC_KEY_SIZE],
        };
        let mut at = 0;
        keys.wii_nand_key.copy_from_slice(&bytes[at..at + AES_KEY_SIZE]);
        at += AES_KEY_SIZE;
        keys.wii_nand_hmac.copy_from_slice(&bytes[at..at + HMAC_KEY_SIZE]);
        at += HMAC_KEY_SIZE;
        keys.nand_key.copy_from_slice(&bytes[at..at + AES_KEY_SIZE]);
        at += AES_KEY_SIZE;
        keys.nand_hmac.copy_from_slice(&bytes[at..at + HMAC_KEY_SIZE]);
        Ok(keys)
    }

    /// Select the key pair for a superblock format version. Version 0
    /// volumes use the legacy pair, version 1 the current pair.
    #[must_use]
    pub fn keys_for(&self, version: FormatVersion) -> VolumeKeys {
        match version {
            FormatVersion::V0 => VolumeKeys {
                aes: self.wii_nand_key,
                hmac: self.wii_nand_hmac,
            },
            FormatVersion::V1 => VolumeKeys {
                aes: self.nand_key,
                hmac: self.nand_hmac,
            },
        }
    }
}

impl std::fmt::Debug for OtpKeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OtpKeySet { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_inverts_encrypt() {
        let key = [0x11u8; AES_KEY_SIZE];
        let iv = [0u8; AES_BLOCK_SIZE];
        let plaintext: Vec<u8> = (0..64).map(|i| i as u8).collect();

        let mut buf = plaintext.clone();
        cbc_encrypt(&key, &iv, &mut buf).expect("encrypt");
        assert_ne!(buf, plaintext);

        SoftAes128Cbc.decrypt(&key, &iv, &mut buf).expect("decrypt");
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_rejects_partial_blocks() {
        let key = [0u8; AES_KEY_SIZE];
        let iv = [0u8; AES_BLOCK_SIZE];
        let mut buf = vec![0u8; 17];
        assert!(SoftAes128Cbc.decrypt(&key, &iv, &mut buf).is_err());
        assert!(cbc_encrypt(&key, &iv, &mut buf).is_err());
    }

    #[test]
    fn test_keyfile_roundtrip() {
        let mut bytes = vec![0u8; KEYFILE_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let keys = OtpKeySet::from_bytes(&bytes).expect("keyset");
        assert_eq!(keys.wii_nand_key[0], 0);
        assert_eq!(keys.wii_nand_hmac[0], 16);
        assert_eq!(keys.nand_key[0], 36);
        assert_eq!(keys.nand_hmac[0], 52);

        let v0 = keys.keys_for(FormatVersion::V0);
        let v1 = keys.keys_for(FormatVersion::V1);
        assert_eq!(v0.aes, keys.wii_nand_key);
        assert_eq!(v1.aes, keys.nand_key);
        assert_ne!(v0.aes, v1.aes);

        assert!(OtpKeySet::from_bytes(&bytes[..40]).is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let keys = OtpKeySet::from_bytes(&[0xAB; KEYFILE_LEN]).expect("keyset");
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains("AB"));
        assert!(!rendered.contains("171"));
    }
}
