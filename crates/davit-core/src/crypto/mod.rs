pub mod kdf;
pub mod key;

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use ctr::Ctr128BE;
use poly1305::Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DavitError, Result};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Random per-message nonce, doubling as the CTR IV.
pub const NONCE_SIZE: usize = 16;
/// Poly1305 tag appended to the ciphertext.
pub const MAC_SIZE: usize = 16;
/// Ciphertext overhead: `nonce(16) || ct(n) || mac(16)`.
pub const EXTENSION: usize = NONCE_SIZE + MAC_SIZE;

/// Key for the Poly1305-AES MAC: `k` keys the AES-128 block that turns the
/// nonce into the per-message half of the Poly1305 key, `r` is the static
/// half (clamped by the Poly1305 implementation).
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MacKey {
    #[serde(with = "crate::serde_util::base64_array16")]
    pub k: [u8; 16],
    #[serde(with = "crate::serde_util::base64_array16")]
    pub r: [u8; 16],
}

/// The repository master key: AES-256 encryption key plus the MAC key pair.
/// Zeroized on drop so key material does not linger in memory.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    pub mac: MacKey,
    #[serde(with = "crate::serde_util::base64_array32")]
    pub encrypt: [u8; 32],
}

impl Key {
    /// Generate a fresh random key from OS entropy.
    pub fn generate() -> Self {
        let mut encrypt = [0u8; 32];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut encrypt);
        rand::rngs::OsRng.fill_bytes(&mut k);
        rand::rngs::OsRng.fill_bytes(&mut r);
        Key {
            mac: MacKey { k, r },
            encrypt,
        }
    }

    /// Build a key from 64 bytes of derived material: `encrypt(32) || k(16) || r(16)`.
    pub(crate) fn from_derived(material: &[u8; 64]) -> Self {
        let mut encrypt = [0u8; 32];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        encrypt.copy_from_slice(&material[..32]);
        k.copy_from_slice(&material[32..48]);
        r.copy_from_slice(&material[48..64]);
        Key {
            mac: MacKey { k, r },
            encrypt,
        }
    }

    /// Encrypt-then-MAC: AES-256-CTR keystream, Poly1305-AES over the
    /// ciphertext. Output layout is `nonce(16) || ct(n) || mac(16)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.encrypt_with_nonce(plaintext, &nonce)
    }

    /// Deterministic variant used by tests; production callers draw a fresh
    /// random nonce through `encrypt`.
    pub fn encrypt_with_nonce(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + EXTENSION);
        out.extend_from_slice(nonce);
        out.extend_from_slice(plaintext);

        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), nonce.into());
        cipher.apply_keystream(&mut out[NONCE_SIZE..]);

        let tag = self.poly1305_tag(&out[NONCE_SIZE..], nonce);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify the MAC in constant time, then decrypt. Layout as in `encrypt`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < EXTENSION {
            return Err(DavitError::MacMismatch);
        }
        let nonce: [u8; NONCE_SIZE] = data[..NONCE_SIZE].try_into().expect("length checked");
        let ct = &data[NONCE_SIZE..data.len() - MAC_SIZE];
        let mac = &data[data.len() - MAC_SIZE..];

        let expected = self.poly1305_tag(ct, &nonce);
        if !bool::from(expected.ct_eq(mac)) {
            return Err(DavitError::MacMismatch);
        }

        let mut plaintext = ct.to_vec();
        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), (&nonce).into());
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    /// Poly1305-AES: the per-message key half is AES-128_k(nonce), the static
    /// half is `r`. The Poly1305 implementation clamps `r` per the RFC.
    fn poly1305_tag(&self, msg: &[u8], nonce: &[u8; NONCE_SIZE]) -> [u8; MAC_SIZE] {
        let aes = Aes128::new((&self.mac.k).into());
        let mut s = *aes::cipher::generic_array::GenericArray::from_slice(nonce);
        aes.encrypt_block(&mut s);

        let mut poly_key = [0u8; 32];
        poly_key[..16].copy_from_slice(&self.mac.r);
        poly_key[16..].copy_from_slice(&s);

        let tag = Poly1305::new(poly1305::Key::from_slice(&poly_key)).compute_unpadded(msg);
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(tag.as_slice());
        poly_key.zeroize();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        let mut material = [0u8; 64];
        for (i, b) in material.iter_mut().enumerate() {
            *b = i as u8;
        }
        Key::from_derived(&material)
    }

    #[test]
    fn roundtrip() {
        let key = test_key();
        for len in [0usize, 1, 16, 17, 1024, 65537] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let ct = key.encrypt(&plaintext).unwrap();
            assert_eq!(ct.len(), plaintext.len() + EXTENSION);
            assert_eq!(key.decrypt(&ct).unwrap(), plaintext);
        }
    }

    #[test]
    fn tampering_detected() {
        let key = test_key();
        let ct = key.encrypt(b"some plaintext worth protecting").unwrap();
        for pos in 0..ct.len() {
            let mut bad = ct.clone();
            bad[pos] ^= 0x01;
            assert!(
                matches!(key.decrypt(&bad), Err(DavitError::MacMismatch)),
                "bit flip at {pos} must be detected"
            );
        }
    }

    #[test]
    fn wrong_key_rejected() {
        let ct = test_key().encrypt(b"payload").unwrap();
        let other = Key::generate();
        assert!(matches!(other.decrypt(&ct), Err(DavitError::MacMismatch)));
    }

    #[test]
    fn truncated_rejected() {
        let key = test_key();
        let ct = key.encrypt(b"payload").unwrap();
        assert!(key.decrypt(&ct[..EXTENSION - 1]).is_err());
        assert!(key.decrypt(&[]).is_err());
    }

    #[test]
    fn nonce_is_fresh() {
        let key = test_key();
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a, b, "two encryptions must differ in nonce");
    }
}
