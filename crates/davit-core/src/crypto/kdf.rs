use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::Key;
use crate::error::{DavitError, Result};

/// scrypt cost parameters stored alongside each wrapped key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(rename = "N")]
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            n: 32768,
            r: 8,
            p: 1,
        }
    }
}

pub const SALT_LEN: usize = 32;

// Bounds applied to parameters read from untrusted key records.
const MIN_N: u32 = 1 << 10;
const MAX_N: u32 = 1 << 22;
const MAX_R: u32 = 32;
const MAX_P: u32 = 16;
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

/// Reject cost parameters outside local policy before spending memory on them.
pub fn validate(params: &KdfParams, salt: &[u8]) -> Result<()> {
    if !params.n.is_power_of_two() || params.n < MIN_N || params.n > MAX_N {
        return Err(DavitError::PolicyRejection(format!(
            "scrypt N={} outside [{MIN_N}, {MAX_N}] or not a power of two",
            params.n
        )));
    }
    if params.r == 0 || params.r > MAX_R {
        return Err(DavitError::PolicyRejection(format!(
            "scrypt r={} outside [1, {MAX_R}]",
            params.r
        )));
    }
    if params.p == 0 || params.p > MAX_P {
        return Err(DavitError::PolicyRejection(format!(
            "scrypt p={} outside [1, {MAX_P}]",
            params.p
        )));
    }
    if salt.len() < MIN_SALT_LEN || salt.len() > MAX_SALT_LEN {
        return Err(DavitError::PolicyRejection(format!(
            "salt length {} outside [{MIN_SALT_LEN}, {MAX_SALT_LEN}]",
            salt.len()
        )));
    }
    Ok(())
}

/// Derive the 64-byte key-encryption material and split it into a `Key`.
pub fn derive(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<Key> {
    validate(params, salt)?;

    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, 64)
        .map_err(|e| DavitError::PolicyRejection(format!("scrypt params: {e}")))?;

    let mut material = Zeroizing::new([0u8; 64]);
    scrypt::scrypt(
        passphrase.as_bytes(),
        salt,
        &scrypt_params,
        material.as_mut_slice(),
    )
    .map_err(|e| DavitError::Other(format!("scrypt: {e}")))?;

    Ok(Key::from_derived(&material))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams { n: 1024, r: 8, p: 1 }
    }

    #[test]
    fn deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive("passphrase", &salt, &fast_params()).unwrap();
        let b = derive("passphrase", &salt, &fast_params()).unwrap();
        assert_eq!(a.encrypt, b.encrypt);
        assert_eq!(a.mac.k, b.mac.k);
        assert_eq!(a.mac.r, b.mac.r);
    }

    #[test]
    fn passphrase_matters() {
        let salt = [7u8; SALT_LEN];
        let a = derive("one", &salt, &fast_params()).unwrap();
        let b = derive("two", &salt, &fast_params()).unwrap();
        assert_ne!(a.encrypt, b.encrypt);
    }

    #[test]
    fn policy_bounds() {
        let salt = [0u8; SALT_LEN];
        let reject = |p: KdfParams| {
            matches!(
                derive("x", &salt, &p),
                Err(DavitError::PolicyRejection(_))
            )
        };
        assert!(reject(KdfParams { n: 1000, r: 8, p: 1 })); // not a power of two
        assert!(reject(KdfParams { n: 1 << 23, r: 8, p: 1 }));
        assert!(reject(KdfParams { n: 1024, r: 0, p: 1 }));
        assert!(reject(KdfParams { n: 1024, r: 8, p: 64 }));
        assert!(matches!(
            derive("x", &[0u8; 4], &fast_params()),
            Err(DavitError::PolicyRejection(_))
        ));
    }
}
