//! Serde adapters for byte-valued JSON fields, which are base64-encoded on
//! the wire (salts, wrapped keys, xattr values, generic attributes).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

pub mod base64_vec {
    use super::*;

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}

pub mod base64_opt_vec {
    use super::*;

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        opt.map(|s| STANDARD.decode(&s).map_err(D::Error::custom))
            .transpose()
    }
}

pub mod base64_array16 {
    use super::*;

    pub fn serialize<S: Serializer>(v: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let bytes = decode_exact(d, 16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

pub mod base64_array32 {
    use super::*;

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let bytes = decode_exact(d, 32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

fn decode_exact<'de, D: Deserializer<'de>>(d: D, len: usize) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    let bytes = STANDARD.decode(&s).map_err(D::Error::custom)?;
    if bytes.len() != len {
        return Err(D::Error::custom(format!(
            "expected {len} base64-decoded bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
