//! Deterministic hashing for business keys, rows and artifacts.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::frame::encode::canonical_json;
use crate::frame::Scalar;

type Blake2b256 = Blake2b<U32>;

/// Separator between business-key values; chosen so natural field content
/// never collides with the concatenation boundaries.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// BLAKE2b-256 of the business-key values joined with `\x1f`.
pub fn hash_business_key(values: &[Scalar]) -> String {
    let joined = values
        .iter()
        .map(Scalar::key_repr)
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string());
    let mut hasher = Blake2b256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Int(i) => Value::from(*i),
        Scalar::Float(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number)
            } else {
                Value::Null
            }
        }
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::String(s) | Scalar::Encoded(s) => Value::String(s.clone()),
    }
}

/// BLAKE2b-256 of the canonical JSON serialization of the named row-hash
/// fields. Canonical form sorts keys and fixes float precision, so the hash
/// is independent of field arrival order and float formatting noise.
pub fn hash_row(fields: &[(String, Scalar)]) -> String {
    let mut map = Map::new();
    for (name, value) in fields {
        map.insert(name.clone(), scalar_to_json(value));
    }
    let canonical = canonical_json(&Value::Object(map));
    let mut hasher = Blake2b256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = [0u8; 65536];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// BLAKE2b-256 of a finalized artifact file.
pub fn blake2b256_file(path: &Path) -> io::Result<String> {
    digest_file::<Blake2b256>(path)
}

/// SHA-256 of a file, used for the `meta.sha256` sidecar.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    digest_file::<Sha256>(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_key_depends_only_on_key_values() {
        let a = hash_business_key(&[Scalar::Int(123)]);
        let b = hash_business_key(&[Scalar::Int(123)]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = hash_business_key(&[Scalar::Int(124)]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_business_key_null_renders_empty() {
        let with_null = hash_business_key(&[Scalar::Null, Scalar::Int(1)]);
        let with_empty = hash_business_key(&[Scalar::String(String::new()), Scalar::Int(1)]);
        assert_eq!(with_null, with_empty);
    }

    #[test]
    fn test_row_hash_ignores_field_order() {
        let forward = hash_row(&[
            ("a".into(), Scalar::Int(1)),
            ("b".into(), Scalar::String("x".into())),
        ]);
        let reversed = hash_row(&[
            ("b".into(), Scalar::String("x".into())),
            ("a".into(), Scalar::Int(1)),
        ]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_row_hash_nan_matches_null() {
        let nan = hash_row(&[("v".into(), Scalar::Float(f64::NAN))]);
        let null = hash_row(&[("v".into(), Scalar::Null)]);
        assert_eq!(nan, null);
    }
}
