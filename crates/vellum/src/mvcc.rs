use crate::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of the hex content hash inside a revision token.
pub const HASH_LEN: usize = 64;

/// A parsed revision token. The wire form is `"<rev>-<hash>"`: decimal
/// revision number (>= 1) and the fixed-width hex content hash. Clients
/// treat tokens as opaque and compare them only for equality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mvcc {
    pub rev: i64,
    pub hash: String,
}

impl Mvcc {
    pub fn new(rev: i64, hash: impl Into<String>) -> Mvcc {
        Mvcc {
            rev,
            hash: hash.into(),
        }
    }

    pub fn parse(token: &str) -> Result<Mvcc> {
        let bad = || Error::InvalidMvcc(token.to_owned());

        let (rev, hash) = token.split_once('-').ok_or_else(bad)?;
        if rev.is_empty() || !rev.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let rev: i64 = rev.parse().map_err(|_| bad())?;
        if rev < 1 {
            return Err(bad());
        }
        if hash.len() != HASH_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        Ok(Mvcc {
            rev,
            hash: hash.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Mvcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.rev, self.hash)
    }
}

/// Content hash of a JSON body: SHA-256 over its canonical text, so that
/// key order and number spelling never produce distinct hashes.
pub fn content_hash(body: &Value) -> String {
    let canonical = collation::to_canonical_string(body);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        let hash = content_hash(&json!({"x": 1}));
        let token = Mvcc::new(3, hash.clone()).to_string();
        let parsed = Mvcc::parse(&token).unwrap();
        assert_eq!(parsed.rev, 3);
        assert_eq!(parsed.hash, hash);
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in [
            "",
            "1",
            "-abc",
            "0-0000000000000000000000000000000000000000000000000000000000000000",
            "x-0000000000000000000000000000000000000000000000000000000000000000",
            "1-tooshort",
            "1-zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
        ] {
            assert!(Mvcc::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn hash_is_stable_across_spelling() {
        let a = serde_json::from_str::<serde_json::Value>(r#"{"a": 1, "b": 2.0}"#).unwrap();
        let b = serde_json::from_str::<serde_json::Value>(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"a": 1})));
    }
}
