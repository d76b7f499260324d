//! Key Normalization
//!
//! The local tier keys entries by the caller's string form; remote tiers key
//! them by a hex digest of that string so arbitrary keys fit the wire
//! protocol's key limits.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// One-way digest used to build remote keys
pub trait KeyDigest: Send + Sync {
    /// Digest the UTF-8 bytes of a key into a printable string
    fn digest(&self, input: &[u8]) -> Result<String>;
}

/// Lowercase hex SHA-1
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hex;

impl KeyDigest for Sha1Hex {
    fn digest(&self, input: &[u8]) -> Result<String> {
        Ok(sha1_hex(input))
    }
}

#[inline]
fn sha1_hex(input: &[u8]) -> String {
    hex::encode(Sha1::digest(input))
}

/// Key normalization for one tier
#[derive(Clone)]
pub enum KeyCodec {
    /// String form as-is (local tier)
    Local,
    /// Digest of the string form (remote tiers)
    Remote(Arc<dyn KeyDigest>),
}

impl Default for KeyCodec {
    fn default() -> Self {
        KeyCodec::Local
    }
}

impl std::fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyCodec::Local => write!(f, "KeyCodec::Local"),
            KeyCodec::Remote(_) => write!(f, "KeyCodec::Remote"),
        }
    }
}

impl KeyCodec {
    /// Remote codec with the built-in SHA-1 digest
    pub fn sha1() -> Self {
        KeyCodec::Remote(Arc::new(Sha1Hex))
    }

    /// Remote codec with a custom digest
    pub fn with_digest(digest: Arc<dyn KeyDigest>) -> Self {
        KeyCodec::Remote(digest)
    }

    /// Normalize a key. Empty keys are rejected.
    ///
    /// A failing custom digest falls back to SHA-1 so a hashing problem never
    /// aborts a cache write.
    pub fn normalize(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".to_string()));
        }

        match self {
            KeyCodec::Local => Ok(key.to_string()),
            KeyCodec::Remote(digest) => match digest.digest(key.as_bytes()) {
                Ok(hashed) => Ok(hashed),
                Err(e) => {
                    tracing::error!(key, error = %e, "Key digest failed, using default SHA-1 key");
                    Ok(sha1_hex(key.as_bytes()))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct BrokenDigest;

    impl KeyDigest for BrokenDigest {
        fn digest(&self, _input: &[u8]) -> Result<String> {
            Err(Error::Config("digest unavailable".into()))
        }
    }

    #[test]
    fn test_local_is_identity() {
        let codec = KeyCodec::Local;
        assert_eq!(codec.normalize("user:42").unwrap(), "user:42");
    }

    #[test]
    fn test_sha1_known_vectors() {
        let codec = KeyCodec::sha1();
        assert_eq!(
            codec.normalize("abc").unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            codec.normalize("key").unwrap(),
            "a62f2225bf70bfaccbc7f1ef2a397836717377de"
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            KeyCodec::Local.normalize(""),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            KeyCodec::sha1().normalize(""),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_broken_digest_falls_back() {
        let codec = KeyCodec::with_digest(Arc::new(BrokenDigest));
        assert_eq!(
            codec.normalize("abc").unwrap(),
            KeyCodec::sha1().normalize("abc").unwrap()
        );
    }

    proptest! {
        #[test]
        fn prop_remote_keys_are_fixed_width_hex(key in ".{1,64}") {
            let hashed = KeyCodec::sha1().normalize(&key).unwrap();
            prop_assert_eq!(hashed.len(), 40);
            prop_assert!(hashed.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            prop_assert_eq!(hashed, KeyCodec::sha1().normalize(&key).unwrap());
        }
    }
}
