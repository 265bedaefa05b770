//! Pre-shared key derivation
//!
//! HKDF-SHA256 expansion of a configured secret into codec key material.
//! Both peers configured with the same secret derive identical keys, which
//! is the [`KeySource`] contract the codec relies on.

use super::{CodecError, KeySource};
use ring::hkdf::{self, Salt, HKDF_SHA256};

const KEY_INFO: &[u8] = b"burrow stream key";

/// [`KeySource`] deriving key material from a pre-shared secret.
pub struct PresharedKeySource {
    prk: hkdf::Prk,
}

impl PresharedKeySource {
    /// Build a key source from the shared secret.
    pub fn new(secret: &[u8]) -> Self {
        let salt = Salt::new(HKDF_SHA256, &[0u8; 32]);

        Self {
            prk: salt.extract(secret),
        }
    }
}

impl KeySource for PresharedKeySource {
    fn get(&self, size: usize) -> Result<Vec<u8>, CodecError> {
        let info = [KEY_INFO];

        let okm = self
            .prk
            .expand(&info, HkdfLen(size))
            .map_err(|_| CodecError::KeySource("HKDF expand failed".to_string()))?;

        let mut material = vec![0u8; size];
        okm.fill(&mut material)
            .map_err(|_| CodecError::KeySource("HKDF fill failed".to_string()))?;

        Ok(material)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let a = PresharedKeySource::new(b"shared tunnel secret");
        let b = PresharedKeySource::new(b"shared tunnel secret");

        assert_eq!(a.get(32).unwrap(), b.get(32).unwrap());
        assert_eq!(a.get(16).unwrap(), b.get(16).unwrap());
    }

    #[test]
    fn test_different_secrets_differ() {
        let a = PresharedKeySource::new(b"secret one");
        let b = PresharedKeySource::new(b"secret two");

        assert_ne!(a.get(32).unwrap(), b.get(32).unwrap());
    }

    #[test]
    fn test_requested_length() {
        let source = PresharedKeySource::new(b"sized");

        assert_eq!(source.get(16).unwrap().len(), 16);
        assert_eq!(source.get(32).unwrap().len(), 32);
    }
}
