//! Configuration fingerprints
//!
//! Two agent configurations with the same behaviour-defining fields have the
//! same [`ContentHash`] regardless of version or provenance.

use std::fmt;

/// Blake3 digest over the JSON encoding of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Hash the JSON encoding of a value
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn of<T>(value: &T) -> Result<Self, HashError>
    where
        T: serde::Serialize + ?Sized,
    {
        let json = serde_json::to_vec(value)?;
        Ok(Self(blake3::hash(&json)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.to_hex().as_str())
    }
}

/// Fingerprint could not be computed
#[derive(Debug, thiserror::Error)]
#[error("serialization error: {0}")]
pub struct HashError(#[from] serde_json::Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn of_hashes_json_encoding() {
        let a = ContentHash::of(&vec!["no discounts"]).unwrap();
        let b = ContentHash::of(&vec!["no discounts"]).unwrap();
        let c = ContentHash::of(&vec!["no discounts", "ask for email"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 64);
    }
}
