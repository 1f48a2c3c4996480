use std::fmt::{self, Write};

use sha2::{Digest, Sha256};

/// The extension of stable article files.
const EXTENSION: &str = "eml";

/// The stable file name of a cache key.
///
/// Keys are hashed so that the resulting path has a fixed length no matter how long the
/// key (for articles, the message-id) is, and so that it only contains safe characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: [u8; 32],
}

impl CacheKey {
    /// Hashes the given key.
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);
        Self { hash }
    }

    /// Returns the relative path of the stable file for this key.
    ///
    /// The first four bytes of the hash are used as two levels of subdirectories, to
    /// avoid huge flat directories.
    pub fn cache_path(&self) -> String {
        let mut path = String::with_capacity(64 + 3 + EXTENSION.len());
        let bytes = &self.hash;

        // The write can never fail for a `String`
        let _ = write!(path, "{:02x}/", bytes[0]);
        for b in &bytes[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &bytes[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('.');
        path.push_str(EXTENSION);

        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_paths() {
        let key = CacheKey::new("abc");
        assert_eq!(
            key.cache_path(),
            "ba/7816bf/8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad.eml"
        );
        assert_eq!(
            key.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fixed_length() {
        let short = CacheKey::new("<a@b>");
        let long = CacheKey::new(&format!("<{}@example.com>", "x".repeat(240)));
        assert_ne!(short, long);
        assert_eq!(short.cache_path().len(), long.cache_path().len());
    }
}
