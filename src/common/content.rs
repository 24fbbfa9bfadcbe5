//! Helper functions for content-addressed payloads.

use sha1_smol::Sha1;

use super::ID_SIZE;
use crate::common::Id;

/// Returns `true` if `content_id` is the hash of `payload`.
pub fn validate_content(payload: &[u8], content_id: &Id) -> bool {
    &hash_content(payload) == content_id.as_bytes()
}

/// SHA-1 of the payload, the content address of a cache entry.
pub fn hash_content(payload: &[u8]) -> [u8; ID_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(payload);

    hasher.digest().bytes()
}

/// Content id of the payload.
pub fn content_id(payload: &[u8]) -> Id {
    Id::from(hash_content(payload))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_validate_content() {
        let v = b"hello overlay";
        let target = content_id(v);

        assert!(validate_content(v, &target));
        assert!(!validate_content(&v[1..], &target));
    }

    #[test]
    fn test_hash_content() {
        // sha1("abc")
        let target = Id::from_str("a9993e364706816aba3e25717850c26c9cd0d89d").unwrap();

        assert_eq!(hash_content(b"abc"), *target.as_bytes());
    }
}
