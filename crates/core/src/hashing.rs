//! SHA-256 hex digests used for artifact identity and completion
//! fingerprints.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Order-independent digest of a set of identity strings.
///
/// An empty set still produces a stable digest, so repeated empty
/// signals compare equal.
pub fn set_fingerprint<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parts: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
    parts.sort();
    parts.dedup();
    sha256_hex(parts.join("\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_ignores_order_and_duplicates() {
        let a = set_fingerprint(["path:/b.png", "path:/a.png"]);
        let b = set_fingerprint(["path:/a.png", "path:/b.png", "path:/a.png"]);
        assert_eq!(a, b);
        assert_ne!(a, set_fingerprint(["path:/a.png"]));
    }

    #[test]
    fn empty_set_fingerprint_is_stable() {
        let empty: [&str; 0] = [];
        assert_eq!(set_fingerprint(empty), set_fingerprint(Vec::<String>::new()));
    }
}
