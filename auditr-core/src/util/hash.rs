use sha2::{Digest, Sha256};

/// Stable hex-encoded SHA-256 of `token`. Not used for anything
/// security-sensitive; this is a convenient, collision-resistant way to turn
/// an arbitrary identity string into a bucket id (see [`fingerprint`]).
pub fn sha256(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// A deterministic, non-cryptographic-in-purpose hash of an event's
/// identity, used only to pick a concurrent batch bucket. Two calls with the same `identity` always
/// produce the same fingerprint, satisfying the bucket-stability invariant.
pub fn fingerprint(identity: &str) -> u64 {
    let digest = sha256(identity);
    u64::from_str_radix(&digest[..16], 16).unwrap_or(0)
}

/// Reduces a fingerprint to a bucket id in `0..width`. `width` of zero always
/// yields bucket 0 rather than panicking on modulo-by-zero, since a
/// misconfigured `maxConcurrentBatches` of zero should degrade gracefully to
/// a single shared bucket rather than crash the hot path.
pub fn bucket_id(fp: u64, width: usize) -> usize {
    if width == 0 {
        0
    } else {
        (fp % width as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::{bucket_id, fingerprint, sha256};

    #[test]
    fn test_hash_with_sha256() {
        assert_eq!(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            sha256("hello world")
        );
        assert_eq!(
            "8a5edab282632443219e051e4ade2d1d5bbc671c781051bf1437897cbdfea0f1",
            sha256("/")
        );
        assert_eq!(
            "439b41782a6650352640cb3ab790a1151d23dd093f4f49577799c6b67f8d195c",
            sha256("/ping")
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let identity = "org-1:GET:/person/:id:1700000000";
        assert_eq!(fingerprint(identity), fingerprint(identity));
    }

    #[test]
    fn fingerprint_differs_for_different_identity() {
        let a = fingerprint("org-1:GET:/a:1700000000");
        let b = fingerprint("org-1:GET:/b:1700000000");
        assert_ne!(a, b);
    }

    #[test]
    fn bucket_id_is_stable_and_in_range() {
        let fp = fingerprint("org-1:GET:/person/:id:1700000000");
        let a = bucket_id(fp, 8);
        let b = bucket_id(fp, 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn bucket_id_zero_width_is_safe() {
        assert_eq!(bucket_id(12345, 0), 0);
    }
}
