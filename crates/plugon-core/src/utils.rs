//! Utility functions for Plugon
//!
//! Small helpers shared across the workspace: digests, id generation,
//! version ordering and blob naming.

use chrono::{DateTime, Utc};
use semver::Version;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// SHA-256 of the given bytes, hex-encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Generate a unique identifier
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Get the current timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Blob key for a plugin version: `{name}-{version}.zip`
pub fn blob_key(name: &str, version: &str) -> String {
    format!("{}-{}.zip", name, version)
}

/// Compare two version strings, newest first
///
/// Parseable semver compares by the triple with pre-release tags ordering
/// below the corresponding release; non-parseable versions fall back to
/// lexical descending and sort after parseable ones.
pub fn compare_versions_desc(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => vb.cmp(&va),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => b.cmp(a),
    }
}

/// Format a duration in a human-readable form
pub fn format_duration(duration: std::time::Duration) -> String {
    if duration.as_secs() < 60 {
        format!("{}ms", duration.as_millis())
    } else if duration.as_secs() < 3600 {
        format!("{}s", duration.as_secs())
    } else {
        format!(
            "{}h {}m",
            duration.as_secs() / 3600,
            (duration.as_secs() % 3600) / 60
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn test_sha256_hex() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_hex(b"plugon").len(), 64);
    }

    #[test]
    fn test_id_generation() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test]
    fn test_blob_key() {
        assert_eq!(blob_key("greeter", "1.0.0"), "greeter-1.0.0.zip");
    }

    #[test]
    fn test_version_ordering() {
        let mut versions = vec!["1.0.0", "2.0.0", "1.1.0", "2.0.0-beta.1"];
        versions.sort_by(|a, b| compare_versions_desc(a, b));
        assert_eq!(versions, vec!["2.0.0", "2.0.0-beta.1", "1.1.0", "1.0.0"]);
    }

    #[test]
    fn test_non_semver_sorts_after_semver() {
        let mut versions = vec!["not-a-version", "1.0.0", "zzz"];
        versions.sort_by(|a, b| compare_versions_desc(a, b));
        assert_eq!(versions, vec!["1.0.0", "zzz", "not-a-version"]);
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(3660)), "1h 1m");
    }
}
