//! Version compatibility analysis
//!
//! Compares two versions of a plugin: semver majors (a major change is
//! breaking), dependency set differences (removed dependencies are
//! breaking, added ones require migration) and exported symbols (removed
//! exports are breaking).

use semver::Version;
use serde::Serialize;
use std::collections::HashSet;

use plugon_core::types::PluginVersionRecord;

/// Outcome of a compatibility check between two versions
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityReport {
    /// Whether the transition carries no breaking changes
    pub is_compatible: bool,

    /// Breaking changes found
    pub breaking_changes: Vec<String>,

    /// Non-breaking findings
    pub issues: Vec<String>,

    /// Whether consumers need a migration step
    pub migration_required: bool,
}

/// Analyze the transition `from -> to`
pub fn analyze(from: &PluginVersionRecord, to: &PluginVersionRecord) -> CompatibilityReport {
    let mut breaking_changes = Vec::new();
    let mut issues = Vec::new();
    let mut migration_required = false;

    match (Version::parse(&from.version), Version::parse(&to.version)) {
        (Ok(from_version), Ok(to_version)) => {
            if from_version.major != to_version.major {
                breaking_changes.push(format!(
                    "major version change {} -> {}",
                    from_version.major, to_version.major
                ));
            }
            if to_version < from_version {
                issues.push(format!(
                    "downgrade from {} to {}",
                    from.version, to.version
                ));
            }
        }
        _ => {
            breaking_changes.push(format!(
                "versions are not comparable: '{}' -> '{}'",
                from.version, to.version
            ));
        }
    }

    let from_deps: HashSet<&String> = from.dependencies.iter().collect();
    let to_deps: HashSet<&String> = to.dependencies.iter().collect();
    for removed in from_deps.difference(&to_deps) {
        breaking_changes.push(format!("dependency removed: {}", removed));
    }
    for added in to_deps.difference(&from_deps) {
        issues.push(format!("dependency added: {}", added));
        migration_required = true;
    }

    let from_exports: HashSet<&String> = from.exports.iter().collect();
    let to_exports: HashSet<&String> = to.exports.iter().collect();
    for removed in from_exports.difference(&to_exports) {
        breaking_changes.push(format!("export removed: {}", removed));
    }

    CompatibilityReport {
        is_compatible: breaking_changes.is_empty(),
        breaking_changes,
        issues,
        migration_required,
    }
}
