//! Manifest extraction and schema validation
//!
//! The manifest check verifies field presence, length bounds and the
//! identifier patterns. Any error rejects the bundle; warnings are
//! non-fatal and surface in the verdict.

use regex::Regex;
use std::io::{Cursor, Read};
use std::sync::OnceLock;
use tracing::{debug, instrument};
use zip::ZipArchive;

use plugon_common::{PlugonError, Result};
use plugon_core::types::{PluginManifest, ValidationVerdict};

/// File every bundle must contain at its root
pub const MANIFEST_FILE: &str = "plugin.manifest.json";

const MAX_DESCRIPTION_LEN: usize = 1000;
const MAX_AUTHOR_LEN: usize = 200;
const MAX_LICENSE_LEN: usize = 100;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{2,50}$").expect("static pattern"))
}

fn version_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+(-[A-Za-z0-9-]+)?$").expect("static pattern"))
}

fn entry_point_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("static pattern"))
}

/// Open the bundle and parse `plugin.manifest.json` from its root
#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn extract_manifest(bytes: &[u8]) -> Result<PluginManifest> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PlugonError::PluginValidation(format!("Bundle is not a valid ZIP: {}", e)))?;

    let mut file = archive.by_name(MANIFEST_FILE).map_err(|_| {
        PlugonError::PluginValidation(format!("Bundle is missing {}", MANIFEST_FILE))
    })?;

    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|e| PlugonError::PluginValidation(format!("Failed to read manifest: {}", e)))?;

    let manifest: PluginManifest = serde_json::from_str(&raw)
        .map_err(|e| PlugonError::PluginValidation(format!("Manifest is not valid JSON: {}", e)))?;

    debug!("🔧 extracted manifest {}@{}", manifest.name, manifest.version);
    Ok(manifest)
}

/// Validate manifest fields against the schema rules
#[instrument(level = "debug", skip(manifest), fields(name = %manifest.name))]
pub fn validate_manifest(manifest: &PluginManifest) -> ValidationVerdict {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !name_pattern().is_match(&manifest.name) {
        errors.push(format!(
            "name '{}' must match ^[a-z0-9_-]{{2,50}}$",
            manifest.name
        ));
    }
    if !version_pattern().is_match(&manifest.version) {
        errors.push(format!(
            "version '{}' must be a semantic version triple with optional pre-release",
            manifest.version
        ));
    }
    if !entry_point_pattern().is_match(&manifest.entry_point) {
        errors.push(format!(
            "entryPoint '{}' must be a PascalCase symbol",
            manifest.entry_point
        ));
    }
    if manifest.description.is_empty() {
        errors.push("description is required".to_string());
    } else if manifest.description.len() > MAX_DESCRIPTION_LEN {
        errors.push(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_LEN
        ));
    }
    if manifest.author.is_empty() {
        errors.push("author is required".to_string());
    } else if manifest.author.len() > MAX_AUTHOR_LEN {
        errors.push(format!("author exceeds {} characters", MAX_AUTHOR_LEN));
    }
    if manifest.license.is_empty() {
        errors.push("license is required".to_string());
    } else if manifest.license.len() > MAX_LICENSE_LEN {
        errors.push(format!("license exceeds {} characters", MAX_LICENSE_LEN));
    }
    if !version_pattern().is_match(&manifest.compatibility_version) {
        errors.push(format!(
            "compatibilityVersion '{}' must be a semantic version",
            manifest.compatibility_version
        ));
    }

    for dep in &manifest.dependencies {
        if !name_pattern().is_match(dep) {
            errors.push(format!("dependency '{}' is not a valid plugin name", dep));
        }
    }
    if manifest.dependencies.contains(&manifest.name) {
        errors.push("plugin cannot depend on itself".to_string());
    }

    for route in &manifest.routes {
        if !route.starts_with('/') {
            warnings.push(format!("route '{}' does not start with '/'", route));
        }
    }

    if manifest.critical == Some(true)
        && manifest
            .security
            .as_ref()
            .map(|s| s.signature.is_none())
            .unwrap_or(true)
    {
        warnings.push("critical plugin is unsigned".to_string());
    }

    if manifest.exports().is_empty() {
        warnings.push("manifest declares no module exports".to_string());
    }

    ValidationVerdict {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_log::test;
    use zip::write::SimpleFileOptions;

    pub(crate) fn bundle_with(files: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, content) in files {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn good_manifest_json() -> String {
        serde_json::json!({
            "name": "greeter",
            "version": "1.0.0",
            "description": "Greets people",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Greeter",
            "compatibilityVersion": "1.0.0",
            "module": { "exports": ["Greeter"] }
        })
        .to_string()
    }

    #[test]
    fn test_extract_manifest_ok() {
        let bytes = bundle_with(&[
            (MANIFEST_FILE, &good_manifest_json()),
            ("index.js", "export const Greeter = {}"),
        ]);
        let manifest = extract_manifest(&bytes).unwrap();
        assert_eq!(manifest.name, "greeter");
        assert_eq!(manifest.entry_point, "Greeter");
    }

    #[test]
    fn test_extract_manifest_rejects_non_zip() {
        let err = extract_manifest(b"definitely not a zip").unwrap_err();
        assert!(err.to_string().contains("not a valid ZIP"));
    }

    #[test]
    fn test_extract_manifest_rejects_missing_manifest() {
        let bytes = bundle_with(&[("index.js", "export const X = {}")]);
        let err = extract_manifest(&bytes).unwrap_err();
        assert!(err.to_string().contains(MANIFEST_FILE));
    }

    #[test]
    fn test_validate_good_manifest() {
        let manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        let verdict = validate_manifest(&manifest);
        assert!(verdict.is_valid, "errors: {:?}", verdict.errors);
    }

    #[test]
    fn test_validate_rejects_bad_name() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.name = "Bad Name!".to_string();
        let verdict = validate_manifest(&manifest);
        assert!(!verdict.is_valid);
        assert!(verdict.errors[0].contains("name"));
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.version = "1.0".to_string();
        assert!(!validate_manifest(&manifest).is_valid);
    }

    #[test]
    fn test_validate_rejects_camel_case_entry_point() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.entry_point = "greeter".to_string();
        assert!(!validate_manifest(&manifest).is_valid);
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.dependencies = vec!["greeter".to_string()];
        let verdict = validate_manifest(&manifest);
        assert!(!verdict.is_valid);
        assert!(verdict.errors.iter().any(|e| e.contains("itself")));
    }

    #[test]
    fn test_pre_release_version_accepted() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.version = "2.0.0-beta-1".to_string();
        assert!(validate_manifest(&manifest).is_valid);
    }

    #[test]
    fn test_route_warning_is_non_fatal() {
        let mut manifest: PluginManifest = serde_json::from_str(&good_manifest_json()).unwrap();
        manifest.routes = vec!["no-slash".to_string()];
        let verdict = validate_manifest(&manifest);
        assert!(verdict.is_valid);
        assert!(!verdict.warnings.is_empty());
    }
}
