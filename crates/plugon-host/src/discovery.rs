//! Plugin discovery
//!
//! Scans the plugins directory for subdirectories carrying a
//! `plugin.manifest.json`. Discovery never aborts the scan on a bad
//! plugin: each failure is classified and reported next to the plugins
//! that did discover cleanly.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use plugon_common::{PlugonError, Result};
use plugon_core::types::PluginManifest;
use plugon_validate::validate_manifest;

/// File every plugin directory must contain
pub const MANIFEST_FILE: &str = "plugin.manifest.json";

/// Classification of a discovery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryErrorKind {
    ManifestNotFound,
    ManifestParseError,
    ManifestValidationError,
    FileAccessError,
    Unknown,
}

/// A discovery failure for one plugin directory
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryError {
    /// Directory that failed
    pub plugin_dir: String,

    /// Failure classification
    pub kind: DiscoveryErrorKind,

    /// Human-readable detail
    pub message: String,
}

/// A successfully discovered plugin
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Plugin name from the manifest
    pub name: String,

    /// Directory the plugin lives in
    pub path: PathBuf,

    /// Parsed manifest
    pub manifest: PluginManifest,
}

/// Scan a directory for plugins
#[instrument(level = "info", skip(dir), fields(dir = %dir.display()))]
pub async fn discover_plugins(
    dir: &Path,
) -> Result<(Vec<DiscoveredPlugin>, Vec<DiscoveryError>)> {
    let mut discovered = Vec::new();
    let mut errors = Vec::new();

    let mut entries = fs::read_dir(dir).await.map_err(|e| {
        PlugonError::Config(format!("plugins directory {} unreadable: {}", dir.display(), e))
    })?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PlugonError::Storage(format!("failed to scan plugins directory: {}", e)))?
    {
        let path = entry.path();
        let dir_name = entry.file_name().to_string_lossy().to_string();

        match entry.file_type().await {
            Ok(file_type) if file_type.is_dir() => {}
            Ok(_) => continue,
            Err(e) => {
                errors.push(DiscoveryError {
                    plugin_dir: dir_name,
                    kind: DiscoveryErrorKind::FileAccessError,
                    message: e.to_string(),
                });
                continue;
            }
        }

        match discover_one(&path).await {
            Ok(plugin) => {
                debug!("🔧 discovered {} at {}", plugin.name, path.display());
                discovered.push(plugin);
            }
            Err(error) => {
                warn!("⚠️ {}: {:?} ({})", dir_name, error.kind, error.message);
                errors.push(error);
            }
        }
    }

    info!(
        "✅ discovery: {} plugins, {} errors",
        discovered.len(),
        errors.len()
    );
    Ok((discovered, errors))
}

async fn discover_one(path: &Path) -> std::result::Result<DiscoveredPlugin, DiscoveryError> {
    let dir_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let manifest_path = path.join(MANIFEST_FILE);

    let raw = match fs::read_to_string(&manifest_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DiscoveryError {
                plugin_dir: dir_name,
                kind: DiscoveryErrorKind::ManifestNotFound,
                message: format!("{} is missing", MANIFEST_FILE),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DiscoveryError {
                plugin_dir: dir_name,
                kind: DiscoveryErrorKind::FileAccessError,
                message: e.to_string(),
            })
        }
        Err(e) => {
            return Err(DiscoveryError {
                plugin_dir: dir_name,
                kind: DiscoveryErrorKind::Unknown,
                message: e.to_string(),
            })
        }
    };

    let manifest: PluginManifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            return Err(DiscoveryError {
                plugin_dir: dir_name,
                kind: DiscoveryErrorKind::ManifestParseError,
                message: e.to_string(),
            })
        }
    };

    let verdict = validate_manifest(&manifest);
    if !verdict.is_valid {
        return Err(DiscoveryError {
            plugin_dir: dir_name,
            kind: DiscoveryErrorKind::ManifestValidationError,
            message: verdict.errors.join("; "),
        });
    }

    Ok(DiscoveredPlugin {
        name: manifest.name.clone(),
        path: path.to_path_buf(),
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_plugin(root: &Path, dir: &str, manifest: &str) {
        let plugin_dir = root.join(dir);
        fs::create_dir_all(&plugin_dir).await.unwrap();
        fs::write(plugin_dir.join(MANIFEST_FILE), manifest)
            .await
            .unwrap();
    }

    fn good_manifest(name: &str) -> String {
        serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "description": "d",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Entry",
            "compatibilityVersion": "1.0.0",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_discovers_valid_plugins() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "alpha", &good_manifest("alpha")).await;
        write_plugin(dir.path(), "beta", &good_manifest("beta")).await;

        let (found, errors) = discover_plugins(dir.path()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(errors.is_empty());
        let mut names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_missing_manifest_classified() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty")).await.unwrap();

        let (found, errors) = discover_plugins(dir.path()).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, DiscoveryErrorKind::ManifestNotFound);
    }

    #[tokio::test]
    async fn test_parse_error_classified() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "broken", "{ not json").await;

        let (_, errors) = discover_plugins(dir.path()).await.unwrap();
        assert_eq!(errors[0].kind, DiscoveryErrorKind::ManifestParseError);
    }

    #[tokio::test]
    async fn test_validation_error_classified() {
        let dir = TempDir::new().unwrap();
        let bad = serde_json::json!({
            "name": "BAD NAME",
            "version": "1.0.0",
            "description": "d",
            "author": "a",
            "license": "MIT",
            "entryPoint": "Entry",
            "compatibilityVersion": "1.0.0",
        })
        .to_string();
        write_plugin(dir.path(), "bad", &bad).await;

        let (_, errors) = discover_plugins(dir.path()).await.unwrap();
        assert_eq!(errors[0].kind, DiscoveryErrorKind::ManifestValidationError);
    }

    #[tokio::test]
    async fn test_one_bad_plugin_does_not_hide_others() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "good", &good_manifest("good")).await;
        write_plugin(dir.path(), "broken", "nope").await;

        let (found, errors) = discover_plugins(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_loose_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("stray.txt"), "hi").await.unwrap();
        write_plugin(dir.path(), "good", &good_manifest("good")).await;

        let (found, errors) = discover_plugins(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_directory_is_config_error() {
        let err = discover_plugins(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "CONFIGURATION_ERROR");
    }
}
