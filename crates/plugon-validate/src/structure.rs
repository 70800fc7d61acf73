//! Archive layout validation
//!
//! Opens the bundle as a ZIP archive, requires the manifest at the root,
//! enumerates the file listing and forwards it to a pluggable structure
//! checker.

use std::io::Cursor;
use tracing::{debug, instrument};
use zip::ZipArchive;

use plugon_core::types::ValidationVerdict;

use crate::manifest::MANIFEST_FILE;

/// Pluggable check over the archive's file listing
pub trait StructureCheck: Send + Sync {
    /// Inspect the file names of the bundle
    fn check(&self, files: &[String]) -> ValidationVerdict;
}

/// Default layout rules: no traversal, no absolute paths, and at least one
/// code file next to the manifest
#[derive(Debug, Default)]
pub struct DefaultStructureCheck;

impl StructureCheck for DefaultStructureCheck {
    fn check(&self, files: &[String]) -> ValidationVerdict {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for file in files {
            if file.starts_with('/') || file.starts_with('\\') {
                errors.push(format!("absolute path in archive: {}", file));
            }
            if file.split(['/', '\\']).any(|part| part == "..") {
                errors.push(format!("path traversal in archive: {}", file));
            }
        }

        let has_code = files
            .iter()
            .any(|f| f.ends_with(".js") || f.ends_with(".ts"));
        if !has_code {
            warnings.push("bundle contains no .js or .ts files".to_string());
        }

        ValidationVerdict {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validate the bundle's archive layout
#[instrument(level = "debug", skip(bytes, checker), fields(len = bytes.len()))]
pub fn validate_structure(bytes: &[u8], checker: &dyn StructureCheck) -> ValidationVerdict {
    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(e) => return ValidationVerdict::invalid(format!("Bundle is not a valid ZIP: {}", e)),
    };

    if archive.len() == 0 {
        return ValidationVerdict::invalid("Bundle archive is empty");
    }

    let files: Vec<String> = archive.file_names().map(|s| s.to_string()).collect();
    if !files.iter().any(|f| f == MANIFEST_FILE) {
        return ValidationVerdict::invalid(format!("Bundle is missing {}", MANIFEST_FILE));
    }

    // Corrupt local entries surface here rather than at extraction time
    for index in 0..archive.len() {
        if let Err(e) = archive.by_index(index) {
            return ValidationVerdict::invalid(format!("Corrupt archive entry: {}", e));
        }
    }

    debug!("🔧 structure check over {} files", files.len());
    checker.check(&files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_log::test;
    use zip::write::SimpleFileOptions;

    fn bundle_with(files: &[(&str, &str)]) -> Vec<u8> {
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

    #[test]
    fn test_valid_layout() {
        let bytes = bundle_with(&[
            (MANIFEST_FILE, "{}"),
            ("index.js", "export const X = {}"),
            ("lib/helper.js", "exports.help = () => {}"),
        ]);
        let verdict = validate_structure(&bytes, &DefaultStructureCheck);
        assert!(verdict.is_valid, "errors: {:?}", verdict.errors);
    }

    #[test]
    fn test_missing_manifest_rejected() {
        let bytes = bundle_with(&[("index.js", "export const X = {}")]);
        let verdict = validate_structure(&bytes, &DefaultStructureCheck);
        assert!(!verdict.is_valid);
        assert!(verdict.errors[0].contains(MANIFEST_FILE));
    }

    #[test]
    fn test_invalid_zip_rejected() {
        let verdict = validate_structure(b"garbage", &DefaultStructureCheck);
        assert!(!verdict.is_valid);
    }

    #[test]
    fn test_traversal_rejected() {
        let bytes = bundle_with(&[(MANIFEST_FILE, "{}"), ("../escape.js", "nope")]);
        let verdict = validate_structure(&bytes, &DefaultStructureCheck);
        assert!(!verdict.is_valid);
        assert!(verdict.errors.iter().any(|e| e.contains("traversal")));
    }

    #[test]
    fn test_no_code_files_warns() {
        let bytes = bundle_with(&[(MANIFEST_FILE, "{}"), ("data.json", "{}")]);
        let verdict = validate_structure(&bytes, &DefaultStructureCheck);
        assert!(verdict.is_valid);
        assert!(verdict.warnings.iter().any(|w| w.contains("no .js")));
    }

    #[test]
    fn test_custom_checker_is_forwarded_the_listing() {
        struct CountCheck;
        impl StructureCheck for CountCheck {
            fn check(&self, files: &[String]) -> ValidationVerdict {
                if files.len() > 2 {
                    ValidationVerdict::invalid("too many files")
                } else {
                    ValidationVerdict::valid()
                }
            }
        }

        let small = bundle_with(&[(MANIFEST_FILE, "{}"), ("a.js", "1")]);
        let big = bundle_with(&[(MANIFEST_FILE, "{}"), ("a.js", "1"), ("b.js", "2")]);
        assert!(validate_structure(&small, &CountCheck).is_valid);
        assert!(!validate_structure(&big, &CountCheck).is_valid);
    }
}
