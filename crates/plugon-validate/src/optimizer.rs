//! Bundle optimizer
//!
//! Pipeline over the ZIP archive: entry-point discovery, tree-shaking by
//! transitive relative-import reachability, comment/whitespace
//! minification, stripping of test and documentation files, and
//! recompression. The ingestion orchestrator only accepts the optimized
//! buffer when the size savings exceed 5%.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;
use tracing::{debug, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use plugon_common::{PlugonError, Result};
use plugon_core::config::{CompressionAlgorithm, OptimizationSection};

use crate::manifest::MANIFEST_FILE;

/// Savings threshold the orchestrator applies before substituting the
/// optimized buffer
pub const MIN_SAVINGS_RATIO: f64 = 0.05;

/// Files kept regardless of reachability
const ESSENTIAL_FILES: &[&str] = &[MANIFEST_FILE, "package.json"];

/// Entry-point candidates probed in order
const ENTRY_CANDIDATES: &[&str] = &["index.js", "main.js", "app.js"];

/// Result of an optimization run
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// The rebuilt archive
    pub buffer: Vec<u8>,

    /// Size of the input archive in bytes
    pub original_size: u64,

    /// Size of the rebuilt archive in bytes
    pub optimized_size: u64,

    /// 1 - optimized/original
    pub savings_ratio: f64,

    /// Whether the savings exceed [`MIN_SAVINGS_RATIO`]
    pub accepted: bool,

    /// Files removed by tree-shaking or stripping
    pub removed_files: Vec<String>,

    /// Non-fatal findings
    pub warnings: Vec<String>,
}

/// Tree-shaking, minification and recompression over plugin bundles
#[derive(Debug, Clone)]
pub struct BundleOptimizer {
    config: OptimizationSection,
}

fn relative_import_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?:\brequire\s*\(\s*['"](\.[^'"]+)['"]\s*\)|\bfrom\s*['"](\.[^'"]+)['"]|\bimport\s*\(\s*['"](\.[^'"]+)['"]\s*\))"#,
        )
        .expect("static pattern")
    })
}

impl BundleOptimizer {
    /// Create an optimizer with the given configuration
    pub fn new(config: OptimizationSection) -> Self {
        Self { config }
    }

    /// Run the full optimization pipeline over a bundle
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn optimize(&self, bytes: &[u8]) -> Result<OptimizationOutcome> {
        let original_size = bytes.len() as u64;
        let mut warnings = Vec::new();

        let mut files = read_archive(bytes)?;

        // 1. entry-point discovery
        let entry_points = discover_entry_points(&files);
        if entry_points.is_empty() {
            warnings.push("no entry points found, tree-shaking skipped".to_string());
        }

        // 2. tree-shake
        let mut removed_files = Vec::new();
        if !entry_points.is_empty() {
            let reachable = reachable_files(&files, &entry_points);
            let doomed: Vec<String> = files
                .keys()
                .filter(|name| is_code_file(name) && !reachable.contains(*name))
                .cloned()
                .collect();
            for name in doomed {
                files.remove(&name);
                removed_files.push(name);
            }
        }

        // 3. minify
        let aggressive = self.config.level >= 8;
        let code_names: Vec<String> = files
            .keys()
            .filter(|name| is_code_file(name))
            .cloned()
            .collect();
        for name in code_names {
            if let Some(content) = files.get(&name) {
                match std::str::from_utf8(content) {
                    Ok(source) => {
                        let minified = minify_source(source, aggressive);
                        files.insert(name, minified.into_bytes());
                    }
                    Err(_) => {
                        warnings.push(format!("{} is not valid UTF-8, left unminified", name));
                    }
                }
            }
        }

        // 4. strip test/spec/map/doc files
        let strippable: Vec<String> = files
            .keys()
            .filter(|name| is_strippable(name))
            .cloned()
            .collect();
        for name in strippable {
            files.remove(&name);
            removed_files.push(name);
        }

        // 5. recompress
        let buffer = self.write_archive(&files, &mut warnings)?;
        let optimized_size = buffer.len() as u64;
        let savings_ratio = if original_size == 0 {
            0.0
        } else {
            1.0 - optimized_size as f64 / original_size as f64
        };
        let accepted = savings_ratio > MIN_SAVINGS_RATIO;

        debug!(
            "🔧 optimizer: {} -> {} bytes ({:.1}% savings), {} files removed",
            original_size,
            optimized_size,
            savings_ratio * 100.0,
            removed_files.len()
        );

        Ok(OptimizationOutcome {
            buffer,
            original_size,
            optimized_size,
            savings_ratio,
            accepted,
            removed_files,
            warnings,
        })
    }

    fn write_archive(
        &self,
        files: &BTreeMap<String, Vec<u8>>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<u8>> {
        let method = match self.config.compression {
            CompressionAlgorithm::Gzip | CompressionAlgorithm::Deflate => {
                CompressionMethod::Deflated
            }
            CompressionAlgorithm::Brotli => {
                warn!("⚠️ brotli recompression unavailable, using deflate");
                warnings.push("brotli recompression unavailable, used deflate".to_string());
                CompressionMethod::Deflated
            }
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .compression_level(Some(self.config.level as i64));

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        for (name, content) in files {
            writer
                .start_file(name.clone(), options)
                .map_err(|e| PlugonError::Internal(format!("archive rebuild failed: {}", e)))?;
            writer
                .write_all(content)
                .map_err(|e| PlugonError::Internal(format!("archive rebuild failed: {}", e)))?;
        }
        writer
            .finish()
            .map_err(|e| PlugonError::Internal(format!("archive rebuild failed: {}", e)))?;
        Ok(cursor.into_inner())
    }
}

fn read_archive(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PlugonError::PluginValidation(format!("Bundle is not a valid ZIP: {}", e)))?;
    let mut files = BTreeMap::new();
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| PlugonError::PluginValidation(format!("Corrupt archive entry: {}", e)))?;
        if file.is_dir() {
            continue;
        }
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)
            .map_err(|e| PlugonError::PluginValidation(format!("Corrupt archive entry: {}", e)))?;
        files.insert(file.name().to_string(), content);
    }
    Ok(files)
}

fn is_code_file(name: &str) -> bool {
    name.ends_with(".js") || name.ends_with(".ts")
}

fn is_strippable(name: &str) -> bool {
    if name.ends_with(".map") {
        return true;
    }
    let base = name.rsplit('/').next().unwrap_or(name);
    if is_code_file(name) {
        // only test code is stripped; a real module named license-gate.js
        // or readme-renderer.js stays
        return base.contains(".test.")
            || base.contains(".spec.")
            || name.split('/').any(|part| {
                part == "__tests__" || part == "test" || part == "tests"
            });
    }
    let lower = base.to_ascii_lowercase();
    lower == "readme"
        || lower == "license"
        || lower == "changelog"
        || lower.starts_with("readme.")
        || lower.starts_with("license.")
        || lower.starts_with("changelog.")
}

/// Discover the entry points: well-known names, then `package.json` `main`,
/// else every `.js` file
fn discover_entry_points(files: &BTreeMap<String, Vec<u8>>) -> Vec<String> {
    let mut entries: Vec<String> = ENTRY_CANDIDATES
        .iter()
        .filter(|name| files.contains_key(**name))
        .map(|name| name.to_string())
        .collect();

    if entries.is_empty() {
        if let Some(content) = files.get("package.json") {
            if let Ok(package) = serde_json::from_slice::<serde_json::Value>(content) {
                if let Some(main) = package.get("main").and_then(|v| v.as_str()) {
                    let main = main.trim_start_matches("./").to_string();
                    if files.contains_key(&main) {
                        entries.push(main);
                    }
                }
            }
        }
    }

    if entries.is_empty() {
        entries = files.keys().filter(|n| n.ends_with(".js")).cloned().collect();
    }
    entries
}

/// Transitive closure of relative imports starting from the entry points
fn reachable_files(files: &BTreeMap<String, Vec<u8>>, entry_points: &[String]) -> BTreeSet<String> {
    let mut reachable: BTreeSet<String> = ESSENTIAL_FILES
        .iter()
        .map(|s| s.to_string())
        .filter(|s| files.contains_key(s))
        .collect();
    let mut queue: VecDeque<String> = entry_points.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        let Some(content) = files.get(&name) else {
            continue;
        };
        let Ok(source) = std::str::from_utf8(content) else {
            continue;
        };
        for captures in relative_import_pattern().captures_iter(source) {
            let specifier = captures
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str())
                .unwrap_or_default();
            for resolved in resolve_relative(&name, specifier) {
                if files.contains_key(&resolved) && !reachable.contains(&resolved) {
                    queue.push_back(resolved);
                }
            }
        }
    }
    reachable
}

/// Resolve a relative specifier against the importer's directory, probing
/// the usual suffixes
fn resolve_relative(importer: &str, specifier: &str) -> Vec<String> {
    let dir: Vec<&str> = match importer.rfind('/') {
        Some(pos) => importer[..pos].split('/').collect(),
        None => Vec::new(),
    };
    let mut parts: Vec<String> = dir.iter().map(|s| s.to_string()).collect();

    for segment in specifier.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    let base = parts.join("/");

    vec![
        base.clone(),
        format!("{}.js", base),
        format!("{}.ts", base),
        format!("{}/index.js", base),
    ]
}

/// Strip comments and normalize whitespace
///
/// Preserves string/template literal contents, `/*!` license blocks,
/// jsdoc blocks containing `@` tags and line comments carrying URLs.
fn minify_source(source: &str, aggressive: bool) -> String {
    let stripped = strip_comments(source);

    let mut out = String::with_capacity(stripped.len());
    let mut blank_run = 0usize;
    for line in stripped.lines() {
        let trimmed_end = line.trim_end();
        if trimmed_end.is_empty() {
            blank_run += 1;
            // collapse blank runs; aggressive mode drops them entirely
            if !aggressive && blank_run == 1 {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        if aggressive {
            out.push_str(trimmed_end.trim_start());
        } else {
            out.push_str(trimmed_end);
        }
        out.push('\n');
    }
    out
}

fn strip_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0usize;
    // start of the region copied verbatim; every cut lands on an ASCII
    // delimiter, so slicing stays on UTF-8 boundaries
    let mut segment_start = 0usize;
    let mut string_delim: Option<u8> = None;

    while i < bytes.len() {
        let c = bytes[i];

        if let Some(delim) = string_delim {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == delim {
                string_delim = None;
            }
            i += 1;
            continue;
        }

        match c {
            b'"' | b'\'' | b'`' => {
                string_delim = Some(c);
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                out.push_str(&source[segment_start..i]);
                let end = source[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len());
                let comment = &source[i..end];
                if comment.contains("://") {
                    out.push_str(comment);
                }
                i = end;
                segment_start = end;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                out.push_str(&source[segment_start..i]);
                let end = source[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                let comment = &source[i..end];
                if comment.starts_with("/*!") || comment.contains('@') {
                    out.push_str(comment);
                }
                i = end;
                segment_start = end;
            }
            _ => {
                i += 1;
            }
        }
    }
    out.push_str(&source[segment_start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn bundle_with(files: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        // store uncompressed so the rebuilt deflate archive shrinks
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, content) in files {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn optimizer() -> BundleOptimizer {
        BundleOptimizer::new(OptimizationSection {
            enabled: true,
            compression: CompressionAlgorithm::Deflate,
            level: 6,
        })
    }

    #[test]
    fn test_entry_point_discovery_prefers_index() {
        let files = read_archive(&bundle_with(&[
            ("index.js", "a"),
            ("main.js", "b"),
            ("other.js", "c"),
        ]))
        .unwrap();
        let entries = discover_entry_points(&files);
        assert!(entries.contains(&"index.js".to_string()));
        assert!(entries.contains(&"main.js".to_string()));
        assert!(!entries.contains(&"other.js".to_string()));
    }

    #[test]
    fn test_entry_point_from_package_json() {
        let files = read_archive(&bundle_with(&[
            ("package.json", r#"{"main": "./lib/start.js"}"#),
            ("lib/start.js", "a"),
        ]))
        .unwrap();
        let entries = discover_entry_points(&files);
        assert_eq!(entries, vec!["lib/start.js".to_string()]);
    }

    #[test]
    fn test_tree_shake_removes_unreachable_code() {
        let padding = "// filler\n".repeat(200);
        let bytes = bundle_with(&[
            ("plugin.manifest.json", "{}"),
            ("index.js", "const h = require('./lib/helper');\n"),
            ("lib/helper.js", "exports.h = 1;\n"),
            ("lib/dead.js", &padding),
        ]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        assert!(outcome
            .removed_files
            .contains(&"lib/dead.js".to_string()));
        assert!(!outcome.removed_files.contains(&"lib/helper.js".to_string()));
        assert!(!outcome.removed_files.contains(&"index.js".to_string()));
    }

    #[test]
    fn test_essential_files_survive() {
        let bytes = bundle_with(&[
            ("plugin.manifest.json", "{}"),
            ("package.json", "{}"),
            ("index.js", "export const X = 1;"),
        ]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        let rebuilt = read_archive(&outcome.buffer).unwrap();
        assert!(rebuilt.contains_key("plugin.manifest.json"));
        assert!(rebuilt.contains_key("package.json"));
    }

    #[test]
    fn test_strip_test_and_doc_files() {
        let bytes = bundle_with(&[
            ("plugin.manifest.json", "{}"),
            ("index.js", "1"),
            ("index.test.js", "test"),
            ("index.js.map", "{}"),
            ("README.md", "docs"),
            ("LICENSE", "MIT"),
            ("__tests__/x.js", "t"),
        ]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        let rebuilt = read_archive(&outcome.buffer).unwrap();
        assert!(rebuilt.contains_key("index.js"));
        assert!(!rebuilt.contains_key("index.test.js"));
        assert!(!rebuilt.contains_key("index.js.map"));
        assert!(!rebuilt.contains_key("README.md"));
        assert!(!rebuilt.contains_key("LICENSE"));
        assert!(!rebuilt.contains_key("__tests__/x.js"));
    }

    #[test]
    fn test_doc_prefixed_code_modules_are_not_stripped() {
        let bytes = bundle_with(&[
            ("plugin.manifest.json", "{}"),
            (
                "index.js",
                "const gate = require('./license-gate');\nconst md = require('./readme-renderer');\n",
            ),
            ("license-gate.js", "exports.check = () => true;\n"),
            ("readme-renderer.js", "exports.render = () => '';\n"),
            ("LICENSE.txt", "MIT"),
        ]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        let rebuilt = read_archive(&outcome.buffer).unwrap();
        // imported modules survive even with doc-like names
        assert!(rebuilt.contains_key("license-gate.js"));
        assert!(rebuilt.contains_key("readme-renderer.js"));
        // the actual license file still goes
        assert!(!rebuilt.contains_key("LICENSE.txt"));
    }

    #[test]
    fn test_is_strippable_classification() {
        assert!(is_strippable("index.js.map"));
        assert!(is_strippable("index.test.js"));
        assert!(is_strippable("lib/helper.spec.ts"));
        assert!(is_strippable("__tests__/x.js"));
        assert!(is_strippable("README"));
        assert!(is_strippable("readme.md"));
        assert!(is_strippable("LICENSE"));
        assert!(is_strippable("docs/CHANGELOG.md"));
        assert!(!is_strippable("license-gate.js"));
        assert!(!is_strippable("readme-renderer.js"));
        assert!(!is_strippable("changelog-feed.ts"));
        assert!(!is_strippable("index.js"));
    }

    #[test]
    fn test_savings_gate() {
        let padding = format!("// strip me\n{}", "var x = 1; // c\n".repeat(500));
        let bytes = bundle_with(&[("plugin.manifest.json", "{}"), ("index.js", &padding)]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        assert!(outcome.savings_ratio > MIN_SAVINGS_RATIO);
        assert!(outcome.accepted);
        assert!(outcome.optimized_size < outcome.original_size);
    }

    #[test]
    fn test_comment_stripping_preserves_license_and_jsdoc() {
        let source = "/*! legal */\n/** @param x */\n/* gone */\n// gone too\nvar x = 1;\n";
        let out = minify_source(source, false);
        assert!(out.contains("/*! legal */"));
        assert!(out.contains("@param"));
        assert!(!out.contains("gone"));
        assert!(out.contains("var x = 1;"));
    }

    #[test]
    fn test_comment_stripping_preserves_urls() {
        let source = "// see https://example.com/docs\nconst u = 'http://x.test';\n";
        let out = minify_source(source, false);
        assert!(out.contains("https://example.com/docs"));
        assert!(out.contains("'http://x.test'"));
    }

    #[test]
    fn test_string_contents_untouched() {
        let source = "const s = \"// not a comment\";\nconst t = '/* neither */';\n";
        let out = minify_source(source, false);
        assert!(out.contains("// not a comment"));
        assert!(out.contains("/* neither */"));
    }

    #[test]
    fn test_non_ascii_source_survives_minification() {
        let source = "const s = \"café ☕ caffè\";\n// gone\nconst cjk = '插件系统';\nconst e = `emoji 🎉`;\n";
        let out = minify_source(source, false);
        assert!(out.contains("\"café ☕ caffè\""));
        assert!(out.contains("'插件系统'"));
        assert!(out.contains("`emoji 🎉`"));
        assert!(!out.contains("gone"));

        // identifiers outside strings keep their encoding too
        let code = "const naïve = 1; /* drop */ let λ = 2;\n";
        let out = minify_source(code, false);
        assert!(out.contains("const naïve = 1;"));
        assert!(out.contains("let λ = 2;"));
        assert!(!out.contains("drop"));
    }

    #[test]
    fn test_non_ascii_bundle_round_trips_through_optimizer() {
        let padded = format!(
            "const greeting = \"héllo 世界\";\nexport const Greeter = {{}};\n{}",
            "// filler\n".repeat(300)
        );
        let bytes = bundle_with(&[("plugin.manifest.json", "{}"), ("index.js", &padded)]);
        let outcome = optimizer().optimize(&bytes).unwrap();
        let rebuilt = read_archive(&outcome.buffer).unwrap();
        let index = std::str::from_utf8(&rebuilt["index.js"]).unwrap();
        assert!(index.contains("\"héllo 世界\""));
    }

    #[test]
    fn test_aggressive_minify_drops_indentation() {
        let source = "function f() {\n    return 1;\n}\n\n\nvar y = 2;\n";
        let normal = minify_source(source, false);
        let aggressive = minify_source(source, true);
        assert!(normal.contains("    return 1;"));
        assert!(aggressive.contains("return 1;"));
        assert!(!aggressive.contains("    return"));
        assert!(!aggressive.contains("\n\n"));
    }

    #[test]
    fn test_resolve_relative() {
        assert!(resolve_relative("index.js", "./lib/helper")
            .contains(&"lib/helper.js".to_string()));
        assert!(resolve_relative("lib/a.js", "../util").contains(&"util.js".to_string()));
        assert!(resolve_relative("lib/a.js", "./b").contains(&"lib/b/index.js".to_string()));
    }

    #[test]
    fn test_invalid_zip_is_an_error() {
        assert!(optimizer().optimize(b"not a zip").is_err());
    }
}
