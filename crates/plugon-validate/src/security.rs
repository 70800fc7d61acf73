//! Static security scan
//!
//! Iterates the bundle's `.js`/`.ts` files and scans for import/require of
//! any module on the fixed unsafe denylist. The scan is intentionally
//! approximate (regex, not a parser) and strictly bounded: content is
//! truncated to a maximum size, match iterations are capped and the whole
//! scan carries a wall-clock budget. Exceeding any bound fails the scan as
//! "too complex" rather than letting it run away.

use regex::Regex;
use std::io::{Cursor, Read};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use zip::ZipArchive;

use plugon_core::types::ValidationVerdict;

/// Node built-in modules a plugin must not import directly
pub const UNSAFE_MODULES: &[&str] = &[
    "fs",
    "child_process",
    "process",
    "os",
    "path",
    "crypto",
    "net",
    "http",
    "https",
    "url",
    "stream",
    "events",
    "util",
    "cluster",
    "worker_threads",
];

/// Resource bounds for the scan
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    /// File content is truncated to this many bytes before scanning
    pub max_content_size: usize,

    /// Total import-site matches examined across the bundle
    pub max_iterations: usize,

    /// Wall-clock budget for the whole scan
    pub timeout: Duration,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_content_size: 1024 * 1024,
            max_iterations: 10_000,
            timeout: Duration::from_millis(5_000),
        }
    }
}

fn import_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // require('x'), import ... from 'x', import('x'), bare import 'x'
        Regex::new(
            r#"(?:\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)|\bimport\b[^;'"]*?\bfrom\s*['"]([^'"]+)['"]|\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)|\bimport\s+['"]([^'"]+)['"])"#,
        )
        .expect("static pattern")
    })
}

/// Whether a module specifier names a denied module
///
/// Handles the `node:` prefix and subpath imports (`fs/promises`).
fn is_unsafe_specifier(specifier: &str) -> bool {
    let stripped = specifier.strip_prefix("node:").unwrap_or(specifier);
    let head = stripped.split('/').next().unwrap_or(stripped);
    UNSAFE_MODULES.contains(&head)
}

/// Scan every text file with a `.js` or `.ts` suffix for unsafe imports
#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
pub fn scan_bundle(bytes: &[u8], limits: &ScanLimits) -> ValidationVerdict {
    let start = Instant::now();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut iterations: usize = 0;

    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(e) => return ValidationVerdict::invalid(format!("Bundle is not a valid ZIP: {}", e)),
    };

    for index in 0..archive.len() {
        if start.elapsed() > limits.timeout {
            warn!("⚠️ security scan exceeded its time budget");
            return ValidationVerdict::invalid(
                "Security scan aborted: bundle too complex (time budget exceeded)",
            );
        }

        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(e) => return ValidationVerdict::invalid(format!("Corrupt archive entry: {}", e)),
        };
        let name = file.name().to_string();
        if !(name.ends_with(".js") || name.ends_with(".ts")) {
            continue;
        }

        let mut content = String::new();
        let truncated = {
            let mut limited = (&mut file).take(limits.max_content_size as u64);
            match limited.read_to_string(&mut content) {
                Ok(_) => file.size() as usize > limits.max_content_size,
                Err(_) => {
                    warnings.push(format!("{} is not valid UTF-8, skipped", name));
                    continue;
                }
            }
        };
        if truncated {
            warnings.push(format!(
                "{} truncated to {} bytes for scanning",
                name, limits.max_content_size
            ));
        }

        for captures in import_pattern().captures_iter(&content) {
            iterations += 1;
            if iterations > limits.max_iterations {
                warn!("⚠️ security scan exceeded its iteration budget");
                return ValidationVerdict::invalid(
                    "Security scan aborted: bundle too complex (iteration budget exceeded)",
                );
            }
            if start.elapsed() > limits.timeout {
                warn!("⚠️ security scan exceeded its time budget");
                return ValidationVerdict::invalid(
                    "Security scan aborted: bundle too complex (time budget exceeded)",
                );
            }

            let specifier = captures
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str())
                .unwrap_or_default();
            if is_unsafe_specifier(specifier) {
                errors.push(format!("{} imports unsafe module '{}'", name, specifier));
            }
        }
    }

    debug!(
        "🔧 security scan: {} import sites in {:?}",
        iterations,
        start.elapsed()
    );

    ValidationVerdict {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}
