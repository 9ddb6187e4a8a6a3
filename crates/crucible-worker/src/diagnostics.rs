//! Compiler diagnostic recovery.
//!
//! The worker returns one multi-line diagnostic blob per job; each line
//! names the source file it came from. Lines are attributed back to the
//! owning unit by base-name match; a line matching no unit in the job is
//! logged and kept aside rather than aborting the job.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use tracing::warn;

use crucible_resolve::normalize_name;

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w.\- ]+)\.cs\(\d+,\d+\)").expect("diagnostic file pattern")
});

/// Per-unit diagnostics recovered from one blob.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AttributedDiagnostics {
    /// Diagnostic text per unit, lines joined in blob order.
    pub per_unit: IndexMap<String, String>,
    /// Lines naming no unit in the job.
    pub unmatched: Vec<String>,
}

/// Splits a diagnostic blob into lines and maps each line to the owning
/// unit by source file base name.
pub fn attribute(blob: &str, units: &[String]) -> AttributedDiagnostics {
    let mut result = AttributedDiagnostics::default();
    for line in blob.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let owner = FILE_RE.captures(line).and_then(|caps| {
            let base = normalize_name(caps[1].trim());
            units.iter().find(|unit| **unit == base)
        });
        match owner {
            Some(unit) => {
                let entry = result.per_unit.entry(unit.clone()).or_default();
                if !entry.is_empty() {
                    entry.push('\n');
                }
                entry.push_str(line);
            }
            None => {
                warn!(line, "could not attribute compiler diagnostic to a unit");
                result.unmatched.push(line.to_string());
            }
        }
    }
    result
}

/// Replaces the diagnostic of any unit with an unmet dependency by a
/// missing-dependency message, which is more actionable than the raw
/// compiler text the unmet reference produced.
pub fn overwrite_missing_dependencies<F>(
    diagnostics: &mut IndexMap<String, String>,
    requires_of: F,
    available: impl Fn(&str) -> bool,
) where
    F: Fn(&str) -> Vec<String>,
{
    for (unit, message) in diagnostics.iter_mut() {
        if let Some(missing) = requires_of(unit).into_iter().find(|req| !available(req)) {
            *message = format!("{unit} requires missing dependency {missing}");
        }
    }
}
