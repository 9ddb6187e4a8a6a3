//! Source directive mini-language.
//!
//! Directives live in a unit's preamble: the lines from the top of the
//! file to the first type declaration following the namespace marker.
//! Each line is matched once, first pattern wins, and scanning stops as
//! soon as the entry point is reached.

use std::sync::LazyLock;

use regex::Regex;

use crate::unit::normalize_name;

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^//\s*requires?\s*:\s*(\S+?)(?:\.cs)?\s*$").expect("require pattern")
});
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^//\s*reference\s*:\s*(\S+)\s*$").expect("reference pattern")
});
static USING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^using\s+(Crucible\.(?:Core|Ext|Game)\.[\w.]+)\s*;").expect("using pattern")
});
static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^namespace\s+([\w.]+)").expect("namespace pattern"));
static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:public|internal|sealed|partial|abstract)\s+)*class\s+(\w+)")
        .expect("class pattern")
});

/// Everything extracted from one unit's preamble.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Preamble {
    /// Required unit names, normalized and deduplicated in order.
    pub requires: Vec<String>,
    /// External library references (explicit directives plus
    /// auto-references from import lines), deduplicated in order.
    pub references: Vec<String>,
    /// Declared namespace, when a namespace marker was reached.
    pub namespace: Option<String>,
    /// Name of the first type declared after the namespace marker.
    pub class_name: Option<String>,
}

/// Scans a unit's preamble.
pub fn scan(lines: &[String]) -> Preamble {
    let mut preamble = Preamble::default();
    let mut in_namespace = false;

    for raw in lines {
        let line = raw.trim();
        if !in_namespace {
            if let Some(caps) = REQUIRE_RE.captures(line) {
                push_unique(&mut preamble.requires, normalize_name(&caps[1]));
            } else if let Some(caps) = REFERENCE_RE.captures(line) {
                push_unique(&mut preamble.references, caps[1].to_string());
            } else if let Some(caps) = USING_RE.captures(line) {
                push_unique(&mut preamble.references, caps[1].to_string());
            } else if let Some(caps) = NAMESPACE_RE.captures(line) {
                preamble.namespace = Some(caps[1].to_string());
                in_namespace = true;
            }
            continue;
        }

        // Entry-point detection: the first line after the namespace marker
        // that is not blank, a brace, an attribute, a comment, or an
        // import ends the preamble.
        if line.is_empty()
            || line.starts_with('{')
            || line.starts_with('[')
            || line.starts_with("//")
            || line.starts_with("using ")
        {
            continue;
        }
        if let Some(caps) = CLASS_RE.captures(line) {
            preamble.class_name = Some(caps[1].to_string());
        }
        break;
    }
    preamble
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}
