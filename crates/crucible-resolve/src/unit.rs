//! Script units: one source file plus its extracted metadata and
//! compilation history.

use std::path::PathBuf;
use std::time::SystemTime;

/// Source extension for script files.
pub const SCRIPT_EXTENSION: &str = "cs";

/// Normalizes a script file name into a unit name by stripping
/// underscores. The registry and all dependency edges are keyed by the
/// normalized name.
pub fn normalize_name(script_name: &str) -> String {
    script_name.replace('_', "")
}

/// One script source file plus its extracted metadata.
///
/// Created on first reference by name, mutated by the resolver on each
/// rescan, and retired only when its backing file is gone and no
/// dependents remain.
#[derive(Debug, Clone)]
pub struct ScriptUnit {
    /// Normalized unit name (underscores stripped).
    pub name: String,
    /// File base name as it appears on disk.
    pub script_name: String,
    /// Cached source text, split into lines.
    pub lines: Vec<String>,
    /// Text encoding label reported by the source provider.
    pub encoding: String,
    /// Source file modification stamp at the last read.
    pub last_modified: Option<SystemTime>,
    /// When the cached lines were last refreshed.
    pub last_cached: Option<SystemTime>,
    /// When the unit last compiled successfully.
    pub last_compiled: Option<SystemTime>,
    /// Required unit names extracted from the preamble.
    pub requires: Vec<String>,
    /// External library references extracted from the preamble.
    pub references: Vec<String>,
    /// Include files attached in place of unavailable libraries.
    pub include_paths: Vec<PathBuf>,
    /// Most recent resolution or compilation diagnostic.
    pub diagnostic: Option<String>,
    /// The host is currently loading this unit's module.
    pub is_loading: bool,
    /// The unit is queued for (re)compilation.
    pub compilation_needed: bool,
    /// The unit has compiled successfully at least once; cascade removal
    /// retires only such units.
    pub compiled_once: bool,
}

impl ScriptUnit {
    pub fn new(script_name: impl Into<String>) -> Self {
        let script_name = script_name.into();
        Self {
            name: normalize_name(&script_name),
            script_name,
            lines: Vec::new(),
            encoding: String::new(),
            last_modified: None,
            last_cached: None,
            last_compiled: None,
            requires: Vec::new(),
            references: Vec::new(),
            include_paths: Vec::new(),
            diagnostic: None,
            is_loading: false,
            compilation_needed: false,
            compiled_once: false,
        }
    }

    /// Source file name on disk.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.script_name, SCRIPT_EXTENSION)
    }

    /// True when the backing file changed since the lines were cached.
    ///
    /// Stamps compare for exact equality; any difference, forward or
    /// backward, counts as a modification.
    pub fn is_modified(&self, current: Option<SystemTime>) -> bool {
        self.last_cached != current
    }

    /// Caches fresh source text and clears stale directive state.
    pub fn refresh(&mut self, text: &str, encoding: &str, modified: Option<SystemTime>) {
        self.lines = text.lines().map(str::to_string).collect();
        self.encoding = encoding.to_string();
        self.last_modified = modified;
        self.last_cached = modified;
        self.requires.clear();
        self.references.clear();
        self.include_paths.clear();
        self.diagnostic = None;
    }

    /// Records a resolution failure on the unit.
    pub fn fail(&mut self, diagnostic: impl Into<String>) {
        self.diagnostic = Some(diagnostic.into());
        self.compilation_needed = false;
    }

    /// Records a successful compilation.
    pub fn mark_compiled(&mut self, at: SystemTime) {
        self.last_compiled = Some(at);
        self.compiled_once = true;
        self.compilation_needed = false;
        self.diagnostic = None;
    }
}
