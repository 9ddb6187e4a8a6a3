//! Source provider: the resolver's view of script, library, and include
//! files.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{ResolveError, Result};
use crate::unit::SCRIPT_EXTENSION;

/// Raw source text as returned by a provider.
#[derive(Debug, Clone)]
pub struct SourceText {
    pub text: String,
    /// Encoding label of the on-disk form.
    pub encoding: String,
    pub modified: Option<SystemTime>,
}

/// Supplies current script text and resolves library/include names.
///
/// The resolver owns no paths itself; everything it knows about the file
/// system goes through this trait, which keeps directive scanning and
/// job building testable against fixtures.
pub trait SourceProvider: Send + Sync {
    /// Current source for a script, by file base name. `Ok(None)` means
    /// the file does not exist.
    fn source(&self, script_name: &str) -> io::Result<Option<SourceText>>;

    /// Modification stamp without reading the file.
    fn modified(&self, script_name: &str) -> Option<SystemTime>;

    /// True when the named library is installed.
    fn library_exists(&self, library: &str) -> bool;

    /// Raw bytes of an installed library, for embedding into a compile
    /// request. `Ok(None)` means the library is not installed.
    fn library_bytes(&self, library: &str) -> io::Result<Option<Vec<u8>>>;

    /// Include-file fallback shipped for a library that is not installed.
    fn include_path(&self, library: &str) -> Option<PathBuf>;
}

/// Attempts before a locked or otherwise unreadable file fails the unit.
const READ_ATTEMPTS: u32 = 3;
/// Backoff between attempts.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Reads a script with bounded retries for transient failures (another
/// writer holding the file). A missing file is not retried.
pub fn read_with_retry(
    provider: &dyn SourceProvider,
    script_name: &str,
) -> Result<Option<SourceText>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.source(script_name) {
            Ok(source) => return Ok(source),
            Err(err) if attempt < READ_ATTEMPTS => {
                debug!(script = script_name, %err, attempt, "retrying source read");
                thread::sleep(RETRY_DELAY);
            }
            Err(err) => {
                return Err(ResolveError::Read {
                    unit: script_name.to_string(),
                    source: err,
                });
            }
        }
    }
}

/// Directory-backed provider: scripts, libraries, and include files each
/// live under one root.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    scripts: PathBuf,
    libraries: PathBuf,
    includes: PathBuf,
}

impl DirectoryProvider {
    pub fn new(
        scripts: impl Into<PathBuf>,
        libraries: impl Into<PathBuf>,
        includes: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scripts: scripts.into(),
            libraries: libraries.into(),
            includes: includes.into(),
        }
    }

    fn script_path(&self, script_name: &str) -> PathBuf {
        self.scripts
            .join(format!("{script_name}.{SCRIPT_EXTENSION}"))
    }
}

impl SourceProvider for DirectoryProvider {
    fn source(&self, script_name: &str) -> io::Result<Option<SourceText>> {
        let path = self.script_path(script_name);
        if !path.is_file() {
            return Ok(None);
        }
        let modified = modification_stamp(&path);
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(SourceText {
            text,
            encoding: "utf-8".to_string(),
            modified,
        }))
    }

    fn modified(&self, script_name: &str) -> Option<SystemTime> {
        modification_stamp(&self.script_path(script_name))
    }

    fn library_exists(&self, library: &str) -> bool {
        self.libraries.join(format!("{library}.dll")).is_file()
    }

    fn library_bytes(&self, library: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.libraries.join(format!("{library}.dll"));
        if !path.is_file() {
            return Ok(None);
        }
        std::fs::read(&path).map(Some)
    }

    fn include_path(&self, library: &str) -> Option<PathBuf> {
        let path = self
            .includes
            .join(format!("{library}.{SCRIPT_EXTENSION}"));
        path.is_file().then_some(path)
    }
}

fn modification_stamp(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
