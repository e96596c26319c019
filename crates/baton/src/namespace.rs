//! Filesystem namespace shared by both endpoints.
//!
//! Two unrelated processes find a channel by joining its name onto the same
//! namespace root. The root is created on first use and never removed.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory under the system temp dir that existing endpoints agree on.
pub const DEFAULT_NAMESPACE: &str = "python_unity_shared_memory";

/// Character appended once per generation to form data file names.
pub const GENERATION_SUFFIX: char = '_';

/// A directory holding channel files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: PathBuf,
}

impl Namespace {
    /// The well-known namespace under the system temp directory.
    pub fn temp() -> Self {
        Self::at(std::env::temp_dir().join(DEFAULT_NAMESPACE))
    }

    /// A namespace rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the channel files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Path of the control file for `name`.
    pub fn control_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path of the data file for `name` at `generation`.
    ///
    /// Generations start at 1. A generation below that yields the control
    /// path; [`DataSegment`](crate::DataSegment) refuses to map those.
    pub fn data_path(&self, name: &str, generation: i32) -> PathBuf {
        let suffix_len = usize::try_from(generation).unwrap_or(0);
        let mut file = String::with_capacity(name.len() + suffix_len);
        file.push_str(name);
        file.extend(std::iter::repeat_n(GENERATION_SUFFIX, suffix_len));
        self.root.join(file)
    }

    /// Remove every file in the namespace whose name starts with `prefix`.
    ///
    /// Returns how many files were removed. Files that disappear while we
    /// iterate are skipped.
    pub fn delete_files(&self, prefix: &str) -> io::Result<usize> {
        self.ensure()?;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|file| file.starts_with(prefix));
            if !matches || !entry.file_type()?.is_file() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(root = %self.root.display(), prefix, removed, "deleted channel files");
        Ok(removed)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::temp()
    }
}

/// Remove every file starting with `prefix` from the default namespace.
pub fn delete_files(prefix: &str) -> io::Result<usize> {
    Namespace::temp().delete_files(prefix)
}

/// Check that `name` can be used as a channel name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("channel name must not be empty"));
    }
    if name.ends_with(GENERATION_SUFFIX) {
        return Err(Error::invalid(format!(
            "channel name {:?} must not end with {:?}",
            name, GENERATION_SUFFIX
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::invalid(format!(
            "channel name {:?} must be a single file name",
            name
        )));
    }
    Ok(())
}
