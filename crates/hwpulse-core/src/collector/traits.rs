//! Filesystem seam for probes.
//!
//! Probes read `/proc` and `/sys` through this trait so tests can substitute
//! an in-memory filesystem and simulate counter sequences without Linux.

use std::io;
use std::path::{Path, PathBuf};

/// Minimal filesystem surface a probe needs.
pub trait FileSystem: Send + Sync {
    /// Reads a whole file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Returns true when the path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists the entries of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Production implementation backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}
