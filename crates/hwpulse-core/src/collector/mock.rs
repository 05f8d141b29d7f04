//! In-memory filesystem for probe tests.
//!
//! Clones share the same backing store, so a test can keep one handle,
//! update counter files between sampling cycles, and observe how a probe
//! reacts to advancing, frozen or regressing counters.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::collector::traits::FileSystem;

#[derive(Debug, Default)]
struct MockFsInner {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
}

/// Shared in-memory filesystem.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    inner: Arc<Mutex<MockFsInner>>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file; parent directories are created implicitly.
    pub fn set_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.lock().unwrap();
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                inner.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
        inner.files.insert(path, content.into());
    }

    /// Removes a file, simulating a source that disappeared.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.inner.lock().unwrap().files.remove(path.as_ref());
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{:?}", path)))
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(path) || inner.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let inner = self.inner.lock().unwrap();
        if !inner.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?}", path),
            ));
        }
        let mut entries: Vec<PathBuf> = inner
            .files
            .keys()
            .chain(inner.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_backing_store() {
        let fs = MockFs::new();
        let clone = fs.clone();
        fs.set_file("/proc/stat", "cpu 1 2 3");
        assert_eq!(
            clone.read_to_string(Path::new("/proc/stat")).unwrap(),
            "cpu 1 2 3"
        );

        fs.set_file("/proc/stat", "cpu 4 5 6");
        assert_eq!(
            clone.read_to_string(Path::new("/proc/stat")).unwrap(),
            "cpu 4 5 6"
        );
    }

    #[test]
    fn read_dir_lists_direct_children() {
        let fs = MockFs::new();
        fs.set_file("/sys/devices/a/value", "1");
        fs.set_file("/sys/devices/b/value", "2");

        let entries = fs.read_dir(Path::new("/sys/devices")).unwrap();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/sys/devices/a"),
                PathBuf::from("/sys/devices/b")
            ]
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let fs = MockFs::new();
        let err = fs.read_to_string(Path::new("/nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
