//! Filesystem access and file identity.
//!
//! The build system never touches `std::fs` directly; everything goes
//! through the [`FileSystem`] capability so tests can substitute fakes and
//! so file identity is captured uniformly as [`FileInfo`].

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The kind of filesystem object a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// A regular file (or anything that is neither a directory nor absent).
    File,
    /// A directory.
    Directory,
    /// Nothing exists at the path.
    Missing,
}

/// A file modification timestamp with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

/// The observable identity of a filesystem object.
///
/// Two infos compare equal iff every field matches; a missing info only
/// ever equals another missing info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mod_time: FileTimestamp,
    pub kind: FileKind,
}

impl FileInfo {
    /// The info recorded for a path with nothing behind it.
    pub fn missing() -> Self {
        FileInfo {
            device: 0,
            inode: 0,
            size: 0,
            mod_time: FileTimestamp::default(),
            kind: FileKind::Missing,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.kind == FileKind::Missing
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FileKind::Missing => write!(f, "<missing>"),
            _ => write!(
                f,
                "dev={} ino={} size={} mtime={}.{:09}",
                self.device, self.inode, self.size, self.mod_time.seconds, self.mod_time.nanoseconds
            ),
        }
    }
}

/// Filesystem operations the build system depends on.
///
/// Implementations must be shareable across the engine thread and queue
/// workers for the duration of a build.
pub trait FileSystem: Send + Sync {
    /// Read the entire contents of a file, or `None` if it cannot be read.
    fn get_file_contents(&self, path: &Path) -> Option<Vec<u8>>;

    /// Capture the identity of the object at `path`.
    ///
    /// Never fails; unreadable or absent paths report a missing info.
    fn get_file_info(&self, path: &Path) -> FileInfo;

    /// Create a directory and any missing parents.
    fn create_directories(&self, path: &Path) -> Result<()>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn get_file_contents(&self, path: &Path) -> Option<Vec<u8>> {
        fs::read(path).ok()
    }

    fn get_file_info(&self, path: &Path) -> FileInfo {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return FileInfo::missing(),
        };

        let kind = if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| FileTimestamp {
                seconds: duration.as_secs(),
                nanoseconds: duration.subsec_nanos(),
            })
            .unwrap_or_default();

        FileInfo {
            device: device_of(&metadata),
            inode: inode_of(&metadata),
            size: metadata.len(),
            mod_time,
            kind,
        }
    }

    fn create_directories(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))
    }
}

#[cfg(unix)]
fn device_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.dev()
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

// Windows has no stable device/inode pair through std; size and mtime carry
// the identity there.
#[cfg(not(unix))]
fn device_of(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_info() {
        let fs = LocalFileSystem;
        let info = fs.get_file_info(Path::new("/definitely/not/here"));
        assert!(info.is_missing());
        assert_eq!(info, FileInfo::missing());
    }

    #[test]
    fn test_file_info_changes_with_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.txt");
        std::fs::write(&path, "one").unwrap();

        let fs = LocalFileSystem;
        let before = fs.get_file_info(&path);
        assert_eq!(before.kind, FileKind::File);
        assert_eq!(before.size, 3);

        std::fs::write(&path, "longer contents").unwrap();
        let after = fs.get_file_info(&path);
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_only_equals_missing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.txt");
        std::fs::write(&path, "").unwrap();

        let fs = LocalFileSystem;
        let empty = fs.get_file_info(&path);
        // An empty file is not the same as a missing one.
        assert_ne!(empty, FileInfo::missing());
    }

    #[test]
    fn test_create_directories() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");

        let fs = LocalFileSystem;
        fs.create_directories(&nested).unwrap();
        assert!(fs.get_file_info(&nested).is_directory());

        // Creating an existing directory is fine.
        fs.create_directories(&nested).unwrap();
    }

    #[test]
    fn test_get_file_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.txt");
        std::fs::write(&path, "payload").unwrap();

        let fs = LocalFileSystem;
        assert_eq!(fs.get_file_contents(&path).unwrap(), b"payload");
        assert!(fs.get_file_contents(&tmp.path().join("nope")).is_none());
    }
}
