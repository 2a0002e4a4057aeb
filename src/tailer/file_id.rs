// SPDX-License-Identifier: Apache-2.0

//! Stable file identity based on device id + inode number.
//!
//! The identity survives renames, which is what lets the tailer keep
//! draining a rotated file through its held handle while the path points
//! at a fresh file, and what keys checkpoints so offsets never get applied
//! to the wrong underlying file.

use serde::{Deserialize, Serialize};
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    /// Build a FileId from raw values, e.g. when loading persisted state.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Stable string form used as a checkpoint map key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.dev, self.ino)
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let (dev, ino) = key.split_once(':')?;
        Some(Self {
            dev: dev.parse().ok()?,
            ino: ino.parse().ok()?,
        })
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn same_file_same_id() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        file.flush().unwrap();

        let id1 = FileId::from_path(file.path()).unwrap();
        let id2 = FileId::from_path(file.path()).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn different_files_different_ids() {
        let file1 = NamedTempFile::new().unwrap();
        let file2 = NamedTempFile::new().unwrap();

        let id1 = FileId::from_path(file1.path()).unwrap();
        let id2 = FileId::from_path(file2.path()).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn id_stable_across_append_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"one\n").unwrap();

        let id1 = FileId::from_path(&path).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two\n").unwrap();
        drop(f);

        let renamed = dir.path().join("a.log.1");
        std::fs::rename(&path, &renamed).unwrap();

        let id2 = FileId::from_path(&renamed).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn key_round_trip() {
        let id = FileId::new(123, 456);
        assert_eq!(id.key(), "123:456");
        assert_eq!(FileId::parse_key("123:456"), Some(id));
        assert_eq!(FileId::parse_key("garbage"), None);
        assert_eq!(FileId::parse_key("1:x"), None);
    }
}
