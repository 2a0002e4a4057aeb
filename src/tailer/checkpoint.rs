// SPDX-License-Identifier: Apache-2.0

//! Durable checkpoint store: the only state that must survive a crash.
//!
//! Maps file identity to the byte offset confirmed delivered by the
//! backend. Commits are written to a uniquely named temp file and renamed
//! into place, so a crash can never leave a partially written checkpoint
//! visible. Offsets are monotonically non-decreasing per identity.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::file_id::FileId;

const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "checkpoint state is corrupted and cannot be loaded: {0}. \
         To start fresh, delete the checkpoint file and restart."
    )]
    Corrupted(serde_json::Error),

    #[error("failed to serialize checkpoint state: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Path the file had when last committed; informational, for operators
    /// reading the checkpoint file. Identity is the map key.
    pub path: String,
    pub dev: u64,
    pub ino: u64,
    pub offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointState {
    version: u32,
    /// Keyed by `FileId::key()` ("dev:ino"); BTreeMap keeps the persisted
    /// file stable across rewrites.
    files: BTreeMap<String, CheckpointEntry>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            files: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointState,
}

impl CheckpointStore {
    /// Open the store, loading any previously committed state. A
    /// corrupted file is a fatal error: resuming from unknown offsets
    /// risks silent loss or mass duplication, so the operator must decide.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = File::open(&path)?;
            let state: CheckpointState = serde_json::from_reader(std::io::BufReader::new(file))
                .map_err(CheckpointError::Corrupted)?;
            debug!(
                path = ?path,
                files = state.files.len(),
                version = state.version,
                "loaded checkpoint state"
            );
            state
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            CheckpointState::default()
        };

        Ok(Self { path, state })
    }

    /// The resume point for every previously tailed identity. Identities
    /// not present start at offset 0.
    pub fn offsets(&self) -> HashMap<FileId, u64> {
        self.state
            .files
            .values()
            .map(|e| (FileId::new(e.dev, e.ino), e.offset))
            .collect()
    }

    pub fn offset_for(&self, id: FileId) -> Option<u64> {
        self.state.files.get(&id.key()).map(|e| e.offset)
    }

    /// Durably record that everything up to `offset` for `id` has been
    /// acknowledged by the backend. A commit at or below the stored offset
    /// is a no-op, which both enforces monotonicity and makes repeated
    /// commits of the same offset idempotent.
    pub fn commit(
        &mut self,
        id: FileId,
        path: &Path,
        offset: u64,
    ) -> Result<(), CheckpointError> {
        let key = id.key();
        if let Some(existing) = self.state.files.get(&key) {
            if offset == existing.offset {
                return Ok(());
            }
            if offset < existing.offset {
                warn!(
                    id = %id,
                    stored = existing.offset,
                    requested = offset,
                    "ignoring checkpoint commit below stored offset"
                );
                return Ok(());
            }
        }

        self.state.files.insert(
            key,
            CheckpointEntry {
                path: path.display().to_string(),
                dev: id.dev(),
                ino: id.ino(),
                offset,
            },
        );
        self.write_atomic()
    }

    /// Drop all state for an identity (e.g. a rotated file fully drained
    /// and confirmed).
    pub fn forget(&mut self, id: FileId) -> Result<(), CheckpointError> {
        if self.state.files.remove(&id.key()).is_some() {
            self.write_atomic()?;
        }
        Ok(())
    }

    /// Write the full state to a uniquely named temp file and rename it
    /// over the real one. Rename is atomic on POSIX filesystems; a crash
    /// at any point leaves either the old or the new complete state.
    fn write_atomic(&self) -> Result<(), CheckpointError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let unique = COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_path = self
            .path
            .with_extension(format!("tmp.{}.{}", std::process::id(), unique));

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.state)
            .map_err(CheckpointError::Serialize)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
