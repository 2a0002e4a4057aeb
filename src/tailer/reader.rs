// SPDX-License-Identifier: Apache-2.0

//! Incremental line tailer for one file path.
//!
//! The tailer polls rather than relying on OS change notifications: the
//! files it watches are created, rotated and truncated by processes
//! outside the agent's control, and polling behaves identically across
//! local and network filesystems.
//!
//! Rotation handling: the tailer holds the open handle to the identity it
//! is reading, so when the path starts pointing at a new file the old
//! identity's unread tail is drained through the held handle, in full and
//! in order, before any bytes of the new identity are surfaced.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::file_id::FileId;

#[derive(Error, Debug)]
pub enum TailError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Byte range of one record within its file: where the line begins and how
/// many bytes it consumed (newline included). Checkpoint advancement
/// depends on this per-record provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    pub offset: u64,
    pub len: u32,
}

impl RecordSpan {
    pub fn new(offset: u64, len: u32) -> Self {
        Self { offset, len }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// One line read from a tailed file.
#[derive(Debug, Clone)]
pub struct Record {
    pub file_id: FileId,
    pub span: RecordSpan,
    pub line: String,
}

struct OpenFile {
    file: File,
    id: FileId,
    offset: u64,
    last_len: u64,
}

pub struct FileTailer {
    path: PathBuf,
    max_line_len: usize,
    current: Option<OpenFile>,
    draining: Option<OpenFile>,
    /// Confirmed offsets from the checkpoint store, consumed the first
    /// time each identity is opened.
    resume: HashMap<FileId, u64>,
}

impl FileTailer {
    /// Open a tailer for `path`. The file does not need to exist yet; the
    /// tailer picks it up on a later poll. `resume` holds confirmed
    /// offsets per file identity; identities not present start at 0.
    pub fn open(
        path: impl AsRef<Path>,
        max_line_len: usize,
        resume: HashMap<FileId, u64>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_line_len,
            current: None,
            draining: None,
            resume,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read any newly appended complete lines. Returns records from at
    /// most one file identity per call: a rotated-away identity is fully
    /// drained across polls before the new identity's bytes appear.
    pub fn poll(&mut self) -> Result<Vec<Record>, TailError> {
        let mut records = Vec::new();

        self.check_path()?;

        if let Some(mut old) = self.draining.take() {
            // Flush a trailing partial line too: nothing will complete it
            // once the writer has moved on to the new file.
            read_records(&mut old, self.max_line_len, true, &mut records)?;
            let len = old.file.metadata().map(|m| m.len()).unwrap_or(old.offset);
            if old.offset < len {
                self.draining = Some(old);
            } else {
                debug!(path = ?self.path, id = %old.id, "rotated file drained");
            }
            if self.draining.is_some() || !records.is_empty() {
                return Ok(records);
            }
        }

        if let Some(cur) = self.current.as_mut() {
            read_records(cur, self.max_line_len, false, &mut records)?;
            cur.last_len = cur.file.metadata()?.len();
        }

        Ok(records)
    }

    pub fn close(self) {}

    /// Reconcile our held handles with whatever is at the path now:
    /// detect creation, rotation (identity change) and truncation.
    fn check_path(&mut self) -> Result<(), TailError> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Rotated away with no successor yet. Drain what we hold;
                // a second pending rotation waits until the first drains.
                if self.draining.is_none() {
                    if let Some(old) = self.current.take() {
                        debug!(path = ?self.path, id = %old.id, "file vanished, draining held handle");
                        self.draining = Some(old);
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let path_id = FileId::from_metadata(&meta);

        match self.current.as_mut() {
            Some(cur) if cur.id == path_id => {
                if meta.len() < cur.last_len {
                    warn!(
                        path = ?self.path,
                        last_len = cur.last_len,
                        new_len = meta.len(),
                        "file truncated in place, resetting offset"
                    );
                    cur.offset = 0;
                }
                cur.last_len = meta.len();
            }
            Some(_) => {
                // Identity changed under the path. Adopt the rotation only
                // once any previous rotation has finished draining, so
                // per-identity order is preserved across chained rotations.
                if self.draining.is_none() {
                    let old = self.current.take().unwrap();
                    debug!(path = ?self.path, old_id = %old.id, new_id = %path_id, "rotation detected");
                    self.draining = Some(old);
                    self.open_current()?;
                }
            }
            None => {
                self.open_current()?;
            }
        }

        Ok(())
    }

    fn open_current(&mut self) -> Result<(), TailError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            // Lost a race with another rotation; retry next poll.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        let id = FileId::from_metadata(&meta);

        let mut offset = self.resume.remove(&id).unwrap_or(0);
        if offset > meta.len() {
            warn!(
                path = ?self.path,
                id = %id,
                checkpoint = offset,
                len = meta.len(),
                "checkpoint beyond file length, starting from 0"
            );
            offset = 0;
        }

        debug!(path = ?self.path, id = %id, offset, "tracking file");
        self.current = Some(OpenFile {
            file,
            id,
            offset,
            last_len: meta.len(),
        });
        Ok(())
    }
}

fn read_records(
    f: &mut OpenFile,
    max_line_len: usize,
    flush_partial: bool,
    out: &mut Vec<Record>,
) -> io::Result<()> {
    f.file.seek(SeekFrom::Start(f.offset))?;
    let mut reader = BufReader::new(&f.file);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }

        let terminated = buf.last() == Some(&b'\n');
        if !terminated && !flush_partial {
            // Incomplete line: leave it unread until the newline arrives.
            break;
        }

        let content_len = if terminated { n - 1 } else { n };
        let mut line = String::from_utf8_lossy(&buf[..content_len]).into_owned();
        if line.len() > max_line_len {
            line = line.chars().take(max_line_len).collect();
        }

        out.push(Record {
            file_id: f.id,
            span: RecordSpan::new(f.offset, n as u32),
            line,
        });
        f.offset += n as u64;

        if !terminated {
            break;
        }
    }

    Ok(())
}
