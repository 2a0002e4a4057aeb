// SPDX-License-Identifier: Apache-2.0

//! File tailing: stable file identity, incremental line reading across
//! rotation and truncation, and the durable checkpoint store that makes
//! restarts resume exactly where delivery was last confirmed.

pub mod checkpoint;
pub mod file_id;
pub mod reader;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use file_id::FileId;
pub use reader::{FileTailer, Record, RecordSpan, TailError};
