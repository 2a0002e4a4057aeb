// SPDX-License-Identifier: Apache-2.0

//! The copying pipeline: accumulates tailed records into bounded batches,
//! hands them to the uploader, and advances checkpoints only once the
//! backend has acknowledged delivery.

pub mod acks;
pub mod batcher;
pub mod manager;

pub use batcher::{Batch, BatchConfig, Batcher};
pub use manager::{CopyingConfig, CopyingManager};
