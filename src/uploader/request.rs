// SPDX-License-Identifier: Apache-2.0

//! Upload payload encoding and acknowledgment decoding.
//!
//! A batch is serialized as line-delimited records with per-record source
//! identity and byte span, then gzip-compressed. The backend's 2xx
//! response enumerates the offsets it durably committed, per identity;
//! those acks, not our request contents, drive checkpoint advancement.

use std::collections::HashMap;
use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tower::BoxError;

use crate::copying::Batch;
use crate::tailer::FileId;

#[derive(Serialize)]
struct UploadPayload<'a> {
    session: &'a str,
    stream: &'a str,
    records: Vec<PayloadRecord<'a>>,
}

#[derive(Serialize)]
struct PayloadRecord<'a> {
    dev: u64,
    ino: u64,
    offset: u64,
    len: u32,
    line: &'a str,
}

/// A ready-to-send request body. Cloning is cheap; retries reuse the same
/// encoded bytes.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// gzip-compressed JSON payload
    pub body: Bytes,
    pub uncompressed_len: usize,
}

pub fn build_request(session: &str, batch: &Batch) -> Result<UploadRequest, BoxError> {
    let payload = UploadPayload {
        session,
        stream: &batch.stream,
        records: batch
            .records
            .iter()
            .map(|r| PayloadRecord {
                dev: r.file_id.dev(),
                ino: r.file_id.ino(),
                offset: r.span.offset,
                len: r.span.len,
                line: &r.line,
            })
            .collect(),
    };

    let json = serde_json::to_vec(&payload)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    Ok(UploadRequest {
        uncompressed_len: json.len(),
        body: Bytes::from(compressed),
    })
}

#[derive(Debug, Deserialize)]
struct AckEntry {
    dev: u64,
    ino: u64,
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct AckBody {
    #[serde(default)]
    committed: Vec<AckEntry>,
}

/// Parse the backend acknowledgment into confirmed end offsets per file
/// identity. A multi-identity batch may come back partially acknowledged;
/// whatever is present is committed per identity.
pub fn parse_ack(body: &[u8]) -> Result<HashMap<FileId, u64>, serde_json::Error> {
    let ack: AckBody = serde_json::from_slice(body)?;
    Ok(ack
        .committed
        .into_iter()
        .map(|e| (FileId::new(e.dev, e.ino), e.offset))
        .collect())
}
