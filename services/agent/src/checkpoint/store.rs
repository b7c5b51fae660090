//! Durable record persistence.
//!
//! Two write disciplines exist:
//!
//! - Whole-record files (`*.info`, pid files) are replaced atomically:
//!   write to a temp file in the same directory, fsync, rename, fsync the
//!   directory. A reader sees either the old record or the new one.
//! - The per-task `updates` file is append-only. Each record is framed as
//!   `(u32 LE length, payload, 32-byte SHA-256 of the payload)` and fsynced
//!   before the caller may treat the update as durable. Readers stop at the
//!   first truncated or corrupt frame, treating the tail as absent.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use armada_id::UpdateId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::registry::StatusUpdate;

const DIGEST_LEN: usize = 32;

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding error at {path}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn encoding(path: &Path, source: serde_json::Error) -> Self {
        Self::Encoding {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Atomically replaces the record at `path`, returning only after the
/// record is durable.
pub fn checkpoint<T: Serialize>(path: &Path, record: &T) -> Result<(), CheckpointError> {
    let parent = path
        .parent()
        .ok_or_else(|| CheckpointError::io(path, ErrorKind::InvalidInput.into()))?;
    std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;

    let payload = serde_json::to_vec(record).map_err(|e| CheckpointError::encoding(path, e))?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
        file.write_all(&payload)
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        file.sync_all().map_err(|e| CheckpointError::io(&tmp, e))?;
    }

    std::fs::rename(&tmp, path).map_err(|e| CheckpointError::io(path, e))?;

    // Make the rename itself durable.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Reads a whole-record file; an absent file is `None`.
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let payload = match std::fs::read(path) {
        Ok(payload) => payload,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };

    let record = serde_json::from_slice(&payload)
        .map_err(|e| CheckpointError::encoding(path, e))?;
    Ok(Some(record))
}

/// One entry in a task's append-only update log: either a produced update
/// or the master's acknowledgement of one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateLogRecord {
    Update { update: StatusUpdate },
    Ack { update_id: UpdateId },
}

/// Appends one framed record to a task's update log and fsyncs it.
pub fn append_update_record(
    path: &Path,
    record: &UpdateLogRecord,
) -> Result<(), CheckpointError> {
    let parent = path
        .parent()
        .ok_or_else(|| CheckpointError::io(path, ErrorKind::InvalidInput.into()))?;
    std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;

    let payload = serde_json::to_vec(record).map_err(|e| CheckpointError::encoding(path, e))?;
    let digest = Sha256::digest(&payload);

    let mut frame = Vec::with_capacity(4 + payload.len() + DIGEST_LEN);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&digest);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CheckpointError::io(path, e))?;
    file.write_all(&frame)
        .map_err(|e| CheckpointError::io(path, e))?;
    file.sync_all().map_err(|e| CheckpointError::io(path, e))?;

    Ok(())
}

/// Reads every intact record from a task's update log.
///
/// A truncated or corrupt tail is treated as absent: the crash happened
/// mid-append and the in-memory state never considered that record durable.
pub fn read_update_records(path: &Path) -> Result<Vec<UpdateLogRecord>, CheckpointError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| CheckpointError::io(path, e))?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            warn!(path = %path.display(), offset, "truncated length header in update log");
            break;
        }
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let frame_end = offset + 4 + len + DIGEST_LEN;
        if frame_end > bytes.len() {
            warn!(path = %path.display(), offset, "truncated record in update log");
            break;
        }

        let payload = &bytes[offset + 4..offset + 4 + len];
        let digest = &bytes[offset + 4 + len..frame_end];
        if Sha256::digest(payload).as_slice() != digest {
            warn!(path = %path.display(), offset, "checksum mismatch in update log");
            break;
        }

        match serde_json::from_slice(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "undecodable record in update log");
                break;
            }
        }

        offset = frame_end;
    }

    Ok(records)
}
