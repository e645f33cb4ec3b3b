// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for SandFS Core

use std::io;

use sandfs_proto::WireError;

/// Core filesystem error type
#[derive(thiserror::Error, Clone, Debug)]
pub enum FsError {
    #[error("invalid path: {0}")]
    IllegalPath(String),
    #[error("other writer have not been closed")]
    WriterConflict,
    #[error("{0} is closed")]
    ClosedHandle(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("source does not exist: {0}")]
    SourceNotFound(String),
    #[error("illegal target type: {0}")]
    IllegalTarget(String),
    #[error("exists unclosed reader/writer")]
    HandleBusy,
    #[error("bad session id")]
    BadSession,
    #[error("{0}")]
    Broker(#[from] WireError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("mark store error: {0}")]
    MarkStore(String),
}

impl FsError {
    /// Stable error name, preserved across the broker boundary the way a
    /// thrown error's `name` survives serialization.
    pub fn name(&self) -> &'static str {
        match self {
            FsError::IllegalPath(_) => "IllegalPath",
            FsError::WriterConflict => "WriterConflict",
            FsError::ClosedHandle(_) => "ClosedHandleUse",
            FsError::NotFound(_) => "NotFound",
            FsError::SourceNotFound(_) => "SourceNotFound",
            FsError::IllegalTarget(_) => "IllegalTargetType",
            FsError::HandleBusy => "HandleBusy",
            FsError::BadSession => "BadSession",
            FsError::Broker(_) => "BrokerExecutionError",
            FsError::Storage(_) => "StorageError",
            FsError::MarkStore(_) => "MarkStoreError",
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Storage(err.to_string())
    }
}

pub type FsResult<T> = Result<T, FsError>;
