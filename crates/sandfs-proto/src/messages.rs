// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Broker message types for SandFS
//!
//! One request envelope correlates to exactly one response envelope through
//! its `id`. Binary payloads (`data` in `Write`, `Bytes` in replies) travel
//! by move over in-process channels and are skipped during serialization, so
//! diagnostic renderings of a request never embed bulk bytes.

use serde::{Deserialize, Serialize};

/// Identifier of one open access session on an executor context.
///
/// Allocated by the broker dispatcher, monotonically increasing, never
/// reused while the session is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an access session is opened on the storage primitive.
///
/// `ReadWrite` is the default exclusive mode. `ReadWriteUnsafe` opts out of
/// exclusivity: several unsafe sessions may write the same file and the
/// outcome is last-write-wins with no serialization between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "readwrite")]
    ReadWrite,
    #[serde(rename = "readwrite-unsafe")]
    ReadWriteUnsafe,
}

/// Operation payload of a broker request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opType", content = "args", rename_all = "camelCase")]
pub enum BrokerOp {
    Register {
        sid: SessionId,
        path: String,
        mode: AccessMode,
    },
    Read {
        sid: SessionId,
        offset: u64,
        size: u64,
    },
    Write {
        sid: SessionId,
        #[serde(skip)]
        data: Vec<u8>,
        at: Option<u64>,
    },
    Truncate {
        sid: SessionId,
        size: u64,
    },
    Flush {
        sid: SessionId,
    },
    GetSize {
        sid: SessionId,
    },
    Close {
        sid: SessionId,
    },
}

impl BrokerOp {
    /// Short operation name, used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            BrokerOp::Register { .. } => "register",
            BrokerOp::Read { .. } => "read",
            BrokerOp::Write { .. } => "write",
            BrokerOp::Truncate { .. } => "truncate",
            BrokerOp::Flush { .. } => "flush",
            BrokerOp::GetSize { .. } => "getSize",
            BrokerOp::Close { .. } => "close",
        }
    }
}

/// Request envelope: correlation id plus operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerRequest {
    pub id: u64,
    pub op: BrokerOp,
}

impl BrokerRequest {
    /// Diagnostic rendering attached to executor-side errors. Payload bytes
    /// are excluded by the serde layout of `BrokerOp`.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Successful return value of one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BrokerReply {
    /// Operation with no return value (register, truncate, flush, close).
    Done,
    /// Bytes produced by a read; length may be shorter than requested when
    /// the file ends before `offset + size`.
    Bytes(Vec<u8>),
    /// Number of bytes accepted by a write.
    Written(u64),
    /// Current file size.
    Size(u64),
}

/// Response envelope, routed back to the caller awaiting `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "evtType", rename_all = "camelCase")]
pub enum BrokerResponse {
    Callback {
        id: u64,
        #[serde(rename = "returnVal")]
        ret: BrokerReply,
    },
    ThrowError {
        id: u64,
        err: WireError,
    },
}

/// An executor-side failure in transportable form: the original error name
/// and message plus the serialized request that provoked it.
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{name}: {message}\n{request}")]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub request: String,
}

impl WireError {
    pub fn new(
        name: impl Into<String>,
        message: impl Into<String>,
        request: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            request: request.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_excludes_payload_bytes() {
        let req = BrokerRequest {
            id: 7,
            op: BrokerOp::Write {
                sid: SessionId(3),
                data: vec![0xAB; 4096],
                at: Some(128),
            },
        };
        let rendered = req.describe();
        assert!(rendered.contains("\"opType\":\"write\""));
        assert!(rendered.contains("\"at\":128"));
        assert!(!rendered.contains("171")); // 0xAB never serialized
    }

    #[test]
    fn test_wire_error_display() {
        let err = WireError::new("NotFound", "not found: /a/b", "{\"id\":1}");
        assert_eq!(err.to_string(), "NotFound: not found: /a/b\n{\"id\":1}");
    }

    #[test]
    fn test_access_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&AccessMode::ReadWrite).unwrap(),
            "\"readwrite\""
        );
        assert_eq!(
            serde_json::to_string(&AccessMode::ReadWriteUnsafe).unwrap(),
            "\"readwrite-unsafe\""
        );
    }

    #[test]
    fn test_request_roundtrip() {
        let req = BrokerRequest {
            id: 1,
            op: BrokerOp::Read {
                sid: SessionId(9),
                offset: 0,
                size: 1024,
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: BrokerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }
}
