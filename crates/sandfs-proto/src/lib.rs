// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SandFS Protocol — message envelopes for the access broker
//!
//! This crate defines the request/response types exchanged between the
//! broker dispatcher and its executor contexts, plus the serialized error
//! form that carries executor-side failures back to callers.

pub mod messages;

// Re-export key types
pub use messages::{
    AccessMode, BrokerOp, BrokerReply, BrokerRequest, BrokerResponse, SessionId, WireError,
};
