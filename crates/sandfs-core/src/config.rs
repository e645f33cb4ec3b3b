// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime configuration for SandFS Core

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration consumed by [`crate::SandFs::new`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Upper bound on broker executor threads. Executors are spawned lazily
    /// and reused round-robin, so this bounds the thread count regardless of
    /// how many files are opened.
    pub executor_pool_size: usize,
    /// Reserved directory for temporary files.
    pub tmp_dir: String,
    /// Age after which a temporary file is reclaimed by the sweep.
    pub tmp_retention_secs: u64,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
    /// Chunk size for streamed copies and file streams.
    pub copy_chunk_size: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            executor_pool_size: 3,
            tmp_dir: "/.sandfs-tmp".to_string(),
            tmp_retention_secs: 3 * 24 * 60 * 60,
            sweep_interval_secs: 60,
            copy_chunk_size: 1024 * 1024,
        }
    }
}

impl FsConfig {
    pub fn tmp_retention(&self) -> Duration {
        Duration::from_secs(self.tmp_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
