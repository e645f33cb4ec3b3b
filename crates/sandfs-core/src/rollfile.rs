// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Size-bounded rolling file
//!
//! Wraps a [`FileHandle`] with an append-only surface. When the tracked size
//! crosses the cap, the oldest ~30% of bytes are dropped and the newest ~70%
//! are rewritten to the front. The 30/70 split is fixed policy, rounding
//! included.

use crate::error::FsResult;
use crate::file::{FileHandle, Reader, Writer};

/// Append-oriented wrapper keeping one reader and one writer open for its
/// whole lifetime; both are released by [`RollFile::remove`].
pub struct RollFile {
    file: FileHandle,
    max_size: u64,
    /// In-memory size counter; storage is not re-queried per append.
    size: u64,
    reader: Reader,
    writer: Writer,
}

impl RollFile {
    pub(crate) async fn open(file: FileHandle, max_size: u64) -> FsResult<RollFile> {
        let writer = file.create_writer().await?;
        let reader = file.create_reader().await?;
        Ok(RollFile {
            file,
            max_size,
            size: 0,
            reader,
            writer,
        })
    }

    /// Append at the current end; compacts once the size cap is crossed.
    pub async fn append(&mut self, content: &str) -> FsResult<()> {
        self.size += self.writer.write(content).await?;
        if self.size >= self.max_size {
            self.reset().await?;
        }
        Ok(())
    }

    /// Drop the oldest ~30% of bytes, keep the newest ~70%.
    async fn reset(&mut self) -> FsResult<()> {
        let cut = (self.size as f64 * 0.3).round() as u64;
        let data = self.reader.read_at(self.size, cut).await?;
        self.size = self.writer.write_at(data, 0).await?;
        self.writer.truncate(self.size).await?;
        Ok(())
    }

    pub async fn text(&self) -> FsResult<String> {
        self.file.text().await
    }

    /// Tracked logical size; not re-read from storage.
    pub fn get_size(&self) -> u64 {
        self.size
    }

    /// Close both ends and remove the underlying file.
    pub async fn remove(mut self) -> FsResult<()> {
        self.reader.close().await?;
        self.writer.close().await?;
        self.file.remove().await
    }
}

impl std::fmt::Debug for RollFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollFile")
            .field("path", &self.file.path())
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .finish()
    }
}
