// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SandFS Core — ergonomic file/directory API over sandboxed storage
//!
//! The storage collaborator exposes a tree of nodes plus a synchronous,
//! exclusively-opened access handle per file that may only be driven from
//! dedicated executor threads. SandFS layers on top of it:
//!
//! - an access broker proxying async calls into a bounded executor pool,
//! - identity-cached [`FileHandle`]/[`DirHandle`] objects with
//!   reference-counted access sessions and single-writer enforcement,
//! - recursive directory operations with merge-vs-nest copy semantics,
//! - a size-bounded rolling file,
//! - and a two-phase garbage collector for temporary files.
//!
//! All of it hangs off an explicit [`SandFs`] runtime context rather than
//! module-level singletons, so several isolated instances can coexist in one
//! process (tests rely on this).

pub mod broker;
pub mod config;
pub mod dir;
pub mod error;
pub mod file;
pub mod paths;
pub mod rollfile;
pub mod storage;
pub mod tmpfile;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::broker::AccessBroker;
use crate::dir::DirIdent;
use crate::file::FileIdent;

// Re-export the public surface
pub use config::FsConfig;
pub use dir::{DirHandle, FsNode};
pub use error::{FsError, FsResult};
pub use file::{FileHandle, Reader, WriteContent, WriteOptions, Writer};
pub use rollfile::RollFile;
pub use sandfs_proto::{AccessMode, SessionId};
pub use storage::{
    DirNode, EntryKind, FileNode, HostStorage, MemStorage, StorageBackend, SyncAccess,
};
pub use tmpfile::{FileMarkStore, MarkStore, MemoryMarkStore, EXPIRES_TMP_FILES_KEY};

/// Runtime state shared by every handle of one [`SandFs`] context.
pub(crate) struct Shared {
    pub(crate) config: FsConfig,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) broker: AccessBroker,
    /// Identity caches: one ident per path and kind, for the process
    /// lifetime. `file(p)` twice yields the same object.
    pub(crate) files: Mutex<HashMap<String, Arc<FileIdent>>>,
    pub(crate) dirs: Mutex<HashMap<String, Arc<DirIdent>>>,
    pub(crate) marks: Arc<dyn MarkStore>,
    /// Temp files allocated by this session, for teardown marking.
    pub(crate) session_tmp: Mutex<Vec<String>>,
    pub(crate) collector_started: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // teardown is best-effort: whatever this session never swept gets
        // marked for a future session to reclaim
        let names = self.session_tmp.lock().unwrap().clone();
        tmpfile::mark_session(self.marks.as_ref(), &names);
    }
}

/// The SandFS runtime context. Cheap to clone; all clones share the same
/// broker pool, identity caches, and collector state.
#[derive(Clone)]
pub struct SandFs {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SandFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandFs").field("tmp_dir", &self.shared.config.tmp_dir).finish()
    }
}

impl SandFs {
    pub fn new(
        config: FsConfig,
        storage: Arc<dyn StorageBackend>,
        marks: Arc<dyn MarkStore>,
    ) -> SandFs {
        let broker = AccessBroker::new(storage.clone(), config.executor_pool_size);
        SandFs {
            shared: Arc::new(Shared {
                config,
                storage,
                broker,
                files: Mutex::new(HashMap::new()),
                dirs: Mutex::new(HashMap::new()),
                marks,
                session_tmp: Mutex::new(Vec::new()),
                collector_started: AtomicBool::new(false),
            }),
        }
    }

    /// All-in-memory context, used by tests and ephemeral embeddings.
    pub fn in_memory() -> SandFs {
        Self::new(
            FsConfig::default(),
            Arc::new(MemStorage::new()),
            Arc::new(MemoryMarkStore::new()),
        )
    }

    /// Handle for the file at `path`. Two calls for the same path return
    /// the same object.
    pub fn file(&self, path: &str) -> FsResult<FileHandle> {
        FileHandle::open(&self.shared, path)
    }

    /// Handle for the directory at `path`, cached like [`Self::file`] but in
    /// its own namespace.
    pub fn dir(&self, path: &str) -> FsResult<DirHandle> {
        DirHandle::open(&self.shared, path)
    }

    /// Write `content` to the file at `target`, truncating first.
    pub async fn write(&self, target: &str, content: impl Into<WriteContent>) -> FsResult<()> {
        self.write_with(target, content, WriteOptions::default()).await
    }

    /// Write with explicit options; `overwrite: false` appends.
    pub async fn write_with(
        &self,
        target: &str,
        content: impl Into<WriteContent>,
        opts: WriteOptions,
    ) -> FsResult<()> {
        let file = self.file(target)?;
        file::write_content(&file, content.into(), opts).await
    }

    /// True when something exists at `path`. A trailing `/` checks for a
    /// directory; otherwise a file or directory at the final component
    /// counts.
    pub async fn exists(&self, path: &str) -> FsResult<bool> {
        if !path.starts_with('/') {
            return Err(FsError::IllegalPath(path.to_string()));
        }
        if path == "/" || path.ends_with('/') {
            return self.dir(path)?.exists().await;
        }
        if self.file(path)?.exists().await? {
            return Ok(true);
        }
        self.dir(path)?.exists().await
    }

    /// Allocate a temp file under the reserved directory. The name is
    /// recorded in this session's list and the collector is started on
    /// first use.
    pub fn tmpfile(&self) -> FsResult<FileHandle> {
        self.start_collector();
        let name = tmpfile::tmp_name();
        self.shared.session_tmp.lock().unwrap().push(name.clone());
        self.file(&paths::join_path(&self.shared.config.tmp_dir, &name))
    }

    /// Size-bounded rolling file at `path`; see [`RollFile`].
    pub async fn rollfile(&self, path: &str, max_size: u64) -> FsResult<RollFile> {
        RollFile::open(self.file(path)?, max_size).await
    }

    /// Start the temp-file collector: one startup pass over the mark list
    /// plus the interval sweep. Guarded so repeated calls cannot register
    /// the timer twice.
    pub fn start_collector(&self) {
        if self.shared.collector_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no async runtime; temp-file collector not started");
            self.shared.collector_started.store(false, Ordering::SeqCst);
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.sweep_interval();
        let retention = self.shared.config.tmp_retention();
        tokio::spawn(async move {
            if let Some(shared) = weak.upgrade() {
                tmpfile::prune_marked(&shared).await;
            }
            let mut ticker = tokio::time::interval(interval);
            // a tokio interval fires immediately; the sweep cadence starts
            // one period out
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                tmpfile::sweep_expired(&shared, retention).await;
            }
        });
    }

    /// One interval-sweep pass. Exposed for tests.
    pub async fn sweep_expired(&self) {
        tmpfile::sweep_expired(&self.shared, self.shared.config.tmp_retention()).await;
    }

    /// One mark-list pruning pass. Exposed for tests.
    pub async fn prune_marked(&self) {
        tmpfile::prune_marked(&self.shared).await;
    }

    /// Append this session's temp names to the durable mark list and clear
    /// the session list. Also runs (for whatever is left) when the last
    /// clone of this context is dropped.
    pub fn mark_session_tmpfiles(&self) {
        let names = {
            let mut list = self.shared.session_tmp.lock().unwrap();
            std::mem::take(&mut *list)
        };
        tmpfile::mark_session(self.shared.marks.as_ref(), &names);
    }

    /// The reserved temp directory of this context.
    pub fn tmp_dir(&self) -> &str {
        &self.shared.config.tmp_dir
    }
}
