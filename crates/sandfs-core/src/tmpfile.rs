// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Temporary-file allocation and garbage collection
//!
//! Temp files live under a reserved directory with names of the form
//! `{random_token}-{epoch_millis}`. Two reclamation paths exist: an interval
//! sweep deleting entries older than the retention window (or with
//! unparseable names), and a cross-session mark list so that files from
//! sessions that never swept get cleaned up by a later session's startup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tracing::warn;

use crate::dir::{DirHandle, FsNode};
use crate::error::{FsError, FsResult};
use crate::file::FileHandle;
use crate::paths;
use crate::Shared;

/// Well-known key under which the cross-session mark list is persisted.
pub const EXPIRES_TMP_FILES_KEY: &str = "SANDFS_EXPIRES_TMP_FILES";

/// Durable key-value collaborator holding the comma-joined mark list.
pub trait MarkStore: Send + Sync {
    fn get(&self) -> FsResult<Option<String>>;
    fn set(&self, value: &str) -> FsResult<()>;
    /// Append to the stored value; concurrent appenders must not lose
    /// entries.
    fn append(&self, tail: &str) -> FsResult<()>;
}

/// In-memory mark store for tests and ephemeral embeddings.
#[derive(Default)]
pub struct MemoryMarkStore {
    value: Mutex<Option<String>>,
}

impl MemoryMarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: &str) -> Self {
        Self {
            value: Mutex::new(Some(value.to_string())),
        }
    }
}

impl MarkStore for MemoryMarkStore {
    fn get(&self) -> FsResult<Option<String>> {
        Ok(self.value.lock().unwrap().clone())
    }

    fn set(&self, value: &str) -> FsResult<()> {
        *self.value.lock().unwrap() = Some(value.to_string());
        Ok(())
    }

    fn append(&self, tail: &str) -> FsResult<()> {
        let mut value = self.value.lock().unwrap();
        let mut joined = value.take().unwrap_or_default();
        joined.push_str(tail);
        *value = Some(joined);
        Ok(())
    }
}

/// Mark store persisted as one text file on the host.
pub struct FileMarkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileMarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store under `dir`, named by the well-known key.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(EXPIRES_TMP_FILES_KEY))
    }
}

impl MarkStore for FileMarkStore {
    fn get(&self) -> FsResult<Option<String>> {
        let _lock = self.lock.lock().unwrap();
        read_marks(&self.path)
    }

    fn set(&self, value: &str) -> FsResult<()> {
        let _lock = self.lock.lock().unwrap();
        std::fs::write(&self.path, value).map_err(|err| FsError::MarkStore(err.to_string()))
    }

    fn append(&self, tail: &str) -> FsResult<()> {
        let _lock = self.lock.lock().unwrap();
        let mut joined = read_marks(&self.path)?.unwrap_or_default();
        joined.push_str(tail);
        std::fs::write(&self.path, joined).map_err(|err| FsError::MarkStore(err.to_string()))
    }
}

fn read_marks(path: &Path) -> FsResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FsError::MarkStore(err.to_string())),
    }
}

/// Generated temp-file name; the trailing epoch is what the sweep parses.
pub(crate) fn tmp_name() -> String {
    format!("{}-{}", rand::random::<u64>(), now_millis())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn tmp_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+-(\d+)$").unwrap())
}

fn repeated_commas_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",{2,}").unwrap())
}

/// Best-effort removal: a file is truncated through a writer first so any
/// retained quota is released even if the removal itself is delayed. Entries
/// currently held open simply fail and stay.
pub(crate) async fn safe_remove(node: FsNode) -> bool {
    let path = node.path().to_string();
    match try_remove(node).await {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %path, error = %err, "failed to remove temp entry");
            false
        }
    }
}

async fn try_remove(node: FsNode) -> FsResult<()> {
    match node {
        FsNode::File(file) => {
            let mut writer = file.create_writer().await?;
            let truncated = writer.truncate(0).await;
            let closed = writer.close().await;
            truncated?;
            closed?;
            file.remove().await
        }
        FsNode::Dir(dir) => dir.remove().await,
    }
}

/// One pass of the interval sweep: reclaim every child of the temp dir whose
/// name is unparseable or older than the retention window.
pub(crate) async fn sweep_expired(shared: &Arc<Shared>, retention: Duration) {
    let dir = match DirHandle::open(shared, &shared.config.tmp_dir) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(error = %err, "invalid temp directory path");
            return;
        }
    };
    let children = match dir.children().await {
        Ok(children) => children,
        Err(err) => {
            warn!(error = %err, "failed to list temp directory");
            return;
        }
    };

    let retention_ms = retention.as_millis() as u64;
    let now = now_millis();
    for child in children {
        let created = tmp_name_re()
            .captures(child.name())
            .and_then(|caps| caps[1].parse::<u64>().ok());
        let expired = match created {
            Some(ts) => now.saturating_sub(ts) > retention_ms,
            // unparseable names are reclaimed unconditionally
            None => true,
        };
        if expired {
            safe_remove(child).await;
        }
    }
}

/// Startup pass over the cross-session mark list: every name that can be
/// removed is excised from the stored string, the rest is written back with
/// duplicate commas collapsed.
pub(crate) async fn prune_marked(shared: &Arc<Shared>) {
    let mut mark_str = match shared.marks.get() {
        Ok(Some(value)) => value,
        Ok(None) => return,
        Err(err) => {
            warn!(error = %err, "failed to read temp mark list");
            return;
        }
    };

    let names: Vec<String> =
        mark_str.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
    for name in names {
        let path = paths::join_path(&shared.config.tmp_dir, &name);
        let Ok(file) = FileHandle::open(shared, &path) else {
            continue;
        };
        if safe_remove(FsNode::File(file)).await {
            mark_str = mark_str.replacen(&name, "", 1);
        }
    }

    let collapsed = repeated_commas_re().replace_all(&mark_str, ",").into_owned();
    if let Err(err) = shared.marks.set(&collapsed) {
        warn!(error = %err, "failed to write back temp mark list");
    }
}

/// Teardown marking: append this session's temp names to the durable list so
/// a future session can reclaim them if the sweep never ran here.
pub(crate) fn mark_session(marks: &dyn MarkStore, names: &[String]) {
    if names.is_empty() {
        return;
    }
    let tail = format!(",{}", names.join(","));
    if let Err(err) = marks.append(&tail) {
        warn!(error = %err, "failed to mark session temp files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_name_shape() {
        let name = tmp_name();
        let caps = tmp_name_re().captures(&name).expect("name must parse");
        assert!(caps[1].parse::<u64>().unwrap() > 0);
    }

    #[test]
    fn test_memory_mark_store_append() {
        let store = MemoryMarkStore::new();
        assert_eq!(store.get().unwrap(), None);
        store.append(",a,b").unwrap();
        store.append(",c").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some(",a,b,c"));
        store.set("x").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_file_mark_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileMarkStore::in_dir(tmp.path());
        assert_eq!(store.get().unwrap(), None);
        store.append(",one").unwrap();
        store.append(",two").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some(",one,two"));
        store.set("three").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some("three"));
    }

    #[test]
    fn test_comma_collapse() {
        let collapsed = repeated_commas_re().replace_all(",a,,,b,,c", ",");
        assert_eq!(collapsed, ",a,b,c");
    }
}
