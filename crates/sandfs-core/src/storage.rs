// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage collaborator interface and reference backends for SandFS Core
//!
//! SandFS does not implement a storage engine. It consumes the small
//! capability surface below: a tree of directory/file nodes plus an
//! exclusively-opened synchronous access handle per file. The synchronous
//! handle is only ever driven from broker executor threads; everything else
//! may be called from any context.
//!
//! Two reference backends ship with the crate: `MemStorage` (mutexed tree of
//! byte vectors, used by most tests) and `HostStorage` (a sandboxed subtree
//! of the host filesystem).

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sandfs_proto::AccessMode;

use crate::error::{FsError, FsResult};
use crate::paths;

/// Kind of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Storage backend trait: the root of a sandboxed node tree.
pub trait StorageBackend: Send + Sync {
    fn root(&self) -> Arc<dyn DirNode>;
}

/// A directory node in the storage tree.
pub trait DirNode: Send + Sync {
    /// Child directory, created on demand when `create` is set.
    fn dir(&self, name: &str, create: bool) -> FsResult<Arc<dyn DirNode>>;
    /// Child file, created on demand when `create` is set.
    fn file(&self, name: &str, create: bool) -> FsResult<Arc<dyn FileNode>>;
    /// Immediate children. Ordering is whatever the backend yields.
    fn entries(&self) -> FsResult<Vec<(String, EntryKind)>>;
    /// Remove one child entry. Fails while any file under it holds an open
    /// access handle.
    fn remove_entry(&self, name: &str, recursive: bool) -> FsResult<()>;
}

/// A file node in the storage tree.
pub trait FileNode: Send + Sync {
    fn size(&self) -> FsResult<u64>;
    /// Open the synchronous access handle. `ReadWrite` is exclusive: a
    /// second open fails until the first handle is dropped.
    /// `ReadWriteUnsafe` admits concurrent handles with no coordination.
    fn open_access(&self, mode: AccessMode) -> FsResult<Box<dyn SyncAccess>>;
}

/// Synchronous random-access handle. Confined to executor threads, hence no
/// `Sync`/`Send` requirement; the handle is released by dropping it.
pub trait SyncAccess {
    fn read(&mut self, buf: &mut [u8], at: u64) -> FsResult<usize>;
    fn write(&mut self, data: &[u8], at: u64) -> FsResult<usize>;
    fn truncate(&mut self, size: u64) -> FsResult<()>;
    fn flush(&mut self) -> FsResult<()>;
    fn size(&self) -> FsResult<u64>;
}

/// Walk a logical path down to its directory node.
pub(crate) fn resolve_dir(
    backend: &dyn StorageBackend,
    path: &str,
    create: bool,
) -> FsResult<Arc<dyn DirNode>> {
    let path = paths::normalize(path);
    let mut node = backend.root();
    for seg in paths::segments(&path) {
        node = node.dir(seg, create)?;
    }
    Ok(node)
}

/// Walk a logical path down to its file node.
pub(crate) fn resolve_file(
    backend: &dyn StorageBackend,
    path: &str,
    create: bool,
) -> FsResult<Arc<dyn FileNode>> {
    let parsed = paths::parse_path(path)?;
    let Some(parent) = parsed.parent else {
        return Err(FsError::IllegalPath(paths::normalize(path)));
    };
    let dir = resolve_dir(backend, &parent, create)?;
    dir.file(&parsed.name, create)
}

/// Collapse "does not exist at all" outcomes into `None`; real failures
/// stay errors.
pub(crate) fn found<T>(result: FsResult<T>) -> FsResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(FsError::NotFound(_)) | Err(FsError::IllegalTarget(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Open-handle accounting shared by both reference backends

#[derive(Default)]
struct OpenState {
    exclusive: bool,
    count: usize,
}

fn check_open(state: &mut OpenState, mode: AccessMode) -> FsResult<()> {
    match mode {
        AccessMode::ReadWrite => {
            if state.count > 0 {
                return Err(FsError::Storage("sync access handle already open".into()));
            }
            state.exclusive = true;
        }
        AccessMode::ReadWriteUnsafe => {
            if state.exclusive {
                return Err(FsError::Storage("sync access handle already open".into()));
            }
        }
    }
    state.count += 1;
    Ok(())
}

fn release_open(state: &mut OpenState) {
    state.count = state.count.saturating_sub(1);
    if state.count == 0 {
        state.exclusive = false;
    }
}

// ---------------------------------------------------------------------------
// In-memory backend

/// In-memory storage backend.
pub struct MemStorage {
    root: Arc<MemDir>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            root: Arc::new(MemDir::default()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemStorage {
    fn root(&self) -> Arc<dyn DirNode> {
        self.root.clone()
    }
}

#[derive(Clone)]
enum MemEntry {
    File(Arc<MemFile>),
    Dir(Arc<MemDir>),
}

#[derive(Default)]
struct MemDir {
    entries: Mutex<HashMap<String, MemEntry>>,
}

impl MemDir {
    /// True when any file in the subtree holds an open access handle.
    fn busy(&self) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.values().any(|entry| match entry {
            MemEntry::File(f) => f.open.lock().unwrap().count > 0,
            MemEntry::Dir(d) => d.busy(),
        })
    }
}

impl DirNode for MemDir {
    fn dir(&self, name: &str, create: bool) -> FsResult<Arc<dyn DirNode>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(MemEntry::Dir(d)) => Ok(d.clone()),
            Some(MemEntry::File(_)) => Err(FsError::IllegalTarget(format!(
                "not a directory: {name}"
            ))),
            None if create => {
                let dir = Arc::new(MemDir::default());
                entries.insert(name.to_string(), MemEntry::Dir(dir.clone()));
                Ok(dir)
            }
            None => Err(FsError::NotFound(name.to_string())),
        }
    }

    fn file(&self, name: &str, create: bool) -> FsResult<Arc<dyn FileNode>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(MemEntry::File(f)) => Ok(f.clone()),
            Some(MemEntry::Dir(_)) => {
                Err(FsError::IllegalTarget(format!("is a directory: {name}")))
            }
            None if create => {
                let file = Arc::new(MemFile::default());
                entries.insert(name.to_string(), MemEntry::File(file.clone()));
                Ok(file)
            }
            None => Err(FsError::NotFound(name.to_string())),
        }
    }

    fn entries(&self) -> FsResult<Vec<(String, EntryKind)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .map(|(name, entry)| {
                let kind = match entry {
                    MemEntry::File(_) => EntryKind::File,
                    MemEntry::Dir(_) => EntryKind::Dir,
                };
                (name.clone(), kind)
            })
            .collect())
    }

    fn remove_entry(&self, name: &str, recursive: bool) -> FsResult<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            None => return Err(FsError::NotFound(name.to_string())),
            Some(MemEntry::File(f)) => {
                if f.open.lock().unwrap().count > 0 {
                    return Err(FsError::Storage(format!("file is in use: {name}")));
                }
            }
            Some(MemEntry::Dir(d)) => {
                if !recursive && !d.entries.lock().unwrap().is_empty() {
                    return Err(FsError::Storage(format!("directory not empty: {name}")));
                }
                if d.busy() {
                    return Err(FsError::Storage(format!(
                        "directory contains open files: {name}"
                    )));
                }
            }
        }
        entries.remove(name);
        Ok(())
    }
}

#[derive(Default)]
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    open: Arc<Mutex<OpenState>>,
}

impl FileNode for MemFile {
    fn size(&self) -> FsResult<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn open_access(&self, mode: AccessMode) -> FsResult<Box<dyn SyncAccess>> {
        check_open(&mut self.open.lock().unwrap(), mode)?;
        Ok(Box::new(MemAccess {
            data: self.data.clone(),
            open: self.open.clone(),
        }))
    }
}

struct MemAccess {
    data: Arc<Mutex<Vec<u8>>>,
    open: Arc<Mutex<OpenState>>,
}

impl SyncAccess for MemAccess {
    fn read(&mut self, buf: &mut [u8], at: u64) -> FsResult<usize> {
        let data = self.data.lock().unwrap();
        let start = at as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(start + buf.len(), data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        Ok(n)
    }

    fn write(&mut self, data: &[u8], at: u64) -> FsResult<usize> {
        let mut content = self.data.lock().unwrap();
        let start = at as usize;
        let end = start + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.data.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn size(&self) -> FsResult<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }
}

impl Drop for MemAccess {
    fn drop(&mut self) {
        release_open(&mut self.open.lock().unwrap());
    }
}

// ---------------------------------------------------------------------------
// Host filesystem backend

/// Storage backend rooted at a subtree of the host filesystem.
pub struct HostStorage {
    root: PathBuf,
    registry: Arc<OpenRegistry>,
}

impl HostStorage {
    pub fn new(root: impl Into<PathBuf>) -> FsResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            registry: Arc::new(OpenRegistry::default()),
        })
    }
}

impl StorageBackend for HostStorage {
    fn root(&self) -> Arc<dyn DirNode> {
        Arc::new(HostDir {
            path: self.root.clone(),
            registry: self.registry.clone(),
        })
    }
}

/// Open-handle bookkeeping across all files of one `HostStorage`.
#[derive(Default)]
struct OpenRegistry {
    open: Mutex<HashMap<PathBuf, OpenState>>,
}

impl OpenRegistry {
    fn try_open(&self, path: &Path, mode: AccessMode) -> FsResult<()> {
        let mut open = self.open.lock().unwrap();
        check_open(open.entry(path.to_path_buf()).or_default(), mode)
    }

    fn release(&self, path: &Path) {
        let mut open = self.open.lock().unwrap();
        if let Some(state) = open.get_mut(path) {
            release_open(state);
            if state.count == 0 {
                open.remove(path);
            }
        }
    }

    fn any_open_under(&self, prefix: &Path) -> bool {
        let open = self.open.lock().unwrap();
        open.keys().any(|p| p.starts_with(prefix))
    }
}

struct HostDir {
    path: PathBuf,
    registry: Arc<OpenRegistry>,
}

impl DirNode for HostDir {
    fn dir(&self, name: &str, create: bool) -> FsResult<Arc<dyn DirNode>> {
        let path = self.path.join(name);
        if path.is_dir() {
            // fall through
        } else if path.exists() {
            return Err(FsError::IllegalTarget(format!("not a directory: {name}")));
        } else if create {
            std::fs::create_dir(&path)?;
        } else {
            return Err(FsError::NotFound(name.to_string()));
        }
        Ok(Arc::new(HostDir {
            path,
            registry: self.registry.clone(),
        }))
    }

    fn file(&self, name: &str, create: bool) -> FsResult<Arc<dyn FileNode>> {
        let path = self.path.join(name);
        if path.is_file() {
            // fall through
        } else if path.exists() {
            return Err(FsError::IllegalTarget(format!("is a directory: {name}")));
        } else if create {
            std::fs::OpenOptions::new().create(true).write(true).open(&path)?;
        } else {
            return Err(FsError::NotFound(name.to_string()));
        }
        Ok(Arc::new(HostFile {
            path,
            registry: self.registry.clone(),
        }))
    }

    fn entries(&self) -> FsResult<Vec<(String, EntryKind)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let kind = if entry.file_type()?.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            out.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        Ok(out)
    }

    fn remove_entry(&self, name: &str, recursive: bool) -> FsResult<()> {
        let path = self.path.join(name);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if meta.is_dir() {
            if self.registry.any_open_under(&path) {
                return Err(FsError::Storage(format!(
                    "directory contains open files: {name}"
                )));
            }
            if recursive {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_dir(&path)?;
            }
        } else {
            if self.registry.any_open_under(&path) {
                return Err(FsError::Storage(format!("file is in use: {name}")));
            }
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

struct HostFile {
    path: PathBuf,
    registry: Arc<OpenRegistry>,
}

impl FileNode for HostFile {
    fn size(&self) -> FsResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn open_access(&self, mode: AccessMode) -> FsResult<Box<dyn SyncAccess>> {
        self.registry.try_open(&self.path, mode)?;
        let file = match std::fs::OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                self.registry.release(&self.path);
                return Err(err.into());
            }
        };
        Ok(Box::new(HostAccess {
            file,
            path: self.path.clone(),
            registry: self.registry.clone(),
        }))
    }
}

struct HostAccess {
    file: std::fs::File,
    path: PathBuf,
    registry: Arc<OpenRegistry>,
}

impl SyncAccess for HostAccess {
    fn read(&mut self, buf: &mut [u8], at: u64) -> FsResult<usize> {
        self.file.seek(SeekFrom::Start(at))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write(&mut self, data: &[u8], at: u64) -> FsResult<usize> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn flush(&mut self) -> FsResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> FsResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for HostAccess {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}
