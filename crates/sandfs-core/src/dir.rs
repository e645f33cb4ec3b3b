// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logical directory handles and the file/directory sum type
//!
//! Directory copy semantics are asymmetric on purpose: copying into a path
//! that does not exist yet places the source's contents directly there (a
//! rename-like copy), while copying into an existing directory nests a new
//! child named after the source (a nest-like copy).

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::file::FileHandle;
use crate::paths;
use crate::storage::{self, EntryKind};
use crate::Shared;

pub(crate) struct DirIdent {
    pub(crate) path: String,
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
}

/// Handle to a logical directory, identified by its absolute path.
#[derive(Clone)]
pub struct DirHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) ident: Arc<DirIdent>,
}

impl PartialEq for DirHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ident, &other.ident)
    }
}

impl Eq for DirHandle {}

impl std::fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirHandle").field("path", &self.ident.path).finish()
    }
}

impl DirHandle {
    pub(crate) fn open(shared: &Arc<Shared>, path: &str) -> FsResult<DirHandle> {
        let path = paths::normalize(path);
        let parsed = paths::parse_path(&path)?;

        let mut dirs = shared.dirs.lock().unwrap();
        let ident = dirs
            .entry(path.clone())
            .or_insert_with(|| {
                Arc::new(DirIdent {
                    path,
                    name: parsed.name,
                    parent: parsed.parent,
                })
            })
            .clone();
        Ok(DirHandle {
            shared: shared.clone(),
            ident,
        })
    }

    pub fn path(&self) -> &str {
        &self.ident.path
    }

    pub fn name(&self) -> &str {
        &self.ident.name
    }

    pub fn parent(&self) -> Option<DirHandle> {
        let parent = self.ident.parent.as_deref()?;
        DirHandle::open(&self.shared, parent).ok()
    }

    /// Create the directory and any missing ancestors. Idempotent.
    pub async fn create(&self) -> FsResult<DirHandle> {
        storage::resolve_dir(self.shared.storage.as_ref(), &self.ident.path, true)?;
        Ok(self.clone())
    }

    pub async fn exists(&self) -> FsResult<bool> {
        let node = storage::resolve_dir(self.shared.storage.as_ref(), &self.ident.path, false);
        Ok(storage::found(node)?.is_some())
    }

    /// Immediate children, each typed by kind. A missing directory has no
    /// children. Ordering reflects the storage backend's enumeration.
    pub async fn children(&self) -> FsResult<Vec<FsNode>> {
        let node = storage::resolve_dir(self.shared.storage.as_ref(), &self.ident.path, false);
        let dir = match storage::found(node)? {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for (name, kind) in dir.entries()? {
            let path = paths::join_path(&self.ident.path, &name);
            out.push(match kind {
                EntryKind::File => FsNode::File(FileHandle::open(&self.shared, &path)?),
                EntryKind::Dir => FsNode::Dir(DirHandle::open(&self.shared, &path)?),
            });
        }
        Ok(out)
    }

    /// Recursively remove the directory. Children that refuse to go (open
    /// handles, storage failures) are logged and skipped so one stubborn
    /// entry cannot abort the rest.
    pub async fn remove(&self) -> FsResult<()> {
        match self.children().await {
            Ok(children) => {
                for child in children {
                    let path = child.path().to_string();
                    if let Err(err) = child.remove().await {
                        warn!(path = %path, error = %err, "failed to remove child");
                    }
                }
            }
            Err(err) => {
                warn!(path = %self.ident.path, error = %err, "failed to list children for removal");
            }
        }
        if let Err(err) = self.remove_entry_from_parent() {
            warn!(path = %self.ident.path, error = %err, "failed to remove directory entry");
        }
        Ok(())
    }

    fn remove_entry_from_parent(&self) -> FsResult<()> {
        let Some(parent) = self.ident.parent.as_deref() else {
            // the root cannot remove itself; clearing children is all there is
            return Ok(());
        };
        let dir = storage::resolve_dir(self.shared.storage.as_ref(), parent, false)?;
        dir.remove_entry(&self.ident.name, true)
    }

    /// Copy this directory. If `dest` exists the copy nests into
    /// `dest/<this name>`; if it does not, the contents land at `dest`
    /// itself. Per-child failures abort the copy.
    pub async fn copy_to(&self, dest: &DirHandle) -> FsResult<DirHandle> {
        self.copy_tree(dest.clone()).await
    }

    fn copy_tree(&self, dest: DirHandle) -> BoxFuture<'static, FsResult<DirHandle>> {
        let src = self.clone();
        async move {
            if !src.exists().await? {
                return Err(FsError::SourceNotFound(src.ident.path.clone()));
            }
            let new_dir = if dest.exists().await? {
                DirHandle::open(&src.shared, &paths::join_path(dest.path(), &src.ident.name))?
            } else {
                dest
            };
            new_dir.create().await?;

            let children = src.children().await?;
            try_join_all(children.into_iter().map(|child| child.copy_into(new_dir.clone())))
                .await?;
            Ok(new_dir)
        }
        .boxed()
    }

    /// Copy into `dest`, then recursively remove this directory.
    ///
    /// Hazard: moving a directory into a destination nested under itself is
    /// not guarded against; the copy descends into the directories it is
    /// itself creating and does not terminate. Callers must not pass such
    /// destinations.
    pub async fn move_to(&self, dest: &DirHandle) -> FsResult<DirHandle> {
        let moved = self.copy_to(dest).await?;
        self.remove().await?;
        Ok(moved)
    }
}

/// A directory child: file or directory, matched exhaustively at call sites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsNode {
    File(FileHandle),
    Dir(DirHandle),
}

impl FsNode {
    pub fn kind(&self) -> EntryKind {
        match self {
            FsNode::File(_) => EntryKind::File,
            FsNode::Dir(_) => EntryKind::Dir,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FsNode::File(file) => file.path(),
            FsNode::Dir(dir) => dir.path(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FsNode::File(file) => file.name(),
            FsNode::Dir(dir) => dir.name(),
        }
    }

    pub fn remove(self) -> BoxFuture<'static, FsResult<()>> {
        async move {
            match self {
                FsNode::File(file) => file.remove().await,
                FsNode::Dir(dir) => dir.remove().await,
            }
        }
        .boxed()
    }

    fn copy_into(self, target: DirHandle) -> BoxFuture<'static, FsResult<()>> {
        async move {
            match self {
                FsNode::File(file) => {
                    file.copy_to(target).await?;
                }
                FsNode::Dir(dir) => {
                    dir.copy_tree(target).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }
}

impl From<FileHandle> for FsNode {
    fn from(file: FileHandle) -> Self {
        FsNode::File(file)
    }
}

impl From<&FileHandle> for FsNode {
    fn from(file: &FileHandle) -> Self {
        FsNode::File(file.clone())
    }
}

impl From<DirHandle> for FsNode {
    fn from(dir: DirHandle) -> Self {
        FsNode::Dir(dir)
    }
}

impl From<&DirHandle> for FsNode {
    fn from(dir: &DirHandle) -> Self {
        FsNode::Dir(dir.clone())
    }
}
