// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logical file handles
//!
//! A [`FileHandle`] is a cheap path identity: the runtime context caches one
//! ident record per path, so two lookups of the same path compare equal and
//! share the same access session. The session itself is lazily registered
//! through the broker on the first reader/writer and reference-counted until
//! the last one closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::warn;

use sandfs_proto::{AccessMode, SessionId};

use crate::dir::{DirHandle, FsNode};
use crate::error::{FsError, FsResult};
use crate::paths;
use crate::storage;
use crate::Shared;

/// Per-path identity record, shared by every handle for the same path.
pub(crate) struct FileIdent {
    pub(crate) path: String,
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    session: SessionSlot,
    writing: AtomicBool,
}

/// The access-session slot of one path: refcount plus the established
/// session id, with an async gate making register/close transitions
/// single-flight. At most one session exists per path at any time.
struct SessionSlot {
    gate: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    refcount: usize,
    sid: Option<SessionId>,
}

/// Handle to a logical file, identified by its absolute path.
#[derive(Clone)]
pub struct FileHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) ident: Arc<FileIdent>,
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.ident, &other.ident)
    }
}

impl Eq for FileHandle {}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("path", &self.ident.path).finish()
    }
}

impl FileHandle {
    pub(crate) fn open(shared: &Arc<Shared>, path: &str) -> FsResult<FileHandle> {
        let path = paths::normalize(path);
        let parsed = paths::parse_path(&path)?;
        if parsed.name.is_empty() {
            return Err(FsError::IllegalPath(path));
        }

        let mut files = shared.files.lock().unwrap();
        let ident = files
            .entry(path.clone())
            .or_insert_with(|| {
                Arc::new(FileIdent {
                    path,
                    name: parsed.name,
                    parent: parsed.parent,
                    session: SessionSlot {
                        gate: tokio::sync::Mutex::new(()),
                        state: Mutex::new(SessionState::default()),
                    },
                    writing: AtomicBool::new(false),
                })
            })
            .clone();
        Ok(FileHandle {
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

    /// Random access to the file. Multiple readers (and the writer) may
    /// coexist; they all share one underlying access session.
    pub async fn create_reader(&self) -> FsResult<Reader> {
        let sid = self.acquire(AccessMode::ReadWrite).await?;
        Ok(Reader {
            file: self.clone(),
            sid,
            pos: 0,
            closed: false,
        })
    }

    /// Random write access. At most one writer may be open at a time; the
    /// write cursor starts at the current end of file.
    pub async fn create_writer(&self) -> FsResult<Writer> {
        if self.ident.writing.swap(true, Ordering::SeqCst) {
            return Err(FsError::WriterConflict);
        }
        match self.writer_with_mode(AccessMode::ReadWrite, true).await {
            Ok(writer) => Ok(writer),
            Err(err) => {
                self.ident.writing.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Writer that bypasses the one-writer rule. Several unsafe writers may
    /// run concurrently; the outcome is last-write-wins, nothing serializes
    /// them against each other.
    pub async fn create_writer_unsafe(&self) -> FsResult<Writer> {
        self.writer_with_mode(AccessMode::ReadWriteUnsafe, false).await
    }

    async fn writer_with_mode(&self, mode: AccessMode, exclusive: bool) -> FsResult<Writer> {
        let sid = self.acquire(mode).await?;
        let pos = match self.shared.broker.get_size(sid).await {
            Ok(pos) => pos,
            Err(err) => {
                let _ = self.release_session().await;
                return Err(err);
            }
        };
        Ok(Writer {
            file: self.clone(),
            sid,
            pos,
            closed: false,
            exclusive,
        })
    }

    /// Whole-file contents decoded as text.
    pub async fn text(&self) -> FsResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Whole-file contents. A missing file reads as empty.
    pub async fn bytes(&self) -> FsResult<Vec<u8>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let mut reader = self.create_reader().await?;
        let size = match reader.get_size().await {
            Ok(size) => size,
            Err(err) => {
                let _ = reader.close().await;
                return Err(err);
            }
        };
        let data = match reader.read_at(size, 0).await {
            Ok(data) => data,
            Err(err) => {
                let _ = reader.close().await;
                return Err(err);
            }
        };
        reader.close().await?;
        Ok(data)
    }

    /// Stream the file contents chunk by chunk. The transient reader behind
    /// the stream is closed when the stream reaches end of file.
    pub async fn stream(&self) -> FsResult<impl Stream<Item = FsResult<Vec<u8>>> + Send + 'static> {
        struct StreamState {
            reader: Option<Reader>,
            chunk: u64,
        }

        let reader = if self.exists().await? {
            Some(self.create_reader().await?)
        } else {
            None
        };
        let state = StreamState {
            reader,
            chunk: self.shared.config.copy_chunk_size as u64,
        };

        Ok(futures::stream::unfold(state, |mut st| async move {
            let read = match st.reader.as_mut() {
                Some(reader) => reader.read(st.chunk).await,
                None => return None,
            };
            match read {
                Ok(buf) if buf.is_empty() => {
                    let mut reader = st.reader.take()?;
                    match reader.close().await {
                        Ok(()) => None,
                        Err(err) => Some((Err(err), st)),
                    }
                }
                Ok(buf) => Some((Ok(buf), st)),
                Err(err) => {
                    if let Some(mut reader) = st.reader.take() {
                        let _ = reader.close().await;
                    }
                    Some((Err(err), st))
                }
            }
        }))
    }

    /// File size via a transient reader. A missing file reports 0 without
    /// being created.
    pub async fn get_size(&self) -> FsResult<u64> {
        if !self.exists().await? {
            return Ok(0);
        }
        let mut reader = self.create_reader().await?;
        let size = reader.get_size().await;
        let closed = reader.close().await;
        let size = size?;
        closed?;
        Ok(size)
    }

    /// True iff a file currently exists at the path. Creates nothing.
    pub async fn exists(&self) -> FsResult<bool> {
        let node = storage::resolve_file(self.shared.storage.as_ref(), &self.ident.path, false);
        Ok(storage::found(node)?.is_some())
    }

    /// Remove the file. Refused while any reader/writer holds the session.
    pub async fn remove(&self) -> FsResult<()> {
        if self.ref_count() > 0 {
            return Err(FsError::HandleBusy);
        }
        let Some(parent) = self.ident.parent.as_deref() else {
            return Err(FsError::IllegalPath(self.ident.path.clone()));
        };
        let dir = storage::resolve_dir(self.shared.storage.as_ref(), parent, false)?;
        dir.remove_entry(&self.ident.name, true)
    }

    /// Write `content` to this file, truncating first.
    pub async fn write(&self, content: impl Into<WriteContent>) -> FsResult<()> {
        write_content(self, content.into(), WriteOptions::default()).await
    }

    /// Write with explicit options; `overwrite: false` appends.
    pub async fn write_with(
        &self,
        content: impl Into<WriteContent>,
        opts: WriteOptions,
    ) -> FsResult<()> {
        write_content(self, content.into(), opts).await
    }

    /// Copy into a file (overwriting it) or into a directory (as a child
    /// named after this file). Copying a file onto itself is a no-op.
    pub async fn copy_to(&self, target: impl Into<FsNode>) -> FsResult<FileHandle> {
        if !self.exists().await? {
            return Err(FsError::SourceNotFound(self.ident.path.clone()));
        }

        let dst = match target.into() {
            FsNode::File(file) => file,
            FsNode::Dir(dir) => {
                let path = paths::join_path(dir.path(), &self.ident.name);
                FileHandle::open(&self.shared, &path)?
            }
        };
        if dst == *self {
            return Ok(dst);
        }

        // stream chunk by chunk, never the whole file at once
        let mut reader = self.create_reader().await?;
        let mut writer = match dst.create_writer().await {
            Ok(writer) => writer,
            Err(err) => {
                let _ = reader.close().await;
                return Err(err);
            }
        };
        let chunk = self.shared.config.copy_chunk_size as u64;
        let copied = copy_chunks(&mut reader, &mut writer, chunk).await;
        let write_closed = writer.close().await;
        let read_closed = reader.close().await;
        copied?;
        write_closed?;
        read_closed?;
        Ok(dst)
    }

    /// Copy to the target, then remove this file.
    pub async fn move_to(&self, target: impl Into<FsNode>) -> FsResult<FileHandle> {
        let moved = self.copy_to(target).await?;
        self.remove().await?;
        Ok(moved)
    }

    async fn acquire(&self, mode: AccessMode) -> FsResult<SessionId> {
        let _gate = self.ident.session.gate.lock().await;
        {
            let mut state = self.ident.session.state.lock().unwrap();
            if let Some(sid) = state.sid {
                state.refcount += 1;
                return Ok(sid);
            }
        }
        let sid = self.shared.broker.register(&self.ident.path, mode).await?;
        let mut state = self.ident.session.state.lock().unwrap();
        state.sid = Some(sid);
        state.refcount = 1;
        Ok(sid)
    }

    async fn release_session(&self) -> FsResult<()> {
        let _gate = self.ident.session.gate.lock().await;
        let closing = {
            let mut state = self.ident.session.state.lock().unwrap();
            state.refcount = state.refcount.saturating_sub(1);
            if state.refcount == 0 {
                state.sid.take()
            } else {
                None
            }
        };
        match closing {
            Some(sid) => self.shared.broker.close(sid).await,
            None => Ok(()),
        }
    }

    /// Drop-time variant of [`Self::release_session`]: cannot suspend, so
    /// the final broker close is fire-and-forget.
    fn release_detached(&self) {
        let closing = {
            let mut state = self.ident.session.state.lock().unwrap();
            state.refcount = state.refcount.saturating_sub(1);
            if state.refcount == 0 {
                state.sid.take()
            } else {
                None
            }
        };
        if let Some(sid) = closing {
            self.shared.broker.close_detached(sid);
        }
    }

    fn ref_count(&self) -> usize {
        self.ident.session.state.lock().unwrap().refcount
    }
}

async fn copy_chunks(reader: &mut Reader, writer: &mut Writer, chunk: u64) -> FsResult<()> {
    writer.truncate(0).await?;
    loop {
        let buf = reader.read(chunk).await?;
        if buf.is_empty() {
            return Ok(());
        }
        writer.write(buf).await?;
    }
}

/// Scoped write access to one file. Must be closed when done; dropping an
/// unclosed writer releases the session as a best-effort safety net.
pub struct Writer {
    file: FileHandle,
    sid: SessionId,
    pos: u64,
    closed: bool,
    exclusive: bool,
}

impl Writer {
    /// Write at the cursor (append semantics by default).
    pub async fn write(&mut self, chunk: impl Into<Vec<u8>>) -> FsResult<u64> {
        self.write_inner(chunk.into(), None).await
    }

    /// Write at an explicit offset; the cursor moves to its end.
    pub async fn write_at(&mut self, chunk: impl Into<Vec<u8>>, at: u64) -> FsResult<u64> {
        self.write_inner(chunk.into(), Some(at)).await
    }

    async fn write_inner(&mut self, data: Vec<u8>, at: Option<u64>) -> FsResult<u64> {
        if self.closed {
            return Err(FsError::ClosedHandle("writer"));
        }
        let at = at.unwrap_or(self.pos);
        self.pos = at + data.len() as u64;
        self.file.shared.broker.write(self.sid, data, Some(at)).await
    }

    pub async fn truncate(&mut self, size: u64) -> FsResult<()> {
        if self.closed {
            return Err(FsError::ClosedHandle("writer"));
        }
        self.file.shared.broker.truncate(self.sid, size).await?;
        if self.pos > size {
            self.pos = size;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> FsResult<()> {
        if self.closed {
            return Err(FsError::ClosedHandle("writer"));
        }
        self.file.shared.broker.flush(self.sid).await
    }

    /// Close the writer, releasing the writer slot and the session
    /// reference. Closing twice is a no-op.
    pub async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.exclusive {
            self.file.ident.writing.store(false, Ordering::SeqCst);
        }
        self.file.release_session().await
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("path", &self.file.ident.path)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(path = %self.file.ident.path, "writer dropped without close");
        self.closed = true;
        if self.exclusive {
            self.file.ident.writing.store(false, Ordering::SeqCst);
        }
        self.file.release_detached();
    }
}

/// Scoped read access to one file with its own cursor.
pub struct Reader {
    file: FileHandle,
    sid: SessionId,
    pos: u64,
    closed: bool,
}

impl Reader {
    /// Read up to `size` bytes at the cursor. Returns exactly the bytes that
    /// exist; a read at end of file yields an empty buffer.
    pub async fn read(&mut self, size: u64) -> FsResult<Vec<u8>> {
        self.read_inner(size, None).await
    }

    /// Read at an explicit offset; the cursor moves past the bytes read.
    pub async fn read_at(&mut self, size: u64, at: u64) -> FsResult<Vec<u8>> {
        self.read_inner(size, Some(at)).await
    }

    async fn read_inner(&mut self, size: u64, at: Option<u64>) -> FsResult<Vec<u8>> {
        if self.closed {
            return Err(FsError::ClosedHandle("reader"));
        }
        let offset = at.unwrap_or(self.pos);
        let buf = self.file.shared.broker.read(self.sid, offset, size).await?;
        self.pos = offset + buf.len() as u64;
        Ok(buf)
    }

    pub async fn get_size(&mut self) -> FsResult<u64> {
        if self.closed {
            return Err(FsError::ClosedHandle("reader"));
        }
        self.file.shared.broker.get_size(self.sid).await
    }

    /// Close the reader. Closing twice is a no-op.
    pub async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file.release_session().await
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("path", &self.file.ident.path)
            .field("pos", &self.pos)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(path = %self.file.ident.path, "reader dropped without close");
        self.closed = true;
        self.file.release_detached();
    }
}

/// Content accepted by [`crate::SandFs::write`].
pub enum WriteContent {
    Text(String),
    Bytes(Vec<u8>),
    Stream(BoxStream<'static, FsResult<Vec<u8>>>),
    File(FileHandle),
}

impl From<&str> for WriteContent {
    fn from(text: &str) -> Self {
        WriteContent::Text(text.to_string())
    }
}

impl From<String> for WriteContent {
    fn from(text: String) -> Self {
        WriteContent::Text(text)
    }
}

impl From<Vec<u8>> for WriteContent {
    fn from(bytes: Vec<u8>) -> Self {
        WriteContent::Bytes(bytes)
    }
}

impl From<&[u8]> for WriteContent {
    fn from(bytes: &[u8]) -> Self {
        WriteContent::Bytes(bytes.to_vec())
    }
}

impl From<FileHandle> for WriteContent {
    fn from(file: FileHandle) -> Self {
        WriteContent::File(file)
    }
}

impl From<&FileHandle> for WriteContent {
    fn from(file: &FileHandle) -> Self {
        WriteContent::File(file.clone())
    }
}

impl From<BoxStream<'static, FsResult<Vec<u8>>>> for WriteContent {
    fn from(stream: BoxStream<'static, FsResult<Vec<u8>>>) -> Self {
        WriteContent::Stream(stream)
    }
}

/// Options for [`crate::SandFs::write_with`].
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    /// Truncate before writing (the default). When false, content is
    /// appended at the current end of file.
    pub overwrite: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

pub(crate) async fn write_content(
    target: &FileHandle,
    content: WriteContent,
    opts: WriteOptions,
) -> FsResult<()> {
    enum Payload {
        Bytes(Vec<u8>),
        Stream(BoxStream<'static, FsResult<Vec<u8>>>),
    }

    let payload = match content {
        WriteContent::Text(text) => Payload::Bytes(text.into_bytes()),
        WriteContent::Bytes(bytes) => Payload::Bytes(bytes),
        WriteContent::Stream(stream) => Payload::Stream(stream),
        WriteContent::File(file) => Payload::Stream(file.stream().await?.boxed()),
    };

    let mut writer = target.create_writer().await?;
    let written = async {
        if opts.overwrite {
            writer.truncate(0).await?;
        }
        match payload {
            Payload::Bytes(bytes) => {
                writer.write(bytes).await?;
            }
            Payload::Stream(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    writer.write(chunk?).await?;
                }
            }
        }
        Ok::<(), FsError>(())
    }
    .await;
    let closed = writer.close().await;
    written?;
    closed?;
    Ok(())
}
