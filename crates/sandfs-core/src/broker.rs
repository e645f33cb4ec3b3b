// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Access broker: proxies synchronous storage access into executor threads
//!
//! The storage primitive's `SyncAccess` handles are blocking and must never
//! be driven from async context, so the broker owns a small fixed-size pool
//! of executor threads and turns every operation into an async round-trip:
//! the dispatcher assigns a correlation id, enqueues the request to the
//! executor owning the session, and suspends the caller on a oneshot until a
//! router task matches the response id back to it.
//!
//! Registrations are spread round-robin over the pool, which bounds the
//! number of executor threads no matter how many files are opened. Byte
//! payloads move through the channels by value; they are never copied on the
//! way across.
//!
//! There is no shared mutable state between the dispatcher and its workers
//! beyond the correlation map; each worker privately owns the sessions it
//! registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use sandfs_proto::{
    AccessMode, BrokerOp, BrokerReply, BrokerRequest, BrokerResponse, SessionId, WireError,
};

use crate::error::{FsError, FsResult};
use crate::storage::{self, StorageBackend, SyncAccess};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<FsResult<BrokerReply>>>>>;

pub struct AccessBroker {
    storage: Arc<dyn StorageBackend>,
    pool_size: usize,
    /// Lazily spawned executor slots; an executor is only created once a
    /// registration is routed to its slot.
    executors: Mutex<Vec<Option<Executor>>>,
    pending: Pending,
    routes: Mutex<HashMap<SessionId, usize>>,
    next_id: AtomicU64,
    next_sid: AtomicU64,
    next_slot: AtomicU64,
}

struct Executor {
    tx: mpsc::UnboundedSender<BrokerRequest>,
}

impl AccessBroker {
    pub fn new(storage: Arc<dyn StorageBackend>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            storage,
            pool_size,
            executors: Mutex::new((0..pool_size).map(|_| None).collect()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            routes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            next_sid: AtomicU64::new(0),
            next_slot: AtomicU64::new(0),
        }
    }

    /// Open an access session for `path`, creating the file if missing.
    pub async fn register(&self, path: &str, mode: AccessMode) -> FsResult<SessionId> {
        let sid = SessionId(self.next_sid.fetch_add(1, Ordering::Relaxed) + 1);
        let slot = (self.next_slot.fetch_add(1, Ordering::Relaxed) as usize) % self.pool_size;
        self.routes.lock().unwrap().insert(sid, slot);

        let op = BrokerOp::Register {
            sid,
            path: path.to_string(),
            mode,
        };
        match self.call(slot, op).await {
            Ok(_) => Ok(sid),
            Err(err) => {
                self.routes.lock().unwrap().remove(&sid);
                Err(err)
            }
        }
    }

    pub async fn read(&self, sid: SessionId, offset: u64, size: u64) -> FsResult<Vec<u8>> {
        match self.call(self.slot_of(sid)?, BrokerOp::Read { sid, offset, size }).await? {
            BrokerReply::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected_reply("read", other)),
        }
    }

    /// Write `data` at the given offset, or at the current end of file when
    /// `at` is `None`. Returns the number of bytes written.
    pub async fn write(&self, sid: SessionId, data: Vec<u8>, at: Option<u64>) -> FsResult<u64> {
        match self.call(self.slot_of(sid)?, BrokerOp::Write { sid, data, at }).await? {
            BrokerReply::Written(n) => Ok(n),
            other => Err(unexpected_reply("write", other)),
        }
    }

    pub async fn truncate(&self, sid: SessionId, size: u64) -> FsResult<()> {
        self.call(self.slot_of(sid)?, BrokerOp::Truncate { sid, size }).await?;
        Ok(())
    }

    pub async fn flush(&self, sid: SessionId) -> FsResult<()> {
        self.call(self.slot_of(sid)?, BrokerOp::Flush { sid }).await?;
        Ok(())
    }

    pub async fn get_size(&self, sid: SessionId) -> FsResult<u64> {
        match self.call(self.slot_of(sid)?, BrokerOp::GetSize { sid }).await? {
            BrokerReply::Size(size) => Ok(size),
            other => Err(unexpected_reply("getSize", other)),
        }
    }

    pub async fn close(&self, sid: SessionId) -> FsResult<()> {
        let slot = self.slot_of(sid)?;
        let result = self.call(slot, BrokerOp::Close { sid }).await.map(|_| ());
        self.routes.lock().unwrap().remove(&sid);
        result
    }

    /// Enqueue a close without awaiting its completion. Used by drop-time
    /// safety nets, which cannot suspend.
    pub(crate) fn close_detached(&self, sid: SessionId) {
        let slot = {
            let mut routes = self.routes.lock().unwrap();
            match routes.remove(&sid) {
                Some(slot) => slot,
                None => return,
            }
        };
        let executors = self.executors.lock().unwrap();
        let Some(Some(exec)) = executors.get(slot) else {
            return;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = BrokerRequest {
            id,
            op: BrokerOp::Close { sid },
        };
        if exec.tx.send(request).is_err() {
            debug!(%sid, "executor already gone during detached close");
        }
    }

    async fn call(&self, slot: usize, op: BrokerOp) -> FsResult<BrokerReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id, op = op.label(), slot, "dispatching broker request");

        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, done_tx);

        let sender = match self.sender(slot) {
            Ok(sender) => sender,
            Err(err) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(err);
            }
        };
        if sender.send(BrokerRequest { id, op }).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(FsError::Storage("executor terminated".into()));
        }

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(FsError::Storage("executor dropped response".into())),
        }
    }

    fn sender(&self, slot: usize) -> FsResult<mpsc::UnboundedSender<BrokerRequest>> {
        let mut executors = self.executors.lock().unwrap();
        if let Some(exec) = &executors[slot] {
            return Ok(exec.tx.clone());
        }

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let storage = self.storage.clone();
        std::thread::Builder::new()
            .name(format!("sandfs-exec-{slot}"))
            .spawn(move || executor_main(storage, req_rx, resp_tx))
            .map_err(|err| FsError::Storage(format!("failed to spawn executor: {err}")))?;
        tokio::spawn(route_responses(resp_rx, self.pending.clone()));

        let tx = req_tx.clone();
        executors[slot] = Some(Executor { tx: req_tx });
        Ok(tx)
    }

    fn slot_of(&self, sid: SessionId) -> FsResult<usize> {
        self.routes.lock().unwrap().get(&sid).copied().ok_or(FsError::BadSession)
    }

    #[cfg(test)]
    fn executor_count(&self) -> usize {
        self.executors.lock().unwrap().iter().filter(|e| e.is_some()).count()
    }
}

fn unexpected_reply(op: &str, reply: BrokerReply) -> FsError {
    FsError::Storage(format!("unexpected {op} reply: {reply:?}"))
}

/// Executor thread body: privately owns the access handles registered to it
/// and services requests strictly in arrival order.
fn executor_main(
    storage: Arc<dyn StorageBackend>,
    mut requests: mpsc::UnboundedReceiver<BrokerRequest>,
    responses: mpsc::UnboundedSender<BrokerResponse>,
) {
    let mut sessions: HashMap<SessionId, Box<dyn SyncAccess>> = HashMap::new();
    while let Some(req) = requests.blocking_recv() {
        let id = req.id;
        let context = req.describe();
        let response = match service(storage.as_ref(), &mut sessions, req.op) {
            Ok(ret) => BrokerResponse::Callback { id, ret },
            Err(err) => BrokerResponse::ThrowError {
                id,
                err: WireError::new(err.name(), err.to_string(), context),
            },
        };
        if responses.send(response).is_err() {
            // dispatcher gone, shutting down
            break;
        }
    }
    // remaining sessions release their underlying handles on drop
}

fn service(
    storage: &dyn StorageBackend,
    sessions: &mut HashMap<SessionId, Box<dyn SyncAccess>>,
    op: BrokerOp,
) -> FsResult<BrokerReply> {
    match op {
        BrokerOp::Register { sid, path, mode } => {
            let file = storage::resolve_file(storage, &path, true)?;
            let access = file.open_access(mode)?;
            sessions.insert(sid, access);
            Ok(BrokerReply::Done)
        }
        BrokerOp::Read { sid, offset, size } => {
            let access = sessions.get_mut(&sid).ok_or(FsError::BadSession)?;
            let mut buf = vec![0u8; size as usize];
            let n = access.read(&mut buf, offset)?;
            // shrink in place to the bytes that actually exist, never pad
            buf.truncate(n);
            Ok(BrokerReply::Bytes(buf))
        }
        BrokerOp::Write { sid, data, at } => {
            let access = sessions.get_mut(&sid).ok_or(FsError::BadSession)?;
            let at = match at {
                Some(at) => at,
                None => access.size()?,
            };
            let n = access.write(&data, at)?;
            Ok(BrokerReply::Written(n as u64))
        }
        BrokerOp::Truncate { sid, size } => {
            let access = sessions.get_mut(&sid).ok_or(FsError::BadSession)?;
            access.truncate(size)?;
            Ok(BrokerReply::Done)
        }
        BrokerOp::Flush { sid } => {
            let access = sessions.get_mut(&sid).ok_or(FsError::BadSession)?;
            access.flush()?;
            Ok(BrokerReply::Done)
        }
        BrokerOp::GetSize { sid } => {
            let access = sessions.get_mut(&sid).ok_or(FsError::BadSession)?;
            Ok(BrokerReply::Size(access.size()?))
        }
        BrokerOp::Close { sid } => {
            // closing an unknown session is a no-op so detached closes and
            // repeated closes cannot fail
            sessions.remove(&sid);
            Ok(BrokerReply::Done)
        }
    }
}

async fn route_responses(
    mut responses: mpsc::UnboundedReceiver<BrokerResponse>,
    pending: Pending,
) {
    while let Some(resp) = responses.recv().await {
        let (id, result) = match resp {
            BrokerResponse::Callback { id, ret } => (id, Ok(ret)),
            BrokerResponse::ThrowError { id, err } => (id, Err(FsError::Broker(err))),
        };
        match pending.lock().unwrap().remove(&id) {
            Some(done) => {
                let _ = done.send(result);
            }
            None => debug!(id, "response without a pending caller"),
        }
    }
}
