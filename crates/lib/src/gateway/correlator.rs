//! Request correlator: request id -> one-shot completion.
//!
//! Every pending entry is removed exactly once, by whichever comes first: the matching
//! response, the caller's deadline, the caller giving up on the call, or connection
//! teardown. The removal is the only place a completion is consumed, so no waiter can be
//! resolved twice.
//!
//! The table lock is never held across an await, which lets `Waiter` clean up in `Drop`.

use crate::gateway::error::GatewayError;
use crate::gateway::protocol::{RequestKind, Response};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Request ids remembered after their caller stopped waiting, so a late response is dropped
/// instead of being mistaken for a notification.
const EXPIRED_CAPACITY: usize = 256;

enum Completion {
    /// A caller awaits the response.
    Waiter(oneshot::Sender<Response>),
    /// Fire-and-forget: the response is only checked for failure.
    Detached,
}

struct Pending {
    kind: RequestKind,
    /// Distinguishes this registration from a later one reusing the same id.
    ticket: u64,
    completion: Completion,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, Pending>,
    expired: VecDeque<String>,
}

impl Table {
    fn expire(&mut self, request_id: &str) {
        if self.expired.len() == EXPIRED_CAPACITY {
            self.expired.pop_front();
        }
        self.expired.push_back(request_id.to_string());
    }

    fn take_expired(&mut self, request_id: &str) -> bool {
        match self.expired.iter().position(|id| id == request_id) {
            Some(pos) => {
                self.expired.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Outcome of matching an inbound response against the pending table.
#[derive(Debug)]
pub enum Resolution {
    /// A pending entry took it.
    Resolved,
    /// Answer to a request whose caller already stopped waiting.
    Expired,
    /// Nothing was ever pending under that id; the response is handed back.
    Unmatched(Response),
}

/// Pending requests keyed by request id. Shared by submitting callers and the reader loop.
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
    next_ticket: AtomicU64,
}

/// Generate a fresh request id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A pending entry owned by an awaiting caller. Dropping it before the response arrives
/// removes the entry, so an abandoned call never keeps its request id in flight.
pub struct Waiter<'a> {
    correlator: &'a Correlator,
    request_id: String,
    ticket: u64,
    rx: oneshot::Receiver<Response>,
    armed: bool,
}

impl Waiter<'_> {
    /// Await the response; see `Correlator::wait`.
    pub async fn wait(mut self, deadline: Option<Duration>) -> Result<Response, GatewayError> {
        let res = self
            .correlator
            .await_response(&self.request_id, &mut self.rx, deadline)
            .await;
        self.armed = false;
        res
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed && self.correlator.abandon(&self.request_id, self.ticket) {
            log::debug!("request {} abandoned before its response", self.request_id);
        }
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `request_id`. Rejects an id that is already in flight.
    pub fn register(
        &self,
        request_id: &str,
        kind: RequestKind,
    ) -> Result<oneshot::Receiver<Response>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.insert(request_id, kind, Completion::Waiter(tx))?;
        Ok(rx)
    }

    /// Like `register`, with the entry tied to the returned guard.
    pub fn register_waiter(&self, request_id: &str, kind: RequestKind) -> Result<Waiter<'_>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.insert(request_id, kind, Completion::Waiter(tx))?;
        Ok(Waiter {
            correlator: self,
            request_id: request_id.to_string(),
            ticket,
            rx,
            armed: true,
        })
    }

    /// Register a fire-and-forget request so its response is consumed here.
    pub fn register_detached(&self, request_id: &str, kind: RequestKind) -> Result<(), GatewayError> {
        self.insert(request_id, kind, Completion::Detached).map(|_| ())
    }

    fn insert(&self, request_id: &str, kind: RequestKind, completion: Completion) -> Result<u64, GatewayError> {
        let mut table = self.table();
        if table.pending.contains_key(request_id) {
            return Err(GatewayError::DuplicateRequestId(request_id.to_string()));
        }
        table.take_expired(request_id);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        table.pending.insert(
            request_id.to_string(),
            Pending {
                kind,
                ticket,
                completion,
            },
        );
        log::debug!(
            "registered pending {} request {} ({} in flight)",
            kind,
            request_id,
            table.pending.len()
        );
        Ok(ticket)
    }

    /// Resolve the entry matching `response.request_id`.
    pub fn complete(&self, response: Response) -> Resolution {
        let entry = {
            let mut table = self.table();
            match table.pending.remove(&response.request_id) {
                Some(entry) => entry,
                None if table.take_expired(&response.request_id) => return Resolution::Expired,
                None => return Resolution::Unmatched(response),
            }
        };
        match entry.completion {
            Completion::Waiter(tx) => {
                if tx.send(response).is_err() {
                    log::debug!("{} request waiter went away before its response", entry.kind);
                }
            }
            Completion::Detached => {
                if !response.is_success() {
                    log::warn!(
                        "{} request {} failed with status {}: {}",
                        entry.kind,
                        response.request_id,
                        response.status,
                        response.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
                    );
                }
            }
        }
        Resolution::Resolved
    }

    /// Await the response registered under `request_id`. When `deadline` elapses first the
    /// entry is removed and `GatewayError::Timeout` returned.
    pub async fn wait(
        &self,
        request_id: &str,
        mut rx: oneshot::Receiver<Response>,
        deadline: Option<Duration>,
    ) -> Result<Response, GatewayError> {
        self.await_response(request_id, &mut rx, deadline).await
    }

    async fn await_response(
        &self,
        request_id: &str,
        rx: &mut oneshot::Receiver<Response>,
        deadline: Option<Duration>,
    ) -> Result<Response, GatewayError> {
        let res = match deadline {
            None => rx.await,
            Some(d) => match tokio::time::timeout(d, &mut *rx).await {
                Ok(res) => res,
                Err(_) => {
                    if self.cancel(request_id) {
                        log::warn!("request {} timed out after {:?}", request_id, d);
                        return Err(GatewayError::Timeout);
                    }
                    // completed while the deadline fired
                    rx.await
                }
            },
        };
        res.map_err(|_| GatewayError::Closed("gateway stopped before the response arrived".to_string()))
    }

    /// Drop the entry for `request_id` (deadline expiry, failed send). Returns true if it was
    /// still pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut table = self.table();
        let removed = table.pending.remove(request_id).is_some();
        if removed {
            table.expire(request_id);
        }
        removed
    }

    fn abandon(&self, request_id: &str, ticket: u64) -> bool {
        let mut table = self.table();
        match table.pending.get(request_id) {
            Some(p) if p.ticket == ticket => {
                table.pending.remove(request_id);
                table.expire(request_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every pending entry; waiters observe a closed channel. Returns how many were dropped.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table();
            table.expired.clear();
            table.pending.drain().collect()
        };
        if !drained.is_empty() {
            log::warn!("dropping {} pending request(s) on teardown", drained.len());
        }
        drained.len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.table().pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.table().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
