//! Request/reply correlation for one worker.
//!
//! Outstanding requests live in an insertion-ordered table. A reply that
//! echoes a known id resolves that request; anything else (untagged reply,
//! malformed line) resolves the oldest written request. This keeps id-aware
//! workers order-independent while id-unaware workers keep the strict FIFO
//! contract described in [`crate::bridge::protocol`].

use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::codec::MalformedLine;
use crate::bridge::protocol::{self, RequestId};

/// How a dispatched request was settled by the worker side.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A parsed reply line.
    Value(serde_json::Value),
    /// The correlated reply line was not valid JSON.
    Malformed,
    /// The worker exited while the request was outstanding.
    WorkerExited,
    /// The bridge is degraded or could not write the request.
    Unavailable,
    /// The bridge is shutting down.
    Stopped,
}

/// An outstanding call.
///
/// A written request whose caller timed out stays in the table as an
/// expired slot: the worker still owes it a reply, and an untagged late
/// reply must land here rather than on the next caller.
#[derive(Debug)]
pub struct PendingRequest {
    payload: serde_json::Value,
    enqueued_at: Instant,
    written: bool,
    expired_at: Option<Instant>,
    reply: Option<oneshot::Sender<Reply>>,
}

impl PendingRequest {
    pub fn new(payload: serde_json::Value, reply: oneshot::Sender<Reply>) -> Self {
        Self {
            payload,
            enqueued_at: Instant::now(),
            written: false,
            expired_at: None,
            reply: Some(reply),
        }
    }

    fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    /// Resolve the caller. A caller that stopped waiting is ignored; the slot
    /// is consumed either way.
    fn resolve(self, id: RequestId, reply: Reply) {
        let Some(tx) = self.reply else {
            return;
        };
        tracing::trace!(
            request_id = %id,
            waited_ms = self.enqueued_at.elapsed().as_millis() as u64,
            "Resolving request"
        );
        if tx.send(reply).is_err() {
            tracing::debug!(request_id = %id, "Caller no longer waiting for reply");
        }
    }
}

/// What happened to an incoming reply line.
#[derive(Debug, PartialEq, Eq)]
pub enum Correlation {
    /// Matched by the echoed id.
    Tagged(RequestId),
    /// Matched to the oldest outstanding request.
    Head(RequestId),
    /// Late reply to a request whose caller already timed out.
    Stale(RequestId),
    /// Nothing was outstanding.
    Unsolicited,
}

/// Result of giving up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never written; removed outright.
    Removed,
    /// Written; the slot stays until its late reply arrives.
    AwaitingReply,
    /// Already resolved or expired.
    Settled,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    pending: IndexMap<RequestId, PendingRequest>,
    /// Written requests expired since a live reply last arrived.
    missed: u32,
    /// The current worker has echoed at least one id.
    echoes_ids: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Ids are unique per bridge.
    pub fn enqueue(&mut self, id: RequestId, request: PendingRequest) {
        self.pending.insert(id, request);
    }

    /// Payloads not yet written to a worker, in enqueue order. Marks them
    /// written and releases the table's copy of the payload.
    pub fn take_unwritten(&mut self) -> Vec<(RequestId, serde_json::Value)> {
        self.pending
            .iter_mut()
            .filter(|(_, p)| !p.written)
            .map(|(id, p)| {
                p.written = true;
                (*id, std::mem::take(&mut p.payload))
            })
            .collect()
    }

    /// Settle one reply line.
    pub fn on_line(&mut self, line: Result<serde_json::Value, MalformedLine>) -> Correlation {
        match line {
            Ok(value) => match protocol::reply_id(&value) {
                Some(id) => {
                    self.echoes_ids = true;
                    match self.pending.shift_remove(&id) {
                        Some(request) if request.is_expired() => Correlation::Stale(id),
                        Some(request) => {
                            self.missed = 0;
                            request.resolve(id, Reply::Value(value));
                            Correlation::Tagged(id)
                        }
                        None if self.pending.is_empty() => Correlation::Unsolicited,
                        None => Correlation::Stale(id),
                    }
                }
                None => self.resolve_head(Reply::Value(value)),
            },
            Err(_) => self.resolve_head(Reply::Malformed),
        }
    }

    fn resolve_head(&mut self, reply: Reply) -> Correlation {
        let head = self
            .pending
            .iter()
            .position(|(_, p)| p.written)
            .and_then(|idx| self.pending.shift_remove_index(idx));
        match head {
            Some((id, request)) if request.is_expired() => Correlation::Stale(id),
            Some((id, request)) => {
                self.missed = 0;
                request.resolve(id, reply);
                Correlation::Head(id)
            }
            None => Correlation::Unsolicited,
        }
    }

    /// Give up on a request whose caller timed out.
    pub fn expire(&mut self, id: RequestId) -> Expiry {
        match self.pending.get_mut(&id) {
            Some(request) if request.is_expired() => Expiry::Settled,
            Some(request) if request.written => {
                request.expired_at = Some(Instant::now());
                request.reply = None;
                self.missed = self.missed.saturating_add(1);
                Expiry::AwaitingReply
            }
            Some(_) => {
                self.pending.shift_remove(&id);
                Expiry::Removed
            }
            None => Expiry::Settled,
        }
    }

    /// Whether positional correlation can no longer be trusted: two written
    /// requests in a row went unanswered, so later replies may belong to
    /// earlier requests. Workers that echo ids are never out of step.
    pub fn out_of_step(&self) -> bool {
        !self.echoes_ids && self.missed >= 2
    }

    /// When the oldest late reply should have arrived by. Past this point the
    /// worker is assumed to have dropped it.
    pub fn late_reply_deadline(&self, grace: std::time::Duration) -> Option<Instant> {
        if self.echoes_ids {
            return None;
        }
        self.pending
            .values()
            .filter_map(|p| p.expired_at)
            .min()
            .map(|expired_at| expired_at + grace)
    }

    /// Resolve every written request (worker gone). Unwritten requests stay
    /// queued for the replacement worker. Returns the number of callers
    /// that were still waiting.
    pub fn fail_written(&mut self, reply: Reply) -> usize {
        let (written, unwritten): (IndexMap<_, _>, IndexMap<_, _>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|(_, p)| p.written);
        self.pending = unwritten;
        self.forget_worker();
        let mut count = 0;
        for (id, request) in written {
            if !request.is_expired() {
                count += 1;
            }
            request.resolve(id, reply.clone());
        }
        count
    }

    /// Resolve everything, written or not.
    pub fn fail_all(&mut self, reply: Reply) -> usize {
        self.forget_worker();
        let mut count = 0;
        for (id, request) in self.pending.drain(..) {
            if !request.is_expired() {
                count += 1;
            }
            request.resolve(id, reply.clone());
        }
        count
    }

    fn forget_worker(&mut self) {
        self.missed = 0;
        self.echoes_ids = false;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
