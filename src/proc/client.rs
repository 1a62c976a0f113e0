// src/proc/client.rs

//! Correlated request/response over the line protocol.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::{AthomeError, Result};
use crate::protocol::{Line, new_req_id};

/// How many timed-out request ids we remember.
const EXPIRED_CAPACITY: usize = 16;

struct Pending {
    req_id: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// State shared between a [`ProcClient`] and its proc subsystem.
pub(crate) struct ClientShared {
    name: String,
    timeout: Duration,
    gate: Semaphore,
    writer: Mutex<Option<mpsc::UnboundedSender<Line>>>,
    pending: Mutex<Option<Pending>>,
    /// Requests we stopped waiting for; a late response to one is dropped.
    expired: Mutex<VecDeque<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientShared {
    pub(crate) fn new(name: String, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            gate: Semaphore::new(1),
            writer: Mutex::new(None),
            pending: Mutex::new(None),
            expired: Mutex::new(VecDeque::new()),
        }
    }

    /// A child is up; requests may flow.
    pub(crate) fn attach(&self, writer: mpsc::UnboundedSender<Line>) {
        *lock(&self.writer) = Some(writer);
    }

    /// The child is going away; fail whatever is outstanding.
    pub(crate) fn detach(&self, reason: &str) {
        lock(&self.writer).take();
        self.abandon(reason);
    }

    pub(crate) fn abandon(&self, reason: &str) {
        if let Some(pending) = lock(&self.pending).take() {
            debug!(subsystem = %self.name, req_id = %pending.req_id, %reason, "abandoning request");
            let _ = pending
                .reply
                .send(Err(AthomeError::protocol(format!("request abandoned: {reason}"))));
        }
    }

    /// Remember `req_id` as given up on.
    fn expire(&self, req_id: String) {
        let mut expired = lock(&self.expired);
        if expired.len() == EXPIRED_CAPACITY {
            expired.pop_front();
        }
        expired.push_back(req_id);
    }

    fn forget_expired(&self, req_id: &str) -> bool {
        let mut expired = lock(&self.expired);
        match expired.iter().position(|id| id == req_id) {
            Some(at) => {
                expired.remove(at);
                true
            }
            None => false,
        }
    }

    /// Match a `response` line against the outstanding request. A late
    /// response to a timed-out request is dropped; any other mismatch is a
    /// protocol violation.
    pub(crate) fn resolve(&self, line: Line) -> Result<()> {
        let mut slot = lock(&self.pending);
        if let Some(req_id) = line.req_id.as_deref() {
            if self.forget_expired(req_id) {
                warn!(subsystem = %self.name, %req_id, "dropping late response");
                return Ok(());
            }
        }
        let pending = slot.take();
        drop(slot);
        match pending {
            Some(pending) if line.req_id.as_deref() == Some(pending.req_id.as_str()) => {
                let _ = pending.reply.send(line.into_response());
                Ok(())
            }
            Some(pending) => {
                let msg = format!(
                    "response req_id {:?} does not match pending request {}",
                    line.req_id, pending.req_id
                );
                let _ = pending.reply.send(Err(AthomeError::protocol(msg.clone())));
                Err(AthomeError::protocol(msg))
            }
            None => Err(AthomeError::protocol(format!(
                "unsolicited response with req_id {:?}",
                line.req_id
            ))),
        }
    }
}

/// Sends correlated requests to a proc subsystem's child. One request is
/// outstanding at a time; concurrent callers queue on the semaphore.
#[derive(Clone)]
pub struct ProcClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for ProcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcClient")
            .field("name", &self.shared.name)
            .field("timeout", &self.shared.timeout)
            .finish_non_exhaustive()
    }
}

impl ProcClient {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Send `message` with a fresh `req_id` and wait for the matching
    /// response.
    pub async fn request(&self, message: &str, payload: Value) -> Result<Value> {
        let _permit = self
            .shared
            .gate
            .acquire()
            .await
            .map_err(|_| AthomeError::protocol("request gate closed"))?;

        let writer = lock(&self.shared.writer).clone().ok_or_else(|| {
            AthomeError::protocol(format!(
                "subsystem '{}' has no running child",
                self.shared.name
            ))
        })?;

        let req_id = new_req_id();
        let (reply, response) = oneshot::channel();
        *lock(&self.shared.pending) = Some(Pending {
            req_id: req_id.clone(),
            reply,
        });

        debug!(subsystem = %self.shared.name, %req_id, %message, "sending request");
        if writer
            .send(Line::request(req_id.clone(), message, payload))
            .is_err()
        {
            lock(&self.shared.pending).take();
            return Err(AthomeError::protocol(format!(
                "stdin of subsystem '{}' is closed",
                self.shared.name
            )));
        }

        match tokio::time::timeout(self.shared.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AthomeError::protocol("request dropped without a response")),
            Err(_) => {
                let mut pending = lock(&self.shared.pending);
                if pending.as_ref().is_some_and(|p| p.req_id == req_id) {
                    pending.take();
                }
                warn!(subsystem = %self.shared.name, %req_id, "request timed out");
                self.shared.expire(req_id);
                drop(pending);
                Err(AthomeError::Timeout(self.shared.timeout))
            }
        }
    }
}
