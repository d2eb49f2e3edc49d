//! Outgoing calls and response correlation.

use crate::codec::Codec;
use crate::error::{WireError, WireResult};
use crate::message::{Frame, Id, Message};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type Pending = DashMap<Id, oneshot::Sender<WireResult<Value>>>;

/// The calling half of a [`Remote`](crate::Remote).
///
/// Replies are fed in by the owning receive loop through [`Client::deliver`].
pub struct Client {
    codec: Arc<dyn Codec>,
    next_id: AtomicU64,
    pending: Pending,
    closed: AtomicBool,
    timeout: Option<Duration>,
}

/// Removes a pending entry when the waiting call is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: Id,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Client {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            timeout: None,
        }
    }

    /// Apply `timeout` to every call that doesn't set its own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn next_id(&self) -> Id {
        Id::Num(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Call `method` and decode its result.
    pub async fn call<P, R>(&self, method: &str, params: P) -> WireResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = match self.timeout {
            Some(timeout) => self.call_raw_timeout(method, params, timeout).await?,
            None => self.call_raw(method, params).await?,
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`call`](Self::call) with an explicit deadline.
    ///
    /// On timeout the request is not retracted; a late reply is discarded.
    pub async fn call_timeout<P, R>(&self, method: &str, params: P, timeout: Duration) -> WireResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call_raw_timeout(method, params, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_raw_timeout(&self, method: &str, params: Value, timeout: Duration) -> WireResult<Value> {
        tokio::time::timeout(timeout, self.call_raw(method, params))
            .await
            .map_err(|_| WireError::Timeout(timeout))?
    }

    /// Send a request and wait for the raw result value.
    pub async fn call_raw(&self, method: &str, params: Value) -> WireResult<Value> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        // Checked after inserting so a concurrent fail_all either sees the
        // entry or we see the flag.
        if self.closed.load(Ordering::SeqCst) {
            return Err(WireError::ConnectionClosed);
        }

        self.codec
            .send(Frame::Single(Message::request(id, method, params)))
            .await?;

        rx.await.map_err(|_| WireError::ConnectionClosed)?
    }

    /// Send a notification. Only send failures are reported.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> WireResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WireError::ConnectionClosed);
        }
        let params = serde_json::to_value(params)?;
        self.codec
            .send(Frame::Single(Message::notification(method, params)))
            .await
    }

    /// Hand a response to its waiting call. Returns `false` if nothing was
    /// waiting for it (a late or unknown reply).
    pub fn deliver(&self, message: Message) -> bool {
        let Some(id) = message.id.as_ref() else {
            return false;
        };
        let Some((_, tx)) = self.pending.remove(id) else {
            return false;
        };
        let result = match (message.error, message.result) {
            (Some(error), _) => Err(WireError::Remote {
                code: error.code,
                message: error.message,
            }),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(WireError::InvalidResponse(
                "response carries neither result nor error".to_string(),
            )),
        };
        // The caller may have given up in the meantime.
        let _ = tx.send(result);
        true
    }

    /// Mark the client closed and fail every outstanding call.
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<Id> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "Failing outstanding calls");
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(WireError::ConnectionClosed));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
