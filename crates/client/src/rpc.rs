//! RPC correlation
//!
//! Matches response frames to the request that produced them by id alone;
//! arrival order carries no meaning. Every pending entry resolves exactly
//! once, either with the matching response or with a synthetic
//! `DISCONNECTED` failure when the connection drops.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use skybridge_protocol::frames::{RequestFrame, ResponseFrame};

/// Pending-request table plus the per-connection id counter.
pub struct RpcCorrelator {
    next_id: AtomicU64,
    pending: DashMap<String, oneshot::Sender<ResponseFrame>>,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Mint the next request id. Ids grow monotonically for the lifetime of
    /// this correlator and are rendered as decimal strings on the wire.
    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Build a request frame and register its completion slot. The entry
    /// exists before the frame is handed to the transport, so a fast
    /// response can never miss it.
    pub fn begin(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> (RequestFrame, oneshot::Receiver<ResponseFrame>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let frame = RequestFrame {
            id,
            method: method.into(),
            params,
        };
        (frame, rx)
    }

    /// Build a request frame without a completion slot (fire-and-forget).
    pub fn begin_notify(&self, method: &str, params: Option<Value>) -> RequestFrame {
        RequestFrame {
            id: self.next_id(),
            method: method.into(),
            params,
        }
    }

    /// Route an inbound response to its waiting caller, if any.
    pub fn resolve(&self, response: ResponseFrame) {
        if let Some((id, tx)) = self.pending.remove(&response.id) {
            // Send failure means the caller gave up (timed out); fine.
            if tx.send(response).is_err() {
                debug!(
                    component = "rpc",
                    event = "rpc.response.receiver_gone",
                    id = %id,
                    "response arrived after caller stopped waiting"
                );
            }
        } else {
            debug!(
                component = "rpc",
                event = "rpc.response.unmatched",
                id = %response.id,
                "response with no pending request"
            );
        }
    }

    /// Drop the pending entry for a call whose caller gave up.
    pub fn forget(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Force-resolve every pending call with a `DISCONNECTED` failure.
    /// Invoked on disconnect so callers never hang across a reconnect.
    pub fn reject_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((id, tx)) = self.pending.remove(&id) {
                let _ = tx.send(ResponseFrame::disconnected(id));
            }
        }
    }

    /// Number of calls still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
