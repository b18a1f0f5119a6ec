//! # Request/Response Correlation
//!
//! Matches reply messages to the requests that caused them. A requester
//! registers a pending entry under a fresh `request_id`, sends its message
//! carrying that id, and waits on a oneshot channel. When a reply with the
//! same `request_id` arrives, the connection loop hands it to
//! [`RequestManager::handle_response`] which completes the waiter.
//!
//! Pending entries are removed on reply, on timeout, when the send fails,
//! when the peer's connection closes, and by the periodic expiry sweep.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::NetworkError;
use crate::protocol::{Message, MessageKind, NodeId};
use crate::registry::age_cutoff;

/// Payload field carrying the correlation id.
pub const REQUEST_ID_FIELD: &str = "request_id";

#[derive(Clone, Default)]
pub struct RequestManager {
    pending_requests: Arc<RwLock<HashMap<String, PendingRequest>>>,
}

#[derive(Debug)]
struct PendingRequest {
    request_id: String,
    peer_id: NodeId,
    expected: MessageKind,
    response_sender: oneshot::Sender<Message>,
    created_at: DateTime<Utc>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a request and waits for the reply of kind `expected`.
    ///
    /// `send_fn` receives the generated request id and must put it in the
    /// outgoing payload.
    pub async fn send_request<F, Fut>(
        &self,
        peer_id: NodeId,
        expected: MessageKind,
        send_fn: F,
        timeout_duration: Duration,
    ) -> Result<Message, NetworkError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), NetworkError>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut pending_requests = self.pending_requests.write();
            pending_requests.insert(
                request_id.clone(),
                PendingRequest {
                    request_id: request_id.clone(),
                    peer_id,
                    expected,
                    response_sender: response_tx,
                    created_at: Utc::now(),
                },
            );
        }

        if let Err(e) = send_fn(request_id.clone()).await {
            self.pending_requests.write().remove(&request_id);
            return Err(e);
        }

        match timeout(timeout_duration, response_rx).await {
            Ok(Ok(response)) => {
                debug!("Received response for request {}", request_id);
                Ok(response)
            }
            Ok(Err(_)) => {
                self.pending_requests.write().remove(&request_id);
                Err(NetworkError::Cancelled(request_id))
            }
            Err(_) => {
                self.pending_requests.write().remove(&request_id);
                Err(NetworkError::Timeout(timeout_duration))
            }
        }
    }

    /// Delivers a reply to its waiter. Returns false for replies nobody is
    /// waiting for, or that come from the wrong peer or with the wrong kind.
    pub fn handle_response(&self, response: Message) -> bool {
        let Some(request_id) = response.field_str(REQUEST_ID_FIELD).map(str::to_string) else {
            warn!("Dropping {} without a request id", response.kind());
            return false;
        };

        let mut pending_requests = self.pending_requests.write();
        let matches = pending_requests.get(&request_id).map(|pending| {
            pending.peer_id == *response.sender_id() && pending.expected == response.kind()
        });

        match matches {
            Some(true) => {
                let Some(pending) = pending_requests.remove(&request_id) else {
                    return false;
                };
                if pending.response_sender.send(response).is_err() {
                    warn!("Failed to deliver response - receiver dropped");
                    return false;
                }
                debug!("Delivered response for request {}", pending.request_id);
                true
            }
            Some(false) => {
                warn!(
                    "Response for request {} came from an unexpected sender or kind",
                    request_id
                );
                false
            }
            None => {
                warn!("Received response for unknown request: {}", request_id);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.read().len()
    }

    pub fn pending_for_peer(&self, peer_id: &NodeId) -> Vec<String> {
        self.pending_requests
            .read()
            .values()
            .filter(|req| req.peer_id == *peer_id)
            .map(|req| req.request_id.clone())
            .collect()
    }

    /// Fails every pending request of a peer whose connection went away.
    pub fn cancel_peer_requests(&self, peer_id: &NodeId) -> usize {
        let mut pending_requests = self.pending_requests.write();
        let before = pending_requests.len();
        pending_requests.retain(|_, req| req.peer_id != *peer_id);
        before - pending_requests.len()
    }

    /// Drops entries older than `max_age`; their waiters see a cancellation.
    pub fn expire(&self, max_age: Duration) -> usize {
        let Some(cutoff) = age_cutoff(max_age) else {
            return 0;
        };
        let mut pending_requests = self.pending_requests.write();
        let before = pending_requests.len();
        pending_requests.retain(|_, req| req.created_at >= cutoff);
        before - pending_requests.len()
    }
}
