//! Sends messages to the client and manages callbacks for server-initiated
//! requests.

use crate::error::Result;
use crate::error::ServerError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use toolbus_protocol::CancelledNotificationParams;
use toolbus_protocol::JsonRpcErrorDetail;
use toolbus_protocol::JsonRpcMessage;
use toolbus_protocol::RequestId;
use toolbus_protocol::notifications;
use tracing::warn;

pub(crate) struct OutgoingSender {
    next_request_id: AtomicI64,
    sender: mpsc::UnboundedSender<JsonRpcMessage>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>,
    closed: AtomicBool,
}

impl OutgoingSender {
    pub(crate) fn new(sender: mpsc::UnboundedSender<JsonRpcMessage>) -> Self {
        Self {
            next_request_id: AtomicI64::new(0),
            sender,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Issue a server-initiated request and await the client's answer. A
    /// deadline, when given, fails the waiter with `Timeout` and tells the
    /// client the request was cancelled.
    pub(crate) async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::SessionClosed);
        }
        let id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }
        self.send_message(JsonRpcMessage::request(id.clone(), method, params));

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    self.send_cancelled(id, "request timed out");
                    return Err(ServerError::Timeout);
                }
            },
            None => rx.await,
        };
        match received {
            Ok(outcome) => outcome,
            // The waiter was dropped without an answer: session teardown.
            Err(_) => Err(ServerError::SessionClosed),
        }
    }

    /// Route an inbound response (or error) to its waiter. Responses with no
    /// pending request are a protocol violation; they are logged and dropped.
    pub(crate) async fn resolve(&self, id: RequestId, outcome: Result<Value>) {
        let entry = {
            let mut pending = self.pending.lock().await;
            pending.remove_entry(&id)
        };
        match entry {
            Some((id, tx)) => {
                if tx.send(outcome).is_err() {
                    warn!("could not notify waiter for request {id}");
                }
            }
            None => {
                warn!("no pending request matches response id {id}");
            }
        }
    }

    /// Fail every pending waiter; subsequent sends are rejected.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pending = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ServerError::SessionClosed));
        }
    }

    pub(crate) fn send_message(&self, message: JsonRpcMessage) {
        if self.sender.send(message).is_err() {
            warn!("transport sink dropped; outgoing message discarded");
        }
    }

    pub(crate) fn send_response(&self, id: RequestId, result: Value) {
        self.send_message(JsonRpcMessage::response(id, result));
    }

    pub(crate) fn send_error(&self, id: RequestId, error: JsonRpcErrorDetail) {
        self.send_message(JsonRpcMessage::error(id, error));
    }

    pub(crate) fn send_notification(&self, method: &str, params: Option<Value>) {
        self.send_message(JsonRpcMessage::notification(method, params));
    }

    fn send_cancelled(&self, id: RequestId, reason: &str) {
        let params = CancelledNotificationParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        self.send_notification(notifications::CANCELLED, serde_json::to_value(params).ok());
    }
}
