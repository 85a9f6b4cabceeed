//! Per-request context handed to every handler invocation.
//!
//! The context is created when dispatch of an inbound request begins and
//! dropped once its response is emitted. It is the handler's only route to
//! the owning session: progress, logging, cancellation, and server-initiated
//! requests all go through here rather than ambient globals.

use crate::error::Result;
use crate::session::Session;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolbus_protocol::CreateMessageRequestParams;
use toolbus_protocol::CreateMessageResult;
use toolbus_protocol::ElicitRequestParams;
use toolbus_protocol::ElicitResult;
use toolbus_protocol::ListRootsResult;
use toolbus_protocol::LoggingLevel;
use toolbus_protocol::ProgressNotificationParams;
use toolbus_protocol::ProgressToken;
use toolbus_protocol::RequestId;
use toolbus_protocol::notifications;

#[derive(Clone)]
pub struct RequestContext {
    pub(crate) session: Arc<Session>,
    pub(crate) request_id: RequestId,
    pub(crate) progress_token: Option<ProgressToken>,
    pub(crate) cancellation: CancellationToken,
}

impl RequestContext {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// True once the client cancelled this request or the session is going
    /// away. Handlers are expected to check at their own suspension points.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the request is cancelled; never completes otherwise.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Emit `notifications/progress` against the caller's progress token.
    /// A no-op when the request did not carry one.
    pub fn report_progress(&self, progress: f64, total: Option<f64>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let params = ProgressNotificationParams {
            progress_token: token.clone(),
            progress,
            total,
        };
        self.session
            .send_raw_notification(notifications::PROGRESS, serde_json::to_value(params).ok());
    }

    /// Ask the client's LLM for a completion. Requires the client to have
    /// advertised the `sampling` capability.
    pub async fn sample(&self, params: CreateMessageRequestParams) -> Result<CreateMessageResult> {
        self.session.create_message(params, None).await
    }

    pub async fn sample_with_timeout(
        &self,
        params: CreateMessageRequestParams,
        timeout: Duration,
    ) -> Result<CreateMessageResult> {
        self.session.create_message(params, Some(timeout)).await
    }

    /// Ask the client for its workspace roots. Requires the `roots`
    /// capability.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        self.session.list_roots(None).await
    }

    /// Ask the client to collect structured input from its user. Requires
    /// the `elicitation` capability.
    pub async fn elicit(&self, params: ElicitRequestParams) -> Result<ElicitResult> {
        self.session.elicit(params, None).await
    }

    /// Send a log notification through the session's level filter.
    pub fn log(&self, level: LoggingLevel, data: Value) {
        self.session.send_log_message(level, None, data);
    }
}
