//! Per-connection protocol state machine and JSON-RPC dispatcher.
//!
//! One session exists per client connection. Inbound requests and
//! notifications are drained by a single dispatcher task, so handler
//! execution is serialized within a session; responses to server-initiated
//! requests bypass that queue and resolve their waiters directly, which is
//! what lets a tool await `sampling/createMessage` while its own dispatch
//! slot is still occupied.

use crate::context::RequestContext;
use crate::error::Result;
use crate::error::ServerError;
use crate::outgoing::OutgoingSender;
use crate::server::McpServer;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolbus_protocol::CallToolRequestParams;
use toolbus_protocol::CancelledNotificationParams;
use toolbus_protocol::ClientCapabilities;
use toolbus_protocol::ClientNotification;
use toolbus_protocol::ClientRequest;
use toolbus_protocol::CompleteResult;
use toolbus_protocol::CompletionValues;
use toolbus_protocol::CreateMessageRequestParams;
use toolbus_protocol::CreateMessageResult;
use toolbus_protocol::ElicitRequestParams;
use toolbus_protocol::ElicitResult;
use toolbus_protocol::GetPromptRequestParams;
use toolbus_protocol::Implementation;
use toolbus_protocol::InitializeRequestParams;
use toolbus_protocol::InitializeResult;
use toolbus_protocol::JSONRPC_VERSION;
use toolbus_protocol::JsonRpcBatchRequestItem;
use toolbus_protocol::JsonRpcBatchResponseItem;
use toolbus_protocol::JsonRpcError;
use toolbus_protocol::JsonRpcMessage;
use toolbus_protocol::JsonRpcNotification;
use toolbus_protocol::JsonRpcRequest;
use toolbus_protocol::JsonRpcResponse;
use toolbus_protocol::ListRootsResult;
use toolbus_protocol::LoggingLevel;
use toolbus_protocol::LoggingMessageNotificationParams;
use toolbus_protocol::MessageConvertError;
use toolbus_protocol::RequestId;
use toolbus_protocol::ResourceUpdatedNotificationParams;
use toolbus_protocol::negotiate_protocol_version;
use toolbus_protocol::notifications;
use toolbus_protocol::server_methods;
use tracing::debug;
use tracing::warn;

/// Opaque per-connection identifier: 128 bits of randomness rendered as a
/// URL-safe token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        SessionId(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

/// Identity attached by the transport's authentication layer.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    pub subject: Option<String>,
    pub scopes: Vec<String>,
    pub claims: Value,
}

pub struct Session {
    id: SessionId,
    server: Arc<McpServer>,
    state: Mutex<SessionState>,
    client_info: Mutex<Option<Implementation>>,
    client_capabilities: Mutex<Option<ClientCapabilities>>,
    protocol_version: Mutex<String>,
    log_level: Mutex<LoggingLevel>,
    subscriptions: Mutex<HashSet<String>>,
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
    authorization: Mutex<Option<Authorization>>,
    outgoing: OutgoingSender,
    inbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn spawn(
        server: Arc<McpServer>,
        outgoing: mpsc::UnboundedSender<JsonRpcMessage>,
    ) -> Arc<Session> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: SessionId::generate(),
            server,
            state: Mutex::new(SessionState::Created),
            client_info: Mutex::new(None),
            client_capabilities: Mutex::new(None),
            protocol_version: Mutex::new(toolbus_protocol::LATEST_PROTOCOL_VERSION.to_string()),
            log_level: Mutex::new(LoggingLevel::Info),
            subscriptions: Mutex::new(HashSet::new()),
            inflight: Mutex::new(HashMap::new()),
            authorization: Mutex::new(None),
            outgoing: OutgoingSender::new(outgoing),
            inbound_tx,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(dispatch_loop(Arc::clone(&session), inbound_rx));
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn client_info(&self) -> Option<Implementation> {
        lock(&self.client_info).clone()
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        lock(&self.client_capabilities).clone()
    }

    pub fn protocol_version(&self) -> String {
        lock(&self.protocol_version).clone()
    }

    pub fn authorization(&self) -> Option<Authorization> {
        lock(&self.authorization).clone()
    }

    pub fn set_authorization(&self, authorization: Authorization) {
        *lock(&self.authorization) = Some(authorization);
    }

    /// Feed one inbound frame to the session. Responses and errors resolve
    /// their waiters immediately; requests and notifications are enqueued
    /// for the dispatcher task. `notifications/cancelled` also bypasses the
    /// queue so an in-flight handler can actually be interrupted.
    pub async fn handle_message(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(JsonRpcResponse { id, result, .. }) => {
                self.outgoing.resolve(id, Ok(result)).await;
            }
            JsonRpcMessage::Error(JsonRpcError { id, error, .. }) => {
                self.outgoing
                    .resolve(
                        id,
                        Err(ServerError::ClientResponse {
                            code: error.code,
                            message: error.message,
                        }),
                    )
                    .await;
            }
            JsonRpcMessage::BatchResponse(items) => {
                for item in items {
                    match item {
                        JsonRpcBatchResponseItem::Response(r) => {
                            self.outgoing.resolve(r.id, Ok(r.result)).await;
                        }
                        JsonRpcBatchResponseItem::Error(e) => {
                            self.outgoing
                                .resolve(
                                    e.id,
                                    Err(ServerError::ClientResponse {
                                        code: e.error.code,
                                        message: e.error.message,
                                    }),
                                )
                                .await;
                        }
                    }
                }
            }
            JsonRpcMessage::Notification(ref note) if note.method == notifications::CANCELLED => {
                self.handle_cancelled(note.clone());
            }
            other => {
                if self.inbound_tx.send(other).is_err() {
                    warn!(session = %self.id, "dispatcher gone; inbound message dropped");
                }
            }
        }
    }

    fn handle_cancelled(&self, note: JsonRpcNotification) {
        let Some(params) = note
            .params
            .and_then(|p| serde_json::from_value::<CancelledNotificationParams>(p).ok())
        else {
            warn!(session = %self.id, "malformed notifications/cancelled");
            return;
        };
        if let Some(token) = lock(&self.inflight).get(&params.request_id) {
            debug!(session = %self.id, id = %params.request_id, "cancelling in-flight request");
            token.cancel();
        }
    }

    async fn dispatch_inbound(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => {
                let reply = self.answer_request(request).await;
                self.outgoing.send_message(batch_item_to_message(reply));
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await;
            }
            JsonRpcMessage::BatchRequest(items) => {
                let mut replies = Vec::new();
                for item in items {
                    match item {
                        JsonRpcBatchRequestItem::Request(request) => {
                            replies.push(self.answer_request(request).await);
                        }
                        JsonRpcBatchRequestItem::Notification(notification) => {
                            self.handle_notification(notification).await;
                        }
                    }
                }
                if !replies.is_empty() {
                    self.outgoing
                        .send_message(JsonRpcMessage::BatchResponse(replies));
                }
            }
            // Responses never reach the dispatch queue.
            _ => {}
        }
    }

    async fn answer_request(self: &Arc<Self>, request: JsonRpcRequest) -> JsonRpcBatchResponseItem {
        let id = request.id.clone();
        match self.dispatch_request(id.clone(), request).await {
            Ok(result) => JsonRpcBatchResponseItem::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                result,
            }),
            Err(err) => JsonRpcBatchResponseItem::Error(JsonRpcError {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                error: err.to_error_detail(),
            }),
        }
    }

    async fn dispatch_request(self: &Arc<Self>, id: RequestId, request: JsonRpcRequest) -> Result<Value> {
        let request = ClientRequest::try_from(request).map_err(|err| match err {
            MessageConvertError::UnknownMethod(method) => ServerError::MethodNotFound(method),
            MessageConvertError::InvalidParams { detail, .. } => ServerError::InvalidParams {
                message: detail,
                data: None,
            },
        })?;

        // `initialize` is the only legal request until the handshake
        // completes; everything else is answered with -32002.
        match (&request, self.state()) {
            (ClientRequest::Initialize(_), SessionState::Created) => {}
            (ClientRequest::Initialize(_), _) => {
                return Err(ServerError::InvalidRequest(
                    "initialize called more than once".to_string(),
                ));
            }
            (_, SessionState::Ready) => {}
            (_, SessionState::Created | SessionState::Initializing) => {
                return Err(ServerError::NotInitialized);
            }
            (_, SessionState::ShuttingDown | SessionState::Closed) => {
                return Err(ServerError::InvalidRequest(
                    "session is shutting down".to_string(),
                ));
            }
        }

        match request {
            ClientRequest::Initialize(params) => self.handle_initialize(params),
            ClientRequest::Ping => Ok(json!({})),
            ClientRequest::ListTools(params) => {
                to_result_value(self.server.registry().list_tools(params.cursor.as_deref())?)
            }
            ClientRequest::CallTool(params) => self.handle_call_tool(id, params).await,
            ClientRequest::ListResources(params) => to_result_value(
                self.server
                    .registry()
                    .list_resources(params.cursor.as_deref())?,
            ),
            ClientRequest::ListResourceTemplates(params) => to_result_value(
                self.server
                    .registry()
                    .list_resource_templates(params.cursor.as_deref())?,
            ),
            ClientRequest::ReadResource(params) => {
                let cx = self.begin_request(id.clone(), None);
                let outcome = self.server.registry().read_resource(&params.uri, cx).await;
                self.end_request(&id);
                to_result_value(outcome?)
            }
            ClientRequest::Subscribe(params) => {
                lock(&self.subscriptions).insert(params.uri);
                Ok(json!({}))
            }
            ClientRequest::Unsubscribe(params) => {
                lock(&self.subscriptions).remove(&params.uri);
                Ok(json!({}))
            }
            ClientRequest::ListPrompts(params) => {
                to_result_value(self.server.registry().list_prompts(params.cursor.as_deref())?)
            }
            ClientRequest::GetPrompt(params) => {
                let GetPromptRequestParams { name, arguments } = params;
                let cx = self.begin_request(id.clone(), None);
                let outcome = self
                    .server
                    .registry()
                    .get_prompt(&name, arguments, cx)
                    .await;
                self.end_request(&id);
                to_result_value(outcome?)
            }
            ClientRequest::SetLevel(params) => {
                *lock(&self.log_level) = params.level;
                Ok(json!({}))
            }
            ClientRequest::Complete(params) => {
                let completion = match self.server.completion_provider() {
                    Some(provider) => provider.complete(params.r#ref, params.argument).await?,
                    None => CompletionValues::default(),
                };
                to_result_value(CompleteResult { completion })
            }
        }
    }

    fn handle_initialize(self: &Arc<Self>, params: InitializeRequestParams) -> Result<Value> {
        debug!(session = %self.id, client = %params.client_info.name, "initialize");
        let negotiated = negotiate_protocol_version(&params.protocol_version);
        *lock(&self.client_info) = Some(params.client_info);
        *lock(&self.client_capabilities) = Some(params.capabilities);
        *lock(&self.protocol_version) = negotiated.to_string();
        *lock(&self.state) = SessionState::Initializing;

        to_result_value(InitializeResult {
            capabilities: self.server.capabilities(),
            instructions: self.server.instructions().map(str::to_string),
            protocol_version: negotiated.to_string(),
            server_info: self.server.server_info(),
        })
    }

    async fn handle_call_tool(
        self: &Arc<Self>,
        id: RequestId,
        params: CallToolRequestParams,
    ) -> Result<Value> {
        let CallToolRequestParams {
            name,
            arguments,
            meta,
        } = params;
        let progress_token = meta.and_then(|m| m.progress_token);
        let cx = self.begin_request(id.clone(), progress_token);
        let outcome = self
            .server
            .registry()
            .call_tool(&name, arguments, cx)
            .await;
        self.end_request(&id);
        to_result_value(outcome?)
    }

    fn begin_request(
        self: &Arc<Self>,
        id: RequestId,
        progress_token: Option<toolbus_protocol::ProgressToken>,
    ) -> RequestContext {
        let token = self.shutdown.child_token();
        lock(&self.inflight).insert(id.clone(), token.clone());
        RequestContext {
            session: Arc::clone(self),
            request_id: id,
            progress_token,
            cancellation: token,
        }
    }

    fn end_request(&self, id: &RequestId) {
        lock(&self.inflight).remove(id);
    }

    async fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let notification = match ClientNotification::try_from(notification) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(session = %self.id, "failed to convert notification: {err}");
                return;
            }
        };
        match notification {
            ClientNotification::Initialized => {
                if self.state() == SessionState::Initializing {
                    *lock(&self.state) = SessionState::Ready;
                    debug!(session = %self.id, "session ready");
                } else {
                    warn!(session = %self.id, "unexpected notifications/initialized");
                }
            }
            ClientNotification::Cancelled(params) => {
                if let Some(token) = lock(&self.inflight).get(&params.request_id) {
                    token.cancel();
                }
            }
            ClientNotification::Progress(params) => {
                debug!(session = %self.id, progress = params.progress, "client progress");
            }
            ClientNotification::RootsListChanged => {
                debug!(session = %self.id, "client roots changed");
            }
        }
    }

    fn client_supports(&self, check: impl Fn(&ClientCapabilities) -> bool) -> bool {
        lock(&self.client_capabilities)
            .as_ref()
            .is_some_and(check)
    }

    /// Ask the client's LLM for a completion during a handler's execution.
    pub async fn create_message(
        &self,
        params: CreateMessageRequestParams,
        timeout: Option<Duration>,
    ) -> Result<CreateMessageResult> {
        if !self.client_supports(|c| c.sampling.is_some()) {
            return Err(ServerError::ClientHasNoSamplingSupport);
        }
        let result = self
            .outgoing
            .send_request(
                server_methods::SAMPLING_CREATE_MESSAGE,
                Some(to_result_value(params)?),
                timeout,
            )
            .await?;
        from_result_value(result)
    }

    pub async fn list_roots(&self, timeout: Option<Duration>) -> Result<ListRootsResult> {
        if !self.client_supports(|c| c.roots.is_some()) {
            return Err(ServerError::ClientHasNoRootsSupport);
        }
        let result = self
            .outgoing
            .send_request(server_methods::ROOTS_LIST, None, timeout)
            .await?;
        from_result_value(result)
    }

    pub async fn elicit(
        &self,
        params: ElicitRequestParams,
        timeout: Option<Duration>,
    ) -> Result<ElicitResult> {
        if !self.client_supports(|c| c.elicitation.is_some()) {
            return Err(ServerError::ClientHasNoElicitationSupport);
        }
        let result = self
            .outgoing
            .send_request(
                server_methods::ELICITATION_CREATE,
                Some(to_result_value(params)?),
                timeout,
            )
            .await?;
        from_result_value(result)
    }

    /// Send `notifications/message`, honoring the client-set level filter.
    pub fn send_log_message(&self, level: LoggingLevel, logger: Option<String>, data: Value) {
        if level < *lock(&self.log_level) {
            return;
        }
        let params = LoggingMessageNotificationParams {
            level,
            logger,
            data,
        };
        self.outgoing
            .send_notification(notifications::MESSAGE, serde_json::to_value(params).ok());
    }

    pub(crate) fn send_raw_notification(&self, method: &str, params: Option<Value>) {
        self.outgoing.send_notification(method, params);
    }

    pub fn notify_tools_list_changed(&self) {
        if self.state() == SessionState::Ready {
            self.outgoing
                .send_notification(notifications::TOOLS_LIST_CHANGED, None);
        }
    }

    pub fn notify_resources_list_changed(&self) {
        if self.state() == SessionState::Ready {
            self.outgoing
                .send_notification(notifications::RESOURCES_LIST_CHANGED, None);
        }
    }

    pub fn notify_prompts_list_changed(&self) {
        if self.state() == SessionState::Ready {
            self.outgoing
                .send_notification(notifications::PROMPTS_LIST_CHANGED, None);
        }
    }

    /// `notifications/resources/updated`, sent only when this session
    /// subscribed to the URI.
    pub fn notify_resource_updated(&self, uri: &str) {
        if !lock(&self.subscriptions).contains(uri) {
            return;
        }
        let params = ResourceUpdatedNotificationParams {
            uri: uri.to_string(),
        };
        self.outgoing.send_notification(
            notifications::RESOURCES_UPDATED,
            serde_json::to_value(params).ok(),
        );
    }

    /// Tear the session down: pending outbound waiters fail with a closed
    /// error and the running handler (if any) sees cancellation.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Closed) {
                return;
            }
            *state = SessionState::ShuttingDown;
        }
        self.shutdown.cancel();
        self.outgoing.close().await;
        *lock(&self.state) = SessionState::Closed;
        debug!(session = %self.id, "session closed");
    }
}

async fn dispatch_loop(session: Arc<Session>, mut inbound: mpsc::UnboundedReceiver<JsonRpcMessage>) {
    loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => session.dispatch_inbound(message).await,
                None => break,
            },
        }
    }
}

fn batch_item_to_message(item: JsonRpcBatchResponseItem) -> JsonRpcMessage {
    match item {
        JsonRpcBatchResponseItem::Response(response) => JsonRpcMessage::Response(response),
        JsonRpcBatchResponseItem::Error(error) => JsonRpcMessage::Error(error),
    }
}

fn to_result_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| ServerError::Internal(format!("failed to serialize response: {err}")))
}

fn from_result_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| ServerError::Internal(format!("malformed client response: {err}")))
}
