//! HTTP and WebSocket surface of the relay.
//!
//! Callers are identified by the `x-spoke-user` / `x-spoke-device` headers,
//! which an authenticating proxy in front of the relay is trusted to set.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    async_trait,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        DefaultBodyLimit, FromRequestParts, Path, State, WebSocketUpgrade,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, ReplayPolicy};
use crate::connection::{Connection, Outbound};
use crate::delivery::DeliveryOrchestrator;
use crate::error::{DeliveryError, FanoutError};
use crate::fanout::{FanoutCoordinator, MultiRecipientSend, RecipientOutcome};
use crate::logging;
use crate::protocol::{
    Blob, DeliveryOutcome, DeviceIdentity, Frame, FrameType, MultiRecipientMessage, Payload,
    PendingMessage, PushType, UserId,
};
use crate::push::PushProvider;
use crate::storage::{BlobStore, MessageStore, StoreError, StoredBlob, UserDirectory};

pub const USER_HEADER: &str = "x-spoke-user";
pub const DEVICE_HEADER: &str = "x-spoke-device";

#[derive(Clone)]
pub struct RelayState {
    orchestrator: Arc<DeliveryOrchestrator>,
    fanout: FanoutCoordinator,
    directory: Arc<dyn UserDirectory>,
    blobs: Arc<dyn BlobStore>,
    start_time: Instant,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        blobs: Arc<dyn BlobStore>,
        push: Arc<dyn PushProvider>,
    ) -> Self {
        let orchestrator = Arc::new(DeliveryOrchestrator::new(
            config,
            store,
            Arc::clone(&directory),
            push,
        ));
        Self {
            fanout: FanoutCoordinator::new(Arc::clone(&orchestrator)),
            orchestrator,
            directory,
            blobs,
            start_time: Instant::now(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<DeliveryOrchestrator> {
        &self.orchestrator
    }
}

pub fn app(state: RelayState) -> Router {
    let body_limit = state.orchestrator.config().max_body_bytes;
    Router::new()
        .route("/health", get(healthcheck))
        .route("/debug/stats", get(debug_stats))
        .route("/websocket", get(ws_handler))
        .route(
            "/users/:user/devices/:device/send-message",
            post(send_message),
        )
        .route("/actions/send-message", post(send_multi_recipient_message))
        .route("/current-device/token", post(register_push_token))
        .route("/users/:user/block", post(block_user))
        .route("/users/:user/unblock", post(unblock_user))
        .route("/blobs", post(upload_blob))
        .route("/blobs/:blob_id", get(fetch_blob))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors and extractors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing x-spoke-user or x-spoke-device header")]
    Unauthenticated,
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Fanout(#[from] FanoutError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Delivery(_) | ApiError::Fanout(_) | ApiError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let error = self.to_string();
        let body = match self {
            ApiError::Delivery(e) => json!({
                "error": error,
                "failed": [{ "device": e.device(), "error": e.to_string() }],
            }),
            ApiError::Fanout(FanoutError::Partial { delivered, failed }) => json!({
                "error": error,
                "delivered": delivered,
                "failed": failed
                    .iter()
                    .map(|f| json!({ "device": f.device, "error": f.error.to_string() }))
                    .collect::<Vec<_>>(),
            }),
            _ => json!({ "error": error }),
        };
        (status, Json(body)).into_response()
    }
}

/// Device identity asserted by the upstream authenticator.
pub struct Authenticated(pub DeviceIdentity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        match (header(USER_HEADER), header(DEVICE_HEADER)) {
            (Some(user), Some(device)) => Ok(Authenticated(DeviceIdentity::new(user, device))),
            _ => Err(ApiError::Unauthenticated),
        }
    }
}

// ---------------------------------------------------------------------------
// Sends
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SendMessage<M> {
    /// The sender's own id for the message, echoed in receipts.
    pub message_id: String,
    pub message: M,
    #[serde(default)]
    pub push_type: Option<PushType>,
    #[serde(default)]
    pub wants_acknowledgement: Option<bool>,
}

impl<M> SendMessage<M> {
    fn push_type(&self) -> PushType {
        self.push_type.unwrap_or_default()
    }

    fn requests_ack(&self) -> bool {
        self.wants_acknowledgement
            .unwrap_or(self.push_type() != PushType::None)
    }
}

#[derive(Debug, Serialize)]
struct SendResponse {
    outcome: DeliveryOutcome,
}

#[derive(Debug, Serialize)]
struct FanoutResponse {
    outcomes: Vec<RecipientOutcome>,
}

async fn send_message(
    State(state): State<RelayState>,
    Path((user, device)): Path<(String, String)>,
    Authenticated(sender): Authenticated,
    body: Result<Json<SendMessage<Blob>>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let Json(body) = body?;
    let message = PendingMessage::new(
        body.message_id.clone(),
        sender,
        DeviceIdentity::new(user, device),
        Payload::Single(body.message.clone()),
    )
    .with_push_type(body.push_type())
    .with_requests_ack(body.requests_ack());

    let outcome = state.orchestrator.deliver(message).await?;
    Ok(Json(SendResponse { outcome }))
}

async fn send_multi_recipient_message(
    State(state): State<RelayState>,
    Authenticated(sender): Authenticated,
    body: Result<Json<SendMessage<MultiRecipientMessage>>, JsonRejection>,
) -> Result<Json<FanoutResponse>, ApiError> {
    let Json(body) = body?;
    if body.message.keys.is_empty() {
        return Err(ApiError::BadRequest("message has no recipients".into()));
    }
    let push_type = body.push_type();
    let requests_ack = body.requests_ack();
    let outcomes = state
        .fanout
        .send(MultiRecipientSend {
            client_message_id: body.message_id,
            sender,
            message: body.message,
            push_type,
            requests_ack,
        })
        .await?;
    Ok(Json(FanoutResponse { outcomes }))
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenRequest {
    token: String,
}

async fn register_push_token(
    State(state): State<RelayState>,
    Authenticated(device): Authenticated,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = body?;
    let token = body.token.trim();
    if token.is_empty() {
        return Err(ApiError::BadRequest("token must not be empty".into()));
    }
    state.directory.set_push_token(&device, token).await?;
    info!(device = %logging::device(&device), "push token registered");
    Ok(StatusCode::OK)
}

async fn block_user(
    State(state): State<RelayState>,
    Path(user): Path<String>,
    Authenticated(caller): Authenticated,
) -> Result<StatusCode, ApiError> {
    state
        .directory
        .block(caller.user(), &UserId::new(user))
        .await?;
    Ok(StatusCode::OK)
}

async fn unblock_user(
    State(state): State<RelayState>,
    Path(user): Path<String>,
    Authenticated(caller): Authenticated,
) -> Result<StatusCode, ApiError> {
    state
        .directory
        .unblock(caller.user(), &UserId::new(user))
        .await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

async fn upload_blob(
    State(state): State<RelayState>,
    Authenticated(caller): Authenticated,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StoredBlob>, ApiError> {
    let Json(document) = body?;
    if !document.is_object() {
        return Err(ApiError::BadRequest("blob must be a JSON object".into()));
    }
    let blob = StoredBlob::new(caller.user().clone(), document);
    state.blobs.insert_blob(&blob).await?;
    info!(
        blob_id = %logging::short_id(&blob.id),
        creator = %caller.user(),
        "blob stored"
    );
    Ok(Json(blob))
}

async fn fetch_blob(
    State(state): State<RelayState>,
    Path(blob_id): Path<String>,
    Authenticated(_caller): Authenticated,
) -> Result<Json<StoredBlob>, ApiError> {
    state
        .blobs
        .find_blob(&blob_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("blob {blob_id}")))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn debug_stats(State(state): State<RelayState>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.config();
    Json(json!({
        "connected_devices": orchestrator.registry().len().await,
        "outstanding_acks": orchestrator.acks().outstanding(),
        "device_locks": orchestrator.tracked_device_locks(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "config": {
            "ack_timeout_ms": config.ack_timeout.as_millis() as u64,
            "replay_policy": match config.replay_policy {
                ReplayPolicy::AwaitAck => "await-ack",
                ReplayPolicy::DeleteOnSend => "delete-on-send",
            },
            "max_body_bytes": config.max_body_bytes,
            "push_inline_limit": config.push_inline_limit,
        }
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    Authenticated(device): Authenticated,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, device, state))
}

async fn handle_ws_connection(mut socket: WebSocket, device: DeviceIdentity, state: RelayState) {
    let orchestrator = Arc::clone(&state.orchestrator);
    let (connection, mut outbound) = Connection::channel();
    orchestrator
        .register_connection(device.clone(), connection.clone())
        .await;

    tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        let device = device.clone();
        async move {
            if let Err(e) = orchestrator.drain(&device).await {
                warn!(device = %logging::device(&device), error = %e, "queue drain failed");
            }
        }
    });

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Outbound::Frame(bytes) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Binary(bytes))) => handle_inbound(&orchestrator, &device, &bytes),
                Some(Ok(Message::Text(text))) => handle_inbound(&orchestrator, &device, text.as_bytes()),
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    // Fail in-flight sends fast before releasing their ack waiters.
    drop(outbound);
    orchestrator.disconnect(&device, &connection).await;
    info!(
        device = %logging::device(&device),
        connection = %connection.id(),
        "websocket closed"
    );
}

fn handle_inbound(orchestrator: &DeliveryOrchestrator, device: &DeviceIdentity, bytes: &[u8]) {
    match Frame::decode(bytes) {
        Ok(frame) if frame.kind == FrameType::Ack => {
            orchestrator.acknowledge(frame.id, device);
        }
        Ok(frame) => debug!(
            device = %logging::device(device),
            frame_type = ?frame.kind,
            "ignoring inbound frame"
        ),
        Err(e) => warn!(device = %logging::device(device), error = %e, "malformed inbound frame"),
    }
}
