use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use socket_registry::{type_tag, Connection, SocketManager};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const NO_REQUEST_ID: &str = "NO_REQUEST_ID";

/// Codes carried in the payload of an `Error` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionError,
    InvalidMessage,
    UnknownMessage,
    ValidationError,
    InternalError,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Registry(#[from] socket_registry::Error),
}

impl HandlerError {
    fn code_and_message(&self) -> (ErrorCode, String) {
        match self {
            Self::Registry(socket_registry::Error::InvalidArgument(message)) => {
                (ErrorCode::ValidationError, message.to_string())
            }
            Self::Registry(_) => (
                ErrorCode::InternalError,
                "An unexpected error occurred".to_string(),
            ),
        }
    }
}

/// Who sent the frame being handled.
pub struct HandlerContext<'a> {
    pub manager: &'a SocketManager,
    pub client_id: &'a str,
}

/// A typed handler for one inbound message type.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + Sync;
    type Response: Serialize + Send;

    /// Tag clients put in `type`; matched case-insensitively.
    const MESSAGE_TYPE: &'static str;

    /// Returns every rule the request breaks; empty means valid.
    fn validate(&self, _request: &Self::Request) -> Vec<String> {
        Vec::new()
    }

    /// Topic this request subscribes to or leaves, echoed back as `topicKey`.
    fn topic_key(&self, _request: &Self::Request, _client_id: &str) -> Option<String> {
        None
    }

    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        request: Self::Request,
    ) -> Result<Self::Response, HandlerError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Reply<'a, T> {
    #[serde(rename = "type")]
    message_type: &'a str,
    request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic_key: Option<String>,
    payload: T,
}

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    code: ErrorCode,
    message: &'a str,
}

struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Type-erased entry in the registry.
#[async_trait]
trait Registration: Send + Sync {
    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        request_id: &str,
        payload: Value,
    ) -> Result<String, Rejection>;
}

struct Registered<H>(H);

#[async_trait]
impl<H: MessageHandler> Registration for Registered<H> {
    async fn run(
        &self,
        ctx: &HandlerContext<'_>,
        request_id: &str,
        payload: Value,
    ) -> Result<String, Rejection> {
        let request: H::Request = serde_json::from_value(payload).map_err(|e| {
            tracing::debug!(message_type = H::MESSAGE_TYPE, "Payload did not deserialize: {}", e);
            Rejection::new(ErrorCode::InvalidMessage, "Invalid message format")
        })?;

        let violations = self.0.validate(&request);
        if !violations.is_empty() {
            let errors = violations.join(", ");
            tracing::info!(
                message_type = H::MESSAGE_TYPE,
                errors = %errors,
                "Validation failed"
            );
            return Err(Rejection::new(ErrorCode::ValidationError, errors));
        }

        let topic_key = self.0.topic_key(&request, ctx.client_id);
        let response = self.0.handle(ctx, request).await.map_err(|e| {
            tracing::error!(
                message_type = H::MESSAGE_TYPE,
                client_id = ctx.client_id,
                "Handler failed: {}",
                e
            );
            let (code, message) = e.code_and_message();
            Rejection::new(code, message)
        })?;

        let reply = Reply {
            message_type: type_tag::<H::Response>(),
            request_id,
            topic_key,
            payload: response,
        };
        serde_json::to_string(&reply).map_err(|e| {
            tracing::error!(message_type = H::MESSAGE_TYPE, "Failed to serialize reply: {}", e);
            Rejection::new(ErrorCode::InternalError, "An unexpected error occurred")
        })
    }
}

/// Routes inbound frames to handlers by their lower-cased type tag.
///
/// Frame shape: `{"type": ..., "payload": ..., "requestId": ...}`, field
/// names matched case-insensitively. Every frame gets exactly one reply,
/// either the handler's response or an `Error` envelope.
#[derive(Default, Clone)]
pub struct Dispatcher {
    registry: HashMap<String, Arc<dyn Registration>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MessageHandler>(mut self, handler: H) -> Self {
        let message_type = H::MESSAGE_TYPE.to_ascii_lowercase();
        tracing::debug!(message_type = %message_type, "Registered message handler");
        self.registry
            .insert(message_type, Arc::new(Registered(handler)));
        self
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.registry.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Handle one text frame from `connection`, returning the reply text.
    pub async fn dispatch(
        &self,
        manager: &SocketManager,
        connection: &dyn Connection,
        text: &str,
    ) -> String {
        let frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) | Err(_) => {
                tracing::warn!(socket_id = %connection.id(), "Received malformed frame");
                return error_reply(
                    NO_REQUEST_ID,
                    ErrorCode::InvalidMessage,
                    "Invalid message format",
                );
            }
        };

        let request_id = field(&frame, "requestId")
            .and_then(Value::as_str)
            .unwrap_or(NO_REQUEST_ID);

        match self.route(manager, connection, &frame, request_id).await {
            Ok(reply) => reply,
            Err(rejection) => error_reply(request_id, rejection.code, &rejection.message),
        }
    }

    async fn route(
        &self,
        manager: &SocketManager,
        connection: &dyn Connection,
        frame: &Map<String, Value>,
        request_id: &str,
    ) -> Result<String, Rejection> {
        let socket_id = connection.id();
        let client_id = match manager.try_get_client_id(connection).await {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                tracing::error!(%socket_id, "Dispatch failed: no client id for socket");
                return Err(Rejection::new(
                    ErrorCode::ConnectionError,
                    "Client session not found.",
                ));
            }
            Err(e) => {
                tracing::error!(%socket_id, "Dispatch failed: client lookup error: {}", e);
                return Err(Rejection::new(
                    ErrorCode::InternalError,
                    "An unexpected error occurred",
                ));
            }
        };

        let message_type = match field(frame, "type").and_then(Value::as_str) {
            Some(message_type) if !message_type.is_empty() => message_type,
            _ => {
                tracing::warn!(%socket_id, "Received message without type field");
                return Err(Rejection::new(
                    ErrorCode::InvalidMessage,
                    "Missing message type: The 'type' field is required",
                ));
            }
        };

        let Some(registration) = self.registry.get(&message_type.to_ascii_lowercase()) else {
            tracing::warn!(%socket_id, message_type, "No handler registered for message type");
            return Err(Rejection::new(
                ErrorCode::UnknownMessage,
                format!("No handler for message type: {}", message_type),
            ));
        };

        let Some(payload) = field(frame, "payload") else {
            tracing::warn!(%socket_id, message_type, "Received message without payload field");
            return Err(Rejection::new(ErrorCode::InvalidMessage, "Missing payload"));
        };

        let ctx = HandlerContext {
            manager,
            client_id: &client_id,
        };
        registration.run(&ctx, request_id, payload.clone()).await
    }
}

fn field<'a>(frame: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    frame
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn error_reply(request_id: &str, code: ErrorCode, message: &str) -> String {
    let reply = Reply {
        message_type: "Error",
        request_id,
        topic_key: None,
        payload: ErrorPayload { code, message },
    };
    // Only strings and a unit enum, cannot fail
    serde_json::to_string(&reply).unwrap_or_default()
}
