//! Agent-facing request handling.
//!
//! Agents speak JSON-RPC 2.0, one object per line. Each request is dispatched
//! to an [`AgentRequestHandler`] method on its own task, so a slow tool call
//! never holds up `tools/list` or other calls on the same connection.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use broker_primitives::{ToolInvocation, ToolResult};
use broker_transport::{MessageSink, MessageSource, TransportError};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Broker;

/// Protocol revision reported when the agent does not name one.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name reported in `initialize` responses.
pub const SERVER_NAME: &str = "tool-broker";

const JSONRPC_VERSION: &str = "2.0";

/// A decoded request handed to handler methods.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: Value,
    method: String,
    params: Value,
    received_at: Instant,
}

impl RequestContext {
    /// Creates a context for `method` with the given id and params.
    #[must_use]
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            received_at: Instant::now(),
        }
    }

    /// Returns the request id.
    #[must_use]
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Returns the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the raw params; `Null` when omitted.
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Returns when the request was decoded.
    #[must_use]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

/// Protocol-level failures, each mapped to a JSON-RPC error code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The line was not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),
    /// The JSON was not a valid request object.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// No handler for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// The params did not match the method.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The broker failed while handling the request.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Returns the JSON-RPC error code.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Internal(_) => -32603,
        }
    }
}

/// Result alias for handler operations.
pub type HandlerResult<T = Value> = Result<T, HandlerError>;

/// Methods an agent may call. Unimplemented methods answer
/// [`HandlerError::MethodNotFound`].
#[async_trait]
pub trait AgentRequestHandler: Send + Sync {
    /// Called for `initialize`.
    async fn handle_initialize(&self, ctx: &RequestContext) -> HandlerResult {
        self.handle_unhandled(ctx).await
    }

    /// Called for `ping`.
    async fn handle_ping(&self, ctx: &RequestContext) -> HandlerResult {
        let _ = ctx;
        Ok(json!({}))
    }

    /// Called for `tools/list`.
    async fn handle_tools_list(&self, ctx: &RequestContext) -> HandlerResult {
        self.handle_unhandled(ctx).await
    }

    /// Called for `tools/call`.
    async fn handle_tools_call(&self, ctx: &RequestContext) -> HandlerResult {
        self.handle_unhandled(ctx).await
    }

    /// Called for `apps/list`.
    async fn handle_apps_list(&self, ctx: &RequestContext) -> HandlerResult {
        self.handle_unhandled(ctx).await
    }

    /// Fallback for methods without a specialised handler.
    async fn handle_unhandled(&self, ctx: &RequestContext) -> HandlerResult {
        Err(HandlerError::MethodNotFound(ctx.method().to_owned()))
    }
}

/// Dispatches a request to the matching handler method.
///
/// # Errors
///
/// Propagates the handler's protocol error.
pub async fn dispatch_request<H>(handler: &H, ctx: &RequestContext) -> HandlerResult
where
    H: AgentRequestHandler + ?Sized,
{
    match ctx.method() {
        "initialize" => handler.handle_initialize(ctx).await,
        "ping" => handler.handle_ping(ctx).await,
        "tools/list" => handler.handle_tools_list(ctx).await,
        "tools/call" => handler.handle_tools_call(ctx).await,
        "apps/list" => handler.handle_apps_list(ctx).await,
        _ => handler.handle_unhandled(ctx).await,
    }
}

/// Handles one decoded frame. Returns the response to write, or `None` for
/// notifications.
pub async fn handle_frame<H>(handler: &H, frame: Value) -> Option<Value>
where
    H: AgentRequestHandler + ?Sized,
{
    let ctx = match parse_request(frame) {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return None,
        Err((id, err)) => return Some(error_response(id, &err)),
    };

    let outcome = dispatch_request(handler, &ctx).await;
    debug!(
        method = ctx.method(),
        elapsed_ms = ctx.received_at().elapsed().as_millis(),
        ok = outcome.is_ok(),
        "agent request handled"
    );
    Some(match outcome {
        Ok(result) => success_response(ctx.id, result),
        Err(err) => error_response(ctx.id, &err),
    })
}

fn parse_request(frame: Value) -> Result<Option<RequestContext>, (Value, HandlerError)> {
    let Value::Object(mut object) = frame else {
        return Err((
            Value::Null,
            HandlerError::InvalidRequest("request must be a JSON object".into()),
        ));
    };

    let id = object.remove("id");
    let reply_id = id
        .clone()
        .filter(|id| id.is_string() || id.is_number())
        .unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err((
            reply_id,
            HandlerError::InvalidRequest("`jsonrpc` must be \"2.0\"".into()),
        ));
    }
    let Some(Value::String(method)) = object.remove("method") else {
        return Err((
            reply_id,
            HandlerError::InvalidRequest("`method` must be a string".into()),
        ));
    };

    let Some(id) = id else {
        debug!(%method, "notification ignored");
        return Ok(None);
    };
    if !(id.is_string() || id.is_number() || id.is_null()) {
        return Err((
            Value::Null,
            HandlerError::InvalidRequest("`id` must be a string, number or null".into()),
        ));
    }

    let params = object.remove("params").unwrap_or(Value::Null);
    Ok(Some(RequestContext::new(id, method, params)))
}

/// Builds a success response.
#[must_use]
pub fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

/// Builds an error response.
#[must_use]
pub fn error_response(id: Value, err: &HandlerError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": err.code(), "message": err.to_string() },
    })
}

/// Renders a tool result as a `tools/call` result.
///
/// Successful payloads are also rendered as text: strings verbatim, anything
/// else as compact JSON.
#[must_use]
pub fn call_result(result: &ToolResult) -> Value {
    if result.is_success() {
        let payload = result.payload().cloned().unwrap_or(Value::Null);
        let text = match &payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        json!({
            "content": [{ "type": "text", "text": text }],
            "payload": payload,
            "isError": false,
        })
    } else {
        let message = result.error_message().unwrap_or("tool call failed");
        let kind = result.failure_kind().map(|kind| kind.as_str());
        json!({
            "content": [{ "type": "text", "text": message }],
            "isError": true,
            "error": { "kind": kind, "message": message },
        })
    }
}

fn tool_call_params(params: &Value) -> HandlerResult<ToolInvocation> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| HandlerError::InvalidParams("`name` must be a non-empty string".into()))?;

    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(_) => {
            return Err(HandlerError::InvalidParams(
                "`arguments` must be an object".into(),
            ));
        }
    };

    Ok(ToolInvocation::new(name, arguments))
}

#[async_trait]
impl AgentRequestHandler for Broker {
    async fn handle_initialize(&self, ctx: &RequestContext) -> HandlerResult {
        let protocol = ctx
            .params()
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        Ok(json!({
            "protocolVersion": protocol,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": { "listChanged": false } },
        }))
    }

    async fn handle_tools_list(&self, _ctx: &RequestContext) -> HandlerResult {
        serde_json::to_value(self.list_tools())
            .map(|tools| json!({ "tools": tools }))
            .map_err(|err| HandlerError::Internal(err.to_string()))
    }

    async fn handle_tools_call(&self, ctx: &RequestContext) -> HandlerResult {
        let invocation = tool_call_params(ctx.params())?;
        let result = self.call_tool(invocation).await;
        Ok(call_result(&result))
    }

    async fn handle_apps_list(&self, _ctx: &RequestContext) -> HandlerResult {
        serde_json::to_value(self.apps())
            .map(|apps| json!({ "apps": apps }))
            .map_err(|err| HandlerError::Internal(err.to_string()))
    }
}

/// Serves one agent connection until its input ends.
///
/// Requests are handled concurrently; responses are written as each
/// completes.
pub async fn serve_agent<H, S, R>(handler: Arc<H>, sink: S, mut source: R)
where
    H: AgentRequestHandler + 'static,
    S: MessageSink<Value> + Clone + 'static,
    R: MessageSource<Value>,
{
    while let Some(frame) = source.recv().await {
        match frame {
            Ok(frame) => {
                let handler = Arc::clone(&handler);
                let sink = sink.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_frame(handler.as_ref(), frame).await {
                        if let Err(err) = sink.send(&response).await {
                            warn!(%err, "failed to write agent response");
                        }
                    }
                });
            }
            Err(err @ TransportError::Decode { .. }) => {
                let response = error_response(Value::Null, &HandlerError::Parse(err.to_string()));
                if let Err(err) = sink.send(&response).await {
                    warn!(%err, "failed to write agent response");
                }
            }
            Err(err) if !err.is_fatal() => {
                warn!(%err, "dropping agent frame");
            }
            Err(err) => {
                warn!(%err, "agent connection failed");
                break;
            }
        }
    }
    debug!("agent input closed");
}
