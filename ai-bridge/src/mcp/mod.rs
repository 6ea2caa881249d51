//! JSON-RPC 2.0 over newline-delimited stdio.
//!
//! One request is read, handled and answered before the next line is read.
//! Lines that do not decode to a JSON object are dropped without a reply.

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::core::{SERVER_NAME, SERVER_VERSION, ServerContext, ToolDispatcher};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Error)]
pub enum MCPError {
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
    has_id: bool,
}

impl JsonRpcRequest {
    pub fn decode(line: &[u8]) -> Result<Self, MCPError> {
        let value: Value =
            serde_json::from_slice(line).map_err(|e| MCPError::Decode(e.to_string()))?;
        let Value::Object(mut message) = value else {
            return Err(MCPError::Decode("not a JSON object".to_string()));
        };

        let has_id = message.contains_key("id");
        let id = message.remove("id").unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = match message.remove("params") {
            Some(Value::Null) | None => json!({}),
            Some(params) => params,
        };

        Ok(Self {
            id,
            method,
            params,
            has_id,
        })
    }

    pub fn is_notification(&self) -> bool {
        !self.has_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

pub struct RequestLoop {
    context: Arc<ServerContext>,
    dispatcher: ToolDispatcher,
    state: LoopState,
}

impl RequestLoop {
    pub fn new(context: Arc<ServerContext>, dispatcher: ToolDispatcher) -> Self {
        Self {
            context,
            dispatcher,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn into_parts(self) -> (Arc<ServerContext>, ToolDispatcher) {
        (self.context, self.dispatcher)
    }

    /// Serves until end of input. Only write failures are returned as errors.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<(), MCPError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        info!(
            session = %self.context.session.id,
            started_at = %self.context.session.started_at,
            tools = self.dispatcher.catalog().len(),
            "Request loop started"
        );

        let mut line = Vec::with_capacity(4096);
        while self.state == LoopState::Running {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    debug!("End of input");
                    self.state = LoopState::Stopped;
                }
                Ok(_) => {
                    let request = match JsonRpcRequest::decode(&line) {
                        Ok(request) => request,
                        Err(e) => {
                            trace!(error = %e, "Skipping undecodable line");
                            continue;
                        }
                    };

                    if let Some(response) = self.handle(request).await {
                        let mut frame = serde_json::to_vec(&response)?;
                        frame.push(b'\n');
                        writer.write_all(&frame).await?;
                        writer.flush().await?;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from input");
                    self.state = LoopState::Stopped;
                }
            }
        }

        Ok(())
    }

    /// Routes one decoded request. Returns `None` for notifications.
    pub async fn handle(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, id = %request.id, "Handling request");

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {}
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": SERVER_VERSION
                    }
                }),
            ),
            "tools/list" => JsonRpcResponse::success(
                request.id,
                json!({ "tools": self.dispatcher.catalog().list() }),
            ),
            "tools/call" => self.call_tool(request.id, &request.params).await,
            method if request.is_notification() && method.starts_with("notifications/") => {
                return None;
            }
            method => JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        };

        Some(response)
    }

    async fn call_tool(&mut self, id: Value, params: &Value) -> JsonRpcResponse {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let outcome = AssertUnwindSafe(self.dispatcher.invoke(name, &arguments))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => match serde_json::to_value(result) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {e}")),
            },
            Ok(Err(e)) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(tool = name, %message, "Tool call panicked");
                JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {message}"))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
