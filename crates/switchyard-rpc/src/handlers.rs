//! Built-in method handlers: initialize, ping, tools/list, tools/call.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use crate::engine::{EngineContext, MethodHandler, MethodRegistry};
use crate::errors::RpcError;

/// Protocol revision answered when the client does not name one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Register every built-in handler with the registry.
pub fn register_builtin(registry: &mut MethodRegistry) {
    registry.register("initialize", InitializeHandler);
    registry.register("ping", PingHandler);
    registry.register("tools/list", ListToolsHandler);
    registry.register("tools/call", CallToolHandler);
}

/// Handshake: echoes the client's protocol version and advertises capabilities.
pub struct InitializeHandler;

#[async_trait]
impl MethodHandler for InitializeHandler {
    #[instrument(skip_all, fields(method = "initialize"))]
    async fn handle(&self, params: Option<Value>, ctx: &EngineContext) -> Result<Value, RpcError> {
        let protocol_version = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);

        Ok(json!({
            "protocolVersion": protocol_version,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": {
                "name": ctx.info.name,
                "version": ctx.info.version,
            },
        }))
    }
}

/// Liveness check. Returns an empty object.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    async fn handle(&self, _params: Option<Value>, _ctx: &EngineContext) -> Result<Value, RpcError> {
        Ok(json!({}))
    }
}

/// Lists registered tools.
pub struct ListToolsHandler;

#[async_trait]
impl MethodHandler for ListToolsHandler {
    #[instrument(skip_all, fields(method = "tools/list"))]
    async fn handle(&self, _params: Option<Value>, ctx: &EngineContext) -> Result<Value, RpcError> {
        Ok(json!({ "tools": ctx.tools.descriptors() }))
    }
}

#[derive(Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Invokes a tool by name.
///
/// Tool failures are reported in-band with `isError: true`. Unknown tools and
/// bad params are protocol errors.
pub struct CallToolHandler;

#[async_trait]
impl MethodHandler for CallToolHandler {
    #[instrument(skip_all, fields(method = "tools/call"))]
    async fn handle(&self, params: Option<Value>, ctx: &EngineContext) -> Result<Value, RpcError> {
        let params: CallToolParams = serde_json::from_value(params.unwrap_or(Value::Null))?;
        let tool = ctx.tools.get(&params.name).ok_or_else(|| RpcError::InvalidParams {
            message: format!("Unknown tool: {}", params.name),
        })?;

        let (text, is_error) = match tool.call(params.arguments).await {
            Ok(text) => (text, false),
            Err(err) => {
                tracing::debug!(tool = %params.name, error = %err, "tool call failed");
                (err.to_string(), true)
            }
        };

        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }))
    }
}
