//! JSON-RPC 2.0 tool dispatch for `POST /mcp`.
//!
//! Envelope handling (parse, method lookup, standard error codes) lives
//! here; each tool handler validates its arguments, calls into the store,
//! and shapes a result object. Domain failures surface as JSON-RPC errors
//! whose `data.kind` carries the stable error taxonomy.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::timeout;
use uuid::Uuid;

use receiptgate_core::{parse_receipt, validate_receipt, Phase, ReceiptGateError};
use receiptgate_store::{
    walk_chain, ChainDirection, Cursor, ReceiptStore, SearchFilter, SortOrder, MAX_CHAIN_DEPTH,
};

use crate::config::Config;

pub const RECEIPT_SCHEMA_VERSION: &str = "1.0";

pub const TOOL_NAMES: [&str; 9] = [
    "receiptgate.health",
    "receiptgate.submit_receipt",
    "receiptgate.get_receipt",
    "receiptgate.get_receipt_chain",
    "receiptgate.list_inbox",
    "receiptgate.list_task_receipts",
    "receiptgate.search_receipts",
    "receiptgate.stats",
    "receiptgate.bootstrap",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ReceiptStore>,
}

/// JSON-RPC request envelope.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[must_use]
pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

#[must_use]
pub fn rpc_error(id: Value, err: &ReceiptGateError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": err.jsonrpc_code(),
            "message": err.to_string(),
            "data": err.data(),
        },
    })
}

/// Standard-code envelope error (-32600/-32601/-32602/-32700).
#[must_use]
pub fn envelope_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

pub async fn handle_rpc(state: &AppState, request: RpcRequest) -> Value {
    let id = request.id.clone();
    if request.jsonrpc.as_deref() != Some("2.0") {
        return envelope_error(id, -32600, "invalid JSON-RPC envelope: jsonrpc must be \"2.0\"");
    }

    match request.method.as_str() {
        "tools/list" => rpc_result(id, json!({ "tools": tool_catalog() })),
        "tools/call" => {
            let Some(name) = request.params.get("name").and_then(Value::as_str) else {
                return envelope_error(id, -32602, "missing tool name");
            };
            if !TOOL_NAMES.contains(&name) {
                return envelope_error(id, -32601, &format!("unknown tool: {name}"));
            }
            let default_args = json!({});
            let args = request.params.get("arguments").unwrap_or(&default_args);
            // Each tool call inherits the configured deadline; on expiry the
            // in-flight transaction rolls back and Timeout is surfaced.
            match timeout(state.config.request_timeout, call_tool(state, name, args)).await {
                Err(_) => rpc_error(id, &ReceiptGateError::Timeout),
                Ok(Ok(result)) => rpc_result(id, result),
                Ok(Err(err)) => rpc_error(id, &err),
            }
        }
        other => envelope_error(id, -32601, &format!("method not found: {other}")),
    }
}

async fn call_tool(
    state: &AppState,
    name: &str,
    args: &Value,
) -> Result<Value, ReceiptGateError> {
    match name {
        "receiptgate.health" => health(state).await,
        "receiptgate.submit_receipt" => submit_receipt(state, args).await,
        "receiptgate.get_receipt" => get_receipt(state, args).await,
        "receiptgate.get_receipt_chain" => get_receipt_chain(state, args).await,
        "receiptgate.list_inbox" => list_inbox(state, args).await,
        "receiptgate.list_task_receipts" => list_task_receipts(state, args).await,
        "receiptgate.search_receipts" => search_receipts(state, args).await,
        "receiptgate.stats" => stats(state).await,
        "receiptgate.bootstrap" => bootstrap(state, args).await,
        other => Err(ReceiptGateError::Internal(format!(
            "tool {other} listed but not dispatched"
        ))),
    }
}

async fn health(state: &AppState) -> Result<Value, ReceiptGateError> {
    state.store.ping().await?;
    Ok(health_payload(&state.config))
}

#[must_use]
pub fn health_payload(config: &Config) -> Value {
    json!({
        "status": "healthy",
        "service": "ReceiptGate",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": config.service_name,
    })
}

async fn submit_receipt(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let Some(receipt_value) = args.get("receipt") else {
        return Err(ReceiptGateError::single_validation(
            "receipt",
            "required",
            "receipt object is required",
        ));
    };
    let draft = parse_receipt(receipt_value)?;
    let candidate = validate_receipt(draft, state.config.receipt_body_max_bytes)?;
    let outcome = state.store.submit(candidate).await?;
    Ok(json!({
        "receipt": outcome.receipt,
        "idempotent_replay": outcome.idempotent_replay,
    }))
}

async fn get_receipt(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let receipt = match (optional_str(args, "receipt_id")?, optional_str(args, "uuid")?) {
        (Some(receipt_id), _) => state.store.get_by_receipt_id(receipt_id).await?,
        (None, Some(raw)) => {
            let uuid = Uuid::parse_str(raw).map_err(|_| {
                ReceiptGateError::single_validation("uuid", "format", "uuid is not a valid UUID")
            })?;
            state.store.get_by_uuid(uuid).await?
        }
        (None, None) => {
            return Err(ReceiptGateError::single_validation(
                "receipt_id",
                "required",
                "receipt_id or uuid is required",
            ));
        }
    };
    let receipt = receipt.ok_or(ReceiptGateError::NotFound)?;
    Ok(serde_json::to_value(receipt)?)
}

async fn get_receipt_chain(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let receipt_id = require_str(args, "receipt_id")?;
    let direction = match optional_str(args, "direction")? {
        None => ChainDirection::default(),
        Some(raw) => ChainDirection::parse(raw).ok_or_else(|| {
            ReceiptGateError::single_validation(
                "direction",
                "enum",
                "direction must be one of ancestors, descendants, both",
            )
        })?,
    };
    let max_depth = optional_usize(args, "max_depth")?
        .unwrap_or(state.config.chain_max_depth)
        .clamp(1, MAX_CHAIN_DEPTH);

    let chain = walk_chain(state.store.as_ref(), receipt_id, direction, max_depth).await?;
    Ok(json!({
        "receipt_id": receipt_id,
        "direction": direction.as_str(),
        "max_depth": max_depth,
        "chain": chain,
    }))
}

async fn list_inbox(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let recipient_ai = require_str(args, "recipient_ai")?;
    let limit = clamp_limit(state, optional_usize(args, "limit")?);
    let cursor = optional_str(args, "cursor")?.map(Cursor::decode).transpose()?;

    let page = state.store.list_inbox(recipient_ai, limit, cursor).await?;
    Ok(json!({
        "recipient_ai": recipient_ai,
        "count": page.items.len(),
        "receipts": page.items,
        "next_cursor": page.next_cursor,
    }))
}

async fn list_task_receipts(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let task_id = require_str(args, "task_id")?;
    let sort = match optional_str(args, "sort")? {
        None => SortOrder::Asc,
        Some(raw) => SortOrder::parse(raw).ok_or_else(|| {
            ReceiptGateError::single_validation("sort", "enum", "sort must be asc or desc")
        })?,
    };
    let limit = optional_usize(args, "limit")?;

    let receipts = state.store.list_task_receipts(task_id, sort, limit).await?;
    Ok(json!({
        "task_id": task_id,
        "count": receipts.len(),
        "receipts": receipts,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    recipient_ai: Option<String>,
    created_by: Option<String>,
    phase: Option<String>,
    obligation_id: Option<String>,
    task_id: Option<String>,
    since: Option<String>,
    until: Option<String>,
    receipt_id_contains: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

async fn search_receipts(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let args: SearchArgs = serde_json::from_value(args.clone()).map_err(|err| {
        ReceiptGateError::single_validation("filters", "structure", err.to_string())
    })?;

    let phase = args
        .phase
        .as_deref()
        .map(|raw| {
            Phase::parse(raw).ok_or_else(|| {
                ReceiptGateError::single_validation(
                    "phase",
                    "enum",
                    "phase must be one of accepted, complete, escalate",
                )
            })
        })
        .transpose()?;
    let filter = SearchFilter {
        recipient_ai: args.recipient_ai,
        created_by: args.created_by,
        phase,
        obligation_id: args.obligation_id,
        task_id: args.task_id,
        since: args.since.as_deref().map(parse_timestamp).transpose()?,
        until: args.until.as_deref().map(parse_timestamp).transpose()?,
        receipt_id_contains: args.receipt_id_contains,
    };
    let limit = clamp_limit(state, args.limit);
    let cursor = args.cursor.as_deref().map(Cursor::decode).transpose()?;

    let page = state.store.search(&filter, limit, cursor).await?;
    Ok(json!({
        "count": page.items.len(),
        "receipts": page.items,
        "next_cursor": page.next_cursor,
    }))
}

async fn stats(state: &AppState) -> Result<Value, ReceiptGateError> {
    let stats = state.store.stats().await?;
    Ok(serde_json::to_value(stats)?)
}

async fn bootstrap(state: &AppState, args: &Value) -> Result<Value, ReceiptGateError> {
    let agent_name = require_str(args, "agent_name")?;
    let session_id = require_str(args, "session_id")?;

    let inbox = state
        .store
        .list_inbox(agent_name, state.config.search_default_limit, None)
        .await?;
    Ok(json!({
        "tenant_id": state.config.default_tenant_id,
        "agent_name": agent_name,
        "session_id": session_id,
        "config": {
            "receipt_schema_version": RECEIPT_SCHEMA_VERSION,
            "capabilities": ["receipts", "audit"],
        },
        "inbox": {
            "recipient_ai": agent_name,
            "count": inbox.items.len(),
            "receipts": inbox.items,
            "next_cursor": inbox.next_cursor,
        },
    }))
}

fn clamp_limit(state: &AppState, requested: Option<usize>) -> usize {
    requested
        .unwrap_or(state.config.search_default_limit)
        .clamp(1, state.config.search_max_limit)
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, ReceiptGateError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| {
        ReceiptGateError::single_validation(
            "since",
            "format",
            format!("not an RFC3339 timestamp: {raw}"),
        )
    })
}

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ReceiptGateError> {
    optional_str(args, field)?.ok_or_else(|| {
        ReceiptGateError::single_validation(field, "required", format!("{field} is required"))
    })
}

fn optional_str<'a>(args: &'a Value, field: &str) -> Result<Option<&'a str>, ReceiptGateError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(_) => Err(ReceiptGateError::single_validation(
            field,
            "type",
            format!("{field} must be a string"),
        )),
    }
}

fn optional_usize(args: &Value, field: &str) -> Result<Option<usize>, ReceiptGateError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                ReceiptGateError::single_validation(
                    field,
                    "type",
                    format!("{field} must be a non-negative integer"),
                )
            }),
    }
}

/// The MCP tool catalogue served by `tools/list`.
#[must_use]
pub fn tool_catalog() -> Value {
    json!([
        {
            "name": "receiptgate.health",
            "description": "Health check / service info",
            "inputSchema": { "type": "object", "properties": {} },
        },
        {
            "name": "receiptgate.submit_receipt",
            "description": "Append a receipt to the ledger (idempotent on canonical hash)",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "receipt": { "type": "object", "description": "Receipt payload" },
                },
                "required": ["receipt"],
            },
        },
        {
            "name": "receiptgate.get_receipt",
            "description": "Retrieve one receipt by receipt_id or uuid",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "receipt_id": { "type": "string" },
                    "uuid": { "type": "string" },
                },
            },
        },
        {
            "name": "receiptgate.get_receipt_chain",
            "description": "Walk the causal chain around a receipt",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "receipt_id": { "type": "string" },
                    "direction": { "type": "string", "enum": ["ancestors", "descendants", "both"] },
                    "max_depth": { "type": "integer", "minimum": 1, "maximum": 1024 },
                },
                "required": ["receipt_id"],
            },
        },
        {
            "name": "receiptgate.list_inbox",
            "description": "Open obligations for a recipient",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "recipient_ai": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 500 },
                    "cursor": { "type": "string" },
                },
                "required": ["recipient_ai"],
            },
        },
        {
            "name": "receiptgate.list_task_receipts",
            "description": "All receipts recorded against a task",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "sort": { "type": "string", "enum": ["asc", "desc"] },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 500 },
                },
                "required": ["task_id"],
            },
        },
        {
            "name": "receiptgate.search_receipts",
            "description": "Header-only receipt search; filters AND together",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "recipient_ai": { "type": "string" },
                    "created_by": { "type": "string" },
                    "phase": { "type": "string", "enum": ["accepted", "complete", "escalate"] },
                    "obligation_id": { "type": "string" },
                    "task_id": { "type": "string" },
                    "since": { "type": "string", "description": "RFC3339 timestamp, inclusive" },
                    "until": { "type": "string", "description": "RFC3339 timestamp, exclusive" },
                    "receipt_id_contains": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 500 },
                    "cursor": { "type": "string" },
                },
                "additionalProperties": false,
            },
        },
        {
            "name": "receiptgate.stats",
            "description": "Ledger totals by phase and top recipients",
            "inputSchema": { "type": "object", "properties": {} },
        },
        {
            "name": "receiptgate.bootstrap",
            "description": "Initialise a session: tenant, config, and the caller's inbox",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "agent_name": { "type": "string" },
                    "session_id": { "type": "string" },
                },
                "required": ["agent_name", "session_id"],
            },
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonschema::JSONSchema;

    fn compiled_schema(tool_name: &str) -> JSONSchema {
        let catalog = tool_catalog();
        let tool = catalog
            .as_array()
            .and_then(|tools| tools.iter().find(|tool| tool["name"] == tool_name))
            .unwrap_or_else(|| panic!("tool {tool_name} missing from catalogue"));
        JSONSchema::compile(&tool["inputSchema"])
            .unwrap_or_else(|err| panic!("schema for {tool_name} does not compile: {err}"))
    }

    #[test]
    fn every_tool_schema_compiles() {
        for name in TOOL_NAMES {
            let _ = compiled_schema(name);
        }
    }

    #[test]
    fn catalogue_and_dispatch_agree_on_tool_names() {
        let catalog = tool_catalog();
        let names: Vec<&str> = catalog
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| tool["name"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(names, TOOL_NAMES.to_vec());
    }

    #[test]
    fn submit_schema_requires_the_receipt_object() {
        let schema = compiled_schema("receiptgate.submit_receipt");
        assert!(schema.is_valid(&json!({"receipt": {}})));
        assert!(!schema.is_valid(&json!({})));
    }

    #[test]
    fn inbox_schema_requires_recipient_and_bounds_limit() {
        let schema = compiled_schema("receiptgate.list_inbox");
        assert!(schema.is_valid(&json!({"recipient_ai": "alice", "limit": 50})));
        assert!(!schema.is_valid(&json!({"limit": 50})));
        assert!(!schema.is_valid(&json!({"recipient_ai": "alice", "limit": 0})));
        assert!(!schema.is_valid(&json!({"recipient_ai": "alice", "limit": 501})));
    }

    #[test]
    fn chain_schema_constrains_direction_and_depth() {
        let schema = compiled_schema("receiptgate.get_receipt_chain");
        assert!(schema.is_valid(&json!({"receipt_id": "r1", "direction": "both"})));
        assert!(!schema.is_valid(&json!({"receipt_id": "r1", "direction": "sideways"})));
        assert!(!schema.is_valid(&json!({"receipt_id": "r1", "max_depth": 4096})));
        assert!(!schema.is_valid(&json!({"direction": "ancestors"})));
    }

    #[test]
    fn search_schema_rejects_unknown_axes() {
        let schema = compiled_schema("receiptgate.search_receipts");
        assert!(schema.is_valid(&json!({"recipient_ai": "alice", "phase": "accepted"})));
        assert!(!schema.is_valid(&json!({"phase": "cancel"})));
        assert!(!schema.is_valid(&json!({"color": "red"})));
    }
}
