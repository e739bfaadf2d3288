use std::time::Instant;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::authorize,
    config::QuerySettings,
    error::{QueryError, ToolOutcome},
    list_filter::ListFilter,
    orchestrator::{ListRequest, NaturalLanguageRequest, QueryOrchestrator},
    query::StructuredQuery,
    tableau::TableauApi,
    AppState,
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const QUERY_DATASOURCE: &str = "query-datasource";
const QUERY_BY_NAME: &str = "query-datasource-by-name";
const LIST_DATASOURCES: &str = "list-datasources";
const GET_METADATA: &str = "get-datasource-metadata";

const DEFAULT_NL_LIMIT: u64 = 20;
const MAX_NL_LIMIT: u64 = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// A tool call whose arguments passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    QueryDatasource {
        datasource_luid: String,
        query: StructuredQuery,
    },
    QueryByName(NaturalLanguageRequest),
    ListDatasources(ListRequest),
    GetMetadata {
        datasource_luid: String,
    },
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let query = &state.config.query;
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "tableauServer": state.config.tableau.server,
        "boundedContext": !query.bounded_context.is_unrestricted(),
        "filterValidation": !query.disable_filter_validation,
    }))
}

pub async fn mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return jsonrpc_error(
            request_id,
            -32600,
            "jsonrpc must be 2.0",
            json!({"code": "INVALID_REQUEST"}),
            StatusCode::BAD_REQUEST,
        );
    }

    if let Err(err) = authorize(&headers, &state.config.api_key) {
        return jsonrpc_error(
            request_id,
            -32001,
            err.to_string(),
            json!({"code": "UNAUTHORIZED"}),
            StatusCode::UNAUTHORIZED,
        );
    }

    let response = match request.method.as_str() {
        "ping" => jsonrpc_ok(request_id, json!({})),
        "initialize" => jsonrpc_ok(
            request_id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
            }),
        ),
        "tools/list" => jsonrpc_ok(request_id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let Some(params) = request
                .params
                .as_ref()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value.clone()).ok())
            else {
                return jsonrpc_error(
                    request_id,
                    -32602,
                    "Invalid tool call parameters",
                    json!({"code": "INVALID_ARGUMENT"}),
                    StatusCode::BAD_REQUEST,
                );
            };

            if !TOOL_NAMES.contains(&params.name.as_str()) {
                return jsonrpc_error(
                    request_id,
                    -32602,
                    format!("Unsupported tool: {}", params.name),
                    json!({"code": "INVALID_ARGUMENT"}),
                    StatusCode::BAD_REQUEST,
                );
            }

            let result = call_tool(&state, &params.name, &params.arguments).await;
            jsonrpc_ok(request_id, result)
        }
        _ => jsonrpc_error(
            request_id,
            -32601,
            "Method not found",
            json!({"code": "METHOD_NOT_FOUND"}),
            StatusCode::NOT_FOUND,
        ),
    };

    debug!(method = %request.method, "MCP request handled");
    response
}

async fn call_tool(state: &AppState, tool: &str, args: &Value) -> Value {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    info!(request_id = %request_id, tool = %tool, "Tool call received");

    let outcome = match parse_tool_call(tool, args) {
        Err(err) => ToolOutcome::from_error(&err, &request_id),
        Ok(call) => match state.tableau.sign_in().await {
            Err(err) => ToolOutcome::from_error(&QueryError::Remote(err), &request_id),
            Ok(session) => {
                let outcome = run_tool(&session, &state.config.query, &request_id, &call).await;
                session.sign_out().await;
                outcome
            }
        },
    };

    let envelope = tool_result(&outcome, tool, &request_id, start.elapsed().as_millis());
    if state.config.dev_log_payloads {
        let bytes = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
        debug!(request_id = %request_id, tool = %tool, response_bytes = bytes, "MCP tool response payload");
    }
    envelope
}

/// Runs a validated call through the pipeline and translates the result.
pub async fn run_tool(
    api: &dyn TableauApi,
    settings: &QuerySettings,
    request_id: &str,
    call: &ToolCall,
) -> ToolOutcome {
    let orchestrator = QueryOrchestrator::new(api, settings, request_id);
    let result = match call {
        ToolCall::QueryDatasource {
            datasource_luid,
            query,
        } => orchestrator.query_datasource(datasource_luid, query).await,
        ToolCall::QueryByName(request) => orchestrator.query_by_name(request).await,
        ToolCall::ListDatasources(request) => orchestrator
            .list_datasources(request)
            .await
            .map(|datasources| json!({ "datasources": datasources })),
        ToolCall::GetMetadata { datasource_luid } => orchestrator
            .read_metadata(datasource_luid)
            .await
            .map(|metadata| json!(metadata)),
    };
    orchestrator.translate(result)
}

fn tool_result(outcome: &ToolOutcome, tool: &str, request_id: &str, elapsed_ms: u128) -> Value {
    let mut meta = json!({
        "requestId": request_id,
        "tool": tool,
        "outcome": outcome.tag,
        "timingMs": elapsed_ms,
    });
    if !outcome.issues.is_empty() {
        meta["issues"] = json!(outcome.issues);
    }
    json!({
        "content": [{ "type": "text", "text": outcome.text }],
        "isError": outcome.is_error,
        "_meta": meta,
    })
}

/// Validates arguments before anything touches Tableau. All problems are
/// reported together.
pub fn parse_tool_call(tool: &str, args: &Value) -> Result<ToolCall, QueryError> {
    let mut issues = Vec::new();
    let call = match tool {
        QUERY_DATASOURCE => {
            let datasource_luid = require_str(args, "datasourceLuid", &mut issues);
            let query = parse_query(args, &mut issues);
            datasource_luid
                .zip(query)
                .map(|(datasource_luid, query)| ToolCall::QueryDatasource {
                    datasource_luid,
                    query,
                })
        }
        QUERY_BY_NAME => {
            let datasource_name = require_str(args, "datasourceName", &mut issues);
            let question = require_str(args, "question", &mut issues);
            let limit = match optional_positive(args, "limit", &mut issues) {
                Some(None) => Some(DEFAULT_NL_LIMIT),
                Some(Some(limit)) if limit <= MAX_NL_LIMIT => Some(limit),
                Some(Some(_)) => {
                    issues.push(format!("limit must be between 1 and {MAX_NL_LIMIT}"));
                    None
                }
                None => None,
            };
            match (datasource_name, question, limit) {
                (Some(datasource_name), Some(question), Some(limit)) => {
                    Some(ToolCall::QueryByName(NaturalLanguageRequest {
                        datasource_name,
                        question,
                        limit: u32::try_from(limit).unwrap_or(u32::MAX),
                    }))
                }
                _ => None,
            }
        }
        LIST_DATASOURCES => {
            let filter = match args.get("filter") {
                None | Some(Value::Null) => Some(None),
                Some(Value::String(raw)) => match raw.parse::<ListFilter>() {
                    Ok(filter) => Some(Some(filter)),
                    Err(err) => {
                        issues.push(format!("filter: {err}"));
                        None
                    }
                },
                Some(_) => {
                    issues.push("filter must be a string".to_string());
                    None
                }
            };
            let page_size = optional_positive(args, "pageSize", &mut issues);
            let limit = optional_positive(args, "limit", &mut issues);
            match (filter, page_size, limit) {
                (Some(filter), Some(page_size), Some(limit)) => {
                    Some(ToolCall::ListDatasources(ListRequest {
                        filter,
                        page_size: page_size.map(|size| u32::try_from(size).unwrap_or(u32::MAX)),
                        limit: limit.map(|limit| usize::try_from(limit).unwrap_or(usize::MAX)),
                    }))
                }
                _ => None,
            }
        }
        GET_METADATA => require_str(args, "datasourceLuid", &mut issues)
            .map(|datasource_luid| ToolCall::GetMetadata { datasource_luid }),
        other => {
            issues.push(format!("Unsupported tool: {other}"));
            None
        }
    };

    match call {
        Some(call) if issues.is_empty() => Ok(call),
        _ => Err(QueryError::InvalidArguments { issues }),
    }
}

fn require_str(args: &Value, field: &str, issues: &mut Vec<String>) -> Option<String> {
    let value = args
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    if value.is_none() {
        issues.push(format!("{field} must be a non-empty string"));
    }
    value
}

/// `Some(None)` when absent, `Some(Some(n))` when a positive integer,
/// `None` (with an issue recorded) otherwise.
fn optional_positive(args: &Value, field: &str, issues: &mut Vec<String>) -> Option<Option<u64>> {
    match args.get(field) {
        None | Some(Value::Null) => Some(None),
        Some(value) => match value.as_u64().filter(|n| *n > 0) {
            Some(n) => Some(Some(n)),
            None => {
                issues.push(format!("{field} must be a positive integer"));
                None
            }
        },
    }
}

fn parse_query(args: &Value, issues: &mut Vec<String>) -> Option<StructuredQuery> {
    let Some(raw) = args.get("query").filter(|v| v.is_object()) else {
        issues.push("query must be an object".to_string());
        return None;
    };
    let query = match serde_json::from_value::<StructuredQuery>(raw.clone()) {
        Ok(query) => query,
        Err(err) => {
            issues.push(format!("query: {err}"));
            return None;
        }
    };
    if let Err(query_issues) = query.validate() {
        issues.extend(query_issues);
        return None;
    }
    Some(query)
}

const TOOL_NAMES: [&str; 4] = [QUERY_DATASOURCE, QUERY_BY_NAME, LIST_DATASOURCES, GET_METADATA];

fn tool_definitions() -> Vec<Value> {
    vec![
        tool_def(
            QUERY_DATASOURCE,
            "Run a structured VizQL query against a published data source. Filter values are checked against the data before the query runs.",
            json!({
                "type": "object",
                "required": ["datasourceLuid", "query"],
                "properties": {
                    "datasourceLuid": {"type": "string", "minLength": 1},
                    "query": {
                        "type": "object",
                        "required": ["fields"],
                        "properties": {
                            "fields": {"type": "array", "minItems": 1, "items": {
                                "type": "object",
                                "required": ["fieldCaption"],
                                "properties": {
                                    "fieldCaption": {"type": "string"},
                                    "function": {"type": "string"},
                                    "fieldAlias": {"type": "string"},
                                    "maxDecimalPlaces": {"type": "integer"},
                                    "sortDirection": {"enum": ["ASC", "DESC"]},
                                    "sortPriority": {"type": "integer"}
                                }
                            }},
                            "filters": {"type": "array", "items": {
                                "type": "object",
                                "required": ["filterType", "field"],
                                "properties": {
                                    "filterType": {"enum": ["SET", "MATCH", "QUANTITATIVE_NUMERICAL", "QUANTITATIVE_DATE", "DATE", "TOP"]},
                                    "field": {"type": "object"}
                                }
                            }},
                            "rowLimit": {"type": "integer", "minimum": 1}
                        }
                    }
                }
            }),
        ),
        tool_def(
            QUERY_BY_NAME,
            "Answer a question about a data source found by name. Runs a conservative count query; the question is not parsed into filters or groupings.",
            json!({
                "type": "object",
                "required": ["datasourceName", "question"],
                "properties": {
                    "datasourceName": {"type": "string", "minLength": 1},
                    "question": {"type": "string", "minLength": 1},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_NL_LIMIT, "default": DEFAULT_NL_LIMIT}
                }
            }),
        ),
        tool_def(
            LIST_DATASOURCES,
            "List published data sources, optionally filtered with field:operator:value expressions.",
            json!({
                "type": "object",
                "properties": {
                    "filter": {"type": "string"},
                    "pageSize": {"type": "integer", "minimum": 1},
                    "limit": {"type": "integer", "minimum": 1}
                }
            }),
        ),
        tool_def(
            GET_METADATA,
            "Describe the fields of a published data source.",
            json!({
                "type": "object",
                "required": ["datasourceLuid"],
                "properties": {"datasourceLuid": {"type": "string", "minLength": 1}}
            }),
        ),
    ]
}

fn tool_def(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
        "annotations": {"readOnlyHint": true},
    })
}

fn jsonrpc_ok(id: Value, result: Value) -> Response {
    let payload = JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    };
    (StatusCode::OK, Json(payload)).into_response()
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
) -> Response {
    let payload = JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data,
        },
    };
    (status, Json(payload)).into_response()
}
