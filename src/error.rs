use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::filter_validation::ValidationFinding;

const MAX_UNRECOGNIZED_BODY_CHARS: usize = 500;

/// An error payload returned by Tableau, normalized from whichever shape
/// the responding endpoint uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("Tableau error {code}: {message}")]
pub struct RemoteError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_error_code: Option<String>,
    pub recognized: bool,
}

impl RemoteError {
    /// Parses an error body. VizQL Data Service bodies carry `errorCode`,
    /// REST bodies nest `error.{code,summary,detail}`, anything else is
    /// kept verbatim and marked unrecognized.
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        if let Some(value) = parsed.as_ref() {
            if let Some(err) = Self::from_vizql(status, value)
                .or_else(|| Self::from_rest(status, value))
                .or_else(|| Self::from_generic(status, value))
            {
                return err;
            }
        }

        let message = if body.trim().is_empty() {
            format!("Tableau responded with HTTP {status} and an empty body")
        } else {
            body.chars().take(MAX_UNRECOGNIZED_BODY_CHARS).collect()
        };
        Self {
            status: Some(status),
            code: status.to_string(),
            message,
            tab_error_code: None,
            recognized: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "TRANSPORT".to_string(),
            message: message.into(),
            tab_error_code: None,
            recognized: true,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "DECODE".to_string(),
            message: message.into(),
            tab_error_code: None,
            recognized: true,
        }
    }

    fn from_vizql(status: u16, value: &Value) -> Option<Self> {
        let code = scalar_text(value.get("errorCode")?)?;
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            status: Some(status),
            code,
            message,
            tab_error_code: value
                .get("tab-error-code")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            recognized: true,
        })
    }

    fn from_rest(status: u16, value: &Value) -> Option<Self> {
        let error = value.get("error")?;
        let code = scalar_text(error.get("code")?)?;
        let summary = error.get("summary").and_then(Value::as_str);
        let detail = error.get("detail").and_then(Value::as_str);
        let message = match (summary, detail) {
            (Some(summary), Some(detail)) => format!("{summary}: {detail}"),
            (Some(text), None) | (None, Some(text)) => text.to_string(),
            (None, None) => String::new(),
        };
        Some(Self {
            status: Some(status),
            code,
            message,
            tab_error_code: None,
            recognized: true,
        })
    }

    fn from_generic(status: u16, value: &Value) -> Option<Self> {
        let code = scalar_text(value.get("code")?)?;
        let message = value.get("message").and_then(Value::as_str)?.to_string();
        Some(Self {
            status: Some(status),
            code,
            message,
            tab_error_code: None,
            recognized: true,
        })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Every way a tool invocation can end short of success.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("The VizQL Data Service is disabled on this Tableau site or server. Ask a Tableau administrator to enable it before querying data sources.")]
    FeatureDisabled,
    #[error("{message}")]
    DatasourceNotAllowed { message: String },
    #[error("No data source named \"{name}\" was found. Check the spelling or list the available data sources first.")]
    DatasourceNotFound { name: String },
    #[error("{}", join_findings(.findings))]
    FilterValidation { findings: Vec<ValidationFinding> },
    #[error("The set of data sources that can be listed is limited by the server configuration. {total} data source(s) matched, but all of them were filtered out by that configuration.")]
    FilteredByPolicy { total: usize },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Invalid arguments: {}", .issues.join("; "))]
    InvalidArguments { issues: Vec<String> },
}

impl QueryError {
    pub fn invalid_argument(issue: impl Into<String>) -> Self {
        Self::InvalidArguments {
            issues: vec![issue.into()],
        }
    }

    /// Stable discriminant reported to callers.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::FeatureDisabled => "feature-disabled",
            Self::DatasourceNotAllowed { .. } => "datasource-not-allowed",
            Self::DatasourceNotFound { .. } => "datasource-not-found",
            Self::FilterValidation { .. } => "filter-validation",
            Self::FilteredByPolicy { .. } => "datasources-filtered-by-policy",
            Self::Remote(_) => "tableau-error",
            Self::InvalidArguments { .. } => "validation-error",
        }
    }
}

fn join_findings(findings: &[ValidationFinding]) -> String {
    findings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Final, caller-facing shape of a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tag: &'static str,
    pub text: String,
    pub is_error: bool,
    pub issues: Vec<String>,
}

impl ToolOutcome {
    pub fn success(payload: &Value) -> Self {
        Self {
            tag: "success",
            text: serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()),
            is_error: false,
            issues: Vec::new(),
        }
    }

    /// Renders an error. Remote and filter-validation errors become a JSON
    /// envelope carrying the request id; the rest stay plain text.
    pub fn from_error(err: &QueryError, request_id: &str) -> Self {
        let text = match err {
            QueryError::Remote(remote) => envelope(json!({
                "requestId": request_id,
                "errorType": err.tag(),
                "code": remote.code,
                "message": remote.message,
                "status": remote.status,
                "tabErrorCode": remote.tab_error_code,
                "recognized": remote.recognized,
            })),
            QueryError::FilterValidation { findings } => envelope(json!({
                "requestId": request_id,
                "errorType": err.tag(),
                "message": err.to_string(),
                "findings": findings,
            })),
            _ => err.to_string(),
        };

        let issues = match err {
            QueryError::InvalidArguments { issues } => issues.clone(),
            _ => Vec::new(),
        };

        Self {
            tag: err.tag(),
            text,
            is_error: true,
            issues,
        }
    }
}

fn envelope(value: Value) -> String {
    serde_json::to_string(&value).unwrap_or_else(|_| value.to_string())
}
