use std::{fmt, str::FromStr};

use chrono::DateTime;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Date,
    Flag,
}

const FIELDS: &[(&str, FieldKind)] = &[
    ("authenticationType", FieldKind::Text),
    ("connectionTo", FieldKind::Text),
    ("connectionType", FieldKind::Text),
    ("contentUrl", FieldKind::Text),
    ("createdAt", FieldKind::Date),
    ("databaseName", FieldKind::Text),
    ("description", FieldKind::Text),
    ("hasExtracts", FieldKind::Flag),
    ("isCertified", FieldKind::Flag),
    ("name", FieldKind::Text),
    ("ownerEmail", FieldKind::Text),
    ("ownerName", FieldKind::Text),
    ("projectName", FieldKind::Text),
    ("serverName", FieldKind::Text),
    ("tags", FieldKind::Text),
    ("type", FieldKind::Text),
    ("updatedAt", FieldKind::Date),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Cieq,
    In,
    Has,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOperator {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "eq" => Some(Self::Eq),
            "cieq" => Some(Self::Cieq),
            "in" => Some(Self::In),
            "has" => Some(Self::Has),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Cieq => "cieq",
            Self::In => "in",
            Self::Has => "has",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }

    fn allowed_for(&self, kind: FieldKind) -> bool {
        match kind {
            FieldKind::Text => matches!(self, Self::Eq | Self::Cieq | Self::In | Self::Has),
            FieldKind::Date => matches!(self, Self::Eq | Self::Gt | Self::Gte | Self::Lt | Self::Lte),
            FieldKind::Flag => matches!(self, Self::Eq),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListFilterError {
    #[error("filter expression is empty")]
    Empty,
    #[error("filter clause `{0}` must have the form field:operator:value")]
    Malformed(String),
    #[error("filter field `{0}` is not supported")]
    UnknownField(String),
    #[error("operator `{operator}` cannot be used with field `{field}`")]
    UnsupportedOperator { field: String, operator: String },
    #[error("value `{value}` for field `{field}` {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterClause {
    pub field: String,
    pub operator: FilterOperator,
    pub value: String,
}

/// A validated REST filter expression, `field:op:value[,field:op:value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    pub clauses: Vec<FilterClause>,
}

impl FromStr for ListFilter {
    type Err = ListFilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ListFilterError::Empty);
        }

        let clauses = split_clauses(raw)
            .into_iter()
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .clauses
            .iter()
            .map(|clause| format!("{}:{}:{}", clause.field, clause.operator.as_str(), clause.value))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&rendered)
    }
}

/// Splits on commas that are not inside an `in` list's brackets.
fn split_clauses(raw: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                clauses.push(raw[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    clauses.push(raw[start..].trim());
    clauses
}

fn parse_clause(clause: &str) -> Result<FilterClause, ListFilterError> {
    let mut parts = clause.splitn(3, ':');
    let (Some(field), Some(operator), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ListFilterError::Malformed(clause.to_string()));
    };
    let (field, operator, value) = (field.trim(), operator.trim(), value.trim());
    if field.is_empty() || value.is_empty() {
        return Err(ListFilterError::Malformed(clause.to_string()));
    }

    let Some((_, kind)) = FIELDS.iter().find(|(name, _)| *name == field) else {
        return Err(ListFilterError::UnknownField(field.to_string()));
    };

    let unsupported = || ListFilterError::UnsupportedOperator {
        field: field.to_string(),
        operator: operator.to_string(),
    };
    let operator = FilterOperator::parse(operator).ok_or_else(unsupported)?;
    if !operator.allowed_for(*kind) {
        return Err(unsupported());
    }

    let invalid = |reason| ListFilterError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason,
    };
    match (operator, kind) {
        (FilterOperator::In, _) => {
            let inner = value
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .ok_or_else(|| invalid("must be a bracketed list like [a,b]"))?;
            if inner.split(',').all(|item| item.trim().is_empty()) {
                return Err(invalid("must list at least one value"));
            }
        }
        (_, FieldKind::Date) => {
            DateTime::parse_from_rfc3339(value)
                .map_err(|_| invalid("must be an ISO 8601 timestamp such as 2024-01-01T00:00:00Z"))?;
        }
        (_, FieldKind::Flag) => {
            if !matches!(value, "true" | "false") {
                return Err(invalid("must be true or false"));
            }
        }
        _ => {}
    }

    Ok(FilterClause {
        field: field.to_string(),
        operator,
        value: value.to_string(),
    })
}
