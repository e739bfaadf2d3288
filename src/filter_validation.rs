use std::fmt;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::QueryError,
    query::{FieldSpec, Filter, FilterField, StructuredQuery},
    tableau::{DatasourceRef, QueryOptions, QueryRequest, TableauApi},
};

pub const DEFAULT_FILTER_VALIDATION_CONCURRENCY: usize = 8;

/// A filter value that does not occur in its field's observed domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    pub field_name: String,
    pub offending_value: String,
    pub reason: String,
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// What a single lookup asks about one field.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueProbe {
    Member(Value),
    Pattern {
        starts_with: Option<String>,
        ends_with: Option<String>,
        contains: Option<String>,
    },
}

impl ValueProbe {
    fn describe(&self) -> String {
        match self {
            Self::Member(value) => display_value(value),
            Self::Pattern {
                starts_with,
                ends_with,
                contains,
            } => {
                let mut parts = Vec::new();
                if let Some(prefix) = starts_with {
                    parts.push(format!("startsWith \"{prefix}\""));
                }
                if let Some(suffix) = ends_with {
                    parts.push(format!("endsWith \"{suffix}\""));
                }
                if let Some(infix) = contains {
                    parts.push(format!("contains \"{infix}\""));
                }
                parts.join(", ")
            }
        }
    }

    fn finding(&self, field: &FilterField) -> ValidationFinding {
        let caption = &field.field_caption;
        let described = self.describe();
        let reason = match self {
            Self::Member(_) => {
                format!("Filter value \"{described}\" does not exist in field \"{caption}\".")
            }
            Self::Pattern { .. } => {
                format!("No values of field \"{caption}\" match the pattern {described}.")
            }
        };
        ValidationFinding {
            field_name: caption.clone(),
            offending_value: described,
            reason,
        }
    }
}

/// Answers "does this value occur for this field" against live data.
#[async_trait]
pub trait FieldValueLookup: Send + Sync {
    async fn value_exists(&self, field: &FilterField, probe: &ValueProbe)
        -> Result<bool, QueryError>;
}

/// Expands the filters that have a fixed value domain into probes, in
/// input order. Range, relative-date and top-N filters have nothing to
/// check and are skipped.
pub fn collect_probes(query: &StructuredQuery) -> Vec<(FilterField, ValueProbe)> {
    let mut probes = Vec::new();
    for filter in &query.filters {
        match filter {
            Filter::Set { field, values, .. } => {
                for value in values {
                    probes.push((field.clone(), ValueProbe::Member(value.clone())));
                }
            }
            Filter::Match {
                field,
                starts_with,
                ends_with,
                contains,
                ..
            } => probes.push((
                field.clone(),
                ValueProbe::Pattern {
                    starts_with: starts_with.clone(),
                    ends_with: ends_with.clone(),
                    contains: contains.clone(),
                },
            )),
            Filter::QuantitativeNumerical { .. }
            | Filter::QuantitativeDate { .. }
            | Filter::RelativeDate { .. }
            | Filter::Top { .. } => {}
        }
    }
    probes
}

/// Runs the lookups with at most `concurrency` in flight and returns all
/// findings in filter order. A lookup error aborts validation with the
/// first error in input order.
pub async fn validate_filter_values(
    query: &StructuredQuery,
    lookup: &dyn FieldValueLookup,
    concurrency: usize,
) -> Result<Vec<ValidationFinding>, QueryError> {
    let probes = collect_probes(query);
    if probes.is_empty() {
        return Ok(Vec::new());
    }

    debug!(probes = probes.len(), concurrency, "Validating filter values");
    let lookups: Vec<_> = probes
        .iter()
        .map(|(field, probe)| lookup.value_exists(field, probe))
        .collect();
    let results = stream::iter(lookups)
    .buffered(concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut findings = Vec::new();
    for ((field, probe), result) in probes.iter().zip(results) {
        if !result? {
            findings.push(probe.finding(field));
        }
    }
    Ok(findings)
}

/// Lookup backed by single-row probe queries against the datasource.
pub struct DatasourceValueLookup<'a> {
    api: &'a dyn TableauApi,
    datasource: &'a DatasourceRef,
}

impl<'a> DatasourceValueLookup<'a> {
    pub fn new(api: &'a dyn TableauApi, datasource: &'a DatasourceRef) -> Self {
        Self { api, datasource }
    }

    fn probe_query(field: &FilterField, probe: &ValueProbe) -> StructuredQuery {
        let filter = match probe {
            ValueProbe::Member(value) => Filter::Set {
                field: field.clone(),
                values: vec![value.clone()],
                exclude: false,
            },
            ValueProbe::Pattern {
                starts_with,
                ends_with,
                contains,
            } => Filter::Match {
                field: field.clone(),
                starts_with: starts_with.clone(),
                ends_with: ends_with.clone(),
                contains: contains.clone(),
                exclude: false,
            },
        };
        StructuredQuery {
            fields: vec![FieldSpec::caption(field.field_caption.clone())],
            filters: vec![filter],
            row_limit: Some(1),
        }
    }
}

#[async_trait]
impl FieldValueLookup for DatasourceValueLookup<'_> {
    async fn value_exists(
        &self,
        field: &FilterField,
        probe: &ValueProbe,
    ) -> Result<bool, QueryError> {
        let request = QueryRequest {
            datasource: self.datasource.clone(),
            query: Self::probe_query(field, probe),
            options: QueryOptions::default(),
        };
        let payload = self.api.query_datasource(&request).await?;
        Ok(payload
            .get("data")
            .and_then(Value::as_array)
            .is_some_and(|rows| !rows.is_empty()))
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
