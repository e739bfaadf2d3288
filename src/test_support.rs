use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    error::RemoteError,
    models::{Datasource, MetadataResponse, Page, PaginationMeta, ProjectRef},
    query::Filter,
    tableau::{DatasourceRef, QueryDatasourceError, QueryRequest, TableauApi},
};

pub fn datasource(id: &str, name: &str, project: &str) -> Datasource {
    Datasource {
        id: id.to_string(),
        name: name.to_string(),
        project: ProjectRef {
            id: project.to_string(),
            name: format!("Project {project}"),
        },
        description: None,
    }
}

#[derive(Debug, Clone)]
pub enum QueryBehavior {
    Rows(Vec<Value>),
    FeatureDisabled,
    Remote(RemoteError),
}

/// In-memory Tableau site. Single-filter, single-row queries are treated
/// as value probes and answered from `known_values`.
#[derive(Debug)]
pub struct FakeTableau {
    pub datasources: Vec<Datasource>,
    pub metadata: HashMap<String, MetadataResponse>,
    pub known_values: HashMap<String, Vec<String>>,
    pub behavior: QueryBehavior,
    list_calls: AtomicUsize,
    queries: Mutex<Vec<QueryRequest>>,
}

impl FakeTableau {
    pub fn with_datasources(datasources: Vec<Datasource>) -> Self {
        Self {
            datasources,
            metadata: HashMap::new(),
            known_values: HashMap::new(),
            behavior: QueryBehavior::Rows(vec![json!({"Count of Records": 42})]),
            list_calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().expect("queries lock").clone()
    }

    /// Queries that were not value probes.
    pub fn executed_queries(&self) -> Vec<QueryRequest> {
        self.queries()
            .into_iter()
            .filter(|request| !is_probe(request))
            .collect()
    }

    fn probe_answer(&self, request: &QueryRequest) -> Value {
        let exists = request.query.filters.first().is_some_and(|filter| {
            let known = self
                .known_values
                .get(&filter.field().field_caption)
                .cloned()
                .unwrap_or_default();
            match filter {
                Filter::Set { values, .. } => values.iter().all(|value| {
                    let text = value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
                    known.contains(&text)
                }),
                Filter::Match {
                    starts_with,
                    ends_with,
                    contains,
                    ..
                } => known.iter().any(|candidate| {
                    starts_with.as_deref().is_none_or(|p| candidate.starts_with(p))
                        && ends_with.as_deref().is_none_or(|p| candidate.ends_with(p))
                        && contains.as_deref().is_none_or(|p| candidate.contains(p))
                }),
                _ => true,
            }
        });
        if exists {
            json!({"data": [{"probe": true}]})
        } else {
            json!({"data": []})
        }
    }
}

fn is_probe(request: &QueryRequest) -> bool {
    request.query.row_limit == Some(1)
        && request.query.fields.len() == 1
        && request.query.filters.len() == 1
}

#[async_trait]
impl TableauApi for FakeTableau {
    async fn list_datasources(
        &self,
        _filter: Option<&str>,
        page_size: u32,
        page_number: u32,
    ) -> Result<Page<Datasource>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let start = ((page_number.max(1) - 1) * page_size) as usize;
        let end = (start + page_size as usize).min(self.datasources.len());
        Ok(Page {
            pagination: PaginationMeta {
                page_number,
                page_size,
                total_available: self.datasources.len() as u32,
            },
            items: self
                .datasources
                .get(start..end)
                .map(<[Datasource]>::to_vec)
                .unwrap_or_default(),
        })
    }

    async fn get_datasource(&self, luid: &str) -> Result<Datasource, RemoteError> {
        self.datasources
            .iter()
            .find(|datasource| datasource.id == luid)
            .cloned()
            .ok_or_else(|| {
                RemoteError::from_body(
                    404,
                    r#"{"error": {"code": "404004", "summary": "Resource Not Found"}}"#,
                )
            })
    }

    async fn query_datasource(
        &self,
        request: &QueryRequest,
    ) -> Result<Value, QueryDatasourceError> {
        self.queries
            .lock()
            .expect("queries lock")
            .push(request.clone());
        match &self.behavior {
            QueryBehavior::FeatureDisabled => Err(QueryDatasourceError::FeatureDisabled),
            QueryBehavior::Remote(err) => Err(QueryDatasourceError::Remote(err.clone())),
            QueryBehavior::Rows(_) if is_probe(request) => Ok(self.probe_answer(request)),
            QueryBehavior::Rows(rows) => Ok(json!({ "data": rows })),
        }
    }

    async fn read_metadata(
        &self,
        datasource: &DatasourceRef,
    ) -> Result<MetadataResponse, RemoteError> {
        self.metadata
            .get(&datasource.datasource_luid)
            .cloned()
            .ok_or_else(|| {
                RemoteError::from_body(400, r#"{"errorCode": "400800", "message": "no metadata"}"#)
            })
    }
}
