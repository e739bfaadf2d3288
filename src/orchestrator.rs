use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    access::{check_datasource, check_datasource_luid, filter_allowed},
    config::QuerySettings,
    error::{QueryError, ToolOutcome},
    filter_validation::{validate_filter_values, DatasourceValueLookup},
    list_filter::ListFilter,
    models::{Datasource, MetadataResponse},
    paginate::{paginate, PageConfig},
    query::StructuredQuery,
    resolve::{build_default_query, resolve_datasource},
    tableau::{DatasourceRef, QueryOptions, QueryRequest, TableauApi},
};

pub const DEFAULT_LIST_PAGE_SIZE: u32 = 100;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveDataset,
    ReadMetadata,
    ResolveAccess,
    ValidateFilters,
    Execute,
    Translate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveDataset => "resolve_dataset",
            Self::ReadMetadata => "read_metadata",
            Self::ResolveAccess => "resolve_access",
            Self::ValidateFilters => "validate_filters",
            Self::Execute => "execute",
            Self::Translate => "translate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalLanguageRequest {
    pub datasource_name: String,
    pub question: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub filter: Option<ListFilter>,
    pub page_size: Option<u32>,
    pub limit: Option<usize>,
}

/// Runs one tool invocation against one authenticated session. Holds no
/// state beyond the borrowed collaborators, so concurrent invocations
/// never interact.
pub struct QueryOrchestrator<'a> {
    api: &'a dyn TableauApi,
    settings: &'a QuerySettings,
    request_id: &'a str,
}

impl<'a> QueryOrchestrator<'a> {
    pub fn new(api: &'a dyn TableauApi, settings: &'a QuerySettings, request_id: &'a str) -> Self {
        Self {
            api,
            settings,
            request_id,
        }
    }

    fn enter(&self, stage: Stage) {
        debug!(request_id = %self.request_id, stage = stage.as_str(), "Entering stage");
    }

    fn datasource_ref(&self, luid: &str) -> DatasourceRef {
        DatasourceRef::new(luid, self.settings.credentials.credentials_for(luid))
    }

    /// Structured-query tool: access, filter validation, execution.
    pub async fn query_datasource(
        &self,
        datasource_luid: &str,
        query: &StructuredQuery,
    ) -> Result<Value, QueryError> {
        self.enter(Stage::ResolveAccess);
        check_datasource_luid(self.api, datasource_luid, &self.settings.bounded_context).await?;
        self.validate_and_execute(datasource_luid, query).await
    }

    /// Natural-language tool: resolves the name, reads metadata, checks
    /// access, then runs the default count query.
    pub async fn query_by_name(&self, request: &NaturalLanguageRequest) -> Result<Value, QueryError> {
        self.enter(Stage::ResolveDataset);
        let datasource =
            resolve_datasource(self.api, &request.datasource_name, self.settings.resolve).await?;

        self.enter(Stage::ReadMetadata);
        let metadata = match self.api.read_metadata(&self.datasource_ref(&datasource.id)).await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!(
                    request_id = %self.request_id,
                    datasource = %datasource.id,
                    "Metadata unavailable, using default caption: {err}"
                );
                None
            }
        };

        self.enter(Stage::ResolveAccess);
        check_datasource(&datasource, &self.settings.bounded_context)?;

        let query = build_default_query(&request.question, metadata.as_ref(), request.limit);
        let result = self.validate_and_execute(&datasource.id, &query).await?;

        Ok(json!({
            "datasource": {
                "id": datasource.id,
                "name": datasource.name,
                "projectId": datasource.project.id,
            },
            "query": query,
            "result": result,
        }))
    }

    async fn validate_and_execute(
        &self,
        datasource_luid: &str,
        query: &StructuredQuery,
    ) -> Result<Value, QueryError> {
        let datasource = self.datasource_ref(datasource_luid);

        if self.settings.disable_filter_validation {
            debug!(request_id = %self.request_id, "Filter value validation disabled by configuration");
        } else {
            self.enter(Stage::ValidateFilters);
            let lookup = DatasourceValueLookup::new(self.api, &datasource);
            let findings = validate_filter_values(
                query,
                &lookup,
                self.settings.filter_validation_concurrency,
            )
            .await?;
            if !findings.is_empty() {
                return Err(QueryError::FilterValidation { findings });
            }
        }

        self.enter(Stage::Execute);
        let request = QueryRequest {
            datasource,
            query: query.clone(),
            options: QueryOptions::default(),
        };
        Ok(self.api.query_datasource(&request).await?)
    }

    /// List tool: pages through the site, then narrows by the bounded
    /// context.
    pub async fn list_datasources(&self, request: &ListRequest) -> Result<Vec<Datasource>, QueryError> {
        let limit = match (request.limit, self.settings.max_result_limit) {
            (Some(limit), Some(max)) => Some(limit.min(max)),
            (Some(limit), None) => Some(limit),
            (None, max) => max,
        };
        let config = PageConfig {
            page_size: request.page_size.unwrap_or(DEFAULT_LIST_PAGE_SIZE),
            limit,
        };
        let filter = request.filter.as_ref().map(ToString::to_string);

        let datasources = paginate(config, |page_number, page_size| {
            self.api
                .list_datasources(filter.as_deref(), page_size, page_number)
        })
        .await?;

        self.enter(Stage::ResolveAccess);
        filter_allowed(datasources, &self.settings.bounded_context)
    }

    /// Metadata tool: access-gated passthrough of `read-metadata`.
    pub async fn read_metadata(&self, datasource_luid: &str) -> Result<MetadataResponse, QueryError> {
        self.enter(Stage::ResolveAccess);
        check_datasource_luid(self.api, datasource_luid, &self.settings.bounded_context).await?;
        Ok(self.api.read_metadata(&self.datasource_ref(datasource_luid)).await?)
    }

    /// Collapses a pipeline result into the caller-facing outcome.
    pub fn translate(&self, result: Result<Value, QueryError>) -> ToolOutcome {
        self.enter(Stage::Translate);
        match result {
            Ok(payload) => ToolOutcome::success(&payload),
            Err(err) => {
                match &err {
                    QueryError::Remote(remote) => warn!(
                        request_id = %self.request_id,
                        outcome = err.tag(),
                        code = %remote.code,
                        recognized = remote.recognized,
                        "Tableau rejected the request"
                    ),
                    _ => info!(request_id = %self.request_id, outcome = err.tag(), "Tool call rejected"),
                }
                ToolOutcome::from_error(&err, self.request_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use serde_json::json;

    use super::*;
    use crate::{
        access::BoundedContext,
        config::CredentialStore,
        error::RemoteError,
        models::FieldMetadata,
        query::{FieldSpec, Filter, FilterField},
        test_support::{datasource, FakeTableau, QueryBehavior},
    };

    fn settings() -> QuerySettings {
        QuerySettings::default()
    }

    fn region_query(values: &[&str]) -> StructuredQuery {
        StructuredQuery {
            fields: vec![FieldSpec::caption("Region")],
            filters: values
                .iter()
                .map(|value| Filter::Set {
                    field: FilterField::caption("Region"),
                    values: vec![json!(value)],
                    exclude: false,
                })
                .collect(),
            row_limit: None,
        }
    }

    fn sales_site() -> FakeTableau {
        let mut api = FakeTableau::with_datasources(vec![
            datasource("ds-1", "Superstore", "p1"),
            datasource("ds-2", "Sales (EMEA)", "p2"),
        ]);
        api.known_values
            .insert("Region".to_string(), vec!["East".to_string(), "West".to_string()]);
        api
    }

    #[tokio::test]
    async fn missing_filter_value_blocks_execution() {
        let api = sales_site();
        let settings = settings();
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-1");

        let err = orchestrator
            .query_datasource("ds-1", &region_query(&["East", "Atlantis"]))
            .await
            .expect_err("Atlantis is not a region");

        match err {
            QueryError::FilterValidation { findings } => {
                assert_eq!(findings.len(), 1);
                assert_eq!(findings[0].offending_value, "Atlantis");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(api.executed_queries().is_empty());
    }

    #[tokio::test]
    async fn disabled_validation_skips_probes() {
        let api = sales_site();
        let settings = QuerySettings {
            disable_filter_validation: true,
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-2");

        orchestrator
            .query_datasource("ds-1", &region_query(&["Atlantis"]))
            .await
            .expect("executes without validation");
        assert_eq!(api.queries().len(), 1);
    }

    #[tokio::test]
    async fn feature_disabled_wins_regardless_of_query() {
        let mut api = sales_site();
        api.behavior = QueryBehavior::FeatureDisabled;
        let settings = settings();
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-3");

        for query in [region_query(&[]), region_query(&["East"])] {
            let result = orchestrator.query_datasource("ds-1", &query).await;
            let outcome = orchestrator.translate(result);
            assert_eq!(outcome.tag, "feature-disabled");
            assert!(outcome.is_error);
        }
    }

    #[tokio::test]
    async fn datasource_outside_allow_list_is_rejected_before_any_query() {
        let api = sales_site();
        let settings = QuerySettings {
            bounded_context: BoundedContext {
                project_ids: None,
                datasource_ids: Some(HashSet::from(["ds-2".to_string()])),
            },
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-4");

        let err = orchestrator
            .query_datasource("ds-1", &region_query(&["East"]))
            .await
            .expect_err("not allowed");
        assert_eq!(err.tag(), "datasource-not-allowed");
        assert!(api.queries().is_empty());
    }

    #[tokio::test]
    async fn project_restriction_looks_up_owning_project() {
        let api = sales_site();
        let settings = QuerySettings {
            bounded_context: BoundedContext {
                project_ids: Some(HashSet::from(["p2".to_string()])),
                datasource_ids: None,
            },
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-5");

        assert!(orchestrator
            .query_datasource("ds-2", &region_query(&[]))
            .await
            .is_ok());
        let err = orchestrator
            .query_datasource("ds-1", &region_query(&[]))
            .await
            .expect_err("project p1 is excluded");
        assert_eq!(err.tag(), "datasource-not-allowed");
    }

    #[tokio::test]
    async fn remote_errors_carry_request_id() {
        let mut api = sales_site();
        api.behavior = QueryBehavior::Remote(RemoteError::from_body(
            400,
            r#"{"errorCode": "400803", "message": "Unknown field"}"#,
        ));
        let settings = settings();
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-6");

        let result = orchestrator.query_datasource("ds-1", &region_query(&[])).await;
        let outcome = orchestrator.translate(result);
        assert_eq!(outcome.tag, "tableau-error");
        assert!(outcome.text.contains("\"requestId\":\"req-6\""));
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let api = FakeTableau::with_datasources(vec![datasource("ds-1", "Inventory", "p1")]);
        let settings = settings();
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-7");

        let result = orchestrator
            .query_by_name(&NaturalLanguageRequest {
                datasource_name: "Sales".to_string(),
                question: "What were total sales?".to_string(),
                limit: 20,
            })
            .await;
        let outcome = orchestrator.translate(result);
        assert_eq!(outcome.tag, "datasource-not-found");
        assert!(outcome.text.contains("Sales"));
        assert!(api.queries().is_empty());
    }

    #[tokio::test]
    async fn natural_language_runs_default_count_query() {
        let mut api = sales_site();
        api.metadata.insert(
            "ds-2".to_string(),
            MetadataResponse {
                data: vec![FieldMetadata {
                    field_name: "Order ID".to_string(),
                    field_caption: None,
                    data_type: Some("STRING".to_string()),
                    logical_table_id: None,
                }],
            },
        );
        let settings = QuerySettings {
            credentials: CredentialStore::parse(r#"{"ds-2": [{"u": "reader", "p": "pw"}]}"#)
                .expect("credentials parse"),
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-8");

        let payload = orchestrator
            .query_by_name(&NaturalLanguageRequest {
                datasource_name: "sales".to_string(),
                question: "How many orders?".to_string(),
                limit: 10,
            })
            .await
            .expect("query runs");

        assert_eq!(payload["datasource"]["id"], "ds-2");
        assert_eq!(payload["query"]["fields"][0]["function"], "COUNT");
        let executed = api.executed_queries();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].query.row_limit, Some(10));
        assert_eq!(executed[0].datasource.connections[0].connection_username, "reader");
    }

    #[tokio::test]
    async fn natural_language_respects_bounded_context() {
        let api = sales_site();
        let settings = QuerySettings {
            bounded_context: BoundedContext {
                project_ids: Some(HashSet::new()),
                datasource_ids: None,
            },
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-9");

        let err = orchestrator
            .query_by_name(&NaturalLanguageRequest {
                datasource_name: "Superstore".to_string(),
                question: "anything".to_string(),
                limit: 20,
            })
            .await
            .expect_err("empty project set admits nothing");
        assert_eq!(err.tag(), "datasource-not-allowed");
    }

    #[tokio::test]
    async fn listing_distinguishes_policy_from_empty() {
        let api = sales_site();
        let settings = QuerySettings {
            bounded_context: BoundedContext {
                project_ids: Some(HashSet::from(["p9".to_string()])),
                datasource_ids: None,
            },
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-10");
        let err = orchestrator
            .list_datasources(&ListRequest::default())
            .await
            .expect_err("everything filtered");
        assert_eq!(err.tag(), "datasources-filtered-by-policy");

        let empty_site = FakeTableau::with_datasources(Vec::new());
        let orchestrator = QueryOrchestrator::new(&empty_site, &settings, "req-11");
        let listed = orchestrator
            .list_datasources(&ListRequest::default())
            .await
            .expect("empty is success");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn listing_limit_is_clamped_by_operator_maximum() {
        let api = FakeTableau::with_datasources(
            (0..30)
                .map(|i| datasource(&format!("ds-{i}"), "Any", "p1"))
                .collect(),
        );
        let settings = QuerySettings {
            max_result_limit: Some(7),
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-12");
        let listed = orchestrator
            .list_datasources(&ListRequest {
                filter: None,
                page_size: Some(5),
                limit: Some(100),
            })
            .await
            .expect("listing succeeds");
        assert_eq!(listed.len(), 7);
        assert_eq!(api.list_calls(), 2);
    }

    #[tokio::test]
    async fn metadata_tool_is_access_gated() {
        let mut api = sales_site();
        api.metadata = HashMap::from([("ds-1".to_string(), MetadataResponse::default())]);
        let settings = QuerySettings {
            bounded_context: BoundedContext {
                project_ids: None,
                datasource_ids: Some(HashSet::from(["ds-1".to_string()])),
            },
            ..settings()
        };
        let orchestrator = QueryOrchestrator::new(&api, &settings, "req-13");
        assert!(orchestrator.read_metadata("ds-1").await.is_ok());
        let err = orchestrator
            .read_metadata("ds-2")
            .await
            .expect_err("not allowed");
        assert_eq!(err.tag(), "datasource-not-allowed");
    }
}
