use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::ACCEPT, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::TableauConfig,
    error::{QueryError, RemoteError},
    models::{
        ConnectionCredential, Datasource, DatasourceListResponse, DatasourceResponse,
        MetadataResponse, Page,
    },
    query::StructuredQuery,
};

const AUTH_HEADER: &str = "X-Tableau-Auth";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRef {
    pub datasource_luid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionCredential>,
}

impl DatasourceRef {
    pub fn new(luid: impl Into<String>, connections: Option<Vec<ConnectionCredential>>) -> Self {
        Self {
            datasource_luid: luid.into(),
            connections: connections.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnFormat {
    Objects,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub return_format: ReturnFormat,
    pub disaggregate: bool,
    pub debug: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            return_format: ReturnFormat::Objects,
            disaggregate: false,
            debug: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub datasource: DatasourceRef,
    pub query: StructuredQuery,
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Error)]
pub enum QueryDatasourceError {
    #[error("VizQL Data Service is disabled")]
    FeatureDisabled,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<QueryDatasourceError> for QueryError {
    fn from(err: QueryDatasourceError) -> Self {
        match err {
            QueryDatasourceError::FeatureDisabled => QueryError::FeatureDisabled,
            QueryDatasourceError::Remote(remote) => QueryError::Remote(remote),
        }
    }
}

/// Remote capabilities the query pipeline depends on. One value is scoped
/// to one authenticated session.
#[async_trait]
pub trait TableauApi: Send + Sync {
    async fn list_datasources(
        &self,
        filter: Option<&str>,
        page_size: u32,
        page_number: u32,
    ) -> Result<Page<Datasource>, RemoteError>;

    async fn get_datasource(&self, luid: &str) -> Result<Datasource, RemoteError>;

    async fn query_datasource(&self, request: &QueryRequest)
        -> Result<Value, QueryDatasourceError>;

    async fn read_metadata(
        &self,
        datasource: &DatasourceRef,
    ) -> Result<MetadataResponse, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct TableauClient {
    http: reqwest::Client,
    server: String,
    site_content_url: String,
    api_version: String,
    pat_name: String,
    pat_value: String,
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    credentials: SignInCredentials,
}

#[derive(Debug, Deserialize)]
struct SignInCredentials {
    token: String,
    site: SignInSite,
}

#[derive(Debug, Deserialize)]
struct SignInSite {
    id: String,
}

impl TableauClient {
    pub fn new(config: &TableauConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build Tableau HTTP client")?;
        Ok(Self {
            http,
            server: config.server.trim_end_matches('/').to_string(),
            site_content_url: config.site_name.clone(),
            api_version: config.api_version.clone(),
            pat_name: config.pat_name.clone(),
            pat_value: config.pat_value.clone(),
        })
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/api/{}/{}", self.server, self.api_version, path)
    }

    fn vizql_url(&self, operation: &str) -> String {
        format!("{}/api/v1/vizql-data-service/{operation}", self.server)
    }

    pub async fn sign_in(&self) -> Result<TableauSession, RemoteError> {
        let body = json!({
            "credentials": {
                "personalAccessTokenName": self.pat_name,
                "personalAccessTokenSecret": self.pat_value,
                "site": { "contentUrl": self.site_content_url },
            }
        });
        let request = self
            .http
            .post(self.rest_url("auth/signin"))
            .header(ACCEPT, "application/json")
            .json(&body);
        let parsed: SignInResponse = send_json(request).await?;
        debug!(site_id = %parsed.credentials.site.id, "Signed in to Tableau");

        Ok(TableauSession {
            client: self.clone(),
            token: parsed.credentials.token,
            site_id: parsed.credentials.site.id,
        })
    }
}

/// An authenticated session. Sign out once the tool call is finished.
#[derive(Debug)]
pub struct TableauSession {
    client: TableauClient,
    token: String,
    site_id: String,
}

impl TableauSession {
    fn get(&self, url: String) -> RequestBuilder {
        self.client
            .http
            .get(url)
            .header(AUTH_HEADER, &self.token)
            .header(ACCEPT, "application/json")
    }

    fn post(&self, url: String) -> RequestBuilder {
        self.client
            .http
            .post(url)
            .header(AUTH_HEADER, &self.token)
            .header(ACCEPT, "application/json")
    }

    pub async fn sign_out(self) {
        let url = self.client.rest_url("auth/signout");
        match self.post(url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "Tableau sign-out was rejected"),
            Err(err) => warn!("Tableau sign-out failed: {err}"),
        }
    }
}

#[async_trait]
impl TableauApi for TableauSession {
    async fn list_datasources(
        &self,
        filter: Option<&str>,
        page_size: u32,
        page_number: u32,
    ) -> Result<Page<Datasource>, RemoteError> {
        let url = self
            .client
            .rest_url(&format!("sites/{}/datasources", self.site_id));
        let mut params = vec![
            ("pageSize", page_size.to_string()),
            ("pageNumber", page_number.to_string()),
        ];
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            params.push(("filter", filter.to_string()));
        }
        let parsed: DatasourceListResponse = send_json(self.get(url).query(&params)).await?;
        Ok(parsed.into_page())
    }

    async fn get_datasource(&self, luid: &str) -> Result<Datasource, RemoteError> {
        let url = self
            .client
            .rest_url(&format!("sites/{}/datasources/{luid}", self.site_id));
        let parsed: DatasourceResponse = send_json(self.get(url)).await?;
        Ok(parsed.datasource)
    }

    async fn query_datasource(
        &self,
        request: &QueryRequest,
    ) -> Result<Value, QueryDatasourceError> {
        let url = self.client.vizql_url("query-datasource");
        let response = self
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| RemoteError::transport(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(QueryDatasourceError::FeatureDisabled);
        }
        Ok(read_json(response).await?)
    }

    async fn read_metadata(
        &self,
        datasource: &DatasourceRef,
    ) -> Result<MetadataResponse, RemoteError> {
        let url = self.client.vizql_url("read-metadata");
        send_json(self.post(url).json(&json!({ "datasource": datasource }))).await
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
    let response = request
        .send()
        .await
        .map_err(|err| RemoteError::transport(err.to_string()))?;
    read_json(response).await
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| RemoteError::transport(err.to_string()))?;
    if !status.is_success() {
        return Err(RemoteError::from_body(status.as_u16(), &body));
    }
    serde_json::from_str(&body)
        .map_err(|err| RemoteError::decode(format!("Unexpected Tableau response: {err}")))
}
