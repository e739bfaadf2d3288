use std::{
    collections::{HashMap, HashSet},
    env, fs,
    net::SocketAddr,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    access::BoundedContext, filter_validation::DEFAULT_FILTER_VALIDATION_CONCURRENCY,
    models::ConnectionCredential, resolve::ResolveConfig,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub dev_log_payloads: bool,
    pub tableau: TableauConfig,
    pub query: QuerySettings,
}

#[derive(Debug, Clone)]
pub struct TableauConfig {
    pub server: String,
    pub site_name: String,
    pub api_version: String,
    pub pat_name: String,
    pub pat_value: String,
    pub request_timeout_seconds: u64,
}

/// Operator policy applied to every tool call.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub bounded_context: BoundedContext,
    pub credentials: CredentialStore,
    pub disable_filter_validation: bool,
    /// Upper bound on filter-value lookups in flight for one query.
    pub filter_validation_concurrency: usize,
    pub max_result_limit: Option<usize>,
    pub resolve: ResolveConfig,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            bounded_context: BoundedContext::default(),
            credentials: CredentialStore::default(),
            disable_filter_validation: false,
            filter_validation_concurrency: DEFAULT_FILTER_VALIDATION_CONCURRENCY,
            max_result_limit: None,
            resolve: ResolveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    by_datasource: HashMap<String, Vec<ConnectionCredential>>,
}

#[derive(Debug, Deserialize)]
struct RawCredential {
    #[serde(default)]
    luid: Option<String>,
    u: String,
    p: String,
}

impl CredentialStore {
    /// Parses `{ "<datasource luid>": [{"luid"?, "u", "p"}] }`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: HashMap<String, Vec<RawCredential>> =
            serde_json::from_str(raw).context("DATASOURCE_CREDENTIALS must be a JSON object")?;
        let by_datasource = parsed
            .into_iter()
            .map(|(luid, entries)| {
                let connections = entries
                    .into_iter()
                    .map(|entry| ConnectionCredential {
                        connection_luid: entry.luid,
                        connection_username: entry.u,
                        connection_password: entry.p,
                    })
                    .collect();
                (luid, connections)
            })
            .collect();
        Ok(Self { by_datasource })
    }

    pub fn credentials_for(&self, datasource_luid: &str) -> Option<Vec<ConnectionCredential>> {
        self.by_datasource
            .get(datasource_luid)
            .filter(|connections| !connections.is_empty())
            .cloned()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = var("TABLEAU_MCP_BIND_ADDR")
            .map(|raw| raw.trim().trim_matches('"').trim_matches('\'').to_string())
            .and_then(|raw| raw.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key(&var);

        let tableau = TableauConfig {
            server: required(&var, "TABLEAU_SERVER")?,
            site_name: var("TABLEAU_SITE_NAME")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            api_version: var("TABLEAU_API_VERSION")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "3.24".to_string()),
            pat_name: required(&var, "TABLEAU_PAT_NAME")?,
            pat_value: required(&var, "TABLEAU_PAT_VALUE")?,
            request_timeout_seconds: parse_number(&var, "TABLEAU_REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(60),
        };

        let bounded_context = BoundedContext {
            project_ids: parse_id_set(&var, "INCLUDE_PROJECT_IDS"),
            datasource_ids: parse_id_set(&var, "INCLUDE_DATASOURCE_IDS"),
        };

        let credentials = match var("DATASOURCE_CREDENTIALS").filter(|v| !v.trim().is_empty()) {
            Some(raw) => CredentialStore::parse(&raw)?,
            None => CredentialStore::default(),
        };

        let defaults = ResolveConfig::default();
        let query = QuerySettings {
            bounded_context,
            credentials,
            disable_filter_validation: parse_flag(&var, "DISABLE_QUERY_DATASOURCE_FILTER_VALIDATION"),
            filter_validation_concurrency: parse_number::<usize>(
                &var,
                "TABLEAU_MCP_FILTER_VALIDATION_CONCURRENCY",
            )
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_FILTER_VALIDATION_CONCURRENCY),
            max_result_limit: parse_number::<usize>(&var, "MAX_RESULT_LIMIT")
                .filter(|limit| *limit > 0),
            resolve: ResolveConfig {
                max_pages: parse_number::<u32>(&var, "TABLEAU_MCP_RESOLVE_MAX_PAGES")
                    .filter(|pages| *pages > 0)
                    .unwrap_or(defaults.max_pages),
                page_size: parse_number::<u32>(&var, "TABLEAU_MCP_RESOLVE_PAGE_SIZE")
                    .filter(|size| *size > 0)
                    .unwrap_or(defaults.page_size),
            },
        };

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            dev_log_payloads: parse_flag(&var, "TABLEAU_MCP_DEV_LOG_PAYLOADS"),
            tableau,
            query,
        })
    }
}

fn required(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match var(key).map(|v| v.trim().to_string()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("{key} must be set"),
    }
}

fn parse_number<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    var(key)
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// A variable that is set but lists nothing yields an empty set, which
/// admits nothing.
fn parse_id_set(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<HashSet<String>> {
    let raw = var(key)?;
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect::<HashSet<_>>();
    if ids.is_empty() {
        warn!("{key} is set but empty; no resources of that kind will be allowed");
    }
    Some(ids)
}

fn resolve_api_key(var: &impl Fn(&str) -> Option<String>) -> (String, bool) {
    if let Some(value) = var("TABLEAU_MCP_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    match var("TABLEAU_MCP_API_KEY_FILE") {
        Some(key_file) => match fs::read_to_string(&key_file) {
            Ok(raw) if !raw.trim().is_empty() => return (raw.trim().to_string(), false),
            Ok(_) => warn!("TABLEAU_MCP_API_KEY_FILE is empty: {key_file}"),
            Err(err) => warn!("Failed reading TABLEAU_MCP_API_KEY_FILE at {key_file}: {err}"),
        },
        None => warn!("TABLEAU_MCP_API_KEY not set"),
    }

    (format!("fallback-{}", Uuid::new_v4()), true)
}
