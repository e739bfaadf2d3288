mod access;
mod auth;
mod config;
mod error;
mod filter_validation;
mod list_filter;
mod mcp_api;
mod models;
mod orchestrator;
mod paginate;
mod query;
mod resolve;
mod tableau;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use tableau::TableauClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub tableau: TableauClient,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tableau_query_mcp=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated MCP API key; set TABLEAU_MCP_API_KEY to make it stable");
    }
    if config.query.disable_filter_validation {
        info!("Filter value validation is disabled");
    }

    let tableau = TableauClient::new(&config.tableau)?;
    let state = AppState {
        config: config.clone(),
        tableau,
    };

    let app = Router::new()
        .route("/healthz", get(mcp_api::healthz))
        .route("/mcp", post(mcp_api::mcp))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        "tableau-query-mcp listening on {} for {}",
        config.bind_addr, config.tableau.server
    );
    axum::serve(listener, app).await?;
    Ok(())
}
