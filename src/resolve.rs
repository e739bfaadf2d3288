use tracing::debug;

use crate::{
    error::QueryError,
    models::{Datasource, MetadataResponse},
    query::{FieldSpec, Function, StructuredQuery},
    tableau::TableauApi,
};

/// Caption counted when the datasource reports no usable metadata.
pub const DEFAULT_CAPTION: &str = "Number of Records";

/// Bounds the name scan so a misspelled name cannot walk the whole site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveConfig {
    pub max_pages: u32,
    pub page_size: u32,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            max_pages: 5,
            page_size: 100,
        }
    }
}

/// Finds a datasource by display name. An exact case-insensitive match
/// wins and ends the scan; otherwise the first substring match seen is
/// returned.
pub async fn resolve_datasource(
    api: &dyn TableauApi,
    name: &str,
    config: ResolveConfig,
) -> Result<Datasource, QueryError> {
    let trimmed = name.trim();
    let needle = trimmed.to_lowercase();
    if needle.is_empty() {
        return Err(QueryError::invalid_argument(
            "datasourceName must be non-empty",
        ));
    }

    let page_size = config.page_size.max(1);
    let mut partial: Option<Datasource> = None;

    for page_number in 1..=config.max_pages {
        let page = api.list_datasources(None, page_size, page_number).await?;
        let fetched = page.items.len();

        for datasource in page.items {
            let candidate = datasource.name.trim().to_lowercase();
            if candidate == needle {
                debug!(datasource = %datasource.id, page_number, "Resolved datasource by exact name");
                return Ok(datasource);
            }
            if partial.is_none() && candidate.contains(&needle) {
                partial = Some(datasource);
            }
        }

        let scanned = u64::from(page_number) * u64::from(page_size);
        if fetched < page_size as usize || scanned >= u64::from(page.pagination.total_available) {
            break;
        }
    }

    match partial {
        Some(datasource) => {
            debug!(datasource = %datasource.id, "Resolved datasource by substring");
            Ok(datasource)
        }
        None => Err(QueryError::DatasourceNotFound {
            name: trimmed.to_string(),
        }),
    }
}

/// Builds the conservative query used when the caller gave only a
/// question: a single COUNT over the first reported field. The question
/// is not interpreted.
pub fn build_default_query(
    question: &str,
    metadata: Option<&MetadataResponse>,
    limit: u32,
) -> StructuredQuery {
    let caption = metadata
        .and_then(|meta| meta.data.first())
        .map(|field| field.caption().to_string())
        .unwrap_or_else(|| DEFAULT_CAPTION.to_string());
    debug!(caption = %caption, question_len = question.len(), "Built default count query");

    StructuredQuery {
        fields: vec![FieldSpec {
            function: Some(Function::Count),
            field_alias: Some(format!("Count of {caption}")),
            ..FieldSpec::caption(caption)
        }],
        filters: Vec::new(),
        row_limit: Some(limit),
    }
}
