use std::collections::HashSet;

use tracing::info;

use crate::{error::QueryError, models::Datasource, tableau::TableauApi};

/// Operator allow-lists. `None` means unrestricted; an empty set admits
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedContext {
    pub project_ids: Option<HashSet<String>>,
    pub datasource_ids: Option<HashSet<String>>,
}

impl BoundedContext {
    pub fn is_unrestricted(&self) -> bool {
        self.project_ids.is_none() && self.datasource_ids.is_none()
    }

    pub fn allows_datasource_id(&self, luid: &str) -> bool {
        self.datasource_ids
            .as_ref()
            .is_none_or(|allowed| allowed.contains(luid))
    }

    pub fn allows_project_id(&self, project_id: &str) -> bool {
        self.project_ids
            .as_ref()
            .is_none_or(|allowed| allowed.contains(project_id))
    }

    pub fn is_resource_allowed(&self, datasource: &Datasource) -> bool {
        self.allows_project_id(datasource.project_id()) && self.allows_datasource_id(&datasource.id)
    }
}

/// Order-preserving narrowing of a listing. A non-empty input that narrows
/// to nothing is reported as a policy outcome rather than an empty result.
pub fn filter_allowed(
    datasources: Vec<Datasource>,
    context: &BoundedContext,
) -> Result<Vec<Datasource>, QueryError> {
    let total = datasources.len();
    let allowed = datasources
        .into_iter()
        .filter(|datasource| context.is_resource_allowed(datasource))
        .collect::<Vec<_>>();

    if total > 0 && allowed.is_empty() {
        info!(total, "Every listed datasource was excluded by the bounded context");
        return Err(QueryError::FilteredByPolicy { total });
    }
    Ok(allowed)
}

fn not_allowed(luid: &str) -> QueryError {
    QueryError::DatasourceNotAllowed {
        message: format!(
            "The set of allowed data sources that can be queried is limited by the server configuration. Querying the data source with LUID {luid} is not allowed."
        ),
    }
}

/// Gate for a datasource already in hand, e.g. one found by name.
pub fn check_datasource(datasource: &Datasource, context: &BoundedContext) -> Result<(), QueryError> {
    if context.is_resource_allowed(datasource) {
        Ok(())
    } else {
        info!(datasource = %datasource.id, "Datasource rejected by bounded context");
        Err(not_allowed(&datasource.id))
    }
}

/// Gate for a bare identifier. The owning project is only fetched when a
/// project restriction is configured.
pub async fn check_datasource_luid(
    api: &dyn TableauApi,
    luid: &str,
    context: &BoundedContext,
) -> Result<(), QueryError> {
    if !context.allows_datasource_id(luid) {
        info!(datasource = %luid, "Datasource rejected by bounded context");
        return Err(not_allowed(luid));
    }

    if context.project_ids.is_none() {
        return Ok(());
    }

    let datasource = api.get_datasource(luid).await?;
    check_datasource(&datasource, context)
}
