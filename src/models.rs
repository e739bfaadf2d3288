use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A published datasource as reported by the REST API. Never created or
/// mutated here; only read and filtered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub id: String,
    pub name: String,
    pub project: ProjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Datasource {
    pub fn project_id(&self) -> &str {
        &self.project.id
    }
}

/// Pagination block of a REST listing. Tableau encodes the counters as
/// strings, so both forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    #[serde(deserialize_with = "lenient_u32")]
    pub page_number: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub page_size: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub total_available: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub pagination: PaginationMeta,
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceListResponse {
    pub pagination: PaginationMeta,
    #[serde(default)]
    pub datasources: DatasourceList,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatasourceList {
    #[serde(default)]
    pub datasource: Vec<Datasource>,
}

impl DatasourceListResponse {
    pub fn into_page(self) -> Page<Datasource> {
        Page {
            pagination: self.pagination,
            items: self.datasources.datasource,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasourceResponse {
    pub datasource: Datasource,
}

/// One field descriptor from `read-metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    pub field_name: String,
    #[serde(default)]
    pub field_caption: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_table_id: Option<String>,
}

impl FieldMetadata {
    /// Caption used in queries; falls back to the internal name.
    pub fn caption(&self) -> &str {
        self.field_caption
            .as_deref()
            .filter(|caption| !caption.trim().is_empty())
            .unwrap_or(&self.field_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    #[serde(default)]
    pub data: Vec<FieldMetadata>,
}

/// Per-connection override attached to a query when the operator
/// configured credentials for the datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_luid: Option<String>,
    pub connection_username: String,
    pub connection_password: String,
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(value) => Ok(value),
        Raw::Text(text) => text.trim().parse::<u32>().map_err(serde::de::Error::custom),
    }
}
