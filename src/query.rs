use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Function {
    Sum,
    Avg,
    Median,
    Count,
    Countd,
    Min,
    Max,
    Stdev,
    Var,
    Collect,
    Year,
    Quarter,
    Month,
    Week,
    Day,
    TruncYear,
    TruncQuarter,
    TruncMonth,
    TruncWeek,
    TruncDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_decimal_places: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_direction: Option<SortDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_priority: Option<u32>,
}

impl FieldSpec {
    pub fn caption(caption: impl Into<String>) -> Self {
        Self {
            field_caption: caption.into(),
            function: None,
            field_alias: None,
            max_decimal_places: None,
            sort_direction: None,
            sort_priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterField {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
}

impl FilterField {
    pub fn caption(caption: impl Into<String>) -> Self {
        Self {
            field_caption: caption.into(),
            function: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuantitativeFilterType {
    Range,
    Min,
    Max,
    OnlyNull,
    OnlyNonNull,
}

/// VizQL filter family, discriminated by `filterType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filterType", rename_all_fields = "camelCase")]
pub enum Filter {
    #[serde(rename = "SET")]
    Set {
        field: FilterField,
        values: Vec<Value>,
        #[serde(default)]
        exclude: bool,
    },
    #[serde(rename = "MATCH")]
    Match {
        field: FilterField,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        starts_with: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ends_with: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
        #[serde(default)]
        exclude: bool,
    },
    #[serde(rename = "QUANTITATIVE_NUMERICAL")]
    QuantitativeNumerical {
        field: FilterField,
        quantitative_filter_type: QuantitativeFilterType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_nulls: Option<bool>,
    },
    #[serde(rename = "QUANTITATIVE_DATE")]
    QuantitativeDate {
        field: FilterField,
        quantitative_filter_type: QuantitativeFilterType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_nulls: Option<bool>,
    },
    #[serde(rename = "DATE")]
    RelativeDate {
        field: FilterField,
        period_type: String,
        date_range_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range_n: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_date: Option<String>,
    },
    #[serde(rename = "TOP")]
    Top {
        field: FilterField,
        how_many: u32,
        field_to_measure: FilterField,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<String>,
    },
}

impl Filter {
    pub fn field(&self) -> &FilterField {
        match self {
            Self::Set { field, .. }
            | Self::Match { field, .. }
            | Self::QuantitativeNumerical { field, .. }
            | Self::QuantitativeDate { field, .. }
            | Self::RelativeDate { field, .. }
            | Self::Top { field, .. } => field,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "SET",
            Self::Match { .. } => "MATCH",
            Self::QuantitativeNumerical { .. } => "QUANTITATIVE_NUMERICAL",
            Self::QuantitativeDate { .. } => "QUANTITATIVE_DATE",
            Self::RelativeDate { .. } => "DATE",
            Self::Top { .. } => "TOP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredQuery {
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u32>,
}

impl StructuredQuery {
    /// Checks the parts serde cannot express. Every problem is reported,
    /// in field-then-filter order.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.fields.is_empty() {
            issues.push("query.fields must contain at least one field".to_string());
        }

        let mut priorities = HashSet::new();
        for (idx, field) in self.fields.iter().enumerate() {
            if field.field_caption.trim().is_empty() {
                issues.push(format!("query.fields[{idx}].fieldCaption must be non-empty"));
            }
            if let Some(alias) = &field.field_alias {
                if alias.trim().is_empty() {
                    issues.push(format!("query.fields[{idx}].fieldAlias must be non-empty"));
                }
            }
            if let Some(priority) = field.sort_priority {
                if !priorities.insert(priority) {
                    issues.push(format!(
                        "query.fields[{idx}].sortPriority {priority} is already used by another field"
                    ));
                }
            }
        }

        for (idx, filter) in self.filters.iter().enumerate() {
            if filter.field().field_caption.trim().is_empty() {
                issues.push(format!(
                    "query.filters[{idx}].field.fieldCaption must be non-empty ({} filter)",
                    filter.kind()
                ));
            }
            match filter {
                Filter::Set { values, .. } if values.is_empty() => {
                    issues.push(format!(
                        "query.filters[{idx}].values must contain at least one value"
                    ));
                }
                Filter::Match {
                    starts_with,
                    ends_with,
                    contains,
                    ..
                } if starts_with.is_none() && ends_with.is_none() && contains.is_none() => {
                    issues.push(format!(
                        "query.filters[{idx}] must set one of startsWith, endsWith or contains"
                    ));
                }
                Filter::Top { how_many: 0, .. } => {
                    issues.push(format!("query.filters[{idx}].howMany must be positive"));
                }
                _ => {}
            }
        }

        if self.row_limit == Some(0) {
            issues.push("query.rowLimit must be positive".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filters_deserialize_by_filter_type() {
        let query: StructuredQuery = serde_json::from_value(json!({
            "fields": [{"fieldCaption": "Sales", "function": "SUM", "sortDirection": "DESC"}],
            "filters": [
                {"filterType": "SET", "field": {"fieldCaption": "Region"}, "values": ["East"]},
                {"filterType": "MATCH", "field": {"fieldCaption": "Customer"}, "startsWith": "A"},
                {"filterType": "QUANTITATIVE_NUMERICAL", "field": {"fieldCaption": "Profit"},
                 "quantitativeFilterType": "MIN", "min": 0.0}
            ]
        }))
        .expect("query parses");

        assert_eq!(query.fields[0].function, Some(Function::Sum));
        assert_eq!(query.filters.len(), 3);
        assert_eq!(query.filters[1].kind(), "MATCH");
        assert!(query.validate().is_ok());
    }

    #[test]
    fn unknown_filter_type_is_rejected() {
        let parsed = serde_json::from_value::<StructuredQuery>(json!({
            "fields": [{"fieldCaption": "Sales"}],
            "filters": [{"filterType": "REGEX", "field": {"fieldCaption": "Region"}}]
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_reports_every_issue() {
        let query = StructuredQuery {
            fields: vec![
                FieldSpec {
                    sort_priority: Some(1),
                    ..FieldSpec::caption("")
                },
                FieldSpec {
                    sort_priority: Some(1),
                    ..FieldSpec::caption("Sales")
                },
            ],
            filters: vec![
                Filter::Set {
                    field: FilterField::caption("Region"),
                    values: Vec::new(),
                    exclude: false,
                },
                Filter::Match {
                    field: FilterField::caption("Customer"),
                    starts_with: None,
                    ends_with: None,
                    contains: None,
                    exclude: false,
                },
            ],
            row_limit: Some(0),
        };

        let issues = query.validate().expect_err("query is invalid");
        assert_eq!(issues.len(), 5);
        assert!(issues[0].contains("fields[0].fieldCaption"));
        assert!(issues[1].contains("sortPriority 1"));
        assert!(issues[4].contains("rowLimit"));
    }

    #[test]
    fn blank_filter_caption_names_the_filter_type() {
        let query = StructuredQuery {
            fields: vec![FieldSpec::caption("Sales")],
            filters: vec![Filter::Top {
                field: FilterField::caption(" "),
                how_many: 5,
                field_to_measure: FilterField::caption("Sales"),
                direction: None,
            }],
            row_limit: None,
        };

        let issues = query.validate().expect_err("caption is blank");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("query.filters[0].field.fieldCaption"));
        assert!(issues[0].contains("(TOP filter)"));
    }

    #[test]
    fn empty_fields_rejected() {
        let query = StructuredQuery {
            fields: Vec::new(),
            filters: Vec::new(),
            row_limit: None,
        };
        assert!(query.validate().is_err());
    }
}
