use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::canonical;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub estimated_row_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Immutable snapshot of the catalog. Replaced wholesale on refresh, never
/// edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub version: String,
    pub fetched_at: i64,
    pub tables: Vec<TableInfo>,
    /// The schema the tables live in; the only accepted qualifier in queries.
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
}

const DEFAULT_SCHEMA_NAME: &str = "public";

fn default_schema_name() -> String {
    DEFAULT_SCHEMA_NAME.to_string()
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableInfo>, fetched_at: i64) -> Self {
        let version = Self::compute_version(&tables);
        Self {
            version,
            fetched_at,
            tables,
            schema_name: default_schema_name(),
        }
    }

    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn compute_version(tables: &[TableInfo]) -> String {
        let shape = tables
            .iter()
            .map(|t| {
                serde_json::json!({
                    "table": t.name,
                    "columns": t
                        .columns
                        .iter()
                        .map(|c| serde_json::json!([c.name, c.data_type]))
                        .collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>();
        canonical::short_hash(&serde_json::Value::Array(shape), 16)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// The view a caller with `access` may see. Foreign keys into tables outside
    /// the view are dropped so the view never names an invisible table.
    pub fn filter(&self, access: &TableAccess) -> SchemaSnapshot {
        let tables = self
            .tables
            .iter()
            .filter(|t| access.allows(&t.name))
            .map(|t| {
                let mut table = t.clone();
                for column in &mut table.columns {
                    if column
                        .foreign_key
                        .as_ref()
                        .is_some_and(|fk| !access.allows(&fk.table))
                    {
                        column.foreign_key = None;
                    }
                }
                table
            })
            .collect::<Vec<_>>();

        SchemaSnapshot {
            version: self.version.clone(),
            fetched_at: self.fetched_at,
            tables,
            schema_name: self.schema_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableAccess {
    All,
    Only(BTreeSet<String>),
}

impl TableAccess {
    pub fn only<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TableAccess::Only(
            tables
                .into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn allows(&self, table: &str) -> bool {
        match self {
            TableAccess::All => true,
            TableAccess::Only(set) => set.contains(&table.to_ascii_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: false,
            is_primary_key: name == "id",
            foreign_key: None,
            description: None,
        }
    }

    fn snapshot() -> SchemaSnapshot {
        let mut customer_id = column("customer_id", "integer");
        customer_id.foreign_key = Some(ForeignKeyRef {
            table: "customers".to_string(),
            column: "id".to_string(),
        });
        SchemaSnapshot::new(
            vec![
                TableInfo {
                    name: "orders".to_string(),
                    columns: vec![column("id", "integer"), customer_id],
                    estimated_row_count: 10,
                    description: None,
                },
                TableInfo {
                    name: "customers".to_string(),
                    columns: vec![column("id", "integer"), column("name", "text")],
                    estimated_row_count: 3,
                    description: None,
                },
            ],
            0,
        )
    }

    #[test]
    fn filter_hides_tables_and_dangling_foreign_keys() {
        let view = snapshot().filter(&TableAccess::only(["orders"]));
        assert_eq!(view.table_names(), vec!["orders"]);
        let orders = view.table("orders").unwrap();
        assert!(orders.column("customer_id").unwrap().foreign_key.is_none());
    }

    #[test]
    fn full_access_keeps_everything() {
        let full = snapshot();
        assert_eq!(full.filter(&TableAccess::All), full);
    }

    #[test]
    fn version_tracks_shape_not_fetch_time() {
        let a = snapshot();
        let mut b = snapshot();
        b.fetched_at = 99;
        assert_eq!(a.version, SchemaSnapshot::compute_version(&b.tables));
        assert_eq!(a.version.len(), 16);

        b.tables[1].columns.push(column("email", "text"));
        assert_ne!(a.version, SchemaSnapshot::compute_version(&b.tables));
    }

    #[test]
    fn schema_name_defaults_to_public_and_survives_filtering() {
        assert_eq!(snapshot().schema_name, "public");
        let view = snapshot()
            .with_schema_name("analytics")
            .filter(&TableAccess::only(["orders"]));
        assert_eq!(view.schema_name, "analytics");

        let mut raw = serde_json::to_value(snapshot()).unwrap();
        raw.as_object_mut().unwrap().remove("schemaName");
        let parsed: SchemaSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.schema_name, "public");
    }

    #[test]
    fn lookups_ignore_ascii_case() {
        let s = snapshot();
        assert!(s.table("ORDERS").is_some());
        assert!(s.table("orders").unwrap().column("Customer_ID").is_some());
        assert!(TableAccess::only(["Orders"]).allows("orders"));
    }
}
