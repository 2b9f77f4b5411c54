//! In-memory data source backing the `model`, `select` and `query`
//! script bindings.
//!
//! Models and query results are registered up front; `select` reads rows
//! from named tables with an optional equality filter and limit. Lookups
//! that miss fail with a backend error, which scripts observe as thrown
//! errors.

use dashmap::DashMap;
use flowline_core::services::DataSource;
use flowline_types::{ContextMap, HostError};
use serde_json::Value;

/// Data source over in-memory tables and canned query results.
#[derive(Default)]
pub struct MemoryDataSource {
    models: DashMap<String, Value>,
    tables: DashMap<String, Vec<Value>>,
    queries: DashMap<String, Value>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model handle for `model(database, name)`.
    pub fn with_model(self, database: &str, name: &str, handle: Value) -> Self {
        self.models.insert(model_key(database, name), handle);
        self
    }

    /// Register rows for `select({ from: <table>, ... })`.
    pub fn with_table(self, table: &str, rows: Vec<Value>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    /// Register a canned result for `query(database, sql, ...)`.
    pub fn with_query(self, database: &str, sql: &str, result: Value) -> Self {
        self.queries.insert(query_key(database, sql), result);
        self
    }
}

fn model_key(database: &str, name: &str) -> String {
    format!("{database}.{name}")
}

fn query_key(database: &str, sql: &str) -> String {
    format!("{database}\u{1}{sql}")
}

impl DataSource for MemoryDataSource {
    fn model(&self, database: &str, name: &str) -> Result<Value, HostError> {
        self.models
            .get(&model_key(database, name))
            .map(|handle| handle.clone())
            .ok_or_else(|| HostError::Backend(format!("model not found: {database}.{name}")))
    }

    fn select(&self, query: &ContextMap) -> Result<Value, HostError> {
        let table = query
            .get("from")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HostError::Backend("select requires a `from` table".into()))?;
        let rows = self
            .tables
            .get(table)
            .map(|rows| rows.clone())
            .ok_or_else(|| HostError::Backend(format!("table not found: {table}")))?;

        let mut rows: Vec<Value> = match query.get("where").and_then(|v| v.as_object()) {
            Some(filter) => rows
                .into_iter()
                .filter(|row| {
                    filter
                        .iter()
                        .all(|(key, expected)| row.get(key) == Some(expected))
                })
                .collect(),
            None => rows,
        };

        if let Some(limit) = query.get("limit").and_then(|v| v.as_u64()) {
            rows.truncate(limit as usize);
        }

        Ok(Value::Array(rows))
    }

    fn query(&self, database: &str, sql: &str, _params: &[Value]) -> Result<Value, HostError> {
        self.queries
            .get(&query_key(database, sql))
            .map(|result| result.clone())
            .ok_or_else(|| {
                HostError::Backend(format!("no result registered for query: {sql}"))
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MemoryDataSource {
        MemoryDataSource::new()
            .with_model("crm", "customer", json!({ "fields": ["id", "name"] }))
            .with_table(
                "orders",
                vec![
                    json!({ "id": 1, "state": "open" }),
                    json!({ "id": 2, "state": "closed" }),
                    json!({ "id": 3, "state": "open" }),
                ],
            )
            .with_query("crm", "select count(*) from orders", json!([{ "count": 3 }]))
    }

    fn map(value: Value) -> ContextMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn model_lookup_hits_and_misses() {
        let source = source();
        assert_eq!(
            source.model("crm", "customer").unwrap()["fields"][0],
            json!("id")
        );
        assert!(source.model("crm", "nope").is_err());
    }

    #[test]
    fn select_filters_and_limits() {
        let source = source();
        let rows = source
            .select(&map(json!({ "from": "orders", "where": { "state": "open" } })))
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);

        let rows = source
            .select(&map(json!({ "from": "orders", "limit": 1 })))
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[test]
    fn select_requires_from() {
        let source = source();
        assert!(source.select(&map(json!({ "limit": 1 }))).is_err());
    }

    #[test]
    fn query_returns_canned_result() {
        let source = source();
        let result = source
            .query("crm", "select count(*) from orders", &[])
            .unwrap();
        assert_eq!(result[0]["count"], json!(3));
        assert!(source.query("crm", "select 1", &[]).is_err());
    }
}
