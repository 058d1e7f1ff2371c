//! Query-interface wire types
//!
//! A node answers `/query` with
//! `{"results":[{"statement_id":0,"series":[{"name":..,"columns":[..],"values":[[..]]}]}]}`.
//! The statement executor produces these rows and the cluster harness parses them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Top-level body returned by the query endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Response carrying a single statement result
    pub fn single(result: StatementResult) -> Self {
        Self {
            results: vec![result],
            error: None,
        }
    }

    /// Response for a request that failed before any statement ran
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// First statement result, surfacing request and statement errors.
    pub fn into_first(self) -> Result<StatementResult> {
        if let Some(error) = self.error {
            return Err(Error::Query(error));
        }
        let result = self
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::Query("expected some results".to_string()))?;
        if let Some(error) = &result.error {
            return Err(Error::Query(error.clone()));
        }
        Ok(result)
    }
}

/// Result of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementResult {
    pub fn with_rows(series: Vec<Row>) -> Self {
        Self {
            statement_id: 0,
            series,
            error: None,
        }
    }

    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            statement_id: 0,
            series: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A named table of values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<Value>>,
}

impl Row {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, values: Vec<Value>) {
        self.values.push(values);
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::Parse(format!("can't find column called {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_query_body() {
        let body = json!({
            "results": [{
                "statement_id": 0,
                "series": [{
                    "name": "databases",
                    "columns": ["name"],
                    "values": [["_internal"], ["db0"]]
                }]
            }]
        });

        let response: Response = serde_json::from_value(body).unwrap();
        let result = response.into_first().unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].column_index("name").unwrap(), 0);
        assert_eq!(result.series[0].values[1][0], json!("db0"));
    }

    #[test]
    fn test_statement_error_surfaces() {
        let response = Response::single(StatementResult::with_error("database not found: x"));
        let err = response.into_first().unwrap_err();
        assert!(err.to_string().contains("database not found"));
    }

    #[test]
    fn test_empty_results_is_an_error() {
        let err = Response::default().into_first().unwrap_err();
        assert!(err.to_string().contains("expected some results"));
    }

    #[test]
    fn test_missing_column() {
        let row = Row::new("data_nodes", &["id", "http_addr"]);
        assert!(row.column_index("tcp_addr").is_err());
    }
}
