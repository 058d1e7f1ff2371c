//! Typed views over tabular query results
//!
//! Columns are located by name, never by position.

use crate::duration::parse_duration;
use crate::protocol::{Row, StatementResult};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Introspective statement whose result is being parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ShowServers,
    ShowDatabases,
    ShowMeasurements,
    ShowSeries,
    ShowTagKeys,
    ShowTagValues,
    ShowFieldKeys,
    ShowRetentionPolicies,
    ShowShards,
}

/// One row of `SHOW RETENTION POLICIES`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicyRow {
    pub name: String,
    pub duration: Duration,
    pub replica_n: u64,
    pub default: bool,
}

impl RetentionPolicyRow {
    pub fn new(name: impl Into<String>, duration: Duration, replica_n: u64, default: bool) -> Self {
        Self {
            name: name.into(),
            duration,
            replica_n,
            default,
        }
    }
}

/// One row of `SHOW SHARDS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRow {
    pub id: u64,
    pub database: String,
    pub retention_policy: String,
    pub shard_group: u64,
    pub owners: Vec<u64>,
}

/// Parsed data from a statement result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub data_servers: BTreeMap<u64, String>,
    pub meta_servers: BTreeMap<u64, String>,
    pub databases: Vec<String>,
    pub measurements: Vec<String>,
    pub series: BTreeMap<String, Vec<String>>,
    pub tag_keys: BTreeMap<String, Vec<String>>,
    pub tag_values: BTreeMap<String, Vec<String>>,
    pub field_keys: BTreeMap<String, Vec<String>>,
    pub retention_policies: BTreeMap<String, RetentionPolicyRow>,
    pub shards: Vec<ShardRow>,
}

impl CommandResult {
    pub fn has_database(&self, name: &str) -> bool {
        self.databases.iter().any(|db| db == name)
    }

    pub fn has_measurement(&self, name: &str) -> bool {
        self.measurements.iter().any(|m| m == name)
    }

    /// True if `measurement` has exactly the series keys in `series`.
    ///
    /// An absent measurement matches an empty expectation.
    pub fn has_series(&self, measurement: &str, series: &[&str]) -> bool {
        match self.series.get(measurement) {
            Some(got) => same_set(got, series),
            None => series.is_empty(),
        }
    }

    /// True if at least one series of `measurement` was returned.
    pub fn has_series_for_measurement(&self, measurement: &str) -> bool {
        self.series
            .get(measurement)
            .is_some_and(|keys| !keys.is_empty())
    }

    pub fn has_tag_keys(&self, measurement: &str, keys: &[&str]) -> bool {
        self.tag_keys
            .get(measurement)
            .is_some_and(|got| same_set(got, keys))
    }

    pub fn has_tag_values(&self, measurement: &str, values: &[&str]) -> bool {
        self.tag_values
            .get(measurement)
            .is_some_and(|got| same_set(got, values))
    }

    pub fn has_field_keys(&self, measurement: &str, keys: &[&str]) -> bool {
        self.field_keys
            .get(measurement)
            .is_some_and(|got| same_set(got, keys))
    }

    pub fn has_retention_policy(&self, rp: &RetentionPolicyRow) -> bool {
        self.retention_policies.get(&rp.name) == Some(rp)
    }

    pub fn shards_for_db(&self, database: &str) -> Vec<&ShardRow> {
        self.shards
            .iter()
            .filter(|shard| shard.database == database)
            .collect()
    }
}

fn same_set(got: &[String], want: &[&str]) -> bool {
    if got.len() != want.len() {
        return false;
    }
    let mut got: Vec<&str> = got.iter().map(String::as_str).collect();
    let mut want = want.to_vec();
    got.sort_unstable();
    want.sort_unstable();
    got == want
}

/// Parse `result` as the output of `kind`.
pub fn parse_result(kind: CommandKind, result: &StatementResult) -> Result<CommandResult> {
    let mut parsed = CommandResult::default();

    for row in &result.series {
        if row.values.iter().any(|value| value.is_empty()) {
            return Err(Error::Parse(format!("row {:?} has an empty value", row.name)));
        }

        match kind {
            CommandKind::ShowServers => parse_servers(row, &mut parsed)?,
            CommandKind::ShowDatabases => {
                parsed.databases.extend(string_column(row, "name")?);
            }
            CommandKind::ShowMeasurements => {
                parsed.measurements.extend(string_column(row, "name")?);
            }
            CommandKind::ShowSeries => append_keyed(&mut parsed.series, row, "_key")?,
            CommandKind::ShowTagKeys => append_keyed(&mut parsed.tag_keys, row, "tagKey")?,
            CommandKind::ShowTagValues => append_keyed(&mut parsed.tag_values, row, "value")?,
            CommandKind::ShowFieldKeys => append_keyed(&mut parsed.field_keys, row, "fieldKey")?,
            CommandKind::ShowRetentionPolicies => parse_retention_policies(row, &mut parsed)?,
            CommandKind::ShowShards => parse_shards(row, &mut parsed)?,
        }
    }
    Ok(parsed)
}

fn parse_servers(row: &Row, parsed: &mut CommandResult) -> Result<()> {
    let target = match row.name.as_str() {
        "data_nodes" => &mut parsed.data_servers,
        "meta_nodes" => &mut parsed.meta_servers,
        other => return Err(Error::Parse(format!("unknown row name {:?}", other))),
    };
    let id_idx = row.column_index("id")?;
    let addr_idx = row.column_index("http_addr")?;
    for value in &row.values {
        let id = as_u64(cell(value, id_idx)?)?;
        let addr = as_str(cell(value, addr_idx)?)?;
        target.insert(id, addr.to_string());
    }
    Ok(())
}

fn parse_retention_policies(row: &Row, parsed: &mut CommandResult) -> Result<()> {
    let name_idx = row.column_index("name")?;
    let duration_idx = row.column_index("duration")?;
    let replica_idx = row.column_index("replicaN")?;
    let default_idx = row.column_index("default")?;

    for value in &row.values {
        let rp = RetentionPolicyRow {
            name: as_str(cell(value, name_idx)?)?.to_string(),
            duration: parse_duration(as_str(cell(value, duration_idx)?)?)?,
            replica_n: as_u64(cell(value, replica_idx)?)?,
            default: as_bool(cell(value, default_idx)?)?,
        };
        parsed.retention_policies.insert(rp.name.clone(), rp);
    }
    Ok(())
}

fn parse_shards(row: &Row, parsed: &mut CommandResult) -> Result<()> {
    let id_idx = row.column_index("id")?;
    let database_idx = row.column_index("database")?;
    let rp_idx = row.column_index("retention_policy")?;
    let group_idx = row.column_index("shard_group")?;
    let owners_idx = row.column_index("owners")?;

    for value in &row.values {
        let owners = as_str(cell(value, owners_idx)?)?
            .split(',')
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .map(|owner| {
                owner
                    .parse::<u64>()
                    .map_err(|e| Error::Parse(format!("invalid shard owner {:?}: {}", owner, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        parsed.shards.push(ShardRow {
            id: as_u64(cell(value, id_idx)?)?,
            database: as_str(cell(value, database_idx)?)?.to_string(),
            retention_policy: as_str(cell(value, rp_idx)?)?.to_string(),
            shard_group: as_u64(cell(value, group_idx)?)?,
            owners,
        });
    }
    Ok(())
}

fn string_column(row: &Row, column: &str) -> Result<Vec<String>> {
    let idx = row.column_index(column)?;
    row.values
        .iter()
        .map(|value| cell(value, idx).and_then(as_str).map(str::to_string))
        .collect()
}

fn append_keyed(target: &mut BTreeMap<String, Vec<String>>, row: &Row, column: &str) -> Result<()> {
    let values = string_column(row, column)?;
    target.entry(row.name.clone()).or_default().extend(values);
    Ok(())
}

/// Value at `idx`, or a parse error when the row is shorter than its columns.
fn cell(values: &[Value], idx: usize) -> Result<&Value> {
    values.get(idx).ok_or_else(|| {
        Error::Parse(format!(
            "row has {} values, expected a value in column {}",
            values.len(),
            idx
        ))
    })
}

fn as_bool(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::Parse(format!("could not parse {} as bool", value)))
}

fn as_str(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::Parse(format!("could not parse {} as string", value)))
}

fn as_u64(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::Parse(format!("could not parse {} as integer", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(rows: Vec<Row>) -> StatementResult {
        StatementResult::with_rows(rows)
    }

    #[test]
    fn test_parse_show_servers() {
        let mut data = Row::new("data_nodes", &["id", "http_addr", "tcp_addr"]);
        data.push(vec![json!(4), json!("localhost:8186"), json!("localhost:8188")]);
        let mut meta = Row::new("meta_nodes", &["id", "http_addr", "tcp_addr"]);
        meta.push(vec![json!(1), json!("localhost:8191"), json!("localhost:8188")]);

        let parsed = parse_result(CommandKind::ShowServers, &result(vec![data, meta])).unwrap();
        assert_eq!(parsed.data_servers.get(&4).unwrap(), "localhost:8186");
        assert_eq!(parsed.meta_servers.get(&1).unwrap(), "localhost:8191");
    }

    #[test]
    fn test_unknown_server_row_is_an_error() {
        let mut row = Row::new("gossip_nodes", &["id", "http_addr"]);
        row.push(vec![json!(1), json!("a")]);
        let err = parse_result(CommandKind::ShowServers, &result(vec![row])).unwrap_err();
        assert!(err.to_string().contains("unknown row name"));
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let mut row = Row::new("databases", &["id"]);
        row.push(vec![json!(1)]);
        assert!(parse_result(CommandKind::ShowDatabases, &result(vec![row])).is_err());
    }

    #[test]
    fn test_short_row_is_an_error() {
        let mut dbs = Row::new("databases", &["id", "name"]);
        dbs.push(vec![json!(1)]);
        let err = parse_result(CommandKind::ShowDatabases, &result(vec![dbs])).unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err}");

        let mut servers = Row::new("data_nodes", &["id", "http_addr"]);
        servers.push(vec![json!(4)]);
        assert!(parse_result(CommandKind::ShowServers, &result(vec![servers])).is_err());

        let mut rps = Row::new("", &["name", "duration", "replicaN", "default"]);
        rps.push(vec![json!("rp0"), json!("1h"), json!(1)]);
        assert!(parse_result(CommandKind::ShowRetentionPolicies, &result(vec![rps])).is_err());

        let mut shards = Row::new(
            "db0",
            &["id", "database", "retention_policy", "shard_group", "owners"],
        );
        shards.push(vec![json!(1), json!("db0")]);
        assert!(parse_result(CommandKind::ShowShards, &result(vec![shards])).is_err());
    }

    #[test]
    fn test_databases_and_measurements() {
        let mut dbs = Row::new("databases", &["name"]);
        dbs.push(vec![json!("db0")]);
        dbs.push(vec![json!("db1")]);
        let parsed = parse_result(CommandKind::ShowDatabases, &result(vec![dbs])).unwrap();
        assert!(parsed.has_database("db1"));
        assert!(!parsed.has_database("db2"));

        let mut ms = Row::new("measurements", &["name"]);
        ms.push(vec![json!("cpu")]);
        let parsed = parse_result(CommandKind::ShowMeasurements, &result(vec![ms])).unwrap();
        assert!(parsed.has_measurement("cpu"));
        assert!(!parsed.has_measurement("memory"));
    }

    #[test]
    fn test_series_checks() {
        let mut cpu = Row::new("cpu", &["_key"]);
        cpu.push(vec![json!("cpu,foo=bar")]);
        cpu.push(vec![json!("cpu,foo=zoo")]);
        let parsed = parse_result(CommandKind::ShowSeries, &result(vec![cpu])).unwrap();

        assert!(parsed.has_series("cpu", &["cpu,foo=zoo", "cpu,foo=bar"]));
        assert!(!parsed.has_series("cpu", &["cpu,foo=bar"]));
        assert!(parsed.has_series("memory", &[]));
        assert!(!parsed.has_series("memory", &["memory,a=b"]));
        assert!(parsed.has_series_for_measurement("cpu"));
        assert!(!parsed.has_series_for_measurement("memory"));
    }

    #[test]
    fn test_tag_and_field_keys() {
        let mut cpu = Row::new("cpu", &["tagKey"]);
        cpu.push(vec![json!("zah")]);
        cpu.push(vec![json!("foo")]);
        let parsed = parse_result(CommandKind::ShowTagKeys, &result(vec![cpu])).unwrap();
        assert!(parsed.has_tag_keys("cpu", &["foo", "zah"]));
        assert!(!parsed.has_tag_keys("memory", &[]));

        let mut values = Row::new("cpu", &["key", "value"]);
        values.push(vec![json!("foo"), json!("bar")]);
        let parsed = parse_result(CommandKind::ShowTagValues, &result(vec![values])).unwrap();
        assert!(parsed.has_tag_values("cpu", &["bar"]));

        let mut fields = Row::new("cpu", &["fieldKey", "fieldType"]);
        fields.push(vec![json!("value"), json!("float")]);
        fields.push(vec![json!("boo"), json!("float")]);
        let parsed = parse_result(CommandKind::ShowFieldKeys, &result(vec![fields])).unwrap();
        assert!(parsed.has_field_keys("cpu", &["boo", "value"]));
    }

    #[test]
    fn test_retention_policies() {
        let mut row = Row::new(
            "",
            &["name", "duration", "shardGroupDuration", "replicaN", "default"],
        );
        row.push(vec![json!("autogen"), json!("0s"), json!("168h0m0s"), json!(1), json!(false)]);
        row.push(vec![json!("rp0"), json!("1h0m0s"), json!("1h0m0s"), json!(2), json!(true)]);
        let parsed = parse_result(CommandKind::ShowRetentionPolicies, &result(vec![row])).unwrap();

        let rp0 = RetentionPolicyRow::new("rp0", Duration::from_secs(3600), 2, true);
        assert!(parsed.has_retention_policy(&rp0));
        let wrong = RetentionPolicyRow::new("rp0", Duration::from_secs(3600), 1, true);
        assert!(!parsed.has_retention_policy(&wrong));
        assert!(parsed.has_retention_policy(&RetentionPolicyRow::new(
            "autogen",
            Duration::ZERO,
            1,
            false
        )));
    }

    #[test]
    fn test_non_bool_default_is_an_error() {
        let mut row = Row::new("", &["name", "duration", "replicaN", "default"]);
        row.push(vec![json!("rp0"), json!("1h"), json!(1), json!("yes")]);
        assert!(parse_result(CommandKind::ShowRetentionPolicies, &result(vec![row])).is_err());
    }

    #[test]
    fn test_shards_for_db() {
        let columns = [
            "id",
            "database",
            "retention_policy",
            "shard_group",
            "start_time",
            "end_time",
            "expiry_time",
            "owners",
        ];
        let mut db0 = Row::new("db0", &columns);
        db0.push(vec![
            json!(1),
            json!("db0"),
            json!("autogen"),
            json!(1),
            json!("2026-01-05T00:00:00+00:00"),
            json!("2026-01-12T00:00:00+00:00"),
            json!("2026-01-12T00:00:00+00:00"),
            json!("4,5"),
        ]);
        let mut db1 = Row::new("db1", &columns);
        db1.push(vec![
            json!(2),
            json!("db1"),
            json!("autogen"),
            json!(2),
            json!("2026-01-05T00:00:00+00:00"),
            json!("2026-01-12T00:00:00+00:00"),
            json!("2026-01-12T00:00:00+00:00"),
            json!(""),
        ]);
        let parsed = parse_result(CommandKind::ShowShards, &result(vec![db0, db1])).unwrap();

        let shards = parsed.shards_for_db("db0");
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].owners, vec![4, 5]);
        assert!(parsed.shards_for_db("db1")[0].owners.is_empty());
        assert!(parsed.shards_for_db("db2").is_empty());
    }
}
