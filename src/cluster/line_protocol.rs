//! Line protocol parsing
//!
//! `measurement[,tag=value...] field=value[,field=value...] [timestamp]`
//!
//! Points are validated before they are written so a malformed point fails the
//! step locally instead of surfacing as a node error.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Field value of a point
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "\"{}\"", v.replace('"', "\\\"")),
        }
    }
}

/// A parsed point
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: Option<i64>,
}

impl Point {
    /// Series key: measurement plus sorted tags, e.g. `cpu,foo=bar,zah=zoo`.
    pub fn series_key(&self) -> String {
        let mut key = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            key.push(',');
            key.push_str(&escape(k, &[',', '=', ' ']));
            key.push('=');
            key.push_str(&escape(v, &[',', '=', ' ']));
        }
        key
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.series_key())?;
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k, &[',', '=', ' ']), v))
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&fields)?;
        if let Some(ts) = self.timestamp {
            write!(f, " {}", ts)?;
        }
        Ok(())
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Parse newline-separated points. Blank lines and `#` comments are skipped.
pub fn parse_points(input: &str) -> Result<Vec<Point>> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_point)
        .collect()
}

/// Parse a single point.
pub fn parse_point(line: &str) -> Result<Point> {
    let sections = split_unescaped(line, ' ', true);
    let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
    let (key, fields, timestamp) = match sections.as_slice() {
        [key, fields] => (*key, *fields, None),
        [key, fields, ts] => (*key, *fields, Some(*ts)),
        _ => return Err(invalid(line, "expected series key, fields and optional timestamp")),
    };

    if key.starts_with(',') {
        return Err(invalid(line, "missing measurement"));
    }
    let mut key_parts = split_unescaped(key, ',', false).into_iter();
    let measurement = unescape(&key_parts.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err(invalid(line, "missing measurement"));
    }

    let mut tags = BTreeMap::new();
    for tag in key_parts {
        let (k, v) = split_pair(&tag).ok_or_else(|| invalid(line, "tag without value"))?;
        if k.is_empty() || v.is_empty() {
            return Err(invalid(line, "empty tag key or value"));
        }
        tags.insert(unescape(&k), unescape(&v));
    }

    let mut parsed_fields = BTreeMap::new();
    for field in split_unescaped(fields, ',', true) {
        let (k, v) = split_pair(&field).ok_or_else(|| invalid(line, "field without value"))?;
        if k.is_empty() {
            return Err(invalid(line, "empty field key"));
        }
        parsed_fields.insert(unescape(&k), parse_field_value(line, &v)?);
    }
    if parsed_fields.is_empty() {
        return Err(invalid(line, "missing fields"));
    }

    let timestamp = timestamp
        .map(|ts| {
            ts.parse::<i64>()
                .map_err(|_| invalid(line, "timestamp is not an integer"))
        })
        .transpose()?;

    Ok(Point {
        measurement,
        tags,
        fields: parsed_fields,
        timestamp,
    })
}

fn parse_field_value(line: &str, raw: &str) -> Result<FieldValue> {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(FieldValue::String(raw[1..raw.len() - 1].replace("\\\"", "\"")));
    }
    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
        _ => {}
    }
    if let Some(int) = raw.strip_suffix('i') {
        return int
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| invalid(line, "invalid integer field"));
    }
    raw.parse::<f64>()
        .map(FieldValue::Float)
        .map_err(|_| invalid(line, "invalid field value"))
}

fn invalid(line: &str, reason: &str) -> Error {
    Error::Parse(format!("unable to parse {:?}: {}", line, reason))
}

/// Split on `sep` outside backslash escapes (and outside double quotes when
/// `quotes` is set). Escapes are kept so later stages can still see them.
fn split_unescaped(input: &str, sep: char, quotes: bool) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut quoted = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' if quotes => {
                quoted = !quoted;
                current.push(c);
            }
            c if c == sep && !quoted => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn split_pair(raw: &str) -> Option<(String, String)> {
    let mut escaped = false;
    for (i, c) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' => return Some((raw[..i].to_string(), raw[i + 1..].to_string())),
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point_with_tags() {
        let point = parse_point("cpu,zah=zoo,foo=bar value=1,boo=2i 100").unwrap();
        assert_eq!(point.measurement, "cpu");
        assert_eq!(point.tags.get("foo").unwrap(), "bar");
        assert_eq!(point.fields.get("value"), Some(&FieldValue::Float(1.0)));
        assert_eq!(point.fields.get("boo"), Some(&FieldValue::Integer(2)));
        assert_eq!(point.timestamp, Some(100));
        assert_eq!(point.series_key(), "cpu,foo=bar,zah=zoo");
    }

    #[test]
    fn test_parse_point_without_tags() {
        let point = parse_point("memory power=true").unwrap();
        assert!(point.tags.is_empty());
        assert_eq!(point.fields.get("power"), Some(&FieldValue::Boolean(true)));
        assert_eq!(point.series_key(), "memory");
    }

    #[test]
    fn test_string_fields_may_contain_separators() {
        let point = parse_point(r#"log,host=a msg="hello, world" 5"#).unwrap();
        assert_eq!(
            point.fields.get("msg"),
            Some(&FieldValue::String("hello, world".to_string()))
        );
    }

    #[test]
    fn test_escaped_tag_values() {
        let point = parse_point(r"cpu,host=a\ b value=1").unwrap();
        assert_eq!(point.tags.get("host").unwrap(), "a b");
        assert_eq!(point.series_key(), r"cpu,host=a\ b");
    }

    #[test]
    fn test_rejects_malformed_points() {
        assert!(parse_point("cpu").is_err());
        assert!(parse_point("cpu,foo value=1").is_err());
        assert!(parse_point("cpu value=abc").is_err());
        assert!(parse_point("cpu value=1 notatime").is_err());
        assert!(parse_point(",foo=bar value=1").is_err());
    }

    #[test]
    fn test_parse_points_skips_blank_lines() {
        let points = parse_points("cpu value=1\n\n# comment\nmemory value=2\n").unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_display_is_parseable() {
        let point = parse_point("cpu,foo=bar value=1.5,n=3i 7").unwrap();
        assert_eq!(parse_point(&point.to_string()).unwrap(), point);
    }
}
