//! HTTP client for a node's query interface
//!
//! - `GET /query?q=<statement>&db=<database>` returns a JSON [`Response`]
//! - `POST /write?db=<database>[&rp=<policy>]` takes newline-separated points
//! - `GET /ping` answers 204 when the node is up

use super::line_protocol::Point;
use crate::protocol::{Response, StatementResult};
use crate::{Error, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Client for one node
#[derive(Debug, Clone)]
pub struct QueryClient {
    http: Client,
    addr: String,
}

impl QueryClient {
    /// `addr` is `host:port`; a scheme prefix is accepted and kept.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        let addr = addr.into();
        let addr = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr
        } else {
            format!("http://{}", addr)
        };
        Ok(Self { http, addr })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run `statement` and return its first result.
    pub async fn query(&self, statement: &str, database: &str) -> Result<StatementResult> {
        let url = format!("{}/query", self.addr);
        let mut params = vec![("q", statement)];
        if !database.is_empty() {
            params.push(("db", database));
        }
        let response = self.http.get(&url).query(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<Response>(&body) {
            Ok(parsed) if status.is_success() || parsed.error.is_some() => parsed.into_first(),
            _ if status.is_success() => Err(Error::Parse(format!(
                "could not decode query response from {}",
                url
            ))),
            _ => Err(Error::UnexpectedStatus {
                url,
                status: status.as_u16(),
                body,
            }),
        }
    }

    /// Write `points` into `database`, optionally into a named retention policy.
    pub async fn write(&self, database: &str, policy: Option<&str>, points: &[Point]) -> Result<()> {
        let url = format!("{}/write", self.addr);
        let mut params = vec![("db", database)];
        if let Some(policy) = policy {
            params.push(("rp", policy));
        }
        let body = points
            .iter()
            .map(Point::to_string)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self.http.post(&url).query(&params).body(body).send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<Response>(&body) {
            if let Some(error) = parsed.error {
                return Err(Error::Query(error));
            }
        }
        Err(Error::UnexpectedStatus {
            url,
            status: status.as_u16(),
            body,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.addr);
        let response = self.http.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_added_once() {
        let plain = QueryClient::new("localhost:8186", Duration::from_secs(1)).unwrap();
        assert_eq!(plain.addr(), "http://localhost:8186");
        let explicit = QueryClient::new("https://db.example:8086", Duration::from_secs(1)).unwrap();
        assert_eq!(explicit.addr(), "https://db.example:8086");
    }
}
