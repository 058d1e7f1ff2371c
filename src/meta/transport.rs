//! Wire contract with the metadata authority
//!
//! - `GET {scheme}://{server}?index=N` long-polls for a snapshot newer than `N`
//! - `POST {scheme}://{server}/execute` submits a binary command
//! - `HEAD {scheme}://{server}/ping` answers 200 while the server accepts requests

use super::command::{Command, ExecuteResponse};
use super::data::Snapshot;
use crate::config::MetaClientConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};

/// Content type of snapshot and command bodies.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Outcome of a successful command submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandReceipt {
    /// Index the command was applied at, when the server reports it.
    pub index: Option<u64>,
}

/// Transport to a set of equally authoritative metadata servers.
#[async_trait]
pub trait MetaTransport: Send + Sync + 'static {
    /// Fetch a snapshot newer than `index`; the server may hold the request.
    async fn fetch_snapshot(&self, server: &str, index: u64) -> Result<Snapshot>;

    /// Submit a command to one server.
    async fn submit(&self, server: &str, command: &Command) -> Result<CommandReceipt>;

    /// Liveness check.
    async fn ping(&self, server: &str) -> Result<()>;
}

/// HTTP(S) transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    tls: bool,
}

impl HttpTransport {
    pub fn new(config: &MetaClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            tls: config.tls,
        })
    }

    fn url(&self, server: &str, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, server, path)
    }
}

async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::BAD_REQUEST {
        return Err(Error::Rejected(body.trim().to_string()));
    }
    Err(Error::UnexpectedStatus {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MetaTransport for HttpTransport {
    async fn fetch_snapshot(&self, server: &str, index: u64) -> Result<Snapshot> {
        let url = self.url(server, "");
        let response = self
            .client
            .get(&url)
            .query(&[("index", index)])
            .send()
            .await?;
        let response = check_status(&url, response).await?;
        let body = response.bytes().await?;
        Snapshot::decode(&body)
    }

    async fn submit(&self, server: &str, command: &Command) -> Result<CommandReceipt> {
        let url = self.url(server, "/execute");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_BINARY)
            .body(command.encode()?)
            .send()
            .await?;
        let response = check_status(&url, response).await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(CommandReceipt::default());
        }
        let applied = ExecuteResponse::decode(&body)?;
        Ok(CommandReceipt {
            index: Some(applied.index),
        })
    }

    async fn ping(&self, server: &str) -> Result<()> {
        let url = self.url(server, "/ping");
        let response = self.client.head(&url).send().await?;
        check_status(&url, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_follows_tls() {
        let mut config = MetaClientConfig::new(vec!["localhost:8091".to_string()]);
        let plain = HttpTransport::new(&config).unwrap();
        assert_eq!(plain.url("localhost:8091", "/ping"), "http://localhost:8091/ping");

        config.tls = true;
        let tls = HttpTransport::new(&config).unwrap();
        assert_eq!(tls.url("localhost:8091", ""), "https://localhost:8091");
    }
}
