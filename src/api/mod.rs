//! HTTP surface of the development metadata authority
//!
//! - `GET /?index=N` long-polls for a snapshot newer than `N`
//! - `POST /execute` applies a MessagePack-encoded command
//! - `HEAD /ping` (and `GET /ping`) answers 200 while serving
//! - `GET /health` plain-text liveness

mod telemetry;

use crate::meta::command::{Command, ExecuteResponse};
use crate::meta::store::MemoryStore;
use crate::meta::transport::CONTENT_TYPE_BINARY;
use crate::{Error, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build the metadata service router
pub fn meta_service_router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/", get(get_snapshot))
        .route("/execute", post(execute))
        .route("/ping", get(ping))
        .route("/health", get(health_check))
        .with_state(store)
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
}

/// Serve `store` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    store: Arc<MemoryStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Metadata service listening");
    axum::serve(listener, meta_service_router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))
}

#[derive(Debug, Deserialize)]
struct SnapshotParams {
    #[serde(default)]
    index: u64,
}

fn binary(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, CONTENT_TYPE_BINARY)], body).into_response()
}

fn internal_error(e: Error) -> Response {
    warn!(error = %e, "Metadata request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn get_snapshot(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<SnapshotParams>,
) -> Response {
    let snapshot = store.snapshot_after(params.index).await;
    debug!(requested = params.index, index = snapshot.index, "Serving snapshot");
    match snapshot.encode() {
        Ok(body) => binary(body),
        Err(e) => internal_error(e),
    }
}

async fn execute(State(store): State<Arc<MemoryStore>>, body: Bytes) -> Response {
    let command = match Command::decode(&body) {
        Ok(command) => command,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid command: {e}")).into_response();
        }
    };

    let kind = command.kind();
    match store.apply(command) {
        Ok(index) => {
            telemetry::record_command(kind, true);
            match (ExecuteResponse { index }).encode() {
                Ok(body) => binary(body),
                Err(e) => internal_error(e),
            }
        }
        Err(Error::Rejected(msg)) => {
            telemetry::record_command(kind, false);
            debug!(command = kind, reason = %msg, "Command rejected");
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Err(e) => {
            telemetry::record_command(kind, false);
            internal_error(e)
        }
    }
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaClientConfig;
    use crate::meta::data::Snapshot;
    use crate::meta::store::StoreConfig;
    use crate::meta::{HttpTransport, MutationSubmitter};
    use std::time::Duration;

    async fn spawn_service() -> (String, Arc<MemoryStore>, CancellationToken) {
        let store = Arc::new(MemoryStore::new(StoreConfig {
            long_poll_timeout: Duration::from_millis(100),
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, store.clone(), shutdown.clone()));
        (addr, store, shutdown)
    }

    #[tokio::test]
    async fn test_ping_answers_head() {
        let (addr, _store, shutdown) = spawn_service().await;
        let response = reqwest::Client::new()
            .head(format!("http://{addr}/ping"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_execute_returns_applied_index() {
        let (addr, store, shutdown) = spawn_service().await;
        let command = Command::CreateDatabase {
            name: "db0".to_string(),
            retention_policy: None,
        };
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/execute"))
            .body(command.encode().unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let applied = ExecuteResponse::decode(&response.bytes().await.unwrap()).unwrap();
        assert_eq!(applied.index, store.index());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_execute_rejects_garbage() {
        let (addr, _store, shutdown) = spawn_service().await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/execute"))
            .body(vec![0xc1, 0x00])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_long_poll_returns_current_after_timeout() {
        let (addr, store, shutdown) = spawn_service().await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/?index={}", store.index()))
            .send()
            .await
            .unwrap();
        let snapshot = Snapshot::decode(&response.bytes().await.unwrap()).unwrap();
        assert_eq!(snapshot.index, store.index());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_submit_moves_past_non_leader() {
        let follower = Router::new().route(
            "/execute",
            post(|| async { (StatusCode::BAD_REQUEST, "not the leader") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let follower_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { axum::serve(listener, follower).await });
        let (leader_addr, store, shutdown) = spawn_service().await;

        let servers = vec![follower_addr, leader_addr];
        let transport = HttpTransport::new(&MetaClientConfig::new(servers.clone())).unwrap();
        let submitter = MutationSubmitter::new(Arc::new(transport), Arc::new(servers));
        let receipt = submitter
            .submit(&Command::CreateDatabase {
                name: "db0".to_string(),
                retention_policy: None,
            })
            .await
            .unwrap();

        assert_eq!(receipt.index, Some(store.index()));
        assert!(store.snapshot().database("db0").is_some());
        shutdown.cancel();
    }
}
