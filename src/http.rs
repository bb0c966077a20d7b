//! HTTP endpoint serving the latest snapshot as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::connection::RegisterReader;
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not determine the listening address")]
    LocalAddress(#[source] std::io::Error),
    #[error("HTTP server failed")]
    Serve(#[source] std::io::Error),
}

/// What to answer when refreshing for a request fails.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnError {
    /// Answer `503 Service Unavailable` with the error.
    #[default]
    Strict,
    /// Serve the last good snapshot, if there is one.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Every request refreshes the store first.
    OnRequest(OnError),
    /// A poller refreshes the store; requests only read it.
    Background,
}

struct AppState<R> {
    store: Arc<SnapshotStore<R>>,
    mode: Mode,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), mode: self.mode }
    }
}

pub fn create_router<R: RegisterReader + 'static>(
    store: Arc<SnapshotStore<R>>,
    mode: Mode,
) -> Router {
    Router::new()
        .route("/", get(snapshot_handler::<R>))
        .fallback(not_found)
        .with_state(AppState { store, mode })
}

async fn snapshot_handler<R: RegisterReader + 'static>(
    State(state): State<AppState<R>>,
) -> Response {
    let on_error = match state.mode {
        Mode::Background => {
            return match state.store.get() {
                Some(snapshot) => values(&snapshot),
                None => unavailable("no snapshot has been taken yet".into()),
            };
        }
        Mode::OnRequest(on_error) => on_error,
    };
    match state.store.refresh().await {
        Ok(snapshot) => values(&snapshot),
        Err(e) => match (on_error, state.store.get()) {
            (OnError::Stale, Some(snapshot)) => values(&snapshot),
            _ => unavailable(error_chain(&*e)),
        },
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found\n").into_response()
}

fn values(snapshot: &Snapshot) -> Response {
    Json(&snapshot.values).into_response()
}

fn unavailable(message: String) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": message })))
        .into_response()
}

/// The error followed by all of its sources, separated by `: `.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

/// Serve `router` until interrupted with Ctrl+C.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), Error> {
    let address = listener.local_addr().map_err(Error::LocalAddress)?;
    info!(message = "listening", %address);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Serve)?;
    info!(message = "HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(message = "cannot listen for Ctrl+C", error = (&e as &dyn std::error::Error));
        std::future::pending::<()>().await;
    }
    info!(message = "shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AccessCode;
    use crate::snapshot::tests::{ScriptedReader, catalog_ab};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn store() -> Arc<SnapshotStore<ScriptedReader>> {
        let reader = ScriptedReader::default();
        reader.set(3, AccessCode::Holding, vec![1234, 56]);
        Arc::new(SnapshotStore::new(reader, catalog_ab(), None))
    }

    async fn get_path(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response =
            router.oneshot(Request::get(path).body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn serves_fresh_values() {
        let router = create_router(store(), Mode::OnRequest(OnError::Strict));
        let (status, json) = get_path(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"A": 123.4, "B": 56}));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let router = create_router(store(), Mode::OnRequest(OnError::Strict));
        let (status, _) = get_path(router, "/F04").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn strict_reports_refresh_failure() {
        let store = store();
        store.refresh().await.unwrap();
        let router = create_router(Arc::clone(&store), Mode::OnRequest(OnError::Strict));
        store_fails(&store);
        let (status, json) = get_path(router, "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let message = json["error"].as_str().unwrap();
        assert!(message.contains("modbus exception code 4"), "{message}");
    }

    #[tokio::test]
    async fn stale_serves_last_good_snapshot() {
        let store = store();
        let router = create_router(Arc::clone(&store), Mode::OnRequest(OnError::Stale));
        let (status, _) = get_path(router.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        store_fails(&store);
        let (status, json) = get_path(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"A": 123.4, "B": 56}));
    }

    #[tokio::test]
    async fn stale_without_snapshot_is_unavailable() {
        let store = store();
        store_fails(&store);
        let router = create_router(store, Mode::OnRequest(OnError::Stale));
        let (status, json) = get_path(router, "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn background_mode_only_reads_the_store() {
        let store = store();
        let router = create_router(Arc::clone(&store), Mode::Background);
        let (status, _) = get_path(router.clone(), "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        store.refresh().await.unwrap();
        let (status, json) = get_path(router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["B"], 56);
        assert_eq!(store.reader().reads(), 1);
    }

    fn store_fails(store: &SnapshotStore<ScriptedReader>) {
        store.reader().fail(3, AccessCode::Holding, 4);
    }
}
