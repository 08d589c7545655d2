use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use surge_core::{Engine, EngineStatus, StatusPatch};

/// REST control API: status (read/patch), metric snapshots and the
/// group/check tree, all backed directly by the engine's accessors.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ApiServer {
    pub async fn start(bind_addr: SocketAddr, engine: Arc<Engine>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind control API: {bind_addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to resolve control API address")?;

        let app = router(engine);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let _ = self.task.await;
    }
}

fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/v1/status", get(get_status).patch(patch_status))
        .route("/v1/metrics", get(get_metrics))
        .route("/v1/groups", get(get_groups))
        .with_state(engine)
}

async fn get_status(State(engine): State<Arc<Engine>>) -> Json<EngineStatus> {
    Json(engine.status())
}

async fn patch_status(
    State(engine): State<Arc<Engine>>,
    Json(patch): Json<StatusPatch>,
) -> Result<Json<EngineStatus>, (StatusCode, Json<serde_json::Value>)> {
    engine.patch_status(&patch).map(Json).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
    })
}

async fn get_metrics(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "metrics": engine.metrics_summary() }))
}

async fn get_groups(State(engine): State<Arc<Engine>>) -> Json<surge_core::GroupSnapshot> {
    Json(engine.groups_snapshot())
}
