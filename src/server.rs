//! HTTP routes and the server loop
use super::email::EmailCreateRequest;
use super::handler::Adapter;
use super::service::EmailService;
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the application router.
pub fn router(service: EmailService, adapter: &Adapter) -> Router {
    let email_create = adapter.handler(move |ctx, req: EmailCreateRequest| {
        let service = service.clone();
        async move { service.email_create(ctx, req).await }
    });

    Router::new()
        .route("/emails", post(email_create))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serves `app` on `addr` until `shutdown` resolves. In-flight requests are
/// allowed to finish.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("mailq listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
