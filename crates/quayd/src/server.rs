//! HTTP admin API
//!
//! `POST /admin/api` takes one [`AdminRequest`] as JSON and answers with an
//! [`AdminEnvelope`]. Operation failures are reported inside the envelope
//! with status 200; only unparseable requests get a 400.
//!
//! Embedders can serve their own routes on the same listener by passing a
//! router to [`start_admin_server`].

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use quay_cluster::{api, AdminEnvelope, AdminRequest, Controller, HealthView};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Admin request bodies are small
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared handler state
#[derive(Clone)]
pub struct AdminState {
    pub controller: Arc<Controller>,
}

/// Build the admin router
pub fn create_admin_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/api", post(admin_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { controller })
}

/// Merge `custom` routes into the admin router.
///
/// Panics like [`Router::merge`] if a custom path overlaps an admin route.
pub fn with_custom_routes(admin: Router, custom: Option<Router>) -> Router {
    match custom {
        Some(custom) => admin.merge(custom),
        None => admin,
    }
}

/// Serve the admin API, plus any `custom` routes, until `shutdown` resolves
pub async fn start_admin_server<F>(
    bind_addr: SocketAddr,
    controller: Arc<Controller>,
    custom: Option<Router>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = with_custom_routes(create_admin_router(controller), custom);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Starting admin API server on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let health = HealthView::from(state.controller.health());
    let status_code = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

/// Admin operation endpoint
async fn admin_handler(State(state): State<AdminState>, body: Bytes) -> impl IntoResponse {
    let request: AdminRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed admin request");
            return (
                StatusCode::BAD_REQUEST,
                Json(AdminEnvelope::error(format!("Invalid request: {}", e))),
            );
        }
    };

    let op = request.name();
    let envelope = AdminEnvelope::from(api::dispatch(&state.controller, request).await);
    if !envelope.is_ok() {
        debug!(op, "Admin operation failed");
    }
    (StatusCode::OK, Json(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use quay_cluster::ControllerConfig;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    async fn controller() -> Arc<Controller> {
        let config = ControllerConfig::builder()
            .advertise_uri("localhost:0")
            .alias("admin-test")
            .cluster_addr("127.0.0.1:0".parse().unwrap())
            .build();
        Controller::start(config).await.unwrap()
    }

    async fn call(router: &Router, body: Value) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/api")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_unconfigured_queries() {
        let controller = controller().await;
        let router = create_admin_router(controller.clone());

        let (status, body) = call(&router, json!({"op": "cluster.self"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["uri"], controller.uri());
        assert_eq!(body["data"]["alias"], "admin-test");
        assert_eq!(body["data"]["state"], "unconfigured");
        assert!(body["data"]["uuid"].is_null());

        let (_, body) = call(&router, json!({"op": "servers"})).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["status"], "unconfigured");

        let (_, body) = call(&router, json!({"op": "cluster.failover"})).await;
        assert_eq!(body, json!({"data": false}));

        let (_, body) = call(&router, json!({"op": "cluster.failover", "enabled": true})).await;
        assert_eq!(body, json!({"errors": [{"message": "Not bootstrapped yet"}]}));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_over_http() {
        let controller = controller().await;
        let router = create_admin_router(controller.clone());
        let uuid = uuid::Uuid::from_u128(7);

        let (_, body) = call(
            &router,
            json!({"op": "join_server", "uri": controller.uri(), "instance_uuid": uuid}),
        )
        .await;
        assert_eq!(body, json!({"data": true}));

        let (_, body) = call(&router, json!({"op": "cluster.config_version"})).await;
        assert_eq!(body, json!({"data": 1}));

        let (_, body) = call(&router, json!({"op": "replicasets"})).await;
        let replicaset = &body["data"][0];
        assert_eq!(replicaset["status"], "healthy");
        assert_eq!(replicaset["roles"], json!([]));
        assert_eq!(replicaset["master"]["uuid"], uuid.to_string());

        let (_, body) = call(
            &router,
            json!({"op": "join_server", "uri": "localhost:1", "instance_uuid": uuid}),
        )
        .await;
        assert_eq!(
            body["errors"][0]["message"],
            format!("Server \"{}\" is already joined", uuid)
        );

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_routes_share_listener() {
        let controller = controller().await;
        let custom = Router::new().route("/custom-get", get(|| async { "Hello" }));
        let router = with_custom_routes(create_admin_router(controller.clone()), Some(custom));

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/custom-get").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Hello");

        // Admin routes are still served
        let (status, body) = call(&router, json!({"op": "cluster.self"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["uri"], controller.uri());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let controller = controller().await;
        let router = create_admin_router(controller.clone());

        let (status, body) = call(&router, json!({"op": "drop_everything"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request"));

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        controller.shutdown().await;
    }
}
