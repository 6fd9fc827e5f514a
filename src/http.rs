//! Thin HTTP surface over the write path.
//!
//! Transport only: extract the request, call the service, map the result.
//! A correlation id is taken from the `x-correlation-id` request header or
//! generated, and flows into the outbox headers of whatever the request
//! creates.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{
    CatalogError, CatalogErrorKind, CreateProductParams, Product, ProductService, ProductStore,
};
use crate::config::HttpConfig;
use crate::propagation;
use crate::store::OutboxStore;

/// Shared handler state.
pub struct AppState<S> {
    pub products: Arc<ProductService<S>>,
    pub store: Arc<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            products: Arc::clone(&self.products),
            store: Arc::clone(&self.store),
        }
    }
}

pub fn router<S>(state: AppState<S>) -> Router
where
    S: ProductStore + OutboxStore + 'static,
{
    Router::new()
        .route("/products", post(create_product::<S>).get(list_products::<S>))
        .route("/healthz", get(healthz::<S>))
        .with_state(state)
}

/// Binds the listener and serves until `shutdown` is cancelled.
pub async fn serve<S>(
    cfg: HttpConfig,
    state: AppState<S>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error>
where
    S: ProductStore + OutboxStore + 'static,
{
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    tracing::info!(port = cfg.port, "http service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn create_product<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(params): Json<CreateProductParams>,
) -> Result<(StatusCode, Json<Product>), ApiError>
where
    S: ProductStore + OutboxStore + 'static,
{
    validate(&params)?;
    let correlation_id = correlation_id(&headers);

    let product = state
        .products
        .create_product(params, Some(&correlation_id))
        .await?;

    Ok((StatusCode::CREATED, Json(product)))
}

async fn list_products<S>(
    State(state): State<AppState<S>>,
) -> Result<Json<Vec<Product>>, ApiError>
where
    S: ProductStore + OutboxStore + 'static,
{
    Ok(Json(state.products.list_products().await?))
}

async fn healthz<S>(State(state): State<AppState<S>>) -> Response
where
    S: ProductStore + OutboxStore + 'static,
{
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unreachable").into_response()
        }
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(propagation::CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn validate(params: &CreateProductParams) -> Result<(), ApiError> {
    if params.name.trim().is_empty() {
        return Err(ApiError::validation("name must not be empty"));
    }
    if params.sku.trim().is_empty() {
        return Err(ApiError::validation("sku must not be empty"));
    }
    if !params.price.is_finite() || params.price < 0.0 {
        return Err(ApiError::validation("price must be a non-negative number"));
    }
    if params.stock_quantity < 0 {
        return Err(ApiError::validation("stock_quantity must not be negative"));
    }
    Ok(())
}

enum ApiError {
    Validation(String),
    Conflict(String),
    Internal,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err.kind() {
            CatalogErrorKind::SkuConflict { sku } => {
                Self::Conflict(format!("product with sku {sku} already exists"))
            }
            _ => {
                tracing::error!(error = %err, "catalog operation failed");
                Self::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Validation(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", message)
            }
            Self::Conflict(message) => (StatusCode::CONFLICT, "SKU_ALREADY_EXISTS", message),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal server error".to_owned(),
            ),
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use super::*;
    use crate::store::inmemory::InMemoryStore;

    fn test_router() -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let state = AppState {
            products: Arc::new(ProductService::new(Arc::clone(&store))),
            store: Arc::clone(&store),
        };
        (router(state), store)
    }

    fn create_request(sku: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/products")
            .header("content-type", "application/json")
            .header(propagation::CORRELATION_HEADER, "corr-9")
            .body(Body::from(format!(
                r#"{{"name":"Keyboard","sku":"{sku}","price":49.9,"stock_quantity":10}}"#
            )))
            .unwrap()
    }

    #[tokio::test]
    async fn create_product_returns_201_and_enqueues_the_event() {
        let (router, store) = test_router();

        let response = router.oneshot(create_request("KB-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let product: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(product["sku"], "KB-1");

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].headers.get(propagation::CORRELATION_HEADER).unwrap(),
            "corr-9"
        );
    }

    #[tokio::test]
    async fn duplicate_sku_maps_to_409() {
        let (router, store) = test_router();

        let first = router
            .clone()
            .oneshot(create_request("KB-1"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = router.oneshot(create_request("KB-1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "SKU_ALREADY_EXISTS");

        // Exactly one outbox row: the conflicting write left nothing behind.
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_body_maps_to_422() {
        let (router, store) = test_router();

        let request = Request::builder()
            .method("POST")
            .uri("/products")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"name":"","sku":"KB-1","price":49.9,"stock_quantity":10}"#,
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn list_products_returns_created_rows() {
        let (router, _store) = test_router();

        router
            .clone()
            .oneshot(create_request("KB-1"))
            .await
            .unwrap();

        let response = router
            .oneshot(Request::builder().uri("/products").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let products: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(products.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (router, _store) = test_router();

        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
