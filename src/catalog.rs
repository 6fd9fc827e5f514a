//! Product catalog: the transactional write path.
//!
//! Creating a product inserts the product row and its `product.created`
//! outbox row in one store transaction. Either both commit or neither
//! does, so an event exists exactly when the business change it describes
//! is durable. Any error returned to the caller guarantees no
//! broker-visible side effect.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::message::NewOutboxMessage;
use crate::propagation;
use crate::store::{with_tx, OutboxStore, Store, StoreError};

/// Topic carrying [`ProductCreated`] events.
pub const TOPIC_PRODUCT_CREATED: &str = "product.created";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub stock_quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Materializes a product from create parameters: a fresh time-ordered
    /// id and UTC timestamps.
    pub fn build(params: CreateProductParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: params.name,
            sku: params.sku,
            price: params.price,
            stock_quantity: params.stock_quantity,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProductParams {
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub stock_quantity: i32,
}

/// External event emitted when a product is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub stock_quantity: i32,
}

impl From<&Product> for ProductCreated {
    fn from(product: &Product) -> Self {
        Self {
            product_id: product.id,
            name: product.name.clone(),
            sku: product.sku.clone(),
            price: product.price,
            stock_quantity: product.stock_quantity,
        }
    }
}

/// Product persistence operations offered by a storage backend.
#[async_trait]
pub trait ProductStore: Store {
    /// Inserts one product. Fails with a unique violation when the sku is
    /// already taken.
    async fn insert_product(
        &self,
        product: &Product,
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError>;

    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
}

/// The write path over a storage backend.
pub struct ProductService<S> {
    store: Arc<S>,
}

impl<S> ProductService<S>
where
    S: ProductStore + OutboxStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Creates a product and enqueues its event atomically.
    ///
    /// In one transaction: insert the product, then insert the outbox row
    /// carrying the serialized [`ProductCreated`] event and the caller's
    /// propagation headers. A duplicate sku surfaces as a typed conflict
    /// and rolls everything back.
    #[tracing::instrument(skip(self, params), fields(sku = %params.sku))]
    pub async fn create_product(
        &self,
        params: CreateProductParams,
        correlation_id: Option<&str>,
    ) -> Result<Product, CatalogError> {
        let product = Product::build(params);
        let event = ProductCreated::from(&product);
        let payload = serde_json::to_vec(&event).map_err(CatalogError::serialize)?;
        let message = NewOutboxMessage {
            topic: TOPIC_PRODUCT_CREATED.to_owned(),
            partition_key: None,
            headers: propagation::build_headers(correlation_id),
            payload,
        };

        let sku = product.sku.clone();
        let store = Arc::clone(&self.store);
        with_tx(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                store.insert_product(&product, tx).await?;
                store.insert_message(message, tx).await?;
                Ok(product)
            })
        })
        .await
        .map_err(|err| {
            if err.constraint().is_some_and(|c| c.contains("sku")) {
                CatalogError::sku_conflict(sku)
            } else {
                CatalogError::store(err)
            }
        })
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, CatalogError> {
        self.store.list_products().await.map_err(CatalogError::store)
    }
}

/// Consumer-side handler for [`ProductCreated`] events.
pub fn product_created_handler() -> crate::consumer::Handler {
    Arc::new(|delivery| {
        Box::pin(async move {
            let event: ProductCreated = serde_json::from_slice(&delivery.payload)?;
            tracing::info!(
                correlation_id = ?delivery.correlation_id,
                event = ?event,
                "handling product created event"
            );
            Ok(())
        })
    })
}

/// Error returned by catalog operations.
#[derive(Debug)]
pub struct CatalogError {
    context: SpanTrace,
    kind: CatalogErrorKind,
}

/// Kinds of catalog errors.
#[derive(Debug)]
pub enum CatalogErrorKind {
    /// A product with the same sku already exists.
    SkuConflict { sku: String },
    /// The storage backend failed.
    Store(StoreError),
    /// The event payload could not be serialized.
    Serialize(serde_json::Error),
}

impl CatalogError {
    fn new(kind: CatalogErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn sku_conflict(sku: String) -> Self {
        Self::new(CatalogErrorKind::SkuConflict { sku })
    }

    fn store(err: StoreError) -> Self {
        Self::new(CatalogErrorKind::Store(err))
    }

    fn serialize(err: serde_json::Error) -> Self {
        Self::new(CatalogErrorKind::Serialize(err))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, CatalogErrorKind::SkuConflict { .. })
    }

    pub fn kind(&self) -> &CatalogErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CatalogErrorKind::SkuConflict { sku } => {
                writeln!(f, "Product with sku {sku} already exists")
            }
            CatalogErrorKind::Store(err) => writeln!(f, "Store error: {err}"),
            CatalogErrorKind::Serialize(err) => writeln!(f, "Serialize error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CatalogErrorKind::SkuConflict { .. } => None,
            CatalogErrorKind::Store(err) => Some(err),
            CatalogErrorKind::Serialize(err) => Some(err),
        }
    }
}
