//! src/services/catalog.rs
//!
//! SkinCatalog: the narrow view of the relational store the archive services
//! need: which skins exist, and the freshness token of the whole collection.
//! The store's schema is owned elsewhere; the queries assume a `skins` table
//! with `id` and `uploaded_at` columns.

use crate::models::{skin::SkinId, token::FreshnessToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("skin catalog unavailable: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[async_trait]
pub trait SkinCatalog: Send + Sync {
    /// Every skin on record, in ascending id order.
    async fn list_skin_ids(&self) -> CatalogResult<Vec<SkinId>>;

    /// Token describing the most recent mutation across all skins.
    async fn latest_token(&self) -> CatalogResult<FreshnessToken>;
}

/// [`SkinCatalog`] backed by the application's SQLite database.
#[derive(Clone)]
pub struct SqliteSkinCatalog {
    db: Arc<SqlitePool>,
}

impl SqliteSkinCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SkinCatalog for SqliteSkinCatalog {
    async fn list_skin_ids(&self) -> CatalogResult<Vec<SkinId>> {
        let ids = sqlx::query_scalar::<_, SkinId>("SELECT id FROM skins ORDER BY id ASC")
            .fetch_all(&*self.db)
            .await?;
        debug!(count = ids.len(), "listed skins");
        Ok(ids)
    }

    async fn latest_token(&self) -> CatalogResult<FreshnessToken> {
        let (latest, population) = sqlx::query_as::<_, (Option<DateTime<Utc>>, i64)>(
            "SELECT MAX(uploaded_at), COUNT(*) FROM skins",
        )
        .fetch_one(&*self.db)
        .await?;

        let token = match latest {
            Some(latest) => {
                FreshnessToken::new(latest.timestamp(), u64::try_from(population).unwrap_or(0))
            }
            None => FreshnessToken::EMPTY,
        };
        debug!(%token, "computed freshness token");
        Ok(token)
    }
}
