//! src/services/depot_service.rs
//!
//! DepotService: the state shared by every HTTP handler. Wires the skin
//! catalog, the bulk bundle cache and the single-skin archiver around one
//! compiled directory.

use crate::{
    config::AppConfig,
    models::skin::{SkinId, SkinLayout},
    services::{
        archive_builder::{ArchiveBuilder, ZipArchiveBuilder},
        artifact::{self, ArtifactHandle, ArtifactNaming, CacheError},
        bundle_cache::BundleCache,
        catalog::{SkinCatalog, SqliteSkinCatalog},
        skin_archiver::SingleSkinArchiver,
    },
};
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::info;

#[derive(Clone)]
pub struct DepotService {
    /// Shared SQLite pool, also used by the readiness probe.
    pub db: Arc<SqlitePool>,

    /// Directory holding published archives.
    pub compiled_dir: PathBuf,

    bundles: BundleCache,
    skins: SingleSkinArchiver,
}

impl DepotService {
    /// Build the service from configuration, preparing the compiled directory.
    pub async fn from_config(db: Arc<SqlitePool>, cfg: &AppConfig) -> Result<Self> {
        let layout = SkinLayout::new(
            &cfg.skins_dir,
            &cfg.vehicle_dir_template,
            &cfg.livery_dir_template,
        )?;
        let naming = ArtifactNaming::new(&cfg.org_name)?;

        tokio::fs::create_dir_all(&cfg.compiled_dir)
            .await
            .with_context(|| format!("creating compiled directory {}", cfg.compiled_dir))?;
        let swept = artifact::sweep_temp_files(Path::new(&cfg.compiled_dir))
            .await
            .with_context(|| format!("sweeping compiled directory {}", cfg.compiled_dir))?;
        if swept > 0 {
            info!(swept, "removed leftover temp archives");
        }

        let catalog: Arc<dyn SkinCatalog> = Arc::new(SqliteSkinCatalog::new(db.clone()));
        let builder: Arc<dyn ArchiveBuilder> = Arc::new(ZipArchiveBuilder::new());

        Ok(Self::new(db, &cfg.compiled_dir, naming, layout, catalog, builder))
    }

    pub fn new(
        db: Arc<SqlitePool>,
        compiled_dir: impl Into<PathBuf>,
        naming: ArtifactNaming,
        layout: SkinLayout,
        catalog: Arc<dyn SkinCatalog>,
        builder: Arc<dyn ArchiveBuilder>,
    ) -> Self {
        let compiled_dir = compiled_dir.into();
        Self {
            bundles: BundleCache::new(
                &compiled_dir,
                naming.clone(),
                layout.clone(),
                catalog,
                builder.clone(),
            ),
            skins: SingleSkinArchiver::new(&compiled_dir, naming, layout, builder),
            db,
            compiled_dir,
        }
    }

    /// Bulk bundle for the current state of the catalog.
    pub async fn bundle(&self) -> Result<ArtifactHandle, CacheError> {
        self.bundles.resolve_latest().await
    }

    /// Freshly built archive of one skin.
    pub async fn skin(&self, id: SkinId) -> Result<ArtifactHandle, CacheError> {
        self.skins.resolve(id).await
    }
}
