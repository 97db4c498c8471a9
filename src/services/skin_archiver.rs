//! src/services/skin_archiver.rs
//!
//! SingleSkinArchiver: builds the archive of one skin on every request.
//! There is no freshness check and no request coalescing: each call rebuilds
//! and atomically replaces `skin-{id}.zip`, so a concurrent reader always sees
//! either the previous complete archive or the new one.

use crate::{
    models::skin::{SkinId, SkinLayout},
    services::{
        archive_builder::{ArchiveBuilder, ArchiveEntry, ArchiveError},
        artifact::{self, ARCHIVE_EXTENSION, ArtifactHandle, ArtifactKey, ArtifactNaming, CacheError},
    },
};
use std::{path::PathBuf, sync::Arc};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SingleSkinArchiver {
    compiled_dir: PathBuf,
    naming: ArtifactNaming,
    layout: SkinLayout,
    builder: Arc<dyn ArchiveBuilder>,
}

impl SingleSkinArchiver {
    pub fn new(
        compiled_dir: impl Into<PathBuf>,
        naming: ArtifactNaming,
        layout: SkinLayout,
        builder: Arc<dyn ArchiveBuilder>,
    ) -> Self {
        Self {
            compiled_dir: compiled_dir.into(),
            naming,
            layout,
            builder,
        }
    }

    pub fn artifact_path(&self, id: SkinId) -> PathBuf {
        self.compiled_dir
            .join(self.naming.encode(&ArtifactKey::Single(id)))
    }

    /// Rebuild and publish the archive of `id`.
    ///
    /// Fails with [`CacheError::EntityIncomplete`] (writing nothing) when either
    /// asset folder is missing.
    pub async fn resolve(&self, id: SkinId) -> Result<ArtifactHandle, CacheError> {
        let missing = self.layout.missing_dirs(id).await;
        if !missing.is_empty() {
            warn!(skin_id = %id, ?missing, "skin is missing asset folders");
            return Err(CacheError::EntityIncomplete { id, missing });
        }

        let entries = self
            .layout
            .archive_sources(id)
            .into_iter()
            .map(|(dir, name)| ArchiveEntry::new(dir, name))
            .collect();

        let temp = artifact::build_to_temp(&self.compiled_dir, self.builder.clone(), entries)
            .await
            .map_err(|err| match err {
                ArchiveError::SourceMissing(path) => CacheError::EntityIncomplete {
                    id,
                    missing: vec![path],
                },
                other => {
                    warn!(skin_id = %id, error = %other, "skin archive build failed");
                    CacheError::build_failed(other)
                }
            })?;

        let final_path = self.artifact_path(id);
        temp.publish(&final_path).await.map_err(|err| {
            warn!(skin_id = %id, error = %err, "failed to publish skin archive");
            CacheError::build_failed(err)
        })?;
        info!(skin_id = %id, path = %final_path.display(), "published skin archive");

        let download_name = self.download_name(id).await;
        Ok(ArtifactHandle::new(final_path, download_name))
    }

    /// Name the archive after the skin's livery folder, like the upload
    /// pipeline does (`Liveries/{name}/`), falling back to the artifact name.
    async fn download_name(&self, id: SkinId) -> String {
        let fallback = self.naming.encode(&ArtifactKey::Single(id));
        let mut folders = Vec::new();
        let Ok(mut read_dir) = fs::read_dir(self.layout.livery_dir(id)).await else {
            return fallback;
        };
        while let Ok(Some(item)) = read_dir.next_entry().await {
            let is_dir = item.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                folders.push(item.file_name().to_string_lossy().into_owned());
            }
        }

        match folders.as_slice() {
            [only] => format!("{only}{ARCHIVE_EXTENSION}"),
            _ => {
                debug!(
                    skin_id = %id,
                    folders = folders.len(),
                    "expected exactly one livery folder; using artifact name"
                );
                fallback
            }
        }
    }
}
