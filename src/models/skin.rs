//! Represents a skin and where its asset folders live on disk.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Placeholder substituted with the skin id in directory templates.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Archive prefix for the "vehicle definition" folder of every skin.
pub const VEHICLE_ARCHIVE_NAME: &str = "Cars";

/// Archive prefix for the "livery files" folder of every skin.
pub const LIVERY_ARCHIVE_NAME: &str = "Liveries";

/// Identifier of one skin record (and of its directory in the storage tree).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SkinId(pub i64);

impl fmt::Display for SkinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("directory template `{0}` must contain the `{{id}}` placeholder")]
    MissingPlaceholder(String),
    #[error("directory template `{0}` must be a relative path")]
    AbsoluteTemplate(String),
}

/// Resolves the two asset folders of a skin from configured path templates.
///
/// Templates are relative to `root` and contain `{id}`, e.g. `{id}/Cars`.
#[derive(Clone, Debug)]
pub struct SkinLayout {
    root: PathBuf,
    vehicle_template: String,
    livery_template: String,
}

impl SkinLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        vehicle_template: impl Into<String>,
        livery_template: impl Into<String>,
    ) -> Result<Self, LayoutError> {
        let vehicle_template = vehicle_template.into();
        let livery_template = livery_template.into();
        for template in [&vehicle_template, &livery_template] {
            if !template.contains(ID_PLACEHOLDER) {
                return Err(LayoutError::MissingPlaceholder(template.clone()));
            }
            if Path::new(template).is_absolute() {
                return Err(LayoutError::AbsoluteTemplate(template.clone()));
            }
        }

        Ok(Self {
            root: root.into(),
            vehicle_template,
            livery_template,
        })
    }

    /// Layout used by the upload pipeline: `{root}/{id}/Cars` and `{root}/{id}/Liveries`.
    #[cfg(test)]
    pub fn conventional(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            vehicle_template: format!("{ID_PLACEHOLDER}/{VEHICLE_ARCHIVE_NAME}"),
            livery_template: format!("{ID_PLACEHOLDER}/{LIVERY_ARCHIVE_NAME}"),
        }
    }

    pub fn vehicle_dir(&self, id: SkinId) -> PathBuf {
        self.resolve(&self.vehicle_template, id)
    }

    pub fn livery_dir(&self, id: SkinId) -> PathBuf {
        self.resolve(&self.livery_template, id)
    }

    /// The `(source_dir, archive_name)` pairs contributed by one skin, in archive order.
    pub fn archive_sources(&self, id: SkinId) -> [(PathBuf, &'static str); 2] {
        [
            (self.vehicle_dir(id), VEHICLE_ARCHIVE_NAME),
            (self.livery_dir(id), LIVERY_ARCHIVE_NAME),
        ]
    }

    /// Return the asset folders of `id` that are absent (or not directories).
    pub async fn missing_dirs(&self, id: SkinId) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        for (dir, _) in self.archive_sources(id) {
            match tokio::fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => {}
                _ => missing.push(dir),
            }
        }
        missing
    }

    fn resolve(&self, template: &str, id: SkinId) -> PathBuf {
        self.root
            .join(template.replace(ID_PLACEHOLDER, &id.to_string()))
    }
}
