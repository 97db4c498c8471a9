//! src/services/artifact.rs
//!
//! Shared artifact plumbing for the bundle cache and the single-skin archiver:
//! artifact naming, the manifest of archives present in the compiled
//! directory, best-effort eviction, and build-to-temp-then-rename publication.
//!
//! Bulk and single-skin artifacts share one directory but never one name:
//! - bulk:   `{org}-ACCSkins-{token}.zip`
//! - single: `skin-{id}.zip`
//! - temp:   `.tmp-{uuid}.part` (never decodes as either scope)

use crate::{
    models::{skin::SkinId, token::FreshnessToken},
    services::archive_builder::{ArchiveBuilder, ArchiveEntry, ArchiveError},
};
use std::{
    fs::File,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ARCHIVE_EXTENSION: &str = ".zip";
pub const TEMP_PREFIX: &str = ".tmp-";
const TEMP_EXTENSION: &str = ".part";
const BULK_MARKER: &str = "-ACCSkins-";
const SINGLE_PREFIX: &str = "skin-";

/// Logical identity of an artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    Bulk(FreshnessToken),
    Single(SkinId),
}

/// Failure to resolve an artifact, shared by every caller joining the same build.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("artifact build failed: {0}")]
    BuildFailed(String),
    #[error("skin {id} is incomplete: missing {}", display_paths(.missing))]
    EntityIncomplete { id: SkinId, missing: Vec<PathBuf> },
}

impl CacheError {
    pub fn build_failed(err: impl std::fmt::Display) -> Self {
        CacheError::BuildFailed(err.to_string())
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("organisation name `{0}` must be non-empty ASCII letters, digits, `-` or `_`")]
    InvalidOrgName(String),
}

/// Encodes artifact keys into file names and back.
#[derive(Clone, Debug)]
pub struct ArtifactNaming {
    bulk_prefix: String,
}

impl ArtifactNaming {
    pub fn new(org_name: &str) -> Result<Self, NamingError> {
        let valid = !org_name.is_empty()
            && org_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(NamingError::InvalidOrgName(org_name.to_string()));
        }
        Ok(Self {
            bulk_prefix: format!("{org_name}{BULK_MARKER}"),
        })
    }

    pub fn encode(&self, key: &ArtifactKey) -> String {
        match key {
            ArtifactKey::Bulk(token) => {
                format!("{}{}{}", self.bulk_prefix, token.to_key(), ARCHIVE_EXTENSION)
            }
            ArtifactKey::Single(id) => format!("{SINGLE_PREFIX}{id}{ARCHIVE_EXTENSION}"),
        }
    }

    /// Decode a file name; `None` for anything this naming scheme did not produce.
    pub fn decode(&self, name: &str) -> Option<ArtifactKey> {
        let stem = name.strip_suffix(ARCHIVE_EXTENSION)?;
        if let Some(token) = stem.strip_prefix(&self.bulk_prefix) {
            return FreshnessToken::from_key(token).map(ArtifactKey::Bulk);
        }
        let id = stem.strip_prefix(SINGLE_PREFIX)?;
        let parsed: i64 = id.parse().ok()?;
        (parsed.to_string() == id).then_some(ArtifactKey::Single(SkinId(parsed)))
    }
}

/// A published artifact ready to be streamed to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactHandle {
    path: PathBuf,
    download_name: String,
}

impl ArtifactHandle {
    pub fn new(path: PathBuf, download_name: impl Into<String>) -> Self {
        Self {
            path,
            download_name: download_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name suggested to the client (`Content-Disposition`).
    pub fn download_name(&self) -> &str {
        &self.download_name
    }

    pub async fn open(&self) -> io::Result<fs::File> {
        fs::File::open(&self.path).await
    }
}

/// An artifact file found in the compiled directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub key: ArtifactKey,
}

/// Snapshot of the archives in the compiled directory, taken once per resolve.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// List `dir` and keep only names the naming scheme can decode.
    pub async fn scan(dir: &Path, naming: &ArtifactNaming) -> io::Result<Self> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(key) = naming.decode(&name) {
                entries.push(ManifestEntry {
                    path: item.path(),
                    key,
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { entries })
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Bulk artifacts whose token is not retained by `keep`.
    pub fn stale_bulk<'a>(
        &'a self,
        keep: impl Fn(&FreshnessToken) -> bool + 'a,
    ) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| matches!(&entry.key, ArtifactKey::Bulk(token) if !keep(token)))
    }
}

/// Delete every listed artifact, logging failures. Returns how many were removed.
pub async fn evict<'a>(entries: impl IntoIterator<Item = &'a ManifestEntry>) -> usize {
    let mut evicted = 0;
    for entry in entries {
        match fs::remove_file(&entry.path).await {
            Ok(()) => {
                evicted += 1;
                info!(path = %entry.path.display(), "evicted stale artifact");
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %entry.path.display(), "stale artifact already gone");
            }
            Err(err) => {
                warn!(
                    path = %entry.path.display(),
                    error = %err,
                    "failed to evict stale artifact; will retry on next rebuild"
                );
            }
        }
    }
    evicted
}

/// Remove temp files left behind by builds interrupted by a crash.
pub async fn sweep_temp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(item) = read_dir.next_entry().await? {
        let name = item.file_name();
        let is_temp = name
            .to_str()
            .is_some_and(|n| n.starts_with(TEMP_PREFIX) && n.ends_with(TEMP_EXTENSION));
        if !is_temp {
            continue;
        }
        match fs::remove_file(item.path()).await {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %item.path().display(), error = %err, "failed to remove temp file"),
        }
    }
    Ok(removed)
}

/// A fully written archive that has not been published yet.
///
/// Dropping it without calling [`TempArtifact::publish`] deletes the file.
#[derive(Debug)]
pub struct TempArtifact {
    path: Option<PathBuf>,
}

impl TempArtifact {
    #[cfg(test)]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Atomically rename into `final_path`, replacing any previous file.
    pub async fn publish(mut self, final_path: &Path) -> io::Result<()> {
        let Some(tmp_path) = self.path.take() else {
            return Err(io::Error::other("temp artifact already consumed"));
        };
        if let Err(err) = fs::rename(&tmp_path, final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        debug!(path = %final_path.display(), "published artifact");
        Ok(())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %err, "failed to remove temp artifact");
                }
            }
        }
    }
}

/// Build an archive into a fresh temp file inside `dir`.
///
/// Runs the builder on the blocking pool. On any failure the temp file is
/// removed, so nothing but a complete archive ever survives this call.
pub async fn build_to_temp(
    dir: &Path,
    builder: Arc<dyn ArchiveBuilder>,
    entries: Vec<ArchiveEntry>,
) -> Result<TempArtifact, ArchiveError> {
    let tmp_path = dir.join(format!("{TEMP_PREFIX}{}{TEMP_EXTENSION}", Uuid::new_v4()));

    let join = tokio::task::spawn_blocking(move || -> Result<TempArtifact, ArchiveError> {
        let file = File::create(&tmp_path).map_err(ArchiveError::SinkWriteFailed)?;
        // From here on the guard owns the temp file and removes it on failure.
        let temp = TempArtifact {
            path: Some(tmp_path),
        };
        write_and_close(file, builder.as_ref(), &entries)?;
        Ok(temp)
    })
    .await;

    match join {
        Ok(result) => result,
        Err(err) => Err(ArchiveError::SinkWriteFailed(io::Error::other(err))),
    }
}

/// Consumes `file`, so the handle is closed before the caller's guard can
/// remove the path (Windows refuses to delete open files).
fn write_and_close(
    mut file: File,
    builder: &dyn ArchiveBuilder,
    entries: &[ArchiveEntry],
) -> Result<(), ArchiveError> {
    builder.build(entries, &mut file)?;
    file.sync_all().map_err(ArchiveError::SinkWriteFailed)
}
