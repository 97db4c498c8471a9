//! src/services/bundle_cache.rs
//!
//! BundleCache: owns the lifecycle of the bulk bundle, the archive holding
//! every skin on record. One artifact per freshness token lives in the
//! compiled directory; the token is encoded in the file name, so a restart
//! recovers the cache state from a directory listing alone.
//!
//! Resolution:
//! 1. Existence check on the expected name (cache hit).
//! 2. Otherwise join or start the single build for that token.
//! 3. The build evicts stale bulk artifacts, archives every complete skin,
//!    writes to a temp file and renames it into place.

use crate::{
    models::{
        skin::{SkinId, SkinLayout},
        token::FreshnessToken,
    },
    services::{
        archive_builder::{ArchiveBuilder, ArchiveEntry},
        artifact::{
            self, ArtifactHandle, ArtifactKey, ArtifactNaming, CacheError, Manifest, TempArtifact,
        },
        catalog::SkinCatalog,
    },
};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::fs;
use tracing::{debug, info, warn};

type SharedBuild = Shared<BoxFuture<'static, Result<ArtifactHandle, CacheError>>>;

/// Cache of the bulk bundle, keyed by [`FreshnessToken`].
///
/// Cheap to clone; clones share the in-flight builds.
#[derive(Clone)]
pub struct BundleCache {
    inner: Arc<Inner>,
}

struct Inner {
    compiled_dir: PathBuf,
    naming: ArtifactNaming,
    layout: SkinLayout,
    catalog: Arc<dyn SkinCatalog>,
    builder: Arc<dyn ArchiveBuilder>,
    /// One shared build per token. Guards map mutation only, never a build.
    in_flight: Mutex<HashMap<FreshnessToken, SharedBuild>>,
    /// Serializes eviction and publication in the compiled directory.
    publish_lock: tokio::sync::Mutex<()>,
}

impl BundleCache {
    pub fn new(
        compiled_dir: impl Into<PathBuf>,
        naming: ArtifactNaming,
        layout: SkinLayout,
        catalog: Arc<dyn SkinCatalog>,
        builder: Arc<dyn ArchiveBuilder>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                compiled_dir: compiled_dir.into(),
                naming,
                layout,
                catalog,
                builder,
                in_flight: Mutex::new(HashMap::new()),
                publish_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Path the artifact for `token` is published under.
    #[cfg(test)]
    pub fn artifact_path(&self, token: FreshnessToken) -> PathBuf {
        self.inner.artifact_path(token)
    }

    /// Resolve the bundle for the catalog's current freshness token.
    pub async fn resolve_latest(&self) -> Result<ArtifactHandle, CacheError> {
        let token = self.inner.catalog.latest_token().await.map_err(|err| {
            warn!(error = %err, "failed to read freshness token");
            CacheError::build_failed(err)
        })?;
        self.resolve(token).await
    }

    /// Return the bundle for `token`, building it if no artifact exists yet.
    ///
    /// Concurrent calls for the same token share one build and its outcome.
    pub async fn resolve(&self, token: FreshnessToken) -> Result<ArtifactHandle, CacheError> {
        if let Some(handle) = self.inner.existing(token).await {
            debug!(%token, path = %handle.path().display(), "bundle cache hit");
            return Ok(handle);
        }

        let build = {
            let mut in_flight = self.inner.lock_in_flight();
            in_flight
                .entry(token)
                .or_insert_with(|| {
                    debug!(%token, "starting bundle build");
                    self.inner.clone().spawn_build(token)
                })
                .clone()
        };
        build.await
    }
}

impl Inner {
    fn artifact_path(&self, token: FreshnessToken) -> PathBuf {
        self.compiled_dir
            .join(self.naming.encode(&ArtifactKey::Bulk(token)))
    }

    fn handle(&self, path: PathBuf) -> ArtifactHandle {
        let name = file_name(&path);
        ArtifactHandle::new(path, name)
    }

    async fn existing(&self, token: FreshnessToken) -> Option<ArtifactHandle> {
        let path = self.artifact_path(token);
        match fs::try_exists(&path).await {
            Ok(true) => Some(self.handle(path)),
            _ => None,
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<FreshnessToken, SharedBuild>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the build on its own task so it completes even if every caller
    /// goes away, and retire the in-flight entry when it finishes.
    fn spawn_build(self: Arc<Self>, token: FreshnessToken) -> SharedBuild {
        let task = tokio::spawn(async move {
            let _retire = RetireOnDrop {
                inner: self.clone(),
                token,
            };
            self.build(token).await
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::build_failed(format!("build task aborted: {err}"))),
            }
        }
        .boxed()
        .shared()
    }

    async fn build(&self, token: FreshnessToken) -> Result<ArtifactHandle, CacheError> {
        let final_path = self.artifact_path(token);

        {
            let _guard = self.publish_lock.lock().await;
            // A previous build for this token may have published after our hit check.
            if let Some(handle) = self.existing(token).await {
                return Ok(handle);
            }
            self.evict_stale(token).await;
        }

        let ids = self.list_ids().await?;
        let (temp, included) = self.build_bundle(ids).await?;

        let _guard = self.publish_lock.lock().await;
        temp.publish(&final_path).await.map_err(|err| {
            warn!(path = %final_path.display(), error = %err, "failed to publish bundle");
            CacheError::build_failed(err)
        })?;
        info!(
            %token,
            skins = included,
            path = %final_path.display(),
            "published bundle"
        );
        Ok(self.handle(final_path))
    }

    async fn list_ids(&self) -> Result<Vec<SkinId>, CacheError> {
        self.catalog.list_skin_ids().await.map_err(|err| {
            warn!(error = %err, "failed to enumerate skins");
            CacheError::build_failed(err)
        })
    }

    /// Remove bulk artifacts for every token other than `token` and the
    /// tokens other builds are producing right now. Best effort.
    async fn evict_stale(&self, token: FreshnessToken) {
        let manifest = match Manifest::scan(&self.compiled_dir, &self.naming).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(dir = %self.compiled_dir.display(), error = %err, "failed to list artifacts");
                return;
            }
        };
        let active: HashSet<FreshnessToken> = self.lock_in_flight().keys().copied().collect();
        let evicted =
            artifact::evict(manifest.stale_bulk(|t| *t == token || active.contains(t))).await;
        if evicted > 0 {
            debug!(%token, evicted, "evicted superseded bundles");
        }
    }

    /// Archive every complete skin. Skins with missing folders are logged and
    /// skipped, both up front and if a folder disappears mid-build.
    async fn build_bundle(&self, ids: Vec<SkinId>) -> Result<(TempArtifact, usize), CacheError> {
        let mut skins = Vec::with_capacity(ids.len());
        for id in ids {
            let missing = self.layout.missing_dirs(id).await;
            if missing.is_empty() {
                skins.push(id);
            } else {
                warn!(skin_id = %id, ?missing, "skipping incomplete skin");
            }
        }

        loop {
            let entries: Vec<ArchiveEntry> = skins
                .iter()
                .flat_map(|id| self.layout.archive_sources(*id))
                .map(|(dir, name)| ArchiveEntry::new(dir, name))
                .collect();

            let err = match artifact::build_to_temp(
                &self.compiled_dir,
                self.builder.clone(),
                entries,
            )
            .await
            {
                Ok(temp) => return Ok((temp, skins.len())),
                Err(err) => err,
            };

            let culprit = err.source_path().and_then(|path| {
                skins
                    .iter()
                    .position(|id| self.owns(*id, path))
            });
            match culprit {
                Some(pos) => {
                    let id = skins.remove(pos);
                    warn!(skin_id = %id, error = %err, "skipping skin that failed to archive");
                }
                None => {
                    warn!(error = %err, "bundle build failed");
                    return Err(CacheError::build_failed(err));
                }
            }
        }
    }

    fn owns(&self, id: SkinId, path: &Path) -> bool {
        self.layout
            .archive_sources(id)
            .iter()
            .any(|(dir, _)| path.starts_with(dir))
    }
}

/// Removes the in-flight entry of a build, including when the build panics.
struct RetireOnDrop {
    inner: Arc<Inner>,
    token: FreshnessToken,
}

impl Drop for RetireOnDrop {
    fn drop(&mut self) {
        self.inner.lock_in_flight().remove(&self.token);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        archive_builder::{
            ArchiveError, ArchiveSink, ZipArchiveBuilder, tests::archive_names,
        },
        catalog::{CatalogError, CatalogResult},
    };
    use async_trait::async_trait;
    use std::{
        io::{self, Write},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    struct StaticCatalog {
        ids: Vec<SkinId>,
        token: FreshnessToken,
        offline: bool,
    }

    #[async_trait]
    impl SkinCatalog for StaticCatalog {
        async fn list_skin_ids(&self) -> CatalogResult<Vec<SkinId>> {
            if self.offline {
                return Err(CatalogError::Sqlx(sqlx::Error::PoolClosed));
            }
            Ok(self.ids.clone())
        }

        async fn latest_token(&self) -> CatalogResult<FreshnessToken> {
            Ok(self.token)
        }
    }

    /// Wraps the zip builder, counting invocations and optionally stalling or failing.
    #[derive(Default)]
    struct CountingBuilder {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl ArchiveBuilder for CountingBuilder {
        fn build(
            &self,
            entries: &[ArchiveEntry],
            sink: &mut dyn ArchiveSink,
        ) -> Result<(), ArchiveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                sink.write_all(b"PK\x03\x04 truncated")
                    .map_err(ArchiveError::SinkWriteFailed)?;
                return Err(ArchiveError::SinkWriteFailed(io::Error::other("disk full")));
            }
            ZipArchiveBuilder::new().build(entries, sink)
        }
    }

    /// Reports `path` as unreadable whenever an entry's source contains it,
    /// or on every call when `always` is set.
    struct UnreadableBuilder {
        path: PathBuf,
        always: bool,
        calls: AtomicUsize,
    }

    impl UnreadableBuilder {
        fn new(path: PathBuf, always: bool) -> Self {
            Self {
                path,
                always,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ArchiveBuilder for UnreadableBuilder {
        fn build(
            &self,
            entries: &[ArchiveEntry],
            sink: &mut dyn ArchiveSink,
        ) -> Result<(), ArchiveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let hit = entries
                .iter()
                .any(|entry| self.path.starts_with(&entry.source_dir));
            if self.always || hit {
                return Err(ArchiveError::SourceUnreadable {
                    path: self.path.clone(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            ZipArchiveBuilder::new().build(entries, sink)
        }
    }

    struct Fixture {
        _tmp: TempDir,
        skins: PathBuf,
        compiled: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let skins = tmp.path().join("skins");
            let compiled = tmp.path().join("compiled");
            std::fs::create_dir_all(&skins).unwrap();
            std::fs::create_dir_all(&compiled).unwrap();
            Self {
                _tmp: tmp,
                skins,
                compiled,
            }
        }

        fn add_skin(&self, id: i64, with_cars: bool) {
            let root = self.skins.join(id.to_string());
            if with_cars {
                std::fs::create_dir_all(root.join("Cars")).unwrap();
                std::fs::write(root.join(format!("Cars/car-{id}.json")), "{}").unwrap();
            }
            let livery = root.join(format!("Liveries/Livery {id}"));
            std::fs::create_dir_all(&livery).unwrap();
            std::fs::write(livery.join("decals.png"), format!("png {id}")).unwrap();
        }

        fn cache(
            &self,
            ids: &[i64],
            token: FreshnessToken,
            builder: Arc<CountingBuilder>,
        ) -> BundleCache {
            self.cache_with(ids, token, false, builder)
        }

        fn cache_with(
            &self,
            ids: &[i64],
            token: FreshnessToken,
            offline: bool,
            builder: Arc<dyn ArchiveBuilder>,
        ) -> BundleCache {
            let catalog = StaticCatalog {
                ids: ids.iter().copied().map(SkinId).collect(),
                token,
                offline,
            };
            BundleCache::new(
                &self.compiled,
                ArtifactNaming::new("Apex").unwrap(),
                SkinLayout::conventional(&self.skins),
                Arc::new(catalog),
                builder,
            )
        }

        fn compiled_names(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.compiled)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    const T1: FreshnessToken = FreshnessToken::EMPTY;

    fn t2() -> FreshnessToken {
        FreshnessToken::new(1_700_000_000, 2)
    }

    #[tokio::test]
    async fn second_resolve_is_a_cache_hit() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        fx.add_skin(2, true);
        let builder = Arc::new(CountingBuilder::default());
        let cache = fx.cache(&[1, 2], t2(), builder.clone());

        let first = cache.resolve(t2()).await.unwrap();
        let first_bytes = std::fs::read(first.path()).unwrap();
        let second = cache.resolve(t2()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(second.path()).unwrap(), first_bytes);
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.download_name(), "Apex-ACCSkins-1700000000_2.zip");
    }

    #[tokio::test]
    async fn existing_artifact_survives_restart() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let first = fx
            .cache(&[1], t2(), Arc::new(CountingBuilder::default()))
            .resolve(t2())
            .await
            .unwrap();

        let builder = Arc::new(CountingBuilder::default());
        let restarted = fx.cache(&[1], t2(), builder.clone());
        assert_eq!(restarted.resolve(t2()).await.unwrap(), first);
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_token_rebuilds_and_evicts_old_bundle() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder::default());
        let cache = fx.cache(&[1], t2(), builder.clone());

        let old = cache.resolve(T1).await.unwrap();
        let new = cache.resolve(t2()).await.unwrap();

        assert_ne!(old.path(), new.path());
        assert!(!old.path().exists());
        assert!(new.path().exists());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.compiled_names(), vec!["Apex-ACCSkins-1700000000_2.zip"]);
    }

    #[tokio::test]
    async fn eviction_leaves_single_skin_archives_alone() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        std::fs::write(fx.compiled.join("skin-1.zip"), b"single").unwrap();
        std::fs::write(fx.compiled.join("Apex-ACCSkins-5_1.zip"), b"stale").unwrap();
        let cache = fx.cache(&[1], t2(), Arc::new(CountingBuilder::default()));

        cache.resolve(t2()).await.unwrap();

        assert_eq!(
            fx.compiled_names(),
            vec!["Apex-ACCSkins-1700000000_2.zip", "skin-1.zip"]
        );
    }

    #[tokio::test]
    async fn incomplete_skin_is_omitted_from_bundle() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        fx.add_skin(2, false);
        fx.add_skin(3, true);
        let cache = fx.cache(&[1, 2, 3], t2(), Arc::new(CountingBuilder::default()));

        let handle = cache.resolve(t2()).await.unwrap();
        let names = archive_names(&std::fs::read(handle.path()).unwrap());

        assert_eq!(
            names,
            vec![
                "Cars/car-1.json",
                "Liveries/Livery 1/decals.png",
                "Cars/car-3.json",
                "Liveries/Livery 3/decals.png",
            ]
        );
    }

    #[tokio::test]
    async fn skin_without_directory_is_omitted() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let cache = fx.cache(&[1, 99], t2(), Arc::new(CountingBuilder::default()));

        let handle = cache.resolve(t2()).await.unwrap();
        let names = archive_names(&std::fs::read(handle.path()).unwrap());
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn write_failure_publishes_nothing() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder {
            fail: true,
            ..Default::default()
        });
        let cache = fx.cache(&[1], t2(), builder);

        let err = cache.resolve(t2()).await.unwrap_err();

        assert!(matches!(err, CacheError::BuildFailed(_)));
        assert!(!cache.artifact_path(t2()).exists());
        assert!(fx.compiled_names().is_empty());
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder {
            fail: true,
            ..Default::default()
        });
        let cache = fx.cache(&[1], t2(), builder.clone());

        assert!(cache.resolve(t2()).await.is_err());
        assert!(cache.resolve(t2()).await.is_err());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enumeration_failure_is_build_failure() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder::default());
        let cache = fx.cache_with(&[1], t2(), true, builder.clone());

        let err = cache.resolve(t2()).await.unwrap_err();

        assert!(matches!(err, CacheError::BuildFailed(_)));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
        assert!(fx.compiled_names().is_empty());
    }

    #[tokio::test]
    async fn skin_unreadable_mid_build_is_dropped_and_rebuilt() {
        let fx = Fixture::new();
        for id in [1, 2, 3] {
            fx.add_skin(id, true);
        }
        let bad = fx.skins.join("2/Liveries/Livery 2/decals.png");
        let builder = Arc::new(UnreadableBuilder::new(bad, false));
        let cache = fx.cache_with(&[1, 2, 3], t2(), false, builder.clone());

        let handle = cache.resolve(t2()).await.unwrap();

        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
        let names = archive_names(&std::fs::read(handle.path()).unwrap());
        assert_eq!(
            names,
            vec![
                "Cars/car-1.json",
                "Liveries/Livery 1/decals.png",
                "Cars/car-3.json",
                "Liveries/Livery 3/decals.png",
            ]
        );
        assert_eq!(fx.compiled_names(), vec!["Apex-ACCSkins-1700000000_2.zip"]);
    }

    #[tokio::test]
    async fn unreadable_path_outside_every_skin_is_build_failure() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(UnreadableBuilder::new(fx.skins.join("shared/font.ttf"), true));
        let cache = fx.cache_with(&[1], t2(), false, builder.clone());

        let err = cache.resolve(t2()).await.unwrap_err();

        assert!(matches!(err, CacheError::BuildFailed(_)));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert!(fx.compiled_names().is_empty());
    }

    #[tokio::test]
    async fn resolve_latest_uses_catalog_token() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let cache = fx.cache(&[1], t2(), Arc::new(CountingBuilder::default()));

        let handle = cache.resolve_latest().await.unwrap();
        assert_eq!(handle.path(), cache.artifact_path(t2()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_share_one_build() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        fx.add_skin(2, true);
        let builder = Arc::new(CountingBuilder {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let cache = fx.cache(&[1, 2], t2(), builder.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(t2()).await })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let expected = cache.artifact_path(t2());
        for result in results {
            assert_eq!(result.unwrap().unwrap().path(), expected);
        }
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_share_one_failure() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder {
            delay: Duration::from_millis(200),
            fail: true,
            ..Default::default()
        });
        let cache = fx.cache(&[1], t2(), builder.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(t2()).await })
            })
            .collect();
        let errors: Vec<CacheError> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap_err())
            .collect();

        assert!(errors.iter().all(|e| *e == errors[0]));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_tokens_build_independently() {
        let fx = Fixture::new();
        fx.add_skin(1, true);
        let builder = Arc::new(CountingBuilder {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let cache = fx.cache(&[1], t2(), builder.clone());

        let (a, b) = tokio::join!(cache.resolve(T1), cache.resolve(t2()));

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
    }
}
