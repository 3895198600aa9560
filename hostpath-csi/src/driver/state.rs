//! Driver state management.
//!
//! `DriverState` owns the volume store, the mount manager and the keyed
//! locks, and implements the controller and node lifecycles on top of them:
//! - Volume lifecycle (create, delete, list, stats)
//! - Stage/unstage per staging path
//! - Publish/unpublish per target path
//!
//! Every filesystem or mount system call runs on the blocking pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::mount::{Binding, MountManager, Mounter, TargetState, Teardown};
use crate::types::VolumeId;
use crate::volume::{CreatedVolume, VolumeStats, VolumeStore};

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(Error::join)?
}

/// Lock key for a node path, so `/a/b` and `/a/b/` share one lock.
fn path_key(path: &Path) -> String {
    path.components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

/// Usage of a published or staged path as seen from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStats {
    pub stats: VolumeStats,
    pub is_dir: bool,
}

/// Shared driver state.
pub struct DriverState {
    pub config: Config,
    store: VolumeStore,
    mounts: MountManager,
    /// Serializes create/delete of the same volume id.
    volume_locks: KeyedLocks,
    /// Serializes stage/unstage and publish/unpublish of the same path.
    path_locks: KeyedLocks,
}

impl DriverState {
    pub fn new(config: Config, mounter: Arc<dyn Mounter>) -> Self {
        let store = VolumeStore::new(config.volume_root.clone());
        let mounts = MountManager::new(mounter, config.stage_mode);
        Self {
            config,
            store,
            mounts,
            volume_locks: KeyedLocks::new(),
            path_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &VolumeStore {
        &self.store
    }

    pub fn mounts(&self) -> &MountManager {
        &self.mounts
    }

    /// Whether the volume root is usable.
    pub async fn ready(&self) -> bool {
        let root = self.store.root().to_path_buf();
        blocking(move || Ok(root.is_dir())).await.unwrap_or(false)
    }

    // === Controller operations ===

    pub async fn create_volume(
        &self,
        volume_id: &VolumeId,
        requested_bytes: i64,
        path_override: Option<PathBuf>,
        parameters: HashMap<String, String>,
    ) -> Result<CreatedVolume> {
        let _guard = self.volume_locks.lock(volume_id.as_str()).await;
        let store = self.store.clone();
        let volume_id = volume_id.clone();
        blocking(move || store.create(&volume_id, requested_bytes, path_override, parameters))
            .await
    }

    /// Delete a volume. Deleting an absent volume succeeds; a volume that is
    /// still staged or published is refused with `VolumeInUse`.
    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        let _guard = self.volume_locks.lock(volume_id.as_str()).await;
        let store = self.store.clone();
        let mounts = self.mounts.clone();
        let id = volume_id.clone();
        let deleted = blocking(move || store.delete(&id, mounts.mounter())).await?;
        if !deleted {
            debug!(%volume_id, "volume already deleted");
        }
        Ok(())
    }

    /// Backing directory of an existing volume.
    pub async fn resolve_volume(&self, volume_id: &VolumeId) -> Result<PathBuf> {
        let store = self.store.clone();
        let volume_id = volume_id.clone();
        blocking(move || store.resolve(&volume_id)).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeId>> {
        let store = self.store.clone();
        blocking(move || store.list()).await
    }

    pub async fn volume_stats(&self, path: &Path) -> Result<VolumeStats> {
        let path = path.to_path_buf();
        blocking(move || VolumeStore::stats(&path)).await
    }

    /// Free space on the filesystem holding the volume root.
    pub async fn capacity(&self) -> Result<VolumeStats> {
        self.volume_stats(self.store.root()).await
    }

    /// Check that `node_id` names this node and the volume exists.
    pub async fn controller_publish(&self, volume_id: &VolumeId, node_id: &str) -> Result<()> {
        if node_id != self.config.node_id {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        self.resolve_volume(volume_id).await?;
        Ok(())
    }

    pub async fn controller_unpublish(&self, volume_id: &VolumeId) -> Result<()> {
        self.resolve_volume(volume_id).await?;
        Ok(())
    }

    // === Node operations ===

    /// Directory the volume should expose: the `path` context entry if the
    /// caller supplied one, otherwise the store's resolution.
    fn source_path(store: &VolumeStore, volume_id: &VolumeId, context_path: Option<&str>) -> Result<PathBuf> {
        match context_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.is_absolute() {
                    return Err(Error::InvalidPath {
                        path: path.display().to_string(),
                        reason: "must be absolute",
                    });
                }
                if !path.is_dir() {
                    return Err(Error::PathNotFound(path));
                }
                Ok(path)
            }
            None => store.resolve(volume_id),
        }
    }

    pub async fn stage_volume(
        &self,
        volume_id: &VolumeId,
        context_path: Option<String>,
        staging_path: &Path,
    ) -> Result<Binding> {
        let _guard = self.path_locks.lock(&path_key(staging_path)).await;
        let store = self.store.clone();
        let mounts = self.mounts.clone();
        let id = volume_id.clone();
        let staging = staging_path.to_path_buf();

        let binding = blocking(move || {
            let source = Self::source_path(&store, &id, context_path.as_deref())?;
            mounts.stage(&source, &staging)
        })
        .await?;

        match binding {
            Binding::Created => info!(%volume_id, staging = %staging_path.display(), "volume staged"),
            Binding::AlreadyBound => debug!(%volume_id, staging = %staging_path.display(), "volume already staged"),
        }
        Ok(binding)
    }

    pub async fn unstage_volume(&self, volume_id: &VolumeId, staging_path: &Path) -> Result<Teardown> {
        let _guard = self.path_locks.lock(&path_key(staging_path)).await;
        let mounts = self.mounts.clone();
        let staging = staging_path.to_path_buf();

        let teardown = blocking(move || mounts.teardown(&staging)).await?;
        match teardown {
            Teardown::Removed => info!(%volume_id, staging = %staging_path.display(), "volume unstaged"),
            Teardown::Absent => debug!(%volume_id, staging = %staging_path.display(), "volume already unstaged"),
        }
        Ok(teardown)
    }

    pub async fn publish_volume(
        &self,
        volume_id: &VolumeId,
        context_path: Option<String>,
        staging_path: &Path,
        target_path: &Path,
        readonly: bool,
    ) -> Result<Binding> {
        let _guard = self.path_locks.lock(&path_key(target_path)).await;
        let store = self.store.clone();
        let mounts = self.mounts.clone();
        let id = volume_id.clone();
        let staging = staging_path.to_path_buf();
        let target = target_path.to_path_buf();

        let binding = blocking(move || {
            if std::fs::symlink_metadata(&staging).is_err() {
                return Err(Error::PathNotFound(staging));
            }
            let source = Self::source_path(&store, &id, context_path.as_deref())?;
            if mounts.inspect(&staging, &source)? != TargetState::Bound {
                return Err(Error::VolumeNotStaged {
                    volume_id: id.to_string(),
                    staging_path: staging.display().to_string(),
                });
            }
            mounts.publish(&staging, &target, readonly)
        })
        .await?;

        match binding {
            Binding::Created => info!(%volume_id, target = %target_path.display(), readonly, "volume published"),
            Binding::AlreadyBound => debug!(%volume_id, target = %target_path.display(), "volume already published"),
        }
        Ok(binding)
    }

    pub async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &Path) -> Result<Teardown> {
        let _guard = self.path_locks.lock(&path_key(target_path)).await;
        let mounts = self.mounts.clone();
        let target = target_path.to_path_buf();

        let teardown = blocking(move || mounts.teardown(&target)).await?;
        match teardown {
            Teardown::Removed => info!(%volume_id, target = %target_path.display(), "volume unpublished"),
            Teardown::Absent => debug!(%volume_id, target = %target_path.display(), "volume already unpublished"),
        }
        Ok(teardown)
    }

    /// Usage of a path the orchestrator reports as holding a volume.
    pub async fn path_stats(&self, path: &Path) -> Result<PathStats> {
        let path = path.to_path_buf();
        blocking(move || {
            let meta = std::fs::metadata(&path).map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => Error::PathNotFound(path.clone()),
                _ => Error::Stat {
                    path: path.clone(),
                    source,
                },
            })?;
            Ok(PathStats {
                stats: VolumeStore::stats(&path)?,
                is_dir: meta.is_dir(),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::HostMounter;
    use crate::test_util::TestFixture;

    const GIB: i64 = 1 << 30;

    fn id(s: &str) -> VolumeId {
        VolumeId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn full_lifecycle_leaves_no_residue() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let vol = id("vol-e2e");
        let staging = fixture.path("staging/vol-e2e");
        let target = fixture.path("pods/pod-1/vol-e2e");

        let created = state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap();
        assert!(created.created);

        assert_eq!(
            state.stage_volume(&vol, None, &staging).await.unwrap(),
            Binding::Created
        );
        assert_eq!(
            state.stage_volume(&vol, None, &staging).await.unwrap(),
            Binding::AlreadyBound
        );

        assert_eq!(
            state
                .publish_volume(&vol, None, &staging, &target, false)
                .await
                .unwrap(),
            Binding::Created
        );
        assert_eq!(
            state
                .publish_volume(&vol, None, &staging, &target, false)
                .await
                .unwrap(),
            Binding::AlreadyBound
        );

        std::fs::write(target.join("hello.txt"), b"hi").unwrap();
        assert_eq!(
            std::fs::read(created.backing_path.join("hello.txt")).unwrap(),
            b"hi"
        );

        assert_eq!(
            state.unpublish_volume(&vol, &target).await.unwrap(),
            Teardown::Removed
        );
        assert_eq!(
            state.unpublish_volume(&vol, &target).await.unwrap(),
            Teardown::Absent
        );
        assert_eq!(
            state.unstage_volume(&vol, &staging).await.unwrap(),
            Teardown::Removed
        );
        assert_eq!(
            state.unstage_volume(&vol, &staging).await.unwrap(),
            Teardown::Absent
        );

        state.delete_volume(&vol).await.unwrap();
        state.delete_volume(&vol).await.unwrap();

        assert!(!created.backing_path.exists());
        assert!(!staging.exists());
        assert!(!target.exists());
        assert!(fixture.mounter.is_empty());
        assert!(matches!(
            state.resolve_volume(&vol).await,
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn publish_requires_staged_path() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let vol = id("vol-1");
        state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap();

        let staging = fixture.path("staging/vol-1");
        let target = fixture.path("pods/pod-1/vol-1");

        let err = state
            .publish_volume(&vol, None, &staging, &target, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));

        std::fs::create_dir_all(&staging).unwrap();
        let err = state
            .publish_volume(&vol, None, &staging, &target, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VolumeNotStaged { .. }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn stage_onto_path_bound_elsewhere_conflicts() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let a = id("vol-a");
        let b = id("vol-b");
        for vol in [&a, &b] {
            state
                .create_volume(vol, GIB, None, HashMap::new())
                .await
                .unwrap();
        }
        let staging = fixture.path("staging/shared");

        state.stage_volume(&a, None, &staging).await.unwrap();
        let err = state.stage_volume(&b, None, &staging).await.unwrap_err();
        assert!(matches!(err, Error::TargetConflict { .. }));
    }

    #[tokio::test]
    async fn stage_uses_context_path_over_store() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let source = fixture.path("prepared");
        std::fs::create_dir_all(&source).unwrap();
        let staging = fixture.path("staging/vol-x");

        state
            .stage_volume(
                &id("vol-x"),
                Some(source.display().to_string()),
                &staging,
            )
            .await
            .unwrap();
        assert_eq!(fixture.mounter.source_of(&staging), Some(source));

        let err = state
            .stage_volume(&id("vol-y"), Some("relative/path".to_string()), &fixture.path("staging/vol-y"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn stage_of_unknown_volume_is_not_found() {
        let fixture = TestFixture::new();
        let err = fixture
            .state
            .stage_volume(&id("ghost"), None, &fixture.path("staging/ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VolumeNotFound(_)));
    }

    #[tokio::test]
    async fn delete_while_mounted_inside_is_refused() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let outer = id("outer");
        let inner = id("inner");
        let outer_path = state
            .create_volume(&outer, GIB, None, HashMap::new())
            .await
            .unwrap()
            .backing_path;
        state
            .create_volume(&inner, GIB, None, HashMap::new())
            .await
            .unwrap();

        let staging = outer_path.join("nested-stage");
        state.stage_volume(&inner, None, &staging).await.unwrap();

        let err = state.delete_volume(&outer).await.unwrap_err();
        assert!(matches!(err, Error::VolumeInUse { .. }));
        assert!(outer_path.is_dir());

        state.unstage_volume(&inner, &staging).await.unwrap();
        state.delete_volume(&outer).await.unwrap();
    }

    #[tokio::test]
    async fn delete_of_staged_volume_is_refused() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let vol = id("vol-1");
        let backing = state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap()
            .backing_path;
        std::fs::write(backing.join("data"), b"live").unwrap();
        let staging = fixture.path("staging/vol-1");
        let target = fixture.path("pods/pod-1/vol-1");

        state.stage_volume(&vol, None, &staging).await.unwrap();
        let err = state.delete_volume(&vol).await.unwrap_err();
        assert!(matches!(err, Error::VolumeInUse { count: 1, .. }));
        assert!(backing.join("data").exists());
        assert_eq!(fixture.mounter.len(), 1);

        state
            .publish_volume(&vol, None, &staging, &target, false)
            .await
            .unwrap();
        let err = state.delete_volume(&vol).await.unwrap_err();
        assert!(matches!(err, Error::VolumeInUse { count: 2, .. }));

        state.unpublish_volume(&vol, &target).await.unwrap();
        state.unstage_volume(&vol, &staging).await.unwrap();
        state.delete_volume(&vol).await.unwrap();
        assert!(!backing.exists());
    }

    #[tokio::test]
    async fn delete_of_published_volume_is_refused_with_symlink_staging() {
        let fixture = TestFixture::with_stage_mode(crate::mount::StageMode::Symlink);
        let state = &fixture.state;
        let vol = id("vol-1");
        let backing = state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap()
            .backing_path;
        let staging = fixture.path("staging/vol-1");
        let target = fixture.path("pods/pod-1/vol-1");

        state.stage_volume(&vol, None, &staging).await.unwrap();
        state
            .publish_volume(&vol, None, &staging, &target, false)
            .await
            .unwrap();

        let err = state.delete_volume(&vol).await.unwrap_err();
        assert!(matches!(err, Error::VolumeInUse { count: 1, .. }));
        assert!(backing.is_dir());
    }

    #[test]
    fn path_key_ignores_redundant_separators() {
        assert_eq!(path_key(Path::new("/a/b")), "/a/b");
        assert_eq!(path_key(Path::new("/a/b/")), "/a/b");
        assert_eq!(path_key(Path::new("/a//b/./")), "/a/b");
    }

    #[tokio::test]
    async fn trailing_separator_takes_the_same_path_lock() {
        let fixture = TestFixture::new();
        let vol = id("vol-1");
        fixture
            .state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap();
        let staging = fixture.path("staging/vol-1");
        let with_slash = PathBuf::from(format!("{}/", staging.display()));
        let guard = fixture.state.path_locks.lock(&path_key(&with_slash)).await;

        let state = Arc::clone(&fixture.state);
        let mut stage = tokio::spawn({
            let vol = vol.clone();
            async move { state.stage_volume(&vol, None, &staging).await }
        });
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), &mut stage).await;
        assert!(waited.is_err(), "stage ran while the path lock was held");

        drop(guard);
        assert_eq!(stage.await.unwrap().unwrap(), Binding::Created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_of_one_volume_create_once() {
        let fixture = TestFixture::new();
        let vol = id("contended");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&fixture.state);
                let vol = vol.clone();
                tokio::spawn(async move {
                    state
                        .create_volume(&vol, GIB, None, HashMap::new())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn capacity_reports_root_filesystem() {
        let fixture = TestFixture::new();
        let capacity = fixture.state.capacity().await.unwrap();
        assert!(capacity.capacity_bytes > 0);
        assert!(capacity.available_bytes <= capacity.capacity_bytes);
    }

    #[tokio::test]
    async fn controller_publish_checks_node_and_volume() {
        let fixture = TestFixture::new();
        let state = &fixture.state;
        let vol = id("vol-1");

        assert!(matches!(
            state.controller_publish(&vol, "test-node").await,
            Err(Error::VolumeNotFound(_))
        ));
        state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap();
        state.controller_publish(&vol, "test-node").await.unwrap();
        assert!(matches!(
            state.controller_publish(&vol, "other-node").await,
            Err(Error::NodeNotFound(_))
        ));
    }

    /// Exercises real bind mounts; needs CAP_SYS_ADMIN.
    #[tokio::test]
    #[ignore = "requires root"]
    async fn host_mount_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            node_id: "test-node".to_string(),
            volume_root: dir.path().join("volumes"),
            ..Default::default()
        };
        let state = DriverState::new(config, Arc::new(HostMounter));
        let vol = id("vol-host");
        let staging = dir.path().join("staging");
        let target = dir.path().join("target");

        let backing = state
            .create_volume(&vol, GIB, None, HashMap::new())
            .await
            .unwrap()
            .backing_path;
        state.stage_volume(&vol, None, &staging).await.unwrap();
        state
            .publish_volume(&vol, None, &staging, &target, true)
            .await
            .unwrap();

        std::fs::write(backing.join("file"), b"x").unwrap();
        assert!(target.join("file").exists());
        assert!(std::fs::write(target.join("denied"), b"x").is_err());

        state.unpublish_volume(&vol, &target).await.unwrap();
        state.unstage_volume(&vol, &staging).await.unwrap();
        state.delete_volume(&vol).await.unwrap();
        assert!(!backing.exists());
    }
}
