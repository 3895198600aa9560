//! Directory-backed volume storage.
//!
//! A volume exists exactly when its backing directory exists. Creation
//! arguments are kept in a JSON record under `<root>/.volumes` so repeated
//! CreateVolume calls can be checked for compatibility and volumes with an
//! overridden backing path can be found again by id. A record without a
//! directory is stale and ignored; a directory at a volume's default
//! location without a record is adopted.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mount::Mounter;
use crate::types::VolumeId;

const RECORDS_DIR: &str = ".volumes";

/// Creation arguments persisted next to the volume root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume_id: VolumeId,
    pub requested_bytes: i64,
    pub backing_path: PathBuf,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl VolumeRecord {
    /// Catch records that were truncated or edited by hand.
    pub fn validate(&self) -> Result<()> {
        if self.requested_bytes < 0 {
            return Err(Error::InvalidRecord(format!(
                "requested_bytes must not be negative, got {}",
                self.requested_bytes
            )));
        }
        if !self.backing_path.is_absolute() {
            return Err(Error::InvalidRecord(format!(
                "backing_path must be absolute, got {}",
                self.backing_path.display()
            )));
        }
        Ok(())
    }
}

/// Filesystem usage of the directory backing a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeStats {
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
    pub available_inodes: i64,
}

/// Outcome of [`VolumeStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    pub backing_path: PathBuf,
    /// False when an identical earlier request already created the volume.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct VolumeStore {
    root: PathBuf,
}

impl VolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn default_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.root.join(volume_id.as_str())
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn record_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.records_dir().join(format!("{volume_id}.json"))
    }

    pub fn load_record(&self, volume_id: &VolumeId) -> Result<Option<VolumeRecord>> {
        let data = match fs::read_to_string(self.record_path(volume_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: VolumeRecord = serde_json::from_str(&data)?;
        if record.volume_id != *volume_id {
            return Err(Error::InvalidRecord(format!(
                "record for {volume_id} names volume {}",
                record.volume_id
            )));
        }
        record.validate()?;
        Ok(Some(record))
    }

    fn save_record(&self, record: &VolumeRecord) -> Result<()> {
        fs::create_dir_all(self.records_dir())?;
        let path = self.record_path(&record.volume_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_record(&self, volume_id: &VolumeId) -> Result<()> {
        match fs::remove_file(self.record_path(volume_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Where the volume lives, whether or not it currently exists.
    fn backing_path(&self, volume_id: &VolumeId) -> Result<PathBuf> {
        Ok(match self.load_record(volume_id)? {
            Some(record) => record.backing_path,
            None => self.default_path(volume_id),
        })
    }

    /// Backing directory of an existing volume.
    pub fn resolve(&self, volume_id: &VolumeId) -> Result<PathBuf> {
        let path = self.backing_path(volume_id)?;
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Error::VolumeNotFound(volume_id.to_string()))
        }
    }

    pub fn exists(&self, volume_id: &VolumeId) -> Result<bool> {
        Ok(self.backing_path(volume_id)?.is_dir())
    }

    /// Records of all volumes whose backing directory exists.
    fn live_records(&self) -> Result<Vec<VolumeRecord>> {
        let entries = match fs::read_dir(self.records_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(volume_id) = VolumeId::parse(stem) else {
                continue;
            };
            match self.load_record(&volume_id) {
                Ok(Some(record)) if record.backing_path.is_dir() => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(%volume_id, error = %e, "skipping unreadable volume record"),
            }
        }
        Ok(records)
    }

    /// Normalize a `path` override and check where it points.
    ///
    /// Inside the volume root only the volume's own default directory is
    /// accepted; anything else there would be listed as a volume of its own.
    fn override_location(&self, volume_id: &VolumeId, path: &Path) -> Result<PathBuf> {
        let invalid = |reason| Error::InvalidPath {
            path: path.display().to_string(),
            reason,
        };
        if !path.is_absolute() {
            return Err(invalid("must be absolute"));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(invalid("must not contain '..'"));
        }

        let path: PathBuf = path.components().collect();
        let default = self.default_path(volume_id);
        if path == default {
            return Ok(default);
        }
        let root: PathBuf = self.root.components().collect();
        if path.starts_with(&root) || root.starts_with(&path) {
            return Err(invalid("must not overlap the volume root"));
        }
        Ok(path)
    }

    /// Refuse an override tree that another live volume already covers.
    fn check_unclaimed(&self, volume_id: &VolumeId, path: &Path) -> Result<()> {
        let claimed = self.live_records()?.into_iter().any(|record| {
            record.volume_id != *volume_id
                && (record.backing_path.starts_with(path) || path.starts_with(&record.backing_path))
        });
        if claimed {
            return Err(Error::BackingPathTaken {
                volume_id: volume_id.to_string(),
                path: path.to_path_buf(),
                reason: "overlaps the backing directory of another volume",
            });
        }
        Ok(())
    }

    /// Create the directory for an overridden backing path.
    ///
    /// The final component must not exist yet, so the driver only ever
    /// records, and later deletes, trees it created itself.
    fn create_override_dir(&self, volume_id: &VolumeId, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::create_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::BackingPathTaken {
                volume_id: volume_id.to_string(),
                path: path.to_path_buf(),
                reason: "directory already exists",
            }),
            result => Ok(result?),
        }
    }

    /// Create the backing directory for `volume_id`.
    ///
    /// Repeating a call with the same size, path and parameters is a no-op;
    /// a repeat with different arguments fails with `VolumeAlreadyExists`.
    /// A `path_override` outside the volume root must name a directory that
    /// does not exist yet and does not overlap another volume.
    pub fn create(
        &self,
        volume_id: &VolumeId,
        requested_bytes: i64,
        path_override: Option<PathBuf>,
        parameters: HashMap<String, String>,
    ) -> Result<CreatedVolume> {
        let default = self.default_path(volume_id);
        let backing_path = match path_override {
            Some(path) => self.override_location(volume_id, &path)?,
            None => default.clone(),
        };

        match self.load_record(volume_id)? {
            Some(record) if record.backing_path.is_dir() => {
                if record.requested_bytes != requested_bytes
                    || record.backing_path != backing_path
                    || record.parameters != parameters
                {
                    return Err(Error::VolumeAlreadyExists(volume_id.to_string()));
                }
                debug!(%volume_id, "volume already exists with identical arguments");
                return Ok(CreatedVolume {
                    backing_path,
                    created: false,
                });
            }
            Some(_) => debug!(%volume_id, "ignoring stale volume record"),
            None => {}
        }

        let existed = if backing_path == default {
            let existed = default.is_dir();
            if !existed {
                fs::create_dir_all(&default)?;
            }
            existed
        } else {
            // An unrecorded volume already lives at the default location.
            if default.is_dir() {
                return Err(Error::VolumeAlreadyExists(volume_id.to_string()));
            }
            self.check_unclaimed(volume_id, &backing_path)?;
            self.create_override_dir(volume_id, &backing_path)?;
            false
        };

        let record = VolumeRecord {
            volume_id: volume_id.clone(),
            requested_bytes,
            backing_path: backing_path.clone(),
            parameters,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.save_record(&record) {
            if !existed && let Err(cleanup) = fs::remove_dir(&backing_path) {
                warn!(%volume_id, error = %cleanup, "failed to remove backing directory after record failure");
            }
            return Err(e);
        }

        if existed {
            info!(%volume_id, path = %backing_path.display(), "adopted existing directory");
        } else {
            info!(%volume_id, path = %backing_path.display(), requested_bytes, "volume created");
        }
        Ok(CreatedVolume {
            backing_path,
            created: !existed,
        })
    }

    /// Remove the backing tree and record of `volume_id`.
    ///
    /// Returns false if the volume was already gone. Refuses while any mount
    /// exposes the tree, whether it is mounted inside the tree or binds the
    /// tree somewhere else such as a staging or target path.
    pub fn delete(&self, volume_id: &VolumeId, mounter: &dyn Mounter) -> Result<bool> {
        let path = self.backing_path(volume_id)?;
        if !path.is_dir() {
            self.remove_record(volume_id)?;
            return Ok(false);
        }

        let mut mounts = mounter.mount_points_under(&path)?;
        mounts.extend(mounter.mounts_of(&path)?);
        mounts.sort();
        mounts.dedup();
        if !mounts.is_empty() {
            debug!(%volume_id, ?mounts, "volume still mounted");
            return Err(Error::VolumeInUse {
                volume_id: volume_id.to_string(),
                path,
                count: mounts.len(),
            });
        }

        // remove_dir_all does not follow symlinks inside the tree.
        fs::remove_dir_all(&path)?;
        self.remove_record(volume_id)?;
        info!(%volume_id, path = %path.display(), "volume deleted");
        Ok(true)
    }

    /// Ids of all existing volumes in lexicographic order.
    pub fn list(&self) -> Result<Vec<VolumeId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(volume_id) = VolumeId::parse(name) {
                ids.insert(volume_id);
            }
        }
        ids.extend(self.live_records()?.into_iter().map(|record| record.volume_id));

        Ok(ids.into_iter().collect())
    }

    /// Usage of the filesystem holding `path`.
    pub fn stats(path: &Path) -> Result<VolumeStats> {
        let vfs = nix::sys::statvfs::statvfs(path).map_err(|e| Error::Stat {
            path: path.to_path_buf(),
            source: io::Error::from(e),
        })?;

        let fragment = vfs.fragment_size() as u64;
        let blocks = vfs.blocks() as u64;
        let free = vfs.blocks_free() as u64;
        let files = vfs.files() as u64;
        let files_free = vfs.files_free() as u64;

        Ok(VolumeStats {
            capacity_bytes: saturate(blocks.saturating_mul(fragment)),
            used_bytes: saturate(blocks.saturating_sub(free).saturating_mul(fragment)),
            available_bytes: saturate((vfs.blocks_available() as u64).saturating_mul(fragment)),
            total_inodes: saturate(files),
            used_inodes: saturate(files.saturating_sub(files_free)),
            available_inodes: saturate(vfs.files_available() as u64),
        })
    }
}

fn saturate(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
