//! In-process stand-in for bind mounts.
//!
//! A "mount" replaces the empty target directory with a symlink to the
//! source and records it in a table; unmounting restores the empty
//! directory. Path resolution through the target then behaves like a bind.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::Mounter;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct FakeMount {
    source: PathBuf,
    read_only: bool,
}

#[derive(Debug, Default)]
pub struct FakeMounter {
    table: Mutex<HashMap<PathBuf, FakeMount>>,
    fail_bind: AtomicBool,
    fail_unmount: AtomicBool,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `bind_mount` fail with EPERM.
    pub fn fail_next_bind(&self) {
        self.fail_bind.store(true, Ordering::SeqCst);
    }

    /// Make the next `unmount` fail with EBUSY.
    pub fn fail_next_unmount(&self) {
        self.fail_unmount.store(true, Ordering::SeqCst);
    }

    pub fn read_only(&self, target: &Path) -> Option<bool> {
        self.table.lock().get(target).map(|m| m.read_only)
    }

    pub fn source_of(&self, target: &Path) -> Option<PathBuf> {
        self.table.lock().get(target).map(|m| m.source.clone())
    }

    /// Number of active mounts.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Mounter for FakeMounter {
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let mount_err = |source_err: io::Error| Error::Mount {
            mount_source: source.to_path_buf(),
            target: target.to_path_buf(),
            source: source_err,
        };

        if self.fail_bind.swap(false, Ordering::SeqCst) {
            return Err(mount_err(io::Error::from_raw_os_error(nix::libc::EPERM)));
        }

        let mut table = self.table.lock();
        if table.contains_key(target) {
            return Err(mount_err(io::Error::from_raw_os_error(nix::libc::EBUSY)));
        }
        fs::remove_dir(target).map_err(mount_err)?;
        if let Err(e) = std::os::unix::fs::symlink(source, target) {
            let _ = fs::create_dir(target);
            return Err(mount_err(e));
        }
        table.insert(
            target.to_path_buf(),
            FakeMount {
                source: source.to_path_buf(),
                read_only,
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let unmount_err = |source: io::Error| Error::Unmount {
            target: target.to_path_buf(),
            source,
        };

        if self.fail_unmount.swap(false, Ordering::SeqCst) {
            return Err(unmount_err(io::Error::from_raw_os_error(nix::libc::EBUSY)));
        }

        let mut table = self.table.lock();
        if !table.contains_key(target) {
            return Err(unmount_err(io::Error::from_raw_os_error(nix::libc::EINVAL)));
        }
        fs::remove_file(target).map_err(unmount_err)?;
        fs::create_dir(target).map_err(unmount_err)?;
        table.remove(target);
        Ok(())
    }

    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.table.lock().contains_key(path))
    }

    fn mount_points_under(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let table = self.table.lock();
        let mut under: Vec<PathBuf> = table
            .keys()
            .filter(|target| target.starts_with(path))
            .cloned()
            .collect();
        under.sort();
        Ok(under)
    }

    fn mounts_of(&self, tree: &Path) -> Result<Vec<PathBuf>> {
        let tree = fs::canonicalize(tree)?;
        let table = self.table.lock();
        // A publish source is itself a fake mount, so resolve it through.
        let mut exposing: Vec<PathBuf> = table
            .iter()
            .filter(|(_, mount)| {
                fs::canonicalize(&mount.source)
                    .unwrap_or_else(|_| mount.source.clone())
                    .starts_with(&tree)
            })
            .map(|(target, _)| target.clone())
            .collect();
        exposing.sort();
        Ok(exposing)
    }
}
