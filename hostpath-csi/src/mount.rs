//! Stage and publish bindings on the node.
//!
//! `MountManager` decides what a target path currently holds and moves it
//! between "absent", "empty directory" and "bound to a source". The actual
//! mount system calls sit behind the [`Mounter`] trait so lifecycle logic
//! can run unprivileged against [`fake::FakeMounter`].

#[cfg(any(test, feature = "fake-mount"))]
pub mod fake;

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Operating-system mount primitives.
pub trait Mounter: Send + Sync {
    /// Bind `source` onto the existing directory `target`.
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether `path` itself is a mount point. A symlink at `path` is not
    /// followed.
    fn is_mount_point(&self, path: &Path) -> Result<bool>;

    /// All mount points at or below `path`.
    fn mount_points_under(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Mount points elsewhere whose mounted root lies at or below the
    /// directory `tree`.
    fn mounts_of(&self, tree: &Path) -> Result<Vec<PathBuf>>;
}

/// Mounter backed by mount(2) and umount(2).
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl Mounter for HostMounter {
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let mount_err = |e: nix::errno::Errno| Error::Mount {
            mount_source: source.to_path_buf(),
            target: target.to_path_buf(),
            source: io::Error::from(e),
        };

        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(mount_err)?;

        // MS_RDONLY is ignored on the initial bind; it only takes effect on a
        // remount of the bind.
        if read_only
            && let Err(e) = nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
        {
            if let Err(undo) = nix::mount::umount(target) {
                warn!(target = %target.display(), error = %undo, "failed to undo bind mount");
            }
            return Err(mount_err(e));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount(target).map_err(|e| Error::Unmount {
            target: target.to_path_buf(),
            source: io::Error::from(e),
        })
    }

    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        let path = canonical_parent(path)?;
        Ok(read_mountinfo()?.iter().any(|entry| entry.mount_point == path))
    }

    fn mount_points_under(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let root = canonical(path)?;
        Ok(read_mountinfo()?
            .into_iter()
            .map(|entry| entry.mount_point)
            .filter(|mp| mp.starts_with(&root))
            .collect())
    }

    fn mounts_of(&self, tree: &Path) -> Result<Vec<PathBuf>> {
        let tree = canonical(tree)?;
        Ok(mounts_exposing(&read_mountinfo()?, &tree))
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|source| Error::Stat {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve symlinks in the parent of `path` but not in its last component.
fn canonical_parent(path: &Path) -> Result<PathBuf> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(path.to_path_buf());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    let parent = fs::canonicalize(parent).map_err(|source| Error::Stat {
        path: parent.to_path_buf(),
        source,
    })?;
    Ok(parent.join(name))
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    /// `major:minor` of the mounted filesystem.
    device: String,
    /// Directory of that filesystem shown at the mount point.
    root: PathBuf,
    mount_point: PathBuf,
}

fn read_mountinfo() -> Result<Vec<MountEntry>> {
    let contents = fs::read_to_string(MOUNTINFO)?;
    Ok(parse_mountinfo(&contents))
}

/// Extract device, root and mount point (fields 3 to 5).
fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ').skip(2);
            let device = fields.next()?;
            let root = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                root: PathBuf::from(unescape_octal(root)),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
            })
        })
        .collect()
}

/// Mount points whose root is `tree` or a directory below it.
///
/// `tree` must be canonical. It is located within its filesystem through
/// the innermost mount that contains it; bind mounts of the same device
/// whose root falls under that location expose the tree. Mounts covering
/// the tree itself are not counted.
fn mounts_exposing(entries: &[MountEntry], tree: &Path) -> Vec<PathBuf> {
    // max_by_key keeps the last of equal keys, which is the top of a stack.
    let Some(holder) = entries
        .iter()
        .filter(|entry| tree.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.components().count())
    else {
        return vec![];
    };
    let Ok(relative) = tree.strip_prefix(&holder.mount_point) else {
        return vec![];
    };
    let tree_in_fs = holder.root.join(relative);

    entries
        .iter()
        .filter(|entry| {
            entry.device == holder.device
                && entry.root.starts_with(&tree_in_fs)
                && !tree.starts_with(&entry.mount_point)
        })
        .map(|entry| entry.mount_point.clone())
        .collect()
}

/// Undo the kernel's `\ooo` escaping of space, tab, newline and backslash.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let code = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(code as u8);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// How a volume is made visible at its staging path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    #[default]
    Bind,
    Symlink,
}

/// What currently occupies a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Absent,
    EmptyDir,
    /// A mount or link whose root is the expected source.
    Bound,
    Conflict(String),
}

/// Result of a stage or publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Created,
    AlreadyBound,
}

/// Result of a teardown call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    Absent,
}

#[derive(Clone)]
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
    stage_mode: StageMode,
}

impl MountManager {
    pub fn new(mounter: Arc<dyn Mounter>, stage_mode: StageMode) -> Self {
        Self {
            mounter,
            stage_mode,
        }
    }

    pub fn mounter(&self) -> &dyn Mounter {
        self.mounter.as_ref()
    }

    pub fn stage_mode(&self) -> StageMode {
        self.stage_mode
    }

    /// Classify `target` relative to the directory it should expose.
    pub fn inspect(&self, target: &Path, source: &Path) -> Result<TargetState> {
        let meta = match fs::symlink_metadata(target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TargetState::Absent),
            Err(source) => {
                return Err(Error::Stat {
                    path: target.to_path_buf(),
                    source,
                });
            }
        };

        if meta.file_type().is_symlink() || self.mounter.is_mount_point(target)? {
            let source_meta = stat(source)?;
            return Ok(match fs::metadata(target) {
                Ok(resolved)
                    if resolved.dev() == source_meta.dev()
                        && resolved.ino() == source_meta.ino() =>
                {
                    TargetState::Bound
                }
                Ok(_) => TargetState::Conflict("bound to a different source".to_string()),
                Err(_) => TargetState::Conflict("dangling symbolic link".to_string()),
            });
        }

        if !meta.is_dir() {
            return Ok(TargetState::Conflict("not a directory".to_string()));
        }

        let mut entries = fs::read_dir(target).map_err(|source| Error::Stat {
            path: target.to_path_buf(),
            source,
        })?;
        if entries.next().is_some() {
            Ok(TargetState::Conflict("directory is not empty".to_string()))
        } else {
            Ok(TargetState::EmptyDir)
        }
    }

    /// Expose `source` at the staging path using the configured stage mode.
    pub fn stage(&self, source: &Path, target: &Path) -> Result<Binding> {
        match self.stage_mode {
            StageMode::Bind => self.bind(source, target, false),
            StageMode::Symlink => self.link(source, target),
        }
    }

    /// Bind the staged path onto a workload target.
    pub fn publish(&self, staged: &Path, target: &Path, read_only: bool) -> Result<Binding> {
        self.bind(staged, target, read_only)
    }

    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<Binding> {
        let created = match self.prepare(source, target)? {
            TargetState::Bound => return Ok(Binding::AlreadyBound),
            TargetState::Absent => {
                fs::create_dir_all(target)?;
                true
            }
            _ => false,
        };

        if let Err(e) = self.mounter.bind_mount(source, target, read_only) {
            if created && let Err(cleanup) = fs::remove_dir(target) {
                warn!(target = %target.display(), error = %cleanup, "failed to remove target after bind failure");
            }
            return Err(e);
        }
        debug!(source = %source.display(), target = %target.display(), read_only, "bind mounted");
        Ok(Binding::Created)
    }

    fn link(&self, source: &Path, target: &Path) -> Result<Binding> {
        match self.prepare(source, target)? {
            TargetState::Bound => return Ok(Binding::AlreadyBound),
            TargetState::EmptyDir => fs::remove_dir(target)?,
            _ => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        std::os::unix::fs::symlink(source, target)?;
        debug!(source = %source.display(), target = %target.display(), "linked");
        Ok(Binding::Created)
    }

    /// Check the source exists and the target is free or already bound.
    fn prepare(&self, source: &Path, target: &Path) -> Result<TargetState> {
        if !stat(source)?.is_dir() {
            return Err(Error::PathNotFound(source.to_path_buf()));
        }
        match self.inspect(target, source)? {
            TargetState::Conflict(reason) => Err(Error::TargetConflict {
                target: target.to_path_buf(),
                reason,
            }),
            state => Ok(state),
        }
    }

    /// Unmount `target` if needed and remove the link or empty directory.
    ///
    /// Anything left behind after unmounting is reported, never deleted.
    pub fn teardown(&self, target: &Path) -> Result<Teardown> {
        match fs::symlink_metadata(target) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Teardown::Absent),
            Err(source) => {
                return Err(Error::Stat {
                    path: target.to_path_buf(),
                    source,
                });
            }
        }

        if self.mounter.is_mount_point(target)? {
            self.mounter.unmount(target)?;
            debug!(target = %target.display(), "unmounted");
        }

        let meta = fs::symlink_metadata(target)?;
        if meta.file_type().is_symlink() {
            fs::remove_file(target)?;
        } else if meta.is_dir() {
            fs::remove_dir(target).map_err(|e| match e.kind() {
                io::ErrorKind::DirectoryNotEmpty => Error::ResidualContent(target.to_path_buf()),
                _ => Error::Io(e),
            })?;
        } else {
            return Err(Error::ResidualContent(target.to_path_buf()));
        }
        Ok(Teardown::Removed)
    }
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => Error::PathNotFound(path.to_path_buf()),
        _ => Error::Stat {
            path: path.to_path_buf(),
            source,
        },
    })
}
