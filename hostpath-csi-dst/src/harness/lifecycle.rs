//! Volume lifecycle simulation harness.
//!
//! Drives `DriverState` through random create/delete/stage/publish sequences
//! backed by a `FakeMounter`, predicting every outcome with an in-memory
//! oracle.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use hostpath_csi::driver::DriverState;
use hostpath_csi::mount::fake::FakeMounter;
use hostpath_csi::mount::{Binding, StageMode, Teardown};
use hostpath_csi::volume::CreatedVolume;
use hostpath_csi::{Config, Error, VolumeId};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use super::SimulationError;

const VOLUMES: usize = 5;
const SLOTS: usize = 4;
const TARGETS: usize = 6;
const GIB: i64 = 1 << 30;

/// Actions that can be performed in simulation.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleAction {
    Create { volume: usize, size_gib: i64 },
    /// Several identical creates racing on the blocking pool.
    ConcurrentCreate { volume: usize, size_gib: i64, callers: usize },
    Delete { volume: usize },
    Stage { volume: usize, slot: usize },
    Unstage { slot: usize },
    Publish { volume: usize, slot: usize, target: usize },
    /// Publish whose bind mount fails.
    FailingPublish { volume: usize, slot: usize, target: usize },
    Unpublish { target: usize },
    /// Unpublish whose unmount fails.
    FailingUnpublish { target: usize },
}

/// Classified result of a driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Unchanged,
    Removed,
    Absent,
    Done,
    NotFound,
    Conflict,
    NotStaged,
    /// Delete refused while a mount still exposes the volume.
    InUse,
    MountFailed,
}

impl From<Binding> for Outcome {
    fn from(binding: Binding) -> Self {
        match binding {
            Binding::Created => Self::Created,
            Binding::AlreadyBound => Self::Unchanged,
        }
    }
}

impl From<Teardown> for Outcome {
    fn from(teardown: Teardown) -> Self {
        match teardown {
            Teardown::Removed => Self::Removed,
            Teardown::Absent => Self::Absent,
        }
    }
}

impl From<CreatedVolume> for Outcome {
    fn from(created: CreatedVolume) -> Self {
        if created.created {
            Self::Created
        } else {
            Self::Unchanged
        }
    }
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Self::Done
    }
}

fn classify<T: Into<Outcome>>(result: Result<T, Error>) -> Result<Outcome, SimulationError> {
    match result {
        Ok(value) => Ok(value.into()),
        Err(Error::VolumeNotFound(_) | Error::PathNotFound(_)) => Ok(Outcome::NotFound),
        Err(
            Error::VolumeAlreadyExists(_)
            | Error::BackingPathTaken { .. }
            | Error::TargetConflict { .. },
        ) => Ok(Outcome::Conflict),
        Err(Error::VolumeNotStaged { .. }) => Ok(Outcome::NotStaged),
        Err(Error::VolumeInUse { .. }) => Ok(Outcome::InUse),
        Err(Error::Mount { .. } | Error::Unmount { .. }) => Ok(Outcome::MountFailed),
        Err(e) => Err(SimulationError::Unexpected(e.to_string())),
    }
}

/// In-memory model of the driver's volumes and node bindings.
///
/// In symlink stage mode a staging path is not a mount, so deleting a
/// volume that is only staged succeeds and leaves the slot holding a
/// dangling link until it is unstaged or the volume is created again.
#[derive(Debug, Default)]
pub struct LifecycleOracle {
    stage_mode: StageMode,
    /// Volume index to requested bytes.
    volumes: BTreeMap<usize, i64>,
    /// Staging slot to staged volume.
    staged: HashMap<usize, usize>,
    /// Target to (slot, volume) it was published from.
    published: HashMap<usize, (usize, usize)>,
}

impl LifecycleOracle {
    pub fn new(stage_mode: StageMode) -> Self {
        Self {
            stage_mode,
            ..Default::default()
        }
    }

    pub fn create(&mut self, volume: usize, bytes: i64) -> Outcome {
        match self.volumes.get(&volume) {
            Some(&existing) if existing == bytes => Outcome::Unchanged,
            Some(_) => Outcome::Conflict,
            None => {
                self.volumes.insert(volume, bytes);
                Outcome::Created
            }
        }
    }

    pub fn delete(&mut self, volume: usize) -> Outcome {
        if self.is_mounted(volume) {
            return Outcome::InUse;
        }
        self.volumes.remove(&volume);
        Outcome::Done
    }

    pub fn stage(&mut self, volume: usize, slot: usize) -> Outcome {
        if !self.volumes.contains_key(&volume) {
            return Outcome::NotFound;
        }
        match self.staged.get(&slot) {
            Some(&staged) if staged == volume => Outcome::Unchanged,
            Some(_) => Outcome::Conflict,
            None => {
                self.staged.insert(slot, volume);
                Outcome::Created
            }
        }
    }

    pub fn unstage(&mut self, slot: usize) -> Outcome {
        match self.staged.remove(&slot) {
            Some(_) => Outcome::Removed,
            None => Outcome::Absent,
        }
    }

    /// Expected publish outcome without applying it.
    pub fn predict_publish(&self, volume: usize, slot: usize, target: usize) -> Outcome {
        match self.staged.get(&slot) {
            None => Outcome::NotFound,
            Some(_) if !self.volumes.contains_key(&volume) => Outcome::NotFound,
            Some(&staged) if staged != volume => Outcome::NotStaged,
            Some(_) => match self.published.get(&target) {
                // Publications of the same volume resolve to the same directory.
                Some(&(_, published)) if published == volume => Outcome::Unchanged,
                Some(_) => Outcome::Conflict,
                None => Outcome::Created,
            },
        }
    }

    pub fn publish(&mut self, volume: usize, slot: usize, target: usize) -> Outcome {
        let outcome = self.predict_publish(volume, slot, target);
        if outcome == Outcome::Created {
            self.published.insert(target, (slot, volume));
        }
        outcome
    }

    pub fn unpublish(&mut self, target: usize) -> Outcome {
        match self.published.remove(&target) {
            Some(_) => Outcome::Removed,
            None => Outcome::Absent,
        }
    }

    pub fn volume_ids(&self) -> Vec<String> {
        // BTreeMap order on indices is not lexicographic on names.
        let mut ids: Vec<String> = self.volumes.keys().map(|&v| volume_name(v)).collect();
        ids.sort();
        ids
    }

    fn is_staged(&self, volume: usize) -> bool {
        self.staged.values().any(|&v| v == volume)
    }

    /// Whether a stage or publish mount still exposes the volume.
    fn is_mounted(&self, volume: usize) -> bool {
        let staged_mount = self.stage_mode == StageMode::Bind && self.is_staged(volume);
        staged_mount || self.published.values().any(|&(_, v)| v == volume)
    }

    fn slot_in_use(&self, slot: usize) -> bool {
        self.published.values().any(|&(s, _)| s == slot)
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct LifecycleStats {
    pub operations: u64,
    pub creates: u64,
    pub deletes: u64,
    pub refused_deletes: u64,
    pub stages: u64,
    pub publishes: u64,
    pub teardowns: u64,
    pub conflicts: u64,
    pub injected_failures: u64,
}

fn volume_name(volume: usize) -> String {
    format!("vol-{volume}")
}

/// Lifecycle simulation harness.
pub struct LifecycleHarness {
    rng: SmallRng,
    state: Arc<DriverState>,
    mounter: Arc<FakeMounter>,
    oracle: LifecycleOracle,
    stats: LifecycleStats,
    node_dir: PathBuf,
    _temp_dir: TempDir,
}

impl LifecycleHarness {
    pub fn new(seed: u64, stage_mode: StageMode) -> Result<Self, SimulationError> {
        let temp_dir = TempDir::new()?;
        let volume_root = temp_dir.path().join("volumes");
        std::fs::create_dir_all(&volume_root)?;

        let config = Config {
            node_id: "dst-node".to_string(),
            volume_root,
            stage_mode,
            ..Default::default()
        };
        let mounter = Arc::new(FakeMounter::new());
        let state = Arc::new(DriverState::new(config, mounter.clone()));

        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            state,
            mounter,
            oracle: LifecycleOracle::new(stage_mode),
            stats: LifecycleStats::default(),
            node_dir: temp_dir.path().join("node"),
            _temp_dir: temp_dir,
        })
    }

    /// Volume published at `target`, for log context.
    fn published_volume(&self, target: usize) -> usize {
        self.oracle
            .published
            .get(&target)
            .map(|&(_, volume)| volume)
            .unwrap_or_default()
    }

    fn staging_path(&self, slot: usize) -> PathBuf {
        self.node_dir.join("staging").join(format!("slot-{slot}"))
    }

    fn target_path(&self, target: usize) -> PathBuf {
        self.node_dir.join("pods").join(format!("target-{target}"))
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
            self.validate_invariants().await?;
        }
        Ok(())
    }

    fn sample_action(&mut self) -> LifecycleAction {
        let volume = self.rng.random_range(0..VOLUMES);
        let slot = self.rng.random_range(0..SLOTS);
        let target = self.rng.random_range(0..TARGETS);
        // Two sizes so repeats sometimes conflict.
        let size_gib = self.rng.random_range(1..=2);

        match self.rng.random_range(0..100) {
            0..20 => LifecycleAction::Create { volume, size_gib },
            20..25 => LifecycleAction::ConcurrentCreate {
                volume,
                size_gib,
                callers: self.rng.random_range(2..=4),
            },
            25..35 => LifecycleAction::Delete { volume },
            35..55 => LifecycleAction::Stage { volume, slot },
            55..65 if !self.oracle.slot_in_use(slot) => LifecycleAction::Unstage { slot },
            55..85 => {
                let volume = self.oracle.staged.get(&slot).copied().unwrap_or(volume);
                if self.rng.random_bool(0.1) {
                    LifecycleAction::FailingPublish {
                        volume,
                        slot,
                        target,
                    }
                } else {
                    LifecycleAction::Publish {
                        volume,
                        slot,
                        target,
                    }
                }
            }
            85..90 => LifecycleAction::FailingUnpublish { target },
            _ => LifecycleAction::Unpublish { target },
        }
    }

    fn check(
        action: &LifecycleAction,
        expected: Outcome,
        actual: Outcome,
    ) -> Result<(), SimulationError> {
        if expected == actual {
            Ok(())
        } else {
            Err(SimulationError::Mismatch {
                context: format!("{action:?}: expected {expected:?}, got {actual:?}"),
            })
        }
    }

    /// Execute a single action (public for harness testing).
    pub async fn execute(&mut self, action: LifecycleAction) -> Result<(), SimulationError> {
        let state = Arc::clone(&self.state);
        let (expected, actual) = match action {
            LifecycleAction::Create { volume, size_gib } => {
                self.stats.creates += 1;
                let id = parse_id(volume)?;
                let expected = self.oracle.create(volume, size_gib * GIB);
                let actual = classify(
                    state
                        .create_volume(&id, size_gib * GIB, None, HashMap::new())
                        .await,
                )?;
                (expected, actual)
            }
            LifecycleAction::ConcurrentCreate {
                volume,
                size_gib,
                callers,
            } => {
                self.stats.creates += callers as u64;
                let id = parse_id(volume)?;
                let expected = self.oracle.create(volume, size_gib * GIB);
                let handles: Vec<_> = (0..callers)
                    .map(|_| {
                        let state = Arc::clone(&state);
                        let id = id.clone();
                        tokio::spawn(async move {
                            state
                                .create_volume(&id, size_gib * GIB, None, HashMap::new())
                                .await
                        })
                    })
                    .collect();

                let mut outcomes = Vec::with_capacity(callers);
                for handle in handles {
                    let result = handle
                        .await
                        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                    outcomes.push(classify(result)?);
                }
                let created = outcomes.iter().filter(|&&o| o == Outcome::Created).count();
                // A fresh volume is created by exactly one caller.
                let actual = match (created, outcomes.first()) {
                    (1, _) => Outcome::Created,
                    (0, Some(&first)) if outcomes.iter().all(|&o| o == first) => first,
                    _ => {
                        return Err(SimulationError::Mismatch {
                            context: format!("{action:?}: inconsistent outcomes {outcomes:?}"),
                        });
                    }
                };
                (expected, actual)
            }
            LifecycleAction::Delete { volume } => {
                self.stats.deletes += 1;
                let id = parse_id(volume)?;
                let expected = self.oracle.delete(volume);
                if expected == Outcome::InUse {
                    self.stats.refused_deletes += 1;
                }
                (expected, classify(state.delete_volume(&id).await)?)
            }
            LifecycleAction::Stage { volume, slot } => {
                self.stats.stages += 1;
                let id = parse_id(volume)?;
                let expected = self.oracle.stage(volume, slot);
                let actual = classify(
                    state
                        .stage_volume(&id, None, &self.staging_path(slot))
                        .await,
                )?;
                (expected, actual)
            }
            LifecycleAction::Unstage { slot } => {
                self.stats.teardowns += 1;
                let id = parse_id(self.oracle.staged.get(&slot).copied().unwrap_or_default())?;
                let expected = self.oracle.unstage(slot);
                let actual = classify(
                    state
                        .unstage_volume(&id, &self.staging_path(slot))
                        .await,
                )?;
                (expected, actual)
            }
            LifecycleAction::Publish {
                volume,
                slot,
                target,
            } => {
                self.stats.publishes += 1;
                let id = parse_id(volume)?;
                let expected = self.oracle.publish(volume, slot, target);
                let actual = classify(
                    state
                        .publish_volume(
                            &id,
                            None,
                            &self.staging_path(slot),
                            &self.target_path(target),
                            false,
                        )
                        .await,
                )?;
                (expected, actual)
            }
            LifecycleAction::FailingPublish {
                volume,
                slot,
                target,
            } => {
                // Only a publish that reaches the bind mount can fail there.
                if self.oracle.predict_publish(volume, slot, target) != Outcome::Created {
                    return Ok(());
                }
                self.stats.injected_failures += 1;
                let id = parse_id(volume)?;
                let target_path = self.target_path(target);
                self.mounter.fail_next_bind();
                let actual = classify(
                    state
                        .publish_volume(&id, None, &self.staging_path(slot), &target_path, false)
                        .await,
                )?;
                if target_path.exists() {
                    return Err(SimulationError::Mismatch {
                        context: format!("{action:?}: target left behind after failed bind"),
                    });
                }
                (Outcome::MountFailed, actual)
            }
            LifecycleAction::Unpublish { target } => {
                self.stats.teardowns += 1;
                let id = parse_id(self.published_volume(target))?;
                let expected = self.oracle.unpublish(target);
                let actual = classify(
                    state
                        .unpublish_volume(&id, &self.target_path(target))
                        .await,
                )?;
                (expected, actual)
            }
            LifecycleAction::FailingUnpublish { target } => {
                // Unmount only runs for a published target.
                if !self.oracle.published.contains_key(&target) {
                    return Ok(());
                }
                self.stats.injected_failures += 1;
                let id = parse_id(self.published_volume(target))?;
                self.mounter.fail_next_unmount();
                let actual = classify(
                    state
                        .unpublish_volume(&id, &self.target_path(target))
                        .await,
                )?;
                (Outcome::MountFailed, actual)
            }
        };

        if actual == Outcome::Conflict {
            self.stats.conflicts += 1;
        }
        Self::check(&action, expected, actual)
    }

    async fn validate_invariants(&self) -> Result<(), SimulationError> {
        let listed: Vec<String> = self
            .state
            .list_volumes()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .iter()
            .map(ToString::to_string)
            .collect();
        let expected = self.oracle.volume_ids();
        if listed != expected {
            return Err(SimulationError::Mismatch {
                context: format!("volumes: expected {expected:?}, got {listed:?}"),
            });
        }

        for volume in 0..VOLUMES {
            let id = parse_id(volume)?;
            let exists = self.state.resolve_volume(&id).await.is_ok();
            if exists != self.oracle.volumes.contains_key(&volume) {
                return Err(SimulationError::Mismatch {
                    context: format!("{id}: resolvable={exists}"),
                });
            }
        }

        let bind_staged = match self.state.mounts().stage_mode() {
            StageMode::Bind => self.oracle.staged.len(),
            StageMode::Symlink => 0,
        };
        let expected_mounts = bind_staged + self.oracle.published.len();
        if self.mounter.len() != expected_mounts {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "mount table: expected {expected_mounts}, got {}",
                    self.mounter.len()
                ),
            });
        }

        // symlink_metadata so a dangling staging link still counts.
        for slot in 0..SLOTS {
            let exists = std::fs::symlink_metadata(self.staging_path(slot)).is_ok();
            if exists != self.oracle.staged.contains_key(&slot) {
                return Err(SimulationError::Mismatch {
                    context: format!("slot-{slot}: exists={exists}"),
                });
            }
        }
        for target in 0..TARGETS {
            let exists = std::fs::symlink_metadata(self.target_path(target)).is_ok();
            if exists != self.oracle.published.contains_key(&target) {
                return Err(SimulationError::Mismatch {
                    context: format!("target-{target}: exists={exists}"),
                });
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> &LifecycleStats {
        &self.stats
    }
}

fn parse_id(volume: usize) -> Result<VolumeId, SimulationError> {
    VolumeId::parse(volume_name(volume)).map_err(|e| SimulationError::Unexpected(e.to_string()))
}
