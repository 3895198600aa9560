//! Shared test utilities for CSI driver tests.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::{Config, DRIVER_NAME, DRIVER_VERSION};
use crate::controller::ControllerService;
use crate::driver::DriverState;
use crate::identity::IdentityService;
use crate::mount::StageMode;
use crate::mount::fake::FakeMounter;
use crate::node::NodeService;

/// Test fixture providing isolated driver state for each test.
///
/// Volumes live under `<tmp>/volumes`; staging and target paths handed out
/// by [`TestFixture::path`] live under `<tmp>/node`.
pub struct TestFixture {
    pub state: Arc<DriverState>,
    pub mounter: Arc<FakeMounter>,
    temp_dir: TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_stage_mode(StageMode::Bind)
    }

    pub fn with_stage_mode(stage_mode: StageMode) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let volume_root = temp_dir.path().join("volumes");
        std::fs::create_dir_all(&volume_root).expect("failed to create volume root");
        let config = Config {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: "test-node".to_string(),
            endpoint: "unix:///tmp/test.sock".to_string(),
            volume_root,
            stage_mode,
        };
        let mounter = Arc::new(FakeMounter::new());
        let state = Arc::new(DriverState::new(config, mounter.clone()));
        Self {
            state,
            mounter,
            temp_dir,
        }
    }

    /// A node-side path that does not exist yet.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp_dir.path().join("node").join(rel)
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(Arc::clone(&self.state))
    }

    pub fn controller_service(&self) -> ControllerService {
        ControllerService::new(Arc::clone(&self.state))
    }

    pub fn node_service(&self) -> NodeService {
        NodeService::new(Arc::clone(&self.state))
    }
}
