//! CSI Node service implementation.
//!
//! Thin gRPC layer that delegates to DriverState for business logic.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::capability;
use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::driver::{DriverState, detach};
use crate::error::Require;
use crate::types::{CONTEXT_PATH, VolumeId, node_topology};

pub struct NodeService {
    state: Arc<DriverState>,
}

impl NodeService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }
}

fn reader_only(cap: &csi::VolumeCapability) -> bool {
    cap.access_mode.as_ref().is_some_and(|m| {
        matches!(
            m.mode(),
            Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly
        )
    })
}

fn usage(
    available: i64,
    total: i64,
    used: i64,
    unit: csi::volume_usage::Unit,
) -> csi::VolumeUsage {
    csi::VolumeUsage {
        available,
        total,
        used,
        unit: unit as i32,
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let mut req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let staging_path = PathBuf::from(req.staging_target_path.require("staging target path")?);
        let volume_cap = req.volume_capability.require("volume capability")?;
        capability::validate_node(&volume_cap)?;
        let context_path = req.volume_context.remove(CONTEXT_PATH);

        let state = Arc::clone(&self.state);
        detach(async move {
            state
                .stage_volume(&volume_id, context_path, &staging_path)
                .await
        })
        .await?;

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let staging_path = PathBuf::from(req.staging_target_path.require("staging target path")?);

        let state = Arc::clone(&self.state);
        detach(async move { state.unstage_volume(&volume_id, &staging_path).await }).await?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let mut req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let target_path = PathBuf::from(req.target_path.require("target path")?);
        let volume_cap = req.volume_capability.require("volume capability")?;
        capability::validate_node(&volume_cap)?;

        if req.staging_target_path.is_empty() {
            return Err(Status::failed_precondition(
                "staging target path is required",
            ));
        }
        let staging_path = PathBuf::from(req.staging_target_path);
        let readonly = req.readonly || reader_only(&volume_cap);
        let context_path = req.volume_context.remove(CONTEXT_PATH);

        let state = Arc::clone(&self.state);
        detach(async move {
            state
                .publish_volume(
                    &volume_id,
                    context_path,
                    &staging_path,
                    &target_path,
                    readonly,
                )
                .await
        })
        .await?;

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let target_path = PathBuf::from(req.target_path.require("target path")?);

        let state = Arc::clone(&self.state);
        detach(async move { state.unpublish_volume(&volume_id, &target_path).await }).await?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        use csi::volume_usage::Unit;

        let req = request.into_inner();
        let volume_id = req.volume_id.require("volume ID")?;
        let volume_path = PathBuf::from(req.volume_path.require("volume path")?);

        let path_stats = self.state.path_stats(&volume_path).await?;
        let stats = path_stats.stats;

        let volume_condition = if path_stats.is_dir {
            csi::VolumeCondition {
                abnormal: false,
                message: "volume is available".to_string(),
            }
        } else {
            tracing::warn!(
                %volume_id,
                volume_path = %volume_path.display(),
                "volume path is not a directory"
            );
            csi::VolumeCondition {
                abnormal: true,
                message: format!("{} is not a directory", volume_path.display()),
            }
        };

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                usage(
                    stats.available_bytes,
                    stats.capacity_bytes,
                    stats.used_bytes,
                    Unit::Bytes,
                ),
                usage(
                    stats.available_inodes,
                    stats.total_inodes,
                    stats.used_inodes,
                    Unit::Inodes,
                ),
            ],
            volume_condition: Some(volume_condition),
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::VolumeCondition,
            Type::GetVolumeStats,
            Type::SingleNodeMultiWriter,
        ]
        .into_iter()
        .map(|t| csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let node_id = self.state.config.node_id.clone();
        Ok(Response::new(csi::NodeGetInfoResponse {
            accessible_topology: Some(node_topology(&node_id)),
            node_id,
            max_volumes_per_node: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestFixture;
    use crate::types::TOPOLOGY_KEY;
    use std::collections::HashMap;
    use std::path::Path;
    use tonic::Code;

    const GIB: i64 = 1 << 30;

    fn mount_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn block_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn stage_request(
        volume_id: &str,
        path: &Path,
        cap: Option<csi::VolumeCapability>,
    ) -> csi::NodeStageVolumeRequest {
        csi::NodeStageVolumeRequest {
            volume_id: volume_id.to_string(),
            publish_context: HashMap::new(),
            staging_target_path: path.display().to_string(),
            volume_capability: cap,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        }
    }

    fn publish_request(
        volume_id: &str,
        staging: &str,
        target: &Path,
    ) -> csi::NodePublishVolumeRequest {
        csi::NodePublishVolumeRequest {
            volume_id: volume_id.to_string(),
            publish_context: HashMap::new(),
            staging_target_path: staging.to_string(),
            target_path: target.display().to_string(),
            volume_capability: Some(mount_capability()),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        }
    }

    async fn create_volume(fixture: &TestFixture, name: &str) -> PathBuf {
        fixture
            .state
            .create_volume(&VolumeId::parse(name).unwrap(), GIB, None, HashMap::new())
            .await
            .expect("create volume")
            .backing_path
    }

    #[tokio::test]
    async fn node_get_info_returns_node_id_and_topology() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();

        let response = csi::node_server::Node::node_get_info(
            &service,
            Request::new(csi::NodeGetInfoRequest {}),
        )
        .await
        .expect("NodeGetInfo should succeed");

        let info = response.into_inner();
        assert_eq!(info.node_id, "test-node");
        let topology = info.accessible_topology.expect("topology should be set");
        assert_eq!(topology.segments[TOPOLOGY_KEY], "test-node");
    }

    #[tokio::test]
    async fn node_get_capabilities_returns_expected_capabilities() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();

        let response = csi::node_server::Node::node_get_capabilities(
            &service,
            Request::new(csi::NodeGetCapabilitiesRequest {}),
        )
        .await
        .expect("NodeGetCapabilities should succeed");

        let caps = response.into_inner().capabilities;
        use csi::node_service_capability::rpc::Type;
        for t in [
            Type::StageUnstageVolume,
            Type::VolumeCondition,
            Type::GetVolumeStats,
            Type::SingleNodeMultiWriter,
        ] {
            let present = caps.iter().any(|cap| {
                matches!(
                    &cap.r#type,
                    Some(csi::node_service_capability::Type::Rpc(rpc)) if rpc.r#type == t as i32
                )
            });
            assert!(present, "missing {t:?}");
        }
    }

    #[tokio::test]
    async fn node_stage_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = stage_request("", &fixture.path("staging"), Some(mount_capability()));

        let err = csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_stage_volume_requires_staging_target_path() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = stage_request("test-volume", Path::new(""), Some(mount_capability()));

        let err = csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_stage_volume_requires_volume_capability() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = stage_request("test-volume", &fixture.path("staging"), None);

        let err = csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_stage_volume_rejects_block_access() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        create_volume(&fixture, "test-volume").await;
        let request = stage_request(
            "test-volume",
            &fixture.path("staging"),
            Some(block_capability()),
        );

        let err = csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_stage_volume_returns_not_found_for_missing_volume() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = stage_request(
            "nonexistent-volume",
            &fixture.path("staging"),
            Some(mount_capability()),
        );

        let err = csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn node_stage_volume_uses_context_path() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let source = fixture.path("prepared");
        std::fs::create_dir_all(&source).unwrap();
        let staging = fixture.path("staging/vol-ctx");

        let mut request = stage_request("vol-ctx", &staging, Some(mount_capability()));
        request
            .volume_context
            .insert(CONTEXT_PATH.to_string(), source.display().to_string());
        csi::node_server::Node::node_stage_volume(&service, Request::new(request))
            .await
            .expect("stage with context path should succeed");

        assert_eq!(fixture.mounter.source_of(&staging), Some(source));
    }

    #[tokio::test]
    async fn node_stage_onto_conflicting_path_is_already_exists() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        create_volume(&fixture, "vol-a").await;
        create_volume(&fixture, "vol-b").await;
        let staging = fixture.path("staging/shared");

        csi::node_server::Node::node_stage_volume(
            &service,
            Request::new(stage_request("vol-a", &staging, Some(mount_capability()))),
        )
        .await
        .unwrap();
        let err = csi::node_server::Node::node_stage_volume(
            &service,
            Request::new(stage_request("vol-b", &staging, Some(mount_capability()))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);

        let occupied = fixture.path("staging/occupied");
        std::fs::create_dir_all(&occupied).unwrap();
        std::fs::write(occupied.join("file"), b"x").unwrap();
        let err = csi::node_server::Node::node_stage_volume(
            &service,
            Request::new(stage_request("vol-b", &occupied, Some(mount_capability()))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn node_unstage_volume_is_idempotent() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = csi::NodeUnstageVolumeRequest {
            volume_id: "nonexistent-volume".to_string(),
            staging_target_path: fixture.path("nonexistent").display().to_string(),
        };

        csi::node_server::Node::node_unstage_volume(&service, Request::new(request.clone()))
            .await
            .expect("first call should succeed");

        csi::node_server::Node::node_unstage_volume(&service, Request::new(request))
            .await
            .expect("second call should also succeed");
    }

    #[tokio::test]
    async fn node_unstage_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = csi::NodeUnstageVolumeRequest {
            volume_id: String::new(),
            staging_target_path: "/staging".to_string(),
        };

        let err = csi::node_server::Node::node_unstage_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_unstage_never_deletes_residual_content() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let staging = fixture.path("staging/leftover");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("data"), b"keep").unwrap();

        let err = csi::node_server::Node::node_unstage_volume(
            &service,
            Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: "vol".to_string(),
                staging_target_path: staging.display().to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Code::Internal);
        assert!(staging.join("data").exists());
    }

    #[tokio::test]
    async fn node_publish_volume_requires_staging_target_path() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = publish_request("test-volume", "", &fixture.path("target"));

        let err = csi::node_server::Node::node_publish_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn node_publish_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = publish_request("", "/staging", &fixture.path("target"));

        let err = csi::node_server::Node::node_publish_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_publish_volume_missing_staging_path_is_not_found() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        create_volume(&fixture, "test-volume").await;
        let staging = fixture.path("staging/never-created");
        let request = publish_request(
            "test-volume",
            &staging.display().to_string(),
            &fixture.path("target"),
        );

        let err = csi::node_server::Node::node_publish_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn node_publish_volume_requires_staged_volume() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        create_volume(&fixture, "test-volume").await;
        let staging = fixture.path("staging/empty");
        std::fs::create_dir_all(&staging).unwrap();
        let request = publish_request(
            "test-volume",
            &staging.display().to_string(),
            &fixture.path("target"),
        );

        let err = csi::node_server::Node::node_publish_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn stage_publish_unpublish_unstage_round_trip() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let backing = create_volume(&fixture, "test-volume").await;
        let staging = fixture.path("staging/test-volume");
        let target = fixture.path("pods/pod-1/test-volume");

        csi::node_server::Node::node_stage_volume(
            &service,
            Request::new(stage_request("test-volume", &staging, Some(mount_capability()))),
        )
        .await
        .expect("stage should succeed");

        let mut publish = publish_request(
            "test-volume",
            &staging.display().to_string(),
            &target,
        );
        publish.readonly = true;
        for _ in 0..2 {
            csi::node_server::Node::node_publish_volume(&service, Request::new(publish.clone()))
                .await
                .expect("publish should be idempotent");
        }
        assert_eq!(fixture.mounter.read_only(&target), Some(true));

        std::fs::write(backing.join("hello.txt"), b"hi").unwrap();
        assert!(target.join("hello.txt").exists());

        let stats = csi::node_server::Node::node_get_volume_stats(
            &service,
            Request::new(csi::NodeGetVolumeStatsRequest {
                volume_id: "test-volume".to_string(),
                volume_path: target.display().to_string(),
                staging_target_path: String::new(),
            }),
        )
        .await
        .expect("stats should succeed")
        .into_inner();
        assert_eq!(stats.usage.len(), 2);
        assert!(!stats.volume_condition.unwrap().abnormal);

        for _ in 0..2 {
            csi::node_server::Node::node_unpublish_volume(
                &service,
                Request::new(csi::NodeUnpublishVolumeRequest {
                    volume_id: "test-volume".to_string(),
                    target_path: target.display().to_string(),
                }),
            )
            .await
            .expect("unpublish should be idempotent");
        }
        csi::node_server::Node::node_unstage_volume(
            &service,
            Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: "test-volume".to_string(),
                staging_target_path: staging.display().to_string(),
            }),
        )
        .await
        .expect("unstage should succeed");

        assert!(!target.exists());
        assert!(!staging.exists());
        assert!(fixture.mounter.is_empty());
        assert!(backing.join("hello.txt").exists());
    }

    #[tokio::test]
    async fn node_unpublish_volume_is_idempotent() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = csi::NodeUnpublishVolumeRequest {
            volume_id: "nonexistent-volume".to_string(),
            target_path: fixture.path("nonexistent").display().to_string(),
        };

        csi::node_server::Node::node_unpublish_volume(&service, Request::new(request.clone()))
            .await
            .expect("first call should succeed");

        csi::node_server::Node::node_unpublish_volume(&service, Request::new(request))
            .await
            .expect("second call should also succeed");
    }

    #[tokio::test]
    async fn node_unpublish_volume_requires_volume_id() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = csi::NodeUnpublishVolumeRequest {
            volume_id: String::new(),
            target_path: "/target".to_string(),
        };

        let err = csi::node_server::Node::node_unpublish_volume(&service, Request::new(request))
            .await
            .expect_err("should fail");

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_get_volume_stats_reports_missing_and_non_directory_paths() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();
        let request = |path: &Path| csi::NodeGetVolumeStatsRequest {
            volume_id: "vol".to_string(),
            volume_path: path.display().to_string(),
            staging_target_path: String::new(),
        };

        let err = csi::node_server::Node::node_get_volume_stats(
            &service,
            Request::new(request(&fixture.path("missing"))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let file = fixture.path("plain-file");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"x").unwrap();
        let response = csi::node_server::Node::node_get_volume_stats(
            &service,
            Request::new(request(&file)),
        )
        .await
        .unwrap()
        .into_inner();
        assert!(response.volume_condition.unwrap().abnormal);
    }

    #[tokio::test]
    async fn node_expand_volume_is_unimplemented() {
        let fixture = TestFixture::new();
        let service = fixture.node_service();

        let err = csi::node_server::Node::node_expand_volume(
            &service,
            Request::new(csi::NodeExpandVolumeRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
