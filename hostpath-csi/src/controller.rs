//! CSI Controller service implementation.
//!
//! Thin gRPC layer that delegates to DriverState for business logic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::warn;

use crate::capability;
use crate::csi;
use crate::driver::{DriverState, detach};
use crate::error::{Error, Require};
use crate::types::{CONTEXT_PATH, ListToken, Page, VolumeId, node_topology};

/// CreateVolume parameter overriding the backing directory.
const PARAM_PATH: &str = "path";

pub struct ControllerService {
    state: Arc<DriverState>,
}

impl ControllerService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    /// Bytes the caller asked for: `required_bytes`, else `limit_bytes`, else 0.
    fn requested_capacity(range: Option<&csi::CapacityRange>) -> Result<i64, Error> {
        let Some(range) = range else {
            return Ok(0);
        };
        let (required, limit) = (range.required_bytes, range.limit_bytes);
        if required < 0 || limit < 0 || (limit > 0 && limit < required) {
            return Err(Error::InvalidCapacityRange { required, limit });
        }
        Ok(if required > 0 { required } else { limit })
    }

    fn path_override(parameters: &HashMap<String, String>) -> Result<Option<PathBuf>, Error> {
        match parameters.get(PARAM_PATH) {
            None => Ok(None),
            Some(path) if Path::new(path).is_absolute() => Ok(Some(PathBuf::from(path))),
            Some(path) => Err(Error::InvalidPath {
                path: path.clone(),
                reason: "must be absolute",
            }),
        }
    }

    fn volume_to_proto(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: i64,
        volume_context: HashMap<String, String>,
    ) -> csi::Volume {
        csi::Volume {
            volume_id: volume_id.to_string(),
            capacity_bytes,
            volume_context,
            content_source: None,
            accessible_topology: vec![node_topology(&self.state.config.node_id)],
        }
    }

    fn path_context(path: &Path) -> HashMap<String, String> {
        HashMap::from([(CONTEXT_PATH.to_string(), path.display().to_string())])
    }
}

fn healthy() -> csi::VolumeCondition {
    csi::VolumeCondition {
        abnormal: false,
        message: "volume is available".to_string(),
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.name.require("volume name")?)?;
        capability::validate(&req.volume_capabilities)?;
        let requested = Self::requested_capacity(req.capacity_range.as_ref())?;
        let path_override = Self::path_override(&req.parameters)?;
        let parameters = req.parameters;

        let state = Arc::clone(&self.state);
        let id = volume_id.clone();
        let created = detach(async move {
            state
                .create_volume(&id, requested, path_override, parameters)
                .await
        })
        .await?;

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(self.volume_to_proto(
                &volume_id,
                requested,
                Self::path_context(&created.backing_path),
            )),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;

        let state = Arc::clone(&self.state);
        detach(async move { state.delete_volume(&volume_id).await }).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let node_id = req.node_id.require("node ID")?;
        let cap = req.volume_capability.require("volume capability")?;
        capability::validate(std::slice::from_ref(&cap))?;

        self.state.controller_publish(&volume_id, &node_id).await?;
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;

        self.state.controller_unpublish(&volume_id).await?;
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        if req.volume_capabilities.is_empty() {
            return Err(Error::MissingCapabilities.into());
        }

        self.state.resolve_volume(&volume_id).await?;

        if let Err(e) = capability::validate(&req.volume_capabilities) {
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.to_string(),
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let token = ListToken::parse(&req.starting_token)?;
        let ids = self.state.list_volumes().await?;
        let page = Page::slice(ids, token, req.max_entries)?;

        let mut entries = Vec::with_capacity(page.entries.len());
        for volume_id in &page.entries {
            // Deleted between listing and resolution.
            let Ok(path) = self.state.resolve_volume(volume_id).await else {
                continue;
            };
            let (capacity_bytes, condition) = match self.state.volume_stats(&path).await {
                Ok(stats) => (stats.capacity_bytes, healthy()),
                Err(e) => {
                    warn!(%volume_id, error = %e, "failed to stat volume");
                    (
                        0,
                        csi::VolumeCondition {
                            abnormal: true,
                            message: e.to_string(),
                        },
                    )
                }
            };
            entries.push(csi::list_volumes_response::Entry {
                volume: Some(self.volume_to_proto(
                    volume_id,
                    capacity_bytes,
                    Self::path_context(&path),
                )),
                status: Some(csi::list_volumes_response::VolumeStatus {
                    published_node_ids: vec![],
                    volume_condition: Some(condition),
                }),
            });
        }

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: page.next.map(|t| t.to_string()).unwrap_or_default(),
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();

        // Unsupported capabilities have no capacity.
        let available_capacity = if capability::is_supported(&req.volume_capabilities) {
            self.state.capacity().await?.available_bytes
        } else {
            0
        };

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity,
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::GetVolume,
            Type::VolumeCondition,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn get_snapshot(
        &self,
        _request: Request<csi::GetSnapshotRequest>,
    ) -> Result<Response<csi::GetSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not supported"))
    }

    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = VolumeId::parse(req.volume_id.require("volume ID")?)?;
        let path = self.state.resolve_volume(&volume_id).await?;
        let stats = self.state.volume_stats(&path).await?;

        let mut context = Self::path_context(&path);
        context.insert("used_bytes".to_string(), stats.used_bytes.to_string());
        context.insert(
            "available_bytes".to_string(),
            stats.available_bytes.to_string(),
        );

        Ok(Response::new(csi::ControllerGetVolumeResponse {
            volume: Some(self.volume_to_proto(&volume_id, stats.capacity_bytes, context)),
            status: Some(csi::controller_get_volume_response::VolumeStatus {
                volume_condition: Some(healthy()),
                published_node_ids: vec![],
            }),
        }))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("volume modification is not supported"))
    }
}
