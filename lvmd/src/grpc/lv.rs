use crate::{
    device_class::{DeviceClassType, Registry},
    lvm::{self, AccessType, VolumeGroup},
    proto::{
        lv_service_server::LvService, CreateLvRequest, CreateLvResponse, CreateLvSnapshotRequest,
        CreateLvSnapshotResponse, Empty, RemoveLvRequest, ResizeLvRequest,
    },
};

use super::{notify::Notifier, proto_volume, requested_size_bytes, vg::free_bytes, GrpcResult};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// The LV service: create, remove, resize and snapshot logical volumes.
/// Every successful mutation posts a notifier tick so watch subscribers
/// observe the new free space.
#[derive(Debug, Clone)]
pub struct LvSvc {
    registry: Arc<Registry>,
    notifier: Notifier,
}

impl LvSvc {
    pub fn new(registry: Arc<Registry>, notifier: Notifier) -> Self {
        Self { registry, notifier }
    }
}

#[tonic::async_trait]
impl LvService for LvSvc {
    async fn create_lv(&self, request: Request<CreateLvRequest>) -> GrpcResult<CreateLvResponse> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;
        let size = requested_size_bytes(args.size_bytes, args.size_gb)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;

        // a create retried by the CSI layer must converge, so an existing
        // volume of the requested size is simply returned
        match vg.find_volume(&args.name).await {
            Ok(existing) => {
                return if existing.size() == size {
                    info!(
                        "logical volume {} already exists with the requested size",
                        existing.full_name()
                    );
                    Ok(Response::new(CreateLvResponse {
                        volume: Some(proto_volume(existing)),
                    }))
                } else {
                    Err(Status::already_exists(format!(
                        "logical volume {} already exists with size {}, requested {size}",
                        existing.full_name(),
                        existing.size(),
                    )))
                };
            }
            Err(lvm::Error::LvNotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }

        let free = free_bytes(dc, &vg).await?;
        if free < size {
            return Err(Status::resource_exhausted(format!(
                "no enough space left on VG: free={free}, requested={size}"
            )));
        }

        let mut options = dc.lvcreate_options.clone();
        options.extend(
            snapshot
                .option_classes
                .resolve(&args.lvcreate_option_class)?
                .iter()
                .cloned(),
        );
        let stripe = dc.stripe.unwrap_or(0);
        let stripe_size = dc.stripe_size.as_deref();

        match dc.class_type {
            DeviceClassType::Thick => {
                vg.create_volume(&args.name, size, &args.tags, stripe, stripe_size, &options)
                    .await?
            }
            DeviceClassType::Thin => {
                let pool_config = dc.thin_pool.as_ref().ok_or_else(|| {
                    Status::internal(format!(
                        "device class {} has no thin-pool configuration",
                        dc.name
                    ))
                })?;
                let pool = vg.find_pool(&pool_config.name).await?;
                pool.create_volume(&args.name, size, &args.tags, stripe, stripe_size, &options)
                    .await?
            }
        }

        // lvm rounds the size up to the extent size; observe the result
        let volume = vg.find_volume(&args.name).await?;
        info!(
            "created logical volume {}, size {} bytes",
            volume.full_name(),
            volume.size()
        );
        self.notifier.notify();

        Ok(Response::new(CreateLvResponse {
            volume: Some(proto_volume(volume)),
        }))
    }

    async fn remove_lv(&self, request: Request<RemoveLvRequest>) -> GrpcResult<Empty> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;
        match vg.find_volume(&args.name).await {
            Ok(volume) => {
                let full_name = volume.full_name().to_string();
                volume.remove().await?;
                info!("removed logical volume {full_name}");
                self.notifier.notify();
            }
            // a remove retried by the CSI layer must converge
            Err(lvm::Error::LvNotFound { .. }) => {
                info!(
                    "logical volume {}/{} does not exist, nothing to remove",
                    vg.name(),
                    args.name
                );
            }
            Err(error) => return Err(error.into()),
        }
        Ok(Response::new(Empty {}))
    }

    async fn resize_lv(&self, request: Request<ResizeLvRequest>) -> GrpcResult<Empty> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;
        let size = requested_size_bytes(args.size_bytes, args.size_gb)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;
        let mut volume = vg.find_volume(&args.name).await?;

        let current = volume.size();
        if size < current {
            return Err(Status::invalid_argument(format!(
                "logical volume {} cannot be shrunk from {current} to {size} bytes",
                volume.full_name()
            )));
        }
        if size == current {
            return Ok(Response::new(Empty {}));
        }

        let free = free_bytes(dc, &vg).await?;
        if size - current > free {
            return Err(Status::resource_exhausted(format!(
                "no enough space left on VG: free={free}, requested={}",
                size - current
            )));
        }

        volume.resize(size).await?;
        info!(
            "resized logical volume {} to {} bytes",
            volume.full_name(),
            volume.size()
        );
        self.notifier.notify();
        Ok(Response::new(Empty {}))
    }

    async fn create_lv_snapshot(
        &self,
        request: Request<CreateLvSnapshotRequest>,
    ) -> GrpcResult<CreateLvSnapshotResponse> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;
        let access: AccessType = args.access_type.parse().map_err(Status::from)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;
        let source = vg.find_volume(&args.source_volume).await?;

        // a snapshot retried by the CSI layer must converge on the same
        // origin
        match vg.find_volume(&args.name).await {
            Ok(existing) => {
                return if existing.origin() == Some(args.source_volume.as_str()) {
                    info!(
                        "snapshot {} of {} already exists",
                        existing.full_name(),
                        args.source_volume
                    );
                    Ok(Response::new(CreateLvSnapshotResponse {
                        snapshot: Some(proto_volume(existing)),
                    }))
                } else {
                    Err(Status::already_exists(format!(
                        "logical volume {} already exists and is not a snapshot of {}",
                        existing.full_name(),
                        args.source_volume,
                    )))
                };
            }
            Err(lvm::Error::LvNotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }

        source.thin_snapshot(&args.name, &args.tags).await?;

        // a fresh thin snapshot must be explicitly activated for the
        // requested access before anyone can use it
        let created = vg.find_volume(&args.name).await?;
        created.activate(access).await?;

        let created = vg.find_volume(&args.name).await?;
        info!(
            "created snapshot {} of {}, size {} bytes",
            created.full_name(),
            source.full_name(),
            created.size()
        );
        self.notifier.notify();

        Ok(Response::new(CreateLvSnapshotResponse {
            snapshot: Some(proto_volume(created)),
        }))
    }
}
