use crate::{
    device_class::{DeviceClass, DeviceClassType, Registry, ThinPoolConfig},
    lvm::VolumeGroup,
    proto::{
        vg_service_server::VgService, GetFreeBytesRequest, GetFreeBytesResponse, GetLvListRequest,
        GetLvListResponse, WatchItem, WatchRequest, WatchResponse,
    },
};

use super::{notify::Notifier, proto_volume, GrpcResult};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// The VG service: free-space queries and the watch stream.
#[derive(Debug, Clone)]
pub struct VgSvc {
    registry: Arc<Registry>,
    notifier: Notifier,
}

fn thin_pool_config(dc: &DeviceClass) -> Result<&ThinPoolConfig, Status> {
    dc.thin_pool.as_ref().ok_or_else(|| {
        Status::internal(format!(
            "device class {} has no thin-pool configuration",
            dc.name
        ))
    })
}

/// Free bytes advertised for a device class. For thick classes this is the
/// volume group's own free space; for thin classes it is synthesized from
/// the overprovision ratio and the virtual sizes of the pool members,
/// which are re-listed on every call because they mutate concurrently.
pub(super) async fn free_bytes(dc: &DeviceClass, vg: &VolumeGroup) -> Result<u64, Status> {
    match dc.class_type {
        DeviceClassType::Thick => Ok(vg.free()),
        DeviceClassType::Thin => {
            let pool_config = thin_pool_config(dc)?;
            let pool = vg.find_pool(&pool_config.name).await?;
            let usage = pool.usage().await?;
            Ok(usage.free_bytes(pool_config.overprovision_ratio))
        }
    }
}

/// The watch payload for one device class.
async fn watch_item(dc: &DeviceClass) -> Result<WatchItem, Status> {
    let vg = VolumeGroup::find(&dc.volume_group).await?;
    let (free, size) = match dc.class_type {
        DeviceClassType::Thick => (vg.free(), vg.size()),
        DeviceClassType::Thin => {
            let pool_config = thin_pool_config(dc)?;
            let pool = vg.find_pool(&pool_config.name).await?;
            let usage = pool.usage().await?;
            let advertised = (pool_config.overprovision_ratio * usage.size_bytes as f64) as u64;
            (usage.free_bytes(pool_config.overprovision_ratio), advertised)
        }
    };
    Ok(WatchItem {
        device_class: dc.name.clone(),
        free_bytes: free as i64,
        size_bytes: size as i64,
    })
}

/// Build one watch response covering every configured device class. A
/// class whose volume group or pool cannot be observed is skipped with a
/// warning so a single broken class does not poison the stream.
async fn watch_response(registry: &Registry) -> WatchResponse {
    let snapshot = registry.snapshot();
    let mut items = Vec::with_capacity(snapshot.device_classes.classes().len());
    for dc in snapshot.device_classes.classes() {
        match watch_item(dc).await {
            Ok(item) => items.push(item),
            Err(error) => {
                warn!(
                    "skipping device class {} in watch update: {}",
                    dc.name,
                    error.message()
                );
            }
        }
    }
    WatchResponse { items }
}

impl VgSvc {
    pub fn new(registry: Arc<Registry>, notifier: Notifier) -> Self {
        Self { registry, notifier }
    }
}

#[tonic::async_trait]
impl VgService for VgSvc {
    async fn get_lv_list(
        &self,
        request: Request<GetLvListRequest>,
    ) -> GrpcResult<GetLvListResponse> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;
        let volumes = vg.list_volumes().await?;
        Ok(Response::new(GetLvListResponse {
            volumes: volumes.into_values().map(proto_volume).collect(),
        }))
    }

    async fn get_free_bytes(
        &self,
        request: Request<GetFreeBytesRequest>,
    ) -> GrpcResult<GetFreeBytesResponse> {
        let args = request.into_inner();
        let snapshot = self.registry.snapshot();
        let dc = snapshot.device_classes.resolve(&args.device_class)?;

        let vg = VolumeGroup::find(&dc.volume_group).await?;
        let free = free_bytes(dc, &vg).await?;
        Ok(Response::new(GetFreeBytesResponse {
            free_bytes: free as i64,
        }))
    }

    type WatchStream = ReceiverStream<Result<WatchResponse, Status>>;

    async fn watch(&self, _request: Request<WatchRequest>) -> GrpcResult<Self::WatchStream> {
        let (tx, rx) = mpsc::channel(4);
        let mut ticks = self.notifier.subscribe();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                let response = watch_response(&registry).await;
                if tx.send(Ok(response)).await.is_err() {
                    // the subscriber hung up
                    break;
                }
                match ticks.recv().await {
                    Ok(()) => {}
                    // ticks were coalesced; the next response carries
                    // current state anyway
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
