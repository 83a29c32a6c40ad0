//! Block volumes attachable to instances at launch.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use nimbus_core::{Clock, CoreError, CoreResult, RequestContext};
use nimbus_state::{Volume, VolumeRepository, VolumeStatus};

pub const MAX_VOLUME_GB: u32 = 1024;

pub struct VolumeService {
    volumes: Arc<dyn VolumeRepository>,
    clock: Arc<dyn Clock>,
}

impl VolumeService {
    pub fn new(volumes: Arc<dyn VolumeRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { volumes, clock }
    }

    pub async fn create_volume(&self, ctx: &RequestContext, name: &str, size_gb: u32) -> CoreResult<Volume> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidInput("volume name is required".into()));
        }
        if size_gb == 0 || size_gb > MAX_VOLUME_GB {
            return Err(CoreError::InvalidInput(format!("size must be 1-{MAX_VOLUME_GB} GB")));
        }
        let volume = Volume {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.trim().to_string(),
            size_gb,
            status: VolumeStatus::Available,
            instance_id: None,
            mount_path: None,
            created_at: self.clock.now(),
        };
        self.volumes.create_volume(&volume).await?;
        info!(volume_id = %volume.id, size_gb, "volume created");
        Ok(volume)
    }

    pub async fn get_volume(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Volume> {
        let user_id = ctx.user_id()?;
        self.volumes
            .get_volume(id)
            .await?
            .filter(|v| v.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("volume {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::SystemClock;
    use nimbus_state::StateStore;

    #[tokio::test]
    async fn create_and_get_owned_volume() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let service = VolumeService::new(store, Arc::new(SystemClock));
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());

        let volume = service.create_volume(&ctx, "data", 10).await.unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert_eq!(service.get_volume(&ctx, volume.id).await.unwrap(), volume);

        let stranger = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(service.get_volume(&stranger, volume.id).await, Err(CoreError::NotFound(_))));
        assert!(service.create_volume(&ctx, "big", MAX_VOLUME_GB + 1).await.is_err());
    }
}
