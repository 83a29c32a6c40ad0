//! Instance types, instances, volumes and CPU samples.

use async_trait::async_trait;
use redb::ReadableDatabase;
use uuid::Uuid;

use super::{StateStore, millis, read_prefix};
use crate::error::StateResult;
use crate::repo::*;
use crate::tables::*;
use crate::types::*;

#[async_trait]
impl InstanceRepository for StateStore {
    async fn put_instance_type(&self, instance_type: &InstanceType) -> StateResult<()> {
        self.put(INSTANCE_TYPES, &instance_type.id, instance_type)
    }

    async fn get_instance_type(&self, id: &str) -> StateResult<Option<InstanceType>> {
        self.get(INSTANCE_TYPES, id)
    }

    async fn list_instance_types(&self) -> StateResult<Vec<InstanceType>> {
        self.scan(INSTANCE_TYPES, "")
    }

    async fn create_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.id.to_string(), instance)
    }

    async fn get_instance(&self, id: InstanceId) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, &id.to_string())
    }

    async fn modify_instance(&self, id: InstanceId, edit: Edit<'_, Instance>) -> StateResult<Option<Instance>> {
        self.update_if(INSTANCES, &id.to_string(), edit)
    }

    async fn delete_instance(&self, id: InstanceId) -> StateResult<Option<Instance>> {
        self.take(INSTANCES, &id.to_string())
    }

    async fn list_instances(&self, user_id: UserId) -> StateResult<Vec<Instance>> {
        let all: Vec<Instance> = self.scan(INSTANCES, "")?;
        let mut owned: Vec<Instance> = all.into_iter().filter(|i| i.user_id == user_id).collect();
        owned.sort_by_key(|i| i.created_at);
        Ok(owned)
    }
}

#[async_trait]
impl VolumeRepository for StateStore {
    async fn create_volume(&self, volume: &Volume) -> StateResult<()> {
        self.put(VOLUMES, &volume.id.to_string(), volume)
    }

    async fn get_volume(&self, id: Uuid) -> StateResult<Option<Volume>> {
        self.get(VOLUMES, &id.to_string())
    }

    async fn update_volume(&self, volume: &Volume) -> StateResult<()> {
        self.put(VOLUMES, &volume.id.to_string(), volume)
    }

    async fn list_volumes_for_instance(&self, instance_id: InstanceId) -> StateResult<Vec<Volume>> {
        let all: Vec<Volume> = self.scan(VOLUMES, "")?;
        Ok(all
            .into_iter()
            .filter(|v| v.instance_id == Some(instance_id))
            .collect())
    }
}

#[async_trait]
impl MetricRepository for StateStore {
    async fn record_cpu_sample(&self, sample: &CpuSample) -> StateResult<()> {
        let key = format!(
            "{}:{:020}:{}",
            sample.instance_id,
            millis(&sample.recorded_at),
            Uuid::new_v4().simple()
        );
        self.put(CPU_SAMPLES, &key, sample)
    }

    async fn get_average_cpu(&self, instance_ids: &[InstanceId], since: Timestamp) -> StateResult<Option<f64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CPU_SAMPLES).map_err(map_err!(Table))?;
        let mut sum = 0.0;
        let mut count = 0usize;
        for id in instance_ids {
            let samples: Vec<(String, CpuSample)> = read_prefix(&table, &format!("{id}:"))?;
            for (_, sample) in samples {
                if sample.recorded_at >= since {
                    sum += sample.cpu_percent;
                    count += 1;
                }
            }
        }
        Ok((count > 0).then(|| sum / count as f64))
    }
}
