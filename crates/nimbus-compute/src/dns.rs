//! DNS zones and records.
//!
//! The backend is written first on every create: a backend failure fails
//! the request and nothing is persisted. If the store then rejects the row
//! (name collision) the backend write is undone.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use nimbus_core::{AuditAction, BackendError, Clock, CoreError, CoreResult, DnsBackend, RecordSet, Recorder, RequestContext};
use nimbus_state::{DnsRecord, DnsRepository, DnsZone, Instance, InstanceId, RecordType, VpcId, ZoneId};

/// TTL of records created for instances.
pub const INSTANCE_RECORD_TTL: u32 = 300;

pub struct DnsService {
    zones: Arc<dyn DnsRepository>,
    backend: Arc<dyn DnsBackend>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

fn valid_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .split('.')
            .all(|l| !l.is_empty() && l.len() <= 63 && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

fn record_set(record: &DnsRecord) -> RecordSet {
    RecordSet {
        name: record.name.clone(),
        record_type: record.record_type,
        ttl: record.ttl,
        records: vec![record.content.clone()],
    }
}

impl DnsService {
    pub fn new(zones: Arc<dyn DnsRepository>, backend: Arc<dyn DnsBackend>, recorder: Recorder, clock: Arc<dyn Clock>) -> Self {
        Self {
            zones,
            backend,
            recorder,
            clock,
        }
    }

    async fn owned_zone(&self, ctx: &RequestContext, id: ZoneId) -> CoreResult<DnsZone> {
        let user_id = ctx.user_id()?;
        self.zones
            .get_zone(id)
            .await?
            .filter(|z| z.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("zone {id}")))
    }

    pub async fn create_zone(&self, ctx: &RequestContext, vpc_id: VpcId, name: &str) -> CoreResult<DnsZone> {
        let user_id = ctx.user_id()?;
        let name = name.trim().trim_end_matches('.').to_lowercase();
        if !valid_label(&name) {
            return Err(CoreError::InvalidInput(format!("invalid zone name {name:?}")));
        }

        let backend_id = self.backend.create_zone(&name, &[]).await?;
        let zone = DnsZone {
            id: Uuid::new_v4(),
            user_id,
            vpc_id,
            name: name.clone(),
            backend_id,
            created_at: self.clock.now(),
        };
        if !self.zones.create_zone(&zone).await? {
            if let Err(e) = self.backend.delete_zone(&zone.backend_id).await {
                warn!(zone = %name, error = %e, "failed to undo backend zone");
            }
            return Err(CoreError::Conflict(format!("zone {name} already exists in vpc {vpc_id}")));
        }

        info!(zone_id = %zone.id, zone = %zone.name, %vpc_id, "dns zone created");
        self.recorder
            .audit(ctx, AuditAction::ZoneCreate { zone_id: zone.id, name })
            .await;
        Ok(zone)
    }

    pub async fn get_zone(&self, ctx: &RequestContext, id: ZoneId) -> CoreResult<DnsZone> {
        self.owned_zone(ctx, id).await
    }

    pub async fn list_zones(&self, ctx: &RequestContext) -> CoreResult<Vec<DnsZone>> {
        Ok(self.zones.list_zones(ctx.user_id()?).await?)
    }

    pub async fn delete_zone(&self, ctx: &RequestContext, id: ZoneId) -> CoreResult<()> {
        let zone = self.owned_zone(ctx, id).await?;
        match self.backend.delete_zone(&zone.backend_id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.zones.delete_zone(id).await?;
        info!(zone_id = %id, "dns zone deleted");
        self.recorder.audit(ctx, AuditAction::ZoneDelete { zone_id: id }).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_record(
        &self,
        ctx: &RequestContext,
        zone_id: ZoneId,
        name: &str,
        record_type: RecordType,
        content: &str,
        ttl: u32,
        priority: Option<u16>,
    ) -> CoreResult<DnsRecord> {
        let zone = self.owned_zone(ctx, zone_id).await?;
        let name = name.trim().trim_end_matches('.').to_lowercase();
        if !valid_label(&name) {
            return Err(CoreError::InvalidInput(format!("invalid record name {name:?}")));
        }
        if content.trim().is_empty() {
            return Err(CoreError::InvalidInput("record content is required".into()));
        }
        if record_type == RecordType::Mx && priority.is_none() {
            return Err(CoreError::InvalidInput("MX records need a priority".into()));
        }

        let record = DnsRecord {
            id: Uuid::new_v4(),
            zone_id,
            name,
            record_type,
            content: content.trim().to_string(),
            ttl,
            priority,
            instance_id: None,
            created_at: self.clock.now(),
        };
        self.insert_record(&zone, &record).await?;
        self.recorder
            .audit(
                ctx,
                AuditAction::RecordCreate {
                    record_id: record.id,
                    zone_id,
                    name: record.name.clone(),
                    record_type: record_type.as_str().to_string(),
                },
            )
            .await;
        Ok(record)
    }

    async fn insert_record(&self, zone: &DnsZone, record: &DnsRecord) -> CoreResult<()> {
        let set = record_set(record);
        self.backend
            .add_records(&zone.backend_id, std::slice::from_ref(&set))
            .await?;
        if !self.zones.create_record(record).await? {
            if let Err(e) = self.backend.delete_records(&zone.backend_id, &[set]).await {
                warn!(record = %record.name, error = %e, "failed to undo backend record");
            }
            return Err(CoreError::Conflict(format!(
                "{} record {} already exists",
                record.record_type.as_str(),
                record.name
            )));
        }
        debug!(zone = %zone.name, record = %record.name, kind = record.record_type.as_str(), "dns record stored");
        Ok(())
    }

    pub async fn delete_record(&self, ctx: &RequestContext, zone_id: ZoneId, record_id: Uuid) -> CoreResult<()> {
        let zone = self.owned_zone(ctx, zone_id).await?;
        let record = self
            .zones
            .get_record(zone_id, record_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("record {record_id}")))?;
        self.remove_record(&zone, &record).await?;
        self.recorder
            .audit(ctx, AuditAction::RecordDelete { record_id, zone_id })
            .await;
        Ok(())
    }

    async fn remove_record(&self, zone: &DnsZone, record: &DnsRecord) -> CoreResult<()> {
        match self.backend.delete_records(&zone.backend_id, &[record_set(record)]).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.zones.delete_record(zone.id, record.id).await?;
        Ok(())
    }

    pub async fn list_records(&self, ctx: &RequestContext, zone_id: ZoneId) -> CoreResult<Vec<DnsRecord>> {
        self.owned_zone(ctx, zone_id).await?;
        Ok(self.zones.list_records(zone_id).await?)
    }

    // ── Instance integration ───────────────────────────────────────

    /// Publish `<instance>.<zone>` as an A record if the instance's VPC has
    /// a zone. Returns the record, or `None` when there is nothing to do.
    pub async fn register_instance(&self, instance: &Instance, ip: &str) -> CoreResult<Option<DnsRecord>> {
        let Some(vpc_id) = instance.vpc_id else {
            return Ok(None);
        };
        let Some(zone) = self.zones.get_zone_by_vpc(vpc_id).await? else {
            return Ok(None);
        };
        let record = DnsRecord {
            id: Uuid::new_v4(),
            zone_id: zone.id,
            name: format!("{}.{}", instance.name.to_lowercase(), zone.name),
            record_type: RecordType::A,
            content: ip.to_string(),
            ttl: INSTANCE_RECORD_TTL,
            priority: None,
            instance_id: Some(instance.id),
            created_at: self.clock.now(),
        };
        self.insert_record(&zone, &record).await?;
        info!(instance_id = %instance.id, record = %record.name, ip, "instance registered in dns");
        Ok(Some(record))
    }

    /// Remove every record owned by `instance_id`. Failures are logged.
    pub async fn unregister_instance(&self, instance_id: InstanceId) -> CoreResult<()> {
        for record in self.zones.list_records_for_instance(instance_id).await? {
            let Some(zone) = self.zones.get_zone(record.zone_id).await? else {
                continue;
            };
            if let Err(e) = self.remove_record(&zone, &record).await {
                warn!(%instance_id, record = %record.name, error = %e, "dns unregister failed");
            }
        }
        Ok(())
    }
}
