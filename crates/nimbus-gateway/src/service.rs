//! Route CRUD. Every mutation reloads the routing table.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Recorder, RequestContext};
use nimbus_state::{GatewayRepository, GatewayRoute};

use crate::table::{RouteTable, Upstream};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRouteRequest {
    pub name: String,
    pub path_prefix: String,
    pub target_url: String,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub rewrite_host: bool,
}

pub struct RouteService {
    routes: Arc<dyn GatewayRepository>,
    table: Arc<RouteTable>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl RouteService {
    pub fn new(
        routes: Arc<dyn GatewayRepository>,
        table: Arc<RouteTable>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            routes,
            table,
            recorder,
            clock,
        }
    }

    /// Reload the table from the store.
    pub async fn refresh(&self) -> CoreResult<usize> {
        let routes = self.routes.list_routes().await?;
        self.table.replace(routes);
        Ok(self.table.len())
    }

    pub async fn create_route(&self, ctx: &RequestContext, req: CreateRouteRequest) -> CoreResult<GatewayRoute> {
        let user_id = ctx.user_id()?;
        let prefix = req.path_prefix.trim();
        if !prefix.starts_with('/') {
            return Err(CoreError::InvalidInput(format!("path prefix `{prefix}` must start with '/'")));
        }
        Upstream::parse(req.target_url.trim()).map_err(CoreError::InvalidInput)?;
        if self
            .routes
            .list_routes()
            .await?
            .iter()
            .any(|r| r.path_prefix == prefix)
        {
            return Err(CoreError::Conflict(format!("a route for `{prefix}` already exists")));
        }

        let route = GatewayRoute {
            id: Uuid::new_v4(),
            user_id,
            name: req.name.trim().to_string(),
            path_prefix: prefix.to_string(),
            target_url: req.target_url.trim().to_string(),
            strip_prefix: req.strip_prefix,
            rewrite_host: req.rewrite_host,
            created_at: self.clock.now(),
        };
        self.routes.create_route(&route).await?;
        self.refresh().await?;
        info!(route_id = %route.id, prefix = %route.path_prefix, target = %route.target_url, "gateway route created");
        self.recorder
            .audit(
                ctx,
                AuditAction::RouteCreate {
                    route_id: route.id,
                    path_prefix: route.path_prefix.clone(),
                },
            )
            .await;
        Ok(route)
    }

    pub async fn delete_route(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<()> {
        let user_id = ctx.user_id()?;
        if self
            .routes
            .get_route(id)
            .await?
            .filter(|r| r.user_id == user_id)
            .is_none()
        {
            return Err(CoreError::not_found(format!("route {id}")));
        }
        self.routes.delete_route(id).await?;
        self.refresh().await?;
        info!(route_id = %id, "gateway route deleted");
        self.recorder.audit(ctx, AuditAction::RouteDelete { route_id: id }).await;
        Ok(())
    }

    pub async fn list_routes(&self, ctx: &RequestContext) -> CoreResult<Vec<GatewayRoute>> {
        let user_id = ctx.user_id()?;
        let routes = self.routes.list_routes().await?;
        Ok(routes.into_iter().filter(|r| r.user_id == user_id).collect())
    }
}
