//! Route table manipulation for the VPN tunnel
//!
//! Installs the server host route, split-include and split-exclude routes, and
//! in full-tunnel mode lifts the tunnel's default route above the host's own.
//! Every change is derived from the session's request plus the local interface
//! snapshot, so teardown can recompute and undo it without other state.

use crate::platform::{LocalInterface, PlatformError, Route, RoutingManager};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Split-exclude routes beat any include route for the same prefix
pub const EXCLUDE_METRIC: u32 = 5;
/// Split-include routes (and the full-tunnel default route)
pub const INCLUDE_METRIC: u32 = 6;
/// Metric the original default route is moved to in full-tunnel mode
pub const DEMOTED_DEFAULT_METRIC: u32 = 10;
/// Upper bound on delete calls for a single route
pub const MAX_DELETE_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("routing error: {route}: {source}")]
    RouteFailed {
        route: String,
        #[source]
        source: PlatformError,
    },
    #[error("Route {route} still present after {attempts} delete attempts")]
    DeleteExhausted { route: String, attempts: usize },
}

/// The full set of changes for one session, in installation order.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    /// Keeps tunnel-carrying traffic off the tunnel
    pub host_route: Route,
    /// (original, demoted) default route when full-tunnel mode must outrank it
    pub default_demotion: Option<(Route, Route)>,
    pub include: Vec<Route>,
    pub exclude: Vec<Route>,
}

impl RoutePlan {
    pub fn new(
        local: &LocalInterface,
        tun_name: &str,
        server: Ipv4Addr,
        include: &[Ipv4Net],
        exclude: &[Ipv4Net],
    ) -> Self {
        let host_route = Route::via_gateway(
            Ipv4Net::from(server),
            local.gateway,
            &local.name,
        );

        let full_tunnel = include.is_empty();
        let default_demotion = if full_tunnel && local.default_metric <= INCLUDE_METRIC {
            let original = Route::via_gateway(Ipv4Net::default(), local.gateway, &local.name)
                .with_metric(local.default_metric);
            let demoted = original.clone().with_metric(DEMOTED_DEFAULT_METRIC);
            Some((original, demoted))
        } else {
            None
        };

        let include_nets: Vec<Ipv4Net> = if full_tunnel {
            vec![Ipv4Net::default()]
        } else {
            include.to_vec()
        };

        Self {
            host_route,
            default_demotion,
            include: include_nets
                .into_iter()
                .map(|net| Route::on_device(net.trunc(), tun_name).with_metric(INCLUDE_METRIC))
                .collect(),
            exclude: exclude
                .iter()
                .map(|net| {
                    Route::via_gateway(net.trunc(), local.gateway, &local.name)
                        .with_metric(EXCLUDE_METRIC)
                })
                .collect(),
        }
    }

    /// Whether this plan routes everything through the tunnel
    pub fn is_full_tunnel(&self) -> bool {
        self.include.len() == 1 && self.include[0].destination.prefix_len() == 0
    }
}

pub struct VpnRouter {
    manager: Arc<dyn RoutingManager>,
    local: LocalInterface,
    tun_name: String,
}

impl VpnRouter {
    pub fn new(manager: Arc<dyn RoutingManager>, local: LocalInterface, tun_name: String) -> Self {
        info!(
            "Creating VpnRouter with gateway: {} interface: {} tunnel: {}",
            local.gateway, local.name, tun_name
        );
        Self {
            manager,
            local,
            tun_name,
        }
    }

    /// Get the pre-VPN gateway
    pub fn gateway(&self) -> Ipv4Addr {
        self.local.gateway
    }

    pub fn plan(&self, server: Ipv4Addr, include: &[Ipv4Net], exclude: &[Ipv4Net]) -> RoutePlan {
        RoutePlan::new(&self.local, &self.tun_name, server, include, exclude)
    }

    /// Install all routes for a session. Stops at the first failure; the
    /// caller rolls back with [`VpnRouter::teardown`].
    pub fn install(
        &self,
        server: Ipv4Addr,
        include: &[Ipv4Net],
        exclude: &[Ipv4Net],
    ) -> Result<(), RoutingError> {
        let plan = self.plan(server, include, exclude);

        self.add(&plan.host_route)?;

        if let Some((original, demoted)) = &plan.default_demotion {
            // Add the demoted copy first so a default route exists throughout
            self.add(demoted)?;
            self.delete_once(original)?;
            info!(
                "Original default route moved from metric {} to {}",
                self.local.default_metric, DEMOTED_DEFAULT_METRIC
            );
        }

        for route in &plan.include {
            self.add(route)?;
        }
        for route in &plan.exclude {
            self.add(route)?;
        }

        info!(
            "Installed {} include and {} exclude routes{}",
            plan.include.len(),
            plan.exclude.len(),
            if plan.is_full_tunnel() { " (full tunnel)" } else { "" }
        );
        Ok(())
    }

    /// Undo everything `install` may have applied, in reverse order.
    ///
    /// Best-effort and idempotent: missing routes are skipped, failures are
    /// logged and the remaining steps still run.
    pub fn teardown(&self, server: Ipv4Addr, include: &[Ipv4Net], exclude: &[Ipv4Net]) {
        let plan = self.plan(server, include, exclude);

        for route in plan.exclude.iter().chain(plan.include.iter()) {
            if let Err(e) = self.delete_all(route) {
                warn!("Failed to remove route {}: {} (continuing)", route, e);
            }
        }

        if let Some((original, demoted)) = &plan.default_demotion {
            if let Err(e) = self.add(original) {
                warn!("Failed to restore default route {}: {}", original, e);
            } else if let Err(e) = self.delete_all(demoted) {
                warn!("Failed to remove demoted default route {}: {}", demoted, e);
            }
        }

        if let Err(e) = self.delete_all(&plan.host_route) {
            warn!("Failed to remove host route {}: {} (continuing)", plan.host_route, e);
        }

        info!("Routes restored");
    }

    fn add(&self, route: &Route) -> Result<(), RoutingError> {
        debug!("Adding route: {}", route);
        match self.manager.add_route(route) {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_present() => {
                warn!("Route {} already exists (treating as success)", route);
                Ok(())
            }
            Err(source) => Err(RoutingError::RouteFailed {
                route: route.to_string(),
                source,
            }),
        }
    }

    /// Delete a single matching route; an absent route counts as removed.
    ///
    /// Used where repeating the delete is unsafe: the kernel treats metric 0
    /// as "any metric", so a second delete of the original default route
    /// would take out its demoted copy.
    fn delete_once(&self, route: &Route) -> Result<(), RoutingError> {
        match self.manager.delete_route(route) {
            Ok(()) => {
                debug!("Removed route {}", route);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(RoutingError::RouteFailed {
                route: route.to_string(),
                source,
            }),
        }
    }

    /// Delete every copy of `route`, bounded by [`MAX_DELETE_ATTEMPTS`].
    fn delete_all(&self, route: &Route) -> Result<(), RoutingError> {
        for attempt in 1..=MAX_DELETE_ATTEMPTS {
            match self.manager.delete_route(route) {
                Ok(()) => debug!("Removed route {} (attempt {})", route, attempt),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_transient() => {
                    debug!("Transient error removing {}: {} (retrying)", route, e);
                }
                Err(source) => {
                    return Err(RoutingError::RouteFailed {
                        route: route.to_string(),
                        source,
                    });
                }
            }
        }

        Err(RoutingError::DeleteExhausted {
            route: route.to_string(),
            attempts: MAX_DELETE_ATTEMPTS,
        })
    }
}
