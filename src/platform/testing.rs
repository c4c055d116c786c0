//! In-memory platform used by unit tests

use super::{InterfaceManager, LocalInterface, PlatformError, Route, RoutingManager};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Records every operation and keeps a simulated routing table.
#[derive(Default)]
pub(crate) struct RecordingPlatform {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<String>>,
    fail_add: Mutex<Option<Ipv4Net>>,
    fail_address: Mutex<bool>,
}

impl RecordingPlatform {
    pub(crate) fn with_routes(routes: Vec<Route>) -> Self {
        Self {
            routes: Mutex::new(routes),
            ..Default::default()
        }
    }

    /// Make the next add of `destination` fail
    pub(crate) fn fail_add_of(&self, destination: Ipv4Net) {
        *self.fail_add.lock().unwrap() = Some(destination);
    }

    pub(crate) fn fail_address_assignment(&self) {
        *self.fail_address.lock().unwrap() = true;
    }

    pub(crate) fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().clone()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl RoutingManager for RecordingPlatform {
    fn add_route(&self, route: &Route) -> Result<(), PlatformError> {
        self.log.lock().unwrap().push(format!("add {}", route));
        if *self.fail_add.lock().unwrap() == Some(route.destination) {
            return Err(PlatformError::AddRouteError("injected failure".into()));
        }
        let mut routes = self.routes.lock().unwrap();
        if routes.contains(route) {
            return Err(PlatformError::RouteExists(route.to_string()));
        }
        routes.push(route.clone());
        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<(), PlatformError> {
        self.log.lock().unwrap().push(format!("del {}", route));
        let mut routes = self.routes.lock().unwrap();
        match routes.iter().position(|r| kernel_delete_matches(route, r)) {
            Some(index) => {
                routes.remove(index);
                Ok(())
            }
            None => Err(PlatformError::RouteNotFound(route.to_string())),
        }
    }
}

/// Mirrors `ip route del`: a delete without a metric, or with metric 0,
/// matches the first route with the same destination, gateway and device at
/// any metric.
fn kernel_delete_matches(wanted: &Route, installed: &Route) -> bool {
    wanted.destination == installed.destination
        && wanted.gateway == installed.gateway
        && wanted.device == installed.device
        && (wanted.priority() == 0 || wanted.metric == installed.metric)
}

impl InterfaceManager for RecordingPlatform {
    fn set_link_up(&self, name: &str) -> Result<(), PlatformError> {
        self.log.lock().unwrap().push(format!("up {}", name));
        Ok(())
    }

    fn disable_multicast(&self, name: &str) -> Result<(), PlatformError> {
        self.log.lock().unwrap().push(format!("multicast off {}", name));
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), PlatformError> {
        self.log.lock().unwrap().push(format!("addr {} {}", name, address));
        if *self.fail_address.lock().unwrap() {
            return Err(PlatformError::InterfaceError("injected failure".into()));
        }
        Ok(())
    }

    fn local_interface(&self) -> Result<LocalInterface, PlatformError> {
        Ok(sample_local_interface())
    }
}

pub(crate) fn sample_local_interface() -> LocalInterface {
    LocalInterface {
        name: "eth0".to_string(),
        ip4: Ipv4Addr::new(192, 168, 1, 10),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
        mac: "52:54:00:12:34:56".to_string(),
        default_metric: 0,
    }
}

/// The host's default route as it exists before the VPN starts
pub(crate) fn original_default_route(local: &LocalInterface) -> Route {
    Route::via_gateway(Ipv4Net::default(), local.gateway, &local.name)
        .with_metric(local.default_metric)
}
