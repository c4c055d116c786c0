//! Platform-specific implementations

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod testing;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Route not found: {0}")]
    RouteNotFound(String),
    #[error("Route already exists: {0}")]
    RouteExists(String),
    #[error("Routing table busy: {0}")]
    Transient(String),
    #[error("Interface error: {0}")]
    InterfaceError(String),
    #[error("No default route found")]
    NoDefaultRoute,
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

impl PlatformError {
    /// The route was already absent; deletion loops treat this as done.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::RouteNotFound(_))
    }

    /// An identical route is already installed.
    pub fn is_already_present(&self) -> bool {
        matches!(self, PlatformError::RouteExists(_))
    }

    /// The operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

/// The host's pre-VPN default route, captured before any session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInterface {
    /// Interface carrying the default route (e.g. "eth0")
    pub name: String,
    /// Source address the host uses on that interface
    pub ip4: Ipv4Addr,
    /// Default gateway
    pub gateway: Ipv4Addr,
    /// Hardware address, empty when unknown
    pub mac: String,
    /// Metric of the original default route
    pub default_metric: u32,
}

/// A single IPv4 route entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub device: String,
    pub metric: Option<u32>,
}

impl Route {
    /// Route through a next-hop gateway on `device`
    pub fn via_gateway(destination: Ipv4Net, gateway: Ipv4Addr, device: &str) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            device: device.to_string(),
            metric: None,
        }
    }

    /// Route bound directly to `device` (point-to-point, no next hop)
    pub fn on_device(destination: Ipv4Net, device: &str) -> Self {
        Self {
            destination,
            gateway: None,
            device: device.to_string(),
            metric: None,
        }
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Effective metric; lower wins.
    pub fn priority(&self) -> u32 {
        self.metric.unwrap_or(0)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        write!(f, " dev {}", self.device)?;
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// Platform-agnostic routing interface
pub trait RoutingManager: Send + Sync {
    fn add_route(&self, route: &Route) -> Result<(), PlatformError>;
    fn delete_route(&self, route: &Route) -> Result<(), PlatformError>;
}

/// Platform-agnostic link and address interface
pub trait InterfaceManager: Send + Sync {
    fn set_link_up(&self, name: &str) -> Result<(), PlatformError>;
    fn disable_multicast(&self, name: &str) -> Result<(), PlatformError>;
    fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), PlatformError>;
    /// Discover the interface carrying the current default route
    fn local_interface(&self) -> Result<LocalInterface, PlatformError>;
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager() -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Get the appropriate interface manager for the current platform
pub fn get_interface_manager() -> Result<Box<dyn InterfaceManager>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::AddRouteError("test error".to_string());
        assert_eq!(err.to_string(), "Failed to add route: test error");

        let err = PlatformError::DeleteRouteError("delete failed".to_string());
        assert_eq!(err.to_string(), "Failed to delete route: delete failed");

        let err = PlatformError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[test]
    fn test_error_classification() {
        assert!(PlatformError::RouteNotFound("x".into()).is_not_found());
        assert!(!PlatformError::RouteNotFound("x".into()).is_transient());
        assert!(PlatformError::Transient("busy".into()).is_transient());
        assert!(!PlatformError::DeleteRouteError("perm".into()).is_not_found());
        assert!(PlatformError::RouteExists("dup".into()).is_already_present());
    }

    #[test]
    fn test_route_display() {
        let route = Route::via_gateway(
            "10.1.0.0/16".parse().unwrap(),
            Ipv4Addr::new(192, 168, 1, 1),
            "eth0",
        )
        .with_metric(5);
        assert_eq!(route.to_string(), "10.1.0.0/16 via 192.168.1.1 dev eth0 metric 5");

        let route = Route::on_device("0.0.0.0/0".parse().unwrap(), "cstp0");
        assert_eq!(route.to_string(), "0.0.0.0/0 dev cstp0");
        assert_eq!(route.priority(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_get_managers_return_ok() {
        assert!(get_routing_manager().is_ok());
        assert!(get_interface_manager().is_ok());
    }
}
