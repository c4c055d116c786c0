//! Host network state for the VPN session: interface, routes and DNS

pub mod network;
pub mod resolv;
pub mod routing;

pub use network::{HostNetwork, NetworkConfigurator, NetworkError};
pub use resolv::{ResolvConf, ResolvError};
pub use routing::{RoutePlan, RoutingError, VpnRouter};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::info;

/// Everything needed to apply, and later revert, a session's host changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub tun_name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub server: Ipv4Addr,
    pub split_include: Vec<Ipv4Net>,
    pub split_exclude: Vec<Ipv4Net>,
}

impl NetworkRequest {
    /// Configure the interface, then install routes. Stops at the first error
    /// without reverting; pair with [`NetworkRequest::revert`].
    pub fn apply(&self, network: &dyn NetworkConfigurator) -> Result<(), NetworkError> {
        network.configure_interface(&self.tun_name, self.address, self.netmask, &self.dns)?;
        network.install_routes(self.server, &self.split_include, &self.split_exclude)?;
        info!("Network configuration applied for {}", self.tun_name);
        Ok(())
    }

    pub fn revert(&self, network: &dyn NetworkConfigurator) {
        network.teardown(self.server, &self.dns, &self.split_include, &self.split_exclude);
        info!("Network configuration reverted for {}", self.tun_name);
    }
}
