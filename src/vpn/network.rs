//! Host network configuration for an active session
//!
//! Applies and reverts the interface address, routes and resolver settings.

use crate::platform::{InterfaceManager, LocalInterface, PlatformError, RoutingManager};
use crate::vpn::resolv::{ResolvConf, ResolvError};
use crate::vpn::routing::{RoutingError, VpnRouter};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Interface configuration failed: {0}")]
    Interface(#[from] PlatformError),
    #[error("Invalid netmask: {0}")]
    InvalidNetmask(Ipv4Addr),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("Resolver configuration failed: {0}")]
    Resolver(#[from] ResolvError),
}

/// Applies and reverts host network state for a session.
pub trait NetworkConfigurator: Send + Sync {
    /// Bring `name` up, disable multicast, assign the address and, when
    /// `dns` is non-empty, back up and replace the resolver configuration.
    fn configure_interface(
        &self,
        name: &str,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        dns: &[Ipv4Addr],
    ) -> Result<(), NetworkError>;

    /// Install the server host route and split routes.
    fn install_routes(
        &self,
        server: Ipv4Addr,
        include: &[Ipv4Net],
        exclude: &[Ipv4Net],
    ) -> Result<(), NetworkError>;

    /// Revert both of the above. Idempotent and safe after partial failure.
    fn teardown(&self, server: Ipv4Addr, dns: &[Ipv4Addr], include: &[Ipv4Net], exclude: &[Ipv4Net]);
}

/// [`NetworkConfigurator`] over the platform managers.
pub struct HostNetwork {
    interfaces: Arc<dyn InterfaceManager>,
    router: VpnRouter,
    resolv: ResolvConf,
}

impl HostNetwork {
    pub fn new(
        interfaces: Arc<dyn InterfaceManager>,
        routes: Arc<dyn RoutingManager>,
        local: LocalInterface,
        tun_name: &str,
        resolv: ResolvConf,
    ) -> Self {
        Self {
            interfaces,
            router: VpnRouter::new(routes, local, tun_name.to_string()),
            resolv,
        }
    }
}

impl NetworkConfigurator for HostNetwork {
    fn configure_interface(
        &self,
        name: &str,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
        dns: &[Ipv4Addr],
    ) -> Result<(), NetworkError> {
        let prefix = crate::cstp::negotiate::mask_to_prefix(netmask)
            .ok_or(NetworkError::InvalidNetmask(netmask))?;
        let cidr = Ipv4Net::new(address, prefix).map_err(|_| NetworkError::InvalidNetmask(netmask))?;

        self.interfaces.set_link_up(name)?;
        if let Err(e) = self.interfaces.disable_multicast(name) {
            warn!("Could not disable multicast on {}: {}", name, e);
        }
        self.interfaces.add_address(name, cidr)?;
        info!("Interface {} configured with {}", name, cidr);

        self.resolv.install(dns)?;
        Ok(())
    }

    fn install_routes(
        &self,
        server: Ipv4Addr,
        include: &[Ipv4Net],
        exclude: &[Ipv4Net],
    ) -> Result<(), NetworkError> {
        Ok(self.router.install(server, include, exclude)?)
    }

    fn teardown(&self, server: Ipv4Addr, dns: &[Ipv4Addr], include: &[Ipv4Net], exclude: &[Ipv4Net]) {
        self.router.teardown(server, include, exclude);

        if !dns.is_empty() {
            if let Err(e) = self.resolv.restore() {
                warn!("Failed to restore resolver configuration: {}", e);
            }
        }
    }
}
