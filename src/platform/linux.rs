//! Linux-specific routing implementation
//!
//! Drives iproute2 (`ip`) for link, address and route changes.

use super::{InterfaceManager, LocalInterface, PlatformError, Route, RoutingManager};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::process::Command;
use tracing::debug;

/// Address used to look up the default route
const ROUTE_LOOKUP_ADDRESS: &str = "8.8.8.8";

pub struct LinuxRoutingManager;

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingManager for LinuxRoutingManager {
    fn add_route(&self, route: &Route) -> Result<(), PlatformError> {
        let output = run_ip(&route_args("add", route))
            .map_err(|e| PlatformError::AddRouteError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_route_error(&stderr, PlatformError::AddRouteError));
        }

        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<(), PlatformError> {
        let output = run_ip(&route_args("del", route))
            .map_err(|e| PlatformError::DeleteRouteError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_route_error(&stderr, PlatformError::DeleteRouteError));
        }

        Ok(())
    }
}

impl InterfaceManager for LinuxRoutingManager {
    fn set_link_up(&self, name: &str) -> Result<(), PlatformError> {
        run_link_command(&["link", "set", "dev", name, "up"])
    }

    fn disable_multicast(&self, name: &str) -> Result<(), PlatformError> {
        run_link_command(&["link", "set", "dev", name, "multicast", "off"])
    }

    fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), PlatformError> {
        let cidr = address.to_string();
        run_link_command(&["addr", "add", cidr.as_str(), "dev", name])
    }

    fn local_interface(&self) -> Result<LocalInterface, PlatformError> {
        let output = run_ip(&["-4", "route", "get", ROUTE_LOOKUP_ADDRESS])
            .map_err(|e| PlatformError::InterfaceError(e.to_string()))?;
        if !output.status.success() {
            return Err(PlatformError::NoDefaultRoute);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let (name, gateway, ip4) = parse_route_get(&stdout).ok_or(PlatformError::NoDefaultRoute)?;

        let default_metric = run_ip(&["-4", "route", "show", "default", "dev", name.as_str()])
            .ok()
            .filter(|o| o.status.success())
            .and_then(|o| parse_metric(&String::from_utf8_lossy(&o.stdout)))
            .unwrap_or(0);

        let mac = std::fs::read_to_string(format!("/sys/class/net/{}/address", name))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(LocalInterface {
            name,
            ip4,
            gateway,
            mac,
            default_metric,
        })
    }
}

fn run_ip<S: AsRef<str>>(args: &[S]) -> std::io::Result<std::process::Output> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    debug!("ip {}", args.join(" "));
    Command::new("ip").args(&args).output()
}

fn run_link_command(args: &[&str]) -> Result<(), PlatformError> {
    let output = run_ip(args).map_err(|e| PlatformError::InterfaceError(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::InterfaceError(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(())
}

/// Build `ip route <verb>` arguments for a route
fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut args = vec![
        "-4".to_string(),
        "route".to_string(),
        verb.to_string(),
        route.destination.to_string(),
    ];
    if let Some(gateway) = route.gateway {
        args.push("via".to_string());
        args.push(gateway.to_string());
    }
    args.push("dev".to_string());
    args.push(route.device.clone());
    if let Some(metric) = route.metric {
        args.push("metric".to_string());
        args.push(metric.to_string());
    }
    args
}

/// Map iproute2 stderr onto the deletion loop's error classes
fn classify_route_error(stderr: &str, other: fn(String) -> PlatformError) -> PlatformError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("no such process")
        || lower.contains("cannot find device")
        || lower.contains("esrch")
    {
        PlatformError::RouteNotFound(message)
    } else if lower.contains("file exists") {
        PlatformError::RouteExists(message)
    } else if lower.contains("resource temporarily unavailable")
        || lower.contains("device or resource busy")
        || lower.contains("no buffer space")
    {
        PlatformError::Transient(message)
    } else {
        other(message)
    }
}

/// Parse `ip route get` output into (device, gateway, source)
///
/// Example: `8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.10 uid 1000`
fn parse_route_get(output: &str) -> Option<(String, Ipv4Addr, Ipv4Addr)> {
    let line = output.lines().next()?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .iter()
            .position(|t| *t == key)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };

    let device = value_after("dev")?.to_string();
    let gateway = value_after("via")?.parse().ok()?;
    let source = value_after("src")?.parse().ok()?;
    Some((device, gateway, source))
}

/// Parse the metric of the first route line, if any
fn parse_metric(output: &str) -> Option<u32> {
    let line = output.lines().next()?;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "metric" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}
