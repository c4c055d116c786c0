//! cstp-vpn - OpenConnect-compatible CSTP/DTLS VPN client
//!
//! Upgrades an authenticated TLS connection into a VPN tunnel with the CSTP
//! CONNECT handshake, relays packets between a TUN device and the server over
//! TLS and (when offered) DTLS, and keeps host routes and DNS in lockstep with
//! the session.
//!
//! # Architecture
//!
//! - `auth`: TLS connection plus pre-obtained session cookie
//! - `config`: Configuration file handling (TOML)
//! - `cstp`: Negotiation, framing, channel workers and session supervision
//! - `platform`: OS routing and interface mechanics (Linux)
//! - `vpn`: Route planning, resolver management and rollback
//! - `state`: Persistent state for crash recovery
//!
//! # Usage
//!
//! ```bash
//! sudo cstp-vpn connect --cookie "$(openconnect --authenticate ... | grep COOKIE)"
//! ```

pub mod auth;
pub mod config;
pub mod cstp;
pub mod platform;
pub mod state;
pub mod vpn;

pub use config::Config;
pub use cstp::{Tunnel, TunnelError, TunnelHandle, TunnelOptions};
pub use state::VpnState;
