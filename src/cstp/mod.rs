//! CSTP/DTLS tunnel implementation
//!
//! Negotiates a tunnel over an already authenticated TLS connection, relays
//! packets between the virtual interface and the TLS and DTLS channels, and
//! tears everything down exactly once when the session ends.

pub mod channel;
pub mod dtls;
pub mod negotiate;
pub mod packet;
pub mod session;
pub mod supervisor;
pub mod tun;
pub mod tunnel;

pub use channel::{DatagramLink, DtlsConnector, PacketRouter};
pub use dtls::WebrtcDtlsConnector;
pub use negotiate::{AgentIdentity, MasterSecret, NegotiationError, NegotiationParams, negotiate};
pub use packet::{FrameError, PacketType, TunnelPacket};
pub use session::{Channel, ChannelStatus, CloseReason, DtlsParams, Session, SessionConfig, SessionState};
pub use tun::{PacketDevice, PacketReader, PacketWriter, TunDevice, TunError};
pub use tunnel::{Tunnel, TunnelHandle, TunnelOptions};

use crate::vpn::NetworkError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("TLS connection failed: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TUN device error: {0}")]
    TunError(#[from] TunError),

    #[error("Packet framing error: {0}")]
    FrameError(#[from] FrameError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("Network configuration failed: {0}")]
    Configuration(#[from] NetworkError),

    #[error("DTLS handshake failed: {0}")]
    DtlsHandshake(String),

    #[error("Keepalive could not be sent")]
    KeepaliveFailed,

    #[error("No traffic from server for {0:?}")]
    LivenessTimeout(Duration),

    #[error("Tunnel disconnected")]
    Disconnected,

    #[error("Interrupted before the tunnel came up")]
    Interrupted,
}
