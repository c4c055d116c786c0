//! Session state shared by the channel workers and the supervisor
//!
//! The negotiated configuration is immutable once the session exists. Live
//! status (lifecycle state, per-channel health and last receive time) is kept
//! in atomics so every task can read it without locking; each channel worker
//! is the only writer of its own channel's fields.

use crate::cstp::negotiate::MasterSecret;
use crate::vpn::NetworkRequest;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Parameters for the secondary DTLS channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsParams {
    pub port: u16,
    pub session_id: String,
    /// Cipher suite selected by the server
    pub cipher_suite: String,
}

/// Everything the server told us during negotiation, plus the transport facts
/// the auth provider supplied.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_token: String,
    pub hostname: String,
    pub server_address: Ipv4Addr,
    pub tls_cipher_suite: String,
    pub mtu: u16,
    pub base_mtu: u16,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub split_include: Vec<Ipv4Net>,
    pub split_exclude: Vec<Ipv4Net>,
    pub default_domain: Option<String>,
    pub banner: Option<String>,
    /// `None` when disabled
    pub keepalive: Option<Duration>,
    /// `None` when disabled
    pub dpd: Option<Duration>,
    pub master_secret: MasterSecret,
    /// Present iff the server offered a DTLS port
    pub dtls: Option<DtlsParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Negotiating = 0,
    Configuring = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Negotiating,
            1 => SessionState::Configuring,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Reliable => write!(f, "TLS"),
            Channel::Unreliable => write!(f, "DTLS"),
        }
    }
}

/// Health of one channel. `Down` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Pending = 0,
    Up = 1,
    Down = 2,
}

impl ChannelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelStatus::Pending,
            1 => ChannelStatus::Up,
            _ => ChannelStatus::Down,
        }
    }
}

/// Why a session ended. Only the first reason is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserRequested,
    ReliableFailed,
    KeepaliveFailed,
    LivenessTimeout,
    ServerDisconnect,
    DeviceFailed,
    ConfigurationFailed,
}

impl CloseReason {
    /// Whether the session ended because something went wrong
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::UserRequested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::UserRequested => "disconnect requested",
            CloseReason::ReliableFailed => "TLS channel failed",
            CloseReason::KeepaliveFailed => "keepalive failed",
            CloseReason::LivenessTimeout => "dead peer detected",
            CloseReason::ServerDisconnect => "server closed the session",
            CloseReason::DeviceFailed => "virtual interface failed",
            CloseReason::ConfigurationFailed => "network configuration failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct ChannelHealth {
    status: AtomicU8,
    /// Milliseconds since session start
    last_rx_ms: AtomicU64,
}

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    tun_name: String,
    state: AtomicU8,
    reliable: ChannelHealth,
    unreliable: ChannelHealth,
    started: Instant,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: SessionConfig, tun_name: &str) -> Self {
        Self {
            config,
            tun_name: tun_name.to_string(),
            state: AtomicU8::new(SessionState::Negotiating as u8),
            reliable: ChannelHealth::default(),
            unreliable: ChannelHealth::default(),
            started: Instant::now(),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tun_name(&self) -> &str {
        &self.tun_name
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("Session state {:?} -> {:?}", from, to);
        }
        moved
    }

    /// Negotiating -> Configuring
    pub fn begin_configuring(&self) -> bool {
        self.transition(SessionState::Negotiating, SessionState::Configuring)
    }

    /// Configuring -> Active
    pub fn activate(&self) -> bool {
        self.transition(SessionState::Configuring, SessionState::Active)
    }

    /// Move to Closing from any earlier state.
    ///
    /// Returns true only for the caller that won the transition; that caller's
    /// reason is recorded and the cancellation token fires. Later calls are
    /// no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.close_reason.set(reason);
        info!("Closing session: {}", reason);
        self.cancel.cancel();
        true
    }

    /// Closing -> Closed. True for exactly one caller, who owns teardown.
    pub fn finish_close(&self) -> bool {
        self.transition(SessionState::Closing, SessionState::Closed)
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) >= SessionState::Closing as u8
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn health(&self, channel: Channel) -> &ChannelHealth {
        match channel {
            Channel::Reliable => &self.reliable,
            Channel::Unreliable => &self.unreliable,
        }
    }

    pub fn channel_status(&self, channel: Channel) -> ChannelStatus {
        ChannelStatus::from_u8(self.health(channel).status.load(Ordering::Acquire))
    }

    /// Update a channel's status. A channel that is down stays down.
    pub fn set_channel_status(&self, channel: Channel, status: ChannelStatus) {
        let health = self.health(channel);
        let previous = health
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ChannelStatus::Down as u8).then_some(status as u8)
            });
        if let Ok(previous) = previous {
            if previous != status as u8 {
                info!("{} channel {:?}", channel, status);
            }
        }
    }

    /// Record inbound traffic on `channel`
    pub fn mark_rx(&self, channel: Channel) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.health(channel).last_rx_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last_rx(&self, channel: Channel) -> Instant {
        let ms = self.health(channel).last_rx_ms.load(Ordering::Acquire);
        self.started + Duration::from_millis(ms)
    }

    /// Most recent inbound traffic on either channel, or session start
    pub fn last_activity(&self) -> Instant {
        self.last_rx(Channel::Reliable).max(self.last_rx(Channel::Unreliable))
    }

    /// Host changes to apply for this session, and to revert on close
    pub fn network_request(&self) -> NetworkRequest {
        NetworkRequest {
            tun_name: self.tun_name.clone(),
            address: self.config.address,
            netmask: self.config.netmask,
            dns: self.config.dns.clone(),
            server: self.config.server_address,
            split_include: self.config.split_include.clone(),
            split_exclude: self.config.split_exclude.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) fn sample_config() -> SessionConfig {
        SessionConfig {
            session_token: "ABC123".to_string(),
            hostname: "vpn.example.com".to_string(),
            server_address: Ipv4Addr::new(203, 0, 113, 7),
            tls_cipher_suite: "TLS13_AES_256_GCM_SHA384".to_string(),
            mtu: 1399,
            base_mtu: 1399,
            address: Ipv4Addr::new(10, 8, 0, 5),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns: vec![Ipv4Addr::new(10, 8, 0, 1)],
            split_include: vec!["10.1.0.0/16".parse().unwrap()],
            split_exclude: vec![],
            default_domain: None,
            banner: None,
            keepalive: Some(Duration::from_secs(30)),
            dpd: Some(Duration::from_secs(30)),
            master_secret: MasterSecret::generate().unwrap(),
            dtls: None,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let session = Session::new(sample_config(), "cstp0");
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(!session.activate());

        assert!(session.begin_configuring());
        assert!(session.activate());
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.close(CloseReason::ReliableFailed));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.cancel_token().is_cancelled());

        assert!(session.finish_close());
        assert!(!session.finish_close());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let session = Session::new(sample_config(), "cstp0");
        session.begin_configuring();
        session.activate();

        assert!(session.close(CloseReason::LivenessTimeout));
        assert!(!session.close(CloseReason::UserRequested));
        assert_eq!(session.close_reason(), Some(CloseReason::LivenessTimeout));
    }

    #[test]
    fn test_concurrent_close_has_one_winner() {
        let session = Arc::new(Session::new(sample_config(), "cstp0"));
        session.begin_configuring();
        session.activate();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let session = session.clone();
                    scope.spawn(move || session.close(CloseReason::UserRequested) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_close_during_configuring() {
        let session = Session::new(sample_config(), "cstp0");
        session.begin_configuring();
        assert!(session.close(CloseReason::ConfigurationFailed));
        assert!(!session.activate());
    }

    #[test]
    fn test_channel_down_is_terminal() {
        let session = Session::new(sample_config(), "cstp0");
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Pending);

        session.set_channel_status(Channel::Unreliable, ChannelStatus::Up);
        session.set_channel_status(Channel::Unreliable, ChannelStatus::Down);
        session.set_channel_status(Channel::Unreliable, ChannelStatus::Up);
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Down);
        assert_eq!(session.channel_status(Channel::Reliable), ChannelStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_activity_tracks_either_channel() {
        let session = Session::new(sample_config(), "cstp0");
        let start = session.last_activity();

        tokio::time::advance(Duration::from_secs(5)).await;
        session.mark_rx(Channel::Unreliable);
        assert_eq!(session.last_activity(), start + Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(3)).await;
        session.mark_rx(Channel::Reliable);
        assert_eq!(session.last_activity(), start + Duration::from_secs(8));
        assert_eq!(session.last_rx(Channel::Unreliable), start + Duration::from_secs(5));
    }

    #[test]
    fn test_network_request() {
        let session = Session::new(sample_config(), "cstp0");
        let request = session.network_request();
        assert_eq!(request.tun_name, "cstp0");
        assert_eq!(request.address, Ipv4Addr::new(10, 8, 0, 5));
        assert_eq!(request.server, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(request.split_include.len(), 1);
    }
}
