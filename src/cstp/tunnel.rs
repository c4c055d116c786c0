//! Tunnel lifecycle
//!
//! [`Tunnel::establish`] takes an authenticated TLS transport through
//! negotiation, interface and route setup, and starts the session tasks.
//! [`Tunnel::run`] then waits for the session to close and reverts the host
//! network changes exactly once.

use crate::cstp::TunnelError;
use crate::cstp::channel::{
    DtlsConnector, PacketRouter, QUEUE_DEPTH, pump_from_device, pump_to_device, run_reliable,
    run_unreliable,
};
use crate::cstp::negotiate::{NegotiationParams, mask_to_prefix, negotiate};
use crate::cstp::session::{Channel, ChannelStatus, CloseReason, Session, SessionState};
use crate::cstp::supervisor::{Supervisor, TaskKind, dead_peer_watchdog, keepalive_timer};
use crate::cstp::tun::{PacketDevice, TunError};
use crate::vpn::{NetworkConfigurator, NetworkRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Session behavior not negotiated with the server
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Dead peer deadline as a multiple of the DPD interval
    pub dead_peer_factor: u32,
    pub enable_dtls: bool,
    pub dtls_handshake_timeout: Duration,
    /// How long tasks get to stop after the session closes
    pub shutdown_grace: Duration,
    /// Cancelled to abandon negotiation. Once the host is configured the
    /// caller disconnects through [`TunnelHandle`] instead.
    pub interrupt: CancellationToken,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            dead_peer_factor: 3,
            enable_dtls: true,
            dtls_handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
            interrupt: CancellationToken::new(),
        }
    }
}

/// Cloneable handle for observing and closing a running tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    session: Arc<Session>,
}

impl TunnelHandle {
    /// Request a user disconnect. Returns false if the session was already
    /// closing.
    pub fn disconnect(&self) -> bool {
        self.session.close(CloseReason::UserRequested)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

pub struct Tunnel {
    session: Arc<Session>,
    supervisor: Supervisor,
    network: Arc<dyn NetworkConfigurator>,
    request: NetworkRequest,
    shutdown_grace: Duration,
}

impl Tunnel {
    /// Negotiate, configure the host and start the session tasks.
    ///
    /// `open_device` is called with the negotiated MTU. On any error the
    /// transport is closed, whatever was applied to the host is reverted and
    /// no session is left behind.
    pub async fn establish<S, D, C>(
        mut transport: BufReader<S>,
        params: &NegotiationParams,
        open_device: impl FnOnce(u16) -> Result<D, TunError>,
        network: Arc<dyn NetworkConfigurator>,
        connector: C,
        options: &TunnelOptions,
    ) -> Result<Self, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        D: PacketDevice,
        C: DtlsConnector,
    {
        let negotiated = tokio::select! {
            result = negotiate(&mut transport, params) => Some(result),
            _ = options.interrupt.cancelled() => None,
        };
        let Some(negotiated) = negotiated else {
            info!("Interrupted during negotiation");
            let _ = transport.get_mut().shutdown().await;
            return Err(TunnelError::Interrupted);
        };
        let config = negotiated?;
        if let Some(banner) = &config.banner {
            info!("Server banner: {}", banner);
        }

        let device = match open_device(config.mtu) {
            Ok(device) => device,
            Err(e) => {
                let _ = transport.get_mut().shutdown().await;
                return Err(e.into());
            }
        };
        let session = Arc::new(Session::new(config, device.name()));
        session.begin_configuring();

        let request = session.network_request();
        let configured = device
            .split()
            .map_err(TunnelError::from)
            .and_then(|halves| {
                request.apply(network.as_ref())?;
                Ok(halves)
            });
        let (reader, writer) = match configured {
            Ok(halves) => halves,
            Err(e) => {
                session.close(CloseReason::ConfigurationFailed);
                let _ = transport.get_mut().shutdown().await;
                drop(transport);
                request.revert(network.as_ref());
                session.finish_close();
                return Err(e);
            }
        };

        let config = session.config();
        let cancel = session.cancel_token();
        let mut supervisor = Supervisor::new(session.clone());
        let (tls_tx, tls_rx) = mpsc::channel(QUEUE_DEPTH);
        let (device_tx, device_rx) = mpsc::channel(QUEUE_DEPTH);

        supervisor.spawn(
            TaskKind::Reliable,
            run_reliable(transport, session.clone(), tls_rx, tls_tx.clone(), device_tx.clone()),
        );

        let dtls_tx = match &config.dtls {
            Some(_) if options.enable_dtls => {
                let (dtls_tx, dtls_rx) = mpsc::channel(QUEUE_DEPTH);
                supervisor.spawn(
                    TaskKind::Unreliable,
                    run_unreliable(
                        connector,
                        session.clone(),
                        dtls_rx,
                        device_tx,
                        options.dtls_handshake_timeout,
                    ),
                );
                Some(dtls_tx)
            }
            Some(offered) => {
                info!("DTLS disabled; ignoring offered port {}", offered.port);
                session.set_channel_status(Channel::Unreliable, ChannelStatus::Down);
                None
            }
            None => None,
        };

        let router = PacketRouter::new(session.clone(), tls_tx.clone(), dtls_tx);
        supervisor.spawn(
            TaskKind::DeviceReader,
            pump_from_device(reader, router, config.mtu, cancel.clone()),
        );
        supervisor.spawn(TaskKind::DeviceWriter, pump_to_device(writer, device_rx, cancel));

        if let Some(period) = config.keepalive {
            supervisor.spawn(TaskKind::Keepalive, keepalive_timer(session.clone(), tls_tx, period));
        }
        if let Some(dpd) = config.dpd {
            let deadline = dpd * options.dead_peer_factor.max(1);
            supervisor.spawn(TaskKind::DeadPeer, dead_peer_watchdog(session.clone(), deadline));
        }

        if !session.activate() {
            warn!("Session closed during setup");
        }
        info!(
            "Tunnel up on {}: {}/{} via {}",
            session.tun_name(),
            config.address,
            mask_to_prefix(config.netmask).unwrap_or(32),
            config.server_address
        );

        Ok(Self {
            session,
            supervisor,
            network,
            request,
            shutdown_grace: options.shutdown_grace,
        })
    }

    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            session: self.session.clone(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Host changes applied for this session
    pub fn network_request(&self) -> &NetworkRequest {
        &self.request
    }

    /// Run until the session closes, then stop the tasks and revert the host
    /// network configuration. Returns why the session ended.
    pub async fn run(self) -> CloseReason {
        let Self {
            session,
            mut supervisor,
            network,
            request,
            shutdown_grace,
        } = self;

        supervisor.watch().await;
        supervisor.shutdown(shutdown_grace).await;

        if session.finish_close() {
            request.revert(network.as_ref());
        }

        let reason = session.close_reason().unwrap_or(CloseReason::ReliableFailed);
        info!("Session closed: {}", reason);
        reason
    }
}
