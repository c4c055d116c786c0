//! Channel workers
//!
//! Each worker owns one transport and relays packets between it and the
//! virtual interface queues:
//!
//! - the reliable worker speaks CSTP frames over the negotiated TLS stream and
//!   is fatal to the session when it fails;
//! - the unreliable worker speaks DTLS datagrams when the server offered a
//!   DTLS port, and only ever marks itself down on failure.
//!
//! Packets read from the interface are dispatched by [`PacketRouter`], which
//! prefers DTLS while it is up and falls back to TLS otherwise.

use crate::cstp::TunnelError;
use crate::cstp::negotiate::MasterSecret;
use crate::cstp::packet::{
    CSTP_HEADER_LEN, CstpHeader, FrameError, PacketType, TunnelPacket, validate_ip_packet,
};
use crate::cstp::session::{Channel, ChannelStatus, CloseReason, DtlsParams, Session};
use crate::cstp::tun::{PacketReader, PacketWriter};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Depth of the outbound and inbound packet queues
pub const QUEUE_DEPTH: usize = 256;

/// Read buffer room beyond the MTU
const READ_HEADROOM: usize = 64;

const DISCONNECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// An established datagram channel. Methods take `&self` so receive and send
/// can run concurrently on one link.
pub trait DatagramLink: Send + Sync + 'static {
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Performs the DTLS handshake for the secondary channel
pub trait DtlsConnector: Send + Sync + 'static {
    type Link: DatagramLink;

    fn connect(
        &self,
        server: SocketAddr,
        params: &DtlsParams,
        secret: &MasterSecret,
    ) -> impl Future<Output = Result<Self::Link, TunnelError>> + Send;
}

/// What a worker should do after handling an inbound packet
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Continue,
    Reply(TunnelPacket),
    ServerClosed(PacketType),
}

/// Shared inbound handling for both channels
fn handle_inbound(
    session: &Session,
    channel: Channel,
    packet: TunnelPacket,
    to_device: &mpsc::Sender<Bytes>,
) -> Inbound {
    session.mark_rx(channel);

    match packet.packet_type {
        PacketType::Data => {
            let max = session.config().mtu as usize + READ_HEADROOM;
            let check = if packet.payload.len() > max {
                Err(FrameError::TooLarge {
                    len: packet.payload.len(),
                    max,
                })
            } else {
                validate_ip_packet(&packet.payload)
            };
            if let Err(e) = check {
                debug!("Dropping {} data packet: {}", channel, e);
                return Inbound::Continue;
            }
            match to_device.try_send(packet.payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("Interface queue full, dropping packet"),
                Err(TrySendError::Closed(_)) => debug!("Interface queue closed"),
            }
            Inbound::Continue
        }
        PacketType::DpdRequest => {
            trace!("DPD request on {}", channel);
            Inbound::Reply(TunnelPacket::dpd_response())
        }
        PacketType::DpdResponse | PacketType::Keepalive => {
            trace!("{:?} on {}", packet.packet_type, channel);
            Inbound::Continue
        }
        PacketType::Disconnect | PacketType::Terminate => {
            Inbound::ServerClosed(packet.packet_type)
        }
        PacketType::Compressed => {
            debug!("Dropping compressed packet on {}: compression not negotiated", channel);
            Inbound::Continue
        }
    }
}

/// Read one CSTP frame. Frames that fail validation are consumed by their
/// declared length and reported as `None`.
async fn read_frame<R>(reader: &mut R) -> io::Result<Option<TunnelPacket>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; CSTP_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let mut payload = vec![0u8; CstpHeader::declared_length(&header)];
    reader.read_exact(&mut payload).await?;

    match CstpHeader::parse(&header).and_then(|h| h.packet_type()) {
        Ok(packet_type) => Ok(Some(TunnelPacket {
            packet_type,
            payload: Bytes::from(payload),
        })),
        Err(e) => {
            warn!("Dropping malformed TLS frame: {}", e);
            Ok(None)
        }
    }
}

/// Relay CSTP frames over the TLS transport until cancelled or failed.
///
/// `outbound` carries everything to be written to the server; `control` is a
/// sender on that same queue used to answer DPD requests. Returns
/// [`TunnelError::Disconnected`] when the server ends the session.
pub async fn run_reliable<S>(
    transport: BufReader<S>,
    session: Arc<Session>,
    outbound: mpsc::Receiver<TunnelPacket>,
    control: mpsc::Sender<TunnelPacket>,
    to_device: mpsc::Sender<Bytes>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(transport);
    let cancel = session.cancel_token();
    session.set_channel_status(Channel::Reliable, ChannelStatus::Up);

    let outbound_loop = reliable_outbound(&mut writer, &session, outbound, cancel.clone());
    tokio::pin!(outbound_loop);

    let result = tokio::select! {
        result = reliable_inbound(&mut reader, &session, &control, &to_device, &cancel) => {
            match result {
                // Cancelled; let the writer flush its disconnect frame
                Ok(()) => outbound_loop.as_mut().await,
                Err(e) => Err(e),
            }
        }
        result = &mut outbound_loop => result,
    };

    if let Err(e) = &result {
        if !session.is_closing() {
            warn!("TLS channel failed: {}", e);
        }
        session.set_channel_status(Channel::Reliable, ChannelStatus::Down);
    }
    result
}

async fn reliable_inbound<R>(
    reader: &mut R,
    session: &Session,
    control: &mpsc::Sender<TunnelPacket>,
    to_device: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(reader) => frame?,
        };
        let Some(packet) = frame else { continue };

        match handle_inbound(session, Channel::Reliable, packet, to_device) {
            Inbound::Continue => {}
            Inbound::Reply(reply) => {
                if control.try_send(reply).is_err() {
                    debug!("TLS queue unavailable, DPD response dropped");
                }
            }
            Inbound::ServerClosed(kind) => {
                info!("Server sent {:?} on TLS channel", kind);
                return Err(TunnelError::Disconnected);
            }
        }
    }
}

async fn reliable_outbound<W>(
    writer: &mut W,
    session: &Session,
    mut outbound: mpsc::Receiver<TunnelPacket>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        writer.write_all(&packet.encode_cstp()).await?;
        writer.flush().await?;
    }

    if session.close_reason() == Some(CloseReason::UserRequested) {
        let frame = TunnelPacket::disconnect().encode_cstp();
        let sent = tokio::time::timeout(DISCONNECT_WRITE_TIMEOUT, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;
        match sent {
            Ok(Ok(())) => debug!("Sent disconnect to server"),
            _ => debug!("Could not send disconnect to server"),
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Run the DTLS channel if the session negotiated one.
///
/// Never fails the session: handshake failure, timeout or a later I/O error
/// marks the channel down and returns `Ok`. Dropping `outbound` on exit lets
/// the router fall back to TLS.
pub async fn run_unreliable<C>(
    connector: C,
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<TunnelPacket>,
    to_device: mpsc::Sender<Bytes>,
    handshake_timeout: Duration,
) -> Result<(), TunnelError>
where
    C: DtlsConnector,
{
    let Some(params) = session.config().dtls.clone() else {
        return Ok(());
    };
    let cancel = session.cancel_token();
    let server = SocketAddr::from((session.config().server_address, params.port));

    info!("Starting DTLS handshake with {}", server);
    let handshake = tokio::time::timeout(
        handshake_timeout,
        connector.connect(server, &params, &session.config().master_secret),
    );
    let link = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = handshake => match result {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("{}; continuing over TLS only", e);
                session.set_channel_status(Channel::Unreliable, ChannelStatus::Down);
                return Ok(());
            }
            Err(_) => {
                warn!(
                    "DTLS handshake timed out after {:?}; continuing over TLS only",
                    handshake_timeout
                );
                session.set_channel_status(Channel::Unreliable, ChannelStatus::Down);
                return Ok(());
            }
        },
    };
    session.set_channel_status(Channel::Unreliable, ChannelStatus::Up);

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = unreliable_inbound(&link, &session, &to_device) => result,
        result = unreliable_outbound(&link, &mut outbound) => result,
    };

    if !session.is_closing() {
        match result {
            Ok(()) => info!("DTLS channel closed; continuing over TLS only"),
            Err(e) => warn!("DTLS channel failed: {}; continuing over TLS only", e),
        }
        session.set_channel_status(Channel::Unreliable, ChannelStatus::Down);
    }
    let _ = link.close().await;
    Ok(())
}

async fn unreliable_inbound<L>(
    link: &L,
    session: &Session,
    to_device: &mpsc::Sender<Bytes>,
) -> Result<(), TunnelError>
where
    L: DatagramLink,
{
    let mut buf = vec![0u8; session.config().mtu as usize + READ_HEADROOM];
    loop {
        let n = link.recv(&mut buf).await?;
        let packet = match TunnelPacket::decode_dtls(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping DTLS datagram: {}", e);
                continue;
            }
        };

        match handle_inbound(session, Channel::Unreliable, packet, to_device) {
            Inbound::Continue => {}
            Inbound::Reply(reply) => {
                link.send(&reply.encode_dtls()).await?;
            }
            Inbound::ServerClosed(kind) => {
                info!("Server sent {:?} on DTLS channel", kind);
                return Ok(());
            }
        }
    }
}

async fn unreliable_outbound<L>(
    link: &L,
    outbound: &mut mpsc::Receiver<TunnelPacket>,
) -> Result<(), TunnelError>
where
    L: DatagramLink,
{
    while let Some(packet) = outbound.recv().await {
        link.send(&packet.encode_dtls()).await?;
    }
    Ok(())
}

/// Chooses the channel for packets read from the interface
pub struct PacketRouter {
    session: Arc<Session>,
    reliable: mpsc::Sender<TunnelPacket>,
    unreliable: Option<mpsc::Sender<TunnelPacket>>,
}

impl PacketRouter {
    pub fn new(
        session: Arc<Session>,
        reliable: mpsc::Sender<TunnelPacket>,
        unreliable: Option<mpsc::Sender<TunnelPacket>>,
    ) -> Self {
        Self {
            session,
            reliable,
            unreliable,
        }
    }

    /// Queue `packet` on DTLS when it is up, otherwise on TLS
    pub async fn dispatch(&mut self, packet: TunnelPacket) -> Result<(), TunnelError> {
        let Some(packet) = self.try_unreliable(packet) else {
            return Ok(());
        };
        self.reliable
            .send(packet)
            .await
            .map_err(|_| TunnelError::Disconnected)
    }

    /// Returns the packet back when it still needs to go over TLS
    fn try_unreliable(&mut self, packet: TunnelPacket) -> Option<TunnelPacket> {
        if self.session.channel_status(Channel::Unreliable) != ChannelStatus::Up {
            return Some(packet);
        }
        let tx = match &self.unreliable {
            Some(tx) => tx,
            None => return Some(packet),
        };
        match tx.try_send(packet) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                trace!("DTLS queue full, dropping packet");
                None
            }
            Err(TrySendError::Closed(packet)) => {
                debug!("DTLS queue closed, falling back to TLS");
                self.unreliable = None;
                Some(packet)
            }
        }
    }
}

/// Read packets from the interface and dispatch them until cancelled
pub async fn pump_from_device<R>(
    mut reader: R,
    mut router: PacketRouter,
    mtu: u16,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    R: PacketReader,
{
    let mut buf = vec![0u8; mtu as usize + READ_HEADROOM];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = reader.read_packet(&mut buf) => n?,
        };
        if n == 0 {
            continue;
        }
        router
            .dispatch(TunnelPacket::data(Bytes::copy_from_slice(&buf[..n])))
            .await?;
    }
}

/// Write packets received from the server to the interface until cancelled
pub async fn pump_to_device<W>(
    mut writer: W,
    mut inbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    W: PacketWriter,
{
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };
        writer.write_packet(&packet).await?;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cstp::session::tests::sample_config;
    use tokio::io::duplex;
    use tokio::sync::Mutex;

    pub(crate) fn ipv4_packet(len: usize) -> Bytes {
        let mut packet = vec![0u8; len];
        packet[0] = 0x45;
        Bytes::from(packet)
    }

    fn active_session(dtls: bool) -> Arc<Session> {
        let mut config = sample_config();
        if dtls {
            config.dtls = Some(DtlsParams {
                port: 443,
                session_id: "00AABB".to_string(),
                cipher_suite: "AES128-GCM-SHA256".to_string(),
            });
        }
        let session = Session::new(config, "cstp0");
        session.begin_configuring();
        session.activate();
        Arc::new(session)
    }

    /// Datagram link backed by a pair of queues
    pub(crate) struct QueueLink {
        incoming: Mutex<mpsc::Receiver<Bytes>>,
        outgoing: mpsc::Sender<Bytes>,
    }

    impl DatagramLink for QueueLink {
        async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
            self.outgoing
                .send(Bytes::copy_from_slice(datagram))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok(datagram.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.lock().await.recv().await {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone")),
            }
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) enum MockConnector {
        Fail,
        Hang,
        Link(std::sync::Mutex<Option<QueueLink>>),
    }

    pub(crate) struct LinkPeer {
        pub to_client: mpsc::Sender<Bytes>,
        pub from_client: mpsc::Receiver<Bytes>,
    }

    impl MockConnector {
        pub(crate) fn linked() -> (Self, LinkPeer) {
            let (to_client, incoming) = mpsc::channel(16);
            let (outgoing, from_client) = mpsc::channel(16);
            let link = QueueLink {
                incoming: Mutex::new(incoming),
                outgoing,
            };
            (
                MockConnector::Link(std::sync::Mutex::new(Some(link))),
                LinkPeer {
                    to_client,
                    from_client,
                },
            )
        }
    }

    impl DtlsConnector for MockConnector {
        type Link = QueueLink;

        async fn connect(
            &self,
            _server: SocketAddr,
            _params: &DtlsParams,
            _secret: &MasterSecret,
        ) -> Result<QueueLink, TunnelError> {
            match self {
                MockConnector::Fail => Err(TunnelError::DtlsHandshake("alert".to_string())),
                MockConnector::Hang => std::future::pending().await,
                MockConnector::Link(link) => link
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| TunnelError::DtlsHandshake("already used".to_string())),
            }
        }
    }

    fn cstp_frame(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![b'S', b'T', b'F', 0x01];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.push(packet_type);
        frame.push(0);
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_reliable_delivers_data_and_answers_dpd() {
        let session = active_session(false);
        let (client, mut server) = duplex(64 * 1024);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, mut dev_rx) = mpsc::channel(16);

        let worker = tokio::spawn(run_reliable(
            BufReader::new(client),
            session.clone(),
            out_rx,
            out_tx.clone(),
            dev_tx,
        ));

        let data = ipv4_packet(28);
        server.write_all(&cstp_frame(0x00, &data)).await.unwrap();
        assert_eq!(dev_rx.recv().await.unwrap(), data);

        server.write_all(&cstp_frame(0x03, &[])).await.unwrap();
        let mut reply = [0u8; 8];
        server.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[6], PacketType::DpdResponse as u8);

        assert_eq!(session.channel_status(Channel::Reliable), ChannelStatus::Up);
        session.close(CloseReason::ReliableFailed);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reliable_drops_malformed_frames() {
        let session = active_session(false);
        let (client, mut server) = duplex(64 * 1024);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, mut dev_rx) = mpsc::channel(16);

        tokio::spawn(run_reliable(
            BufReader::new(client),
            session.clone(),
            out_rx,
            out_tx,
            dev_tx,
        ));

        // Undersized data, unknown type, then a valid packet
        server.write_all(&cstp_frame(0x00, &[0x45, 0, 0])).await.unwrap();
        server.write_all(&cstp_frame(0x42, &[1, 2, 3, 4])).await.unwrap();
        let data = ipv4_packet(20);
        server.write_all(&cstp_frame(0x00, &data)).await.unwrap();

        assert_eq!(dev_rx.recv().await.unwrap(), data);
        session.close(CloseReason::UserRequested);
    }

    #[tokio::test]
    async fn test_reliable_server_disconnect() {
        let session = active_session(false);
        let (client, mut server) = duplex(64 * 1024);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        let worker = tokio::spawn(run_reliable(
            BufReader::new(client),
            session.clone(),
            out_rx,
            out_tx,
            dev_tx,
        ));

        server.write_all(&cstp_frame(0x05, &[0xb0])).await.unwrap();
        let result = worker.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Disconnected)));
        assert_eq!(session.channel_status(Channel::Reliable), ChannelStatus::Down);
    }

    #[tokio::test]
    async fn test_reliable_eof_is_error() {
        let session = active_session(false);
        let (client, server) = duplex(1024);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        let worker = tokio::spawn(run_reliable(
            BufReader::new(client),
            session.clone(),
            out_rx,
            out_tx,
            dev_tx,
        ));
        drop(server);

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(TunnelError::IoError(_))));
    }

    #[tokio::test]
    async fn test_reliable_user_disconnect_sends_frame() {
        let session = active_session(false);
        let (client, mut server) = duplex(64 * 1024);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        let worker = tokio::spawn(run_reliable(
            BufReader::new(client),
            session.clone(),
            out_rx,
            out_tx.clone(),
            dev_tx,
        ));

        out_tx.send(TunnelPacket::keepalive()).await.unwrap();
        let mut keepalive = [0u8; 8];
        server.read_exact(&mut keepalive).await.unwrap();
        assert_eq!(keepalive[6], PacketType::Keepalive as u8);

        session.close(CloseReason::UserRequested);
        worker.await.unwrap().unwrap();

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, TunnelPacket::disconnect().encode_cstp().to_vec());
    }

    #[tokio::test]
    async fn test_unreliable_handshake_failure_is_not_fatal() {
        let session = active_session(true);
        let (_tx, rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        let result = run_unreliable(
            MockConnector::Fail,
            session.clone(),
            rx,
            dev_tx,
            Duration::from_secs(10),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Down);
        assert!(!session.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_handshake_timeout() {
        let session = active_session(true);
        let (_tx, rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        run_unreliable(
            MockConnector::Hang,
            session.clone(),
            rx,
            dev_tx,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Down);
    }

    #[tokio::test]
    async fn test_unreliable_without_dtls_port_does_nothing() {
        let session = active_session(false);
        let (_tx, rx) = mpsc::channel(16);
        let (dev_tx, _dev_rx) = mpsc::channel(16);

        run_unreliable(MockConnector::Fail, session.clone(), rx, dev_tx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Pending);
    }

    #[tokio::test]
    async fn test_unreliable_relays_and_answers_dpd() {
        let session = active_session(true);
        let (connector, mut peer) = MockConnector::linked();
        let (out_tx, out_rx) = mpsc::channel(16);
        let (dev_tx, mut dev_rx) = mpsc::channel(16);

        let worker = tokio::spawn(run_unreliable(
            connector,
            session.clone(),
            out_rx,
            dev_tx,
            Duration::from_secs(10),
        ));

        let data = ipv4_packet(40);
        peer.to_client
            .send(TunnelPacket::data(data.clone()).encode_dtls())
            .await
            .unwrap();
        assert_eq!(dev_rx.recv().await.unwrap(), data);
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Up);

        peer.to_client.send(Bytes::from_static(&[0x03])).await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), Bytes::from_static(&[0x04]));

        out_tx.send(TunnelPacket::data(ipv4_packet(20))).await.unwrap();
        let sent = peer.from_client.recv().await.unwrap();
        assert_eq!(sent[0], 0x00);
        assert_eq!(sent.len(), 21);

        // Link failure marks DTLS down without closing the session
        drop(peer);
        worker.await.unwrap().unwrap();
        assert_eq!(session.channel_status(Channel::Unreliable), ChannelStatus::Down);
        assert!(!session.is_closing());
    }

    #[tokio::test]
    async fn test_router_prefers_unreliable_when_up() {
        let session = active_session(true);
        let (tls_tx, mut tls_rx) = mpsc::channel(16);
        let (dtls_tx, mut dtls_rx) = mpsc::channel(16);
        let mut router = PacketRouter::new(session.clone(), tls_tx, Some(dtls_tx));

        // Pending: TLS
        router.dispatch(TunnelPacket::data(ipv4_packet(20))).await.unwrap();
        assert!(tls_rx.try_recv().is_ok());

        session.set_channel_status(Channel::Unreliable, ChannelStatus::Up);
        router.dispatch(TunnelPacket::data(ipv4_packet(20))).await.unwrap();
        assert!(dtls_rx.try_recv().is_ok());
        assert!(tls_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_falls_back_on_closed_queue() {
        let session = active_session(true);
        let (tls_tx, mut tls_rx) = mpsc::channel(16);
        let (dtls_tx, dtls_rx) = mpsc::channel(16);
        let mut router = PacketRouter::new(session.clone(), tls_tx, Some(dtls_tx));

        session.set_channel_status(Channel::Unreliable, ChannelStatus::Up);
        drop(dtls_rx);

        let packet = TunnelPacket::data(ipv4_packet(20));
        router.dispatch(packet.clone()).await.unwrap();
        assert_eq!(tls_rx.try_recv().unwrap(), packet);
    }

    #[tokio::test]
    async fn test_pumps_move_packets() {
        use crate::cstp::tun::PacketDevice;
        use crate::cstp::tun::testing::MemoryDevice;

        let session = active_session(false);
        let (device, mut handles) = MemoryDevice::new();
        let (reader, writer) = device.split().unwrap();
        let (tls_tx, mut tls_rx) = mpsc::channel(16);
        let (dev_tx, dev_rx) = mpsc::channel(16);
        let cancel = session.cancel_token();

        let router = PacketRouter::new(session.clone(), tls_tx, None);
        tokio::spawn(pump_from_device(reader, router, 1399, cancel.clone()));
        let to_device = tokio::spawn(pump_to_device(writer, dev_rx, cancel.clone()));

        let outbound = ipv4_packet(20);
        handles.inject.send(outbound.clone()).await.unwrap();
        assert_eq!(tls_rx.recv().await.unwrap(), TunnelPacket::data(outbound));

        let inbound = ipv4_packet(24);
        dev_tx.send(inbound.clone()).await.unwrap();
        assert_eq!(handles.delivered.recv().await.unwrap(), inbound);

        cancel.cancel();
        to_device.await.unwrap().unwrap();
    }
}
