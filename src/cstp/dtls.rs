//! DTLS connector for the secondary channel
//!
//! The DTLS 1.2 session is keyed from the negotiated master secret used as a
//! pre-shared key, with the server-assigned session id as the PSK identity.

use crate::cstp::TunnelError;
use crate::cstp::channel::{DatagramLink, DtlsConnector};
use crate::cstp::negotiate::MasterSecret;
use crate::cstp::session::DtlsParams;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::config::Config;
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::Conn;

const FALLBACK_PSK_IDENTITY: &[u8] = b"psk";

#[derive(Debug, Clone, Default)]
pub struct WebrtcDtlsConnector;

impl WebrtcDtlsConnector {
    pub fn new() -> Self {
        Self
    }

    fn config(params: &DtlsParams, secret: &MasterSecret) -> Config {
        let key = secret.as_bytes().to_vec();
        let identity = match hex::decode(&params.session_id) {
            Ok(id) if !id.is_empty() => id,
            _ => FALLBACK_PSK_IDENTITY.to_vec(),
        };

        Config {
            psk: Some(Arc::new(move |_hint: &[u8]| -> Result<Vec<u8>, webrtc_dtls::Error> {
                Ok(key.clone())
            })),
            psk_identity_hint: Some(identity),
            cipher_suites: vec![
                CipherSuiteId::Tls_Psk_With_Aes_128_Gcm_Sha256,
                CipherSuiteId::Tls_Psk_With_Aes_128_Ccm,
                CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8,
            ],
            ..Default::default()
        }
    }
}

impl DtlsConnector for WebrtcDtlsConnector {
    type Link = DtlsLink;

    async fn connect(
        &self,
        server: SocketAddr,
        params: &DtlsParams,
        secret: &MasterSecret,
    ) -> Result<DtlsLink, TunnelError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;
        debug!("DTLS socket {} -> {}", socket.local_addr()?, server);

        let conn = DTLSConn::new(Arc::new(socket), Self::config(params, secret), true, None)
            .await
            .map_err(|e| TunnelError::DtlsHandshake(e.to_string()))?;

        info!("DTLS channel established with {}", server);
        Ok(DtlsLink { conn })
    }
}

/// Established DTLS connection
pub struct DtlsLink {
    conn: DTLSConn,
}

fn to_io(e: impl fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

impl DatagramLink for DtlsLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.conn.send(datagram).await.map_err(to_io)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.recv(buf).await.map_err(to_io)
    }

    async fn close(&self) -> io::Result<()> {
        self.conn.close().await.map_err(to_io)
    }
}
