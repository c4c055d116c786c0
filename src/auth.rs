//! Cookie authentication provider
//!
//! Opens the TLS connection to the server and pairs it with a `webvpn`
//! session cookie obtained out of band (browser login, `openconnect
//! --authenticate`, ...). The resulting transport is handed to the tunnel
//! negotiator untouched.

use rustls::RootCertStore;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

/// Environment variable consulted for the session cookie
pub const COOKIE_ENV: &str = "CSTP_VPN_COOKIE";

const COOKIE_NAME: &str = "webvpn";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to resolve {0}")]
    Resolve(String),
    #[error("No IPv4 address for {0}")]
    NoIpv4(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("TLS connection failed: {0}")]
    TlsError(String),
    #[error("No session cookie provided")]
    MissingCookie,
}

/// An authenticated, TLS-terminated connection ready for negotiation
pub struct AuthenticatedTransport {
    pub stream: BufReader<TlsStream<TcpStream>>,
    pub session_token: String,
    /// Value for the `Host` header
    pub host: String,
    pub server_address: Ipv4Addr,
    pub tls_cipher_suite: String,
}

/// Strip an optional `webvpn=` prefix and surrounding whitespace.
pub fn normalize_cookie(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let value = trimmed
        .strip_prefix(COOKIE_NAME)
        .and_then(|rest| rest.strip_prefix('='))
        .unwrap_or(trimmed)
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// First cookie found on the command line, in the config file or the
/// environment; otherwise prompt without echo.
pub fn resolve_cookie(cli: Option<&str>, config: Option<&str>) -> Result<String, AuthError> {
    let env = std::env::var(COOKIE_ENV).ok();
    for candidate in [cli, config, env.as_deref()].into_iter().flatten() {
        if let Some(cookie) = normalize_cookie(candidate) {
            return Ok(cookie);
        }
    }

    let entered = rpassword::prompt_password("Session cookie (webvpn): ")?;
    normalize_cookie(&entered).ok_or(AuthError::MissingCookie)
}

/// Host header value; the port is only included when not 443
pub fn host_header(host: &str, port: u16) -> String {
    if port == 443 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, AuthError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AuthError::Resolve(format!("{}: {}", host, e)))?;
    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| AuthError::NoIpv4(host.to_string()))
}

/// Connect to `host:port` over TLS and attach `session_token`.
pub async fn connect(host: &str, port: u16, session_token: String) -> Result<AuthenticatedTransport, AuthError> {
    let addr = resolve_ipv4(host, port).await?;
    let server_address = match addr {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => return Err(AuthError::NoIpv4(host.to_string())),
    };

    debug!("Connecting to {}", addr);
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;

    let stream = tls_connect(host, tcp).await?;
    let tls_cipher_suite = stream
        .get_ref()
        .1
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_default();
    info!("TLS connected to {} ({})", addr, tls_cipher_suite);

    Ok(AuthenticatedTransport {
        stream: BufReader::new(stream),
        session_token,
        host: host_header(host, port),
        server_address,
        tls_cipher_suite,
    })
}

/// Establish TLS connection to the server
async fn tls_connect(host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>, AuthError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AuthError::TlsError(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));

    let domain = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| AuthError::TlsError(format!("Invalid domain: {}", e)))?;

    connector
        .connect(domain, tcp)
        .await
        .map_err(|e| AuthError::TlsError(e.to_string()))
}
