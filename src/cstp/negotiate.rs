//! Tunnel negotiation
//!
//! Upgrades an authenticated TLS connection into a CSTP tunnel with an HTTP
//! `CONNECT /CSCOSSLC/tunnel` request, then turns the server's `X-CSTP-*` and
//! `X-DTLS-*` response headers into a [`SessionConfig`].

use crate::cstp::session::{DtlsParams, SessionConfig};
use ipnet::Ipv4Net;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};

pub const TUNNEL_PATH: &str = "/CSCOSSLC/tunnel";

/// MTU and base MTU requested from the server
pub const REQUESTED_MTU: u16 = 1399;

/// DTLS 1.2 cipher suites offered to the server, most preferred first
pub const DTLS12_CIPHER_SUITES: &str = "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:AES128-GCM-SHA256";

/// DTLS 1.2 wire version, stored in the first two bytes of the master secret
const DTLS12_VERSION: [u8; 2] = [0xfe, 0xfd];

pub const MASTER_SECRET_LEN: usize = 48;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 256;
const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Failed to generate DTLS master secret: {0}")]
    Randomness(String),
    #[error("Failed to send tunnel request: {0}")]
    Write(#[source] io::Error),
    #[error("Failed to read tunnel response: {0}")]
    Read(#[source] io::Error),
    #[error("Connection closed during tunnel negotiation")]
    UnexpectedEof,
    #[error("Tunnel negotiation failed: {0}")]
    Status(String),
    #[error("Malformed tunnel response: {0}")]
    Malformed(String),
    #[error("Tunnel response headers exceed {0} bytes")]
    HeadersTooLarge(usize),
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("Invalid value for {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },
}

/// 48-byte pre-master secret for the legacy DTLS session
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSecret([u8; MASTER_SECRET_LEN]);

impl MasterSecret {
    /// Version bytes followed by 46 bytes from the OS random source.
    pub fn generate() -> Result<Self, NegotiationError> {
        let mut secret = [0u8; MASTER_SECRET_LEN];
        secret[..2].copy_from_slice(&DTLS12_VERSION);
        OsRng
            .try_fill_bytes(&mut secret[2..])
            .map_err(|e| NegotiationError::Randomness(e.to_string()))?;
        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// Client identity reported in `User-Agent`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub version: String,
    pub cisco_compat: bool,
}

impl AgentIdentity {
    pub fn user_agent(&self) -> String {
        let name = if self.cisco_compat || self.name.is_empty() {
            "AnyConnect"
        } else {
            self.name.as_str()
        };
        format!("{} {} {}", name, os_arch(), self.version)
    }
}

/// "Linux_x86_64" style platform tag
fn os_arch() -> String {
    let raw = format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH);
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => raw,
    }
}

/// Inputs to a single negotiation, supplied by the auth provider and config
#[derive(Debug, Clone)]
pub struct NegotiationParams {
    /// Host name (with port when non-default) for the `Host` header
    pub host: String,
    pub server_address: Ipv4Addr,
    pub tls_cipher_suite: String,
    pub session_token: String,
    /// Pre-VPN IPv4 address of the local default interface
    pub local_ip4: Ipv4Addr,
    pub agent: AgentIdentity,
    /// Used when the server omits `X-CSTP-Keepalive`
    pub default_keepalive: Duration,
    /// Used when the server omits `X-CSTP-DPD`
    pub default_dpd: Duration,
}

/// Header set for one CONNECT request, in send order.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    headers: Vec<(&'static str, String)>,
}

impl RequestHeaders {
    pub fn new(params: &NegotiationParams, secret: &MasterSecret) -> Self {
        let local_hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let headers = vec![
            ("Host", params.host.clone()),
            ("User-Agent", params.agent.user_agent()),
            ("Content-Type", "application/xml".to_string()),
            ("Cookie", format!("webvpn={}", params.session_token)),
            ("X-CSTP-Hostname", local_hostname),
            ("X-CSTP-VPNAddress-Type", "IPv4".to_string()),
            ("X-CSTP-MTU", REQUESTED_MTU.to_string()),
            ("X-CSTP-Base-MTU", REQUESTED_MTU.to_string()),
            ("X-CSTP-Local-VPNAddress-IP4", params.local_ip4.to_string()),
            ("X-DTLS-Master-Secret", secret.to_hex()),
            ("X-DTLS12-CipherSuite", DTLS12_CIPHER_SUITES.to_string()),
        ];
        Self { headers }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize as a complete CONNECT request
    pub fn to_request(&self) -> String {
        let mut request = format!("CONNECT {} HTTP/1.1\r\n", TUNNEL_PATH);
        for (name, value) in &self.headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request
    }
}

/// Canonical form of a header key: first letter and each letter after a
/// hyphen upper-cased, the rest lower-cased ("x-cstp-dns" -> "X-Cstp-Dns").
/// Keys containing bytes that are not valid in a header token are returned
/// unchanged.
pub fn canonical_header_key(key: &str) -> String {
    let is_token = |b: u8| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b);
    if key.is_empty() || !key.bytes().all(is_token) {
        return key.to_string();
    }

    let mut upper = true;
    key.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// Response headers keyed by canonical name. Repeated headers keep every value
/// in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .push((canonical_header_key(name), value.trim().to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let key = canonical_header_key(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let key = canonical_header_key(name);
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Prefix length of a contiguous dotted netmask, `None` if the mask has holes.
pub fn mask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return None;
    }
    Some(prefix as u8)
}

/// Parse a split-tunnel entry given as `a.b.c.d/len`, `a.b.c.d/m.m.m.m` or a
/// bare address (treated as `/32`).
pub fn normalize_split_entry(entry: &str) -> Option<Ipv4Net> {
    let entry = entry.trim();
    let (addr, mask) = match entry.split_once('/') {
        Some((addr, mask)) => (addr, Some(mask)),
        None => (entry, None),
    };
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let prefix = match mask.map(str::trim) {
        None => 32,
        Some(mask) if mask.contains('.') => mask_to_prefix(mask.parse().ok()?)?,
        Some(len) => len.parse().ok()?,
    };
    Ipv4Net::new(addr, prefix).ok()
}

/// Run the CONNECT handshake over `transport`.
///
/// On success the reader is positioned at the first CSTP frame; any bytes the
/// server sent after the header block remain buffered. On failure the
/// transport has been shut down.
pub async fn negotiate<S>(
    transport: &mut BufReader<S>,
    params: &NegotiationParams,
) -> Result<SessionConfig, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = exchange(transport, params).await;
    if result.is_err() {
        let _ = transport.get_mut().shutdown().await;
    }
    result
}

async fn exchange<S>(
    transport: &mut BufReader<S>,
    params: &NegotiationParams,
) -> Result<SessionConfig, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = MasterSecret::generate()?;
    let request = RequestHeaders::new(params, &secret).to_request();

    debug!("Sending CONNECT {} to {}", TUNNEL_PATH, params.host);
    let stream = transport.get_mut();
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(NegotiationError::Write)?;
    stream.flush().await.map_err(NegotiationError::Write)?;

    let block = read_header_block(transport).await?;
    debug!("Tunnel response headers:\n{}", String::from_utf8_lossy(&block));

    let headers = parse_response(&block)?;
    let config = build_session_config(&headers, params, secret)?;
    info!(
        "Tunnel negotiated: address {}/{}, MTU {}",
        config.address,
        mask_to_prefix(config.netmask).unwrap_or(32),
        config.mtu
    );
    Ok(config)
}

/// Read up to and including the blank line that ends the header block.
async fn read_header_block<R>(reader: &mut R) -> Result<Vec<u8>, NegotiationError>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = Vec::with_capacity(1024);
    loop {
        let start = block.len();
        // One byte past the cap is enough to tell an oversized block apart
        let remaining = (MAX_HEADER_BYTES + 1 - start) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut block)
            .await
            .map_err(NegotiationError::Read)?;
        if n == 0 {
            return Err(NegotiationError::UnexpectedEof);
        }
        if block.len() > MAX_HEADER_BYTES {
            return Err(NegotiationError::HeadersTooLarge(MAX_HEADER_BYTES));
        }
        let line = &block[start..];
        if line == b"\r\n" || line == b"\n" {
            return Ok(block);
        }
    }
}

fn parse_response(block: &[u8]) -> Result<ResponseHeaders, NegotiationError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut raw_headers);

    match response.parse(block) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(NegotiationError::Malformed("incomplete header block".to_string()));
        }
        Err(e) => return Err(NegotiationError::Malformed(e.to_string())),
    }

    let code = response.code.unwrap_or(0);
    if code != 200 {
        let status = format!("{} {}", code, response.reason.unwrap_or("")).trim_end().to_string();
        return Err(NegotiationError::Status(status));
    }

    let mut headers = ResponseHeaders::default();
    for header in response.headers.iter() {
        headers.insert(header.name, &String::from_utf8_lossy(header.value));
    }
    Ok(headers)
}

fn parse_ipv4(name: &'static str, value: &str) -> Result<Ipv4Addr, NegotiationError> {
    value.parse().map_err(|_| NegotiationError::InvalidHeader {
        name,
        value: value.to_string(),
    })
}

fn parse_optional<T: std::str::FromStr>(headers: &ResponseHeaders, name: &'static str) -> Option<T> {
    let value = headers.get(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparseable {}: {}", name, value);
            None
        }
    }
}

/// Seconds header or fallback; zero disables the timer.
fn timer_interval(headers: &ResponseHeaders, name: &'static str, fallback: Duration) -> Option<Duration> {
    let interval = parse_optional::<u64>(headers, name)
        .map(Duration::from_secs)
        .unwrap_or(fallback);
    (!interval.is_zero()).then_some(interval)
}

fn split_list(headers: &ResponseHeaders, name: &'static str) -> Vec<Ipv4Net> {
    headers
        .get_all(name)
        .into_iter()
        .filter_map(|entry| {
            let parsed = normalize_split_entry(entry);
            if parsed.is_none() {
                warn!("Skipping malformed {} entry: {}", name, entry);
            }
            parsed
        })
        .collect()
}

fn build_session_config(
    headers: &ResponseHeaders,
    params: &NegotiationParams,
    master_secret: MasterSecret,
) -> Result<SessionConfig, NegotiationError> {
    let address = headers
        .get("X-CSTP-Address")
        .ok_or(NegotiationError::MissingHeader("X-CSTP-Address"))
        .and_then(|v| parse_ipv4("X-CSTP-Address", v))?;
    let netmask = match headers.get("X-CSTP-Netmask") {
        Some(v) => parse_ipv4("X-CSTP-Netmask", v)?,
        None => DEFAULT_NETMASK,
    };

    let dns = headers
        .get_all("X-CSTP-DNS")
        .into_iter()
        .filter_map(|v| match v.parse::<Ipv4Addr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!("Skipping non-IPv4 DNS server: {}", v);
                None
            }
        })
        .collect();

    let dtls = match parse_optional::<u16>(headers, "X-DTLS-Port") {
        Some(port) if port != 0 => Some(DtlsParams {
            port,
            session_id: headers.get("X-DTLS-Session-ID").unwrap_or_default().to_string(),
            cipher_suite: headers.get("X-DTLS12-CipherSuite").unwrap_or_default().to_string(),
        }),
        _ => None,
    };

    let default_domain = headers.get("X-CSTP-Default-Domain").map(str::to_string);
    if let Some(domain) = &default_domain {
        info!("Server default domain: {}", domain);
    }

    Ok(SessionConfig {
        session_token: params.session_token.clone(),
        hostname: params.host.clone(),
        server_address: params.server_address,
        tls_cipher_suite: params.tls_cipher_suite.clone(),
        mtu: parse_optional(headers, "X-CSTP-MTU").unwrap_or(REQUESTED_MTU),
        base_mtu: parse_optional(headers, "X-CSTP-Base-MTU").unwrap_or(REQUESTED_MTU),
        address,
        netmask,
        dns,
        split_include: split_list(headers, "X-CSTP-Split-Include"),
        split_exclude: split_list(headers, "X-CSTP-Split-Exclude"),
        default_domain,
        banner: headers.get("X-CSTP-Banner").map(str::to_string),
        keepalive: timer_interval(headers, "X-CSTP-Keepalive", params.default_keepalive),
        dpd: timer_interval(headers, "X-CSTP-DPD", params.default_dpd),
        master_secret,
        dtls,
    })
}
