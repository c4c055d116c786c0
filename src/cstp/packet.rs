//! CSTP and DTLS packet framing
//!
//! On the TLS channel every frame starts with an 8-byte header:
//!
//! ```text
//! +-----+-----+-----+------+--------+--------+------+------+
//! | 'S' | 'T' | 'F' | 0x01 | len hi | len lo | type | 0x00 |
//! +-----+-----+-----+------+--------+--------+------+------+
//! ```
//!
//! On the DTLS channel each datagram is a single type byte followed by the
//! payload; the datagram boundary carries the length.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the CSTP frame header
pub const CSTP_HEADER_LEN: usize = 8;

const CSTP_MAGIC: [u8; 4] = [b'S', b'T', b'F', 0x01];

/// Reason byte sent with a client-initiated disconnect
const DISCONNECT_REASON_CLIENT: u8 = 0xb0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad CSTP magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("payload is not an IP packet")]
    NotIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x00,
    DpdRequest = 0x03,
    DpdResponse = 0x04,
    Disconnect = 0x05,
    Keepalive = 0x07,
    Compressed = 0x08,
    Terminate = 0x09,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::DpdRequest),
            0x04 => Ok(PacketType::DpdResponse),
            0x05 => Ok(PacketType::Disconnect),
            0x07 => Ok(PacketType::Keepalive),
            0x08 => Ok(PacketType::Compressed),
            0x09 => Ok(PacketType::Terminate),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Parsed CSTP header. The type byte is kept raw so that a frame of unknown
/// type can still be skipped by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CstpHeader {
    pub raw_type: u8,
    pub length: usize,
}

impl CstpHeader {
    pub fn parse(buf: &[u8; CSTP_HEADER_LEN]) -> Result<Self, FrameError> {
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != CSTP_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        Ok(Self {
            raw_type: buf[6],
            length: Self::declared_length(buf),
        })
    }

    /// Payload length field, read without validating the rest of the header
    pub fn declared_length(buf: &[u8; CSTP_HEADER_LEN]) -> usize {
        u16::from_be_bytes([buf[4], buf[5]]) as usize
    }

    pub fn packet_type(&self) -> Result<PacketType, FrameError> {
        PacketType::try_from(self.raw_type)
    }
}

/// A tunnel packet, independent of which channel carries it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPacket {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl TunnelPacket {
    /// Wrap an IP packet read from the interface
    pub fn data(payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Data,
            payload,
        }
    }

    pub fn keepalive() -> Self {
        Self::control(PacketType::Keepalive)
    }

    pub fn dpd_response() -> Self {
        Self::control(PacketType::DpdResponse)
    }

    pub fn disconnect() -> Self {
        Self {
            packet_type: PacketType::Disconnect,
            payload: Bytes::from_static(&[DISCONNECT_REASON_CLIENT]),
        }
    }

    fn control(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            payload: Bytes::new(),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.packet_type == PacketType::Keepalive
    }

    /// Encode with the 8-byte CSTP header for the TLS channel
    pub fn encode_cstp(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(CSTP_HEADER_LEN + self.payload.len());
        frame.put_slice(&CSTP_MAGIC);
        frame.put_u16(self.payload.len() as u16);
        frame.put_u8(self.packet_type as u8);
        frame.put_u8(0);
        frame.put_slice(&self.payload);
        frame.freeze()
    }

    /// Encode with the 1-byte type prefix for the DTLS channel
    pub fn encode_dtls(&self) -> Bytes {
        let mut datagram = BytesMut::with_capacity(1 + self.payload.len());
        datagram.put_u8(self.packet_type as u8);
        datagram.put_slice(&self.payload);
        datagram.freeze()
    }

    /// Decode a DTLS datagram
    pub fn decode_dtls(datagram: &[u8]) -> Result<Self, FrameError> {
        let (&type_byte, payload) = datagram
            .split_first()
            .ok_or(FrameError::TooShort(datagram.len()))?;
        Ok(Self {
            packet_type: PacketType::try_from(type_byte)?,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Check that a data payload looks like an IP packet before it reaches the
/// interface.
pub fn validate_ip_packet(payload: &[u8]) -> Result<(), FrameError> {
    let first = *payload.first().ok_or(FrameError::TooShort(0))?;
    let min_len = match first >> 4 {
        4 => 20,
        6 => 40,
        _ => return Err(FrameError::NotIp),
    };
    if payload.len() < min_len {
        return Err(FrameError::TooShort(payload.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(len: usize) -> Bytes {
        let mut packet = vec![0u8; len];
        packet[0] = 0x45;
        Bytes::from(packet)
    }

    #[test]
    fn test_encode_cstp_data_header() {
        let frame = TunnelPacket::data(ipv4_packet(20)).encode_cstp();
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[..8], &[b'S', b'T', b'F', 0x01, 0x00, 0x14, 0x00, 0x00]);
        assert_eq!(frame[8], 0x45);
    }

    #[test]
    fn test_encode_keepalive() {
        let frame = TunnelPacket::keepalive().encode_cstp();
        assert_eq!(&frame[..], &[b'S', b'T', b'F', 0x01, 0x00, 0x00, 0x07, 0x00]);
        assert!(TunnelPacket::keepalive().is_keepalive());
    }

    #[test]
    fn test_encode_disconnect_carries_reason() {
        let frame = TunnelPacket::disconnect().encode_cstp();
        assert_eq!(&frame[4..7], &[0x00, 0x01, 0x05]);
        assert_eq!(frame[8], 0xb0);
    }

    #[test]
    fn test_parse_header() {
        let header = CstpHeader::parse(&[b'S', b'T', b'F', 0x01, 0x05, 0xdc, 0x03, 0x00]).unwrap();
        assert_eq!(header.length, 1500);
        assert_eq!(header.packet_type().unwrap(), PacketType::DpdRequest);
    }

    #[test]
    fn test_parse_header_bad_magic() {
        let result = CstpHeader::parse(&[b'H', b'T', b'T', b'P', 0, 0, 0, 0]);
        assert!(matches!(result, Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn test_unknown_type_keeps_length() {
        let header = CstpHeader::parse(&[b'S', b'T', b'F', 0x01, 0x00, 0x04, 0x42, 0x00]).unwrap();
        assert_eq!(header.length, 4);
        assert_eq!(header.packet_type(), Err(FrameError::UnknownType(0x42)));
    }

    #[test]
    fn test_dtls_framing() {
        let packet = TunnelPacket::data(ipv4_packet(24));
        let datagram = packet.encode_dtls();
        assert_eq!(datagram[0], 0x00);
        assert_eq!(datagram.len(), 25);
        assert_eq!(TunnelPacket::decode_dtls(&datagram).unwrap(), packet);

        let dpd = TunnelPacket::decode_dtls(&[0x03]).unwrap();
        assert_eq!(dpd.packet_type, PacketType::DpdRequest);
        assert!(dpd.payload.is_empty());
    }

    #[test]
    fn test_decode_dtls_empty() {
        assert_eq!(TunnelPacket::decode_dtls(&[]), Err(FrameError::TooShort(0)));
    }

    #[test]
    fn test_validate_ip_packet() {
        assert!(validate_ip_packet(&ipv4_packet(20)).is_ok());
        assert_eq!(validate_ip_packet(&ipv4_packet(12)), Err(FrameError::TooShort(12)));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        assert!(validate_ip_packet(&v6).is_ok());

        assert_eq!(validate_ip_packet(&[0x10, 0, 0]), Err(FrameError::NotIp));
        assert_eq!(validate_ip_packet(&[]), Err(FrameError::TooShort(0)));
    }
}
