//! Virtual network interface
//!
//! The relay tasks only see [`PacketReader`] / [`PacketWriter`], so they can run
//! against the kernel TUN device or an in-memory stand-in.

use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

#[derive(Error, Debug)]
pub enum TunError {
    #[error("Failed to create TUN device: {0}")]
    CreateFailed(String),
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read side of a packet device. One IP packet per read.
pub trait PacketReader: Send + 'static {
    fn read_packet(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Write side of a packet device. One IP packet per write.
pub trait PacketWriter: Send + 'static {
    fn write_packet(&mut self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// A device that can be split into independent read and write halves
pub trait PacketDevice: Send + 'static {
    type Reader: PacketReader;
    type Writer: PacketWriter;

    fn name(&self) -> &str;

    fn split(self) -> Result<(Self::Reader, Self::Writer), TunError>;
}

/// Kernel TUN device
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create `name` with the negotiated MTU. Addressing is applied afterwards
    /// by the network configurator.
    pub fn create(name: &str, mtu: u16) -> Result<Self, TunError> {
        let mut config = Configuration::default();
        config.tun_name(name).mtu(mtu).up();

        #[cfg(target_os = "linux")]
        config.platform_config(|platform| {
            platform.ensure_root_privileges(true);
        });

        let device =
            tun::create_as_async(&config).map_err(|e| TunError::CreateFailed(e.to_string()))?;
        let name = device
            .tun_name()
            .map_err(|e| TunError::CreateFailed(e.to_string()))?;

        info!("Created TUN device {} (MTU {})", name, mtu);
        Ok(Self { device, name })
    }
}

impl PacketDevice for TunDevice {
    type Reader = TunReader;
    type Writer = TunWriter;

    fn name(&self) -> &str {
        &self.name
    }

    fn split(self) -> Result<(TunReader, TunWriter), TunError> {
        // tun returns (writer, reader)
        let (writer, reader) = self.device.split()?;
        Ok((TunReader { reader }, TunWriter { writer }))
    }
}

pub struct TunReader {
    reader: DeviceReader,
}

impl PacketReader for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }
}

pub struct TunWriter {
    writer: DeviceWriter,
}

impl PacketWriter for TunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.writer.write_all(packet).await
    }
}
