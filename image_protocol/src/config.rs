use std::time::Duration;

use anyhow::bail;
use transport::TransportKind;

use crate::header::{HeaderFormat, ImageMetadata};

pub const DEFAULT_PORT: u16 = 50668;

#[derive(Clone, Debug)]
pub struct ImageProtocolConfig {
    pub transport: TransportKind,

    /// The port the server listens on. Port 0 is an ephemeral port, see
    ///  [`crate::ImageProtocol::local_addr`].
    pub port: u16,

    /// For the datagram transports, the local port a client binds to. `None` binds to `port` so
    ///  that the client receives broadcasts sent to that port.
    pub client_bind_port: Option<u16>,

    pub interface: Option<String>,

    /// maximum size of a segment's body (i.e. excluding the packet header)
    pub max_segment_size: usize,

    pub header_format: HeaderFormat,

    /// Upper bound for a single received packet. Bigger packets are truncated on datagram
    ///  transports, and close the connection on stream transports.
    pub max_receive_size: usize,

    /// partially received images are discarded if they are not complete after this time
    pub partial_message_timeout: Duration,

    /// maximum number of partially received images per peer
    pub max_partial_messages: usize,
}

impl ImageProtocolConfig {
    pub fn new(transport: TransportKind, port: u16) -> ImageProtocolConfig {
        ImageProtocolConfig {
            transport,
            port,
            client_bind_port: None,
            interface: None,
            max_segment_size: 1024,
            header_format: HeaderFormat::Segmented,
            max_receive_size: 2 * 1024 * 1024,
            partial_message_timeout: Duration::from_secs(10),
            max_partial_messages: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_segment_size < ImageMetadata::SERIALIZED_LEN {
            bail!("max segment size {} is too small to hold image metadata", self.max_segment_size);
        }
        if self.max_receive_size < self.header_format.serialized_len() + self.max_segment_size {
            bail!("max receive size {} is too small for a full segment", self.max_receive_size);
        }
        if self.max_partial_messages == 0 {
            bail!("max partial messages must not be zero");
        }
        Ok(())
    }
}

impl Default for ImageProtocolConfig {
    fn default() -> Self {
        ImageProtocolConfig::new(TransportKind::Sctp, DEFAULT_PORT)
    }
}
