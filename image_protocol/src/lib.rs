//! Segmented image transfer from a server to its clients, on top of any of the `transport`
//!  crate's transports.
//!
//! Every packet starts with a fixed header (see [`header::PacketHeader`]). An image is sent as
//!  a *message*: its metadata followed by the raw image data, cut into segments that share a
//!  message index. The receiver collects segments per message index until all of them are
//!  there, regardless of the order in which they arrive.
//!
//! ```ascii
//! segment 0:   [header][metadata (14 bytes)][image data ...]
//! segment 1:   [header][image data ...]
//! ...
//! segment n-1: [header][image data (remainder)]
//! ```
//!
//! Clients announce themselves with a header-only HANDSHAKE packet. A server treats every peer
//!  it knows about as a client, so for datagram transports the handshake is what makes a client
//!  known to the server.

pub mod config;
pub mod framing;
pub mod header;
pub mod image_protocol;
pub mod segmentation;

pub use config::ImageProtocolConfig;
pub use header::{HeaderFormat, ImageMetadata, PacketHeader, PacketType};
pub use image_protocol::ImageProtocol;
pub use segmentation::Image;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
