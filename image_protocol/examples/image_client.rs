use std::time::{Duration, Instant};

use clap::Parser;
use clap_derive::Parser;
use image_protocol::{HeaderFormat, ImageProtocol, ImageProtocolConfig};
use tokio::time::sleep;
use tracing::{info, warn, Level};
use transport::TransportKind;

#[derive(Parser)]
struct Args {
    /// the server's IP address
    server: String,

    /// tcp, sctp, udp or rudp
    #[clap(long, default_value = "sctp")]
    transport: String,

    #[clap(long, default_value_t = image_protocol::config::DEFAULT_PORT)]
    port: u16,

    /// local port for the datagram transports, defaults to the server's port
    #[clap(long)]
    bind_port: Option<u16>,

    #[clap(long)]
    interface: Option<String>,

    #[clap(long, default_value_t = false)]
    unsegmented: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const HANDSHAKE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let transport: TransportKind = args.transport.parse()?;
    let mut config = ImageProtocolConfig::new(transport, args.port);
    config.client_bind_port = args.bind_port;
    config.interface = args.interface;
    if args.unsegmented {
        config.header_format = HeaderFormat::Unsegmented;
    }

    let client = ImageProtocol::client(&args.server, config).await?;

    let mut last_image: Option<Instant> = None;
    let mut last_handshake: Option<Instant> = None;
    let mut num_images = 0u64;
    loop {
        let is_idle = last_image.is_none_or(|t| t.elapsed() > HANDSHAKE_INTERVAL);
        if is_idle && last_handshake.is_none_or(|t| t.elapsed() > HANDSHAKE_INTERVAL) {
            if !client.handshake().await {
                warn!("handshake with {} failed - re-trying", args.server);
            }
            last_handshake = Some(Instant::now());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            image = client.receive_image() => match image {
                Some(image) => {
                    num_images += 1;
                    last_image = Some(Instant::now());
                    info!("image #{}: {}x{} with {} bytes, timestamp {}", num_images, image.metadata.width, image.metadata.height, image.data.len(), image.metadata.timestamp);
                }
                None => sleep(Duration::from_millis(1)).await,
            }
        }
    }

    client.shut_down().await;
    Ok(())
}
