use std::time::{Duration, SystemTime};

use clap::Parser;
use clap_derive::Parser;
use image_protocol::{HeaderFormat, ImageMetadata, ImageProtocol, ImageProtocolConfig};
use tokio::time::interval;
use tracing::{info, Level};
use transport::TransportKind;

#[derive(Parser)]
struct Args {
    /// tcp, sctp, udp or rudp
    #[clap(long, default_value = "sctp")]
    transport: String,

    #[clap(long, default_value_t = image_protocol::config::DEFAULT_PORT)]
    port: u16,

    #[clap(long)]
    interface: Option<String>,

    #[clap(long, default_value_t = 320)]
    width: u16,

    #[clap(long, default_value_t = 240)]
    height: u16,

    #[clap(long, default_value_t = 100)]
    interval_millis: u64,

    #[clap(long, default_value_t = false)]
    unsegmented: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn test_pattern(width: u16, height: u16, frame: u64) -> Vec<u8> {
    let width = usize::from(width);
    (0..width * usize::from(height))
        .map(|i| ((i % width) as u64 + (i / width) as u64 + frame) as u8)
        .collect()
}

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
    config.interface = args.interface;
    if args.unsegmented {
        config.header_format = HeaderFormat::Unsegmented;
    }

    let server = ImageProtocol::server(config).await?;

    let mut ticks = interval(Duration::from_millis(args.interval_millis));
    let mut frame = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticks.tick() => {}
        }

        let num_handshakes = server.server_receive().await;
        if num_handshakes > 0 {
            info!("{} client(s) announced themselves", num_handshakes);
        }

        let metadata = ImageMetadata {
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)?
                .as_millis() as u64,
            width: args.width,
            height: args.height,
            encoding: 0,
            identifier: 1,
        };
        let num_served = server.send_image(&metadata, &test_pattern(args.width, args.height, frame)).await;
        if num_served > 0 && frame % 10 == 0 {
            info!("sent frame {} to {} client(s)", frame, num_served);
        }
        frame += 1;
    }

    server.shut_down().await;
    Ok(())
}
