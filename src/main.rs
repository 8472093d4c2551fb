use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::debug;
use mac_address::get_mac_address;

use raopd::{
    collab::{Collaborators, LogAdvertiser, LogMetadataSink, NullPlayer, UdpRtpChannel},
    config::Config,
    listener,
    registry::SessionRegistry,
};

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, default_value = "raopd")]
    name: String,
    #[clap(long, default_value_t = 5000)]
    port: u16,
    /// Protect the receiver with RTSP digest authentication.
    #[clap(long)]
    password: Option<String>,
    /// Session timeout in seconds; 0 lets a new source pre-empt the current one.
    #[clap(long, default_value_t = 120)]
    timeout: u32,
    /// Latency override in frames, applied regardless of the source type.
    #[clap(long)]
    latency: Option<u32>,
    #[clap(long, default_value_t = 99400)]
    itunes_latency: u32,
    #[clap(long, default_value_t = 88200)]
    airplay_latency: u32,
    #[clap(long, default_value_t = 99400)]
    forked_daapd_latency: u32,
    #[clap(long, default_value_t = 88200)]
    default_latency: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    debug!("{:?}", args);

    let hw_addr = get_mac_address()?.map(|x| x.bytes()).unwrap_or_default();
    debug!("hardware address: {:02X?}", hw_addr);

    let config = Arc::new(Config {
        name: args.name,
        port: args.port,
        password: args.password,
        hw_addr,
        session_timeout: args.timeout,
        itunes_latency: args.itunes_latency,
        airplay_latency: args.airplay_latency,
        forked_daapd_latency: args.forked_daapd_latency,
        default_latency: args.default_latency,
        user_latency: args.latency,
    });

    let registry = Arc::new(SessionRegistry::new());
    let collab = Collaborators {
        rtp: Arc::new(UdpRtpChannel::new()),
        player: Arc::new(NullPlayer::new()),
        metadata: Arc::new(LogMetadataSink::new()),
    };
    let advertiser = Arc::new(LogAdvertiser::new(&config));

    listener::serve(config, registry, collab, advertiser).await
}
