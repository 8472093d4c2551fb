mod mdns;
mod player;
mod rtp;
mod sink;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;

use super::stream::StreamConfig;

pub use mdns::LogAdvertiser;
pub use player::NullPlayer;
pub use rtp::UdpRtpChannel;
pub use sink::{LogMetadataSink, WriterMetadataSink};

/// Local ports handed back to the source in the SETUP Transport header.
#[derive(Debug, Clone, Copy)]
pub struct RtpPorts {
    pub server: u16,
    pub control: u16,
    pub timing: u16,
}

/// The RTP data plane: audio, control and timing sockets plus everything
/// behind them (decrypt, decode, jitter buffer, clock recovery).
pub trait RtpChannel: Send + Sync {
    fn setup(
        &self,
        remote: SocketAddr,
        control_port: u16,
        timing_port: u16,
        active_remote: u32,
    ) -> Result<RtpPorts>;

    /// Idempotent.
    fn shutdown(&self);
}

/// The audio output backend.
pub trait Player: Send + Sync {
    fn play(&self, stream: &StreamConfig) -> Result<()>;
    fn stop(&self);
    fn flush(&self, rtptime: u32);
    /// `volume` is the raw AirPlay value in [-30, 0] dB with -144 meaning
    /// mute; mapping it to a linear scale is the player's business.
    fn volume(&self, volume: f32);
}

/// Receives metadata records; see `metadata::encode_frame` for the framing.
pub trait MetadataSink: Send + Sync {
    fn process(&self, kind: [u8; 4], code: [u8; 4], payload: &[u8]);
}

/// Announces the receiver over mDNS once the listener is bound.
pub trait Advertiser: Send + Sync {
    fn register(&self) -> Result<()>;
}

/// The collaborators every connection worker drives.
#[derive(Clone)]
pub struct Collaborators {
    pub rtp: Arc<dyn RtpChannel>,
    pub player: Arc<dyn Player>,
    pub metadata: Arc<dyn MetadataSink>,
}
