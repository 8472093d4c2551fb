use anyhow::Result;
use log::debug;

use super::Player;
use crate::stream::StreamConfig;

/// Stand-in audio output that only logs. Useful headless and under test.
pub struct NullPlayer {}

impl NullPlayer {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for NullPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for NullPlayer {
    fn play(&self, stream: &StreamConfig) -> Result<()> {
        debug!(
            "player start for {} with latency {} frames, fmtp {:?}",
            stream.remote, stream.latency, stream.fmtp
        );

        Ok(())
    }

    fn stop(&self) {
        debug!("player stop");
    }

    fn flush(&self, rtptime: u32) {
        debug!("player flush to rtptime {}", rtptime);
    }

    fn volume(&self, volume: f32) {
        debug!("player volume {}", volume);
    }
}
