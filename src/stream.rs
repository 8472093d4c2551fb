use std::{io, net::SocketAddr};

use anyhow::{anyhow, bail, Result};
use log::debug;
use sdp::SessionDescription;

use super::cipher;

/// Everything the RTP data plane needs for one audio session. Assembled from
/// the ANNOUNCE SDP, completed with the Active-Remote token at SETUP, and
/// dropped on teardown.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    /// Codec parameters as sent in `a=fmtp:`, left to right.
    pub fmtp: [u32; 12],
    pub remote: SocketAddr,
    pub active_remote: u32,
    /// Playback latency in frames, selected at SETUP.
    pub latency: u32,
}

impl StreamConfig {
    pub fn from_sdp(content: &[u8], remote: SocketAddr) -> Result<Self> {
        let sdp = SessionDescription::unmarshal(&mut io::Cursor::new(content))
            .map_err(|x| anyhow!("unparseable SDP: {}", x))?;
        if sdp.media_descriptions.len() != 1 {
            bail!("expected exactly one media description");
        }
        let media = &sdp.media_descriptions[0];

        let fmtp = media
            .attribute("fmtp")
            .flatten()
            .ok_or_else(|| anyhow!("fmtp missing from announce"))?;
        let aesiv = media
            .attribute("aesiv")
            .flatten()
            .ok_or_else(|| anyhow!("aesiv missing from announce"))?;
        let rsaaeskey = media
            .attribute("rsaaeskey")
            .flatten()
            .ok_or_else(|| anyhow!("rsaaeskey missing from announce"))?;

        let aesiv = base64::decode(aesiv)?;
        if aesiv.len() != 16 {
            bail!("announced aesiv of {} bytes, wanted 16", aesiv.len());
        }
        let mut aes_iv = [0; 16];
        aes_iv.copy_from_slice(&aesiv);

        let aes_key = cipher::unwrap_session_key(&base64::decode(rsaaeskey)?)?;

        let mut values = [0u32; 12];
        for (slot, token) in values.iter_mut().zip(fmtp.split_whitespace()) {
            *slot = token.parse().map_err(|_| anyhow!("bad fmtp value {:?}", token))?;
        }
        debug!("fmtp: {:?}", values);

        Ok(Self {
            aes_key,
            aes_iv,
            fmtp: values,
            remote,
            active_remote: 0,
            latency: 0,
        })
    }
}
