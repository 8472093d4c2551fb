use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::Mutex,
};

use anyhow::Result;
use log::debug;

use super::{RtpChannel, RtpPorts};

/// Binds the audio, control and timing sockets on ephemeral ports. The data
/// pumps behind them live outside the control plane; holding the sockets
/// here keeps the advertised ports reserved until teardown.
pub struct UdpRtpChannel {
    sockets: Mutex<Option<[UdpSocket; 3]>>,
}

impl UdpRtpChannel {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(None),
        }
    }
}

impl Default for UdpRtpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpChannel for UdpRtpChannel {
    fn setup(
        &self,
        remote: SocketAddr,
        control_port: u16,
        timing_port: u16,
        active_remote: u32,
    ) -> Result<RtpPorts> {
        debug!(
            "rtp setup for {}: control_port={} timing_port={} active_remote={}",
            remote, control_port, timing_port, active_remote
        );

        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let server = UdpSocket::bind(any)?;
        let control = UdpSocket::bind(any)?;
        let timing = UdpSocket::bind(any)?;

        let ports = RtpPorts {
            server: server.local_addr()?.port(),
            control: control.local_addr()?.port(),
            timing: timing.local_addr()?.port(),
        };

        *self.sockets.lock().unwrap() = Some([server, control, timing]);

        Ok(ports)
    }

    fn shutdown(&self) {
        if self.sockets.lock().unwrap().take().is_some() {
            debug!("rtp shutdown");
        }
    }
}
