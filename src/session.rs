use std::{
    net::SocketAddr,
    str,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::{net::TcpStream, sync::Notify};
use tokio_util::codec::Framed;

use super::{
    auth::AuthGate,
    cipher::AppleChallenge,
    collab::Collaborators,
    config::Config,
    metadata,
    registry::{PlayerGuard, SessionGuard, SessionRegistry},
    rtsp::{Codec, Incoming, Request, Response, StatusCode},
    stream::StreamConfig,
};

/// One RTSP control connection. Requests are strictly serialised: one read,
/// one response, repeat. The worker is interrupted out of a blocked read by
/// its `wake` handle when another connection pre-empts it.
pub struct RtspSession {
    id: u32,
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    collab: Collaborators,
    apple_challenge: AppleChallenge,
    remote: SocketAddr,
    auth: AuthGate,
    wake: Arc<Notify>,
    session_guard: Option<SessionGuard>,
    player_guard: Option<PlayerGuard>,
    stream: Option<StreamConfig>,
    closing: bool,
}

impl RtspSession {
    pub async fn start(
        id: u32,
        tcp: TcpStream,
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        collab: Collaborators,
        running: Arc<AtomicBool>,
    ) {
        let (local, remote) = match (tcp.local_addr(), tcp.peer_addr()) {
            (Ok(local), Ok(remote)) => (local, remote),
            _ => {
                warn!("connection {} vanished before setup", id);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut session = Self {
            id,
            apple_challenge: AppleChallenge::new(local.ip(), config.hw_addr),
            config,
            registry,
            collab,
            remote,
            auth: AuthGate::new(),
            wake: Arc::new(Notify::new()),
            session_guard: None,
            player_guard: None,
            stream: None,
            closing: false,
        };

        if let Err(x) = session.rtsp_loop(tcp).await {
            // the peer was not speaking RTSP, or the socket died under us
            warn!("connection {}: {:#}", id, x);
        }
        session.unwind();

        running.store(false, Ordering::SeqCst);
        info!("connection {} closed", id);
    }

    async fn rtsp_loop(&mut self, tcp: TcpStream) -> Result<()> {
        let mut rtsp = Framed::new(tcp, Codec::new());

        loop {
            if self.registry.shutdown_requested() {
                debug!("connection {} shutdown requested", self.id);
                break;
            }

            let msg = tokio::select! {
                msg = rtsp.next() => match msg {
                    Some(msg) => msg?,
                    None => break, // connection closed
                },
                // pre-emption wake-up; the flag check at the loop top decides
                _ = self.wake.notified() => continue,
            };

            let req = match msg {
                Incoming::Request(req) => req,
                Incoming::OverLimit(req) => {
                    // refused, not parsed; nothing past the rejected header
                    // block can be trusted to be framed, so the connection
                    // goes with it once the refusal is on the wire
                    warn!("connection {} sent too many headers", self.id);
                    let mut res = Response::new(StatusCode::BadRequest);
                    if let Some(cseq) = req.headers.get("CSeq") {
                        res.headers.add("CSeq", cseq)?;
                    }
                    rtsp.send(res).await?;
                    break;
                }
            };

            trace!(
                "req {} {} {:?} {:?}",
                req.method,
                req.path,
                req.headers,
                str::from_utf8(&req.content).unwrap_or("<binary>")
            );

            let res = self.handle_request(&req).await;
            trace!("res {} {:?}", res.status as u32, res.headers);

            rtsp.send(res).await?;

            if self.closing {
                break;
            }
        }

        Ok(())
    }

    async fn handle_request(&mut self, request: &Request) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(x) => {
                warn!("request handling failed: {:#}", x);
                Response::new(StatusCode::BadRequest)
            }
        }
    }

    async fn dispatch(&mut self, request: &Request) -> Result<Response> {
        let mut response = Response::new(StatusCode::BadRequest);

        if let Some(challenge) = request.headers.get("Apple-Challenge") {
            match self.apple_challenge.response(challenge) {
                Ok(signature) => response.headers.add("Apple-Response", signature)?,
                Err(x) => warn!("refusing Apple-Challenge: {:#}", x),
            }
        }

        if let Some(cseq) = request.headers.get("CSeq") {
            response.headers.add("CSeq", cseq)?;
        }
        response.headers.add("Audio-Jack-Status", "connected; type=analog")?;

        if !self.auth.check(&self.config, request, &mut response)? {
            return Ok(response);
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(&mut response)?,
            "ANNOUNCE" => self.handle_announce(request, &mut response).await?,
            "SETUP" => self.handle_setup(request, &mut response).await?,
            "RECORD" => self.handle_record(&mut response)?,
            "FLUSH" => self.handle_flush(request, &mut response)?,
            "TEARDOWN" => self.handle_teardown(&mut response)?,
            "GET_PARAMETER" => response.status = StatusCode::Ok,
            "SET_PARAMETER" => self.handle_set_parameter(request, &mut response)?,
            // no handler; the response stays at the default 400
            unknown => warn!("unhandled method {}", unknown),
        }

        Ok(response)
    }

    fn handle_options(&self, response: &mut Response) -> Result<()> {
        response.status = StatusCode::Ok;
        response.headers.add(
            "Public",
            "ANNOUNCE, SETUP, RECORD, FLUSH, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER",
        )?;

        Ok(())
    }

    async fn handle_announce(&mut self, request: &Request, response: &mut Response) -> Result<()> {
        let preempt = self.config.session_timeout == 0;

        // a re-announce on this connection keeps the guard it already holds
        let taken = if self.session_guard.is_some() {
            false
        } else {
            match self.registry.acquire_session(self.id, &self.wake, preempt).await {
                Some(guard) => {
                    self.session_guard = Some(guard);
                    true
                }
                None => {
                    debug!("already playing");
                    response.status = StatusCode::NotEnoughBandwidth;
                    return Ok(());
                }
            }
        };

        match StreamConfig::from_sdp(&request.content, self.remote) {
            Ok(stream) => {
                let client = request
                    .headers
                    .get("X-Apple-Client-Name")
                    .or_else(|| request.headers.get("User-Agent"));
                if let Some(client) = client {
                    info!("play connection from {:?}", client);
                }

                self.stream = Some(stream);
                response.status = StatusCode::Ok;
            }
            Err(x) => {
                warn!("{:#}", x);
                // a failed announce leaves the lock exactly as it found it
                if taken {
                    self.registry.release_session(self.id);
                    self.session_guard = None;
                }
                response.status = StatusCode::BadRequest;
            }
        }

        Ok(())
    }

    async fn handle_setup(&mut self, request: &Request, response: &mut Response) -> Result<()> {
        if let Err(x) = self.setup_stream(request, response).await {
            warn!("error in setup request: {:#}", x);
            self.registry.release_session(self.id);
            self.session_guard = None;
            response.status = StatusCode::ParameterNotUnderstood;
        }

        Ok(())
    }

    async fn setup_stream(&mut self, request: &Request, response: &mut Response) -> Result<()> {
        let transport = request
            .headers
            .get("Transport")
            .ok_or_else(|| anyhow!("no Transport header"))?
            .to_string();
        debug!("client transport: {:?}", transport);

        let control_port = transport_field(&transport, "control_port")?;
        let timing_port = transport_field(&transport, "timing_port")?;

        let active_remote = request
            .headers
            .get("Active-Remote")
            .and_then(|x| x.trim().parse().ok())
            .unwrap_or(0);

        let latency = select_latency(&self.config, request.headers.get("User-Agent"));
        debug!("using latency of {} frames for this source", latency);

        let stream = self.stream.as_mut().ok_or_else(|| anyhow!("setup without announce"))?;
        stream.active_remote = active_remote;
        stream.latency = latency;
        let remote = stream.remote;

        if self.player_guard.is_none() {
            self.player_guard = Some(self.registry.take_player(self.id, &self.wake).await);
        }

        let ports = self.collab.rtp.setup(remote, control_port, timing_port, active_remote)?;

        let reply = format!(
            "{};server_port={};control_port={};timing_port={}",
            strip_client_ports(&transport),
            ports.server,
            ports.control,
            ports.timing
        );

        response.headers.add("Transport", reply)?;
        response.headers.add("Session", "1")?;
        response.status = StatusCode::Ok;

        Ok(())
    }

    fn handle_record(&mut self, response: &mut Response) -> Result<()> {
        if let Some(stream) = &self.stream {
            if self.player_guard.is_some() {
                self.collab.player.play(stream)?;
            }
        }

        response.status = StatusCode::Ok;
        response.headers.add("Audio-Latency", "88200")?;

        Ok(())
    }

    fn handle_flush(&mut self, request: &Request, response: &mut Response) -> Result<()> {
        let rtptime = request
            .headers
            .get("RTP-Info")
            .and_then(|info| {
                info.split(';')
                    .find_map(|x| x.trim().strip_prefix("rtptime="))
                    .and_then(|x| x.parse().ok())
            })
            .unwrap_or(0);

        if self.registry.is_playing(self.id) {
            self.collab.player.flush(rtptime);
        }
        response.status = StatusCode::Ok;

        Ok(())
    }

    fn handle_teardown(&mut self, response: &mut Response) -> Result<()> {
        response.status = StatusCode::Ok;
        response.headers.add("Connection", "close")?;

        if self.registry.is_playing(self.id) {
            self.registry.request_shutdown();
        }
        self.closing = true;

        Ok(())
    }

    fn handle_set_parameter(&mut self, request: &Request, response: &mut Response) -> Result<()> {
        match request.headers.get("Content-Type") {
            Some(x) if x.starts_with("application/x-dmap-tagged") => {
                metadata::process_dmap(self.collab.metadata.as_ref(), &request.content);
            }
            // the image subtype is unreliable; the first payload bytes tell
            // the consumer what it got
            Some(x) if x.starts_with("image") => {
                metadata::process_cover_art(self.collab.metadata.as_ref(), &request.content);
            }
            Some(x) if x.starts_with("text/parameters") => {
                self.handle_text_parameters(&request.content);
            }
            Some(x) => debug!("unknown SET_PARAMETER Content-Type {:?}", x),
            None => debug!("missing Content-Type in SET_PARAMETER"),
        }
        response.status = StatusCode::Ok;

        Ok(())
    }

    fn handle_text_parameters(&self, content: &[u8]) {
        let text = String::from_utf8_lossy(content);

        for line in text.split(['\r', '\n']) {
            if let Some(volume) = line.strip_prefix("volume: ") {
                match volume.trim().parse::<f32>() {
                    Ok(volume) => {
                        debug!("volume: {}", volume);
                        self.collab.player.volume(volume);
                    }
                    Err(_) => warn!("bad volume value {:?}", volume),
                }
            } else if let Some(progress) = line.strip_prefix("progress: ") {
                debug!("progress: {:?}", progress);
            } else if !line.is_empty() {
                debug!("unrecognised parameter: {:?}", line);
            }
        }
    }

    // Releases everything this worker may hold. The flag clear must precede
    // the guard drops: a pre-empting worker resumes the moment a lock frees
    // up and must not observe its own shutdown request.
    fn unwind(&mut self) {
        let owner = self.player_guard.is_some();
        if owner {
            self.collab.rtp.shutdown();
            self.collab.player.stop();
        }

        if owner || self.session_guard.is_some() {
            self.registry.clear_shutdown();
        }

        if let Some(guard) = self.session_guard.take() {
            self.registry.release_session(self.id);
            drop(guard);
        }
        if let Some(guard) = self.player_guard.take() {
            self.registry.release_player(self.id);
            drop(guard);
        }

        self.stream = None;
    }
}

// iTunes 10 and later, AirPlay and forked-daapd each get their own
// configured latency; an explicit override beats them all. The selection
// feeds the data plane, not the Audio-Latency header.
fn select_latency(config: &Config, user_agent: Option<&str>) -> u32 {
    if let Some(latency) = config.user_latency {
        return latency;
    }

    let user_agent = match user_agent {
        Some(user_agent) => user_agent,
        None => {
            debug!("no User-Agent in SETUP");
            return config.default_latency;
        }
    };

    if let Some(rest) = user_agent.strip_prefix("iTunes") {
        let version: u32 = rest
            .strip_prefix('/')
            .and_then(|x| x.split('.').next())
            .and_then(|x| x.parse().ok())
            .unwrap_or(0);
        if version >= 10 {
            return config.itunes_latency;
        }
    } else if user_agent.starts_with("AirPlay") {
        return config.airplay_latency;
    } else if user_agent.starts_with("forked-daapd") {
        return config.forked_daapd_latency;
    }

    config.default_latency
}

fn transport_field(transport: &str, name: &str) -> Result<u16> {
    transport
        .split(';')
        .find_map(|x| x.trim().strip_prefix(name)?.strip_prefix('='))
        .ok_or_else(|| anyhow!("{} missing from transport", name))?
        .parse()
        .map_err(|_| anyhow!("bad {} in transport", name))
}

// drop the client port entries; the remaining fields are echoed back
fn strip_client_ports(transport: &str) -> String {
    transport
        .split(';')
        .filter(|x| {
            let x = x.trim();
            !x.starts_with("control_port=") && !x.starts_with("timing_port=")
        })
        .collect::<Vec<_>>()
        .join(";")
}
