use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rsa::{PaddingScheme, PublicKey};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

use raopd::{
    cipher::KEY,
    collab::{Collaborators, LogMetadataSink, NullPlayer, UdpRtpChannel},
    config::Config,
    registry::SessionRegistry,
    session::RtspSession,
};

const AES_KEY: [u8; 16] = [0x11; 16];
const AES_IV: [u8; 16] = [0x22; 16];
const FMTP: &str = "96 352 0 16 40 10 14 2 255 0 0 44100";
const TRANSPORT: &str = "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port=6001;timing_port=6002";

fn test_config(password: Option<&str>, session_timeout: u32) -> Config {
    Config {
        name: "raopd".into(),
        port: 0,
        password: password.map(|x| x.into()),
        hw_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        session_timeout,
        itunes_latency: 99400,
        airplay_latency: 88200,
        forked_daapd_latency: 99400,
        default_latency: 88200,
        user_latency: None,
    }
}

async fn spawn_receiver(config: Config) -> Result<(SocketAddr, Arc<SessionRegistry>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let config = Arc::new(config);
    let registry = Arc::new(SessionRegistry::new());
    let collab = Collaborators {
        rtp: Arc::new(UdpRtpChannel::new()),
        player: Arc::new(NullPlayer::new()),
        metadata: Arc::new(LogMetadataSink::new()),
    };

    let accept_registry = registry.clone();
    tokio::spawn(async move {
        let mut id = 1;
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(RtspSession::start(
                id,
                tcp,
                config.clone(),
                accept_registry.clone(),
                collab.clone(),
                Arc::new(AtomicBool::new(true)),
            ));
            id += 1;
        }
    });

    Ok((addr, registry))
}

fn sdp_body(fmtp: Option<&str>) -> Vec<u8> {
    let wrapped = KEY
        .to_public_key()
        .encrypt(&mut OsRng, PaddingScheme::new_oaep::<sha1::Sha1>(), &AES_KEY)
        .unwrap();

    let mut body = String::new();
    body.push_str("v=0\r\n");
    body.push_str("o=iTunes 3413821438 0 IN IP4 192.168.1.2\r\n");
    body.push_str("s=iTunes\r\n");
    body.push_str("c=IN IP4 192.168.1.3\r\n");
    body.push_str("t=0 0\r\n");
    body.push_str("m=audio 0 RTP/AVP 96\r\n");
    body.push_str("a=rtpmap:96 AppleLossless\r\n");
    if let Some(fmtp) = fmtp {
        body.push_str(&format!("a=fmtp:{}\r\n", fmtp));
    }
    body.push_str(&format!("a=rsaaeskey:{}\r\n", base64::encode(wrapped)));
    body.push_str(&format!("a=aesiv:{}\r\n", base64::encode(AES_IV)));

    body.into_bytes()
}

struct ClientResponse {
    status: u32,
    headers: HashMap<String, String>,
}

impl ClientResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

struct Client {
    tcp: TcpStream,
    cseq: u32,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            tcp: TcpStream::connect(addr).await?,
            cseq: 0,
        })
    }

    async fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.tcp.write_all(raw).await?;

        Ok(())
    }

    async fn request(
        &mut self,
        method: &str,
        headers: &[(&str, &str)],
        content: &[u8],
    ) -> Result<ClientResponse> {
        self.cseq += 1;

        let mut raw = format!("{} rtsp://192.168.1.10/1 RTSP/1.0\r\nCSeq: {}\r\n", method, self.cseq);
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !content.is_empty() {
            raw.push_str(&format!("Content-Length: {}\r\n", content.len()));
        }
        raw.push_str("\r\n");

        let mut raw = raw.into_bytes();
        raw.extend_from_slice(content);
        self.tcp.write_all(&raw).await?;

        self.read_response()
            .await?
            .ok_or_else(|| anyhow!("connection closed"))
    }

    async fn read_response(&mut self) -> Result<Option<ClientResponse>> {
        let mut buf = Vec::new();

        let head = loop {
            if let Some(end) = buf.windows(4).position(|x| x == b"\r\n\r\n") {
                break &buf[..end];
            }

            let mut chunk = [0u8; 1024];
            let n = self.tcp.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = std::str::from_utf8(head)?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
        let status = status_line
            .strip_prefix("RTSP/1.0 ")
            .and_then(|x| x.split(' ').next())
            .ok_or_else(|| anyhow!("bad status line {:?}", status_line))?
            .parse()?;

        let mut headers = HashMap::new();
        for line in lines {
            let (name, value) = line.split_once(": ").ok_or_else(|| anyhow!("bad header {:?}", line))?;
            headers.insert(name.to_string(), value.to_string());
        }

        Ok(Some(ClientResponse { status, headers }))
    }
}

fn hex_upper(digest: md5::Digest) -> String {
    digest.0.iter().map(|x| format!("{:02X}", x)).collect()
}

fn quoted_field<'a>(haystack: &'a str, name: &str) -> Option<&'a str> {
    let start = haystack.find(&format!("{}=\"", name))? + name.len() + 2;
    let rest = &haystack[start..];

    Some(&rest[..rest.find('"')?])
}

#[tokio::test]
async fn happy_path() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    let challenge = base64::encode([0x5au8; 16]);
    let res = client
        .request("OPTIONS", &[("Apple-Challenge", challenge.as_str())], b"")
        .await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("CSeq"), Some("1"));
    assert_eq!(res.header("Audio-Jack-Status"), Some("connected; type=analog"));
    assert_eq!(
        res.header("Public"),
        Some("ANNOUNCE, SETUP, RECORD, FLUSH, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER")
    );

    // the challenge response is an unpadded base64 RSA block
    let apple_response = res.header("Apple-Response").ok_or_else(|| anyhow!("no Apple-Response"))?;
    assert!(!apple_response.contains('='));
    let padding = (4 - apple_response.len() % 4) % 4;
    let signature = base64::decode(format!("{}{}", apple_response, "=".repeat(padding)))?;
    assert_eq!(signature.len(), 256);

    let res = client
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);

    let res = client
        .request("SETUP", &[("Transport", TRANSPORT), ("Active-Remote", "1992458531")], b"")
        .await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Session"), Some("1"));
    let transport = res.header("Transport").ok_or_else(|| anyhow!("no Transport"))?;
    assert!(transport.starts_with("RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;server_port="));
    assert!(transport.contains(";control_port="));
    assert!(transport.contains(";timing_port="));
    assert!(!transport.contains("control_port=6001"));
    assert!(!transport.contains("timing_port=6002"));

    let res = client.request("RECORD", &[], b"").await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Audio-Latency"), Some("88200"));

    let res = client
        .request("FLUSH", &[("RTP-Info", "seq=1000;rtptime=162210016")], b"")
        .await?;
    assert_eq!(res.status, 200);

    let res = client.request("TEARDOWN", &[], b"").await?;
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Connection"), Some("close"));

    // the receiver hangs up after the teardown response
    let eof = timeout(Duration::from_secs(5), client.read_response()).await??;
    assert!(eof.is_none());

    Ok(())
}

#[tokio::test]
async fn a_second_source_is_refused_while_one_is_announced() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;

    let mut first = Client::connect(addr).await?;
    let res = first
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);

    let mut second = Client::connect(addr).await?;
    let res = second
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 453);

    Ok(())
}

#[tokio::test]
async fn a_new_source_preempts_the_playing_one() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 0)).await?;

    let mut first = Client::connect(addr).await?;
    let res = first
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);
    let res = first.request("SETUP", &[("Transport", TRANSPORT)], b"").await?;
    assert_eq!(res.status, 200);
    let res = first.request("RECORD", &[], b"").await?;
    assert_eq!(res.status, 200);

    // the second source completes its announce while the first is parked in
    // a read
    let mut second = Client::connect(addr).await?;
    let res = timeout(
        Duration::from_secs(5),
        second.request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP))),
    )
    .await??;
    assert_eq!(res.status, 200);

    // and the evicted connection is closed under the first client
    let eof = timeout(Duration::from_secs(5), first.read_response()).await??;
    assert!(eof.is_none());

    // the new holder can set up and play
    let res = second.request("SETUP", &[("Transport", TRANSPORT)], b"").await?;
    assert_eq!(res.status, 200);

    Ok(())
}

#[tokio::test]
async fn digest_auth_gates_the_connection() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(Some("secret"), 120)).await?;
    let mut client = Client::connect(addr).await?;

    let res = client.request("OPTIONS", &[], b"").await?;
    assert_eq!(res.status, 401);
    let challenge = res.header("WWW-Authenticate").ok_or_else(|| anyhow!("no challenge"))?;
    assert!(challenge.starts_with("Digest realm=\"taco\", nonce=\""));
    let nonce = quoted_field(challenge, "nonce")
        .ok_or_else(|| anyhow!("no nonce"))?
        .to_string();

    // RFC 2617 digest over the issued nonce
    let uri = "rtsp://192.168.1.10/1";
    let ha1 = hex_upper(md5::compute("user:taco:secret"));
    let ha2 = hex_upper(md5::compute(format!("OPTIONS:{}", uri)));
    let digest = hex_upper(md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)));

    let authorization = format!(
        "Digest username=\"user\", realm=\"taco\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        nonce, uri, digest
    );
    let res = client
        .request("OPTIONS", &[("Authorization", authorization.as_str())], b"")
        .await?;
    assert_eq!(res.status, 200);

    Ok(())
}

#[tokio::test]
async fn a_fragmented_announce_still_parses() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    let content = sdp_body(Some(FMTP));
    let mut raw = format!(
        "ANNOUNCE rtsp://192.168.1.10/1 RTSP/1.0\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n",
        content.len()
    )
    .into_bytes();
    raw.extend_from_slice(&content);

    // split mid-header and mid-body
    let cuts = [0, 17, raw.len() - 40, raw.len()];
    for pair in cuts.windows(2) {
        client.send_raw(&raw[pair[0]..pair[1]]).await?;
        sleep(Duration::from_millis(20)).await;
    }

    let res = timeout(Duration::from_secs(5), client.read_response())
        .await??
        .ok_or_else(|| anyhow!("connection closed"))?;
    assert_eq!(res.status, 200);

    Ok(())
}

#[tokio::test]
async fn a_bad_announce_leaves_the_session_free() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    let res = client
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(None))
        .await?;
    assert_eq!(res.status, 400);

    // the failed announce did not leak the session slot
    let res = client
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);

    // which this connection now holds
    let mut other = Client::connect(addr).await?;
    let res = other
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 453);

    Ok(())
}

// the User-Agent latency table feeds the data plane; the RECORD header is a
// fixed value the sources expect back
#[tokio::test]
async fn record_always_reports_the_fixed_latency() -> Result<()> {
    for user_agent in [Some("iTunes/12.3"), Some("AirPlay/1.0"), None] {
        let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
        let mut client = Client::connect(addr).await?;

        let res = client
            .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
            .await?;
        assert_eq!(res.status, 200);

        let mut headers = vec![("Transport", TRANSPORT)];
        if let Some(user_agent) = user_agent {
            headers.push(("User-Agent", user_agent));
        }
        let res = client.request("SETUP", &headers, b"").await?;
        assert_eq!(res.status, 200);

        let res = client.request("RECORD", &[], b"").await?;
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Audio-Latency"), Some("88200"), "for {:?}", user_agent);
    }

    Ok(())
}

#[tokio::test]
async fn an_oversized_header_block_gets_a_400() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    // CSeq plus sixteen more: one over the cap
    let mut raw = String::from("OPTIONS * RTSP/1.0\r\nCSeq: 9\r\n");
    for i in 0..16 {
        raw.push_str(&format!("X-Header-{}: x\r\n", i));
    }
    raw.push_str("\r\n");
    client.send_raw(raw.as_bytes()).await?;

    let res = timeout(Duration::from_secs(5), client.read_response())
        .await??
        .ok_or_else(|| anyhow!("connection closed before responding"))?;
    assert_eq!(res.status, 400);
    assert_eq!(res.header("CSeq"), Some("9"));

    // the stream past the rejected block is unframed; the receiver hangs up
    let eof = timeout(Duration::from_secs(5), client.read_response()).await??;
    assert!(eof.is_none());

    Ok(())
}

#[tokio::test]
async fn a_setup_without_ports_rolls_the_session_back() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    let res = client
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);

    let res = client
        .request("SETUP", &[("Transport", "RTP/AVP/UDP;unicast;mode=record")], b"")
        .await?;
    assert_eq!(res.status, 451);

    // the 451 released the session slot taken by the announce
    let mut other = Client::connect(addr).await?;
    let res = other
        .request("ANNOUNCE", &[("Content-Type", "application/sdp")], &sdp_body(Some(FMTP)))
        .await?;
    assert_eq!(res.status, 200);

    Ok(())
}

#[tokio::test]
async fn volume_and_metadata_are_accepted() -> Result<()> {
    let (addr, _) = spawn_receiver(test_config(None, 120)).await?;
    let mut client = Client::connect(addr).await?;

    let res = client
        .request(
            "SET_PARAMETER",
            &[("Content-Type", "text/parameters")],
            b"volume: -11.5\r\nprogress: 1005637849/1005641111/1011195747\r\n",
        )
        .await?;
    assert_eq!(res.status, 200);

    let mut dmap = b"mlit".to_vec();
    dmap.extend_from_slice(&13u32.to_be_bytes());
    dmap.extend_from_slice(b"minm");
    dmap.extend_from_slice(&5u32.to_be_bytes());
    dmap.extend_from_slice(b"Hello");
    let res = client
        .request("SET_PARAMETER", &[("Content-Type", "application/x-dmap-tagged")], &dmap)
        .await?;
    assert_eq!(res.status, 200);

    let res = client.request("GET_PARAMETER", &[], b"").await?;
    assert_eq!(res.status, 200);

    // an unknown verb is answered with the default 400
    let res = client.request("DESCRIBE", &[], b"").await?;
    assert_eq!(res.status, 400);

    Ok(())
}
