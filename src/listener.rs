use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use futures::StreamExt;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, task::JoinHandle, time::sleep};
use tokio_stream::wrappers::TcpListenerStream;

use super::{
    collab::{Advertiser, Collaborators},
    config::Config,
    registry::SessionRegistry,
    session::RtspSession,
};

// workers of dead connections are reaped on this heartbeat; nothing else in
// the control plane times out
const REAP_INTERVAL: Duration = Duration::from_secs(300);

struct Connection {
    id: u32,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Binds the RTSP port dual-stack, registers the mDNS advertisement and
/// accepts connections until the process dies. Each accepted connection gets
/// its own worker task, tracked so it can be reaped once it finishes.
pub async fn serve(
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    collab: Collaborators,
    advertiser: Arc<dyn Advertiser>,
) -> Result<()> {
    let mut listeners = Vec::new();
    let addrs = [
        SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)),
        SocketAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.port, 0, 0)),
    ];
    for addr in addrs {
        match bind(addr) {
            Ok(listener) => {
                debug!("listening on {}", addr);
                listeners.push(listener);
            }
            // one of the address families may be unavailable on this host
            Err(x) => debug!("failed to bind {}: {:#}", addr, x),
        }
    }
    if listeners.is_empty() {
        bail!("could not bind any listen sockets");
    }

    advertiser.register()?;

    let mut incoming = futures::stream::select_all(listeners.into_iter().map(TcpListenerStream::new));

    let mut connections: Vec<Connection> = Vec::new();
    let mut next_id = 1u32;

    loop {
        let accepted = tokio::select! {
            accepted = incoming.next() => accepted,
            _ = sleep(REAP_INTERVAL) => None,
        };

        reap(&mut connections).await;

        let tcp = match accepted {
            Some(Ok(tcp)) => tcp,
            Some(Err(x)) => {
                warn!("failed to accept connection: {}", x);
                continue;
            }
            None => continue, // heartbeat
        };

        let id = next_id;
        next_id = next_id.wrapping_add(1);
        info!("new RTSP connection {}", id);

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(RtspSession::start(
            id,
            tcp,
            config.clone(),
            registry.clone(),
            collab.clone(),
            running.clone(),
        ));
        connections.push(Connection { id, running, task });
    }
}

// v4 and v6 must be able to coexist on the same port, so v6 sockets are
// bound v6-only
fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into())?)
}

async fn reap(connections: &mut Vec<Connection>) {
    let mut i = 0;
    while i < connections.len() {
        if connections[i].running.load(Ordering::SeqCst) {
            i += 1;
            continue;
        }

        let connection = connections.swap_remove(i);
        if let Err(x) = connection.task.await {
            error!("connection {} worker failed: {}", connection.id, x);
        }
        debug!("reaped connection {}", connection.id);
    }
}
