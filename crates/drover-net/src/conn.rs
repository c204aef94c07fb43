//! Connection establishment and listening sockets.
//!
//! Connections are short-lived: one per exchange, dropped on completion or
//! error. Listening sockets persist for the lifetime of the server role and
//! can be bound to an explicit port, an ephemeral port with a fallback
//! scan, or a caller-supplied range.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use drover_types::config::config;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::CommError;

/// Listen backlog for all server sockets.
pub const LISTEN_BACKLOG: u32 = 4096;

/// Fallback scan range when an ephemeral bind reports address-in-use.
const EPHEMERAL_SCAN: (u16, u16) = (10_001, 65_535);

/// Open a TCP connection to a resolved endpoint.
pub async fn open_conn(addr: SocketAddr) -> Result<TcpStream, CommError> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| CommError::Connection(format!("connect {addr}: {e}")))
}

/// Open a TCP connection, retrying refused connects once per second.
///
/// The retry budget lets hierarchical traffic survive agent restarts; it is
/// capped so a dead node cannot stall a whole tree for long.
pub async fn open_conn_retry(addr: SocketAddr) -> Result<TcpStream, CommError> {
    let budget = connect_retry_budget();
    let mut last = None;
    for attempt in 0..=budget {
        if attempt > 0 {
            sleep(Duration::from_secs(1)).await;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if attempt == 0 {
                    debug!(%addr, "connect refused, retrying");
                }
                last = Some(e);
            }
            Err(e) => {
                return Err(CommError::Connection(format!("connect {addr}: {e}")));
            }
        }
    }
    Err(CommError::Connection(format!(
        "connect {addr}: {}",
        last.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Seconds of refused-connect retry, cached on first use.
fn connect_retry_budget() -> u16 {
    static BUDGET: OnceLock<u16> = OnceLock::new();
    *BUDGET.get_or_init(|| config().msg_timeout.min(10))
}

/// Bind and listen on a port.
///
/// `port == 0` asks for an ephemeral port; if that reports address-in-use
/// the fixed range `[10001, 65535]` is scanned instead.
pub async fn listen(port: u16) -> Result<TcpListener, CommError> {
    let ip = listen_ip().await;
    match bind_listener(SocketAddr::new(ip, port)) {
        Ok(listener) => Ok(listener),
        Err(e) if port == 0 && e.kind() == io::ErrorKind::AddrInUse => {
            for candidate in EPHEMERAL_SCAN.0..=EPHEMERAL_SCAN.1 {
                if let Ok(listener) = bind_listener(SocketAddr::new(ip, candidate)) {
                    return Ok(listener);
                }
            }
            Err(CommError::Connection(
                "no free port for message engine".to_string(),
            ))
        }
        Err(e) => Err(CommError::Connection(format!("bind port {port}: {e}"))),
    }
}

/// Bind within `[min, max]`, starting at a pseudo-random offset and
/// scanning linearly with wrap-around.
///
/// Returns the listener and the port it landed on, or an error when every
/// candidate refuses.
pub async fn listen_range(min: u16, max: u16) -> Result<(TcpListener, u16), CommError> {
    if min > max {
        return Err(CommError::Connection(format!(
            "invalid port range [{min}, {max}]"
        )));
    }
    let ip = listen_ip().await;
    let count = u32::from(max - min) + 1;
    let mut rng = SmallRng::seed_from_u64(u64::from(std::process::id()));
    let start = rng.random_range(0..count);
    for i in 0..count {
        let port = min + ((start + i) % count) as u16;
        match bind_listener(SocketAddr::new(ip, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, error = %e, "bind refused, trying next port"),
        }
    }
    Err(CommError::Connection(format!(
        "no free port in [{min}, {max}]"
    )))
}

/// Remote endpoint of a connection.
pub fn peer_addr(stream: &TcpStream) -> Option<SocketAddr> {
    stream.peer_addr().ok()
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Address server sockets bind to.
///
/// With `NoInAddrAny` set in the communication parameters, sockets bind to
/// the local hostname's address instead of the any-address.
async fn listen_ip() -> IpAddr {
    if config().has_comm_param("NoInAddrAny") {
        if let Some(name) = local_hostname() {
            match tokio::net::lookup_host((name.as_str(), 0u16)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        return addr.ip();
                    }
                }
                Err(e) => warn!(host = %name, error = %e, "cannot resolve local hostname"),
            }
        }
        warn!("NoInAddrAny set but local hostname unusable, binding any-address");
    }
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// The kernel's view of this host's name.
fn local_hostname() -> Option<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname").ok()?;
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_ephemeral() {
        let listener = listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_listen_range_picks_free_port() {
        // Find three consecutive bindable ports, occupy the outer two, and
        // check the range bind lands on the middle one.
        let (a, b, c) = three_consecutive_ports().await;
        let base = a.local_addr().unwrap().port();
        drop(b);

        let (bound, port) = listen_range(base, base + 2).await.unwrap();
        assert_eq!(port, base + 1);
        assert_eq!(bound.local_addr().unwrap().port(), base + 1);
        drop((a, c));
    }

    #[tokio::test]
    async fn test_listen_range_exhausted() {
        let (a, b, c) = three_consecutive_ports().await;
        let base = a.local_addr().unwrap().port();

        let err = listen_range(base, base + 2).await;
        assert!(err.is_err(), "fully occupied range must fail");
        drop((a, b, c));
    }

    #[tokio::test]
    async fn test_peer_addr() {
        let listener = listen(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = open_conn(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            addr.port(),
        ))
        .await
        .unwrap();
        let _held = accept.await.unwrap();
        assert_eq!(peer_addr(&stream).unwrap().port(), addr.port());
    }

    #[tokio::test]
    async fn test_open_conn_refused() {
        // An unbound port refuses immediately.
        let listener = listen(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = open_conn(addr).await;
        assert!(matches!(err, Err(CommError::Connection(_))));
    }

    /// Bind three consecutive loopback ports for range tests.
    async fn three_consecutive_ports() -> (TcpListener, TcpListener, TcpListener) {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for base in (20_000u16..40_000).step_by(17) {
            let a = bind_listener(SocketAddr::new(ip, base));
            let b = bind_listener(SocketAddr::new(ip, base + 1));
            let c = bind_listener(SocketAddr::new(ip, base + 2));
            if let (Ok(a), Ok(b), Ok(c)) = (a, b, c) {
                return (a, b, c);
            }
        }
        panic!("no consecutive free ports found");
    }
}
