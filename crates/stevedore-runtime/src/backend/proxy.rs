//! Host-side forwarding for published endpoints.
//!
//! A published endpoint is served by a listener on the host that relays
//! traffic to the unit's address. Both relays stop when their token fires.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use stevedore_common::error::{Result, StevedoreError};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::UnitExit;

const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// A UDP peer without replies for this long loses its upstream socket.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause after a failed `accept` before listening again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type PeerTable = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSocket>>>>;

fn bind_error(listen: SocketAddr, e: &std::io::Error) -> StevedoreError {
    StevedoreError::Backend {
        operation: "bind socket",
        message: format!("cannot bind {listen}: {e}"),
    }
}

/// Waits for the next accepted connection, or `None` once `cancel` fires.
///
/// Accept errors such as descriptor exhaustion or an aborted handshake
/// concern one connection, not the listener, so they are logged and the
/// listener keeps going after a short pause.
async fn next_connection<F, Fut, T>(
    listen: SocketAddr,
    mut accept: F,
    cancel: &CancellationToken,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return None,
            accepted = accept() => accepted,
        };
        match accepted {
            Ok(conn) => return Some(conn),
            Err(e) => {
                tracing::warn!(%listen, error = %e, "accept failed");
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

/// Accepts TCP connections on `listen` and relays each one to `upstream`.
///
/// # Errors
///
/// Returns [`StevedoreError::Backend`] if the listener cannot be bound.
pub async fn serve_tcp(
    listen: SocketAddr,
    upstream: SocketAddr,
    cancel: CancellationToken,
) -> Result<UnitExit> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| bind_error(listen, &e))?;
    tracing::info!(%listen, %upstream, "tcp endpoint listening");

    while let Some((mut inbound, peer)) =
        next_connection(listen, || listener.accept(), &cancel).await
    {
        let conn_cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            let mut outbound = match TcpStream::connect(upstream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%peer, %upstream, error = %e, "upstream connect failed");
                    return;
                }
            };
            tokio::select! {
                () = conn_cancel.cancelled() => {}
                copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                    match copied {
                        Ok((sent, received)) => {
                            tracing::debug!(%peer, sent, received, "connection closed");
                        }
                        Err(e) => tracing::debug!(%peer, error = %e, "connection reset"),
                    }
                }
            }
        });
    }
    Ok(UnitExit::Cancelled)
}

/// Relays UDP datagrams between clients of `listen` and `upstream`.
///
/// Each client peer gets its own upstream socket so replies find their way
/// back. A peer's socket is released after [`UDP_IDLE_TIMEOUT`] without a
/// reply.
///
/// # Errors
///
/// Returns [`StevedoreError::Backend`] if the socket cannot be bound or
/// receiving fails.
pub async fn serve_udp(
    listen: SocketAddr,
    upstream: SocketAddr,
    cancel: CancellationToken,
) -> Result<UnitExit> {
    let socket = UdpSocket::bind(listen)
        .await
        .map_err(|e| bind_error(listen, &e))?;
    tracing::info!(%listen, %upstream, "udp endpoint listening");
    relay_udp(
        Arc::new(socket),
        upstream,
        PeerTable::default(),
        UDP_IDLE_TIMEOUT,
        cancel,
    )
    .await
}

async fn relay_udp(
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    peers: PeerTable,
    idle: Duration,
    cancel: CancellationToken,
) -> Result<UnitExit> {
    let mut buf = vec![0_u8; UDP_BUFFER_SIZE];

    loop {
        let (len, peer) = tokio::select! {
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            received = socket.recv_from(&mut buf) => {
                received.map_err(|e| StevedoreError::Backend {
                    operation: "receive datagram",
                    message: e.to_string(),
                })?
            }
        };

        let relay = {
            let mut table = peers.lock().await;
            if let Some(relay) = table.get(&peer) {
                Arc::clone(relay)
            } else {
                let Ok(relay) = open_relay(upstream).await else {
                    tracing::warn!(%peer, %upstream, "cannot open upstream socket");
                    continue;
                };
                let relay = Arc::new(relay);
                let _ = table.insert(peer, Arc::clone(&relay));
                let _ = tokio::spawn(pump_replies(
                    Arc::clone(&socket),
                    Arc::clone(&relay),
                    peer,
                    Arc::clone(&peers),
                    idle,
                    cancel.clone(),
                ));
                relay
            }
        };

        if let Err(e) = relay.send(&buf[..len]).await {
            tracing::debug!(%peer, error = %e, "datagram dropped");
        }
    }
}

async fn open_relay(upstream: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = if upstream.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0_u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    Ok(socket)
}

async fn pump_replies(
    socket: Arc<UdpSocket>,
    relay: Arc<UdpSocket>,
    peer: SocketAddr,
    peers: PeerTable,
    idle: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0_u8; UDP_BUFFER_SIZE];
    loop {
        let len = tokio::select! {
            () = cancel.cancelled() => return,
            received = tokio::time::timeout(idle, relay.recv(&mut buf)) => match received {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "upstream relay closed");
                    break;
                }
                Err(_) => {
                    tracing::debug!(%peer, "udp peer idle");
                    break;
                }
            },
        };
        if let Err(e) = socket.send_to(&buf[..len], peer).await {
            tracing::debug!(%peer, error = %e, "reply dropped");
        }
    }

    let mut table = peers.lock().await;
    if table.get(&peer).is_some_and(|current| Arc::ptr_eq(current, &relay)) {
        let _ = table.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn free_port() -> SocketAddr {
        let scratch = TcpListener::bind("127.0.0.1:0").await.expect("scratch");
        scratch.local_addr().expect("addr")
    }

    async fn udp_echo() -> SocketAddr {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.expect("upstream");
        let addr = upstream.local_addr().expect("addr");
        let _echo = tokio::spawn(async move {
            let mut buf = [0_u8; 16];
            while let Ok((len, from)) = upstream.recv_from(&mut buf).await {
                let _ = upstream.send_to(&buf[..len], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_relay_forwards_and_stops_on_cancel() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("upstream");
        let upstream_addr = upstream.local_addr().expect("addr");
        let _echo = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.expect("accept");
            let mut buf = [0_u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            stream.write_all(&buf).await.expect("write");
        });

        let listen = free_port().await;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(listen, upstream_addr, cancel.clone()));

        let mut client = loop {
            if let Ok(stream) = TcpStream::connect(listen).await {
                break stream;
            }
            tokio::task::yield_now().await;
        };
        client.write_all(b"ping").await.expect("send");
        let mut reply = [0_u8; 4];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(&reply, b"ping");

        cancel.cancel();
        let exit = server.await.expect("join").expect("serve");
        assert_eq!(exit, UnitExit::Cancelled);
    }

    #[tokio::test]
    async fn failed_accepts_do_not_stop_the_listener() {
        let attempts = AtomicUsize::new(0);
        let listen: SocketAddr = "127.0.0.1:8080".parse().expect("addr");
        let accepted = next_connection(
            listen,
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(std::io::Error::other("too many open files"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(accepted, Some(2));
    }

    #[tokio::test]
    async fn cancel_interrupts_accept_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let listen: SocketAddr = "127.0.0.1:8080".parse().expect("addr");
        let accepted: Option<()> = next_connection(
            listen,
            || async { Err(std::io::Error::other("aborted")) },
            &cancel,
        )
        .await;
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn udp_relay_round_trips_a_datagram() {
        let upstream_addr = udp_echo().await;

        let scratch = UdpSocket::bind("127.0.0.1:0").await.expect("scratch");
        let listen = scratch.local_addr().expect("addr");
        drop(scratch);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_udp(listen, upstream_addr, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
        client.connect(listen).await.expect("connect");
        let _ = client.send(b"dns?").await.expect("send");
        let mut reply = [0_u8; 16];
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut reply))
            .await
            .expect("timeout")
            .expect("recv");
        assert_eq!(&reply[..len], b"dns?");

        cancel.cancel();
        assert_eq!(server.await.expect("join").expect("serve"), UnitExit::Cancelled);
    }

    #[tokio::test]
    async fn idle_udp_peers_are_released() {
        let upstream_addr = udp_echo().await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("listen"));
        let listen = socket.local_addr().expect("addr");
        let peers = PeerTable::default();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(relay_udp(
            socket,
            upstream_addr,
            Arc::clone(&peers),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        for _ in 0..3 {
            let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
            client.connect(listen).await.expect("connect");
            let _ = client.send(b"q").await.expect("send");
            let mut reply = [0_u8; 4];
            let _ = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut reply))
                .await
                .expect("timeout")
                .expect("recv");
        }
        assert_eq!(peers.lock().await.len(), 3);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(peers.lock().await.is_empty());

        cancel.cancel();
        assert_eq!(server.await.expect("join").expect("serve"), UnitExit::Cancelled);
    }

    #[tokio::test]
    async fn bind_failure_is_a_backend_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = taken.local_addr().expect("addr");
        let err = serve_tcp(addr, addr, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StevedoreError::Backend { .. }), "got: {err}");
    }
}
