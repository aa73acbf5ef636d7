//! Listener binding and the accept loops feeding the worker queue.

use std::{io, net::IpAddr, pin::Pin, task::Poll};

use attest_common::{config::ConnectionSpec, internal, Signal};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpSocket, UnixListener, UnixStream},
    sync::{broadcast, mpsc},
};

/// One accepted data connection, either family.
pub struct Accepted {
    pub stream: ConnStream,
    pub peer: Option<IpAddr>,
}

pub enum ConnStream {
    Tcp(tokio::net::TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundListener {
    async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Accepted {
                    stream: ConnStream::Tcp(stream),
                    peer: Some(peer.ip()),
                })
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted {
                    stream: ConnStream::Unix(stream),
                    peer: None,
                })
            }
        }
    }
}

/// Bind one listener spec, honoring the listen backlog and, for UNIX
/// sockets, the per-listener umask override.
pub async fn bind(
    spec: &ConnectionSpec,
    backlog: u32,
    umask: Option<u32>,
) -> io::Result<BoundListener> {
    match spec {
        ConnectionSpec::Inet { port, host } => {
            let address = tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
                })?;

            let socket = if address.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(address)?;
            Ok(BoundListener::Tcp(socket.listen(backlog)?))
        }
        ConnectionSpec::Unix { path } => {
            let _ = std::fs::remove_file(path);

            let previous = umask.map(|mask| unsafe { libc::umask(mask as libc::mode_t) });
            let bound = UnixListener::bind(path);
            if let Some(previous) = previous {
                unsafe {
                    libc::umask(previous);
                }
            }

            Ok(BoundListener::Unix(bound?))
        }
    }
}

/// Accept connections until shutdown, handing them to the worker
/// queue. Returns when the listener breaks or the daemon goes down.
pub async fn accept_loop(
    name: String,
    listener: BoundListener,
    queue: mpsc::Sender<Accepted>,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    internal!(level = INFO, "Listener {name} accepting connections");

    loop {
        tokio::select! {
            signal = shutdown.recv() => {
                match signal {
                    Ok(Signal::Shutdown | Signal::Drain) | Err(_) => {
                        internal!(level = INFO, "Listener {name} shutting down");
                        return;
                    }
                    Ok(Signal::Reload) => {}
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok(conn) => {
                        if queue.send(conn).await.is_err() {
                            // Worker pool is gone; nothing left to feed.
                            return;
                        }
                    }
                    Err(err) => {
                        // Transient accept failures (EMFILE and kin)
                        // must not kill the listener.
                        internal!(level = WARN, "Listener {name} accept failed: {err}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn binds_and_accepts_tcp() {
        let spec = ConnectionSpec::Inet {
            port: 0,
            host: "127.0.0.1".to_string(),
        };
        let listener = bind(&spec, 20, None).await.unwrap();
        let BoundListener::Tcp(ref tcp) = listener else {
            panic!("expected a TCP listener");
        };
        let address = tcp.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer, Some("127.0.0.1".parse().unwrap()));

        let mut stream = accepted.stream;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.await.unwrap();
    }

    #[tokio::test]
    async fn binds_unix_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attest.sock");
        let spec = ConnectionSpec::Unix { path: path.clone() };

        let listener = bind(&spec, 20, Some(0o117)).await.unwrap();
        assert!(matches!(listener, BoundListener::Unix(_)));
        assert!(path.exists());

        // Rebinding over a stale socket file works.
        drop(listener);
        let listener = bind(&spec, 20, None).await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn accept_loop_stops_on_shutdown() {
        let spec = ConnectionSpec::Inet {
            port: 0,
            host: "127.0.0.1".to_string(),
        };
        let listener = bind(&spec, 20, None).await.unwrap();

        let (queue_tx, _queue_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let task = tokio::spawn(accept_loop(
            "test".to_string(),
            listener,
            queue_tx,
            shutdown_rx,
        ));

        shutdown_tx.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("accept loop should stop")
            .unwrap();
    }
}
