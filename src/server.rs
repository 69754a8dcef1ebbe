//! TCP server for handling caret protocol connections.
//!
//! Accepts connections and hands each one to its own task. The accept loop
//! never waits on a session.

use crate::config::Config;
use crate::protocols::caret::{self, SessionOptions};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    options: SessionOptions,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listening socket. Must be called within a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: config.listen,
            source,
        };

        let listener = create_listener(config.listen, config.backlog).map_err(bind_err)?;
        let listener = TcpListener::from_std(listener).map_err(bind_err)?;

        info!(
            address = %listener.local_addr().map_err(bind_err)?,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            "Server listening"
        );

        Ok(Server {
            listener,
            options: SessionOptions {
                buffer_size: config.buffer_size,
                idle_timeout: config.idle_timeout,
            },
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Get the bound address for testing
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        // Full: drop the new peer instead of stalling the accept loop.
        let permit = match Arc::clone(&self.connection_limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "Connection limit reached");
                return;
            }
        };

        debug!(peer = %peer, "New connection");

        if let Err(e) = stream.set_nodelay(true) {
            trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let options = self.options;
        tokio::spawn(async move {
            match caret::handle_connection(stream, options).await {
                Ok(stats) => debug!(
                    peer = %peer,
                    bytes_read = stats.bytes_read,
                    bytes_written = stats.bytes_written,
                    frames = stats.frames,
                    "Connection closed"
                ),
                Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
            }
            drop(permit);
        });
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::caret::parser::HANDSHAKE;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(max_connections: usize) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: None,
            max_connections,
            backlog: 128,
            buffer_size: 1024,
            idle_timeout: None,
            log_level: "info".to_string(),
        }
    }

    async fn start(max_connections: usize) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
        let server = Server::bind(&test_config(max_connections)).unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));
        (addr, tx, handle)
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut ack = [0u8; 1];
        timeout(WAIT, stream.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack[0], HANDSHAKE);
        stream
    }

    /// Companion client: read until `terminator` shows up in the output.
    async fn read_until(stream: &mut TcpStream, terminator: &[u8]) -> Vec<u8> {
        let mut received: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        while !received.windows(terminator.len()).any(|w| w == terminator) {
            let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0, "server closed early, got {:?}", received);
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let server = Server::bind(&test_config(4)).unwrap();
        let mut config = test_config(4);
        config.listen = server.local_addr().unwrap();

        // SO_REUSEADDR does not allow two listeners on the same port.
        assert!(matches!(
            Server::bind(&config),
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_exchange() {
        let (addr, _tx, _handle) = start(16).await;

        let mut stream = connect(addr).await;
        stream
            .write_all(b"^abcdefg$hijklmn^opqrst$uvwxyz^000$")
            .await
            .unwrap();

        let received = read_until(&mut stream, b"111").await;
        assert_eq!(received, b"bcdefghpqrstu111");
    }

    #[tokio::test]
    async fn test_byte_at_a_time_client() {
        let (addr, _tx, _handle) = start(16).await;

        let mut stream = connect(addr).await;
        for byte in b"^abc$xyz^000$".iter() {
            stream.write_all(&[*byte]).await.unwrap();
        }

        let received = read_until(&mut stream, b"111").await;
        assert_eq!(received, b"bcd111");
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let (addr, _tx, _handle) = start(128).await;

        let clients: Vec<_> = (0..32u8)
            .map(|i| {
                tokio::spawn(async move {
                    let mut stream = connect(addr).await;
                    let letter = b'a' + (i % 26);
                    let payload = vec![letter; 64];

                    stream.write_all(b"noise^").await.unwrap();
                    for chunk in payload.chunks(7) {
                        stream.write_all(chunk).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                    stream.write_all(b"$^000$").await.unwrap();

                    let received = read_until(&mut stream, b"111").await;
                    let mut expected = vec![letter + 1; 64];
                    expected.extend_from_slice(b"111");
                    assert_eq!(received, expected);
                })
            })
            .collect();

        for client in clients {
            timeout(WAIT, client).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_idle_client_does_not_block_others() {
        let (addr, _tx, _handle) = start(16).await;

        let mut idle = connect(addr).await;
        idle.write_all(b"^half a fra").await.unwrap();

        let mut busy = connect(addr).await;
        busy.write_all(b"^000$").await.unwrap();
        assert_eq!(read_until(&mut busy, b"111").await, b"111");

        // The idle session kept its mode while the other one ran.
        idle.write_all(b"me$").await.unwrap();
        let expected = b"ibmg!b!gsbnf";
        let received = read_until(&mut idle, b"nf").await;
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_aborted_client_does_not_stop_listener() {
        let (addr, _tx, handle) = start(16).await;

        let aborted = connect(addr).await;
        socket2::SockRef::from(&aborted)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(aborted);

        let mut stream = connect(addr).await;
        stream.write_all(b"^000$").await.unwrap();
        assert_eq!(read_until(&mut stream, b"111").await, b"111");
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_connection_limit_drops_extra_peers() {
        let (addr, _tx, _handle) = start(1).await;

        let mut first = connect(addr).await;

        let mut extra = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(WAIT, extra.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        // The first session is unaffected.
        first.write_all(b"^000$").await.unwrap();
        assert_eq!(read_until(&mut first, b"111").await, b"111");

        // Its slot frees up once it closes.
        drop(first);
        let mut served = false;
        for _ in 0..50 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut ack = [0u8; 1];
            if let Ok(Ok(1)) = timeout(WAIT, stream.read(&mut ack)).await {
                assert_eq!(ack[0], HANDSHAKE);
                served = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(served);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (addr, tx, handle) = start(16).await;

        let mut open = connect(addr).await;

        tx.send(()).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());

        // Sessions that were already running keep going.
        open.write_all(b"^000$").await.unwrap();
        assert_eq!(read_until(&mut open, b"111").await, b"111");
    }
}
