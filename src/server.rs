//! Proxy Server
//!
//! Owns the listening socket. Every accepted connection gets its own task,
//! which reads one request and hands it to the [`Handler`].

use crate::config::ProxyConfig;
use crate::handler::Handler;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server state
pub struct ProxyServer {
    config: ProxyConfig,
    handler: Arc<Handler>,
}

impl ProxyServer {
    /// Create a new server
    pub fn new(config: ProxyConfig, handler: Handler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Bind the listening socket with address reuse and the configured backlog
    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.bind_addr()?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.config.backlog)?)
    }

    /// Run the server until Ctrl-C
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind()?;
        info!("SMTP forward proxy listening on {}", listener.local_addr()?);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing listener");
                Ok(())
            }
        }
    }

    /// Accept connections forever
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = accept_next(|| listener.accept()).await;
            trace!("Connection from {}", addr);

            let handler = Arc::clone(&self.handler);
            let buffer_size = self.config.buffer_size;
            let read_timeout = self.config.read_timeout();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &handler, buffer_size, read_timeout).await
                {
                    debug!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Next accepted connection. Failures such as running out of file
/// descriptors are logged and retried after [`ACCEPT_BACKOFF`].
async fn accept_next<T, F, Fut>(mut accept: F) -> (T, SocketAddr)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(T, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// One bounded read, then the handler. No keep-alive.
async fn handle_connection(
    mut stream: TcpStream,
    handler: &Handler,
    buffer_size: usize,
    read_timeout: Duration,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    let n = match tokio::time::timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Connection timed out before sending a request");
            return Ok(());
        }
    };
    if n == 0 {
        return Ok(());
    }

    handler.handle(stream, &buf[..n]).await
}
