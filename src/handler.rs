//! Request Handler
//!
//! Routes one parsed proxy request: CONNECT becomes a byte tunnel, the
//! web-mail compose POST becomes a queued SMTP delivery, everything else is
//! forwarded to its upstream as received.

use crate::config::{AccountConfig, Config, InterceptConfig};
use crate::mail::{ComposeForm, MailJob};
use crate::proto::http::{CONNECTION_ESTABLISHED, Method, ParsedPath, ParsedRequest, Response};
use crate::queue::{ForwardingQueue, QueueError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Per-request dispatcher, shared by all connections
#[derive(Debug, Clone)]
pub struct Handler {
    intercept: InterceptConfig,
    account: Arc<AccountConfig>,
    queue: ForwardingQueue,
    buffer_size: usize,
    upstream_timeout: Duration,
    tunnel_idle_timeout: Duration,
}

impl Handler {
    /// Resolve the intercept account once; fails if none is configured
    pub fn new(config: &Config, queue: ForwardingQueue) -> crate::Result<Self> {
        let account = Arc::new(config.intercept_account()?.clone());
        Ok(Self {
            intercept: config.intercept.clone(),
            account,
            queue,
            buffer_size: config.proxy.buffer_size,
            upstream_timeout: config.proxy.upstream_timeout(),
            tunnel_idle_timeout: config.proxy.tunnel_idle_timeout(),
        })
    }

    /// Handle the bytes of one request read from `client`. Unparseable
    /// requests and unknown methods close the connection without a reply.
    pub async fn handle(&self, client: TcpStream, data: &[u8]) -> io::Result<()> {
        let request = match ParsedRequest::parse(data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping unparseable request: {}", e);
                return Ok(());
            }
        };

        let Some(method) = request.method() else {
            debug!("No handler for method {:?}", request.method);
            return Ok(());
        };
        trace!("{} {}", method, request.path.raw_path);

        match method {
            Method::Connect => self.tunnel(client, &request).await,
            Method::Post if self.is_compose(&request) => self.intercept(client, &request).await,
            Method::Get
            | Method::Post
            | Method::Put
            | Method::Patch
            | Method::Delete
            | Method::Options => self.forward(client, &request).await,
        }
    }

    /// Whether a POST targets the configured compose endpoint
    fn is_compose(&self, request: &ParsedRequest) -> bool {
        let host = if request.path.host.is_empty() {
            request
                .header("Host")
                .and_then(|h| ParsedPath::parse(h).ok())
                .map(|p| p.host)
                .unwrap_or_default()
        } else {
            request.path.host.clone()
        };
        host == self.intercept.webserver && request.path.path == self.intercept.path
    }

    async fn intercept(&self, mut client: TcpStream, request: &ParsedRequest) -> io::Result<()> {
        let body = request.body.as_deref().unwrap_or_default();
        let form = match ComposeForm::from_body(body) {
            Ok(form) => form,
            Err(e) => {
                warn!("Rejected compose request: {}", e);
                client
                    .write_all(&Response::bad_request(&e.to_string()).to_bytes())
                    .await?;
                let _ = client.shutdown().await;
                return Ok(());
            }
        };

        info!(
            "Intercepted email {:?} for {} recipient(s)",
            form.subject,
            form.recipients.len()
        );
        let job = MailJob::new(form, Arc::clone(&self.account), client);
        if let Err(QueueError::Closed(job)) = self.queue.enqueue(job) {
            warn!("Forwarding queue is closed, dropping email {:?}", job.form.subject);
            job.finish(&Response::internal_error("Forwarding queue is closed"))
                .await;
        }
        Ok(())
    }

    async fn tunnel(&self, mut client: TcpStream, request: &ParsedRequest) -> io::Result<()> {
        let Some(mut upstream) = self.open_upstream(&mut client, &request.path).await? else {
            return Ok(());
        };
        client.write_all(CONNECTION_ESTABLISHED).await?;

        // Bytes that arrived with the CONNECT head belong to the tunnel
        let early = request.body.as_deref().unwrap_or_default();
        upstream.write_all(early).await?;

        let (sent, received) = pump(
            &mut client,
            &mut upstream,
            self.buffer_size,
            self.tunnel_idle_timeout,
        )
        .await?;
        debug!(
            "Tunnel to {} closed ({} bytes up, {} bytes down)",
            request.path.raw_path,
            early.len() as u64 + sent,
            received
        );

        let _ = upstream.shutdown().await;
        let _ = client.shutdown().await;
        Ok(())
    }

    async fn forward(&self, mut client: TcpStream, request: &ParsedRequest) -> io::Result<()> {
        let Some(mut upstream) = self.open_upstream(&mut client, &request.path).await? else {
            return Ok(());
        };
        upstream.write_all(&request.raw).await?;

        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0;
        loop {
            let n = match tokio::time::timeout(self.upstream_timeout, upstream.read(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Upstream {} went quiet", request.path.raw_path);
                    break;
                }
            };
            if n == 0 {
                break;
            }
            client.write_all(&buf[..n]).await?;
            total += n;
        }
        debug!(
            "{} {} forwarded ({} bytes)",
            request.method, request.path.raw_path, total
        );

        let _ = upstream.shutdown().await;
        let _ = client.shutdown().await;
        Ok(())
    }

    /// Connect to the request's upstream, or answer 502 and close
    async fn open_upstream(
        &self,
        client: &mut TcpStream,
        path: &ParsedPath,
    ) -> io::Result<Option<TcpStream>> {
        let target = (path.host.as_str(), path.port);
        let reason = match tokio::time::timeout(self.upstream_timeout, TcpStream::connect(target))
            .await
        {
            Ok(Ok(stream)) => return Ok(Some(stream)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connection timed out".to_string(),
        };

        warn!("Cannot connect to {}: {}", path.raw_path, reason);
        client.write_all(&Response::bad_gateway().to_bytes()).await?;
        let _ = client.shutdown().await;
        Ok(None)
    }
}

/// Copy bytes both ways until both sides have closed, either side fails, or
/// nothing has moved for `idle`. EOF on one side half-closes the other.
/// Returns bytes sent upstream and bytes received from upstream.
async fn pump(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    buffer_size: usize,
    idle: Duration,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let mut client_buf = vec![0u8; buffer_size];
    let mut upstream_buf = vec![0u8; buffer_size];
    let mut client_open = true;
    let mut upstream_open = true;
    let (mut sent, mut received) = (0u64, 0u64);

    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    while client_open || upstream_open {
        tokio::select! {
            n = client_read.read(&mut client_buf), if client_open => {
                let n = n?;
                if n == 0 {
                    client_open = false;
                    let _ = upstream_write.shutdown().await;
                } else {
                    upstream_write.write_all(&client_buf[..n]).await?;
                    sent += n as u64;
                }
            }
            n = upstream_read.read(&mut upstream_buf), if upstream_open => {
                let n = n?;
                if n == 0 {
                    upstream_open = false;
                    let _ = client_write.shutdown().await;
                } else {
                    client_write.write_all(&upstream_buf[..n]).await?;
                    received += n as u64;
                }
            }
            _ = &mut deadline => {
                debug!("Tunnel idle for {:?}", idle);
                break;
            }
        }
        deadline.as_mut().reset(Instant::now() + idle);
    }

    Ok((sent, received))
}
