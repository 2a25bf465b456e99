//! Forwarding Queue
//!
//! Compose requests from any number of connections are delivered one at a
//! time, in arrival order, by a single worker task. The worker owns each
//! job's client connection until it has written the one response for it.

use crate::client::{SmtpClient, SmtpError};
use crate::config::{AccountConfig, SmtpConfig};
use crate::mail::MailJob;
use crate::proto::http::Response;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Page shown by the web-mail client after a successful send
const SUCCESS_PAGE: &str = r#"<div class="sendsucc"><h3>Mail sent</h3><p>Your message was delivered to the mail server.</p></div>"#;

/// Enqueue failure
#[derive(Debug, Error)]
pub enum QueueError {
    /// The worker is gone; the job is handed back so its client still gets
    /// an answer.
    #[error("Forwarding queue is closed")]
    Closed(MailJob),
}

/// Handle to the forwarding queue
#[derive(Debug, Clone)]
pub struct ForwardingQueue {
    tx: mpsc::UnboundedSender<MailJob>,
}

impl ForwardingQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(config: SmtpConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, config));
        debug!("Forwarding queue worker started");
        Self { tx }
    }

    /// Queue a job without waiting for its delivery
    pub fn enqueue(&self, job: MailJob) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|e| QueueError::Closed(e.0))
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<MailJob>, config: SmtpConfig) {
    let mut worker = Worker::new(config);
    while let Some(job) = rx.recv().await {
        let response = worker.process(&job).await;
        job.finish(&response).await;
    }
    debug!("Forwarding queue worker stopped");
}

/// Worker state: the client, and with it the TLS connector, is built once
/// per account and reused for later jobs.
struct Worker {
    config: SmtpConfig,
    client: Option<SmtpClient>,
}

impl Worker {
    fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn client_for(&mut self, account: &Arc<AccountConfig>) -> crate::Result<&SmtpClient> {
        let client = match self.client.take() {
            Some(client) if client.serves(account) => client,
            _ => SmtpClient::new(Arc::clone(account), &self.config)?,
        };
        Ok(self.client.insert(client))
    }

    /// Run one SMTP session for a job and pick the response its client gets
    async fn process(&mut self, job: &MailJob) -> Response {
        let client = match self.client_for(&job.account) {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot set up SMTP client for {}: {}", job.account.server(), e);
                return error_response(&SmtpError::from(e));
            }
        };

        match client.send(&job.form).await {
            Ok(delivery) => {
                info!(
                    "Sent email {:?} to {} via {} ({})",
                    delivery.subject,
                    delivery.recipients.join(", "),
                    delivery.server,
                    delivery.farewell
                );
                Response::mail_sent(SUCCESS_PAGE)
            }
            Err(e) => {
                warn!("Error when sending email {:?}: {}", job.form.subject, e);
                error_response(&e)
            }
        }
    }
}

/// Map a failed session onto the HTTP answer
pub fn error_response(error: &SmtpError) -> Response {
    match error {
        SmtpError::InvalidCredential
        | SmtpError::SenderMismatch(_)
        | SmtpError::InvalidRecipient(_)
        | SmtpError::MailboxNotFound(_) => Response::forbidden(&error.to_string()),
        SmtpError::Connect { .. }
        | SmtpError::Timeout(_)
        | SmtpError::Closed(_)
        | SmtpError::Protocol { .. }
        | SmtpError::Reply(_)
        | SmtpError::Tls(_)
        | SmtpError::Io(_) => Response::internal_error("Connection error"),
    }
}
