//! SMTP Client
//!
//! Delivers one compose form through one account in a single session:
//! banner, EHLO, optional STARTTLS, AUTH LOGIN, then a MAIL/RCPT/DATA cycle
//! per recipient and QUIT. Any failure drops the connection without QUIT.

use crate::config::{AccountConfig, SmtpConfig};
use crate::mail::{ComposeForm, Recipient};
use crate::proto::smtp::{Command, Reply, ReplyCodec, ReplyError, ResponseCode};
use crate::tls;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace};

/// Session steps, named in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Banner,
    Ehlo,
    StartTls,
    AuthLogin,
    AuthUsername,
    AuthPassword,
    MailFrom,
    RcptTo,
    Data,
    Message,
    Quit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Banner => "BANNER",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::AuthLogin => "AUTH LOGIN",
            Self::AuthUsername => "AUTH USERNAME",
            Self::AuthPassword => "AUTH PASSWORD",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Message => "MESSAGE",
            Self::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

/// Why a session failed
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("Cannot connect to SMTP server {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("Timed out during {0}")]
    Timeout(Step),

    #[error("Server closed the connection during {0}")]
    Closed(Step),

    #[error("[{step}] {code} {message}")]
    Protocol {
        step: Step,
        code: u16,
        message: String,
    },

    #[error("Bad reply: {0}")]
    Reply(#[from] ReplyError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Incorrect username or password")]
    InvalidCredential,

    #[error("Mail is not the same as the login account: {0}")]
    SenderMismatch(String),

    #[error("Mail {0} is not valid")]
    InvalidRecipient(String),

    #[error("Mail {0} does not exist")]
    MailboxNotFound(String),
}

impl From<crate::Error> for SmtpError {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::Io(e) => Self::Io(e),
            other => Self::Tls(other.to_string()),
        }
    }
}

/// Confirmation of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub server: String,
    pub recipients: Vec<String>,
    pub subject: String,
    /// Text of the 221 reply
    pub farewell: String,
}

/// The connection under a session, before or after TLS
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One open SMTP connection with its read buffer
struct Session {
    stream: SmtpStream,
    buf: BytesMut,
    codec: ReplyCodec,
    timeout: Duration,
}

impl Session {
    fn new(stream: SmtpStream, timeout: Duration) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            codec: ReplyCodec,
            timeout,
        }
    }

    /// Read one reply block; the last line is returned
    async fn read_reply(&mut self, step: Step) -> Result<Reply, SmtpError> {
        tokio::time::timeout(self.timeout, self.next_reply(step))
            .await
            .map_err(|_| SmtpError::Timeout(step))?
    }

    async fn next_reply(&mut self, step: Step) -> Result<Reply, SmtpError> {
        loop {
            if let Some(block) = self.codec.decode(&mut self.buf)? {
                let mut lines = Reply::parse_multi(&block)?;
                for line in &lines {
                    trace!("< {}", line);
                }
                return lines.pop().ok_or(SmtpError::Reply(ReplyError::Empty));
            }

            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(SmtpError::Closed(step));
            }
        }
    }

    async fn write(&mut self, step: Step, data: &[u8]) -> Result<(), SmtpError> {
        tokio::time::timeout(self.timeout, self.write_flush(data))
            .await
            .map_err(|_| SmtpError::Timeout(step))??;
        Ok(())
    }

    async fn write_flush(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Send a command and return the server's reply
    async fn command(&mut self, step: Step, command: &Command) -> Result<Reply, SmtpError> {
        trace!("> {}", command);
        self.write(step, command.to_line().as_bytes()).await?;
        self.read_reply(step).await
    }

    /// Send a command and require one reply code
    async fn expect(
        &mut self,
        step: Step,
        command: &Command,
        code: ResponseCode,
    ) -> Result<Reply, SmtpError> {
        let reply = self.command(step, command).await?;
        check(step, reply, code)
    }

    /// Replace the plaintext connection with a TLS one
    async fn upgrade(self, connector: &TlsConnector, host: &str) -> Result<Self, SmtpError> {
        let Session {
            stream,
            buf,
            codec,
            timeout,
        } = self;

        let SmtpStream::Plain(tcp) = stream else {
            return Err(SmtpError::Tls("connection is already encrypted".into()));
        };
        if !buf.is_empty() {
            return Err(SmtpError::Tls("server sent data before the TLS handshake".into()));
        }

        let tls = handshake(connector, host, tcp, timeout, Step::StartTls).await?;
        Ok(Session {
            stream: SmtpStream::Tls(Box::new(tls)),
            buf,
            codec,
            timeout,
        })
    }
}

fn check(step: Step, reply: Reply, code: ResponseCode) -> Result<Reply, SmtpError> {
    if reply.code() == code {
        Ok(reply)
    } else {
        Err(unexpected(step, reply))
    }
}

fn unexpected(step: Step, reply: Reply) -> SmtpError {
    SmtpError::Protocol {
        step,
        code: reply.code,
        message: reply.message,
    }
}

async fn handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
    timeout: Duration,
    step: Step,
) -> Result<TlsStream<TcpStream>, SmtpError> {
    let name = tls::server_name(host)?;
    tokio::time::timeout(timeout, connector.connect(name, tcp))
        .await
        .map_err(|_| SmtpError::Timeout(step))?
        .map_err(|e| SmtpError::Tls(format!("handshake with {host} failed: {e}")))
}

/// SMTP client bound to one account
pub struct SmtpClient {
    account: Arc<AccountConfig>,
    hello_name: String,
    timeout: Duration,
    tls: TlsConnector,
}

impl SmtpClient {
    /// Create a client for an account
    pub fn new(account: Arc<AccountConfig>, config: &SmtpConfig) -> crate::Result<Self> {
        let tls = tls::connector(&account)?;
        Ok(Self {
            account,
            hello_name: config.hello_name.clone(),
            timeout: config.timeout(),
            tls,
        })
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    /// Whether this client was built for exactly this account handle
    pub fn serves(&self, account: &Arc<AccountConfig>) -> bool {
        Arc::ptr_eq(&self.account, account)
    }

    /// Deliver a compose form to all of its recipients, in order
    pub async fn send(&self, form: &ComposeForm) -> Result<Delivery, SmtpError> {
        let mut session = self.connect().await?;

        let banner = session.read_reply(Step::Banner).await?;
        let banner = check(Step::Banner, banner, ResponseCode::READY)?;
        debug!("Server greeting: {}", banner);

        self.ehlo(&mut session).await?;

        if self.account.starttls() {
            session
                .expect(Step::StartTls, &Command::StartTls, ResponseCode::READY)
                .await?;
            session = session.upgrade(&self.tls, &self.account.smtp_host).await?;
            debug!("STARTTLS established with {}", self.account.server());
            self.ehlo(&mut session).await?;
        }

        self.authenticate(&mut session).await?;

        let date = OffsetDateTime::now_utc().format(&Rfc2822).ok();
        let mut delivered = Vec::with_capacity(form.recipients.len());
        for to in &form.recipients {
            info!("Sending email to {}...", to);
            self.deliver(&mut session, form, to, date.as_deref()).await?;
            delivered.push(to.address.clone());
        }

        let farewell = session
            .expect(Step::Quit, &Command::Quit, ResponseCode::CLOSING)
            .await?;
        let _ = session.stream.shutdown().await;

        Ok(Delivery {
            server: self.account.server(),
            recipients: delivered,
            subject: form.subject.clone(),
            farewell: farewell.message,
        })
    }

    async fn connect(&self) -> Result<Session, SmtpError> {
        let server = self.account.server();
        debug!("Connecting to SMTP server {}...", server);

        let addr = (self.account.smtp_host.as_str(), self.account.smtp_port);
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SmtpError::Connect {
                server: server.clone(),
                reason: "connection timed out".into(),
            })?
            .map_err(|e| SmtpError::Connect {
                server: server.clone(),
                reason: e.to_string(),
            })?;

        let stream = if self.account.implicit_tls() {
            let tls = handshake(
                &self.tls,
                &self.account.smtp_host,
                tcp,
                self.timeout,
                Step::Connect,
            )
            .await?;
            SmtpStream::Tls(Box::new(tls))
        } else {
            SmtpStream::Plain(tcp)
        };

        Ok(Session::new(stream, self.timeout))
    }

    async fn ehlo(&self, session: &mut Session) -> Result<(), SmtpError> {
        session
            .expect(
                Step::Ehlo,
                &Command::Ehlo(self.hello_name.clone()),
                ResponseCode::OK,
            )
            .await?;
        Ok(())
    }

    async fn authenticate(&self, session: &mut Session) -> Result<(), SmtpError> {
        session
            .expect(Step::AuthLogin, &Command::AuthLogin, ResponseCode::AUTH_CONTINUE)
            .await?;
        session
            .expect(
                Step::AuthUsername,
                &Command::credential(&self.account.username),
                ResponseCode::AUTH_CONTINUE,
            )
            .await?;

        let reply = session
            .command(Step::AuthPassword, &Command::credential(&self.account.password))
            .await?;
        match reply.code() {
            ResponseCode::AUTH_SUCCESS => {
                debug!("Authenticated as {}", self.account.username);
                Ok(())
            }
            ResponseCode::AUTH_FAILED => Err(SmtpError::InvalidCredential),
            _ => Err(unexpected(Step::AuthPassword, reply)),
        }
    }

    /// One envelope and message for one recipient
    async fn deliver(
        &self,
        session: &mut Session,
        form: &ComposeForm,
        to: &Recipient,
        date: Option<&str>,
    ) -> Result<(), SmtpError> {
        let sender = form.sender_address(&self.account);
        let reply = session
            .command(Step::MailFrom, &Command::MailFrom(sender.to_string()))
            .await?;
        match reply.code() {
            ResponseCode::OK => {}
            ResponseCode::PARAMETER_ERROR => {
                return Err(SmtpError::SenderMismatch(sender.to_string()));
            }
            _ => return Err(unexpected(Step::MailFrom, reply)),
        }

        let reply = session
            .command(Step::RcptTo, &Command::RcptTo(to.address.clone()))
            .await?;
        match reply.code() {
            ResponseCode::OK => {}
            ResponseCode::COMMAND_UNRECOGNIZED => {
                return Err(SmtpError::InvalidRecipient(to.address.clone()));
            }
            _ => return Err(unexpected(Step::RcptTo, reply)),
        }

        session
            .expect(Step::Data, &Command::Data, ResponseCode::START_INPUT)
            .await?;

        let mut message = form.render(&self.account, to, date);
        message.push_str(".\r\n");
        session.write(Step::Message, message.as_bytes()).await?;

        let reply = session.read_reply(Step::Message).await?;
        match reply.code() {
            ResponseCode::OK => Ok(()),
            ResponseCode::SYNTAX_ERROR => Err(SmtpError::MailboxNotFound(to.address.clone())),
            _ => Err(unexpected(Step::Message, reply)),
        }
    }
}
