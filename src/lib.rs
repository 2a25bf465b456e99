//! SMTP Forward Proxy
//!
//! A local HTTP forward proxy that tunnels and forwards ordinary traffic, but
//! catches the web-mail "compose and send" POST and delivers it over SMTP
//! through a configured account instead.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      ┌──────────────┐ CONNECT / other ┌──────────────┐
//! │   Browser   │─────▶│ Proxy Server │────────────────▶│  Upstream    │
//! │             │◀─────│   :11567     │◀────────────────│  web server  │
//! └─────────────┘ HTTP └──────┬───────┘                 └──────────────┘
//!                             │ compose POST
//!                             ▼
//!                     ┌───────────────┐ one session ┌──────────────┐
//!                     │ Forwarding    │────────────▶│ SMTP server  │
//!                     │ Queue worker  │◀────────────│ (account)    │
//!                     └───────────────┘  at a time  └──────────────┘
//! ```

pub mod client;
pub mod config;
pub mod handler;
pub mod logging;
pub mod mail;
pub mod proto;
pub mod queue;
pub mod server;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items
pub use client::{Delivery, SmtpClient, SmtpError};
pub use config::{AccountConfig, Config, InterceptConfig, ProxyConfig, SmtpConfig, TlsMode};
pub use handler::Handler;
pub use mail::{ComposeForm, MailJob, Recipient};
pub use queue::ForwardingQueue;
pub use server::ProxyServer;

use thiserror::Error;

/// Error types for proxy setup
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for proxy setup
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
