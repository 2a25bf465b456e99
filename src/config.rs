//! Configuration management

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default: 11567)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Size of the single request read per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds to wait for a client to send its request
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Seconds to wait on upstream connect and upstream reads when forwarding
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    /// Seconds a CONNECT tunnel may stay silent in both directions
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            read_timeout_secs: default_read_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
            tunnel_idle_timeout_secs: default_tunnel_idle_timeout(),
        }
    }
}

/// The web-mail endpoint whose POSTs are delivered over SMTP
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptConfig {
    /// Host of the web-mail server
    #[serde(default = "default_webserver")]
    pub webserver: String,
    /// Path of the compose-and-send endpoint (without query)
    #[serde(default = "default_compose_path")]
    pub path: String,
    /// Account type used for intercepted mail
    #[serde(default = "default_account_type")]
    pub account_type: String,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            webserver: default_webserver(),
            path: default_compose_path(),
            account_type: default_account_type(),
        }
    }
}

/// Outbound SMTP session settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Name announced in EHLO
    #[serde(default = "default_hello_name")]
    pub hello_name: String,
    /// Seconds allowed for the connect and for each server reply
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hello_name: default_hello_name(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

/// How the SMTP connection is secured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Implicit TLS on port 465, plaintext elsewhere
    #[default]
    Auto,
    /// TLS from the first byte
    Implicit,
    /// Plaintext, upgraded with STARTTLS after the first EHLO
    StartTls,
    /// Never encrypt
    Plain,
}

/// A mail account that intercepted messages are sent through
#[derive(Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Account type, matched exactly against `intercept.account_type`
    #[serde(rename = "type")]
    pub account_type: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "smtp_server")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub tls: TlsMode,
    /// Extra PEM roots to trust for this server
    #[serde(default)]
    pub ca_file: Option<String>,
}

impl AccountConfig {
    /// Whether the connection is wrapped in TLS before the banner is read
    pub fn implicit_tls(&self) -> bool {
        match self.tls {
            TlsMode::Auto => self.smtp_port == 465,
            TlsMode::Implicit => true,
            TlsMode::StartTls | TlsMode::Plain => false,
        }
    }

    /// Whether STARTTLS is issued after the first EHLO
    pub fn starttls(&self) -> bool {
        self.tls == TlsMode::StartTls
    }

    /// `host:port` of the SMTP server, for logs
    pub fn server(&self) -> String {
        format!("{}:{}", self.smtp_host, self.smtp_port)
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_type", &self.account_type)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("tls", &self.tls)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

/// Full configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub intercept: InterceptConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for log files; `null` logs to the console only
    #[serde(default = "default_log_dir")]
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            intercept: InterceptConfig::default(),
            smtp: SmtpConfig::default(),
            accounts: Vec::new(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    11567
}
fn default_backlog() -> u32 {
    32
}
fn default_buffer_size() -> usize {
    8192
}
fn default_read_timeout() -> u64 {
    5
}
fn default_upstream_timeout() -> u64 {
    10
}
fn default_tunnel_idle_timeout() -> u64 {
    120
}
fn default_webserver() -> String {
    "mail.qq.com".to_string()
}
fn default_compose_path() -> String {
    "/cgi-bin/compose_send".to_string()
}
fn default_account_type() -> String {
    "qq".to_string()
}
fn default_hello_name() -> String {
    "localhost".to_string()
}
fn default_smtp_timeout() -> u64 {
    60
}
fn default_smtp_port() -> u16 {
    465
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> Option<PathBuf> {
    Some(PathBuf::from("logs"))
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// First account whose type matches exactly
    pub fn account(&self, account_type: &str) -> Option<&AccountConfig> {
        self.accounts
            .iter()
            .find(|account| account.account_type == account_type)
    }

    /// The account intercepted mail is sent through
    pub fn intercept_account(&self) -> Result<&AccountConfig> {
        self.account(&self.intercept.account_type).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no account of type '{}' for {}{}",
                self.intercept.account_type, self.intercept.webserver, self.intercept.path
            ))
        })
    }

    /// Check the values the server cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.proxy.port == 0 {
            return Err(Error::InvalidConfig("proxy.port must be non-zero".into()));
        }
        if self.proxy.buffer_size == 0 {
            return Err(Error::InvalidConfig("proxy.buffer_size must be positive".into()));
        }
        let timeouts = [
            ("proxy.read_timeout_secs", self.proxy.read_timeout_secs),
            ("proxy.upstream_timeout_secs", self.proxy.upstream_timeout_secs),
            ("proxy.tunnel_idle_timeout_secs", self.proxy.tunnel_idle_timeout_secs),
            ("smtp.timeout_secs", self.smtp.timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        for account in &self.accounts {
            if account.smtp_host.is_empty() || account.smtp_port == 0 {
                return Err(Error::InvalidConfig(format!(
                    "account '{}' has no usable smtp_server/smtp_port",
                    account.username
                )));
            }
        }
        self.intercept_account()?;
        Ok(())
    }
}

impl ProxyConfig {
    /// Get socket address to bind to
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(addr)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_secs)
    }
}

impl SmtpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# SMTP Forward Proxy Configuration

# ============================================================================
# Proxy listener
# ============================================================================
proxy:
  # Listen address (0.0.0.0 for all interfaces)
  host: "0.0.0.0"
  port: 11567

  # Listen backlog and size of the single request read per connection
  backlog: 32
  buffer_size: 8192

  # Timeouts in seconds
  read_timeout_secs: 5
  upstream_timeout_secs: 10
  tunnel_idle_timeout_secs: 120

# ============================================================================
# Web-mail endpoint delivered over SMTP instead of forwarded
# ============================================================================
intercept:
  webserver: "mail.qq.com"
  path: "/cgi-bin/compose_send"
  account_type: "qq"

# ============================================================================
# Outbound SMTP
# ============================================================================
smtp:
  hello_name: "localhost"
  timeout_secs: 60

accounts:
  - type: "qq"
    username: "alice@qq.com"
    # Authorization code issued by the provider, not the web login password
    password: "your-authorization-code"
    smtp_server: "smtp.qq.com"
    smtp_port: 465
    # auto | implicit | starttls | plain (auto = implicit TLS on 465)
    tls: auto

log_level: "info"

# Daily log files are written here as well as to the console (null disables)
log_dir: "logs"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_yaml::from_str(
            "accounts:\n  - type: qq\n    username: a@qq.com\n    password: pw\n    smtp_server: smtp.qq.com\n",
        )
        .unwrap();

        assert_eq!(config.proxy.port, 11567);
        assert_eq!(config.proxy.backlog, 32);
        assert_eq!(config.intercept.webserver, "mail.qq.com");
        assert_eq!(config.intercept.path, "/cgi-bin/compose_send");
        assert_eq!(config.accounts[0].smtp_port, 465);
        assert_eq!(config.accounts[0].tls, TlsMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_account_selected_by_exact_type() {
        let config: Config = serde_yaml::from_str(
            r#"
accounts:
  - { type: QQ, username: upper, password: x, smtp_server: a }
  - { type: qq, username: lower, password: x, smtp_server: b }
  - { type: qq, username: second, password: x, smtp_server: c }
"#,
        )
        .unwrap();

        assert_eq!(config.account("qq").unwrap().username, "lower");
        assert_eq!(config.account("QQ").unwrap().username, "upper");
        assert!(config.account("gmail").is_none());
    }

    #[test]
    fn test_validate_requires_intercept_account() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_timeouts() {
        let valid: Config = serde_yaml::from_str(&generate_example_config()).unwrap();
        assert!(valid.validate().is_ok());

        let breakers: [fn(&mut Config); 5] = [
            |c| c.proxy.port = 0,
            |c| c.proxy.read_timeout_secs = 0,
            |c| c.proxy.upstream_timeout_secs = 0,
            |c| c.proxy.tunnel_idle_timeout_secs = 0,
            |c| c.smtp.timeout_secs = 0,
        ];
        for (i, breaker) in breakers.iter().enumerate() {
            let mut config = valid.clone();
            breaker(&mut config);
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "case {i}"
            );
        }
    }

    #[test]
    fn test_log_dir_default_and_disable() {
        assert_eq!(Config::default().log_dir, Some(PathBuf::from("logs")));

        let config: Config = serde_yaml::from_str("log_dir: /var/log/proxy\n").unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/proxy")));
        assert_eq!(config.log_level, "info");

        let config: Config = serde_yaml::from_str("log_dir: null\n").unwrap();
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_tls_mode() {
        let mut account: AccountConfig = serde_yaml::from_str(
            "{ type: qq, username: u, password: p, smtp_server: s, smtp_port: 465 }",
        )
        .unwrap();
        assert!(account.implicit_tls());
        assert!(!account.starttls());

        account.smtp_port = 587;
        assert!(!account.implicit_tls());

        account.tls = TlsMode::StartTls;
        assert!(account.starttls());
        assert!(!account.implicit_tls());

        let mode: TlsMode = serde_yaml::from_str("starttls").unwrap();
        assert_eq!(mode, TlsMode::StartTls);
    }

    #[test]
    fn test_debug_redacts_password() {
        let account: AccountConfig = serde_yaml::from_str(
            "{ type: qq, username: u, password: hunter2, smtp_server: s }",
        )
        .unwrap();
        let printed = format!("{:?}", account);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config = serde_yaml::from_str(&generate_example_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.intercept_account().unwrap().smtp_host, "smtp.qq.com");
    }
}
