//! TLS client setup for SMTP connections

use crate::config::AccountConfig;
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Build a connector trusting the web PKI roots plus the account's `ca_file`
pub fn connector(account: &AccountConfig) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &account.ca_file {
        let pem = std::fs::read(path)?;
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| Error::Tls(format!("{path}: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("{path}: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::Tls(format!("{path}: no certificates found")));
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name the server certificate is checked against
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_connector_with_ca_file() {
        let cert = testing::TestCert::generate();
        let account = testing::account("127.0.0.1", 465, Some(cert.ca_path()));
        assert!(connector(&account).is_ok());
    }

    #[test]
    fn test_connector_rejects_missing_or_empty_ca_file() {
        let account = testing::account("127.0.0.1", 465, Some("/nonexistent/ca.pem".into()));
        assert!(matches!(connector(&account), Err(Error::Io(_))));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let path = empty.path().to_string_lossy().to_string();
        let account = testing::account("127.0.0.1", 465, Some(path));
        assert!(matches!(connector(&account), Err(Error::Tls(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("smtp.qq.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
