//! Intercepted mail: validated compose form, recipients and message rendering

use crate::config::AccountConfig;
use crate::proto::http::Response;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

static ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+@[\w.-]+\.\w+$").expect("address pattern compiles"));

/// Width of base64 body lines (RFC 2045)
const BODY_LINE_WIDTH: usize = 76;

/// Compose form rejection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("Missing form field: {0}")]
    MissingField(&'static str),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("No recipients")]
    NoRecipients,
}

/// Whether `address` looks like `local@domain.tld`
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS.is_match(address)
}

/// A message recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub display_name: String,
}

impl Recipient {
    /// Validate an address; an empty name becomes the address's local part
    pub fn new(address: &str, display_name: Option<&str>) -> Result<Self, FormError> {
        let address = address.trim();
        if !is_valid_address(address) {
            return Err(FormError::InvalidAddress(address.to_string()));
        }

        let display_name = match display_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => address.split('@').next().unwrap_or(address).to_string(),
        };

        Ok(Self {
            address: address.to_string(),
            display_name,
        })
    }

    /// Parse one `"Name"<address>` or bare `address` entry
    pub fn parse(entry: &str) -> Result<Self, FormError> {
        let entry = entry.trim();
        match entry.strip_suffix('>').and_then(|e| e.split_once('<')) {
            Some((name, address)) => {
                let name = name.trim().trim_matches('"');
                Self::new(address, Some(name))
            }
            None => Self::new(entry, None),
        }
    }

    /// Parse a `;`-separated list. Blank entries are skipped, one bad entry
    /// rejects the whole list.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, FormError> {
        let recipients = value
            .split(';')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if recipients.is_empty() {
            return Err(FormError::NoRecipients);
        }
        Ok(recipients)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.display_name, self.address)
    }
}

/// The validated body of a compose-and-send POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeForm {
    pub recipients: Vec<Recipient>,
    /// `sendmailname`: an address, or a display name for the account address
    pub from_display_name: String,
    pub subject: String,
    pub html_body: String,
}

impl ComposeForm {
    /// Parse an `application/x-www-form-urlencoded` body
    pub fn from_body(body: &[u8]) -> Result<Self, FormError> {
        let fields: HashMap<String, String> = url::form_urlencoded::parse(body)
            .into_owned()
            .collect();

        let field = |name: &'static str| {
            fields
                .get(name)
                .cloned()
                .ok_or(FormError::MissingField(name))
        };

        Ok(Self {
            recipients: Recipient::parse_list(&field("to")?)?,
            from_display_name: field("sendmailname")?,
            subject: field("subject")?,
            html_body: field("content__html")?,
        })
    }

    /// Address used for MAIL FROM and the From header
    pub fn sender_address<'a>(&'a self, account: &'a AccountConfig) -> &'a str {
        if is_valid_address(&self.from_display_name) {
            &self.from_display_name
        } else {
            &account.username
        }
    }

    /// The From header value
    pub fn from_header(&self, account: &AccountConfig) -> String {
        if is_valid_address(&self.from_display_name) {
            self.from_display_name.clone()
        } else {
            mailbox(&self.from_display_name, &account.username)
        }
    }

    /// Render the DATA payload for one recipient, without the terminator.
    /// Every line is CRLF-terminated and none starts with a dot.
    pub fn render(&self, account: &AccountConfig, to: &Recipient, date: Option<&str>) -> String {
        let mut message = String::new();
        message.push_str(&format!("From: {}\r\n", self.from_header(account)));
        message.push_str(&format!("To: {}\r\n", mailbox(&to.display_name, &to.address)));
        message.push_str(&format!("Subject: {}\r\n", encode_word(&self.subject)));
        if let Some(date) = date {
            message.push_str(&format!("Date: {date}\r\n"));
        }
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/html; charset=UTF-8\r\n");
        message.push_str("Content-Transfer-Encoding: base64\r\n");
        message.push_str("\r\n");

        let encoded = BASE64.encode(self.html_body.as_bytes());
        for chunk in encoded.as_bytes().chunks(BODY_LINE_WIDTH) {
            // base64 output is ASCII
            message.push_str(&String::from_utf8_lossy(chunk));
            message.push_str("\r\n");
        }
        message
    }
}

/// Header-safe text: CR/LF removed, non-ASCII as an RFC 2047 encoded word
fn encode_word(text: &str) -> String {
    let text: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    if text.is_ascii() {
        text
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(text.as_bytes()))
    }
}

fn mailbox(name: &str, address: &str) -> String {
    let name = encode_word(name);
    if name.starts_with("=?") {
        format!("{name} <{address}>")
    } else {
        format!("\"{}\" <{address}>", name.replace('"', "'"))
    }
}

/// A compose request waiting for delivery, together with the client
/// connection that gets the outcome.
pub struct MailJob {
    pub form: ComposeForm,
    pub account: Arc<AccountConfig>,
    origin: TcpStream,
}

impl MailJob {
    pub fn new(form: ComposeForm, account: Arc<AccountConfig>, origin: TcpStream) -> Self {
        Self {
            form,
            account,
            origin,
        }
    }

    /// Write the one response the client gets, then close its connection
    pub async fn finish(mut self, response: &Response) {
        if let Err(e) = self.origin.write_all(&response.to_bytes()).await {
            debug!("Failed to answer compose request: {}", e);
        }
        let _ = self.origin.shutdown().await;
    }
}

impl fmt::Debug for MailJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailJob")
            .field("form", &self.form)
            .field("account", &self.account.username)
            .field("origin", &self.origin.peer_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountConfig {
        serde_yaml::from_str(
            "{ type: qq, username: me@qq.com, password: pw, smtp_server: smtp.qq.com }",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_recipient_list() {
        let recipients = Recipient::parse_list(r#""Alice"<a@x.com>; b@y.com"#).unwrap();
        assert_eq!(
            recipients,
            vec![
                Recipient {
                    address: "a@x.com".into(),
                    display_name: "Alice".into()
                },
                Recipient {
                    address: "b@y.com".into(),
                    display_name: "b".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_recipient_quirks() {
        let recipients = Recipient::parse_list(r#" "" <c.d@z.co.uk>;e-f@w.io; "#).unwrap();
        assert_eq!(recipients[0].display_name, "c.d");
        assert_eq!(recipients[0].address, "c.d@z.co.uk");
        assert_eq!(recipients[1].address, "e-f@w.io");
        assert_eq!(recipients.len(), 2);
    }

    #[test]
    fn test_reject_bad_address() {
        assert_eq!(
            Recipient::parse_list("not-an-address"),
            Err(FormError::InvalidAddress("not-an-address".into()))
        );
        assert_eq!(
            Recipient::parse_list(r#"a@x.com; "Bob"<bob@nowhere>"#),
            Err(FormError::InvalidAddress("bob@nowhere".into()))
        );
        assert_eq!(Recipient::parse_list(" ; "), Err(FormError::NoRecipients));
    }

    #[test]
    fn test_form_from_body() {
        let body = b"to=%22Alice%22%3Ca%40x.com%3E%3B+b%40y.com&sendmailname=me%40qq.com\
&subject=Hello+there&content__html=%3Cp%3Ehi%3C%2Fp%3E&savesendbox=1";
        let form = ComposeForm::from_body(body).unwrap();
        assert_eq!(form.recipients.len(), 2);
        assert_eq!(form.recipients[0].display_name, "Alice");
        assert_eq!(form.from_display_name, "me@qq.com");
        assert_eq!(form.subject, "Hello there");
        assert_eq!(form.html_body, "<p>hi</p>");
    }

    #[test]
    fn test_form_missing_field() {
        let body = b"to=a%40x.com&sendmailname=me&subject=s";
        assert_eq!(
            ComposeForm::from_body(body),
            Err(FormError::MissingField("content__html"))
        );
        assert_eq!(
            ComposeForm::from_body(b"to=nope&sendmailname=me&subject=s&content__html=x"),
            Err(FormError::InvalidAddress("nope".into()))
        );
    }

    #[test]
    fn test_sender_identity() {
        let account = account();
        let mut form = ComposeForm::from_body(
            b"to=a%40x.com&sendmailname=Me&subject=s&content__html=x",
        )
        .unwrap();
        assert_eq!(form.sender_address(&account), "me@qq.com");
        assert_eq!(form.from_header(&account), "\"Me\" <me@qq.com>");

        form.from_display_name = "other@qq.com".into();
        assert_eq!(form.sender_address(&account), "other@qq.com");
        assert_eq!(form.from_header(&account), "other@qq.com");
    }

    #[test]
    fn test_render_message() {
        let account = account();
        let form = ComposeForm {
            recipients: vec![Recipient::new("a@x.com", Some("Alice")).unwrap()],
            from_display_name: "Me".into(),
            subject: "你好\r\nBcc: evil@x.com".into(),
            html_body: "<p>".repeat(40),
        };
        let message = form.render(&account, &form.recipients[0], Some("Mon, 19 Oct 2026 10:00:00 +0000"));

        assert!(message.starts_with("From: \"Me\" <me@qq.com>\r\nTo: \"Alice\" <a@x.com>\r\n"));
        assert!(message.contains("Subject: =?UTF-8?B?"));
        assert!(!message.contains("\r\nBcc:"));
        assert!(message.contains("Date: Mon, 19 Oct 2026 10:00:00 +0000\r\n"));
        assert!(message.contains("Content-Type: text/html; charset=UTF-8\r\n"));

        let (_, body) = message.split_once("\r\n\r\n").unwrap();
        assert!(body.lines().all(|line| line.len() <= BODY_LINE_WIDTH));
        let decoded = BASE64.decode(body.replace("\r\n", "")).unwrap();
        assert_eq!(decoded, form.html_body.as_bytes());
    }
}
