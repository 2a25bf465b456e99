/// SMTP client-side protocol: reply codes, reply parsing and framing, commands
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Largest reply block accepted from a server (64KB)
pub const MAX_REPLY_SIZE: usize = 65536;

/// SMTP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const READY: Self = Self(220);
    pub const CLOSING: Self = Self(221);
    pub const AUTH_SUCCESS: Self = Self(235);
    pub const OK: Self = Self(250);
    pub const AUTH_CONTINUE: Self = Self(334);
    pub const START_INPUT: Self = Self(354);
    pub const SYNTAX_ERROR: Self = Self(500);
    pub const PARAMETER_ERROR: Self = Self(501);
    pub const COMMAND_UNRECOGNIZED: Self = Self(502);
    pub const AUTH_FAILED: Self = Self(535);
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reply parsing error
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed reply: {0:?}")]
    Malformed(String),
    #[error("Empty reply")]
    Empty,
    #[error("Reply too large: {0} bytes")]
    TooLarge(usize),
}

/// One parsed reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub raw: Bytes,
    pub code: u16,
    pub message: String,
}

impl Reply {
    /// Parse a single reply line: three digits, a separator, the message
    pub fn parse(data: &[u8]) -> Result<Self, ReplyError> {
        let line = trim_line_end(data);
        if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
            return Err(ReplyError::Malformed(
                String::from_utf8_lossy(data).to_string(),
            ));
        }

        let code = line[..3]
            .iter()
            .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));
        let message = line
            .get(4..)
            .map(|m| String::from_utf8_lossy(m).to_string())
            .unwrap_or_default();

        Ok(Self {
            raw: Bytes::copy_from_slice(data),
            code,
            message,
        })
    }

    /// Parse every non-empty line of a reply block. The last entry carries
    /// the authoritative code.
    pub fn parse_multi(data: &[u8]) -> Result<Vec<Self>, ReplyError> {
        let replies = data
            .split(|&b| b == b'\n')
            .filter(|line| !trim_line_end(line).is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if replies.is_empty() {
            return Err(ReplyError::Empty);
        }
        Ok(replies)
    }

    pub fn code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Whether a complete line ends a reply block (`250 ok`, not `250-ok`)
fn is_final_line(line: &[u8]) -> bool {
    let line = trim_line_end(line);
    line.len() == 3 || line.get(3) == Some(&b' ')
}

/// Frames whole reply blocks, so multi-line EHLO replies and replies split
/// across reads come out as one item.
#[derive(Debug, Default)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Bytes;
    type Error = ReplyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut start = 0;
        while let Some(offset) = src[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset + 1;
            if is_final_line(&src[start..end]) {
                return Ok(Some(src.split_to(end).freeze()));
            }
            start = end;
        }

        if src.len() > MAX_REPLY_SIZE {
            return Err(ReplyError::TooLarge(src.len()));
        }
        Ok(None)
    }
}

/// Commands sent by the client
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    StartTls,
    AuthLogin,
    /// A base64 AUTH LOGIN answer
    Credential(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Quit,
}

impl Command {
    /// Encode one AUTH LOGIN answer
    pub fn credential(value: &str) -> Self {
        Self::Credential(BASE64.encode(value.as_bytes()))
    }

    /// Wire form, CRLF-terminated
    pub fn to_line(&self) -> String {
        match self {
            Self::Ehlo(name) => format!("EHLO {name}\r\n"),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::AuthLogin => "AUTH LOGIN\r\n".to_string(),
            Self::Credential(encoded) => format!("{encoded}\r\n"),
            Self::MailFrom(address) => format!("MAIL FROM: <{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO: <{address}>\r\n"),
            Self::Data => "DATA\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential(_) => f.write_str("<credential>"),
            other => f.write_str(other.to_line().trim_end()),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
