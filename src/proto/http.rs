//! HTTP/1.x proxy request parsing and synthesized responses
//!
//! A request is expected to arrive in a single read. Only the pieces the
//! dispatcher needs are parsed; the raw bytes are kept so that forwarded
//! requests reach the upstream untouched.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Port assumed when the request target names none
pub const DEFAULT_PORT: u16 = 80;

/// Reply sent once a CONNECT tunnel is open. Carries no body or length.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Request parsing error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("Malformed header: {0:?}")]
    MalformedHeader(String),
}

/// Methods the proxy handles. Anything else is dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Map a request-line token onto a handled method (case-sensitive)
    pub fn from_token(token: &str) -> Option<Self> {
        let method = match token {
            "CONNECT" => Self::Connect,
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request target split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub raw_path: String,
    pub protocol: Option<String>,
    pub host: String,
    pub path: String,
    pub query: String,
    pub port: u16,
}

impl ParsedPath {
    /// Parse an absolute-URI (`http://host:8080/a?b`), authority (`host:443`)
    /// or scheme-less (`host/a`) target.
    pub fn parse(target: &str) -> Result<Self, ParseError> {
        let (protocol, rest) = match target.split_once("://") {
            Some((protocol, rest)) => (Some(protocol.to_string()), rest),
            None => (None, target),
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| ParseError::MalformedRequestLine(target.to_string()))?;

        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));

        Ok(Self {
            raw_path: target.to_string(),
            protocol,
            host: host.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            port,
        })
    }
}

/// Split `host[:port]`, keeping brackets out of IPv6 literals
fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if after.is_empty() => Some((host, DEFAULT_PORT)),
            None => None,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((authority, DEFAULT_PORT)),
    }
}

/// A parsed proxy request
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Bytes exactly as received
    pub raw: Bytes,
    pub method: String,
    pub path: ParsedPath,
    pub version: String,
    /// Header fields; a repeated name keeps its last value
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl ParsedRequest {
    /// Parse one read's worth of bytes
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (head, body) = match find_subsequence(data, b"\r\n\r\n") {
            Some(pos) => (&data[..pos], Some(&data[pos + 4..])),
            None => (data, None),
        };

        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').collect();
        let &[method, target, version] = parts.as_slice() else {
            return Err(ParseError::MalformedRequestLine(request_line.to_string()));
        };
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(ParseError::MalformedRequestLine(request_line.to_string()));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            headers.insert(name.to_string(), value.to_string());
        }

        Ok(Self {
            raw: Bytes::copy_from_slice(data),
            method: method.to_string(),
            path: ParsedPath::parse(target)?,
            version: version.to_string(),
            headers,
            body: body.filter(|b| !b.is_empty()).map(Bytes::copy_from_slice),
        })
    }

    /// The handled method, if the verb is one
    pub fn method(&self) -> Option<Method> {
        Method::from_token(&self.method)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Request line as it was received
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.path.raw_path, self.version)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A synthesized HTTP response; always closes the connection
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl Response {
    /// Create a response without a body
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// Attach a body
    pub fn with_body(mut self, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = Some(content_type);
        self.body = body.into();
        self
    }

    fn text(status: u16, reason: &'static str, message: &str) -> Self {
        Self::new(status, reason).with_body("text/plain; charset=utf-8", message)
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        if let Some(content_type) = self.content_type {
            out.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str("Connection: close\r\n\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// 200 with the JSON envelope the web-mail client expects after a send
    pub fn mail_sent(success_page: &str) -> Self {
        let body = serde_json::json!({
            "errcode": "0",
            "errmsg": "",
            "sHtml": success_page,
        });
        Self::new(200, "OK").with_body("application/json; charset=utf-8", body.to_string())
    }

    /// 400 Bad Request
    pub fn bad_request(message: &str) -> Self {
        Self::text(400, "Bad Request", message)
    }

    /// 403 Forbidden
    pub fn forbidden(message: &str) -> Self {
        Self::text(403, "Forbidden", message)
    }

    /// 500 Internal Server Error
    pub fn internal_error(message: &str) -> Self {
        Self::text(500, "Internal Server Error", message)
    }

    /// 502 Bad Gateway
    pub fn bad_gateway() -> Self {
        Self::new(502, "Bad Gateway")
    }
}
