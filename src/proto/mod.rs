//! Wire formats spoken by the proxy

pub mod http;
pub mod smtp;

pub use http::{Method, ParsedPath, ParsedRequest, Response};
pub use smtp::{Command, Reply, ReplyCodec, ResponseCode};
