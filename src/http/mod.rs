pub mod connection;
pub mod executor;
pub mod http1;
pub mod timeout;

use bytes::Bytes;
use std::io;
use std::time::Duration;

pub use timeout::TimeoutPolicy;

/// Browser identification sent when the caller does not set its own `User-Agent`.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

pub const APPLICATION_JSON: &str = "application/json";

/// A transport able to perform one request/response exchange.
///
/// Implementations must release every resource they acquire before `send`
/// returns, whatever the outcome.
pub trait HttpClient {
    fn send(&self, req: &Request, timeouts: &TimeoutPolicy) -> Result<Response, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes a caller is willing to treat as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedStatus {
    Exactly(u16),
    OneOf(Vec<u16>),
    /// Any 2xx status.
    AnySuccess,
}

impl ExpectedStatus {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            ExpectedStatus::Exactly(code) => *code == status,
            ExpectedStatus::OneOf(codes) => codes.contains(&status),
            ExpectedStatus::AnySuccess => (200..300).contains(&status),
        }
    }
}

impl Default for ExpectedStatus {
    fn default() -> Self {
        ExpectedStatus::Exactly(200)
    }
}

/// Description of one outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    pub expect: ExpectedStatus,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            content_type: None,
            expect: ExpectedStatus::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// A POST carrying `body` as `application/json` unless overridden.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url)
            .body(body)
            .content_type(APPLICATION_JSON)
    }

    pub fn post_json(url: impl Into<String>, json: impl Into<String>) -> Self {
        Self::post(url, Bytes::from(json.into()))
    }

    /// Sets a header, replacing any existing one with the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn expect(mut self, expect: ExpectedStatus) -> Self {
        self.expect = expect;
        self
    }

    /// Case-insensitive lookup of a caller-supplied header.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Fully buffered response as read off the wire.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: String::new(),
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Charset named by the `Content-Type` header, UTF-8 when absent.
    pub fn charset(&self) -> Result<Charset, Error> {
        match self.header("Content-Type") {
            Some(content_type) => Charset::from_content_type(content_type),
            None => Ok(Charset::Utf8),
        }
    }

    /// Decodes the body using the response charset.
    pub fn text(&self) -> Result<String, Error> {
        self.charset()?.decode(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl Charset {
    pub fn from_label(label: &str) -> Result<Self, Error> {
        let label = label.trim().trim_matches('"');
        match label.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "l1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            other => Err(Error::Decode(format!("unsupported charset {:?}", other))),
        }
    }

    fn from_content_type(content_type: &str) -> Result<Self, Error> {
        content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .map_or(Ok(Charset::Utf8), |(_, v)| Charset::from_label(v))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, Error> {
        match self {
            Charset::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Decode(e.to_string())),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            Charset::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(Error::Decode(format!("non-ascii byte at offset {}", pos))),
                None => Ok(bytes.iter().map(|&b| b as char).collect()),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("no pooled connection available after {0:?}")]
    PoolTimeout(Duration),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("timed out waiting for socket data")]
    Timeout,

    #[error("connection closed before a complete response was received")]
    ConnectionClosed,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("could not decode response body: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[source] io::Error),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ConnectTimeout(_) | Error::PoolTimeout(_)
        )
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
