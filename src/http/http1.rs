use super::connection::{Connection, ConnectionPool, PoolConfig};
use super::{Error, HttpClient, Method, Request, Response, TimeoutPolicy, DEFAULT_USER_AGENT};
use bytes::{Bytes, BytesMut};
use rustls::ClientConfig;
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::sync::Arc;
use url::Url;

const READ_CHUNK: usize = 8192;
const MAX_HEAD_LINE: usize = 16 * 1024;
const MAX_HEADERS: usize = 128;

/// HTTP/1.1 transport. Opens one connection per request and closes it
/// before returning.
#[derive(Clone)]
pub struct Http1Client {
    pool: ConnectionPool,
    tls: Arc<ClientConfig>,
}

impl Http1Client {
    pub fn new() -> Self {
        Self::with_pool(ConnectionPool::default())
    }

    pub fn with_pool_config(config: PoolConfig) -> Self {
        Self::with_pool(ConnectionPool::new(config))
    }

    pub fn with_pool(pool: ConnectionPool) -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            pool,
            tls: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Default for Http1Client {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for Http1Client {
    fn send(&self, req: &Request, timeouts: &TimeoutPolicy) -> Result<Response, Error> {
        let target = Target::parse(&req.url)?;

        let lease = self
            .pool
            .acquire(&target.route(), timeouts.connection_request)?;
        let tls = target.tls.then(|| Arc::clone(&self.tls));
        let mut conn = Connection::open(lease, &target.host, target.port, tls, timeouts)?;
        log::debug!("{} {} via {}", req.method, req.url, conn.route());

        let head = encode_request(req, &target)?;
        conn.write_all(&head)?;
        if let Some(body) = &req.body {
            conn.write_all(body)?;
        }
        conn.flush()?;

        read_response(&mut conn)
    }
}

/// Where a request goes, derived from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Value of the `Host` header.
    pub authority: String,
    /// Path and query for the request line.
    pub path: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };
        let host_str = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", raw)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing port", raw)))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host_str, port),
            None => host_str.to_string(),
        };
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host: host_str.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            tls,
            authority,
            path,
        })
    }

    pub fn route(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn check_header(name: &str, value: &str) -> Result<(), Error> {
    let bad_name = name.is_empty()
        || name
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control() || b == b':');
    if bad_name || value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(Error::InvalidHeader(format!("{:?}: {:?}", name, value)));
    }
    Ok(())
}

/// Serializes the request line and header section, including the blank line.
pub(crate) fn encode_request(req: &Request, target: &Target) -> Result<Bytes, Error> {
    let mut buf = BytesMut::with_capacity(512);
    let mut line = |name: &str, value: &str| -> Result<(), Error> {
        check_header(name, value)?;
        write!(buf, "{}: {}\r\n", name, value)
            .map_err(|e| Error::InvalidHeader(e.to_string()))
    };

    let mut head = String::new();
    write!(head, "{} {} HTTP/1.1", req.method, target.path)
        .map_err(|e| Error::InvalidHeader(e.to_string()))?;

    line("Host", &target.authority)?;
    if req.header_value("User-Agent").is_none() {
        line("User-Agent", DEFAULT_USER_AGENT)?;
    }
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("Host")
            || name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Connection")
        {
            continue;
        }
        line(name, value)?;
    }
    if req.header_value("Content-Type").is_none() {
        if let Some(content_type) = &req.content_type {
            line("Content-Type", content_type)?;
        }
    }
    let body_len = req.body.as_ref().map_or(0, |b| b.len());
    if req.body.is_some() || req.method == Method::Post {
        line("Content-Length", &body_len.to_string())?;
    }
    line("Connection", "close")?;

    let mut out = BytesMut::with_capacity(head.len() + buf.len() + 4);
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&buf);
    out.extend_from_slice(b"\r\n");
    Ok(out.freeze())
}

/// Buffered reader over a connection, handing out lines and exact-length slices.
struct WireReader<'a, R> {
    inner: &'a mut R,
    buf: BytesMut,
}

impl<'a, R: Read> WireReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Pulls more bytes from the connection, returning how many arrived.
    fn fill(&mut self) -> Result<usize, Error> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the next line without its terminator. Accepts bare LF.
    fn read_line(&mut self) -> Result<Bytes, Error> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(scanned + pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(line.freeze());
            }
            scanned = self.buf.len();
            if scanned > MAX_HEAD_LINE {
                return Err(Error::InvalidResponse("line too long".into()));
            }
            if self.fill()? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Bytes, Error> {
        while self.buf.len() < len {
            if self.fill()? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    fn read_to_end(&mut self) -> Result<Bytes, Error> {
        while self.fill()? > 0 {}
        Ok(self.buf.split().freeze())
    }
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

struct Head {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

fn read_head<R: Read>(reader: &mut WireReader<'_, R>) -> Result<Head, Error> {
    let status_line = reader.read_line()?;
    let status_line = std::str::from_utf8(&status_line)
        .map_err(|_| Error::InvalidResponse("status line is not text".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::InvalidResponse(format!(
            "unexpected status line {:?}",
            status_line
        )));
    }
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::InvalidResponse(format!("bad status in {:?}", status_line)))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let mut headers = Vec::new();
    loop {
        let line = reader.read_line()?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(Error::InvalidResponse("too many headers".into()));
        }
        let line = String::from_utf8_lossy(&line);
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidResponse(format!("malformed header {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Head {
        status,
        reason,
        headers,
    })
}

impl Head {
    fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn framing(&self) -> Result<Framing, Error> {
        if self.status == 204 || self.status == 304 {
            return Ok(Framing::Empty);
        }

        let chunked = self
            .header_values("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Framing::Chunked);
        }

        // Repeated or list-valued lengths are fine as long as they agree.
        let mut length = None;
        for value in self
            .header_values("Content-Length")
            .flat_map(|v| v.split(','))
        {
            let value = value.trim();
            let parsed = value
                .bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| value.parse::<usize>().ok())
                .flatten()
                .ok_or_else(|| Error::InvalidResponse(format!("bad content-length {:?}", value)))?;
            match length {
                Some(seen) if seen != parsed => {
                    return Err(Error::InvalidResponse(format!(
                        "conflicting content-length {} and {}",
                        seen, parsed
                    )))
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length.map_or(Framing::UntilClose, Framing::Length))
    }
}

fn read_chunked<R: Read>(reader: &mut WireReader<'_, R>) -> Result<Bytes, Error> {
    let mut body = BytesMut::new();
    loop {
        let size_line = reader.read_line()?;
        let size_line = std::str::from_utf8(&size_line)
            .map_err(|_| Error::InvalidResponse("chunk size is not text".into()))?;
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = Some(size_str)
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| Error::InvalidResponse(format!("bad chunk size {:?}", size_line)))?;

        if size == 0 {
            // Trailer section, ignored.
            while !reader.read_line()?.is_empty() {}
            return Ok(body.freeze());
        }

        let chunk = reader.read_exact(size)?;
        body.extend_from_slice(&chunk);
        if !reader.read_line()?.is_empty() {
            return Err(Error::InvalidResponse("missing CRLF after chunk".into()));
        }
    }
}

/// Reads one complete response, skipping interim 1xx responses.
pub(crate) fn read_response<R: Read>(stream: &mut R) -> Result<Response, Error> {
    let mut reader = WireReader::new(stream);

    let head = loop {
        let head = read_head(&mut reader)?;
        if (100..200).contains(&head.status) && head.status != 101 {
            log::debug!("skipping interim {} response", head.status);
            continue;
        }
        break head;
    };

    let body = match head.framing()? {
        Framing::Empty => Bytes::new(),
        Framing::Length(len) => reader.read_exact(len)?,
        Framing::Chunked => read_chunked(&mut reader)?,
        Framing::UntilClose => reader.read_to_end()?,
    };
    if !reader.buf.is_empty() {
        log::debug!("discarding {} bytes after response", reader.buf.len());
    }

    Ok(Response {
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        body,
    })
}
