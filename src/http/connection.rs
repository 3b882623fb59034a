use super::{Error, TimeoutPolicy};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_per_route: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 20,
            max_per_route: 2,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    leased: HashMap<String, usize>,
    total: usize,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounds the number of connections open at once, overall and per route.
///
/// A route is the `host:port` a connection targets. Slots are handed out as
/// [`Lease`]s and come back when the lease is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Waits up to `timeout` for a free slot on `route`. A zero timeout, or
    /// one too large to represent as a deadline, waits indefinitely.
    pub fn acquire(&self, route: &str, timeout: Duration) -> Result<Lease, Error> {
        let deadline = TimeoutPolicy::deadline(timeout);
        let config = self.inner.config;
        let mut state = self.inner.lock();

        loop {
            let on_route = state.leased.get(route).copied().unwrap_or(0);
            if state.total < config.max_total && on_route < config.max_per_route {
                state.total += 1;
                *state.leased.entry(route.to_string()).or_insert(0) += 1;
                log::debug!(
                    "leased connection slot for {} ({}/{} in use)",
                    route,
                    state.total,
                    config.max_total
                );
                return Ok(Lease {
                    pool: Arc::clone(&self.inner),
                    route: route.to_string(),
                });
            }

            state = match deadline {
                None => self
                    .inner
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolTimeout(timeout));
                    }
                    self.inner
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Number of slots currently leased across all routes.
    pub fn leased(&self) -> usize {
        self.inner.lock().total
    }

    pub fn leased_for(&self, route: &str) -> usize {
        self.inner.lock().leased.get(route).copied().unwrap_or(0)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// A slot held in a [`ConnectionPool`], returned on drop.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<PoolInner>,
    route: String,
}

impl Lease {
    pub fn route(&self) -> &str {
        &self.route
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.leased.get_mut(&self.route) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.leased.remove(&self.route);
            }
        }
        drop(state);
        self.pool.released.notify_all();
        log::debug!("released connection slot for {}", self.route);
    }
}

pub enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// An open connection bound to its pool slot.
///
/// Dropping it shuts the socket down first and then returns the slot.
pub struct Connection {
    stream: Stream,
    lease: Lease,
}

impl Connection {
    /// Opens a connection for an already leased slot.
    ///
    /// `tls` is required for `https` targets and must be `None` otherwise.
    pub fn open(
        lease: Lease,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
        timeouts: &TimeoutPolicy,
    ) -> Result<Self, Error> {
        let mut sock = connect_tcp(host, port, timeouts.connect)?;
        let socket_timeout = TimeoutPolicy::bounded(timeouts.socket);
        sock.set_read_timeout(socket_timeout)?;
        sock.set_write_timeout(socket_timeout)?;
        sock.set_nodelay(true)?;

        let stream = match tls {
            None => Stream::Plain(sock),
            Some(config) => {
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| Error::Tls(e.to_string()))?;
                let mut conn = ClientConnection::new(config, server_name)
                    .map_err(|e| Error::Tls(e.to_string()))?;
                while conn.is_handshaking() {
                    conn.complete_io(&mut sock).map_err(|e| match Error::from(e) {
                        Error::Io(e) => Error::Tls(e.to_string()),
                        other => other,
                    })?;
                }
                Stream::Tls(Box::new(StreamOwned::new(conn, sock)))
            }
        };

        Ok(Self { stream, lease })
    }

    pub fn route(&self) -> &str {
        self.lease.route()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let sock = match &mut self.stream {
            Stream::Plain(s) => s,
            Stream::Tls(s) => {
                s.conn.send_close_notify();
                let _ = s.conn.write_tls(&mut s.sock);
                &mut s.sock
            }
        };
        // The peer may already be gone.
        let _ = sock.shutdown(Shutdown::Both);
    }
}

/// Tries each resolved address in turn. All attempts share one `timeout`
/// budget, so a host resolving to several addresses still fails in time.
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, Error> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::ConnectionFailed(format!("could not resolve {}: {}", host, e)))?;
    let deadline = TimeoutPolicy::deadline(timeout);

    let mut last_err = None;
    for addr in addrs {
        let attempt = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    last_err = Some(io::Error::from(io::ErrorKind::TimedOut));
                    break;
                }
                TcpStream::connect_timeout(&addr, remaining)
            }
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(connect_error(last_err, host, port, timeout))
}

fn connect_error(last_err: Option<io::Error>, host: &str, port: u16, timeout: Duration) -> Error {
    match last_err {
        Some(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            Error::ConnectTimeout(timeout)
        }
        Some(e) => Error::ConnectionFailed(format!("{}:{}: {}", host, port, e)),
        None => Error::ConnectionFailed(format!("no addresses found for {}", host)),
    }
}
