use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A request as the mock server saw it on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[allow(dead_code)]
impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }
}

pub struct MockResponse {
    raw: Vec<u8>,
    delay: Duration,
}

#[allow(dead_code)]
impl MockResponse {
    pub fn status(status: u16, body: &str) -> Self {
        Self::with_headers(status, &[("Content-Type", "text/plain; charset=utf-8")], body)
    }

    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn with_headers(status: u16, headers: &[(&str, &str)], body: &str) -> Self {
        let mut raw = format!("HTTP/1.1 {} Mock\r\n", status);
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        raw.push_str(body);
        Self::raw(raw.into_bytes())
    }

    /// Bytes written verbatim, for malformed or hand-framed responses.
    pub fn raw(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: raw.into(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync;

/// Thread-per-connection HTTP/1.1 server bound to a random local port.
///
/// After answering, each connection handler waits for the client to hang up
/// and counts it, so tests can check that no client socket stays open.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    closed: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockServer {
    pub fn start(
        handler: impl Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);

        {
            let requests = Arc::clone(&requests);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let requests = Arc::clone(&requests);
                    let closed = Arc::clone(&closed);
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || {
                        handle_connection(stream, &*handler, &requests, &closed);
                    });
                }
            });
        }

        Self {
            addr,
            requests,
            closed,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` connections were closed by the client.
    pub fn wait_for_closed(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.closed_connections() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.closed_connections() >= count
    }
}

fn handle_connection(
    mut stream: TcpStream,
    handler: &Handler,
    requests: &Mutex<Vec<RecordedRequest>>,
    closed: &AtomicUsize,
) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");

    let Some(request) = read_request(&mut stream) else {
        return;
    };
    requests.lock().unwrap().push(request.clone());

    let response = handler(&request);
    if !response.delay.is_zero() {
        thread::sleep(response.delay);
    }
    let _ = stream.write_all(&response.raw);
    let _ = stream.flush();

    // Wait for the client to hang up.
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return
            }
            Err(_) => break,
        }
    }
    closed.fetch_add(1, Ordering::SeqCst);
}

fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = data[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}
