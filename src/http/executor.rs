//! One-shot request execution with a tagged outcome.
//!
//! [`RequestExecutor::execute`] never returns an error or panics on network
//! trouble. Every outcome lands in a [`ResponseResult`], so callers can tell
//! an unexpected status apart from a transport fault.

use super::http1::Http1Client;
use super::{Charset, Error, HttpClient, Request, TimeoutPolicy};
use std::sync::Arc;

#[derive(Debug)]
pub enum ResponseResult {
    /// The status matched the request's expectation and the body decoded.
    Success {
        status: u16,
        body: String,
        charset: Charset,
    },
    /// The server answered with a status the caller did not expect. `body`
    /// is present when it could be decoded.
    HttpError { status: u16, body: Option<String> },
    /// No usable response: connect, pool, timeout, protocol or decoding failure.
    TransportFault(Error),
}

impl ResponseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseResult::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ResponseResult::Success { status, .. } | ResponseResult::HttpError { status, .. } => {
                Some(*status)
            }
            ResponseResult::TransportFault(_) => None,
        }
    }

    /// The decoded body of a successful exchange.
    pub fn body(&self) -> Option<&str> {
        match self {
            ResponseResult::Success { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn into_body(self) -> Option<String> {
        match self {
            ResponseResult::Success { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&Error> {
        match self {
            ResponseResult::TransportFault(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs requests through an explicitly supplied transport.
///
/// Cloning is cheap and clones share the transport, and with it the
/// connection pool.
pub struct RequestExecutor<C = Http1Client> {
    client: Arc<C>,
}

impl<C> Clone for RequestExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl RequestExecutor<Http1Client> {
    pub fn new() -> Self {
        Self::with_client(Http1Client::new())
    }
}

impl Default for RequestExecutor<Http1Client> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HttpClient> RequestExecutor<C> {
    pub fn with_client(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Performs exactly one round trip. The connection and its pool slot are
    /// released before this returns.
    pub fn execute(&self, spec: Request, timeouts: TimeoutPolicy) -> ResponseResult {
        log::debug!("executing {} {}", spec.method, spec.url);

        let response = match self.client.send(&spec, &timeouts) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{} {} failed: {}", spec.method, spec.url, e);
                return ResponseResult::TransportFault(e);
            }
        };
        log::info!("{} {} -> {}", spec.method, spec.url, response.status);

        if !spec.expect.matches(response.status) {
            log::warn!(
                "{} {}: unexpected response status {}",
                spec.method,
                spec.url,
                response.status
            );
            return ResponseResult::HttpError {
                status: response.status,
                body: response.text().ok(),
            };
        }

        let decoded = response
            .charset()
            .and_then(|charset| charset.decode(&response.body).map(|body| (charset, body)));
        match decoded {
            Ok((charset, body)) => ResponseResult::Success {
                status: response.status,
                body,
                charset,
            },
            Err(e) => {
                log::warn!("{} {}: {}", spec.method, spec.url, e);
                ResponseResult::TransportFault(e)
            }
        }
    }
}

impl<C: HttpClient + Send + Sync + 'static> RequestExecutor<C> {
    /// Runs [`execute`](Self::execute) on the tokio blocking pool.
    pub async fn execute_async(&self, spec: Request, timeouts: TimeoutPolicy) -> ResponseResult {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.execute(spec, timeouts))
            .await
            .unwrap_or_else(|e| ResponseResult::TransportFault(Error::Task(e.to_string())))
    }
}
