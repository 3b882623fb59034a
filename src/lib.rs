//! Synchronous HTTP/1.1 request execution with bounded timeouts.
//!
//! ```rust,no_run
//! use scoped_http::{Request, RequestExecutor, ResponseResult, TimeoutPolicy};
//!
//! let executor = RequestExecutor::new();
//! match executor.execute(Request::get("http://localhost:8080/health"), TimeoutPolicy::default()) {
//!     ResponseResult::Success { body, .. } => println!("{}", body),
//!     ResponseResult::HttpError { status, .. } => eprintln!("status {}", status),
//!     ResponseResult::TransportFault(e) => eprintln!("{}", e),
//! }
//! ```

pub mod http;

pub use http::connection::{ConnectionPool, PoolConfig};
pub use http::executor::{RequestExecutor, ResponseResult};
pub use http::http1::Http1Client;
pub use http::{
    Charset, Error, ExpectedStatus, HttpClient, Method, Request, Response, TimeoutPolicy,
    DEFAULT_USER_AGENT,
};
