//! Rate-limited REST dispatcher for the chat platform's HTTP API.
//!
//! All outgoing calls go through a [`Dispatcher`], which tracks the
//! server-imposed rate limit of every route in a per-key
//! [`RateLimitBucket`] and serializes requests that share a bucket. Routes
//! that do not share a bucket proceed fully in parallel.

mod bucket;
mod dispatcher;
mod error;
mod route;
mod transport;

pub use bucket::RateLimitBucket;
pub use dispatcher::{Dispatcher, RestConfig};
pub use error::{ApiError, TransportError};
pub use reqwest::Method;
pub use route::Route;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
