//! HTTP execution core.
//!
//! One [`ApiClient`] per external service, composing rate limiting, retry
//! with backoff, a circuit breaker, an optional TTL cache and fallback
//! strategies behind a single `get` call.

pub mod breaker;
pub mod cache;
pub mod client;
pub mod error;
pub mod fallback;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use client::{ApiClient, ApiOutcome, CounterSnapshot, PartialProbe, PartialState};
pub use error::ApiError;
pub use fallback::{FallbackInfo, FallbackManager, FallbackStrategy};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for exercising the client chain without sockets.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::error::ApiError;
    use super::transport::{HttpRequest, HttpResponse, Transport};

    pub struct MockTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, ApiError>>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub fn new(responses: Vec<Result<HttpResponse, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Network("mock transport exhausted".into())))
        }
    }

    pub fn json_ok(body: &str) -> Result<HttpResponse, ApiError> {
        Ok(HttpResponse {
            status: 200,
            retry_after: None,
            body: body.to_string(),
        })
    }

    pub fn http_status(status: u16) -> Result<HttpResponse, ApiError> {
        Ok(HttpResponse {
            status,
            retry_after: None,
            body: String::new(),
        })
    }
}
