//! In-memory engine for testing code built on [`HttpClientEngine`].

use crate::client::engine::HttpClientEngine;
use crate::error::{EngineError, Result};
use crate::types::{HttpRequestData, HttpResponse};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Handler = Box<dyn Fn(HttpRequestData) -> BoxFuture<'static, Result<HttpResponse>> + Send + Sync>;

/// Answers every request from a handler without touching the network.
///
/// ```
/// use cio_http::{Headers, HttpClientEngine, HttpRequestData, HttpResponse, MockEngine};
///
/// # tokio_test::block_on(async {
/// let engine = MockEngine::new(|request: HttpRequestData| async move {
///     Ok(HttpResponse::new(200, Headers::new(), request.target()))
/// });
/// let response = engine.execute(HttpRequestData::get("http://example.com/hello")?).await?;
/// assert_eq!(response.text().await?, "/hello");
/// assert_eq!(engine.requests_handled(), 1);
/// # Ok::<(), cio_http::EngineError>(())
/// # }).unwrap();
/// ```
pub struct MockEngine {
    handler: Handler,
    handled: AtomicUsize,
    closed: AtomicBool,
}

impl MockEngine {
    /// Engine answering with `handler`.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(HttpRequestData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        MockEngine {
            handler: Box::new(move |request| handler(request).boxed()),
            handled: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Requests passed to the handler so far.
    pub fn requests_handled(&self) -> usize {
        self.handled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("handled", &self.requests_handled())
            .finish()
    }
}

#[async_trait]
impl HttpClientEngine for MockEngine {
    async fn execute(&self, request: HttpRequestData) -> Result<HttpResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineClosed);
        }
        self.handled.fetch_add(1, Ordering::AcqRel);
        (self.handler)(request).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Headers;

    #[tokio::test]
    async fn test_handler_sees_request() {
        let engine = MockEngine::new(|request: HttpRequestData| async move {
            let mut headers = Headers::new();
            headers.append("X-Method", request.method.as_str());
            Ok(HttpResponse::new(201, headers, ""))
        });
        let response = engine
            .execute(HttpRequestData::get("http://example.com/").unwrap())
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.header("x-method"), Some("GET"));
    }

    #[tokio::test]
    async fn test_errors_pass_through_and_close() {
        let engine = MockEngine::new(|_| async { Err(EngineError::PrematureClose) });
        let err = engine
            .execute(HttpRequestData::get("http://example.com/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PrematureClose));

        engine.close();
        let err = engine
            .execute(HttpRequestData::get("http://example.com/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineClosed));
        assert_eq!(engine.requests_handled(), 1);
    }
}
