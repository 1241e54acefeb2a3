//! Integration tests for the request/response seam

use async_trait::async_trait;
use prometrics_core::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingMiddleware {
    seen: Arc<AtomicUsize>,
}

#[async_trait]
impl Middleware for CountingMiddleware {
    async fn handle(&self, req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        next(req).await
    }
}

#[tokio::test]
async fn test_wrapped_handler_sees_request_and_returns_response() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut chain = MiddlewareChain::new();
    chain.use_middleware(CountingMiddleware { seen: seen.clone() });

    let echo = chain.wrap(handler_fn(|req: HttpRequest| async move {
        let size = req.content_length().unwrap_or(0);
        Ok(HttpResponse::ok().with_text(format!("{} {} {}", req.method, req.path, size)))
    }));

    let response = echo(HttpRequest::new("POST", "/person").with_body(b"{\"name\":\"a\"}".to_vec()))
        .await
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(response.body, b"POST /person 12".to_vec());
    assert_eq!(response.body_len(), 15);
}

#[tokio::test]
async fn test_errors_pass_through_the_chain() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut chain = MiddlewareChain::new();
    chain.use_middleware(CountingMiddleware { seen: seen.clone() });

    let failing = chain.wrap(handler_fn(|_req| async {
        Err(Error::ServiceUnavailable("draining".into()))
    }));

    let err = failing(HttpRequest::new("GET", "/")).await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert!(err.is_server_error());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
