//! Request metrics middleware
//!
//! Wraps handlers so that every request records:
//! - `http_requests_in_flight{route}` - requests currently being processed
//! - `http_request_duration_seconds{route,method,code}` - duration histogram
//! - `http_requests_total{route,method,code}` - request count
//! - `http_request_size_bytes{route,method,code}` - declared request size
//! - `http_response_size_bytes{route,method,code}` - response body size

use crate::{
    CounterHandle, GaugeHandle, GaugeSeries, HistogramHandle, MetricsConfig, MetricsRegistry,
    Result,
};
use prometrics_core::{
    Error, HandlerFn, HandlerFuture, HttpRequest, HttpResponse, Middleware, Next,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

const ROUTE_LABELS: &[&str] = &["route", "method", "code"];

struct HttpMetricsInner {
    requests_total: CounterHandle,
    request_duration: HistogramHandle,
    in_flight: GaugeHandle,
    request_size: HistogramHandle,
    response_size: HistogramHandle,
    unknown_route: String,
    default_route: String,
    max_route_len: usize,
}

/// The five HTTP instruments, shared by every instrumented handler.
///
/// # Examples
///
/// ```
/// use prometrics_core::*;
/// use prometrics_metrics::*;
///
/// # tokio_test::block_on(async {
/// let registry = MetricsRegistry::new();
/// let metrics = HttpMetrics::new(&registry, &MetricsConfig::default()).unwrap();
///
/// let hello = metrics.instrument_handler(
///     "/hello",
///     handler_fn(|_req| async { Ok(HttpResponse::ok().with_text("Hello, world!")) }),
/// );
/// hello(HttpRequest::new("GET", "/hello")).await.unwrap();
///
/// let text = registry.render();
/// assert!(text.contains("http_requests_total{code=\"200\",method=\"GET\",route=\"/hello\"} 1"));
/// # });
/// ```
#[derive(Clone)]
pub struct HttpMetrics {
    inner: Arc<HttpMetricsInner>,
}

impl HttpMetrics {
    /// Get or create the HTTP instruments in `registry`
    pub fn new(registry: &MetricsRegistry, config: &MetricsConfig) -> Result<Self> {
        let requests_total = registry.get_or_create_counter(
            "http_requests_total",
            "Total number of HTTP requests",
            ROUTE_LABELS,
        )?;
        let request_duration = registry.get_or_create_histogram(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            ROUTE_LABELS,
            Some(config.duration_buckets.clone()),
        )?;
        let in_flight = registry.get_or_create_gauge(
            "http_requests_in_flight",
            "Number of HTTP requests currently being processed",
            &["route"],
        )?;
        let request_size = registry.get_or_create_histogram(
            "http_request_size_bytes",
            "HTTP request size in bytes",
            ROUTE_LABELS,
            Some(config.size_buckets.clone()),
        )?;
        let response_size = registry.get_or_create_histogram(
            "http_response_size_bytes",
            "HTTP response size in bytes",
            ROUTE_LABELS,
            Some(config.size_buckets.clone()),
        )?;

        Ok(Self {
            inner: Arc::new(HttpMetricsInner {
                requests_total,
                request_duration,
                in_flight,
                request_size,
                response_size,
                unknown_route: config.unknown_route_label.clone(),
                default_route: config.default_route_label.clone(),
                max_route_len: config.max_route_label_len,
            }),
        })
    }

    /// Wrap `handler` so each call is recorded under `route`
    pub fn instrument_handler(&self, route: impl Into<String>, handler: HandlerFn) -> HandlerFn {
        let route: String = route.into();
        let route = self.route_label(Some(&route));
        let metrics = self.clone();

        Arc::new(move |req| {
            let metrics = metrics.clone();
            let route = route.clone();
            let handler = handler.clone();
            Box::pin(async move { metrics.observe(&route, req, |req| handler(req)).await })
        })
    }

    /// Wrap `handler` under the configured default route label
    pub fn instrument_default(&self, handler: HandlerFn) -> HandlerFn {
        let route = self.inner.default_route.clone();
        self.instrument_handler(route, handler)
    }

    /// Run `call` with `req` and record it under `route`
    pub async fn observe<F>(
        &self,
        route: &str,
        req: HttpRequest,
        call: F,
    ) -> std::result::Result<HttpResponse, Error>
    where
        F: FnOnce(HttpRequest) -> HandlerFuture,
    {
        let method = req.method.clone();
        let request_size = req.content_length().filter(|size| *size > 0);

        let in_flight = self.enter(route);
        let start = Instant::now();
        let result = call(req).await;
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(response) => {
                let code = response.status.to_string();
                self.record(route, &method, &code, elapsed, request_size);
                let size = response.body_len() as f64;
                self.observe_size(&self.inner.response_size, route, &method, &code, size);
            }
            Err(err) => {
                let code = err.status_code().to_string();
                self.record(route, &method, &code, elapsed, request_size);
            }
        }

        // in-flight is released only after the request is fully recorded
        drop(in_flight);
        result
    }

    /// Route label for a matched route: the fallback when missing or empty,
    /// truncated past the configured length
    pub fn route_label(&self, route: Option<&str>) -> String {
        let route = match route {
            Some(route) if !route.is_empty() => route,
            _ => return self.inner.unknown_route.clone(),
        };

        let max = self.inner.max_route_len;
        if route.len() <= max {
            return route.to_string();
        }

        let mut cut = max.saturating_sub(3);
        while !route.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &route[..cut])
    }

    /// Current in-flight count for `route`
    pub fn in_flight(&self, route: &str) -> f64 {
        self.inner
            .in_flight
            .with_labels(&[route])
            .map(|series| series.value())
            .unwrap_or_default()
    }

    fn enter(&self, route: &str) -> Option<InFlightGuard> {
        match self.inner.in_flight.with_labels(&[route]) {
            Ok(series) => Some(InFlightGuard::new(series)),
            Err(e) => {
                warn!(route = %route, error = %e, "Failed to track in-flight request");
                None
            }
        }
    }

    fn record(
        &self,
        route: &str,
        method: &str,
        code: &str,
        elapsed: f64,
        request_size: Option<u64>,
    ) {
        let labels = [route, method, code];

        match self.inner.requests_total.with_labels(&labels) {
            Ok(series) => series.increment(),
            Err(e) => warn!(route = %route, error = %e, "Failed to count request"),
        }
        match self.inner.request_duration.with_labels(&labels) {
            Ok(series) => series.observe(elapsed),
            Err(e) => warn!(route = %route, error = %e, "Failed to record request duration"),
        }
        if let Some(size) = request_size {
            self.observe_size(&self.inner.request_size, route, method, code, size as f64);
        }
    }

    fn observe_size(
        &self,
        histogram: &HistogramHandle,
        route: &str,
        method: &str,
        code: &str,
        size: f64,
    ) {
        match histogram.with_labels(&[route, method, code]) {
            Ok(series) => series.observe(size),
            Err(e) => warn!(metric = histogram.name(), error = %e, "Failed to record size"),
        }
    }
}

/// Decrements the in-flight gauge when dropped, including on error, panic
/// and cancellation of the request future
struct InFlightGuard {
    series: GaugeSeries,
}

impl InFlightGuard {
    fn new(series: GaugeSeries) -> Self {
        series.increment();
        Self { series }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.series.decrement();
    }
}

/// Request metrics middleware
///
/// Records every request passing through a [`MiddlewareChain`](prometrics_core::MiddlewareChain)
/// under the request's matched route, or the fallback label when it has none.
///
/// # Examples
///
/// ```
/// use prometrics_core::*;
/// use prometrics_metrics::*;
///
/// let registry = MetricsRegistry::new();
/// let metrics = HttpMetrics::new(&registry, &MetricsConfig::default()).unwrap();
///
/// let mut chain = MiddlewareChain::new();
/// chain.use_middleware(RequestMetricsMiddleware::new(metrics));
/// ```
pub struct RequestMetricsMiddleware {
    metrics: HttpMetrics,
}

impl RequestMetricsMiddleware {
    pub fn new(metrics: HttpMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl Middleware for RequestMetricsMiddleware {
    async fn handle(
        &self,
        request: HttpRequest,
        next: Next,
    ) -> std::result::Result<HttpResponse, Error> {
        let route = self.metrics.route_label(request.route.as_deref());
        self.metrics.observe(&route, request, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometrics_core::{MiddlewareChain, handler_fn};

    fn setup() -> (MetricsRegistry, HttpMetrics) {
        let registry = MetricsRegistry::new();
        let metrics = HttpMetrics::new(&registry, &MetricsConfig::default()).unwrap();
        (registry, metrics)
    }

    fn hello() -> HandlerFn {
        handler_fn(|_req| async { Ok(HttpResponse::ok().with_text("Hello, world!")) })
    }

    #[tokio::test]
    async fn test_successful_request_records_all_instruments() {
        let (_registry, metrics) = setup();
        let handler = metrics.instrument_handler("/hello", hello());

        let response = handler(HttpRequest::new("GET", "/hello")).await.unwrap();
        assert_eq!(response.status, 200);

        let labels = ["/hello", "GET", "200"];
        assert_eq!(metrics.in_flight("/hello"), 0.0);
        assert_eq!(metrics.inner.requests_total.with_labels(&labels).unwrap().value(), 1.0);
        assert_eq!(metrics.inner.request_duration.with_labels(&labels).unwrap().sample_count(), 1);

        let response_size = metrics.inner.response_size.with_labels(&labels).unwrap();
        assert_eq!(response_size.sample_count(), 1);
        assert_eq!(response_size.sample_sum(), 13.0);

        // no body and no Content-Length
        assert_eq!(metrics.inner.request_size.with_labels(&labels).unwrap().sample_count(), 0);
    }

    #[tokio::test]
    async fn test_request_size_uses_content_length() {
        let (_registry, metrics) = setup();
        let handler = metrics.instrument_handler(
            "/upload",
            handler_fn(|_req| async { Ok(HttpResponse::created()) }),
        );

        handler(HttpRequest::new("POST", "/upload").with_header("Content-Length", "2048"))
            .await
            .unwrap();
        handler(HttpRequest::new("POST", "/upload").with_body(vec![0u8; 10]))
            .await
            .unwrap();

        let request_size = metrics
            .inner
            .request_size
            .with_labels(&["/upload", "POST", "201"])
            .unwrap();
        assert_eq!(request_size.sample_count(), 2);
        assert_eq!(request_size.sample_sum(), 2058.0);
    }

    #[tokio::test]
    async fn test_error_records_status_but_not_response_size() {
        let (_registry, metrics) = setup();
        let handler = metrics.instrument_handler(
            "/person",
            handler_fn(|_req| async { Err(Error::NotFound("person 7".into())) }),
        );

        let result = handler(HttpRequest::new("GET", "/person/7")).await;
        assert!(result.is_err());

        let labels = ["/person", "GET", "404"];
        assert_eq!(metrics.in_flight("/person"), 0.0);
        assert_eq!(metrics.inner.requests_total.with_labels(&labels).unwrap().value(), 1.0);
        assert_eq!(metrics.inner.request_duration.with_labels(&labels).unwrap().sample_count(), 1);
        assert_eq!(metrics.inner.response_size.with_labels(&labels).unwrap().sample_count(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_visible_during_call() {
        let (_registry, metrics) = setup();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slots = Arc::new(parking_lot::Mutex::new(Some((entered_tx, release_rx))));

        let handler = metrics.instrument_handler(
            "/slow",
            handler_fn(move |_req| {
                let slot = slots.lock().take();
                async move {
                    if let Some((entered, release)) = slot {
                        let _ = entered.send(());
                        let _ = release.await;
                    }
                    Ok(HttpResponse::ok())
                }
            }),
        );

        let task = tokio::spawn(handler(HttpRequest::new("GET", "/slow")));
        entered_rx.await.unwrap();
        assert_eq!(metrics.in_flight("/slow"), 1.0);

        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(metrics.in_flight("/slow"), 0.0);
    }

    #[tokio::test]
    async fn test_in_flight_released_after_recording() {
        let (_registry, metrics) = setup();
        let seen = metrics.clone();
        let call = move |_req: HttpRequest| -> HandlerFuture {
            let in_flight = seen.in_flight("/orders");
            let recorded = seen
                .inner
                .requests_total
                .with_labels(&["/orders", "POST", "201"])
                .map(|series| series.value())
                .unwrap_or_default();
            Box::pin(async move {
                assert_eq!(in_flight, 1.0);
                assert_eq!(recorded, 0.0);
                Ok(HttpResponse::created())
            })
        };

        let response = metrics
            .observe("/orders", HttpRequest::new("POST", "/orders"), call)
            .await
            .unwrap();
        assert_eq!(response.status, 201);

        let labels = ["/orders", "POST", "201"];
        assert_eq!(metrics.in_flight("/orders"), 0.0);
        assert_eq!(metrics.inner.requests_total.with_labels(&labels).unwrap().value(), 1.0);
        assert_eq!(metrics.inner.response_size.with_labels(&labels).unwrap().sample_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_releases_in_flight() {
        let (_registry, metrics) = setup();
        let handler = metrics.instrument_handler(
            "/boom",
            handler_fn(|req: HttpRequest| async move {
                if req.path == "/boom" {
                    panic!("handler exploded");
                }
                Ok(HttpResponse::ok())
            }),
        );

        let joined = tokio::spawn(handler(HttpRequest::new("GET", "/boom"))).await;
        assert!(joined.is_err());
        assert_eq!(metrics.in_flight("/boom"), 0.0);
    }

    #[tokio::test]
    async fn test_instrument_default_uses_default_route() {
        let (_registry, metrics) = setup();
        let handler = metrics.instrument_default(hello());
        handler(HttpRequest::new("GET", "/anything")).await.unwrap();

        assert_eq!(
            metrics.inner.requests_total.with_labels(&["default", "GET", "200"]).unwrap().value(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_middleware_falls_back_to_unknown_route() {
        let (_registry, metrics) = setup();
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(RequestMetricsMiddleware::new(metrics.clone()));
        let handler = chain.wrap(hello());

        handler(HttpRequest::new("GET", "/no/route")).await.unwrap();
        handler(HttpRequest::new("GET", "/person/1").with_route("/person/:id")).await.unwrap();

        assert_eq!(
            metrics.inner.requests_total.with_labels(&["unknown", "GET", "200"]).unwrap().value(),
            1.0
        );
        assert_eq!(
            metrics.inner.requests_total.with_labels(&["/person/:id", "GET", "200"]).unwrap().value(),
            1.0
        );
    }

    #[test]
    fn test_route_label() {
        let (_registry, metrics) = setup();
        assert_eq!(metrics.route_label(Some("/api/users")), "/api/users");
        assert_eq!(metrics.route_label(Some("")), "unknown");
        assert_eq!(metrics.route_label(None), "unknown");

        let long_route = "/".to_string() + &"a".repeat(150);
        let label = metrics.route_label(Some(&long_route));
        assert_eq!(label.len(), 100);
        assert!(label.ends_with("..."));

        let wide = "é".repeat(80);
        assert!(metrics.route_label(Some(&wide)).len() <= 100);
    }
}
