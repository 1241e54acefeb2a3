//! Metrics endpoint handler
//!
//! Serves the registry in the Prometheus text format for scraping.

use crate::MetricsRegistry;
use prometrics_core::{Error, HandlerFn, HttpRequest, HttpResponse};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;

/// Render `registry` as a scrape response
pub async fn serve_metrics(
    registry: &MetricsRegistry,
    _req: HttpRequest,
) -> Result<HttpResponse, Error> {
    Ok(HttpResponse::ok()
        .with_header("Content-Type", TEXT_FORMAT)
        .with_body(registry.render().into_bytes()))
}

/// Create a handler serving `registry`, for mounting on `/metrics`
///
/// # Examples
///
/// ```
/// use prometrics_core::*;
/// use prometrics_metrics::*;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let registry = Arc::new(MetricsRegistry::new());
/// let handler = metrics_handler(registry);
///
/// let response = handler(HttpRequest::new("GET", "/metrics")).await.unwrap();
/// assert_eq!(response.status, 200);
/// # });
/// ```
pub fn metrics_handler(registry: Arc<MetricsRegistry>) -> HandlerFn {
    Arc::new(move |req| {
        let registry = registry.clone();
        Box::pin(async move { serve_metrics(&registry, req).await })
    })
}
