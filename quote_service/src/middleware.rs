//! Request size limiting, CORS handling and error-response logging.

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::warn;

/// Create a CORS layer for the configured origins.
///
/// Returns `None` when no origins are configured. `"*"` allows any origin.
pub fn create_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.iter().any(|origin| origin == "*") {
        return Some(cors.allow_origin(Any));
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    Some(cors.allow_origin(AllowOrigin::list(allowed)))
}

/// Create request body size limit layer
pub fn create_body_limit_layer(max_size_kb: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_size_kb * 1024)
}

/// Log every 4xx/5xx response with its method and path
pub async fn error_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    if response.status().is_client_error() || response.status().is_server_error() {
        warn!("Error response: {} {} - Status: {}", method, uri, response.status());
    }

    response
}
