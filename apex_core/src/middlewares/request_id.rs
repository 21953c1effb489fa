//! Injects an `x-request-id` into every request, honoring an inbound value
//! if one was already set by an upstream caller.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
  let request_id = request
    .headers()
    .get(REQUEST_ID_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string())
    .unwrap_or_else(|| Uuid::new_v4().to_string());

  if let Ok(value) = HeaderValue::from_str(&request_id) {
    request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
  } else {
    next.run(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::Router;
  use axum::body::Body;
  use axum::routing::get;
  use tower::ServiceExt;

  #[tokio::test]
  async fn generates_request_id_when_absent() {
    let app = Router::new()
      .route("/", get(|| async { "ok" }))
      .layer(axum::middleware::from_fn(request_id_middleware));

    let response = app
      .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
      .await
      .unwrap();

    assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
  }

  #[tokio::test]
  async fn preserves_inbound_request_id() {
    let app = Router::new()
      .route("/", get(|| async { "ok" }))
      .layer(axum::middleware::from_fn(request_id_middleware));

    let response = app
      .oneshot(
        axum::http::Request::builder()
          .uri("/")
          .header(REQUEST_ID_HEADER, "fixed-id")
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();

    assert_eq!(
      response.headers().get(REQUEST_ID_HEADER).unwrap(),
      "fixed-id"
    );
  }
}
