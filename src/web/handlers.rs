//! HTTP request handlers.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json};
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::options::Options;
use crate::scheduler::SpeedTest;

const DOWN_BATCH: usize = 32 * 1024;
static ZERO_BATCH: [u8; DOWN_BATCH] = [b'0'; DOWN_BATCH];

// ============================================================================
// Measurement API
// ============================================================================

/// Run a measurement for the posted options and answer with the alive
/// proxies' secret configurations (each with a `_check` list).
pub async fn handle_filter_alive(Json(mut options): Json<Options>) -> impl IntoResponse {
    if options.timeout <= Duration::from_secs(1) {
        options.timeout = Duration::from_secs(5);
    }

    let test = match SpeedTest::new(options) {
        Ok(test) => test,
        Err(err) => {
            tracing::error!("Web: new test: {err}");
            return error_response(&err);
        }
    };
    if let Err(err) = test.run(CancellationToken::new()).await {
        tracing::error!("Web: test speed: {err}");
        return error_response(&err);
    }
    test.log_summary();

    match test.alive_proxies() {
        Ok(alive) => Json(alive).into_response(),
        Err(err) => {
            tracing::error!("Web: collect alive: {err}");
            error_response(&err)
        }
    }
}

fn error_response(err: &crate::scheduler::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "msg": err.to_string() })),
    )
        .into_response()
}

// ============================================================================
// Liveness helpers
// ============================================================================

pub async fn handle_index() -> impl IntoResponse {
    Html("<h1>SpeedTest Works</h1>")
}

pub async fn handle_liveness() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct DownParams {
    bytes: Option<u64>,
}

/// Local liveness object: `bytes` ASCII zeros streamed in 32 KiB batches.
pub async fn handle_down(Query(params): Query<DownParams>) -> impl IntoResponse {
    let Some(total) = params.bytes else {
        return (StatusCode::BAD_REQUEST, "missing bytes parameter").into_response();
    };

    let batches = (total / DOWN_BATCH as u64) as usize;
    let remainder = (total % DOWN_BATCH as u64) as usize;
    let chunks = (0..batches)
        .map(|_| Bytes::from_static(&ZERO_BATCH))
        .chain((remainder > 0).then(|| Bytes::from_static(&ZERO_BATCH[..remainder])));
    let stream = futures::stream::iter(chunks.map(Ok::<_, std::convert::Infallible>));

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=largefile",
            ),
            (header::CONTENT_TYPE, "application/octet-stream"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::test_router;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_liveness_answers_204() {
        let resp = test_router()
            .oneshot(Request::get("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_index_page() {
        let resp = test_router()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("SpeedTest Works"));
    }

    #[tokio::test]
    async fn test_down_emits_requested_bytes() {
        let resp = test_router()
            .oneshot(
                Request::get("/_down?bytes=70000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=largefile"
        );
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        assert_eq!(body.len(), 70000);
        assert!(body.iter().all(|&b| b == b'0'));
    }

    #[tokio::test]
    async fn test_down_requires_bytes() {
        let resp = test_router()
            .oneshot(Request::get("/_down").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_filter_alive_rejects_empty_config() {
        let resp = test_router()
            .oneshot(
                Request::post("/api/clash_speedtest/v1/filter_alive")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(resp.into_body(), 4096).await.unwrap();
        let msg: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(msg["msg"].as_str().unwrap().contains("configuration invalid"));
    }
}
