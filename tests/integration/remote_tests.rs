//! HTTP range reader tests against a local server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use url::Url;

use iris_codec::{
    Derivation, EncodeOptions, HttpRangeClient, RangeFetch, RasterSource, RemoteError,
    RemoteSlide, Slide,
};

use super::test_utils::{encode_to_completion, gradient_rgba, stub_source_path};

// =============================================================================
// Range-serving test server
// =============================================================================

/// Serve `bytes` with `Range` support; returns the bound address.
async fn spawn_range_server(bytes: Arc<Vec<u8>>) -> SocketAddr {
    async fn handler(State(data): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
        if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
            if let Some((start, end)) = parse_range(range, data.len() as u64) {
                let body = data[start as usize..=end as usize].to_vec();
                return (
                    StatusCode::PARTIAL_CONTENT,
                    [(
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{}", data.len()),
                    )],
                    body,
                )
                    .into_response();
            }
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }
        (StatusCode::OK, data.as_ref().clone()).into_response()
    }

    let app = Router::new()
        .route("/slide.iris", get(handler))
        .with_state(bytes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serve `bytes` while IGNORING Range headers (always 200 + full body).
async fn spawn_rangeless_server(bytes: Arc<Vec<u8>>) -> SocketAddr {
    async fn handler(State(data): State<Arc<Vec<u8>>>) -> Response {
        (StatusCode::OK, data.as_ref().clone()).into_response()
    }

    let app = Router::new()
        .route("/slide.iris", get(handler))
        .with_state(bytes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    if start > end || end >= size {
        return None;
    }
    Some((start, end))
}

fn encode_test_slide() -> (TempDir, Vec<u8>) {
    let dir = TempDir::new().unwrap();
    let mut options = EncodeOptions::new(stub_source_path(dir.path(), "remote"));
    options.destination = Some(dir.path().to_path_buf());
    options.derivation = Derivation::Derive2x;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(gradient_rgba(1024, 1024), 1024, 1024)),
    );
    let bytes = std::fs::read(&output).unwrap();
    (dir, bytes)
}

fn slide_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}/slide.iris")).unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_head_reports_content_length() {
    let (_dir, bytes) = encode_test_slide();
    let size = bytes.len() as u64;
    let addr = spawn_range_server(Arc::new(bytes)).await;

    let client = HttpRangeClient::new(slide_url(addr));
    assert_eq!(client.content_length().await.unwrap(), size);
}

#[tokio::test]
async fn test_ranged_get_returns_exact_bytes() {
    let (_dir, bytes) = encode_test_slide();
    let expected = bytes[0..36].to_vec();
    let addr = spawn_range_server(Arc::new(bytes)).await;

    let client = HttpRangeClient::new(slide_url(addr));
    let fetched = client.read_exact_at(0, 36).await.unwrap();
    assert_eq!(fetched.len(), 36);
    assert_eq!(fetched.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn test_remote_slide_matches_local() {
    let (dir, bytes) = encode_test_slide();
    let local = Slide::open(dir.path().join("remote.iris"), None).unwrap();
    let addr = spawn_range_server(Arc::new(bytes)).await;

    let remote = RemoteSlide::open(HttpRangeClient::new(slide_url(addr)))
        .await
        .unwrap();

    assert_eq!(remote.extent(), local.extent());
    assert_eq!(remote.encoding(), local.encoding());

    // Each tile fetch is an independent ranged GET carrying the bytes
    // that the local reader sees in the mapping.
    for (layer, extent) in remote.extent().layers.clone().iter().enumerate() {
        for tile in 0..extent.tile_count() as u32 {
            let fetched = remote.read_tile(layer as u32, tile).await.unwrap();
            let mapped = local.read_tile_compressed(layer as u32, tile).unwrap();
            assert_eq!(fetched.bytes.as_ref(), mapped.as_slice());
            assert_eq!(fetched.mime_type, "image/jpeg");
        }
    }
}

#[tokio::test]
async fn test_remote_tile_out_of_bounds() {
    let (_dir, bytes) = encode_test_slide();
    let addr = spawn_range_server(Arc::new(bytes)).await;

    let remote = RemoteSlide::open(HttpRangeClient::new(slide_url(addr)))
        .await
        .unwrap();
    assert!(remote.read_tile(0, 1_000_000).await.is_err());
    assert!(remote.read_tile(99, 0).await.is_err());
}

#[tokio::test]
async fn test_non_partial_response_aborts() {
    let (_dir, bytes) = encode_test_slide();
    let addr = spawn_rangeless_server(Arc::new(bytes)).await;

    let client = HttpRangeClient::new(slide_url(addr));
    // Content length works (plain HEAD)...
    client.content_length().await.unwrap();
    // ...but a ranged read answered with 200 must abort.
    let result = client.read_exact_at(0, 36).await;
    assert!(matches!(result, Err(RemoteError::UnexpectedStatus(200))));

    // Opening the slide therefore fails outright.
    let result = RemoteSlide::open(HttpRangeClient::new(slide_url(addr))).await;
    assert!(matches!(result, Err(RemoteError::UnexpectedStatus(200))));
}
