use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};

/// Local upstream counting how often it is hit
pub struct TestUpstream {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
}

/// Serves `/slow` (100ms delay), `/fail` (500) and echoes any other body
/// back after 50ms.
pub async fn spawn_upstream() -> TestUpstream {
    let hits = Arc::new(AtomicUsize::new(0));

    let slow = Arc::clone(&hits);
    let fail = Arc::clone(&hits);
    let echo = Arc::clone(&hits);
    let app = Router::new()
        .route(
            "/slow",
            any(move || {
                slow.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    "slow response"
                }
            }),
        )
        .route(
            "/fail",
            get(move || {
                fail.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream broke") }
            }),
        )
        .fallback(move |body: String| {
            echo.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                body
            }
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestUpstream {
        url: format!("http://{}", addr),
        hits,
    }
}
