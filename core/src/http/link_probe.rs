use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;

use super::HttpClient;
use crate::core::retention::LinkProbe;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Checks posting URLs with a HEAD request. Only statuses that mean the
/// posting is gone count as dead; network trouble never does.
pub struct HttpLinkProbe {
    client: HttpClient,
}

impl HttpLinkProbe {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

pub(crate) fn is_gone(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE
    )
}

#[async_trait]
impl LinkProbe for HttpLinkProbe {
    async fn is_dead(&self, url: &str) -> bool {
        match self.client.head(url, PROBE_TIMEOUT).await {
            Ok(response) => is_gone(response.status()),
            Err(e) => {
                debug!("Link check for {} inconclusive: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gone_statuses() {
        assert!(is_gone(StatusCode::NOT_FOUND));
        assert!(is_gone(StatusCode::GONE));
        assert!(is_gone(StatusCode::FORBIDDEN));
        assert!(!is_gone(StatusCode::OK));
        assert!(!is_gone(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_gone(StatusCode::INTERNAL_SERVER_ERROR));
    }

    /// Local server answering `/gone` with 410 and `/open` with 200.
    async fn postings() -> String {
        use axum::http::StatusCode as Status;
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/gone", get(|| async { Status::GONE }))
            .route("/open", get(|| async { Status::OK }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn checker() -> HttpLinkProbe {
        HttpLinkProbe::new(HttpClient::new(2, None, &[]).unwrap())
    }

    #[tokio::test]
    async fn test_head_status_decides_liveness() {
        let base = postings().await;
        assert!(checker().is_dead(&format!("{}/gone", base)).await);
        assert!(!checker().is_dead(&format!("{}/open", base)).await);
        assert!(checker().is_dead(&format!("{}/missing", base)).await);
    }

    #[tokio::test]
    async fn test_refused_connection_counts_as_alive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!checker().is_dead(&format!("http://{}/posting", addr)).await);
    }
}
