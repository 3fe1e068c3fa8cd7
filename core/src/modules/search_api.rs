use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::core::registry::{QueryParams, RawListing, Source};
use crate::error::SourceFetchError;
use crate::http::HttpClient;

pub const SOURCE_NAME: &str = "tavily";

/// Aggregators and social sites whose hits are never actual postings.
const BLOCKLIST_DOMAINS: &[&str] = &[
    "indeed.com",
    "glassdoor.",
    "ziprecruiter.com",
    "simplyhired.",
    "facebook.com",
    "reddit.com",
    "youtube.com",
    "medium.com",
];

/// Applicant tracking systems; their URLs are postings even without a job
/// keyword in the path.
const ATS_DOMAINS: &[&str] = &[
    "greenhouse.io",
    "lever.co",
    "ashbyhq.com",
    "workable.com",
    "smartrecruiters.com",
    "bamboohr.com",
    "recruitee.com",
];

const JOB_URL_KEYWORDS: &[&str] = &[
    "job", "career", "position", "opening", "vacanc", "hiring", "apply",
];
const JOB_TEXT_KEYWORDS: &[&str] = &["job", "hiring", "career", "position", "opening"];
const CANADA_HINTS: &[&str] = &["canada", "toronto", "vancouver", "montreal", "ottawa", "calgary"];
const TITLE_SEPARATORS: &[&str] = &[" at ", " @ ", " | ", " - ", " \u{2013} "];

#[derive(Debug, Clone)]
pub struct SearchApiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_results: usize,
    pub search_depth: String,
    pub queries: Vec<String>,
    /// Pause between consecutive queries of one fetch.
    pub query_delay: Duration,
}

impl SearchApiConfig {
    pub fn from_settings(settings: &Settings, queries: Vec<String>) -> Self {
        Self {
            endpoint: settings.tavily_endpoint.clone(),
            api_key: settings.tavily_api_key.clone(),
            max_results: settings.tavily_max_results,
            search_depth: settings.tavily_search_depth.clone(),
            queries,
            query_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'a str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// Web-search backed source (Tavily-compatible JSON API).
pub struct SearchApiSource {
    client: HttpClient,
    config: SearchApiConfig,
}

impl SearchApiSource {
    pub fn new(client: HttpClient, config: SearchApiConfig) -> Self {
        Self { client, config }
    }

    async fn search(
        &self,
        api_key: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, SourceFetchError> {
        let request = SearchRequest {
            api_key,
            query,
            max_results,
            search_depth: &self.config.search_depth,
            include_answer: false,
            include_raw_content: false,
        };
        let response = self
            .client
            .post_json(&self.config.endpoint, &request)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| request_error(e.without_url()))?;
        let body: SearchResponse = response.json().await.map_err(|e| SourceFetchError::Decode {
            name: SOURCE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.results)
    }
}

fn request_error(e: reqwest::Error) -> SourceFetchError {
    SourceFetchError::Request {
        name: SOURCE_NAME.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl Source for SearchApiSource {
    async fn fetch(&self, query: &QueryParams) -> Result<Vec<RawListing>, SourceFetchError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(SourceFetchError::NotConfigured {
                name: SOURCE_NAME.to_string(),
                reason: "TAVILY_API_KEY is not set".to_string(),
            });
        };
        let queries = if query.queries.is_empty() {
            &self.config.queries
        } else {
            &query.queries
        };
        let max_results = query.max_results.unwrap_or(self.config.max_results);

        let mut listings = Vec::new();
        let mut seen = HashSet::new();
        let mut last_error = None;
        let mut failed = 0;

        for (i, q) in queries.iter().enumerate() {
            if i > 0 && !self.config.query_delay.is_zero() {
                tokio::time::sleep(self.config.query_delay).await;
            }
            match self.search(api_key, q, max_results).await {
                Ok(hits) => {
                    let before = listings.len();
                    for hit in &hits {
                        if let Some(listing) = listing_from_hit(hit, q) {
                            if seen.insert(listing.external_id.clone()) {
                                listings.push(listing);
                            }
                        }
                    }
                    debug!("Query '{}': {} hits, {} kept", q, hits.len(), listings.len() - before);
                }
                Err(e) => {
                    warn!("Search query '{}' failed: {}", q, e);
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failed == queries.len() => Err(e),
            _ => Ok(listings),
        }
    }
}

/// Turns one search hit into a listing, or drops it when it does not look
/// like a remote or Canadian job posting.
pub fn listing_from_hit(hit: &SearchHit, query: &str) -> Option<RawListing> {
    let title_text = hit.title.trim();
    let content = hit.content.trim();
    let url = hit.url.trim();
    if title_text.is_empty() && content.is_empty() {
        return None;
    }

    if !url.is_empty() {
        let lowered = url.to_lowercase();
        if contains_any(&lowered, BLOCKLIST_DOMAINS) {
            return None;
        }
        if !contains_any(&lowered, ATS_DOMAINS) && !contains_any(&lowered, JOB_URL_KEYWORDS) {
            return None;
        }
    }

    let text = format!("{} {}", title_text, content).to_lowercase();
    if !contains_any(&text, JOB_TEXT_KEYWORDS) {
        return None;
    }
    let is_remote = text.contains("remote");
    if !is_remote && !contains_any(&format!("{} {}", text, url.to_lowercase()), CANADA_HINTS) {
        return None;
    }

    let (title, company) = split_title_company(title_text);
    let mut listing = RawListing::new(title, (!url.is_empty()).then(|| url.to_string()));
    listing.company = company;
    listing.summary = (!content.is_empty()).then(|| content.to_string());
    listing.is_remote = is_remote;
    listing.location = Some(if is_remote || query.to_lowercase().contains("remote") {
        "Remote".to_string()
    } else {
        "Canada".to_string()
    });
    Some(listing)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// "Backend Engineer at Acme" -> ("Backend Engineer", Some("Acme")).
fn split_title_company(text: &str) -> (String, Option<String>) {
    for sep in TITLE_SEPARATORS {
        let parts: Vec<&str> = text.split(sep).map(str::trim).filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            return (parts[0].to_string(), Some(parts[1].to_string()));
        }
    }
    (text.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn hit(title: &str, url: &str, content: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            url: url.into(),
            content: content.into(),
        }
    }

    async fn mock_search(status: StatusCode, body: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let app = Router::new().route(
            "/search",
            post(move |Json(req): Json<Value>| {
                let log = log.clone();
                let body = body.clone();
                async move {
                    log.lock().unwrap().push(req);
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/search", addr), seen)
    }

    fn source(endpoint: String, api_key: Option<&str>, queries: &[&str]) -> SearchApiSource {
        SearchApiSource::new(
            HttpClient::new(5, None, &[]).unwrap(),
            SearchApiConfig {
                endpoint,
                api_key: api_key.map(str::to_string),
                max_results: 10,
                search_depth: "basic".into(),
                queries: queries.iter().map(|q| q.to_string()).collect(),
                query_delay: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_posting_hit_becomes_listing() {
        let listing = listing_from_hit(
            &hit(
                "Senior Rust Engineer at Ferrous Systems",
                "https://boards.greenhouse.io/ferrous/jobs/123",
                "We are hiring a fully remote engineer.",
            ),
            "remote rust jobs",
        )
        .unwrap();
        assert_eq!(listing.title, "Senior Rust Engineer");
        assert_eq!(listing.company.as_deref(), Some("Ferrous Systems"));
        assert_eq!(listing.location.as_deref(), Some("Remote"));
        assert!(listing.is_remote);
        assert_eq!(listing.external_id.len(), 16);
    }

    #[test]
    fn test_aggregators_and_non_jobs_dropped() {
        assert!(listing_from_hit(
            &hit("Rust jobs - remote", "https://www.indeed.com/q-rust-jobs.html", "hiring now"),
            "q"
        )
        .is_none());
        let blog = hit(
            "Why Rust is great",
            "https://blog.example.com/careers-in-rust",
            "remote thoughts",
        );
        assert!(listing_from_hit(&blog, "q").is_none());
        let about = hit("Backend role", "https://example.com/about", "remote job");
        assert!(listing_from_hit(&about, "q").is_none());
        assert!(listing_from_hit(&hit("", "", ""), "q").is_none());
    }

    #[test]
    fn test_on_site_requires_canadian_hint() {
        let onsite = hit(
            "Platform Engineer - Shopify",
            "https://example.com/careers/1",
            "Hiring in Ottawa",
        );
        let listing = listing_from_hit(&onsite, "backend jobs").unwrap();
        assert!(!listing.is_remote);
        assert_eq!(listing.location.as_deref(), Some("Canada"));

        let elsewhere = hit(
            "Platform Engineer",
            "https://example.com/careers/2",
            "Hiring in Berlin",
        );
        assert!(listing_from_hit(&elsewhere, "backend jobs").is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let err = source("http://127.0.0.1:9/search".into(), None, &["q"])
            .fetch(&QueryParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_fetch_posts_each_query_and_dedups() {
        let (endpoint, seen) = mock_search(
            StatusCode::OK,
            json!({"results": [
                {
                    "title": "Rust Engineer at Acme",
                    "url": "https://jobs.lever.co/acme/1",
                    "content": "remote job"
                },
                {"title": "Rust news", "url": "https://news.example.com/a", "content": "nothing"}
            ]}),
        )
        .await;
        let listings = source(endpoint, Some("tvly-test"), &["one", "two"])
            .fetch(&QueryParams::default())
            .await
            .unwrap();
        assert_eq!(listings.len(), 1);

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["api_key"], "tvly-test");
        assert_eq!(requests[1]["query"], "two");
        assert_eq!(requests[0]["max_results"], 10);
        assert_eq!(requests[0]["include_raw_content"], false);
    }

    #[tokio::test]
    async fn test_query_params_override_configured_queries() {
        let (endpoint, seen) = mock_search(StatusCode::OK, json!({"results": []})).await;
        let params = QueryParams {
            queries: vec!["rust canada".into()],
            max_results: Some(3),
        };
        source(endpoint, Some("k"), &["a", "b"]).fetch(&params).await.unwrap();
        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["query"], "rust canada");
        assert_eq!(requests[0]["max_results"], 3);
    }

    #[tokio::test]
    async fn test_every_query_failing_fails_the_fetch() {
        let (endpoint, _) = mock_search(StatusCode::BAD_GATEWAY, json!({})).await;
        let err = source(endpoint, Some("k"), &["a", "b"])
            .fetch(&QueryParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::Request { .. }));
    }
}
