use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, ClientBuilder, Proxy, Response};
use serde::Serialize;

const DEFAULT_USER_AGENT: &str = concat!("jobintel/", env!("CARGO_PKG_VERSION"));

/// Shared outbound client for search providers and link checks.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client,
    default_timeout: Duration,
    default_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(
        timeout_seconds: u64,
        proxy_url: Option<&str>,
        custom_headers: &[(String, String)],
    ) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(timeout_seconds);

        let mut builder = ClientBuilder::new().timeout(timeout);
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        let inner = builder.build()?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        for (key, val) in custom_headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(val))
            {
                default_headers.insert(name, value);
            }
        }

        Ok(Self {
            inner,
            default_timeout: timeout,
            default_headers,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Response, reqwest::Error> {
        self.inner
            .post(url)
            .headers(self.default_headers.clone())
            .json(body)
            .timeout(self.default_timeout)
            .send()
            .await
    }

    /// HEAD with a short timeout, following redirects.
    pub async fn head(&self, url: &str, timeout: Duration) -> Result<Response, reqwest::Error> {
        self.inner
            .head(url)
            .headers(self.default_headers.clone())
            .timeout(timeout.min(self.default_timeout))
            .send()
            .await
    }
}
