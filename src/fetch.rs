//! The fetch primitive and its default implementations.
//!
//! [`HttpFetch`] is the network implementation:
//! - Only URLs matching allowed origins can be fetched (empty list = any origin)
//! - Redirects only followed if they stay within the same origin
//! - The client is built eagerly, so a host without a usable HTTP stack fails
//!   when the fetcher is created rather than on first load
//!
//! [`MemoryFetch`] serves fixed responses from memory and counts requests.

use crate::error::FetchError;
use deno_core::futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

/// Response handed back by a [`Fetch`] implementation.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    /// Header names are lower-case.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Something that can turn a URL into a response.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchResponse, FetchError>>;
}

impl<F> Fetch for F
where
    F: Fn(&str) -> BoxFuture<'static, Result<FetchResponse, FetchError>> + Send + Sync,
{
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        self(url)
    }
}

/// Read a response as text.
///
/// Without `auto_decode` (or without a charset in `Content-Type`) the body is
/// read as UTF-8. Otherwise the declared charset (`gbk`, `shift_jis`, ...) is
/// used to decode it.
pub fn read_as_string(response: &FetchResponse, auto_decode: bool) -> Result<String, FetchError> {
    if !auto_decode {
        return Ok(response.text());
    }

    let Some(content_type) = response.header("content-type") else {
        return Ok(response.text());
    };

    let charset = content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
        .unwrap_or("utf-8");

    if charset.eq_ignore_ascii_case("utf-8") {
        return Ok(response.text());
    }

    let encoding = encoding_rs::Encoding::for_label(charset.as_bytes()).ok_or_else(|| {
        FetchError::Decode {
            url: response.url.clone(),
            charset: charset.to_string(),
        }
    })?;
    let (text, _, _) = encoding.decode(&response.body);
    Ok(text.into_owned())
}

// ============================================================================
// HTTP
// ============================================================================

/// Configuration for [`HttpFetch`]
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://cdn.example.com")
    /// An origin is scheme + host + port. Empty allows every origin.
    pub allowed_origins: Vec<String>,
    /// Maximum number of same-origin redirects followed per request
    pub max_redirects: usize,
    /// Per-request timeout (None = no timeout)
    pub timeout: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![],
            max_redirects: 5,
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Network fetcher backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetch {
    client: Client,
    config: Arc<FetchConfig>,
}

impl HttpFetch {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

impl Fetch for HttpFetch {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        let client = self.client.clone();
        let config = self.config.clone();
        let url = url.to_string();
        async move { do_fetch(&client, &config, url, 0).await }.boxed()
    }
}

/// Internal fetch implementation (called recursively for redirects)
fn do_fetch<'a>(
    client: &'a Client,
    config: &'a FetchConfig,
    request_url: String,
    redirects: usize,
) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
    async move {
        let network = |message: String| FetchError::Network {
            url: request_url.clone(),
            message,
        };

        let url = Url::parse(&request_url).map_err(|e| network(format!("invalid URL: {}", e)))?;

        if !config.is_origin_allowed(&url) {
            return Err(FetchError::Blocked {
                url: request_url.clone(),
                reason: format!(
                    "origin '{}' is not in the allowlist {:?}",
                    url.origin().ascii_serialization(),
                    config.allowed_origins
                ),
            });
        }

        let response = client
            .request(Method::GET, url.clone())
            .send()
            .await
            .map_err(|e| network(e.to_string()))?;

        let status = response.status();
        let final_url = response.url().clone();

        // Follow redirects manually - only same-origin
        if status.is_redirection() {
            if let Some(location) = response.headers().get("location") {
                let location = location
                    .to_str()
                    .map_err(|_| network("invalid redirect location".to_string()))?;
                let redirect_url = final_url
                    .join(location)
                    .map_err(|e| network(format!("invalid redirect URL: {}", e)))?;

                if redirect_url.origin() != url.origin() {
                    return Err(FetchError::Blocked {
                        url: request_url.clone(),
                        reason: format!(
                            "redirect to different origin '{}'",
                            redirect_url.origin().ascii_serialization()
                        ),
                    });
                }

                if redirects >= config.max_redirects {
                    return Err(network(format!(
                        "more than {} redirects",
                        config.max_redirects
                    )));
                }

                return do_fetch(client, config, redirect_url.to_string(), redirects + 1).await;
            }
        }

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.as_str().to_ascii_lowercase(), v.to_string());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| network(format!("failed to read response body: {}", e)))?;

        Ok(FetchResponse {
            url: final_url.to_string(),
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
    .boxed()
}

// ============================================================================
// Memory
// ============================================================================

/// In-memory fetcher: fixed responses per URL, 404 for anything else.
///
/// Every call is counted, which makes it the fetcher of choice for checking
/// cache behaviour. An optional delay keeps requests in flight long enough
/// for concurrent callers to overlap.
#[derive(Default)]
pub struct MemoryFetch {
    routes: Mutex<HashMap<String, FetchResponse>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Serve `body` with status 200 for `url`.
    pub fn route(self, url: &str, body: &str) -> Self {
        self.route_with_status(url, 200, body)
    }

    pub fn route_with_status(self, url: &str, status: u16, body: &str) -> Self {
        self.insert(FetchResponse {
            url: url.to_string(),
            status,
            headers: HashMap::new(),
            body: body.as_bytes().to_vec(),
        });
        self
    }

    /// Serve a full response (headers, raw bytes) for its `url`.
    pub fn route_response(self, response: FetchResponse) -> Self {
        self.insert(response);
        self
    }

    fn insert(&self, response: FetchResponse) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(response.url.clone(), response);
    }

    /// Number of requests issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Number of requests issued for any URL.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Fetch for MemoryFetch {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default() += 1;

        let response = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .unwrap_or_else(|| FetchResponse {
                url: url.to_string(),
                status: 404,
                ..FetchResponse::default()
            });
        let delay = self.delay;

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(response)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://cdn.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
            ..Default::default()
        };

        // Allowed
        assert!(config.is_origin_allowed(&Url::parse("https://cdn.example.com/app.js").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/index.html").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/app.js").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://cdn.example.com/app.js").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://cdn.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist_allows_everything() {
        let config = FetchConfig::default();
        assert!(config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[tokio::test]
    async fn test_blocked_origin_is_not_requested() {
        let fetch = HttpFetch::new(FetchConfig {
            allowed_origins: vec!["https://cdn.example.com".to_string()],
            ..Default::default()
        })
        .unwrap();

        let err = fetch.fetch("https://evil.com/app.js").await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked { .. }));
    }

    fn response_with(content_type: &str, body: Vec<u8>) -> FetchResponse {
        FetchResponse {
            url: "https://a.test/".into(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), content_type.to_string())]),
            body,
        }
    }

    #[test]
    fn test_read_as_string_decodes_declared_charset() {
        // "中文" in GBK
        let response = response_with("text/html; charset=gbk", vec![0xd6, 0xd0, 0xce, 0xc4]);
        assert_eq!(read_as_string(&response, true).unwrap(), "中文");
        // without auto decoding the bytes are read as UTF-8
        assert_ne!(read_as_string(&response, false).unwrap(), "中文");
    }

    #[test]
    fn test_read_as_string_unknown_charset() {
        let response = response_with("text/html; charset=klingon", b"qapla".to_vec());
        assert!(matches!(
            read_as_string(&response, true),
            Err(FetchError::Decode { .. })
        ));
    }

    #[test]
    fn test_read_as_string_defaults_to_utf8() {
        let response = response_with("text/html", "héllo".as_bytes().to_vec());
        assert_eq!(read_as_string(&response, true).unwrap(), "héllo");
    }

    #[tokio::test]
    async fn test_memory_fetch_counts_and_404s() {
        let fetch = MemoryFetch::new().route("https://a.test/a.js", "var a;");

        let ok = fetch.fetch("https://a.test/a.js").await.unwrap();
        assert_eq!(ok.text(), "var a;");
        let missing = fetch.fetch("https://a.test/b.js").await.unwrap();
        assert_eq!(missing.status, 404);

        assert_eq!(fetch.calls("https://a.test/a.js"), 1);
        assert_eq!(fetch.total_calls(), 2);
    }
}
