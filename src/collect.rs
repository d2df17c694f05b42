//! Resolve ordered asset references to their source text.

use crate::asset::{inline_code, AssetReference};
use crate::cache::{ResourceCache, SharedText};
use crate::error::FetchError;
use crate::fetch::Fetch;
use deno_core::futures::future::{try_join_all, FutureExt};
use std::fmt;
use std::sync::Arc;

/// Called once per failing script fetch (status >= 400 or network error).
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// A collected script.
#[derive(Clone)]
pub enum ScriptSource {
    Text(String),
    /// An `async` script whose content arrives independently of the others.
    Async { src: String, content: SharedText },
}

impl ScriptSource {
    pub fn text(&self) -> Option<&str> {
        match self {
            ScriptSource::Text(text) => Some(text),
            ScriptSource::Async { .. } => None,
        }
    }
}

impl fmt::Debug for ScriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptSource::Text(text) => f.debug_tuple("Text").field(text).finish(),
            ScriptSource::Async { src, .. } => f
                .debug_struct("Async")
                .field("src", src)
                .finish_non_exhaustive(),
        }
    }
}

/// Fetches styles and scripts through a shared [`ResourceCache`].
#[derive(Clone)]
pub struct AssetFetcher {
    fetch: Arc<dyn Fetch>,
    cache: Arc<ResourceCache>,
}

impl AssetFetcher {
    pub fn new(fetch: Arc<dyn Fetch>, cache: Arc<ResourceCache>) -> Self {
        Self { fetch, cache }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    fn fetch_style(&self, url: &str) -> SharedText {
        let fetch = self.fetch.clone();
        let url_owned = url.to_string();
        self.cache.styles.get_or_insert_with(url, move || async move {
            fetch.fetch(&url_owned).await.map(|response| response.text())
        })
    }

    fn fetch_script(&self, url: &str, on_error: Option<ErrorCallback>) -> SharedText {
        let fetch = self.fetch.clone();
        let url_owned = url.to_string();
        self.cache.scripts.get_or_insert_with(url, move || async move {
            // browsers treat 4xx and 5xx script responses as load errors
            let result = match fetch.fetch(&url_owned).await {
                Ok(response) if response.status >= 400 => Err(FetchError::Status {
                    url: url_owned,
                    status: response.status,
                }),
                Ok(response) => Ok(response.text()),
                Err(e) => Err(e),
            };

            if let Err(e) = &result {
                tracing::warn!(error = %e, "script load failed");
                if let Some(on_error) = &on_error {
                    on_error(e);
                }
            }
            result
        })
    }

    /// Start fetching an async script once the host yields.
    fn fetch_script_when_idle(&self, url: &str, on_error: Option<ErrorCallback>) -> SharedText {
        let fetcher = self.clone();
        let url = url.to_string();
        let task_url = url.clone();
        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            fetcher.fetch_script(&task_url, on_error).await
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(FetchError::Network {
                    url,
                    message: e.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    /// Texts of `styles`, in order.
    pub async fn get_external_style_sheets(
        &self,
        styles: &[AssetReference],
    ) -> Result<Vec<String>, FetchError> {
        let pending: Vec<_> = styles
            .iter()
            .map(|style| {
                let fetched = match style {
                    AssetReference::Inline(tag) => Err(inline_code(tag).to_string()),
                    other => Ok(self.fetch_style(other.src())),
                };
                async move {
                    match fetched {
                        Ok(shared) => shared.await,
                        Err(inline) => Ok(inline),
                    }
                }
            })
            .collect();

        try_join_all(pending).await
    }

    /// Sources of `scripts`, in order.
    ///
    /// Must run inside a tokio runtime: `async` scripts are fetched from a
    /// spawned task and returned unresolved.
    pub async fn get_external_scripts(
        &self,
        scripts: &[AssetReference],
        on_error: Option<ErrorCallback>,
    ) -> Result<Vec<ScriptSource>, FetchError> {
        let pending: Vec<_> = scripts
            .iter()
            .map(|script| {
                let source = match script {
                    AssetReference::Inline(tag) => {
                        Pending::Ready(ScriptSource::Text(inline_code(tag).to_string()))
                    }
                    AssetReference::Url(src) => {
                        Pending::Fetch(self.fetch_script(src, on_error.clone()))
                    }
                    AssetReference::Async { src } => Pending::Ready(ScriptSource::Async {
                        src: src.clone(),
                        content: self.fetch_script_when_idle(src, on_error.clone()),
                    }),
                };
                async move {
                    match source {
                        Pending::Ready(source) => Ok(source),
                        Pending::Fetch(shared) => shared.await.map(ScriptSource::Text),
                    }
                }
            })
            .collect();

        try_join_all(pending).await
    }

    /// Warm the style cache. Failures are logged, not returned.
    pub async fn prefetch_style_sheets(&self, styles: &[AssetReference]) {
        tokio::task::yield_now().await;
        if let Err(e) = self.get_external_style_sheets(styles).await {
            tracing::warn!(error = %e, "style prefetch failed");
        }
    }

    /// Warm the script cache. Failures are logged, not returned.
    pub async fn prefetch_scripts(&self, scripts: &[AssetReference]) {
        tokio::task::yield_now().await;
        if let Err(e) = self.get_external_scripts(scripts, None).await {
            tracing::warn!(error = %e, "script prefetch failed");
        }
    }
}

enum Pending {
    Ready(ScriptSource),
    Fetch(SharedText),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fetcher(fetch: MemoryFetch) -> (Arc<MemoryFetch>, AssetFetcher) {
        let fetch = Arc::new(fetch);
        let fetcher = AssetFetcher::new(fetch.clone(), Arc::new(ResourceCache::new()));
        (fetch, fetcher)
    }

    #[tokio::test]
    async fn test_styles_keep_input_order() {
        let (_, fetcher) = fetcher(
            MemoryFetch::with_delay(Duration::from_millis(5))
                .route("https://a.test/a.css", ".a{}")
                .route("https://a.test/b.css", ".b{}"),
        );

        let sheets = fetcher
            .get_external_style_sheets(&[
                "https://a.test/b.css".into(),
                "<style>.inline{}</style>".into(),
                "https://a.test/a.css".into(),
            ])
            .await
            .unwrap();

        assert_eq!(sheets, vec![".b{}", ".inline{}", ".a{}"]);
    }

    #[tokio::test]
    async fn test_concurrent_script_requests_fetch_once() {
        let (fetch, fetcher) = fetcher(
            MemoryFetch::with_delay(Duration::from_millis(10)).route("https://a.test/app.js", "1"),
        );
        let scripts: Vec<AssetReference> = vec!["https://a.test/app.js".into()];

        let (a, b, c) = tokio::join!(
            fetcher.get_external_scripts(&scripts, None),
            fetcher.get_external_scripts(&scripts, None),
            fetcher.get_external_scripts(&scripts, None),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(fetch.calls("https://a.test/app.js"), 1);
    }

    #[tokio::test]
    async fn test_failed_status_reports_once_and_is_not_retried() {
        let (fetch, fetcher) = fetcher(
            MemoryFetch::new().route_with_status("https://a.test/broken.js", 500, "oops"),
        );
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let on_error: ErrorCallback = Arc::new(move |_: &FetchError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let scripts: Vec<AssetReference> = vec!["https://a.test/broken.js".into()];

        let first = fetcher
            .get_external_scripts(&scripts, Some(on_error.clone()))
            .await
            .unwrap_err();
        assert_eq!(
            first,
            FetchError::Status {
                url: "https://a.test/broken.js".into(),
                status: 500
            }
        );
        assert_eq!(reported.load(Ordering::SeqCst), 1);

        let second = fetcher.get_external_scripts(&scripts, Some(on_error)).await;
        assert!(second.is_err());
        assert_eq!(fetch.calls("https://a.test/broken.js"), 1);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_script_is_returned_unresolved() {
        let (fetch, fetcher) = fetcher(
            MemoryFetch::new()
                .route("https://a.test/main.js", "main")
                .route("https://a.test/late.js", "late"),
        );

        let sources = fetcher
            .get_external_scripts(
                &[
                    "https://a.test/main.js".into(),
                    AssetReference::async_script("https://a.test/late.js"),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(sources[0].text(), Some("main"));
        let ScriptSource::Async { src, content } = &sources[1] else {
            panic!("expected an async source");
        };
        assert_eq!(src, "https://a.test/late.js");
        assert_eq!(content.clone().await.unwrap(), "late");
        assert_eq!(fetch.calls("https://a.test/late.js"), 1);
    }

    #[tokio::test]
    async fn test_prefetch_warms_cache() {
        let (fetch, fetcher) = fetcher(
            MemoryFetch::new()
                .route("https://a.test/a.css", ".a{}")
                .route("https://a.test/a.js", "1"),
        );

        fetcher.prefetch_style_sheets(&["https://a.test/a.css".into()]).await;
        fetcher.prefetch_scripts(&["https://a.test/a.js".into()]).await;
        fetcher.prefetch_scripts(&["https://a.test/missing.js".into()]).await;

        assert!(fetcher.cache().styles.contains("https://a.test/a.css"));
        assert!(fetcher.cache().scripts.contains("https://a.test/a.js"));

        fetcher
            .get_external_scripts(&["https://a.test/a.js".into()], None)
            .await
            .unwrap();
        assert_eq!(fetch.total_calls(), 3);
    }
}
