//! Entry resolution: turn a document URL or a descriptor into an
//! [`EntryHandle`] ready to execute.

use crate::asset::AssetReference;
use crate::cache::ResourceCache;
use crate::collect::{AssetFetcher, ScriptSource};
use crate::error::{Error, FetchError};
use crate::fetch::{read_as_string, Fetch, FetchConfig, HttpFetch};
use crate::runtime::{ExecutionResult, SandboxProxy, ScriptRuntime};
use crate::scheduler::{exec_scripts, ExecHooks, ExecOptions};
use crate::template::{default_public_path, link_placeholder, process_tpl, script_placeholder, Manifest};
use deno_core::futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Asset lists given directly instead of through an HTML document.
///
/// At least one of `scripts` or `styles` must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EntryDescriptor {
    pub scripts: Option<Vec<AssetReference>>,
    pub styles: Option<Vec<AssetReference>>,
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Url(String),
    Descriptor(EntryDescriptor),
}

impl From<&str> for Entry {
    fn from(url: &str) -> Self {
        Entry::Url(url.to_string())
    }
}

impl From<EntryDescriptor> for Entry {
    fn from(descriptor: EntryDescriptor) -> Self {
        Entry::Descriptor(descriptor)
    }
}

/// Fetch override for a single import.
#[derive(Clone)]
pub struct FetchOption {
    pub fetch: Arc<dyn Fetch>,
    /// Decode the document with the charset of its `Content-Type`
    pub auto_decode_response: bool,
}

impl From<Arc<dyn Fetch>> for FetchOption {
    fn from(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch,
            auto_decode_response: false,
        }
    }
}

pub type PublicPathFn = Arc<dyn Fn(&Entry) -> String + Send + Sync>;
pub type TemplateFn = Arc<dyn Fn(String) -> String + Send + Sync>;
pub type PostProcessFn = Arc<dyn Fn(Manifest) -> Manifest + Send + Sync>;

#[derive(Clone, Default)]
pub struct ImportOptions {
    pub fetch: Option<FetchOption>,
    pub get_public_path: Option<PublicPathFn>,
    pub get_template: Option<TemplateFn>,
    pub post_process_template: Option<PostProcessFn>,
}

impl ImportOptions {
    fn public_path(&self, entry: &Entry) -> String {
        match (&self.get_public_path, entry) {
            (Some(get_public_path), _) => get_public_path(entry),
            (None, Entry::Url(url)) => default_public_path(url),
            (None, Entry::Descriptor(_)) => "/".to_string(),
        }
    }

    fn template(&self, html: String) -> String {
        match &self.get_template {
            Some(get_template) => get_template(html),
            None => html,
        }
    }
}

/// Loads entries through one fetch capability and one resource cache.
#[derive(Clone)]
pub struct Importer {
    fetch: Arc<dyn Fetch>,
    cache: Arc<ResourceCache>,
}

impl Importer {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self::with_cache(fetch, Arc::new(ResourceCache::new()))
    }

    pub fn with_cache(fetch: Arc<dyn Fetch>, cache: Arc<ResourceCache>) -> Self {
        Self { fetch, cache }
    }

    /// An importer over HTTP. Fails if the client cannot be built.
    pub fn http(config: FetchConfig) -> Result<Self, FetchError> {
        Ok(Self::new(Arc::new(HttpFetch::new(config)?)))
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Asset fetcher over this importer's fetch and cache, e.g. for prefetching.
    pub fn fetcher(&self) -> AssetFetcher {
        AssetFetcher::new(self.fetch.clone(), self.cache.clone())
    }

    fn resolve_fetch(&self, options: &ImportOptions) -> (Arc<dyn Fetch>, bool) {
        match &options.fetch {
            Some(option) => (option.fetch.clone(), option.auto_decode_response),
            None => (self.fetch.clone(), false),
        }
    }

    /// Load the HTML document at `url`.
    ///
    /// Concurrent and repeated imports of the same URL share one result,
    /// failures included.
    pub fn import_html(
        &self,
        url: &str,
        options: &ImportOptions,
    ) -> Result<BoxFuture<'static, Result<EntryHandle, Error>>, Error> {
        if url.is_empty() {
            return Err(Error::EmptyEntry);
        }

        let (fetch, auto_decode) = self.resolve_fetch(options);
        let fetcher = AssetFetcher::new(fetch.clone(), self.cache.clone());
        let options = options.clone();
        let url_owned = url.to_string();

        let document = self.cache.documents.get_or_insert_with(url, move || async move {
            let response = fetch.fetch(&url_owned).await?;
            if !response.ok() {
                tracing::warn!(url = %url_owned, status = response.status, "document responded with an error status");
            }
            let html = read_as_string(&response, auto_decode)?;

            let asset_public_path = options.public_path(&Entry::Url(url_owned.clone()));
            let mut manifest = process_tpl(&options.template(html), &asset_public_path)?;
            if let Some(post_process) = &options.post_process_template {
                manifest = post_process(manifest);
            }

            EntryHandle::build(fetcher, manifest, asset_public_path).await
        });

        Ok(document.boxed())
    }

    /// Load an entry given as a URL or as a descriptor.
    pub fn import_entry(
        &self,
        entry: Entry,
        options: &ImportOptions,
    ) -> Result<BoxFuture<'static, Result<EntryHandle, Error>>, Error> {
        let descriptor = match entry {
            Entry::Url(url) => return self.import_html(&url, options),
            Entry::Descriptor(descriptor) => descriptor,
        };
        if descriptor.scripts.is_none() && descriptor.styles.is_none() {
            return Err(Error::InvalidDescriptor);
        }

        let scripts = descriptor.scripts.clone().unwrap_or_default();
        let styles = descriptor.styles.clone().unwrap_or_default();
        let html = descriptor.html.clone().unwrap_or_default();

        let template = options.template(descriptor_template(&html, &styles, &scripts));
        let asset_public_path = options.public_path(&Entry::Descriptor(descriptor));
        let manifest = Manifest {
            template,
            entry: scripts.last().cloned(),
            scripts,
            styles,
        };

        let (fetch, _) = self.resolve_fetch(options);
        let fetcher = AssetFetcher::new(fetch, self.cache.clone());
        Ok(EntryHandle::build(fetcher, manifest, asset_public_path).boxed())
    }
}

/// `html` with a link placeholder per style before it and a script
/// placeholder per script after it.
pub fn descriptor_template(
    html: &str,
    styles: &[AssetReference],
    scripts: &[AssetReference],
) -> String {
    let with_styles = styles.iter().rev().fold(html.to_string(), |html, style| {
        format!("{}{}", link_placeholder(style.src(), false), html)
    });
    scripts.iter().fold(with_styles, |html, script| {
        format!("{}{}", html, script_placeholder(script.src(), script.is_async()))
    })
}

/// Replace each style placeholder with the style text it stands for.
pub fn embed_styles(template: &str, styles: &[AssetReference], sheets: &[String]) -> String {
    styles
        .iter()
        .zip(sheets)
        .fold(template.to_string(), |html, (style, sheet)| {
            let src = style.src();
            html.replacen(
                &link_placeholder(src, false),
                &format!("<style>/* {} */{}</style>", src, sheet),
                1,
            )
        })
}

struct HandleInner {
    template: String,
    asset_public_path: String,
    manifest: Manifest,
    fetcher: AssetFetcher,
}

/// A resolved entry: its template with styles embedded, and its scripts.
#[derive(Clone)]
pub struct EntryHandle(Arc<HandleInner>);

impl EntryHandle {
    async fn build(
        fetcher: AssetFetcher,
        manifest: Manifest,
        asset_public_path: String,
    ) -> Result<EntryHandle, Error> {
        let sheets = fetcher.get_external_style_sheets(&manifest.styles).await?;
        let template = embed_styles(&manifest.template, &manifest.styles, &sheets);

        Ok(EntryHandle(Arc::new(HandleInner {
            template,
            asset_public_path,
            manifest,
            fetcher,
        })))
    }

    pub fn template(&self) -> &str {
        &self.0.template
    }

    pub fn asset_public_path(&self) -> &str {
        &self.0.asset_public_path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.0.manifest
    }

    pub async fn get_external_scripts(&self) -> Result<Vec<ScriptSource>, FetchError> {
        self.0
            .fetcher
            .get_external_scripts(&self.0.manifest.scripts, None)
            .await
    }

    pub async fn get_external_style_sheets(&self) -> Result<Vec<String>, FetchError> {
        self.0
            .fetcher
            .get_external_style_sheets(&self.0.manifest.styles)
            .await
    }

    /// Run the entry's scripts against `proxy`.
    pub async fn exec_scripts(
        &self,
        runtime: &mut ScriptRuntime,
        proxy: &SandboxProxy,
        strict_global: bool,
        hooks: ExecHooks,
    ) -> Result<ExecutionResult, Error> {
        self.exec_scripts_with(
            runtime,
            proxy,
            ExecOptions {
                strict_global,
                hooks,
                on_error: None,
            },
        )
        .await
    }

    pub async fn exec_scripts_with(
        &self,
        runtime: &mut ScriptRuntime,
        proxy: &SandboxProxy,
        options: ExecOptions,
    ) -> Result<ExecutionResult, Error> {
        let manifest = &self.0.manifest;
        if manifest.scripts.is_empty() {
            return Ok(ExecutionResult::default());
        }

        exec_scripts(
            runtime,
            &self.0.fetcher,
            manifest.entry.as_ref(),
            &manifest.scripts,
            proxy,
            options,
        )
        .await
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("asset_public_path", &self.0.asset_public_path)
            .field("manifest", &self.0.manifest)
            .finish_non_exhaustive()
    }
}
