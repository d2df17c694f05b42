//! # html-entry
//!
//! Load a micro-frontend application from its HTML entry and run its scripts
//! inside a caller-supplied sandbox, using deno_core.
//!
//! ## What it does
//!
//! - **Template processing**: scripts and stylesheets are pulled out of the
//!   document and replaced by placeholder comments
//! - **Style inlining**: external stylesheets are fetched and embedded back
//!   into the template as `<style>` blocks
//! - **Ordered execution**: scripts run in document order with `window`,
//!   `self`, `globalThis` and `this` rebound to the sandbox proxy
//! - **Entry exports**: whatever the entry script puts on the proxy is
//!   returned as the application's exports
//! - **Shared fetches**: every URL is downloaded at most once per cache,
//!   however many callers ask for it concurrently
//!
//! ## Usage
//!
//! ```rust,ignore
//! use html_entry::{ExecHooks, FetchConfig, ImportOptions, Importer, RuntimeConfig, ScriptRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let importer = Importer::http(FetchConfig::default())?;
//!     let handle = importer
//!         .import_html("https://app.example.com/index.html", &ImportOptions::default())?
//!         .await?;
//!
//!     let mut runtime = ScriptRuntime::new(&RuntimeConfig::default())?;
//!     let proxy = runtime.create_proxy("Object.create(globalThis)")?;
//!     let exports = handle
//!         .exec_scripts(&mut runtime, &proxy, false, ExecHooks::default())
//!         .await?;
//!
//!     println!("{}", handle.template());
//!     println!("{:?}", exports.keys);
//!     Ok(())
//! }
//! ```

mod asset;
mod cache;
mod collect;
mod entry;
mod error;
mod fetch;
mod ops;
mod runtime;
mod scheduler;
pub mod template;
mod wrapper;

pub use asset::{inline_code, is_inline_code, AssetReference};
pub use cache::{FutureCache, ResourceCache, SharedFuture, SharedText};
pub use collect::{AssetFetcher, ErrorCallback, ScriptSource};
pub use entry::{
    descriptor_template, embed_styles, Entry, EntryDescriptor, EntryHandle, FetchOption,
    ImportOptions, Importer, PostProcessFn, PublicPathFn, TemplateFn,
};
pub use error::{Error, FetchError, Result};
pub use fetch::{read_as_string, Fetch, FetchConfig, FetchResponse, HttpFetch, MemoryFetch};
pub use ops::ConsoleOutput;
pub use runtime::{ExecutionResult, RuntimeConfig, SandboxProxy, ScriptError, ScriptRuntime};
pub use scheduler::{exec_scripts, AfterExec, BeforeExec, ExecHooks, ExecOptions};
pub use template::{process_tpl, Manifest};
pub use wrapper::{executable_script, PROXY_SLOT};
