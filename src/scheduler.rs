//! Ordered execution of an entry's scripts against one sandbox proxy.
//!
//! Scripts run strictly in document order. Only the entry script can fail the
//! whole execution; any other script that throws is reported on the runtime
//! and skipped. `async` scripts never block the sequence: they are queued on
//! the runtime and run by [`ScriptRuntime::run_deferred_scripts`] once their
//! content arrives.

use crate::asset::{is_inline_code, AssetReference};
use crate::cache::SharedText;
use crate::collect::{AssetFetcher, ErrorCallback, ScriptSource};
use crate::error::Error;
use crate::runtime::{ExecutionResult, SandboxProxy, ScriptRuntime};
use crate::wrapper::{executable_script, PROXY_SLOT};
use deno_core::futures::stream::{FuturesUnordered, StreamExt};
use std::rc::Rc;

/// Rewrites a script before it runs. Receives `(text, src)`; `None` keeps the
/// text as is.
pub type BeforeExec = Rc<dyn Fn(&str, &str) -> Option<String>>;

/// Observes a script after it ran without throwing. Receives `(text, src)`.
pub type AfterExec = Rc<dyn Fn(&str, &str)>;

#[derive(Clone, Default)]
pub struct ExecHooks {
    pub before_exec: Option<BeforeExec>,
    pub after_exec: Option<AfterExec>,
}

impl ExecHooks {
    pub fn before_exec(mut self, hook: impl Fn(&str, &str) -> Option<String> + 'static) -> Self {
        self.before_exec = Some(Rc::new(hook));
        self
    }

    pub fn after_exec(mut self, hook: impl Fn(&str, &str) + 'static) -> Self {
        self.after_exec = Some(Rc::new(hook));
        self
    }
}

#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Also route bare identifiers through the proxy (`with(window)`)
    pub strict_global: bool,
    pub hooks: ExecHooks,
    /// Told about scripts that failed to load
    pub on_error: Option<ErrorCallback>,
}

/// An `async` script queued until its content is available.
pub(crate) struct DeferredScript {
    src: String,
    content: SharedText,
    proxy: SandboxProxy,
    strict_global: bool,
    hooks: ExecHooks,
}

fn script_label(src: &str) -> &str {
    if is_inline_code(src) {
        "<inline script>"
    } else {
        src
    }
}

/// Wrap and evaluate a single script against `proxy`.
fn evaluate_script(
    runtime: &mut ScriptRuntime,
    src: &str,
    text: &str,
    proxy: &SandboxProxy,
    strict_global: bool,
    hooks: &ExecHooks,
    run_after_exec: bool,
) -> Result<(), String> {
    let _span = tracing::debug_span!("evaluate", src = script_label(src)).entered();

    let code = hooks
        .before_exec
        .as_ref()
        .and_then(|hook| hook(text, src))
        .unwrap_or_else(|| text.to_string());
    let wrapped = executable_script(src, &code, PROXY_SLOT, strict_global);

    runtime.bind_proxy(proxy).map_err(|e| e.to_string())?;
    runtime.eval_code(src, &wrapped)?;

    if run_after_exec {
        if let Some(hook) = &hooks.after_exec {
            hook(text, src);
        }
    }
    Ok(())
}

fn exec_entry(
    runtime: &mut ScriptRuntime,
    src: &str,
    text: &str,
    proxy: &SandboxProxy,
    options: &ExecOptions,
) -> Result<ExecutionResult, Error> {
    runtime.bind_proxy(proxy)?;
    runtime.note_global_props()?;

    evaluate_script(
        runtime,
        src,
        text,
        proxy,
        options.strict_global,
        &options.hooks,
        true,
    )
    .map_err(|message| {
        tracing::error!(src = script_label(src), error = %message, "error occurs while executing entry script");
        Error::EntryScript {
            src: src.to_string(),
            message,
        }
    })?;

    runtime.read_exports()
}

/// Fetch `scripts` and run them in order against `proxy`.
///
/// Resolves with what `entry` exported once every non-`async` script has run.
/// Without an entry, or when the entry is not among `scripts`, resolves with
/// an empty result. Fails if a script cannot be fetched or the entry throws;
/// nothing after a throwing entry runs.
pub async fn exec_scripts(
    runtime: &mut ScriptRuntime,
    fetcher: &AssetFetcher,
    entry: Option<&AssetReference>,
    scripts: &[AssetReference],
    proxy: &SandboxProxy,
    options: ExecOptions,
) -> Result<ExecutionResult, Error> {
    let sources = fetcher
        .get_external_scripts(scripts, options.on_error.clone())
        .await?;

    let mut result = ExecutionResult::default();
    for (reference, source) in scripts.iter().zip(sources) {
        let is_entry = entry == Some(reference);

        match source {
            ScriptSource::Text(text) if is_entry => {
                result = exec_entry(runtime, reference.src(), &text, proxy, &options)?;
            }
            ScriptSource::Text(text) => {
                let src = reference.src();
                if let Err(message) = evaluate_script(
                    runtime,
                    src,
                    &text,
                    proxy,
                    options.strict_global,
                    &options.hooks,
                    true,
                ) {
                    runtime.report_script_error(src, message);
                }
            }
            // an async entry still has to finish before anything after it
            ScriptSource::Async { src, content } if is_entry => {
                let text = content.await?;
                result = exec_entry(runtime, &src, &text, proxy, &options)?;
            }
            ScriptSource::Async { src, content } => {
                tracing::debug!(src = %src, "deferring async script");
                runtime.deferred.push(DeferredScript {
                    src,
                    content,
                    proxy: proxy.clone(),
                    strict_global: options.strict_global,
                    hooks: options.hooks.clone(),
                });
            }
        }
    }

    Ok(result)
}

impl ScriptRuntime {
    /// Run queued `async` scripts as their content arrives.
    ///
    /// Failures are reported like any other non-entry script and never stop
    /// the remaining ones. Returns how many scripts ran successfully.
    pub async fn run_deferred_scripts(&mut self) -> usize {
        let mut pending: FuturesUnordered<_> = std::mem::take(&mut self.deferred)
            .into_iter()
            .map(|script| async move {
                let content = script.content.clone().await;
                (script, content)
            })
            .collect();

        let mut executed = 0;
        while let Some((script, content)) = pending.next().await {
            let outcome = content.map_err(|e| e.to_string()).and_then(|text| {
                evaluate_script(
                    self,
                    &script.src,
                    &text,
                    &script.proxy,
                    script.strict_global,
                    &script.hooks,
                    false,
                )
            });

            match outcome {
                Ok(()) => executed += 1,
                Err(message) => self.report_script_error(&script.src, message),
            }
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;
    use crate::fetch::MemoryFetch;
    use crate::runtime::RuntimeConfig;
    use std::cell::RefCell;
    use std::sync::Arc;

    fn setup(fetch: MemoryFetch) -> (ScriptRuntime, AssetFetcher, SandboxProxy) {
        let mut runtime = ScriptRuntime::new(&RuntimeConfig::default()).unwrap();
        let proxy = runtime.create_proxy("Object.create(globalThis)").unwrap();
        let fetcher = AssetFetcher::new(Arc::new(fetch), Arc::new(ResourceCache::new()));
        (runtime, fetcher, proxy)
    }

    #[tokio::test]
    async fn test_scripts_run_in_order_against_proxy() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new()
                .route("https://a.test/a.js", "window.order = ['a'];")
                .route("https://a.test/b.js", "window.order.push('b');"),
        );
        let scripts: Vec<AssetReference> = vec![
            "https://a.test/a.js".into(),
            "<script>self.order.push('inline')</script>".into(),
            "https://a.test/b.js".into(),
        ];

        let result = exec_scripts(
            &mut runtime,
            &fetcher,
            None,
            &scripts,
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap();

        assert!(result.is_empty());
        runtime.bind_proxy(&proxy).unwrap();
        let order: Vec<String> = runtime.evaluate("globalThis.proxy.order").unwrap();
        assert_eq!(order, vec!["a", "inline", "b"]);
        let leaked: bool = runtime
            .evaluate("Object.prototype.hasOwnProperty.call(globalThis, 'order')")
            .unwrap();
        assert!(!leaked);
    }

    #[tokio::test]
    async fn test_non_entry_failure_is_reported_and_skipped() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new()
                .route("https://a.test/bad.js", "throw new Error('bad script')")
                .route("https://a.test/main.js", "window.app = { mount() {} };"),
        );
        let scripts: Vec<AssetReference> = vec![
            "https://a.test/bad.js".into(),
            "https://a.test/main.js".into(),
        ];

        let result = exec_scripts(
            &mut runtime,
            &fetcher,
            scripts.last(),
            &scripts,
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.name.as_deref(), Some("app"));
        assert_eq!(result.keys, vec!["mount"]);
        let errors = runtime.take_script_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].src, "https://a.test/bad.js");
        assert!(errors[0].message.contains("bad script"));
    }

    #[tokio::test]
    async fn test_entry_failure_stops_execution() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new()
                .route("https://a.test/main.js", "throw new Error('entry broke')")
                .route("https://a.test/after.js", "window.after = true;"),
        );
        let scripts: Vec<AssetReference> = vec![
            "https://a.test/main.js".into(),
            "https://a.test/after.js".into(),
        ];

        let err = exec_scripts(
            &mut runtime,
            &fetcher,
            scripts.first(),
            &scripts,
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap_err();

        match err {
            Error::EntryScript { src, message } => {
                assert_eq!(src, "https://a.test/main.js");
                assert!(message.contains("entry broke"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        runtime.bind_proxy(&proxy).unwrap();
        let after: bool = runtime
            .evaluate("Object.prototype.hasOwnProperty.call(globalThis.proxy, 'after')")
            .unwrap();
        assert!(!after);
    }

    #[tokio::test]
    async fn test_hooks_rewrite_and_observe() {
        let (mut runtime, fetcher, proxy) =
            setup(MemoryFetch::new().route("https://a.test/a.js", "window.value = 1;"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let observed = seen.clone();
        let hooks = ExecHooks::default()
            .before_exec(|text, _src| Some(text.replace("1", "2")))
            .after_exec(move |text, src| observed.borrow_mut().push((text.to_string(), src.to_string())));

        exec_scripts(
            &mut runtime,
            &fetcher,
            None,
            &["https://a.test/a.js".into()],
            &proxy,
            ExecOptions {
                hooks,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        runtime.bind_proxy(&proxy).unwrap();
        let value: u32 = runtime.evaluate("globalThis.proxy.value").unwrap();
        assert_eq!(value, 2);
        assert_eq!(
            *seen.borrow(),
            vec![("window.value = 1;".to_string(), "https://a.test/a.js".to_string())]
        );
    }

    #[tokio::test]
    async fn test_async_scripts_run_after_resolution() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new()
                .route("https://a.test/late.js", "window.late = true;")
                .route("https://a.test/broken.js", "throw new Error('late failure')")
                .route("https://a.test/main.js", "window.app = { bootstrap() {} };"),
        );
        let scripts = vec![
            AssetReference::async_script("https://a.test/late.js"),
            AssetReference::async_script("https://a.test/broken.js"),
            "https://a.test/main.js".into(),
        ];

        let result = exec_scripts(
            &mut runtime,
            &fetcher,
            scripts.last(),
            &scripts,
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.name.as_deref(), Some("app"));
        assert_eq!(runtime.pending_deferred_scripts(), 2);

        assert_eq!(runtime.run_deferred_scripts().await, 1);
        assert_eq!(runtime.pending_deferred_scripts(), 0);
        let errors = runtime.take_script_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].src, "https://a.test/broken.js");

        runtime.bind_proxy(&proxy).unwrap();
        let late: bool = runtime.evaluate("globalThis.proxy.late").unwrap();
        assert!(late);
    }

    #[tokio::test]
    async fn test_fetch_failure_rejects() {
        let (mut runtime, fetcher, proxy) = setup(MemoryFetch::new());

        let err = exec_scripts(
            &mut runtime,
            &fetcher,
            None,
            &["https://a.test/missing.js".into()],
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn test_async_entry_runs_in_order() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::with_delay(std::time::Duration::from_millis(5))
                .route("https://a.test/main.js", "console.log('main'); window.app = {};")
                .route("https://a.test/after.js", "console.log('after');"),
        );
        let scripts = vec![
            AssetReference::async_script("https://a.test/main.js"),
            "https://a.test/after.js".into(),
        ];

        let result = exec_scripts(
            &mut runtime,
            &fetcher,
            scripts.first(),
            &scripts,
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.name.as_deref(), Some("app"));
        assert_eq!(runtime.pending_deferred_scripts(), 0);
        assert_eq!(runtime.take_console_output().logs, vec!["main", "after"]);
    }

    #[tokio::test]
    async fn test_missing_entry_resolves_empty() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new().route("https://a.test/a.js", "console.log('a'); window.app = {};"),
        );
        let absent = AssetReference::Url("https://a.test/other.js".into());

        let result = exec_scripts(
            &mut runtime,
            &fetcher,
            Some(&absent),
            &["https://a.test/a.js".into()],
            &proxy,
            ExecOptions::default(),
        )
        .await
        .unwrap();

        assert!(result.is_empty());
        assert!(result.exports.is_none());
        assert_eq!(runtime.take_console_output().logs, vec!["a"]);
    }

    #[tokio::test]
    async fn test_after_exec_skips_deferred_scripts() {
        let (mut runtime, fetcher, proxy) = setup(
            MemoryFetch::new()
                .route("https://a.test/late.js", "console.log('late');")
                .route("https://a.test/main.js", "window.app = {};"),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let observed = seen.clone();
        let hooks = ExecHooks::default().after_exec(move |_text, src| observed.borrow_mut().push(src.to_string()));
        let scripts = vec![
            AssetReference::async_script("https://a.test/late.js"),
            "https://a.test/main.js".into(),
        ];

        exec_scripts(
            &mut runtime,
            &fetcher,
            scripts.last(),
            &scripts,
            &proxy,
            ExecOptions {
                hooks,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(runtime.run_deferred_scripts().await, 1);

        assert_eq!(runtime.take_console_output().logs, vec!["late"]);
        assert_eq!(*seen.borrow(), vec!["https://a.test/main.js".to_string()]);
    }
}
