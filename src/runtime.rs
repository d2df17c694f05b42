//! Script runtime - the V8 isolate application scripts are evaluated in.
//!
//! Provides only what the loader needs:
//! - console.log/warn/error (captured, not printed)
//! - `window` / `self` aliases of the real global object
//! - the proxy slot the code wrapper reads the current sandbox from
//! - bookkeeping of own properties to find what an entry script exported
//!
//! Sandboxes themselves are plain JS objects supplied by the caller; see
//! [`SandboxProxy`].

use crate::error::Error;
use crate::ops::{html_entry_runtime, ConsoleOutput};
use crate::scheduler::DeferredScript;
use crate::wrapper::PROXY_SLOT;
use deno_core::{serde_v8, v8, JsRuntime, RuntimeOptions};
use serde::de::DeserializeOwned;
use std::fmt;

/// Configuration for the script runtime
pub struct RuntimeConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
        }
    }
}

/// A caller-supplied object standing in for the global object.
///
/// The runtime never creates isolation of its own: whatever object is passed
/// here receives the writes scripts make through `window`, `self` and `this`.
/// Use one proxy per application instance.
#[derive(Clone)]
pub struct SandboxProxy {
    object: v8::Global<v8::Object>,
}

impl SandboxProxy {
    pub fn from_global(object: v8::Global<v8::Object>) -> Self {
        Self { object }
    }

    pub fn as_global(&self) -> &v8::Global<v8::Object> {
        &self.object
    }
}

/// A script failure that was reported instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub src: String,
    pub message: String,
}

/// What the entry script left on the sandbox proxy.
#[derive(Clone, Default)]
pub struct ExecutionResult {
    /// Name of the property the entry script exported, if one was detected
    pub name: Option<String>,
    /// Own enumerable keys of the exported value
    pub keys: Vec<String>,
    /// The exported value; `None` stands for an empty namespace
    pub exports: Option<v8::Global<v8::Value>>,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.keys.is_empty()
    }
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("has_exports", &self.exports.is_some())
            .finish()
    }
}

/// A JS runtime prepared for running application scripts.
pub struct ScriptRuntime {
    js: JsRuntime,
    pub(crate) deferred: Vec<DeferredScript>,
    script_errors: Vec<ScriptError>,
}

impl ScriptRuntime {
    /// Create a runtime with the console capture extension loaded.
    pub fn new(config: &RuntimeConfig) -> Result<Self, Error> {
        // Configure V8 heap limits if specified
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut js = JsRuntime::new(RuntimeOptions {
            extensions: vec![html_entry_runtime::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        if config.max_heap_size.is_some() {
            js.add_near_heap_limit_callback(|current, initial| {
                // Keep the limit: V8 raises an out-of-memory error instead of growing
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "near heap limit"
                );
                current
            });
        }

        js.op_state().borrow_mut().put(ConsoleOutput::default());

        Ok(Self {
            js,
            deferred: Vec::new(),
            script_errors: Vec::new(),
        })
    }

    /// The underlying `deno_core` runtime.
    pub fn js_runtime(&mut self) -> &mut JsRuntime {
        &mut self.js
    }

    /// Evaluate `expression` and keep the resulting object as a sandbox proxy.
    ///
    /// ```rust,ignore
    /// let proxy = runtime.create_proxy("Object.create(globalThis)")?;
    /// ```
    pub fn create_proxy(&mut self, expression: &str) -> Result<SandboxProxy, Error> {
        let value = self
            .js
            .execute_script("[html-entry:proxy]", format!("({})", expression))
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let scope = &mut self.js.handle_scope();
        let local = v8::Local::new(scope, &value);
        let object = v8::Local::<v8::Object>::try_from(local)
            .map_err(|_| Error::Runtime("sandbox proxy must be an object".into()))?;

        Ok(SandboxProxy {
            object: v8::Global::new(scope, object),
        })
    }

    /// Evaluate a script and deserialize its completion value.
    pub fn evaluate<T: DeserializeOwned>(&mut self, code: &str) -> Result<T, Error> {
        let value = self
            .js
            .execute_script("[html-entry:evaluate]", code.to_string())
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let scope = &mut self.js.handle_scope();
        let local = v8::Local::new(scope, &value);
        serde_v8::from_v8(scope, local).map_err(|e| Error::Runtime(e.to_string()))
    }

    /// Point the global proxy slot at `proxy`.
    ///
    /// Always the top-level global: wrappers compiled from inside another
    /// sandboxed script still look the proxy up there.
    pub(crate) fn bind_proxy(&mut self, proxy: &SandboxProxy) -> Result<(), Error> {
        let scope = &mut self.js.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);
        let key = v8::String::new(scope, PROXY_SLOT)
            .ok_or_else(|| Error::Runtime("failed to allocate proxy slot name".into()))?;
        let value = v8::Local::new(scope, &proxy.object);

        global
            .set(scope, key.into(), value.into())
            .ok_or_else(|| Error::Runtime("failed to bind sandbox proxy".into()))?;
        Ok(())
    }

    /// Run wrapped code. The compiled wrapper is reused per `src` until `code` changes.
    ///
    /// Returns the thrown exception as text.
    pub(crate) fn eval_code(&mut self, src: &str, code: &str) -> Result<(), String> {
        let call = format!(
            "globalThis.__htmlEntry.evalCode({}, {})",
            json_string(src),
            json_string(code)
        );
        self.js
            .execute_script("[html-entry:eval]", call)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Remember the own properties of the bound proxy before the entry runs.
    pub(crate) fn note_global_props(&mut self) -> Result<(), Error> {
        self.js
            .execute_script(
                "[html-entry:note]",
                format!("globalThis.__htmlEntry.noteGlobalProps(globalThis.{})", PROXY_SLOT),
            )
            .map(|_| ())
            .map_err(|e| Error::Runtime(e.to_string()))
    }

    /// Read what the entry script exported onto the bound proxy.
    pub(crate) fn read_exports(&mut self) -> Result<ExecutionResult, Error> {
        let name: Option<String> = self.evaluate(&format!(
            "globalThis.__htmlEntry.getGlobalProp(globalThis.{})",
            PROXY_SLOT
        ))?;
        let Some(name) = name else {
            return Ok(ExecutionResult::default());
        };

        let target = format!("(globalThis.{}[{}] || {{}})", PROXY_SLOT, json_string(&name));
        let exports = self
            .js
            .execute_script("[html-entry:exports]", target.clone())
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let keys = self.evaluate(&format!("globalThis.__htmlEntry.exportKeys({})", target))?;

        Ok(ExecutionResult {
            name: Some(name),
            keys,
            exports: Some(exports),
        })
    }

    /// Record a non-fatal script failure.
    pub(crate) fn report_script_error(&mut self, src: &str, message: String) {
        tracing::error!(src, error = %message, "error occurs while executing script");
        self.script_errors.push(ScriptError {
            src: src.to_string(),
            message,
        });
    }

    /// Script failures reported since the last call.
    pub fn take_script_errors(&mut self) -> Vec<ScriptError> {
        std::mem::take(&mut self.script_errors)
    }

    /// Number of async scripts still waiting for their content.
    pub fn pending_deferred_scripts(&self) -> usize {
        self.deferred.len()
    }

    /// Console output captured so far.
    pub fn console_output(&mut self) -> ConsoleOutput {
        self.js.op_state().borrow().borrow::<ConsoleOutput>().clone()
    }

    /// Console output captured so far, clearing it.
    pub fn take_console_output(&mut self) -> ConsoleOutput {
        std::mem::take(self.js.op_state().borrow_mut().borrow_mut::<ConsoleOutput>())
    }
}

fn json_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}
