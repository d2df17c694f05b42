//! Code wrapping: rebind a script's global references to the sandbox proxy.

use crate::asset::is_inline_code;

/// Global property the runtime binds the current sandbox proxy to.
pub const PROXY_SLOT: &str = "proxy";

/// Wrap `script_text` so that `window`, `self`, `globalThis` and `this` all
/// point at `window[proxy_slot]` while it runs.
///
/// The slot is read off the top-level global at call time, so the wrapper
/// targets the right proxy even when evaluation happens from inside another
/// sandboxed script. With `strict_global` the body additionally runs inside
/// `with(window)`, redirecting bare identifier reads and writes to the proxy
/// as well. That redirection is best effort: `let`/`const` declarations in the
/// wrapped code stay block scoped inside the `with` body.
///
/// A `sourceURL` hint is appended for scripts that came from a URL so stack
/// traces point back at the original file.
pub fn executable_script(
    script_src: &str,
    script_text: &str,
    proxy_slot: &str,
    strict_global: bool,
) -> String {
    let source_url = if is_inline_code(script_src) {
        String::new()
    } else {
        format!("//# sourceURL={}\n", script_src)
    };
    let proxy = format!("window.{}", proxy_slot);

    if strict_global {
        format!(
            ";(function(window, self, globalThis){{with(window){{;{}\n{}}}}}).bind({proxy})({proxy}, {proxy}, {proxy});",
            script_text,
            source_url,
            proxy = proxy
        )
    } else {
        format!(
            ";(function(window, self, globalThis){{;{}\n{}}}).bind({proxy})({proxy}, {proxy}, {proxy});",
            script_text,
            source_url,
            proxy = proxy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_url_script_with_source_url() {
        let code = executable_script("https://a.test/app.js", "var a = 1;", PROXY_SLOT, false);
        assert_eq!(
            code,
            ";(function(window, self, globalThis){;var a = 1;\n//# sourceURL=https://a.test/app.js\n}).bind(window.proxy)(window.proxy, window.proxy, window.proxy);"
        );
    }

    #[test]
    fn test_inline_script_has_no_source_url() {
        let code = executable_script("<script>var a = 1;</script>", "var a = 1;", PROXY_SLOT, false);
        assert!(!code.contains("sourceURL"));
    }

    #[test]
    fn test_strict_global_uses_with_scope() {
        let code = executable_script("https://a.test/app.js", "a = 1;", "sandbox", true);
        assert!(code.starts_with(";(function(window, self, globalThis){with(window){;a = 1;\n"));
        assert!(code.ends_with("}}).bind(window.sandbox)(window.sandbox, window.sandbox, window.sandbox);"));
    }
}
