//! The `html_entry_runtime` extension: console ops plus the bootstrap module.
//!
//! Application scripts never write to the host's stdout. Each console level
//! is appended to the [`ConsoleOutput`] kept in op state, where the host
//! reads or drains it between executions.

use deno_core::{op2, OpState};

/// Console lines written by application scripts, per level
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    /// `console.log`, `console.info` and `console.debug`
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

fn capture(state: &mut OpState, line: &str, level: fn(&mut ConsoleOutput) -> &mut Vec<String>) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        level(output).push(line.to_string());
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] line: &str) {
    capture(state, line, |output| &mut output.logs);
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] line: &str) {
    capture(state, line, |output| &mut output.warns);
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] line: &str) {
    capture(state, line, |output| &mut output.errors);
}

deno_core::extension!(
    html_entry_runtime,
    ops = [op_console_log, op_console_warn, op_console_error],
    esm_entry_point = "ext:html_entry_runtime/bootstrap.js",
    esm = ["ext:html_entry_runtime/bootstrap.js" = "src/bootstrap.js"],
);

#[cfg(test)]
mod tests {
    use crate::runtime::{RuntimeConfig, ScriptRuntime};

    #[test]
    fn test_console_levels_are_captured_separately() {
        let mut runtime = ScriptRuntime::new(&RuntimeConfig::default()).unwrap();
        runtime
            .js_runtime()
            .execute_script(
                "<test>",
                "console.info('info'); console.debug('debug'); console.warn('careful', { n: 1 })",
            )
            .unwrap();

        let output = runtime.take_console_output();
        assert_eq!(output.logs, vec!["info", "debug"]);
        assert_eq!(output.warns, vec![r#"careful {"n":1}"#]);
        assert!(output.errors.is_empty());
    }
}
