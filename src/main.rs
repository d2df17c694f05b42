//! html-entry CLI
//!
//! Single-shot mode:
//!   html-entry <entry-url> [--strict-global]
//!   html-entry --descriptor '<json>' [--strict-global]
//!
//! Server mode (persistent process, reads entry URLs from stdin):
//!   html-entry --server [--strict-global]
//!
//! Protocol (server mode):
//!   Request (stdin), one entry URL per line:
//!     https://app.example.com/index.html
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <html>...
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     https://app.example.com/main.js load failed with status 404

use anyhow::{anyhow, Result};
use html_entry::{
    Entry, EntryDescriptor, ExecHooks, ExecutionResult, FetchConfig, ImportOptions, Importer,
    RuntimeConfig, ScriptRuntime,
};
use std::io::{BufRead, Write};
use tracing_subscriber::EnvFilter;

/// Sandbox every application gets: an object inheriting from the real global.
const SANDBOX_EXPRESSION: &str = "Object.create(globalThis)";

fn print_usage() {
    eprintln!("html-entry - load a micro-frontend entry and run its scripts");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  html-entry <entry-url> [--strict-global]");
    eprintln!("  html-entry --descriptor '<json>' [--strict-global]");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  html-entry --server [--strict-global]");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  html-entry https://app.example.com/index.html");
    eprintln!("  html-entry --descriptor '{{\"scripts\":[\"https://app.example.com/main.js\"]}}'");
    eprintln!();
    eprintln!("Logging is controlled with RUST_LOG (default: warn).");
}

fn print_console(runtime: &mut ScriptRuntime) {
    let console = runtime.take_console_output();
    for log in &console.logs {
        eprintln!("[LOG] {}", log);
    }
    for warn in &console.warns {
        eprintln!("[WARN] {}", warn);
    }
    for err in &console.errors {
        eprintln!("[ERROR] {}", err);
    }
    for failure in runtime.take_script_errors() {
        eprintln!("[SCRIPT] {}: {}", failure.src, failure.message);
    }
}

fn print_exports(result: &ExecutionResult) {
    match &result.name {
        Some(name) => eprintln!("[EXPORTS] {}: {}", name, result.keys.join(", ")),
        None => eprintln!("[EXPORTS] (none)"),
    }
}

/// Load one entry, run its scripts in a fresh sandbox and return the template.
async fn load(
    importer: &Importer,
    runtime: &mut ScriptRuntime,
    entry: Entry,
    strict_global: bool,
) -> Result<String> {
    let handle = importer.import_entry(entry, &ImportOptions::default())?.await?;

    let proxy = runtime.create_proxy(SANDBOX_EXPRESSION)?;
    let result = handle
        .exec_scripts(runtime, &proxy, strict_global, ExecHooks::default())
        .await?;
    runtime.run_deferred_scripts().await;

    print_exports(&result);
    Ok(handle.template().to_string())
}

/// Run in single-shot mode
async fn run_single_shot(entry: Entry, strict_global: bool) -> Result<()> {
    let importer = Importer::http(FetchConfig::default())?;
    let mut runtime = ScriptRuntime::new(&RuntimeConfig::default())?;

    let outcome = load(&importer, &mut runtime, entry, strict_global).await;
    print_console(&mut runtime);

    // Print template to stdout
    println!("{}", outcome?);
    Ok(())
}

/// Run in server mode (persistent process, reads entry URLs from stdin)
async fn run_server(strict_global: bool) -> Result<()> {
    // One importer and one runtime for the whole session; documents and
    // assets stay cached between requests.
    let importer = Importer::http(FetchConfig::default())?;
    let mut runtime = ScriptRuntime::new(&RuntimeConfig::default())?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF - stdin closed
            break;
        }

        let url = line.trim();
        if url.is_empty() {
            continue;
        }

        let outcome = load(&importer, &mut runtime, Entry::from(url), strict_global).await;
        print_console(&mut runtime);

        match outcome {
            Ok(template) => write_response(&mut stdout, true, &template)?,
            Err(e) => write_response(&mut stdout, false, &e.to_string())?,
        }
    }

    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?;
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let strict_global = match args.iter().position(|arg| arg == "--strict-global") {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    };

    match args.first().map(String::as_str) {
        None => {
            print_usage();
            Err(anyhow!("Missing required arguments"))
        }
        Some("--server") => run_server(strict_global).await,
        Some("--descriptor") => {
            let Some(json) = args.get(1) else {
                print_usage();
                return Err(anyhow!("Descriptor mode requires a JSON argument"));
            };
            let descriptor: EntryDescriptor =
                serde_json::from_str(json).map_err(|e| anyhow!("Invalid descriptor JSON: {}", e))?;
            run_single_shot(Entry::Descriptor(descriptor), strict_global).await
        }
        Some(url) => run_single_shot(Entry::from(url), strict_global).await,
    }
}
