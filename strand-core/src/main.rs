//! strand - Start a runtime and report how it was assembled.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use strand_core::{init_logging, CountersProvider, ProviderRegistry, RuntimeBootstrap, RuntimeOptions};
use tokio::sync::mpsc;
use tracing::info;

fn print_help() {
    println!("strand - Event-driven runtime bootstrap v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  strand [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help             Print this help message");
    println!("  -v, --version          Print version information");
    println!("      --options <FILE>   Load runtime options from a JSON file");
    println!("      --native           Prefer the OS-native transport");
    println!();
    println!("Log verbosity is controlled with RUST_LOG (default: info).");
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}");
    eprintln!("Run 'strand --help' for usage information.");
    std::process::exit(1);
}

/// Options for this run. Without an options file metrics are switched on so
/// the final report has something to show.
fn runtime_options(options_file: Option<&str>, prefer_native: bool) -> Result<RuntimeOptions> {
    let mut options = match options_file {
        Some(path) => RuntimeOptions::from_file(path)?,
        None => RuntimeOptions::default().with_metrics_enabled(true),
    };
    if prefer_native {
        options.prefer_native_transport = true;
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut options_file = None;
    let mut prefer_native = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("strand {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--options" => match args.next() {
                Some(path) => options_file = Some(path),
                None => usage_error("'--options' requires a file argument"),
            },
            "--native" => prefer_native = true,
            _ => usage_error(&format!("unrecognized argument '{arg}'")),
        }
    }

    init_logging();
    info!("Starting strand v{}", env!("CARGO_PKG_VERSION"));

    let options = runtime_options(options_file.as_deref(), prefer_native)?;

    let counters = Arc::new(CountersProvider::default());
    ProviderRegistry::global().register_provider(counters.clone());

    let runtime = RuntimeBootstrap::new().options(options).build_runtime()?;
    info!(
        transport = runtime.transport().name(),
        kind = %runtime.transport().kind(),
        "Runtime assembled"
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let loop_tx = tx.clone();
    runtime.run_on_loop(move || {
        let _ = loop_tx.send("event loop");
    })?;
    runtime.execute_blocking(move || {
        let _ = tx.send("worker");
    })?;
    for _ in 0..2 {
        let from = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
            .context("Runtime did not run submitted work")?;
        info!(from, "Work completed");
    }

    runtime.close();
    if runtime.metrics().is_some() {
        info!(counters = ?counters.counters().snapshot(), "Runtime stopped");
    } else {
        info!("Runtime stopped");
    }
    Ok(())
}
