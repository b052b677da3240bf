//! Command line entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use yansi::Paint;

use crate::config::Config;
use crate::observability;
use crate::report::{Snapshot, TextReporter};
use crate::runner::Runner;

/// Compares upload, download and delete throughput of object storage endpoints.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// do not show a progress spinner
    #[argh(switch)]
    no_progress: bool,
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("perftester-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    let reporter = runtime.block_on(benchmark(&config, !args.no_progress))?;

    print!("{}", reporter.format_results()?);
    print_failures(&reporter.snapshot());

    Ok(())
}

/// Runs every configured file test against every configured endpoint.
///
/// Endpoints are closed once the run completes, even if it was aborted.
pub async fn benchmark(config: &Config, show_progress: bool) -> Result<Arc<TextReporter>> {
    let mut endpoints = Vec::with_capacity(config.endpoints.len());
    for (id, endpoint_config) in &config.endpoints {
        let endpoint = endpoint_config.connect(id).await?;
        match endpoint.client.resolve_address().await {
            Ok(address) => tracing::debug!(endpoint = %id, %address, "resolved endpoint"),
            Err(error) => tracing::debug!(endpoint = %id, %error, "could not resolve endpoint"),
        }
        endpoints.push(endpoint);
    }

    let reporter = Arc::new(TextReporter::new(config.file_test_sizes()));
    let runner = Runner::new(
        Arc::clone(&reporter),
        endpoints,
        &config.file_tests,
        config.timeout,
    )
    .with_concurrency(config.concurrency);

    let bar = if show_progress {
        let bar = ProgressBar::new_spinner()
            .with_style(ProgressStyle::with_template("{spinner} {msg} {elapsed}")?)
            .with_message("Running benchmarks:");
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    } else {
        ProgressBar::hidden()
    };

    let result = runner.run_all().await;
    bar.finish_and_clear();

    for endpoint in runner.endpoints() {
        if let Err(error) = endpoint.close().await {
            tracing::warn!(endpoint = %endpoint.id, %error, "failed to close endpoint");
        }
    }

    result.context("benchmark run aborted")?;
    Ok(reporter)
}

fn print_failures(snapshot: &Snapshot) {
    let mut failures = snapshot.failures().peekable();
    if failures.peek().is_none() {
        return;
    }

    eprintln!();
    eprintln!("{}", "## Failures".bold().red());
    for (key, error) in failures {
        eprintln!(
            "{} {} on {}: {}",
            key.operation.bold(),
            key.file_test.blue(),
            key.endpoint.blue(),
            error
        );
    }
}
