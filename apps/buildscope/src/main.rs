//! # buildscope
//!
//! Refactor captured build graphs from the command line.
//!
//! ## Usage
//!
//! ```bash
//! buildscope init
//! buildscope ingest -f build.json
//! buildscope rm-path /out/x.o --cascade
//! buildscope move --package zlib --member action:12
//! buildscope undo
//! buildscope status --checksum
//! ```
//!
//! Exit codes: 0 on success, 1 when a refactoring is rejected or input is
//! invalid, 2 when applying an entry failed and the graph is suspect.

use buildscope::cli::{self, Cli, report_error};
use buildscope::config::Config;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json_mode;

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e, json_mode);
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(&config, cli.verbose, cli.quiet);

    if let Err(e) = cli::execute(cli, &config) {
        tracing::debug!("command failed: {}", e);
        report_error(&e, json_mode);
        std::process::exit(e.exit_code());
    }
}

/// Initialize tracing. BUILDSCOPE_LOG_FORMAT=json enables machine-parseable
/// output; RUST_LOG overrides the configured filter.
fn init_tracing(config: &Config, verbose: bool, quiet: bool) {
    let env_format = std::env::var("BUILDSCOPE_LOG_FORMAT").ok();
    let fallback = if verbose {
        "buildscope=debug,buildscope_core=debug"
    } else if quiet {
        "buildscope=warn,buildscope_core=warn"
    } else {
        config.log_filter()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| fallback.into());

    if config.json_logs(env_format.as_deref()) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
