use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod checkpoint;
mod client;
mod cmd;
mod config;
mod json_repair;
mod judge;
mod pipeline;
mod prelude;
mod provider;
mod rate_limit;
mod retry;
mod secrets;
mod session;
mod streaming;
mod template;
mod ui;
mod wire;
mod writer;

/// Forge synthetic preference datasets at scale.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_KEY, NVIDIA_API_KEY, ANTHROPIC_API_KEY, TOGETHER_API_KEY:
    API keys, matched against each model's base URL.
  - PAIRSMITH_API_KEY: fallback key for any other endpoint.

  These variables may be set in a standard `.env` file. Local endpoints
  without authentication need no key at all.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Generate a preference dataset (or resume an interrupted session).
    Run(cmd::run::RunOpts),
    /// Validate a config file and print the resolved plan.
    Check(cmd::check::CheckOpts),
}

/// Our entry point. [`anyhow::Result`] will print a nice error message
/// with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // The root cancellation token. Ctrl-C trips it; everything that can
    // block — rate-limiter waits, HTTP calls, backoff sleeps — watches it.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing cleanly");
                cancel.cancel();
            }
        });
    }

    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(&ui, cancel, run_opts).await,
        Cmd::Check(check_opts) => cmd::check::cmd_check(check_opts).await,
    }
}
