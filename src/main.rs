use clap::Parser;
use qtt_cache::app::App;
use qtt_cache::cli::Args;
use qtt_cache::config::Config;
use qtt_cache::logging::setup_logging;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config and set up logging before connecting so startup logs are never dropped
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        store = %config.cache_store,
        enabled = config.redis_enabled,
        "starting qtt-cache"
    );

    let app = match App::with_config(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = format!("{e:#}"), "failed to initialize application");
            return ExitCode::FAILURE;
        }
    };

    app.run(args.command).await
}
