use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use walletd::config_models::cli_args::Args;
use walletd::config_models::cli_args::Config;

pub fn main() -> Result<()> {
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("could not create tokio runtime");

    let result = tokio_runtime.block_on(async {
        // --version and --help exit here, config errors are fatal
        let args = Args::parse();
        let cfg = Config::load(args)?;

        // RUST_LOG overrides the configured debug level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(cfg.tracing_filter()));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_thread_ids(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|_| anyhow::anyhow!("unable to set global default subscriber"))?;
        if let Some(warning) = &cfg.config_file_warning {
            tracing::warn!("{warning}");
        }

        walletd::initialize(cfg).await
    });

    tokio_runtime.shutdown_timeout(tokio::time::Duration::from_secs(10));
    result
}
