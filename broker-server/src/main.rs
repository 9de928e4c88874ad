use anyhow::Context;
use broker_server::{cli::Args, config::Config, logging, run::Broker};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();

    let args = Args::from_env()?;
    let config = Config::resolve(args)?;

    // Unlike a single-client sidecar, the broker serves an unbounded set of
    // callers concurrently, so it gets a real worker pool rather than the
    // current-thread runtime a one-connection-at-a-time tool can get away
    // with.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_server_threads)
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    rt.block_on(async move {
        let broker = Broker::init(&config).await?;
        let spawn_ctrlc_handler = true;
        broker.run(spawn_ctrlc_handler).await
    })
}
