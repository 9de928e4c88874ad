//! Bootstraps the broker: builds [`Services`] from [`Config`], binds the
//! listener, and runs the router to completion or until a shutdown signal.
//! Adapted from the corpus's own `Sidecar::init`/`Sidecar::run` split.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use broker_tokio::{
    notify_once::NotifyOnce,
    task::{try_join_tasks_and_shutdown, BrokerTask},
};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::{config::Config, server, services::Services};

pub struct Broker {
    listen_addr: SocketAddr,
    static_tasks: Vec<BrokerTask<()>>,
    shutdown: NotifyOnce,
}

impl Broker {
    #[instrument(skip_all, name = "(broker)")]
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        let services = Arc::new(Services::build(config));
        let router = server::router(services, config.num_server_threads);

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let listen_addr = listener
            .local_addr()
            .context("failed to read bound local address")?;
        info!(%listen_addr, "broker listening");

        let shutdown = NotifyOnce::new();
        let mut server_shutdown = shutdown.clone();
        let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
        let server_task = BrokerTask::spawn("broker-server", async move {
            let result = axum::serve(listener, make_service)
                .with_graceful_shutdown(async move { server_shutdown.recv().await })
                .await;
            if let Err(err) = result {
                tracing::error!(%err, "server task exited with an error");
            }
        });

        Ok(Self {
            listen_addr,
            static_tasks: vec![server_task],
            shutdown,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// A clone of the shutdown channel; call [`NotifyOnce::send`] on it to
    /// initiate a graceful shutdown from elsewhere (e.g. a test harness).
    pub fn shutdown_channel(&self) -> NotifyOnce {
        self.shutdown.clone()
    }

    /// Runs until a shutdown signal is received, either from
    /// [`Broker::shutdown_channel`] or (if `spawn_ctrlc_handler`) Ctrl+C.
    #[instrument(skip_all, name = "(broker)")]
    pub async fn run(self, spawn_ctrlc_handler: bool) -> anyhow::Result<()> {
        if spawn_ctrlc_handler {
            BrokerTask::spawn("ctrlc-handler", {
                let shutdown = self.shutdown.clone();
                async move {
                    use tokio::signal::ctrl_c;

                    info!("Ctrl+C handler ready, press Ctrl+C to shut down.");
                    ctrl_c().await.expect("Error receiving first CTRL+C");

                    info!(
                        "CTRL+C received, starting graceful shutdown. \
                         Hit CTRL+C again to quit immediately."
                    );
                    shutdown.send();
                    ctrl_c().await.expect("Error receiving second CTRL+C");
                    std::process::exit(1);
                }
            })
            .detach();
        }

        const SHUTDOWN_TIME_LIMIT: Duration = Duration::from_secs(10);
        let (_eph_tasks_tx, eph_tasks_rx) = tokio::sync::mpsc::channel(1);
        try_join_tasks_and_shutdown(
            self.static_tasks,
            eph_tasks_rx,
            self.shutdown,
            SHUTDOWN_TIME_LIMIT,
        )
        .await
        .context("error awaiting tasks")?;

        Ok(())
    }
}
