use std::sync::Arc;

use courier::config::Config;
use courier::proxy::pool::WorkerPool;
use courier::server::handler::RequestHandler;
use courier::server::listener::{ListenAddr, Listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = Config::load()?;
    anyhow::ensure!(
        !config.server.connect_password.is_empty(),
        "server.connect_password must be configured"
    );

    let addr = ListenAddr::parse(&config.server.listen_addr)?;
    let listener = Listener::bind(&addr).await?;
    tracing::info!("Listening on {}", config.server.listen_addr);

    let pool = WorkerPool::new(&config.workers, config.worker_connect_timeout())?;
    let handler = RequestHandler::new(Arc::new(config), Arc::new(pool));

    tokio::select! {
        res = handler.run(listener) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
