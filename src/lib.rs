pub mod admin;
pub mod boyer_moore;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod logserver;
pub mod merge_ops;
pub mod protocol;
pub mod router;
pub mod table_config;
pub mod tablespace;
pub mod workers;

use std::sync::Arc;

use tracing::info;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{Error, Result};
pub use router::MainRouter;

/// Wires together every component described in spec.md section 4 and
/// drives them until a `StopServer` request (or `shutdown()`) tears the
/// server down.
pub struct YakDbServer {
    config: ServerConfig,
    router: Arc<MainRouter>,
    log_server: logserver::LogServerHandle,
}

impl YakDbServer {
    /// Builds every task (log server, admin, worker pools, async job
    /// router) and the `MainRouter` that dispatches to them, but does not
    /// yet bind any sockets — call `run` to do that.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let sinks = logserver::default_sinks(config.log_file.as_ref()).await?;
        let log_server = logserver::spawn(logserver::LogLevel::Info, sinks);

        let tablespace = Arc::new(tablespace::Tablespace::new());
        let factory: Arc<dyn engine::EngineFactory> = Arc::new(engine::MemEngineFactory);

        let admin = admin::spawn(
            tablespace.clone(),
            factory,
            config.data_dir.clone(),
            config.default_table_options.clone(),
        );

        let update_workers = workers::update::spawn(
            config.update_worker_count,
            config.internal_hwm,
            tablespace.clone(),
            admin.clone(),
            config.put_batch_size,
        );
        let read_workers = workers::read::spawn(
            config.read_worker_count,
            config.internal_hwm,
            tablespace.clone(),
            admin.clone(),
        );

        let apid_generator = Arc::new(
            jobs::apid::ApidGenerator::load(config.data_dir.join("next-apid")).await?,
        );
        let job_router = jobs::router::spawn(
            config.internal_hwm,
            tablespace,
            admin.clone(),
            apid_generator,
            config.default_chunk_size,
            config.job_grace_period,
            config.forced_scrub_interval,
        );

        let router = Arc::new(MainRouter::new(
            read_workers,
            update_workers,
            job_router,
            admin,
            config.external_hwm,
        ));

        Ok(YakDbServer {
            config,
            router,
            log_server,
        })
    }

    /// Binds and serves every configured role, returning once `shutdown`
    /// has been called (or a `StopServer` request has been handled).
    pub async fn run(&self) -> std::io::Result<()> {
        info!(endpoint = %self.config.router_endpoint, "starting yakdb server");
        self.log_server
            .log(logserver::LogLevel::Info, "server", "starting yakdb server")
            .await;

        let router_addr = self.config.router_endpoint.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid router endpoint: {e}"))
        })?;

        match &self.config.pull_endpoint {
            Some(endpoint) => {
                let pull_addr = endpoint.parse().map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid pull endpoint: {e}"))
                })?;
                let router = self.router.clone();
                let pull_router = self.router.clone();
                tokio::try_join!(
                    router.serve_router_role(router_addr),
                    pull_router.serve_pull_role(pull_addr),
                )?;
            }
            None => {
                self.router.serve_router_role(router_addr).await?;
            }
        }
        Ok(())
    }

    /// Signals every owned task to stop and unblocks `run`'s accept loops.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.log_server.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_builds_from_default_config_in_a_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfigBuilder::new()
            .data_dir(dir.path().to_path_buf())
            .router_endpoint("127.0.0.1:0")
            .build();
        let server = YakDbServer::new(config).await.unwrap();
        server.shutdown().await;
    }
}
