//! Application orchestrator: wires the hubs, router and server together.

use std::sync::Arc;

use c3_hub::{
    ConnectionHub, EventStore, HubServer, Journal, JsonlStore, NullStore, OperatorForwarder,
    ResponseRouter, ServerConfig, spawn_status_relay,
};

use crate::config::Config;

/// Runs the server until Ctrl-C or a fatal listener error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    // -- Journal --
    let store: Arc<dyn EventStore> = match &config.journal_path {
        Some(path) => {
            let store = JsonlStore::open(path).await?;
            tracing::info!(path = %store.path().display(), "journal enabled");
            Arc::new(store)
        }
        None => Arc::new(NullStore),
    };
    let journal = Arc::new(Journal::new(store));

    // -- Hubs --
    let agents = Arc::new(ConnectionHub::new("agents").with_teardown_wait(config.teardown_wait()));
    let operators =
        Arc::new(ConnectionHub::new("operators").with_teardown_wait(config.teardown_wait()));

    let router = Arc::new(
        ResponseRouter::new(
            Arc::clone(&agents),
            Arc::new(OperatorForwarder::new(Arc::clone(&operators))),
            Arc::clone(&journal),
        )
        .with_timeout(config.request_timeout()),
    );
    let relay = spawn_status_relay(&agents, Arc::clone(&operators), journal);

    // -- WS server --
    let server_config = ServerConfig {
        host: config.host.clone(),
        port: config.port,
    };
    let server = HubServer::new(server_config, router, operators);
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!("server ready");

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut server_task => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("SIGINT received, shutting down");
            server.shutdown();
            server_task.await
        }
    };

    relay.abort();
    result??;
    Ok(())
}
