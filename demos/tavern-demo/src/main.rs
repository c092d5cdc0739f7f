//! Development server: dev-token auth, in-memory snapshots, settings
//! from `TAVERN_*` variables.
//!
//! ```text
//! RUST_LOG=debug TAVERN_BIND=0.0.0.0:8080 cargo run --bin tavern-server
//! ```

use tavern::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServerConfig::from_env()?;
    tracing::info!(
        bind = %config.bind_addr,
        idle_timeout_secs = config.room.idle_timeout.as_secs(),
        "starting tavern server"
    );

    let server = TavernServerBuilder::new()
        .config(config)
        .store(MemoryStore::new())
        .build(DevAuthenticator)
        .await?;

    server.run().await?;
    Ok(())
}
