//! `TavernServer` builder and server loop.
//!
//! Ties the layers together: transport → protocol → identity → rooms.

use std::sync::Arc;

use tavern_identity::Authenticator;
use tavern_protocol::{Codec, JsonCodec};
use tavern_room::{NoStore, SessionRegistry, SnapshotStore, stop_idle_rooms};
use tavern_transport::{Transport, WebSocketTransport};
use tokio::sync::Mutex;

use crate::handler::handle_connection;
use crate::{ServerConfig, TavernError};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<A: Authenticator, C: Codec, S: SnapshotStore> {
    pub(crate) registry: Mutex<SessionRegistry<S>>,
    pub(crate) auth: A,
    pub(crate) codec: C,
    pub(crate) config: ServerConfig,
}

/// Builder for configuring and starting a Tavern server.
///
/// # Example
///
/// ```rust,no_run
/// use tavern::prelude::*;
///
/// # async fn run() -> Result<(), TavernError> {
/// let server = TavernServerBuilder::new()
///     .config(ServerConfig::from_env()?)
///     .store(MemoryStore::new())
///     .build(DevAuthenticator)
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct TavernServerBuilder<S: SnapshotStore = NoStore> {
    config: ServerConfig,
    store: S,
}

impl TavernServerBuilder<NoStore> {
    /// Creates a builder with default settings and no snapshot store.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: NoStore,
        }
    }
}

impl Default for TavernServerBuilder<NoStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SnapshotStore> TavernServerBuilder<S> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets where snapshots are loaded from and checkpointed to.
    pub fn store<T: SnapshotStore>(self, store: T) -> TavernServerBuilder<T> {
        TavernServerBuilder {
            config: self.config,
            store,
        }
    }

    /// Binds the listener and returns a server ready to [`run`](TavernServer::run).
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build<A: Authenticator>(
        self,
        auth: A,
    ) -> Result<TavernServer<A, JsonCodec, S>, TavernError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;

        let state = Arc::new(ServerState {
            registry: Mutex::new(SessionRegistry::new(self.config.room.clone(), self.store)),
            auth,
            codec: JsonCodec,
            config: self.config,
        });

        Ok(TavernServer { transport, state })
    }
}

/// A bound Tavern server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TavernServer<A: Authenticator, C: Codec, S: SnapshotStore> {
    transport: WebSocketTransport,
    state: Arc<ServerState<A, C, S>>,
}

impl<A, C, S> TavernServer<A, C, S>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the accept loop and the idle-room reaper.
    ///
    /// Each accepted connection gets its own handler task. Runs until the
    /// process is terminated.
    pub async fn run(mut self) -> Result<(), TavernError> {
        tracing::info!(addr = %self.state.config.bind_addr, "Tavern server running");

        tokio::spawn(reap_idle_rooms(Arc::clone(&self.state)));

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Periodically shuts down rooms nobody has been connected to for the
/// configured idle timeout.
async fn reap_idle_rooms<A, C, S>(state: Arc<ServerState<A, C, S>>)
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    let mut interval = tokio::time::interval(state.config.reap_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        // The registry stays unlocked while rooms are asked.
        let (handles, idle_timeout) = {
            let registry = state.registry.lock().await;
            (registry.room_handles(), registry.config().idle_timeout)
        };
        let stopped = stop_idle_rooms(handles, idle_timeout).await;
        if stopped.is_empty() {
            continue;
        }
        let reaped = state.registry.lock().await.forget(&stopped);
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "reaped idle rooms");
        }
    }
}
