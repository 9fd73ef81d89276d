//! Broker: listener, client lifecycle, shared state ownership.

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::Result;
use crate::shared::{SharedState, SharedStateHandle};

/// The broker owns the client table and the subscription index, assigns
/// connection ids, and spawns one driver thread per accepted connection.
pub struct Broker {
    config: Arc<Config>,
    shared: SharedStateHandle,
    /// Connection ids are monotonically increasing and never reused within
    /// a process lifetime.
    next_client_id: AtomicU64,
}

impl Broker {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            shared: Arc::new(SharedState::new()),
            next_client_id: AtomicU64::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn shared(&self) -> &SharedStateHandle {
        &self.shared
    }

    /// Bind the listener and serve connections. Only a bind failure
    /// propagates out; per-connection failures are logged by the drivers.
    pub fn start(&self) -> Result<()> {
        // std sets SO_REUSEADDR on the socket for non-Windows targets
        let listener = TcpListener::bind(self.config.server.bind)?;
        info!("embermq listening on {}", self.config.server.bind);

        loop {
            let (stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };

            let active = self.shared.clients.read().len();
            if active >= self.config.server.max_connections {
                warn!(
                    "connection from {} dropped: {} connections at the limit",
                    addr, active
                );
                continue;
            }

            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
            let shared = Arc::clone(&self.shared);
            let config = Arc::clone(&self.config);

            let spawned = thread::Builder::new()
                .name(format!("conn-{}", id))
                .spawn(move || match Connection::new(id, stream, addr, shared, config) {
                    Ok(mut connection) => connection.run(),
                    Err(e) => error!("[{}] connection setup failed: {}", id, e),
                });
            if let Err(e) = spawned {
                error!("[{}] failed to spawn driver thread: {}", id, e);
            }
        }
    }

    /// Tear down every client (closing their streams), then the index and
    /// the retained store. Driver threads exit when their sockets fail.
    #[allow(dead_code)] // reserved for graceful shutdown wiring
    pub fn shutdown(&self) {
        let mut clients = self.shared.clients.write();
        info!("shutting down with {} connected clients", clients.len());
        clients.clear();

        let mut subscriptions = self.shared.subscriptions.write();
        *subscriptions = Default::default();
        drop(subscriptions);
        self.shared.retained.write().clear();
    }
}
