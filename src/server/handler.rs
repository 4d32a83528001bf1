//! Accepting connections and tracking live clients.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proxy::pool::SessionSource;
use crate::server::client::{Client, Phase, PhaseCell};
use crate::server::listener::{Listener, Socket};

/// Connections accepted per readiness burst before yielding back to the
/// runtime.
const ACCEPT_BATCH: usize = 10;

pub struct ClientEntry {
    pub phase: PhaseCell,
}

/// Owns the fd→client table and spawns one task per accepted connection.
pub struct RequestHandler<P> {
    config: Arc<Config>,
    pool: Arc<P>,
    clients: Mutex<HashMap<i32, ClientEntry>>,
}

impl<P: SessionSource + 'static> RequestHandler<P> {
    pub fn new(config: Arc<Config>, pool: Arc<P>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Serves the listening socket forever. Accept errors other than
    /// would-block are fatal and end the serve loop.
    pub async fn run(self: Arc<Self>, listener: Listener) -> anyhow::Result<()> {
        loop {
            let (socket, fd) = listener.accept().await.context("cannot accept client")?;
            self.install(socket, fd);

            // Drain the rest of the burst without blocking.
            let mut accepted = 1;
            while accepted < ACCEPT_BATCH {
                match poll_fn(|cx| Poll::Ready(listener.poll_accept(cx))).await {
                    Poll::Ready(Ok((socket, fd))) => {
                        self.install(socket, fd);
                        accepted += 1;
                    }
                    Poll::Ready(Err(e)) => {
                        return Err(anyhow::Error::from(e).context("cannot accept client"))
                    }
                    Poll::Pending => break,
                }
            }
        }
    }

    fn install(self: &Arc<Self>, socket: Socket, fd: i32) {
        let phase: PhaseCell = Arc::new(Mutex::new(Phase::BeginReadPassword));
        {
            let mut clients = self.clients.lock().unwrap();
            clients.insert(
                fd,
                ClientEntry {
                    phase: phase.clone(),
                },
            );
            info!(client = fd, count = clients.len(), "New client accepted");
        }

        let handler = self.clone();
        tokio::spawn(async move {
            let client = Client::new(fd, handler.config.clone(), handler.pool.clone(), phase);
            let reason = client.run(socket).await;

            let remaining = {
                let mut clients = handler.clients.lock().unwrap();
                clients.remove(&fd);
                clients.len()
            };
            if reason.is_error() {
                warn!(client = fd, "Disconnecting with error: {reason}");
            } else {
                debug!(client = fd, count = remaining, "Disconnected");
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Renders the live-client table, one line per connection.
    pub fn inspect(&self) -> String {
        let clients = self.clients.lock().unwrap();
        let mut out = format!("{} clients:\n", clients.len());
        for (fd, entry) in clients.iter() {
            let phase = *entry.phase.lock().unwrap();
            out.push_str(&format!("  Client {fd}: {}\n", phase.name()));
        }
        out
    }
}
