//! Accept loop and connection bookkeeping.
//!
//! One control task owns the device-protocol listener, tracks every live
//! connection task, runs a periodic housekeeping tick, and drives graceful
//! shutdown. Per-connection protocol work happens in the connection tasks;
//! nothing here blocks on a single peer, and a panicking connection task is
//! logged and swept without taking the server down.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::connection;
use crate::protocol::DEVICE_PORT;
use crate::registry::DeviceRegistry;

/// Housekeeping cadence: sweep finished connection tasks, surface panics.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// How long shutdown waits for connection tasks to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEVICE_PORT,
        }
    }
}

pub struct DeviceServer {
    registry: Arc<DeviceRegistry>,
    config: ServerConfig,
}

impl DeviceServer {
    pub fn new(registry: Arc<DeviceRegistry>, config: ServerConfig) -> Self {
        Self { registry, config }
    }

    /// Serve until the shutdown flag flips (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        info!(local = %listener.local_addr()?, "device protocol listener ready");

        let mut connections: HashMap<u64, JoinHandle<()>> = HashMap::new();
        let mut next_task_id: u64 = 0;
        let mut tick = interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(%peer, "accepted device socket");
                        let task = tokio::spawn(connection::serve(
                            stream,
                            self.registry.clone(),
                            shutdown.clone(),
                        ));
                        connections.insert(next_task_id, task);
                        next_task_id += 1;
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },

                _ = tick.tick() => {
                    sweep_finished(&mut connections).await;
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(open = connections.len(), "shutting down, draining connections");
        let drain = async {
            for (task_id, task) in connections.drain() {
                log_task_exit(task_id, task.await);
            }
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace period elapsed with connections still open");
        }
        Ok(())
    }
}

async fn sweep_finished(connections: &mut HashMap<u64, JoinHandle<()>>) {
    let finished: Vec<u64> = connections
        .iter()
        .filter(|(_, task)| task.is_finished())
        .map(|(task_id, _)| *task_id)
        .collect();
    for task_id in finished {
        if let Some(task) = connections.remove(&task_id) {
            log_task_exit(task_id, task.await);
        }
    }
}

fn log_task_exit(task_id: u64, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            error!(task = task_id, "connection task panicked; its connection was dropped");
        }
    }
}
