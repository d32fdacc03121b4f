//! Outbound dialer.
//!
//! Periodically dials every configured bootnode that has no connection in
//! flight. The manager rejects duplicates by node id, so a bootnode that
//! already dialled us is dropped after the identity exchange.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use peerwire_services::Direction;

use super::{run_connection, ConnectionContext};

const DIAL_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Dialer {
    bootnodes: Vec<String>,
    ctx: ConnectionContext,
    in_flight: Arc<DashMap<String, ()>>,
    shutdown: broadcast::Receiver<()>,
}

impl Dialer {
    pub fn new(bootnodes: Vec<String>, ctx: ConnectionContext) -> Self {
        let shutdown = ctx.shutdown_tx.subscribe();
        Self {
            bootnodes,
            ctx,
            in_flight: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        if self.bootnodes.is_empty() {
            tracing::info!("no bootnodes configured, dialer idle");
        }
        let mut interval = tokio::time::interval(DIAL_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("dialer shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    self.dial_all();
                }
            }
        }
    }

    fn dial_all(&self) {
        for addr in &self.bootnodes {
            if self.in_flight.insert(addr.clone(), ()).is_some() {
                continue;
            }

            let addr = addr.clone();
            let ctx = self.ctx.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(Ok(stream)) => {
                        tracing::debug!(addr = %addr, "dialled bootnode");
                        if let Err(e) = run_connection(stream, Direction::Outbound, ctx).await {
                            tracing::debug!(addr = %addr, error = %e, "outbound connection ended");
                        }
                    }
                    Ok(Err(e)) => tracing::debug!(addr = %addr, error = %e, "dial failed"),
                    Err(_) => tracing::debug!(addr = %addr, "dial timed out"),
                }
                in_flight.remove(&addr);
            });
        }
    }
}
