//! Inbound connection acceptor.

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use peerwire_services::Direction;

use super::{run_connection, ConnectionContext};

pub struct TcpAcceptor {
    listener: TcpListener,
    ctx: ConnectionContext,
    shutdown: broadcast::Receiver<()>,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener, ctx: ConnectionContext) -> Self {
        let shutdown = ctx.shutdown_tx.subscribe();
        Self {
            listener,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("tcp acceptor shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(addr = %addr, "inbound connection");

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_connection(stream, Direction::Inbound, ctx).await {
                            tracing::debug!(addr = %addr, error = %e, "inbound connection ended");
                        }
                    });
                }
            }
        }
    }
}
