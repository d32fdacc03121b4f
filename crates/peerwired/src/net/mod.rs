//! TCP transport — accept and dial loops feeding the protocol manager.

pub mod dialer;
pub mod framing;
pub mod listener;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use peerwire_core::wire::{short_id, NodeId};
use peerwire_services::{
    ChannelSender, ConnectionMeta, Direction, PacketSender, ProtocolManager, SessionDriver,
};

/// Outbound packets queued per connection before sends fail.
const OUTBOUND_QUEUE: usize = 256;

/// Inbound packets buffered ahead of the session.
const INBOUND_QUEUE: usize = 256;

/// Everything a connection task needs. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionContext {
    pub manager: ProtocolManager,
    pub local_id: NodeId,
    pub handshake_timeout: Duration,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Run one TCP connection from identity exchange to disconnect.
pub async fn run_connection(
    stream: TcpStream,
    direction: Direction,
    ctx: ConnectionContext,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let remote_addr = stream.peer_addr().context("peer address")?;
    let local_port = stream.local_addr().context("local address")?.port();
    let (mut reader, mut writer) = stream.into_split();

    let remote_id = framing::exchange_identity(
        &mut reader,
        &mut writer,
        &ctx.local_id,
        ctx.handshake_timeout,
    )
    .await
    .with_context(|| format!("identity exchange with {}", remote_addr))?;

    tracing::debug!(
        node = %short_id(&remote_id),
        addr = %remote_addr,
        direction = ?direction,
        "transport connected"
    );

    let (sender, outbound_rx) = ChannelSender::pair(OUTBOUND_QUEUE);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    tokio::spawn(framing::write_loop(writer, outbound_rx));
    let reader_task = tokio::spawn(framing::read_loop(reader, inbound_tx));

    let meta = ConnectionMeta {
        remote_id,
        remote_addr,
        local_port,
        direction,
    };
    let sender: Arc<dyn PacketSender> = Arc::new(sender);
    let session = match ctx.manager.accept_connection(meta, sender) {
        Ok(session) => session,
        Err(e) => {
            reader_task.abort();
            return Err(e).context("session rejected");
        }
    };

    let session = SessionDriver::new(
        session,
        inbound_rx,
        ctx.handshake_timeout,
        ctx.shutdown_tx.subscribe(),
    )
    .run()
    .await;

    reader_task.abort();
    tracing::debug!(
        session = session.id(),
        reason = ?session.disconnect_reason(),
        "connection closed"
    );
    Ok(())
}
