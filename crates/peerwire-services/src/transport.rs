//! Outbound transport seam.
//!
//! The session only ever sends, closes, and asks whether the transport is
//! closed. The daemon plugs in a TCP writer; tests and in-process peers use
//! [`ChannelSender`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use peerwire_core::wire::Packet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// Sends framed packets to the remote peer. Implementations must not block.
pub trait PacketSender: Send + Sync {
    fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Close the outbound side. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Outbound queue backed by a bounded mpsc channel.
///
/// Closing drops the sender, so the receiving end observes end-of-stream
/// once queued packets are drained.
pub struct ChannelSender {
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<Packet>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// A sender and the receiver the remote side reads from.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl PacketSender for ChannelSender {
    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }
}

/// The single path from a session to its transport.
///
/// Keep-alive pings go through [`OutboundGate::send_keep_alive`], which only
/// sends while keep-alive is enabled. Disconnect disables keep-alive and
/// closes the gate under the same lock, so a ping racing a disconnect is
/// dropped instead of reaching the transport.
pub struct OutboundGate {
    inner: Mutex<GateInner>,
}

struct GateInner {
    sender: Option<Arc<dyn PacketSender>>,
    keep_alive: bool,
}

impl Default for OutboundGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                sender: None,
                keep_alive: false,
            }),
        }
    }

    pub fn attach(&self, sender: Arc<dyn PacketSender>) {
        self.inner.lock().sender = Some(sender);
    }

    pub fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        match &inner.sender {
            Some(sender) => sender.send(packet),
            None => Err(TransportError::Closed),
        }
    }

    /// Send only while keep-alive is enabled. Returns false once it is not.
    pub fn send_keep_alive(&self, packet: Packet) -> bool {
        let inner = self.inner.lock();
        if !inner.keep_alive {
            return false;
        }
        match &inner.sender {
            Some(sender) => {
                if let Err(e) = sender.send(packet) {
                    tracing::debug!(error = %e, "keep-alive ping not sent");
                }
                true
            }
            None => false,
        }
    }

    pub fn set_keep_alive(&self, enabled: bool) {
        self.inner.lock().keep_alive = enabled;
    }

    pub fn keep_alive(&self) -> bool {
        self.inner.lock().keep_alive
    }

    /// Disable keep-alive, detach and close the transport. Idempotent.
    pub fn close(&self) {
        let sender = {
            let mut inner = self.inner.lock();
            inner.keep_alive = false;
            inner.sender.take()
        };
        if let Some(sender) = sender {
            sender.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .sender
            .as_ref()
            .map(|s| !s.is_closed())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn close_ends_the_stream_after_draining() {
        let (sender, mut rx) = ChannelSender::pair(4);
        sender.send(Packet::new(0x02, Bytes::new())).unwrap();
        sender.close();
        sender.close();

        assert!(sender.is_closed());
        assert_eq!(
            sender.send(Packet::new(0x02, Bytes::new())),
            Err(TransportError::Closed)
        );
        assert_eq!(rx.recv().await.map(|p| p.code), Some(0x02));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn full_queue_is_reported() {
        let (sender, _rx) = ChannelSender::pair(1);
        sender.send(Packet::new(0x02, Bytes::new())).unwrap();
        assert_eq!(
            sender.send(Packet::new(0x02, Bytes::new())),
            Err(TransportError::Full)
        );
    }

    #[test]
    fn gate_drops_keep_alive_after_close() {
        let (sender, mut rx) = ChannelSender::pair(8);
        let gate = OutboundGate::new();
        gate.attach(Arc::new(sender));

        assert!(!gate.send_keep_alive(Packet::new(0x02, Bytes::new())));
        gate.set_keep_alive(true);
        assert!(gate.send_keep_alive(Packet::new(0x02, Bytes::new())));

        gate.close();
        assert!(!gate.keep_alive());
        assert!(!gate.send_keep_alive(Packet::new(0x02, Bytes::new())));
        assert_eq!(gate.send(Packet::new(0x01, Bytes::new())), Err(TransportError::Closed));
        assert!(!gate.is_open());

        assert_eq!(rx.try_recv().map(|p| p.code), Ok(0x02));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_reads_as_closed() {
        let (sender, rx) = ChannelSender::pair(1);
        drop(rx);
        assert!(sender.is_closed());
    }
}
