//! Session driver — the one task that owns a session.
//!
//! Inbound packets, control commands, the handshake deadline and process
//! shutdown are merged into a single sequential stream, so the session
//! never sees two events at once.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use peerwire_core::wire::{short_id, DisconnectReason, Packet};

use crate::session::{DisconnectOriginator, Session, SessionCommand};

pub struct SessionDriver {
    session: Session,
    inbound: mpsc::Receiver<Packet>,
    handshake_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SessionDriver {
    pub fn new(
        session: Session,
        inbound: mpsc::Receiver<Packet>,
        handshake_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session,
            inbound,
            handshake_timeout,
            shutdown,
        }
    }

    /// Run until the session is disconnected. Returns the finished session.
    pub async fn run(mut self) -> Session {
        let Some(mut commands) = self.session.take_commands() else {
            tracing::warn!(session = self.session.id(), "session already driven");
            return self.session;
        };

        let deadline = tokio::time::sleep(self.handshake_timeout);
        tokio::pin!(deadline);

        while !self.session.is_disconnected() {
            let waiting = !self.session.sub_protocols_ready();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.session.mark_disconnected(
                        DisconnectReason::ClientQuitting,
                        DisconnectOriginator::Local,
                        "shutting down",
                    );
                }

                _ = &mut deadline, if waiting => {
                    self.session.mark_disconnected(
                        DisconnectReason::ReceiveMessageTimeout,
                        DisconnectOriginator::Local,
                        "handshake timed out",
                    );
                }

                Some(command) = commands.recv() => match command {
                    SessionCommand::Disconnect(reason) => {
                        self.session.mark_disconnected(
                            reason,
                            DisconnectOriginator::Local,
                            "requested",
                        );
                    }
                },

                packet = self.inbound.recv() => match packet {
                    Some(packet) => self.session.receive_message(packet),
                    None => {
                        self.session.mark_disconnected(
                            DisconnectReason::TcpSubsystemError,
                            DisconnectOriginator::Remote,
                            "transport closed",
                        );
                    }
                },
            }
        }

        tracing::debug!(
            session = self.session.id(),
            node = %short_id(self.session.remote_id()),
            "driver finished"
        );
        self.session
    }
}
