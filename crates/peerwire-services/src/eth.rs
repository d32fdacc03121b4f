//! eth sub-protocol handler.
//!
//! Sends our Status on attach, validates the peer's Status, then forwards
//! announcements to sync and the tx pool. Anything before Status, or a
//! second Status, ends the session.

use std::sync::Arc;

use bytes::Bytes;

use peerwire_core::capability::ProtocolId;
use peerwire_core::chain::ChainFacts;
use peerwire_core::wire::{eth, short_id, DisconnectReason, EthMessage, Status};

use crate::compat::CompatibilityValidator;
use crate::pools::{PooledTxSource, SyncPeerPool};
use crate::session::{HandlerContext, HandlerEvent, SessionError, SubProtocolHandler, SubProtocolReady};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EthState {
    AwaitingStatus,
    Ready,
}

pub struct EthHandler {
    version: u32,
    facts: Arc<ChainFacts>,
    validator: CompatibilityValidator,
    sync: Arc<dyn SyncPeerPool>,
    txpool: Arc<dyn PooledTxSource>,
    state: EthState,
    /// Messages received after Status that the session layer does not interpret.
    passthrough: u64,
}

impl EthHandler {
    pub fn new(
        version: u32,
        facts: Arc<ChainFacts>,
        validator: CompatibilityValidator,
        sync: Arc<dyn SyncPeerPool>,
        txpool: Arc<dyn PooledTxSource>,
    ) -> Self {
        Self {
            version,
            facts,
            validator,
            sync,
            txpool,
            state: EthState::AwaitingStatus,
            passthrough: 0,
        }
    }

    fn receive_status(
        &mut self,
        ctx: &HandlerContext<'_>,
        status: Status,
    ) -> Result<HandlerEvent, SessionError> {
        let outcome = self
            .validator
            .validate(&ctx.node_id, &self.facts, self.version, &status);
        if !outcome.is_compatible() {
            return Ok(HandlerEvent::Disconnect {
                reason: DisconnectReason::SubprotocolSpecific,
                details: outcome.to_string(),
            });
        }

        self.state = EthState::Ready;
        Ok(HandlerEvent::Initialized(SubProtocolReady {
            protocol: ProtocolId::Eth,
            version: self.version,
            status: Some(status),
        }))
    }
}

impl SubProtocolHandler for EthHandler {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Eth
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn message_count(&self) -> u8 {
        eth::MESSAGE_COUNT
    }

    fn init(&mut self, ctx: &HandlerContext<'_>) -> Result<(), SessionError> {
        ctx.send_eth(&EthMessage::Status(self.facts.status(self.version)))
    }

    fn receive_message(
        &mut self,
        ctx: &HandlerContext<'_>,
        code: u8,
        data: Bytes,
    ) -> Result<HandlerEvent, SessionError> {
        let msg = ctx.decode_eth(code, data)?;

        match (self.state, msg) {
            (EthState::AwaitingStatus, EthMessage::Status(status)) => {
                self.receive_status(ctx, status)
            }
            (EthState::AwaitingStatus, other) => Err(SessionError::Breach(format!(
                "eth message 0x{:02x} before status",
                other.id()
            ))),
            (EthState::Ready, EthMessage::Status(_)) => {
                Err(SessionError::Breach("duplicate status".into()))
            }
            (EthState::Ready, EthMessage::NewPooledTransactionHashes(hashes)) => {
                self.txpool.on_pooled_tx_hashes(&ctx.node_id, &hashes);
                Ok(HandlerEvent::None)
            }
            (EthState::Ready, EthMessage::NewBlockHashes(hashes)) => {
                self.sync.on_new_block_hashes(&ctx.node_id, &hashes);
                Ok(HandlerEvent::None)
            }
            (EthState::Ready, EthMessage::Other { id, .. }) => {
                self.passthrough += 1;
                tracing::trace!(node = %short_id(&ctx.node_id), id, "eth message");
                Ok(HandlerEvent::None)
            }
        }
    }

    fn on_detach(&mut self) {
        tracing::debug!(
            version = self.version,
            ready = self.state == EthState::Ready,
            passthrough = self.passthrough,
            "eth handler detached"
        );
    }
}
