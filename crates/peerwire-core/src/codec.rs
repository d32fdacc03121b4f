//! Pluggable payload codec.
//!
//! The session layer hands typed messages to a [`PacketCodec`] and gets
//! [`Packet`]s back; it never looks at payload bytes itself. [`JsonCodec`] is
//! the default used by the daemon and tests.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::wire::{
    eth, p2p, Disconnect, DisconnectReason, EthMessage, P2pMessage, Packet, WireError,
};

/// Encodes and decodes message payloads.
pub trait PacketCodec: Send + Sync {
    fn encode_p2p(&self, msg: &P2pMessage) -> Result<Packet, WireError>;

    fn decode_p2p(&self, packet: &Packet) -> Result<P2pMessage, WireError>;

    /// Encode an eth message at the capability's negotiated offset.
    fn encode_eth(&self, msg: &EthMessage, offset: u8) -> Result<Packet, WireError>;

    fn decode_eth(&self, packet: &Packet, offset: u8) -> Result<EthMessage, WireError>;
}

/// serde_json payloads; Disconnect is a single reason byte, Ping/Pong are empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PacketCodec for JsonCodec {
    fn encode_p2p(&self, msg: &P2pMessage) -> Result<Packet, WireError> {
        let code = msg.code();
        let data = match msg {
            P2pMessage::Hello(hello) => to_json(code, hello)?,
            P2pMessage::Disconnect(d) => Bytes::from(vec![u8::from(d.reason)]),
            P2pMessage::Ping | P2pMessage::Pong => Bytes::new(),
        };
        Ok(Packet { code, data })
    }

    fn decode_p2p(&self, packet: &Packet) -> Result<P2pMessage, WireError> {
        match packet.code {
            p2p::HELLO => Ok(P2pMessage::Hello(from_json(packet)?)),
            p2p::DISCONNECT => {
                let byte = packet.data.first().copied().ok_or(WireError::Malformed {
                    code: packet.code,
                    reason: "empty disconnect payload".into(),
                })?;
                Ok(P2pMessage::Disconnect(Disconnect {
                    reason: DisconnectReason::try_from(byte)?,
                }))
            }
            p2p::PING => Ok(P2pMessage::Ping),
            p2p::PONG => Ok(P2pMessage::Pong),
            other => Err(WireError::UnknownMessage(other)),
        }
    }

    fn encode_eth(&self, msg: &EthMessage, offset: u8) -> Result<Packet, WireError> {
        let id = msg.id();
        let code = offset
            .checked_add(id)
            .ok_or(WireError::UnknownMessage(id))?;
        let data = match msg {
            EthMessage::Status(status) => to_json(code, status)?,
            EthMessage::NewBlockHashes(hashes) => to_json(code, hashes)?,
            EthMessage::NewPooledTransactionHashes(hashes) => to_json(code, hashes)?,
            EthMessage::Other { payload, .. } => payload.clone(),
        };
        Ok(Packet { code, data })
    }

    fn decode_eth(&self, packet: &Packet, offset: u8) -> Result<EthMessage, WireError> {
        let id = packet
            .code
            .checked_sub(offset)
            .filter(|id| *id < eth::MESSAGE_COUNT)
            .ok_or(WireError::UnknownMessage(packet.code))?;

        match id {
            eth::STATUS => Ok(EthMessage::Status(from_json(packet)?)),
            eth::NEW_BLOCK_HASHES => Ok(EthMessage::NewBlockHashes(from_json(packet)?)),
            eth::NEW_POOLED_TRANSACTION_HASHES => {
                Ok(EthMessage::NewPooledTransactionHashes(from_json(packet)?))
            }
            other => Ok(EthMessage::Other {
                id: other,
                payload: packet.data.clone(),
            }),
        }
    }
}

fn to_json<T: Serialize>(code: u8, value: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| WireError::Malformed {
            code,
            reason: e.to_string(),
        })
}

fn from_json<T: DeserializeOwned>(packet: &Packet) -> Result<T, WireError> {
    serde_json::from_slice(&packet.data).map_err(|e| WireError::Malformed {
        code: packet.code,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::chain::ForkId;
    use crate::wire::{Hello, Status};
    use num_bigint::BigUint;

    fn hello() -> Hello {
        Hello {
            p2p_version: 5,
            client_id: "peerwire/test".into(),
            capabilities: vec![Capability::new("eth", 68)],
            listen_port: 30303,
            node_id: [7u8; 32],
        }
    }

    #[test]
    fn hello_survives_the_codec() {
        let codec = JsonCodec;
        let packet = codec.encode_p2p(&P2pMessage::Hello(hello())).unwrap();
        assert_eq!(packet.code, p2p::HELLO);
        assert_eq!(codec.decode_p2p(&packet).unwrap(), P2pMessage::Hello(hello()));
    }

    #[test]
    fn disconnect_is_one_byte() {
        let codec = JsonCodec;
        let msg = P2pMessage::Disconnect(Disconnect {
            reason: DisconnectReason::TooManyPeers,
        });
        let packet = codec.encode_p2p(&msg).unwrap();
        assert_eq!(&packet.data[..], &[0x04]);
        assert_eq!(codec.decode_p2p(&packet).unwrap(), msg);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let codec = JsonCodec;
        let err = codec
            .decode_p2p(&Packet::new(p2p::HELLO, &b"not json"[..]))
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed { code: 0, .. }));

        let err = codec
            .decode_p2p(&Packet::new(p2p::DISCONNECT, Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));

        assert_eq!(
            codec.decode_p2p(&Packet::new(0x0e, Bytes::new())),
            Err(WireError::UnknownMessage(0x0e))
        );
    }

    #[test]
    fn eth_codes_are_offset() {
        let codec = JsonCodec;
        let status = Status {
            protocol_version: 68,
            network_id: 1,
            total_difficulty: BigUint::from(1_000_000u64),
            best_hash: [1u8; 32],
            genesis_hash: [2u8; 32],
            fork_id: ForkId {
                hash: [1, 2, 3, 4],
                next: 0,
            },
        };
        let packet = codec
            .encode_eth(&EthMessage::Status(status.clone()), 0x10)
            .unwrap();
        assert_eq!(packet.code, 0x10);
        assert_eq!(
            codec.decode_eth(&packet, 0x10).unwrap(),
            EthMessage::Status(status)
        );
    }

    #[test]
    fn eth_decode_rejects_out_of_range_codes() {
        let codec = JsonCodec;
        assert!(codec.decode_eth(&Packet::new(0x05, Bytes::new()), 0x10).is_err());
        assert!(codec.decode_eth(&Packet::new(0x21, Bytes::new()), 0x10).is_err());

        let other = codec
            .decode_eth(&Packet::new(0x14, &b"raw"[..]), 0x10)
            .unwrap();
        assert_eq!(
            other,
            EthMessage::Other {
                id: eth::BLOCK_HEADERS,
                payload: Bytes::from_static(b"raw"),
            }
        );
    }
}
