// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane messages carried as active messages.
//!
//! Every message has a fixed [`AmHeader`] naming its opcode. Payloads are:
//! - [`AmOpcode::ConnectionCheck`] / [`AmOpcode::Disconnect`]: the sender's agent name
//! - [`AmOpcode::Notification`]: a MessagePack encoded [`NotificationMessage`]
//!
//! Only eagerly delivered messages are valid; a rendezvous receive is rejected.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transport::{AmRecvAttrs, TransportError};

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmOpcode {
    ConnectionCheck = 0,
    Disconnect = 1,
    Notification = 2,
}

impl AmOpcode {
    pub const ALL: [AmOpcode; 3] = [
        AmOpcode::ConnectionCheck,
        AmOpcode::Disconnect,
        AmOpcode::Notification,
    ];

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.id() == id)
    }
}

/// Fixed-size header sent with every control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmHeader {
    pub op: AmOpcode,
}

impl AmHeader {
    pub const LEN: usize = 8;

    pub fn new(op: AmOpcode) -> Self {
        Self { op }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        u64::from(self.op.id()).to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let raw: [u8; Self::LEN] = bytes.try_into().map_err(|_| {
            TransportError::InvalidParam(format!("header length {} != {}", bytes.len(), Self::LEN))
        })?;
        let id = u64::from_le_bytes(raw);
        u16::try_from(id)
            .ok()
            .and_then(AmOpcode::from_id)
            .map(Self::new)
            .ok_or_else(|| TransportError::InvalidParam(format!("unknown opcode {id}")))
    }
}

/// Check a received message against the opcode its handler was registered for.
pub fn validate(
    expected: AmOpcode,
    header: &[u8],
    attrs: AmRecvAttrs,
) -> Result<(), TransportError> {
    let hdr = AmHeader::decode(header)?;
    if hdr.op != expected {
        return Err(TransportError::InvalidParam(format!(
            "opcode {:?} delivered to {:?} handler",
            hdr.op, expected
        )));
    }
    if attrs.rendezvous {
        return Err(TransportError::InvalidParam(format!(
            "{expected:?} must be delivered eagerly"
        )));
    }
    Ok(())
}

/// Decode the agent name carried by connection check and disconnect messages.
pub fn decode_agent_name(payload: &[u8]) -> Result<String, TransportError> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| TransportError::InvalidParam(format!("agent name is not utf-8: {e}")))
}

/// Payload of an [`AmOpcode::Notification`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub name: String,
    pub msg: String,
}

impl NotificationMessage {
    pub fn new(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            msg: msg.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, TransportError> {
        rmp_serde::to_vec_named(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::InvalidParam(format!("failed to encode notification: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| TransportError::InvalidParam(format!("failed to decode notification: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_header_decode_rejects_garbage() {
        assert_matches!(AmHeader::decode(&[0u8; 3]), Err(TransportError::InvalidParam(_)));

        let unknown = 42u64.to_le_bytes();
        assert_matches!(AmHeader::decode(&unknown), Err(TransportError::InvalidParam(_)));

        let hdr = AmHeader::new(AmOpcode::Disconnect).encode();
        assert_eq!(AmHeader::decode(&hdr).unwrap().op, AmOpcode::Disconnect);
    }

    #[test]
    fn test_validate_rejects_wrong_opcode() {
        let hdr = AmHeader::new(AmOpcode::Notification).encode();
        let err = validate(AmOpcode::ConnectionCheck, &hdr, AmRecvAttrs::default());
        assert_matches!(err, Err(TransportError::InvalidParam(_)));
    }

    #[test]
    fn test_validate_rejects_rendezvous() {
        let hdr = AmHeader::new(AmOpcode::Notification).encode();
        let attrs = AmRecvAttrs { rendezvous: true };
        assert_matches!(
            validate(AmOpcode::Notification, &hdr, attrs),
            Err(TransportError::InvalidParam(_))
        );
        assert!(validate(AmOpcode::Notification, &hdr, AmRecvAttrs::default()).is_ok());
    }

    #[test]
    fn test_notification_decode_rejects_truncated() {
        let bytes = NotificationMessage::new("agent-a", "hello").encode().unwrap();
        let decoded = NotificationMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.name, "agent-a");
        assert_eq!(decoded.msg, "hello");

        assert_matches!(
            NotificationMessage::decode(&bytes[..bytes.len() - 2]),
            Err(TransportError::InvalidParam(_))
        );
    }

    #[test]
    fn test_agent_name_must_be_utf8() {
        assert_eq!(decode_agent_name(b"agent-b").unwrap(), "agent-b");
        assert_matches!(decode_agent_name(&[0xff, 0xfe]), Err(TransportError::InvalidParam(_)));
    }
}
