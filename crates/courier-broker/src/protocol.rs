//! The broker-protocol envelope: the JSON header attached to every
//! dispatched block.

use std::fmt;

use courier_data::DataBlock;
use courier_errors::{BrokerErrorCode, Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Message types ─────────────────────────────────────────────────────────────

/// Recognized values of the envelope's `messageType` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    AsyncRpcDispatch,
    AsyncRpcAcknowledgment,
    BackendAssociateTargetPeerId,
    BackendDissociateTargetPeerId,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AsyncRpcDispatch => "AsyncRpcDispatch",
            MessageType::AsyncRpcAcknowledgment => "AsyncRpcAcknowledgment",
            MessageType::BackendAssociateTargetPeerId => "BackendAssociateTargetPeerId",
            MessageType::BackendDissociateTargetPeerId => "BackendDissociateTargetPeerId",
        }
    }

    pub fn from_name(name: &str) -> Option<MessageType> {
        Some(match name {
            "AsyncRpcDispatch" => MessageType::AsyncRpcDispatch,
            "AsyncRpcAcknowledgment" => MessageType::AsyncRpcAcknowledgment,
            "BackendAssociateTargetPeerId" => MessageType::BackendAssociateTargetPeerId,
            "BackendDissociateTargetPeerId" => MessageType::BackendDissociateTargetPeerId,
            _ => return None,
        })
    }
}

// ── Envelope members ──────────────────────────────────────────────────────────

/// Inbound credential: an opaque token forwarded to the authorization cache.
///
/// `Debug` never prints the token payload.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationToken {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl fmt::Debug for AuthenticationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationToken")
            .field("type", &self.token_type)
            .field("data", &"[REDACTED]")
            .finish()
    }
}

/// Outbound identity: set by the broker after successful authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityPrincipalData {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub given_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub family_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub type_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrincipalIdentityInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<AuthenticationToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_principal: Option<SecurityPrincipalData>,
}

/// The envelope itself. Peer id properties are optional; the empty string
/// denotes absence, matching the wire schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerProtocol {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_peer_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_identity_info: Option<PrincipalIdentityInfo>,
    /// Opaque object forwarded unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_user_data: Option<serde_json::Value>,
}

impl BrokerProtocol {
    /// Parse the envelope out of a block's trailing JSON header.
    pub fn from_block(block: &DataBlock) -> Result<BrokerProtocol> {
        let header = block.require_header().map_err(|_| {
            protocol_validation_error("Input is not in the expected JSON format")
        })?;
        serde_json::from_slice(header)
            .map_err(|_| protocol_validation_error("Input is not in the expected JSON format"))
    }

    /// Reserialize the envelope into the block's header part, preserving the
    /// user payload.
    pub fn write_to_block(&self, block: &mut DataBlock) -> Result<()> {
        let text = serde_json::to_string(self)?;
        block.rewrite_header(text.as_bytes());
        Ok(())
    }

    /// Serialize into a fresh block with an empty payload part.
    pub fn into_block(&self) -> Result<DataBlock> {
        let text = serde_json::to_string(self)?;
        let mut block = DataBlock::new(text.len().max(64));
        block.set_parts(&[], text.as_bytes());
        Ok(block)
    }
}

pub(crate) fn protocol_validation_error(message: impl Into<String>) -> Error {
    Error::server_error(BrokerErrorCode::ProtocolValidationFailed, message)
}

// ── Builders ──────────────────────────────────────────────────────────────────

/// A broker-protocol message with a fresh message id and an inbound
/// authentication token.
pub fn create_broker_protocol_message(
    message_type: MessageType,
    conversation_id: Uuid,
    token_type: &str,
    token_data: &str,
) -> BrokerProtocol {
    let principal_identity_info = if token_type.is_empty() && token_data.is_empty() {
        None
    } else {
        Some(PrincipalIdentityInfo {
            authentication_token: Some(AuthenticationToken {
                token_type: token_type.to_owned(),
                data: token_data.to_owned(),
            }),
            security_principal: None,
        })
    };

    BrokerProtocol {
        message_type: message_type.as_str().to_owned(),
        message_id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        principal_identity_info,
        ..BrokerProtocol::default()
    }
}

/// The acknowledgment for a received message: same conversation, the
/// original message id, no payload.
pub fn create_acknowledgment_message(conversation_id: Uuid, message_id: Uuid) -> BrokerProtocol {
    BrokerProtocol {
        message_type: MessageType::AsyncRpcAcknowledgment.as_str().to_owned(),
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        ..BrokerProtocol::default()
    }
}

/// A response message on an existing conversation, with a fresh message id.
pub fn create_response_protocol_message(conversation_id: Uuid) -> BrokerProtocol {
    BrokerProtocol {
        message_type: MessageType::AsyncRpcDispatch.as_str().to_owned(),
        message_id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        ..BrokerProtocol::default()
    }
}

/// Rewrite the envelope's peer ids (when provided) and reserialize it into
/// the block, preserving the payload part.
pub fn update_broker_protocol_message_in_block(
    protocol: &mut BrokerProtocol,
    block: &mut DataBlock,
    source_peer_id: Uuid,
    target_peer_id: Uuid,
) -> Result<()> {
    if !source_peer_id.is_nil() {
        protocol.source_peer_id = source_peer_id.to_string();
    }
    if !target_peer_id.is_nil() {
        protocol.target_peer_id = target_peer_id.to_string();
    }
    protocol.write_to_block(block)
}
