//! Async-RPC payload model: the request/response pair carried inside
//! dispatched blocks.

use courier_broker::BrokerProtocol;
use courier_errors::{Error, ServerErrorJson};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsyncRpcRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_type: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsyncRpcResponse {
    /// Set when the remote processing failed; carries the full error
    /// envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_error_json: Option<ServerErrorJson>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Either a request or a response; acknowledgment messages carry no
/// payload at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsyncRpcPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_request: Option<AsyncRpcRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_rpc_response: Option<AsyncRpcResponse>,
}

impl AsyncRpcPayload {
    pub fn request(request: AsyncRpcRequest) -> Self {
        AsyncRpcPayload {
            async_rpc_request: Some(request),
            async_rpc_response: None,
        }
    }

    pub fn response(response: AsyncRpcResponse) -> Self {
        AsyncRpcPayload {
            async_rpc_request: None,
            async_rpc_response: Some(response),
        }
    }
}

pub fn is_request_payload(payload: &Option<AsyncRpcPayload>) -> bool {
    payload
        .as_ref()
        .is_some_and(|p| p.async_rpc_request.is_some())
}

pub fn is_response_payload(payload: &Option<AsyncRpcPayload>) -> bool {
    payload
        .as_ref()
        .is_some_and(|p| p.async_rpc_response.is_some())
}

/// An error response payload wrapping the full envelope of `err`.
pub fn create_error_payload(err: &Error) -> AsyncRpcPayload {
    AsyncRpcPayload::response(AsyncRpcResponse {
        server_error_json: Some(ServerErrorJson::from_error(err)),
        data: serde_json::Value::Null,
    })
}

/// One queued conversation message: the envelope plus its payload.
#[derive(Debug, Clone, Default)]
pub struct MessageInfo {
    pub protocol: BrokerProtocol,
    pub payload: Option<AsyncRpcPayload>,
}

impl MessageInfo {
    pub fn new(protocol: BrokerProtocol, payload: Option<AsyncRpcPayload>) -> Self {
        MessageInfo { protocol, payload }
    }
}
