mod dispatch;
mod payload;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

pub use dispatch::{CommandDispatcher, HeartbeatMonitor, HeartbeatOutcome};
pub use payload::{
    ChannelInfo, ChannelList, CommandPayload, CreateVirtualDevice, Created, DeviceChangeType,
    DeviceKind, DeviceList, EventPayload, ListDevicesFilter, ListPortsFilter, PortInfo, PortList,
    RoutingMatrix, ServerStatusInfo, SetChannelProperties, SetRoute, StartServer,
};

/// Everything that crosses the wire between a controller client and the
/// session. The tag and field names are the contract; how the bytes reach a
/// peer is the transport's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum Message {
    #[serde(rename = "CommandMessage")]
    Command(CommandMessage),
    #[serde(rename = "ResponseMessage")]
    Response(ResponseMessage),
    #[serde(rename = "EventMessage")]
    Event(EventMessage),
    #[serde(rename = "HeartbeatMessage")]
    Heartbeat(HeartbeatMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub message_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>, parameters: Value) -> Self {
        Self {
            message_id: Ulid::new(),
            timestamp: Utc::now(),
            command: command.into(),
            parameters,
        }
    }

    /// Convenience for typed payloads: takes the opcode and parameter shape
    /// from the payload itself.
    pub fn from_payload(payload: &CommandPayload) -> Self {
        Self::new(payload.opcode(), payload.parameters())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub message_id: Ulid,
    pub timestamp: DateTime<Utc>,
    /// Correlation id: the `message_id` of the command this answers.
    pub in_response_to: Ulid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseMessage {
    /// A success response. `success == true` means no error fields, ever;
    /// the constructors are the only way these get built.
    pub fn ok(in_response_to: Ulid, data: Option<Value>) -> Self {
        Self {
            message_id: Ulid::new(),
            timestamp: Utc::now(),
            in_response_to,
            success: true,
            error_code: None,
            error_message: None,
            data,
        }
    }

    pub fn err(in_response_to: Ulid, error: &crate::error::MixerError) -> Self {
        Self {
            message_id: Ulid::new(),
            timestamp: Utc::now(),
            in_response_to,
            success: false,
            error_code: Some(error.code()),
            error_message: Some(error.to_string()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub message_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    #[serde(default)]
    pub event_data: Value,
}

impl EventMessage {
    pub fn new(payload: &EventPayload) -> Self {
        Self {
            message_id: Ulid::new(),
            timestamp: Utc::now(),
            event_name: payload.name().to_owned(),
            event_data: payload.data(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub message_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    /// Strictly increasing per client. A regression is a lost-ordering
    /// signal, not an error.
    pub sequence_number: u64,
}

impl HeartbeatMessage {
    pub fn new(client_id: impl Into<String>, sequence_number: u64) -> Self {
        Self {
            message_id: Ulid::new(),
            timestamp: Utc::now(),
            client_id: client_id.into(),
            sequence_number,
        }
    }
}
