use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::channels::Channel;
use crate::error::MixerError;
use crate::graph::{AudioDevice, AudioPort, DeviceType, PortDirection, RouteEntry};

/// Every command opcode the session understands, one variant per payload
/// shape, plus a catch-all so unknown opcodes survive decoding and can be
/// answered (with `UnknownCommand`) instead of tearing down the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Initialize { client_name: String },
    CreatePorts { num_inputs: u16, num_outputs: u16 },
    Activate,
    Deactivate,
    SetRoute(SetRoute),
    GetRoutingMatrix,
    CreateVirtualDevice(CreateVirtualDevice),
    RemoveVirtualDevice { device_id: String },
    ListDevices(ListDevicesFilter),
    GetChannels,
    SetChannelProperties(SetChannelProperties),
    ListPorts(ListPortsFilter),
    ConnectPorts { source_port: String, destination_port: String },
    DisconnectPorts { source_port: String, destination_port: String },
    GetServerStatus,
    StartServer(StartServer),
    Unknown { command: String, parameters: Value },
}

impl CommandPayload {
    /// Decodes an opcode + raw parameters. A known opcode with malformed
    /// parameters is an `InvalidArgument` error; an opcode we have never
    /// heard of decodes successfully into `Unknown`.
    pub fn decode(command: &str, parameters: Value) -> Result<Self, MixerError> {
        Ok(match command {
            "Initialize" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Params {
                    client_name: String,
                }
                let p: Params = parse(command, parameters)?;
                Self::Initialize {
                    client_name: p.client_name,
                }
            }
            "CreatePorts" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Params {
                    num_inputs: u16,
                    num_outputs: u16,
                }
                let p: Params = parse(command, parameters)?;
                Self::CreatePorts {
                    num_inputs: p.num_inputs,
                    num_outputs: p.num_outputs,
                }
            }
            "Activate" => Self::Activate,
            "Deactivate" => Self::Deactivate,
            "SetRoute" => Self::SetRoute(parse(command, parameters)?),
            "GetRoutingMatrix" => Self::GetRoutingMatrix,
            "CreateVirtualDevice" => Self::CreateVirtualDevice(parse(command, parameters)?),
            "RemoveVirtualDevice" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Params {
                    device_id: String,
                }
                let p: Params = parse(command, parameters)?;
                Self::RemoveVirtualDevice {
                    device_id: p.device_id,
                }
            }
            "ListDevices" => Self::ListDevices(parse_or_default(command, parameters)?),
            "GetChannels" => Self::GetChannels,
            "SetChannelProperties" => Self::SetChannelProperties(parse(command, parameters)?),
            "ListPorts" => Self::ListPorts(parse_or_default(command, parameters)?),
            "ConnectPorts" => {
                let p: PortPair = parse(command, parameters)?;
                Self::ConnectPorts {
                    source_port: p.source_port,
                    destination_port: p.destination_port,
                }
            }
            "DisconnectPorts" => {
                let p: PortPair = parse(command, parameters)?;
                Self::DisconnectPorts {
                    source_port: p.source_port,
                    destination_port: p.destination_port,
                }
            }
            "GetServerStatus" => Self::GetServerStatus,
            "StartServer" => Self::StartServer(parse_or_default(command, parameters)?),
            _ => Self::Unknown {
                command: command.to_owned(),
                parameters,
            },
        })
    }

    pub fn opcode(&self) -> &str {
        match self {
            Self::Initialize { .. } => "Initialize",
            Self::CreatePorts { .. } => "CreatePorts",
            Self::Activate => "Activate",
            Self::Deactivate => "Deactivate",
            Self::SetRoute(_) => "SetRoute",
            Self::GetRoutingMatrix => "GetRoutingMatrix",
            Self::CreateVirtualDevice(_) => "CreateVirtualDevice",
            Self::RemoveVirtualDevice { .. } => "RemoveVirtualDevice",
            Self::ListDevices(_) => "ListDevices",
            Self::GetChannels => "GetChannels",
            Self::SetChannelProperties(_) => "SetChannelProperties",
            Self::ListPorts(_) => "ListPorts",
            Self::ConnectPorts { .. } => "ConnectPorts",
            Self::DisconnectPorts { .. } => "DisconnectPorts",
            Self::GetServerStatus => "GetServerStatus",
            Self::StartServer(_) => "StartServer",
            Self::Unknown { command, .. } => command,
        }
    }

    /// The wire form of the parameters, for building outbound commands.
    pub fn parameters(&self) -> Value {
        match self {
            Self::Initialize { client_name } => {
                serde_json::json!({ "clientName": client_name })
            }
            Self::CreatePorts {
                num_inputs,
                num_outputs,
            } => serde_json::json!({ "numInputs": num_inputs, "numOutputs": num_outputs }),
            Self::Activate
            | Self::Deactivate
            | Self::GetRoutingMatrix
            | Self::GetChannels
            | Self::GetServerStatus => Value::Null,
            Self::ListDevices(p) => to_value(p),
            Self::SetRoute(p) => to_value(p),
            Self::CreateVirtualDevice(p) => to_value(p),
            Self::RemoveVirtualDevice { device_id } => {
                serde_json::json!({ "deviceId": device_id })
            }
            Self::SetChannelProperties(p) => to_value(p),
            Self::ListPorts(p) => to_value(p),
            Self::ConnectPorts {
                source_port,
                destination_port,
            }
            | Self::DisconnectPorts {
                source_port,
                destination_port,
            } => serde_json::json!({
                "sourcePort": source_port,
                "destinationPort": destination_port,
            }),
            Self::StartServer(p) => to_value(p),
            Self::Unknown { parameters, .. } => parameters.clone(),
        }
    }
}

fn parse<T: DeserializeOwned>(command: &str, parameters: Value) -> Result<T, MixerError> {
    serde_json::from_value(parameters).map_err(|err| {
        MixerError::invalid_argument(format!("malformed parameters for '{command}': {err}"))
    })
}

/// Like `parse`, but a missing/null payload means "all defaults".
fn parse_or_default<T: DeserializeOwned + Default>(
    command: &str,
    parameters: Value,
) -> Result<T, MixerError> {
    if parameters.is_null() {
        Ok(T::default())
    } else {
        parse(command, parameters)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("payload types always serialize")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortPair {
    source_port: String,
    destination_port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRoute {
    pub source_id: String,
    pub destination_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVirtualDevice {
    pub device_name: String,
    #[serde(default = "default_channel_count")]
    pub input_channels: u16,
    #[serde(default = "default_channel_count")]
    pub output_channels: u16,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

/// Partial update: only the fields present are applied, and either all of
/// them land or none do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChannelProperties {
    pub channel: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// -1.0 left .. 1.0 right, 0.0 center.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solo: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPortsFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<PortDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Input,
    Output,
    Virtual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDevicesFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DeviceKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartServer {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
    #[serde(default = "default_periods")]
    pub periods: u16,
    #[serde(default = "default_priority")]
    pub priority: String,
}

impl Default for StartServer {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            buffer_size: default_buffer_size(),
            periods: default_periods(),
            priority: default_priority(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

fn default_channel_count() -> u16 {
    2
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_buffer_size() -> u32 {
    1024
}

fn default_periods() -> u16 {
    2
}

fn default_priority() -> String {
    "high".to_string()
}

// --- Response data shapes -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    pub devices: Vec<AudioDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMatrix {
    pub routes: Vec<RouteEntry>,
}

/// Wire view of one port, with the derived flags spelled out so clients do
/// not have to recompute them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub channel: u16,
    pub device: String,
    pub is_connected: bool,
    pub connections: Vec<Ulid>,
}

impl PortInfo {
    pub fn from_port(port: &AudioPort) -> Self {
        Self {
            id: port.id.clone(),
            name: port.name.clone(),
            is_input: port.is_input(),
            channel: port.channel,
            device: port.device.clone(),
            is_connected: port.is_connected(),
            connections: port.connections.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortList {
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Created {
    pub id: String,
}

/// Server snapshot as reported to clients. `latency_ms` is derived from
/// buffer size over sample rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusInfo {
    pub is_running: bool,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub cpu_load: f32,
    pub xruns: u32,
    pub latency_ms: f32,
}

/// One mixer strip plus its derived audibility, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub index: u16,
    pub volume: f32,
    pub pan: f32,
    pub gain_db: f32,
    pub mute: bool,
    pub solo: bool,
    pub effective_mute: bool,
}

impl ChannelInfo {
    pub fn from_channel(channel: &Channel, effective_mute: bool) -> Self {
        Self {
            index: channel.index,
            volume: channel.volume,
            pan: channel.pan,
            gain_db: channel.gain_db,
            mute: channel.mute,
            solo: channel.solo,
            effective_mute,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelList {
    pub channels: Vec<ChannelInfo>,
}

// --- Events ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceChangeType {
    Added,
    Removed,
}

/// Everything the session pushes to subscribers, keyed by event name, plus
/// a catch-all for events this build does not know about.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Levels in dB, floor -120. The engine-side normalized form never
    /// appears on the wire.
    LevelUpdate {
        channel_id: u16,
        peak_db: f32,
        rms_db: f32,
    },
    DeviceChanged {
        change_type: DeviceChangeType,
        device_id: String,
        device_name: String,
        device_type: DeviceType,
    },
    ServerStatus(ServerStatusInfo),
    Unknown {
        event_name: String,
        event_data: Value,
    },
}

impl EventPayload {
    pub fn name(&self) -> &str {
        match self {
            Self::LevelUpdate { .. } => "LevelUpdate",
            Self::DeviceChanged { .. } => "DeviceChanged",
            Self::ServerStatus(_) => "ServerStatus",
            Self::Unknown { event_name, .. } => event_name,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::LevelUpdate {
                channel_id,
                peak_db,
                rms_db,
            } => serde_json::json!({
                "channelId": channel_id,
                "peakDb": peak_db,
                "rmsDb": rms_db,
            }),
            Self::DeviceChanged {
                change_type,
                device_id,
                device_name,
                device_type,
            } => serde_json::json!({
                "changeType": change_type,
                "deviceId": device_id,
                "deviceName": device_name,
                "deviceType": device_type,
            }),
            Self::ServerStatus(info) => to_value(info),
            Self::Unknown { event_data, .. } => event_data.clone(),
        }
    }

    /// Decodes an event by name; unknown names or malformed data fall back
    /// to `Unknown` (events are advisory, decoding never fails).
    pub fn decode(event_name: &str, event_data: Value) -> Self {
        let unknown = |data: Value| Self::Unknown {
            event_name: event_name.to_owned(),
            event_data: data,
        };
        match event_name {
            "LevelUpdate" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Data {
                    channel_id: u16,
                    peak_db: f32,
                    rms_db: f32,
                }
                match serde_json::from_value::<Data>(event_data.clone()) {
                    Ok(d) => Self::LevelUpdate {
                        channel_id: d.channel_id,
                        peak_db: d.peak_db,
                        rms_db: d.rms_db,
                    },
                    Err(_) => unknown(event_data),
                }
            }
            "DeviceChanged" => {
                #[derive(Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Data {
                    change_type: DeviceChangeType,
                    device_id: String,
                    device_name: String,
                    device_type: DeviceType,
                }
                match serde_json::from_value::<Data>(event_data.clone()) {
                    Ok(d) => Self::DeviceChanged {
                        change_type: d.change_type,
                        device_id: d.device_id,
                        device_name: d.device_name,
                        device_type: d.device_type,
                    },
                    Err(_) => unknown(event_data),
                }
            }
            "ServerStatus" => match serde_json::from_value(event_data.clone()) {
                Ok(info) => Self::ServerStatus(info),
                Err(_) => unknown(event_data),
            },
            _ => unknown(event_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn known_opcode_decodes_typed() {
        let payload = CommandPayload::decode(
            "SetRoute",
            json!({"sourceId": "input_1", "destinationId": "output_1"}),
        )
        .unwrap();
        assert_eq!(
            payload,
            CommandPayload::SetRoute(SetRoute {
                source_id: "input_1".into(),
                destination_id: "output_1".into(),
                enabled: true,
                volume: 1.0,
            })
        );
    }

    #[test]
    fn unknown_opcode_survives_decoding() {
        let payload =
            CommandPayload::decode("Reticulate", json!({"splines": true})).unwrap();
        assert_eq!(payload.opcode(), "Reticulate");
        assert!(matches!(payload, CommandPayload::Unknown { .. }));
    }

    #[test]
    fn malformed_known_opcode_is_invalid_argument() {
        let err =
            CommandPayload::decode("CreatePorts", json!({"numInputs": "two"})).unwrap_err();
        assert!(matches!(err, MixerError::InvalidArgument(_)));
    }

    #[test]
    fn nullary_commands_accept_null_parameters() {
        for opcode in ["Activate", "Deactivate", "ListDevices", "GetServerStatus"] {
            let payload = CommandPayload::decode(opcode, Value::Null).unwrap();
            assert_eq!(payload.opcode(), opcode);
        }
        // ListPorts and StartServer default their filters when absent.
        assert_eq!(
            CommandPayload::decode("ListPorts", Value::Null).unwrap(),
            CommandPayload::ListPorts(ListPortsFilter::default())
        );
        assert_eq!(
            CommandPayload::decode("StartServer", Value::Null).unwrap(),
            CommandPayload::StartServer(StartServer::default())
        );
    }

    #[test]
    fn parameters_round_trip_through_decode() {
        let original = CommandPayload::SetChannelProperties(SetChannelProperties {
            channel: 3,
            volume: Some(0.4),
            pan: Some(-0.25),
            mute: Some(true),
            ..Default::default()
        });
        let decoded =
            CommandPayload::decode(original.opcode(), original.parameters()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn level_update_event_is_db_labelled() {
        let payload = EventPayload::LevelUpdate {
            channel_id: 2,
            peak_db: -6.0,
            rms_db: -9.0,
        };
        let data = payload.data();
        assert_eq!(data["peakDb"], json!(-6.0));
        assert_eq!(data["rmsDb"], json!(-9.0));
        assert_eq!(EventPayload::decode(payload.name(), data), payload);
    }

    #[test]
    fn unknown_event_keeps_its_data() {
        let payload = EventPayload::decode("SomethingNew", json!({"x": 1}));
        assert_eq!(payload.name(), "SomethingNew");
        assert_eq!(payload.data(), json!({"x": 1}));
    }
}
