use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// What kind of backend a device belongs to. Everything the engine reports
/// that we cannot classify lands on `Unknown` rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    Unknown,
    PhysicalInterface,
    VirtualDevice,
    EngineClient,
    Asio,
    Wasapi,
    DirectSound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Busy,
    Initializing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connected,
    Muted,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub is_input: bool,
    pub is_output: bool,
    pub is_virtual: bool,
    pub is_enabled: bool,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub input_channels: u16,
    pub output_channels: u16,
    pub status: DeviceStatus,
    /// Port ids in registration order. The device owns its ports; the store
    /// keeps these lists in sync with the port map.
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
    pub properties: HashMap<String, String>,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl AudioDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
            is_input: false,
            is_output: false,
            is_virtual: device_type == DeviceType::VirtualDevice,
            is_enabled: true,
            sample_rate: 0,
            buffer_size: 0,
            input_channels: 0,
            output_channels: 0,
            status: DeviceStatus::Offline,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            properties: HashMap::new(),
            last_error: None,
            last_updated: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    #[cfg(test)]
    pub fn new_test(id: &str) -> Self {
        Self::new(id, format!("test device {id}"), DeviceType::EngineClient)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPort {
    pub id: String,
    pub name: String,
    pub direction: PortDirection,
    /// Channel index within the owning device, zero-based.
    pub channel: u16,
    /// Id of the owning device.
    pub device: String,
    /// Ids of the connections this port participates in. Connections hold
    /// port ids, never the ports themselves; this is the back-reference.
    pub connections: Vec<Ulid>,
}

impl AudioPort {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        direction: PortDirection,
        channel: u16,
        device: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            direction,
            channel,
            device: device.into(),
            connections: Vec::new(),
        }
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    /// Derived: a port counts as connected while at least one connection
    /// references it.
    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    #[cfg(test)]
    pub fn new_test(id: &str, direction: PortDirection, device: &str) -> Self {
        Self::new(id, id, direction, 0, device)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConnection {
    pub id: Ulid,
    pub source_id: String,
    pub destination_id: String,
    pub status: ConnectionStatus,
    /// Linear volume scalar, 0.0..=1.0. Writes outside the range are
    /// rejected by the store, never clamped.
    pub volume: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AudioConnection {
    pub fn new(source_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            status: ConnectionStatus::Connected,
            volume: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived: only `Connected` routes carry signal.
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One row of the routing-matrix snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub source_id: String,
    pub destination_id: String,
    pub enabled: bool,
    pub volume: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_defaults() {
        let connection = AudioConnection::new("input_1", "output_1");
        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert_eq!(connection.volume, 1.0);
        assert!(connection.is_active());
    }

    #[test]
    fn muted_connection_is_inactive() {
        let mut connection = AudioConnection::new("input_1", "output_1");
        connection.status = ConnectionStatus::Muted;
        assert!(!connection.is_active());
    }

    #[test]
    fn port_connected_is_derived() {
        let mut port = AudioPort::new_test("input_1", PortDirection::Input, "mixer");
        assert!(!port.is_connected());
        port.connections.push(Ulid::new());
        assert!(port.is_connected());
    }
}
