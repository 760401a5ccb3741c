use std::collections::HashMap;

use indexmap::IndexMap;
use log::warn;
use ulid::Ulid;

use crate::error::MixerError;

use super::object::{
    AudioConnection, AudioDevice, AudioPort, ConnectionStatus, DeviceStatus, PortDirection,
    RouteEntry,
};

/// The authoritative model of devices, ports, and the connections between
/// them. The store does no locking of its own: it is owned by the session
/// controller thread, which is its single writer. Readers only ever see it
/// between whole commands.
#[derive(Debug, Default)]
pub struct Store {
    devices: HashMap<String, AudioDevice>,
    /// Ports keep their registration order; listings are display-ordered.
    ports: IndexMap<String, AudioPort>,
    connections: HashMap<Ulid, AudioConnection>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, device: AudioDevice) -> Result<(), MixerError> {
        if self.devices.contains_key(&device.id) {
            return Err(MixerError::invalid_argument(format!(
                "device '{}' already exists",
                device.id
            )));
        }
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    /// Removes a device and cascades through every port it owns (and through
    /// them, every connection referencing those ports).
    pub fn remove_device(&mut self, id: &str) -> Result<AudioDevice, MixerError> {
        if !self.devices.contains_key(id) {
            return Err(MixerError::not_found("device", id));
        }
        let port_ids: Vec<String> = self
            .ports
            .values()
            .filter(|port| port.device == id)
            .map(|port| port.id.clone())
            .collect();
        for port_id in port_ids {
            // The device exists, so this can only fail if the port map and
            // the device's port lists are out of sync.
            self.remove_port(&port_id)?;
        }
        Ok(self
            .devices
            .remove(id)
            .expect("device was checked to exist above"))
    }

    pub fn add_port(&mut self, device_id: &str, mut port: AudioPort) -> Result<(), MixerError> {
        if self.ports.contains_key(&port.id) {
            return Err(MixerError::invalid_argument(format!(
                "port '{}' already exists",
                port.id
            )));
        }
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| MixerError::not_found("device", device_id))?;
        port.device = device_id.to_owned();
        if port.is_input() {
            device.input_ports.push(port.id.clone());
        } else {
            device.output_ports.push(port.id.clone());
        }
        device.touch();
        self.ports.insert(port.id.clone(), port);
        Ok(())
    }

    /// Removes a port. Every connection referencing the port is removed
    /// first, then the port is detached from its owning device.
    pub fn remove_port(&mut self, port_id: &str) -> Result<AudioPort, MixerError> {
        if !self.ports.contains_key(port_id) {
            return Err(MixerError::not_found("port", port_id));
        }
        let connection_ids: Vec<Ulid> = self
            .connections
            .values()
            .filter(|c| c.source_id == port_id || c.destination_id == port_id)
            .map(|c| c.id)
            .collect();
        for connection_id in connection_ids {
            self.disconnect(connection_id)?;
        }
        let port = self
            .ports
            .shift_remove(port_id)
            .expect("port was checked to exist above");
        if let Some(device) = self.devices.get_mut(&port.device) {
            device.input_ports.retain(|id| id != port_id);
            device.output_ports.retain(|id| id != port_id);
            device.touch();
        } else {
            warn!("port '{port_id}' referenced missing device '{}'", port.device);
        }
        Ok(port)
    }

    /// Creates a new connection between two existing ports. Calling this
    /// twice for the same pair yields two distinct connections (parallel
    /// routes are allowed); deduplication is the caller's concern.
    pub fn connect(&mut self, source_id: &str, destination_id: &str) -> Result<Ulid, MixerError> {
        if source_id == destination_id {
            return Err(MixerError::invalid_argument(format!(
                "cannot connect port '{source_id}' to itself"
            )));
        }
        if !self.ports.contains_key(source_id) {
            return Err(MixerError::not_found("port", source_id));
        }
        if !self.ports.contains_key(destination_id) {
            return Err(MixerError::not_found("port", destination_id));
        }

        // Nothing below can fail, so a failed connect never mutates.
        let connection = AudioConnection::new(source_id, destination_id);
        let id = connection.id;
        self.ports
            .get_mut(source_id)
            .expect("source port was checked to exist above")
            .connections
            .push(id);
        self.ports
            .get_mut(destination_id)
            .expect("destination port was checked to exist above")
            .connections
            .push(id);
        self.connections.insert(id, connection);
        Ok(id)
    }

    pub fn disconnect(&mut self, connection_id: Ulid) -> Result<AudioConnection, MixerError> {
        let connection = self
            .connections
            .remove(&connection_id)
            .ok_or_else(|| MixerError::not_found("connection", connection_id.to_string()))?;
        for port_id in [&connection.source_id, &connection.destination_id] {
            if let Some(port) = self.ports.get_mut(port_id) {
                port.connections.retain(|id| *id != connection_id);
            }
        }
        Ok(connection)
    }

    pub fn set_connection_volume(
        &mut self,
        connection_id: Ulid,
        volume: f32,
    ) -> Result<(), MixerError> {
        let connection = self
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| MixerError::not_found("connection", connection_id.to_string()))?;
        if !(0.0..=1.0).contains(&volume) {
            return Err(MixerError::out_of_range("volume", volume as f64, 0.0, 1.0));
        }
        connection.volume = volume;
        connection.touch();
        Ok(())
    }

    pub fn set_connection_status(
        &mut self,
        connection_id: Ulid,
        status: ConnectionStatus,
    ) -> Result<(), MixerError> {
        let connection = self
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| MixerError::not_found("connection", connection_id.to_string()))?;
        connection.status = status;
        connection.touch();
        Ok(())
    }

    /// Status bookkeeping: updates the device's status, replaces its last
    /// error, and bumps `last_updated`.
    pub fn set_device_status(
        &mut self,
        id: &str,
        status: DeviceStatus,
        last_error: Option<String>,
    ) -> Result<(), MixerError> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| MixerError::not_found("device", id))?;
        device.status = status;
        device.last_error = last_error;
        device.touch();
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&AudioDevice> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &AudioDevice> {
        self.devices.values()
    }

    pub fn input_devices(&self) -> impl Iterator<Item = &AudioDevice> {
        self.devices.values().filter(|d| d.is_input)
    }

    pub fn output_devices(&self) -> impl Iterator<Item = &AudioDevice> {
        self.devices.values().filter(|d| d.is_output)
    }

    pub fn virtual_devices(&self) -> impl Iterator<Item = &AudioDevice> {
        self.devices.values().filter(|d| d.is_virtual)
    }

    pub fn port(&self, id: &str) -> Option<&AudioPort> {
        self.ports.get(id)
    }

    /// Ports in registration order, optionally narrowed by direction and/or
    /// owning device.
    pub fn list_ports(
        &self,
        direction: Option<PortDirection>,
        device_id: Option<&str>,
    ) -> Vec<&AudioPort> {
        self.ports
            .values()
            .filter(|port| direction.map_or(true, |d| port.direction == d))
            .filter(|port| device_id.map_or(true, |id| port.device == id))
            .collect()
    }

    pub fn connection(&self, id: Ulid) -> Option<&AudioConnection> {
        self.connections.get(&id)
    }

    /// All connections, or only those touching the given port.
    pub fn list_connections(&self, port_id: Option<&str>) -> Vec<&AudioConnection> {
        self.connections
            .values()
            .filter(|c| {
                port_id.map_or(true, |id| c.source_id == id || c.destination_id == id)
            })
            .collect()
    }

    /// Connections from `source_id` to `destination_id`. Routes are
    /// directed, so the reverse pair is a different set.
    pub fn connections_between(&self, source_id: &str, destination_id: &str) -> Vec<Ulid> {
        self.connections
            .values()
            .filter(|c| c.source_id == source_id && c.destination_id == destination_id)
            .map(|c| c.id)
            .collect()
    }

    /// Snapshot of the routing matrix, ordered by creation time so repeated
    /// queries are stable.
    pub fn routes(&self) -> Vec<RouteEntry> {
        let mut connections = self.list_connections(None);
        connections.sort_by_key(|c| c.id);
        connections
            .into_iter()
            .map(|c| RouteEntry {
                source_id: c.source_id.clone(),
                destination_id: c.destination_id.clone(),
                enabled: c.is_active(),
                volume: c.volume,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::object::AudioDevice;

    fn store_with_ports() -> Store {
        let mut store = Store::new();
        store.add_device(AudioDevice::new_test("mixer")).unwrap();
        for (id, direction) in [
            ("input_1", PortDirection::Input),
            ("input_2", PortDirection::Input),
            ("output_1", PortDirection::Output),
            ("output_2", PortDirection::Output),
        ] {
            store
                .add_port("mixer", AudioPort::new_test(id, direction, "mixer"))
                .unwrap();
        }
        store
    }

    #[test]
    fn connect_creates_active_full_volume_connection() {
        let mut store = store_with_ports();
        let before = store.list_connections(None).len();
        let id = store.connect("input_1", "output_1").unwrap();
        let connection = store.connection(id).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert_eq!(connection.volume, 1.0);
        assert_eq!(store.list_connections(None).len(), before + 1);
        assert!(store.port("input_1").unwrap().is_connected());
    }

    #[test]
    fn connect_twice_yields_two_connections() {
        let mut store = store_with_ports();
        let a = store.connect("input_1", "output_1").unwrap();
        let b = store.connect("input_1", "output_1").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.connections_between("input_1", "output_1").len(), 2);
    }

    #[test]
    fn connect_to_self_is_invalid() {
        let mut store = store_with_ports();
        let err = store.connect("input_1", "input_1").unwrap_err();
        assert!(matches!(err, MixerError::InvalidArgument(_)));
        // Even if the port does not exist: self-connection is checked first.
        let err = store.connect("nope", "nope").unwrap_err();
        assert!(matches!(err, MixerError::InvalidArgument(_)));
    }

    #[test]
    fn connect_unknown_port_is_not_found() {
        let mut store = store_with_ports();
        let err = store.connect("input_1", "missing").unwrap_err();
        assert!(matches!(err, MixerError::NotFound { kind: "port", .. }));
        assert!(store.list_connections(None).is_empty());
    }

    #[test]
    fn remove_port_cascades_connections() {
        let mut store = store_with_ports();
        store.connect("input_1", "output_1").unwrap();
        store.connect("input_1", "output_2").unwrap();
        store.connect("input_2", "output_1").unwrap();

        store.remove_port("input_1").unwrap();
        assert!(store.port("input_1").is_none());
        assert_eq!(store.list_connections(None).len(), 1);
        assert!(!store.port("output_2").unwrap().is_connected());
        // The owning device no longer lists the port.
        assert!(!store
            .device("mixer")
            .unwrap()
            .input_ports
            .contains(&"input_1".to_string()));
    }

    #[test]
    fn remove_port_twice_fails_without_changes() {
        let mut store = store_with_ports();
        store.connect("input_2", "output_2").unwrap();
        store.remove_port("input_1").unwrap();
        let before = store.list_connections(None).len();
        let err = store.remove_port("input_1").unwrap_err();
        assert!(matches!(err, MixerError::NotFound { .. }));
        assert_eq!(store.list_connections(None).len(), before);
    }

    #[test]
    fn remove_device_cascades_ports_and_connections() {
        let mut store = store_with_ports();
        store.connect("input_1", "output_1").unwrap();
        store.remove_device("mixer").unwrap();
        assert!(store.list_ports(None, None).is_empty());
        assert!(store.list_connections(None).is_empty());
        assert!(matches!(
            store.remove_device("mixer").unwrap_err(),
            MixerError::NotFound { .. }
        ));
    }

    #[test]
    fn connection_volume_rejects_out_of_range() {
        let mut store = store_with_ports();
        let id = store.connect("input_1", "output_1").unwrap();
        store.set_connection_volume(id, 0.25).unwrap();
        for bad in [-0.01, 1.01, f32::NAN] {
            assert!(matches!(
                store.set_connection_volume(id, bad).unwrap_err(),
                MixerError::OutOfRange { .. }
            ));
        }
        // The prior value is intact after a rejected write.
        assert_eq!(store.connection(id).unwrap().volume, 0.25);
    }

    #[test]
    fn list_ports_filters_and_preserves_order() {
        let store = store_with_ports();
        let inputs = store.list_ports(Some(PortDirection::Input), None);
        let names: Vec<&str> = inputs.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(names, ["input_1", "input_2"]);
        assert_eq!(store.list_ports(None, Some("mixer")).len(), 4);
        assert!(store.list_ports(None, Some("absent")).is_empty());
    }

    #[test]
    fn device_status_bookkeeping() {
        let mut store = store_with_ports();
        let before = store.device("mixer").unwrap().last_updated;
        store
            .set_device_status(
                "mixer",
                DeviceStatus::Error,
                Some("engine went away".to_string()),
            )
            .unwrap();
        let device = store.device("mixer").unwrap();
        assert_eq!(device.status, DeviceStatus::Error);
        assert_eq!(device.last_error.as_deref(), Some("engine went away"));
        assert!(device.last_updated >= before);

        store
            .set_device_status("mixer", DeviceStatus::Online, None)
            .unwrap();
        assert!(store.device("mixer").unwrap().last_error.is_none());
        assert!(matches!(
            store.set_device_status("gone", DeviceStatus::Online, None),
            Err(MixerError::NotFound { .. })
        ));
    }

    #[test]
    fn muted_route_is_disabled_in_matrix() {
        let mut store = store_with_ports();
        let id = store.connect("input_1", "output_1").unwrap();
        store
            .set_connection_status(id, ConnectionStatus::Muted)
            .unwrap();
        let routes = store.routes();
        assert_eq!(routes.len(), 1);
        assert!(!routes[0].enabled);
    }
}
