mod broadcast;

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use derivative::Derivative;
use itertools::Itertools;
use log::{debug, error, info, warn};
use serde_json::Value;
use ulid::Ulid;

use crate::channels::{ChannelTable, PAN_MAX, PAN_MIN, VOLUME_MAX, VOLUME_MIN};
use crate::engine::{AudioEngine, EngineCallback, MeterSample, PortFilter};
use crate::error::MixerError;
use crate::graph::{
    AudioDevice, AudioPort, ConnectionStatus, DeviceStatus, DeviceType, PortDirection, Store,
};
use crate::protocol::{
    ChannelInfo, ChannelList, CommandPayload, Created, DeviceChangeType, DeviceKind, DeviceList,
    EventMessage, EventPayload, ListDevicesFilter, ListPortsFilter, PortInfo, PortList,
    RoutingMatrix, ServerStatusInfo, SetChannelProperties, SetRoute, StartServer,
};

pub use broadcast::{EventBroadcaster, EventReceiver};

/// Id of the device representing this session's own engine client.
pub const MIXER_DEVICE_ID: &str = "mixer";
const SYSTEM_CAPTURE_ID: &str = "system.capture";
const SYSTEM_PLAYBACK_ID: &str = "system.playback";

/// Lifecycle of one engine-client session. `Deactivated` is re-entrant:
/// `Activate` brings the session back up with fresh telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    PortsCreated,
    Activated,
    Deactivated,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialized => "Initialized",
            Self::PortsCreated => "PortsCreated",
            Self::Activated => "Activated",
            Self::Deactivated => "Deactivated",
        }
    }
}

pub type CommandResult = Result<Option<Value>, MixerError>;

enum ControllerMessage {
    Command {
        payload: CommandPayload,
        reply: oneshot::Sender<CommandResult>,
    },
    Subscribe {
        reply: oneshot::Sender<EventReceiver>,
    },
    Engine(EngineCallback),
    Exit,
}

/// Tuning knobs for the controller; all ambient, nothing protocol-visible.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounded queue depth per event subscriber.
    pub event_queue_depth: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            event_queue_depth: 256,
        }
    }
}

/// Owns the controller thread. Dropping the handle shuts the session down:
/// best-effort deactivate, then the thread and the engine are released.
pub struct SessionHandle {
    controller_thread: Option<JoinHandle<()>>,
    adapter_thread: Option<JoinHandle<()>>,
    sender: mpsc::Sender<ControllerMessage>,
}

impl SessionHandle {
    /// Spawns the controller thread and wires the engine's callbacks into
    /// its queue. The engine is moved in; from here on only the controller
    /// thread talks to it.
    pub fn start(mut engine: Box<dyn AudioEngine>, options: SessionOptions) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<ControllerMessage>();
        let (callback_tx, callback_rx) = mpsc::channel::<EngineCallback>();
        engine.set_callback_sender(callback_tx);

        // Engine callbacks arrive on a thread we do not control; this
        // adapter funnels them into the controller's single queue instead
        // of letting them touch state directly.
        let adapter_thread = thread::Builder::new()
            .name("engine-adapter".to_string())
            .spawn({
                let sender = sender.clone();
                move || {
                    for callback in callback_rx {
                        if sender.send(ControllerMessage::Engine(callback)).is_err() {
                            break;
                        }
                    }
                }
            })
            .context("failed to spawn the engine adapter thread")?;

        let controller_thread = thread::Builder::new()
            .name("session-controller".to_string())
            .spawn(move || {
                let mut controller = Controller {
                    engine,
                    store: Store::new(),
                    channels: ChannelTable::new(),
                    broadcaster: EventBroadcaster::new(options.event_queue_depth),
                    state: SessionState::Uninitialized,
                    client_name: String::new(),
                };
                for message in receiver {
                    match message {
                        ControllerMessage::Command { payload, reply } => {
                            let opcode = payload.opcode().to_owned();
                            let result = controller.apply(payload);
                            if let Err(err) = &result {
                                debug!("command '{opcode}' failed: {err}");
                            }
                            // A dropped reply just means the client went
                            // away before its answer; that's its problem.
                            let _ = reply.send(result);
                        }
                        ControllerMessage::Subscribe { reply } => {
                            let _ = reply.send(controller.broadcaster.subscribe());
                        }
                        ControllerMessage::Engine(callback) => {
                            controller.handle_engine_callback(callback);
                        }
                        ControllerMessage::Exit => break,
                    }
                }
                controller.shutdown();
            })
            .context("failed to spawn the session controller thread")?;

        Ok(Self {
            controller_thread: Some(controller_thread),
            adapter_thread: Some(adapter_thread),
            sender,
        })
    }

    /// A cloneable handle for issuing commands; what the protocol
    /// dispatcher holds on to.
    pub fn client(&self) -> SessionClient {
        SessionClient {
            sender: self.sender.clone(),
        }
    }

    pub fn command(&self, payload: CommandPayload) -> CommandResult {
        self.client().command(payload)
    }

    /// Opens a new event subscription with its own bounded queue.
    pub fn subscribe(&self) -> Option<EventReceiver> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Subscribe { reply: tx })
            .ok()?;
        rx.recv().ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.sender.send(ControllerMessage::Exit);
        if let Some(handle) = self.controller_thread.take() {
            if handle.join().is_err() {
                error!("session controller thread panicked");
            }
        }
        // The controller dropping the engine closes the callback channel,
        // which ends the adapter.
        if let Some(handle) = self.adapter_thread.take() {
            if handle.join().is_err() {
                error!("engine adapter thread panicked");
            }
        }
    }
}

#[derive(Clone)]
pub struct SessionClient {
    sender: mpsc::Sender<ControllerMessage>,
}

impl SessionClient {
    /// Executes one command to completion on the controller thread. Blocks
    /// until the answer arrives; commands are fast by contract.
    pub fn command(&self, payload: CommandPayload) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Command { payload, reply: tx })
            .map_err(|_| MixerError::engine_failure("session controller"))?;
        rx.recv()
            .unwrap_or(Err(MixerError::engine_failure("session controller")))
    }
}

/// The single writer. Lives on the controller thread and owns everything:
/// the engine, the port graph, the channel table, and the subscribers.
#[derive(Derivative)]
#[derivative(Debug)]
struct Controller {
    #[derivative(Debug = "ignore")]
    engine: Box<dyn AudioEngine>,
    store: Store,
    channels: ChannelTable,
    broadcaster: EventBroadcaster,
    state: SessionState,
    client_name: String,
}

impl Controller {
    fn apply(&mut self, payload: CommandPayload) -> CommandResult {
        match payload {
            CommandPayload::Initialize { client_name } => self.initialize(&client_name),
            CommandPayload::CreatePorts {
                num_inputs,
                num_outputs,
            } => self.create_ports(num_inputs, num_outputs),
            CommandPayload::Activate => self.activate(),
            CommandPayload::Deactivate => self.deactivate(),
            CommandPayload::SetRoute(route) => self.set_route(route),
            CommandPayload::GetRoutingMatrix => Ok(Some(to_value(&RoutingMatrix {
                routes: self.store.routes(),
            }))),
            CommandPayload::CreateVirtualDevice(request) => self.create_virtual_device(request),
            CommandPayload::RemoveVirtualDevice { device_id } => {
                self.remove_virtual_device(&device_id)
            }
            CommandPayload::ListDevices(filter) => self.list_devices(filter),
            CommandPayload::GetChannels => self.get_channels(),
            CommandPayload::SetChannelProperties(properties) => {
                self.set_channel_properties(properties)
            }
            CommandPayload::ListPorts(filter) => self.list_ports(filter),
            CommandPayload::ConnectPorts {
                source_port,
                destination_port,
            } => {
                let id = self.route_connect(&source_port, &destination_port, 1.0)?;
                Ok(Some(to_value(&Created { id: id.to_string() })))
            }
            CommandPayload::DisconnectPorts {
                source_port,
                destination_port,
            } => {
                self.route_disconnect(&source_port, &destination_port)?;
                Ok(None)
            }
            CommandPayload::GetServerStatus => Ok(Some(to_value(&self.server_status_info()))),
            CommandPayload::StartServer(request) => self.start_server(request),
            CommandPayload::Unknown { command, .. } => Err(MixerError::UnknownCommand(command)),
        }
    }

    // --- lifecycle -------------------------------------------------------

    fn initialize(&mut self, client_name: &str) -> CommandResult {
        if self.state != SessionState::Uninitialized {
            // Idempotent: already initialized means success, no side effects.
            debug!("initialize: already {}", self.state.name());
            return Ok(None);
        }
        if !self.engine.initialize(client_name) {
            return Err(MixerError::engine_failure("initialize"));
        }
        self.client_name = client_name.to_owned();
        self.state = SessionState::Initialized;
        info!("session initialized as '{client_name}'");
        self.discover_system_devices();
        Ok(None)
    }

    fn create_ports(&mut self, num_inputs: u16, num_outputs: u16) -> CommandResult {
        match self.state {
            SessionState::Uninitialized | SessionState::Activated => {
                return Err(self.invalid_state("CreatePorts", "Initialized"));
            }
            _ => {}
        }
        if !self.engine.create_ports(num_inputs, num_outputs) {
            return Err(MixerError::engine_failure("create-ports"));
        }

        // Re-provisioning tears the old mixer device down first.
        if self.store.device(MIXER_DEVICE_ID).is_some() {
            self.remove_device_with_event(MIXER_DEVICE_ID)?;
            self.channels.clear();
        }

        let mut device = AudioDevice::new(
            MIXER_DEVICE_ID,
            self.client_name.clone(),
            DeviceType::EngineClient,
        );
        device.is_input = true;
        device.is_output = true;
        device.sample_rate = self.engine.sample_rate();
        device.buffer_size = self.engine.buffer_size();
        device.input_channels = num_inputs;
        device.output_channels = num_outputs;
        device.status = DeviceStatus::Online;
        self.store.add_device(device)?;

        for i in 1..=num_inputs {
            let name = format!("input_{i}");
            self.store.add_port(
                MIXER_DEVICE_ID,
                AudioPort::new(
                    name.clone(),
                    name,
                    PortDirection::Input,
                    i - 1,
                    MIXER_DEVICE_ID,
                ),
            )?;
        }
        for i in 1..=num_outputs {
            let name = format!("output_{i}");
            self.store.add_port(
                MIXER_DEVICE_ID,
                AudioPort::new(
                    name.clone(),
                    name,
                    PortDirection::Output,
                    i - 1,
                    MIXER_DEVICE_ID,
                ),
            )?;
        }
        // One strip per port, inputs first.
        self.channels.provision(num_inputs + num_outputs);
        self.state = SessionState::PortsCreated;
        info!(
            "provisioned {num_inputs} input and {num_outputs} output ports: {}",
            self.store
                .list_ports(None, Some(MIXER_DEVICE_ID))
                .iter()
                .map(|p| p.id.as_str())
                .join(", ")
        );
        self.emit_device_changed(MIXER_DEVICE_ID, DeviceChangeType::Added);
        Ok(None)
    }

    fn activate(&mut self) -> CommandResult {
        match self.state {
            SessionState::PortsCreated | SessionState::Deactivated => {}
            _ => return Err(self.invalid_state("Activate", "PortsCreated")),
        }
        if !self.engine.activate() {
            return Err(MixerError::engine_failure("activate"));
        }
        self.state = SessionState::Activated;
        self.store
            .set_device_status(MIXER_DEVICE_ID, DeviceStatus::Online, None)
            .expect("the mixer device exists in PortsCreated and later states");
        info!("session activated");
        let status = self.server_status_info();
        self.emit(EventPayload::ServerStatus(status));
        Ok(None)
    }

    fn deactivate(&mut self) -> CommandResult {
        if self.state != SessionState::Activated {
            return Err(self.invalid_state("Deactivate", "Activated"));
        }
        // The engine stops its meter producer before returning; any meter
        // callbacks still queued behind this command are dropped by the
        // state guard in handle_engine_callback.
        if !self.engine.deactivate() {
            return Err(MixerError::engine_failure("deactivate"));
        }
        self.state = SessionState::Deactivated;
        info!("session deactivated");
        let status = self.server_status_info();
        self.emit(EventPayload::ServerStatus(status));
        Ok(None)
    }

    fn start_server(&mut self, request: StartServer) -> CommandResult {
        if self.state == SessionState::Activated {
            return Err(self.invalid_state("StartServer", "a non-activated session"));
        }
        if !self
            .engine
            .configure(request.sample_rate, request.buffer_size, request.periods)
        {
            return Err(MixerError::engine_failure("start-server"));
        }
        debug!(
            "engine configured: {} Hz, {} frames, {} periods, {} priority",
            request.sample_rate, request.buffer_size, request.periods, request.priority
        );
        Ok(None)
    }

    /// Best-effort teardown; engine failures are swallowed because teardown
    /// must always complete.
    fn shutdown(&mut self) {
        if self.state == SessionState::Activated && !self.engine.deactivate() {
            warn!("engine refused to deactivate during shutdown");
        }
        self.state = SessionState::Deactivated;
        debug!("session controller exiting");
    }

    // --- routing ---------------------------------------------------------

    /// Matrix-level routing: enabling an unknown pair creates a connection,
    /// enabling a known pair retunes it, disabling marks it `Disconnected`
    /// but keeps the record so the matrix still shows the (disabled) route.
    /// `DisconnectPorts` is the operation that actually forgets a route.
    fn set_route(&mut self, route: SetRoute) -> CommandResult {
        if self.state == SessionState::Uninitialized {
            return Err(self.invalid_state("SetRoute", "Initialized"));
        }
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&route.volume) {
            return Err(MixerError::out_of_range(
                "volume",
                route.volume as f64,
                VOLUME_MIN as f64,
                VOLUME_MAX as f64,
            ));
        }
        let existing = self
            .store
            .connections_between(&route.source_id, &route.destination_id);
        if route.enabled {
            if existing.is_empty() {
                let id =
                    self.route_connect(&route.source_id, &route.destination_id, route.volume)?;
                return Ok(Some(to_value(&Created { id: id.to_string() })));
            }
            // Only reconnect on the engine side if some connection is not
            // currently carrying signal.
            let any_inactive = existing.iter().any(|id| {
                self.store
                    .connection(*id)
                    .map_or(false, |c| !c.is_active())
            });
            if any_inactive && !self.engine.connect_ports(&route.source_id, &route.destination_id)
            {
                return Err(MixerError::engine_failure("connect-ports"));
            }
            for id in &existing {
                self.store
                    .set_connection_status(*id, ConnectionStatus::Connected)
                    .expect("connection ids were just listed");
                self.store
                    .set_connection_volume(*id, route.volume)
                    .expect("volume was validated above");
            }
            Ok(None)
        } else {
            if existing.is_empty() {
                return Err(MixerError::not_found(
                    "route",
                    format!("{} -> {}", route.source_id, route.destination_id),
                ));
            }
            let any_active = existing.iter().any(|id| {
                self.store
                    .connection(*id)
                    .map_or(false, |c| c.is_active())
            });
            if any_active
                && !self
                    .engine
                    .disconnect_ports(&route.source_id, &route.destination_id)
            {
                return Err(MixerError::engine_failure("disconnect-ports"));
            }
            for id in &existing {
                self.store
                    .set_connection_status(*id, ConnectionStatus::Disconnected)
                    .expect("connection ids were just listed");
            }
            Ok(None)
        }
    }

    /// The order here is what keeps a failed command from mutating: all
    /// validation, then the engine call, then the (infallible) store writes.
    fn route_connect(
        &mut self,
        source_id: &str,
        destination_id: &str,
        volume: f32,
    ) -> Result<Ulid, MixerError> {
        if self.state == SessionState::Uninitialized {
            return Err(self.invalid_state("ConnectPorts", "Initialized"));
        }
        if source_id == destination_id {
            return Err(MixerError::invalid_argument(format!(
                "cannot connect port '{source_id}' to itself"
            )));
        }
        if self.store.port(source_id).is_none() {
            return Err(MixerError::not_found("port", source_id));
        }
        if self.store.port(destination_id).is_none() {
            return Err(MixerError::not_found("port", destination_id));
        }
        if !self.engine.connect_ports(source_id, destination_id) {
            return Err(MixerError::engine_failure("connect-ports"));
        }
        let id = self
            .store
            .connect(source_id, destination_id)
            .expect("ports were checked to exist above");
        self.store
            .set_connection_volume(id, volume)
            .expect("volume was validated above");
        debug!("connected {source_id} -> {destination_id} ({id})");
        Ok(id)
    }

    fn route_disconnect(
        &mut self,
        source_id: &str,
        destination_id: &str,
    ) -> Result<(), MixerError> {
        if self.state == SessionState::Uninitialized {
            return Err(self.invalid_state("DisconnectPorts", "Initialized"));
        }
        let ids = self.store.connections_between(source_id, destination_id);
        if ids.is_empty() {
            return Err(MixerError::not_found(
                "route",
                format!("{source_id} -> {destination_id}"),
            ));
        }
        // Routes already disabled by SetRoute have nothing left to tear
        // down on the engine side.
        let any_active = ids.iter().any(|id| {
            self.store
                .connection(*id)
                .map_or(false, |c| c.is_active())
        });
        if any_active && !self.engine.disconnect_ports(source_id, destination_id) {
            return Err(MixerError::engine_failure("disconnect-ports"));
        }
        for id in ids {
            self.store
                .disconnect(id)
                .expect("connection ids were just listed");
        }
        debug!("disconnected {source_id} -> {destination_id}");
        Ok(())
    }

    // --- devices ---------------------------------------------------------

    fn create_virtual_device(&mut self, request: crate::protocol::CreateVirtualDevice) -> CommandResult {
        if self.state == SessionState::Uninitialized {
            return Err(self.invalid_state("CreateVirtualDevice", "Initialized"));
        }
        if request.device_name.is_empty() {
            return Err(MixerError::invalid_argument("device name must not be empty"));
        }
        let device_id = Ulid::new().to_string();
        let mut device = AudioDevice::new(
            device_id.clone(),
            request.device_name.clone(),
            DeviceType::VirtualDevice,
        );
        device.is_input = request.input_channels > 0;
        device.is_output = request.output_channels > 0;
        device.sample_rate = request.sample_rate.unwrap_or_else(|| self.engine.sample_rate());
        device.buffer_size = self.engine.buffer_size();
        device.input_channels = request.input_channels;
        device.output_channels = request.output_channels;
        device.status = DeviceStatus::Online;
        self.store.add_device(device)?;
        for i in 1..=request.input_channels {
            let port_id = format!("{device_id}:input_{i}");
            self.store.add_port(
                &device_id,
                AudioPort::new(
                    port_id.clone(),
                    port_id,
                    PortDirection::Input,
                    i - 1,
                    device_id.clone(),
                ),
            )?;
        }
        for i in 1..=request.output_channels {
            let port_id = format!("{device_id}:output_{i}");
            self.store.add_port(
                &device_id,
                AudioPort::new(
                    port_id.clone(),
                    port_id,
                    PortDirection::Output,
                    i - 1,
                    device_id.clone(),
                ),
            )?;
        }
        info!("created virtual device '{}' ({device_id})", request.device_name);
        self.emit_device_changed(&device_id, DeviceChangeType::Added);
        Ok(Some(to_value(&Created { id: device_id })))
    }

    fn remove_virtual_device(&mut self, device_id: &str) -> CommandResult {
        let Some(device) = self.store.device(device_id) else {
            return Err(MixerError::not_found("device", device_id));
        };
        if !device.is_virtual {
            return Err(MixerError::invalid_argument(format!(
                "device '{device_id}' is not a virtual device"
            )));
        }
        self.remove_device_with_event(device_id)?;
        Ok(None)
    }

    fn list_devices(&self, filter: ListDevicesFilter) -> CommandResult {
        let devices: Vec<AudioDevice> = match filter.kind {
            None => self.store.devices().cloned().collect(),
            Some(DeviceKind::Input) => self.store.input_devices().cloned().collect(),
            Some(DeviceKind::Output) => self.store.output_devices().cloned().collect(),
            Some(DeviceKind::Virtual) => self.store.virtual_devices().cloned().collect(),
        };
        let devices = devices
            .into_iter()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect();
        Ok(Some(to_value(&DeviceList { devices })))
    }

    fn list_ports(&self, filter: ListPortsFilter) -> CommandResult {
        // Degrades to an empty list before initialization; UIs poll this.
        let ports = self
            .store
            .list_ports(filter.direction, filter.device_id.as_deref())
            .into_iter()
            .map(PortInfo::from_port)
            .collect();
        Ok(Some(to_value(&PortList { ports })))
    }

    /// Seeds the store with the engine's physical ports, grouped into one
    /// capture and one playback device.
    fn discover_system_devices(&mut self) {
        let sources = self.engine.port_list(
            "audio",
            PortFilter {
                direction: Some(PortDirection::Output),
                physical_only: true,
            },
        );
        let sinks = self.engine.port_list(
            "audio",
            PortFilter {
                direction: Some(PortDirection::Input),
                physical_only: true,
            },
        );
        for (device_id, name, ports, direction) in [
            (
                SYSTEM_CAPTURE_ID,
                "System capture",
                sources,
                PortDirection::Output,
            ),
            (
                SYSTEM_PLAYBACK_ID,
                "System playback",
                sinks,
                PortDirection::Input,
            ),
        ] {
            if ports.is_empty() {
                continue;
            }
            let mut device =
                AudioDevice::new(device_id, name, DeviceType::PhysicalInterface);
            // Capture hardware feeds the graph, so it is an input device
            // even though its ports are sources.
            device.is_input = direction == PortDirection::Output;
            device.is_output = !device.is_input;
            device.sample_rate = self.engine.sample_rate();
            device.buffer_size = self.engine.buffer_size();
            match direction {
                PortDirection::Output => device.input_channels = ports.len() as u16,
                PortDirection::Input => device.output_channels = ports.len() as u16,
            }
            device.status = DeviceStatus::Online;
            if let Err(err) = self.store.add_device(device) {
                warn!("skipping system device '{device_id}': {err}");
                continue;
            }
            for (channel, port_name) in ports.iter().enumerate() {
                if let Err(err) = self.store.add_port(
                    device_id,
                    AudioPort::new(
                        port_name.as_str(),
                        port_name.as_str(),
                        direction,
                        channel as u16,
                        device_id,
                    ),
                ) {
                    warn!("skipping system port '{port_name}': {err}");
                }
            }
            self.emit_device_changed(device_id, DeviceChangeType::Added);
        }
    }

    fn remove_device_with_event(&mut self, device_id: &str) -> Result<(), MixerError> {
        let device = self.store.remove_device(device_id)?;
        info!("removed device '{}' ({device_id})", device.name);
        self.emit(EventPayload::DeviceChanged {
            change_type: DeviceChangeType::Removed,
            device_id: device.id,
            device_name: device.name,
            device_type: device.device_type,
        });
        Ok(())
    }

    // --- channels --------------------------------------------------------

    fn set_channel_properties(&mut self, properties: SetChannelProperties) -> CommandResult {
        if self.state == SessionState::Uninitialized {
            return Err(self.invalid_state("SetChannelProperties", "Initialized"));
        }
        // Validate everything up front so the update is all-or-nothing.
        if let Some(volume) = properties.volume {
            if !(VOLUME_MIN..=VOLUME_MAX).contains(&volume) {
                return Err(MixerError::out_of_range(
                    "volume",
                    volume as f64,
                    VOLUME_MIN as f64,
                    VOLUME_MAX as f64,
                ));
            }
        }
        if let Some(pan) = properties.pan {
            if !(PAN_MIN..=PAN_MAX).contains(&pan) {
                return Err(MixerError::out_of_range(
                    "pan",
                    pan as f64,
                    PAN_MIN as f64,
                    PAN_MAX as f64,
                ));
            }
        }
        if let Some(gain) = properties.gain {
            if !gain.is_finite() {
                return Err(MixerError::invalid_argument(format!(
                    "gain must be finite, got {gain}"
                )));
            }
        }

        let channel = properties.channel;
        if let Some(volume) = properties.volume {
            self.channels.set_volume(channel, volume)?;
            self.engine.set_channel_volume(channel, volume);
        }
        if let Some(pan) = properties.pan {
            self.channels.set_pan(channel, pan)?;
            self.engine.set_channel_pan(channel, engine_pan(pan));
        }
        if let Some(gain) = properties.gain {
            self.channels.set_gain(channel, gain)?;
            self.engine.set_channel_gain(channel, gain);
        }
        if let Some(mute) = properties.mute {
            self.channels.set_mute(channel, mute);
            self.engine.set_channel_mute(channel, mute);
        }
        if let Some(solo) = properties.solo {
            self.channels.set_solo(channel, solo);
            self.engine.set_channel_solo(channel, solo);
        }

        let strip = *self.channels.get(channel)?;
        let effective_mute = self.channels.effective_mute(channel)?;
        Ok(Some(to_value(&ChannelInfo::from_channel(
            &strip,
            effective_mute,
        ))))
    }

    fn get_channels(&self) -> CommandResult {
        let channels = self
            .channels
            .snapshot()
            .iter()
            .map(|strip| {
                let effective_mute = self
                    .channels
                    .effective_mute(strip.index)
                    .expect("snapshot indices exist");
                ChannelInfo::from_channel(strip, effective_mute)
            })
            .collect();
        Ok(Some(to_value(&ChannelList { channels })))
    }

    // --- status + callbacks ----------------------------------------------

    fn server_status_info(&self) -> ServerStatusInfo {
        if self.state == SessionState::Uninitialized {
            // Status queries degrade gracefully before initialization.
            return ServerStatusInfo::default();
        }
        let status = self.engine.server_status();
        let latency_ms = if status.sample_rate > 0 {
            status.buffer_size as f32 * 1000.0 / status.sample_rate as f32
        } else {
            0.0
        };
        ServerStatusInfo {
            is_running: status.running,
            sample_rate: status.sample_rate,
            buffer_size: status.buffer_size,
            cpu_load: status.cpu_load,
            xruns: status.xruns,
            latency_ms,
        }
    }

    fn handle_engine_callback(&mut self, callback: EngineCallback) {
        match callback {
            EngineCallback::Meter(sample) => self.handle_meter(sample),
            EngineCallback::ServerStatus(running) => {
                info!("engine server status changed: running={running}");
                if !running && self.state == SessionState::Activated {
                    // The server went away underneath us. Release the
                    // client side best-effort, then drop the devices, their
                    // ports, and the channels: they are all gone with it.
                    if !self.engine.deactivate() {
                        warn!("engine refused to deactivate after server loss");
                    }
                    let device_ids: Vec<String> =
                        self.store.devices().map(|d| d.id.clone()).collect();
                    for device_id in device_ids {
                        if let Err(err) = self.remove_device_with_event(&device_id) {
                            error!("failed to drop device '{device_id}': {err}");
                        }
                    }
                    self.channels.clear();
                    self.state = SessionState::Initialized;
                }
                let mut status = self.server_status_info();
                status.is_running = running;
                self.emit(EventPayload::ServerStatus(status));
            }
        }
    }

    fn handle_meter(&mut self, sample: MeterSample) {
        // Meters queued across a deactivation are dropped here, which is
        // what guarantees no level event follows the deactivated
        // server-status event.
        if self.state != SessionState::Activated {
            return;
        }
        self.emit(EventPayload::LevelUpdate {
            channel_id: sample.channel,
            peak_db: sample.peak_db(),
            rms_db: sample.rms_db(),
        });
    }

    fn emit(&mut self, payload: EventPayload) {
        let message = EventMessage::new(&payload);
        self.broadcaster.publish(&message);
    }

    fn emit_device_changed(&mut self, device_id: &str, change_type: DeviceChangeType) {
        let Some(device) = self.store.device(device_id) else {
            return;
        };
        let payload = EventPayload::DeviceChanged {
            change_type,
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_type: device.device_type,
        };
        self.emit(payload);
    }

    fn invalid_state(&self, operation: &'static str, required: &'static str) -> MixerError {
        MixerError::InvalidState {
            operation,
            required,
            actual: self.state.name(),
        }
    }
}

/// The one place the canonical -1..=1 pan is converted to the engine's
/// 0..=1 convention.
pub(crate) fn engine_pan(pan: f32) -> f32 {
    (pan + 1.0) / 2.0
}

fn to_value<T: serde::Serialize>(data: &T) -> Value {
    serde_json::to_value(data).expect("response types always serialize")
}
