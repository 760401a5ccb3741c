use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::Sender,
    Arc,
};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::graph::PortDirection;

use super::{AudioEngine, EngineCallback, EngineStatus, MeterSample, PortFilter};

/// Stand-in for the native bridge. State transitions behave like the real
/// server (refusing out-of-order calls) and meter telemetry is produced on
/// a background thread the way the bridge's callback thread would, but the
/// values are a deterministic ramp so tests can assert on them.
pub struct MockEngine {
    client_name: Option<String>,
    sample_rate: u32,
    buffer_size: u32,
    num_inputs: u16,
    num_outputs: u16,
    activated: bool,
    /// Engine-side patchbay by port name. Duplicate pairs are allowed;
    /// parallel routes are the caller's policy decision.
    connections: Vec<(String, String)>,
    channel_volumes: Vec<(u16, f32)>,
    channel_pans: Vec<(u16, f32)>,
    meter_interval: Duration,
    callback_tx: Option<Sender<EngineCallback>>,
    ticker: Option<MeterTicker>,
}

struct MeterTicker {
    quit: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl MockEngine {
    pub fn new(sample_rate: u32, buffer_size: u32, meter_interval: Duration) -> Self {
        Self {
            client_name: None,
            sample_rate,
            buffer_size,
            num_inputs: 0,
            num_outputs: 0,
            activated: false,
            connections: Vec::new(),
            channel_volumes: Vec::new(),
            channel_pans: Vec::new(),
            meter_interval,
            callback_tx: None,
            ticker: None,
        }
    }

    /// The level a given channel reports at a given tick. Exposed so tests
    /// can predict meter payloads.
    pub fn synth_peak(tick: u64, channel: u16) -> f32 {
        ((tick + channel as u64 * 3) % 21) as f32 / 20.0
    }

    #[cfg(test)]
    pub fn last_channel_volume(&self, channel: u16) -> Option<f32> {
        self.channel_volumes
            .iter()
            .rev()
            .find(|(c, _)| *c == channel)
            .map(|(_, v)| *v)
    }

    #[cfg(test)]
    pub fn last_channel_pan(&self, channel: u16) -> Option<f32> {
        self.channel_pans
            .iter()
            .rev()
            .find(|(c, _)| *c == channel)
            .map(|(_, p)| *p)
    }

    #[cfg(test)]
    pub fn connection_count(&self, source: &str, destination: &str) -> usize {
        self.connections
            .iter()
            .filter(|(s, d)| s == source && d == destination)
            .count()
    }

    fn client_port_names(&self) -> Vec<(String, PortDirection)> {
        let client = self.client_name.as_deref().unwrap_or("mixerd");
        let mut names = Vec::new();
        for i in 1..=self.num_inputs {
            names.push((format!("{client}:input_{i}"), PortDirection::Input));
        }
        for i in 1..=self.num_outputs {
            names.push((format!("{client}:output_{i}"), PortDirection::Output));
        }
        names
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.quit.store(true, Ordering::SeqCst);
            if ticker.handle.join().is_err() {
                warn!("meter ticker thread panicked");
            }
        }
    }
}

impl AudioEngine for MockEngine {
    fn initialize(&mut self, client_name: &str) -> bool {
        if client_name.is_empty() {
            return false;
        }
        self.client_name = Some(client_name.to_owned());
        debug!("mock engine initialized as '{client_name}'");
        true
    }

    fn create_ports(&mut self, num_inputs: u16, num_outputs: u16) -> bool {
        if self.client_name.is_none() || self.activated {
            return false;
        }
        self.num_inputs = num_inputs;
        self.num_outputs = num_outputs;
        true
    }

    fn activate(&mut self) -> bool {
        if self.client_name.is_none() || self.activated {
            return false;
        }
        let Some(tx) = self.callback_tx.clone() else {
            warn!("activate called with no callback sender attached");
            return false;
        };
        self.activated = true;

        let quit = Arc::new(AtomicBool::new(false));
        let channels = self.num_inputs + self.num_outputs;
        let interval = self.meter_interval;
        let handle = thread::Builder::new()
            .name("mock-meter".to_string())
            .spawn({
                let quit = quit.clone();
                move || {
                    let mut tick: u64 = 0;
                    while !quit.load(Ordering::SeqCst) {
                        for channel in 0..channels {
                            let peak = MockEngine::synth_peak(tick, channel);
                            let sample = MeterSample {
                                channel,
                                peak,
                                // RMS sits a steady 3 dB under the peak.
                                rms: peak * super::db_to_linear(-3.0),
                            };
                            if tx.send(EngineCallback::Meter(sample)).is_err() {
                                // Receiver is gone; nothing left to meter for.
                                return;
                            }
                        }
                        tick += 1;
                        thread::sleep(interval);
                    }
                }
            })
            .expect("failed to spawn mock meter thread");
        self.ticker = Some(MeterTicker { quit, handle });
        true
    }

    fn deactivate(&mut self) -> bool {
        if !self.activated {
            return false;
        }
        // Joining the ticker is what makes the stop synchronous: after this
        // returns no further meter callback can be in flight.
        self.stop_ticker();
        self.activated = false;
        debug!(
            "mock engine deactivated after {} volume and {} pan updates",
            self.channel_volumes.len(),
            self.channel_pans.len()
        );
        true
    }

    fn set_channel_volume(&mut self, channel: u16, volume: f32) {
        self.channel_volumes.push((channel, volume));
    }

    fn set_channel_pan(&mut self, channel: u16, pan: f32) {
        self.channel_pans.push((channel, pan));
    }

    fn set_channel_gain(&mut self, _channel: u16, _gain_db: f32) {}

    fn set_channel_mute(&mut self, _channel: u16, _mute: bool) {}

    fn set_channel_solo(&mut self, _channel: u16, _solo: bool) {}

    fn connect_ports(&mut self, source: &str, destination: &str) -> bool {
        if self.client_name.is_none() {
            return false;
        }
        self.connections
            .push((source.to_owned(), destination.to_owned()));
        true
    }

    fn disconnect_ports(&mut self, source: &str, destination: &str) -> bool {
        let before = self.connections.len();
        self.connections
            .retain(|(s, d)| !(s == source && d == destination));
        self.connections.len() != before
    }

    fn port_list(&self, _type_filter: &str, filter: PortFilter) -> Vec<String> {
        // Physical system ports plus whatever client ports exist. JACK
        // semantics: capture ports produce signal (outputs), playback ports
        // consume it (inputs).
        let mut ports: Vec<(String, PortDirection, bool)> = vec![
            ("system:capture_1".to_string(), PortDirection::Output, true),
            ("system:capture_2".to_string(), PortDirection::Output, true),
            ("system:playback_1".to_string(), PortDirection::Input, true),
            ("system:playback_2".to_string(), PortDirection::Input, true),
        ];
        ports.extend(
            self.client_port_names()
                .into_iter()
                .map(|(name, direction)| (name, direction, false)),
        );
        ports
            .into_iter()
            .filter(|(_, direction, physical)| {
                filter.direction.map_or(true, |d| *direction == d)
                    && (!filter.physical_only || *physical)
            })
            .map(|(name, _, _)| name)
            .collect()
    }

    fn configure(&mut self, sample_rate: u32, buffer_size: u32, _periods: u16) -> bool {
        if self.activated {
            return false;
        }
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        true
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn cpu_load(&self) -> f32 {
        if self.activated {
            // Scales with the number of strips; constant for a given setup.
            2.5 + 0.25 * (self.num_inputs + self.num_outputs) as f32
        } else {
            0.0
        }
    }

    fn is_server_running(&self) -> bool {
        self.activated
    }

    fn server_status(&self) -> EngineStatus {
        EngineStatus {
            running: self.activated,
            sample_rate: self.sample_rate,
            buffer_size: self.buffer_size,
            cpu_load: self.cpu_load(),
            xruns: 0,
        }
    }

    fn set_callback_sender(&mut self, sender: Sender<EngineCallback>) {
        self.callback_tx = Some(sender);
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn engine() -> (MockEngine, mpsc::Receiver<EngineCallback>) {
        let mut engine = MockEngine::new(48000, 256, Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        engine.set_callback_sender(tx);
        (engine, rx)
    }

    #[test]
    fn lifecycle_ordering_is_enforced() {
        let (mut engine, _rx) = engine();
        assert!(!engine.create_ports(2, 2), "ports before initialize");
        assert!(!engine.activate(), "activate before initialize");
        assert!(engine.initialize("mixer"));
        assert!(engine.create_ports(2, 2));
        assert!(engine.activate());
        assert!(!engine.activate(), "double activate");
        assert!(engine.deactivate());
        assert!(!engine.deactivate(), "double deactivate");
    }

    #[test]
    fn meters_flow_while_active_and_stop_after_deactivate() {
        let (mut engine, rx) = engine();
        engine.initialize("mixer");
        engine.create_ports(1, 1);
        engine.activate();

        let first = rx
            .recv_timeout(Duration::from_millis(500))
            .expect("a meter callback while activated");
        assert!(matches!(first, EngineCallback::Meter(_)));

        engine.deactivate();
        // Drain whatever was queued before the stop.
        while rx.try_recv().is_ok() {}
        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "no meter callbacks after deactivate returned"
        );
    }

    #[test]
    fn meter_values_are_deterministic() {
        assert_eq!(MockEngine::synth_peak(0, 0), 0.0);
        assert_eq!(MockEngine::synth_peak(20, 0), 1.0);
        // Same tick and channel always produce the same value.
        assert_eq!(MockEngine::synth_peak(7, 3), MockEngine::synth_peak(7, 3));
        for tick in 0..100 {
            for channel in 0..8 {
                let peak = MockEngine::synth_peak(tick, channel);
                assert!((0.0..=1.0).contains(&peak));
            }
        }
    }

    #[test]
    fn port_list_respects_filters() {
        let (mut engine, _rx) = engine();
        engine.initialize("mixer");
        engine.create_ports(2, 2);

        let physical = engine.port_list(
            "audio",
            PortFilter {
                physical_only: true,
                ..Default::default()
            },
        );
        assert_eq!(physical.len(), 4);
        assert!(physical.iter().all(|name| name.starts_with("system:")));

        let sinks = engine.port_list(
            "audio",
            PortFilter {
                direction: Some(PortDirection::Input),
                ..Default::default()
            },
        );
        assert!(sinks.contains(&"system:playback_1".to_string()));
        assert!(sinks.contains(&"mixer:input_1".to_string()));
        assert!(!sinks.contains(&"system:capture_1".to_string()));
    }

    #[test]
    fn channel_parameters_record_the_latest_value() {
        let (mut engine, _rx) = engine();
        engine.initialize("mixer");
        engine.set_channel_volume(0, 0.5);
        engine.set_channel_volume(0, 0.25);
        engine.set_channel_pan(0, 0.75);
        assert_eq!(engine.last_channel_volume(0), Some(0.25));
        assert_eq!(engine.last_channel_pan(0), Some(0.75));
        assert_eq!(engine.last_channel_volume(3), None);
    }

    #[test]
    fn duplicate_engine_connections_are_allowed() {
        let (mut engine, _rx) = engine();
        engine.initialize("mixer");
        assert!(engine.connect_ports("a", "b"));
        assert!(engine.connect_ports("a", "b"));
        assert_eq!(engine.connection_count("a", "b"), 2);
        assert!(engine.disconnect_ports("a", "b"));
        assert_eq!(engine.connection_count("a", "b"), 0);
        assert!(!engine.disconnect_ports("a", "b"));
    }
}
