mod mock;

use std::sync::mpsc::Sender;

pub use mock::MockEngine;

use crate::graph::PortDirection;

/// Floor used when converting normalized levels to dB; silence maps here
/// instead of negative infinity.
pub const DB_FLOOR: f32 = -120.0;

/// One meter reading for one channel as delivered by the engine. Both
/// values are normalized to 0.0..=1.0; dB conversion happens only at the
/// event payload boundary, where the field names say so.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    pub channel: u16,
    pub peak: f32,
    pub rms: f32,
}

impl MeterSample {
    pub fn peak_db(&self) -> f32 {
        linear_to_db(self.peak)
    }

    pub fn rms_db(&self) -> f32 {
        linear_to_db(self.rms)
    }
}

pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * linear.log10()).max(DB_FLOOR)
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Callbacks the engine fires from threads the core does not control. They
/// are handed off into the session controller's queue, never used to mutate
/// state directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCallback {
    /// The server came up or went away underneath us.
    ServerStatus(bool),
    Meter(MeterSample),
}

/// Snapshot of the engine server as the engine reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStatus {
    pub running: bool,
    pub sample_rate: u32,
    pub buffer_size: u32,
    /// Percent, 0.0..=100.0.
    pub cpu_load: f32,
    pub xruns: u32,
}

/// Filter for `AudioEngine::port_list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub direction: Option<PortDirection>,
    pub physical_only: bool,
}

/// The capability surface of the external audio engine (a JACK-compatible
/// server reached through a native bridge). Calls are synchronous but fast
/// by contract; the session controller never issues two concurrently.
///
/// Boolean returns follow the bridge convention: `false` means the engine
/// refused or failed the operation.
pub trait AudioEngine: Send {
    fn initialize(&mut self, client_name: &str) -> bool;
    fn create_ports(&mut self, num_inputs: u16, num_outputs: u16) -> bool;
    fn activate(&mut self) -> bool;
    /// Must synchronously stop the meter producer before returning: once
    /// this returns, no further `EngineCallback::Meter` is emitted for the
    /// current activation.
    fn deactivate(&mut self) -> bool;

    fn set_channel_volume(&mut self, channel: u16, volume: f32);
    /// Engine convention: 0.0 left, 0.5 center, 1.0 right (unlike the
    /// model's -1..=1; the session converts).
    fn set_channel_pan(&mut self, channel: u16, pan: f32);
    fn set_channel_gain(&mut self, channel: u16, gain_db: f32);
    fn set_channel_mute(&mut self, channel: u16, mute: bool);
    fn set_channel_solo(&mut self, channel: u16, solo: bool);

    fn connect_ports(&mut self, source: &str, destination: &str) -> bool;
    fn disconnect_ports(&mut self, source: &str, destination: &str) -> bool;
    fn port_list(&self, type_filter: &str, filter: PortFilter) -> Vec<String>;

    /// Retune the server before activation (rate/buffer/periods). Refused
    /// while running.
    fn configure(&mut self, sample_rate: u32, buffer_size: u32, periods: u16) -> bool;

    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> u32;
    /// Percent, 0.0..=100.0.
    fn cpu_load(&self) -> f32;
    fn is_server_running(&self) -> bool;
    fn server_status(&self) -> EngineStatus;

    /// Where callbacks are delivered. Must be set before `activate`.
    fn set_callback_sender(&mut self, sender: Sender<EngineCallback>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_conversion_round_trips() {
        for level in [1.0_f32, 0.5, 0.1, 0.01] {
            let db = linear_to_db(level);
            assert!((db_to_linear(db) - level).abs() < 1e-4);
        }
    }

    #[test]
    fn silence_hits_the_floor() {
        assert_eq!(linear_to_db(0.0), DB_FLOOR);
        assert_eq!(linear_to_db(-1.0), DB_FLOOR);
        // Unity gain is 0 dB.
        assert!(linear_to_db(1.0).abs() < 1e-6);
    }
}
