use std::fs::{create_dir_all, File};
use std::path::PathBuf;

use anyhow::{Context, Result};
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.ron";
const APP_DIR: &str = "mixerd";

fn config_dir() -> Option<PathBuf> {
    std::env::var("MIXERD_CONFIG_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::config_local_dir)
}

/// Ambient settings only: how the session is wired up, never what state it
/// is in. Session state is deliberately not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerdConfig {
    /// Name this session registers with the engine.
    pub client_name: String,
    pub num_inputs: u16,
    pub num_outputs: u16,
    /// Cadence of the engine's meter telemetry.
    pub meter_interval_ms: u64,
    /// Bounded queue depth per event subscriber.
    pub event_queue_depth: usize,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

impl Default for MixerdConfig {
    fn default() -> Self {
        Self {
            client_name: "mixerd".to_string(),
            num_inputs: 2,
            num_outputs: 2,
            meter_interval_ms: 100,
            event_queue_depth: 256,
            sample_rate: 48000,
            buffer_size: 1024,
        }
    }
}

impl MixerdConfig {
    pub fn load() -> Result<Self> {
        let dir = config_dir().context("Could not resolve config dir")?;
        let file = File::open(dir.join(APP_DIR).join(CONFIG_FILE))
            .context("Failed to open config file")?;
        ron::de::from_reader(file).context("Failed to deserialize config")
    }

    pub fn save(&self) -> Result<()> {
        let dir = config_dir().context("Could not resolve config dir")?;
        create_dir_all(dir.join(APP_DIR)).context("Failed to create config dir")?;
        let file = File::create(dir.join(APP_DIR).join(CONFIG_FILE))
            .context("Failed to create config file")?;
        ron::ser::to_writer_pretty(file, self, PrettyConfig::new())
            .context("Failed to serialize config")
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        // Serializing the env access in one test avoids races; nothing else
        // touches MIXERD_CONFIG_DIR.
        std::env::set_var("MIXERD_CONFIG_DIR", dir.path());

        let config = MixerdConfig {
            client_name: "studio".to_string(),
            num_inputs: 8,
            ..Default::default()
        };
        config.save().unwrap();
        let loaded = MixerdConfig::load().unwrap();
        assert_eq!(loaded, config);

        std::env::remove_var("MIXERD_CONFIG_DIR");
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let partial: MixerdConfig = ron::de::from_str("(client_name: \"solo\")").unwrap();
        assert_eq!(partial.client_name, "solo");
        assert_eq!(partial.num_inputs, 2);
        assert_eq!(partial.meter_interval_ms, 100);
    }
}
