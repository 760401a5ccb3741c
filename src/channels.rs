use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MixerError;

pub const VOLUME_MIN: f32 = 0.0;
pub const VOLUME_MAX: f32 = 1.0;
/// Canonical pan range: -1.0 hard left, 0.0 center, 1.0 hard right. The
/// engine boundary converts to the bridge's 0..1 convention in one place
/// (see `session::engine_pan`).
pub const PAN_MIN: f32 = -1.0;
pub const PAN_MAX: f32 = 1.0;

/// One mixer strip, identified by index. Independent of any physical port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub index: u16,
    pub volume: f32,
    pub pan: f32,
    pub gain_db: f32,
    pub mute: bool,
    pub solo: bool,
}

impl Channel {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            volume: 1.0,
            pan: 0.0,
            gain_db: 0.0,
            mute: false,
            solo: false,
        }
    }
}

/// Per-channel mixing parameters. Writes to an unknown index create a
/// default-valued strip; reads of an unknown index fail with `NotFound`.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: BTreeMap<u16, Channel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates default strips for indices `0..count`, dropping whatever was
    /// there before. Called when ports are (re)provisioned.
    pub fn provision(&mut self, count: u16) {
        self.channels = (0..count).map(|i| (i, Channel::new(i))).collect();
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn set_volume(&mut self, channel: u16, volume: f32) -> Result<(), MixerError> {
        if !(VOLUME_MIN..=VOLUME_MAX).contains(&volume) {
            return Err(MixerError::out_of_range(
                "volume",
                volume as f64,
                VOLUME_MIN as f64,
                VOLUME_MAX as f64,
            ));
        }
        self.entry(channel).volume = volume;
        Ok(())
    }

    pub fn set_pan(&mut self, channel: u16, pan: f32) -> Result<(), MixerError> {
        if !(PAN_MIN..=PAN_MAX).contains(&pan) {
            return Err(MixerError::out_of_range(
                "pan",
                pan as f64,
                PAN_MIN as f64,
                PAN_MAX as f64,
            ));
        }
        self.entry(channel).pan = pan;
        Ok(())
    }

    /// Gain is unbounded but must be a real number; the table never stores
    /// NaN or infinities.
    pub fn set_gain(&mut self, channel: u16, gain_db: f32) -> Result<(), MixerError> {
        if !gain_db.is_finite() {
            return Err(MixerError::invalid_argument(format!(
                "gain must be finite, got {gain_db}"
            )));
        }
        self.entry(channel).gain_db = gain_db;
        Ok(())
    }

    pub fn set_mute(&mut self, channel: u16, mute: bool) {
        self.entry(channel).mute = mute;
    }

    pub fn set_solo(&mut self, channel: u16, solo: bool) {
        self.entry(channel).solo = solo;
    }

    pub fn get(&self, channel: u16) -> Result<&Channel, MixerError> {
        self.channels
            .get(&channel)
            .ok_or_else(|| MixerError::not_found("channel", channel.to_string()))
    }

    pub fn any_solo(&self) -> bool {
        self.channels.values().any(|c| c.solo)
    }

    /// A channel is audibly muted if its own mute is set, or if any other
    /// channel is soloed while this one is not. Recomputed over the full
    /// table on every call; channel counts are small.
    pub fn effective_mute(&self, channel: u16) -> Result<bool, MixerError> {
        let strip = self.get(channel)?;
        Ok(strip.mute || (self.any_solo() && !strip.solo))
    }

    /// Strips in index order.
    pub fn snapshot(&self) -> Vec<Channel> {
        self.channels.values().copied().collect()
    }

    fn entry(&mut self, channel: u16) -> &mut Channel {
        self.channels
            .entry(channel)
            .or_insert_with(|| Channel::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_read_does_not() {
        let mut table = ChannelTable::new();
        assert!(matches!(
            table.get(3).unwrap_err(),
            MixerError::NotFound { .. }
        ));
        table.set_volume(3, 0.5).unwrap();
        assert_eq!(table.get(3).unwrap().volume, 0.5);
        // Other fields got defaults.
        assert_eq!(table.get(3).unwrap().pan, 0.0);
    }

    #[test]
    fn out_of_range_rejected_prior_value_intact() {
        let mut table = ChannelTable::new();
        table.set_volume(0, 0.8).unwrap();
        table.set_pan(0, -0.5).unwrap();

        assert!(matches!(
            table.set_volume(0, 1.2).unwrap_err(),
            MixerError::OutOfRange { .. }
        ));
        assert!(matches!(
            table.set_pan(0, 1.5).unwrap_err(),
            MixerError::OutOfRange { .. }
        ));
        assert_eq!(table.get(0).unwrap().volume, 0.8);
        assert_eq!(table.get(0).unwrap().pan, -0.5);
    }

    #[test]
    fn gain_is_unbounded_but_finite() {
        let mut table = ChannelTable::new();
        table.set_gain(0, -96.0).unwrap();
        table.set_gain(0, 24.0).unwrap();
        assert!(matches!(
            table.set_gain(0, f32::NAN).unwrap_err(),
            MixerError::InvalidArgument(_)
        ));
        assert!(matches!(
            table.set_gain(0, f32::INFINITY).unwrap_err(),
            MixerError::InvalidArgument(_)
        ));
        assert_eq!(table.get(0).unwrap().gain_db, 24.0);
    }

    #[test]
    fn effective_mute_follows_solo_overrides() {
        let mut table = ChannelTable::new();
        table.provision(4);

        // No solo anywhere: effective mute equals the channel's own flag.
        table.set_mute(1, true);
        for channel in 0..4 {
            assert_eq!(
                table.effective_mute(channel).unwrap(),
                channel == 1,
                "channel {channel} without solo"
            );
        }

        // Solo on channel 2: every non-soloed channel is muted.
        table.set_solo(2, true);
        for channel in 0..4 {
            assert_eq!(
                table.effective_mute(channel).unwrap(),
                channel != 2,
                "channel {channel} with channel 2 soloed"
            );
        }

        // A soloed-but-muted channel stays muted.
        table.set_mute(2, true);
        assert!(table.effective_mute(2).unwrap());

        // Two solos: both audible, the rest muted.
        table.set_mute(2, false);
        table.set_solo(0, true);
        assert!(!table.effective_mute(0).unwrap());
        assert!(!table.effective_mute(2).unwrap());
        assert!(table.effective_mute(3).unwrap());
    }

    #[test]
    fn provision_replaces_existing_strips() {
        let mut table = ChannelTable::new();
        table.set_volume(7, 0.1).unwrap();
        table.provision(2);
        assert_eq!(table.snapshot().len(), 2);
        assert!(table.get(7).is_err());
        assert_eq!(table.get(0).unwrap().volume, 1.0);
    }
}
