//! Volume mirroring from the control plane onto the device.
//!
//! The volume slider of the monitored media player only changes what the
//! music service believes; the device keeps playing at its own stream volume.
//! The synchronizer quantizes the player's level onto the device's music
//! stream steps and applies it whenever it moves by more than a small
//! threshold.

use crate::{config::Config, hass::ControlPlane, remote::Shell, store::VolumeCache};

/// Android's `STREAM_MUSIC`.
const MUSIC_STREAM: u32 = 3;

/// Shell command setting the music stream to `index`.
#[must_use]
pub fn command(index: u32) -> String {
    format!("media volume --stream {MUSIC_STREAM} --set {index}")
}

/// Maps a level in `[0.0, 1.0]` onto `[0, max_steps]`, rounding half to even.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn quantize(level: f64, max_steps: u32) -> u32 {
    if level.is_nan() {
        return 0;
    }
    let index = (level.clamp(0.0, 1.0) * f64::from(max_steps)).round_ties_even();
    (index as u32).min(max_steps)
}

pub struct Synchronizer {
    monitored: String,
    device_name: String,
    only_when_playing: bool,
    strict_source: bool,
    max_steps: u32,
    epsilon: f64,
    shell_timeout: std::time::Duration,

    last_level: Option<f64>,
}

impl Synchronizer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            monitored: config.entities.monitored.clone(),
            device_name: config.device_name.clone(),
            only_when_playing: config.volume.only_when_playing,
            strict_source: config.volume.strict_source,
            max_steps: config.volume.max_steps,
            epsilon: config.volume.epsilon,
            shell_timeout: config.shell_timeout,
            last_level: None,
        }
    }

    /// Applies the monitored player's volume to the device if it changed.
    ///
    /// Returns the index that was applied, if any.
    pub async fn sync(
        &mut self,
        shell: &dyn Shell,
        hass: &dyn ControlPlane,
        cache: &VolumeCache,
    ) -> Option<u32> {
        let entity = match hass.state(&self.monitored).await {
            Ok(entity) => entity,
            Err(e) => {
                debug!("reading {}: {e}", self.monitored);
                return None;
            }
        };

        if self.only_when_playing && !entity.is_playing() {
            return None;
        }

        let source_matches = match entity.attribute_str("source") {
            Some(source) => source == self.device_name,
            None => !self.strict_source,
        };
        if !source_matches {
            trace!("{} plays elsewhere, not syncing volume", self.monitored);
            return None;
        }

        let level = entity.attribute_f64("volume_level")?.clamp(0.0, 1.0);
        if self
            .last_level
            .is_some_and(|last| (level - last).abs() < self.epsilon)
        {
            return None;
        }

        let index = quantize(level, self.max_steps);
        shell.execute(&command(index), self.shell_timeout).await?;
        info!("volume {:.0}% -> index {index}/{}", level * 100.0, self.max_steps);

        self.last_level = Some(level);
        if let Err(e) = cache.store(index) {
            warn!("writing volume cache: {e}");
        }

        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::Recorder;

    const MONITORED: &str = "media_player.spotify";

    #[test]
    fn quantizes_with_ties_to_even() {
        assert_eq!(quantize(0.0, 15), 0);
        assert_eq!(quantize(1.0, 15), 15);
        assert_eq!(quantize(0.5, 15), 8);
        assert_eq!(quantize(0.1, 15), 2);
        // 0.5 * 10 = 5 exactly, 0.25 * 10 = 2.5 rounds to 2.
        assert_eq!(quantize(0.5, 10), 5);
        assert_eq!(quantize(0.25, 10), 2);
    }

    #[test]
    fn quantize_clamps() {
        assert_eq!(quantize(-0.3, 15), 0);
        assert_eq!(quantize(1.7, 15), 15);
        assert_eq!(quantize(f64::NAN, 15), 0);
    }

    fn setup(config: &Config) -> (Synchronizer, Recorder, VolumeCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = VolumeCache::new(dir.path().join("volume_index"));
        (Synchronizer::new(config), Recorder::connected(), cache, dir)
    }

    fn set_level(recorder: &Recorder, state: &str, level: f64, source: Option<&str>) {
        recorder.script(MONITORED, &[state]);
        let mut attributes = json!({ "volume_level": level });
        if let Some(source) = source {
            attributes["source"] = json!(source);
        }
        recorder.set_attributes(MONITORED, attributes);
    }

    #[tokio::test]
    async fn applies_once_and_persists() {
        let (mut sync, recorder, cache, _dir) = setup(&Config::default());
        set_level(&recorder, "playing", 0.6, Some("Echo Show 5"));

        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, Some(9));
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);
        assert_eq!(
            recorder.calls(),
            vec!["shell media volume --stream 3 --set 9".to_owned()]
        );
        assert_eq!(cache.load(), Some(9));
    }

    #[tokio::test]
    async fn small_changes_are_ignored() {
        let (mut sync, recorder, cache, _dir) = setup(&Config::default());
        set_level(&recorder, "playing", 0.60, None);
        sync.sync(&recorder, &recorder, &cache).await;

        set_level(&recorder, "playing", 0.61, None);
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);

        set_level(&recorder, "playing", 0.65, None);
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, Some(10));
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn paused_player_is_not_synced() {
        let (mut sync, recorder, cache, _dir) = setup(&Config::default());
        set_level(&recorder, "paused", 0.6, None);
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);

        let mut config = Config::default();
        config.volume.only_when_playing = false;
        let (mut sync, recorder, cache, _dir) = setup(&config);
        set_level(&recorder, "paused", 0.6, None);
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, Some(9));
    }

    #[tokio::test]
    async fn source_policies() {
        let (mut sync, recorder, cache, _dir) = setup(&Config::default());
        set_level(&recorder, "playing", 0.6, Some("Kitchen"));
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);

        let mut config = Config::default();
        config.volume.strict_source = true;
        let (mut sync, recorder, cache, _dir) = setup(&config);
        set_level(&recorder, "playing", 0.6, None);
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);
        set_level(&recorder, "playing", 0.6, Some("Echo Show 5"));
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, Some(9));
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_next_time() {
        let (mut sync, recorder, cache, _dir) = setup(&Config::default());
        recorder.reply("media volume", &[None, Some("")]);
        set_level(&recorder, "playing", 0.6, None);

        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, None);
        assert_eq!(cache.load(), None);

        recorder.connect().await.unwrap();
        assert_eq!(sync.sync(&recorder, &recorder, &cache).await, Some(9));
    }
}
