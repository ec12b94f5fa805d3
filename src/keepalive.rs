//! Keep-alive supervision of the music app on the device.
//!
//! Fire OS kills background apps aggressively, and a killed music app drops
//! out of the Spotify Connect device list. The supervisor exempts the app
//! from battery optimizations once per connection and relaunches it when its
//! process is gone, subject to three brakes:
//!
//! * an optional "only while in use" policy,
//! * the cooldown after the user asked the assistant to stop the music,
//! * a minimum gap between two launch attempts.

use std::time::Duration;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::time::Instant;

use crate::{
    config::Config,
    hass::{ControlPlane, EntityState},
    remote::Shell,
    store::{StopMarker, VolumeCache},
    volume,
};

/// Keeps the screen on for a day.
const SCREEN_TIMEOUT_MS: u64 = 86_400_000;

/// Time the app gets to come up before the companion is brought back.
const LAUNCH_SETTLE: Duration = Duration::from_secs(2);

/// What a call to [`Supervisor::check`] found.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The monitored entity does not play on this device.
    NotInUse,
    /// The process liveness could not be determined.
    Unknown,
    Alive,
    /// Dead, but the user stopped the music recently.
    Cooldown,
    /// Dead, but the last launch was too recent.
    Throttled,
    Launched,
}

pub struct Supervisor {
    package: String,
    companion: String,
    device_name: String,
    monitored: String,

    only_when_in_use: bool,
    in_use_staleness: Duration,
    always_reachable: bool,
    restart_gap: Duration,
    shell_timeout: Duration,

    initialized: bool,
    last_launch: Option<Instant>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            package: config.keepalive.package.clone(),
            companion: config.keepalive.companion.clone(),
            device_name: config.device_name.clone(),
            monitored: config.entities.monitored.clone(),

            only_when_in_use: config.keepalive.only_when_in_use,
            in_use_staleness: config.keepalive.in_use_staleness,
            always_reachable: config.keepalive.always_reachable,
            restart_gap: config.keepalive.restart_gap,
            shell_timeout: config.shell_timeout,

            initialized: false,
            last_launch: None,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Forgets the per-connection setup, so that [`init`](Self::init) runs
    /// again after the next connect.
    pub fn reset(&mut self) {
        self.initialized = false;
    }

    /// Exempts the app from Doze and background restrictions.
    ///
    /// Runs once per connection; a failed attempt is repeated on the next
    /// call.
    pub async fn init(&mut self, shell: &dyn Shell) {
        if self.initialized {
            return;
        }

        let commands = [
            format!("dumpsys deviceidle whitelist +{}", self.package),
            format!("cmd appops set {} RUN_IN_BACKGROUND allow", self.package),
            format!("cmd appops set {} RUN_ANY_IN_BACKGROUND allow", self.package),
        ];

        for command in &commands {
            if shell.execute(command, self.shell_timeout).await.is_none() {
                warn!("keep-alive setup failed: {command}");
                return;
            }
        }

        info!("{} exempted from battery optimizations", self.package);
        self.initialized = true;
    }

    async fn is_alive(&self, shell: &dyn Shell) -> Option<bool> {
        shell
            .execute(&format!("pidof {}", self.package), self.shell_timeout)
            .await
            .map(|output| !output.trim().is_empty())
    }

    /// Makes sure the app runs, relaunching it when allowed.
    pub async fn check(
        &mut self,
        shell: &dyn Shell,
        hass: &dyn ControlPlane,
        marker: &StopMarker,
        cache: &VolumeCache,
    ) -> Status {
        if self.only_when_in_use {
            let in_use = match hass.state(&self.monitored).await {
                Ok(entity) => in_use(
                    &entity,
                    &self.device_name,
                    self.in_use_staleness,
                    OffsetDateTime::now_utc(),
                ),
                Err(e) => {
                    debug!("reading {}: {e}", self.monitored);
                    false
                }
            };

            if !in_use {
                trace!("{} not in use on {}", self.monitored, self.device_name);
                return Status::NotInUse;
            }
        }

        match self.is_alive(shell).await {
            Some(true) => return Status::Alive,
            Some(false) => {}
            None => return Status::Unknown,
        }

        if !self.always_reachable && marker.is_active() {
            debug!("{} not running, user stop cooldown active", self.package);
            return Status::Cooldown;
        }

        if let Some(last_launch) = self.last_launch {
            let elapsed = last_launch.elapsed();
            if elapsed < self.restart_gap {
                debug!(
                    "{} not running, last launch {}s ago",
                    self.package,
                    elapsed.as_secs()
                );
                return Status::Throttled;
            }
        }

        warn!("{} not running, launching", self.package);
        self.launch(shell, cache).await;
        Status::Launched
    }

    async fn launch(&mut self, shell: &dyn Shell, cache: &VolumeCache) {
        self.last_launch = Some(Instant::now());

        let launch = format!(
            "monkey -p {} -c android.intent.category.LAUNCHER 1",
            self.package
        );
        if shell.execute(&launch, self.shell_timeout).await.is_none() {
            warn!("launching {} failed", self.package);
            return;
        }

        tokio::time::sleep(LAUNCH_SETTLE).await;

        let companion = format!(
            "am start -n {} -a android.intent.action.MAIN -c android.intent.category.HOME",
            self.companion
        );
        if shell.execute(&companion, self.shell_timeout).await.is_none() {
            warn!("bringing {} to front failed", self.companion);
        }

        let screen = format!("settings put system screen_off_timeout {SCREEN_TIMEOUT_MS}");
        if shell.execute(&screen, self.shell_timeout).await.is_none() {
            warn!("setting screen timeout failed");
        }

        if let Some(index) = cache.load() {
            if shell
                .execute(&volume::command(index), self.shell_timeout)
                .await
                .is_some()
            {
                debug!("restored volume index {index}");
            }
        }

        match self.is_alive(shell).await {
            Some(true) => info!("{} running again", self.package),
            _ => warn!("{} still not running after launch", self.package),
        }
    }
}

/// Whether `entity` plays on the device named `device_name`, with a playback
/// position reported within `staleness` of `now`.
#[must_use]
pub fn in_use(
    entity: &EntityState,
    device_name: &str,
    staleness: Duration,
    now: OffsetDateTime,
) -> bool {
    if !entity.is_playing() || entity.attribute_str("source") != Some(device_name) {
        return false;
    }

    let Some(updated) = entity
        .attribute_str("media_position_updated_at")
        .and_then(|updated| OffsetDateTime::parse(updated, &Rfc3339).ok())
    else {
        return false;
    };

    let age = now - updated;
    age.whole_seconds() <= i64::try_from(staleness.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::testing::Recorder;

    const PIDOF: &str = "pidof com.spotify.music";
    const LAUNCH: &str = "shell monkey -p com.spotify.music -c android.intent.category.LAUNCHER 1";

    struct Fixture {
        supervisor: Supervisor,
        recorder: Recorder,
        marker: StopMarker,
        cache: VolumeCache,
        _dir: TempDir,
    }

    impl Fixture {
        fn new(config: &Config) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                supervisor: Supervisor::new(config),
                recorder: Recorder::connected(),
                marker: StopMarker::new(dir.path().join("user_stop_until")),
                cache: VolumeCache::new(dir.path().join("volume_index")),
                _dir: dir,
            }
        }

        async fn check(&mut self) -> Status {
            self.supervisor
                .check(&self.recorder, &self.recorder, &self.marker, &self.cache)
                .await
        }
    }

    fn playing_on(source: &str, updated_at: &str) -> EntityState {
        let json = json!({
            "entity_id": "media_player.spotify",
            "state": "playing",
            "attributes": {
                "source": source,
                "media_position_updated_at": updated_at,
            },
        });
        serde_json::from_value(json).unwrap()
    }

    fn at(timestamp: &str) -> OffsetDateTime {
        OffsetDateTime::parse(timestamp, &Rfc3339).unwrap()
    }

    #[test]
    fn in_use_requires_fresh_playback_on_this_device() {
        let staleness = Duration::from_secs(600);
        let now = at("2026-10-16T12:00:00+00:00");

        let fresh = playing_on("Echo Show 5", "2026-10-16T11:55:00+00:00");
        assert!(in_use(&fresh, "Echo Show 5", staleness, now));

        let stale = playing_on("Echo Show 5", "2026-10-16T11:40:00+00:00");
        assert!(!in_use(&stale, "Echo Show 5", staleness, now));

        let elsewhere = playing_on("Living Room", "2026-10-16T11:55:00+00:00");
        assert!(!in_use(&elsewhere, "Echo Show 5", staleness, now));

        let garbage = playing_on("Echo Show 5", "yesterday");
        assert!(!in_use(&garbage, "Echo Show 5", staleness, now));

        let mut paused = fresh.clone();
        paused.state = "paused".to_owned();
        assert!(!in_use(&paused, "Echo Show 5", staleness, now));
    }

    #[tokio::test(start_paused = true)]
    async fn alive_is_left_alone() {
        let mut fixture = Fixture::new(&Config::default());
        fixture.recorder.reply(PIDOF, &[Some("4242\n")]);

        assert_eq!(fixture.check().await, Status::Alive);
        assert_eq!(fixture.recorder.calls(), vec![format!("shell {PIDOF}")]);
    }

    #[tokio::test(start_paused = true)]
    async fn relaunch_sequence() {
        let mut fixture = Fixture::new(&Config::default());
        fixture.cache.store(9).unwrap();
        fixture.recorder.reply(PIDOF, &[Some(""), Some("4242")]);

        assert_eq!(fixture.check().await, Status::Launched);
        assert_eq!(
            fixture.recorder.calls(),
            vec![
                format!("shell {PIDOF}"),
                LAUNCH.to_owned(),
                "shell am start -n com.msp1974.vacompanion/.MainActivity -a android.intent.action.MAIN -c android.intent.category.HOME".to_owned(),
                "shell settings put system screen_off_timeout 86400000".to_owned(),
                "shell media volume --stream 3 --set 9".to_owned(),
                format!("shell {PIDOF}"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_launch_per_restart_gap() {
        let mut fixture = Fixture::new(&Config::default());

        // Never comes up: every check wants to relaunch.
        let mut statuses = Vec::new();
        for _ in 0..12 {
            statuses.push(fixture.check().await);
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        let launches = fixture.recorder.count(LAUNCH);
        assert_eq!(launches, 2, "{statuses:?}");
        assert_eq!(statuses[0], Status::Launched);
        assert_eq!(statuses[1], Status::Throttled);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_launch() {
        let mut fixture = Fixture::new(&Config::default());
        fixture.marker.set(Duration::from_secs(600)).unwrap();

        assert_eq!(fixture.check().await, Status::Cooldown);
        assert_eq!(fixture.recorder.count(LAUNCH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn always_reachable_ignores_cooldown() {
        let mut config = Config::default();
        config.keepalive.always_reachable = true;
        let mut fixture = Fixture::new(&config);
        fixture.marker.set(Duration::from_secs(600)).unwrap();

        assert_eq!(fixture.check().await, Status::Launched);
        assert_eq!(fixture.recorder.count(LAUNCH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_in_use_skips_liveness_check() {
        let mut config = Config::default();
        config.keepalive.only_when_in_use = true;
        let mut fixture = Fixture::new(&config);
        fixture.recorder.script("media_player.spotify", &["paused"]);

        assert_eq!(fixture.check().await, Status::NotInUse);
        assert!(fixture.recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_is_unknown() {
        let mut fixture = Fixture::new(&Config::default());
        fixture.recorder.reply(PIDOF, &[None]);

        assert_eq!(fixture.check().await, Status::Unknown);
        assert_eq!(fixture.recorder.count(LAUNCH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn init_retries_until_it_succeeds() {
        let mut fixture = Fixture::new(&Config::default());
        fixture
            .recorder
            .reply("cmd appops set com.spotify.music RUN_IN_BACKGROUND", &[None, Some("")]);

        fixture.supervisor.init(&fixture.recorder).await;
        assert!(!fixture.supervisor.is_initialized());

        fixture.recorder.connect().await.unwrap();
        fixture.supervisor.init(&fixture.recorder).await;
        assert!(fixture.supervisor.is_initialized());

        fixture.recorder.clear();
        fixture.supervisor.init(&fixture.recorder).await;
        assert!(fixture.recorder.calls().is_empty());

        fixture.supervisor.reset();
        fixture.supervisor.init(&fixture.recorder).await;
        assert_eq!(fixture.recorder.calls().len(), 3);
    }
}
