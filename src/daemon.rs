//! The supervisory loop.
//!
//! [`Daemon`] ties the components together in one sequential loop. Each
//! [`tick`](Daemon::tick) runs, in order:
//!
//! 1. connection upkeep of the remote shell,
//! 2. keep-alive setup and supervision of the music app,
//! 3. volume synchronization,
//! 4. a media session read, which lifts the stop cooldown once music plays,
//! 5. ducking against the voice assistant,
//! 6. playback transitions and their control-plane side effects.
//!
//! The loop polls fast while something plays or is ducked and slowly
//! otherwise. Nothing in a tick is fatal; errors escaping it back off the
//! whole loop.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    config::Config,
    ducking::{Coordinator, Outcome},
    error::{ErrorKind, Result},
    hass::{self, ControlPlane},
    keepalive::Supervisor,
    playback::{Action, Tracker},
    remote::{self, Shell},
    session::{self, PlaybackSnapshot},
    store::{StopMarker, VolumeCache},
    volume::Synchronizer,
};

/// Backoff step and cap after a failed tick.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);
const ERROR_BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Marks `next` and returns `true` if at least `interval` passed since the
/// last time it did.
fn due(next: &mut Option<Instant>, interval: Duration) -> bool {
    let now = Instant::now();
    if next.is_some_and(|next| now < next) {
        return false;
    }
    *next = Some(now + interval);
    true
}

pub struct Daemon {
    config: Config,
    shell: Arc<dyn Shell>,
    hass: Arc<dyn ControlPlane>,

    tracker: Tracker,
    coordinator: Coordinator,
    supervisor: Supervisor,
    synchronizer: Synchronizer,

    marker: StopMarker,
    cache: VolumeCache,

    next_keepalive: Option<Instant>,
    next_volume: Option<Instant>,
}

impl Daemon {
    #[must_use]
    pub fn new(config: Config, shell: Arc<dyn Shell>, hass: Arc<dyn ControlPlane>) -> Self {
        Self {
            tracker: Tracker::new(config.absence_threshold),
            coordinator: Coordinator::new(&config),
            supervisor: Supervisor::new(&config),
            synchronizer: Synchronizer::new(&config),
            marker: StopMarker::new(config.stop_marker()),
            cache: VolumeCache::new(config.volume_cache()),
            next_keepalive: None,
            next_volume: None,
            config,
            shell,
            hass,
        }
    }

    /// Replaces configured entity ids that the control plane does not know
    /// with discovered ones.
    pub async fn discover(&mut self) {
        let states = match self.hass.states().await {
            Ok(states) => states,
            Err(e) => {
                warn!("entity discovery failed: {e}");
                return;
            }
        };

        let mut entities = self.config.entities.clone();
        hass::discover(&mut entities, &states);
        if entities != self.config.entities {
            self.config.entities = entities;
            self.tracker = Tracker::new(self.config.absence_threshold);
            self.coordinator = Coordinator::new(&self.config);
            self.supervisor = Supervisor::new(&self.config);
            self.synchronizer = Synchronizer::new(&self.config);
        }

        debug!("entities: {:?}", self.config.entities);
    }

    /// Runs one iteration and returns how long to sleep until the next.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the credentials.
    pub async fn tick(&mut self) -> Result<Duration> {
        let shell = Arc::clone(&self.shell);
        let hass = Arc::clone(&self.hass);

        if !shell.is_connected().await {
            self.supervisor.reset();
            if let Err(e) = shell.connect().await {
                let delay = shell.reconnect_delay();
                warn!("{e}; retrying in {}s", delay.as_secs());
                return Ok(delay);
            }
        }

        if self.config.keepalive.enabled {
            self.supervisor.init(shell.as_ref()).await;
            if due(&mut self.next_keepalive, self.config.keepalive.interval) {
                let status = self
                    .supervisor
                    .check(shell.as_ref(), hass.as_ref(), &self.marker, &self.cache)
                    .await;
                trace!("keep-alive: {status:?}");
            }
        }

        if self.config.volume.enabled && due(&mut self.next_volume, self.config.volume.interval) {
            self.synchronizer
                .sync(shell.as_ref(), hass.as_ref(), &self.cache)
                .await;
        }

        let snapshot = session::read(shell.as_ref(), self.config.shell_timeout).await;
        let primary_playing = snapshot
            .as_ref()
            .is_some_and(PlaybackSnapshot::is_playing);

        // Before the coordinator runs: a stop it resolves now writes a fresh
        // marker that this snapshot must not lift.
        if primary_playing && self.marker.clear() {
            info!("playing again, keep-alive cooldown lifted");
        }

        let outcome = self
            .coordinator
            .check(shell.as_ref(), hass.as_ref(), &self.marker, primary_playing)
            .await;

        // A resume happened after the snapshot was taken, which still shows
        // the paused state of the ducked session.
        let ducking = self.coordinator.is_active() || outcome == Outcome::Resumed;
        let actions = self.tracker.observe(snapshot.as_ref(), ducking);
        self.apply(&actions).await?;

        if self.coordinator.is_active() || self.tracker.is_playing() {
            Ok(self.config.poll_interval)
        } else {
            Ok(self.config.idle_interval)
        }
    }

    async fn apply(&self, actions: &[Action]) -> Result<()> {
        let entities = &self.config.entities;
        let display = &self.config.display;

        for action in actions {
            let result = match action {
                Action::Refresh => self.hass.update_entity(&entities.monitored).await,
                Action::NowPlaying(text) => self.hass.set_text(&entities.now_playing, text).await,
                Action::ShowMusic => {
                    self.hass
                        .navigate(
                            &entities.display,
                            &display.music_path,
                            Some(display.revert_timeout),
                        )
                        .await
                }
                Action::ShowHome => {
                    self.hass
                        .navigate(&entities.display, &display.home_path, None)
                        .await
                }
            };

            if let Err(e) = result {
                // Credential errors end the tick.
                if matches!(e.kind, ErrorKind::Unauthenticated | ErrorKind::PermissionDenied) {
                    return Err(e);
                }
                warn!("{action:?}: {e}");
            }
        }

        Ok(())
    }

    /// Runs ticks until the future is dropped.
    pub async fn run(&mut self) {
        self.discover().await;

        let mut errors: u32 = 0;
        loop {
            let delay = match self.tick().await {
                Ok(delay) => {
                    errors = 0;
                    delay
                }
                Err(e) => {
                    errors = errors.saturating_add(1);
                    error!("error (#{errors}): {e}");
                    self.shell.disconnect().await;

                    // Subsecond jitter keeps restarts of several instances
                    // from hitting the control plane at the same moment.
                    let delay = remote::backoff(ERROR_BACKOFF, errors, ERROR_BACKOFF_CAP)
                        + Duration::from_millis(fastrand::u64(0..1_000));
                    info!("retrying in {:.1}s", delay.as_secs_f32());
                    delay
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    /// Releases the device.
    pub async fn shutdown(&mut self) {
        self.shell.disconnect().await;
    }
}
