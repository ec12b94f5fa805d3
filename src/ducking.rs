//! Audio ducking around the voice assistant's listening cycle.
//!
//! When the satellite starts listening, whatever plays is paused so it does
//! not drown out the user. When it returns to idle, the music comes back,
//! unless the user asked to stop it.
//!
//! # Stop detection
//!
//! The "stop" automation and the satellite's return to idle come from two
//! independently scheduled pipelines with no ordering guarantee. They meet
//! in a shared boolean on the control plane:
//!
//! 1. Before pausing anything the coordinator turns the boolean `on`. It must
//!    be written before the pause commands go out: a stop automation turning
//!    it `off` in the meantime must not be overwritten.
//! 2. The stop automation turns it `off` as its first action.
//! 3. Once the satellite is idle again, the coordinator polls the boolean at
//!    a short interval up to a ceiling. `off` means stop: nothing resumes and
//!    a cooldown marker is written for the keep-alive supervisor. Still `on`
//!    at the ceiling means ordinary ducking: everything paused resumes.
//!
//! A satellite leaving idle during the wait abandons the attempt; the next
//! return to idle starts a new one.

use std::time::Duration;

use crate::{
    config::Config,
    hass::ControlPlane,
    remote::Shell,
    store::StopMarker,
};

/// Satellite state in which nobody is talking.
const IDLE: &str = "idle";

/// States the control plane reports for an entity it cannot reach.
const NO_INFORMATION: [&str; 2] = ["unavailable", "unknown"];

const KEY_PAUSE: &str = "input keyevent KEYCODE_MEDIA_PAUSE";
const KEY_PLAY: &str = "input keyevent KEYCODE_MEDIA_PLAY";
const KEY_STOP: &str = "input keyevent KEYCODE_MEDIA_STOP";

/// What a call to [`Coordinator::check`] did.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// No edge, or an edge that required nothing.
    Unchanged,
    /// Sources were paused for a listening turn.
    Ducked,
    /// The wait ended with the boolean still on and sources resumed.
    Resumed,
    /// The boolean went off: the user asked to stop.
    Stopped,
    /// The satellite left idle during the wait.
    Interrupted,
}

#[derive(Clone, Debug)]
pub struct Coordinator {
    satellite: String,
    secondary: String,
    flag: String,

    poll_interval: Duration,
    poll_ceiling: Duration,
    cooldown: Duration,
    shell_timeout: Duration,

    active: bool,
    paused_primary: bool,
    paused_secondary: bool,
    last_state: String,
    last_known: String,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            satellite: config.entities.satellite.clone(),
            secondary: config.entities.secondary.clone(),
            flag: config.entities.ducking_flag.clone(),

            poll_interval: config.resume_poll_interval,
            poll_ceiling: config.resume_poll_ceiling,
            cooldown: config.keepalive.cooldown,
            shell_timeout: config.shell_timeout,

            active: false,
            paused_primary: false,
            paused_secondary: false,
            last_state: IDLE.to_owned(),
            last_known: IDLE.to_owned(),
        }
    }

    /// Whether sources are paused on the assistant's behalf.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reads the satellite state.
    ///
    /// A failed read repeats the last known state: a timeout must not pass
    /// for "idle" and resume the music in the middle of a sentence. An
    /// offline satellite is treated the same way and never starts a turn.
    async fn satellite_state(&mut self, hass: &dyn ControlPlane) -> String {
        match hass.state(&self.satellite).await {
            Ok(entity) if NO_INFORMATION.contains(&entity.state.as_str()) => {
                debug!("satellite {}, assuming {}", entity.state, self.last_known);
                self.last_known.clone()
            }
            Ok(entity) => {
                self.last_known.clone_from(&entity.state);
                entity.state
            }
            Err(e) => {
                debug!("satellite state unavailable, assuming {}: {e}", self.last_known);
                self.last_known.clone()
            }
        }
    }

    /// Evaluates the satellite once and acts on its edges.
    ///
    /// `primary_playing` is whether the device session plays as of this
    /// poll. On a return to idle this blocks for up to the poll ceiling.
    pub async fn check(
        &mut self,
        shell: &dyn Shell,
        hass: &dyn ControlPlane,
        marker: &StopMarker,
        primary_playing: bool,
    ) -> Outcome {
        let state = self.satellite_state(hass).await;
        if state == self.last_state {
            return Outcome::Unchanged;
        }

        let previous = std::mem::replace(&mut self.last_state, state);
        if previous == IDLE && self.last_state != IDLE {
            return self.duck(shell, hass, primary_playing).await;
        }

        if self.last_state == IDLE && self.active {
            return self.resolve(shell, hass, marker).await;
        }

        Outcome::Unchanged
    }

    async fn duck(
        &mut self,
        shell: &dyn Shell,
        hass: &dyn ControlPlane,
        primary_playing: bool,
    ) -> Outcome {
        let secondary_playing = match hass.state(&self.secondary).await {
            Ok(entity) => entity.is_playing(),
            Err(e) => {
                warn!("reading {}: {e}", self.secondary);
                false
            }
        };

        if !primary_playing && !secondary_playing {
            debug!("satellite {}, nothing to duck", self.last_state);
            return Outcome::Unchanged;
        }

        self.active = true;
        self.paused_primary = primary_playing;
        self.paused_secondary = secondary_playing;
        info!(
            "ducking: satellite {}, pausing {}",
            self.last_state,
            self.sources()
        );

        // Order matters, see module documentation.
        if let Err(e) = hass.turn_on(&self.flag).await {
            warn!("turning on {}: {e}", self.flag);
        }

        if self.paused_primary && shell.execute(KEY_PAUSE, self.shell_timeout).await.is_none() {
            warn!("pausing device playback failed");
        }

        if self.paused_secondary {
            if let Err(e) = hass.media_pause(&self.secondary).await {
                warn!("pausing {}: {e}", self.secondary);
            }
        }

        Outcome::Ducked
    }

    async fn resolve(
        &mut self,
        shell: &dyn Shell,
        hass: &dyn ControlPlane,
        marker: &StopMarker,
    ) -> Outcome {
        let mut elapsed = Duration::ZERO;
        while elapsed < self.poll_ceiling {
            tokio::time::sleep(self.poll_interval).await;
            elapsed += self.poll_interval;

            let state = self.satellite_state(hass).await;
            if state != IDLE {
                info!("ducking: satellite {state} during resume wait, waiting for next idle");
                self.last_state = state;
                return Outcome::Interrupted;
            }

            match hass.state(&self.flag).await {
                Ok(flag) if flag.state == "off" => {
                    info!(
                        "ducking: {} off after {:.1}s, stop requested",
                        self.flag,
                        elapsed.as_secs_f32()
                    );
                    self.stop(shell, marker).await;
                    return Outcome::Stopped;
                }
                Ok(flag) if flag.state == "on" => {}
                Ok(flag) => debug!("{} reads {}, waiting", self.flag, flag.state),
                Err(e) => debug!("reading {}: {e}", self.flag),
            }
        }

        info!(
            "ducking ended after {:.1}s, resuming {}",
            elapsed.as_secs_f32(),
            self.sources()
        );
        self.resume(shell, hass).await;
        Outcome::Resumed
    }

    async fn stop(&mut self, shell: &dyn Shell, marker: &StopMarker) {
        // The app may grab audio focus back by itself when only paused.
        if self.paused_primary && shell.execute(KEY_STOP, self.shell_timeout).await.is_none() {
            warn!("stopping device playback failed");
        }

        match marker.set(self.cooldown) {
            Ok(()) => debug!("keep-alive cooldown for {}s", self.cooldown.as_secs()),
            Err(e) => warn!("writing stop marker: {e}"),
        }

        self.reset();
    }

    async fn resume(&mut self, shell: &dyn Shell, hass: &dyn ControlPlane) {
        if self.paused_primary && shell.execute(KEY_PLAY, self.shell_timeout).await.is_none() {
            warn!("resuming device playback failed");
        }

        if self.paused_secondary {
            if let Err(e) = hass.media_play(&self.secondary).await {
                warn!("resuming {}: {e}", self.secondary);
            }
        }

        if let Err(e) = hass.turn_off(&self.flag).await {
            warn!("turning off {}: {e}", self.flag);
        }

        self.reset();
    }

    fn reset(&mut self) {
        self.active = false;
        self.paused_primary = false;
        self.paused_secondary = false;
    }

    fn sources(&self) -> String {
        let mut sources = Vec::with_capacity(2);
        if self.paused_primary {
            sources.push("device");
        }
        if self.paused_secondary {
            sources.push(self.secondary.as_str());
        }
        sources.join(" + ")
    }
}
