//! Playback state machine.
//!
//! [`Tracker`] consumes one [`PlaybackSnapshot`] (or its absence) per poll
//! and returns the side effects the transition calls for. It performs no I/O
//! itself; the daemon applies the returned [`Action`]s.
//!
//! Transitions:
//! * A vanished session only counts after a number of consecutive empty
//!   reads, since introspection flickers. A confirmed disappearance of a
//!   playing session is a stop.
//! * A new track is detected by queue item id when both sides have one, and
//!   by the raw description otherwise.
//! * Play/pause/stop toggles drive the display, except while ducking: the
//!   pause was ours, not the user's.
//!
//! A state that repeats across polls triggers nothing.

use crate::session::{PlaybackSnapshot, PlaybackState};

/// Side effect requested by a transition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// Force the control plane to refresh the monitored entity.
    Refresh,
    /// Publish "artist - title" to the now-playing text slot.
    NowPlaying(String),
    /// Navigate the display to the music view, reverting after a timeout.
    ShowMusic,
    /// Navigate the display back to its default view.
    ShowHome,
}

#[derive(Clone, Debug)]
pub struct Tracker {
    absence_threshold: u32,

    last_snapshot: Option<PlaybackSnapshot>,
    last_state: Option<PlaybackState>,
    last_item: Option<u64>,
    last_description: Option<String>,
    absent_polls: u32,
    showing_music: bool,
}

impl Tracker {
    #[must_use]
    pub fn new(absence_threshold: u32) -> Self {
        Self {
            absence_threshold: absence_threshold.max(1),
            last_snapshot: None,
            last_state: None,
            last_item: None,
            last_description: None,
            absent_polls: 0,
            showing_music: false,
        }
    }

    /// Whether the last confirmed state is playing.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.last_state == Some(PlaybackState::Playing)
    }

    #[must_use]
    pub fn showing_music(&self) -> bool {
        self.showing_music
    }

    #[must_use]
    pub fn last_snapshot(&self) -> Option<&PlaybackSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Feeds one poll result and returns the resulting side effects.
    pub fn observe(
        &mut self,
        snapshot: Option<&PlaybackSnapshot>,
        ducking_active: bool,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        match snapshot {
            None => self.absent(&mut actions),
            Some(snapshot) => self.present(snapshot, ducking_active, &mut actions),
        }
        actions
    }

    fn absent(&mut self, actions: &mut Vec<Action>) {
        self.absent_polls = self.absent_polls.saturating_add(1);
        if self.absent_polls != self.absence_threshold {
            return;
        }

        if self.is_playing() {
            info!("playback stopped: no active session");
            push(actions, Action::Refresh);
            if self.showing_music {
                push(actions, Action::ShowHome);
                self.showing_music = false;
            }
        }

        self.last_snapshot = None;
        self.last_state = None;
        self.last_item = None;
        self.last_description = None;
    }

    fn present(
        &mut self,
        snapshot: &PlaybackSnapshot,
        ducking_active: bool,
        actions: &mut Vec<Action>,
    ) {
        self.absent_polls = 0;

        let track_changed = match (snapshot.active_item_id, self.last_item) {
            (Some(current), Some(last)) => current != last,
            _ => self.last_description.as_deref() != Some(snapshot.description.as_str()),
        };

        if track_changed {
            if self.last_description.is_some() {
                info!("track changed: {}", snapshot.display_text());
            } else {
                info!("first track: {}", snapshot.display_text());
            }

            push(actions, Action::Refresh);
            push(actions, Action::NowPlaying(snapshot.display_text()));
            if snapshot.is_playing() && !ducking_active {
                push(actions, Action::ShowMusic);
                self.showing_music = true;
            }

            self.last_description = Some(snapshot.description.clone());
            self.last_item = snapshot.active_item_id;
        }

        if self.last_state != Some(snapshot.state) {
            if let Some(previous) = self.last_state {
                self.toggled(previous, snapshot, ducking_active, actions);
            }
            self.last_state = Some(snapshot.state);
        }

        self.last_snapshot = Some(snapshot.clone());
    }

    fn toggled(
        &mut self,
        previous: PlaybackState,
        snapshot: &PlaybackSnapshot,
        ducking_active: bool,
        actions: &mut Vec<Action>,
    ) {
        if ducking_active {
            debug!("state change while ducking: {previous} -> {}", snapshot.state);
            return;
        }

        match snapshot.state {
            PlaybackState::Playing => {
                info!("playing: {}", snapshot.display_text());
                push(actions, Action::Refresh);
                push(actions, Action::ShowMusic);
                self.showing_music = true;
            }
            PlaybackState::Paused | PlaybackState::Stopped => {
                info!("{}: {}", snapshot.state, snapshot.display_text());
                push(actions, Action::Refresh);
                if self.showing_music {
                    push(actions, Action::ShowHome);
                    self.showing_music = false;
                }
            }
            other => debug!("state change: {previous} -> {other}"),
        }
    }
}

/// Adds `action` unless this transition already requested it.
fn push(actions: &mut Vec<Action>, action: Action) {
    if !actions.contains(&action) {
        actions.push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(description: &str, state: PlaybackState, item: Option<u64>) -> PlaybackSnapshot {
        let mut fields = description.splitn(2, ',').map(str::trim);
        PlaybackSnapshot {
            title: fields.next().unwrap_or_default().to_owned(),
            artist: fields.next().unwrap_or_default().to_owned(),
            album: String::new(),
            state,
            active_item_id: item,
            description: description.to_owned(),
        }
    }

    fn playing(item: u64) -> PlaybackSnapshot {
        snapshot("Song, Artist", PlaybackState::Playing, Some(item))
    }

    fn count(actions: &[Vec<Action>], action: &Action) -> usize {
        actions
            .iter()
            .flatten()
            .filter(|candidate| *candidate == action)
            .count()
    }

    #[test]
    fn absence_before_first_play_is_not_a_stop() {
        let mut tracker = Tracker::new(3);

        for _ in 0..3 {
            assert!(tracker.observe(None, false).is_empty());
        }

        let actions = tracker.observe(Some(&playing(1)), false);
        assert_eq!(
            actions,
            vec![
                Action::Refresh,
                Action::NowPlaying("Artist - Song".to_owned()),
                Action::ShowMusic,
            ]
        );
        assert!(tracker.is_playing());
    }

    #[test]
    fn confirmed_absence_stops_once() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&playing(1)), false);
        assert!(tracker.showing_music());

        let results: Vec<_> = (0..200).map(|_| tracker.observe(None, false)).collect();

        assert!(results[0].is_empty());
        assert!(results[1].is_empty());
        assert_eq!(results[2], vec![Action::Refresh, Action::ShowHome]);
        assert!(results[3..].iter().all(Vec::is_empty));
        assert_eq!(count(&results, &Action::ShowHome), 1);
        assert!(!tracker.is_playing());
        assert!(tracker.last_snapshot().is_none());
    }

    #[test]
    fn flicker_below_threshold_is_ignored() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&playing(1)), false);

        assert!(tracker.observe(None, false).is_empty());
        assert!(tracker.observe(None, false).is_empty());
        assert!(tracker.observe(Some(&playing(1)), false).is_empty());

        // The counter starts over after a successful read.
        assert!(tracker.observe(None, false).is_empty());
        assert!(tracker.observe(None, false).is_empty());
        assert!(tracker.observe(Some(&playing(1)), false).is_empty());
    }

    #[test]
    fn unchanged_description_without_item_id_never_changes_track() {
        let mut tracker = Tracker::new(3);
        let current = snapshot("Song, Artist", PlaybackState::Playing, None);

        let results: Vec<_> = (0..500)
            .map(|_| tracker.observe(Some(&current), false))
            .collect();

        assert_eq!(count(&results, &Action::Refresh), 1);
        assert!(results[1..].iter().all(Vec::is_empty));
    }

    #[test]
    fn item_id_takes_precedence_over_description() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&playing(1)), false);

        // Same metadata, new queue item: a repeat of the same song.
        let actions = tracker.observe(Some(&playing(2)), false);
        assert!(actions.contains(&Action::NowPlaying("Artist - Song".to_owned())));

        // Same queue item, metadata refined: not a new track.
        let refined = snapshot("Song (Remastered), Artist", PlaybackState::Playing, Some(2));
        assert!(tracker.observe(Some(&refined), false).is_empty());
    }

    #[test]
    fn description_change_without_item_id_changes_track() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&snapshot("One, A", PlaybackState::Playing, None)), false);

        let actions = tracker.observe(Some(&snapshot("Two, B", PlaybackState::Playing, None)), false);
        assert_eq!(
            actions,
            vec![
                Action::Refresh,
                Action::NowPlaying("B - Two".to_owned()),
                Action::ShowMusic,
            ]
        );
    }

    #[test]
    fn pause_and_resume_drive_the_display() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&playing(1)), false);

        let paused = snapshot("Song, Artist", PlaybackState::Paused, Some(1));
        assert_eq!(
            tracker.observe(Some(&paused), false),
            vec![Action::Refresh, Action::ShowHome]
        );
        assert!(tracker.observe(Some(&paused), false).is_empty());

        assert_eq!(
            tracker.observe(Some(&playing(1)), false),
            vec![Action::Refresh, Action::ShowMusic]
        );
    }

    #[test]
    fn stop_without_music_view_only_refreshes() {
        let mut tracker = Tracker::new(3);
        let paused = snapshot("Song, Artist", PlaybackState::Paused, Some(1));
        tracker.observe(Some(&paused), false);
        assert!(!tracker.showing_music());

        let stopped = snapshot("Song, Artist", PlaybackState::Stopped, Some(1));
        assert_eq!(tracker.observe(Some(&stopped), false), vec![Action::Refresh]);
    }

    #[test]
    fn ducking_suppresses_toggles() {
        let mut tracker = Tracker::new(3);
        tracker.observe(Some(&playing(1)), false);

        let paused = snapshot("Song, Artist", PlaybackState::Paused, Some(1));
        assert!(tracker.observe(Some(&paused), true).is_empty());
        assert!(tracker.showing_music());

        // A track change during ducking is published, but the display stays.
        let next = snapshot("Next, Artist", PlaybackState::Playing, Some(2));
        assert_eq!(
            tracker.observe(Some(&next), true),
            vec![
                Action::Refresh,
                Action::NowPlaying("Artist - Next".to_owned()),
            ]
        );
    }

    #[test]
    fn track_change_and_resume_collapse() {
        let mut tracker = Tracker::new(3);
        let paused = snapshot("Song, Artist", PlaybackState::Paused, Some(1));
        tracker.observe(Some(&paused), false);

        let actions = tracker.observe(Some(&playing(2)), false);
        assert_eq!(
            actions,
            vec![
                Action::Refresh,
                Action::NowPlaying("Artist - Song".to_owned()),
                Action::ShowMusic,
            ]
        );
    }
}
