//! Media session introspection.
//!
//! Android has no structured API for the current media session that is
//! reachable over a shell, so the reader scrapes `dumpsys media_session`.
//! The output is unstable across Android versions and apps; [`parse`] is a
//! pure function that tolerates reordered, partial and malformed output and
//! reports anything it cannot make sense of as "no active session".

use std::{fmt, sync::LazyLock, time::Duration};

use regex_lite::Regex;

use crate::remote::Shell;

/// Playback state as reported by Android's `PlaybackState`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    #[default]
    None,
    Stopped,
    Paused,
    Playing,
    Buffering,
    /// Any state code without a dedicated variant, e.g. connecting or error.
    Other(u32),
}

impl From<u32> for PlaybackState {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Stopped,
            2 => Self::Paused,
            3 => Self::Playing,
            6 => Self::Buffering,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Playing => write!(f, "playing"),
            Self::Buffering => write!(f, "buffering"),
            Self::Other(code) => write!(f, "state {code}"),
        }
    }
}

/// A point-in-time read of the device's active media session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub state: PlaybackState,
    /// Queue item token; changes with every track even when metadata is
    /// reused. Not every app reports it.
    pub active_item_id: Option<u64>,
    /// The raw description, used for change detection without an item id.
    pub description: String,
}

impl PlaybackSnapshot {
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// "Artist - Title", or only the title when the artist is unknown.
    #[must_use]
    pub fn display_text(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

impl fmt::Display for PlaybackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_text(), self.state)
    }
}

/// Filters `dumpsys media_session` down to the three line groups the parser
/// needs: the last description, the first playback state and the last
/// active flag.
pub const COMMAND: &str = "MS=$(dumpsys media_session 2>/dev/null); \
    echo \"$MS\" | grep 'description=' | tail -1; \
    echo '---SEP---'; \
    echo \"$MS\" | grep 'state=PlaybackState' | head -1; \
    echo '---SEP---'; \
    echo \"$MS\" | grep 'active=' | tail -1";

static DESCRIPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"description=(.+)").expect("invalid description pattern"));
static STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"state=PlaybackState\s*\{\s*state=(\d+)").expect("invalid state pattern")
});
static ACTIVE_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"active item id=(\d+)").expect("invalid item pattern"));
static ACTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s,{])active=(\w+)").expect("invalid active pattern"));

/// Parses introspection output into a snapshot.
///
/// Returns `None` unless an explicit `active=true` line and a non-empty
/// description are present. Missing state or item id fall back to
/// [`PlaybackState::None`] and `None` respectively.
#[must_use]
pub fn parse(raw: &str) -> Option<PlaybackSnapshot> {
    let mut description = None;
    let mut state = None;
    let mut active_item_id = None;
    let mut active = None;

    for line in raw.lines() {
        if let Some(captures) = DESCRIPTION.captures(line) {
            // Last one wins, like `tail -1`.
            description = Some(captures[1].trim().to_owned());
            continue;
        }

        if let Some(captures) = STATE.captures(line) {
            // First one wins, like `head -1`.
            if state.is_none() {
                state = captures[1].parse::<u32>().ok().map(PlaybackState::from);
                active_item_id = ACTIVE_ITEM
                    .captures(line)
                    .and_then(|captures| captures[1].parse::<u64>().ok());
            }
            continue;
        }

        if let Some(captures) = ACTIVE.captures(line) {
            active = Some(&captures[1] == "true");
        }
    }

    if active != Some(true) {
        return None;
    }

    let description = description.filter(|description| !description.is_empty())?;
    let mut fields = description.splitn(3, ',').map(str::trim);
    let title = fields
        .next()
        .filter(|title| !title.is_empty())
        .unwrap_or("?")
        .to_owned();
    let artist = fields.next().unwrap_or_default().to_owned();
    let album = fields.next().unwrap_or_default();

    // Some apps append the playlist as "Album / Playlist".
    let album = album
        .rsplit_once(" / ")
        .map_or(album, |(album, _)| album)
        .trim()
        .to_owned();

    Some(PlaybackSnapshot {
        title,
        artist,
        album,
        state: state.unwrap_or_default(),
        active_item_id,
        description,
    })
}

/// Reads the current session from the device.
///
/// Channel failures and unparsable output both read as "no session".
pub async fn read(shell: &dyn Shell, timeout: Duration) -> Option<PlaybackSnapshot> {
    let raw = shell.execute(COMMAND, timeout).await?;
    let snapshot = parse(&raw);
    trace!("session: {snapshot:?}");
    snapshot
}
