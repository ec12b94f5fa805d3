//! Daemon configuration.
//!
//! Every tunable lives here with its default. The binary fills a [`Config`]
//! from command line arguments and environment variables; tests start from
//! [`Config::default`].

use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::token::Token;

/// Entity identifiers on the control plane.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Entities {
    /// Media player mirroring the music app, e.g. a Spotify integration.
    pub monitored: String,
    /// Voice-assistant satellite whose state drives ducking.
    pub satellite: String,
    /// Secondary streaming source paused alongside the music app.
    pub secondary: String,
    /// Boolean shared with the "stop" automation.
    pub ducking_flag: String,
    /// Text slot receiving "artist - title" on track changes.
    pub now_playing: String,
    /// Display device that accepts navigation requests.
    pub display: String,
}

impl Default for Entities {
    fn default() -> Self {
        Self {
            monitored: "media_player.spotify".to_owned(),
            satellite: "assist_satellite.satellite".to_owned(),
            secondary: "media_player.satellite_mediaplayer".to_owned(),
            ducking_flag: "input_boolean.spotify_ducking_active".to_owned(),
            now_playing: "input_text.spotify_last_played".to_owned(),
            display: "sensor.satellite_display".to_owned(),
        }
    }
}

/// Display navigation targets.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Display {
    pub music_path: String,
    pub home_path: String,
    /// After this long the display falls back to its default view by itself.
    pub revert_timeout: Duration,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            music_path: "/view-assist/music".to_owned(),
            home_path: "/view-assist/clock".to_owned(),
            revert_timeout: Duration::from_secs(3600),
        }
    }
}

/// Keep-alive policy for the music app on the device.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KeepAlive {
    pub enabled: bool,
    pub interval: Duration,

    /// Only supervise while the monitored entity plays on this device.
    pub only_when_in_use: bool,
    /// Position updates older than this mean the device is not in use.
    pub in_use_staleness: Duration,

    /// Restart even while a user-stop cooldown is active.
    pub always_reachable: bool,
    /// Minimum gap between two launch attempts.
    pub restart_gap: Duration,
    /// How long a detected "stop" suppresses restarts.
    pub cooldown: Duration,

    /// Android package of the music app.
    pub package: String,
    /// Activity to bring back to the foreground after a launch.
    pub companion: String,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            only_when_in_use: false,
            in_use_staleness: Duration::from_secs(600),
            always_reachable: false,
            restart_gap: Duration::from_secs(60),
            cooldown: Duration::from_secs(600),
            package: "com.spotify.music".to_owned(),
            companion: "com.msp1974.vacompanion/.MainActivity".to_owned(),
        }
    }
}

/// Volume mirroring from the control plane onto the device.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSync {
    pub enabled: bool,
    pub interval: Duration,
    pub only_when_playing: bool,
    /// Require the `source` attribute to be present and equal to the device
    /// name. When off, a missing attribute is accepted.
    pub strict_source: bool,
    /// Number of steps of the device's music stream.
    pub max_steps: u32,
    /// Level changes smaller than this are ignored.
    pub epsilon: f64,
}

impl Default for VolumeSync {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            only_when_playing: true,
            strict_source: false,
            max_steps: 15,
            epsilon: 0.02,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub user_agent: String,

    /// ADB address of the device.
    pub device_host: String,
    pub device_port: u16,
    /// Private key the device has authorized.
    pub adb_key: PathBuf,
    /// Path to the `adb` executable.
    pub adb_binary: PathBuf,
    /// Name under which the device appears as output of the monitored
    /// entity (its `source` attribute).
    pub device_name: String,
    pub shell_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,

    pub hass_url: Url,
    /// Bearer token for the control plane.
    pub token: Option<Token>,
    pub request_timeout: Duration,

    pub entities: Entities,
    pub display: Display,

    pub poll_interval: Duration,
    pub idle_interval: Duration,
    /// Consecutive empty reads before a session counts as gone.
    pub absence_threshold: u32,

    pub resume_poll_interval: Duration,
    pub resume_poll_ceiling: Duration,

    pub keepalive: KeepAlive,
    pub volume: VolumeSync,

    /// Directory for the volume cache and the user-stop marker.
    pub state_dir: PathBuf,
    pub pid_file: PathBuf,
}

impl Config {
    /// Default control-plane location: Home Assistant on the same host.
    pub const DEFAULT_HASS_URL: &'static str = "http://localhost:8123";

    #[must_use]
    pub fn new(hass_url: Url, token: Option<Token>) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = std::env::consts::OS;
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Self {
            user_agent,

            device_host: "192.168.1.100".to_owned(),
            device_port: 5555,
            adb_key: PathBuf::from("adbkey"),
            adb_binary: PathBuf::from("adb"),
            device_name: "Echo Show 5".to_owned(),
            shell_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_secs(10),
            reconnect_cap: Duration::from_secs(120),

            hass_url,
            token,
            request_timeout: Duration::from_secs(8),

            entities: Entities::default(),
            display: Display::default(),

            poll_interval: Duration::from_millis(500),
            idle_interval: Duration::from_secs(5),
            absence_threshold: 3,

            resume_poll_interval: Duration::from_millis(500),
            resume_poll_ceiling: Duration::from_secs(15),

            keepalive: KeepAlive::default(),
            volume: VolumeSync::default(),

            state_dir: PathBuf::from("/var/lib/mediawarden"),
            pid_file: PathBuf::from("/var/lib/mediawarden/mediawarden.pid"),
        }
    }

    /// Path of the persisted volume index.
    #[must_use]
    pub fn volume_cache(&self) -> PathBuf {
        self.state_dir.join("volume_index")
    }

    /// Path of the persisted user-stop cooldown marker.
    #[must_use]
    pub fn stop_marker(&self) -> PathBuf {
        self.state_dir.join("user_stop_until")
    }

    /// Serial under which `adb` knows the device.
    #[must_use]
    pub fn serial(&self) -> String {
        format!("{}:{}", self.device_host, self.device_port)
    }
}

/// # Panics
///
/// Will panic if [`Config::DEFAULT_HASS_URL`] is not a valid URL.
impl Default for Config {
    fn default() -> Self {
        let url = Url::parse(Self::DEFAULT_HASS_URL).expect("invalid default control plane url");
        Self::new(url, None)
    }
}
