use std::{fs, path::PathBuf, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use url::Url;

use mediawarden::{
    config::{Config, Entities},
    daemon::Daemon,
    error::{ErrorKind, Result},
    hass::HomeAssistant,
    pidfile::{self, PidFile},
    remote::Channel,
    signal,
    token::Token,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Parses a number of seconds, fractions allowed.
fn seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{e}"))
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    hass: HassArgs,

    #[command(flatten)]
    entities: EntityArgs,

    #[command(flatten)]
    polling: PollingArgs,

    #[command(flatten)]
    keepalive: KeepAliveArgs,

    #[command(flatten)]
    volume: VolumeArgs,

    /// State directory
    ///
    /// Holds the volume cache, the stop marker and the PID file.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value = "/var/lib/mediawarden", env = "MEDIAWARDEN_STATE_DIR")]
    state_dir: PathBuf,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Device")]
struct DeviceArgs {
    /// Host name or IP address under which the device accepts ADB over TCP
    #[arg(long, value_hint = ValueHint::Hostname, default_value = "192.168.1.100", env = "MEDIAWARDEN_DEVICE_HOST")]
    device_host: String,

    #[arg(long, default_value_t = 5555, env = "MEDIAWARDEN_DEVICE_PORT")]
    device_port: u16,

    /// Private key the device has authorized
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "adbkey", env = "MEDIAWARDEN_ADB_KEY")]
    adb_key: PathBuf,

    #[arg(long, value_name = "FILE", value_hint = ValueHint::ExecutablePath, default_value = "adb", env = "MEDIAWARDEN_ADB")]
    adb_binary: PathBuf,

    /// Name under which the device appears as `source` of the monitored
    /// media player
    #[arg(long, default_value = "Echo Show 5", env = "MEDIAWARDEN_DEVICE_NAME")]
    device_name: String,
}

impl DeviceArgs {
    fn apply(&self, config: &mut Config) {
        config.device_host.clone_from(&self.device_host);
        config.device_port = self.device_port;
        config.adb_key.clone_from(&self.adb_key);
        config.adb_binary.clone_from(&self.adb_binary);
        config.device_name.clone_from(&self.device_name);
    }
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Home Assistant")]
struct HassArgs {
    #[arg(long, value_hint = ValueHint::Url, default_value = Config::DEFAULT_HASS_URL, env = "HASS_URL")]
    hass_url: Url,

    /// Long-lived access token, takes precedence over the secrets file
    #[arg(long, env = "HASS_TOKEN", hide_env_values = true)]
    token: Option<Token>,

    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains a token that grants access to your Home Assistant instance.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "secrets.toml", env = "MEDIAWARDEN_SECRETS_FILE")]
    secrets_file: PathBuf,

    /// View shown while music plays
    #[arg(long, default_value = "/view-assist/music", env = "MEDIAWARDEN_MUSIC_VIEW")]
    music_view: String,

    /// View shown otherwise
    #[arg(long, default_value = "/view-assist/clock", env = "MEDIAWARDEN_HOME_VIEW")]
    home_view: String,

    /// Seconds after which the display reverts to its default view
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "3600", env = "MEDIAWARDEN_VIEW_REVERT")]
    view_revert: Duration,
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Entities")]
struct EntityArgs {
    #[arg(long, default_value_t = Entities::default().monitored, env = "MEDIAWARDEN_MONITORED_ENTITY")]
    monitored_entity: String,

    #[arg(long, default_value_t = Entities::default().satellite, env = "MEDIAWARDEN_SATELLITE_ENTITY")]
    satellite_entity: String,

    /// Media player paused alongside the device while ducking
    #[arg(long, default_value_t = Entities::default().secondary, env = "MEDIAWARDEN_SECONDARY_ENTITY")]
    secondary_entity: String,

    /// Boolean shared with the stop automation
    #[arg(long, default_value_t = Entities::default().ducking_flag, env = "MEDIAWARDEN_DUCKING_FLAG")]
    ducking_flag: String,

    #[arg(long, default_value_t = Entities::default().now_playing, env = "MEDIAWARDEN_NOW_PLAYING_ENTITY")]
    now_playing_entity: String,

    #[arg(long, default_value_t = Entities::default().display, env = "MEDIAWARDEN_DISPLAY_DEVICE")]
    display_device: String,
}

impl From<&EntityArgs> for Entities {
    fn from(args: &EntityArgs) -> Self {
        Self {
            monitored: args.monitored_entity.clone(),
            satellite: args.satellite_entity.clone(),
            secondary: args.secondary_entity.clone(),
            ducking_flag: args.ducking_flag.clone(),
            now_playing: args.now_playing_entity.clone(),
            display: args.display_device.clone(),
        }
    }
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Polling")]
struct PollingArgs {
    /// Seconds between polls while playing or ducking
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "0.5", env = "MEDIAWARDEN_POLL_INTERVAL")]
    poll_interval: Duration,

    /// Seconds between polls otherwise
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "5", env = "MEDIAWARDEN_IDLE_INTERVAL")]
    idle_interval: Duration,

    /// Consecutive empty reads before a session counts as gone
    #[arg(long, default_value_t = 3, env = "MEDIAWARDEN_ABSENCE_THRESHOLD")]
    absence_threshold: u32,

    /// Seconds between ducking flag reads after the assistant went idle
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "0.5", env = "MEDIAWARDEN_RESUME_POLL")]
    resume_poll: Duration,

    /// Seconds to wait for a stop before resuming
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "15", env = "MEDIAWARDEN_RESUME_CEILING")]
    resume_ceiling: Duration,
}

impl PollingArgs {
    fn apply(&self, config: &mut Config) {
        config.poll_interval = self.poll_interval;
        config.idle_interval = self.idle_interval;
        config.absence_threshold = self.absence_threshold;
        config.resume_poll_interval = self.resume_poll;
        config.resume_poll_ceiling = self.resume_ceiling;
    }
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Keep-alive")]
#[allow(clippy::struct_excessive_bools)]
struct KeepAliveArgs {
    /// Do not relaunch the music app
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_NO_KEEPALIVE")]
    no_keepalive: bool,

    /// Seconds between keep-alive checks
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "30", env = "MEDIAWARDEN_KEEPALIVE_INTERVAL")]
    keepalive_interval: Duration,

    /// Only relaunch while the monitored player plays on this device
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_KEEPALIVE_ONLY_IN_USE")]
    keepalive_only_in_use: bool,

    /// Relaunch even right after the user stopped the music
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_ALWAYS_REACHABLE")]
    always_reachable: bool,

    /// Minimum seconds between two launches
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "60", env = "MEDIAWARDEN_RESTART_GAP")]
    restart_gap: Duration,

    /// Seconds a stop request suppresses relaunches
    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "600", env = "MEDIAWARDEN_STOP_COOLDOWN")]
    stop_cooldown: Duration,

    #[arg(long, default_value = "com.spotify.music", env = "MEDIAWARDEN_PACKAGE")]
    package: String,

    /// Activity brought to the front after a launch
    #[arg(long, default_value = "com.msp1974.vacompanion/.MainActivity", env = "MEDIAWARDEN_COMPANION")]
    companion: String,
}

impl KeepAliveArgs {
    fn apply(&self, config: &mut Config) {
        let keepalive = &mut config.keepalive;
        keepalive.enabled = !self.no_keepalive;
        keepalive.interval = self.keepalive_interval;
        keepalive.only_when_in_use = self.keepalive_only_in_use;
        keepalive.always_reachable = self.always_reachable;
        keepalive.restart_gap = self.restart_gap;
        keepalive.cooldown = self.stop_cooldown;
        keepalive.package.clone_from(&self.package);
        keepalive.companion.clone_from(&self.companion);
    }
}

#[derive(Clone, Debug, clap::Args)]
#[command(next_help_heading = "Volume")]
struct VolumeArgs {
    /// Do not mirror the volume
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_NO_VOLUME_SYNC")]
    no_volume_sync: bool,

    #[arg(long, value_name = "SECONDS", value_parser = seconds, default_value = "5", env = "MEDIAWARDEN_VOLUME_INTERVAL")]
    volume_interval: Duration,

    /// Mirror the volume while paused too
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_VOLUME_ALWAYS")]
    volume_always: bool,

    /// Require the media player to name this device as its source
    #[arg(long, default_value_t = false, env = "MEDIAWARDEN_STRICT_SOURCE")]
    strict_source: bool,

    /// Steps of the device's music stream
    #[arg(long, default_value_t = 15, env = "MEDIAWARDEN_VOLUME_STEPS")]
    volume_steps: u32,

    /// Smallest volume change (0.0 to 1.0) that is mirrored
    #[arg(long, default_value_t = 0.02, env = "MEDIAWARDEN_VOLUME_EPSILON")]
    volume_epsilon: f64,
}

impl VolumeArgs {
    fn apply(&self, config: &mut Config) {
        let volume = &mut config.volume;
        volume.enabled = !self.no_volume_sync;
        volume.interval = self.volume_interval;
        volume.only_when_playing = !self.volume_always;
        volume.strict_source = self.strict_source;
        volume.max_steps = self.volume_steps;
        volume.epsilon = self.volume_epsilon;
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the token from the command line, or else from the secrets file.
fn load_token(args: &Args) -> Result<Token> {
    if let Some(token) = &args.hass.token {
        return Ok(token.clone());
    }

    let token = Token::from_file(&args.hass.secrets_file);
    if let Err(ref e) = token {
        if e.kind == ErrorKind::NotFound {
            info!(
                "set HASS_TOKEN or put your access token in {}",
                args.hass.secrets_file.display()
            );
        }
    }

    token
}

fn config(args: &Args, token: Token) -> Config {
    let mut config = Config::new(args.hass.hass_url.clone(), Some(token));

    args.device.apply(&mut config);
    config.entities = Entities::from(&args.entities);
    config.display.music_path.clone_from(&args.hass.music_view);
    config.display.home_path.clone_from(&args.hass.home_view);
    config.display.revert_timeout = args.hass.view_revert;
    args.polling.apply(&mut config);
    args.keepalive.apply(&mut config);
    args.volume.apply(&mut config);

    config.state_dir.clone_from(&args.state_dir);
    config.pid_file = args.state_dir.join("mediawarden.pid");

    config
}

/// Main application loop.
///
/// Returns when a termination signal arrives.
///
/// # Errors
///
/// Returns an error when the daemon cannot start: no token, an unusable
/// state directory or signal handlers that cannot be registered.
async fn run(args: Args) -> Result<()> {
    let token = load_token(&args)?;
    let config = config(&args, token);

    fs::create_dir_all(&config.state_dir)?;
    let pidfile = PidFile::acquire(&config.pid_file, pidfile::GRACE_PERIOD).await?;

    let mut signals = signal::Handler::new()?;

    let shell = Arc::new(Channel::new(&config));
    let hass = Arc::new(HomeAssistant::new(&config)?);
    let mut daemon = Daemon::new(config, shell, hass);

    tokio::select! {
        // Prioritize shutdown signals.
        biased;

        signal = signals.recv() => {
            info!("received {signal}, shutting down gracefully");
        }

        () = daemon.run() => {
            warn!("daemon loop ended");
        }
    }

    daemon.shutdown().await;
    pidfile.remove();

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds() {
        assert_eq!(seconds("0.5"), Ok(Duration::from_millis(500)));
        assert_eq!(seconds("30"), Ok(Duration::from_secs(30)));
        assert!(seconds("-1").is_err());
        assert!(seconds("soon").is_err());
    }

    #[test]
    fn defaults_match_config() {
        let args = Args::parse_from(["mediawarden", "--token", "abc"]);
        let token = args.hass.token.clone().unwrap();
        let config = config(&args, token);
        let defaults = Config::default();

        assert_eq!(config.entities, defaults.entities);
        assert_eq!(config.display, defaults.display);
        assert_eq!(config.keepalive, defaults.keepalive);
        assert_eq!(config.volume, defaults.volume);
        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.resume_poll_ceiling, defaults.resume_poll_ceiling);
        assert_eq!(config.pid_file, defaults.pid_file);
    }

    #[test]
    fn sections_fill_config() {
        let args = Args::parse_from([
            "mediawarden",
            "--token",
            "abc",
            "--device-host",
            "10.0.0.7",
            "--no-keepalive",
            "--volume-steps",
            "25",
            "--resume-ceiling",
            "8",
            "--state-dir",
            "/tmp/mw",
        ]);
        let token = args.hass.token.clone().unwrap();
        let config = config(&args, token);

        assert_eq!(config.serial(), "10.0.0.7:5555");
        assert!(!config.keepalive.enabled);
        assert_eq!(config.volume.max_steps, 25);
        assert_eq!(config.resume_poll_ceiling, Duration::from_secs(8));
        assert_eq!(config.pid_file, PathBuf::from("/tmp/mw/mediawarden.pid"));
    }
}
