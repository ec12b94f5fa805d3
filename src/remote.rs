//! Remote shell channel to the device.
//!
//! The device is an Android tablet reached over ADB. [`Channel`] drives the
//! `adb` command-line client, authenticating with a private key the device
//! has authorized, and exposes one primitive: run a shell command and return
//! its output.
//!
//! # Failure handling
//!
//! * Commands are serialized by a single mutex, so request/response pairs of
//!   concurrent callers never interleave.
//! * Any transport failure or timeout invalidates the connection. Until
//!   [`Shell::connect`] succeeds again, [`Shell::execute`] returns `None`
//!   without touching the device.
//! * Failed connection attempts grow the reconnect delay linearly up to a
//!   cap; a successful connection resets it.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};

use crate::{
    config::Config,
    error::{Error, Result},
};

#[async_trait]
pub trait Shell: Send + Sync {
    /// Establishes the session.
    async fn connect(&self) -> Result<()>;

    /// Runs `command` on the device.
    ///
    /// Returns `None` when the channel is not connected or the command could
    /// not be delivered, in which case the channel is invalidated.
    async fn execute(&self, command: &str, timeout: Duration) -> Option<String>;

    /// Tears down the session.
    async fn disconnect(&self);

    async fn is_connected(&self) -> bool;

    /// How long to wait before the next connection attempt.
    fn reconnect_delay(&self) -> Duration;
}

/// Linear backoff: `min(base × attempts, cap)`.
#[must_use]
pub fn backoff(base: Duration, attempts: u32, cap: Duration) -> Duration {
    base.saturating_mul(attempts).min(cap)
}

/// An authenticated device session.
#[derive(Clone, Debug)]
struct Device {
    serial: String,
}

/// ADB-backed [`Shell`].
pub struct Channel {
    adb: PathBuf,
    key: PathBuf,
    serial: String,
    connect_timeout: Duration,

    device: Mutex<Option<Device>>,

    attempts: AtomicU32,
    reconnect_base: Duration,
    reconnect_cap: Duration,
}

impl Channel {
    /// Messages `adb` prints for a broken transport. Remote commands print
    /// their own `error:` lines, which must not match.
    const TRANSPORT_ERRORS: [&'static str; 6] = [
        "error: device",
        "error: closed",
        "error: no devices",
        "error: more than one device",
        "error: protocol fault",
        "error: connect failed",
    ];

    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            adb: config.adb_binary.clone(),
            key: config.adb_key.clone(),
            serial: config.serial(),
            connect_timeout: config.shell_timeout.max(Duration::from_secs(8)),
            device: Mutex::new(None),
            attempts: AtomicU32::new(0),
            reconnect_base: config.reconnect_base,
            reconnect_cap: config.reconnect_cap,
        }
    }

    /// Runs `adb` with `args` and returns its standard output.
    ///
    /// A non-zero exit status alone is not a failure: `adb shell` passes on
    /// the exit status of the remote command, e.g. `pidof` finding nothing.
    async fn adb(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let child = Command::new(&self.adb)
            .env("ADB_VENDOR_KEYS", &self.key)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output()).await??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(line) = stderr.lines().map(str::trim).find(|line| {
            Self::TRANSPORT_ERRORS
                .iter()
                .any(|prefix| line.starts_with(prefix))
        }) {
            return Err(Error::unavailable(line.to_owned()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn shell(&self, device: &Device, command: &str, timeout: Duration) -> Result<String> {
        self.adb(&["-s", &device.serial, "shell", command], timeout)
            .await
    }

    fn failed_attempt(&self) {
        let attempts = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("connection attempt {attempts} to {} failed", self.serial);
    }
}

#[async_trait]
impl Shell for Channel {
    async fn connect(&self) -> Result<()> {
        let mut device = self.device.lock().await;
        *device = None;

        let output = match self
            .adb(&["connect", &self.serial], self.connect_timeout)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.failed_attempt();
                return Err(e);
            }
        };

        // Both "connected to" and "already connected to" are fine.
        if !output.contains("connected to") || output.contains("failed") {
            self.failed_attempt();
            return Err(Error::unavailable(format!(
                "cannot connect to {}: {}",
                self.serial,
                output.trim()
            )));
        }

        // An unauthorized device accepts the TCP connection but refuses
        // commands, so prove the session works.
        let candidate = Device {
            serial: self.serial.clone(),
        };
        match self.shell(&candidate, "echo ok", self.connect_timeout).await {
            Ok(reply) if reply.trim() == "ok" => {
                self.attempts.store(0, Ordering::Relaxed);
                *device = Some(candidate);
                info!("connected to {}", self.serial);
                Ok(())
            }
            Ok(reply) => {
                self.failed_attempt();
                Err(Error::unauthenticated(format!(
                    "{} did not answer: {}",
                    self.serial,
                    reply.trim()
                )))
            }
            Err(e) => {
                self.failed_attempt();
                Err(e)
            }
        }
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Option<String> {
        let mut guard = self.device.lock().await;
        let device = guard.clone()?;

        match self.shell(&device, command, timeout).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("shell command failed: {e}");
                *guard = None;
                None
            }
        }
    }

    async fn disconnect(&self) {
        if self.device.lock().await.take().is_some() {
            if let Err(e) = self
                .adb(&["disconnect", &self.serial], self.connect_timeout)
                .await
            {
                debug!("disconnecting {}: {e}", self.serial);
            }
            info!("disconnected from {}", self.serial);
        }
    }

    async fn is_connected(&self) -> bool {
        self.device.lock().await.is_some()
    }

    fn reconnect_delay(&self) -> Duration {
        backoff(
            self.reconnect_base,
            self.attempts.load(Ordering::Relaxed),
            self.reconnect_cap,
        )
    }
}
