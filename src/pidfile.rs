//! Process singleton.
//!
//! Two daemons driving the same device would fight over the media session,
//! so a new instance terminates whichever instance the PID file names before
//! taking over.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

use crate::error::{Error, Result};

/// How often a terminating predecessor is checked for.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a predecessor gets to exit after SIGTERM.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The PID file of the running instance.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Takes over the PID file at `path`.
    ///
    /// A live process named by the file is sent SIGTERM and, if it is still
    /// there after `grace`, SIGKILL. Unreadable or stale contents are
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the current process id cannot be determined or
    /// the PID file cannot be written.
    pub async fn acquire(path: impl Into<PathBuf>, grace: Duration) -> Result<Self> {
        let path = path.into();
        let own = sysinfo::get_current_pid().map_err(Error::internal)?;

        if let Some(previous) = read(&path) {
            if previous != own {
                terminate(previous, grace).await;
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, own.to_string())?;
        debug!("pid {own} written to {}", path.display());

        Ok(Self { path })
    }

    /// Deletes the PID file.
    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("removing {}: {e}", self.path.display()),
        }
    }
}

fn read(path: &Path) -> Option<Pid> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let pid = contents.trim().parse::<u32>().ok().map(Pid::from_u32);
            if pid.is_none() {
                warn!("ignoring malformed pid file {}", path.display());
            }
            pid
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("reading {}: {e}", path.display());
            None
        }
    }
}

fn is_alive(system: &mut System, pid: Pid) -> bool {
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some_and(|process| {
        !matches!(
            process.status(),
            ProcessStatus::Zombie | ProcessStatus::Dead
        )
    })
}

async fn terminate(pid: Pid, grace: Duration) {
    let mut system = System::new();
    if !is_alive(&mut system, pid) {
        debug!("previous instance {pid} is gone");
        return;
    }

    warn!("terminating previous instance {pid}");
    if let Some(process) = system.process(pid) {
        if process.kill_with(Signal::Term) != Some(true) {
            warn!("cannot send SIGTERM to {pid}");
        }
    }

    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(POLL_INTERVAL).await;
        waited += POLL_INTERVAL;
        if !is_alive(&mut system, pid) {
            info!("previous instance {pid} exited");
            return;
        }
    }

    error!("previous instance {pid} ignored SIGTERM, killing");
    if let Some(process) = system.process(pid) {
        if !process.kill() {
            error!("cannot kill {pid}");
        }
    }
}
