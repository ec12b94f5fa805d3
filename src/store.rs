//! Persisted single-value state files.
//!
//! Each file holds one textual value and is rewritten whole. There is no
//! locking: the last writer wins, which the readers tolerate.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{error::Result, util};

fn read_value(path: &Path) -> Result<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.trim().parse()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_value(path: &Path, value: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, value.to_string()).map_err(Into::into)
}

/// Last volume index applied to the device.
///
/// Survives daemon restarts so that a relaunched music app can be put back
/// at the volume it had.
#[derive(Clone, Debug)]
pub struct VolumeCache {
    path: PathBuf,
}

impl VolumeCache {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the cached index, or `None` if nothing usable is cached.
    #[must_use]
    pub fn load(&self) -> Option<u32> {
        match read_value(&self.path) {
            Ok(value) => value.and_then(|value| u32::try_from(value).ok()),
            Err(e) => {
                warn!("reading volume cache {}: {e}", self.path.display());
                None
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub fn store(&self, index: u32) -> Result<()> {
        write_value(&self.path, index.into())
    }
}

/// Cooldown after the user told the assistant to stop the music.
///
/// Holds the Unix timestamp until which the keep-alive supervisor must not
/// relaunch the music app.
#[derive(Clone, Debug)]
pub struct StopMarker {
    path: PathBuf,
}

impl StopMarker {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Starts a cooldown of `cooldown` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn set(&self, cooldown: Duration) -> Result<()> {
        self.set_until(util::now_from_epoch().saturating_add(cooldown.as_secs()))
    }

    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn set_until(&self, expiry: u64) -> Result<()> {
        write_value(&self.path, expiry)
    }

    /// Returns the expiry timestamp if a marker exists.
    #[must_use]
    pub fn expiry(&self) -> Option<u64> {
        match read_value(&self.path) {
            Ok(expiry) => expiry,
            Err(e) => {
                warn!("reading stop marker {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Whether the cooldown is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.expiry()
            .is_some_and(|expiry| expiry > util::now_from_epoch())
    }

    /// Removes the marker. Returns whether there was one.
    pub fn clear(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("removing stop marker {}: {e}", self.path.display());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VolumeCache::new(dir.path().join("nested").join("volume_index"));

        assert_eq!(cache.load(), None);
        cache.store(9).unwrap();
        assert_eq!(cache.load(), Some(9));
        cache.store(3).unwrap();
        assert_eq!(cache.load(), Some(3));
    }

    #[test]
    fn volume_cache_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume_index");
        fs::write(&path, "loud").unwrap();

        assert_eq!(VolumeCache::new(path).load(), None);
    }

    #[test]
    fn stop_marker_expires() {
        let dir = tempfile::tempdir().unwrap();
        let marker = StopMarker::new(dir.path().join("user_stop_until"));
        assert!(!marker.is_active());

        marker.set(Duration::from_secs(600)).unwrap();
        assert!(marker.is_active());

        marker.set_until(util::now_from_epoch() - 1).unwrap();
        assert!(!marker.is_active());
        assert!(marker.expiry().is_some());
    }

    #[test]
    fn stop_marker_clear() {
        let dir = tempfile::tempdir().unwrap();
        let marker = StopMarker::new(dir.path().join("user_stop_until"));

        assert!(!marker.clear());
        marker.set(Duration::from_secs(60)).unwrap();
        assert!(marker.clear());
        assert!(!marker.is_active());
    }
}
