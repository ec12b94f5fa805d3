use std::time;

/// Get the current system time in epoch format.
///
/// # Returns
///
/// Current system time in seconds from epoch, or zero when the clock is set
/// before epoch.
#[must_use]
pub fn now_from_epoch() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map_or(0, |since| since.as_secs())
}
