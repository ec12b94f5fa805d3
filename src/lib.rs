//! Supervisory daemon for an Android voice satellite's media session.
//!
//! mediawarden bridges a wall-mounted Android tablet (reached over ADB) and
//! Home Assistant:
//!
//! * [`session`] and [`playback`] mirror the device's media session into the
//!   control plane: now-playing text, entity refreshes and the display view.
//! * [`ducking`] pauses music while the voice assistant listens and resumes
//!   it afterwards, unless the user asked to stop.
//! * [`keepalive`] relaunches the music app when the OS kills it.
//! * [`volume`] mirrors the media player's volume onto the device.
//!
//! [`daemon::Daemon`] runs all of it in one sequential loop.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod daemon;
pub mod ducking;
pub mod error;
pub mod hass;
pub mod http;
pub mod keepalive;
pub mod pidfile;
pub mod playback;
pub mod remote;
pub mod session;
pub mod signal;
pub mod store;
pub mod token;
pub mod util;
pub mod volume;

#[cfg(test)]
mod testing;
