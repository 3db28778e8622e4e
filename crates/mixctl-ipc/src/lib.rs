// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared IPC types and D-Bus interface definitions for mixctl.
//!
//! This crate defines the communication protocol between the mixctl daemon
//! and its clients via D-Bus. Identifiers are the daemon's stable local ids,
//! never sound-server indices (except where a field says so).

use serde::{Deserialize, Serialize};
use zbus::zvariant::Type;

/// D-Bus service name for the mixctl daemon.
pub const DBUS_NAME: &str = "com.mixctl.Daemon";

/// D-Bus object path for the main daemon interface.
pub const DBUS_PATH: &str = "/com/mixctl/Daemon";

/// D-Bus interface name.
pub const DBUS_INTERFACE: &str = "com.mixctl.Daemon";

/// Placeholder for "no id" in fields and signal arguments.
pub const INVALID_ID: u32 = u32::MAX;

/// Map an optional id onto the wire representation.
pub fn wire_id(id: Option<u32>) -> u32 {
    id.unwrap_or(INVALID_ID)
}

/// Map a wire id back, treating [`INVALID_ID`] as absent.
pub fn from_wire_id(id: u32) -> Option<u32> {
    (id != INVALID_ID).then_some(id)
}

/// A card profile as offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct ProfileInfo {
    /// Server-side profile name.
    pub name: String,
    /// Human-readable name.
    pub human_name: String,
    /// Short summary such as "2 Outputs / 1 Input".
    pub status: String,
    pub priority: u32,
}

/// A user-facing input or output device.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct DeviceInfo {
    /// Stable device id.
    pub id: u32,
    pub description: String,
    /// Usually the card description; empty for network devices.
    pub origin: String,
    pub icon_name: String,
    /// Card port name, empty for portless devices.
    pub port_name: String,
    /// Stable card id or [`INVALID_ID`].
    pub card_id: u32,
    /// Stream currently realizing the device or [`INVALID_ID`].
    pub stream_id: u32,
    /// Whether the port can currently be used (jack detection).
    pub available: bool,
    /// Whether this device is the one the default stream currently plays through.
    pub active: bool,
    /// Reduced profile list.
    pub profiles: Vec<ProfileInfo>,
    /// Entry of `profiles` matching the card's active profile, empty if none.
    pub active_profile: String,
    /// True when the profile selector should not be shown.
    pub hide_profiles: bool,
}

impl DeviceInfo {
    /// Get the display name for the device.
    pub fn display_name(&self) -> String {
        if self.origin.is_empty() || self.origin == self.description {
            self.description.clone()
        } else {
            format!("{} - {}", self.description, self.origin)
        }
    }

    pub fn card(&self) -> Option<u32> {
        from_wire_id(self.card_id)
    }

    pub fn stream(&self) -> Option<u32> {
        from_wire_id(self.stream_id)
    }
}

/// A sink, source, application stream or the system-sounds stream.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct StreamInfo {
    /// Stable stream id.
    pub id: u32,
    /// Sound-server index, [`INVALID_ID`] for the system-sounds stream.
    pub index: u32,
    /// One of "sink", "source", "sink-input", "source-output", "event-role".
    pub kind: String,
    pub name: String,
    pub description: String,
    pub icon_name: String,
    pub application_id: String,
    /// Loudest channel, in percent of normal volume.
    pub volume_percent: f64,
    /// -1.0 (left) to 1.0 (right).
    pub balance: f64,
    pub can_balance: bool,
    pub muted: bool,
    /// Active port, empty if the stream has none.
    pub port: String,
    pub is_default: bool,
}

/// A sound card.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct CardInfo {
    /// Stable card id.
    pub id: u32,
    /// Sound-server index.
    pub index: u32,
    pub name: String,
    pub description: String,
    pub active_profile: String,
    /// Profile a pending switch is heading to, empty if none.
    pub target_profile: String,
    pub profiles: Vec<ProfileInfo>,
}

/// Error types for daemon operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonError {
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),
    #[error("Device not found: {0}")]
    DeviceNotFound(u32),
    #[error("Card not found: {0}")]
    CardNotFound(u32),
    #[error("Sound server error: {0}")]
    SoundServer(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DaemonError> for zbus::fdo::Error {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(description: &str, origin: &str) -> DeviceInfo {
        DeviceInfo {
            id: 1,
            description: description.to_string(),
            origin: origin.to_string(),
            icon_name: String::new(),
            port_name: String::new(),
            card_id: INVALID_ID,
            stream_id: 4,
            available: true,
            active: false,
            profiles: Vec::new(),
            active_profile: String::new(),
            hide_profiles: true,
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(device("Speakers", "Built-in Audio").display_name(), "Speakers - Built-in Audio");
        assert_eq!(device("Tunnel", "").display_name(), "Tunnel");
    }

    #[test]
    fn test_wire_ids() {
        let d = device("Speakers", "");
        assert_eq!(d.card(), None);
        assert_eq!(d.stream(), Some(4));
        assert_eq!(wire_id(None), INVALID_ID);
        assert_eq!(from_wire_id(wire_id(Some(7))), Some(7));
    }

    #[test]
    fn test_invalid_argument_maps_to_invalid_args() {
        let e: zbus::fdo::Error = DaemonError::InvalidArgument("volume".into()).into();
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));
        let e: zbus::fdo::Error = DaemonError::DeviceNotFound(3).into();
        assert!(matches!(e, zbus::fdo::Error::Failed(_)));
    }
}
