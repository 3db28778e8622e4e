// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! User-facing logical devices.
//!
//! A [`UIDevice`] is what a volume panel lists as "Speakers" or
//! "Headphones". It outlives the server streams realizing it: the stream it
//! points at may come and go (profile switches, reconnects) while the device,
//! its id and the user's preferred profile stay.

use crate::card::{Card, CardId, CardPort, CardProfile};
use crate::profile::{self, canonical_name};
use crate::stream::StreamId;
use std::fmt;
use tracing::{debug, warn};

/// Stable local identifier of a device. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Profile component prefix of this direction.
    pub fn own_prefix(self) -> &'static str {
        match self {
            Direction::Output => "output:",
            Direction::Input => "input:",
        }
    }

    /// Profile component prefix of the other direction.
    pub fn opposite_prefix(self) -> &'static str {
        match self {
            Direction::Output => "input:",
            Direction::Input => "output:",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Output => "output",
            Direction::Input => "input",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UIDevice {
    id: DeviceId,
    direction: Direction,
    card: Option<CardId>,
    port_name: Option<String>,
    stream_id: Option<StreamId>,
    description: String,
    origin: Option<String>,
    icon_name: Option<String>,
    port_available: bool,
    profiles: Vec<CardProfile>,
    supported_profiles: Vec<CardProfile>,
    user_preferred_profile: Option<String>,
    disable_profile_swapping: bool,
}

impl UIDevice {
    pub fn new(id: DeviceId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            card: None,
            port_name: None,
            stream_id: None,
            description: String::new(),
            origin: None,
            icon_name: None,
            port_available: true,
            profiles: Vec::new(),
            supported_profiles: Vec::new(),
            user_preferred_profile: None,
            disable_profile_swapping: true,
        }
    }

    /// Device for one port of a card.
    pub(crate) fn from_port(id: DeviceId, card: &Card, port: &CardPort, direction: Direction) -> Self {
        let mut device = Self::new(id, direction);
        device.card = Some(card.id());
        device.port_name = Some(port.name.clone());
        device.description = port.human_name.clone();
        device.origin = Some(card.description().to_string());
        device.icon_name = card.icon_name().map(str::to_string);
        device.port_available = port.available.is_available();
        device.set_profiles(&card.port_profiles(port));
        device
    }

    /// Portless device standing for a whole card in one direction.
    pub(crate) fn from_card(id: DeviceId, card: &Card, direction: Direction) -> Self {
        let mut device = Self::new(id, direction);
        device.card = Some(card.id());
        device.description = card.description().to_string();
        device.icon_name = card.icon_name().map(str::to_string);
        device.set_profiles(card.profiles());
        device
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    pub fn card(&self) -> Option<CardId> {
        self.card
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Portless devices are network or Bluetooth endpoints.
    pub fn has_ports(&self) -> bool {
        self.port_name.is_some()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn icon_name(&self) -> Option<&str> {
        self.icon_name.as_deref()
    }

    pub fn port_available(&self) -> bool {
        self.port_available
    }

    /// Profiles offered to the user, one per canonical class.
    pub fn profiles(&self) -> &[CardProfile] {
        &self.profiles
    }

    pub fn supported_profiles(&self) -> &[CardProfile] {
        &self.supported_profiles
    }

    pub fn user_preferred_profile(&self) -> Option<&str> {
        self.user_preferred_profile.as_deref()
    }

    /// True when there is nothing meaningful to switch between.
    pub fn should_profiles_be_hidden(&self) -> bool {
        self.disable_profile_swapping
    }

    pub(crate) fn set_stream(&mut self, stream_id: StreamId) {
        self.stream_id = Some(stream_id);
    }

    pub(crate) fn invalidate_stream(&mut self) {
        self.stream_id = None;
    }

    pub(crate) fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub(crate) fn set_origin(&mut self, origin: Option<String>) {
        self.origin = origin;
    }

    pub(crate) fn set_icon_name(&mut self, icon_name: Option<String>) {
        self.icon_name = icon_name;
    }

    pub(crate) fn set_port_available(&mut self, available: bool) {
        self.port_available = available;
    }

    pub fn set_user_preferred_profile(&mut self, profile: Option<&str>) {
        self.user_preferred_profile = profile.map(str::to_string);
    }

    /// Store the full profile list and derive the reduced one from it.
    pub fn set_profiles(&mut self, profiles: &[CardProfile]) {
        self.supported_profiles = profiles.to_vec();
        let (reduced, hide) = profile::reduce_profiles(self.direction, profiles);
        debug!(
            "{} ({}) has {} of {} profiles visible",
            self.id,
            self.direction.as_str(),
            reduced.len(),
            profiles.len()
        );
        self.profiles = reduced;
        self.disable_profile_swapping = hide;
    }

    /// Profile the card should switch to for this device.
    ///
    /// Falls back to `current` when nothing matches.
    pub fn best_profile(&self, selected: Option<&str>, current: &str) -> String {
        match profile::best_profile(self.direction, &self.supported_profiles, selected, current) {
            Ok(name) => name.to_string(),
            Err(e) => {
                warn!("{}: {}, keeping '{}'", self.id, e, current);
                current.to_string()
            }
        }
    }

    /// Entry of the reduced list in the same canonical class as `profile`.
    pub fn matching_profile(&self, profile: &str) -> Option<&str> {
        let skip = self.direction.opposite_prefix();
        let wanted = canonical_name(profile, skip);
        self.profiles
            .iter()
            .find(|p| canonical_name(&p.name, skip) == wanted)
            .map(|p| p.name.as_str())
    }

    /// Highest-priority supported profile.
    pub fn top_priority_profile(&self) -> Option<&CardProfile> {
        self.supported_profiles.iter().max_by_key(|p| p.priority)
    }
}
