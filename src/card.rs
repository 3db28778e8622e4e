// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hardware cards, their profiles and ports.

use crate::server::{
    CardInfo, OperationId, OperationSlot, PortAvailability, PortDirection, Request, SoundServer,
};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Stable local identifier of a card. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardId(pub u32);

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "card#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CardError {
    #[error("Card '{0}' has no profiles")]
    NoProfiles(String),
    #[error("Card '{card}' has no profile named '{profile}'")]
    UnknownProfile { card: String, profile: String },
    #[error("Failed to request profile '{profile}' on card '{card}'")]
    RequestFailed { card: String, profile: String },
}

/// One operating mode of a card.
#[derive(Debug, Clone, PartialEq)]
pub struct CardProfile {
    pub name: String,
    pub human_name: String,
    /// Summary of the streams the profile provides, e.g. "1 Output / 1 Input".
    pub status: String,
    pub priority: u32,
    pub n_sinks: u32,
    pub n_sources: u32,
}

/// A physical connector on a card.
#[derive(Debug, Clone, PartialEq)]
pub struct CardPort {
    pub name: String,
    pub human_name: String,
    pub priority: u32,
    pub available: PortAvailability,
    pub direction: PortDirection,
    /// Names of the card profiles this port works with.
    pub profiles: Vec<String>,
}

/// Port whose availability crossed the available/unavailable line.
#[derive(Debug, Clone, PartialEq)]
pub struct PortAvailabilityChange {
    pub port: String,
    pub direction: PortDirection,
    pub available: bool,
}

fn profile_status(n_sinks: u32, n_sources: u32) -> String {
    let plural = |n: u32, word: &str| {
        if n == 1 {
            format!("1 {}", word)
        } else {
            format!("{} {}s", n, word)
        }
    };
    match (n_sinks, n_sources) {
        (0, 0) => "Off".to_string(),
        (s, 0) => plural(s, "Output"),
        (0, s) => plural(s, "Input"),
        (o, i) => format!("{} / {}", plural(o, "Output"), plural(i, "Input")),
    }
}

#[derive(Debug)]
pub struct Card {
    id: CardId,
    index: u32,
    name: String,
    description: String,
    icon_name: Option<String>,
    profiles: Vec<CardProfile>,
    ports: Vec<CardPort>,
    active_profile: Option<String>,
    human_profile: Option<String>,
    target_profile: Option<String>,
    profile_op: OperationSlot,
}

impl Card {
    /// Build a card from its first server report.
    ///
    /// Profiles and ports are sorted by descending priority.
    pub fn from_info(id: CardId, info: &CardInfo) -> Self {
        let mut profiles: Vec<CardProfile> = info
            .profiles
            .iter()
            .map(|p| CardProfile {
                name: p.name.clone(),
                human_name: p.description.clone(),
                status: profile_status(p.n_sinks, p.n_sources),
                priority: p.priority,
                n_sinks: p.n_sinks,
                n_sources: p.n_sources,
            })
            .collect();
        profiles.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut ports: Vec<CardPort> = info
            .ports
            .iter()
            .map(|p| CardPort {
                name: p.name.clone(),
                human_name: p.description.clone(),
                priority: p.priority,
                available: p.available,
                direction: p.direction,
                profiles: p.profiles.clone(),
            })
            .collect();
        ports.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut card = Self {
            id,
            index: info.index,
            name: info.name.clone(),
            description: info.description.clone(),
            icon_name: info.icon_name.clone(),
            profiles,
            ports,
            active_profile: None,
            human_profile: None,
            target_profile: None,
            profile_op: OperationSlot::default(),
        };

        if let Some(active) = &info.active_profile {
            if let Err(e) = card.set_profile(active) {
                warn!("Card {}: {}", card.name, e);
            }
        }
        card
    }

    pub fn id(&self) -> CardId {
        self.id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Re-key the card after a reconnect handed out a new server index.
    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn icon_name(&self) -> Option<&str> {
        self.icon_name.as_deref()
    }

    pub fn profiles(&self) -> &[CardProfile] {
        &self.profiles
    }

    pub fn ports(&self) -> &[CardPort] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&CardPort> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Profiles usable with the given port, in card order.
    pub fn port_profiles(&self, port: &CardPort) -> Vec<CardProfile> {
        self.profiles
            .iter()
            .filter(|p| port.profiles.contains(&p.name))
            .cloned()
            .collect()
    }

    pub fn active_profile(&self) -> Option<&str> {
        self.active_profile.as_deref()
    }

    /// The active profile entry.
    pub fn profile(&self) -> Option<&CardProfile> {
        let active = self.active_profile.as_deref()?;
        self.profiles.iter().find(|p| p.name == active)
    }

    pub fn human_profile(&self) -> Option<&str> {
        self.human_profile.as_deref()
    }

    pub fn target_profile(&self) -> Option<&str> {
        self.target_profile.as_deref()
    }

    pub fn is_changing_profile(&self) -> bool {
        self.profile_op.is_pending()
    }

    pub(crate) fn set_metadata(&mut self, info: &CardInfo) {
        self.name = info.name.clone();
        self.description = info.description.clone();
        self.icon_name = info.icon_name.clone();
    }

    /// Record `name` as the active profile.
    pub fn set_profile(&mut self, name: &str) -> Result<(), CardError> {
        if self.profiles.is_empty() {
            return Err(CardError::NoProfiles(self.name.clone()));
        }
        if self.active_profile.as_deref() == Some(name) {
            return Ok(());
        }
        let profile = self
            .profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CardError::UnknownProfile {
                card: self.name.clone(),
                profile: name.to_string(),
            })?;

        debug!("Card {} profile is now '{}'", self.name, name);
        self.human_profile = Some(profile.human_name.clone());
        self.active_profile = Some(name.to_string());
        Ok(())
    }

    /// Ask the server to switch the card to `name`.
    ///
    /// A still-pending switch is canceled first, so at most one profile
    /// change is ever outstanding.
    pub fn change_profile(
        &mut self,
        server: &mut dyn SoundServer,
        name: &str,
    ) -> Result<(), CardError> {
        if self.active_profile.as_deref() == Some(name) {
            return Ok(());
        }
        if self.target_profile.as_deref() == Some(name) {
            return Ok(());
        }

        self.profile_op.cancel(server);
        self.target_profile = None;

        if self.active_profile.is_none() {
            return self.set_profile(name);
        }

        let request = Request::SetCardProfile {
            index: self.index,
            profile: name.to_string(),
        };
        match server.request(request) {
            Some(id) => {
                debug!(
                    "Card {}: requested profile '{}' (operation {})",
                    self.name, name, id
                );
                self.target_profile = Some(name.to_string());
                self.profile_op.replace(server, id);
                Ok(())
            }
            None => {
                warn!("Failed to request profile '{}' on card {}", name, self.name);
                Err(CardError::RequestFailed {
                    card: self.name.clone(),
                    profile: name.to_string(),
                })
            }
        }
    }

    /// Handle the completion of an operation. Returns false if it was not
    /// this card's profile change.
    pub(crate) fn profile_change_finished(&mut self, id: OperationId, success: bool) -> bool {
        if !self.profile_op.complete(id) {
            return false;
        }
        let target = self.target_profile.take();
        match target {
            Some(target) if success => {
                info!("Card {} switched to profile '{}'", self.name, target);
                if let Err(e) = self.set_profile(&target) {
                    warn!("Card {}: {}", self.name, e);
                }
            }
            Some(target) => {
                warn!(
                    "Failed to switch profile on '{}' from '{}' to '{}'",
                    self.name,
                    self.active_profile.as_deref().unwrap_or("(none)"),
                    target
                );
            }
            None => {}
        }
        true
    }

    /// Drop any in-flight request after the connection context went away.
    pub(crate) fn forget_pending(&mut self) {
        self.profile_op.forget();
        self.target_profile = None;
    }

    /// Apply a later report's port availability, returning the ports whose
    /// usability flipped.
    pub(crate) fn update_port_availability(&mut self, info: &CardInfo) -> Vec<PortAvailabilityChange> {
        let mut changes = Vec::new();
        for port in &mut self.ports {
            let Some(reported) = info.ports.iter().find(|p| p.name == port.name) else {
                continue;
            };
            if port.available.is_available() != reported.available.is_available() {
                debug!(
                    "Card {} port '{}' availability {:?} -> {:?}",
                    self.name, port.name, port.available, reported.available
                );
                changes.push(PortAvailabilityChange {
                    port: port.name.clone(),
                    direction: port.direction,
                    available: reported.available.is_available(),
                });
            }
            port.available = reported.available;
        }
        changes
    }
}
