// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Card profile matching.
//!
//! A card profile name may describe both directions at once, e.g.
//! `output:hdmi-stereo+input:analog-stereo`. Devices only care about their
//! own direction, so profiles are compared by their *canonical name*: the
//! name with every component of the other direction removed.

use crate::card::CardProfile;
use crate::ui_device::Direction;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

/// Name used when a profile has nothing left for a direction.
pub const PROFILE_OFF: &str = "off";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("No suitable profile candidates for '{0}'")]
    NoCandidates(String),
}

/// Strip every `+`-separated component starting with `skip_prefix`.
pub fn canonical_name(profile_name: &str, skip_prefix: &str) -> String {
    if !profile_name.contains(skip_prefix) {
        return profile_name.to_string();
    }

    let kept: Vec<&str> = profile_name
        .split('+')
        .filter(|part| !part.starts_with(skip_prefix))
        .collect();

    if kept.is_empty() {
        PROFILE_OFF.to_string()
    } else {
        kept.join("+")
    }
}

/// Deduplicate `profiles` by their canonical name as seen from `direction`.
///
/// Profiles that already are their own canonical name win; profiles without
/// such a clean representative are added in a second pass. The returned flag
/// is true when there is nothing meaningful to switch between.
pub fn reduce_profiles(direction: Direction, profiles: &[CardProfile]) -> (Vec<CardProfile>, bool) {
    let skip_prefix = direction.opposite_prefix();
    let mut added: HashSet<String> = HashSet::new();
    let mut reduced = Vec::new();

    for clean_only in [true, false] {
        for profile in profiles {
            let canonical = canonical_name(&profile.name, skip_prefix);
            if clean_only && canonical != profile.name {
                continue;
            }
            if added.contains(&canonical) {
                continue;
            }
            added.insert(canonical);
            reduced.push(profile.clone());
        }
    }

    let hide_switcher = added.len() <= 1;
    (reduced, hide_switcher)
}

/// Pick the profile a device of `direction` should switch to.
///
/// `selected` is the profile the user picked (any member of its canonical
/// class is acceptable), `current` is the card's active profile.
pub fn best_profile<'a>(
    direction: Direction,
    supported: &'a [CardProfile],
    selected: Option<&str>,
    current: &'a str,
) -> Result<&'a str, ProfileError> {
    let skip_prefix = direction.opposite_prefix();
    let selected_canonical = selected.map(|s| canonical_name(s, skip_prefix));

    let candidates: Vec<&CardProfile> = supported
        .iter()
        .filter(|p| match &selected_canonical {
            Some(wanted) => canonical_name(&p.name, skip_prefix) == *wanted,
            None => true,
        })
        .collect();

    if candidates.is_empty() {
        return Err(ProfileError::NoCandidates(
            selected.unwrap_or("(none)").to_string(),
        ));
    }

    // Already on an acceptable profile, no switch needed.
    if candidates.iter().any(|p| p.name == current) {
        return Ok(current);
    }

    // Keep the other direction's routing as it is if possible.
    let own_prefix = direction.own_prefix();
    let current_other_side = canonical_name(current, own_prefix);
    let mut best: Option<&CardProfile> = None;
    for &p in &candidates {
        let other_side = canonical_name(&p.name, own_prefix);
        debug!(
            "Comparing '{}' (other side '{}') against current other side '{}'",
            p.name, other_side, current_other_side
        );
        if other_side == current_other_side && best.map_or(true, |b| b.priority < p.priority) {
            best = Some(p);
        }
    }

    if best.is_none() {
        for &p in &candidates {
            if best.map_or(true, |b| b.priority < p.priority) {
                best = Some(p);
            }
        }
    }

    match best {
        Some(p) => Ok(p.name.as_str()),
        None => {
            warn!("Profile candidates vanished while matching, keeping '{}'", current);
            Ok(current)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, priority: u32) -> CardProfile {
        CardProfile {
            name: name.to_string(),
            human_name: name.to_string(),
            status: String::new(),
            priority,
            n_sinks: 1,
            n_sources: 1,
        }
    }

    #[test]
    fn test_canonical_name_strips_other_direction() {
        assert_eq!(
            canonical_name("output:hdmi-stereo+input:analog-stereo", "input:"),
            "output:hdmi-stereo"
        );
        assert_eq!(
            canonical_name("output:hdmi-stereo+input:analog-stereo", "output:"),
            "input:analog-stereo"
        );
        assert_eq!(canonical_name("input:analog-stereo", "input:"), "off");
        assert_eq!(canonical_name("a2dp_sink", "input:"), "a2dp_sink");
    }

    #[test]
    fn test_canonical_name_is_idempotent() {
        for name in [
            "output:hdmi-stereo+input:analog-stereo",
            "input:analog-stereo",
            "off",
            "output:a+output:b+input:c",
            "headset_head_unit",
        ] {
            for prefix in ["input:", "output:"] {
                let once = canonical_name(name, prefix);
                assert_eq!(canonical_name(&once, prefix), once);
            }
        }
    }

    #[test]
    fn test_reduce_profiles_prefers_clean_representative() {
        let profiles = vec![
            profile("output:analog-stereo+input:analog-stereo", 6565),
            profile("output:analog-stereo", 6500),
            profile("output:hdmi-stereo+input:analog-stereo", 5965),
            profile("off", 0),
        ];
        let (reduced, hide) = reduce_profiles(Direction::Output, &profiles);
        let names: Vec<&str> = reduced.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "output:analog-stereo",
                "off",
                "output:hdmi-stereo+input:analog-stereo"
            ]
        );
        assert!(!hide);
    }

    #[test]
    fn test_reduce_profiles_is_deduplicated_subset() {
        let profiles = vec![
            profile("output:a+input:x", 1),
            profile("output:a+input:y", 2),
            profile("output:b+input:x", 3),
            profile("input:x", 4),
        ];
        for direction in [Direction::Output, Direction::Input] {
            let (reduced, hide) = reduce_profiles(direction, &profiles);
            let classes: HashSet<String> = reduced
                .iter()
                .map(|p| canonical_name(&p.name, direction.opposite_prefix()))
                .collect();
            assert_eq!(classes.len(), reduced.len());
            assert!(reduced.iter().all(|p| profiles.contains(p)));
            assert_eq!(hide, reduced.len() <= 1);
        }
    }

    #[test]
    fn test_single_class_hides_switcher() {
        let profiles = vec![profile("output:analog-stereo", 1)];
        let (reduced, hide) = reduce_profiles(Direction::Output, &profiles);
        assert_eq!(reduced.len(), 1);
        assert!(hide);

        let (reduced, hide) = reduce_profiles(Direction::Output, &[]);
        assert!(reduced.is_empty());
        assert!(hide);
    }

    #[test]
    fn test_best_profile_keeps_current() {
        let profiles = vec![
            profile("output:analog-stereo", 1),
            profile("output:hdmi-stereo", 2),
        ];
        for current in ["output:analog-stereo", "output:hdmi-stereo"] {
            assert_eq!(
                best_profile(Direction::Output, &profiles, None, current),
                Ok(current)
            );
        }
    }

    #[test]
    fn test_best_profile_keeps_other_side_stable() {
        let profiles = vec![
            profile("output:analog-stereo+input:analog-stereo", 10),
            profile("output:hdmi-stereo+input:analog-stereo", 5),
            profile("output:hdmi-stereo", 50),
        ];
        let best = best_profile(
            Direction::Output,
            &profiles,
            Some("output:hdmi-stereo"),
            "output:analog-stereo+input:analog-stereo",
        );
        assert_eq!(best, Ok("output:hdmi-stereo+input:analog-stereo"));
    }

    #[test]
    fn test_best_profile_falls_back_to_priority() {
        let profiles = vec![
            profile("output:hdmi-stereo+input:analog-mono", 5),
            profile("output:hdmi-stereo", 50),
        ];
        let best = best_profile(
            Direction::Output,
            &profiles,
            Some("output:hdmi-stereo"),
            "output:analog-stereo+input:analog-stereo",
        );
        assert_eq!(best, Ok("output:hdmi-stereo"));
    }

    #[test]
    fn test_best_profile_without_candidates() {
        let profiles = vec![profile("output:analog-stereo", 1)];
        let best = best_profile(
            Direction::Output,
            &profiles,
            Some("output:spdif"),
            "output:analog-stereo",
        );
        assert_eq!(best, Err(ProfileError::NoCandidates("output:spdif".into())));
    }
}
