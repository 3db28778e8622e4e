// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-endpoint channel layout and volume state.
//!
//! Volumes use the sound server's integer scale: `VOLUME_MUTED` is silence,
//! `VOLUME_NORM` is 100% and the perceived loudness follows a cubic curve.

use tracing::{trace, warn};

/// Silence.
pub const VOLUME_MUTED: u32 = 0;

/// 100% (0 dB).
pub const VOLUME_NORM: u32 = 0x10000;

/// Largest volume the server accepts.
pub const VOLUME_MAX: u32 = u32::MAX / 2;

/// Headroom offered for amplified volume sliders, in dB.
const AMPLIFIED_DB: f64 = 11.0;

/// Position of a single channel in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearLeft,
    RearRight,
    RearCenter,
    Lfe,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontRight,
    TopFrontCenter,
    TopRearLeft,
    TopRearRight,
    TopRearCenter,
    Aux(u8),
    Other,
}

impl ChannelPosition {
    pub fn is_left(self) -> bool {
        matches!(
            self,
            Self::FrontLeft
                | Self::RearLeft
                | Self::FrontLeftOfCenter
                | Self::SideLeft
                | Self::TopFrontLeft
                | Self::TopRearLeft
        )
    }

    pub fn is_right(self) -> bool {
        matches!(
            self,
            Self::FrontRight
                | Self::RearRight
                | Self::FrontRightOfCenter
                | Self::SideRight
                | Self::TopFrontRight
                | Self::TopRearRight
        )
    }

    pub fn is_front(self) -> bool {
        matches!(
            self,
            Self::FrontLeft
                | Self::FrontRight
                | Self::FrontCenter
                | Self::TopFrontLeft
                | Self::TopFrontRight
                | Self::TopFrontCenter
                | Self::FrontLeftOfCenter
                | Self::FrontRightOfCenter
        )
    }

    pub fn is_rear(self) -> bool {
        matches!(
            self,
            Self::RearLeft
                | Self::RearRight
                | Self::RearCenter
                | Self::TopRearLeft
                | Self::TopRearRight
                | Self::TopRearCenter
        )
    }

    pub fn is_lfe(self) -> bool {
        self == Self::Lfe
    }
}

/// Notification produced when the stored volume vector actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeChange {
    /// True when the change came from a local user action and must be pushed
    /// to the server; false for echoes of server state.
    pub user_initiated: bool,
}

/// Channel layout plus the per-channel volume vector of one endpoint.
#[derive(Debug, Clone)]
pub struct ChannelVolume {
    positions: Vec<ChannelPosition>,
    volumes: Vec<u32>,
    /// Whether the first assignment has happened yet.
    is_set: bool,
}

impl ChannelVolume {
    /// Create a layout with every channel at normal volume.
    pub fn new(positions: Vec<ChannelPosition>) -> Self {
        let volumes = vec![VOLUME_NORM; positions.len()];
        Self {
            positions,
            volumes,
            is_set: false,
        }
    }

    /// Single mono channel, used by the synthetic event-role stream.
    pub fn mono() -> Self {
        Self::new(vec![ChannelPosition::Mono])
    }

    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    pub fn volumes(&self) -> &[u32] {
        &self.volumes
    }

    /// Replace the layout if the server now reports a different one.
    ///
    /// Returns true when the layout changed. Volumes are reset to normal for
    /// the new channel count, the "first assignment" state is kept.
    pub fn set_positions(&mut self, positions: &[ChannelPosition]) -> bool {
        if self.positions == positions {
            return false;
        }
        trace!(
            "Channel layout changed from {} to {} channels",
            self.positions.len(),
            positions.len()
        );
        self.positions = positions.to_vec();
        self.volumes = vec![VOLUME_NORM; positions.len()];
        true
    }

    /// Store a new volume vector.
    ///
    /// Returns `Some` only when the vector differs from the stored one and this
    /// is not the very first assignment.
    pub fn volume_changed(&mut self, volumes: &[u32], user_initiated: bool) -> Option<VolumeChange> {
        if volumes.len() != self.positions.len() {
            warn!(
                "Ignoring volume with {} channels for a {}-channel layout",
                volumes.len(),
                self.positions.len()
            );
            return None;
        }
        if self.is_set && self.volumes == volumes {
            return None;
        }

        self.volumes = volumes.to_vec();

        if !self.is_set {
            self.is_set = true;
            return None;
        }

        Some(VolumeChange { user_initiated })
    }

    /// Loudest channel.
    pub fn max_volume(&self) -> u32 {
        self.volumes.iter().copied().max().unwrap_or(VOLUME_MUTED)
    }

    pub fn can_balance(&self) -> bool {
        self.positions.iter().any(|p| p.is_left()) && self.positions.iter().any(|p| p.is_right())
    }

    pub fn can_fade(&self) -> bool {
        self.positions.iter().any(|p| p.is_front()) && self.positions.iter().any(|p| p.is_rear())
    }

    pub fn has_lfe(&self) -> bool {
        self.positions.iter().any(|p| p.is_lfe())
    }

    /// Left/right balance in `-1.0..=1.0`; 0 when the layout cannot balance.
    pub fn balance(&self) -> f64 {
        if !self.can_balance() {
            return 0.0;
        }
        let (left, right) = self.side_averages(ChannelPosition::is_left, ChannelPosition::is_right);
        skew(left, right)
    }

    /// Rear/front fade in `-1.0..=1.0`; 0 when the layout cannot fade.
    pub fn fade(&self) -> f64 {
        if !self.can_fade() {
            return 0.0;
        }
        let (rear, front) = self.side_averages(ChannelPosition::is_rear, ChannelPosition::is_front);
        skew(rear, front)
    }

    /// Volume of the LFE channel(s); 0 when there is none.
    pub fn lfe(&self) -> u32 {
        self.positions
            .iter()
            .zip(&self.volumes)
            .filter(|(p, _)| p.is_lfe())
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(VOLUME_MUTED)
    }

    /// Volume vector rescaled so that its loudest channel equals `max`.
    pub fn scaled(&self, max: u32) -> Vec<u32> {
        let max = max.min(VOLUME_MAX);
        let current = self.max_volume();
        if current == VOLUME_MUTED {
            return vec![max; self.volumes.len()];
        }
        self.volumes
            .iter()
            .map(|v| clamp_volume(*v as u64 * max as u64 / current as u64))
            .collect()
    }

    /// Volume vector with the given left/right balance applied.
    pub fn with_balance(&self, balance: f64) -> Vec<u32> {
        if !self.can_balance() {
            return self.volumes.clone();
        }
        self.with_skew(balance, ChannelPosition::is_left, ChannelPosition::is_right)
    }

    /// Volume vector with the given rear/front fade applied.
    pub fn with_fade(&self, fade: f64) -> Vec<u32> {
        if !self.can_fade() {
            return self.volumes.clone();
        }
        self.with_skew(fade, ChannelPosition::is_rear, ChannelPosition::is_front)
    }

    /// Volume vector with every LFE channel set to `volume`.
    pub fn with_lfe(&self, volume: u32) -> Vec<u32> {
        let volume = volume.min(VOLUME_MAX);
        self.positions
            .iter()
            .zip(&self.volumes)
            .map(|(p, v)| if p.is_lfe() { volume } else { *v })
            .collect()
    }

    fn side_averages(
        &self,
        low: fn(ChannelPosition) -> bool,
        high: fn(ChannelPosition) -> bool,
    ) -> (u32, u32) {
        let average = |side: fn(ChannelPosition) -> bool| -> u32 {
            let (sum, n) = self
                .positions
                .iter()
                .zip(&self.volumes)
                .filter(|(p, _)| side(**p))
                .fold((0u64, 0u64), |(sum, n), (_, v)| (sum + *v as u64, n + 1));
            if n == 0 {
                VOLUME_NORM
            } else {
                (sum / n) as u32
            }
        };
        (average(low), average(high))
    }

    /// Shared balance/fade algorithm. Negative values favour the `low` side.
    fn with_skew(
        &self,
        value: f64,
        low: fn(ChannelPosition) -> bool,
        high: fn(ChannelPosition) -> bool,
    ) -> Vec<u32> {
        let value = value.clamp(-1.0, 1.0);
        let (low_avg, high_avg) = self.side_averages(low, high);
        let m = low_avg.max(high_avg) as f64;

        let (n_low, n_high) = if value <= 0.0 {
            (m, (value + 1.0) * m)
        } else {
            ((1.0 - value) * m, m)
        };
        let (n_low, n_high) = (n_low as u64, n_high as u64);

        self.positions
            .iter()
            .zip(&self.volumes)
            .map(|(p, v)| {
                if low(*p) {
                    rescale(*v, low_avg, n_low)
                } else if high(*p) {
                    rescale(*v, high_avg, n_high)
                } else {
                    *v
                }
            })
            .collect()
    }
}

fn rescale(value: u32, from: u32, to: u64) -> u32 {
    if from == 0 {
        clamp_volume(to)
    } else {
        clamp_volume(value as u64 * to / from as u64)
    }
}

fn skew(low: u32, high: u32) -> f64 {
    if low == high {
        0.0
    } else if low > high {
        -1.0 + high as f64 / low as f64
    } else {
        1.0 - low as f64 / high as f64
    }
}

fn clamp_volume(v: u64) -> u32 {
    v.min(VOLUME_MAX as u64) as u32
}

/// Convert a server volume to decibels (cubic mapping).
pub fn volume_to_db(volume: u32) -> f64 {
    if volume == VOLUME_MUTED {
        return f64::NEG_INFINITY;
    }
    60.0 * (volume as f64 / VOLUME_NORM as f64).log10()
}

/// Convert decibels to a server volume (cubic mapping).
pub fn volume_from_db(db: f64) -> u32 {
    if db == f64::NEG_INFINITY {
        return VOLUME_MUTED;
    }
    let linear = 10.0_f64.powf(db / 20.0);
    clamp_volume((linear.cbrt() * VOLUME_NORM as f64).round() as u64)
}

/// Volume that corresponds to 100%.
pub fn vol_max_norm() -> u32 {
    VOLUME_NORM
}

/// Upper bound for sliders that allow amplification.
pub fn vol_max_amplified() -> u32 {
    volume_from_db(AMPLIFIED_DB)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelPosition::*;

    fn stereo(left: u32, right: u32) -> ChannelVolume {
        let mut cv = ChannelVolume::new(vec![FrontLeft, FrontRight]);
        cv.volume_changed(&[left, right], false);
        cv
    }

    #[test]
    fn test_first_assignment_is_silent() {
        let mut cv = ChannelVolume::new(vec![FrontLeft, FrontRight]);
        assert_eq!(cv.volume_changed(&[100, 200], true), None);
        assert_eq!(cv.volumes(), &[100, 200]);

        assert_eq!(
            cv.volume_changed(&[300, 300], true),
            Some(VolumeChange { user_initiated: true })
        );
        assert_eq!(
            cv.volume_changed(&[300, 400], false),
            Some(VolumeChange { user_initiated: false })
        );
    }

    #[test]
    fn test_unchanged_vector_does_not_notify() {
        let mut cv = stereo(VOLUME_NORM, VOLUME_NORM);
        assert_eq!(cv.volume_changed(&[VOLUME_NORM, VOLUME_NORM], true), None);
    }

    #[test]
    fn test_mismatched_length_is_rejected() {
        let mut cv = stereo(10, 10);
        assert_eq!(cv.volume_changed(&[1, 2, 3], false), None);
        assert_eq!(cv.volumes(), &[10, 10]);
    }

    #[test]
    fn test_capabilities() {
        let cv = ChannelVolume::new(vec![FrontLeft, FrontRight, RearLeft, RearRight, Lfe]);
        assert!(cv.can_balance());
        assert!(cv.can_fade());
        assert!(cv.has_lfe());

        let mono = ChannelVolume::mono();
        assert!(!mono.can_balance());
        assert!(!mono.can_fade());
        assert!(!mono.has_lfe());
        assert_eq!(mono.balance(), 0.0);
    }

    #[test]
    fn test_balance_direction() {
        assert_eq!(stereo(VOLUME_NORM, VOLUME_NORM).balance(), 0.0);
        assert!((stereo(VOLUME_NORM, VOLUME_NORM / 2).balance() + 0.5).abs() < 1e-9);
        assert!((stereo(VOLUME_NORM / 2, VOLUME_NORM).balance() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_with_balance_keeps_loudest_side() {
        let cv = stereo(VOLUME_NORM, VOLUME_NORM);
        let full_left = cv.with_balance(-1.0);
        assert_eq!(full_left, vec![VOLUME_NORM, 0]);

        let half_right = cv.with_balance(0.5);
        assert_eq!(half_right, vec![VOLUME_NORM / 2, VOLUME_NORM]);
    }

    #[test]
    fn test_fade_and_lfe() {
        let mut cv = ChannelVolume::new(vec![FrontLeft, FrontRight, RearLeft, RearRight, Lfe]);
        cv.volume_changed(&[VOLUME_NORM, VOLUME_NORM, VOLUME_NORM / 2, VOLUME_NORM / 2, 1234], false);
        assert!((cv.fade() - 0.5).abs() < 1e-9);
        assert_eq!(cv.lfe(), 1234);

        let with_lfe = cv.with_lfe(VOLUME_NORM);
        assert_eq!(with_lfe[4], VOLUME_NORM);
        assert_eq!(&with_lfe[..4], &cv.volumes()[..4]);
    }

    #[test]
    fn test_scaled_preserves_ratio() {
        let cv = stereo(VOLUME_NORM, VOLUME_NORM / 2);
        assert_eq!(cv.scaled(VOLUME_NORM / 2), vec![VOLUME_NORM / 2, VOLUME_NORM / 4]);

        let silent = stereo(0, 0);
        assert_eq!(silent.scaled(VOLUME_NORM), vec![VOLUME_NORM, VOLUME_NORM]);
    }

    #[test]
    fn test_db_mapping() {
        assert_eq!(volume_to_db(VOLUME_NORM), 0.0);
        assert_eq!(volume_from_db(0.0), VOLUME_NORM);
        assert_eq!(volume_from_db(f64::NEG_INFINITY), VOLUME_MUTED);
        assert!(vol_max_amplified() > vol_max_norm());
        let round_trip = volume_from_db(volume_to_db(40000));
        assert!((round_trip as i64 - 40000).abs() <= 1);
    }

    #[test]
    fn test_layout_change_resets_volumes() {
        let mut cv = stereo(5, 5);
        assert!(!cv.set_positions(&[FrontLeft, FrontRight]));
        assert!(cv.set_positions(&[Mono]));
        assert_eq!(cv.volumes(), &[VOLUME_NORM]);
    }
}
