// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core daemon service: drives the mixer control and answers queries.

use crate::config::DaemonConfig;
use crate::pulse::{self, PulseEvents, PulseSettings};
use mixctl::channel_volume::{vol_max_amplified, VOLUME_NORM};
use mixctl::{
    Card, CardProfile, DeviceId, Direction, MixerControl, MixerError, MixerEvent, MixerState,
    Stream, StreamId, StreamKind, UIDevice,
};
use mixctl_ipc::{wire_id, CardInfo, DaemonError, DeviceInfo, ProfileInfo, StreamInfo, INVALID_ID};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Mixer error: {0}")]
    Mixer(#[from] MixerError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ServiceError> for DaemonError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Mixer(MixerError::UnknownStream(id)) => DaemonError::StreamNotFound(id.0),
            ServiceError::Mixer(MixerError::UnknownDevice(id)) => DaemonError::DeviceNotFound(id.0),
            ServiceError::Mixer(MixerError::UnknownCard(id)) => DaemonError::CardNotFound(id.0),
            ServiceError::Mixer(other) => DaemonError::SoundServer(other.to_string()),
            ServiceError::InvalidArgument(msg) => DaemonError::InvalidArgument(msg),
        }
    }
}

/// Convert a percentage of normal volume to a raw volume.
pub fn volume_from_percent(percent: f64) -> u32 {
    let raw = (percent / 100.0 * f64::from(VOLUME_NORM)).round();
    raw.clamp(0.0, f64::from(vol_max_amplified())) as u32
}

pub fn volume_to_percent(volume: u32) -> f64 {
    f64::from(volume) * 100.0 / f64::from(VOLUME_NORM)
}

pub struct MixerService {
    control: MixerControl,
    events: PulseEvents,
}

impl MixerService {
    pub fn new(config: &DaemonConfig) -> Self {
        let (server, events) = pulse::channel(PulseSettings {
            server: config.server.clone(),
            client_name: config.client_name.clone(),
        });
        Self {
            control: MixerControl::new(Box::new(server), config.control_options()),
            events,
        }
    }

    /// Set the channel that receives mixer events for D-Bus signals.
    pub fn set_event_sender(&mut self, tx: UnboundedSender<MixerEvent>) {
        self.control.set_event_sender(tx);
    }

    /// Start connecting. A failed first attempt is retried by [`Self::process_events`].
    pub fn start(&mut self) -> Result<(), ServiceError> {
        info!("Connecting to sound server");
        self.control.open()?;
        Ok(())
    }

    /// Feed pending backend events to the control and drive reconnects.
    pub fn process_events(&mut self) {
        for event in self.events.drain() {
            self.control.handle_event(event);
        }
        self.control.tick(Instant::now());
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down mixer service");
        self.control.close();
    }

    // ==================== Queries ====================

    pub fn state(&self) -> MixerState {
        self.control.state()
    }

    pub fn outputs(&self) -> Vec<DeviceInfo> {
        let active = self.active_device(Direction::Output);
        self.control
            .outputs()
            .map(|d| self.device_info(d, active))
            .collect()
    }

    pub fn inputs(&self) -> Vec<DeviceInfo> {
        let active = self.active_device(Direction::Input);
        self.control
            .inputs()
            .map(|d| self.device_info(d, active))
            .collect()
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        let defaults = [
            self.control.default_sink().map(Stream::id),
            self.control.default_source().map(Stream::id),
        ];
        self.control
            .streams()
            .map(|s| stream_info(s, defaults.contains(&Some(s.id()))))
            .collect()
    }

    pub fn cards(&self) -> Vec<CardInfo> {
        self.control.cards().map(card_info).collect()
    }

    fn active_device(&self, direction: Direction) -> Option<DeviceId> {
        let default = match direction {
            Direction::Output => self.control.default_sink(),
            Direction::Input => self.control.default_source(),
        }?;
        self.control
            .lookup_device_from_stream(default.id())
            .map(UIDevice::id)
    }

    fn device_info(&self, device: &UIDevice, active: Option<DeviceId>) -> DeviceInfo {
        DeviceInfo {
            id: device.id().0,
            description: device.description().to_string(),
            origin: device.origin().unwrap_or_default().to_string(),
            icon_name: device.icon_name().unwrap_or_default().to_string(),
            port_name: device.port_name().unwrap_or_default().to_string(),
            card_id: wire_id(device.card().map(|c| c.0)),
            stream_id: wire_id(device.stream_id().map(|s| s.0)),
            available: device.port_available(),
            active: active == Some(device.id()),
            profiles: device.profiles().iter().map(profile_info).collect(),
            active_profile: self
                .control
                .device_active_profile(device)
                .unwrap_or_default()
                .to_string(),
            hide_profiles: device.should_profiles_be_hidden(),
        }
    }

    // ==================== Operations ====================

    pub fn change_output(&mut self, device_id: u32) -> Result<(), ServiceError> {
        debug!("Changing output to device {}", device_id);
        self.control.change_output(DeviceId(device_id))?;
        Ok(())
    }

    pub fn change_input(&mut self, device_id: u32) -> Result<(), ServiceError> {
        debug!("Changing input to device {}", device_id);
        self.control.change_input(DeviceId(device_id))?;
        Ok(())
    }

    /// Switch the device's card to `profile`, or to its best profile if empty.
    pub fn change_profile(&mut self, device_id: u32, profile: &str) -> Result<(), ServiceError> {
        let profile = (!profile.is_empty()).then_some(profile);
        self.control
            .change_profile_on_selected_device(DeviceId(device_id), profile)?;
        Ok(())
    }

    pub fn set_stream_volume(&mut self, stream_id: u32, percent: f64) -> Result<(), ServiceError> {
        if !percent.is_finite() || percent < 0.0 {
            return Err(ServiceError::InvalidArgument(format!(
                "Volume must be a non-negative percentage (got {})",
                percent
            )));
        }
        let volume = volume_from_percent(percent);
        self.control.set_stream_volume(StreamId(stream_id), volume)?;
        Ok(())
    }

    pub fn set_stream_muted(&mut self, stream_id: u32, muted: bool) -> Result<(), ServiceError> {
        self.control.change_stream_muted(StreamId(stream_id), muted)?;
        Ok(())
    }

    pub fn set_stream_balance(&mut self, stream_id: u32, balance: f64) -> Result<(), ServiceError> {
        if !balance.is_finite() {
            return Err(ServiceError::InvalidArgument(
                "Balance must be a finite number".into(),
            ));
        }
        let clamped = balance.clamp(-1.0, 1.0);
        if clamped != balance {
            warn!("Balance {} clamped to {}", balance, clamped);
        }
        self.control.set_stream_balance(StreamId(stream_id), clamped)?;
        Ok(())
    }
}

fn profile_info(profile: &CardProfile) -> ProfileInfo {
    ProfileInfo {
        name: profile.name.clone(),
        human_name: profile.human_name.clone(),
        status: profile.status.clone(),
        priority: profile.priority,
    }
}

fn stream_kind(kind: &StreamKind) -> &'static str {
    match kind {
        StreamKind::Sink => "sink",
        StreamKind::Source => "source",
        StreamKind::SinkInput { .. } => "sink-input",
        StreamKind::SourceOutput { .. } => "source-output",
        StreamKind::EventRole { .. } => "event-role",
    }
}

fn stream_info(stream: &Stream, is_default: bool) -> StreamInfo {
    let channels = stream.channels();
    StreamInfo {
        id: stream.id().0,
        index: match stream.kind() {
            StreamKind::EventRole { .. } => INVALID_ID,
            _ => stream.index(),
        },
        kind: stream_kind(stream.kind()).to_string(),
        name: stream.name().to_string(),
        description: stream.description().to_string(),
        icon_name: stream.icon_name().unwrap_or_default().to_string(),
        application_id: stream.application_id().unwrap_or_default().to_string(),
        volume_percent: volume_to_percent(stream.volume()),
        balance: channels.balance(),
        can_balance: channels.can_balance(),
        muted: stream.is_muted(),
        port: stream.port().unwrap_or_default().to_string(),
        is_default,
    }
}

fn card_info(card: &Card) -> CardInfo {
    CardInfo {
        id: card.id().0,
        index: card.index(),
        name: card.name().to_string(),
        description: card.description().to_string(),
        active_profile: card.active_profile().unwrap_or_default().to_string(),
        target_profile: card.target_profile().unwrap_or_default().to_string(),
        profiles: card.profiles().iter().map(profile_info).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MixerService {
        MixerService::new(&DaemonConfig::default())
    }

    #[test]
    fn test_volume_percent_conversion() {
        assert_eq!(volume_from_percent(100.0), VOLUME_NORM);
        assert_eq!(volume_from_percent(50.0), VOLUME_NORM / 2);
        assert_eq!(volume_from_percent(1000.0), vol_max_amplified());
        assert_eq!(volume_to_percent(VOLUME_NORM), 100.0);
    }

    #[test]
    fn test_closed_service_is_empty() {
        let service = service();
        assert_eq!(service.state(), MixerState::Closed);
        assert!(service.outputs().is_empty());
        assert!(service.inputs().is_empty());
        assert!(service.streams().is_empty());
        assert!(service.cards().is_empty());
    }

    #[test]
    fn test_unknown_ids_map_to_not_found() {
        let err: DaemonError = ServiceError::Mixer(MixerError::UnknownDevice(DeviceId(9))).into();
        assert!(matches!(err, DaemonError::DeviceNotFound(9)));
        let err: DaemonError = ServiceError::Mixer(MixerError::UnknownStream(StreamId(4))).into();
        assert!(matches!(err, DaemonError::StreamNotFound(4)));
    }

    #[test]
    fn test_operations_fail_while_disconnected() {
        let mut service = service();
        let err: DaemonError = service.change_output(9).unwrap_err().into();
        assert!(matches!(err, DaemonError::SoundServer(_)));
        let err: DaemonError = service.set_stream_muted(4, true).unwrap_err().into();
        assert!(matches!(err, DaemonError::SoundServer(_)));
    }

    #[test]
    fn test_invalid_volume_is_rejected() {
        let mut service = service();
        let err = service.set_stream_volume(1, f64::NAN).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        let err = service.set_stream_balance(1, f64::INFINITY).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }
}
