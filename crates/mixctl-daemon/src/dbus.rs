// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus interface implementation for the daemon.

use crate::service::{MixerService, ServiceError};
use mixctl::{MixerEvent, StreamId};
use mixctl_ipc::{wire_id, CardInfo, DaemonError, DeviceInfo, StreamInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use zbus::interface;

/// Input validation helpers for D-Bus method arguments.
mod validate {
    /// Validate a profile name: may be empty (best profile), max 256 chars,
    /// no control characters.
    pub fn validate_profile_name(name: &str) -> Result<(), zbus::fdo::Error> {
        if name.len() > 256 {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "Profile name exceeds 256 character limit (got {})",
                name.len()
            )));
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(zbus::fdo::Error::InvalidArgs(
                "Profile name must not contain control characters".into(),
            ));
        }
        Ok(())
    }

    /// Validate a volume in percent: reject NaN/Infinity and negative values.
    pub fn validate_volume_percent(percent: f64) -> Result<f64, zbus::fdo::Error> {
        if !percent.is_finite() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "Volume must be a finite number".into(),
            ));
        }
        if percent < 0.0 {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "Volume must not be negative (got {})",
                percent
            )));
        }
        Ok(percent)
    }

    /// Validate a balance: reject NaN/Infinity, clamp to -1.0..=1.0.
    pub fn validate_balance(balance: f64) -> Result<f64, zbus::fdo::Error> {
        if !balance.is_finite() {
            return Err(zbus::fdo::Error::InvalidArgs(
                "Balance must be a finite number".into(),
            ));
        }
        Ok(balance.clamp(-1.0, 1.0))
    }
}

fn failed(e: ServiceError) -> zbus::fdo::Error {
    DaemonError::from(e).into()
}

fn stream_wire_id(id: Option<StreamId>) -> u32 {
    wire_id(id.map(|s| s.0))
}

/// The D-Bus interface implementation.
pub struct DaemonDbusService {
    service: Arc<Mutex<MixerService>>,
}

impl DaemonDbusService {
    pub fn new(service: Arc<Mutex<MixerService>>) -> Self {
        Self { service }
    }
}

#[interface(name = "com.mixctl.Daemon")]
impl DaemonDbusService {
    // ==================== Queries ====================

    /// Connection state: "closed", "connecting", "ready" or "failed".
    async fn get_state(&self) -> String {
        self.service.lock().state().as_str().to_string()
    }

    async fn get_outputs(&self) -> Vec<DeviceInfo> {
        let mut service = self.service.lock();
        service.process_events();
        service.outputs()
    }

    async fn get_inputs(&self) -> Vec<DeviceInfo> {
        let mut service = self.service.lock();
        service.process_events();
        service.inputs()
    }

    async fn get_streams(&self) -> Vec<StreamInfo> {
        let mut service = self.service.lock();
        service.process_events();
        service.streams()
    }

    async fn get_cards(&self) -> Vec<CardInfo> {
        let mut service = self.service.lock();
        service.process_events();
        service.cards()
    }

    // ==================== Device selection ====================

    /// Make a device the active output.
    async fn change_output(&self, device_id: u32) -> zbus::fdo::Result<()> {
        debug!("D-Bus: change_output({})", device_id);
        let mut service = self.service.lock();
        service.process_events();
        service.change_output(device_id).map_err(failed)
    }

    /// Make a device the active input.
    async fn change_input(&self, device_id: u32) -> zbus::fdo::Result<()> {
        debug!("D-Bus: change_input({})", device_id);
        let mut service = self.service.lock();
        service.process_events();
        service.change_input(device_id).map_err(failed)
    }

    /// Switch the card behind a device. An empty profile picks the best one.
    async fn change_profile(&self, device_id: u32, profile: &str) -> zbus::fdo::Result<()> {
        validate::validate_profile_name(profile)?;
        debug!("D-Bus: change_profile({}, {})", device_id, profile);
        let mut service = self.service.lock();
        service.process_events();
        service.change_profile(device_id, profile).map_err(failed)
    }

    // ==================== Stream control ====================

    /// Set a stream's volume in percent of normal volume.
    async fn set_stream_volume(&self, stream_id: u32, percent: f64) -> zbus::fdo::Result<()> {
        let percent = validate::validate_volume_percent(percent)?;
        debug!("D-Bus: set_stream_volume({}, {})", stream_id, percent);
        let mut service = self.service.lock();
        service.process_events();
        service.set_stream_volume(stream_id, percent).map_err(failed)
    }

    async fn set_stream_muted(&self, stream_id: u32, muted: bool) -> zbus::fdo::Result<()> {
        debug!("D-Bus: set_stream_muted({}, {})", stream_id, muted);
        let mut service = self.service.lock();
        service.process_events();
        service.set_stream_muted(stream_id, muted).map_err(failed)
    }

    async fn set_stream_balance(&self, stream_id: u32, balance: f64) -> zbus::fdo::Result<()> {
        let balance = validate::validate_balance(balance)?;
        debug!("D-Bus: set_stream_balance({}, {})", stream_id, balance);
        let mut service = self.service.lock();
        service.process_events();
        service.set_stream_balance(stream_id, balance).map_err(failed)
    }

    // ==================== Signals ====================

    #[zbus(signal)]
    async fn state_changed(ctx: &zbus::SignalContext<'_>, state: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn stream_added(ctx: &zbus::SignalContext<'_>, stream_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn stream_removed(ctx: &zbus::SignalContext<'_>, stream_id: u32) -> zbus::Result<()>;

    /// Carries the sound-server card index.
    #[zbus(signal)]
    async fn card_added(ctx: &zbus::SignalContext<'_>, card_index: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn card_removed(ctx: &zbus::SignalContext<'_>, card_index: u32) -> zbus::Result<()>;

    /// Stream id of the new default sink, or the invalid id when unset.
    #[zbus(signal)]
    async fn default_sink_changed(ctx: &zbus::SignalContext<'_>, stream_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn default_source_changed(ctx: &zbus::SignalContext<'_>, stream_id: u32)
        -> zbus::Result<()>;

    #[zbus(signal)]
    async fn active_output_update(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn active_input_update(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn output_added(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn input_added(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn output_removed(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn input_removed(ctx: &zbus::SignalContext<'_>, device_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn stream_volume_changed(ctx: &zbus::SignalContext<'_>, stream_id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn stream_port_changed(ctx: &zbus::SignalContext<'_>, stream_id: u32) -> zbus::Result<()>;
}

/// Re-emit a mixer event as the matching D-Bus signal.
pub async fn emit_event(ctx: &zbus::SignalContext<'_>, event: &MixerEvent) -> zbus::Result<()> {
    type Iface = DaemonDbusService;
    match *event {
        MixerEvent::StateChanged(state) => Iface::state_changed(ctx, state.as_str()).await,
        MixerEvent::StreamAdded(id) => Iface::stream_added(ctx, id.0).await,
        MixerEvent::StreamRemoved(id) => Iface::stream_removed(ctx, id.0).await,
        MixerEvent::CardAdded(index) => Iface::card_added(ctx, index).await,
        MixerEvent::CardRemoved(index) => Iface::card_removed(ctx, index).await,
        MixerEvent::DefaultSinkChanged(id) => Iface::default_sink_changed(ctx, stream_wire_id(id)).await,
        MixerEvent::DefaultSourceChanged(id) => {
            Iface::default_source_changed(ctx, stream_wire_id(id)).await
        }
        MixerEvent::ActiveOutputUpdate(id) => Iface::active_output_update(ctx, id.0).await,
        MixerEvent::ActiveInputUpdate(id) => Iface::active_input_update(ctx, id.0).await,
        MixerEvent::OutputAdded(id) => Iface::output_added(ctx, id.0).await,
        MixerEvent::InputAdded(id) => Iface::input_added(ctx, id.0).await,
        MixerEvent::OutputRemoved(id) => Iface::output_removed(ctx, id.0).await,
        MixerEvent::InputRemoved(id) => Iface::input_removed(ctx, id.0).await,
        MixerEvent::StreamVolumeChanged(id) => Iface::stream_volume_changed(ctx, id.0).await,
        MixerEvent::StreamPortChanged(id) => Iface::stream_port_changed(ctx, id.0).await,
    }
}

#[cfg(test)]
mod tests {
    use super::validate::*;

    #[test]
    fn test_validate_volume_percent() {
        assert_eq!(validate_volume_percent(150.0).unwrap(), 150.0);
        assert!(validate_volume_percent(-1.0).is_err());
        assert!(validate_volume_percent(f64::NAN).is_err());
    }

    #[test]
    fn test_validate_balance_clamps() {
        assert_eq!(validate_balance(2.0).unwrap(), 1.0);
        assert_eq!(validate_balance(-0.5).unwrap(), -0.5);
        assert!(validate_balance(f64::INFINITY).is_err());
    }

    #[test]
    fn test_validate_profile_name() {
        assert!(validate_profile_name("").is_ok());
        assert!(validate_profile_name("output:hdmi-stereo").is_ok());
        assert!(validate_profile_name("bad\nname").is_err());
    }
}
