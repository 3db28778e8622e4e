// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Conversion between libpulse introspection data and the mixctl model.

use libpulse_binding::channelmap::{Map, Position};
use libpulse_binding::context::ext_stream_restore::Info as PaRestoreInfo;
use libpulse_binding::context::introspect::{
    CardInfo as PaCardInfo, CardPortInfo as PaCardPortInfo, CardProfileInfo as PaCardProfileInfo,
    ClientInfo as PaClientInfo, ServerInfo as PaServerInfo, SinkInfo, SinkInputInfo, SourceInfo,
    SourceOutputInfo,
};
use libpulse_binding::context::subscribe::{Facility as PaFacility, Operation as PaOperation};
use libpulse_binding::context::State as PaState;
use libpulse_binding::def::{PortAvailable, SinkFlagSet, SourceFlagSet};
use libpulse_binding::direction;
use libpulse_binding::proplist::properties;
use libpulse_binding::volume::{ChannelVolumes, Volume};
use mixctl::channel_volume::ChannelPosition;
use mixctl::server::{
    AppStreamInfo, CardInfo, CardPortInfo, CardProfileInfo, ClientInfo, ContextState, EndpointInfo,
    Facility, PortAvailability, PortDirection, PortInfo, RestoreEntry, ServerInfo,
    SubscriptionChange,
};
use std::borrow::Cow;

const AUX: [Position; 32] = [
    Position::Aux0, Position::Aux1, Position::Aux2, Position::Aux3,
    Position::Aux4, Position::Aux5, Position::Aux6, Position::Aux7,
    Position::Aux8, Position::Aux9, Position::Aux10, Position::Aux11,
    Position::Aux12, Position::Aux13, Position::Aux14, Position::Aux15,
    Position::Aux16, Position::Aux17, Position::Aux18, Position::Aux19,
    Position::Aux20, Position::Aux21, Position::Aux22, Position::Aux23,
    Position::Aux24, Position::Aux25, Position::Aux26, Position::Aux27,
    Position::Aux28, Position::Aux29, Position::Aux30, Position::Aux31,
];

fn text(s: &Option<Cow<'_, str>>) -> String {
    s.as_deref().unwrap_or_default().to_string()
}

// ==================== Channels and volumes ====================

pub fn position(p: Position) -> ChannelPosition {
    match p {
        Position::Mono => ChannelPosition::Mono,
        Position::FrontLeft => ChannelPosition::FrontLeft,
        Position::FrontRight => ChannelPosition::FrontRight,
        Position::FrontCenter => ChannelPosition::FrontCenter,
        Position::RearLeft => ChannelPosition::RearLeft,
        Position::RearRight => ChannelPosition::RearRight,
        Position::RearCenter => ChannelPosition::RearCenter,
        Position::Lfe => ChannelPosition::Lfe,
        Position::FrontLeftOfCenter => ChannelPosition::FrontLeftOfCenter,
        Position::FrontRightOfCenter => ChannelPosition::FrontRightOfCenter,
        Position::SideLeft => ChannelPosition::SideLeft,
        Position::SideRight => ChannelPosition::SideRight,
        Position::TopCenter => ChannelPosition::TopCenter,
        Position::TopFrontLeft => ChannelPosition::TopFrontLeft,
        Position::TopFrontRight => ChannelPosition::TopFrontRight,
        Position::TopFrontCenter => ChannelPosition::TopFrontCenter,
        Position::TopRearLeft => ChannelPosition::TopRearLeft,
        Position::TopRearRight => ChannelPosition::TopRearRight,
        Position::TopRearCenter => ChannelPosition::TopRearCenter,
        other => match AUX.iter().position(|aux| *aux == other) {
            Some(n) => ChannelPosition::Aux(n as u8),
            None => ChannelPosition::Other,
        },
    }
}

pub fn pa_position(p: ChannelPosition) -> Position {
    match p {
        ChannelPosition::Mono => Position::Mono,
        ChannelPosition::FrontLeft => Position::FrontLeft,
        ChannelPosition::FrontRight => Position::FrontRight,
        ChannelPosition::FrontCenter => Position::FrontCenter,
        ChannelPosition::RearLeft => Position::RearLeft,
        ChannelPosition::RearRight => Position::RearRight,
        ChannelPosition::RearCenter => Position::RearCenter,
        ChannelPosition::Lfe => Position::Lfe,
        ChannelPosition::FrontLeftOfCenter => Position::FrontLeftOfCenter,
        ChannelPosition::FrontRightOfCenter => Position::FrontRightOfCenter,
        ChannelPosition::SideLeft => Position::SideLeft,
        ChannelPosition::SideRight => Position::SideRight,
        ChannelPosition::TopCenter => Position::TopCenter,
        ChannelPosition::TopFrontLeft => Position::TopFrontLeft,
        ChannelPosition::TopFrontRight => Position::TopFrontRight,
        ChannelPosition::TopFrontCenter => Position::TopFrontCenter,
        ChannelPosition::TopRearLeft => Position::TopRearLeft,
        ChannelPosition::TopRearRight => Position::TopRearRight,
        ChannelPosition::TopRearCenter => Position::TopRearCenter,
        ChannelPosition::Aux(n) => AUX.get(n as usize).copied().unwrap_or(Position::Invalid),
        ChannelPosition::Other => Position::Invalid,
    }
}

pub fn positions(map: &Map) -> Vec<ChannelPosition> {
    map.get().iter().map(|p| position(*p)).collect()
}

pub fn channel_map(positions: &[ChannelPosition]) -> Map {
    let mut map = Map::default();
    map.set_len(positions.len() as u8);
    for (slot, p) in map.get_mut().iter_mut().zip(positions) {
        *slot = pa_position(*p);
    }
    map
}

pub fn volumes(cv: &ChannelVolumes) -> Vec<u32> {
    cv.get().iter().map(|v| v.0).collect()
}

pub fn channel_volumes(volume: &[u32]) -> ChannelVolumes {
    let mut cv = ChannelVolumes::default();
    cv.set(volume.len() as u8, Volume::MUTED);
    for (slot, v) in cv.get_mut().iter_mut().zip(volume) {
        *slot = Volume(*v);
    }
    cv
}

// ==================== Context ====================

pub fn context_state(state: PaState) -> ContextState {
    match state {
        PaState::Unconnected => ContextState::Unconnected,
        PaState::Connecting => ContextState::Connecting,
        PaState::Authorizing => ContextState::Authorizing,
        PaState::SettingName => ContextState::SettingName,
        PaState::Ready => ContextState::Ready,
        PaState::Failed => ContextState::Failed,
        PaState::Terminated => ContextState::Terminated,
    }
}

pub fn facility(facility: PaFacility) -> Option<Facility> {
    match facility {
        PaFacility::Sink => Some(Facility::Sink),
        PaFacility::Source => Some(Facility::Source),
        PaFacility::SinkInput => Some(Facility::SinkInput),
        PaFacility::SourceOutput => Some(Facility::SourceOutput),
        PaFacility::Client => Some(Facility::Client),
        PaFacility::Server => Some(Facility::Server),
        PaFacility::Card => Some(Facility::Card),
        _ => None,
    }
}

pub fn subscription_change(operation: PaOperation) -> SubscriptionChange {
    match operation {
        PaOperation::Removed => SubscriptionChange::Remove,
        PaOperation::New | PaOperation::Changed => SubscriptionChange::NewOrChange,
    }
}

// ==================== Introspection ====================

fn port_availability(available: PortAvailable) -> PortAvailability {
    match available {
        PortAvailable::Yes => PortAvailability::Yes,
        PortAvailable::No => PortAvailability::No,
        PortAvailable::Unknown => PortAvailability::Unknown,
    }
}

fn port(name: &Option<Cow<'_, str>>, description: &Option<Cow<'_, str>>, priority: u32, available: PortAvailable) -> PortInfo {
    PortInfo {
        name: text(name),
        description: text(description),
        priority,
        available: port_availability(available),
    }
}

pub fn server(info: &PaServerInfo<'_>) -> ServerInfo {
    ServerInfo {
        default_sink_name: info.default_sink_name.as_deref().map(str::to_string),
        default_source_name: info.default_source_name.as_deref().map(str::to_string),
    }
}

pub fn client(info: &PaClientInfo<'_>) -> ClientInfo {
    ClientInfo {
        index: info.index,
        name: text(&info.name),
    }
}

pub fn sink(info: &SinkInfo<'_>) -> EndpointInfo {
    EndpointInfo {
        index: info.index,
        name: text(&info.name),
        description: text(&info.description),
        card: info.card,
        channel_map: positions(&info.channel_map),
        volume: volumes(&info.volume),
        mute: info.mute,
        base_volume: info.base_volume.0,
        decibel_volume: info.flags.contains(SinkFlagSet::DECIBEL_VOLUME),
        ports: info
            .ports
            .iter()
            .map(|p| port(&p.name, &p.description, p.priority, p.available))
            .collect(),
        active_port: info
            .active_port
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .map(str::to_string),
        icon_name: info.proplist.get_str(properties::DEVICE_ICON_NAME),
        form_factor: info.proplist.get_str(properties::DEVICE_FORM_FACTOR),
        monitor_of_sink: None,
    }
}

pub fn source(info: &SourceInfo<'_>) -> EndpointInfo {
    EndpointInfo {
        index: info.index,
        name: text(&info.name),
        description: text(&info.description),
        card: info.card,
        channel_map: positions(&info.channel_map),
        volume: volumes(&info.volume),
        mute: info.mute,
        base_volume: info.base_volume.0,
        decibel_volume: info.flags.contains(SourceFlagSet::DECIBEL_VOLUME),
        ports: info
            .ports
            .iter()
            .map(|p| port(&p.name, &p.description, p.priority, p.available))
            .collect(),
        active_port: info
            .active_port
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .map(str::to_string),
        icon_name: info.proplist.get_str(properties::DEVICE_ICON_NAME),
        form_factor: info.proplist.get_str(properties::DEVICE_FORM_FACTOR),
        monitor_of_sink: info.monitor_of_sink,
    }
}

pub fn sink_input(info: &SinkInputInfo<'_>) -> AppStreamInfo {
    AppStreamInfo {
        index: info.index,
        name: text(&info.name),
        client: info.client,
        device: info.sink,
        channel_map: positions(&info.channel_map),
        volume: volumes(&info.volume),
        mute: info.mute,
        application_id: info.proplist.get_str(properties::APPLICATION_ID),
        icon_name: info.proplist.get_str(properties::APPLICATION_ICON_NAME),
        media_role: info.proplist.get_str(properties::MEDIA_ROLE),
    }
}

pub fn source_output(info: &SourceOutputInfo<'_>) -> AppStreamInfo {
    AppStreamInfo {
        index: info.index,
        name: text(&info.name),
        client: info.client,
        device: info.source,
        channel_map: positions(&info.channel_map),
        volume: volumes(&info.volume),
        mute: info.mute,
        application_id: info.proplist.get_str(properties::APPLICATION_ID),
        icon_name: info.proplist.get_str(properties::APPLICATION_ICON_NAME),
        media_role: info.proplist.get_str(properties::MEDIA_ROLE),
    }
}

fn card_profile(info: &PaCardProfileInfo<'_>) -> CardProfileInfo {
    CardProfileInfo {
        name: text(&info.name),
        description: text(&info.description),
        priority: info.priority,
        n_sinks: info.n_sinks,
        n_sources: info.n_sources,
    }
}

fn card_port(info: &PaCardPortInfo<'_>) -> CardPortInfo {
    CardPortInfo {
        name: text(&info.name),
        description: text(&info.description),
        priority: info.priority,
        available: port_availability(info.available),
        direction: if info.direction.contains(direction::FlagSet::INPUT) {
            PortDirection::Input
        } else {
            PortDirection::Output
        },
        profiles: info.profiles.iter().map(|p| text(&p.name)).collect(),
    }
}

pub fn card(info: &PaCardInfo<'_>) -> CardInfo {
    let name = text(&info.name);
    CardInfo {
        index: info.index,
        description: info
            .proplist
            .get_str(properties::DEVICE_DESCRIPTION)
            .unwrap_or_else(|| name.clone()),
        name,
        icon_name: info.proplist.get_str(properties::DEVICE_ICON_NAME),
        profiles: info.profiles.iter().map(card_profile).collect(),
        active_profile: info
            .active_profile
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .map(str::to_string),
        ports: info.ports.iter().map(card_port).collect(),
    }
}

// ==================== Stream restore ====================

/// Entries without a name cannot be addressed and are skipped.
pub fn restore_entry(info: &PaRestoreInfo<'_>) -> Option<RestoreEntry> {
    let name = info.name.as_deref()?;
    Some(RestoreEntry {
        name: name.to_string(),
        channel_map: positions(&info.channel_map),
        volume: volumes(&info.volume),
        device: info.device.as_deref().map(str::to_string),
        mute: info.mute,
    })
}

pub fn restore_info(entry: &RestoreEntry) -> PaRestoreInfo<'_> {
    PaRestoreInfo {
        name: Some(Cow::Borrowed(entry.name.as_str())),
        channel_map: channel_map(&entry.channel_map),
        volume: channel_volumes(&entry.volume),
        device: entry.device.as_deref().map(Cow::Borrowed),
        mute: entry.mute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_map_both_ways() {
        assert_eq!(position(Position::Lfe), ChannelPosition::Lfe);
        assert_eq!(position(Position::Aux5), ChannelPosition::Aux(5));
        assert_eq!(pa_position(ChannelPosition::Aux(31)), Position::Aux31);
        assert_eq!(position(Position::Invalid), ChannelPosition::Other);
        assert_eq!(pa_position(ChannelPosition::Aux(40)), Position::Invalid);
    }

    #[test]
    fn test_channel_map_keeps_layout() {
        let layout = [ChannelPosition::FrontLeft, ChannelPosition::FrontRight, ChannelPosition::Lfe];
        let map = channel_map(&layout);
        assert_eq!(map.len(), 3);
        assert_eq!(positions(&map), layout.to_vec());
    }

    #[test]
    fn test_channel_volumes_keep_values() {
        let cv = channel_volumes(&[0x10000, 0x8000]);
        assert_eq!(cv.len(), 2);
        assert_eq!(volumes(&cv), vec![0x10000, 0x8000]);
    }

    #[test]
    fn test_facilities() {
        assert_eq!(facility(PaFacility::Card), Some(Facility::Card));
        assert_eq!(facility(PaFacility::Module), None);
        assert_eq!(subscription_change(PaOperation::Removed), SubscriptionChange::Remove);
        assert_eq!(subscription_change(PaOperation::Changed), SubscriptionChange::NewOrChange);
    }

    #[test]
    fn test_context_states() {
        assert_eq!(context_state(PaState::Ready), ContextState::Ready);
        assert_eq!(context_state(PaState::Terminated), ContextState::Terminated);
    }

    #[test]
    fn test_restore_entry_round_trip() {
        let entry = RestoreEntry {
            name: "sink-input-by-media-role:event".into(),
            channel_map: vec![ChannelPosition::Mono],
            volume: vec![0x8000],
            device: Some("alsa_output.pci".into()),
            mute: true,
        };
        let info = restore_info(&entry);
        assert_eq!(restore_entry(&info), Some(entry));
    }
}
