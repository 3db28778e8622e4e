// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Ingestion of sound-server reports into the registries.

use super::{device_added, device_removed, volume_event, MixerControl, MixerEvent, MixerState};
use crate::card::{Card, CardId};
use crate::channel_volume::{ChannelPosition, VOLUME_NORM};
use crate::server::{
    AppStreamInfo, CardInfo, ClientInfo, ContextState, EndpointInfo, Facility, ListKind,
    OperationId, PortDirection, Request, RestoreEntry, ServerInfo, SubscriptionChange,
};
use crate::stream::{Stream, StreamId, StreamKind, StreamPort, EVENT_ROLE_RESTORE_NAME};
use crate::ui_device::{Direction, UIDevice};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Applications whose own capture streams are not shown.
const IGNORED_SOURCE_OUTPUT_APPS: &[&str] = &["org.gnome.VolumeControl", "org.PulseAudio.pavucontrol"];

const EVENT_ROLE_NAME: &str = "System Sounds";
const EVENT_ROLE_ICON: &str = "audio-x-generic";

impl MixerControl {
    // ==================== Connection ====================

    pub(super) fn on_context_state(&mut self, state: ContextState) {
        match state {
            ContextState::Unconnected
            | ContextState::Connecting
            | ContextState::Authorizing
            | ContextState::SettingName => {
                trace!("Context state: {:?}", state);
            }
            ContextState::Ready => self.on_context_ready(),
            ContextState::Failed | ContextState::Terminated => {
                if self.state == MixerState::Closed {
                    debug!("Context {:?} after close", state);
                    return;
                }
                self.on_connection_failed(Instant::now());
            }
        }
    }

    /// Issue the initial enumeration batch.
    fn on_context_ready(&mut self) {
        if self.state != MixerState::Connecting {
            debug!("Context ready while {}", self.state.as_str());
        }

        let mut batch = vec![
            Request::ServerInfo,
            Request::Cards(None),
            Request::Clients(None),
            Request::Sinks(None),
            Request::Sources(None),
            Request::SinkInputs(None),
            Request::SourceOutputs(None),
        ];
        if self.options.restore_event_role {
            batch.push(Request::StreamRestoreRead);
        }

        self.n_outstanding = 0;
        self.awaiting_restore = false;
        for request in batch {
            let is_restore = request == Request::StreamRestoreRead;
            match self.server.request(request.clone()) {
                Some(_) => {
                    self.n_outstanding += 1;
                    if is_restore {
                        self.awaiting_restore = true;
                        self.restore_reads += 1;
                    }
                }
                None => warn!("Failed to issue initial {:?}", request),
            }
        }
        debug!("Initial enumeration: {} requests outstanding", self.n_outstanding);

        if !self.awaiting_restore {
            self.ensure_event_role();
        }
        if self.n_outstanding == 0 {
            self.on_enumeration_done();
        }
    }

    fn dec_outstanding(&mut self) {
        if self.n_outstanding == 0 {
            return;
        }
        self.n_outstanding -= 1;
        if self.n_outstanding == 0 {
            self.on_enumeration_done();
        }
    }

    fn on_enumeration_done(&mut self) {
        let stale: Vec<u32> = self
            .stale_cards
            .iter()
            .filter_map(|id| self.cards.get(id).map(Card::index))
            .collect();
        for index in stale {
            debug!("Card {} did not come back after reconnect", index);
            self.remove_card(index);
        }
        self.stale_cards.clear();

        self.set_state(MixerState::Ready);
        if self.server.request(Request::Subscribe).is_none() {
            warn!("Failed to subscribe to sound server changes");
        }
    }

    pub(super) fn on_connection_failed(&mut self, now: Instant) {
        warn!("Connection to sound server lost");
        self.server.disconnect();
        self.n_outstanding = 0;
        self.awaiting_restore = false;
        self.restore_reads = 0;
        self.restore_retarget_sink = None;
        self.restore_retarget_source = None;
        self.profile_swapping_device_id = None;

        for registry in [
            StreamKind::Sink,
            StreamKind::Source,
            StreamKind::SinkInput { sink: 0 },
            StreamKind::SourceOutput { source: 0 },
        ] {
            let indices: Vec<u32> = self
                .registry(&registry)
                .map(|r| r.keys().copied().collect())
                .unwrap_or_default();
            for index in indices {
                self.remove_stream_by_index(&registry, index);
            }
        }
        self.clients.clear();

        if let Some(event_role) = self
            .event_sink_input_id
            .and_then(|id| self.all_streams.get_mut(&id))
        {
            event_role.forget_pending();
        }

        for (id, card) in self.cards.iter_mut() {
            card.forget_pending();
            self.stale_cards.insert(*id);
        }

        self.schedule_reconnect(now);
        self.set_state(MixerState::Failed);
    }

    pub(super) fn on_list_end(&mut self, kind: ListKind, success: bool) {
        if !success {
            warn!("Failed to list {:?}", kind);
        }
        if kind == ListKind::StreamRestore {
            self.on_restore_read_done();
            if !self.awaiting_restore {
                return;
            }
            self.awaiting_restore = false;
            self.ensure_event_role();
        }
        self.dec_outstanding();
    }

    fn on_restore_read_done(&mut self) {
        self.restore_reads = self.restore_reads.saturating_sub(1);
        if self.restore_reads == 0 {
            self.restore_retarget_sink = None;
            self.restore_retarget_source = None;
        }
    }

    pub(super) fn on_subscription(&mut self, facility: Facility, change: SubscriptionChange, index: u32) {
        trace!("Subscription: {:?} {:?} {}", facility, change, index);
        let remove = change == SubscriptionChange::Remove;
        let request = match facility {
            Facility::Sink if remove => {
                self.remove_stream_by_index(&StreamKind::Sink, index);
                return;
            }
            Facility::Source if remove => {
                self.remove_stream_by_index(&StreamKind::Source, index);
                return;
            }
            Facility::SinkInput if remove => {
                self.remove_stream_by_index(&StreamKind::SinkInput { sink: 0 }, index);
                return;
            }
            Facility::SourceOutput if remove => {
                self.remove_stream_by_index(&StreamKind::SourceOutput { source: 0 }, index);
                return;
            }
            Facility::Client if remove => {
                self.clients.remove(&index);
                return;
            }
            Facility::Card if remove => {
                self.remove_card(index);
                return;
            }
            Facility::Sink => Request::Sinks(Some(index)),
            Facility::Source => Request::Sources(Some(index)),
            Facility::SinkInput => Request::SinkInputs(Some(index)),
            Facility::SourceOutput => Request::SourceOutputs(Some(index)),
            Facility::Client => Request::Clients(Some(index)),
            Facility::Card => Request::Cards(Some(index)),
            Facility::Server => Request::ServerInfo,
        };
        if self.server.request(request.clone()).is_none() {
            warn!("Failed to issue {:?}", request);
        }
    }

    pub(super) fn on_operation_complete(&mut self, id: OperationId, success: bool) {
        for card in self.cards.values_mut() {
            if card.profile_change_finished(id, success) {
                return;
            }
        }
        for stream in self.all_streams.values_mut() {
            if stream.volume_push_finished(id, success) {
                return;
            }
        }
        if !success {
            warn!("Sound server operation {} failed", id);
        }
    }

    // ==================== Server and clients ====================

    pub(super) fn update_server(&mut self, info: &ServerInfo) {
        if let Some(name) = &info.default_source_name {
            self.update_default_from_name(Direction::Input, name);
        }
        if let Some(name) = &info.default_sink_name {
            self.update_default_from_name(Direction::Output, name);
        }
        self.dec_outstanding();
    }

    fn update_default_from_name(&mut self, direction: Direction, name: &str) {
        let current = match direction {
            Direction::Output => &self.default_sink.name,
            Direction::Input => &self.default_source.name,
        };
        if current.as_deref() == Some(name) {
            return;
        }
        debug!("Default {} is now '{}'", direction.as_str(), name);

        let registry = match direction {
            Direction::Output => &self.sinks,
            Direction::Input => &self.sources,
        };
        let stream = registry
            .values()
            .copied()
            .find(|id| self.all_streams.get(id).is_some_and(|s| s.name() == name));

        match direction {
            Direction::Output => self.default_sink.name = Some(name.to_string()),
            Direction::Input => self.default_source.name = Some(name.to_string()),
        }
        self.set_default_internal(direction, stream);
    }

    pub(super) fn update_client(&mut self, info: &ClientInfo) {
        trace!("Client {}: {}", info.index, info.name);
        self.clients.insert(info.index, info.name.clone());
    }

    // ==================== Sinks and sources ====================

    pub(super) fn update_sink(&mut self, info: &EndpointInfo) {
        self.update_endpoint(Direction::Output, info);
    }

    pub(super) fn update_source(&mut self, info: &EndpointInfo) {
        if info.monitor_of_sink.is_some() {
            trace!("Ignoring monitor source {}", info.name);
            return;
        }
        self.update_endpoint(Direction::Input, info);
    }

    fn update_endpoint(&mut self, direction: Direction, info: &EndpointInfo) {
        let (kind, existing) = match direction {
            Direction::Output => (StreamKind::Sink, self.sinks.get(&info.index).copied()),
            Direction::Input => (StreamKind::Source, self.sources.get(&info.index).copied()),
        };

        let (id, is_new) = match existing {
            Some(id) => {
                if self.all_streams.get(&id).is_some_and(Stream::is_running) {
                    debug!("Ignoring update of {}, volume change outstanding", id);
                    return;
                }
                (id, false)
            }
            None => {
                let id = self.next_stream_id();
                let stream = Stream::new(id, info.index, kind, &info.channel_map);
                self.all_streams.insert(id, stream);
                (id, true)
            }
        };

        let Some(stream) = self.all_streams.get_mut(&id) else {
            return;
        };
        stream.set_name(info.name.as_str());
        stream.set_description(info.description.as_str());
        stream.set_card_index(info.card);
        stream.set_icon_name(Some(
            info.icon_name.clone().unwrap_or_else(|| "audio-card".to_string()),
        ));
        stream.set_form_factor(info.form_factor.clone());
        stream.set_is_muted(info.mute);
        stream.set_can_decibel(info.decibel_volume);
        stream.set_base_volume(info.base_volume);
        stream.set_ports(
            info.ports
                .iter()
                .map(|p| StreamPort {
                    name: p.name.clone(),
                    human_name: p.description.clone(),
                    priority: p.priority,
                    available: p.available.is_available(),
                })
                .collect(),
        );

        let port_changed = match info.active_port.as_deref() {
            Some(port) => stream.set_port(Some(port)) && !is_new,
            None => false,
        };
        if port_changed {
            debug!("{} switched to port {:?}", id, info.active_port);
        }

        let change = stream.update_channels(&info.channel_map, &info.volume);

        if is_new {
            match direction {
                Direction::Output => self.sinks.insert(info.index, id),
                Direction::Input => self.sources.insert(info.index, id),
            };
            self.emit(MixerEvent::StreamAdded(id));
            self.sync_devices(id);
        }

        if port_changed {
            self.emit(MixerEvent::StreamPortChanged(id));
            self.on_default_port_changed(direction, id);
        }

        self.consume_profile_swap(direction, id);

        let default_name = match direction {
            Direction::Output => self.default_sink.name.as_deref(),
            Direction::Input => self.default_source.name.as_deref(),
        };
        if default_name == Some(info.name.as_str()) {
            self.set_default_internal(direction, Some(id));
        }

        if let Some(event) = volume_event(id, change) {
            self.emit(event);
        }
    }

    /// Re-assert the device the user switched profiles on as the default.
    fn consume_profile_swap(&mut self, direction: Direction, stream_id: StreamId) {
        let Some(device_id) = self.profile_swapping_device_id else {
            return;
        };
        if !self.devices(direction).contains_key(&device_id) {
            return;
        }
        self.profile_swapping_device_id = None;
        let matched = self
            .devices(direction)
            .get(&device_id)
            .is_some_and(|d| d.stream_id() == Some(stream_id));
        if !matched {
            trace!("Profile swap on {} did not produce {}", device_id, stream_id);
            return;
        }
        debug!("Profile swap on non-default {}, making {} the default", device_id, stream_id);
        if let Err(e) = self.set_default(direction, stream_id) {
            warn!("Failed to keep {} after profile swap: {}", device_id, e);
        }
    }

    // ==================== Application streams ====================

    pub(super) fn update_sink_input(&mut self, info: &AppStreamInfo) {
        self.update_app_stream(Direction::Output, info);
    }

    pub(super) fn update_source_output(&mut self, info: &AppStreamInfo) {
        if let Some(app_id) = info.application_id.as_deref() {
            if IGNORED_SOURCE_OUTPUT_APPS.contains(&app_id) {
                trace!("Ignoring source output of {}", app_id);
                return;
            }
        }
        self.update_app_stream(Direction::Input, info);
    }

    fn update_app_stream(&mut self, direction: Direction, info: &AppStreamInfo) {
        let (kind, existing) = match direction {
            Direction::Output => (
                StreamKind::SinkInput { sink: info.device },
                self.sink_inputs.get(&info.index).copied(),
            ),
            Direction::Input => (
                StreamKind::SourceOutput { source: info.device },
                self.source_outputs.get(&info.index).copied(),
            ),
        };

        let (id, is_new) = match existing {
            Some(id) => {
                if self.all_streams.get(&id).is_some_and(Stream::is_running) {
                    debug!("Ignoring update of {}, volume change outstanding", id);
                    return;
                }
                (id, false)
            }
            None => {
                let id = self.next_stream_id();
                let stream = Stream::new(id, info.index, kind.clone(), &info.channel_map);
                self.all_streams.insert(id, stream);
                (id, true)
            }
        };

        let client_name = info.client.and_then(|c| self.clients.get(&c)).cloned();
        let default_icon = match direction {
            Direction::Output => "applications-multimedia",
            Direction::Input => "audio-input-microphone",
        };

        let Some(stream) = self.all_streams.get_mut(&id) else {
            return;
        };
        stream.set_kind(kind);
        stream.set_name(client_name.unwrap_or_default());
        stream.set_description(info.name.as_str());
        stream.set_application_id(info.application_id.clone());
        stream.set_is_event_stream(info.media_role.as_deref() == Some("event"));
        stream.set_icon_name(Some(
            info.icon_name.clone().unwrap_or_else(|| default_icon.to_string()),
        ));
        stream.set_is_muted(info.mute);
        stream.set_is_virtual(info.client.is_none());
        let change = stream.update_channels(&info.channel_map, &info.volume);

        if is_new {
            match direction {
                Direction::Output => self.sink_inputs.insert(info.index, id),
                Direction::Input => self.source_outputs.insert(info.index, id),
            };
            self.emit(MixerEvent::StreamAdded(id));
        } else if let Some(event) = volume_event(id, change) {
            self.emit(event);
        }
    }

    // ==================== Stream restore ====================

    pub(super) fn update_restore_entry(&mut self, mut entry: RestoreEntry) {
        let retarget = if entry.name.starts_with("sink-input-by-") {
            self.restore_retarget_sink.clone()
        } else if entry.name.starts_with("source-output-by-") {
            self.restore_retarget_source.clone()
        } else {
            None
        };

        if let Some(device) = retarget {
            if entry.device.as_deref() != Some(device.as_str()) {
                debug!("Moving restored route '{}' to '{}'", entry.name, device);
                entry.device = Some(device);
                if self
                    .server
                    .request(Request::StreamRestoreWrite(entry.clone()))
                    .is_none()
                {
                    warn!("Failed to rewrite stream-restore entry '{}'", entry.name);
                }
            }
        }

        if entry.name == EVENT_ROLE_RESTORE_NAME {
            self.update_event_role(&entry);
        }
    }

    fn update_event_role(&mut self, entry: &RestoreEntry) {
        let existing = self.event_sink_input_id.filter(|id| self.all_streams.contains_key(id));
        let kind = StreamKind::EventRole {
            device: entry.device.clone(),
        };

        let (id, is_new) = match existing {
            Some(id) => {
                if self.all_streams.get(&id).is_some_and(Stream::is_running) {
                    debug!("Ignoring event role update, volume change outstanding");
                    return;
                }
                (id, false)
            }
            None => {
                let id = self.next_stream_id();
                let stream = Stream::new(id, u32::MAX, kind.clone(), &entry.channel_map);
                self.all_streams.insert(id, stream);
                self.event_sink_input_id = Some(id);
                (id, true)
            }
        };

        let Some(stream) = self.all_streams.get_mut(&id) else {
            return;
        };
        stream.set_kind(kind);
        stream.set_name(EVENT_ROLE_NAME);
        stream.set_icon_name(Some(EVENT_ROLE_ICON.to_string()));
        stream.set_is_muted(entry.mute);
        let change = stream.update_channels(&entry.channel_map, &entry.volume);

        if is_new {
            info!("Created system sounds stream {}", id);
            self.emit(MixerEvent::StreamAdded(id));
        } else if let Some(event) = volume_event(id, change) {
            self.emit(event);
        }
    }

    /// Create the system sounds stream at full volume if the store had none.
    fn ensure_event_role(&mut self) {
        if self
            .event_sink_input_id
            .is_some_and(|id| self.all_streams.contains_key(&id))
        {
            return;
        }
        self.update_event_role(&RestoreEntry {
            name: EVENT_ROLE_RESTORE_NAME.to_string(),
            channel_map: vec![ChannelPosition::Mono],
            volume: vec![VOLUME_NORM],
            device: None,
            mute: false,
        });
    }

    // ==================== Cards ====================

    pub(super) fn update_card(&mut self, info: &CardInfo) {
        if let Some(id) = self.card_indices.get(&info.index).copied() {
            self.refresh_card(id, info);
            return;
        }

        let stale = self
            .stale_cards
            .iter()
            .copied()
            .find(|id| self.cards.get(id).is_some_and(|c| c.name() == info.name));
        if let Some(id) = stale {
            if let Some(card) = self.cards.get_mut(&id) {
                debug!(
                    "Card '{}' is back as index {} (was {})",
                    info.name,
                    info.index,
                    card.index()
                );
                self.card_indices.remove(&card.index());
                card.set_index(info.index);
            }
            self.stale_cards.remove(&id);
            self.card_indices.insert(info.index, id);
            self.refresh_card(id, info);
            return;
        }

        let id = self.next_card_id();
        let card = Card::from_info(id, info);
        debug!(
            "New card {} '{}' with {} profiles and {} ports",
            info.index,
            card.name(),
            card.profiles().len(),
            card.ports().len()
        );

        let mut devices = Vec::new();
        if card.ports().is_empty() {
            debug!("Portless card {} registered", info.index);
            for direction in [Direction::Output, Direction::Input] {
                let device_id = self.next_device_id();
                devices.push((UIDevice::from_card(device_id, &card, direction), false));
            }
        } else {
            for port in card.ports() {
                let direction = port_direction(port.direction);
                let device_id = self.next_device_id();
                let device = UIDevice::from_port(device_id, &card, port, direction);
                let announce = device.port_available();
                devices.push((device, announce));
            }
        }

        self.cards.insert(id, card);
        self.card_indices.insert(info.index, id);

        for (device, announce) in devices {
            let direction = device.direction();
            let device_id = device.id();
            self.devices_mut(direction).insert(device_id, device);
            if announce {
                self.emit(device_added(direction, device_id));
            }
        }
        self.emit(MixerEvent::CardAdded(info.index));
    }

    fn refresh_card(&mut self, id: CardId, info: &CardInfo) {
        let Some(card) = self.cards.get_mut(&id) else {
            return;
        };
        card.set_metadata(info);
        if let Some(active) = &info.active_profile {
            if let Err(e) = card.set_profile(active) {
                warn!("{}", e);
            }
        }
        let changes = card.update_port_availability(info);
        for change in changes {
            self.match_card_port_with_existing_device(
                id,
                &change.port,
                port_direction(change.direction),
                change.available,
            );
        }
    }

    pub(super) fn remove_card(&mut self, index: u32) {
        let Some(card_id) = self.card_indices.remove(&index) else {
            trace!("Removal of unknown card {}", index);
            return;
        };

        for direction in [Direction::Input, Direction::Output] {
            let doomed: Vec<_> = self
                .devices(direction)
                .values()
                .filter(|d| d.card() == Some(card_id))
                .map(UIDevice::id)
                .collect();
            for device_id in doomed {
                self.emit(device_removed(direction, device_id));
                if let Some(device) = self.devices_mut(direction).remove(&device_id) {
                    debug!("Card removal removed device '{}'", device.description());
                }
            }
        }

        self.cards.remove(&card_id);
        self.stale_cards.remove(&card_id);
        info!("Card {} removed", index);
        self.emit(MixerEvent::CardRemoved(index));
    }

    // ==================== Removal ====================

    pub(super) fn remove_stream_by_index(&mut self, kind: &StreamKind, index: u32) {
        let removed = match kind {
            StreamKind::Sink => self.sinks.remove(&index),
            StreamKind::Source => self.sources.remove(&index),
            StreamKind::SinkInput { .. } => self.sink_inputs.remove(&index),
            StreamKind::SourceOutput { .. } => self.source_outputs.remove(&index),
            StreamKind::EventRole { .. } => None,
        };
        match removed {
            Some(id) => self.remove_stream(id),
            None => trace!("Removal of unknown {:?} {}", kind, index),
        }
    }

    fn remove_stream(&mut self, id: StreamId) {
        let Some(stream) = self.all_streams.get(&id) else {
            return;
        };
        let direction = match stream.kind() {
            StreamKind::Sink => Some(Direction::Output),
            StreamKind::Source => Some(Direction::Input),
            _ => None,
        };

        if let Some(direction) = direction {
            if self.default_endpoint(direction).id == Some(id) {
                self.set_default_internal(direction, None);
            }

            let mut removed = Vec::new();
            for device in self.devices_mut(direction).values_mut() {
                if device.stream_id() == Some(id) {
                    device.invalidate_stream();
                    if !device.has_ports() {
                        removed.push(device.id());
                    }
                }
            }
            for device_id in removed {
                self.emit(device_removed(direction, device_id));
            }
        }

        self.all_streams.remove(&id);
        if self.event_sink_input_id == Some(id) {
            self.event_sink_input_id = None;
        }
        debug!("Removed {}", id);
        self.emit(MixerEvent::StreamRemoved(id));
    }
}

fn port_direction(direction: PortDirection) -> Direction {
    match direction {
        PortDirection::Output => Direction::Output,
        PortDirection::Input => Direction::Input,
    }
}
