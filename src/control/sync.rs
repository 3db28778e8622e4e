// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Matching streams and card ports to UI devices.

use super::{active_update, device_added, device_removed, MixerControl, MixerEvent};
use crate::card::CardId;
use crate::stream::{StreamId, StreamKind};
use crate::ui_device::{DeviceId, Direction, UIDevice};
use tracing::{debug, trace, warn};

impl MixerControl {
    /// Wire a newly reported sink or source to the devices it realizes.
    pub(super) fn sync_devices(&mut self, stream_id: StreamId) {
        let Some(stream) = self.all_streams.get(&stream_id) else {
            return;
        };
        let direction = match stream.kind() {
            StreamKind::Sink => Direction::Output,
            StreamKind::Source => Direction::Input,
            _ => return,
        };
        let card_id = stream
            .card_index()
            .and_then(|index| self.card_indices.get(&index).copied());

        if !stream.ports().is_empty() {
            let Some(card_id) = card_id else {
                warn!(
                    "{} '{}' has ports but no known card {:?}",
                    stream_id,
                    stream.name(),
                    stream.card_index()
                );
                return;
            };
            let ports: Vec<String> = stream.ports().iter().map(|p| p.name.clone()).collect();
            for port in ports {
                let matched = self
                    .devices_mut(direction)
                    .values_mut()
                    .find(|d| d.card() == Some(card_id) && d.port_name() == Some(port.as_str()));
                match matched {
                    Some(device) => {
                        trace!("{} port '{}' is {}", stream_id, port, device.id());
                        device.set_stream(stream_id);
                    }
                    None => warn!(
                        "No {} device for port '{}' on {}",
                        direction.as_str(),
                        port,
                        card_id
                    ),
                }
            }
            return;
        }

        let description = stream.description().to_string();

        if let Some(card_id) = card_id {
            // Bluetooth-style: the card already created a portless device.
            let matched = self
                .devices_mut(direction)
                .values_mut()
                .find(|d| d.card() == Some(card_id) && !d.has_ports());
            let Some(device) = matched else {
                warn!(
                    "No portless {} device for {} on {}",
                    direction.as_str(),
                    stream_id,
                    card_id
                );
                return;
            };
            let announce = device.stream_id().is_none();
            device.set_stream(stream_id);
            device.set_description(description);
            device.set_port_available(true);
            let device_id = device.id();
            debug!("Matched {} with portless {}", stream_id, device_id);
            if announce {
                self.emit(device_added(direction, device_id));
            }
            return;
        }

        // Network endpoint. Revive a device left over from a reconnect.
        let revived = self
            .devices_mut(direction)
            .values_mut()
            .find(|d| {
                d.card().is_none()
                    && !d.has_ports()
                    && d.stream_id().is_none()
                    && d.description() == description
            })
            .map(|device| {
                device.set_stream(stream_id);
                device.id()
            });
        if let Some(device_id) = revived {
            debug!("Network {} is back as {}", device_id, stream_id);
            self.emit(device_added(direction, device_id));
            return;
        }

        let device_id = self.next_device_id();
        let mut device = UIDevice::new(device_id, direction);
        device.set_stream(stream_id);
        device.set_description(description);
        device.set_origin(Some(String::new()));
        device.set_icon_name(
            self.all_streams
                .get(&stream_id)
                .and_then(|s| s.icon_name())
                .map(str::to_string),
        );
        debug!("Created network {} for {}", device_id, stream_id);
        self.devices_mut(direction).insert(device_id, device);
        self.emit(device_added(direction, device_id));
    }

    /// Toggle the visibility of the device for a card port whose
    /// availability flipped.
    pub(super) fn match_card_port_with_existing_device(
        &mut self,
        card_id: CardId,
        port: &str,
        direction: Direction,
        available: bool,
    ) {
        let matched = self
            .devices_mut(direction)
            .values_mut()
            .find(|d| d.card() == Some(card_id) && d.port_name() == Some(port));
        let Some(device) = matched else {
            warn!("No device for port '{}' on {}", port, card_id);
            return;
        };
        device.set_port_available(available);
        let device_id = device.id();
        debug!(
            "Port '{}' on {} is now {}",
            port,
            card_id,
            if available { "available" } else { "unavailable" }
        );
        if available {
            self.emit(device_added(direction, device_id));
        } else {
            self.emit(device_removed(direction, device_id));
        }
    }

    /// The device currently realized by a sink or source.
    ///
    /// Portless streams match on the stream alone; ported streams also need
    /// the device's port to be the stream's active port.
    pub fn lookup_device_from_stream(&self, stream_id: StreamId) -> Option<&UIDevice> {
        let stream = self.all_streams.get(&stream_id)?;
        let direction = match stream.kind() {
            StreamKind::Sink => Direction::Output,
            StreamKind::Source => Direction::Input,
            _ => return None,
        };
        let is_portless = stream.ports().is_empty();
        let device = self.devices(direction).values().find(|d| {
            d.stream_id() == Some(stream_id) && (is_portless || d.port_name() == stream.port())
        });
        if device.is_none() {
            trace!("No device realizes {}", stream_id);
        }
        device
    }

    /// Record the server's default endpoint and report it.
    pub(super) fn set_default_internal(&mut self, direction: Direction, stream: Option<StreamId>) {
        let endpoint = match direction {
            Direction::Output => &mut self.default_sink,
            Direction::Input => &mut self.default_source,
        };

        let Some(new_id) = stream else {
            if endpoint.id.is_none() {
                return;
            }
            endpoint.id = None;
            endpoint.port_watch = None;
            debug!("Default {} unset", direction.as_str());
            self.emit(default_changed(direction, None));
            return;
        };

        if endpoint.id == Some(new_id) {
            return;
        }
        if let Some(old) = endpoint.port_watch.take() {
            trace!("Stopped watching port of {}", old);
        }
        endpoint.id = Some(new_id);
        endpoint.port_watch = Some(new_id);
        debug!("Default {} is {}", direction.as_str(), new_id);
        self.emit(default_changed(direction, Some(new_id)));

        if let Some(device) = self.lookup_device_from_stream(new_id) {
            self.emit(active_update(direction, device.id()));
        }
    }

    /// A stream changed its port; report the device now active if it is
    /// the watched default.
    pub(super) fn on_default_port_changed(&mut self, direction: Direction, stream_id: StreamId) {
        if self.default_endpoint(direction).port_watch != Some(stream_id) {
            return;
        }
        let device: Option<DeviceId> = self.lookup_device_from_stream(stream_id).map(UIDevice::id);
        match device {
            Some(device_id) => {
                debug!("Default {} moved to port of {}", stream_id, device_id);
                self.emit(active_update(direction, device_id));
            }
            None => trace!("Default {} moved to a port without device", stream_id),
        }
    }
}

fn default_changed(direction: Direction, id: Option<StreamId>) -> MixerEvent {
    match direction {
        Direction::Output => MixerEvent::DefaultSinkChanged(id),
        Direction::Input => MixerEvent::DefaultSourceChanged(id),
    }
}
